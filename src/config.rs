use crate::services::{
    metrics_ledger::DEFAULT_LOCK_PATH,
    transform::{SecretKey, TransformError},
};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/walvault/walvault.yaml";
const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_BACKUP_INTERVAL_HOURS: u64 = 7 * 24;
const DEFAULT_BASEBACKUP_PROGRAM: &str = "pg_basebackup";
const DEFAULT_BASEBACKUP_MAX_RATE: &str = "1024M";

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Continuous WAL archiving and base backups to object storage"
)]
pub struct Args {
    /// YAML configuration file (defaults to /etc/walvault/walvault.yaml when present)
    #[arg(short = 'c', long, env = "WALVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,

    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// Endpoint of an S3-compatible store
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub aws_endpoint_url: Option<String>,

    #[arg(long)]
    pub bucket: Option<String>,

    /// Prefix shared by every database stored in the bucket
    #[arg(long)]
    pub storage_prefix: Option<String>,

    /// Pre-shared key; its raw bytes must be 16, 24 or 32 long
    #[arg(long)]
    pub encryption_key: Option<String>,

    /// Store objects in this directory instead of S3
    #[arg(long)]
    pub local_storage_dir: Option<String>,

    /// Identifier unique across databases sharing bucket and prefix
    #[arg(long)]
    pub database_id: Option<String>,

    #[arg(long)]
    pub database_host: Option<String>,

    #[arg(long)]
    pub database_port: Option<u16>,

    #[arg(long)]
    pub database_name: Option<String>,

    #[arg(long)]
    pub database_user: Option<String>,

    #[arg(long)]
    pub database_password: Option<String>,

    #[arg(long, env = "PGDATA")]
    pub database_data_dir: Option<String>,

    /// Lock file guarding the metrics ledger
    #[arg(long)]
    pub metrics_lock_path: Option<String>,

    /// Minimum age of the newest backup before a scheduled backup runs
    #[arg(long)]
    pub backup_interval_hours: Option<u64>,

    #[arg(long)]
    pub basebackup_program: Option<String>,

    /// Transfer rate limit handed to the backup tool
    #[arg(long)]
    pub basebackup_max_rate: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Archive a WAL segment.
    ArchivePut {
        /// WAL segment to put into the archive
        path: PathBuf,
    },
    /// Retrieve a WAL segment.
    ArchiveGet {
        /// Location to restore the WAL segment to
        dst_path: PathBuf,
        /// WAL segment to get from the archive
        filename: String,
    },
    /// Take a base backup.
    Backup {
        /// Skip the backup if the newest one is younger than the interval
        #[arg(long)]
        scheduled: bool,
    },
    /// Restore the closest base backup into the data directory.
    Restore {
        /// Don't fail if no backup is available
        #[arg(long = "try")]
        best_effort: bool,
        /// Copy this PostgreSQL configuration file into the data directory
        #[arg(long)]
        copy_pg_conf: Option<PathBuf>,
        /// Newest acceptable backup time (RFC 3339 or YYYY-MM-DDThh-mm-ssZ), default now
        #[arg(long)]
        target_time: Option<String>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ArchivePut { .. } => "archive-put",
            Command::ArchiveGet { .. } => "archive-get",
            Command::Backup { .. } => "backup",
            Command::Restore { .. } => "restore",
        }
    }
}

/// Optional YAML configuration file. Keys mirror the long CLI options.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub bucket: Option<String>,
    pub storage_prefix: Option<String>,
    pub encryption_key: Option<String>,
    pub local_storage_dir: Option<String>,
    pub metrics_lock_path: Option<String>,
    pub backup_interval_hours: Option<u64>,
    pub basebackup_program: Option<String>,
    pub basebackup_max_rate: Option<String>,
    #[serde(default)]
    pub database: FileDatabase,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileDatabase {
    pub id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub data_dir: Option<String>,
}

impl FileConfig {
    /// Read `path`, or the default location when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading config file `{}`", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file `{}`", path.display()))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "please provide all AWS credentials (access key ID, secret access key and region)"
    )]
    MissingAwsCredentials,
    #[error("please provide the name of the destination bucket")]
    MissingBucket,
    #[error("please provide an encryption key for backup encryption")]
    MissingEncryptionKey,
    #[error("invalid encryption key: {0}")]
    InvalidEncryptionKey(#[source] TransformError),
    #[error(
        "please provide a database ID; it must be unique across all databases \
         using the same bucket and storage prefix"
    )]
    MissingDatabaseId,
    #[error("please provide all database connection parameters (host, name, user and password)")]
    MissingConnection,
    #[error("please provide the database data directory")]
    MissingDataDir,
    #[error("unrecognised time `{0}`; use RFC 3339 or YYYY-MM-DDThh-mm-ssZ")]
    InvalidTime(String),
}

/// Connection to an S3 (or compatible) bucket.
#[derive(Clone)]
pub struct S3Settings {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub bucket: String,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("bucket", &self.bucket)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum Backend {
    S3(S3Settings),
    Local { root: PathBuf },
}

/// Database connection parameters, used only to run the backup tool.
#[derive(Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Fully resolved configuration, passed by reference to every operation.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend: Backend,
    pub storage_prefix: String,
    pub encryption_key: SecretKey,
    pub database_id: String,
    pub database: DatabaseSettings,
    pub data_dir: PathBuf,
    pub metrics_lock_path: PathBuf,
    pub backup_interval: TimeDelta,
    pub basebackup_program: String,
    pub basebackup_max_rate: String,
}

impl AppConfig {
    /// Merge CLI/env over the config file over defaults, resolve secrets and
    /// validate everything `command` needs.
    pub fn load(args: &Args) -> Result<Self> {
        let file = FileConfig::load(args.config.as_deref())?;
        Self::resolve(args, &file)
    }

    pub fn resolve(args: &Args, file: &FileConfig) -> Result<Self> {
        let db = &file.database;

        let local_storage_dir = setting(&args.local_storage_dir, &file.local_storage_dir)?;
        let backend = if local_storage_dir.is_empty() {
            let access_key_id = setting(&args.aws_access_key_id, &file.aws_access_key_id)?;
            let secret_access_key =
                setting(&args.aws_secret_access_key, &file.aws_secret_access_key)?;
            let region = setting(&args.aws_region, &file.aws_region)?;
            if access_key_id.is_empty() || secret_access_key.is_empty() || region.is_empty() {
                return Err(ConfigError::MissingAwsCredentials.into());
            }
            let bucket = setting(&args.bucket, &file.bucket)?;
            if bucket.is_empty() {
                return Err(ConfigError::MissingBucket.into());
            }
            let endpoint_url = setting(&args.aws_endpoint_url, &file.aws_endpoint_url)?;
            Backend::S3(S3Settings {
                access_key_id,
                secret_access_key,
                region,
                endpoint_url: Some(endpoint_url).filter(|url| !url.is_empty()),
                bucket,
            })
        } else {
            Backend::Local {
                root: PathBuf::from(local_storage_dir),
            }
        };

        let encryption_key = setting(&args.encryption_key, &file.encryption_key)?;
        if encryption_key.is_empty() {
            return Err(ConfigError::MissingEncryptionKey.into());
        }
        let encryption_key = SecretKey::new(encryption_key.into_bytes())
            .map_err(ConfigError::InvalidEncryptionKey)?;

        let database_id = setting(&args.database_id, &db.id)?;
        if database_id.is_empty() {
            return Err(ConfigError::MissingDatabaseId.into());
        }

        let database = DatabaseSettings {
            host: setting_or(&args.database_host, &db.host, DEFAULT_DB_HOST)?,
            port: args.database_port.or(db.port).unwrap_or(DEFAULT_DB_PORT),
            name: setting(&args.database_name, &db.name)?,
            user: setting(&args.database_user, &db.user)?,
            password: setting(&args.database_password, &db.password)?,
        };
        if matches!(args.command, Command::Backup { .. })
            && (database.host.is_empty()
                || database.name.is_empty()
                || database.user.is_empty()
                || database.password.is_empty())
        {
            return Err(ConfigError::MissingConnection.into());
        }

        let data_dir = setting(&args.database_data_dir, &db.data_dir)?;
        if data_dir.is_empty() {
            return Err(ConfigError::MissingDataDir.into());
        }

        let interval_hours = args
            .backup_interval_hours
            .or(file.backup_interval_hours)
            .unwrap_or(DEFAULT_BACKUP_INTERVAL_HOURS);

        Ok(Self {
            backend,
            storage_prefix: setting(&args.storage_prefix, &file.storage_prefix)?,
            encryption_key,
            database_id,
            database,
            data_dir: PathBuf::from(data_dir),
            metrics_lock_path: PathBuf::from(setting_or(
                &args.metrics_lock_path,
                &file.metrics_lock_path,
                DEFAULT_LOCK_PATH,
            )?),
            backup_interval: i64::try_from(interval_hours)
                .ok()
                .and_then(TimeDelta::try_hours)
                .unwrap_or(TimeDelta::MAX),
            basebackup_program: setting_or(
                &args.basebackup_program,
                &file.basebackup_program,
                DEFAULT_BASEBACKUP_PROGRAM,
            )?,
            basebackup_max_rate: setting_or(
                &args.basebackup_max_rate,
                &file.basebackup_max_rate,
                DEFAULT_BASEBACKUP_MAX_RATE,
            )?,
        })
    }
}

/// CLI value, else file value, else empty; secrets resolved.
fn setting(cli: &Option<String>, file: &Option<String>) -> Result<String> {
    match cli.as_ref().or(file.as_ref()) {
        Some(value) => read_secret(value),
        None => Ok(String::new()),
    }
}

fn setting_or(cli: &Option<String>, file: &Option<String>, default: &str) -> Result<String> {
    let value = setting(cli, file)?;
    Ok(if value.is_empty() {
        default.to_string()
    } else {
        value
    })
}

/// Resolve `file:<path>` and `env:<NAME>` references. Applied twice so a
/// file may name an environment variable and vice versa.
pub fn read_secret(value: &str) -> Result<String> {
    let once = deref_secret(value)?;
    deref_secret(&once)
}

fn deref_secret(value: &str) -> Result<String> {
    if let Some(path) = value.strip_prefix("file:") {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to open secret file `{}`", path))?;
        Ok(contents.trim().to_string())
    } else if let Some(name) = value.strip_prefix("env:") {
        Ok(env::var(name).unwrap_or_default())
    } else {
        Ok(value.to_string())
    }
}

/// Parse a recovery target given as RFC 3339 or in the backup name format.
pub fn parse_target_time(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .or_else(|_| crate::models::catalog::parse_backup_time(value))
        .map_err(|_| ConfigError::InvalidTime(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "walvault",
            "--local-storage-dir",
            "/srv/objects",
            "--encryption-key",
            "0123456789abcdef",
            "--database-id",
            "db1",
            "--database-data-dir",
            "/var/lib/postgresql/data",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn local_backend_needs_no_aws_credentials() {
        let args = parse(&["archive-put", "/tmp/seg"]);
        let cfg = AppConfig::resolve(&args, &FileConfig::default()).unwrap();
        assert!(matches!(cfg.backend, Backend::Local { ref root } if root == Path::new("/srv/objects")));
        assert_eq!(cfg.database.host, "localhost");
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.backup_interval, TimeDelta::hours(168));
        assert_eq!(cfg.basebackup_program, "pg_basebackup");
    }

    #[test]
    fn backup_requires_connection_parameters() {
        let args = parse(&["backup", "--scheduled"]);
        let err = AppConfig::resolve(&args, &FileConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingConnection)
        ));
    }

    #[test]
    fn short_key_is_rejected() {
        let args = Args::try_parse_from([
            "walvault",
            "--local-storage-dir",
            "/srv/objects",
            "--encryption-key",
            "too-short",
            "--database-id",
            "db1",
            "archive-get",
            "/tmp/out",
            "seg",
        ])
        .unwrap();
        let err = AppConfig::resolve(&args, &FileConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidEncryptionKey(_))
        ));
    }

    #[test]
    fn file_values_fill_gaps_and_cli_wins() {
        let yaml = r#"
storage-prefix: pg
database:
  id: from-file
  name: app
  user: replicator
  password: secret
"#;
        let file: FileConfig = serde_yaml::from_str(yaml).unwrap();
        let args = parse(&["backup"]);
        let cfg = AppConfig::resolve(&args, &file).unwrap();
        assert_eq!(cfg.storage_prefix, "pg");
        assert_eq!(cfg.database_id, "db1");
        assert_eq!(cfg.database.name, "app");
    }

    #[test]
    fn secrets_resolve_through_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");
        fs::write(&path, "0123456789abcdef\n").unwrap();
        let reference = format!("file:{}", path.display());
        assert_eq!(read_secret(&reference).unwrap(), "0123456789abcdef");
        assert_eq!(read_secret("plain").unwrap(), "plain");
        assert!(read_secret("file:/nonexistent/walvault/secret").is_err());
    }

    #[test]
    fn target_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_target_time("2024-06-01T00-00-00Z").unwrap(), expected);
        assert_eq!(parse_target_time("2024-06-01T02:00:00+02:00").unwrap(), expected);
        assert!(parse_target_time("yesterday").is_err());
    }
}
