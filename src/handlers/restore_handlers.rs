//! Point-in-time restore: pick the newest backup not after the target,
//! stream it into the data directory and leave a `recovery.signal` so the
//! database replays archived WAL on startup.

use super::{AppState, Outcome, start_download};
use crate::{
    errors::{AppError, AppResult},
    models::{
        catalog::format_backup_time,
        metric::{Metric, OpCode},
        object::{ObjectKind, base_name},
    },
    services::{catalog_service::closest_before, materializer::spawn_materialize},
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

const RECOVERY_SIGNAL: &str = "recovery.signal";

#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// A missing backup is not an error.
    pub best_effort: bool,
    /// Configuration file copied into the data directory after extraction.
    pub copy_pg_conf: Option<PathBuf>,
    /// Defaults to now.
    pub target_time: Option<DateTime<Utc>>,
}

pub async fn restore(state: &AppState, options: RestoreOptions) -> AppResult<Outcome> {
    let data_dir = state.config.data_dir.clone();
    info!(data_dir = %data_dir.display(), "starting restore");
    let start = Utc::now();
    let target = options.target_time.unwrap_or(start);

    let prefix = state.layout.prefix(ObjectKind::Backups);
    let Some(backup) = closest_before(state.store.as_ref(), &prefix, target).await? else {
        if options.best_effort {
            info!(prefix = %prefix, "no backups found, not restoring");
            return Ok(Outcome::Skipped {
                reason: "no backup available".to_string(),
            });
        }
        return Err(AppError::NoBackupFound {
            prefix,
            target: format_backup_time(target),
        });
    };
    info!(
        target = %format_backup_time(target),
        backup_key = %backup.key,
        "restoring backup"
    );

    fs::create_dir_all(&data_dir)
        .await
        .map_err(AppError::io(format!("failed to create `{}`", data_dir.display())))?;

    let (plaintext, download) = start_download(state, &backup.key)?;
    let extracted = match spawn_materialize(plaintext, data_dir.clone()).await {
        Ok(Ok(summary)) => {
            info!(
                directories = summary.directories,
                files = summary.files,
                bytes = summary.bytes,
                "backup extracted"
            );
            Ok(())
        }
        Ok(Err(err)) => Err(AppError::from(err)),
        Err(_) => Err(AppError::Task("materialize")),
    };
    let bytes = download.finish(extracted).await?;

    if let Some(conf) = &options.copy_pg_conf {
        copy_conf(conf, &data_dir).await?;
    }
    let signal = data_dir.join(RECOVERY_SIGNAL);
    fs::File::create(&signal)
        .await
        .map_err(AppError::io(format!("failed to create `{}`", signal.display())))?;

    let subject = base_name(&backup.key).to_string();
    state
        .ledger
        .record(Metric::finished(OpCode::Restore, subject.clone(), start, bytes))
        .await;
    info!(backup_key = %backup.key, bytes, "finished restore");
    Ok(Outcome::Completed { subject, bytes })
}

/// Copy `conf` into `data_dir` under its own file name.
async fn copy_conf(conf: &Path, data_dir: &Path) -> AppResult<()> {
    let name = conf.file_name().ok_or_else(|| AppError::Io {
        context: format!("`{}` does not name a file", conf.display()),
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    let destination = data_dir.join(name);
    fs::copy(conf, &destination).await.map_err(AppError::io(format!(
        "failed to copy `{}` to `{}`",
        conf.display(),
        destination.display()
    )))?;
    info!(destination = %destination.display(), "copied configuration file");
    Ok(())
}
