//! The database's native base backup tool, run as a subprocess.
//!
//! The tool writes a tar stream of the data directory to stdout, which is
//! fed straight into the write path. Its stderr is collected in the
//! background and surfaced verbatim when it exits non-zero.

use crate::config::DatabaseSettings;
use std::{io, process::Stdio};
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum BaseBackupError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait on backup tool: {0}")]
    Wait(#[source] io::Error),
    #[error("backup tool exited with {}: {stderr}", exit_description(.code))]
    Failed { code: Option<i32>, stderr: String },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// How to invoke the backup tool.
#[derive(Clone, Debug)]
pub struct BaseBackupCommand {
    pub program: String,
    pub max_rate: String,
    pub database: DatabaseSettings,
}

/// A running backup tool whose stdout has been handed out.
pub struct BackupProcess {
    child: Child,
    stderr: JoinHandle<String>,
}

impl BaseBackupCommand {
    /// Connection URL without the password; the password travels in
    /// `PGPASSWORD` so it never shows up in the process list.
    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.database.user, self.database.host, self.database.port, self.database.name
        )
    }

    /// Tar format to stdout, no WAL (it is archived separately), rate-limited.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-d".into(),
            self.connection_url(),
            "-D-".into(),
            "-Ft".into(),
            "-Xnone".into(),
            "-r".into(),
            self.max_rate.clone(),
        ]
    }

    /// Start the tool. The child is killed if the returned process handle is
    /// dropped before it exits.
    pub fn spawn(&self) -> Result<(ChildStdout, BackupProcess), BaseBackupError> {
        let spawn_error = |source| BaseBackupError::Spawn {
            program: self.program.clone(),
            source,
        };
        let mut child = Command::new(&self.program)
            .args(self.args())
            .env("PGPASSWORD", &self.database.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        debug!(program = %self.program, pid = ?child.id(), "backup tool started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stdout not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("stderr not captured")))?;
        let stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        Ok((stdout, BackupProcess { child, stderr }))
    }
}

impl BackupProcess {
    /// Wait for exit; a non-zero status carries the tool's stderr.
    pub async fn wait(mut self) -> Result<(), BaseBackupError> {
        let status = self.child.wait().await.map_err(BaseBackupError::Wait)?;
        let stderr = self.stderr.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(BaseBackupError::Failed {
                code: status.code(),
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> BaseBackupCommand {
        BaseBackupCommand {
            program: "pg_basebackup".into(),
            max_rate: "1024M".into(),
            database: DatabaseSettings {
                host: "db.internal".into(),
                port: 6432,
                name: "app".into(),
                user: "replicator".into(),
                password: "hunter2".into(),
            },
        }
    }

    #[test]
    fn args_stream_tar_to_stdout() {
        assert_eq!(
            command().args(),
            vec![
                "-d",
                "postgres://replicator@db.internal:6432/app",
                "-D-",
                "-Ft",
                "-Xnone",
                "-r",
                "1024M"
            ]
        );
    }

    #[test]
    fn password_stays_out_of_arguments() {
        assert!(command().args().iter().all(|arg| !arg.contains("hunter2")));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let mut cmd = command();
        cmd.program = "/nonexistent/walvault-test-tool".into();
        assert!(matches!(cmd.spawn(), Err(BaseBackupError::Spawn { .. })));
    }
}
