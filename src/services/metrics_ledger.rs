//! Append-only metrics ledger shared by every invocation on the host.
//!
//! Writers take an exclusive `flock` on a separate lock file for the
//! duration of one append, so concurrent processes never interleave partial
//! lines. Readers (the database-side collector) take the same lock.

use crate::models::metric::Metric;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub const METRICS_FILE_NAME: &str = "walvault.metrics";
pub const DEFAULT_LOCK_PATH: &str = "/var/run/postgresql/walvault.lock";

#[derive(Clone, Debug)]
pub struct MetricsLedger {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Exclusive advisory lock, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .mode(0o644)
            .open(path)?;
        loop {
            // SAFETY: the descriptor is owned by `file` and stays open for
            // the lifetime of the lock.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: see `exclusive`; closing the file would also release it.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl MetricsLedger {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
        }
    }

    /// Ledger stored at the fixed file name inside the data directory.
    pub fn in_data_dir(data_dir: &Path, lock_path: impl Into<PathBuf>) -> Self {
        Self::new(data_dir.join(METRICS_FILE_NAME), lock_path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record while holding the lock. Blocks while another
    /// writer holds it.
    pub fn append(&self, metric: &Metric) -> io::Result<()> {
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&self.path)?;
        file.write_all(metric.to_line().as_bytes())?;
        Ok(())
    }

    /// Append from async code. The transfer being recorded has already
    /// completed, so a failure here is only logged.
    pub async fn record(&self, metric: Metric) {
        let ledger = self.clone();
        let op = metric.op;
        let result = tokio::task::spawn_blocking(move || ledger.append(&metric)).await;
        match result {
            Ok(Ok(())) => debug!(%op, path = %self.path.display(), "stored metric"),
            Ok(Err(err)) => warn!(%op, path = %self.path.display(), "failed to store metric: {}", err),
            Err(err) => warn!(%op, "metric task failed: {}", err),
        }
    }
}
