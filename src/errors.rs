use crate::config::ConfigError;
use crate::services::{
    basebackup::BaseBackupError, catalog_service::CatalogError, materializer::MaterializeError,
    storage_service::StorageError, transform::TransformError,
};
use std::io;
use thiserror::Error;

/// Everything an operation can fail with, one variant per stage.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    BaseBackup(BaseBackupError),
    #[error("backup tool exited with status {code:?}: {stderr}")]
    BackupToolFailed { code: Option<i32>, stderr: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no backup found at or before {target} under `{prefix}`")]
    NoBackupFound { prefix: String, target: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} task panicked or was cancelled")]
    Task(&'static str),
}

impl AppError {
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> AppError {
        let context = context.into();
        move |source| AppError::Io { context, source }
    }

    /// True when this stage only failed because a neighbouring stage hung
    /// up, so some other stage holds the real cause.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            AppError::Storage(err) => err.is_broken_pipe(),
            AppError::Transform(err) => err.is_broken_pipe(),
            AppError::Materialize(err) => err.is_broken_pipe(),
            AppError::Io { source, .. } => crate::services::pipe::is_broken_pipe(source),
            _ => false,
        }
    }
}

impl From<BaseBackupError> for AppError {
    fn from(err: BaseBackupError) -> Self {
        match err {
            BaseBackupError::Failed { code, stderr } => AppError::BackupToolFailed { code, stderr },
            other => AppError::BaseBackup(other),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Pick the error to report from stages joined in pipeline order: the first
/// one that is not merely a hang-up, falling back to the first error.
pub fn root_cause(errors: Vec<AppError>) -> Option<AppError> {
    let position = errors.iter().position(|err| !err.is_broken_pipe());
    let mut errors = errors;
    match position {
        Some(index) => Some(errors.swap_remove(index)),
        None => errors.into_iter().next(),
    }
}

/// Collect stage results in pipeline order, returning the root cause if
/// any stage failed.
pub fn settle<const N: usize>(results: [AppResult<()>; N]) -> AppResult<()> {
    let errors: Vec<AppError> = results.into_iter().filter_map(Result::err).collect();
    match root_cause(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hang_up() -> AppError {
        AppError::Storage(StorageError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "reader closed",
        )))
    }

    #[test]
    fn root_cause_skips_hang_ups() {
        let err = settle([
            Err(hang_up()),
            Err(AppError::Transform(TransformError::TruncatedFrame)),
            Ok(()),
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::Transform(TransformError::TruncatedFrame)));
    }

    #[test]
    fn only_hang_ups_reports_first() {
        let err = settle([Ok(()), Err(hang_up())]).unwrap_err();
        assert!(err.is_broken_pipe());
        assert!(settle([Ok(()), Ok(())]).is_ok());
    }
}
