//! The four operations, written against an explicit [`AppState`].
//!
//! Every transfer is a chain of concurrently running stages joined by
//! bounded pipes. The helpers here start the write path
//! (`source -> encode -> put`) and the read path (`get -> decode -> sink`),
//! then join every stage and report the root cause of a failure.

pub mod archive_handlers;
pub mod backup_handlers;
pub mod restore_handlers;

use crate::{
    config::{AppConfig, Backend, Command},
    errors::{AppError, AppResult, settle},
    models::object::ObjectLayout,
    services::{
        metrics_ledger::MetricsLedger,
        pipe::{self, DEFAULT_PIPE_FRAMES, PipeReader},
        s3_store::S3Store,
        storage_service::{LocalStore, ObjectStore, SequentialWriter, StorageError, StorageResult},
        transform::{self, KeyPolicy, StaticKey, TransformTask},
    },
};
use std::sync::Arc;
use tokio::{io::AsyncRead, task::JoinHandle};
use tracing::debug;

/// Shared state for every operation.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub keys: Arc<dyn KeyPolicy>,
    pub layout: ObjectLayout,
    pub ledger: MetricsLedger,
}

impl AppState {
    /// Wire up state around an already constructed backend.
    pub fn new(config: AppConfig, store: Arc<dyn ObjectStore>) -> Self {
        let keys: Arc<dyn KeyPolicy> = Arc::new(StaticKey::from(config.encryption_key.clone()));
        let layout = ObjectLayout::new(config.storage_prefix.clone(), config.database_id.clone());
        let ledger = MetricsLedger::in_data_dir(&config.data_dir, config.metrics_lock_path.clone());
        Self {
            config: Arc::new(config),
            store,
            keys,
            layout,
            ledger,
        }
    }

    /// Connect the configured backend.
    pub async fn connect(config: AppConfig) -> Self {
        let store: Arc<dyn ObjectStore> = match &config.backend {
            Backend::S3(settings) => Arc::new(S3Store::connect(settings).await),
            Backend::Local { root } => Arc::new(LocalStore::new(root.clone())),
        };
        Self::new(config, store)
    }
}

/// What an operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { subject: String, bytes: u64 },
    /// Nothing to do; not an error.
    Skipped { reason: String },
}

/// Run one subcommand.
pub async fn dispatch(state: &AppState, command: &Command) -> AppResult<Outcome> {
    match command {
        Command::ArchivePut { path } => archive_handlers::archive_put(state, path).await,
        Command::ArchiveGet { dst_path, filename } => {
            archive_handlers::archive_get(state, dst_path, filename).await
        }
        Command::Backup { scheduled } => backup_handlers::backup(state, *scheduled).await,
        Command::Restore {
            best_effort,
            copy_pg_conf,
            target_time,
        } => {
            let target = target_time
                .as_deref()
                .map(crate::config::parse_target_time)
                .transpose()?;
            restore_handlers::restore(
                state,
                restore_handlers::RestoreOptions {
                    best_effort: *best_effort,
                    copy_pg_conf: copy_pg_conf.clone(),
                    target_time: target,
                },
            )
            .await
        }
    }
}

/// Encode `source` and store it under `key`, returning the plaintext size.
///
/// Nothing is committed under `key` unless `source` reached a clean end.
pub async fn upload<R>(state: &AppState, key: &str, source: R) -> AppResult<u64>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let secret = state.keys.key_for(key)?;
    let (mut frame, encoder) = transform::encode(source, &secret)?;

    let stored = state.store.put(key, &mut frame).await;
    // Unblock the encoder if the store stopped reading early.
    drop(frame);

    if let Ok(stored_bytes) = &stored {
        debug!(key, stored_bytes = *stored_bytes, "object stored");
    }

    let mut plaintext = 0;
    settle([
        encoder.wait().await.map(|n| plaintext = n).map_err(AppError::from),
        stored.map(drop).map_err(AppError::from),
    ])?;
    Ok(plaintext)
}

/// A running `get -> decode` chain whose plaintext is being consumed.
pub struct Download {
    fetch: JoinHandle<StorageResult<u64>>,
    decoder: TransformTask,
}

/// Start fetching and decoding `key`. The caller drains the returned stream
/// and then hands its own result to [`Download::finish`].
pub fn start_download(state: &AppState, key: &str) -> AppResult<(PipeReader, Download)> {
    let secret = state.keys.key_for(key)?;
    let (frame_writer, frame_reader) = pipe::pipe(DEFAULT_PIPE_FRAMES);
    let (plaintext, decoder) = transform::decode(frame_reader, &secret)?;

    let store = state.store.clone();
    let key = key.to_string();
    let fetch = tokio::spawn(async move {
        let mut sink = SequentialWriter::new(frame_writer);
        let fetched = store.get(&key, &mut sink).await?;
        sink.finish().await?;
        debug!(key = %key, fetched_bytes = fetched, "object fetched");
        Ok::<_, StorageError>(fetched)
    });

    Ok((plaintext, Download { fetch, decoder }))
}

impl Download {
    /// Join the fetch and decode stages together with the consumer's
    /// result, returning the plaintext size or the root cause.
    pub async fn finish(self, consumer: AppResult<()>) -> AppResult<u64> {
        let fetched = match self.fetch.await {
            Ok(result) => result.map(drop).map_err(AppError::from),
            Err(_) => Err(AppError::Task("download")),
        };
        let mut plaintext = 0;
        settle([
            fetched,
            self.decoder.wait().await.map(|n| plaintext = n).map_err(AppError::from),
            consumer,
        ])?;
        Ok(plaintext)
    }
}
