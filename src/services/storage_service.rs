//! src/services/storage_service.rs
//!
//! Object store gateway: the contract every backend implements, the
//! strictly sequential download sink, and `LocalStore`, a backend that keeps
//! objects as plain files beneath `base_path/{key}`. The S3 backend lives in
//! `s3_store.rs`.

use crate::models::object::ListPage;
use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task,
};
use tracing::debug;
use uuid::Uuid;

/// Transfer part size. Also the backend's minimum multipart part size.
pub const PART_SIZE: usize = 5 * 1024 * 1024;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const DEFAULT_PAGE_SIZE: usize = 1000;
const COPY_BUF_LEN: usize = 64 * 1024;
const TMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("out-of-order write at offset {offset}, expected {expected}")]
    OutOfOrderWrite { expected: u64, offset: u64 },
    #[error("{op} `{key}` failed: {message}")]
    Backend {
        op: &'static str,
        key: String,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Failure caused only by the other end of a pipe closing.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, StorageError::Io(err) if crate::services::pipe::is_broken_pipe(err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A key-value blob backend.
///
/// Transfers are strictly linear: `put` consumes its body front to back in
/// `PART_SIZE` parts, one part at a time, and `get` delivers bytes through a
/// [`SequentialWriter`] in object order. No method retries; a failure aborts
/// the transfer and is returned to the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the body under `key`, returning the number of bytes stored.
    /// Nothing becomes visible under `key` unless the body reaches a clean
    /// end of stream.
    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StorageResult<u64>;

    /// Stream the object at `key` into `sink`, returning its size.
    async fn get(&self, key: &str, sink: &mut SequentialWriter) -> StorageResult<u64>;

    /// Keys starting with `prefix`, ascending, strictly after `start_after`.
    async fn list(&self, prefix: &str, start_after: Option<&str>) -> StorageResult<ListPage>;

    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Download sink that only accepts writes at the current end of stream.
///
/// A write at any other offset is rejected with `OutOfOrderWrite` rather
/// than being appended out of place.
pub struct SequentialWriter {
    inner: Box<dyn AsyncWrite + Unpin + Send>,
    position: u64,
}

impl SequentialWriter {
    pub fn new<W>(inner: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Box::new(inner),
            position: 0,
        }
    }

    /// Bytes accepted so far; the only offset `write_at` will take.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if offset != self.position {
            return Err(StorageError::OutOfOrderWrite {
                expected: self.position,
                offset,
            });
        }
        self.inner.write_all(data).await?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Signal end of stream to the inner writer.
    pub async fn finish(mut self) -> StorageResult<u64> {
        self.inner.shutdown().await?;
        Ok(self.position)
    }
}

/// Filesystem-backed object store.
///
/// Keys map directly onto paths below `base_path`, so a prefix listing is a
/// directory walk. Writes go to a temporary file first and are renamed into
/// place only after the body has been fully received.
#[derive(Clone, Debug)]
pub struct LocalStore {
    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Maximum keys returned per listing page.
    page_size: usize,
}

impl LocalStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the listing page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/`, contain `..` or name a temporary
    /// upload file.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        if key.split('/').any(|segment| segment.starts_with(TMP_PREFIX)) {
            return Err(invalid());
        }
        Ok(())
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.extend(key.split('/').filter(|segment| !segment.is_empty()));
        path
    }

    fn bucket_label(&self) -> String {
        self.base_path.display().to_string()
    }

    /// Recursively remove empty directories up to the base path.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    /// Stream the body to a temporary file, fsync, then rename into place.
    /// The temporary file is removed on any error.
    async fn put(
        &self,
        key: &str,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StorageResult<u64> {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_LEN];
        loop {
            let n = match body.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            if let Err(err) = file.write_all(&buf[..n]).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
            size_bytes += n as u64;
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        // rename(2) replaces an existing object atomically.
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!(key, size_bytes, "stored object at {}", file_path.display());
        Ok(size_bytes)
    }

    async fn get(&self, key: &str, sink: &mut SequentialWriter) -> StorageResult<u64> {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let mut file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: self.bucket_label(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        let mut buf = vec![0u8; COPY_BUF_LEN];
        let mut offset = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write_at(offset, &buf[..n]).await?;
            offset += n as u64;
        }
        Ok(offset)
    }

    /// Follows ListObjectsV2 ordering: ascending keys, resumed strictly
    /// after `start_after`, at most one page per call.
    async fn list(&self, prefix: &str, start_after: Option<&str>) -> StorageResult<ListPage> {
        let base = self.base_path.clone();
        let walk_from = prefix.rsplit_once('/').map_or("", |(dir, _)| dir).to_string();
        let mut keys = task::spawn_blocking(move || collect_keys(&base, &walk_from))
            .await
            .map_err(io::Error::other)??;

        keys.retain(|key| {
            key.starts_with(prefix) && start_after.is_none_or(|after| key.as_str() > after)
        });
        keys.sort();

        let mut is_truncated = false;
        if keys.len() > self.page_size {
            keys.truncate(self.page_size);
            is_truncated = true;
        }

        Ok(ListPage { keys, is_truncated })
    }

    /// Remove the payload and prune directories left empty.
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::ObjectNotFound {
                    bucket: self.bucket_label(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}

/// Every stored key below `base/dir`, unordered.
fn collect_keys(base: &Path, dir: &str) -> io::Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut start = base.to_path_buf();
    start.extend(dir.split('/').filter(|segment| !segment.is_empty()));
    walk(base, &start, &mut keys)?;
    Ok(keys)
}

fn walk(base: &Path, dir: &Path, keys: &mut Vec<String>) -> io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(base, &path, keys)?;
        } else if file_type.is_file() {
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(base) {
                let key = relative
                    .components()
                    .filter_map(|component| match component {
                        Component::Normal(segment) => Some(segment.to_string_lossy()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::pipe;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn put_bytes(store: &LocalStore, key: &str, data: &[u8]) -> u64 {
        let mut body = data;
        store.put(key, &mut body).await.unwrap()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let payload = vec![42u8; 200_000];
        assert_eq!(put_bytes(&store, "db1/archive/seg", &payload).await, 200_000);

        let (writer, mut reader) = pipe::pipe(4);
        let mut sink = SequentialWriter::new(writer);
        let consumer = tokio::spawn(async move {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.map(|_| out)
        });
        assert_eq!(store.get("db1/archive/seg", &mut sink).await.unwrap(), 200_000);
        sink.finish().await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap(), payload);
    }

    #[tokio::test]
    async fn put_overwrites_existing_object() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        put_bytes(&store, "db1/archive/seg", b"first version").await;
        assert_eq!(put_bytes(&store, "db1/archive/seg", b"second").await, 6);

        let (writer, mut reader) = pipe::pipe(4);
        let mut sink = SequentialWriter::new(writer);
        assert_eq!(store.get("db1/archive/seg", &mut sink).await.unwrap(), 6);
        sink.finish().await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"second");

        let listed = store.list("db1/archive/", None).await.unwrap();
        assert_eq!(listed.keys, vec!["db1/archive/seg".to_string()]);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let mut sink = SequentialWriter::new(tokio::io::sink());
        let err = store.get("db1/archive/nope", &mut sink).await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_body_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        let (mut writer, mut reader) = pipe::pipe(4);
        writer.write_all(b"half a segment").await.unwrap();
        drop(writer);

        let err = store.put("db1/archive/seg", &mut reader).await.unwrap_err();
        assert!(err.is_broken_pipe());
        let page = store.list("db1/", None).await.unwrap();
        assert!(page.keys.is_empty());
    }

    #[tokio::test]
    async fn list_pages_in_key_order() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).with_page_size(2);
        for name in ["c", "a", "e", "b", "d"] {
            put_bytes(&store, &format!("db1/backups/{name}"), b"x").await;
        }
        put_bytes(&store, "db1/backups-old/z", b"x").await;
        put_bytes(&store, "db1/archive/a", b"x").await;

        let first = store.list("db1/backups/", None).await.unwrap();
        assert_eq!(first.keys, vec!["db1/backups/a", "db1/backups/b"]);
        assert!(first.is_truncated);

        let second = store
            .list("db1/backups/", Some("db1/backups/b"))
            .await
            .unwrap();
        assert_eq!(second.keys, vec!["db1/backups/c", "db1/backups/d"]);
        assert!(second.is_truncated);

        let third = store
            .list("db1/backups/", Some("db1/backups/d"))
            .await
            .unwrap();
        assert_eq!(third.keys, vec!["db1/backups/e"]);
        assert!(!third.is_truncated);
    }

    #[tokio::test]
    async fn delete_prunes_empty_directories() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());
        put_bytes(&store, "pg/db1/backups/one", b"x").await;
        store.delete("pg/db1/backups/one").await.unwrap();
        assert!(!dir.path().join("pg").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn sequential_writer_rejects_gaps() {
        let mut sink = SequentialWriter::new(tokio::io::sink());
        sink.write_at(0, b"abc").await.unwrap();
        let err = sink.write_at(10, b"def").await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfOrderWrite {
                expected: 3,
                offset: 10
            }
        ));
        assert_eq!(sink.position(), 3);
    }

    #[test]
    fn unsafe_keys_are_rejected() {
        let store = LocalStore::new("/tmp/unused");
        for key in ["", "/abs", "a/../b", "a/.tmp-x", "trailing/"] {
            assert!(store.ensure_key_safe(key).is_err(), "{key}");
        }
        assert!(store.ensure_key_safe("pg/db1/archive/0001").is_ok());
    }
}
