//! Rebuild a directory tree from a tar stream.
//!
//! Entries are handled one at a time in stream order: directories are
//! created with their mode, regular files are written and then given their
//! mode. Anything else (links, devices, global headers) stops
//! materialization at that entry; nothing after it is touched. The stream
//! is read as it arrives, so extraction overlaps with download and decode.

use std::{
    fs::{self, File, Permissions},
    io::{self, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};
use tar::{Archive, EntryType};
use thiserror::Error;
use tokio::{io::AsyncRead, task::JoinHandle};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, trace};

const COPY_BUF_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("unsupported archive entry `{path}` of type {kind}")]
    UnsupportedEntry { path: String, kind: String },
    #[error("archive entry `{0}` escapes the destination directory")]
    UnsafePath(String),
    #[error("failed to read archive: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("materializer task failed: {0}")]
    Task(String),
}

impl MaterializeError {
    /// Failure caused only by the other end of a pipe closing.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, MaterializeError::Read(err) if crate::services::pipe::is_broken_pipe(err))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaterializeSummary {
    pub directories: u64,
    pub files: u64,
    /// File content bytes written.
    pub bytes: u64,
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> MaterializeError + '_ {
    move |source| MaterializeError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Join an archive path onto `root`, refusing absolute paths and `..`.
fn resolve(root: &Path, relative: &Path) -> Result<PathBuf, MaterializeError> {
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => resolved.push(segment),
            Component::CurDir => {}
            _ => return Err(MaterializeError::UnsafePath(relative.display().to_string())),
        }
    }
    Ok(resolved)
}

/// Extract every entry of `reader` below `root`.
pub fn materialize<R: Read>(
    reader: R,
    root: &Path,
) -> Result<MaterializeSummary, MaterializeError> {
    let mut archive = Archive::new(reader);
    let mut summary = MaterializeSummary::default();

    for entry in archive.entries().map_err(MaterializeError::Read)? {
        let mut entry = entry.map_err(MaterializeError::Read)?;
        let relative = entry.path().map_err(MaterializeError::Read)?.into_owned();
        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().map_err(MaterializeError::Read)? & 0o7777;

        match entry_type {
            EntryType::Directory => {
                let destination = resolve(root, &relative)?;
                fs::create_dir_all(&destination).map_err(write_error(&destination))?;
                fs::set_permissions(&destination, Permissions::from_mode(mode))
                    .map_err(write_error(&destination))?;
                trace!(path = %destination.display(), mode, "created directory");
                summary.directories += 1;
            }
            EntryType::Regular => {
                let destination = resolve(root, &relative)?;
                let mut file = File::create(&destination).map_err(write_error(&destination))?;
                let copied = copy_entry(&mut entry, &mut file, &destination)?;
                file.set_permissions(Permissions::from_mode(mode))
                    .map_err(write_error(&destination))?;
                trace!(path = %destination.display(), mode, bytes = copied, "wrote file");
                summary.files += 1;
                summary.bytes += copied;
            }
            other => {
                return Err(MaterializeError::UnsupportedEntry {
                    path: relative.display().to_string(),
                    kind: format!("{other:?}"),
                });
            }
        }
    }

    // Trailing zero blocks and record padding; the producer must still see
    // its output consumed to the end.
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink()).map_err(MaterializeError::Read)?;

    debug!(
        directories = summary.directories,
        files = summary.files,
        bytes = summary.bytes,
        "archive materialized"
    );
    Ok(summary)
}

fn copy_entry<R: Read>(
    entry: &mut R,
    file: &mut File,
    destination: &Path,
) -> Result<u64, MaterializeError> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut copied = 0u64;
    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(MaterializeError::Read(err)),
        };
        file.write_all(&buf[..n]).map_err(write_error(destination))?;
        copied += n as u64;
    }
    Ok(copied)
}

/// Run [`materialize`] on a blocking task fed by an async stream.
/// Must be called from within a Tokio runtime.
pub fn spawn_materialize<R>(
    stream: R,
    root: PathBuf,
) -> JoinHandle<Result<MaterializeSummary, MaterializeError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = SyncIoBridge::new(stream);
    tokio::task::spawn_blocking(move || materialize(reader, &root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/data");
        assert_eq!(
            resolve(root, Path::new("./base/1")).unwrap(),
            PathBuf::from("/data/base/1")
        );
        assert!(matches!(
            resolve(root, Path::new("../etc/passwd")),
            Err(MaterializeError::UnsafePath(_))
        ));
        assert!(matches!(
            resolve(root, Path::new("/etc/passwd")),
            Err(MaterializeError::UnsafePath(_))
        ));
    }
}
