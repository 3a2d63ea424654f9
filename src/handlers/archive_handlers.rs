//! WAL segment archiving: the `archive_command` and `restore_command`
//! halves of continuous archiving.

use super::{AppState, Outcome, start_download, upload};
use crate::{
    errors::{AppError, AppResult},
    models::metric::{Metric, OpCode},
};
use chrono::Utc;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::info;
use uuid::Uuid;

/// Encode and store the segment at `path` under `archive/<basename>`.
pub async fn archive_put(state: &AppState, path: &Path) -> AppResult<Outcome> {
    info!(path = %path.display(), "starting archive put");
    let start = Utc::now();

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::Io {
            context: format!("`{}` does not name a file", path.display()),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;
    let segment = File::open(path)
        .await
        .map_err(AppError::io(format!("failed to open `{}`", path.display())))?;

    let key = state.layout.archive_key(&name);
    let bytes = upload(state, &key, segment).await?;

    state
        .ledger
        .record(Metric::finished(OpCode::ArchivePut, name.clone(), start, bytes))
        .await;
    info!(key = %key, bytes, "finished archive put");
    Ok(Outcome::Completed {
        subject: name,
        bytes,
    })
}

/// Fetch `archive/<filename>` and write its plaintext to `dst_path`.
///
/// The data lands in a temporary sibling first and is renamed over
/// `dst_path` only once every stage succeeded, so a failed fetch never
/// leaves a truncated segment behind.
pub async fn archive_get(state: &AppState, dst_path: &Path, filename: &str) -> AppResult<Outcome> {
    info!(dst_path = %dst_path.display(), filename, "starting archive get");
    let start = Utc::now();

    let key = state.layout.archive_key(filename);
    let tmp_path = temp_sibling(dst_path);
    let (mut plaintext, download) = start_download(state, &key)?;

    let written = async {
        let mut file = File::create(&tmp_path)
            .await
            .map_err(AppError::io(format!("failed to create `{}`", tmp_path.display())))?;
        tokio::io::copy(&mut plaintext, &mut file)
            .await
            .map_err(AppError::io(format!("failed to write `{}`", tmp_path.display())))?;
        file.flush()
            .await
            .map_err(AppError::io(format!("failed to flush `{}`", tmp_path.display())))?;
        file.sync_all()
            .await
            .map_err(AppError::io(format!("failed to sync `{}`", tmp_path.display())))?;
        Ok::<(), AppError>(())
    }
    .await;
    drop(plaintext);

    let bytes = match download.finish(written).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
    };
    fs::rename(&tmp_path, dst_path)
        .await
        .map_err(AppError::io(format!("failed to move segment into `{}`", dst_path.display())))?;

    state
        .ledger
        .record(Metric::finished(OpCode::ArchiveGet, filename, start, bytes))
        .await;
    info!(key = %key, bytes, "finished archive get");
    Ok(Outcome::Completed {
        subject: filename.to_string(),
        bytes,
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.partial", Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_sibling_stays_in_directory() {
        let tmp = temp_sibling(Path::new("/var/lib/pg/pg_wal/RECOVERYXLOG"));
        assert_eq!(tmp.parent(), Some(Path::new("/var/lib/pg/pg_wal")));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".RECOVERYXLOG."));
        assert!(name.ends_with(".partial"));
    }
}
