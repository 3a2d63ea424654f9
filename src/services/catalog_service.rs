//! Closest-before backup resolution.
//!
//! Backup names embed a fixed-width UTC timestamp, so the backend's
//! lexicographic listing order is chronological order. One forward pass over
//! the listing is enough: keep the newest entry seen so far and stop at the
//! first entry newer than the target.

use crate::{
    models::catalog::{CatalogEntry, parse_backup_key},
    services::storage_service::{ObjectStore, StorageError},
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("backup key `{key}` does not embed a valid timestamp: {source}")]
    InvalidTimestamp {
        key: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Newest backup under `prefix` whose timestamp is not after `target`.
///
/// Returns `None` when the prefix is empty or every backup is newer than
/// `target`. Pages are requested only until the first newer entry shows up.
/// With duplicate timestamps the lexicographically later key wins.
pub async fn closest_before(
    store: &dyn ObjectStore,
    prefix: &str,
    target: DateTime<Utc>,
) -> Result<Option<CatalogEntry>, CatalogError> {
    let mut closest: Option<CatalogEntry> = None;
    let mut cursor: Option<String> = None;

    loop {
        let page = store.list(prefix, cursor.as_deref()).await?;
        debug!(
            prefix,
            start_after = cursor.as_deref().unwrap_or(""),
            keys = page.keys.len(),
            truncated = page.is_truncated,
            "scanning backup listing"
        );
        if page.keys.is_empty() {
            if page.is_truncated {
                warn!(prefix, "backend reported a truncated but empty listing page");
            }
            return Ok(closest);
        }

        for key in page.keys {
            let timestamp = parse_backup_key(&key).map_err(|source| {
                CatalogError::InvalidTimestamp {
                    key: key.clone(),
                    source,
                }
            })?;
            if timestamp > target {
                return Ok(closest);
            }
            cursor = Some(key.clone());
            closest = Some(CatalogEntry { key, timestamp });
        }

        if !page.is_truncated {
            return Ok(closest);
        }
    }
}
