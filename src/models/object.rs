//! Object keys as laid out in the backend.
//!
//! Every object lives under `<storage-prefix>/<database-id>/<kind>/<name>`.
//! WAL segments use their own file name; base backups use a fixed-width UTC
//! timestamp so that listing order is also chronological order.

use std::fmt;

/// The two families of objects stored per database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// Individual WAL segments.
    Archive,
    /// Full base backups (`<timestamp>.tar.gz`).
    Backups,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Archive => "archive",
            ObjectKind::Backups => "backups",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds backend keys for one database.
#[derive(Clone, Debug)]
pub struct ObjectLayout {
    /// Optional leading prefix shared by every database in the bucket.
    pub storage_prefix: String,

    /// Identifier unique among databases sharing the bucket and prefix.
    pub database_id: String,
}

impl ObjectLayout {
    pub fn new(storage_prefix: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            storage_prefix: storage_prefix.into(),
            database_id: database_id.into(),
        }
    }

    /// Full key for `name` under `kind`.
    pub fn key(&self, kind: ObjectKind, name: &str) -> String {
        join_key(&[
            &self.storage_prefix,
            &self.database_id,
            kind.as_str(),
            name,
        ])
    }

    pub fn archive_key(&self, segment: &str) -> String {
        self.key(ObjectKind::Archive, segment)
    }

    pub fn backup_key(&self, name: &str) -> String {
        self.key(ObjectKind::Backups, name)
    }

    /// Listing prefix for `kind`, always ending in `/` so sibling
    /// directories sharing a name prefix are not picked up.
    pub fn prefix(&self, kind: ObjectKind) -> String {
        let mut prefix = join_key(&[&self.storage_prefix, &self.database_id, kind.as_str()]);
        prefix.push('/');
        prefix
    }
}

/// One page of a prefix listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in ascending lexicographic order.
    pub keys: Vec<String>,

    /// More keys follow; resume after the last key of this page.
    pub is_truncated: bool,
}

/// Join key segments with `/`, dropping empty segments and stray slashes.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Final path segment of a key.
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_layout() {
        let layout = ObjectLayout::new("pg/", "db1");
        assert_eq!(
            layout.archive_key("000000010000000000000001"),
            "pg/db1/archive/000000010000000000000001"
        );
        assert_eq!(
            layout.backup_key("2024-01-01T00-00-00Z.tar.gz"),
            "pg/db1/backups/2024-01-01T00-00-00Z.tar.gz"
        );
        assert_eq!(layout.prefix(ObjectKind::Backups), "pg/db1/backups/");
    }

    #[test]
    fn empty_prefix_is_skipped() {
        let layout = ObjectLayout::new("", "db1");
        assert_eq!(layout.backup_key("x.tar.gz"), "db1/backups/x.tar.gz");
        assert_eq!(base_name("db1/backups/x.tar.gz"), "x.tar.gz");
        assert_eq!(base_name("plain"), "plain");
    }
}
