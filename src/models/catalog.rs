//! Catalog entries and the backup timestamp format.

use chrono::{DateTime, NaiveDateTime, ParseError, Utc};

use super::object::base_name;

/// Fixed-width, zero-padded, second precision. Lexicographic order of
/// formatted values equals chronological order.
pub const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

/// Extension appended to every base backup name.
pub const BACKUP_EXTENSION: &str = ".tar.gz";

/// A backup object together with the time embedded in its name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

pub fn format_backup_time(time: DateTime<Utc>) -> String {
    time.format(BACKUP_TIME_FORMAT).to_string()
}

pub fn parse_backup_time(value: &str) -> Result<DateTime<Utc>, ParseError> {
    NaiveDateTime::parse_from_str(value, BACKUP_TIME_FORMAT).map(|naive| naive.and_utc())
}

/// Object name for a backup taken at `time`.
pub fn backup_file_name(time: DateTime<Utc>) -> String {
    format!("{}{}", format_backup_time(time), BACKUP_EXTENSION)
}

/// Parse the timestamp embedded in a backup key.
///
/// The extension is everything from the first `.` of the base name; the
/// timestamp format itself never contains a dot.
pub fn parse_backup_key(key: &str) -> Result<DateTime<Utc>, ParseError> {
    let name = base_name(key);
    let stem = name.split_once('.').map_or(name, |(stem, _)| stem);
    parse_backup_time(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_is_fixed_width() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_backup_time(time), "2024-01-02T03-04-05Z");
        assert_eq!(backup_file_name(time), "2024-01-02T03-04-05Z.tar.gz");
    }

    #[test]
    fn key_round_trips_through_name() {
        let time = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let key = format!("pg/db1/backups/{}", backup_file_name(time));
        assert_eq!(parse_backup_key(&key).unwrap(), time);
    }

    #[test]
    fn garbage_name_is_rejected() {
        assert!(parse_backup_key("pg/db1/backups/latest.tar.gz").is_err());
        assert!(parse_backup_key("pg/db1/backups/2024-01-01 00:00:00.tar.gz").is_err());
    }
}
