//! Records appended to the metrics ledger, one per completed transfer.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

/// Two-letter operation code written in the first column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    ArchivePut,
    ArchiveGet,
    Backup,
    Restore,
}

impl OpCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::ArchivePut => "AP",
            OpCode::ArchiveGet => "AG",
            OpCode::Backup => "BA",
            OpCode::Restore => "RE",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metric {
    pub op: OpCode,

    /// Segment file name or backup object name.
    pub subject: String,

    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,

    /// Plaintext bytes moved by the operation.
    pub size: u64,
}

impl Metric {
    /// Stamp the finish time now.
    pub fn finished(
        op: OpCode,
        subject: impl Into<String>,
        start_time: DateTime<Utc>,
        size: u64,
    ) -> Self {
        Self {
            op,
            subject: subject.into(),
            start_time,
            finish_time: Utc::now(),
            size,
        }
    }

    /// `op,subject,start,finish,size` followed by a newline.
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{}\n",
            self.op,
            self.subject,
            self.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.finish_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn line_layout() {
        let metric = Metric {
            op: OpCode::Backup,
            subject: "2024-01-01T00-00-00Z.tar.gz".into(),
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            finish_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 30).unwrap(),
            size: 4096,
        };
        assert_eq!(
            metric.to_line(),
            "BA,2024-01-01T00-00-00Z.tar.gz,2024-01-01T00:00:00Z,2024-01-01T00:05:30Z,4096\n"
        );
    }
}
