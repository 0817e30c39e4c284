use std::fmt;

/// Machine-readable error codes surfaced in run reports and CLI output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    CalendarMissing,
    CalendarInvalid,
    UpstreamFetchFailed,
    SnapshotWriteFailed,
    SnapshotReadFailed,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// `E####`; the leading digit groups codes by subsystem.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::CalendarMissing => "E1002",
            Self::CalendarInvalid => "E1003",
            Self::UpstreamFetchFailed => "E2001",
            Self::SnapshotWriteFailed => "E3001",
            Self::SnapshotReadFailed => "E3002",
            Self::LockContention => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// One-line summary.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::CalendarMissing => "Calendar file not found",
            Self::CalendarInvalid => "Calendar file is invalid",
            Self::UpstreamFetchFailed => "Upstream fetch failed",
            Self::SnapshotWriteFailed => "Snapshot write failed",
            Self::SnapshotReadFailed => "Snapshot read failed",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .spillway/config.toml and retry."),
            Self::CalendarMissing => Some("Point [paths] calendar at an existing JSON file."),
            Self::CalendarInvalid => {
                Some("Every group needs C1..C6 entries with RFC 3339 start/end, start <= end.")
            }
            Self::UpstreamFetchFailed => Some("Retry the run; the next run refreshes this cycle."),
            Self::SnapshotWriteFailed => {
                Some("The update was rolled back and will be retried on the next run.")
            }
            Self::SnapshotReadFailed => Some("Check that the snapshot database is readable."),
            Self::LockContention => Some("Retry after the other `spw` process releases its lock."),
            Self::InternalUnexpected => Some("Rerun with DEBUG=1 and report the log output."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 8] = [
        ErrorCode::ConfigParseError,
        ErrorCode::CalendarMissing,
        ErrorCode::CalendarInvalid,
        ErrorCode::UpstreamFetchFailed,
        ErrorCode::SnapshotWriteFailed,
        ErrorCode::SnapshotReadFailed,
        ErrorCode::LockContention,
        ErrorCode::InternalUnexpected,
    ];

    #[test]
    fn codes_never_collide() {
        let codes: HashSet<&str> = ALL.iter().map(|c| c.code()).collect();
        assert_eq!(codes.len(), ALL.len());
    }

    #[test]
    fn codes_are_e_plus_four_digits() {
        for code in ALL.map(ErrorCode::code) {
            let (prefix, digits) = code.split_at(1);
            assert_eq!(prefix, "E", "{code}");
            assert!(digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit()), "{code}");
        }
    }

    #[test]
    fn every_code_has_a_hint_and_displays_as_code() {
        for code in ALL {
            assert!(code.hint().is_some(), "{code} lacks a hint");
            assert_eq!(code.to_string(), code.code());
        }
    }
}
