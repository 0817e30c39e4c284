//! Per-group cycle calendars.
//!
//! The calendar file is JSON, one object per group, each holding exactly the
//! six cycle keys:
//!
//! ```json
//! {
//!   "Alpha": {
//!     "C1": { "start": "2026-01-01T00:00:00Z", "end": "2026-01-15T00:00:00Z" },
//!     "C2": { "start": "2026-01-15T00:00:00Z", "end": "2026-01-29T00:00:00Z" }
//!   }
//! }
//! ```
//!
//! (abbreviated; `C3`..`C6` are required too). Shapes are validated once at
//! load so downstream code never sees a partial calendar.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::model::CycleKey;

/// Start and end instants of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A validated six-cycle calendar for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calendar {
    windows: [CycleWindow; 6],
}

impl Calendar {
    /// Build a calendar from six windows in `C1..C6` order.
    ///
    /// # Errors
    ///
    /// Returns [`CalendarError::InvertedWindow`] if any window ends before it
    /// starts.
    pub fn new(group: &str, windows: [CycleWindow; 6]) -> Result<Self, CalendarError> {
        for (cycle, window) in CycleKey::ALL.iter().zip(windows.iter()) {
            if window.end < window.start {
                return Err(CalendarError::InvertedWindow {
                    group: group.to_string(),
                    cycle: *cycle,
                });
            }
        }
        Ok(Self { windows })
    }

    #[must_use]
    pub const fn window(&self, cycle: CycleKey) -> CycleWindow {
        self.windows[(cycle.index() - 1) as usize]
    }

    #[must_use]
    pub const fn end(&self, cycle: CycleKey) -> DateTime<Utc> {
        self.window(cycle).end
    }

    /// The cycle in progress at `now`: the first whose window contains it,
    /// else the last cycle that already ended, else `C1`.
    #[must_use]
    pub fn current_cycle(&self, now: DateTime<Utc>) -> CycleKey {
        CycleKey::ALL
            .into_iter()
            .find(|cycle| {
                let window = self.window(*cycle);
                window.start <= now && now <= window.end
            })
            .or_else(|| {
                CycleKey::ALL
                    .into_iter()
                    .rev()
                    .find(|cycle| self.end(*cycle) < now)
            })
            .unwrap_or(CycleKey::C1)
    }
}

/// Calendar loading/validation failures.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("calendar file not found: {}", path.display())]
    Missing { path: PathBuf },
    #[error("read calendar {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse calendar {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("group '{group}': unknown cycle key '{key}'")]
    UnknownCycle { group: String, key: String },
    #[error("group '{group}': missing cycle {cycle}")]
    MissingCycle { group: String, cycle: CycleKey },
    #[error("group '{group}': cycle {cycle} ends before it starts")]
    InvertedWindow { group: String, cycle: CycleKey },
}

impl CalendarError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Missing { .. } => ErrorCode::CalendarMissing,
            _ => ErrorCode::CalendarInvalid,
        }
    }
}

/// Calendars for every configured group, keyed by case-sensitive name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarSet {
    groups: BTreeMap<String, Calendar>,
}

impl CalendarSet {
    /// Load and validate a calendar file.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, unreadable, not JSON of the expected
    /// shape, or any group's calendar is incomplete.
    pub fn load(path: &Path) -> Result<Self, CalendarError> {
        if !path.exists() {
            return Err(CalendarError::Missing {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| CalendarError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: BTreeMap<String, BTreeMap<String, CycleWindow>> = serde_json::from_str(&content)
            .map_err(|source| CalendarError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let set = Self::from_raw(raw)?;
        tracing::debug!(groups = set.len(), path = %path.display(), "loaded calendar");
        Ok(set)
    }

    /// Parse calendar JSON already held in memory.
    ///
    /// # Errors
    ///
    /// Same validation failures as [`CalendarSet::load`].
    pub fn from_json(json: &str) -> Result<Self, CalendarError> {
        let raw = serde_json::from_str(json).map_err(|source| CalendarError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: BTreeMap<String, BTreeMap<String, CycleWindow>>) -> Result<Self, CalendarError> {
        let mut groups = BTreeMap::new();
        for (group, entries) in raw {
            let mut slots: [Option<CycleWindow>; 6] = [None; 6];
            for (key, window) in entries {
                let cycle: CycleKey =
                    key.parse().map_err(|_| CalendarError::UnknownCycle {
                        group: group.clone(),
                        key: key.clone(),
                    })?;
                slots[(cycle.index() - 1) as usize] = Some(window);
            }

            let mut windows = Vec::with_capacity(6);
            for cycle in CycleKey::ALL {
                let window = slots[(cycle.index() - 1) as usize].ok_or_else(|| {
                    CalendarError::MissingCycle {
                        group: group.clone(),
                        cycle,
                    }
                })?;
                windows.push(window);
            }
            let windows: [CycleWindow; 6] = [
                windows[0], windows[1], windows[2], windows[3], windows[4], windows[5],
            ];
            let calendar = Calendar::new(&group, windows)?;
            groups.insert(group, calendar);
        }
        Ok(Self { groups })
    }

    pub fn insert(&mut self, group: impl Into<String>, calendar: Calendar) {
        self.groups.insert(group.into(), calendar);
    }

    #[must_use]
    pub fn get(&self, group: &str) -> Option<&Calendar> {
        self.groups.get(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_calendar_json(group: &str) -> String {
        format!(
            r#"{{
  "{group}": {{
    "C1": {{ "start": "2026-01-01T00:00:00Z", "end": "2026-01-15T00:00:00Z" }},
    "C2": {{ "start": "2026-01-15T00:00:00Z", "end": "2026-01-29T00:00:00Z" }},
    "C3": {{ "start": "2026-01-29T00:00:00Z", "end": "2026-02-12T00:00:00Z" }},
    "C4": {{ "start": "2026-02-12T00:00:00Z", "end": "2026-02-26T00:00:00Z" }},
    "C5": {{ "start": "2026-02-26T00:00:00Z", "end": "2026-03-12T00:00:00Z" }},
    "C6": {{ "start": "2026-03-12T00:00:00Z", "end": "2026-03-26T00:00:00Z" }}
  }}
}}"#
        )
    }

    #[test]
    fn parses_complete_calendar() {
        let set = CalendarSet::from_json(&full_calendar_json("Alpha")).expect("valid calendar");
        let cal = set.get("Alpha").expect("Alpha present");
        assert_eq!(cal.end(CycleKey::C2).to_rfc3339(), "2026-01-29T00:00:00+00:00");
        assert!(set.get("alpha").is_none(), "group names are case-sensitive");
    }

    #[test]
    fn current_cycle_tracks_now() {
        let set = CalendarSet::from_json(&full_calendar_json("Alpha")).expect("valid calendar");
        let cal = set.get("Alpha").expect("Alpha present");
        let at = |s: &str| DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc);

        assert_eq!(cal.current_cycle(at("2025-12-01T00:00:00Z")), CycleKey::C1);
        assert_eq!(cal.current_cycle(at("2026-01-10T00:00:00Z")), CycleKey::C1);
        assert_eq!(cal.current_cycle(at("2026-02-01T00:00:00Z")), CycleKey::C3);
        assert_eq!(cal.current_cycle(at("2026-06-01T00:00:00Z")), CycleKey::C6);
    }

    #[test]
    fn rejects_missing_cycle() {
        let json = r#"{ "Beta": { "C1": { "start": "2026-01-01T00:00:00Z", "end": "2026-01-15T00:00:00Z" } } }"#;
        let err = CalendarSet::from_json(json).expect_err("C2..C6 missing");
        assert!(matches!(err, CalendarError::MissingCycle { cycle: CycleKey::C2, .. }));
        assert_eq!(err.code(), ErrorCode::CalendarInvalid);
    }

    #[test]
    fn rejects_unknown_cycle_key() {
        let json = full_calendar_json("Alpha").replace("\"C6\"", "\"C7\"");
        let err = CalendarSet::from_json(&json).expect_err("C7 is not a cycle");
        assert!(matches!(err, CalendarError::UnknownCycle { ref key, .. } if key == "C7"));
    }

    #[test]
    fn rejects_inverted_window() {
        let json = full_calendar_json("Alpha").replace(
            r#""C3": { "start": "2026-01-29T00:00:00Z", "end": "2026-02-12T00:00:00Z" }"#,
            r#""C3": { "start": "2026-02-12T00:00:00Z", "end": "2026-01-29T00:00:00Z" }"#,
        );
        let err = CalendarSet::from_json(&json).expect_err("inverted window");
        assert!(matches!(err, CalendarError::InvertedWindow { cycle: CycleKey::C3, .. }));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = CalendarSet::load(&dir.path().join("nope.json")).expect_err("missing");
        assert_eq!(err.code(), ErrorCode::CalendarMissing);
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("calendar.json");
        std::fs::write(&path, full_calendar_json("Gamma")).expect("write calendar");
        let set = CalendarSet::load(&path).expect("load calendar");
        assert_eq!(set.groups().collect::<Vec<_>>(), vec!["Gamma"]);
    }
}
