//! Domain types shared across the snapshot engine.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream item identifier.
pub type ItemId = String;

/// Upstream label identifier (as resolved by the upstream system).
pub type LabelId = String;

/// One of the six fixed cycles tracked per group.
///
/// Ordering follows the calendar: `C1 < C2 < ... < C6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CycleKey {
    C1,
    C2,
    C3,
    C4,
    C5,
    C6,
}

impl CycleKey {
    /// All cycles in calendar order.
    pub const ALL: [Self; 6] = [Self::C1, Self::C2, Self::C3, Self::C4, Self::C5, Self::C6];

    /// 1-based position of the cycle within the calendar.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::C1 => 1,
            Self::C2 => 2,
            Self::C3 => 3,
            Self::C4 => 4,
            Self::C5 => 5,
            Self::C6 => 6,
        }
    }

    /// Stable string form, also used as the persisted column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::C1 => "C1",
            Self::C2 => "C2",
            Self::C3 => "C3",
            Self::C4 => "C4",
            Self::C5 => "C5",
            Self::C6 => "C6",
        }
    }
}

impl fmt::Display for CycleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown cycle name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cycle '{0}': expected one of C1, C2, C3, C4, C5, C6")]
pub struct ParseCycleError(pub String);

impl FromStr for CycleKey {
    type Err = ParseCycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C1" => Ok(Self::C1),
            "C2" => Ok(Self::C2),
            "C3" => Ok(Self::C3),
            "C4" => Ok(Self::C4),
            "C5" => Ok(Self::C5),
            "C6" => Ok(Self::C6),
            _ => Err(ParseCycleError(s.to_string())),
        }
    }
}

/// Identifies one snapshot row: a group paired with one of its cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub group: String,
    pub cycle: CycleKey,
}

impl SnapshotKey {
    pub fn new(group: impl Into<String>, cycle: CycleKey) -> Self {
        Self {
            group: group.into(),
            cycle,
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.cycle)
    }
}

/// Read-only view of an upstream work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    #[serde(default)]
    pub labels: BTreeSet<LabelId>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// True when the item is done and its completion time is at or before
    /// `cutoff`. Done items without a completion time never count.
    #[must_use]
    pub fn completed_by(&self, cutoff: DateTime<Utc>) -> bool {
        self.done && self.completed_at.is_some_and(|at| at <= cutoff)
    }
}
