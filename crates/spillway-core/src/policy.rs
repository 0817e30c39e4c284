//! Freeze policy: when a cycle's snapshot may be refreshed, and when it
//! must be frozen.
//!
//! Cycles up to and including the threshold `T` share one grace window that
//! ends with `T`, so late labels can still land on any early cycle. Each
//! cycle after `T` governs its own window. Both predicates are pure; the
//! calculator evaluates them on every run, which is what makes a cycle
//! freeze on the first run after its window closes.

use chrono::{DateTime, Utc};

use crate::calendar::Calendar;
use crate::model::CycleKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezePolicy {
    threshold: CycleKey,
}

impl Default for FreezePolicy {
    fn default() -> Self {
        Self::new(CycleKey::C2)
    }
}

impl FreezePolicy {
    #[must_use]
    pub const fn new(threshold: CycleKey) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub const fn threshold(self) -> CycleKey {
        self.threshold
    }

    /// Last instant at which `cycle`'s snapshot still accepts refreshes.
    #[must_use]
    pub const fn window_end(self, calendar: &Calendar, cycle: CycleKey) -> DateTime<Utc> {
        if cycle.index() <= self.threshold.index() {
            calendar.end(self.threshold)
        } else {
            calendar.end(cycle)
        }
    }

    #[must_use]
    pub fn should_allow_refresh(self, calendar: &Calendar, cycle: CycleKey, now: DateTime<Utc>) -> bool {
        now <= self.window_end(calendar, cycle)
    }

    #[must_use]
    pub fn should_freeze_now(self, calendar: &Calendar, cycle: CycleKey, now: DateTime<Utc>) -> bool {
        now > self.window_end(calendar, cycle)
    }
}

/// A cycle is active until (and including) its own end instant.
#[must_use]
pub fn is_cycle_active(calendar: &Calendar, cycle: CycleKey, now: DateTime<Utc>) -> bool {
    now <= calendar.end(cycle)
}
