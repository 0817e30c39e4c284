//! Per-cycle delivery KPIs.
//!
//! For every (group, cycle) the [`KpiCalculator`]:
//!
//! 1. fetches the group's items carrying the cycle label, minus cancelled
//!    ones (the live committed set);
//! 2. hands the live set to the [`SnapshotStore`], refreshing only while the
//!    [`FreezePolicy`] allows it;
//! 3. freezes the snapshot once the policy window has closed;
//! 4. measures completion of the *stored* committed set, so relabeling
//!    after the freeze cannot rewrite history.
//!
//! Failures are contained per unit: a group without a calendar is skipped,
//! an unresolvable cycle label yields zero counts plus a warning, and an
//! upstream or store error is attached to that cycle's result while the rest
//! of the run proceeds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use crate::calendar::{Calendar, CalendarSet};
use crate::config::{LabelConfig, SpillwayConfig};
use crate::model::{CycleKey, ItemId, SnapshotKey, WorkItem};
use crate::policy::{FreezePolicy, is_cycle_active};
use crate::snapshot::{SnapshotStore, UpsertOutcome};
use crate::upstream::Upstream;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Delivery metrics for one (group, cycle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleKpi {
    pub cycle: CycleKey,
    pub committed: usize,
    /// Completed-so-far while active, completed-by-end once closed.
    pub completed: usize,
    pub delivery_pct: u32,
    pub spillover: usize,
    pub active: bool,
    pub frozen: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<UpsertOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleKpi {
    fn empty(cycle: CycleKey, active: bool) -> Self {
        Self {
            cycle,
            committed: 0,
            completed: 0,
            delivery_pct: 0,
            spillover: 0,
            active,
            frozen: false,
            snapshot: None,
            error: None,
        }
    }
}

/// All cycles of one group, plus what went wrong along the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    /// Cycle the report headlines (configured, or the one in progress).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headline: Option<CycleKey>,
    pub cycles: Vec<CycleKpi>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl GroupReport {
    fn skipped(group: &str, reason: String) -> Self {
        Self {
            group: group.to_string(),
            skipped: Some(reason),
            headline: None,
            cycles: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn cycle(&self, cycle: CycleKey) -> Option<&CycleKpi> {
        self.cycles.iter().find(|kpi| kpi.cycle == cycle)
    }

    #[must_use]
    pub fn headline_kpi(&self) -> Option<&CycleKpi> {
        self.headline.and_then(|cycle| self.cycle(cycle))
    }
}

/// Result of one calculator run across groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub freeze_threshold: CycleKey,
    pub groups: Vec<GroupReport>,
}

impl RunReport {
    /// True when any group recorded an error or was skipped.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.groups
            .iter()
            .any(|g| g.skipped.is_some() || !g.errors.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Raw counts for one cycle, before display selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub committed: usize,
    pub completed_by_end: usize,
    pub completed_so_far: usize,
}

impl DeliveryCounts {
    /// Count committed items completed by the cycle end and by `now`.
    /// Items missing from `completion` count as not completed.
    #[must_use]
    pub fn measure(
        committed: &BTreeSet<ItemId>,
        completion: &HashMap<ItemId, WorkItem>,
        cycle_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut counts = Self {
            committed: committed.len(),
            completed_by_end: 0,
            completed_so_far: 0,
        };
        for item in committed.iter().filter_map(|id| completion.get(id)) {
            if item.completed_by(cycle_end) {
                counts.completed_by_end += 1;
            }
            if item.completed_by(now) {
                counts.completed_so_far += 1;
            }
        }
        counts
    }

    /// Committed work not delivered by the end of a closed cycle. Always
    /// zero while the cycle is active.
    #[must_use]
    pub const fn spillover(self, active: bool) -> usize {
        if active {
            0
        } else {
            self.committed.saturating_sub(self.completed_by_end)
        }
    }

    #[must_use]
    pub const fn completed_for_display(self, active: bool) -> usize {
        if active {
            self.completed_so_far
        } else {
            self.completed_by_end
        }
    }

    /// `round(100 * completed / committed)`, 0 when nothing was committed.
    #[must_use]
    pub fn delivery_pct(self, active: bool) -> u32 {
        let completed = self.completed_for_display(active) as u128;
        let committed = self.committed as u128;
        if committed == 0 {
            return 0;
        }
        let rounded = (200 * completed + committed) / (2 * committed);
        u32::try_from(rounded).unwrap_or(u32::MAX)
    }
}

// ---------------------------------------------------------------------------
// KpiCalculator
// ---------------------------------------------------------------------------

pub struct KpiCalculator<U> {
    upstream: U,
    store: Arc<SnapshotStore>,
    calendars: CalendarSet,
    policy: FreezePolicy,
    labels: LabelConfig,
    headline: Option<CycleKey>,
}

impl<U: Upstream> KpiCalculator<U> {
    pub fn new(
        upstream: U,
        store: Arc<SnapshotStore>,
        calendars: CalendarSet,
        config: &SpillwayConfig,
    ) -> Self {
        Self {
            upstream,
            store,
            calendars,
            policy: FreezePolicy::new(config.policy.freeze_threshold),
            labels: config.labels.clone(),
            headline: config.report.headline_cycle,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> FreezePolicy {
        self.policy
    }

    #[must_use]
    pub const fn calendars(&self) -> &CalendarSet {
        &self.calendars
    }

    #[must_use]
    pub const fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Compute every group that has a calendar.
    pub async fn run_all(&self, now: DateTime<Utc>) -> RunReport {
        let groups: Vec<String> = self.calendars.groups().map(str::to_string).collect();
        self.run(&groups, now).await
    }

    /// Compute the named groups concurrently. Never fails as a whole.
    pub async fn run(&self, groups: &[String], now: DateTime<Utc>) -> RunReport {
        let reports = join_all(groups.iter().map(|group| self.compute_group(group, now))).await;
        RunReport {
            generated_at: now,
            freeze_threshold: self.policy.threshold(),
            groups: reports,
        }
    }

    pub async fn compute_group(&self, group: &str, now: DateTime<Utc>) -> GroupReport {
        let Some(calendar) = self.calendars.get(group) else {
            tracing::warn!(group, "no calendar entry for group; skipping");
            return GroupReport::skipped(group, format!("group '{group}' has no calendar entry"));
        };

        let mut warnings = Vec::new();
        let cancelled = match self.upstream.resolve_label(&self.labels.cancelled).await {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                warnings.push(format!(
                    "cancelled label '{}' not found upstream; no items excluded",
                    self.labels.cancelled
                ));
                None
            }
            Err(err) => {
                // Without the exclusion filter any write could persist
                // cancelled items, so the whole group waits for the next run.
                tracing::warn!(group, error = %err, "cancelled label resolution failed");
                return self.unresolved_group(group, calendar, &err.to_string(), now);
            }
        };

        let units = join_all(CycleKey::ALL.into_iter().map(|cycle| {
            self.compute_cycle(group, calendar, cycle, cancelled.as_deref(), now)
        }))
        .await;

        let mut cycles = Vec::with_capacity(units.len());
        let mut errors = Vec::new();
        for unit in units {
            warnings.extend(unit.warnings);
            if let Some(err) = &unit.kpi.error {
                errors.push(format!("{}: {err}", unit.kpi.cycle));
            }
            cycles.push(unit.kpi);
        }

        tracing::debug!(
            group,
            warnings = warnings.len(),
            errors = errors.len(),
            "group KPIs computed"
        );

        GroupReport {
            group: group.to_string(),
            skipped: None,
            headline: Some(self.headline.unwrap_or_else(|| calendar.current_cycle(now))),
            cycles,
            warnings,
            errors,
        }
    }

    fn unresolved_group(
        &self,
        group: &str,
        calendar: &Calendar,
        reason: &str,
        now: DateTime<Utc>,
    ) -> GroupReport {
        let message = format!("cancelled label '{}': {reason}", self.labels.cancelled);
        let cycles: Vec<CycleKpi> = CycleKey::ALL
            .into_iter()
            .map(|cycle| CycleKpi {
                error: Some(message.clone()),
                ..CycleKpi::empty(cycle, is_cycle_active(calendar, cycle, now))
            })
            .collect();
        let errors = cycles
            .iter()
            .map(|kpi| format!("{}: {message}", kpi.cycle))
            .collect();
        GroupReport {
            group: group.to_string(),
            skipped: None,
            headline: Some(self.headline.unwrap_or_else(|| calendar.current_cycle(now))),
            cycles,
            warnings: Vec::new(),
            errors,
        }
    }

    async fn compute_cycle(
        &self,
        group: &str,
        calendar: &Calendar,
        cycle: CycleKey,
        cancelled: Option<&str>,
        now: DateTime<Utc>,
    ) -> CycleUnit {
        let active = is_cycle_active(calendar, cycle, now);
        let mut unit = CycleUnit {
            kpi: CycleKpi::empty(cycle, active),
            warnings: Vec::new(),
        };

        let label_name = self.labels.cycle_label(cycle);
        let label = match self.upstream.resolve_label(&label_name).await {
            Ok(Some(label)) => label,
            Ok(None) => {
                tracing::warn!(group, %cycle, label = %label_name, "cycle label not found upstream");
                unit.warnings.push(format!(
                    "{cycle}: label '{label_name}' not found upstream; committed counted as 0"
                ));
                return unit;
            }
            Err(err) => {
                tracing::warn!(group, %cycle, error = %err, "cycle label resolution failed");
                unit.kpi.error = Some(err.to_string());
                return unit;
            }
        };

        let fetched = match self.upstream.fetch_items(group, &label).await {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(group, %cycle, error = %err, "upstream fetch failed");
                unit.kpi.error = Some(err.to_string());
                return unit;
            }
        };

        if let Err(err) = self
            .settle_snapshot(group, calendar, cycle, cancelled, &fetched, now, &mut unit)
            .await
        {
            tracing::warn!(group, %cycle, error = %err, "snapshot update failed");
            unit.kpi.error = Some(err);
        }
        unit
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_snapshot(
        &self,
        group: &str,
        calendar: &Calendar,
        cycle: CycleKey,
        cancelled: Option<&str>,
        fetched: &[WorkItem],
        now: DateTime<Utc>,
        unit: &mut CycleUnit,
    ) -> Result<(), String> {
        let key = SnapshotKey::new(group, cycle);
        let live: BTreeSet<ItemId> = fetched
            .iter()
            .filter(|item| cancelled.is_none_or(|label| !item.has_label(label)))
            .map(|item| item.id.clone())
            .collect();

        let allow_refresh = self.policy.should_allow_refresh(calendar, cycle, now);
        let outcome = self
            .store
            .upsert(&key, &live, allow_refresh, now)
            .map_err(|err| err.to_string())?;
        unit.kpi.snapshot = Some(outcome);

        if self.policy.should_freeze_now(calendar, cycle, now) {
            self.store.freeze(&key, now).map_err(|err| err.to_string())?;
        }

        let committed = self.store.get_members(&key).map_err(|err| err.to_string())?;
        let frozen = self
            .store
            .get_meta(&key)
            .map_err(|err| err.to_string())?
            .is_some_and(|meta| meta.frozen);

        let mut completion: HashMap<ItemId, WorkItem> = fetched
            .iter()
            .map(|item| (item.id.clone(), item.clone()))
            .collect();
        if committed.iter().any(|id| !completion.contains_key(id)) {
            // Committed items that lost the cycle label still have a
            // completion state upstream.
            match self.upstream.fetch_group_items(group).await {
                Ok(items) => {
                    for item in items {
                        completion.entry(item.id.clone()).or_insert(item);
                    }
                }
                Err(err) => unit.warnings.push(format!(
                    "{cycle}: completion lookup failed ({err}); missing items counted as not done"
                )),
            }
        }

        let counts = DeliveryCounts::measure(&committed, &completion, calendar.end(cycle), now);
        let active = unit.kpi.active;
        unit.kpi.committed = counts.committed;
        unit.kpi.completed = counts.completed_for_display(active);
        unit.kpi.delivery_pct = counts.delivery_pct(active);
        unit.kpi.spillover = counts.spillover(active);
        unit.kpi.frozen = frozen;
        Ok(())
    }
}

struct CycleUnit {
    kpi: CycleKpi,
    warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).single().expect("valid ts")
    }

    fn item(id: &str, completed_day: Option<u32>) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            labels: BTreeSet::new(),
            done: completed_day.is_some(),
            completed_at: completed_day.map(ts),
        }
    }

    fn completion(items: &[WorkItem]) -> HashMap<ItemId, WorkItem> {
        items.iter().map(|i| (i.id.clone(), i.clone())).collect()
    }

    fn ids(raw: &[&str]) -> BTreeSet<ItemId> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn measure_splits_by_end_and_now() {
        let items = [item("A", Some(10)), item("B", Some(20)), item("C", None), item("X", Some(1))];
        let counts = DeliveryCounts::measure(&ids(&["A", "B", "C", "D"]), &completion(&items), ts(15), ts(25));
        assert_eq!(counts.committed, 4);
        assert_eq!(counts.completed_by_end, 1);
        assert_eq!(counts.completed_so_far, 2);
    }

    #[test]
    fn active_cycle_has_no_spillover() {
        let counts = DeliveryCounts {
            committed: 5,
            completed_by_end: 1,
            completed_so_far: 2,
        };
        assert_eq!(counts.spillover(true), 0);
        assert_eq!(counts.completed_for_display(true), 2);
        assert_eq!(counts.delivery_pct(true), 40);

        assert_eq!(counts.spillover(false), 4);
        assert_eq!(counts.completed_for_display(false), 1);
        assert_eq!(counts.delivery_pct(false), 20);
    }

    #[test]
    fn delivery_pct_rounds_half_up() {
        let counts = DeliveryCounts {
            committed: 3,
            completed_by_end: 2,
            completed_so_far: 1,
        };
        assert_eq!(counts.delivery_pct(false), 67);
        assert_eq!(counts.delivery_pct(true), 33);

        let half = DeliveryCounts {
            committed: 8,
            completed_by_end: 1,
            completed_so_far: 1,
        };
        // 12.5% rounds to 13
        assert_eq!(half.delivery_pct(false), 13);
    }

    #[test]
    fn zero_committed_is_zero_pct() {
        let counts = DeliveryCounts {
            committed: 0,
            completed_by_end: 0,
            completed_so_far: 0,
        };
        assert_eq!(counts.delivery_pct(false), 0);
        assert_eq!(counts.spillover(false), 0);
    }
}
