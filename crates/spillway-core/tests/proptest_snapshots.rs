//! Property tests for snapshot store transitions.
//!
//! Sequences of observations are generated as (live set, refresh allowed,
//! freeze after) steps and replayed against an in-memory store while a plain
//! model tracks the expected committed set.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use spillway_core::model::{CycleKey, SnapshotKey};
use spillway_core::snapshot::{SkipReason, SnapshotStore, UpsertOutcome};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_live() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(prop::sample::select(vec!["A", "B", "C", "D", "E", "F"]), 0..6)
        .prop_map(|ids| ids.into_iter().map(str::to_string).collect())
}

#[derive(Debug, Clone)]
struct Step {
    live: BTreeSet<String>,
    allow_refresh: bool,
    freeze_after: bool,
}

fn arb_step() -> impl Strategy<Value = Step> {
    (arb_live(), any::<bool>(), prop::bool::weighted(0.15)).prop_map(
        |(live, allow_refresh, freeze_after)| Step {
            live,
            allow_refresh,
            freeze_after,
        },
    )
}

fn ts(step: usize) -> DateTime<Utc> {
    let secs = 1_767_225_600 + i64::try_from(step).unwrap_or(0) * 3600;
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

fn key() -> SnapshotKey {
    SnapshotKey::new("Alpha", CycleKey::C1)
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// The first observation is stored verbatim no matter what the policy says.
    #[test]
    fn first_observation_is_stored(live in arb_live(), allow in any::<bool>()) {
        let store = SnapshotStore::in_memory().expect("store");
        let outcome = store.upsert(&key(), &live, allow, ts(0)).expect("upsert");

        prop_assert_eq!(outcome, UpsertOutcome::Created { committed: live.len() });
        prop_assert_eq!(store.get_members(&key()).expect("members"), live);
    }

    /// Store contents follow a simple model: refreshes replace the set, closed
    /// windows and frozen snapshots leave it alone.
    #[test]
    fn store_matches_model(steps in prop::collection::vec(arb_step(), 1..20)) {
        let store = SnapshotStore::in_memory().expect("store");
        let mut model: Option<BTreeSet<String>> = None;
        let mut frozen = false;

        for (i, step) in steps.iter().enumerate() {
            let outcome = store
                .upsert(&key(), &step.live, step.allow_refresh, ts(i))
                .expect("upsert");

            match model.as_mut() {
                None => {
                    prop_assert!(
                        matches!(outcome, UpsertOutcome::Created { .. }),
                        "first upsert returned {:?}",
                        outcome
                    );
                    model = Some(step.live.clone());
                }
                Some(_) if frozen => {
                    prop_assert_eq!(outcome, UpsertOutcome::Skipped { reason: SkipReason::Frozen });
                }
                Some(_) if !step.allow_refresh => {
                    prop_assert_eq!(
                        outcome,
                        UpsertOutcome::Skipped { reason: SkipReason::RefreshClosed }
                    );
                }
                Some(current) => {
                    let added = step.live.difference(current).count();
                    let removed = current.difference(&step.live).count();
                    prop_assert_eq!(
                        outcome,
                        UpsertOutcome::Refreshed { added, removed, committed: step.live.len() }
                    );
                    *current = step.live.clone();
                }
            }

            if step.freeze_after {
                let transitioned = store.freeze(&key(), ts(i)).expect("freeze");
                prop_assert_eq!(transitioned, !frozen);
                frozen = true;
            }

            let expected = model.clone().unwrap_or_default();
            prop_assert_eq!(store.get_members(&key()).expect("members"), expected.clone());
            let meta = store.get_meta(&key()).expect("meta").expect("present");
            prop_assert_eq!(meta.frozen, frozen);
            prop_assert_eq!(meta.committed_count, expected.len());
        }
    }

    /// Once frozen, neither membership nor freeze metadata changes again.
    #[test]
    fn freeze_is_permanent(
        initial in arb_live(),
        later in prop::collection::vec(arb_live(), 1..10),
    ) {
        let store = SnapshotStore::in_memory().expect("store");
        store.upsert(&key(), &initial, true, ts(0)).expect("create");
        prop_assert!(store.freeze(&key(), ts(1)).expect("freeze"));
        let frozen_meta = store.get_meta(&key()).expect("meta").expect("present");

        for (i, live) in later.iter().enumerate() {
            store.upsert(&key(), live, true, ts(i + 2)).expect("upsert");
            prop_assert!(!store.freeze(&key(), ts(i + 2)).expect("refreeze"));
        }

        prop_assert_eq!(store.get_members(&key()).expect("members"), initial);
        prop_assert_eq!(store.get_meta(&key()).expect("meta"), Some(frozen_meta));
    }
}
