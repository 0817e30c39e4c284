//! Persistent committed-set snapshots per (group, cycle).
//!
//! The [`SnapshotStore`] owns the `snapshots` / `snapshot_meta` tables and
//! enforces the snapshot lifecycle:
//!
//! - the first observation of a key creates it with the full live set,
//!   whether or not refreshes are currently allowed;
//! - later observations apply a minimal diff (insert new ids, delete ids no
//!   longer live) while the key is open for refresh;
//! - [`SnapshotStore::freeze`] flips `frozen` once, after which membership
//!   and `committed_count` never change.
//!
//! # Transactions
//!
//! Every mutation runs in one `BEGIN IMMEDIATE` transaction holding the
//! store's connection mutex, so writes are serialized and the member diff
//! and the metadata update commit (or roll back) together.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

use crate::error::ErrorCode;
use crate::model::{CycleKey, ItemId, SnapshotKey};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Metadata row for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotMeta {
    pub frozen: bool,
    pub frozen_at: Option<DateTime<Utc>>,
    /// Last time the key was observed, even when nothing changed.
    pub last_refresh_at: DateTime<Utc>,
    pub committed_count: usize,
}

/// Why an upsert left an existing snapshot untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Frozen,
    RefreshClosed,
}

/// What an [`SnapshotStore::upsert`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { committed: usize },
    Refreshed {
        added: usize,
        removed: usize,
        committed: usize,
    },
    Skipped { reason: SkipReason },
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("snapshot store lock poisoned")]
    Poisoned,
    #[error("snapshot {key}: stored timestamp {micros} is out of range")]
    InvalidTimestamp { key: SnapshotKey, micros: i64 },
    #[error("snapshot {key}: stored value is corrupt ({detail})")]
    Corrupt { key: SnapshotKey, detail: String },
}

impl SnapshotError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Sqlite(_) | Self::Poisoned => ErrorCode::SnapshotWriteFailed,
            Self::InvalidTimestamp { .. } | Self::Corrupt { .. } => ErrorCode::SnapshotReadFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Durable committed-set store backed by SQLite.
#[derive(Debug)]
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

impl SnapshotStore {
    /// Wrap an already-migrated connection.
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Open (creating and migrating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::new(crate::db::open_store_db(path)?))
    }

    /// Open a fresh in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be migrated.
    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(crate::db::open_in_memory()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SnapshotError> {
        self.conn.lock().map_err(|_| SnapshotError::Poisoned)
    }

    /// Committed item ids for `key`; empty when never observed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_members(&self, key: &SnapshotKey) -> Result<BTreeSet<ItemId>, SnapshotError> {
        let conn = self.lock()?;
        read_members(&conn, key)
    }

    /// Metadata for `key`, or `None` when never observed.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is corrupt.
    pub fn get_meta(&self, key: &SnapshotKey) -> Result<Option<SnapshotMeta>, SnapshotError> {
        let conn = self.lock()?;
        read_meta(&conn, key)
    }

    /// Every snapshot's metadata, ordered by group then cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is corrupt.
    pub fn list_meta(&self) -> Result<Vec<(SnapshotKey, SnapshotMeta)>, SnapshotError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT group_name, cycle, frozen, frozen_at_us, last_refresh_at_us, committed_count
             FROM snapshot_meta
             ORDER BY group_name, cycle",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    RawMeta::from_row(row, 2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(group, cycle, raw)| {
                let cycle = parse_cycle(&group, &cycle)?;
                let key = SnapshotKey::new(group, cycle);
                let meta = raw.into_meta(&key)?;
                Ok((key, meta))
            })
            .collect()
    }

    /// Record the live committed set for `key`.
    ///
    /// - absent key: created with exactly `live`, regardless of
    ///   `allow_refresh`;
    /// - frozen, or `allow_refresh == false`: no-op;
    /// - otherwise: minimal diff towards `live`, then `last_refresh_at = now`
    ///   and `committed_count = |live|`, even when the diff is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is applied in that
    /// case.
    pub fn upsert(
        &self,
        key: &SnapshotKey,
        live: &BTreeSet<ItemId>,
        allow_refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, SnapshotError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outcome = match read_meta(&tx, key)? {
            None => {
                tx.execute(
                    "INSERT INTO snapshot_meta (
                        group_name, cycle, frozen, frozen_at_us, last_refresh_at_us, committed_count
                     ) VALUES (?1, ?2, 0, NULL, ?3, ?4)",
                    params![
                        key.group,
                        key.cycle.as_str(),
                        now.timestamp_micros(),
                        count_to_sql(live.len()),
                    ],
                )?;
                insert_members(&tx, key, live.iter())?;
                UpsertOutcome::Created {
                    committed: live.len(),
                }
            }
            Some(meta) if meta.frozen => UpsertOutcome::Skipped {
                reason: SkipReason::Frozen,
            },
            Some(_) if !allow_refresh => UpsertOutcome::Skipped {
                reason: SkipReason::RefreshClosed,
            },
            Some(_) => {
                let current = read_members(&tx, key)?;
                let to_remove: Vec<&ItemId> = current.difference(live).collect();
                let to_add: Vec<&ItemId> = live.difference(&current).collect();

                delete_members(&tx, key, to_remove.iter().copied())?;
                insert_members(&tx, key, to_add.iter().copied())?;
                tx.execute(
                    "UPDATE snapshot_meta
                     SET last_refresh_at_us = ?1, committed_count = ?2
                     WHERE group_name = ?3 AND cycle = ?4",
                    params![
                        now.timestamp_micros(),
                        count_to_sql(live.len()),
                        key.group,
                        key.cycle.as_str(),
                    ],
                )?;
                UpsertOutcome::Refreshed {
                    added: to_add.len(),
                    removed: to_remove.len(),
                    committed: live.len(),
                }
            }
        };

        if matches!(outcome, UpsertOutcome::Skipped { .. }) {
            // Nothing written; dropping the transaction rolls back.
            tracing::trace!(snapshot = %key, ?outcome, "snapshot upsert skipped");
            return Ok(outcome);
        }

        tx.commit()?;
        match outcome {
            UpsertOutcome::Created { committed } => {
                tracing::info!(group = %key.group, cycle = %key.cycle, committed, "snapshot created");
            }
            UpsertOutcome::Refreshed {
                added, removed, committed,
            } => {
                tracing::debug!(
                    group = %key.group,
                    cycle = %key.cycle,
                    added,
                    removed,
                    committed,
                    "snapshot refreshed"
                );
            }
            UpsertOutcome::Skipped { .. } => {}
        }
        Ok(outcome)
    }

    /// Freeze `key` permanently. Returns `true` only for the call that
    /// performed the transition; absent or already-frozen keys are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn freeze(&self, key: &SnapshotKey, now: DateTime<Utc>) -> Result<bool, SnapshotError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE snapshot_meta
             SET frozen = 1, frozen_at_us = ?1
             WHERE group_name = ?2 AND cycle = ?3 AND frozen = 0",
            params![now.timestamp_micros(), key.group, key.cycle.as_str()],
        )?;
        tx.commit()?;

        if changed > 0 {
            tracing::info!(group = %key.group, cycle = %key.cycle, "snapshot frozen");
        }
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

struct RawMeta {
    frozen: bool,
    frozen_at_us: Option<i64>,
    last_refresh_at_us: i64,
    committed_count: i64,
}

impl RawMeta {
    fn from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            frozen: row.get::<_, i64>(offset)? != 0,
            frozen_at_us: row.get(offset + 1)?,
            last_refresh_at_us: row.get(offset + 2)?,
            committed_count: row.get(offset + 3)?,
        })
    }

    fn into_meta(self, key: &SnapshotKey) -> Result<SnapshotMeta, SnapshotError> {
        let to_ts = |micros: i64| {
            DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
                SnapshotError::InvalidTimestamp {
                    key: key.clone(),
                    micros,
                }
            })
        };
        let committed_count =
            usize::try_from(self.committed_count).map_err(|_| SnapshotError::Corrupt {
                key: key.clone(),
                detail: format!("negative committed_count {}", self.committed_count),
            })?;
        Ok(SnapshotMeta {
            frozen: self.frozen,
            frozen_at: self.frozen_at_us.map(to_ts).transpose()?,
            last_refresh_at: to_ts(self.last_refresh_at_us)?,
            committed_count,
        })
    }
}

fn read_meta(conn: &Connection, key: &SnapshotKey) -> Result<Option<SnapshotMeta>, SnapshotError> {
    let raw = conn
        .query_row(
            "SELECT frozen, frozen_at_us, last_refresh_at_us, committed_count
             FROM snapshot_meta
             WHERE group_name = ?1 AND cycle = ?2",
            params![key.group, key.cycle.as_str()],
            |row| RawMeta::from_row(row, 0),
        )
        .optional()?;
    raw.map(|raw| raw.into_meta(key)).transpose()
}

fn read_members(conn: &Connection, key: &SnapshotKey) -> Result<BTreeSet<ItemId>, SnapshotError> {
    let mut stmt = conn.prepare_cached(
        "SELECT item_id FROM snapshots WHERE group_name = ?1 AND cycle = ?2",
    )?;
    let members = stmt
        .query_map(params![key.group, key.cycle.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(members)
}

fn insert_members<'a>(
    conn: &Connection,
    key: &SnapshotKey,
    ids: impl Iterator<Item = &'a ItemId>,
) -> Result<(), SnapshotError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO snapshots (group_name, cycle, item_id) VALUES (?1, ?2, ?3)",
    )?;
    for id in ids {
        stmt.execute(params![key.group, key.cycle.as_str(), id])?;
    }
    Ok(())
}

fn delete_members<'a>(
    conn: &Connection,
    key: &SnapshotKey,
    ids: impl Iterator<Item = &'a ItemId>,
) -> Result<(), SnapshotError> {
    let mut stmt = conn.prepare_cached(
        "DELETE FROM snapshots WHERE group_name = ?1 AND cycle = ?2 AND item_id = ?3",
    )?;
    for id in ids {
        stmt.execute(params![key.group, key.cycle.as_str(), id])?;
    }
    Ok(())
}

fn parse_cycle(group: &str, raw: &str) -> Result<CycleKey, SnapshotError> {
    raw.parse().map_err(|_| SnapshotError::Corrupt {
        key: SnapshotKey::new(group, CycleKey::C1),
        detail: format!("unknown cycle '{raw}'"),
    })
}

fn count_to_sql(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).single().expect("valid ts")
    }

    fn ids(raw: &[&str]) -> BTreeSet<ItemId> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    fn store() -> SnapshotStore {
        SnapshotStore::in_memory().expect("in-memory store")
    }

    fn alpha(cycle: CycleKey) -> SnapshotKey {
        SnapshotKey::new("Alpha", cycle)
    }

    #[test]
    fn unknown_key_is_empty() {
        let store = store();
        let key = alpha(CycleKey::C1);
        assert!(store.get_members(&key).expect("members").is_empty());
        assert!(store.get_meta(&key).expect("meta").is_none());
    }

    #[test]
    fn first_upsert_creates_even_when_refresh_closed() {
        let store = store();
        let key = alpha(CycleKey::C1);

        let outcome = store
            .upsert(&key, &ids(&["A", "B", "C"]), false, ts(10))
            .expect("upsert");
        assert_eq!(outcome, UpsertOutcome::Created { committed: 3 });

        let meta = store.get_meta(&key).expect("meta").expect("present");
        assert!(!meta.frozen);
        assert_eq!(meta.frozen_at, None);
        assert_eq!(meta.last_refresh_at, ts(10));
        assert_eq!(meta.committed_count, 3);
        assert_eq!(store.get_members(&key).expect("members"), ids(&["A", "B", "C"]));
    }

    #[test]
    fn refresh_replaces_set_with_minimal_diff() {
        let store = store();
        let key = alpha(CycleKey::C3);
        store.upsert(&key, &ids(&["A", "B", "C"]), true, ts(1)).expect("create");

        let outcome = store
            .upsert(&key, &ids(&["B", "C", "D", "E"]), true, ts(2))
            .expect("refresh");
        assert_eq!(
            outcome,
            UpsertOutcome::Refreshed {
                added: 2,
                removed: 1,
                committed: 4
            }
        );
        assert_eq!(store.get_members(&key).expect("members"), ids(&["B", "C", "D", "E"]));
        assert_eq!(store.get_meta(&key).expect("meta").expect("present").committed_count, 4);
    }

    #[test]
    fn identical_refresh_only_touches_timestamp() {
        let store = store();
        let key = alpha(CycleKey::C2);
        let live = ids(&["A", "B"]);
        store.upsert(&key, &live, true, ts(1)).expect("create");

        let outcome = store.upsert(&key, &live, true, ts(2)).expect("refresh");
        assert_eq!(
            outcome,
            UpsertOutcome::Refreshed {
                added: 0,
                removed: 0,
                committed: 2
            }
        );
        let meta = store.get_meta(&key).expect("meta").expect("present");
        assert_eq!(meta.last_refresh_at, ts(2));
        assert_eq!(meta.committed_count, 2);
    }

    #[test]
    fn closed_refresh_window_is_noop() {
        let store = store();
        let key = alpha(CycleKey::C1);
        store.upsert(&key, &ids(&["A"]), true, ts(1)).expect("create");

        let outcome = store.upsert(&key, &ids(&["A", "B"]), false, ts(2)).expect("upsert");
        assert_eq!(
            outcome,
            UpsertOutcome::Skipped {
                reason: SkipReason::RefreshClosed
            }
        );
        let meta = store.get_meta(&key).expect("meta").expect("present");
        assert_eq!(meta.last_refresh_at, ts(1));
        assert_eq!(store.get_members(&key).expect("members"), ids(&["A"]));
    }

    #[test]
    fn frozen_snapshot_never_changes() {
        let store = store();
        let key = alpha(CycleKey::C1);
        store.upsert(&key, &ids(&["A", "B"]), true, ts(1)).expect("create");

        assert!(store.freeze(&key, ts(5)).expect("freeze"));
        assert!(!store.freeze(&key, ts(6)).expect("second freeze is a no-op"));

        let outcome = store.upsert(&key, &ids(&["Z"]), true, ts(7)).expect("upsert");
        assert_eq!(
            outcome,
            UpsertOutcome::Skipped {
                reason: SkipReason::Frozen
            }
        );

        let meta = store.get_meta(&key).expect("meta").expect("present");
        assert!(meta.frozen);
        assert_eq!(meta.frozen_at, Some(ts(5)));
        assert_eq!(meta.committed_count, 2);
        assert_eq!(store.get_members(&key).expect("members"), ids(&["A", "B"]));
    }

    #[test]
    fn freeze_of_absent_key_is_noop() {
        let store = store();
        let key = alpha(CycleKey::C4);
        assert!(!store.freeze(&key, ts(1)).expect("freeze"));
        assert!(store.get_meta(&key).expect("meta").is_none());
    }

    #[test]
    fn empty_live_set_creates_empty_snapshot() {
        let store = store();
        let key = alpha(CycleKey::C6);
        store.upsert(&key, &BTreeSet::new(), true, ts(1)).expect("create");
        let meta = store.get_meta(&key).expect("meta").expect("present");
        assert_eq!(meta.committed_count, 0);
    }

    #[test]
    fn keys_are_isolated() {
        let store = store();
        store.upsert(&alpha(CycleKey::C1), &ids(&["A"]), true, ts(1)).expect("c1");
        store.upsert(&alpha(CycleKey::C2), &ids(&["B"]), true, ts(1)).expect("c2");
        store
            .upsert(&SnapshotKey::new("alpha", CycleKey::C1), &ids(&["C"]), true, ts(1))
            .expect("lowercase group");
        store.freeze(&alpha(CycleKey::C1), ts(2)).expect("freeze c1");

        store.upsert(&alpha(CycleKey::C2), &ids(&["B", "D"]), true, ts(3)).expect("refresh c2");
        assert_eq!(store.get_members(&alpha(CycleKey::C1)).expect("c1"), ids(&["A"]));
        assert_eq!(store.get_members(&alpha(CycleKey::C2)).expect("c2"), ids(&["B", "D"]));

        let listed = store.list_meta().expect("list");
        let keys: Vec<String> = listed.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["Alpha/C1", "Alpha/C2", "alpha/C1"]);
        assert!(listed[0].1.frozen);
        assert!(!listed[1].1.frozen);
    }

    #[test]
    fn concurrent_writers_keep_count_in_sync() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = std::sync::Arc::new(
            SnapshotStore::open(&dir.path().join("snapshots.db")).expect("open store"),
        );
        let key = alpha(CycleKey::C3);
        store.upsert(&key, &BTreeSet::new(), true, ts(1)).expect("create");

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = std::sync::Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    for round in 0..10 {
                        let live: BTreeSet<ItemId> =
                            (0..(worker + round) % 7).map(|i| format!("item-{i}")).collect();
                        store
                            .upsert(&key, &live, true, ts(2) + Duration::seconds(round))
                            .expect("upsert");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let meta = store.get_meta(&key).expect("meta").expect("present");
        let members = store.get_members(&key).expect("members");
        assert_eq!(meta.committed_count, members.len());
    }
}
