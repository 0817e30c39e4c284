//! Canonical SQLite schema for the snapshot store.
//!
//! - `snapshots` holds committed-set membership, one row per member item
//! - `snapshot_meta` holds the per-(group, cycle) freeze flag, timestamps,
//!   and cached member count
//! - `store_meta` tracks the schema version

/// Migration v1: membership and metadata tables.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS snapshot_meta (
    group_name TEXT NOT NULL CHECK (length(group_name) > 0),
    cycle TEXT NOT NULL CHECK (cycle IN ('C1', 'C2', 'C3', 'C4', 'C5', 'C6')),
    frozen INTEGER NOT NULL DEFAULT 0 CHECK (frozen IN (0, 1)),
    frozen_at_us INTEGER,
    last_refresh_at_us INTEGER NOT NULL,
    committed_count INTEGER NOT NULL DEFAULT 0 CHECK (committed_count >= 0),
    PRIMARY KEY (group_name, cycle),
    CHECK ((frozen = 0 AND frozen_at_us IS NULL) OR (frozen = 1 AND frozen_at_us IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS snapshots (
    group_name TEXT NOT NULL,
    cycle TEXT NOT NULL,
    item_id TEXT NOT NULL CHECK (length(item_id) > 0),
    PRIMARY KEY (group_name, cycle, item_id),
    FOREIGN KEY (group_name, cycle)
        REFERENCES snapshot_meta(group_name, cycle) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (1, 1);
";

/// Migration v2: guards that keep frozen snapshots immutable even for
/// writers that bypass the store API.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TRIGGER IF NOT EXISTS snapshots_frozen_insert
BEFORE INSERT ON snapshots
WHEN EXISTS (
    SELECT 1 FROM snapshot_meta
    WHERE group_name = new.group_name AND cycle = new.cycle AND frozen = 1
)
BEGIN
    SELECT RAISE(ABORT, 'snapshot is frozen');
END;

CREATE TRIGGER IF NOT EXISTS snapshots_frozen_delete
BEFORE DELETE ON snapshots
WHEN EXISTS (
    SELECT 1 FROM snapshot_meta
    WHERE group_name = old.group_name AND cycle = old.cycle AND frozen = 1
)
BEGIN
    SELECT RAISE(ABORT, 'snapshot is frozen');
END;

CREATE TRIGGER IF NOT EXISTS snapshot_meta_unfreeze
BEFORE UPDATE ON snapshot_meta
WHEN old.frozen = 1 AND (
    new.frozen = 0
    OR new.committed_count <> old.committed_count
    OR new.frozen_at_us IS NOT old.frozen_at_us
)
BEGIN
    SELECT RAISE(ABORT, 'snapshot is frozen');
END;

UPDATE store_meta SET schema_version = 2 WHERE id = 1;
";

/// Triggers expected after migration.
pub const REQUIRED_TRIGGERS: &[&str] = &[
    "snapshots_frozen_insert",
    "snapshots_frozen_delete",
    "snapshot_meta_unfreeze",
];
