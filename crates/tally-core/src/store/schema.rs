//! SQLite schema for the per-account durable store.
//!
//! The op log is the source of truth for recovery: a document is restored
//! by replaying `ops` in per-device counter order. The entity tables are a
//! queryable projection of the merged state, maintained alongside the log
//! so the UI layer can read without replaying:
//!
//! - `expenses` is keyed by sync identifier with a secondary index on
//!   `(year, month)` for month-bucketed views
//! - `tombstones` carries the deletion wall time for retention-based
//!   cleanup
//! - `images` holds receipt blobs and their derived thumbnails, fetched
//!   lazily from peers rather than replicated in the document
//! - `peers` remembers previously-seen device codes for reconnect
//!   convenience

/// Migration v1: op log, projection tables, blobs, and meta.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    account_id TEXT,
    migration_complete INTEGER NOT NULL DEFAULT 0 CHECK (migration_complete IN (0, 1))
);

INSERT OR IGNORE INTO meta (id, schema_version, account_id, migration_complete)
VALUES (1, 1, NULL, 0);

CREATE TABLE IF NOT EXISTS ops (
    op_hash TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    counter INTEGER NOT NULL,
    wall_ts_us INTEGER NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ops_device_counter
    ON ops(account_id, device_id, counter);

CREATE TABLE IF NOT EXISTS expenses (
    expense_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    amount_minor INTEGER NOT NULL,
    date TEXT NOT NULL,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    payer_id TEXT NOT NULL,
    split_mode TEXT NOT NULL CHECK (split_mode IN ('full', 'equal', 'custom')),
    body TEXT NOT NULL,
    created_at_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_expenses_year_month
    ON expenses(account_id, year, month);

CREATE TABLE IF NOT EXISTS people (
    person_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    name TEXT NOT NULL,
    claimed_by TEXT,
    body TEXT NOT NULL,
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS payments (
    payment_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    amount_minor INTEGER NOT NULL,
    date TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tombstones (
    entity_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    deleted_at_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at
    ON tombstones(account_id, deleted_at_us);

CREATE TABLE IF NOT EXISTS images (
    image_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    bytes BLOB NOT NULL,
    thumbnail BLOB
);

CREATE TABLE IF NOT EXISTS peers (
    device_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    last_seen_us INTEGER NOT NULL
);
";

/// Latest schema version written into `meta.schema_version`.
pub const LATEST_SCHEMA_VERSION: u32 = 1;
