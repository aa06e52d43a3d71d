//! Durable per-account storage.
//!
//! Runtime defaults are intentionally conservative:
//! - `journal_mode = WAL` to allow concurrent readers while writers append
//! - `busy_timeout = 5s` to reduce transient lock failures under contention
//! - `foreign_keys = ON` for relational integrity in projection tables
//!
//! [`Store`] wraps one connection and is owned by the flush worker (see
//! [`bridge`]); [`SqliteBlobStore`] opens its own connection so image
//! reads and writes never contend with the op-log flusher.

pub mod bridge;
pub mod schema;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::doc::Document;
use crate::model::id::{AccountId, DeviceId, EntityId};
use crate::op::{EntityKind, Op, OpKind};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default tombstone retention before garbage collection.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The per-account durable store: op log plus entity projection.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    account: AccountId,
}

impl Store {
    /// Open (or create) the store at `path`, apply pragmas, and migrate
    /// the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if opening, configuring, or migrating fails.
    pub fn open(path: &Path, account: &AccountId) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open store database {}", path.display()))?;
        Self::init(conn, account)
    }

    /// Open an in-memory store. For tests.
    ///
    /// # Errors
    ///
    /// Returns an error if schema setup fails.
    pub fn open_in_memory(account: &AccountId) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        Self::init(conn, account)
    }

    fn init(conn: Connection, account: &AccountId) -> Result<Self> {
        configure_connection(&conn).context("configure sqlite pragmas")?;
        conn.execute_batch(schema::MIGRATION_V1_SQL)
            .context("apply store schema")?;
        conn.execute(
            "UPDATE meta SET account_id = ?1 WHERE id = 1 AND account_id IS NULL",
            params![account.as_str()],
        )
        .context("record account id")?;
        Ok(Self {
            conn,
            account: account.clone(),
        })
    }

    /// The account this store belongs to.
    #[must_use]
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    // -----------------------------------------------------------------------
    // Load / flush
    // -----------------------------------------------------------------------

    /// Restore the document by replaying the persisted op log.
    ///
    /// Called once at startup, before any peer connects, so a device with
    /// prior history is never empty-by-default.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure; individual undecodable ops are
    /// skipped with a warning rather than failing the whole load.
    pub fn load_document(&self, device: DeviceId) -> Result<Document> {
        let mut doc = Document::new(self.account.clone(), device);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT body FROM ops WHERE account_id = ?1
                 ORDER BY device_id, counter",
            )
            .context("prepare op replay query")?;
        let rows = stmt
            .query_map(params![self.account.as_str()], |row| {
                row.get::<_, String>(0)
            })
            .context("replay op log")?;
        let mut replayed = 0usize;
        for body in rows {
            let body = body.context("read op row")?;
            match serde_json::from_str::<Op>(&body) {
                Ok(op) => {
                    doc.apply(&op);
                    replayed += 1;
                }
                Err(err) => warn!(%err, "skipping undecodable op during replay"),
            }
        }
        debug!(replayed, "restored document from store");
        Ok(doc)
    }

    /// Write a batch of ops and refresh the projection rows they touch.
    ///
    /// One transaction per batch; idempotent (`INSERT OR IGNORE` on the op
    /// log, upserts on the projection).
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; the caller retries the
    /// batch on the next flush cycle.
    pub fn persist_ops(&mut self, ops: &[Op], doc: &Document) -> Result<()> {
        let account = self.account.as_str().to_string();
        let tx = self.conn.transaction().context("begin flush transaction")?;
        for op in ops {
            let body = serde_json::to_string(op).context("serialize op")?;
            tx.execute(
                "INSERT OR IGNORE INTO ops
                     (op_hash, account_id, device_id, counter, wall_ts_us, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    op.hash,
                    account,
                    op.stamp.device.as_str(),
                    i64::try_from(op.stamp.counter).unwrap_or(i64::MAX),
                    op.wall_ts_us,
                    body
                ],
            )
            .context("insert op row")?;
            Self::project(&tx, &account, op, doc)?;
        }
        tx.commit().context("commit flush transaction")
    }

    /// Refresh the projection for one op's target entity from the merged
    /// document state.
    fn project(
        tx: &rusqlite::Transaction<'_>,
        account: &str,
        op: &Op,
        doc: &Document,
    ) -> Result<()> {
        if matches!(op.kind, OpKind::Other { .. }) || matches!(op.entity, EntityKind::Other(_)) {
            return Ok(());
        }
        if let Some(tombstone) = doc.tombstones().get(&op.id) {
            tx.execute(
                "INSERT OR REPLACE INTO tombstones (entity_id, account_id, deleted_at_us)
                 VALUES (?1, ?2, ?3)",
                params![op.id.as_str(), account, tombstone.wall_ts_us],
            )
            .context("insert tombstone row")?;
            let table = match op.entity {
                EntityKind::Expense => "expenses",
                EntityKind::Person => "people",
                EntityKind::Payment => "payments",
                EntityKind::Other(_) => return Ok(()),
            };
            let key = match op.entity {
                EntityKind::Expense => "expense_id",
                EntityKind::Person => "person_id",
                EntityKind::Payment => "payment_id",
                EntityKind::Other(_) => return Ok(()),
            };
            tx.execute(
                &format!("DELETE FROM {table} WHERE {key} = ?1"),
                params![op.id.as_str()],
            )
            .context("delete projected row")?;
            return Ok(());
        }

        match op.entity {
            EntityKind::Expense => {
                let Some(expense) = doc.expense(&op.id) else {
                    // Pending update or unmaterializable record; the row is
                    // written once the insert lands.
                    return Ok(());
                };
                let body = serde_json::to_string(&expense).context("serialize expense")?;
                let split = match expense.split {
                    crate::model::money::SplitMode::Full => "full",
                    crate::model::money::SplitMode::Equal => "equal",
                    crate::model::money::SplitMode::Custom => "custom",
                };
                tx.execute(
                    "INSERT OR REPLACE INTO expenses
                         (expense_id, account_id, amount_minor, date, year, month,
                          payer_id, split_mode, body, created_at_us)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        expense.id.as_str(),
                        account,
                        expense.amount.minor(),
                        expense.date.to_string(),
                        i64::from(chrono::Datelike::year(&expense.date)),
                        i64::from(chrono::Datelike::month(&expense.date)),
                        expense.payer.as_str(),
                        split,
                        body,
                        expense.created_at_us
                    ],
                )
                .context("upsert expense row")?;
            }
            EntityKind::Person => {
                let Some(person) = doc.person(&op.id) else {
                    return Ok(());
                };
                let body = serde_json::to_string(&person).context("serialize person")?;
                tx.execute(
                    "INSERT OR REPLACE INTO people
                         (person_id, account_id, name, claimed_by, body, created_at_us)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        person.id.as_str(),
                        account,
                        person.name,
                        person.claimed_by.as_ref().map(DeviceId::as_str),
                        body,
                        person.created_at_us
                    ],
                )
                .context("upsert person row")?;
            }
            EntityKind::Payment => {
                let Some(payment) = doc.payment(&op.id) else {
                    return Ok(());
                };
                let body = serde_json::to_string(&payment).context("serialize payment")?;
                tx.execute(
                    "INSERT OR REPLACE INTO payments
                         (payment_id, account_id, from_id, to_id, amount_minor, date,
                          body, created_at_us)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        payment.id.as_str(),
                        account,
                        payment.from.as_str(),
                        payment.to.as_str(),
                        payment.amount.minor(),
                        payment.date.to_string(),
                        body,
                        payment.created_at_us
                    ],
                )
                .context("upsert payment row")?;
            }
            EntityKind::Other(_) => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tombstone GC
    // -----------------------------------------------------------------------

    /// Delete tombstone rows older than the retention window.
    ///
    /// Liveness assumption, not a proof: call this only once confident all
    /// peers have observed the deletions.
    ///
    /// # Errors
    ///
    /// Returns an error on a write failure.
    pub fn gc_tombstones(&mut self, retention: Duration, now_us: i64) -> Result<usize> {
        let cutoff = now_us - i64::try_from(retention.as_micros()).unwrap_or(i64::MAX);
        let deleted = self
            .conn
            .execute(
                "DELETE FROM tombstones WHERE account_id = ?1 AND deleted_at_us < ?2",
                params![self.account.as_str(), cutoff],
            )
            .context("gc tombstones")?;
        debug!(deleted, "garbage collected tombstones");
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Migration marker
    // -----------------------------------------------------------------------

    /// Whether the one-shot legacy migration has completed on this device.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure.
    pub fn migration_complete(&self) -> Result<bool> {
        let complete: i64 = self
            .conn
            .query_row("SELECT migration_complete FROM meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .context("read migration marker")?;
        Ok(complete != 0)
    }

    /// Persist the migration-complete marker. Set only after every legacy
    /// record has been imported and flushed.
    ///
    /// # Errors
    ///
    /// Returns an error on a write failure.
    pub fn set_migration_complete(&self) -> Result<()> {
        self.conn
            .execute("UPDATE meta SET migration_complete = 1 WHERE id = 1", [])
            .context("set migration marker")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remembered peers
    // -----------------------------------------------------------------------

    /// Record a peer device code for reconnect convenience.
    ///
    /// # Errors
    ///
    /// Returns an error on a write failure.
    pub fn remember_peer(&self, device: &DeviceId, last_seen_us: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO peers (device_id, account_id, last_seen_us)
                 VALUES (?1, ?2, ?3)",
                params![device.as_str(), self.account.as_str(), last_seen_us],
            )
            .context("remember peer")?;
        Ok(())
    }

    /// Previously-seen peer device codes, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error on a read failure.
    pub fn remembered_peers(&self) -> Result<Vec<DeviceId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT device_id FROM peers WHERE account_id = ?1
                 ORDER BY last_seen_us DESC",
            )
            .context("prepare peers query")?;
        let rows = stmt
            .query_map(params![self.account.as_str()], |row| {
                row.get::<_, String>(0)
            })
            .context("read peers")?;
        let mut peers = Vec::new();
        for device in rows {
            peers.push(DeviceId::new_unchecked(&device.context("read peer row")?));
        }
        Ok(peers)
    }
}

// ---------------------------------------------------------------------------
// Blob stores
// ---------------------------------------------------------------------------

/// Injected capability for receipt-image blobs.
///
/// Images are referenced by identifier from expenses but stored and
/// transferred out of band so the replicated document stays small.
pub trait BlobStore: Send + Sync {
    /// Fetch a blob.
    ///
    /// # Errors
    ///
    /// Returns an error on a storage failure; `Ok(None)` means not held
    /// locally.
    fn get(&self, id: &EntityId) -> Result<Option<Vec<u8>>>;

    /// Store a blob. Idempotent — ids are content-unique, so storing the
    /// same image twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error on a storage failure.
    fn put(&self, id: &EntityId, bytes: &[u8]) -> Result<()>;

    /// Store a derived thumbnail for an already-stored blob.
    ///
    /// # Errors
    ///
    /// Returns an error on a storage failure.
    fn put_thumbnail(&self, id: &EntityId, bytes: &[u8]) -> Result<()>;

    /// Fetch the derived thumbnail, if one was stored.
    ///
    /// # Errors
    ///
    /// Returns an error on a storage failure.
    fn thumbnail(&self, id: &EntityId) -> Result<Option<Vec<u8>>>;
}

/// SQLite-backed blob store sharing the account database file.
pub struct SqliteBlobStore {
    conn: Mutex<Connection>,
    account: AccountId,
}

impl SqliteBlobStore {
    /// Open a blob-store connection against the account database.
    ///
    /// # Errors
    ///
    /// Returns an error if opening or configuring the connection fails.
    pub fn open(path: &Path, account: &AccountId) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open blob store {}", path.display()))?;
        configure_connection(&conn).context("configure blob store pragmas")?;
        conn.execute_batch(schema::MIGRATION_V1_SQL)
            .context("apply blob store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            account: account.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl BlobStore for SqliteBlobStore {
    fn get(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT bytes FROM images WHERE image_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .context("read image blob")
    }

    fn put(&self, id: &EntityId, bytes: &[u8]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO images (image_id, account_id, bytes, thumbnail)
             VALUES (?1, ?2, ?3, (SELECT thumbnail FROM images WHERE image_id = ?1))",
            params![id.as_str(), self.account.as_str(), bytes],
        )
        .context("write image blob")?;
        Ok(())
    }

    fn put_thumbnail(&self, id: &EntityId, bytes: &[u8]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE images SET thumbnail = ?2 WHERE image_id = ?1",
            params![id.as_str(), bytes],
        )
        .context("write thumbnail")?;
        Ok(())
    }

    fn thumbnail(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        let conn = self.lock();
        let row: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT thumbnail FROM images WHERE image_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("read thumbnail")?;
        Ok(row.flatten())
    }
}

/// In-memory blob store for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<EntityId, Vec<u8>>>,
    thumbs: Mutex<BTreeMap<EntityId, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(blobs.get(id).cloned())
    }

    fn put(&self, id: &EntityId, bytes: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        blobs.insert(id.clone(), bytes.to_vec());
        Ok(())
    }

    fn put_thumbnail(&self, id: &EntityId, bytes: &[u8]) -> Result<()> {
        let mut thumbs = self
            .thumbs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        thumbs.insert(id.clone(), bytes.to_vec());
        Ok(())
    }

    fn thumbnail(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        let thumbs = self
            .thumbs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(thumbs.get(id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
