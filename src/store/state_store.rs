//! SQLite-backed state store.
//!
//! The store is the only shared mutable resource. Every mutation of an item
//! happens inside one SQLite transaction, and scheduling passes serialize on
//! the `pass_lock` lease so two overlapping passes never spend the same slot
//! budget.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::clock::from_millis;
use crate::error::{Result, RetriggerError};
use crate::scheduler::RetryPolicy;
use crate::store::records::{
    AttemptEffect, AttemptOutcome, AttemptRecord, ErrorEvent, ErrorKind, ItemKey, ItemStatus, QueueStats, QueuedItem,
    UpsertOutcome,
};

/// Next position in the journal shared by `attempts` and `error_events`.
const NEXT_SEQ: &str = "(SELECT COALESCE(MAX(m), 0) + 1 FROM \
                        (SELECT MAX(seq) AS m FROM attempts UNION ALL SELECT MAX(seq) FROM error_events))";

const ATTEMPT_COLUMNS: &str = "id, seq, namespace, identifier, attempted_at, outcome, observed_throttle_secs";

const ITEM_COLUMNS: &str = "namespace, identifier, discovered_at, next_eligible_at, retry_count, \
                            last_throttle_secs, status, last_error, removed_at";

/// StateStore owns queued items, the attempt log and the error log.
pub struct StateStore {
    /// Path to the SQLite database file
    db_path: PathBuf,

    /// rusqlite::Connection is not Sync; passes hold the lock only per statement/transaction
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open or create the store at `db_path`.
    ///
    /// `busy_timeout` bounds how long a statement waits on another process's write lock.
    pub fn open(db_path: &Path, busy_timeout: std::time::Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::init_schema(&conn)?;

        log::debug!("Opened state store at {}", db_path.display());
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Open or create a store named `retrigger.db` inside `dir`.
    ///
    /// Useful for testing with custom paths.
    pub fn open_at(dir: &Path) -> Result<Self> {
        Self::open(&dir.join("retrigger.db"), std::time::Duration::from_secs(2))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queued_items (
                namespace TEXT NOT NULL,
                identifier INTEGER NOT NULL,
                discovered_at INTEGER NOT NULL,
                next_eligible_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_throttle_secs INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                removed_at INTEGER,
                PRIMARY KEY (namespace, identifier)
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                identifier INTEGER NOT NULL,
                attempted_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                observed_throttle_secs INTEGER,
                seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS error_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                occurred_at INTEGER NOT NULL,
                kind TEXT NOT NULL,
                namespace TEXT,
                identifier INTEGER,
                detail TEXT NOT NULL,
                seq INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pass_lock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_eligible ON queued_items(status, next_eligible_at);
            CREATE INDEX IF NOT EXISTS idx_attempts_time ON attempts(attempted_at);
            CREATE INDEX IF NOT EXISTS idx_attempts_item ON attempts(namespace, identifier);
            CREATE INDEX IF NOT EXISTS idx_errors_time ON error_events(occurred_at);
            CREATE INDEX IF NOT EXISTS idx_attempts_seq ON attempts(seq);
            CREATE INDEX IF NOT EXISTS idx_errors_seq ON error_events(seq);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RetriggerError::Store(format!("connection mutex poisoned: {}", e)))
    }

    /// Insert a discovered item, or refresh it if already queued. Never duplicates a key.
    ///
    /// The item becomes eligible at `observed_at + throttle_secs + buffer`. A pending
    /// item keeps the later of its current and the new eligibility time. A removed item
    /// comes back only when the observation is newer than its removal.
    pub fn upsert_item(
        &self,
        key: &ItemKey,
        throttle_secs: u64,
        observed_at: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<UpsertOutcome> {
        let next_eligible_at = policy.next_eligible(observed_at, throttle_secs);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = Self::load_item(&tx, key)?;
        let outcome = match existing {
            None => {
                tx.execute(
                    r#"
                    INSERT INTO queued_items
                    (namespace, identifier, discovered_at, next_eligible_at, retry_count, last_throttle_secs, status)
                    VALUES (?1, ?2, ?3, ?4, 0, ?5, 'pending')
                    "#,
                    params![
                        key.namespace,
                        key.identifier as i64,
                        observed_at.timestamp_millis(),
                        next_eligible_at.timestamp_millis(),
                        throttle_secs as i64,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
            Some(item) if item.is_pending() => {
                let keep = item.next_eligible_at.max(next_eligible_at);
                tx.execute(
                    "UPDATE queued_items SET next_eligible_at = ?1, last_throttle_secs = ?2 \
                     WHERE namespace = ?3 AND identifier = ?4",
                    params![keep.timestamp_millis(), throttle_secs as i64, key.namespace, key.identifier as i64],
                )?;
                UpsertOutcome::Refreshed
            }
            Some(item) if item.removed_at.is_some_and(|removed| observed_at > removed) => {
                tx.execute(
                    r#"
                    UPDATE queued_items
                    SET discovered_at = ?1, next_eligible_at = ?2, retry_count = 0, last_throttle_secs = ?3,
                        status = 'pending', last_error = NULL, removed_at = NULL
                    WHERE namespace = ?4 AND identifier = ?5
                    "#,
                    params![
                        observed_at.timestamp_millis(),
                        next_eligible_at.timestamp_millis(),
                        throttle_secs as i64,
                        key.namespace,
                        key.identifier as i64,
                    ],
                )?;
                UpsertOutcome::Revived
            }
            Some(_) => UpsertOutcome::Ignored,
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Pending items due at `now`, oldest-waiting first, ties by discovery time.
    pub fn list_eligible(&self, now: DateTime<Utc>) -> Result<Vec<QueuedItem>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM queued_items WHERE status = 'pending' AND next_eligible_at <= ?1 \
             ORDER BY next_eligible_at ASC, discovered_at ASC, namespace ASC, identifier ASC",
            ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([now.timestamp_millis()], raw_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_item()?);
        }
        Ok(items)
    }

    /// All pending items regardless of eligibility.
    pub fn pending_items(&self) -> Result<Vec<QueuedItem>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM queued_items WHERE status = 'pending' ORDER BY next_eligible_at ASC, discovered_at ASC",
            ITEM_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], raw_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_item()?);
        }
        Ok(items)
    }

    /// Get an item by key, in any status.
    pub fn get_item(&self, key: &ItemKey) -> Result<Option<QueuedItem>> {
        let conn = self.conn()?;
        Self::load_item(&conn, key)
    }

    fn load_item(conn: &Connection, key: &ItemKey) -> Result<Option<QueuedItem>> {
        let sql = format!(
            "SELECT {} FROM queued_items WHERE namespace = ?1 AND identifier = ?2",
            ITEM_COLUMNS
        );
        let raw = conn
            .query_row(&sql, params![key.namespace, key.identifier as i64], raw_item)
            .optional()?;
        raw.map(RawItem::into_item).transpose()
    }

    /// Append an attempt and apply its effect on the item in one transaction.
    ///
    /// The attempt is logged even when the item is no longer pending, because slot
    /// inference must see every trigger. A throttled outcome also logs a `Throttled`
    /// error event; reaching the retry ceiling removes the item and logs
    /// `RetryCeilingReached`.
    pub fn record_attempt(
        &self,
        key: &ItemKey,
        outcome: AttemptOutcome,
        observed_throttle_secs: Option<u64>,
        at: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<AttemptEffect> {
        let observed_throttle_secs = match outcome {
            AttemptOutcome::StillThrottled => observed_throttle_secs,
            _ => None,
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            &format!(
                "INSERT INTO attempts (namespace, identifier, attempted_at, outcome, observed_throttle_secs, seq) \
                 VALUES (?1, ?2, ?3, ?4, ?5, {})",
                NEXT_SEQ
            ),
            params![
                key.namespace,
                key.identifier as i64,
                at.timestamp_millis(),
                outcome.as_str(),
                observed_throttle_secs.map(|s| s as i64),
            ],
        )?;

        let effect = match Self::load_item(&tx, key)? {
            Some(item) => policy.apply(&item, outcome, observed_throttle_secs, at),
            None => AttemptEffect::NotQueued,
        };

        let last_error = match outcome {
            AttemptOutcome::Accepted => None,
            AttemptOutcome::StillThrottled => Some(match observed_throttle_secs {
                Some(secs) => format!("still throttled ({}s)", secs),
                None => "still throttled".to_string(),
            }),
            AttemptOutcome::TransientError => Some("transient error".to_string()),
        };

        match &effect {
            AttemptEffect::Removed => {
                tx.execute(
                    "UPDATE queued_items SET status = 'removed', removed_at = ?1, last_error = NULL \
                     WHERE namespace = ?2 AND identifier = ?3",
                    params![at.timestamp_millis(), key.namespace, key.identifier as i64],
                )?;
            }
            AttemptEffect::Rescheduled {
                retry_count,
                next_eligible_at,
            } => {
                tx.execute(
                    r#"
                    UPDATE queued_items
                    SET retry_count = ?1, next_eligible_at = ?2,
                        last_throttle_secs = COALESCE(?3, last_throttle_secs), last_error = ?4
                    WHERE namespace = ?5 AND identifier = ?6
                    "#,
                    params![
                        retry_count,
                        next_eligible_at.timestamp_millis(),
                        observed_throttle_secs.map(|s| s as i64),
                        last_error,
                        key.namespace,
                        key.identifier as i64,
                    ],
                )?;
            }
            AttemptEffect::RetryCeilingReached { retry_count } => {
                tx.execute(
                    r#"
                    UPDATE queued_items
                    SET retry_count = ?1, status = 'removed', removed_at = ?2,
                        last_throttle_secs = COALESCE(?3, last_throttle_secs), last_error = ?4
                    WHERE namespace = ?5 AND identifier = ?6
                    "#,
                    params![
                        retry_count,
                        at.timestamp_millis(),
                        observed_throttle_secs.map(|s| s as i64),
                        last_error,
                        key.namespace,
                        key.identifier as i64,
                    ],
                )?;
            }
            AttemptEffect::NotQueued => {}
        }

        if outcome == AttemptOutcome::StillThrottled {
            let detail = last_error.clone().unwrap_or_default();
            Self::insert_error(&tx, ErrorKind::Throttled, &detail, Some(key), at)?;
        }
        if let AttemptEffect::RetryCeilingReached { retry_count } = &effect {
            let detail = format!("retry ceiling ({}) reached after {} retries", policy.retry_ceiling, retry_count);
            Self::insert_error(&tx, ErrorKind::RetryCeilingReached, &detail, Some(key), at)?;
        }

        tx.commit()?;
        Ok(effect)
    }

    /// Remove an item for reasons outside the scheduler (e.g. the issue was closed).
    ///
    /// Returns false if the item was not pending.
    pub fn remove_item(&self, key: &ItemKey, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE queued_items SET status = 'removed', removed_at = ?1 \
             WHERE namespace = ?2 AND identifier = ?3 AND status = 'pending'",
            params![at.timestamp_millis(), key.namespace, key.identifier as i64],
        )?;
        Ok(changed > 0)
    }

    /// Append an error event.
    pub fn record_error(
        &self,
        kind: ErrorKind,
        detail: &str,
        key: Option<&ItemKey>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        Self::insert_error(&conn, kind, detail, key, at)
    }

    fn insert_error(
        conn: &Connection,
        kind: ErrorKind,
        detail: &str,
        key: Option<&ItemKey>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO error_events (occurred_at, kind, namespace, identifier, detail, seq) \
                 VALUES (?1, ?2, ?3, ?4, ?5, {})",
                NEXT_SEQ
            ),
            params![
                at.timestamp_millis(),
                kind.as_str(),
                key.map(|k| k.namespace.as_str()),
                key.map(|k| k.identifier as i64),
                detail,
            ],
        )?;
        Ok(())
    }

    /// Error events in `(now - window, now]`, most recent first; insertion order breaks ties.
    pub fn recent_errors(&self, window: Duration, now: DateTime<Utc>) -> Result<Vec<ErrorEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, occurred_at, kind, namespace, identifier, detail, seq FROM error_events \
             WHERE occurred_at > ?1 AND occurred_at <= ?2 ORDER BY occurred_at DESC, seq DESC",
        )?;
        let rows = stmt.query_map(
            params![(now - window).timestamp_millis(), now.timestamp_millis()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

        let mut events = Vec::new();
        for row in rows {
            let (id, occurred_at, kind, namespace, identifier, detail, seq) = row?;
            let key = match (namespace, identifier) {
                (Some(namespace), Some(identifier)) => Some(ItemKey::new(namespace, identifier as u64)),
                _ => None,
            };
            events.push(ErrorEvent {
                id,
                seq,
                occurred_at: from_millis(occurred_at),
                kind: kind.parse()?,
                key,
                detail,
            });
        }
        Ok(events)
    }

    /// Attempts in `(now - window, now]`, in the order they were made.
    pub fn recent_attempts(&self, window: Duration, now: DateTime<Utc>) -> Result<Vec<AttemptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM attempts WHERE attempted_at > ?1 AND attempted_at <= ?2 \
             ORDER BY attempted_at ASC, seq ASC",
            ATTEMPT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![(now - window).timestamp_millis(), now.timestamp_millis()],
            raw_attempt,
        )?;

        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?.into_record()?);
        }
        Ok(attempts)
    }

    /// Full attempt history of one item, kept after the item is removed.
    pub fn attempts_for(&self, key: &ItemKey) -> Result<Vec<AttemptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM attempts WHERE namespace = ?1 AND identifier = ?2 ORDER BY attempted_at ASC, seq ASC",
            ATTEMPT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![key.namespace, key.identifier as i64], raw_attempt)?;

        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?.into_record()?);
        }
        Ok(attempts)
    }

    /// Counts for the status command.
    pub fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let conn = self.conn()?;
        let (pending, eligible, retried, removed): (i64, i64, i64, i64) = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(status = 'pending'), 0),
                COALESCE(SUM(status = 'pending' AND next_eligible_at <= ?1), 0),
                COALESCE(SUM(status = 'pending' AND retry_count > 0), 0),
                COALESCE(SUM(status = 'removed'), 0)
            FROM queued_items
            "#,
            [now.timestamp_millis()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(QueueStats {
            pending: pending as usize,
            eligible: eligible as usize,
            retried: retried as usize,
            removed: removed as usize,
        })
    }

    /// Delete attempts and error events older than `before`. Returns (attempts, errors) deleted.
    pub fn prune_history(&self, before: DateTime<Utc>) -> Result<(usize, usize)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let attempts = tx.execute("DELETE FROM attempts WHERE attempted_at < ?1", [before.timestamp_millis()])?;
        let errors = tx.execute("DELETE FROM error_events WHERE occurred_at < ?1", [before.timestamp_millis()])?;
        tx.commit()?;
        Ok((attempts, errors))
    }

    /// Take the single-writer lease for a scheduling pass.
    ///
    /// Fails with `LockHeld` when another holder's lease has not expired. The lease is
    /// released when the returned guard is dropped.
    pub fn try_acquire_pass_lock(&self, holder: &str, now: DateTime<Utc>, ttl: Duration) -> Result<PassLock<'_>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, i64)> = tx
            .query_row("SELECT holder, expires_at FROM pass_lock WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        if let Some((current_holder, expires_at)) = current
            && current_holder != holder
            && expires_at > now.timestamp_millis()
        {
            return Err(RetriggerError::LockHeld {
                holder: current_holder,
                expires_at: from_millis(expires_at).to_rfc3339(),
            });
        }

        tx.execute(
            "INSERT OR REPLACE INTO pass_lock (id, holder, acquired_at, expires_at) VALUES (1, ?1, ?2, ?3)",
            params![holder, now.timestamp_millis(), (now + ttl).timestamp_millis()],
        )?;
        tx.commit()?;

        log::debug!("Pass lock acquired by {}", holder);
        Ok(PassLock {
            store: self,
            holder: holder.to_string(),
            released: false,
        })
    }

    fn release_pass_lock(&self, holder: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM pass_lock WHERE id = 1 AND holder = ?1", [holder])?;
        Ok(())
    }
}

/// Lease on the state store for one scheduling pass.
#[derive(Debug)]
pub struct PassLock<'a> {
    store: &'a StateStore,
    holder: String,
    released: bool,
}

impl PassLock<'_> {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release explicitly, surfacing any store error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release_pass_lock(&self.holder)
    }
}

impl Drop for PassLock<'_> {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.store.release_pass_lock(&self.holder)
        {
            log::warn!("Failed to release pass lock held by {}: {}", self.holder, e);
        }
    }
}

/// Column values of a `queued_items` row before typed conversion.
struct RawItem {
    namespace: String,
    identifier: i64,
    discovered_at: i64,
    next_eligible_at: i64,
    retry_count: u32,
    last_throttle_secs: Option<i64>,
    status: String,
    last_error: Option<String>,
    removed_at: Option<i64>,
}

impl RawItem {
    fn into_item(self) -> Result<QueuedItem> {
        Ok(QueuedItem {
            key: ItemKey::new(self.namespace, self.identifier as u64),
            discovered_at: from_millis(self.discovered_at),
            next_eligible_at: from_millis(self.next_eligible_at),
            retry_count: self.retry_count,
            last_throttle_secs: self.last_throttle_secs.map(|s| s as u64),
            status: self.status.parse::<ItemStatus>()?,
            last_error: self.last_error,
            removed_at: self.removed_at.map(from_millis),
        })
    }
}

fn raw_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok(RawItem {
        namespace: row.get(0)?,
        identifier: row.get(1)?,
        discovered_at: row.get(2)?,
        next_eligible_at: row.get(3)?,
        retry_count: row.get(4)?,
        last_throttle_secs: row.get(5)?,
        status: row.get(6)?,
        last_error: row.get(7)?,
        removed_at: row.get(8)?,
    })
}

struct RawAttempt {
    id: i64,
    seq: i64,
    namespace: String,
    identifier: i64,
    attempted_at: i64,
    outcome: String,
    observed_throttle_secs: Option<i64>,
}

impl RawAttempt {
    fn into_record(self) -> Result<AttemptRecord> {
        Ok(AttemptRecord {
            id: self.id,
            seq: self.seq,
            key: ItemKey::new(self.namespace, self.identifier as u64),
            attempted_at: from_millis(self.attempted_at),
            outcome: self.outcome.parse::<AttemptOutcome>()?,
            observed_throttle_secs: self.observed_throttle_secs.map(|s| s as u64),
        })
    }
}

fn raw_attempt(row: &Row<'_>) -> rusqlite::Result<RawAttempt> {
    Ok(RawAttempt {
        id: row.get(0)?,
        seq: row.get(1)?,
        namespace: row.get(2)?,
        identifier: row.get(3)?,
        attempted_at: row.get(4)?,
        outcome: row.get(5)?,
        observed_throttle_secs: row.get(6)?,
    })
}
