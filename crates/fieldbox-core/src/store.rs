//! Durable outbox queue backed by SQLite.
//!
//! The store is the single source of truth for records awaiting upload.
//! It owns backpressure (byte budget and device free-space checks),
//! cleanup policy, and crash recovery via stale-upload reclaim. All
//! access funnels through one connection behind a mutex so the
//! select-and-mark step of [`OutboxStore::dequeue_next`] is indivisible:
//! two concurrent callers can never receive overlapping records.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hard cap on a single record payload.
pub const MAX_PAYLOAD_BYTES: u64 = 10_000_000;
/// Byte budget for the whole queue (pending + uploading + failed rows).
pub const MAX_QUEUE_BYTES: u64 = 500_000_000;
/// Free-space level below which aggressive cleanup runs before admitting.
pub const STORAGE_WARNING_BYTES: u64 = 50_000_000;
/// Free-space level below which enqueue is refused outright.
pub const STORAGE_CRITICAL_BYTES: u64 = 10_000_000;
/// Attempts after which a record is excluded from dequeue.
pub const MAX_UPLOAD_ATTEMPTS: u32 = 5;
/// Uploading records older than this are reclaimed to pending.
pub const STALE_TIMEOUT: Duration = Duration::from_secs(600);
/// Terminal rows older than this are deleted by aged cleanup.
pub const RETENTION: Duration = Duration::from_secs(3 * 24 * 3600);

/// DDL for the outbox queue table.
const OUTBOX_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS outbox_queue (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_name       TEXT NOT NULL,
    data_blob         BLOB NOT NULL,
    created_at        INTEGER NOT NULL,
    upload_attempts   INTEGER NOT NULL DEFAULT 0,
    last_attempt_date INTEGER,
    status            TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS idx_outbox_status_created
    ON outbox_queue(status, created_at);
CREATE INDEX IF NOT EXISTS idx_outbox_stream
    ON outbox_queue(stream_name);
";

/// Lifecycle state of a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Awaiting its first (or next) dequeue.
    Pending,
    /// Owned by an in-flight upload cycle.
    Uploading,
    /// Delivered; kept only until aged cleanup.
    Completed,
    /// Last attempt failed. Retryable until attempts reach the cap.
    Failed,
}

impl RecordStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One persisted unit of pending work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    /// Store-assigned monotonic id.
    pub id: i64,
    /// Stream this payload belongs to (member of the closed set).
    pub stream_name: String,
    /// Opaque payload bytes, never empty.
    pub payload: Vec<u8>,
    /// Insertion time, epoch seconds.
    pub created_at: i64,
    /// Number of upload attempts so far. Only ever increases.
    pub upload_attempts: u32,
    /// Start of the most recent attempt, epoch seconds.
    pub last_attempt_at: Option<i64>,
    /// Current lifecycle state.
    pub status: RecordStatus,
}

/// Derived queue statistics over pending/uploading/failed rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub failed: u64,
    pub total: u64,
    pub total_bytes: u64,
}

/// Byte budgets and timing policy for the store.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_payload_bytes: u64,
    pub max_queue_bytes: u64,
    pub storage_warning_bytes: u64,
    pub storage_critical_bytes: u64,
    pub max_attempts: u32,
    pub stale_timeout: Duration,
    pub retention: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            max_queue_bytes: MAX_QUEUE_BYTES,
            storage_warning_bytes: STORAGE_WARNING_BYTES,
            storage_critical_bytes: STORAGE_CRITICAL_BYTES,
            max_attempts: MAX_UPLOAD_ATTEMPTS,
            stale_timeout: STALE_TIMEOUT,
            retention: RETENTION,
        }
    }
}

/// Low-level store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enqueue rejection, surfaced synchronously to the producer.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("unknown stream name: {0:?}")]
    InvalidStreamName(String),

    #[error("payload must not be empty")]
    EmptyPayload,

    #[error("payload of {size} bytes exceeds cap of {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("device storage critically low ({available} bytes available)")]
    EmergencyStorageFull { available: u64 },

    #[error("queue over byte budget ({current} of {max} bytes)")]
    QueueFull { current: u64, max: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Device free-space observation, injectable for tests.
pub trait StorageProbe: Send + Sync {
    /// Bytes available on the volume holding the queue.
    fn available_bytes(&self) -> std::io::Result<u64>;
}

/// Probe backed by the filesystem the database lives on.
#[derive(Debug)]
pub struct DiskProbe {
    path: PathBuf,
}

impl DiskProbe {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StorageProbe for DiskProbe {
    fn available_bytes(&self) -> std::io::Result<u64> {
        fs2::available_space(&self.path)
    }
}

/// A probe reporting effectively unlimited space. Used for in-memory
/// stores, where device pressure is not meaningful.
struct UnboundedProbe;

impl StorageProbe for UnboundedProbe {
    fn available_bytes(&self) -> std::io::Result<u64> {
        Ok(u64::MAX)
    }
}

/// SQLite-backed durable outbox queue.
///
/// Single-writer by construction: the connection lives behind a mutex
/// and every operation (reads included) takes the lock for its full
/// duration.
pub struct OutboxStore {
    conn: Mutex<Connection>,
    streams: BTreeSet<String>,
    limits: Limits,
    probe: Box<dyn StorageProbe>,
}

impl OutboxStore {
    /// Open or create the queue database at `path`.
    ///
    /// Runs the stale-upload reclaim once, unconditionally: any rows a
    /// previous process left in `uploading` past the timeout become
    /// retryable again before the first caller sees the store.
    pub fn open<I, S>(path: &Path, streams: I, limits: Limits) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(OUTBOX_SCHEMA)?;

        let probe_root = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let store = Self {
            conn: Mutex::new(conn),
            streams: streams.into_iter().map(Into::into).collect(),
            limits,
            probe: Box::new(DiskProbe::new(probe_root)),
        };

        let reclaimed = store.reset_stale_uploads(store.limits.stale_timeout)?;
        if reclaimed > 0 {
            info!(reclaimed, "recovered uploads interrupted by a previous run");
        }
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory<I, S>(streams: I, limits: Limits) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(OUTBOX_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            streams: streams.into_iter().map(Into::into).collect(),
            limits,
            probe: Box::new(UnboundedProbe),
        })
    }

    /// Replace the free-space probe (tests, platform-specific probes).
    pub fn set_storage_probe(&mut self, probe: Box<dyn StorageProbe>) {
        self.probe = probe;
    }

    /// The limits this store enforces.
    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admit a payload into the queue.
    ///
    /// Validation order: stream membership, non-empty payload, size cap,
    /// then device free-space, then queue byte budget. The pressure and
    /// budget checks may delete unrelated terminal rows (cleanup) before
    /// admitting the new one.
    pub fn enqueue(&self, stream: &str, payload: &[u8]) -> Result<i64, EnqueueError> {
        if !self.streams.contains(stream) {
            warn!(stream, "enqueue rejected: unknown stream");
            return Err(EnqueueError::InvalidStreamName(stream.to_string()));
        }
        if payload.is_empty() {
            warn!(stream, "enqueue rejected: empty payload");
            return Err(EnqueueError::EmptyPayload);
        }
        let size = payload.len() as u64;
        if size > self.limits.max_payload_bytes {
            warn!(stream, size, "enqueue rejected: payload over cap");
            return Err(EnqueueError::PayloadTooLarge {
                size,
                max: self.limits.max_payload_bytes,
            });
        }

        let mut conn = self.conn();
        self.check_storage_pressure(&mut conn)?;
        self.check_queue_budget(&mut conn, size)?;

        conn.execute(
            "INSERT INTO outbox_queue (stream_name, data_blob, created_at, status) \
             VALUES (?1, ?2, ?3, ?4)",
            params![stream, payload, now_secs(), RecordStatus::Pending.as_str()],
        )
        .map_err(StoreError::from)?;
        let id = conn.last_insert_rowid();
        debug!(stream, id, size, "record enqueued");
        Ok(id)
    }

    /// If the device is low on space, purge completed rows and re-check.
    /// Refuses the enqueue entirely below the critical threshold.
    fn check_storage_pressure(&self, conn: &mut Connection) -> Result<(), EnqueueError> {
        let available = match self.probe.available_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                // A broken probe must not block data capture.
                warn!(error = %err, "free-space probe failed; skipping pressure check");
                return Ok(());
            }
        };

        if available >= self.limits.storage_warning_bytes {
            return Ok(());
        }

        let purged = Self::cleanup_aggressive_inner(conn).map_err(StoreError::from)?;
        info!(available, purged, "storage pressure: purged completed rows");

        let available = self.probe.available_bytes().unwrap_or(available);
        if available < self.limits.storage_critical_bytes {
            warn!(available, "enqueue rejected: storage critically low");
            return Err(EnqueueError::EmergencyStorageFull { available });
        }
        Ok(())
    }

    /// If the incoming payload would push the queue over its byte
    /// budget, run aged cleanup and re-check.
    fn check_queue_budget(&self, conn: &mut Connection, incoming: u64) -> Result<(), EnqueueError> {
        let current = Self::queued_bytes(conn).map_err(StoreError::from)?;
        if current + incoming <= self.limits.max_queue_bytes {
            return Ok(());
        }

        let deleted = self
            .cleanup_aged_inner(conn, now_secs())
            .map_err(StoreError::from)?;
        info!(current, deleted, "queue over budget: ran aged cleanup");

        let current = Self::queued_bytes(conn).map_err(StoreError::from)?;
        if current + incoming > self.limits.max_queue_bytes {
            warn!(current, "enqueue rejected: queue full after cleanup");
            return Err(EnqueueError::QueueFull {
                current,
                max: self.limits.max_queue_bytes,
            });
        }
        Ok(())
    }

    /// Atomically claim up to `limit` records for upload.
    ///
    /// Selection and the transition to `uploading` happen inside one
    /// transaction under the connection mutex; the returned records are
    /// owned by this caller until resolved or reclaimed as stale. Rows
    /// with an empty stream name are skipped and logged, never returned.
    pub fn dequeue_next(&self, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        let now = now_secs();
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let mut records = {
            let mut stmt = tx.prepare(
                "SELECT id, stream_name, data_blob, created_at, upload_attempts, \
                        last_attempt_date, status \
                 FROM outbox_queue \
                 WHERE status IN ('pending', 'failed') AND upload_attempts < ?1 \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![self.limits.max_attempts, limit as i64], row_to_record)?;

            let mut records = Vec::new();
            for row in rows {
                let record = row?;
                if record.stream_name.is_empty() {
                    warn!(id = record.id, "skipping record with empty stream name");
                    continue;
                }
                records.push(record);
            }
            records
        };

        for record in &mut records {
            tx.execute(
                "UPDATE outbox_queue \
                 SET status = 'uploading', last_attempt_date = ?1 \
                 WHERE id = ?2",
                params![now, record.id],
            )?;
            record.status = RecordStatus::Uploading;
            record.last_attempt_at = Some(now);
        }
        tx.commit()?;

        debug!(count = records.len(), "dequeued records for upload");
        Ok(records)
    }

    /// Mark a record delivered. Terminal.
    pub fn mark_complete(&self, id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE outbox_queue SET status = 'completed' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Record a retryable failure: status `failed`, attempts + 1.
    pub fn increment_retry(&self, id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE outbox_queue \
             SET status = 'failed', upload_attempts = upload_attempts + 1, \
                 last_attempt_date = ?1 \
             WHERE id = ?2",
            params![now_secs(), id],
        )?;
        Ok(())
    }

    /// Record a non-retryable failure: attempts forced to the cap so the
    /// record never re-enters dequeue. Attempts never decrease.
    pub fn mark_permanent_failure(&self, id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE outbox_queue \
             SET status = 'failed', \
                 upload_attempts = MAX(upload_attempts, ?1), \
                 last_attempt_date = ?2 \
             WHERE id = ?3",
            params![self.limits.max_attempts, now_secs(), id],
        )?;
        Ok(())
    }

    /// Revert uploads stuck past `timeout` back to `pending`.
    ///
    /// This is the sole recovery path for uploads interrupted by a crash
    /// or cancellation; each reclaimed record costs one attempt.
    pub fn reset_stale_uploads(&self, timeout: Duration) -> Result<usize, StoreError> {
        self.reset_stale_at(timeout, now_secs())
    }

    fn reset_stale_at(&self, timeout: Duration, now: i64) -> Result<usize, StoreError> {
        let cutoff = now - timeout.as_secs() as i64;
        let changed = self.conn().execute(
            "UPDATE outbox_queue \
             SET status = 'pending', upload_attempts = upload_attempts + 1 \
             WHERE status = 'uploading' \
               AND COALESCE(last_attempt_date, created_at) < ?1",
            params![cutoff],
        )?;
        if changed > 0 {
            info!(reclaimed = changed, "reclaimed stale uploads");
        }
        Ok(changed)
    }

    /// Delete terminal rows (completed, or failed with attempts at the
    /// cap) older than the retention window.
    pub fn cleanup_aged(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        self.cleanup_aged_inner(&mut conn, now_secs())
    }

    fn cleanup_aged_inner(&self, conn: &mut Connection, now: i64) -> Result<usize, StoreError> {
        let cutoff = now - self.limits.retention.as_secs() as i64;
        let deleted = conn.execute(
            "DELETE FROM outbox_queue \
             WHERE (status = 'completed' \
                    OR (status = 'failed' AND upload_attempts >= ?1)) \
               AND created_at < ?2",
            params![self.limits.max_attempts, cutoff],
        )?;
        if deleted > 0 {
            debug!(deleted, "aged cleanup removed terminal rows");
        }
        Ok(deleted)
    }

    /// Storage-pressure escape valve: delete every completed row
    /// regardless of age. Pending, uploading and retryable rows are
    /// never touched.
    pub fn cleanup_aggressive(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        Self::cleanup_aggressive_inner(&mut conn)
    }

    fn cleanup_aggressive_inner(conn: &mut Connection) -> Result<usize, StoreError> {
        let deleted = conn.execute("DELETE FROM outbox_queue WHERE status = 'completed'", [])?;
        Ok(deleted)
    }

    /// Integrity sweep: delete rows whose stream name is empty or no
    /// longer in the closed set. Returns the number removed.
    pub fn remove_invalid_streams(&self) -> Result<usize, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT stream_name FROM outbox_queue")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut removed = 0;
        for name in names {
            if !name.is_empty() && self.streams.contains(&name) {
                continue;
            }
            removed += conn.execute(
                "DELETE FROM outbox_queue WHERE stream_name = ?1",
                params![name],
            )?;
            warn!(stream = %name, "integrity sweep removed rows for invalid stream");
        }
        Ok(removed)
    }

    /// Aggregate statistics over live (pending/uploading/failed) rows.
    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        self.conn()
            .query_row(
                "SELECT \
                    COALESCE(SUM(status = 'pending'), 0), \
                    COALESCE(SUM(status = 'failed'), 0), \
                    COUNT(*), \
                    COALESCE(SUM(LENGTH(data_blob)), 0) \
                 FROM outbox_queue \
                 WHERE status IN ('pending', 'uploading', 'failed')",
                [],
                |row| {
                    Ok(QueueStats {
                        pending: row.get::<_, i64>(0)? as u64,
                        failed: row.get::<_, i64>(1)? as u64,
                        total: row.get::<_, i64>(2)? as u64,
                        total_bytes: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .map_err(StoreError::from)
    }

    /// Per-stream counts of records still in flight (pending/uploading).
    pub fn stream_counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT stream_name, COUNT(*) FROM outbox_queue \
             WHERE status IN ('pending', 'uploading') \
             GROUP BY stream_name ORDER BY stream_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Fetch a single record by id.
    pub fn get(&self, id: i64) -> Result<Option<QueueRecord>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id, stream_name, data_blob, created_at, upload_attempts, \
                        last_attempt_date, status \
                 FROM outbox_queue WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()
            .map_err(StoreError::from)
    }

    fn queued_bytes(conn: &Connection) -> Result<u64, StoreError> {
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(data_blob)), 0) FROM outbox_queue \
             WHERE status IN ('pending', 'uploading', 'failed')",
            [],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }
}

impl std::fmt::Debug for OutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxStore")
            .field("streams", &self.streams)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRecord> {
    let status: String = row.get(6)?;
    Ok(QueueRecord {
        id: row.get(0)?,
        stream_name: row.get(1)?,
        payload: row.get(2)?,
        created_at: row.get(3)?,
        upload_attempts: row.get(4)?,
        last_attempt_at: row.get(5)?,
        // Unknown status text is treated as failed so the row neither
        // dequeues nor counts as delivered.
        status: RecordStatus::parse(&status).unwrap_or(RecordStatus::Failed),
    })
}

/// Current time as epoch seconds.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const STREAMS: [&str; 3] = ["health", "location", "audio"];

    fn test_store() -> OutboxStore {
        OutboxStore::open_in_memory(STREAMS, Limits::default()).unwrap()
    }

    fn small_store(limits: Limits) -> OutboxStore {
        OutboxStore::open_in_memory(STREAMS, limits).unwrap()
    }

    struct FixedProbe(u64);

    impl StorageProbe for FixedProbe {
        fn available_bytes(&self) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }

    fn set_created_at(store: &OutboxStore, id: i64, ts: i64) {
        store
            .conn()
            .execute(
                "UPDATE outbox_queue SET created_at = ?1 WHERE id = ?2",
                params![ts, id],
            )
            .unwrap();
    }

    fn set_last_attempt(store: &OutboxStore, id: i64, ts: i64) {
        store
            .conn()
            .execute(
                "UPDATE outbox_queue SET last_attempt_date = ?1 WHERE id = ?2",
                params![ts, id],
            )
            .unwrap();
    }

    // ── Enqueue validation ───────────────────────────────────────────

    #[test]
    fn round_trip_preserves_payload_and_stream() {
        let store = test_store();
        let payload = vec![0u8, 1, 2, 254, 255];
        let id = store.enqueue("location", &payload).unwrap();

        let records = store.dequeue_next(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].stream_name, "location");
        assert_eq!(records[0].payload, payload);
    }

    #[test]
    fn enqueue_rejects_unknown_stream() {
        let store = test_store();
        let err = store.enqueue("barometer", b"x").unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidStreamName(_)));
    }

    #[test]
    fn enqueue_rejects_empty_payload() {
        let store = test_store();
        let err = store.enqueue("health", b"").unwrap_err();
        assert!(matches!(err, EnqueueError::EmptyPayload));
    }

    #[test]
    fn enqueue_rejects_oversized_payload() {
        let store = small_store(Limits {
            max_payload_bytes: 8,
            ..Limits::default()
        });
        let err = store.enqueue("health", &[0u8; 9]).unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::PayloadTooLarge { size: 9, max: 8 }
        ));
    }

    // ── Storage pressure ─────────────────────────────────────────────

    #[test]
    fn low_space_purges_completed_and_admits() {
        // Scenario: 40MB free is below the 50MB warning but above the
        // 10MB critical line, so the aggressive cleanup runs and the
        // enqueue succeeds.
        let mut store = test_store();
        let done = store.enqueue("health", b"old").unwrap();
        store.mark_complete(done).unwrap();
        store.set_storage_probe(Box::new(FixedProbe(40_000_000)));

        let id = store.enqueue("location", &vec![7u8; 1024]).unwrap();
        assert!(store.get(id).unwrap().is_some());
        // Completed row was purged by the pressure path.
        assert!(store.get(done).unwrap().is_none());
    }

    #[test]
    fn critical_space_rejects_enqueue() {
        let mut store = test_store();
        store.set_storage_probe(Box::new(FixedProbe(5_000_000)));
        let err = store.enqueue("health", b"x").unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::EmergencyStorageFull {
                available: 5_000_000
            }
        ));
        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 0, "nothing inserted on emergency rejection");
    }

    #[test]
    fn probe_failure_does_not_block_enqueue() {
        struct BrokenProbe;
        impl StorageProbe for BrokenProbe {
            fn available_bytes(&self) -> std::io::Result<u64> {
                Err(std::io::Error::other("statvfs failed"))
            }
        }
        let mut store = test_store();
        store.set_storage_probe(Box::new(BrokenProbe));
        assert!(store.enqueue("health", b"x").is_ok());
    }

    // ── Queue byte budget ────────────────────────────────────────────

    #[test]
    fn over_budget_fails_with_post_cleanup_size() {
        let store = small_store(Limits {
            max_queue_bytes: 100,
            ..Limits::default()
        });

        store.enqueue("health", &[1u8; 60]).unwrap();
        let err = store.enqueue("health", &[2u8; 60]).unwrap_err();
        assert!(matches!(err, EnqueueError::QueueFull { current: 60, max: 100 }));
    }

    #[test]
    fn over_budget_succeeds_after_aged_cleanup() {
        let store = small_store(Limits {
            max_queue_bytes: 100,
            ..Limits::default()
        });

        // An exhausted-failed row past retention is reclaimable budget.
        let old = store.enqueue("health", &[1u8; 80]).unwrap();
        for _ in 0..MAX_UPLOAD_ATTEMPTS {
            store.increment_retry(old).unwrap();
        }
        set_created_at(&store, old, now_secs() - RETENTION.as_secs() as i64 - 60);

        let id = store.enqueue("health", &[2u8; 60]).unwrap();
        assert!(store.get(id).unwrap().is_some());
        assert!(store.get(old).unwrap().is_none());
    }

    // ── Dequeue ──────────────────────────────────────────────────────

    #[test]
    fn dequeue_orders_by_created_at_and_marks_uploading() {
        // Scenario: three 100-byte records at t=0,1,2 come back in
        // insertion order, all transitioned to uploading.
        let store = test_store();
        let base = now_secs();
        let mut ids = Vec::new();
        for offset in 0..3 {
            let id = store.enqueue("location", &[offset as u8; 100]).unwrap();
            set_created_at(&store, id, base + i64::from(offset));
            ids.push(id);
        }

        let records = store.dequeue_next(10).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
        for record in &records {
            assert_eq!(record.status, RecordStatus::Uploading);
        }
        // And they are claimed: a second dequeue sees nothing.
        assert!(store.dequeue_next(10).unwrap().is_empty());
    }

    #[test]
    fn dequeue_respects_limit() {
        let store = test_store();
        for _ in 0..5 {
            store.enqueue("health", b"x").unwrap();
        }
        assert_eq!(store.dequeue_next(2).unwrap().len(), 2);
        assert_eq!(store.dequeue_next(10).unwrap().len(), 3);
    }

    #[test]
    fn concurrent_dequeues_are_disjoint() {
        let store = Arc::new(test_store());
        for _ in 0..8 {
            store.enqueue("audio", b"chunk").unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store
                    .dequeue_next(2)
                    .unwrap()
                    .into_iter()
                    .map(|r| r.id)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        let mut claimed = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                claimed += 1;
                assert!(seen.insert(id), "record {id} dequeued twice");
            }
        }
        assert_eq!(claimed, 8);
    }

    #[test]
    fn dequeue_skips_rows_with_empty_stream_name() {
        let store = test_store();
        store
            .conn()
            .execute(
                "INSERT INTO outbox_queue (stream_name, data_blob, created_at, status) \
                 VALUES ('', x'00', ?1, 'pending')",
                params![now_secs()],
            )
            .unwrap();
        store.enqueue("health", b"good").unwrap();

        let records = store.dequeue_next(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stream_name, "health");
    }

    // ── Retry accounting ─────────────────────────────────────────────

    #[test]
    fn retry_exhaustion_excludes_record_from_dequeue() {
        // Scenario: five failed cycles leave the record at the attempt
        // cap, status failed, invisible to dequeue.
        let store = test_store();
        let id = store.enqueue("health", b"x").unwrap();

        for cycle in 1..=MAX_UPLOAD_ATTEMPTS {
            let records = store.dequeue_next(10).unwrap();
            assert_eq!(records.len(), 1, "cycle {cycle} should still see the record");
            store.increment_retry(id).unwrap();
        }

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.upload_attempts, MAX_UPLOAD_ATTEMPTS);
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(store.dequeue_next(10).unwrap().is_empty());
    }

    #[test]
    fn permanent_failure_forces_attempts_to_cap() {
        let store = test_store();
        let id = store.enqueue("health", b"x").unwrap();
        store.increment_retry(id).unwrap();
        store.mark_permanent_failure(id).unwrap();

        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.upload_attempts, MAX_UPLOAD_ATTEMPTS);
        assert!(store.dequeue_next(10).unwrap().is_empty());
    }

    #[test]
    fn attempts_never_decrease() {
        let store = test_store();
        let id = store.enqueue("health", b"x").unwrap();
        for _ in 0..7 {
            store.increment_retry(id).unwrap();
        }
        // Forcing permanent failure on an already-exhausted record must
        // not pull attempts back down to the cap.
        store.mark_permanent_failure(id).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().upload_attempts, 7);
    }

    // ── Stale reclaim ────────────────────────────────────────────────

    #[test]
    fn stale_upload_reverts_to_pending_once() {
        let store = test_store();
        let id = store.enqueue("health", b"x").unwrap();
        store.dequeue_next(1).unwrap();
        let stale_since = now_secs() - 700;
        set_last_attempt(&store, id, stale_since);

        let reclaimed = store.reset_stale_uploads(STALE_TIMEOUT).unwrap();
        assert_eq!(reclaimed, 1);
        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.upload_attempts, 1);

        // A second pass with no intervening dequeue must not charge a
        // second attempt.
        let reclaimed = store.reset_stale_uploads(STALE_TIMEOUT).unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(store.get(id).unwrap().unwrap().upload_attempts, 1);
    }

    #[test]
    fn fresh_upload_is_not_reclaimed() {
        let store = test_store();
        store.enqueue("health", b"x").unwrap();
        store.dequeue_next(1).unwrap();
        assert_eq!(store.reset_stale_uploads(STALE_TIMEOUT).unwrap(), 0);
    }

    #[test]
    fn open_reclaims_stale_uploads_from_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("outbox.db");

        let id = {
            let store = OutboxStore::open(&db_path, STREAMS, Limits::default()).unwrap();
            let id = store.enqueue("audio", b"chunk").unwrap();
            store.dequeue_next(1).unwrap();
            set_last_attempt(&store, id, now_secs() - 3600);
            id
        };

        // Simulated restart: open() must recover the orphaned row.
        let store = OutboxStore::open(&db_path, STREAMS, Limits::default()).unwrap();
        let record = store.get(id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Pending);
        assert_eq!(record.upload_attempts, 1);
    }

    // ── Cleanup ──────────────────────────────────────────────────────

    #[test]
    fn aged_cleanup_deletes_only_old_terminal_rows() {
        let store = test_store();
        let old_cutoff = now_secs() - RETENTION.as_secs() as i64 - 60;

        let old_done = store.enqueue("health", b"a").unwrap();
        store.mark_complete(old_done).unwrap();
        set_created_at(&store, old_done, old_cutoff);

        let old_exhausted = store.enqueue("health", b"b").unwrap();
        for _ in 0..MAX_UPLOAD_ATTEMPTS {
            store.increment_retry(old_exhausted).unwrap();
        }
        set_created_at(&store, old_exhausted, old_cutoff);

        let old_retryable = store.enqueue("health", b"c").unwrap();
        store.increment_retry(old_retryable).unwrap();
        set_created_at(&store, old_retryable, old_cutoff);

        let fresh_done = store.enqueue("health", b"d").unwrap();
        store.mark_complete(fresh_done).unwrap();

        let pending = store.enqueue("health", b"e").unwrap();
        set_created_at(&store, pending, old_cutoff);

        assert_eq!(store.cleanup_aged().unwrap(), 2);
        assert!(store.get(old_done).unwrap().is_none());
        assert!(store.get(old_exhausted).unwrap().is_none());
        assert!(store.get(old_retryable).unwrap().is_some());
        assert!(store.get(fresh_done).unwrap().is_some());
        assert!(store.get(pending).unwrap().is_some());
    }

    #[test]
    fn aggressive_cleanup_deletes_all_completed() {
        let store = test_store();
        let done = store.enqueue("health", b"a").unwrap();
        store.mark_complete(done).unwrap();
        let pending = store.enqueue("health", b"b").unwrap();

        assert_eq!(store.cleanup_aggressive().unwrap(), 1);
        assert!(store.get(done).unwrap().is_none());
        assert!(store.get(pending).unwrap().is_some());
    }

    // ── Integrity sweep ──────────────────────────────────────────────

    #[test]
    fn integrity_sweep_removes_unknown_and_empty_streams() {
        let store = test_store();
        store.enqueue("health", b"keep").unwrap();
        for bad in ["", "retired_stream"] {
            store
                .conn()
                .execute(
                    "INSERT INTO outbox_queue (stream_name, data_blob, created_at, status) \
                     VALUES (?1, x'00', ?2, 'pending')",
                    params![bad, now_secs()],
                )
                .unwrap();
        }

        assert_eq!(store.remove_invalid_streams().unwrap(), 2);
        assert_eq!(store.stats().unwrap().total, 1);
    }

    // ── Stats ────────────────────────────────────────────────────────

    #[test]
    fn stats_cover_live_rows_only() {
        let store = test_store();
        let uploading = store.enqueue("health", &[0u8; 10]).unwrap();
        store.enqueue("health", &[0u8; 20]).unwrap();
        let failed = store.enqueue("location", &[0u8; 30]).unwrap();
        let done = store.enqueue("location", &[0u8; 40]).unwrap();

        // Claim the oldest, fail one, complete one. Leaves one pending.
        let claimed = store.dequeue_next(1).unwrap();
        assert_eq!(claimed[0].id, uploading);
        store.increment_retry(failed).unwrap();
        store.mark_complete(done).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.total_bytes, 60);
    }

    #[test]
    fn stream_counts_cover_pending_and_uploading() {
        let store = test_store();
        store.enqueue("health", b"a").unwrap();
        store.enqueue("health", b"b").unwrap();
        store.enqueue("audio", b"c").unwrap();
        let failed = store.enqueue("location", b"d").unwrap();
        store.increment_retry(failed).unwrap();

        let counts = store.stream_counts().unwrap();
        assert_eq!(counts, vec![("audio".to_string(), 1), ("health".to_string(), 2)]);
    }
}
