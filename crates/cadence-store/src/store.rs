//! SQLite-backed tracking store.
//!
//! One connection behind a mutex; `claim_chunk`, `finalize`, and
//! `mark_failed_as_retryable` each run in a single transaction, which
//! makes them linearizable per row. Aggregate counters are always derived
//! by query, never cached.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{DeliveryReport, DeliveryStatus};
use cadence_core::types::{Contact, EmailKind, SendMode, SendStatus, TrackingRow};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const TRACKING_COLUMNS: &str = "id, org_id, contact_id, email_type, scheduled_date, send_status, \
     send_mode, test_email, send_attempt_count, last_attempt_date, last_error, batch_id, \
     message_id, delivery_status, status_checked_at, status_details, created_at, updated_at, \
     retryable";

/// A tracking row to insert; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewTrackingRow {
    pub org_id: i64,
    pub contact_id: String,
    pub email_type: EmailKind,
    pub scheduled_date: NaiveDate,
    pub send_mode: SendMode,
    pub test_email: Option<String>,
    pub batch_id: String,
}

/// Terminal verdict for one processed row.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub status: SendStatus,
    pub error: Option<String>,
    pub message_id: Option<String>,
    /// For failed rows: whether the failure was transient and the row may
    /// be retried. Permanent gateway rejections clear this.
    pub retryable: bool,
}

impl FinalizeOutcome {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Sent,
            error: None,
            message_id: Some(message_id.into()),
            retryable: false,
        }
    }

    /// A transient failure, eligible for retry.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            error: Some(error.into()),
            message_id: None,
            retryable: true,
        }
    }

    /// A permanent failure; the retry operation leaves these rows alone.
    pub fn failed_permanent(error: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Failed,
            error: Some(error.into()),
            message_id: None,
            retryable: false,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: SendStatus::Skipped,
            error: Some(reason.into()),
            message_id: None,
            retryable: false,
        }
    }
}

/// Aggregate view of one batch.
#[derive(Debug, Clone)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    /// Terminal-success union: accepted + sent + delivered.
    pub sent: i64,
    pub failed: i64,
    pub deferred: i64,
    pub bounced: i64,
    pub dropped: i64,
    pub skipped: i64,
    pub send_mode: Option<SendMode>,
    pub test_email: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub is_complete: bool,
}

/// One row of `list_batches`.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub send_mode: Option<SendMode>,
    pub created_at: Option<String>,
    pub is_complete: bool,
}

/// Filters for `list_batches`.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    /// Keep batches containing at least one row with this status.
    pub status: Option<SendStatus>,
    pub send_mode: Option<SendMode>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// The tracking store for one organization database.
pub struct TrackingStore {
    conn: Mutex<Connection>,
    lease_counter: AtomicI64,
}

impl TrackingStore {
    /// Open or create the store and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path).map_err(|e| store_err("DB open", e))?;
        Self::from_connection(conn)
    }

    /// In-memory store, for tests and dry scheduling runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("DB open", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| store_err("busy_timeout", e))?;
        let store = Self {
            conn: Mutex::new(conn),
            lease_counter: AtomicI64::new(0),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Idempotent schema-ensure, run once at pipeline start.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS email_send_tracking (
                id INTEGER PRIMARY KEY,
                org_id INTEGER NOT NULL,
                contact_id TEXT NOT NULL,
                email_type TEXT NOT NULL,
                scheduled_date TEXT NOT NULL,
                send_status TEXT NOT NULL DEFAULT 'pending',
                send_mode TEXT NOT NULL,
                test_email TEXT,
                send_attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_date TEXT,
                last_error TEXT,
                retryable INTEGER NOT NULL DEFAULT 1,
                batch_id TEXT NOT NULL,
                message_id TEXT,
                delivery_status TEXT,
                status_checked_at TEXT,
                status_details TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_tracking_unique
                ON email_send_tracking(org_id, batch_id, contact_id, email_type, scheduled_date);
            CREATE INDEX IF NOT EXISTS idx_tracking_batch ON email_send_tracking(batch_id);
            CREATE INDEX IF NOT EXISTS idx_tracking_status ON email_send_tracking(send_status);
            CREATE INDEX IF NOT EXISTS idx_tracking_mode ON email_send_tracking(send_mode);
            CREATE INDEX IF NOT EXISTS idx_tracking_contact ON email_send_tracking(contact_id);
            CREATE INDEX IF NOT EXISTS idx_tracking_contact_type
                ON email_send_tracking(contact_id, email_type);
            CREATE INDEX IF NOT EXISTS idx_tracking_status_date
                ON email_send_tracking(send_status, scheduled_date);
            CREATE INDEX IF NOT EXISTS idx_tracking_message ON email_send_tracking(message_id);
            CREATE INDEX IF NOT EXISTS idx_tracking_delivery
                ON email_send_tracking(delivery_status);

            -- updated_at refresh on any mutation that did not set it itself.
            CREATE TRIGGER IF NOT EXISTS trg_tracking_touch
            AFTER UPDATE ON email_send_tracking
            FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
            BEGIN
                UPDATE email_send_tracking
                   SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = NEW.id;
            END;

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT NOT NULL,
                org_id INTEGER NOT NULL,
                first_name TEXT,
                last_name TEXT,
                email TEXT NOT NULL DEFAULT '',
                state TEXT,
                zip_code TEXT,
                birth_date TEXT,
                effective_date TEXT,
                PRIMARY KEY (org_id, id)
            );
            ",
        )
        .map_err(|e| store_err("Migration", e))?;

        // Add new columns for existing databases (safe to fail when they
        // already exist).
        let _ = conn.execute(
            "ALTER TABLE email_send_tracking ADD COLUMN retryable INTEGER NOT NULL DEFAULT 1",
            [],
        );

        Ok(())
    }

    // ─── Batch insertion ──────────────────────────────────────

    /// Insert a batch of rows atomically. Any duplicate within
    /// `(org, batch, contact, kind, date)` fails the whole call.
    pub fn insert_batch(&self, rows: &[NewTrackingRow]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| store_err("Begin insert", e))?;
        let now = Utc::now().to_rfc3339();
        for row in rows {
            tx.execute(
                "INSERT INTO email_send_tracking
                 (org_id, contact_id, email_type, scheduled_date, send_status, send_mode,
                  test_email, batch_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?8)",
                params![
                    row.org_id,
                    row.contact_id,
                    row.email_type.as_str(),
                    row.scheduled_date.format("%Y-%m-%d").to_string(),
                    row.send_mode.as_str(),
                    row.test_email,
                    row.batch_id,
                    now,
                ],
            )
            .map_err(|e| {
                store_err(
                    &format!("Insert tracking row for contact {}", row.contact_id),
                    e,
                )
            })?;
        }
        tx.commit().map_err(|e| store_err("Commit insert", e))?;
        tracing::info!("💾 Inserted {} tracking rows", rows.len());
        Ok(rows.len())
    }

    // ─── Chunk claiming & finalization ────────────────────────

    /// Atomically claim up to `n` pending rows of a batch, transitioning
    /// them to processing. Returns a monotonically increasing lease id
    /// with the claimed rows.
    pub fn claim_chunk(&self, batch_id: &str, n: usize) -> Result<(i64, Vec<TrackingRow>)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| store_err("Begin claim", e))?;

        let ids: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM email_send_tracking
                     WHERE batch_id = ?1 AND send_status = 'pending'
                     ORDER BY scheduled_date, id
                     LIMIT ?2",
                )
                .map_err(|e| store_err("Prepare claim", e))?;
            let mapped = stmt
                .query_map(params![batch_id, n as i64], |row| row.get(0))
                .map_err(|e| store_err("Select pending", e))?;
            mapped
                .collect::<rusqlite::Result<Vec<i64>>>()
                .map_err(|e| store_err("Collect pending", e))?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE email_send_tracking
                    SET send_status = 'processing', updated_at = ?2
                  WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .map_err(|e| store_err("Claim update", e))?;
        }
        for id in &ids {
            let row = tx
                .query_row(
                    &format!("SELECT {TRACKING_COLUMNS} FROM email_send_tracking WHERE id = ?1"),
                    params![id],
                    row_to_tracking,
                )
                .map_err(|e| store_err("Read claimed row", e))?;
            claimed.push(row);
        }
        tx.commit().map_err(|e| store_err("Commit claim", e))?;

        let lease = self.lease_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((lease, claimed))
    }

    /// Finalize one processing row. The transition table of the send
    /// state machine is enforced here; illegal transitions are rejected
    /// without touching the row.
    pub fn finalize(&self, row_id: i64, outcome: &FinalizeOutcome) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| store_err("Begin finalize", e))?;

        let current = current_status(&tx, row_id)?;
        if !SendStatus::can_transition(current, outcome.status) {
            return Err(CadenceError::IllegalTransition {
                from: current.as_str().into(),
                to: outcome.status.as_str().into(),
            });
        }

        tx.execute(
            "UPDATE email_send_tracking
                SET send_status = ?2,
                    last_attempt_date = ?3,
                    last_error = ?4,
                    message_id = COALESCE(?5, message_id),
                    retryable = ?6,
                    updated_at = ?3
              WHERE id = ?1",
            params![
                row_id,
                outcome.status.as_str(),
                Utc::now().to_rfc3339(),
                outcome.error,
                outcome.message_id,
                outcome.retryable as i32,
            ],
        )
        .map_err(|e| store_err("Finalize update", e))?;
        tx.commit().map_err(|e| store_err("Commit finalize", e))?;
        Ok(())
    }

    /// Transition up to `n` failed rows of a batch back to pending and
    /// bump their attempt counts. Rows at the attempt cap stay failed, as
    /// do permanently rejected rows (`retryable = 0`).
    pub fn mark_failed_as_retryable(
        &self,
        batch_id: &str,
        n: usize,
        max_attempts: u32,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE email_send_tracking
                    SET send_status = 'pending',
                        send_attempt_count = send_attempt_count + 1,
                        updated_at = ?4
                  WHERE id IN (
                        SELECT id FROM email_send_tracking
                         WHERE batch_id = ?1
                           AND send_status = 'failed'
                           AND retryable = 1
                           AND send_attempt_count < ?2
                         ORDER BY scheduled_date, id
                         LIMIT ?3)",
                params![batch_id, max_attempts, n as i64, Utc::now().to_rfc3339()],
            )
            .map_err(|e| store_err("Mark retryable", e))?;
        if changed > 0 {
            tracing::info!("🔁 Marked {changed} failed rows retryable in batch {batch_id}");
        }
        Ok(changed)
    }

    // ─── Delivery status bookkeeping ──────────────────────────

    /// Rows whose gateway delivery outcome is worth re-querying: a message
    /// id exists, the send landed (sent/accepted/deferred), and the last
    /// check is missing or older than `cutoff`.
    pub fn stale_delivery_candidates(
        &self,
        batch_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrackingRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRACKING_COLUMNS} FROM email_send_tracking
                 WHERE batch_id = ?1
                   AND message_id IS NOT NULL
                   AND send_status IN ('sent', 'accepted', 'deferred')
                   AND (status_checked_at IS NULL OR status_checked_at < ?2)
                 ORDER BY id
                 LIMIT ?3"
            ))
            .map_err(|e| store_err("Prepare stale query", e))?;
        let rows = stmt
            .query_map(
                params![batch_id, cutoff.to_rfc3339(), limit as i64],
                row_to_tracking,
            )
            .map_err(|e| store_err("Stale query", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("Collect stale rows", e))?;
        Ok(rows)
    }

    /// Record the outcome of one delivery-status query. Unknown outcomes
    /// only refresh the check timestamp; terminal outcomes transition the
    /// row.
    pub fn record_status_check(&self, row_id: i64, report: &DeliveryReport) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| store_err("Begin status check", e))?;
        let now = Utc::now().to_rfc3339();

        let target = match report.status {
            DeliveryStatus::Delivered => Some(SendStatus::Delivered),
            DeliveryStatus::Deferred => Some(SendStatus::Deferred),
            DeliveryStatus::Bounced => Some(SendStatus::Bounced),
            DeliveryStatus::Dropped => Some(SendStatus::Dropped),
            DeliveryStatus::Unknown => None,
        };

        match target {
            None => {
                tx.execute(
                    "UPDATE email_send_tracking
                        SET status_checked_at = ?2, status_details = ?3, updated_at = ?2
                      WHERE id = ?1",
                    params![row_id, now, report.details],
                )
                .map_err(|e| store_err("Status check update", e))?;
            }
            Some(status) => {
                let current = current_status(&tx, row_id)?;
                if current != status && !SendStatus::can_transition(current, status) {
                    return Err(CadenceError::IllegalTransition {
                        from: current.as_str().into(),
                        to: status.as_str().into(),
                    });
                }
                tx.execute(
                    "UPDATE email_send_tracking
                        SET send_status = ?2,
                            delivery_status = ?3,
                            status_checked_at = ?4,
                            status_details = ?5,
                            updated_at = ?4
                      WHERE id = ?1",
                    params![
                        row_id,
                        status.as_str(),
                        report.status.as_str(),
                        now,
                        report.details,
                    ],
                )
                .map_err(|e| store_err("Status check update", e))?;
            }
        }
        tx.commit().map_err(|e| store_err("Commit status check", e))?;
        Ok(())
    }

    // ─── Batch queries ────────────────────────────────────────

    /// Aggregate counts for one batch; `None` when the batch id is
    /// unknown.
    pub fn get_batch(&self, batch_id: &str) -> Result<Option<BatchStatus>> {
        let conn = self.conn.lock().unwrap();
        let status = conn
            .query_row(
                "SELECT COUNT(*),
                        SUM(CASE WHEN send_status = 'pending' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN send_status = 'processing' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN send_status IN ('accepted','sent','delivered') THEN 1 ELSE 0 END),
                        SUM(CASE WHEN send_status = 'failed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN send_status = 'deferred' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN send_status = 'bounced' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN send_status = 'dropped' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN send_status = 'skipped' THEN 1 ELSE 0 END),
                        MAX(send_mode),
                        MAX(test_email),
                        MAX(created_at),
                        MAX(updated_at)
                 FROM email_send_tracking WHERE batch_id = ?1",
                params![batch_id],
                |row| {
                    let total: i64 = row.get(0)?;
                    let pending: i64 = row.get::<_, Option<i64>>(1)?.unwrap_or(0);
                    let processing: i64 = row.get::<_, Option<i64>>(2)?.unwrap_or(0);
                    Ok(BatchStatus {
                        batch_id: batch_id.to_string(),
                        total,
                        pending,
                        processing,
                        sent: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        failed: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                        deferred: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                        bounced: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                        dropped: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                        skipped: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                        send_mode: row
                            .get::<_, Option<String>>(9)?
                            .as_deref()
                            .and_then(SendMode::parse),
                        test_email: row.get(10)?,
                        created_at: row.get(11)?,
                        updated_at: row.get(12)?,
                        is_complete: pending == 0 && processing == 0,
                    })
                },
            )
            .map_err(|e| store_err("Batch status", e))?;
        if status.total == 0 {
            return Ok(None);
        }
        Ok(Some(status))
    }

    /// Recent batches matching the filter, newest first.
    pub fn list_batches(&self, filter: &BatchFilter) -> Result<Vec<BatchSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT batch_id,
                    COUNT(*),
                    SUM(CASE WHEN send_status = 'pending' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN send_status IN ('accepted','sent','delivered') THEN 1 ELSE 0 END),
                    SUM(CASE WHEN send_status = 'failed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN send_status = 'processing' THEN 1 ELSE 0 END),
                    MAX(send_mode),
                    MAX(created_at)
             FROM email_send_tracking",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push(
                "batch_id IN (SELECT DISTINCT batch_id FROM email_send_tracking WHERE send_status = ?)"
                    .into(),
            );
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(mode) = filter.send_mode {
            clauses.push("send_mode = ?".into());
            args.push(Box::new(mode.as_str().to_string()));
        }
        if let Some(after) = filter.created_after {
            clauses.push("created_at >= ?".into());
            args.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = filter.created_before {
            clauses.push("created_at <= ?".into());
            args.push(Box::new(before.to_rfc3339()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" GROUP BY batch_id ORDER BY MAX(created_at) DESC LIMIT ?");
        args.push(Box::new(filter.limit.unwrap_or(20) as i64));

        let mut stmt = conn.prepare(&sql).map_err(|e| store_err("Prepare list", e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let pending: i64 = row.get::<_, Option<i64>>(2)?.unwrap_or(0);
                let processing: i64 = row.get::<_, Option<i64>>(5)?.unwrap_or(0);
                Ok(BatchSummary {
                    batch_id: row.get(0)?,
                    total: row.get(1)?,
                    pending,
                    sent: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    failed: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    send_mode: row
                        .get::<_, Option<String>>(6)?
                        .as_deref()
                        .and_then(SendMode::parse),
                    created_at: row.get(7)?,
                    is_complete: pending == 0 && processing == 0,
                })
            })
            .map_err(|e| store_err("List batches", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| store_err("Collect batches", e))?;
        Ok(rows)
    }

    /// Look a row up by its gateway message id (event-webhook path).
    pub fn find_by_message_id(&self, message_id: &str) -> Result<Option<TrackingRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {TRACKING_COLUMNS} FROM email_send_tracking WHERE message_id = ?1 LIMIT 1"
            ),
            params![message_id],
            row_to_tracking,
        )
        .optional()
        .map_err(|e| store_err("Message id lookup", e))
    }

    /// The organization a batch belongs to; `None` for unknown batches.
    pub fn batch_org_id(&self, batch_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT org_id FROM email_send_tracking WHERE batch_id = ?1 LIMIT 1",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| store_err("Batch org lookup", e))
    }

    /// Fetch one tracking row.
    pub fn row(&self, row_id: i64) -> Result<Option<TrackingRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {TRACKING_COLUMNS} FROM email_send_tracking WHERE id = ?1"),
            params![row_id],
            row_to_tracking,
        )
        .optional()
        .map_err(|e| store_err("Read row", e))
    }

    // ─── Contacts ─────────────────────────────────────────────

    /// Insert or refresh contact records for the pipeline's contact
    /// resolution.
    pub fn upsert_contacts(&self, contacts: &[Contact]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| store_err("Begin upsert", e))?;
        for contact in contacts {
            tx.execute(
                "INSERT OR REPLACE INTO contacts
                 (id, org_id, first_name, last_name, email, state, zip_code,
                  birth_date, effective_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    contact.id,
                    contact.org_id,
                    contact.first_name,
                    contact.last_name,
                    contact.email,
                    contact.state,
                    contact.zip_code,
                    contact.birth_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    contact.effective_date.map(|d| d.format("%Y-%m-%d").to_string()),
                ],
            )
            .map_err(|e| store_err("Upsert contact", e))?;
        }
        tx.commit().map_err(|e| store_err("Commit upsert", e))?;
        Ok(contacts.len())
    }

    pub fn get_contact(&self, org_id: i64, contact_id: &str) -> Result<Option<Contact>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, org_id, first_name, last_name, email, state, zip_code,
                    birth_date, effective_date
             FROM contacts WHERE org_id = ?1 AND id = ?2",
            params![org_id, contact_id],
            |row| {
                Ok(Contact {
                    id: row.get(0)?,
                    org_id: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    email: row.get(4)?,
                    state: row.get(5)?,
                    zip_code: row.get(6)?,
                    birth_date: row
                        .get::<_, Option<String>>(7)?
                        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
                    effective_date: row
                        .get::<_, Option<String>>(8)?
                        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
                })
            },
        )
        .optional()
        .map_err(|e| store_err("Read contact", e))
    }
}

fn current_status(tx: &rusqlite::Transaction<'_>, row_id: i64) -> Result<SendStatus> {
    let raw: String = tx
        .query_row(
            "SELECT send_status FROM email_send_tracking WHERE id = ?1",
            params![row_id],
            |row| row.get(0),
        )
        .map_err(|e| store_err(&format!("Row {row_id} lookup"), e))?;
    SendStatus::parse(&raw)
        .ok_or_else(|| CadenceError::Store(format!("Row {row_id} has unknown status '{raw}'")))
}

fn row_to_tracking(row: &Row<'_>) -> rusqlite::Result<TrackingRow> {
    let email_type: String = row.get(3)?;
    let scheduled: String = row.get(4)?;
    let status: String = row.get(5)?;
    let mode: String = row.get(6)?;
    Ok(TrackingRow {
        id: row.get(0)?,
        org_id: row.get(1)?,
        contact_id: row.get(2)?,
        email_type: EmailKind::parse(&email_type).unwrap_or(EmailKind::All),
        scheduled_date: NaiveDate::parse_from_str(&scheduled, "%Y-%m-%d")
            .unwrap_or_else(|_| NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch")),
        send_status: SendStatus::parse(&status).unwrap_or(SendStatus::Failed),
        send_mode: SendMode::parse(&mode).unwrap_or(SendMode::Test),
        test_email: row.get(7)?,
        send_attempt_count: row.get(8)?,
        last_attempt_date: parse_instant(row.get::<_, Option<String>>(9)?),
        last_error: row.get(10)?,
        batch_id: row.get(11)?,
        message_id: row.get(12)?,
        delivery_status: row.get(13)?,
        status_checked_at: parse_instant(row.get::<_, Option<String>>(14)?),
        status_details: row.get(15)?,
        created_at: parse_instant(row.get::<_, Option<String>>(16)?).unwrap_or_else(Utc::now),
        updated_at: parse_instant(row.get::<_, Option<String>>(17)?).unwrap_or_else(Utc::now),
        retryable: row.get::<_, i64>(18)? != 0,
    })
}

fn parse_instant(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn store_err(context: &str, e: impl std::fmt::Display) -> CadenceError {
    CadenceError::Store(format!("{context}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_row(contact_id: &str, kind: EmailKind, date: (i32, u32, u32), batch: &str) -> NewTrackingRow {
        NewTrackingRow {
            org_id: 7,
            contact_id: contact_id.into(),
            email_type: kind,
            scheduled_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            send_mode: SendMode::Test,
            test_email: Some("qa@example.com".into()),
            batch_id: batch.into(),
        }
    }

    fn seeded_store(batch: &str, n: usize) -> TrackingStore {
        let store = TrackingStore::open_in_memory().unwrap();
        let rows: Vec<_> = (0..n)
            .map(|i| new_row(&format!("c{i}"), EmailKind::Birthday, (2024, 6, 1 + i as u32), batch))
            .collect();
        store.insert_batch(&rows).unwrap();
        store
    }

    #[test]
    fn test_open_and_migrate_twice() {
        let dir = std::env::temp_dir().join("cadence-store-test-migrate");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("tracking.db");
        {
            let store = TrackingStore::open(&path).unwrap();
            assert!(store.get_batch("none").unwrap().is_none());
        }
        // Re-opening re-runs the schema-ensure without complaint.
        let store = TrackingStore::open(&path).unwrap();
        assert!(store.get_batch("none").unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_insert_round_trip_counts() {
        let store = seeded_store("b1", 3);
        let status = store.get_batch("b1").unwrap().unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.pending, 3);
        assert_eq!(status.sent, 0);
        assert!(!status.is_complete);
        assert_eq!(status.send_mode, Some(SendMode::Test));
    }

    #[test]
    fn test_duplicate_insert_fails_whole_call() {
        let store = seeded_store("b1", 2);
        let dupe = vec![
            new_row("fresh", EmailKind::Birthday, (2024, 7, 1), "b1"),
            // Same (org, batch, contact, kind, date) as an existing row.
            new_row("c0", EmailKind::Birthday, (2024, 6, 1), "b1"),
        ];
        assert!(store.insert_batch(&dupe).is_err());
        // The non-duplicate row rolled back with the rest.
        assert_eq!(store.get_batch("b1").unwrap().unwrap().total, 2);
    }

    #[test]
    fn test_claim_transitions_and_leases_increase() {
        let store = seeded_store("b1", 5);
        let (lease_a, rows_a) = store.claim_chunk("b1", 2).unwrap();
        assert_eq!(rows_a.len(), 2);
        assert!(rows_a.iter().all(|r| r.send_status == SendStatus::Processing));
        // Claims are ordered by scheduled date.
        assert!(rows_a[0].scheduled_date < rows_a[1].scheduled_date);

        let (lease_b, rows_b) = store.claim_chunk("b1", 10).unwrap();
        assert!(lease_b > lease_a);
        assert_eq!(rows_b.len(), 3);
        // Disjoint chunks.
        assert!(rows_a.iter().all(|a| rows_b.iter().all(|b| a.id != b.id)));

        let (_, rows_c) = store.claim_chunk("b1", 10).unwrap();
        assert!(rows_c.is_empty());
    }

    #[test]
    fn test_finalize_enforces_transitions() {
        let store = seeded_store("b1", 1);
        let (_, rows) = store.claim_chunk("b1", 1).unwrap();
        let id = rows[0].id;

        store.finalize(id, &FinalizeOutcome::sent("msg-1")).unwrap();
        let row = store.row(id).unwrap().unwrap();
        assert_eq!(row.send_status, SendStatus::Sent);
        assert_eq!(row.message_id.as_deref(), Some("msg-1"));
        assert!(row.last_attempt_date.is_some());

        // Terminal-success rows cannot be re-finalized as failed.
        let err = store.finalize(id, &FinalizeOutcome::failed("boom")).unwrap_err();
        assert!(matches!(err, CadenceError::IllegalTransition { .. }));

        // Nor can a pending row be finalized without a claim.
        let store2 = seeded_store("b2", 1);
        let pending_id = {
            let (_, rows) = store2.claim_chunk("b2", 1).unwrap();
            let id = rows[0].id;
            store2.finalize(id, &FinalizeOutcome::failed("transient")).unwrap();
            store2.mark_failed_as_retryable("b2", 1, 5).unwrap();
            id
        };
        let err = store2
            .finalize(pending_id, &FinalizeOutcome::sent("m"))
            .unwrap_err();
        assert!(matches!(err, CadenceError::IllegalTransition { .. }));
    }

    #[test]
    fn test_retry_increments_and_caps_attempts() {
        let store = seeded_store("b1", 1);
        let (_, rows) = store.claim_chunk("b1", 1).unwrap();
        let id = rows[0].id;
        store.finalize(id, &FinalizeOutcome::failed("gateway 500")).unwrap();

        // attempt_count is bumped by the retry operation, not by finalize.
        assert_eq!(store.row(id).unwrap().unwrap().send_attempt_count, 0);
        assert_eq!(store.mark_failed_as_retryable("b1", 10, 2).unwrap(), 1);
        let row = store.row(id).unwrap().unwrap();
        assert_eq!(row.send_status, SendStatus::Pending);
        assert_eq!(row.send_attempt_count, 1);

        // Fail again, retry again: second and last allowed retry.
        store.claim_chunk("b1", 1).unwrap();
        store.finalize(id, &FinalizeOutcome::failed("gateway 500")).unwrap();
        assert_eq!(store.mark_failed_as_retryable("b1", 10, 2).unwrap(), 1);
        assert_eq!(store.row(id).unwrap().unwrap().send_attempt_count, 2);

        // At the cap now: no further retries.
        store.claim_chunk("b1", 1).unwrap();
        store.finalize(id, &FinalizeOutcome::failed("gateway 500")).unwrap();
        assert_eq!(store.mark_failed_as_retryable("b1", 10, 2).unwrap(), 0);
        assert_eq!(store.row(id).unwrap().unwrap().send_status, SendStatus::Failed);
    }

    #[test]
    fn test_permanent_failures_are_not_retried() {
        let store = seeded_store("b1", 2);
        let (_, rows) = store.claim_chunk("b1", 2).unwrap();
        store.finalize(rows[0].id, &FinalizeOutcome::failed("gateway 503")).unwrap();
        store
            .finalize(rows[1].id, &FinalizeOutcome::failed_permanent("rejected (400): bad address"))
            .unwrap();
        assert!(store.row(rows[0].id).unwrap().unwrap().retryable);
        assert!(!store.row(rows[1].id).unwrap().unwrap().retryable);

        // Only the transient failure goes back to pending.
        assert_eq!(store.mark_failed_as_retryable("b1", 10, 5).unwrap(), 1);
        let transient = store.row(rows[0].id).unwrap().unwrap();
        assert_eq!(transient.send_status, SendStatus::Pending);
        assert_eq!(transient.send_attempt_count, 1);
        let permanent = store.row(rows[1].id).unwrap().unwrap();
        assert_eq!(permanent.send_status, SendStatus::Failed);
        assert_eq!(permanent.send_attempt_count, 0);

        // Repeated retry passes keep ignoring the permanent row.
        store.claim_chunk("b1", 1).unwrap();
        store.finalize(rows[0].id, &FinalizeOutcome::sent("m0")).unwrap();
        assert_eq!(store.mark_failed_as_retryable("b1", 10, 5).unwrap(), 0);
    }

    #[test]
    fn test_retry_round_trip_to_complete() {
        // Insert 3; claim; 2 sent + 1 failed; retry; finish. Mirrors the
        // end-to-end retry scenario at the store level.
        let store = seeded_store("b1", 3);
        let (_, rows) = store.claim_chunk("b1", 3).unwrap();
        store.finalize(rows[0].id, &FinalizeOutcome::sent("m0")).unwrap();
        store.finalize(rows[1].id, &FinalizeOutcome::sent("m1")).unwrap();
        store.finalize(rows[2].id, &FinalizeOutcome::failed("timeout")).unwrap();

        let status = store.get_batch("b1").unwrap().unwrap();
        assert_eq!((status.sent, status.failed, status.pending), (2, 1, 0));
        assert!(status.is_complete);

        assert_eq!(store.mark_failed_as_retryable("b1", 1, 5).unwrap(), 1);
        assert!(!store.get_batch("b1").unwrap().unwrap().is_complete);

        let (_, retry_rows) = store.claim_chunk("b1", 1).unwrap();
        assert_eq!(retry_rows.len(), 1);
        assert_eq!(retry_rows[0].send_attempt_count, 1);
        store.finalize(retry_rows[0].id, &FinalizeOutcome::sent("m2")).unwrap();

        let status = store.get_batch("b1").unwrap().unwrap();
        assert_eq!(status.sent, 3);
        assert!(status.is_complete);
    }

    #[test]
    fn test_status_check_transitions() {
        let store = seeded_store("b1", 2);
        let (_, rows) = store.claim_chunk("b1", 2).unwrap();
        store.finalize(rows[0].id, &FinalizeOutcome::sent("m0")).unwrap();
        store.finalize(rows[1].id, &FinalizeOutcome::sent("m1")).unwrap();

        // Both rows are stale (never checked).
        let stale = store
            .stale_delivery_candidates("b1", Utc::now(), 10)
            .unwrap();
        assert_eq!(stale.len(), 2);

        store
            .record_status_check(
                rows[0].id,
                &DeliveryReport { status: DeliveryStatus::Delivered, details: None },
            )
            .unwrap();
        let row = store.row(rows[0].id).unwrap().unwrap();
        assert_eq!(row.send_status, SendStatus::Delivered);
        assert_eq!(row.delivery_status.as_deref(), Some("delivered"));
        assert!(row.status_checked_at.is_some());

        // Unknown leaves the status alone but stamps the check.
        store
            .record_status_check(
                rows[1].id,
                &DeliveryReport {
                    status: DeliveryStatus::Unknown,
                    details: Some("not indexed yet".into()),
                },
            )
            .unwrap();
        let row = store.row(rows[1].id).unwrap().unwrap();
        assert_eq!(row.send_status, SendStatus::Sent);
        assert!(row.status_checked_at.is_some());

        // A freshly checked row is no longer stale against an old cutoff.
        let stale = store
            .stale_delivery_candidates("b1", Utc::now() - chrono::Duration::minutes(10), 10)
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_find_by_message_id() {
        let store = seeded_store("b1", 1);
        let (_, rows) = store.claim_chunk("b1", 1).unwrap();
        store.finalize(rows[0].id, &FinalizeOutcome::sent("msg-42")).unwrap();

        let found = store.find_by_message_id("msg-42").unwrap().unwrap();
        assert_eq!(found.id, rows[0].id);
        assert!(store.find_by_message_id("msg-43").unwrap().is_none());
    }

    #[test]
    fn test_list_batches_filters() {
        let store = TrackingStore::open_in_memory().unwrap();
        store
            .insert_batch(&[new_row("c1", EmailKind::Birthday, (2024, 6, 1), "batch-a")])
            .unwrap();
        let mut prod = new_row("c2", EmailKind::Aep, (2024, 8, 18), "batch-b");
        prod.send_mode = SendMode::Production;
        prod.test_email = None;
        store.insert_batch(&[prod]).unwrap();

        let all = store.list_batches(&BatchFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let test_only = store
            .list_batches(&BatchFilter { send_mode: Some(SendMode::Test), ..Default::default() })
            .unwrap();
        assert_eq!(test_only.len(), 1);
        assert_eq!(test_only[0].batch_id, "batch-a");

        let with_pending = store
            .list_batches(&BatchFilter { status: Some(SendStatus::Pending), ..Default::default() })
            .unwrap();
        assert_eq!(with_pending.len(), 2);

        let with_sent = store
            .list_batches(&BatchFilter { status: Some(SendStatus::Sent), ..Default::default() })
            .unwrap();
        assert!(with_sent.is_empty());
    }

    #[test]
    fn test_contact_round_trip() {
        let store = TrackingStore::open_in_memory().unwrap();
        let contact = Contact {
            id: "c-9".into(),
            org_id: 7,
            first_name: Some("Ada".into()),
            last_name: Some("Nguyen".into()),
            email: "ada@example.com".into(),
            state: Some("CA".into()),
            zip_code: Some("94110".into()),
            birth_date: NaiveDate::from_ymd_opt(1960, 12, 15),
            effective_date: None,
        };
        store.upsert_contacts(&[contact.clone()]).unwrap();
        let loaded = store.get_contact(7, "c-9").unwrap().unwrap();
        assert_eq!(loaded.email, contact.email);
        assert_eq!(loaded.birth_date, contact.birth_date);
        assert!(store.get_contact(8, "c-9").unwrap().is_none());
    }
}
