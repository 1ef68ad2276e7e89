//! The delivery pipeline — batch creation, chunked sending, retry,
//! resume, and delivery-status refresh.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cadence_core::config::PipelineConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{Envelope, MailGateway, TemplateRenderer};
use cadence_core::types::{
    Contact, ContactSchedule, EmailKind, Organization, SendMode, SendStatus, TrackingRow,
};
use cadence_store::{FinalizeOutcome, NewTrackingRow, TrackingStore};
use chrono::{Duration, NaiveDate, Utc};

use crate::scope::Scope;

/// Result of creating a batch.
#[derive(Debug, Clone)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub total: usize,
}

/// Result of processing one chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkReport {
    pub lease: i64,
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: i64,
    pub errors: Vec<String>,
}

/// Result of a retry pass.
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub retried: usize,
    pub chunk: ChunkReport,
}

/// Result of a delivery-status refresh.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub checked: usize,
    pub delivered: usize,
    pub deferred: usize,
    pub bounced: usize,
    pub dropped: usize,
    pub unknown: usize,
    pub errors: usize,
}

/// The persisted message kinds a batch may carry.
const PERSISTED_KINDS: [EmailKind; 4] = [
    EmailKind::Birthday,
    EmailKind::EffectiveDate,
    EmailKind::Aep,
    EmailKind::PostWindow,
];

/// Drives tracking rows through the send state machine. Database and
/// gateway handles are acquired at construction and shared for the
/// pipeline's lifetime.
pub struct DeliveryPipeline {
    store: Arc<TrackingStore>,
    gateway: Arc<dyn MailGateway>,
    renderer: Arc<dyn TemplateRenderer>,
    config: PipelineConfig,
    organization: Organization,
    test_cursor: AtomicUsize,
}

impl DeliveryPipeline {
    /// Validates the pipeline configuration up front; a non-dry-run
    /// pipeline without gateway credentials never starts.
    pub fn new(
        store: Arc<TrackingStore>,
        gateway: Arc<dyn MailGateway>,
        renderer: Arc<dyn TemplateRenderer>,
        config: PipelineConfig,
        organization: Organization,
    ) -> Result<Self> {
        config.validate()?;
        if config.effective_dry_run() {
            tracing::info!("🧪 Pipeline starting in dry-run mode ({})", config.send_mode);
        } else {
            tracing::info!("🚚 Pipeline starting in live mode ({})", config.send_mode);
        }
        Ok(Self {
            store,
            gateway,
            renderer,
            config,
            organization,
            test_cursor: AtomicUsize::new(0),
        })
    }

    pub fn store(&self) -> &TrackingStore {
        &self.store
    }

    // ─── Batch creation ───────────────────────────────────────

    /// Turn scheduling output into tracking rows. Scope filtering is
    /// applied to scheduled intents before insertion; bulk mode ignores
    /// the schedule and creates one row per contact and kind, dated
    /// `today`.
    pub fn create_batch(
        &self,
        schedules: &[ContactSchedule],
        contacts: &[Contact],
        kinds: &[EmailKind],
        scope: Scope,
        today: NaiveDate,
    ) -> Result<BatchReceipt> {
        let kinds: Vec<EmailKind> = if kinds.is_empty() {
            PERSISTED_KINDS.to_vec()
        } else {
            kinds.to_vec()
        };
        if kinds.iter().any(|k| *k == EmailKind::All) {
            return Err(CadenceError::InvalidInput(
                "'all' is not a batchable message kind".into(),
            ));
        }

        self.store.upsert_contacts(contacts)?;

        let batch_id = new_batch_id();
        let mut rows = Vec::new();
        match scope {
            Scope::Bulk => {
                for contact in contacts {
                    for kind in &kinds {
                        rows.push(self.new_row(contact.org_id, &contact.id, *kind, today, &batch_id));
                    }
                }
            }
            _ => {
                let keep = scope.date_range(today);
                for schedule in schedules {
                    let org_id = contacts
                        .iter()
                        .find(|c| c.id == schedule.contact_id)
                        .map(|c| c.org_id)
                        .unwrap_or(self.organization.id);
                    for email in &schedule.emails {
                        if kinds.contains(&email.kind) && keep.contains(email.date) {
                            rows.push(self.new_row(
                                org_id,
                                &schedule.contact_id,
                                email.kind,
                                email.date,
                                &batch_id,
                            ));
                        }
                    }
                }
            }
        }

        if rows.is_empty() {
            return Err(CadenceError::InvalidInput(format!(
                "no scheduled messages matched scope '{scope}'"
            )));
        }

        let total = self.store.insert_batch(&rows)?;
        tracing::info!("📦 Created batch {batch_id} with {total} rows (scope {scope})");
        Ok(BatchReceipt { batch_id, total })
    }

    fn new_row(
        &self,
        org_id: i64,
        contact_id: &str,
        kind: EmailKind,
        date: NaiveDate,
        batch_id: &str,
    ) -> NewTrackingRow {
        NewTrackingRow {
            org_id,
            contact_id: contact_id.to_string(),
            email_type: kind,
            scheduled_date: date,
            send_mode: self.config.send_mode,
            test_email: match self.config.send_mode {
                SendMode::Test => Some(self.next_test_email()),
                SendMode::Production => None,
            },
            batch_id: batch_id.to_string(),
        }
    }

    /// Round-robin over the configured test inboxes.
    fn next_test_email(&self) -> String {
        let addrs = &self.config.test_emails;
        let i = self.test_cursor.fetch_add(1, Ordering::Relaxed);
        addrs[i % addrs.len()].clone()
    }

    // ─── Chunked sending ──────────────────────────────────────

    /// Claim up to `size` pending rows and drive each to a settled
    /// status. Per-row errors never abort the chunk; only store failures
    /// do, and only after the current row is finalized.
    pub async fn process_chunk(&self, batch_id: &str, size: usize) -> Result<ChunkReport> {
        let (lease, rows) = self.store.claim_chunk(batch_id, size)?;
        let mut report = ChunkReport {
            lease,
            processed: rows.len(),
            ..ChunkReport::default()
        };
        if rows.is_empty() {
            tracing::info!("Batch {batch_id}: nothing pending");
            return Ok(report);
        }
        tracing::info!(
            "📨 Batch {batch_id} lease {lease}: processing {} rows",
            rows.len()
        );

        let dry_run = self.config.effective_dry_run();
        for (index, row) in rows.iter().enumerate() {
            // Inter-message delay honors the gateway's rate policy.
            if index > 0 && self.config.send_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.config.send_delay_ms))
                    .await;
            }
            let outcome = self.deliver(row, dry_run).await;
            match outcome.status {
                SendStatus::Sent => report.sent += 1,
                SendStatus::Skipped => report.skipped += 1,
                _ => {
                    report.failed += 1;
                    if let Some(error) = &outcome.error {
                        report.errors.push(format!("row {}: {error}", row.id));
                    }
                }
            }
            self.store.finalize(row.id, &outcome)?;
        }

        report.remaining = self
            .store
            .get_batch(batch_id)?
            .map(|status| status.pending)
            .unwrap_or(0);
        tracing::info!(
            "Batch {batch_id}: {} sent, {} failed, {} skipped, {} remaining",
            report.sent,
            report.failed,
            report.skipped,
            report.remaining
        );
        Ok(report)
    }

    /// Resolve, render, and send one claimed row. Always settles to an
    /// outcome; never propagates per-row errors.
    async fn deliver(&self, row: &TrackingRow, dry_run: bool) -> FinalizeOutcome {
        let contact = match self.store.get_contact(row.org_id, &row.contact_id) {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                // Retrying cannot make a missing contact appear.
                return FinalizeOutcome::failed_permanent(format!(
                    "contact {} not found",
                    row.contact_id
                ));
            }
            Err(e) => return FinalizeOutcome::failed(format!("contact lookup: {e}")),
        };

        let recipient = match row.send_mode {
            SendMode::Test => match row.test_email.clone() {
                Some(addr) => addr,
                None => self.next_test_email(),
            },
            SendMode::Production => {
                if contact.email.trim().is_empty() {
                    return FinalizeOutcome::skipped("missing recipient");
                }
                contact.email.clone()
            }
        };

        let rendered = match self
            .renderer
            .render(row.email_type, &contact, &self.organization)
        {
            Ok(rendered) => rendered,
            Err(e) => return FinalizeOutcome::skipped(format!("template error: {e}")),
        };

        let subject = match row.send_mode {
            SendMode::Test => format!("[TEST] {}", rendered.subject),
            SendMode::Production => rendered.subject,
        };

        if dry_run {
            tracing::debug!("[dry-run] would send {} to {recipient}", row.email_type);
            return FinalizeOutcome::sent(format!("dry:{}", row.id));
        }

        let envelope = Envelope {
            to: recipient,
            from_email: self.config.from_email.clone(),
            from_name: self.config.from_name.clone(),
            subject,
            text_body: rendered.text_body,
            html_body: rendered.html_body,
        };

        let timeout = std::time::Duration::from_secs(self.config.gateway_timeout_secs);
        match tokio::time::timeout(timeout, self.gateway.send(&envelope)).await {
            Err(_) => FinalizeOutcome::failed(format!(
                "gateway timeout after {}s",
                self.config.gateway_timeout_secs
            )),
            Ok(Err(e)) => FinalizeOutcome::failed(format!("gateway error: {e}")),
            Ok(Ok(outcome)) => {
                if outcome.accepted {
                    FinalizeOutcome::sent(
                        outcome.message_id.unwrap_or_else(|| format!("unk:{}", row.id)),
                    )
                } else {
                    let error = outcome.error.unwrap_or_else(|| "gateway refused".into());
                    if outcome.transient {
                        FinalizeOutcome::failed(error)
                    } else {
                        FinalizeOutcome::failed_permanent(error)
                    }
                }
            }
        }
    }

    // ─── Retry & resume ───────────────────────────────────────

    /// Move failed rows (under the attempt cap) back to pending, then
    /// process a chunk.
    pub async fn retry_failed(&self, batch_id: &str, size: usize) -> Result<RetryReport> {
        let retried = self
            .store
            .mark_failed_as_retryable(batch_id, size, self.config.max_attempts)?;
        let chunk = self.process_chunk(batch_id, size).await?;
        Ok(RetryReport { retried, chunk })
    }

    /// Resume a partially processed batch from whatever is still pending.
    pub async fn resume(&self, batch_id: &str, size: usize) -> Result<ChunkReport> {
        self.process_chunk(batch_id, size).await
    }

    // ─── Delivery status ──────────────────────────────────────

    /// Query the gateway for terminal outcomes on rows whose last check
    /// is stale, and record what it reports.
    pub async fn update_delivery_status(&self, batch_id: &str) -> Result<StatusReport> {
        let cutoff = Utc::now() - Duration::seconds(self.config.stale_status_after_secs);
        let candidates = self.store.stale_delivery_candidates(batch_id, cutoff, 100)?;
        let mut report = StatusReport::default();

        for row in candidates {
            let Some(message_id) = row.message_id.clone() else {
                continue;
            };
            match self.gateway.query_status(&message_id).await {
                Ok(delivery) => {
                    use cadence_core::traits::DeliveryStatus::*;
                    match delivery.status {
                        Delivered => report.delivered += 1,
                        Deferred => report.deferred += 1,
                        Bounced => report.bounced += 1,
                        Dropped => report.dropped += 1,
                        Unknown => report.unknown += 1,
                    }
                    self.store.record_status_check(row.id, &delivery)?;
                    report.checked += 1;
                }
                Err(e) => {
                    tracing::warn!("Status query for {message_id} failed: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Batch ids from the system clock; unique enough per process, readable
/// in logs.
fn new_batch_id() -> String {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("batch-{:x}-{:x}", t.as_secs(), t.subsec_nanos())
}
