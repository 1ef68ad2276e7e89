//! Async batch processor — bounded fan-out of the scheduling engine
//! across contacts, gathered into a deterministic sequence.

use std::sync::Arc;

pub use cadence_core::cancel::CancelFlag;

use cadence_core::config::RuleConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::types::{Contact, ContactSchedule, DateRange};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::engine;

/// Default worker bound.
pub const DEFAULT_WORKERS: usize = 16;

/// Fans the scheduling engine out over contacts with bounded concurrency.
pub struct BatchProcessor {
    workers: usize,
}

impl BatchProcessor {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }

    /// Schedule every contact over the window. Results are sorted by
    /// contact id regardless of completion order. Cancellation discards
    /// partial results and returns `Cancelled`.
    pub async fn process(
        &self,
        contacts: Vec<Contact>,
        cfg: Arc<RuleConfig>,
        range: DateRange,
        cancel: CancelFlag,
    ) -> Result<Vec<ContactSchedule>> {
        let total = contacts.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for contact in contacts {
            if cancel.is_cancelled() {
                tasks.abort_all();
                return Err(CadenceError::Cancelled);
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| CadenceError::Cancelled)?;
            let cfg = cfg.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(engine::schedule(&contact, &cfg, range))
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(schedule)) => results.push(schedule),
                Ok(None) => {
                    tasks.abort_all();
                    return Err(CadenceError::Cancelled);
                }
                Err(e) if e.is_cancelled() => {
                    return Err(CadenceError::Cancelled);
                }
                Err(e) => {
                    // A panicked contact never aborts the batch; record and
                    // move on.
                    tracing::warn!("Scheduling task failed: {e}");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(CadenceError::Cancelled);
        }

        results.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
        tracing::info!("📅 Scheduled {} of {total} contacts", results.len());
        Ok(results)
    }
}

impl Default for BatchProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}
