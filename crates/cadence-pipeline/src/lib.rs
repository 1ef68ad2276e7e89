//! # Cadence Pipeline
//!
//! Drives scheduled messages through the at-least-once delivery pipeline:
//! tracking rows are grouped into batches, claimed in chunks, rendered,
//! handed to the mail gateway, and finalized one by one. Failed rows can
//! be retried up to the attempt cap; partially processed batches resume
//! from whatever is still pending.
//!
//! ```text
//! Created ──insert_batch──▶ Pending ──claim_chunk──▶ Processing ──finalize──▶ Pending/Complete
//!                                           │
//!                                           └──retry──▶ Pending (attempt++)
//! Complete := no pending (and nothing in flight)
//! ```

mod pipeline;
mod scope;

pub use pipeline::{BatchReceipt, ChunkReport, DeliveryPipeline, RetryReport, StatusReport};
pub use scope::Scope;
