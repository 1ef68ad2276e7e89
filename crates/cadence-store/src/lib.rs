//! # Cadence Store
//!
//! SQLite-backed persistence for tracking rows and the per-organization
//! contact table. The schema is ensured idempotently at open; all
//! mutations go through the operations defined here, which enforce the
//! send-status transition rules.

mod store;

pub use store::{
    BatchFilter, BatchStatus, BatchSummary, FinalizeOutcome, NewTrackingRow, TrackingStore,
};
