//! Workspace-wide error type.

use thiserror::Error;

/// Errors surfaced by the Cadence crates.
#[derive(Error, Debug)]
pub enum CadenceError {
    /// Missing or malformed configuration; aborts the enclosing operation.
    #[error("Config error: {0}")]
    Config(String),

    /// Tracking-store failure (open, migrate, query, transaction).
    #[error("Store error: {0}")]
    Store(String),

    /// Illegal send-status transition requested on a tracking row.
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Mail-gateway failure that is not expressible as a send outcome.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Template rendering failure; per-row recoverable.
    #[error("Template error: {0}")]
    Template(String),

    /// Malformed caller input (contact records, dates, scopes).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operation was cancelled before completion.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CadenceError>;
