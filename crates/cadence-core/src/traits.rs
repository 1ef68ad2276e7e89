//! Adapter traits consumed by the delivery pipeline.
//!
//! The core never talks to a concrete mail vendor or template system; it
//! depends on these interfaces so the scheduler and pipeline can be
//! exercised headless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Contact, EmailKind, Organization};

/// A fully addressed, rendered message ready for the gateway.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: String,
    pub from_email: String,
    pub from_name: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// Gateway verdict for one send call.
#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub accepted: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    /// Transient failures are eligible for retry; permanent ones are not.
    pub transient: bool,
}

impl SendOutcome {
    pub fn accepted(message_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message_id: Some(message_id.into()),
            error: None,
            transient: false,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message_id: None,
            error: Some(error.into()),
            transient: false,
        }
    }

    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message_id: None,
            error: Some(error.into()),
            transient: true,
        }
    }
}

/// Terminal delivery outcome reported by the gateway's status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Deferred,
    Bounced,
    Dropped,
    Unknown,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Deferred => "deferred",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Dropped => "dropped",
            DeliveryStatus::Unknown => "unknown",
        }
    }
}

/// Result of a delivery-status query.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub status: DeliveryStatus,
    pub details: Option<String>,
}

/// The opaque mail sink the pipeline drives. Implementations absorb
/// vendor-level HTTP failures into `SendOutcome`; `Err` is reserved for
/// conditions that make the call itself impossible (bad envelope,
/// missing credentials).
#[async_trait]
pub trait MailGateway: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<SendOutcome>;
    async fn query_status(&self, message_id: &str) -> Result<DeliveryReport>;
}

/// Rendered message content.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Pure template renderer: `(kind, contact, organization) -> content`.
/// Failures surface as a per-row skip with the reason preserved.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        kind: EmailKind,
        contact: &Contact,
        organization: &Organization,
    ) -> Result<RenderedEmail>;
}
