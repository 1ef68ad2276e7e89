//! Gateway event ingestion — parses the SendGrid event-webhook payload
//! into delivery reports the store can apply.
//!
//! The gateway appends filter suffixes to message ids in event payloads
//! (`<id>.filterNNN...`); tracking rows store the bare id, so lookups go
//! through the normalized form.

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{DeliveryReport, DeliveryStatus};
use serde::Deserialize;

/// One event from the gateway's event webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl GatewayEvent {
    /// The bare message id a tracking row stores.
    pub fn message_id(&self) -> Option<&str> {
        self.sg_message_id
            .as_deref()
            .map(|id| id.split('.').next().unwrap_or(id))
            .filter(|id| !id.is_empty())
    }

    /// Delivery outcome carried by this event, if it is one. Engagement
    /// events (open, click, processed) carry none.
    pub fn delivery_report(&self) -> Option<DeliveryReport> {
        let status = match self.event.as_str() {
            "delivered" => DeliveryStatus::Delivered,
            "deferred" => DeliveryStatus::Deferred,
            "bounce" | "bounced" | "blocked" => DeliveryStatus::Bounced,
            "dropped" => DeliveryStatus::Dropped,
            _ => return None,
        };
        Some(DeliveryReport {
            status,
            details: self.reason.clone(),
        })
    }
}

/// Parse a webhook body: a JSON array of events.
pub fn parse_events(json: &str) -> Result<Vec<GatewayEvent>> {
    serde_json::from_str(json)
        .map_err(|e| CadenceError::InvalidInput(format!("unparseable event payload: {e}")))
}
