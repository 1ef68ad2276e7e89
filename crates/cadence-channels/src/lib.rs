//! # Cadence Channels
//!
//! Boundary adapters: the SendGrid REST gateway the pipeline sends
//! through, and the stock template renderer. Both sit behind the traits
//! in `cadence-core`, so the pipeline never sees a vendor type.

pub mod events;
pub mod sendgrid;
pub mod templates;

pub use events::{parse_events, GatewayEvent};
pub use sendgrid::{SendGridConfig, SendGridGateway};
pub use templates::StockRenderer;

use async_trait::async_trait;
use cadence_core::error::Result;
use cadence_core::traits::{DeliveryReport, DeliveryStatus, Envelope, MailGateway, SendOutcome};

/// Gateway stand-in for dry-run pipelines: every send is refused as
/// transient and every status query comes back unknown. A dry-run
/// pipeline never invokes it, so reaching this adapter means dry-run was
/// turned off without credentials.
#[derive(Debug, Clone, Default)]
pub struct DisabledGateway;

#[async_trait]
impl MailGateway for DisabledGateway {
    async fn send(&self, _envelope: &Envelope) -> Result<SendOutcome> {
        Ok(SendOutcome::transient("mail gateway disabled"))
    }

    async fn query_status(&self, _message_id: &str) -> Result<DeliveryReport> {
        Ok(DeliveryReport {
            status: DeliveryStatus::Unknown,
            details: Some("mail gateway disabled".into()),
        })
    }
}
