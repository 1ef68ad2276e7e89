//! # Cadence Core
//!
//! Shared foundation for the Cadence outreach scheduler: the data model
//! (contacts, intents, tracking rows), the layered rule configuration, the
//! error type used across the workspace, and the adapter traits the delivery
//! pipeline consumes (mail gateway, template renderer).
//!
//! Nothing in this crate performs I/O beyond reading a config file; the
//! scheduling engine and the pipeline live in their own crates and depend on
//! the types defined here.

pub mod cancel;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;
pub mod zip;

pub use cancel::CancelFlag;
pub use config::{PipelineConfig, RuleConfig};
pub use error::{CadenceError, Result};
pub use traits::{DeliveryReport, DeliveryStatus, Envelope, MailGateway, RenderedEmail, SendOutcome, TemplateRenderer};
pub use types::{
    Contact, ContactSchedule, DateRange, EmailKind, Intent, IntentStatus, Organization,
    SendMode, SendStatus, TrackingRow,
};
