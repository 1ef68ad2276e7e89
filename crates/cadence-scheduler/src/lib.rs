//! # Cadence Scheduler
//!
//! Turns contacts plus the layered rule model into concrete send dates.
//!
//! ```text
//! RuleConfig ──▶ RuleResolver ──▶ SchedulingEngine ──▶ (scheduled, skipped)
//!                                       ▲
//!                 calendar primitives ──┘
//!
//! BatchProcessor: bounded fan-out of the engine across contacts.
//! ```
//!
//! The engine is pure and deterministic: same contact, rules, and window
//! in, same intents out, independent of contact ordering.

pub mod calendar;
pub mod engine;
pub mod processor;
pub mod rules;

pub use engine::schedule;
pub use processor::{BatchProcessor, CancelFlag};
pub use rules::{EffectiveRules, RuleResolver, RuleVariant};
