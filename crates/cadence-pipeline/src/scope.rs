//! Scope selection — which slice of the schedule a batch covers.

use cadence_core::types::DateRange;
use chrono::{Duration, NaiveDate};

/// Subset of scheduled intents to turn into tracking rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Today,
    Next7Days,
    Next30Days,
    Next90Days,
    /// One message of each requested kind per contact, regardless of the
    /// schedule; rows are dated the day the batch is created.
    Bulk,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "today" => Some(Scope::Today),
            "next_7_days" => Some(Scope::Next7Days),
            "next_30_days" => Some(Scope::Next30Days),
            "next_90_days" => Some(Scope::Next90Days),
            "bulk" => Some(Scope::Bulk),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Today => "today",
            Scope::Next7Days => "next_7_days",
            Scope::Next30Days => "next_30_days",
            Scope::Next90Days => "next_90_days",
            Scope::Bulk => "bulk",
        }
    }

    /// The date window this scope keeps, relative to `today`. Bulk keeps
    /// everything; its rows are re-dated anyway.
    pub fn date_range(&self, today: NaiveDate) -> DateRange {
        match self {
            Scope::Today => DateRange::new(today, today),
            Scope::Next7Days => DateRange::new(today, today + Duration::days(7)),
            Scope::Next30Days => DateRange::new(today, today + Duration::days(30)),
            Scope::Next90Days => DateRange::new(today, today + Duration::days(90)),
            Scope::Bulk => DateRange::new(
                NaiveDate::from_ymd_opt(2000, 1, 1).expect("fixed date"),
                NaiveDate::from_ymd_opt(2100, 1, 1).expect("fixed date"),
            ),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
