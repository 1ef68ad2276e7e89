//! Data model — contacts, intents, tracking rows, and the send-status
//! state machine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::zip;

/// The kind of outbound message an intent or tracking row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    Birthday,
    EffectiveDate,
    Aep,
    PostWindow,
    /// Contact-level marker used only on skips that apply to every kind
    /// (e.g. a contact with no anchor dates). Never persisted.
    All,
}

impl EmailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailKind::Birthday => "birthday",
            EmailKind::EffectiveDate => "effective_date",
            EmailKind::Aep => "aep",
            EmailKind::PostWindow => "post_window",
            EmailKind::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "birthday" => Some(EmailKind::Birthday),
            "effective_date" => Some(EmailKind::EffectiveDate),
            "aep" => Some(EmailKind::Aep),
            "post_window" => Some(EmailKind::PostWindow),
            "all" => Some(EmailKind::All),
            _ => None,
        }
    }

    /// Tie-break priority when two intents land on the same date.
    pub fn priority(&self) -> u8 {
        match self {
            EmailKind::Birthday => 0,
            EmailKind::EffectiveDate => 1,
            EmailKind::Aep => 2,
            EmailKind::PostWindow => 3,
            EmailKind::All => 4,
        }
    }
}

impl std::fmt::Display for EmailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inclusive calendar-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// A contact record as supplied by the caller. Immutable for the duration
/// of a scheduling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub org_id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Recipient address; may be empty, which triggers a skip at send time.
    #[serde(default)]
    pub email: String,
    /// Two-letter jurisdiction code. When absent it is derived from the
    /// ZIP code via the static prefix table.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_date::deserialize")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_date::deserialize")]
    pub effective_date: Option<NaiveDate>,
}

impl Contact {
    /// Resolve the jurisdiction: explicit state code first, ZIP prefix
    /// table as fallback.
    pub fn jurisdiction(&self) -> Option<String> {
        if let Some(state) = &self.state {
            let trimmed = state.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_ascii_uppercase());
            }
        }
        self.zip_code
            .as_deref()
            .and_then(zip::state_for_zip)
            .map(str::to_string)
    }

    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => self.id.clone(),
        }
    }
}

/// Lenient date parsing for contact anchor dates. The upstream exports use
/// a mix of ISO and US formats; unparseable values deserialize to `None`
/// rather than failing the whole record (the scheduler reports them as
/// "invalid anchor").
mod lenient_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer};

    const FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y"];

    pub fn parse(raw: &str) -> Option<NaiveDate> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse))
    }
}

/// Scheduling status of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Scheduled,
    Skipped,
}

/// A candidate message produced by the scheduling engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub contact_id: String,
    pub kind: EmailKind,
    pub date: NaiveDate,
    /// The rule-free would-be date (the anniversary itself); present for
    /// birthday and effective-date intents.
    pub default_date: Option<NaiveDate>,
    pub status: IntentStatus,
    /// Mandatory when skipped.
    pub reason: Option<String>,
}

/// One scheduled email in the JSON report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledEmail {
    #[serde(rename = "type")]
    pub kind: EmailKind,
    pub date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// One skipped intent in the JSON report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedEmail {
    #[serde(rename = "type")]
    pub kind: EmailKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub reason: String,
}

/// The per-contact scheduling result, shaped exactly like the JSON report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactSchedule {
    pub contact_id: String,
    pub emails: Vec<ScheduledEmail>,
    pub skipped: Vec<SkippedEmail>,
}

impl ContactSchedule {
    pub fn new(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            emails: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Delivery lifecycle state of a tracking row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Processing,
    Accepted,
    Sent,
    Delivered,
    Deferred,
    Bounced,
    Dropped,
    Failed,
    Skipped,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Pending => "pending",
            SendStatus::Processing => "processing",
            SendStatus::Accepted => "accepted",
            SendStatus::Sent => "sent",
            SendStatus::Delivered => "delivered",
            SendStatus::Deferred => "deferred",
            SendStatus::Bounced => "bounced",
            SendStatus::Dropped => "dropped",
            SendStatus::Failed => "failed",
            SendStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SendStatus::Pending),
            "processing" => Some(SendStatus::Processing),
            "accepted" => Some(SendStatus::Accepted),
            "sent" => Some(SendStatus::Sent),
            "delivered" => Some(SendStatus::Delivered),
            "deferred" => Some(SendStatus::Deferred),
            "bounced" => Some(SendStatus::Bounced),
            "dropped" => Some(SendStatus::Dropped),
            "failed" => Some(SendStatus::Failed),
            "skipped" => Some(SendStatus::Skipped),
            _ => None,
        }
    }

    /// Whether the row no longer needs work from the sending path.
    /// Batch completion is defined over settled rows.
    pub fn is_settled(&self) -> bool {
        !matches!(self, SendStatus::Pending | SendStatus::Processing)
    }

    /// Statuses counted as successful handoff to the gateway.
    pub fn is_send_success(&self) -> bool {
        matches!(self, SendStatus::Accepted | SendStatus::Sent | SendStatus::Delivered)
    }

    /// The legal transitions of the tracking state machine.
    ///
    /// failed -> pending is intentionally listed: it is only reachable via
    /// the explicit retry operation, which also bumps the attempt count.
    pub fn can_transition(from: SendStatus, to: SendStatus) -> bool {
        use SendStatus::*;
        matches!(
            (from, to),
            (Pending, Processing)
                | (Processing, Sent)
                | (Processing, Accepted)
                | (Processing, Failed)
                | (Processing, Skipped)
                | (Accepted, Delivered)
                | (Accepted, Deferred)
                | (Accepted, Bounced)
                | (Accepted, Dropped)
                | (Sent, Delivered)
                | (Sent, Deferred)
                | (Sent, Bounced)
                | (Sent, Dropped)
                | (Deferred, Delivered)
                | (Deferred, Bounced)
                | (Deferred, Dropped)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a batch addresses real recipients or a fixed test inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    Test,
    Production,
}

impl SendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendMode::Test => "test",
            SendMode::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "test" => Some(SendMode::Test),
            "production" => Some(SendMode::Production),
            _ => None,
        }
    }
}

impl std::fmt::Display for SendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted tracking row — one scheduled message moving through the
/// delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRow {
    pub id: i64,
    pub org_id: i64,
    pub contact_id: String,
    pub email_type: EmailKind,
    pub scheduled_date: NaiveDate,
    pub send_status: SendStatus,
    pub send_mode: SendMode,
    pub test_email: Option<String>,
    pub send_attempt_count: u32,
    pub last_attempt_date: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Whether a failed row is eligible for retry. Transient gateway
    /// failures leave this set; permanent rejections clear it.
    pub retryable: bool,
    pub batch_id: String,
    pub message_id: Option<String>,
    pub delivery_status: Option<String>,
    pub status_checked_at: Option<DateTime<Utc>>,
    pub status_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Renderer-facing organization context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
}

impl Organization {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            EmailKind::Birthday,
            EmailKind::EffectiveDate,
            EmailKind::Aep,
            EmailKind::PostWindow,
            EmailKind::All,
        ] {
            assert_eq!(EmailKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EmailKind::parse("anniversary"), None);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            "pending",
            "processing",
            "accepted",
            "sent",
            "delivered",
            "deferred",
            "bounced",
            "dropped",
            "failed",
            "skipped",
        ] {
            assert_eq!(SendStatus::parse(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_transition_table() {
        use SendStatus::*;
        assert!(SendStatus::can_transition(Pending, Processing));
        assert!(SendStatus::can_transition(Processing, Sent));
        assert!(SendStatus::can_transition(Processing, Failed));
        assert!(SendStatus::can_transition(Processing, Skipped));
        assert!(SendStatus::can_transition(Sent, Delivered));
        assert!(SendStatus::can_transition(Sent, Bounced));
        assert!(SendStatus::can_transition(Failed, Pending));

        // No path back to pending from terminal-success states.
        assert!(!SendStatus::can_transition(Sent, Pending));
        assert!(!SendStatus::can_transition(Delivered, Pending));
        assert!(!SendStatus::can_transition(Skipped, Pending));
        // No skipping the processing claim.
        assert!(!SendStatus::can_transition(Pending, Sent));
    }

    #[test]
    fn test_contact_jurisdiction() {
        let mut contact = Contact {
            id: "c1".into(),
            org_id: 1,
            first_name: None,
            last_name: None,
            email: String::new(),
            state: Some("ca".into()),
            zip_code: None,
            birth_date: None,
            effective_date: None,
        };
        assert_eq!(contact.jurisdiction().as_deref(), Some("CA"));

        contact.state = None;
        contact.zip_code = Some("94110".into());
        assert_eq!(contact.jurisdiction().as_deref(), Some("CA"));

        contact.zip_code = Some("junk".into());
        assert_eq!(contact.jurisdiction(), None);
    }

    #[test]
    fn test_lenient_date_parsing() {
        let json = r#"{"id":"c1","email":"a@b.c","birth_date":"03/15/1960","effective_date":"not a date"}"#;
        let contact: Contact = serde_json::from_str(json).unwrap();
        assert_eq!(
            contact.birth_date,
            Some(NaiveDate::from_ymd_opt(1960, 3, 15).unwrap())
        );
        assert_eq!(contact.effective_date, None);
    }

    #[test]
    fn test_schedule_report_shape() {
        let schedule = ContactSchedule {
            contact_id: "101".into(),
            emails: vec![ScheduledEmail {
                kind: EmailKind::Birthday,
                date: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
                default_date: Some(NaiveDate::from_ymd_opt(2024, 12, 15).unwrap()),
                link: None,
            }],
            skipped: vec![SkippedEmail {
                kind: EmailKind::Aep,
                date: None,
                reason: "AEP suppressed by exclusion window".into(),
            }],
        };
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["emails"][0]["type"], "birthday");
        assert_eq!(json["emails"][0]["date"], "2024-12-01");
        assert_eq!(json["skipped"][0]["type"], "aep");
    }
}
