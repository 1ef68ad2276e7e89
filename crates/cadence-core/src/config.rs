//! Cadence configuration: the layered rule model and the pipeline controls.
//!
//! `RuleConfig` is read-only after load and owned by the process for its
//! lifetime. `PipelineConfig` is threaded explicitly from the top-level
//! operation into the delivery pipeline; there is no implicit process-wide
//! sending state.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::types::{Contact, SendMode};

/// A recurring calendar slot expressed as (month, day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Self {
        Self { month, day }
    }

    /// Materialize the slot in a concrete year. Feb 29 falls back to
    /// Feb 28 outside leap years, matching anniversary arithmetic.
    pub fn in_year(&self, year: i32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, self.month, self.day).or_else(|| {
            if self.month == 2 && self.day == 29 {
                NaiveDate::from_ymd_opt(year, 2, 28)
            } else {
                None
            }
        })
    }

    fn is_plausible(&self) -> bool {
        // Validate against a leap year so Feb 29 stays legal.
        NaiveDate::from_ymd_opt(2024, self.month, self.day).is_some()
    }
}

/// Global timing constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConstants {
    #[serde(default = "default_birthday_lead")]
    pub birthday_lead_days: i64,
    #[serde(default = "default_effective_lead")]
    pub effective_lead_days: i64,
    #[serde(default = "default_pre_window_exclusion")]
    pub pre_window_exclusion_days: i64,
}

fn default_birthday_lead() -> i64 {
    14
}
fn default_effective_lead() -> i64 {
    30
}
fn default_pre_window_exclusion() -> i64 {
    60
}

impl Default for TimingConstants {
    fn default() -> Self {
        Self {
            birthday_lead_days: default_birthday_lead(),
            effective_lead_days: default_effective_lead(),
            pre_window_exclusion_days: default_pre_window_exclusion(),
        }
    }
}

/// Annual enrollment period slots and the years they apply to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AepConfig {
    #[serde(default = "default_aep_slots")]
    pub default_dates: Vec<MonthDay>,
    /// Years AEP scheduling applies to. Absent means every year.
    #[serde(default)]
    pub years: Option<Vec<i32>>,
}

fn default_aep_slots() -> Vec<MonthDay> {
    vec![
        MonthDay::new(8, 18),
        MonthDay::new(8, 25),
        MonthDay::new(9, 1),
        MonthDay::new(9, 7),
    ]
}

impl Default for AepConfig {
    fn default() -> Self {
        Self {
            default_dates: default_aep_slots(),
            years: None,
        }
    }
}

impl AepConfig {
    pub fn applies_to(&self, year: i32) -> bool {
        match &self.years {
            Some(years) => years.contains(&year),
            None => true,
        }
    }
}

/// The jurisdiction rule variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateRuleKind {
    Birthday,
    EffectiveDate,
    YearRound,
}

/// Per-jurisdiction enrollment-window rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRule {
    #[serde(rename = "type")]
    pub kind: StateRuleKind,
    #[serde(default)]
    pub window_before: i64,
    #[serde(default)]
    pub window_after: i64,
    /// Suppress the window at or above this age at window start.
    #[serde(default)]
    pub age_limit: Option<u32>,
    /// Anchor the window to the first day of the anchor month instead of
    /// the anchor day itself.
    #[serde(default)]
    pub use_month_start: bool,
}

impl StateRule {
    fn birthday(window_before: i64, window_after: i64) -> Self {
        Self {
            kind: StateRuleKind::Birthday,
            window_before,
            window_after,
            age_limit: None,
            use_month_start: false,
        }
    }

    fn effective_date(window_before: i64, window_after: i64) -> Self {
        Self {
            kind: StateRuleKind::EffectiveDate,
            window_before,
            window_after,
            age_limit: None,
            use_month_start: false,
        }
    }

    fn year_round() -> Self {
        Self {
            kind: StateRuleKind::YearRound,
            window_before: 0,
            window_after: 0,
            age_limit: None,
            use_month_start: false,
        }
    }
}

/// A conditional post-window date override on a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostWindowRule {
    #[serde(default)]
    pub condition: PostWindowCondition,
    pub override_date: MonthDay,
}

/// Conjunction over birth month and jurisdiction set; empty fields match
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostWindowCondition {
    #[serde(default)]
    pub birth_month: Option<u32>,
    #[serde(default)]
    pub states: Option<Vec<String>>,
}

impl PostWindowCondition {
    pub fn matches(&self, contact: &Contact) -> bool {
        if let Some(month) = self.birth_month {
            match contact.birth_date {
                Some(birth) if chrono::Datelike::month(&birth) == month => {}
                _ => return false,
            }
        }
        if let Some(states) = &self.states {
            match contact.jurisdiction() {
                Some(code) if states.iter().any(|s| s.eq_ignore_ascii_case(&code)) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Per-contact rule overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactRule {
    #[serde(default)]
    pub force_aep: bool,
    #[serde(default)]
    pub aep_date_override: Option<MonthDay>,
    #[serde(default)]
    pub post_window_rules: Vec<PostWindowRule>,
}

/// Per-state special overrides in the global section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateOverride {
    #[serde(default)]
    pub post_window_period_days: Option<i64>,
    #[serde(default)]
    pub leap_year_override: Option<MonthDay>,
}

/// Global rules that cut across jurisdictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRules {
    /// AEP slot for contacts born in October.
    #[serde(default)]
    pub october_birthday_aep: Option<MonthDay>,
    #[serde(default)]
    pub state_overrides: BTreeMap<String, StateOverride>,
}

impl Default for GlobalRules {
    fn default() -> Self {
        let mut state_overrides = BTreeMap::new();
        state_overrides.insert(
            "CA".to_string(),
            StateOverride {
                post_window_period_days: Some(30),
                leap_year_override: Some(MonthDay::new(3, 30)),
            },
        );
        state_overrides.insert(
            "NV".to_string(),
            StateOverride {
                post_window_period_days: None,
                leap_year_override: Some(MonthDay::new(3, 31)),
            },
        );
        Self {
            october_birthday_aep: Some(MonthDay::new(8, 25)),
            state_overrides,
        }
    }
}

/// The full layered rule model. Loaded once, read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub timing_constants: TimingConstants,
    #[serde(default)]
    pub aep_config: AepConfig,
    #[serde(default = "default_state_rules")]
    pub state_rules: BTreeMap<String, StateRule>,
    #[serde(default)]
    pub contact_rules: BTreeMap<String, ContactRule>,
    #[serde(default)]
    pub global_rules: GlobalRules,
}

fn default_state_rules() -> BTreeMap<String, StateRule> {
    let mut rules = BTreeMap::new();
    // Birthday-window jurisdictions.
    rules.insert("CA".into(), StateRule::birthday(30, 30));
    rules.insert("ID".into(), StateRule::birthday(0, 63));
    let mut il = StateRule::birthday(0, 45);
    il.age_limit = Some(76);
    rules.insert("IL".into(), il);
    rules.insert("KY".into(), StateRule::birthday(0, 60));
    rules.insert("LA".into(), StateRule::birthday(30, 63));
    rules.insert("MD".into(), StateRule::birthday(0, 31));
    let mut nv = StateRule::birthday(0, 60);
    nv.use_month_start = true;
    rules.insert("NV".into(), nv);
    rules.insert("OK".into(), StateRule::birthday(0, 60));
    rules.insert("OR".into(), StateRule::birthday(0, 31));
    // Effective-date-window jurisdictions.
    rules.insert("MO".into(), StateRule::effective_date(30, 33));
    // Year-round enrollment jurisdictions.
    for state in ["CT", "MA", "NY", "WA"] {
        rules.insert(state.into(), StateRule::year_round());
    }
    rules
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            timing_constants: TimingConstants::default(),
            aep_config: AepConfig::default(),
            state_rules: default_state_rules(),
            contact_rules: BTreeMap::new(),
            global_rules: GlobalRules::default(),
        }
    }
}

impl RuleConfig {
    /// Load rules from a TOML document, falling back to the built-in rule
    /// set when the file is absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from(p),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read rules {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse rules: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation of a loaded rule document.
    pub fn validate(&self) -> Result<()> {
        let t = &self.timing_constants;
        for (name, value) in [
            ("birthday_lead_days", t.birthday_lead_days),
            ("effective_lead_days", t.effective_lead_days),
            ("pre_window_exclusion_days", t.pre_window_exclusion_days),
        ] {
            if value < 0 {
                return Err(CadenceError::Config(format!("{name} must be non-negative")));
            }
        }

        if self.aep_config.default_dates.is_empty() {
            return Err(CadenceError::Config(
                "aep_config.default_dates must be a non-empty list".into(),
            ));
        }
        for slot in &self.aep_config.default_dates {
            if !slot.is_plausible() {
                return Err(CadenceError::Config(format!(
                    "invalid AEP slot: month={} day={}",
                    slot.month, slot.day
                )));
            }
        }

        for (state, rule) in &self.state_rules {
            if state.len() != 2 || !state.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(CadenceError::Config(format!(
                    "state code must be two uppercase letters: {state}"
                )));
            }
            if rule.window_before < 0 || rule.window_after < 0 {
                return Err(CadenceError::Config(format!(
                    "state {state} has a negative window"
                )));
            }
        }

        for (contact_id, rule) in &self.contact_rules {
            if let Some(slot) = &rule.aep_date_override {
                if !slot.is_plausible() {
                    return Err(CadenceError::Config(format!(
                        "contact {contact_id} has an invalid aep_date_override"
                    )));
                }
            }
            for pw in &rule.post_window_rules {
                if !pw.override_date.is_plausible() {
                    return Err(CadenceError::Config(format!(
                        "contact {contact_id} has an invalid post-window override_date"
                    )));
                }
            }
        }

        for (state, over) in &self.global_rules.state_overrides {
            if let Some(days) = over.post_window_period_days {
                if days < 0 {
                    return Err(CadenceError::Config(format!(
                        "state {state} post_window_period_days must be non-negative"
                    )));
                }
            }
            if let Some(md) = &over.leap_year_override {
                if !md.is_plausible() {
                    return Err(CadenceError::Config(format!(
                        "state {state} has an invalid leap_year_override"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn state_rule(&self, state: &str) -> Option<&StateRule> {
        self.state_rules.get(state)
    }

    pub fn contact_rule(&self, contact_id: &str) -> Option<&ContactRule> {
        self.contact_rules.get(contact_id)
    }

    pub fn state_override(&self, state: &str) -> Option<&StateOverride> {
        self.global_rules.state_overrides.get(state)
    }
}

/// Controls for the delivery pipeline, resolved once at startup and
/// threaded through explicitly.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub send_mode: SendMode,
    /// Fixed recipients for test mode; round-robin when more than one.
    pub test_emails: Vec<String>,
    /// Suppress gateway calls while performing all state transitions.
    pub dry_run: bool,
    pub test_sending_enabled: bool,
    pub production_sending_enabled: bool,
    pub api_key: Option<String>,
    pub from_email: String,
    pub from_name: String,
    /// Delay between adjacent sends within a chunk.
    pub send_delay_ms: u64,
    pub gateway_timeout_secs: u64,
    pub max_attempts: u32,
    /// Delivery-status rechecks only consider rows last checked before
    /// this many seconds ago.
    pub stale_status_after_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_mode: SendMode::Test,
            test_emails: Vec::new(),
            dry_run: true,
            test_sending_enabled: true,
            production_sending_enabled: false,
            api_key: None,
            from_email: "outreach@example.com".into(),
            from_name: "Cadence Outreach".into(),
            send_delay_ms: 500,
            gateway_timeout_secs: 15,
            max_attempts: 5,
            stale_status_after_secs: 600,
        }
    }
}

impl PipelineConfig {
    /// Build a config from the process environment. CLI flags are applied
    /// on top by the caller.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = std::env::var("SENDGRID_API_KEY") {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
        config.test_sending_enabled = env_flag("TEST_EMAIL_SENDING", true);
        config.production_sending_enabled = env_flag("PRODUCTION_EMAIL_SENDING", false);
        if let Ok(raw) = std::env::var("EMAIL_DRY_RUN") {
            config.dry_run = parse_flag(&raw, true);
        }
        if let Ok(from) = std::env::var("FROM_EMAIL") {
            if !from.is_empty() {
                config.from_email = from;
            }
        }
        if let Ok(name) = std::env::var("FROM_NAME") {
            if !name.is_empty() {
                config.from_name = name;
            }
        }
        config
    }

    /// Whether real sending is enabled for the given mode.
    pub fn sending_allowed(&self, mode: SendMode) -> bool {
        match mode {
            SendMode::Test => self.test_sending_enabled,
            SendMode::Production => self.production_sending_enabled,
        }
    }

    /// The dry-run decision for this pipeline's mode: an explicit dry-run
    /// toggle, or sending disabled for the mode.
    pub fn effective_dry_run(&self) -> bool {
        self.dry_run || !self.sending_allowed(self.send_mode)
    }

    /// Startup validation. A pipeline that would actually call the gateway
    /// needs credentials; test mode needs at least one test recipient.
    pub fn validate(&self) -> Result<()> {
        if !self.effective_dry_run() && self.api_key.is_none() {
            return Err(CadenceError::Config(
                "mail gateway API key is required when dry-run is disabled".into(),
            ));
        }
        if self.send_mode == SendMode::Test && self.test_emails.is_empty() {
            return Err(CadenceError::Config(
                "test mode requires at least one test email address".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(CadenceError::Config("max_attempts must be greater than 0".into()));
        }
        Ok(())
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw, default),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "enabled" | "true" | "1" | "yes" | "y" | "t" => true,
        "disabled" | "false" | "0" | "no" | "n" | "f" => false,
        _ => default,
    }
}
