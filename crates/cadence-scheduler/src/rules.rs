//! Contact rule resolution — collapses the layered rule model (state rules,
//! global overrides, per-contact overrides) into one effective rule set per
//! contact.

use cadence_core::config::{MonthDay, RuleConfig, StateRule, StateRuleKind};
use cadence_core::types::{Contact, EmailKind};
use chrono::Datelike;

/// Which anchor date a jurisdiction's window is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    Birthday,
    EffectiveDate,
}

impl AnchorKind {
    pub fn email_kind(&self) -> EmailKind {
        match self {
            AnchorKind::Birthday => EmailKind::Birthday,
            AnchorKind::EffectiveDate => EmailKind::EffectiveDate,
        }
    }
}

/// Fully resolved window parameters for a windowed jurisdiction.
#[derive(Debug, Clone)]
pub struct WindowRule {
    pub anchor: AnchorKind,
    pub window_before: i64,
    pub window_after: i64,
    pub age_limit: Option<u32>,
    pub use_month_start: bool,
    /// State-level post-window length override; falls back to
    /// `window_after` when absent.
    pub post_window_period_days: Option<i64>,
    /// Post-window pivot for Feb 29 anchors in leap years.
    pub leap_year_override: Option<MonthDay>,
}

impl WindowRule {
    /// The number of days the window extends past the anchor for
    /// post-window purposes.
    pub fn post_window_extent(&self) -> i64 {
        self.post_window_period_days.unwrap_or(self.window_after)
    }
}

/// The jurisdiction variant after resolution.
#[derive(Debug, Clone)]
pub enum RuleVariant {
    Window(WindowRule),
    YearRound,
    /// Unknown jurisdiction: no windows, nothing suppressed.
    Neutral,
}

/// The effective rule set for one contact.
#[derive(Debug, Clone)]
pub struct EffectiveRules {
    pub jurisdiction: Option<String>,
    pub variant: RuleVariant,
    pub force_aep: bool,
    /// The resolved AEP slot, or `None` when the slot table is empty.
    pub aep_slot: Option<MonthDay>,
    /// First matching contact-level post-window override, pre-evaluated
    /// (conditions depend only on immutable contact fields).
    pub post_window_override: Option<MonthDay>,
}

/// Resolves per-contact effective rules from a read-only `RuleConfig`.
pub struct RuleResolver<'a> {
    cfg: &'a RuleConfig,
}

impl<'a> RuleResolver<'a> {
    pub fn new(cfg: &'a RuleConfig) -> Self {
        Self { cfg }
    }

    pub fn resolve(&self, contact: &Contact) -> EffectiveRules {
        let jurisdiction = contact.jurisdiction();
        let variant = match jurisdiction.as_deref() {
            Some(code) => match self.cfg.state_rule(code) {
                Some(rule) => self.variant_for(code, rule),
                None => {
                    tracing::warn!("Unknown jurisdiction '{code}' for contact {}; no enrollment windows apply", contact.id);
                    RuleVariant::Neutral
                }
            },
            None => {
                tracing::warn!("Contact {} has no resolvable jurisdiction; no enrollment windows apply", contact.id);
                RuleVariant::Neutral
            }
        };

        let contact_rule = self.cfg.contact_rule(&contact.id);
        let force_aep = contact_rule.map(|r| r.force_aep).unwrap_or(false);
        let post_window_override = contact_rule.and_then(|r| {
            r.post_window_rules
                .iter()
                .find(|rule| rule.condition.matches(contact))
                .map(|rule| rule.override_date)
        });

        EffectiveRules {
            jurisdiction,
            variant,
            force_aep,
            aep_slot: self.aep_slot(contact),
            post_window_override,
        }
    }

    fn variant_for(&self, code: &str, rule: &StateRule) -> RuleVariant {
        match rule.kind {
            StateRuleKind::YearRound => RuleVariant::YearRound,
            StateRuleKind::Birthday | StateRuleKind::EffectiveDate => {
                let over = self.cfg.state_override(code);
                RuleVariant::Window(WindowRule {
                    anchor: if rule.kind == StateRuleKind::Birthday {
                        AnchorKind::Birthday
                    } else {
                        AnchorKind::EffectiveDate
                    },
                    window_before: rule.window_before,
                    window_after: rule.window_after,
                    age_limit: rule.age_limit,
                    use_month_start: rule.use_month_start,
                    post_window_period_days: over.and_then(|o| o.post_window_period_days),
                    leap_year_override: over.and_then(|o| o.leap_year_override),
                })
            }
        }
    }

    /// AEP slot precedence: contact override, then the October-birthday
    /// global rule, then a stable hash of the contact id over the slot
    /// table.
    pub fn aep_slot(&self, contact: &Contact) -> Option<MonthDay> {
        if let Some(rule) = self.cfg.contact_rule(&contact.id) {
            if let Some(slot) = rule.aep_date_override {
                return Some(slot);
            }
        }
        if let Some(birth) = contact.birth_date {
            if birth.month() == 10 {
                if let Some(slot) = self.cfg.global_rules.october_birthday_aep {
                    return Some(slot);
                }
            }
        }
        let slots = &self.cfg.aep_config.default_dates;
        if slots.is_empty() {
            return None;
        }
        let index = (fnv1a64(contact.id.as_bytes()) % slots.len() as u64) as usize;
        Some(slots[index])
    }
}

/// FNV-1a 64-bit. Stable across runs and platforms, which the AEP
/// distribution requires; std's hasher is randomized per process.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::config::{ContactRule, PostWindowCondition, PostWindowRule};
    use chrono::NaiveDate;

    fn contact(id: &str, state: Option<&str>, birth: Option<(i32, u32, u32)>) -> Contact {
        Contact {
            id: id.into(),
            org_id: 1,
            first_name: None,
            last_name: None,
            email: "someone@example.com".into(),
            state: state.map(Into::into),
            zip_code: None,
            birth_date: birth.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            effective_date: None,
        }
    }

    #[test]
    fn test_variant_resolution() {
        let cfg = RuleConfig::default();
        let resolver = RuleResolver::new(&cfg);

        let ca = resolver.resolve(&contact("1", Some("CA"), None));
        match ca.variant {
            RuleVariant::Window(w) => {
                assert_eq!(w.anchor, AnchorKind::Birthday);
                assert_eq!(w.window_before, 30);
                assert_eq!(w.post_window_period_days, Some(30));
                assert_eq!(w.leap_year_override, Some(MonthDay::new(3, 30)));
            }
            _ => panic!("CA should be a birthday-window state"),
        }

        let mo = resolver.resolve(&contact("2", Some("MO"), None));
        assert!(matches!(
            mo.variant,
            RuleVariant::Window(WindowRule { anchor: AnchorKind::EffectiveDate, .. })
        ));

        let ct = resolver.resolve(&contact("3", Some("CT"), None));
        assert!(matches!(ct.variant, RuleVariant::YearRound));

        // Unknown jurisdiction falls through to the neutral variant.
        let xx = resolver.resolve(&contact("4", Some("XX"), None));
        assert!(matches!(xx.variant, RuleVariant::Neutral));
        let none = resolver.resolve(&contact("5", None, None));
        assert!(matches!(none.variant, RuleVariant::Neutral));
    }

    #[test]
    fn test_aep_slot_precedence() {
        let mut cfg = RuleConfig::default();
        cfg.contact_rules.insert(
            "override".into(),
            ContactRule {
                aep_date_override: Some(MonthDay::new(9, 7)),
                ..ContactRule::default()
            },
        );
        let resolver = RuleResolver::new(&cfg);

        // Contact override beats everything.
        assert_eq!(
            resolver.aep_slot(&contact("override", Some("CA"), Some((1960, 10, 5)))),
            Some(MonthDay::new(9, 7))
        );
        // October birthday picks up the global rule.
        assert_eq!(
            resolver.aep_slot(&contact("oct", Some("CA"), Some((1960, 10, 5)))),
            Some(MonthDay::new(8, 25))
        );
        // Everyone else lands on a slot from the table.
        let slot = resolver.aep_slot(&contact("501", Some("CA"), Some((1960, 8, 30)))).unwrap();
        assert!(cfg.aep_config.default_dates.contains(&slot));
    }

    #[test]
    fn test_aep_distribution_is_stable() {
        let cfg = RuleConfig::default();
        let resolver = RuleResolver::new(&cfg);
        for id in ["101", "202", "301", "abc-42"] {
            let c = contact(id, Some("CA"), Some((1955, 4, 1)));
            let first = resolver.aep_slot(&c);
            let second = resolver.aep_slot(&c);
            assert_eq!(first, second, "slot for {id} must be stable");
        }
    }

    #[test]
    fn test_post_window_override_first_match_wins() {
        let mut cfg = RuleConfig::default();
        cfg.contact_rules.insert(
            "101".into(),
            ContactRule {
                post_window_rules: vec![
                    PostWindowRule {
                        condition: PostWindowCondition {
                            birth_month: Some(11),
                            states: None,
                        },
                        override_date: MonthDay::new(1, 10),
                    },
                    PostWindowRule {
                        condition: PostWindowCondition {
                            birth_month: Some(12),
                            states: Some(vec!["CA".into()]),
                        },
                        override_date: MonthDay::new(1, 20),
                    },
                    PostWindowRule {
                        condition: PostWindowCondition::default(),
                        override_date: MonthDay::new(2, 1),
                    },
                ],
                ..ContactRule::default()
            },
        );
        let resolver = RuleResolver::new(&cfg);
        let resolved = resolver.resolve(&contact("101", Some("CA"), Some((1960, 12, 15))));
        // The first rule's month does not match; the second does and wins
        // over the catch-all third.
        assert_eq!(resolved.post_window_override, Some(MonthDay::new(1, 20)));
    }

    #[test]
    fn test_force_aep_flag() {
        let mut cfg = RuleConfig::default();
        cfg.contact_rules.insert(
            "501".into(),
            ContactRule { force_aep: true, ..ContactRule::default() },
        );
        let resolver = RuleResolver::new(&cfg);
        assert!(resolver.resolve(&contact("501", Some("CA"), None)).force_aep);
        assert!(!resolver.resolve(&contact("502", Some("CA"), None)).force_aep);
    }

    #[test]
    fn test_fnv_reference_values() {
        // Reference vectors for FNV-1a 64.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
