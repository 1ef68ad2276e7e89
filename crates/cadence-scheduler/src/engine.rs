//! The scheduling engine — resolves which message instances fall in a
//! window, computes send dates under the layered rules, filters them
//! through exclusion windows, and explains every skip.
//!
//! `schedule` is pure: no I/O, no clock, deterministic for identical
//! inputs.

use cadence_core::config::RuleConfig;
use cadence_core::types::{
    Contact, ContactSchedule, DateRange, EmailKind, ScheduledEmail, SkippedEmail,
};
use chrono::{Datelike, NaiveDate};

use crate::calendar;
use crate::rules::{RuleResolver, RuleVariant, WindowRule};

/// One exclusion window plus the post-window date derived from it.
#[derive(Debug, Clone)]
struct Exclusion {
    start: NaiveDate,
    end: NaiveDate,
    anchor: NaiveDate,
    kind: EmailKind,
    post_date: NaiveDate,
}

impl Exclusion {
    fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// The pre-window exclusion prefix applies only to pre-anchor lead
    /// messages.
    fn pre_window_contains(&self, date: NaiveDate, pre_days: i64) -> bool {
        calendar::add_days(self.start, -pre_days) <= date && date < self.start
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    kind: EmailKind,
    date: NaiveDate,
    default_date: Option<NaiveDate>,
}

/// Anchor years considered plausible; anything outside is reported as an
/// invalid anchor rather than scheduled decades off.
const ANCHOR_YEAR_RANGE: std::ops::RangeInclusive<i32> = 1900..=2100;

/// Produce the scheduled and skipped intents for one contact over
/// `[range.start, range.end]`.
pub fn schedule(contact: &Contact, cfg: &RuleConfig, range: DateRange) -> ContactSchedule {
    let mut out = ContactSchedule::new(&contact.id);

    if range.start > range.end {
        out.skipped.push(SkippedEmail {
            kind: EmailKind::All,
            date: None,
            reason: "empty scheduling window".into(),
        });
        return out;
    }

    if contact.birth_date.is_none() && contact.effective_date.is_none() {
        out.skipped.push(SkippedEmail {
            kind: EmailKind::All,
            date: None,
            reason: "missing anchor dates".into(),
        });
        return out;
    }

    for anchor in [contact.birth_date, contact.effective_date].into_iter().flatten() {
        if !ANCHOR_YEAR_RANGE.contains(&anchor.year()) {
            out.skipped.push(SkippedEmail {
                kind: EmailKind::All,
                date: None,
                reason: "invalid anchor".into(),
            });
            return out;
        }
    }

    let resolved = RuleResolver::new(cfg).resolve(contact);
    let timing = &cfg.timing_constants;
    let pre_days = timing.pre_window_exclusion_days;
    let year_round = matches!(resolved.variant, RuleVariant::YearRound);

    let exclusions = match &resolved.variant {
        RuleVariant::Window(w) => build_exclusions(contact, w, pre_days, range),
        _ => Vec::new(),
    };

    // Step 1 — candidate generation. One extra year past the end so leads
    // for next year's anniversaries that fall inside the range still get
    // proposed; the range filter drops everything else.
    let mut candidates = Vec::new();
    for year in range.start.year()..=range.end.year() + 1 {
        if let Some(birth) = contact.birth_date {
            let anniversary = calendar::anniversary_in(year, birth);
            candidates.push(Candidate {
                kind: EmailKind::Birthday,
                date: calendar::add_days(anniversary, -timing.birthday_lead_days),
                default_date: Some(anniversary),
            });
        }
        if let Some(effective) = contact.effective_date {
            let anniversary = calendar::anniversary_in(year, effective);
            candidates.push(Candidate {
                kind: EmailKind::EffectiveDate,
                date: calendar::add_days(anniversary, -timing.effective_lead_days),
                default_date: Some(anniversary),
            });
        }
        if !year_round && cfg.aep_config.applies_to(year) {
            if let Some(slot) = resolved.aep_slot {
                if let Some(date) = slot.in_year(year) {
                    candidates.push(Candidate {
                        kind: EmailKind::Aep,
                        date,
                        default_date: None,
                    });
                }
            }
        }
    }

    // Step 4 — intersection and skip accounting.
    let mut scheduled: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if !range.contains(candidate.date) {
            continue; // dropped silently
        }
        if year_round {
            out.skipped.push(SkippedEmail {
                kind: candidate.kind,
                date: Some(candidate.date),
                reason: "year-round enrollment state".into(),
            });
            continue;
        }
        match candidate.kind {
            EmailKind::Aep => {
                if exclusions.iter().any(|e| e.contains(candidate.date)) && !resolved.force_aep {
                    out.skipped.push(SkippedEmail {
                        kind: EmailKind::Aep,
                        date: Some(candidate.date),
                        reason: "AEP suppressed by exclusion window".into(),
                    });
                } else {
                    scheduled.push(candidate);
                }
            }
            _ => {
                if let Some(window) = exclusions.iter().find(|e| e.contains(candidate.date)) {
                    out.skipped.push(SkippedEmail {
                        kind: candidate.kind,
                        date: Some(candidate.date),
                        reason: format!(
                            "inside exclusion window of kind {} (anchor={})",
                            window.kind, window.anchor
                        ),
                    });
                } else if exclusions.iter().any(|e| e.pre_window_contains(candidate.date, pre_days)) {
                    out.skipped.push(SkippedEmail {
                        kind: candidate.kind,
                        date: Some(candidate.date),
                        reason: "within pre-window exclusion".into(),
                    });
                } else {
                    scheduled.push(candidate);
                }
            }
        }
    }

    // Step 3 — post-window intents; they bypass exclusion checks.
    for exclusion in &exclusions {
        let date = resolved
            .post_window_override
            .and_then(|md| md.in_year(exclusion.post_date.year()))
            .unwrap_or(exclusion.post_date);
        if range.contains(date) {
            scheduled.push(Candidate {
                kind: EmailKind::PostWindow,
                date,
                default_date: None,
            });
        }
    }

    // Step 5 — ordering and tie-breaks.
    scheduled.sort_by_key(|c| (c.date, c.kind.priority()));
    out.emails = scheduled
        .into_iter()
        .map(|c| ScheduledEmail {
            kind: c.kind,
            date: c.date,
            default_date: c.default_date,
            link: None,
        })
        .collect();
    out
}

/// Step 2 — exclusion-window construction. Windows are built for anchor
/// years one past each edge of the range so year-spanning windows still
/// constrain candidates near the edges.
fn build_exclusions(
    contact: &Contact,
    rule: &WindowRule,
    pre_days: i64,
    range: DateRange,
) -> Vec<Exclusion> {
    let anchor_source = match rule.anchor {
        crate::rules::AnchorKind::Birthday => contact.birth_date,
        crate::rules::AnchorKind::EffectiveDate => contact.effective_date,
    };
    let Some(anchor_date) = anchor_source else {
        return Vec::new();
    };

    let mut exclusions = Vec::new();
    for year in range.start.year() - 1..=range.end.year() + 1 {
        // `use_month_start` anchors to the first of the anchor month and
        // counts the anchor day as day one of the window.
        let (anchor, end, post_base) = if rule.use_month_start {
            let anchor = calendar::month_start(year, anchor_date.month());
            (
                anchor,
                calendar::add_days(anchor, (rule.window_after - 1).max(0)),
                calendar::add_days(anchor, rule.post_window_extent()),
            )
        } else {
            let anchor = calendar::anniversary_in(year, anchor_date);
            (
                anchor,
                calendar::add_days(anchor, rule.window_after),
                calendar::add_days(anchor, rule.post_window_extent() + 1),
            )
        };
        let start = calendar::add_days(anchor, -rule.window_before);

        // Age suppression, evaluated at the earliest date the window
        // influences (its start minus the pre-window prefix).
        if let (Some(limit), Some(birth)) = (rule.age_limit, contact.birth_date) {
            let check_on = calendar::add_days(start, -pre_days);
            if calendar::age_on(birth, check_on) >= limit as i32 {
                continue;
            }
        }

        // Feb 29 anchors pivot the post-window onto the state override in
        // leap years only.
        let mut post_date = post_base;
        if anchor_date.month() == 2 && anchor_date.day() == 29 && calendar::is_leap_year(year) {
            if let Some(md) = rule.leap_year_override {
                if let Some(date) = md.in_year(year) {
                    post_date = date;
                }
            }
        }

        exclusions.push(Exclusion {
            start,
            end,
            anchor,
            kind: rule.anchor.email_kind(),
            post_date,
        });
    }
    exclusions
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::config::{ContactRule, MonthDay};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn contact(id: &str, state: &str, birth: Option<NaiveDate>, effective: Option<NaiveDate>) -> Contact {
        Contact {
            id: id.into(),
            org_id: 1,
            first_name: Some("Pat".into()),
            last_name: Some("Doe".into()),
            email: format!("{id}@example.com"),
            state: Some(state.into()),
            zip_code: None,
            birth_date: birth,
            effective_date: effective,
        }
    }

    fn scheduled_of(out: &ContactSchedule, kind: EmailKind) -> Vec<NaiveDate> {
        out.emails.iter().filter(|e| e.kind == kind).map(|e| e.date).collect()
    }

    fn skip_reason(out: &ContactSchedule, kind: EmailKind) -> Option<&str> {
        out.skipped.iter().find(|s| s.kind == kind).map(|s| s.reason.as_str())
    }

    /// Restrict AEP to the given years so scenario assertions stay focused.
    fn cfg_with_aep_years(years: Vec<i32>) -> RuleConfig {
        let mut cfg = RuleConfig::default();
        cfg.aep_config.years = Some(years);
        cfg
    }

    #[test]
    fn test_deterministic_and_order_independent() {
        let cfg = RuleConfig::default();
        let c = contact("101", "CA", Some(date(1960, 12, 15)), Some(date(2000, 12, 20)));
        let range = DateRange::new(date(2023, 10, 15), date(2024, 12, 31));
        let first = schedule(&c, &cfg, range);
        let second = schedule(&c, &cfg, range);
        assert_eq!(first, second);
        assert!(first
            .emails
            .windows(2)
            .all(|pair| (pair[0].date, pair[0].kind.priority()) <= (pair[1].date, pair[1].kind.priority())));
    }

    #[test]
    fn test_ca_december_birthday_year_spanning_window() {
        // Windows anchor on the December birth anniversary:
        //   2023: [2023-11-15, 2024-01-14], 2024: [2024-11-15, 2025-01-14].
        let cfg = cfg_with_aep_years(vec![]);
        let c = contact("101", "CA", Some(date(1960, 12, 15)), Some(date(2000, 12, 20)));
        let out = schedule(&c, &cfg, DateRange::new(date(2023, 10, 15), date(2024, 12, 31)));

        // Both birthday leads (Dec 1) land inside their year's window.
        assert!(scheduled_of(&out, EmailKind::Birthday).is_empty());
        let birthday_skips: Vec<_> = out
            .skipped
            .iter()
            .filter(|s| s.kind == EmailKind::Birthday)
            .collect();
        assert_eq!(birthday_skips.len(), 2);
        assert!(birthday_skips
            .iter()
            .all(|s| s.reason.starts_with("inside exclusion window of kind birthday")));

        // Effective-date leads (Nov 20) are swallowed by the same windows.
        assert!(scheduled_of(&out, EmailKind::EffectiveDate).is_empty());
        assert!(skip_reason(&out, EmailKind::EffectiveDate)
            .unwrap()
            .starts_with("inside exclusion window"));

        // The 2023 window's post-window lands Jan 15 2024 (CA
        // post_window_period_days = 30); the 2024 window's lands Jan 15
        // 2025, outside the range, and is dropped silently.
        assert_eq!(scheduled_of(&out, EmailKind::PostWindow), vec![date(2024, 1, 15)]);
    }

    #[test]
    fn test_il_age_cutoff() {
        let cfg = cfg_with_aep_years(vec![]);
        let range = DateRange::new(date(2024, 1, 1), date(2024, 12, 31));

        // Age 76 at the earliest window-influenced date: window suppressed,
        // so the birthday lead goes out unobstructed and no post-window
        // exists.
        let older = contact("201", "IL", Some(date(1947, 6, 15)), None);
        let out = schedule(&older, &cfg, range);
        assert_eq!(scheduled_of(&out, EmailKind::Birthday), vec![date(2024, 6, 1)]);
        assert!(scheduled_of(&out, EmailKind::PostWindow).is_empty());

        // One year younger: the window is live, the lead falls in the
        // pre-window prefix, and the post-window lands the day after the
        // 45-day window closes.
        let younger = contact("202", "IL", Some(date(1948, 6, 15)), None);
        let out = schedule(&younger, &cfg, range);
        assert!(scheduled_of(&out, EmailKind::Birthday).is_empty());
        assert_eq!(
            skip_reason(&out, EmailKind::Birthday),
            Some("within pre-window exclusion")
        );
        assert_eq!(scheduled_of(&out, EmailKind::PostWindow), vec![date(2024, 7, 31)]);
    }

    #[test]
    fn test_nv_month_start_window() {
        let cfg = cfg_with_aep_years(vec![]);
        let c = contact("301", "NV", Some(date(1960, 3, 15)), None);
        let out = schedule(&c, &cfg, DateRange::new(date(2024, 1, 1), date(2024, 12, 31)));

        // Window [Mar 1, Apr 29]; the Mar 1 lead is inside it.
        assert!(scheduled_of(&out, EmailKind::Birthday).is_empty());
        assert_eq!(
            skip_reason(&out, EmailKind::Birthday).map(|r| r.starts_with("inside exclusion window")),
            Some(true)
        );
        assert_eq!(scheduled_of(&out, EmailKind::PostWindow), vec![date(2024, 4, 30)]);
    }

    #[test]
    fn test_year_round_state_skips_everything() {
        let cfg = RuleConfig::default();
        let c = contact("401", "CT", Some(date(1955, 5, 10)), Some(date(2010, 2, 1)));
        let out = schedule(&c, &cfg, DateRange::new(date(2024, 1, 1), date(2024, 12, 31)));
        assert!(out.emails.is_empty());
        assert!(!out.skipped.is_empty());
        assert!(out
            .skipped
            .iter()
            .all(|s| s.reason == "year-round enrollment state"));
        // AEP is never proposed for year-round jurisdictions.
        assert!(out.skipped.iter().all(|s| s.kind != EmailKind::Aep));
    }

    #[test]
    fn test_aep_suppression_and_force() {
        // CA birthday Aug 30: window [Jul 31, Sep 29] covers every default
        // AEP slot.
        let cfg = cfg_with_aep_years(vec![2024]);
        let c = contact("501", "CA", Some(date(1960, 8, 30)), None);
        let range = DateRange::new(date(2024, 1, 1), date(2024, 12, 31));

        let out = schedule(&c, &cfg, range);
        assert!(scheduled_of(&out, EmailKind::Aep).is_empty());
        assert_eq!(
            skip_reason(&out, EmailKind::Aep),
            Some("AEP suppressed by exclusion window")
        );

        let mut forced_cfg = cfg.clone();
        forced_cfg.contact_rules.insert(
            "501".into(),
            ContactRule { force_aep: true, ..ContactRule::default() },
        );
        let out = schedule(&c, &forced_cfg, range);
        let slot = RuleResolver::new(&forced_cfg).aep_slot(&c).unwrap();
        assert_eq!(
            scheduled_of(&out, EmailKind::Aep),
            vec![slot.in_year(2024).unwrap()]
        );
    }

    #[test]
    fn test_leap_year_anchor() {
        let cfg = cfg_with_aep_years(vec![]);
        let c = contact("701", "CA", Some(date(1960, 2, 29)), None);

        // Leap year: the post-window pivots onto CA's Mar 30 override.
        let out = schedule(&c, &cfg, DateRange::new(date(2024, 1, 1), date(2024, 12, 31)));
        assert_eq!(scheduled_of(&out, EmailKind::PostWindow), vec![date(2024, 3, 30)]);
        // The Feb 15 lead sits inside the window around the Feb 29 anchor.
        assert_eq!(
            skip_reason(&out, EmailKind::Birthday).map(|r| r.contains("anchor=2024-02-29")),
            Some(true)
        );

        // Non-leap year: the anchor falls back to Feb 28 and the override
        // does not apply.
        let out = schedule(&c, &cfg, DateRange::new(date(2025, 1, 1), date(2025, 12, 31)));
        assert_eq!(
            skip_reason(&out, EmailKind::Birthday).map(|r| r.contains("anchor=2025-02-28")),
            Some(true)
        );
        assert_eq!(scheduled_of(&out, EmailKind::PostWindow), vec![date(2025, 3, 31)]);
    }

    #[test]
    fn test_mo_effective_date_window() {
        let cfg = cfg_with_aep_years(vec![]);
        let c = contact("601", "MO", Some(date(1950, 1, 10)), Some(date(2020, 7, 1)));
        let out = schedule(&c, &cfg, DateRange::new(date(2024, 1, 1), date(2024, 12, 31)));

        // Effective window [Jun 1, Aug 3]; the Jun 1 lead is inside it.
        assert!(scheduled_of(&out, EmailKind::EffectiveDate).is_empty());
        assert!(skip_reason(&out, EmailKind::EffectiveDate)
            .unwrap()
            .starts_with("inside exclusion window of kind effective_date"));
        // Post-window the day after the 33-day tail.
        assert_eq!(scheduled_of(&out, EmailKind::PostWindow), vec![date(2024, 8, 4)]);
        // MO builds no birthday window, so the Dec 27 lead for the Jan 10
        // birthday goes out.
        assert_eq!(scheduled_of(&out, EmailKind::Birthday), vec![date(2024, 12, 27)]);
    }

    #[test]
    fn test_post_window_contact_override() {
        let mut cfg = cfg_with_aep_years(vec![]);
        cfg.contact_rules.insert(
            "101".into(),
            ContactRule {
                post_window_rules: vec![cadence_core::config::PostWindowRule {
                    condition: cadence_core::config::PostWindowCondition {
                        birth_month: Some(12),
                        states: Some(vec!["CA".into()]),
                    },
                    override_date: MonthDay::new(1, 20),
                }],
                ..ContactRule::default()
            },
        );
        let c = contact("101", "CA", Some(date(1960, 12, 15)), None);
        let out = schedule(&c, &cfg, DateRange::new(date(2023, 10, 15), date(2024, 12, 31)));
        // The override replaces the natural Jan 15 date in the post date's
        // own year.
        assert_eq!(scheduled_of(&out, EmailKind::PostWindow), vec![date(2024, 1, 20)]);
    }

    #[test]
    fn test_missing_and_invalid_anchors() {
        let cfg = RuleConfig::default();
        let range = DateRange::new(date(2024, 1, 1), date(2024, 12, 31));

        let none = contact("801", "CA", None, None);
        let out = schedule(&none, &cfg, range);
        assert!(out.emails.is_empty());
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].kind, EmailKind::All);
        assert_eq!(out.skipped[0].reason, "missing anchor dates");

        let bogus = contact("802", "CA", Some(date(1850, 1, 1)), None);
        let out = schedule(&bogus, &cfg, range);
        assert_eq!(out.skipped.len(), 1);
        assert_eq!(out.skipped[0].reason, "invalid anchor");
    }

    #[test]
    fn test_unknown_jurisdiction_is_neutral() {
        let cfg = cfg_with_aep_years(vec![2024]);
        let c = contact("901", "XX", Some(date(1960, 6, 15)), None);
        let out = schedule(&c, &cfg, DateRange::new(date(2024, 1, 1), date(2024, 12, 31)));
        // No windows: the lead and the AEP slot both go out; nothing to
        // build a post-window from.
        assert_eq!(scheduled_of(&out, EmailKind::Birthday), vec![date(2024, 6, 1)]);
        assert_eq!(scheduled_of(&out, EmailKind::Aep).len(), 1);
        assert!(scheduled_of(&out, EmailKind::PostWindow).is_empty());
    }

    #[test]
    fn test_next_year_lead_inside_range() {
        // A January anniversary's lead belongs to the previous December;
        // the candidate for end-year + 1 keeps it.
        let cfg = cfg_with_aep_years(vec![]);
        let c = contact("111", "OK", Some(date(1950, 9, 1)), Some(date(2020, 1, 10)));
        let out = schedule(&c, &cfg, DateRange::new(date(2024, 1, 1), date(2024, 12, 31)));
        assert!(scheduled_of(&out, EmailKind::EffectiveDate).contains(&date(2024, 12, 11)));
    }

    #[test]
    fn test_scheduled_dates_stay_in_range() {
        let cfg = RuleConfig::default();
        let range = DateRange::new(date(2024, 1, 1), date(2025, 12, 31));
        for (id, state, birth) in [
            ("a", "CA", date(1958, 3, 3)),
            ("b", "ID", date(1949, 7, 19)),
            ("c", "LA", date(1962, 11, 2)),
            ("d", "OR", date(1940, 1, 30)),
        ] {
            let c = contact(id, state, Some(birth), None);
            let out = schedule(&c, &cfg, range);
            for email in &out.emails {
                assert!(range.contains(email.date), "{id}: {} outside range", email.date);
            }
        }
    }
}
