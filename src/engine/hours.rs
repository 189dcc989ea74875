//! Working hours: weekly local-time rules expanded into concrete UTC intervals.
//!
//! Local wall-clock times inside a DST gap move forward to the first valid
//! instant after the gap; ambiguous times (fall back) take the earlier instant.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::limits::MAX_RULES_PER_HOST;
use crate::model::*;

use super::availability::normalize;
use super::EngineError;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Longest DST gap searched when shifting a nonexistent local time forward.
const MAX_GAP_MINUTES: i64 = 3 * 60;

pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::InvalidInput(format!("unknown timezone: {name}")))
}

/// `"HH:MM"` → minutes since local midnight. `"24:00"` is accepted as end of day.
pub fn parse_hhmm(s: &str) -> Result<u16, EngineError> {
    let invalid = || EngineError::InvalidInput(format!("invalid time of day: {s:?}"));
    let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return Err(invalid());
    }
    let h: u16 = h.parse().map_err(|_| invalid())?;
    let m: u16 = m.parse().map_err(|_| invalid())?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(invalid());
    }
    Ok(h * 60 + m)
}

pub fn format_hhmm(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

pub fn validate_rule(rule: &WorkingHoursRule) -> Result<(), EngineError> {
    if rule.weekday > 6 {
        return Err(EngineError::InvalidInput(format!("weekday {} out of range 0-6", rule.weekday)));
    }
    if rule.end_minute > MINUTES_PER_DAY {
        return Err(EngineError::InvalidInput("end time past midnight".into()));
    }
    if rule.enabled && rule.start_minute >= rule.end_minute {
        return Err(EngineError::InvalidInput(format!(
            "start {} must be before end {}",
            format_hhmm(rule.start_minute),
            format_hhmm(rule.end_minute)
        )));
    }
    Ok(())
}

/// One weekday of an availability override as it arrives in JSON.
#[derive(Deserialize)]
#[serde(untagged)]
enum DayJson {
    Keyword(String),
    Windows(Vec<WindowJson>),
}

#[derive(Deserialize)]
struct WindowJson {
    start: String,
    end: String,
}

/// Parse a template's availability override.
///
/// Shape: an object keyed by weekday `"0"`..`"6"` (Monday first). Each value is
/// either the string `"closed"` or a list of `{"start": "HH:MM", "end": "HH:MM"}`.
pub fn parse_availability_rules(json: &str) -> Result<AvailabilityRules, EngineError> {
    let days: BTreeMap<String, DayJson> = serde_json::from_str(json)
        .map_err(|e| EngineError::InvalidInput(format!("availability rules: {e}")))?;

    let mut rules = AvailabilityRules::default();
    for (key, day) in days {
        let weekday: u8 = key
            .parse()
            .ok()
            .filter(|d| *d <= 6)
            .ok_or_else(|| EngineError::InvalidInput(format!("invalid weekday key: {key:?}")))?;
        let entry = match day {
            DayJson::Keyword(k) if k.eq_ignore_ascii_case("closed") => DayOverride::Closed,
            DayJson::Keyword(k) => {
                return Err(EngineError::InvalidInput(format!(
                    "weekday {key}: expected \"closed\" or a list of windows, got {k:?}"
                )));
            }
            DayJson::Windows(items) => {
                if items.len() > MAX_RULES_PER_HOST {
                    return Err(EngineError::LimitExceeded("too many availability windows"));
                }
                let windows = items.iter().map(window).collect::<Result<Vec<_>, _>>()?;
                DayOverride::Windows(windows)
            }
        };
        rules.days.insert(weekday, entry);
    }
    Ok(rules)
}

fn window(item: &WindowJson) -> Result<LocalWindow, EngineError> {
    let start_minute = parse_hhmm(&item.start)?;
    let end_minute = parse_hhmm(&item.end)?;
    if start_minute >= end_minute {
        return Err(EngineError::InvalidInput("window start must be before end".into()));
    }
    Ok(LocalWindow { start_minute, end_minute })
}

/// UTC instant of `minute` minutes after local midnight of `date`.
pub fn local_to_utc(tz: &Tz, date: NaiveDate, minute: u16) -> Option<Ms> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    let local = midnight + Duration::minutes(i64::from(minute));
    resolve_local(tz, local).map(|dt| dt.timestamp_millis())
}

fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    if let Some(dt) = tz.from_local_datetime(&local).earliest() {
        return Some(dt);
    }
    // Gap: walk forward to the first wall-clock minute that exists.
    (1..=MAX_GAP_MINUTES).find_map(|step| {
        tz.from_local_datetime(&(local + Duration::minutes(step)))
            .earliest()
    })
}

/// A UTC instant rendered in `tz`, for presentation.
pub fn local_time(tz: &Tz, at: Ms) -> Option<DateTime<FixedOffset>> {
    DateTime::from_timestamp_millis(at).map(|dt| dt.with_timezone(tz).fixed_offset())
}

/// Local `(start, end)` minute windows for one weekday after applying the override.
fn day_windows(
    weekday: u8,
    rules: &[WorkingHoursRule],
    overrides: Option<&AvailabilityRules>,
) -> Vec<(u16, u16)> {
    let base = rules
        .iter()
        .filter(|r| r.enabled && r.weekday == weekday && r.start_minute < r.end_minute)
        .map(|r| (r.start_minute, r.end_minute));

    match overrides.and_then(|o| o.days.get(&weekday)) {
        None => base.collect(),
        Some(DayOverride::Closed) => Vec::new(),
        Some(DayOverride::Windows(windows)) => base
            .flat_map(|(s, e)| {
                windows.iter().filter_map(move |w| {
                    let start = s.max(w.start_minute);
                    let end = e.min(w.end_minute);
                    (start < end).then_some((start, end))
                })
            })
            .collect(),
    }
}

/// Working intervals inside `range`, sorted and merged.
///
/// Every local day that touches `range` is evaluated, so a UTC day near the
/// host's offset picks up windows from both neighbouring local days. No enabled
/// rule means no availability.
pub fn expand(
    tz: &Tz,
    rules: &[WorkingHoursRule],
    overrides: Option<&AvailabilityRules>,
    range: &Span,
) -> Vec<Span> {
    if !rules.iter().any(|r| r.enabled) {
        return Vec::new();
    }
    let (Some(first), Some(last)) = (
        DateTime::from_timestamp_millis(range.start),
        DateTime::from_timestamp_millis(range.end),
    ) else {
        return Vec::new();
    };
    let Some(first_day) = first.with_timezone(tz).date_naive().pred_opt() else {
        return Vec::new();
    };
    let Some(last_day) = last.with_timezone(tz).date_naive().succ_opt() else {
        return Vec::new();
    };

    let mut spans = Vec::new();
    for date in first_day.iter_days().take_while(|d| *d <= last_day) {
        let weekday = date.weekday().num_days_from_monday() as u8;
        for (start_minute, end_minute) in day_windows(weekday, rules, overrides) {
            let (Some(start), Some(end)) = (
                local_to_utc(tz, date, start_minute),
                local_to_utc(tz, date, end_minute),
            ) else {
                continue;
            };
            if let Some(span) = Span::try_new(start, end).and_then(|s| s.intersect(range)) {
                spans.push(span);
            }
        }
    }
    normalize(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis()
    }

    fn rule(weekday: u8, start: &str, end: &str) -> WorkingHoursRule {
        WorkingHoursRule {
            weekday,
            start_minute: parse_hhmm(start).unwrap(),
            end_minute: parse_hhmm(end).unwrap(),
            enabled: true,
        }
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("09:30").unwrap(), 570);
        assert_eq!(parse_hhmm("9:05").unwrap(), 545);
        assert_eq!(parse_hhmm("24:00").unwrap(), 1440);
        assert!(parse_hhmm("24:01").is_err());
        assert!(parse_hhmm("12:60").is_err());
        assert!(parse_hhmm("noon").is_err());
        assert_eq!(format_hhmm(570), "09:30");
    }

    #[test]
    fn rule_validation() {
        assert!(validate_rule(&rule(0, "09:00", "17:00")).is_ok());
        assert!(validate_rule(&rule(7, "09:00", "17:00")).is_err());
        let mut backwards = rule(1, "09:00", "17:00");
        backwards.start_minute = 1020;
        backwards.end_minute = 540;
        assert!(validate_rule(&backwards).is_err());
        backwards.enabled = false;
        assert!(validate_rule(&backwards).is_ok());
    }

    #[test]
    fn no_enabled_rules_is_no_availability() {
        let mut r = rule(0, "09:00", "17:00");
        r.enabled = false;
        let week = Span::new(utc(2024, 1, 1, 0, 0), utc(2024, 1, 8, 0, 0));
        assert!(expand(&chrono_tz::UTC, &[r], None, &week).is_empty());
        assert!(expand(&chrono_tz::UTC, &[], None, &week).is_empty());
    }

    #[test]
    fn weekday_rules_expand_per_day() {
        // 2024-01-01 is a Monday.
        let rules = vec![rule(0, "09:00", "12:00"), rule(0, "11:00", "17:00"), rule(2, "10:00", "11:00")];
        let week = Span::new(utc(2024, 1, 1, 0, 0), utc(2024, 1, 8, 0, 0));
        let spans = expand(&chrono_tz::UTC, &rules, None, &week);
        assert_eq!(
            spans,
            vec![
                Span::new(utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 17, 0)),
                Span::new(utc(2024, 1, 3, 10, 0), utc(2024, 1, 3, 11, 0)),
            ]
        );
    }

    #[test]
    fn utc_day_picks_up_previous_local_day() {
        // Monday 20:00-23:00 in New York is Tuesday 01:00-04:00 UTC.
        let tz: Tz = "America/New_York".parse().unwrap();
        let tuesday = Span::new(utc(2024, 1, 9, 0, 0), utc(2024, 1, 10, 0, 0));
        let spans = expand(&tz, &[rule(0, "20:00", "23:00")], None, &tuesday);
        assert_eq!(spans, vec![Span::new(utc(2024, 1, 9, 1, 0), utc(2024, 1, 9, 4, 0))]);
    }

    #[test]
    fn range_clips_intervals() {
        let rules = vec![rule(0, "09:00", "17:00")];
        let range = Span::new(utc(2024, 1, 1, 12, 0), utc(2024, 1, 1, 13, 0));
        assert_eq!(expand(&chrono_tz::UTC, &rules, None, &range), vec![range]);
    }

    #[test]
    fn dst_gap_shifts_forward() {
        // Europe/Berlin springs forward 02:00 -> 03:00 on Sunday 2024-03-31.
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let day = Span::new(utc(2024, 3, 30, 0, 0), utc(2024, 4, 1, 0, 0));
        let spans = expand(&tz, &[rule(6, "02:30", "05:00")], None, &day);
        assert_eq!(spans, vec![Span::new(utc(2024, 3, 31, 1, 0), utc(2024, 3, 31, 3, 0))]);
    }

    #[test]
    fn dst_ambiguous_takes_earlier_instant() {
        // Europe/Berlin falls back 03:00 -> 02:00 on Sunday 2024-10-27.
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let day = Span::new(utc(2024, 10, 26, 0, 0), utc(2024, 10, 28, 0, 0));
        let spans = expand(&tz, &[rule(6, "02:30", "04:00")], None, &day);
        assert_eq!(spans, vec![Span::new(utc(2024, 10, 27, 0, 30), utc(2024, 10, 27, 3, 0))]);
    }

    #[test]
    fn overrides_narrow_and_close_days() {
        let rules = vec![rule(0, "09:00", "17:00"), rule(1, "09:00", "17:00"), rule(2, "09:00", "17:00")];
        let overrides =
            parse_availability_rules(r#"{"0": [{"start": "08:00", "end": "10:00"}, {"start": "16:00", "end": "18:00"}], "1": "closed"}"#)
                .unwrap();
        let week = Span::new(utc(2024, 1, 1, 0, 0), utc(2024, 1, 8, 0, 0));
        let spans = expand(&chrono_tz::UTC, &rules, Some(&overrides), &week);
        assert_eq!(
            spans,
            vec![
                Span::new(utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0)),
                Span::new(utc(2024, 1, 1, 16, 0), utc(2024, 1, 1, 17, 0)),
                Span::new(utc(2024, 1, 3, 9, 0), utc(2024, 1, 3, 17, 0)),
            ]
        );
    }

    #[test]
    fn override_never_widens_hours() {
        let overrides = parse_availability_rules(r#"{"3": [{"start": "00:00", "end": "24:00"}]}"#).unwrap();
        let week = Span::new(utc(2024, 1, 1, 0, 0), utc(2024, 1, 8, 0, 0));
        // Thursday has no base rule, so the override opens nothing.
        let spans = expand(&chrono_tz::UTC, &[rule(0, "09:00", "10:00")], Some(&overrides), &week);
        assert_eq!(spans, vec![Span::new(utc(2024, 1, 1, 9, 0), utc(2024, 1, 1, 10, 0))]);
    }

    #[test]
    fn availability_rules_rejects_bad_shapes() {
        assert!(parse_availability_rules("[]").is_err());
        assert!(parse_availability_rules(r#"{"7": "closed"}"#).is_err());
        assert!(parse_availability_rules(r#"{"monday": "closed"}"#).is_err());
        assert!(parse_availability_rules(r#"{"0": "open"}"#).is_err());
        assert!(parse_availability_rules(r#"{"0": [{"start": "10:00", "end": "09:00"}]}"#).is_err());
        assert!(parse_availability_rules(r#"{"0": [{"start": "10:00"}]}"#).is_err());
        assert!(parse_availability_rules("not json").is_err());
    }

    #[test]
    fn presentation_offset_follows_zone() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let local = local_time(&tz, utc(2024, 1, 1, 9, 0)).unwrap();
        assert_eq!(local.offset().local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(local.timestamp_millis(), utc(2024, 1, 1, 9, 0));
    }
}
