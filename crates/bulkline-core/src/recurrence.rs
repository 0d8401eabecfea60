//! Recurrence calculator
//!
//! Pure functions mapping a recurrence rule, an IANA timezone and "now" to
//! trigger instants. Nothing here touches the store.

use bulkline_storage::models::{Campaign, RecurrenceRule, RecurringType};
use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

/// How far forward a DST gap is searched for the first valid local minute
const GAP_SEARCH_MINUTES: i64 = 24 * 60;

/// Months scanned for a monthly occurrence; day 31 recurs at least every
/// two months, so this is generous
const MONTH_SEARCH: i32 = 24;

/// Recurrence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Weekly recurrence requires at least one weekday")]
    MissingWeekdays,

    #[error("Invalid weekday {0}, expected 0 (Sunday) to 6 (Saturday)")]
    InvalidWeekday(i32),

    #[error("Invalid day of month {0}, expected 1 to 31")]
    InvalidMonthDay(i32),

    #[error("No occurrence found after {0}")]
    NoOccurrence(DateTime<Utc>),
}

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, RecurrenceError> {
    name.parse::<Tz>()
        .map_err(|_| RecurrenceError::InvalidTimezone(name.to_string()))
}

/// Check a rule and its timezone, returning the parsed timezone
pub fn validate(rule: &RecurrenceRule, timezone: &str) -> Result<Tz, RecurrenceError> {
    let tz = parse_timezone(timezone)?;

    match rule.kind {
        RecurringType::Daily => {}
        RecurringType::Weekly => {
            if rule.days.is_empty() {
                return Err(RecurrenceError::MissingWeekdays);
            }
            if let Some(&day) = rule.days.iter().find(|d| !(0..=6).contains(*d)) {
                return Err(RecurrenceError::InvalidWeekday(day));
            }
        }
        RecurringType::Monthly => {
            if let Some(&day) = rule.days.iter().find(|d| !(1..=31).contains(*d)) {
                return Err(RecurrenceError::InvalidMonthDay(day));
            }
        }
    }

    Ok(tz)
}

/// Next trigger instant strictly after `now`.
///
/// Daily rules fire on the next calendar day, weekly rules on the nearest
/// listed weekday one to seven days ahead, monthly rules on the nearest
/// listed day of the month after today (the 1st when none are listed).
pub fn next_run(
    rule: &RecurrenceRule,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, RecurrenceError> {
    let tz = validate(rule, timezone)?;
    let today = now.with_timezone(&tz).date_naive();
    let time = NaiveTime::from_hms_opt(rule.time.hour, rule.time.minute, 0)
        .ok_or(RecurrenceError::NoOccurrence(now))?;

    let found = match rule.kind {
        RecurringType::Daily => (1..=2)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .filter_map(|date| resolve_local(&tz, date, time))
            .find(|at| *at > now),
        RecurringType::Weekly => (1..=14)
            .filter_map(|offset| today.checked_add_days(Days::new(offset)))
            .filter(|date| {
                rule.days
                    .contains(&(date.weekday().num_days_from_sunday() as i32))
            })
            .filter_map(|date| resolve_local(&tz, date, time))
            .find(|at| *at > now),
        RecurringType::Monthly => next_monthly(&tz, &rule.days, today, time, now),
    };

    found.ok_or(RecurrenceError::NoOccurrence(now))
}

fn next_monthly(
    tz: &Tz,
    days: &[i32],
    today: NaiveDate,
    time: NaiveTime,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut days: Vec<u32> = if days.is_empty() {
        vec![1]
    } else {
        days.iter().map(|d| *d as u32).collect()
    };
    days.sort_unstable();
    days.dedup();

    for offset in 0..=MONTH_SEARCH {
        let month0 = today.month0() as i32 + offset;
        let year = today.year() + month0.div_euclid(12);
        let month = month0.rem_euclid(12) as u32 + 1;

        for &day in &days {
            // Days missing from this month (31 in April) are skipped
            let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                continue;
            };
            if date <= today {
                continue;
            }
            if let Some(at) = resolve_local(tz, date, time) {
                if at > now {
                    return Some(at);
                }
            }
        }
    }
    None
}

/// Map a local wall-clock time to UTC. Ambiguous times take the earliest
/// instant; times inside a DST gap move to the first valid minute after it.
pub fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let local = NaiveDateTime::new(date, time);

    for minutes in 0..=GAP_SEARCH_MINUTES {
        let candidate = local + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(at) => return Some(at.with_timezone(&Utc)),
            LocalResult::Ambiguous(a, b) => {
                return Some(a.min(b).with_timezone(&Utc));
            }
            LocalResult::None => continue,
        }
    }
    None
}

/// Whether `date` is an occurrence day of `rule`
fn is_occurrence_day(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    match rule.kind {
        RecurringType::Daily => true,
        RecurringType::Weekly => rule
            .days
            .contains(&(date.weekday().num_days_from_sunday() as i32)),
        RecurringType::Monthly => {
            let day = date.day() as i32;
            if rule.days.is_empty() {
                day == 1
            } else {
                rule.days.contains(&day)
            }
        }
    }
}

/// Whether a recurring campaign is due to fire at `now`.
///
/// True when the local wall clock in the campaign's timezone reads exactly the
/// trigger hour and minute on an occurrence day, and the campaign has not
/// fired within `refire_guard`.
pub fn should_fire(campaign: &Campaign, now: DateTime<Utc>, refire_guard: Duration) -> bool {
    let Some(rule) = campaign.recurrence() else {
        return false;
    };
    let Ok(tz) = parse_timezone(&campaign.timezone) else {
        return false;
    };

    let local = now.with_timezone(&tz);
    if local.hour() != rule.time.hour || local.minute() != rule.time.minute {
        return false;
    }
    if !is_occurrence_day(&rule, local.date_naive()) {
        return false;
    }

    match campaign.last_run_at {
        Some(last) => now - last >= refire_guard,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkline_common::types::TimeOfDay;
    use bulkline_storage::models::CampaignStatus;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn rule(kind: RecurringType, days: Vec<i32>, time: &str) -> RecurrenceRule {
        RecurrenceRule {
            kind,
            days,
            time: TimeOfDay::parse(time).unwrap(),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn recurring_campaign(rule: RecurrenceRule, timezone: &str) -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            owner_user_id: None,
            device_id: "device-1".to_string(),
            name: "Weekly digest".to_string(),
            message: "Hello".to_string(),
            media_url: None,
            total_recipients: 0,
            sent_count: 0,
            failed_count: 0,
            status: CampaignStatus::Scheduled,
            scheduled_at: None,
            timezone: timezone.to_string(),
            is_recurring: true,
            recurring_type: Some(rule.kind),
            recurring_days: rule.days,
            recurring_time: Some(rule.time),
            next_run_at: None,
            last_run_at: None,
            run_count: 0,
            max_runs: None,
            priority: 0,
            started_at: None,
            completed_at: None,
            locked_by: None,
            locked_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_daily_is_never_today() {
        let daily = rule(RecurringType::Daily, vec![], "09:00");

        // 07:30 in Jakarta (UTC+7), before today's trigger
        let next = next_run(&daily, "Asia/Jakarta", utc(2024, 5, 14, 0, 30)).unwrap();
        assert_eq!(next, utc(2024, 5, 15, 2, 0));

        // 08:00 in Jakarta
        let next = next_run(&daily, "Asia/Jakarta", utc(2024, 5, 14, 1, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 15, 2, 0));
    }

    #[test]
    fn test_weekly_picks_nearest_listed_weekday() {
        let weekly = rule(RecurringType::Weekly, vec![1, 3], "10:00");

        // Tuesday 2024-05-14 11:00 -> Wednesday 10:00
        let next = next_run(&weekly, "UTC", utc(2024, 5, 14, 11, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 15, 10, 0));

        // Wednesday 2024-05-15 09:00 -> next Monday, never the same day
        let next = next_run(&weekly, "UTC", utc(2024, 5, 15, 9, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 20, 10, 0));
    }

    #[test]
    fn test_weekly_single_day_wraps_a_full_week() {
        let weekly = rule(RecurringType::Weekly, vec![2], "10:00");
        let next = next_run(&weekly, "UTC", utc(2024, 5, 14, 9, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 21, 10, 0));
    }

    #[test]
    fn test_monthly_skips_missing_days() {
        let monthly = rule(RecurringType::Monthly, vec![31], "08:00");
        // April has no 31st
        let next = next_run(&monthly, "UTC", utc(2024, 4, 10, 12, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 31, 8, 0));
    }

    #[test]
    fn test_monthly_strictly_after_today() {
        let monthly = rule(RecurringType::Monthly, vec![15, 1], "09:00");
        let next = next_run(&monthly, "UTC", utc(2024, 5, 15, 8, 0)).unwrap();
        assert_eq!(next, utc(2024, 6, 1, 9, 0));

        let next = next_run(&monthly, "UTC", utc(2024, 12, 20, 8, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 1, 9, 0));
    }

    #[test]
    fn test_monthly_defaults_to_first() {
        let monthly = rule(RecurringType::Monthly, vec![], "09:00");
        let next = next_run(&monthly, "UTC", utc(2024, 5, 1, 8, 0)).unwrap();
        assert_eq!(next, utc(2024, 6, 1, 9, 0));
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        // 02:30 does not exist in New York on 2024-03-10
        let daily = rule(RecurringType::Daily, vec![], "02:30");
        let next = next_run(&daily, "America/New_York", utc(2024, 3, 9, 17, 0)).unwrap();
        assert_eq!(next, utc(2024, 3, 10, 7, 0));
    }

    #[test]
    fn test_dst_ambiguous_takes_earliest() {
        // 01:30 happens twice in New York on 2024-11-03
        let daily = rule(RecurringType::Daily, vec![], "01:30");
        let next = next_run(&daily, "America/New_York", utc(2024, 11, 2, 16, 0)).unwrap();
        assert_eq!(next, utc(2024, 11, 3, 5, 30));
    }

    #[test]
    fn test_invalid_input_is_an_error() {
        let daily = rule(RecurringType::Daily, vec![], "09:00");
        assert_eq!(
            next_run(&daily, "Mars/Olympus", Utc::now()),
            Err(RecurrenceError::InvalidTimezone("Mars/Olympus".to_string()))
        );

        let weekly = rule(RecurringType::Weekly, vec![], "09:00");
        assert_eq!(
            next_run(&weekly, "UTC", Utc::now()),
            Err(RecurrenceError::MissingWeekdays)
        );

        let weekly = rule(RecurringType::Weekly, vec![7], "09:00");
        assert_eq!(
            validate(&weekly, "UTC"),
            Err(RecurrenceError::InvalidWeekday(7))
        );

        let monthly = rule(RecurringType::Monthly, vec![0], "09:00");
        assert_eq!(
            validate(&monthly, "UTC"),
            Err(RecurrenceError::InvalidMonthDay(0))
        );
    }

    #[test]
    fn test_should_fire_on_trigger_minute() {
        let campaign = recurring_campaign(rule(RecurringType::Daily, vec![], "09:00"), "Asia/Jakarta");
        let guard = Duration::minutes(2);

        assert!(should_fire(&campaign, utc(2024, 5, 14, 2, 0), guard));
        assert!(should_fire(&campaign, utc(2024, 5, 14, 2, 0) + Duration::seconds(59), guard));
        assert!(!should_fire(&campaign, utc(2024, 5, 14, 2, 1), guard));
        assert!(!should_fire(&campaign, utc(2024, 5, 14, 9, 0), guard));
    }

    #[test]
    fn test_should_fire_respects_refire_guard() {
        let mut campaign = recurring_campaign(rule(RecurringType::Daily, vec![], "09:00"), "UTC");
        let now = utc(2024, 5, 14, 9, 0) + Duration::seconds(40);
        campaign.last_run_at = Some(utc(2024, 5, 14, 9, 0));
        assert!(!should_fire(&campaign, now, Duration::minutes(2)));

        campaign.last_run_at = Some(utc(2024, 5, 13, 9, 0));
        assert!(should_fire(&campaign, now, Duration::minutes(2)));
    }

    #[test]
    fn test_should_fire_only_on_listed_weekdays() {
        let campaign = recurring_campaign(rule(RecurringType::Weekly, vec![3], "10:00"), "UTC");
        let guard = Duration::minutes(2);
        // Tuesday
        assert!(!should_fire(&campaign, utc(2024, 5, 14, 10, 0), guard));
        // Wednesday
        assert!(should_fire(&campaign, utc(2024, 5, 15, 10, 0), guard));
    }

    #[test]
    fn test_should_fire_ignores_one_shot() {
        let mut campaign = recurring_campaign(rule(RecurringType::Daily, vec![], "09:00"), "UTC");
        campaign.is_recurring = false;
        assert!(!should_fire(&campaign, utc(2024, 5, 14, 9, 0), Duration::minutes(2)));
    }
}
