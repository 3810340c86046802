use chrono::{DateTime, Days, Duration, LocalResult, Months, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Upper bound on catch-up steps in [`next_occurrence_after`].
const MAX_CATCH_UP_STEPS: usize = 20_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecurrencePattern {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RecurrencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrencePattern::None => "none",
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Yearly => "yearly",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "none" => Some(RecurrencePattern::None),
            "daily" => Some(RecurrencePattern::Daily),
            "weekly" => Some(RecurrencePattern::Weekly),
            "monthly" => Some(RecurrencePattern::Monthly),
            "yearly" => Some(RecurrencePattern::Yearly),
            _ => None,
        }
    }
}

pub fn resolve_timezone(name: &str) -> DomainResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| DomainError::InvalidTimezone(name.to_string()))
}

/// Compute the next delivery instant after `current` for a recurring message.
///
/// The step is taken on the local wall clock of `timezone`, so a message sent
/// at 09:00 local keeps arriving at 09:00 local across DST changes. Month and
/// year steps clamp to the last day of a shorter month.
pub fn next_occurrence(
    current: DateTime<Utc>,
    timezone: &str,
    pattern: RecurrencePattern,
) -> DomainResult<DateTime<Utc>> {
    let tz = resolve_timezone(timezone)?;
    let local = current.with_timezone(&tz).naive_local();

    let next_local = match pattern {
        RecurrencePattern::None => {
            return Err(DomainError::Validation(
                "message has no recurrence pattern".into(),
            ));
        }
        RecurrencePattern::Daily => local.checked_add_days(Days::new(1)),
        RecurrencePattern::Weekly => local.checked_add_days(Days::new(7)),
        RecurrencePattern::Monthly => local.checked_add_months(Months::new(1)),
        RecurrencePattern::Yearly => local.checked_add_months(Months::new(12)),
    }
    .ok_or_else(|| DomainError::Validation("next occurrence is out of range".into()))?;

    localize(&tz, next_local)
}

/// Step forward from `current` until the occurrence is strictly after `after`.
///
/// Used when a recurring message is delivered late (e.g. after downtime) so
/// the missed occurrences are skipped instead of sent in a burst.
pub fn next_occurrence_after(
    current: DateTime<Utc>,
    timezone: &str,
    pattern: RecurrencePattern,
    after: DateTime<Utc>,
) -> DomainResult<DateTime<Utc>> {
    let mut next = next_occurrence(current, timezone, pattern)?;
    for _ in 0..MAX_CATCH_UP_STEPS {
        if next > after {
            return Ok(next);
        }
        next = next_occurrence(next, timezone, pattern)?;
    }
    Err(DomainError::Validation(format!(
        "no occurrence after {after} within {MAX_CATCH_UP_STEPS} steps"
    )))
}

fn localize(tz: &Tz, local: NaiveDateTime) -> DomainResult<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        // Fall-back overlap: the first of the two wall-clock readings.
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        // Spring-forward gap: keep the offset in force before the gap.
        LocalResult::None => {
            let offset_secs = offset_before(tz, local)?;
            let utc = local - Duration::seconds(i64::from(offset_secs));
            Ok(Utc.from_utc_datetime(&utc))
        }
    }
}

fn offset_before(tz: &Tz, local: NaiveDateTime) -> DomainResult<i32> {
    (1..=6)
        .find_map(|hours| match tz.from_local_datetime(&(local - Duration::hours(hours))) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(_, dt) => {
                Some(dt.offset().fix().local_minus_utc())
            }
            LocalResult::None => None,
        })
        .ok_or_else(|| {
            DomainError::Validation(format!("cannot resolve local time {local} in {tz}"))
        })
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    fn berlin(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        resolve_timezone("Europe/Berlin")
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let err = next_occurrence(Utc::now(), "Mars/Olympus_Mons", RecurrencePattern::Daily)
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTimezone(_)));
    }

    #[test]
    fn none_pattern_has_no_next() {
        let err = next_occurrence(Utc::now(), "UTC", RecurrencePattern::None).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn same_inputs_give_same_output() {
        let start = berlin(2025, 3, 29, 9, 0);
        for pattern in [
            RecurrencePattern::Daily,
            RecurrencePattern::Weekly,
            RecurrencePattern::Monthly,
            RecurrencePattern::Yearly,
        ] {
            let a = next_occurrence(start, "Europe/Berlin", pattern).unwrap();
            let b = next_occurrence(start, "Europe/Berlin", pattern).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn daily_keeps_local_wall_clock_across_dst() {
        let tz = resolve_timezone("Europe/Berlin").unwrap();
        // Crosses the 2025-03-30 spring-forward and 2025-10-26 fall-back.
        let mut current = berlin(2025, 3, 20, 9, 0);
        for _ in 0..240 {
            current = next_occurrence(current, "Europe/Berlin", RecurrencePattern::Daily).unwrap();
            let local = current.with_timezone(&tz);
            assert_eq!((local.hour(), local.minute()), (9, 0));
        }
    }

    #[test]
    fn daily_across_spring_forward_is_23_hours() {
        let before = berlin(2025, 3, 29, 9, 0);
        let next = next_occurrence(before, "Europe/Berlin", RecurrencePattern::Daily).unwrap();
        assert_eq!(next - before, Duration::hours(23));
    }

    #[test]
    fn weekly_adds_seven_local_days() {
        let start = berlin(2025, 10, 20, 18, 30);
        let next = next_occurrence(start, "Europe/Berlin", RecurrencePattern::Weekly).unwrap();
        assert_eq!(next, berlin(2025, 10, 27, 18, 30));
    }

    #[test]
    fn monthly_clamps_to_month_end() {
        let start = berlin(2025, 1, 31, 12, 0);
        let next = next_occurrence(start, "Europe/Berlin", RecurrencePattern::Monthly).unwrap();
        assert_eq!(next, berlin(2025, 2, 28, 12, 0));
    }

    #[test]
    fn yearly_from_leap_day() {
        let start = berlin(2024, 2, 29, 7, 0);
        let next = next_occurrence(start, "Europe/Berlin", RecurrencePattern::Yearly).unwrap();
        assert_eq!(next, berlin(2025, 2, 28, 7, 0));
    }

    #[test]
    fn gap_time_moves_forward_by_gap_length() {
        let tz = resolve_timezone("America/New_York").unwrap();
        let start = tz
            .with_ymd_and_hms(2025, 3, 8, 2, 30, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        let next = next_occurrence(start, "America/New_York", RecurrencePattern::Daily).unwrap();
        let local = next.with_timezone(&tz);
        assert_eq!((local.day(), local.hour(), local.minute()), (9, 3, 30));
    }

    #[test]
    fn ambiguous_time_picks_earlier_instant() {
        let tz = resolve_timezone("America/New_York").unwrap();
        let start = tz
            .with_ymd_and_hms(2025, 11, 1, 1, 30, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        let next = next_occurrence(start, "America/New_York", RecurrencePattern::Daily).unwrap();
        // 01:30 EDT (UTC-4) on Nov 2nd.
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 11, 2, 5, 30, 0).unwrap());
    }

    #[test]
    fn catch_up_skips_missed_occurrences() {
        let start = berlin(2025, 6, 1, 9, 0);
        let after = berlin(2025, 6, 4, 12, 0);
        let next =
            next_occurrence_after(start, "Europe/Berlin", RecurrencePattern::Daily, after).unwrap();
        assert_eq!(next, berlin(2025, 6, 5, 9, 0));
    }
}
