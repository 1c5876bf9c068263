// =============================================================================
// Trading-schedule evaluation (UTC)
// =============================================================================

use chrono::{DateTime, NaiveTime, Utc};

use super::config::Schedule;

/// Check `now` against the allowed windows. Returns `Ok(())` inside a
/// window, otherwise the rejection detail (without the `schedule:` prefix).
///
/// A weekday with no entry — or an entry with no ranges — is closed.
/// Range bounds are inclusive.
pub fn check(schedule: &Schedule, now: DateTime<Utc>) -> Result<(), String> {
    let weekday = now.format("%A").to_string();
    let current = now.time();

    let Some(ranges) = schedule.days.get(&weekday) else {
        return Err(format!("day_not_allowed:{weekday}"));
    };

    if ranges.is_empty() {
        return Err(format!("no_ranges_for:{weekday}"));
    }

    for range in ranges {
        if range.len() != 2 {
            continue;
        }
        let (Ok(start), Ok(end)) = (
            NaiveTime::parse_from_str(&range[0], "%H:%M"),
            NaiveTime::parse_from_str(&range[1], "%H:%M"),
        ) else {
            continue;
        };

        if start <= current && current <= end {
            return Ok(());
        }
    }

    Err(format!(
        "outside_hours:{weekday}_{}",
        now.format("%H:%M")
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use super::*;

    fn schedule_for(day: &str, ranges: &[(&str, &str)]) -> Schedule {
        let mut days = HashMap::new();
        days.insert(
            day.to_string(),
            ranges
                .iter()
                .map(|(a, b)| vec![a.to_string(), b.to_string()])
                .collect(),
        );
        Schedule { enabled: true, days }
    }

    // 2026-01-05 is a Monday.
    fn monday_at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, h, m, 0).unwrap()
    }

    #[test]
    fn inside_a_window_is_allowed() {
        let s = schedule_for("Monday", &[("09:00", "17:00")]);
        assert!(check(&s, monday_at(12, 30)).is_ok());
        // Bounds are inclusive.
        assert!(check(&s, monday_at(9, 0)).is_ok());
        assert!(check(&s, monday_at(17, 0)).is_ok());
    }

    #[test]
    fn outside_every_window_is_rejected() {
        let s = schedule_for("Monday", &[("09:00", "12:00"), ("14:00", "17:00")]);
        let err = check(&s, monday_at(13, 0)).unwrap_err();
        assert_eq!(err, "outside_hours:Monday_13:00");
        assert!(check(&s, monday_at(14, 30)).is_ok());
    }

    #[test]
    fn missing_weekday_is_rejected() {
        let s = schedule_for("Tuesday", &[("00:00", "23:59")]);
        let err = check(&s, monday_at(12, 0)).unwrap_err();
        assert_eq!(err, "day_not_allowed:Monday");
    }

    #[test]
    fn empty_range_list_is_rejected() {
        let s = schedule_for("Monday", &[]);
        let err = check(&s, monday_at(12, 0)).unwrap_err();
        assert_eq!(err, "no_ranges_for:Monday");
    }

    #[test]
    fn malformed_ranges_are_skipped() {
        let mut s = schedule_for("Monday", &[("09:00", "17:00")]);
        s.days
            .get_mut("Monday")
            .unwrap()
            .push(vec!["garbage".to_string()]);
        assert!(check(&s, monday_at(10, 0)).is_ok());
    }
}
