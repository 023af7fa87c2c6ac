//! Schedule evaluation.
//!
//! Both forms — `interval:SECS` and classic 5-field cron — evaluate as pure
//! functions of `(now, last_run)`, so the scheduler's trigger logic is
//! deterministic under an injected clock and the tests never sleep.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::TransferError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Run every N seconds, measured from the previous run.
    Interval(u64),
    /// Classic `minute hour day month weekday` cron expression.
    Cron(CronSpec),
}

/// Expanded cron fields.  Each vector holds the concrete values the field
/// matches, sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    pub minutes: Vec<u32>,
    pub hours: Vec<u32>,
    pub days: Vec<u32>,
    pub months: Vec<u32>,
    /// 0 = Sunday, matching conventional cron.
    pub weekdays: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Schedule {
    pub fn parse(spec: &str) -> Result<Self, TransferError> {
        let spec = spec.trim();
        if let Some(secs) = spec.strip_prefix("interval:") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                TransferError::Validation(format!("invalid interval schedule: {spec:?}"))
            })?;
            if secs == 0 {
                return Err(TransferError::Validation(
                    "interval schedule must be non-zero".into(),
                ));
            }
            return Ok(Schedule::Interval(secs));
        }

        let parts: Vec<&str> = spec.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(TransferError::Validation(format!(
                "cron expression must have 5 fields: {spec:?}"
            )));
        }

        Ok(Schedule::Cron(CronSpec {
            minutes: parse_field(parts[0], 0, 59)?,
            hours: parse_field(parts[1], 0, 23)?,
            days: parse_field(parts[2], 1, 31)?,
            months: parse_field(parts[3], 1, 12)?,
            weekdays: parse_field(parts[4], 0, 6)?,
        }))
    }

    /// Whether a run is due at `now` given the previous run time.
    ///
    /// Interval schedules fire once the elapsed time reaches the interval
    /// (immediately when never run).  Cron schedules fire in any minute the
    /// expression matches, at most once per matching minute.
    pub fn due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            Schedule::Interval(secs) => match last_run {
                None => true,
                Some(last) => now - last >= Duration::seconds(*secs as i64),
            },
            Schedule::Cron(spec) => {
                if !spec.matches(now) {
                    return false;
                }
                match last_run {
                    None => true,
                    Some(last) => truncate_minute(last) != truncate_minute(now),
                }
            }
        }
    }

    /// The next instant at or after `after` when this schedule fires.
    pub fn next_run(
        &self,
        last_run: Option<DateTime<Utc>>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(secs) => Some(match last_run {
                None => after,
                Some(last) => {
                    let next = last + Duration::seconds(*secs as i64);
                    next.max(after)
                }
            }),
            Schedule::Cron(spec) => {
                let mut candidate = truncate_minute(after);
                // One year of minutes bounds the scan for any satisfiable
                // expression.
                for _ in 0..(366 * 24 * 60) {
                    if candidate >= after && spec.matches(candidate) {
                        return Some(candidate);
                    }
                    candidate += Duration::minutes(1);
                }
                None
            }
        }
    }
}

impl CronSpec {
    /// Minute-resolution match.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(&at.minute())
            && self.hours.contains(&at.hour())
            && self.days.contains(&at.day())
            && self.months.contains(&at.month())
            && self
                .weekdays
                .contains(&at.weekday().num_days_from_sunday())
    }
}

fn truncate_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Expand one cron field: `*`, single values, `a-b` ranges, `a,b,c` lists,
/// and `*/n` or `a-b/n` steps.
fn parse_field(part: &str, min: u32, max: u32) -> Result<Vec<u32>, TransferError> {
    let invalid =
        || TransferError::Validation(format!("invalid cron field {part:?} (range {min}-{max})"));

    let mut values = Vec::new();
    for piece in part.split(',') {
        let (base, step) = match piece.split_once('/') {
            Some((b, s)) => {
                let step: u32 = s.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (b, step)
            }
            None => (piece, 1),
        };

        let (start, end) = if base == "*" || base.is_empty() {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid())?;
            let b: u32 = b.parse().map_err(|_| invalid())?;
            if a > b {
                return Err(invalid());
            }
            (a, b)
        } else {
            let v: u32 = base.parse().map_err(|_| invalid())?;
            (v, v)
        };

        if start < min || end > max {
            return Err(invalid());
        }
        values.extend((start..=end).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(invalid());
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_field_forms() {
        assert_eq!(parse_field("*", 0, 3).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_field("5", 0, 59).unwrap(), vec![5]);
        assert_eq!(parse_field("1-3", 0, 59).unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_field("1,3,5", 0, 59).unwrap(), vec![1, 3, 5]);
        assert_eq!(
            parse_field("*/15", 0, 59).unwrap(),
            vec![0, 15, 30, 45]
        );
        assert_eq!(parse_field("10-20/5", 0, 59).unwrap(), vec![10, 15, 20]);
        assert!(parse_field("61", 0, 59).is_err());
        assert!(parse_field("*/0", 0, 59).is_err());
        assert!(parse_field("x", 0, 59).is_err());
    }

    #[test]
    fn nightly_cron_matches_only_at_three() {
        let schedule = Schedule::parse("0 3 * * *").unwrap();
        let Schedule::Cron(ref spec) = schedule else {
            panic!("expected cron")
        };
        assert!(spec.matches(at(2024, 5, 1, 3, 0)));
        assert!(!spec.matches(at(2024, 5, 1, 3, 1)));
        assert!(!spec.matches(at(2024, 5, 1, 4, 0)));
    }

    #[test]
    fn cron_fires_once_per_matching_minute() {
        let schedule = Schedule::parse("0 3 * * *").unwrap();
        let t = at(2024, 5, 1, 3, 0);
        assert!(schedule.due(None, t));
        assert!(schedule.due(Some(at(2024, 4, 30, 3, 0)), t));
        // Already ran in this minute: not due again.
        assert!(!schedule.due(Some(t + Duration::seconds(10)), t + Duration::seconds(40)));
    }

    #[test]
    fn interval_due_from_last_run() {
        let schedule = Schedule::parse("interval:300").unwrap();
        let t = at(2024, 5, 1, 12, 0);
        assert!(schedule.due(None, t));
        assert!(!schedule.due(Some(t), t + Duration::seconds(299)));
        assert!(schedule.due(Some(t), t + Duration::seconds(300)));
    }

    #[test]
    fn next_run_scans_forward() {
        let schedule = Schedule::parse("30 4 * * *").unwrap();
        let next = schedule
            .next_run(None, at(2024, 5, 1, 12, 0))
            .unwrap();
        assert_eq!(next, at(2024, 5, 2, 4, 30));

        let interval = Schedule::parse("interval:600").unwrap();
        let next = interval
            .next_run(Some(at(2024, 5, 1, 12, 0)), at(2024, 5, 1, 12, 1))
            .unwrap();
        assert_eq!(next, at(2024, 5, 1, 12, 10));
    }

    #[test]
    fn weekday_uses_sunday_zero() {
        // 2024-05-05 is a Sunday.
        let schedule = Schedule::parse("0 0 * * 0").unwrap();
        let Schedule::Cron(ref spec) = schedule else {
            panic!("expected cron")
        };
        assert!(spec.matches(at(2024, 5, 5, 0, 0)));
        assert!(!spec.matches(at(2024, 5, 6, 0, 0)));
    }

    #[test]
    fn rejects_malformed_schedules() {
        assert!(Schedule::parse("interval:0").is_err());
        assert!(Schedule::parse("interval:abc").is_err());
        assert!(Schedule::parse("* * *").is_err());
        assert!(Schedule::parse("99 * * * *").is_err());
    }
}
