//! Cron evaluation for 5-field expressions ("MIN HOUR DOM MON DOW").
//!
//! Parsing and occurrence search are delegated to `croner`; this module adds
//! the timezone binding, the strict 5-field rule, bounded window enumeration
//! and a backward search for the previous fire instant.
//! Example: "0 3 * * *" = every day at 03:00 in the task's timezone.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use croner::Cron;

use taskdeck_core::error::{Result, TaskdeckError};

/// Longest look-back used when searching for the previous fire instant.
const MAX_LOOKBACK_DAYS: i64 = 366 * 5;

/// A parsed cron expression bound to an IANA timezone.
pub struct CronSchedule {
    expression: String,
    timezone: Tz,
    cron: Cron,
}

impl std::fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl CronSchedule {
    /// Parse an expression and timezone. Fails with a validation error on either.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let tz = parse_timezone(timezone)?;
        let cron = parse_expression(expression)?;
        Ok(Self {
            expression: expression.trim().to_string(),
            timezone: tz,
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.search(after, false)
    }

    /// First fire instant at or after `from`.
    pub fn next_from(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.search(from, true)
    }

    fn search(&self, from: DateTime<Utc>, inclusive: bool) -> Option<DateTime<Utc>> {
        let local = from.with_timezone(&self.timezone);
        match self.cron.find_next_occurrence(&local, inclusive) {
            Ok(next) => Some(next.with_timezone(&Utc)),
            Err(e) => {
                tracing::debug!("No occurrence for '{}' after {}: {e}", self.expression, from);
                None
            }
        }
    }

    /// Whether the schedule fires at least once in `(after, until]`.
    pub fn fires_in(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        self.next_after(after).is_some_and(|next| next <= until)
    }

    /// Every fire instant in the half-open window `[start, end)`, ascending.
    ///
    /// Iteration is bounded by the window length in minutes, and the cursor
    /// always moves strictly forward.
    pub fn fires_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut runs = Vec::new();
        if end <= start {
            return runs;
        }
        let cap = (end - start).num_minutes().max(0) as usize + 1;

        let mut cursor = match self.next_from(start) {
            Some(first) => first,
            None => return runs,
        };
        while cursor < end && runs.len() < cap {
            runs.push(cursor);
            match self.next_after(cursor) {
                Some(next) if next > cursor => cursor = next,
                _ => break,
            }
        }
        runs
    }

    /// Most recent fire instant at or before `at`.
    pub fn previous_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut lookback = Duration::days(1);
        let max = Duration::days(MAX_LOOKBACK_DAYS);
        loop {
            let mut last = None;
            let mut cursor = self.next_from(at - lookback);
            while let Some(t) = cursor {
                if t > at {
                    break;
                }
                last = Some(t);
                cursor = self.next_after(t).filter(|n| *n > t);
            }
            if last.is_some() || lookback >= max {
                return last;
            }
            lookback = (lookback * 4).min(max);
        }
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| TaskdeckError::validation(format!("Unknown timezone: '{name}'")))
}

fn parse_expression(expression: &str) -> Result<Cron> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(TaskdeckError::validation(format!(
            "Invalid cron expression '{expression}': need 5 fields (MIN HOUR DOM MON DOW), got {fields}"
        )));
    }
    Cron::new(expression.trim())
        .parse()
        .map_err(|e| TaskdeckError::validation(format!("Invalid cron expression '{expression}': {e}")))
}

/// Whether `expression` is a valid 5-field cron expression.
pub fn validate_expression(expression: &str) -> bool {
    match parse_expression(expression) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("{e}");
            false
        }
    }
}

/// `[start, end)` of a calendar day in `tz`, `offset_days` after the day containing `now`.
pub fn day_window(tz: Tz, now: DateTime<Utc>, offset_days: i64) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let today = now.with_timezone(&tz).date_naive();
    let day = today.checked_add_signed(Duration::days(offset_days))?;
    let start = local_midnight(tz, day)?;
    let end = local_midnight(tz, day.succ_opt()?)?;
    Some((start, end))
}

fn local_midnight(tz: Tz, day: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = day.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Human-readable label for common expressions; falls back to the raw expression.
pub fn describe_expression(expression: &str) -> String {
    let label = match expression.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
        "* * * * *" => "Every minute",
        "*/5 * * * *" => "Every 5 minutes",
        "*/15 * * * *" => "Every 15 minutes",
        "*/30 * * * *" => "Every 30 minutes",
        "0 * * * *" => "Hourly",
        "0 */6 * * *" => "Every 6 hours",
        "0 0 * * *" => "Daily at midnight",
        "0 2 * * *" => "Daily at 02:00",
        "0 3 * * *" => "Daily at 03:00",
        "0 4 * * *" => "Daily at 04:00",
        "0 9 * * *" => "Daily at 09:00",
        "0 9 * * 1" => "Mondays at 09:00",
        "0 0 * * 0" => "Sundays at midnight",
        "0 0 1 * *" => "Monthly on the 1st",
        _ => return expression.to_string(),
    };
    label.to_string()
}
