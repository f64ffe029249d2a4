use chrono::{DateTime, Datelike, Days, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;
use tracing::warn;

use crate::config::ScheduleConfig;

/// Wall-clock admission in a fixed reference zone.
///
/// Two independent checks: a probabilistic work-window filter and a hard
/// safe-hour gate. Both fail open when the zone cannot be resolved.
#[derive(Debug, Clone)]
pub struct TimeWindowGate {
    tz: Option<Tz>,
    config: ScheduleConfig,
}

impl TimeWindowGate {
    pub fn new(config: ScheduleConfig) -> Self {
        let tz = match config.timezone.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(e) => {
                warn!(
                    timezone = %config.timezone,
                    "Unknown time zone ({}); time gates will admit everything",
                    e
                );
                None
            }
        };
        Self { tz, config }
    }

    pub fn timezone(&self) -> Option<Tz> {
        self.tz
    }

    /// Format a UTC instant in the reference zone (UTC when unresolved)
    pub fn format_local(&self, at: DateTime<Utc>, fmt: &str) -> String {
        match self.tz {
            Some(tz) => at.with_timezone(&tz).format(fmt).to_string(),
            None => at.format(fmt).to_string(),
        }
    }

    pub fn is_admissible(&self, now: DateTime<Utc>) -> bool {
        self.is_admissible_with(now, &mut rand::rng())
    }

    pub fn is_admissible_with<R: Rng + ?Sized>(&self, now: DateTime<Utc>, rng: &mut R) -> bool {
        let Some(tz) = self.tz else {
            return true;
        };
        let local = now.with_timezone(&tz);

        if !self.in_work_hours(local.hour()) {
            return rng.random_bool(self.config.off_hours_probability);
        }
        if is_weekend(local.weekday()) {
            return rng.random_bool(self.config.weekend_probability);
        }
        true
    }

    /// Hard gate: no randomness
    pub fn is_safe_hour(&self, now: DateTime<Utc>) -> bool {
        let Some(tz) = self.tz else {
            return true;
        };
        let hour = now.with_timezone(&tz).hour();
        (self.config.safe_start_hour..self.config.safe_end_hour).contains(&hour)
    }

    /// Deterministic part of the work window, used by the resume monitor
    pub fn is_work_hour(&self, now: DateTime<Utc>) -> bool {
        let Some(tz) = self.tz else {
            return true;
        };
        self.in_work_hours(now.with_timezone(&tz).hour())
    }

    /// Next occurrence of the work-window start strictly after `now`.
    /// Falls back to one hour from now when the local time cannot be built.
    pub fn next_work_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let fallback = now + chrono::Duration::hours(1);
        let Some(tz) = self.tz else {
            return fallback;
        };
        let local = now.with_timezone(&tz);
        let day = if local.hour() < self.config.work_start_hour {
            Some(local.date_naive())
        } else {
            local.date_naive().checked_add_days(Days::new(1))
        };

        day.and_then(|d| d.and_hms_opt(self.config.work_start_hour, 0, 0))
            .and_then(|naive| tz.from_local_datetime(&naive).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(fallback)
    }

    fn in_work_hours(&self, hour: u32) -> bool {
        (self.config.work_start_hour..self.config.work_end_hour).contains(&hour)
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}
