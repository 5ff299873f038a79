use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

pub const DEFAULT_BOUNDARY_HOUR: u32 = 6;

// Schedulers fire a few minutes late (or early) around the boundary; ticks inside this
// window after the boundary finalize the outgoing day before sampling.
pub const DEFAULT_GRACE_MINUTES: u32 = 90;

/// Maps instants to service days: the day starts at `boundary_hour` local time, not midnight.
pub fn resolve_service_day(instant: DateTime<Utc>, tz: Tz, boundary_hour: u32) -> NaiveDate {
    let local = instant.with_timezone(&tz);
    let date = local.date_naive();
    if local.hour() < boundary_hour {
        date - Duration::days(1)
    } else {
        date
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceClock {
    pub tz: Tz,
    pub boundary_hour: u32,
    pub grace_minutes: u32,
}

impl ServiceClock {
    pub fn new(tz: Tz, boundary_hour: u32, grace_minutes: u32) -> Self {
        Self {
            tz,
            boundary_hour,
            grace_minutes,
        }
    }

    pub fn from_config(cfg: &crate::config::PipelineConfig) -> Self {
        Self::new(cfg.timezone, cfg.boundary_hour, cfg.grace_minutes)
    }

    pub fn service_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        resolve_service_day(instant, self.tz, self.boundary_hour)
    }

    /// The day the finalizer should close when invoked at `instant`.
    pub fn previous_service_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.service_day(instant) - Duration::days(1)
    }

    /// True while `instant` sits in `[boundary, boundary + grace)` local time.
    pub fn in_grace_window(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.tz);
        let minute_of_day = local.hour() * 60 + local.minute();
        let start = self.boundary_hour * 60;
        minute_of_day >= start && minute_of_day < start + self.grace_minutes
    }

    /// Parses an explicit `YYYY-MM-DD` date, else falls back to `default`.
    pub fn resolve_date_arg(
        date_arg: Option<&str>,
        default: NaiveDate,
    ) -> anyhow::Result<NaiveDate> {
        match date_arg.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Ok(NaiveDate::parse_from_str(s, "%Y-%m-%d")?),
            None => Ok(default),
        }
    }
}

impl Default for ServiceClock {
    fn default() -> Self {
        Self::new(Tz::UTC, DEFAULT_BOUNDARY_HOUR, DEFAULT_GRACE_MINUTES)
    }
}
