// Background jobs that trigger the fetch and import cycles.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Europe::Berlin;
use tokio::time;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher;
use crate::importer;
use crate::rate_limiter::RateLimiter;

/// Cron-like trigger evaluated in operator local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// On the hour, every hour divisible by `n`.
    EveryHours(u32),
    DailyAt { hour: u32, minute: u32 },
}

impl Schedule {
    pub fn every_hours(n: u64) -> Result<Self> {
        if !(1..=24).contains(&n) {
            return Err(Error::Config(format!("hour interval must be within 1..=24, got {}", n)));
        }
        Ok(Schedule::EveryHours(n as u32))
    }

    /// Parses `HH:MM`.
    pub fn parse_daily(value: &str) -> Result<Self> {
        let time = NaiveTime::parse_from_str(value.trim(), "%H:%M")
            .map_err(|_| Error::Config(format!("expected HH:MM, got {:?}", value)))?;
        Ok(Schedule::DailyAt {
            hour: time.hour(),
            minute: time.minute(),
        })
    }

    /// First trigger strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Schedule::EveryHours(n) => {
                let top_of_hour = now
                    .date()
                    .and_hms_opt(now.hour(), 0, 0)
                    .unwrap_or(now);
                let mut next = top_of_hour + ChronoDuration::hours(1);
                while next.hour() % n != 0 {
                    next += ChronoDuration::hours(1);
                }
                next
            }
            Schedule::DailyAt { hour, minute } => {
                let today = now.date().and_hms_opt(hour, minute, 0).unwrap_or(now);
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
        }
    }
}

pub fn local_now() -> NaiveDateTime {
    Utc::now().with_timezone(&Berlin).naive_local()
}

pub fn spawn_jobs(config: Arc<Config>, limiter: Arc<RateLimiter>) {
    let fetch_config = config.clone();
    tokio::spawn(run_job("data_fetch", config.fetch_schedule, move || {
        fetcher::run_fetch_cycle(&fetch_config, limiter.clone())
            .map(|folder| format!("Data saved to {:?}", folder))
    }));

    let import_config = config.clone();
    tokio::spawn(run_job("data_import", config.import_schedule, move || {
        importer::run_import_cycle(&import_config).map(|dates| {
            if dates.is_empty() {
                "No new dates to process".to_string()
            } else {
                let dates: Vec<String> = dates.iter().map(|d| d.to_string()).collect();
                format!("Processed dates: {}", dates.join(", "))
            }
        })
    }));
}

async fn run_job<F>(name: &'static str, schedule: Schedule, job: F)
where
    F: Fn() -> Result<String> + Send + Sync + 'static,
{
    let job = Arc::new(job);
    loop {
        let now = local_now();
        let next = schedule.next_after(now);
        tracing::info!("{} scheduled for {}", name, next);
        let wait = (next - now).to_std().unwrap_or_default();
        time::sleep(wait).await;

        tracing::info!("Starting scheduled {}...", name);
        let job = job.clone();
        match tokio::task::spawn_blocking(move || (*job)()).await {
            Ok(Ok(summary)) => tracing::info!("{} completed. {}", name, summary),
            Ok(Err(e)) => tracing::error!("{} failed: {}", name, e),
            Err(e) => tracing::error!("{} task panicked: {}", name, e),
        }
    }
}
