//! Cron schedules and a small scheduler driving them.
//!
//! Accepted expressions:
//! - five fields, `min hour dom month dow`
//! - six fields with a leading seconds field
//! - descriptors such as `@daily` or `@hourly`
//! - `@every <duration>`, first firing one interval after the scheduler starts
//!
//! Times are evaluated in the local timezone.

use crate::config::parse_duration;
use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A parsed schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let invalid = |reason: String| Error::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        if let Some(interval) = expr.strip_prefix("@every") {
            let interval = parse_duration(interval.trim()).map_err(|e| invalid(e.to_string()))?;
            if interval.is_zero() {
                return Err(invalid("interval must be positive".to_string()));
            }
            return Ok(Schedule::Every(interval));
        }

        let normalized = normalize(expr).map_err(invalid)?;
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Schedule::Cron(Box::new(schedule)))
    }

    /// First firing time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(after).next(),
            Schedule::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|interval| after.checked_add_signed(interval)),
        }
    }
}

/// Rewrite `expr` into the six-field form the cron crate parses.
fn normalize(expr: &str) -> std::result::Result<String, String> {
    if expr.starts_with('@') {
        let fields = match expr {
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            "@monthly" => "0 0 0 1 * *",
            "@weekly" => "0 0 0 * * 1",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@hourly" => "0 0 * * * *",
            _ => return Err(format!("unknown descriptor {}", expr)),
        };
        return Ok(fields.to_string());
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            shift_weekdays(fields[4])
        )),
        6 => Ok(format!(
            "{} {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            fields[4],
            shift_weekdays(fields[5])
        )),
        n => Err(format!("expected 5 or 6 fields, found {}", n)),
    }
}

/// Map numeric weekdays from 0-7 (Sunday is 0 and 7) to 1-7 (Sunday is 1).
/// Step values after `/` are left alone. A range ending in 7 would wrap, so it
/// is spelled out as a list.
fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (part, None),
            };
            if let Some(days) = expand_to_sunday(base, step) {
                return days;
            }
            let base = base
                .split('-')
                .map(|day| match day.parse::<u32>() {
                    Ok(n) => shift_weekday(n),
                    Err(_) => day.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", base, step),
                None => base,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday(day: u32) -> String {
    ((day % 7) + 1).to_string()
}

/// `N-7` or `N-7/S` as a shifted list, `None` for anything else.
fn expand_to_sunday(base: &str, step: Option<&str>) -> Option<String> {
    let (start, end) = base.split_once('-')?;
    let start: u32 = start.parse().ok()?;
    if end.parse::<u32>().ok()? != 7 || start > 7 {
        return None;
    }
    let step: usize = match step {
        Some(step) => step.parse::<usize>().ok().filter(|&s| s > 0)?,
        None => 1,
    };
    let days: Vec<String> = (start..=7).step_by(step).map(shift_weekday).collect();
    Some(days.join(","))
}

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    schedule: Arc<Schedule>,
    func: JobFn,
}

/// Fires registered jobs on their schedules.
///
/// Each job gets its own task. A job never overlaps itself: the next firing
/// time is computed once the previous run has finished.
pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
    tasks: Mutex<JoinSet<()>>,
    stop: CancellationToken,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            stop: CancellationToken::new(),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job, it starts firing on [`Scheduler::start`].
    pub fn add<F>(&self, schedule: Arc<Schedule>, func: F)
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.jobs().push(Job {
            schedule,
            func: Arc::new(func),
        });
    }

    pub fn start(&self) {
        let jobs: Vec<Job> = self.jobs().drain(..).collect();
        let mut tasks = self.tasks();
        for job in jobs {
            tasks.spawn(run_job(job, self.stop.clone()));
        }
    }

    /// Stop firing and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        self.stop.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                debug!(error = %e, "scheduled job task failed");
            }
        }
    }
}

async fn run_job(job: Job, stop: CancellationToken) {
    let mut last = Local::now();
    loop {
        let Some(next) = job.schedule.next_after(&last) else {
            return;
        };
        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.cancelled() => return,
        }

        (job.func)().await;
        last = next.max(Local::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 6, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_five_fields() {
        let schedule = Schedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(&at(10, 7, 30)).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 15, 0));
    }

    #[test]
    fn test_parse_six_fields() {
        let schedule = Schedule::parse("30 0 12 * * *").unwrap();
        let next = schedule.next_after(&at(10, 0, 0)).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (12, 0, 30));
    }

    #[test]
    fn test_parse_weekdays() {
        // 2024-03-06 is a Wednesday
        let schedule = Schedule::parse("0 9 * * 0").unwrap();
        let next = schedule.next_after(&at(10, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Sun);
        assert_eq!(next.day(), 10);

        let schedule = Schedule::parse("0 9 * * 1-5").unwrap();
        let next = schedule.next_after(&at(10, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Thu);
    }

    #[test]
    fn test_shift_weekdays() {
        assert_eq!(shift_weekdays("*"), "*");
        assert_eq!(shift_weekdays("0,6"), "1,7");
        assert_eq!(shift_weekdays("7"), "1");
        assert_eq!(shift_weekdays("1-5/2"), "2-6/2");
        assert_eq!(shift_weekdays("*/2"), "*/2");
        assert_eq!(shift_weekdays("MON-FRI"), "MON-FRI");
        assert_eq!(shift_weekdays("5-7"), "6,7,1");
        assert_eq!(shift_weekdays("1-7/2"), "2,4,6,1");
        assert_eq!(shift_weekdays("0-7/3"), "1,4,7");
    }

    #[test]
    fn test_parse_weekday_range_to_sunday() {
        // 2024-03-06 is a Wednesday
        let schedule = Schedule::parse("0 9 * * 5-7").unwrap();
        let next = schedule.next_after(&at(10, 0, 0)).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Fri);

        let schedule = Schedule::parse("0 9 * * 6-7").unwrap();
        let days: Vec<_> = schedule
            .next_after(&at(10, 0, 0))
            .into_iter()
            .chain(schedule.next_after(&at(10, 0, 0).with_day(9).unwrap()))
            .map(|t| t.weekday())
            .collect();
        assert_eq!(days, vec![chrono::Weekday::Sat, chrono::Weekday::Sun]);

        assert!(Schedule::parse("0 9 * * 1-7").is_ok());
    }

    #[test]
    fn test_parse_descriptors() {
        let schedule = Schedule::parse("@hourly").unwrap();
        let next = schedule.next_after(&at(10, 7, 30)).unwrap();
        assert_eq!((next.hour(), next.minute()), (11, 0));

        let schedule = Schedule::parse("@midnight").unwrap();
        let next = schedule.next_after(&at(10, 7, 30)).unwrap();
        assert_eq!((next.day(), next.hour()), (7, 0));

        assert!(Schedule::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_parse_every() {
        let schedule = Schedule::parse("@every 2s").unwrap();
        let start = at(10, 0, 0);
        assert_eq!(schedule.next_after(&start).unwrap(), at(10, 0, 2));

        assert!(Schedule::parse("@every 0s").is_err());
        assert!(Schedule::parse("@every soon").is_err());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            Schedule::parse("* * *"),
            Err(Error::InvalidCron { .. })
        ));
        assert!(matches!(
            Schedule::parse("61 * * * *"),
            Err(Error::InvalidCron { .. })
        ));
    }

    #[tokio::test]
    async fn test_scheduler_fires_and_stops() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        scheduler.add(
            Arc::new(Schedule::Every(Duration::from_millis(200))),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            },
        );
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(700)).await;
        scheduler.stop().await;
        let fired = count.load(Ordering::SeqCst);
        assert_eq!(fired, 3);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_scheduler_stop_waits_for_running_job() {
        let scheduler = Scheduler::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&finished);
        scheduler.add(
            Arc::new(Schedule::Every(Duration::from_millis(100))),
            move || {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            },
        );
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
