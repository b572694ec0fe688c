//! Cron scheduler
//!
//! Each tick enqueues one job for every recurring task whose next fire time
//! has passed, then recomputes the next fire time from the tick time, so
//! missed ticks are never caught up. The scheduler never runs task bodies
//! itself. Every tick also fails started jobs whose worker stopped
//! heartbeating.
//!
//! Several scheduler processes may be started against one broker. Only the
//! holder of the `scheduler` lease enqueues or sweeps; the others keep their
//! fire times current and take over once the lease expires.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::error::{WorkerError, WorkerResult};
use crate::events::{EventChannel, JobEvent};
use crate::queue::{sweep_stale_jobs, Broker, EnqueueRequest, Enqueued, JobId};
use crate::registry::{TaskKind, TaskRegistry};

const LEASE_NAME: &str = "scheduler";

/// Lease lifetime when none is configured
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(90);

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parsed cron expression.
///
/// Accepts the classic five-field crontab form (`min hour dom mon dow`, with
/// Sunday as 0 or 7) as well as the six and seven field forms with seconds
/// and year, which use the `cron` crate's own numbering (Sunday is 1).
/// Times are UTC.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> WorkerResult<Self> {
        let expression = expression.trim();
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let weekdays = crontab_weekdays(fields[4])
                    .map_err(|reason| WorkerError::invalid_cron(expression, reason))?;
                format!("0 {} {}", fields[..4].join(" "), weekdays)
            }
            6 | 7 => expression.to_string(),
            n => {
                return Err(WorkerError::invalid_cron(
                    expression,
                    format!("expected 5 to 7 fields, got {}", n),
                ))
            }
        };

        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| WorkerError::invalid_cron(expression, e.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// First fire time strictly after `from`
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl FromStr for CronSchedule {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Rewrite a crontab day-of-week field as day names
fn crontab_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, Some(step)),
                _ => return Err(format!("invalid step '{}'", step)),
            },
            None => (part, None),
        };

        let (start, end) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((start, end))) => (weekday(start)?, weekday(end)?),
            // `n/step` runs to the end of the week
            (_, None) if step.is_some() => (weekday(range)?, 6),
            (_, None) => {
                let day = weekday(range)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("day range '{}' runs backwards", range));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7);
        }
    }

    if days.len() == WEEKDAYS.len() {
        return Ok("*".to_string());
    }
    Ok(days
        .into_iter()
        .map(|day| WEEKDAYS[day])
        .collect::<Vec<_>>()
        .join(","))
}

fn weekday(raw: &str) -> Result<usize, String> {
    if let Some(day) = WEEKDAYS.iter().position(|name| name.eq_ignore_ascii_case(raw)) {
        return Ok(day);
    }
    match raw.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week '{}'", raw)),
    }
}

struct Entry {
    schedule: CronSchedule,
    next_fire: Option<DateTime<Utc>>,
}

/// Recurring task scheduler
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    events: EventChannel,
    stale_window: Duration,
    entries: BTreeMap<TaskKind, Entry>,
    holder: String,
    lease_ttl: Duration,
    /// `None` until the first lease attempt
    leader: Option<bool>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        events: EventChannel,
        stale_window: Duration,
    ) -> Self {
        Self {
            registry,
            broker,
            events,
            stale_window,
            entries: BTreeMap::new(),
            holder: uuid::Uuid::new_v4().to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
            leader: None,
        }
    }

    /// How long the lease outlives a tick that fails to renew it. Must be
    /// longer than the tick interval.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Whether the last tick ran as the lease holder
    pub fn is_leader(&self) -> bool {
        self.leader == Some(true)
    }

    /// Build cron entries for every recurring task.
    ///
    /// An invalid cron string is a startup error.
    pub fn init_at(&mut self, now: DateTime<Utc>) -> WorkerResult<()> {
        self.entries.clear();
        for task in self.registry.recurring() {
            let Some(schedule) = task.init()? else {
                continue;
            };
            let next_fire = schedule.next_after(now);
            tracing::info!(
                task = %task.kind,
                cron = %schedule,
                enabled_by_default = task.enabled_by_default(),
                next_fire = ?next_fire,
                "Scheduled recurring task"
            );
            self.entries.insert(task.kind, Entry { schedule, next_fire });
        }
        Ok(())
    }

    /// Next fire time of a task, if it is scheduled
    pub fn next_fire(&self, kind: TaskKind) -> Option<DateTime<Utc>> {
        self.entries.get(&kind).and_then(|entry| entry.next_fire)
    }

    /// Take or renew the lease, logging when leadership changes
    async fn hold_lease(&mut self) -> bool {
        let leader = match self
            .broker
            .acquire_lease(LEASE_NAME, &self.holder, self.lease_ttl)
            .await
        {
            Ok(leader) => leader,
            Err(e) => {
                e.log();
                false
            }
        };

        if self.leader != Some(leader) {
            if leader {
                tracing::info!(holder = %self.holder, "Acquired scheduler lease");
            } else {
                tracing::warn!(holder = %self.holder, "Another scheduler holds the lease, standing by");
            }
            self.leader = Some(leader);
        }
        leader
    }

    /// Give up the lease so a standby scheduler can take over at once
    pub async fn release(&mut self) {
        if self.is_leader() {
            match self.broker.release_lease(LEASE_NAME, &self.holder).await {
                Ok(()) => tracing::info!(holder = %self.holder, "Released scheduler lease"),
                Err(e) => e.log(),
            }
        }
        self.leader = None;
    }

    /// Enqueue every due task and sweep stale jobs; returns the new job ids.
    ///
    /// Without the lease, due slots are consumed and nothing is enqueued.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let leader = self.hold_lease().await;
        let mut enqueued = Vec::new();

        for (kind, entry) in self.entries.iter_mut() {
            let due = matches!(entry.next_fire, Some(next) if next <= now);
            if !due {
                continue;
            }
            entry.next_fire = entry.schedule.next_after(now);
            if !leader {
                continue;
            }

            let Some(task) = self.registry.get(*kind) else {
                continue;
            };
            let enabled = match task.is_enabled(self.broker.as_ref()).await {
                Ok(enabled) => enabled,
                Err(e) => {
                    e.log();
                    task.enabled_by_default()
                }
            };
            if !enabled {
                tracing::debug!(task = %kind, "Skipping disabled task");
                continue;
            }

            let request = EnqueueRequest::new(task.name(), task.priority).unique(!task.concurrent);
            match self.broker.enqueue(request).await {
                Ok(Enqueued::Queued(job)) => {
                    tracing::info!(
                        task = %kind,
                        job_id = %job.id,
                        priority = %job.priority,
                        next_fire = ?entry.next_fire,
                        "Enqueued scheduled job"
                    );
                    self.events.publish_job_event(&JobEvent::from(&job)).await;
                    enqueued.push(job.id);
                }
                Ok(Enqueued::AlreadyActive(active)) => {
                    tracing::info!(task = %kind, active_job = %active, "Previous run still active, skipping");
                }
                Err(e) => e.log(),
            }
        }

        if !leader {
            return enqueued;
        }
        match sweep_stale_jobs(self.broker.as_ref(), self.stale_window, now).await {
            Ok(swept) if !swept.is_empty() => {
                tracing::warn!(count = swept.len(), "Swept stale jobs");
            }
            Ok(_) => {}
            Err(e) => e.log(),
        }

        enqueued
    }

    /// Initialise and tick every `interval` until `cancel` fires
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) -> WorkerResult<()> {
        self.init_at(Utc::now())?;
        tracing::info!(tasks = self.entries.len(), interval_secs = interval.as_secs(), "Scheduler started");

        loop {
            self.tick(Utc::now()).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.release().await;
        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).unwrap()
    }

    #[rstest]
    #[case("0 3 * * *", at(2, 59, 30), at(3, 0, 0))]
    #[case("0 3 * * *", at(3, 0, 0), at(3, 0, 0) + chrono::Duration::days(1))]
    #[case("*/15 * * * *", at(3, 1, 0), at(3, 15, 0))]
    #[case("30 0 3 * * *", at(3, 0, 0), at(3, 0, 30))]
    // 2026-03-14 is a Saturday; crontab counts Sunday as 0 and 7
    #[case("0 3 * * 0", at(3, 0, 0), day(15, 3))]
    #[case("0 3 * * 7", at(3, 0, 0), day(15, 3))]
    #[case("* * * * 1", at(3, 0, 0), day(16, 0))]
    #[case("0 3 * * 1-5", at(3, 0, 0), day(16, 3))]
    #[case("0 3 * * 6", at(3, 0, 0), day(21, 3))]
    #[case("0 3 * * */2", at(3, 0, 0), day(15, 3))]
    #[case("0 3 * * sat,sun", at(3, 0, 0), day(15, 3))]
    #[case("0 3 * * 0-6", at(3, 0, 0), day(15, 3))]
    // Six-field strings keep the crate's numbering, where 1 is Sunday
    #[case("0 0 3 * * 1", at(3, 0, 0), day(15, 3))]
    fn test_next_after(#[case] expr: &str, #[case] from: DateTime<Utc>, #[case] expected: DateTime<Utc>) {
        let schedule = CronSchedule::parse(expr).unwrap();
        assert_eq!(schedule.next_after(from), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("* * *")]
    #[case("61 3 * * *")]
    #[case("0 3 * * * * * *")]
    #[case("0 3 * * 8")]
    #[case("0 3 * * 5-1")]
    #[case("0 3 * * */0")]
    #[case("0 3 * * funday")]
    fn test_invalid_expressions(#[case] expr: &str) {
        assert!(matches!(
            CronSchedule::parse(expr),
            Err(WorkerError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_keeps_original_expression() {
        let schedule: CronSchedule = " 0 3 * * * ".parse().unwrap();
        assert_eq!(schedule.expression(), "0 3 * * *");
        assert_eq!(schedule.to_string(), "0 3 * * *");
    }

    #[rstest]
    #[case("*", "*")]
    #[case("0", "SUN")]
    #[case("7", "SUN")]
    #[case("1-5", "MON,TUE,WED,THU,FRI")]
    #[case("5-7", "SUN,FRI,SAT")]
    #[case("mon,Wed,5", "MON,WED,FRI")]
    #[case("1/2", "MON,WED,FRI")]
    #[case("0-7", "*")]
    fn test_crontab_weekdays(#[case] field: &str, #[case] expected: &str) {
        assert_eq!(crontab_weekdays(field).unwrap(), expected);
    }
}
