// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable scheduling.
//!
//! Jobs are rows in the instance store; a single alarm holds the next wake
//! time. On wake the due jobs run one after another. Each job is claimed
//! (flagged running) right before its own callback is invoked, then
//! rescheduled (recurring kinds) or deleted (one-shot kinds).
//!
//! The claim is a conditional update: a job still flagged running is skipped,
//! unless the flag is older than the stale threshold or has no start stamp.
//! Such a flag is a leftover from a crashed run and is taken over so the job
//! runs again. A wake that overlaps another one cannot claim a job the other
//! already holds. The alarm also covers stale deadlines, so a crashed job is
//! revisited even if nothing else is due.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::Agent;
use crate::callable::CallContext;
use crate::error::CoreError;
use crate::instance::Instance;
use crate::persistence::{ListSchedulesFilter, ScheduleKind, ScheduleRecord};

/// When a job should run.
#[derive(Debug, Clone, PartialEq)]
pub enum When {
    /// Once, at a fixed time.
    At(DateTime<Utc>),
    /// Once, after a delay.
    Delay(Duration),
    /// Repeatedly, per a cron expression (UTC).
    Cron(String),
    /// Repeatedly, every interval.
    Interval(Duration),
}

fn parse_cron(expr: &str) -> Result<Cron, CoreError> {
    Cron::new(expr).parse().map_err(|e| CoreError::InvalidSchedule {
        reason: format!("invalid cron expression '{}': {}", expr, e),
    })
}

fn next_cron_time(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
    parse_cron(expr)?
        .find_next_occurrence(&after, false)
        .map_err(|e| CoreError::InvalidSchedule {
            reason: format!("cron expression '{}' has no next occurrence: {}", expr, e),
        })
}

fn seconds(duration: Duration, what: &str) -> Result<i64, CoreError> {
    let secs = i64::try_from(duration.as_secs()).map_err(|_| CoreError::InvalidSchedule {
        reason: format!("{} is too large", what),
    })?;
    Ok(secs)
}

/// `from + secs`, or `InvalidSchedule` when the result is not representable.
fn after_seconds(from: DateTime<Utc>, secs: i64, what: &str) -> Result<DateTime<Utc>, CoreError> {
    chrono::Duration::try_seconds(secs)
        .and_then(|offset| from.checked_add_signed(offset))
        .ok_or_else(|| CoreError::InvalidSchedule {
            reason: format!("{} of {}s is out of range", what, secs),
        })
}

impl<A: Agent> Instance<A> {
    /// Schedule `callback` to be invoked with `payload`.
    ///
    /// The callback must name a plain method of the agent (callable or
    /// internal); streaming methods cannot be scheduled.
    #[instrument(skip(self, payload), fields(instance = %self.name()))]
    pub async fn schedule(
        &self,
        when: When,
        callback: &str,
        payload: Value,
    ) -> Result<ScheduleRecord, CoreError> {
        if !self.methods().contains(callback) {
            return Err(CoreError::UnknownCallback {
                callback: callback.to_string(),
            });
        }
        if self.methods().is_streaming(callback) {
            return Err(CoreError::InvalidSchedule {
                reason: format!("streaming method '{}' cannot be scheduled", callback),
            });
        }

        let now = Utc::now();
        let mut record = ScheduleRecord {
            id: uuid::Uuid::new_v4().to_string(),
            callback: callback.to_string(),
            payload,
            kind: ScheduleKind::Scheduled,
            time: now,
            delay_seconds: None,
            cron: None,
            interval_seconds: None,
            running: false,
            execution_started_at: None,
            created_at: now,
        };

        match when {
            When::At(time) => {
                record.time = time;
            }
            When::Delay(delay) => {
                let secs = seconds(delay, "delay")?;
                record.kind = ScheduleKind::Delayed;
                record.delay_seconds = Some(secs);
                record.time = after_seconds(now, secs, "delay")?;
            }
            When::Cron(expr) => {
                record.kind = ScheduleKind::Cron;
                record.time = next_cron_time(&expr, now)?;
                record.cron = Some(expr);
            }
            When::Interval(interval) => {
                let secs = seconds(interval, "interval")?;
                if secs < 1 {
                    return Err(CoreError::InvalidSchedule {
                        reason: "interval must be at least one second".to_string(),
                    });
                }
                record.kind = ScheduleKind::Interval;
                record.interval_seconds = Some(secs);
                record.time = after_seconds(now, secs, "interval")?;
            }
        }

        self.persistence.insert_schedule(&record).await?;
        info!(schedule_id = %record.id, kind = %record.kind, time = %record.time, "Job scheduled");

        self.rearm().await?;
        Ok(record)
    }

    /// Remove a job. Returns false if it did not exist.
    pub async fn cancel_schedule(&self, id: &str) -> Result<bool, CoreError> {
        let removed = self.persistence.delete_schedule(id).await?;
        if removed {
            debug!(instance = %self.name(), schedule_id = id, "Job cancelled");
            self.rearm().await?;
        }
        Ok(removed)
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>, CoreError> {
        self.persistence.get_schedule(id).await
    }

    pub async fn list_schedules(
        &self,
        filter: &ListSchedulesFilter,
    ) -> Result<Vec<ScheduleRecord>, CoreError> {
        self.persistence.list_schedules(filter).await
    }

    /// Currently armed wake time.
    pub fn next_alarm(&self) -> Option<DateTime<Utc>> {
        *self.alarm.borrow()
    }

    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.schedule_stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Recompute and persist the next wake time from the stored jobs.
    pub(crate) async fn rearm(&self) -> Result<(), CoreError> {
        let jobs = self
            .persistence
            .list_schedules(&ListSchedulesFilter::default())
            .await?;
        let stale_after = self.stale_after();
        let now = Utc::now();

        let next = jobs
            .iter()
            .map(|job| {
                if job.running {
                    job.execution_started_at
                        .map(|started| {
                            started
                                .checked_add_signed(stale_after)
                                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                        })
                        .unwrap_or(now)
                } else {
                    job.time
                }
            })
            .min();

        self.persistence.set_alarm(next).await?;
        self.alarm.send_replace(next);
        debug!(instance = %self.name(), next = ?next, "Alarm armed");
        Ok(())
    }

    /// Run every due job, then re-arm.
    #[instrument(skip(self), fields(instance = %self.name()))]
    pub async fn alarm(self: &Arc<Self>) {
        let due = match self.persistence.due_schedules(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to load due jobs");
                if let Err(e) = self.rearm().await {
                    error!(error = %e, "Failed to re-arm alarm");
                }
                return;
            }
        };

        let stale_after = self.stale_after();
        for job in due {
            // Claimed just before it runs, so a job waiting behind a slow one
            // never carries a start stamp that could turn stale meanwhile.
            let now = Utc::now();
            let stale_before = now
                .checked_sub_signed(stale_after)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            match self
                .persistence
                .claim_schedule(&job.id, now, stale_before)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(schedule_id = %job.id, "Job running elsewhere or no longer due, skipping");
                    continue;
                }
                Err(e) => {
                    error!(schedule_id = %job.id, error = %e, "Failed to claim job");
                    continue;
                }
            }

            if job.running {
                let recovered = CoreError::StaleJobLock {
                    schedule_id: job.id.clone(),
                };
                info!(error = %recovered, started_at = ?job.execution_started_at, "Took over stale running flag");
            }
            self.run_job(job).await;
        }

        if let Err(e) = self.rearm().await {
            error!(error = %e, "Failed to re-arm alarm");
        }
    }

    async fn run_job(self: &Arc<Self>, job: ScheduleRecord) {
        let snapshot = serde_json::to_value(&job).unwrap_or(Value::Null);
        let ctx = CallContext::server(self.clone());

        let outcome = match self
            .methods()
            .invoke_internal(&job.callback, ctx, vec![job.payload.clone(), snapshot])
        {
            Ok(call) => match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(anyhow::anyhow!("scheduled callback '{}' panicked", job.callback)),
            },
            Err(e) => Err(e.into()),
        };

        match &outcome {
            Ok(()) => debug!(schedule_id = %job.id, callback = %job.callback, "Job completed"),
            Err(e) => {
                warn!(schedule_id = %job.id, callback = %job.callback, error = %e, "Job failed");
                self.agent().on_error(e);
            }
        }

        let finished = if job.kind.is_recurring() {
            match self.next_occurrence(&job) {
                Ok(next) => self.persistence.reset_schedule(&job.id, Some(next)).await,
                Err(e) => {
                    error!(schedule_id = %job.id, error = %e, "Dropping job without a next run");
                    self.persistence.delete_schedule(&job.id).await.map(|_| ())
                }
            }
        } else {
            self.persistence.delete_schedule(&job.id).await.map(|_| ())
        };
        if let Err(e) = finished {
            error!(schedule_id = %job.id, error = %e, "Failed to finish job");
        }
    }

    fn next_occurrence(&self, job: &ScheduleRecord) -> Result<DateTime<Utc>, CoreError> {
        let now = Utc::now();
        match job.kind {
            ScheduleKind::Interval => {
                let secs = job.interval_seconds.ok_or_else(|| CoreError::InvalidSchedule {
                    reason: "interval job without interval".to_string(),
                })?;
                after_seconds(now, secs, "interval")
            }
            ScheduleKind::Cron => {
                let expr = job.cron.as_deref().ok_or_else(|| CoreError::InvalidSchedule {
                    reason: "cron job without expression".to_string(),
                })?;
                next_cron_time(expr, now)
            }
            other => Err(CoreError::InvalidSchedule {
                reason: format!("{} jobs do not recur", other),
            }),
        }
    }
}

impl FromStr for When {
    type Err = CoreError;

    /// Parse `at:<rfc3339>`, `delay:<secs>`, `cron:<expr>` or `every:<secs>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| CoreError::InvalidSchedule { reason };
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid(format!("malformed schedule '{}'", s)))?;
        let secs = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| invalid(format!("'{}' is not a number of seconds", v)))
        };

        match kind {
            "at" => DateTime::parse_from_rfc3339(rest.trim())
                .map(|t| When::At(t.with_timezone(&Utc)))
                .map_err(|e| invalid(format!("bad timestamp '{}': {}", rest, e))),
            "delay" => secs(rest).map(When::Delay),
            "cron" => {
                parse_cron(rest.trim())?;
                Ok(When::Cron(rest.trim().to_string()))
            }
            "every" => secs(rest).map(When::Interval),
            other => Err(invalid(format!("unknown schedule kind '{}'", other))),
        }
    }
}
