//! Durable scheduled callbacks (§4.3): one-shot delay, absolute time, and
//! recurring cron, persisted per-agent and re-armed across restarts.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use cron::Schedule as CronSchedule;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::store::{AgentStore, ScheduleKind, StoredSchedule};

/// The three ways a caller may express "when" a callback should fire.
#[derive(Clone, Debug)]
pub enum ScheduleWhen {
    DelaySeconds(i64),
    AbsoluteTimestamp(i64),
    Cron(String),
}

/// `cron::Schedule::from_str` only accepts 6- or 7-field expressions
/// (seconds mandatory); spec'd schedules are standard 5-field with seconds
/// optional, so a bare 5-field expression gets a leading `"0"` seconds
/// field prepended before parsing.
fn normalize_cron_expr(expr: &str) -> String {
    match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        _ => expr.to_string(),
    }
}

fn next_cron_fire(expr: &str, after: i64) -> Result<i64, SchedulerError> {
    let normalized = normalize_cron_expr(expr);
    let schedule = CronSchedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;
    let after_dt = Utc
        .timestamp_opt(after, 0)
        .single()
        .ok_or_else(|| SchedulerError::InvalidCron("out of range timestamp".into()))?;
    schedule
        .after(&after_dt)
        .next()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| SchedulerError::InvalidCron("cron expression never fires".into()))
}

/// Thin wrapper over an [`AgentStore`] implementing the scheduling
/// operations the actor exposes. Kept separate from [`AgentStore`] itself
/// so the firing algorithm (cron advance, validation) lives in one place
/// rather than smeared across the persistence layer.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Option<AgentStore>,
}

impl SchedulerHandle {
    pub fn new(store: AgentStore) -> Self {
        Self { store: Some(store) }
    }

    /// A handle with no backing store, for tests that exercise an
    /// [`crate::actor::ActorContext`] without caring about scheduling.
    pub fn new_detached() -> Self {
        Self { store: None }
    }

    fn store(&self) -> Result<&AgentStore, SchedulerError> {
        self.store
            .as_ref()
            .ok_or_else(|| SchedulerError::Store(crate::error::StoreError::Storage(
                "scheduler handle has no backing store".into(),
            )))
    }

    /// Validates the expression / computes the first fire time and
    /// persists the row. Invalid cron expressions fail synchronously,
    /// before any row is written (§4.3).
    pub async fn schedule(
        &self,
        when: ScheduleWhen,
        method: &str,
        payload: serde_json::Value,
        now: i64,
    ) -> Result<StoredSchedule, SchedulerError> {
        let (kind, time, delay_secs, cron) = match &when {
            ScheduleWhen::DelaySeconds(secs) => (ScheduleKind::Delay, now + secs, Some(*secs), None),
            ScheduleWhen::AbsoluteTimestamp(ts) => (ScheduleKind::Instant, *ts, None, None),
            ScheduleWhen::Cron(expr) => {
                let next = next_cron_fire(expr, now)?;
                (ScheduleKind::Cron, next, None, Some(expr.clone()))
            }
        };
        let row = StoredSchedule {
            id: Uuid::new_v4().to_string(),
            payload,
            callback_method: method.to_string(),
            kind,
            time,
            delay_secs,
            cron,
            created_at: now,
        };
        self.store()?.insert_schedule(row.clone()).await?;
        Ok(row)
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<StoredSchedule>, SchedulerError> {
        Ok(self.store()?.get_schedule(id).await?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<StoredSchedule>, SchedulerError> {
        Ok(self.store()?.list_schedules().await?)
    }

    /// Returns `true` if a row was cancelled, `false` if it was already
    /// gone (testable property: `cancel(t); cancel(t)` → true, then false).
    pub async fn cancel_schedule(&self, id: &str) -> Result<bool, SchedulerError> {
        let existed = self.get_schedule(id).await?.is_some();
        if existed {
            self.store()?.delete_schedule(id).await?;
        }
        Ok(existed)
    }

    /// The deadline to arm the actor's single wakeup for, or `None` if no
    /// schedules are pending.
    pub async fn earliest_deadline(&self) -> Result<Option<i64>, SchedulerError> {
        Ok(self.store()?.earliest_schedule_time().await?)
    }

    /// Pops every row whose `time <= now`, in `time ASC, id ASC` order
    /// (the actor drains them one wakeup at a time, §3.3/§5). Cron rows
    /// are advanced to their next fire and kept; one-shot rows are
    /// deleted. Returns the rows the caller must now invoke.
    pub async fn drain_due(&self, now: i64) -> Result<Vec<StoredSchedule>, SchedulerError> {
        let all = self.list_schedules().await?;
        let mut due = Vec::new();
        for row in all {
            if row.time > now {
                break;
            }
            match row.kind {
                ScheduleKind::Cron => {
                    let expr = row.cron.clone().unwrap_or_default();
                    match next_cron_fire(&expr, now) {
                        Ok(next) => {
                            self.store()?.reschedule_cron(&row.id, next).await?;
                        }
                        Err(e) => {
                            tracing::warn!(schedule_id = %row.id, error = %e, "dropping cron schedule with invalid expression");
                            self.store()?.delete_schedule(&row.id).await?;
                        }
                    }
                }
                ScheduleKind::Delay | ScheduleKind::Instant => {
                    self.store()?.delete_schedule(&row.id).await?;
                }
            }
            due.push(row);
        }
        Ok(due)
    }
}
