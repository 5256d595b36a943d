//! The `cf_agents_schedules` table backing the scheduler (§4.3).

use rusqlite::params;

use crate::error::StoreError;
use crate::store::AgentStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleKind {
    Delay,
    Instant,
    Cron,
}

impl ScheduleKind {
    fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Delay => "delay",
            ScheduleKind::Instant => "instant",
            ScheduleKind::Cron => "cron",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "delay" => Ok(ScheduleKind::Delay),
            "instant" => Ok(ScheduleKind::Instant),
            "cron" => Ok(ScheduleKind::Cron),
            other => Err(StoreError::Storage(format!("unknown schedule kind {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredSchedule {
    pub id: String,
    pub payload: serde_json::Value,
    pub callback_method: String,
    pub kind: ScheduleKind,
    pub time: i64,
    pub delay_secs: Option<i64>,
    pub cron: Option<String>,
    pub created_at: i64,
}

fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<(
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<String>,
    i64,
)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

impl AgentStore {
    pub async fn insert_schedule(&self, schedule: StoredSchedule) -> Result<(), StoreError> {
        let payload_text = serde_json::to_string(&schedule.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sql(move |conn| {
            conn.execute(
                "INSERT INTO cf_agents_schedules
                 (id, payload, callback_method, kind, time, delay_secs, cron, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    schedule.id,
                    payload_text,
                    schedule.callback_method,
                    schedule.kind.as_str(),
                    schedule.time,
                    schedule.delay_secs,
                    schedule.cron,
                    schedule.created_at,
                ],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<StoredSchedule>, StoreError> {
        let id = id.to_string();
        self.sql(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, payload, callback_method, kind, time, delay_secs, cron, created_at
                     FROM cf_agents_schedules WHERE id = ?1",
                    params![id],
                    row_to_schedule,
                )
                .ok();
            row.map(to_stored).transpose()
        })
        .await
    }

    /// Lists all schedules ordered by next fire time — the order the
    /// scheduler drains due rows in within one wakeup (time ASC, id ASC).
    pub async fn list_schedules(&self) -> Result<Vec<StoredSchedule>, StoreError> {
        self.sql(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, payload, callback_method, kind, time, delay_secs, cron, created_at
                     FROM cf_agents_schedules ORDER BY time ASC, id ASC",
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], row_to_schedule)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(to_stored(row.map_err(|e| StoreError::Storage(e.to_string()))?)?);
            }
            Ok(out)
        })
        .await
    }

    /// Earliest future (or due) fire time across every row, used to arm the
    /// single scheduler wakeup.
    pub async fn earliest_schedule_time(&self) -> Result<Option<i64>, StoreError> {
        self.sql(|conn| {
            conn.query_row("SELECT MIN(time) FROM cf_agents_schedules", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map_err(|e| StoreError::Storage(e.to_string()))
        })
        .await
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.sql(move |conn| {
            conn.execute("DELETE FROM cf_agents_schedules WHERE id = ?1", params![id])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// Advances a cron row's `time` to its next fire, in place.
    pub async fn reschedule_cron(&self, id: &str, next_time: i64) -> Result<(), StoreError> {
        let id = id.to_string();
        self.sql(move |conn| {
            conn.execute(
                "UPDATE cf_agents_schedules SET time = ?1 WHERE id = ?2",
                params![next_time, id],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

fn to_stored(
    row: (String, String, String, String, i64, Option<i64>, Option<String>, i64),
) -> Result<StoredSchedule, StoreError> {
    let (id, payload_text, callback_method, kind, time, delay_secs, cron, created_at) = row;
    let payload = serde_json::from_str(&payload_text)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(StoredSchedule {
        id,
        payload,
        callback_method,
        kind: ScheduleKind::parse(&kind)?,
        time,
        delay_secs,
        cron,
        created_at,
    })
}
