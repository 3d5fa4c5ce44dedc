use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::error::ItemError;
use super::model::SyncMode;
use super::store::{self, MirrorStore, StoreError};
use super::timestamp;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unknown task status {0:?}")]
    InvalidStatus(String),
    #[error("unknown task type {0:?}")]
    InvalidTaskType(String),
    #[error("stored task id is not a uuid: {0}")]
    InvalidUuid(#[from] uuid::Error),
    #[error("task {0} was already finalized")]
    AlreadyFinalized(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, TrackerError> {
        match value {
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TrackerError::InvalidStatus(other.to_string())),
        }
    }
}

/// One persisted engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_uuid: Uuid,
    pub project_id: String,
    pub task_type: SyncMode,
    pub task_status: TaskStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub duration_seconds: Option<f64>,
    pub folders_synced: u64,
    pub files_synced: u64,
    pub versions_synced: u64,
    pub attrs_synced: u64,
    pub error_message: Option<String>,
    pub errors: Vec<ItemError>,
    pub performance_stats: Value,
    pub parameters: Value,
}

/// Counters written when a task finishes, successfully or not.
#[derive(Debug, Clone, Default)]
pub struct TaskSummary {
    pub folders_synced: u64,
    pub files_synced: u64,
    pub versions_synced: u64,
    pub attrs_synced: u64,
    pub errors: Vec<ItemError>,
    pub performance_stats: Value,
}

#[derive(Clone)]
pub struct TaskTracker {
    store: MirrorStore,
}

impl TaskTracker {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    pub async fn start(
        &self,
        project_id: &str,
        mode: SyncMode,
        parameters: &Value,
    ) -> Result<TaskHandle, TrackerError> {
        let uuid = Uuid::new_v4();
        let started_at = OffsetDateTime::now_utc();
        sqlx::query(
            "
            INSERT INTO sync_tasks (task_uuid, project_id, task_type, task_status, start_time, parameters)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )
        .bind(uuid.to_string())
        .bind(project_id)
        .bind(mode.as_str())
        .bind(TaskStatus::Running.as_str())
        .bind(timestamp::to_micros(started_at))
        .bind(serde_json::to_string(parameters)?)
        .execute(self.store.pool())
        .await?;
        debug!(task_uuid = %uuid, project_id, mode = mode.as_str(), "task started");
        Ok(TaskHandle {
            store: self.store.clone(),
            uuid,
            started_at,
        })
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Option<TaskRecord>, TrackerError> {
        let row = sqlx::query(&format!("{SELECT_TASK} WHERE task_uuid = ?1"))
            .bind(uuid.to_string())
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Most recent first.
    pub async fn history(
        &self,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<TaskRecord>, TrackerError> {
        let rows = sqlx::query(&format!(
            "{SELECT_TASK} WHERE project_id = ?1 ORDER BY start_time DESC, rowid DESC LIMIT ?2"
        ))
        .bind(project_id)
        .bind(i64::from(limit))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(task_from_row).collect()
    }
}

/// A running task. Finishing it consumes the handle, so a task is finalized at most once per
/// handle; the status guard in SQL covers handles raced through other connections.
#[derive(Debug)]
pub struct TaskHandle {
    store: MirrorStore,
    uuid: Uuid,
    started_at: OffsetDateTime,
}

impl TaskHandle {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub async fn complete(self, summary: &TaskSummary) -> Result<(), TrackerError> {
        self.finish(TaskStatus::Completed, None, summary).await
    }

    pub async fn fail(self, message: &str, summary: &TaskSummary) -> Result<(), TrackerError> {
        self.finish(TaskStatus::Failed, Some(message), summary).await
    }

    async fn finish(
        self,
        status: TaskStatus,
        message: Option<&str>,
        summary: &TaskSummary,
    ) -> Result<(), TrackerError> {
        let ended_at = OffsetDateTime::now_utc();
        let duration = (ended_at - self.started_at).as_seconds_f64();
        let stats = if summary.performance_stats.is_null() {
            Value::Object(Default::default())
        } else {
            summary.performance_stats.clone()
        };
        let result = sqlx::query(
            "
            UPDATE sync_tasks SET
                task_status = ?2,
                end_time = ?3,
                duration_seconds = ?4,
                folders_synced = ?5,
                files_synced = ?6,
                versions_synced = ?7,
                attrs_synced = ?8,
                error_message = ?9,
                errors = ?10,
                performance_stats = ?11
            WHERE task_uuid = ?1 AND task_status = 'running'
            ",
        )
        .bind(self.uuid.to_string())
        .bind(status.as_str())
        .bind(timestamp::to_micros(ended_at))
        .bind(duration)
        .bind(summary.folders_synced as i64)
        .bind(summary.files_synced as i64)
        .bind(summary.versions_synced as i64)
        .bind(summary.attrs_synced as i64)
        .bind(message)
        .bind(serde_json::to_string(&summary.errors)?)
        .bind(serde_json::to_string(&stats)?)
        .execute(self.store.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(TrackerError::AlreadyFinalized(self.uuid));
        }
        debug!(task_uuid = %self.uuid, status = status.as_str(), duration, "task finished");
        Ok(())
    }
}

const SELECT_TASK: &str = "
    SELECT task_uuid, project_id, task_type, task_status, start_time, end_time,
           duration_seconds, folders_synced, files_synced, versions_synced, attrs_synced,
           error_message, errors, performance_stats, parameters
    FROM sync_tasks";

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord, TrackerError> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("task_status")?;
    let uuid: String = row.try_get("task_uuid")?;
    let errors: String = row.try_get("errors")?;
    let stats: String = row.try_get("performance_stats")?;
    let parameters: String = row.try_get("parameters")?;
    Ok(TaskRecord {
        task_uuid: Uuid::parse_str(&uuid)?,
        project_id: row.try_get("project_id")?,
        task_type: SyncMode::parse(&task_type)
            .ok_or(TrackerError::InvalidTaskType(task_type))?,
        task_status: TaskStatus::parse(&status)?,
        start_time: store::read_time(row, "start_time")?
            .ok_or(StoreError::InvalidTimestamp(0))?,
        end_time: store::read_time(row, "end_time")?,
        duration_seconds: row.try_get("duration_seconds")?,
        folders_synced: row.try_get::<i64, _>("folders_synced")? as u64,
        files_synced: row.try_get::<i64, _>("files_synced")? as u64,
        versions_synced: row.try_get::<i64, _>("versions_synced")? as u64,
        attrs_synced: row.try_get::<i64, _>("attrs_synced")? as u64,
        error_message: row.try_get("error_message")?,
        errors: serde_json::from_str(&errors)?,
        performance_stats: serde_json::from_str(&stats)?,
        parameters: serde_json::from_str(&parameters)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::error::ItemErrorKind;
    use crate::sync::test_support::{PROJECT, make_store};
    use serde_json::json;

    #[tokio::test]
    async fn start_then_complete_round_trips() {
        let tracker = TaskTracker::new(make_store().await);
        let handle = tracker
            .start(PROJECT, SyncMode::Full, &json!({ "max_depth": 3, "include_attrs": true }))
            .await
            .unwrap();
        let uuid = handle.uuid();

        let running = tracker.get(uuid).await.unwrap().unwrap();
        assert_eq!(running.task_status, TaskStatus::Running);
        assert!(running.end_time.is_none());

        let summary = TaskSummary {
            folders_synced: 2,
            files_synced: 5,
            versions_synced: 10,
            attrs_synced: 15,
            errors: vec![ItemError::new("folder", "f9", ItemErrorKind::RateLimited, "gave up")],
            performance_stats: json!({ "api_calls": 12 }),
        };
        handle.complete(&summary).await.unwrap();

        let record = tracker.get(uuid).await.unwrap().unwrap();
        assert_eq!(record.task_status, TaskStatus::Completed);
        assert_eq!(record.task_type, SyncMode::Full);
        assert_eq!(record.files_synced, 5);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].kind, ItemErrorKind::RateLimited);
        assert_eq!(record.parameters["max_depth"], 3);
        assert_eq!(record.performance_stats["api_calls"], 12);
        assert!(record.end_time.is_some());
        assert!(record.duration_seconds.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn finished_task_cannot_be_finalized_again() {
        let store = make_store().await;
        let tracker = TaskTracker::new(store.clone());
        let handle = tracker
            .start(PROJECT, SyncMode::Incremental, &json!({}))
            .await
            .unwrap();
        let uuid = handle.uuid();
        handle
            .fail("no reachable top-level folders", &TaskSummary::default())
            .await
            .unwrap();

        let stale = TaskHandle {
            store,
            uuid,
            started_at: OffsetDateTime::now_utc(),
        };
        let err = stale.complete(&TaskSummary::default()).await.unwrap_err();

        assert!(matches!(err, TrackerError::AlreadyFinalized(id) if id == uuid));
        let record = tracker.get(uuid).await.unwrap().unwrap();
        assert_eq!(record.task_status, TaskStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("no reachable top-level folders")
        );
    }

    #[tokio::test]
    async fn running_handle_debug_names_its_task() {
        let tracker = TaskTracker::new(make_store().await);
        let handle = tracker
            .start(PROJECT, SyncMode::Full, &json!({}))
            .await
            .unwrap();

        let rendered = format!("{handle:?}");

        assert!(rendered.contains(&handle.uuid().to_string()));
        assert!(rendered.contains("MirrorStore"));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let tracker = TaskTracker::new(make_store().await);
        let mut started = Vec::new();
        for _ in 0..3 {
            started.push(
                tracker
                    .start(PROJECT, SyncMode::Incremental, &json!({}))
                    .await
                    .unwrap()
                    .uuid(),
            );
        }
        tracker
            .start("b.other", SyncMode::Full, &json!({}))
            .await
            .unwrap();

        let history = tracker.history(PROJECT, 2).await.unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].task_uuid, started[2]);
        assert_eq!(history[1].task_uuid, started[1]);
        assert!(tracker.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn records_serialize_with_rfc3339_times() {
        let record = TaskRecord {
            task_uuid: Uuid::nil(),
            project_id: PROJECT.into(),
            task_type: SyncMode::Incremental,
            task_status: TaskStatus::Completed,
            start_time: time::macros::datetime!(2024-01-05 00:00 UTC),
            end_time: None,
            duration_seconds: Some(1.5),
            folders_synced: 0,
            files_synced: 0,
            versions_synced: 0,
            attrs_synced: 0,
            error_message: None,
            errors: Vec::new(),
            performance_stats: json!({}),
            parameters: json!({}),
        };

        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["start_time"], "2024-01-05T00:00:00Z");
        assert_eq!(value["task_type"], "incremental");
        assert_eq!(value["task_status"], "completed");
        assert!(value["end_time"].is_null());
    }
}
