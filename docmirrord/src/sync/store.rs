use std::{fs, path::PathBuf};

use serde::Serialize;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

use super::model::{AttributeValue, ProjectRecord};
use super::timestamp;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("stored timestamp out of range: {0}")]
    InvalidTimestamp(i64),
    #[error("no attribute definition {attr_id} for project {project_id}")]
    MissingDefinition { attr_id: i64, project_id: String },
    #[error("project not found after upsert")]
    MissingProject,
}

/// Rows removed by the destructive full-sync pre-step, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub attribute_values: u64,
    pub attribute_definitions: u64,
    pub versions: u64,
    pub files: u64,
    pub folders: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFolder {
    pub id: String,
    pub parent_id: Option<String>,
    pub path: String,
    pub depth: u32,
    pub last_modified_time: Option<OffsetDateTime>,
    pub last_modified_time_rollup: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub id: String,
    pub parent_folder_id: Option<String>,
    pub name: String,
    pub path: String,
    pub last_modified_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub id: String,
    pub version_number: u32,
    pub is_current_version: bool,
    pub synthesized: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectCounts {
    pub folders: u64,
    pub files: u64,
    pub versions: u64,
    pub attribute_definitions: u64,
    pub attribute_values: u64,
}

#[derive(Debug, Clone)]
pub struct MirrorStore {
    pool: SqlitePool,
}

impl MirrorStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = database_url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_project(
        &self,
        project_id: &str,
        hub_id: Option<&str>,
    ) -> Result<ProjectRecord, StoreError> {
        sqlx::query(
            "
            INSERT INTO projects (id, hub_id, sync_status, updated_at)
            VALUES (?1, ?2, 'never', ?3)
            ON CONFLICT(id) DO UPDATE SET
                hub_id = COALESCE(excluded.hub_id, projects.hub_id);
            ",
        )
        .bind(project_id)
        .bind(hub_id)
        .bind(timestamp::to_micros(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await?;

        self.get_project(project_id)
            .await?
            .ok_or(StoreError::MissingProject)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, hub_id, last_sync_time, last_full_sync_time, sync_status FROM projects WHERE id = ?1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ProjectRecord {
                id: row.try_get("id")?,
                hub_id: row.try_get("hub_id")?,
                last_sync_time: read_time(&row, "last_sync_time")?,
                last_full_sync_time: read_time(&row, "last_full_sync_time")?,
                sync_status: row.try_get("sync_status")?,
            })
        })
        .transpose()
    }

    pub async fn set_project_status(
        &self,
        project_id: &str,
        status: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE projects SET sync_status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(timestamp::to_micros(OffsetDateTime::now_utc()))
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advances the project's sync watermarks to `started_at`. The conditional update never moves
    /// a watermark backwards, so an older run finishing late cannot undo a newer one.
    pub async fn finalize_project(
        &self,
        project_id: &str,
        started_at: OffsetDateTime,
        full: bool,
    ) -> Result<(), StoreError> {
        let started = timestamp::to_micros(started_at);
        let now = timestamp::to_micros(OffsetDateTime::now_utc());
        sqlx::query(
            "
            UPDATE projects SET
                last_sync_time = ?1,
                sync_status = 'completed',
                updated_at = ?2
            WHERE id = ?3 AND (last_sync_time IS NULL OR last_sync_time < ?1);
            ",
        )
        .bind(started)
        .bind(now)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        if full {
            sqlx::query(
                "
                UPDATE projects SET last_full_sync_time = ?1
                WHERE id = ?2 AND (last_full_sync_time IS NULL OR last_full_sync_time < ?1);
                ",
            )
            .bind(started)
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        }
        self.set_project_status(project_id, "completed").await
    }

    /// Deletes every mirrored row of the project, children before parents, in one transaction.
    pub async fn purge_project(&self, project_id: &str) -> Result<PurgeReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let attribute_values =
            sqlx::query("DELETE FROM custom_attribute_values WHERE project_id = ?1")
                .bind(project_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        let attribute_definitions =
            sqlx::query("DELETE FROM custom_attribute_definitions WHERE project_id = ?1")
                .bind(project_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        let versions = sqlx::query("DELETE FROM file_versions WHERE project_id = ?1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let files = sqlx::query("DELETE FROM files WHERE project_id = ?1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let folders = sqlx::query("DELETE FROM folders WHERE project_id = ?1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(PurgeReport {
            attribute_values,
            attribute_definitions,
            versions,
            files,
            folders,
        })
    }

    pub async fn project_counts(&self, project_id: &str) -> Result<ProjectCounts, StoreError> {
        let row = sqlx::query(
            "
            SELECT
                (SELECT COUNT(*) FROM folders WHERE project_id = ?1) AS folders,
                (SELECT COUNT(*) FROM files WHERE project_id = ?1) AS files,
                (SELECT COUNT(*) FROM file_versions WHERE project_id = ?1) AS versions,
                (SELECT COUNT(*) FROM custom_attribute_definitions WHERE project_id = ?1) AS definitions,
                (SELECT COUNT(*) FROM custom_attribute_values WHERE project_id = ?1) AS attr_values
            ",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ProjectCounts {
            folders: row.try_get::<i64, _>("folders")? as u64,
            files: row.try_get::<i64, _>("files")? as u64,
            versions: row.try_get::<i64, _>("versions")? as u64,
            attribute_definitions: row.try_get::<i64, _>("definitions")? as u64,
            attribute_values: row.try_get::<i64, _>("attr_values")? as u64,
        })
    }

    pub async fn get_folder(&self, folder_id: &str) -> Result<Option<StoredFolder>, StoreError> {
        let row = sqlx::query(
            "SELECT id, parent_id, path, depth, last_modified_time, last_modified_time_rollup FROM folders WHERE id = ?1",
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(StoredFolder {
                id: row.try_get("id")?,
                parent_id: row.try_get("parent_id")?,
                path: row.try_get("path")?,
                depth: row.try_get::<i64, _>("depth")? as u32,
                last_modified_time: read_time(&row, "last_modified_time")?,
                last_modified_time_rollup: read_time(&row, "last_modified_time_rollup")?,
            })
        })
        .transpose()
    }

    pub async fn get_file(&self, file_id: &str) -> Result<Option<StoredFile>, StoreError> {
        let row = sqlx::query(
            "SELECT id, parent_folder_id, name, path, last_modified_time FROM files WHERE id = ?1",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(StoredFile {
                id: row.try_get("id")?,
                parent_folder_id: row.try_get("parent_folder_id")?,
                name: row.try_get("name")?,
                path: row.try_get("path")?,
                last_modified_time: read_time(&row, "last_modified_time")?,
            })
        })
        .transpose()
    }

    pub async fn list_versions(&self, file_id: &str) -> Result<Vec<StoredVersion>, StoreError> {
        let rows = sqlx::query(
            "
            SELECT id, version_number, is_current_version, synthesized
            FROM file_versions
            WHERE file_id = ?1
            ORDER BY version_number DESC, id DESC
            ",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredVersion {
                    id: row.try_get("id")?,
                    version_number: row.try_get::<i64, _>("version_number")? as u32,
                    is_current_version: row.try_get::<i64, _>("is_current_version")? != 0,
                    synthesized: row.try_get::<i64, _>("synthesized")? != 0,
                })
            })
            .collect()
    }

    /// Files whose current-version flag is not exactly one row holding the highest version number.
    pub async fn current_version_violations(&self, project_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "
            SELECT COUNT(*) AS violations FROM (
                SELECT v.file_id
                FROM file_versions v
                WHERE v.project_id = ?1
                GROUP BY v.file_id
                HAVING SUM(v.is_current_version) != 1
                    OR MAX(v.version_number) != MAX(CASE WHEN v.is_current_version = 1 THEN v.version_number END)
            )
            ",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("violations")? as u64)
    }

    pub async fn definition_id(
        &self,
        project_id: &str,
        attr_id: i64,
        scope_folder_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM custom_attribute_definitions WHERE attr_id = ?1 AND project_id = ?2 AND scope_folder_id = ?3",
        )
        .bind(attr_id)
        .bind(project_id)
        .bind(scope_folder_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get::<i64, _>("id"))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Reads a stored attribute value back into its typed form.
    pub async fn get_attribute_value(
        &self,
        file_id: &str,
        attr_id: i64,
    ) -> Result<Option<AttributeValue>, StoreError> {
        let row = sqlx::query(
            "
            SELECT d.data_type, v.value, v.value_date, v.value_number, v.value_boolean, v.value_array
            FROM custom_attribute_values v
            JOIN custom_attribute_definitions d ON d.id = v.attr_definition_id
            WHERE v.file_id = ?1 AND v.attr_id = ?2
            ",
        )
        .bind(file_id)
        .bind(attr_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        if let Some(micros) = row.try_get::<Option<i64>, _>("value_date")? {
            return timestamp::from_micros(micros)
                .map(|at| Some(AttributeValue::Date(at)))
                .ok_or(StoreError::InvalidTimestamp(micros));
        }
        if let Some(number) = row.try_get::<Option<f64>, _>("value_number")? {
            return Ok(Some(AttributeValue::Number(number)));
        }
        if let Some(flag) = row.try_get::<Option<i64>, _>("value_boolean")? {
            return Ok(Some(AttributeValue::Boolean(flag != 0)));
        }
        if let Some(array) = row.try_get::<Option<String>, _>("value_array")? {
            return Ok(Some(AttributeValue::Array(serde_json::from_str(&array)?)));
        }
        Ok(row
            .try_get::<Option<String>, _>("value")?
            .map(AttributeValue::String))
    }
}

pub(crate) fn read_time(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<Option<OffsetDateTime>, StoreError> {
    match row.try_get::<Option<i64>, _>(column)? {
        Some(micros) => timestamp::from_micros(micros)
            .map(Some)
            .ok_or(StoreError::InvalidTimestamp(micros)),
        None => Ok(None),
    }
}

pub(crate) fn micros(value: Option<OffsetDateTime>) -> Option<i64> {
    value.map(timestamp::to_micros)
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("docmirror").join("mirror.db"))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
