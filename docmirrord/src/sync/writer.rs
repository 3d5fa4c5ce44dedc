use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::error::{ItemError, ItemErrorKind};
use super::metrics::RunMetrics;
use super::model::{
    AttributeDefinitionRecord, AttributeScope, AttributeValue, AttributeValueRecord, FileRecord,
    FolderRecord, VersionRecord,
};
use super::store::{MirrorStore, StoreError, micros};
use super::timestamp;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub attempted: usize,
    pub upserted: usize,
    /// Records already stored with an equal or newer timestamp.
    pub unchanged: usize,
    pub errors: Vec<ItemError>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.attempted += other.attempted;
        self.upserted += other.upserted;
        self.unchanged += other.unchanged;
        self.errors.extend(other.errors);
    }

    /// Records that are now present in the store, whether written by this call or already current.
    pub fn persisted(&self) -> usize {
        self.upserted + self.unchanged
    }
}

/// A record the writer knows how to upsert on a single connection.
trait Upsert {
    const SCOPE: &'static str;

    fn key(&self) -> String;

    /// Returns `false` when the stored row was already at least as new and nothing changed.
    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> Result<bool, StoreError>;
}

pub struct Writer {
    store: MirrorStore,
    batch_size: usize,
    metrics: Arc<RunMetrics>,
}

impl Writer {
    pub fn new(store: MirrorStore, batch_size: usize, metrics: Arc<RunMetrics>) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            metrics,
        }
    }

    pub async fn upsert_folders(&self, folders: &[FolderRecord]) -> BatchOutcome {
        self.write_all(folders).await
    }

    pub async fn upsert_files(&self, files: &[FileRecord]) -> BatchOutcome {
        self.write_all(files).await
    }

    pub async fn upsert_versions(&self, versions: &[VersionRecord]) -> BatchOutcome {
        self.write_all(versions).await
    }

    /// Definitions are de-duplicated by `(attr_id, project_id, scope)`, last one wins.
    pub async fn upsert_attribute_definitions(
        &self,
        definitions: &[AttributeDefinitionRecord],
    ) -> BatchOutcome {
        let mut order: Vec<(i64, String, AttributeScope)> = Vec::new();
        let mut latest: HashMap<(i64, String, AttributeScope), &AttributeDefinitionRecord> =
            HashMap::new();
        for definition in definitions {
            let key = (
                definition.attr_id,
                definition.project_id.clone(),
                definition.scope.clone(),
            );
            if latest.insert(key.clone(), definition).is_none() {
                order.push(key);
            }
        }
        let unique: Vec<AttributeDefinitionRecord> = order
            .iter()
            .filter_map(|key| latest.get(key).map(|d| (*d).clone()))
            .collect();
        let mut outcome = self.write_all(&unique).await;
        outcome.attempted = definitions.len();
        outcome.unchanged += definitions.len() - unique.len();
        outcome
    }

    /// Must run after the definitions they reference have been written.
    pub async fn upsert_attribute_values(&self, values: &[AttributeValueRecord]) -> BatchOutcome {
        self.write_all(values).await
    }

    async fn write_all<R: Upsert>(&self, records: &[R]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for chunk in records.chunks(self.batch_size) {
            outcome.attempted += chunk.len();
            match self.write_chunk(chunk).await {
                Ok(chunk_outcome) => outcome.merge(BatchOutcome {
                    attempted: 0,
                    ..chunk_outcome
                }),
                Err(err) => {
                    warn!(
                        scope = R::SCOPE,
                        error = %err,
                        records = chunk.len(),
                        "batch transaction failed"
                    );
                    outcome.errors.extend(chunk.iter().map(|record| {
                        ItemError::new(
                            R::SCOPE,
                            record.key(),
                            ItemErrorKind::Persistence,
                            err.to_string(),
                        )
                    }));
                }
            }
            self.metrics.batch_operation();
        }
        outcome
    }

    /// One transaction per chunk, one savepoint per record: a failing record is rolled back and
    /// reported while the rest of the chunk commits.
    async fn write_chunk<R: Upsert>(&self, chunk: &[R]) -> Result<BatchOutcome, StoreError> {
        let now = timestamp::to_micros(OffsetDateTime::now_utc());
        let mut outcome = BatchOutcome::default();
        let mut tx = self.store.pool().begin().await?;
        for record in chunk {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            match record.upsert(&mut *savepoint, now).await {
                Ok(changed) => {
                    savepoint.commit().await?;
                    if changed {
                        outcome.upserted += 1;
                    } else {
                        outcome.unchanged += 1;
                    }
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    debug!(
                        scope = R::SCOPE,
                        id = %record.key(),
                        error = %err,
                        "record upsert failed"
                    );
                    outcome.errors.push(ItemError::new(
                        R::SCOPE,
                        record.key(),
                        ItemErrorKind::Persistence,
                        err.to_string(),
                    ));
                }
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }
}

impl Upsert for FolderRecord {
    const SCOPE: &'static str = "folder";

    fn key(&self) -> String {
        self.id.clone()
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> Result<bool, StoreError> {
        let metadata = serde_json::to_string(&self.metadata)?;
        let result = sqlx::query(
            "
            INSERT INTO folders (
                id, project_id, parent_id, name, path, depth, object_count,
                create_time, create_user_id, create_user_name,
                last_modified_time, last_modified_user_id, last_modified_user_name,
                last_modified_time_rollup, hidden, metadata, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                parent_id = excluded.parent_id,
                name = excluded.name,
                path = excluded.path,
                depth = excluded.depth,
                object_count = excluded.object_count,
                create_time = excluded.create_time,
                create_user_id = excluded.create_user_id,
                create_user_name = excluded.create_user_name,
                last_modified_time = excluded.last_modified_time,
                last_modified_user_id = excluded.last_modified_user_id,
                last_modified_user_name = excluded.last_modified_user_name,
                last_modified_time_rollup = excluded.last_modified_time_rollup,
                hidden = excluded.hidden,
                metadata = excluded.metadata,
                synced_at = excluded.synced_at
            WHERE folders.last_modified_time IS NULL
                OR folders.last_modified_time_rollup IS NULL
                OR excluded.last_modified_time > folders.last_modified_time
                OR excluded.last_modified_time_rollup > folders.last_modified_time_rollup;
            ",
        )
        .bind(&self.id)
        .bind(&self.project_id)
        .bind(&self.parent_id)
        .bind(&self.name)
        .bind(&self.path)
        .bind(i64::from(self.depth))
        .bind(self.object_count.map(|c| c as i64))
        .bind(micros(self.create_time))
        .bind(&self.create_user_id)
        .bind(&self.create_user_name)
        .bind(micros(self.last_modified_time))
        .bind(&self.last_modified_user_id)
        .bind(&self.last_modified_user_name)
        .bind(micros(self.last_modified_time_rollup))
        .bind(self.hidden)
        .bind(metadata)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl Upsert for FileRecord {
    const SCOPE: &'static str = "file";

    fn key(&self) -> String {
        self.id.clone()
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> Result<bool, StoreError> {
        let metadata = serde_json::to_string(&self.metadata)?;
        let result = sqlx::query(
            "
            INSERT INTO files (
                id, project_id, parent_folder_id, name, path, file_type,
                create_time, create_user_id, create_user_name,
                last_modified_time, last_modified_user_id, last_modified_user_name,
                hidden, reserved, metadata, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                parent_folder_id = excluded.parent_folder_id,
                name = excluded.name,
                path = excluded.path,
                file_type = excluded.file_type,
                create_time = excluded.create_time,
                create_user_id = excluded.create_user_id,
                create_user_name = excluded.create_user_name,
                last_modified_time = excluded.last_modified_time,
                last_modified_user_id = excluded.last_modified_user_id,
                last_modified_user_name = excluded.last_modified_user_name,
                hidden = excluded.hidden,
                reserved = excluded.reserved,
                metadata = excluded.metadata,
                synced_at = excluded.synced_at
            WHERE files.last_modified_time IS NULL
                OR excluded.last_modified_time > files.last_modified_time;
            ",
        )
        .bind(&self.id)
        .bind(&self.project_id)
        .bind(&self.parent_folder_id)
        .bind(&self.name)
        .bind(&self.path)
        .bind(&self.file_type)
        .bind(micros(self.create_time))
        .bind(&self.create_user_id)
        .bind(&self.create_user_name)
        .bind(micros(self.last_modified_time))
        .bind(&self.last_modified_user_id)
        .bind(&self.last_modified_user_name)
        .bind(self.hidden)
        .bind(self.reserved)
        .bind(metadata)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl Upsert for VersionRecord {
    const SCOPE: &'static str = "version";

    fn key(&self) -> String {
        self.id.clone()
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> Result<bool, StoreError> {
        if !self.synthesized {
            sqlx::query("DELETE FROM file_versions WHERE file_id = ?1 AND synthesized = 1")
                .bind(&self.file_id)
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query(
            "
            INSERT INTO file_versions (
                id, file_id, project_id, version_number, name, storage_urn, storage_size,
                mime_type, file_type, process_state, create_time, create_user_id,
                create_user_name, last_modified_time, synthesized, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                file_id = excluded.file_id,
                project_id = excluded.project_id,
                version_number = excluded.version_number,
                name = excluded.name,
                storage_urn = excluded.storage_urn,
                storage_size = excluded.storage_size,
                mime_type = excluded.mime_type,
                file_type = excluded.file_type,
                process_state = excluded.process_state,
                create_time = excluded.create_time,
                create_user_id = excluded.create_user_id,
                create_user_name = excluded.create_user_name,
                last_modified_time = excluded.last_modified_time,
                synthesized = excluded.synthesized,
                synced_at = excluded.synced_at;
            ",
        )
        .bind(&self.id)
        .bind(&self.file_id)
        .bind(&self.project_id)
        .bind(i64::from(self.version_number))
        .bind(&self.name)
        .bind(&self.storage_urn)
        .bind(self.storage_size.map(|s| s as i64))
        .bind(&self.mime_type)
        .bind(&self.file_type)
        .bind(&self.process_state)
        .bind(micros(self.create_time))
        .bind(&self.create_user_id)
        .bind(&self.create_user_name)
        .bind(micros(self.last_modified_time))
        .bind(self.synthesized)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        // Exactly one current version per file: the highest number, ties broken by id.
        sqlx::query(
            "
            UPDATE file_versions SET is_current_version = CASE
                WHEN id = (
                    SELECT id FROM file_versions
                    WHERE file_id = ?1
                    ORDER BY version_number DESC, id DESC
                    LIMIT 1
                ) THEN 1 ELSE 0 END
            WHERE file_id = ?1;
            ",
        )
        .bind(&self.file_id)
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }
}

impl Upsert for AttributeDefinitionRecord {
    const SCOPE: &'static str = "attribute_definition";

    fn key(&self) -> String {
        format!("{}:{}", self.attr_id, self.scope.folder_key())
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> Result<bool, StoreError> {
        let array_values = self
            .array_values
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "
            INSERT INTO custom_attribute_definitions (
                attr_id, project_id, scope_folder_id, scope_type, inherit_to_subfolders,
                name, data_type, array_values, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(attr_id, project_id, scope_folder_id) DO UPDATE SET
                scope_type = excluded.scope_type,
                inherit_to_subfolders = excluded.inherit_to_subfolders,
                name = excluded.name,
                data_type = excluded.data_type,
                array_values = excluded.array_values,
                synced_at = excluded.synced_at;
            ",
        )
        .bind(self.attr_id)
        .bind(&self.project_id)
        .bind(self.scope.folder_key())
        .bind(self.scope.kind())
        .bind(self.inherit_to_subfolders)
        .bind(&self.name)
        .bind(self.data_type.as_str())
        .bind(array_values)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }
}

/// Storage columns for one polymorphic value. `text` always carries a readable form.
#[derive(Debug, Default, PartialEq)]
struct ValueColumns {
    text: Option<String>,
    date: Option<i64>,
    number: Option<f64>,
    boolean: Option<bool>,
    array: Option<String>,
}

impl ValueColumns {
    fn from_value(value: Option<&AttributeValue>) -> Result<Self, StoreError> {
        let Some(value) = value else {
            return Ok(Self::default());
        };
        Ok(match value {
            AttributeValue::String(text) => Self {
                text: Some(text.clone()),
                ..Self::default()
            },
            AttributeValue::Date(at) => Self {
                text: Some(timestamp::format(*at)),
                date: Some(timestamp::to_micros(*at)),
                ..Self::default()
            },
            AttributeValue::Number(n) => Self {
                text: Some(n.to_string()),
                number: Some(*n),
                ..Self::default()
            },
            AttributeValue::Boolean(b) => Self {
                text: Some(b.to_string()),
                boolean: Some(*b),
                ..Self::default()
            },
            AttributeValue::Array(items) => Self {
                text: Some(items.join(", ")),
                array: Some(serde_json::to_string(items)?),
                ..Self::default()
            },
        })
    }
}

impl Upsert for AttributeValueRecord {
    const SCOPE: &'static str = "attribute_value";

    fn key(&self) -> String {
        format!("{}:{}", self.file_id, self.attr_id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, now: i64) -> Result<bool, StoreError> {
        let definition_id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM custom_attribute_definitions WHERE attr_id = ?1 AND project_id = ?2 AND scope_folder_id = ''",
        )
        .bind(self.attr_id)
        .bind(&self.project_id)
        .fetch_optional(&mut *conn)
        .await?;
        let definition_id = definition_id.ok_or_else(|| StoreError::MissingDefinition {
            attr_id: self.attr_id,
            project_id: self.project_id.clone(),
        })?;

        let columns = ValueColumns::from_value(self.value.as_ref())?;
        sqlx::query(
            "
            INSERT INTO custom_attribute_values (
                file_id, version_id, project_id, attr_definition_id, attr_id,
                value, value_date, value_number, value_boolean, value_array, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(file_id, attr_definition_id) DO UPDATE SET
                version_id = excluded.version_id,
                project_id = excluded.project_id,
                attr_id = excluded.attr_id,
                value = excluded.value,
                value_date = excluded.value_date,
                value_number = excluded.value_number,
                value_boolean = excluded.value_boolean,
                value_array = excluded.value_array,
                synced_at = excluded.synced_at;
            ",
        )
        .bind(&self.file_id)
        .bind(&self.version_id)
        .bind(&self.project_id)
        .bind(definition_id)
        .bind(self.attr_id)
        .bind(columns.text)
        .bind(columns.date)
        .bind(columns.number)
        .bind(columns.boolean)
        .bind(columns.array)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
