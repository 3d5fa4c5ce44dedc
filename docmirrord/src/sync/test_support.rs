use std::sync::Arc;

use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use super::metrics::RunMetrics;
use super::model::{FileRecord, FolderRecord, VersionRecord};
use super::store::MirrorStore;
use super::writer::Writer;

pub const PROJECT: &str = "b.project-1";

pub async fn make_store() -> MirrorStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = MirrorStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

pub fn make_writer(store: &MirrorStore, batch_size: usize) -> Writer {
    Writer::new(store.clone(), batch_size, Arc::new(RunMetrics::new()))
}

pub fn folder(id: &str, parent: Option<&str>, modified: Option<OffsetDateTime>) -> FolderRecord {
    FolderRecord {
        id: id.to_string(),
        project_id: PROJECT.to_string(),
        parent_id: parent.map(str::to_string),
        name: id.to_string(),
        path: format!("/{id}"),
        depth: u32::from(parent.is_some()),
        object_count: Some(1),
        create_time: modified,
        create_user_id: None,
        create_user_name: None,
        last_modified_time: modified,
        last_modified_user_id: None,
        last_modified_user_name: None,
        last_modified_time_rollup: modified,
        hidden: false,
        metadata: json!({}),
    }
}

pub fn file(id: &str, folder_id: &str, modified: Option<OffsetDateTime>) -> FileRecord {
    FileRecord {
        id: id.to_string(),
        project_id: PROJECT.to_string(),
        parent_folder_id: Some(folder_id.to_string()),
        name: format!("{id}.pdf"),
        path: format!("/{folder_id}/{id}.pdf"),
        file_type: Some("pdf".to_string()),
        create_time: modified,
        create_user_id: None,
        create_user_name: None,
        last_modified_raw: None,
        last_modified_time: modified,
        last_modified_user_id: None,
        last_modified_user_name: None,
        hidden: false,
        reserved: false,
        tip_version_id: None,
        tip_storage_size: None,
        metadata: json!({}),
    }
}

pub fn version(id: &str, file_id: &str, number: u32) -> VersionRecord {
    VersionRecord {
        id: id.to_string(),
        file_id: file_id.to_string(),
        project_id: PROJECT.to_string(),
        version_number: number,
        name: None,
        storage_urn: None,
        storage_size: Some(10),
        mime_type: Some("application/pdf".to_string()),
        file_type: Some("pdf".to_string()),
        process_state: None,
        create_time: None,
        create_user_id: None,
        create_user_name: None,
        last_modified_time: None,
        synthesized: false,
    }
}
