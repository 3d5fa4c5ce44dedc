use super::*;
use crate::sync::error::ItemErrorKind;
use crate::sync::model::AttributeValue;
use crate::sync::scheduler::MemoryProbe;
use crate::sync::test_support::{PROJECT, folder, make_store, make_writer};
use crate::sync::tracker::TaskStatus;
use crate::token_provider::TokenState;
use serde_json::json;
use std::time::Duration;
use time::macros::datetime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HUB: &str = "b.hub";
const DOCS_PROJECT: &str = "project-1";

struct NoProbe;

impl MemoryProbe for NoProbe {
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}

struct Harness {
    server: MockServer,
    store: MirrorStore,
    orchestrator: SyncOrchestrator,
}

async fn harness() -> Harness {
    harness_with(|_| {}, Some("test-token")).await
}

async fn harness_with(tune: impl FnOnce(&mut SyncConfig), token: Option<&str>) -> Harness {
    let server = MockServer::start().await;
    let store = make_store().await;
    let mut config = SyncConfig {
        hub_id: Some(HUB.to_string()),
        inter_call_delay: Duration::ZERO,
        api_retry_backoff_base: Duration::from_millis(1),
        api_retry_backoff_max: Duration::from_millis(5),
        ..SyncConfig::default()
    };
    tune(&mut config);
    let tokens = TokenProvider::new(
        TokenState {
            access_token: token.map(str::to_string),
            ..TokenState::default()
        },
        None,
    );
    let client = DocsClient::with_base_url(&server.uri(), "unset").unwrap();
    let orchestrator = SyncOrchestrator::new(config, store.clone(), Arc::new(tokens), client)
        .with_memory_probe(Arc::new(NoProbe));
    Harness {
        server,
        store,
        orchestrator,
    }
}

fn folder_json(id: &str, rollup: &str, objects: u64) -> Value {
    json!({
        "type": "folders",
        "id": id,
        "attributes": {
            "name": id,
            "lastModifiedTime": rollup,
            "lastModifiedTimeRollup": rollup,
            "objectCount": objects
        }
    })
}

fn item_json(id: &str, modified: &str) -> Value {
    json!({
        "type": "items",
        "id": id,
        "attributes": {
            "displayName": format!("{id}.pdf"),
            "createTime": "2023-12-01T00:00:00Z",
            "lastModifiedTime": modified
        },
        "relationships": { "tip": { "data": { "type": "versions", "id": format!("{id}-v2") } } }
    })
}

fn tip_json(item_id: &str) -> Value {
    json!({ "type": "versions", "id": format!("{item_id}-v2"), "attributes": { "storageSize": 2048 } })
}

async fn mount_top_folders(server: &MockServer, folders: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(format!("/project/v1/hubs/{HUB}/projects/{PROJECT}/topFolders")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": folders })))
        .mount(server)
        .await;
}

async fn mount_contents(server: &MockServer, folder_id: &str, item_ids: &[&str], modified: &str) {
    let data: Vec<Value> = item_ids.iter().map(|id| item_json(id, modified)).collect();
    let included: Vec<Value> = item_ids.iter().map(|id| tip_json(id)).collect();
    Mock::given(method("GET"))
        .and(path(contents_path(folder_id)))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": data, "included": included })),
        )
        .mount(server)
        .await;
}

async fn mount_untouched_contents(server: &MockServer, folder_id: &str) {
    Mock::given(method("GET"))
        .and(path(contents_path(folder_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(0)
        .mount(server)
        .await;
}

fn contents_path(folder_id: &str) -> String {
    format!("/data/v1/projects/{PROJECT}/folders/{folder_id}/contents")
}

fn versions_path(item_id: &str) -> String {
    format!("/data/v1/projects/{PROJECT}/items/{item_id}/versions")
}

async fn mount_two_versions(server: &MockServer, item_id: &str) {
    Mock::given(method("GET"))
        .and(path(versions_path(item_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [
            { "type": "versions", "id": format!("{item_id}-v1"), "attributes": { "versionNumber": 1 } },
            { "type": "versions", "id": format!("{item_id}-v2"), "attributes": { "versionNumber": 2, "storageSize": 2048 } }
        ] })))
        .mount(server)
        .await;
}

async fn mount_batch_attributes(server: &MockServer, item_ids: &[&str]) {
    let results: Vec<Value> = item_ids
        .iter()
        .map(|id| {
            json!({
                "urn": format!("{id}-v2"),
                "customAttributes": [
                    { "id": 1, "type": "date", "name": "Issued", "value": "2024-02-02T10:00:00.123456Z" },
                    { "id": 2, "type": "number", "name": "Revision", "value": 3 },
                    { "id": 3, "type": "string", "name": "Status", "value": "For review" }
                ]
            })
        })
        .collect();
    Mock::given(method("POST"))
        .and(path(format!(
            "/bim360/docs/v1/projects/{DOCS_PROJECT}/versions:batch-get"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": results })))
        .mount(server)
        .await;
}

async fn seed_last_sync(store: &MirrorStore, at: OffsetDateTime) {
    store.ensure_project(PROJECT, Some(HUB)).await.unwrap();
    store.finalize_project(PROJECT, at, true).await.unwrap();
}

async fn mount_small_project(server: &MockServer) {
    mount_top_folders(
        server,
        vec![
            folder_json("drawings", "2024-01-10T00:00:00Z", 3),
            folder_json("schedules", "2024-01-09T00:00:00Z", 2),
        ],
    )
    .await;
    mount_contents(server, "drawings", &["i1", "i2", "i3"], "2024-01-08T00:00:00Z").await;
    mount_contents(server, "schedules", &["i4", "i5"], "2024-01-08T00:00:00Z").await;
    for id in ["i1", "i2", "i3", "i4", "i5"] {
        mount_two_versions(server, id).await;
    }
    mount_batch_attributes(server, &["i1", "i2", "i3", "i4", "i5"]).await;
}

#[tokio::test]
async fn full_sync_mirrors_folders_files_versions_and_attributes() {
    let h = harness().await;
    mount_small_project(&h.server).await;

    let result = h
        .orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success, "{:?}", result.error_message);
    assert_eq!(result.mode, SyncMode::Full);
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.folders_synced, 2);
    assert_eq!(result.files_synced, 5);
    assert_eq!(result.versions_synced, 10);
    assert_eq!(result.attrs_synced, 15);

    let counts = h.store.project_counts(PROJECT).await.unwrap();
    assert_eq!(counts.folders, 2);
    assert_eq!(counts.files, 5);
    assert_eq!(counts.versions, 10);
    assert_eq!(counts.attribute_definitions, 3);
    assert_eq!(counts.attribute_values, 15);
    assert_eq!(h.store.current_version_violations(PROJECT).await.unwrap(), 0);

    let versions = h.store.list_versions("i1").await.unwrap();
    assert_eq!(versions[0].id, "i1-v2");
    assert!(versions[0].is_current_version);
    assert!(!versions[1].is_current_version);
    assert_eq!(
        h.store.get_attribute_value("i1", 1).await.unwrap(),
        Some(AttributeValue::Date(datetime!(2024-02-02 10:00:00.123456 UTC)))
    );

    let file = h.store.get_file("i2").await.unwrap().unwrap();
    assert_eq!(file.path, "/drawings/i2.pdf");
    let project = h.store.get_project(PROJECT).await.unwrap().unwrap();
    assert!(project.last_sync_time.is_some());
    assert_eq!(project.last_full_sync_time, project.last_sync_time);
    assert_eq!(project.sync_status, "completed");
}

#[tokio::test]
async fn repeated_full_sync_is_idempotent() {
    let h = harness().await;
    mount_small_project(&h.server).await;

    h.orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();
    let first = h.store.project_counts(PROJECT).await.unwrap();
    let second = h
        .orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(h.store.project_counts(PROJECT).await.unwrap(), first);
    let deleted = second.deleted.unwrap();
    assert_eq!(deleted.folders, 2);
    assert_eq!(deleted.versions, 10);
    assert_eq!(deleted.attribute_values, 15);
    assert_eq!(h.store.current_version_violations(PROJECT).await.unwrap(), 0);
}

#[tokio::test]
async fn unchanged_project_needs_a_single_check() {
    let h = harness().await;
    let last_sync = datetime!(2024-01-05 00:00 UTC);
    seed_last_sync(&h.store, last_sync).await;
    mount_top_folders(
        &h.server,
        vec![
            folder_json("drawings", "2024-01-04T00:00:00Z", 3),
            folder_json("schedules", "2024-01-05T00:00:00Z", 2),
        ],
    )
    .await;
    mount_untouched_contents(&h.server, "drawings").await;
    mount_untouched_contents(&h.server, "schedules").await;

    let result = h
        .orchestrator
        .start_incremental_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::NoChanges);
    assert_eq!(result.mode, SyncMode::Incremental);
    assert_eq!(result.folders_synced + result.files_synced, 0);
    assert_eq!(result.optimization_efficiency_percent, 100.0);
    assert_eq!(result.metrics.api_calls, 1);
    let project = h.store.get_project(PROJECT).await.unwrap().unwrap();
    assert_eq!(project.last_sync_time, Some(last_sync));
}

#[tokio::test]
async fn only_the_changed_file_is_enriched() {
    let h = harness().await;
    seed_last_sync(&h.store, datetime!(2024-01-05 00:00 UTC)).await;
    mount_top_folders(
        &h.server,
        vec![
            folder_json("drawings", "2024-01-10T00:00:00Z", 3),
            folder_json("archive", "2023-12-01T00:00:00Z", 40),
        ],
    )
    .await;
    mount_untouched_contents(&h.server, "archive").await;
    let items = vec![
        item_json("a", "2024-01-01T00:00:00Z"),
        item_json("b", "2024-01-04T00:00:00Z"),
        item_json("c", "2024-01-08T00:00:00Z"),
    ];
    Mock::given(method("GET"))
        .and(path(contents_path("drawings")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": items })))
        .expect(1)
        .mount(&h.server)
        .await;
    for unchanged in ["a", "b"] {
        Mock::given(method("GET"))
            .and(path(versions_path(unchanged)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
            .expect(0)
            .mount(&h.server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path(versions_path("c")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [
            { "type": "versions", "id": "c-v2", "attributes": { "versionNumber": 2 } }
        ] })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h
        .orchestrator
        .start_incremental_sync(
            PROJECT,
            SyncOptions {
                include_attrs: Some(false),
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.folders_synced, 1);
    assert_eq!(result.files_synced, 1);
    assert_eq!(result.versions_synced, 1);
    assert!(h.store.get_file("c").await.unwrap().is_some());
    assert!(h.store.get_file("a").await.unwrap().is_none());
    assert_eq!(result.metrics.api_calls_saved, 80);
    let project = h.store.get_project(PROJECT).await.unwrap().unwrap();
    assert!(project.last_sync_time.unwrap() > datetime!(2024-01-05 00:00 UTC));
}

#[tokio::test]
async fn rate_limited_folder_is_reported_and_the_rest_completes() {
    let h = harness().await;
    mount_top_folders(
        &h.server,
        vec![
            folder_json("broken", "2024-01-10T00:00:00Z", 1),
            folder_json("fine", "2024-01-10T00:00:00Z", 1),
        ],
    )
    .await;
    Mock::given(method("GET"))
        .and(path(contents_path("broken")))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(3)
        .expect(3)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(contents_path("broken")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(0)
        .mount(&h.server)
        .await;
    mount_contents(&h.server, "fine", &["i1"], "2024-01-08T00:00:00Z").await;
    Mock::given(method("GET"))
        .and(path(versions_path("i1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&h.server)
        .await;

    let result = h
        .orchestrator
        .start_full_sync(
            PROJECT,
            SyncOptions {
                include_attrs: Some(false),
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].id, "broken");
    assert_eq!(result.errors[0].kind, ItemErrorKind::RateLimited);
    assert_eq!(result.metrics.rate_limited, 3);
    assert_eq!(result.files_synced, 1);
    assert_eq!(result.folders_synced, 2);
    let broken = h.store.get_folder("broken").await.unwrap().unwrap();
    assert_eq!(broken.path, "/broken");
    assert_eq!(broken.depth, 0);
    let versions = h.store.list_versions("i1").await.unwrap();
    assert_eq!(versions.len(), 1);
    assert!(versions[0].synthesized);
    assert!(versions[0].is_current_version);

    let record = h
        .orchestrator
        .get_sync_status(result.task_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.task_status, TaskStatus::Completed);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(record.parameters["performance_mode"], "standard");
}

#[tokio::test]
async fn second_incremental_run_stops_at_the_project_check() {
    let h = harness().await;
    mount_small_project(&h.server).await;

    let first = h
        .orchestrator
        .start_incremental_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .start_incremental_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(first.mode, SyncMode::Full);
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(second.mode, SyncMode::Incremental);
    assert_eq!(second.status, RunStatus::NoChanges);
    assert_eq!(second.metrics.api_calls, 1);

    let history = h.orchestrator.get_sync_history(PROJECT, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].task_uuid, second.task_uuid);
    assert_eq!(history[1].task_type, SyncMode::Full);
}

#[tokio::test]
async fn unauthorized_run_fails_without_touching_mirrored_rows() {
    let h = harness().await;
    make_writer(&h.store, 10)
        .upsert_folders(&[folder("kept", None, None)])
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/project/v1/hubs/{HUB}/projects/{PROJECT}/topFolders")))
        .respond_with(ResponseTemplate::new(401))
        .mount(&h.server)
        .await;

    let result = h
        .orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Error);
    assert!(result.error_message.is_some());
    assert_eq!(h.store.project_counts(PROJECT).await.unwrap().folders, 1);
    let record = h
        .orchestrator
        .get_sync_status(result.task_uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.task_status, TaskStatus::Failed);
    let project = h.store.get_project(PROJECT).await.unwrap().unwrap();
    assert_eq!(project.sync_status, "failed");
    assert!(project.last_sync_time.is_none());
}

#[tokio::test]
async fn project_without_top_folders_fails_the_task() {
    let h = harness().await;
    mount_top_folders(&h.server, Vec::new()).await;

    let result = h
        .orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Error);
    assert!(
        result
            .error_message
            .unwrap()
            .contains("no reachable top-level folders")
    );
    assert!(h.orchestrator.running.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_token_fails_before_any_task_exists() {
    let h = harness_with(|_| {}, None).await;

    let err = h
        .orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Token(_)));
    assert!(
        h.orchestrator
            .get_sync_history(PROJECT, 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn concurrent_run_for_the_same_project_is_refused() {
    let h = harness().await;
    h.orchestrator
        .running
        .lock()
        .unwrap()
        .insert(PROJECT.to_string());

    let err = h
        .orchestrator
        .start_incremental_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::AlreadyRunning(id) if id == PROJECT));
}

#[tokio::test]
async fn hub_is_resolved_and_remembered_when_not_configured() {
    let h = harness_with(|config| config.hub_id = None, Some("test-token")).await;
    Mock::given(method("GET"))
        .and(path("/project/v1/hubs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "id": HUB }] })))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/project/v1/hubs/{HUB}/projects")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "id": PROJECT }] })),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    mount_small_project(&h.server).await;

    h.orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();
    let again = h
        .orchestrator
        .start_full_sync(PROJECT, SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(again.status, RunStatus::Success);
    let project = h.store.get_project(PROJECT).await.unwrap().unwrap();
    assert_eq!(project.hub_id.as_deref(), Some(HUB));
}
