//! Drives one sync run through mode selection, pruning, expansion, classification, enrichment
//! and writing, and records it as a task. Per-item failures end up in the result's error list;
//! only precondition failures (token, top folders, authentication, store) fail the task.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use docmirror_core::{AttributeDefinitionEntry, DocsClient, RemoteVersion, VersionCustomAttributes};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::branch_filter::{self, ProjectCheck};
use super::classifier;
use super::error::{ItemError, SyncError};
use super::fetcher::{CallFailure, Fetcher};
use super::metrics::{MetricsSnapshot, RunMetrics};
use super::model::{
    AttributeDefinitionRecord, AttributeValueRecord, FileRecord, ProjectRecord, SyncMode,
    VersionRecord,
};
use super::reconcile;
use super::scheduler::{MemoryProbe, ProcStatusProbe, Scheduler, TierHints};
use super::store::{MirrorStore, PurgeReport};
use super::tracker::{TaskHandle, TaskRecord, TaskSummary, TaskTracker};
use super::writer::{BatchOutcome, Writer};
use crate::config::SyncConfig;
use crate::token_provider::TokenProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    NoChanges,
    Error,
}

/// Per-invocation knobs. `include_attrs: None` uses the configured default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub max_depth: Option<u32>,
    pub include_attrs: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub task_uuid: Uuid,
    pub project_id: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub folders_synced: u64,
    pub files_synced: u64,
    pub versions_synced: u64,
    pub attrs_synced: u64,
    pub duration_seconds: f64,
    pub optimization_efficiency_percent: f64,
    pub errors: Vec<ItemError>,
    pub error_message: Option<String>,
    pub deleted: Option<PurgeReport>,
    pub metrics: MetricsSnapshot,
}

/// What a run accumulated so far; kept outside the fallible part so a failed run still reports
/// its partial errors and counters.
#[derive(Debug, Default)]
struct RunState {
    folders_synced: u64,
    files_synced: u64,
    versions_synced: u64,
    attrs_synced: u64,
    errors: Vec<ItemError>,
    deleted: Option<PurgeReport>,
    details: serde_json::Map<String, Value>,
}

impl RunState {
    fn absorb(&mut self, outcome: BatchOutcome) -> u64 {
        let persisted = outcome.persisted() as u64;
        self.errors.extend(outcome.errors);
        persisted
    }
}

enum RunEnd {
    NoChanges,
    Synced,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    store: MirrorStore,
    tokens: Arc<TokenProvider>,
    client: DocsClient,
    tracker: TaskTracker,
    probe: Arc<dyn MemoryProbe>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl SyncOrchestrator {
    /// `client` supplies the base URL and timeouts; each run swaps in a fresh bearer token.
    pub fn new(
        config: SyncConfig,
        store: MirrorStore,
        tokens: Arc<TokenProvider>,
        client: DocsClient,
    ) -> Self {
        Self {
            tracker: TaskTracker::new(store.clone()),
            config,
            store,
            tokens,
            client,
            probe: Arc::new(ProcStatusProbe),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub async fn start_full_sync(
        &self,
        project_id: &str,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        self.run(project_id, SyncMode::Full, options).await
    }

    pub async fn start_incremental_sync(
        &self,
        project_id: &str,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        self.run(project_id, SyncMode::Incremental, options).await
    }

    pub async fn get_sync_status(&self, task_uuid: Uuid) -> Result<Option<TaskRecord>, SyncError> {
        Ok(self.tracker.get(task_uuid).await?)
    }

    pub async fn get_sync_history(
        &self,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<TaskRecord>, SyncError> {
        Ok(self.tracker.history(project_id, limit).await?)
    }

    async fn run(
        &self,
        project_id: &str,
        requested: SyncMode,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        let _guard = RunGuard::acquire(&self.running, project_id)?;
        let token = self.tokens.valid_access_token().await?;
        let project = self
            .store
            .ensure_project(project_id, self.config.hub_id.as_deref())
            .await?;
        let mode = match (requested, project.last_sync_time) {
            (SyncMode::Incremental, None) => {
                info!(project_id, "no previous sync recorded, running a full sync");
                SyncMode::Full
            }
            _ => requested,
        };
        let include_attrs = options
            .include_attrs
            .unwrap_or(self.config.include_attributes);
        let parameters = json!({
            "requested_mode": requested.as_str(),
            "max_depth": options.max_depth,
            "include_attrs": include_attrs,
            "performance_mode": self.config.performance_mode.as_str(),
        });
        let handle = self.tracker.start(project_id, mode, &parameters).await?;
        info!(project_id, task_uuid = %handle.uuid(), mode = mode.as_str(), "sync started");

        let clock = Instant::now();
        let metrics = Arc::new(RunMetrics::new());
        let mut state = RunState::default();
        let outcome = self
            .execute(
                &project,
                mode,
                options.max_depth,
                include_attrs,
                &token,
                &metrics,
                &mut state,
            )
            .await;
        metrics.set_processing_time(clock.elapsed());

        self.finish(project_id, mode, handle, outcome, state, &metrics, clock)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        project: &ProjectRecord,
        mode: SyncMode,
        max_depth: Option<u32>,
        include_attrs: bool,
        token: &str,
        metrics: &Arc<RunMetrics>,
        state: &mut RunState,
    ) -> Result<RunEnd, SyncError> {
        let project_id = project.id.as_str();
        self.store.set_project_status(project_id, "running").await?;
        let fetcher = Fetcher::new(self.client.with_token(token), &self.config, metrics.clone());

        let hub_id = match project.hub_id.clone() {
            Some(hub_id) => hub_id,
            None => {
                let hub_id = fetcher.resolve_hub(project_id).await?;
                self.store.ensure_project(project_id, Some(&hub_id)).await?;
                hub_id
            }
        };
        let roots = fetcher.top_folders(&hub_id, project_id).await?;

        let last_sync = match mode {
            SyncMode::Incremental => project.last_sync_time,
            SyncMode::Full => None,
        };
        if mode == SyncMode::Incremental {
            if let ProjectCheck::Unchanged { newest_rollup } =
                branch_filter::project_level_check(&roots, last_sync)
            {
                metrics.candidates(roots.len() as u64, roots.len() as u64);
                info!(
                    project_id,
                    newest_rollup = %newest_rollup,
                    "project unchanged since last sync"
                );
                return Ok(RunEnd::NoChanges);
            }
        } else {
            let report = self.store.purge_project(project_id).await?;
            info!(project_id, ?report, "cleared mirrored project rows");
            state.deleted = Some(report);
        }

        let filtered = branch_filter::filter_roots(roots, last_sync);
        metrics.candidates(filtered.examined() as u64, filtered.skipped.len() as u64);
        metrics.calls_saved(filtered.calls_saved);
        state.details.insert("roots_examined".into(), json!(filtered.examined()));
        state.details.insert("roots_skipped".into(), json!(filtered.skipped.len()));
        state.details.insert("roots_needing_check".into(), json!(filtered.needs_check));

        let expansion = fetcher
            .expand(project_id, filtered.candidates, last_sync, max_depth)
            .await?;
        state.errors.extend(expansion.errors);
        state.details.insert("folders_skipped".into(), json!(expansion.skipped_folders));
        state.details.insert("folders_depth_limited".into(), json!(expansion.depth_limited));

        let changed: Vec<FileRecord> = match last_sync {
            Some(last_sync) => {
                let files = expansion.files;
                let classification =
                    tokio::task::spawn_blocking(move || classifier::classify(files, last_sync))
                        .await?;
                metrics.candidates(
                    classification.total() as u64,
                    classification.skipped.len() as u64,
                );
                state.details.insert(
                    "change_reasons".into(),
                    serde_json::to_value(classification.reason_counts())
                        .unwrap_or(Value::Null),
                );
                info!(
                    project_id,
                    changed = classification.needs_update.len(),
                    unchanged = classification.skipped.len(),
                    "classified files"
                );
                classification
                    .needs_update
                    .into_iter()
                    .map(|entry| entry.file)
                    .collect()
            }
            None => expansion.files,
        };

        let mut definitions: Vec<AttributeDefinitionRecord> = Vec::new();
        let mut known_definitions: HashMap<i64, AttributeDefinitionEntry> = HashMap::new();
        let mut detailed: HashMap<String, VersionCustomAttributes> = HashMap::new();
        if include_attrs {
            let folder_ids: Vec<String> =
                expansion.folders.iter().map(|folder| folder.id.clone()).collect();
            let fetched_definitions = self
                .folder_definitions(&fetcher, project_id, folder_ids)
                .await;
            for (folder_id, fetched) in fetched_definitions {
                match fetched {
                    Ok(entries) => {
                        definitions.extend(reconcile::folder_definitions(
                            project_id, &folder_id, &entries,
                        ));
                        for entry in entries {
                            known_definitions.entry(entry.id).or_insert(entry);
                        }
                    }
                    Err(failure) => state
                        .errors
                        .push(failure.into_item_error("attribute_definitions", &folder_id)?),
                }
            }

            let tips: Vec<String> = changed
                .iter()
                .filter_map(|file| file.tip_version_id.clone())
                .collect();
            let (results, errors) = fetcher.fetch_attributes(project_id, &tips).await?;
            state.errors.extend(errors);
            detailed = results
                .into_iter()
                .map(|entry| (entry.urn.clone(), entry))
                .collect();
        }

        let scheduler = Scheduler::new(&self.config, self.probe.clone(), metrics.clone());
        let buckets = scheduler.partition(changed, OffsetDateTime::now_utc(), |file| TierHints {
            size: file.tip_storage_size,
            attribute_count: file
                .tip_version_id
                .as_ref()
                .and_then(|tip| detailed.get(tip))
                .map_or(0, |d| d.custom_attributes.len()),
            modified: file.last_modified_time,
        });
        let fetcher = &fetcher;
        let enriched: Vec<(FileRecord, Result<Vec<RemoteVersion>, CallFailure>)> = scheduler
            .run_tiers(buckets, |file: FileRecord| async move {
                let versions = fetcher.fetch_versions(project_id, &file.id).await;
                (file, versions)
            })
            .await;

        let mut files = Vec::with_capacity(enriched.len());
        let mut versions: Vec<VersionRecord> = Vec::new();
        let mut values: Vec<AttributeValueRecord> = Vec::new();
        for (file, fetched) in enriched {
            let basic = match fetched {
                Ok(basic) => basic,
                Err(CallFailure::NotFound) => {
                    warn!(
                        file_id = %file.id,
                        "version list not found, synthesizing a default version"
                    );
                    Vec::new()
                }
                Err(failure) => {
                    state.errors.push(failure.into_item_error("versions", &file.id)?);
                    Vec::new()
                }
            };
            versions.extend(reconcile::reconcile_versions(&file, &basic, &detailed));
            if let Some(found) = file.tip_version_id.as_ref().and_then(|tip| detailed.get(tip)) {
                let (defs, vals) =
                    reconcile::reconcile_attributes(&file, found, &known_definitions);
                definitions.extend(defs);
                values.extend(vals);
            }
            files.push(file);
        }

        let writer = Writer::new(self.store.clone(), self.config.batch_size, metrics.clone());
        state.folders_synced = state.absorb(writer.upsert_folders(&expansion.folders).await);
        state.files_synced = state.absorb(writer.upsert_files(&files).await);
        state.versions_synced = state.absorb(writer.upsert_versions(&versions).await);
        state.absorb(writer.upsert_attribute_definitions(&definitions).await);
        state.attrs_synced = state.absorb(writer.upsert_attribute_values(&values).await);
        Ok(RunEnd::Synced)
    }

    async fn folder_definitions(
        &self,
        fetcher: &Fetcher,
        project_id: &str,
        folder_ids: Vec<String>,
    ) -> Vec<(String, Result<Vec<AttributeDefinitionEntry>, CallFailure>)> {
        stream::iter(folder_ids)
            .map(|folder_id| async move {
                let fetched = fetcher.folder_definitions(project_id, &folder_id).await;
                (folder_id, fetched)
            })
            .buffer_unordered(fetcher.max_in_flight())
            .collect()
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        project_id: &str,
        mode: SyncMode,
        handle: TaskHandle,
        outcome: Result<RunEnd, SyncError>,
        state: RunState,
        metrics: &RunMetrics,
        clock: Instant,
    ) -> Result<SyncResult, SyncError> {
        let task_uuid = handle.uuid();
        let snapshot = metrics.snapshot();
        let mut stats = serde_json::to_value(&snapshot)?;
        if let Value::Object(map) = &mut stats {
            map.extend(state.details.clone());
            if let Some(deleted) = state.deleted {
                map.insert("deleted".into(), serde_json::to_value(deleted)?);
            }
        }
        let summary = TaskSummary {
            folders_synced: state.folders_synced,
            files_synced: state.files_synced,
            versions_synced: state.versions_synced,
            attrs_synced: state.attrs_synced,
            errors: state.errors.clone(),
            performance_stats: stats,
        };

        let (status, error_message) = match outcome {
            Ok(end) => {
                let started_at = handle.started_at();
                match end {
                    RunEnd::NoChanges => {
                        self.store.set_project_status(project_id, "completed").await?;
                    }
                    RunEnd::Synced => {
                        self.store
                            .finalize_project(project_id, started_at, mode == SyncMode::Full)
                            .await?;
                    }
                }
                handle.complete(&summary).await?;
                let status = match end {
                    RunEnd::NoChanges => RunStatus::NoChanges,
                    RunEnd::Synced => RunStatus::Success,
                };
                (status, None)
            }
            Err(err) => {
                error!(project_id, task_uuid = %task_uuid, error = %err, "sync failed");
                if let Err(status_err) = self.store.set_project_status(project_id, "failed").await {
                    warn!(
                        project_id,
                        error = %status_err,
                        "could not record failed project status"
                    );
                }
                let message = err.to_string();
                handle.fail(&message, &summary).await?;
                (RunStatus::Error, Some(message))
            }
        };

        let result = SyncResult {
            task_uuid,
            project_id: project_id.to_string(),
            mode,
            status,
            folders_synced: state.folders_synced,
            files_synced: state.files_synced,
            versions_synced: state.versions_synced,
            attrs_synced: state.attrs_synced,
            duration_seconds: clock.elapsed().as_secs_f64(),
            optimization_efficiency_percent: snapshot.optimization_efficiency,
            errors: state.errors,
            error_message,
            deleted: state.deleted,
            metrics: snapshot,
        };
        info!(
            project_id,
            task_uuid = %task_uuid,
            status = ?result.status,
            folders = result.folders_synced,
            files = result.files_synced,
            versions = result.versions_synced,
            attrs = result.attrs_synced,
            errors = result.errors.len(),
            efficiency = result.optimization_efficiency_percent,
            "sync finished"
        );
        Ok(result)
    }
}

/// Holds a project's slot in the running set for the duration of one run.
struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    project_id: String,
}

impl RunGuard {
    fn acquire(running: &Arc<Mutex<HashSet<String>>>, project_id: &str) -> Result<Self, SyncError> {
        let mut active = running.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(project_id.to_string()) {
            return Err(SyncError::AlreadyRunning(project_id.to_string()));
        }
        Ok(Self {
            running: running.clone(),
            project_id: project_id.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.project_id);
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
