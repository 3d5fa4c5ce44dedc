use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use docmirror_core::{
    AttributeDefinitionEntry, ContentsPage, DocsClient, DocsError, FetchOutcome, RemoteFolder,
    RemoteItem, RemoteVersion, VersionCustomAttributes,
};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::branch_filter::{self, BranchDecision};
use super::error::{ItemError, ItemErrorKind, SyncError};
use super::metrics::RunMetrics;
use super::model::{FileRecord, FolderRecord};
use super::timestamp;
use crate::config::SyncConfig;

/// Why a remote call produced no value after retries.
#[derive(Debug)]
pub enum CallFailure {
    NotFound,
    Exhausted {
        kind: ItemErrorKind,
        attempts: u32,
        message: String,
    },
    Fatal(DocsError),
}

impl CallFailure {
    /// Per-item error for everything except authentication failures, which end the run.
    pub fn into_item_error(self, scope: &str, id: &str) -> Result<ItemError, SyncError> {
        match self {
            CallFailure::NotFound => Ok(ItemError::new(
                scope,
                id,
                ItemErrorKind::NotFound,
                "not found on the remote",
            )),
            CallFailure::Exhausted {
                kind,
                attempts,
                message,
            } => Ok(ItemError::new(
                scope,
                id,
                kind,
                format!("gave up after {attempts} attempts: {message}"),
            )),
            CallFailure::Fatal(err) if err.is_auth() => Err(SyncError::Remote(err)),
            CallFailure::Fatal(err) => Ok(ItemError::new(
                scope,
                id,
                ItemErrorKind::Remote,
                err.to_string(),
            )),
        }
    }
}

/// A folder waiting to be listed.
#[derive(Debug, Clone)]
struct WorkItem {
    folder: RemoteFolder,
    parent_id: Option<String>,
    depth: u32,
    path: String,
}

/// Everything discovered below the candidate roots.
#[derive(Debug, Default)]
pub struct Expansion {
    /// Every folder the walk reached, including those whose listing failed.
    pub folders: Vec<FolderRecord>,
    pub files: Vec<FileRecord>,
    pub skipped_folders: usize,
    pub depth_limited: usize,
    pub errors: Vec<ItemError>,
}

pub struct Fetcher {
    client: DocsClient,
    backoff: Backoff,
    max_attempts: u32,
    inter_call_delay: Duration,
    max_in_flight: usize,
    attribute_batch_size: usize,
    metrics: Arc<RunMetrics>,
}

impl Fetcher {
    pub fn new(client: DocsClient, config: &SyncConfig, metrics: Arc<RunMetrics>) -> Self {
        Self {
            client,
            backoff: Backoff::new(
                config.api_retry_backoff_base,
                config.api_retry_backoff_max,
                config.api_retry_jitter,
            ),
            max_attempts: config.api_retry_count.max(1),
            inter_call_delay: config.inter_call_delay,
            max_in_flight: config.max_in_flight.max(1),
            attribute_batch_size: config.attribute_batch_size.max(1),
            metrics,
        }
    }

    /// Runs one remote call, retrying rate limits and transient failures with backoff.
    /// `api_retry_count` bounds the total number of attempts, and every retryable outcome waits
    /// out its backoff, the last one included, before the call is given up.
    pub async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetchOutcome<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if !self.inter_call_delay.is_zero() {
                tokio::time::sleep(self.inter_call_delay).await;
            }
            self.metrics.api_call();
            let (kind, message, retry_after) = match op().await {
                FetchOutcome::Ok(value) => return Ok(value),
                FetchOutcome::NotFound => return Err(CallFailure::NotFound),
                FetchOutcome::Fatal(err) => return Err(CallFailure::Fatal(err)),
                FetchOutcome::RateLimited { retry_after } => {
                    self.metrics.rate_limited();
                    (
                        ItemErrorKind::RateLimited,
                        "rate limited".to_string(),
                        retry_after,
                    )
                }
                FetchOutcome::Transient(message) => (ItemErrorKind::Transient, message, None),
            };
            let delay = self.backoff.delay_after(attempt, retry_after);
            debug!(
                call = what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %message,
                "backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            if attempt >= self.max_attempts {
                warn!(call = what, attempts = attempt, %message, "retries exhausted");
                return Err(CallFailure::Exhausted {
                    kind,
                    attempts: attempt,
                    message,
                });
            }
            self.metrics.retry();
        }
    }

    /// Finds the hub that contains `project_id`.
    pub async fn resolve_hub(&self, project_id: &str) -> Result<String, SyncError> {
        let hubs = self
            .call("list_hubs", || self.client.list_hubs())
            .await
            .map_err(|failure| hub_failure(project_id, failure))?;
        for hub in hubs {
            let projects = match self
                .call("list_hub_projects", || self.client.list_hub_projects(&hub.id))
                .await
            {
                Ok(projects) => projects,
                Err(CallFailure::Fatal(err)) if err.is_auth() => return Err(err.into()),
                Err(failure) => {
                    warn!(hub_id = %hub.id, ?failure, "skipping unreadable hub");
                    continue;
                }
            };
            if projects.iter().any(|p| same_project(&p.id, project_id)) {
                info!(hub_id = %hub.id, project_id, "resolved hub");
                return Ok(hub.id);
            }
        }
        Err(SyncError::ProjectNotFound(project_id.to_string()))
    }

    pub async fn top_folders(
        &self,
        hub_id: &str,
        project_id: &str,
    ) -> Result<Vec<RemoteFolder>, SyncError> {
        let folders = self
            .call("top_folders", || self.client.top_folders(hub_id, project_id))
            .await
            .map_err(|failure| match failure {
                CallFailure::Fatal(err) if err.is_auth() => SyncError::Remote(err),
                other => SyncError::NoTopFolders(project_id.to_string(), format!("{other:?}")),
            })?;
        if folders.is_empty() {
            return Err(SyncError::NoTopFolders(
                project_id.to_string(),
                "the project has no top-level folders".to_string(),
            ));
        }
        Ok(folders)
    }

    /// Walks the tree below `roots` with an explicit worklist, listing up to `max_in_flight`
    /// folders at once. Each discovered child folder is pruned again against `last_sync`, and
    /// folders at depth `max_depth` or deeper are not listed.
    pub async fn expand(
        &self,
        project_id: &str,
        roots: Vec<RemoteFolder>,
        last_sync: Option<OffsetDateTime>,
        max_depth: Option<u32>,
    ) -> Result<Expansion, SyncError> {
        let mut expansion = Expansion::default();
        let mut queue: VecDeque<WorkItem> = roots
            .into_iter()
            .map(|folder| WorkItem {
                path: format!("/{}", folder.name()),
                folder,
                parent_id: None,
                depth: 0,
            })
            .collect();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.max_in_flight {
                let Some(item) = queue.pop_front() else {
                    break;
                };
                if max_depth.is_some_and(|limit| item.depth >= limit) {
                    expansion.depth_limited += 1;
                    continue;
                }
                expansion.folders.push(folder_record(project_id, &item));
                in_flight.push(self.list_folder(project_id, item));
            }
            let Some((item, listing)) = in_flight.next().await else {
                break;
            };

            let page = match listing {
                Ok(page) => page,
                Err(failure) => {
                    let error = failure.into_item_error("folder", &item.folder.id)?;
                    warn!(folder_id = %item.folder.id, kind = ?error.kind, "folder listing failed");
                    expansion.errors.push(error);
                    continue;
                }
            };

            let tips: HashMap<&str, &RemoteVersion> = page
                .included
                .iter()
                .map(|version| (version.id.as_str(), version))
                .collect();
            for remote in &page.items {
                let tip = remote.relationships.tip_id().and_then(|id| tips.get(id).copied());
                expansion
                    .files
                    .push(file_record(project_id, &item, remote, tip));
            }

            let mut children = 0u64;
            let mut skipped = 0u64;
            for child in page.folders {
                children += 1;
                match branch_filter::decide_folder(&child, last_sync) {
                    BranchDecision::Skip { calls_saved } => {
                        skipped += 1;
                        self.metrics.calls_saved(calls_saved);
                        expansion.skipped_folders += 1;
                        debug!(folder_id = %child.id, calls_saved, "skipping unchanged subtree");
                    }
                    BranchDecision::NeedsCheck | BranchDecision::Expand => {
                        queue.push_back(WorkItem {
                            path: format!("{}/{}", item.path, child.name()),
                            parent_id: Some(item.folder.id.clone()),
                            depth: item.depth + 1,
                            folder: child,
                        });
                    }
                }
            }
            self.metrics.candidates(children, skipped);
        }

        Ok(expansion)
    }

    async fn list_folder(
        &self,
        project_id: &str,
        item: WorkItem,
    ) -> (WorkItem, Result<ContentsPage, CallFailure>) {
        let mut merged = ContentsPage::default();
        let mut next: Option<String> = None;
        loop {
            let page_url = next.take();
            let page = self
                .call("folder_contents", || {
                    self.client
                        .folder_contents_page(project_id, &item.folder.id, page_url.as_deref())
                })
                .await;
            match page {
                Ok(page) => {
                    merged.folders.extend(page.folders);
                    merged.items.extend(page.items);
                    merged.included.extend(page.included);
                    match page.next {
                        Some(url) => next = Some(url),
                        None => break,
                    }
                }
                Err(failure) => return (item, Err(failure)),
            }
        }
        (item, Ok(merged))
    }

    pub async fn fetch_versions(
        &self,
        project_id: &str,
        item_id: &str,
    ) -> Result<Vec<RemoteVersion>, CallFailure> {
        self.call("item_versions", || self.client.item_versions(project_id, item_id))
            .await
    }

    /// Batch attribute lookup, `attribute_batch_size` version ids per call. Failed chunks are
    /// reported and the remaining chunks still run.
    pub async fn fetch_attributes(
        &self,
        project_id: &str,
        version_ids: &[String],
    ) -> Result<(Vec<VersionCustomAttributes>, Vec<ItemError>), SyncError> {
        let mut results = Vec::new();
        let mut errors = Vec::new();
        for chunk in version_ids.chunks(self.attribute_batch_size) {
            match self
                .call("batch_get_attributes", || {
                    self.client.batch_get_attributes(project_id, chunk)
                })
                .await
            {
                Ok(batch) => results.extend(batch),
                Err(CallFailure::NotFound) => {}
                Err(failure) => {
                    let label = format!("{} versions starting at {}", chunk.len(), chunk[0]);
                    errors.push(failure.into_item_error("attributes", &label)?);
                }
            }
        }
        Ok((results, errors))
    }

    /// Attribute definitions attached to one folder. A folder without any answers 404.
    pub async fn folder_definitions(
        &self,
        project_id: &str,
        folder_id: &str,
    ) -> Result<Vec<AttributeDefinitionEntry>, CallFailure> {
        match self
            .call("folder_attribute_definitions", || {
                self.client.folder_attribute_definitions(project_id, folder_id)
            })
            .await
        {
            Err(CallFailure::NotFound) => Ok(Vec::new()),
            other => other,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

fn hub_failure(project_id: &str, failure: CallFailure) -> SyncError {
    match failure {
        CallFailure::Fatal(err) => SyncError::Remote(err),
        _ => SyncError::ProjectNotFound(project_id.to_string()),
    }
}

/// Hub listings use the `b.` prefixed form of a project id; the data endpoints accept either.
fn same_project(listed: &str, wanted: &str) -> bool {
    listed.strip_prefix("b.").unwrap_or(listed) == wanted.strip_prefix("b.").unwrap_or(wanted)
}

fn extension_metadata(extension: &Option<Value>) -> Value {
    match extension {
        Some(extension) => json!({ "extension": extension }),
        None => json!({}),
    }
}

fn folder_record(project_id: &str, item: &WorkItem) -> FolderRecord {
    let attrs = &item.folder.attributes;
    FolderRecord {
        id: item.folder.id.clone(),
        project_id: project_id.to_string(),
        parent_id: item.parent_id.clone(),
        name: item.folder.name().to_string(),
        path: item.path.clone(),
        depth: item.depth,
        object_count: attrs.object_count,
        create_time: timestamp::parse_opt(attrs.create_time.as_deref()),
        create_user_id: attrs.create_user_id.clone(),
        create_user_name: attrs.create_user_name.clone(),
        last_modified_time: timestamp::parse_opt(attrs.last_modified_time.as_deref()),
        last_modified_user_id: attrs.last_modified_user_id.clone(),
        last_modified_user_name: attrs.last_modified_user_name.clone(),
        last_modified_time_rollup: timestamp::parse_opt(
            attrs.last_modified_time_rollup.as_deref(),
        ),
        hidden: attrs.hidden,
        metadata: extension_metadata(&attrs.extension),
    }
}

fn file_record(
    project_id: &str,
    parent: &WorkItem,
    item: &RemoteItem,
    tip: Option<&RemoteVersion>,
) -> FileRecord {
    let attrs = &item.attributes;
    let name = attrs
        .display_name
        .clone()
        .or_else(|| tip.and_then(|v| v.attributes.name.clone()))
        .unwrap_or_else(|| item.id.clone());
    let file_type = tip
        .and_then(|v| v.attributes.file_type.clone())
        .or_else(|| {
            name.rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
        });
    FileRecord {
        id: item.id.clone(),
        project_id: project_id.to_string(),
        parent_folder_id: Some(parent.folder.id.clone()),
        path: format!("{}/{}", parent.path, name),
        name,
        file_type,
        create_time: timestamp::parse_opt(attrs.create_time.as_deref()),
        create_user_id: attrs.create_user_id.clone(),
        create_user_name: attrs.create_user_name.clone(),
        last_modified_raw: attrs.last_modified_time.clone(),
        last_modified_time: timestamp::parse_opt(attrs.last_modified_time.as_deref()),
        last_modified_user_id: attrs.last_modified_user_id.clone(),
        last_modified_user_name: attrs.last_modified_user_name.clone(),
        hidden: attrs.hidden,
        reserved: attrs.reserved,
        tip_version_id: item
            .relationships
            .tip_id()
            .map(str::to_string)
            .or_else(|| tip.map(|v| v.id.clone())),
        tip_storage_size: tip.and_then(|v| v.attributes.storage_size),
        metadata: extension_metadata(&attrs.extension),
    }
}

#[cfg(test)]
#[path = "fetcher_tests.rs"]
mod tests;
