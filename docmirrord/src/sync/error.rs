use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::store::StoreError;
use super::tracker::TrackerError;
use crate::token_provider::TokenProviderError;

/// Failures that stop a run. Anything scoped to a single folder or record is an [`ItemError`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already running for project {0}")]
    AlreadyRunning(String),
    #[error("no access token available: {0}")]
    Token(#[from] TokenProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("task tracking error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("remote api error: {0}")]
    Remote(#[from] docmirror_core::DocsError),
    #[error("project {0} was not found in any accessible hub")]
    ProjectNotFound(String),
    #[error("no reachable top-level folders for project {0}: {1}")]
    NoTopFolders(String, String),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    Transient,
    RateLimited,
    NotFound,
    Remote,
    Persistence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub scope: String,
    pub id: String,
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(
        scope: impl Into<String>,
        id: impl Into<String>,
        kind: ItemErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            id: id.into(),
            kind,
            message: message.into(),
        }
    }
}
