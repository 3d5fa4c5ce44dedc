use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::outcome::FetchOutcome;
use crate::types::{
    AttributeDefinitionEntry, ContentsPage, HubRef, ProjectRef, RemoteFolder, RemoteItem,
    RemoteVersion, VersionCustomAttributes,
};

const DEFAULT_BASE_URL: &str = "https://developer.api.autodesk.com";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DocsError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    InvalidBaseUrl,
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    NotFound,
    Transient,
    Permanent,
}

/// Client for the hierarchical document API. Cloning shares the connection pool.
#[derive(Clone)]
pub struct DocsClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DocsClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DocsError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DocsError> {
        Self::with_timeouts(
            base_url,
            token,
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_READ_TIMEOUT,
        )
    }

    pub fn with_timeouts(
        base_url: &str,
        token: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DocsError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Same connection pool and base url, different bearer token.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.into(),
        }
    }

    pub async fn list_hubs(&self) -> FetchOutcome<Vec<HubRef>> {
        let url = match self.endpoint(&["project", "v1", "hubs"]) {
            Ok(url) => url,
            Err(err) => return FetchOutcome::Fatal(err),
        };
        self.execute::<DataEnvelope<HubRef>>(self.http.get(url))
            .await
            .map(|envelope| envelope.data)
    }

    pub async fn list_hub_projects(&self, hub_id: &str) -> FetchOutcome<Vec<ProjectRef>> {
        let url = match self.endpoint(&["project", "v1", "hubs", hub_id, "projects"]) {
            Ok(url) => url,
            Err(err) => return FetchOutcome::Fatal(err),
        };
        self.execute::<DataEnvelope<ProjectRef>>(self.http.get(url))
            .await
            .map(|envelope| envelope.data)
    }

    pub async fn top_folders(
        &self,
        hub_id: &str,
        project_id: &str,
    ) -> FetchOutcome<Vec<RemoteFolder>> {
        let url = match self.endpoint(&[
            "project",
            "v1",
            "hubs",
            hub_id,
            "projects",
            project_id,
            "topFolders",
        ]) {
            Ok(url) => url,
            Err(err) => return FetchOutcome::Fatal(err),
        };
        self.execute::<DataEnvelope<RemoteFolder>>(self.http.get(url))
            .await
            .map(|envelope| envelope.data)
    }

    /// Fetches one page of a folder listing; pass the previous page's `next` link to continue.
    pub async fn folder_contents_page(
        &self,
        project_id: &str,
        folder_id: &str,
        page_url: Option<&str>,
    ) -> FetchOutcome<ContentsPage> {
        let url = match page_url {
            Some(next) => Url::parse(next).map_err(DocsError::from),
            None => self.endpoint(&[
                "data", "v1", "projects", project_id, "folders", folder_id, "contents",
            ]),
        };
        let url = match url {
            Ok(url) => url,
            Err(err) => return FetchOutcome::Fatal(err),
        };
        self.execute::<ContentsEnvelope>(self.http.get(url))
            .await
            .map(ContentsEnvelope::into_page)
    }

    pub async fn item_versions(
        &self,
        project_id: &str,
        item_id: &str,
    ) -> FetchOutcome<Vec<RemoteVersion>> {
        let segments = [
            "data", "v1", "projects", project_id, "items", item_id, "versions",
        ];
        let url = match self.endpoint(&segments) {
            Ok(url) => url,
            Err(err) => return FetchOutcome::Fatal(err),
        };
        self.execute::<DataEnvelope<RemoteVersion>>(self.http.get(url))
            .await
            .map(|envelope| envelope.data)
    }

    pub async fn folder_attribute_definitions(
        &self,
        project_id: &str,
        folder_id: &str,
    ) -> FetchOutcome<Vec<AttributeDefinitionEntry>> {
        let url = match self.endpoint(&[
            "bim360",
            "docs",
            "v1",
            "projects",
            docs_project_id(project_id),
            "folders",
            folder_id,
            "custom-attribute-definitions",
        ]) {
            Ok(url) => url,
            Err(err) => return FetchOutcome::Fatal(err),
        };
        self.execute::<ResultsEnvelope<AttributeDefinitionEntry>>(self.http.get(url))
            .await
            .map(|envelope| envelope.results)
    }

    /// Looks up custom attributes for a batch of version ids in one round trip.
    pub async fn batch_get_attributes(
        &self,
        project_id: &str,
        version_ids: &[String],
    ) -> FetchOutcome<Vec<VersionCustomAttributes>> {
        let url = match self.endpoint(&[
            "bim360",
            "docs",
            "v1",
            "projects",
            docs_project_id(project_id),
            "versions:batch-get",
        ]) {
            Ok(url) => url,
            Err(err) => return FetchOutcome::Fatal(err),
        };
        let request = self.http.post(url).json(&json!({ "urns": version_ids }));
        self.execute::<ResultsEnvelope<VersionCustomAttributes>>(request)
            .await
            .map(|envelope| envelope.results)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DocsError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DocsError::InvalidBaseUrl)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> FetchOutcome<T> {
        let response = match request.bearer_auth(&self.token).send().await {
            Ok(response) => response,
            Err(err) => return FetchOutcome::from_error(DocsError::Request(err), None),
        };
        let status = response.status();
        if status.is_success() {
            return match response.json::<T>().await {
                Ok(value) => FetchOutcome::Ok(value),
                Err(err) => FetchOutcome::from_error(DocsError::Request(err), None),
            };
        }
        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        FetchOutcome::from_error(DocsError::Api { status, body }, retry_after)
    }
}

impl DocsError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DocsError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub(crate) fn is_connection_level(&self) -> bool {
        match self {
            DocsError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}

/// Project ids on the `bim360/docs` endpoints drop the `b.` prefix.
fn docs_project_id(project_id: &str) -> &str {
    project_id.strip_prefix("b.").unwrap_or(project_id)
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ResultsEnvelope<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentEntry {
    #[serde(rename = "folders")]
    Folder(RemoteFolder),
    #[serde(rename = "items")]
    Item(RemoteItem),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum IncludedEntry {
    #[serde(rename = "versions")]
    Version(RemoteVersion),
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct ContentsEnvelope {
    #[serde(default)]
    data: Vec<ContentEntry>,
    #[serde(default)]
    included: Vec<IncludedEntry>,
    #[serde(default)]
    links: Links,
}

impl ContentsEnvelope {
    fn into_page(self) -> ContentsPage {
        let mut page = ContentsPage {
            next: self.links.next.map(|link| link.href),
            ..ContentsPage::default()
        };
        for entry in self.data {
            match entry {
                ContentEntry::Folder(folder) => page.folders.push(folder),
                ContentEntry::Item(item) => page.items.push(item),
                ContentEntry::Other => {}
            }
        }
        for entry in self.included {
            if let IncludedEntry::Version(version) = entry {
                page.included.push(version);
            }
        }
        page
    }
}
