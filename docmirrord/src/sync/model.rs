use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use super::timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(SyncMode::Full),
            "incremental" => Some(SyncMode::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectRecord {
    pub id: String,
    pub hub_id: Option<String>,
    pub last_sync_time: Option<OffsetDateTime>,
    pub last_full_sync_time: Option<OffsetDateTime>,
    pub sync_status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FolderRecord {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub path: String,
    pub depth: u32,
    pub object_count: Option<u64>,
    pub create_time: Option<OffsetDateTime>,
    pub create_user_id: Option<String>,
    pub create_user_name: Option<String>,
    pub last_modified_time: Option<OffsetDateTime>,
    pub last_modified_user_id: Option<String>,
    pub last_modified_user_name: Option<String>,
    pub last_modified_time_rollup: Option<OffsetDateTime>,
    pub hidden: bool,
    pub metadata: Value,
}

/// A file as discovered in a folder listing. `last_modified_raw` keeps the remote string so the
/// classifier can tell a missing timestamp from a malformed one.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: String,
    pub project_id: String,
    pub parent_folder_id: Option<String>,
    pub name: String,
    pub path: String,
    pub file_type: Option<String>,
    pub create_time: Option<OffsetDateTime>,
    pub create_user_id: Option<String>,
    pub create_user_name: Option<String>,
    pub last_modified_raw: Option<String>,
    pub last_modified_time: Option<OffsetDateTime>,
    pub last_modified_user_id: Option<String>,
    pub last_modified_user_name: Option<String>,
    pub hidden: bool,
    pub reserved: bool,
    pub tip_version_id: Option<String>,
    pub tip_storage_size: Option<u64>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub id: String,
    pub file_id: String,
    pub project_id: String,
    pub version_number: u32,
    pub name: Option<String>,
    pub storage_urn: Option<String>,
    pub storage_size: Option<u64>,
    pub mime_type: Option<String>,
    pub file_type: Option<String>,
    pub process_state: Option<String>,
    pub create_time: Option<OffsetDateTime>,
    pub create_user_id: Option<String>,
    pub create_user_name: Option<String>,
    pub last_modified_time: Option<OffsetDateTime>,
    pub synthesized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeScope {
    Project,
    Folder(String),
}

impl AttributeScope {
    pub fn folder_key(&self) -> &str {
        match self {
            AttributeScope::Project => "",
            AttributeScope::Folder(id) => id.as_str(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AttributeScope::Project => "project",
            AttributeScope::Folder(_) => "folder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    String,
    Date,
    Number,
    Boolean,
    Array,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Date => "date",
            AttributeType::Number => "number",
            AttributeType::Boolean => "boolean",
            AttributeType::Array => "array",
        }
    }

    /// Unknown remote types are stored as strings.
    pub fn from_remote(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("date") => AttributeType::Date,
            Some("number" | "numeric" | "integer" | "float") => AttributeType::Number,
            Some("boolean" | "bool") => AttributeType::Boolean,
            Some("array" | "list" | "dropdown") => AttributeType::Array,
            _ => AttributeType::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDefinitionRecord {
    pub attr_id: i64,
    pub project_id: String,
    pub scope: AttributeScope,
    pub inherit_to_subfolders: bool,
    pub name: String,
    pub data_type: AttributeType,
    pub array_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Date(OffsetDateTime),
    Number(f64),
    Boolean(bool),
    Array(Vec<String>),
}

impl AttributeValue {
    /// Interprets a raw remote value according to its declared type. Values that do not fit the
    /// declared type are kept as strings; `null` yields `None`.
    pub fn from_remote(data_type: AttributeType, raw: &Value) -> Option<Self> {
        if raw.is_null() {
            return None;
        }
        let text = match raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let typed = match data_type {
            AttributeType::String => None,
            AttributeType::Date => raw
                .as_str()
                .and_then(|s| timestamp::parse(s).ok())
                .map(AttributeValue::Date),
            AttributeType::Number => raw
                .as_f64()
                .or_else(|| raw.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
                .filter(|n| n.is_finite())
                .map(AttributeValue::Number),
            AttributeType::Boolean => match raw {
                Value::Bool(b) => Some(AttributeValue::Boolean(*b)),
                _ => parse_bool(&text).map(AttributeValue::Boolean),
            },
            AttributeType::Array => match raw {
                Value::Array(items) => Some(AttributeValue::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect(),
                )),
                Value::String(s) => Some(AttributeValue::Array(vec![s.clone()])),
                _ => None,
            },
        };
        Some(typed.unwrap_or(AttributeValue::String(text)))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValueRecord {
    pub file_id: String,
    pub version_id: Option<String>,
    pub project_id: String,
    pub attr_id: i64,
    pub value: Option<AttributeValue>,
}
