//! Builds storage records for versions and custom attributes from the three sources the remote
//! offers. Precedence is always detailed (batch attribute lookup) over basic (version listing)
//! over defaults derived from the file itself.

use std::collections::HashMap;

use docmirror_core::{AttributeDefinitionEntry, RemoteVersion, VersionCustomAttributes};

use super::model::{
    AttributeDefinitionRecord, AttributeScope, AttributeType, AttributeValue,
    AttributeValueRecord, FileRecord, VersionRecord,
};
use super::timestamp;

/// Version rows for one file. A file whose listing returned no versions gets a single
/// synthesized `<file_id>_v1` row so it always has a current version.
pub fn reconcile_versions(
    file: &FileRecord,
    basic: &[RemoteVersion],
    detailed: &HashMap<String, VersionCustomAttributes>,
) -> Vec<VersionRecord> {
    if basic.is_empty() {
        return vec![synthesize_version(file)];
    }
    basic
        .iter()
        .map(|version| merge_version(file, version, detailed.get(&version.id)))
        .collect()
}

fn merge_version(
    file: &FileRecord,
    version: &RemoteVersion,
    detailed: Option<&VersionCustomAttributes>,
) -> VersionRecord {
    let attrs = &version.attributes;
    let name = detailed
        .and_then(|d| d.name.clone().or_else(|| d.title.clone()))
        .or_else(|| attrs.name.clone())
        .or_else(|| attrs.display_name.clone())
        .or_else(|| Some(file.name.clone()));
    VersionRecord {
        id: version.id.clone(),
        file_id: file.id.clone(),
        project_id: file.project_id.clone(),
        version_number: attrs
            .version_number
            .or_else(|| version_from_urn(&version.id))
            .unwrap_or(1),
        name,
        storage_urn: detailed
            .and_then(|d| d.storage_urn.clone())
            .or_else(|| version.relationships.storage_id().map(str::to_string)),
        storage_size: detailed
            .and_then(|d| d.storage_size)
            .or(attrs.storage_size),
        mime_type: detailed
            .and_then(|d| d.mime_type.clone())
            .or_else(|| attrs.mime_type.clone()),
        file_type: attrs.file_type.clone().or_else(|| file.file_type.clone()),
        process_state: version.process_state().map(str::to_string),
        create_time: timestamp::parse_opt(attrs.create_time.as_deref()),
        create_user_id: attrs.create_user_id.clone(),
        create_user_name: attrs.create_user_name.clone(),
        last_modified_time: timestamp::parse_opt(attrs.last_modified_time.as_deref()),
        synthesized: false,
    }
}

fn synthesize_version(file: &FileRecord) -> VersionRecord {
    VersionRecord {
        id: format!("{}_v1", file.id),
        file_id: file.id.clone(),
        project_id: file.project_id.clone(),
        version_number: 1,
        name: Some(file.name.clone()),
        storage_urn: None,
        storage_size: file.tip_storage_size,
        mime_type: None,
        file_type: file.file_type.clone(),
        process_state: None,
        create_time: file.create_time,
        create_user_id: file.create_user_id.clone(),
        create_user_name: file.create_user_name.clone(),
        last_modified_time: file.last_modified_time,
        synthesized: true,
    }
}

/// Version ids look like `urn:adsk.wipprod:fs.file:vf.abc?version=3`.
fn version_from_urn(urn: &str) -> Option<u32> {
    let (_, query) = urn.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("version="))
        .and_then(|n| n.parse().ok())
}

/// Project-scoped definitions and the values they carry for one file's tip version.
///
/// The batch lookup reports type and name inline; when it omits them the folder's definition
/// list fills in, and a missing type falls back to string.
pub fn reconcile_attributes(
    file: &FileRecord,
    detailed: &VersionCustomAttributes,
    folder_definitions: &HashMap<i64, AttributeDefinitionEntry>,
) -> (Vec<AttributeDefinitionRecord>, Vec<AttributeValueRecord>) {
    let mut definitions = Vec::with_capacity(detailed.custom_attributes.len());
    let mut values = Vec::with_capacity(detailed.custom_attributes.len());
    for entry in &detailed.custom_attributes {
        let known = folder_definitions.get(&entry.id);
        let data_type = AttributeType::from_remote(
            entry
                .kind
                .as_deref()
                .or_else(|| known.and_then(|d| d.kind.as_deref())),
        );
        let name = entry
            .name
            .clone()
            .or_else(|| known.and_then(|d| d.name.clone()))
            .unwrap_or_else(|| format!("attribute_{}", entry.id));
        definitions.push(AttributeDefinitionRecord {
            attr_id: entry.id,
            project_id: file.project_id.clone(),
            scope: AttributeScope::Project,
            inherit_to_subfolders: true,
            name,
            data_type,
            array_values: entry
                .array_values
                .clone()
                .or_else(|| known.and_then(|d| d.array_values.clone())),
        });
        values.push(AttributeValueRecord {
            file_id: file.id.clone(),
            version_id: Some(detailed.urn.clone()),
            project_id: file.project_id.clone(),
            attr_id: entry.id,
            value: AttributeValue::from_remote(data_type, &entry.value),
        });
    }
    (definitions, values)
}

/// Definitions attached directly to a folder. They do not inherit.
pub fn folder_definitions(
    project_id: &str,
    folder_id: &str,
    entries: &[AttributeDefinitionEntry],
) -> Vec<AttributeDefinitionRecord> {
    entries
        .iter()
        .map(|entry| AttributeDefinitionRecord {
            attr_id: entry.id,
            project_id: project_id.to_string(),
            scope: AttributeScope::Folder(folder_id.to_string()),
            inherit_to_subfolders: false,
            name: entry
                .name
                .clone()
                .unwrap_or_else(|| format!("attribute_{}", entry.id)),
            data_type: AttributeType::from_remote(entry.kind.as_deref()),
            array_values: entry.array_values.clone(),
        })
        .collect()
}
