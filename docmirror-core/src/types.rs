use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResourceIdentifier {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelationshipRef {
    #[serde(default)]
    pub data: Option<ResourceIdentifier>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Relationships {
    #[serde(default)]
    pub parent: Option<RelationshipRef>,
    #[serde(default)]
    pub tip: Option<RelationshipRef>,
    #[serde(default)]
    pub item: Option<RelationshipRef>,
    #[serde(default)]
    pub storage: Option<RelationshipRef>,
}

impl Relationships {
    fn target(relation: &Option<RelationshipRef>) -> Option<&str> {
        relation
            .as_ref()
            .and_then(|r| r.data.as_ref())
            .map(|data| data.id.as_str())
    }

    pub fn parent_id(&self) -> Option<&str> {
        Self::target(&self.parent)
    }

    pub fn tip_id(&self) -> Option<&str> {
        Self::target(&self.tip)
    }

    pub fn item_id(&self) -> Option<&str> {
        Self::target(&self.item)
    }

    pub fn storage_id(&self) -> Option<&str> {
        Self::target(&self.storage)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectRef {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderAttributes {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub create_user_id: Option<String>,
    #[serde(default)]
    pub create_user_name: Option<String>,
    #[serde(default)]
    pub last_modified_time: Option<String>,
    #[serde(default)]
    pub last_modified_user_id: Option<String>,
    #[serde(default)]
    pub last_modified_user_name: Option<String>,
    #[serde(default)]
    pub last_modified_time_rollup: Option<String>,
    #[serde(default)]
    pub object_count: Option<u64>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub extension: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteFolder {
    pub id: String,
    #[serde(default)]
    pub attributes: FolderAttributes,
    #[serde(default)]
    pub relationships: Relationships,
}

impl RemoteFolder {
    pub fn name(&self) -> &str {
        self.attributes
            .name
            .as_deref()
            .or(self.attributes.display_name.as_deref())
            .unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAttributes {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub create_user_id: Option<String>,
    #[serde(default)]
    pub create_user_name: Option<String>,
    #[serde(default)]
    pub last_modified_time: Option<String>,
    #[serde(default)]
    pub last_modified_user_id: Option<String>,
    #[serde(default)]
    pub last_modified_user_name: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub extension: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteItem {
    pub id: String,
    #[serde(default)]
    pub attributes: ItemAttributes,
    #[serde(default)]
    pub relationships: Relationships,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionAttributes {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version_number: Option<u32>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default)]
    pub create_user_id: Option<String>,
    #[serde(default)]
    pub create_user_name: Option<String>,
    #[serde(default)]
    pub last_modified_time: Option<String>,
    #[serde(default)]
    pub last_modified_user_id: Option<String>,
    #[serde(default)]
    pub last_modified_user_name: Option<String>,
    #[serde(default)]
    pub storage_size: Option<u64>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub extension: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteVersion {
    pub id: String,
    #[serde(default)]
    pub attributes: VersionAttributes,
    #[serde(default)]
    pub relationships: Relationships,
}

impl RemoteVersion {
    pub fn process_state(&self) -> Option<&str> {
        self.attributes
            .extension
            .as_ref()
            .and_then(|ext| ext.get("data"))
            .and_then(|data| data.get("processState"))
            .and_then(Value::as_str)
    }
}

/// One page of a folder listing, split by resource type.
#[derive(Debug, Clone, Default)]
pub struct ContentsPage {
    pub folders: Vec<RemoteFolder>,
    pub items: Vec<RemoteItem>,
    /// Tip versions of `items`, when the listing includes them.
    pub included: Vec<RemoteVersion>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomAttributeEntry {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub array_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCustomAttributes {
    pub urn: String,
    #[serde(default)]
    pub item_urn: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub storage_urn: Option<String>,
    #[serde(default)]
    pub storage_size: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub custom_attributes: Vec<CustomAttributeEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDefinitionEntry {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub array_values: Option<Vec<String>>,
}
