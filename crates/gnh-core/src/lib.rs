//! Core domain model for the GeoNode catalog harvester.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gnh-core";

/// Upstream field carrying the resource kind of a captured record.
pub const KIND_DISCRIMINATOR: &str = "resource_type";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("record content is not valid JSON: {0}")]
    Content(#[from] serde_json::Error),
    #[error("record content is not a JSON object")]
    NotAnObject,
    #[error("record has no resource_type discriminator")]
    MissingKind,
    #[error("unknown resource kind `{0}`")]
    UnknownKind(String),
}

/// Lifecycle status assigned to a harvest record once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    New,
    Change,
    Delete,
    Unchanged,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Change => "change",
            RecordStatus::Delete => "delete",
            RecordStatus::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured snapshot of an upstream resource, keyed by its stable guid.
///
/// At most one record per `(source_id, guid)` is `current` at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestRecord {
    pub id: Uuid,
    pub source_id: String,
    pub job_id: Uuid,
    pub guid: String,
    pub status: RecordStatus,
    pub content: Option<String>,
    pub owner_ref: Option<String>,
    pub current: bool,
    pub gathered_at: DateTime<Utc>,
    pub metadata_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HarvestRecord {
    pub fn captured(
        source_id: impl Into<String>,
        job_id: Uuid,
        guid: impl Into<String>,
        status: RecordStatus,
        content: impl Into<String>,
        owner_ref: Option<String>,
        gathered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            job_id,
            guid: guid.into(),
            status,
            content: Some(content.into()),
            owner_ref,
            current: false,
            gathered_at,
            metadata_modified: Some(gathered_at),
            error: None,
        }
    }

    /// A `Delete` record carries no content and is never promoted to current.
    pub fn tombstone(
        source_id: impl Into<String>,
        job_id: Uuid,
        guid: impl Into<String>,
        owner_ref: Option<String>,
        gathered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            job_id,
            guid: guid.into(),
            status: RecordStatus::Delete,
            content: None,
            owner_ref,
            current: false,
            gathered_at,
            metadata_modified: None,
            error: None,
        }
    }

    /// Byte-for-byte content comparison; no semantic diff.
    pub fn has_same_content(&self, content: &str) -> bool {
        self.content.as_deref() == Some(content)
    }
}

/// The closed set of upstream resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Layer,
    Map,
    Doc,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Layer, ResourceKind::Map, ResourceKind::Doc];

    /// REST listing path segment under `/api/v2/`.
    pub fn api_path(self) -> &'static str {
        match self {
            ResourceKind::Layer => "datasets",
            ResourceKind::Map => "maps",
            ResourceKind::Doc => "documents",
        }
    }

    /// Key holding the record array in a listing page.
    pub fn list_key(self) -> &'static str {
        self.api_path()
    }

    pub fn config_name(self) -> &'static str {
        match self {
            ResourceKind::Layer => "layer",
            ResourceKind::Map => "map",
            ResourceKind::Doc => "doc",
        }
    }

    /// Tag appended to every normalized record of this kind.
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Layer => "Layer",
            ResourceKind::Map => "Map",
            ResourceKind::Doc => "Doc",
        }
    }

    pub fn from_resource_type(value: &str) -> Result<Self, CoreError> {
        match value.to_ascii_lowercase().as_str() {
            "dataset" | "layer" => Ok(ResourceKind::Layer),
            "map" => Ok(ResourceKind::Map),
            "document" | "doc" => Ok(ResourceKind::Doc),
            _ => Err(CoreError::UnknownKind(value.to_string())),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_name())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_resource_type(s)
    }
}

/// Download/view link advertised by an upstream resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLink {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
}

/// Accessors shared by every resource kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBody {
    doc: JsonValue,
}

impl ResourceBody {
    pub fn as_json(&self) -> &JsonValue {
        &self.doc
    }

    /// Field lookup; JSON `null` reads as absent.
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.doc.get(field).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(JsonValue::as_str)
    }

    pub fn pk(&self) -> Option<String> {
        match self.get("pk").or_else(|| self.get("id"))? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        self.str_field("uuid")
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn abstract_text(&self) -> Option<&str> {
        self.str_field("abstract")
    }

    pub fn purpose(&self) -> Option<&str> {
        self.str_field("purpose")
    }

    pub fn date(&self) -> Option<&str> {
        self.str_field("date")
    }

    pub fn date_type(&self) -> Option<&str> {
        self.str_field("date_type")
    }

    pub fn thumbnail_url(&self) -> Option<&str> {
        self.str_field("thumbnail_url")
    }

    pub fn alternate(&self) -> Option<&str> {
        self.str_field("alternate")
    }

    pub fn srid(&self) -> Option<String> {
        match self.get("srid")? {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Keyword names; entries may be `{"name": ..}` objects or bare strings.
    pub fn keywords(&self) -> Vec<String> {
        let Some(items) = self.get("keywords").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Object(obj) => obj.get("name").and_then(JsonValue::as_str).map(str::to_string),
                _ => None,
            })
            .collect()
    }

    /// Links that fail to deserialize are skipped.
    pub fn links(&self) -> Vec<ResourceLink> {
        let Some(items) = self.get("links").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    }

    pub fn bbox_polygon(&self) -> Option<&JsonValue> {
        self.get("ll_bbox_polygon")
    }

    pub fn owner_display(&self) -> Option<String> {
        let owner = self.get("owner")?;
        let part = |key: &str| {
            owner
                .get(key)
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty())
        };
        let username = part("username").unwrap_or_default();
        match (part("first_name"), part("last_name")) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (None, None) => Some(format!("[{username}]")),
            (Some(name), None) | (None, Some(name)) => Some(format!("{name} [{username}]")),
        }
    }

    pub fn language(&self) -> Option<&str> {
        self.str_field("language")
    }

    pub fn maintenance_frequency(&self) -> Option<&str> {
        self.str_field("maintenance_frequency")
    }

    pub fn last_updated(&self) -> Option<&str> {
        self.str_field("last_updated")
    }

    pub fn doi(&self) -> Option<&str> {
        self.str_field("doi").filter(|s| !s.is_empty())
    }

    /// `(start, end)` of the temporal extent; empty strings read as absent.
    pub fn temporal_extent(&self) -> (Option<&str>, Option<&str>) {
        let bound = |field: &str| self.str_field(field).filter(|s: &&str| !s.is_empty());
        (bound("temporal_extent_start"), bound("temporal_extent_end"))
    }

    /// Regions that fail to deserialize are skipped.
    pub fn regions(&self) -> Vec<Region> {
        let Some(items) = self.get("regions").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    }

    /// Keywords drawn from a controlled thesaurus. Entries without a name are skipped.
    pub fn thesaurus_keywords(&self) -> Vec<ThesaurusKeyword> {
        let Some(items) = self.get("tkeywords").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?.to_string();
                let thesaurus_uri = item
                    .pointer("/thesaurus/uri")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                let labels = item
                    .get("i18n")
                    .and_then(JsonValue::as_object)
                    .map(|labels| {
                        labels
                            .iter()
                            .filter_map(|(lang, label)| Some((lang.clone(), label.as_str()?.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(ThesaurusKeyword {
                    name,
                    thesaurus_uri,
                    labels,
                })
            })
            .collect()
    }
}

/// Administrative region attached to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThesaurusKeyword {
    pub name: String,
    pub thesaurus_uri: Option<String>,
    /// Localized labels keyed by language code.
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    body: ResourceBody,
}

impl Layer {
    pub fn name(&self) -> Option<&str> {
        self.body.str_field("name")
    }

    pub fn is_vector(&self) -> bool {
        self.body.str_field("subtype") == Some("vector")
            || self.body.str_field("storeType") == Some("dataStore")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Map {
    body: ResourceBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Doc {
    body: ResourceBody,
}

/// A parsed upstream record, resolved once from its `resource_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoResource {
    Layer(Layer),
    Map(Map),
    Doc(Doc),
}

impl GeoResource {
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let doc: JsonValue = serde_json::from_str(content)?;
        Self::from_json(doc)
    }

    pub fn from_json(doc: JsonValue) -> Result<Self, CoreError> {
        if !doc.is_object() {
            return Err(CoreError::NotAnObject);
        }
        let kind = doc
            .get(KIND_DISCRIMINATOR)
            .and_then(JsonValue::as_str)
            .ok_or(CoreError::MissingKind)
            .and_then(ResourceKind::from_resource_type)?;
        let body = ResourceBody { doc };
        Ok(match kind {
            ResourceKind::Layer => GeoResource::Layer(Layer { body }),
            ResourceKind::Map => GeoResource::Map(Map { body }),
            ResourceKind::Doc => GeoResource::Doc(Doc { body }),
        })
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            GeoResource::Layer(_) => ResourceKind::Layer,
            GeoResource::Map(_) => ResourceKind::Map,
            GeoResource::Doc(_) => ResourceKind::Doc,
        }
    }

    pub fn body(&self) -> &ResourceBody {
        match self {
            GeoResource::Layer(layer) => &layer.body,
            GeoResource::Map(map) => &map.body,
            GeoResource::Doc(doc) => &doc.body,
        }
    }

    /// Layers and maps always carry an extent; documents only when georeferenced.
    pub fn is_spatial(&self) -> bool {
        match self {
            GeoResource::Layer(_) | GeoResource::Map(_) => true,
            GeoResource::Doc(doc) => doc.body.bbox_polygon().is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub name: String,
}

/// Value held under a named destination; a second write promotes it to a list.
///
/// Serialized with an explicit tag so a scalar holding a JSON array reads back
/// as a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExtraValue {
    List(Vec<JsonValue>),
    Scalar(JsonValue),
}

impl ExtraValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            ExtraValue::List(items) => JsonValue::Array(items.clone()),
            ExtraValue::Scalar(value) => value.clone(),
        }
    }

    /// Flat string form used for catalog extras: strings verbatim, everything else JSON-encoded.
    pub fn to_catalog_string(&self) -> String {
        match self {
            ExtraValue::Scalar(JsonValue::String(s)) => s.clone(),
            other => other.to_json().to_string(),
        }
    }
}

/// Per-record output accumulator: two named collections plus free-form extras.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingResult {
    pub tags: Vec<TagEntry>,
    pub groups: Vec<GroupRef>,
    pub extras: BTreeMap<String, ExtraValue>,
}

impl MappingResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tag(&mut self, name: impl Into<String>) {
        self.tags.push(TagEntry { name: name.into() });
    }

    pub fn push_group(&mut self, name: impl Into<String>) {
        self.groups.push(GroupRef { name: name.into() });
    }

    /// Overwriting write; `null` values are not stored.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        let slot = match value.into() {
            JsonValue::Null => return,
            JsonValue::Array(items) => ExtraValue::List(items),
            other => ExtraValue::Scalar(other),
        };
        self.extras.insert(key.into(), slot);
    }

    pub fn extra(&self, key: &str) -> Option<&ExtraValue> {
        self.extras.get(key)
    }

    pub fn tag_names(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogResource {
    pub name: String,
    pub url: String,
    pub description: String,
    pub mimetype: Option<String>,
    pub format: Option<String>,
    pub position: u32,
}

/// Target-catalog record produced from one upstream resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub guid: String,
    pub name: String,
    pub title: String,
    pub notes: Option<String>,
    pub owner_org: Option<String>,
    pub frequency: String,
    pub resources: Vec<CatalogResource>,
    #[serde(flatten)]
    pub fields: MappingResult,
}

impl NormalizedRecord {
    pub fn extra_pairs(&self) -> Vec<ExtraPair> {
        self.fields
            .extras
            .iter()
            .map(|(key, value)| ExtraPair {
                key: key.clone(),
                value: value.to_catalog_string(),
            })
            .collect()
    }

    /// Catalog payload with extras flattened to `{key, value}` pairs.
    pub fn catalog_payload(&self) -> JsonValue {
        serde_json::json!({
            "name": self.name,
            "title": self.title,
            "notes": self.notes,
            "owner_org": self.owner_org,
            "frequency": self.frequency,
            "tags": self.fields.tags,
            "groups": self.fields.groups,
            "resources": self.resources,
            "extras": self.extra_pairs(),
        })
    }
}
