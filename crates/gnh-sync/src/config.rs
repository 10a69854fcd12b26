//! Source registry (`sources.yaml`) and per-source harvest configuration.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use gnh_adapters::SourceMode;
use gnh_core::ResourceKind;
use gnh_rules::{ConfigError, RuleSet, ValueTable};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceEntry {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    pub url: String,
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
    #[serde(default)]
    pub owner_org: Option<String>,
    #[serde(default)]
    pub kinds: Option<Vec<String>>,
    #[serde(default)]
    pub config: JsonValue,
}

/// The `config` block of a source entry, before validation.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HarvestSourceConfig {
    #[serde(default)]
    pub dynamic_mapping: JsonValue,
    #[serde(default)]
    pub value_tables: BTreeMap<String, ValueTable>,
    #[serde(default)]
    pub import_fields: Vec<String>,
    #[serde(default)]
    pub group_mapping_fieldname: Option<String>,
    #[serde(default)]
    pub group_mapping: Option<ValueTable>,
}

#[derive(Debug, Error)]
pub enum SourceConfigError {
    #[error("source {source_id}: {message}")]
    Invalid { source_id: String, message: String },
    #[error("source {source_id}: {source}")]
    Rules {
        source_id: String,
        #[source]
        source: ConfigError,
    },
}

impl SourceConfigError {
    fn invalid(source_id: &str, message: impl Into<String>) -> Self {
        SourceConfigError::Invalid {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            SourceConfigError::Invalid { source_id, .. } | SourceConfigError::Rules { source_id, .. } => {
                source_id
            }
        }
    }
}

/// Legacy single-field group inference: upstream `fieldname` value -> group name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMapping {
    pub fieldname: String,
    pub table: Arc<ValueTable>,
}

/// A fully validated source, ready for harvesting.
#[derive(Debug, Clone)]
pub struct HarvestSource {
    pub source_id: String,
    pub display_name: String,
    pub mode: SourceMode,
    pub url: String,
    pub fixture_dir: Option<PathBuf>,
    pub owner_org: Option<String>,
    pub kinds: Vec<ResourceKind>,
    pub rules: RuleSet,
    pub import_fields: Vec<String>,
    pub group_mapping: Option<GroupMapping>,
}

fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl SourceEntry {
    /// Compiles the entry. Any problem rejects the whole source.
    pub fn validate(&self, workspace_root: &Path) -> Result<HarvestSource, SourceConfigError> {
        let id = self.source_id.as_str();
        if !is_slug(id) {
            return Err(SourceConfigError::invalid(
                id,
                "source_id should contain only lowercase letters, digits, '-' and '_'",
            ));
        }

        if self.mode == SourceMode::Api
            && !(self.url.starts_with("http://") || self.url.starts_with("https://"))
        {
            return Err(SourceConfigError::invalid(
                id,
                format!("url {:?} is not an http(s) URL", self.url),
            ));
        }

        let fixture_dir = self.fixture_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                workspace_root.join(dir)
            }
        });
        if self.mode == SourceMode::Fixture && fixture_dir.is_none() {
            return Err(SourceConfigError::invalid(id, "fixture mode requires fixture_dir"));
        }

        let kinds = match &self.kinds {
            None => ResourceKind::ALL.to_vec(),
            Some(names) => {
                let mut kinds = Vec::new();
                for name in names {
                    let kind: ResourceKind = name
                        .parse()
                        .map_err(|_| SourceConfigError::invalid(id, format!("unknown resource kind {name:?}")))?;
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                if kinds.is_empty() {
                    return Err(SourceConfigError::invalid(id, "kinds should not be empty"));
                }
                kinds
            }
        };

        let config: HarvestSourceConfig = match &self.config {
            JsonValue::Null => HarvestSourceConfig::default(),
            other => serde_json::from_value(other.clone())
                .map_err(|err| SourceConfigError::invalid(id, format!("config: {err}")))?,
        };

        let rules = RuleSet::from_json(&config.dynamic_mapping, &config.value_tables).map_err(|source| {
            SourceConfigError::Rules {
                source_id: id.to_string(),
                source,
            }
        })?;

        if let Some(field) = config.import_fields.iter().find(|f| f.trim().is_empty()) {
            return Err(SourceConfigError::invalid(
                id,
                format!("import_fields entry {field:?} should not be empty"),
            ));
        }

        let group_mapping = match (config.group_mapping_fieldname, config.group_mapping) {
            (None, None) => None,
            (Some(fieldname), Some(table)) if !fieldname.trim().is_empty() => Some(GroupMapping {
                fieldname,
                table: Arc::new(table),
            }),
            (Some(_), Some(_)) => {
                return Err(SourceConfigError::invalid(
                    id,
                    "group_mapping_fieldname should not be empty",
                ))
            }
            _ => {
                return Err(SourceConfigError::invalid(
                    id,
                    "group_mapping_fieldname and group_mapping must be set together",
                ))
            }
        };

        Ok(HarvestSource {
            source_id: self.source_id.clone(),
            display_name: self.display_name.clone(),
            mode: self.mode,
            url: self.url.clone(),
            fixture_dir,
            owner_org: self.owner_org.clone(),
            kinds,
            rules,
            import_fields: config.import_fields,
            group_mapping,
        })
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// Validates every enabled source. Duplicate ids are reported against the
    /// later entry.
    pub fn validate_all(&self, workspace_root: &Path) -> Vec<Result<HarvestSource, SourceConfigError>> {
        let mut seen = HashSet::new();
        self.enabled()
            .map(|entry| {
                if !seen.insert(entry.source_id.as_str()) {
                    return Err(SourceConfigError::invalid(&entry.source_id, "duplicate source_id"));
                }
                entry.validate(workspace_root)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: geonode-demo
    display_name: GeoNode demo
    mode: fixture
    url: https://geonode.example.org
    fixture_dir: fixtures/geonode-demo
    owner_org: regional-office
    kinds: [layer, map, map]
    config:
      import_fields: [language, license]
      group_mapping_fieldname: category
      group_mapping:
        inlandWaters: hydrography
      value_tables:
        themes:
          hb: hydrography
      dynamic_mapping:
        - filters: ["resource_type=='map'"]
          actions:
            - value: Maps
              destination: tag
            - source: "tkeywords[].name"
              mapping: themes
              destination: group
  - source_id: disabled-one
    display_name: Not harvested
    enabled: false
    url: not-a-url
"#;

    #[test]
    fn registry_entries_compile_into_sources() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.enabled().count(), 1);
        let results = registry.validate_all(Path::new("/ws"));
        assert_eq!(results.len(), 1);
        let source = results.into_iter().next().unwrap().unwrap();

        assert_eq!(source.kinds, vec![ResourceKind::Layer, ResourceKind::Map]);
        assert_eq!(source.fixture_dir, Some(PathBuf::from("/ws/fixtures/geonode-demo")));
        assert_eq!(source.rules.len(), 1);
        assert_eq!(source.import_fields, vec!["language", "license"]);
        let groups = source.group_mapping.expect("group mapping");
        assert_eq!(groups.fieldname, "category");
        assert_eq!(groups.table.get("inlandWaters").map(String::as_str), Some("hydrography"));
    }

    fn entry(config: JsonValue) -> SourceEntry {
        SourceEntry {
            source_id: "demo".into(),
            display_name: "Demo".into(),
            enabled: true,
            mode: SourceMode::Api,
            url: "https://geo.example.org".into(),
            fixture_dir: None,
            owner_org: None,
            kinds: None,
            config,
        }
    }

    #[test]
    fn a_bad_rule_rejects_the_whole_source() {
        let err = entry(serde_json::json!({
            "dynamic_mapping": [
                {"filters": [], "actions": [{"value": "ok", "destination": "tag"}]},
                {"filters": [], "actions": [{"value": "x", "source": "y", "destination": "tag"}]}
            ]
        }))
        .validate(Path::new("."))
        .unwrap_err();
        assert!(matches!(err, SourceConfigError::Rules { .. }));
        assert_eq!(err.source_id(), "demo");
    }

    #[test]
    fn config_block_fails_closed() {
        let unknown = entry(serde_json::json!({"dynamic_maping": []})).validate(Path::new("."));
        assert!(unknown.is_err());

        let half_groups = entry(serde_json::json!({"group_mapping_fieldname": "category"}))
            .validate(Path::new("."))
            .unwrap_err();
        assert!(half_groups.to_string().contains("must be set together"));

        let blank_field = entry(serde_json::json!({"import_fields": ["ok", " "]})).validate(Path::new("."));
        assert!(blank_field.is_err());

        let empty = entry(JsonValue::Null).validate(Path::new(".")).unwrap();
        assert!(empty.rules.is_empty());
        assert_eq!(empty.kinds.len(), 3);
    }

    #[test]
    fn source_level_fields_are_checked() {
        let mut bad_url = entry(JsonValue::Null);
        bad_url.url = "geo.example.org".into();
        assert!(bad_url.validate(Path::new(".")).is_err());

        let mut bad_kind = entry(JsonValue::Null);
        bad_kind.kinds = Some(vec!["geoapp".into()]);
        assert!(bad_kind.validate(Path::new(".")).unwrap_err().to_string().contains("geoapp"));

        let mut bad_id = entry(JsonValue::Null);
        bad_id.source_id = "Geo Node".into();
        assert!(bad_id.validate(Path::new(".")).is_err());

        let mut no_dir = entry(JsonValue::Null);
        no_dir.mode = SourceMode::Fixture;
        assert!(no_dir.validate(Path::new(".")).is_err());
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let text = r#"
sources:
  - {source_id: a, display_name: A, url: "https://a.example.org"}
  - {source_id: a, display_name: A again, url: "https://a.example.org"}
"#;
        let registry = SourceRegistry::from_yaml_str(text).unwrap();
        let results = registry.validate_all(Path::new("."));
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().to_string().contains("duplicate"));
    }
}
