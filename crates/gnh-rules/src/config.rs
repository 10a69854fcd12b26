//! Rule-set schema and load-time validation.
//!
//! A rule-set is an ordered list of `{filters, actions}` objects. Validation is a
//! pure function over the configuration blob: every query is compiled and every
//! action shape is checked before any record is evaluated, so a malformed rule
//! rejects the whole configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::query::{PathQuery, QueryError};

pub const TAG_DESTINATION: &str = "tag";
pub const GROUP_DESTINATION: &str = "group";

/// Static `upstream value -> local value` lookup table.
pub type ValueTable = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{location}: {source}")]
    Schema {
        location: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{location}: {message}")]
    Invalid { location: String, message: String },
    #[error("{location}: {source}")]
    Query {
        location: String,
        #[source]
        source: QueryError,
    },
}

impl ConfigError {
    fn invalid(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Raw rule configuration as it appears in a harvest source's config block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSetConfig {
    #[serde(default)]
    pub dynamic_mapping: JsonValue,
    #[serde(default)]
    pub value_tables: BTreeMap<String, ValueTable>,
}

impl RuleSetConfig {
    pub fn validate(&self) -> Result<RuleSet, ConfigError> {
        RuleSet::from_json(&self.dynamic_mapping, &self.value_tables)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Tag,
    Group,
    Extra(String),
}

impl Destination {
    pub fn parse(name: &str) -> Self {
        match name {
            TAG_DESTINATION => Destination::Tag,
            GROUP_DESTINATION => Destination::Group,
            other => Destination::Extra(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Destination::Tag => TAG_DESTINATION,
            Destination::Group => GROUP_DESTINATION,
            Destination::Extra(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionInput {
    /// A string or a list of strings, written as-is.
    Literal(JsonValue),
    Query {
        query: PathQuery,
        table: Option<Arc<ValueTable>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub input: ActionInput,
    pub destination: Destination,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub filters: Vec<PathQuery>,
    pub actions: Vec<Action>,
}

/// A validated, ordered rule-set. Every rule whose filters pass is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(default)]
    filters: Vec<String>,
    actions: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    value: Option<JsonValue>,
    #[serde(default)]
    mapping: Option<JsonValue>,
    #[serde(default)]
    destination: Option<JsonValue>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Parses a JSON configuration blob of the form
    /// `{"dynamic_mapping": [...], "value_tables": {...}}`.
    pub fn from_config_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuleSetConfig = serde_json::from_str(text).map_err(|source| ConfigError::Schema {
            location: "config".to_string(),
            source,
        })?;
        config.validate()
    }

    pub fn from_json(
        rules: &JsonValue,
        tables: &BTreeMap<String, ValueTable>,
    ) -> Result<Self, ConfigError> {
        let items = match rules {
            JsonValue::Null => return Ok(Self::default()),
            JsonValue::Array(items) => items,
            _ => {
                return Err(ConfigError::invalid(
                    "dynamic_mapping",
                    "rules should be in a list",
                ))
            }
        };

        let tables: BTreeMap<&str, Arc<ValueTable>> = tables
            .iter()
            .map(|(name, table)| (name.as_str(), Arc::new(table.clone())))
            .collect();

        let mut parsed = Vec::with_capacity(items.len());
        for (rule_idx, item) in items.iter().enumerate() {
            let location = format!("dynamic_mapping[{rule_idx}]");
            if !item.is_object() {
                return Err(ConfigError::invalid(location, "rule should be an object"));
            }
            let raw: RawRule = serde_json::from_value(item.clone()).map_err(|source| {
                ConfigError::Schema {
                    location: location.clone(),
                    source,
                }
            })?;

            let filters = raw
                .filters
                .iter()
                .enumerate()
                .map(|(filter_idx, expr)| {
                    PathQuery::compile(expr).map_err(|source| ConfigError::Query {
                        location: format!("{location}.filters[{filter_idx}]"),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let actions = raw
                .actions
                .iter()
                .enumerate()
                .map(|(action_idx, action)| {
                    parse_action(&format!("{location}.actions[{action_idx}]"), action, &tables)
                })
                .collect::<Result<Vec<_>, _>>()?;

            parsed.push(Rule { filters, actions });
        }

        Ok(Self { rules: parsed })
    }
}

fn parse_action(
    location: &str,
    value: &JsonValue,
    tables: &BTreeMap<&str, Arc<ValueTable>>,
) -> Result<Action, ConfigError> {
    if !value.is_object() {
        return Err(ConfigError::invalid(location, "action should be an object"));
    }
    let raw: RawAction = serde_json::from_value(value.clone()).map_err(|source| ConfigError::Schema {
        location: location.to_string(),
        source,
    })?;

    let destination = match raw.destination {
        None => return Err(ConfigError::invalid(location, "missing action field \"destination\"")),
        Some(JsonValue::String(name)) if name.trim().is_empty() => {
            return Err(ConfigError::invalid(location, "action destination should not be empty"))
        }
        Some(JsonValue::String(name)) => Destination::parse(name.trim()),
        Some(_) => return Err(ConfigError::invalid(location, "action destination should be a string")),
    };

    let input = match (raw.source, raw.value) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::invalid(
                location,
                "only one of \"source\", \"value\" is allowed in an action",
            ))
        }
        (None, None) => {
            return Err(ConfigError::invalid(
                location,
                "one of \"source\", \"value\" is required in an action",
            ))
        }
        (None, Some(literal)) => {
            if raw.mapping.is_some() {
                return Err(ConfigError::invalid(
                    location,
                    "\"mapping\" is only allowed together with \"source\"",
                ));
            }
            validate_literal(location, &literal)?;
            ActionInput::Literal(literal)
        }
        (Some(source), None) => {
            let query = PathQuery::compile(&source).map_err(|source| ConfigError::Query {
                location: format!("{location}.source"),
                source,
            })?;
            let table = raw
                .mapping
                .map(|mapping| resolve_table(location, mapping, tables))
                .transpose()?;
            ActionInput::Query { query, table }
        }
    };

    Ok(Action { input, destination })
}

fn validate_literal(location: &str, literal: &JsonValue) -> Result<(), ConfigError> {
    match literal {
        JsonValue::String(s) if !s.is_empty() => Ok(()),
        JsonValue::Array(items) if !items.is_empty() && items.iter().all(|i| matches!(i, JsonValue::String(s) if !s.is_empty())) => Ok(()),
        _ => Err(ConfigError::invalid(
            location,
            "action value should be a non-empty string or a non-empty list of strings",
        )),
    }
}

fn resolve_table(
    location: &str,
    mapping: JsonValue,
    tables: &BTreeMap<&str, Arc<ValueTable>>,
) -> Result<Arc<ValueTable>, ConfigError> {
    match mapping {
        JsonValue::String(name) => tables.get(name.as_str()).cloned().ok_or_else(|| {
            ConfigError::invalid(location, format!("unknown value table \"{name}\""))
        }),
        JsonValue::Object(entries) => {
            let mut table = ValueTable::new();
            for (key, value) in entries {
                let JsonValue::String(mapped) = value else {
                    return Err(ConfigError::invalid(
                        location,
                        format!("mapping entry \"{key}\" should map to a string"),
                    ));
                };
                table.insert(key, mapped);
            }
            Ok(Arc::new(table))
        }
        _ => Err(ConfigError::invalid(
            location,
            "\"mapping\" should be an object or the name of a value table",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(rules: JsonValue) -> Result<RuleSet, ConfigError> {
        RuleSet::from_json(&rules, &BTreeMap::new())
    }

    fn message(err: ConfigError) -> String {
        err.to_string()
    }

    #[test]
    fn accepts_the_documented_shapes() {
        let rules = validate(json!([
            {
                "filters": ["resource_type=='map'"],
                "actions": [
                    {"value": "Risk", "destination": "tag"},
                    {"value": ["a", "b"], "destination": "topics"},
                    {"source": "tkeywords[].name", "mapping": {"nz": "NZ"}, "destination": "themes"}
                ]
            },
            {"actions": [{"source": "group.name", "destination": "group"}]}
        ]))
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.rules()[1].filters.is_empty());
        assert_eq!(rules.rules()[0].actions[0].destination, Destination::Tag);
        assert_eq!(rules.rules()[1].actions[0].destination, Destination::Group);
        assert_eq!(
            rules.rules()[0].actions[2].destination,
            Destination::Extra("themes".into())
        );
    }

    #[test]
    fn missing_or_null_rules_mean_an_empty_rule_set() {
        assert!(validate(JsonValue::Null).unwrap().is_empty());
        assert!(validate(json!([])).unwrap().is_empty());
        assert!(message(validate(json!({"filters": []})).unwrap_err()).contains("list"));
    }

    #[test]
    fn rejects_missing_destination() {
        let err = validate(json!([{"actions": [{"value": "x"}]}])).unwrap_err();
        assert!(message(err).contains("dynamic_mapping[0].actions[0]: missing action field \"destination\""));
    }

    #[test]
    fn rejects_non_string_destination() {
        let err = validate(json!([{"actions": [{"value": "x", "destination": 3}]}])).unwrap_err();
        assert!(message(err).contains("should be a string"));
    }

    #[test]
    fn rejects_both_and_neither_input() {
        let both = validate(json!([{"actions": [{"value": "x", "source": "a", "destination": "tag"}]}]));
        assert!(message(both.unwrap_err()).contains("only one of"));
        let neither = validate(json!([{"actions": [{"destination": "tag"}]}]));
        assert!(message(neither.unwrap_err()).contains("is required"));
    }

    #[test]
    fn rejects_mapping_without_source() {
        let err = validate(json!([{"actions": [{"value": "x", "mapping": {"x": "y"}, "destination": "d"}]}]))
            .unwrap_err();
        assert!(message(err).contains("only allowed together with \"source\""));
    }

    #[test]
    fn rejects_unparseable_queries_with_location() {
        let err = validate(json!([
            {"filters": ["a=='b'", "tkeywords[?name=='nz'"], "actions": []}
        ]))
        .unwrap_err();
        assert!(matches!(&err, ConfigError::Query { location, .. } if location == "dynamic_mapping[0].filters[1]"));

        let err = validate(json!([{"actions": [{"source": "a[", "destination": "d"}]}])).unwrap_err();
        assert!(matches!(&err, ConfigError::Query { location, .. } if location == "dynamic_mapping[0].actions[0].source"));
    }

    #[test]
    fn rejects_unknown_entries_and_bad_literals() {
        let unknown_rule = validate(json!([{"filters": [], "actions": [], "when": "x"}]));
        assert!(matches!(unknown_rule.unwrap_err(), ConfigError::Schema { .. }));
        let unknown_action = validate(json!([{"actions": [{"value": "x", "destination": "d", "field": "y"}]}]));
        assert!(matches!(unknown_action.unwrap_err(), ConfigError::Schema { .. }));
        let numeric = validate(json!([{"actions": [{"value": 3, "destination": "d"}]}]));
        assert!(message(numeric.unwrap_err()).contains("non-empty string"));
        let mixed = validate(json!([{"actions": [{"value": ["a", 1], "destination": "d"}]}]));
        assert!(mixed.is_err());
        let filter_not_string = validate(json!([{"filters": [1], "actions": []}]));
        assert!(matches!(filter_not_string.unwrap_err(), ConfigError::Schema { .. }));
    }

    #[test]
    fn named_value_tables_resolve_or_fail() {
        let mut tables = BTreeMap::new();
        tables.insert(
            "inspire".to_string(),
            ValueTable::from([("nz".to_string(), "Natural risk zones".to_string())]),
        );
        let rules = RuleSet::from_json(
            &json!([{"actions": [{"source": "a", "mapping": "inspire", "destination": "d"}]}]),
            &tables,
        )
        .unwrap();
        let ActionInput::Query { table: Some(table), .. } = &rules.rules()[0].actions[0].input else {
            panic!("expected mapped query");
        };
        assert_eq!(table.get("nz").map(String::as_str), Some("Natural risk zones"));

        let err = RuleSet::from_json(
            &json!([{"actions": [{"source": "a", "mapping": "missing", "destination": "d"}]}]),
            &tables,
        )
        .unwrap_err();
        assert!(message(err).contains("unknown value table"));

        let err = validate(json!([{"actions": [{"source": "a", "mapping": {"x": 1}, "destination": "d"}]}]))
            .unwrap_err();
        assert!(message(err).contains("should map to a string"));
    }

    #[test]
    fn config_blob_parses_from_text() {
        let rules = RuleSet::from_config_str(
            r#"{"dynamic_mapping": [{"filters": [], "actions": [{"value": "INSPIRE", "destination": "tag"}]}]}"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        assert!(RuleSet::from_config_str(r#"{"dynamic_mapping": [], "value_tables": {"t": {"a": 1}}}"#).is_err());
    }
}
