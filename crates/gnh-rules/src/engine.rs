//! Applies a validated rule-set to one upstream record.

use std::collections::{BTreeSet, HashSet};

use gnh_core::MappingResult;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Action, ActionInput, Destination, RuleSet};
use crate::value::{accumulate, apply_table, string_view};

/// Existence check for the `group` destination.
pub trait GroupDirectory {
    fn exists(&self, name: &str) -> bool;
}

impl GroupDirectory for BTreeSet<String> {
    fn exists(&self, name: &str) -> bool {
        self.contains(name)
    }
}

impl GroupDirectory for HashSet<String> {
    fn exists(&self, name: &str) -> bool {
        self.contains(name)
    }
}

/// Non-fatal per-action diagnostics. None of these abort the record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingWarning {
    #[error("source `{query}` found no value for destination `{destination}`")]
    MissingSource { query: String, destination: String },
    #[error("value of `{query}` is not in the value table for destination `{destination}`")]
    Unmapped { query: String, destination: String },
    #[error("destination `{destination}` cannot take a {found} value")]
    UnsupportedValue { destination: String, found: String },
    #[error("dropped {dropped} non-string list element(s) bound for destination `{destination}`")]
    PartialList { destination: String, dropped: usize },
    #[error("group `{name}` does not exist")]
    UnknownGroup { name: String },
    #[error("record is null; rules skipped")]
    SkippedNullRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub rules_matched: usize,
    pub actions_applied: usize,
    pub warnings: Vec<MappingWarning>,
}

impl ApplyReport {
    fn warn(&mut self, warning: MappingWarning) {
        debug!(%warning, "mapping action skipped");
        self.warnings.push(warning);
    }
}

/// Runs every rule whose filters all pass, in declaration order, writing into
/// `output`. Per-record problems are reported, never raised.
pub fn apply(
    rules: &RuleSet,
    input: &JsonValue,
    groups: &dyn GroupDirectory,
    output: &mut MappingResult,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    if input.is_null() {
        report.warn(MappingWarning::SkippedNullRecord);
        return report;
    }

    for rule in rules.rules() {
        if !rule.filters.iter().all(|filter| filter.test(input)) {
            continue;
        }
        report.rules_matched += 1;
        for action in &rule.actions {
            if apply_action(action, input, groups, output, &mut report) {
                report.actions_applied += 1;
            }
        }
    }
    report
}

fn apply_action(
    action: &Action,
    input: &JsonValue,
    groups: &dyn GroupDirectory,
    output: &mut MappingResult,
    report: &mut ApplyReport,
) -> bool {
    let destination = action.destination.as_str();
    let value = match &action.input {
        ActionInput::Literal(value) => value.clone(),
        ActionInput::Query { query, table } => {
            let Some(found) = query.evaluate(input).filter(|v| !is_empty(v)) else {
                report.warn(MappingWarning::MissingSource {
                    query: query.to_string(),
                    destination: destination.to_string(),
                });
                return false;
            };
            match table {
                None => found,
                Some(table) => match apply_table(found, table) {
                    Some(mapped) => mapped,
                    None => {
                        report.warn(MappingWarning::Unmapped {
                            query: query.to_string(),
                            destination: destination.to_string(),
                        });
                        return false;
                    }
                },
            }
        }
    };

    let view = match string_view(&value) {
        Ok((view, 0)) => view,
        Ok((view, dropped)) => {
            report.warn(MappingWarning::PartialList {
                destination: destination.to_string(),
                dropped,
            });
            view
        }
        Err(found) => {
            report.warn(MappingWarning::UnsupportedValue {
                destination: destination.to_string(),
                found: found.to_string(),
            });
            return false;
        }
    };

    match &action.destination {
        Destination::Tag => {
            for name in view.into_vec() {
                output.push_tag(name);
            }
            true
        }
        Destination::Group => {
            let mut added = false;
            for name in view.into_vec() {
                if groups.exists(&name) {
                    output.push_group(name);
                    added = true;
                } else {
                    warn!(group = %name, "dropping reference to unknown group");
                    report.warnings.push(MappingWarning::UnknownGroup { name });
                }
            }
            added
        }
        Destination::Extra(key) => {
            accumulate(output, key, view);
            true
        }
    }
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}
