//! Value-table remapping and accumulation into named extras.

use gnh_core::{ExtraValue, MappingResult};
use serde_json::Value as JsonValue;

use crate::config::ValueTable;

/// Looks `value` up in `table`. Unmapped values are dropped; a list keeps only
/// its mapped elements. Returns `None` when nothing survives.
pub fn apply_table(value: JsonValue, table: &ValueTable) -> Option<JsonValue> {
    match value {
        JsonValue::Array(items) => {
            let mapped: Vec<JsonValue> = items
                .into_iter()
                .filter_map(|item| lookup(&item, table))
                .collect();
            (!mapped.is_empty()).then_some(JsonValue::Array(mapped))
        }
        scalar => lookup(&scalar, table),
    }
}

fn lookup(value: &JsonValue, table: &ValueTable) -> Option<JsonValue> {
    let key = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(_) | JsonValue::Bool(_) => value.to_string(),
        _ => return None,
    };
    table.get(&key).cloned().map(JsonValue::String)
}

/// A resolved action value, normalized to strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringView {
    One(String),
    Many(Vec<String>),
}

impl StringView {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringView::One(value) => vec![value],
            StringView::Many(values) => values,
        }
    }
}

/// Strings stay strings, lists keep their string elements and report how many
/// others were dropped. Anything else is rejected with a short type description.
pub fn string_view(value: &JsonValue) -> Result<(StringView, usize), &'static str> {
    match value {
        JsonValue::String(s) => Ok((StringView::One(s.clone()), 0)),
        JsonValue::Array(items) => {
            let strings: Vec<String> = items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect();
            if strings.is_empty() {
                Err("list without string elements")
            } else {
                let dropped = items.len() - strings.len();
                Ok((StringView::Many(strings), dropped))
            }
        }
        JsonValue::Number(_) => Err("number"),
        JsonValue::Bool(_) => Err("boolean"),
        JsonValue::Object(_) => Err("object"),
        JsonValue::Null => Err("null"),
    }
}

/// Merges `view` into `extras[key]`: first write stores a scalar, later writes
/// promote to a list and append.
pub fn accumulate(output: &mut MappingResult, key: &str, view: StringView) {
    let next = match (output.extras.remove(key), view) {
        (None, StringView::One(value)) => ExtraValue::Scalar(JsonValue::String(value)),
        (None, StringView::Many(values)) => ExtraValue::List(strings(values)),
        (Some(ExtraValue::Scalar(old)), StringView::One(value)) => {
            ExtraValue::List(vec![old, JsonValue::String(value)])
        }
        (Some(ExtraValue::Scalar(old)), StringView::Many(values)) => {
            let mut items = vec![old];
            items.extend(strings(values));
            ExtraValue::List(items)
        }
        (Some(ExtraValue::List(mut items)), StringView::One(value)) => {
            items.push(JsonValue::String(value));
            ExtraValue::List(items)
        }
        (Some(ExtraValue::List(mut items)), StringView::Many(values)) => {
            items.extend(strings(values));
            ExtraValue::List(items)
        }
    };
    output.extras.insert(key.to_string(), next);
}

fn strings(values: Vec<String>) -> Vec<JsonValue> {
    values.into_iter().map(JsonValue::String).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> ValueTable {
        ValueTable::from([
            ("x".to_string(), "X".to_string()),
            ("nz".to_string(), "Natural risk zones".to_string()),
            ("1".to_string(), "one".to_string()),
        ])
    }

    #[test]
    fn unmapped_scalars_are_dropped() {
        assert_eq!(apply_table(json!("x"), &table()), Some(json!("X")));
        assert_eq!(apply_table(json!("y"), &table()), None);
        assert_eq!(apply_table(json!(1), &table()), Some(json!("one")));
        assert_eq!(apply_table(json!({"x": 1}), &table()), None);
    }

    #[test]
    fn lists_map_element_wise() {
        assert_eq!(
            apply_table(json!(["nz", "hb", "x"]), &table()),
            Some(json!(["Natural risk zones", "X"]))
        );
        assert_eq!(apply_table(json!(["hb", "y"]), &table()), None);
    }

    #[test]
    fn string_view_rejects_non_strings() {
        assert_eq!(string_view(&json!("a")), Ok((StringView::One("a".into()), 0)));
        assert_eq!(
            string_view(&json!(["a", 1, "b", null])),
            Ok((StringView::Many(vec!["a".into(), "b".into()]), 2))
        );
        assert!(string_view(&json!(3)).is_err());
        assert!(string_view(&json!({"a": "b"})).is_err());
        assert!(string_view(&json!([1, 2])).is_err());
    }

    #[test]
    fn scalar_writes_promote_to_lists() {
        let mut out = MappingResult::new();
        accumulate(&mut out, "k", StringView::One("a".into()));
        assert_eq!(out.extra("k"), Some(&ExtraValue::Scalar(json!("a"))));
        accumulate(&mut out, "k", StringView::One("b".into()));
        assert_eq!(out.extra("k"), Some(&ExtraValue::List(vec![json!("a"), json!("b")])));
        accumulate(&mut out, "k", StringView::Many(vec!["c".into(), "d".into()]));
        assert_eq!(out.extra("k").map(ExtraValue::to_json), Some(json!(["a", "b", "c", "d"])));
    }

    #[test]
    fn list_then_scalar_appends() {
        let mut out = MappingResult::new();
        accumulate(&mut out, "k", StringView::Many(vec!["a".into()]));
        accumulate(&mut out, "k", StringView::One("b".into()));
        assert_eq!(out.extra("k").map(ExtraValue::to_json), Some(json!(["a", "b"])));
    }

    #[test]
    fn scalar_then_list_concatenates() {
        let mut out = MappingResult::new();
        accumulate(&mut out, "k", StringView::One("a".into()));
        accumulate(&mut out, "k", StringView::Many(vec!["b".into(), "c".into()]));
        assert_eq!(out.extra("k").map(ExtraValue::to_json), Some(json!(["a", "b", "c"])));
    }
}
