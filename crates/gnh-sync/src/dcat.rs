//! DCAT-AP IT profile fields: identifiers, EU vocabulary codes for themes,
//! language and update frequency, plus regions and temporal coverage.

use std::collections::BTreeSet;

use gnh_core::{MappingResult, ResourceBody};
use serde_json::json;

use crate::mapper::format_date;

pub const INSPIRE_THEME_THESAURUS: &str = "http://inspire.ec.europa.eu/theme";

/// Code used when a controlled value cannot be derived ("provisional data").
pub const OP_DATPRO: &str = "OP_DATPRO";

/// EuroVoc data themes covering an INSPIRE theme code.
pub fn eurovoc_themes(inspire: &str) -> &'static [&'static str] {
    match inspire {
        "ad" | "au" | "cp" | "gn" | "bu" => &["REGI"],
        "rs" | "gg" | "el" | "ge" | "oi" | "ef" | "of" | "mf" => &["ENVI", "TECH"],
        "hy" | "ps" | "ac" | "br" | "hb" | "mr" | "sr" | "so" => &["ENVI"],
        "tn" => &["TRAN"],
        "lc" | "lu" | "sd" => &["ENVI", "AGRI"],
        "af" => &["AGRI"],
        "am" => &["GOVE", "INTR"],
        "er" => &["ENER"],
        "hh" => &["SOCI", "HEAL"],
        "nz" => &["ENVI", "HEAL"],
        "pd" => &["SOCI"],
        "pf" => &["ECON", "TECH"],
        "su" => &["GOVE", "SOCI"],
        "us" => &["GOVE", "SOCI", "HEAL"],
        _ => &[],
    }
}

/// EU authority language code for a GeoNode (ISO 639-2) language.
pub fn language_code(language: Option<&str>) -> &'static str {
    match language {
        Some("ita") => "ITA",
        Some("eng") => "ENG",
        Some("ger") => "DEU",
        Some("fra") => "FRA",
        _ => OP_DATPRO,
    }
}

/// EU authority frequency code for a GeoNode maintenance frequency.
pub fn frequency_code(frequency: Option<&str>) -> &'static str {
    match frequency {
        Some("unknown") => "UNKNOWN",
        Some("continual") => "UPDATE_CONT",
        Some("notPlanned") => "NEVER",
        Some("asNeeded") => "OTHER",
        Some("irregular") => "IRREG",
        Some("daily") => "DAILY",
        Some("weekly") => "WEEKLY",
        Some("fortnightly") => "WEEKLY_2",
        Some("monthly") => "MONTHLY",
        Some("quarterly") => "ANNUAL_3",
        Some("biannually") => "ANNUAL_2",
        Some("annually") => "ANNUAL",
        _ => OP_DATPRO,
    }
}

/// Writes the profile extras and tags for one record.
pub fn apply_profile(body: &ResourceBody, fields: &mut MappingResult) {
    fields.set_extra("identifier", body.uuid());
    if let Some(doi) = body.doi() {
        fields.set_extra("alternate_identifier", json!([{ "identifier": doi }]).to_string());
    }

    let mut themes = BTreeSet::new();
    for keyword in body.thesaurus_keywords() {
        if keyword.thesaurus_uri.as_deref() != Some(INSPIRE_THEME_THESAURUS) {
            continue;
        }
        themes.extend(eurovoc_themes(&keyword.name).iter().copied());
        if let Some(label) = keyword.labels.get("it") {
            fields.push_tag(label.as_str());
        }
    }
    let aggregate: Vec<_> = themes
        .into_iter()
        .map(|theme| json!({ "theme": theme, "subthemes": [] }))
        .collect();
    fields.set_extra("themes_aggregate", serde_json::Value::from(aggregate).to_string());

    if body.date_type() == Some("publication") {
        fields.set_extra("issued", body.date().map(format_date));
    }
    fields.set_extra("modified", body.last_updated().map(format_date));

    let regions = body.regions();
    for name in regions.iter().filter_map(|r| r.name.as_deref()) {
        fields.push_tag(name);
    }
    let codes: Vec<&str> = regions.iter().filter_map(|r| r.code.as_deref()).collect();
    if !codes.is_empty() {
        fields.set_extra("geographical_name", format!("{{{}}}", codes.join(",")));
    }

    fields.set_extra("language", language_code(body.language()));

    let (start, end) = body.temporal_extent();
    if start.is_some() || end.is_some() {
        let interval = json!([{
            "temporal_start": start.map(format_date),
            "temporal_end": end.map(format_date),
        }]);
        fields.set_extra("temporal_coverage", interval.to_string());
    }

    fields.set_extra("frequency", frequency_code(body.maintenance_frequency()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnh_core::{ExtraValue, GeoResource};
    use serde_json::Value as JsonValue;

    fn text(fields: &MappingResult, key: &str) -> Option<String> {
        fields.extra(key).map(ExtraValue::to_catalog_string)
    }

    #[test]
    fn vocabularies_fall_back_to_provisional_data() {
        assert_eq!(eurovoc_themes("us"), &["GOVE", "SOCI", "HEAL"]);
        assert!(eurovoc_themes("zz").is_empty());
        assert_eq!(language_code(Some("ger")), "DEU");
        assert_eq!(language_code(Some("spa")), OP_DATPRO);
        assert_eq!(language_code(None), OP_DATPRO);
        assert_eq!(frequency_code(Some("fortnightly")), "WEEKLY_2");
        assert_eq!(frequency_code(None), OP_DATPRO);
    }

    #[test]
    fn bare_resources_still_get_mandatory_fields() {
        let res = GeoResource::from_json(serde_json::json!({"resource_type": "document", "uuid": "u-1"})).unwrap();
        let mut fields = MappingResult::new();
        apply_profile(res.body(), &mut fields);

        assert_eq!(text(&fields, "identifier").as_deref(), Some("u-1"));
        assert_eq!(text(&fields, "themes_aggregate").as_deref(), Some("[]"));
        assert_eq!(text(&fields, "language").as_deref(), Some(OP_DATPRO));
        assert_eq!(text(&fields, "frequency").as_deref(), Some(OP_DATPRO));
        for absent in ["alternate_identifier", "issued", "modified", "geographical_name", "temporal_coverage"] {
            assert!(fields.extra(absent).is_none(), "{absent} should be unset");
        }
        assert!(fields.tags.is_empty());
    }

    #[test]
    fn open_ended_temporal_coverage_keeps_a_null_bound() {
        let res = GeoResource::from_json(serde_json::json!({
            "resource_type": "dataset",
            "temporal_extent_end": "2019-12-31T00:00:00Z"
        }))
        .unwrap();
        let mut fields = MappingResult::new();
        apply_profile(res.body(), &mut fields);
        let coverage: JsonValue = serde_json::from_str(&text(&fields, "temporal_coverage").unwrap()).unwrap();
        assert_eq!(
            coverage,
            serde_json::json!([{"temporal_start": null, "temporal_end": "2019-12-31"}])
        );
    }
}
