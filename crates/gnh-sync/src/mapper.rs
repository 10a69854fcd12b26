//! Base record mapper: turns one captured upstream resource into a catalog
//! record, then lets the source's dynamic rules extend it.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use gnh_core::{CatalogResource, GeoResource, MappingResult, NormalizedRecord, ResourceBody};
use gnh_rules::MappingWarning;
use gnh_storage::CatalogEntry;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{GroupMapping, HarvestSource};
use crate::dcat;
use crate::error::RecordImportError;

pub const MAX_TAG_LENGTH: usize = 50;
const MAX_NAME_STEM: usize = 90;
const GUID_SUFFIX_LEN: usize = 8;

/// State shared by every record of one harvest cycle. Built once when the
/// cycle starts and passed down explicitly.
#[derive(Debug, Clone)]
pub struct CycleContext<'a> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub source: &'a HarvestSource,
    pub groups: BTreeSet<String>,
}

impl<'a> CycleContext<'a> {
    pub fn new(source: &'a HarvestSource, groups: BTreeSet<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            source,
            groups,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    pub record: NormalizedRecord,
    pub warnings: Vec<MappingWarning>,
}

/// Maps one captured record. `existing` is the catalog's current view of the
/// record on updates; its name is kept while the title stays the same.
pub fn map_record(
    ctx: &CycleContext<'_>,
    guid: &str,
    content: &str,
    existing: Option<&CatalogEntry>,
) -> Result<MappedRecord, RecordImportError> {
    let resource = GeoResource::parse(content)?;
    let kind = resource.kind();
    let body = resource.body();
    let mut fields = MappingResult::new();
    let mut warnings = Vec::new();

    for keyword in body.keywords() {
        fields.push_tag(truncate_chars(&keyword, MAX_TAG_LENGTH));
    }

    if let Some(mapping) = &ctx.source.group_mapping {
        legacy_groups(mapping, body, &ctx.groups, &mut fields, &mut warnings);
    }

    let mut resources = link_resources(body);
    if let GeoResource::Map(_) = &resource {
        let next = resources.iter().map(|r| r.position).max().map_or(0, |p| p + 1);
        resources.extend(map_resources(&ctx.source.url, body.pk().as_deref().unwrap_or_default(), next));
    }

    let title = body.title().unwrap_or_default().to_string();
    let name = match existing.filter(|entry| entry.title == title) {
        Some(entry) => entry.name.clone(),
        None => generate_name(&resource, guid).ok_or(RecordImportError::NoName)?,
    };

    fields.set_extra("guid", guid);
    fields.set_extra("geonode_uuid", body.get("uuid").cloned());
    fields.set_extra("geonode_author", body.owner_display());
    fields.set_extra("geonode_purpose", body.purpose());
    fields.set_extra("geonode_suppinfo", body.get("supplemental_information").cloned());
    fields.set_extra("geonode_temporal_start", body.get("temporal_extent_start").cloned());
    fields.set_extra("geonode_temporal_end", body.get("temporal_extent_end").cloned());
    fields.set_extra("geonode_doi", body.get("doi").cloned());

    for field in &ctx.source.import_fields {
        fields.set_extra(field.as_str(), body.get(field).cloned());
    }

    if body.date_type() == Some("publication") {
        if let Some(date) = body.date() {
            fields.set_extra("publication_date", format_date(date));
        }
    }

    if resource.is_spatial() {
        spatial_extras(body, &mut fields);
    }

    dcat::apply_profile(body, &mut fields);

    let report = gnh_rules::apply(&ctx.source.rules, body.as_json(), &ctx.groups, &mut fields);
    debug!(
        guid,
        rules_matched = report.rules_matched,
        actions_applied = report.actions_applied,
        "dynamic mapping applied"
    );
    warnings.extend(report.warnings);

    fields.push_tag(kind.label());
    if let GeoResource::Layer(layer) = &resource {
        fields.set_extra("is_vector", layer.is_vector());
    }

    Ok(MappedRecord {
        record: NormalizedRecord {
            guid: guid.to_string(),
            name,
            title,
            notes: body.abstract_text().map(str::to_string),
            owner_org: ctx.source.owner_org.clone(),
            frequency: "UNKNOWN".to_string(),
            resources,
            fields,
        },
        warnings,
    })
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn legacy_groups(
    mapping: &GroupMapping,
    body: &ResourceBody,
    known: &BTreeSet<String>,
    fields: &mut MappingResult,
    warnings: &mut Vec<MappingWarning>,
) {
    let remote = match body.get(&mapping.fieldname) {
        Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(true)) => "True".to_string(),
        _ => return,
    };
    debug!(field = %mapping.fieldname, value = %remote, "group mapping field");
    let Some(group) = mapping.table.get(&remote) else {
        return;
    };
    if known.contains(group) {
        info!(group = %group, "adding group");
        fields.push_group(group.as_str());
    } else {
        warn!(group = %group, "group is not available");
        warnings.push(MappingWarning::UnknownGroup { name: group.clone() });
    }
}

/// One resource per upstream link with a url. The link named after the
/// resource's `alternate` goes first with position 0.
fn link_resources(body: &ResourceBody) -> Vec<CatalogResource> {
    let alternate = body.alternate();
    let mut resources = Vec::new();
    let mut position = 0u32;
    for link in body.links() {
        let Some(url) = link.url.clone().filter(|u| !u.is_empty()) else {
            continue;
        };
        position += 1;
        let name = link.name.clone().unwrap_or_default();
        let is_main = alternate.is_some() && link.name.as_deref() == alternate;
        let resource = CatalogResource {
            description: format!(
                "{name}\n\n{} {}",
                link.extension.as_deref().unwrap_or_default(),
                link.link_type.as_deref().unwrap_or_default()
            ),
            url,
            name,
            mimetype: link.mime.clone(),
            format: link.extension.clone(),
            position: if is_main { 0 } else { position },
        };
        if is_main {
            debug!(name = %resource.name, "found main resource");
            resources.insert(0, resource);
        } else {
            resources.push(resource);
        }
    }
    resources
}

fn map_resources(source_url: &str, pk: &str, first_position: u32) -> Vec<CatalogResource> {
    let base = source_url.trim_end_matches('/');
    let entries = [
        ("Map view", "Map client in GeoNode", "html", format!("{base}/maps/{pk}/view")),
        ("Map details", "Map details in GeoNode", "html", format!("{base}/maps/{pk}")),
        ("Map", "Full Web Map Context", "wmc", format!("{base}/maps/{pk}/wmc")),
    ];
    entries
        .into_iter()
        .zip(first_position..)
        .map(|((name, description, format, url), position)| CatalogResource {
            name: name.to_string(),
            url,
            description: description.to_string(),
            mimetype: None,
            format: Some(format.to_string()),
            position,
        })
        .collect()
}

/// URL-safe name: slug of the title (or the resource name) plus a guid suffix
/// so that equal titles do not collide.
pub fn generate_name(resource: &GeoResource, guid: &str) -> Option<String> {
    let body = resource.body();
    let fallback = match resource {
        GeoResource::Layer(layer) => layer.name().or_else(|| body.alternate()),
        _ => body.alternate(),
    };
    let stem = [body.title(), fallback]
        .into_iter()
        .flatten()
        .map(slugify)
        .find(|s| !s.is_empty())?;

    let suffix: String = guid
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(GUID_SUFFIX_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if suffix.is_empty() {
        Some(stem)
    } else {
        Some(format!("{stem}-{suffix}"))
    }
}

pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if c == '_' {
            slug.push('_');
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.chars().take(MAX_NAME_STEM).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// `YYYY-MM-DD` for the date formats GeoNode emits; anything else verbatim.
pub fn format_date(value: &str) -> String {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed.date_naive().to_string();
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, pattern) {
            return parsed.date().to_string();
        }
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return parsed.to_string();
    }
    value.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Extent {
    west: f64,
    east: f64,
    south: f64,
    north: f64,
}

fn extent_of(polygon: &JsonValue) -> Option<Extent> {
    let rings = polygon.get("coordinates")?.as_array()?;
    let mut extent: Option<Extent> = None;
    for point in rings.iter().filter_map(JsonValue::as_array).flatten() {
        let Some([x, y]) = point
            .as_array()
            .and_then(|p| Some([p.first()?.as_f64()?, p.get(1)?.as_f64()?]))
        else {
            continue;
        };
        extent = Some(match extent {
            None => Extent {
                west: x,
                east: x,
                south: y,
                north: y,
            },
            Some(e) => Extent {
                west: e.west.min(x),
                east: e.east.max(x),
                south: e.south.min(y),
                north: e.north.max(y),
            },
        });
    }
    extent
}

fn spatial_extras(body: &ResourceBody, fields: &mut MappingResult) {
    fields.set_extra("spatial-reference-system", body.srid());
    fields.set_extra("graphic-preview-file", body.thumbnail_url());

    let Some(extent) = body.bbox_polygon().and_then(extent_of) else {
        return;
    };
    fields.set_extra("bbox-east-long", extent.east);
    fields.set_extra("bbox-north-lat", extent.north);
    fields.set_extra("bbox-south-lat", extent.south);
    fields.set_extra("bbox-west-long", extent.west);

    let geometry = if extent.west == extent.east || extent.south == extent.north {
        warn!("point extent defined instead of polygon");
        json!({"type": "Point", "coordinates": [extent.west, extent.south]})
    } else {
        let (w, e, s, n) = (extent.west, extent.east, extent.south, extent.north);
        json!({
            "type": "Polygon",
            "coordinates": [[[w, s], [e, s], [e, n], [w, n], [w, s]]]
        })
    };
    fields.set_extra("spatial", geometry.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnh_adapters::SourceMode;
    use gnh_core::{ExtraValue, ResourceKind};
    use gnh_rules::RuleSet;
    use std::sync::Arc;

    fn source(rules: JsonValue) -> HarvestSource {
        HarvestSource {
            source_id: "geonode-demo".into(),
            display_name: "Demo".into(),
            mode: SourceMode::Api,
            url: "https://geo.example.org/".into(),
            fixture_dir: None,
            owner_org: Some("regional-office".into()),
            kinds: ResourceKind::ALL.to_vec(),
            rules: RuleSet::from_json(&rules, &Default::default()).unwrap(),
            import_fields: vec!["license".into(), "missing_field".into()],
            group_mapping: Some(GroupMapping {
                fieldname: "subtype".into(),
                table: Arc::new([("vector".to_string(), "vector-data".to_string())].into()),
            }),
        }
    }

    fn scalar(result: &MappingResult, key: &str) -> Option<JsonValue> {
        match result.extra(key)? {
            ExtraValue::Scalar(v) => Some(v.clone()),
            ExtraValue::List(items) => Some(JsonValue::Array(items.clone())),
        }
    }

    fn layer() -> String {
        json!({
            "pk": 12,
            "uuid": "0b7a2d5e-41c3-4f7e-9a55-3d1e6c2f8a10",
            "resource_type": "dataset",
            "subtype": "vector",
            "title": "Rivers of the Upper Basin",
            "abstract": "Main watercourses.",
            "alternate": "geonode:rivers",
            "srid": "EPSG:4326",
            "date": "2021-06-30T00:00:00Z",
            "date_type": "publication",
            "license": {"identifier": "cc-by"},
            "owner": {"username": "hydro", "first_name": "", "last_name": ""},
            "keywords": [{"name": "rivers"}, {"name": "x".repeat(60)}],
            "ll_bbox_polygon": {"type": "Polygon", "coordinates": [[[10.5, 43.9], [10.5, 44.4], [11.1, 44.4], [11.1, 43.9], [10.5, 43.9]]]},
            "links": [
                {"name": "Zip", "url": "https://geo.example.org/12.zip", "extension": "zip", "link_type": "data", "mime": "application/zip"},
                {"name": "no url"},
                {"name": "geonode:rivers", "url": "https://geo.example.org/12", "extension": "html", "link_type": "html"}
            ]
        })
        .to_string()
    }

    #[test]
    fn layers_get_base_fields_resources_and_extras() {
        let src = source(JsonValue::Null);
        let ctx = CycleContext::new(&src, BTreeSet::from(["vector-data".to_string()]));
        let mapped = map_record(&ctx, "0b7a2d5e-41c3-4f7e-9a55-3d1e6c2f8a10", &layer(), None).unwrap();
        let record = mapped.record;

        assert_eq!(record.name, "rivers-of-the-upper-basin-0b7a2d5e");
        assert_eq!(record.owner_org.as_deref(), Some("regional-office"));
        assert_eq!(record.notes.as_deref(), Some("Main watercourses."));
        let long = "x".repeat(50);
        assert_eq!(record.fields.tag_names(), vec!["rivers", long.as_str(), "Layer"]);
        assert_eq!(record.fields.groups.len(), 1);

        assert_eq!(record.resources.len(), 2);
        assert_eq!(record.resources[0].name, "geonode:rivers");
        assert_eq!(record.resources[0].position, 0);
        assert_eq!(record.resources[1].position, 1);
        assert_eq!(record.resources[1].description, "Zip\n\nzip data");

        let f = &record.fields;
        assert_eq!(scalar(f, "geonode_author"), Some(json!("[hydro]")));
        assert_eq!(scalar(f, "publication_date"), Some(json!("2021-06-30")));
        assert_eq!(scalar(f, "license"), Some(json!({"identifier": "cc-by"})));
        assert!(f.extra("missing_field").is_none());
        assert_eq!(scalar(f, "bbox-west-long"), Some(json!(10.5)));
        assert_eq!(scalar(f, "bbox-north-lat"), Some(json!(44.4)));
        assert_eq!(scalar(f, "is_vector"), Some(json!(true)));
        let spatial: JsonValue =
            serde_json::from_str(scalar(f, "spatial").unwrap().as_str().unwrap()).unwrap();
        assert_eq!(spatial["type"], "Polygon");
    }

    #[test]
    fn layers_carry_dcat_profile_extras_ahead_of_the_rules() {
        let src = source(json!([{"actions": [{"value": "from-rules", "destination": "tag"}]}]));
        let ctx = CycleContext::new(&src, BTreeSet::new());
        let mut content: JsonValue = serde_json::from_str(&layer()).unwrap();
        content["keywords"] = json!([]);
        content["doi"] = json!("10.5281/zenodo.1234");
        content["last_updated"] = json!("2022-01-14T09:16:59.993468Z");
        content["language"] = json!("ita");
        content["maintenance_frequency"] = json!("quarterly");
        content["temporal_extent_start"] = json!("2020-01-01T00:00:00Z");
        content["regions"] = json!([{"code": "ITA", "name": "Italy"}, {"code": "TOS", "name": "Toscana"}]);
        content["tkeywords"] = json!([
            {"name": "hy", "thesaurus": {"uri": "http://inspire.ec.europa.eu/theme"}, "i18n": {"it": "Idrografia"}},
            {"name": "lc", "thesaurus": {"uri": "http://inspire.ec.europa.eu/theme"}},
            {"name": "hy", "thesaurus": {"uri": "http://example.org/other"}, "i18n": {"it": "Altro"}}
        ]);

        let record = map_record(&ctx, "0b7a2d5e", &content.to_string(), None).unwrap().record;
        let f = &record.fields;
        assert_eq!(
            f.tag_names(),
            vec!["Idrografia", "Italy", "Toscana", "from-rules", "Layer"]
        );
        assert_eq!(scalar(f, "identifier"), Some(json!("0b7a2d5e-41c3-4f7e-9a55-3d1e6c2f8a10")));
        assert_eq!(
            scalar(f, "alternate_identifier"),
            Some(json!(r#"[{"identifier":"10.5281/zenodo.1234"}]"#))
        );
        let themes: JsonValue =
            serde_json::from_str(scalar(f, "themes_aggregate").unwrap().as_str().unwrap()).unwrap();
        assert_eq!(
            themes,
            json!([
                {"theme": "AGRI", "subthemes": []},
                {"theme": "ENVI", "subthemes": []}
            ])
        );
        assert_eq!(scalar(f, "issued"), Some(json!("2021-06-30")));
        assert_eq!(scalar(f, "modified"), Some(json!("2022-01-14")));
        assert_eq!(scalar(f, "geographical_name"), Some(json!("{ITA,TOS}")));
        assert_eq!(scalar(f, "language"), Some(json!("ITA")));
        assert_eq!(scalar(f, "frequency"), Some(json!("ANNUAL_3")));
        let coverage: JsonValue =
            serde_json::from_str(scalar(f, "temporal_coverage").unwrap().as_str().unwrap()).unwrap();
        assert_eq!(coverage, json!([{"temporal_start": "2020-01-01", "temporal_end": null}]));
        assert_eq!(record.frequency, "UNKNOWN");
    }

    #[test]
    fn unchanged_titles_keep_the_catalog_name() {
        let src = source(JsonValue::Null);
        let ctx = CycleContext::new(&src, BTreeSet::new());
        let existing = CatalogEntry {
            name: "rivers-legacy".into(),
            title: "Rivers of the Upper Basin".into(),
        };
        let kept = map_record(&ctx, "0b7a2d5e", &layer(), Some(&existing)).unwrap().record;
        assert_eq!(kept.name, "rivers-legacy");

        let retitled = CatalogEntry {
            title: "Old rivers".into(),
            ..existing
        };
        let fresh = map_record(&ctx, "0b7a2d5e", &layer(), Some(&retitled)).unwrap().record;
        assert_eq!(fresh.name, "rivers-of-the-upper-basin-0b7a2d5e");
    }

    #[test]
    fn unknown_legacy_group_is_a_warning() {
        let src = source(JsonValue::Null);
        let ctx = CycleContext::new(&src, BTreeSet::new());
        let mapped = map_record(&ctx, "g-1", &layer(), None).unwrap();
        assert!(mapped.record.fields.groups.is_empty());
        assert_eq!(
            mapped.warnings,
            vec![MappingWarning::UnknownGroup {
                name: "vector-data".into()
            }]
        );
    }

    #[test]
    fn maps_get_viewer_resources_and_rules_run_before_the_kind_tag() {
        let src = source(json!([
            {"filters": ["resource_type=='map'"], "actions": [{"value": "Risk", "destination": "tag"}]}
        ]));
        let ctx = CycleContext::new(&src, BTreeSet::new());
        let content = json!({
            "pk": 41, "uuid": "6c4a", "resource_type": "map", "title": "Risk areas",
            "ll_bbox_polygon": {"type": "Polygon", "coordinates": [[[1, 2], [1, 2]]]}
        })
        .to_string();
        let record = map_record(&ctx, "6c4a", &content, None).unwrap().record;

        assert_eq!(record.fields.tag_names(), vec!["Risk", "Map"]);
        let urls: Vec<_> = record.resources.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://geo.example.org/maps/41/view",
                "https://geo.example.org/maps/41",
                "https://geo.example.org/maps/41/wmc"
            ]
        );
        let spatial = scalar(&record.fields, "spatial").unwrap();
        assert!(spatial.as_str().unwrap().contains("\"Point\""));
    }

    #[test]
    fn documents_without_bbox_are_not_spatial() {
        let src = source(JsonValue::Null);
        let ctx = CycleContext::new(&src, BTreeSet::new());
        let content = json!({"uuid": "d", "resource_type": "document", "title": "Report", "srid": "EPSG:4326"}).to_string();
        let record = map_record(&ctx, "d", &content, None).unwrap().record;
        assert!(record.fields.extra("spatial-reference-system").is_none());
        assert_eq!(record.fields.tag_names(), vec!["Doc"]);
    }

    #[test]
    fn names_fall_back_and_fail_without_any_source() {
        let untitled = GeoResource::from_json(json!({"resource_type": "dataset", "title": "???", "name": "dtm_10m"})).unwrap();
        assert_eq!(generate_name(&untitled, "AB-cd").as_deref(), Some("dtm_10m-abcd"));

        let src = source(JsonValue::Null);
        let ctx = CycleContext::new(&src, BTreeSet::new());
        let err = map_record(&ctx, "g", r#"{"resource_type":"map","title":""}"#, None).unwrap_err();
        assert!(matches!(err, RecordImportError::NoName));
        let err = map_record(&ctx, "g", r#"{"resource_type":"geoapp"}"#, None).unwrap_err();
        assert!(matches!(err, RecordImportError::Content(_)));
    }

    #[test]
    fn dates_are_reduced_to_days() {
        assert_eq!(format_date("2022-03-14T09:30:00Z"), "2022-03-14");
        assert_eq!(format_date("2022-03-14T09:30:00.123456"), "2022-03-14");
        assert_eq!(format_date("2022-03-14"), "2022-03-14");
        assert_eq!(format_date("spring 2020"), "spring 2020");
        assert_eq!(slugify("  Rivers & Lakes -- 2021 "), "rivers-lakes-2021");
    }
}
