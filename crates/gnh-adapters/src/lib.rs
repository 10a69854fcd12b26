//! Upstream listing contracts + GeoNode REST and fixture-directory implementations.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use gnh_core::ResourceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod http;

pub use http::{HttpSettings, PageFetchError, PageFetcher, RetryPolicy};

pub const CRATE_NAME: &str = "gnh-adapters";

pub const DEFAULT_MAX_PAGES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Api,
    Fixture,
}

/// One upstream resource as listed, before any mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRecord {
    pub guid: String,
    pub pk: Option<String>,
    pub title: Option<String>,
    pub kind: ResourceKind,
    pub raw: JsonValue,
}

impl UpstreamRecord {
    /// `None` when the object carries no usable `uuid`.
    pub fn from_json(kind: ResourceKind, raw: JsonValue) -> Option<Self> {
        let guid = raw
            .get("uuid")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_string();
        let pk = match raw.get("pk").or_else(|| raw.get("id")) {
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let title = raw
            .get("title")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        Some(Self {
            guid,
            pk,
            title,
            kind,
            raw,
        })
    }

    /// Serialized snapshot compared byte-for-byte across cycles.
    pub fn content(&self) -> String {
        self.raw.to_string()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {kind} listing page {url}: {source}")]
    Fetch {
        kind: ResourceKind,
        url: String,
        #[source]
        source: PageFetchError,
    },
    #[error("{kind} listing page {url} is malformed: {message}")]
    MalformedPage {
        kind: ResourceKind,
        url: String,
        message: String,
    },
    #[error("{kind} listing did not terminate: {message}")]
    Paging { kind: ResourceKind, message: String },
    #[error("source {0} is configured for fixtures but has no fixture_dir")]
    MissingFixtureDir(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Every record of `kind`, across all pages. A failure on any page fails
    /// the whole listing.
    async fn fetch_all(&self, kind: ResourceKind) -> Result<Vec<UpstreamRecord>, AdapterError>;
}

/// Records of one listing page plus the link to the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub records: Vec<UpstreamRecord>,
    pub next: Option<String>,
    pub skipped: usize,
}

/// Accepts a paged listing object (`{"links": {"next": ..}, "<list key>": [..]}`)
/// or a bare array.
pub fn parse_page(kind: ResourceKind, url: &str, page: JsonValue) -> Result<ListingPage, AdapterError> {
    let malformed = |message: &str| AdapterError::MalformedPage {
        kind,
        url: url.to_string(),
        message: message.to_string(),
    };

    let (items, next) = match page {
        JsonValue::Array(items) => (items, None),
        JsonValue::Object(mut obj) => {
            let next = match obj.get("links").and_then(|links| links.get("next")) {
                None | Some(JsonValue::Null) => None,
                Some(JsonValue::String(s)) if s.is_empty() => None,
                Some(JsonValue::String(s)) => Some(s.clone()),
                Some(_) => return Err(malformed("links.next is not a string")),
            };
            let items = match obj.remove(kind.list_key()) {
                Some(JsonValue::Array(items)) => items,
                Some(_) => return Err(malformed("resource list is not an array")),
                None => return Err(malformed("resource list is missing")),
            };
            (items, next)
        }
        _ => return Err(malformed("page is neither an object nor an array")),
    };

    let mut records = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for item in items {
        match UpstreamRecord::from_json(kind, item) {
            Some(record) => {
                info!(
                    kind = %kind,
                    guid = %record.guid,
                    pk = record.pk.as_deref().unwrap_or("-"),
                    title = record.title.as_deref().unwrap_or(""),
                    "found upstream resource"
                );
                records.push(record);
            }
            None => {
                warn!(kind = %kind, url, "skipping upstream resource without uuid");
                skipped += 1;
            }
        }
    }

    Ok(ListingPage {
        records,
        next,
        skipped,
    })
}

/// Follows `next` links from `start` until one is absent. A repeated link or
/// more than `max_pages` pages is an error.
pub async fn walk_pages<F, Fut>(
    kind: ResourceKind,
    start: String,
    max_pages: usize,
    mut fetch_page: F,
) -> Result<Vec<UpstreamRecord>, AdapterError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<JsonValue, AdapterError>>,
{
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut next = Some(start);
    let mut pages = 0usize;

    while let Some(url) = next.take() {
        if !seen.insert(url.clone()) {
            return Err(AdapterError::Paging {
                kind,
                message: format!("page {url} was already visited"),
            });
        }
        pages += 1;
        if pages > max_pages {
            return Err(AdapterError::Paging {
                kind,
                message: format!("more than {max_pages} pages"),
            });
        }

        debug!(kind = %kind, url = %url, "retrieving listing page");
        let body = fetch_page(url.clone()).await?;
        let page = parse_page(kind, &url, body)?;
        records.extend(page.records);
        next = page.next;
    }

    Ok(records)
}

/// Paged client for the GeoNode v2 REST API.
#[derive(Debug, Clone)]
pub struct GeoNodeClient {
    source_id: String,
    base_url: String,
    fetcher: Arc<PageFetcher>,
    run_id: Uuid,
    max_pages: usize,
}

impl GeoNodeClient {
    pub fn new(source_id: impl Into<String>, base_url: &str, fetcher: Arc<PageFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            fetcher,
            run_id: Uuid::new_v4(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn listing_url(&self, kind: ResourceKind) -> String {
        format!("{}/api/v2/{}/", self.base_url, kind.api_path())
    }
}

#[async_trait]
impl UpstreamSource for GeoNodeClient {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_all(&self, kind: ResourceKind) -> Result<Vec<UpstreamRecord>, AdapterError> {
        let span = info_span!("listing", run_id = %self.run_id, source_id = %self.source_id, kind = %kind);
        walk_pages(kind, self.listing_url(kind), self.max_pages, |url| async move {
            self.fetcher
                .get_page(&url)
                .await
                .map_err(|source| AdapterError::Fetch { kind, url, source })
        })
        .instrument(span)
        .await
    }
}

/// Reads listings from `<dir>/<listing path>.json`; `links.next` names another
/// file in the same directory. A missing first page is an empty listing.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    source_id: String,
    dir: PathBuf,
    max_pages: usize,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            dir: dir.into(),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    fn page_path(&self, link: &str) -> PathBuf {
        let file_name = link.rsplit('/').next().unwrap_or(link);
        self.dir.join(file_name)
    }
}

async fn read_page(path: &Path) -> anyhow::Result<JsonValue> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl UpstreamSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_all(&self, kind: ResourceKind) -> Result<Vec<UpstreamRecord>, AdapterError> {
        let first = format!("{}.json", kind.api_path());
        if !self.page_path(&first).exists() {
            debug!(kind = %kind, dir = %self.dir.display(), "no fixture listing for kind");
            return Ok(Vec::new());
        }
        walk_pages(kind, first, self.max_pages, |link| {
            let path = self.page_path(&link);
            async move { Ok(read_page(&path).await?) }
        })
        .await
    }
}

/// Builds the upstream for a configured source. `run_id` tags the listing spans.
pub fn upstream_for_source(
    source_id: &str,
    mode: SourceMode,
    url: &str,
    fixture_dir: Option<&Path>,
    fetcher: Arc<PageFetcher>,
    run_id: Uuid,
) -> Result<Box<dyn UpstreamSource>, AdapterError> {
    match mode {
        SourceMode::Api => Ok(Box::new(
            GeoNodeClient::new(source_id, url, fetcher).with_run_id(run_id),
        )),
        SourceMode::Fixture => {
            let dir = fixture_dir.ok_or_else(|| AdapterError::MissingFixtureDir(source_id.to_string()))?;
            Ok(Box::new(FixtureSource::new(source_id, dir)))
        }
    }
}
