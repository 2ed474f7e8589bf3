//! Feed source contracts, the two provider feeds, and record normalization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metfeed_core::{CanonicalRecord, Dataset, RecordId, ALERT_ISSUER, FORECASTS_SCHEMA};
use metfeed_storage::{FetchError, HttpFetcher};
use rss::Channel;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "metfeed-adapters";

pub const DEFAULT_ALERTS_URL: &str = "https://metproducts.gov.tt/ttms/public/api/feed?type=rss";
pub const DEFAULT_FORECASTS_URL: &str = "https://metproducts.gov.tt/api/forecasts";

const RSS_ACCEPT: &str = "application/xml, text/xml";
const JSON_ACCEPT: &str = "application/json";

/// One provider item as received, before normalization.
pub type RawRecord = JsonValue;

/// One page of a feed, with whatever pagination metadata the provider sent.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub items: Vec<RawRecord>,
    pub current_page: Option<u32>,
    pub page_count: Option<u32>,
    /// Response body as received, kept for the raw archive.
    pub body: Vec<u8>,
    pub extension: &'static str,
}

impl FeedPage {
    /// True when the metadata says more pages follow. A missing `currentPage` means the
    /// provider served the page that was asked for.
    pub fn has_next(&self, requested: u32) -> bool {
        match self.page_count {
            Some(count) => self.current_page.unwrap_or(requested) < count,
            None => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("malformed {dataset} response: {message}")]
    MalformedBody { dataset: Dataset, message: String },
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn dataset(&self) -> Dataset;

    /// Fetch page `page` (1-based).
    async fn fetch_page(&self, page: u32) -> Result<FeedPage, FeedError>;
}

/// The provider's RSS alert feed. Always a single page.
#[derive(Debug, Clone)]
pub struct RssAlertSource {
    http: HttpFetcher,
    url: String,
}

impl RssAlertSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FeedSource for RssAlertSource {
    fn dataset(&self) -> Dataset {
        Dataset::Alerts
    }

    async fn fetch_page(&self, _page: u32) -> Result<FeedPage, FeedError> {
        let response = self
            .http
            .fetch_bytes(Dataset::Alerts, &self.url, RSS_ACCEPT)
            .await?;
        let items = parse_rss_items(&response.body)?;
        debug!(items = items.len(), "parsed rss alert feed");
        Ok(FeedPage {
            items,
            current_page: None,
            page_count: None,
            body: response.body,
            extension: "xml",
        })
    }
}

/// The provider's paginated JSON forecast API.
#[derive(Debug, Clone)]
pub struct ForecastApiSource {
    http: HttpFetcher,
    base_url: String,
}

impl ForecastApiSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn page_url(&self, page: u32) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}page={page}", self.base_url)
    }
}

#[async_trait]
impl FeedSource for ForecastApiSource {
    fn dataset(&self) -> Dataset {
        Dataset::Forecasts
    }

    async fn fetch_page(&self, page: u32) -> Result<FeedPage, FeedError> {
        let url = self.page_url(page);
        let response = self
            .http
            .fetch_bytes(Dataset::Forecasts, &url, JSON_ACCEPT)
            .await?;
        let parsed = parse_forecast_page(&response.body)?;
        debug!(
            page,
            items = parsed.items.len(),
            current_page = ?parsed.current_page,
            page_count = ?parsed.page_count,
            "parsed forecast page"
        );
        Ok(FeedPage {
            items: parsed.items,
            current_page: parsed.current_page,
            page_count: parsed.page_count,
            body: response.body,
            extension: "json",
        })
    }
}

/// Extract `<item>` elements from an RSS document. Absent child elements are omitted
/// from the raw record.
pub fn parse_rss_items(xml: &[u8]) -> Result<Vec<RawRecord>, FeedError> {
    let channel = Channel::read_from(xml).map_err(|e| FeedError::MalformedBody {
        dataset: Dataset::Alerts,
        message: e.to_string(),
    })?;

    Ok(channel
        .items()
        .iter()
        .map(|item| {
            let mut raw = Map::new();
            let pairs = [
                ("title", item.title()),
                ("description", item.description()),
                ("link", item.link()),
                ("pub_date", item.pub_date()),
            ];
            for (name, value) in pairs {
                if let Some(value) = value {
                    raw.insert(name.to_string(), JsonValue::String(value.to_string()));
                }
            }
            JsonValue::Object(raw)
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedForecastPage {
    pub items: Vec<RawRecord>,
    pub current_page: Option<u32>,
    pub page_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ForecastEnvelope {
    #[serde(default)]
    items: Option<Vec<JsonValue>>,
    #[serde(rename = "_meta", default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct PageMeta {
    #[serde(rename = "currentPage", default)]
    current_page: Option<JsonValue>,
    #[serde(rename = "pageCount", default)]
    page_count: Option<JsonValue>,
}

/// Parse `{ items: [...], _meta: { currentPage, pageCount } }`. Page numbers may arrive
/// as numbers or numeric strings; anything else reads as absent.
pub fn parse_forecast_page(body: &[u8]) -> Result<ParsedForecastPage, FeedError> {
    let envelope: ForecastEnvelope =
        serde_json::from_slice(body).map_err(|e| FeedError::MalformedBody {
            dataset: Dataset::Forecasts,
            message: e.to_string(),
        })?;
    let meta = envelope.meta.unwrap_or_default();
    Ok(ParsedForecastPage {
        items: envelope.items.unwrap_or_default(),
        current_page: meta.current_page.as_ref().and_then(lenient_u32),
        page_count: meta.page_count.as_ref().and_then(lenient_u32),
    })
}

fn lenient_u32(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{dataset} record is missing required field `{field}`")]
    MissingField {
        dataset: Dataset,
        field: &'static str,
    },
}

/// Severity keywords, checked in order against the lowercased title.
pub const ALERT_LEVELS: &[(&str, &str)] = &[
    ("yellow", "YELLOW"),
    ("orange", "ORANGE"),
    ("red", "RED"),
    ("green", "GREEN"),
];

/// Category keywords, checked in order against the lowercased title.
pub const ALERT_TYPES: &[(&str, &str)] = &[
    ("adverse weather", "ADVERSE_WEATHER"),
    ("high wind", "HIGH_WIND"),
    ("flood", "FLOOD"),
    ("hazardous seas", "HAZARDOUS_SEAS"),
    ("discontinuation", "DISCONTINUATION"),
    ("cancellation", "DISCONTINUATION"),
];

pub fn classify_alert_level(title: &str) -> &'static str {
    first_keyword_match(title, ALERT_LEVELS).unwrap_or("UNKNOWN")
}

pub fn classify_alert_type(title: &str) -> &'static str {
    first_keyword_match(title, ALERT_TYPES).unwrap_or("OTHER")
}

fn first_keyword_match(text: &str, table: &[(&str, &'static str)]) -> Option<&'static str> {
    let text = text.to_lowercase();
    table
        .iter()
        .find(|(keyword, _)| text.contains(keyword))
        .map(|(_, label)| *label)
}

/// Alert key: first 50 characters of the title and first 20 of the publication date,
/// joined by `_`, with spaces and colons replaced by `_`.
///
/// Two alerts sharing both prefixes collapse onto one row.
pub fn alert_id(title: &str, pub_date: &str) -> String {
    let title: String = title.chars().take(50).collect();
    let pub_date: String = pub_date.chars().take(20).collect();
    format!("{title}_{pub_date}").replace([' ', ':'], "_")
}

/// Maps raw provider items onto the dataset schemas.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordNormalizer;

impl RecordNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(
        &self,
        dataset: Dataset,
        raw: &RawRecord,
        ingested_at: DateTime<Utc>,
    ) -> Result<CanonicalRecord, NormalizeError> {
        match dataset {
            Dataset::Alerts => normalize_alert(raw, ingested_at),
            Dataset::Forecasts => normalize_forecast(raw, ingested_at),
        }
    }

    /// Normalize a batch, dropping malformed items. Returns the records in input order
    /// and how many were dropped.
    pub fn normalize_all(
        &self,
        dataset: Dataset,
        raws: &[RawRecord],
        ingested_at: DateTime<Utc>,
    ) -> (Vec<CanonicalRecord>, u64) {
        let mut records = Vec::with_capacity(raws.len());
        let mut dropped = 0u64;
        for (index, raw) in raws.iter().enumerate() {
            match self.normalize(dataset, raw, ingested_at) {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!(%dataset, index, %error, "dropping malformed record");
                    dropped += 1;
                }
            }
        }
        (records, dropped)
    }
}

fn normalize_alert(
    raw: &RawRecord,
    ingested_at: DateTime<Utc>,
) -> Result<CanonicalRecord, NormalizeError> {
    let title = text_value(raw, "title")
        .filter(|t| !t.trim().is_empty())
        .ok_or(NormalizeError::MissingField {
            dataset: Dataset::Alerts,
            field: "title",
        })?;
    let description = text_value(raw, "description").unwrap_or_default();
    let link = text_value(raw, "link").unwrap_or_default();
    let pub_date = text_value(raw, "pub_date").unwrap_or_default();

    let id = RecordId::Text(alert_id(&title, &pub_date));
    let level = classify_alert_level(&title);
    let kind = classify_alert_type(&title);

    Ok(CanonicalRecord::from_schema(
        Dataset::Alerts,
        id,
        ingested_at,
        |name| match name {
            "title" => Some(title.clone()),
            "description" => Some(description.clone()),
            "link" => Some(link.clone()),
            "pub_date" => Some(pub_date.clone()),
            "alert_level" => Some(level.to_string()),
            "alert_type" => Some(kind.to_string()),
            "issued_by" => Some(ALERT_ISSUER.to_string()),
            _ => None,
        },
    ))
}

fn normalize_forecast(
    raw: &RawRecord,
    ingested_at: DateTime<Utc>,
) -> Result<CanonicalRecord, NormalizeError> {
    let id = raw
        .get(FORECASTS_SCHEMA.id_column)
        .and_then(forecast_id)
        .ok_or(NormalizeError::MissingField {
            dataset: Dataset::Forecasts,
            field: FORECASTS_SCHEMA.id_column,
        })?;

    Ok(CanonicalRecord::from_schema(
        Dataset::Forecasts,
        RecordId::Numeric(id),
        ingested_at,
        |name| text_value(raw, name),
    ))
}

fn forecast_id(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Column text for a raw field: strings verbatim, other scalars as JSON text, nested
/// values as compact JSON. Null and absent are `None`.
fn text_value(raw: &RawRecord, name: &str) -> Option<String> {
    match raw.get(name)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
