//! Upstream archive + metadata sources and their wire formats.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tcph_core::{format_day, parse_day, GroupRecord, PriceRow, ProductRecord};
use tcph_storage::{FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "tcph-source";

pub const DEFAULT_BASE_URL: &str = "https://tcgcsv.com";

/// Category the dataset tracks; 3 is the card game the upstream aggregator
/// files these archives under.
pub const DEFAULT_CATEGORY_ID: u32 = 3;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {what}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Black-box provider of one day's compressed price archive. `None` means
/// the upstream recorded nothing for that date.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch_day(&self, date: NaiveDate) -> Result<Option<Vec<u8>>, SourceError>;
}

/// Black-box provider of the full current products and groups tables.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_groups(&self) -> Result<Vec<GroupRecord>, SourceError>;
    async fn fetch_products(&self) -> Result<Vec<ProductRecord>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub category_id: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SourceConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("TCPH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            category_id: std::env::var("TCPH_CATEGORY_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CATEGORY_ID),
            user_agent: std::env::var("TCPH_USER_AGENT")
                .unwrap_or_else(|_| "tcph-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("TCPH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }
}

/// HTTP implementation of both source traits against the tcgcsv-style
/// endpoint layout.
#[derive(Debug)]
pub struct TcgCsvClient {
    config: SourceConfig,
    http: HttpFetcher,
}

impl TcgCsvClient {
    pub fn new(config: SourceConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self { config, http })
    }

    pub fn category_id(&self) -> u32 {
        self.config.category_id
    }

    fn archive_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/archive/tcgplayer/prices-{}.zip",
            self.config.base_url,
            format_day(date)
        )
    }

    fn groups_url(&self) -> String {
        format!(
            "{}/tcgplayer/{}/groups",
            self.config.base_url, self.config.category_id
        )
    }

    fn products_url(&self, group_id: i64) -> String {
        format!(
            "{}/tcgplayer/{}/{}/products",
            self.config.base_url, self.config.category_id, group_id
        )
    }
}

#[async_trait]
impl ArchiveSource for TcgCsvClient {
    async fn fetch_day(&self, date: NaiveDate) -> Result<Option<Vec<u8>>, SourceError> {
        Ok(self.http.fetch_optional(&self.archive_url(date)).await?)
    }
}

#[async_trait]
impl MetadataSource for TcgCsvClient {
    async fn fetch_groups(&self) -> Result<Vec<GroupRecord>, SourceError> {
        let bytes = self.http.fetch_bytes(&self.groups_url()).await?;
        parse_groups_payload(&bytes)
    }

    async fn fetch_products(&self) -> Result<Vec<ProductRecord>, SourceError> {
        let groups = self.fetch_groups().await?;
        let mut products = Vec::new();
        for group in &groups {
            let bytes = self.http.fetch_bytes(&self.products_url(group.group_id)).await?;
            products.extend(parse_products_payload(&bytes, group.group_id)?);
        }
        Ok(products)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceEntry {
    product_id: i64,
    #[serde(default)]
    sub_type_name: Option<String>,
    #[serde(default)]
    low_price: Option<f64>,
    #[serde(default)]
    mid_price: Option<f64>,
    #[serde(default)]
    high_price: Option<f64>,
    #[serde(default)]
    market_price: Option<f64>,
    #[serde(default)]
    direct_low_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupEntry {
    group_id: i64,
    name: String,
    #[serde(default)]
    abbreviation: Option<String>,
    #[serde(default)]
    published_on: Option<String>,
    #[serde(default)]
    category_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductEntry {
    product_id: i64,
    name: String,
    #[serde(default)]
    clean_name: Option<String>,
    #[serde(default)]
    group_id: Option<i64>,
    #[serde(default)]
    category_id: Option<i64>,
    #[serde(default)]
    extended_data: Vec<ExtendedField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedField {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: Option<JsonValue>,
}

fn decode_error(what: &str, source: serde_json::Error) -> SourceError {
    SourceError::Decode {
        what: what.to_string(),
        source,
    }
}

/// One group's parsed day listing. Malformed rows are skipped and counted
/// rather than failing the group.
#[derive(Debug, Default, Clone)]
pub struct GroupPrices {
    pub rows: Vec<PriceRow>,
    pub rows_skipped: usize,
}

/// Parse a raw `prices` listing for one group. The envelope itself must
/// decode; individual malformed rows are tolerated.
pub fn parse_price_listing(
    bytes: &[u8],
    group_id: i64,
    date: NaiveDate,
) -> Result<GroupPrices, SourceError> {
    let envelope: Envelope<JsonValue> =
        serde_json::from_slice(bytes).map_err(|e| decode_error("price listing", e))?;

    let mut parsed = GroupPrices::default();
    for value in envelope.results {
        match serde_json::from_value::<PriceEntry>(value) {
            Ok(entry) => parsed.rows.push(PriceRow {
                product_id: entry.product_id,
                group_id,
                date,
                sub_type_name: entry.sub_type_name,
                low_price: entry.low_price,
                mid_price: entry.mid_price,
                high_price: entry.high_price,
                market_price: entry.market_price,
                direct_low_price: entry.direct_low_price,
            }),
            Err(err) => {
                warn!(group = group_id, error = %err, "skipping malformed price row");
                parsed.rows_skipped += 1;
            }
        }
    }
    Ok(parsed)
}

/// Parse the groups metadata payload. Metadata must decode fully; a
/// malformed entry here is fatal, unlike price rows.
pub fn parse_groups_payload(bytes: &[u8]) -> Result<Vec<GroupRecord>, SourceError> {
    let envelope: Envelope<GroupEntry> =
        serde_json::from_slice(bytes).map_err(|e| decode_error("groups metadata", e))?;
    Ok(envelope
        .results
        .into_iter()
        .map(|entry| GroupRecord {
            group_id: entry.group_id,
            name: entry.name,
            abbreviation: entry.abbreviation,
            release_date: entry.published_on.as_deref().and_then(parse_upstream_date),
            category_id: entry.category_id,
        })
        .collect())
}

/// Parse one group's products metadata payload. `fallback_group` fills in
/// the group id when the upstream omits it from the product entry.
pub fn parse_products_payload(
    bytes: &[u8],
    fallback_group: i64,
) -> Result<Vec<ProductRecord>, SourceError> {
    let envelope: Envelope<ProductEntry> =
        serde_json::from_slice(bytes).map_err(|e| decode_error("products metadata", e))?;
    Ok(envelope
        .results
        .into_iter()
        .map(|entry| {
            let rarity = extended_text(&entry.extended_data, "Rarity");
            let card_number = extended_text(&entry.extended_data, "Number");
            ProductRecord {
                product_id: entry.product_id,
                name: entry.name,
                clean_name: entry.clean_name,
                group_id: entry.group_id.unwrap_or(fallback_group),
                category_id: entry.category_id,
                rarity,
                card_number,
            }
        })
        .collect())
}

/// Upstream timestamps look like `2024-02-08T00:00:00`; only the calendar
/// date matters here.
fn parse_upstream_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    parse_day(day).ok()
}

fn extended_text(fields: &[ExtendedField], key: &str) -> Option<String> {
    fields
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(key))
        .and_then(|f| f.value.as_ref())
        .and_then(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Unpack a day archive into `extracted/<date>/` and return the directory
/// holding the per-group listings. An already-extracted non-empty day
/// directory is reused as-is.
pub fn extract_day_archive(
    bytes: &[u8],
    extracted_root: &Path,
    date: NaiveDate,
    category_id: u32,
) -> anyhow::Result<PathBuf> {
    let day_dir = extracted_root.join(format_day(date));
    if !dir_is_empty(&day_dir) {
        return Ok(group_root(&day_dir, category_id));
    }

    std::fs::create_dir_all(&day_dir)
        .with_context(|| format!("creating {}", day_dir.display()))?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .with_context(|| format!("opening day archive for {}", format_day(date)))?;
    archive
        .extract(&day_dir)
        .with_context(|| format!("extracting day archive into {}", day_dir.display()))?;

    Ok(group_root(&day_dir, category_id))
}

/// Archives nest listings under a top-level category directory; fall back to
/// the day directory itself when that level is absent.
fn group_root(day_dir: &Path, category_id: u32) -> PathBuf {
    let nested = day_dir.join(category_id.to_string());
    if nested.is_dir() {
        nested
    } else {
        day_dir.to_path_buf()
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}
