//! Collaborator contracts for the reconciliation engine: the procurement feeds, purchase
//! detail pages and the public notification channel, plus their HTTP and fixture
//! implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pautabot_core::{NaturalKey, Purchase, SellerTotal, SellerTotals};
use pautabot_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "pautabot-adapters";

pub const DEFAULT_CATALOG_URL: &str = "https://gobiernoabierto.bahia.gob.ar/WS/2307/{year}";
pub const DEFAULT_TOTALS_URL: &str = "https://gobiernoabierto.bahia.gob.ar/WS/2328/{year}";
pub const DEFAULT_DETAIL_URL_TEMPLATE: &str = "https://www.bahia.gob.ar/compras/data/oc/{year}/{order}";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {feed} payload: {source}")]
    Decode {
        feed: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("notification transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification endpoint answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("notification response carried no id")]
    MissingId,
    #[error("notification channel is not configured: {0}")]
    NotConfigured(String),
}

/// A feed body as decoded, with the raw bytes kept for archiving.
#[derive(Debug, Clone)]
pub struct FetchedFeed<T> {
    pub value: T,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub description: String,
}

impl LineItem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// Ordered line-items of one purchase order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PurchaseDetail {
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
}

#[async_trait]
pub trait ProcurementSource: Send + Sync {
    /// Every purchase order of the configured fiscal year.
    async fn fetch_catalog(&self) -> Result<FetchedFeed<Vec<Purchase>>, SourceError>;

    /// Cumulative advertising spend per seller for the configured fiscal year.
    async fn fetch_totals(&self) -> Result<FetchedFeed<SellerTotals>, SourceError>;

    async fn fetch_detail(&self, key: NaturalKey) -> Result<PurchaseDetail, SourceError>;

    /// Public page a reader can follow to the order.
    fn detail_url(&self, key: NaturalKey) -> String;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish one notification and return the channel's identifier for it.
    async fn publish(&self, notification: &Notification) -> Result<String, PublishError>;
}

/// Deferred notifier construction: connecting may fail and is skipped when a cycle has
/// nothing to send.
#[async_trait]
pub trait NotifierFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Notifier>, PublishError>;
}

pub fn decode_catalog(raw: &[u8]) -> Result<Vec<Purchase>, SourceError> {
    serde_json::from_slice(raw).map_err(|source| SourceError::Decode {
        feed: "catalog",
        source,
    })
}

pub fn decode_totals(raw: &[u8]) -> Result<SellerTotals, SourceError> {
    let rows: Vec<SellerTotal> = serde_json::from_slice(raw).map_err(|source| SourceError::Decode {
        feed: "totals",
        source,
    })?;
    Ok(SellerTotals::from_rows(rows))
}

const LINE_ITEM_ARRAYS: [&str; 3] = ["items", "renglones", "detalle"];
const DESCRIPTION_FIELDS: [&str; 3] = ["descripcion", "detalle", "description"];

/// Extract ordered line-items from a detail page body, which may be JSON or HTML.
///
/// Recognised rows come first. The page's full text always follows as a final line-item,
/// so a marker outside any recognised row (a heading, an unknown JSON field) is still seen
/// by the classifier.
pub fn parse_detail_payload(body: &[u8]) -> Result<PurchaseDetail, SourceError> {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        return Ok(PurchaseDetail::default());
    }

    let (mut line_items, page_text) = match serde_json::from_str::<JsonValue>(&text) {
        Ok(value) => (json_line_items(&value).unwrap_or_default(), json_page_text(&value)),
        Err(_) => {
            let document = Html::parse_document(&text);
            let page_text =
                collapse_whitespace(&document.root_element().text().collect::<Vec<_>>().join(" "));
            (html_line_items(&document)?, page_text)
        }
    };

    if !page_text.is_empty() {
        line_items.push(LineItem::new(page_text));
    }
    Ok(PurchaseDetail { line_items })
}

/// Every string value in the document, depth first.
fn json_page_text(value: &JsonValue) -> String {
    fn collect<'a>(value: &'a JsonValue, out: &mut Vec<&'a str>) {
        match value {
            JsonValue::String(s) => out.push(s),
            JsonValue::Array(items) => items.iter().for_each(|item| collect(item, out)),
            JsonValue::Object(fields) => fields.values().for_each(|field| collect(field, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    collect(value, &mut parts);
    collapse_whitespace(&parts.join(" "))
}

fn json_line_items(value: &JsonValue) -> Option<Vec<LineItem>> {
    let rows = match value {
        JsonValue::Array(rows) => rows,
        JsonValue::Object(map) => LINE_ITEM_ARRAYS
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array))?,
        _ => return None,
    };
    Some(
        rows.iter()
            .filter_map(|row| match row {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Object(fields) => DESCRIPTION_FIELDS
                    .iter()
                    .find_map(|key| fields.get(*key).and_then(JsonValue::as_str))
                    .map(ToString::to_string),
                _ => None,
            })
            .map(LineItem::new)
            .collect(),
    )
}

fn html_line_items(document: &Html) -> Result<Vec<LineItem>, SourceError> {
    let rows = Selector::parse("tr").map_err(|e| SourceError::Message(e.to_string()))?;
    let cells = Selector::parse("td").map_err(|e| SourceError::Message(e.to_string()))?;
    Ok(document
        .select(&rows)
        .filter_map(|row| {
            let text = row
                .select(&cells)
                .map(|cell| cell.text().collect::<String>())
                .collect::<Vec<_>>()
                .join(" ");
            let text = collapse_whitespace(&text);
            if text.is_empty() {
                None
            } else {
                Some(LineItem::new(text))
            }
        })
        .collect())
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Concrete URLs of the three open-data feeds for one fiscal year.
#[derive(Debug, Clone)]
pub struct SourceEndpoints {
    pub year: i32,
    pub catalog_url: String,
    pub totals_url: String,
    pub detail_url_template: String,
}

impl SourceEndpoints {
    pub fn for_year(year: i32) -> Self {
        Self {
            year,
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            totals_url: DEFAULT_TOTALS_URL.to_string(),
            detail_url_template: DEFAULT_DETAIL_URL_TEMPLATE.to_string(),
        }
    }

    pub fn catalog(&self) -> String {
        self.catalog_url.replace("{year}", &self.year.to_string())
    }

    pub fn totals(&self) -> String {
        self.totals_url.replace("{year}", &self.year.to_string())
    }

    pub fn detail(&self, key: NaturalKey) -> String {
        self.detail_url_template
            .replace("{year}", &key.fiscal_year.to_string())
            .replace("{order}", &key.order_number.to_string())
    }
}

/// The municipal open-government endpoints, fetched over HTTP.
#[derive(Debug, Clone)]
pub struct OpenDataSource {
    http: HttpFetcher,
    endpoints: SourceEndpoints,
}

impl OpenDataSource {
    pub fn new(http: HttpFetcher, endpoints: SourceEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &SourceEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl ProcurementSource for OpenDataSource {
    async fn fetch_catalog(&self) -> Result<FetchedFeed<Vec<Purchase>>, SourceError> {
        let response = self.http.fetch_bytes("catalog", &self.endpoints.catalog()).await?;
        let value = decode_catalog(&response.body)?;
        debug!(purchases = value.len(), "catalog decoded");
        Ok(FetchedFeed {
            value,
            raw: response.body,
        })
    }

    async fn fetch_totals(&self) -> Result<FetchedFeed<SellerTotals>, SourceError> {
        let response = self.http.fetch_bytes("totals", &self.endpoints.totals()).await?;
        let value = decode_totals(&response.body)?;
        debug!(sellers = value.len(), "totals decoded");
        Ok(FetchedFeed {
            value,
            raw: response.body,
        })
    }

    async fn fetch_detail(&self, key: NaturalKey) -> Result<PurchaseDetail, SourceError> {
        let response = self.http.fetch_bytes("detail", &self.endpoints.detail(key)).await?;
        parse_detail_payload(&response.body)
    }

    fn detail_url(&self, key: NaturalKey) -> String {
        self.endpoints.detail(key)
    }
}

/// Serves captured feeds from a directory: `catalog.json`, `totals.json` and
/// `details/<year>-<order>.{json,html}`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
    endpoints: SourceEndpoints,
}

impl FixtureSource {
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            endpoints: SourceEndpoints::for_year(0),
        }
    }

    pub fn with_endpoints(mut self, endpoints: SourceEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, path: PathBuf) -> Result<Vec<u8>, SourceError> {
        tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound(path.display().to_string())
            } else {
                SourceError::Io { path, source }
            }
        })
    }
}

#[async_trait]
impl ProcurementSource for FixtureSource {
    async fn fetch_catalog(&self) -> Result<FetchedFeed<Vec<Purchase>>, SourceError> {
        let raw = self.read(self.root.join("catalog.json")).await?;
        Ok(FetchedFeed {
            value: decode_catalog(&raw)?,
            raw,
        })
    }

    async fn fetch_totals(&self) -> Result<FetchedFeed<SellerTotals>, SourceError> {
        let raw = self.read(self.root.join("totals.json")).await?;
        Ok(FetchedFeed {
            value: decode_totals(&raw)?,
            raw,
        })
    }

    async fn fetch_detail(&self, key: NaturalKey) -> Result<PurchaseDetail, SourceError> {
        let stem = format!("{}-{}", key.fiscal_year, key.order_number);
        let details = self.root.join("details");
        let json = details.join(format!("{stem}.json"));
        let path = if json.exists() {
            json
        } else {
            details.join(format!("{stem}.html"))
        };
        parse_detail_payload(&self.read(path).await?)
    }

    fn detail_url(&self, key: NaturalKey) -> String {
        self.endpoints.detail(key)
    }
}

const NOTIFICATION_TEMPLATE: &str = "
🤖 pautabot reportando nuevo 💸 gasto en pauta publicitaria:

📰  Proveedor: {seller}
🏛  Dependencia: {department}
🗓  Fecha: {date}
💵  Importe: $ {amount}

{url}
";

/// Mathematical bold rendering of ASCII letters and digits; other characters pass through.
pub fn boldify(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'a'..='z' => offset_char(0x1D41A, c as u32 - 'a' as u32, c),
            'A'..='Z' => offset_char(0x1D400, c as u32 - 'A' as u32, c),
            '0'..='9' => offset_char(0x1D7CE, c as u32 - '0' as u32, c),
            '!' => '❗',
            '?' => '❓',
            _ => c,
        })
        .collect()
}

/// Sans-serif bold digits, so amounts stand out without bolding the currency sign.
pub fn monodigits(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '0'..='9' => offset_char(0x1D7EC, c as u32 - '0' as u32, c),
            _ => c,
        })
        .collect()
}

fn offset_char(base: u32, offset: u32, fallback: char) -> char {
    char::from_u32(base + offset).unwrap_or(fallback)
}

/// Whole amounts keep one decimal (`1200.0`); others print their shortest exact form.
pub fn format_amount(amount: f64) -> String {
    if amount.is_finite() && amount.fract() == 0.0 {
        format!("{amount:.1}")
    } else {
        amount.to_string()
    }
}

pub fn render_notification(purchase: &Purchase, detail_url: &str) -> Notification {
    let text = NOTIFICATION_TEMPLATE
        .replace("{seller}", &boldify(&purchase.seller))
        .replace("{department}", &boldify(&purchase.department))
        .replace("{date}", &purchase.date.to_string())
        .replace("{amount}", &monodigits(&format_amount(purchase.amount)))
        .replace("{url}", detail_url);
    Notification { text }
}

pub const DEFAULT_TWITTER_API_BASE: &str = "https://api.twitter.com";

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AuthenticatedUser {
    #[serde(default)]
    username: Option<String>,
}

/// Connects to the Twitter v2 API with a user-context bearer token.
#[derive(Debug, Clone)]
pub struct TwitterNotifierFactory {
    client: reqwest::Client,
    api_base: String,
    access_token: Option<String>,
}

impl TwitterNotifierFactory {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }
}

#[async_trait]
impl NotifierFactory for TwitterNotifierFactory {
    async fn connect(&self) -> Result<Box<dyn Notifier>, PublishError> {
        let token = self
            .access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PublishError::NotConfigured("TWITTER_ACCESS_TOKEN is not set".into()))?;

        let resp = self
            .client
            .get(format!("{}/2/users/me", self.api_base))
            .bearer_auth(&token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let me: ApiEnvelope<AuthenticatedUser> = resp.json().await?;
        info!(
            username = me.data.and_then(|u| u.username).as_deref().unwrap_or("<unknown>"),
            "notification credentials verified"
        );

        Ok(Box::new(TwitterNotifier {
            client: self.client.clone(),
            api_base: self.api_base.clone(),
            access_token: token,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct TwitterNotifier {
    client: reqwest::Client,
    api_base: String,
    access_token: String,
}

#[async_trait]
impl Notifier for TwitterNotifier {
    async fn publish(&self, notification: &Notification) -> Result<String, PublishError> {
        // Never retried here: a repeated POST could publish the same order twice.
        let resp = self
            .client
            .post(format!("{}/2/tweets", self.api_base))
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "text": notification.text }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let created: ApiEnvelope<CreatedTweet> = resp.json().await?;
        created.data.map(|t| t.id).ok_or(PublishError::MissingId)
    }
}
