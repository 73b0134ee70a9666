//! Configuration-driven adapter for sites exposing JSON product feeds.
//!
//! Search responses may be a bare array or an object wrapping the array in
//! `items`, `products`, `results` or `data`. Field names are matched
//! loosely (`title`/`name`, `original_price`/`list_price`/`msrp`, ...) and
//! prices may be numbers or strings such as `"$1,299.00"`.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};

use super::{SearchQuery, SiteAdapter};
use crate::config::SiteConfig;
use crate::error::ScrapeError;
use crate::market::fingerprint::Fingerprint;
use crate::session::Session;
use crate::types::{Deal, PartialListing};

const LIST_KEYS: &[&str] = &["items", "products", "results", "data"];
const TITLE_KEYS: &[&str] = &["title", "name", "product_name"];
const URL_KEYS: &[&str] = &["url", "link", "href"];
const BRAND_KEYS: &[&str] = &["brand", "vendor", "manufacturer"];
const SKU_KEYS: &[&str] = &["sku", "style_code", "style", "product_id"];
const PRICE_KEYS: &[&str] = &["price", "sale_price", "current_price"];
const ORIGINAL_PRICE_KEYS: &[&str] = &[
    "original_price",
    "list_price",
    "msrp",
    "retail_price",
    "compare_at_price",
];
const MARKET_PRICE_KEYS: &[&str] = &["market_price", "price", "lowest_ask", "last_sale"];

pub struct JsonFeedAdapter {
    name: String,
    search_url: String,
    market_prices_url: Option<String>,
    browser: bool,
}

impl JsonFeedAdapter {
    pub fn new(name: impl Into<String>, search_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            search_url: search_url.into(),
            market_prices_url: None,
            browser: false,
        }
    }

    pub fn from_config(cfg: &SiteConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            search_url: cfg.search_url.clone(),
            market_prices_url: cfg.market_prices_url.clone(),
            browser: cfg.browser,
        }
    }

    pub fn with_market_prices(mut self, url: impl Into<String>) -> Self {
        self.market_prices_url = Some(url.into());
        self
    }

    /// Search URL with `{keywords}` and `{category}` filled in.
    pub fn search_url_for(&self, query: &SearchQuery) -> String {
        let encode = |v: &Option<String>| {
            v.as_deref()
                .map(|s| urlencoding::encode(s).into_owned())
                .unwrap_or_default()
        };
        self.search_url
            .replace("{keywords}", &encode(&query.keywords))
            .replace("{category}", &encode(&query.category))
    }

    fn listing_from(&self, item: &Value) -> Option<PartialListing> {
        let title = string_field(item, TITLE_KEYS)?;
        Some(PartialListing {
            site: self.name.clone(),
            title,
            url: string_field(item, URL_KEYS),
            brand: string_field(item, BRAND_KEYS),
            sku: string_field(item, SKU_KEYS),
            price: price_field(item, PRICE_KEYS),
            original_price: price_field(item, ORIGINAL_PRICE_KEYS),
        })
    }
}

#[async_trait]
impl SiteAdapter for JsonFeedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefers_browser(&self) -> bool {
        self.browser
    }

    async fn search(
        &self,
        session: &dyn Session,
        query: &SearchQuery,
    ) -> Result<Vec<PartialListing>, ScrapeError> {
        let url = self.search_url_for(query);
        let page = session.fetch(&url).await?;
        let doc = parse_document(&page.body)?;

        let items = item_array(&doc)
            .ok_or_else(|| ScrapeError::Parse(format!("no item list in response from {url}")))?;

        let mut listings = Vec::with_capacity(items.len());
        for item in items {
            match self.listing_from(item) {
                Some(listing) => listings.push(listing),
                None => debug!(site = %self.name, "Skipping feed item without a title"),
            }
        }
        debug!(site = %self.name, found = listings.len(), "Search complete");
        Ok(listings)
    }

    async fn get_detail(&self, session: &dyn Session, url: &str) -> Result<Deal, ScrapeError> {
        let page = session.fetch(url).await?;
        let doc = parse_document(&page.body)?;
        let item = doc
            .get("product")
            .or_else(|| doc.get("item"))
            .unwrap_or(&doc);

        let mut listing = self
            .listing_from(item)
            .ok_or_else(|| ScrapeError::Parse(format!("detail page {url} has no title")))?;
        let price = listing
            .price
            .ok_or_else(|| ScrapeError::Parse(format!("detail page {url} has no price")))?;
        listing.original_price.get_or_insert(price);
        if listing.url.is_none() {
            listing.url = Some(url.to_string());
        }

        listing
            .into_deal(Utc::now())
            .ok_or_else(|| ScrapeError::Parse(format!("detail page {url} is incomplete")))
    }

    fn provides_market_prices(&self) -> bool {
        self.market_prices_url.is_some()
    }

    async fn get_market_prices(
        &self,
        session: &dyn Session,
    ) -> Result<HashMap<Fingerprint, Decimal>, ScrapeError> {
        let Some(url) = &self.market_prices_url else {
            return Ok(HashMap::new());
        };
        let page = session.fetch(url).await?;
        let doc = parse_document(&page.body)?;

        let mut prices = HashMap::new();
        if let Some(items) = item_array(&doc) {
            for item in items {
                let sku = string_field(item, SKU_KEYS);
                let title = string_field(item, TITLE_KEYS).unwrap_or_default();
                let Some(price) = price_field(item, MARKET_PRICE_KEYS) else {
                    continue;
                };
                if sku.is_none() && title.is_empty() {
                    continue;
                }
                prices.insert(Fingerprint::for_listing(sku.as_deref(), &title), price);
            }
        } else if let Some(map) = doc.as_object() {
            // {"sku:DD1391100": 150, "Air Jordan 1 Retro High": "250.00"}
            for (key, value) in map {
                match (key.parse::<Fingerprint>(), price_value(value)) {
                    (Ok(fp), Some(price)) => {
                        prices.insert(fp, price);
                    }
                    _ => debug!(site = %self.name, key = %key, "Skipping market price entry"),
                }
            }
        } else {
            return Err(ScrapeError::Parse(format!("unrecognised market price payload from {url}")));
        }

        if prices.is_empty() {
            warn!(site = %self.name, "Market price feed returned no prices");
        }
        Ok(prices)
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Parse a body as JSON, tolerating the HTML wrapper browsers put around
/// raw JSON responses.
fn parse_document(body: &str) -> Result<Value, ScrapeError> {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        return Ok(v);
    }
    let start = body.find(['{', '[']);
    let end = body.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if e > s => Ok(serde_json::from_str(&body[s..=e])?),
        _ => Err(ScrapeError::Parse("response is not JSON".to_string())),
    }
}

fn item_array(doc: &Value) -> Option<&Vec<Value>> {
    if let Some(arr) = doc.as_array() {
        return Some(arr);
    }
    LIST_KEYS.iter().find_map(|k| doc.get(*k).and_then(Value::as_array))
}

fn string_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match item.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn price_field(item: &Value, keys: &[&str]) -> Option<Decimal> {
    keys.iter().find_map(|k| item.get(*k).and_then(price_value))
}

fn price_value(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect(),
        _ => return None,
    };
    Decimal::from_str(&text).ok().filter(|d| *d >= Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EngineKind, FetchedPage};
    use rust_decimal_macros::dec;

    /// Serves canned bodies by URL prefix.
    struct CannedSession(Vec<(&'static str, String)>);

    #[async_trait]
    impl Session for CannedSession {
        fn engine(&self) -> EngineKind {
            EngineKind::Http
        }

        async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
            let body = self
                .0
                .iter()
                .find(|(prefix, _)| url.starts_with(prefix))
                .map(|(_, body)| body.clone())
                .ok_or_else(|| ScrapeError::from_status(404, url))?;
            Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                body,
                engine: EngineKind::Http,
            })
        }

        async fn close(&self) {}
    }

    fn adapter() -> JsonFeedAdapter {
        JsonFeedAdapter::new("outlet", "https://outlet.example.com/api/search?q={keywords}&c={category}")
    }

    #[test]
    fn test_search_url_encoding() {
        let url = adapter().search_url_for(&SearchQuery {
            keywords: Some("air jordan".into()),
            category: None,
        });
        assert_eq!(url, "https://outlet.example.com/api/search?q=air%20jordan&c=");
    }

    #[test]
    fn test_price_parsing() {
        assert_eq!(price_value(&serde_json::json!(89.99)), Some(dec!(89.99)));
        assert_eq!(price_value(&serde_json::json!("$1,299.00")), Some(dec!(1299.00)));
        assert_eq!(price_value(&serde_json::json!("n/a")), None);
        assert_eq!(price_value(&serde_json::json!(null)), None);
    }

    #[tokio::test]
    async fn test_search_parses_wrapped_items() {
        let body = serde_json::json!({
            "products": [
                {"name": "Dunk Low Panda", "link": "https://outlet.example.com/p/dunk",
                 "brand": "Nike", "sku": "DD1391-100", "price": "$89.99", "msrp": 120},
                {"title": "Samba OG", "url": "https://outlet.example.com/p/samba"},
                {"price": 10}
            ]
        })
        .to_string();
        let session = CannedSession(vec![("https://outlet.example.com/api/search", body)]);

        let listings = adapter()
            .search(&session, &SearchQuery::default())
            .await
            .unwrap();
        assert_eq!(listings.len(), 2);
        assert!(listings[0].is_complete());
        assert_eq!(listings[0].price, Some(dec!(89.99)));
        assert_eq!(listings[0].original_price, Some(dec!(120)));
        assert!(!listings[1].is_complete());
    }

    #[tokio::test]
    async fn test_search_non_json_is_parse_error() {
        let session = CannedSession(vec![("https://outlet", "<html>maintenance</html>".into())]);
        let err = adapter()
            .search(&session, &SearchQuery::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_search_tolerates_browser_wrapper() {
        let body = r#"<html><body><pre>[{"title":"Gel-Kayano 14","price":110,"list_price":150}]</pre></body></html>"#;
        let session = CannedSession(vec![("https://outlet", body.into())]);
        let listings = adapter()
            .search(&session, &SearchQuery::default())
            .await
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "Gel-Kayano 14");
    }

    #[tokio::test]
    async fn test_get_detail_builds_deal() {
        let body = serde_json::json!({
            "product": {"title": "Samba OG", "brand": "Adidas", "price": 70, "original_price": 100}
        })
        .to_string();
        let session = CannedSession(vec![("https://outlet.example.com/p/samba", body)]);
        let deal = adapter()
            .get_detail(&session, "https://outlet.example.com/p/samba?utm_source=x")
            .await
            .unwrap();
        assert_eq!(deal.site, "outlet");
        assert_eq!(deal.discount_percent, dec!(30));
        assert_eq!(deal.url.as_deref(), Some("https://outlet.example.com/p/samba"));
    }

    #[tokio::test]
    async fn test_get_detail_without_price() {
        let body = r#"{"title": "Samba OG"}"#.to_string();
        let session = CannedSession(vec![("https://outlet.example.com/p/samba", body)]);
        let err = adapter()
            .get_detail(&session, "https://outlet.example.com/p/samba")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_market_prices_array_and_map() {
        let resale = adapter().with_market_prices("https://resale.example.com/prices");
        assert!(resale.provides_market_prices());

        let body = serde_json::json!({"items": [
            {"sku": "DD1391-100", "lowest_ask": 150},
            {"title": "Air Jordan 1 Retro High", "market_price": "250"},
            {"title": "No Price"}
        ]})
        .to_string();
        let session = CannedSession(vec![("https://resale.example.com/prices", body)]);
        let prices = resale.get_market_prices(&session).await.unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&Fingerprint::sku("DD1391100").unwrap()], dec!(150));

        let body = r#"{"sku:DD1391-100": 155, "Samba OG": "95.50"}"#.to_string();
        let session = CannedSession(vec![("https://resale.example.com/prices", body)]);
        let prices = resale.get_market_prices(&session).await.unwrap();
        assert_eq!(prices[&Fingerprint::title("samba og").unwrap()], dec!(95.50));
    }

    #[tokio::test]
    async fn test_no_market_prices_by_default() {
        let session = CannedSession(vec![]);
        assert!(!adapter().provides_market_prices());
        assert!(adapter().get_market_prices(&session).await.unwrap().is_empty());
    }
}
