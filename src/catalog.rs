//! Authenticated client for the product metadata catalog.
//!
//! The catalog speaks the STAC search API: a POST with an `intersects`
//! geometry, a datetime interval and property constraints, answered with a
//! FeatureCollection page that may link to the next page. Pages are
//! followed until exhausted. Transient failures and rate limiting are
//! retried with bounded exponential backoff, honoring a server-supplied
//! `Retry-After` hint; authentication failures surface immediately.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use stac::Item;
use tracing::{debug, warn};
use url::Url;

use crate::aoi::AreaOfInterest;
use crate::error::FetchError;
use crate::retry::RetryPolicy;

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque bearer token with an optional expiry, resolved by an external
/// credential provider. The client never refreshes it; an expired token
/// fails the query cleanly instead of sending a doomed request.
#[derive(Clone)]
pub struct BearerToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl BearerToken {
    pub fn new(secret: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret,
            expires_at: Some(expires_at),
        }
    }

    pub fn non_expiring(secret: String) -> Self {
        Self {
            secret,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Constraints a catalog query is scoped to.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub platform: String,
    pub product_type: String,
    pub cloud_cover_min: f64,
    pub cloud_cover_max: f64,
}

impl QueryFilter {
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.date_start > self.date_end {
            return Err(FetchError::Config(format!(
                "date_start {} is after date_end {}",
                self.date_start, self.date_end
            )));
        }
        if self.cloud_cover_min < 0.0
            || self.cloud_cover_min > self.cloud_cover_max
            || self.cloud_cover_max > 100.0
        {
            return Err(FetchError::Config(format!(
                "cloud cover bounds {}..{} violate 0 <= min <= max <= 100",
                self.cloud_cover_min, self.cloud_cover_max
            )));
        }
        Ok(())
    }

    pub fn matches(&self, product: &Product) -> bool {
        let date = product.acquisition_date.date_naive();
        date >= self.date_start
            && date <= self.date_end
            && product.cloud_cover_percent >= self.cloud_cover_min
            && product.cloud_cover_percent <= self.cloud_cover_max
    }
}

/// One catalog candidate. Immutable once returned by the catalog.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub footprint: Value,
    pub acquisition_date: DateTime<Utc>,
    pub cloud_cover_percent: f64,
}

/// One page of a STAC search response. Only the fields the pagination loop
/// needs are deserialized.
#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    features: Vec<Item>,
    #[serde(default)]
    links: Vec<PageLink>,
}

#[derive(Deserialize)]
struct PageLink {
    rel: String,
    href: String,
}

enum PageRequest {
    Search(Value),
    Next(Url),
}

pub struct CatalogClient {
    http: reqwest::Client,
    endpoint: Url,
    collection: String,
    token: BearerToken,
    retry: RetryPolicy,
    page_size: usize,
}

impl CatalogClient {
    pub fn new(
        endpoint: Url,
        collection: String,
        token: BearerToken,
        retry: RetryPolicy,
    ) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            collection,
            token,
            retry,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Query the catalog for every product intersecting `aoi` and
    /// satisfying `filter`, paginating until exhausted. An empty result is
    /// not an error.
    pub async fn query(
        &self,
        aoi: &AreaOfInterest,
        filter: &QueryFilter,
    ) -> Result<Vec<Product>, FetchError> {
        filter.validate()?;

        let mut products: Vec<Product> = vec![];
        let mut request = PageRequest::Search(build_search_body(
            &self.collection,
            aoi,
            filter,
            self.page_size,
        ));

        for page_index in 0..MAX_PAGES {
            let page = self.fetch_page(&request).await?;
            debug!(page = page_index, items = page.features.len(), "catalog page received");

            for item in &page.features {
                match product_from_item(item) {
                    Ok(product) => products.push(product),
                    Err(reason) => {
                        warn!(item = %item.id, %reason, "skipping catalog item");
                    }
                }
            }

            let next = page.links.iter().find(|l| l.rel == "next");
            let Some(link) = next else { break };
            if page_index + 1 == MAX_PAGES {
                // Truncating silently would misreport the candidate set.
                return Err(FetchError::Network(format!(
                    "catalog still offered a next link after {MAX_PAGES} pages"
                )));
            }
            let href = Url::parse(&link.href).map_err(|e| {
                FetchError::Network(format!("invalid next link '{}': {e}", link.href))
            })?;
            request = PageRequest::Next(href);
        }

        // The server applies the same constraints, but the pipeline
        // guarantees them regardless of what the catalog returned.
        products.retain(|p| filter.matches(p));
        Ok(products)
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<SearchPage, FetchError> {
        let mut delay = self.retry.initial_delay;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if self.token.is_expired(Utc::now()) {
                return Err(FetchError::Auth("bearer token expired".to_string()));
            }

            let send = match request {
                PageRequest::Search(body) => self
                    .http
                    .post(self.endpoint.clone())
                    .bearer_auth(self.token.secret())
                    .json(body)
                    .send(),
                PageRequest::Next(url) => self
                    .http
                    .get(url.clone())
                    .bearer_auth(self.token.secret())
                    .send(),
            };

            match send.await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(FetchError::Auth(format!("catalog returned {status}")));
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let hint = retry_after(&response);
                        if attempt == self.retry.max_attempts {
                            return Err(FetchError::RateLimit { retry_after: hint });
                        }
                        let wait = hint.unwrap_or(delay).min(self.retry.max_delay);
                        warn!(attempt, wait_ms = wait.as_millis() as u64, "catalog rate limited");
                        tokio::time::sleep(wait).await;
                        delay = self.retry.next_delay(delay);
                        continue;
                    }
                    if status.is_server_error() {
                        last_error = format!("catalog returned {status}");
                    } else if !status.is_success() {
                        return Err(FetchError::Network(format!("catalog returned {status}")));
                    } else {
                        return response
                            .json::<SearchPage>()
                            .await
                            .map_err(|e| FetchError::Network(format!("invalid catalog response: {e}")));
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < self.retry.max_attempts {
                warn!(attempt, error = %last_error, "catalog request failed, retrying");
                tokio::time::sleep(delay).await;
                delay = self.retry.next_delay(delay);
            }
        }

        Err(FetchError::Network(format!(
            "catalog query failed after {} attempts: {last_error}",
            self.retry.max_attempts
        )))
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn build_search_body(
    collection: &str,
    aoi: &AreaOfInterest,
    filter: &QueryFilter,
    limit: usize,
) -> Value {
    let mut query = json!({
        "eo:cloud_cover": {
            "gte": filter.cloud_cover_min,
            "lte": filter.cloud_cover_max,
        },
    });
    if !filter.product_type.is_empty() {
        query["productType"] = json!({ "eq": filter.product_type });
    }
    if !filter.platform.is_empty() {
        query["platform"] = json!({ "eq": filter.platform });
    }

    json!({
        "collections": [collection],
        "intersects": aoi.to_geojson(),
        "datetime": format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            filter.date_start, filter.date_end
        ),
        "query": query,
        "limit": limit,
    })
}

/// Map a STAC item onto a Product. The returned reason is diagnostic only;
/// a nonconforming item is skipped, not fatal for the query.
fn product_from_item(item: &Item) -> Result<Product, String> {
    let value = serde_json::to_value(item).map_err(|e| e.to_string())?;
    let properties = value
        .get("properties")
        .ok_or_else(|| "item has no properties".to_string())?;

    let datetime = properties
        .get("datetime")
        .and_then(Value::as_str)
        .ok_or_else(|| "item has no datetime".to_string())?;
    let acquisition_date = DateTime::parse_from_rfc3339(datetime)
        .map_err(|e| format!("unparsable datetime '{datetime}': {e}"))?
        .with_timezone(&Utc);

    let cloud_cover_percent = properties
        .get("eo:cloud_cover")
        .and_then(Value::as_f64)
        .ok_or_else(|| "item has no eo:cloud_cover".to_string())?;

    let footprint = value.get("geometry").cloned().unwrap_or(Value::Null);
    let title = item.id.trim_end_matches(".SAFE").to_string();

    Ok(Product {
        id: item.id.clone(),
        title,
        footprint,
        acquisition_date,
        cloud_cover_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::AreaOfInterest;

    fn london_aoi() -> AreaOfInterest {
        AreaOfInterest::new(vec![
            (-0.15, 51.48),
            (-0.15, 51.52),
            (-0.10, 51.52),
            (-0.10, 51.48),
            (-0.15, 51.48),
        ])
        .unwrap()
    }

    fn filter() -> QueryFilter {
        QueryFilter {
            date_start: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            date_end: NaiveDate::from_ymd_opt(2025, 8, 7).unwrap(),
            platform: "sentinel-2b".to_string(),
            product_type: "S2MSI2A".to_string(),
            cloud_cover_min: 0.0,
            cloud_cover_max: 30.0,
        }
    }

    fn item(id: &str, datetime: &str, cloud: f64) -> Item {
        serde_json::from_value(json!({
            "type": "Feature",
            "stac_version": "1.0.0",
            "id": id,
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[0.0, 51.0], [0.0, 52.0], [1.0, 52.0], [1.0, 51.0], [0.0, 51.0]]],
            },
            "properties": {
                "datetime": datetime,
                "eo:cloud_cover": cloud,
            },
            "links": [],
            "assets": {},
        }))
        .unwrap()
    }

    #[test]
    fn filter_validation_rejects_inverted_dates() {
        let mut f = filter();
        f.date_end = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert!(f.validate().is_err());
    }

    #[test]
    fn filter_validation_rejects_bad_cloud_bounds() {
        let mut f = filter();
        f.cloud_cover_min = 40.0;
        assert!(f.validate().is_err());
        f.cloud_cover_min = 0.0;
        f.cloud_cover_max = 130.0;
        assert!(f.validate().is_err());
    }

    #[test]
    fn search_body_carries_all_constraints() {
        let body = build_search_body("SENTINEL-2", &london_aoi(), &filter(), 100);
        assert_eq!(body["collections"][0], "SENTINEL-2");
        assert_eq!(body["intersects"]["type"], "Polygon");
        assert_eq!(body["datetime"], "2025-01-01T00:00:00Z/2025-08-07T23:59:59Z");
        assert_eq!(body["query"]["eo:cloud_cover"]["gte"], 0.0);
        assert_eq!(body["query"]["eo:cloud_cover"]["lte"], 30.0);
        assert_eq!(body["query"]["productType"]["eq"], "S2MSI2A");
        assert_eq!(body["query"]["platform"]["eq"], "sentinel-2b");
        assert_eq!(body["limit"], 100);
    }

    #[test]
    fn product_from_conforming_item() {
        let item = item(
            "S2B_MSIL2A_20250315T104619_N0511_R008_T31UDA_20250315T133000.SAFE",
            "2025-03-15T10:46:19Z",
            8.0,
        );
        let product = product_from_item(&item).unwrap();
        assert_eq!(
            product.title,
            "S2B_MSIL2A_20250315T104619_N0511_R008_T31UDA_20250315T133000"
        );
        assert_eq!(product.cloud_cover_percent, 8.0);
        assert_eq!(product.acquisition_date.date_naive().to_string(), "2025-03-15");
        assert_eq!(product.footprint["type"], "Polygon");
    }

    #[test]
    fn item_without_cloud_cover_is_rejected() {
        let item: Item = serde_json::from_value(json!({
            "type": "Feature",
            "stac_version": "1.0.0",
            "id": "incomplete",
            "geometry": null,
            "properties": { "datetime": "2025-03-15T10:46:19Z" },
            "links": [],
            "assets": {},
        }))
        .unwrap();
        assert!(product_from_item(&item).is_err());
    }

    #[test]
    fn filter_matches_respects_bounds() {
        let f = filter();
        let product = product_from_item(&item("a", "2025-03-15T10:46:19Z", 8.0)).unwrap();
        assert!(f.matches(&product));

        let cloudy = product_from_item(&item("b", "2025-03-15T10:46:19Z", 45.0)).unwrap();
        assert!(!f.matches(&cloudy));

        let late = product_from_item(&item("c", "2025-09-01T10:46:19Z", 8.0)).unwrap();
        assert!(!f.matches(&late));
    }

    #[test]
    fn expired_token_is_detected() {
        let now = Utc::now();
        let token = BearerToken::new("secret".to_string(), now - chrono::Duration::seconds(1));
        assert!(token.is_expired(now));

        let fresh = BearerToken::new("secret".to_string(), now + chrono::Duration::hours(1));
        assert!(!fresh.is_expired(now));
        assert!(!BearerToken::non_expiring("secret".to_string()).is_expired(now));
    }

    /// Loopback stub whose every response offers a `next` link back to
    /// itself, so pagination can never terminate normally.
    async fn spawn_self_linking_catalog() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = format!(
            r#"{{"type":"FeatureCollection","features":[],"links":[{{"rel":"next","href":"http://{addr}/search"}}]}}"#
        );
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/search")
    }

    #[tokio::test]
    async fn endless_next_links_error_instead_of_truncating() {
        let endpoint = spawn_self_linking_catalog().await;
        let retry = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 2.0,
        };
        let client = CatalogClient::new(
            Url::parse(&endpoint).unwrap(),
            "SENTINEL-2".to_string(),
            BearerToken::non_expiring("secret".to_string()),
            retry,
        )
        .unwrap();

        let err = client.query(&london_aoi(), &filter()).await.unwrap_err();
        assert!(matches!(err, FetchError::Network(msg) if msg.contains("next link")));
    }

    #[test]
    fn token_debug_redacts_secret() {
        let token = BearerToken::non_expiring("hunter2".to_string());
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
