use std::sync::Arc;

use async_trait::async_trait;
use flipscan_core::site_name_from_url;
use flipscan_storage::PageSource;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::AdapterError;

/// Raw answer from a reference marketplace, before any trimming or rounding.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceResponse {
    /// A single precomputed average sale price.
    Aggregate(f64),
    /// Individual sale records; `None` where a record carried no usable price.
    SaleRecords(Vec<Option<f64>>),
}

#[async_trait]
pub trait ReferenceMarketplace: Send + Sync {
    fn site(&self) -> &str;

    async fn lookup(&self, keyword: &str) -> Result<ReferenceResponse, AdapterError>;
}

/// Accepts `{"slot1": <avg>, ...}`, a bare number, a bare array of
/// `{price}` records, or such an array under `items`, `sales` or `results`.
pub fn parse_reference_response(value: &JsonValue) -> Option<ReferenceResponse> {
    match value {
        JsonValue::Number(_) | JsonValue::String(_) => {
            numeric(value).map(ReferenceResponse::Aggregate)
        }
        JsonValue::Array(records) => Some(ReferenceResponse::SaleRecords(
            records.iter().map(record_price).collect(),
        )),
        JsonValue::Object(map) => {
            if let Some(aggregate) = map.get("slot1") {
                return numeric(aggregate).map(ReferenceResponse::Aggregate);
            }
            ["items", "sales", "results"]
                .iter()
                .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
                .map(|records| {
                    ReferenceResponse::SaleRecords(records.iter().map(record_price).collect())
                })
        }
        _ => None,
    }
}

fn record_price(record: &JsonValue) -> Option<f64> {
    record.get("price").and_then(numeric)
}

fn numeric(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned = s.trim().trim_start_matches('$').replace(',', "");
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Form payload for a completed-sales search.
pub fn search_completed_payload(keyword: &str) -> String {
    serde_json::json!({
        "instance": "SearchCompleted",
        "slot1": keyword,
        "slot2": true,
        "slot3": { "instance": "Returns" },
    })
    .to_string()
}

/// Completed-sales lookup against a flip-history API that takes a single
/// `json` form field.
pub struct FlipHistoryClient {
    source: Arc<dyn PageSource>,
    endpoint: String,
    site: String,
}

impl FlipHistoryClient {
    pub fn new(source: Arc<dyn PageSource>, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let site = site_name_from_url(&endpoint).unwrap_or_else(|| endpoint.clone());
        Self {
            source,
            endpoint,
            site,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReferenceMarketplace for FlipHistoryClient {
    fn site(&self) -> &str {
        &self.site
    }

    async fn lookup(&self, keyword: &str) -> Result<ReferenceResponse, AdapterError> {
        let payload = search_completed_payload(keyword);
        let body = self
            .source
            .post_form(&self.endpoint, &[("json", payload.as_str())])
            .await?;
        if body.trim().is_empty() {
            return Err(AdapterError::EmptyResponse(self.endpoint.clone()));
        }

        let value: JsonValue = serde_json::from_str(&body)?;
        if let Some(rate) = value.get("slot2").and_then(numeric) {
            info!(keyword, sell_through_rate = rate, "reference sell-through rate");
        }
        let parsed =
            parse_reference_response(&value).ok_or_else(|| AdapterError::UnexpectedShape {
                site: self.site.clone(),
                detail: truncate(&body, 120),
            })?;
        debug!(keyword, site = %self.site, ?parsed, "reference lookup");
        Ok(parsed)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
