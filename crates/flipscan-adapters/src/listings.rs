use std::sync::Arc;

use async_trait::async_trait;
use flipscan_core::PriceBand;
use flipscan_storage::PageSource;
use reqwest::Url;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{element_text, parse_selector, select_first_text, AdapterError};

/// "All for sale" category.
pub const DEFAULT_CATEGORY: &str = "sss";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingSummary {
    pub title: String,
    /// Whole currency units; 0 when the page showed no usable price.
    pub price: i64,
    pub url: String,
}

/// One item of a results page, in page order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEntry {
    Listing(ListingSummary),
    /// "Few local results" separator; everything after it is from nearby areas.
    NearbyBoundary,
    Unparseable(String),
}

#[async_trait]
pub trait ScanMarketplace: Send + Sync {
    fn site(&self) -> &str;

    async fn fetch_results(
        &self,
        region: &Region,
        category: Option<&str>,
        keyword: &str,
        band: PriceBand,
    ) -> Result<Vec<PageEntry>, AdapterError>;
}

/// Newest-first search URL for one region.
pub fn results_url(
    region_url: &str,
    category: &str,
    keyword: &str,
    band: PriceBand,
) -> Result<String, AdapterError> {
    let base = format!("{}/search/{}", region_url.trim_end_matches('/'), category);
    let min_price = band.min_price.to_string();
    let max_price = band.max_price.to_string();
    let url = Url::parse_with_params(
        &base,
        &[
            ("query", keyword),
            ("sort", "date"),
            ("min_price", min_price.as_str()),
            ("max_price", max_price.as_str()),
        ],
    )
    .map_err(|e| AdapterError::Message(format!("bad region url {region_url}: {e}")))?;
    Ok(url.to_string())
}

/// Dollars before the decimal point, ignoring currency symbols and separators.
pub fn parse_price(text: &str) -> Option<i64> {
    let after_symbol = text.split_once('$').map(|(_, rest)| rest).unwrap_or(text);
    let whole = after_symbol.split('.').next().unwrap_or_default();
    let digits = whole
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(char::is_ascii_digit)
        .collect::<String>();
    digits.parse().ok()
}

/// Parses a regional results page. Relative links resolve against `page_url`.
pub fn parse_results_page(html: &str, page_url: &str) -> Result<Vec<PageEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let resolve = |href: &str| match &base {
        Some(base) => base
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string()),
        None => href.to_string(),
    };

    let rows = parse_selector("ul.rows > *")?;
    let row_link = parse_selector("a.result-title")?;
    let mut entries = Vec::new();
    let mut saw_rows = false;

    for element in document.select(&rows) {
        saw_rows = true;
        let class = element.value().attr("class").unwrap_or_default();
        if class.contains("ban nearby") {
            entries.push(PageEntry::NearbyBoundary);
            break;
        }
        if element.value().name() != "li" {
            continue;
        }

        let link = element.select(&row_link).next();
        let title = link.and_then(element_text).unwrap_or_default();
        let Some(href) = link.and_then(|a| a.value().attr("href")) else {
            entries.push(PageEntry::Unparseable(title));
            continue;
        };
        let price = select_first_text(element, "span.result-price")?
            .and_then(|p| parse_price(&p))
            .unwrap_or(0);
        entries.push(PageEntry::Listing(ListingSummary {
            title,
            price,
            url: resolve(href),
        }));
    }

    if saw_rows {
        return Ok(entries);
    }

    // Static markup served to clients without scripting.
    let items = parse_selector("li.cl-static-search-result, li.cl-search-nearby-ban")?;
    let item_link = parse_selector("a[href]")?;
    for element in document.select(&items) {
        let class = element.value().attr("class").unwrap_or_default();
        if class.contains("nearby") {
            entries.push(PageEntry::NearbyBoundary);
            break;
        }
        let title = select_first_text(element, ".title")?
            .or_else(|| element.value().attr("title").map(str::to_string))
            .unwrap_or_default();
        let Some(href) = element
            .select(&item_link)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            entries.push(PageEntry::Unparseable(title));
            continue;
        };
        let price = select_first_text(element, ".price")?
            .and_then(|p| parse_price(&p))
            .unwrap_or(0);
        entries.push(PageEntry::Listing(ListingSummary {
            title,
            price,
            url: resolve(href),
        }));
    }

    Ok(entries)
}

/// Regional classifieds search: one results page per region.
pub struct RegionalListingsClient {
    source: Arc<dyn PageSource>,
    site: String,
    default_category: String,
}

impl RegionalListingsClient {
    pub fn new(
        source: Arc<dyn PageSource>,
        site: impl Into<String>,
        default_category: Option<String>,
    ) -> Self {
        Self {
            source,
            site: site.into(),
            default_category: default_category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        }
    }
}

#[async_trait]
impl ScanMarketplace for RegionalListingsClient {
    fn site(&self) -> &str {
        &self.site
    }

    async fn fetch_results(
        &self,
        region: &Region,
        category: Option<&str>,
        keyword: &str,
        band: PriceBand,
    ) -> Result<Vec<PageEntry>, AdapterError> {
        let category = category.unwrap_or(&self.default_category);
        let url = results_url(&region.url, category, keyword, band)?;
        let page = self.source.get_text(&url).await?;
        let entries = parse_results_page(&page, &url)?;
        debug!(region = %region.name, %url, entries = entries.len(), "results page parsed");
        Ok(entries)
    }
}
