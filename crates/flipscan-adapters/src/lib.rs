//! Marketplace adapters: the reference price source, regional results pages,
//! listing detail pages and the picture classifier.

use flipscan_storage::FetchError;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

mod detail;
mod listings;
mod reference;
mod vision;

pub use detail::{
    contact_token, email_from_contact_page, first_email, first_picture_url, picture_extension,
    reveal_contact_url, visible_text, SERVICE_ID_PLACEHOLDER,
};
pub use listings::{
    parse_price, parse_results_page, results_url, ListingSummary, PageEntry, Region,
    RegionalListingsClient, ScanMarketplace, DEFAULT_CATEGORY,
};
pub use reference::{
    parse_reference_response, search_completed_payload, FlipHistoryClient, ReferenceMarketplace,
    ReferenceResponse,
};
pub use vision::{labels_from_response, VisionClassifier, VisionLabel, WorkersAiVisionClient};

pub const CRATE_NAME: &str = "flipscan-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("empty response from {0}")]
    EmptyResponse(String),
    #[error("unexpected response shape from {site}: {detail}")]
    UnexpectedShape { site: String, detail: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

pub(crate) fn select_first_text(
    scope: ElementRef<'_>,
    selector: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(scope.select(&sel).next().and_then(element_text))
}

pub(crate) fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|s| text_or_none(s.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_helpers_collapse_whitespace() {
        assert_eq!(text_or_none("  a\n\t b ".into()), Some("a b".into()));
        assert_eq!(text_or_none(" \n ".into()), None);
    }

    #[test]
    fn first_attr_skips_blank_values() {
        let doc = Html::parse_document(r#"<a class="x" href=" "></a><a class="x" href="/two"></a>"#);
        assert_eq!(
            select_first_attr(&doc, "a.x", "href").unwrap(),
            Some("/two".into())
        );
    }

    #[test]
    fn invalid_selector_is_an_error() {
        assert!(matches!(parse_selector("a[[["), Err(AdapterError::Message(_))));
    }
}
