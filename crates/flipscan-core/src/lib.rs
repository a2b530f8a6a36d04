//! Core domain model for flipscan: search tasks, price bands, listings.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "flipscan-core";

/// How the scan price ceiling is derived from the reference price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PricingPolicy {
    /// Ceiling = reference - min_profit - shipping_cost.
    FixedProfit {
        min_profit: i64,
        #[serde(default)]
        shipping_cost: i64,
    },
    /// Ceiling = reference * (1 - margin_percent / 100), truncated.
    PercentageMargin { margin_percent: f64 },
}

impl PricingPolicy {
    pub fn upper_bound(&self, reference: ReferencePrice) -> i64 {
        let reference = i64::from(reference.value());
        match *self {
            PricingPolicy::FixedProfit {
                min_profit,
                shipping_cost,
            } => reference - min_profit - shipping_cost,
            PricingPolicy::PercentageMargin { margin_percent } => {
                (reference as f64 * (1.0 - margin_percent / 100.0)).floor() as i64
            }
        }
    }

    /// Profit in currency units (fixed policy) or discount percentage (margin policy).
    pub fn profit_or_margin(&self, reference: ReferencePrice, candidate_price: i64) -> f64 {
        let reference = f64::from(reference.value());
        match *self {
            PricingPolicy::FixedProfit { shipping_cost, .. } => {
                reference - candidate_price as f64 - shipping_cost as f64
            }
            PricingPolicy::PercentageMargin { .. } => {
                (1.0 - candidate_price as f64 / reference) * 100.0
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PictureRequirements {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub target_labels: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    80.0
}

impl Default for PictureRequirements {
    fn default() -> Self {
        Self {
            required: false,
            target_labels: Vec::new(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// One row of the task input file. Immutable for the duration of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTask {
    pub keyword: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub floor_price: i64,
    #[serde(default)]
    pub max_price: Option<i64>,
    pub pricing: PricingPolicy,
    #[serde(default = "default_hours_between_runs")]
    pub hours_between_runs: u32,
    #[serde(default)]
    pub must_contain: Vec<String>,
    #[serde(default)]
    pub must_not_contain: Vec<String>,
    #[serde(default)]
    pub picture: PictureRequirements,
}

fn default_hours_between_runs() -> u32 {
    24
}

impl SearchTask {
    pub fn new(keyword: impl Into<String>, pricing: PricingPolicy) -> Self {
        Self {
            keyword: keyword.into(),
            category: None,
            floor_price: 0,
            max_price: None,
            pricing,
            hours_between_runs: default_hours_between_runs(),
            must_contain: Vec::new(),
            must_not_contain: Vec::new(),
            picture: PictureRequirements::default(),
        }
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hours_between_runs))
    }

    /// True when at least one non-blank phrase is configured.
    pub fn has_word_filters(&self) -> bool {
        self.must_contain
            .iter()
            .chain(&self.must_not_contain)
            .any(|p| !p.trim().is_empty())
    }
}

/// Estimated resale value. Always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferencePrice(u32);

impl ReferencePrice {
    pub fn new(value: i64) -> Option<Self> {
        if value < 1 {
            return None;
        }
        u32::try_from(value).ok().map(Self)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ReferencePrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive query band sent to the scan marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBand {
    pub min_price: i64,
    pub max_price: i64,
}

impl PriceBand {
    /// Returns `None` when no price >= 1 would leave the required profit.
    pub fn for_task(task: &SearchTask, reference: ReferencePrice) -> Option<Self> {
        let mut upper = task.pricing.upper_bound(reference);
        if let Some(cap) = task.max_price {
            upper = upper.min(cap);
        }
        if upper < 1 {
            return None;
        }
        let lower = if task.floor_price > upper {
            1
        } else {
            task.floor_price.max(1)
        };
        Some(Self {
            min_price: lower,
            max_price: upper,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingMetadata {
    pub email: Option<String>,
    pub picture_url: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub confidence: Option<f64>,
}

/// A scanned listing. `(site, external_id)` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateListing {
    pub site: String,
    pub external_id: String,
    pub keyword: String,
    pub region: String,
    pub title: String,
    pub price: i64,
    pub url: String,
    pub discovered_at: DateTime<Utc>,
    pub matches: bool,
    #[serde(default)]
    pub metadata: ListingMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    pub site: String,
    pub keyword: String,
    pub completed_at: DateTime<Utc>,
}

/// Flattened report line for one reported candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub date: NaiveDate,
    pub keyword: String,
    pub category: String,
    pub matches: bool,
    pub reference_price: u32,
    pub candidate_price: i64,
    pub profit_or_margin: f64,
    pub picture_confidence: Option<f64>,
    pub url: String,
    pub email: Option<String>,
    pub picture_url: Option<String>,
}

impl ReportRow {
    pub const COLUMNS: [&'static str; 11] = [
        "date",
        "keyword",
        "category",
        "matches",
        "reference_price",
        "candidate_price",
        "profit_or_margin",
        "picture_confidence",
        "url",
        "email",
        "picture_url",
    ];

    pub fn from_listing(
        task: &SearchTask,
        reference: ReferencePrice,
        listing: &CandidateListing,
    ) -> Self {
        Self {
            date: listing.discovered_at.date_naive(),
            keyword: task.keyword.clone(),
            category: task.category.clone().unwrap_or_default(),
            matches: listing.matches,
            reference_price: reference.value(),
            candidate_price: listing.price,
            profit_or_margin: task.pricing.profit_or_margin(reference, listing.price),
            picture_confidence: listing.metadata.confidence,
            url: listing.url.clone(),
            email: listing.metadata.email.clone(),
            picture_url: listing.metadata.picture_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    MissingRequiredPhrase,
    ForbiddenPhrase(String),
    NoPicture,
    LabelMismatch { labels: Vec<String> },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingRequiredPhrase => write!(f, "no required phrase present"),
            RejectReason::ForbiddenPhrase(phrase) => write!(f, "contains forbidden phrase {phrase:?}"),
            RejectReason::NoPicture => write!(f, "picture required but none found"),
            RejectReason::LabelMismatch { labels } => {
                write!(f, "no target label matched (saw: {})", labels.join(", "))
            }
        }
    }
}

/// Outcome of one filter stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Accepted,
    Rejected(RejectReason),
    Failed(String),
}

impl StageOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StageOutcome::Accepted)
    }
}

/// Canonical listing id: last non-empty path segment up to its first `.`.
///
/// `https://sfbay.craigslist.org/sby/fuo/d/san-jose-lamp/7712345678.html` -> `7712345678`
pub fn external_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.rfind(|s| !s.is_empty())?;
    let id = last.split('.').next().unwrap_or_default().trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Registrable-looking domain: last two labels of the host.
pub fn site_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let labels = host.split('.').filter(|l| !l.is_empty()).collect::<Vec<_>>();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}
