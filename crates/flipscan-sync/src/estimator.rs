use std::sync::Arc;

use chrono::Utc;
use flipscan_adapters::{ReferenceMarketplace, ReferenceResponse};
use flipscan_core::{ReferencePrice, SearchTask};
use flipscan_storage::DedupStore;
use tracing::{info, warn};

use crate::EngineError;

pub fn round_half_away_from_zero(value: f64) -> i64 {
    // f64::round already rounds half away from zero.
    value.round() as i64
}

/// Mean of the priced records after dropping the cheapest `floor(n * fraction)`,
/// always keeping at least one. `None` when no record has a positive price.
pub fn trimmed_mean(records: &[Option<f64>], fraction: f64) -> Option<f64> {
    let mut prices = records
        .iter()
        .flatten()
        .copied()
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect::<Vec<_>>();
    if prices.is_empty() {
        return None;
    }
    prices.sort_by(f64::total_cmp);

    let n = prices.len();
    let fraction = fraction.clamp(0.0, 1.0);
    let discard = ((n as f64 * fraction).floor() as usize).min(n - 1);
    let kept = &prices[discard..];
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

pub struct ReferencePriceEstimator {
    marketplace: Arc<dyn ReferenceMarketplace>,
    store: DedupStore,
    trim_fraction: f64,
}

impl ReferencePriceEstimator {
    pub fn new(
        marketplace: Arc<dyn ReferenceMarketplace>,
        store: DedupStore,
        trim_fraction: f64,
    ) -> Self {
        Self {
            marketplace,
            store,
            trim_fraction,
        }
    }

    pub fn site(&self) -> &str {
        self.marketplace.site()
    }

    /// Reuses a price stored inside the task's freshness window, otherwise asks
    /// the reference marketplace and records the result.
    pub async fn estimate(&self, task: &SearchTask) -> Result<ReferencePrice, EngineError> {
        let site = self.marketplace.site();
        let keyword = task.keyword.as_str();
        let now = Utc::now();

        match self
            .store
            .recent_reference_price(site, keyword, now - task.freshness_window())
            .await
        {
            Ok(Some(cached)) => {
                info!(keyword, reference_price = cached.value(), "reusing stored reference price");
                return Ok(cached);
            }
            Ok(None) => {}
            Err(err) => warn!(keyword, error = %err, "reference price lookup in store failed"),
        }

        let unavailable = |reason: String| EngineError::DataUnavailable {
            keyword: keyword.to_string(),
            reason,
        };

        let response = self
            .marketplace
            .lookup(keyword)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let value = match response {
            ReferenceResponse::Aggregate(value) => round_half_away_from_zero(value),
            ReferenceResponse::SaleRecords(records) => {
                let mean = trimmed_mean(&records, self.trim_fraction)
                    .ok_or_else(|| unavailable(format!("none of {} records priced", records.len())))?;
                round_half_away_from_zero(mean)
            }
        };
        let price = ReferencePrice::new(value)
            .ok_or_else(|| unavailable(format!("computed reference price {value} is below 1")))?;

        info!(keyword, reference_price = price.value(), "reference price estimated");
        if let Err(err) = self
            .store
            .record_reference_price(site, keyword, price, now)
            .await
        {
            warn!(keyword, error = %err, "could not record reference price");
        }
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flipscan_adapters::AdapterError;
    use flipscan_core::PricingPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedReference {
        response: Option<ReferenceResponse>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReferenceMarketplace for FixedReference {
        fn site(&self) -> &str {
            "checkaflip.com"
        }

        async fn lookup(&self, _keyword: &str) -> Result<ReferenceResponse, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response
                .clone()
                .ok_or_else(|| AdapterError::EmptyResponse("checkaflip.com".into()))
        }
    }

    fn task() -> SearchTask {
        SearchTask::new(
            "lamp",
            PricingPolicy::FixedProfit {
                min_profit: 10,
                shipping_cost: 5,
            },
        )
    }

    async fn build_estimator(response: Option<ReferenceResponse>) -> (ReferencePriceEstimator, Arc<FixedReference>) {
        let reference = Arc::new(FixedReference {
            response,
            calls: AtomicUsize::new(0),
        });
        let store = DedupStore::in_memory().await.unwrap();
        (
            ReferencePriceEstimator::new(reference.clone(), store, 0.5),
            reference,
        )
    }

    #[test]
    fn trimmed_mean_discards_cheapest_half() {
        let records = [Some(100.0), Some(80.0), Some(60.0), Some(40.0)];
        assert_eq!(trimmed_mean(&records, 0.5), Some(90.0));
    }

    #[test]
    fn trimmed_mean_ignores_unpriced_and_keeps_one() {
        assert_eq!(trimmed_mean(&[Some(0.0), None, Some(-4.0)], 0.5), None);
        assert_eq!(trimmed_mean(&[Some(55.0), None], 0.9), Some(55.0));
        assert_eq!(trimmed_mean(&[Some(10.0), Some(30.0)], 1.0), Some(30.0));
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_half_away_from_zero(89.5), 90);
        assert_eq!(round_half_away_from_zero(89.49), 89);
        assert_eq!(round_half_away_from_zero(-0.5), -1);
    }

    #[tokio::test]
    async fn sale_records_yield_trimmed_reference_price() {
        let (estimator, _) = build_estimator(Some(ReferenceResponse::SaleRecords(vec![
            Some(100.0),
            Some(80.0),
            Some(60.0),
            Some(40.0),
        ])))
        .await;
        assert_eq!(estimator.estimate(&task()).await.unwrap().value(), 90);
    }

    #[tokio::test]
    async fn stored_price_is_reused_within_window() {
        let (estimator, reference) = build_estimator(Some(ReferenceResponse::Aggregate(86.6))).await;
        assert_eq!(estimator.estimate(&task()).await.unwrap().value(), 87);
        assert_eq!(estimator.estimate(&task()).await.unwrap().value(), 87);
        assert_eq!(reference.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_or_missing_data_is_unavailable() {
        let (estimator, _) = build_estimator(Some(ReferenceResponse::Aggregate(0.2))).await;
        assert!(matches!(
            estimator.estimate(&task()).await,
            Err(EngineError::DataUnavailable { .. })
        ));

        let (estimator, _) = build_estimator(None).await;
        assert!(matches!(
            estimator.estimate(&task()).await,
            Err(EngineError::DataUnavailable { .. })
        ));
    }
}
