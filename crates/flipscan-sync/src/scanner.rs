use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flipscan_adapters::{PageEntry, Region, ScanMarketplace};
use flipscan_core::{external_id_from_url, CandidateListing, ListingMetadata, PriceBand, SearchTask};
use flipscan_storage::DedupStore;
use tracing::{debug, info, warn};

use crate::{EngineError, StopSignal};

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub region_pause: Duration,
    /// Stop a region at the first listing already in the store.
    pub stop_on_duplicate: bool,
    /// Upper bound on listings evaluated per region page.
    pub max_items_per_region: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            region_pause: Duration::from_secs(30),
            stop_on_duplicate: true,
            max_items_per_region: None,
        }
    }
}

/// Why scanning of one region ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionStop {
    EndOfPage,
    NearbyBoundary,
    Duplicate(String),
    DepthCap,
    FetchFailed,
}

#[derive(Debug)]
pub struct RegionScan {
    pub region: String,
    pub candidates: Vec<CandidateListing>,
    pub stop: RegionStop,
    /// Set when the results page could not be fetched or read.
    pub failure: Option<EngineError>,
}

#[derive(Debug, Default)]
pub struct TaskScan {
    pub candidates: Vec<CandidateListing>,
    pub regions_scanned: usize,
    pub failures: Vec<EngineError>,
    pub interrupted: bool,
}

pub struct CandidateScanner {
    marketplace: Arc<dyn ScanMarketplace>,
    store: DedupStore,
    regions: Vec<Region>,
    options: ScanOptions,
}

impl CandidateScanner {
    pub fn new(
        marketplace: Arc<dyn ScanMarketplace>,
        store: DedupStore,
        regions: Vec<Region>,
        options: ScanOptions,
    ) -> Self {
        Self {
            marketplace,
            store,
            regions,
            options,
        }
    }

    pub fn site(&self) -> &str {
        self.marketplace.site()
    }

    /// Scans every region in order, pausing between requests and polling `stop`
    /// before each region after the first.
    pub async fn scan_task(
        &self,
        task: &SearchTask,
        band: PriceBand,
        stop: &mut StopSignal,
    ) -> TaskScan {
        let mut scan = TaskScan::default();
        let mut seen = HashSet::new();

        for (index, region) in self.regions.iter().enumerate() {
            if index > 0 {
                if stop.should_stop() {
                    scan.interrupted = true;
                    break;
                }
                tokio::time::sleep(self.options.region_pause).await;
            }

            info!(
                keyword = %task.keyword,
                region = %region.name,
                region_index = index + 1,
                regions = self.regions.len(),
                min_price = band.min_price,
                max_price = band.max_price,
                "scanning region"
            );
            let region_scan = self.scan_region(task, band, region, &mut seen).await;
            debug!(region = %region.name, stop = ?region_scan.stop, found = region_scan.candidates.len(), "region done");
            scan.regions_scanned += 1;
            scan.candidates.extend(region_scan.candidates);
            scan.failures.extend(region_scan.failure);
        }

        scan
    }

    /// Evaluates one results page. `seen` holds ids already taken earlier in this task.
    pub async fn scan_region(
        &self,
        task: &SearchTask,
        band: PriceBand,
        region: &Region,
        seen: &mut HashSet<String>,
    ) -> RegionScan {
        let site = self.marketplace.site();
        let mut result = RegionScan {
            region: region.name.clone(),
            candidates: Vec::new(),
            stop: RegionStop::EndOfPage,
            failure: None,
        };

        let entries = match self
            .marketplace
            .fetch_results(region, task.category.as_deref(), &task.keyword, band)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                let err = EngineError::from(err);
                warn!(region = %region.name, error = %err, "results page unavailable");
                result.stop = RegionStop::FetchFailed;
                result.failure = Some(err);
                return result;
            }
        };

        let mut evaluated = 0usize;
        for entry in entries {
            let summary = match entry {
                PageEntry::NearbyBoundary => {
                    info!(region = %region.name, "reached results from nearby areas");
                    result.stop = RegionStop::NearbyBoundary;
                    break;
                }
                PageEntry::Unparseable(title) => {
                    debug!(%title, "skipping item without a link");
                    continue;
                }
                PageEntry::Listing(summary) => summary,
            };

            if let Some(cap) = self.options.max_items_per_region {
                if evaluated >= cap {
                    result.stop = RegionStop::DepthCap;
                    break;
                }
            }
            evaluated += 1;

            let Some(external_id) = external_id_from_url(&summary.url) else {
                debug!(url = %summary.url, "skipping item without an id");
                continue;
            };

            if seen.contains(&external_id) {
                continue;
            }
            let already_stored = match self.store.listing_exists(site, &external_id).await {
                Ok(exists) => exists,
                Err(err) => {
                    warn!(%external_id, error = %err, "dedup lookup failed; treating as new");
                    false
                }
            };
            if already_stored {
                if self.options.stop_on_duplicate {
                    info!(region = %region.name, %external_id, "reached previously seen listing");
                    result.stop = RegionStop::Duplicate(external_id);
                    break;
                }
                continue;
            }

            if summary.price <= 0 {
                debug!(%external_id, title = %summary.title, "skipping item without a positive price");
                continue;
            }

            info!(
                results = result.candidates.len() + 1,
                title = %summary.title,
                price = summary.price,
                "candidate found"
            );
            seen.insert(external_id.clone());
            result.candidates.push(CandidateListing {
                site: site.to_string(),
                external_id,
                keyword: task.keyword.clone(),
                region: region.name.clone(),
                title: summary.title,
                price: summary.price,
                url: summary.url,
                discovered_at: Utc::now(),
                matches: false,
                metadata: ListingMetadata::default(),
            });
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flipscan_adapters::{AdapterError, ListingSummary};
    use flipscan_core::PricingPolicy;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct PagedMarketplace {
        pages: HashMap<String, Vec<PageEntry>>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScanMarketplace for PagedMarketplace {
        fn site(&self) -> &str {
            "craigslist.org"
        }

        async fn fetch_results(
            &self,
            region: &Region,
            _category: Option<&str>,
            _keyword: &str,
            _band: PriceBand,
        ) -> Result<Vec<PageEntry>, AdapterError> {
            self.requests.lock().unwrap().push(region.name.clone());
            if region.name == "garbled" {
                return Err(AdapterError::UnexpectedShape {
                    site: "craigslist.org".into(),
                    detail: "no result rows".into(),
                });
            }
            self.pages
                .get(&region.name)
                .cloned()
                .ok_or_else(|| AdapterError::EmptyResponse(region.url.clone()))
        }
    }

    fn listing(id: u32, price: i64) -> PageEntry {
        PageEntry::Listing(ListingSummary {
            title: format!("Lamp {id}"),
            price,
            url: format!("https://sfbay.craigslist.org/fuo/d/lamp/{id}.html"),
        })
    }

    fn region(name: &str) -> Region {
        Region {
            name: name.into(),
            url: format!("https://{name}.craigslist.org"),
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

    const BAND: PriceBand = PriceBand {
        min_price: 1,
        max_price: 75,
    };

    async fn build_scanner(
        pages: Vec<(&str, Vec<PageEntry>)>,
        options: ScanOptions,
    ) -> (CandidateScanner, Arc<PagedMarketplace>, DedupStore) {
        let regions = pages.iter().map(|(name, _)| region(name)).collect();
        let marketplace = Arc::new(PagedMarketplace {
            pages: pages
                .into_iter()
                .map(|(name, entries)| (name.to_string(), entries))
                .collect(),
            requests: Mutex::new(Vec::new()),
        });
        let store = DedupStore::in_memory().await.unwrap();
        (
            CandidateScanner::new(marketplace.clone(), store.clone(), regions, options),
            marketplace,
            store,
        )
    }

    fn quick() -> ScanOptions {
        ScanOptions {
            region_pause: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn zero_price_items_are_skipped_and_region_continues() {
        let (scanner, _, _) = build_scanner(
            vec![("sfbay", vec![listing(1, 40), listing(2, 0), listing(3, 25)])],
            quick(),
        )
        .await;
        let scan = scanner
            .scan_task(&task(), BAND, &mut StopSignal::never())
            .await;
        let ids = scan
            .candidates
            .iter()
            .map(|c| c.external_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(scan.candidates[1].region, "sfbay");
    }

    #[tokio::test]
    async fn region_stops_at_first_stored_listing() {
        let (scanner, _, store) = build_scanner(
            vec![
                ("sfbay", vec![listing(1, 40), listing(2, 30), listing(3, 25)]),
                ("monterey", vec![listing(9, 20)]),
            ],
            quick(),
        )
        .await;
        let stored = CandidateListing {
            site: "craigslist.org".into(),
            external_id: "2".into(),
            keyword: "lamp".into(),
            region: "sfbay".into(),
            title: "Lamp 2".into(),
            price: 30,
            url: "https://sfbay.craigslist.org/fuo/d/lamp/2.html".into(),
            discovered_at: Utc::now(),
            matches: true,
            metadata: ListingMetadata::default(),
        };
        store.upsert_listing(&stored).await.unwrap();

        let mut seen = HashSet::new();
        let region_scan = scanner
            .scan_region(&task(), BAND, &region("sfbay"), &mut seen)
            .await;
        assert_eq!(region_scan.candidates.len(), 1);
        assert_eq!(region_scan.stop, RegionStop::Duplicate("2".into()));

        let scan = scanner
            .scan_task(&task(), BAND, &mut StopSignal::never())
            .await;
        let ids = scan
            .candidates
            .iter()
            .map(|c| c.external_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "9"]);
    }

    #[tokio::test]
    async fn duplicates_are_skipped_up_to_depth_cap_when_not_stopping() {
        let (scanner, _, store) = build_scanner(
            vec![(
                "sfbay",
                vec![listing(1, 40), listing(2, 30), listing(3, 25), listing(4, 20)],
            )],
            ScanOptions {
                region_pause: Duration::ZERO,
                stop_on_duplicate: false,
                max_items_per_region: Some(3),
            },
        )
        .await;
        store
            .upsert_listing(&CandidateListing {
                site: "craigslist.org".into(),
                external_id: "1".into(),
                keyword: "lamp".into(),
                region: "sfbay".into(),
                title: "Lamp 1".into(),
                price: 40,
                url: String::new(),
                discovered_at: Utc::now(),
                matches: false,
                metadata: ListingMetadata::default(),
            })
            .await
            .unwrap();

        let mut seen = HashSet::new();
        let region_scan = scanner
            .scan_region(&task(), BAND, &region("sfbay"), &mut seen)
            .await;
        let ids = region_scan
            .candidates
            .iter()
            .map(|c| c.external_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["2", "3"]);
        assert_eq!(region_scan.stop, RegionStop::DepthCap);
    }

    #[tokio::test]
    async fn nearby_marker_and_fetch_failure_end_region_only() {
        let (scanner, marketplace, _) = build_scanner(
            vec![
                ("sfbay", vec![listing(1, 40), PageEntry::NearbyBoundary, listing(2, 30)]),
                ("monterey", vec![listing(3, 20)]),
            ],
            quick(),
        )
        .await;

        let mut seen = HashSet::new();
        let missing = scanner
            .scan_region(&task(), BAND, &region("nowhere"), &mut seen)
            .await;
        assert_eq!(missing.stop, RegionStop::FetchFailed);
        assert!(matches!(missing.failure, Some(EngineError::NetworkFailure(_))));

        let scan = scanner
            .scan_task(&task(), BAND, &mut StopSignal::never())
            .await;
        assert_eq!(scan.candidates.len(), 2);
        assert_eq!(scan.regions_scanned, 2);
        assert!(scan.failures.is_empty());
        assert_eq!(
            *marketplace.requests.lock().unwrap(),
            vec!["nowhere", "sfbay", "monterey"]
        );
    }

    #[tokio::test]
    async fn region_failures_are_collected_and_scan_continues() {
        let (scanner, _, _) = build_scanner(
            vec![
                ("garbled", Vec::new()),
                ("sfbay", vec![listing(1, 40)]),
            ],
            quick(),
        )
        .await;
        let scanner = CandidateScanner {
            regions: vec![region("garbled"), region("nowhere"), region("sfbay")],
            ..scanner
        };

        let scan = scanner
            .scan_task(&task(), BAND, &mut StopSignal::never())
            .await;
        assert_eq!(scan.regions_scanned, 3);
        assert_eq!(scan.candidates.len(), 1);
        assert_eq!(scan.failures.len(), 2);
        assert!(matches!(scan.failures[0], EngineError::ParseFailure(_)));
        assert!(matches!(scan.failures[1], EngineError::NetworkFailure(_)));
    }

    #[tokio::test]
    async fn stop_signal_is_polled_between_regions() {
        let (scanner, marketplace, _) = build_scanner(
            vec![
                ("sfbay", vec![listing(1, 40)]),
                ("monterey", vec![listing(3, 20)]),
            ],
            quick(),
        )
        .await;
        let (tx, mut stop) = crate::StopSignal::channel();
        stop.begin_run(Utc::now() - chrono::Duration::seconds(1));
        tx.send(crate::StopMessage::now()).unwrap();

        let scan = scanner.scan_task(&task(), BAND, &mut stop).await;
        assert!(scan.interrupted);
        assert_eq!(scan.candidates.len(), 1);
        assert_eq!(marketplace.requests.lock().unwrap().len(), 1);
    }
}
