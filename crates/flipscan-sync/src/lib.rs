//! Scan engine orchestration: reference pricing, regional scans, filtering,
//! reporting and the per-task runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flipscan_adapters::{
    AdapterError, FlipHistoryClient, Region, RegionalListingsClient, VisionClassifier,
    WorkersAiVisionClient,
};
use flipscan_core::SearchTask;
use flipscan_storage::{
    DedupStore, HttpClientConfig, HttpFetcher, PageSource, PictureArchive, StoreError,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod estimator;
mod filters;
mod notify;
mod report;
mod runner;
mod scanner;

pub use estimator::{round_half_away_from_zero, trimmed_mean, ReferencePriceEstimator};
pub use filters::{word_filter, FilterPipeline, FilterVerdict};
pub use notify::{LogNotifier, Notifier, NotifyLatch, WebhookNotifier};
pub use report::{parse_csv, ReportSink};
pub use runner::{RunSummary, RunnerOptions, TaskRunner};
pub use scanner::{CandidateScanner, RegionScan, RegionStop, ScanOptions, TaskScan};

pub const CRATE_NAME: &str = "flipscan-sync";

/// Pause used for regions and tasks when debug mode is on.
pub const DEBUG_PAUSE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Deserialize)]
pub struct SitesConfig {
    pub reference: ReferenceSiteConfig,
    pub scan: ScanSiteConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceSiteConfig {
    pub endpoint: String,
    /// Share of the cheapest sale records discarded before averaging.
    #[serde(default = "default_trim_fraction")]
    pub trim_fraction: f64,
}

fn default_trim_fraction() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanSiteConfig {
    pub site: String,
    #[serde(default)]
    pub default_category: Option<String>,
    #[serde(default = "default_contact_service_id")]
    pub contact_service_id: String,
    pub regions: Vec<Region>,
    #[serde(default = "default_true")]
    pub stop_on_duplicate: bool,
    #[serde(default)]
    pub max_items_per_region: Option<usize>,
}

fn default_contact_service_id() -> String {
    "reply".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksFile {
    pub tasks: Vec<SearchTask>,
}

pub async fn load_sites_config(path: &Path) -> Result<SitesConfig> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let sites: SitesConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if sites.scan.regions.is_empty() {
        warn!(path = %path.display(), "no scan regions configured");
    }
    Ok(sites)
}

pub async fn load_tasks(path: &Path) -> Result<Vec<SearchTask>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: TasksFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.tasks)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub tasks_file: PathBuf,
    pub sites_file: PathBuf,
    pub reports_dir: PathBuf,
    pub pictures_dir: Option<PathBuf>,
    pub debug: bool,
    pub output_all: bool,
    pub region_pause: Duration,
    pub task_pause: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub proxy_url: Option<String>,
    pub vision_account_id: Option<String>,
    pub vision_api_token: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub max_days_to_keep: i64,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let debug = env_flag("FLIPSCAN_DEBUG");
        let pause = |name: &str| {
            if debug {
                DEBUG_PAUSE
            } else {
                Duration::from_secs(env_parse(name, 30))
            }
        };
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://flipscan.sqlite".to_string()),
            tasks_file: std::env::var("FLIPSCAN_TASKS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./tasks.yaml")),
            sites_file: std::env::var("FLIPSCAN_SITES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sites.yaml")),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            pictures_dir: env_opt("PICTURES_DIR").map(PathBuf::from),
            debug,
            output_all: env_flag("FLIPSCAN_OUTPUT_ALL"),
            region_pause: pause("FLIPSCAN_REGION_PAUSE_SECS"),
            task_pause: pause("FLIPSCAN_TASK_PAUSE_SECS"),
            http_timeout_secs: env_parse("FLIPSCAN_HTTP_TIMEOUT_SECS", 30),
            user_agent: std::env::var("FLIPSCAN_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:71.0) Gecko/20100101 Firefox/71.0"
                    .to_string()
            }),
            proxy_url: env_opt("FLIPSCAN_PROXY_URL"),
            vision_account_id: env_opt("CLOUDFLARE_ACCOUNT_ID"),
            vision_api_token: env_opt("CLOUDFLARE_API_TOKEN"),
            notify_webhook_url: env_opt("NOTIFY_WEBHOOK_URL"),
            max_days_to_keep: env_parse("FLIPSCAN_MAX_DAYS_TO_KEEP", 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no reference data for {keyword:?}: {reason}")]
    DataUnavailable { keyword: String, reason: String },
    #[error("store still contended: {0}")]
    TransientStoreContention(#[source] StoreError),
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("parse failure: {0}")]
    ParseFailure(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Contention { .. } => EngineError::TransientStoreContention(err),
            other => EngineError::Store(other),
        }
    }
}

impl From<AdapterError> for EngineError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Json(_) | AdapterError::UnexpectedShape { .. } | AdapterError::Message(_) => {
                EngineError::ParseFailure(err.to_string())
            }
            other => EngineError::NetworkFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopMessage {
    pub sent_at: DateTime<Utc>,
}

impl StopMessage {
    pub fn now() -> Self {
        Self {
            sent_at: Utc::now(),
        }
    }
}

/// Cooperative cancellation, polled between tasks and between regions.
///
/// Messages sent before the current run started are stale and ignored.
#[derive(Debug)]
pub struct StopSignal {
    rx: Option<mpsc::UnboundedReceiver<StopMessage>>,
    run_started_at: DateTime<Utc>,
    stopped: bool,
}

impl StopSignal {
    pub fn channel() -> (mpsc::UnboundedSender<StopMessage>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx: Some(rx),
                run_started_at: DateTime::<Utc>::MIN_UTC,
                stopped: false,
            },
        )
    }

    pub fn never() -> Self {
        Self {
            rx: None,
            run_started_at: DateTime::<Utc>::MIN_UTC,
            stopped: false,
        }
    }

    pub fn begin_run(&mut self, started_at: DateTime<Utc>) {
        self.run_started_at = started_at;
        self.stopped = false;
    }

    pub fn should_stop(&mut self) -> bool {
        if self.stopped {
            return true;
        }
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        while let Ok(message) = rx.try_recv() {
            if message.sent_at >= self.run_started_at {
                info!(sent_at = %message.sent_at, "stop requested");
                self.stopped = true;
                break;
            }
            debug!(sent_at = %message.sent_at, "ignoring stop message from before this run");
        }
        self.stopped
    }
}

/// Wires production collaborators from configuration.
pub async fn build_runner(config: &EngineConfig, sites: &SitesConfig) -> Result<TaskRunner> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        proxy_url: config.proxy_url.clone(),
        ..Default::default()
    })?;
    let http = fetcher.client().clone();
    let pages: Arc<dyn PageSource> = Arc::new(fetcher);

    let store = DedupStore::open(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;

    let reference = Arc::new(FlipHistoryClient::new(
        pages.clone(),
        sites.reference.endpoint.clone(),
    ));
    let estimator =
        ReferencePriceEstimator::new(reference, store.clone(), sites.reference.trim_fraction);

    let listings = Arc::new(RegionalListingsClient::new(
        pages.clone(),
        sites.scan.site.clone(),
        sites.scan.default_category.clone(),
    ));
    let scanner = CandidateScanner::new(
        listings,
        store.clone(),
        sites.scan.regions.clone(),
        ScanOptions {
            region_pause: config.region_pause,
            stop_on_duplicate: sites.scan.stop_on_duplicate,
            max_items_per_region: sites.scan.max_items_per_region,
        },
    );

    let vision: Option<Arc<dyn VisionClassifier>> =
        match (&config.vision_account_id, &config.vision_api_token) {
            (Some(account), Some(token)) => Some(Arc::new(WorkersAiVisionClient::new(
                http.clone(),
                account,
                token.clone(),
            ))),
            _ => {
                info!("vision credentials not set; label filtering will fail closed");
                None
            }
        };
    let mut filters = FilterPipeline::new(pages, vision, sites.scan.contact_service_id.clone());
    if let Some(dir) = &config.pictures_dir {
        filters = filters.with_archive(PictureArchive::new(dir.clone()));
    }

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(http, url.clone())),
        None => Arc::new(LogNotifier),
    };

    Ok(TaskRunner::new(
        store,
        estimator,
        scanner,
        filters,
        ReportSink::new(config.reports_dir.clone()),
        notifier,
        RunnerOptions {
            task_pause: config.task_pause,
            output_all: config.output_all,
            max_days_to_keep: config.max_days_to_keep,
        },
    ))
}

pub async fn run_from_env(stop: &mut StopSignal) -> Result<RunSummary> {
    let config = EngineConfig::from_env();
    let sites = load_sites_config(&config.sites_file).await?;
    let tasks = load_tasks(&config.tasks_file).await?;
    info!(
        tasks = tasks.len(),
        regions = sites.scan.regions.len(),
        debug = config.debug,
        "starting scan run"
    );
    let runner = build_runner(&config, &sites).await?;
    let summary = runner.run(&tasks, stop).await;
    runner.store().close().await;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    #[test]
    fn sites_yaml_applies_defaults() {
        let yaml = r#"
reference:
  endpoint: http://www.checkaflip.com/api
scan:
  site: craigslist.org
  regions:
    - name: sf bay area
      url: https://sfbay.craigslist.org
"#;
        let sites: SitesConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sites.reference.trim_fraction, 0.5);
        assert_eq!(sites.scan.contact_service_id, "reply");
        assert!(sites.scan.stop_on_duplicate);
        assert_eq!(sites.scan.max_items_per_region, None);
        assert_eq!(sites.scan.regions[0].name, "sf bay area");
    }

    #[tokio::test]
    async fn tasks_file_loads_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        std::fs::write(
            &path,
            r#"
tasks:
  - keyword: brass lamp
    floor_price: 10
    pricing: { policy: percentage_margin, margin_percent: 40 }
"#,
        )
        .unwrap();
        let tasks = load_tasks(&path).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].keyword, "brass lamp");

        let missing = load_tasks(&dir.path().join("nope.yaml")).await.unwrap_err();
        assert!(missing.to_string().contains("reading"));
    }

    #[tokio::test]
    async fn bundled_configs_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let sites = load_sites_config(&root.join("sites.yaml")).await.unwrap();
        assert_eq!(sites.scan.site, "craigslist.org");
        assert_eq!(sites.scan.regions.len(), 3);

        let tasks = load_tasks(&root.join("tasks.yaml")).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].picture.required);
        assert_eq!(tasks[1].hours_between_runs, 24);
    }

    #[test]
    fn stale_stop_messages_are_ignored() {
        let (tx, mut stop) = StopSignal::channel();
        let started = Utc::now();
        tx.send(StopMessage {
            sent_at: started - ChronoDuration::minutes(5),
        })
        .unwrap();
        stop.begin_run(started);
        assert!(!stop.should_stop());

        tx.send(StopMessage {
            sent_at: started + ChronoDuration::seconds(1),
        })
        .unwrap();
        assert!(stop.should_stop());
        assert!(stop.should_stop());
    }

    #[test]
    fn never_signal_does_not_stop() {
        let mut stop = StopSignal::never();
        stop.begin_run(Utc::now());
        assert!(!stop.should_stop());
    }

    #[test]
    fn store_contention_maps_to_transient_variant() {
        let err: EngineError = StoreError::Contention {
            statement: "upsert listing",
            attempts: 9,
        }
        .into();
        assert!(matches!(err, EngineError::TransientStoreContention(_)));

        let err: EngineError = AdapterError::UnexpectedShape {
            site: "checkaflip.com".into(),
            detail: "{}".into(),
        }
        .into();
        assert!(matches!(err, EngineError::ParseFailure(_)));
    }
}
