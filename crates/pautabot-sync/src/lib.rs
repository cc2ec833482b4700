//! Reconciliation engine: one cycle loads the ledger, fetches both feeds, diffs seller
//! totals, investigates new orders and publishes the eligible ones.

pub mod classify;
pub mod publish;
pub mod reconcile;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use pautabot_adapters::{
    FixtureSource, NotifierFactory, OpenDataSource, ProcurementSource, PublishError, SourceEndpoints,
    SourceError, TwitterNotifierFactory, DEFAULT_CATALOG_URL, DEFAULT_DETAIL_URL_TEMPLATE,
    DEFAULT_TOTALS_URL, DEFAULT_TWITTER_API_BASE,
};
use pautabot_core::{NaturalKey, Outcome, ProcessedPurchase, Purchase, ReconciliationState};
use pautabot_storage::{HttpClientConfig, HttpFetcher, PayloadArchive, RunLock, StateStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::{investigate, Classification};
use crate::publish::publish_queue;
use crate::reconcile::{diff_totals, unprocessed_for_seller, LedgerIndex};

pub const CRATE_NAME: &str = "pautabot-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_file: PathBuf,
    pub year: i32,
    pub catalog_url: String,
    pub totals_url: String,
    pub detail_url_template: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub archive_dir: Option<PathBuf>,
    pub fixture_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub twitter_api_base: String,
    pub twitter_access_token: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            state_file: lookup("PAUTABOT_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pautabot.state.json")),
            year: lookup("PAUTABOT_YEAR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| Utc::now().year()),
            catalog_url: lookup("PAUTABOT_CATALOG_URL")
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            totals_url: lookup("PAUTABOT_TOTALS_URL").unwrap_or_else(|| DEFAULT_TOTALS_URL.to_string()),
            detail_url_template: lookup("PAUTABOT_DETAIL_URL_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_DETAIL_URL_TEMPLATE.to_string()),
            user_agent: lookup("PAUTABOT_USER_AGENT").unwrap_or_else(|| "pautabot/0.1".to_string()),
            http_timeout_secs: lookup("PAUTABOT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            archive_dir: lookup("PAUTABOT_ARCHIVE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            fixture_dir: lookup("PAUTABOT_FIXTURE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            scheduler_enabled: lookup("PAUTABOT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("PAUTABOT_SYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
            twitter_api_base: lookup("TWITTER_API_BASE")
                .unwrap_or_else(|| DEFAULT_TWITTER_API_BASE.to_string()),
            twitter_access_token: lookup("TWITTER_ACCESS_TOKEN"),
        }
    }

    pub fn endpoints(&self) -> SourceEndpoints {
        SourceEndpoints {
            year: self.year,
            catalog_url: self.catalog_url.clone(),
            totals_url: self.totals_url.clone(),
            detail_url_template: self.detail_url_template.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("state unavailable: {0}")]
    StateUnavailable(#[source] StoreError),
    #[error("fetching {feed} failed: {source}")]
    FetchFailure {
        feed: &'static str,
        #[source]
        source: SourceError,
    },
    #[error("notification channel unavailable: {0}")]
    NotifierUnavailable(#[source] PublishError),
    #[error("persisting state failed: {0}")]
    PersistFailure(#[source] StoreError),
    #[error("order {0} is not in the current catalog")]
    OrderNotFound(NaturalKey),
    #[error("order {key} already has a {status} ledger entry")]
    AlreadyRecorded { key: NaturalKey, status: &'static str },
}

/// Per-cycle report threaded through the orchestrator and returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_run: DateTime<Utc>,
    pub sellers_investigated: Vec<String>,
    pub candidates: usize,
    pub published: usize,
    pub dropped: usize,
    pub errors: usize,
    pub ledger_size: usize,
}

impl CycleSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, previous_run: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            previous_run,
            sellers_investigated: Vec::new(),
            candidates: 0,
            published: 0,
            dropped: 0,
            errors: 0,
            ledger_size: 0,
        }
    }

    fn count(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Processed { .. } => self.published += 1,
            Outcome::Dropped => self.dropped += 1,
            Outcome::Error { .. } => self.errors += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.sellers_investigated.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SellerDelta {
    pub seller: String,
    pub previous: Option<f64>,
    pub current: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub last_run: DateTime<Utc>,
    pub sellers: Vec<SellerDelta>,
}

impl ProbeReport {
    pub fn has_changes(&self) -> bool {
        !self.sellers.is_empty()
    }
}

pub struct ReconciliationPipeline {
    store: StateStore,
    source: Box<dyn ProcurementSource>,
    notifiers: Box<dyn NotifierFactory>,
    archive: Option<PayloadArchive>,
}

impl ReconciliationPipeline {
    pub fn new(
        store: StateStore,
        source: Box<dyn ProcurementSource>,
        notifiers: Box<dyn NotifierFactory>,
    ) -> Self {
        Self {
            store,
            source,
            notifiers,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one full cycle. Only lock/load failures, feed failures, an unreachable
    /// notification channel and a failed persist abort it; per-order failures end up in
    /// the ledger.
    ///
    /// The notification channel is connected once the diff selects at least one seller and
    /// before any detail page is fetched. If connecting fails the cycle ends with
    /// [`CycleError::NotifierUnavailable`] and nothing is persisted: `last_run`, totals,
    /// catalog and ledger stay as loaded, so the next cycle sees the same increases again.
    pub async fn run_once(&self) -> Result<CycleSummary, CycleError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id);
        self.cycle(run_id).instrument(span).await
    }

    async fn cycle(&self, run_id: Uuid) -> Result<CycleSummary, CycleError> {
        let started_at = Utc::now();
        let _lock = RunLock::acquire(self.store.path()).map_err(CycleError::StateUnavailable)?;

        let mut state = self.store.load().await.map_err(CycleError::StateUnavailable)?;
        info!(
            last_run = %state.last_run,
            sellers = state.totals.len(),
            catalog = state.catalog.len(),
            ledger = state.ledger().len(),
            "state loaded"
        );
        let mut summary = CycleSummary::new(run_id, started_at, state.last_run);

        let catalog = self
            .source
            .fetch_catalog()
            .await
            .map_err(|source| CycleError::FetchFailure {
                feed: "catalog",
                source,
            })?;
        let totals = self
            .source
            .fetch_totals()
            .await
            .map_err(|source| CycleError::FetchFailure {
                feed: "totals",
                source,
            })?;
        self.archive_raw(started_at, "catalog", &catalog.raw).await;
        self.archive_raw(started_at, "totals", &totals.raw).await;

        let worklist = diff_totals(&state.totals, &totals.value);
        let catalog = catalog.value;

        if worklist.is_empty() {
            info!(since = %state.last_run, "no seller totals increased");
        } else {
            info!(sellers = worklist.len(), "seller totals increased");
            let notifier = self
                .notifiers
                .connect()
                .await
                .map_err(CycleError::NotifierUnavailable)?;

            let mut index = LedgerIndex::from_ledger(state.ledger());
            let mut queue: Vec<Purchase> = Vec::new();

            for seller in &worklist {
                let candidates = unprocessed_for_seller(&catalog, &index, seller);
                info!(%seller, candidates = candidates.len(), "investigating seller");
                for purchase in candidates {
                    let key = purchase.key();
                    if !index.claim(key) {
                        continue;
                    }
                    summary.candidates += 1;
                    match investigate(self.source.as_ref(), purchase).await {
                        Ok(Classification::Eligible) => {
                            info!(%key, %seller, "queued for publishing");
                            queue.push(purchase.clone());
                        }
                        Ok(Classification::Rejected) => {
                            info!(%key, %seller, "dropped: no advertising line-item");
                            record(&mut state, &mut summary, purchase.clone(), Outcome::Dropped);
                        }
                        Err(err) => {
                            warn!(%key, %seller, error = %err, "detail fetch failed");
                            record(
                                &mut state,
                                &mut summary,
                                purchase.clone(),
                                Outcome::Error {
                                    reason: err.to_string(),
                                },
                            );
                        }
                    }
                }
            }

            for entry in publish_queue(queue, notifier.as_ref(), self.source.as_ref()).await {
                summary.count(&entry.outcome);
                state.record(entry);
            }
            summary.sellers_investigated = worklist;
        }

        state.last_run = started_at;
        state.totals = totals.value;
        state.catalog = catalog;
        self.store
            .persist(&state)
            .await
            .map_err(CycleError::PersistFailure)?;

        summary.ledger_size = state.ledger().len();
        summary.finished_at = Utc::now();
        info!(
            published = summary.published,
            dropped = summary.dropped,
            errors = summary.errors,
            "cycle complete"
        );
        Ok(summary)
    }

    /// Report which sellers a cycle would investigate, without touching the store or the
    /// notification channel.
    pub async fn probe(&self) -> Result<ProbeReport, CycleError> {
        let state = self.store.load().await.map_err(CycleError::StateUnavailable)?;
        let totals = self
            .source
            .fetch_totals()
            .await
            .map_err(|source| CycleError::FetchFailure {
                feed: "totals",
                source,
            })?
            .value;
        let sellers = diff_totals(&state.totals, &totals)
            .into_iter()
            .map(|seller| SellerDelta {
                previous: state.totals.get(&seller),
                current: totals.get(&seller).unwrap_or_default(),
                seller,
            })
            .collect();
        Ok(ProbeReport {
            last_run: state.last_run,
            sellers,
        })
    }

    /// Publish one specific order from the current catalog, bypassing the diff and the
    /// classifier. Orders that already have a ledger entry are refused.
    pub async fn publish_order(&self, key: NaturalKey) -> Result<ProcessedPurchase, CycleError> {
        let _lock = RunLock::acquire(self.store.path()).map_err(CycleError::StateUnavailable)?;
        let mut state = self.store.load().await.map_err(CycleError::StateUnavailable)?;

        if let Some(existing) = state.ledger_entry(key) {
            return Err(CycleError::AlreadyRecorded {
                key,
                status: existing.outcome.label(),
            });
        }

        let catalog = self
            .source
            .fetch_catalog()
            .await
            .map_err(|source| CycleError::FetchFailure {
                feed: "catalog",
                source,
            })?
            .value;
        let purchase = catalog
            .into_iter()
            .find(|p| p.key() == key)
            .ok_or(CycleError::OrderNotFound(key))?;

        let notifier = self
            .notifiers
            .connect()
            .await
            .map_err(CycleError::NotifierUnavailable)?;
        let entry = publish::publish_one(purchase, notifier.as_ref(), self.source.as_ref()).await;

        state.record(entry.clone());
        self.store
            .persist(&state)
            .await
            .map_err(CycleError::PersistFailure)?;
        Ok(entry)
    }

    async fn archive_raw(&self, fetched_at: DateTime<Utc>, feed: &str, raw: &[u8]) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.store(fetched_at, feed, raw).await {
            Ok(stored) => info!(
                feed,
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "raw payload archived"
            ),
            Err(err) => warn!(feed, error = %err, "raw payload archive failed"),
        }
    }
}

fn record(state: &mut ReconciliationState, summary: &mut CycleSummary, purchase: Purchase, outcome: Outcome) {
    summary.count(&outcome);
    state.record(ProcessedPurchase {
        purchase,
        processed_at: Utc::now(),
        outcome,
    });
}

pub fn build_pipeline(config: &SyncConfig) -> Result<ReconciliationPipeline> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let notifiers = TwitterNotifierFactory::new(
        http.client().clone(),
        config.twitter_api_base.clone(),
        config.twitter_access_token.clone(),
    );
    let source: Box<dyn ProcurementSource> = match &config.fixture_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "reading feeds from fixture directory");
            Box::new(FixtureSource::from_dir(dir.clone()).with_endpoints(config.endpoints()))
        }
        None => Box::new(OpenDataSource::new(http, config.endpoints())),
    };
    let mut pipeline = ReconciliationPipeline::new(
        StateStore::new(config.state_file.clone()),
        source,
        Box::new(notifiers),
    );
    if let Some(dir) = &config.archive_dir {
        pipeline = pipeline.with_archive(PayloadArchive::new(dir.clone()));
    }
    Ok(pipeline)
}

pub async fn run_cycle_from_env() -> Result<CycleSummary> {
    let config = SyncConfig::from_env();
    let pipeline = build_pipeline(&config)?;
    Ok(pipeline.run_once().await?)
}

/// Cron-driven cycles. Overlapping triggers wait for the running cycle to finish.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<ReconciliationPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let _guard = running.lock().await;
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    published = summary.published,
                    "scheduled cycle finished"
                ),
                Err(err) => error!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use pautabot_adapters::{FetchedFeed, LineItem, Notification, Notifier, PurchaseDetail};
    use pautabot_core::{PurchaseDate, SellerTotals};
    use tempfile::{tempdir, TempDir};

    fn purchase(order: u64, seller: &str, day: u32) -> Purchase {
        Purchase {
            fiscal_year: 2023,
            order_number: order,
            date: PurchaseDate::from_ymd(2023, 1, day).unwrap(),
            amount: 1000.0 + order as f64,
            seller: seller.to_string(),
            department: "Prensa".to_string(),
            docket: format!("EXP-{order}"),
        }
    }

    enum DetailReply {
        Items(Vec<&'static str>),
        Fails,
    }

    #[derive(Default)]
    struct FakeSource {
        catalog: Vec<Purchase>,
        totals: SellerTotals,
        details: HashMap<u64, DetailReply>,
        catalog_down: bool,
        detail_calls: StdMutex<Vec<NaturalKey>>,
    }

    #[async_trait]
    impl ProcurementSource for FakeSource {
        async fn fetch_catalog(&self) -> Result<FetchedFeed<Vec<Purchase>>, SourceError> {
            if self.catalog_down {
                return Err(SourceError::Message("catalog endpoint unreachable".into()));
            }
            Ok(FetchedFeed {
                value: self.catalog.clone(),
                raw: b"[]".to_vec(),
            })
        }

        async fn fetch_totals(&self) -> Result<FetchedFeed<SellerTotals>, SourceError> {
            Ok(FetchedFeed {
                value: self.totals.clone(),
                raw: b"[]".to_vec(),
            })
        }

        async fn fetch_detail(&self, key: NaturalKey) -> Result<PurchaseDetail, SourceError> {
            self.detail_calls.lock().unwrap().push(key);
            match self.details.get(&key.order_number) {
                Some(DetailReply::Items(items)) => Ok(PurchaseDetail {
                    line_items: items.iter().map(|d| LineItem::new(*d)).collect(),
                }),
                Some(DetailReply::Fails) => Err(SourceError::Message("connection reset".into())),
                None => Ok(PurchaseDetail::default()),
            }
        }

        fn detail_url(&self, key: NaturalKey) -> String {
            format!("https://example.test/oc/{}/{}", key.fiscal_year, key.order_number)
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        connects: Arc<AtomicUsize>,
        published: Arc<StdMutex<Vec<String>>>,
        failing_urls: Vec<String>,
        refuse_connect: bool,
    }

    struct FakeNotifier {
        recorder: Recorder,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn publish(&self, notification: &Notification) -> Result<String, PublishError> {
            let url = notification.text.trim_end().lines().last().unwrap_or_default().to_string();
            let mut published = self.recorder.published.lock().unwrap();
            published.push(url.clone());
            if self.recorder.failing_urls.contains(&url) {
                return Err(PublishError::Rejected {
                    status: 503,
                    body: "over capacity".into(),
                });
            }
            Ok(format!("tweet-{}", published.len()))
        }
    }

    #[async_trait]
    impl NotifierFactory for Recorder {
        async fn connect(&self) -> Result<Box<dyn Notifier>, PublishError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connect {
                return Err(PublishError::NotConfigured("no token".into()));
            }
            Ok(Box::new(FakeNotifier {
                recorder: self.clone(),
            }))
        }
    }

    fn url(order: u64) -> String {
        format!("https://example.test/oc/2023/{order}")
    }

    async fn seeded_store(dir: &TempDir, state: &ReconciliationState) -> StateStore {
        let store = StateStore::new(dir.path().join("pautabot.state.json"));
        store.persist(state).await.expect("seed state");
        store
    }

    fn old_state(totals: SellerTotals, ledger: Vec<ProcessedPurchase>) -> ReconciliationState {
        let last_run = DateTime::parse_from_rfc3339("2023-01-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ReconciliationState::new(last_run, totals, Vec::new(), ledger)
    }

    fn pipeline(store: StateStore, source: FakeSource, recorder: &Recorder) -> ReconciliationPipeline {
        ReconciliationPipeline::new(store, Box::new(source), Box::new(recorder.clone()))
    }

    #[tokio::test]
    async fn new_orders_are_published_chronologically_across_sellers() {
        let dir = tempdir().unwrap();
        let store = seeded_store(
            &dir,
            &old_state(SellerTotals::from_pairs([("Acme", 100.0)]), Vec::new()),
        )
        .await;
        let source = FakeSource {
            catalog: vec![
                purchase(1, "Acme", 5),
                purchase(2, "Acme", 1),
                purchase(3, "Beta", 10),
                purchase(4, "Beta", 3),
                purchase(5, "Gamma", 2),
            ],
            totals: SellerTotals::from_pairs([("Acme", 150.0), ("Beta", 40.0), ("Gamma", 7.0)]),
            details: HashMap::from([
                (1, DetailReply::Items(vec!["Publicidad radial"])),
                (2, DetailReply::Items(vec!["Toner", "PUBLICIDAD grafica"])),
                (3, DetailReply::Items(vec!["publicidad web"])),
                (4, DetailReply::Items(vec!["Resmas"])),
            ]),
            ..FakeSource::default()
        };
        let recorder = Recorder::default();
        let pipeline = pipeline(store.clone(), source, &recorder);

        let summary = pipeline.run_once().await.expect("cycle");

        assert_eq!(summary.sellers_investigated, vec!["Acme", "Beta", "Gamma"]);
        assert_eq!((summary.published, summary.dropped, summary.errors), (3, 2, 0));
        assert_eq!(
            *recorder.published.lock().unwrap(),
            vec![url(2), url(1), url(3)]
        );

        let state = store.load().await.unwrap();
        assert_eq!(state.ledger().len(), 5);
        assert_eq!(state.totals.get("Beta"), Some(40.0));
        assert_eq!(state.catalog.len(), 5);
        assert!(state.last_run > summary.previous_run);
        let published = state.ledger_entry(NaturalKey::new(2023, 2)).unwrap();
        assert_eq!(published.outcome.notification_id(), Some("tweet-1"));
    }

    #[tokio::test]
    async fn detail_fetch_failure_is_recorded_and_never_published() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir, &old_state(SellerTotals::default(), Vec::new())).await;
        let source = FakeSource {
            catalog: vec![purchase(10, "Acme", 4), purchase(11, "Acme", 5)],
            totals: SellerTotals::from_pairs([("Acme", 10.0)]),
            details: HashMap::from([
                (10, DetailReply::Fails),
                (11, DetailReply::Items(vec!["publicidad"])),
            ]),
            ..FakeSource::default()
        };
        let recorder = Recorder::default();
        let summary = pipeline(store.clone(), source, &recorder)
            .run_once()
            .await
            .expect("partial failure is still a successful cycle");

        assert_eq!((summary.published, summary.errors), (1, 1));
        assert_eq!(*recorder.published.lock().unwrap(), vec![url(11)]);

        let state = store.load().await.unwrap();
        let failed = state.ledger_entry(NaturalKey::new(2023, 10)).unwrap();
        assert_eq!(failed.outcome.label(), "error");
        assert_eq!(failed.outcome.notification_id(), None);
    }

    #[tokio::test]
    async fn unchanged_totals_persist_without_connecting_a_notifier() {
        let dir = tempdir().unwrap();
        let ledger = vec![ProcessedPurchase {
            purchase: purchase(77, "Acme", 2),
            processed_at: Utc::now(),
            outcome: Outcome::Dropped,
        }];
        let totals = SellerTotals::from_pairs([("Acme", 100.0), ("Beta", 50.0)]);
        let before = old_state(totals, ledger);
        let store = seeded_store(&dir, &before).await;
        let source = FakeSource {
            catalog: vec![purchase(77, "Acme", 2)],
            totals: SellerTotals::from_pairs([("Acme", 100.0), ("Beta", 20.0)]),
            ..FakeSource::default()
        };
        let recorder = Recorder {
            refuse_connect: true,
            ..Recorder::default()
        };

        let summary = pipeline(store.clone(), source, &recorder)
            .run_once()
            .await
            .expect("idle cycle");

        assert!(summary.is_idle());
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
        let after = store.load().await.unwrap();
        assert!(after.last_run > before.last_run);
        assert_eq!(after.ledger(), before.ledger());
        assert_eq!(after.totals.get("Beta"), Some(20.0));
    }

    #[tokio::test]
    async fn catalog_failure_aborts_and_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir, &old_state(SellerTotals::default(), Vec::new())).await;
        let before = std::fs::read(store.path()).unwrap();
        let source = FakeSource {
            catalog_down: true,
            totals: SellerTotals::from_pairs([("Acme", 10.0)]),
            ..FakeSource::default()
        };
        let recorder = Recorder::default();

        let err = pipeline(store.clone(), source, &recorder)
            .run_once()
            .await
            .unwrap_err();

        assert!(matches!(err, CycleError::FetchFailure { feed: "catalog", .. }));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
        assert!(!RunLock::lock_path_for(store.path()).exists());
    }

    #[tokio::test]
    async fn missing_store_is_fatal() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent.json"));
        let err = pipeline(store, FakeSource::default(), &Recorder::default())
            .run_once()
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::StateUnavailable(StoreError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn unreachable_notifier_aborts_before_any_mutation() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir, &old_state(SellerTotals::default(), Vec::new())).await;
        let before = std::fs::read(store.path()).unwrap();
        let source = FakeSource {
            catalog: vec![purchase(1, "Acme", 1)],
            totals: SellerTotals::from_pairs([("Acme", 10.0)]),
            ..FakeSource::default()
        };
        let recorder = Recorder {
            refuse_connect: true,
            ..Recorder::default()
        };
        let err = pipeline(store.clone(), source, &recorder)
            .run_once()
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::NotifierUnavailable(_)));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn failed_publish_does_not_stop_the_queue() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir, &old_state(SellerTotals::default(), Vec::new())).await;
        let source = FakeSource {
            catalog: vec![purchase(1, "Acme", 1), purchase(2, "Acme", 2), purchase(3, "Acme", 3)],
            totals: SellerTotals::from_pairs([("Acme", 10.0)]),
            details: HashMap::from([
                (1, DetailReply::Items(vec!["publicidad"])),
                (2, DetailReply::Items(vec!["publicidad"])),
                (3, DetailReply::Items(vec!["publicidad"])),
            ]),
            ..FakeSource::default()
        };
        let recorder = Recorder {
            failing_urls: vec![url(1)],
            ..Recorder::default()
        };

        let summary = pipeline(store.clone(), source, &recorder)
            .run_once()
            .await
            .expect("cycle");

        assert_eq!((summary.published, summary.errors), (2, 1));
        assert_eq!(recorder.published.lock().unwrap().len(), 3);
        let state = store.load().await.unwrap();
        let labels: Vec<_> = state.ledger().iter().map(|e| e.outcome.label()).collect();
        assert_eq!(labels, vec!["error", "processed", "processed"]);
    }

    #[tokio::test]
    async fn repeated_cycles_never_report_an_order_twice() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir, &old_state(SellerTotals::default(), Vec::new())).await;
        let catalog = vec![purchase(1, "Acme", 1), purchase(1, "Acme", 1)];
        let details = || HashMap::from([(1, DetailReply::Items(vec!["publicidad"]))]);
        let recorder = Recorder::default();

        let first = FakeSource {
            catalog: catalog.clone(),
            totals: SellerTotals::from_pairs([("Acme", 10.0)]),
            details: details(),
            ..FakeSource::default()
        };
        pipeline(store.clone(), first, &recorder).run_once().await.unwrap();

        // Total grows again but the catalog carries nothing new for Acme.
        let second = FakeSource {
            catalog,
            totals: SellerTotals::from_pairs([("Acme", 25.0)]),
            details: details(),
            ..FakeSource::default()
        };
        let summary = pipeline(store.clone(), second, &recorder).run_once().await.unwrap();

        assert_eq!(summary.candidates, 0);
        assert_eq!(recorder.published.lock().unwrap().len(), 1);
        assert_eq!(store.load().await.unwrap().ledger().len(), 1);
    }

    #[tokio::test]
    async fn probe_reports_without_mutating() {
        let dir = tempdir().unwrap();
        let store = seeded_store(
            &dir,
            &old_state(SellerTotals::from_pairs([("Acme", 100.0)]), Vec::new()),
        )
        .await;
        let before = std::fs::read(store.path()).unwrap();
        let source = FakeSource {
            totals: SellerTotals::from_pairs([("Acme", 150.0), ("Beta", 40.0)]),
            ..FakeSource::default()
        };
        let recorder = Recorder::default();

        let report = pipeline(store.clone(), source, &recorder).probe().await.unwrap();

        assert!(report.has_changes());
        assert_eq!(report.sellers[0].seller, "Acme");
        assert_eq!(report.sellers[0].previous, Some(100.0));
        assert_eq!(report.sellers[1].previous, None);
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn manual_publish_records_the_order_once() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir, &old_state(SellerTotals::default(), Vec::new())).await;
        let recorder = Recorder::default();
        let source = || FakeSource {
            catalog: vec![purchase(42, "Acme", 9)],
            ..FakeSource::default()
        };

        let entry = pipeline(store.clone(), source(), &recorder)
            .publish_order(NaturalKey::new(2023, 42))
            .await
            .expect("manual publish");
        assert_eq!(entry.outcome.notification_id(), Some("tweet-1"));

        let again = pipeline(store.clone(), source(), &recorder)
            .publish_order(NaturalKey::new(2023, 42))
            .await
            .unwrap_err();
        assert!(matches!(
            again,
            CycleError::AlreadyRecorded { status: "processed", .. }
        ));

        let missing = pipeline(store.clone(), source(), &recorder)
            .publish_order(NaturalKey::new(2023, 43))
            .await
            .unwrap_err();
        assert!(matches!(missing, CycleError::OrderNotFound(_)));
        assert_eq!(store.load().await.unwrap().ledger().len(), 1);
    }

    #[tokio::test]
    async fn sample_fixtures_run_end_to_end() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pautabot.state.json"));
        store.init(Utc::now()).await.unwrap();
        let fixtures = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample");
        let source = FixtureSource::from_dir(fixtures).with_endpoints(SourceEndpoints::for_year(2023));
        let recorder = Recorder::default();
        let pipeline = ReconciliationPipeline::new(store.clone(), Box::new(source), Box::new(recorder.clone()))
            .with_archive(PayloadArchive::new(dir.path().join("archive")));

        let summary = pipeline.run_once().await.expect("fixture cycle");

        assert_eq!(
            summary.sellers_investigated,
            vec!["La Nueva Provincia SRL", "Radio Universal SA"]
        );
        assert_eq!((summary.published, summary.dropped, summary.errors), (2, 1, 0));
        assert_eq!(
            *recorder.published.lock().unwrap(),
            vec![
                "https://www.bahia.gob.ar/compras/data/oc/2023/103".to_string(),
                "https://www.bahia.gob.ar/compras/data/oc/2023/101".to_string(),
            ]
        );
        let state = store.load().await.unwrap();
        assert!(state.ledger_entry(NaturalKey::new(2023, 104)).is_none());
        assert!(dir.path().join("archive").exists());
    }

    #[test]
    fn config_reads_overrides_and_defaults() {
        let vars = HashMap::from([
            ("PAUTABOT_YEAR", "2022"),
            ("PAUTABOT_SCHEDULER_ENABLED", "true"),
            ("PAUTABOT_ARCHIVE_DIR", ""),
            ("PAUTABOT_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.year, 2022);
        assert!(config.scheduler_enabled);
        assert_eq!(config.archive_dir, None);
        assert_eq!(config.fixture_dir, None);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.state_file, PathBuf::from("pautabot.state.json"));
        assert_eq!(
            config.endpoints().catalog(),
            "https://gobiernoabierto.bahia.gob.ar/WS/2307/2022"
        );
    }
}
