// 🎛️ Aggregation Controller - Fetch, join, cache, publish
//
// Online:  three feeds fetched concurrently → join → cache replace → publish
// Offline: cache read → publish
//
// Every failure ends as `result_empty = true` with `loading = false`;
// nothing is returned as an error to the view layer.

use crate::db::CacheStore;
use crate::join::join_with_stats;
use crate::records::StockCard;
use crate::session::{DataOrigin, EmptyReason, SessionState, SortOrder};
use crate::sort::sort_cards;
use crate::source::{
    FetchError, RemoteSource, DAILY_TRADING_ENDPOINT, MONTHLY_AVERAGE_ENDPOINT,
    VALUATION_ENDPOINT,
};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Result of one refresh cycle, for callers that want more than the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshOutcome {
    Published { origin: DataOrigin, count: usize },
    Empty(EmptyReason),
}

pub struct AggregationController {
    source: Arc<dyn RemoteSource>,
    cache: Arc<dyn CacheStore>,
    fetch_timeout: Duration,
    state: watch::Sender<SessionState>,

    /// Refreshes currently running; `loading` is true while non-zero.
    /// Only changed inside `state.send_modify`, so both stay in step.
    inflight: AtomicUsize,
}

/// Decrements the in-flight count when a refresh ends, however it ends.
struct LoadingGuard<'a> {
    controller: &'a AggregationController,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let inflight = &self.controller.inflight;
        self.controller.state.send_modify(|state| {
            let previous = inflight.fetch_sub(1, Ordering::SeqCst);
            state.loading = previous > 1;
        });
    }
}

impl AggregationController {
    pub fn new(source: Arc<dyn RemoteSource>, cache: Arc<dyn CacheStore>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        AggregationController {
            source,
            cache,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            state,
            inflight: AtomicUsize::new(0),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    /// Receiver that sees every published state.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    // ========================================================================
    // REFRESH
    // ========================================================================

    /// First refresh of the session. Later calls do nothing and return `None`.
    pub async fn initialize(&self, network_available: bool) -> Option<RefreshOutcome> {
        let mut first = false;
        self.state.send_if_modified(|state| {
            if state.initialized {
                return false;
            }
            state.initialized = true;
            self.inflight.fetch_add(1, Ordering::SeqCst);
            state.loading = true;
            first = true;
            true
        });

        if !first {
            debug!("controller already initialized");
            return None;
        }

        let guard = LoadingGuard { controller: self };
        Some(self.run_refresh(network_available, guard).await)
    }

    pub async fn refresh(&self, network_available: bool) -> RefreshOutcome {
        let guard = self.begin_loading();
        self.run_refresh(network_available, guard).await
    }

    /// Run [`refresh`](Self::refresh) on the runtime. Aborting the handle
    /// cancels the cycle without a partial publish.
    pub fn spawn_refresh(self: &Arc<Self>, network_available: bool) -> JoinHandle<RefreshOutcome> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.refresh(network_available).await })
    }

    pub fn spawn_initialize(
        self: &Arc<Self>,
        network_available: bool,
    ) -> JoinHandle<Option<RefreshOutcome>> {
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.initialize(network_available).await })
    }

    fn begin_loading(&self) -> LoadingGuard<'_> {
        self.state.send_modify(|state| {
            self.inflight.fetch_add(1, Ordering::SeqCst);
            state.loading = true;
        });
        LoadingGuard { controller: self }
    }

    async fn run_refresh(
        &self,
        network_available: bool,
        _loading: LoadingGuard<'_>,
    ) -> RefreshOutcome {
        let outcome = if network_available {
            self.refresh_from_remote().await
        } else {
            self.refresh_from_cache()
        };

        info!(network_available, ?outcome, "refresh finished");
        outcome
    }

    async fn refresh_from_remote(&self) -> RefreshOutcome {
        // Fan out, first failure aborts the whole cycle
        let fetched = tokio::try_join!(
            self.bounded(VALUATION_ENDPOINT, self.source.fetch_valuations()),
            self.bounded(MONTHLY_AVERAGE_ENDPOINT, self.source.fetch_monthly_averages()),
            self.bounded(DAILY_TRADING_ENDPOINT, self.source.fetch_daily_trading()),
        );

        let (valuations, averages, trading) = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "remote fetch failed");
                return self.finish_empty(EmptyReason::SourceUnavailable);
            }
        };

        let (cards, stats) = join_with_stats(&valuations, &averages, &trading);
        info!(
            valuations = valuations.len(),
            averages = averages.len(),
            trading = trading.len(),
            matched = stats.matched,
            missing_average = stats.missing_average,
            missing_trading = stats.missing_trading,
            "joined feeds"
        );

        if cards.is_empty() {
            return self.finish_empty(EmptyReason::EmptyJoin);
        }

        // No await between here and the publish: cancellation applies both or neither.
        if let Err(e) = self.cache.replace_all(&cards) {
            warn!(error = %e, "could not persist cards, publishing anyway");
        }

        self.finish_published(cards, DataOrigin::Remote)
    }

    fn refresh_from_cache(&self) -> RefreshOutcome {
        match self.cache.read_all() {
            Ok(cards) if cards.is_empty() => self.finish_empty(EmptyReason::CacheEmpty),
            Ok(cards) => self.finish_published(cards, DataOrigin::Cache),
            Err(e) => {
                warn!(error = %e, "cache read failed");
                self.finish_empty(EmptyReason::CacheReadFailure)
            }
        }
    }

    async fn bounded<T>(
        &self,
        endpoint: &'static str,
        fetch: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, FetchError> {
        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.fetch_timeout,
            }),
        }
    }

    fn finish_published(&self, cards: Vec<StockCard>, origin: DataOrigin) -> RefreshOutcome {
        let count = cards.len();
        self.state.send_modify(|state| state.publish(cards, origin));
        RefreshOutcome::Published { origin, count }
    }

    fn finish_empty(&self, reason: EmptyReason) -> RefreshOutcome {
        self.state.send_modify(|state| state.mark_empty(reason));
        RefreshOutcome::Empty(reason)
    }

    // ========================================================================
    // PRESENTATION STATE
    // ========================================================================

    /// Reorder the current results by numeric code. No fetch, no join.
    pub fn sort(&self, ascending: bool) {
        let order = SortOrder::from_ascending(ascending);
        self.state.send_modify(|state| {
            sort_cards(&mut state.results, order);
            state.sort_order = Some(order);
        });
    }

    pub fn select_record(&self, record: StockCard) {
        self.state.send_modify(|state| {
            state.selected_record = Some(record);
            state.dialog_visible = true;
        });
    }

    pub fn clear_selection(&self) {
        self.state.send_modify(|state| {
            state.selected_record = None;
            state.dialog_visible = false;
        });
    }

    pub fn set_sort_sheet_visible(&self, visible: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.sort_sheet_visible != visible;
            state.sort_sheet_visible = visible;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{fingerprint, CacheMeta, SqliteCache, StoreError};
    use crate::records::fixtures::*;
    use crate::records::{DailyTradingRow, MonthlyAverageRow, ValuationRow};
    use crate::session::Phase;
    use crate::source::{Feed, StaticSource};

    fn full_source(codes: &[&str]) -> StaticSource {
        StaticSource::new(
            codes.iter().map(|c| valuation(c, "27.10")).collect(),
            codes.iter().map(|c| average(c, "600")).collect(),
            codes.iter().map(|c| trading(c, "32.25")).collect(),
        )
    }

    fn controller_with(
        source: StaticSource,
    ) -> (Arc<AggregationController>, Arc<StaticSource>, Arc<SqliteCache>) {
        let source = Arc::new(source);
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let controller = Arc::new(AggregationController::new(source.clone(), cache.clone()));
        (controller, source, cache)
    }

    fn codes(cards: &[StockCard]) -> Vec<String> {
        cards.iter().map(|c| c.code.to_string()).collect()
    }

    /// Cache wrapper whose reads or writes can be made to fail.
    struct FlakyCache {
        inner: SqliteCache,
        fail_reads: bool,
        fail_writes: bool,
    }

    impl CacheStore for FlakyCache {
        fn read_all(&self) -> Result<Vec<StockCard>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Corrupt("unreadable".to_string()));
            }
            self.inner.read_all()
        }

        fn replace_all(&self, cards: &[StockCard]) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Poisoned);
            }
            self.inner.replace_all(cards)
        }

        fn metadata(&self) -> Result<Option<CacheMeta>, StoreError> {
            self.inner.metadata()
        }
    }

    #[tokio::test]
    async fn test_online_refresh_publishes_and_writes_through() {
        let (controller, _source, cache) = controller_with(full_source(&["2330", "1101"]));
        cache.replace_all(&[card("9999"), card("8888")]).unwrap();

        let outcome = controller.refresh(true).await;

        assert_eq!(
            outcome,
            RefreshOutcome::Published {
                origin: DataOrigin::Remote,
                count: 2
            }
        );

        let state = controller.snapshot();
        assert!(!state.loading);
        assert!(!state.result_empty);
        assert_eq!(state.origin, Some(DataOrigin::Remote));
        assert_eq!(codes(&state.results), vec!["2330", "1101"]);

        // Old rows replaced, not merged
        assert_eq!(cache.read_all().unwrap(), state.results);
    }

    #[tokio::test]
    async fn test_end_to_end_missing_trading_feed() {
        let source = StaticSource::new(
            vec![valuation("1101", "27.10")],
            vec![average("1101", "600")],
            vec![],
        );
        let (controller, _source, cache) = controller_with(source);
        cache.replace_all(&[card("2330")]).unwrap();

        let outcome = controller.refresh(true).await;

        assert_eq!(outcome, RefreshOutcome::Empty(EmptyReason::EmptyJoin));
        let state = controller.snapshot();
        assert!(state.result_empty);
        assert!(!state.loading);

        // Cache untouched
        assert_eq!(codes(&cache.read_all().unwrap()), vec!["2330"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_cycle() {
        let (controller, source, cache) = controller_with(full_source(&["1101"]));
        controller.refresh(true).await;
        let meta_before = cache.metadata().unwrap();

        source.set_rows(
            vec![valuation("2330", "1")],
            vec![average("2330", "1")],
            vec![trading("2330", "1")],
        );
        source.set_failing(Some(Feed::DailyTrading));
        let outcome = controller.refresh(true).await;

        assert_eq!(outcome, RefreshOutcome::Empty(EmptyReason::SourceUnavailable));
        let state = controller.snapshot();
        assert!(state.result_empty);
        assert!(!state.loading);
        assert_eq!(state.empty_reason, Some(EmptyReason::SourceUnavailable));
        // Earlier cards stay visible, cache still holds the previous set
        assert_eq!(codes(&state.results), vec!["1101"]);
        assert_eq!(codes(&cache.read_all().unwrap()), vec!["1101"]);
        assert_eq!(cache.metadata().unwrap(), meta_before);
    }

    #[tokio::test]
    async fn test_slow_feed_times_out() {
        let source = Arc::new(full_source(&["1101"]));
        source.set_delay(Some(Duration::from_millis(500)));
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let controller = AggregationController::new(source, cache)
            .with_fetch_timeout(Duration::from_millis(20));

        let outcome = controller.refresh(true).await;

        assert_eq!(outcome, RefreshOutcome::Empty(EmptyReason::SourceUnavailable));
        assert!(!controller.snapshot().loading);
    }

    #[tokio::test]
    async fn test_offline_refresh_reads_cache() {
        let (controller, _source, cache) = controller_with(full_source(&["1101"]));
        let cached = vec![card("2330"), card("0050"), card("1101")];
        cache.replace_all(&cached).unwrap();

        let outcome = controller.refresh(false).await;

        assert_eq!(
            outcome,
            RefreshOutcome::Published {
                origin: DataOrigin::Cache,
                count: 3
            }
        );
        let state = controller.snapshot();
        assert!(!state.result_empty);
        assert_eq!(state.results, cached);
        assert_eq!(state.origin, Some(DataOrigin::Cache));
    }

    #[tokio::test]
    async fn test_offline_refresh_with_empty_cache() {
        let (controller, _source, _cache) = controller_with(full_source(&["1101"]));

        let outcome = controller.refresh(false).await;

        assert_eq!(outcome, RefreshOutcome::Empty(EmptyReason::CacheEmpty));
        let state = controller.snapshot();
        assert!(state.result_empty);
        assert!(!state.loading);
        assert!(state.results.is_empty());
    }

    #[tokio::test]
    async fn test_cache_read_failure_counts_as_empty() {
        let cache = Arc::new(FlakyCache {
            inner: SqliteCache::open_in_memory().unwrap(),
            fail_reads: true,
            fail_writes: false,
        });
        let controller = AggregationController::new(Arc::new(full_source(&["1101"])), cache);

        let outcome = controller.refresh(false).await;

        assert_eq!(outcome, RefreshOutcome::Empty(EmptyReason::CacheReadFailure));
        assert!(controller.snapshot().result_empty);
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_publishes() {
        let cache = Arc::new(FlakyCache {
            inner: SqliteCache::open_in_memory().unwrap(),
            fail_reads: false,
            fail_writes: true,
        });
        let controller =
            AggregationController::new(Arc::new(full_source(&["1101", "2330"])), cache.clone());

        let outcome = controller.refresh(true).await;

        assert!(matches!(outcome, RefreshOutcome::Published { count: 2, .. }));
        assert!(!controller.snapshot().result_empty);
        assert!(cache.inner.read_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_refreshes_once() {
        let (controller, source, _cache) = controller_with(full_source(&["1101"]));
        assert_eq!(controller.snapshot().phase(), Phase::Uninitialized);

        let first = controller.initialize(true).await;
        assert!(matches!(first, Some(RefreshOutcome::Published { .. })));
        assert!(controller.snapshot().initialized);

        // A second call must not fetch again
        source.set_failing(Some(Feed::Valuation));
        assert_eq!(controller.initialize(true).await, None);

        let state = controller.snapshot();
        assert!(!state.result_empty);
        assert_eq!(state.phase(), Phase::Ready { empty: false });
    }

    #[tokio::test]
    async fn test_loading_visible_while_refresh_in_flight() {
        let (controller, source, _cache) = controller_with(full_source(&["1101"]));
        source.set_delay(Some(Duration::from_millis(100)));
        let mut rx = controller.subscribe();

        let first = controller.spawn_refresh(true);
        let second = controller.spawn_refresh(true);

        rx.wait_for(|state| state.loading).await.unwrap();
        assert_eq!(controller.snapshot().phase(), Phase::Loading);

        first.await.unwrap();
        second.await.unwrap();

        let state = controller.snapshot();
        assert!(!state.loading);
        assert_eq!(codes(&state.results), vec!["1101"]);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_leaves_no_partial_state() {
        let (controller, source, cache) = controller_with(full_source(&["1101"]));
        source.set_delay(Some(Duration::from_secs(30)));
        let mut rx = controller.subscribe();

        let handle = controller.spawn_refresh(true);
        rx.wait_for(|state| state.loading).await.unwrap();

        handle.abort();
        let err = handle.await.unwrap_err();
        assert!(err.is_cancelled());

        let state = controller.snapshot();
        assert!(!state.loading);
        assert!(state.result_empty);
        assert!(state.results.is_empty());
        assert!(cache.read_all().unwrap().is_empty());
    }

    struct PanickingSource;

    #[async_trait::async_trait]
    impl RemoteSource for PanickingSource {
        async fn fetch_valuations(&self) -> Result<Vec<ValuationRow>, FetchError> {
            panic!("valuation feed blew up");
        }

        async fn fetch_monthly_averages(&self) -> Result<Vec<MonthlyAverageRow>, FetchError> {
            Ok(vec![average("1101", "600")])
        }

        async fn fetch_daily_trading(&self) -> Result<Vec<DailyTradingRow>, FetchError> {
            Ok(vec![trading("1101", "32.25")])
        }
    }

    #[tokio::test]
    async fn test_panicking_fetch_clears_loading() {
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let controller = Arc::new(AggregationController::new(
            Arc::new(PanickingSource),
            cache.clone(),
        ));

        let err = controller.spawn_refresh(true).await.unwrap_err();
        assert!(err.is_panic());

        let state = controller.snapshot();
        assert!(!state.loading);
        assert!(state.results.is_empty());
        assert!(cache.read_all().unwrap().is_empty());

        // The controller is still usable afterwards
        let mut rx = controller.subscribe();
        let second = controller.spawn_refresh(true);
        assert!(second.await.unwrap_err().is_panic());
        assert!(!rx.borrow_and_update().loading);
    }

    #[tokio::test]
    async fn test_repeated_valuation_code_is_cached_as_published() {
        let source = StaticSource::new(
            vec![valuation("1101", "27.10"), valuation("1101", "28.00")],
            vec![average("1101", "600")],
            vec![trading("1101", "32.25")],
        );
        let (controller, _source, cache) = controller_with(source);

        let outcome = controller.refresh(true).await;
        assert_eq!(
            outcome,
            RefreshOutcome::Published {
                origin: DataOrigin::Remote,
                count: 2
            }
        );

        let results = controller.snapshot().results;
        assert_eq!(codes(&results), vec!["1101", "1101"]);
        assert_eq!(cache.read_all().unwrap(), results);

        let meta = cache.metadata().unwrap().unwrap();
        assert_eq!(meta.record_count, results.len());
        assert_eq!(meta.fingerprint, fingerprint(&results));

        // Offline refresh brings back the same two cards
        controller.refresh(false).await;
        assert_eq!(controller.snapshot().results, results);
    }

    #[tokio::test]
    async fn test_sort_reorders_current_results_only() {
        let (controller, source, _cache) =
            controller_with(full_source(&["2330", "00632R", "1101", "9904"]));
        controller.refresh(true).await;

        // Feeds changing must not affect a sort
        source.set_failing(Some(Feed::Valuation));

        controller.sort(true);
        let ascending = codes(&controller.snapshot().results);
        assert_eq!(ascending, vec!["1101", "2330", "9904", "00632R"]);

        controller.sort(false);
        let state = controller.snapshot();
        assert_eq!(codes(&state.results), vec!["9904", "2330", "1101", "00632R"]);
        assert_eq!(state.sort_order, Some(SortOrder::Descending));
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_selection_and_sort_sheet() {
        let (controller, _source, _cache) = controller_with(full_source(&["1101"]));

        controller.select_record(card("1101"));
        let state = controller.snapshot();
        assert!(state.dialog_visible);
        assert_eq!(state.selected_record, Some(card("1101")));

        controller.clear_selection();
        let state = controller.snapshot();
        assert!(!state.dialog_visible);
        assert_eq!(state.selected_record, None);

        controller.set_sort_sheet_visible(true);
        assert!(controller.snapshot().sort_sheet_visible);
        controller.set_sort_sheet_visible(false);
        assert!(!controller.snapshot().sort_sheet_visible);
    }
}
