//! Scan-cycle orchestrator (spec §4.6, §4.9). Fans data collection out across
//! the adapter, feeds the manipulation detector and scoring pipeline, and
//! drives the broadcast/signal/persistence fan-in each cycle. Grounded in
//! `jobs/loop.py`'s `run_cycle`/`loop` pair and `main.rs`'s `tokio::spawn`
//! background-task pattern, with the AI-engine/Level2/training-data side
//! channels left behind as out of scope.

use crate::adapter::MarketDataSource;
use crate::broadcast::Broadcast;
use crate::config::Config;
use crate::control::ControlPlane;
use crate::error::AdapterError;
use crate::manip::{DetectInput, ManipulationDetector};
use crate::metrics::{self, Side};
use crate::models::{
    AdapterState, RankedItem, RankingFrame, ScanCycleReport, Snapshot, VolatilityBucket,
};
use crate::persistence::{log_persist_failure, BarRecord, CacheSink, PersistenceSink, RankingRecord};
use crate::rules::SignalBus;
use crate::scoring;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const TIMEFRAME: &str = "1m";
const OHLCV_LIMIT: usize = 200;
const TRADES_LIMIT: usize = 200;
const ATR_PERIOD: usize = 50;
const RETURNS_LOOKBACK: usize = 15;
const VOLUME_Z_LOOKBACK: usize = 60;
const VOLATILITY_SHORT_WINDOW: usize = 20;
const VOLATILITY_LONG_WINDOW: usize = 60;
const VELOCITY_WINDOW: usize = 5;
const RSI_PERIOD: usize = 14;
const ORDER_FLOW_DEPTH: usize = 10;
const MAX_BACKOFF_SEC: u64 = 300;

/// One symbol's raw snapshot plus the bookkeeping the orchestrator needs
/// after scoring (close price for persistence, per-symbol fetch latency).
struct SnapshotBundle {
    snapshot: Snapshot,
    close: f64,
    fetch_latency_ms: u64,
    /// `(queue_position_estimate, simulated_impact_bps)` at `notional_test`.
    execution: (f64, f64),
}

/// Owns the per-cycle state the orchestrator threads between runs:
/// previous-cycle ranks for `rank_delta`, and the collaborators it drives.
pub struct Orchestrator {
    config: Config,
    adapter: Arc<dyn MarketDataSource>,
    detector: ManipulationDetector,
    broadcast: Arc<Broadcast>,
    signal_bus: Arc<SignalBus>,
    control: Arc<ControlPlane>,
    persistence: Arc<dyn PersistenceSink>,
    cache: Arc<dyn CacheSink>,
    previous_ranks: Mutex<HashMap<String, usize>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        adapter: Arc<dyn MarketDataSource>,
        broadcast: Arc<Broadcast>,
        signal_bus: Arc<SignalBus>,
        control: Arc<ControlPlane>,
        persistence: Arc<dyn PersistenceSink>,
        cache: Arc<dyn CacheSink>,
    ) -> Self {
        Self {
            config,
            adapter,
            detector: ManipulationDetector::new(),
            broadcast,
            signal_bus,
            control,
            persistence,
            cache,
            previous_ranks: Mutex::new(HashMap::new()),
        }
    }

    /// Long-running background loop (spec §4.9 ordering): wait on the pause
    /// gate, skip entirely while the manual breaker is open, run one cycle,
    /// then sleep the remaining interval unless a force-scan shortens it.
    pub async fn run(self: Arc<Self>) {
        let profile = self.config.profile_default.clone();
        let mut failure_streak: u32 = 0;

        loop {
            self.control.wait_until_resumed().await;

            if self.control.manual_breaker_open() {
                self.control.update_health(|h| {
                    h.last_error = Some("manual circuit breaker open".to_string());
                });
                self.control.sleep_or_force(Duration::from_secs(self.config.scan_interval_sec)).await;
                continue;
            }

            let started = Instant::now();
            match self.run_cycle(&profile).await {
                Ok(report) => {
                    failure_streak = 0;
                    self.control.update_health(|h| {
                        h.durations_ms.push(report.duration_ms);
                        h.last_success = Some(report.finished_at);
                        h.last_error = None;
                        h.failure_streak = 0;
                        h.backoff_sec = 0.0;
                        h.cycle_count += 1;
                        h.adapter_state = Some(report.adapter_state);
                    });
                    info!(
                        duration_ms = report.duration_ms,
                        scanned = report.scanned,
                        ranked = report.ranked,
                        errors = report.errors,
                        "scan cycle complete"
                    );
                }
                Err(err) => {
                    failure_streak += 1;
                    let backoff = Duration::from_secs(
                        (self.config.scan_interval_sec.saturating_mul(2u64.saturating_pow(failure_streak)))
                            .min(MAX_BACKOFF_SEC),
                    );
                    warn!(error = %err, backoff_sec = backoff.as_secs(), "scan cycle failed; backing off");
                    self.control.update_health(|h| {
                        h.last_error = Some(err.to_string());
                        h.failure_streak = failure_streak;
                        h.backoff_sec = backoff.as_secs_f64();
                    });
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            }

            let elapsed = started.elapsed();
            let remaining = Duration::from_secs(self.config.scan_interval_sec).saturating_sub(elapsed);
            if remaining > Duration::ZERO {
                self.control.sleep_or_force(remaining).await;
            }
        }
    }

    /// `RunCycle(profile) -> (snapshots, ranked, adapterState)` (spec §4.6).
    async fn run_cycle(&self, profile: &str) -> anyhow::Result<ScanCycleReport> {
        let started_at = Utc::now();
        let started = Instant::now();

        let symbols = self.load_symbols().await?;
        let adapter_state = self.adapter.state();
        if symbols.is_empty() {
            warn!("no active perpetual symbols discovered; skipping cycle");
            return Ok(self.empty_report(started_at, started, adapter_state));
        }

        let mut bundles = self.collect_snapshots(&symbols).await;
        let adapter_state = self.adapter.state();
        if bundles.is_empty() {
            return Ok(self.empty_report(started_at, started, adapter_state));
        }

        bundles.sort_by(|a, b| b.snapshot.quote_volume_usdt.partial_cmp(&a.snapshot.quote_volume_usdt).unwrap_or(std::cmp::Ordering::Equal));
        bundles.truncate(self.config.scan_top_by_qvol);

        let mut snapshots: Vec<Snapshot> = bundles.iter().map(|b| b.snapshot.clone()).collect();
        crate::factors::enrich_cross_sectional(&mut snapshots);

        let ranked = scoring::rank(&snapshots, self.config.topn_default, profile, None, &self.config)?;

        let bundle_by_symbol: HashMap<&str, &SnapshotBundle> =
            bundles.iter().map(|b| (b.snapshot.symbol.as_str(), b)).collect();

        let items = self.build_ranked_items(&ranked, &bundle_by_symbol, started_at);

        let market_gauge = snapshots.iter().map(|s| s.atr_pct).sum::<f64>() / snapshots.len().max(1) as f64;
        let volatility_bucket = if market_gauge > 3.0 {
            VolatilityBucket::High
        } else if market_gauge > 1.5 {
            VolatilityBucket::Medium
        } else {
            VolatilityBucket::Low
        };

        let frame = RankingFrame {
            ts: started_at,
            profile: profile.to_string(),
            market_gauge,
            volatility_bucket,
            items: items.clone(),
        };
        self.broadcast.publish(frame);

        for item in &items {
            self.signal_bus.publish_if_matched(item);
        }

        self.persist_cycle(&bundles, &items, profile).await;

        let finished_at = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;
        self.control.update_health(|h| {
            for bundle in &bundles {
                h.symbol_liveness.insert(bundle.snapshot.symbol.clone(), bundle.snapshot.ts);
            }
        });

        Ok(ScanCycleReport {
            duration_ms,
            scanned: bundles.len(),
            ranked: items.len(),
            errors: 0,
            started_at,
            finished_at,
            adapter_state,
        })
    }

    fn empty_report(&self, started_at: chrono::DateTime<Utc>, started: Instant, adapter_state: AdapterState) -> ScanCycleReport {
        ScanCycleReport {
            duration_ms: started.elapsed().as_millis() as u64,
            scanned: 0,
            ranked: 0,
            errors: 0,
            started_at,
            finished_at: Utc::now(),
            adapter_state,
        }
    }

    /// Configured allow-list, or the cached set of active USDT perpetuals
    /// (spec §4.6 step 2).
    async fn load_symbols(&self) -> Result<Vec<String>, AdapterError> {
        if !self.config.symbols.is_empty() {
            return Ok(self.config.symbols.clone());
        }
        let markets = self.adapter.load_markets().await?;
        Ok(markets.into_values().filter(|m| m.active).map(|m| m.symbol).collect())
    }

    /// Fans `BuildSnapshot` out across `scan_concurrency`-sized chunks (spec
    /// §4.6 step 3). A single symbol's failure is logged and dropped, never
    /// fails the chunk.
    async fn collect_snapshots(&self, symbols: &[String]) -> Vec<SnapshotBundle> {
        let mut bundles = Vec::with_capacity(symbols.len());
        for chunk in symbols.chunks(self.config.scan_concurrency.max(1)) {
            let futures = chunk.iter().map(|symbol| self.build_snapshot(symbol));
            let results = futures_util::future::join_all(futures).await;
            for (symbol, result) in chunk.iter().zip(results) {
                match result {
                    Ok(Some(bundle)) => bundles.push(bundle),
                    Ok(None) => {}
                    Err(err) => warn!(symbol, error = %err, "snapshot build failed; dropping symbol for this cycle"),
                }
            }
        }
        bundles
    }

    /// `BuildSnapshot(symbol)` (spec §4.6 step 4): parallel ticker/book/OHLCV,
    /// tolerant trades/funding/open-interest, feature assembly, manipulation
    /// detection.
    async fn build_snapshot(&self, symbol: &str) -> Result<Option<SnapshotBundle>, AdapterError> {
        let fetch_started = Instant::now();
        let (ticker, book, bars) = tokio::try_join!(
            self.adapter.fetch_ticker(symbol),
            self.adapter.fetch_order_book(symbol, 50),
            self.adapter.fetch_ohlcv(symbol, TIMEFRAME, OHLCV_LIMIT),
        )?;
        let fetch_latency_ms = fetch_started.elapsed().as_millis() as u64;

        let trades = self.adapter.fetch_trades(symbol, TRADES_LIMIT).await.unwrap_or_default();
        let (funding, open_interest) =
            tokio::join!(self.adapter.fetch_funding_rate(symbol), self.adapter.fetch_open_interest(symbol));
        let funding = funding.unwrap_or(None);
        let open_interest = open_interest.unwrap_or(None);

        let closes = metrics::closes_from_bars(&bars);
        let close = closes.last().copied().unwrap_or_else(|| ticker.last.unwrap_or(0.0));
        if close <= 0.0 {
            return Ok(None);
        }

        let qvol = metrics::quote_volume_usdt(&ticker);
        let depth = metrics::top5_depth_usdt(&book);
        let atr_pct = metrics::atr_pct(&bars, ATR_PERIOD);
        let returns = metrics::returns(&closes, RETURNS_LOOKBACK);
        let slip_bps = metrics::estimate_slippage_bps(&book, self.config.notional_test, Side::Both);
        let spread_bps = metrics::spread_bps(ticker.bid, ticker.ask);
        let funding_pct = metrics::funding_8h_pct(funding.map(|f| f.rate));
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let volume_z = metrics::volume_zscore(&volumes, VOLUME_Z_LOOKBACK);
        let vol_regime = metrics::volatility_regime(&closes, VOLATILITY_SHORT_WINDOW, VOLATILITY_LONG_WINDOW);
        let velocity = metrics::price_velocity(&closes, VELOCITY_WINDOW);
        let ofi = metrics::order_flow_imbalance(&book, ORDER_FLOW_DEPTH);
        let pump_score = metrics::pump_dump_score(returns.ret_15, returns.ret_1, volume_z, vol_regime);
        let depth_to_volume = {
            let bar_volume_usdt = bars.last().map(|b| b.volume * b.close).unwrap_or(0.0);
            if bar_volume_usdt > 0.0 { depth / bar_volume_usdt } else { 0.0 }
        };
        let basis_bps = metrics::basis_bps(ticker.last, ticker.provider_info.get("indexPrice").copied());
        let zscores = metrics::timeframe_zscores(&closes, velocity);
        let vwap_distance = metrics::vwap_distance(&bars, close);
        let rsi14 = metrics::rsi(&closes, RSI_PERIOD);
        let _ = trades.len(); // trade-level flow already folded into order_flow_imbalance via the book

        let ts = Utc::now();
        let manip = self.detector.detect(
            symbol,
            DetectInput {
                book: &book,
                bars: &bars,
                close,
                atr_pct,
                ret_1: returns.ret_1,
                ret_15: returns.ret_15,
                funding: funding_pct,
                open_interest: open_interest.map(|oi| oi.value),
                ts: ts.timestamp(),
                notional_test: self.config.notional_test,
            },
        );

        let snapshot = Snapshot {
            symbol: symbol.to_string(),
            exchange: self.config.exchange.clone(),
            ts,
            quote_volume_usdt: qvol,
            top5_depth_usdt: depth,
            spread_bps,
            slip_bps,
            atr_pct,
            ret_1: returns.ret_1,
            ret_15: returns.ret_15,
            price_velocity: velocity,
            funding_8h_pct: funding_pct,
            open_interest: open_interest.map(|oi| oi.value),
            basis_bps,
            volume_zscore: volume_z,
            order_flow_imbalance: ofi,
            volatility_regime: vol_regime,
            anomaly_score: pump_score,
            depth_to_volume_ratio: depth_to_volume,
            liquidity_edge: 0.0,
            momentum_edge: 0.0,
            volatility_edge: 0.0,
            microstructure_edge: 0.0,
            anomaly_residual: 0.0,
            z_15s: zscores.z_15s,
            z_1m: zscores.z_1m,
            z_5m: zscores.z_5m,
            vwap_distance,
            rsi14,
            manip_score: Some(manip.score),
            manip_flags: manip.flags,
            score: 0.0,
        };

        let execution = (
            metrics::queue_position_estimate(&book, self.config.notional_test),
            metrics::simulated_impact(&book, self.config.notional_test),
        );

        Ok(Some(SnapshotBundle { snapshot, close, fetch_latency_ms, execution }))
    }

    /// Step 8: rank_delta bookkeeping, staleness, latency, execution metrics
    /// (spec §4.6 step 8).
    fn build_ranked_items(
        &self,
        ranked: &[(Snapshot, scoring::Breakdown)],
        bundle_by_symbol: &HashMap<&str, &SnapshotBundle>,
        now: chrono::DateTime<Utc>,
    ) -> Vec<RankedItem> {
        let mut previous_ranks = self.previous_ranks.lock();
        let stale_after = Duration::from_secs(self.config.scan_interval_sec * 2);

        let mut items = Vec::with_capacity(ranked.len());
        for (rank_index, (snapshot, breakdown)) in ranked.iter().enumerate() {
            let rank = rank_index + 1;
            let prev_rank = previous_ranks.get(&snapshot.symbol).copied().unwrap_or(rank);
            let rank_delta = prev_rank as i64 - rank as i64;
            previous_ranks.insert(snapshot.symbol.clone(), rank);

            let bundle = bundle_by_symbol.get(snapshot.symbol.as_str());
            let latency_ms = bundle.map(|b| b.fetch_latency_ms).unwrap_or(0);
            let age = (now - snapshot.ts).to_std().unwrap_or(Duration::ZERO);
            let stale = age > stale_after;

            let mut execution_metrics = std::collections::BTreeMap::new();
            execution_metrics.insert("spread_bps".to_string(), snapshot.spread_bps);
            execution_metrics.insert("slip_bps".to_string(), snapshot.slip_bps);
            execution_metrics.insert("depth_to_volume_ratio".to_string(), snapshot.depth_to_volume_ratio);
            if let Some(execution) = bundle.map(|b| b.execution) {
                execution_metrics.insert("queue_position".to_string(), execution.0);
                execution_metrics.insert("simulated_impact_bps".to_string(), execution.1);
            }

            let manipulation_threshold_exceeded = self
                .config
                .manipulation_threshold
                .is_some_and(|threshold| snapshot.manip_score.unwrap_or(0.0) >= threshold);

            items.push(RankedItem {
                symbol: snapshot.symbol.clone(),
                rank,
                rank_delta: Some(rank_delta),
                score: snapshot.score,
                score_components: breakdown.clone(),
                execution_metrics,
                stale,
                latency_ms,
                manipulation_threshold_exceeded,
                snapshot: snapshot.clone(),
            });
        }
        items
    }

    /// Fire-and-forget persistence/cache fan-out (spec §4.6 step 9, §7:
    /// persistence failures never fail the cycle).
    async fn persist_cycle(&self, bundles: &[SnapshotBundle], items: &[RankedItem], profile: &str) {
        let snapshots: Vec<Snapshot> = bundles.iter().map(|b| b.snapshot.clone()).collect();
        if let Err(err) = self.cache.cache_snapshots(&snapshots).await {
            log_persist_failure("cache_snapshots", &err);
        }
        if let Err(err) = self.cache.cache_rankings(profile, items).await {
            log_persist_failure("cache_rankings", &err);
        }

        for bundle in bundles {
            let mut record = BarRecord::from_snapshot(&bundle.snapshot);
            record.close = bundle.close;
            if let Err(err) = self.persistence.persist_bar(record).await {
                log_persist_failure("persist_bar", &err);
            }
        }

        let records: Vec<RankingRecord> = items.iter().map(|item| RankingRecord::from_ranked_item(item, profile)).collect();
        if let Err(err) = self.persistence.persist_rankings(records).await {
            log_persist_failure("persist_rankings", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MarketInfo;
    use crate::models::{Bar, CircuitState, FundingRate, OpenInterest, OrderBook, Ticker, Trade};
    use crate::persistence::{LoggingCache, LoggingPersistence};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    struct FakeAdapter {
        symbols: Vec<String>,
    }

    #[async_trait]
    impl MarketDataSource for FakeAdapter {
        async fn load_markets(&self) -> Result<StdHashMap<String, MarketInfo>, AdapterError> {
            Ok(self
                .symbols
                .iter()
                .map(|s| (s.clone(), MarketInfo { symbol: s.clone(), base: "BTC".into(), quote: "USDT".into(), active: true }))
                .collect())
        }

        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, AdapterError> {
            Ok(Ticker {
                bid: Some(99.9),
                ask: Some(100.1),
                last: Some(100.0),
                high: Some(101.0),
                low: Some(99.0),
                quote_volume: Some(50_000_000.0),
                base_volume: Some(500_000.0),
                timestamp: Some(Utc::now()),
                provider_info: StdHashMap::new(),
            })
        }

        async fn fetch_order_book(&self, _symbol: &str, _limit: usize) -> Result<OrderBook, AdapterError> {
            Ok(OrderBook {
                bids: vec![(99.9, 10.0), (99.8, 10.0)],
                asks: vec![(100.1, 10.0), (100.2, 10.0)],
                timestamp: Some(Utc::now()),
            })
        }

        async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, limit: usize) -> Result<Vec<Bar>, AdapterError> {
            Ok((0..limit.min(30))
                .map(|i| Bar { ts: i as i64, open: 100.0, high: 101.0, low: 99.0, close: 100.0 + i as f64 * 0.01, volume: 1000.0 })
                .collect())
        }

        async fn fetch_trades(&self, _symbol: &str, _limit: usize) -> Result<Vec<Trade>, AdapterError> {
            Ok(Vec::new())
        }

        async fn fetch_funding_rate(&self, _symbol: &str) -> Result<Option<FundingRate>, AdapterError> {
            Ok(Some(FundingRate { rate: 0.0001, ts: 0 }))
        }

        async fn fetch_open_interest(&self, _symbol: &str) -> Result<Option<OpenInterest>, AdapterError> {
            Ok(Some(OpenInterest { value: 1_000_000.0, ts: 0 }))
        }

        fn state(&self) -> AdapterState {
            AdapterState { exchange: "fake".into(), state: CircuitState::Closed, fail_count: 0, cooldown_remaining_s: 0.0, threshold: 5 }
        }
    }

    fn config() -> Config {
        Config {
            exchange: "fake".into(),
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            scan_interval_sec: 30,
            scan_concurrency: 8,
            scan_top_by_qvol: 150,
            topn_default: 50,
            markets_cache_ttl_sec: 3600,
            adapter_timeout_sec: 5,
            adapter_max_failures: 5,
            adapter_cooldown_sec: 60,
            min_qvol_usdt: 1.0,
            max_spread_bps: 1000.0,
            notional_test: 10_000.0,
            include_carry: true,
            profile_default: "scalp".into(),
            manipulation_threshold: None,
            scan_sla_warn_multiplier: 1.5,
            scan_sla_critical_multiplier: 3.0,
            admin_api_token: "token".into(),
            webhook_url: None,
            pubsub_channel: None,
            bind_addr: "0.0.0.0:8090".into(),
        }
    }

    fn orchestrator(symbols: Vec<String>) -> Orchestrator {
        let config = config();
        Orchestrator::new(
            config.clone(),
            Arc::new(FakeAdapter { symbols }),
            Arc::new(Broadcast::new()),
            Arc::new(SignalBus::new(None, None)),
            Arc::new(ControlPlane::new(&config)),
            Arc::new(LoggingPersistence),
            Arc::new(LoggingCache),
        )
    }

    #[tokio::test]
    async fn run_cycle_produces_a_ranked_frame() {
        let orch = orchestrator(vec!["BTCUSDT".into(), "ETHUSDT".into()]);
        let report = orch.run_cycle("scalp").await.unwrap();
        assert_eq!(report.scanned, 2);
        assert!(report.ranked > 0);
        let frame = orch.broadcast.last_frame().expect("frame published");
        assert_eq!(frame.items.len(), report.ranked);
    }

    #[tokio::test]
    async fn empty_symbol_list_yields_an_empty_report_not_an_error() {
        let orch = orchestrator(vec![]);
        let report = orch.run_cycle("scalp").await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(report.ranked, 0);
    }

    #[tokio::test]
    async fn rank_delta_is_zero_on_first_cycle_and_tracks_previous_ranks() {
        let orch = orchestrator(vec!["BTCUSDT".into(), "ETHUSDT".into()]);
        orch.run_cycle("scalp").await.unwrap();
        let frame = orch.broadcast.last_frame().unwrap();
        for item in &frame.items {
            assert_eq!(item.rank_delta, Some(0));
        }
    }

    #[tokio::test]
    async fn unknown_profile_surfaces_as_an_error() {
        let orch = orchestrator(vec!["BTCUSDT".into()]);
        let err = orch.run_cycle("nonexistent").await.unwrap_err();
        assert!(err.to_string().contains("unknown scoring profile"));
    }

    #[tokio::test]
    async fn manipulation_threshold_exceeded_is_false_with_no_configured_threshold() {
        let orch = orchestrator(vec!["BTCUSDT".into()]);
        orch.run_cycle("scalp").await.unwrap();
        let frame = orch.broadcast.last_frame().unwrap();
        assert!(frame.items.iter().all(|item| !item.manipulation_threshold_exceeded));
    }

    #[tokio::test]
    async fn manipulation_threshold_exceeded_flags_every_item_once_threshold_is_zero() {
        let mut config = config();
        config.manipulation_threshold = Some(0.0);
        let orch = Orchestrator::new(
            config.clone(),
            Arc::new(FakeAdapter { symbols: vec!["BTCUSDT".into()] }),
            Arc::new(Broadcast::new()),
            Arc::new(SignalBus::new(None, None)),
            Arc::new(ControlPlane::new(&config)),
            Arc::new(LoggingPersistence),
            Arc::new(LoggingCache),
        );
        orch.run_cycle("scalp").await.unwrap();
        let frame = orch.broadcast.last_frame().unwrap();
        assert!(!frame.items.is_empty());
        assert!(frame.items.iter().all(|item| item.manipulation_threshold_exceeded));
    }
}
