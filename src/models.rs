//! Data model shared by the feature pipeline, scoring, broadcast and control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Sentinel score assigned to a snapshot rejected by the liquidity/spread gates.
pub const REJECT_SCORE: f64 = -1_000_000.0;

/// A single bid/ask level: `(price, amount)`.
pub type Level = (f64, f64);

/// Raw ticker payload as returned by a `MarketDataSource`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub quote_volume: Option<f64>,
    pub base_volume: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Exchange-specific fields not promoted to a typed column, e.g. `turnover`.
    pub provider_info: HashMap<String, f64>,
}

/// Order book snapshot: best-first bid/ask levels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trade {
    pub ts: i64,
    pub price: f64,
    pub amount: f64,
    pub side: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingRate {
    pub rate: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenInterest {
    pub value: f64,
    pub ts: i64,
}

/// Immutable, per-symbol, per-cycle record of features and score (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub exchange: String,
    pub ts: DateTime<Utc>,

    pub quote_volume_usdt: f64,
    pub top5_depth_usdt: f64,
    pub spread_bps: f64,
    pub slip_bps: f64,

    pub atr_pct: f64,
    pub ret_1: f64,
    pub ret_15: f64,
    pub price_velocity: f64,

    pub funding_8h_pct: Option<f64>,
    pub open_interest: Option<f64>,
    pub basis_bps: Option<f64>,

    pub volume_zscore: f64,
    pub order_flow_imbalance: f64,
    pub volatility_regime: f64,
    pub anomaly_score: f64,
    pub depth_to_volume_ratio: f64,

    pub liquidity_edge: f64,
    pub momentum_edge: f64,
    pub volatility_edge: f64,
    pub microstructure_edge: f64,
    pub anomaly_residual: f64,

    pub z_15s: f64,
    pub z_1m: f64,
    pub z_5m: f64,
    pub vwap_distance: f64,
    pub rsi14: f64,

    pub manip_score: Option<f64>,
    pub manip_flags: Vec<String>,

    pub score: f64,
}

impl Snapshot {
    /// True once the liquidity/spread gates have rejected this snapshot.
    pub fn is_rejected(&self) -> bool {
        self.score == REJECT_SCORE
    }
}

/// Per-symbol state owned exclusively by the manipulation detector (spec §3, §5).
#[derive(Debug, Clone, Default)]
pub struct ManipulationState {
    pub last_price: Option<f64>,
    pub last_open_interest: Option<f64>,
    pub last_timestamp: Option<i64>,
    pub last_imbalance: Option<f64>,
    pub last_volume_z: Option<f64>,
    pub last_velocity: Option<f64>,
}

/// Raw output of one `ManipulationDetector::detect` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManipulationResult {
    pub score: f64,
    pub flags: Vec<String>,
    pub features: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityBucket {
    Low,
    Medium,
    High,
}

/// View of a ranked snapshot enriched with rank bookkeeping (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedItem {
    pub symbol: String,
    pub rank: usize,
    pub rank_delta: Option<i64>,
    pub score: f64,
    pub score_components: BTreeMap<String, f64>,
    pub execution_metrics: BTreeMap<String, f64>,
    pub stale: bool,
    pub latency_ms: u64,
    pub manipulation_threshold_exceeded: bool,
    pub snapshot: Snapshot,
}

/// Immutable per-cycle broadcast payload (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingFrame {
    pub ts: DateTime<Utc>,
    pub profile: String,
    pub market_gauge: f64,
    pub volatility_bucket: VolatilityBucket,
    pub items: Vec<RankedItem>,
}

/// Result of one orchestrator cycle (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanCycleReport {
    pub duration_ms: u64,
    pub scanned: usize,
    pub ranked: usize,
    pub errors: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub adapter_state: AdapterState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
    Idle,
}

/// Snapshot of adapter/circuit-breaker health, exposed to `GET /health` (spec §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterState {
    pub exchange: String,
    pub state: CircuitState,
    pub fail_count: u32,
    pub cooldown_remaining_s: f64,
    pub threshold: u32,
}

/// A registered rule expression (spec §3, §4.8, §6.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    pub expression: String,
    /// Symbol this rule is scoped to, or `"*"` for every symbol.
    pub scope: String,
}

/// A signal emitted when a rule matches a ranked item (spec §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub rule_name: String,
    pub symbol: String,
    pub payload_json: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_sentinel_is_recognized() {
        let mut snap = sample_snapshot();
        snap.score = REJECT_SCORE;
        assert!(snap.is_rejected());
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            ts: Utc::now(),
            quote_volume_usdt: 0.0,
            top5_depth_usdt: 0.0,
            spread_bps: 0.0,
            slip_bps: 0.0,
            atr_pct: 0.0,
            ret_1: 0.0,
            ret_15: 0.0,
            price_velocity: 0.0,
            funding_8h_pct: None,
            open_interest: None,
            basis_bps: None,
            volume_zscore: 0.0,
            order_flow_imbalance: 0.0,
            volatility_regime: 0.0,
            anomaly_score: 0.0,
            depth_to_volume_ratio: 0.0,
            liquidity_edge: 0.0,
            momentum_edge: 0.0,
            volatility_edge: 0.0,
            microstructure_edge: 0.0,
            anomaly_residual: 0.0,
            z_15s: 0.0,
            z_1m: 0.0,
            z_5m: 0.0,
            vwap_distance: 0.0,
            rsi14: 0.0,
            manip_score: None,
            manip_flags: Vec::new(),
            score: 0.0,
        }
    }
}
