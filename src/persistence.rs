//! Persistence/cache collaborator shims (spec §1 non-goal: "Durable storage
//! backends... the core only calls `PersistRankings`, `PersistBar`,
//! `CacheRankings`, `CacheSnapshots`"). Real storage is a collaborator's
//! problem; this crate defines the boundary and logs what would have been
//! written, the way `signals/db_storage.rs` logs every write path it takes.

use crate::models::{RankedItem, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// One row of the collaborator's `bars_1m` table (spec §6.3), upserted by symbol+ts.
#[derive(Debug, Clone, Serialize)]
pub struct BarRecord {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub close: f64,
    pub atr_pct: f64,
    pub spread_bps: f64,
    pub depth_usdt: f64,
    pub mom_1m: f64,
    pub mom_15m: f64,
    pub funding_pct: Option<f64>,
    pub open_interest: Option<f64>,
    pub basis_bps: Option<f64>,
    pub manip_score: Option<f64>,
    pub manip_flags: Vec<String>,
}

impl BarRecord {
    pub fn from_snapshot(snap: &Snapshot) -> Self {
        Self {
            symbol: snap.symbol.clone(),
            ts: snap.ts,
            close: 0.0,
            atr_pct: snap.atr_pct,
            spread_bps: snap.spread_bps,
            depth_usdt: snap.top5_depth_usdt,
            mom_1m: snap.ret_1,
            mom_15m: snap.ret_15,
            funding_pct: snap.funding_8h_pct,
            open_interest: snap.open_interest,
            basis_bps: snap.basis_bps,
            manip_score: snap.manip_score,
            manip_flags: snap.manip_flags.clone(),
        }
    }
}

/// One row of the collaborator's `rankings` table (spec §6.3), upserted by
/// symbol+ts+profile.
#[derive(Debug, Clone, Serialize)]
pub struct RankingRecord {
    pub symbol: String,
    pub ts: DateTime<Utc>,
    pub profile: String,
    pub score: f64,
    pub manip_score: Option<f64>,
    pub manip_flags: Vec<String>,
    pub inputs_json: serde_json::Value,
}

impl RankingRecord {
    pub fn from_ranked_item(item: &RankedItem, profile: &str) -> Self {
        Self {
            symbol: item.symbol.clone(),
            ts: item.snapshot.ts,
            profile: profile.to_string(),
            score: item.score,
            manip_score: item.snapshot.manip_score,
            manip_flags: item.snapshot.manip_flags.clone(),
            inputs_json: serde_json::to_value(&item.score_components).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Persistence boundary the orchestrator writes through fire-and-forget
/// (spec §4.6 step 9, §7: persistence errors are logged, never fail a cycle).
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist_bar(&self, record: BarRecord) -> anyhow::Result<()>;
    async fn persist_rankings(&self, records: Vec<RankingRecord>) -> anyhow::Result<()>;
}

/// Cache boundary, read by the control/HTTP layer to serve "last good frame"
/// style responses without re-deriving them (spec §7 "Ranking endpoints
/// return the last good frame while a cycle is failing" is actually served
/// by `Broadcast::last_frame`; this cache shim exists for the collaborator's
/// own read-path optimizations, e.g. a Redis-backed dashboard).
#[async_trait]
pub trait CacheSink: Send + Sync {
    async fn cache_rankings(&self, profile: &str, items: &[RankedItem]) -> anyhow::Result<()>;
    async fn cache_snapshots(&self, snapshots: &[Snapshot]) -> anyhow::Result<()>;
}

/// Default collaborator shim: logs what would be persisted/cached and
/// returns `Ok(())`. A real deployment swaps this for a Postgres/Redis-backed
/// implementation without touching the orchestrator.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPersistence;

#[async_trait]
impl PersistenceSink for LoggingPersistence {
    async fn persist_bar(&self, record: BarRecord) -> anyhow::Result<()> {
        debug!(symbol = %record.symbol, ts = %record.ts, "persist_bar (no-op collaborator shim)");
        Ok(())
    }

    async fn persist_rankings(&self, records: Vec<RankingRecord>) -> anyhow::Result<()> {
        debug!(count = records.len(), "persist_rankings (no-op collaborator shim)");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCache;

#[async_trait]
impl CacheSink for LoggingCache {
    async fn cache_rankings(&self, profile: &str, items: &[RankedItem]) -> anyhow::Result<()> {
        debug!(profile, count = items.len(), "cache_rankings (no-op collaborator shim)");
        Ok(())
    }

    async fn cache_snapshots(&self, snapshots: &[Snapshot]) -> anyhow::Result<()> {
        debug!(count = snapshots.len(), "cache_snapshots (no-op collaborator shim)");
        Ok(())
    }
}

/// Logs a persistence failure the way every other collaborator error is
/// logged (spec §7: `PersistError` is structured, never propagated).
pub fn log_persist_failure(operation: &'static str, err: &anyhow::Error) {
    warn!(operation, error = %err, "persistence collaborator failed; continuing");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot() -> Snapshot {
        Snapshot {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            ts: Utc::now(),
            quote_volume_usdt: 1e8,
            top5_depth_usdt: 1e6,
            spread_bps: 2.0,
            slip_bps: 2.0,
            atr_pct: 1.0,
            ret_1: 0.1,
            ret_15: 0.2,
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
            score: 1.0,
        }
    }

    #[tokio::test]
    async fn logging_persistence_never_fails() {
        let sink = LoggingPersistence;
        let bar = BarRecord::from_snapshot(&snapshot());
        assert!(sink.persist_bar(bar).await.is_ok());
        assert!(sink.persist_rankings(Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn logging_cache_never_fails() {
        let cache = LoggingCache;
        assert!(cache.cache_rankings("scalp", &[]).await.is_ok());
        assert!(cache.cache_snapshots(&[snapshot()]).await.is_ok());
    }

    #[test]
    fn ranking_record_carries_score_components() {
        let item = RankedItem {
            symbol: "BTCUSDT".into(),
            rank: 1,
            rank_delta: None,
            score: 42.0,
            score_components: BTreeMap::from([("liquidity".to_string(), 1.0)]),
            execution_metrics: BTreeMap::new(),
            stale: false,
            latency_ms: 10,
            manipulation_threshold_exceeded: false,
            snapshot: snapshot(),
        };
        let record = RankingRecord::from_ranked_item(&item, "scalp");
        assert_eq!(record.score, 42.0);
        assert_eq!(record.profile, "scalp");
    }
}
