//! Signal bus: compiles registered rules, matches them against ranked items,
//! and delivers matches best-effort to a pub/sub topic and a webhook (spec
//! §4.8). Delivery shape is grounded in `signals/detector.rs`'s best-effort,
//! log-and-continue style, generalized from Polymarket-specific signal types
//! to the compiled-rule-match payload this crate needs.

use super::ast::Expr;
use super::eval::{eval, Bindings};
use super::parser::parse;
use crate::error::RuleCompileError;
use crate::models::{RankedItem, RuleDefinition, Signal};
use chrono::Utc;
use parking_lot::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct CompiledRule {
    name: String,
    scope: String,
    expr: Expr,
}

fn bindings_for(item: &RankedItem) -> Bindings {
    Bindings {
        rank: item.rank as f64,
        score: item.score,
        liquidity_edge: item.snapshot.liquidity_edge,
        momentum_edge: item.snapshot.momentum_edge,
        volatility_edge: item.snapshot.volatility_edge,
        microstructure_edge: item.snapshot.microstructure_edge,
        anomaly_residual: item.snapshot.anomaly_residual,
        manipulation_score: item.snapshot.manip_score.unwrap_or(0.0),
    }
}

/// Registered, compiled rules plus the best-effort delivery queue. One
/// instance lives in `AppState`; `spawn_publisher` must be called once at
/// startup to drain the queue.
pub struct SignalBus {
    rules: RwLock<Vec<CompiledRule>>,
    tx: mpsc::UnboundedSender<Signal>,
    rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    webhook_url: Option<String>,
    pubsub_channel: Option<String>,
    http: reqwest::Client,
}

impl SignalBus {
    pub fn new(webhook_url: Option<String>, pubsub_channel: Option<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rules: RwLock::new(Vec::new()),
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            webhook_url,
            pubsub_channel,
            http: reqwest::Client::new(),
        }
    }

    /// Compiles and registers a rule. A compile failure disables the rule at
    /// load time with a warning; it never surfaces at evaluation time (spec §4.8).
    pub fn register_rule(&self, def: &RuleDefinition) -> Result<(), RuleCompileError> {
        match parse(&def.expression) {
            Ok(expr) => {
                self.rules.write().push(CompiledRule { name: def.name.clone(), scope: def.scope.clone(), expr });
                Ok(())
            }
            Err(err) => {
                warn!(rule = %def.name, error = %err, "rule failed to compile; disabled");
                Err(err)
            }
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Evaluates every in-scope rule against `item`; enqueues a `Signal` for
    /// each match. Never blocks the orchestrator (unbounded queue).
    pub fn publish_if_matched(&self, item: &RankedItem) {
        let bindings = bindings_for(item);
        let rules = self.rules.read();
        for rule in rules.iter() {
            if rule.scope != "*" && rule.scope != item.symbol {
                continue;
            }
            if eval(&rule.expr, &bindings).is_truthy() {
                let signal = Signal {
                    rule_name: rule.name.clone(),
                    symbol: item.symbol.clone(),
                    payload_json: serde_json::json!({
                        "rank": item.rank,
                        "score": item.score,
                        "manipulation_score": item.snapshot.manip_score,
                    }),
                    emitted_at: Utc::now(),
                };
                if self.tx.send(signal).is_err() {
                    warn!(rule = %rule.name, "signal queue closed, dropping match");
                }
            }
        }
    }

    /// Spawns the single long-running publisher worker (spec §4.8). Must be
    /// called exactly once; subsequent calls are a no-op.
    pub fn spawn_publisher(self: &std::sync::Arc<Self>) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let bus = self.clone();
        tokio::spawn(bus.run_publisher(rx));
    }

    async fn run_publisher(self: std::sync::Arc<Self>, mut rx: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = rx.recv().await {
            self.deliver_pubsub(&signal).await;
            self.deliver_webhook(&signal).await;
        }
    }

    async fn deliver_pubsub(&self, signal: &Signal) {
        let Some(channel) = &self.pubsub_channel else {
            return;
        };
        info!(channel, rule = %signal.rule_name, symbol = %signal.symbol, "publishing signal to pub/sub (collaborator shim)");
    }

    async fn deliver_webhook(&self, signal: &Signal) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let body = serde_json::json!({
            "rule": signal.rule_name,
            "symbol": signal.symbol,
            "payload": signal.payload_json,
        });
        let result = self.http.post(url).json(&body).timeout(Duration::from_secs(5)).send().await;
        if let Err(err) = result {
            warn!(url, rule = %signal.rule_name, error = %err, "webhook delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Snapshot;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn ranked_item(rank: usize, score: f64) -> RankedItem {
        RankedItem {
            symbol: "BTCUSDT".into(),
            rank,
            rank_delta: None,
            score,
            score_components: BTreeMap::new(),
            execution_metrics: BTreeMap::new(),
            stale: false,
            latency_ms: 5,
            manipulation_threshold_exceeded: false,
            snapshot: Snapshot {
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
                manip_score: Some(10.0),
                manip_flags: Vec::new(),
                score,
            },
        }
    }

    #[test]
    fn bad_expression_is_disabled_not_fatal() {
        let bus = SignalBus::new(None, None);
        let def = RuleDefinition { name: "bad".into(), expression: "score(".into(), scope: "*".into() };
        assert!(bus.register_rule(&def).is_err());
        assert_eq!(bus.rule_count(), 0);
    }

    #[test]
    fn matching_rule_enqueues_a_signal() {
        let bus = SignalBus::new(None, None);
        let def = RuleDefinition { name: "high_score".into(), expression: "score > 50".into(), scope: "*".into() };
        bus.register_rule(&def).unwrap();
        bus.publish_if_matched(&ranked_item(1, 75.0));
        // Draining the unbounded receiver directly verifies the enqueue
        // without spinning up the publisher task.
        let mut rx = bus.rx.lock().take().unwrap();
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.rule_name, "high_score");
    }

    #[test]
    fn out_of_scope_rule_does_not_match() {
        let bus = SignalBus::new(None, None);
        let def = RuleDefinition { name: "eth_only".into(), expression: "score > 0".into(), scope: "ETHUSDT".into() };
        bus.register_rule(&def).unwrap();
        bus.publish_if_matched(&ranked_item(1, 75.0));
        let mut rx = bus.rx.lock().take().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
