//! Stateful per-symbol manipulation detector (spec §4.2).
//!
//! One call per symbol per cycle is expected from the orchestrator, but
//! health-check probes may call `detect` out of band, so each symbol's state
//! is guarded by its own lock rather than relying on single-caller discipline.

use crate::metrics;
use crate::models::{Bar, ManipulationResult, ManipulationState, OrderBook};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

struct Severity {
    name: &'static str,
    points: f64,
}

const FLAG_SEVERITIES: &[Severity] = &[
    Severity { name: "spoofing_depth_imbalance", points: 25.0 },
    Severity { name: "liquidity_wall", points: 20.0 },
    Severity { name: "liquidity_vacuum", points: 15.0 },
    Severity { name: "scam_wick", points: 20.0 },
    Severity { name: "oi_price_divergence", points: 15.0 },
    Severity { name: "funding_price_divergence", points: 10.0 },
    Severity { name: "post_surge_reversal", points: 35.0 },
    Severity { name: "wash_trade_volume", points: 18.0 },
    Severity { name: "spoofing_reversal", points: 22.0 },
    Severity { name: "exhausted_spike", points: 16.0 },
];

fn severity_of(flag: &str) -> f64 {
    FLAG_SEVERITIES
        .iter()
        .find(|s| s.name == flag)
        .map(|s| s.points)
        .unwrap_or(10.0)
}

/// Input bundle for one `detect` call (spec §4.2 signature).
pub struct DetectInput<'a> {
    pub book: &'a OrderBook,
    pub bars: &'a [Bar],
    pub close: f64,
    pub atr_pct: f64,
    pub ret_1: f64,
    pub ret_15: f64,
    pub funding: Option<f64>,
    pub open_interest: Option<f64>,
    pub ts: i64,
    pub notional_test: f64,
}

fn order_notional(level: (f64, f64)) -> f64 {
    level.0 * level.1
}

fn top_depth(book: &OrderBook, depth: usize) -> (f64, f64, f64, f64) {
    let bid_total: f64 = book.bids.iter().take(depth).copied().map(order_notional).sum();
    let ask_total: f64 = book.asks.iter().take(depth).copied().map(order_notional).sum();
    let top_bid = book.bids.first().copied().map(order_notional).unwrap_or(0.0);
    let top_ask = book.asks.first().copied().map(order_notional).unwrap_or(0.0);
    (bid_total, ask_total, top_bid, top_ask)
}

fn wick_ratio(bars: &[Bar], atr_pct: f64) -> f64 {
    let Some(last) = bars.last() else {
        return 0.0;
    };
    if last.close <= 0.0 {
        return 0.0;
    }
    let candle_range_pct = (last.high - last.low).abs() / last.close * 100.0;
    let baseline = atr_pct.max(0.1);
    candle_range_pct / baseline
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Stateful detector: one `ManipulationState` entry per symbol, guarded by its
/// own lock (spec §5 — the per-symbol lock's critical section is CPU-bound only).
#[derive(Default)]
pub struct ManipulationDetector {
    state: RwLock<HashMap<String, Arc<Mutex<ManipulationState>>>>,
}

impl ManipulationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, symbol: &str) -> Arc<Mutex<ManipulationState>> {
        if let Some(entry) = self.state.read().get(symbol) {
            return entry.clone();
        }
        self.state
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ManipulationState::default())))
            .clone()
    }

    pub fn detect(&self, symbol: &str, input: DetectInput<'_>) -> ManipulationResult {
        let cell = self.state_for(symbol);
        let mut state = cell.lock();

        let (bid_total, ask_total, top_bid, top_ask) = top_depth(input.book, 5);
        let total_depth = bid_total + ask_total;
        let imbalance = if total_depth > 0.0 {
            (bid_total - ask_total) / total_depth
        } else {
            0.0
        };
        let wall_notional = top_bid.max(top_ask);
        let wall_ratio = if total_depth > 0.0 { wall_notional / total_depth } else { 0.0 };
        let vacuum_ratio = if input.notional_test > 0.0 {
            total_depth / (input.notional_test * 2.0)
        } else {
            0.0
        };
        let wick = wick_ratio(input.bars, input.atr_pct);

        let closes = metrics::closes_from_bars(input.bars);
        let volumes: Vec<f64> = input.bars.iter().map(|b| b.volume).collect();
        let volume_z = metrics::volume_zscore(&volumes, 60);
        let vol_regime = metrics::volatility_regime(&closes, 20, 60);
        let velocity = metrics::price_velocity(&closes, 5);
        let pump_dump = metrics::pump_dump_score(input.ret_15, input.ret_1, volume_z, vol_regime);

        let imb_delta = match state.last_imbalance {
            Some(prev) => imbalance - prev,
            None => 0.0,
        };
        let oi_delta = match (input.open_interest, state.last_open_interest) {
            (Some(oi), Some(prev_oi)) if prev_oi > 0.0 => (oi - prev_oi) / prev_oi,
            _ => 0.0,
        };

        let mut flags: Vec<&'static str> = Vec::new();
        if imbalance.abs() > 0.65 && wall_notional > input.notional_test * 1.5 {
            flags.push("spoofing_depth_imbalance");
        }
        if wall_ratio > 0.55 && wall_notional > input.notional_test {
            flags.push("liquidity_wall");
        }
        if total_depth < input.notional_test * 1.5 {
            flags.push("liquidity_vacuum");
        }
        if wick > 3.0 && input.atr_pct > 0.2 {
            flags.push("scam_wick");
        }
        if oi_delta > 0.05 && input.ret_15 < -0.8 {
            flags.push("oi_price_divergence");
        }
        if let Some(funding) = input.funding {
            if (funding > 0.0 && input.ret_1 < -0.25) || (funding < 0.0 && input.ret_1 > 0.25) {
                flags.push("funding_price_divergence");
            }
        }
        if pump_dump > 35.0 {
            flags.push("post_surge_reversal");
        }
        if volume_z.abs() > 4.0 && total_depth < input.notional_test * 1.2 {
            flags.push("wash_trade_volume");
        }
        if let Some(prev_imbalance) = state.last_imbalance {
            if prev_imbalance * imbalance < -0.3 && prev_imbalance.abs() > 0.5 {
                flags.push("spoofing_reversal");
            }
        }
        if let Some(prev_volume_z) = state.last_volume_z {
            if prev_volume_z > 2.5 && volume_z < 0.5 && input.ret_1.abs() > 0.4 {
                flags.push("exhausted_spike");
            }
        }

        let f1 = (imbalance.abs() - 0.2).max(0.0);
        let f2 = (wall_ratio - 0.3).max(0.0);
        let f3 = (wick.min(6.0) - 2.0).max(0.0);
        let f4 = (oi_delta - 0.03).max(0.0);
        let f5 = input.funding.map(|f| (f.abs() - 0.05).max(0.0)).unwrap_or(0.0);
        let f6 = (1.0 - vacuum_ratio).max(0.0);
        let f7 = (volume_z.abs() - 1.0).max(0.0);
        let f8 = (velocity.abs() / 3.0).max(0.0);
        let f9 = (pump_dump / 50.0).max(0.0);
        let f10 = (imb_delta.abs() - 0.4).max(0.0);
        let last_volume_z = state.last_volume_z.unwrap_or(0.0);
        let f11 = (last_volume_z - volume_z - 1.5).max(0.0);

        let linear = -2.5
            + 3.2 * f1
            + 2.1 * f2
            + 1.4 * f3
            + 1.8 * f4
            + 0.9 * f5
            + 1.2 * f6
            + 1.4 * f7
            + 1.1 * f8
            + 1.8 * f9
            + 1.3 * f10
            + 0.8 * f11;
        let score_ml = sigmoid(linear) * 100.0;

        let score_rule: f64 = flags.iter().map(|f| severity_of(f)).sum();
        let mut score = score_rule.max(score_ml).clamp(0.0, 100.0);

        let mut result_flags: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        result_flags.sort();
        result_flags.dedup();

        score = (score * 100.0).round() / 100.0;
        if result_flags.is_empty() && score <= 5.0 {
            score = 0.0;
        }

        let mut features = BTreeMap::new();
        features.insert("imbalance".to_string(), round4(imbalance));
        features.insert("wall_ratio".to_string(), round4(wall_ratio));
        features.insert("total_depth".to_string(), (total_depth * 100.0).round() / 100.0);
        features.insert("wick_ratio".to_string(), round4(wick));
        features.insert("oi_delta".to_string(), round4(oi_delta));
        features.insert("funding".to_string(), round4(input.funding.unwrap_or(0.0)));
        features.insert("volume_zscore".to_string(), round4(volume_z));
        features.insert("velocity".to_string(), round4(velocity));
        features.insert("pump_dump".to_string(), round4(pump_dump));

        *state = ManipulationState {
            last_price: Some(input.close),
            last_open_interest: input.open_interest,
            last_timestamp: Some(input.ts),
            last_imbalance: Some(imbalance),
            last_volume_z: Some(volume_z),
            last_velocity: Some(velocity),
        };

        ManipulationResult {
            score,
            flags: result_flags,
            features,
        }
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars() -> Vec<Bar> {
        (0..80)
            .map(|i| Bar {
                ts: i,
                open: 100.0,
                high: 100.6,
                low: 99.6,
                close: 100.0 + (i as f64 % 3.0) * 0.01,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn clean_book_stays_quiet() {
        let detector = ManipulationDetector::new();
        let book = OrderBook {
            bids: vec![(100.0, 50.0), (99.9, 45.0), (99.8, 40.0), (99.7, 35.0)],
            asks: vec![(100.1, 52.0), (100.2, 48.0), (100.3, 44.0), (100.4, 40.0)],
            timestamp: None,
        };
        let input = DetectInput {
            book: &book,
            bars: &bars(),
            close: 100.2,
            atr_pct: 0.6,
            ret_1: 0.05,
            ret_15: 0.1,
            funding: Some(0.0),
            open_interest: Some(900_000.0),
            ts: 1,
            notional_test: 10_000.0,
        };
        let result = detector.detect("BTCUSDT", input);
        assert!(result.flags.is_empty(), "unexpected flags: {:?}", result.flags);
        assert!(result.score <= 10.0, "score too high: {}", result.score);
    }

    #[test]
    fn spoof_stack_raises_flag() {
        let detector = ManipulationDetector::new();
        let book = OrderBook {
            bids: vec![(100.0, 500.0), (99.9, 200.0), (99.8, 150.0), (99.7, 100.0)],
            asks: vec![(100.1, 5.0), (100.2, 4.0), (100.3, 3.0), (100.4, 2.0)],
            timestamp: None,
        };
        let input = DetectInput {
            book: &book,
            bars: &bars(),
            close: 100.5,
            atr_pct: 0.5,
            ret_1: 0.1,
            ret_15: 0.2,
            funding: Some(0.01),
            open_interest: Some(1_000_000.0),
            ts: 1,
            notional_test: 10_000.0,
        };
        let result = detector.detect("BTCUSDT", input);
        assert!(result.flags.contains(&"spoofing_depth_imbalance".to_string()));
        assert!(result.score > 0.0);
    }

    #[test]
    fn flags_are_sorted_and_deduplicated() {
        let detector = ManipulationDetector::new();
        let book = OrderBook {
            bids: vec![(100.0, 500.0), (99.9, 200.0)],
            asks: vec![(100.1, 5.0)],
            timestamp: None,
        };
        let input = DetectInput {
            book: &book,
            bars: &bars(),
            close: 100.5,
            atr_pct: 0.5,
            ret_1: 0.1,
            ret_15: 0.2,
            funding: None,
            open_interest: None,
            ts: 1,
            notional_test: 10_000.0,
        };
        let result = detector.detect("ETHUSDT", input);
        let mut sorted = result.flags.clone();
        sorted.sort();
        assert_eq!(result.flags, sorted);
        let unique: std::collections::BTreeSet<_> = result.flags.iter().collect();
        assert_eq!(unique.len(), result.flags.len());
    }

    #[test]
    fn state_is_isolated_per_symbol() {
        let detector = ManipulationDetector::new();
        let book = OrderBook {
            bids: vec![(100.0, 50.0)],
            asks: vec![(100.1, 50.0)],
            timestamp: None,
        };
        let input_a = DetectInput {
            book: &book,
            bars: &bars(),
            close: 100.0,
            atr_pct: 0.5,
            ret_1: 0.0,
            ret_15: 0.0,
            funding: None,
            open_interest: Some(100.0),
            ts: 1,
            notional_test: 10_000.0,
        };
        detector.detect("AAAUSDT", input_a);
        let state_a = detector.state_for("AAAUSDT");
        assert_eq!(state_a.lock().last_open_interest, Some(100.0));
        assert!(detector.state.read().get("BBBUSDT").is_none());
    }
}
