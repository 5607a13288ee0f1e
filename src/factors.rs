//! Cross-sectional peer z-scores, computed once per cycle over the current
//! symbol universe (spec §4.3). Not to be confused with the manipulation
//! detector's time-series state — this is purely a same-cycle peer comparison.

use crate::models::Snapshot;

fn zscore(values: &[f64]) -> Vec<f64> {
    if values.len() < 2 {
        return vec![0.0; values.len()];
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let sigma = variance.sqrt();
    if sigma <= 1e-9 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - mean) / sigma).collect()
}

fn liquidity_inputs(snaps: &[Snapshot]) -> Vec<f64> {
    snaps
        .iter()
        .map(|s| {
            let depth = s.top5_depth_usdt.max(0.0).ln_1p();
            let volume = s.quote_volume_usdt.max(0.0).ln_1p();
            let resilience = (s.depth_to_volume_ratio.max(0.0) + 1.0).ln_1p();
            let spread = s.spread_bps.max(0.01).ln_1p();
            let slip = s.slip_bps.max(0.01).ln_1p();
            depth + volume + resilience - spread - slip
        })
        .collect()
}

fn momentum_inputs(snaps: &[Snapshot]) -> Vec<f64> {
    snaps.iter().map(|s| s.ret_15 * 0.7 + s.ret_1 * 0.3).collect()
}

fn volatility_inputs(snaps: &[Snapshot]) -> Vec<f64> {
    snaps
        .iter()
        .map(|s| s.atr_pct.max(0.0) * (1.0 + s.volatility_regime).max(0.0))
        .collect()
}

fn microstructure_penalties(snaps: &[Snapshot]) -> Vec<f64> {
    snaps
        .iter()
        .map(|s| {
            s.order_flow_imbalance.abs() * 40.0
                + s.anomaly_score.max(0.0)
                + s.price_velocity.abs() * 2.0
                + s.volume_zscore.max(0.0) * 5.0
                + s.manip_score.unwrap_or(0.0)
        })
        .collect()
}

fn anomaly_residuals(snaps: &[Snapshot]) -> Vec<f64> {
    snaps
        .iter()
        .map(|s| s.anomaly_score.max(0.0) + s.manip_score.unwrap_or(0.0))
        .collect()
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Rewrites `liquidity_edge`, `momentum_edge`, `volatility_edge`,
/// `microstructure_edge` and `anomaly_residual` in place. No-op below 3
/// snapshots (spec §4.3: "given ≥3 snapshots").
pub fn enrich_cross_sectional(snaps: &mut [Snapshot]) {
    if snaps.len() < 3 {
        return;
    }

    let liquidity = zscore(&liquidity_inputs(snaps));
    let momentum = zscore(&momentum_inputs(snaps));
    let volatility = zscore(&volatility_inputs(snaps));
    let micro_penalty = zscore(&microstructure_penalties(snaps));
    let anomaly = zscore(&anomaly_residuals(snaps));

    for (i, snap) in snaps.iter_mut().enumerate() {
        snap.liquidity_edge = round4(liquidity[i]);
        snap.momentum_edge = round4(momentum[i]);
        snap.volatility_edge = round4(volatility[i]);
        // Inverted: the penalty is higher for unhealthy microstructure, so the
        // edge (higher = healthier) is its negation.
        snap.microstructure_edge = round4(-micro_penalty[i]);
        snap.anomaly_residual = round4(anomaly[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn blank_snapshot(symbol: &str) -> Snapshot {
        Snapshot {
            symbol: symbol.to_string(),
            exchange: "binance".into(),
            ts: Utc::now(),
            quote_volume_usdt: 1e7,
            top5_depth_usdt: 1e5,
            spread_bps: 5.0,
            slip_bps: 5.0,
            atr_pct: 1.0,
            ret_1: 0.1,
            ret_15: 0.5,
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

    #[test]
    fn below_three_snapshots_is_a_no_op() {
        let mut snaps = vec![blank_snapshot("A"), blank_snapshot("B")];
        enrich_cross_sectional(&mut snaps);
        assert_eq!(snaps[0].liquidity_edge, 0.0);
    }

    #[test]
    fn identical_inputs_yield_zero_edges() {
        let mut snaps = vec![blank_snapshot("A"), blank_snapshot("B"), blank_snapshot("C")];
        enrich_cross_sectional(&mut snaps);
        for snap in &snaps {
            assert_eq!(snap.liquidity_edge, 0.0);
            assert_eq!(snap.momentum_edge, 0.0);
            assert_eq!(snap.microstructure_edge, 0.0);
        }
    }

    #[test]
    fn deeper_book_gets_a_higher_liquidity_edge() {
        let mut a = blank_snapshot("A");
        a.top5_depth_usdt = 5e6;
        let mut b = blank_snapshot("B");
        b.top5_depth_usdt = 1e5;
        let c = blank_snapshot("C");
        let mut snaps = vec![a, b, c];
        enrich_cross_sectional(&mut snaps);
        assert!(snaps[0].liquidity_edge > snaps[1].liquidity_edge);
    }
}
