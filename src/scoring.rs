//! Profile-weighted scoring (spec §4.4).
//!
//! Unlike the source this was distilled from, an unknown profile name is a
//! hard error rather than a silently absent weight map (spec §9 open question).

use crate::config::Config;
use crate::error::ConfigError;
use crate::models::{Snapshot, REJECT_SCORE};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
pub struct LiqWeights {
    pub qvol: f64,
    pub depth: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MomWeights {
    pub ret_15: f64,
    pub ret_1: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CostWeights {
    pub spread: f64,
    pub slip: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CarryWeights {
    pub funding: f64,
    pub basis: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct StructureWeights {
    pub volume_z: f64,
    pub ofi: f64,
    pub volatility: f64,
    pub velocity: f64,
    pub anomaly: f64,
    pub residual: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct EdgeWeights {
    pub liquidity: f64,
    pub momentum: f64,
    pub volatility: f64,
    pub micro: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileWeights {
    pub liq: LiqWeights,
    pub atr: f64,
    pub mom: MomWeights,
    pub cost: CostWeights,
    pub carry: CarryWeights,
    pub structure: StructureWeights,
    pub edges: EdgeWeights,
}

const MANIP_PENALTY_WEIGHT: f64 = 0.4;

fn preset(profile: &str) -> Option<ProfileWeights> {
    Some(match profile {
        "scalp" => ProfileWeights {
            liq: LiqWeights { qvol: 4.0, depth: 3.5 },
            atr: 1.2,
            mom: MomWeights { ret_15: 1.5, ret_1: 1.0 },
            cost: CostWeights { spread: 3.0, slip: 2.5 },
            carry: CarryWeights { funding: 0.5, basis: 0.3 },
            structure: StructureWeights {
                volume_z: 1.2,
                ofi: 3.5,
                volatility: 1.4,
                velocity: 0.8,
                anomaly: 0.7,
                residual: 1.2,
            },
            edges: EdgeWeights { liquidity: 1.6, momentum: 1.2, volatility: 0.9, micro: 1.5 },
        },
        "swing" => ProfileWeights {
            liq: LiqWeights { qvol: 2.5, depth: 2.5 },
            atr: 1.8,
            mom: MomWeights { ret_15: 2.2, ret_1: 0.8 },
            cost: CostWeights { spread: 2.0, slip: 1.5 },
            carry: CarryWeights { funding: 0.8, basis: 0.6 },
            structure: StructureWeights {
                volume_z: 1.0,
                ofi: 2.5,
                volatility: 1.6,
                velocity: 1.0,
                anomaly: 0.6,
                residual: 0.9,
            },
            edges: EdgeWeights { liquidity: 1.3, momentum: 1.6, volatility: 1.1, micro: 1.1 },
        },
        "news" => ProfileWeights {
            liq: LiqWeights { qvol: 3.0, depth: 2.0 },
            atr: 2.2,
            mom: MomWeights { ret_15: 2.8, ret_1: 1.5 },
            cost: CostWeights { spread: 2.2, slip: 1.8 },
            carry: CarryWeights { funding: 0.3, basis: 0.2 },
            structure: StructureWeights {
                volume_z: 1.5,
                ofi: 2.8,
                volatility: 1.2,
                velocity: 1.4,
                anomaly: 0.8,
                residual: 1.0,
            },
            edges: EdgeWeights { liquidity: 1.4, momentum: 1.8, volatility: 1.2, micro: 1.3 },
        },
        _ => return None,
    })
}

pub const KNOWN_PROFILES: &[&str] = &["scalp", "swing", "news"];

fn scale_log(value: f64, divisor: f64) -> f64 {
    (value.max(0.0) / divisor).ln_1p()
}

fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.clamp(low, high)
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub type Breakdown = BTreeMap<String, f64>;

/// Score one snapshot under `profile`. Returns `(score, breakdown)`; the
/// breakdown is empty when the snapshot is gated to `REJECT_SCORE`.
pub fn score(
    snapshot: &Snapshot,
    profile: &str,
    include_carry: Option<bool>,
    config: &Config,
) -> Result<(f64, Breakdown), ConfigError> {
    let weights = preset(profile).ok_or_else(|| {
        ConfigError::UnknownProfile(profile.to_string(), KNOWN_PROFILES.join(", "))
    })?;

    if snapshot.quote_volume_usdt < config.min_qvol_usdt || snapshot.spread_bps > config.max_spread_bps {
        return Ok((REJECT_SCORE, Breakdown::new()));
    }

    let liq = weights.liq.qvol * scale_log(snapshot.quote_volume_usdt, 1_000_000.0)
        + weights.liq.depth * scale_log(snapshot.top5_depth_usdt, 100_000.0);

    let vol_component = weights.atr * snapshot.atr_pct;
    let mom_component = weights.mom.ret_15 * snapshot.ret_15 + weights.mom.ret_1 * snapshot.ret_1;
    let cost_penalty = weights.cost.spread * snapshot.spread_bps + weights.cost.slip * snapshot.slip_bps;

    let carry_enabled = include_carry.unwrap_or(config.include_carry);
    let mut carry_component = 0.0;
    if carry_enabled {
        if let Some(funding) = snapshot.funding_8h_pct {
            carry_component += weights.carry.funding * (-funding);
        }
        if let Some(basis) = snapshot.basis_bps {
            carry_component += weights.carry.basis * (-basis / 100.0);
        }
    }

    let volume_component = weights.structure.volume_z * clamp(snapshot.volume_zscore, -2.5, 6.0);
    let velocity_component = weights.structure.velocity * clamp(snapshot.price_velocity, -5.0, 5.0);
    let structure_bonus = volume_component + velocity_component;

    let ofi_penalty = weights.structure.ofi * snapshot.order_flow_imbalance.abs();
    let volatility_penalty = weights.structure.volatility * snapshot.volatility_regime.abs();
    let anomaly_penalty = weights.structure.anomaly * (snapshot.anomaly_score / 10.0);
    let residual_penalty = weights.structure.residual * snapshot.anomaly_residual.max(0.0);
    let structure_penalty = ofi_penalty + volatility_penalty + anomaly_penalty + residual_penalty;

    let edges_component = weights.edges.liquidity * clamp(snapshot.liquidity_edge, -3.0, 3.0)
        + weights.edges.momentum * clamp(snapshot.momentum_edge, -3.0, 3.0)
        + weights.edges.volatility * clamp(snapshot.volatility_edge, -3.0, 3.0)
        + weights.edges.micro * clamp(snapshot.microstructure_edge, -3.0, 3.0);

    let mut raw = liq + vol_component + mom_component + carry_component + structure_bonus + edges_component
        - cost_penalty
        - structure_penalty;

    if let Some(manip_score) = snapshot.manip_score {
        raw -= manip_score * MANIP_PENALTY_WEIGHT;
    }

    let mut breakdown = Breakdown::new();
    breakdown.insert("liquidity".to_string(), round4(liq));
    breakdown.insert("volatility".to_string(), round4(vol_component));
    breakdown.insert("momentum".to_string(), round4(mom_component));
    breakdown.insert("carry".to_string(), round4(carry_component));
    breakdown.insert("structure_bonus".to_string(), round4(structure_bonus));
    breakdown.insert("edges".to_string(), round4(edges_component));
    breakdown.insert("cost_penalty".to_string(), round4(-cost_penalty));
    breakdown.insert("structure_penalty".to_string(), round4(-structure_penalty));
    if let Some(manip_score) = snapshot.manip_score {
        breakdown.insert("manip_penalty".to_string(), round4(-manip_score * MANIP_PENALTY_WEIGHT));
    }

    Ok((round4(raw), breakdown))
}

/// Score every snapshot, sort descending, keep the first `top` whose score is
/// not `REJECT_SCORE` (spec §4.4).
pub fn rank(
    snaps: &[Snapshot],
    top: usize,
    profile: &str,
    include_carry: Option<bool>,
    config: &Config,
) -> Result<Vec<(Snapshot, Breakdown)>, ConfigError> {
    let mut scored = Vec::with_capacity(snaps.len());
    for snap in snaps {
        let (snap_score, breakdown) = score(snap, profile, include_carry, config)?;
        let mut snap = snap.clone();
        snap.score = snap_score;
        scored.push((snap, breakdown));
    }
    scored.retain(|(snap, _)| !snap.is_rejected());
    scored.sort_by(|(a, _), (b, _)| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> Config {
        Config {
            exchange: "binance".into(),
            symbols: vec![],
            scan_interval_sec: 30,
            scan_concurrency: 8,
            scan_top_by_qvol: 150,
            topn_default: 50,
            markets_cache_ttl_sec: 3600,
            adapter_timeout_sec: 5,
            adapter_max_failures: 5,
            adapter_cooldown_sec: 60,
            min_qvol_usdt: 25_000_000.0,
            max_spread_bps: 15.0,
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

    fn snapshot(qvol: f64, spread: f64, depth: f64, atr: f64, ret_1: f64, ret_15: f64, slip: f64) -> Snapshot {
        Snapshot {
            symbol: "X".into(),
            exchange: "binance".into(),
            ts: Utc::now(),
            quote_volume_usdt: qvol,
            top5_depth_usdt: depth,
            spread_bps: spread,
            slip_bps: slip,
            atr_pct: atr,
            ret_1,
            ret_15,
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
    fn unknown_profile_is_an_error() {
        let config = config();
        let snap = snapshot(1e8, 2.0, 5e6, 1.0, 0.1, 0.2, 3.0);
        let result = score(&snap, "yolo", None, &config);
        assert!(matches!(result, Err(ConfigError::UnknownProfile(_, _))));
    }

    #[test]
    fn rejects_thin_liquidity() {
        let config = config();
        let snap = snapshot(1e6, 2.0, 5e6, 1.0, 0.1, 0.2, 3.0);
        let (score, _) = score(&snap, "scalp", None, &config).unwrap();
        assert_eq!(score, REJECT_SCORE);
    }

    #[test]
    fn richer_symbol_outranks_thinner_one() {
        let config = config();
        let rich = snapshot(2e8, 2.0, 5e6, 1.5, 0.5, 1.2, 3.0);
        let poor = snapshot(6e7, 8.0, 5e5, 1.0, 0.2, 0.5, 8.0);
        let (rich_score, _) = score(&rich, "scalp", None, &config).unwrap();
        let (poor_score, _) = score(&poor, "scalp", None, &config).unwrap();
        assert!(rich_score > poor_score);
        assert_ne!(rich_score, REJECT_SCORE);
        assert_ne!(poor_score, REJECT_SCORE);
    }

    #[test]
    fn rank_drops_rejected_snapshots() {
        let config = config();
        let good = snapshot(2e8, 2.0, 5e6, 1.5, 0.5, 1.2, 3.0);
        let bad = snapshot(1e6, 2.0, 5e6, 1.0, 0.1, 0.2, 3.0);
        let ranked = rank(&[good, bad], 10, "scalp", None, &config).unwrap();
        assert_eq!(ranked.len(), 1);
    }
}
