//! Pure numeric transforms from raw exchange payloads to floats (spec §4.1).
//!
//! Error policy: every function returns a numeric default instead of failing —
//! 0 for additive features, 50 for RSI, 10000 bps for undefined spread/slip.

use crate::models::{Bar, OrderBook, Ticker};

const SPREAD_SENTINEL_BPS: f64 = 10_000.0;

pub fn quote_volume_usdt(ticker: &Ticker) -> f64 {
    if let Some(v) = ticker.quote_volume.filter(|v| *v > 0.0) {
        return v;
    }
    if let (Some(base), Some(last)) = (ticker.base_volume, ticker.last) {
        if base > 0.0 && last > 0.0 {
            return base * last;
        }
    }
    for key in ["quoteVolume", "quote_volume", "turnover"] {
        if let Some(v) = ticker.provider_info.get(key).copied().filter(|v| *v > 0.0) {
            return v;
        }
    }
    0.0
}

pub fn spread_bps(bid: Option<f64>, ask: Option<f64>) -> f64 {
    let (bid, ask) = (bid.unwrap_or(0.0), ask.unwrap_or(0.0));
    if bid <= 0.0 || ask <= 0.0 || ask <= bid {
        return SPREAD_SENTINEL_BPS;
    }
    let mid = (bid + ask) / 2.0;
    ((ask - bid) / mid).abs() * 1e4
}

pub fn top5_depth_usdt(book: &OrderBook) -> f64 {
    let bid_notional: f64 = book.bids.iter().take(5).map(|(p, a)| p * a).sum();
    let ask_notional: f64 = book.asks.iter().take(5).map(|(p, a)| p * a).sum();
    bid_notional + ask_notional
}

pub fn atr_pct(bars: &[Bar], period: usize) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    let mut prev_close = bars[0].close;
    let mut trs = Vec::with_capacity(bars.len());
    for bar in bars {
        let range_hl = bar.high - bar.low;
        let range_hc = (bar.high - prev_close).abs();
        let range_lc = (bar.low - prev_close).abs();
        trs.push(range_hl.max(range_hc).max(range_lc));
        prev_close = bar.close;
    }
    let window = &trs[trs.len().saturating_sub(period)..];
    if window.is_empty() {
        return 0.0;
    }
    let atr = window.iter().sum::<f64>() / window.len() as f64;
    let last_close = bars.last().unwrap().close;
    if last_close <= 0.0 {
        return 0.0;
    }
    (atr / last_close) * 100.0
}

pub struct Returns {
    pub ret_1: f64,
    pub ret_15: f64,
}

pub fn returns(closes: &[f64], lookback: usize) -> Returns {
    let closes: Vec<f64> = closes.iter().copied().filter(|c| *c > 0.0).collect();
    if closes.len() < 2 {
        return Returns { ret_1: 0.0, ret_15: 0.0 };
    }
    let last = closes[closes.len() - 1];
    let prev = closes[closes.len() - 2];
    let ret_1 = if prev != 0.0 { (last / prev - 1.0) * 100.0 } else { 0.0 };
    let ret_15 = if closes.len() > lookback {
        let base = closes[closes.len() - lookback - 1];
        if base != 0.0 { (last / base - 1.0) * 100.0 } else { 0.0 }
    } else {
        ret_1
    };
    Returns { ret_1, ret_15 }
}

fn walk_levels(levels: &[(f64, f64)], notional: f64) -> (f64, f64) {
    let mut remaining = notional;
    let mut filled_quote = 0.0;
    let mut filled_base = 0.0;
    for &(price, amount) in levels {
        if price <= 0.0 || amount <= 0.0 {
            continue;
        }
        let level_quote = price * amount;
        let take_quote = level_quote.min(remaining);
        if take_quote <= 0.0 {
            continue;
        }
        filled_quote += take_quote;
        filled_base += take_quote / price;
        remaining -= take_quote;
        if remaining <= 1e-6 {
            break;
        }
    }
    (filled_quote, filled_base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
    Both,
}

pub fn estimate_slippage_bps(book: &OrderBook, notional: f64, side: Side) -> f64 {
    let best_bid = book.bids.first().map(|(p, _)| *p);
    let best_ask = book.asks.first().map(|(p, _)| *p);
    let (Some(best_bid), Some(best_ask)) = (best_bid, best_ask) else {
        return SPREAD_SENTINEL_BPS;
    };
    if notional <= 0.0 {
        return SPREAD_SENTINEL_BPS;
    }
    let mid = (best_bid + best_ask) / 2.0;
    if mid <= 0.0 {
        return SPREAD_SENTINEL_BPS;
    }

    let slip = |levels: &[(f64, f64)], is_buy: bool| -> f64 {
        let (filled_quote, filled_base) = walk_levels(levels, notional);
        if filled_quote < notional * 0.999 || filled_base <= 0.0 {
            return SPREAD_SENTINEL_BPS;
        }
        let avg_price = filled_quote / filled_base;
        if avg_price <= 0.0 {
            return SPREAD_SENTINEL_BPS;
        }
        let diff = if is_buy { avg_price - mid } else { mid - avg_price };
        (diff / mid).abs() * 1e4
    };

    match side {
        Side::Buy => slip(&book.asks, true),
        Side::Sell => slip(&book.bids, false),
        Side::Both => slip(&book.asks, true).max(slip(&book.bids, false)),
    }
}

pub fn order_flow_imbalance(book: &OrderBook, depth: usize) -> f64 {
    let bid_notional: f64 = book.bids.iter().take(depth).map(|(p, a)| p * a).sum();
    let ask_notional: f64 = book.asks.iter().take(depth).map(|(p, a)| p * a).sum();
    let total = bid_notional + ask_notional;
    if total <= 0.0 {
        return 0.0;
    }
    (bid_notional - ask_notional) / total
}

fn population_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

pub fn volume_zscore(volumes: &[f64], lookback: usize) -> f64 {
    if lookback <= 1 {
        return 0.0;
    }
    let positive: Vec<f64> = volumes.iter().copied().filter(|v| *v > 0.0).collect();
    if positive.len() < 10 {
        return 0.0;
    }
    let window = &positive[positive.len().saturating_sub(lookback)..];
    if window.len() < 2 {
        return 0.0;
    }
    let sigma = population_stdev(window);
    if sigma <= 1e-6 {
        return 0.0;
    }
    let center = median(window);
    let z = (window[window.len() - 1] - center) / sigma;
    z.clamp(-10.0, 10.0)
}

pub fn volatility_regime(closes: &[f64], short_window: usize, long_window: usize) -> f64 {
    let prices: Vec<f64> = closes.iter().copied().filter(|c| *c > 0.0).collect();
    if prices.len() <= long_window {
        return 0.0;
    }
    let log_returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if log_returns.len() < long_window || long_window <= 1 {
        return 0.0;
    }
    let short_sigma = population_stdev(&log_returns[log_returns.len() - short_window..]);
    let long_sigma = population_stdev(&log_returns[log_returns.len() - long_window..]);
    if long_sigma <= 1e-9 {
        return 0.0;
    }
    (short_sigma / long_sigma - 1.0).clamp(-1.0, 5.0)
}

pub fn price_velocity(closes: &[f64], window: usize) -> f64 {
    let prices: Vec<f64> = closes.iter().copied().filter(|c| *c > 0.0).collect();
    if prices.len() <= window {
        return 0.0;
    }
    let start = prices[prices.len() - window - 1];
    let end = prices[prices.len() - 1];
    if start <= 0.0 {
        return 0.0;
    }
    (((end / start) - 1.0) * (100.0 / window as f64)).clamp(-10.0, 10.0)
}

pub fn pump_dump_score(ret_15: f64, ret_1: f64, volume_z: f64, vol_regime: f64) -> f64 {
    let surge = ret_15.max(0.0);
    let reversal = (-ret_1).max(0.0);
    let volume_component = (volume_z.abs() - 1.5).max(0.0);
    let volatility_component = vol_regime.max(0.0);
    let raw = surge * 1.2 + reversal * 1.6 + volume_component * 6.0 + volatility_component * 8.0;
    raw.clamp(0.0, 100.0)
}

pub fn vwap_distance(bars: &[Bar], fallback_close: f64) -> f64 {
    let mut cumulative_price = 0.0;
    let mut cumulative_volume = 0.0;
    for bar in bars {
        cumulative_price += bar.close * bar.volume;
        cumulative_volume += bar.volume;
    }
    if cumulative_volume <= 0.0 {
        return 0.0;
    }
    let vwap = cumulative_price / cumulative_volume;
    if vwap <= 0.0 {
        return 0.0;
    }
    ((fallback_close / vwap) - 1.0) * 100.0
}

pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() <= period {
        return 50.0;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in closes[closes.len() - period - 1..].windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses += -delta;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

pub fn funding_8h_pct(raw_rate: Option<f64>) -> Option<f64> {
    let rate = raw_rate.unwrap_or(0.0);
    if rate == 0.0 {
        return None;
    }
    Some(rate * 100.0)
}

pub fn basis_bps(perp: Option<f64>, spot: Option<f64>) -> Option<f64> {
    let perp = perp.unwrap_or(0.0);
    let spot = spot.unwrap_or(0.0);
    if perp <= 0.0 || spot <= 0.0 {
        return None;
    }
    Some((perp / spot - 1.0) * 1e4)
}

pub fn closes_from_bars(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

fn timeframe_zscore(closes: &[f64], window: usize) -> f64 {
    if closes.len() < window {
        return 0.0;
    }
    let segment = &closes[closes.len() - window..];
    let sigma = population_stdev(segment);
    if sigma <= 1e-9 {
        return 0.0;
    }
    let mean = segment.iter().sum::<f64>() / segment.len() as f64;
    (segment[segment.len() - 1] - mean) / sigma
}

pub struct TimeframeZscores {
    pub z_15s: f64,
    pub z_1m: f64,
    pub z_5m: f64,
}

/// Multi-window z-scores over the close series. `z_15s` falls back to
/// `price_velocity / 3.0` when the 4-bar window has no dispersion yet.
pub fn timeframe_zscores(closes: &[f64], price_velocity: f64) -> TimeframeZscores {
    let mut z_15s = timeframe_zscore(closes, 4);
    if z_15s == 0.0 {
        z_15s = price_velocity / 3.0;
    }
    TimeframeZscores {
        z_15s,
        z_1m: timeframe_zscore(closes, 20),
        z_5m: timeframe_zscore(closes, 60),
    }
}

/// Rough queue-position estimate for a resting order sized at `notional`,
/// based on top-of-book bid depth alone.
pub fn queue_position_estimate(book: &OrderBook, notional: f64) -> f64 {
    let Some(&(best_price, best_amount)) = book.bids.first() else {
        return 0.0;
    };
    let depth_notional = best_price * best_amount;
    if depth_notional <= 0.0 {
        return 0.0;
    }
    (notional / depth_notional).min(1.0)
}

/// Expected market-buy impact in bps for `notional`, reusing the same
/// level-walking slippage estimate used for the scoring pipeline.
pub fn simulated_impact(book: &OrderBook, notional: f64) -> f64 {
    if notional <= 0.0 {
        return 0.0;
    }
    estimate_slippage_bps(book, notional, Side::Buy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_bps_sentinel_on_crossed_book() {
        assert_eq!(spread_bps(Some(100.1), Some(100.0)), SPREAD_SENTINEL_BPS);
        assert_eq!(spread_bps(None, Some(100.0)), SPREAD_SENTINEL_BPS);
    }

    #[test]
    fn spread_bps_basic() {
        let bps = spread_bps(Some(100.0), Some(100.1));
        assert!((bps - 9.99).abs() < 0.5);
    }

    #[test]
    fn returns_falls_back_to_ret_1_for_short_series() {
        let r = returns(&[100.0, 101.0], 15);
        assert_eq!(r.ret_1, r.ret_15);
    }

    #[test]
    fn rsi_defaults_to_50_without_enough_data() {
        assert_eq!(rsi(&[1.0, 2.0], 14), 50.0);
    }

    #[test]
    fn volume_zscore_zero_with_sparse_history() {
        assert_eq!(volume_zscore(&[1.0, 2.0, 3.0], 60), 0.0);
    }

    #[test]
    fn pump_dump_clips_to_100() {
        assert_eq!(pump_dump_score(1000.0, -1000.0, 50.0, 50.0), 100.0);
    }

    #[test]
    fn basis_bps_none_on_non_positive_inputs() {
        assert_eq!(basis_bps(Some(0.0), Some(100.0)), None);
        assert!(basis_bps(Some(101.0), Some(100.0)).is_some());
    }
}
