//! Concrete `MarketDataSource` over Binance USDT-M perpetual futures REST
//! endpoints. Retries, timeout, concurrency and circuit-breaker policy all
//! live here so the orchestrator never talks HTTP directly (spec §4.5).

use super::circuit::CircuitBreaker;
use super::{MarketDataSource, MarketInfo};
use crate::error::AdapterError;
use crate::models::{AdapterState, Bar, FundingRate, OpenInterest, OrderBook, Ticker, Trade};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const BASE_URL: &str = "https://fapi.binance.com";
const RETRY_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 4_000;

pub struct BinanceAdapter {
    client: reqwest::Client,
    base_url: String,
    semaphore: Arc<Semaphore>,
    breaker: CircuitBreaker,
    timeout: Duration,
    markets_cache_ttl: Duration,
    markets_cache: RwLock<Option<(Instant, HashMap<String, MarketInfo>)>>,
}

impl BinanceAdapter {
    pub fn new(timeout_sec: u64, scan_concurrency: usize, max_failures: u32, cooldown_sec: u64, markets_cache_ttl_sec: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
            semaphore: Arc::new(Semaphore::new(scan_concurrency.max(1))),
            breaker: CircuitBreaker::new("binance", max_failures, cooldown_sec),
            timeout: Duration::from_secs(timeout_sec),
            markets_cache_ttl: Duration::from_secs(markets_cache_ttl_sec),
            markets_cache: RwLock::new(None),
        }
    }

    async fn call<F, Fut, T>(&self, method: &'static str, symbol: &str, f: F) -> Result<T, AdapterError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        if self.breaker.check().is_err() {
            return Err(AdapterError::CircuitOpen {
                exchange: "binance".to_string(),
                symbol_or_op: symbol.to_string(),
            });
        }

        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..RETRY_ATTEMPTS {
            match tokio::time::timeout(self.timeout, f()).await {
                Ok(Ok(value)) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    debug!(exchange = "binance", %method, symbol, attempt, error = %err, "request failed");
                    last_err = Some(err);
                }
                Err(_) => {
                    last_err = Some(anyhow::anyhow!("request timed out after {}s", self.timeout.as_secs()));
                }
            }
            if attempt + 1 < RETRY_ATTEMPTS {
                let backoff_ms = (BACKOFF_BASE_MS * 2u64.pow(attempt)).min(BACKOFF_CAP_MS);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        self.breaker.record_failure();
        Err(AdapterError::Transient {
            exchange: "binance".to_string(),
            method,
            symbol: symbol.to_string(),
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("exhausted retries")),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct RawExchangeInfo {
    symbols: Vec<RawSymbol>,
}

#[derive(Deserialize)]
struct RawSymbol {
    symbol: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    status: String,
    #[serde(default)]
    #[serde(rename = "contractType")]
    contract_type: Option<String>,
}

#[derive(Deserialize)]
struct RawTicker {
    #[serde(rename = "lastPrice")]
    last_price: Option<String>,
    #[serde(rename = "highPrice")]
    high_price: Option<String>,
    #[serde(rename = "lowPrice")]
    low_price: Option<String>,
    #[serde(rename = "quoteVolume")]
    quote_volume: Option<String>,
    volume: Option<String>,
}

#[derive(Deserialize)]
struct RawBookTicker {
    #[serde(rename = "bidPrice")]
    bid_price: String,
    #[serde(rename = "askPrice")]
    ask_price: String,
}

#[derive(Deserialize)]
struct RawDepth {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Deserialize)]
struct RawTrade {
    time: i64,
    price: String,
    qty: String,
    #[serde(rename = "isBuyerMaker")]
    is_buyer_maker: bool,
}

#[derive(Deserialize)]
struct RawPremiumIndex {
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
    time: i64,
}

#[derive(Deserialize)]
struct RawOpenInterest {
    #[serde(rename = "openInterest")]
    open_interest: String,
    time: i64,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

#[async_trait]
impl MarketDataSource for BinanceAdapter {
    async fn load_markets(&self) -> Result<HashMap<String, MarketInfo>, AdapterError> {
        if let Some((fetched_at, markets)) = self.markets_cache.read().as_ref() {
            if fetched_at.elapsed() < self.markets_cache_ttl {
                return Ok(markets.clone());
            }
        }

        let url = self.url("/fapi/v1/exchangeInfo");
        let client = self.client.clone();
        let markets = self
            .call("load_markets", "*", move || {
                let client = client.clone();
                let url = url.clone();
                async move {
                    let info: RawExchangeInfo = client.get(&url).send().await?.error_for_status()?.json().await?;
                    let markets = info
                        .symbols
                        .into_iter()
                        .filter(|s| s.status == "TRADING" && s.contract_type.as_deref() == Some("PERPETUAL") && s.quote_asset == "USDT")
                        .map(|s| {
                            (
                                s.symbol.clone(),
                                MarketInfo { symbol: s.symbol, base: s.base_asset, quote: s.quote_asset, active: true },
                            )
                        })
                        .collect::<HashMap<_, _>>();
                    Ok(markets)
                }
            })
            .await?;

        *self.markets_cache.write() = Some((Instant::now(), markets.clone()));
        Ok(markets)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError> {
        let client = self.client.clone();
        let ticker_url = self.url(&format!("/fapi/v1/ticker/24hr?symbol={symbol}"));
        let book_url = self.url(&format!("/fapi/v1/ticker/bookTicker?symbol={symbol}"));
        self.call("fetch_ticker", symbol, move || {
            let client = client.clone();
            let (ticker_url, book_url) = (ticker_url.clone(), book_url.clone());
            async move {
                let raw: RawTicker = client.get(&ticker_url).send().await?.error_for_status()?.json().await?;
                let book: RawBookTicker = client.get(&book_url).send().await?.error_for_status()?.json().await?;
                Ok(Ticker {
                    bid: Some(parse_f64(&book.bid_price)),
                    ask: Some(parse_f64(&book.ask_price)),
                    last: raw.last_price.as_deref().map(parse_f64),
                    high: raw.high_price.as_deref().map(parse_f64),
                    low: raw.low_price.as_deref().map(parse_f64),
                    quote_volume: raw.quote_volume.as_deref().map(parse_f64),
                    base_volume: raw.volume.as_deref().map(parse_f64),
                    timestamp: Some(chrono::Utc::now()),
                    provider_info: HashMap::new(),
                })
            }
        })
        .await
    }

    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook, AdapterError> {
        let client = self.client.clone();
        let url = self.url(&format!("/fapi/v1/depth?symbol={symbol}&limit={limit}"));
        self.call("fetch_order_book", symbol, move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let raw: RawDepth = client.get(&url).send().await?.error_for_status()?.json().await?;
                let to_levels = |rows: Vec<[String; 2]>| {
                    rows.into_iter().map(|[p, a]| (parse_f64(&p), parse_f64(&a))).collect::<Vec<_>>()
                };
                Ok(OrderBook {
                    bids: to_levels(raw.bids),
                    asks: to_levels(raw.asks),
                    timestamp: Some(chrono::Utc::now()),
                })
            }
        })
        .await
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>, AdapterError> {
        let client = self.client.clone();
        let url = self.url(&format!("/fapi/v1/klines?symbol={symbol}&interval={timeframe}&limit={limit}"));
        self.call("fetch_ohlcv", symbol, move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let raw: Vec<serde_json::Value> = client.get(&url).send().await?.error_for_status()?.json().await?;
                let bars = raw
                    .into_iter()
                    .filter_map(|row| {
                        let row = row.as_array()?;
                        Some(Bar {
                            ts: row.first()?.as_i64()?,
                            open: row.get(1)?.as_str()?.parse().ok()?,
                            high: row.get(2)?.as_str()?.parse().ok()?,
                            low: row.get(3)?.as_str()?.parse().ok()?,
                            close: row.get(4)?.as_str()?.parse().ok()?,
                            volume: row.get(5)?.as_str()?.parse().ok()?,
                        })
                    })
                    .collect();
                Ok(bars)
            }
        })
        .await
    }

    async fn fetch_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, AdapterError> {
        let client = self.client.clone();
        let url = self.url(&format!("/fapi/v1/trades?symbol={symbol}&limit={limit}"));
        self.call("fetch_trades", symbol, move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let raw: Vec<RawTrade> = client.get(&url).send().await?.error_for_status()?.json().await?;
                Ok(raw
                    .into_iter()
                    .map(|t| Trade {
                        ts: t.time,
                        price: parse_f64(&t.price),
                        amount: parse_f64(&t.qty),
                        side: Some(if t.is_buyer_maker { "sell".to_string() } else { "buy".to_string() }),
                    })
                    .collect())
            }
        })
        .await
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>, AdapterError> {
        let client = self.client.clone();
        let url = self.url(&format!("/fapi/v1/premiumIndex?symbol={symbol}"));
        let result = self
            .call("fetch_funding_rate", symbol, move || {
                let client = client.clone();
                let url = url.clone();
                async move {
                    let raw: RawPremiumIndex = client.get(&url).send().await?.error_for_status()?.json().await?;
                    Ok(FundingRate { rate: parse_f64(&raw.last_funding_rate), ts: raw.time })
                }
            })
            .await;
        match result {
            Ok(rate) => Ok(Some(rate)),
            Err(err @ AdapterError::CircuitOpen { .. }) => Err(err),
            Err(_) => {
                warn!(symbol, "funding rate unsupported or unavailable, treating as null");
                Ok(None)
            }
        }
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<Option<OpenInterest>, AdapterError> {
        let client = self.client.clone();
        let url = self.url(&format!("/fapi/v1/openInterest?symbol={symbol}"));
        let result = self
            .call("fetch_open_interest", symbol, move || {
                let client = client.clone();
                let url = url.clone();
                async move {
                    let raw: RawOpenInterest = client.get(&url).send().await?.error_for_status()?.json().await?;
                    Ok(OpenInterest { value: parse_f64(&raw.open_interest), ts: raw.time })
                }
            })
            .await;
        match result {
            Ok(oi) => Ok(Some(oi)),
            Err(err @ AdapterError::CircuitOpen { .. }) => Err(err),
            Err(_) => Ok(None),
        }
    }

    fn state(&self) -> AdapterState {
        self.breaker.snapshot()
    }
}
