//! Unified exchange I/O interface (spec §4.5). Exchange SDKs themselves are
//! out of scope; implementations talk plain REST behind this trait.

pub mod binance;
pub mod circuit;

use crate::error::AdapterError;
use crate::models::{AdapterState, Bar, FundingRate, OpenInterest, OrderBook, Ticker, Trade};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub active: bool,
}

/// Exchange abstraction consumed by the orchestrator (spec §4.5, §1 out-of-scope
/// boundary: concrete exchange SDKs never leak past this trait).
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn load_markets(&self) -> Result<HashMap<String, MarketInfo>, AdapterError>;
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AdapterError>;
    async fn fetch_order_book(&self, symbol: &str, limit: usize) -> Result<OrderBook, AdapterError>;
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>, AdapterError>;
    async fn fetch_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, AdapterError>;
    async fn fetch_funding_rate(&self, symbol: &str) -> Result<Option<FundingRate>, AdapterError>;
    async fn fetch_open_interest(&self, symbol: &str) -> Result<Option<OpenInterest>, AdapterError>;

    /// Current circuit-breaker/health snapshot, exposed via `GET /health`.
    fn state(&self) -> AdapterState;
}
