//! Price resolution.
//!
//! `PriceOracle` asks the live market-data source first, bounded by a timeout.
//! What happens when that fails depends on why the price is wanted: opening a
//! position needs a real price and fails hard, while closing and marking fall
//! back to the simulator so risk management keeps running through an outage.

use crate::asset::{normalize_symbol, AssetRegistry};
use crate::clock::Clock;
use crate::simulator::PriceSimulator;
use crate::types::{Price, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    #[error("Price request for {symbol} timed out after {millis}ms")]
    Timeout { symbol: String, millis: u64 },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Market data returned status {0}")]
    Status(u16),

    #[error("Malformed price payload: {0}")]
    Malformed(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Price unavailable: {0}")]
    Unavailable(String),
}

/// Where a quote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Live,
    /// The simulator is the configured source.
    Simulated,
    /// The live feed failed and the simulator stood in.
    SimulatedFallback,
}

/// Why the caller wants a price. Decides the failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceIntent {
    Open,
    Close,
    Mark,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: Price,
    pub timestamp: Timestamp,
    pub source: PriceSource,
}

impl PriceQuote {
    pub fn is_fallback(&self) -> bool {
        self.source == PriceSource::SimulatedFallback
    }
}

/// Raw answer from a live source, validated by the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePrice {
    pub symbol: String,
    pub price: Decimal,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch(&self, symbol: &str) -> Result<LivePrice, OracleError>;

    fn name(&self) -> &str;
}

// ---- HTTP source ----

#[derive(Debug, Deserialize)]
struct PricePayload {
    symbol: String,
    price: serde_json::Value,
}

/// `GET {endpoint}?symbol=SYM` returning `{"symbol": "...", "price": <number|string>}`.
#[derive(Clone)]
pub struct HttpMarketData {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpMarketData {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketData {
    async fn fetch(&self, symbol: &str) -> Result<LivePrice, OracleError> {
        debug!("Fetching live price for {} from {}", symbol, self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout {
                        symbol: symbol.to_string(),
                        millis: self.timeout.as_millis() as u64,
                    }
                } else {
                    OracleError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;
        parse_payload(&body)
    }

    fn name(&self) -> &str {
        "http"
    }
}

fn parse_payload(body: &str) -> Result<LivePrice, OracleError> {
    let payload: PricePayload =
        serde_json::from_str(body).map_err(|e| OracleError::Malformed(e.to_string()))?;

    let price = match &payload.price {
        serde_json::Value::Number(n) => parse_decimal(&n.to_string()),
        serde_json::Value::String(s) => parse_decimal(s.trim()),
        _ => None,
    }
    .ok_or_else(|| OracleError::Malformed(format!("unparseable price {}", payload.price)))?;

    Ok(LivePrice {
        symbol: payload.symbol,
        price,
    })
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

// ---- static source ----

/// In-process source with settable prices, a health switch and artificial latency.
#[derive(Debug)]
pub struct StaticPriceSource {
    prices: DashMap<String, Decimal>,
    healthy: AtomicBool,
    latency_ms: AtomicU64,
}

impl StaticPriceSource {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
            healthy: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(normalize_symbol(symbol), price);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for StaticPriceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataSource for StaticPriceSource {
    async fn fetch(&self, symbol: &str) -> Result<LivePrice, OracleError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("static source marked unhealthy".to_string()));
        }
        let price = self
            .prices
            .get(symbol)
            .map(|p| *p.value())
            .ok_or_else(|| OracleError::UnknownSymbol(symbol.to_string()))?;
        Ok(LivePrice {
            symbol: symbol.to_string(),
            price,
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

// ---- oracle ----

pub struct PriceOracle {
    live: Option<Arc<dyn MarketDataSource>>,
    simulator: Arc<PriceSimulator>,
    assets: Arc<AssetRegistry>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    allow_simulated_open: bool,
}

impl PriceOracle {
    pub fn new(
        live: Option<Arc<dyn MarketDataSource>>,
        simulator: Arc<PriceSimulator>,
        assets: Arc<AssetRegistry>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        allow_simulated_open: bool,
    ) -> Self {
        Self {
            live,
            simulator,
            assets,
            clock,
            timeout,
            allow_simulated_open,
        }
    }

    pub fn simulator(&self) -> &Arc<PriceSimulator> {
        &self.simulator
    }

    pub fn has_live_feed(&self) -> bool {
        self.live.is_some()
    }

    pub async fn get_price(&self, symbol: &str, intent: PriceIntent) -> Result<PriceQuote, OracleError> {
        let symbol = normalize_symbol(symbol);
        if !self.assets.contains(&symbol) {
            return Err(OracleError::UnknownSymbol(symbol));
        }

        let Some(live) = &self.live else {
            if intent == PriceIntent::Open && !self.allow_simulated_open {
                return Err(OracleError::Unavailable(
                    "no live feed configured and simulated opens are disabled".to_string(),
                ));
            }
            let source = if self.allow_simulated_open {
                PriceSource::Simulated
            } else {
                PriceSource::SimulatedFallback
            };
            return self.simulated(&symbol, source);
        };

        let failure = match self.fetch_live(live.as_ref(), &symbol).await {
            Ok(quote) => {
                // a later fallback walks on from the last real price, not the base price
                self.simulator.set_price(&symbol, quote.price);
                return Ok(quote);
            }
            Err(e) => e,
        };

        match intent {
            PriceIntent::Open => {
                warn!("Live price for {} unavailable, refusing open: {}", symbol, failure);
                Err(failure)
            }
            PriceIntent::Close | PriceIntent::Mark => {
                warn!(
                    "Live price for {} unavailable ({}), using simulated fallback for {:?}",
                    symbol, failure, intent
                );
                self.simulated(&symbol, PriceSource::SimulatedFallback)
            }
        }
    }

    async fn fetch_live(&self, source: &dyn MarketDataSource, symbol: &str) -> Result<PriceQuote, OracleError> {
        let live = tokio::time::timeout(self.timeout, source.fetch(symbol))
            .await
            .map_err(|_| OracleError::Timeout {
                symbol: symbol.to_string(),
                millis: self.timeout.as_millis() as u64,
            })??;

        if normalize_symbol(&live.symbol) != symbol {
            return Err(OracleError::Malformed(format!(
                "asked {} from {}, got {}",
                symbol,
                source.name(),
                live.symbol
            )));
        }
        let price = Price::new(live.price).ok_or_else(|| {
            OracleError::Malformed(format!("non-positive price {} for {}", live.price, symbol))
        })?;

        Ok(PriceQuote {
            symbol: symbol.to_string(),
            price,
            timestamp: self.clock.now(),
            source: PriceSource::Live,
        })
    }

    fn simulated(&self, symbol: &str, source: PriceSource) -> Result<PriceQuote, OracleError> {
        let price = self
            .simulator
            .quote(symbol)
            .ok_or_else(|| OracleError::UnknownSymbol(symbol.to_string()))?;
        Ok(PriceQuote {
            symbol: symbol.to_string(),
            price,
            timestamp: self.clock.now(),
            source,
        })
    }
}
