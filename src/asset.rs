//! Tradable instruments.
//!
//! Each asset carries its class, the base price the simulator is anchored to,
//! and the maximum leverage a position in it may use. The registry is the only
//! place a symbol is recognised as tradable.

use crate::types::{Leverage, Price};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Broad asset family. Drives simulated volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Crypto,
    GrowthStock,
    IndexEtf,
}

impl AssetClass {
    /// Per-step volatility of the simulated random walk (fraction of price).
    pub fn volatility(&self) -> f64 {
        match self {
            AssetClass::Crypto => 0.002,
            AssetClass::GrowthStock => 0.001,
            AssetClass::IndexEtf => 0.0004,
        }
    }
}

/// Static asset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Upper-case ticker (e.g. "BTC")
    pub symbol: String,
    pub name: String,
    pub class: AssetClass,
    /// Anchor for the simulator and its clamp band
    pub base_price: Price,
    pub max_leverage: Leverage,
}

impl AssetConfig {
    pub fn new(symbol: &str, name: &str, class: AssetClass, base_price: Decimal, max_leverage: u32) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            name: name.to_string(),
            class,
            base_price: Price::new_unchecked(base_price),
            max_leverage: Leverage::new(max_leverage).unwrap_or(Leverage::ONE),
        }
    }
}

/// Lookup of supported symbols
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRegistry {
    assets: BTreeMap<String, AssetConfig>,
}

impl AssetRegistry {
    pub fn empty() -> Self {
        Self {
            assets: BTreeMap::new(),
        }
    }

    /// Insert or replace an asset
    pub fn register(&mut self, asset: AssetConfig) {
        self.assets.insert(asset.symbol.clone(), asset);
    }

    /// Case-insensitive symbol lookup
    pub fn get(&self, symbol: &str) -> Option<&AssetConfig> {
        self.assets.get(&normalize_symbol(symbol))
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.get(symbol).is_some()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

impl Default for AssetRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for asset in [
            AssetConfig::new("BTC", "Bitcoin", AssetClass::Crypto, dec!(50000), 20),
            AssetConfig::new("ETH", "Ethereum", AssetClass::Crypto, dec!(3000), 20),
            AssetConfig::new("SOL", "Solana", AssetClass::Crypto, dec!(150), 10),
            AssetConfig::new("DOGE", "Dogecoin", AssetClass::Crypto, dec!(0.15), 10),
            AssetConfig::new("AAPL", "Apple", AssetClass::GrowthStock, dec!(190), 5),
            AssetConfig::new("TSLA", "Tesla", AssetClass::GrowthStock, dec!(250), 5),
            AssetConfig::new("NVDA", "Nvidia", AssetClass::GrowthStock, dec!(120), 5),
            AssetConfig::new("SPY", "S&P 500 ETF", AssetClass::IndexEtf, dec!(520), 10),
            AssetConfig::new("QQQ", "Nasdaq 100 ETF", AssetClass::IndexEtf, dec!(440), 10),
        ] {
            registry.register(asset);
        }
        registry
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
