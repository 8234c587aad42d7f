//! Simulated market prices.
//!
//! A trending random walk per symbol, anchored to the asset's base price.
//! Each read advances the walk at most once, and only if a second or more has
//! passed since the previous step. Same seed and same clock readings give the
//! same prices.

use crate::asset::AssetRegistry;
use crate::clock::Clock;
use crate::types::{Price, Timestamp};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};

const STEP_MILLIS: i64 = 1_000;
const TREND_PERSISTENCE: f64 = 0.7;
const REVERSION_BAND: f64 = 0.15;
const REVERSION_STRENGTH: f64 = 0.1;
const FLOOR_RATIO: f64 = 0.5;
const CEILING_RATIO: f64 = 1.5;
const PRICE_DP: u32 = 6;

#[derive(Debug, Clone, Copy)]
struct SymbolState {
    current_price: f64,
    // +1.0 drifting up, -1.0 drifting down
    trend_bias: f64,
    last_update: Timestamp,
}

struct SimState {
    rng: StdRng,
    symbols: HashMap<String, SymbolState>,
}

pub struct PriceSimulator {
    assets: Arc<AssetRegistry>,
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
}

impl PriceSimulator {
    pub fn new(assets: Arc<AssetRegistry>, clock: Arc<dyn Clock>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            assets,
            clock,
            state: Mutex::new(SimState {
                rng,
                symbols: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // a panic mid-step leaves a valid price behind, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current simulated price, or `None` for a symbol the registry does not know.
    pub fn quote(&self, symbol: &str) -> Option<Price> {
        let asset = self.assets.get(symbol)?;
        let base = asset.base_price.value().to_f64()?;
        let volatility = asset.class.volatility();
        let now = self.clock.now();

        let mut guard = self.lock();
        let SimState { rng, symbols } = &mut *guard;
        let entry = symbols.entry(asset.symbol.clone()).or_insert(SymbolState {
            current_price: base,
            trend_bias: 1.0,
            last_update: now,
        });

        if now.millis_since(entry.last_update) >= STEP_MILLIS {
            entry.current_price = next_price(rng, entry, base, volatility);
            entry.last_update = now;
        }

        to_price(entry.current_price).or(Some(asset.base_price))
    }

    /// Pins a symbol's price. The walk continues from there on later reads.
    pub fn set_price(&self, symbol: &str, price: Price) -> bool {
        let Some(asset) = self.assets.get(symbol) else {
            return false;
        };
        let Some(value) = price.value().to_f64() else {
            return false;
        };
        let now = self.clock.now();
        let mut guard = self.lock();
        let state = guard.symbols.entry(asset.symbol.clone()).or_insert(SymbolState {
            current_price: value,
            trend_bias: 1.0,
            last_update: now,
        });
        state.current_price = value;
        state.last_update = now;
        true
    }
}

fn next_price(rng: &mut StdRng, state: &mut SymbolState, base: f64, volatility: f64) -> f64 {
    if rng.gen::<f64>() >= TREND_PERSISTENCE {
        state.trend_bias = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
    }

    let drift = state.trend_bias * volatility * 0.5;
    let noise = gaussian(rng) * volatility;
    let mut change = drift + noise;

    let deviation = (state.current_price - base) / base;
    if deviation.abs() > REVERSION_BAND {
        change -= deviation * REVERSION_STRENGTH;
    }

    (state.current_price * (1.0 + change)).clamp(base * FLOOR_RATIO, base * CEILING_RATIO)
}

// Box-Muller, standard normal
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>(); // (0, 1], keeps ln finite
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn to_price(value: f64) -> Option<Price> {
    Decimal::from_f64(value).and_then(|d| Price::new(d.round_dp(PRICE_DP)))
}
