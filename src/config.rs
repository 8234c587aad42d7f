// 7.0 config.rs: all settings in one place. fees, risk, funding, schedules, price source.
// 7.1 presets, 7.2 env loading, 7.3 validation.

use crate::types::Bps;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

// longest any price request may block a caller or the monitor
pub const MAX_ORACLE_TIMEOUT_MS: u64 = 5_000;

/// Fee and fill settings. 100 bps = 1%
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    // charged on the entry notional of market orders
    pub market_fee_bps: Bps,
    // charged when a limit order fills
    pub limit_fee_bps: Bps,
    // adverse fill on market entries and on every exit
    pub slippage_bps: Bps,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            market_fee_bps: Bps::new(10), // 0.1%
            limit_fee_bps: Bps::new(5),   // 0.05%
            slippage_bps: Bps::new(1),    // 0.01%
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    // share of the 1/leverage move that liquidates. 0.9 -> a 5x long dies 18% down
    pub liquidation_threshold: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            liquidation_threshold: dec!(0.9),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    // charged per full period on position_value
    pub rate: Decimal,
    pub period_hours: u32,
}

impl FundingConfig {
    pub fn period_millis(&self) -> i64 {
        i64::from(self.period_hours) * 3_600_000
    }
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            rate: dec!(0.0001),
            period_hours: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub funding_interval_secs: u64,
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn funding_interval(&self) -> Duration {
        Duration::from_secs(self.funding_interval_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            funding_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    // live market-data endpoint; None means simulator only
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    // opens may price off the simulator when there is no live feed
    pub allow_simulated_open: bool,
    // fixed seed makes the simulator reproducible
    pub simulator_seed: Option<u64>,
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Everything the engine needs, owned by the composition root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub fees: FeeConfig,
    pub risk: RiskConfig,
    pub funding: FundingConfig,
    pub monitor: MonitorConfig,
    pub oracle: OracleConfig,
    // starting balance of a freshly unlocked portfolio
    pub initial_balance: Decimal,
    // closed positions returned in a snapshot
    pub recent_closed_limit: usize,
    // event log capacity
    pub max_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            risk: RiskConfig::default(),
            funding: FundingConfig::default(),
            monitor: MonitorConfig::default(),
            oracle: OracleConfig {
                endpoint: None,
                timeout_ms: MAX_ORACLE_TIMEOUT_MS,
                allow_simulated_open: false,
                simulator_seed: None,
            },
            initial_balance: dec!(10000),
            recent_closed_limit: 20,
            max_events: 1_000,
        }
    }
}

impl EngineConfig {
    // 7.1: simulator is the price source, opens allowed on it
    pub fn simulation() -> Self {
        let mut config = Self::default();
        config.oracle.allow_simulated_open = true;
        config
    }

    // live feed required for opens, simulator only as the close/mark fallback
    pub fn live(endpoint: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.oracle.endpoint = Some(endpoint.into());
        config
    }

    // 7.2: SANDBOX_* overrides on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<i32, _>(&lookup, "SANDBOX_MARKET_FEE_BPS")? {
            config.fees.market_fee_bps = Bps::new(v);
        }
        if let Some(v) = parse_var::<i32, _>(&lookup, "SANDBOX_LIMIT_FEE_BPS")? {
            config.fees.limit_fee_bps = Bps::new(v);
        }
        if let Some(v) = parse_var::<i32, _>(&lookup, "SANDBOX_SLIPPAGE_BPS")? {
            config.fees.slippage_bps = Bps::new(v);
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_LIQUIDATION_THRESHOLD")? {
            config.risk.liquidation_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_FUNDING_RATE")? {
            config.funding.rate = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_FUNDING_PERIOD_HOURS")? {
            config.funding.period_hours = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_MONITOR_INTERVAL_SECS")? {
            config.monitor.interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_FUNDING_INTERVAL_SECS")? {
            config.monitor.funding_interval_secs = v;
        }
        if let Some(endpoint) = lookup("SANDBOX_PRICE_ENDPOINT").filter(|s| !s.trim().is_empty()) {
            config.oracle.endpoint = Some(endpoint.trim().to_string());
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_ORACLE_TIMEOUT_MS")? {
            config.oracle.timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_ALLOW_SIMULATED_OPEN")? {
            config.oracle.allow_simulated_open = v;
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_SIMULATOR_SEED")? {
            config.oracle.simulator_seed = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "SANDBOX_INITIAL_BALANCE")? {
            config.initial_balance = v;
        }

        config.validate()?;
        Ok(config)
    }

    // 7.3: reject settings the engine can't run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, bps) in [
            ("market fee", self.fees.market_fee_bps),
            ("limit fee", self.fees.limit_fee_bps),
            ("slippage", self.fees.slippage_bps),
        ] {
            if !(0..=100).contains(&bps.value()) {
                return Err(ConfigError::InvalidFees {
                    reason: format!("{name} must be within 0..=100 bps"),
                });
            }
        }

        let threshold = self.risk.liquidation_threshold;
        if threshold <= Decimal::ZERO || threshold > Decimal::ONE {
            return Err(ConfigError::InvalidRisk {
                reason: "liquidation threshold must be in (0, 1]".to_string(),
            });
        }
        if self.initial_balance <= Decimal::ZERO {
            return Err(ConfigError::InvalidRisk {
                reason: "initial balance must be positive".to_string(),
            });
        }

        if self.oracle.timeout_ms == 0 || self.oracle.timeout_ms > MAX_ORACLE_TIMEOUT_MS {
            return Err(ConfigError::InvalidOracle {
                reason: format!("timeout must be within 1..={MAX_ORACLE_TIMEOUT_MS} ms"),
            });
        }
        if let Some(endpoint) = &self.oracle.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::InvalidOracle {
                    reason: format!("endpoint {endpoint} is not an http(s) url"),
                });
            }
        }

        if self.monitor.interval_secs == 0 || self.monitor.funding_interval_secs == 0 {
            return Err(ConfigError::InvalidSchedule {
                reason: "loop intervals must be positive".to_string(),
            });
        }
        if self.funding.period_hours == 0 || self.funding.rate < Decimal::ZERO {
            return Err(ConfigError::InvalidSchedule {
                reason: "funding needs a positive period and a non-negative rate".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value: raw,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid fees: {reason}")]
    InvalidFees { reason: String },

    #[error("Invalid risk settings: {reason}")]
    InvalidRisk { reason: String },

    #[error("Invalid oracle settings: {reason}")]
    InvalidOracle { reason: String },

    #[error("Invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    #[error("Cannot parse {key}={value}")]
    Env { key: String, value: String },
}
