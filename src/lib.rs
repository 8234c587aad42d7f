// sandbox-core: paper-trading sandbox engine.
// users trade leveraged long/short positions against live or simulated prices with
// virtual balances. stops, targets and liquidations close positions automatically,
// leveraged positions pay funding.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: UserId, PositionId, Side, Price, Quote, Leverage, Bps
//   1.1  clock.rs: injectable clock, manual clock for tests
//   2.x  pnl.rs: pnl math, partial close, fees, slippage
//   3.x  asset.rs: tradable symbols, base prices, leverage caps
//   4.x  position.rs: position record, state transitions, split
//   4.1  portfolio.rs: balance, privilege tiers, trade stats
//   5.x  funding.rs: funding periods/fees, accrual loop
//   6.x  store.rs: persistence trait + in-memory store
//   6.1  oracle.rs: live feed with timeout, fallback rules
//   6.2  simulator.rs: seeded random-walk prices
//   7.x  config.rs: fees, risk, funding, schedule, oracle, env overrides
//   8.x  executor/: open, fill, cancel, close, funding charges
//   9.x  monitor.rs: stop-loss/take-profit/liquidation loop
//   9.1  triggers.rs: trigger and liquidation price rules
//   10.x schedule.rs: spawned interval loops with shutdown
//   11.x events.rs: audit events
//   12.x engine.rs: composition root and user-facing surface

pub mod asset;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod funding;
pub mod monitor;
pub mod oracle;
pub mod pnl;
pub mod portfolio;
pub mod position;
pub mod schedule;
pub mod simulator;
pub mod store;
pub mod triggers;
pub mod types;

// re exports for convenience
pub use asset::{AssetClass, AssetConfig, AssetRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::{PortfolioSnapshot, PositionView, SandboxEngine};
pub use events::{Event, EventPayload};
pub use executor::{ClosedTrade, EngineError, FillOutcome, FundingCharge, OpenRequest, OrderExecutor, ValidationError};
pub use funding::{FundingAccrual, FundingReport};
pub use monitor::{CycleReport, MonitorStatus, RiskMonitor};
pub use oracle::{HttpMarketData, MarketDataSource, OracleError, PriceOracle, PriceQuote, PriceSource, StaticPriceSource};
pub use portfolio::{Portfolio, PortfolioStats, PrivilegeTier};
pub use position::{CloseReason, OrderType, Position, PositionStatus};
pub use store::{InMemoryStore, PositionStore, StoreError};
pub use types::*;
