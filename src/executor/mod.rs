// 8.0: order execution. the only place balances and position states change.
// 8.1 core (struct, locks, shared checks), 8.2 orders (open/fill/cancel/stops),
// 8.3 positions (close), 8.4 funding (holding fees). request/result types in results.

mod core;
mod funding;
mod orders;
mod positions;
mod results;

pub use self::core::OrderExecutor;
pub use self::results::{ClosedTrade, EngineError, FillOutcome, FundingCharge, OpenRequest, ValidationError};

#[cfg(test)]
pub(crate) use self::core::test_support;
