// 8.0.2: request/result types and errors for executor operations.

use crate::oracle::OracleError;
use crate::pnl::PnlError;
use crate::portfolio::Portfolio;
use crate::position::{OrderType, Position, PositionStatus};
use crate::store::StoreError;
use crate::types::{PositionId, Quote, Side, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a user asks for when opening. Raw decimals, validated by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub leverage: u32,
    pub limit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl OpenRequest {
    pub fn market(symbol: &str, side: Side, quantity: Decimal, leverage: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            leverage,
            limit_price: None,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, quantity: Decimal, leverage: u32, limit_price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(symbol, side, quantity, leverage)
        }
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.take_profit = Some(price);
        self
    }
}

/// Outcome of a full or partial close.
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    /// The closed record. A fresh id on a partial close.
    pub closed: Position,
    /// The still-open remainder of a partial close.
    pub residual: Option<Position>,
    pub portfolio: Portfolio,
    /// Credited to the balance as is, before the zero floor.
    pub realized_pnl: Quote,
    pub price_fallback: bool,
}

#[derive(Debug, Clone)]
pub enum FillOutcome {
    NotCrossed,
    Filled(Position),
    // fill-time checks failed, the order is gone
    Cancelled(Position),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingCharge {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub periods: u32,
    pub fee: Quote,
    pub new_balance: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported symbol: {0}")]
    UnsupportedSymbol(String),

    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("Leverage {requested}x outside 1..={max}x")]
    LeverageOutOfRange { requested: u32, max: u32 },

    #[error("Limit orders need a limit price")]
    MissingLimitPrice,

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Close fraction must be in (0, 1], got {0}")]
    InvalidCloseFraction(Decimal),

    #[error("Invalid stop-loss: {0}")]
    InvalidStopLoss(String),

    #[error("Invalid take-profit: {0}")]
    InvalidTakeProfit(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Quote, available: Quote },

    #[error("Position size exceeded: value {value}, max {max}")]
    PositionSizeExceeded { value: Quote, max: Quote },

    #[error("Price unavailable for {symbol}: {source}")]
    PriceUnavailable { symbol: String, source: OracleError },

    #[error("Cannot {action} a {status} position")]
    InvalidStateTransition {
        action: &'static str,
        status: PositionStatus,
    },

    #[error("Portfolio not found for user {0}")]
    PortfolioNotFound(UserId),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Database error: {0}")]
    Database(String),

    #[error("PnL error: {0}")]
    Pnl(#[from] PnlError),
}

impl EngineError {
    // store hiccups can be retried, everything else is a decision
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Database(_))
    }

    // lost a race with another closer/canceller, nothing to do
    pub fn is_benign_race(&self) -> bool {
        matches!(self, EngineError::InvalidStateTransition { .. })
    }

    pub(crate) fn transition(action: &'static str) -> impl FnOnce(StoreError) -> EngineError {
        move |e| match e {
            StoreError::Conflict { actual, .. } => EngineError::InvalidStateTransition { action, status: actual },
            other => other.into(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { actual, .. } => EngineError::InvalidStateTransition {
                action: "update",
                status: actual,
            },
            StoreError::NotFound(what) | StoreError::Database(what) => EngineError::Database(what),
        }
    }
}
