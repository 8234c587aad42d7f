// 4.0: position (a "trade") tracking. one leveraged exposure per record.
// margin_used = entry * quantity, the balance reservation. position_value = margin_used * leverage.
// 4.1 pnl views, 4.2 the partial-close split at the bottom.

use crate::pnl::{self, PnlError};
use crate::types::{round_money, Leverage, PositionId, Price, Quote, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Cancelled)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    Partial,
    StopLoss,
    TakeProfit,
    Liquidation,
    Cancelled,
}

impl CloseReason {
    pub fn is_automatic(&self) -> bool {
        matches!(self, CloseReason::StopLoss | CloseReason::TakeProfit | CloseReason::Liquidation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fees {
    pub entry: Quote,
    pub exit: Quote,
    pub funding: Quote,
    pub total: Quote,
}

impl Fees {
    pub fn new(entry: Quote, exit: Quote, funding: Quote) -> Self {
        Self {
            entry,
            exit,
            funding,
            total: entry.add(exit).add(funding),
        }
    }

    pub fn with_funding(&self, charge: Quote) -> Self {
        Self::new(self.entry, self.exit, self.funding.add(charge))
    }

    // already taken out of the balance before close
    pub fn prepaid(&self) -> Quote {
        self.entry.add(self.funding)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Price>,
    pub quantity: Decimal,
    pub leverage: Leverage,
    pub entry_price: Price,
    pub current_price: Price,
    pub margin_used: Quote,
    pub position_value: Quote,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub fees: Fees,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<Price>,
    pub realized_pnl: Option<Quote>,
    pub is_automatic_close: bool,
    // set on the closed slice of a partial close
    pub parent_id: Option<PositionId>,
    pub created_at: Timestamp,
    pub entry_time: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,
    pub last_funding_time: Option<Timestamp>,
}

/// Everything needed to create a position record.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub leverage: Leverage,
    pub price: Price,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

pub fn margin_for(price: Price, quantity: Decimal) -> Quote {
    Quote::new(round_money(price.value() * quantity))
}

impl Position {
    // market fill: open right away with the entry fee already charged
    pub fn open(params: NewPosition, entry_fee: Quote, timestamp: Timestamp) -> Self {
        let mut position = Self::build(params, PositionStatus::Open, timestamp);
        position.fees = Fees::new(entry_fee, Quote::zero(), Quote::zero());
        position.entry_time = Some(timestamp);
        position
    }

    // limit order resting until the market crosses `params.price`
    pub fn pending(params: NewPosition, timestamp: Timestamp) -> Self {
        let limit = params.price;
        let mut position = Self::build(params, PositionStatus::Pending, timestamp);
        position.limit_price = Some(limit);
        position
    }

    fn build(params: NewPosition, status: PositionStatus, timestamp: Timestamp) -> Self {
        let margin_used = margin_for(params.price, params.quantity);
        Self {
            id: PositionId::generate(),
            user_id: params.user_id,
            symbol: params.symbol,
            side: params.side,
            order_type: params.order_type,
            limit_price: None,
            quantity: params.quantity,
            leverage: params.leverage,
            entry_price: params.price,
            current_price: params.price,
            margin_used,
            position_value: margin_used.mul(params.leverage.value()),
            stop_loss: params.stop_loss,
            take_profit: params.take_profit,
            fees: Fees::default(),
            status,
            close_reason: None,
            exit_price: None,
            realized_pnl: None,
            is_automatic_close: false,
            parent_id: None,
            created_at: timestamp,
            entry_time: None,
            closed_at: None,
            last_funding_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn is_pending(&self) -> bool {
        self.status == PositionStatus::Pending
    }

    // pending -> open at the limit price
    pub fn fill(&mut self, fill_price: Price, entry_fee: Quote, timestamp: Timestamp) {
        debug_assert!(self.is_pending());
        self.entry_price = fill_price;
        self.current_price = fill_price;
        self.margin_used = margin_for(fill_price, self.quantity);
        self.position_value = self.margin_used.mul(self.leverage.value());
        self.fees = Fees::new(entry_fee, Quote::zero(), Quote::zero());
        self.status = PositionStatus::Open;
        self.entry_time = Some(timestamp);
    }

    pub fn mark_cancelled(&mut self, timestamp: Timestamp) {
        self.status = PositionStatus::Cancelled;
        self.close_reason = Some(CloseReason::Cancelled);
        self.closed_at = Some(timestamp);
    }

    pub fn mark_closed(
        &mut self,
        exit_price: Price,
        exit_fee: Quote,
        realized_pnl: Quote,
        reason: CloseReason,
        timestamp: Timestamp,
    ) {
        self.fees = Fees::new(self.fees.entry, exit_fee, self.fees.funding);
        self.exit_price = Some(exit_price);
        self.current_price = exit_price;
        self.realized_pnl = Some(realized_pnl);
        self.close_reason = Some(reason);
        self.is_automatic_close = reason.is_automatic();
        self.status = PositionStatus::Closed;
        self.closed_at = Some(timestamp);
    }

    // funding watermark: last charge, or the fill time for a fresh position
    pub fn funding_watermark(&self) -> Option<Timestamp> {
        self.last_funding_time.or(self.entry_time)
    }

    // 4.1: paper gains/losses at a price, net of fees paid so far
    pub fn unrealized_pnl(&self, mark_price: Price) -> Result<Quote, PnlError> {
        pnl::unrealized_pnl(
            self.side,
            self.entry_price.value(),
            mark_price.value(),
            self.quantity,
            self.leverage,
            self.fees.total.value(),
        )
        .map(Quote::new)
    }

    pub fn unrealized_pnl_pct(&self, mark_price: Price) -> Result<Decimal, PnlError> {
        let pnl = self.unrealized_pnl(mark_price)?;
        Ok(pnl::pnl_percentage(pnl.value(), self.margin_used.value()))
    }

    // 4.2: carve `close_quantity` off into its own record. margin and fees are split
    // so the two parts add back to exactly the original amounts.
    pub fn split(&self, close_quantity: Decimal) -> PositionSplit {
        let fraction = close_quantity / self.quantity;
        let part = |q: Quote| Quote::new(round_money(q.value() * fraction));

        let closed_margin = part(self.margin_used);
        let closed_entry = part(self.fees.entry);
        let closed_funding = part(self.fees.funding);

        let mut closed = self.clone();
        closed.id = PositionId::generate();
        closed.parent_id = Some(self.id);
        closed.quantity = close_quantity;
        closed.margin_used = closed_margin;
        closed.position_value = closed_margin.mul(self.leverage.value());
        closed.fees = Fees::new(closed_entry, Quote::zero(), closed_funding);

        let mut residual = self.clone();
        residual.quantity = self.quantity - close_quantity;
        residual.margin_used = self.margin_used.sub(closed_margin);
        residual.position_value = residual.margin_used.mul(self.leverage.value());
        residual.fees = Fees::new(
            self.fees.entry.sub(closed_entry),
            self.fees.exit,
            self.fees.funding.sub(closed_funding),
        );

        PositionSplit { closed, residual }
    }
}

#[derive(Debug, Clone)]
pub struct PositionSplit {
    pub closed: Position,
    pub residual: Position,
}
