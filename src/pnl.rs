// 2.0: pnl arithmetic. pure, no I/O, every result rounded to cents at the end.
// pnl = price_diff * quantity * leverage - fees. leverage scales the price delta, not the margin.
// 2.1 partial close, 2.2 fees and slippage helpers.

use crate::types::{round_money, Bps, Leverage, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PnlError {
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),
}

fn price_diff(side: Side, entry_price: Decimal, exit_price: Decimal) -> Decimal {
    match side {
        Side::Long => exit_price - entry_price,
        Side::Short => entry_price - exit_price,
    }
}

fn check_prices(entry_price: Decimal, current_price: Decimal) -> Result<(), PnlError> {
    if entry_price <= Decimal::ZERO {
        return Err(PnlError::InvalidInput("entry price must be positive"));
    }
    if current_price <= Decimal::ZERO {
        return Err(PnlError::InvalidInput("current price must be positive"));
    }
    Ok(())
}

pub fn unrealized_pnl(
    side: Side,
    entry_price: Decimal,
    current_price: Decimal,
    quantity: Decimal,
    leverage: Leverage,
    total_fees: Decimal,
) -> Result<Decimal, PnlError> {
    check_prices(entry_price, current_price)?;
    if quantity <= Decimal::ZERO {
        return Err(PnlError::InvalidInput("quantity must be positive"));
    }

    let gross = price_diff(side, entry_price, current_price) * quantity * leverage.value();
    Ok(round_money(gross - total_fees))
}

// same formula at the exit price. kept as its own entry point so callers say what they mean
pub fn realized_pnl(
    side: Side,
    entry_price: Decimal,
    exit_price: Decimal,
    quantity: Decimal,
    leverage: Leverage,
    total_fees: Decimal,
) -> Result<Decimal, PnlError> {
    unrealized_pnl(side, entry_price, exit_price, quantity, leverage, total_fees)
}

pub fn pnl_percentage(pnl: Decimal, margin_used: Decimal) -> Decimal {
    if margin_used <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_money(pnl / margin_used * dec!(100))
}

// 2.1: closing part of a position. entry-side fees are apportioned by quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialClose {
    pub realized_pnl: Decimal,
    pub remaining_quantity: Decimal,
    pub fees_paid: Decimal,
}

#[allow(clippy::too_many_arguments)]
pub fn partial_close(
    side: Side,
    entry_price: Decimal,
    exit_price: Decimal,
    total_quantity: Decimal,
    close_quantity: Decimal,
    total_fees: Decimal,
    exit_fee: Decimal,
    leverage: Leverage,
) -> Result<PartialClose, PnlError> {
    check_prices(entry_price, exit_price)?;
    if total_quantity <= Decimal::ZERO {
        return Err(PnlError::InvalidInput("total quantity must be positive"));
    }
    if close_quantity <= Decimal::ZERO {
        return Err(PnlError::InvalidInput("close quantity must be positive"));
    }
    if close_quantity > total_quantity {
        return Err(PnlError::InvalidInput("close quantity exceeds position quantity"));
    }

    let proportional_fee = total_fees * close_quantity / total_quantity;
    let fees_paid = proportional_fee + exit_fee;
    let gross = price_diff(side, entry_price, exit_price) * close_quantity * leverage.value();

    Ok(PartialClose {
        realized_pnl: round_money(gross - fees_paid),
        remaining_quantity: total_quantity - close_quantity,
        fees_paid: round_money(fees_paid),
    })
}

// 2.2: fee on a notional, rounded to cents
pub fn fee_for(notional: Decimal, rate: Bps) -> Decimal {
    round_money(notional * rate.as_fraction())
}

// adverse fill: whoever is buying pays up, whoever is selling receives less.
// opening a long or closing a short buys; opening a short or closing a long sells.
pub fn apply_slippage(price: Decimal, side: Side, slippage: Bps, opening: bool) -> Decimal {
    let buying = matches!((side, opening), (Side::Long, true) | (Side::Short, false));
    let adj = slippage.as_fraction();
    if buying {
        price * (Decimal::ONE + adj)
    } else {
        price * (Decimal::ONE - adj)
    }
}
