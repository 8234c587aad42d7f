//! Stop-loss, take-profit and liquidation triggers.
//!
//! Pure evaluation against one observed price. The monitor decides what to do
//! with the answer; nothing here touches state.

use crate::position::{CloseReason, Position};
use crate::types::{Leverage, Price, Side};
use rust_decimal::Decimal;

/// How a trigger price is compared with the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCondition {
    /// Fires when price is at or above the trigger.
    Above,
    /// Fires when price is at or below the trigger.
    Below,
}

impl TriggerCondition {
    pub fn is_met(&self, price: Price, trigger: Price) -> bool {
        match self {
            TriggerCondition::Above => price >= trigger,
            TriggerCondition::Below => price <= trigger,
        }
    }

    // stop-loss fires when price moves against the position
    pub fn stop_loss(side: Side) -> Self {
        match side {
            Side::Long => TriggerCondition::Below,
            Side::Short => TriggerCondition::Above,
        }
    }

    pub fn take_profit(side: Side) -> Self {
        match side {
            Side::Long => TriggerCondition::Above,
            Side::Short => TriggerCondition::Below,
        }
    }
}

/// Price at which a leveraged position is force-closed.
/// `None` for unleveraged positions, which can't be liquidated.
pub fn liquidation_price(side: Side, entry: Price, leverage: Leverage, threshold: Decimal) -> Option<Price> {
    if !leverage.is_leveraged() {
        return None;
    }
    let move_fraction = threshold / leverage.value();
    let level = match side {
        Side::Long => entry.value() * (Decimal::ONE - move_fraction),
        Side::Short => entry.value() * (Decimal::ONE + move_fraction),
    };
    Price::new(level)
}

/// First matching trigger wins: stop-loss, then take-profit, then liquidation.
pub fn evaluate_triggers(position: &Position, price: Price, liquidation_threshold: Decimal) -> Option<CloseReason> {
    if let Some(stop) = position.stop_loss {
        if TriggerCondition::stop_loss(position.side).is_met(price, stop) {
            return Some(CloseReason::StopLoss);
        }
    }

    if let Some(target) = position.take_profit {
        if TriggerCondition::take_profit(position.side).is_met(price, target) {
            return Some(CloseReason::TakeProfit);
        }
    }

    let liq = liquidation_price(position.side, position.entry_price, position.leverage, liquidation_threshold)?;
    // a liquidation level is adverse, same comparison as a stop
    if TriggerCondition::stop_loss(position.side).is_met(price, liq) {
        return Some(CloseReason::Liquidation);
    }

    None
}

/// Has the market crossed a resting limit order? Long buys at or below, short sells at or above.
pub fn limit_crossed(side: Side, limit: Price, price: Price) -> bool {
    match side {
        Side::Long => price <= limit,
        Side::Short => price >= limit,
    }
}

/// Which side of the reference a trigger was placed on, for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCheck {
    Ok,
    BadStopLoss,
    BadTakeProfit,
}

// stop must sit on the losing side of the reference, target on the winning side
pub fn check_stop_placement(
    side: Side,
    reference: Price,
    stop_loss: Option<Price>,
    take_profit: Option<Price>,
) -> StopCheck {
    let stop_ok = stop_loss.map_or(true, |s| match side {
        Side::Long => s < reference,
        Side::Short => s > reference,
    });
    if !stop_ok {
        return StopCheck::BadStopLoss;
    }

    let target_ok = take_profit.map_or(true, |t| match side {
        Side::Long => t > reference,
        Side::Short => t < reference,
    });
    if !target_ok {
        return StopCheck::BadTakeProfit;
    }

    StopCheck::Ok
}
