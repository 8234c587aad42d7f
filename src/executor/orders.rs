//! Opening, limit fills, cancels and trigger edits.

use super::core::{positive_price, OrderExecutor};
use super::results::{EngineError, FillOutcome, OpenRequest, ValidationError};
use crate::events::{
    CancelReason, EventPayload, OrderCancelledEvent, OrderFilledEvent, OrderPlacedEvent, PositionOpenedEvent,
    StopsUpdatedEvent,
};
use crate::oracle::{PriceIntent, PriceQuote};
use crate::pnl;
use crate::position::{margin_for, NewPosition, OrderType, Position, PositionStatus};
use crate::triggers::{check_stop_placement, limit_crossed, StopCheck};
use crate::types::{Leverage, PositionId, Price, Quote, Side, UserId};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

impl OrderExecutor {
    /// Open a market position or rest a limit order.
    pub async fn open_position(&self, user_id: &UserId, request: OpenRequest) -> Result<Position, EngineError> {
        let portfolio = self.portfolio(user_id)?;

        // validation before any I/O or mutation
        let asset = self.asset(&request.symbol)?;
        let symbol = asset.symbol.clone();
        if request.quantity <= Decimal::ZERO {
            return Err(ValidationError::InvalidQuantity(request.quantity).into());
        }
        let max_leverage = asset.max_leverage.min(portfolio.max_leverage);
        let leverage = Leverage::new(request.leverage)
            .filter(|l| *l <= max_leverage)
            .ok_or(ValidationError::LeverageOutOfRange {
                requested: request.leverage,
                max: max_leverage.get(),
            })?;
        let limit_price = match request.order_type {
            OrderType::Limit => {
                let raw = request.limit_price.ok_or(ValidationError::MissingLimitPrice)?;
                Some(positive_price(raw, "limit price")?)
            }
            OrderType::Market => None,
        };
        let stop_loss = request
            .stop_loss
            .map(|v| positive_price(v, "stop-loss"))
            .transpose()?;
        let take_profit = request
            .take_profit
            .map(|v| positive_price(v, "take-profit"))
            .transpose()?;

        // price I/O happens before taking the lock
        let (entry_price, quote) = match limit_price {
            Some(limit) => (limit, None),
            None => {
                let quote = self
                    .oracle
                    .get_price(&symbol, PriceIntent::Open)
                    .await
                    .map_err(|source| EngineError::PriceUnavailable {
                        symbol: symbol.clone(),
                        source,
                    })?;
                let filled = pnl::apply_slippage(quote.price.value(), request.side, self.config.fees.slippage_bps, true);
                (positive_price(filled, "fill price")?, Some(quote))
            }
        };

        validate_stops(request.side, entry_price, stop_loss, take_profit)?;

        let params = NewPosition {
            user_id: user_id.clone(),
            symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            leverage,
            price: entry_price,
            stop_loss,
            take_profit,
        };

        let _guard = self.lock_portfolio(user_id).await;
        let mut portfolio = self.portfolio(user_id)?;
        let now = self.clock.now();
        let margin = margin_for(entry_price, request.quantity);
        let value = margin.mul(leverage.value());

        let Some(quote) = quote else {
            // limit: no balance effect until it fills
            self.check_margin(&portfolio, margin, value, Quote::zero())?;
            let position = Position::pending(params, now);
            self.store.insert_position(&position)?;
            info!(
                "Placed limit {} {} {} @ {} for {} ({})",
                position.side, position.quantity, position.symbol, entry_price, user_id, position.id
            );
            self.emit(EventPayload::OrderPlaced(OrderPlacedEvent {
                position_id: position.id,
                user_id: user_id.clone(),
                symbol: position.symbol.clone(),
                side: position.side,
                quantity: position.quantity,
                limit_price: entry_price,
                leverage,
            }));
            return Ok(position);
        };

        let fee = Quote::new(pnl::fee_for(margin.value(), self.config.fees.market_fee_bps));
        self.check_margin(&portfolio, margin, value, fee)?;

        let mut position = Position::open(params, fee, now);
        // mark against the unslipped quote so the opening pnl shows the fill cost
        position.current_price = quote.price;
        self.store.insert_position(&position)?;
        portfolio.charge_fee(fee, now);
        if let Err(e) = self.store.save_portfolio(&portfolio) {
            if let Err(undo) = self.store.delete_position(&position.id) {
                error!("Open of {} left without its fee debit, rollback failed: {}", position.id, undo);
            }
            return Err(e.into());
        }

        let unrealized = position.unrealized_pnl(position.current_price)?;
        info!(
            "Opened {} {} {} @ {} ({}) for {}: margin {}, fee {}, unrealized {}",
            position.side,
            position.quantity,
            position.symbol,
            position.entry_price,
            position.leverage,
            user_id,
            position.margin_used,
            fee,
            unrealized
        );
        self.emit(EventPayload::PositionOpened(PositionOpenedEvent {
            position_id: position.id,
            user_id: user_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            margin_used: position.margin_used,
            leverage,
            fee,
            unrealized_pnl: unrealized,
        }));

        Ok(position)
    }

    /// Fill a resting limit order if `quote` has crossed its limit.
    pub async fn fill_pending_order(&self, order_id: &PositionId, quote: &PriceQuote) -> Result<FillOutcome, EngineError> {
        let snapshot = self.position(order_id)?;
        let _guard = self.lock_portfolio(&snapshot.user_id).await;

        let mut order = self.position(order_id)?;
        if order.status != PositionStatus::Pending {
            return Err(EngineError::InvalidStateTransition {
                action: "fill",
                status: order.status,
            });
        }
        let limit = order.limit_price.unwrap_or(order.entry_price);
        if !limit_crossed(order.side, limit, quote.price) {
            return Ok(FillOutcome::NotCrossed);
        }

        let mut portfolio = self.portfolio(&order.user_id)?;
        let now = self.clock.now();
        let margin = margin_for(limit, order.quantity);
        let value = margin.mul(order.leverage.value());
        let fee = Quote::new(pnl::fee_for(margin.value(), self.config.fees.limit_fee_bps));

        if let Err(e) = self.check_margin(&portfolio, margin, value, fee) {
            let reason = if matches!(e, EngineError::InsufficientMargin { .. }) {
                CancelReason::InsufficientMargin
            } else if matches!(e, EngineError::PositionSizeExceeded { .. }) {
                CancelReason::PositionSizeExceeded
            } else {
                return Err(e);
            };
            warn!("Cancelling limit order {} at fill: {}", order.id, e);
            order.mark_cancelled(now);
            self.store
                .update_position(&order, PositionStatus::Pending)
                .map_err(EngineError::transition("cancel"))?;
            self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
                position_id: order.id,
                user_id: order.user_id.clone(),
                reason,
            }));
            return Ok(FillOutcome::Cancelled(order));
        }

        let resting = order.clone();
        order.fill(limit, fee, now);
        order.current_price = quote.price;
        self.store
            .update_position(&order, PositionStatus::Pending)
            .map_err(EngineError::transition("fill"))?;
        portfolio.charge_fee(fee, now);
        if let Err(e) = self.store.save_portfolio(&portfolio) {
            if let Err(undo) = self.store.update_position(&resting, PositionStatus::Open) {
                error!("Fill of {} left without its fee debit, rollback failed: {}", order.id, undo);
            }
            return Err(e.into());
        }

        info!(
            "Filled limit order {} {} {} @ {} (market {})",
            order.id, order.side, order.symbol, limit, quote.price
        );
        self.emit(EventPayload::OrderFilled(OrderFilledEvent {
            position_id: order.id,
            user_id: order.user_id.clone(),
            fill_price: limit,
            fee,
        }));
        Ok(FillOutcome::Filled(order))
    }

    /// Cancel a resting limit order. No balance effect.
    pub async fn cancel_pending_order(&self, order_id: &PositionId) -> Result<Position, EngineError> {
        let snapshot = self.position(order_id)?;
        let _guard = self.lock_portfolio(&snapshot.user_id).await;

        let mut order = self.position(order_id)?;
        if order.status != PositionStatus::Pending {
            debug!("Cancel of {} refused: status {}", order.id, order.status);
            return Err(EngineError::InvalidStateTransition {
                action: "cancel",
                status: order.status,
            });
        }

        order.mark_cancelled(self.clock.now());
        self.store
            .update_position(&order, PositionStatus::Pending)
            .map_err(EngineError::transition("cancel"))?;

        info!("Cancelled limit order {} for {}", order.id, order.user_id);
        self.emit(EventPayload::OrderCancelled(OrderCancelledEvent {
            position_id: order.id,
            user_id: order.user_id.clone(),
            reason: CancelReason::UserRequested,
        }));
        Ok(order)
    }

    /// Replace the stop-loss and take-profit of a pending or open position. `None` clears.
    pub async fn update_stops(
        &self,
        position_id: &PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<Position, EngineError> {
        let stop_loss = stop_loss.map(|v| positive_price(v, "stop-loss")).transpose()?;
        let take_profit = take_profit.map(|v| positive_price(v, "take-profit")).transpose()?;

        let snapshot = self.position(position_id)?;
        let _guard = self.lock_portfolio(&snapshot.user_id).await;

        let mut position = self.position(position_id)?;
        let expected = position.status;
        // open positions are judged against the market, pending ones against their limit
        let reference = match expected {
            PositionStatus::Open => position.current_price,
            PositionStatus::Pending => position.limit_price.unwrap_or(position.entry_price),
            status => {
                return Err(EngineError::InvalidStateTransition {
                    action: "update stops on",
                    status,
                })
            }
        };
        validate_stops(position.side, reference, stop_loss, take_profit)?;

        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        self.store
            .update_position(&position, expected)
            .map_err(EngineError::transition("update stops on"))?;

        self.emit(EventPayload::StopsUpdated(StopsUpdatedEvent {
            position_id: position.id,
            user_id: position.user_id.clone(),
            stop_loss,
            take_profit,
        }));
        Ok(position)
    }
}

fn validate_stops(
    side: Side,
    reference: Price,
    stop_loss: Option<Price>,
    take_profit: Option<Price>,
) -> Result<(), ValidationError> {
    match check_stop_placement(side, reference, stop_loss, take_profit) {
        StopCheck::Ok => Ok(()),
        StopCheck::BadStopLoss => Err(ValidationError::InvalidStopLoss(format!(
            "a {side} stop must be on the losing side of {reference}"
        ))),
        StopCheck::BadTakeProfit => Err(ValidationError::InvalidTakeProfit(format!(
            "a {side} target must be on the winning side of {reference}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::core::test_support::harness;
    use super::*;
    use crate::oracle::PriceSource;
    use crate::portfolio::PrivilegeTier;
    use crate::store::PositionStore;
    use crate::types::Timestamp;
    use rust_decimal_macros::dec;

    fn quote(symbol: &str, price: Decimal) -> PriceQuote {
        PriceQuote {
            symbol: symbol.to_string(),
            price: Price::new_unchecked(price),
            timestamp: Timestamp::from_millis(0),
            source: PriceSource::Live,
        }
    }

    #[tokio::test]
    async fn market_open_charges_entry_fee() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("btc", Side::Long, dec!(0.01), 5))
            .await
            .unwrap();

        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.symbol, "BTC");
        assert_eq!(pos.margin_used.value(), dec!(500));
        assert_eq!(pos.position_value.value(), dec!(2500));
        // 10 bps of 500
        assert_eq!(pos.fees.entry.value(), dec!(0.50));
        assert_eq!(h.executor.portfolio(&user).unwrap().balance.value(), dec!(9999.50));
    }

    #[tokio::test]
    async fn size_cap_counts_leverage() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        // margin 2250 fits under 25% of 10000, the 11250 value does not
        let leveraged = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.045), 5))
            .await;
        assert!(matches!(leveraged, Err(EngineError::PositionSizeExceeded { .. })));

        let limit = h
            .executor
            .open_position(&user, OpenRequest::limit("BTC", Side::Long, dec!(0.045), 5, dec!(49000)))
            .await;
        assert!(matches!(limit, Err(EngineError::PositionSizeExceeded { .. })));

        let unleveraged = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.045), 1))
            .await
            .unwrap();
        assert_eq!(unleveraged.position_value.value(), dec!(2250));
    }

    #[tokio::test]
    async fn market_open_applies_slippage() {
        let h = super::super::core::test_support::harness_with(crate::config::EngineConfig::default());
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        let long = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 1))
            .await
            .unwrap();
        assert_eq!(long.entry_price.value(), dec!(50005));
        assert_eq!(long.current_price.value(), dec!(50000));

        let short = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Short, dec!(0.01), 1))
            .await
            .unwrap();
        assert_eq!(short.entry_price.value(), dec!(49995));
    }

    #[tokio::test]
    async fn open_validation_errors() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        let cases = [
            (OpenRequest::market("XYZ", Side::Long, dec!(1), 1), "symbol"),
            (OpenRequest::market("BTC", Side::Long, dec!(0), 1), "quantity"),
            (OpenRequest::market("BTC", Side::Long, dec!(0.01), 0), "leverage"),
            // standard tier caps at 5x even though BTC allows 20x
            (OpenRequest::market("BTC", Side::Long, dec!(0.01), 6), "leverage"),
            (
                OpenRequest {
                    limit_price: None,
                    ..OpenRequest::limit("BTC", Side::Long, dec!(0.01), 1, dec!(1))
                },
                "limit",
            ),
            (OpenRequest::market("BTC", Side::Long, dec!(0.01), 1).with_stop_loss(dec!(51000)), "stop"),
            (OpenRequest::market("BTC", Side::Short, dec!(0.01), 1).with_take_profit(dec!(52000)), "target"),
        ];

        for (request, label) in cases {
            let result = h.executor.open_position(&user, request).await;
            assert!(matches!(result, Err(EngineError::Validation(_))), "{label}: {result:?}");
        }
        assert_eq!(h.store.position_count(), 0);
    }

    #[tokio::test]
    async fn size_and_margin_limits() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        // 0.06 * 50000 = 3000 > 25% of 10000
        let too_big = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.06), 1))
            .await;
        assert!(matches!(too_big, Err(EngineError::PositionSizeExceeded { .. })));

        // four opens of 2400 fit, the fifth does not
        for _ in 0..4 {
            h.executor
                .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.048), 1))
                .await
                .unwrap();
        }
        let fifth = h
            .executor
            .open_position(&user, OpenRequest::market("ETH", Side::Long, dec!(0.2), 1))
            .await;
        assert!(matches!(fifth, Err(EngineError::InsufficientMargin { .. })));
    }

    #[tokio::test]
    async fn open_without_live_price_fails() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        h.feed.set_healthy(false);

        let result = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 1))
            .await;
        assert!(matches!(result, Err(EngineError::PriceUnavailable { .. })));
        assert_eq!(h.executor.portfolio(&user).unwrap().balance.value(), dec!(10000));
    }

    #[tokio::test]
    async fn limit_order_lifecycle() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        let order = h
            .executor
            .open_position(&user, OpenRequest::limit("ETH", Side::Long, dec!(0.4), 2, dec!(2900)))
            .await
            .unwrap();
        assert_eq!(order.status, PositionStatus::Pending);
        assert_eq!(h.executor.portfolio(&user).unwrap().balance.value(), dec!(10000));

        let not_yet = h.executor.fill_pending_order(&order.id, &quote("ETH", dec!(2950))).await.unwrap();
        assert!(matches!(not_yet, FillOutcome::NotCrossed));

        let filled = h.executor.fill_pending_order(&order.id, &quote("ETH", dec!(2890))).await.unwrap();
        let FillOutcome::Filled(pos) = filled else {
            panic!("expected a fill, got {filled:?}");
        };
        assert_eq!(pos.entry_price.value(), dec!(2900));
        assert_eq!(pos.margin_used.value(), dec!(1160));
        // 5 bps of 1160
        assert_eq!(pos.fees.entry.value(), dec!(0.58));
        assert_eq!(h.executor.portfolio(&user).unwrap().balance.value(), dec!(9999.42));

        let cancel = h.executor.cancel_pending_order(&order.id).await;
        assert!(matches!(
            cancel,
            Err(EngineError::InvalidStateTransition { status: PositionStatus::Open, .. })
        ));
    }

    #[tokio::test]
    async fn cancel_pending_order_once() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let order = h
            .executor
            .open_position(&user, OpenRequest::limit("BTC", Side::Short, dec!(0.01), 1, dec!(52000)))
            .await
            .unwrap();

        let cancelled = h.executor.cancel_pending_order(&order.id).await.unwrap();
        assert_eq!(cancelled.status, PositionStatus::Cancelled);
        assert_eq!(cancelled.close_reason, Some(crate::position::CloseReason::Cancelled));

        let again = h.executor.cancel_pending_order(&order.id).await;
        assert!(again.unwrap_err().is_benign_race());
    }

    #[tokio::test]
    async fn fill_cancels_when_margin_gone() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        let order = h
            .executor
            .open_position(&user, OpenRequest::limit("BTC", Side::Long, dec!(0.048), 1, dec!(50000)))
            .await
            .unwrap();
        // balance drops under the order's requirement before it fills
        let mut portfolio = h.executor.portfolio(&user).unwrap();
        portfolio.balance = Quote::new(dec!(1000));
        h.store.save_portfolio(&portfolio).unwrap();

        let outcome = h.executor.fill_pending_order(&order.id, &quote("BTC", dec!(49000))).await.unwrap();
        let FillOutcome::Cancelled(cancelled) = outcome else {
            panic!("expected cancel, got {outcome:?}");
        };
        assert_eq!(cancelled.status, PositionStatus::Cancelled);
        assert_eq!(h.executor.portfolio(&user).unwrap().balance.value(), dec!(1000));
    }

    #[tokio::test]
    async fn update_stops_validates_side() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 2))
            .await
            .unwrap();

        let updated = h
            .executor
            .update_stops(&pos.id, Some(dec!(48000)), Some(dec!(55000)))
            .await
            .unwrap();
        assert_eq!(updated.stop_loss.unwrap().value(), dec!(48000));

        let bad = h.executor.update_stops(&pos.id, Some(dec!(50500)), None).await;
        assert!(matches!(bad, Err(EngineError::Validation(ValidationError::InvalidStopLoss(_)))));

        let cleared = h.executor.update_stops(&pos.id, None, None).await.unwrap();
        assert!(cleared.stop_loss.is_none() && cleared.take_profit.is_none());
    }
}
