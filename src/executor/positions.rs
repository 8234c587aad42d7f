//! Closing positions, fully or in part.
//!
//! A close moves the balance by exactly the realized P&L of the closed slice.
//! Realized P&L is net of every fee the slice carries (entry, funding, exit),
//! even though entry and funding were already debited when they were charged.
//! A liquidation never loses more than the margin the slice reserved.

use super::core::{positive_price, OrderExecutor};
use super::results::{ClosedTrade, EngineError, ValidationError};
use crate::events::{EventPayload, PositionClosedEvent, PriceFallbackEvent};
use crate::oracle::{PriceIntent, PriceQuote};
use crate::pnl;
use crate::position::{CloseReason, Position, PositionStatus};
use crate::types::{PositionId, Price, Quote};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

impl OrderExecutor {
    /// Store the latest mark on an open position. Done under the owner's lock
    /// so it can't overwrite a funding charge landing at the same time.
    pub async fn refresh_price(&self, position_id: &PositionId, price: Price) -> Result<Position, EngineError> {
        let snapshot = self.position(position_id)?;
        let _guard = self.lock_portfolio(&snapshot.user_id).await;

        let mut position = self.position(position_id)?;
        if !position.is_open() {
            return Err(EngineError::InvalidStateTransition {
                action: "mark",
                status: position.status,
            });
        }
        position.current_price = price;
        self.store
            .update_position(&position, PositionStatus::Open)
            .map_err(EngineError::transition("mark"))?;
        Ok(position)
    }

    /// Close at a freshly fetched price. Falls back to the simulator if the live feed is down.
    pub async fn close_at_market(
        &self,
        position_id: &PositionId,
        reason: CloseReason,
        close_fraction: Decimal,
    ) -> Result<ClosedTrade, EngineError> {
        check_fraction(close_fraction)?;
        let position = self.position(position_id)?;
        if position.status != PositionStatus::Open {
            return Err(EngineError::InvalidStateTransition {
                action: "close",
                status: position.status,
            });
        }
        let quote = self
            .oracle
            .get_price(&position.symbol, PriceIntent::Close)
            .await
            .map_err(|source| EngineError::PriceUnavailable {
                symbol: position.symbol.clone(),
                source,
            })?;
        self.close_position(position_id, &quote, reason, close_fraction).await
    }

    /// Close `close_fraction` of an open position at `quote`.
    pub async fn close_position(
        &self,
        position_id: &PositionId,
        quote: &PriceQuote,
        reason: CloseReason,
        close_fraction: Decimal,
    ) -> Result<ClosedTrade, EngineError> {
        check_fraction(close_fraction)?;
        let snapshot = self.position(position_id)?;
        let _guard = self.lock_portfolio(&snapshot.user_id).await;

        // re-read under the lock, someone may have closed it meanwhile
        let position = self.position(position_id)?;
        if position.status != PositionStatus::Open {
            debug!("Close of {} refused: status {}", position.id, position.status);
            return Err(EngineError::InvalidStateTransition {
                action: "close",
                status: position.status,
            });
        }
        if quote.symbol != position.symbol {
            return Err(ValidationError::InvalidPrice(format!(
                "quote for {} used to close a {} position",
                quote.symbol, position.symbol
            ))
            .into());
        }

        let exit_value = pnl::apply_slippage(quote.price.value(), position.side, self.config.fees.slippage_bps, false);
        let exit_price = positive_price(exit_value, "exit price")?;
        let close_quantity = position.quantity * close_fraction;
        let partial = close_quantity < position.quantity;
        let reason = match reason {
            CloseReason::Manual if partial => CloseReason::Partial,
            other => other,
        };

        let exit_fee = Quote::new(pnl::fee_for(
            exit_price.value() * close_quantity,
            self.config.fees.market_fee_bps,
        ));
        let result = pnl::partial_close(
            position.side,
            position.entry_price.value(),
            exit_price.value(),
            position.quantity,
            close_quantity,
            position.fees.prepaid().value(),
            exit_fee.value(),
            position.leverage,
        )?;
        let now = self.clock.now();
        let (mut closed, residual) = if partial {
            let split = position.split(close_quantity);
            (split.closed, Some(split.residual))
        } else {
            (position.clone(), None)
        };

        let mut realized = Quote::new(result.realized_pnl);
        let max_loss = closed.margin_used.negate();
        if reason == CloseReason::Liquidation && realized < max_loss {
            debug!("Liquidation loss on {} capped at margin {}", closed.id, closed.margin_used);
            realized = max_loss;
        }
        closed.mark_closed(exit_price, exit_fee, realized, reason, now);

        // conditional writes: a lost race surfaces here as InvalidStateTransition
        match &residual {
            Some(remainder) => {
                self.store
                    .update_position(remainder, PositionStatus::Open)
                    .map_err(EngineError::transition("close"))?;
                if let Err(e) = self.store.insert_position(&closed) {
                    self.undo_close(&position, PositionStatus::Open, None);
                    return Err(e.into());
                }
            }
            None => {
                self.store
                    .update_position(&closed, PositionStatus::Open)
                    .map_err(EngineError::transition("close"))?;
            }
        }

        // on a failed credit the close is undone, never left closed and unpaid
        let (stored, slice) = if residual.is_some() {
            (PositionStatus::Open, Some(&closed))
        } else {
            (PositionStatus::Closed, None)
        };
        let mut portfolio = match self.portfolio(&closed.user_id) {
            Ok(portfolio) => portfolio,
            Err(e) => {
                self.undo_close(&position, stored, slice);
                return Err(e);
            }
        };
        let uncovered = portfolio.apply_balance_change(realized, now);
        portfolio.record_trade(realized, exit_fee);
        if let Err(e) = self.store.save_portfolio(&portfolio) {
            self.undo_close(&position, stored, slice);
            return Err(e.into());
        }
        if !uncovered.is_zero() {
            warn!(
                "Loss on {} exceeded balance of {}; {} uncovered, balance clamped to 0",
                closed.id, closed.user_id, uncovered
            );
        }

        info!(
            "Closed {} {} {} @ {} ({:?}) for {}: pnl {}, balance {}",
            closed.quantity,
            closed.symbol,
            closed.side,
            exit_price,
            reason,
            closed.user_id,
            realized,
            portfolio.balance
        );

        if quote.is_fallback() {
            self.emit(EventPayload::PriceFallback(PriceFallbackEvent {
                symbol: quote.symbol.clone(),
                price: quote.price,
            }));
        }
        self.emit(EventPayload::PositionClosed(PositionClosedEvent {
            position_id: closed.id,
            parent_id: closed.parent_id,
            user_id: closed.user_id.clone(),
            symbol: closed.symbol.clone(),
            quantity: closed.quantity,
            exit_price,
            realized_pnl: realized,
            new_balance: portfolio.balance,
            close_reason: reason,
            price_source: quote.source,
        }));

        Ok(ClosedTrade {
            closed,
            residual,
            portfolio,
            realized_pnl: realized,
            price_fallback: quote.is_fallback(),
        })
    }

    // puts the open record back after a close failed half way. `stored` is the
    // status the record has now, `slice` the separately inserted closed record
    fn undo_close(&self, original: &Position, stored: PositionStatus, slice: Option<&Position>) {
        if let Err(e) = self.store.update_position(original, stored) {
            error!("Rollback of close on {} failed: {}", original.id, e);
        }
        if let Some(slice) = slice {
            if let Err(e) = self.store.delete_position(&slice.id) {
                error!("Rollback of closed slice {} failed: {}", slice.id, e);
            }
        }
    }
}

fn check_fraction(close_fraction: Decimal) -> Result<(), ValidationError> {
    if close_fraction <= Decimal::ZERO || close_fraction > Decimal::ONE {
        return Err(ValidationError::InvalidCloseFraction(close_fraction));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::core::test_support::{executor_on, harness};
    use super::super::results::OpenRequest;
    use super::*;
    use crate::oracle::PriceSource;
    use crate::portfolio::{Portfolio, PrivilegeTier};
    use crate::store::{InMemoryStore, PositionStore, StoreError};
    use crate::types::{Price, Side, Timestamp, UserId};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn quote(symbol: &str, price: Decimal) -> PriceQuote {
        PriceQuote {
            symbol: symbol.to_string(),
            price: Price::new_unchecked(price),
            timestamp: Timestamp::from_millis(0),
            source: PriceSource::Live,
        }
    }

    #[tokio::test]
    async fn full_close_credits_realized_pnl() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 5))
            .await
            .unwrap();
        // entry fee 10 bps of 500 margin
        let before = h.executor.portfolio(&user).unwrap().balance;
        assert_eq!(before.value(), dec!(9999.50));

        let trade = h
            .executor
            .close_position(&pos.id, &quote("BTC", dec!(51000)), CloseReason::Manual, Decimal::ONE)
            .await
            .unwrap();

        // gross 1000 * 0.01 * 5 = 50, entry fee 0.50, exit fee 10 bps of 510 = 0.51
        assert_eq!(trade.closed.fees.exit.value(), dec!(0.51));
        assert_eq!(trade.realized_pnl.value(), dec!(48.99));
        assert_eq!(trade.portfolio.balance, before.add(trade.realized_pnl));
        assert_eq!(trade.portfolio.balance.value(), dec!(10048.49));
        assert_eq!(trade.closed.status, PositionStatus::Closed);
        assert_eq!(trade.closed.close_reason, Some(CloseReason::Manual));
        assert!(!trade.closed.is_automatic_close);
        assert!(trade.residual.is_none());
        assert_eq!(trade.portfolio.winning_trades, 1);
        assert_eq!(trade.portfolio.total_fees_paid.value(), dec!(1.01));
    }

    #[tokio::test]
    async fn partial_close_splits_record() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("ETH", Side::Short, dec!(0.4), 2))
            .await
            .unwrap();
        let before = h.executor.portfolio(&user).unwrap().balance;

        let trade = h
            .executor
            .close_position(&pos.id, &quote("ETH", dec!(2900)), CloseReason::Manual, dec!(0.4))
            .await
            .unwrap();

        let residual = trade.residual.clone().unwrap();
        assert_eq!(residual.id, pos.id);
        assert_eq!(residual.status, PositionStatus::Open);
        assert_eq!(residual.quantity, dec!(0.24));
        assert_eq!(trade.closed.quantity, dec!(0.16));
        assert_eq!(trade.closed.parent_id, Some(pos.id));
        assert_eq!(trade.closed.close_reason, Some(CloseReason::Partial));
        assert_eq!(
            trade.closed.margin_used.add(residual.margin_used),
            pos.margin_used
        );
        assert_eq!(trade.closed.fees.entry.add(residual.fees.entry), pos.fees.entry);
        assert_eq!(trade.portfolio.balance, before.add(trade.realized_pnl));

        // the stored original is the residual, the slice is its own closed record
        let stored = h.store.get_position(&pos.id).unwrap().unwrap();
        assert_eq!(stored.quantity, dec!(0.24));
        assert_eq!(h.store.recent_closed(&user, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_close_is_benign_race() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 1))
            .await
            .unwrap();

        h.executor
            .close_position(&pos.id, &quote("BTC", dec!(50500)), CloseReason::TakeProfit, Decimal::ONE)
            .await
            .unwrap();
        let balance = h.executor.portfolio(&user).unwrap().balance;

        let err = h
            .executor
            .close_position(&pos.id, &quote("BTC", dec!(50500)), CloseReason::Manual, Decimal::ONE)
            .await
            .unwrap_err();
        assert!(err.is_benign_race());
        assert_eq!(h.executor.portfolio(&user).unwrap().balance, balance);
    }

    #[tokio::test]
    async fn bad_fraction_and_wrong_symbol() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 1))
            .await
            .unwrap();

        for fraction in [dec!(0), dec!(-0.5), dec!(1.01)] {
            let result = h
                .executor
                .close_position(&pos.id, &quote("BTC", dec!(50000)), CloseReason::Manual, fraction)
                .await;
            assert!(matches!(
                result,
                Err(EngineError::Validation(ValidationError::InvalidCloseFraction(_)))
            ));
        }

        let wrong = h
            .executor
            .close_position(&pos.id, &quote("ETH", dec!(3000)), CloseReason::Manual, Decimal::ONE)
            .await;
        assert!(matches!(wrong, Err(EngineError::Validation(ValidationError::InvalidPrice(_)))));
    }

    #[tokio::test]
    async fn close_at_market_uses_fallback_when_feed_down() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 1))
            .await
            .unwrap();

        h.feed.set_healthy(false);
        let trade = h
            .executor
            .close_at_market(&pos.id, CloseReason::Manual, Decimal::ONE)
            .await
            .unwrap();
        assert!(trade.price_fallback);
        assert_eq!(trade.closed.status, PositionStatus::Closed);
        // the fallback carries on from the last live price
        assert_eq!(trade.closed.exit_price.unwrap().value(), dec!(50000));
    }

    #[tokio::test]
    async fn huge_loss_clamps_balance() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Pro).unwrap();
        // value 7500, the pro cap
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Short, dec!(0.0075), 20))
            .await
            .unwrap();

        // no liquidation ran; tripling the price loses twice the value
        let trade = h
            .executor
            .close_position(&pos.id, &quote("BTC", dec!(150000)), CloseReason::Manual, Decimal::ONE)
            .await
            .unwrap();
        assert!(trade.realized_pnl.value() < dec!(-10000));
        assert_eq!(trade.portfolio.balance, Quote::zero());
        assert_eq!(trade.portfolio.losing_trades, 1);
    }

    #[tokio::test]
    async fn liquidation_loss_capped_at_margin() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let liquidated = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.009), 5))
            .await
            .unwrap();
        let manual = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.009), 5))
            .await
            .unwrap();
        let before = h.executor.portfolio(&user).unwrap().balance;

        // gapped far below the 41000 liquidation price: gross loss 900 on 450 margin
        let trade = h
            .executor
            .close_position(&liquidated.id, &quote("BTC", dec!(30000)), CloseReason::Liquidation, Decimal::ONE)
            .await
            .unwrap();
        assert_eq!(trade.realized_pnl.value(), dec!(-450));
        assert_eq!(trade.portfolio.balance, before.add(Quote::new(dec!(-450))));

        let uncapped = h
            .executor
            .close_position(&manual.id, &quote("BTC", dec!(30000)), CloseReason::Manual, Decimal::ONE)
            .await
            .unwrap();
        assert!(uncapped.realized_pnl.value() < dec!(-900));
    }

    /// Delegates to an in-memory store, but portfolio saves can be made to fail.
    struct FlakyStore {
        inner: InMemoryStore,
        fail_saves: AtomicBool,
    }

    impl PositionStore for FlakyStore {
        fn get_portfolio(&self, user_id: &UserId) -> Result<Option<Portfolio>, StoreError> {
            self.inner.get_portfolio(user_id)
        }

        fn create_portfolio(&self, portfolio: Portfolio) -> Result<Portfolio, StoreError> {
            self.inner.create_portfolio(portfolio)
        }

        fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Database("portfolio write failed".to_string()));
            }
            self.inner.save_portfolio(portfolio)
        }

        fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
            self.inner.insert_position(position)
        }

        fn get_position(&self, id: &PositionId) -> Result<Option<Position>, StoreError> {
            self.inner.get_position(id)
        }

        fn delete_position(&self, id: &PositionId) -> Result<(), StoreError> {
            self.inner.delete_position(id)
        }

        fn update_position(&self, position: &Position, expected: PositionStatus) -> Result<(), StoreError> {
            self.inner.update_position(position, expected)
        }

        fn positions_for_user(
            &self,
            user_id: &UserId,
            status: Option<PositionStatus>,
        ) -> Result<Vec<Position>, StoreError> {
            self.inner.positions_for_user(user_id, status)
        }

        fn positions_by_status(&self, status: PositionStatus) -> Result<Vec<Position>, StoreError> {
            self.inner.positions_by_status(status)
        }

        fn recent_closed(&self, user_id: &UserId, limit: usize) -> Result<Vec<Position>, StoreError> {
            self.inner.recent_closed(user_id, limit)
        }
    }

    #[tokio::test]
    async fn failed_credit_leaves_position_open() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            fail_saves: AtomicBool::new(false),
        });
        let executor = executor_on(store.clone());
        let user = UserId::new("alice");
        executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.02), 2))
            .await
            .unwrap();
        let balance = executor.portfolio(&user).unwrap().balance;

        store.fail_saves.store(true, Ordering::SeqCst);
        for fraction in [Decimal::ONE, dec!(0.5)] {
            let err = executor
                .close_position(&pos.id, &quote("BTC", dec!(51000)), CloseReason::Manual, fraction)
                .await
                .unwrap_err();
            assert!(err.is_retryable());

            let stored = executor.position(&pos.id).unwrap();
            assert_eq!(stored.status, PositionStatus::Open);
            assert_eq!(stored.quantity, dec!(0.02));
            assert!(store.recent_closed(&user, 10).unwrap().is_empty());
            assert_eq!(executor.portfolio(&user).unwrap().balance, balance);
        }

        // once the store recovers the same close goes through and pays once
        store.fail_saves.store(false, Ordering::SeqCst);
        let trade = executor
            .close_position(&pos.id, &quote("BTC", dec!(51000)), CloseReason::Manual, Decimal::ONE)
            .await
            .unwrap();
        assert_eq!(trade.portfolio.balance, balance.add(trade.realized_pnl));
        assert_eq!(trade.portfolio.total_trades, 1);
    }

    #[tokio::test]
    async fn failed_fee_debit_undoes_open() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            fail_saves: AtomicBool::new(true),
        });
        let executor = executor_on(store.clone());
        let user = UserId::new("alice");
        executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        let err = executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.positions_for_user(&user, None).unwrap().is_empty());
        assert_eq!(executor.portfolio(&user).unwrap().balance.value(), dec!(10000));
    }
}
