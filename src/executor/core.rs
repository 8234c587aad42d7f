// 8.0 executor/core.rs: the executor struct, per-portfolio locks, shared checks.
// every balance read-compute-write happens under the owning user's lock.

use super::results::{EngineError, ValidationError};
use crate::asset::{AssetConfig, AssetRegistry};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::events::{EventEmitter, EventLog, EventPayload};
use crate::oracle::PriceOracle;
use crate::portfolio::{Portfolio, PrivilegeTier};
use crate::position::{Position, PositionStatus};
use crate::store::PositionStore;
use crate::types::{PositionId, Price, Quote, Timestamp, UserId};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

/** 8.1: executor struct. state lives in the store, the executor only coordinates */
pub struct OrderExecutor {
    pub(super) store: Arc<dyn PositionStore>,
    pub(super) oracle: Arc<PriceOracle>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) assets: Arc<AssetRegistry>,
    pub(super) events: Arc<EventLog>,
    pub(super) config: EngineConfig,
    pub(super) locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl OrderExecutor {
    pub fn new(
        store: Arc<dyn PositionStore>,
        oracle: Arc<PriceOracle>,
        clock: Arc<dyn Clock>,
        assets: Arc<AssetRegistry>,
        events: Arc<EventLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            oracle,
            clock,
            assets,
            events,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    pub fn oracle(&self) -> &Arc<PriceOracle> {
        &self.oracle
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // creates the portfolio on first call, returns the existing one after that
    pub fn unlock_portfolio(&self, user_id: &UserId, tier: PrivilegeTier) -> Result<Portfolio, EngineError> {
        if let Some(existing) = self.store.get_portfolio(user_id)? {
            return Ok(existing);
        }
        let fresh = Portfolio::new(
            user_id.clone(),
            tier,
            Quote::new(self.config.initial_balance),
            self.clock.now(),
        );
        let stored = self.store.create_portfolio(fresh)?;
        info!("Unlocked {} portfolio for {} with balance {}", stored.tier, user_id, stored.balance);
        Ok(stored)
    }

    pub fn portfolio(&self, user_id: &UserId) -> Result<Portfolio, EngineError> {
        self.store
            .get_portfolio(user_id)?
            .ok_or_else(|| EngineError::PortfolioNotFound(user_id.clone()))
    }

    pub fn position(&self, position_id: &PositionId) -> Result<Position, EngineError> {
        self.store
            .get_position(position_id)?
            .ok_or(EngineError::PositionNotFound(*position_id))
    }

    // one mutex per user, created lazily. the map entry is released before awaiting
    pub(super) async fn lock_portfolio(&self, user_id: &UserId) -> PortfolioGuard<'_> {
        let lock = self
            .locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        PortfolioGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.locks,
            user_id: user_id.clone(),
        }
    }

    pub(super) fn asset(&self, symbol: &str) -> Result<&AssetConfig, ValidationError> {
        self.assets
            .get(symbol)
            .ok_or_else(|| ValidationError::UnsupportedSymbol(symbol.to_string()))
    }

    // size cap on the leveraged value first, then total committed margin plus the fee about to be charged
    pub(super) fn check_margin(
        &self,
        portfolio: &Portfolio,
        margin: Quote,
        value: Quote,
        fee: Quote,
    ) -> Result<(), EngineError> {
        let max = portfolio.max_position_value();
        if value > max {
            return Err(EngineError::PositionSizeExceeded { value, max });
        }

        let committed: Quote = self
            .store
            .positions_for_user(&portfolio.user_id, Some(PositionStatus::Open))?
            .iter()
            .map(|p| p.margin_used)
            .sum();
        let required = margin.add(committed).add(fee);
        if required > portfolio.balance {
            return Err(EngineError::InsufficientMargin {
                required,
                available: portfolio.balance,
            });
        }
        Ok(())
    }

    pub(super) fn emit(&self, payload: EventPayload) {
        self.events.emit(self.clock.now(), payload);
    }
}

/// Holds a user's lock. On release the map entry goes too, unless another
/// caller still holds or waits on the same mutex.
pub(super) struct PortfolioGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<UserId, Arc<Mutex<()>>>,
    user_id: UserId,
}

impl Drop for PortfolioGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // the map's own Arc is the last one: nobody queued behind us
        self.locks.remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub(super) fn positive_price(value: Decimal, what: &str) -> Result<Price, ValidationError> {
    Price::new(value).ok_or_else(|| ValidationError::InvalidPrice(format!("{what} must be positive, got {value}")))
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn unlock_is_idempotent() {
        let h = harness();
        let user = UserId::new("alice");
        let first = h.executor.unlock_portfolio(&user, PrivilegeTier::Premium).unwrap();
        let again = h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        assert_eq!(first.balance.value(), dec!(10000));
        assert_eq!(again.tier, PrivilegeTier::Premium);
    }

    #[test]
    fn margin_checks() {
        let h = harness();
        let user = UserId::new("alice");
        let portfolio = h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();

        // standard tier: position value up to 25% of 10000, whatever the margin
        assert!(h
            .executor
            .check_margin(&portfolio, Quote::new(dec!(500)), Quote::new(dec!(2500)), Quote::zero())
            .is_ok());
        assert!(matches!(
            h.executor
                .check_margin(&portfolio, Quote::new(dec!(500.01)), Quote::new(dec!(2500.05)), Quote::zero()),
            Err(EngineError::PositionSizeExceeded { .. })
        ));
        // 0.045 BTC at 5x: margin 2250 is under the cap, value 11250 is not
        assert!(matches!(
            h.executor
                .check_margin(&portfolio, Quote::new(dec!(2250)), Quote::new(dec!(11250)), Quote::zero()),
            Err(EngineError::PositionSizeExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn lock_entries_are_released() {
        let h = harness();
        let user = UserId::new("alice");
        {
            let _guard = h.executor.lock_portfolio(&user).await;
            assert!(h.executor.locks.contains_key(&user));
        }
        assert!(h.executor.locks.is_empty());
    }

    #[tokio::test]
    async fn queued_waiter_keeps_lock_entry() {
        let h = harness();
        let user = UserId::new("alice");
        let first = h.executor.lock_portfolio(&user).await;

        let executor = h.executor.clone();
        let waiter_user = user.clone();
        let waiter = tokio::spawn(async move {
            let _guard = executor.lock_portfolio(&waiter_user).await;
        });
        // let the waiter clone the mutex and queue on it
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(first);
        assert!(h.executor.locks.contains_key(&user));

        waiter.await.unwrap();
        assert!(h.executor.locks.is_empty());
    }

    #[test]
    fn unknown_position_and_portfolio() {
        let h = harness();
        assert!(matches!(
            h.executor.portfolio(&UserId::new("ghost")),
            Err(EngineError::PortfolioNotFound(_))
        ));
        assert!(matches!(
            h.executor.position(&PositionId::generate()),
            Err(EngineError::PositionNotFound(_))
        ));
    }
}
