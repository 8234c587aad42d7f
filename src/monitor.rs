// 9.0: risk monitor. every cycle: one mark quote per symbol, refresh open positions,
// close whatever hit a stop, a target, or its liquidation price, then fill crossed limit orders.
// failures on one position never stop the cycle. a simulated fallback mark never closes or fills
// anything on its own; those wait for the live feed.

use crate::executor::{EngineError, FillOutcome, OrderExecutor};
use crate::oracle::{PriceIntent, PriceQuote};
use crate::position::{Position, PositionStatus};
use crate::schedule::PeriodicTask;
use crate::store::PositionStore;
use crate::triggers::evaluate_triggers;
use crate::types::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub symbols_checked: usize,
    pub positions_checked: usize,
    pub closed: usize,
    pub filled: usize,
    // triggers seen on a fallback mark and left for a live one
    pub held: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub is_running: bool,
    pub last_check_time: Option<Timestamp>,
    pub cycles_completed: u64,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Default)]
struct MonitorStats {
    last_check_time: Option<Timestamp>,
    cycles_completed: u64,
    last_cycle: Option<CycleReport>,
}

#[derive(Default)]
struct SymbolBook {
    open: Vec<Position>,
    pending: Vec<Position>,
}

pub struct RiskMonitor {
    executor: Arc<OrderExecutor>,
    task: PeriodicTask,
    stats: Mutex<MonitorStats>,
}

impl RiskMonitor {
    pub fn new(executor: Arc<OrderExecutor>) -> Self {
        Self {
            executor,
            task: PeriodicTask::new("risk monitor"),
            stats: Mutex::new(MonitorStats::default()),
        }
    }

    // 9.1: single pass
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        match self.collect() {
            Ok(books) => {
                for (symbol, book) in books {
                    report.symbols_checked += 1;
                    let quote = match self.executor.oracle().get_price(&symbol, PriceIntent::Mark).await {
                        Ok(quote) => quote,
                        Err(e) => {
                            warn!("No mark price for {}, skipping {} position(s): {}", symbol, book.open.len() + book.pending.len(), e);
                            report.errors += 1;
                            continue;
                        }
                    };
                    self.check_open(&book.open, &quote, &mut report).await;
                    if quote.is_fallback() {
                        debug!("Mark for {} is a fallback, {} limit order(s) wait", symbol, book.pending.len());
                    } else {
                        self.fill_pending(&book.pending, &quote, &mut report).await;
                    }
                }
            }
            Err(e) => {
                warn!("Risk monitor could not list positions: {}", e);
                report.errors += 1;
            }
        }

        let now = self.executor.now();
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.last_check_time = Some(now);
            stats.cycles_completed += 1;
            stats.last_cycle = Some(report.clone());
        }
        if report.closed > 0 || report.filled > 0 || report.held > 0 || report.errors > 0 {
            info!(
                "Risk cycle: {} symbol(s), {} position(s), {} closed, {} filled, {} held, {} error(s)",
                report.symbols_checked,
                report.positions_checked,
                report.closed,
                report.filled,
                report.held,
                report.errors
            );
        } else {
            debug!(
                "Risk cycle: {} symbol(s), {} position(s), nothing triggered",
                report.symbols_checked, report.positions_checked
            );
        }
        report
    }

    // group by symbol so each symbol costs one oracle call
    fn collect(&self) -> Result<BTreeMap<String, SymbolBook>, crate::store::StoreError> {
        let store = self.executor.store();
        let mut books: BTreeMap<String, SymbolBook> = BTreeMap::new();
        for position in store.positions_by_status(PositionStatus::Open)? {
            books.entry(position.symbol.clone()).or_default().open.push(position);
        }
        for order in store.positions_by_status(PositionStatus::Pending)? {
            books.entry(order.symbol.clone()).or_default().pending.push(order);
        }
        Ok(books)
    }

    async fn check_open(&self, positions: &[Position], quote: &PriceQuote, report: &mut CycleReport) {
        let threshold = self.executor.config().risk.liquidation_threshold;
        for position in positions {
            report.positions_checked += 1;
            let refreshed = match self.executor.refresh_price(&position.id, quote.price).await {
                Ok(p) => p,
                Err(e) => {
                    self.note_failure(position, "mark", &e, report);
                    continue;
                }
            };

            let Some(reason) = evaluate_triggers(&refreshed, quote.price, threshold) else {
                continue;
            };
            if quote.is_fallback() {
                warn!(
                    "{:?} on {} held: {} mark {} is simulated while the live feed is down",
                    reason, refreshed.id, refreshed.symbol, quote.price
                );
                report.held += 1;
                continue;
            }
            info!(
                "{:?} triggered on {} {} {} at {}",
                reason, refreshed.symbol, refreshed.side, refreshed.id, quote.price
            );
            match self
                .executor
                .close_position(&refreshed.id, quote, reason, Decimal::ONE)
                .await
            {
                Ok(_) => report.closed += 1,
                Err(e) => self.note_failure(position, "close", &e, report),
            }
        }
    }

    async fn fill_pending(&self, orders: &[Position], quote: &PriceQuote, report: &mut CycleReport) {
        for order in orders {
            match self.executor.fill_pending_order(&order.id, quote).await {
                Ok(FillOutcome::Filled(_)) => report.filled += 1,
                Ok(FillOutcome::NotCrossed) | Ok(FillOutcome::Cancelled(_)) => {}
                Err(e) => self.note_failure(order, "fill", &e, report),
            }
        }
    }

    fn note_failure(&self, position: &Position, step: &str, error: &EngineError, report: &mut CycleReport) {
        if error.is_benign_race() {
            debug!("Monitor {} on {} skipped: {}", step, position.id, error);
        } else {
            report.errors += 1;
            warn!("Monitor {} on {} failed: {}", step, position.id, error);
        }
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let this = self.clone();
        let period = self.executor.config().monitor.interval();
        self.task.start(period, move || {
            let this = this.clone();
            async move {
                this.run_cycle().await;
            }
        })
    }

    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    pub fn status(&self) -> MonitorStatus {
        let stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        MonitorStatus {
            is_running: self.task.is_running(),
            last_check_time: stats.last_check_time,
            cycles_completed: stats.cycles_completed,
            last_cycle: stats.last_cycle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::harness;
    use crate::executor::OpenRequest;
    use crate::portfolio::PrivilegeTier;
    use crate::position::CloseReason;
    use crate::types::{Price, Side, UserId};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn stop_loss_closes_within_one_cycle() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(
                &user,
                OpenRequest::market("BTC", Side::Long, dec!(0.01), 5).with_stop_loss(dec!(49000)),
            )
            .await
            .unwrap();
        let before = h.executor.portfolio(&user).unwrap().balance;

        let monitor = RiskMonitor::new(h.executor.clone());
        h.feed.set_price("BTC", dec!(48500));
        let report = monitor.run_cycle().await;

        assert_eq!(report.closed, 1);
        assert_eq!(report.errors, 0);
        let closed = h.executor.position(&pos.id).unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::StopLoss));
        assert!(closed.is_automatic_close);
        // gross -75, fees 0.50 entry + 0.49 exit
        let realized = closed.realized_pnl.unwrap();
        assert_eq!(realized.value(), dec!(-75.99));
        let after = h.executor.portfolio(&user).unwrap().balance;
        assert_eq!(after, before.add(realized));
        assert_eq!(after.value(), dec!(9923.51));
    }

    #[tokio::test]
    async fn refreshes_marks_and_fills_limits() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Short, dec!(0.01), 2))
            .await
            .unwrap();
        let order = h
            .executor
            .open_position(&user, OpenRequest::limit("ETH", Side::Long, dec!(0.1), 2, dec!(2900)))
            .await
            .unwrap();

        let monitor = RiskMonitor::new(h.executor.clone());
        h.feed.set_price("BTC", dec!(50500));
        let first = monitor.run_cycle().await;
        assert_eq!(first.symbols_checked, 2);
        assert_eq!(first.positions_checked, 1);
        assert_eq!(first.filled, 0);
        assert_eq!(h.executor.position(&pos.id).unwrap().current_price.value(), dec!(50500));

        h.feed.set_price("ETH", dec!(2850));
        let second = monitor.run_cycle().await;
        assert_eq!(second.filled, 1);
        let filled = h.executor.position(&order.id).unwrap();
        assert_eq!(filled.status, PositionStatus::Open);
        assert_eq!(filled.entry_price.value(), dec!(2900));

        let status = monitor.status();
        assert_eq!(status.cycles_completed, 2);
        assert!(!status.is_running);
        assert_eq!(status.last_cycle, Some(second));
    }

    #[tokio::test]
    async fn liquidates_at_threshold() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 5))
            .await
            .unwrap();

        let monitor = RiskMonitor::new(h.executor.clone());
        h.feed.set_price("BTC", dec!(41500));
        assert_eq!(monitor.run_cycle().await.closed, 0);

        h.feed.set_price("BTC", dec!(41000));
        assert_eq!(monitor.run_cycle().await.closed, 1);
        let closed = h.executor.position(&pos.id).unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::Liquidation));
    }

    #[tokio::test]
    async fn feed_outage_falls_back_for_marks() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        h.executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 2))
            .await
            .unwrap();

        h.feed.set_healthy(false);
        let monitor = RiskMonitor::new(h.executor.clone());
        let report = monitor.run_cycle().await;
        assert_eq!(report.symbols_checked, 1);
        assert_eq!(report.positions_checked, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn outage_away_from_base_price_closes_nothing() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        h.feed.set_price("BTC", dec!(65000));
        // liquidation price 53300, far above the 50000 base
        let pos = h
            .executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.0075), 5))
            .await
            .unwrap();
        let balance = h.executor.portfolio(&user).unwrap().balance;

        h.feed.set_healthy(false);
        let monitor = RiskMonitor::new(h.executor.clone());
        let report = monitor.run_cycle().await;
        assert_eq!(report.closed, 0);
        assert_eq!(report.errors, 0);

        let still_open = h.executor.position(&pos.id).unwrap();
        assert_eq!(still_open.status, PositionStatus::Open);
        assert_eq!(still_open.current_price.value(), dec!(65000));
        assert_eq!(h.executor.portfolio(&user).unwrap().balance, balance);
    }

    #[tokio::test]
    async fn fallback_mark_holds_triggers_until_live() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        let pos = h
            .executor
            .open_position(
                &user,
                OpenRequest::market("BTC", Side::Long, dec!(0.01), 2).with_stop_loss(dec!(49000)),
            )
            .await
            .unwrap();
        let order = h
            .executor
            .open_position(&user, OpenRequest::limit("BTC", Side::Long, dec!(0.01), 1, dec!(48000)))
            .await
            .unwrap();

        // the simulator wanders through both the stop and the limit while the feed is out
        h.feed.set_healthy(false);
        h.executor
            .oracle()
            .simulator()
            .set_price("BTC", Price::new_unchecked(dec!(47000)));
        let monitor = RiskMonitor::new(h.executor.clone());
        let held = monitor.run_cycle().await;
        assert_eq!(held.closed, 0);
        assert_eq!(held.filled, 0);
        assert_eq!(held.held, 1);
        assert_eq!(h.executor.position(&pos.id).unwrap().status, PositionStatus::Open);
        assert_eq!(h.executor.position(&order.id).unwrap().status, PositionStatus::Pending);

        h.feed.set_healthy(true);
        h.feed.set_price("BTC", dec!(48500));
        let live = monitor.run_cycle().await;
        assert_eq!(live.closed, 1);
        assert_eq!(
            h.executor.position(&pos.id).unwrap().close_reason,
            Some(CloseReason::StopLoss)
        );
    }
}
