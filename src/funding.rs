// 5.0: funding. leveraged positions pay a holding fee per whole period held:
// fee = position_value * rate * periods. nothing is charged for a fractional period.
// 5.1 has the period/fee math, 5.2 the accrual loop that applies it.

use crate::executor::OrderExecutor;
use crate::schedule::PeriodicTask;
use crate::store::PositionStore;
use crate::position::PositionStatus;
use crate::types::{round_money, Quote, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// 5.1: whole periods between the watermark and now
pub fn funding_periods_due(watermark: Timestamp, now: Timestamp, period_millis: i64) -> u32 {
    if period_millis <= 0 {
        return 0;
    }
    let periods = now.millis_since(watermark) / period_millis;
    u32::try_from(periods).unwrap_or(u32::MAX)
}

pub fn funding_fee(position_value: Quote, rate: Decimal, periods: u32) -> Quote {
    Quote::new(round_money(position_value.value() * rate * Decimal::from(periods)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingReport {
    pub positions_checked: usize,
    pub charged: usize,
    pub total_fees: Quote,
    pub errors: usize,
}

// 5.2: accrual loop
pub struct FundingAccrual {
    executor: Arc<OrderExecutor>,
    task: PeriodicTask,
}

impl FundingAccrual {
    pub fn new(executor: Arc<OrderExecutor>) -> Self {
        Self {
            executor,
            task: PeriodicTask::new("funding accrual"),
        }
    }

    /// One pass over every open leveraged position. A failure on one
    /// position is logged and the pass moves on.
    pub async fn run_once(&self, now: Timestamp) -> FundingReport {
        let mut report = FundingReport::default();
        let open = match self.executor.store().positions_by_status(PositionStatus::Open) {
            Ok(positions) => positions,
            Err(e) => {
                warn!("Funding pass could not list open positions: {}", e);
                report.errors += 1;
                return report;
            }
        };

        for position in open.iter().filter(|p| p.leverage.is_leveraged()) {
            report.positions_checked += 1;
            match self.executor.charge_funding(&position.id, now).await {
                Ok(Some(charge)) => {
                    report.charged += 1;
                    report.total_fees = report.total_fees.add(charge.fee);
                }
                Ok(None) => {}
                Err(e) if e.is_benign_race() => debug!("Funding on {} skipped: {}", position.id, e),
                Err(e) => {
                    report.errors += 1;
                    warn!("Funding on {} failed: {}", position.id, e);
                }
            }
        }

        if report.charged > 0 {
            info!(
                "Funding pass charged {} position(s), {} total",
                report.charged, report.total_fees
            );
        }
        report
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let this = self.clone();
        let period = self.executor.config().monitor.funding_interval();
        self.task.start(period, move || {
            let this = this.clone();
            async move {
                let now = this.executor.now();
                this.run_once(now).await;
            }
        })
    }

    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::harness;
    use crate::executor::OpenRequest;
    use crate::portfolio::PrivilegeTier;
    use crate::types::{Side, UserId};
    use rust_decimal_macros::dec;

    const HOUR: i64 = 3_600_000;

    #[test]
    fn periods_round_down() {
        let t0 = Timestamp::from_millis(0);
        assert_eq!(funding_periods_due(t0, Timestamp::from_millis(8 * HOUR - 1), 8 * HOUR), 0);
        assert_eq!(funding_periods_due(t0, Timestamp::from_millis(8 * HOUR), 8 * HOUR), 1);
        assert_eq!(funding_periods_due(t0, Timestamp::from_millis(25 * HOUR), 8 * HOUR), 3);
        // clock behind the watermark
        assert_eq!(funding_periods_due(Timestamp::from_millis(HOUR), t0, 8 * HOUR), 0);
        assert_eq!(funding_periods_due(t0, Timestamp::from_millis(HOUR), 0), 0);
    }

    #[test]
    fn fee_scales_with_periods() {
        let value = Quote::new(dec!(10000));
        assert_eq!(funding_fee(value, dec!(0.0001), 1).value(), dec!(1.00));
        assert_eq!(funding_fee(value, dec!(0.0001), 3).value(), dec!(3.00));
        assert_eq!(funding_fee(Quote::new(dec!(1234.56)), dec!(0.0001), 1).value(), dec!(0.12));
        assert!(funding_fee(value, dec!(0.0001), 0).is_zero());
    }

    #[tokio::test]
    async fn second_pass_in_window_charges_nothing() {
        let h = harness();
        let user = UserId::new("alice");
        h.executor.unlock_portfolio(&user, PrivilegeTier::Standard).unwrap();
        h.executor
            .open_position(&user, OpenRequest::market("BTC", Side::Long, dec!(0.01), 5))
            .await
            .unwrap();
        h.executor
            .open_position(&user, OpenRequest::market("ETH", Side::Short, dec!(0.1), 1))
            .await
            .unwrap();

        let accrual = FundingAccrual::new(h.executor.clone());
        h.clock.advance_hours(9);

        let first = accrual.run_once(h.executor.now()).await;
        assert_eq!(first.positions_checked, 1); // the 1x short is skipped
        assert_eq!(first.charged, 1);
        assert_eq!(first.total_fees.value(), dec!(0.25));

        h.clock.advance_hours(1);
        let second = accrual.run_once(h.executor.now()).await;
        assert_eq!(second.charged, 0);
        assert_eq!(second.errors, 0);
    }

    #[tokio::test]
    async fn start_stop() {
        let h = harness();
        let accrual = Arc::new(FundingAccrual::new(h.executor.clone()));
        assert!(accrual.start());
        assert!(accrual.is_running());
        assert!(accrual.stop().await);
        assert!(!accrual.is_running());
    }
}
