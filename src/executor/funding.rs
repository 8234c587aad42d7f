//! Holding fees on leveraged positions.

use super::core::OrderExecutor;
use super::results::{EngineError, FundingCharge};
use crate::events::{EventPayload, FundingChargedEvent};
use crate::funding::{funding_fee, funding_periods_due};
use crate::position::PositionStatus;
use crate::types::{PositionId, Timestamp};
use tracing::{debug, info, warn};

impl OrderExecutor {
    /// Charge every whole funding period elapsed since the position's watermark.
    ///
    /// Returns `None` when nothing is due: unleveraged, not open, or still
    /// inside the current period. The watermark moves by whole periods only,
    /// so a partial period carries over to the next pass.
    pub async fn charge_funding(
        &self,
        position_id: &PositionId,
        now: Timestamp,
    ) -> Result<Option<FundingCharge>, EngineError> {
        let snapshot = self.position(position_id)?;
        if !snapshot.is_open() || !snapshot.leverage.is_leveraged() {
            return Ok(None);
        }
        let _guard = self.lock_portfolio(&snapshot.user_id).await;

        let mut position = self.position(position_id)?;
        if !position.is_open() {
            debug!("Funding skipped for {}: status {}", position.id, position.status);
            return Ok(None);
        }
        let Some(watermark) = position.funding_watermark() else {
            return Ok(None);
        };

        let period_millis = self.config.funding.period_millis();
        let periods = funding_periods_due(watermark, now, period_millis);
        if periods == 0 {
            return Ok(None);
        }
        let fee = funding_fee(position.position_value, self.config.funding.rate, periods);

        position.fees = position.fees.with_funding(fee);
        position.last_funding_time = Some(watermark.plus_millis(period_millis * i64::from(periods)));
        self.store
            .update_position(&position, PositionStatus::Open)
            .map_err(EngineError::transition("charge funding on"))?;

        let mut portfolio = self.portfolio(&position.user_id)?;
        let uncovered = portfolio.charge_fee(fee, self.clock.now());
        if !uncovered.is_zero() {
            warn!(
                "Funding on {} exceeded balance of {}; {} uncovered, balance clamped to 0",
                position.id, position.user_id, uncovered
            );
        }
        self.store.save_portfolio(&portfolio)?;

        info!(
            "Funding {} charged on {} {} ({} period(s)), balance {}",
            fee, position.symbol, position.id, periods, portfolio.balance
        );
        self.emit(EventPayload::FundingCharged(FundingChargedEvent {
            position_id: position.id,
            user_id: position.user_id.clone(),
            periods,
            fee,
            new_balance: portfolio.balance,
        }));

        Ok(Some(FundingCharge {
            position_id: position.id,
            user_id: position.user_id,
            periods,
            fee,
            new_balance: portfolio.balance,
        }))
    }
}
