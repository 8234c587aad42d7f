//! Portfolio and balance bookkeeping.
//!
//! One portfolio per user. `balance` is free cash only: it never includes
//! unrealized P&L and never goes below zero. Reserved margin is not moved out
//! of the balance, it is checked against it when a position opens.

use crate::types::{round_money, Leverage, Quote, Timestamp, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Privilege tier granted at unlock. Caps position size and leverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTier {
    #[default]
    Standard,
    Premium,
    Pro,
}

impl PrivilegeTier {
    /// Largest share of the balance a single position's value may take.
    pub fn max_position_size_fraction(&self) -> Decimal {
        match self {
            PrivilegeTier::Standard => dec!(0.25),
            PrivilegeTier::Premium => dec!(0.50),
            PrivilegeTier::Pro => dec!(0.75),
        }
    }

    pub fn max_leverage(&self) -> Leverage {
        let cap = match self {
            PrivilegeTier::Standard => 5,
            PrivilegeTier::Premium => 10,
            PrivilegeTier::Pro => 20,
        };
        Leverage::new(cap).unwrap_or(Leverage::ONE)
    }
}

impl fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrivilegeTier::Standard => "standard",
            PrivilegeTier::Premium => "premium",
            PrivilegeTier::Pro => "pro",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub user_id: UserId,
    pub balance: Quote,
    pub initial_balance: Quote,
    pub tier: PrivilegeTier,
    pub max_position_size_fraction: Decimal,
    pub max_leverage: Leverage,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_profit: Quote,
    pub total_loss: Quote,
    pub total_fees_paid: Quote,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Portfolio {
    pub fn new(user_id: UserId, tier: PrivilegeTier, initial_balance: Quote, timestamp: Timestamp) -> Self {
        Self {
            user_id,
            balance: initial_balance,
            initial_balance,
            tier,
            max_position_size_fraction: tier.max_position_size_fraction(),
            max_leverage: tier.max_leverage(),
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_profit: Quote::zero(),
            total_loss: Quote::zero(),
            total_fees_paid: Quote::zero(),
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Largest value (margin times leverage) a single new position may carry.
    pub fn max_position_value(&self) -> Quote {
        Quote::new(round_money(self.balance.value() * self.max_position_size_fraction))
    }

    /// Adds `delta` to the balance, flooring at zero.
    /// Returns the part of a loss the balance could not cover (zero when none).
    pub fn apply_balance_change(&mut self, delta: Quote, timestamp: Timestamp) -> Quote {
        let next = self.balance.add(delta).rounded();
        self.updated_at = timestamp;
        if next.is_negative() {
            self.balance = Quote::zero();
            next.abs()
        } else {
            self.balance = next;
            Quote::zero()
        }
    }

    pub fn charge_fee(&mut self, fee: Quote, timestamp: Timestamp) -> Quote {
        self.total_fees_paid = self.total_fees_paid.add(fee);
        self.apply_balance_change(fee.negate(), timestamp)
    }

    // one close record = one trade. zero pnl counts as neither win nor loss
    pub fn record_trade(&mut self, realized_pnl: Quote, exit_fee: Quote) {
        self.total_trades += 1;
        self.total_fees_paid = self.total_fees_paid.add(exit_fee);
        if realized_pnl.value() > Decimal::ZERO {
            self.winning_trades += 1;
            self.total_profit = self.total_profit.add(realized_pnl);
        } else if realized_pnl.is_negative() {
            self.losing_trades += 1;
            self.total_loss = self.total_loss.add(realized_pnl.abs());
        }
    }

    pub fn stats(&self) -> PortfolioStats {
        let pct = |num: Decimal, den: u64| {
            if den == 0 {
                Decimal::ZERO
            } else {
                round_money(num / Decimal::from(den) * dec!(100))
            }
        };
        let avg = |sum: Quote, n: u64| {
            if n == 0 {
                Quote::zero()
            } else {
                Quote::new(round_money(sum.value() / Decimal::from(n)))
            }
        };

        let total_return_pct = if self.initial_balance.value() <= Decimal::ZERO {
            Decimal::ZERO
        } else {
            round_money(
                (self.balance.value() - self.initial_balance.value()) / self.initial_balance.value()
                    * dec!(100),
            )
        };

        PortfolioStats {
            total_trades: self.total_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            win_rate: pct(Decimal::from(self.winning_trades), self.total_trades),
            average_win: avg(self.total_profit, self.winning_trades),
            average_loss: avg(self.total_loss, self.losing_trades),
            total_fees_paid: self.total_fees_paid,
            total_return_pct,
        }
    }
}

/// Derived on read, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioStats {
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate: Decimal,
    pub average_win: Quote,
    pub average_loss: Quote,
    pub total_fees_paid: Quote,
    pub total_return_pct: Decimal,
}
