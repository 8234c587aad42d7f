// 12.0: sandbox engine. the composition root: builds the oracle, executor and background
// loops from one config, and is the only surface callers use. every call is scoped to a
// user id; a position owned by someone else looks exactly like one that doesn't exist.

use crate::asset::AssetRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::events::Event;
use crate::executor::{ClosedTrade, EngineError, OpenRequest, OrderExecutor};
use crate::funding::{FundingAccrual, FundingReport};
use crate::monitor::{CycleReport, MonitorStatus, RiskMonitor};
use crate::oracle::{HttpMarketData, MarketDataSource, PriceOracle};
use crate::portfolio::{Portfolio, PortfolioStats, PrivilegeTier};
use crate::position::{CloseReason, Position, PositionStatus};
use crate::simulator::PriceSimulator;
use crate::store::{InMemoryStore, PositionStore};
use crate::triggers::liquidation_price;
use crate::types::{PositionId, Price, Quote, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// An open position valued at its last observed price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub position: Position,
    pub unrealized_pnl: Quote,
    pub unrealized_pnl_pct: Decimal,
    pub liquidation_price: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub balance: Quote,
    /// Balance plus unrealized P&L at each position's mark, before exit fees.
    pub equity: Quote,
    pub margin_used: Quote,
    pub available_margin: Quote,
    pub unrealized_pnl: Quote,
    pub open_positions: Vec<PositionView>,
    pub pending_orders: Vec<Position>,
    pub recent_closed: Vec<Position>,
    pub stats: PortfolioStats,
}

pub struct SandboxEngine {
    executor: Arc<OrderExecutor>,
    monitor: Arc<RiskMonitor>,
    funding: Arc<FundingAccrual>,
}

impl SandboxEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PositionStore>,
        live: Option<Arc<dyn MarketDataSource>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::with_assets(config, store, live, clock, AssetRegistry::default())
    }

    pub fn with_assets(
        config: EngineConfig,
        store: Arc<dyn PositionStore>,
        live: Option<Arc<dyn MarketDataSource>>,
        clock: Arc<dyn Clock>,
        assets: AssetRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let assets = Arc::new(assets);
        let simulator = Arc::new(PriceSimulator::new(
            assets.clone(),
            clock.clone(),
            config.oracle.simulator_seed,
        ));
        // a configured endpoint stands in when the caller brings no feed of its own
        let live = match (live, &config.oracle.endpoint) {
            (Some(feed), _) => Some(feed),
            (None, Some(endpoint)) => {
                let http = HttpMarketData::new(endpoint.clone(), config.oracle.timeout())
                    .map_err(|e| ConfigError::InvalidOracle { reason: e.to_string() })?;
                Some(Arc::new(http) as Arc<dyn MarketDataSource>)
            }
            (None, None) => None,
        };
        let oracle = Arc::new(PriceOracle::new(
            live,
            simulator,
            assets.clone(),
            clock.clone(),
            config.oracle.timeout(),
            config.oracle.allow_simulated_open,
        ));
        let events = Arc::new(crate::events::EventLog::new(config.max_events));

        info!(
            "Sandbox engine ready: {} assets, live feed {}, simulated opens {}",
            assets.len(),
            if oracle.has_live_feed() { "on" } else { "off" },
            if config.oracle.allow_simulated_open { "allowed" } else { "refused" },
        );

        let executor = Arc::new(OrderExecutor::new(store, oracle, clock, assets, events, config));
        Ok(Self {
            monitor: Arc::new(RiskMonitor::new(executor.clone())),
            funding: Arc::new(FundingAccrual::new(executor.clone())),
            executor,
        })
    }

    /// In-memory store and wall clock.
    pub fn in_memory(config: EngineConfig, live: Option<Arc<dyn MarketDataSource>>) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(InMemoryStore::new()), live, Arc::new(SystemClock))
    }

    pub fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    pub fn unlock_portfolio(&self, user_id: &UserId, tier: PrivilegeTier) -> Result<Portfolio, EngineError> {
        self.executor.unlock_portfolio(user_id, tier)
    }

    pub async fn open_position(&self, user_id: &UserId, request: OpenRequest) -> Result<Position, EngineError> {
        self.executor.open_position(user_id, request).await
    }

    /// Manual close at market. `None` closes everything.
    pub async fn close_position(
        &self,
        user_id: &UserId,
        position_id: &PositionId,
        close_fraction: Option<Decimal>,
    ) -> Result<ClosedTrade, EngineError> {
        self.owned(user_id, position_id)?;
        self.executor
            .close_at_market(position_id, CloseReason::Manual, close_fraction.unwrap_or(Decimal::ONE))
            .await
    }

    pub async fn cancel_order(&self, user_id: &UserId, order_id: &PositionId) -> Result<Position, EngineError> {
        self.owned(user_id, order_id)?;
        self.executor.cancel_pending_order(order_id).await
    }

    pub async fn update_stops(
        &self,
        user_id: &UserId,
        position_id: &PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<Position, EngineError> {
        self.owned(user_id, position_id)?;
        self.executor.update_stops(position_id, stop_loss, take_profit).await
    }

    pub fn get_position(&self, user_id: &UserId, position_id: &PositionId) -> Result<Position, EngineError> {
        self.owned(user_id, position_id)
    }

    pub fn get_portfolio_snapshot(&self, user_id: &UserId) -> Result<PortfolioSnapshot, EngineError> {
        let portfolio = self.executor.portfolio(user_id)?;
        let store = self.executor.store();
        let threshold = self.executor.config().risk.liquidation_threshold;

        let mut open_positions = Vec::new();
        for position in store.positions_for_user(user_id, Some(PositionStatus::Open))? {
            let unrealized_pnl = position.unrealized_pnl(position.current_price)?;
            let unrealized_pnl_pct = position.unrealized_pnl_pct(position.current_price)?;
            open_positions.push(PositionView {
                liquidation_price: liquidation_price(position.side, position.entry_price, position.leverage, threshold),
                unrealized_pnl,
                unrealized_pnl_pct,
                position,
            });
        }
        let pending_orders = store.positions_for_user(user_id, Some(PositionStatus::Pending))?;
        let recent_closed = store.recent_closed(user_id, self.executor.config().recent_closed_limit)?;

        let margin_used: Quote = open_positions.iter().map(|v| v.position.margin_used).sum();
        let unrealized_pnl: Quote = open_positions.iter().map(|v| v.unrealized_pnl).sum();
        let equity = portfolio.balance.add(unrealized_pnl);
        let available = portfolio.balance.sub(margin_used);
        let available_margin = if available.is_negative() { Quote::zero() } else { available };

        Ok(PortfolioSnapshot {
            balance: portfolio.balance,
            equity: equity.rounded(),
            margin_used,
            available_margin,
            unrealized_pnl: unrealized_pnl.rounded(),
            open_positions,
            pending_orders,
            recent_closed,
            stats: portfolio.stats(),
        })
    }

    pub fn start_risk_monitor(&self) -> bool {
        self.monitor.start()
    }

    pub async fn stop_risk_monitor(&self) -> bool {
        self.monitor.stop().await
    }

    pub fn get_monitor_status(&self) -> MonitorStatus {
        self.monitor.status()
    }

    pub async fn run_risk_cycle(&self) -> CycleReport {
        self.monitor.run_cycle().await
    }

    pub fn start_funding_accrual(&self) -> bool {
        self.funding.start()
    }

    pub async fn stop_funding_accrual(&self) -> bool {
        self.funding.stop().await
    }

    pub fn is_funding_running(&self) -> bool {
        self.funding.is_running()
    }

    pub async fn run_funding_pass(&self) -> FundingReport {
        self.funding.run_once(self.executor.now()).await
    }

    /// Newest first.
    pub fn events(&self, limit: usize) -> Vec<Event> {
        self.executor.events().recent(limit)
    }

    pub fn user_events(&self, user_id: &UserId, limit: usize) -> Vec<Event> {
        self.executor.events().recent_for_user(user_id, limit)
    }

    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.funding.stop().await;
    }

    fn owned(&self, user_id: &UserId, position_id: &PositionId) -> Result<Position, EngineError> {
        let position = self.executor.position(position_id)?;
        if &position.user_id != user_id {
            return Err(EngineError::PositionNotFound(*position_id));
        }
        Ok(position)
    }
}
