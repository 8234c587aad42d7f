// 11.0: every state change produces an event. used for the audit trail a portfolio page shows
// and for checking what the background loops did. the EventPayload enum lists all event types.
// the log is bounded: oldest events drop off once `capacity` is reached.

use crate::oracle::PriceSource;
use crate::position::CloseReason;
use crate::types::{Leverage, PositionId, Price, Quote, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Order events
    OrderPlaced(OrderPlacedEvent),
    OrderFilled(OrderFilledEvent),
    OrderCancelled(OrderCancelledEvent),

    // Position events
    PositionOpened(PositionOpenedEvent),
    PositionClosed(PositionClosedEvent),
    StopsUpdated(StopsUpdatedEvent),

    // Account events
    FundingCharged(FundingChargedEvent),

    // Price events
    PriceFallback(PriceFallbackEvent),
}

impl EventPayload {
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            EventPayload::OrderPlaced(e) => Some(&e.user_id),
            EventPayload::OrderFilled(e) => Some(&e.user_id),
            EventPayload::OrderCancelled(e) => Some(&e.user_id),
            EventPayload::PositionOpened(e) => Some(&e.user_id),
            EventPayload::PositionClosed(e) => Some(&e.user_id),
            EventPayload::StopsUpdated(e) => Some(&e.user_id),
            EventPayload::FundingCharged(e) => Some(&e.user_id),
            EventPayload::PriceFallback(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Price,
    pub leverage: Leverage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilledEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub fill_price: Price,
    pub fee: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub reason: CancelReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    UserRequested,
    InsufficientMargin,
    PositionSizeExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Price,
    pub margin_used: Quote,
    pub leverage: Leverage,
    pub fee: Quote,
    // at the unslipped quote, so it starts negative by the fill cost
    pub unrealized_pnl: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position_id: PositionId,
    // the open record a partial close was carved from
    pub parent_id: Option<PositionId>,
    pub user_id: UserId,
    pub symbol: String,
    pub quantity: Decimal,
    pub exit_price: Price,
    pub realized_pnl: Quote,
    pub new_balance: Quote,
    pub close_reason: CloseReason,
    pub price_source: PriceSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopsUpdatedEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingChargedEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub periods: u32,
    pub fee: Quote,
    pub new_balance: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceFallbackEvent {
    pub symbol: String,
    pub price: Price,
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, timestamp: Timestamp, payload: EventPayload);
}

#[derive(Debug, Default)]
struct LogState {
    events: VecDeque<Event>,
    next_id: u64,
}

/// Bounded in-memory event log shared by the executor and the background loops.
#[derive(Debug)]
pub struct EventLog {
    state: Mutex<LogState>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                events: VecDeque::with_capacity(capacity.min(1_024)),
                next_id: 1,
            }),
            capacity: capacity.max(1),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LogState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        self.with_state(|s| s.events.iter().rev().take(limit).cloned().collect())
    }

    /// Newest first, only events about `user_id`.
    pub fn recent_for_user(&self, user_id: &UserId, limit: usize) -> Vec<Event> {
        self.with_state(|s| {
            s.events
                .iter()
                .rev()
                .filter(|e| e.payload.user_id() == Some(user_id))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.with_state(|s| s.events.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventEmitter for EventLog {
    fn emit(&self, timestamp: Timestamp, payload: EventPayload) {
        let capacity = self.capacity;
        self.with_state(|s| {
            let id = EventId(s.next_id);
            s.next_id += 1;
            if s.events.len() == capacity {
                s.events.pop_front();
            }
            s.events.push_back(Event::new(id, timestamp, payload));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fallback(symbol: &str) -> EventPayload {
        EventPayload::PriceFallback(PriceFallbackEvent {
            symbol: symbol.to_string(),
            price: Price::new_unchecked(dec!(100)),
        })
    }

    #[test]
    fn event_log_is_bounded() {
        let log = EventLog::new(2);
        log.emit(Timestamp::from_millis(1), fallback("A"));
        log.emit(Timestamp::from_millis(2), fallback("B"));
        log.emit(Timestamp::from_millis(3), fallback("C"));

        let events = log.recent(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, EventId(3));
        assert_eq!(events[1].id, EventId(2));
    }

    #[test]
    fn filter_by_user() {
        let log = EventLog::new(10);
        let alice = UserId::new("alice");
        log.emit(Timestamp::from_millis(1), fallback("BTC"));
        log.emit(
            Timestamp::from_millis(2),
            EventPayload::OrderCancelled(OrderCancelledEvent {
                position_id: PositionId::generate(),
                user_id: alice.clone(),
                reason: CancelReason::UserRequested,
            }),
        );

        assert_eq!(log.recent_for_user(&alice, 10).len(), 1);
        assert!(log.recent_for_user(&UserId::new("bob"), 10).is_empty());
        assert_eq!(log.len(), 2);
    }
}
