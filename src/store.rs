//! Persistence boundary.
//!
//! `PositionStore` is the only way the engine touches stored state. Position
//! writes are conditional on the status the caller last saw, so two writers
//! racing on one record cannot both commit a transition out of `open`.
//! `InMemoryStore` backs tests and the simulator binary.

use crate::portfolio::Portfolio;
use crate::position::{Position, PositionStatus};
use crate::types::{PositionId, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Status conflict: expected {expected}, found {actual}")]
    Conflict {
        expected: PositionStatus,
        actual: PositionStatus,
    },

    #[error("Database error: {0}")]
    Database(String),
}

pub trait PositionStore: Send + Sync {
    fn get_portfolio(&self, user_id: &UserId) -> Result<Option<Portfolio>, StoreError>;

    /// Inserts only when absent. Returns whichever portfolio is stored afterwards.
    fn create_portfolio(&self, portfolio: Portfolio) -> Result<Portfolio, StoreError>;

    fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StoreError>;

    fn insert_position(&self, position: &Position) -> Result<(), StoreError>;

    fn get_position(&self, id: &PositionId) -> Result<Option<Position>, StoreError>;

    /// Removes a record. Only used to undo an insert whose follow-up write failed.
    fn delete_position(&self, id: &PositionId) -> Result<(), StoreError>;

    /// Replaces the stored record only if its status is still `expected`.
    fn update_position(&self, position: &Position, expected: PositionStatus) -> Result<(), StoreError>;

    fn positions_for_user(
        &self,
        user_id: &UserId,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, StoreError>;

    fn positions_by_status(&self, status: PositionStatus) -> Result<Vec<Position>, StoreError>;

    /// Most recently closed first.
    fn recent_closed(&self, user_id: &UserId, limit: usize) -> Result<Vec<Position>, StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    portfolios: Arc<DashMap<UserId, Portfolio>>,
    positions: Arc<DashMap<PositionId, Position>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }
}

impl PositionStore for InMemoryStore {
    fn get_portfolio(&self, user_id: &UserId) -> Result<Option<Portfolio>, StoreError> {
        Ok(self.portfolios.get(user_id).map(|p| p.value().clone()))
    }

    fn create_portfolio(&self, portfolio: Portfolio) -> Result<Portfolio, StoreError> {
        let stored = self
            .portfolios
            .entry(portfolio.user_id.clone())
            .or_insert(portfolio);
        Ok(stored.value().clone())
    }

    fn save_portfolio(&self, portfolio: &Portfolio) -> Result<(), StoreError> {
        match self.portfolios.get_mut(&portfolio.user_id) {
            Some(mut slot) => {
                *slot = portfolio.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("portfolio {}", portfolio.user_id))),
        }
    }

    fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        match self.positions.entry(position.id) {
            Entry::Occupied(_) => Err(StoreError::Database(format!(
                "duplicate position id {}",
                position.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(position.clone());
                Ok(())
            }
        }
    }

    fn get_position(&self, id: &PositionId) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.get(id).map(|p| p.value().clone()))
    }

    fn delete_position(&self, id: &PositionId) -> Result<(), StoreError> {
        self.positions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("position {id}")))
    }

    fn update_position(&self, position: &Position, expected: PositionStatus) -> Result<(), StoreError> {
        // get_mut holds the shard write lock across the compare and the swap
        let mut slot = self
            .positions
            .get_mut(&position.id)
            .ok_or_else(|| StoreError::NotFound(format!("position {}", position.id)))?;
        if slot.status != expected {
            return Err(StoreError::Conflict {
                expected,
                actual: slot.status,
            });
        }
        *slot = position.clone();
        Ok(())
    }

    fn positions_for_user(
        &self,
        user_id: &UserId,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, StoreError> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| &p.user_id == user_id && status.map_or(true, |s| p.status == s))
            .map(|p| p.value().clone())
            .collect();
        positions.sort_by_key(|p| p.created_at);
        Ok(positions)
    }

    fn positions_by_status(&self, status: PositionStatus) -> Result<Vec<Position>, StoreError> {
        let mut positions: Vec<Position> = self
            .positions
            .iter()
            .filter(|p| p.status == status)
            .map(|p| p.value().clone())
            .collect();
        positions.sort_by_key(|p| p.created_at);
        Ok(positions)
    }

    fn recent_closed(&self, user_id: &UserId, limit: usize) -> Result<Vec<Position>, StoreError> {
        let mut closed = self.positions_for_user(user_id, Some(PositionStatus::Closed))?;
        closed.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        closed.truncate(limit);
        Ok(closed)
    }
}
