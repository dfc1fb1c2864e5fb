//! Quota reservations.
//!
//! A resize holds reservations from the moment the API accepts it. The
//! [`Reservation`] handle releases them exactly once: committed when the
//! destination accepts, rolled back on every failure path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleet_id::ReservationId;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    #[error("reservation {0} is unknown")]
    Unknown(ReservationId),

    /// The reservation was already committed or rolled back.
    #[error("reservation {0} was already released")]
    AlreadyReleased(ReservationId),

    #[error("quota backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait QuotaEngine: Send + Sync {
    async fn commit(&self, reservations: &[ReservationId]) -> Result<(), QuotaError>;

    async fn rollback(&self, reservations: &[ReservationId]) -> Result<(), QuotaError>;
}

/// Where a reservation set stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Pending,
    Committed,
    RolledBack,
}

/// Exactly-once release handle over a set of reservations.
pub struct Reservation {
    ids: Vec<ReservationId>,
    state: ReservationState,
    engine: Arc<dyn QuotaEngine>,
}

impl Reservation {
    pub fn new(engine: Arc<dyn QuotaEngine>, ids: Vec<ReservationId>) -> Self {
        Self {
            ids,
            state: ReservationState::Pending,
            engine,
        }
    }

    pub fn ids(&self) -> &[ReservationId] {
        &self.ids
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    /// Commits pending reservations. No-op once released.
    pub async fn commit(&mut self) -> Result<(), QuotaError> {
        if self.state != ReservationState::Pending {
            return Ok(());
        }
        if !self.ids.is_empty() {
            self.engine.commit(&self.ids).await?;
        }
        self.state = ReservationState::Committed;
        debug!(count = self.ids.len(), "Reservations committed");
        Ok(())
    }

    /// Rolls back pending reservations. No-op once released; a backend
    /// failure is logged and leaves the reservation pending.
    pub async fn rollback(&mut self) {
        if self.state != ReservationState::Pending {
            return;
        }
        if !self.ids.is_empty() {
            if let Err(e) = self.engine.rollback(&self.ids).await {
                error!(error = %e, "Failed to roll back reservations");
                return;
            }
        }
        self.state = ReservationState::RolledBack;
        debug!(count = self.ids.len(), "Reservations rolled back");
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ids", &self.ids)
            .field("state", &self.state)
            .finish()
    }
}

/// Quota engine that tracks reservation states in memory and refuses
/// double releases.
#[derive(Debug, Default)]
pub struct InMemoryQuotaEngine {
    reservations: Mutex<HashMap<ReservationId, ReservationState>>,
}

impl InMemoryQuotaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `count` pending reservations.
    pub fn reserve(&self, count: usize) -> Vec<ReservationId> {
        let ids: Vec<ReservationId> = (0..count).map(|_| ReservationId::new()).collect();
        if let Ok(mut reservations) = self.reservations.lock() {
            for id in &ids {
                reservations.insert(*id, ReservationState::Pending);
            }
        }
        ids
    }

    pub fn state_of(&self, id: ReservationId) -> Option<ReservationState> {
        self.reservations.lock().ok()?.get(&id).copied()
    }

    fn release(&self, ids: &[ReservationId], to: ReservationState) -> Result<(), QuotaError> {
        let mut reservations = self
            .reservations
            .lock()
            .map_err(|_| QuotaError::Backend("quota lock poisoned".to_string()))?;
        for id in ids {
            match reservations.get(id) {
                None => return Err(QuotaError::Unknown(*id)),
                Some(ReservationState::Pending) => {}
                Some(_) => return Err(QuotaError::AlreadyReleased(*id)),
            }
        }
        for id in ids {
            reservations.insert(*id, to);
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaEngine for InMemoryQuotaEngine {
    async fn commit(&self, reservations: &[ReservationId]) -> Result<(), QuotaError> {
        self.release(reservations, ReservationState::Committed)
    }

    async fn rollback(&self, reservations: &[ReservationId]) -> Result<(), QuotaError> {
        self.release(reservations, ReservationState::RolledBack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let engine = Arc::new(InMemoryQuotaEngine::new());
        let ids = engine.reserve(2);
        let mut reservation = Reservation::new(engine.clone(), ids.clone());

        reservation.rollback().await;
        reservation.rollback().await;

        assert_eq!(reservation.state(), ReservationState::RolledBack);
        for id in ids {
            assert_eq!(engine.state_of(id), Some(ReservationState::RolledBack));
        }
    }

    #[tokio::test]
    async fn test_commit_then_rollback_keeps_commit() {
        let engine = Arc::new(InMemoryQuotaEngine::new());
        let ids = engine.reserve(1);
        let mut reservation = Reservation::new(engine.clone(), ids.clone());

        reservation.commit().await.unwrap();
        reservation.rollback().await;

        assert_eq!(engine.state_of(ids[0]), Some(ReservationState::Committed));
    }

    #[tokio::test]
    async fn test_engine_refuses_double_release() {
        let engine = InMemoryQuotaEngine::new();
        let ids = engine.reserve(1);
        engine.commit(&ids).await.unwrap();
        assert_eq!(
            engine.rollback(&ids).await.unwrap_err(),
            QuotaError::AlreadyReleased(ids[0])
        );
    }

    #[tokio::test]
    async fn test_empty_reservation_never_touches_engine() {
        let engine = Arc::new(InMemoryQuotaEngine::new());
        let mut reservation = Reservation::new(engine, Vec::new());
        reservation.commit().await.unwrap();
        assert_eq!(reservation.state(), ReservationState::Committed);
    }
}
