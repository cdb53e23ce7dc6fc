//! Read-only projections over registry and pool state.

use crate::{Participant, ParticipantRegistry};
use serde::Serialize;

/// Message counts by lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageStats {
    /// Messages held by the pool, in any status.
    pub total: usize,
    pub in_flight: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Participant counts by injected health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthStats {
    pub total: usize,
    pub healthy: usize,
    pub failed: usize,
}

impl HealthStats {
    /// Count participants of a registry.
    pub fn from_registry<T: Participant>(registry: &ParticipantRegistry<T>) -> Self {
        let healthy = registry.available_count();
        Self {
            total: registry.len(),
            healthy,
            failed: registry.len() - healthy,
        }
    }
}
