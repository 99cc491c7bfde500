//! Time-bounded exclusive claims on entities.
//!
//! A [`Lease`] is store metadata, not part of the entity record. Expiry is
//! evaluated against the injected [`Clock`] whenever a lease is read; there is
//! no background timer. An expired lease behaves exactly like no lease.
//!
//! [`LeaseContext`] is the building block store implementations use to
//! acquire and break leases. [`LeaseTable`] is the in-memory implementation; a
//! relational store would back the same contract with `lease_holder` /
//! `lease_expiry` columns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;

/// Default lease duration (one minute).
pub const DEFAULT_LEASE_DURATION_MS: i64 = 60_000;

/// An exclusive claim held by one processing instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder_id: String,
    pub acquired_at: i64,
    pub duration_ms: i64,
}

impl Lease {
    pub fn new(holder_id: impl Into<String>, acquired_at: i64, duration_ms: i64) -> Self {
        Self {
            holder_id: holder_id.into(),
            acquired_at,
            duration_ms,
        }
    }

    /// Epoch millis after which the lease no longer counts.
    pub fn expires_at(&self) -> i64 {
        self.acquired_at.saturating_add(self.duration_ms)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at()
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }
}

/// Lease acquisition or release was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// Another holder owns a non-expired lease on the entity.
    #[error("entity {entity_id} is leased by {holder_id}")]
    HeldByOther { entity_id: String, holder_id: String },
}

/// Acquire/break primitive used by stores.
///
/// Methods take `&mut self`: callers run them inside the same critical
/// section (lock, transaction) that reads and writes the entity rows, which is
/// what makes selection plus acquisition atomic.
pub trait LeaseContext {
    /// Acquire (or refresh) a lease for `holder_id`.
    ///
    /// Fails if a different holder owns a lease that has not expired.
    fn acquire_lease(&mut self, entity_id: &str, holder_id: &str) -> Result<(), LeaseError>;

    /// Release the lease held by `holder_id`.
    ///
    /// Releasing an absent or expired lease succeeds. Fails if a different
    /// holder owns a non-expired lease.
    fn break_lease(&mut self, entity_id: &str, holder_id: &str) -> Result<(), LeaseError>;

    /// The current, non-expired lease on an entity.
    fn active_lease(&self, entity_id: &str) -> Option<&Lease>;

    /// Whether an entity is leased by anyone (including the caller).
    fn is_leased(&self, entity_id: &str) -> bool {
        self.active_lease(entity_id).is_some()
    }

    /// Whether an entity is leased by someone other than `holder_id`.
    fn is_leased_by_other(&self, entity_id: &str, holder_id: &str) -> bool {
        self.active_lease(entity_id)
            .is_some_and(|lease| !lease.is_held_by(holder_id))
    }
}

/// In-memory lease table keyed by entity id.
pub struct LeaseTable {
    leases: HashMap<String, Lease>,
    clock: Arc<dyn Clock>,
    duration_ms: i64,
}

impl LeaseTable {
    pub fn new(clock: Arc<dyn Clock>, duration_ms: i64) -> Self {
        Self {
            leases: HashMap::new(),
            clock,
            duration_ms,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Drop whatever lease exists, regardless of holder.
    ///
    /// Used when the entity row itself is removed.
    pub fn remove(&mut self, entity_id: &str) -> Option<Lease> {
        self.leases.remove(entity_id)
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }
}

impl LeaseContext for LeaseTable {
    fn acquire_lease(&mut self, entity_id: &str, holder_id: &str) -> Result<(), LeaseError> {
        let now = self.now();
        if let Some(existing) = self.leases.get(entity_id) {
            if !existing.is_expired(now) && !existing.is_held_by(holder_id) {
                return Err(LeaseError::HeldByOther {
                    entity_id: entity_id.to_string(),
                    holder_id: existing.holder_id.clone(),
                });
            }
        }
        self.leases.insert(
            entity_id.to_string(),
            Lease::new(holder_id, now, self.duration_ms),
        );
        Ok(())
    }

    fn break_lease(&mut self, entity_id: &str, holder_id: &str) -> Result<(), LeaseError> {
        let now = self.now();
        match self.leases.get(entity_id) {
            None => Ok(()),
            Some(existing) if existing.is_expired(now) || existing.is_held_by(holder_id) => {
                self.leases.remove(entity_id);
                Ok(())
            }
            Some(existing) => Err(LeaseError::HeldByOther {
                entity_id: entity_id.to_string(),
                holder_id: existing.holder_id.clone(),
            }),
        }
    }

    fn active_lease(&self, entity_id: &str) -> Option<&Lease> {
        let now = self.now();
        self.leases
            .get(entity_id)
            .filter(|lease| !lease.is_expired(now))
    }
}

impl std::fmt::Debug for LeaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseTable")
            .field("leases", &self.leases.len())
            .field("duration_ms", &self.duration_ms)
            .finish()
    }
}
