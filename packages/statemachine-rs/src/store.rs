//! Persistence contract for state-machine entities.
//!
//! # The Contract
//!
//! 1. **Select and lease atomically.** [`StateEntityStore::next_not_leased`]
//!    picks eligible entities and leases them in one critical section. Two
//!    concurrent callers never receive the same entity.
//!
//! 2. **Oldest first.** Candidates are ordered by `state_timestamp`
//!    ascending so nothing starves behind a steady stream of newer work.
//!
//! 3. **Save releases.** [`StateEntityStore::save`] writes the entity and drops
//!    the caller's lease in the same step.
//!
//! 4. **Stale writes fail loudly.** Saving over another holder's lease, over a
//!    newer version, or over a deleted row returns an error. Nothing is
//!    silently overwritten.
//!
//! Each store instance acts on behalf of one lease holder (typically the
//! connector runtime id). [`InMemoryStateEntityStore::with_holder`] creates a
//! second view onto the same data for a different holder, which is how tests
//! simulate several connector instances sharing one backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::criteria::{matches_all, Criterion};
use crate::entity::StatefulEntity;
use crate::lease::{LeaseContext, LeaseError, LeaseTable, DEFAULT_LEASE_DURATION_MS};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from entity storage.
///
/// The variants are kept apart because callers react differently:
/// - [`StoreError::AlreadyLeased`] is routine contention; skip the entity.
/// - [`StoreError::Conflict`] / [`StoreError::NotFound`] on save mean the
///   transition is stale and must be discarded.
/// - [`StoreError::Backend`] is a system failure; the round is retried later.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No entity with this id exists.
    #[error("entity {0} not found")]
    NotFound(String),

    /// Another holder owns a non-expired lease on the entity.
    #[error("entity {entity_id} is leased by {holder_id}")]
    AlreadyLeased { entity_id: String, holder_id: String },

    /// The entity changed since it was read.
    #[error("stale write for entity {entity_id}: expected version {expected}, found {actual}")]
    Conflict {
        entity_id: String,
        expected: u64,
        actual: u64,
    },

    /// Storage backend failed (connection, poisoned lock, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether this error is expected under concurrency and safe to skip.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyLeased { .. } | StoreError::Conflict { .. }
        )
    }
}

impl From<LeaseError> for StoreError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::HeldByOther {
                entity_id,
                holder_id,
            } => StoreError::AlreadyLeased {
                entity_id,
                holder_id,
            },
        }
    }
}

// =============================================================================
// Store Trait
// =============================================================================

/// Lease-aware persistence for one entity type.
#[async_trait]
pub trait StateEntityStore<T: StatefulEntity>: Send + Sync + 'static {
    /// The lease holder this store acts for.
    fn holder_id(&self) -> &str;

    /// Point lookup; no lease involved.
    async fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError>;

    /// Select up to `max` unleased entities matching all `criteria`, lease
    /// them for [`Self::holder_id`] and return them oldest-first.
    async fn next_not_leased(
        &self,
        max: usize,
        criteria: &[Criterion<T>],
    ) -> Result<Vec<T>, StoreError>;

    /// Lease one specific entity.
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::AlreadyLeased`].
    async fn find_by_id_and_lease(&self, id: &str) -> Result<T, StoreError>;

    /// Insert or update, releasing the caller's lease.
    ///
    /// On success the entity's `version` is updated in place. Saving content
    /// identical to what is stored is a no-op that keeps the version.
    async fn save(&self, entity: &mut T) -> Result<(), StoreError>;

    /// List entities matching `criteria` oldest-first, without leasing.
    async fn query(&self, criteria: &[Criterion<T>], limit: usize) -> Result<Vec<T>, StoreError>;

    /// Remove an entity unless another holder leases it or it no longer has
    /// `version`.
    ///
    /// A caller that inspected the entity before deciding to delete passes the
    /// version it inspected; a concurrent save in between yields
    /// [`StoreError::Conflict`] and nothing is removed.
    async fn delete_by_id(&self, id: &str, version: u64) -> Result<T, StoreError>;

    /// Release this holder's lease on an entity.
    async fn break_lease(&self, id: &str) -> Result<(), StoreError>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

struct Inner<T> {
    entities: HashMap<String, T>,
    leases: LeaseTable,
}

/// Store backed by a `HashMap` and a [`LeaseTable`] behind one mutex.
///
/// Suitable for tests and single-process deployments. The single lock is
/// what gives `next_not_leased` its atomicity.
pub struct InMemoryStateEntityStore<T> {
    inner: Arc<Mutex<Inner<T>>>,
    holder_id: String,
}

impl<T: StatefulEntity> InMemoryStateEntityStore<T> {
    pub fn new(holder_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self::with_lease_duration(holder_id, clock, DEFAULT_LEASE_DURATION_MS)
    }

    pub fn with_lease_duration(
        holder_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        lease_duration_ms: i64,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entities: HashMap::new(),
                leases: LeaseTable::new(clock, lease_duration_ms),
            })),
            holder_id: holder_id.into(),
        }
    }

    /// Another view onto the same data, acting as a different lease holder.
    pub fn with_holder(&self, holder_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            holder_id: holder_id.into(),
        }
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entities.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Holder of the active lease on `id`, if any.
    pub fn lease_holder(&self, id: &str) -> Option<String> {
        let inner = self.lock().ok()?;
        let holder = inner.leases.active_lease(id).map(|l| l.holder_id.clone());
        holder
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<T>>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))
    }
}

fn oldest_first<T: StatefulEntity>(a: &&T, b: &&T) -> std::cmp::Ordering {
    a.state_timestamp()
        .cmp(&b.state_timestamp())
        .then_with(|| a.id().cmp(b.id()))
}

#[async_trait]
impl<T: StatefulEntity> StateEntityStore<T> for InMemoryStateEntityStore<T> {
    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.entities.get(id).cloned())
    }

    async fn next_not_leased(
        &self,
        max: usize,
        criteria: &[Criterion<T>],
    ) -> Result<Vec<T>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut guard = self.lock()?;
        let Inner { entities, leases } = &mut *guard;

        let mut candidates: Vec<&T> = entities
            .values()
            .filter(|e| matches_all(criteria, *e))
            .filter(|e| {
                let leased = leases.is_leased(e.id());
                if leased {
                    trace!(entity_id = %e.id(), "skipping leased entity");
                }
                !leased
            })
            .collect();
        candidates.sort_by(oldest_first);
        candidates.truncate(max);

        let mut batch = Vec::with_capacity(candidates.len());
        for entity in candidates {
            leases.acquire_lease(entity.id(), &self.holder_id)?;
            batch.push(entity.clone());
        }

        if !batch.is_empty() {
            trace!(holder = %self.holder_id, count = batch.len(), "leased batch");
        }
        Ok(batch)
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        let Inner { entities, leases } = &mut *guard;

        let entity = entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        leases.acquire_lease(id, &self.holder_id)?;
        Ok(entity.clone())
    }

    async fn save(&self, entity: &mut T) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let Inner { entities, leases } = &mut *guard;
        let id = entity.id().to_string();

        if let Some(lease) = leases.active_lease(&id) {
            if !lease.is_held_by(&self.holder_id) {
                return Err(StoreError::AlreadyLeased {
                    entity_id: id,
                    holder_id: lease.holder_id.clone(),
                });
            }
        }

        match entities.get(&id) {
            None if !entity.entity_state().is_new() => {
                return Err(StoreError::NotFound(id));
            }
            None => {
                entity.entity_state_mut().version = 1;
                entities.insert(id.clone(), entity.clone());
            }
            Some(stored) if stored.version() != entity.version() => {
                return Err(StoreError::Conflict {
                    entity_id: id,
                    expected: entity.version(),
                    actual: stored.version(),
                });
            }
            Some(stored) if *stored == *entity => {
                debug!(entity_id = %id, "save without changes");
            }
            Some(_) => {
                let state = entity.entity_state_mut();
                state.version = state.version.saturating_add(1);
                entities.insert(id.clone(), entity.clone());
            }
        }

        leases.break_lease(&id, &self.holder_id)?;
        Ok(())
    }

    async fn query(&self, criteria: &[Criterion<T>], limit: usize) -> Result<Vec<T>, StoreError> {
        let inner = self.lock()?;
        let mut matching: Vec<&T> = inner
            .entities
            .values()
            .filter(|e| matches_all(criteria, *e))
            .collect();
        matching.sort_by(oldest_first);
        Ok(matching.into_iter().take(limit).cloned().collect())
    }

    async fn delete_by_id(&self, id: &str, version: u64) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        let Inner { entities, leases } = &mut *guard;

        let stored = entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(lease) = leases.active_lease(id) {
            if !lease.is_held_by(&self.holder_id) {
                return Err(StoreError::AlreadyLeased {
                    entity_id: id.to_string(),
                    holder_id: lease.holder_id.clone(),
                });
            }
        }
        if stored.version() != version {
            return Err(StoreError::Conflict {
                entity_id: id.to_string(),
                expected: version,
                actual: stored.version(),
            });
        }
        leases.remove(id);
        entities
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn break_lease(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        guard.leases.break_lease(id, &self.holder_id)?;
        Ok(())
    }
}

impl<T> std::fmt::Debug for InMemoryStateEntityStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStateEntityStore")
            .field("holder_id", &self.holder_id)
            .finish()
    }
}
