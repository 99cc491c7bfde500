//! # Statemachine
//!
//! A lease-coordinated, retry-aware processing engine for persistent entity
//! state machines.
//!
//! ## Core Concepts
//!
//! - [`StatefulEntity`]: a persistent record with an integer state code and
//!   the bookkeeping in [`EntityState`].
//! - [`StateEntityStore`]: persistence that selects *and leases* batches
//!   atomically, so several connector instances can share one backend.
//! - [`Processor`]: turns one leased batch into transitions.
//! - [`StateMachineManager`]: runs processors in a loop on one task, backing
//!   off through a [`WaitStrategy`] when nothing happens.
//! - [`CommandQueue`] / [`CommandRunner`]: targeted transitions requested from
//!   outside the loop.
//!
//! ## Architecture
//!
//! ```text
//! producers ── enqueue() ──► CommandQueue
//!                                 │
//! StateMachineManager loop        │
//!     │                           ▼
//!     ├─► CommandRunner.run_all() ─► find_by_id_and_lease ─► handler ─┐
//!     │                                                               │
//!     ├─► Processor A ─► next_not_leased(criteria) ─► process(e) ─────┤
//!     │                                                               │
//!     ├─► Processor B ─► ...                                          │
//!     │                                                               ▼
//!     │                                    Lifecycle: transition_to → before_save
//!     │                                               → save (releases lease)
//!     │                                               → after_save (spawned)
//!     │
//!     └─► nothing processed? sleep(wait.retry_in_millis()) : wait.success()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One holder per entity** - a non-expired lease excludes every other holder
//! 2. **Atomic selection** - concurrent `next_not_leased` calls never overlap
//! 3. **Oldest first** - batches are ordered by `state_timestamp`
//! 4. **Save releases** - persisting a transition drops the caller's lease
//! 5. **Central bookkeeping** - only [`EntityState::transition_to`] touches `state_count`
//! 6. **Round isolation** - one entity's failure never aborts its round or the loop
//!
//! ## Example
//!
//! ```ignore
//! use statemachine::{
//!     has_state, FixedWaitStrategy, InMemoryStateEntityStore, Lifecycle, ManagerConfig,
//!     Observable, Processor, StateMachineManager, SystemClock,
//! };
//!
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(InMemoryStateEntityStore::<Transfer>::new("connector-1", clock.clone()));
//! let lifecycle = Lifecycle::new(store.clone(), Arc::new(Observable::default()), clock);
//!
//! let provision = Processor::leasing("provision", store.clone(), 20, vec![has_state(INITIAL)], {
//!     let lifecycle = lifecycle.clone();
//!     move |mut transfer| {
//!         let lifecycle = lifecycle.clone();
//!         async move {
//!             lifecycle.transition(&mut transfer, PROVISIONING).await?;
//!             Ok(true)
//!         }
//!     }
//! });
//!
//! let manager = StateMachineManager::new(ManagerConfig::new("transfers"), Arc::new(FixedWaitStrategy::new(500)))?
//!     .with_processor(provision);
//! manager.start()?;
//! // ...
//! manager.stop().await?;
//! ```

mod clock;
mod command;
mod criteria;
mod entity;
mod error;
mod lease;
mod lifecycle;
mod manager;
mod observable;
mod processor;
mod retry;
mod store;
mod wait;

// Test doubles (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use crate::clock::{Clock, SystemClock};
pub use crate::command::{
    async_handler, CommandHandler, CommandHandlerRegistry, CommandInbox, CommandOutcome,
    CommandQueue, CommandQueueError, CommandRunReport, CommandRunner, ConflictPolicy,
    EntityCommand, FnHandler,
};
pub use crate::criteria::{
    has_state, is_not_pending, is_pending, matches_all, state_in, state_not_in,
    state_timestamp_before, Criterion,
};
pub use crate::entity::{EntityState, StateCode, StatefulEntity, TraceContext};
pub use crate::error::EngineError;
pub use crate::lease::{Lease, LeaseContext, LeaseError, LeaseTable, DEFAULT_LEASE_DURATION_MS};
pub use crate::lifecycle::Lifecycle;
pub use crate::manager::{ManagerConfig, ManagerState, StateMachineManager};
pub use crate::observable::{
    EntityListener, FanOutReport, ListenerFailurePolicy, Observable, Transition, TransitionKind,
};
pub use crate::processor::{
    BatchFn, GuardPredicate, NotProcessedFn, ProcessFn, ProcessRound, Processor, RoundReport,
};
pub use crate::retry::RetryPolicy;
pub use crate::store::{InMemoryStateEntityStore, StateEntityStore, StoreError};
pub use crate::wait::{exponential_delay, ExponentialWaitStrategy, FixedWaitStrategy, WaitStrategy};
