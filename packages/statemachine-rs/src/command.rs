//! Externally triggered, targeted transitions.
//!
//! Producers (protocol handlers, management APIs) call
//! [`CommandQueue::enqueue`], which never blocks. The manager's worker drains
//! the queue at the start of every round through [`CommandRunner::run_all`]:
//!
//! ```text
//! enqueue(cmd) ─► mpsc ─► run_all()
//!                           ├─► store.find_by_id_and_lease(cmd.entity_id())
//!                           ├─► registry[cmd.kind()].handle(&mut entity, &cmd)
//!                           └─► Lifecycle::transition / update / release
//! ```
//!
//! A missing target is dropped with a warning. A leased target is a routine
//! race with the polling loop and is handled per [`ConflictPolicy`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::entity::StatefulEntity;
use crate::error::EngineError;
use crate::lifecycle::Lifecycle;
use crate::processor::{ProcessRound, RoundReport};
use crate::store::StoreError;

// =============================================================================
// Commands and Handlers
// =============================================================================

/// A request to mutate one specific entity.
///
/// Domains usually implement this on an enum; `kind` selects the handler.
pub trait EntityCommand: fmt::Debug + Send + Sync + 'static {
    fn entity_id(&self) -> &str;

    fn kind(&self) -> &'static str;
}

/// What the runner should do with the entity after a handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Transition into this state and save.
    TransitionTo(i32),
    /// Save field changes without a transition.
    Updated,
    /// Leave the entity untouched and release the lease.
    Rejected(String),
}

#[async_trait]
pub trait CommandHandler<T: StatefulEntity, C: EntityCommand>: Send + Sync + 'static {
    async fn handle(&self, entity: &mut T, command: &C) -> anyhow::Result<CommandOutcome>;
}

/// Adapts a synchronous closure into a [`CommandHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<T, C, F> CommandHandler<T, C> for FnHandler<F>
where
    T: StatefulEntity,
    C: EntityCommand,
    F: Fn(&mut T, &C) -> anyhow::Result<CommandOutcome> + Send + Sync + 'static,
{
    async fn handle(&self, entity: &mut T, command: &C) -> anyhow::Result<CommandOutcome> {
        (self.0)(entity, command)
    }
}

/// Handlers keyed by [`EntityCommand::kind`].
pub struct CommandHandlerRegistry<T: StatefulEntity, C: EntityCommand> {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler<T, C>>>,
}

impl<T: StatefulEntity, C: EntityCommand> CommandHandlerRegistry<T, C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler.
    ///
    /// Fails with [`EngineError::InvalidConfig`] if `kind` already has one.
    pub fn register<H: CommandHandler<T, C>>(
        &mut self,
        kind: &'static str,
        handler: H,
    ) -> Result<(), EngineError> {
        if self.handlers.contains_key(kind) {
            return Err(EngineError::InvalidConfig(format!(
                "command handler already registered for kind: {}",
                kind
            )));
        }
        self.handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    pub fn register_fn<F>(&mut self, kind: &'static str, handler: F) -> Result<(), EngineError>
    where
        F: Fn(&mut T, &C) -> anyhow::Result<CommandOutcome> + Send + Sync + 'static,
    {
        self.register(kind, FnHandler(handler))
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn CommandHandler<T, C>>> {
        self.handlers.get(kind)
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<T: StatefulEntity, C: EntityCommand> Default for CommandHandlerRegistry<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Error)]
pub enum CommandQueueError<C: fmt::Debug> {
    #[error("command queue is full")]
    Full(C),

    #[error("command queue is closed")]
    Closed(C),
}

impl<C: fmt::Debug> CommandQueueError<C> {
    /// The command that could not be enqueued.
    pub fn into_command(self) -> C {
        match self {
            CommandQueueError::Full(c) | CommandQueueError::Closed(c) => c,
        }
    }
}

#[derive(Debug)]
struct Envelope<C> {
    command: C,
    attempts: u32,
}

/// Producer side of the command queue. Cheap to clone.
pub struct CommandQueue<C> {
    sender: mpsc::Sender<Envelope<C>>,
}

impl<C> Clone for CommandQueue<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Consumer side, handed to exactly one [`CommandRunner`].
pub struct CommandInbox<C> {
    receiver: mpsc::Receiver<Envelope<C>>,
}

impl<C: EntityCommand> CommandQueue<C> {
    /// Create a FIFO queue holding at most `capacity` commands.
    pub fn bounded(capacity: usize) -> (CommandQueue<C>, CommandInbox<C>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (CommandQueue { sender }, CommandInbox { receiver })
    }

    /// Enqueue without waiting.
    pub fn enqueue(&self, command: C) -> Result<(), CommandQueueError<C>> {
        trace!(kind = command.kind(), entity_id = %command.entity_id(), "command enqueued");
        self.send(Envelope {
            command,
            attempts: 0,
        })
    }

    fn send(&self, envelope: Envelope<C>) -> Result<(), CommandQueueError<C>> {
        self.sender.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(env) => CommandQueueError::Full(env.command),
            mpsc::error::TrySendError::Closed(env) => CommandQueueError::Closed(env.command),
        })
    }

    /// Free slots left.
    pub fn remaining_capacity(&self) -> usize {
        self.sender.capacity()
    }
}

// =============================================================================
// Runner
// =============================================================================

/// What happens to a command whose target is leased by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Drop,
    /// Retry on a later round, up to `max_attempts` attempts in total.
    Requeue { max_attempts: u32 },
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::Requeue { max_attempts: 5 }
    }
}

/// Counts from one [`CommandRunner::run_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandRunReport {
    pub applied: usize,
    pub rejected: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub failed: usize,
}

enum Applied {
    Applied,
    Rejected,
    Requeued,
    Dropped,
    Failed,
}

type OutcomeFuture<'a> = BoxFuture<'a, anyhow::Result<CommandOutcome>>;

pub struct CommandRunner<T: StatefulEntity, C: EntityCommand> {
    name: String,
    inbox: Mutex<CommandInbox<C>>,
    queue: CommandQueue<C>,
    registry: CommandHandlerRegistry<T, C>,
    lifecycle: Lifecycle<T>,
    policy: ConflictPolicy,
}

impl<T: StatefulEntity, C: EntityCommand> CommandRunner<T, C> {
    pub fn new(
        name: impl Into<String>,
        queue: CommandQueue<C>,
        inbox: CommandInbox<C>,
        registry: CommandHandlerRegistry<T, C>,
        lifecycle: Lifecycle<T>,
    ) -> Self {
        Self {
            name: name.into(),
            inbox: Mutex::new(inbox),
            queue,
            registry,
            lifecycle,
            policy: ConflictPolicy::default(),
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &CommandQueue<C> {
        &self.queue
    }

    /// Apply every command queued at the time of the call.
    ///
    /// Commands requeued during this pass wait for the next one.
    pub async fn run_all(&self) -> CommandRunReport {
        let drained = {
            let mut inbox = self.inbox.lock().await;
            let mut drained = Vec::new();
            while let Ok(envelope) = inbox.receiver.try_recv() {
                drained.push(envelope);
            }
            drained
        };

        let mut report = CommandRunReport::default();
        for envelope in drained {
            match self.apply(envelope).await {
                Applied::Applied => report.applied += 1,
                Applied::Rejected => report.rejected += 1,
                Applied::Requeued => report.requeued += 1,
                Applied::Dropped => report.dropped += 1,
                Applied::Failed => report.failed += 1,
            }
        }

        if report != CommandRunReport::default() {
            debug!(runner = %self.name, ?report, "commands drained");
        }
        report
    }

    async fn apply(&self, envelope: Envelope<C>) -> Applied {
        let kind = envelope.command.kind();
        let entity_id = envelope.command.entity_id().to_string();

        let Some(handler) = self.registry.get(kind) else {
            warn!(runner = %self.name, kind, entity_id = %entity_id, "no handler for command, dropping");
            return Applied::Dropped;
        };

        let mut entity = match self.lifecycle.store().find_by_id_and_lease(&entity_id).await {
            Ok(entity) => entity,
            Err(StoreError::NotFound(_)) => {
                warn!(runner = %self.name, kind, entity_id = %entity_id, "command target not found, dropping");
                return Applied::Dropped;
            }
            Err(e) => return self.on_lease_failure(envelope, e),
        };

        let outcome = {
            let fut: OutcomeFuture<'_> = handler.handle(&mut entity, &envelope.command);
            AssertUnwindSafe(fut).catch_unwind().await
        };

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let err = EngineError::Command {
                    kind,
                    entity_id: entity_id.clone(),
                    reason: e.to_string(),
                };
                warn!(runner = %self.name, error = %err, "command handler failed");
                self.release(&entity).await;
                return Applied::Failed;
            }
            Err(payload) => {
                let err = EngineError::from_panic(format!("command handler {}", kind), payload);
                error!(runner = %self.name, entity_id = %entity_id, error = %err, "command handler panicked");
                self.release(&entity).await;
                return Applied::Failed;
            }
        };

        let result = match outcome {
            CommandOutcome::TransitionTo(state) => {
                self.lifecycle.transition(&mut entity, state).await.map(|_| ())
            }
            CommandOutcome::Updated => self.lifecycle.update(&mut entity).await,
            CommandOutcome::Rejected(reason) => {
                info!(runner = %self.name, kind, entity_id = %entity_id, reason = %reason, "command rejected");
                self.release(&entity).await;
                return Applied::Rejected;
            }
        };

        match result {
            Ok(()) => {
                debug!(runner = %self.name, kind, entity_id = %entity_id, "command applied");
                Applied::Applied
            }
            Err(e) => {
                warn!(runner = %self.name, kind, entity_id = %entity_id, error = %e, "command result not saved");
                Applied::Failed
            }
        }
    }

    fn on_lease_failure(&self, mut envelope: Envelope<C>, err: StoreError) -> Applied {
        let kind = envelope.command.kind();
        if err.is_contention() {
            debug!(runner = %self.name, kind, error = %err, "command target busy");
        } else {
            error!(runner = %self.name, kind, error = %err, "failed to lease command target");
        }

        let max_attempts = match self.policy {
            ConflictPolicy::Drop => {
                warn!(runner = %self.name, kind, entity_id = %envelope.command.entity_id(), "dropping command");
                return Applied::Dropped;
            }
            ConflictPolicy::Requeue { max_attempts } => max_attempts,
        };

        envelope.attempts += 1;
        if envelope.attempts >= max_attempts {
            warn!(
                runner = %self.name,
                kind,
                entity_id = %envelope.command.entity_id(),
                attempts = envelope.attempts,
                "command attempts exhausted, dropping"
            );
            return Applied::Dropped;
        }

        match self.queue.send(envelope) {
            Ok(()) => Applied::Requeued,
            Err(e) => {
                warn!(runner = %self.name, kind, error = %e, "could not requeue command, dropping");
                Applied::Dropped
            }
        }
    }

    async fn release(&self, entity: &T) {
        if let Err(e) = self.lifecycle.release(entity).await {
            warn!(runner = %self.name, entity_id = %entity.id(), error = %e, "failed to release lease");
        }
    }
}

#[async_trait]
impl<T: StatefulEntity, C: EntityCommand> ProcessRound for CommandRunner<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_round(&self) -> Result<RoundReport, EngineError> {
        let report = self.run_all().await;
        Ok(RoundReport {
            processed: report.applied,
            failed: report.failed,
        })
    }
}

/// Build a command handler from an async closure over an owned entity.
///
/// The closure receives the leased entity by value and returns it together
/// with the outcome, which suits handlers that call out to collaborators.
pub fn async_handler<T, C, F, Fut>(handler: F) -> impl CommandHandler<T, C>
where
    T: StatefulEntity,
    C: EntityCommand + Clone,
    F: Fn(T, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<(T, CommandOutcome)>> + Send + 'static,
{
    AsyncFnHandler(handler)
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<T, C, F, Fut> CommandHandler<T, C> for AsyncFnHandler<F>
where
    T: StatefulEntity,
    C: EntityCommand + Clone,
    F: Fn(T, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<(T, CommandOutcome)>> + Send + 'static,
{
    async fn handle(&self, entity: &mut T, command: &C) -> anyhow::Result<CommandOutcome> {
        let (updated, outcome) = (self.0)(entity.clone(), command.clone()).await?;
        *entity = updated;
        Ok(outcome)
    }
}
