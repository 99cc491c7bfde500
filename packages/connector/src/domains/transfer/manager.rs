// Consumer transfer process manager
//
//   INITIAL ─► PROVISIONING ─(provision)─► PROVISIONED ─► REQUESTING
//                   │ in progress: pending until ProvisionCompleted
//
//   REQUESTING ─(send request)─► REQUESTED ─Started─► STARTED
//   STARTED ─Complete─► COMPLETING ─(send completion)─► COMPLETED
//
//   any non-final ─Terminate─► TERMINATING ─(send termination)─► TERMINATED
//   any non-final ─ForceComplete/ForceFail─► COMPLETED/TERMINATED
//
// An optional pending guard holds matching INITIAL transfers until Resume.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use statemachine::{
    has_state, is_not_pending, CommandQueue, CommandQueueError, CommandRunner, ConflictPolicy,
    Criterion, EntityCommand, GuardPredicate, Lifecycle, ManagerState, Observable, Processor,
    RetryPolicy, RoundReport, StateCode, StateEntityStore, StateMachineManager, StatefulEntity,
};
use tracing::{debug, info, warn};

use super::commands::{self, TransferCommand};
use super::model::{TransferProcess, TransferRequest, TransferState};
use crate::config::Config;
use crate::error::ConnectorError;
use crate::kernel::{
    ConnectorDeps, EventLogListener, MessageBody, ProtocolDispatcher, ProvisionResponse,
    Provisioner, RemoteMessage,
};

const ENTITY: &str = "transfer process";

/// Per-entity work done by the transfer processors.
struct TransferActions {
    lifecycle: Lifecycle<TransferProcess>,
    dispatcher: Arc<dyn ProtocolDispatcher>,
    provisioner: Arc<dyn Provisioner>,
    retry: RetryPolicy,
}

impl TransferActions {
    async fn advance(&self, mut transfer: TransferProcess, next: TransferState) -> Result<bool> {
        self.lifecycle.transition(&mut transfer, next.code()).await?;
        Ok(true)
    }

    async fn provision(&self, mut transfer: TransferProcess) -> Result<bool> {
        if !self.retry.is_due(&transfer, self.lifecycle.now()) {
            return Ok(false);
        }

        match self.provisioner.provision(&transfer).await {
            Ok(ProvisionResponse::Ready { resource_id }) => {
                transfer.resource_id = Some(resource_id);
                self.lifecycle
                    .transition(&mut transfer, TransferState::Provisioned.code())
                    .await?;
            }
            Ok(ProvisionResponse::InProgress) => {
                debug!(transfer_id = %transfer.id(), "provisioning in progress");
                self.lifecycle.mark_pending(&mut transfer).await?;
            }
            Err(e) => {
                warn!(
                    transfer_id = %transfer.id(),
                    attempt = transfer.state_count() + 1,
                    error = %e,
                    "provisioning failed"
                );
                self.lifecycle
                    .retry_or_terminate(
                        &mut transfer,
                        &self.retry,
                        TransferState::Terminated.code(),
                        format!("provisioning failed: {:#}", e),
                    )
                    .await?;
            }
        }
        Ok(true)
    }

    async fn send_request(&self, transfer: TransferProcess) -> Result<bool> {
        let body = MessageBody::TransferRequest {
            contract_id: transfer.contract_id.clone(),
            asset_id: transfer.asset_id.clone(),
            resource_id: transfer.resource_id.clone(),
        };
        self.send(transfer, body, TransferState::Requested).await
    }

    async fn send_completion(&self, transfer: TransferProcess) -> Result<bool> {
        self.send(transfer, MessageBody::TransferCompletion, TransferState::Completed)
            .await
    }

    async fn send_termination(&self, transfer: TransferProcess) -> Result<bool> {
        let body = MessageBody::Termination {
            reason: transfer.base.error_detail.clone(),
        };
        self.send(transfer, body, TransferState::Terminated).await
    }

    async fn send(
        &self,
        mut transfer: TransferProcess,
        body: MessageBody,
        next: TransferState,
    ) -> Result<bool> {
        if !self.retry.is_due(&transfer, self.lifecycle.now()) {
            return Ok(false);
        }

        let kind = body.kind();
        let message = RemoteMessage {
            process_id: transfer.base.id.clone(),
            counter_party_address: transfer.counter_party_address.clone(),
            protocol: transfer.protocol.clone(),
            body,
        };

        match self.dispatcher.dispatch(message).await {
            Ok(()) => {
                self.lifecycle.transition(&mut transfer, next.code()).await?;
            }
            Err(e) => {
                warn!(
                    transfer_id = %transfer.id(),
                    kind,
                    attempt = transfer.state_count() + 1,
                    error = %e,
                    "failed to send transfer message"
                );
                self.lifecycle
                    .retry_or_terminate(
                        &mut transfer,
                        &self.retry,
                        TransferState::Terminated.code(),
                        format!("sending {} failed: {:#}", kind, e),
                    )
                    .await?;
            }
        }
        Ok(true)
    }
}

/// Drives consumer-side transfer processes.
pub struct TransferManager {
    lifecycle: Lifecycle<TransferProcess>,
    commands: CommandQueue<TransferCommand>,
    engine: StateMachineManager,
}

impl TransferManager {
    pub fn new(
        config: &Config,
        store: Arc<dyn StateEntityStore<TransferProcess>>,
        deps: &ConnectorDeps,
    ) -> Result<Self, ConnectorError> {
        Self::build(config, store, deps, None)
    }

    /// Like [`TransferManager::new`], holding INITIAL transfers that match
    /// `guard` as pending until a `Resume` command arrives.
    pub fn with_pending_guard<G>(
        config: &Config,
        store: Arc<dyn StateEntityStore<TransferProcess>>,
        deps: &ConnectorDeps,
        guard: G,
    ) -> Result<Self, ConnectorError>
    where
        G: Fn(&TransferProcess) -> bool + Send + Sync + 'static,
    {
        Self::build(config, store, deps, Some(Arc::new(guard)))
    }

    fn build(
        config: &Config,
        store: Arc<dyn StateEntityStore<TransferProcess>>,
        deps: &ConnectorDeps,
        pending_guard: Option<GuardPredicate<TransferProcess>>,
    ) -> Result<Self, ConnectorError> {
        let observable = Observable::default().with_listener(
            EventLogListener::<TransferState>::new("transfer", Arc::clone(&deps.publisher)),
        );
        let lifecycle = Lifecycle::new(
            Arc::clone(&store),
            Arc::new(observable),
            Arc::clone(&deps.clock),
        );

        let retry = config.retry_policy()?;
        let actions = Arc::new(TransferActions {
            lifecycle: lifecycle.clone(),
            dispatcher: Arc::clone(&deps.dispatcher),
            provisioner: Arc::clone(&deps.provisioner),
            retry,
        });

        let (queue, inbox) = CommandQueue::bounded(config.command_queue_capacity);
        let runner = CommandRunner::new(
            "transfer-commands",
            queue.clone(),
            inbox,
            commands::registry()?,
            lifecycle.clone(),
        )
        .with_conflict_policy(ConflictPolicy::Requeue {
            max_attempts: config.command_max_attempts,
        });

        let processors = Processors {
            store: Arc::clone(&store),
            batch_size: config.batch_size,
            due: retry.due_criterion(Arc::clone(&deps.clock)),
            actions,
        };

        let mut initial = processors.on("transfer-initial", TransferState::Initial, |a, t| {
            async move { a.advance(t, TransferState::Provisioning).await }
        });
        if let Some(guard) = pending_guard {
            initial =
                initial.with_pending_guard(move |t: &TransferProcess| guard(t), lifecycle.clone());
        }

        let engine = StateMachineManager::new(
            config.manager_config("transfers"),
            Arc::new(config.wait_strategy()),
        )?
        .with_commands(runner)
        .with_processor(initial)
        .with_processor(processors.on("transfer-provisioning", TransferState::Provisioning, |a, t| {
            async move { a.provision(t).await }
        }))
        .with_processor(processors.on("transfer-provisioned", TransferState::Provisioned, |a, t| {
            async move { a.advance(t, TransferState::Requesting).await }
        }))
        .with_processor(processors.on("transfer-requesting", TransferState::Requesting, |a, t| {
            async move { a.send_request(t).await }
        }))
        .with_processor(processors.on("transfer-completing", TransferState::Completing, |a, t| {
            async move { a.send_completion(t).await }
        }))
        .with_processor(processors.on("transfer-terminating", TransferState::Terminating, |a, t| {
            async move { a.send_termination(t).await }
        }));

        Ok(Self {
            lifecycle,
            commands: queue,
            engine,
        })
    }

    /// Start a transfer under an existing agreement.
    pub async fn initiate(&self, request: TransferRequest) -> Result<TransferProcess, ConnectorError> {
        let mut transfer = TransferProcess::new(request, self.lifecycle.now());
        self.lifecycle.create(&mut transfer).await?;
        info!(
            transfer_id = %transfer.id(),
            contract_id = %transfer.contract_id,
            transfer_type = %transfer.transfer_type,
            "transfer process initiated"
        );
        Ok(transfer)
    }

    pub async fn find(&self, id: &str) -> Result<TransferProcess, ConnectorError> {
        self.lifecycle
            .store()
            .find_by_id(id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })
    }

    /// Transfers currently in `state`, oldest first.
    pub async fn list(
        &self,
        state: TransferState,
        limit: usize,
    ) -> Result<Vec<TransferProcess>, ConnectorError> {
        Ok(self
            .lifecycle
            .store()
            .query(&[has_state(state.code())], limit)
            .await?)
    }

    /// Queue a command for the next round.
    pub fn enqueue(&self, command: TransferCommand) -> Result<(), ConnectorError> {
        self.commands.enqueue(command).map_err(queue_error)
    }

    pub fn start(&self) -> Result<(), ConnectorError> {
        Ok(self.engine.start()?)
    }

    pub async fn stop(&self) -> Result<(), ConnectorError> {
        Ok(self.engine.stop().await?)
    }

    pub fn state(&self) -> ManagerState {
        self.engine.state()
    }

    /// Apply queued commands and run every processor once.
    pub async fn run_round(&self) -> RoundReport {
        self.engine.run_round().await
    }
}

struct Processors {
    store: Arc<dyn StateEntityStore<TransferProcess>>,
    batch_size: usize,
    due: Criterion<TransferProcess>,
    actions: Arc<TransferActions>,
}

impl Processors {
    fn on<F, Fut>(&self, name: &str, state: TransferState, f: F) -> Processor<TransferProcess>
    where
        F: Fn(Arc<TransferActions>, TransferProcess) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let actions = Arc::clone(&self.actions);
        Processor::leasing(
            name,
            Arc::clone(&self.store),
            self.batch_size,
            vec![has_state(state.code()), is_not_pending(), self.due.clone()],
            move |transfer| f(Arc::clone(&actions), transfer),
        )
    }
}

fn queue_error(e: CommandQueueError<TransferCommand>) -> ConnectorError {
    let reason = match &e {
        CommandQueueError::Full(_) => "command queue is full",
        CommandQueueError::Closed(_) => "command queue is closed",
    };
    let command = e.into_command();
    ConnectorError::CommandNotAccepted {
        kind: command.kind(),
        id: command.entity_id().to_string(),
        reason,
    }
}
