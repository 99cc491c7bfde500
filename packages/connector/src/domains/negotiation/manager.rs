// Consumer contract negotiation manager
//
//   INITIAL ─► REQUESTING ─(send request)─► REQUESTED
//                                              │ AgreementReceived
//                                              ▼
//              FINALIZED ◄─Finalized─ VERIFIED ◄─(send verification)─ AGREED
//
//   any non-final ─Terminate─► TERMINATING ─(send termination)─► TERMINATED
//
// Failed sends re-enter their state until the retry limit, then terminate.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use statemachine::{
    has_state, is_not_pending, CommandQueue, CommandQueueError, CommandRunner, ConflictPolicy,
    Criterion, EntityCommand, Lifecycle, ManagerState, Observable, Processor, RetryPolicy,
    RoundReport, StateCode, StateEntityStore, StateMachineManager, StatefulEntity, StoreError,
};
use tracing::{info, warn};

use super::commands::{self, NegotiationCommand};
use super::model::{ContractNegotiation, ContractRequest, NegotiationState};
use crate::config::Config;
use crate::error::ConnectorError;
use crate::kernel::{
    ConnectorDeps, EventLogListener, MessageBody, ProtocolDispatcher, RemoteMessage,
};

const ENTITY: &str = "contract negotiation";

/// Per-entity work done by the negotiation processors.
struct NegotiationActions {
    lifecycle: Lifecycle<ContractNegotiation>,
    dispatcher: Arc<dyn ProtocolDispatcher>,
    retry: RetryPolicy,
}

impl NegotiationActions {
    async fn start_request(&self, mut negotiation: ContractNegotiation) -> Result<bool> {
        self.lifecycle
            .transition(&mut negotiation, NegotiationState::Requesting.code())
            .await?;
        Ok(true)
    }

    async fn send_request(&self, negotiation: ContractNegotiation) -> Result<bool> {
        let body = MessageBody::ContractRequest {
            offer_id: negotiation.offer_id.clone(),
            asset_id: negotiation.asset_id.clone(),
        };
        self.send(negotiation, body, NegotiationState::Requested).await
    }

    async fn send_verification(&self, negotiation: ContractNegotiation) -> Result<bool> {
        let agreement_id = negotiation.agreement.as_ref().map(|a| a.id.clone());
        match agreement_id {
            Some(agreement_id) => {
                let body = MessageBody::AgreementVerification { agreement_id };
                self.send(negotiation, body, NegotiationState::Verified).await
            }
            None => {
                let mut negotiation = negotiation;
                self.lifecycle
                    .transition_with_error(
                        &mut negotiation,
                        NegotiationState::Terminated.code(),
                        "agreed negotiation has no agreement",
                    )
                    .await?;
                Ok(true)
            }
        }
    }

    async fn send_termination(&self, negotiation: ContractNegotiation) -> Result<bool> {
        let body = MessageBody::Termination {
            reason: negotiation.base.error_detail.clone(),
        };
        self.send(negotiation, body, NegotiationState::Terminated).await
    }

    /// Deliver `body`; on success move to `next`, otherwise count a retry.
    async fn send(
        &self,
        mut negotiation: ContractNegotiation,
        body: MessageBody,
        next: NegotiationState,
    ) -> Result<bool> {
        if !self.retry.is_due(&negotiation, self.lifecycle.now()) {
            return Ok(false);
        }

        let kind = body.kind();
        let message = RemoteMessage {
            process_id: negotiation.base.id.clone(),
            counter_party_address: negotiation.counter_party_address.clone(),
            protocol: negotiation.protocol.clone(),
            body,
        };

        match self.dispatcher.dispatch(message).await {
            Ok(()) => {
                self.lifecycle.transition(&mut negotiation, next.code()).await?;
            }
            Err(e) => {
                warn!(
                    negotiation_id = %negotiation.id(),
                    kind,
                    attempt = negotiation.state_count() + 1,
                    error = %e,
                    "failed to send negotiation message"
                );
                self.lifecycle
                    .retry_or_terminate(
                        &mut negotiation,
                        &self.retry,
                        NegotiationState::Terminated.code(),
                        format!("sending {} failed: {:#}", kind, e),
                    )
                    .await?;
            }
        }
        Ok(true)
    }
}

/// Drives consumer-side contract negotiations.
pub struct NegotiationManager {
    lifecycle: Lifecycle<ContractNegotiation>,
    commands: CommandQueue<NegotiationCommand>,
    engine: StateMachineManager,
}

impl NegotiationManager {
    pub fn new(
        config: &Config,
        store: Arc<dyn StateEntityStore<ContractNegotiation>>,
        deps: &ConnectorDeps,
    ) -> Result<Self, ConnectorError> {
        let observable = Observable::default().with_listener(
            EventLogListener::<NegotiationState>::new("negotiation", Arc::clone(&deps.publisher)),
        );
        let lifecycle = Lifecycle::new(
            Arc::clone(&store),
            Arc::new(observable),
            Arc::clone(&deps.clock),
        );

        let retry = config.retry_policy()?;
        let actions = Arc::new(NegotiationActions {
            lifecycle: lifecycle.clone(),
            dispatcher: Arc::clone(&deps.dispatcher),
            retry,
        });

        let (queue, inbox) = CommandQueue::bounded(config.command_queue_capacity);
        let runner = CommandRunner::new(
            "negotiation-commands",
            queue.clone(),
            inbox,
            commands::registry(Arc::clone(&deps.clock))?,
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
        let engine = StateMachineManager::new(
            config.manager_config("negotiations"),
            Arc::new(config.wait_strategy()),
        )?
        .with_commands(runner)
        .with_processor(processors.on("negotiation-initial", NegotiationState::Initial, |a, n| {
            async move { a.start_request(n).await }
        }))
        .with_processor(processors.on("negotiation-requesting", NegotiationState::Requesting, |a, n| {
            async move { a.send_request(n).await }
        }))
        .with_processor(processors.on("negotiation-agreed", NegotiationState::Agreed, |a, n| {
            async move { a.send_verification(n).await }
        }))
        .with_processor(processors.on("negotiation-terminating", NegotiationState::Terminating, |a, n| {
            async move { a.send_termination(n).await }
        }));

        Ok(Self {
            lifecycle,
            commands: queue,
            engine,
        })
    }

    /// Start a negotiation for the requested offer.
    pub async fn initiate(
        &self,
        request: ContractRequest,
    ) -> Result<ContractNegotiation, ConnectorError> {
        let mut negotiation = ContractNegotiation::new(request, self.lifecycle.now());
        self.lifecycle.create(&mut negotiation).await?;
        info!(
            negotiation_id = %negotiation.id(),
            counter_party = %negotiation.counter_party_address,
            offer_id = %negotiation.offer_id,
            "contract negotiation initiated"
        );
        Ok(negotiation)
    }

    pub async fn find(&self, id: &str) -> Result<ContractNegotiation, ConnectorError> {
        self.lifecycle
            .store()
            .find_by_id(id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })
    }

    /// Negotiations currently in `state`, oldest first.
    pub async fn list(
        &self,
        state: NegotiationState,
        limit: usize,
    ) -> Result<Vec<ContractNegotiation>, ConnectorError> {
        Ok(self
            .lifecycle
            .store()
            .query(&[has_state(state.code())], limit)
            .await?)
    }

    /// Queue a command for the next round.
    pub fn enqueue(&self, command: NegotiationCommand) -> Result<(), ConnectorError> {
        self.commands.enqueue(command).map_err(queue_error)
    }

    /// Delete a negotiation that never reached an agreement.
    pub async fn delete(&self, id: &str) -> Result<ContractNegotiation, ConnectorError> {
        let store = self.lifecycle.store();
        let negotiation = store.find_by_id_and_lease(id).await.map_err(|e| match e {
            StoreError::NotFound(_) => ConnectorError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            },
            other => other.into(),
        })?;

        if negotiation.agreement.is_some() {
            self.lifecycle.release(&negotiation).await?;
            return Err(ConnectorError::DeletionRefused {
                entity: ENTITY,
                id: id.to_string(),
                reason: "an agreement exists".to_string(),
            });
        }

        // a command applied since the check bumps the version
        match store.delete_by_id(id, negotiation.version()).await {
            Ok(deleted) => {
                info!(negotiation_id = %id, "contract negotiation deleted");
                Ok(deleted)
            }
            Err(StoreError::Conflict { .. }) => {
                self.lifecycle.release(&negotiation).await?;
                Err(ConnectorError::DeletionRefused {
                    entity: ENTITY,
                    id: id.to_string(),
                    reason: "the negotiation changed while deleting".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
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

/// Builds leasing processors for one state each, skipping pending entities
/// and those still backing off.
struct Processors {
    store: Arc<dyn StateEntityStore<ContractNegotiation>>,
    batch_size: usize,
    due: Criterion<ContractNegotiation>,
    actions: Arc<NegotiationActions>,
}

impl Processors {
    fn on<F, Fut>(&self, name: &str, state: NegotiationState, f: F) -> Processor<ContractNegotiation>
    where
        F: Fn(Arc<NegotiationActions>, ContractNegotiation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let actions = Arc::clone(&self.actions);
        Processor::leasing(
            name,
            Arc::clone(&self.store),
            self.batch_size,
            vec![has_state(state.code()), is_not_pending(), self.due.clone()],
            move |negotiation| f(Arc::clone(&actions), negotiation),
        )
    }
}

fn queue_error(e: CommandQueueError<NegotiationCommand>) -> ConnectorError {
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
