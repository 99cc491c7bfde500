// TestDependencies - recording doubles for the kernel collaborators
//
// Injected through ConnectorDeps so tests can script failures and inspect
// what the state machines sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{EventPublisher, ProtocolDispatcher, ProvisionResponse, Provisioner, RemoteMessage};
use crate::domains::transfer::TransferProcess;

// =============================================================================
// Recording Dispatcher
// =============================================================================

/// Records every delivered message; can be told to fail.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: RwLock<Vec<RemoteMessage>>,
    failing_sends: AtomicUsize,
    unreachable: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` dispatches.
    pub fn fail_next(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Fail every dispatch until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delivered messages, oldest first.
    pub fn sent(&self) -> Vec<RemoteMessage> {
        self.sent.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Delivered messages of one kind.
    pub fn sent_of_kind(&self, kind: &str) -> Vec<RemoteMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.body.kind() == kind)
            .collect()
    }

    /// Dispatch calls including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("counter-party {} unreachable", message.counter_party_address);
        }
        let scripted_failure = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            bail!("connection reset by {}", message.counter_party_address);
        }
        self.sent
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

// =============================================================================
// Scripted Provisioner
// =============================================================================

/// Returns queued responses in order, then `Ready` with a derived resource id.
#[derive(Default)]
pub struct ScriptedProvisioner {
    responses: Mutex<VecDeque<Result<ProvisionResponse, String>>>,
    calls: AtomicUsize,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: ProvisionResponse) {
        self.lock().push_back(Ok(response));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.lock().push_back(Err(message.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ProvisionResponse, String>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn provision(&self, transfer: &TransferProcess) -> Result<ProvisionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lock().pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => bail!(message),
            None => Ok(ProvisionResponse::Ready {
                resource_id: format!("res-{}", transfer.base.id),
            }),
        }
    }
}

// =============================================================================
// Memory Publisher
// =============================================================================

/// A published event.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub subject: String,
    pub payload: Value,
}

/// Keeps published events in memory.
#[derive(Default)]
pub struct MemoryPublisher {
    published: RwLock<Vec<PublishedEvent>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedEvent> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.published().into_iter().map(|e| e.subject).collect()
    }

    pub fn was_published_to(&self, subject: &str) -> bool {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.subject == subject)
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, subject: String, payload: Value) -> Result<()> {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedEvent { subject, payload });
        Ok(())
    }
}
