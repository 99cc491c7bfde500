// ConnectorKernel - the domain managers of one connector instance
//
// Both managers share the instance's runtime id as lease holder, so a second
// instance pointed at the same stores competes for entities through leases.

use std::sync::Arc;

use statemachine::{InMemoryStateEntityStore, RoundReport};
use tracing::info;

use super::ConnectorDeps;
use crate::config::Config;
use crate::domains::negotiation::{ContractNegotiation, NegotiationManager};
use crate::domains::transfer::{TransferManager, TransferProcess};
use crate::error::ConnectorError;

pub struct ConnectorKernel {
    pub negotiations: NegotiationManager,
    pub transfers: TransferManager,
}

impl ConnectorKernel {
    pub fn new(negotiations: NegotiationManager, transfers: TransferManager) -> Self {
        Self {
            negotiations,
            transfers,
        }
    }

    /// Kernel backed by in-process stores.
    pub fn in_memory(config: &Config, deps: &ConnectorDeps) -> Result<Self, ConnectorError> {
        config.validate()?;

        let negotiation_store = Arc::new(InMemoryStateEntityStore::<ContractNegotiation>::with_lease_duration(
            config.runtime_id.clone(),
            Arc::clone(&deps.clock),
            config.lease_ms,
        ));
        let transfer_store = Arc::new(InMemoryStateEntityStore::<TransferProcess>::with_lease_duration(
            config.runtime_id.clone(),
            Arc::clone(&deps.clock),
            config.lease_ms,
        ));

        Ok(Self::new(
            NegotiationManager::new(config, negotiation_store, deps)?,
            TransferManager::new(config, transfer_store, deps)?,
        ))
    }

    pub fn start(&self) -> Result<(), ConnectorError> {
        self.negotiations.start()?;
        self.transfers.start()?;
        info!("connector kernel started");
        Ok(())
    }

    /// Stop both managers, returning the first failure.
    pub async fn stop(&self) -> Result<(), ConnectorError> {
        let negotiations = self.negotiations.stop().await;
        let transfers = self.transfers.stop().await;
        negotiations.and(transfers)
    }

    /// One round of each manager on the caller's task.
    pub async fn run_round(&self) -> RoundReport {
        let mut report = self.negotiations.run_round().await;
        report.merge(self.transfers.run_round().await);
        report
    }
}
