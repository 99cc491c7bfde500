use anyhow::Result;
use async_trait::async_trait;

use crate::domains::transfer::TransferProcess;

/// Result of asking for transfer resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionResponse {
    /// Resources exist and can be used right away.
    Ready { resource_id: String },
    /// Provisioning continues elsewhere; completion arrives as a command.
    InProgress,
}

/// Allocates consumer-side resources (buckets, endpoints, tokens) before a
/// transfer is requested.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, transfer: &TransferProcess) -> Result<ProvisionResponse>;
}

/// Provisioner that needs no external resources.
#[derive(Debug, Default)]
pub struct LocalProvisioner;

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(&self, transfer: &TransferProcess) -> Result<ProvisionResponse> {
        Ok(ProvisionResponse::Ready {
            resource_id: format!("local-{}", transfer.base.id),
        })
    }
}
