//! Outbound protocol messages.
//!
//! The wire format belongs to the protocol adapters; the state machines only
//! describe *what* has to reach the counter-party and react to whether the
//! hand-off succeeded.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One message for a counter-party, tied to the local process that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub process_id: String,
    pub counter_party_address: String,
    pub protocol: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    ContractRequest {
        offer_id: String,
        asset_id: String,
    },
    AgreementVerification {
        agreement_id: String,
    },
    TransferRequest {
        contract_id: String,
        asset_id: String,
        resource_id: Option<String>,
    },
    TransferCompletion,
    Termination {
        reason: Option<String>,
    },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::ContractRequest { .. } => "contract_request",
            MessageBody::AgreementVerification { .. } => "agreement_verification",
            MessageBody::TransferRequest { .. } => "transfer_request",
            MessageBody::TransferCompletion => "transfer_completion",
            MessageBody::Termination { .. } => "termination",
        }
    }
}

/// Hands messages to the protocol layer.
///
/// An `Err` means the message was not delivered and the sending process
/// should retry it.
#[async_trait]
pub trait ProtocolDispatcher: Send + Sync {
    async fn dispatch(&self, message: RemoteMessage) -> Result<()>;
}

/// Dispatcher for standalone runs: logs every message and reports success.
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl ProtocolDispatcher for LoggingDispatcher {
    async fn dispatch(&self, message: RemoteMessage) -> Result<()> {
        info!(
            process_id = %message.process_id,
            counter_party = %message.counter_party_address,
            protocol = %message.protocol,
            kind = message.body.kind(),
            "dispatching remote message"
        );
        Ok(())
    }
}
