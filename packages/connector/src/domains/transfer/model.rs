use serde::{Deserialize, Serialize};
use statemachine::{EntityState, StateCode, StatefulEntity, TraceContext};

use crate::domains::negotiation::model::DEFAULT_PROTOCOL;

/// Consumer-side transfer process states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Initial,
    Provisioning,
    Provisioned,
    Requesting,
    Requested,
    Started,
    Completing,
    Completed,
    Terminating,
    Terminated,
}

impl TransferState {
    pub const ALL: [TransferState; 10] = [
        TransferState::Initial,
        TransferState::Provisioning,
        TransferState::Provisioned,
        TransferState::Requesting,
        TransferState::Requested,
        TransferState::Started,
        TransferState::Completing,
        TransferState::Completed,
        TransferState::Terminating,
        TransferState::Terminated,
    ];

    pub fn is_final(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Terminated)
    }
}

impl StateCode for TransferState {
    fn code(self) -> i32 {
        match self {
            TransferState::Initial => 100,
            TransferState::Provisioning => 200,
            TransferState::Provisioned => 300,
            TransferState::Requesting => 400,
            TransferState::Requested => 500,
            TransferState::Started => 600,
            TransferState::Completing => 750,
            TransferState::Completed => 800,
            TransferState::Terminating => 825,
            TransferState::Terminated => 850,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

/// What a consumer asks for when it starts a transfer under an agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub counter_party_address: String,
    pub protocol: String,
    pub contract_id: String,
    pub asset_id: String,
    pub transfer_type: String,
    #[serde(default)]
    pub trace_context: TraceContext,
}

impl TransferRequest {
    pub fn new(
        counter_party_address: impl Into<String>,
        contract_id: impl Into<String>,
        asset_id: impl Into<String>,
    ) -> Self {
        Self {
            counter_party_address: counter_party_address.into(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            contract_id: contract_id.into(),
            asset_id: asset_id.into(),
            transfer_type: "HttpData-PULL".to_string(),
            trace_context: TraceContext::default(),
        }
    }

    pub fn with_transfer_type(mut self, transfer_type: impl Into<String>) -> Self {
        self.transfer_type = transfer_type.into();
        self
    }

    pub fn with_trace_context(mut self, trace_context: TraceContext) -> Self {
        self.trace_context = trace_context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProcess {
    pub base: EntityState,
    pub counter_party_address: String,
    pub protocol: String,
    pub contract_id: String,
    pub asset_id: String,
    pub transfer_type: String,
    /// Consumer-side resource created by provisioning.
    pub resource_id: Option<String>,
    /// Where the provider exposed the data once started.
    pub data_address: Option<String>,
}

impl TransferProcess {
    /// A fresh transfer in [`TransferState::Initial`].
    pub fn new(request: TransferRequest, now: i64) -> Self {
        let mut base = EntityState::generate(TransferState::Initial.code(), now);
        base.trace_context = request.trace_context;
        Self {
            base,
            counter_party_address: request.counter_party_address,
            protocol: request.protocol,
            contract_id: request.contract_id,
            asset_id: request.asset_id,
            transfer_type: request.transfer_type,
            resource_id: None,
            data_address: None,
        }
    }

    pub fn transfer_state(&self) -> Option<TransferState> {
        TransferState::from_code(self.base.state)
    }
}

impl StatefulEntity for TransferProcess {
    fn entity_state(&self) -> &EntityState {
        &self.base
    }

    fn entity_state_mut(&mut self) -> &mut EntityState {
        &mut self.base
    }
}
