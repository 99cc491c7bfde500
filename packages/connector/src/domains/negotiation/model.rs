use serde::{Deserialize, Serialize};
use statemachine::{EntityState, StateCode, StatefulEntity, TraceContext};

pub const DEFAULT_PROTOCOL: &str = "dataspace-protocol-http";

/// Consumer-side contract negotiation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationState {
    Initial,
    Requesting,
    Requested,
    Agreed,
    Verified,
    Finalized,
    Terminating,
    Terminated,
}

impl NegotiationState {
    pub const ALL: [NegotiationState; 8] = [
        NegotiationState::Initial,
        NegotiationState::Requesting,
        NegotiationState::Requested,
        NegotiationState::Agreed,
        NegotiationState::Verified,
        NegotiationState::Finalized,
        NegotiationState::Terminating,
        NegotiationState::Terminated,
    ];

    pub fn is_final(self) -> bool {
        matches!(self, NegotiationState::Finalized | NegotiationState::Terminated)
    }
}

impl StateCode for NegotiationState {
    fn code(self) -> i32 {
        match self {
            NegotiationState::Initial => 50,
            NegotiationState::Requesting => 100,
            NegotiationState::Requested => 200,
            NegotiationState::Agreed => 850,
            NegotiationState::Verified => 1100,
            NegotiationState::Finalized => 1200,
            NegotiationState::Terminating => 1300,
            NegotiationState::Terminated => 1400,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }
}

/// Agreement received from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAgreement {
    pub id: String,
    pub asset_id: String,
    pub signed_at: i64,
}

/// What a consumer asks for when it starts negotiating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRequest {
    pub counter_party_address: String,
    pub protocol: String,
    pub offer_id: String,
    pub asset_id: String,
    #[serde(default)]
    pub trace_context: TraceContext,
}

impl ContractRequest {
    pub fn new(
        counter_party_address: impl Into<String>,
        offer_id: impl Into<String>,
        asset_id: impl Into<String>,
    ) -> Self {
        Self {
            counter_party_address: counter_party_address.into(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            offer_id: offer_id.into(),
            asset_id: asset_id.into(),
            trace_context: TraceContext::default(),
        }
    }

    pub fn with_trace_context(mut self, trace_context: TraceContext) -> Self {
        self.trace_context = trace_context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    pub base: EntityState,
    pub counter_party_address: String,
    pub protocol: String,
    pub offer_id: String,
    pub asset_id: String,
    pub agreement: Option<ContractAgreement>,
}

impl ContractNegotiation {
    /// A fresh negotiation in [`NegotiationState::Initial`].
    pub fn new(request: ContractRequest, now: i64) -> Self {
        let mut base = EntityState::generate(NegotiationState::Initial.code(), now);
        base.trace_context = request.trace_context;
        Self {
            base,
            counter_party_address: request.counter_party_address,
            protocol: request.protocol,
            offer_id: request.offer_id,
            asset_id: request.asset_id,
            agreement: None,
        }
    }

    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        NegotiationState::from_code(self.base.state)
    }
}

impl StatefulEntity for ContractNegotiation {
    fn entity_state(&self) -> &EntityState {
        &self.base
    }

    fn entity_state_mut(&mut self) -> &mut EntityState {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip_and_are_ordered() {
        let codes: Vec<i32> = NegotiationState::ALL.iter().map(|s| s.code()).collect();
        assert!(codes.windows(2).all(|w| w[0] < w[1]));
        for state in NegotiationState::ALL {
            assert_eq!(NegotiationState::from_code(state.code()), Some(state));
        }
        assert_eq!(NegotiationState::from_code(7), None);
    }

    #[test]
    fn test_new_negotiation_carries_request() {
        let trace = TraceContext::new().with("traceparent", "00-a-b-01");
        let request = ContractRequest::new("https://provider.example/dsp", "offer-1", "asset-1")
            .with_trace_context(trace.clone());
        let negotiation = ContractNegotiation::new(request, 5_000);

        assert_eq!(negotiation.negotiation_state(), Some(NegotiationState::Initial));
        assert_eq!(negotiation.base.state_timestamp, 5_000);
        assert_eq!(negotiation.base.trace_context, trace);
        assert_eq!(negotiation.protocol, DEFAULT_PROTOCOL);
        assert!(negotiation.agreement.is_none());
    }
}
