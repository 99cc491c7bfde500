use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use statemachine::{
    Clock, CommandHandlerRegistry, CommandOutcome, EngineError, EntityCommand, StateCode,
    StatefulEntity,
};

use super::model::{ContractAgreement, ContractNegotiation, NegotiationState};

/// Negotiation domain commands
///
/// Raised by the protocol layer when the provider answers, or by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NegotiationCommand {
    /// The provider sent a signed agreement
    AgreementReceived {
        negotiation_id: String,
        agreement_id: String,
    },

    /// The provider confirmed the verified agreement
    Finalized { negotiation_id: String },

    /// Abort the negotiation and notify the provider
    Terminate {
        negotiation_id: String,
        reason: String,
    },
}

impl EntityCommand for NegotiationCommand {
    fn entity_id(&self) -> &str {
        match self {
            NegotiationCommand::AgreementReceived { negotiation_id, .. }
            | NegotiationCommand::Finalized { negotiation_id }
            | NegotiationCommand::Terminate { negotiation_id, .. } => negotiation_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            NegotiationCommand::AgreementReceived { .. } => "agreement_received",
            NegotiationCommand::Finalized { .. } => "finalized",
            NegotiationCommand::Terminate { .. } => "terminate",
        }
    }
}

pub(crate) fn registry(
    clock: Arc<dyn Clock>,
) -> Result<CommandHandlerRegistry<ContractNegotiation, NegotiationCommand>, EngineError> {
    let mut registry: CommandHandlerRegistry<ContractNegotiation, NegotiationCommand> =
        CommandHandlerRegistry::new();

    registry.register_fn("agreement_received", move |negotiation, command| {
        let NegotiationCommand::AgreementReceived { agreement_id, .. } = command else {
            bail!("agreement_received handler got {:?}", command);
        };
        let state = state_of(negotiation)?;
        if state != NegotiationState::Requested {
            return Ok(rejected("agreement", state));
        }
        negotiation.agreement = Some(ContractAgreement {
            id: agreement_id.clone(),
            asset_id: negotiation.asset_id.clone(),
            signed_at: clock.now_millis(),
        });
        Ok(CommandOutcome::TransitionTo(NegotiationState::Agreed.code()))
    })?;

    registry.register_fn("finalized", |negotiation, _command| {
        let state = state_of(negotiation)?;
        if state != NegotiationState::Verified {
            return Ok(rejected("finalization", state));
        }
        Ok(CommandOutcome::TransitionTo(NegotiationState::Finalized.code()))
    })?;

    registry.register_fn("terminate", |negotiation, command| {
        let NegotiationCommand::Terminate { reason, .. } = command else {
            bail!("terminate handler got {:?}", command);
        };
        let state = state_of(negotiation)?;
        if state.is_final() || state == NegotiationState::Terminating {
            return Ok(rejected("termination", state));
        }
        negotiation.base.error_detail = Some(reason.clone());
        Ok(CommandOutcome::TransitionTo(NegotiationState::Terminating.code()))
    })?;

    Ok(registry)
}

fn state_of(negotiation: &ContractNegotiation) -> Result<NegotiationState> {
    negotiation.negotiation_state().ok_or_else(|| {
        anyhow!(
            "negotiation {} has unknown state {}",
            negotiation.id(),
            negotiation.state()
        )
    })
}

fn rejected(what: &str, state: NegotiationState) -> CommandOutcome {
    CommandOutcome::Rejected(format!("{} not accepted in state {}", what, state.name()))
}
