use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use statemachine::{
    CommandHandlerRegistry, CommandOutcome, EngineError, EntityCommand, StateCode,
    StatefulEntity,
};

use super::model::{TransferProcess, TransferState};

/// Transfer domain commands
///
/// Callbacks from the provider and the provisioning layer, plus operator
/// overrides that bypass the normal message exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferCommand {
    /// Asynchronous provisioning finished
    ProvisionCompleted {
        transfer_id: String,
        resource_id: String,
    },

    /// Release a transfer held by the pending guard
    Resume { transfer_id: String },

    /// The provider started the transfer
    Started {
        transfer_id: String,
        data_address: String,
    },

    /// Consumer finished pulling data; notify the provider
    Complete { transfer_id: String },

    /// Operator override: mark completed without messaging
    ForceComplete { transfer_id: String },

    /// Operator override: terminate without messaging
    ForceFail { transfer_id: String, reason: String },

    /// Abort the transfer and notify the provider
    Terminate { transfer_id: String, reason: String },
}

impl EntityCommand for TransferCommand {
    fn entity_id(&self) -> &str {
        match self {
            TransferCommand::ProvisionCompleted { transfer_id, .. }
            | TransferCommand::Resume { transfer_id }
            | TransferCommand::Started { transfer_id, .. }
            | TransferCommand::Complete { transfer_id }
            | TransferCommand::ForceComplete { transfer_id }
            | TransferCommand::ForceFail { transfer_id, .. }
            | TransferCommand::Terminate { transfer_id, .. } => transfer_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TransferCommand::ProvisionCompleted { .. } => "provision_completed",
            TransferCommand::Resume { .. } => "resume",
            TransferCommand::Started { .. } => "started",
            TransferCommand::Complete { .. } => "complete",
            TransferCommand::ForceComplete { .. } => "force_complete",
            TransferCommand::ForceFail { .. } => "force_fail",
            TransferCommand::Terminate { .. } => "terminate",
        }
    }
}

pub(crate) fn registry(
) -> Result<CommandHandlerRegistry<TransferProcess, TransferCommand>, EngineError> {
    let mut registry: CommandHandlerRegistry<TransferProcess, TransferCommand> =
        CommandHandlerRegistry::new();

    registry.register_fn("provision_completed", |transfer, command| {
        let TransferCommand::ProvisionCompleted { resource_id, .. } = command else {
            bail!("provision_completed handler got {:?}", command);
        };
        let state = state_of(transfer)?;
        if state != TransferState::Provisioning || !transfer.is_pending() {
            return Ok(rejected("provisioning result", state));
        }
        transfer.base.pending = false;
        transfer.resource_id = Some(resource_id.clone());
        Ok(CommandOutcome::TransitionTo(TransferState::Provisioned.code()))
    })?;

    registry.register_fn("resume", |transfer, _command| {
        let state = state_of(transfer)?;
        if state != TransferState::Initial || !transfer.is_pending() {
            return Ok(rejected("resume", state));
        }
        transfer.base.pending = false;
        Ok(CommandOutcome::TransitionTo(TransferState::Provisioning.code()))
    })?;

    registry.register_fn("started", |transfer, command| {
        let TransferCommand::Started { data_address, .. } = command else {
            bail!("started handler got {:?}", command);
        };
        let state = state_of(transfer)?;
        if state != TransferState::Requested {
            return Ok(rejected("start", state));
        }
        transfer.data_address = Some(data_address.clone());
        Ok(CommandOutcome::TransitionTo(TransferState::Started.code()))
    })?;

    registry.register_fn("complete", |transfer, _command| {
        let state = state_of(transfer)?;
        if state != TransferState::Started {
            return Ok(rejected("completion", state));
        }
        Ok(CommandOutcome::TransitionTo(TransferState::Completing.code()))
    })?;

    registry.register_fn("force_complete", |transfer, _command| {
        let state = state_of(transfer)?;
        if state.is_final() {
            return Ok(rejected("forced completion", state));
        }
        transfer.base.pending = false;
        Ok(CommandOutcome::TransitionTo(TransferState::Completed.code()))
    })?;

    registry.register_fn("force_fail", |transfer, command| {
        let TransferCommand::ForceFail { reason, .. } = command else {
            bail!("force_fail handler got {:?}", command);
        };
        let state = state_of(transfer)?;
        if state.is_final() {
            return Ok(rejected("forced failure", state));
        }
        transfer.base.pending = false;
        transfer.base.error_detail = Some(reason.clone());
        Ok(CommandOutcome::TransitionTo(TransferState::Terminated.code()))
    })?;

    registry.register_fn("terminate", |transfer, command| {
        let TransferCommand::Terminate { reason, .. } = command else {
            bail!("terminate handler got {:?}", command);
        };
        let state = state_of(transfer)?;
        if state.is_final() || state == TransferState::Terminating {
            return Ok(rejected("termination", state));
        }
        transfer.base.pending = false;
        transfer.base.error_detail = Some(reason.clone());
        Ok(CommandOutcome::TransitionTo(TransferState::Terminating.code()))
    })?;

    Ok(registry)
}

fn state_of(transfer: &TransferProcess) -> Result<TransferState> {
    transfer.transfer_state().ok_or_else(|| {
        anyhow!(
            "transfer {} has unknown state {}",
            transfer.id(),
            transfer.state()
        )
    })
}

fn rejected(what: &str, state: TransferState) -> CommandOutcome {
    CommandOutcome::Rejected(format!("{} not accepted in state {}", what, state.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::transfer::TransferRequest;

    fn transfer_in(state: TransferState) -> TransferProcess {
        let request = TransferRequest::new("https://provider.example", "agr-1", "asset-1");
        let mut transfer = TransferProcess::new(request, 0);
        transfer.base.state = state.code();
        transfer
    }

    async fn apply(transfer: &mut TransferProcess, command: TransferCommand) -> CommandOutcome {
        let registry = registry().unwrap();
        let handler = registry.get(command.kind()).unwrap();
        handler.handle(transfer, &command).await.unwrap()
    }

    #[test]
    fn test_every_command_kind_has_a_handler() {
        let registry = registry().unwrap();
        for kind in [
            "provision_completed",
            "resume",
            "started",
            "complete",
            "force_complete",
            "force_fail",
            "terminate",
        ] {
            assert!(registry.is_registered(kind), "{} missing", kind);
        }
        assert_eq!(registry.len(), 7);
    }

    #[tokio::test]
    async fn test_provision_completed_requires_pending_provisioning() {
        let mut transfer = transfer_in(TransferState::Provisioning);
        let id = transfer.id().to_string();
        let command = TransferCommand::ProvisionCompleted {
            transfer_id: id,
            resource_id: "bucket-7".into(),
        };

        let outcome = apply(&mut transfer, command.clone()).await;
        assert!(matches!(outcome, CommandOutcome::Rejected(_)));

        transfer.base.pending = true;
        let outcome = apply(&mut transfer, command).await;
        assert_eq!(outcome, CommandOutcome::TransitionTo(TransferState::Provisioned.code()));
        assert!(!transfer.is_pending());
        assert_eq!(transfer.resource_id.as_deref(), Some("bucket-7"));
    }

    #[tokio::test]
    async fn test_started_records_data_address() {
        let mut transfer = transfer_in(TransferState::Requested);
        let id = transfer.id().to_string();
        let outcome = apply(
            &mut transfer,
            TransferCommand::Started {
                transfer_id: id,
                data_address: "https://provider.example/public/abc".into(),
            },
        )
        .await;
        assert_eq!(outcome, CommandOutcome::TransitionTo(TransferState::Started.code()));
        assert_eq!(
            transfer.data_address.as_deref(),
            Some("https://provider.example/public/abc")
        );
    }

    #[tokio::test]
    async fn test_force_fail_clears_pending_and_records_reason() {
        let mut transfer = transfer_in(TransferState::Provisioning);
        transfer.base.pending = true;
        let id = transfer.id().to_string();
        let outcome = apply(
            &mut transfer,
            TransferCommand::ForceFail {
                transfer_id: id,
                reason: "operator abort".into(),
            },
        )
        .await;
        assert_eq!(outcome, CommandOutcome::TransitionTo(TransferState::Terminated.code()));
        assert!(!transfer.is_pending());
        assert_eq!(transfer.base.error_detail.as_deref(), Some("operator abort"));
    }

    #[tokio::test]
    async fn test_overrides_rejected_on_final_transfers() {
        let mut transfer = transfer_in(TransferState::Completed);
        let id = transfer.id().to_string();
        let outcome = apply(
            &mut transfer,
            TransferCommand::ForceComplete { transfer_id: id },
        )
        .await;
        assert!(matches!(outcome, CommandOutcome::Rejected(reason) if reason.contains("Completed")));
    }
}
