//! Machine power-state control
//!
//! Drives a machine between `stopped`, `running`, `paused` and `suspended`.
//! The operation issued is always chosen from the state the control plane
//! reports right now, never from what the caller assumes: resuming a
//! suspended machine and starting a stopped one both converge on `running`
//! through different operations.
//!
//! The controller issues at most one corrective transition per call and
//! never retries a failed one; retry policy lives with the orchestrator and
//! its polling helpers.

use tracing::{debug, info, warn};

use crate::error::{StyraError, StyraResult};
use crate::remote::RemoteControl;
use crate::types::{Machine, MachineId, PowerOp, PowerState};

pub struct PowerController<'a> {
    remote: &'a dyn RemoteControl,
}

impl<'a> PowerController<'a> {
    pub fn new(remote: &'a dyn RemoteControl) -> Self {
        Self { remote }
    }

    /// Re-query the machine; existence is required here
    pub async fn refresh(&self, id: &MachineId) -> StyraResult<Machine> {
        self.remote
            .get_machine(id)
            .await?
            .ok_or_else(|| StyraError::NotFound {
                resource: format!("machine {}", id),
            })
    }

    /// Single operation taking `current` to `target`, if one exists
    fn op_towards(current: PowerState, target: PowerState) -> Option<PowerOp> {
        if current == target {
            return None;
        }
        match (current, target) {
            (PowerState::Stopped, PowerState::Running) => Some(PowerOp::Start),
            (PowerState::Paused, PowerState::Running) => Some(PowerOp::Resume),
            (PowerState::Suspended, PowerState::Running) => Some(PowerOp::Resume),
            (PowerState::Unknown, PowerState::Running) => Some(PowerOp::Start),
            (_, PowerState::Stopped) => Some(PowerOp::Stop),
            (PowerState::Running, PowerState::Paused) => Some(PowerOp::Pause),
            (PowerState::Running, PowerState::Suspended) => Some(PowerOp::Suspend),
            // stopped/suspended -> paused and the like need an intermediate
            // running state; `restore` handles those.
            _ => None,
        }
    }

    /// Issue one transition and hand back the refreshed machine
    async fn transition(&self, machine: &Machine, op: PowerOp) -> StyraResult<Machine> {
        info!(
            "Machine '{}': issuing '{}' (observed state '{}')",
            machine.name, op, machine.state
        );
        let accepted = self.remote.set_machine_power(&machine.id, op).await?;
        if !accepted {
            return Err(StyraError::MachineOperationFailed {
                operation: op.as_str().to_string(),
                details: format!("control plane rejected '{}' for machine '{}'", op, machine.name),
            });
        }
        self.refresh(&machine.id).await
    }

    /// Converge on `target`, verifying the observed state afterwards
    async fn ensure_state(&self, machine: &Machine, target: PowerState) -> StyraResult<Machine> {
        if machine.state == target {
            debug!("Machine '{}' already {}", machine.name, target);
            return Ok(machine.clone());
        }

        let op = Self::op_towards(machine.state, target).ok_or_else(|| {
            StyraError::MachineOperationFailed {
                operation: format!("ensure-{}", target),
                details: format!(
                    "no single operation takes machine '{}' from '{}' to '{}'",
                    machine.name, machine.state, target
                ),
            }
        })?;

        let refreshed = self.transition(machine, op).await?;
        if refreshed.state != target {
            return Err(StyraError::MachineOperationFailed {
                operation: format!("ensure-{}", target),
                details: format!(
                    "machine '{}' is '{}' after '{}', expected '{}'",
                    refreshed.name, refreshed.state, op, target
                ),
            });
        }
        Ok(refreshed)
    }

    /// Idempotent: a stopped machine is a no-op success
    pub async fn ensure_stopped(&self, machine: &Machine) -> StyraResult<Machine> {
        self.ensure_state(machine, PowerState::Stopped).await
    }

    /// Idempotent: a running machine is a no-op success
    pub async fn ensure_running(&self, machine: &Machine) -> StyraResult<Machine> {
        self.ensure_state(machine, PowerState::Running).await
    }

    /// Undo power-state drift left behind by a configuration stage.
    ///
    /// `before` is the state captured before the stage ran; `machine` is the
    /// handle observed after it. Issues the minimal corrective operations to
    /// return to `before`, going through `running` where the control plane
    /// has no direct transition (a stopped machine cannot be paused in one
    /// step).
    pub async fn restore(&self, before: PowerState, machine: &Machine) -> StyraResult<Machine> {
        if machine.state == before {
            return Ok(machine.clone());
        }
        match before {
            PowerState::Running => self.ensure_running(machine).await,
            PowerState::Stopped => self.ensure_stopped(machine).await,
            PowerState::Paused => {
                let running = self.ensure_running(machine).await?;
                self.ensure_state(&running, PowerState::Paused).await
            }
            PowerState::Suspended => {
                let running = self.ensure_running(machine).await?;
                self.ensure_state(&running, PowerState::Suspended).await
            }
            PowerState::Unknown => {
                warn!(
                    "Machine '{}': pre-stage state was unknown, leaving it '{}'",
                    machine.name, machine.state
                );
                Ok(machine.clone())
            }
        }
    }
}
