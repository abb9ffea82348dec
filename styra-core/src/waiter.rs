//! Waiting for eventually-consistent machine fields
//!
//! Some machine attributes (the internal network address above all) only
//! become valid once asynchronous provisioning inside the guest finishes.
//! This module re-fetches the machine on a fixed-interval budget and gives
//! up gracefully: exhaustion yields the `"-"` sentinel, never an error, so
//! a slow guest cannot fail an otherwise complete orchestration run.

use tracing::{debug, warn};

use crate::context::Deadline;
use crate::error::StyraResult;
use crate::poll::{poll_until, PollOptions};
use crate::remote::RemoteControl;
use crate::types::{Machine, MachineId, PowerState, FIELD_UNAVAILABLE};

/// Poll `extract` on the machine until it yields a value.
///
/// Stops immediately with the sentinel when the machine is missing or not in
/// `expected_state` — a machine that is not running will never produce the
/// field, so there is no point burning the rest of the budget. Read failures
/// are downgraded to warnings and consume an attempt.
pub async fn wait_for_field<F>(
    remote: &dyn RemoteControl,
    id: &MachineId,
    expected_state: PowerState,
    opts: &PollOptions,
    deadline: Option<Deadline>,
    extract: F,
) -> StyraResult<String>
where
    F: Fn(&Machine) -> Option<String>,
{
    let outcome = poll_until("wait-for-field", opts, deadline, || async {
        let machine = match remote.get_machine(id).await {
            Ok(Some(machine)) => machine,
            Ok(None) => {
                debug!("Machine {} disappeared while waiting for field", id);
                return Ok(Some(FIELD_UNAVAILABLE.to_string()));
            }
            Err(e) => {
                warn!("Re-fetching machine {} failed, will poll again: {}", id, e);
                return Ok(None);
            }
        };

        if machine.state != expected_state {
            debug!(
                "Machine '{}' is '{}' (expected '{}'), field will not materialize",
                machine.name, machine.state, expected_state
            );
            return Ok(Some(FIELD_UNAVAILABLE.to_string()));
        }

        match extract(&machine) {
            Some(value) if !value.is_empty() && value != FIELD_UNAVAILABLE => Ok(Some(value)),
            _ => Ok(None),
        }
    })
    .await?;

    Ok(outcome.unwrap_or_else(|| FIELD_UNAVAILABLE.to_string()))
}

/// The internal guest address, or the sentinel when it never materialized
pub async fn wait_for_internal_address(
    remote: &dyn RemoteControl,
    id: &MachineId,
    opts: &PollOptions,
    deadline: Option<Deadline>,
) -> StyraResult<String> {
    wait_for_field(remote, id, PowerState::Running, opts, deadline, |m| {
        m.internal_ip.clone()
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRemote;
    use std::time::Duration;

    fn fast_opts() -> PollOptions {
        PollOptions::new(5, Duration::from_millis(5))
    }

    fn seeded(remote: &FakeRemote, state: PowerState) -> MachineId {
        let id = MachineId("m-1".to_string());
        remote.seed_machine(Machine {
            id: id.clone(),
            name: "web-01".to_string(),
            state,
            external_ip: None,
            internal_ip: None,
        });
        id
    }

    #[tokio::test]
    async fn returns_address_once_provisioning_catches_up() {
        let remote = FakeRemote::new();
        let id = seeded(&remote, PowerState::Running);
        remote.internal_ip_after(&id, 2);

        let addr = wait_for_internal_address(&remote, &id, &fast_opts(), None)
            .await
            .unwrap();

        assert_eq!(addr, "10.211.55.7");
    }

    #[tokio::test]
    async fn stops_immediately_when_machine_is_not_running() {
        let remote = FakeRemote::new();
        let id = seeded(&remote, PowerState::Stopped);

        let start = tokio::time::Instant::now();
        let addr = wait_for_internal_address(
            &remote,
            &id,
            &PollOptions::new(10, Duration::from_secs(5)),
            None,
        )
        .await
        .unwrap();

        assert_eq!(addr, FIELD_UNAVAILABLE);
        // Bailed on the first probe instead of polling the whole budget.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn exhaustion_yields_sentinel_not_error() {
        let remote = FakeRemote::new();
        let id = seeded(&remote, PowerState::Running);
        // Address never appears.

        let addr = wait_for_internal_address(&remote, &id, &fast_opts(), None)
            .await
            .unwrap();

        assert_eq!(addr, FIELD_UNAVAILABLE);
    }

    #[tokio::test]
    async fn read_failures_are_downgraded_and_polling_continues() {
        let remote = FakeRemote::new();
        let id = seeded(&remote, PowerState::Running);
        remote.internal_ip_after(&id, 0);
        remote.fail_times("get_machine", 2);

        let addr = wait_for_internal_address(&remote, &id, &fast_opts(), None)
            .await
            .unwrap();

        assert_eq!(addr, "10.211.55.7");
    }

    #[tokio::test]
    async fn missing_machine_yields_sentinel() {
        let remote = FakeRemote::new();
        let id = MachineId("never-created".to_string());

        let addr = wait_for_internal_address(&remote, &id, &fast_opts(), None)
            .await
            .unwrap();

        assert_eq!(addr, FIELD_UNAVAILABLE);
    }
}
