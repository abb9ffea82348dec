//! Engine configuration
//!
//! Centralizes the timeouts and polling budgets, overridable through
//! `STYRA_*` environment variables for different deployments.

use std::env;
use std::time::Duration;

use crate::poll::PollOptions;

/// Parse an environment variable as a typed value with a default fallback
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse an environment variable as a humantime duration ("30s", "10m")
fn env_duration_or_default(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline attached to every orchestration run
    pub operation_timeout: Duration,
    /// Budget for waiting on the internal guest address
    pub address_wait: PollOptions,
    /// Budget for confirming a deleted machine is actually gone
    pub destroy_wait: PollOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout: env_duration_or_default(
                "STYRA_OPERATION_TIMEOUT",
                Duration::from_secs(30 * 60),
            ),
            address_wait: PollOptions::new(
                env_var_or_default("STYRA_ADDRESS_WAIT_ATTEMPTS", 10),
                env_duration_or_default("STYRA_ADDRESS_WAIT_INTERVAL", Duration::from_secs(5)),
            ),
            destroy_wait: PollOptions::new(
                env_var_or_default("STYRA_DESTROY_WAIT_ATTEMPTS", 10),
                env_duration_or_default("STYRA_DESTROY_WAIT_INTERVAL", Duration::from_secs(5)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = EngineConfig::default();
        assert_eq!(config.address_wait.attempts, 10);
        assert_eq!(config.address_wait.interval, Duration::from_secs(5));
        assert_eq!(config.destroy_wait.attempts, 10);
        assert_eq!(config.operation_timeout, Duration::from_secs(1800));
    }
}
