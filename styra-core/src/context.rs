//! Per-run orchestration context
//!
//! One [`RunContext`] is constructed at the start of an orchestration run and
//! discarded at the end. It carries the control-plane endpoint, the
//! credentials for it, and the single deadline every blocking remote call in
//! the run must observe.

use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::error::{StyraError, StyraResult};

/// Credentials presented to the control plane
#[derive(Debug, Clone)]
pub enum Credentials {
    Token(String),
    Basic { username: String, password: String },
    Anonymous,
}

/// A fixed point in time every call in a run must finish before
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    total: Duration,
}

impl Deadline {
    pub fn after(total: Duration) -> Self {
        Self {
            at: Instant::now() + total,
            total,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left before the deadline, zero once elapsed
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// True when at least `d` of budget is left
    pub fn allows(&self, d: Duration) -> bool {
        self.remaining() >= d
    }

    /// The timeout error reported when this deadline cuts an operation short
    pub fn error(&self, operation: &str) -> StyraError {
        StyraError::Timeout {
            operation: operation.to_string(),
            timeout_secs: self.total.as_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub endpoint: Url,
    pub credentials: Credentials,
    deadline: Deadline,
}

impl RunContext {
    pub fn new(endpoint: Url, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            endpoint,
            credentials,
            deadline: Deadline::after(timeout),
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Fail fast when the run deadline has elapsed
    pub fn check(&self, operation: &str) -> StyraResult<()> {
        if self.deadline.expired() {
            Err(self.deadline.error(operation))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_context_passes_check() {
        let ctx = RunContext::new(
            Url::parse("https://host.example:8440").unwrap(),
            Credentials::Anonymous,
            Duration::from_secs(30),
        );
        assert!(ctx.check("validate").is_ok());
        assert!(ctx.deadline().allows(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn elapsed_deadline_fails_check_with_timeout() {
        let ctx = RunContext::new(
            Url::parse("https://host.example:8440").unwrap(),
            Credentials::Token("t".to_string()),
            Duration::from_millis(1),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = ctx.check("create-base-entity").unwrap_err();
        match err {
            StyraError::Timeout { operation, .. } => {
                assert_eq!(operation, "create-base-entity");
            }
            other => panic!("expected timeout, got {other}"),
        }
    }
}
