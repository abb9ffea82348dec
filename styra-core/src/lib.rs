pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod poll;
pub mod power;
pub mod principals;
pub mod proxy;
pub mod reconcile;
pub mod remote;
pub mod state;
pub mod types;
pub mod waiter;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;

pub use config::EngineConfig;
pub use context::{Credentials, RunContext};
pub use error::{StyraError, StyraResult};
pub use orchestrator::Orchestrator;
pub use remote::RemoteControl;
pub use state::PersistedMachine;
