//! Abstract contract for the remote control-plane API
//!
//! Everything the convergence engine does against the remote host goes
//! through this trait, so orchestration logic can be exercised against an
//! in-memory fake and the HTTP client can live in its own crate.
//!
//! Absence is not an error: getters return `Ok(None)` for entities that do
//! not exist, and callers decide whether that means "create it" or "already
//! gone".

use async_trait::async_trait;

use crate::error::StyraResult;
use crate::types::{
    ApiKey, Claim, ConfigEntry, HardwareSpec, Machine, MachineId, PowerOp, ProxyRoute, Role,
    SharedFolder, User,
};

/// Output of a script executed inside a machine: (exit_code, stdout, stderr)
pub type ScriptOutput = (i32, String, String);

#[async_trait]
pub trait RemoteControl: Send + Sync {
    // --- Machines ---

    /// Fetch a machine by remote ID; `Ok(None)` when it does not exist
    async fn get_machine(&self, id: &MachineId) -> StyraResult<Option<Machine>>;

    /// Look a machine up by name; `Ok(None)` when no machine carries it
    async fn find_machine(&self, name: &str) -> StyraResult<Option<Machine>>;

    /// Create the base machine entity from a source image.
    ///
    /// The machine comes back in whatever power state the control plane
    /// leaves freshly cloned machines in; callers must not assume `Stopped`.
    async fn create_machine(&self, name: &str, source: &str) -> StyraResult<Machine>;

    async fn delete_machine(&self, id: &MachineId) -> StyraResult<()>;

    /// Request a power transition. Returns whether the control plane accepted
    /// the operation; the resulting state must be re-queried, not assumed.
    async fn set_machine_power(&self, id: &MachineId, op: PowerOp) -> StyraResult<bool>;

    async fn rename_machine(&self, id: &MachineId, new_name: &str) -> StyraResult<()>;

    /// Apply hardware sizing; only valid while the machine is stopped
    async fn set_hardware(&self, id: &MachineId, hardware: &HardwareSpec) -> StyraResult<()>;

    /// Apply one machine setting; only valid while the machine is stopped
    async fn set_config_entry(&self, id: &MachineId, entry: &ConfigEntry) -> StyraResult<()>;

    /// Apply one raw hypervisor flag command; only valid while stopped
    async fn apply_flag(&self, id: &MachineId, flag: &str) -> StyraResult<()>;

    async fn add_shared_folder(&self, id: &MachineId, folder: &SharedFolder) -> StyraResult<()>;

    async fn remove_shared_folder(&self, id: &MachineId, name: &str) -> StyraResult<()>;

    /// Execute a script inside the machine (requires a running guest agent)
    async fn exec_script(&self, id: &MachineId, script: &str) -> StyraResult<ScriptOutput>;

    // --- Authorization principals ---

    async fn list_users(&self) -> StyraResult<Vec<User>>;
    async fn create_user(&self, user: &User) -> StyraResult<User>;
    async fn update_user(&self, user: &User) -> StyraResult<User>;
    async fn delete_user(&self, name: &str) -> StyraResult<()>;

    async fn list_roles(&self) -> StyraResult<Vec<Role>>;
    async fn create_role(&self, role: &Role) -> StyraResult<Role>;
    async fn delete_role(&self, name: &str) -> StyraResult<()>;

    async fn list_claims(&self) -> StyraResult<Vec<Claim>>;
    async fn create_claim(&self, claim: &Claim) -> StyraResult<Claim>;
    async fn delete_claim(&self, name: &str) -> StyraResult<()>;

    async fn list_api_keys(&self) -> StyraResult<Vec<ApiKey>>;
    async fn create_api_key(&self, key: &ApiKey) -> StyraResult<ApiKey>;
    async fn revoke_api_key(&self, name: &str) -> StyraResult<()>;

    // --- Reverse-proxy routes ---

    async fn list_proxy_routes(&self) -> StyraResult<Vec<ProxyRoute>>;
    async fn create_proxy_route(&self, route: &ProxyRoute) -> StyraResult<ProxyRoute>;
    async fn update_proxy_route(&self, route: &ProxyRoute) -> StyraResult<ProxyRoute>;
    async fn delete_proxy_route(&self, id: &str) -> StyraResult<()>;
}
