//! In-memory fake of the remote control plane for tests
//!
//! Behaves like a small hypervisor host: machines with power states,
//! principals, and proxy routes, all held in memory. Tests can inject
//! per-operation failures and inspect the call journal to assert ordering
//! and at-most-once semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{StyraError, StyraResult};
use crate::remote::{RemoteControl, ScriptOutput};
use crate::types::{
    ApiKey, Claim, ConfigEntry, HardwareSpec, Machine, MachineId, PowerOp, PowerState, ProxyRoute,
    Role, SharedFolder, User,
};

#[derive(Default)]
struct FakeState {
    machines: HashMap<String, Machine>,
    shared_folders: HashMap<String, Vec<SharedFolder>>,
    users: Vec<User>,
    roles: Vec<Role>,
    claims: Vec<Claim>,
    api_keys: Vec<ApiKey>,
    routes: HashMap<String, ProxyRoute>,
    journal: Vec<String>,
    /// operation name -> remaining injected failures
    failures: HashMap<String, u32>,
    /// machine id -> number of get_machine calls before the internal
    /// address becomes visible
    internal_ip_after: HashMap<String, u32>,
    /// machine ids that survive delete_machine, modeling a control plane
    /// that acknowledges the delete but never converges
    sticky_machines: Vec<String>,
    next_id: u64,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

pub struct FakeRemote {
    state: Mutex<FakeState>,
    /// Power state freshly created machines come back in
    pub created_state: PowerState,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            created_state: PowerState::Stopped,
        }
    }

    /// Make the next `times` invocations of `operation` fail
    pub fn fail_times(&self, operation: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(operation.to_string(), times);
    }

    /// Make the next invocation of `operation` fail
    pub fn fail_next(&self, operation: &str) {
        self.fail_times(operation, 1);
    }

    /// Every call made so far, in order
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    /// Number of power transitions issued so far
    pub fn power_calls(&self) -> usize {
        self.journal()
            .iter()
            .filter(|e| e.starts_with("power:"))
            .count()
    }

    /// Seed a machine directly into the fake host
    pub fn seed_machine(&self, machine: Machine) {
        let mut state = self.state.lock().unwrap();
        state.machines.insert(machine.id.0.clone(), machine);
    }

    /// Seed an existing proxy route
    pub fn seed_route(&self, route: ProxyRoute) {
        let mut state = self.state.lock().unwrap();
        let id = route
            .id
            .clone()
            .unwrap_or_else(|| state.next("r"));
        let mut seeded = route;
        seeded.id = Some(id.clone());
        state.routes.insert(id, seeded);
    }

    pub fn seed_role(&self, name: &str) {
        self.state.lock().unwrap().roles.push(Role {
            name: name.to_string(),
        });
    }

    /// The internal address of `id` becomes visible after `polls` further
    /// `get_machine` calls
    pub fn internal_ip_after(&self, id: &MachineId, polls: u32) {
        self.state
            .lock()
            .unwrap()
            .internal_ip_after
            .insert(id.0.clone(), polls);
    }

    /// Acknowledge deletes of `id` without ever removing it
    pub fn retain_on_delete(&self, id: &MachineId) {
        self.state
            .lock()
            .unwrap()
            .sticky_machines
            .push(id.0.clone());
    }

    pub fn machine_count(&self) -> usize {
        self.state.lock().unwrap().machines.len()
    }

    pub fn route_count(&self) -> usize {
        self.state.lock().unwrap().routes.len()
    }

    fn check_failure(state: &mut FakeState, operation: &str) -> StyraResult<()> {
        if let Some(remaining) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StyraError::Api {
                    operation: operation.to_string(),
                    details: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }

    fn record(state: &mut FakeState, entry: String) {
        state.journal.push(entry);
    }
}

#[async_trait]
impl RemoteControl for FakeRemote {
    async fn get_machine(&self, id: &MachineId) -> StyraResult<Option<Machine>> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "get_machine")?;

        // Model eventual consistency of the internal address.
        let mut reveal = false;
        if let Some(polls) = state.internal_ip_after.get_mut(&id.0) {
            if *polls == 0 {
                reveal = true;
            } else {
                *polls -= 1;
            }
        }
        if reveal {
            if let Some(machine) = state.machines.get_mut(&id.0) {
                machine.internal_ip = Some("10.211.55.7".to_string());
            }
            state.internal_ip_after.remove(&id.0);
        }

        Ok(state.machines.get(&id.0).cloned())
    }

    async fn find_machine(&self, name: &str) -> StyraResult<Option<Machine>> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "find_machine")?;
        Ok(state.machines.values().find(|m| m.name == name).cloned())
    }

    async fn create_machine(&self, name: &str, source: &str) -> StyraResult<Machine> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "create_machine")?;
        let id = state.next("m");
        let machine = Machine {
            id: MachineId(id.clone()),
            name: name.to_string(),
            state: self.created_state,
            external_ip: Some("192.168.1.50".to_string()),
            internal_ip: None,
        };
        state.machines.insert(id, machine.clone());
        Self::record(&mut state, format!("create_machine:{}:{}", name, source));
        Ok(machine)
    }

    async fn delete_machine(&self, id: &MachineId) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "delete_machine")?;
        if !state.sticky_machines.contains(&id.0) {
            state.machines.remove(&id.0);
            state.shared_folders.remove(&id.0);
        }
        Self::record(&mut state, format!("delete_machine:{}", id));
        Ok(())
    }

    async fn set_machine_power(&self, id: &MachineId, op: PowerOp) -> StyraResult<bool> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "set_machine_power")?;
        Self::record(&mut state, format!("power:{}:{}", id, op));

        let machine = state.machines.get_mut(&id.0).ok_or(StyraError::NotFound {
            resource: format!("machine {}", id),
        })?;
        machine.state = match op {
            PowerOp::Start | PowerOp::Resume => PowerState::Running,
            PowerOp::Stop => PowerState::Stopped,
            PowerOp::Pause => PowerState::Paused,
            PowerOp::Suspend => PowerState::Suspended,
        };
        Ok(true)
    }

    async fn rename_machine(&self, id: &MachineId, new_name: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "rename_machine")?;
        let machine = state.machines.get_mut(&id.0).ok_or(StyraError::NotFound {
            resource: format!("machine {}", id),
        })?;
        machine.name = new_name.to_string();
        Self::record(&mut state, format!("rename_machine:{}:{}", id, new_name));
        Ok(())
    }

    async fn set_hardware(&self, id: &MachineId, hardware: &HardwareSpec) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "set_hardware")?;
        Self::record(
            &mut state,
            format!("set_hardware:{}:{}c/{}mb", id, hardware.cpus, hardware.memory_mb),
        );
        Ok(())
    }

    async fn set_config_entry(&self, id: &MachineId, entry: &ConfigEntry) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "set_config_entry")?;
        Self::record(
            &mut state,
            format!("set_config_entry:{}:{}={}", id, entry.key, entry.value),
        );
        Ok(())
    }

    async fn apply_flag(&self, id: &MachineId, flag: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "apply_flag")?;
        Self::record(&mut state, format!("apply_flag:{}:{}", id, flag));
        Ok(())
    }

    async fn add_shared_folder(&self, id: &MachineId, folder: &SharedFolder) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "add_shared_folder")?;
        state
            .shared_folders
            .entry(id.0.clone())
            .or_default()
            .push(folder.clone());
        Self::record(&mut state, format!("add_shared_folder:{}:{}", id, folder.name));
        Ok(())
    }

    async fn remove_shared_folder(&self, id: &MachineId, name: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "remove_shared_folder")?;
        if let Some(folders) = state.shared_folders.get_mut(&id.0) {
            folders.retain(|f| f.name != name);
        }
        Self::record(&mut state, format!("remove_shared_folder:{}:{}", id, name));
        Ok(())
    }

    async fn exec_script(&self, id: &MachineId, script: &str) -> StyraResult<ScriptOutput> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "exec_script")?;
        let label = script.lines().next().unwrap_or("").to_string();
        Self::record(&mut state, format!("exec_script:{}:{}", id, label));
        Ok((0, String::new(), String::new()))
    }

    async fn list_users(&self) -> StyraResult<Vec<User>> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "list_users")?;
        Ok(state.users.clone())
    }

    async fn create_user(&self, user: &User) -> StyraResult<User> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "create_user")?;
        let mut created = user.clone();
        created.id = Some(state.next("u"));
        state.users.push(created.clone());
        Self::record(&mut state, format!("create_user:{}", user.name));
        Ok(created)
    }

    async fn update_user(&self, user: &User) -> StyraResult<User> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "update_user")?;
        let existing = state
            .users
            .iter_mut()
            .find(|u| u.name == user.name)
            .ok_or(StyraError::NotFound {
                resource: format!("user {}", user.name),
            })?;
        existing.password = user.password.clone();
        let updated = existing.clone();
        Self::record(&mut state, format!("update_user:{}", user.name));
        Ok(updated)
    }

    async fn delete_user(&self, name: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "delete_user")?;
        state.users.retain(|u| u.name != name);
        Self::record(&mut state, format!("delete_user:{}", name));
        Ok(())
    }

    async fn list_roles(&self) -> StyraResult<Vec<Role>> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "list_roles")?;
        Ok(state.roles.clone())
    }

    async fn create_role(&self, role: &Role) -> StyraResult<Role> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "create_role")?;
        state.roles.push(role.clone());
        Self::record(&mut state, format!("create_role:{}", role.name));
        Ok(role.clone())
    }

    async fn delete_role(&self, name: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "delete_role")?;
        state.roles.retain(|r| r.name != name);
        Self::record(&mut state, format!("delete_role:{}", name));
        Ok(())
    }

    async fn list_claims(&self) -> StyraResult<Vec<Claim>> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "list_claims")?;
        Ok(state.claims.clone())
    }

    async fn create_claim(&self, claim: &Claim) -> StyraResult<Claim> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "create_claim")?;
        state.claims.push(claim.clone());
        Self::record(&mut state, format!("create_claim:{}", claim.name));
        Ok(claim.clone())
    }

    async fn delete_claim(&self, name: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "delete_claim")?;
        state.claims.retain(|c| c.name != name);
        Self::record(&mut state, format!("delete_claim:{}", name));
        Ok(())
    }

    async fn list_api_keys(&self) -> StyraResult<Vec<ApiKey>> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "list_api_keys")?;
        Ok(state.api_keys.clone())
    }

    async fn create_api_key(&self, key: &ApiKey) -> StyraResult<ApiKey> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "create_api_key")?;
        let mut created = key.clone();
        created.id = Some(state.next("k"));
        created.secret = Some("generated-secret".to_string());
        state.api_keys.push(created.clone());
        Self::record(&mut state, format!("create_api_key:{}", key.name));
        Ok(created)
    }

    async fn revoke_api_key(&self, name: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "revoke_api_key")?;
        state.api_keys.retain(|k| k.name != name);
        Self::record(&mut state, format!("revoke_api_key:{}", name));
        Ok(())
    }

    async fn list_proxy_routes(&self) -> StyraResult<Vec<ProxyRoute>> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "list_proxy_routes")?;
        let mut routes: Vec<ProxyRoute> = state.routes.values().cloned().collect();
        routes.sort_by_key(ProxyRoute::key);
        Ok(routes)
    }

    async fn create_proxy_route(&self, route: &ProxyRoute) -> StyraResult<ProxyRoute> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "create_proxy_route")?;
        let id = state.next("r");
        let mut created = route.clone();
        created.id = Some(id.clone());
        state.routes.insert(id, created.clone());
        Self::record(&mut state, format!("create_proxy_route:{}", route.key()));
        Ok(created)
    }

    async fn update_proxy_route(&self, route: &ProxyRoute) -> StyraResult<ProxyRoute> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "update_proxy_route")?;
        let id = route.id.clone().ok_or(StyraError::InvalidInput {
            field: "route.id".to_string(),
            message: "cannot update a route without a remote id".to_string(),
        })?;
        if !state.routes.contains_key(&id) {
            return Err(StyraError::NotFound {
                resource: format!("proxy route {}", id),
            });
        }
        state.routes.insert(id, route.clone());
        Self::record(&mut state, format!("update_proxy_route:{}", route.key()));
        Ok(route.clone())
    }

    async fn delete_proxy_route(&self, id: &str) -> StyraResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state, "delete_proxy_route")?;
        state.routes.remove(id);
        Self::record(&mut state, format!("delete_proxy_route:{}", id));
        Ok(())
    }
}
