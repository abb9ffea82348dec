//! Machine orchestration: staged create, update and destroy
//!
//! A create run walks a fixed stage list and records an undo action for
//! every remote side effect as it lands. When a later stage fails, the
//! recorded actions run in strict reverse order (routes first, the base
//! entity last) and the originating error is propagated; cleanup failures
//! are reported alongside it, never instead of it.
//!
//! Updates re-derive which stages are needed from the difference between the
//! desired and the previously applied configuration, and only power the
//! machine down when a pending change requires it. Destroys are confirmed by
//! polling until the control plane stops reporting the entity.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::{StyraError, StyraResult};
use crate::poll::poll_until;
use crate::power::PowerController;
use crate::proxy;
use crate::reconcile::{apply_plan, plan, PlanApplier};
use crate::remote::RemoteControl;
use crate::state::{PersistedMachine, CURRENT_VERSION};
use crate::types::{
    DesiredPower, Machine, MachineId, MachineSpec, PowerOp, PowerState, ProxyRoute, SharedFolder,
    FIELD_UNAVAILABLE,
};
use crate::waiter::wait_for_internal_address;

/// Undo action for one remote side effect
#[derive(Debug)]
enum UndoAction {
    StopMachine(MachineId),
    DeleteMachine(MachineId),
    DeleteProxyRoute(String),
}

/// Ordered log of undo actions, consumed at most once per run
#[derive(Debug, Default)]
struct RollbackLog {
    actions: Vec<UndoAction>,
}

impl RollbackLog {
    fn record(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// Execute all recorded actions in reverse order, attempting every one
    /// even when an earlier undo fails. Returns the collected failures.
    async fn run(self, remote: &dyn RemoteControl) -> Vec<StyraError> {
        let mut failures = Vec::new();
        for action in self.actions.into_iter().rev() {
            let result = match &action {
                UndoAction::StopMachine(id) => {
                    remote.set_machine_power(id, PowerOp::Stop).await.map(|_| ())
                }
                UndoAction::DeleteMachine(id) => remote.delete_machine(id).await,
                UndoAction::DeleteProxyRoute(id) => remote.delete_proxy_route(id).await,
            };
            match result {
                Ok(()) => info!("Rolled back {:?}", action),
                Err(e) => {
                    warn!("Rollback action {:?} failed: {}", action, e);
                    failures.push(e);
                }
            }
        }
        failures
    }
}

struct FolderApplier<'a> {
    remote: &'a dyn RemoteControl,
    machine: &'a MachineId,
}

#[async_trait]
impl PlanApplier<SharedFolder> for FolderApplier<'_> {
    async fn create(&self, item: &SharedFolder) -> StyraResult<SharedFolder> {
        self.remote.add_shared_folder(self.machine, item).await?;
        Ok(item.clone())
    }

    async fn update(
        &self,
        desired: &SharedFolder,
        observed: &SharedFolder,
    ) -> StyraResult<SharedFolder> {
        // Shared folders cannot be patched in place on the control plane.
        self.remote
            .remove_shared_folder(self.machine, &observed.name)
            .await?;
        self.remote.add_shared_folder(self.machine, desired).await?;
        Ok(desired.clone())
    }

    async fn delete(&self, item: &SharedFolder) -> StyraResult<()> {
        self.remote
            .remove_shared_folder(self.machine, &item.name)
            .await
    }

    fn adopt(&self, desired: &SharedFolder, _observed: &SharedFolder) -> SharedFolder {
        desired.clone()
    }
}

pub struct Orchestrator {
    remote: Arc<dyn RemoteControl>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(remote: Arc<dyn RemoteControl>, config: EngineConfig) -> Self {
        Self { remote, config }
    }

    /// Run the rollback log and attach its outcome to the failing stage
    async fn rollback_and_fail(
        &self,
        stage: &str,
        error: StyraError,
        log: RollbackLog,
    ) -> StyraError {
        warn!("Stage '{}' failed, rolling back: {}", stage, error);
        let original = StyraError::stage(stage, error);
        let cleanup = log.run(self.remote.as_ref()).await;
        if cleanup.is_empty() {
            original
        } else {
            StyraError::RollbackFailed {
                original: Box::new(original),
                cleanup,
            }
        }
    }

    /// Create a machine and everything that hangs off it.
    ///
    /// On failure, every remote side effect recorded so far is undone in
    /// reverse creation order before the error is returned.
    pub async fn create(
        &self,
        ctx: &RunContext,
        spec: &MachineSpec,
    ) -> StyraResult<PersistedMachine> {
        ctx.check("validate")?;
        spec.validate()?;

        // Idempotence-by-name guard.
        if let Some(existing) = self.remote.find_machine(&spec.name).await? {
            if !spec.force_replace {
                return Err(StyraError::AlreadyExists {
                    resource: format!("machine {}", spec.name),
                });
            }
            info!(
                "Machine '{}' already exists, replacing as requested",
                spec.name
            );
            self.remove_machine_entity(ctx, &existing).await?;
        }

        let power = PowerController::new(self.remote.as_ref());
        let mut log = RollbackLog::default();
        let mut stop_recorded = false;

        info!("Creating machine '{}' from '{}'", spec.name, spec.source);

        ctx.check("create-base-entity")?;
        let mut machine = match self.remote.create_machine(&spec.name, &spec.source).await {
            Ok(machine) => machine,
            Err(e) => return Err(StyraError::stage("create-base-entity", e)),
        };
        log.record(UndoAction::DeleteMachine(machine.id.clone()));

        // Configuration stages need the machine powered down.
        if let Err(e) = ctx.check("ensure-stopped") {
            return Err(self.rollback_and_fail("ensure-stopped", e, log).await);
        }
        machine = match power.ensure_stopped(&machine).await {
            Ok(m) => m,
            Err(e) => return Err(self.rollback_and_fail("ensure-stopped", e, log).await),
        };

        if let Err(e) = ctx.check("apply-specs") {
            return Err(self.rollback_and_fail("apply-specs", e, log).await);
        }
        if let Err(e) = self.remote.set_hardware(&machine.id, &spec.hardware).await {
            return Err(self.rollback_and_fail("apply-specs", e, log).await);
        }

        if let Err(e) = ctx.check("apply-config") {
            return Err(self.rollback_and_fail("apply-config", e, log).await);
        }
        for entry in &spec.config {
            if let Err(e) = self.remote.set_config_entry(&machine.id, entry).await {
                return Err(self.rollback_and_fail("apply-config", e, log).await);
            }
        }

        if let Err(e) = ctx.check("apply-custom-commands") {
            return Err(self.rollback_and_fail("apply-custom-commands", e, log).await);
        }
        for flag in &spec.custom_flags {
            if let Err(e) = self.remote.apply_flag(&machine.id, flag).await {
                return Err(self.rollback_and_fail("apply-custom-commands", e, log).await);
            }
        }

        if let Err(e) = ctx.check("apply-shared-folders") {
            return Err(self.rollback_and_fail("apply-shared-folders", e, log).await);
        }
        for folder in &spec.shared_folders {
            if let Err(e) = self.remote.add_shared_folder(&machine.id, folder).await {
                return Err(self.rollback_and_fail("apply-shared-folders", e, log).await);
            }
        }

        if !spec.post_create_scripts.is_empty() {
            if let Err(e) = ctx.check("run-post-create-scripts") {
                return Err(self.rollback_and_fail("run-post-create-scripts", e, log).await);
            }
            machine = match power.ensure_running(&machine).await {
                Ok(m) => m,
                Err(e) => {
                    return Err(self.rollback_and_fail("run-post-create-scripts", e, log).await)
                }
            };
            log.record(UndoAction::StopMachine(machine.id.clone()));
            stop_recorded = true;

            if let Err(e) = self.run_scripts(&machine, &spec.post_create_scripts).await {
                return Err(self.rollback_and_fail("run-post-create-scripts", e, log).await);
            }
        }

        let mut route_ids = Vec::with_capacity(spec.routes.len());
        for route in &spec.routes {
            if let Err(e) = ctx.check("apply-network-routes") {
                return Err(self.rollback_and_fail("apply-network-routes", e, log).await);
            }
            let created = match self.remote.create_proxy_route(route).await {
                Ok(created) => created,
                Err(e) => return Err(self.rollback_and_fail("apply-network-routes", e, log).await),
            };
            let id = created.id.clone().unwrap_or_default();
            log.record(UndoAction::DeleteProxyRoute(id.clone()));
            route_ids.push(id);
        }

        if let Err(e) = ctx.check("reach-desired-power-state") {
            return Err(self.rollback_and_fail("reach-desired-power-state", e, log).await);
        }
        let was_running = machine.state == PowerState::Running;
        let power_result = match spec.desired_power {
            DesiredPower::Running => power.ensure_running(&machine).await,
            DesiredPower::Stopped => power.ensure_stopped(&machine).await,
        };
        machine = match power_result {
            Ok(m) => m,
            Err(e) => {
                return Err(self.rollback_and_fail("reach-desired-power-state", e, log).await)
            }
        };
        if machine.state == PowerState::Running && !was_running && !stop_recorded {
            log.record(UndoAction::StopMachine(machine.id.clone()));
        }

        let internal_ip = if spec.desired_power == DesiredPower::Running {
            if let Err(e) = ctx.check("wait-for-network-field") {
                return Err(self.rollback_and_fail("wait-for-network-field", e, log).await);
            }
            match wait_for_internal_address(
                self.remote.as_ref(),
                &machine.id,
                &self.config.address_wait,
                Some(ctx.deadline()),
            )
            .await
            {
                Ok(addr) => addr,
                Err(e) => {
                    return Err(self.rollback_and_fail("wait-for-network-field", e, log).await)
                }
            }
        } else {
            FIELD_UNAVAILABLE.to_string()
        };

        info!(
            "Machine '{}' created (id {}, internal address {})",
            spec.name, machine.id, internal_ip
        );

        Ok(self.persist(spec, &machine, internal_ip, route_ids))
    }

    /// Update an existing machine towards `desired`, given the previously
    /// applied configuration and the persisted identifiers.
    ///
    /// The machine is powered down only when at least one pending change
    /// requires it; folders, scripts and routes apply to a live machine. If
    /// the run changed the power state as a side effect, the pre-run state
    /// is restored unless `desired` explicitly asks for a different one.
    pub async fn update(
        &self,
        ctx: &RunContext,
        desired: &MachineSpec,
        previous: &MachineSpec,
        persisted: &PersistedMachine,
    ) -> StyraResult<PersistedMachine> {
        ctx.check("validate")?;
        desired.validate()?;

        let power = PowerController::new(self.remote.as_ref());
        let mut machine = power.refresh(&persisted.machine_id).await?;
        let initial_state = machine.state;

        let needs_stop = desired.name != previous.name
            || desired.hardware != previous.hardware
            || desired.config != previous.config
            || desired.custom_flags != previous.custom_flags;

        if needs_stop {
            ctx.check("ensure-stopped")?;
            machine = power
                .ensure_stopped(&machine)
                .await
                .map_err(|e| StyraError::stage("ensure-stopped", e))?;

            if desired.name != previous.name {
                ctx.check("apply-specs")?;
                self.remote
                    .rename_machine(&machine.id, &desired.name)
                    .await
                    .map_err(|e| StyraError::stage("apply-specs", e))?;
            }
            if desired.hardware != previous.hardware {
                ctx.check("apply-specs")?;
                self.remote
                    .set_hardware(&machine.id, &desired.hardware)
                    .await
                    .map_err(|e| StyraError::stage("apply-specs", e))?;
            }
            if desired.config != previous.config {
                ctx.check("apply-config")?;
                for entry in &desired.config {
                    self.remote
                        .set_config_entry(&machine.id, entry)
                        .await
                        .map_err(|e| StyraError::stage("apply-config", e))?;
                }
            }
            if desired.custom_flags != previous.custom_flags {
                ctx.check("apply-custom-commands")?;
                for flag in &desired.custom_flags {
                    self.remote
                        .apply_flag(&machine.id, flag)
                        .await
                        .map_err(|e| StyraError::stage("apply-custom-commands", e))?;
                }
            }
        } else {
            debug!(
                "Machine '{}': no pending change requires a stop",
                machine.name
            );
        }

        if desired.shared_folders != previous.shared_folders {
            ctx.check("apply-shared-folders")?;
            let folder_plan = plan(
                &desired.shared_folders,
                &previous.shared_folders,
                |f| f.name.clone(),
                |a, b| a == b,
            );
            let applier = FolderApplier {
                remote: self.remote.as_ref(),
                machine: &machine.id,
            };
            apply_plan("apply-shared-folders", &folder_plan, &applier)
                .await
                .map_err(|e| StyraError::stage("apply-shared-folders", e))?;
        }

        if desired.post_create_scripts != previous.post_create_scripts
            && !desired.post_create_scripts.is_empty()
        {
            ctx.check("run-post-create-scripts")?;
            machine = power
                .ensure_running(&machine)
                .await
                .map_err(|e| StyraError::stage("run-post-create-scripts", e))?;
            self.run_scripts(&machine, &desired.post_create_scripts)
                .await
                .map_err(|e| StyraError::stage("run-post-create-scripts", e))?;
        }

        ctx.check("apply-network-routes")?;
        let observed_routes = self.observed_routes(&persisted.route_ids).await?;
        let route_plan = proxy::plan_routes(&desired.routes, &observed_routes);
        let converged_routes = if route_plan.is_empty() {
            // Adopt the observed identities unchanged.
            observed_routes
        } else {
            proxy::apply_routes(self.remote.as_ref(), &route_plan)
                .await
                .map_err(|e| StyraError::stage("apply-network-routes", e))?
        };
        let route_ids: Vec<String> = converged_routes
            .iter()
            .filter_map(|r| r.id.clone())
            .collect();

        ctx.check("reach-desired-power-state")?;
        machine = power.refresh(&machine.id).await?;
        machine = if desired.desired_power != previous.desired_power {
            match desired.desired_power {
                DesiredPower::Running => power.ensure_running(&machine).await,
                DesiredPower::Stopped => power.ensure_stopped(&machine).await,
            }
            .map_err(|e| StyraError::stage("reach-desired-power-state", e))?
        } else {
            // Undo power drift a stop-requiring stage left behind.
            power
                .restore(initial_state, &machine)
                .await
                .map_err(|e| StyraError::stage("reach-desired-power-state", e))?
        };

        let internal_ip = if machine.state == PowerState::Running {
            ctx.check("wait-for-network-field")?;
            wait_for_internal_address(
                self.remote.as_ref(),
                &machine.id,
                &self.config.address_wait,
                Some(ctx.deadline()),
            )
            .await
            .map_err(|e| StyraError::stage("wait-for-network-field", e))?
        } else {
            FIELD_UNAVAILABLE.to_string()
        };

        Ok(self.persist(desired, &machine, internal_ip, route_ids))
    }

    /// Tear the machine and its dependent routes down, confirming the base
    /// entity is gone before returning.
    pub async fn destroy(&self, ctx: &RunContext, persisted: &PersistedMachine) -> StyraResult<()> {
        ctx.check("destroy")?;

        let machine = self.remote.get_machine(&persisted.machine_id).await?;

        // Pre-destroy script is best-effort: a failing teardown hook must
        // never leave the machine undeletable.
        if let (Some(machine), Some(script)) = (machine.as_ref(), &persisted.pre_destroy_script) {
            if machine.state == PowerState::Running {
                match self.remote.exec_script(&machine.id, script).await {
                    Ok((0, _, _)) => debug!("Pre-destroy script finished for '{}'", machine.name),
                    Ok((code, _, stderr)) => warn!(
                        "Pre-destroy script for '{}' exited with {}: {}",
                        machine.name, code, stderr
                    ),
                    Err(e) => warn!(
                        "Pre-destroy script for '{}' could not run: {}",
                        machine.name, e
                    ),
                }
            } else {
                debug!(
                    "Machine '{}' is {}, skipping pre-destroy script",
                    machine.name, machine.state
                );
            }
        }

        for route_id in &persisted.route_ids {
            ctx.check("remove-network-routes")?;
            self.remote
                .delete_proxy_route(route_id)
                .await
                .map_err(|e| StyraError::stage("remove-network-routes", e))?;
        }

        let Some(machine) = machine else {
            info!(
                "Machine {} already gone, nothing to destroy",
                persisted.machine_id
            );
            return Ok(());
        };

        ctx.check("ensure-stopped")?;
        let power = PowerController::new(self.remote.as_ref());
        let machine = power
            .ensure_stopped(&machine)
            .await
            .map_err(|e| StyraError::stage("ensure-stopped", e))?;

        ctx.check("delete-base-entity")?;
        self.remote
            .delete_machine(&machine.id)
            .await
            .map_err(|e| StyraError::stage("delete-base-entity", e))?;

        let confirmed = poll_until(
            "confirm-deleted",
            &self.config.destroy_wait,
            Some(ctx.deadline()),
            || async {
                match self.remote.get_machine(&machine.id).await {
                    Ok(None) => Ok(Some(())),
                    Ok(Some(_)) => Ok(None),
                    Err(e) => {
                        warn!("Checking deletion of {} failed: {}", machine.id, e);
                        Ok(None)
                    }
                }
            },
        )
        .await?;

        match confirmed {
            Some(()) => {
                info!("Machine '{}' destroyed", machine.name);
                Ok(())
            }
            None => Err(StyraError::MachineOperationFailed {
                operation: "destroy".to_string(),
                details: format!(
                    "machine '{}' still reported after {} attempts",
                    machine.name, self.config.destroy_wait.attempts
                ),
            }),
        }
    }

    /// Forced replacement: tear down a machine occupying the desired name
    async fn remove_machine_entity(&self, ctx: &RunContext, existing: &Machine) -> StyraResult<()> {
        let placeholder = PersistedMachine {
            version: CURRENT_VERSION,
            machine_id: existing.id.clone(),
            name: existing.name.clone(),
            external_ip: FIELD_UNAVAILABLE.to_string(),
            internal_ip: FIELD_UNAVAILABLE.to_string(),
            route_ids: Vec::new(),
            desired_power: DesiredPower::Stopped,
            pre_destroy_script: None,
        };
        self.destroy(ctx, &placeholder).await
    }

    async fn run_scripts(&self, machine: &Machine, scripts: &[String]) -> StyraResult<()> {
        for script in scripts {
            let (code, _stdout, stderr) = self.remote.exec_script(&machine.id, script).await?;
            if code != 0 {
                return Err(StyraError::Api {
                    operation: "exec_script".to_string(),
                    details: format!(
                        "script on machine '{}' exited with {}: {}",
                        machine.name, code, stderr
                    ),
                });
            }
        }
        Ok(())
    }

    /// Routes this machine's persisted state claims ownership of
    async fn observed_routes(&self, route_ids: &[String]) -> StyraResult<Vec<ProxyRoute>> {
        let all = self.remote.list_proxy_routes().await?;
        Ok(all
            .into_iter()
            .filter(|r| {
                r.id.as_deref()
                    .map(|id| route_ids.iter().any(|owned| owned == id))
                    .unwrap_or(false)
            })
            .collect())
    }

    fn persist(
        &self,
        spec: &MachineSpec,
        machine: &Machine,
        internal_ip: String,
        route_ids: Vec<String>,
    ) -> PersistedMachine {
        PersistedMachine {
            version: CURRENT_VERSION,
            machine_id: machine.id.clone(),
            name: spec.name.clone(),
            external_ip: machine
                .external_ip
                .clone()
                .unwrap_or_else(|| FIELD_UNAVAILABLE.to_string()),
            internal_ip,
            route_ids,
            desired_power: spec.desired_power,
            pre_destroy_script: spec.pre_destroy_script.clone(),
        }
    }
}
