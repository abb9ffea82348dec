//! Reverse-proxy route convergence
//!
//! Routes are identified by their normalized `host:port` listen address, not
//! by remote ID: a route that moves to another port is a delete plus a
//! create, and the shared plan ordering (deletes first) keeps the listen
//! address from being claimed twice on the way through.

use async_trait::async_trait;

use crate::error::{StyraError, StyraResult};
use crate::reconcile::{apply_plan, plan, Plan, PlanApplier};
use crate::remote::RemoteControl;
use crate::types::ProxyRoute;

struct RouteApplier<'a> {
    remote: &'a dyn RemoteControl,
}

#[async_trait]
impl PlanApplier<ProxyRoute> for RouteApplier<'_> {
    async fn create(&self, item: &ProxyRoute) -> StyraResult<ProxyRoute> {
        self.remote.create_proxy_route(item).await
    }

    async fn update(&self, desired: &ProxyRoute, observed: &ProxyRoute) -> StyraResult<ProxyRoute> {
        let mut patched = desired.clone();
        patched.id = observed.id.clone();
        self.remote.update_proxy_route(&patched).await
    }

    async fn delete(&self, item: &ProxyRoute) -> StyraResult<()> {
        let id = item.id.as_deref().ok_or_else(|| StyraError::Internal {
            message: format!("observed route {} has no remote id", item.key()),
        })?;
        self.remote.delete_proxy_route(id).await
    }

    fn adopt(&self, desired: &ProxyRoute, observed: &ProxyRoute) -> ProxyRoute {
        let mut adopted = desired.clone();
        adopted.id = observed.id.clone();
        adopted
    }
}

/// Plan the route changes without touching the remote host
pub fn plan_routes(desired: &[ProxyRoute], observed: &[ProxyRoute]) -> Plan<ProxyRoute> {
    plan(desired, observed, ProxyRoute::key, ProxyRoute::same_target)
}

/// Apply a previously computed route plan
pub async fn apply_routes(
    remote: &dyn RemoteControl,
    route_plan: &Plan<ProxyRoute>,
) -> StyraResult<Vec<ProxyRoute>> {
    apply_plan("converge-proxy-routes", route_plan, &RouteApplier { remote }).await
}

/// Converge the host's reverse-proxy routes towards `desired`
pub async fn converge_routes(
    remote: &dyn RemoteControl,
    desired: &[ProxyRoute],
) -> StyraResult<Vec<ProxyRoute>> {
    let observed = remote.list_proxy_routes().await?;
    let plan = plan_routes(desired, &observed);
    apply_routes(remote, &plan).await
}
