//! Authorization principal convergence
//!
//! Thin front ends over the generic reconciler, one per principal kind.
//! Each supplies an identity key, a payload-equality predicate, and the
//! remote calls to run per planned action; everything else (ordering,
//! error collection, clear-all semantics) is shared.

use async_trait::async_trait;

use crate::error::StyraResult;
use crate::reconcile::{apply_plan, plan, PlanApplier};
use crate::remote::RemoteControl;
use crate::types::{ApiKey, Claim, Role, User};

struct UserApplier<'a> {
    remote: &'a dyn RemoteControl,
}

#[async_trait]
impl PlanApplier<User> for UserApplier<'_> {
    async fn create(&self, item: &User) -> StyraResult<User> {
        self.remote.create_user(item).await
    }

    async fn update(&self, desired: &User, observed: &User) -> StyraResult<User> {
        let mut updated = self.remote.update_user(desired).await?;
        if updated.id.is_none() {
            updated.id = observed.id.clone();
        }
        Ok(updated)
    }

    async fn delete(&self, item: &User) -> StyraResult<()> {
        self.remote.delete_user(&item.name).await
    }

    fn adopt(&self, desired: &User, observed: &User) -> User {
        let mut adopted = desired.clone();
        adopted.id = observed.id.clone();
        adopted
    }
}

/// Converge remote users towards `desired`.
///
/// The control plane never reports passwords back, so payload equality
/// cannot see them: a spec that carries a password always re-applies it.
pub async fn converge_users(
    remote: &dyn RemoteControl,
    desired: &[User],
) -> StyraResult<Vec<User>> {
    let observed = remote.list_users().await?;
    let plan = plan(
        desired,
        &observed,
        |u| u.name.clone(),
        |d, _| d.password.is_none(),
    );
    apply_plan("converge-users", &plan, &UserApplier { remote }).await
}

struct RoleApplier<'a> {
    remote: &'a dyn RemoteControl,
}

#[async_trait]
impl PlanApplier<Role> for RoleApplier<'_> {
    async fn create(&self, item: &Role) -> StyraResult<Role> {
        self.remote.create_role(item).await
    }

    async fn update(&self, desired: &Role, _observed: &Role) -> StyraResult<Role> {
        // Roles are identity-only; the planner never schedules updates.
        Ok(desired.clone())
    }

    async fn delete(&self, item: &Role) -> StyraResult<()> {
        self.remote.delete_role(&item.name).await
    }

    fn adopt(&self, desired: &Role, _observed: &Role) -> Role {
        desired.clone()
    }
}

/// Converge remote roles towards `desired`; the payload is the identity
pub async fn converge_roles(
    remote: &dyn RemoteControl,
    desired: &[Role],
) -> StyraResult<Vec<Role>> {
    let observed = remote.list_roles().await?;
    let plan = plan(desired, &observed, |r| r.name.clone(), |_, _| true);
    apply_plan("converge-roles", &plan, &RoleApplier { remote }).await
}

struct ClaimApplier<'a> {
    remote: &'a dyn RemoteControl,
}

#[async_trait]
impl PlanApplier<Claim> for ClaimApplier<'_> {
    async fn create(&self, item: &Claim) -> StyraResult<Claim> {
        self.remote.create_claim(item).await
    }

    async fn update(&self, desired: &Claim, _observed: &Claim) -> StyraResult<Claim> {
        Ok(desired.clone())
    }

    async fn delete(&self, item: &Claim) -> StyraResult<()> {
        self.remote.delete_claim(&item.name).await
    }

    fn adopt(&self, desired: &Claim, _observed: &Claim) -> Claim {
        desired.clone()
    }
}

/// Converge remote claims towards `desired`; the payload is the identity
pub async fn converge_claims(
    remote: &dyn RemoteControl,
    desired: &[Claim],
) -> StyraResult<Vec<Claim>> {
    let observed = remote.list_claims().await?;
    let plan = plan(desired, &observed, |c| c.name.clone(), |_, _| true);
    apply_plan("converge-claims", &plan, &ClaimApplier { remote }).await
}

struct ApiKeyApplier<'a> {
    remote: &'a dyn RemoteControl,
}

#[async_trait]
impl PlanApplier<ApiKey> for ApiKeyApplier<'_> {
    async fn create(&self, item: &ApiKey) -> StyraResult<ApiKey> {
        self.remote.create_api_key(item).await
    }

    async fn update(&self, desired: &ApiKey, observed: &ApiKey) -> StyraResult<ApiKey> {
        // Key material is write-only; replacing it means revoke + recreate.
        self.remote.revoke_api_key(&observed.name).await?;
        self.remote.create_api_key(desired).await
    }

    async fn delete(&self, item: &ApiKey) -> StyraResult<()> {
        self.remote.revoke_api_key(&item.name).await
    }

    fn adopt(&self, desired: &ApiKey, observed: &ApiKey) -> ApiKey {
        let mut adopted = desired.clone();
        adopted.id = observed.id.clone();
        adopted
    }
}

/// Converge remote API keys towards `desired`.
///
/// Secrets are never reported back, so a key is matched by name alone; a
/// spec that pins explicit key material forces a revoke-and-recreate.
pub async fn converge_api_keys(
    remote: &dyn RemoteControl,
    desired: &[ApiKey],
) -> StyraResult<Vec<ApiKey>> {
    let observed = remote.list_api_keys().await?;
    let plan = plan(
        desired,
        &observed,
        |k| k.name.clone(),
        |d, _| d.key.is_none(),
    );
    apply_plan("converge-api-keys", &plan, &ApiKeyApplier { remote }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeRemote;

    fn role(name: &str) -> Role {
        Role {
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn roles_converge_with_create_and_delete_only() {
        let remote = FakeRemote::new();
        remote.seed_role("dev");
        remote.seed_role("ops");

        let converged = converge_roles(&remote, &[role("admin"), role("dev")])
            .await
            .unwrap();

        assert_eq!(
            remote.journal(),
            vec!["delete_role:ops", "create_role:admin"]
        );
        let mut names: Vec<_> = converged.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["admin", "dev"]);
    }

    #[tokio::test]
    async fn empty_desired_roles_clears_the_host() {
        let remote = FakeRemote::new();
        remote.seed_role("dev");
        remote.seed_role("ops");

        let converged = converge_roles(&remote, &[]).await.unwrap();

        assert!(converged.is_empty());
        assert_eq!(
            remote.journal(),
            vec!["delete_role:dev", "delete_role:ops"]
        );
    }

    #[tokio::test]
    async fn user_with_password_always_reapplies() {
        let remote = FakeRemote::new();
        remote
            .create_user(&User {
                id: None,
                name: "alice".to_string(),
                password: None,
            })
            .await
            .unwrap();

        let desired = vec![User {
            id: None,
            name: "alice".to_string(),
            password: Some("s3cret".to_string()),
        }];
        let converged = converge_users(&remote, &desired).await.unwrap();

        assert_eq!(converged.len(), 1);
        assert!(remote
            .journal()
            .contains(&"update_user:alice".to_string()));
        // Remote identity survives the update.
        assert!(converged[0].id.is_some());
    }

    #[tokio::test]
    async fn user_without_password_is_left_untouched_but_adopts_id() {
        let remote = FakeRemote::new();
        remote
            .create_user(&User {
                id: None,
                name: "alice".to_string(),
                password: None,
            })
            .await
            .unwrap();
        let before = remote.journal().len();

        let desired = vec![User {
            id: None,
            name: "alice".to_string(),
            password: None,
        }];
        let converged = converge_users(&remote, &desired).await.unwrap();

        assert_eq!(remote.journal().len(), before);
        assert_eq!(converged[0].id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn api_key_with_pinned_material_is_recreated() {
        let remote = FakeRemote::new();
        remote
            .create_api_key(&ApiKey {
                id: None,
                name: "ci".to_string(),
                key: None,
                secret: None,
            })
            .await
            .unwrap();

        let desired = vec![ApiKey {
            id: None,
            name: "ci".to_string(),
            key: Some("AKIA-PINNED".to_string()),
            secret: None,
        }];
        let converged = converge_api_keys(&remote, &desired).await.unwrap();

        let journal = remote.journal();
        assert!(journal.contains(&"revoke_api_key:ci".to_string()));
        assert_eq!(
            journal.iter().filter(|e| *e == "create_api_key:ci").count(),
            2
        );
        assert_eq!(converged.len(), 1);
    }
}
