//! reqwest-backed implementation of the core `RemoteControl` contract
//!
//! One client is constructed per orchestration run and handed down
//! explicitly; nothing here is cached globally. Getters translate a 404 into
//! `Ok(None)` and deletes treat 404 as already-gone, per the contract the
//! engine is written against.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use styra_core::context::{Credentials, RunContext};
use styra_core::error::{StyraError, StyraResult};
use styra_core::remote::{RemoteControl, ScriptOutput};
use styra_core::types::{
    ApiKey, Claim, ConfigEntry, HardwareSpec, Machine, MachineId, PowerOp, ProxyRoute, Role,
    SharedFolder, User,
};

use crate::dto::{
    ApiKeyDto, ClaimDto, ConfigEntryRequest, CreateMachineRequest, ExecRequest, ExecResponse,
    FlagRequest, HardwareRequest, MachineDto, PowerRequest, RenameRequest, RoleDto, RouteDto,
    SharedFolderRequest, UserDto,
};

/// Map a non-success response status to the engine error taxonomy
fn status_error(operation: &str, status: StatusCode, body: &str) -> StyraError {
    match status {
        StatusCode::CONFLICT => StyraError::AlreadyExists {
            resource: format!("{}: {}", operation, body),
        },
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => StyraError::InvalidInput {
            field: operation.to_string(),
            message: body.to_string(),
        },
        _ => StyraError::Api {
            operation: operation.to_string(),
            details: format!("status {}: {}", status, body),
        },
    }
}

pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    credentials: Credentials,
}

impl HttpRemote {
    pub fn new(base: Url, credentials: Credentials, timeout: Duration) -> StyraResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StyraError::Api {
                operation: "build_client".to_string(),
                details: e.to_string(),
            })?;
        Ok(Self {
            client,
            base,
            credentials,
        })
    }

    /// Client for one orchestration run; requests share the run deadline
    pub fn for_run(ctx: &RunContext) -> StyraResult<Self> {
        Self::new(
            ctx.endpoint.clone(),
            ctx.credentials.clone(),
            ctx.deadline().remaining(),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::Token(token) => builder.bearer_auth(token),
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Credentials::Anonymous => builder,
        }
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> StyraResult<Response> {
        let request_id = uuid::Uuid::new_v4();
        debug!("Remote call: {} (request {})", operation, request_id);
        self.authorize(builder)
            .header("X-Request-Id", request_id.to_string())
            .send()
            .await
            .map_err(|e| StyraError::Api {
                operation: operation.to_string(),
                details: e.to_string(),
            })
    }

    async fn parse<T: DeserializeOwned>(operation: &str, response: Response) -> StyraResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(operation, status, &body));
        }
        response.json::<T>().await.map_err(|e| StyraError::Api {
            operation: operation.to_string(),
            details: format!("invalid response body: {}", e),
        })
    }

    /// GET returning `Ok(None)` for 404
    async fn get_opt<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> StyraResult<Option<T>> {
        let response = self.send(operation, self.client.get(self.url(path))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::parse(operation, response).await?))
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> StyraResult<Vec<T>> {
        let response = self.send(operation, self.client.get(self.url(path))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::parse(operation, response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> StyraResult<T> {
        let response = self
            .send(operation, self.client.post(self.url(path)).json(body))
            .await?;
        Self::parse(operation, response).await
    }

    async fn put_unit<B: Serialize>(&self, operation: &str, path: &str, body: &B) -> StyraResult<()> {
        let response = self
            .send(operation, self.client.put(self.url(path)).json(body))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(operation, status, &text));
        }
        Ok(())
    }

    async fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &B,
    ) -> StyraResult<T> {
        let response = self
            .send(operation, self.client.put(self.url(path)).json(body))
            .await?;
        Self::parse(operation, response).await
    }

    /// DELETE treating 404 as already gone
    async fn delete(&self, operation: &str, path: &str) -> StyraResult<()> {
        let response = self
            .send(operation, self.client.delete(self.url(path)))
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(status_error(operation, status, &text))
    }
}

#[async_trait]
impl RemoteControl for HttpRemote {
    async fn get_machine(&self, id: &MachineId) -> StyraResult<Option<Machine>> {
        let dto: Option<MachineDto> = self
            .get_opt("get_machine", &format!("api/v1/machines/{}", id))
            .await?;
        Ok(dto.map(Machine::from))
    }

    async fn find_machine(&self, name: &str) -> StyraResult<Option<Machine>> {
        let matches: Vec<MachineDto> = self
            .get_list("find_machine", &format!("api/v1/machines?name={}", name))
            .await?;
        Ok(matches.into_iter().next().map(Machine::from))
    }

    async fn create_machine(&self, name: &str, source: &str) -> StyraResult<Machine> {
        let dto: MachineDto = self
            .post(
                "create_machine",
                "api/v1/machines",
                &CreateMachineRequest { name, source },
            )
            .await?;
        Ok(dto.into())
    }

    async fn delete_machine(&self, id: &MachineId) -> StyraResult<()> {
        self.delete("delete_machine", &format!("api/v1/machines/{}", id))
            .await
    }

    async fn set_machine_power(&self, id: &MachineId, op: PowerOp) -> StyraResult<bool> {
        let response = self
            .send(
                "set_machine_power",
                self.client
                    .put(self.url(&format!("api/v1/machines/{}/power", id)))
                    .json(&PowerRequest {
                        operation: op.as_str(),
                    }),
            )
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        // A conflicting state means the operation was refused, not broken.
        if status == StatusCode::CONFLICT {
            return Ok(false);
        }
        let text = response.text().await.unwrap_or_default();
        Err(status_error("set_machine_power", status, &text))
    }

    async fn rename_machine(&self, id: &MachineId, new_name: &str) -> StyraResult<()> {
        self.put_unit(
            "rename_machine",
            &format!("api/v1/machines/{}/name", id),
            &RenameRequest { name: new_name },
        )
        .await
    }

    async fn set_hardware(&self, id: &MachineId, hardware: &HardwareSpec) -> StyraResult<()> {
        self.put_unit(
            "set_hardware",
            &format!("api/v1/machines/{}/hardware", id),
            &HardwareRequest {
                cpus: hardware.cpus,
                memory_mb: hardware.memory_mb,
            },
        )
        .await
    }

    async fn set_config_entry(&self, id: &MachineId, entry: &ConfigEntry) -> StyraResult<()> {
        self.put_unit(
            "set_config_entry",
            &format!("api/v1/machines/{}/config", id),
            &ConfigEntryRequest {
                key: &entry.key,
                value: &entry.value,
            },
        )
        .await
    }

    async fn apply_flag(&self, id: &MachineId, flag: &str) -> StyraResult<()> {
        self.put_unit(
            "apply_flag",
            &format!("api/v1/machines/{}/flags", id),
            &FlagRequest { flag },
        )
        .await
    }

    async fn add_shared_folder(&self, id: &MachineId, folder: &SharedFolder) -> StyraResult<()> {
        let _: serde_json::Value = self
            .post(
                "add_shared_folder",
                &format!("api/v1/machines/{}/shared-folders", id),
                &SharedFolderRequest {
                    name: &folder.name,
                    host_path: &folder.host_path,
                    readonly: folder.readonly,
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_shared_folder(&self, id: &MachineId, name: &str) -> StyraResult<()> {
        self.delete(
            "remove_shared_folder",
            &format!("api/v1/machines/{}/shared-folders/{}", id, name),
        )
        .await
    }

    async fn exec_script(&self, id: &MachineId, script: &str) -> StyraResult<ScriptOutput> {
        let response: ExecResponse = self
            .post(
                "exec_script",
                &format!("api/v1/machines/{}/execute", id),
                &ExecRequest { script },
            )
            .await?;
        Ok((response.exit_code, response.stdout, response.stderr))
    }

    async fn list_users(&self) -> StyraResult<Vec<User>> {
        let dtos: Vec<UserDto> = self.get_list("list_users", "api/v1/auth/users").await?;
        Ok(dtos.into_iter().map(User::from).collect())
    }

    async fn create_user(&self, user: &User) -> StyraResult<User> {
        let dto: UserDto = self
            .post("create_user", "api/v1/auth/users", &UserDto::from(user))
            .await?;
        Ok(dto.into())
    }

    async fn update_user(&self, user: &User) -> StyraResult<User> {
        let dto: UserDto = self
            .put_json(
                "update_user",
                &format!("api/v1/auth/users/{}", user.name),
                &UserDto::from(user),
            )
            .await?;
        Ok(dto.into())
    }

    async fn delete_user(&self, name: &str) -> StyraResult<()> {
        self.delete("delete_user", &format!("api/v1/auth/users/{}", name))
            .await
    }

    async fn list_roles(&self) -> StyraResult<Vec<Role>> {
        let dtos: Vec<RoleDto> = self.get_list("list_roles", "api/v1/auth/roles").await?;
        Ok(dtos.into_iter().map(Role::from).collect())
    }

    async fn create_role(&self, role: &Role) -> StyraResult<Role> {
        let dto: RoleDto = self
            .post(
                "create_role",
                "api/v1/auth/roles",
                &RoleDto {
                    name: role.name.clone(),
                },
            )
            .await?;
        Ok(dto.into())
    }

    async fn delete_role(&self, name: &str) -> StyraResult<()> {
        self.delete("delete_role", &format!("api/v1/auth/roles/{}", name))
            .await
    }

    async fn list_claims(&self) -> StyraResult<Vec<Claim>> {
        let dtos: Vec<ClaimDto> = self.get_list("list_claims", "api/v1/auth/claims").await?;
        Ok(dtos.into_iter().map(Claim::from).collect())
    }

    async fn create_claim(&self, claim: &Claim) -> StyraResult<Claim> {
        let dto: ClaimDto = self
            .post(
                "create_claim",
                "api/v1/auth/claims",
                &ClaimDto {
                    name: claim.name.clone(),
                },
            )
            .await?;
        Ok(dto.into())
    }

    async fn delete_claim(&self, name: &str) -> StyraResult<()> {
        self.delete("delete_claim", &format!("api/v1/auth/claims/{}", name))
            .await
    }

    async fn list_api_keys(&self) -> StyraResult<Vec<ApiKey>> {
        let dtos: Vec<ApiKeyDto> = self
            .get_list("list_api_keys", "api/v1/auth/api-keys")
            .await?;
        Ok(dtos.into_iter().map(ApiKey::from).collect())
    }

    async fn create_api_key(&self, key: &ApiKey) -> StyraResult<ApiKey> {
        let dto: ApiKeyDto = self
            .post(
                "create_api_key",
                "api/v1/auth/api-keys",
                &ApiKeyDto::from(key),
            )
            .await?;
        Ok(dto.into())
    }

    async fn revoke_api_key(&self, name: &str) -> StyraResult<()> {
        self.delete("revoke_api_key", &format!("api/v1/auth/api-keys/{}", name))
            .await
    }

    async fn list_proxy_routes(&self) -> StyraResult<Vec<ProxyRoute>> {
        let dtos: Vec<RouteDto> = self
            .get_list("list_proxy_routes", "api/v1/reverse-proxy/hosts")
            .await?;
        Ok(dtos.into_iter().map(ProxyRoute::from).collect())
    }

    async fn create_proxy_route(&self, route: &ProxyRoute) -> StyraResult<ProxyRoute> {
        let dto: RouteDto = self
            .post(
                "create_proxy_route",
                "api/v1/reverse-proxy/hosts",
                &RouteDto::from(route),
            )
            .await?;
        Ok(dto.into())
    }

    async fn update_proxy_route(&self, route: &ProxyRoute) -> StyraResult<ProxyRoute> {
        let id = route.id.as_deref().ok_or_else(|| StyraError::InvalidInput {
            field: "route.id".to_string(),
            message: "cannot update a route without a remote id".to_string(),
        })?;
        let dto: RouteDto = self
            .put_json(
                "update_proxy_route",
                &format!("api/v1/reverse-proxy/hosts/{}", id),
                &RouteDto::from(route),
            )
            .await?;
        Ok(dto.into())
    }

    async fn delete_proxy_route(&self, id: &str) -> StyraResult<()> {
        self.delete(
            "delete_proxy_route",
            &format!("api/v1/reverse-proxy/hosts/{}", id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn url_joining_handles_trailing_slash() {
        let remote = HttpRemote::new(
            Url::parse("https://host.example:8440/").unwrap(),
            Credentials::Anonymous,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            remote.url("api/v1/machines/m-1"),
            "https://host.example:8440/api/v1/machines/m-1"
        );

        let remote = HttpRemote::new(
            Url::parse("https://host.example:8440").unwrap(),
            Credentials::Anonymous,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            remote.url("api/v1/machines/m-1"),
            "https://host.example:8440/api/v1/machines/m-1"
        );
    }

    #[test]
    fn conflict_status_maps_to_already_exists() {
        let err = status_error("create_machine", StatusCode::CONFLICT, "name taken");
        assert!(matches!(err, StyraError::AlreadyExists { .. }));
    }

    #[test]
    fn validation_status_maps_to_invalid_input() {
        let err = status_error("set_hardware", StatusCode::UNPROCESSABLE_ENTITY, "cpus=0");
        assert!(matches!(err, StyraError::InvalidInput { .. }));
    }

    #[test]
    fn other_statuses_map_to_api_error_with_status() {
        let err = status_error("get_machine", StatusCode::INTERNAL_SERVER_ERROR, "boom");
        match err {
            StyraError::Api { details, .. } => assert!(details.contains("500")),
            other => panic!("expected api error, got {other}"),
        }
    }
}
