//! Wire types for the control-plane REST API

use serde::{Deserialize, Serialize};

use styra_core::types::{
    ApiKey, Claim, Machine, MachineId, PowerState, ProxyRoute, Role, User,
};

#[derive(Debug, Deserialize)]
pub struct MachineDto {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub internal_ip: Option<String>,
}

impl From<MachineDto> for Machine {
    fn from(dto: MachineDto) -> Self {
        Machine {
            id: MachineId(dto.id),
            name: dto.name,
            state: PowerState::parse(&dto.state),
            external_ip: dto.external_ip,
            internal_ip: dto.internal_ip,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateMachineRequest<'a> {
    pub name: &'a str,
    pub source: &'a str,
}

#[derive(Debug, Serialize)]
pub struct PowerRequest<'a> {
    pub operation: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RenameRequest<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
pub struct HardwareRequest {
    pub cpus: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Serialize)]
pub struct ConfigEntryRequest<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

#[derive(Debug, Serialize)]
pub struct FlagRequest<'a> {
    pub flag: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SharedFolderRequest<'a> {
    pub name: &'a str,
    pub host_path: &'a str,
    pub readonly: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecRequest<'a> {
    pub script: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserDto {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl From<UserDto> for User {
    fn from(dto: UserDto) -> Self {
        User {
            id: dto.id,
            name: dto.name,
            password: None,
        }
    }
}

impl<'a> From<&'a User> for UserDto {
    fn from(user: &'a User) -> Self {
        UserDto {
            id: user.id.clone(),
            name: user.name.clone(),
            password: user.password.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoleDto {
    pub name: String,
}

impl From<RoleDto> for Role {
    fn from(dto: RoleDto) -> Self {
        Role { name: dto.name }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimDto {
    pub name: String,
}

impl From<ClaimDto> for Claim {
    fn from(dto: ClaimDto) -> Self {
        Claim { name: dto.name }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiKeyDto {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl From<ApiKeyDto> for ApiKey {
    fn from(dto: ApiKeyDto) -> Self {
        ApiKey {
            id: dto.id,
            name: dto.name,
            key: dto.key,
            secret: dto.secret,
        }
    }
}

impl<'a> From<&'a ApiKey> for ApiKeyDto {
    fn from(key: &'a ApiKey) -> Self {
        ApiKeyDto {
            id: key.id.clone(),
            name: key.name.clone(),
            key: key.key.clone(),
            secret: key.secret.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteDto {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub host: String,
    pub port: String,
    pub target_host: String,
    pub target_port: String,
}

impl From<RouteDto> for ProxyRoute {
    fn from(dto: RouteDto) -> Self {
        ProxyRoute {
            id: dto.id,
            host: dto.host,
            port: dto.port,
            target_host: dto.target_host,
            target_port: dto.target_port,
        }
    }
}

impl<'a> From<&'a ProxyRoute> for RouteDto {
    fn from(route: &'a ProxyRoute) -> Self {
        RouteDto {
            id: route.id.clone(),
            host: route.host.clone(),
            port: route.port.clone(),
            target_host: route.target_host.clone(),
            target_port: route.target_port.clone(),
        }
    }
}
