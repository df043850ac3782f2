//! Agent 层：定义、注册表与角色管理、统一执行接口

pub mod executor;
pub mod registry;
pub mod types;

pub use executor::{AgentExecutor, AgentOutput, GatewayExecutor, TaskInput};
pub use registry::{AgentRegistry, RegistryError};
pub use types::{AgentId, AgentProfile, AgentStatus, Capability, RoleAssignment};
