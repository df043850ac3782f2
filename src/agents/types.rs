//! Agent 定义：能力标签、状态、角色分配

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{Phase, WorkUnitId};

pub type AgentId = String;

/// 固定的能力标签集合；角色管理只按标签调度，不关心具体 Agent 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Specification,
    Testing,
    Code,
    Review,
    Retrospective,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Specification => "specification",
            Capability::Testing => "testing",
            Capability::Code => "code",
            Capability::Review => "review",
            Capability::Retrospective => "retrospective",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "specification" | "spec" => Ok(Capability::Specification),
            "testing" | "test" => Ok(Capability::Testing),
            "code" => Ok(Capability::Code),
            "review" => Ok(Capability::Review),
            "retrospective" | "retrospect" => Ok(Capability::Retrospective),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

/// Agent 当前状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    /// 持有某个 WorkUnit 的 Primus
    Assigned,
    /// 正在执行任务
    Working,
    /// 上一个任务以不可重试的方式失败
    Blocked,
}

/// 静态注册的 Agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    /// 展示用角色名
    pub role: String,
    /// 声明的能力（保持声明顺序）
    pub capabilities: Vec<Capability>,
    pub status: AgentStatus,
    /// 累计 token 用量
    pub tokens_used: u64,
    /// 本次运行累计担任 Primus 次数
    pub assignments: u64,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, role: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities,
            status: AgentStatus::Idle,
            tokens_used: 0,
            assignments: 0,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// WorkUnit + Phase 的角色分配：一个 Primus，其余为 Worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub work_unit_id: WorkUnitId,
    pub phase: Phase,
    pub primus: AgentId,
    pub workers: Vec<AgentId>,
    pub assigned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse() {
        assert_eq!("code".parse::<Capability>(), Ok(Capability::Code));
        assert_eq!(" Spec ".parse::<Capability>(), Ok(Capability::Specification));
        assert!("painting".parse::<Capability>().is_err());
    }

    #[test]
    fn test_has_capability() {
        let agent = AgentProfile::new("a1", "Coder", vec![Capability::Code, Capability::Testing]);
        assert!(agent.has_capability(Capability::Testing));
        assert!(!agent.has_capability(Capability::Retrospective));
    }
}
