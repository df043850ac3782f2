//! Agent 注册表与角色管理（WSDE 轮值 Primus）
//!
//! 运行开始时静态注册全部 Agent 并 seal，运行中不增删。
//! Primus 选择与计数在同一把锁内完成，多个 WorkUnit 并发分配时不会出现重复计数或竞争。
//!
//! 选择规则（确定性）：
//! 1. 只考虑声明了阶段所需能力的 Agent
//! 2. 排除该 WorkUnit 上一阶段的 Primus（仅有一个候选时例外，并记录日志）
//! 3. 本次运行累计担任次数最少者优先
//! 4. Agent id 字典序

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::agents::types::{AgentId, AgentProfile, AgentStatus, Capability, RoleAssignment};
use crate::workflow::{Phase, WorkUnit, WorkUnitId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No eligible agent with capability '{capability}' for phase {phase}")]
    NoEligibleAgent { capability: Capability, phase: Phase },

    #[error("Registry is sealed; agents cannot be added mid-run")]
    Sealed,

    #[error("Duplicate agent id: {0}")]
    DuplicateAgent(AgentId),

    #[error("Agent '{0}' declares no capabilities")]
    NoCapabilities(AgentId),

    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),
}

#[derive(Debug, Default)]
struct AgentRuntime {
    /// 持有 Primus 的 WorkUnit 数
    primus_holds: u32,
    /// 正在执行的任务数
    running: u32,
    last_failed: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    agents: BTreeMap<AgentId, AgentProfile>,
    runtime: HashMap<AgentId, AgentRuntime>,
    sealed: bool,
    /// 每个 WorkUnit 上一次的 Primus（用于轮换）
    last_primus: HashMap<WorkUnitId, AgentId>,
    /// 每个 WorkUnit 当前有效的分配
    active: HashMap<WorkUnitId, RoleAssignment>,
}

impl RegistryState {
    fn refresh_status(&mut self, id: &str) {
        let status = match self.runtime.get(id) {
            Some(rt) if rt.running > 0 => AgentStatus::Working,
            Some(rt) if rt.last_failed => AgentStatus::Blocked,
            Some(rt) if rt.primus_holds > 0 => AgentStatus::Assigned,
            _ => AgentStatus::Idle,
        };
        if let Some(agent) = self.agents.get_mut(id) {
            agent.status = status;
        }
    }

    fn eligible(&self, capability: Capability) -> Vec<&AgentProfile> {
        self.agents
            .values()
            .filter(|a| a.has_capability(capability))
            .collect()
    }

    /// 纯选择（不修改状态）；返回选中的 id 及是否因唯一候选而保留了上一任 Primus
    fn choose(&self, unit_id: &str, phase: Phase) -> Result<(AgentId, bool), RegistryError> {
        let capability = phase.policy().required_capability;
        let eligible = self.eligible(capability);
        if eligible.is_empty() {
            return Err(RegistryError::NoEligibleAgent { capability, phase });
        }

        let previous = self.last_primus.get(unit_id);
        let retained = eligible.len() == 1 && previous == Some(&eligible[0].id);

        let chosen = eligible
            .iter()
            .filter(|a| eligible.len() == 1 || previous != Some(&a.id))
            .min_by(|a, b| a.assignments.cmp(&b.assignments).then_with(|| a.id.cmp(&b.id)))
            .map(|a| a.id.clone())
            .ok_or(RegistryError::NoEligibleAgent { capability, phase })?;

        Ok((chosen, retained))
    }
}

/// Agent 注册表：单次运行构造一次，以 Arc 在各组件间共享
#[derive(Debug, Default)]
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用一组 Agent 构造并立即 seal
    pub async fn from_roster(roster: Vec<AgentProfile>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for agent in roster {
            registry.register_agent(agent).await?;
        }
        registry.seal().await;
        Ok(registry)
    }

    pub async fn register_agent(&self, mut agent: AgentProfile) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        if state.sealed {
            return Err(RegistryError::Sealed);
        }
        if agent.capabilities.is_empty() {
            return Err(RegistryError::NoCapabilities(agent.id));
        }
        if state.agents.contains_key(&agent.id) {
            return Err(RegistryError::DuplicateAgent(agent.id));
        }
        agent.status = AgentStatus::Idle;
        agent.assignments = 0;
        tracing::debug!(agent = %agent.id, role = %agent.role, "agent registered");
        state.runtime.insert(agent.id.clone(), AgentRuntime::default());
        state.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    /// 禁止后续注册
    pub async fn seal(&self) {
        self.state.lock().await.sealed = true;
    }

    /// 按 id 排序的 Agent 列表
    pub async fn list_agents(&self) -> Vec<AgentProfile> {
        self.state.lock().await.agents.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<AgentProfile> {
        self.state.lock().await.agents.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 确定性选择 Primus（只读，不计数）
    pub async fn select_primus(&self, unit_id: &str, phase: Phase) -> Result<AgentId, RegistryError> {
        let state = self.state.lock().await;
        state.choose(unit_id, phase).map(|(id, _)| id)
    }

    /// 阶段进入时轮换 Primus：选择、计数、替换旧分配在同一临界区内完成
    pub async fn rotate_primus(&self, unit: &WorkUnit) -> Result<RoleAssignment, RegistryError> {
        let mut state = self.state.lock().await;
        let (primus, retained) = state.choose(&unit.id, unit.phase)?;
        if retained {
            tracing::warn!(
                unit = %unit.id,
                phase = %unit.phase,
                agent = %primus,
                "only one eligible agent; primus retained for consecutive phases"
            );
        }

        if let Some(old) = state.active.remove(&unit.id) {
            if let Some(rt) = state.runtime.get_mut(&old.primus) {
                rt.primus_holds = rt.primus_holds.saturating_sub(1);
            }
            state.refresh_status(&old.primus);
        }

        if let Some(agent) = state.agents.get_mut(&primus) {
            agent.assignments += 1;
        }
        if let Some(rt) = state.runtime.get_mut(&primus) {
            rt.primus_holds += 1;
        }
        state.refresh_status(&primus);

        let workers: Vec<AgentId> = state
            .agents
            .keys()
            .filter(|id| **id != primus)
            .cloned()
            .collect();
        let assignment = RoleAssignment {
            work_unit_id: unit.id.clone(),
            phase: unit.phase,
            primus: primus.clone(),
            workers,
            assigned_at: Utc::now(),
        };
        state.last_primus.insert(unit.id.clone(), primus.clone());
        state.active.insert(unit.id.clone(), assignment.clone());

        tracing::info!(unit = %unit.id, phase = %unit.phase, primus = %primus, "primus assigned");
        Ok(assignment)
    }

    /// 阶段退出：分配失效
    pub async fn release(&self, unit_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(old) = state.active.remove(unit_id) {
            if let Some(rt) = state.runtime.get_mut(&old.primus) {
                rt.primus_holds = rt.primus_holds.saturating_sub(1);
            }
            state.refresh_status(&old.primus);
        }
    }

    /// 恢复运行时重建轮换记忆，保证恢复后也不会连续两阶段同一 Primus
    pub async fn restore(&self, unit_id: &str, primus: &str) {
        let mut state = self.state.lock().await;
        state.last_primus.insert(unit_id.to_string(), primus.to_string());
    }

    /// 当前有效分配
    pub async fn assignment(&self, unit_id: &str) -> Option<RoleAssignment> {
        self.state.lock().await.active.get(unit_id).cloned()
    }

    /// 持有 Primus 的 WorkUnit 数
    pub async fn primus_holds(&self, agent_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .runtime
            .get(agent_id)
            .map(|rt| rt.primus_holds)
            .unwrap_or(0)
    }

    pub async fn task_started(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let rt = state
            .runtime
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        rt.running += 1;
        state.refresh_status(agent_id);
        Ok(())
    }

    /// 任务结束：累计 token，失败时标记 Blocked 直到下次开始任务
    pub async fn task_finished(&self, agent_id: &str, tokens: u64, failed: bool) {
        let mut state = self.state.lock().await;
        if let Some(rt) = state.runtime.get_mut(agent_id) {
            rt.running = rt.running.saturating_sub(1);
            rt.last_failed = failed;
        }
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.tokens_used += tokens;
        }
        state.refresh_status(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn roster() -> Vec<AgentProfile> {
        vec![
            AgentProfile::new("charlie", "Coder", vec![Capability::Code]),
            AgentProfile::new("alice", "Analyst", vec![Capability::Specification, Capability::Retrospective]),
            AgentProfile::new("bob", "Architect", vec![Capability::Specification, Capability::Code]),
            AgentProfile::new("dana", "Tester", vec![Capability::Testing, Capability::Review]),
        ]
    }

    fn unit_in(phase: Phase) -> WorkUnit {
        let mut unit = WorkUnit::new("feature");
        unit.phase = phase;
        unit
    }

    #[tokio::test]
    async fn test_select_primus_lexicographic_tie_break() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        let unit = unit_in(Phase::Expand);
        let primus = registry.select_primus(&unit.id, Phase::Expand).await.unwrap();
        assert_eq!(primus, "alice");
    }

    #[tokio::test]
    async fn test_select_primus_prefers_fewest_assignments() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        let first = unit_in(Phase::Expand);
        registry.rotate_primus(&first).await.unwrap();

        let second = unit_in(Phase::Expand);
        let primus = registry.select_primus(&second.id, Phase::Expand).await.unwrap();
        assert_eq!(primus, "bob", "alice already has one assignment");
    }

    #[tokio::test]
    async fn test_no_eligible_agent() {
        let registry = AgentRegistry::from_roster(vec![AgentProfile::new(
            "solo",
            "Analyst",
            vec![Capability::Specification],
        )])
        .await
        .unwrap();
        let unit = unit_in(Phase::Refine);
        let err = registry.rotate_primus(&unit).await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::NoEligibleAgent {
                capability: Capability::Code,
                phase: Phase::Refine
            }
        );
    }

    #[tokio::test]
    async fn test_rotation_never_repeats_consecutively() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        let mut unit = unit_in(Phase::Refine);
        let first = registry.rotate_primus(&unit).await.unwrap();
        registry.release(&unit.id).await;

        unit.phase = Phase::Refine;
        let second = registry.rotate_primus(&unit).await.unwrap();
        assert_ne!(first.primus, second.primus);
    }

    #[tokio::test]
    async fn test_single_eligible_agent_is_retained() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        let mut unit = unit_in(Phase::Differentiate);
        let first = registry.rotate_primus(&unit).await.unwrap();
        unit.phase = Phase::Differentiate;
        let second = registry.rotate_primus(&unit).await.unwrap();
        assert_eq!(first.primus, "dana");
        assert_eq!(second.primus, "dana");
    }

    #[tokio::test]
    async fn test_assignment_has_one_primus_and_all_others_as_workers() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        let unit = unit_in(Phase::Expand);
        let assignment = registry.rotate_primus(&unit).await.unwrap();
        assert_eq!(assignment.workers.len(), 3);
        assert!(!assignment.workers.contains(&assignment.primus));
        assert_eq!(registry.primus_holds(&assignment.primus).await, 1);

        registry.release(&unit.id).await;
        assert_eq!(registry.primus_holds(&assignment.primus).await, 0);
        assert!(registry.assignment(&unit.id).await.is_none());
    }

    #[tokio::test]
    async fn test_sealed_registry_rejects_registration() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        let err = registry
            .register_agent(AgentProfile::new("eve", "Extra", vec![Capability::Code]))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::Sealed);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = AgentRegistry::new();
        registry
            .register_agent(AgentProfile::new("a", "A", vec![Capability::Code]))
            .await
            .unwrap();
        let err = registry
            .register_agent(AgentProfile::new("a", "A", vec![Capability::Code]))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateAgent("a".to_string()));
    }

    #[tokio::test]
    async fn test_restore_keeps_rotation_across_resume() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        let unit = unit_in(Phase::Expand);
        let previous = RoleAssignment {
            work_unit_id: unit.id.clone(),
            phase: Phase::Expand,
            primus: "alice".to_string(),
            workers: vec![],
            assigned_at: Utc::now(),
        };
        registry.restore(&previous.work_unit_id, &previous.primus).await;
        let next = registry.rotate_primus(&unit).await.unwrap();
        assert_eq!(next.primus, "bob");
    }

    #[tokio::test]
    async fn test_concurrent_rotation_counts_every_assignment() {
        let registry = Arc::new(AgentRegistry::from_roster(roster()).await.unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let unit = unit_in(Phase::Expand);
                registry.rotate_primus(&unit).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let total: u64 = registry
            .list_agents()
            .await
            .iter()
            .filter(|a| a.has_capability(Capability::Specification))
            .map(|a| a.assignments)
            .sum();
        assert_eq!(total, 8);
        let alice = registry.get("alice").await.unwrap();
        let bob = registry.get("bob").await.unwrap();
        assert_eq!(alice.assignments, 4);
        assert_eq!(bob.assignments, 4);
    }

    #[tokio::test]
    async fn test_task_status_tracking() {
        let registry = AgentRegistry::from_roster(roster()).await.unwrap();
        registry.task_started("bob").await.unwrap();
        assert_eq!(registry.get("bob").await.unwrap().status, AgentStatus::Working);
        registry.task_finished("bob", 120, false).await;
        let bob = registry.get("bob").await.unwrap();
        assert_eq!(bob.status, AgentStatus::Idle);
        assert_eq!(bob.tokens_used, 120);

        registry.task_started("bob").await.unwrap();
        registry.task_finished("bob", 0, true).await;
        assert_eq!(registry.get("bob").await.unwrap().status, AgentStatus::Blocked);
        assert!(registry.task_started("nobody").await.is_err());
    }
}
