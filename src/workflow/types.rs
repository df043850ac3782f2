//! 工作流类型定义
//!
//! WorkUnit（一个需求/特性）、Task、Artifact、Discrepancy、TransitionRecord 等核心数据类型。
//! 全部可序列化，由 StateStore 持久化；内存中只是工作副本。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::{AgentId, Capability, RoleAssignment};
use crate::review::{Critique, ReviewRecord};
use crate::workflow::phase::{Phase, PhaseStep};

pub type WorkUnitId = String;
pub type TaskId = String;
pub type ArtifactId = String;

/// WorkUnit 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// 正在推进
    Active,
    /// 需要人工决策
    Blocked,
    /// 已完成（终态）
    Complete,
    /// 已放弃（终态）
    Abandoned,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Complete | UnitStatus::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Active => "active",
            UnitStatus::Blocked => "blocked",
            UnitStatus::Complete => "complete",
            UnitStatus::Abandoned => "abandoned",
        }
    }
}

/// 产物类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Specification,
    Test,
    Analysis,
    Code,
    Retrospective,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Specification => "specification",
            ArtifactKind::Test => "test",
            ArtifactKind::Analysis => "analysis",
            ArtifactKind::Code => "code",
            ArtifactKind::Retrospective => "retrospective",
        }
    }
}

/// Agent 产出的工件（规格片段、测试、代码、分析、回顾）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub content: String,
    pub produced_by: AgentId,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, content: impl Into<String>, produced_by: &str, phase: Phase) -> Self {
        Self {
            id: format!("art_{}", uuid::Uuid::new_v4()),
            kind,
            content: content.into(),
            produced_by: produced_by.to_string(),
            phase,
            created_at: Utc::now(),
        }
    }
}

/// 可度量的差异（失败测试、未满足需求）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: String,
    pub description: String,
    pub related_artifact: Option<ArtifactId>,
}

impl Discrepancy {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            related_artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<ArtifactId>) -> Self {
        self.related_artifact = Some(artifact.into());
        self
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// 起草规格（Expand）
    DraftSpecification,
    /// 编写测试（Expand 并行）
    DraftTests,
    /// 差异分析（Differentiate）
    Analyze,
    /// 生成代码（Refine）
    Implement,
    /// 同行评审意见
    Critique,
    /// 根据阻塞性意见修订
    Revise,
    /// 回顾总结（Retrospect）
    Retrospect,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::DraftSpecification => "draft_specification",
            TaskKind::DraftTests => "draft_tests",
            TaskKind::Analyze => "analyze",
            TaskKind::Implement => "implement",
            TaskKind::Critique => "critique",
            TaskKind::Revise => "revise",
            TaskKind::Retrospect => "retrospect",
        }
    }

    /// 主任务产物类型；Critique 不产出工件
    pub fn artifact_kind(&self) -> Option<ArtifactKind> {
        match self {
            TaskKind::DraftSpecification => Some(ArtifactKind::Specification),
            TaskKind::DraftTests => Some(ArtifactKind::Test),
            TaskKind::Analyze => Some(ArtifactKind::Analysis),
            TaskKind::Implement => Some(ArtifactKind::Code),
            TaskKind::Revise => None,
            TaskKind::Critique => None,
            TaskKind::Retrospect => Some(ArtifactKind::Retrospective),
        }
    }

    /// 阶段主任务
    pub fn primary_for(phase: Phase) -> TaskKind {
        match phase {
            Phase::Expand => TaskKind::DraftSpecification,
            Phase::Differentiate => TaskKind::Analyze,
            Phase::Refine => TaskKind::Implement,
            Phase::Retrospect => TaskKind::Retrospect,
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// 单个 Agent 工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub work_unit_id: WorkUnitId,
    pub phase: Phase,
    pub kind: TaskKind,
    pub agent_id: AgentId,
    pub inputs: Vec<ArtifactId>,
    pub output: Option<ArtifactId>,
    pub status: TaskStatus,
    /// 网关重试次数（不含首次调用）
    pub retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(work_unit_id: &str, phase: Phase, kind: TaskKind, agent_id: &str) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            work_unit_id: work_unit_id.to_string(),
            phase,
            kind,
            agent_id: agent_id.to_string(),
            inputs: Vec::new(),
            output: None,
            status: TaskStatus::Pending,
            retries: 0,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<ArtifactId>) -> Self {
        self.inputs = inputs;
        self
    }
}

/// 转移目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "phase", rename_all = "snake_case")]
pub enum TransitionTarget {
    Phase(Phase),
    Complete,
    Blocked,
    Abandoned,
}

impl TransitionTarget {
    pub fn status(&self) -> UnitStatus {
        match self {
            TransitionTarget::Phase(_) => UnitStatus::Active,
            TransitionTarget::Complete => UnitStatus::Complete,
            TransitionTarget::Blocked => UnitStatus::Blocked,
            TransitionTarget::Abandoned => UnitStatus::Abandoned,
        }
    }
}

/// 触发转移的条件（审计用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum TransitionTrigger {
    Created,
    CandidateProduced { artifacts: usize },
    DiscrepanciesFound { count: usize },
    NoDiscrepancies,
    ValidationFailed { count: usize },
    ValidationPassed,
    ReviewUnresolved { blocking: usize },
    QualityBelowThreshold { score: f64, threshold: f64 },
    TaskFailed { reason: String },
    IterationLimitReached { max: u32 },
    BudgetExhausted,
    NoEligibleAgent { capability: Capability },
    RetrospectFinished,
    Cancelled,
    OperatorAbandoned,
    Reopened,
}

/// 阶段度量：随转移记录一起写入审计轨迹
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub duration_ms: u64,
    pub tasks: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub discrepancies: u32,
    /// 阶段质量评分；未产出结果的转移（创建、放弃、重开等）为 None
    #[serde(default)]
    pub quality: Option<f64>,
}

/// 转移记录：只追加，永不改写
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// 在该 WorkUnit 历史中的下标（从 0 开始，连续）
    pub seq: u64,
    pub work_unit_id: WorkUnitId,
    pub from: Option<Phase>,
    pub to: TransitionTarget,
    pub trigger: TransitionTrigger,
    pub iteration: u32,
    pub cycle: u32,
    pub at: DateTime<Utc>,
    pub metrics: PhaseMetrics,
}

/// Blocked / Abandoned 的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    IterationLimit { max: u32 },
    BudgetExhausted,
    NoEligibleAgent { capability: Capability },
    TaskFailed { message: String },
    Cancelled,
    OperatorAbandoned,
}

/// 人工决策所需的结构化载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub reason: EscalationReason,
    pub discrepancies: Vec<Discrepancy>,
    pub critiques: Vec<Critique>,
    pub raised_at: DateTime<Utc>,
}

/// WorkUnit 级 Token 使用（与 TokenBudgetManager 的账本同步，随快照持久化）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageTotals {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// 一个需求/特性的开发单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    pub description: String,
    pub phase: Phase,
    pub step: PhaseStep,
    /// Refine↔Differentiate 循环计数，不超过配置上限
    pub iteration: u32,
    /// EDRR 周期编号（reopen 后递增）
    pub cycle: u32,
    pub status: UnitStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 指向自身转移历史的游标：已提交的转移条数
    pub history_len: u64,
    /// 当前阶段的分配，只在阶段执行期间存在，阶段退出即清空
    pub role_assignment: Option<RoleAssignment>,
    /// 最近一次担任 Primus 的 Agent（轮换记忆，随快照持久化）
    #[serde(default)]
    pub last_primus: Option<AgentId>,
    pub artifacts: Vec<Artifact>,
    /// 当前未解决的差异
    pub open_discrepancies: Vec<Discrepancy>,
    pub tasks: Vec<Task>,
    pub reviews: Vec<ReviewRecord>,
    /// 人工给出的补充指导（reopen）
    pub guidance: Vec<String>,
    pub usage: UsageTotals,
    /// 人工追加预算后的单元上限；None 表示使用配置默认值
    #[serde(default)]
    pub token_ceiling: Option<u64>,
    pub escalation: Option<Escalation>,
}

impl WorkUnit {
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("wu_{}", uuid::Uuid::new_v4()),
            description: description.into(),
            phase: Phase::Expand,
            step: PhaseStep::Assigned,
            iteration: 0,
            cycle: 1,
            status: UnitStatus::Active,
            created_at: now,
            updated_at: now,
            history_len: 0,
            role_assignment: None,
            last_primus: None,
            artifacts: Vec::new(),
            open_discrepancies: Vec::new(),
            tasks: Vec::new(),
            reviews: Vec::new(),
            guidance: Vec::new(),
            usage: UsageTotals::default(),
            token_ceiling: None,
            escalation: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 最近产出的某类工件
    pub fn latest_artifact(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts.iter().rev().find(|a| a.kind == kind)
    }

    /// 生成下一条转移记录并更新自身状态；seq 等于已提交的历史长度
    pub fn record_transition(
        &mut self,
        to: TransitionTarget,
        trigger: TransitionTrigger,
        metrics: PhaseMetrics,
    ) -> TransitionRecord {
        let from = if self.history_len == 0 {
            None
        } else {
            Some(self.phase)
        };
        let now = Utc::now();
        if let TransitionTarget::Phase(next) = to {
            self.phase = next;
            self.step = PhaseStep::Assigned;
        }
        self.status = to.status();
        self.updated_at = now;
        let record = TransitionRecord {
            seq: self.history_len,
            work_unit_id: self.id.clone(),
            from,
            to,
            trigger,
            iteration: self.iteration,
            cycle: self.cycle,
            at: now,
            metrics,
        };
        self.history_len += 1;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_work_unit_starts_in_expand() {
        let unit = WorkUnit::new("login form");
        assert_eq!(unit.phase, Phase::Expand);
        assert_eq!(unit.status, UnitStatus::Active);
        assert_eq!(unit.iteration, 0);
        assert!(unit.id.starts_with("wu_"));
    }

    #[test]
    fn test_record_transition_advances_cursor() {
        let mut unit = WorkUnit::new("login form");
        let created = unit.record_transition(
            TransitionTarget::Phase(Phase::Expand),
            TransitionTrigger::Created,
            PhaseMetrics::default(),
        );
        assert_eq!(created.seq, 0);
        assert_eq!(created.from, None);

        let next = unit.record_transition(
            TransitionTarget::Phase(Phase::Differentiate),
            TransitionTrigger::CandidateProduced { artifacts: 1 },
            PhaseMetrics::default(),
        );
        assert_eq!(next.seq, 1);
        assert_eq!(next.from, Some(Phase::Expand));
        assert_eq!(unit.phase, Phase::Differentiate);
        assert_eq!(unit.history_len, 2);
    }

    #[test]
    fn test_blocked_keeps_phase() {
        let mut unit = WorkUnit::new("x");
        unit.record_transition(
            TransitionTarget::Phase(Phase::Refine),
            TransitionTrigger::Created,
            PhaseMetrics::default(),
        );
        unit.record_transition(
            TransitionTarget::Blocked,
            TransitionTrigger::IterationLimitReached { max: 5 },
            PhaseMetrics::default(),
        );
        assert_eq!(unit.phase, Phase::Refine);
        assert_eq!(unit.status, UnitStatus::Blocked);
        assert!(!unit.is_terminal());
    }

    #[test]
    fn test_target_serializes_with_tag() {
        let json = serde_json::to_string(&TransitionTarget::Phase(Phase::Refine)).unwrap();
        assert!(json.contains("refine"));
        let back: TransitionTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TransitionTarget::Phase(Phase::Refine));
    }
}
