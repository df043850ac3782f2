//! 对外投影：WorkUnit 状态报告、Token 报告与退出码
//!
//! 报告只读，由持久化快照 + 历史 + 预算账本组合而成，CLI 直接序列化输出。

use serde::Serialize;

use crate::agents::AgentId;
use crate::memory::TokenLedger;
use crate::review::{Critique, ReviewRecord, ReviewStatus};
use crate::workflow::{
    Discrepancy, Escalation, Phase, PhaseStep, TransitionRecord, UnitStatus, UsageTotals, WorkUnit,
    WorkUnitId,
};

/// 单次评审的摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewSummary {
    pub id: String,
    pub phase: Phase,
    pub proposer: AgentId,
    pub status: ReviewStatus,
    pub rounds: usize,
    pub revisions: u32,
    /// 各轮意见总数
    pub critiques: usize,
    pub unresolved_blocking: Vec<Critique>,
}

impl From<&ReviewRecord> for ReviewSummary {
    fn from(r: &ReviewRecord) -> Self {
        Self {
            id: r.id.clone(),
            phase: r.phase,
            proposer: r.proposer.clone(),
            status: r.status,
            rounds: r.rounds.len(),
            revisions: r.revisions,
            critiques: r.critiques().count(),
            unresolved_blocking: r.unresolved_blocking(),
        }
    }
}

/// `status` 命令的输出
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub id: WorkUnitId,
    pub description: String,
    pub status: UnitStatus,
    pub phase: Phase,
    pub step: PhaseStep,
    pub iteration: u32,
    pub cycle: u32,
    /// 最近一个阶段的 Primus
    pub last_primus: Option<AgentId>,
    pub usage: UsageTotals,
    pub ledger: TokenLedger,
    pub open_discrepancies: Vec<Discrepancy>,
    /// Blocked / Abandoned 时的人工决策载荷
    pub escalation: Option<Escalation>,
    pub artifacts: usize,
    pub tasks: usize,
    pub reviews: Vec<ReviewSummary>,
    pub history: Vec<TransitionRecord>,
}

impl UnitReport {
    pub fn new(unit: &WorkUnit, history: Vec<TransitionRecord>, ledger: TokenLedger) -> Self {
        Self {
            id: unit.id.clone(),
            description: unit.description.clone(),
            status: unit.status,
            phase: unit.phase,
            step: unit.step,
            iteration: unit.iteration,
            cycle: unit.cycle,
            last_primus: unit.last_primus.clone(),
            usage: unit.usage,
            ledger,
            open_discrepancies: unit.open_discrepancies.clone(),
            escalation: unit.escalation.clone(),
            artifacts: unit.artifacts.len(),
            tasks: unit.tasks.len(),
            reviews: unit.reviews.iter().map(ReviewSummary::from).collect(),
            history,
        }
    }
}

/// `list` 的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitSummary {
    pub id: WorkUnitId,
    pub status: UnitStatus,
    pub phase: Phase,
    pub iteration: u32,
    pub cycle: u32,
    pub tokens: u64,
    pub description: String,
}

impl From<&WorkUnit> for UnitSummary {
    fn from(u: &WorkUnit) -> Self {
        Self {
            id: u.id.clone(),
            status: u.status,
            phase: u.phase,
            iteration: u.iteration,
            cycle: u.cycle,
            tokens: u.usage.total(),
            description: u.description.clone(),
        }
    }
}

impl UnitSummary {
    pub fn line(&self) -> String {
        format!(
            "{}  {:<9}  {:<13}  iter={} cycle={} tokens={}  {}",
            self.id,
            self.status.as_str(),
            self.phase.as_str(),
            self.iteration,
            self.cycle,
            self.tokens,
            self.description
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitTokens {
    pub id: WorkUnitId,
    pub status: UnitStatus,
    pub ledger: TokenLedger,
}

/// `tokens` 命令的输出
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenReport {
    /// 本进程的运行级账本
    pub run: TokenLedger,
    pub units: Vec<UnitTokens>,
}

/// 进程退出码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    InternalError,
    Blocked,
    Abandoned,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::InternalError => 1,
            ExitStatus::Blocked => 2,
            ExitStatus::Abandoned => 3,
        }
    }

    pub fn from_unit(status: UnitStatus) -> Self {
        match status {
            UnitStatus::Active | UnitStatus::Complete => ExitStatus::Success,
            UnitStatus::Blocked => ExitStatus::Blocked,
            UnitStatus::Abandoned => ExitStatus::Abandoned,
        }
    }

    /// 多个 WorkUnit 合并：Blocked 优先于 Abandoned
    pub fn worst<I: IntoIterator<Item = UnitStatus>>(statuses: I) -> Self {
        let mut exit = ExitStatus::Success;
        for status in statuses {
            match ExitStatus::from_unit(status) {
                ExitStatus::Blocked => return ExitStatus::Blocked,
                ExitStatus::Abandoned => exit = ExitStatus::Abandoned,
                _ => {}
            }
        }
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::from_unit(UnitStatus::Complete).code(), 0);
        assert_eq!(ExitStatus::InternalError.code(), 1);
        assert_eq!(ExitStatus::from_unit(UnitStatus::Blocked).code(), 2);
        assert_eq!(ExitStatus::from_unit(UnitStatus::Abandoned).code(), 3);
    }

    #[test]
    fn test_worst_prefers_blocked() {
        let s = ExitStatus::worst([UnitStatus::Abandoned, UnitStatus::Complete, UnitStatus::Blocked]);
        assert_eq!(s, ExitStatus::Blocked);
        assert_eq!(ExitStatus::worst([UnitStatus::Complete]), ExitStatus::Success);
        assert_eq!(ExitStatus::worst([UnitStatus::Abandoned]), ExitStatus::Abandoned);
    }

    #[test]
    fn test_report_reflects_unit() {
        let unit = WorkUnit::new("report me");
        let report = UnitReport::new(&unit, Vec::new(), TokenLedger::with_ceiling(10));
        assert_eq!(report.id, unit.id);
        assert_eq!(report.phase, Phase::Expand);
        assert!(report.last_primus.is_none());
        assert!(report.escalation.is_none());
        assert_eq!(report.ledger.ceiling, 10);
    }
}
