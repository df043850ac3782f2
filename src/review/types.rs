//! 辩证评审记录：正题（thesis）→ 反题（critique）→ 合题（synthesis）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentId;
use crate::workflow::{Artifact, ArtifactId, Phase, WorkUnitId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Advisory,
}

/// 一条反题意见
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Critique {
    pub agent_id: AgentId,
    pub text: String,
    pub severity: Severity,
    pub round: u32,
}

impl Critique {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Resolved,
    Unresolved,
}

/// 一轮评审：针对某个候选工件的全部意见
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRound {
    pub round: u32,
    pub candidate: ArtifactId,
    pub critiques: Vec<Critique>,
}

impl ReviewRound {
    pub fn blocking(&self) -> usize {
        self.critiques.iter().filter(|c| c.is_blocking()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub artifact: Artifact,
    pub rationale: String,
}

/// 评审记录：定稿后不可变，追加到 WorkUnit 历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: String,
    pub work_unit_id: WorkUnitId,
    pub phase: Phase,
    pub proposer: AgentId,
    pub thesis: Artifact,
    pub rounds: Vec<ReviewRound>,
    /// 提出者完成的修订次数
    pub revisions: u32,
    pub synthesis: Synthesis,
    pub status: ReviewStatus,
    pub finalized_at: DateTime<Utc>,
}

impl ReviewRecord {
    /// 提出者承担的任务数：正题 + 每次修订
    pub fn task_count(&self) -> u32 {
        1 + self.revisions
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ReviewStatus::Resolved
    }

    /// 全部意见（按轮次）
    pub fn critiques(&self) -> impl Iterator<Item = &Critique> {
        self.rounds.iter().flat_map(|r| r.critiques.iter())
    }

    /// 最后一轮的意见
    pub fn latest_critiques(&self) -> &[Critique] {
        self.rounds
            .last()
            .map(|r| r.critiques.as_slice())
            .unwrap_or(&[])
    }

    /// 最后一轮仍未解决的阻塞性意见
    pub fn unresolved_blocking(&self) -> Vec<Critique> {
        self.latest_critiques()
            .iter()
            .filter(|c| c.is_blocking())
            .cloned()
            .collect()
    }
}
