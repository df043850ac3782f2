//! EDRR 阶段与阶段内步骤
//!
//! Phase 是 WorkUnit 的枚举状态；每个阶段有固定的 PhaseStep 序列，
//! 以及一份策略（所需能力、是否需要同行评审、是否需要外部校验）。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agents::Capability;

/// EDRR 四阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Expand,
    Differentiate,
    Refine,
    Retrospect,
}

impl Phase {
    pub fn all() -> [Phase; 4] {
        [
            Phase::Expand,
            Phase::Differentiate,
            Phase::Refine,
            Phase::Retrospect,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Expand => "expand",
            Phase::Differentiate => "differentiate",
            Phase::Refine => "refine",
            Phase::Retrospect => "retrospect",
        }
    }

    /// 阶段内的步骤序列（有序）
    pub fn steps(&self) -> &'static [PhaseStep] {
        match self {
            Phase::Expand => &[PhaseStep::Assigned, PhaseStep::Drafted],
            Phase::Differentiate => &[
                PhaseStep::Assigned,
                PhaseStep::Drafted,
                PhaseStep::Reviewed,
                PhaseStep::Validated,
            ],
            Phase::Refine => &[
                PhaseStep::Assigned,
                PhaseStep::Drafted,
                PhaseStep::Reviewed,
                PhaseStep::Revised,
                PhaseStep::Validated,
            ],
            Phase::Retrospect => &[PhaseStep::Assigned, PhaseStep::Drafted],
        }
    }

    pub fn policy(&self) -> PhasePolicy {
        match self {
            Phase::Expand => PhasePolicy {
                required_capability: Capability::Specification,
                requires_review: false,
                requires_validation: false,
            },
            Phase::Differentiate => PhasePolicy {
                required_capability: Capability::Testing,
                requires_review: true,
                requires_validation: true,
            },
            Phase::Refine => PhasePolicy {
                required_capability: Capability::Code,
                requires_review: true,
                requires_validation: true,
            },
            Phase::Retrospect => PhasePolicy {
                required_capability: Capability::Retrospective,
                requires_review: false,
                requires_validation: false,
            },
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段内子状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStep {
    /// 已分配 Primus 与 Worker
    Assigned,
    /// 主任务已产出草稿
    Drafted,
    /// 同行评审已完成
    Reviewed,
    /// 评审后已修订
    Revised,
    /// 外部校验已返回
    Validated,
}

/// 阶段策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePolicy {
    /// 担任 Primus 所需的能力标签
    pub required_capability: Capability,
    /// Differentiate / Refine 必须经过辩证评审
    pub requires_review: bool,
    /// 阶段结束时调用外部校验
    pub requires_validation: bool,
}
