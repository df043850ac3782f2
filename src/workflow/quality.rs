//! 阶段质量评分与门槛
//!
//! 阶段产出准备前进时打一个 0~1 的分：
//!
//! ```text
//! score = 0.4 × 评审结论 + 0.3 × 建议性意见负载 + 0.3 × 完成度
//! ```
//!
//! - 评审结论：本阶段无评审为 1；未解决为 0；已解决时每次修订扣 0.25，最低 0.25
//! - 建议性意见负载：1 − 最后一轮建议性意见数 / 评审者数
//! - 完成度：任务成功率 × 差异回退系数（离开时的差异比进入时多，按比例扣分）
//!
//! 低于门槛时走有界回退；Retrospect 只记录评分，不拦截。

use serde::{Deserialize, Serialize};

use crate::review::ReviewRecord;
use crate::workflow::phase::Phase;

const REVIEW_WEIGHT: f64 = 0.4;
const ADVISORY_WEIGHT: f64 = 0.3;
const COMPLETION_WEIGHT: f64 = 0.3;

/// [orchestrator.quality] 各阶段的最低评分
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub expand: f64,
    pub differentiate: f64,
    pub refine: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            expand: 0.5,
            differentiate: 0.5,
            refine: 0.7,
        }
    }
}

impl QualityThresholds {
    /// 全部为 0：不拦截任何阶段
    pub fn disabled() -> Self {
        Self {
            expand: 0.0,
            differentiate: 0.0,
            refine: 0.0,
        }
    }

    pub fn for_phase(&self, phase: Phase) -> Option<f64> {
        match phase {
            Phase::Expand => Some(self.expand),
            Phase::Differentiate => Some(self.differentiate),
            Phase::Refine => Some(self.refine),
            Phase::Retrospect => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("expand", self.expand),
            ("differentiate", self.differentiate),
            ("refine", self.refine),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("orchestrator.quality.{name} must be within 0..=1, got {value}"));
            }
        }
        Ok(())
    }
}

/// 打分所需的阶段观测
#[derive(Debug, Clone, Default)]
pub struct QualitySignals<'a> {
    pub review: Option<&'a ReviewRecord>,
    /// 参与评审的同伴数
    pub critics: usize,
    pub tasks: u32,
    pub failed_tasks: u32,
    pub discrepancies_before: usize,
    pub discrepancies_after: usize,
}

impl QualitySignals<'_> {
    fn review_outcome(&self) -> f64 {
        match self.review {
            None => 1.0,
            Some(r) if !r.is_resolved() => 0.0,
            Some(r) => (1.0 - 0.25 * r.revisions as f64).max(0.25),
        }
    }

    fn advisory_load(&self) -> f64 {
        let advisory = self
            .review
            .and_then(|r| r.rounds.last())
            .map(|round| round.critiques.len() - round.blocking())
            .unwrap_or(0);
        if self.critics == 0 {
            return 1.0;
        }
        (1.0 - advisory as f64 / self.critics as f64).max(0.0)
    }

    fn completion(&self) -> f64 {
        let success = if self.tasks == 0 {
            1.0
        } else {
            self.tasks.saturating_sub(self.failed_tasks) as f64 / self.tasks as f64
        };
        let regression = if self.discrepancies_before > 0 && self.discrepancies_after > self.discrepancies_before {
            self.discrepancies_before as f64 / self.discrepancies_after as f64
        } else {
            1.0
        };
        success * regression
    }

    /// 0~1，保留三位小数
    pub fn score(&self) -> f64 {
        let raw = REVIEW_WEIGHT * self.review_outcome()
            + ADVISORY_WEIGHT * self.advisory_load()
            + COMPLETION_WEIGHT * self.completion();
        (raw.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
    }
}
