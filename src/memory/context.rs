//! 上下文组装（记忆裁剪）
//!
//! 给定预算上限和候选片段池，选出总成本不超过上限的子集。
//! 裁剪优先级：先按 PriorityTag 分层，层内相关度高者优先，再按时间新者优先，
//! 最后按来源名保证完全确定。单个放不下的片段整体跳过，绝不截断。

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::TokenEstimator;

/// 片段优先级标签（声明顺序即优先顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTag {
    /// 需求原文与人工指导
    Requirement,
    /// 未解决的差异
    Discrepancy,
    /// 评审意见
    Critique,
    /// 已有工件
    Artifact,
    /// 转移历史
    History,
}

impl PriorityTag {
    /// 数字越小优先级越高
    pub fn rank(&self) -> u8 {
        match self {
            PriorityTag::Requirement => 0,
            PriorityTag::Discrepancy => 1,
            PriorityTag::Critique => 2,
            PriorityTag::Artifact => 3,
            PriorityTag::History => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub source: String,
    pub text: String,
    /// 估算 token 成本
    pub cost: u64,
    /// 相关度 [0, 1]
    pub relevance: f32,
    pub recency: DateTime<Utc>,
    pub priority: PriorityTag,
}

impl ContextFragment {
    pub fn new(
        source: impl Into<String>,
        text: impl Into<String>,
        priority: PriorityTag,
        recency: DateTime<Utc>,
    ) -> Self {
        let text = text.into();
        let cost = TokenEstimator::estimate(&text) as u64;
        Self {
            source: source.into(),
            text,
            cost,
            relevance: 0.0,
            recency,
            priority,
        }
    }

    pub fn with_relevance(mut self, relevance: f32) -> Self {
        self.relevance = if relevance.is_finite() {
            relevance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// 为一次网关调用组装的上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub fragments: Vec<ContextFragment>,
    pub total_cost: u64,
    pub ceiling: u64,
    /// 被排除的候选数
    pub excluded: usize,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// 渲染为 system context 文本
    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(|f| format!("## {}\n{}", f.source, f.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn precedence(a: &ContextFragment, b: &ContextFragment) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| b.relevance.total_cmp(&a.relevance))
        .then_with(|| b.recency.cmp(&a.recency))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.text.cmp(&b.text))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAssembler;

impl ContextAssembler {
    pub fn new() -> Self {
        Self
    }

    /// 按优先级贪心装入；输入顺序不影响结果
    pub fn assemble(&self, ceiling: u64, mut candidates: Vec<ContextFragment>) -> ContextBundle {
        let offered = candidates.len();
        candidates.sort_by(precedence);

        let mut fragments = Vec::new();
        let mut total_cost = 0u64;
        for fragment in candidates {
            if fragment.cost <= ceiling - total_cost {
                total_cost += fragment.cost;
                fragments.push(fragment);
            }
        }

        let excluded = offered - fragments.len();
        if excluded > 0 {
            tracing::debug!(ceiling, total_cost, excluded, "context pruned");
        }
        ContextBundle {
            fragments,
            total_cost,
            ceiling,
            excluded,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn frag(source: &str, cost: u64, priority: PriorityTag, relevance: f32, age_secs: i64) -> ContextFragment {
        let base = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ContextFragment::new(source, format!("text of {source}"), priority, base - Duration::seconds(age_secs))
            .with_cost(cost)
            .with_relevance(relevance)
    }

    #[test]
    fn test_zero_ceiling_yields_empty_bundle() {
        let pool = vec![
            frag("a", 1, PriorityTag::Requirement, 1.0, 0),
            frag("b", 5, PriorityTag::History, 0.1, 0),
        ];
        let bundle = ContextAssembler::new().assemble(0, pool);
        assert!(bundle.is_empty());
        assert_eq!(bundle.total_cost, 0);
        assert_eq!(bundle.excluded, 2);
    }

    #[test]
    fn test_priority_tier_beats_relevance() {
        let pool = vec![
            frag("history", 10, PriorityTag::History, 1.0, 0),
            frag("requirement", 10, PriorityTag::Requirement, 0.0, 0),
        ];
        let bundle = ContextAssembler::new().assemble(10, pool);
        assert_eq!(bundle.fragments.len(), 1);
        assert_eq!(bundle.fragments[0].source, "requirement");
        assert_eq!(bundle.excluded, 1);
    }

    #[test]
    fn test_relevance_then_recency_within_tier() {
        let pool = vec![
            frag("old", 10, PriorityTag::Artifact, 0.5, 100),
            frag("new", 10, PriorityTag::Artifact, 0.5, 1),
            frag("best", 10, PriorityTag::Artifact, 0.9, 500),
        ];
        let bundle = ContextAssembler::new().assemble(20, pool);
        let sources: Vec<_> = bundle.fragments.iter().map(|f| f.source.as_str()).collect();
        assert_eq!(sources, vec!["best", "new"]);
    }

    #[test]
    fn test_oversized_fragment_skipped_not_truncated() {
        let pool = vec![
            frag("huge", 100, PriorityTag::Requirement, 1.0, 0),
            frag("small", 5, PriorityTag::History, 0.1, 0),
        ];
        let bundle = ContextAssembler::new().assemble(50, pool);
        assert_eq!(bundle.fragments.len(), 1);
        assert_eq!(bundle.fragments[0].source, "small");
        assert_eq!(bundle.fragments[0].text, "text of small");
    }

    #[test]
    fn test_cost_never_exceeds_ceiling_and_is_deterministic() {
        let pool: Vec<_> = (0..30)
            .map(|i| {
                let tier = match i % 5 {
                    0 => PriorityTag::Requirement,
                    1 => PriorityTag::Discrepancy,
                    2 => PriorityTag::Critique,
                    3 => PriorityTag::Artifact,
                    _ => PriorityTag::History,
                };
                frag(&format!("f{i}"), (i * 7 % 13 + 1) as u64, tier, (i % 3) as f32 / 3.0, i as i64)
            })
            .collect();

        for ceiling in [0u64, 1, 7, 25, 60, 1000] {
            let first = ContextAssembler::new().assemble(ceiling, pool.clone());
            let mut reversed = pool.clone();
            reversed.reverse();
            let second = ContextAssembler::new().assemble(ceiling, reversed);
            assert!(first.total_cost <= ceiling);
            assert_eq!(first.total_cost, first.fragments.iter().map(|f| f.cost).sum::<u64>());
            assert_eq!(first, second);
            assert_eq!(first.fragments.len() + first.excluded, pool.len());
        }
    }

    #[test]
    fn test_render_contains_sources() {
        let bundle = ContextAssembler::new().assemble(
            100,
            vec![frag("requirement", 5, PriorityTag::Requirement, 1.0, 0)],
        );
        assert!(bundle.render().contains("## requirement"));
    }
}
