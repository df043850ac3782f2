//! WorkUnit 知识库：为上下文组装提供候选片段
//!
//! 来源：需求原文与人工指导、未解决差异、最近一次评审的意见、工件、转移历史。
//! 相关度为片段与阶段查询的词法重叠（见 tokenizer）。

use crate::memory::context::{ContextFragment, PriorityTag};
use crate::memory::tokenizer::{relevance, tokenize};
use crate::workflow::{TransitionRecord, TransitionTarget, WorkUnit};

/// 每类来源最多保留的条数，防止候选池随迭代无限增长
const MAX_ARTIFACTS: usize = 12;
const MAX_HISTORY: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct KnowledgeBase;

impl KnowledgeBase {
    pub fn new() -> Self {
        Self
    }

    pub fn candidates(
        &self,
        unit: &WorkUnit,
        history: &[TransitionRecord],
        query: &str,
    ) -> Vec<ContextFragment> {
        let query_tokens = tokenize(query);
        let score = |text: &str| relevance(&query_tokens, &tokenize(text));
        let mut pool = Vec::new();

        pool.push(
            ContextFragment::new(
                "requirement",
                unit.description.clone(),
                PriorityTag::Requirement,
                unit.created_at,
            )
            .with_relevance(1.0),
        );
        for (i, guidance) in unit.guidance.iter().enumerate() {
            pool.push(
                ContextFragment::new(
                    format!("guidance#{}", i + 1),
                    guidance.clone(),
                    PriorityTag::Requirement,
                    unit.updated_at,
                )
                .with_relevance(1.0),
            );
        }

        for d in &unit.open_discrepancies {
            pool.push(
                ContextFragment::new(
                    format!("discrepancy:{}", d.id),
                    d.description.clone(),
                    PriorityTag::Discrepancy,
                    unit.updated_at,
                )
                .with_relevance(score(&d.description)),
            );
        }

        if let Some(review) = unit.reviews.last() {
            for c in review.latest_critiques() {
                let text = format!("[{:?}] {}", c.severity, c.text);
                pool.push(
                    ContextFragment::new(
                        format!("critique:{}:{}", review.id, c.agent_id),
                        text,
                        PriorityTag::Critique,
                        review.finalized_at,
                    )
                    .with_relevance(score(&c.text)),
                );
            }
        }

        let skip = unit.artifacts.len().saturating_sub(MAX_ARTIFACTS);
        for a in unit.artifacts.iter().skip(skip) {
            pool.push(
                ContextFragment::new(
                    format!("artifact:{:?}:{}", a.kind, a.id),
                    a.content.clone(),
                    PriorityTag::Artifact,
                    a.created_at,
                )
                .with_relevance(score(&a.content)),
            );
        }

        let skip = history.len().saturating_sub(MAX_HISTORY);
        for record in history.iter().skip(skip) {
            let to = match record.to {
                TransitionTarget::Phase(p) => p.to_string(),
                other => format!("{:?}", other).to_lowercase(),
            };
            let from = record
                .from
                .map(|p| p.to_string())
                .unwrap_or_else(|| "start".to_string());
            let text = format!(
                "#{} {} -> {} ({:?}), iteration {}",
                record.seq, from, to, record.trigger, record.iteration
            );
            pool.push(
                ContextFragment::new(
                    format!("history#{}", record.seq),
                    text.clone(),
                    PriorityTag::History,
                    record.at,
                )
                .with_relevance(score(&text)),
            );
        }

        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Artifact, ArtifactKind, Discrepancy, Phase, PhaseMetrics, TransitionTrigger};

    #[test]
    fn test_candidates_cover_all_sources() {
        let mut unit = WorkUnit::new("user login with password reset");
        unit.guidance.push("use bcrypt".to_string());
        unit.open_discrepancies
            .push(Discrepancy::new("d1", "password reset email not sent"));
        unit.artifacts.push(Artifact::new(
            ArtifactKind::Specification,
            "login spec",
            "alice",
            Phase::Expand,
        ));
        let record = unit.record_transition(
            TransitionTarget::Phase(Phase::Expand),
            TransitionTrigger::Created,
            PhaseMetrics::default(),
        );

        let pool = KnowledgeBase::new().candidates(&unit, &[record], "password reset");
        let tiers: Vec<_> = pool.iter().map(|f| f.priority).collect();
        assert_eq!(
            tiers.iter().filter(|t| **t == PriorityTag::Requirement).count(),
            2
        );
        assert!(tiers.contains(&PriorityTag::Discrepancy));
        assert!(tiers.contains(&PriorityTag::Artifact));
        assert!(tiers.contains(&PriorityTag::History));

        let discrepancy = pool
            .iter()
            .find(|f| f.priority == PriorityTag::Discrepancy)
            .unwrap();
        assert!(discrepancy.relevance > 0.5);
    }
}
