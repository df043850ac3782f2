//! Dialectical Reviewer：正题 → 反题 → 合题
//!
//! 每一轮由提出者以外的全部同伴并行给出一条意见（blocking / advisory），
//! 有阻塞性意见时由提出者修订，最多进行 `max_rounds` 轮意见收集。
//! 轮次用尽仍有阻塞性意见时记录为 unresolved，绝不默认接受正题。
//!
//! 意见格式：以 `BLOCKING:` 或 `ADVISORY:` 开头的行；整条回复只有 `OK` 或为空表示无意见；
//! 未标注的文本按 advisory 处理。评审任务本身失败视为阻塞性意见。

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentId, TaskInput};
use crate::core::TaskError;
use crate::review::types::{Critique, ReviewRecord, ReviewRound, ReviewStatus, Severity, Synthesis};
use crate::workflow::{Artifact, Phase, Task, TaskDispatcher, TaskKind, TaskRun};

static SEVERITY_LINE: OnceLock<Regex> = OnceLock::new();

fn severity_line() -> &'static Regex {
    SEVERITY_LINE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(blocking|advisory)\s*[:\-]\s*(.*)$").expect("severity regex is valid")
    })
}

/// 整条回复只是 `OK`（可带结尾标点）
fn is_bare_ok(reply: &str) -> bool {
    reply
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .eq_ignore_ascii_case("ok")
}

/// 解析一条评审回复；None 表示无意见
///
/// 先扫描标注行：只要有 `BLOCKING:` 行，前面写了什么都不影响严重度。
pub fn parse_critique(agent_id: &str, round: u32, response: &str) -> Option<Critique> {
    let trimmed = response.trim();

    let mut severity = Severity::Advisory;
    let mut lines = Vec::new();
    for caps in severity_line().captures_iter(trimmed) {
        if caps[1].eq_ignore_ascii_case("blocking") {
            severity = Severity::Blocking;
        }
        lines.push(caps[2].trim().to_string());
    }
    let text = if lines.is_empty() {
        if trimmed.is_empty() || is_bare_ok(trimmed) {
            return None;
        }
        trimmed.to_string()
    } else {
        lines.join("\n")
    };

    Some(Critique {
        agent_id: agent_id.to_string(),
        text,
        severity,
        round,
    })
}

/// 评审所在的调用上下文
pub struct ReviewRequest<'a> {
    pub work_unit_id: &'a str,
    pub phase: Phase,
    pub requirement: &'a str,
    /// 已组装的 system context
    pub system_context: String,
    pub cancel: &'a CancellationToken,
}

/// 评审结果：记录本身与评审期间执行的全部任务
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub record: ReviewRecord,
    pub runs: Vec<TaskRun>,
    /// 每次成功修订产生的工件（合题为最后一个）
    pub revisions: Vec<Artifact>,
}

pub struct DialecticalReviewer {
    dispatcher: Arc<TaskDispatcher>,
    max_rounds: u32,
    max_tokens: u32,
}

impl DialecticalReviewer {
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self {
            dispatcher,
            max_rounds: 3,
            max_tokens: 512,
        }
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    fn critique_prompt(req: &ReviewRequest<'_>, candidate: &Artifact) -> String {
        format!(
            "Review the following {:?} produced during the {} phase for requirement:\n{}\n\n---\n{}\n---\n\
             Reply OK if acceptable. Otherwise reply with lines starting with BLOCKING: or ADVISORY:.",
            candidate.kind, req.phase, req.requirement, candidate.content
        )
    }

    fn revise_prompt(req: &ReviewRequest<'_>, candidate: &Artifact, blocking: &[Critique]) -> String {
        let issues = blocking
            .iter()
            .map(|c| format!("- ({}) {}", c.agent_id, c.text))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Revise your {:?} for requirement:\n{}\n\nCurrent version:\n{}\n\nBlocking issues to resolve:\n{}",
            candidate.kind, req.requirement, candidate.content, issues
        )
    }

    /// 运行评审；只有取消与不变量破坏以 Err 返回
    pub async fn review(
        &self,
        req: ReviewRequest<'_>,
        thesis: Artifact,
        proposer: &str,
        peers: &[AgentId],
    ) -> Result<ReviewOutcome, TaskError> {
        let critics: Vec<&AgentId> = peers.iter().filter(|p| p.as_str() != proposer).collect();
        let mut state = ReviewState::new(thesis);

        for round in 1..=self.max_rounds {
            let jobs: Vec<(Task, TaskInput)> = critics
                .iter()
                .map(|critic| {
                    let task = Task::new(req.work_unit_id, req.phase, TaskKind::Critique, critic)
                        .with_inputs(vec![state.candidate.id.clone()]);
                    let input = TaskInput {
                        system_context: req.system_context.clone(),
                        prompt: Self::critique_prompt(&req, &state.candidate),
                        max_tokens: self.max_tokens,
                    };
                    (task, input)
                })
                .collect();

            let results = self.dispatcher.dispatch_all(jobs, req.cancel).await;
            let mut critiques = Vec::new();
            for run in &results {
                match (&run.output, &run.error) {
                    (_, Some(TaskError::Cancelled)) => return Err(TaskError::Cancelled),
                    (_, Some(e @ TaskError::Invariant(_))) => return Err(e.clone()),
                    (_, Some(e)) => critiques.push(Critique {
                        agent_id: run.task.agent_id.clone(),
                        text: format!("critique task failed: {e}"),
                        severity: Severity::Blocking,
                        round,
                    }),
                    (Some(out), None) => {
                        critiques.extend(parse_critique(&run.task.agent_id, round, &out.content))
                    }
                    (None, None) => {}
                }
            }
            state.runs.extend(results);

            let review_round = ReviewRound {
                round,
                candidate: state.candidate.id.clone(),
                critiques,
            };
            let blocking: Vec<Critique> = review_round
                .critiques
                .iter()
                .filter(|c| c.is_blocking())
                .cloned()
                .collect();
            let advisory = review_round.critiques.len() - blocking.len();
            state.rounds.push(review_round);
            tracing::info!(
                unit = %req.work_unit_id,
                phase = %req.phase,
                round,
                blocking = blocking.len(),
                advisory,
                "review round finished"
            );

            if blocking.is_empty() {
                let rationale = if advisory == 0 {
                    "accepted without critique".to_string()
                } else {
                    format!("accepted with {advisory} advisory note(s)")
                };
                return Ok(state.finish(&req, proposer, rationale, ReviewStatus::Resolved));
            }
            if round == self.max_rounds {
                let rationale = format!(
                    "{} blocking critique(s) remain after {} round(s)",
                    blocking.len(),
                    round
                );
                return Ok(state.finish(&req, proposer, rationale, ReviewStatus::Unresolved));
            }

            let task = Task::new(req.work_unit_id, req.phase, TaskKind::Revise, proposer)
                .with_inputs(vec![state.candidate.id.clone()]);
            let input = TaskInput {
                system_context: req.system_context.clone(),
                prompt: Self::revise_prompt(&req, &state.candidate, &blocking),
                max_tokens: self.max_tokens,
            };
            let mut run = self.dispatcher.dispatch(task, input, req.cancel).await;
            match (&run.output, &run.error) {
                (_, Some(TaskError::Cancelled)) => return Err(TaskError::Cancelled),
                (_, Some(e @ TaskError::Invariant(_))) => return Err(e.clone()),
                (Some(out), None) => {
                    let revised =
                        Artifact::new(state.candidate.kind, out.content.clone(), proposer, req.phase);
                    run.task.output = Some(revised.id.clone());
                    state.runs.push(run);
                    state.revisions.push(revised.clone());
                    state.candidate = revised;
                }
                _ => {
                    let rationale = format!(
                        "revision failed: {}",
                        run.task.error.clone().unwrap_or_default()
                    );
                    state.runs.push(run);
                    return Ok(state.finish(&req, proposer, rationale, ReviewStatus::Unresolved));
                }
            }
        }

        // max_rounds >= 1，循环总会在最后一轮返回
        Err(TaskError::Invariant("review loop ended without finalizing".to_string()))
    }
}

/// 评审进行中的可变状态
struct ReviewState {
    thesis: Artifact,
    candidate: Artifact,
    rounds: Vec<ReviewRound>,
    runs: Vec<TaskRun>,
    revisions: Vec<Artifact>,
}

impl ReviewState {
    fn new(thesis: Artifact) -> Self {
        Self {
            candidate: thesis.clone(),
            thesis,
            rounds: Vec::new(),
            runs: Vec::new(),
            revisions: Vec::new(),
        }
    }

    fn finish(
        self,
        req: &ReviewRequest<'_>,
        proposer: &str,
        rationale: String,
        status: ReviewStatus,
    ) -> ReviewOutcome {
        let record = ReviewRecord {
            id: format!("rev_{}", uuid::Uuid::new_v4()),
            work_unit_id: req.work_unit_id.to_string(),
            phase: req.phase,
            proposer: proposer.to_string(),
            thesis: self.thesis,
            rounds: self.rounds,
            revisions: self.revisions.len() as u32,
            synthesis: Synthesis {
                artifact: self.candidate,
                rationale,
            },
            status,
            finalized_at: Utc::now(),
        };
        tracing::info!(
            unit = %record.work_unit_id,
            phase = %record.phase,
            status = ?record.status,
            revisions = record.revisions,
            "review finalized"
        );
        ReviewOutcome {
            record,
            runs: self.runs,
            revisions: self.revisions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfile, AgentRegistry, Capability, GatewayExecutor};
    use crate::core::WorkerPool;
    use crate::llm::{GatewayError, LlmGateway, ScriptedGateway};
    use crate::memory::TokenBudgetManager;
    use crate::workflow::ArtifactKind;

    #[test]
    fn test_parse_ok_is_no_critique() {
        assert!(parse_critique("a", 1, "OK").is_none());
        assert!(parse_critique("a", 1, "  ok. ").is_none());
        assert!(parse_critique("a", 1, "").is_none());
    }

    #[test]
    fn test_parse_ok_prefix_does_not_hide_blocking_line() {
        let c = parse_critique("rev", 1, "OK overall.\nBLOCKING: SQL injection in login query").unwrap();
        assert_eq!(c.severity, Severity::Blocking);
        assert_eq!(c.text, "SQL injection in login query");

        let c = parse_critique("rev", 1, "ok, but the error message leaks the user id").unwrap();
        assert_eq!(c.severity, Severity::Advisory);
    }

    #[test]
    fn test_parse_blocking_wins() {
        let c = parse_critique("a", 2, "ADVISORY: rename x\nBlocking - missing null check").unwrap();
        assert_eq!(c.severity, Severity::Blocking);
        assert_eq!(c.round, 2);
        assert!(c.text.contains("missing null check"));
        assert!(c.text.contains("rename x"));
    }

    #[test]
    fn test_parse_unlabeled_is_advisory() {
        let c = parse_critique("a", 1, "consider adding docs").unwrap();
        assert_eq!(c.severity, Severity::Advisory);
        assert_eq!(c.text, "consider adding docs");
    }

    async fn reviewer(gateway: impl LlmGateway + 'static, max_rounds: u32) -> DialecticalReviewer {
        let registry = Arc::new(
            AgentRegistry::from_roster(vec![
                AgentProfile::new("dev", "Developer", vec![Capability::Code]),
                AgentProfile::new("rev1", "Critic", vec![Capability::Review]),
                AgentProfile::new("rev2", "Tester", vec![Capability::Testing]),
            ])
            .await
            .unwrap(),
        );
        let budget = Arc::new(TokenBudgetManager::new(1_000_000, 1_000_000));
        let executor = Arc::new(GatewayExecutor::new(Arc::new(gateway), budget));
        let dispatcher = Arc::new(TaskDispatcher::new(registry, executor, WorkerPool::new(3)));
        DialecticalReviewer::new(dispatcher).with_max_rounds(max_rounds)
    }

    fn thesis() -> Artifact {
        Artifact::new(ArtifactKind::Code, "fn login() {}", "dev", Phase::Refine)
    }

    fn peers() -> Vec<AgentId> {
        vec!["rev1".into(), "rev2".into()]
    }

    #[tokio::test]
    async fn test_all_ok_resolves_with_thesis() {
        let gw = ScriptedGateway::new(|_, _| Ok("OK".into()));
        let r = reviewer(gw, 3).await;
        let cancel = CancellationToken::new();
        let req = ReviewRequest {
            work_unit_id: "wu_1",
            phase: Phase::Refine,
            requirement: "login",
            system_context: String::new(),
            cancel: &cancel,
        };
        let thesis = thesis();
        let outcome = r.review(req, thesis.clone(), "dev", &peers()).await.unwrap();
        assert_eq!(outcome.record.status, ReviewStatus::Resolved);
        assert_eq!(outcome.record.synthesis.artifact, thesis);
        assert_eq!(outcome.record.task_count(), 1);
        assert_eq!(outcome.runs.len(), 2);
    }

    #[tokio::test]
    async fn test_one_blocking_then_revision_resolves() {
        let gw = ScriptedGateway::new(|req, _| match req.task_kind {
            TaskKind::Revise => Ok("fn login() { check() }".into()),
            TaskKind::Critique if req.user_prompt.contains("fn login() {}") && req.role == "Critic" => {
                Ok("BLOCKING: no validation".into())
            }
            _ => Ok("OK".into()),
        });
        let r = reviewer(gw, 3).await;
        let cancel = CancellationToken::new();
        let req = ReviewRequest {
            work_unit_id: "wu_1",
            phase: Phase::Refine,
            requirement: "login",
            system_context: String::new(),
            cancel: &cancel,
        };
        let outcome = r.review(req, thesis(), "dev", &peers()).await.unwrap();
        assert_eq!(outcome.record.status, ReviewStatus::Resolved);
        assert_eq!(outcome.record.task_count(), 2);
        assert_eq!(outcome.record.rounds.len(), 2);
        assert_eq!(outcome.revisions.len(), 1);
        assert!(outcome.record.synthesis.artifact.content.contains("check()"));
    }

    #[tokio::test]
    async fn test_persistent_blocking_is_unresolved() {
        let gw = ScriptedGateway::new(|req, _| match req.task_kind {
            TaskKind::Critique => Ok("BLOCKING: still wrong".into()),
            _ => Ok("another attempt".into()),
        });
        let r = reviewer(gw, 3).await;
        let cancel = CancellationToken::new();
        let req = ReviewRequest {
            work_unit_id: "wu_1",
            phase: Phase::Refine,
            requirement: "login",
            system_context: String::new(),
            cancel: &cancel,
        };
        let outcome = r.review(req, thesis(), "dev", &peers()).await.unwrap();
        assert_eq!(outcome.record.status, ReviewStatus::Unresolved);
        assert_eq!(outcome.record.rounds.len(), 3);
        assert_eq!(outcome.record.revisions, 2);
        assert_eq!(outcome.record.unresolved_blocking().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_critique_counts_as_blocking() {
        let gw = ScriptedGateway::new(|req, _| match req.task_kind {
            TaskKind::Critique if req.role == "Tester" => Err(GatewayError::Rejected("policy".into())),
            TaskKind::Critique => Ok("OK".into()),
            _ => Ok("revised".into()),
        });
        let r = reviewer(gw, 1).await;
        let cancel = CancellationToken::new();
        let req = ReviewRequest {
            work_unit_id: "wu_1",
            phase: Phase::Refine,
            requirement: "login",
            system_context: String::new(),
            cancel: &cancel,
        };
        let outcome = r.review(req, thesis(), "dev", &peers()).await.unwrap();
        assert_eq!(outcome.record.status, ReviewStatus::Unresolved);
        let blocking = outcome.record.unresolved_blocking();
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].agent_id, "rev2");
    }

    #[tokio::test]
    async fn test_no_peers_resolves_immediately() {
        let gw = ScriptedGateway::new(|_, _| Ok("OK".into()));
        let r = reviewer(gw, 3).await;
        let cancel = CancellationToken::new();
        let req = ReviewRequest {
            work_unit_id: "wu_1",
            phase: Phase::Refine,
            requirement: "login",
            system_context: String::new(),
            cancel: &cancel,
        };
        let outcome = r.review(req, thesis(), "dev", &["dev".to_string()]).await.unwrap();
        assert!(outcome.record.is_resolved());
        assert!(outcome.runs.is_empty());
    }
}
