//! 任务分派器
//!
//! 在有界工作池内把 Task 交给 AgentExecutor 执行，并维护 Task 状态（Pending → Running → Succeeded/Failed）
//! 与 Agent 状态；每个任务输出一行结构化审计日志（JSON）。
//! 由 Phase Controller 持有，评审器借用它分派评审与修订任务。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentExecutor, AgentOutput, AgentRegistry, TaskInput};
use crate::core::{TaskError, WorkerPool};
use crate::workflow::{Task, TaskStatus};

/// 一次分派的结果
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: Task,
    pub output: Option<AgentOutput>,
    pub error: Option<TaskError>,
}

impl TaskRun {
    pub fn is_success(&self) -> bool {
        self.task.status == TaskStatus::Succeeded
    }

    /// (prompt, completion)
    pub fn tokens(&self) -> (u64, u64) {
        self.output
            .as_ref()
            .map(|o| (o.prompt_tokens, o.completion_tokens))
            .unwrap_or((0, 0))
    }
}

pub struct TaskDispatcher {
    registry: Arc<AgentRegistry>,
    executor: Arc<dyn AgentExecutor>,
    pool: WorkerPool,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<AgentRegistry>, executor: Arc<dyn AgentExecutor>, pool: WorkerPool) -> Self {
        Self {
            registry,
            executor,
            pool,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    fn fail(mut task: Task, error: TaskError) -> TaskRun {
        task.status = TaskStatus::Failed;
        task.retries = error.retries();
        task.error = Some(error.to_string());
        task.finished_at = Some(Utc::now());
        TaskRun {
            task,
            output: None,
            error: Some(error),
        }
    }

    pub async fn dispatch(&self, task: Task, input: TaskInput, cancel: &CancellationToken) -> TaskRun {
        let start = Instant::now();
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            p = self.pool.acquire() => p,
        };
        let run = match permit {
            None if cancel.is_cancelled() => Self::fail(task, TaskError::Cancelled),
            None => Self::fail(task, TaskError::Invariant("worker pool closed".to_string())),
            Some(_permit) => self.execute(task, input, cancel).await,
        };
        audit(&run, start);
        run
    }

    async fn execute(&self, mut task: Task, input: TaskInput, cancel: &CancellationToken) -> TaskRun {
        let Some(agent) = self.registry.get(&task.agent_id).await else {
            let id = task.agent_id.clone();
            return Self::fail(task, TaskError::UnknownAgent(id));
        };
        if let Err(e) = self.registry.task_started(&agent.id).await {
            return Self::fail(task, TaskError::UnknownAgent(e.to_string()));
        }
        task.status = TaskStatus::Running;

        let result = self.executor.execute(&agent, &task, &input, cancel).await;
        let tokens = result.as_ref().map(|o| o.total_tokens()).unwrap_or(0);
        self.registry
            .task_finished(&agent.id, tokens, result.is_err())
            .await;

        match result {
            Ok(output) => {
                task.status = TaskStatus::Succeeded;
                task.retries = output.retries;
                task.finished_at = Some(Utc::now());
                TaskRun {
                    task,
                    output: Some(output),
                    error: None,
                }
            }
            Err(e) => Self::fail(task, e),
        }
    }

    /// 并发分派（受工作池限制），全部返回后才结束；结果顺序与输入一致
    pub async fn dispatch_all(&self, jobs: Vec<(Task, TaskInput)>, cancel: &CancellationToken) -> Vec<TaskRun> {
        join_all(
            jobs.into_iter()
                .map(|(task, input)| self.dispatch(task, input, cancel)),
        )
        .await
    }
}

fn audit(run: &TaskRun, start: Instant) {
    let outcome = match &run.error {
        None => "ok",
        Some(TaskError::Cancelled) => "cancelled",
        Some(TaskError::BudgetExceeded { .. }) => "budget_exceeded",
        Some(TaskError::Rejected(_)) => "rejected",
        Some(TaskError::TransientGatewayError { .. }) => "retries_exhausted",
        Some(_) => "error",
    };
    let (prompt_tokens, completion_tokens) = run.tokens();
    let audit = serde_json::json!({
        "event": "task_audit",
        "unit": run.task.work_unit_id,
        "phase": run.task.phase.as_str(),
        "task": run.task.id,
        "kind": run.task.kind.as_str(),
        "agent": run.task.agent_id,
        "ok": run.error.is_none(),
        "outcome": outcome,
        "retries": run.task.retries,
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "duration_ms": start.elapsed().as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "task");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfile, AgentStatus, Capability, GatewayExecutor};
    use crate::llm::MockGateway;
    use crate::memory::TokenBudgetManager;
    use crate::workflow::{Phase, TaskKind};

    async fn dispatcher() -> TaskDispatcher {
        let registry = Arc::new(
            AgentRegistry::from_roster(vec![
                AgentProfile::new("alice", "Analyst", vec![Capability::Specification]),
                AgentProfile::new("tess", "Tester", vec![Capability::Testing]),
            ])
            .await
            .unwrap(),
        );
        let budget = Arc::new(TokenBudgetManager::new(100_000, 100_000));
        let executor = Arc::new(GatewayExecutor::new(Arc::new(MockGateway::new()), budget));
        TaskDispatcher::new(registry, executor, WorkerPool::new(2))
    }

    fn input() -> TaskInput {
        TaskInput {
            system_context: String::new(),
            prompt: "draft".into(),
            max_tokens: 32,
        }
    }

    #[tokio::test]
    async fn test_dispatch_marks_task_succeeded() {
        let d = dispatcher().await;
        let task = Task::new("wu_1", Phase::Expand, TaskKind::DraftSpecification, "alice");
        let run = d.dispatch(task, input(), &CancellationToken::new()).await;
        assert!(run.is_success());
        assert!(run.task.finished_at.is_some());
        let alice = d.registry().get("alice").await.unwrap();
        assert_eq!(alice.status, AgentStatus::Idle);
        assert!(alice.tokens_used > 0);
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_task() {
        let d = dispatcher().await;
        let task = Task::new("wu_1", Phase::Expand, TaskKind::DraftSpecification, "ghost");
        let run = d.dispatch(task, input(), &CancellationToken::new()).await;
        assert_eq!(run.task.status, TaskStatus::Failed);
        assert!(matches!(run.error, Some(TaskError::UnknownAgent(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let d = dispatcher().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = Task::new("wu_1", Phase::Expand, TaskKind::DraftSpecification, "alice");
        let run = d.dispatch(task, input(), &cancel).await;
        assert!(matches!(run.error, Some(TaskError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dispatch_all_preserves_order() {
        let d = dispatcher().await;
        let jobs = vec![
            (Task::new("wu_1", Phase::Expand, TaskKind::DraftSpecification, "alice"), input()),
            (Task::new("wu_1", Phase::Expand, TaskKind::DraftTests, "tess"), input()),
        ];
        let runs = d.dispatch_all(jobs, &CancellationToken::new()).await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].task.agent_id, "alice");
        assert_eq!(runs[1].task.kind, TaskKind::DraftTests);
        assert!(runs.iter().all(|r| r.is_success()));
    }
}
