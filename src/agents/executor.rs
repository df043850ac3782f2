//! 统一的 Agent 执行接口
//!
//! 角色管理只按能力标签分派；具体 Agent 一律通过 `AgentExecutor::execute` 完成任务。
//! GatewayExecutor 的每次调用：估算 → 预留预算 → 带重试调用网关 → 按实际用量提交（失败则释放）。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentProfile;
use crate::core::TaskError;
use crate::llm::{call_with_retry, GatewayRequest, LlmGateway, RetryFailure, RetryPolicy};
use crate::memory::{ReserveDecision, TokenBudgetManager, TokenEstimator};
use crate::workflow::Task;

/// 任务输入（已组装好的上下文与提示）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInput {
    pub system_context: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// 任务产出与实际用量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub retries: u32,
}

impl AgentOutput {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        agent: &AgentProfile,
        task: &Task,
        input: &TaskInput,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, TaskError>;
}

/// 经 LLM 网关执行任务，受 Token 预算约束
pub struct GatewayExecutor {
    gateway: Arc<dyn LlmGateway>,
    budget: Arc<TokenBudgetManager>,
    retry: RetryPolicy,
}

impl GatewayExecutor {
    pub fn new(gateway: Arc<dyn LlmGateway>, budget: Arc<TokenBudgetManager>) -> Self {
        Self {
            gateway,
            budget,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 悲观估算：上下文 + 提示 + 最大补全长度
    pub fn estimate(input: &TaskInput) -> u64 {
        (TokenEstimator::estimate(&input.system_context) + TokenEstimator::estimate(&input.prompt))
            as u64
            + u64::from(input.max_tokens)
    }
}

#[async_trait]
impl AgentExecutor for GatewayExecutor {
    async fn execute(
        &self,
        agent: &AgentProfile,
        task: &Task,
        input: &TaskInput,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, TaskError> {
        let estimate = Self::estimate(input);
        let reservation = match self.budget.reserve(&task.work_unit_id, estimate).await {
            ReserveDecision::Allow(r) => r,
            ReserveDecision::Deny {
                scope,
                requested,
                remaining,
            } => {
                return Err(TaskError::BudgetExceeded {
                    scope,
                    requested,
                    remaining,
                })
            }
        };

        let request = GatewayRequest {
            role: agent.role.clone(),
            task_kind: task.kind,
            system_context: input.system_context.clone(),
            user_prompt: input.prompt.clone(),
            max_tokens: input.max_tokens,
        };
        let label = format!("{}:{}", self.gateway.name(), task.kind.as_str());
        let result = call_with_retry(&self.retry, cancel, &label, |_| self.gateway.invoke(&request)).await;

        match result {
            Ok(outcome) => {
                let response = outcome.value;
                self.budget
                    .commit(reservation, response.prompt_tokens, response.completion_tokens)
                    .await
                    .map_err(|e| TaskError::Invariant(e.to_string()))?;
                Ok(AgentOutput {
                    content: response.text,
                    prompt_tokens: response.prompt_tokens,
                    completion_tokens: response.completion_tokens,
                    retries: outcome.retries,
                })
            }
            Err(failure) => {
                self.budget
                    .release(reservation)
                    .await
                    .map_err(|e| TaskError::Invariant(e.to_string()))?;
                Err(match failure {
                    RetryFailure::Cancelled { .. } => TaskError::Cancelled,
                    RetryFailure::Fatal { error, .. } => TaskError::Rejected(error.to_string()),
                    RetryFailure::Exhausted { attempts, last } => TaskError::TransientGatewayError {
                        attempts,
                        message: last.to_string(),
                    },
                })
            }
        }
    }
}
