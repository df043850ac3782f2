//! LLM 网关抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmGateway：invoke(role, system_context, user_prompt, max_tokens)。
//! 失败分三类：TransientError / RateLimited 可重试，Rejected（如内容策略）不可重试。

use async_trait::async_trait;
use thiserror::Error;

use crate::workflow::TaskKind;

/// 一次网关调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRequest {
    /// 调用方 Agent 的角色名
    pub role: String,
    /// 触发调用的任务类型（后端可据此选择模板）
    pub task_kind: TaskKind,
    pub system_context: String,
    pub user_prompt: String,
    pub max_tokens: u32,
}

/// 网关返回的文本与实际用量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transient gateway error: {0}")]
    Transient(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }
}

/// 语言模型网关 trait
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "gateway"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::Transient("reset".into()).is_retryable());
        assert!(GatewayError::RateLimited {
            message: "429".into(),
            retry_after_ms: None
        }
        .is_retryable());
        assert!(!GatewayError::Rejected("policy".into()).is_retryable());
    }
}
