//! Mock 网关（用于测试与离线运行，无需 API）
//!
//! MockGateway 按任务类型回显确定性的文本；评审任务一律回复 "OK"（无意见）。
//! ScriptedGateway 把每次调用交给闭包决定，便于在测试中注入失败、阻塞性意见等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{GatewayError, GatewayRequest, GatewayResponse, LlmGateway};
use crate::memory::TokenEstimator;
use crate::workflow::TaskKind;

/// 确定性 Mock：第一行 user prompt 作为主题回显
#[derive(Debug, Default)]
pub struct MockGateway {
    calls: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

fn respond(request: &GatewayRequest, text: String) -> GatewayResponse {
    let prompt_tokens =
        TokenEstimator::estimate(&request.system_context) + TokenEstimator::estimate(&request.user_prompt);
    let completion_tokens = TokenEstimator::estimate(&text).min(request.max_tokens.max(1) as usize);
    GatewayResponse {
        text,
        prompt_tokens: prompt_tokens as u64,
        completion_tokens: completion_tokens as u64,
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let topic = request
            .user_prompt
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("(no input)")
            .trim();

        let text = match request.task_kind {
            TaskKind::Critique => "OK".to_string(),
            kind => format!("[{}] {} from Mock: {}", request.role, kind.as_str(), topic),
        };
        Ok(respond(request, text))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

type Script = dyn Fn(&GatewayRequest, u64) -> Result<String, GatewayError> + Send + Sync;

/// 脚本化网关：闭包收到请求与调用序号（从 0 开始），返回文本或错误
#[derive(Clone)]
pub struct ScriptedGateway {
    script: Arc<Script>,
    calls: Arc<AtomicU64>,
}

impl ScriptedGateway {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&GatewayRequest, u64) -> Result<String, GatewayError> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let text = (self.script)(request, n)?;
        Ok(respond(request, text))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: TaskKind) -> GatewayRequest {
        GatewayRequest {
            role: "Analyst".into(),
            task_kind: kind,
            system_context: "ctx".into(),
            user_prompt: "\nlogin form\nmore".into(),
            max_tokens: 256,
        }
    }

    #[tokio::test]
    async fn test_mock_echoes_topic() {
        let gw = MockGateway::new();
        let resp = gw.invoke(&request(TaskKind::DraftSpecification)).await.unwrap();
        assert!(resp.text.contains("login form"));
        assert!(resp.prompt_tokens >= 1);
        assert_eq!(gw.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_critique_is_ok() {
        let gw = MockGateway::new();
        let resp = gw.invoke(&request(TaskKind::Critique)).await.unwrap();
        assert_eq!(resp.text, "OK");
    }

    #[tokio::test]
    async fn test_scripted_gateway_counts_calls() {
        let gw = ScriptedGateway::new(|_, n| {
            if n == 0 {
                Err(GatewayError::Transient("first".into()))
            } else {
                Ok("second".into())
            }
        });
        assert!(gw.invoke(&request(TaskKind::Implement)).await.is_err());
        assert_eq!(gw.invoke(&request(TaskKind::Implement)).await.unwrap().text, "second");
        assert_eq!(gw.calls(), 2);
    }
}
