//! OpenAI 兼容网关
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 错误文本归类为 RateLimited / Rejected / Transient，由重试层决定是否重试。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{GatewayError, GatewayRequest, GatewayResponse, LlmGateway};

/// OpenAI 兼容网关：持有 Client 与 model 名
pub struct OpenAiGateway {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiGateway {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_messages(
        request: &GatewayRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, GatewayError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(format!(
                "You are the {} agent.\n\n{}",
                request.role, request.system_context
            ))
            .build()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(request.user_prompt.clone())
            .build()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

/// 按错误文本归类
pub fn classify_error(message: &str) -> GatewayError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        GatewayError::RateLimited {
            message: message.to_string(),
            retry_after_ms: None,
        }
    } else if lower.contains("content_policy")
        || lower.contains("content filter")
        || lower.contains("content_filter")
        || lower.contains("invalid_request")
        || lower.contains("401")
        || lower.contains("403")
    {
        GatewayError::Rejected(message.to_string())
    } else {
        GatewayError::Transient(message.to_string())
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_messages(request)?)
            .max_completion_tokens(request.max_tokens)
            .build()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| classify_error(&e.to_string()))?;

        let (prompt_tokens, completion_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        tracing::debug!(
            model = %self.model,
            prompt_tokens,
            completion_tokens,
            "openai completion"
        );

        Ok(GatewayResponse {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}
