//! LLM 层：网关抽象、重试与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use mock::{MockGateway, ScriptedGateway};
pub use openai::OpenAiGateway;
pub use retry::{call_with_retry, RetryFailure, RetryOutcome, RetryPolicy, Retryable};
pub use traits::{GatewayError, GatewayRequest, GatewayResponse, LlmGateway};
