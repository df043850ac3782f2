//! 错误类型与恢复动作
//!
//! TaskError 只在 Phase Controller 边界内流动，经 RecoveryEngine 转为阶段转移决策；
//! 只有持久化失败与不变量破坏会以 OrchestratorError 的形式向上传播。

use thiserror::Error;

use crate::agents::RegistryError;
use crate::memory::BudgetScope;
use crate::workflow::{EscalationReason, UnitStatus};

/// 单个 Task 的失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// 重试耗尽后的网关瞬时错误 / 限流 / 超时
    #[error("Transient gateway error after {attempts} attempts: {message}")]
    TransientGatewayError { attempts: u32, message: String },

    /// 网关拒绝（内容策略等），不重试
    #[error("Gateway rejected request: {0}")]
    Rejected(String),

    #[error("Budget exceeded ({scope}): requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        scope: BudgetScope,
        requested: u64,
        remaining: i64,
    },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl TaskError {
    /// 首次之外的网关尝试次数
    pub fn retries(&self) -> u32 {
        match self {
            TaskError::TransientGatewayError { attempts, .. } => attempts.saturating_sub(1),
            _ => 0,
        }
    }
}

/// 持久化错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Work unit not found: {0}")]
    NotFound(String),

    #[error("Transition sequence gap for {unit}: expected {expected}, got {got}")]
    SequenceGap { unit: String, expected: u64, got: u64 },

    #[error("Storage write failed: {0}")]
    Write(String),

    #[error("Storage read failed: {0}")]
    Read(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Write(e.to_string())
    }
}

/// 编排器对外错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 持久化失败：进程必须停止，不能带着只存在于内存的状态继续
    #[error("Persistence write failure: {0}")]
    PersistenceWriteFailure(StoreError),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// 运行被停止：本阶段未提交，WorkUnit 停在最后一次持久化的状态
    #[error("Run stopped before work unit {0} committed its phase")]
    Interrupted(String),

    #[error("Work unit not found: {0}")]
    NotFound(String),

    #[error("Work unit {unit} is {status:?}; operation requires {expected}")]
    InvalidState {
        unit: String,
        status: UnitStatus,
        expected: &'static str,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::PersistenceWriteFailure(other),
        }
    }
}

/// RecoveryEngine 给出的处置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 视为阻塞性差异，按有界回退规则处理
    LoopBack,
    /// 转入 Blocked，等待人工决策
    Block(EscalationReason),
    /// 转入 Abandoned
    Abandon(EscalationReason),
    /// 进程级错误，向上传播
    Fatal,
}
