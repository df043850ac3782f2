//! 错误恢复引擎
//!
//! 根据 TaskError 与所处阶段返回 RecoveryAction，供 Phase Controller 决定回退、阻塞、放弃还是终止进程。

use crate::core::{RecoveryAction, TaskError};
use crate::workflow::{EscalationReason, Phase};

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &TaskError, phase: Phase) -> RecoveryAction {
        match err {
            TaskError::Cancelled => RecoveryAction::Abandon(EscalationReason::Cancelled),
            TaskError::BudgetExceeded { .. } => {
                RecoveryAction::Block(EscalationReason::BudgetExhausted)
            }
            TaskError::Invariant(_) | TaskError::UnknownAgent(_) => RecoveryAction::Fatal,
            TaskError::TransientGatewayError { .. } | TaskError::Rejected(_) => {
                if phase == Phase::Retrospect {
                    // Retrospect 不回退
                    RecoveryAction::Block(EscalationReason::TaskFailed {
                        message: err.to_string(),
                    })
                } else {
                    RecoveryAction::LoopBack
                }
            }
        }
    }
}
