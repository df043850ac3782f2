//! 核心编排层：错误与恢复、状态报告、运行监管、工作池、编排器与装配

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod supervisor;
pub mod task_scheduler;

pub use builder::{create_gateway_from_config, create_store_from_config, create_validator_from_config, OrchestratorBuilder};
pub use error::{OrchestratorError, RecoveryAction, StoreError, TaskError};
pub use orchestrator::{AbandonOutcome, Orchestrator};
pub use recovery::RecoveryEngine;
pub use state::{ExitStatus, ReviewSummary, TokenReport, UnitReport, UnitSummary, UnitTokens};
pub use supervisor::{RunSupervisor, UnitSignal};
pub use task_scheduler::WorkerPool;
