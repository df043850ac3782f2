//! 工作流层：EDRR 阶段、实体类型、任务分派、外部校验与 Phase Controller

pub mod dispatch;
pub mod engine;
pub mod phase;
pub mod quality;
pub mod types;
pub mod validation;

pub use dispatch::{TaskDispatcher, TaskRun};
pub use engine::{ContextAllocation, ControllerConfig, PhaseController, RunContext};
pub use phase::{Phase, PhasePolicy, PhaseStep};
pub use quality::{QualitySignals, QualityThresholds};
pub use types::*;
pub use validation::{
    ArtifactSet, CommandValidator, ManifestEntry, StaticValidator, ValidationError, ValidationReport, Validator,
};
