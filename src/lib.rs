//! EDRR - 多智能体迭代开发编排器
//!
//! 一个需求（WorkUnit）依次经过 Expand → Differentiate → Refine → Retrospect，
//! 每个阶段轮换一个 Primus Agent 负责，候选产出经辩证评审与外部校验，
//! 所有阶段转移原子持久化，Token 用量受单元级与运行级预算约束。
//!
//! 模块划分：
//! - **agents**: Agent 定义、注册表与 Primus 轮换、统一执行接口
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、错误与恢复、报告、运行监管、工作池
//! - **llm**: 网关抽象、重试与实现（OpenAI 兼容 / Mock）
//! - **memory**: Token 预算、上下文组装、知识库与分词
//! - **observability**: 日志初始化
//! - **review**: 辩证评审
//! - **store**: 工作流状态存储（SQLite / 内存）
//! - **workflow**: EDRR 阶段、实体类型、任务分派、校验与 Phase Controller

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod review;
pub mod store;
pub mod workflow;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorError};
pub use crate::workflow::{Phase, UnitStatus, WorkUnit};
