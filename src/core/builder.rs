//! 组件装配：从 AppConfig 构建 Orchestrator
//!
//! 注册表、预算、网关、执行器、分派器、评审器、校验器、存储都在这里各构造一次，
//! 组成 RunContext 显式传递。测试可以用 `with_*` 替换网关、存储与校验器。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentProfile, AgentRegistry, GatewayExecutor};
use crate::config::{AppConfig, StoreBackend};
use crate::core::{Orchestrator, OrchestratorError, WorkerPool};
use crate::llm::{LlmGateway, MockGateway, OpenAiGateway};
use crate::memory::TokenBudgetManager;
use crate::review::DialecticalReviewer;
use crate::store::{MemoryStateStore, SqliteStateStore, StateStore};
use crate::workflow::{CommandValidator, PhaseController, RunContext, StaticValidator, TaskDispatcher, Validator};

/// 根据配置与环境变量选择网关（OpenAI 兼容 / Mock）
pub fn create_gateway_from_config(cfg: &AppConfig) -> Arc<dyn LlmGateway> {
    let provider = cfg.gateway.provider.to_lowercase();
    match (provider.as_str(), cfg.gateway.resolved_api_key()) {
        ("mock", _) => {
            tracing::info!("Using Mock gateway");
            Arc::new(MockGateway::new())
        }
        (_, Some(key)) => {
            tracing::info!(model = %cfg.gateway.model, "Using OpenAI-compatible gateway");
            Arc::new(OpenAiGateway::new(
                cfg.gateway.base_url.as_deref(),
                &cfg.gateway.model,
                Some(&key),
            ))
        }
        (_, None) => {
            tracing::warn!("No API key set, using Mock gateway");
            Arc::new(MockGateway::new())
        }
    }
}

pub fn create_validator_from_config(cfg: &AppConfig) -> Arc<dyn Validator> {
    match cfg.validation.command.as_deref().map(str::trim) {
        Some(cmd) if !cmd.is_empty() => {
            let dir = cfg
                .validation
                .working_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            tracing::info!(command = %cmd, dir = %dir.display(), "Using command validator");
            Arc::new(
                CommandValidator::new(cmd, dir)
                    .with_timeout(Duration::from_secs(cfg.validation.timeout_secs))
                    .with_artifact_root(cfg.artifact_root()),
            )
        }
        _ => {
            tracing::info!("No validation command configured; every validation passes");
            Arc::new(StaticValidator::passing())
        }
    }
}

pub fn create_store_from_config(cfg: &AppConfig) -> Result<Arc<dyn StateStore>, OrchestratorError> {
    match cfg.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStateStore::new())),
        StoreBackend::Sqlite => {
            let path = cfg.store_path();
            let store = SqliteStateStore::open(&path).map_err(OrchestratorError::PersistenceWriteFailure)?;
            tracing::debug!(path = %path.display(), "sqlite store opened");
            Ok(Arc::new(store))
        }
    }
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    gateway: Option<Arc<dyn LlmGateway>>,
    store: Option<Arc<dyn StateStore>>,
    validator: Option<Arc<dyn Validator>>,
    roster: Option<Vec<AgentProfile>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            gateway: None,
            store: None,
            validator: None,
            roster: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn LlmGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_roster(mut self, roster: Vec<AgentProfile>) -> Self {
        self.roster = Some(roster);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let cfg = self.config;
        cfg.validate().map_err(OrchestratorError::Config)?;

        let roster = self
            .roster
            .unwrap_or_else(|| cfg.agents.iter().map(|a| a.to_profile()).collect());
        let registry = Arc::new(AgentRegistry::from_roster(roster).await?);
        let agents = registry.len().await;

        let budget = Arc::new(TokenBudgetManager::new(cfg.budget.run_ceiling, cfg.budget.unit_ceiling));
        let gateway = self
            .gateway
            .unwrap_or_else(|| create_gateway_from_config(&cfg));
        let executor = Arc::new(GatewayExecutor::new(gateway, budget.clone()).with_retry(cfg.gateway.retry_policy()));

        let workers = match cfg.orchestrator.worker_concurrency {
            0 => agents,
            n => n,
        };
        let dispatcher = Arc::new(TaskDispatcher::new(registry.clone(), executor, WorkerPool::new(workers)));
        let reviewer = Arc::new(
            DialecticalReviewer::new(dispatcher.clone())
                .with_max_rounds(cfg.review.max_rounds)
                .with_max_tokens(cfg.review.max_tokens),
        );
        let store = match self.store {
            Some(store) => store,
            None => create_store_from_config(&cfg)?,
        };
        let validator = self
            .validator
            .unwrap_or_else(|| create_validator_from_config(&cfg));

        let ctx = RunContext {
            registry,
            budget,
            store,
            dispatcher,
            reviewer,
            validator,
            validation_retry: cfg.validation.retry_policy(),
        };
        tracing::info!(
            agents,
            workers,
            max_iterations = cfg.orchestrator.max_iterations,
            run_ceiling = cfg.budget.run_ceiling,
            unit_ceiling = cfg.budget.unit_ceiling,
            "orchestrator assembled"
        );
        Ok(Orchestrator::new(
            ctx,
            PhaseController::new(cfg.controller_config()),
            cfg.orchestrator.max_concurrent_units,
        ))
    }
}
