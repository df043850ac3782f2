//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `EDRR__*` 覆盖（双下划线表示嵌套，如 `EDRR__BUDGET__RUN_CEILING=50000`）。
//! 每个字段都有默认值，空配置也是合法配置。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agents::{AgentProfile, Capability};
use crate::llm::RetryPolicy;
use crate::workflow::{ContextAllocation, ControllerConfig, QualityThresholds};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub review: ReviewSection,
    pub budget: BudgetSection,
    pub gateway: GatewaySection,
    pub validation: ValidationSection,
    pub store: StoreSection,
    pub logging: LoggingSection,
    pub agents: Vec<AgentEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            orchestrator: OrchestratorSection::default(),
            review: ReviewSection::default(),
            budget: BudgetSection::default(),
            gateway: GatewaySection::default(),
            validation: ValidationSection::default(),
            store: StoreSection::default(),
            logging: LoggingSection::default(),
            agents: default_roster(),
        }
    }
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 数据目录（SQLite 文件、校验命令的工作目录）
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "edrr".to_string(),
            data_dir: PathBuf::from(".edrr"),
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_iterations: u32,
    /// 同时驱动的 WorkUnit 上限
    pub max_concurrent_units: usize,
    /// 阶段内并发任务数；0 表示等于注册的 Agent 数
    pub worker_concurrency: usize,
    /// [orchestrator.quality] 阶段质量门槛
    pub quality: QualityThresholds,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_concurrent_units: 4,
            worker_concurrency: 0,
            quality: QualityThresholds::default(),
        }
    }
}

/// [review] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    pub max_rounds: u32,
    pub max_tokens: u32,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            max_tokens: 512,
        }
    }
}

/// [budget] 段：运行级 / 单元级上限、单次补全上限、各阶段上下文预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub run_ceiling: u64,
    pub unit_ceiling: u64,
    pub max_completion_tokens: u32,
    pub context: ContextAllocation,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            run_ceiling: 200_000,
            unit_ceiling: 50_000,
            max_completion_tokens: 1024,
            context: ContextAllocation::default(),
        }
    }
}

/// [gateway] 段：后端与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// openai / mock；openai 但没有 API Key 时退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 单次请求超时（秒）
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            timeout_secs: 120,
            max_attempts: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl GatewaySection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_attempt_timeout(Duration::from_secs(self.timeout_secs))
    }

    /// 配置里的 Key 优先，其次 OPENAI_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

/// [validation] 段：为空命令时使用总是通过的 StaticValidator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub command: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// 校验重试的首次退避
    pub base_backoff_ms: u64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            command: None,
            working_dir: None,
            timeout_secs: 300,
            max_attempts: 3,
            base_backoff_ms: 1000,
        }
    }
}

impl ValidationSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        // 命令自带超时，这里只给一个更宽的外层上限
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_backoff_ms))
            .with_attempt_timeout(Duration::from_secs(self.timeout_secs + 5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// [store] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// SQLite 文件；未设置时为 `<data_dir>/edrr.db`
    pub path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: None,
        }
    }
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// [[agents]] 条目
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    pub role: String,
    pub capabilities: Vec<Capability>,
}

impl AgentEntry {
    fn new(id: &str, role: &str, capabilities: &[Capability]) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            capabilities: capabilities.to_vec(),
        }
    }

    pub fn to_profile(&self) -> AgentProfile {
        AgentProfile::new(&self.id, &self.role, self.capabilities.clone())
    }
}

/// 默认五人团队：每个阶段至少有两个合格 Agent，Primus 才能轮换
pub fn default_roster() -> Vec<AgentEntry> {
    use Capability::*;
    vec![
        AgentEntry::new("analyst", "requirements analyst", &[Specification, Review, Retrospective]),
        AgentEntry::new("architect", "software architect", &[Specification, Code, Review]),
        AgentEntry::new("developer", "developer", &[Code, Testing]),
        AgentEntry::new("tester", "test engineer", &[Testing, Review]),
        AgentEntry::new("critic", "critic", &[Review, Retrospective]),
    ]
}

impl AppConfig {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_iterations: self.orchestrator.max_iterations,
            max_tokens: self.budget.max_completion_tokens,
            context: self.budget.context,
            quality: self.orchestrator.quality,
        }
    }

    /// 校验命令可见的工件目录根：`<data_dir>/artifacts`
    pub fn artifact_root(&self) -> PathBuf {
        self.app.data_dir.join("artifacts")
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("edrr.db"))
    }

    /// 加载后的一致性检查
    pub fn validate(&self) -> Result<(), String> {
        if self.agents.is_empty() {
            return Err("agent roster is empty".to_string());
        }
        if self.orchestrator.max_iterations == 0 {
            return Err("orchestrator.max_iterations must be at least 1".to_string());
        }
        self.orchestrator.quality.validate()?;
        if self.budget.unit_ceiling > self.budget.run_ceiling {
            tracing::warn!(
                unit_ceiling = self.budget.unit_ceiling,
                run_ceiling = self.budget.run_ceiling,
                "unit ceiling exceeds run ceiling"
            );
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 EDRR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在）
/// 3. 最后叠加环境变量 EDRR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("EDRR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.agents.len(), 5);
        assert_eq!(cfg.orchestrator.max_iterations, 5);
        assert_eq!(cfg.gateway.max_attempts, 3);
        assert_eq!(cfg.store_path(), PathBuf::from(".edrr").join("edrr.db"));
        assert_eq!(cfg.artifact_root(), PathBuf::from(".edrr").join("artifacts"));
    }

    #[test]
    fn test_default_roster_covers_every_phase_twice() {
        let roster = default_roster();
        for cap in [
            Capability::Specification,
            Capability::Testing,
            Capability::Code,
            Capability::Retrospective,
        ] {
            let eligible = roster.iter().filter(|a| a.capabilities.contains(&cap)).count();
            assert!(eligible >= 2, "{cap} has {eligible} eligible agents");
        }
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edrr.toml");
        std::fs::write(
            &path,
            r#"
[orchestrator]
max_iterations = 2

[orchestrator.quality]
refine = 0.9

[budget]
unit_ceiling = 1000

[store]
backend = "memory"

[[agents]]
id = "solo"
role = "generalist"
capabilities = ["specification", "testing", "code", "review", "retrospective"]
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_iterations, 2);
        assert_eq!(cfg.orchestrator.quality.refine, 0.9);
        assert_eq!(cfg.orchestrator.quality.expand, 0.5);
        assert_eq!(cfg.budget.unit_ceiling, 1000);
        assert_eq!(cfg.budget.run_ceiling, 200_000);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.agents[0].capabilities.len(), 5);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/edrr.toml"))).is_err());
    }
}
