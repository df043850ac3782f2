//! 外部校验（测试运行）
//!
//! `run(artifact_set) -> {passed, discrepancies}`，在 Differentiate / Refine 结束时调用。
//! CommandValidator 先把工件写到 `<artifact_root>/<work_unit_id>/`（附 `manifest.json`），
//! 再运行配置的命令（如 `cargo test`），命令通过环境变量找到这些文件；
//! StaticValidator 返回预设结果。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::llm::Retryable;
use crate::workflow::{Artifact, ArtifactId, ArtifactKind, Discrepancy, Phase};

/// 一次校验的输入：某个 WorkUnit 当前的全部工件
#[derive(Debug, Clone, Copy)]
pub struct ArtifactSet<'a> {
    pub work_unit_id: &'a str,
    pub artifacts: &'a [Artifact],
}

impl<'a> ArtifactSet<'a> {
    pub fn new(work_unit_id: &'a str, artifacts: &'a [Artifact]) -> Self {
        Self {
            work_unit_id,
            artifacts,
        }
    }

    /// 失败归因的工件：最新代码，其次最新测试，再其次最新工件
    pub fn subject(&self) -> Option<&'a Artifact> {
        let artifacts = self.artifacts;
        let latest = |kind: ArtifactKind| artifacts.iter().rev().find(|a| a.kind == kind);
        latest(ArtifactKind::Code)
            .or_else(|| latest(ArtifactKind::Test))
            .or_else(|| artifacts.last())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub discrepancies: Vec<Discrepancy>,
}

impl ValidationReport {
    pub fn passing() -> Self {
        Self {
            passed: true,
            discrepancies: Vec::new(),
        }
    }

    pub fn failing(discrepancies: Vec<Discrepancy>) -> Self {
        Self {
            passed: discrepancies.is_empty(),
            discrepancies,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Validation timed out after {0}ms")]
    Timeout(u64),

    #[error("Validation runner unavailable: {0}")]
    Unavailable(String),

    #[error("Validation misconfigured: {0}")]
    Misconfigured(String),
}

impl Retryable for ValidationError {
    fn is_retryable(&self) -> bool {
        !matches!(self, ValidationError::Misconfigured(_))
    }

    fn timed_out(after: Duration) -> Self {
        ValidationError::Timeout(after.as_millis() as u64)
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn run(&self, set: ArtifactSet<'_>) -> Result<ValidationReport, ValidationError>;
}

/// 预设结果：按顺序返回，最后一个重复使用；为空时总是通过
#[derive(Debug, Default)]
pub struct StaticValidator {
    reports: Mutex<Vec<ValidationReport>>,
}

impl StaticValidator {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn sequence(reports: Vec<ValidationReport>) -> Self {
        let mut reports = reports;
        reports.reverse();
        Self {
            reports: Mutex::new(reports),
        }
    }
}

#[async_trait]
impl Validator for StaticValidator {
    async fn run(&self, _set: ArtifactSet<'_>) -> Result<ValidationReport, ValidationError> {
        let mut reports = self
            .reports
            .lock()
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;
        let report = match reports.len() {
            0 => ValidationReport::passing(),
            1 => reports[0].clone(),
            _ => reports.pop().unwrap_or_default(),
        };
        Ok(report)
    }
}

static FAILED_TEST: OnceLock<Regex> = OnceLock::new();

fn failed_test_line() -> &'static Regex {
    FAILED_TEST.get_or_init(|| {
        Regex::new(r"(?m)^test (\S+) \.\.\. FAILED\s*$").expect("failed-test regex is valid")
    })
}

/// 从测试输出中提取失败用例；找不到时返回一条概括性差异
pub fn parse_failures(output: &str, exit_code: i32) -> Vec<Discrepancy> {
    let mut found: Vec<Discrepancy> = failed_test_line()
        .captures_iter(output)
        .map(|caps| Discrepancy::new(format!("test:{}", &caps[1]), format!("test {} failed", &caps[1])))
        .collect();
    found.dedup_by(|a, b| a.id == b.id);

    if found.is_empty() {
        let tail: Vec<&str> = output.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        found.push(Discrepancy::new(
            format!("exit:{exit_code}"),
            format!("validation command exited with {exit_code}: {}", tail.join(" | ")),
        ));
    }
    found
}

/// manifest.json 中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub phase: Phase,
    pub produced_by: String,
    /// 相对工件目录的文件名
    pub file: String,
}

/// 把工件写入目录（先清空旧内容），返回清单
pub async fn write_artifacts(dir: &Path, artifacts: &[Artifact]) -> std::io::Result<Vec<ManifestEntry>> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;

    let mut manifest = Vec::with_capacity(artifacts.len());
    for (i, artifact) in artifacts.iter().enumerate() {
        let file = format!("{:03}_{}.txt", i, artifact.kind.as_str());
        tokio::fs::write(dir.join(&file), &artifact.content).await?;
        manifest.push(ManifestEntry {
            id: artifact.id.clone(),
            kind: artifact.kind,
            phase: artifact.phase,
            produced_by: artifact.produced_by.clone(),
            file,
        });
    }
    let json = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
    tokio::fs::write(dir.join("manifest.json"), json).await?;
    Ok(manifest)
}

/// 运行外部命令（经 `sh -c`），非零退出码时把失败用例转为差异
///
/// 命令可见的环境变量：`EDRR_WORK_UNIT`、`EDRR_ARTIFACT_DIR`、`EDRR_ARTIFACT_MANIFEST`。
pub struct CommandValidator {
    command: String,
    working_dir: PathBuf,
    artifact_root: PathBuf,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        let working_dir = working_dir.into();
        Self {
            command: command.into(),
            artifact_root: working_dir.join(".edrr").join("artifacts"),
            working_dir,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    pub fn artifact_dir(&self, work_unit_id: &str) -> PathBuf {
        self.artifact_root.join(work_unit_id)
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn run(&self, set: ArtifactSet<'_>) -> Result<ValidationReport, ValidationError> {
        if self.command.trim().is_empty() {
            return Err(ValidationError::Misconfigured("empty command".to_string()));
        }
        let dir = self.artifact_dir(set.work_unit_id);
        let manifest = write_artifacts(&dir, set.artifacts)
            .await
            .map_err(|e| ValidationError::Unavailable(format!("writing artifacts to {}: {e}", dir.display())))?;
        // 命令在 working_dir 下执行，环境变量里给绝对路径
        let dir = tokio::fs::canonicalize(&dir)
            .await
            .map_err(|e| ValidationError::Unavailable(format!("resolving {}: {e}", dir.display())))?;
        tracing::debug!(unit = %set.work_unit_id, dir = %dir.display(), files = manifest.len(), "artifacts written");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .env("EDRR_WORK_UNIT", set.work_unit_id)
            .env("EDRR_ARTIFACT_DIR", &dir)
            .env("EDRR_ARTIFACT_MANIFEST", dir.join("manifest.json"))
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ValidationError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;

        if output.status.success() {
            return Ok(ValidationReport::passing());
        }
        let exit_code = output.status.code().unwrap_or(-1);
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut discrepancies = parse_failures(&combined, exit_code);
        if let Some(subject) = set.subject() {
            discrepancies = discrepancies
                .into_iter()
                .map(|d| d.with_artifact(subject.id.clone()))
                .collect();
        }
        tracing::info!(
            command = %self.command,
            exit_code,
            failures = discrepancies.len(),
            "validation command failed"
        );
        Ok(ValidationReport {
            passed: false,
            discrepancies,
        })
    }
}
