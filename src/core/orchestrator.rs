//! 编排器：对外入口
//!
//! 负责创建 WorkUnit、按需推进单个阶段、并发驱动多个 WorkUnit（每个一个 tokio 任务 + 一组信号）、
//! 启动时恢复、状态与 Token 报告，以及人工操作（abandon / reopen / 追加预算）。
//!
//! 持久化失败或 Ctrl+C 会停止整个运行：其余在途 WorkUnit 被中断但不记录 Abandoned，
//! 保持 Active 停在最后一次提交处，下次 `resume` 接着跑。只有人工 abandon 才写入 Abandoned。

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::core::{OrchestratorError, RunSupervisor, TokenReport, UnitReport, UnitSummary, UnitTokens};
use crate::memory::TokenLedger;
use crate::workflow::{PhaseController, RunContext, TransitionRecord, UnitStatus, WorkUnit, WorkUnitId};

/// abandon 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum AbandonOutcome {
    /// WorkUnit 正在被驱动：已发出放弃信号，驱动任务会记录 Abandoned
    Signalled,
    /// 直接写入了 Abandoned 转移
    Recorded(WorkUnit),
}

pub struct Orchestrator {
    ctx: RunContext,
    controller: Arc<PhaseController>,
    supervisor: Arc<RunSupervisor>,
    unit_slots: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, controller: PhaseController, max_concurrent_units: usize) -> Self {
        Self {
            ctx,
            controller: Arc::new(controller),
            supervisor: Arc::new(RunSupervisor::new()),
            unit_slots: Arc::new(Semaphore::new(max_concurrent_units.max(1))),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn supervisor(&self) -> &Arc<RunSupervisor> {
        &self.supervisor
    }

    /// 停止整个运行（Ctrl+C）；在途 WorkUnit 停在最后一次提交处
    pub fn shutdown(&self) {
        tracing::info!("stopping run; in-flight work units keep their last committed phase");
        self.supervisor.stop_run();
    }

    pub async fn create_work_unit(&self, description: &str) -> Result<WorkUnit, OrchestratorError> {
        self.controller.create(&self.ctx, description).await
    }

    /// 恢复本进程里的账本与 Primus 轮换记忆
    async fn prepare(&self, unit: &WorkUnit) {
        if !self.ctx.budget.tracks(&unit.id).await {
            self.ctx
                .budget
                .restore(&unit.id, unit.usage, unit.token_ceiling)
                .await;
        }
        if let Some(primus) = &unit.last_primus {
            self.ctx.registry.restore(&unit.id, primus).await;
        }
    }

    async fn load(&self, id: &str) -> Result<WorkUnit, OrchestratorError> {
        let unit = self.ctx.store.load_work_unit(id).await?;
        self.prepare(&unit).await;
        Ok(unit)
    }

    /// 只推进一个阶段（提交一条转移）
    pub async fn advance(&self, id: &str) -> Result<(WorkUnit, TransitionRecord), OrchestratorError> {
        let mut unit = self.load(id).await?;
        let signal = self.supervisor.unit_signal(id).await;
        let result = self.controller.step(&self.ctx, &mut unit, &signal).await;
        self.supervisor.finish_unit(id).await;
        let record = result?;
        Ok((unit, record))
    }

    /// 驱动一个 WorkUnit 直到离开 Active
    pub async fn run(&self, id: &str) -> Result<WorkUnit, OrchestratorError> {
        let mut units = self.run_units(vec![id.to_string()]).await?;
        units
            .pop()
            .ok_or_else(|| OrchestratorError::InvariantViolation(format!("run of {id} returned nothing")))
    }

    /// 并发驱动多个 WorkUnit；每个 WorkUnit 的阶段顺序执行
    pub async fn run_units(&self, ids: Vec<WorkUnitId>) -> Result<Vec<WorkUnit>, OrchestratorError> {
        let mut units = Vec::with_capacity(ids.len());
        for id in &ids {
            units.push(self.load(id).await?);
        }

        let mut handles = Vec::with_capacity(units.len());
        for mut unit in units {
            let signal = self.supervisor.unit_signal(&unit.id).await;
            let ctx = self.ctx.clone();
            let controller = self.controller.clone();
            let supervisor = self.supervisor.clone();
            let slots = self.unit_slots.clone();

            handles.push(tokio::spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                tracing::info!(unit = %unit.id, phase = %unit.phase, "driving work unit");
                let result = controller.drive(&ctx, &mut unit, &signal).await;
                supervisor.finish_unit(&unit.id).await;
                match result {
                    Ok(()) => Ok(unit),
                    // 中断：丢弃未提交的阶段，交回持久化的快照
                    Err(OrchestratorError::Interrupted(id)) => {
                        tracing::info!(unit = %id, "work unit interrupted; left at last commit");
                        ctx.store.load_work_unit(&id).await.map_err(OrchestratorError::from)
                    }
                    Err(e) => Err(e),
                }
            }));
        }

        let mut finished = Vec::with_capacity(handles.len());
        let mut failure = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(unit)) => {
                    tracing::info!(unit = %unit.id, status = unit.status.as_str(), "work unit settled");
                    finished.push(unit);
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "work unit driver failed; stopping run");
                    self.supervisor.stop_run();
                    failure.get_or_insert(e);
                }
                Err(join) => {
                    self.supervisor.stop_run();
                    failure.get_or_insert(OrchestratorError::InvariantViolation(format!(
                        "work unit task panicked: {join}"
                    )));
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(finished),
        }
    }

    /// 启动时恢复：驱动所有 Active 的 WorkUnit
    pub async fn resume_all(&self) -> Result<Vec<WorkUnit>, OrchestratorError> {
        let active: Vec<WorkUnitId> = self
            .ctx
            .store
            .list_work_units()
            .await?
            .into_iter()
            .filter(|u| u.status == UnitStatus::Active)
            .map(|u| u.id)
            .collect();
        tracing::info!(units = active.len(), "resuming active work units");
        self.run_units(active).await
    }

    pub async fn status(&self, id: &str) -> Result<UnitReport, OrchestratorError> {
        let unit = self.load(id).await?;
        let history = self.ctx.store.list_history(id).await?;
        let ledger = self.ctx.budget.ledger(id).await;
        Ok(UnitReport::new(&unit, history, ledger))
    }

    pub async fn list(&self) -> Result<Vec<UnitSummary>, OrchestratorError> {
        let units = self.ctx.store.list_work_units().await?;
        Ok(units.iter().map(UnitSummary::from).collect())
    }

    pub async fn token_report(&self) -> Result<TokenReport, OrchestratorError> {
        let units = self.ctx.store.list_work_units().await?;
        let mut report = Vec::with_capacity(units.len());
        for unit in &units {
            self.prepare(unit).await;
            report.push(UnitTokens {
                id: unit.id.clone(),
                status: unit.status,
                ledger: self.ctx.budget.ledger(&unit.id).await,
            });
        }
        Ok(TokenReport {
            run: self.ctx.budget.run_ledger().await,
            units: report,
        })
    }

    /// 人工放弃：在途则发出放弃信号，否则直接记录转移
    pub async fn abandon(&self, id: &str) -> Result<AbandonOutcome, OrchestratorError> {
        if self.supervisor.cancel_unit(id).await {
            tracing::info!(unit = %id, "cancellation signalled to in-flight work unit");
            return Ok(AbandonOutcome::Signalled);
        }
        let mut unit = self.load(id).await?;
        self.controller.abandon(&self.ctx, &mut unit).await?;
        Ok(AbandonOutcome::Recorded(unit))
    }

    /// 人工决策：Blocked → 新一轮 Expand，可附带指导、追加预算或清零用量
    pub async fn reopen(
        &self,
        id: &str,
        guidance: Option<String>,
        extra_budget: Option<u64>,
        reset_usage: bool,
    ) -> Result<WorkUnit, OrchestratorError> {
        let mut unit = self.load(id).await?;
        if unit.status != UnitStatus::Blocked {
            return Err(OrchestratorError::InvalidState {
                unit: unit.id.clone(),
                status: unit.status,
                expected: "blocked",
            });
        }
        if let Some(extra) = extra_budget {
            self.ctx.budget.replenish_unit(id, extra).await;
        }
        if reset_usage {
            self.ctx.budget.reset_unit(id).await;
        }
        self.controller.reopen(&self.ctx, &mut unit, guidance).await?;
        Ok(unit)
    }

    /// 追加单元预算；新上限在下一次转移时持久化
    pub async fn replenish_unit(&self, id: &str, extra: u64) -> Result<TokenLedger, OrchestratorError> {
        let unit = self.load(id).await?;
        Ok(self.ctx.budget.replenish_unit(&unit.id, extra).await)
    }

    pub async fn replenish_run(&self, extra: u64) -> TokenLedger {
        self.ctx.budget.replenish_run(extra).await
    }
}
