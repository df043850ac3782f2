//! Phase Controller（EDRR 状态机）
//!
//! 一个 WorkUnit 一次只处于一个阶段；`step` 执行当前阶段并提交恰好一条转移：
//!
//! ```text
//! Expand ──候选产出──▶ Differentiate ──有差异──▶ Refine ──校验通过──▶ Retrospect ──▶ Complete
//!                         │   ▲  无差异 ─────────────────────────────────▲
//!                         │   └──── 校验失败 / 评审未解决（iteration < max）
//!                         └── 超过 max_iterations ──▶ Blocked
//! ```
//!
//! 任务级错误在这里被 RecoveryEngine 转为转移决策，只有持久化失败与不变量破坏返回 Err。
//! 阶段准备前进时还要过质量门槛（见 [`crate::workflow::quality`]），不达标同样走有界回退。
//! 运行被停止时 `step` 返回 `Interrupted` 且不提交，WorkUnit 停在上一次提交的状态。
//! 共享组件（注册表、预算、存储、分派器）由 RunContext 显式传入，不使用全局状态。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRegistry, Capability, RegistryError, RoleAssignment, TaskInput};
use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine, TaskError, UnitSignal};
use crate::llm::{call_with_retry, RetryFailure, RetryPolicy};
use crate::memory::{ContextAssembler, KnowledgeBase, TokenBudgetManager};
use crate::review::{DialecticalReviewer, ReviewRecord, ReviewRequest};
use crate::store::StateStore;
use crate::workflow::dispatch::{TaskDispatcher, TaskRun};
use crate::workflow::phase::{Phase, PhaseStep};
use crate::workflow::quality::{QualitySignals, QualityThresholds};
use crate::workflow::types::*;
use crate::workflow::validation::{ArtifactSet, ValidationReport, Validator};

/// 单次运行共享的组件，显式传给控制器的每次调用
#[derive(Clone)]
pub struct RunContext {
    pub registry: Arc<AgentRegistry>,
    pub budget: Arc<TokenBudgetManager>,
    pub store: Arc<dyn StateStore>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub reviewer: Arc<DialecticalReviewer>,
    pub validator: Arc<dyn Validator>,
    pub validation_retry: RetryPolicy,
}

/// 各阶段上下文预算（token）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextAllocation {
    pub expand: u64,
    pub differentiate: u64,
    pub refine: u64,
    pub retrospect: u64,
}

impl ContextAllocation {
    pub fn for_phase(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Expand => self.expand,
            Phase::Differentiate => self.differentiate,
            Phase::Refine => self.refine,
            Phase::Retrospect => self.retrospect,
        }
    }
}

impl Default for ContextAllocation {
    fn default() -> Self {
        Self {
            expand: 2000,
            differentiate: 3000,
            refine: 4000,
            retrospect: 1500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Refine↔Differentiate 回退上限
    pub max_iterations: u32,
    /// 单次任务的最大补全长度
    pub max_tokens: u32,
    pub context: ContextAllocation,
    pub quality: QualityThresholds,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_tokens: 1024,
            context: ContextAllocation::default(),
            quality: QualityThresholds::default(),
        }
    }
}

/// 阶段结束时的转移决策
#[derive(Debug, Clone, PartialEq)]
struct Decision {
    target: TransitionTarget,
    trigger: TransitionTrigger,
    escalation: Option<EscalationReason>,
}

impl Decision {
    fn go(phase: Phase, trigger: TransitionTrigger) -> Self {
        Self {
            target: TransitionTarget::Phase(phase),
            trigger,
            escalation: None,
        }
    }

    fn complete() -> Self {
        Self {
            target: TransitionTarget::Complete,
            trigger: TransitionTrigger::RetrospectFinished,
            escalation: None,
        }
    }

    fn block(reason: EscalationReason, trigger: TransitionTrigger) -> Self {
        Self {
            target: TransitionTarget::Blocked,
            trigger,
            escalation: Some(reason),
        }
    }

    fn abandon(reason: EscalationReason, trigger: TransitionTrigger) -> Self {
        Self {
            target: TransitionTarget::Abandoned,
            trigger,
            escalation: Some(reason),
        }
    }
}

/// 阶段内的任务计数与用量
#[derive(Debug, Default)]
struct PhaseTally {
    tasks: u32,
    failed: u32,
    prompt_tokens: u64,
    completion_tokens: u64,
    /// 进入阶段时的未解决差异数
    discrepancies_before: usize,
    quality: Option<f64>,
}

impl PhaseTally {
    fn count(&mut self, run: &TaskRun) {
        let (prompt, completion) = run.tokens();
        self.tasks += 1;
        if run.error.is_some() {
            self.failed += 1;
        }
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
    }
}

/// 失败回退时重新进入的阶段
fn loop_back_target(phase: Phase) -> Phase {
    match phase {
        Phase::Refine => Phase::Differentiate,
        other => other,
    }
}

fn prompt_for(kind: TaskKind, unit: &WorkUnit) -> String {
    let instruction = match kind {
        TaskKind::DraftSpecification => {
            "Expand the requirement above into a specification with behaviours and acceptance criteria."
        }
        TaskKind::DraftTests => "Write test cases that would verify the requirement above.",
        TaskKind::Analyze => {
            "Compare the current artifacts against the requirement and list every measurable discrepancy."
        }
        TaskKind::Implement => "Produce code that resolves the open discrepancies listed in the context.",
        TaskKind::Retrospect => "Summarize this cycle and what should change in the next one.",
        TaskKind::Critique | TaskKind::Revise => "Review the artifacts in the context.",
    };
    format!("{}\n\n{}", unit.description, instruction)
}

pub struct PhaseController {
    config: ControllerConfig,
    assembler: ContextAssembler,
    knowledge: KnowledgeBase,
    recovery: RecoveryEngine,
}

impl PhaseController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            assembler: ContextAssembler::new(),
            knowledge: KnowledgeBase::new(),
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// 新建 WorkUnit 并提交初始转移（→ Expand）
    pub async fn create(&self, ctx: &RunContext, description: &str) -> Result<WorkUnit, OrchestratorError> {
        let mut unit = WorkUnit::new(description);
        let record = unit.record_transition(
            TransitionTarget::Phase(Phase::Expand),
            TransitionTrigger::Created,
            PhaseMetrics::default(),
        );
        ctx.store
            .save_transition(&unit, &record)
            .await
            .map_err(OrchestratorError::PersistenceWriteFailure)?;
        tracing::info!(unit = %unit.id, "work unit created");
        Ok(unit)
    }

    /// 持续推进直到离开 Active
    pub async fn drive(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        signal: &UnitSignal,
    ) -> Result<(), OrchestratorError> {
        while unit.status == UnitStatus::Active {
            self.step(ctx, unit, signal).await?;
        }
        Ok(())
    }

    /// 执行当前阶段并提交一条转移
    ///
    /// 运行已停止时返回 `Interrupted`，不提交任何转移；阶段中途产生的工件和任务只留在内存里。
    pub async fn step(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        signal: &UnitSignal,
    ) -> Result<TransitionRecord, OrchestratorError> {
        if unit.status != UnitStatus::Active {
            return Err(OrchestratorError::InvalidState {
                unit: unit.id.clone(),
                status: unit.status,
                expected: "active",
            });
        }

        if signal.is_stopped() {
            return Err(OrchestratorError::Interrupted(unit.id.clone()));
        }
        let cancel = signal.token();

        let started = Instant::now();
        let mut tally = PhaseTally {
            discrepancies_before: unit.open_discrepancies.len(),
            ..PhaseTally::default()
        };
        let decision = if cancel.is_cancelled() {
            Decision::abandon(EscalationReason::Cancelled, TransitionTrigger::Cancelled)
        } else {
            match ctx.registry.rotate_primus(unit).await {
                Ok(assignment) => {
                    unit.last_primus = Some(assignment.primus.clone());
                    unit.role_assignment = Some(assignment.clone());
                    unit.step = PhaseStep::Assigned;
                    let result = self.run_phase(ctx, unit, &assignment, &mut tally, cancel).await;
                    ctx.registry.release(&unit.id).await;
                    if signal.is_stopped() {
                        tracing::info!(unit = %unit.id, phase = %unit.phase, "run stopped; phase left uncommitted");
                        return Err(OrchestratorError::Interrupted(unit.id.clone()));
                    }
                    result?
                }
                Err(RegistryError::NoEligibleAgent { capability, .. }) => {
                    tracing::error!(unit = %unit.id, phase = %unit.phase, %capability, "no eligible agent; abandoning");
                    Decision::abandon(
                        EscalationReason::NoEligibleAgent { capability },
                        TransitionTrigger::NoEligibleAgent { capability },
                    )
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.commit(ctx, unit, decision, tally, started).await
    }

    /// 人工放弃（不在途的 WorkUnit）
    pub async fn abandon(&self, ctx: &RunContext, unit: &mut WorkUnit) -> Result<TransitionRecord, OrchestratorError> {
        if unit.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                unit: unit.id.clone(),
                status: unit.status,
                expected: "active or blocked",
            });
        }
        let decision = Decision::abandon(
            EscalationReason::OperatorAbandoned,
            TransitionTrigger::OperatorAbandoned,
        );
        self.commit(ctx, unit, decision, PhaseTally::default(), Instant::now())
            .await
    }

    /// 人工决策：Blocked 的 WorkUnit 带着指导意见开始新一轮 EDRR
    pub async fn reopen(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        guidance: Option<String>,
    ) -> Result<TransitionRecord, OrchestratorError> {
        if unit.status != UnitStatus::Blocked {
            return Err(OrchestratorError::InvalidState {
                unit: unit.id.clone(),
                status: unit.status,
                expected: "blocked",
            });
        }
        if let Some(g) = guidance.filter(|g| !g.trim().is_empty()) {
            unit.guidance.push(g);
        }
        unit.cycle += 1;
        unit.iteration = 0;
        let decision = Decision::go(Phase::Expand, TransitionTrigger::Reopened);
        self.commit(ctx, unit, decision, PhaseTally::default(), Instant::now())
            .await
    }

    async fn commit(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        decision: Decision,
        tally: PhaseTally,
        started: Instant,
    ) -> Result<TransitionRecord, OrchestratorError> {
        let ledger = ctx.budget.ledger(&unit.id).await;
        unit.usage = UsageTotals {
            prompt_tokens: ledger.prompt_tokens,
            completion_tokens: ledger.completion_tokens,
        };
        // 人工追加的上限随快照持久化
        unit.token_ceiling = (ledger.ceiling != ctx.budget.unit_ceiling()).then_some(ledger.ceiling);

        let metrics = PhaseMetrics {
            duration_ms: started.elapsed().as_millis() as u64,
            tasks: tally.tasks,
            prompt_tokens: tally.prompt_tokens,
            completion_tokens: tally.completion_tokens,
            discrepancies: unit.open_discrepancies.len() as u32,
            quality: tally.quality,
        };
        // 角色分配只在阶段执行期间存在
        unit.role_assignment = None;
        unit.escalation = decision.escalation.map(|reason| Escalation {
            reason,
            discrepancies: unit.open_discrepancies.clone(),
            critiques: unit
                .reviews
                .last()
                .map(ReviewRecord::unresolved_blocking)
                .unwrap_or_default(),
            raised_at: Utc::now(),
        });

        let from = unit.phase;
        let record = unit.record_transition(decision.target, decision.trigger, metrics);
        ctx.store
            .save_transition(unit, &record)
            .await
            .map_err(OrchestratorError::PersistenceWriteFailure)?;

        tracing::info!(
            unit = %unit.id,
            from = %from,
            to = ?record.to,
            trigger = ?record.trigger,
            iteration = unit.iteration,
            cycle = unit.cycle,
            tasks = record.metrics.tasks,
            quality = ?record.metrics.quality,
            "transition committed"
        );
        Ok(record)
    }

    async fn run_phase(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        assignment: &RoleAssignment,
        tally: &mut PhaseTally,
        cancel: &CancellationToken,
    ) -> Result<Decision, OrchestratorError> {
        let history = ctx.store.list_history(&unit.id).await?;
        let query = format!("{} {}", unit.phase, unit.description);
        let candidates = self.knowledge.candidates(unit, &history, &query);
        let bundle = self
            .assembler
            .assemble(self.config.context.for_phase(unit.phase), candidates);
        tracing::debug!(
            unit = %unit.id,
            phase = %unit.phase,
            fragments = bundle.fragments.len(),
            excluded = bundle.excluded,
            cost = bundle.total_cost,
            "context assembled"
        );
        let system_context = bundle.render();

        match unit.phase {
            Phase::Expand => self.expand(ctx, unit, assignment, &system_context, tally, cancel).await,
            Phase::Differentiate => {
                self.differentiate(ctx, unit, assignment, &system_context, tally, cancel)
                    .await
            }
            Phase::Refine => self.refine(ctx, unit, assignment, &system_context, tally, cancel).await,
            Phase::Retrospect => {
                self.retrospect(ctx, unit, assignment, &system_context, tally, cancel)
                    .await
            }
        }
    }

    fn task_input(&self, kind: TaskKind, unit: &WorkUnit, system_context: &str) -> TaskInput {
        TaskInput {
            system_context: system_context.to_string(),
            prompt: prompt_for(kind, unit),
            max_tokens: self.config.max_tokens,
        }
    }

    fn primary_task(&self, unit: &WorkUnit, agent: &str) -> Task {
        let inputs = unit.artifacts.iter().rev().take(4).map(|a| a.id.clone()).collect();
        Task::new(&unit.id, unit.phase, TaskKind::primary_for(unit.phase), agent).with_inputs(inputs)
    }

    /// 记录任务与用量；成功时生成工件
    fn absorb(&self, unit: &mut WorkUnit, tally: &mut PhaseTally, mut run: TaskRun) -> Result<Artifact, TaskError> {
        tally.count(&run);

        let result = match (run.output.take(), run.error.take()) {
            (Some(output), None) => {
                let kind = run.task.kind.artifact_kind().unwrap_or(ArtifactKind::Analysis);
                let artifact = Artifact::new(kind, output.content, &run.task.agent_id, run.task.phase);
                run.task.output = Some(artifact.id.clone());
                unit.artifacts.push(artifact.clone());
                Ok(artifact)
            }
            (_, Some(e)) => Err(e),
            (None, None) => Err(TaskError::Invariant(format!(
                "task {} finished without output or error",
                run.task.id
            ))),
        };
        unit.tasks.push(run.task);
        result
    }

    async fn run_primary(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        assignment: &RoleAssignment,
        system_context: &str,
        tally: &mut PhaseTally,
        cancel: &CancellationToken,
    ) -> Result<Artifact, TaskError> {
        let task = self.primary_task(unit, &assignment.primus);
        let input = self.task_input(task.kind, unit, system_context);
        let run = ctx.dispatcher.dispatch(task, input, cancel).await;
        let artifact = self.absorb(unit, tally, run)?;
        unit.step = PhaseStep::Drafted;
        Ok(artifact)
    }

    /// 任务失败 → 转移决策
    fn on_task_error(&self, unit: &mut WorkUnit, err: &TaskError) -> Result<Decision, OrchestratorError> {
        tracing::warn!(unit = %unit.id, phase = %unit.phase, error = %err, "task failed");
        match self.recovery.handle(err, unit.phase) {
            RecoveryAction::LoopBack => {
                let id = format!("task-failed:{}", unit.phase);
                unit.open_discrepancies.retain(|d| d.id != id);
                unit.open_discrepancies.push(Discrepancy::new(id, err.to_string()));
                let to = loop_back_target(unit.phase);
                Ok(self.loop_back(unit, to, TransitionTrigger::TaskFailed { reason: err.to_string() }))
            }
            RecoveryAction::Block(reason) => {
                let trigger = match reason {
                    EscalationReason::BudgetExhausted => TransitionTrigger::BudgetExhausted,
                    _ => TransitionTrigger::TaskFailed {
                        reason: err.to_string(),
                    },
                };
                Ok(Decision::block(reason, trigger))
            }
            RecoveryAction::Abandon(reason) => Ok(Decision::abandon(reason, TransitionTrigger::Cancelled)),
            RecoveryAction::Fatal => Err(OrchestratorError::InvariantViolation(err.to_string())),
        }
    }

    /// 有界回退：未达上限时计数 +1 并重新进入，否则 Blocked
    fn loop_back(&self, unit: &mut WorkUnit, to: Phase, trigger: TransitionTrigger) -> Decision {
        let max = self.config.max_iterations;
        if unit.iteration < max {
            unit.iteration += 1;
            tracing::info!(unit = %unit.id, to = %to, iteration = unit.iteration, max, "looping back");
            Decision::go(to, trigger)
        } else {
            tracing::warn!(unit = %unit.id, max, "iteration limit reached; blocking for human decision");
            Decision::block(
                EscalationReason::IterationLimit { max },
                TransitionTrigger::IterationLimitReached { max },
            )
        }
    }

    /// 质量门槛：评分写入 tally；低于阶段门槛时把前进决策改为有界回退
    fn gate(
        &self,
        unit: &mut WorkUnit,
        tally: &mut PhaseTally,
        signals: QualitySignals<'_>,
        decision: Decision,
    ) -> Decision {
        let signals = QualitySignals {
            tasks: tally.tasks,
            failed_tasks: tally.failed,
            discrepancies_before: tally.discrepancies_before,
            discrepancies_after: unit.open_discrepancies.len(),
            ..signals
        };
        let score = signals.score();
        tally.quality = Some(score);
        let Some(threshold) = self.config.quality.for_phase(unit.phase) else {
            return decision;
        };
        if score >= threshold {
            return decision;
        }

        tracing::warn!(unit = %unit.id, phase = %unit.phase, score, threshold, "phase quality below threshold");
        let id = format!("quality:{}", unit.phase);
        let mut discrepancy = Discrepancy::new(
            id.clone(),
            format!("{} quality {score:.3} is below threshold {threshold:.3}", unit.phase),
        );
        if let Some(last) = unit.artifacts.last() {
            discrepancy = discrepancy.with_artifact(last.id.clone());
        }
        unit.open_discrepancies.retain(|d| d.id != id);
        unit.open_discrepancies.push(discrepancy);
        let to = loop_back_target(unit.phase);
        self.loop_back(unit, to, TransitionTrigger::QualityBelowThreshold { score, threshold })
    }

    async fn review(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        assignment: &RoleAssignment,
        thesis: Artifact,
        system_context: &str,
        tally: &mut PhaseTally,
        cancel: &CancellationToken,
    ) -> Result<ReviewRecord, TaskError> {
        let unit_id = unit.id.clone();
        let requirement = unit.description.clone();
        let req = ReviewRequest {
            work_unit_id: &unit_id,
            phase: unit.phase,
            requirement: &requirement,
            system_context: system_context.to_string(),
            cancel,
        };
        let outcome = ctx
            .reviewer
            .review(req, thesis, &assignment.primus, &assignment.workers)
            .await?;

        for run in outcome.runs {
            tally.count(&run);
            unit.tasks.push(run.task);
        }
        unit.artifacts.extend(outcome.revisions);
        unit.step = if outcome.record.revisions > 0 && unit.phase.steps().contains(&PhaseStep::Revised) {
            PhaseStep::Revised
        } else {
            PhaseStep::Reviewed
        };
        unit.reviews.push(outcome.record.clone());
        Ok(outcome.record)
    }

    /// 带重试的外部校验；失败时给出回退 / 放弃决策
    async fn validate(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        cancel: &CancellationToken,
    ) -> Result<Vec<Discrepancy>, Decision> {
        let unit_id = unit.id.clone();
        let artifacts = unit.artifacts.clone();
        let subject = ArtifactSet::new(&unit_id, &artifacts).subject().map(|a| a.id.clone());
        let validator = ctx.validator.clone();
        let result = call_with_retry(&ctx.validation_retry, cancel, "validation", |_| {
            let validator = validator.clone();
            let unit_id = unit_id.clone();
            let artifacts = artifacts.clone();
            async move { validator.run(ArtifactSet::new(&unit_id, &artifacts)).await }
        })
        .await;
        unit.step = PhaseStep::Validated;

        match result {
            Ok(outcome) => {
                let ValidationReport {
                    passed,
                    mut discrepancies,
                } = outcome.value;
                if !passed && discrepancies.is_empty() {
                    let mut d = Discrepancy::new("validation", "validation failed without reporting discrepancies");
                    if let Some(id) = &subject {
                        d = d.with_artifact(id.clone());
                    }
                    discrepancies.push(d);
                }
                Ok(discrepancies)
            }
            Err(RetryFailure::Cancelled { .. }) => Err(Decision::abandon(
                EscalationReason::Cancelled,
                TransitionTrigger::Cancelled,
            )),
            Err(RetryFailure::Exhausted { last: e, .. }) | Err(RetryFailure::Fatal { error: e, .. }) => {
                let reason = format!("validation: {e}");
                let id = "validation-failed".to_string();
                unit.open_discrepancies.retain(|d| d.id != id);
                let mut d = Discrepancy::new(id, reason.clone());
                if let Some(subject) = subject {
                    d = d.with_artifact(subject);
                }
                unit.open_discrepancies.push(d);
                let to = loop_back_target(unit.phase);
                Err(self.loop_back(unit, to, TransitionTrigger::TaskFailed { reason }))
            }
        }
    }

    async fn expand(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        assignment: &RoleAssignment,
        system_context: &str,
        tally: &mut PhaseTally,
        cancel: &CancellationToken,
    ) -> Result<Decision, OrchestratorError> {
        let primary = self.primary_task(unit, &assignment.primus);
        let mut jobs = vec![(primary.clone(), self.task_input(primary.kind, unit, system_context))];
        for worker in &assignment.workers {
            let drafts_tests = ctx
                .registry
                .get(worker)
                .await
                .is_some_and(|a| a.has_capability(Capability::Testing));
            if drafts_tests {
                let task = Task::new(&unit.id, unit.phase, TaskKind::DraftTests, worker);
                jobs.push((task, self.task_input(TaskKind::DraftTests, unit, system_context)));
            }
        }

        let runs = ctx.dispatcher.dispatch_all(jobs, cancel).await;
        let mut primary_result = None;
        let mut produced = 0;
        for run in runs {
            let is_primary = run.task.id == primary.id;
            match self.absorb(unit, tally, run) {
                Ok(_) => produced += 1,
                Err(TaskError::Invariant(msg)) => return Err(OrchestratorError::InvariantViolation(msg)),
                Err(TaskError::Cancelled) if !is_primary => {
                    return self.on_task_error(unit, &TaskError::Cancelled);
                }
                Err(e) if is_primary => primary_result = Some(e),
                Err(e) => {
                    tracing::warn!(unit = %unit.id, error = %e, "test drafting failed; continuing with specification only")
                }
            }
        }
        if let Some(e) = primary_result {
            return self.on_task_error(unit, &e);
        }
        unit.step = PhaseStep::Drafted;
        let decision = Decision::go(
            Phase::Differentiate,
            TransitionTrigger::CandidateProduced { artifacts: produced },
        );
        Ok(self.gate(unit, tally, QualitySignals::default(), decision))
    }

    async fn differentiate(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        assignment: &RoleAssignment,
        system_context: &str,
        tally: &mut PhaseTally,
        cancel: &CancellationToken,
    ) -> Result<Decision, OrchestratorError> {
        let analysis = match self.run_primary(ctx, unit, assignment, system_context, tally, cancel).await {
            Ok(a) => a,
            Err(e) => return self.on_task_error(unit, &e),
        };
        let record = match self
            .review(ctx, unit, assignment, analysis, system_context, tally, cancel)
            .await
        {
            Ok(r) => r,
            Err(e) => return self.on_task_error(unit, &e),
        };
        if !record.is_resolved() {
            let blocking = record.unresolved_blocking().len();
            return Ok(self.loop_back(unit, Phase::Differentiate, TransitionTrigger::ReviewUnresolved { blocking }));
        }

        let discrepancies = match self.validate(ctx, unit, cancel).await {
            Ok(d) => d,
            Err(decision) => return Ok(decision),
        };
        let count = discrepancies.len();
        unit.open_discrepancies = discrepancies;
        let decision = if count == 0 {
            Decision::go(Phase::Retrospect, TransitionTrigger::NoDiscrepancies)
        } else {
            Decision::go(Phase::Refine, TransitionTrigger::DiscrepanciesFound { count })
        };
        let signals = QualitySignals {
            review: Some(&record),
            critics: assignment.workers.len(),
            ..QualitySignals::default()
        };
        Ok(self.gate(unit, tally, signals, decision))
    }

    async fn refine(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        assignment: &RoleAssignment,
        system_context: &str,
        tally: &mut PhaseTally,
        cancel: &CancellationToken,
    ) -> Result<Decision, OrchestratorError> {
        let code = match self.run_primary(ctx, unit, assignment, system_context, tally, cancel).await {
            Ok(a) => a,
            Err(e) => return self.on_task_error(unit, &e),
        };
        let record = match self
            .review(ctx, unit, assignment, code, system_context, tally, cancel)
            .await
        {
            Ok(r) => r,
            Err(e) => return self.on_task_error(unit, &e),
        };
        if !record.is_resolved() {
            let blocking = record.unresolved_blocking().len();
            return Ok(self.loop_back(unit, Phase::Differentiate, TransitionTrigger::ReviewUnresolved { blocking }));
        }

        let discrepancies = match self.validate(ctx, unit, cancel).await {
            Ok(d) => d,
            Err(decision) => return Ok(decision),
        };
        let count = discrepancies.len();
        unit.open_discrepancies = discrepancies;
        if count == 0 {
            let signals = QualitySignals {
                review: Some(&record),
                critics: assignment.workers.len(),
                ..QualitySignals::default()
            };
            let decision = Decision::go(Phase::Retrospect, TransitionTrigger::ValidationPassed);
            Ok(self.gate(unit, tally, signals, decision))
        } else {
            Ok(self.loop_back(unit, Phase::Differentiate, TransitionTrigger::ValidationFailed { count }))
        }
    }

    async fn retrospect(
        &self,
        ctx: &RunContext,
        unit: &mut WorkUnit,
        assignment: &RoleAssignment,
        system_context: &str,
        tally: &mut PhaseTally,
        cancel: &CancellationToken,
    ) -> Result<Decision, OrchestratorError> {
        match self.run_primary(ctx, unit, assignment, system_context, tally, cancel).await {
            // Retrospect 只记录评分
            Ok(_) => Ok(self.gate(unit, tally, QualitySignals::default(), Decision::complete())),
            Err(e) => self.on_task_error(unit, &e),
        }
    }
}
