//! Token 预算管理
//!
//! 每次网关调用前先按估算值 `reserve`（悲观检查），调用后按实际用量 `commit`。
//! 预留额度同时占用 WorkUnit 与全局（本次运行）两本账，直到提交或释放，
//! 多个 WorkUnit 并发预留时不会共同超出全局上限。
//!
//! 实际用量可以超过预留额度，超出部分照常记账，剩余额度可为负；
//! 此后任何 `reserve` 都会被拒绝，直到人工追加预算。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::workflow::{UsageTotals, WorkUnitId};

/// Token 估算器（字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token，至少 1
    pub fn estimate(text: &str) -> usize {
        let (ascii, non_ascii) = text.chars().fold((0usize, 0usize), |(a, n), c| {
            if c.is_ascii() {
                (a + 1, n)
            } else {
                (a, n + 1)
            }
        });
        let tokens = ascii / 4 + (non_ascii as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }
}

/// 账本：累计用量与上限
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLedger {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub ceiling: u64,
    /// 已预留但尚未提交的额度
    pub reserved: u64,
}

impl TokenLedger {
    pub fn with_ceiling(ceiling: u64) -> Self {
        Self {
            ceiling,
            ..Self::default()
        }
    }

    pub fn used(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// 上限减去已用量；超支时为负
    pub fn remaining(&self) -> i64 {
        self.ceiling as i64 - self.used() as i64
    }

    /// 可供新预留的额度
    pub fn available(&self) -> i64 {
        self.remaining() - self.reserved as i64
    }

    fn check(&self, estimate: u64) -> bool {
        self.remaining() > 0 && estimate as i64 <= self.available()
    }
}

/// 拒绝来自哪本账
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    WorkUnit,
    Run,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetScope::WorkUnit => f.write_str("work_unit"),
            BudgetScope::Run => f.write_str("run"),
        }
    }
}

/// 预留凭据：必须恰好被 commit 或 release 一次
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    id: String,
    work_unit_id: WorkUnitId,
    amount: u64,
}

impl Reservation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn work_unit_id(&self) -> &str {
        &self.work_unit_id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReserveDecision {
    Allow(Reservation),
    Deny {
        scope: BudgetScope,
        requested: u64,
        remaining: i64,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("Unknown or already settled reservation: {0}")]
    UnknownReservation(String),
}

#[derive(Debug, Default)]
struct BudgetState {
    run: TokenLedger,
    units: HashMap<WorkUnitId, TokenLedger>,
    outstanding: HashMap<String, (WorkUnitId, u64)>,
}

/// Token 预算管理器：单次运行构造一次，以 Arc 共享
#[derive(Debug)]
pub struct TokenBudgetManager {
    state: Mutex<BudgetState>,
    unit_ceiling: u64,
}

impl TokenBudgetManager {
    pub fn new(run_ceiling: u64, unit_ceiling: u64) -> Self {
        Self {
            state: Mutex::new(BudgetState {
                run: TokenLedger::with_ceiling(run_ceiling),
                ..BudgetState::default()
            }),
            unit_ceiling,
        }
    }

    /// 默认单元上限
    pub fn unit_ceiling(&self) -> u64 {
        self.unit_ceiling
    }

    /// 悲观检查：估算值超过单元或全局可用额度时拒绝
    pub async fn reserve(&self, unit_id: &str, estimate: u64) -> ReserveDecision {
        let mut state = self.state.lock().await;
        let default_ceiling = self.unit_ceiling;
        let unit = *state
            .units
            .entry(unit_id.to_string())
            .or_insert_with(|| TokenLedger::with_ceiling(default_ceiling));

        if !unit.check(estimate) {
            tracing::warn!(unit = %unit_id, requested = estimate, remaining = unit.available(), "reservation denied by unit budget");
            return ReserveDecision::Deny {
                scope: BudgetScope::WorkUnit,
                requested: estimate,
                remaining: unit.available(),
            };
        }
        if !state.run.check(estimate) {
            tracing::warn!(unit = %unit_id, requested = estimate, remaining = state.run.available(), "reservation denied by run budget");
            return ReserveDecision::Deny {
                scope: BudgetScope::Run,
                requested: estimate,
                remaining: state.run.available(),
            };
        }

        state.run.reserved += estimate;
        if let Some(ledger) = state.units.get_mut(unit_id) {
            ledger.reserved += estimate;
        }
        let id = format!("res_{}", uuid::Uuid::new_v4());
        state
            .outstanding
            .insert(id.clone(), (unit_id.to_string(), estimate));
        tracing::debug!(unit = %unit_id, tokens = estimate, "tokens reserved");

        ReserveDecision::Allow(Reservation {
            id,
            work_unit_id: unit_id.to_string(),
            amount: estimate,
        })
    }

    fn settle(state: &mut BudgetState, reservation: &Reservation) -> Result<WorkUnitId, BudgetError> {
        let (unit_id, amount) = state
            .outstanding
            .remove(&reservation.id)
            .ok_or_else(|| BudgetError::UnknownReservation(reservation.id.clone()))?;
        state.run.reserved = state.run.reserved.saturating_sub(amount);
        if let Some(ledger) = state.units.get_mut(&unit_id) {
            ledger.reserved = ledger.reserved.saturating_sub(amount);
        }
        Ok(unit_id)
    }

    /// 按实际用量记账（可超出预留）
    pub async fn commit(
        &self,
        reservation: Reservation,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<TokenLedger, BudgetError> {
        let mut state = self.state.lock().await;
        let unit_id = Self::settle(&mut state, &reservation)?;

        state.run.prompt_tokens += prompt_tokens;
        state.run.completion_tokens += completion_tokens;
        let default_ceiling = self.unit_ceiling;
        let ledger = state
            .units
            .entry(unit_id.clone())
            .or_insert_with(|| TokenLedger::with_ceiling(default_ceiling));
        ledger.prompt_tokens += prompt_tokens;
        ledger.completion_tokens += completion_tokens;

        let actual = prompt_tokens + completion_tokens;
        if actual > reservation.amount {
            tracing::info!(
                unit = %unit_id,
                reserved = reservation.amount,
                actual,
                remaining = ledger.remaining(),
                "usage exceeded reservation"
            );
        }
        Ok(*ledger)
    }

    /// 调用未发生或失败时归还预留
    pub async fn release(&self, reservation: Reservation) -> Result<(), BudgetError> {
        let mut state = self.state.lock().await;
        Self::settle(&mut state, &reservation).map(|_| ())
    }

    pub async fn ledger(&self, unit_id: &str) -> TokenLedger {
        self.state
            .lock()
            .await
            .units
            .get(unit_id)
            .copied()
            .unwrap_or_else(|| TokenLedger::with_ceiling(self.unit_ceiling))
    }

    /// 本进程是否已有该单元的账本
    pub async fn tracks(&self, unit_id: &str) -> bool {
        self.state.lock().await.units.contains_key(unit_id)
    }

    pub async fn run_ledger(&self) -> TokenLedger {
        self.state.lock().await.run
    }

    /// 追加单元预算
    pub async fn replenish_unit(&self, unit_id: &str, extra: u64) -> TokenLedger {
        let mut state = self.state.lock().await;
        let default_ceiling = self.unit_ceiling;
        let ledger = state
            .units
            .entry(unit_id.to_string())
            .or_insert_with(|| TokenLedger::with_ceiling(default_ceiling));
        ledger.ceiling += extra;
        tracing::info!(unit = %unit_id, extra, ceiling = ledger.ceiling, "unit budget replenished");
        *ledger
    }

    /// 追加全局预算
    pub async fn replenish_run(&self, extra: u64) -> TokenLedger {
        let mut state = self.state.lock().await;
        state.run.ceiling += extra;
        tracing::info!(extra, ceiling = state.run.ceiling, "run budget replenished");
        state.run
    }

    /// 清零单元用量（人工操作）；全局账本保留真实花费
    pub async fn reset_unit(&self, unit_id: &str) -> TokenLedger {
        let mut state = self.state.lock().await;
        let default_ceiling = self.unit_ceiling;
        let ledger = state
            .units
            .entry(unit_id.to_string())
            .or_insert_with(|| TokenLedger::with_ceiling(default_ceiling));
        ledger.prompt_tokens = 0;
        ledger.completion_tokens = 0;
        tracing::info!(unit = %unit_id, "unit usage reset");
        *ledger
    }

    /// 从持久化快照恢复单元账本
    pub async fn restore(&self, unit_id: &str, usage: UsageTotals, ceiling: Option<u64>) {
        let mut state = self.state.lock().await;
        let ledger = TokenLedger {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            ceiling: ceiling.unwrap_or(self.unit_ceiling),
            reserved: 0,
        };
        state.units.insert(unit_id.to_string(), ledger);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn allow(decision: ReserveDecision) -> Reservation {
        match decision {
            ReserveDecision::Allow(r) => r,
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        assert_eq!(TokenEstimator::estimate("你好世界"), 3);
        assert_eq!(TokenEstimator::estimate(""), 1);
    }

    #[tokio::test]
    async fn test_reserve_more_than_remaining_is_denied() {
        let budget = TokenBudgetManager::new(10_000, 100);
        let decision = budget.reserve("wu_1", 101).await;
        assert_eq!(
            decision,
            ReserveDecision::Deny {
                scope: BudgetScope::WorkUnit,
                requested: 101,
                remaining: 100
            }
        );
        allow(budget.reserve("wu_1", 100).await);
    }

    #[tokio::test]
    async fn test_overage_blocks_further_reservations() {
        let budget = TokenBudgetManager::new(10_000, 100);
        let r = allow(budget.reserve("wu_1", 50).await);
        let ledger = budget.commit(r, 80, 40).await.unwrap();
        assert_eq!(ledger.remaining(), -20);

        assert!(matches!(
            budget.reserve("wu_1", 1).await,
            ReserveDecision::Deny { .. }
        ));

        budget.replenish_unit("wu_1", 100).await;
        allow(budget.reserve("wu_1", 10).await);
    }

    #[tokio::test]
    async fn test_zero_remaining_denies_zero_estimate() {
        let budget = TokenBudgetManager::new(10_000, 10);
        let r = allow(budget.reserve("wu_1", 10).await);
        budget.commit(r, 10, 0).await.unwrap();
        assert!(matches!(
            budget.reserve("wu_1", 0).await,
            ReserveDecision::Deny { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_ceiling_shared_between_units() {
        let budget = TokenBudgetManager::new(150, 100);
        let _a = allow(budget.reserve("wu_a", 100).await);
        let decision = budget.reserve("wu_b", 100).await;
        assert!(matches!(
            decision,
            ReserveDecision::Deny {
                scope: BudgetScope::Run,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_release_returns_reservation() {
        let budget = TokenBudgetManager::new(100, 100);
        let r = allow(budget.reserve("wu_1", 100).await);
        assert_eq!(budget.ledger("wu_1").await.reserved, 100);
        budget.release(r).await.unwrap();
        assert_eq!(budget.ledger("wu_1").await.reserved, 0);
        assert_eq!(budget.run_ledger().await.reserved, 0);
        allow(budget.reserve("wu_1", 100).await);
    }

    #[tokio::test]
    async fn test_forged_reservation_is_rejected() {
        let budget = TokenBudgetManager::new(100, 100);
        let forged = Reservation {
            id: "res_forged".into(),
            work_unit_id: "wu_1".into(),
            amount: 10,
        };
        assert!(budget.commit(forged, 1, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_unit_keeps_run_totals() {
        let budget = TokenBudgetManager::new(1000, 100);
        let r = allow(budget.reserve("wu_1", 60).await);
        budget.commit(r, 60, 0).await.unwrap();
        let ledger = budget.reset_unit("wu_1").await;
        assert_eq!(ledger.used(), 0);
        assert_eq!(budget.run_ledger().await.used(), 60);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overcommit() {
        let budget = Arc::new(TokenBudgetManager::new(1_000, 1_000));
        let mut handles = Vec::new();
        for i in 0..20 {
            let budget = budget.clone();
            handles.push(tokio::spawn(async move {
                matches!(
                    budget.reserve(&format!("wu_{}", i % 4), 100).await,
                    ReserveDecision::Allow(_)
                )
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(budget.run_ledger().await.reserved, 1_000);
    }

    #[tokio::test]
    async fn test_restore_ledger() {
        let budget = TokenBudgetManager::new(1000, 100);
        budget
            .restore(
                "wu_1",
                UsageTotals {
                    prompt_tokens: 30,
                    completion_tokens: 20,
                },
                Some(200),
            )
            .await;
        let ledger = budget.ledger("wu_1").await;
        assert_eq!(ledger.remaining(), 150);
    }
}
