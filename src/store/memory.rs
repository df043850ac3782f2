//! 内存状态存储（测试与临时运行）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::StoreError;
use crate::store::{check_append, StateStore};
use crate::workflow::{TransitionRecord, WorkUnit};

#[derive(Debug, Default)]
struct Inner {
    units: HashMap<String, WorkUnit>,
    history: HashMap<String, Vec<TransitionRecord>>,
}

/// 单锁实现：快照与历史在同一临界区内更新
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_work_unit(&self, id: &str) -> Result<WorkUnit, StoreError> {
        self.inner
            .lock()
            .await
            .units
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save_transition(&self, unit: &WorkUnit, record: &TransitionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let committed = inner.history.get(&unit.id).map(|h| h.len() as u64).unwrap_or(0);
        check_append(unit, record, committed)?;
        inner
            .history
            .entry(unit.id.clone())
            .or_default()
            .push(record.clone());
        inner.units.insert(unit.id.clone(), unit.clone());
        Ok(())
    }

    async fn list_history(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.units.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(inner.history.get(id).cloned().unwrap_or_default())
    }

    async fn list_work_units(&self) -> Result<Vec<WorkUnit>, StoreError> {
        let mut units: Vec<WorkUnit> = self.inner.lock().await.units.values().cloned().collect();
        units.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Phase, PhaseMetrics, TransitionTarget, TransitionTrigger};

    #[tokio::test]
    async fn test_missing_unit_is_not_found() {
        let store = MemoryStateStore::new();
        assert!(matches!(
            store.load_work_unit("wu_missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sequence_gap_rejected_without_side_effects() {
        let store = MemoryStateStore::new();
        let mut unit = WorkUnit::new("x");
        let first = unit.record_transition(
            TransitionTarget::Phase(Phase::Expand),
            TransitionTrigger::Created,
            PhaseMetrics::default(),
        );
        store.save_transition(&unit, &first).await.unwrap();

        let mut stale = unit.clone();
        stale.history_len = 0;
        let replay = stale.record_transition(
            TransitionTarget::Phase(Phase::Differentiate),
            TransitionTrigger::CandidateProduced { artifacts: 1 },
            PhaseMetrics::default(),
        );
        assert!(matches!(
            store.save_transition(&stale, &replay).await,
            Err(StoreError::SequenceGap { .. })
        ));
        let loaded = store.load_work_unit(&unit.id).await.unwrap();
        assert_eq!(loaded.phase, Phase::Expand);
        assert_eq!(store.list_history(&unit.id).await.unwrap().len(), 1);
    }
}
