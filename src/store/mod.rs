//! 工作流状态存储
//!
//! 持久化副本是唯一权威：内存中的 WorkUnit 只是工作副本，每次阶段转移都通过
//! `save_transition` 原子地写入快照并追加一条历史，要么全部成功要么全部不生效。
//! 历史只追加、永不改写，`seq` 从 0 开始连续。

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::core::StoreError;
use crate::workflow::{TransitionRecord, WorkUnit};

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// 读取最后一次提交的快照
    async fn load_work_unit(&self, id: &str) -> Result<WorkUnit, StoreError>;

    /// 原子提交：快照 + 一条历史记录；`record.seq` 必须等于已有历史条数
    async fn save_transition(&self, unit: &WorkUnit, record: &TransitionRecord) -> Result<(), StoreError>;

    /// 按 seq 升序的完整历史
    async fn list_history(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError>;

    /// 全部 WorkUnit（按创建时间升序）
    async fn list_work_units(&self) -> Result<Vec<WorkUnit>, StoreError>;
}

/// 追加前的一致性检查（两种实现共用）
pub(crate) fn check_append(unit: &WorkUnit, record: &TransitionRecord, committed: u64) -> Result<(), StoreError> {
    if record.work_unit_id != unit.id {
        return Err(StoreError::Write(format!(
            "transition for {} saved with snapshot of {}",
            record.work_unit_id, unit.id
        )));
    }
    if record.seq != committed {
        return Err(StoreError::SequenceGap {
            unit: unit.id.clone(),
            expected: committed,
            got: record.seq,
        });
    }
    if unit.history_len != record.seq + 1 {
        return Err(StoreError::Write(format!(
            "snapshot cursor {} does not follow transition {}",
            unit.history_len, record.seq
        )));
    }
    Ok(())
}
