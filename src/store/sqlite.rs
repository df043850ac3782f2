//! SQLite 状态存储（rusqlite）
//!
//! 一张快照表 + 一张只追加的历史表；每次转移在一个事务里写入两者。
//! rusqlite 是同步接口，所有调用都放在 `spawn_blocking` 中执行。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::StoreError;
use crate::store::{check_append, StateStore};
use crate::workflow::{TransitionRecord, WorkUnit};

#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// 打开（或创建）数据库文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Write(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS work_units (
                id          TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                phase       TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                snapshot    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transitions (
                unit_id     TEXT NOT NULL,
                seq         INTEGER NOT NULL,
                at          TEXT NOT NULL,
                record      TEXT NOT NULL,
                PRIMARY KEY (unit_id, seq)
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池中使用连接
    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Write(format!("connection lock poisoned: {e}")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Write(format!("storage task failed: {e}")))?
    }
}

fn read_err(e: rusqlite::Error) -> StoreError {
    StoreError::Read(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_work_unit(&self, id: &str) -> Result<WorkUnit, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let snapshot: Option<String> = conn
                .query_row(
                    "SELECT snapshot FROM work_units WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(read_err)?;
            let snapshot = snapshot.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            Ok(serde_json::from_str(&snapshot)?)
        })
        .await
    }

    async fn save_transition(&self, unit: &WorkUnit, record: &TransitionRecord) -> Result<(), StoreError> {
        let snapshot = serde_json::to_string(unit)?;
        let record_json = serde_json::to_string(record)?;
        let unit = unit.clone();
        let record = record.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let committed: u64 = tx.query_row(
                "SELECT COUNT(*) FROM transitions WHERE unit_id = ?1",
                params![unit.id],
                |row| row.get::<_, i64>(0),
            )? as u64;
            check_append(&unit, &record, committed)?;

            tx.execute(
                "INSERT INTO transitions (unit_id, seq, at, record) VALUES (?1, ?2, ?3, ?4)",
                params![unit.id, record.seq as i64, record.at.to_rfc3339(), record_json],
            )?;
            tx.execute(
                "INSERT INTO work_units (id, status, phase, created_at, updated_at, snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    phase = excluded.phase,
                    updated_at = excluded.updated_at,
                    snapshot = excluded.snapshot",
                params![
                    unit.id,
                    unit.status.as_str(),
                    unit.phase.as_str(),
                    unit.created_at.to_rfc3339(),
                    unit.updated_at.to_rfc3339(),
                    snapshot
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_history(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM work_units WHERE id = ?1", params![id], |row| row.get(0))
                .optional()
                .map_err(read_err)?;
            if exists.is_none() {
                return Err(StoreError::NotFound(id));
            }
            let mut stmt = conn
                .prepare("SELECT record FROM transitions WHERE unit_id = ?1 ORDER BY seq ASC")
                .map_err(read_err)?;
            let rows = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))
                .map_err(read_err)?;
            let mut history = Vec::new();
            for row in rows {
                let json = row.map_err(read_err)?;
                history.push(serde_json::from_str(&json)?);
            }
            Ok(history)
        })
        .await
    }

    async fn list_work_units(&self) -> Result<Vec<WorkUnit>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT snapshot FROM work_units ORDER BY created_at ASC, id ASC")
                .map_err(read_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(read_err)?;
            let mut units = Vec::new();
            for row in rows {
                let json = row.map_err(read_err)?;
                units.push(serde_json::from_str(&json)?);
            }
            Ok(units)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Phase, PhaseMetrics, TransitionTarget, TransitionTrigger};

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("edrr.db");
        let mut unit = WorkUnit::new("persist me");
        let created = unit.record_transition(
            TransitionTarget::Phase(Phase::Expand),
            TransitionTrigger::Created,
            PhaseMetrics::default(),
        );
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.save_transition(&unit, &created).await.unwrap();
            unit.iteration = 2;
            let next = unit.record_transition(
                TransitionTarget::Phase(Phase::Differentiate),
                TransitionTrigger::CandidateProduced { artifacts: 1 },
                PhaseMetrics::default(),
            );
            store.save_transition(&unit, &next).await.unwrap();
        }

        let reopened = SqliteStateStore::open(&path).unwrap();
        let loaded = reopened.load_work_unit(&unit.id).await.unwrap();
        assert_eq!(loaded, unit);
        let history = reopened.list_history(&unit.id).await.unwrap();
        assert_eq!(history.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(reopened.list_work_units().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_state_untouched() {
        let store = SqliteStateStore::open_memory().unwrap();
        let mut unit = WorkUnit::new("x");
        let created = unit.record_transition(
            TransitionTarget::Phase(Phase::Expand),
            TransitionTrigger::Created,
            PhaseMetrics::default(),
        );
        store.save_transition(&unit, &created).await.unwrap();

        // 重放同一个 seq
        assert!(store.save_transition(&unit, &created).await.is_err());
        assert_eq!(store.list_history(&unit.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.list_history("wu_missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
