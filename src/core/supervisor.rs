//! 运行监管：停止信号与取消令牌
//!
//! 一次运行一个停止令牌；每个在途 WorkUnit 一个子令牌。两者含义不同：
//! - 取消某个 WorkUnit（人工 abandon）只影响它自己，阶段以 Abandoned 提交；
//! - 停止整个运行（Ctrl+C、持久化失败）会中断所有在途任务，但不提交任何转移，
//!   每个 WorkUnit 停在最后一次持久化的状态，下次 `resume` 从那里继续。

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// 一个在途 WorkUnit 的信号
#[derive(Debug, Clone, Default)]
pub struct UnitSignal {
    /// 任务级取消：人工 abandon 或运行停止都会触发
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl UnitSignal {
    /// 独立信号（不挂在任何运行下）
    pub fn new() -> Self {
        Self::default()
    }

    fn under(stop: &CancellationToken) -> Self {
        Self {
            cancel: stop.child_token(),
            stop: stop.clone(),
        }
    }

    /// 传给分派器、评审器和重试循环的令牌
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn abandon(&self) {
        self.cancel.cancel();
    }

    /// 运行已停止：不得再提交转移
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct RunSupervisor {
    stop: CancellationToken,
    units: Mutex<HashMap<String, UnitSignal>>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 停止整个运行（不记录 Abandoned）
    pub fn stop_run(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// WorkUnit 的信号（不存在则创建）
    pub async fn unit_signal(&self, unit_id: &str) -> UnitSignal {
        let mut units = self.units.lock().await;
        units
            .entry(unit_id.to_string())
            .or_insert_with(|| UnitSignal::under(&self.stop))
            .clone()
    }

    /// 取消单个 WorkUnit；返回是否存在在途信号
    pub async fn cancel_unit(&self, unit_id: &str) -> bool {
        let units = self.units.lock().await;
        match units.get(unit_id) {
            Some(signal) => {
                signal.abandon();
                true
            }
            None => false,
        }
    }

    /// WorkUnit 驱动结束后移除信号
    pub async fn finish_unit(&self, unit_id: &str) {
        self.units.lock().await.remove(unit_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_unit_is_isolated() {
        let sup = RunSupervisor::new();
        let a = sup.unit_signal("wu_a").await;
        let b = sup.unit_signal("wu_b").await;
        assert!(sup.cancel_unit("wu_a").await);
        assert!(a.token().is_cancelled());
        assert!(!a.is_stopped());
        assert!(!b.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_interrupts_units_without_abandoning() {
        let sup = RunSupervisor::new();
        let a = sup.unit_signal("wu_a").await;
        sup.stop_run();
        assert!(a.token().is_cancelled());
        assert!(a.is_stopped());
        assert!(sup.is_stopped());
    }

    #[tokio::test]
    async fn test_finished_unit_gets_fresh_signal() {
        let sup = RunSupervisor::new();
        let first = sup.unit_signal("wu_a").await;
        sup.cancel_unit("wu_a").await;
        sup.finish_unit("wu_a").await;
        assert!(!sup.cancel_unit("wu_a").await);
        let second = sup.unit_signal("wu_a").await;
        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());
    }
}
