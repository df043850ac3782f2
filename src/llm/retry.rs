//! 带超时、指数退避与抖动的重试
//!
//! 网关调用与外部校验共用：每次尝试单独受超时约束，第 n 次失败后等待
//! base * 2^(n-1)（封顶 max_delay）再加 0~25% 随机抖动；取消令牌触发时立即放弃等待。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::llm::GatewayError;

/// 可重试错误的分类
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// 服务端建议的等待时间
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// 单次尝试超时对应的错误
    fn timed_out(after: Duration) -> Self;
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        GatewayError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    fn timed_out(after: Duration) -> Self {
        GatewayError::Transient(format!("timed out after {}ms", after.as_millis()))
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 单次尝试超时
    pub attempt_timeout: Duration,
    /// 抖动上限（相对退避时长的比例）
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(120),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 第 `attempt` 次失败后的基础退避（不含抖动），attempt 从 1 开始
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exp);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }
}

/// 重试成功的结果
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// 首次之外的尝试次数
    pub retries: u32,
}

/// 重试失败
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure<E> {
    /// 可重试错误耗尽了尝试次数
    Exhausted { attempts: u32, last: E },
    /// 不可重试错误，立即放弃
    Fatal { attempts: u32, error: E },
    Cancelled { attempts: u32 },
}

impl<E> RetryFailure<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Exhausted { attempts, .. }
            | RetryFailure::Fatal { attempts, .. }
            | RetryFailure::Cancelled { attempts } => *attempts,
        }
    }
}

/// 按策略执行 `op`，`op` 收到当前尝试序号（从 1 开始）
pub async fn call_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<RetryOutcome<T>, RetryFailure<E>>
where
    E: Retryable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(RetryFailure::Cancelled {
                attempts: attempt - 1,
            });
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(op = label, attempt, "cancelled during attempt");
                return Err(RetryFailure::Cancelled { attempts: attempt });
            }
            r = tokio::time::timeout(policy.attempt_timeout, op(attempt)) => {
                r.unwrap_or_else(|_| Err(E::timed_out(policy.attempt_timeout)))
            }
        };

        let error = match result {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    retries: attempt - 1,
                })
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::warn!(op = label, attempt, error = %error, "non-retryable failure");
            return Err(RetryFailure::Fatal {
                attempts: attempt,
                error,
            });
        }
        if attempt >= max_attempts {
            tracing::warn!(op = label, attempts = attempt, error = %error, "retries exhausted");
            return Err(RetryFailure::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let mut delay = policy.backoff_with_jitter(attempt);
        if let Some(hint) = error.retry_after() {
            delay = delay.max(hint.min(policy.max_delay));
        }
        tracing::info!(
            op = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryFailure::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(4))
            .with_attempt_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff_with_jitter(2);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_millis(2500));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_three_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<RetryOutcome<()>, _> =
            call_with_retry(&fast_policy(), &CancellationToken::new(), "test", |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Transient("boom".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryFailure::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<RetryOutcome<()>, _> =
            call_with_retry(&fast_policy(), &CancellationToken::new(), "test", |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Rejected("policy".into()))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryFailure::Fatal { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_success_after_retry_reports_retries() {
        let outcome = call_with_retry(&fast_policy(), &CancellationToken::new(), "test", |attempt| async move {
            if attempt < 2 {
                Err(GatewayError::RateLimited {
                    message: "slow down".into(),
                    retry_after_ms: Some(1),
                })
            } else {
                Ok("done")
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.retries, 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_transient() {
        let policy = fast_policy().with_attempt_timeout(Duration::from_millis(5));
        let result: Result<RetryOutcome<()>, _> =
            call_with_retry(&policy, &CancellationToken::new(), "slow", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), GatewayError>(())
            })
            .await;
        assert!(matches!(result, Err(RetryFailure::Exhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let policy = fast_policy().with_attempt_timeout(Duration::from_secs(30));
        let result: Result<RetryOutcome<()>, _> = call_with_retry(&policy, &cancel, "hang", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), GatewayError>(())
        })
        .await;
        assert!(matches!(result, Err(RetryFailure::Cancelled { .. })));
    }
}
