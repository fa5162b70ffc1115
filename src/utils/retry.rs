use std::future::Future;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::core::{Result, UploadError};

// Duration 以毫秒持久化
fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大重试次数（总尝试次数为 max_retries + 1）
    pub max_retries: u32,
    /// 初始延迟
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub initial_delay: Duration,
    /// 最大延迟
    #[serde(serialize_with = "serialize_millis", deserialize_with = "deserialize_millis")]
    pub max_delay: Duration,
    /// 退避因子
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// 计算第 attempt 次失败后的延迟（指数退避，封顶 max_delay）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_factor.powi(attempt as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);
        std::cmp::min(delay, self.max_delay)
    }
}

/// 执行带退避重试的操作
///
/// 不可重试的错误立即返回；可重试的错误最多再执行 `max_retries` 次，
/// 每次之间等待指数退避的延迟。等待期间取消信号生效，立即以
/// `Cancelled` 终止整个操作。
pub async fn retry_with_backoff<F, Fut, T>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt == config.max_retries {
                    last_error = Some(err);
                    break;
                }

                let delay = config.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );

                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                }

                last_error = Some(err);
            }
        }
    }

    Err(UploadError::RetryExhausted {
        attempts: config.max_retries + 1,
        source: Box::new(last_error.unwrap_or(UploadError::Cancelled)),
    })
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// 正常放行
    Closed,
    /// 连续失败达到阈值，拒绝执行
    Open,
    /// 冷却结束，放行一次试探调用
    HalfOpen,
}

/// 熔断器
///
/// 跨调用统计连续失败次数，是独立于重试机制的可选保护层。
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    failures: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            failures: 0,
            last_failure: None,
            state: BreakerState::Closed,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// 执行被保护的操作
    pub async fn call<F, Fut, T>(&mut self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.state == BreakerState::Open {
            let cooled_down = self
                .last_failure
                .map(|at| at.elapsed() >= self.reset_timeout)
                .unwrap_or(true);

            if cooled_down {
                self.state = BreakerState::HalfOpen;
            } else {
                return Err(UploadError::Validation(
                    "circuit breaker is open, call rejected".to_string(),
                ));
            }
        }

        match operation().await {
            Ok(value) => {
                self.failures = 0;
                self.state = BreakerState::Closed;
                Ok(value)
            }
            Err(err) => {
                self.failures += 1;
                self.last_failure = Some(Instant::now());
                if self.failures >= self.max_failures {
                    self.state = BreakerState::Open;
                }
                Err(err)
            }
        }
    }
}
