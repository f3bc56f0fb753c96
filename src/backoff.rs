//! 재시도 백오프 정책
//!
//! delay(n) = base * 2^(n-1), ceiling으로 상한

use std::time::Duration;

use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// 첫 재시도 대기
    pub base: Duration,
    /// 대기 상한
    pub ceiling: Duration,
    /// 청크당 최대 시도 횟수
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration, max_retries: u32) -> Self {
        Self {
            base,
            ceiling,
            max_retries,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_ceiling_ms),
            config.max_retries,
        )
    }

    /// n번째 실패 후 대기 시간 (n >= 1, 0은 1로 취급)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = match 1u32.checked_shl(exponent) {
            Some(f) => f,
            None => return self.ceiling,
        };
        self.base
            .checked_mul(factor)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    /// 시도 횟수가 상한을 넘었는지
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
