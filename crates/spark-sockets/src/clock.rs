//! # 时间来源
//!
//! 关闭截止时间的判定依赖单调时钟。生产环境使用 [`SystemClock`]，测试注入 [`MockClock`]
//! 并手动推进，以便逐毫秒验证“恰好在 `MaxSendWaitTime` 时强制回收”。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 无法表示的截止时间退化到的上限。
pub(crate) const DEADLINE_CAP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// 计算 `now + wait`；溢出时退化为 `now + DEADLINE_CAP`。
pub(crate) fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(DEADLINE_CAP))
        .unwrap_or(now)
}

/// 可注入的单调时钟。
///
/// # 接口约束（What）
/// - `now` 返回的时间点必须单调不减；
/// - 实现者必须是非阻塞的，驱动循环在每个周期都会调用它。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;
}

/// 基于 [`Instant::now`] 的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 虚拟时钟：通过手动推进时间以在测试中复现确定性的截止判定。
///
/// # 行为概览（How）
/// - 记录构造时的 [`Instant`] 作为基准，`advance` 只增加偏移量；
/// - 克隆体共享同一偏移量，测试可以一边持有句柄推进时间，一边把时钟交给连接池。
#[derive(Clone, Debug)]
pub struct MockClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// 创建起始时间为当前系统时间的虚拟时钟。
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_add(by);
    }

    /// 自构造起累计推进的时长。
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        deadline_after(self.origin, *self.elapsed.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances_only_on_demand() {
        let clock = MockClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        let shared = clock.clone();
        shared.advance(Duration::from_millis(1999));
        assert_eq!(clock.now() - start, Duration::from_millis(1999));
        assert_eq!(clock.elapsed(), Duration::from_millis(1999));
    }

    #[test]
    fn unrepresentable_deadline_is_capped() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::MAX), now + DEADLINE_CAP);
        assert_eq!(
            deadline_after(now, Duration::from_millis(5)),
            now + Duration::from_millis(5)
        );

        let clock = MockClock::new();
        clock.advance(Duration::MAX);
        assert!(clock.now() >= now);
    }
}
