//! # 合并式唤醒信号
//!
//! ## 意图（Why）
//! - 接受消费者在两次工作之间无限期阻塞；能够唤醒它的生产者有两个：传输层的新连接事件，以及
//!   槽位回收时的释放通知；
//! - 若只依赖前者，当所有槽位都已空闲而不再有新的 SYN 到达时，积压队列中的连接将永远得不到服务。
//!
//! ## 契约（What）
//! - 单槽语义：消费前的多次 `notify` 折叠为一次待处理唤醒；
//! - `close` 之后所有等待立即返回 [`WakeReason::Closed`]，且不可逆。

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::transport::InboundNotifier;

/// 等待结束的原因。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeReason {
    /// 收到唤醒。
    Signalled,
    /// 信号已关闭，等待者应退出。
    Closed,
    /// 有界等待超时。
    TimedOut,
}

#[derive(Debug, Default)]
struct WakeState {
    pending: bool,
    closed: bool,
    notifications: u64,
}

/// 单槽、可合并的唤醒信号。
#[derive(Debug, Default)]
pub struct WakeSignal {
    state: Mutex<WakeState>,
    ready: Condvar,
}

impl WakeSignal {
    /// 创建未触发的信号。
    pub fn new() -> Self {
        Self::default()
    }

    /// 置位待处理唤醒；已有待处理唤醒时合并。
    pub fn notify(&self) {
        let mut state = self.state.lock();
        state.notifications = state.notifications.saturating_add(1);
        if !state.pending {
            state.pending = true;
            self.ready.notify_one();
        }
    }

    /// 无限期等待唤醒并消费它。
    pub fn wait(&self) -> WakeReason {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return WakeReason::Closed;
            }
            if state.pending {
                state.pending = false;
                return WakeReason::Signalled;
            }
            self.ready.wait(&mut state);
        }
    }

    /// 至多等待 `timeout`。
    pub fn wait_timeout(&self, timeout: Duration) -> WakeReason {
        let mut state = self.state.lock();
        if !state.pending && !state.closed {
            // 虚假唤醒后不再续等，调用方本就需要处理 `TimedOut`。
            let _ = self.ready.wait_for(&mut state, timeout);
        }
        if state.closed {
            WakeReason::Closed
        } else if state.pending {
            state.pending = false;
            WakeReason::Signalled
        } else {
            WakeReason::TimedOut
        }
    }

    /// 关闭信号，唤醒所有等待者。
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    /// 是否存在尚未消费的唤醒。
    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 累计收到的 `notify` 次数（含被合并的部分）。
    pub fn notifications(&self) -> u64 {
        self.state.lock().notifications
    }
}

impl InboundNotifier for WakeSignal {
    fn inbound_ready(&self) {
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn multiple_notifications_coalesce() {
        let signal = WakeSignal::new();
        signal.notify();
        signal.notify();
        signal.notify();
        assert_eq!(signal.notifications(), 3);
        assert_eq!(signal.wait_timeout(Duration::ZERO), WakeReason::Signalled);
        assert_eq!(
            signal.wait_timeout(Duration::from_millis(1)),
            WakeReason::TimedOut,
            "合并后只应留下一次唤醒"
        );
    }

    #[test]
    fn blocked_waiter_resumes_on_notify() {
        let signal = Arc::new(WakeSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        signal.notify();
        assert_eq!(waiter.join().expect("等待线程不应 panic"), WakeReason::Signalled);
    }

    #[test]
    fn close_releases_waiters_permanently() {
        let signal = Arc::new(WakeSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        signal.close();
        assert_eq!(waiter.join().expect("等待线程不应 panic"), WakeReason::Closed);
        signal.notify();
        assert_eq!(signal.wait(), WakeReason::Closed);
    }
}
