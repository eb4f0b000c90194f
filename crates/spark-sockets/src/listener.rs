//! # 监听器与有界积压队列
//!
//! ## 意图（Why）
//! - 传输层在自己的执行上下文中宣告新连接，监听器只负责把它们放进有界队列并唤醒接受消费者；
//! - 队列满或无人服务时立即“接受并关闭”，让对端尽快收到明确的关闭，而不是悬挂在握手之后。
//!
//! ## 契约（What）
//! - 积压队列长度永远不超过配置容量；
//! - `stop` 是幂等的：先在局部捕获标识与端口，再清除槽位回指、关闭积压连接、停止监听，最后关闭唤醒信号；
//! - 槽位对监听器的引用是弱回指 [`ListenerLink`]，监听器停止后回指失效即可，不需要所有权往返。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SocketError};
use crate::pool::{FreeSlotWatcher, SlotHandle, SlotPool};
use crate::transport::{EndpointId, FatalKind, InboundNotifier, Transport, TransportStatus};
use crate::wake::WakeSignal;

/// 监听器标识。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ListenerId(u64);

impl ListenerId {
    /// 由原始整数构造。
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 读取原始整数。
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

/// 槽位指向所属监听器的弱回指。
///
/// 只持有唤醒信号的 [`Weak`] 引用：监听器被移除后 `notify` 自然变为空操作。
#[derive(Clone, Debug)]
pub struct ListenerLink {
    id: ListenerId,
    port: u16,
    wake: Weak<WakeSignal>,
}

impl ListenerLink {
    /// 构造回指。
    pub fn new(id: ListenerId, port: u16, wake: &Arc<WakeSignal>) -> Self {
        Self {
            id,
            port,
            wake: Arc::downgrade(wake),
        }
    }

    /// 监听器标识。
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// 监听端口。
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 唤醒监听器；监听器已不存在时返回 `false`。
    pub fn notify(&self) -> bool {
        match self.wake.upgrade() {
            Some(wake) => {
                wake.notify();
                true
            }
            None => false,
        }
    }
}

/// 入站连接的处置结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    /// 已进入积压队列。
    Queued,
    /// 已被接受并立即关闭。
    Rejected,
}

/// 监听器停止时的清理报告。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StopReport {
    /// 被清除回指的槽位数。
    pub detached_slots: usize,
    /// 被关闭的积压连接数。
    pub closed_backlog: usize,
}

/// 单个端口上的监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“传输层宣告 → 积压入队 → 消费者绑定槽位 → 宿主取走”四段流程中监听器负责的部分集中在此；
///
/// ## 契约（What）
/// - `collect_inbound` 可在任意线程调用，会把传输层的待接受连接全部取出并逐条 `admit`；
/// - `pop_backlog`/`requeue_front` 供接受消费者使用；
/// - `next_accepted` 供宿主取走已绑定到槽位的连接。
///
/// ## 注意事项（Trade-offs）
/// - 积压队列与已接受队列各自一把锁，两者从不嵌套持有。
pub struct Listener {
    id: ListenerId,
    port: u16,
    capacity: usize,
    backlog: Mutex<VecDeque<EndpointId>>,
    accepted: Mutex<VecDeque<SlotHandle>>,
    wake: Arc<WakeSignal>,
    stopped: AtomicBool,
    rejected: AtomicU64,
    transport: Arc<dyn Transport>,
}

impl Listener {
    /// 在 `port` 上开始监听。
    ///
    /// 传输层报告端口占用时返回 [`SocketError::PortInUse`]。
    pub fn start(
        id: ListenerId,
        port: u16,
        capacity: usize,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let wake = Arc::new(WakeSignal::new());
        let notifier: Arc<dyn InboundNotifier> = wake.clone();
        transport.listen(port, notifier).map_err(|status| match status {
            TransportStatus::Fatal(FatalKind::AddressInUse) => SocketError::PortInUse { port },
            other => SocketError::Transport(other),
        })?;
        info!(port, capacity, listener = id.into_raw(), "listener started");
        Ok(Arc::new(Self {
            id,
            port,
            capacity,
            backlog: Mutex::new(VecDeque::with_capacity(capacity)),
            accepted: Mutex::new(VecDeque::new()),
            wake,
            stopped: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
            transport,
        }))
    }

    /// 监听器标识。
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// 监听端口。
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 积压队列容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前积压的连接数。
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    /// 因队列满或监听器停止而被立即关闭的连接总数。
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// 是否已停止。
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 接受消费者阻塞所用的唤醒信号。
    pub fn wake(&self) -> &Arc<WakeSignal> {
        &self.wake
    }

    /// 供槽位保存的弱回指。
    pub fn link(&self) -> ListenerLink {
        ListenerLink::new(self.id, self.port, &self.wake)
    }

    /// 取走一条已绑定到槽位的入站连接。
    pub fn next_accepted(&self) -> Option<SlotHandle> {
        self.accepted.lock().pop_front()
    }

    /// 在积压队列有空间时从传输层取出待接受连接，不做拒绝，返回入队数量。
    pub fn fill_backlog(&self) -> usize {
        let mut queued = 0;
        while !self.is_stopped() && self.backlog_len() < self.capacity {
            let Some(endpoint) = self.transport.accept_pending(self.port) else {
                break;
            };
            if self.admit(endpoint) == Admission::Queued {
                queued += 1;
            }
        }
        queued
    }

    /// 从传输层取出所有待接受连接并逐条处置，返回入队数量。
    ///
    /// 队列已满时取出的连接会被接受并立即关闭。
    pub fn collect_inbound(&self) -> usize {
        let mut queued = 0;
        while let Some(endpoint) = self.transport.accept_pending(self.port) {
            if self.admit(endpoint) == Admission::Queued {
                queued += 1;
            }
        }
        queued
    }

    /// 处置一条入站连接：队列有空间则入队，否则接受并立即关闭。
    pub fn admit(&self, endpoint: EndpointId) -> Admission {
        if !self.is_stopped() {
            let mut backlog = self.backlog.lock();
            if backlog.len() < self.capacity {
                backlog.push_back(endpoint);
                debug!(port = self.port, %endpoint, depth = backlog.len(), "inbound queued");
                return Admission::Queued;
            }
        }
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(port = self.port, %endpoint, "backlog full or listener stopped, closing inbound");
        self.close_endpoint(endpoint);
        Admission::Rejected
    }

    /// 弹出最早的积压连接。
    pub(crate) fn pop_backlog(&self) -> Option<EndpointId> {
        self.backlog.lock().pop_front()
    }

    /// 把未能服务的连接放回队首；监听器已停止时直接关闭。
    pub(crate) fn requeue_front(&self, endpoint: EndpointId) {
        if self.is_stopped() {
            self.close_endpoint(endpoint);
            return;
        }
        self.backlog.lock().push_front(endpoint);
    }

    pub(crate) fn push_accepted(&self, handle: SlotHandle) {
        self.accepted.lock().push_back(handle);
    }

    /// 停止监听。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - 幂等：第二次调用返回全零报告；
    /// - 已绑定的槽位继续存活，仅失去回指，之后回收时不再唤醒本监听器；
    /// - 积压队列与传输层尚未交付的连接全部被关闭；
    /// - 尚未被宿主取走的已接受槽位在 `next_accepted` 中保留，宿主仍需自行关闭。
    ///
    /// ## 实现逻辑（How）
    /// 1. 先把标识与端口复制到局部变量，后续步骤都只使用局部副本；
    /// 2. 停止传输层监听，避免新连接继续进入；
    /// 3. 清除槽位回指并关闭积压；
    /// 4. 最后关闭唤醒信号，让接受消费者退出。
    pub fn stop(&self, pool: &SlotPool) -> StopReport {
        let id = self.id;
        let port = self.port;
        if self.stopped.swap(true, Ordering::AcqRel) {
            return StopReport::default();
        }
        self.transport.unlisten(port);
        let detached_slots = pool.clear_listener(id);

        let drained: Vec<EndpointId> = self.backlog.lock().drain(..).collect();
        let mut closed_backlog = drained.len();
        for endpoint in drained {
            self.close_endpoint(endpoint);
        }
        while let Some(endpoint) = self.transport.accept_pending(port) {
            self.close_endpoint(endpoint);
            closed_backlog += 1;
        }

        pool.unwatch_free_slots(id);
        self.wake.close();
        info!(port, detached_slots, closed_backlog, "listener stopped");
        StopReport {
            detached_slots,
            closed_backlog,
        }
    }

    fn close_endpoint(&self, endpoint: EndpointId) {
        self.transport.set_close_timeout(endpoint, Duration::ZERO);
        self.transport.initiate_close(endpoint, Duration::ZERO);
        self.transport.release_endpoint(endpoint);
    }
}

impl FreeSlotWatcher for Listener {
    fn slot_freed(&self) {
        if !self.is_stopped() && !self.backlog.lock().is_empty() {
            self.wake.notify();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("capacity", &self.capacity)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

/// 把监听器登记为槽位回收的观察者。
pub(crate) fn watch(pool: &SlotPool, listener: &Arc<Listener>) {
    let watcher: Arc<dyn FreeSlotWatcher> = listener.clone();
    pool.watch_free_slots(listener.id(), Arc::downgrade(&watcher));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::ScriptedTransport;

    #[test]
    fn overflow_is_accepted_and_closed() {
        let transport = ScriptedTransport::new();
        let listener =
            Listener::start(ListenerId::from_raw(1), 80, 2, transport.clone()).expect("listen");
        let a = transport.inbound(80);
        let b = transport.inbound(80);
        let c = transport.inbound(80);
        assert_eq!(listener.collect_inbound(), 2);
        assert_eq!(listener.backlog_len(), 2);
        assert_eq!(listener.rejected(), 1);
        assert!(transport.was_released(c));
        assert!(transport.is_closing(c));
        assert!(!transport.was_released(a) && !transport.was_released(b));
    }

    #[test]
    fn inbound_announcement_wakes_consumer() {
        let transport = ScriptedTransport::new();
        let listener =
            Listener::start(ListenerId::from_raw(1), 81, 2, transport.clone()).expect("listen");
        transport.inbound(81);
        assert!(listener.wake().is_pending());
    }

    #[test]
    fn duplicate_port_maps_to_port_in_use() {
        let transport = ScriptedTransport::new();
        let _first =
            Listener::start(ListenerId::from_raw(1), 82, 2, transport.clone()).expect("listen");
        let err = Listener::start(ListenerId::from_raw(2), 82, 2, transport.clone())
            .expect_err("端口已占用");
        assert_eq!(err, SocketError::PortInUse { port: 82 });
    }

    #[test]
    fn dropped_listener_link_is_inert() {
        let wake = Arc::new(WakeSignal::new());
        let link = ListenerLink::new(ListenerId::from_raw(9), 80, &wake);
        drop(wake);
        assert!(!link.notify());
    }
}
