//! # 固定槽位连接池
//!
//! ## 意图（Why）
//! - 嵌入式宿主的连接数在构造时固定，池化避免运行期分配，并让 `allocate` 可以有界等待；
//! - 监听器的接受消费者与宿主驱动循环会并发访问同一批槽位，需要明确的锁分层。
//!
//! ## 锁分层（How）
//! - 外层：`book`（空闲链表与成员标记），只保护簿记，从不在持有期间调用传输层；
//! - 内层：每个槽位一把 `Mutex<Connection>`，持有期间可以调用传输层；
//! - 顺序约束：持有槽位锁时可以短暂获取 `book`（回收入链表前会先释放槽位锁）；
//!   持有 `book` 时绝不获取槽位锁。
//!
//! ## 契约（What）
//! - 槽位在空闲链表中当且仅当其状态为 `Free`；
//! - 同一槽位不会被两个调用方同时分配；
//! - 回收后的监听器唤醒发生在所有锁释放之后。

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::clock::{Clock, deadline_after};
use crate::config::ConnectionTimings;
use crate::connection::{Connection, Finalized, PushHint, ReadReport, WriteReport};
use crate::error::{Result, SocketError};
use crate::listener::{ListenerId, ListenerLink};
use crate::state::SlotState;
use crate::status::PoolStatus;
use crate::transport::{EndpointId, Transport};

/// 指向某一代槽位分配的句柄。
///
/// 槽位被回收并重新分配后代次递增，旧句柄上的操作会得到
/// [`SocketError::StaleHandle`]，而 `release` 对旧句柄是空操作。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SlotHandle {
    index: usize,
    generation: u64,
}

impl SlotHandle {
    /// 槽位下标。
    pub const fn index(self) -> usize {
        self.index
    }

    /// 分配代次。
    pub const fn generation(self) -> u64 {
        self.generation
    }
}

/// 槽位回收时需要额外被告知的一方（通常是积压队列非空的监听器）。
pub(crate) trait FreeSlotWatcher: Send + Sync {
    /// 有槽位回到了空闲链表。
    fn slot_freed(&self);
}

struct PoolBook {
    free: VecDeque<usize>,
    is_free: Vec<bool>,
    watchers: Vec<(ListenerId, Weak<dyn FreeSlotWatcher>)>,
}

/// 固定容量的槽位池。
///
/// # 教案式说明
/// - **意图 (Why)**：统一持有所有 [`Connection`]，对外以 [`SlotHandle`] 暴露单槽操作；
/// - **契约 (What)**：每个公开操作都先校验句柄代次，然后在槽位锁内执行状态机，最后在锁外结算回收；
/// - **风险 (Trade-offs)**：`allocate` 使用真实时间做有界等待，而关闭截止判定使用注入的 [`Clock`]。
pub struct SlotPool {
    slots: Box<[Mutex<Connection>]>,
    book: Mutex<PoolBook>,
    freed: Condvar,
}

impl SlotPool {
    /// 构造 `capacity` 个空闲槽位。
    pub fn new(
        capacity: usize,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        timings: ConnectionTimings,
    ) -> Self {
        let slots = (0..capacity)
            .map(|index| {
                Mutex::new(Connection::new(
                    index,
                    Arc::clone(&transport),
                    Arc::clone(&clock),
                    timings,
                ))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            book: Mutex::new(PoolBook {
                free: (0..capacity).collect(),
                is_free: vec![true; capacity],
                watchers: Vec::new(),
            }),
            freed: Condvar::new(),
        }
    }

    /// 槽位总数。
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 当前空闲槽位数。
    pub fn free_count(&self) -> usize {
        self.book.lock().free.len()
    }

    /// 分配一个空闲槽位，至多等待 `timeout`。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - 成功时槽位处于 `Allocated`，由调用方独占；
    /// - 超时返回 [`SocketError::NoSlotAvailable`]，`timeout = 0` 即不等待；
    /// - 无法表示的超时（例如 `Duration::MAX`）按一年封顶，不会溢出；
    /// - 等待期间任何槽位被回收都会唤醒本调用。
    ///
    /// ## 实现逻辑（How）
    /// - 在 `book` 内弹出下标并清除成员标记，随后释放 `book` 再锁定槽位，遵守锁分层。
    pub fn allocate(&self, timeout: Duration) -> Result<SlotHandle> {
        let deadline = deadline_after(Instant::now(), timeout);
        let index = {
            let mut book = self.book.lock();
            loop {
                if let Some(index) = book.free.pop_front() {
                    book.is_free[index] = false;
                    break index;
                }
                if self.freed.wait_until(&mut book, deadline).timed_out() {
                    match book.free.pop_front() {
                        Some(index) => {
                            book.is_free[index] = false;
                            break index;
                        }
                        None => {
                            debug!(waited = ?timeout, "slot pool exhausted");
                            return Err(SocketError::NoSlotAvailable { waited: timeout });
                        }
                    }
                }
            }
        };
        let generation = self.slots[index].lock().claim();
        trace!(slot = index, generation, "slot allocated");
        Ok(SlotHandle { index, generation })
    }

    /// 释放槽位：任何非 `Free` 状态都会被强制回收。
    ///
    /// 幂等：对已空闲的槽位或过期句柄为空操作，不会重复唤醒监听器。
    pub fn release(&self, handle: SlotHandle) {
        match self.with_slot(handle, |conn| {
            conn.release();
            Ok(())
        }) {
            Ok(()) | Err(SocketError::StaleHandle { .. }) => {}
            Err(err) => debug!(slot = handle.index, %err, "release ignored"),
        }
    }

    /// 在已分配的槽位上发起主动连接；失败时槽位已回到 `Free`。
    pub fn connect(&self, handle: SlotHandle, target: SocketAddr) -> Result<()> {
        self.with_slot(handle, |conn| conn.connect(target))
    }

    /// 写出数据，详见 [`Connection::write`]。
    pub fn write(&self, handle: SlotHandle, buf: &[u8], hint: PushHint) -> Result<WriteReport> {
        self.with_slot(handle, |conn| conn.write(buf, hint))
    }

    /// 读取数据，详见 [`Connection::read`]。
    pub fn read(&self, handle: SlotHandle, buf: &mut [u8]) -> Result<ReadReport> {
        self.with_slot(handle, |conn| conn.read(buf))
    }

    /// 是否可写；非法或过期句柄返回 `false`。
    pub fn can_write(&self, handle: SlotHandle) -> bool {
        self.with_slot(handle, |conn| Ok(conn.can_write()))
            .unwrap_or(false)
    }

    /// 是否可读；非法或过期句柄返回 `false`。
    pub fn can_read(&self, handle: SlotHandle) -> bool {
        self.with_slot(handle, |conn| Ok(conn.can_read()))
            .unwrap_or(false)
    }

    /// 请求关闭，O(1) 返回，不调用传输层。
    pub fn close(&self, handle: SlotHandle) -> Result<()> {
        self.with_slot(handle, |conn| {
            conn.close();
            Ok(())
        })
    }

    /// 推进单个槽位，返回推进后的状态。
    pub fn poll(&self, handle: SlotHandle) -> Result<SlotState> {
        self.with_slot(handle, |conn| Ok(conn.poll()))
    }

    /// 强制终止，详见 [`Connection::terminate`]。
    pub fn terminate(&self, handle: SlotHandle, is_external: bool) -> Result<()> {
        self.with_slot(handle, |conn| {
            conn.terminate(is_external);
            Ok(())
        })
    }

    /// 句柄对应槽位的当前状态。
    pub fn state(&self, handle: SlotHandle) -> Result<SlotState> {
        self.with_slot(handle, |conn| Ok(conn.state()))
    }

    /// 驱动循环的一个周期：依次推进所有非空闲槽位，返回被推进的槽位数。
    pub fn poll_all(&self) -> usize {
        let mut polled = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let finalized = {
                let mut conn = slot.lock();
                if conn.state() == SlotState::Free {
                    continue;
                }
                conn.poll();
                polled += 1;
                conn.take_finalized()
            };
            if let Some(finalized) = finalized {
                self.settle(index, finalized);
            }
        }
        polled
    }

    /// 以非外部方式终止所有非空闲槽位，用于整体关停。
    pub fn terminate_all(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            let finalized = {
                let mut conn = slot.lock();
                match conn.state() {
                    SlotState::Free => continue,
                    SlotState::Aborted => conn.release(),
                    _ => conn.terminate(false),
                }
                conn.take_finalized()
            };
            if let Some(finalized) = finalized {
                self.settle(index, finalized);
            }
        }
    }

    /// 生成状态报告。
    pub fn status(&self) -> PoolStatus {
        let slots = self.slots.iter().map(|slot| slot.lock().snapshot()).collect();
        PoolStatus {
            slots,
            free: self.free_count(),
        }
    }

    /// 把已接受的入站端点绑定到已分配的槽位。
    pub(crate) fn bind_accepted(
        &self,
        handle: SlotHandle,
        endpoint: EndpointId,
        listener: ListenerLink,
    ) -> Result<()> {
        self.with_slot(handle, |conn| conn.accept(endpoint, listener))
    }

    /// 清除所有指向 `id` 的监听器回指，返回清除的数量。
    pub(crate) fn clear_listener(&self, id: ListenerId) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().clear_listener(id))
            .count()
    }

    /// 登记在槽位回收时需要被告知的监听器。
    pub(crate) fn watch_free_slots(&self, id: ListenerId, watcher: Weak<dyn FreeSlotWatcher>) {
        let mut book = self.book.lock();
        book.watchers.retain(|(existing, _)| *existing != id);
        book.watchers.push((id, watcher));
    }

    /// 取消登记。
    pub(crate) fn unwatch_free_slots(&self, id: ListenerId) {
        self.book.lock().watchers.retain(|(existing, _)| *existing != id);
    }

    fn with_slot<R>(
        &self,
        handle: SlotHandle,
        op: impl FnOnce(&mut Connection) -> Result<R>,
    ) -> Result<R> {
        let slot = self
            .slots
            .get(handle.index)
            .ok_or(SocketError::InvalidSlot { slot: handle.index })?;
        let (result, finalized) = {
            let mut conn = slot.lock();
            if conn.generation() != handle.generation {
                return Err(SocketError::StaleHandle {
                    slot: handle.index,
                    generation: handle.generation,
                });
            }
            let result = op(&mut conn);
            (result, conn.take_finalized())
        };
        if let Some(finalized) = finalized {
            self.settle(handle.index, finalized);
        }
        result
    }

    /// 回收结算：入空闲链表、唤醒 `allocate` 等待者，最后在锁外唤醒监听器。
    fn settle(&self, index: usize, finalized: Finalized) {
        let owner = finalized.listener.as_ref().map(ListenerLink::id);
        let watchers: Vec<Arc<dyn FreeSlotWatcher>> = {
            let mut book = self.book.lock();
            if !book.is_free[index] {
                book.is_free[index] = true;
                book.free.push_back(index);
            }
            self.freed.notify_one();
            book.watchers.retain(|(_, watcher)| watcher.strong_count() > 0);
            book.watchers
                .iter()
                .filter(|(id, _)| Some(*id) != owner)
                .filter_map(|(_, watcher)| watcher.upgrade())
                .collect()
        };
        trace!(slot = index, "slot returned to free list");
        if let Some(link) = finalized.listener {
            link.notify();
        }
        for watcher in watchers {
            watcher.slot_freed();
        }
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::test_stubs::ScriptedTransport;
    use crate::wake::WakeSignal;
    use std::thread;

    fn pool(capacity: usize) -> (Arc<ScriptedTransport>, MockClock, SlotPool) {
        let transport = ScriptedTransport::new();
        let clock = MockClock::new();
        let pool = SlotPool::new(
            capacity,
            transport.clone(),
            Arc::new(clock.clone()),
            ConnectionTimings::default(),
        );
        (transport, clock, pool)
    }

    #[test]
    fn allocate_is_exclusive_and_bounded() {
        let (_transport, _clock, pool) = pool(2);
        let a = pool.allocate(Duration::ZERO).expect("第一个槽位");
        let b = pool.allocate(Duration::ZERO).expect("第二个槽位");
        assert_ne!(a.index(), b.index());
        let err = pool
            .allocate(Duration::from_millis(5))
            .expect_err("池已耗尽");
        assert!(err.is_exhaustion());
        assert_eq!(pool.state(a).expect("state"), SlotState::Allocated);
    }

    #[test]
    fn allocate_accepts_unrepresentable_timeout() {
        let (_transport, _clock, pool) = pool(1);
        let handle = pool.allocate(Duration::MAX).expect("空闲槽位立即返回");
        assert_eq!(pool.state(handle).expect("state"), SlotState::Allocated);
    }

    #[test]
    fn allocate_wakes_when_slot_is_released() {
        let (_transport, _clock, pool) = pool(1);
        let pool = Arc::new(pool);
        let held = pool.allocate(Duration::ZERO).expect("唯一槽位");
        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.allocate(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held);
        let handle = waiter.join().expect("no panic").expect("释放后应分配成功");
        assert_eq!(handle.index(), held.index());
        assert_ne!(handle.generation(), held.generation());
    }

    #[test]
    fn release_is_idempotent_and_notifies_once() {
        let (transport, _clock, pool) = pool(1);
        let wake = Arc::new(WakeSignal::new());
        let handle = pool.allocate(Duration::ZERO).expect("slot");
        let endpoint = transport.open_endpoint();
        pool.bind_accepted(
            handle,
            endpoint,
            ListenerLink::new(ListenerId::from_raw(3), 80, &wake),
        )
        .expect("bind");
        pool.release(handle);
        pool.release(handle);
        assert_eq!(wake.notifications(), 1, "重复释放不得重复唤醒");
        assert_eq!(pool.free_count(), 1);
        assert!(transport.was_released(endpoint));
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let (_transport, _clock, pool) = pool(1);
        let first = pool.allocate(Duration::ZERO).expect("slot");
        pool.release(first);
        let second = pool.allocate(Duration::ZERO).expect("slot reused");
        assert!(matches!(
            pool.close(first),
            Err(SocketError::StaleHandle { .. })
        ));
        pool.release(first);
        assert_eq!(pool.state(second).expect("state"), SlotState::Allocated);
    }

    #[test]
    fn close_of_allocated_slot_frees_immediately() {
        let (_transport, _clock, pool) = pool(1);
        let handle = pool.allocate(Duration::ZERO).expect("slot");
        pool.close(handle).expect("close");
        assert_eq!(pool.state(handle).expect("state"), SlotState::Free);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn poll_all_finalizes_drained_slots() {
        let (transport, _clock, pool) = pool(2);
        let handle = pool.allocate(Duration::ZERO).expect("slot");
        pool.connect(handle, "127.0.0.1:7".parse().expect("addr"))
            .expect("connect");
        pool.close(handle).expect("close");
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.poll_all(), 1);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(transport.released().len(), 1);
    }

    #[test]
    fn out_of_range_handle_is_invalid() {
        let (_transport, _clock, pool) = pool(1);
        let bogus = SlotHandle {
            index: 7,
            generation: 1,
        };
        assert_eq!(
            pool.poll(bogus),
            Err(SocketError::InvalidSlot { slot: 7 })
        );
        assert!(!pool.can_write(bogus));
    }
}
