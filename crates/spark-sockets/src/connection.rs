//! # 单槽位连接状态机
//!
//! ## 核心意图（Why）
//! - 每个槽位拥有一个 TCP 端点的完整生命周期；宿主的驱动循环每周期调用一次 `poll`，
//!   关闭过程中的一切阻塞工作都推迟到这里，并以截止时间约束；
//! - 传输层可在自己的上下文中随时释放端点，因此任何对句柄、端点、计数的访问都先经过有效性检查。
//!
//! ## 状态机约束（What）
//! - 合法跃迁见 [`SlotState::can_transition_to`]；
//! - `close` 只记录截止时间并进入 `ClosePending`，O(1) 返回，绝不调用传输层；
//! - `ClosePending` 期间不读取任何数据；
//! - 回收（finalize）后状态恰为 `Free`，并把监听器回指交给连接池，由连接池在释放槽位锁后唤醒监听器。
//!
//! ## 教案式使用指南（How）
//! 1. 连接池在 `allocate` 时调用 [`Connection::claim`]；
//! 2. 主动连接走 [`connect`](Connection::connect)，被动接受走 [`accept`](Connection::accept)；
//! 3. 驱动循环交替调用 `write`/`read`/`poll`，结束时调用 [`close`](Connection::close)；
//! 4. 每次调用后连接池通过 [`take_finalized`](Connection::take_finalized) 领取回收结果。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::clock::{Clock, deadline_after};
use crate::config::ConnectionTimings;
use crate::error::{Result, SocketError};
use crate::listener::{ListenerId, ListenerLink};
use crate::state::SlotState;
use crate::status::SlotStatus;
use crate::transport::{
    ConnectProgress, EndpointId, FatalKind, ResultClass, Transport, TransportStatus,
};

/// `poll` 在 `Connected` 状态下单次从传输层抽取的最大字节数。
const RECEIVE_CHUNK: usize = 512;

/// 写入时是否还有后续数据的提示。
///
/// - `MoreComing`：调用方马上还会写入，传输层可暂缓推送；
/// - `Flush`：这是本批次最后一段，传输层应尽快推送。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PushHint {
    /// 后续还有数据。
    MoreComing,
    /// 立即推送。
    Flush,
}

impl PushHint {
    /// 转换为传输层的 `more_coming` 标志。
    pub const fn more_coming(self) -> bool {
        matches!(self, PushHint::MoreComing)
    }
}

/// 一次 `write` 调用的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteReport {
    /// 传输层真实接收的字节数，永远不超过请求长度。
    pub written: usize,
    /// 最后一次传输层调用的结果码。
    pub status: TransportStatus,
}

/// 一次 `read` 调用的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadReport {
    /// 写入调用方缓冲区的字节数。
    pub read: usize,
    /// 最后一次传输层调用的结果码。
    pub status: TransportStatus,
}

/// 槽位回收的结果，由连接池在释放槽位锁后处理。
#[derive(Debug)]
pub(crate) struct Finalized {
    /// 需要被唤醒的监听器；`None` 表示无需通知。
    pub(crate) listener: Option<ListenerLink>,
}

/// 单个槽位上的连接。
///
/// # 教案式说明
/// - **意图 (Why)**：把状态、端点句柄、关闭截止时间、监听器回指与待读缓冲放在同一把槽位锁下，
///   保证“恰好一个状态”的不变量；
/// - **契约 (What)**：`endpoint` 非空时由本槽位独占；变为 `None` 当且仅当端点已被拆除；
///   `close_deadline` 仅在 `ClosePending` 时有效；`listener` 为弱回指，从不拥有监听器；
/// - **风险 (Trade-offs)**：槽位锁在传输层调用期间保持，因此传输层实现必须是有界的。
pub struct Connection {
    slot: usize,
    generation: u64,
    state: SlotState,
    endpoint: Option<EndpointId>,
    close_deadline: Option<Instant>,
    listener: Option<ListenerLink>,
    pending_rx: BytesMut,
    finalized: Option<Finalized>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    timings: ConnectionTimings,
}

impl Connection {
    /// 创建处于 `Free` 状态的槽位。
    pub fn new(
        slot: usize,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        timings: ConnectionTimings,
    ) -> Self {
        Self {
            slot,
            generation: 0,
            state: SlotState::Free,
            endpoint: None,
            close_deadline: None,
            listener: None,
            pending_rx: BytesMut::new(),
            finalized: None,
            transport,
            clock,
            timings,
        }
    }

    /// 槽位下标。
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// 当前分配代次，每次 `claim` 递增。
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 当前状态。
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// 当前持有的端点句柄。
    pub fn endpoint(&self) -> Option<EndpointId> {
        self.endpoint
    }

    /// 关闭截止时间，仅在 `ClosePending` 时存在。
    pub fn close_deadline(&self) -> Option<Instant> {
        self.close_deadline
    }

    /// 待读缓冲中的字节数。
    pub fn pending_receive(&self) -> usize {
        self.pending_rx.len()
    }

    /// 状态快照。
    pub fn snapshot(&self) -> SlotStatus {
        SlotStatus {
            slot: self.slot,
            state: self.state,
            endpoint: self.endpoint,
            listener_port: self.listener.as_ref().map(ListenerLink::port),
            pending_receive: self.pending_rx.len(),
        }
    }

    /// 独占一个空闲槽位：`Free → Allocated`，返回新的代次。
    pub(crate) fn claim(&mut self) -> u64 {
        debug_assert_eq!(self.state, SlotState::Free, "只能认领空闲槽位");
        self.generation = self.generation.wrapping_add(1);
        self.finalized = None;
        self.transition(SlotState::Allocated);
        self.generation
    }

    /// 发起主动连接。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - 仅允许在 `Allocated` 下调用；
    /// - 返回 `Ok(())` 仅表示连接已成功发起，握手进度由后续 `poll` 推进；
    /// - 传输层拒绝发起时返回 `Err`，且槽位回到 `Free`：绝不在底层失败时报告成功。
    pub fn connect(&mut self, target: SocketAddr) -> Result<()> {
        self.expect_state(&[SlotState::Allocated], "connect")?;
        match self.transport.connect(target) {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint);
                self.transition(SlotState::Connecting);
                Ok(())
            }
            Err(status) => {
                debug!(slot = self.slot, %target, %status, "connect rejected by transport");
                self.finalize(self.timings.forced_close_timeout, false);
                Err(SocketError::Transport(status))
            }
        }
    }

    /// 绑定一条已接受的入站连接：`Allocated → Connected`。
    pub(crate) fn accept(&mut self, endpoint: EndpointId, listener: ListenerLink) -> Result<()> {
        self.expect_state(&[SlotState::Allocated], "accept")?;
        self.endpoint = Some(endpoint);
        self.listener = Some(listener);
        self.transition(SlotState::Connected);
        Ok(())
    }

    /// 写出数据。
    ///
    /// # 教案级注释
    ///
    /// ## 意图（Why）
    /// - 在一次调用内尽量把缓冲交给传输层，但绝不自旋：可重试结果立即结束循环，交由调用方下个周期重试。
    ///
    /// ## 契约（What）
    /// - 允许在 `Connected`/`OtherEndClosed` 下调用；
    /// - 返回值 `written` 为传输层真实接收的字节数，永远不超过 `buf.len()`；
    /// - `WouldBlock`/`TransientNoMemory` 即使伴随部分写入也不会终止连接；
    /// - 对端关闭类结果转入 `OtherEndClosed`；其余未分类结果触发 `terminate(true)`。
    ///
    /// ## 实现逻辑（How）
    /// - 至多尝试 `write_retry_limit` 次；`Ok` 但零进展同样结束循环。
    pub fn write(&mut self, buf: &[u8], hint: PushHint) -> Result<WriteReport> {
        self.expect_state(&[SlotState::Connected, SlotState::OtherEndClosed], "write")?;
        let Some(endpoint) = self.endpoint else {
            return Ok(WriteReport {
                written: 0,
                status: TransportStatus::Fatal(FatalKind::NotConnected),
            });
        };

        let mut written = 0;
        let mut status = TransportStatus::Ok;
        for _ in 0..self.timings.write_retry_limit {
            let remaining = &buf[written..];
            if remaining.is_empty() {
                break;
            }
            let outcome = self
                .transport
                .write(endpoint, remaining, hint.more_coming());
            let consumed = outcome.consumed.min(remaining.len());
            written += consumed;
            status = outcome.status;
            match status.class() {
                ResultClass::Success if consumed > 0 => continue,
                ResultClass::Success | ResultClass::Retryable | ResultClass::Benign => break,
                ResultClass::RemoteClosed => {
                    self.on_remote_closed(status);
                    break;
                }
                ResultClass::Fatal => {
                    warn!(slot = self.slot, %status, written, "fatal write result, terminating slot");
                    self.terminate(true);
                    break;
                }
            }
        }
        Ok(WriteReport { written, status })
    }

    /// 是否可以立即写入。任何状态下都可调用，空句柄或端点失效时返回 `false`。
    pub fn can_write(&self) -> bool {
        if !self.state.accepts_writes() {
            return false;
        }
        match self.endpoint {
            Some(endpoint) => self
                .transport
                .send_capacity(endpoint)
                .is_some_and(|capacity| capacity > 0),
            None => false,
        }
    }

    /// 是否有可读数据。`ClosePending` 下恒为 `false`。
    pub fn can_read(&self) -> bool {
        if !matches!(self.state, SlotState::Connected | SlotState::OtherEndClosed) {
            return false;
        }
        if !self.pending_rx.is_empty() {
            return true;
        }
        self.endpoint
            .and_then(|endpoint| self.transport.bytes_available(endpoint))
            .is_some_and(|available| available > 0)
    }

    /// 读取数据：先消费待读缓冲，再向传输层读取剩余空间。
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadReport> {
        self.expect_state(&[SlotState::Connected, SlotState::OtherEndClosed], "read")?;
        let buffered = self.pending_rx.len().min(buf.len());
        if buffered > 0 {
            let chunk = self.pending_rx.split_to(buffered);
            buf[..buffered].copy_from_slice(&chunk);
        }
        let mut report = ReadReport {
            read: buffered,
            status: TransportStatus::Ok,
        };
        if buffered == buf.len() {
            return Ok(report);
        }
        let Some(endpoint) = self.endpoint else {
            return Ok(report);
        };
        let outcome = self.transport.read(endpoint, &mut buf[buffered..]);
        report.read += outcome.read.min(buf.len() - buffered);
        report.status = outcome.status;
        self.absorb_read_status(outcome.status);
        Ok(report)
    }

    /// 请求关闭。
    ///
    /// # 教案级注释
    ///
    /// ## 意图（Why）
    /// - 驱动循环同时服务一条同步链路，关闭绝不能在调用线程上等待四次挥手；
    /// - 也不先做单向 `shutdown`：排空期间本就不读数据，而同步的半关闭原语会重新引入阻塞。
    ///
    /// ## 契约（What）
    /// - `Connected`/`OtherEndClosed`/`Connecting`：记录 `now + max_send_wait` 并进入 `ClosePending`；
    /// - `Allocated`：尚无端点，直接回收；`Aborted`：视为宿主确认，直接回收；
    /// - 其余状态为空操作，重复调用不会延长截止时间；
    /// - 不调用任何传输层方法。
    pub fn close(&mut self) {
        match self.state {
            SlotState::Connected | SlotState::OtherEndClosed | SlotState::Connecting => {
                self.close_deadline = Some(deadline_after(self.clock.now(), self.timings.max_send_wait));
                self.transition(SlotState::ClosePending);
            }
            SlotState::Allocated | SlotState::Aborted => {
                self.finalize(self.timings.forced_close_timeout, true);
            }
            SlotState::Free | SlotState::ClosePending | SlotState::CloseReady => {}
        }
    }

    /// 推进状态机，返回推进后的状态。
    pub fn poll(&mut self) -> SlotState {
        match self.state {
            SlotState::Connecting => self.poll_connecting(),
            SlotState::Connected => self.pump_receive(),
            SlotState::ClosePending => self.poll_close_pending(),
            SlotState::Free
            | SlotState::Allocated
            | SlotState::OtherEndClosed
            | SlotState::CloseReady
            | SlotState::Aborted => {}
        }
        self.state
    }

    /// 强制终止。
    ///
    /// # 教案级注释
    ///
    /// ## 契约（What）
    /// - 以最小关闭超时拆除端点，释放待读缓冲；
    /// - `is_external = true` 表示终止对外可见：槽位回到 `Free` 时唤醒监听器（空回指时跳过）；
    /// - 仅当启用 `abort_requires_ack` 且终止对外可见时停留在 `Aborted`，等待宿主 `release`；
    /// - 处于 `ClosePending` 的槽位（超时路径）一律回到 `Free`，从不进入 `Aborted`；
    /// - 对 `Free` 槽位为空操作。
    pub fn terminate(&mut self, is_external: bool) {
        match self.state {
            SlotState::Free | SlotState::CloseReady => return,
            SlotState::Aborted => return,
            _ => {}
        }
        let park = is_external
            && self.timings.abort_requires_ack
            && self.state != SlotState::ClosePending
            && self.state != SlotState::Allocated;
        if park {
            self.teardown_endpoint(self.timings.forced_close_timeout);
            self.release_receive_buffer();
            self.close_deadline = None;
            self.transition(SlotState::Aborted);
        } else {
            self.finalize(self.timings.forced_close_timeout, is_external);
        }
    }

    /// 宿主释放槽位：任何非 `Free` 状态均强制回收并唤醒监听器。
    pub(crate) fn release(&mut self) {
        if self.state == SlotState::Free {
            return;
        }
        self.finalize(self.timings.forced_close_timeout, true);
    }

    /// 清除指向 `id` 的监听器回指，返回是否发生清除。
    pub(crate) fn clear_listener(&mut self, id: ListenerId) -> bool {
        if self.listener.as_ref().is_some_and(|link| link.id() == id) {
            self.listener = None;
            true
        } else {
            false
        }
    }

    /// 领取最近一次回收结果。
    pub(crate) fn take_finalized(&mut self) -> Option<Finalized> {
        self.finalized.take()
    }

    fn poll_connecting(&mut self) {
        let progress = self
            .endpoint
            .and_then(|endpoint| self.transport.connect_progress(endpoint));
        match progress {
            Some(ConnectProgress::InProgress) => {}
            Some(ConnectProgress::Established) => self.transition(SlotState::Connected),
            Some(ConnectProgress::Failed(status)) => {
                debug!(slot = self.slot, %status, "connect attempt failed");
                self.terminate(true);
            }
            None => {
                debug!(slot = self.slot, "endpoint vanished while connecting");
                self.terminate(true);
            }
        }
    }

    fn pump_receive(&mut self) {
        let Some(endpoint) = self.endpoint else {
            return;
        };
        if self.transport.bytes_available(endpoint).is_none() {
            // 端点已被传输层异步释放（例如收到 RST）。
            self.on_remote_closed(TransportStatus::ConnectionReset);
            return;
        }
        let room = self
            .timings
            .receive_buffer_limit
            .saturating_sub(self.pending_rx.len())
            .min(RECEIVE_CHUNK);
        if room == 0 {
            return;
        }
        let mut chunk = [0u8; RECEIVE_CHUNK];
        let outcome = self.transport.read(endpoint, &mut chunk[..room]);
        let read = outcome.read.min(room);
        if read > 0 {
            self.pending_rx.extend_from_slice(&chunk[..read]);
        }
        self.absorb_read_status(outcome.status);
    }

    /// `ClosePending` 的回收判定。
    ///
    /// 满足任一条件即回收：句柄为空、端点失效、未发送与未确认计数同时为零、已到截止时间。
    /// 两个计数都要为零：数据进入输出队列并不代表送达，等待确认才能避免截止后的 RST 丢弃对端
    /// 尚未确认的数据。
    fn poll_close_pending(&mut self) {
        let timed_out = self
            .close_deadline
            .is_none_or(|deadline| self.clock.now() >= deadline);
        let drained = match self.endpoint {
            None => true,
            Some(endpoint) => {
                match (
                    self.transport.query_unsent(endpoint),
                    self.transport.query_unacknowledged(endpoint),
                ) {
                    (Some(unsent), Some(unacked)) => unsent == 0 && unacked == 0,
                    _ => true,
                }
            }
        };

        if drained {
            self.finalize(self.timings.drained_close_timeout, true);
        } else if timed_out {
            warn!(
                slot = self.slot,
                waited = ?self.timings.max_send_wait,
                "close drain deadline reached, forcing teardown"
            );
            self.finalize(self.timings.forced_close_timeout, true);
        }
    }

    fn absorb_read_status(&mut self, status: TransportStatus) {
        match status.class() {
            ResultClass::Success | ResultClass::Retryable | ResultClass::Benign => {}
            ResultClass::RemoteClosed => self.on_remote_closed(status),
            ResultClass::Fatal => {
                warn!(slot = self.slot, %status, "fatal read result, terminating slot");
                self.terminate(true);
            }
        }
    }

    fn on_remote_closed(&mut self, status: TransportStatus) {
        if self.state == SlotState::Connected {
            debug!(slot = self.slot, %status, "peer closed connection");
            self.transition(SlotState::OtherEndClosed);
        }
    }

    /// 回收槽位：拆除端点、释放缓冲、回到 `Free`，并登记需要唤醒的监听器。
    fn finalize(&mut self, close_timeout: Duration, notify: bool) {
        if self.state == SlotState::Free {
            return;
        }
        self.teardown_endpoint(close_timeout);
        self.release_receive_buffer();
        self.close_deadline = None;
        let listener = self.listener.take();
        self.transition(SlotState::Free);
        self.finalized = Some(Finalized {
            listener: if notify { listener } else { None },
        });
    }

    fn teardown_endpoint(&mut self, close_timeout: Duration) {
        let Some(endpoint) = self.endpoint.take() else {
            return;
        };
        if self.transport.is_alive(endpoint) {
            self.transport.set_close_timeout(endpoint, close_timeout);
            self.transport.initiate_close(endpoint, close_timeout);
        }
        self.transport.release_endpoint(endpoint);
    }

    fn release_receive_buffer(&mut self) {
        self.pending_rx = BytesMut::new();
    }

    fn expect_state(&self, allowed: &[SlotState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SocketError::InvalidState {
                slot: self.slot,
                state: self.state,
                operation,
            })
        }
    }

    fn transition(&mut self, next: SlotState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal slot transition {} -> {}",
            self.state,
            next
        );
        debug!(slot = self.slot, from = %self.state, to = %next, "slot transition");
        self.state = next;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("endpoint", &self.endpoint)
            .field("close_deadline", &self.close_deadline)
            .field("pending_rx", &self.pending_rx.len())
            .finish_non_exhaustive()
    }
}
