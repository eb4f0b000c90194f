//! 脚本化传输层桩，供单元测试与集成测试驱动状态机。
//!
//! # 教案式说明
//! - **意图 (Why)**：状态机的每条分支都取决于传输层返回的计数与结果码，真实协议栈无法稳定复现
//!   “恰好卡在 1999ms 仍有未确认数据”之类的场景；
//! - **契约 (What)**：所有变更类调用都会记录在 [`TransportCall`] 日志中，测试据此断言
//!   “关闭超时设为多少”“是否触碰了传输层”；
//! - **实现 (How)**：端点表与监听表置于同一把锁下；向监听器宣告新连接时在锁外调用通知器，
//!   模拟传输层自身的执行上下文。

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::transport::{
    ConnectProgress, EndpointId, FatalKind, InboundNotifier, ReadOutcome, Transport,
    TransportStatus, WriteOutcome,
};

/// 被记录的传输层调用。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportCall {
    /// 主动连接。
    Connect { target: SocketAddr },
    /// 写入。
    Write {
        endpoint: EndpointId,
        len: usize,
        more_coming: bool,
    },
    /// 读取。
    Read { endpoint: EndpointId },
    /// 设置关闭超时。
    SetCloseTimeout {
        endpoint: EndpointId,
        timeout: Duration,
    },
    /// 发起关闭。
    InitiateClose {
        endpoint: EndpointId,
        hint: Duration,
    },
    /// 释放端点。
    Release { endpoint: EndpointId },
    /// 开始监听。
    Listen { port: u16 },
    /// 停止监听。
    Unlisten { port: u16 },
}

#[derive(Debug)]
struct StubEndpoint {
    progress: ConnectProgress,
    unsent: usize,
    unacknowledged: usize,
    write_capacity: usize,
    write_script: VecDeque<WriteOutcome>,
    rx: VecDeque<u8>,
    rx_status: Option<TransportStatus>,
}

impl StubEndpoint {
    fn new(progress: ConnectProgress) -> Self {
        Self {
            progress,
            unsent: 0,
            unacknowledged: 0,
            write_capacity: usize::MAX,
            write_script: VecDeque::new(),
            rx: VecDeque::new(),
            rx_status: None,
        }
    }
}

struct StubListener {
    notifier: Arc<dyn InboundNotifier>,
    pending: VecDeque<EndpointId>,
}

#[derive(Default)]
struct ScriptState {
    next_id: u64,
    endpoints: HashMap<EndpointId, StubEndpoint>,
    listeners: HashMap<u16, StubListener>,
    orphans: VecDeque<(u16, EndpointId)>,
    connect_failure: Option<TransportStatus>,
    calls: Vec<TransportCall>,
}

impl ScriptState {
    fn mint(&mut self, progress: ConnectProgress) -> EndpointId {
        self.next_id += 1;
        let id = EndpointId::from_raw(self.next_id);
        self.endpoints.insert(id, StubEndpoint::new(progress));
        id
    }
}

/// 完全由测试脚本驱动的 [`Transport`] 实现。
#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    /// 创建空的脚本化传输层。
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 创建一个已建立连接的端点。
    pub fn open_endpoint(&self) -> EndpointId {
        self.state.lock().mint(ConnectProgress::Established)
    }

    /// 模拟一条完成握手的入站连接，并在锁外唤醒端口上的监听器。
    pub fn inbound(&self, port: u16) -> EndpointId {
        let (endpoint, notifier) = {
            let mut state = self.state.lock();
            let endpoint = state.mint(ConnectProgress::Established);
            let notifier = state.listeners.get_mut(&port).map(|listener| {
                listener.pending.push_back(endpoint);
                Arc::clone(&listener.notifier)
            });
            (endpoint, notifier)
        };
        if let Some(notifier) = notifier {
            notifier.inbound_ready();
        }
        endpoint
    }

    /// 让下一次 `connect` 以 `status` 失败。
    pub fn fail_next_connect(&self, status: TransportStatus) {
        self.state.lock().connect_failure = Some(status);
    }

    /// 设置主动连接的进度。
    pub fn set_connect_progress(&self, endpoint: EndpointId, progress: ConnectProgress) {
        self.with_endpoint(endpoint, |ep| ep.progress = progress);
    }

    /// 预置若干次写入结果，耗尽后回到按容量写入。
    pub fn script_writes(
        &self,
        endpoint: EndpointId,
        outcomes: impl IntoIterator<Item = WriteOutcome>,
    ) {
        self.with_endpoint(endpoint, |ep| ep.write_script.extend(outcomes));
    }

    /// 设置每次写入可接收的字节数；`0` 表示持续 `WouldBlock`。
    pub fn set_write_capacity(&self, endpoint: EndpointId, capacity: usize) {
        self.with_endpoint(endpoint, |ep| ep.write_capacity = capacity);
    }

    /// 设置未发送与未确认计数。
    pub fn set_queue_counts(&self, endpoint: EndpointId, unsent: usize, unacknowledged: usize) {
        self.with_endpoint(endpoint, |ep| {
            ep.unsent = unsent;
            ep.unacknowledged = unacknowledged;
        });
    }

    /// 追加到达的数据。
    pub fn push_rx(&self, endpoint: EndpointId, bytes: &[u8]) {
        self.with_endpoint(endpoint, |ep| ep.rx.extend(bytes.iter().copied()));
    }

    /// 设置接收队列为空时 `read` 返回的结果码（默认 `WouldBlock`）。
    pub fn set_rx_status(&self, endpoint: EndpointId, status: TransportStatus) {
        self.with_endpoint(endpoint, |ep| ep.rx_status = Some(status));
    }

    /// 模拟传输层在自身上下文中异步释放端点。
    pub fn invalidate(&self, endpoint: EndpointId) {
        self.state.lock().endpoints.remove(&endpoint);
    }

    /// 调用日志快照。
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// 针对 `endpoint` 的写入调用次数。
    pub fn write_calls(&self, endpoint: EndpointId) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Write { endpoint: ep, .. } if *ep == endpoint))
            .count()
    }

    /// 最近一次为 `endpoint` 设置的关闭超时。
    pub fn close_timeout_of(&self, endpoint: EndpointId) -> Option<Duration> {
        self.state.lock().calls.iter().rev().find_map(|call| match call {
            TransportCall::SetCloseTimeout {
                endpoint: ep,
                timeout,
            } if *ep == endpoint => Some(*timeout),
            _ => None,
        })
    }

    /// 是否对 `endpoint` 发起过关闭。
    pub fn is_closing(&self, endpoint: EndpointId) -> bool {
        self.state.lock().calls.iter().any(
            |call| matches!(call, TransportCall::InitiateClose { endpoint: ep, .. } if *ep == endpoint),
        )
    }

    /// 是否释放过 `endpoint`。
    pub fn was_released(&self, endpoint: EndpointId) -> bool {
        self.released().contains(&endpoint)
    }

    /// 按调用顺序列出被释放的端点（含重复释放）。
    pub fn released(&self) -> Vec<EndpointId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Release { endpoint } => Some(*endpoint),
                _ => None,
            })
            .collect()
    }

    /// 当前存活的端点数量。
    pub fn live_endpoints(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    fn with_endpoint(&self, endpoint: EndpointId, f: impl FnOnce(&mut StubEndpoint)) {
        if let Some(ep) = self.state.lock().endpoints.get_mut(&endpoint) {
            f(ep);
        }
    }

    fn query<T>(&self, endpoint: EndpointId, f: impl FnOnce(&StubEndpoint) -> T) -> Option<T> {
        self.state.lock().endpoints.get(&endpoint).map(f)
    }
}

impl Transport for ScriptedTransport {
    fn connect(&self, target: SocketAddr) -> Result<EndpointId, TransportStatus> {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Connect { target });
        match state.connect_failure.take() {
            Some(status) => Err(status),
            None => Ok(state.mint(ConnectProgress::InProgress)),
        }
    }

    fn connect_progress(&self, endpoint: EndpointId) -> Option<ConnectProgress> {
        self.query(endpoint, |ep| ep.progress)
    }

    fn write(&self, endpoint: EndpointId, bytes: &[u8], more_coming: bool) -> WriteOutcome {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Write {
            endpoint,
            len: bytes.len(),
            more_coming,
        });
        let Some(ep) = state.endpoints.get_mut(&endpoint) else {
            return WriteOutcome::new(0, TransportStatus::Fatal(FatalKind::NotConnected));
        };
        if let Some(outcome) = ep.write_script.pop_front() {
            return outcome;
        }
        if ep.write_capacity == 0 {
            return WriteOutcome::new(0, TransportStatus::WouldBlock);
        }
        WriteOutcome::new(bytes.len().min(ep.write_capacity), TransportStatus::Ok)
    }

    fn read(&self, endpoint: EndpointId, buf: &mut [u8]) -> ReadOutcome {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Read { endpoint });
        let Some(ep) = state.endpoints.get_mut(&endpoint) else {
            return ReadOutcome::new(0, TransportStatus::Fatal(FatalKind::NotConnected));
        };
        if ep.rx.is_empty() {
            return ReadOutcome::new(0, ep.rx_status.unwrap_or(TransportStatus::WouldBlock));
        }
        let count = ep.rx.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(ep.rx.drain(..count)) {
            *slot = byte;
        }
        ReadOutcome::new(count, TransportStatus::Ok)
    }

    fn bytes_available(&self, endpoint: EndpointId) -> Option<usize> {
        self.query(endpoint, |ep| ep.rx.len())
    }

    fn send_capacity(&self, endpoint: EndpointId) -> Option<usize> {
        self.query(endpoint, |ep| ep.write_capacity)
    }

    fn query_unsent(&self, endpoint: EndpointId) -> Option<usize> {
        self.query(endpoint, |ep| ep.unsent)
    }

    fn query_unacknowledged(&self, endpoint: EndpointId) -> Option<usize> {
        self.query(endpoint, |ep| ep.unacknowledged)
    }

    fn set_close_timeout(&self, endpoint: EndpointId, timeout: Duration) {
        self.state
            .lock()
            .calls
            .push(TransportCall::SetCloseTimeout { endpoint, timeout });
    }

    fn initiate_close(&self, endpoint: EndpointId, timeout_hint: Duration) {
        self.state.lock().calls.push(TransportCall::InitiateClose {
            endpoint,
            hint: timeout_hint,
        });
    }

    fn release_endpoint(&self, endpoint: EndpointId) {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Release { endpoint });
        state.endpoints.remove(&endpoint);
    }

    fn listen(
        &self,
        port: u16,
        notifier: Arc<dyn InboundNotifier>,
    ) -> Result<(), TransportStatus> {
        let mut state = self.state.lock();
        if state.listeners.contains_key(&port) {
            return Err(TransportStatus::Fatal(FatalKind::AddressInUse));
        }
        state.calls.push(TransportCall::Listen { port });
        state.listeners.insert(
            port,
            StubListener {
                notifier,
                pending: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn unlisten(&self, port: u16) {
        let mut state = self.state.lock();
        state.calls.push(TransportCall::Unlisten { port });
        // 未被取走的入站连接保留给 `accept_pending`，由监听器逐条关闭。
        if let Some(listener) = state.listeners.remove(&port) {
            state
                .orphans
                .extend(listener.pending.into_iter().map(|endpoint| (port, endpoint)));
        }
    }

    fn accept_pending(&self, port: u16) -> Option<EndpointId> {
        let mut state = self.state.lock();
        if let Some(listener) = state.listeners.get_mut(&port) {
            return listener.pending.pop_front();
        }
        let index = state.orphans.iter().position(|(owner, _)| *owner == port)?;
        state.orphans.remove(index).map(|(_, endpoint)| endpoint)
    }
}
