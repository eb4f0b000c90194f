//! 端点共享状态与 I/O 驱动任务。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接层以同步、有界的方式调用传输层，而 Tokio 套接字只能在异步任务中推进；
//!   两者之间用一份受 `parking_lot::Mutex` 保护的用户态缓冲衔接；
//! - 每个端点对应一个独占 `TcpStream` 的驱动任务，负责把发送队列写入内核、把到达的数据
//!   搬进接收缓冲，并在收到关闭请求后完成 FIN 或 RST。
//!
//! ## 契约（What）
//! - `unsent` 为仍在用户态发送队列中的字节数；`unacknowledged` 为已从队列取出、
//!   `write_all` 尚未返回的字节数。数据一旦交给内核即视为已确认；
//! - 关闭请求只记账并唤醒驱动任务，调用线程从不等待；
//! - 正在进行的推送同样受关闭超时约束：对端不再读取时，推送在超时后被放弃并以 RST 结束；
//! - 任何锁都不会跨越 `.await` 持有。
//!
//! ## 注意事项（Trade-offs）
//! - 内核发送队列对用户态不可见，排空判定因此偏乐观：关闭在数据进入内核后即可开始，
//!   剩余投递由内核在后台完成；
//! - `more_coming` 写入最多在 [`COALESCE_WINDOW`] 内合并，之后无论调用方是否继续写入都会推送。

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::SockRef;
use spark_sockets::{ConnectProgress, EndpointId, FatalKind, ReadOutcome, TransportStatus, WriteOutcome};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::config::TcpTransportConfig;
use crate::error::{self, map_io_error};

/// `more_coming` 写入的最长合并窗口。
pub(crate) const COALESCE_WINDOW: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Connecting,
    Established,
    Failed(TransportStatus),
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    tx: BytesMut,
    in_flight: usize,
    flush_requested: bool,
    rx: BytesMut,
    rx_end: Option<TransportStatus>,
    write_error: Option<TransportStatus>,
    close_timeout: Option<Duration>,
    close_requested: Option<Duration>,
}

enum Action {
    Flush(Bytes),
    Close(Duration),
    Idle { can_read: bool, coalescing: bool },
}

/// 单个 TCP 端点。
#[derive(Debug)]
pub(crate) struct Endpoint {
    id: EndpointId,
    inner: Mutex<Inner>,
    wake: Notify,
}

impl Endpoint {
    pub(crate) fn connecting(id: EndpointId) -> Arc<Self> {
        Arc::new(Self::with_phase(id, Phase::Connecting))
    }

    pub(crate) fn established(id: EndpointId) -> Arc<Self> {
        Arc::new(Self::with_phase(id, Phase::Established))
    }

    fn with_phase(id: EndpointId, phase: Phase) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                phase,
                tx: BytesMut::new(),
                in_flight: 0,
                flush_requested: false,
                rx: BytesMut::new(),
                rx_end: None,
                write_error: None,
                close_timeout: None,
                close_requested: None,
            }),
            wake: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> EndpointId {
        self.id
    }

    pub(crate) fn progress(&self) -> ConnectProgress {
        match self.inner.lock().phase {
            Phase::Connecting => ConnectProgress::InProgress,
            Phase::Established => ConnectProgress::Established,
            Phase::Failed(status) => ConnectProgress::Failed(status),
        }
    }

    /// 把数据追加到发送队列，受 `limit` 约束。
    pub(crate) fn write(&self, bytes: &[u8], more_coming: bool, limit: usize) -> WriteOutcome {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.write_error {
            return WriteOutcome::new(0, status);
        }
        if inner.close_requested.is_some() {
            return WriteOutcome::new(0, TransportStatus::Fatal(FatalKind::NotConnected));
        }
        match inner.phase {
            Phase::Established => {}
            Phase::Connecting => return WriteOutcome::new(0, TransportStatus::WouldBlock),
            Phase::Failed(status) => return WriteOutcome::new(0, status),
        }

        let room = limit.saturating_sub(inner.tx.len() + inner.in_flight);
        if room == 0 {
            return WriteOutcome::new(0, TransportStatus::WouldBlock);
        }
        let consumed = room.min(bytes.len());
        inner.tx.extend_from_slice(&bytes[..consumed]);
        let push = !more_coming || inner.tx.len() >= limit / 2;
        if push {
            inner.flush_requested = true;
        }
        drop(inner);
        // 合并写入同样需要唤醒驱动任务以启动合并计时。
        self.wake.notify_one();
        WriteOutcome::new(consumed, TransportStatus::Ok)
    }

    /// 从接收缓冲取出数据；缓冲为空时报告流末尾或复位等终态。
    pub(crate) fn read(&self, buf: &mut [u8]) -> ReadOutcome {
        let mut inner = self.inner.lock();
        if inner.rx.is_empty() {
            let status = inner.rx_end.unwrap_or(TransportStatus::WouldBlock);
            return ReadOutcome::new(0, status);
        }
        let n = buf.len().min(inner.rx.len());
        let chunk = inner.rx.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        drop(inner);
        self.wake.notify_one();
        ReadOutcome::new(n, TransportStatus::Ok)
    }

    pub(crate) fn available(&self) -> usize {
        self.inner.lock().rx.len()
    }

    pub(crate) fn capacity(&self, limit: usize) -> usize {
        let inner = self.inner.lock();
        if inner.close_requested.is_some() || inner.write_error.is_some() {
            return 0;
        }
        limit.saturating_sub(inner.tx.len() + inner.in_flight)
    }

    pub(crate) fn unsent(&self) -> usize {
        self.inner.lock().tx.len()
    }

    pub(crate) fn unacknowledged(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub(crate) fn set_close_timeout(&self, timeout: Duration) {
        self.inner.lock().close_timeout = Some(timeout);
    }

    /// 记录关闭请求并唤醒驱动任务；重复请求保留第一次的超时。
    pub(crate) fn request_close(&self, hint: Duration) {
        {
            let mut inner = self.inner.lock();
            if inner.close_requested.is_some() {
                return;
            }
            let timeout = inner.close_timeout.unwrap_or(hint);
            inner.close_requested = Some(timeout);
        }
        self.wake.notify_one();
    }

    fn fail(&self, status: TransportStatus) {
        self.inner.lock().phase = Phase::Failed(status);
    }

    fn close_pending(&self) -> bool {
        self.inner.lock().close_requested.is_some()
    }

    fn next_action(&self, receive_limit: usize) -> Action {
        let mut inner = self.inner.lock();
        if let Some(timeout) = inner.close_requested {
            return Action::Close(timeout);
        }
        if inner.write_error.is_none() && !inner.tx.is_empty() && inner.flush_requested {
            inner.flush_requested = false;
            let chunk = inner.tx.split().freeze();
            inner.in_flight = chunk.len();
            return Action::Flush(chunk);
        }
        Action::Idle {
            can_read: inner.rx_end.is_none() && inner.rx.len() < receive_limit,
            coalescing: inner.write_error.is_none() && !inner.tx.is_empty(),
        }
    }

    fn finish_flush(&self, result: io::Result<()>) {
        let mut inner = self.inner.lock();
        inner.in_flight = 0;
        if let Err(err) = result {
            let status = map_io_error(error::WRITE, &err);
            inner.write_error = Some(status);
            inner.tx.clear();
        }
    }

    fn absorb(&self, result: io::Result<usize>, scratch: &[u8]) {
        let mut inner = self.inner.lock();
        match result {
            Ok(0) => inner.rx_end = Some(TransportStatus::EndOfStream),
            Ok(n) => inner.rx.extend_from_slice(&scratch[..n]),
            Err(err) => {
                let status = map_io_error(error::READ, &err);
                if !status.is_retryable() {
                    inner.rx_end = Some(status);
                }
            }
        }
    }

    /// 主动连接任务：完成握手后转入 [`drive`](Self::drive)。
    pub(crate) async fn connect_and_drive(
        self: Arc<Self>,
        target: std::net::SocketAddr,
        config: Arc<TcpTransportConfig>,
    ) {
        let connecting = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(target));
        tokio::pin!(connecting);
        let result = loop {
            tokio::select! {
                result = &mut connecting => break result,
                _ = self.wake.notified() => {
                    if self.close_pending() {
                        self.fail(TransportStatus::Fatal(FatalKind::NotConnected));
                        debug!(endpoint = %self.id, "connect abandoned by close request");
                        return;
                    }
                }
            }
        };

        match result {
            Ok(Ok(stream)) => {
                configure(&stream, &config);
                self.inner.lock().phase = Phase::Established;
                debug!(endpoint = %self.id, %target, "outbound connection established");
                self.drive(stream, config).await;
            }
            Ok(Err(err)) => {
                let status = map_io_error(error::CONNECT, &err);
                self.fail(status);
                debug!(endpoint = %self.id, %target, %status, "outbound connection failed");
            }
            Err(_) => {
                self.fail(TransportStatus::Timeout);
                debug!(endpoint = %self.id, %target, "outbound connection timed out");
            }
        }
    }

    /// 端点驱动循环，直至收到关闭请求。
    pub(crate) async fn drive(self: Arc<Self>, mut stream: TcpStream, config: Arc<TcpTransportConfig>) {
        let mut scratch = vec![0u8; config.read_chunk()];
        let timeout = loop {
            match self.next_action(config.receive_buffer_limit()) {
                Action::Close(timeout) => break timeout,
                Action::Flush(chunk) => {
                    trace!(endpoint = %self.id, len = chunk.len(), "flushing send queue");
                    if !self.flush(&mut stream, &chunk).await {
                        self.reset(stream);
                        return;
                    }
                }
                Action::Idle {
                    can_read,
                    coalescing,
                } => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        result = stream.read(&mut scratch), if can_read => {
                            self.absorb(result, &scratch);
                        }
                        _ = tokio::time::sleep(COALESCE_WINDOW), if coalescing => {
                            self.inner.lock().flush_requested = true;
                        }
                    }
                }
            }
        };
        self.shut(stream, timeout).await;
    }

    /// 把 `chunk` 写入内核。
    ///
    /// 写入期间到达的关闭请求把剩余写入限制在关闭超时内：按时完成则把剩余预算写回关闭请求，
    /// 留给随后的 FIN；超时则放弃写入并返回 `false`，调用方必须复位连接。
    async fn flush(&self, stream: &mut TcpStream, chunk: &[u8]) -> bool {
        let write = stream.write_all(chunk);
        tokio::pin!(write);
        let result = loop {
            tokio::select! {
                result = &mut write => break result,
                _ = self.wake.notified() => {
                    let Some(timeout) = self.inner.lock().close_requested else {
                        continue;
                    };
                    let started = tokio::time::Instant::now();
                    match tokio::time::timeout(timeout, &mut write).await {
                        Ok(result) => {
                            let left = timeout.saturating_sub(started.elapsed());
                            self.inner.lock().close_requested = Some(left);
                            break result;
                        }
                        Err(_) => {
                            self.abandon_flush();
                            debug!(endpoint = %self.id, ?timeout, "flush interrupted by close");
                            return false;
                        }
                    }
                }
            }
        };
        self.finish_flush(result);
        true
    }

    fn abandon_flush(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = 0;
        inner.tx.clear();
    }

    /// 以 `SO_LINGER = 0` 丢弃套接字，内核发送队列随之丢弃并向对端发送 RST。
    fn reset(&self, stream: TcpStream) {
        if let Err(err) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
            map_io_error(error::CONFIGURE, &err);
        }
        drop(stream);
        debug!(endpoint = %self.id, abortive = true, "endpoint closed");
    }

    /// 在 `timeout` 内推送剩余数据并发送 FIN；超时或出错则以 RST 结束。
    async fn shut(&self, mut stream: TcpStream, timeout: Duration) {
        let remaining = {
            let mut inner = self.inner.lock();
            if inner.write_error.is_some() {
                inner.tx.clear();
            }
            let chunk = inner.tx.split().freeze();
            inner.in_flight = chunk.len();
            chunk
        };

        let graceful = tokio::time::timeout(timeout, async {
            stream.write_all(&remaining).await?;
            stream.shutdown().await
        })
        .await;
        self.inner.lock().in_flight = 0;

        if matches!(graceful, Ok(Ok(()))) {
            debug!(endpoint = %self.id, ?timeout, abortive = false, "endpoint closed");
        } else {
            self.reset(stream);
        }
    }
}

/// 对新建立的连接应用套接字选项；失败只记录告警。
pub(crate) fn configure(stream: &TcpStream, config: &TcpTransportConfig) {
    if let Err(err) = stream.set_nodelay(config.nodelay()) {
        let status = map_io_error(error::CONFIGURE, &err);
        warn!(code = error::CONFIGURE.code, %status, "failed to apply TCP_NODELAY");
    }
}
