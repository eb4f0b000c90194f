//! # 传输能力面
//!
//! ## 意图（Why）
//! - 槽位状态机只依赖一组很窄的传输能力：非阻塞关闭、发送队列计数、带“后续还有数据”提示的写入、
//!   关闭超时设置、取出待接受连接，以及一个固定的结果词汇表；
//! - 以 trait 隔离具体协议栈，既能接入 Tokio 套接字（见 `spark-transport-tcp`），也能在测试中
//!   注入脚本化实现。
//!
//! ## 契约（What）
//! - 端点由传输层拥有，槽位只持有 [`EndpointId`]；传输层可以在任意时刻（例如收到 RST）让端点失效，
//!   此后所有查询返回 `None`，调用方必须把 `None` 当作正常控制流处理；
//! - 所有方法均以 `&self` 调用，实现者需自行保证内部同步，且任何方法都不得无界阻塞调用线程。
//!
//! ## 结果分类（How）
//! - [`TransportStatus::class`] 把结果划分为 `Retryable`、`RemoteClosed`、`Benign`、`Fatal` 与
//!   `Success`；分类错误属于正确性缺陷，而非风格问题，因此集中在一个函数中维护。

use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// 传输层分配的端点句柄。
///
/// 句柄本身不保证端点仍然存活；每次使用都需要经过传输层的有效性检查。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EndpointId(u64);

impl EndpointId {
    /// 由原始整数构造句柄。
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 读取原始整数。
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// 致命错误的细分种类。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FatalKind {
    /// 端点未处于可操作的连接状态。
    NotConnected,
    /// 对端拒绝连接。
    ConnectionRefused,
    /// 路由不可达。
    Unreachable,
    /// 参数非法，例如目标地址无效。
    InvalidInput,
    /// 本地端口已被占用。
    AddressInUse,
    /// 其它未分类的底层错误。
    Other,
}

impl FatalKind {
    /// 稳定的机器可读名称。
    pub const fn as_str(self) -> &'static str {
        match self {
            FatalKind::NotConnected => "not-connected",
            FatalKind::ConnectionRefused => "connection-refused",
            FatalKind::Unreachable => "unreachable",
            FatalKind::InvalidInput => "invalid-input",
            FatalKind::AddressInUse => "address-in-use",
            FatalKind::Other => "other",
        }
    }
}

/// 传输层返回的结果词汇表。
///
/// # 教案式说明
/// - **意图 (Why)**：以固定、封闭的词汇描述底层协议栈的反馈，避免上层直接解析平台错误码；
/// - **契约 (What)**：`Ok` 表示调用按预期完成；其余变体的语义由 [`TransportStatus::class`] 决定；
/// - **风险 (Trade-offs)**：`EndOfStream` 与 `ConnectionReset` 是对基础词汇的扩展，二者与
///   `ConnectionAbortedByPeer` 同属“对端发起关闭”。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportStatus {
    /// 操作完成。
    Ok,
    /// 发送/接收缓冲暂时不可用。
    WouldBlock,
    /// 协议栈暂时无法分配内存。
    TransientNoMemory,
    /// 对端中止了连接。
    ConnectionAbortedByPeer,
    /// 对端复位了连接。
    ConnectionReset,
    /// 对端发送了 FIN，读方向已到达流末尾。
    EndOfStream,
    /// 非阻塞轮询返回的超时类结果。
    Timeout,
    /// 不可恢复的错误。
    Fatal(FatalKind),
}

/// [`TransportStatus`] 的语义分区。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResultClass {
    /// 调用成功。
    Success,
    /// 可重试：不终止连接，也不推进请求所在的操作。
    Retryable,
    /// 对端发起的关闭：转入 `OtherEndClosed`，而非硬终止。
    RemoteClosed,
    /// 轮询语境下的良性结果：忽略。
    Benign,
    /// 致命：驱动 `terminate`。
    Fatal,
}

impl TransportStatus {
    /// 将结果归入 [`ResultClass`]。
    pub const fn class(self) -> ResultClass {
        match self {
            TransportStatus::Ok => ResultClass::Success,
            TransportStatus::WouldBlock | TransportStatus::TransientNoMemory => {
                ResultClass::Retryable
            }
            TransportStatus::ConnectionAbortedByPeer
            | TransportStatus::ConnectionReset
            | TransportStatus::EndOfStream => ResultClass::RemoteClosed,
            TransportStatus::Timeout => ResultClass::Benign,
            TransportStatus::Fatal(_) => ResultClass::Fatal,
        }
    }

    /// 是否为可重试结果。
    pub const fn is_retryable(self) -> bool {
        matches!(self.class(), ResultClass::Retryable)
    }

    /// 是否为致命结果。
    pub const fn is_fatal(self) -> bool {
        matches!(self.class(), ResultClass::Fatal)
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Ok => f.write_str("ok"),
            TransportStatus::WouldBlock => f.write_str("would-block"),
            TransportStatus::TransientNoMemory => f.write_str("transient-no-memory"),
            TransportStatus::ConnectionAbortedByPeer => f.write_str("connection-aborted-by-peer"),
            TransportStatus::ConnectionReset => f.write_str("connection-reset"),
            TransportStatus::EndOfStream => f.write_str("end-of-stream"),
            TransportStatus::Timeout => f.write_str("timeout"),
            TransportStatus::Fatal(kind) => write!(f, "fatal({})", kind.as_str()),
        }
    }
}

/// 单次传输层写入的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteOutcome {
    /// 传输层实际接收的字节数。
    pub consumed: usize,
    /// 本次调用的结果码。
    pub status: TransportStatus,
}

impl WriteOutcome {
    /// 构造写入结果。
    pub const fn new(consumed: usize, status: TransportStatus) -> Self {
        Self { consumed, status }
    }
}

/// 单次传输层读取的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadOutcome {
    /// 实际读到的字节数。
    pub read: usize,
    /// 本次调用的结果码。
    pub status: TransportStatus,
}

impl ReadOutcome {
    /// 构造读取结果。
    pub const fn new(read: usize, status: TransportStatus) -> Self {
        Self { read, status }
    }
}

/// 主动连接的推进情况。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectProgress {
    /// 握手仍在进行。
    InProgress,
    /// 连接已建立。
    Established,
    /// 连接失败。
    Failed(TransportStatus),
}

/// 传输层在其自身执行上下文中通知“有新的入站连接”。
///
/// 实现必须是非阻塞的：它可能在中断或回调语境中被调用。
pub trait InboundNotifier: Send + Sync + 'static {
    /// 新的入站连接已可通过 [`Transport::accept_pending`] 取出。
    fn inbound_ready(&self);
}

/// 连接管理层所消费的传输能力面。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把协议栈的重传、拥塞控制等内部细节留在边界之外，状态机只观察计数与结果码；
/// - 允许传输层在自己的执行上下文中随时释放端点，连接层以“查询返回 `None`”感知失效。
///
/// ## 契约（What）
/// - 查询类方法（`query_unsent`/`query_unacknowledged`/`bytes_available`/`send_capacity`/
///   `connect_progress`）在端点已失效时返回 `None`；
/// - `write` 返回实际接收的字节数，永远不超过 `bytes.len()`；`more_coming = true` 表示调用方
///   马上还会继续写入，传输层可以推迟推送；
/// - `initiate_close` 仅发起关闭，不得等待四次挥手完成；阻塞上限由之前的 `set_close_timeout` 决定；
/// - `release_endpoint` 之后句柄不再可用，重复释放必须是无害的空操作；
/// - `accept_pending` 取出一条已完成握手、尚未被接受的入站连接。
///
/// ## 注意事项（Trade-offs）
/// - 所有方法都可能与传输层内部线程并发执行，实现者不能假设调用期间协议栈处于静止状态。
pub trait Transport: Send + Sync + 'static {
    /// 发起非阻塞的主动连接，仅报告参数校验或资源准备阶段的失败。
    fn connect(&self, target: SocketAddr) -> Result<EndpointId, TransportStatus>;

    /// 查询主动连接的进度。
    fn connect_progress(&self, endpoint: EndpointId) -> Option<ConnectProgress>;

    /// 写入数据，返回实际接收的字节数与结果码。
    fn write(&self, endpoint: EndpointId, bytes: &[u8], more_coming: bool) -> WriteOutcome;

    /// 读取已到达的数据。
    fn read(&self, endpoint: EndpointId, buf: &mut [u8]) -> ReadOutcome;

    /// 已到达但尚未读取的字节数。
    fn bytes_available(&self, endpoint: EndpointId) -> Option<usize>;

    /// 当前可立即接收的写入字节数。
    fn send_capacity(&self, endpoint: EndpointId) -> Option<usize>;

    /// 已交给本层但尚未进入协议栈输出路径的字节数。
    fn query_unsent(&self, endpoint: EndpointId) -> Option<usize>;

    /// 已发送但尚未被对端确认的字节数。
    fn query_unacknowledged(&self, endpoint: EndpointId) -> Option<usize>;

    /// 设置关闭阶段允许阻塞的上限。
    fn set_close_timeout(&self, endpoint: EndpointId, timeout: Duration);

    /// 发起非阻塞关闭。
    fn initiate_close(&self, endpoint: EndpointId, timeout_hint: Duration);

    /// 释放端点资源。
    fn release_endpoint(&self, endpoint: EndpointId);

    /// 绑定端口并开始接受入站连接；新连接到达时调用 `notifier`。
    fn listen(&self, port: u16, notifier: Arc<dyn InboundNotifier>)
    -> Result<(), TransportStatus>;

    /// 停止监听端口。
    fn unlisten(&self, port: u16);

    /// 取出一条待接受的入站连接。
    fn accept_pending(&self, port: u16) -> Option<EndpointId>;

    /// 端点是否仍然有效。
    fn is_alive(&self, endpoint: EndpointId) -> bool {
        self.query_unsent(endpoint).is_some()
    }
}
