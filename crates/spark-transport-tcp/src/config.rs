use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::TcpTransportError;

/// Tokio 传输层的构造参数。
///
/// # 教案式说明
/// - **意图 (Why)**：把运行时规模、用户态缓冲上限与套接字选项集中到一个值对象，
///   便于在测试中缩小缓冲以触发背压；
/// - **契约 (What)**：缓冲上限均以字节计，必须大于零；`worker_threads` 至少为 1；
/// - **注意事项 (Trade-offs)**：发送缓冲越大，`query_unsent` 归零所需时间越长，
///   关闭排空也越慢。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TcpTransportConfig {
    worker_threads: usize,
    bind_ip: IpAddr,
    listen_backlog: u32,
    send_buffer_limit: usize,
    receive_buffer_limit: usize,
    read_chunk: usize,
    nodelay: bool,
    connect_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransportConfig {
    /// 默认配置：两个工作线程、监听所有 IPv4 地址、8 KiB 收发缓冲。
    pub const fn new() -> Self {
        Self {
            worker_threads: 2,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_backlog: 16,
            send_buffer_limit: 8 * 1024,
            receive_buffer_limit: 8 * 1024,
            read_chunk: 2 * 1024,
            nodelay: true,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// 设置运行时工作线程数。
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// 设置监听地址。
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// 设置内核 `listen(2)` 队列长度。
    pub fn with_listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// 设置每个端点用户态发送队列的上限。
    pub fn with_send_buffer_limit(mut self, bytes: usize) -> Self {
        self.send_buffer_limit = bytes;
        self
    }

    /// 设置每个端点用户态接收缓冲的上限。
    pub fn with_receive_buffer_limit(mut self, bytes: usize) -> Self {
        self.receive_buffer_limit = bytes;
        self
    }

    /// 设置 `TCP_NODELAY`。
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置主动连接的握手超时。
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    pub fn listen_backlog(&self) -> u32 {
        self.listen_backlog
    }

    pub fn send_buffer_limit(&self) -> usize {
        self.send_buffer_limit
    }

    pub fn receive_buffer_limit(&self) -> usize {
        self.receive_buffer_limit
    }

    pub(crate) fn read_chunk(&self) -> usize {
        self.read_chunk.min(self.receive_buffer_limit)
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// 校验配置。
    pub fn validate(&self) -> Result<(), TcpTransportError> {
        if self.worker_threads == 0 {
            return Err(TcpTransportError::InvalidConfig("worker_threads must be >= 1"));
        }
        if self.send_buffer_limit == 0 {
            return Err(TcpTransportError::InvalidConfig(
                "send_buffer_limit must be > 0",
            ));
        }
        if self.receive_buffer_limit == 0 {
            return Err(TcpTransportError::InvalidConfig(
                "receive_buffer_limit must be > 0",
            ));
        }
        if self.listen_backlog == 0 {
            return Err(TcpTransportError::InvalidConfig("listen_backlog must be > 0"));
        }
        Ok(())
    }
}
