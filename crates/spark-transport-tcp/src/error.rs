use std::io;

use spark_sockets::{FatalKind, TransportStatus};
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 构造传输层实例时的错误。
#[derive(Debug, Error)]
pub enum TcpTransportError {
    /// 传输层自有的 Tokio 运行时无法启动。
    #[error("spark.transport.tcp.runtime_failed: tokio runtime: {0}")]
    Runtime(#[source] io::Error),
    /// 配置非法。
    #[error("spark.transport.tcp.invalid_config: {0}")]
    InvalidConfig(&'static str),
}

impl TcpTransportError {
    /// 稳定错误码。
    pub const fn code(&self) -> &'static str {
        match self {
            TcpTransportError::Runtime(_) => "spark.transport.tcp.runtime_failed",
            TcpTransportError::InvalidConfig(_) => "spark.transport.tcp.invalid_config",
        }
    }
}

/// 将 IO 错误映射为连接层的结果词汇，并以稳定错误码记录一次调试事件。
///
/// # 契约
/// - 对端主动断开（RST、中止、管道破裂）归入 `RemoteClosed` 一类，交给状态机走
///   `OtherEndClosed`；
/// - `WouldBlock`/`Interrupted` 映射为可重试；内存不足映射为 `TransientNoMemory`；
/// - 其余错误一律视为致命，细分为 [`FatalKind`]。
pub(crate) fn map_io_error(kind: OperationKind, error: &io::Error) -> TransportStatus {
    let status = categorize_io_error(error);
    tracing::debug!(
        code = kind.code,
        op = kind.message,
        %error,
        %status,
        "io error mapped"
    );
    status
}

fn categorize_io_error(error: &io::Error) -> TransportStatus {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => TransportStatus::WouldBlock,
        ErrorKind::OutOfMemory => TransportStatus::TransientNoMemory,
        ErrorKind::TimedOut => TransportStatus::Timeout,
        ErrorKind::ConnectionReset => TransportStatus::ConnectionReset,
        ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            TransportStatus::ConnectionAbortedByPeer
        }
        ErrorKind::UnexpectedEof => TransportStatus::EndOfStream,
        ErrorKind::ConnectionRefused => TransportStatus::Fatal(FatalKind::ConnectionRefused),
        ErrorKind::NotConnected => TransportStatus::Fatal(FatalKind::NotConnected),
        ErrorKind::AddrInUse => TransportStatus::Fatal(FatalKind::AddressInUse),
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
            TransportStatus::Fatal(FatalKind::Unreachable)
        }
        ErrorKind::InvalidInput | ErrorKind::AddrNotAvailable => {
            TransportStatus::Fatal(FatalKind::InvalidInput)
        }
        _ => TransportStatus::Fatal(FatalKind::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_driven_errors_are_remote_closed() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            let status = map_io_error(READ, &io::Error::from(kind));
            assert_eq!(
                status.class(),
                spark_sockets::ResultClass::RemoteClosed,
                "{kind:?}"
            );
        }
    }

    #[test]
    fn bind_conflict_is_address_in_use() {
        assert_eq!(
            map_io_error(BIND, &io::Error::from(io::ErrorKind::AddrInUse)),
            TransportStatus::Fatal(FatalKind::AddressInUse)
        );
        assert!(map_io_error(WRITE, &io::Error::from(io::ErrorKind::WouldBlock)).is_retryable());
    }
}
