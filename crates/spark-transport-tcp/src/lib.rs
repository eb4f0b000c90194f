#![deny(unsafe_code)]
#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- 为 `spark-sockets` 的 [`Transport`](spark_sockets::Transport) 能力面提供真实 TCP 实现；
- 连接层的调用全部是同步、有界的记账操作，协议推进（握手、推送、接收、FIN/RST）发生在
  传输层自己持有的 Tokio 运行时中。

## 核心契约（What）
- [`TokioTransport`] 实现 `Transport` 的全部方法，端点失效后查询统一返回 `None`；
- 关闭超时通过两种方式落地：在超时内完成推送与 FIN，否则以 `SO_LINGER = 0` 复位连接；
- IO 错误经稳定错误码（`spark.transport.tcp.*`）记录，并映射为连接层的结果词汇。

## 实现策略（How）
- `socket2` 负责监听套接字的地址复用与 `listen(2)` 参数，以及关闭时的 `SO_LINGER`；
- 每个端点一个驱动任务独占 `TcpStream`，用户态收发缓冲由 `bytes::BytesMut` 承载，
  二者之间以 `parking_lot::Mutex` 与 `tokio::sync::Notify` 衔接。

## 风险与考量（Trade-offs）
- 内核发送队列不可见，“未确认”字节数只覆盖正在写入内核的部分；
- 用户态缓冲有上限，超过上限的写入得到 `WouldBlock`，由连接层的有界重试吸收。
"#]

mod config;
mod endpoint;
mod error;
mod listener;
mod transport;

pub use config::TcpTransportConfig;
pub use error::TcpTransportError;
pub use transport::TokioTransport;
