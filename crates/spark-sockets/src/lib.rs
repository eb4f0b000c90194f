#![deny(unsafe_code)]
#![doc = r#"
# spark-sockets

## 设计动机（Why）
- **定位**：嵌入式宿主上的 TCP 连接管理层。宿主以单线程驱动循环同时服务一条同步链路，
  任何连接操作都不能让这条循环停顿；
- **核心问题**：协议栈的阻塞式关闭在高延迟链路上会等待四次挥手完成。本 crate 把关闭拆成
  “记账”与“推进”两段，推进由驱动循环的 `poll` 以截止时间约束完成；
- **架构角色**：位于宿主协议处理与具体协议栈之间，通过 [`Transport`] trait 与协议栈解耦，
  Tokio 实现见 `spark-transport-tcp`。

## 核心契约（What）
- **槽位**：固定数量的 [`Connection`] 由 [`SlotPool`] 持有，`allocate` 有界等待，`release` 幂等；
- **关闭**：`close` O(1) 返回；`poll` 在未发送与未确认计数同时归零或到达 `max_send_wait` 时回收，
  两条路径分别使用较宽与最小的关闭超时；
- **监听**：[`Listener`] 维护有界积压队列，溢出的入站连接被接受后立即关闭；
  [`AcceptConsumer`] 在唤醒信号上阻塞，由新连接或槽位回收唤醒；
- **错误**：可重试结果、空句柄、端点失效都是正常控制流，只有调用时序错误与资源耗尽才以
  [`SocketError`] 报告。

## 实现策略（How）
- **锁分层**：池簿记锁在外、槽位锁在内，持有簿记锁时从不获取槽位锁，监听器唤醒在所有锁释放后进行；
- **弱回指**：槽位通过 [`ListenerLink`] 弱引用所属监听器，监听器停止只需清除回指；
- **可观测性**：状态跃迁以 `tracing::debug!` 记录，强制回收与积压溢出以 `warn!` 记录。

## 风险与考量（Trade-offs）
- 槽位锁在传输层调用期间保持，[`Transport`] 实现必须保证每个方法有界返回；
- `allocate` 的等待使用真实时间，而关闭截止判定使用注入的 [`Clock`]，测试需分别控制两者。
"#]

mod accept;
mod clock;
mod config;
mod connection;
mod error;
mod listener;
mod pool;
mod server;
mod state;
mod status;
mod transport;
mod wake;

#[cfg(any(test, feature = "test-util"))]
pub mod test_stubs;

pub use accept::{AcceptConsumer, AcceptWorker, DrainReport};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{
    ConnectionTimings, DEFAULT_DRAINED_CLOSE_TIMEOUT, DEFAULT_FORCED_CLOSE_TIMEOUT,
    DEFAULT_MAX_SEND_WAIT, SocketServerConfig,
};
pub use connection::{Connection, PushHint, ReadReport, WriteReport};
pub use error::{Result, SocketError};
pub use listener::{Admission, Listener, ListenerId, ListenerLink, StopReport};
pub use pool::{SlotHandle, SlotPool};
pub use server::SocketServer;
pub use state::SlotState;
pub use status::{PoolStatus, SlotStatus};
pub use transport::{
    ConnectProgress, EndpointId, FatalKind, InboundNotifier, ReadOutcome, ResultClass, Transport,
    TransportStatus, WriteOutcome,
};
pub use wake::{WakeReason, WakeSignal};
