//! 监听端口与接受任务。
//!
//! # 教案式说明
//! - **意图 (Why)**：入站握手在传输层自己的运行时中完成，完成后以 `InboundNotifier` 告知连接层，
//!   连接层再通过 `accept_pending` 取走端点；
//! - **逻辑 (How)**：`socket2` 负责创建、复用地址与 `listen(2)`，之后交给 Tokio 异步接受；
//!   每个被接受的流立即注册为端点并启动驱动任务，端点 ID 追加到端口的待接受队列；
//! - **契约 (What)**：停止监听只终止接受任务，已进入待接受队列的端点保留到被取走为止；
//! - **注意事项 (Trade-offs)**：接受错误（例如文件描述符耗尽）只记录告警并短暂退避，不会终止监听。

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use spark_sockets::{EndpointId, InboundNotifier};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TcpTransportConfig;
use crate::endpoint::{self, Endpoint};
use crate::error::{self, map_io_error};
use crate::transport::Registry;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// 单个监听端口的记账。
#[derive(Debug)]
pub(crate) struct PortEntry {
    pub(crate) local_addr: SocketAddr,
    pub(crate) pending: Arc<Mutex<VecDeque<EndpointId>>>,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl PortEntry {
    pub(crate) fn is_listening(&self) -> bool {
        self.task.is_some()
    }

    /// 终止接受任务，保留待接受队列。
    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// 创建非阻塞的标准库监听套接字。
pub(crate) fn bind(config: &TcpTransportConfig, port: u16) -> io::Result<StdTcpListener> {
    let addr = SocketAddr::new(config.bind_ip(), port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    let backlog = i32::try_from(config.listen_backlog()).unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// 接受循环：注册端点、启动驱动任务并通知连接层。
pub(crate) async fn accept_loop(
    listener: TcpListener,
    port: u16,
    registry: Arc<Registry>,
    pending: Arc<Mutex<VecDeque<EndpointId>>>,
    notifier: Arc<dyn InboundNotifier>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                endpoint::configure(&stream, registry.config());
                let endpoint = registry.register(Endpoint::established);
                let id = endpoint.id();
                tokio::spawn(endpoint.drive(stream, Arc::clone(registry.config_arc())));
                pending.lock().push_back(id);
                debug!(port, %peer, endpoint = %id, "inbound connection established");
                notifier.inbound_ready();
            }
            Err(err) => {
                let status = map_io_error(error::ACCEPT, &err);
                warn!(port, code = error::ACCEPT.code, %status, "accept failed, backing off");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
