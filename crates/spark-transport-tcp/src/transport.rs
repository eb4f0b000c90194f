use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use spark_sockets::{
    ConnectProgress, EndpointId, FatalKind, InboundNotifier, ReadOutcome, Transport,
    TransportStatus, WriteOutcome,
};
use tokio::net::TcpListener;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use crate::config::TcpTransportConfig;
use crate::endpoint::Endpoint;
use crate::error::{self, TcpTransportError, map_io_error};
use crate::listener::{self, PortEntry};

/// 端点注册表，由传输层与其接受任务共享。
#[derive(Debug)]
pub(crate) struct Registry {
    config: Arc<TcpTransportConfig>,
    endpoints: Mutex<HashMap<EndpointId, Arc<Endpoint>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
            endpoints: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    pub(crate) fn config_arc(&self) -> &Arc<TcpTransportConfig> {
        &self.config
    }

    pub(crate) fn register(&self, make: impl FnOnce(EndpointId) -> Arc<Endpoint>) -> Arc<Endpoint> {
        let id = EndpointId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let endpoint = make(id);
        self.endpoints.lock().insert(id, Arc::clone(&endpoint));
        endpoint
    }

    fn get(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(&id).cloned()
    }

    fn remove(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().remove(&id)
    }

    fn len(&self) -> usize {
        self.endpoints.lock().len()
    }
}

/// 基于 Tokio 的 [`Transport`] 实现。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接层要求传输层在“自己的执行上下文”中推进协议并异步宣告入站连接；
///   本类型持有一个专属的多线程 Tokio 运行时承担这一角色，调用方线程只做记账；
///
/// ## 逻辑（How）
/// - 所有 [`Transport`] 方法都是对注册表与端点缓冲的短暂加锁操作，从不 `block_on`；
/// - `connect`/`listen` 把握手与接受交给运行时任务，结果通过端点相位与通知器回传；
/// - `initiate_close` 只登记关闭请求，FIN/RST 由端点驱动任务在关闭超时内完成；
///
/// ## 契约（What）
/// - `release_endpoint` 从注册表移除端点，此后所有查询返回 `None`；未关闭的端点以零超时关闭；
/// - 同一端口重复 `listen` 返回 `Fatal(AddressInUse)`；`unlisten` 之后待接受的端点仍可取出；
///
/// ## 注意事项（Trade-offs）
/// - `query_unacknowledged` 只统计正在写入内核的字节，内核发送队列不可见；
/// - 运行时在 `Drop` 中以后台方式关闭，不等待仍在进行的 FIN。
pub struct TokioTransport {
    runtime: Option<Runtime>,
    handle: Handle,
    registry: Arc<Registry>,
    ports: Mutex<HashMap<u16, PortEntry>>,
}

impl TokioTransport {
    /// 使用默认配置创建传输层。
    pub fn new() -> Result<Arc<Self>, TcpTransportError> {
        Self::with_config(TcpTransportConfig::default())
    }

    /// 使用给定配置创建传输层及其专属运行时。
    pub fn with_config(config: TcpTransportConfig) -> Result<Arc<Self>, TcpTransportError> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .thread_name("spark-tcp")
            .enable_io()
            .enable_time()
            .build()
            .map_err(TcpTransportError::Runtime)?;
        let handle = runtime.handle().clone();
        info!(
            workers = config.worker_threads(),
            send_limit = config.send_buffer_limit(),
            receive_limit = config.receive_buffer_limit(),
            "tokio transport started"
        );
        Ok(Arc::new(Self {
            runtime: Some(runtime),
            handle,
            registry: Arc::new(Registry::new(config)),
            ports: Mutex::new(HashMap::new()),
        }))
    }

    /// 当前配置。
    pub fn config(&self) -> &TcpTransportConfig {
        self.registry.config()
    }

    /// 监听端口实际绑定的地址；以端口 0 监听时用于获知内核分配的端口。
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.ports.lock().get(&port).map(|entry| entry.local_addr)
    }

    /// 注册表中仍存活的端点数量。
    pub fn live_endpoints(&self) -> usize {
        self.registry.len()
    }

    fn endpoint(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.registry.get(id)
    }

    fn discard(&self, pending: VecDeque<EndpointId>) {
        for id in pending {
            if let Some(endpoint) = self.registry.remove(id) {
                endpoint.request_close(Duration::ZERO);
            }
        }
    }
}

impl Transport for TokioTransport {
    fn connect(&self, target: SocketAddr) -> Result<EndpointId, TransportStatus> {
        if target.port() == 0 || target.ip().is_unspecified() || target.ip().is_multicast() {
            return Err(TransportStatus::Fatal(FatalKind::InvalidInput));
        }
        let endpoint = self.registry.register(Endpoint::connecting);
        let id = endpoint.id();
        self.handle.spawn(endpoint.connect_and_drive(
            target,
            Arc::clone(self.registry.config_arc()),
        ));
        debug!(endpoint = %id, %target, "outbound connection initiated");
        Ok(id)
    }

    fn connect_progress(&self, endpoint: EndpointId) -> Option<ConnectProgress> {
        self.endpoint(endpoint).map(|ep| ep.progress())
    }

    fn write(&self, endpoint: EndpointId, bytes: &[u8], more_coming: bool) -> WriteOutcome {
        match self.endpoint(endpoint) {
            Some(ep) => ep.write(bytes, more_coming, self.config().send_buffer_limit()),
            None => WriteOutcome::new(0, TransportStatus::Fatal(FatalKind::NotConnected)),
        }
    }

    fn read(&self, endpoint: EndpointId, buf: &mut [u8]) -> ReadOutcome {
        match self.endpoint(endpoint) {
            Some(ep) => ep.read(buf),
            None => ReadOutcome::new(0, TransportStatus::Fatal(FatalKind::NotConnected)),
        }
    }

    fn bytes_available(&self, endpoint: EndpointId) -> Option<usize> {
        self.endpoint(endpoint).map(|ep| ep.available())
    }

    fn send_capacity(&self, endpoint: EndpointId) -> Option<usize> {
        self.endpoint(endpoint)
            .map(|ep| ep.capacity(self.config().send_buffer_limit()))
    }

    fn query_unsent(&self, endpoint: EndpointId) -> Option<usize> {
        self.endpoint(endpoint).map(|ep| ep.unsent())
    }

    fn query_unacknowledged(&self, endpoint: EndpointId) -> Option<usize> {
        self.endpoint(endpoint).map(|ep| ep.unacknowledged())
    }

    fn set_close_timeout(&self, endpoint: EndpointId, timeout: Duration) {
        if let Some(ep) = self.endpoint(endpoint) {
            ep.set_close_timeout(timeout);
        }
    }

    fn initiate_close(&self, endpoint: EndpointId, timeout_hint: Duration) {
        if let Some(ep) = self.endpoint(endpoint) {
            ep.request_close(timeout_hint);
        }
    }

    fn release_endpoint(&self, endpoint: EndpointId) {
        if let Some(ep) = self.registry.remove(endpoint) {
            ep.request_close(Duration::ZERO);
            debug!(endpoint = %endpoint, "endpoint released");
        }
    }

    fn listen(
        &self,
        port: u16,
        notifier: Arc<dyn InboundNotifier>,
    ) -> Result<(), TransportStatus> {
        let mut ports = self.ports.lock();
        let leftover = match ports.get_mut(&port) {
            Some(entry) if entry.is_listening() => {
                return Err(TransportStatus::Fatal(FatalKind::AddressInUse));
            }
            Some(entry) => std::mem::take(&mut *entry.pending.lock()),
            None => VecDeque::new(),
        };
        self.discard(leftover);

        let bound = listener::bind(self.config(), port).map_err(|err| {
            let status = map_io_error(error::BIND, &err);
            warn!(port, code = error::BIND.code, %status, "listen failed");
            status
        })?;
        let local_addr = bound
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, &err))?;
        let tokio_listener = {
            let _guard = self.handle.enter();
            TcpListener::from_std(bound).map_err(|err| map_io_error(error::BIND, &err))?
        };

        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let task = self.handle.spawn(listener::accept_loop(
            tokio_listener,
            port,
            Arc::clone(&self.registry),
            Arc::clone(&pending),
            notifier,
        ));
        ports.insert(
            port,
            PortEntry {
                local_addr,
                pending,
                task: Some(task),
            },
        );
        info!(port, %local_addr, "tcp listener bound");
        Ok(())
    }

    fn unlisten(&self, port: u16) {
        let mut ports = self.ports.lock();
        let Some(entry) = ports.get_mut(&port) else {
            return;
        };
        entry.stop();
        if entry.pending.lock().is_empty() {
            ports.remove(&port);
        }
        info!(port, "tcp listener unbound");
    }

    fn accept_pending(&self, port: u16) -> Option<EndpointId> {
        let mut ports = self.ports.lock();
        let entry = ports.get(&port)?;
        let next = entry.pending.lock().pop_front();
        if next.is_none() && !entry.is_listening() {
            ports.remove(&port);
        }
        next
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        for entry in self.ports.get_mut().values_mut() {
            entry.stop();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
