//! # 宿主门面
//!
//! [`SocketServer`] 把连接池、监听器注册表与接受线程组装在一起，对应宿主协议中的
//! `listen`、`stop`、`connect`、`status` 与驱动循环入口。

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::accept::{AcceptConsumer, AcceptWorker};
use crate::clock::{Clock, SystemClock};
use crate::config::SocketServerConfig;
use crate::error::{Result, SocketError};
use crate::listener::{self, Listener, ListenerId, StopReport};
use crate::pool::{SlotHandle, SlotPool};
use crate::status::PoolStatus;
use crate::transport::Transport;

struct ListenerEntry {
    listener: Arc<Listener>,
    worker: Option<AcceptWorker>,
}

/// 连接管理层的门面。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 宿主只需面对一个对象：开监听、发起连接、驱动状态机、查询状态；
///
/// ## 契约（What）
/// - 同一端口至多一个监听器，重复 `listen` 返回 [`SocketError::PortInUse`]；
/// - `connect` 在失败时不会泄漏槽位；
/// - `Drop` 时停止所有监听器并以非外部方式终止所有连接。
///
/// ## 注意事项（Trade-offs）
/// - 注册表锁只在增删监听器时短暂持有，`stop` 在锁外执行。
pub struct SocketServer {
    config: SocketServerConfig,
    transport: Arc<dyn Transport>,
    pool: Arc<SlotPool>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
}

impl SocketServer {
    /// 以系统时钟构造。
    pub fn new(config: SocketServerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// 以注入的时钟构造。
    pub fn with_clock(
        config: SocketServerConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(SlotPool::new(
            config.slot_count,
            Arc::clone(&transport),
            clock,
            config.timings(),
        ));
        info!(slots = config.slot_count, "socket server ready");
        Ok(Self {
            config,
            transport,
            pool,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        })
    }

    /// 当前配置。
    pub fn config(&self) -> &SocketServerConfig {
        &self.config
    }

    /// 连接池；单槽操作（读写、关闭、释放）都通过它进行。
    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    /// 在 `port` 上开始监听并启动接受线程。
    pub fn listen(&self, port: u16) -> Result<Arc<Listener>> {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|entry| entry.listener.port() == port) {
            return Err(SocketError::PortInUse { port });
        }
        let id = ListenerId::from_raw(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let listener = Listener::start(
            id,
            port,
            self.config.backlog_capacity,
            Arc::clone(&self.transport),
        )?;
        listener::watch(&self.pool, &listener);
        let consumer = AcceptConsumer::new(
            Arc::clone(&listener),
            Arc::clone(&self.pool),
            Arc::clone(&self.transport),
            self.config.allocate_timeout(),
        );
        let worker = match consumer.spawn() {
            Ok(worker) => worker,
            Err(err) => {
                warn!(port, %err, "failed to spawn accept consumer");
                listener.stop(&self.pool);
                return Err(SocketError::ListenerStopped { port });
            }
        };
        listeners.push(ListenerEntry {
            listener: Arc::clone(&listener),
            worker: Some(worker),
        });
        Ok(listener)
    }

    /// 查找端口上的监听器。
    pub fn listener(&self, port: u16) -> Option<Arc<Listener>> {
        self.listeners
            .lock()
            .iter()
            .find(|entry| entry.listener.port() == port)
            .map(|entry| Arc::clone(&entry.listener))
    }

    /// 停止端口上的监听器，等待其接受线程退出。
    pub fn stop_listener(&self, port: u16) -> Result<StopReport> {
        let entry = {
            let mut listeners = self.listeners.lock();
            let index = listeners
                .iter()
                .position(|entry| entry.listener.port() == port)
                .ok_or(SocketError::ListenerStopped { port })?;
            listeners.swap_remove(index)
        };
        let report = entry.listener.stop(&self.pool);
        if let Some(worker) = entry.worker {
            worker.join();
        }
        Ok(report)
    }

    /// 分配槽位并发起主动连接。
    pub fn connect(&self, target: SocketAddr) -> Result<SlotHandle> {
        let handle = self.pool.allocate(self.config.allocate_timeout())?;
        self.pool.connect(handle, target)?;
        Ok(handle)
    }

    /// 驱动循环的一个周期。
    pub fn poll_all(&self) -> usize {
        self.pool.poll_all()
    }

    /// 状态报告。
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// 停止所有监听器并终止所有连接。
    pub fn shutdown(&self) {
        let entries: Vec<ListenerEntry> = self.listeners.lock().drain(..).collect();
        for entry in entries {
            entry.listener.stop(&self.pool);
            if let Some(worker) = entry.worker {
                worker.join();
            }
        }
        self.pool.terminate_all();
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
