//! # 接受消费者
//!
//! ## 意图（Why）
//! - 传输层宣告新连接的上下文不能阻塞，绑定槽位需要 `allocate` 的有界等待，
//!   因此由一个独立线程在唤醒信号上阻塞，醒来后把积压队列排空到槽位；
//! - 槽位回收同样会唤醒它：没有这条路径，所有槽位空闲后积压连接也不会再被服务。
//!
//! ## 契约（What）
//! - 每次醒来都穷尽地排空积压队列；遇到池耗尽时把连接放回队首，回到等待；
//! - 绑定完成后若监听器已停止，槽位立即释放，不进入已接受队列；
//! - 唤醒信号关闭（监听器停止）后线程退出。

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::SocketError;
use crate::listener::Listener;
use crate::pool::SlotPool;
use crate::transport::Transport;
use crate::wake::WakeReason;

/// 一次排空的结果。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DrainReport {
    /// 绑定到槽位的连接数。
    pub bound: usize,
    /// 端点在排队期间失效，或绑定时监听器已停止而被丢弃的连接数。
    pub discarded: usize,
    /// 因池耗尽而放回队首。
    pub starved: bool,
}

/// 单个监听器的接受消费者。
pub struct AcceptConsumer {
    listener: Arc<Listener>,
    pool: Arc<SlotPool>,
    transport: Arc<dyn Transport>,
    allocate_timeout: Duration,
}

impl AcceptConsumer {
    /// 构造消费者；`allocate_timeout` 为每条积压连接等待槽位的上限。
    pub fn new(
        listener: Arc<Listener>,
        pool: Arc<SlotPool>,
        transport: Arc<dyn Transport>,
        allocate_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            pool,
            transport,
            allocate_timeout,
        }
    }

    /// 排空积压队列。
    ///
    /// # 教案级注释
    ///
    /// ## 实现逻辑（How）
    /// 1. 按积压容量从传输层补充连接，逐条弹出：端点已失效的直接释放，否则 `allocate` 并绑定；
    /// 2. `allocate` 超时则把连接放回队首并结束本轮；
    /// 3. 结束前再取一次传输层的待接受连接，此时放不进积压队列的一律接受并关闭。
    ///
    /// ## 契约（What）
    /// - 返回时要么积压队列为空，要么 `starved = true`；
    /// - 绑定成功的槽位进入监听器的已接受队列，由宿主通过 `next_accepted` 取走。
    pub fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            self.listener.fill_backlog();
            let Some(endpoint) = self.listener.pop_backlog() else {
                break;
            };
            if self.listener.is_stopped() {
                self.listener.requeue_front(endpoint);
                break;
            }
            if !self.transport.is_alive(endpoint) {
                debug!(port = self.listener.port(), %endpoint, "queued inbound vanished");
                self.transport.release_endpoint(endpoint);
                report.discarded += 1;
                continue;
            }
            let handle = match self.pool.allocate(self.allocate_timeout) {
                Ok(handle) => handle,
                Err(SocketError::NoSlotAvailable { .. }) => {
                    self.listener.requeue_front(endpoint);
                    report.starved = true;
                    break;
                }
                Err(err) => {
                    warn!(port = self.listener.port(), %err, "unexpected allocate failure");
                    self.listener.requeue_front(endpoint);
                    report.starved = true;
                    break;
                }
            };
            match self
                .pool
                .bind_accepted(handle, endpoint, self.listener.link())
            {
                Ok(()) if self.listener.is_stopped() => {
                    // `stop` 先置位标记再在槽位锁内清除回指；绑定同样在槽位锁内完成，
                    // 因此这里读到“未停止”时回指必然会被随后的清除覆盖。
                    debug!(port = self.listener.port(), slot = handle.index(), %endpoint, "listener stopped while binding, releasing slot");
                    self.pool.release(handle);
                    report.discarded += 1;
                    break;
                }
                Ok(()) => {
                    debug!(port = self.listener.port(), slot = handle.index(), %endpoint, "inbound bound");
                    self.listener.push_accepted(handle);
                    report.bound += 1;
                }
                Err(err) => {
                    warn!(port = self.listener.port(), %err, "failed to bind inbound, requeueing");
                    self.pool.release(handle);
                    self.listener.requeue_front(endpoint);
                    break;
                }
            }
        }
        // 槽位与积压都已用尽时，传输层里剩下的连接即为溢出。
        self.listener.collect_inbound();
        report
    }

    /// 阻塞运行直到监听器停止。
    pub fn run(&self) {
        info!(port = self.listener.port(), "accept consumer running");
        while self.listener.wake().wait() != WakeReason::Closed {
            self.drain();
        }
        info!(port = self.listener.port(), "accept consumer exited");
    }

    /// 在独立线程中运行。
    pub fn spawn(self) -> io::Result<AcceptWorker> {
        let port = self.listener.port();
        let handle = thread::Builder::new()
            .name(format!("spark-accept-{port}"))
            .spawn(move || self.run())?;
        Ok(AcceptWorker {
            port,
            handle: Some(handle),
        })
    }
}

/// 后台接受线程的句柄。
#[derive(Debug)]
pub struct AcceptWorker {
    port: u16,
    handle: Option<JoinHandle<()>>,
}

impl AcceptWorker {
    /// 所服务的端口。
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 等待线程退出；须在监听器停止之后调用。
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!(port = self.port, "accept consumer panicked");
        }
    }
}

impl Drop for AcceptWorker {
    fn drop(&mut self) {
        // 未显式 join 的线程在监听器停止后自行退出，这里不阻塞。
        let _ = self.handle.take();
    }
}
