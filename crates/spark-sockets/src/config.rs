//! # 连接管理层配置
//!
//! ## 意图（Why）
//! - 槽位数量、排空截止时间、两档关闭超时都与链路速率相关，不能写死为常量；
//! - 采用 `serde` + TOML 加载，与工作区其它组件的配置方式保持一致。
//!
//! ## 契约（What）
//! - 所有字段均有默认值，空文档即得到默认配置；
//! - [`SocketServerConfig::validate`] 拒绝零槽位、零积压容量、零写入重试，以及
//!   “强制关闭超时大于正常关闭超时”的组合。

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SocketError};

/// 关闭排空的默认截止时间（`MaxSendWaitTime`）。
pub const DEFAULT_MAX_SEND_WAIT: Duration = Duration::from_secs(2);
/// 正常排空后使用的关闭超时。
pub const DEFAULT_DRAINED_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);
/// 截止时间到达后使用的关闭超时。
pub const DEFAULT_FORCED_CLOSE_TIMEOUT: Duration = Duration::from_millis(1);

/// 连接管理层的完整配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把关闭时序的可调参数集中在一个结构中，便于按链路类型整体替换；
/// - `abort_requires_ack` 保留旧版宿主协议的确认式回收，默认关闭。
///
/// ## 契约（What）
/// - 时间字段以毫秒表示，读取时通过对应的 `*_timeout()` 方法转换为 [`Duration`]；
/// - **前置条件**：调用方在使用前应调用 [`validate`](Self::validate)；
/// - **后置条件**：`timings()` 返回的 [`ConnectionTimings`] 即各槽位使用的时序参数。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SocketServerConfig {
    /// 固定槽位数量。
    pub slot_count: usize,
    /// `allocate` 的有界等待时长。
    pub allocate_timeout_ms: u64,
    /// 关闭排空截止时间。
    pub max_send_wait_ms: u64,
    /// 排空完成时的关闭超时。
    pub drained_close_timeout_ms: u64,
    /// 截止时间强制推进时的关闭超时。
    pub forced_close_timeout_ms: u64,
    /// 每个监听器的积压队列容量。
    pub backlog_capacity: usize,
    /// 单次 `write` 内允许的传输层写入尝试次数。
    pub write_retry_limit: usize,
    /// 每个槽位待读缓冲的上限。
    pub receive_buffer_limit: usize,
    /// 外部可见的致命终止是否停留在 `Aborted` 等待宿主确认。
    pub abort_requires_ack: bool,
}

impl Default for SocketServerConfig {
    fn default() -> Self {
        Self {
            slot_count: 4,
            allocate_timeout_ms: 50,
            max_send_wait_ms: DEFAULT_MAX_SEND_WAIT.as_millis() as u64,
            drained_close_timeout_ms: DEFAULT_DRAINED_CLOSE_TIMEOUT.as_millis() as u64,
            forced_close_timeout_ms: DEFAULT_FORCED_CLOSE_TIMEOUT.as_millis() as u64,
            backlog_capacity: 2,
            write_retry_limit: 8,
            receive_buffer_limit: 4096,
            abort_requires_ack: false,
        }
    }
}

impl SocketServerConfig {
    /// 从 TOML 文本解析配置并校验。
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SocketServerConfig = toml::from_str(text).map_err(|err| SocketError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 设置槽位数量。
    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count;
        self
    }

    /// 设置积压队列容量。
    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    /// 设置 `allocate` 的等待上限。
    pub fn with_allocate_timeout(mut self, timeout: Duration) -> Self {
        self.allocate_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// 设置关闭排空截止时间。
    pub fn with_max_send_wait(mut self, wait: Duration) -> Self {
        self.max_send_wait_ms = duration_to_ms(wait);
        self
    }

    /// 启用旧版“终止需确认”模式。
    pub fn with_abort_requires_ack(mut self, enabled: bool) -> Self {
        self.abort_requires_ack = enabled;
        self
    }

    /// `allocate` 的等待上限。
    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_millis(self.allocate_timeout_ms)
    }

    /// 校验配置组合是否合法。
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 {
            return Err(config_error("slot_count must be greater than zero"));
        }
        if self.backlog_capacity == 0 {
            return Err(config_error("backlog_capacity must be greater than zero"));
        }
        if self.write_retry_limit == 0 {
            return Err(config_error("write_retry_limit must be greater than zero"));
        }
        if self.forced_close_timeout_ms > self.drained_close_timeout_ms {
            return Err(config_error(
                "forced_close_timeout_ms must not exceed drained_close_timeout_ms",
            ));
        }
        Ok(())
    }

    /// 派生各槽位使用的时序参数。
    pub fn timings(&self) -> ConnectionTimings {
        ConnectionTimings {
            max_send_wait: Duration::from_millis(self.max_send_wait_ms),
            drained_close_timeout: Duration::from_millis(self.drained_close_timeout_ms),
            forced_close_timeout: Duration::from_millis(self.forced_close_timeout_ms),
            write_retry_limit: self.write_retry_limit,
            receive_buffer_limit: self.receive_buffer_limit,
            abort_requires_ack: self.abort_requires_ack,
        }
    }
}

/// 单个槽位的时序与容量参数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionTimings {
    /// 关闭排空截止时间。
    pub max_send_wait: Duration,
    /// 排空完成时的关闭超时。
    pub drained_close_timeout: Duration,
    /// 强制推进时的关闭超时。
    pub forced_close_timeout: Duration,
    /// 单次写入的最大尝试次数。
    pub write_retry_limit: usize,
    /// 待读缓冲上限。
    pub receive_buffer_limit: usize,
    /// 外部可见的致命终止是否停留在 `Aborted`。
    pub abort_requires_ack: bool,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        SocketServerConfig::default().timings()
    }
}

fn config_error(detail: &str) -> SocketError {
    SocketError::Config {
        detail: detail.to_owned(),
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
