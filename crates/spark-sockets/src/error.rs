//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义连接管理层对外暴露的错误语义：资源耗尽、非法槽位、非法状态、监听冲突、配置错误；
//! - 每个变体附带稳定错误码，宿主协议可直接转发而无需解析文案。
//!
//! ## 设计要求（What）
//! - 可重试的传输结果（`WouldBlock`、`TransientNoMemory`）不是错误，不会出现在此处；
//! - 空句柄、端点失效同样属于正常控制流，不会被包装成错误；
//! - 关闭排空超时是设计内的强制推进路径，也不是错误。

use std::time::Duration;

use thiserror::Error;

use crate::state::SlotState;
use crate::transport::TransportStatus;

/// 连接管理层的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：让调用方区分“没有空闲槽位”“调用时序错误”“底层不可恢复错误”等类别；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可以跨线程传播；
/// - **执行逻辑 (How)**：[`SocketError::code`] 为每个变体返回 `spark.sockets.*` 稳定错误码。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum SocketError {
    /// 在限定时间内没有槽位被释放。
    #[error("no free connection slot became available within {waited:?}")]
    NoSlotAvailable { waited: Duration },

    /// 槽位下标越界。
    #[error("slot {slot} does not exist in the pool")]
    InvalidSlot { slot: usize },

    /// 句柄属于该槽位的上一代分配，槽位已被回收或重新分配。
    #[error("handle for slot {slot} is stale (generation {generation})")]
    StaleHandle { slot: usize, generation: u64 },

    /// 在当前状态下不允许执行该操作。
    #[error("operation `{operation}` is not valid for slot {slot} in state `{state}`")]
    InvalidState {
        slot: usize,
        state: SlotState,
        operation: &'static str,
    },

    /// 监听器已停止。
    #[error("listener on port {port} has been stopped")]
    ListenerStopped { port: u16 },

    /// 端口上已存在监听器。
    #[error("port {port} already has a listener")]
    PortInUse { port: u16 },

    /// 传输层返回了不可恢复的结果。
    #[error("transport failure: {0}")]
    Transport(TransportStatus),

    /// 配置非法或无法解析。
    #[error("invalid configuration: {detail}")]
    Config { detail: String },
}

impl SocketError {
    /// 稳定错误码。
    pub const fn code(&self) -> &'static str {
        match self {
            SocketError::NoSlotAvailable { .. } => "spark.sockets.pool.exhausted",
            SocketError::InvalidSlot { .. } => "spark.sockets.pool.invalid_slot",
            SocketError::StaleHandle { .. } => "spark.sockets.pool.stale_handle",
            SocketError::InvalidState { .. } => "spark.sockets.slot.invalid_state",
            SocketError::ListenerStopped { .. } => "spark.sockets.listener.stopped",
            SocketError::PortInUse { .. } => "spark.sockets.listener.port_in_use",
            SocketError::Transport(_) => "spark.sockets.transport.failed",
            SocketError::Config { .. } => "spark.sockets.config.invalid",
        }
    }

    /// 是否属于资源耗尽类错误。
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, SocketError::NoSlotAvailable { .. })
    }
}

/// `Result` 的便捷别名。
pub type Result<T, E = SocketError> = std::result::Result<T, E>;
