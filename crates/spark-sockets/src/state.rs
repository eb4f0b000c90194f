//! # 槽位状态词汇表
//!
//! ## 角色定位（Why）
//! - 槽位状态既是内部状态机的节点集合，也是与宿主协议共享的线上标识；
//! - 线上标识的数值一经发布便不可调整，因此保留了内部永不进入的 `CloseReady`。
//!
//! ## 契约（What）
//! - [`SlotState::wire_id`] 与 [`SlotState::from_wire`] 构成稳定映射；
//! - [`SlotState::as_str`] 为每个枚举值（含 `Allocated`）提供可读名称，状态报告依赖于此；
//! - [`SlotState::can_transition_to`] 是唯一的转移表，`CloseReady` 不出现在任何目标位置。

use core::fmt;

/// 连接槽位的状态。
///
/// # 教案式说明
/// - **意图 (Why)**：覆盖槽位从空闲到绑定、再到排空关闭的完整生命周期；
/// - **契约 (What)**：`#[repr(u8)]` 的判别值即线上标识，新增状态只能追加，不得重排；
/// - **风险 (Trade-offs)**：`Aborted` 仅为兼容旧版宿主协议保留，正常回收路径不得经过它。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum SlotState {
    /// 未分配，可被 `allocate` 取用。
    Free = 0,
    /// 已被某个分配者独占，尚未绑定端点。
    Allocated = 1,
    /// 主动连接进行中。
    Connecting = 2,
    /// 双向可用。
    Connected = 3,
    /// 对端已关闭或复位，本端仍可写出残留数据。
    OtherEndClosed = 4,
    /// 已请求关闭，等待发送队列排空或截止时间到达。
    ClosePending = 5,
    /// 保留值：仅为线上兼容存在，状态机永不进入。
    CloseReady = 6,
    /// 旧版宿主协议的终态，需宿主显式确认后回收。
    Aborted = 7,
}

impl SlotState {
    /// 全部状态，按线上标识排序。
    pub const ALL: [SlotState; 8] = [
        SlotState::Free,
        SlotState::Allocated,
        SlotState::Connecting,
        SlotState::Connected,
        SlotState::OtherEndClosed,
        SlotState::ClosePending,
        SlotState::CloseReady,
        SlotState::Aborted,
    ];

    /// 线上标识。
    pub const fn wire_id(self) -> u8 {
        self as u8
    }

    /// 由线上标识还原状态，未知值返回 `None`。
    pub const fn from_wire(id: u8) -> Option<SlotState> {
        match id {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Allocated),
            2 => Some(SlotState::Connecting),
            3 => Some(SlotState::Connected),
            4 => Some(SlotState::OtherEndClosed),
            5 => Some(SlotState::ClosePending),
            6 => Some(SlotState::CloseReady),
            7 => Some(SlotState::Aborted),
            _ => None,
        }
    }

    /// 人类可读的状态名。
    ///
    /// 每个枚举值都必须在此出现；遗漏任何可达状态都会让状态报告输出空洞条目。
    pub const fn as_str(self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Allocated => "allocated",
            SlotState::Connecting => "connecting",
            SlotState::Connected => "connected",
            SlotState::OtherEndClosed => "other-end-closed",
            SlotState::ClosePending => "close-pending",
            SlotState::CloseReady => "close-ready",
            SlotState::Aborted => "aborted",
        }
    }

    /// 判断状态是否允许跃迁至 `target`。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：连接状态机的每次转移都经过此表校验，保持文档与实现一致；
    /// - **契约 (What)**：自环视为合法；`CloseReady` 既不可作为源也不可作为目标；
    /// - **执行 (How)**：通过匹配元组 `(self, target)` 实现有限状态机判定。
    pub fn can_transition_to(self, target: SlotState) -> bool {
        use SlotState::*;
        if self == target {
            return self != CloseReady;
        }
        matches!(
            (self, target),
            (Free, Allocated)
                | (Allocated, Connecting)
                | (Allocated, Connected)
                | (Allocated, Free)
                | (Connecting, Connected)
                | (Connecting, ClosePending)
                | (Connecting, Free)
                | (Connecting, Aborted)
                | (Connected, OtherEndClosed)
                | (Connected, ClosePending)
                | (Connected, Free)
                | (Connected, Aborted)
                | (OtherEndClosed, ClosePending)
                | (OtherEndClosed, Free)
                | (OtherEndClosed, Aborted)
                | (ClosePending, Free)
                | (Aborted, Free)
        )
    }

    /// 槽位是否绑定了外部连接（即非 `Free`）。
    pub fn is_bound(self) -> bool {
        !matches!(self, SlotState::Free)
    }

    /// 是否允许写出数据。
    pub fn accepts_writes(self) -> bool {
        matches!(self, SlotState::Connected | SlotState::OtherEndClosed)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_round_trip_and_reserved_value_survives() {
        for state in SlotState::ALL {
            assert_eq!(SlotState::from_wire(state.wire_id()), Some(state));
        }
        assert_eq!(SlotState::CloseReady.wire_id(), 6, "保留值的线上标识不可变");
        assert_eq!(SlotState::from_wire(8), None);
    }

    #[test]
    fn every_state_has_a_distinct_name() {
        let mut names: Vec<_> = SlotState::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(SlotState::Allocated.to_string(), "allocated");
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SlotState::ALL.len());
    }

    #[test]
    fn close_ready_is_unreachable_by_construction() {
        for state in SlotState::ALL {
            assert!(
                !state.can_transition_to(SlotState::CloseReady),
                "{state} 不应能跃迁至保留状态"
            );
            assert!(!SlotState::CloseReady.can_transition_to(state));
        }
    }

    #[test]
    fn free_is_reachable_from_every_live_state() {
        for state in SlotState::ALL {
            if state == SlotState::CloseReady {
                continue;
            }
            let direct = state.can_transition_to(SlotState::Free);
            let via_close = state.can_transition_to(SlotState::ClosePending)
                && SlotState::ClosePending.can_transition_to(SlotState::Free);
            assert!(direct || via_close, "{state} 无法回到 free");
        }
    }
}
