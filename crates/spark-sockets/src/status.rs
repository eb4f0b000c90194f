//! 连接池状态报告。
//!
//! 宿主协议的 `status` 请求需要一份“每个槽位一行”的文本快照；这里提供结构化快照与
//! 对应的 `Display` 渲染，渲染格式稳定，可直接回传给管理端。

use core::fmt;

use crate::state::SlotState;
use crate::transport::EndpointId;

/// 单个槽位的快照。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotStatus {
    /// 槽位下标。
    pub slot: usize,
    /// 当前状态。
    pub state: SlotState,
    /// 持有的端点句柄。
    pub endpoint: Option<EndpointId>,
    /// 所属监听器的端口；主动连接或空闲槽位为 `None`。
    pub listener_port: Option<u16>,
    /// 待读缓冲中的字节数。
    pub pending_receive: usize,
}

/// 整个连接池的快照。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStatus {
    /// 按下标排列的槽位快照。
    pub slots: Vec<SlotStatus>,
    /// 快照时刻空闲链表的长度。
    pub free: usize,
}

impl PoolStatus {
    /// 处于 `state` 的槽位数量。
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// 已绑定端点的槽位数量。
    pub fn bound(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.is_bound()).count()
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {:>3} {:<16} wire={}",
            self.slot,
            self.state.as_str(),
            self.state.wire_id()
        )?;
        match self.endpoint {
            Some(endpoint) => write!(f, " {endpoint}")?,
            None => f.write_str(" -")?,
        }
        match self.listener_port {
            Some(port) => write!(f, " port={port}")?,
            None => f.write_str(" port=-")?,
        }
        write!(f, " rx={}", self.pending_receive)
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "slots={} free={} bound={}",
            self.slots.len(),
            self.free,
            self.bound()
        )?;
        for slot in &self.slots {
            writeln!(f, "{slot}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_line_per_slot() {
        let status = PoolStatus {
            slots: vec![
                SlotStatus {
                    slot: 0,
                    state: SlotState::Connected,
                    endpoint: Some(EndpointId::from_raw(9)),
                    listener_port: Some(80),
                    pending_receive: 3,
                },
                SlotStatus {
                    slot: 1,
                    state: SlotState::Free,
                    endpoint: None,
                    listener_port: None,
                    pending_receive: 0,
                },
            ],
            free: 1,
        };
        let text = status.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "slots=2 free=1 bound=1");
        assert_eq!(lines[1], "slot   0 connected        wire=3 ep#9 port=80 rx=3");
        assert_eq!(lines[2], "slot   1 free             wire=0 - port=- rx=0");
        assert_eq!(status.count(SlotState::Free), 1);
    }
}
