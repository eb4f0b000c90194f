//! 槽位状态机性质验证
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：对单个槽位施加任意顺序的驱动循环操作与传输层事件，验证：
//!   1. 每一步之后槽位恰好处于一个状态，且池的空闲计数与处于 `Free` 的槽位数一致；
//!   2. 未启用确认模式时永远不会进入 `Aborted`，保留值 `CloseReady` 永远不可达；
//!   3. 无论序列如何，`close` 加上超过截止时间的推进后，槽位一定回到 `Free`；
//!   4. `write` 报告的字节数永远不超过请求长度，零进展的可重试结果在单次调用内不重试。
//! - **设计手法 (How)**：直接驱动生产代码与脚本化传输层，事件由 proptest 生成；
//!   虚拟时钟使截止判定可复现。
//!
//! # 合同与边界 (What)
//!
//! - 传输层事件只包括：调整未发送/未确认计数、对端复位、端点异步失效、到达数据、预置写入结果；
//! - 不覆盖多监听器交互，那部分由 `close_and_accept.rs` 的场景测试负责。

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use spark_sockets::test_stubs::ScriptedTransport;
use spark_sockets::{
    ConnectProgress, ConnectionTimings, EndpointId, FatalKind, MockClock, PushHint, SlotHandle,
    SlotPool, SlotState, TransportStatus, WriteOutcome,
};

#[derive(Clone, Debug)]
enum Step {
    Write(usize, bool),
    Read(usize),
    Poll,
    Close,
    Release,
    Terminate(bool),
    Advance(u64),
    Counts(usize, usize),
    PeerReset,
    Invalidate,
    Arrive(usize),
    ScriptWrite(usize, TransportStatus),
}

fn status_strategy() -> impl Strategy<Value = TransportStatus> {
    prop_oneof![
        Just(TransportStatus::Ok),
        Just(TransportStatus::WouldBlock),
        Just(TransportStatus::TransientNoMemory),
        Just(TransportStatus::ConnectionAbortedByPeer),
        Just(TransportStatus::ConnectionReset),
        Just(TransportStatus::Timeout),
        Just(TransportStatus::Fatal(FatalKind::Other)),
    ]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0usize..64, any::<bool>()).prop_map(|(len, more)| Step::Write(len, more)),
        2 => (1usize..32).prop_map(Step::Read),
        4 => Just(Step::Poll),
        2 => Just(Step::Close),
        1 => Just(Step::Release),
        1 => any::<bool>().prop_map(Step::Terminate),
        3 => (0u64..1500).prop_map(Step::Advance),
        2 => (0usize..3, 0usize..3).prop_map(|(u, a)| Step::Counts(u, a)),
        1 => Just(Step::PeerReset),
        1 => Just(Step::Invalidate),
        1 => (1usize..16).prop_map(Step::Arrive),
        2 => (0usize..16, status_strategy()).prop_map(|(n, s)| Step::ScriptWrite(n, s)),
    ]
}

struct Model {
    transport: Arc<ScriptedTransport>,
    clock: MockClock,
    pool: SlotPool,
    handle: SlotHandle,
    endpoint: EndpointId,
}

impl Model {
    /// 构造一个已进入 `Connected` 的槽位。
    fn new() -> Self {
        let transport = ScriptedTransport::new();
        let clock = MockClock::new();
        let pool = SlotPool::new(
            2,
            transport.clone(),
            Arc::new(clock.clone()),
            ConnectionTimings::default(),
        );
        let handle = pool.allocate(Duration::ZERO).expect("空池可分配");
        pool.connect(handle, "127.0.0.1:80".parse().expect("addr"))
            .expect("脚本化传输层默认允许发起连接");
        let endpoint = pool.status().slots[handle.index()]
            .endpoint
            .expect("connecting 槽位持有端点");
        transport.set_connect_progress(endpoint, ConnectProgress::Established);
        pool.poll_all();
        assert_eq!(pool.state(handle).expect("state"), SlotState::Connected);
        Self {
            transport,
            clock,
            pool,
            handle,
            endpoint,
        }
    }

    fn apply(&self, step: &Step) {
        let handle = self.handle;
        match *step {
            Step::Write(len, more) => {
                let buf = vec![0xA5; len];
                let hint = if more { PushHint::MoreComing } else { PushHint::Flush };
                if let Ok(report) = self.pool.write(handle, &buf, hint) {
                    assert!(report.written <= len, "写入报告超过请求长度");
                }
            }
            Step::Read(len) => {
                let mut buf = vec![0u8; len];
                if let Ok(report) = self.pool.read(handle, &mut buf) {
                    assert!(report.read <= len);
                }
            }
            Step::Poll => {
                self.pool.poll_all();
            }
            Step::Close => {
                let _ = self.pool.close(handle);
            }
            Step::Release => self.pool.release(handle),
            Step::Terminate(external) => {
                let _ = self.pool.terminate(handle, external);
            }
            Step::Advance(ms) => self.clock.advance(Duration::from_millis(ms)),
            Step::Counts(unsent, unacked) => {
                self.transport.set_queue_counts(self.endpoint, unsent, unacked)
            }
            Step::PeerReset => self
                .transport
                .set_rx_status(self.endpoint, TransportStatus::ConnectionReset),
            Step::Invalidate => self.transport.invalidate(self.endpoint),
            Step::Arrive(len) => self.transport.push_rx(self.endpoint, &vec![7u8; len]),
            Step::ScriptWrite(consumed, status) => self
                .transport
                .script_writes(self.endpoint, [WriteOutcome::new(consumed, status)]),
        }
    }

    fn check_invariants(&self) {
        let status = self.pool.status();
        assert_eq!(
            status.free,
            status.count(SlotState::Free),
            "空闲链表必须与 Free 槽位一一对应"
        );
        assert_eq!(status.count(SlotState::Aborted), 0, "默认模式不得进入 Aborted");
        assert_eq!(status.count(SlotState::CloseReady), 0, "保留状态不可达");
        for slot in &status.slots {
            if slot.state == SlotState::Free {
                assert!(slot.endpoint.is_none(), "空闲槽位不得持有端点");
                assert_eq!(slot.pending_receive, 0, "空闲槽位不得保留接收缓冲");
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_arbitrary_sequences_keep_single_state_and_converge(
        steps in prop::collection::vec(step_strategy(), 0..48),
    ) {
        let model = Model::new();
        for step in &steps {
            model.apply(step);
            model.check_invariants();
        }

        let _ = model.pool.close(model.handle);
        model.clock.advance(Duration::from_millis(2_000));
        model.pool.poll_all();
        model.check_invariants();
        let state = model.pool.state(model.handle).expect("句柄代次未变");
        prop_assert_eq!(state, SlotState::Free, "close + 截止时间后必须回到 Free");
    }

    #[test]
    fn prop_write_never_exceeds_request_and_never_spins(
        len in 0usize..256,
        script in prop::collection::vec((0usize..512, status_strategy()), 0..12),
    ) {
        let model = Model::new();
        let endpoint = model.endpoint;
        model.transport.script_writes(
            endpoint,
            script.iter().map(|(consumed, status)| WriteOutcome::new(*consumed, *status)),
        );
        model.transport.set_write_capacity(endpoint, 0);

        let buf = vec![1u8; len];
        let before = model.transport.write_calls(endpoint);
        if let Ok(report) = model.pool.write(model.handle, &buf, PushHint::Flush) {
            prop_assert!(report.written <= len);
            let attempts = model.transport.write_calls(endpoint) - before;
            prop_assert!(attempts <= ConnectionTimings::default().write_retry_limit);
            if report.status.is_retryable() {
                prop_assert!(
                    matches!(
                        model.pool.state(model.handle).expect("state"),
                        SlotState::Connected | SlotState::OtherEndClosed
                    ),
                    "可重试结果不得终止连接"
                );
            }
        }
        model.check_invariants();
    }
}
