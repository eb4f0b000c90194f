#![cfg(all(feature = "loom-model", any(loom, spark_loom)))]
//! 槽位仲裁与合并唤醒的 Loom 影子模型。
//!
//! ## 教案级导览
//!
//! - **核心目标 (Why)**：`allocate` 与 `poll` 回收、传输层宣告与接受消费者之间存在真实的并发交错，
//!   普通单元测试只能覆盖少数调度顺序；
//! - **设计手法 (How)**：以 Loom 原语重建两个最小模型：
//!   1. `ShadowBook`：空闲标记 + 互斥簿记，两个分配者竞争同一个空闲槽位；
//!   2. `ShadowWake`：单槽待处理标记，两个生产者与一个消费者；
//! - **契约 (What)**：模型 1 断言同一槽位绝不会被两个分配者同时持有；模型 2 断言只要有生产者
//!   完成 `notify`，消费者最终一定观察到唤醒。
//! - **权衡 (Trade-offs)**：模型与生产代码的锁分层保持一致，但不直接复用生产类型，
//!   避免 Loom 对 `parking_lot` 原语的不可见性；因此这里验证的是锁分层与唤醒协议本身，
//!   `SlotPool` 与 `WakeSignal` 的实际交错由 `pool.rs`、`accept.rs` 与 `close_and_accept.rs`
//!   中的多线程测试覆盖。

use loom::{
    model,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

struct ShadowBook {
    free: Mutex<Vec<usize>>,
    holders: [AtomicUsize; 1],
}

impl ShadowBook {
    fn new() -> Self {
        Self {
            free: Mutex::new(vec![0]),
            holders: [AtomicUsize::new(0)],
        }
    }

    fn try_allocate(&self) -> Option<usize> {
        let index = self.free.lock().expect("loom mutex").pop()?;
        let previous = self.holders[index].fetch_add(1, Ordering::AcqRel);
        assert_eq!(previous, 0, "同一槽位被重复分配");
        Some(index)
    }

    fn release(&self, index: usize) {
        self.holders[index].fetch_sub(1, Ordering::AcqRel);
        self.free.lock().expect("loom mutex").push(index);
    }
}

#[test]
fn single_slot_is_never_held_twice() {
    model(|| {
        let book = Arc::new(ShadowBook::new());
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let book = Arc::clone(&book);
                thread::spawn(move || {
                    if let Some(index) = book.try_allocate() {
                        book.release(index);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("分配线程不应 panic");
        }
        assert_eq!(book.free.lock().expect("loom mutex").len(), 1);
    });
}

struct ShadowWake {
    pending: Mutex<bool>,
    ready: Condvar,
}

impl ShadowWake {
    fn notify(&self) {
        let mut pending = self.pending.lock().expect("loom mutex");
        if !*pending {
            *pending = true;
            self.ready.notify_one();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock().expect("loom mutex");
        while !*pending {
            pending = self.ready.wait(pending).expect("loom condvar");
        }
        *pending = false;
    }
}

#[test]
fn notifications_coalesce_and_are_never_lost() {
    model(|| {
        let wake = Arc::new(ShadowWake {
            pending: Mutex::new(false),
            ready: Condvar::new(),
        });
        let producers: Vec<_> = (0..2)
            .map(|_| {
                let wake = Arc::clone(&wake);
                thread::spawn(move || wake.notify())
            })
            .collect();

        // 消费者必然至少醒来一次：丢失唤醒会让 Loom 报告死锁。
        wake.wait();
        for producer in producers {
            producer.join().expect("生产线程不应 panic");
        }
    });
}
