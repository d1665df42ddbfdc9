use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// 定时任务句柄，用于 [`Timer::cancel`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

enum Task {
    Once(Box<dyn FnOnce() + Send>),
    /// 周期任务；回调返回 `false` 表示停止并不再重排。
    Periodic {
        period: Duration,
        tick: Box<dyn FnMut() -> bool + Send>,
    },
}

struct Entry {
    deadline: Instant,
    seq: u64,
    key: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap 是大顶堆；反转比较使最早的截止时间先弹出。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    next_id: AtomicU64,
}

/// 进程级共享定时器：最小堆 + 单工作线程。
///
/// # 设计背景（Why）
/// - `timed_result`、`periodically`、读取超时共享同一时间源；单线程驱动
///   保证同一定时器上的回调串行执行，避免周期任务自重叠。
///
/// # 契约说明（What）
/// - `schedule`：延迟一次性任务；`schedule_periodic`：固定周期任务，回调
///   返回 `false` 时自动停表。
/// - `cancel`：幂等；已触发或不存在的键返回 `false`。
/// - 回调中的 panic 被捕获并记录，不会终止工作线程。
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(1),
        });
        let worker = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("lamina-timer".into())
            .spawn(move || run_worker(worker))
            .expect("spawn timer worker thread");
        Self { inner }
    }

    /// 在 `delay` 之后执行一次 `f`。
    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerKey {
        self.push(delay, Task::Once(Box::new(f)))
    }

    /// 每 `period` 执行一次 `tick`，直至其返回 `false` 或被取消。
    pub fn schedule_periodic(
        &self,
        period: Duration,
        tick: impl FnMut() -> bool + Send + 'static,
    ) -> TimerKey {
        self.push(
            period,
            Task::Periodic {
                period,
                tick: Box::new(tick),
            },
        )
    }

    /// 取消尚未触发的任务；周期任务在下一次到期前停表。
    pub fn cancel(&self, key: TimerKey) -> bool {
        let mut state = self.inner.state.lock();
        let fresh = state.cancelled.insert(key.0);
        self.inner.wakeup.notify_all();
        fresh
    }

    /// 停止工作线程；仅测试与受控关停使用。
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.wakeup.notify_all();
    }

    fn push(&self, delay: Duration, task: Task) -> TimerKey {
        let key = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        let seq = key;
        state.heap.push(Entry {
            deadline: Instant::now() + delay,
            seq,
            key,
            task,
        });
        self.inner.wakeup.notify_all();
        TimerKey(key)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(inner: Arc<TimerInner>) {
    tracing::debug!(target: "lamina_core::runtime", "timer worker started");
    loop {
        let due = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    tracing::debug!(target: "lamina_core::runtime", "timer worker stopped");
                    return;
                }
                let now = Instant::now();
                let next_deadline = state.heap.peek().map(|entry| entry.deadline);
                match next_deadline {
                    None => {
                        inner.wakeup.wait(&mut state);
                    }
                    Some(deadline) if deadline <= now => {
                        let entry = state.heap.pop().expect("peeked entry exists");
                        if state.cancelled.remove(&entry.key) {
                            continue;
                        }
                        break entry;
                    }
                    Some(deadline) => {
                        let _ = inner.wakeup.wait_for(&mut state, deadline - now);
                    }
                }
            }
        };

        match due.task {
            Task::Once(f) => {
                if catch_unwind(AssertUnwindSafe(f)).is_err() {
                    tracing::error!(
                        target: "lamina_core::runtime",
                        "timer callback panicked; entry dropped"
                    );
                }
            }
            Task::Periodic { period, mut tick } => {
                let keep = match catch_unwind(AssertUnwindSafe(&mut tick)) {
                    Ok(keep) => keep,
                    Err(_) => {
                        tracing::error!(
                            target: "lamina_core::runtime",
                            "periodic timer callback panicked; schedule dropped"
                        );
                        false
                    }
                };
                if keep {
                    let mut state = inner.state.lock();
                    if !state.cancelled.remove(&due.key) {
                        state.heap.push(Entry {
                            deadline: Instant::now() + period,
                            seq: due.seq,
                            key: due.key,
                            task: Task::Periodic { period, tick },
                        });
                        inner.wakeup.notify_all();
                    }
                }
            }
        }
    }
}
