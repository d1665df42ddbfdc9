//! 事件队列：节点底层的消息/消费者缓冲。
//!
//! 不变式：`messages` 与 `consumers` 永不同时非空——有等待消费者时入队立即
//! 分发，有积压消息时接收立即弹出。关闭后入队以 `queue.already_closed`
//! 拒绝；关闭且排空即为 drained，挂起的接收以 `queue.drained` 终结。
//!
//! 两种具体变体共享同一契约：基于互斥锁的变体，以及以逻辑版本号模拟
//! 事务提交的事务型变体（目标运行时没有 STM；跨多个队列的原子事务语义
//! **不可用**，冲突重试带 1 ms 退避）。`Errored`/`Drained` 是两者共享的
//! 退化形态：入队为空操作，接收立即以终结原因失败。

mod consumer;

pub use consumer::{Consumer, PredicateFn};

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{LaminaError, Signal, codes};
use crate::result::{ResultChannel, SendResult, error_result, success_result};

/// 事务冲突重试退避。
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

thread_local! {
    static TRANSACTION_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// 当前线程是否处于事务作用域内。
pub fn in_transaction() -> bool {
    TRANSACTION_DEPTH.with(|depth| depth.get() > 0)
}

/// 打开一个事务作用域并执行 `f`；可嵌套。
///
/// 事务型队列的操作要求运行在该作用域内（缺省时操作会自成事务）；
/// 锁型队列的操作在该作用域内会以 `queue.transaction_mix` 被拒绝。
pub fn transaction<R>(f: impl FnOnce() -> R) -> R {
    struct DepthGuard;
    impl Drop for DepthGuard {
        fn drop(&mut self) {
            TRANSACTION_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }
    TRANSACTION_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let _guard = DepthGuard;
    f()
}

fn transaction_mix_error() -> LaminaError {
    LaminaError::new(
        codes::QUEUE_TRANSACTION_MIX,
        "lock-based queue touched inside a transaction scope",
    )
}

/// 队列的并发变体。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueMode {
    /// 互斥锁保护的缺省变体。
    Lock,
    /// 以逻辑版本号模拟事务提交的变体。
    Transactional,
}

/// 入队后仍在缓冲中的消息；`listener` 在消息最终被消费时收到背压信号。
pub struct QueuedMessage<T> {
    pub msg: T,
    pub listener: Option<SendResult>,
}

impl<T: Clone> Clone for QueuedMessage<T> {
    fn clone(&self) -> Self {
        Self {
            msg: self.msg.clone(),
            listener: self.listener.clone(),
        }
    }
}

struct QueueCore<T> {
    messages: VecDeque<QueuedMessage<T>>,
    consumers: VecDeque<Consumer<T>>,
}

impl<T> QueueCore<T> {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            consumers: VecDeque::new(),
        }
    }
}

impl<T: Clone> Clone for QueueCore<T> {
    fn clone(&self) -> Self {
        Self {
            messages: self.messages.clone(),
            consumers: self.consumers.iter().cloned().collect(),
        }
    }
}

enum QueueState<T> {
    /// 正常运转。
    Open(QueueCore<T>),
    /// 已关闭但仍有积压消息可被接收。
    Closed(QueueCore<T>),
    /// 错误终态：入队为空操作，接收立即以该错误失败。
    Errored(LaminaError),
    /// 关闭且排空的终态。
    Drained,
}

type Completion = Box<dyn FnOnce()>;
type DrainWatch = Box<dyn Fn() + Send + Sync>;

/// 事件队列。
///
/// # 设计背景（Why）
/// - 监听者回调一律在释放内部锁之后执行：消费者的结果通道上可能挂着会
///   重入本队列的回调（流水线恢复、顺序消费驱动器），在锁内分发会死锁。
/// - `enqueue` 的 `release` 参数承载手递手时序：上游节点把自身共享锁的
///   释放动作交给本队列，在本队列的独占锁内执行，换锁期间不存在无锁窗口。
pub struct EventQueue<T> {
    mode: QueueMode,
    state: Mutex<QueueState<T>>,
    version: AtomicU64,
    drain_watch: Mutex<Option<DrainWatch>>,
}

impl<T: Clone + Send + 'static> EventQueue<T> {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            mode,
            state: Mutex::new(QueueState::Open(QueueCore::new())),
            version: AtomicU64::new(0),
            drain_watch: Mutex::new(None),
        }
    }

    /// 注册排空监听（节点以此触发 on-drained 回调）；只允许一个。
    pub fn set_drain_watch(&self, watch: DrainWatch) {
        *self.drain_watch.lock() = Some(watch);
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    /// 入队一条消息。
    ///
    /// # 契约说明（What）
    /// - `release` 在获得本队列独占锁后、任何状态判定前执行（手递手释放）。
    /// - 有等待消费者时立即分发：谓词抛出则该消费者出错、消息继续匹配下一
    ///   个；谓词为假则消费者以 `false_value` 成功、消息不被消费；认领失败
    ///   （已取消）则换下一个消费者重试。
    /// - 全部落空时：`persist` 为真则消息入缓冲并返回其监听结果，否则返回
    ///   `discarded`。
    /// - 已关闭返回 `queue.already_closed`，错误态返回原错误。
    pub fn enqueue(&self, msg: T, persist: bool, release: impl FnOnce()) -> SendResult {
        if self.mode == QueueMode::Lock && in_transaction() {
            release();
            return error_result(transaction_mix_error());
        }
        let mut release_slot = Some(release);
        let mut completions: Vec<Completion> = Vec::new();
        let result = self.with_state(|state| {
            if let Some(release) = release_slot.take() {
                release();
            }
            let core = match state {
                QueueState::Errored(err) => return error_result(err.clone()),
                QueueState::Drained | QueueState::Closed(_) => {
                    return error_result(LaminaError::already_closed());
                }
                QueueState::Open(core) => core,
            };

            let mut consumed = false;
            while let Some(consumer) = core.consumers.pop_front() {
                match consumer {
                    Consumer::Simple { result } => {
                        if result.claim() {
                            let delivered = msg.clone();
                            completions.push(Box::new(move || {
                                let _ = result.succeed_claimed(delivered);
                            }));
                            consumed = true;
                            break;
                        }
                        // 结果已被取消或超时认领：换下一个消费者重试。
                    }
                    Consumer::Predicated {
                        predicate,
                        false_value,
                        result,
                    } => {
                        let verdict = catch_unwind(AssertUnwindSafe(|| (predicate.as_ref())(&msg)));
                        match verdict {
                            Err(_) => {
                                if result.claim() {
                                    completions.push(Box::new(move || {
                                        let _ = result.fail_claimed(LaminaError::new(
                                            codes::OPERATOR_PANIC,
                                            "receive predicate panicked",
                                        ));
                                    }));
                                }
                            }
                            Ok(true) => {
                                if result.claim() {
                                    let delivered = msg.clone();
                                    completions.push(Box::new(move || {
                                        let _ = result.succeed_claimed(delivered);
                                    }));
                                    consumed = true;
                                    break;
                                }
                            }
                            Ok(false) => {
                                if result.claim() {
                                    completions.push(Box::new(move || match false_value {
                                        Some(value) => {
                                            let _ = result.succeed_claimed(value);
                                        }
                                        None => {
                                            let _ = result.fail_claimed(LaminaError::new(
                                                codes::STREAM_INCOMPLETE,
                                                "predicate rejected with no false-value",
                                            ));
                                        }
                                    }));
                                }
                            }
                        }
                    }
                }
            }

            if consumed {
                return success_result(Signal::Consumed);
            }
            if persist {
                let listener: SendResult = ResultChannel::new();
                core.messages.push_back(QueuedMessage {
                    msg: msg.clone(),
                    listener: Some(listener.clone()),
                });
                listener
            } else {
                success_result(Signal::Discarded)
            }
        });
        for completion in completions {
            completion();
        }
        result
    }

    /// 注册或立即满足一次接收。
    ///
    /// 预先提供的 `result` 允许调用方把接收缝合进流水线或超时竞争；队列在
    /// 分发前认领它，认领失败（已被超时方抢先）时消息保留在队列中。
    pub fn receive(
        &self,
        predicate: Option<PredicateFn<T>>,
        false_value: Option<T>,
        result: Option<ResultChannel<T>>,
    ) -> ResultChannel<T> {
        let rc = result.unwrap_or_default();
        if self.mode == QueueMode::Lock && in_transaction() {
            if rc.claim() {
                let _ = rc.fail_claimed(transaction_mix_error());
            }
            return rc;
        }
        let mut completions: Vec<Completion> = Vec::new();
        let mut became_drained = false;
        self.with_state(|state| {
            let (core, closed) = match state {
                QueueState::Errored(err) => {
                    let err = err.clone();
                    let target = rc.clone();
                    completions.push(Box::new(move || {
                        if target.claim() {
                            let _ = target.fail_claimed(err);
                        }
                    }));
                    return;
                }
                QueueState::Drained => {
                    let target = rc.clone();
                    completions.push(Box::new(move || {
                        if target.claim() {
                            let _ = target.fail_claimed(LaminaError::drained());
                        }
                    }));
                    return;
                }
                QueueState::Open(core) => (core, false),
                QueueState::Closed(core) => (core, true),
            };

            if let Some(front) = core.messages.front() {
                let accepted = match &predicate {
                    None => Ok(true),
                    Some(p) => catch_unwind(AssertUnwindSafe(|| (p.as_ref())(&front.msg))),
                };
                match accepted {
                    Err(_) => {
                        let target = rc.clone();
                        completions.push(Box::new(move || {
                            if target.claim() {
                                let _ = target.fail_claimed(LaminaError::new(
                                    codes::OPERATOR_PANIC,
                                    "receive predicate panicked",
                                ));
                            }
                        }));
                    }
                    Ok(true) => {
                        // 认领成功才真正弹出消息；失败说明超时或取消已抢先。
                        if rc.claim() {
                            let queued = core.messages.pop_front().expect("front checked");
                            let target = rc.clone();
                            let delivered = queued.msg;
                            completions.push(Box::new(move || {
                                let _ = target.succeed_claimed(delivered);
                            }));
                            if let Some(listener) = queued.listener {
                                completions.push(Box::new(move || {
                                    let _ = listener.succeed(Signal::Consumed);
                                }));
                            }
                        }
                    }
                    Ok(false) => {
                        if rc.claim() {
                            let target = rc.clone();
                            let fallback = false_value.clone();
                            completions.push(Box::new(move || match fallback {
                                Some(value) => {
                                    let _ = target.succeed_claimed(value);
                                }
                                None => {
                                    let _ = target.fail_claimed(LaminaError::new(
                                        codes::STREAM_INCOMPLETE,
                                        "predicate rejected with no false-value",
                                    ));
                                }
                            }));
                        }
                    }
                }
            } else if closed {
                let target = rc.clone();
                completions.push(Box::new(move || {
                    if target.claim() {
                        let _ = target.fail_claimed(LaminaError::drained());
                    }
                }));
            } else {
                let consumer = match predicate {
                    None => Consumer::Simple { result: rc.clone() },
                    Some(predicate) => Consumer::Predicated {
                        predicate,
                        false_value,
                        result: rc.clone(),
                    },
                };
                core.consumers.push_back(consumer);
            }

            became_drained = Self::settle_drained(state);
        });
        for completion in completions {
            completion();
        }
        if became_drained {
            self.fire_drain_watch();
        }
        rc
    }

    /// 取消一次挂起的接收；成功时认领并以 `receive.cancelled` 出错。
    /// 重复取消是幂等空操作。
    pub fn cancel_receive(&self, rc: &ResultChannel<T>) -> bool {
        let removed = self.with_state(|state| match state {
            QueueState::Open(core) | QueueState::Closed(core) => {
                let before = core.consumers.len();
                core.consumers.retain(|consumer| !consumer.matches(rc));
                before != core.consumers.len()
            }
            _ => false,
        });
        if removed && rc.claim() {
            let _ = rc.fail_claimed(LaminaError::cancelled());
        }
        removed
    }

    /// 弹出一条积压消息（节点在挂接新边时以此回放缓冲）。
    pub fn pop_message(&self) -> Option<QueuedMessage<T>> {
        let mut became_drained = false;
        let popped = self.with_state(|state| {
            let popped = match state {
                QueueState::Open(core) | QueueState::Closed(core) => core.messages.pop_front(),
                _ => None,
            };
            became_drained = Self::settle_drained(state);
            popped
        });
        if became_drained {
            self.fire_drain_watch();
        }
        popped
    }

    /// 关闭队列：挂起的消费者以 `queue.drained` 终结；积压消息保留可收。
    /// 返回状态是否发生变化（幂等）。
    pub fn close(&self) -> bool {
        let mut completions: Vec<Completion> = Vec::new();
        let mut became_drained = false;
        let changed = self.with_state(|state| {
            let old = std::mem::replace(state, QueueState::Drained);
            match old {
                QueueState::Open(mut core) => {
                    for consumer in core.consumers.drain(..) {
                        let result = consumer.result().clone();
                        completions.push(Box::new(move || {
                            if result.claim() {
                                let _ = result.fail_claimed(LaminaError::drained());
                            }
                        }));
                    }
                    if core.messages.is_empty() {
                        became_drained = true;
                    } else {
                        *state = QueueState::Closed(core);
                    }
                    true
                }
                other => {
                    *state = other;
                    false
                }
            }
        });
        for completion in completions {
            completion();
        }
        if became_drained {
            self.fire_drain_watch();
        }
        changed
    }

    /// 将队列置为错误终态：挂起的消费者与积压消息的监听者都以 `error` 终结。
    pub fn fail(&self, error: &LaminaError) {
        let mut completions: Vec<Completion> = Vec::new();
        self.with_state(|state| {
            let old = std::mem::replace(state, QueueState::Errored(error.clone()));
            match old {
                QueueState::Open(mut core) | QueueState::Closed(mut core) => {
                    for consumer in core.consumers.drain(..) {
                        let result = consumer.result().clone();
                        let err = error.clone();
                        completions.push(Box::new(move || {
                            if result.claim() {
                                let _ = result.fail_claimed(err);
                            }
                        }));
                    }
                    for queued in core.messages.drain(..) {
                        if let Some(listener) = queued.listener {
                            let err = error.clone();
                            completions.push(Box::new(move || {
                                if listener.claim() {
                                    let _ = listener.fail_claimed(err);
                                }
                            }));
                        }
                    }
                }
                terminal => *state = terminal,
            }
        });
        for completion in completions {
            completion();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|state| {
            matches!(
                state,
                QueueState::Closed(_) | QueueState::Drained | QueueState::Errored(_)
            )
        })
    }

    pub fn is_drained(&self) -> bool {
        self.with_state(|state| matches!(state, QueueState::Drained))
    }

    pub fn error(&self) -> Option<LaminaError> {
        self.with_state(|state| match state {
            QueueState::Errored(err) => Some(err.clone()),
            _ => None,
        })
    }

    pub fn message_count(&self) -> usize {
        self.with_state(|state| match state {
            QueueState::Open(core) | QueueState::Closed(core) => core.messages.len(),
            _ => 0,
        })
    }

    pub fn consumer_count(&self) -> usize {
        self.with_state(|state| match state {
            QueueState::Open(core) | QueueState::Closed(core) => core.consumers.len(),
            _ => 0,
        })
    }

    /// 把当前队列快照为一个事务型队列，保留消息、消费者与关闭状态。
    pub fn transactional_copy(&self) -> EventQueue<T> {
        let snapshot = self.with_state(|state| match state {
            QueueState::Open(core) => QueueState::Open(core.clone()),
            QueueState::Closed(core) => QueueState::Closed(core.clone()),
            QueueState::Errored(err) => QueueState::Errored(err.clone()),
            QueueState::Drained => QueueState::Drained,
        });
        EventQueue {
            mode: QueueMode::Transactional,
            state: Mutex::new(snapshot),
            version: AtomicU64::new(0),
            drain_watch: Mutex::new(None),
        }
    }

    /// 在合适的并发规程下访问内部状态。
    ///
    /// 事务型变体以“读版本号 → 取锁复核 → 提交递增”的方式模拟事务提交，
    /// 复核失败按 1 ms 退避重试；缺省事务作用域时自动打开一个。
    fn with_state<R>(&self, f: impl FnOnce(&mut QueueState<T>) -> R) -> R {
        match self.mode {
            QueueMode::Lock => {
                let mut state = self.state.lock();
                f(&mut state)
            }
            QueueMode::Transactional => {
                let body = || {
                    let mut slot = Some(f);
                    loop {
                        let observed = self.version.load(Ordering::SeqCst);
                        let mut state = self.state.lock();
                        if self.version.load(Ordering::SeqCst) != observed {
                            drop(state);
                            std::thread::sleep(RETRY_BACKOFF);
                            continue;
                        }
                        let out = (slot.take().expect("commit runs once"))(&mut state);
                        self.version.fetch_add(1, Ordering::SeqCst);
                        break out;
                    }
                };
                if in_transaction() { body() } else { transaction(body) }
            }
        }
    }

    fn settle_drained(state: &mut QueueState<T>) -> bool {
        let drained = match state {
            QueueState::Closed(core) => core.messages.is_empty() && core.consumers.is_empty(),
            _ => false,
        };
        if drained {
            *state = QueueState::Drained;
        }
        drained
    }

    fn fire_drain_watch(&self) {
        let watch = self.drain_watch.lock();
        if let Some(watch) = watch.as_ref() {
            watch();
        }
    }
}
