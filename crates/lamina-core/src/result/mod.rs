//! 单赋值延迟结果（deferred）。
//!
//! [`ResultChannel`] 是引擎的背压与回调基座：投递结果、挂起的接收、流水线
//! 阶段的异步返回全部以它表达。状态机为 pending → claimed → success | error，
//! 终态迁移恰好一次。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{LaminaError, Signal, codes};

/// 投递结果：一次入队的聚合完成信号。
pub type SendResult = ResultChannel<Signal>;

/// 监听者句柄，用于 [`ResultChannel::cancel_listener`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerKey(u64);

type SuccessFn<T> = Box<dyn FnOnce(T) + Send>;
type ErrorFn = Box<dyn FnOnce(LaminaError) + Send>;

enum State<T> {
    Pending {
        claimed: bool,
        next_key: u64,
        on_success: Vec<(u64, SuccessFn<T>)>,
        on_error: Vec<(u64, ErrorFn)>,
    },
    Success(T),
    Error(LaminaError),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    realized: Condvar,
}

/// 单赋值延迟结果。
///
/// # 设计背景（Why）
/// - 引擎从不为缺失的消息阻塞线程（§并发模型），一切等待都表达为“向延迟
///   结果挂监听者”。同一个结果可能被生产者、超时定时器与聚合器同时观察，
///   因此句柄是可克隆的 `Arc` 共享体。
/// - 消费者取消与超时竞争同一次完成权，`claim` 把“谁来完成”从“完成什么”
///   中分离出来：先到者认领，后到者观察失败并让路。
///
/// # 契约说明（What）
/// - 终态迁移恰好一次：pending → success | error。
/// - `claim` 原子地保留完成权；`succeed`/`fail` 在未认领时自行尝试认领，
///   `succeed_claimed`/`fail_claimed` 则要求此前已认领成功。
/// - 实现后注册的监听者在当前线程立即执行；实现前注册的监听者在完成时按
///   注册顺序执行。成功与错误是两组独立的监听者。
///
/// # 风险提示（Trade-offs）
/// - 认领后既不完成也不释放的调用方会泄漏所有下游监听者；引擎内部的每条
///   认领路径都以 `succeed_claimed`/`fail_claimed` 收尾。
pub struct ResultChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResultChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> ResultChannel<T> {
    /// 创建处于 pending 态的延迟结果。
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending {
                    claimed: false,
                    next_key: 0,
                    on_success: Vec::new(),
                    on_error: Vec::new(),
                }),
                realized: Condvar::new(),
            }),
        }
    }

    /// 两个句柄是否指向同一个延迟结果。消费者等价性以此判定。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 原子认领完成权；仅在 pending 且未被认领时成功。
    pub fn claim(&self) -> bool {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Pending { claimed, .. } if !*claimed => {
                *claimed = true;
                true
            }
            _ => false,
        }
    }

    /// 是否已到达终态。
    pub fn is_realized(&self) -> bool {
        !matches!(&*self.shared.state.lock(), State::Pending { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Error(_))
    }

    pub fn is_claimed(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Pending { claimed: true, .. })
    }

    /// 读取错误终态的值。
    pub fn error_value(&self) -> Option<LaminaError> {
        match &*self.shared.state.lock() {
            State::Error(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// 注册错误分支监听者。
    pub fn on_error(&self, f: impl FnOnce(LaminaError) + Send + 'static) -> ListenerKey {
        let immediate = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending {
                    next_key, on_error, ..
                } => {
                    let key = *next_key;
                    *next_key += 1;
                    on_error.push((key, Box::new(f)));
                    return ListenerKey(key);
                }
                State::Error(err) => Some(err.clone()),
                State::Success(_) => None,
            }
        };
        if let Some(err) = immediate {
            f(err);
        }
        ListenerKey(u64::MAX)
    }

    /// 取消此前注册的监听者；实现后调用为幂等空操作。
    pub fn cancel_listener(&self, key: ListenerKey) -> bool {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Pending {
                on_success,
                on_error,
                ..
            } => {
                let before = on_success.len() + on_error.len();
                on_success.retain(|(k, _)| *k != key.0);
                on_error.retain(|(k, _)| *k != key.0);
                before != on_success.len() + on_error.len()
            }
            _ => false,
        }
    }
}

impl<T: Clone + Send + 'static> ResultChannel<T> {
    /// 认领并以成功值完成；已被他人认领或已实现时返回错误。
    pub fn succeed(&self, value: T) -> Result<(), LaminaError> {
        if !self.claim() {
            return Err(self.completion_conflict());
        }
        self.succeed_claimed(value)
    }

    /// 在已认领的前提下以成功值完成。
    pub fn succeed_claimed(&self, value: T) -> Result<(), LaminaError> {
        let listeners = {
            let mut state = self.shared.state.lock();
            match &*state {
                State::Pending { claimed: true, .. } => {}
                State::Pending { claimed: false, .. } => {
                    return Err(LaminaError::new(
                        codes::RESULT_NOT_CLAIMED,
                        "claimed completion without a prior claim",
                    ));
                }
                _ => {
                    return Err(LaminaError::new(
                        codes::RESULT_ALREADY_REALIZED,
                        "result already realized",
                    ));
                }
            }
            match std::mem::replace(&mut *state, State::Success(value.clone())) {
                State::Pending { on_success, .. } => on_success,
                _ => unreachable!("state re-checked above"),
            }
        };
        self.shared.realized.notify_all();
        for (_, listener) in listeners {
            listener(value.clone());
        }
        Ok(())
    }

    /// 认领并以错误完成。
    pub fn fail(&self, error: LaminaError) -> Result<(), LaminaError> {
        if !self.claim() {
            return Err(self.completion_conflict());
        }
        self.fail_claimed(error)
    }

    /// 在已认领的前提下以错误完成。
    pub fn fail_claimed(&self, error: LaminaError) -> Result<(), LaminaError> {
        let listeners = {
            let mut state = self.shared.state.lock();
            match &*state {
                State::Pending { claimed: true, .. } => {}
                State::Pending { claimed: false, .. } => {
                    return Err(LaminaError::new(
                        codes::RESULT_NOT_CLAIMED,
                        "claimed completion without a prior claim",
                    ));
                }
                _ => {
                    return Err(LaminaError::new(
                        codes::RESULT_ALREADY_REALIZED,
                        "result already realized",
                    ));
                }
            }
            match std::mem::replace(&mut *state, State::Error(error.clone())) {
                State::Pending { on_error, .. } => on_error,
                _ => unreachable!("state re-checked above"),
            }
        };
        self.shared.realized.notify_all();
        for (_, listener) in listeners {
            listener(error.clone());
        }
        Ok(())
    }

    /// 注册成功分支监听者。
    pub fn on_success(&self, f: impl FnOnce(T) + Send + 'static) -> ListenerKey {
        let immediate = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending {
                    next_key,
                    on_success,
                    ..
                } => {
                    let key = *next_key;
                    *next_key += 1;
                    on_success.push((key, Box::new(f)));
                    return ListenerKey(key);
                }
                State::Success(value) => Some(value.clone()),
                State::Error(_) => None,
            }
        };
        if let Some(value) = immediate {
            f(value);
        }
        ListenerKey(u64::MAX)
    }

    /// 读取成功值；未实现或处于错误态时返回给定默认值。
    pub fn success_value(&self, default: T) -> T {
        match &*self.shared.state.lock() {
            State::Success(value) => value.clone(),
            _ => default,
        }
    }

    /// 非阻塞探询终态。
    pub fn poll(&self) -> Option<Result<T, LaminaError>> {
        match &*self.shared.state.lock() {
            State::Success(value) => Some(Ok(value.clone())),
            State::Error(err) => Some(Err(err.clone())),
            State::Pending { .. } => None,
        }
    }

    /// 阻塞等待终态；惰性序列桥接专用。
    ///
    /// 超时返回 `receive.timeout` 错误，但不认领也不改变本结果的状态，
    /// 调用方可自行决定取消或继续等待。
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T, LaminaError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                State::Success(value) => return Ok(value.clone()),
                State::Error(err) => return Err(err.clone()),
                State::Pending { .. } => {}
            }
            match deadline {
                None => self.shared.realized.wait(&mut state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LaminaError::timeout());
                    }
                    let timed_out = self
                        .shared
                        .realized
                        .wait_for(&mut state, deadline - now)
                        .timed_out();
                    if timed_out && matches!(&*state, State::Pending { .. }) {
                        return Err(LaminaError::timeout());
                    }
                }
            }
        }
    }

    /// 派生一个映射成功值的新结果；错误原样透传。
    pub fn map<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> ResultChannel<U> {
        let out = ResultChannel::new();
        let ok = out.clone();
        self.on_success(move |value| {
            let _ = ok.succeed(f(value));
        });
        let err = out.clone();
        self.on_error(move |error| {
            let _ = err.fail(error);
        });
        out
    }

    fn completion_conflict(&self) -> LaminaError {
        if self.is_realized() {
            LaminaError::new(codes::RESULT_ALREADY_REALIZED, "result already realized")
        } else {
            LaminaError::new(codes::RESULT_ALREADY_CLAIMED, "result already claimed")
        }
    }
}

impl<T> Default for ResultChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 创建 pending 态延迟结果（与通道构造函数对齐的自由函数形式）。
pub fn result_channel<T>() -> ResultChannel<T> {
    ResultChannel::new()
}

/// 创建已处于成功终态的延迟结果。
pub fn success_result<T: Clone + Send + 'static>(value: T) -> ResultChannel<T> {
    let rc = ResultChannel::new();
    let _ = rc.succeed(value);
    rc
}

/// 创建已处于错误终态的延迟结果。
pub fn error_result<T: Clone + Send + 'static>(error: LaminaError) -> ResultChannel<T> {
    let rc = ResultChannel::new();
    let _ = rc.fail(error);
    rc
}

/// 在 `delay` 之后以 `value` 成功的延迟结果；使用进程默认上下文的定时器。
pub fn timed_result<T: Clone + Send + 'static>(delay: Duration, value: T) -> ResultChannel<T> {
    timed_result_in(crate::runtime::Context::global(), delay, value)
}

/// [`timed_result`] 的显式上下文变体。
pub fn timed_result_in<T: Clone + Send + 'static>(
    context: &crate::runtime::Context,
    delay: Duration,
    value: T,
) -> ResultChannel<T> {
    let rc = ResultChannel::new();
    let target = rc.clone();
    context.timer().schedule(delay, move || {
        let _ = target.succeed(value);
    });
    rc
}

/// 聚合一组投递结果为单一背压信号。
///
/// # 契约说明（What）
/// - 全部成功时以 `success` 信号成功，且在最后一个 pending 结果完成时解析；
/// - 任意一个出错时以“首个错误”出错；其后到达的错误成为孤儿，按错误级别
///   记录日志而不再改变聚合结果；
/// - 空集合立即成功，单元素集合原样透传（无额外分配）。
pub fn merge_results(results: Vec<SendResult>, success: Signal) -> SendResult {
    if results.is_empty() {
        return success_result(success);
    }
    if results.len() == 1 {
        return results.into_iter().next().expect("len checked");
    }

    let aggregate = SendResult::new();
    let remaining = Arc::new(AtomicUsize::new(results.len()));
    for result in results {
        let agg_ok = aggregate.clone();
        let left = Arc::clone(&remaining);
        result.on_success(move |_| {
            if left.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = agg_ok.succeed(success);
            }
        });
        let agg_err = aggregate.clone();
        result.on_error(move |error| {
            if agg_err.claim() {
                let _ = agg_err.fail_claimed(error);
            } else {
                tracing::warn!(
                    target: "lamina_core::result",
                    code = error.code(),
                    "orphaned downstream error after aggregate already resolved: {error}"
                );
            }
        });
    }
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transition_happens_exactly_once() {
        let rc: ResultChannel<u32> = ResultChannel::new();
        rc.succeed(1).expect("first completion");
        assert!(rc.succeed(2).is_err());
        assert!(rc.fail(LaminaError::cancelled()).is_err());
        assert_eq!(rc.success_value(0), 1);
    }

    #[test]
    fn claim_reserves_completion() {
        let rc: ResultChannel<u32> = ResultChannel::new();
        assert!(rc.claim());
        assert!(!rc.claim());
        assert!(rc.succeed(5).is_err(), "未持认领权的完成必须失败");
        rc.succeed_claimed(5).expect("claim holder completes");
        assert_eq!(rc.success_value(0), 5);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let rc: ResultChannel<u32> = ResultChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            rc.on_success(move |v| seen.lock().push((tag, v)));
        }
        rc.succeed(9).expect("realize");
        assert_eq!(&*seen.lock(), &[("a", 9), ("b", 9), ("c", 9)]);
    }

    #[test]
    fn post_realization_listener_runs_immediately() {
        let rc = success_result(3u32);
        let seen = Arc::new(Mutex::new(None));
        let probe = Arc::clone(&seen);
        rc.on_success(move |v| *probe.lock() = Some(v));
        assert_eq!(*seen.lock(), Some(3));
    }

    #[test]
    fn cancel_listener_removes_pending_registration() {
        let rc: ResultChannel<u32> = ResultChannel::new();
        let seen = Arc::new(Mutex::new(0u32));
        let probe = Arc::clone(&seen);
        let key = rc.on_success(move |v| *probe.lock() = v);
        assert!(rc.cancel_listener(key));
        assert!(!rc.cancel_listener(key));
        rc.succeed(4).expect("realize");
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn merge_waits_for_all_and_first_error_wins() {
        let a: SendResult = ResultChannel::new();
        let b: SendResult = ResultChannel::new();
        let merged = merge_results(vec![a.clone(), b.clone()], Signal::QueueSplit);
        a.succeed(Signal::Consumed).expect("a");
        assert!(!merged.is_realized(), "仍有 pending 分支时聚合不得解析");
        b.succeed(Signal::Consumed).expect("b");
        assert_eq!(merged.success_value(Signal::Discarded), Signal::QueueSplit);

        let c: SendResult = ResultChannel::new();
        let d: SendResult = ResultChannel::new();
        let merged = merge_results(vec![c.clone(), d.clone()], Signal::QueueSplit);
        c.fail(LaminaError::already_closed()).expect("c fails");
        let err = merged.wait(None).expect_err("aggregate errors");
        assert_eq!(err.code(), crate::error::codes::QUEUE_ALREADY_CLOSED);
        d.fail(LaminaError::drained()).expect("orphan error is logged only");
    }

    #[test]
    fn wait_times_out_without_state_change() {
        let rc: ResultChannel<u32> = ResultChannel::new();
        let err = rc
            .wait(Some(Duration::from_millis(20)))
            .expect_err("times out");
        assert_eq!(err.code(), codes::RECEIVE_TIMEOUT);
        assert!(!rc.is_realized());
        rc.succeed(1).expect("仍可正常完成");
    }
}
