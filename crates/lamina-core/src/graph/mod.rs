//! 传播图：节点、边与终端传播器。
//!
//! 消息从节点沿类型化的边流向下游节点或终端汇。边持有目的端的 `Arc`；
//! 图的生命周期由使用者保留的根通道界定，因此无需弱引用。错误沿所有边
//! 级联（含观察边）；关闭级联绕过观察边，永久节点对非强制关闭免疫。

mod node;

pub use node::{
    ConsumeHandle, EmitterNode, Node, NodeOptions, NodeState, OperatorFn, consume,
};

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{LaminaError, Signal};
use crate::result::{SendResult, error_result, success_result};

/// 边的风格，决定背压参与度与关闭级联方向。
///
/// - `Tap`：观察边。投递结果被忽略（不参与背压），目的端关闭不影响源。
/// - `Join`:目的端关闭会向上游级联关闭源。
/// - `Fork`/`Standard`/`Split`：目的端关闭仅移除该边。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeStyle {
    Standard,
    Tap,
    Join,
    Fork,
    Split,
}

/// 从节点指向下游传播器的类型化连接。
pub struct Edge<T> {
    description: Cow<'static, str>,
    style: EdgeStyle,
    destination: Arc<dyn Propagator<T>>,
}

impl<T> Edge<T> {
    pub fn new(
        description: impl Into<Cow<'static, str>>,
        style: EdgeStyle,
        destination: Arc<dyn Propagator<T>>,
    ) -> Self {
        Self {
            description: description.into(),
            style,
            destination,
        }
    }

    pub fn standard(
        description: impl Into<Cow<'static, str>>,
        destination: Arc<dyn Propagator<T>>,
    ) -> Self {
        Self::new(description, EdgeStyle::Standard, destination)
    }

    pub fn tap(
        description: impl Into<Cow<'static, str>>,
        destination: Arc<dyn Propagator<T>>,
    ) -> Self {
        Self::new(description, EdgeStyle::Tap, destination)
    }

    pub fn join(
        description: impl Into<Cow<'static, str>>,
        destination: Arc<dyn Propagator<T>>,
    ) -> Self {
        Self::new(description, EdgeStyle::Join, destination)
    }

    pub fn fork(
        description: impl Into<Cow<'static, str>>,
        destination: Arc<dyn Propagator<T>>,
    ) -> Self {
        Self::new(description, EdgeStyle::Fork, destination)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn style(&self) -> EdgeStyle {
        self.style
    }

    pub fn destination(&self) -> &Arc<dyn Propagator<T>> {
        &self.destination
    }
}

impl<T> Clone for Edge<T> {
    fn clone(&self) -> Self {
        Self {
            description: self.description.clone(),
            style: self.style,
            destination: Arc::clone(&self.destination),
        }
    }
}

/// 接受消息并产出投递结果的对象；节点与终端汇的公共面。
pub trait Propagator<T>: Send + Sync {
    /// 投递一条消息，返回聚合完成信号。
    ///
    /// `transform` 为假时跳过本节点的算子，消息按原样走完派发流程
    /// （高级用法：消息已处于变换后的形态时避免二次变换）。终端汇没有
    /// 算子，忽略该标志。
    fn propagate(&self, msg: T, transform: bool) -> SendResult;

    /// 下游关闭级联；`force` 可穿透永久节点。返回状态是否变化。
    fn transition_close(&self, force: bool) -> bool;

    /// 下游错误级联。
    fn transition_error(&self, error: &LaminaError);

    /// 注册关闭回调；已关闭时立即执行。源节点以此感知目的端关闭并摘边。
    fn register_closed(&self, f: Box<dyn FnOnce() + Send>);

    fn description(&self) -> &str;
}

/// 终端传播器：以回调消化消息的叶子汇。
///
/// `bridge_join` 与 `receive_all` 的订阅都落在这里；回调返回的投递结果
/// 直接成为该边的背压信号。
pub struct TerminalPropagator<T> {
    description: Cow<'static, str>,
    callback: Box<dyn Fn(T) -> SendResult + Send + Sync>,
    closed: AtomicBool,
    closed_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl<T: Send + 'static> TerminalPropagator<T> {
    pub fn new(
        description: impl Into<Cow<'static, str>>,
        callback: impl Fn(T) -> SendResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            description: description.into(),
            callback: Box::new(callback),
            closed: AtomicBool::new(false),
            closed_callbacks: Mutex::new(Vec::new()),
        })
    }

    /// 丢弃一切消息的接地终端。
    pub fn grounded(description: impl Into<Cow<'static, str>>) -> Arc<Self> {
        Self::new(description, |_msg| success_result(Signal::Discarded))
    }
}

impl<T: Send + 'static> Propagator<T> for TerminalPropagator<T> {
    fn propagate(&self, msg: T, _transform: bool) -> SendResult {
        if self.closed.load(Ordering::Acquire) {
            return error_result(LaminaError::already_closed());
        }
        (self.callback)(msg)
    }

    fn transition_close(&self, _force: bool) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = std::mem::take(&mut *self.closed_callbacks.lock());
        for callback in callbacks {
            callback();
        }
        true
    }

    fn transition_error(&self, _error: &LaminaError) {
        self.transition_close(true);
    }

    fn register_closed(&self, f: Box<dyn FnOnce() + Send>) {
        if self.closed.load(Ordering::Acquire) {
            f();
            return;
        }
        self.closed_callbacks.lock().push(f);
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// 创建终端传播器的便捷入口。
pub fn terminal_propagator<T: Send + 'static>(
    description: impl Into<Cow<'static, str>>,
    callback: impl Fn(T) -> SendResult + Send + Sync + 'static,
) -> Arc<TerminalPropagator<T>> {
    TerminalPropagator::new(description, callback)
}
