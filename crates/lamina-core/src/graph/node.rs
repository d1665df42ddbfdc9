use std::borrow::Cow;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock, Weak};

use crate::error::{LaminaError, Signal, codes};
use crate::queue::{EventQueue, PredicateFn, QueueMode};
use crate::result::{ResultChannel, SendResult, error_result, merge_results, success_result};
use crate::sync::cell::LockedCore;
use crate::sync::AsymmetricLock;

use super::{Edge, EdgeStyle, Propagator};

/// 节点生命周期状态。
///
/// ```text
/// open ──add-edge──▶ open | split
/// open | split ──consume──▶ consumed
/// 任意非终态 ──close──▶ closed ──drain──▶ drained
/// 任意非终态 ──error──▶ error
/// ```
///
/// 迁移不可逆（`consumed` 可经 unconsume 回退除外）；永久节点在非强制
/// 关闭下钉在 `open`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Open,
    Consumed,
    Split,
    Closed,
    Drained,
    Error,
}

/// 节点算子：`Ok(None)` 是谓词节点的丢弃哨兵（消息被过滤，不再传播）。
pub type OperatorFn<I, O> = Box<dyn Fn(I) -> Result<Option<O>, LaminaError> + Send + Sync>;

type CallbackFn = Box<dyn FnOnce() + Send>;

/// 节点构造选项。
#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub description: Cow<'static, str>,
    /// 永久节点忽略非强制关闭（上游级联不波及）。
    pub permanent: bool,
    /// 接地节点无论边数都钉在 `open`，只接受显式关闭语义。
    pub grounded: bool,
    /// 谓词节点：算子返回 `None` 表示消息被过滤。
    pub predicate: bool,
    /// 底层队列使用事务型变体。
    pub transactional: bool,
}

impl NodeOptions {
    pub fn named(description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            description: Cow::Borrowed("node"),
            permanent: false,
            grounded: false,
            predicate: false,
            transactional: false,
        }
    }
}

struct EdgeEntry<O> {
    id: u64,
    owner: bool,
    edge: Edge<O>,
}

struct NodeCore<O> {
    state: NodeState,
    error: Option<LaminaError>,
    edges: Vec<EdgeEntry<O>>,
    next_edge_id: u64,
    closed_callbacks: Vec<CallbackFn>,
    drained_callbacks: Vec<CallbackFn>,
    cancellations: HashMap<u64, CallbackFn>,
    next_cancellation: u64,
}

/// 传播图中的节点：队列、算子、出边与生命周期状态机的聚合体。
///
/// # 设计背景（Why）
/// - 状态与边集合由非对称锁保护：传播走共享模式快照，迁移与摘挂边走独占
///   模式；消息入队通过手递手把共享锁的释放交给队列，换锁期间不存在可被
///   并发迁移利用的无锁窗口。
/// - 算子在类型上即返回 `Result`，外部代码边界的 panic 由 `catch_unwind`
///   捕获后统一折叠为 `operator.panic` 错误并使节点进入错误态。
///
/// # 契约说明（What）
/// - `propagate`：按状态分派。错误态直接返回预置错误结果；关闭/排空返回
///   `queue.already_closed`；`consumed` 态绕过队列把算子产物交给唯一属主
///   边；`open`/`split` 态先入队（无边时持久化）再沿边快照扇出，非观察边
///   的投递结果聚合为返回值（全成则成，首错即错，余错记日志成为孤儿）。
/// - `link`：向关闭态节点挂边会先回放积压消息再向新边级联关闭，这使
///   “先关闭后订阅”的通道仍能被完整消费。
pub struct Node<I, O> {
    description: Cow<'static, str>,
    operator: OperatorFn<I, O>,
    /// `transform = false` 时的原样转发路径；仅输入输出同型的节点
    /// （恒等、谓词）能提供，异型变换节点为 `None` 并退回算子。
    passthrough: Option<OperatorFn<I, O>>,
    queue: EventQueue<O>,
    core: LockedCore<NodeCore<O>>,
    permanent: bool,
    grounded: bool,
    predicate: bool,
    weak_self: OnceLock<Weak<Node<I, O>>>,
}

impl<I: Send + 'static, O: Clone + Send + 'static> Node<I, O> {
    /// 以给定算子构造节点（无原样转发路径）。
    pub fn build(options: NodeOptions, operator: OperatorFn<I, O>) -> Arc<Self> {
        Self::build_with_passthrough(options, operator, None)
    }

    /// 以算子与可选的原样转发路径构造节点。
    pub fn build_with_passthrough(
        options: NodeOptions,
        operator: OperatorFn<I, O>,
        passthrough: Option<OperatorFn<I, O>>,
    ) -> Arc<Self> {
        let mode = if options.transactional {
            QueueMode::Transactional
        } else {
            QueueMode::Lock
        };
        let node = Arc::new(Self {
            description: options.description,
            operator,
            passthrough,
            queue: EventQueue::new(mode),
            core: LockedCore::new(NodeCore {
                state: NodeState::Open,
                error: None,
                edges: Vec::new(),
                next_edge_id: 1,
                closed_callbacks: Vec::new(),
                drained_callbacks: Vec::new(),
                cancellations: HashMap::new(),
                next_cancellation: 1,
            }),
            permanent: options.permanent,
            grounded: options.grounded,
            predicate: options.predicate,
            weak_self: OnceLock::new(),
        });
        let _ = node.weak_self.set(Arc::downgrade(&node));
        let watch = Arc::downgrade(&node);
        node.queue.set_drain_watch(Box::new(move || {
            if let Some(node) = watch.upgrade() {
                node.on_queue_drained();
            }
        }));
        node
    }

    /// 投递一条消息（[`Propagator`] 的实现主体）。
    ///
    /// `transform` 为假时经由原样转发路径绕过算子（消费态与传播态一致
    /// 生效）；下游各节点照常应用自己的算子。
    pub fn propagate(&self, msg: I, transform: bool) -> SendResult {
        let pass = self.core.begin_read();
        match pass.state {
            NodeState::Error => {
                let error = pass
                    .error
                    .clone()
                    .unwrap_or_else(|| LaminaError::new(codes::OPERATOR_PANIC, "node errored"));
                drop(pass);
                return error_result(error);
            }
            NodeState::Closed | NodeState::Drained => {
                drop(pass);
                return error_result(LaminaError::already_closed());
            }
            NodeState::Consumed => {
                let owner = pass
                    .edges
                    .iter()
                    .find(|entry| entry.owner)
                    .map(|entry| entry.edge.clone());
                drop(pass);
                let out = match self.apply_operator(msg, transform) {
                    Ok(Some(out)) => out,
                    Ok(None) => return success_result(Signal::Discarded),
                    Err(error) => {
                        self.fail(error.clone());
                        return error_result(error);
                    }
                };
                return match owner {
                    Some(edge) => edge.destination().propagate(out, true),
                    None => success_result(Signal::Discarded),
                };
            }
            NodeState::Open | NodeState::Split => {}
        }

        let out = match self.apply_operator(msg, transform) {
            Ok(Some(out)) => out,
            Ok(None) => {
                drop(pass);
                return success_result(Signal::Discarded);
            }
            Err(error) => {
                drop(pass);
                self.fail(error.clone());
                return error_result(error);
            }
        };

        let edges: Vec<Edge<O>> = pass.edges.iter().map(|entry| entry.edge.clone()).collect();
        let persist = edges.is_empty();
        // 手递手：共享锁在队列的独占锁内释放。
        let queue_result = self.queue.enqueue(out.clone(), persist, move || pass.unlock());
        if edges.is_empty() {
            return queue_result;
        }

        let mut results = Vec::new();
        for edge in &edges {
            let sent = edge.destination().propagate(out.clone(), true);
            if edge.style() != EdgeStyle::Tap {
                results.push(sent);
            }
        }
        if results.is_empty() {
            queue_result
        } else {
            merge_results(results, Signal::QueueSplit)
        }
    }

    /// 挂接一条普通边；返回边的句柄编号。
    pub fn link(&self, edge: Edge<O>) -> Result<u64, LaminaError> {
        self.link_entry(edge, false)
    }

    /// 挂接属主边（独占消费）；节点进入 `consumed` 态。
    pub fn link_owner(&self, edge: Edge<O>) -> Result<u64, LaminaError> {
        self.link_entry(edge, true)
    }

    fn link_entry(&self, edge: Edge<O>, owner: bool) -> Result<u64, LaminaError> {
        let destination = Arc::clone(edge.destination());
        let style = edge.style();
        let (id, was_closed) = self.core.write(|core| {
            match core.state {
                NodeState::Error => {
                    return Err(core
                        .error
                        .clone()
                        .unwrap_or_else(|| LaminaError::new(codes::OPERATOR_PANIC, "node errored")));
                }
                NodeState::Drained => return Err(LaminaError::already_closed()),
                NodeState::Consumed => return Err(LaminaError::already_consumed()),
                NodeState::Open | NodeState::Split | NodeState::Closed => {}
            }
            let id = core.next_edge_id;
            core.next_edge_id += 1;
            core.edges.push(EdgeEntry { id, owner, edge });
            if core.state != NodeState::Closed {
                core.state = if owner {
                    NodeState::Consumed
                } else if self.grounded {
                    NodeState::Open
                } else if core.edges.len() >= 2 {
                    NodeState::Split
                } else {
                    NodeState::Open
                };
            }
            Ok((id, core.state == NodeState::Closed))
        })?;

        // 回放积压消息到新边；消息监听者继承该边的投递结果。
        while let Some(queued) = self.queue.pop_message() {
            let sent = destination.propagate(queued.msg, true);
            if let Some(listener) = queued.listener {
                let relay = listener.clone();
                sent.on_success(move |signal| {
                    let _ = relay.succeed(signal);
                });
                sent.on_error(move |error| {
                    let _ = listener.fail(error);
                });
            }
        }
        if was_closed {
            destination.transition_close(false);
        }

        // 目的端关闭时摘边；join 边把关闭向上游级联。
        if let Some(weak) = self.weak_self.get() {
            let weak = weak.clone();
            destination.register_closed(Box::new(move || {
                if let Some(node) = weak.upgrade() {
                    node.unlink(id);
                    if style == EdgeStyle::Join {
                        node.close_node(false);
                    }
                }
            }));
        }
        Ok(id)
    }

    /// 摘除一条边；属主边摘除后节点回到 `open`/`split`。
    pub fn unlink(&self, id: u64) -> bool {
        self.core.write(|core| {
            let before = core.edges.len();
            core.edges.retain(|entry| entry.id != id);
            let removed = before != core.edges.len();
            if removed
                && !matches!(
                    core.state,
                    NodeState::Closed | NodeState::Drained | NodeState::Error
                )
            {
                core.state = if core.edges.iter().any(|entry| entry.owner) {
                    NodeState::Consumed
                } else if self.grounded {
                    NodeState::Open
                } else if core.edges.len() >= 2 {
                    NodeState::Split
                } else {
                    NodeState::Open
                };
            }
            removed
        })
    }

    /// 关闭节点：标记关闭、级联出边、关闭队列、触发回调。
    pub fn close_node(&self, force: bool) -> bool {
        let outcome = self.core.write(|core| {
            if matches!(
                core.state,
                NodeState::Closed | NodeState::Drained | NodeState::Error
            ) {
                return None;
            }
            if self.permanent && !force {
                return None;
            }
            core.state = NodeState::Closed;
            let edges: Vec<Edge<O>> = core.edges.iter().map(|entry| entry.edge.clone()).collect();
            let callbacks = std::mem::take(&mut core.closed_callbacks);
            Some((edges, callbacks))
        });
        let Some((edges, callbacks)) = outcome else {
            return false;
        };
        for callback in callbacks {
            callback();
        }
        for edge in edges {
            edge.destination().transition_close(false);
        }
        self.queue.close();
        true
    }

    /// 将节点置为错误终态并沿所有边（含观察边）级联。
    ///
    /// 边集合保留：上游后续的投递会在此节点上得到错误结果，从而把错误
    /// 暴露给生产者；关闭回调不在错误路径触发（摘边只伴随关闭）。
    pub fn fail(&self, error: LaminaError) {
        let edges = self.core.write(|core| {
            if matches!(core.state, NodeState::Error | NodeState::Drained) {
                return None;
            }
            core.state = NodeState::Error;
            core.error = Some(error.clone());
            Some(
                core.edges
                    .iter()
                    .map(|entry| entry.edge.clone())
                    .collect::<Vec<_>>(),
            )
        });
        let Some(edges) = edges else {
            return;
        };
        tracing::error!(
            target: "lamina_core::graph",
            node = %self.description,
            code = error.code(),
            "node entered error state: {error}"
        );
        self.queue.fail(&error);
        for edge in edges {
            edge.destination().transition_error(&error);
        }
    }

    /// 注册或立即满足一次接收（委托底层队列）。
    pub fn receive(
        &self,
        predicate: Option<PredicateFn<O>>,
        false_value: Option<O>,
        result: Option<ResultChannel<O>>,
    ) -> ResultChannel<O> {
        self.queue.receive(predicate, false_value, result)
    }

    pub fn cancel_receive(&self, rc: &ResultChannel<O>) -> bool {
        self.queue.cancel_receive(rc)
    }

    /// 清空积压消息并返回它们；消息监听者以 `consumed` 结清。
    pub fn drain(&self) -> Vec<O> {
        let mut out = Vec::new();
        while let Some(queued) = self.queue.pop_message() {
            if let Some(listener) = queued.listener {
                let _ = listener.succeed(Signal::Consumed);
            }
            out.push(queued.msg);
        }
        out
    }

    pub fn state(&self) -> NodeState {
        self.core.read(|core| core.state)
    }

    pub fn stored_error(&self) -> Option<LaminaError> {
        self.core.read(|core| core.error.clone())
    }

    /// 注册关闭回调；已处于关闭/错误态时立即执行（在锁外）。
    pub fn on_closed(&self, f: CallbackFn) {
        let immediate = self.core.write(|core| {
            if matches!(
                core.state,
                NodeState::Closed | NodeState::Drained | NodeState::Error
            ) {
                Some(f)
            } else {
                core.closed_callbacks.push(f);
                None
            }
        });
        if let Some(f) = immediate {
            f();
        }
    }

    /// 注册排空回调；已排空时立即执行。
    pub fn on_drained(&self, f: CallbackFn) {
        let immediate = self.core.write(|core| {
            if matches!(core.state, NodeState::Drained) {
                Some(f)
            } else {
                core.drained_callbacks.push(f);
                None
            }
        });
        if let Some(f) = immediate {
            f();
        }
    }

    /// 登记一个取消动作，返回句柄编号。
    pub fn register_cancellation(&self, f: CallbackFn) -> u64 {
        self.core.write(|core| {
            let key = core.next_cancellation;
            core.next_cancellation += 1;
            core.cancellations.insert(key, f);
            key
        })
    }

    /// 执行并移除先前登记的取消动作。
    pub fn cancel(&self, key: u64) -> bool {
        let callback = self.core.write(|core| core.cancellations.remove(&key));
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.message_count()
    }

    pub fn is_transactional(&self) -> bool {
        self.queue.mode() == QueueMode::Transactional
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn is_grounded(&self) -> bool {
        self.grounded
    }

    /// 谓词节点：算子以 `None` 过滤消息。
    pub fn is_predicate(&self) -> bool {
        self.predicate
    }

    /// 底层锁句柄；诊断采样以 [`acquire_all`](crate::sync::acquire_all) 冻结子图。
    pub fn lock_handle(&self) -> &AsymmetricLock {
        self.core.lock_handle()
    }

    /// 队列快照为事务型副本（诊断/迁移用）。
    pub fn transactional_queue_copy(&self) -> EventQueue<O> {
        self.queue.transactional_copy()
    }

    fn apply_operator(&self, msg: I, transform: bool) -> Result<Option<O>, LaminaError> {
        // 无原样转发路径的异型变换节点退回算子（类型上无从绕过）。
        let operator = if transform {
            &self.operator
        } else {
            self.passthrough.as_ref().unwrap_or(&self.operator)
        };
        match catch_unwind(AssertUnwindSafe(move || operator(msg))) {
            Ok(result) => result,
            Err(_) => Err(LaminaError::new(
                codes::OPERATOR_PANIC,
                format!("operator panicked on node `{}`", self.description),
            )),
        }
    }

    fn on_queue_drained(&self) {
        let callbacks = self.core.write(|core| {
            if core.state == NodeState::Closed {
                core.state = NodeState::Drained;
                std::mem::take(&mut core.drained_callbacks)
            } else {
                Vec::new()
            }
        });
        for callback in callbacks {
            callback();
        }
    }
}

impl<T: Clone + Send + 'static> Node<T, T> {
    /// 恒等算子节点（普通通道的底座）。
    pub fn identity(options: NodeOptions) -> Arc<Self> {
        Self::build_with_passthrough(
            options,
            Box::new(|msg| Ok(Some(msg))),
            Some(Box::new(|msg| Ok(Some(msg)))),
        )
    }
}

impl<I: Send + 'static, O: Clone + Send + 'static> Propagator<I> for Node<I, O> {
    fn propagate(&self, msg: I, transform: bool) -> SendResult {
        Node::propagate(self, msg, transform)
    }

    fn transition_close(&self, force: bool) -> bool {
        self.close_node(force)
    }

    fn transition_error(&self, error: &LaminaError) {
        if self.permanent {
            return;
        }
        self.fail(error.clone());
    }

    fn register_closed(&self, f: Box<dyn FnOnce() + Send>) {
        Node::on_closed(self, f);
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// 通道门面持有的发射端视图：对象安全的节点操作面。
pub trait EmitterNode<O>: Send + Sync {
    fn description(&self) -> &str;
    fn state(&self) -> NodeState;
    fn stored_error(&self) -> Option<LaminaError>;
    fn is_transactional(&self) -> bool;
    fn link(&self, edge: Edge<O>) -> Result<u64, LaminaError>;
    fn link_owner(&self, edge: Edge<O>) -> Result<u64, LaminaError>;
    fn unlink(&self, id: u64) -> bool;
    fn receive(
        &self,
        predicate: Option<PredicateFn<O>>,
        false_value: Option<O>,
        result: Option<ResultChannel<O>>,
    ) -> ResultChannel<O>;
    fn cancel_receive(&self, rc: &ResultChannel<O>) -> bool;
    fn drain(&self) -> Vec<O>;
    fn close_node(&self, force: bool) -> bool;
    fn fail_node(&self, error: LaminaError);
    fn on_closed(&self, f: Box<dyn FnOnce() + Send>);
    fn on_drained(&self, f: Box<dyn FnOnce() + Send>);
    fn register_cancellation(&self, f: Box<dyn FnOnce() + Send>) -> u64;
    fn cancel(&self, key: u64) -> bool;
    fn queued_messages(&self) -> usize;
}

impl<I: Send + 'static, O: Clone + Send + 'static> EmitterNode<O> for Node<I, O> {
    fn description(&self) -> &str {
        &self.description
    }

    fn state(&self) -> NodeState {
        Node::state(self)
    }

    fn stored_error(&self) -> Option<LaminaError> {
        Node::stored_error(self)
    }

    fn is_transactional(&self) -> bool {
        Node::is_transactional(self)
    }

    fn link(&self, edge: Edge<O>) -> Result<u64, LaminaError> {
        Node::link(self, edge)
    }

    fn link_owner(&self, edge: Edge<O>) -> Result<u64, LaminaError> {
        Node::link_owner(self, edge)
    }

    fn unlink(&self, id: u64) -> bool {
        Node::unlink(self, id)
    }

    fn receive(
        &self,
        predicate: Option<PredicateFn<O>>,
        false_value: Option<O>,
        result: Option<ResultChannel<O>>,
    ) -> ResultChannel<O> {
        Node::receive(self, predicate, false_value, result)
    }

    fn cancel_receive(&self, rc: &ResultChannel<O>) -> bool {
        Node::cancel_receive(self, rc)
    }

    fn drain(&self) -> Vec<O> {
        Node::drain(self)
    }

    fn close_node(&self, force: bool) -> bool {
        Node::close_node(self, force)
    }

    fn fail_node(&self, error: LaminaError) {
        Node::fail(self, error)
    }

    fn on_closed(&self, f: Box<dyn FnOnce() + Send>) {
        Node::on_closed(self, f)
    }

    fn on_drained(&self, f: Box<dyn FnOnce() + Send>) {
        Node::on_drained(self, f)
    }

    fn register_cancellation(&self, f: Box<dyn FnOnce() + Send>) -> u64 {
        Node::register_cancellation(self, f)
    }

    fn cancel(&self, key: u64) -> bool {
        Node::cancel(self, key)
    }

    fn queued_messages(&self) -> usize {
        Node::queued_messages(self)
    }
}

/// 独占消费句柄；析构不释放，显式 [`ConsumeHandle::unconsume`] 归还。
pub struct ConsumeHandle<O> {
    node: Arc<dyn EmitterNode<O>>,
    edge_id: u64,
}

impl<O> ConsumeHandle<O> {
    /// 归还消费权：摘除属主边，节点按剩余边回到 `open`/`split`。
    pub fn unconsume(self) -> bool {
        self.node.unlink(self.edge_id)
    }
}

/// 消费协议：原子地把 `open`/`split` 节点迁为 `consumed`。
///
/// 已存在属主（`consumed` 态）时以 `node.already_consumed` 失败；成功时
/// 返回可归还消费权的句柄。消费期间消息绕过队列直达属主边。
pub fn consume<O: Clone + Send + 'static>(
    node: &Arc<dyn EmitterNode<O>>,
    edge: Edge<O>,
) -> Result<ConsumeHandle<O>, LaminaError> {
    let edge_id = node.link_owner(edge)?;
    Ok(ConsumeHandle {
        node: Arc::clone(node),
        edge_id,
    })
}

