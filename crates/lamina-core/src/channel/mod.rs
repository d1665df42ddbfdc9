//! 通道门面：接收端传播器与发射端节点的配对，以及其上的组合子。
//!
//! 普通通道的两端是同一个恒等节点；`splice` 允许把一个通道的接收端与另一
//! 个通道的发射端缝合，使管线头部的变换与消费侧的变换彼此独立。

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{LaminaError, Signal};
use crate::graph::{
    Edge, EdgeStyle, EmitterNode, Node, NodeOptions, NodeState, Propagator, TerminalPropagator,
};
use crate::queue::PredicateFn;
use crate::result::{ResultChannel, SendResult, success_result};
use crate::runtime::Context;

/// 通道构造选项。
///
/// 与运行时阈值配置同一风格：`Default` 给出安全基线，链式方法覆盖单项。
pub struct ChannelOptions<T> {
    description: Cow<'static, str>,
    transactional: bool,
    permanent: bool,
    grounded: bool,
    messages: Vec<T>,
    context: Option<Context>,
}

impl<T> ChannelOptions<T> {
    pub fn new() -> Self {
        Self {
            description: Cow::Borrowed("channel"),
            transactional: false,
            permanent: false,
            grounded: false,
            messages: Vec::new(),
            context: None,
        }
    }

    pub fn description(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = description.into();
        self
    }

    /// 底层队列使用事务型变体。
    pub fn transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// 永久通道：上游关闭级联不波及，仅显式强制关闭生效。
    pub fn permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }

    /// 接地通道：无论边数都钉在 `open`。
    pub fn grounded(mut self, grounded: bool) -> Self {
        self.grounded = grounded;
        self
    }

    /// 构造后立即入队的种子消息。
    pub fn messages(mut self, messages: impl IntoIterator<Item = T>) -> Self {
        self.messages = messages.into_iter().collect();
        self
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }
}

impl<T> Default for ChannelOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 消息通道：(接收端传播器, 发射端节点) 对。
///
/// # 契约说明（What）
/// - `enqueue` 走接收端；读取、订阅、挂边走发射端。
/// - `close` 关闭接收端并沿边级联；`is_closed`/`is_drained` 观察发射端。
///   普通通道两端同一，缝合通道的关闭经由连接边传导至发射端。
/// - 克隆只复制句柄，两份句柄指向同一底层图。
pub struct Channel<In, Out = In> {
    receiver: Arc<dyn Propagator<In>>,
    emitter: Arc<dyn EmitterNode<Out>>,
    context: Context,
}

impl<In, Out> Clone for Channel<In, Out> {
    fn clone(&self) -> Self {
        Self {
            receiver: Arc::clone(&self.receiver),
            emitter: Arc::clone(&self.emitter),
            context: self.context.clone(),
        }
    }
}

/// 创建普通通道。
pub fn channel<T: Clone + Send + 'static>() -> Channel<T> {
    Channel::with_options(ChannelOptions::new())
}

/// 创建已关闭、但积压消息仍可被完整消费的通道。
pub fn closed_channel<T: Clone + Send + 'static>(
    messages: impl IntoIterator<Item = T>,
) -> Channel<T> {
    let ch = Channel::with_options(ChannelOptions::new().messages(messages));
    ch.close();
    ch
}

/// 以一个通道的接收端与另一个通道的发射端缝合出新通道。
pub fn splice<In, Mid, Src, Out>(
    receiver_side: &Channel<In, Mid>,
    emitter_side: &Channel<Src, Out>,
) -> Channel<In, Out> {
    Channel {
        receiver: Arc::clone(&receiver_side.receiver),
        emitter: Arc::clone(&emitter_side.emitter),
        context: receiver_side.context.clone(),
    }
}

impl<T: Clone + Send + 'static> Channel<T, T> {
    /// 按选项构造通道。
    pub fn with_options(options: ChannelOptions<T>) -> Self {
        let node = Node::<T, T>::identity(NodeOptions {
            description: options.description,
            permanent: options.permanent,
            grounded: options.grounded,
            predicate: false,
            transactional: options.transactional,
        });
        let ch = Channel {
            receiver: node.clone() as Arc<dyn Propagator<T>>,
            emitter: node as Arc<dyn EmitterNode<T>>,
            context: options.context.unwrap_or_default(),
        };
        for msg in options.messages {
            let _ = ch.enqueue(msg);
        }
        ch
    }
}

impl<In: Send + 'static, Out: Clone + Send + 'static> Channel<In, Out> {
    /// 投递一条消息，返回聚合投递结果（背压信号）。
    pub fn enqueue(&self, msg: In) -> SendResult {
        self.receiver.propagate(msg, true)
    }

    /// 读取下一条消息。
    pub fn read(&self) -> ResultChannel<Out> {
        self.emitter.receive(None, None, None)
    }

    /// 按选项读取：谓词、超时、排空回退。
    ///
    /// 超时通过共享定时器调度一次认领竞争：消息到达与超时哪个先认领成功，
    /// 哪个决定结果；落败的一方不产生任何副作用（超时不消费消息）。
    pub fn read_with(&self, options: ReadOptions<Out>) -> ResultChannel<Out> {
        let ReadOptions {
            predicate,
            on_false,
            timeout,
            on_timeout,
            on_drained,
        } = options;
        let raw = self.emitter.receive(predicate, on_false, None);
        if let Some(delay) = timeout {
            let target = raw.clone();
            self.context.timer().schedule(delay, move || {
                if target.claim() {
                    match on_timeout {
                        Some(value) => {
                            let _ = target.succeed_claimed(value);
                        }
                        None => {
                            let _ = target.fail_claimed(LaminaError::timeout());
                        }
                    }
                }
            });
        }
        match on_drained {
            None => raw,
            Some(fallback) => {
                let out = ResultChannel::new();
                let ok = out.clone();
                let err = out.clone();
                raw.on_success(move |value| {
                    let _ = ok.succeed(value);
                });
                raw.on_error(move |error| {
                    if error.is_drained() {
                        let _ = err.succeed(fallback);
                    } else {
                        let _ = err.fail(error);
                    }
                });
                out
            }
        }
    }

    /// 订阅全部消息；返回可传给 [`Channel::cancel`] 的退订句柄。
    ///
    /// 订阅即挂边，因此积压消息会先被回放；通道关闭时订阅随之终止。
    pub fn receive_all(&self, f: impl FnMut(Out) + Send + 'static) -> Result<u64, LaminaError> {
        let callback = Mutex::new(f);
        let terminal = TerminalPropagator::new("receive-all", move |msg| {
            (*callback.lock())(msg);
            success_result(Signal::Consumed)
        });
        let sink: Arc<dyn Propagator<Out>> = terminal.clone();
        self.emitter.link(Edge::standard("receive-all", sink))?;
        let key = self.emitter.register_cancellation(Box::new(move || {
            terminal.transition_close(true);
        }));
        Ok(key)
    }

    /// 执行先前登记的取消动作（退订等）。
    pub fn cancel(&self, key: u64) -> bool {
        self.emitter.cancel(key)
    }

    /// 取消一次挂起的读取；重复取消为幂等空操作。
    pub fn cancel_receive(&self, rc: &ResultChannel<Out>) -> bool {
        self.emitter.cancel_receive(rc)
    }

    /// 关闭通道；永久通道拒绝并返回 `false`。幂等。
    pub fn close(&self) -> bool {
        self.receiver.transition_close(false)
    }

    /// 强制关闭；穿透永久标记。
    pub fn force_close(&self) -> bool {
        self.receiver.transition_close(true)
    }

    /// 显式置错；穿透永久标记并沿所有边级联。
    pub fn error(&self, error: LaminaError) {
        self.emitter.fail_node(error.clone());
        self.receiver.transition_error(&error);
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.emitter.state(),
            NodeState::Closed | NodeState::Drained | NodeState::Error
        )
    }

    pub fn is_drained(&self) -> bool {
        self.emitter.state() == NodeState::Drained
    }

    pub fn state(&self) -> NodeState {
        self.emitter.state()
    }

    pub fn stored_error(&self) -> Option<LaminaError> {
        self.emitter.stored_error()
    }

    pub fn is_transactional(&self) -> bool {
        self.emitter.is_transactional()
    }

    pub fn description(&self) -> String {
        self.emitter.description().to_owned()
    }

    pub fn on_closed(&self, f: impl FnOnce() + Send + 'static) {
        self.emitter.on_closed(Box::new(f));
    }

    pub fn on_drained(&self, f: impl FnOnce() + Send + 'static) {
        self.emitter.on_drained(Box::new(f));
    }

    /// 清空发射端积压消息并返回。
    pub fn drain(&self) -> Vec<Out> {
        self.emitter.drain()
    }

    pub fn queued_messages(&self) -> usize {
        self.emitter.queued_messages()
    }

    /// 发射端节点句柄（图原语层）。
    pub fn emitter_node(&self) -> &Arc<dyn EmitterNode<Out>> {
        &self.emitter
    }

    /// 接收端传播器句柄（图原语层）。
    pub fn receiver_node(&self) -> &Arc<dyn Propagator<In>> {
        &self.receiver
    }

    /// 环境上下文（定时器来源）。
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// 同描述、同事务性的空通道。
    pub fn mimic(&self) -> Channel<Out, Out> {
        self.mimic_as::<Out>()
    }

    /// [`Channel::mimic`] 的换元素类型变体（供变换算子的输出通道使用）。
    pub fn mimic_as<U: Clone + Send + 'static>(&self) -> Channel<U, U> {
        Channel::with_options(
            ChannelOptions::new()
                .description(self.description())
                .transactional(self.is_transactional())
                .context(self.context.clone()),
        )
    }

    /// 映射变换：新通道的接收端应用 `f` 后沿用本通道的消息流。
    pub fn map<P: Clone + Send + 'static>(
        &self,
        f: impl Fn(Out) -> P + Send + Sync + 'static,
    ) -> Result<Channel<Out, P>, LaminaError> {
        let node = Node::<Out, P>::build(
            NodeOptions::named("map"),
            Box::new(move |msg| Ok(Some(f(msg)))),
        );
        self.emitter
            .link(Edge::standard("map", node.clone() as Arc<dyn Propagator<Out>>))?;
        Ok(Channel {
            receiver: node.clone() as Arc<dyn Propagator<Out>>,
            emitter: node as Arc<dyn EmitterNode<P>>,
            context: self.context.clone(),
        })
    }

    /// 过滤变换：谓词为假的消息被丢弃哨兵拦下，不再传播。
    /// 以 `transform = false` 直接投递谓词节点可绕过过滤（原样转发路径）。
    pub fn filter(
        &self,
        predicate: impl Fn(&Out) -> bool + Send + Sync + 'static,
    ) -> Result<Channel<Out, Out>, LaminaError> {
        let node = Node::<Out, Out>::build_with_passthrough(
            NodeOptions {
                predicate: true,
                ..NodeOptions::named("filter")
            },
            Box::new(move |msg| {
                if predicate(&msg) {
                    Ok(Some(msg))
                } else {
                    Ok(None)
                }
            }),
            Some(Box::new(|msg| Ok(Some(msg)))),
        );
        self.emitter
            .link(Edge::standard("filter", node.clone() as Arc<dyn Propagator<Out>>))?;
        Ok(Channel {
            receiver: node.clone() as Arc<dyn Propagator<Out>>,
            emitter: node as Arc<dyn EmitterNode<Out>>,
            context: self.context.clone(),
        })
    }

    /// [`Channel::filter`] 的取反。
    pub fn remove(
        &self,
        predicate: impl Fn(&Out) -> bool + Send + Sync + 'static,
    ) -> Result<Channel<Out, Out>, LaminaError> {
        self.filter(move |msg| !predicate(msg))
    }

    /// 分叉：独立的下游通道。关闭分叉不影响源；源上的错误会传入分叉。
    pub fn fork(&self) -> Result<Channel<Out, Out>, LaminaError> {
        self.branch(EdgeStyle::Fork, "fork")
    }

    /// 观察：无背压的旁路。源关闭会关闭观察端，反向不成立。
    pub fn tap(&self) -> Result<Channel<Out, Out>, LaminaError> {
        self.branch(EdgeStyle::Tap, "tap")
    }

    fn branch(&self, style: EdgeStyle, label: &'static str) -> Result<Channel<Out, Out>, LaminaError> {
        let node = Node::<Out, Out>::identity(NodeOptions::named(label));
        self.emitter.link(Edge::new(
            label,
            style,
            node.clone() as Arc<dyn Propagator<Out>>,
        ))?;
        Ok(Channel {
            receiver: node.clone() as Arc<dyn Propagator<Out>>,
            emitter: node as Arc<dyn EmitterNode<Out>>,
            context: self.context.clone(),
        })
    }

    /// 引流：本通道的消息灌入 `target` 的接收端；本通道关闭会级联关闭
    /// `target`（除非其为永久通道），反向不级联。
    pub fn siphon<X: Clone + Send + 'static>(
        &self,
        target: &Channel<Out, X>,
    ) -> Result<u64, LaminaError> {
        self.emitter
            .link(Edge::standard("siphon", Arc::clone(&target.receiver)))
    }

    /// 连接：引流且关闭双向级联。
    pub fn join<X: Clone + Send + 'static>(
        &self,
        target: &Channel<Out, X>,
    ) -> Result<u64, LaminaError> {
        self.emitter
            .link(Edge::join("join", Arc::clone(&target.receiver)))
    }

    /// 桥接：以回调消化消息，回调返回的投递结果即该边的背压信号。
    pub fn bridge_join(
        &self,
        description: impl Into<Cow<'static, str>>,
        callback: impl Fn(Out) -> SendResult + Send + Sync + 'static,
    ) -> Result<u64, LaminaError> {
        let description = description.into();
        let terminal = TerminalPropagator::new(description.clone(), callback);
        self.emitter.link(Edge::join(
            description,
            terminal as Arc<dyn Propagator<Out>>,
        ))
    }

    /// 接地：挂一个丢弃终端，防止无消费者的通道无界缓冲。
    pub fn ground(&self) -> Result<u64, LaminaError> {
        self.emitter.link(Edge::standard(
            "ground",
            TerminalPropagator::grounded("ground") as Arc<dyn Propagator<Out>>,
        ))
    }
}

/// [`Channel::read_with`] 的读取选项。
pub struct ReadOptions<T> {
    predicate: Option<PredicateFn<T>>,
    on_false: Option<T>,
    timeout: Option<Duration>,
    on_timeout: Option<T>,
    on_drained: Option<T>,
}

impl<T> ReadOptions<T> {
    pub fn new() -> Self {
        Self {
            predicate: None,
            on_false: None,
            timeout: None,
            on_timeout: None,
            on_drained: None,
        }
    }

    /// 谓词门控读取；谓词为假时以 `on_false` 成功且消息保留在队列中。
    pub fn predicate(mut self, p: impl Fn(&T) -> bool + Send + Sync + 'static, on_false: T) -> Self {
        self.predicate = Some(Arc::new(p));
        self.on_false = Some(on_false);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 超时时以该值成功（缺省为 `receive.timeout` 错误）。
    pub fn on_timeout(mut self, value: T) -> Self {
        self.on_timeout = Some(value);
        self
    }

    /// 通道排空时以该值成功（缺省为 `queue.drained` 错误）。
    pub fn on_drained(mut self, value: T) -> Self {
        self.on_drained = Some(value);
        self
    }
}

impl<T> Default for ReadOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}
