#![doc = "lamina-core: 响应式数据流引擎核心。"]
#![doc = ""]
#![doc = "引擎把消息传递的通道组合成传播者有向图：生产者向通道节点入队，"]
#![doc = "消息沿算子边（map、filter、fork、tap、join 等）流向下游节点与"]
#![doc = "消费者；消费者要么以延迟结果接收单条消息，要么订阅全部消息。"]
#![doc = "三大核心：节点/边传播图（graph）、事件队列（queue）、延迟结果与"]
#![doc = "流水线（result、pipeline）。"]
#![doc = ""]
#![doc = "== 并发模型 =="]
#![doc = "并行线程、回调驱动：引擎从不为缺失的消息阻塞线程，一切等待都表达"]
#![doc = "为向延迟结果挂监听者。流水线是显式蹦床而非续延；节点内 FIFO 有序，"]
#![doc = "独立源之间不承诺全局顺序，消费者之间不承诺公平调度。"]
#![doc = ""]
#![doc = "== 持久化 =="]
#![doc = "无。引擎纯内存运行，消息不跨进程重启存续，不提供跨网络一跳以上的"]
#![doc = "送达保证。"]

pub mod channel;
pub mod error;
pub mod graph;
pub mod ops;
pub mod pipeline;
pub mod queue;
pub mod result;
pub mod runtime;
pub mod sync;

pub use channel::{Channel, ChannelOptions, ReadOptions, channel, closed_channel, splice};
pub use error::{ErrorCause, LaminaError, Signal, codes};
pub use graph::{
    ConsumeHandle, Edge, EdgeStyle, EmitterNode, Node, NodeOptions, NodeState, OperatorFn,
    Propagator, TerminalPropagator, consume, terminal_propagator,
};
pub use ops::{
    ChannelSeq, channel_to_seq, channel_to_seq_with_timeout, combine_latest, concat,
    emit_in_order, last, mapcat, partition, partition_all, partition_every, partition_step,
    periodically, receive_in_order, reduce, reductions, sample_every, take, take_while,
};
pub use pipeline::{Pipeline, PipelineBuilder, StageFn, Step, run_pipeline};
pub use queue::{
    Consumer, EventQueue, PredicateFn, QueueMode, QueuedMessage, in_transaction, transaction,
};
pub use result::{
    ListenerKey, ResultChannel, SendResult, error_result, merge_results, result_channel,
    success_result, timed_result, timed_result_in,
};
pub use runtime::{Context, Timer, TimerKey};
pub use sync::{AsymmetricLock, LockSetGuard, acquire_all};

/// 常用面：下游 crate 以 `use lamina_core::prelude::*` 获取高频类型。
pub mod prelude {
    pub use crate::channel::{Channel, ChannelOptions, ReadOptions, channel, closed_channel, splice};
    pub use crate::error::{LaminaError, Signal, codes};
    pub use crate::result::{ResultChannel, SendResult, error_result, success_result, timed_result};
    pub use crate::runtime::Context;
}
