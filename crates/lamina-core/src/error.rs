use std::fmt;
use std::sync::Arc;

/// `LaminaError` 表示 `lamina-core` 统一的错误域。
///
/// # 设计背景（Why）
/// - 引擎中的非异常结局（队列关闭、消费取消、超时等）需要跨线程、跨回调传递，
///   并且经常被同一个延迟结果的多个监听者同时观察，因此错误必须可克隆。
/// - 日志与测试需要机器可读的根因识别，故以稳定错误码为第一要素，人类可读
///   消息仅作辅助。
///
/// # 契约说明（What）
/// - **前置条件**：`code` 应在 [`codes`] 模块中声明，或遵守 `domain.reason`
///   命名约定。
/// - **后置条件**：所有构造方法都产生拥有所有权的实例，可安全跨线程移动；
///   `cause` 以 `Arc` 共享，克隆不复制底层错误。
#[derive(Clone, Debug)]
pub struct LaminaError {
    code: &'static str,
    message: String,
    cause: Option<ErrorCause>,
}

/// `ErrorCause` 封装底层原因；以 `Arc` 共享以支持延迟结果的多路分发。
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

impl LaminaError {
    /// 使用稳定错误码与消息创建 `LaminaError`。
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取人类可读的错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 附带一个底层原因，形成错误链。
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 获取可选的底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 队列或节点已关闭，不再接收消息。
    pub(crate) fn already_closed() -> Self {
        Self::new(codes::QUEUE_ALREADY_CLOSED, "queue no longer accepts messages")
    }

    /// 队列已关闭且消息耗尽。
    pub(crate) fn drained() -> Self {
        Self::new(codes::QUEUE_DRAINED, "queue is closed and fully drained")
    }

    /// 一次挂起的接收被调用方主动取消。
    pub(crate) fn cancelled() -> Self {
        Self::new(codes::RECEIVE_CANCELLED, "pending receive was cancelled")
    }

    /// 带超时的接收在消息到达前到期。
    pub(crate) fn timeout() -> Self {
        Self::new(codes::RECEIVE_TIMEOUT, "read timed out before a message arrived")
    }

    /// 节点已存在独占消费者。
    pub(crate) fn already_consumed() -> Self {
        Self::new(codes::NODE_ALREADY_CONSUMED, "node already has an owning consumer")
    }

    /// 判断错误是否表示队列被排空（下游正常终止）。
    pub fn is_drained(&self) -> bool {
        self.code == codes::QUEUE_DRAINED
    }
}

// 等价性只看稳定错误码与消息；cause 是诊断附件，不参与比较。
impl PartialEq for LaminaError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

impl Eq for LaminaError {}

impl fmt::Display for LaminaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for LaminaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// 引擎内置的错误码常量集合，保证可观测性系统具有稳定识别符。
pub mod codes {
    /// 向已关闭的队列或节点投递消息。
    pub const QUEUE_ALREADY_CLOSED: &str = "queue.already_closed";
    /// 队列已关闭且消息耗尽，挂起的接收以此终结。
    pub const QUEUE_DRAINED: &str = "queue.drained";
    /// 事务型队列与锁型队列的调用上下文互相混用。
    pub const QUEUE_TRANSACTION_MIX: &str = "queue.transaction_mix";
    /// 挂起的接收被调用方取消。
    pub const RECEIVE_CANCELLED: &str = "receive.cancelled";
    /// 带超时的读取到期。
    pub const RECEIVE_TIMEOUT: &str = "receive.timeout";
    /// 对已认领的延迟结果重复认领或写入。
    pub const RESULT_ALREADY_CLAIMED: &str = "result.already_claimed";
    /// 对已实现的延迟结果再次写入。
    pub const RESULT_ALREADY_REALIZED: &str = "result.already_realized";
    /// 未经认领即调用仅限认领后的完成操作。
    pub const RESULT_NOT_CLAIMED: &str = "result.not_claimed";
    /// 节点已被独占消费，无法再添加边或二次消费。
    pub const NODE_ALREADY_CONSUMED: &str = "node.already_consumed";
    /// 节点算子执行期间 panic，被边界捕获后转为错误态。
    pub const OPERATOR_PANIC: &str = "operator.panic";
    /// 流水线阶段抛出且未安装错误处理器。
    pub const PIPELINE_UNHANDLED: &str = "pipeline.unhandled";
    /// 源流在产出任何消息前即被排空。
    pub const STREAM_INCOMPLETE: &str = "stream.incomplete";
}

/// 哨兵信号：以不透明标签区分引擎的非异常结局。
///
/// # 契约说明（What）
/// - 这些值出现在投递结果（send-result）的成功分支上，调用方据此区分
///   “被消费”“被丢弃”“多路分发”等结局；它们不是错误。
/// - 终态类结局（关闭、排空、取消、超时）以 [`LaminaError`] 的稳定错误码
///   出现在错误分支上，两套标签共同覆盖全部可观测结局。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Signal {
    /// 消息被某个等待中的消费者当场取走。
    Consumed,
    /// 队列无消费者且不保留消息，消息被丢弃。
    Discarded,
    /// 消息进入队列等待后续消费。
    Queued,
    /// 消息沿多条下游边分发，聚合结果以此标记。
    QueueSplit,
    /// 消息进入下游分支（单边转发）。
    QueueBranch,
    /// 流正常排空（用于顺序消费驱动器的完成通知）。
    Drained,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Signal::Consumed => "consumed",
            Signal::Discarded => "discarded",
            Signal::Queued => "queued",
            Signal::QueueSplit => "queue-split",
            Signal::QueueBranch => "queue-branch",
            Signal::Drained => "drained",
        };
        f.write_str(tag)
    }
}
