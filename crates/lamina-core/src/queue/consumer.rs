use std::sync::Arc;

use crate::result::ResultChannel;

/// 谓词函数；以 `Arc` 共享以便快照复制。
pub type PredicateFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// 队列上注册的一次性接收者。
///
/// # 契约说明（What）
/// - `Simple`：无条件接收下一条消息。
/// - `Predicated`：消息到达时先求值谓词；为真则以消息成功，为假则以
///   `false_value` 成功但**不消费**消息（消息留在队列中）。
/// - 消费者等价性以结果通道同一性判定（[`Consumer::matches`]），因此
///   谓词型与简单型消费者在取消时会互相碰撞，这是有意的。
pub enum Consumer<T> {
    Simple {
        result: ResultChannel<T>,
    },
    Predicated {
        predicate: PredicateFn<T>,
        false_value: Option<T>,
        result: ResultChannel<T>,
    },
}

impl<T> Consumer<T> {
    pub fn result(&self) -> &ResultChannel<T> {
        match self {
            Consumer::Simple { result } => result,
            Consumer::Predicated { result, .. } => result,
        }
    }

    /// 是否与给定结果通道指向同一接收。
    pub fn matches(&self, rc: &ResultChannel<T>) -> bool {
        self.result().ptr_eq(rc)
    }
}

impl<T: Clone> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        match self {
            Consumer::Simple { result } => Consumer::Simple {
                result: result.clone(),
            },
            Consumer::Predicated {
                predicate,
                false_value,
                result,
            } => Consumer::Predicated {
                predicate: Arc::clone(predicate),
                false_value: false_value.clone(),
                result: result.clone(),
            },
        }
    }
}
