use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::{LaminaError, codes};
use crate::graph::EmitterNode;

/// 惰性序列桥：把通道变成阻塞式迭代器。
///
/// # 契约说明（What）
/// - 每次 `next` 同步等待一条消息；源排空时迭代正常结束。
/// - 配置了单条超时（[`channel_to_seq_with_timeout`]）且等待到期时，迭代
///   结束并把超时错误存入 [`ChannelSeq::error`]；超时会先尝试取消挂起的
///   接收，取消落空说明消息已在途，此时照常产出该消息（超时不丢消息）。
/// - 除排空外的终止错误同样存入 `error` 供调用方检视。
pub struct ChannelSeq<O> {
    emitter: Arc<dyn EmitterNode<O>>,
    timeout: Option<Duration>,
    error: Option<LaminaError>,
    finished: bool,
}

impl<O> ChannelSeq<O> {
    /// 迭代终止后的非排空原因（若有）。
    pub fn error(&self) -> Option<&LaminaError> {
        self.error.as_ref()
    }
}

/// 无超时的序列桥。
pub fn channel_to_seq<I, O>(ch: &Channel<I, O>) -> ChannelSeq<O>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    ChannelSeq {
        emitter: Arc::clone(ch.emitter_node()),
        timeout: None,
        error: None,
        finished: false,
    }
}

/// 带单条超时的序列桥。
pub fn channel_to_seq_with_timeout<I, O>(ch: &Channel<I, O>, timeout: Duration) -> ChannelSeq<O>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    ChannelSeq {
        emitter: Arc::clone(ch.emitter_node()),
        timeout: Some(timeout),
        error: None,
        finished: false,
    }
}

impl<O: Clone + Send + 'static> Iterator for ChannelSeq<O> {
    type Item = O;

    fn next(&mut self) -> Option<O> {
        if self.finished {
            return None;
        }
        let rc = self.emitter.receive(None, None, None);
        match rc.wait(self.timeout) {
            Ok(value) => Some(value),
            Err(error) if error.is_drained() => {
                self.finished = true;
                None
            }
            Err(error) => {
                if error.code() == codes::RECEIVE_TIMEOUT && !self.emitter.cancel_receive(&rc) {
                    // 取消落空：消息与超时竞争中胜出，照常产出。
                    if let Some(Ok(value)) = rc.poll() {
                        return Some(value);
                    }
                }
                self.finished = true;
                self.error = Some(error);
                None
            }
        }
    }
}
