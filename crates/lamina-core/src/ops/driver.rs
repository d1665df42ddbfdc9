use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::LaminaError;
use crate::graph::{ConsumeHandle, Edge, EmitterNode, Node, NodeOptions, Propagator, consume};
use crate::result::SendResult;

/// 回调对驱动器的指令。
pub(crate) enum DriverStep {
    /// 同步继续读取下一条。
    Continue,
    /// 等待给定投递结果实现后再读取下一条。
    Wait(SendResult),
    /// 停止消费并触发完成回调。
    Stop,
}

/// 顺序消费驱动器。
///
/// # 设计背景（Why）
/// - 原实现为每个算子宏展开一条专用流水线；此处以单一泛型驱动器替代：
///   临时消费源节点，把消息引流到私有中继节点，再以“读取—回调—重启”的
///   蹦床循环逐条派发。
/// - 严格串行：同一时刻至多一个未决读取，回调返回的延迟结果实现之前不会
///   发起下一次读取，因此回调绝不重叠。
///
/// # 契约说明（What）
/// - 源被独占消费；已存在属主时构造失败（`node.already_consumed`）。
/// - 源排空视为正常完成（`on_done(None)`）；其余错误原样上抛
///   （`on_done(Some(err))`）。提前停止会归还消费权并关闭中继。
pub(crate) struct InOrderDriver<O> {
    relay: Arc<dyn EmitterNode<O>>,
    consumption: Mutex<Option<ConsumeHandle<O>>>,
    on_msg: Mutex<Box<dyn FnMut(O) -> DriverStep + Send>>,
    on_done: Mutex<Option<Box<dyn FnOnce(Option<LaminaError>) + Send>>>,
}

/// 启动一次顺序消费。
pub(crate) fn drive_in_order<O: Clone + Send + 'static>(
    source: &Arc<dyn EmitterNode<O>>,
    description: &'static str,
    on_msg: impl FnMut(O) -> DriverStep + Send + 'static,
    on_done: impl FnOnce(Option<LaminaError>) + Send + 'static,
) -> Result<(), LaminaError> {
    let relay = Node::<O, O>::identity(NodeOptions::named(description));
    let relay_emitter: Arc<dyn EmitterNode<O>> = relay.clone();
    let handle = consume(
        source,
        Edge::standard(description, relay as Arc<dyn Propagator<O>>),
    )?;
    let driver = Arc::new(InOrderDriver {
        relay: relay_emitter,
        consumption: Mutex::new(Some(handle)),
        on_msg: Mutex::new(Box::new(on_msg)),
        on_done: Mutex::new(Some(Box::new(on_done))),
    });
    driver.run();
    Ok(())
}

impl<O: Clone + Send + 'static> InOrderDriver<O> {
    fn run(self: &Arc<Self>) {
        loop {
            let rc = self.relay.receive(None, None, None);
            match rc.poll() {
                Some(Ok(msg)) => {
                    if !self.advance(msg) {
                        return;
                    }
                }
                Some(Err(error)) => {
                    self.finish_terminal(error);
                    return;
                }
                None => {
                    let resume = Arc::clone(self);
                    rc.on_success(move |msg| {
                        if resume.advance(msg) {
                            resume.run();
                        }
                    });
                    let rescue = Arc::clone(self);
                    rc.on_error(move |error| rescue.finish_terminal(error));
                    return;
                }
            }
        }
    }

    /// 返回 `true` 表示可以同步继续读取。
    fn advance(self: &Arc<Self>, msg: O) -> bool {
        let step = (*self.on_msg.lock())(msg);
        match step {
            DriverStep::Continue => true,
            DriverStep::Stop => {
                self.finish(None);
                false
            }
            DriverStep::Wait(pending) => match pending.poll() {
                // 已同步实现的等待直接折叠进蹦床循环，避免监听者递归加深。
                Some(Ok(_)) => true,
                Some(Err(error)) => {
                    self.finish(Some(error));
                    false
                }
                None => {
                    let resume = Arc::clone(self);
                    pending.on_success(move |_| resume.run());
                    let rescue = Arc::clone(self);
                    pending.on_error(move |error| rescue.finish(Some(error)));
                    false
                }
            },
        }
    }

    fn finish_terminal(self: &Arc<Self>, error: LaminaError) {
        if error.is_drained() {
            self.finish(None);
        } else {
            self.finish(Some(error));
        }
    }

    fn finish(self: &Arc<Self>, error: Option<LaminaError>) {
        let Some(done) = self.on_done.lock().take() else {
            return;
        };
        if let Some(handle) = self.consumption.lock().take() {
            handle.unconsume();
        }
        self.relay.close_node(true);
        done(error);
    }
}
