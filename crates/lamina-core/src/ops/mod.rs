//! 高阶算子：基于顺序消费驱动器的流变换，与基于共享定时器的时间算子。
//!
//! 全部算子只依赖通道门面、节点图与延迟结果三件原语；流式算子对回调保证
//! 严格 FIFO，回调返回延迟结果时推迟后续读取，源排空时终止并关闭输出。

mod driver;
mod seq;
mod timed;

pub use seq::{ChannelSeq, channel_to_seq, channel_to_seq_with_timeout};
pub use timed::{combine_latest, partition_every, periodically, sample_every};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::{LaminaError, Signal, codes};
use crate::result::{ResultChannel, SendResult};

use driver::{DriverStep, drive_in_order};

fn spawn_ordered<I, O>(
    ch: &Channel<I, O>,
    description: &'static str,
    on_msg: impl FnMut(O) -> DriverStep + Send + 'static,
    on_done: impl FnOnce(Option<LaminaError>) + Send + 'static,
) -> Result<(), LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    drive_in_order(ch.emitter_node(), description, on_msg, on_done)
}

fn settle<A: Send + 'static, B: Clone + Send + 'static>(
    dst: Channel<A, B>,
) -> impl FnOnce(Option<LaminaError>) + Send + 'static {
    move |error| match error {
        Some(error) => dst.error(error),
        None => {
            dst.close();
        }
    }
}

/// 取前 `n` 条消息；取满或源排空后关闭输出。
pub fn take<I, O>(n: usize, ch: &Channel<I, O>) -> Result<Channel<O, O>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let dst = ch.mimic();
    if n == 0 {
        dst.close();
        return Ok(dst);
    }
    let out = dst.clone();
    let mut count = 0usize;
    spawn_ordered(
        ch,
        "take",
        move |msg| {
            count += 1;
            let _ = out.enqueue(msg);
            if count >= n {
                DriverStep::Stop
            } else {
                DriverStep::Continue
            }
        },
        settle(dst.clone()),
    )?;
    Ok(dst)
}

/// 转发消息直到谓词首次为假；该消息不被转发。
pub fn take_while<I, O>(
    predicate: impl Fn(&O) -> bool + Send + 'static,
    ch: &Channel<I, O>,
) -> Result<Channel<O, O>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let dst = ch.mimic();
    let out = dst.clone();
    spawn_ordered(
        ch,
        "take-while",
        move |msg| {
            if predicate(&msg) {
                let _ = out.enqueue(msg);
                DriverStep::Continue
            } else {
                DriverStep::Stop
            }
        },
        settle(dst.clone()),
    )?;
    Ok(dst)
}

/// 流式规约：先发射初始累积值，其后每条消息发射一次新累积值。
pub fn reductions<I, O, A>(
    ch: &Channel<I, O>,
    initial: A,
    f: impl Fn(&A, O) -> A + Send + 'static,
) -> Result<Channel<A, A>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    let dst: Channel<A, A> = ch.mimic_as();
    let _ = dst.enqueue(initial.clone());
    let out = dst.clone();
    let mut acc = initial;
    spawn_ordered(
        ch,
        "reductions",
        move |msg| {
            acc = f(&acc, msg);
            let _ = out.enqueue(acc.clone());
            DriverStep::Continue
        },
        settle(dst.clone()),
    )?;
    Ok(dst)
}

/// 终值规约：源排空时以最终累积值成功。
pub fn reduce<I, O, A>(
    ch: &Channel<I, O>,
    initial: A,
    f: impl Fn(&A, O) -> A + Send + 'static,
) -> Result<ResultChannel<A>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    let result = ResultChannel::new();
    let out = result.clone();
    let acc = Arc::new(Mutex::new(initial));
    let fold = Arc::clone(&acc);
    spawn_ordered(
        ch,
        "reduce",
        move |msg| {
            let mut slot = fold.lock();
            let next = f(&slot, msg);
            *slot = next;
            DriverStep::Continue
        },
        move |error| match error {
            Some(error) => {
                let _ = out.fail(error);
            }
            None => {
                let _ = out.succeed(acc.lock().clone());
            }
        },
    )?;
    Ok(result)
}

/// 源排空时给出最后一条消息；空流以 `stream.incomplete` 失败。
pub fn last<I, O>(ch: &Channel<I, O>) -> Result<ResultChannel<O>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let result = ResultChannel::new();
    let out = result.clone();
    let seen: Arc<Mutex<Option<O>>> = Arc::new(Mutex::new(None));
    let track = Arc::clone(&seen);
    spawn_ordered(
        ch,
        "last",
        move |msg| {
            *track.lock() = Some(msg);
            DriverStep::Continue
        },
        move |error| match error {
            Some(error) => {
                let _ = out.fail(error);
            }
            None => match seen.lock().take() {
                Some(value) => {
                    let _ = out.succeed(value);
                }
                None => {
                    let _ = out.fail(LaminaError::new(
                        codes::STREAM_INCOMPLETE,
                        "stream drained before producing a message",
                    ));
                }
            },
        },
    )?;
    Ok(result)
}

/// 滑动窗口分组；`partition(n)` 等价于步长为 `n` 的窗口。不足一窗的残余
/// 在源排空时丢弃。
pub fn partition<I, O>(n: usize, ch: &Channel<I, O>) -> Result<Channel<Vec<O>, Vec<O>>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    partition_step(n, n, ch)
}

/// 带步长的滑动窗口分组。
pub fn partition_step<I, O>(
    n: usize,
    step: usize,
    ch: &Channel<I, O>,
) -> Result<Channel<Vec<O>, Vec<O>>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let n = n.max(1);
    let step = step.max(1);
    let dst: Channel<Vec<O>, Vec<O>> = ch.mimic_as();
    let out = dst.clone();
    let mut window: Vec<O> = Vec::new();
    spawn_ordered(
        ch,
        "partition",
        move |msg| {
            window.push(msg);
            if window.len() == n {
                let _ = out.enqueue(window.clone());
                window.drain(..step.min(window.len()));
            }
            DriverStep::Continue
        },
        settle(dst.clone()),
    )?;
    Ok(dst)
}

/// 完整分组：每满 `n` 条发射一组，源排空时发射非空残余。
pub fn partition_all<I, O>(
    n: usize,
    ch: &Channel<I, O>,
) -> Result<Channel<Vec<O>, Vec<O>>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let n = n.max(1);
    let dst: Channel<Vec<O>, Vec<O>> = ch.mimic_as();
    let out = dst.clone();
    let buffer: Arc<Mutex<Vec<O>>> = Arc::new(Mutex::new(Vec::new()));
    let fill = Arc::clone(&buffer);
    let flush_dst = dst.clone();
    spawn_ordered(
        ch,
        "partition-all",
        move |msg| {
            let mut buf = fill.lock();
            buf.push(msg);
            if buf.len() == n {
                let batch = std::mem::take(&mut *buf);
                drop(buf);
                let _ = out.enqueue(batch);
            }
            DriverStep::Continue
        },
        move |error| {
            match error {
                Some(error) => flush_dst.error(error),
                None => {
                    let rest = std::mem::take(&mut *buffer.lock());
                    if !rest.is_empty() {
                        let _ = flush_dst.enqueue(rest);
                    }
                    flush_dst.close();
                }
            }
        },
    )?;
    Ok(dst)
}

/// 展平消息序列：每条 `Vec` 的元素逐个转发。
pub fn concat<I, O>(ch: &Channel<I, Vec<O>>) -> Result<Channel<O, O>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    mapcat(ch, |batch: Vec<O>| batch)
}

/// 映射后展平。
pub fn mapcat<I, O, U>(
    ch: &Channel<I, O>,
    f: impl Fn(O) -> Vec<U> + Send + 'static,
) -> Result<Channel<U, U>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    let dst: Channel<U, U> = ch.mimic_as();
    let out = dst.clone();
    spawn_ordered(
        ch,
        "mapcat",
        move |msg| {
            for item in f(msg) {
                let _ = out.enqueue(item);
            }
            DriverStep::Continue
        },
        settle(dst.clone()),
    )?;
    Ok(dst)
}

/// 严格串行地消费：`f` 返回的延迟结果实现之前不读取下一条。
/// 返回的结果在源排空时以 `drained` 信号成功。
pub fn receive_in_order<I, O>(
    ch: &Channel<I, O>,
    mut f: impl FnMut(O) -> Option<SendResult> + Send + 'static,
) -> Result<ResultChannel<Signal>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let completion = ResultChannel::new();
    let done = completion.clone();
    spawn_ordered(
        ch,
        "receive-in-order",
        move |msg| match f(msg) {
            Some(pending) => DriverStep::Wait(pending),
            None => DriverStep::Continue,
        },
        move |error| match error {
            Some(error) => {
                let _ = done.fail(error);
            }
            None => {
                let _ = done.succeed(Signal::Drained);
            }
        },
    )?;
    Ok(completion)
}

/// 按序转发到新通道，并以下游投递结果为节拍：下游未消化完当前消息之前
/// 不读取下一条。
pub fn emit_in_order<I, O>(ch: &Channel<I, O>) -> Result<Channel<O, O>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let dst = ch.mimic();
    let out = dst.clone();
    spawn_ordered(
        ch,
        "emit-in-order",
        move |msg| DriverStep::Wait(out.enqueue(msg)),
        settle(dst.clone()),
    )?;
    Ok(dst)
}
