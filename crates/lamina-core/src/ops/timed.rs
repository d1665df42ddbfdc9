use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{Channel, ChannelOptions};
use crate::error::LaminaError;
use crate::runtime::Context;

/// 每 `period` 发射一次 `f()`；输出通道关闭后停表。
pub fn periodically<O: Clone + Send + 'static>(
    context: &Context,
    period: Duration,
    f: impl Fn() -> O + Send + 'static,
) -> Channel<O, O> {
    let ch: Channel<O, O> = Channel::with_options(
        ChannelOptions::new()
            .description("periodically")
            .context(context.clone()),
    );
    let out = ch.clone();
    context.timer().schedule_periodic(period, move || {
        if out.is_closed() {
            return false;
        }
        let _ = out.enqueue(f());
        true
    });
    ch
}

/// 周期采样：保留最近一条消息，每个周期发射其快照；从未有消息的周期
/// 跳过。源关闭时输出关闭。
pub fn sample_every<I, O>(period: Duration, ch: &Channel<I, O>) -> Result<Channel<O, O>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let dst = ch.mimic();
    let latest: Arc<Mutex<Option<O>>> = Arc::new(Mutex::new(None));
    let write = Arc::clone(&latest);
    ch.receive_all(move |msg| {
        *write.lock() = Some(msg);
    })?;

    let out = dst.clone();
    ch.context().timer().schedule_periodic(period, move || {
        if out.is_closed() {
            return false;
        }
        let sample = latest.lock().clone();
        if let Some(value) = sample {
            let _ = out.enqueue(value);
        }
        true
    });

    let closer = dst.clone();
    ch.on_closed(move || {
        closer.close();
    });
    Ok(dst)
}

/// 周期分批：缓冲一个周期内到达的全部消息并整批发射；空周期跳过。
/// 源关闭时冲刷残余批并关闭输出。
pub fn partition_every<I, O>(
    period: Duration,
    ch: &Channel<I, O>,
) -> Result<Channel<Vec<O>, Vec<O>>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
{
    let dst: Channel<Vec<O>, Vec<O>> = ch.mimic_as();
    let buffer: Arc<Mutex<Vec<O>>> = Arc::new(Mutex::new(Vec::new()));
    let fill = Arc::clone(&buffer);
    ch.receive_all(move |msg| {
        fill.lock().push(msg);
    })?;

    let out = dst.clone();
    let tick_buffer = Arc::clone(&buffer);
    ch.context().timer().schedule_periodic(period, move || {
        if out.is_closed() {
            return false;
        }
        let batch = std::mem::take(&mut *tick_buffer.lock());
        if !batch.is_empty() {
            let _ = out.enqueue(batch);
        }
        true
    });

    let flush_dst = dst.clone();
    ch.on_closed(move || {
        let rest = std::mem::take(&mut *buffer.lock());
        if !rest.is_empty() {
            let _ = flush_dst.enqueue(rest);
        }
        flush_dst.close();
    });
    Ok(dst)
}

/// 组合最新值：所有输入各产出至少一条后，任一输入更新即发射
/// `f(latest_1, …, latest_n)`。全部输入关闭后输出关闭。
pub fn combine_latest<I, O, U>(
    f: impl Fn(&[O]) -> U + Send + Sync + 'static,
    inputs: &[Channel<I, O>],
) -> Result<Channel<U, U>, LaminaError>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    let context = inputs
        .first()
        .map(|ch| ch.context().clone())
        .unwrap_or_default();
    let dst: Channel<U, U> = Channel::with_options(
        ChannelOptions::new()
            .description("combine-latest")
            .context(context),
    );
    if inputs.is_empty() {
        dst.close();
        return Ok(dst);
    }

    let combine = Arc::new(f);
    let slots: Arc<Mutex<Vec<Option<O>>>> = Arc::new(Mutex::new(vec![None; inputs.len()]));
    let open_inputs = Arc::new(AtomicUsize::new(inputs.len()));
    for (index, input) in inputs.iter().enumerate() {
        let write = Arc::clone(&slots);
        let out = dst.clone();
        let combine = Arc::clone(&combine);
        input.receive_all(move |msg| {
            let combined = {
                let mut slots = write.lock();
                slots[index] = Some(msg);
                if slots.iter().all(Option::is_some) {
                    let snapshot: Vec<O> = slots.iter().cloned().flatten().collect();
                    Some(combine(&snapshot))
                } else {
                    None
                }
            };
            if let Some(value) = combined {
                let _ = out.enqueue(value);
            }
        })?;

        let remaining = Arc::clone(&open_inputs);
        let close_dst = dst.clone();
        input.on_closed(move || {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                close_dst.close();
            }
        });
    }
    Ok(dst)
}
