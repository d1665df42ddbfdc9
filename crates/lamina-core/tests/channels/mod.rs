//! 通道门面契约：构造、投递、读取、订阅与组合子的端到端语义。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use lamina_core::prelude::*;
use lamina_core::{NodeState, codes};

fn collect_all<T: Clone + Send + 'static>(ch: &Channel<T, T>) -> Arc<Mutex<Vec<T>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ch.receive_all(move |msg| sink.lock().push(msg))
        .expect("subscribe channel");
    seen
}

/// 映射链上的端到端传播。
///
/// # 测试步骤（How）
/// 1. 预置消息 0、1、2 的通道上挂 `map(+1)`，订阅映射端；
/// 2. 向源通道补发 3，向映射通道直接投递 4；
/// 3. 断言观察序列 `[1,2,3,4,5]`：积压回放、下游传播与接收端变换共同生效。
#[test]
fn map_chain_replays_backlog_and_transforms_direct_enqueues() {
    let ch: Channel<i64> =
        Channel::with_options(ChannelOptions::new().messages([0, 1, 2]));
    let mapped = ch.map(|v| v + 1).expect("attach map");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    mapped
        .receive_all(move |msg| sink.lock().push(msg))
        .expect("subscribe mapped channel");

    ch.enqueue(3);
    mapped.enqueue(4);

    assert_eq!(&*seen.lock(), &[1, 2, 3, 4, 5]);
}

#[test]
fn filter_after_map_keeps_even_values_only() {
    let ch: Channel<i64> =
        Channel::with_options(ChannelOptions::new().messages([0, 1, 2]));
    let filtered = ch
        .map(|v| v + 1)
        .expect("attach map")
        .filter(|v| v % 2 == 0)
        .expect("attach filter");
    let seen = collect_all(&filtered);

    ch.enqueue(3);
    ch.enqueue(4);

    assert_eq!(&*seen.lock(), &[2, 4]);
}

/// 首读即得、次读挂起后被取消。
#[test]
fn second_read_blocks_then_cancels() {
    let ch: Channel<&'static str> = channel();
    ch.enqueue("m");

    let first = ch.read();
    assert_eq!(first.success_value(""), "m");

    let second = ch.read();
    assert!(!second.is_realized(), "无消息时读取保持挂起");
    assert!(ch.cancel_receive(&second));
    assert_eq!(
        second.error_value().expect("cancelled").code(),
        codes::RECEIVE_CANCELLED
    );

    // 取消不丢消息：后续投递由下一个读取完整接收。
    ch.enqueue("n");
    assert_eq!(ch.read().success_value(""), "n");
}

#[test]
fn read_with_timeout_errors_when_no_message_arrives() {
    let ch: Channel<i64> = channel();
    let rc = ch.read_with(ReadOptions::new().timeout(Duration::from_millis(30)));
    let err = rc.wait(Some(Duration::from_secs(5))).expect_err("times out");
    assert_eq!(err.code(), codes::RECEIVE_TIMEOUT);

    // 超时落败的消费者不消费消息。
    ch.enqueue(7);
    assert_eq!(ch.read().success_value(0), 7);
}

#[test]
fn read_with_on_timeout_substitutes_value() {
    let ch: Channel<i64> = channel();
    let rc = ch.read_with(
        ReadOptions::new()
            .timeout(Duration::from_millis(30))
            .on_timeout(-1),
    );
    assert_eq!(rc.wait(Some(Duration::from_secs(5))).expect("fallback"), -1);
}

#[test]
fn read_with_predicate_returns_false_value_and_keeps_message() {
    let ch: Channel<i64> = channel();
    ch.enqueue(3);
    let rc = ch.read_with(ReadOptions::new().predicate(|v| v % 2 == 0, -1));
    assert_eq!(rc.success_value(0), -1);
    assert_eq!(ch.queued_messages(), 1, "谓词为假不消费消息");
    assert_eq!(ch.read().success_value(0), 3);
}

#[test]
fn read_with_on_drained_substitutes_terminal() {
    let ch: Channel<i64> = closed_channel([]);
    let rc = ch.read_with(ReadOptions::new().on_drained(42));
    assert_eq!(rc.success_value(0), 42);
}

#[test]
fn close_is_monotone_and_idempotent() {
    let ch: Channel<i64> = channel();
    assert!(ch.close());
    assert!(ch.is_closed());
    assert!(!ch.close(), "重复关闭为空操作");
    assert!(ch.is_closed());
    let refused = ch.enqueue(1);
    assert_eq!(
        refused.error_value().expect("closed").code(),
        codes::QUEUE_ALREADY_CLOSED
    );
}

#[test]
fn permanent_channel_resists_close_until_forced() {
    let ch: Channel<i64> =
        Channel::with_options(ChannelOptions::new().permanent(true));
    assert!(!ch.close(), "永久通道拒绝普通关闭");
    assert!(!ch.is_closed());
    assert!(ch.force_close());
    assert!(ch.is_closed());
}

#[test]
fn closed_channel_still_serves_backlog() {
    let ch = closed_channel([1, 2]);
    assert!(ch.is_closed());
    assert_eq!(ch.read().success_value(0), 1);
    assert_eq!(ch.read().success_value(0), 2);
    assert!(ch.is_drained());
    let exhausted = ch.read();
    assert_eq!(
        exhausted.error_value().expect("drained").code(),
        codes::QUEUE_DRAINED
    );
}

#[test]
fn receive_all_unsubscribes_via_cancellation_key() {
    let ch: Channel<i64> = channel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let key = ch
        .receive_all(move |msg| sink.lock().push(msg))
        .expect("subscribe");
    ch.enqueue(1);
    assert!(ch.cancel(key));
    ch.enqueue(2);
    assert_eq!(&*seen.lock(), &[1], "退订后不再收到消息");
    assert!(!ch.cancel(key), "取消句柄一次性");
}

#[test]
fn enqueue_backpressure_resolves_on_consumption() {
    let ch: Channel<i64> = channel();
    let send = ch.enqueue(5);
    assert!(!send.is_realized(), "无消费者时投递结果保持 pending");
    assert_eq!(ch.read().success_value(0), 5);
    assert_eq!(send.success_value(Signal::Discarded), Signal::Consumed);
}

#[test]
fn mimic_preserves_description_and_transactionality() {
    let ch: Channel<i64> = Channel::with_options(
        ChannelOptions::new()
            .description("telemetry")
            .transactional(true),
    );
    let copy = ch.mimic();
    assert_eq!(copy.description(), "telemetry");
    assert!(copy.is_transactional());
    assert!(!copy.is_closed());
}

#[test]
fn transactional_channel_round_trips_messages() {
    let ch: Channel<i64> =
        Channel::with_options(ChannelOptions::new().transactional(true));
    ch.enqueue(11);
    assert_eq!(ch.read().success_value(0), 11);
    let scoped = lamina_core::transaction(|| {
        ch.enqueue(12);
        ch.read().success_value(0)
    });
    assert_eq!(scoped, 12);
}

#[test]
fn splice_separates_head_and_tail_transforms() {
    let front: Channel<i64> = channel();
    let back = front.map(|v| v * 10).expect("link tail");
    let spliced = splice(&front, &back);
    spliced.enqueue(4);
    assert_eq!(spliced.read().success_value(0), 40);
}

#[test]
fn siphon_propagates_close_downstream_only() {
    let src: Channel<i64> = channel();
    let dst: Channel<i64> = channel();
    src.siphon(&dst).expect("siphon");
    src.enqueue(1);
    assert_eq!(dst.read().success_value(0), 1);

    dst.close();
    assert!(!src.is_closed(), "下游关闭不回灌 siphon 源");

    let src2: Channel<i64> = channel();
    let dst2: Channel<i64> = channel();
    src2.siphon(&dst2).expect("siphon");
    src2.close();
    assert!(dst2.is_closed(), "源关闭级联到下游");
}

#[test]
fn join_propagates_close_both_ways() {
    let src: Channel<i64> = channel();
    let dst: Channel<i64> = channel();
    src.join(&dst).expect("join");
    dst.close();
    assert!(src.is_closed(), "join 边把下游关闭级联回源");
}

#[test]
fn bridge_join_feeds_backpressure_from_callback() {
    let src: Channel<i64> = channel();
    let gate: SendResult = ResultChannel::new();
    let callback_gate = gate.clone();
    src.bridge_join("bridge", move |_msg| callback_gate.clone())
        .expect("bridge");
    let send = src.enqueue(1);
    assert!(!send.is_realized(), "桥接回调未完成前背压保持 pending");
    gate.succeed(Signal::Consumed).expect("complete bridge work");
    assert_eq!(send.success_value(Signal::Discarded), Signal::Consumed);
}

#[test]
fn explicit_error_marks_channel_and_future_enqueues() {
    let ch: Channel<i64> = channel();
    ch.error(LaminaError::new(codes::OPERATOR_PANIC, "boom"));
    assert_eq!(ch.state(), NodeState::Error);
    let refused = ch.enqueue(1);
    assert_eq!(refused.error_value().expect("errored").code(), codes::OPERATOR_PANIC);
    assert_eq!(ch.stored_error().expect("stored").code(), codes::OPERATOR_PANIC);
}
