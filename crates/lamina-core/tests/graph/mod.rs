//! 节点/边传播图契约：生命周期状态机、扇出、背压聚合与级联方向。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use lamina_core::prelude::*;
use lamina_core::{
    Edge, EdgeStyle, NodeState, Propagator, TerminalPropagator, codes, consume, success_result,
};

/// 单条消息沿多条非观察边扇出：每个下游恰好观察一次，聚合结果等到全部
/// 下游消化完毕才成功。
#[test]
fn fanout_delivers_exactly_once_per_edge_and_aggregates_backpressure() {
    let src: Channel<i64> = channel();
    let left = src.map(|v| v).expect("left edge");
    let right = src.map(|v| v).expect("right edge");

    let send = src.enqueue(9);
    assert!(
        !send.is_realized(),
        "两条下游都未消费前聚合结果保持 pending"
    );

    assert_eq!(left.read().success_value(0), 9);
    assert!(!send.is_realized(), "仍有一条下游未消费");
    assert_eq!(right.read().success_value(0), 9);
    assert_eq!(
        send.success_value(Signal::Discarded),
        Signal::QueueSplit,
        "多路分发的聚合信号"
    );

    assert_eq!(left.queued_messages(), 0, "不得重复投递");
    assert_eq!(right.queued_messages(), 0);
}

#[test]
fn node_state_follows_edge_count() {
    let src: Channel<i64> = channel();
    assert_eq!(src.state(), NodeState::Open);
    let _a = src.map(|v| v).expect("first edge");
    assert_eq!(src.state(), NodeState::Open);
    let _b = src.map(|v| v).expect("second edge");
    assert_eq!(src.state(), NodeState::Split);
}

#[test]
fn grounded_node_stays_open_regardless_of_edges() {
    let src: Channel<i64> =
        Channel::with_options(ChannelOptions::new().grounded(true));
    let _a = src.map(|v| v).expect("first edge");
    let _b = src.map(|v| v).expect("second edge");
    assert_eq!(src.state(), NodeState::Open, "接地节点钉在 open");
}

/// 消费协议：独占属主、二次消费失败、归还后恢复。
#[test]
fn consume_is_exclusive_and_reversible() {
    let src: Channel<i64> = channel();
    let sink = TerminalPropagator::new("sink", |_msg: i64| success_result(Signal::Consumed));
    let handle = consume(
        src.emitter_node(),
        Edge::standard("owner", sink as Arc<dyn Propagator<i64>>),
    )
    .expect("first consumption");
    assert_eq!(src.state(), NodeState::Consumed);

    let second = TerminalPropagator::new("late", |_msg: i64| success_result(Signal::Consumed));
    let refused = consume(
        src.emitter_node(),
        Edge::standard("late", second as Arc<dyn Propagator<i64>>),
    );
    assert_eq!(
        refused.err().expect("exclusive").code(),
        codes::NODE_ALREADY_CONSUMED
    );

    assert!(handle.unconsume());
    assert_eq!(src.state(), NodeState::Open, "归还消费权后恢复 open");
}

/// 消费态绕过队列：消息直达属主边，队列不增长。
#[test]
fn consumed_node_streams_without_queueing() {
    let src: Channel<i64> = channel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink = TerminalPropagator::new("owner", move |msg: i64| {
        sink_seen.lock().push(msg);
        success_result(Signal::Consumed)
    });
    let _handle = consume(
        src.emitter_node(),
        Edge::standard("owner", sink as Arc<dyn Propagator<i64>>),
    )
    .expect("consume");

    let send = src.enqueue(1);
    assert_eq!(send.success_value(Signal::Discarded), Signal::Consumed);
    src.enqueue(2);
    assert_eq!(&*seen.lock(), &[1, 2]);
    assert_eq!(src.queued_messages(), 0, "消费态不入队");
}

#[test]
fn tap_sees_errors_but_not_backpressure() {
    let src: Channel<i64> = channel();
    let observed = Arc::new(AtomicUsize::new(0));
    let tap = src.tap().expect("tap");
    let count = Arc::clone(&observed);
    tap.receive_all(move |_msg| {
        count.fetch_add(1, Ordering::SeqCst);
    })
    .expect("subscribe tap");

    // 观察边不参与背压：非观察下游为空集时聚合空洞地成功。
    let send = src.enqueue(1);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(send.success_value(Signal::Consumed), Signal::Discarded);

    src.error(LaminaError::new(codes::OPERATOR_PANIC, "boom"));
    assert_eq!(tap.state(), NodeState::Error, "错误跨观察边传播");
}

#[test]
fn tap_closes_with_source_but_not_vice_versa() {
    let src: Channel<i64> = channel();
    let tap = src.tap().expect("tap");
    tap.close();
    assert!(!src.is_closed(), "观察端关闭不影响源");

    let src2: Channel<i64> = channel();
    let tap2 = src2.tap().expect("tap");
    src2.close();
    assert!(tap2.is_closed(), "源关闭级联到观察端");
}

#[test]
fn fork_survives_own_close_and_inherits_source_errors() {
    let src: Channel<i64> = channel();
    let fork = src.fork().expect("fork");
    fork.close();
    assert!(!src.is_closed(), "关闭分叉不关闭源");

    let fork2 = src.fork().expect("second fork");
    src.error(LaminaError::new(codes::OPERATOR_PANIC, "boom"));
    assert_eq!(fork2.state(), NodeState::Error, "源错误传入分叉");
}

/// 算子抛出使节点进入错误态：本次投递得到错误结果，此后所有投递同样
/// 失败，错误沿边级联。
#[test]
fn operator_panic_fails_node_permanently() {
    let src: Channel<i64> = channel();
    let broken = src
        .map(|v: i64| {
            if v == 13 {
                panic!("cursed value");
            }
            v
        })
        .expect("map");
    let downstream = broken.map(|v| v).expect("downstream");

    let poisoned = src.enqueue(13);
    assert_eq!(
        poisoned.error_value().expect("errored").code(),
        codes::OPERATOR_PANIC
    );
    assert_eq!(broken.state(), NodeState::Error);
    assert_eq!(downstream.state(), NodeState::Error, "错误沿边级联");

    let after = src.enqueue(1);
    assert_eq!(
        after.error_value().expect("node stays errored").code(),
        codes::OPERATOR_PANIC
    );
}

#[test]
fn errored_node_never_recovers() {
    let ch: Channel<i64> = channel();
    ch.error(LaminaError::new(codes::OPERATOR_PANIC, "boom"));
    assert!(!ch.close(), "错误态不可迁出");
    assert_eq!(ch.state(), NodeState::Error);
}

/// `propagate` 的 `transform` 标志：为假时走原样转发路径绕过算子。
#[test]
fn propagate_without_transform_bypasses_operator() {
    let src: Channel<i64> = channel();
    let filtered = src.filter(|v| v % 2 == 0).expect("filter");

    let dropped = filtered.receiver_node().propagate(3, true);
    assert_eq!(
        dropped.success_value(Signal::Consumed),
        Signal::Discarded,
        "变换路径上奇数被谓词过滤"
    );
    assert_eq!(filtered.queued_messages(), 0);

    filtered.receiver_node().propagate(3, false);
    assert_eq!(
        filtered.read().success_value(0),
        3,
        "原样转发路径绕过谓词"
    );
}

#[test]
fn ground_discards_messages_without_buffering() {
    let ch: Channel<i64> = channel();
    ch.ground().expect("ground");
    let send = ch.enqueue(1);
    assert_eq!(send.success_value(Signal::Consumed), Signal::Discarded);
    assert_eq!(ch.queued_messages(), 0);
}

#[test]
fn on_closed_and_on_drained_fire_in_order() {
    let ch: Channel<i64> = channel();
    let events = Arc::new(Mutex::new(Vec::new()));
    let closed_events = Arc::clone(&events);
    ch.on_closed(move || closed_events.lock().push("closed"));
    let drained_events = Arc::clone(&events);
    ch.on_drained(move || drained_events.lock().push("drained"));

    ch.enqueue(1);
    ch.close();
    assert_eq!(&*events.lock(), &["closed"], "积压未清空前不排空");
    assert_eq!(ch.read().success_value(0), 1);
    assert_eq!(&*events.lock(), &["closed", "drained"]);
    assert!(ch.is_drained());
}

#[test]
fn edge_styles_expose_construction_metadata() {
    let sink = TerminalPropagator::new("sink", |_msg: i64| success_result(Signal::Consumed));
    let edge = Edge::tap("probe", sink as Arc<dyn Propagator<i64>>);
    assert_eq!(edge.style(), EdgeStyle::Tap);
    assert_eq!(edge.description(), "probe");
}

/// 清空积压：drain 返回既有消息并结清其监听者。
#[test]
fn drain_returns_backlog_and_settles_listeners() {
    let ch: Channel<i64> = channel();
    let send = ch.enqueue(1);
    ch.enqueue(2);
    assert_eq!(ch.drain(), vec![1, 2]);
    assert_eq!(send.success_value(Signal::Discarded), Signal::Consumed);
    assert_eq!(ch.queued_messages(), 0);
}
