//! 高阶算子契约：流式变换、顺序消费与时间算子。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use lamina_core::prelude::*;
use lamina_core::{
    channel_to_seq, channel_to_seq_with_timeout, codes, combine_latest, concat, emit_in_order,
    last, mapcat, partition_all, partition_every, partition_step, periodically, receive_in_order,
    reduce, reductions, sample_every, take, take_while,
};

#[test]
fn take_from_closed_channel_yields_prefix_then_closes() {
    let src = closed_channel([1, 2, 3]);
    let taken = take(2, &src).expect("take");
    let collected: Vec<i64> = channel_to_seq(&taken).collect();
    assert_eq!(collected, vec![1, 2]);
    assert!(taken.is_closed());
}

#[test]
fn take_counts_live_messages_and_releases_source() {
    let src: Channel<i64> = channel();
    let taken = take(2, &src).expect("take");
    src.enqueue(1);
    src.enqueue(2);
    src.enqueue(3);
    let collected: Vec<i64> = channel_to_seq(&taken).collect();
    assert_eq!(collected, vec![1, 2]);
    // 取满后归还消费权：后来的消息留在源通道里。
    assert_eq!(src.queued_messages(), 1);
}

#[test]
fn take_zero_closes_immediately() {
    let src = closed_channel([1]);
    let taken = take(0, &src).expect("take");
    assert!(taken.is_closed());
    let collected: Vec<i64> = channel_to_seq(&taken).collect();
    assert!(collected.is_empty());
}

#[test]
fn take_while_stops_at_first_rejection() {
    let src = closed_channel([1, 2, 5, 1]);
    let prefix = take_while(|v: &i64| *v < 3, &src).expect("take-while");
    let collected: Vec<i64> = channel_to_seq(&prefix).collect();
    assert_eq!(collected, vec![1, 2]);
}

#[test]
fn reduce_folds_stream_to_final_value() {
    let src = closed_channel([1, 3, 2]);
    let result = reduce(&src, i64::MIN, |acc, v| (*acc).max(v)).expect("reduce");
    assert_eq!(result.success_value(0), 3);
}

#[test]
fn reductions_emits_running_accumulations() {
    let src = closed_channel([1, 2, 3]);
    let running = reductions(&src, 0, |acc, v| acc + v).expect("reductions");
    let collected: Vec<i64> = channel_to_seq(&running).collect();
    assert_eq!(collected, vec![0, 1, 3, 6]);
}

/// 往返性质：`reductions` 的末值等于同一来源上的 `reduce`。
#[test]
fn reductions_last_equals_reduce() {
    let source = [4, 7, 1, 9];
    let via_reductions = {
        let src = closed_channel(source);
        let running = reductions(&src, 0, |acc, v| acc + v).expect("reductions");
        let final_value = last(&running).expect("last");
        final_value.success_value(-1)
    };
    let via_reduce = {
        let src = closed_channel(source);
        reduce(&src, 0, |acc, v| acc + v)
            .expect("reduce")
            .success_value(-1)
    };
    assert_eq!(via_reductions, via_reduce);
}

#[test]
fn last_yields_final_message_or_incomplete() {
    let src = closed_channel([1, 2, 3]);
    assert_eq!(last(&src).expect("last").success_value(0), 3);

    let empty: Channel<i64> = closed_channel([]);
    let missing = last(&empty).expect("last on empty");
    assert_eq!(
        missing.error_value().expect("incomplete").code(),
        codes::STREAM_INCOMPLETE
    );
}

#[test]
fn partition_all_batches_and_flushes_remainder() {
    let src = closed_channel([1, 2, 3, 4]);
    let batches = partition_all(2, &src).expect("partition-all");
    let collected: Vec<Vec<i64>> = channel_to_seq(&batches).collect();
    assert_eq!(collected, vec![vec![1, 2], vec![3, 4]]);

    let odd = closed_channel([1, 2, 3]);
    let batches = partition_all(2, &odd).expect("partition-all");
    let collected: Vec<Vec<i64>> = channel_to_seq(&batches).collect();
    assert_eq!(collected, vec![vec![1, 2], vec![3]], "残余整批冲刷");
}

#[test]
fn partition_step_slides_windows() {
    let src = closed_channel([1, 2, 3]);
    let windows = partition_step(2, 1, &src).expect("partition");
    let collected: Vec<Vec<i64>> = channel_to_seq(&windows).collect();
    assert_eq!(collected, vec![vec![1, 2], vec![2, 3]], "不足一窗的残余丢弃");
}

#[test]
fn concat_and_mapcat_flatten_streams() {
    let src: Channel<Vec<i64>> = closed_channel([vec![1, 2], vec![], vec![3]]);
    let flat = concat(&src).expect("concat");
    let collected: Vec<i64> = channel_to_seq(&flat).collect();
    assert_eq!(collected, vec![1, 2, 3]);

    let src = closed_channel([1, 2]);
    let spread = mapcat(&src, |v| vec![v, v * 10]).expect("mapcat");
    let collected: Vec<i64> = channel_to_seq(&spread).collect();
    assert_eq!(collected, vec![1, 10, 2, 20]);
}

/// 顺序消费：回调返回的延迟结果实现之前不读取下一条。
#[test]
fn receive_in_order_defers_next_read_on_pending_callback() {
    let src = closed_channel([1, 2, 3]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let gate: SendResult = ResultChannel::new();

    let record = Arc::clone(&seen);
    let first_gate = gate.clone();
    let completion = receive_in_order(&src, move |msg| {
        record.lock().push(msg);
        if msg == 1 {
            Some(first_gate.clone())
        } else {
            None
        }
    })
    .expect("receive-in-order");

    assert_eq!(&*seen.lock(), &[1], "门未放行前不得读取后续消息");
    gate.succeed(Signal::Consumed).expect("open gate");
    assert_eq!(&*seen.lock(), &[1, 2, 3]);
    assert_eq!(
        completion.success_value(Signal::Discarded),
        Signal::Drained,
        "源排空后完成通知"
    );
}

#[test]
fn emit_in_order_paces_on_downstream_consumption() {
    let src = closed_channel([1, 2, 3]);
    let paced = emit_in_order(&src).expect("emit-in-order");
    let collected: Vec<i64> = channel_to_seq(&paced).collect();
    assert_eq!(collected, vec![1, 2, 3]);
}

#[test]
fn channel_to_seq_round_trips_enqueued_messages() {
    let ch: Channel<i64> = channel();
    for v in [5, 6, 7] {
        ch.enqueue(v);
    }
    ch.close();
    let collected: Vec<i64> = channel_to_seq(&ch).collect();
    assert_eq!(collected, vec![5, 6, 7]);
}

#[test]
fn channel_to_seq_timeout_surfaces_as_error() {
    let ch: Channel<i64> = channel();
    let mut seq = channel_to_seq_with_timeout(&ch, Duration::from_millis(30));
    assert_eq!(seq.next(), None);
    assert_eq!(
        seq.error().expect("timed out").code(),
        codes::RECEIVE_TIMEOUT
    );
}

#[test]
fn timed_result_realizes_after_delay() {
    let rc = timed_result(Duration::from_millis(20), 9i64);
    assert_eq!(rc.wait(Some(Duration::from_secs(5))).expect("delayed"), 9);
}

#[test]
fn periodically_emits_until_output_closes() {
    let out = periodically(Context::global(), Duration::from_millis(20), || 1i64);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    out.receive_all(move |msg| sink.lock().push(msg))
        .expect("subscribe");
    std::thread::sleep(Duration::from_millis(400));
    out.close();
    let count = seen.lock().len();
    assert!(count >= 2, "400ms 窗口内至少触发两次，实际 {count}");
}

#[test]
fn sample_every_skips_unpopulated_periods_then_repeats_latest() {
    let src: Channel<i64> = channel();
    let sampled = sample_every(Duration::from_millis(40), &src).expect("sample-every");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sampled
        .receive_all(move |msg| sink.lock().push(msg))
        .expect("subscribe");

    std::thread::sleep(Duration::from_millis(120));
    assert!(seen.lock().is_empty(), "从未有消息的周期不发射");

    src.enqueue(7);
    std::thread::sleep(Duration::from_millis(300));
    let samples = seen.lock().clone();
    assert!(!samples.is_empty(), "出现消息后按周期重发最新值");
    assert!(samples.iter().all(|v| *v == 7));

    src.close();
    assert!(sampled.is_closed(), "源关闭级联到采样输出");
}

#[test]
fn partition_every_batches_by_period_and_flushes_on_close() {
    let src: Channel<i64> = channel();
    let batches = partition_every(Duration::from_millis(40), &src).expect("partition-every");
    let seen: Arc<Mutex<Vec<Vec<i64>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    batches
        .receive_all(move |batch| sink.lock().push(batch))
        .expect("subscribe");

    src.enqueue(1);
    src.enqueue(2);
    std::thread::sleep(Duration::from_millis(200));
    src.enqueue(3);
    src.close();

    let flattened: Vec<i64> = seen.lock().iter().flatten().copied().collect();
    assert_eq!(flattened, vec![1, 2, 3], "分批不丢不重");
    assert!(batches.is_closed());
}

#[test]
fn combine_latest_waits_for_all_inputs() {
    let a: Channel<i64> = channel();
    let b: Channel<i64> = channel();
    let combined =
        combine_latest(|latest: &[i64]| latest.iter().sum::<i64>(), &[a.clone(), b.clone()])
            .expect("combine-latest");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    combined
        .receive_all(move |msg| sink.lock().push(msg))
        .expect("subscribe");

    a.enqueue(1);
    assert!(seen.lock().is_empty(), "任一输入缺位时不发射");
    b.enqueue(10);
    a.enqueue(2);
    assert_eq!(&*seen.lock(), &[11, 12]);

    a.close();
    assert!(!combined.is_closed(), "仍有输入在线");
    b.close();
    assert!(combined.is_closed(), "全部输入关闭后输出关闭");
}
