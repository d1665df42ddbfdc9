use criterion::{Criterion, black_box};
use std::{env, time::Duration};

use lamina_core::prelude::*;

/// 传播路径基准：验证核心热路径（入队 → 变换 → 消化）的单消息成本。
///
/// # 逻辑解析（How）
/// - `channel_create`：节点、队列与锁的构造开销；
/// - `enqueue_consume`：有等待消费者时的直达分发；
/// - `map_chain`：三级映射链 + 接地终端的全程传播。
fn bench_channel_create(c: &mut Criterion) {
    c.bench_function("channel_create", |b| {
        b.iter(|| black_box(channel::<u64>()));
    });
}

fn bench_enqueue_consume(c: &mut Criterion) {
    let ch: Channel<u64> = channel();
    c.bench_function("enqueue_consume", |b| {
        b.iter(|| {
            let rc = ch.read();
            ch.enqueue(black_box(42));
            black_box(rc.success_value(0))
        });
    });
}

fn bench_map_chain(c: &mut Criterion) {
    let ch: Channel<u64> = channel();
    let tail = ch
        .map(|v| v + 1)
        .expect("map 1")
        .map(|v| v * 2)
        .expect("map 2")
        .map(|v| v - 1)
        .expect("map 3");
    tail.ground().expect("ground tail");
    c.bench_function("map_chain", |b| {
        b.iter(|| black_box(ch.enqueue(black_box(7))));
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_channel_create(&mut criterion);
    bench_enqueue_consume(&mut criterion);
    bench_map_chain(&mut criterion);
    criterion.final_summary();
}
