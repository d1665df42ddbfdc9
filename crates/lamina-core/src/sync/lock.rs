use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

/// 非对称读写锁。
///
/// # 设计背景（Why）
/// - 消息传播在节点上只需要快照状态与边集合，属于高频读路径；生命周期迁移
///   （关闭、出错、消费）是低频写路径。读写不对称正对应这一访问模式。
/// - 传播算法需要“跨调用边界的手递手释放”：在下游队列的独占锁内释放上游
///   节点的共享锁。RAII 守卫无法表达这种释放时机，因此锁以显式
///   `acquire`/`release` 配对暴露。
///
/// # 契约说明（What）
/// - `acquire`/`release`：共享模式，读者可并行；存在写者或排队写者时阻塞，
///   避免写者饥饿。
/// - `acquire_exclusive`/`release_exclusive`：独占模式，排斥一切读者与写者。
/// - 阻塞中的获取不可取消；锁只可能因进程级致命错误失败。
///
/// # 风险提示（Trade-offs）
/// - 释放与获取必须严格配对；错配会使锁计数失衡并永久阻塞后续调用方。
///   引擎内部只通过 [`cell::LockedCore`](super::cell) 与显式守卫访问该锁。
pub struct AsymmetricLock {
    id: u64,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl AsymmetricLock {
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// 全进程唯一的稳定序号，[`acquire_all`] 以此排序取锁。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 共享模式获取。
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        while state.writer || state.writers_waiting > 0 {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    /// 共享模式释放。
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "release without matching acquire");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    /// 独占模式获取。
    pub fn acquire_exclusive(&self) {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
    }

    /// 独占模式释放。
    pub fn release_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "exclusive release without matching acquire");
        state.writer = false;
        self.cond.notify_all();
    }
}

impl Default for AsymmetricLock {
    fn default() -> Self {
        Self::new()
    }
}

/// 以规范顺序批量获取一组锁，返回按 LIFO 释放的守卫。
///
/// # 契约说明（What）
/// - **输入**：任意顺序、可含重复引用的锁集合；重复项按序号去重后只取一次。
/// - **后置条件**：无论并发调用方以何种排列传入同一集合，取锁顺序一致
///   （按 [`AsymmetricLock::id`] 升序），因此不会发生环路等待。
/// - 守卫析构时按获取顺序的逆序释放。
pub fn acquire_all<'a>(exclusive: bool, locks: &[&'a AsymmetricLock]) -> LockSetGuard<'a> {
    let mut ordered: Vec<&'a AsymmetricLock> = locks.to_vec();
    ordered.sort_by_key(|lock| lock.id());
    ordered.dedup_by_key(|lock| lock.id());
    for lock in &ordered {
        if exclusive {
            lock.acquire_exclusive();
        } else {
            lock.acquire();
        }
    }
    LockSetGuard {
        acquired: ordered,
        exclusive,
    }
}

/// [`acquire_all`] 的释放守卫。
pub struct LockSetGuard<'a> {
    acquired: Vec<&'a AsymmetricLock>,
    exclusive: bool,
}

impl LockSetGuard<'_> {
    /// 实际持有的锁数量（重复引用去重后）。
    pub fn len(&self) -> usize {
        self.acquired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty()
    }
}

impl Drop for LockSetGuard<'_> {
    fn drop(&mut self) {
        for lock in self.acquired.iter().rev() {
            if self.exclusive {
                lock.release_exclusive();
            } else {
                lock.release();
            }
        }
    }
}
