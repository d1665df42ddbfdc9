use std::cell::{Cell, UnsafeCell};
use std::ops::Deref;

use super::AsymmetricLock;

/// 由 [`AsymmetricLock`] 保护的共享可变单元。
///
/// # 安全性（Safety）
/// - 对内部数据的访问只发生在持有对应锁模式期间：`read` 持共享锁提供 `&T`，
///   `write` 持独占锁提供 `&mut T`，`begin_read` 返回的 [`ReadPass`] 在
///   解锁前提供 `&T`。
/// - `ReadPass` 持有裸指针因而 `!Send`，手递手释放只会发生在取锁线程上。
pub(crate) struct LockedCore<T> {
    lock: AsymmetricLock,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for LockedCore<T> {}
unsafe impl<T: Send> Sync for LockedCore<T> {}

impl<T> LockedCore<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            lock: AsymmetricLock::new(),
            cell: UnsafeCell::new(value),
        }
    }

    /// 暴露底层锁，供诊断采样通过 [`acquire_all`](super::acquire_all) 冻结子图。
    pub(crate) fn lock_handle(&self) -> &AsymmetricLock {
        &self.lock
    }

    /// 在共享锁内读取。
    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.lock.acquire();
        let out = f(unsafe { &*self.cell.get() });
        self.lock.release();
        out
    }

    /// 在独占锁内修改。
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.lock.acquire_exclusive();
        let out = f(unsafe { &mut *self.cell.get() });
        self.lock.release_exclusive();
        out
    }

    /// 开始一次可手动释放的共享读取。
    ///
    /// 传播路径用它实现手递手时序：快照状态与边集合后，把释放动作封进闭包
    /// 交给下游队列，在队列的独占锁内完成释放。
    pub(crate) fn begin_read(&self) -> ReadPass<'_, T> {
        self.lock.acquire();
        ReadPass {
            owner: self,
            released: Cell::new(false),
        }
    }
}

/// [`LockedCore::begin_read`] 的显式释放守卫。
pub(crate) struct ReadPass<'a, T> {
    owner: &'a LockedCore<T>,
    released: Cell<bool>,
}

impl<T> ReadPass<'_, T> {
    /// 提前释放共享锁；之后不得再解引用本守卫。
    pub(crate) fn unlock(&self) {
        if !self.released.replace(true) {
            self.owner.lock.release();
        }
    }
}

impl<T> Deref for ReadPass<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        debug_assert!(!self.released.get(), "deref after unlock");
        unsafe { &*self.owner.cell.get() }
    }
}

impl<T> Drop for ReadPass<'_, T> {
    fn drop(&mut self) {
        self.unlock();
    }
}
