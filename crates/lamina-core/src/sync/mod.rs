//! 锁原语：非对称读写锁与死锁安全的批量获取。
//!
//! 节点的状态机与边集合由 [`AsymmetricLock`] 保护：消息传播走共享模式，
//! 生命周期迁移与边集合变更走独占模式。诊断采样需要冻结一个子图时使用
//! [`acquire_all`]，其按稳定序号的取锁顺序保证任意并发排列下不死锁。

mod lock;

pub use lock::{AsymmetricLock, LockSetGuard, acquire_all};

pub(crate) mod cell;
