//! 运行时共享设施：进程级定时器与环境上下文。
//!
//! 原实现以线程局部的上下文栈查找环境定时器；此处改为显式的 [`Context`]
//! 值随构造函数传递，未提供上下文的调用方回退到进程级默认值。

mod timer;

pub use timer::{Timer, TimerKey};

use std::sync::{Arc, OnceLock};

/// 环境上下文：聚合引擎依赖的进程级共享服务。
///
/// # 契约说明（What）
/// - 当前唯一的服务是共享定时器，驱动 `timed_result`、`periodically` 与
///   读取超时；后续扩展（执行器等）沿用同一聚合入口。
/// - `Context::global()` 返回进程级默认实例，首次访问时惰性创建并常驻。
#[derive(Clone)]
pub struct Context {
    timer: Arc<Timer>,
}

impl Context {
    /// 以独立定时器创建新上下文。
    pub fn new() -> Self {
        Self {
            timer: Arc::new(Timer::new()),
        }
    }

    /// 复用既有定时器创建上下文。
    pub fn with_timer(timer: Arc<Timer>) -> Self {
        Self { timer }
    }

    /// 环境定时器。
    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    /// 进程级默认上下文。
    pub fn global() -> &'static Context {
        static GLOBAL: OnceLock<Context> = OnceLock::new();
        GLOBAL.get_or_init(Context::new)
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::global().clone()
    }
}
