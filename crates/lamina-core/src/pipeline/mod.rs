//! 流水线：阶段的顺序组合，阶段可返回延迟结果。
//!
//! 运行器是显式蹦床：同步阶段在当前线程的循环内依次执行，不随链长增长
//! 调用栈；遇到未实现的延迟结果时挂监听者返回，由完成该结果的线程继续
//! 驱动后续阶段。单个流水线实例内部没有并行：阶段 i+1 一定在阶段 i 产出
//! 值之后才被调用。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{LaminaError, codes};
use crate::result::ResultChannel;

/// 阶段的产出：值、延迟结果或控制信号。
pub enum Step<S> {
    /// 同步产出值，馈入下一阶段。
    Sync(S),
    /// 延迟产出；实现后馈入下一阶段。
    Deferred(ResultChannel<S>),
    /// 以给定值回到本流水线的阶段 0。
    Restart(S),
    /// 以给定值立即终止流水线。
    Complete(S),
    /// 将控制权转交另一条流水线。
    Redirect(Arc<Pipeline<S>>, S),
    /// 以错误终止当前阶段，交由错误处理器裁决。
    Fail(LaminaError),
}

/// 装箱的阶段函数；`run_pipeline` 以其序列驱动。
pub type StageFn<S> = Box<dyn Fn(S) -> Step<S> + Send + Sync>;
type ErrorHandlerFn<S> = Box<dyn Fn(LaminaError) -> Step<S> + Send + Sync>;
type FinallyFn = Box<dyn Fn() + Send + Sync>;

/// 阶段序列与终止策略的不可变组合。
///
/// # 契约说明（What）
/// - `run` 返回承载最终值的延迟结果；`run_into` 绑定外部提供的结果
///   （用于合并流水线）。
/// - 阶段内 panic 与阶段返回的 [`Step::Fail`] 都交给错误处理器；处理器可
///   将错误降级为值、重启或转交，未安装处理器时错误原样落到结果上。
/// - `finally` 在每条终止路径上、结果被外部观察之前执行一次；redirect 把
///   终止责任连同 `finally` 一起转交给目标流水线。
pub struct Pipeline<S> {
    stages: Vec<StageFn<S>>,
    error_handler: Option<ErrorHandlerFn<S>>,
    finally: Option<FinallyFn>,
}

impl<S: Clone + Send + 'static> Pipeline<S> {
    pub fn builder() -> PipelineBuilder<S> {
        PipelineBuilder {
            stages: Vec::new(),
            error_handler: None,
            finally: None,
        }
    }

    /// 以 `initial` 驱动流水线，返回最终结果。
    pub fn run(self: &Arc<Self>, initial: S) -> ResultChannel<S> {
        let result = ResultChannel::new();
        self.run_into(initial, result.clone());
        result
    }

    /// 绑定外部结果驱动流水线。
    pub fn run_into(self: &Arc<Self>, initial: S, result: ResultChannel<S>) {
        drive(Arc::clone(self), 0, initial, result);
    }
}

/// [`Pipeline`] 的构建器。
pub struct PipelineBuilder<S> {
    stages: Vec<StageFn<S>>,
    error_handler: Option<ErrorHandlerFn<S>>,
    finally: Option<FinallyFn>,
}

impl<S: Clone + Send + 'static> PipelineBuilder<S> {
    pub fn stage(mut self, f: impl Fn(S) -> Step<S> + Send + Sync + 'static) -> Self {
        self.stages.push(Box::new(f));
        self
    }

    pub fn stage_boxed(mut self, f: StageFn<S>) -> Self {
        self.stages.push(f);
        self
    }

    /// 安装错误处理器；处理器返回的 [`Step`] 决定后续走向。
    pub fn error_handler(
        mut self,
        f: impl Fn(LaminaError) -> Step<S> + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Box::new(f));
        self
    }

    /// 安装终止钩子。
    pub fn finally(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.finally = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<Pipeline<S>> {
        Arc::new(Pipeline {
            stages: self.stages,
            error_handler: self.error_handler,
            finally: self.finally,
        })
    }
}

/// 以装箱阶段序列一次性运行流水线的便捷入口。
pub fn run_pipeline<S: Clone + Send + 'static>(
    initial: S,
    stages: Vec<StageFn<S>>,
) -> ResultChannel<S> {
    let mut builder = Pipeline::builder();
    for stage in stages {
        builder = builder.stage_boxed(stage);
    }
    builder.build().run(initial)
}

fn drive<S: Clone + Send + 'static>(
    mut pipeline: Arc<Pipeline<S>>,
    mut idx: usize,
    mut value: S,
    result: ResultChannel<S>,
) {
    loop {
        if idx >= pipeline.stages.len() {
            finish_success(&pipeline, &result, value);
            return;
        }
        let step = {
            let stage = &pipeline.stages[idx];
            catch_unwind(AssertUnwindSafe(move || stage(value)))
        };
        match step {
            Err(_) => {
                let error = LaminaError::new(codes::OPERATOR_PANIC, "pipeline stage panicked");
                drive_error(pipeline, error, result);
                return;
            }
            Ok(Step::Sync(v)) => {
                value = v;
                idx += 1;
            }
            Ok(Step::Restart(v)) => {
                value = v;
                idx = 0;
            }
            Ok(Step::Complete(v)) => {
                finish_success(&pipeline, &result, v);
                return;
            }
            Ok(Step::Redirect(target, v)) => {
                pipeline = target;
                idx = 0;
                value = v;
            }
            Ok(Step::Fail(error)) => {
                drive_error(pipeline, error, result);
                return;
            }
            Ok(Step::Deferred(rc)) => match rc.poll() {
                Some(Ok(v)) => {
                    value = v;
                    idx += 1;
                }
                Some(Err(error)) => {
                    drive_error(pipeline, error, result);
                    return;
                }
                None => {
                    let resume = Arc::clone(&pipeline);
                    let resume_result = result.clone();
                    let next = idx + 1;
                    rc.on_success(move |v| drive(resume, next, v, resume_result));
                    let rescue = pipeline;
                    let rescue_result = result;
                    rc.on_error(move |error| drive_error(rescue, error, rescue_result));
                    return;
                }
            },
        }
    }
}

fn drive_error<S: Clone + Send + 'static>(
    pipeline: Arc<Pipeline<S>>,
    error: LaminaError,
    result: ResultChannel<S>,
) {
    let step = match &pipeline.error_handler {
        None => {
            finish_error(&pipeline, &result, error);
            return;
        }
        Some(handler) => {
            let failure = error.clone();
            match catch_unwind(AssertUnwindSafe(move || handler(failure))) {
                Ok(step) => step,
                Err(_) => {
                    finish_error(
                        &pipeline,
                        &result,
                        LaminaError::new(codes::PIPELINE_UNHANDLED, "error handler panicked")
                            .with_cause(error),
                    );
                    return;
                }
            }
        }
    };
    match step {
        // 处理器把错误降级为值：流水线以该值成功终止。
        Step::Sync(v) | Step::Complete(v) => finish_success(&pipeline, &result, v),
        Step::Restart(v) => drive(pipeline, 0, v, result),
        Step::Redirect(target, v) => drive(target, 0, v, result),
        Step::Fail(e) => finish_error(&pipeline, &result, e),
        Step::Deferred(rc) => {
            let ok_pipeline = Arc::clone(&pipeline);
            let ok_result = result.clone();
            rc.on_success(move |v| finish_success(&ok_pipeline, &ok_result, v));
            rc.on_error(move |e| finish_error(&pipeline, &result, e));
        }
    }
}

fn finish_success<S: Clone + Send + 'static>(
    pipeline: &Pipeline<S>,
    result: &ResultChannel<S>,
    value: S,
) {
    run_finally(pipeline);
    let _ = result.succeed(value);
}

fn finish_error<S: Clone + Send + 'static>(
    pipeline: &Pipeline<S>,
    result: &ResultChannel<S>,
    error: LaminaError,
) {
    run_finally(pipeline);
    let _ = result.fail(error);
}

fn run_finally<S>(pipeline: &Pipeline<S>) {
    if let Some(finally) = &pipeline.finally {
        if catch_unwind(AssertUnwindSafe(|| finally())).is_err() {
            tracing::error!(
                target: "lamina_core::pipeline",
                "finally hook panicked; termination proceeds"
            );
        }
    }
}
