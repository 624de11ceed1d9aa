//! Pipeline：带统一完成信号的多阶段管道链。
//!
//! # 设计背景（Why）
//! - 单个 [`Pipe`](crate::pipe::Pipe) 只负责相邻两端；链上任意阶段失败时，
//!   调用方需要“所有阶段都已拆除”的保证和一个唯一的终态信号；
//! - 阶段的具体类型各不相同，编排器只需要它们的生命周期句柄，因此在构建时擦除类型。
//!
//! # 执行逻辑（How）
//! 1. 构建器按顺序记录阶段与相邻阶段之间的管道，`to` 时一次性接线；
//! 2. 每个阶段挂一个完成观察器：任一阶段报错即以该错误销毁全部阶段，终态为该错误；
//! 3. 末端写端 finish 即成功，下一拍对所有阶段做一次静默 `destroy(None)`；
//! 4. 终态信号在下一拍派发，此时所有阶段都已收到 `destroy`。
//!
//! # 契约说明（What）
//! - 终态至多一次，第一个错误胜出；
//! - 构建时已有阶段被销毁：流水线立即失败，错误取该阶段的错误（没有则为 `PrematureClose`）；
//! - [`Pipeline::destroy`] 供外部取消，拆除保证与内部失败相同。

use crate::chunk::Chunk;
use crate::config::PipeOptions;
use crate::duplex::Duplex;
use crate::error::{ProtocolViolation, StreamError};
use crate::finished::{Finishable, finished};
use crate::ids::{PipelineId, StreamId};
use crate::lifecycle::Lifecycle;
use crate::pipe::pipe;
use crate::readable::Readable;
use crate::scheduler::Scheduler;
use crate::writable::{WriteCallback, Writable};
use futures::channel::oneshot;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

/// 流水线状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Running,
    Succeeded,
    Failed,
}

struct StageHandle {
    id: StreamId,
    kind: &'static str,
    /// 弱引用：阶段的监听列表反向持有流水线。
    lifecycle: Weak<Lifecycle>,
}

type Watch = Box<dyn FnOnce(WriteCallback)>;
type Link = Box<dyn FnOnce(PipeOptions)>;

struct Stage {
    handle: StageHandle,
    watch: Watch,
}

impl Stage {
    fn of<S>(stream: &S, lifecycle: &Rc<Lifecycle>) -> Self
    where
        S: Finishable + Clone + 'static,
    {
        let stream = stream.clone();
        Self {
            handle: StageHandle {
                id: lifecycle.id(),
                kind: lifecycle.kind(),
                lifecycle: Rc::downgrade(lifecycle),
            },
            watch: Box::new(move |callback| finished(&stream, callback)),
        }
    }
}

/// 流水线构建器，`T` 为当前末端读出的块类型。
pub struct PipelineBuilder<T: Chunk> {
    sched: Scheduler,
    options: PipeOptions,
    stages: Vec<Stage>,
    links: Vec<Link>,
    tail: Readable<T>,
}

impl<T: Chunk> fmt::Debug for PipelineBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("stages", &self.stages.len())
            .field("options", &self.options)
            .finish()
    }
}

impl<T: Chunk> PipelineBuilder<T> {
    /// 所有相邻管道共用的选项。
    pub fn pipe_options(mut self, options: PipeOptions) -> Self {
        self.options = options;
        self
    }

    /// 追加一个中间阶段（Duplex 或 Transform）。
    pub fn through<U, D>(mut self, stage: &D) -> PipelineBuilder<U>
    where
        U: Chunk,
        D: AsRef<Duplex<T, U>>,
    {
        let duplex = stage.as_ref().clone();
        let upstream = self.tail;
        let downstream = duplex.writable().clone();
        self.links.push(Box::new(move |options| {
            pipe(&upstream, &downstream, options);
        }));
        self.stages.push(Stage::of(&duplex, duplex.lifecycle()));
        PipelineBuilder {
            sched: self.sched,
            options: self.options,
            stages: self.stages,
            links: self.links,
            tail: duplex.readable().clone(),
        }
    }

    /// 以写端收尾并启动流水线。
    pub fn to(mut self, sink: &Writable<T>) -> Pipeline {
        let upstream = self.tail;
        let downstream = sink.clone();
        self.links.push(Box::new(move |options| {
            pipe(&upstream, &downstream, options);
        }));
        self.stages.push(Stage::of(sink, sink.lifecycle()));
        Pipeline::start(self.sched, self.options, self.stages, self.links)
    }
}

struct PipelineInner {
    id: PipelineId,
    sched: Scheduler,
    state: Cell<PipelineState>,
    stages: RefCell<Vec<StageHandle>>,
    outcome: RefCell<Option<Result<(), StreamError>>>,
    callbacks: RefCell<Vec<WriteCallback>>,
}

impl PipelineInner {
    fn fail(self: &Rc<Self>, err: StreamError) {
        if self.state.get() != PipelineState::Running {
            return;
        }
        self.state.set(PipelineState::Failed);
        let stages = std::mem::take(&mut *self.stages.borrow_mut());
        tracing::warn!(
            pipeline.id = %self.id,
            error = %err,
            stages = stages.len(),
            "pipeline failed, destroying every stage"
        );
        for stage in &stages {
            let destroyed = stage
                .lifecycle
                .upgrade()
                .is_some_and(|lifecycle| lifecycle.destroy(Some(err.clone())));
            if destroyed {
                tracing::trace!(
                    pipeline.id = %self.id,
                    stream.id = %stage.id,
                    stream.kind = stage.kind,
                    "stage destroyed"
                );
            }
        }
        self.settle(Err(err));
    }

    fn succeed(self: &Rc<Self>) {
        if self.state.get() != PipelineState::Running {
            return;
        }
        self.state.set(PipelineState::Succeeded);
        tracing::debug!(pipeline.id = %self.id, "pipeline completed");
        self.settle(Ok(()));
    }

    fn settle(self: &Rc<Self>, result: Result<(), StreamError>) {
        let this = Rc::clone(self);
        self.sched.defer(move || {
            // 末端 finish 监听返回之后才静默关闭剩余阶段，已完成的阶段不会被误判为取消。
            let stages = std::mem::take(&mut *this.stages.borrow_mut());
            for lifecycle in stages.iter().filter_map(|stage| stage.lifecycle.upgrade()) {
                lifecycle.destroy(None);
            }
            *this.outcome.borrow_mut() = Some(result.clone());
            let callbacks = std::mem::take(&mut *this.callbacks.borrow_mut());
            for callback in callbacks {
                callback(result.clone());
            }
        });
    }
}

/// 运行中的流水线句柄。
#[derive(Clone)]
pub struct Pipeline {
    inner: Rc<PipelineInner>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl Pipeline {
    /// 从读端开始构建。
    pub fn builder<T: Chunk>(source: &Readable<T>) -> PipelineBuilder<T> {
        PipelineBuilder {
            sched: source.scheduler().clone(),
            options: PipeOptions::default(),
            stages: vec![Stage::of(source, source.lifecycle())],
            links: Vec::new(),
            tail: source.clone(),
        }
    }

    fn start(sched: Scheduler, options: PipeOptions, stages: Vec<Stage>, links: Vec<Link>) -> Self {
        let (handles, watches): (Vec<StageHandle>, Vec<Watch>) = stages
            .into_iter()
            .map(|stage| (stage.handle, stage.watch))
            .unzip();
        // 观察器仍持有各阶段，此时升级必然成功。
        let broken = handles
            .iter()
            .filter_map(|stage| stage.lifecycle.upgrade())
            .find(|lifecycle| lifecycle.is_destroyed())
            .map(|lifecycle| {
                lifecycle
                    .error()
                    .unwrap_or_else(|| StreamError::protocol(ProtocolViolation::PrematureClose))
            });
        let inner = Rc::new(PipelineInner {
            id: PipelineId::next(),
            sched,
            state: Cell::new(PipelineState::Running),
            stages: RefCell::new(handles),
            outcome: RefCell::new(None),
            callbacks: RefCell::new(Vec::new()),
        });
        tracing::debug!(
            pipeline.id = %inner.id,
            stages = watches.len(),
            end = options.end,
            "pipeline started"
        );
        if let Some(err) = broken {
            inner.fail(err);
            return Self { inner };
        }

        for link in links {
            link(options);
        }
        let last = watches.len().saturating_sub(1);
        for (index, watch) in watches.into_iter().enumerate() {
            let pipeline = Rc::clone(&inner);
            watch(Box::new(move |result| match result {
                Err(err) => pipeline.fail(err),
                Ok(()) if index == last => pipeline.succeed(),
                Ok(()) => {}
            }));
        }
        Self { inner }
    }

    pub fn id(&self) -> PipelineId {
        self.inner.id
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state.get()
    }

    /// 终态结果；终态派发之前为 `None`。
    pub fn outcome(&self) -> Option<Result<(), StreamError>> {
        self.inner.outcome.borrow().clone()
    }

    /// 注册终态回调；已经派发过时在下一拍补发。
    pub fn on_complete(&self, callback: impl FnOnce(Result<(), StreamError>) + 'static) {
        let outcome = self.inner.outcome.borrow().clone();
        match outcome {
            Some(result) => self.inner.sched.defer(move || callback(result)),
            None => self.inner.callbacks.borrow_mut().push(Box::new(callback)),
        }
    }

    /// 以 `Future` 形式等待终态；调度器仍需由调用方驱动。
    pub fn completion(&self) -> PipelineCompletion {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |result| {
            let _ = tx.send(result);
        });
        PipelineCompletion { rx }
    }

    /// 外部取消：以 `err`（缺省为取消错误）销毁所有阶段。
    pub fn destroy(&self, err: Option<StreamError>) {
        self.inner.fail(err.unwrap_or_else(StreamError::cancelled));
    }
}

/// [`Pipeline::completion`] 返回的 `Future`。
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct PipelineCompletion {
    rx: oneshot::Receiver<Result<(), StreamError>>,
}

impl Future for PipelineCompletion {
    type Output = Result<(), StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(StreamError::cancelled())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DuplexOptions, ReadableOptions, WritableOptions};
    use crate::readable::{FnSource, SourceContext};
    use crate::transform::Transform;
    use crate::writable::{FnSink, SinkAck};
    use futures::FutureExt;

    fn collecting_sink(sched: &Scheduler) -> (Writable<u32>, Rc<RefCell<Vec<u32>>>) {
        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = Writable::new(
            sched,
            WritableOptions::default(),
            FnSink::new({
                let got = Rc::clone(&got);
                move |x: u32, ack: SinkAck| {
                    got.borrow_mut().push(x);
                    ack.ok();
                }
            }),
        );
        (sink, got)
    }

    #[test]
    fn three_stage_pipeline_succeeds() {
        let sched = Scheduler::new();
        let source = Readable::from_items(&sched, ReadableOptions::default(), vec![1u32, 2, 3]);
        let doubler = Transform::map(&sched, DuplexOptions::default(), |x: u32| x * 2);
        let (sink, got) = collecting_sink(&sched);
        let pipeline = Pipeline::builder(&source).through(&doubler).to(&sink);
        let completion = pipeline.completion();
        sched.run_until_idle().unwrap();
        assert_eq!(*got.borrow(), vec![2, 4, 6]);
        assert_eq!(pipeline.state(), PipelineState::Succeeded);
        assert_eq!(completion.now_or_never(), Some(Ok(())));
    }

    #[test]
    fn external_destroy_tears_down_every_stage() {
        let sched = Scheduler::new();
        let source: Readable<u32> = Readable::new(
            &sched,
            ReadableOptions::default(),
            FnSource::new(|_ctx: &SourceContext<u32>, _hint: usize| {}),
        );
        let (sink, _got) = collecting_sink(&sched);
        let pipeline = Pipeline::builder(&source).to(&sink);
        sched.run_until_idle().unwrap();
        pipeline.destroy(None);
        assert!(source.is_destroyed());
        assert!(sink.is_destroyed());
        assert!(pipeline.outcome().is_none(), "终态在下一拍派发");
        sched.run_until_idle().unwrap();
        assert!(pipeline.outcome().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn already_destroyed_stage_fails_immediately() {
        let sched = Scheduler::new();
        let source = Readable::from_items(&sched, ReadableOptions::default(), vec![1u32]);
        let (sink, _got) = collecting_sink(&sched);
        sink.destroy(Some(StreamError::consumer("gone")));
        let pipeline = Pipeline::builder(&source).to(&sink);
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(source.is_destroyed());
        sched.run_until_idle().unwrap();
        assert_eq!(pipeline.outcome(), Some(Err(StreamError::consumer("gone"))));
    }
}
