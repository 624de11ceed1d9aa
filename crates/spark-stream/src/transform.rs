//! Transform：把写端与读端耦合成一个处理阶段。
//!
//! # 设计背景（Why）
//! - 写端每次只有一个写入在途，因此转换天然是单飞（single-flight）的：
//!   当前块的输出全部推入读端、确认完成之前，下一块不会进入 [`Transformer::transform`]；
//! - 读端缓冲达到高水位时，当前写入的确认被扣留，直到读端再次请求数据（`fill`）才放行，
//!   下游压力由此传导到上游写入方。
//!
//! # 执行逻辑（How）
//! - 写端的数据汇是 `TransformSink`，读端的数据源是 `TransformSource`，两者通过 `Coupling`
//!   共享被扣留的确认；`Coupling` 对两半只持有弱引用；
//! - `end` 之后先调用 [`Transformer::flush`]，完成时向读端推送结束标记，再确认写端的 finalize。
//!
//! # 契约说明（What）
//! - 转换失败（`TransformOutput::fail`）销毁整个 Duplex；
//! - 读端观察到的块序列与写入顺序一致，不重排、不重复、不丢失。

use crate::chunk::Chunk;
use crate::config::DuplexOptions;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::readable::{Readable, Source, SourceContext, WeakReadable};
use crate::scheduler::Scheduler;
use crate::writable::{Sink, SinkAck};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

/// 转换步骤。
///
/// 每次调用必须恰好完成一次 `out`（`finish` / `fail` / `complete`），可以同步也可以稍后完成。
pub trait Transformer<I: Chunk, O: Chunk>: 'static {
    fn transform(&mut self, chunk: I, out: TransformOutput<O>);

    /// 写端结束后、读端结束标记之前调用，用于吐出残留状态。
    fn flush(&mut self, out: TransformOutput<O>) {
        out.finish();
    }

    fn destroy(&mut self, err: Option<&StreamError>) {
        let _ = err;
    }
}

/// 以闭包充当转换步骤。
pub struct FnTransformer<F>(F);

impl<F> FnTransformer<F> {
    pub fn new(transform: F) -> Self {
        Self(transform)
    }
}

impl<I, O, F> Transformer<I, O> for FnTransformer<F>
where
    I: Chunk,
    O: Chunk,
    F: FnMut(I, TransformOutput<O>) + 'static,
{
    fn transform(&mut self, chunk: I, out: TransformOutput<O>) {
        (self.0)(chunk, out)
    }
}

struct Coupling<O: Chunk> {
    readable: RefCell<Option<WeakReadable<O>>>,
    writable_ending: RefCell<Option<Box<dyn Fn() -> bool>>>,
    withheld: RefCell<Option<SinkAck>>,
}

impl<O: Chunk> Coupling<O> {
    fn new() -> Self {
        Self {
            readable: RefCell::new(None),
            writable_ending: RefCell::new(None),
            withheld: RefCell::new(None),
        }
    }

    fn readable(&self) -> Option<Readable<O>> {
        self.readable.borrow().as_ref().and_then(WeakReadable::upgrade)
    }

    fn writable_ending(&self) -> bool {
        self.writable_ending.borrow().as_ref().is_some_and(|ending| ending())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Transform,
    Flush,
}

/// 单次转换（或 flush）的输出句柄。
#[must_use = "a transform output must be completed exactly once"]
pub struct TransformOutput<O: Chunk> {
    coupling: Rc<Coupling<O>>,
    ack: Option<SinkAck>,
    phase: Phase,
    pushed: Cell<bool>,
}

impl<O: Chunk> fmt::Debug for TransformOutput<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformOutput")
            .field("phase", &self.phase)
            .field("pushed", &self.pushed.get())
            .finish()
    }
}

impl<O: Chunk> TransformOutput<O> {
    fn new(coupling: &Rc<Coupling<O>>, ack: SinkAck, phase: Phase) -> Self {
        Self {
            coupling: Rc::clone(coupling),
            ack: Some(ack),
            phase,
            pushed: Cell::new(false),
        }
    }

    /// 向读端推送一块输出，返回读端的背压信号。
    pub fn push(&self, chunk: O) -> bool {
        self.pushed.set(true);
        self.coupling
            .readable()
            .is_some_and(|readable| readable.push(chunk))
    }

    pub fn finish(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, err: StreamError) {
        self.complete(Err(err));
    }

    pub fn complete(mut self, result: Result<(), StreamError>) {
        let Some(ack) = self.ack.take() else {
            return;
        };
        let readable = self.coupling.readable();
        match (self.phase, result) {
            (_, Err(err)) => ack.fail(err),
            (Phase::Flush, Ok(())) => {
                if let Some(readable) = readable {
                    readable.push_eof();
                }
                ack.ok();
            }
            (Phase::Transform, Ok(())) => {
                let congested = readable.is_some_and(|readable| {
                    !readable.is_destroyed()
                        && readable.buffered_len() >= readable.high_water_mark()
                });
                if self.pushed.get() && congested && !self.coupling.writable_ending() {
                    tracing::trace!("readable side congested, withholding write acknowledgement");
                    *self.coupling.withheld.borrow_mut() = Some(ack);
                } else {
                    ack.ok();
                }
            }
        }
    }
}

struct TransformSink<I: Chunk, O: Chunk> {
    transformer: Box<dyn Transformer<I, O>>,
    coupling: Rc<Coupling<O>>,
}

impl<I: Chunk, O: Chunk> Sink<I> for TransformSink<I, O> {
    fn write(&mut self, chunk: I, ack: SinkAck) {
        let out = TransformOutput::new(&self.coupling, ack, Phase::Transform);
        self.transformer.transform(chunk, out);
    }

    fn finalize(&mut self, ack: SinkAck) {
        let out = TransformOutput::new(&self.coupling, ack, Phase::Flush);
        self.transformer.flush(out);
    }

    fn destroy(&mut self, err: Option<&StreamError>) {
        self.transformer.destroy(err);
        let withheld = self.coupling.withheld.borrow_mut().take();
        if let Some(ack) = withheld {
            ack.disarm();
        }
    }
}

struct TransformSource<O: Chunk> {
    coupling: Rc<Coupling<O>>,
}

impl<O: Chunk> Source<O> for TransformSource<O> {
    fn fill(&mut self, _ctx: &SourceContext<O>, _size_hint: usize) {
        let withheld = self.coupling.withheld.borrow_mut().take();
        if let Some(ack) = withheld {
            tracing::trace!("readable side asked for more, releasing withheld acknowledgement");
            ack.ok();
        }
    }
}

/// 转换流：写入 `I`，读出 `O`。
pub struct Transform<I: Chunk, O: Chunk> {
    duplex: Duplex<I, O>,
}

/// 原样转发的转换流。
pub type PassThrough<T> = Transform<T, T>;

impl<I: Chunk, O: Chunk> Clone for Transform<I, O> {
    fn clone(&self) -> Self {
        Self {
            duplex: self.duplex.clone(),
        }
    }
}

impl<I: Chunk, O: Chunk> fmt::Debug for Transform<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transform").field(&self.duplex).finish()
    }
}

impl<I: Chunk, O: Chunk> Deref for Transform<I, O> {
    type Target = Duplex<I, O>;

    fn deref(&self) -> &Duplex<I, O> {
        &self.duplex
    }
}

impl<I: Chunk, O: Chunk> AsRef<Duplex<I, O>> for Transform<I, O> {
    fn as_ref(&self) -> &Duplex<I, O> {
        &self.duplex
    }
}

impl<I: Chunk, O: Chunk> Transform<I, O> {
    pub fn new(
        sched: &Scheduler,
        options: DuplexOptions,
        transformer: impl Transformer<I, O>,
    ) -> Self {
        let coupling = Rc::new(Coupling::new());
        let sink = TransformSink {
            transformer: Box::new(transformer),
            coupling: Rc::clone(&coupling),
        };
        let source = TransformSource {
            coupling: Rc::clone(&coupling),
        };
        let duplex =
            Duplex::from_parts(sched, options, Box::new(sink), Box::new(source), "transform");
        *coupling.readable.borrow_mut() = Some(duplex.readable().downgrade());
        let writable = duplex.writable().downgrade();
        *coupling.writable_ending.borrow_mut() = Some(Box::new(move || {
            writable
                .upgrade()
                .is_some_and(|writable| writable.is_ending())
        }));
        Self { duplex }
    }

    /// 逐块映射。
    pub fn map(sched: &Scheduler, options: DuplexOptions, mut f: impl FnMut(I) -> O + 'static) -> Self {
        Self::new(
            sched,
            options,
            FnTransformer::new(move |chunk: I, out: TransformOutput<O>| {
                out.push(f(chunk));
                out.finish();
            }),
        )
    }

    /// 逐块映射，`None` 表示丢弃该块。
    pub fn filter_map(
        sched: &Scheduler,
        options: DuplexOptions,
        mut f: impl FnMut(I) -> Option<O> + 'static,
    ) -> Self {
        Self::new(
            sched,
            options,
            FnTransformer::new(move |chunk: I, out: TransformOutput<O>| {
                if let Some(mapped) = f(chunk) {
                    out.push(mapped);
                }
                out.finish();
            }),
        )
    }

    /// 可能失败的逐块映射；失败销毁整个转换流。
    pub fn try_map(
        sched: &Scheduler,
        options: DuplexOptions,
        mut f: impl FnMut(I) -> Result<O, StreamError> + 'static,
    ) -> Self {
        Self::new(
            sched,
            options,
            FnTransformer::new(move |chunk: I, out: TransformOutput<O>| match f(chunk) {
                Ok(mapped) => {
                    out.push(mapped);
                    out.finish();
                }
                Err(err) => out.fail(err),
            }),
        )
    }

    pub fn duplex(&self) -> &Duplex<I, O> {
        &self.duplex
    }

    pub fn into_duplex(self) -> Duplex<I, O> {
        self.duplex
    }
}

impl<T: Chunk> Transform<T, T> {
    pub fn pass_through(sched: &Scheduler, options: DuplexOptions) -> PassThrough<T> {
        Self::map(sched, options, |chunk| chunk)
    }
}
