//! Duplex：共享生命周期的读写两半。
//!
//! # 设计背景（Why）
//! - 读端与写端各自独立计量、独立背压，但销毁必须同时作用于两半，错误与 close 只投递一次；
//! - 两半互不持有强引用，统一挂在同一份生命周期记录上（`kind = "duplex"`），避免引用环。
//!
//! # 契约说明（What）
//! - 任一半 `destroy` 等价于整体 `destroy`；
//! - `auto_destroy` 在读端 end 且写端 finish 之后静默关闭；
//! - `allow_half_open = false` 时读端 end 会自动结束写端。

use crate::chunk::Chunk;
use crate::config::DuplexOptions;
use crate::error::StreamError;
use crate::ids::{ListenerId, StreamId};
use crate::lifecycle::Lifecycle;
use crate::readable::{ReadOutcome, Readable, Source};
use crate::scheduler::Scheduler;
use crate::writable::{Sink, Writable};
use std::fmt;
use std::rc::Rc;

/// 写入 `W`、读出 `R` 的双工流。
pub struct Duplex<W: Chunk, R: Chunk> {
    id: StreamId,
    lifecycle: Rc<Lifecycle>,
    writable: Writable<W>,
    readable: Readable<R>,
}

impl<W: Chunk, R: Chunk> Clone for Duplex<W, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            lifecycle: Rc::clone(&self.lifecycle),
            writable: self.writable.clone(),
            readable: self.readable.clone(),
        }
    }
}

impl<W: Chunk, R: Chunk> fmt::Debug for Duplex<W, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Duplex")
            .field("id", &self.id)
            .field("readable", &self.readable.mode())
            .field("writable", &self.writable.mode())
            .finish()
    }
}

impl<W: Chunk, R: Chunk> AsRef<Duplex<W, R>> for Duplex<W, R> {
    fn as_ref(&self) -> &Duplex<W, R> {
        self
    }
}

impl<W: Chunk, R: Chunk> Duplex<W, R> {
    pub fn new(
        sched: &Scheduler,
        options: DuplexOptions,
        sink: impl Sink<W>,
        source: impl Source<R>,
    ) -> Self {
        Self::from_parts(sched, options, Box::new(sink), Box::new(source), "duplex")
    }

    pub(crate) fn from_parts(
        sched: &Scheduler,
        options: DuplexOptions,
        sink: Box<dyn Sink<W>>,
        source: Box<dyn Source<R>>,
        kind: &'static str,
    ) -> Self {
        let id = StreamId::next();
        let lifecycle = Lifecycle::new(sched, id, kind, options.auto_destroy);
        let writable =
            Writable::with_lifecycle(sched, id, &options.writable, sink, Rc::clone(&lifecycle));
        let readable =
            Readable::with_lifecycle(sched, id, &options.readable, source, Rc::clone(&lifecycle));
        if !options.allow_half_open {
            let writable = writable.downgrade();
            readable.on_end(move || {
                if let Some(writable) = writable.upgrade() {
                    if !writable.is_ending() && !writable.is_destroyed() {
                        tracing::trace!(stream.id = %writable.id(), "half-open disabled, ending writable side");
                        writable.end(None);
                    }
                }
            });
        }
        tracing::debug!(
            stream.id = %id,
            stream.kind = kind,
            allow_half_open = options.allow_half_open,
            "duplex created"
        );
        Self {
            id,
            lifecycle,
            writable,
            readable,
        }
    }

    pub(crate) fn lifecycle(&self) -> &Rc<Lifecycle> {
        &self.lifecycle
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn readable(&self) -> &Readable<R> {
        &self.readable
    }

    pub fn writable(&self) -> &Writable<W> {
        &self.writable
    }

    pub fn write(
        &self,
        chunk: W,
        on_complete: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> bool {
        self.writable.write(chunk, on_complete)
    }

    pub fn write_chunk(&self, chunk: W) -> bool {
        self.writable.write_chunk(chunk)
    }

    pub fn end(&self, final_chunk: Option<W>) {
        self.writable.end(final_chunk);
    }

    pub fn read(&self, n: Option<usize>) -> ReadOutcome<R> {
        self.readable.read(n)
    }

    pub fn on_data(&self, listener: impl Fn(R) + 'static) -> ListenerId {
        self.readable.on_data(listener)
    }

    pub fn on_end(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.readable.on_end(listener)
    }

    pub fn on_finish(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.writable.on_finish(listener)
    }

    pub fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        self.lifecycle.on_error(Rc::new(listener))
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.lifecycle.on_close(Rc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.readable.off(id) || self.writable.off(id)
    }

    /// 销毁两半。
    pub fn destroy(&self, err: Option<StreamError>) {
        self.lifecycle.destroy(err);
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle.is_destroyed()
    }

    pub fn error(&self) -> Option<StreamError> {
        self.lifecycle.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readable::FnSource;
    use crate::writable::{FnSink, SinkAck};
    use std::cell::{Cell, RefCell};

    fn echo_duplex(sched: &Scheduler, options: DuplexOptions) -> Duplex<u32, u32> {
        Duplex::new(
            sched,
            options,
            FnSink::new(|_chunk: u32, ack: SinkAck| ack.ok()),
            FnSource::new(|_ctx: &crate::readable::SourceContext<u32>, _hint: usize| {}),
        )
    }

    #[test]
    fn destroying_one_half_tears_down_both() {
        let sched = Scheduler::new();
        let duplex = echo_duplex(&sched, DuplexOptions::default());
        let errors = Rc::new(Cell::new(0));
        {
            let errors = Rc::clone(&errors);
            duplex.on_error(move |_| errors.set(errors.get() + 1));
        }
        duplex.readable().destroy(Some(StreamError::producer("boom")));
        assert!(duplex.writable().is_destroyed(), "读端销毁应同步拆除写端");
        duplex.writable().destroy(Some(StreamError::consumer("again")));
        sched.run_until_idle().unwrap();
        assert_eq!(errors.get(), 1, "两半共享同一错误通道");
        assert_eq!(duplex.error(), Some(StreamError::producer("boom")));
    }

    #[test]
    fn closes_only_after_both_halves_complete() {
        let sched = Scheduler::new();
        let duplex = echo_duplex(&sched, DuplexOptions::default());
        let closed = Rc::new(Cell::new(false));
        {
            let closed = Rc::clone(&closed);
            duplex.on_close(move || closed.set(true));
        }
        duplex.end(None);
        sched.run_until_idle().unwrap();
        assert!(duplex.writable().is_finished());
        assert!(!closed.get(), "读端未结束时不应关闭");

        let ended = Rc::new(RefCell::new(false));
        {
            let ended = Rc::clone(&ended);
            duplex.on_end(move || *ended.borrow_mut() = true);
        }
        duplex.on_data(|_| {});
        duplex.readable().push_eof();
        sched.run_until_idle().unwrap();
        assert!(*ended.borrow());
        assert!(closed.get());
        assert!(duplex.error().is_none());
    }

    #[test]
    fn half_open_disabled_ends_writable_with_readable() {
        let sched = Scheduler::new();
        let duplex = echo_duplex(&sched, DuplexOptions::default().allow_half_open(false));
        duplex.on_data(|_| {});
        duplex.readable().push_eof();
        sched.run_until_idle().unwrap();
        assert!(duplex.writable().is_finished());
        assert!(duplex.is_destroyed());
    }
}
