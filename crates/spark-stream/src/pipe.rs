//! Pipe：在一个读端与一个写端之间自动调解背压。
//!
//! # 执行逻辑（How）
//! 1. 订阅读端数据，逐块 `write` 到写端；`write` 返回 `false` 时立即暂停读端，
//!    并记录“本管道在等 drain”；
//! 2. 写端 `drain` 时撤销记录，读端上没有任何管道再等待时自动恢复流动；
//! 3. 读端 end 时（除非 `PipeOptions::end = false`）结束写端；
//! 4. 任一端出错：以同一错误销毁另一端并解除订阅；
//! 5. 写端 finish / close 时解除订阅。
//!
//! # 风险提示（Trade-offs）
//! - 扇出（一个读端多个管道）时暂停是读端的属性：最慢的写端会拖慢所有写端；
//! - 管道只持有两端的弱引用：两端的生命周期由调用方的句柄决定，丢弃全部句柄后引擎与协作者随之释放；
//!   两端的监听列表反向持有管道本身，因此不会形成引用环。

use crate::chunk::Chunk;
use crate::config::PipeOptions;
use crate::error::StreamError;
use crate::ids::{ListenerId, PipeId};
use crate::readable::{Readable, WeakReadable};
use crate::writable::{WeakWritable, Writable};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// 管道状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipeState {
    Active,
    /// 调用方显式 `unpipe`。
    Unpiped,
    /// 读端结束，或写端 finish / close。
    Ended,
    /// 任一端出错。
    Errored,
}

struct PipeInner<T: Chunk> {
    id: PipeId,
    options: PipeOptions,
    state: Cell<PipeState>,
    source: RefCell<Option<WeakReadable<T>>>,
    sink: RefCell<Option<WeakWritable<T>>>,
    source_listeners: RefCell<Vec<ListenerId>>,
    sink_listeners: RefCell<Vec<ListenerId>>,
}

impl<T: Chunk> PipeInner<T> {
    fn is_active(&self) -> bool {
        self.state.get() == PipeState::Active
    }

    fn source(&self) -> Option<Readable<T>> {
        self.source.borrow().as_ref().and_then(WeakReadable::upgrade)
    }

    fn sink(&self) -> Option<Writable<T>> {
        self.sink.borrow().as_ref().and_then(WeakWritable::upgrade)
    }

    fn on_data(&self, chunk: T) {
        if !self.is_active() {
            return;
        }
        let (Some(source), Some(sink)) = (self.source(), self.sink()) else {
            return;
        };
        if !sink.write_chunk(chunk) {
            tracing::trace!(pipe.id = %self.id, "sink congested, pausing source");
            source.pause_for_drain(self.id);
        }
    }

    fn on_drain(&self) {
        if !self.is_active() {
            return;
        }
        if let Some(source) = self.source() {
            source.release_drain(self.id);
        }
    }

    fn on_source_end(&self) {
        if !self.is_active() {
            return;
        }
        let sink = self.sink();
        self.detach(PipeState::Ended);
        if self.options.end {
            if let Some(sink) = sink {
                sink.end(None);
            }
        }
    }

    fn on_source_error(&self, err: &StreamError) {
        if !self.is_active() {
            return;
        }
        let sink = self.sink();
        self.detach(PipeState::Errored);
        if let Some(sink) = sink {
            tracing::debug!(pipe.id = %self.id, error = %err, "source failed, destroying sink");
            sink.destroy(Some(err.clone()));
        }
    }

    fn on_sink_error(&self, err: &StreamError) {
        if !self.is_active() {
            return;
        }
        let source = self.source();
        self.detach(PipeState::Errored);
        if let Some(source) = source {
            tracing::debug!(pipe.id = %self.id, error = %err, "sink failed, destroying source");
            source.destroy(Some(err.clone()));
        }
    }

    /// 解除两端订阅；已被释放的一端无需注销。
    fn detach(&self, state: PipeState) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state.set(state);
        let source = self.source.borrow_mut().take().and_then(|weak| weak.upgrade());
        let sink = self.sink.borrow_mut().take().and_then(|weak| weak.upgrade());
        let source_listeners = std::mem::take(&mut *self.source_listeners.borrow_mut());
        let sink_listeners = std::mem::take(&mut *self.sink_listeners.borrow_mut());
        if let Some(source) = source {
            for id in source_listeners {
                source.off(id);
            }
            source.unregister_pipe(self.id);
        }
        if let Some(sink) = sink {
            for id in sink_listeners {
                sink.off(id);
            }
        }
        tracing::debug!(pipe.id = %self.id, state = ?state, "pipe detached");
        true
    }
}

/// 管道句柄。
pub struct Pipe<T: Chunk> {
    inner: Rc<PipeInner<T>>,
}

impl<T: Chunk> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Chunk> fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl<T: Chunk> Pipe<T> {
    pub fn id(&self) -> PipeId {
        self.inner.id
    }

    pub fn state(&self) -> PipeState {
        self.inner.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// 解除订阅，两端都不销毁、可以继续使用；返回管道此前是否活跃。
    pub fn unpipe(&self) -> bool {
        self.inner.detach(PipeState::Unpiped)
    }
}

/// 把 `source` 接到 `sink`。
pub fn pipe<T: Chunk>(source: &Readable<T>, sink: &Writable<T>, options: PipeOptions) -> Pipe<T> {
    let inner = Rc::new(PipeInner {
        id: PipeId::next(),
        options,
        state: Cell::new(PipeState::Active),
        source: RefCell::new(Some(source.downgrade())),
        sink: RefCell::new(Some(sink.downgrade())),
        source_listeners: RefCell::new(Vec::new()),
        sink_listeners: RefCell::new(Vec::new()),
    });
    tracing::debug!(
        pipe.id = %inner.id,
        source = %source.id(),
        sink = %sink.id(),
        end = options.end,
        "pipe created"
    );

    if sink.is_destroyed() || source.is_destroyed() {
        // 任一端已经不可用：按错误传播规则处理另一端，管道直接失效。
        let err = sink.error().or_else(|| source.error());
        inner.detach(PipeState::Errored);
        if let Some(err) = err {
            if sink.is_destroyed() {
                source.destroy(Some(err));
            } else {
                sink.destroy(Some(err));
            }
        }
        return Pipe { inner };
    }

    source.register_pipe(inner.id);
    let source_listeners = vec![
        {
            let pipe = Rc::clone(&inner);
            source.add_data_listener(Rc::new(move |chunk: T| pipe.on_data(chunk)))
        },
        {
            let pipe = Rc::clone(&inner);
            source.on_end(move || pipe.on_source_end())
        },
        {
            let pipe = Rc::clone(&inner);
            source.on_error(move |err| pipe.on_source_error(err))
        },
        {
            let pipe = Rc::clone(&inner);
            source.on_close(move || {
                pipe.detach(PipeState::Ended);
            })
        },
    ];
    let sink_listeners = vec![
        {
            let pipe = Rc::clone(&inner);
            sink.on_drain(move || pipe.on_drain())
        },
        {
            let pipe = Rc::clone(&inner);
            sink.on_error(move |err| pipe.on_sink_error(err))
        },
        {
            let pipe = Rc::clone(&inner);
            sink.on_finish(move || {
                pipe.detach(PipeState::Ended);
            })
        },
        {
            let pipe = Rc::clone(&inner);
            sink.on_close(move || {
                pipe.detach(PipeState::Ended);
            })
        },
    ];
    *inner.source_listeners.borrow_mut() = source_listeners;
    *inner.sink_listeners.borrow_mut() = sink_listeners;

    if sink.needs_drain() {
        source.pause_for_drain(inner.id);
    } else if !source.is_flowing() {
        source.resume();
    }
    Pipe { inner }
}

impl<T: Chunk> Readable<T> {
    /// 以默认选项接到 `sink`。
    pub fn pipe(&self, sink: &Writable<T>) -> Pipe<T> {
        pipe(self, sink, PipeOptions::default())
    }

    pub fn pipe_with(&self, sink: &Writable<T>, options: PipeOptions) -> Pipe<T> {
        pipe(self, sink, options)
    }
}
