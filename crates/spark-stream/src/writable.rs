//! Writable 引擎：带确认的有序写端。
//!
//! # 设计背景（Why）
//! - 数据汇（[`Sink`]）一次只处理一个写入（或一个批次），以 [`SinkAck`] 回报完成；
//!   引擎据此维护“已缓冲但未确认”的计量总量，并以 `write` 的返回值与 `drain` 事件表达背压；
//! - 写确认可能在 `Sink::write` 调用栈内同步到达，此时续作推迟到下一拍，
//!   避免调用方在 `write` 返回之前就看到自己的回调被执行。
//!
//! # 契约说明（What）
//! - 回调严格按提交顺序执行；
//! - `end` 之后的写入：回调收到 `WriteAfterEnd`，同时经错误通道上报；
//!   销毁之后的写入：只有回调收到 `WriteAfterDestroy`；
//! - `Finished` 只在所有写入确认、`finalize` 钩子完成之后到达。
//!
//! # 风险提示（Trade-offs）
//! - `drain` 在未确认总量回落到高水位以下时触发，而不是等到完全清空；
//!   写入方因此可以更早恢复，代价是汇端缓冲更可能保持在高水位附近。

use crate::chunk::{Chunk, measure, object_mode_for};
use crate::config::{WritableOptions, resolve_high_water_mark};
use crate::error::{ProtocolViolation, StreamError};
use crate::events::Listeners;
use crate::ids::{ListenerId, StreamId};
use crate::lifecycle::{Lifecycle, Teardown};
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

/// 写入与结束回调的统一形态。
pub type WriteCallback = Box<dyn FnOnce(Result<(), StreamError>)>;

/// 数据汇协作者。
///
/// # 契约说明（What）
/// - 每个 `ack` 必须恰好完成一次；丢弃未完成的 `ack` 视为汇端失败；
/// - `supports_batch` 为 `true` 时，缓冲中积压的多个写入（例如 `uncork` 之后）以一次
///   `write_batch` 交付，批次整体共用一个确认；
/// - `construct` 在创建时调用一次，确认之前的写入只进缓冲，不会交给汇端；
/// - `finalize` 在全部写入确认之后、`finish` 之前调用一次；
/// - `destroy` 在流销毁或关闭时恰好调用一次。
pub trait Sink<T: Chunk>: 'static {
    fn write(&mut self, chunk: T, ack: SinkAck);

    fn supports_batch(&self) -> bool {
        false
    }

    /// 默认实现把批次拆成逐块写入，全部确认后批次才算完成。
    fn write_batch(&mut self, chunks: Vec<T>, ack: SinkAck) {
        let acks = ack.split(chunks.len());
        for (chunk, ack) in chunks.into_iter().zip(acks) {
            self.write(chunk, ack);
        }
    }

    /// 异步初始化；默认立即完成，失败则销毁写端。
    fn construct(&mut self, ack: SinkAck) {
        ack.ok();
    }

    fn finalize(&mut self, ack: SinkAck) {
        ack.ok();
    }

    fn destroy(&mut self, err: Option<&StreamError>) {
        let _ = err;
    }
}

/// 以闭包充当数据汇。
pub struct FnSink<F>(F);

impl<F> FnSink<F> {
    pub fn new(write: F) -> Self {
        Self(write)
    }
}

impl<T, F> Sink<T> for FnSink<F>
where
    T: Chunk,
    F: FnMut(T, SinkAck) + 'static,
{
    fn write(&mut self, chunk: T, ack: SinkAck) {
        (self.0)(chunk, ack)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AckTicket {
    Construct,
    Write(u64),
    Final,
    Part,
}

pub(crate) trait AckTarget {
    fn acknowledge(&self, ticket: AckTicket, result: Result<(), StreamError>);
}

/// 一次性写确认。
///
/// # 执行逻辑（How）
/// - `complete` 消耗自身，天然保证“至多一次”；
/// - `Drop` 时若尚未完成，在下一拍以 `ConsumerError` 回报，保证“至少一次”；
/// - 引擎销毁之后到达的确认被静默忽略。
#[must_use = "a sink acknowledgement must be completed exactly once"]
pub struct SinkAck {
    target: Option<Rc<dyn AckTarget>>,
    ticket: AckTicket,
    sched: Scheduler,
}

impl SinkAck {
    pub(crate) fn new(target: Rc<dyn AckTarget>, ticket: AckTicket, sched: &Scheduler) -> Self {
        Self {
            target: Some(target),
            ticket,
            sched: sched.clone(),
        }
    }

    /// 回报写入结果。
    pub fn complete(mut self, result: Result<(), StreamError>) {
        if let Some(target) = self.target.take() {
            target.acknowledge(self.ticket, result);
        }
    }

    pub fn ok(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, err: StreamError) {
        self.complete(Err(err));
    }

    /// 静默放弃确认，仅用于所属流已销毁的场景。
    pub(crate) fn disarm(mut self) {
        self.target = None;
    }

    /// 拆成 `parts` 个子确认：全部成功后父确认成功，任一失败立即以该错误完成父确认。
    pub fn split(mut self, parts: usize) -> Vec<SinkAck> {
        if parts == 0 {
            self.ok();
            return Vec::new();
        }
        let Some(target) = self.target.take() else {
            return Vec::new();
        };
        let parent = SinkAck {
            target: Some(target),
            ticket: self.ticket,
            sched: self.sched.clone(),
        };
        let join: Rc<dyn AckTarget> = Rc::new(AckJoin {
            remaining: Cell::new(parts),
            parent: RefCell::new(Some(parent)),
        });
        (0..parts)
            .map(|_| SinkAck::new(Rc::clone(&join), AckTicket::Part, &self.sched))
            .collect()
    }
}

impl Drop for SinkAck {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let ticket = self.ticket;
            tracing::warn!(?ticket, "sink acknowledgement dropped without completion");
            self.sched.defer(move || {
                target.acknowledge(
                    ticket,
                    Err(StreamError::consumer(
                        "sink dropped its acknowledgement without completing it",
                    )),
                );
            });
        }
    }
}

impl fmt::Debug for SinkAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkAck")
            .field("ticket", &self.ticket)
            .field("pending", &self.target.is_some())
            .finish()
    }
}

struct AckJoin {
    remaining: Cell<usize>,
    parent: RefCell<Option<SinkAck>>,
}

impl AckTarget for AckJoin {
    fn acknowledge(&self, _ticket: AckTicket, result: Result<(), StreamError>) {
        let parent = match result {
            Err(err) => self.parent.borrow_mut().take().map(|parent| (parent, Err(err))),
            Ok(()) => {
                let left = self.remaining.get().saturating_sub(1);
                self.remaining.set(left);
                if left == 0 {
                    self.parent.borrow_mut().take().map(|parent| (parent, Ok(())))
                } else {
                    None
                }
            }
        };
        if let Some((parent, result)) = parent {
            parent.complete(result);
        }
    }
}

struct EngineAck<T: Chunk> {
    writable: Weak<WritableInner<T>>,
}

impl<T: Chunk> AckTarget for EngineAck<T> {
    fn acknowledge(&self, ticket: AckTicket, result: Result<(), StreamError>) {
        if let Some(inner) = self.writable.upgrade() {
            Writable { inner }.acknowledge(ticket, result);
        }
    }
}

/// 写端状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WritableMode {
    Idle,
    /// 有写入在途或在缓冲中排队。
    Draining,
    /// 已 `end`，等待剩余写入与 `finalize`。
    Ending,
    Finished,
    Destroyed,
}

struct PendingWrite<T> {
    chunk: T,
    size: usize,
    callback: Option<WriteCallback>,
}

struct InFlight {
    seq: u64,
    size: usize,
    callbacks: Vec<WriteCallback>,
}

enum Dispatch<T> {
    Single(T),
    Batch(Vec<T>),
}

struct WritableCore<T: Chunk> {
    buffered: VecDeque<PendingWrite<T>>,
    in_flight: Option<InFlight>,
    acked: VecDeque<WriteCallback>,
    length: usize,
    hwm: usize,
    object_mode: bool,
    corked: u32,
    next_seq: u64,
    sync: bool,
    need_drain: bool,
    ending: bool,
    final_called: bool,
    prefinished: bool,
    finished: bool,
    destroyed: bool,
    constructed: bool,
    finish_callbacks: Vec<WriteCallback>,
    drain_listeners: Listeners<dyn Fn()>,
    finish_listeners: Listeners<dyn Fn()>,
}

pub(crate) struct WritableInner<T: Chunk> {
    id: StreamId,
    sched: Scheduler,
    lifecycle: Rc<Lifecycle>,
    core: RefCell<WritableCore<T>>,
    sink: RefCell<Box<dyn Sink<T>>>,
    this: Weak<WritableInner<T>>,
}

impl<T: Chunk> Teardown for WritableInner<T> {
    fn teardown(&self, err: Option<&StreamError>) {
        let (pending, finishers) = {
            let mut core = self.core.borrow_mut();
            core.destroyed = true;
            let mut pending: Vec<WriteCallback> = Vec::new();
            if let Some(flight) = core.in_flight.take() {
                pending.extend(flight.callbacks);
            }
            pending.extend(core.buffered.drain(..).filter_map(|write| write.callback));
            core.length = 0;
            (pending, std::mem::take(&mut core.finish_callbacks))
        };
        tracing::trace!(
            stream.id = %self.id,
            stream.kind = "writable",
            cancelled = pending.len(),
            "writable torn down"
        );
        if !pending.is_empty() || !finishers.is_empty() {
            let finish_err = err.cloned().unwrap_or_else(StreamError::cancelled);
            self.sched.defer(move || {
                let cancelled = StreamError::cancelled();
                for callback in pending {
                    callback(Err(cancelled.clone()));
                }
                for callback in finishers {
                    callback(Err(finish_err.clone()));
                }
            });
        }
        match self.sink.try_borrow_mut() {
            Ok(mut sink) => sink.destroy(err),
            Err(_) => {
                // 汇端在 write 调用栈内触发了销毁，钩子推迟到下一拍。
                let this = Weak::clone(&self.this);
                let err = err.cloned();
                self.sched.defer(move || {
                    if let Some(inner) = this.upgrade() {
                        if let Ok(mut sink) = inner.sink.try_borrow_mut() {
                            sink.destroy(err.as_ref());
                        }
                    }
                });
            }
        }
    }
}

/// Writable 引擎句柄，克隆后指向同一实例。
pub struct Writable<T: Chunk> {
    inner: Rc<WritableInner<T>>,
}

impl<T: Chunk> Clone for Writable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Chunk> fmt::Debug for Writable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writable")
            .field("id", &self.inner.id)
            .field("mode", &self.mode())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

/// 不延长生命周期的写端引用。
pub(crate) struct WeakWritable<T: Chunk>(Weak<WritableInner<T>>);

impl<T: Chunk> Clone for WeakWritable<T> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}

impl<T: Chunk> WeakWritable<T> {
    pub(crate) fn upgrade(&self) -> Option<Writable<T>> {
        self.0.upgrade().map(|inner| Writable { inner })
    }
}

impl<T: Chunk> Writable<T> {
    /// 创建独立的 Writable。
    pub fn new(sched: &Scheduler, options: WritableOptions, sink: impl Sink<T>) -> Self {
        let id = StreamId::next();
        let lifecycle = Lifecycle::new(sched, id, "writable", options.auto_destroy);
        Self::with_lifecycle(sched, id, &options, Box::new(sink), lifecycle)
    }

    pub(crate) fn with_lifecycle(
        sched: &Scheduler,
        id: StreamId,
        options: &WritableOptions,
        sink: Box<dyn Sink<T>>,
        lifecycle: Rc<Lifecycle>,
    ) -> Self {
        let object_mode = object_mode_for::<T>(options.object_mode);
        let hwm = resolve_high_water_mark(options.high_water_mark, object_mode);
        let inner = Rc::new_cyclic(|this| WritableInner {
            id,
            sched: sched.clone(),
            lifecycle: Rc::clone(&lifecycle),
            core: RefCell::new(WritableCore {
                buffered: VecDeque::new(),
                in_flight: None,
                acked: VecDeque::new(),
                length: 0,
                hwm,
                object_mode,
                corked: 0,
                next_seq: 0,
                sync: false,
                need_drain: false,
                ending: false,
                final_called: false,
                prefinished: false,
                finished: false,
                destroyed: false,
                constructed: false,
                finish_callbacks: Vec::new(),
                drain_listeners: Listeners::new(),
                finish_listeners: Listeners::new(),
            }),
            sink: RefCell::new(sink),
            this: Weak::clone(this),
        });
        let member: Rc<dyn Teardown> = inner.clone();
        lifecycle.attach(Rc::downgrade(&member));
        tracing::trace!(
            stream.id = %id,
            stream.kind = "writable",
            high_water_mark = hwm,
            object_mode,
            "writable created"
        );
        let writable = Self { inner };
        writable.construct();
        writable
    }

    fn construct(&self) {
        let ack = self.ack(AckTicket::Construct);
        if let Ok(mut sink) = self.inner.sink.try_borrow_mut() {
            sink.construct(ack);
        }
    }

    fn on_constructed(&self, result: Result<(), StreamError>) {
        if let Err(err) = result {
            if !self.inner.core.borrow().destroyed {
                tracing::warn!(
                    stream.id = %self.inner.id,
                    stream.kind = "writable",
                    error = %err,
                    "sink construction failed"
                );
                self.inner.lifecycle.destroy(Some(err));
            }
            return;
        }
        let (flush, settle) = {
            let mut core = self.inner.core.borrow_mut();
            if core.destroyed || std::mem::replace(&mut core.constructed, true) {
                return;
            }
            (!core.buffered.is_empty(), core.ending)
        };
        tracing::trace!(stream.id = %self.inner.id, stream.kind = "writable", "sink constructed");
        if flush {
            self.clear_buffer();
        }
        if settle {
            self.finish_maybe();
        }
    }

    pub(crate) fn downgrade(&self) -> WeakWritable<T> {
        WeakWritable(Rc::downgrade(&self.inner))
    }

    pub(crate) fn lifecycle(&self) -> &Rc<Lifecycle> {
        &self.inner.lifecycle
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.sched
    }

    fn ack(&self, ticket: AckTicket) -> SinkAck {
        let target: Rc<dyn AckTarget> = Rc::new(EngineAck {
            writable: Rc::downgrade(&self.inner),
        });
        SinkAck::new(target, ticket, &self.inner.sched)
    }

    /// 写入一块数据，`on_complete` 在汇端确认（或失败、取消）后执行。
    ///
    /// 返回 `false` 表示未确认总量已达高水位，调用方应等待 `drain`。
    pub fn write(
        &self,
        chunk: T,
        on_complete: impl FnOnce(Result<(), StreamError>) + 'static,
    ) -> bool {
        self.write_inner(chunk, Some(Box::new(on_complete)))
    }

    /// 不关心完成结果的写入。
    pub fn write_chunk(&self, chunk: T) -> bool {
        self.write_inner(chunk, None)
    }

    fn write_inner(&self, chunk: T, callback: Option<WriteCallback>) -> bool {
        let rejected = {
            let core = self.inner.core.borrow();
            if core.destroyed {
                Some(ProtocolViolation::WriteAfterDestroy)
            } else if core.ending {
                Some(ProtocolViolation::WriteAfterEnd)
            } else {
                None
            }
        };
        if let Some(violation) = rejected {
            self.reject_write(violation, callback);
            return false;
        }

        let accepted = {
            let mut core = self.inner.core.borrow_mut();
            let size = measure(&chunk, core.object_mode);
            core.length += size;
            let accepted = core.length < core.hwm;
            if !accepted {
                core.need_drain = true;
            }
            core.buffered.push_back(PendingWrite {
                chunk,
                size,
                callback,
            });
            accepted
        };
        self.clear_buffer();
        accepted && !self.inner.core.borrow().destroyed
    }

    fn reject_write(&self, violation: ProtocolViolation, callback: Option<WriteCallback>) {
        tracing::warn!(
            stream.id = %self.inner.id,
            stream.kind = "writable",
            violation = %violation,
            "write rejected"
        );
        let after_end = violation == ProtocolViolation::WriteAfterEnd;
        let err = StreamError::protocol(violation);
        if let Some(callback) = callback {
            let err = err.clone();
            self.inner.sched.defer(move || callback(Err(err)));
        }
        if after_end {
            self.inner.lifecycle.destroy(Some(err));
        }
    }

    /// 把可发送的缓冲交给汇端；同步确认时在本循环内继续发送下一个。
    fn clear_buffer(&self) {
        loop {
            let Ok(mut sink) = self.inner.sink.try_borrow_mut() else {
                let this = self.clone();
                self.inner.sched.defer(move || this.clear_buffer());
                return;
            };
            let (seq, dispatch) = {
                let mut core = self.inner.core.borrow_mut();
                if core.destroyed
                    || !core.constructed
                    || core.in_flight.is_some()
                    || core.corked > 0
                    || core.buffered.is_empty()
                {
                    return;
                }
                core.next_seq += 1;
                let seq = core.next_seq;
                core.sync = true;
                if core.buffered.len() > 1 && sink.supports_batch() {
                    let mut chunks = Vec::with_capacity(core.buffered.len());
                    let mut callbacks = Vec::new();
                    let mut size = 0;
                    for write in core.buffered.drain(..) {
                        size += write.size;
                        chunks.push(write.chunk);
                        callbacks.extend(write.callback);
                    }
                    core.in_flight = Some(InFlight {
                        seq,
                        size,
                        callbacks,
                    });
                    (seq, Dispatch::Batch(chunks))
                } else {
                    let Some(write) = core.buffered.pop_front() else {
                        return;
                    };
                    core.in_flight = Some(InFlight {
                        seq,
                        size: write.size,
                        callbacks: write.callback.into_iter().collect(),
                    });
                    (seq, Dispatch::Single(write.chunk))
                }
            };
            let ack = self.ack(AckTicket::Write(seq));
            match dispatch {
                Dispatch::Single(chunk) => sink.write(chunk, ack),
                Dispatch::Batch(chunks) => {
                    tracing::trace!(
                        stream.id = %self.inner.id,
                        stream.kind = "writable",
                        batch = chunks.len(),
                        "batched write"
                    );
                    sink.write_batch(chunks, ack)
                }
            }
            drop(sink);
            self.inner.core.borrow_mut().sync = false;
        }
    }

    fn acknowledge(&self, ticket: AckTicket, result: Result<(), StreamError>) {
        match ticket {
            AckTicket::Construct => self.on_constructed(result),
            AckTicket::Write(seq) => self.on_write_ack(seq, result),
            AckTicket::Final => self.on_finalized(result),
            AckTicket::Part => {}
        }
    }

    fn on_write_ack(&self, seq: u64, result: Result<(), StreamError>) {
        let (callbacks, sync) = {
            let mut core = self.inner.core.borrow_mut();
            if core.destroyed {
                tracing::trace!(stream.id = %self.inner.id, stream.kind = "writable", "late ack ignored");
                return;
            }
            let Some(flight) = core.in_flight.take_if(|flight| flight.seq == seq) else {
                return;
            };
            core.length -= flight.size;
            (flight.callbacks, core.sync)
        };
        match result {
            Ok(()) => {
                self.inner.core.borrow_mut().acked.extend(callbacks);
                if sync {
                    let this = self.clone();
                    self.inner.sched.defer(move || this.after_write());
                } else {
                    self.after_write();
                }
            }
            Err(err) => {
                tracing::warn!(
                    stream.id = %self.inner.id,
                    stream.kind = "writable",
                    error = %err,
                    "sink write failed"
                );
                for callback in callbacks {
                    let err = err.clone();
                    self.inner.sched.defer(move || callback(Err(err)));
                }
                self.inner.lifecycle.destroy(Some(err));
            }
        }
    }

    fn after_write(&self) {
        self.clear_buffer();
        let callbacks: Vec<WriteCallback> = self.inner.core.borrow_mut().acked.drain(..).collect();
        for callback in callbacks {
            callback(Ok(()));
        }
        self.maybe_drain();
        self.finish_maybe();
    }

    fn maybe_drain(&self) {
        let listeners = {
            let mut core = self.inner.core.borrow_mut();
            let below = core.length < core.hwm || core.length == 0;
            if core.need_drain && below && !core.ending && !core.destroyed {
                core.need_drain = false;
                Some(core.drain_listeners.snapshot())
            } else {
                None
            }
        };
        if let Some(listeners) = listeners {
            tracing::trace!(stream.id = %self.inner.id, stream.kind = "writable", "drain");
            for listener in listeners {
                listener();
            }
        }
    }

    fn finish_maybe(&self) {
        let finalize = {
            let mut core = self.inner.core.borrow_mut();
            let settled = core.ending
                && core.constructed
                && !core.destroyed
                && !core.finished
                && core.length == 0
                && core.buffered.is_empty()
                && core.in_flight.is_none();
            settled && !std::mem::replace(&mut core.final_called, true)
        };
        if finalize {
            self.call_finalize();
        }
    }

    fn call_finalize(&self) {
        match self.inner.sink.try_borrow_mut() {
            Ok(mut sink) => {
                self.inner.core.borrow_mut().sync = true;
                sink.finalize(self.ack(AckTicket::Final));
                drop(sink);
                self.inner.core.borrow_mut().sync = false;
            }
            Err(_) => {
                let this = self.clone();
                self.inner.sched.defer(move || this.call_finalize());
            }
        }
    }

    fn on_finalized(&self, result: Result<(), StreamError>) {
        if self.inner.core.borrow().destroyed {
            return;
        }
        match result {
            Ok(()) => {
                self.inner.core.borrow_mut().prefinished = true;
                let this = self.clone();
                self.inner.sched.defer(move || this.finish());
            }
            Err(err) => {
                let finishers = std::mem::take(&mut self.inner.core.borrow_mut().finish_callbacks);
                for callback in finishers {
                    let err = err.clone();
                    self.inner.sched.defer(move || callback(Err(err)));
                }
                self.inner.lifecycle.destroy(Some(err));
            }
        }
    }

    fn finish(&self) {
        let (finishers, listeners) = {
            let mut core = self.inner.core.borrow_mut();
            if core.destroyed || core.finished || !core.prefinished {
                return;
            }
            core.finished = true;
            (
                std::mem::take(&mut core.finish_callbacks),
                core.finish_listeners.snapshot(),
            )
        };
        tracing::debug!(stream.id = %self.inner.id, stream.kind = "writable", "writable finished");
        for callback in finishers {
            callback(Ok(()));
        }
        for listener in listeners {
            listener();
        }
        self.inner.lifecycle.complete_member();
    }

    /// 结束写入。
    pub fn end(&self, final_chunk: Option<T>) {
        self.end_inner(final_chunk, None);
    }

    /// 结束写入，`on_finish` 在 `Finished` 时（或失败时）执行。
    pub fn end_with(
        &self,
        final_chunk: Option<T>,
        on_finish: impl FnOnce(Result<(), StreamError>) + 'static,
    ) {
        self.end_inner(final_chunk, Some(Box::new(on_finish)));
    }

    fn end_inner(&self, final_chunk: Option<T>, callback: Option<WriteCallback>) {
        let mut err = None;
        if let Some(chunk) = final_chunk {
            let rejected = {
                let core = self.inner.core.borrow();
                if core.destroyed {
                    Some(ProtocolViolation::WriteAfterDestroy)
                } else if core.ending {
                    Some(ProtocolViolation::WriteAfterEnd)
                } else {
                    None
                }
            };
            match rejected {
                Some(violation) => {
                    err = Some(StreamError::protocol(violation.clone()));
                    self.reject_write(violation, None);
                }
                None => {
                    self.write_inner(chunk, None);
                }
            }
        }

        let uncork = {
            let mut core = self.inner.core.borrow_mut();
            std::mem::replace(&mut core.corked, 0) > 0
        };
        if uncork {
            self.clear_buffer();
        }

        let start = {
            let mut core = self.inner.core.borrow_mut();
            let mut start = false;
            if err.is_none() {
                if !core.destroyed && !core.ending {
                    core.ending = true;
                    start = true;
                } else if core.finished {
                    err = Some(StreamError::protocol(ProtocolViolation::AlreadyFinished));
                } else if core.destroyed {
                    err = Some(StreamError::protocol(ProtocolViolation::EndAfterDestroy));
                }
            }
            if let Some(callback) = callback {
                if let Some(err) = err {
                    self.inner.sched.defer(move || callback(Err(err)));
                } else if core.finished {
                    self.inner.sched.defer(move || callback(Ok(())));
                } else {
                    core.finish_callbacks.push(callback);
                }
            }
            start
        };
        if start {
            tracing::debug!(stream.id = %self.inner.id, stream.kind = "writable", "writable ending");
            self.finish_maybe();
        }
    }

    /// 暂存后续写入，直到对应次数的 `uncork`。
    pub fn cork(&self) {
        self.inner.core.borrow_mut().corked += 1;
    }

    pub fn uncork(&self) {
        let flush = {
            let mut core = self.inner.core.borrow_mut();
            if core.corked == 0 {
                return;
            }
            core.corked -= 1;
            core.corked == 0
        };
        if flush {
            self.clear_buffer();
        }
    }

    /// 销毁写端（Duplex 中连同读端）。
    pub fn destroy(&self, err: Option<StreamError>) {
        self.inner.lifecycle.destroy(err);
    }

    pub fn on_drain(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner.core.borrow_mut().drain_listeners.add(Rc::new(listener))
    }

    /// 注册 finish 监听；若已完成，在下一拍补发。
    pub fn on_finish(&self, listener: impl Fn() + 'static) -> ListenerId {
        let listener: Rc<dyn Fn()> = Rc::new(listener);
        let (id, late) = {
            let mut core = self.inner.core.borrow_mut();
            (core.finish_listeners.add(Rc::clone(&listener)), core.finished)
        };
        if late {
            self.inner.sched.defer(move || listener());
        }
        id
    }

    pub fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        self.inner.lifecycle.on_error(Rc::new(listener))
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.inner.lifecycle.on_close(Rc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let removed = {
            let mut core = self.inner.core.borrow_mut();
            core.drain_listeners.remove(id) || core.finish_listeners.remove(id)
        };
        removed || self.inner.lifecycle.off(id)
    }

    pub fn mode(&self) -> WritableMode {
        let core = self.inner.core.borrow();
        if core.destroyed {
            WritableMode::Destroyed
        } else if core.finished {
            WritableMode::Finished
        } else if core.ending {
            WritableMode::Ending
        } else if core.in_flight.is_some() || !core.buffered.is_empty() {
            WritableMode::Draining
        } else {
            WritableMode::Idle
        }
    }

    /// 上一次 `write` 返回 `false` 之后尚未 drain。
    pub fn needs_drain(&self) -> bool {
        self.inner.core.borrow().need_drain
    }

    /// 已缓冲但未确认的计量总量。
    pub fn buffered_len(&self) -> usize {
        self.inner.core.borrow().length
    }

    pub fn corked(&self) -> u32 {
        self.inner.core.borrow().corked
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.core.borrow().hwm
    }

    pub fn is_finished(&self) -> bool {
        self.inner.core.borrow().finished
    }

    pub fn is_ending(&self) -> bool {
        self.inner.core.borrow().ending
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.core.borrow().destroyed
    }

    pub fn error(&self) -> Option<StreamError> {
        self.inner.lifecycle.error()
    }
}
