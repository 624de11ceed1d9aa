//! Readable 引擎：数据源驱动的缓冲读端。
//!
//! # 设计背景（Why）
//! - 数据源（[`Source`]）按需被要求“再填一点”，通过 [`SourceContext::push`] 交付数据，
//!   返回值就是背压信号：`false` 表示缓冲已达高水位，数据源应暂停；
//! - 消费方二选一：拉取（[`Readable::read`]，常与 `on_readable` 搭配）或流动（`on_data` / `resume`），
//!   两种模式在同一实例上互斥。
//!
//! # 执行逻辑（How）
//! - 所有状态位于 `RefCell<ReadableCore>`；调用任何用户回调（数据源、监听器）之前都先释放借用；
//! - “下一拍”统一走 [`Scheduler::defer`]：`resume` 之后的投递、readable/end 事件、预读（read-more）；
//! - 流动模式下每次交付一块（队头块），对象模式每次一个对象。
//!
//! # 契约说明（What）
//! - `push` 在 `!ended && (len < hwm || len == 0)` 时返回 `true`；
//! - 结束标记之后队列排空才发出 `end`，且只在消费方把数据读完之后发出；
//! - 销毁后丢弃缓冲，数据源的销毁钩子恰好调用一次。

use crate::chunk::{Chunk, object_mode_for};
use crate::config::{MAX_HIGH_WATER_MARK, ReadableOptions, resolve_high_water_mark};
use crate::error::{ProtocolViolation, StreamError};
use crate::events::Listeners;
use crate::ids::{ListenerId, PipeId, StreamId};
use crate::lifecycle::{Lifecycle, Teardown};
use crate::queue::ChunkQueue;
use crate::scheduler::Scheduler;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::{Rc, Weak};

/// 数据源协作者。
///
/// # 契约说明（What）
/// - `fill` 被调用意味着引擎愿意再接收约 `size_hint` 个计量单位的数据；实现可以同步 `push`，
///   也可以克隆 `ctx` 稍后异步 `push`；
/// - 在下一次 `push`（或 `push_eof`）之前引擎不会重复调用 `fill`；
/// - `construct` 在创建时调用一次，`ctx.constructed()` 之前引擎不会调用 `fill`；
/// - `destroy` 在流销毁或关闭时恰好调用一次，正常结束时参数为 `None`。
pub trait Source<T: Chunk>: 'static {
    fn fill(&mut self, ctx: &SourceContext<T>, size_hint: usize);

    /// 异步初始化（打开文件、建立连接等）；默认立即完成。失败时调用 `ctx.fail`。
    fn construct(&mut self, ctx: &SourceContext<T>) {
        ctx.constructed();
    }

    fn destroy(&mut self, err: Option<&StreamError>) {
        let _ = err;
    }
}

/// 交给数据源的推送句柄；只持有弱引用，流释放后推送返回 `false`。
pub struct SourceContext<T: Chunk> {
    readable: Weak<ReadableInner<T>>,
}

impl<T: Chunk> Clone for SourceContext<T> {
    fn clone(&self) -> Self {
        Self {
            readable: Weak::clone(&self.readable),
        }
    }
}

impl<T: Chunk> SourceContext<T> {
    fn upgrade(&self) -> Option<Readable<T>> {
        self.readable.upgrade().map(|inner| Readable { inner })
    }

    /// 推送一块数据，返回值语义同 [`Readable::push`]。
    pub fn push(&self, chunk: T) -> bool {
        self.upgrade().is_some_and(|readable| readable.push(chunk))
    }

    /// 推送结束标记。
    pub fn push_eof(&self) -> bool {
        self.upgrade().is_some_and(|readable| readable.push_eof())
    }

    /// 初始化完成，允许引擎开始调用 `fill`；重复调用为空操作。
    pub fn constructed(&self) {
        if let Some(readable) = self.upgrade() {
            readable.on_constructed();
        }
    }

    /// 上报数据源失败，销毁整个流。
    pub fn fail(&self, err: StreamError) {
        if let Some(readable) = self.upgrade() {
            readable.destroy(Some(err));
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.upgrade().is_none_or(|readable| readable.is_destroyed())
    }
}

/// 以闭包充当数据源。
pub struct FnSource<F>(F);

impl<F> FnSource<F> {
    pub fn new(fill: F) -> Self {
        Self(fill)
    }
}

impl<T, F> Source<T> for FnSource<F>
where
    T: Chunk,
    F: FnMut(&SourceContext<T>, usize) + 'static,
{
    fn fill(&mut self, ctx: &SourceContext<T>, size_hint: usize) {
        (self.0)(ctx, size_hint)
    }
}

/// 迭代器数据源：每次填充推送到背压为止，耗尽后推送结束标记。
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<T, I> Source<T> for IterSource<I>
where
    T: Chunk,
    I: Iterator<Item = T> + 'static,
{
    fn fill(&mut self, ctx: &SourceContext<T>, _size_hint: usize) {
        loop {
            match self.iter.next() {
                Some(chunk) => {
                    if !ctx.push(chunk) {
                        break;
                    }
                }
                None => {
                    ctx.push_eof();
                    break;
                }
            }
        }
    }
}

/// 读端状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadableMode {
    Idle,
    /// 已请求数据源填充，尚未收到推送。
    Reading,
    /// 已收到结束标记且缓冲已排空。
    Ended,
    Destroyed,
}

/// [`Readable::read`] 的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    Data(T),
    /// 暂无数据，数据源稍后推送时会有 readable 通知。
    Pending,
    /// 已结束且缓冲为空。
    End,
    Destroyed,
}

impl<T> ReadOutcome<T> {
    pub fn into_data(self) -> Option<T> {
        match self {
            ReadOutcome::Data(chunk) => Some(chunk),
            _ => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, ReadOutcome::End)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Consumption {
    Unset,
    Pull,
    Flowing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Caller {
    Consumer,
    Flow,
    Engine,
}

struct ReadableCore<T: Chunk> {
    queue: ChunkQueue<T>,
    hwm: usize,
    lwm: Option<usize>,
    /// `None`：尚无消费方；`Some(false)`：显式暂停；`Some(true)`：流动。
    flowing: Option<bool>,
    reading: bool,
    sync: bool,
    need_readable: bool,
    emitted_readable: bool,
    reading_more: bool,
    resume_scheduled: bool,
    end_scheduled: bool,
    eof: bool,
    end_emitted: bool,
    destroyed: bool,
    constructed: bool,
    consumption: Consumption,
    data_listeners: Listeners<dyn Fn(T)>,
    readable_listeners: Listeners<dyn Fn()>,
    end_listeners: Listeners<dyn Fn()>,
    pipes: Vec<PipeId>,
    awaiting_drain: BTreeSet<PipeId>,
}

impl<T: Chunk> ReadableCore<T> {
    fn low_water_mark(&self) -> usize {
        self.lwm.map_or(self.hwm, |lwm| lwm.min(self.hwm))
    }

    fn can_push_more(&self) -> bool {
        !self.destroyed && !self.eof && (self.queue.len() < self.hwm || self.queue.is_empty())
    }

    fn how_much_to_read(&self, n: Option<usize>) -> usize {
        if n == Some(0) || (self.queue.is_empty() && self.eof) {
            return 0;
        }
        if self.queue.object_mode() {
            return 1;
        }
        match n {
            None if self.flowing == Some(true) => self.queue.front_size().unwrap_or(0),
            None => self.queue.len(),
            Some(k) if k <= self.queue.len() => k,
            Some(_) if self.eof => self.queue.len(),
            Some(_) => 0,
        }
    }
}

pub(crate) struct ReadableInner<T: Chunk> {
    id: StreamId,
    sched: Scheduler,
    lifecycle: Rc<Lifecycle>,
    core: RefCell<ReadableCore<T>>,
    source: RefCell<Box<dyn Source<T>>>,
    this: Weak<ReadableInner<T>>,
}

impl<T: Chunk> Teardown for ReadableInner<T> {
    fn teardown(&self, err: Option<&StreamError>) {
        let dropped = {
            let mut core = self.core.borrow_mut();
            core.destroyed = true;
            core.reading = false;
            core.awaiting_drain.clear();
            core.queue.clear()
        };
        tracing::trace!(stream.id = %self.id, stream.kind = "readable", dropped, "readable torn down");
        match self.source.try_borrow_mut() {
            Ok(mut source) => source.destroy(err),
            Err(_) => {
                // 数据源正在 fill 中自我销毁，钩子推迟到下一拍。
                let this = Weak::clone(&self.this);
                let err = err.cloned();
                self.sched.defer(move || {
                    if let Some(inner) = this.upgrade() {
                        if let Ok(mut source) = inner.source.try_borrow_mut() {
                            source.destroy(err.as_ref());
                        }
                    }
                });
            }
        }
    }
}

/// Readable 引擎句柄，克隆后指向同一实例。
pub struct Readable<T: Chunk> {
    inner: Rc<ReadableInner<T>>,
}

impl<T: Chunk> Clone for Readable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Chunk> fmt::Debug for Readable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readable")
            .field("id", &self.inner.id)
            .field("mode", &self.mode())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

/// 不延长生命周期的读端引用，供管道订阅使用。
pub(crate) struct WeakReadable<T: Chunk>(Weak<ReadableInner<T>>);

impl<T: Chunk> Clone for WeakReadable<T> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}

impl<T: Chunk> WeakReadable<T> {
    pub(crate) fn upgrade(&self) -> Option<Readable<T>> {
        self.0.upgrade().map(|inner| Readable { inner })
    }
}

fn emit_data<T: Chunk>(listeners: Vec<Rc<dyn Fn(T)>>, chunk: T) {
    if let Some((last, rest)) = listeners.split_last() {
        for listener in rest {
            listener(chunk.clone());
        }
        last(chunk);
    }
}

impl<T: Chunk> Readable<T> {
    /// 创建独立的 Readable。
    pub fn new(sched: &Scheduler, options: ReadableOptions, source: impl Source<T>) -> Self {
        let id = StreamId::next();
        let lifecycle = Lifecycle::new(sched, id, "readable", options.auto_destroy);
        Self::with_lifecycle(sched, id, &options, Box::new(source), lifecycle)
    }

    /// 以迭代器为数据源创建 Readable。
    pub fn from_items<I>(sched: &Scheduler, options: ReadableOptions, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Self::new(sched, options, IterSource::new(items.into_iter()))
    }

    pub(crate) fn with_lifecycle(
        sched: &Scheduler,
        id: StreamId,
        options: &ReadableOptions,
        source: Box<dyn Source<T>>,
        lifecycle: Rc<Lifecycle>,
    ) -> Self {
        let object_mode = object_mode_for::<T>(options.object_mode);
        let hwm = resolve_high_water_mark(options.high_water_mark, object_mode);
        let inner = Rc::new_cyclic(|this| ReadableInner {
            id,
            sched: sched.clone(),
            lifecycle: Rc::clone(&lifecycle),
            core: RefCell::new(ReadableCore {
                queue: ChunkQueue::new(object_mode),
                hwm,
                lwm: options.low_water_mark,
                flowing: None,
                reading: false,
                sync: true,
                need_readable: false,
                emitted_readable: false,
                reading_more: false,
                resume_scheduled: false,
                end_scheduled: false,
                eof: false,
                end_emitted: false,
                destroyed: false,
                constructed: false,
                consumption: Consumption::Unset,
                data_listeners: Listeners::new(),
                readable_listeners: Listeners::new(),
                end_listeners: Listeners::new(),
                pipes: Vec::new(),
                awaiting_drain: BTreeSet::new(),
            }),
            source: RefCell::new(source),
            this: Weak::clone(this),
        });
        let member: Rc<dyn Teardown> = inner.clone();
        lifecycle.attach(Rc::downgrade(&member));
        tracing::trace!(
            stream.id = %id,
            stream.kind = "readable",
            high_water_mark = hwm,
            object_mode,
            "readable created"
        );
        let readable = Self { inner };
        readable.construct();
        readable
    }

    fn construct(&self) {
        let ctx = SourceContext {
            readable: Rc::downgrade(&self.inner),
        };
        if let Ok(mut source) = self.inner.source.try_borrow_mut() {
            source.construct(&ctx);
        }
    }

    fn on_constructed(&self) {
        let wake = {
            let mut core = self.inner.core.borrow_mut();
            if core.destroyed || std::mem::replace(&mut core.constructed, true) {
                return;
            }
            core.need_readable || core.flowing == Some(true)
        };
        tracing::trace!(stream.id = %self.inner.id, stream.kind = "readable", "source constructed");
        if wake {
            self.maybe_read_more();
        }
    }

    pub(crate) fn downgrade(&self) -> WeakReadable<T> {
        WeakReadable(Rc::downgrade(&self.inner))
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

    /// 推送一块数据。
    ///
    /// # 契约说明（What）
    /// - 已销毁：空操作，返回 `false`；
    /// - 结束标记之后：通过错误通道上报 `PushAfterEof`，返回 `false`；
    /// - 流动模式、缓冲为空且不在同步填充中：直接交付给 data 监听器，不入队；
    /// - 返回值为背压信号，缓冲达到高水位后为 `false`。
    pub fn push(&self, chunk: T) -> bool {
        let mut core = self.inner.core.borrow_mut();
        if core.destroyed {
            return false;
        }
        if core.eof {
            drop(core);
            self.fail_protocol(ProtocolViolation::PushAfterEof);
            return false;
        }
        core.reading = false;
        if core.queue.measure(&chunk) == 0 {
            let more = core.can_push_more();
            drop(core);
            self.maybe_read_more();
            return more;
        }

        let direct = core.flowing == Some(true)
            && !core.sync
            && core.queue.is_empty()
            && !core.data_listeners.is_empty();
        if direct {
            core.awaiting_drain.clear();
            core.consumption = Consumption::Flowing;
            let listeners = core.data_listeners.snapshot();
            drop(core);
            emit_data(listeners, chunk);
        } else {
            core.queue.push_back(chunk);
            let wake = core.need_readable || core.flowing == Some(true);
            drop(core);
            if wake {
                self.emit_readable();
            }
        }
        self.maybe_read_more();
        self.inner.core.borrow().can_push_more()
    }

    /// 推送结束标记；重复调用为空操作。
    pub fn push_eof(&self) -> bool {
        {
            let mut core = self.inner.core.borrow_mut();
            if core.destroyed || core.eof {
                return false;
            }
            core.reading = false;
            core.eof = true;
            core.need_readable = false;
            core.emitted_readable = true;
            tracing::debug!(
                stream.id = %self.inner.id,
                stream.kind = "readable",
                buffered = core.queue.len(),
                "end-of-stream pushed"
            );
        }
        self.defer_emit_readable();
        false
    }

    /// 把数据放回队头，供解析器回退多读的部分。
    pub fn unshift(&self, chunk: T) -> bool {
        let mut core = self.inner.core.borrow_mut();
        if core.destroyed {
            return false;
        }
        if core.end_emitted {
            drop(core);
            self.fail_protocol(ProtocolViolation::UnshiftAfterEnd);
            return false;
        }
        if core.queue.measure(&chunk) == 0 {
            return core.can_push_more();
        }
        core.queue.push_front(chunk);
        let wake = core.need_readable || core.flowing == Some(true);
        drop(core);
        if wake {
            self.emit_readable();
        }
        self.inner.core.borrow().can_push_more()
    }

    /// 拉取模式读取。
    ///
    /// # 契约说明（What）
    /// - `None`：读取全部缓冲；`Some(n)`：读取恰好 `n` 个单位，不足且未结束时返回 `Pending`，
    ///   已结束则返回剩余全部；对象模式总是返回一个对象；
    /// - `Some(0)`：只触发填充，不出队；
    /// - `n` 大于高水位时把高水位提升到下一个 2 的幂（上限 1 GiB）；
    /// - 已在流动模式下消费过数据时，通过错误通道上报 `ConsumptionModeConflict`。
    pub fn read(&self, n: Option<usize>) -> ReadOutcome<T> {
        match self.read_inner(n, Caller::Consumer) {
            ReadOutcome::Data(chunk) => {
                let listeners = self.inner.core.borrow().data_listeners.snapshot();
                if !listeners.is_empty() {
                    emit_data(listeners, chunk.clone());
                }
                ReadOutcome::Data(chunk)
            }
            other => other,
        }
    }

    fn read_inner(&self, n: Option<usize>, caller: Caller) -> ReadOutcome<T> {
        let mut core = self.inner.core.borrow_mut();
        if core.destroyed {
            return ReadOutcome::Destroyed;
        }
        if caller == Caller::Consumer && n != Some(0) && core.consumption == Consumption::Flowing {
            drop(core);
            self.fail_protocol(ProtocolViolation::ConsumptionModeConflict {
                active: "flowing",
                requested: "pull",
            });
            return ReadOutcome::Destroyed;
        }
        if let Some(requested) = n {
            if requested > core.hwm {
                if requested > MAX_HIGH_WATER_MARK {
                    drop(core);
                    self.fail_protocol(ProtocolViolation::HighWaterMarkOutOfRange { requested });
                    return ReadOutcome::Destroyed;
                }
                core.hwm = requested.next_power_of_two();
            }
        }
        if n != Some(0) {
            core.emitted_readable = false;
        }

        if n == Some(0) && core.need_readable {
            let full = if core.hwm != 0 {
                core.queue.len() >= core.hwm
            } else {
                !core.queue.is_empty()
            };
            if full || core.eof {
                let ended = core.eof && core.queue.is_empty();
                drop(core);
                if ended {
                    self.end_readable();
                } else {
                    self.emit_readable();
                }
                return ReadOutcome::Pending;
            }
        }

        let mut want = core.how_much_to_read(n);
        if want == 0 && core.eof {
            if core.queue.is_empty() {
                drop(core);
                self.end_readable();
                return ReadOutcome::End;
            }
            return ReadOutcome::Pending;
        }

        let mut do_read = core.need_readable;
        if core.queue.is_empty() || core.queue.len().saturating_sub(want) < core.low_water_mark() {
            do_read = true;
        }
        if core.eof || core.reading || !core.constructed {
            do_read = false;
        }
        if do_read {
            core.reading = true;
            core.sync = true;
            if core.queue.is_empty() {
                core.need_readable = true;
            }
            let hint = core.hwm;
            drop(core);
            self.call_fill(hint);
            core = self.inner.core.borrow_mut();
            core.sync = false;
            if core.destroyed {
                return ReadOutcome::Destroyed;
            }
            if !core.reading {
                want = core.how_much_to_read(n);
            }
        }

        let taken = core.queue.take(want);
        if taken.is_some() {
            core.awaiting_drain.clear();
        } else {
            core.need_readable = core.queue.len() <= core.hwm;
            want = 0;
        }
        let mut end_now = false;
        if core.queue.is_empty() {
            if !core.eof {
                core.need_readable = true;
            }
            end_now = core.eof && n != Some(want);
        }

        let outcome = match taken {
            Some(chunk) => {
                match caller {
                    Caller::Consumer => core.consumption = Consumption::Pull,
                    Caller::Flow => core.consumption = Consumption::Flowing,
                    Caller::Engine => {}
                }
                ReadOutcome::Data(chunk)
            }
            None if core.eof && core.queue.is_empty() => ReadOutcome::End,
            None => ReadOutcome::Pending,
        };
        drop(core);
        if end_now {
            self.end_readable();
        }
        outcome
    }

    fn call_fill(&self, hint: usize) {
        let ctx = SourceContext {
            readable: Rc::downgrade(&self.inner),
        };
        match self.inner.source.try_borrow_mut() {
            Ok(mut source) => source.fill(&ctx, hint),
            Err(_) => self.inner.core.borrow_mut().reading = false,
        }
    }

    fn emit_readable(&self) {
        let schedule = {
            let mut core = self.inner.core.borrow_mut();
            core.need_readable = false;
            !std::mem::replace(&mut core.emitted_readable, true)
        };
        if schedule {
            self.defer_emit_readable();
        }
    }

    fn defer_emit_readable(&self) {
        let this = self.clone();
        self.inner.sched.defer(move || this.emit_readable_now());
    }

    fn emit_readable_now(&self) {
        let listeners = {
            let core = self.inner.core.borrow();
            if core.destroyed {
                return;
            }
            (!core.queue.is_empty() || core.eof).then(|| core.readable_listeners.snapshot())
        };
        if let Some(listeners) = listeners {
            for listener in listeners {
                listener();
            }
            self.inner.core.borrow_mut().emitted_readable = false;
        }
        {
            let mut core = self.inner.core.borrow_mut();
            core.need_readable =
                core.flowing != Some(true) && !core.eof && core.queue.len() <= core.hwm;
        }
        self.flow();
    }

    fn flow(&self) {
        loop {
            let flowing = {
                let core = self.inner.core.borrow();
                core.flowing == Some(true) && !core.destroyed
            };
            if !flowing {
                break;
            }
            match self.read_inner(None, Caller::Flow) {
                ReadOutcome::Data(chunk) => {
                    let listeners = self.inner.core.borrow().data_listeners.snapshot();
                    emit_data(listeners, chunk);
                }
                _ => break,
            }
        }
    }

    fn maybe_read_more(&self) {
        let schedule = {
            let mut core = self.inner.core.borrow_mut();
            if core.reading_more || core.destroyed || core.eof {
                false
            } else {
                core.reading_more = true;
                true
            }
        };
        if schedule {
            let this = self.clone();
            self.inner.sched.defer(move || this.read_more_now());
        }
    }

    fn read_more_now(&self) {
        loop {
            let before = {
                let core = self.inner.core.borrow();
                let wants_more = !core.reading
                    && !core.eof
                    && !core.destroyed
                    && (core.queue.len() < core.hwm
                        || (core.flowing == Some(true) && core.queue.is_empty()));
                if !wants_more {
                    break;
                }
                core.queue.len()
            };
            self.read_inner(Some(0), Caller::Engine);
            if self.inner.core.borrow().queue.len() == before {
                break;
            }
        }
        self.inner.core.borrow_mut().reading_more = false;
    }

    fn end_readable(&self) {
        let schedule = {
            let mut core = self.inner.core.borrow_mut();
            !(core.end_emitted || std::mem::replace(&mut core.end_scheduled, true))
        };
        if schedule {
            let this = self.clone();
            self.inner.sched.defer(move || this.end_now());
        }
    }

    fn end_now(&self) {
        let listeners = {
            let mut core = self.inner.core.borrow_mut();
            core.end_scheduled = false;
            if core.destroyed || core.end_emitted || !core.queue.is_empty() {
                return;
            }
            core.end_emitted = true;
            core.end_listeners.snapshot()
        };
        tracing::debug!(stream.id = %self.inner.id, stream.kind = "readable", "readable ended");
        for listener in listeners {
            listener();
        }
        self.inner.lifecycle.complete_member();
    }

    /// 进入流动模式；投递在下一拍开始。
    pub fn resume(&self) {
        let schedule = {
            let mut core = self.inner.core.borrow_mut();
            if core.destroyed {
                return;
            }
            if core.consumption == Consumption::Pull {
                drop(core);
                self.fail_protocol(ProtocolViolation::ConsumptionModeConflict {
                    active: "pull",
                    requested: "flowing",
                });
                return;
            }
            if core.flowing == Some(true) {
                false
            } else {
                core.flowing = Some(core.readable_listeners.is_empty());
                !std::mem::replace(&mut core.resume_scheduled, true)
            }
        };
        if schedule {
            tracing::trace!(stream.id = %self.inner.id, stream.kind = "readable", "resume scheduled");
            let this = self.clone();
            self.inner.sched.defer(move || this.resume_now());
        }
    }

    fn resume_now(&self) {
        let reading = {
            let mut core = self.inner.core.borrow_mut();
            core.resume_scheduled = false;
            if core.destroyed {
                return;
            }
            core.reading
        };
        if !reading {
            self.read_inner(Some(0), Caller::Engine);
        }
        self.flow();
        let refill = {
            let core = self.inner.core.borrow();
            core.flowing == Some(true) && !core.reading && !core.destroyed
        };
        if refill {
            self.read_inner(Some(0), Caller::Engine);
        }
    }

    /// 退出流动模式。
    pub fn pause(&self) {
        let mut core = self.inner.core.borrow_mut();
        if core.flowing != Some(false) {
            tracing::trace!(stream.id = %self.inner.id, stream.kind = "readable", "paused");
            core.flowing = Some(false);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.core.borrow().flowing == Some(false)
    }

    pub fn is_flowing(&self) -> bool {
        self.inner.core.borrow().flowing == Some(true)
    }

    /// 销毁读端（Duplex 中连同写端）。
    pub fn destroy(&self, err: Option<StreamError>) {
        self.inner.lifecycle.destroy(err);
    }

    fn fail_protocol(&self, violation: ProtocolViolation) {
        tracing::warn!(
            stream.id = %self.inner.id,
            stream.kind = "readable",
            violation = %violation,
            "protocol violation"
        );
        self.inner.lifecycle.destroy(Some(StreamError::protocol(violation)));
    }

    /// 注册 data 监听；未被显式暂停时进入流动模式。
    pub fn on_data(&self, listener: impl Fn(T) + 'static) -> ListenerId {
        let (id, resume) = {
            let mut core = self.inner.core.borrow_mut();
            let id = core.data_listeners.add(Rc::new(listener));
            (id, core.flowing != Some(false))
        };
        if resume {
            self.resume();
        }
        id
    }

    pub(crate) fn add_data_listener(&self, listener: Rc<dyn Fn(T)>) -> ListenerId {
        self.inner.core.borrow_mut().data_listeners.add(listener)
    }

    /// 注册 readable 监听：切换到拉取模式，有数据或结束时在下一拍通知。
    pub fn on_readable(&self, listener: impl Fn() + 'static) -> ListenerId {
        enum Wake {
            Emit,
            Refill,
            Nothing,
        }
        let (id, wake) = {
            let mut core = self.inner.core.borrow_mut();
            let id = core.readable_listeners.add(Rc::new(listener));
            core.flowing = Some(false);
            core.need_readable = true;
            core.emitted_readable = false;
            let wake = if !core.queue.is_empty() {
                Wake::Emit
            } else if !core.reading {
                Wake::Refill
            } else {
                Wake::Nothing
            };
            (id, wake)
        };
        match wake {
            Wake::Emit => self.emit_readable(),
            Wake::Refill => {
                let this = self.clone();
                self.inner.sched.defer(move || {
                    this.read_inner(Some(0), Caller::Engine);
                });
            }
            Wake::Nothing => {}
        }
        id
    }

    /// 注册 end 监听；若 end 已发生，在下一拍补发。
    pub fn on_end(&self, listener: impl Fn() + 'static) -> ListenerId {
        let listener: Rc<dyn Fn()> = Rc::new(listener);
        let (id, late) = {
            let mut core = self.inner.core.borrow_mut();
            (core.end_listeners.add(Rc::clone(&listener)), core.end_emitted)
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

    /// 注销任意类型的监听器。
    pub fn off(&self, id: ListenerId) -> bool {
        let removed = {
            let mut core = self.inner.core.borrow_mut();
            core.data_listeners.remove(id)
                || core.readable_listeners.remove(id)
                || core.end_listeners.remove(id)
        };
        removed || self.inner.lifecycle.off(id)
    }

    pub fn mode(&self) -> ReadableMode {
        let core = self.inner.core.borrow();
        if core.destroyed {
            ReadableMode::Destroyed
        } else if core.eof && core.queue.is_empty() {
            ReadableMode::Ended
        } else if core.reading {
            ReadableMode::Reading
        } else {
            ReadableMode::Idle
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.core.borrow().queue.len()
    }

    pub fn high_water_mark(&self) -> usize {
        self.inner.core.borrow().hwm
    }

    pub fn is_object_mode(&self) -> bool {
        self.inner.core.borrow().queue.object_mode()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.core.borrow().destroyed
    }

    /// `end` 事件是否已发出。
    pub fn is_ended(&self) -> bool {
        self.inner.core.borrow().end_emitted
    }

    pub fn error(&self) -> Option<StreamError> {
        self.inner.lifecycle.error()
    }

    pub(crate) fn register_pipe(&self, id: PipeId) {
        self.inner.core.borrow_mut().pipes.push(id);
    }

    /// 某个管道的汇端返回了背压：记录并暂停。
    pub(crate) fn pause_for_drain(&self, id: PipeId) {
        self.inner.core.borrow_mut().awaiting_drain.insert(id);
        self.pause();
    }

    /// 某个管道的汇端已 drain；没有管道再等待时恢复流动。
    pub(crate) fn release_drain(&self, id: PipeId) {
        let resume = {
            let mut core = self.inner.core.borrow_mut();
            core.awaiting_drain.remove(&id);
            core.awaiting_drain.is_empty()
                && !core.data_listeners.is_empty()
                && core.flowing != Some(true)
        };
        if resume {
            self.resume();
        }
    }

    /// 管道解除：最后一个管道离开时暂停，否则释放它可能持有的 drain 等待。
    pub(crate) fn unregister_pipe(&self, id: PipeId) {
        let (last, was_waiting) = {
            let mut core = self.inner.core.borrow_mut();
            core.pipes.retain(|pipe| *pipe != id);
            (core.pipes.is_empty(), core.awaiting_drain.contains(&id))
        };
        if last {
            self.inner.core.borrow_mut().awaiting_drain.remove(&id);
            self.pause();
        } else if was_waiting {
            self.release_drain(id);
        }
    }
}
