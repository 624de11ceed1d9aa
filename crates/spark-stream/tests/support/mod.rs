//! 集成测试共享的桩件：记录型汇端、手动确认汇端与带计数的数据源。
//!
//! 每个测试文件各自编译本模块，未用到的桩件不视为死代码。
#![allow(dead_code)]

use spark_stream::{Chunk, Sink, SinkAck, Source, SourceContext, StreamError};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// 安装一次 fmt 订阅者，输出经测试框架捕获；`RUST_LOG` 控制级别。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 同步确认的汇端，记录收到的块与销毁次数；可配置在第 `n` 次写入时失败。
pub struct RecordingSink<T> {
    pub seen: Rc<RefCell<Vec<T>>>,
    pub destroyed: Rc<Cell<usize>>,
    fail_on: Option<(usize, StreamError)>,
    writes: usize,
}

impl<T> RecordingSink<T> {
    pub fn new() -> Self {
        Self {
            seen: Rc::new(RefCell::new(Vec::new())),
            destroyed: Rc::new(Cell::new(0)),
            fail_on: None,
            writes: 0,
        }
    }

    /// 第 `nth` 次写入（从 1 开始）以 `err` 失败，该块不计入 `seen`。
    pub fn failing_on(mut self, nth: usize, err: StreamError) -> Self {
        self.fail_on = Some((nth, err));
        self
    }

    pub fn counters(&self) -> (Rc<RefCell<Vec<T>>>, Rc<Cell<usize>>) {
        (Rc::clone(&self.seen), Rc::clone(&self.destroyed))
    }
}

impl<T: Chunk> Sink<T> for RecordingSink<T> {
    fn write(&mut self, chunk: T, ack: SinkAck) {
        self.writes += 1;
        if let Some((nth, err)) = &self.fail_on {
            if *nth == self.writes {
                ack.fail(err.clone());
                return;
            }
        }
        self.seen.borrow_mut().push(chunk);
        ack.ok();
    }

    fn destroy(&mut self, _err: Option<&StreamError>) {
        self.destroyed.set(self.destroyed.get() + 1);
    }
}

/// 手动确认汇端的控制端：测试代码决定何时确认哪一次写入。
pub struct AckQueue<T> {
    pending: Rc<RefCell<VecDeque<(T, SinkAck)>>>,
    finals: Rc<RefCell<VecDeque<SinkAck>>>,
}

impl<T> Clone for AckQueue<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Rc::clone(&self.pending),
            finals: Rc::clone(&self.finals),
        }
    }
}

impl<T> AckQueue<T> {
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// 已交给汇端、尚未确认的块。
    pub fn in_flight(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.pending.borrow().iter().map(|(chunk, _)| chunk.clone()).collect()
    }

    /// 成功确认最早的一次写入，返回对应的块。
    pub fn ack_next(&self) -> Option<T> {
        let next = self.pending.borrow_mut().pop_front();
        next.map(|(chunk, ack)| {
            ack.ok();
            chunk
        })
    }

    pub fn fail_next(&self, err: StreamError) -> Option<T> {
        let next = self.pending.borrow_mut().pop_front();
        next.map(|(chunk, ack)| {
            ack.fail(err);
            chunk
        })
    }

    /// 确认 `finalize`；尚未调用 `finalize` 时返回 `false`。
    pub fn ack_final(&self) -> bool {
        let next = self.finals.borrow_mut().pop_front();
        next.map(SinkAck::ok).is_some()
    }

    pub fn final_requested(&self) -> bool {
        !self.finals.borrow().is_empty()
    }
}

/// 所有确认都交给 [`AckQueue`] 的汇端，`finalize` 同样等待手动确认。
pub struct ManualSink<T> {
    queue: AckQueue<T>,
}

pub fn manual_sink<T>() -> (ManualSink<T>, AckQueue<T>) {
    let queue = AckQueue {
        pending: Rc::new(RefCell::new(VecDeque::new())),
        finals: Rc::new(RefCell::new(VecDeque::new())),
    };
    (
        ManualSink {
            queue: queue.clone(),
        },
        queue,
    )
}

impl<T: Chunk> Sink<T> for ManualSink<T> {
    fn write(&mut self, chunk: T, ack: SinkAck) {
        self.queue.pending.borrow_mut().push_back((chunk, ack));
    }

    fn finalize(&mut self, ack: SinkAck) {
        self.queue.finals.borrow_mut().push_back(ack);
    }

    fn destroy(&mut self, _err: Option<&StreamError>) {
        // 销毁后到达的确认（包括 Drop 补发的失败）都会被引擎忽略。
        self.queue.pending.borrow_mut().clear();
        self.queue.finals.borrow_mut().clear();
    }
}

/// 每次填充只推送一块的数据源，耗尽后推送结束标记。
pub struct ScriptedSource<T> {
    items: VecDeque<T>,
    pub fills: Rc<Cell<usize>>,
    pub destroyed: Rc<Cell<usize>>,
}

impl<T> ScriptedSource<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
            fills: Rc::new(Cell::new(0)),
            destroyed: Rc::new(Cell::new(0)),
        }
    }

    pub fn counters(&self) -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
        (Rc::clone(&self.fills), Rc::clone(&self.destroyed))
    }
}

impl<T: Chunk> Source<T> for ScriptedSource<T> {
    fn fill(&mut self, ctx: &SourceContext<T>, _size_hint: usize) {
        self.fills.set(self.fills.get() + 1);
        match self.items.pop_front() {
            Some(chunk) => {
                ctx.push(chunk);
            }
            None => {
                ctx.push_eof();
            }
        }
    }

    fn destroy(&mut self, _err: Option<&StreamError>) {
        self.destroyed.set(self.destroyed.get() + 1);
    }
}

/// 从不主动推送的数据源，测试代码直接调用 `Readable::push`。
pub struct Silent;

impl<T: Chunk> Source<T> for Silent {
    fn fill(&mut self, _ctx: &SourceContext<T>, _size_hint: usize) {}
}

/// 共享的事件日志。
pub type Log<T> = Rc<RefCell<Vec<T>>>;

pub fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// 持有一枚引用计数令牌的协作者：既可作数据源（从不推送）也可作汇端（同步确认）。
/// 令牌的强引用计数回落到 1 即说明引擎连同协作者已被释放。
pub struct TokenHolder {
    _token: Rc<()>,
}

impl TokenHolder {
    pub fn new(token: &Rc<()>) -> Self {
        Self {
            _token: Rc::clone(token),
        }
    }
}

impl<T: Chunk> Source<T> for TokenHolder {
    fn fill(&mut self, _ctx: &SourceContext<T>, _size_hint: usize) {}
}

impl<T: Chunk> Sink<T> for TokenHolder {
    fn write(&mut self, _chunk: T, ack: SinkAck) {
        ack.ok();
    }
}
