//! Readable 引擎的端到端行为：背压信号、流动与暂停、拉取模式以及销毁语义。

mod support;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use spark_stream::{
    ProtocolViolation, ReadOutcome, Readable, ReadableMode, ReadableOptions, Scheduler, Source,
    SourceContext, StreamError,
};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use support::{ScriptedSource, Silent, init_tracing, log};

#[test]
fn byte_mode_backpressure_follows_the_high_water_mark() {
    init_tracing();
    let sched = Scheduler::new();
    let r: Readable<Bytes> =
        Readable::new(&sched, ReadableOptions::default().high_water_mark(10), Silent);

    let signals: Vec<bool> = [b"abc", b"def", b"ghi", b"jkl", b"mno"]
        .iter()
        .map(|chunk| r.push(Bytes::from_static(*chunk)))
        .collect();
    assert_eq!(signals, vec![true, true, true, false, false]);
    assert_eq!(r.buffered_len(), 15);

    let head = r.read(Some(9)).into_data().expect("缓冲足够时应立即返回数据");
    assert_eq!(head, Bytes::from_static(b"abcdefghi"));
    assert_eq!(r.buffered_len(), 6);

    let rest = r.read(None).into_data().expect("读取全部缓冲");
    assert_eq!(rest, Bytes::from_static(b"jklmno"));
}

#[test]
fn sized_read_waits_for_the_full_amount_until_the_end_marker() {
    let sched = Scheduler::new();
    let r: Readable<Bytes> =
        Readable::new(&sched, ReadableOptions::default().high_water_mark(10), Silent);
    assert!(r.push(Bytes::from_static(b"abcde")));

    assert_eq!(r.read(Some(9)), ReadOutcome::Pending, "不足 9 个单位且未结束时不出队");
    assert_eq!(r.buffered_len(), 5);

    r.push_eof();
    assert_eq!(
        r.read(Some(9)),
        ReadOutcome::Data(Bytes::from_static(b"abcde")),
        "结束之后返回剩余全部"
    );
    assert_eq!(r.read(Some(9)), ReadOutcome::End);
    sched.run_until_idle().unwrap();
    assert!(r.is_ended());
}

#[test]
fn flowing_mode_delivers_in_order_then_ends_once() {
    init_tracing();
    let sched = Scheduler::new();
    let r = Readable::from_items(&sched, ReadableOptions::default(), vec![1u32, 2, 3]);
    let seen = log();
    let ends = Rc::new(Cell::new(0));
    let closes = Rc::new(Cell::new(0));
    {
        let seen = Rc::clone(&seen);
        r.on_data(move |x| seen.borrow_mut().push(x));
    }
    {
        let ends = Rc::clone(&ends);
        r.on_end(move || ends.set(ends.get() + 1));
    }
    {
        let closes = Rc::clone(&closes);
        r.on_close(move || closes.set(closes.get() + 1));
    }
    assert!(seen.borrow().is_empty(), "流动投递从下一拍开始");

    sched.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    assert_eq!(ends.get(), 1);
    assert_eq!(closes.get(), 1, "自动销毁在 end 之后静默关闭");
    assert!(r.error().is_none());
    assert_eq!(r.mode(), ReadableMode::Destroyed);
}

#[test]
fn end_is_not_emitted_until_the_buffer_is_consumed() {
    let sched = Scheduler::new();
    let r: Readable<u32> = Readable::new(&sched, ReadableOptions::default(), Silent);
    let ended = Rc::new(Cell::new(false));
    {
        let ended = Rc::clone(&ended);
        r.on_end(move || ended.set(true));
    }
    r.push(5);
    r.push_eof();
    sched.run_until_idle().unwrap();
    assert!(!ended.get(), "缓冲未被消费时不能发出 end");

    assert_eq!(r.read(None), ReadOutcome::Data(5));
    sched.run_until_idle().unwrap();
    assert!(ended.get());
    assert_eq!(r.read(None), ReadOutcome::Destroyed);
}

#[test]
fn pause_buffers_and_resume_delivers_later() {
    let sched = Scheduler::new();
    let r: Readable<u32> = Readable::new(&sched, ReadableOptions::default(), Silent);
    let seen = log();
    {
        let seen = Rc::clone(&seen);
        r.on_data(move |x| seen.borrow_mut().push(x));
    }
    sched.run_until_idle().unwrap();

    r.push(1);
    assert_eq!(*seen.borrow(), vec![1], "流动且缓冲为空时直接投递");

    r.pause();
    assert!(r.is_paused());
    r.push(2);
    sched.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), vec![1]);
    assert_eq!(r.buffered_len(), 1);

    r.resume();
    assert_eq!(*seen.borrow(), vec![1], "恢复同样推迟到下一拍");
    sched.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), vec![1, 2]);
    assert_eq!(r.buffered_len(), 0);
}

#[test]
fn readable_listener_pulls_everything_that_was_pushed() {
    let sched = Scheduler::new();
    let r: Readable<u32> = Readable::new(&sched, ReadableOptions::default(), Silent);
    let seen = log();
    {
        let seen = Rc::clone(&seen);
        let reader = r.clone();
        r.on_readable(move || {
            while let ReadOutcome::Data(x) = reader.read(None) {
                seen.borrow_mut().push(x);
            }
        });
    }
    r.push(1);
    r.push(2);
    assert!(seen.borrow().is_empty(), "readable 通知在下一拍发出");
    sched.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), vec![1, 2]);
    assert!(!r.is_flowing());
}

#[test]
fn pulling_from_a_flowing_stream_is_a_protocol_error() {
    let sched = Scheduler::new();
    let r: Readable<u32> = Readable::new(&sched, ReadableOptions::default(), Silent);
    r.on_data(|_| {});
    sched.run_until_idle().unwrap();
    r.push(1);

    let errors = log();
    {
        let errors = Rc::clone(&errors);
        r.on_error(move |err: &StreamError| errors.borrow_mut().push(err.clone()));
    }
    assert_eq!(r.read(None), ReadOutcome::Destroyed);
    sched.run_until_idle().unwrap();

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].protocol_violation(),
        Some(&ProtocolViolation::ConsumptionModeConflict {
            active: "flowing",
            requested: "pull",
        })
    );
}

#[test]
fn destroy_is_idempotent_and_reports_the_first_error_once() {
    let sched = Scheduler::new();
    let source = ScriptedSource::new(vec![1u32, 2, 3]);
    let (_fills, destroyed) = source.counters();
    let r = Readable::new(&sched, ReadableOptions::default(), source);
    let errors = log();
    let closes = Rc::new(Cell::new(0));
    {
        let errors = Rc::clone(&errors);
        r.on_error(move |err: &StreamError| errors.borrow_mut().push(err.clone()));
    }
    {
        let closes = Rc::clone(&closes);
        r.on_close(move || closes.set(closes.get() + 1));
    }

    r.destroy(Some(StreamError::producer("disk gone")));
    r.destroy(Some(StreamError::producer("second failure")));
    r.destroy(None);
    assert!(r.is_destroyed());
    assert!(errors.borrow().is_empty(), "error 与 close 在下一拍发出");

    sched.run_until_idle().unwrap();
    assert_eq!(*errors.borrow(), vec![StreamError::producer("disk gone")]);
    assert_eq!(closes.get(), 1);
    assert_eq!(destroyed.get(), 1, "数据源的销毁钩子只执行一次");
    assert!(!r.push(4), "销毁后 push 为空操作");
}

#[test]
fn destroy_without_reason_before_end_is_a_cancellation() {
    let sched = Scheduler::new();
    let r: Readable<u32> = Readable::new(&sched, ReadableOptions::default(), Silent);
    let cancelled = Rc::new(Cell::new(false));
    {
        let cancelled = Rc::clone(&cancelled);
        r.on_error(move |err: &StreamError| cancelled.set(err.is_cancelled()));
    }
    r.destroy(None);
    sched.run_until_idle().unwrap();
    assert!(cancelled.get());
}

#[test]
fn scripted_source_is_asked_for_one_chunk_per_fill() {
    let sched = Scheduler::new();
    let source = ScriptedSource::new(vec!['a', 'b', 'c']);
    let (fills, _destroyed) = source.counters();
    let r = Readable::new(&sched, ReadableOptions::default(), source);
    let seen = log();
    {
        let seen = Rc::clone(&seen);
        r.on_data(move |c| seen.borrow_mut().push(c));
    }
    sched.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), vec!['a', 'b', 'c']);
    assert!(fills.get() >= 4, "三块数据加一次结束标记至少需要四次填充");
    assert!(r.is_ended());
}

#[test]
fn async_iteration_yields_every_chunk_then_finishes() {
    let sched = Scheduler::new();
    let scripted = ScriptedSource::new(vec![1u32, 2, 3, 4]);
    let r = Readable::new(&sched, ReadableOptions::default(), scripted);
    let mut items = r.iter();
    let mut seen = Vec::new();
    loop {
        match items.next().now_or_never() {
            Some(Some(item)) => seen.push(item.expect("数据源未出错")),
            Some(None) => break,
            None => assert!(sched.run_until_idle().unwrap() > 0, "挂起时必须有待派发的通知"),
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);
    sched.run_until_idle().unwrap();
    assert!(r.is_ended(), "end 事件在下一拍派发");
}

#[test]
fn dropping_the_iterator_early_destroys_the_stream() {
    let sched = Scheduler::new();
    let scripted = ScriptedSource::new(1u32..=100);
    let (_fills, destroyed) = scripted.counters();
    let r = Readable::new(&sched, ReadableOptions::default(), scripted);
    {
        let mut items = r.iter();
        let first = loop {
            if let Some(item) = items.next().now_or_never() {
                break item;
            }
            sched.run_until_idle().unwrap();
        };
        assert_eq!(first, Some(Ok(1)));
    }
    assert!(r.is_destroyed());
    assert!(r.error().is_some_and(|err| err.is_cancelled()), "提前退出视为取消");
    assert_eq!(destroyed.get(), 1);
}

/// 打开过程由测试控制的数据源：`construct` 只保存推送句柄。
struct DeferredOpen {
    opening: Rc<RefCell<Option<SourceContext<u32>>>>,
    items: VecDeque<u32>,
    fills: Rc<Cell<usize>>,
}

impl Source<u32> for DeferredOpen {
    fn construct(&mut self, ctx: &SourceContext<u32>) {
        *self.opening.borrow_mut() = Some(ctx.clone());
    }

    fn fill(&mut self, ctx: &SourceContext<u32>, _size_hint: usize) {
        self.fills.set(self.fills.get() + 1);
        match self.items.pop_front() {
            Some(item) => {
                ctx.push(item);
            }
            None => {
                ctx.push_eof();
            }
        }
    }
}

fn deferred_open(
    sched: &Scheduler,
    items: Vec<u32>,
) -> (Readable<u32>, Rc<RefCell<Option<SourceContext<u32>>>>, Rc<Cell<usize>>) {
    let opening = Rc::new(RefCell::new(None));
    let fills = Rc::new(Cell::new(0));
    let r = Readable::new(
        sched,
        ReadableOptions::default(),
        DeferredOpen {
            opening: Rc::clone(&opening),
            items: items.into(),
            fills: Rc::clone(&fills),
        },
    );
    (r, opening, fills)
}

#[test]
fn fill_is_held_back_until_the_source_is_constructed() {
    let sched = Scheduler::new();
    let (r, opening, fills) = deferred_open(&sched, vec![1, 2, 3]);
    let seen = log();
    {
        let seen = Rc::clone(&seen);
        r.on_data(move |x| seen.borrow_mut().push(x));
    }
    sched.run_until_idle().unwrap();
    assert_eq!(fills.get(), 0, "构造完成之前不调用 fill");
    assert!(seen.borrow().is_empty());

    let ctx = opening.borrow_mut().take().expect("construct 已被调用");
    ctx.constructed();
    sched.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    assert!(r.is_ended());
}

#[test]
fn failed_construction_destroys_the_stream() {
    let sched = Scheduler::new();
    let (r, opening, fills) = deferred_open(&sched, vec![1]);
    let ctx = opening.borrow_mut().take().expect("construct 已被调用");
    ctx.fail(StreamError::producer("no such file"));
    sched.run_until_idle().unwrap();
    assert_eq!(r.error(), Some(StreamError::producer("no such file")));
    assert_eq!(r.read(None), ReadOutcome::Destroyed);
    assert_eq!(fills.get(), 0);
}
