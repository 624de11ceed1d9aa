//! Pipeline 的端到端行为：成功完成、任一阶段失败时全链拆除且只报告一次错误。

mod support;

use futures::FutureExt;
use spark_stream::{
    DuplexOptions, Pipeline, PipelineState, Readable, ReadableOptions, Scheduler, StreamError,
    Transform, TransformOutput, Transformer, Writable, WritableOptions,
};
use std::cell::Cell;
use std::rc::Rc;
use support::{RecordingSink, ScriptedSource, TokenHolder, init_tracing, log};

/// 记录销毁次数的翻倍转换。
struct Doubler {
    destroyed: Rc<Cell<usize>>,
}

impl Transformer<u32, u32> for Doubler {
    fn transform(&mut self, chunk: u32, out: TransformOutput<u32>) {
        out.push(chunk * 2);
        out.finish();
    }

    fn destroy(&mut self, _err: Option<&StreamError>) {
        self.destroyed.set(self.destroyed.get() + 1);
    }
}

#[test]
fn failing_sink_tears_down_every_stage_and_reports_once() {
    init_tracing();
    let sched = Scheduler::new();

    let scripted = ScriptedSource::new(vec![1u32, 2, 3, 4]);
    let (_fills, source_destroyed) = scripted.counters();
    let source = Readable::new(&sched, ReadableOptions::default(), scripted);

    let transform_destroyed = Rc::new(Cell::new(0));
    let doubler = Transform::new(
        &sched,
        DuplexOptions::default(),
        Doubler {
            destroyed: Rc::clone(&transform_destroyed),
        },
    );

    let recording = RecordingSink::new().failing_on(2, StreamError::consumer("refused"));
    let (delivered, sink_destroyed) = recording.counters();
    let sink = Writable::new(&sched, WritableOptions::default(), recording);

    let pipeline = Pipeline::builder(&source).through(&doubler).to(&sink);
    let outcomes = log();
    {
        let outcomes = Rc::clone(&outcomes);
        pipeline.on_complete(move |result| outcomes.borrow_mut().push(result));
    }
    sched.run_until_idle().unwrap();

    assert_eq!(*outcomes.borrow(), vec![Err(StreamError::consumer("refused"))]);
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(*delivered.borrow(), vec![2], "只有第一块被汇端接受");
    assert_eq!(source_destroyed.get(), 1);
    assert_eq!(transform_destroyed.get(), 1);
    assert_eq!(sink_destroyed.get(), 1);
    assert!(source.is_destroyed());
    assert!(doubler.is_destroyed());
    assert!(sink.is_destroyed());
}

#[test]
fn completion_future_resolves_after_the_sink_finishes() {
    let sched = Scheduler::new();
    let source = Readable::from_items(&sched, ReadableOptions::default(), 1u32..=5);
    let doubler = Transform::map(&sched, DuplexOptions::default(), |x: u32| x * 2);
    let recording = RecordingSink::new();
    let (delivered, _) = recording.counters();
    let sink = Writable::new(&sched, WritableOptions::default(), recording);

    let pipeline = Pipeline::builder(&source).through(&doubler).to(&sink);
    let mut completion = pipeline.completion();
    assert!((&mut completion).now_or_never().is_none(), "调度器未驱动之前不会完成");

    sched.run_until_idle().unwrap();
    assert_eq!(futures::executor::block_on(completion), Ok(()));
    assert_eq!(*delivered.borrow(), vec![2, 4, 6, 8, 10]);
    assert_eq!(pipeline.outcome(), Some(Ok(())));
    assert!(doubler.error().is_none(), "成功路径上的拆除是静默的");
}

#[test]
fn late_completion_listener_receives_the_recorded_outcome() {
    let sched = Scheduler::new();
    let source = Readable::from_items(&sched, ReadableOptions::default(), vec![1u32]);
    let sink: Writable<u32> =
        Writable::new(&sched, WritableOptions::default(), RecordingSink::new());
    let pipeline = Pipeline::builder(&source).to(&sink);
    sched.run_until_idle().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Succeeded);

    let late = log();
    {
        let late = Rc::clone(&late);
        pipeline.on_complete(move |result| late.borrow_mut().push(result));
    }
    assert!(late.borrow().is_empty(), "补发同样推迟到下一拍");
    sched.run_until_idle().unwrap();
    assert_eq!(*late.borrow(), vec![Ok(())]);
}

#[test]
fn external_cancellation_fails_with_the_given_reason() {
    let sched = Scheduler::new();
    let scripted = ScriptedSource::new(1u32..=1_000);
    let (_fills, source_destroyed) = scripted.counters();
    let source = Readable::new(&sched, ReadableOptions::default(), scripted);
    let (sink, _acks) = support::manual_sink::<u32>();
    let sink = Writable::new(&sched, WritableOptions::default(), sink);
    let pipeline = Pipeline::builder(&source).to(&sink);
    sched.run_until_idle().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.destroy(Some(StreamError::cancelled()));
    sched.run_until_idle().unwrap();
    let outcome = pipeline.outcome().expect("终态已派发");
    assert!(outcome.unwrap_err().is_cancelled());
    assert_eq!(source_destroyed.get(), 1);
    assert!(sink.is_destroyed());
}

#[test]
fn running_pipeline_does_not_keep_dropped_stages_alive() {
    let sched = Scheduler::new();
    let source_token = Rc::new(());
    let sink_token = Rc::new(());
    let source: Readable<u32> = Readable::new(
        &sched,
        ReadableOptions::default(),
        TokenHolder::new(&source_token),
    );
    let relay = Transform::pass_through(&sched, DuplexOptions::default());
    let sink: Writable<u32> =
        Writable::new(&sched, WritableOptions::default(), TokenHolder::new(&sink_token));
    let pipeline = Pipeline::builder(&source).through(&relay).to(&sink);
    source.push(1);
    sched.run_until_idle().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);

    drop((source, relay, sink));
    assert_eq!(Rc::strong_count(&source_token), 1);
    assert_eq!(Rc::strong_count(&sink_token), 1);

    // 阶段已不存在：外部取消仍然给出终态，只是无事可拆。
    pipeline.destroy(None);
    sched.run_until_idle().unwrap();
    assert!(pipeline.outcome().expect("终态已派发").unwrap_err().is_cancelled());
}
