//! 以 `futures::Stream` 形式逐块消费 Readable。
//!
//! # 设计背景（Why）
//! - 拉取模式需要调用方自己响应 readable 通知并循环 `read`；异步代码更习惯
//!   `while let Some(item) = stream.next().await` 的写法；
//! - 迭代器提前结束（被丢弃）时，读端通常不再有消费方，默认随之销毁，避免数据源悬挂。
//!
//! # 执行逻辑（How）
//! 1. 构造时注册 readable / end / error / close 监听，它们只负责唤醒最近一次 `poll` 留下的 waker；
//! 2. `poll_next` 调用 `read(None)`：有数据即产出；`Pending` 时保存 waker 等待下一次通知；
//! 3. 结束产出 `None`；出错产出一次 `Err` 后结束；未结束就被关闭视为 `PrematureClose`。
//!
//! # 风险提示（Trade-offs）
//! - 唤醒来自调度器派发的事件，调用方仍需驱动 [`Scheduler`](crate::scheduler::Scheduler)；
//! - 注册 readable 监听会把读端切换到拉取模式，不能再与 `on_data` 流动消费混用。

use crate::chunk::Chunk;
use crate::config::IterOptions;
use crate::error::{ProtocolViolation, StreamError};
use crate::ids::ListenerId;
use crate::readable::{ReadOutcome, Readable};
use futures::Stream;
use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct WakeSlot {
    waker: RefCell<Option<Waker>>,
}

impl WakeSlot {
    fn register(&self, waker: &Waker) {
        let mut slot = self.waker.borrow_mut();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    fn wake(&self) {
        let waker = self.waker.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// [`Readable::iter`] 返回的异步迭代器。
#[must_use = "streams do nothing unless polled"]
pub struct ReadableIter<T: Chunk> {
    readable: Readable<T>,
    options: IterOptions,
    slot: Rc<WakeSlot>,
    listeners: Vec<ListenerId>,
    done: bool,
}

impl<T: Chunk> fmt::Debug for ReadableIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableIter")
            .field("stream", &self.readable.id())
            .field("done", &self.done)
            .finish()
    }
}

impl<T: Chunk> ReadableIter<T> {
    fn new(readable: &Readable<T>, options: IterOptions) -> Self {
        let slot = Rc::new(WakeSlot::default());
        let listeners = vec![
            {
                let slot = Rc::clone(&slot);
                readable.on_readable(move || slot.wake())
            },
            {
                let slot = Rc::clone(&slot);
                readable.on_end(move || slot.wake())
            },
            {
                let slot = Rc::clone(&slot);
                readable.on_error(move |_err| slot.wake())
            },
            {
                let slot = Rc::clone(&slot);
                readable.on_close(move || slot.wake())
            },
        ];
        tracing::trace!(
            stream.id = %readable.id(),
            stream.kind = "readable",
            destroy_on_return = options.destroy_on_return,
            "async iterator attached"
        );
        Self {
            readable: readable.clone(),
            options,
            slot,
            listeners,
            done: false,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        for id in self.listeners.drain(..) {
            self.readable.off(id);
        }
    }

    /// 已销毁的读端给出的最后一项。
    fn terminal_item(&self) -> Option<Result<T, StreamError>> {
        match self.readable.error() {
            Some(err) => Some(Err(err)),
            None if self.readable.is_ended() => None,
            None => Some(Err(StreamError::protocol(ProtocolViolation::PrematureClose))),
        }
    }
}

impl<T: Chunk> Stream for ReadableIter<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.readable.read(None) {
            ReadOutcome::Data(chunk) => Poll::Ready(Some(Ok(chunk))),
            ReadOutcome::End => {
                self.finish();
                Poll::Ready(None)
            }
            ReadOutcome::Destroyed => {
                let item = self.terminal_item();
                self.finish();
                Poll::Ready(item)
            }
            ReadOutcome::Pending => {
                self.slot.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T: Chunk> Drop for ReadableIter<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.finish();
        if self.options.destroy_on_return && !self.readable.is_destroyed() {
            tracing::debug!(
                stream.id = %self.readable.id(),
                stream.kind = "readable",
                "async iterator dropped early, destroying stream"
            );
            self.readable.destroy(None);
        }
    }
}

impl<T: Chunk> Readable<T> {
    /// 以异步迭代器消费本流；迭代器提前丢弃时销毁读端。
    pub fn iter(&self) -> ReadableIter<T> {
        ReadableIter::new(self, IterOptions::default())
    }

    pub fn iter_with(&self, options: IterOptions) -> ReadableIter<T> {
        ReadableIter::new(self, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadableOptions;
    use crate::readable::{FnSource, SourceContext};
    use crate::scheduler::Scheduler;
    use futures::{FutureExt, StreamExt};

    fn idle_source(sched: &Scheduler) -> Readable<u32> {
        Readable::new(
            sched,
            ReadableOptions::default(),
            FnSource::new(|_ctx: &SourceContext<u32>, _hint: usize| {}),
        )
    }

    #[test]
    fn pending_poll_is_woken_by_a_later_push() {
        let sched = Scheduler::new();
        let r = idle_source(&sched);
        let mut items = r.iter();
        assert!(items.next().now_or_never().is_none(), "缓冲为空时应挂起");

        r.push(5);
        sched.run_until_idle().unwrap();
        assert_eq!(items.next().now_or_never(), Some(Some(Ok(5))));
    }

    #[test]
    fn retained_stream_survives_an_early_drop() {
        let sched = Scheduler::new();
        let r = idle_source(&sched);
        r.push(1);
        r.push(2);
        {
            let mut items = r.iter_with(IterOptions {
                destroy_on_return: false,
            });
            assert_eq!(items.next().now_or_never(), Some(Some(Ok(1))));
        }
        sched.run_until_idle().unwrap();
        assert!(!r.is_destroyed(), "关闭 destroy_on_return 后读端保持可用");
        assert_eq!(r.read(None).into_data(), Some(2));
    }

    #[test]
    fn stream_error_is_yielded_once_then_iteration_ends() {
        let sched = Scheduler::new();
        let r = idle_source(&sched);
        let mut items = r.iter();
        sched.run_until_idle().unwrap();
        r.destroy(Some(StreamError::producer("socket reset")));
        assert_eq!(
            items.next().now_or_never(),
            Some(Some(Err(StreamError::producer("socket reset"))))
        );
        assert_eq!(items.next().now_or_never(), Some(None), "错误之后迭代结束");
    }
}
