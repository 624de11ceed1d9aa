//! 完成观察器：一次性通知“这个流结束了”，结果为成功、错误或提前关闭。

use crate::chunk::Chunk;
use crate::duplex::Duplex;
use crate::error::{ProtocolViolation, StreamError};
use crate::readable::Readable;
use crate::transform::Transform;
use crate::writable::Writable;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// 完成结果的派发函数，只有第一次调用生效。
pub type Settle = Rc<dyn Fn(Result<(), StreamError>)>;

mod sealed {
    pub trait Sealed {}
}

/// 可以被 [`finished`] 观察的流。
///
/// - `Readable`：`end` 视为完成；
/// - `Writable`：`finish` 视为完成；
/// - `Duplex` / `Transform`：两半都完成才算完成。
pub trait Finishable: sealed::Sealed {
    #[doc(hidden)]
    fn watch_completion(&self, settle: Settle);
}

fn close_result(done: bool, err: Option<StreamError>) -> Result<(), StreamError> {
    match err {
        Some(err) => Err(err),
        None if done => Ok(()),
        None => Err(StreamError::protocol(ProtocolViolation::PrematureClose)),
    }
}

/// 已销毁的流不会再发出 error / close，结果在下一拍补发。
fn settle_late(sched: &crate::scheduler::Scheduler, settle: Settle, result: Result<(), StreamError>) {
    sched.defer(move || settle(result));
}

impl<T: Chunk> sealed::Sealed for Readable<T> {}

impl<T: Chunk> Finishable for Readable<T> {
    fn watch_completion(&self, settle: Settle) {
        if self.is_destroyed() {
            let result = close_result(self.is_ended(), self.error());
            settle_late(self.scheduler(), settle, result);
            return;
        }
        {
            let settle = Rc::clone(&settle);
            self.on_end(move || settle(Ok(())));
        }
        {
            let settle = Rc::clone(&settle);
            self.on_error(move |err| settle(Err(err.clone())));
        }
        let weak = self.downgrade();
        self.on_close(move || {
            let result = weak
                .upgrade()
                .map(|readable| close_result(readable.is_ended(), readable.error()))
                .unwrap_or_else(|| close_result(false, None));
            settle(result);
        });
    }
}

impl<T: Chunk> sealed::Sealed for Writable<T> {}

impl<T: Chunk> Finishable for Writable<T> {
    fn watch_completion(&self, settle: Settle) {
        if self.is_destroyed() {
            let result = close_result(self.is_finished(), self.error());
            settle_late(self.scheduler(), settle, result);
            return;
        }
        {
            let settle = Rc::clone(&settle);
            self.on_finish(move || settle(Ok(())));
        }
        {
            let settle = Rc::clone(&settle);
            self.on_error(move |err| settle(Err(err.clone())));
        }
        let weak = self.downgrade();
        self.on_close(move || {
            let result = weak
                .upgrade()
                .map(|writable| close_result(writable.is_finished(), writable.error()))
                .unwrap_or_else(|| close_result(false, None));
            settle(result);
        });
    }
}

impl<W: Chunk, R: Chunk> sealed::Sealed for Duplex<W, R> {}

impl<W: Chunk, R: Chunk> Finishable for Duplex<W, R> {
    fn watch_completion(&self, settle: Settle) {
        let (readable, writable) = (self.readable(), self.writable());
        let done = |r: &Readable<R>, w: &Writable<W>| r.is_ended() && w.is_finished();
        if self.is_destroyed() {
            let result = close_result(done(readable, writable), self.error());
            settle_late(readable.scheduler(), settle, result);
            return;
        }
        let remaining = Rc::new(Cell::new(2u8));
        let half_done = {
            let settle = Rc::clone(&settle);
            Rc::new(move || {
                remaining.set(remaining.get().saturating_sub(1));
                if remaining.get() == 0 {
                    settle(Ok(()));
                }
            })
        };
        {
            let half_done = Rc::clone(&half_done);
            readable.on_end(move || half_done());
        }
        writable.on_finish(move || half_done());
        {
            let settle = Rc::clone(&settle);
            self.on_error(move |err| settle(Err(err.clone())));
        }
        let (weak_r, weak_w) = (readable.downgrade(), writable.downgrade());
        self.on_close(move || {
            let completed = match (weak_r.upgrade(), weak_w.upgrade()) {
                (Some(r), Some(w)) => done(&r, &w),
                _ => false,
            };
            let err = weak_r.upgrade().and_then(|r| r.error());
            settle(close_result(completed, err));
        });
    }
}

impl<I: Chunk, O: Chunk> sealed::Sealed for Transform<I, O> {}

impl<I: Chunk, O: Chunk> Finishable for Transform<I, O> {
    fn watch_completion(&self, settle: Settle) {
        self.duplex().watch_completion(settle);
    }
}

/// 观察 `stream` 的完成，`callback` 恰好执行一次。
pub fn finished<S>(stream: &S, callback: impl FnOnce(Result<(), StreamError>) + 'static)
where
    S: Finishable + ?Sized,
{
    let slot: RefCell<Option<Box<dyn FnOnce(Result<(), StreamError>)>>> =
        RefCell::new(Some(Box::new(callback)));
    let settle: Settle = Rc::new(move |result| {
        let callback = slot.borrow_mut().take();
        if let Some(callback) = callback {
            callback(result);
        }
    });
    stream.watch_completion(settle);
}
