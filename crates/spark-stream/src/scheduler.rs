//! 单线程协作式调度器。
//!
//! # 设计背景（Why）
//! - 引擎的“下一拍”语义（resume 之后的投递、同步确认之后的续作、错误与 close 事件）
//!   需要一个显式、可测试的延迟点，而不是依赖某个异步运行时；
//! - 队列是普通的 FIFO：先 `defer` 的任务先执行，这也是写确认顺序与事件顺序的基础。
//!
//! # 契约说明（What）
//! - [`Scheduler`] 是 `Rc` 句柄，克隆后指向同一任务队列；
//! - 任务执行期间可以继续 `defer`，新任务排在队尾；
//! - [`Scheduler::run_until_idle`] 以 `max_turns` 为上限，超限视为活锁并返回错误。

use crate::config::SchedulerConfig;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

type Task = Box<dyn FnOnce()>;

/// 调度器运行失败。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("scheduler did not become idle within {limit} turns ({pending} tasks still queued)")]
    TurnLimitExceeded { limit: usize, pending: usize },
}

struct SchedulerInner {
    queue: RefCell<VecDeque<Task>>,
    executed: Cell<u64>,
    config: SchedulerConfig,
}

/// 延迟任务队列句柄。
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    /// 以默认配置创建调度器。
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                queue: RefCell::new(VecDeque::new()),
                executed: Cell::new(0),
                config,
            }),
        }
    }

    /// 把任务排到下一拍执行。
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(task));
    }

    /// 队列中等待执行的任务数。
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.queue.borrow().is_empty()
    }

    /// 累计执行过的任务数。
    pub fn executed(&self) -> u64 {
        self.inner.executed.get()
    }

    /// 执行一个任务；队列为空时返回 `false`。
    ///
    /// 任务在队列借用释放之后才执行，因此任务内部可以自由调用 [`defer`](Self::defer)。
    pub fn run_once(&self) -> bool {
        let task = self.inner.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                self.inner.executed.set(self.inner.executed.get() + 1);
                true
            }
            None => false,
        }
    }

    /// 反复执行直到队列为空，返回本次执行的任务数。
    pub fn run_until_idle(&self) -> Result<usize, SchedulerError> {
        let limit = self.inner.config.max_turns;
        let mut turns = 0;
        while self.run_once() {
            turns += 1;
            if turns >= limit && !self.is_idle() {
                let pending = self.pending();
                tracing::warn!(limit, pending, "scheduler turn limit exceeded");
                return Err(SchedulerError::TurnLimitExceeded { limit, pending });
            }
        }
        Ok(turns)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("executed", &self.executed())
            .finish()
    }
}
