//! 生命周期记录：销毁、错误通道与 close 事件。
//!
//! # 设计背景（Why）
//! - Duplex 的两半必须“一损俱损”：任何一侧销毁都要同步拆除另一侧，并且错误只投递一次；
//! - 两半如果互相持有强引用会形成环，因此共享同一份 [`Lifecycle`]，其中只保存成员的弱引用。
//!
//! # 执行逻辑（How）
//! 1. `destroy(err)` 同步翻转状态并依次拆除成员（丢弃缓冲、取消挂起回调、调用协作者的销毁钩子）；
//! 2. 错误事件与 close 事件排入调度器下一拍，先 error 后 close，各自至多一次；
//! 3. 所有成员都完成（读端 end / 写端 finish）且开启 `auto_destroy` 时，以静默方式关闭，不产生错误。
//!
//! # 契约说明（What）
//! - 第一个错误胜出，之后的销毁请求都是空操作；
//! - 未给出原因的 `destroy(None)`：流尚未完成时按取消处理，已完成时静默关闭。

use crate::error::StreamError;
use crate::events::Listeners;
use crate::ids::{ListenerId, StreamId};
use crate::scheduler::Scheduler;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// 成员被销毁时执行的拆除动作。
pub(crate) trait Teardown {
    fn teardown(&self, err: Option<&StreamError>);
}

struct LifecycleState {
    members: Vec<Weak<dyn Teardown>>,
    completed: usize,
    destroyed: bool,
    error: Option<StreamError>,
    error_emitted: bool,
    close_emitted: bool,
    error_listeners: Listeners<dyn Fn(&StreamError)>,
    close_listeners: Listeners<dyn Fn()>,
}

pub(crate) struct Lifecycle {
    id: StreamId,
    kind: &'static str,
    sched: Scheduler,
    auto_destroy: bool,
    state: RefCell<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new(
        sched: &Scheduler,
        id: StreamId,
        kind: &'static str,
        auto_destroy: bool,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            kind,
            sched: sched.clone(),
            auto_destroy,
            state: RefCell::new(LifecycleState {
                members: Vec::new(),
                completed: 0,
                destroyed: false,
                error: None,
                error_emitted: false,
                close_emitted: false,
                error_listeners: Listeners::new(),
                close_listeners: Listeners::new(),
            }),
        })
    }

    pub(crate) fn attach(&self, member: Weak<dyn Teardown>) {
        self.state.borrow_mut().members.push(member);
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    pub(crate) fn error(&self) -> Option<StreamError> {
        self.state.borrow().error.clone()
    }

    fn all_completed(state: &LifecycleState) -> bool {
        !state.members.is_empty() && state.completed >= state.members.len()
    }

    /// 销毁整个流；返回本次调用是否真正执行了销毁。
    pub(crate) fn destroy(self: &Rc<Self>, err: Option<StreamError>) -> bool {
        let (members, effective) = {
            let mut state = self.state.borrow_mut();
            if state.destroyed {
                return false;
            }
            state.destroyed = true;
            let effective = match err {
                Some(err) => Some(err),
                None if Self::all_completed(&state) => None,
                None => Some(StreamError::cancelled()),
            };
            if state.error.is_none() {
                state.error = effective.clone();
            }
            (state.members.clone(), effective)
        };

        match &effective {
            Some(err) => tracing::debug!(
                stream.id = %self.id,
                stream.kind = self.kind,
                error.code = err.code(),
                "stream destroyed"
            ),
            None => tracing::trace!(stream.id = %self.id, stream.kind = self.kind, "stream closed"),
        }

        for member in members.iter().filter_map(Weak::upgrade) {
            member.teardown(effective.as_ref());
        }

        let this = Rc::clone(self);
        self.sched.defer(move || this.emit_terminal());
        true
    }

    /// 一个成员完成（读端 end 或写端 finish）。
    pub(crate) fn complete_member(self: &Rc<Self>) {
        let close = {
            let mut state = self.state.borrow_mut();
            state.completed += 1;
            Self::all_completed(&state) && !state.destroyed
        };
        if close && self.auto_destroy {
            self.destroy(None);
        }
    }

    fn emit_terminal(&self) {
        let (error, error_listeners, close_listeners) = {
            let mut state = self.state.borrow_mut();
            let error = if state.error_emitted {
                None
            } else {
                state.error.clone()
            };
            state.error_emitted = true;
            state.close_emitted = true;
            (
                error,
                state.error_listeners.snapshot(),
                state.close_listeners.snapshot(),
            )
        };
        if let Some(err) = error {
            if error_listeners.is_empty() {
                tracing::warn!(
                    stream.id = %self.id,
                    stream.kind = self.kind,
                    error = %err,
                    "stream error with no error listener"
                );
            }
            for listener in error_listeners {
                listener(&err);
            }
        }
        for listener in close_listeners {
            listener();
        }
    }

    pub(crate) fn on_error(&self, listener: Rc<dyn Fn(&StreamError)>) -> ListenerId {
        self.state.borrow_mut().error_listeners.add(listener)
    }

    /// 注册 close 监听；若 close 已发生，在下一拍补发一次。
    pub(crate) fn on_close(&self, listener: Rc<dyn Fn()>) -> ListenerId {
        let (id, late) = {
            let mut state = self.state.borrow_mut();
            (
                state.close_listeners.add(Rc::clone(&listener)),
                state.close_emitted,
            )
        };
        if late {
            self.sched.defer(move || listener());
        }
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut state = self.state.borrow_mut();
        state.error_listeners.remove(id) || state.close_listeners.remove(id)
    }
}
