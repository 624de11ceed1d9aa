use crate::ids::ListenerId;
use std::rc::Rc;

/// 监听器登记表。
///
/// # 执行逻辑（How）
/// - 监听器以 `Rc<F>` 保存，派发前先 [`snapshot`](Self::snapshot) 复制一份列表并释放引擎借用，
///   因此回调内部可以再次注册、注销或驱动同一个流；
/// - 派发期间新注册的监听器不会收到本次事件。
pub(crate) struct Listeners<F: ?Sized> {
    entries: Vec<(ListenerId, Rc<F>)>,
}

impl<F: ?Sized> Listeners<F> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, listener: Rc<F>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        before != self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Rc<F>> {
        self.entries.iter().map(|(_, l)| Rc::clone(l)).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
