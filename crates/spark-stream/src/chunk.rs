//! 数据块抽象。
//!
//! # 契约说明（What）
//! - 引擎对块内容不透明，只关心两件事：计量大小与（字节模式下）在字节边界切分；
//! - `BYTES == false` 的类型永远按对象模式处理：每块计 1，出队时整块交付，不会切分也不会合并。
//!
//! # 设计背景（Why）
//! - 以关联常量区分字节块与对象块，让“对象类型没有字节长度”成为类型层面的事实，
//!   引擎无需在运行时猜测；
//! - 切分与合并都由块类型自己实现，`Bytes` 可以零拷贝切分，`String` 则保持 UTF-8 边界。

use bytes::{Bytes, BytesMut};
use std::rc::Rc;
use std::sync::Arc;

/// 可在引擎中流动的数据块。
pub trait Chunk: Clone + 'static {
    /// 是否按字节计量并允许切分。
    const BYTES: bool = false;

    /// 字节长度；对象块恒为 1。
    fn byte_len(&self) -> usize {
        1
    }

    /// 切出前 `at` 个字节并返回，`self` 保留剩余部分。
    ///
    /// 返回 `None` 表示该块不可在此处切分，引擎会整块交付。
    fn split_to(&mut self, at: usize) -> Option<Self> {
        let _ = at;
        None
    }

    /// 把按顺序出队的多个块合并为一个。
    ///
    /// 只会在字节模式下、一次读取跨越多个块时调用；对象块默认只保留第一个。
    fn concat(first: Self, rest: Vec<Self>) -> Self {
        let _ = rest;
        first
    }
}

/// 计算块在给定模式下的计量大小。
pub(crate) fn measure<T: Chunk>(chunk: &T, object_mode: bool) -> usize {
    if object_mode { 1 } else { chunk.byte_len() }
}

/// 类型层面的对象模式判定，与选项中的 `object_mode` 取并集。
pub(crate) fn object_mode_for<T: Chunk>(requested: bool) -> bool {
    requested || !T::BYTES
}

impl Chunk for Bytes {
    const BYTES: bool = true;

    fn byte_len(&self) -> usize {
        self.len()
    }

    fn split_to(&mut self, at: usize) -> Option<Self> {
        (at <= self.len()).then(|| Bytes::split_to(self, at))
    }

    fn concat(first: Self, rest: Vec<Self>) -> Self {
        let total = first.len() + rest.iter().map(Bytes::len).sum::<usize>();
        let mut buf = BytesMut::with_capacity(total);
        buf.extend_from_slice(&first);
        for part in &rest {
            buf.extend_from_slice(part);
        }
        buf.freeze()
    }
}

impl Chunk for Vec<u8> {
    const BYTES: bool = true;

    fn byte_len(&self) -> usize {
        self.len()
    }

    fn split_to(&mut self, at: usize) -> Option<Self> {
        if at > self.len() {
            return None;
        }
        let tail = self.split_off(at);
        Some(std::mem::replace(self, tail))
    }

    fn concat(mut first: Self, rest: Vec<Self>) -> Self {
        for part in rest {
            first.extend_from_slice(&part);
        }
        first
    }
}

impl Chunk for String {
    const BYTES: bool = true;

    fn byte_len(&self) -> usize {
        self.len()
    }

    /// 切分点落在多字节字符中间时向前退到最近的字符边界；退到 0 则不可切分。
    fn split_to(&mut self, at: usize) -> Option<Self> {
        let mut at = at.min(self.len());
        while at > 0 && !self.is_char_boundary(at) {
            at -= 1;
        }
        if at == 0 {
            return None;
        }
        let tail = self.split_off(at);
        Some(std::mem::replace(self, tail))
    }

    fn concat(mut first: Self, rest: Vec<Self>) -> Self {
        for part in rest {
            first.push_str(&part);
        }
        first
    }
}

macro_rules! object_chunk {
    ($($ty:ty),* $(,)?) => {
        $(impl Chunk for $ty {})*
    };
}

object_chunk!(
    bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, (),
    &'static str,
);

impl<T: ?Sized + 'static> Chunk for Rc<T> {}

impl<T: ?Sized + 'static> Chunk for Arc<T> {}

impl<T: Clone + 'static> Chunk for Option<T> {}
