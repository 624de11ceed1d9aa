//! 有序块队列（Chunk Queue）。
//!
//! # 契约说明（What）
//! - 先进先出，永不重排；只能从队头出队（`push_front` 仅用于回退已读数据）；
//! - `len()` 始终等于队内每块计量大小之和；
//! - 字节模式下的部分出队在队头块的字节边界处切分，对象模式下每次出队恰好一块。
//!
//! # 执行逻辑（How）
//! - 每个条目缓存入队时的计量大小，切分后按剩余部分重新计量，保证合计值精确；
//! - 不可切分的块（`split_to` 返回 `None`）在尚未取到任何数据时整块交付，否则留在队头。

use crate::chunk::{Chunk, measure};
use std::collections::VecDeque;

#[derive(Debug)]
struct Entry<T> {
    chunk: T,
    size: usize,
}

/// 计量型 FIFO 队列。
#[derive(Debug)]
pub struct ChunkQueue<T> {
    entries: VecDeque<Entry<T>>,
    total: usize,
    object_mode: bool,
}

impl<T: Chunk> ChunkQueue<T> {
    /// 创建队列；`object_mode` 已与块类型的对象属性合并。
    pub fn new(object_mode: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            total: 0,
            object_mode,
        }
    }

    pub fn object_mode(&self) -> bool {
        self.object_mode
    }

    /// 计量总大小。
    pub fn len(&self) -> usize {
        self.total
    }

    /// 队内块数。
    pub fn chunk_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按当前模式计量一个块。
    pub fn measure(&self, chunk: &T) -> usize {
        measure(chunk, self.object_mode)
    }

    /// 队头块的计量大小。
    pub fn front_size(&self) -> Option<usize> {
        self.entries.front().map(|entry| entry.size)
    }

    /// 追加到队尾，返回该块的计量大小。
    pub fn push_back(&mut self, chunk: T) -> usize {
        let size = self.measure(&chunk);
        self.total += size;
        self.entries.push_back(Entry { chunk, size });
        size
    }

    /// 放回队头。
    pub fn push_front(&mut self, chunk: T) -> usize {
        let size = self.measure(&chunk);
        self.total += size;
        self.entries.push_front(Entry { chunk, size });
        size
    }

    /// 弹出整块。
    pub fn pop_front(&mut self) -> Option<T> {
        let entry = self.entries.pop_front()?;
        self.total -= entry.size;
        Some(entry.chunk)
    }

    /// 出队至多 `n` 个计量单位。
    ///
    /// # 契约说明（What）
    /// - `n == 0` 或队列为空时返回 `None`；
    /// - 对象模式下只取一块；
    /// - 字节模式下跨块读取时调用 [`Chunk::concat`] 合并，队头块按需切分。
    pub fn take(&mut self, n: usize) -> Option<T> {
        if n == 0 || self.entries.is_empty() {
            return None;
        }
        if self.object_mode {
            return self.pop_front();
        }

        let mut parts: Vec<T> = Vec::new();
        let mut taken = 0;
        while taken < n {
            let remaining = n - taken;
            let Some(front) = self.entries.front_mut() else {
                break;
            };
            if front.size <= remaining {
                if let Some(entry) = self.entries.pop_front() {
                    taken += entry.size;
                    parts.push(entry.chunk);
                }
                continue;
            }
            match front.chunk.split_to(remaining) {
                Some(head) => {
                    let head_size = measure(&head, false);
                    front.size = measure(&front.chunk, false);
                    taken += head_size;
                    parts.push(head);
                }
                None if parts.is_empty() => {
                    if let Some(entry) = self.entries.pop_front() {
                        taken += entry.size;
                        parts.push(entry.chunk);
                    }
                }
                None => {}
            }
            break;
        }
        self.total -= taken;

        let mut parts = parts.into_iter();
        let first = parts.next()?;
        let rest: Vec<T> = parts.collect();
        if rest.is_empty() {
            Some(first)
        } else {
            Some(T::concat(first, rest))
        }
    }

    /// 丢弃全部数据，返回被丢弃的计量大小。
    pub fn clear(&mut self) -> usize {
        let dropped = self.total;
        self.entries.clear();
        self.total = 0;
        dropped
    }

    /// 按出队顺序遍历队内块。
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.iter().map(|entry| &entry.chunk)
    }
}
