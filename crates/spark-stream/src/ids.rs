//! 引擎内部使用的标识符新类型。
//!
//! # 设计动机（Why）
//! - 双工两半、管道与流水线之间只通过 `StreamId` 与弱引用互相指认，避免强引用环；
//! - 日志字段 `stream.id` 直接复用这里的 `Display` 输出，排障时可跨阶段串联。
//!
//! # 集成方式（How）
//! - 标识由进程级原子计数器分配，单调递增且永不复用；
//! - 构造函数均为 crate 内部可见，调用方只能读取与比较。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STREAM: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);
static NEXT_PIPE: AtomicU64 = AtomicU64::new(1);
static NEXT_PIPELINE: AtomicU64 = AtomicU64::new(1);

/// 流实例标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn next() -> Self {
        Self(NEXT_STREAM.fetch_add(1, Ordering::Relaxed))
    }

    /// 返回原始数值。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// 监听器注册凭据，用于 `off` 注销。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

/// 管道标识，源端据此记录“哪些管道正在等待 drain”。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl PipeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PIPE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe-{}", self.0)
    }
}

/// 流水线标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(u64);

impl PipelineId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PIPELINE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline-{}", self.0)
    }
}
