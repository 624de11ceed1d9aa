#![deny(unsafe_code)]
#![doc = "spark-stream: 单线程协作式的流式背压引擎。"]
#![doc = ""]
#![doc = "提供 Readable / Writable / Duplex / Transform 四类引擎，以及连接它们的 Pipe 与 Pipeline 编排器。"]
#![doc = "所有“下一拍”语义都经由显式的 [`Scheduler`] 派发，调用方负责驱动 `run_until_idle`。"]

pub mod chunk;
pub mod config;
pub mod duplex;
pub mod error;
mod events;
pub mod finished;
pub mod ids;
pub mod iter;
mod lifecycle;
pub mod pipe;
pub mod pipeline;
pub mod queue;
pub mod readable;
pub mod scheduler;
pub mod transform;
pub mod writable;

pub use chunk::Chunk;
pub use config::{
    ConfigError, DuplexOptions, IterOptions, PipeOptions, ReadableOptions, SchedulerConfig,
    StreamConfig, WritableOptions,
};
pub use duplex::Duplex;
pub use error::{ProtocolViolation, Result, StreamError, StreamErrorKind};
pub use finished::{Finishable, finished};
pub use ids::{ListenerId, PipeId, PipelineId, StreamId};
pub use iter::ReadableIter;
pub use pipe::{Pipe, PipeState, pipe};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineCompletion, PipelineState};
pub use queue::ChunkQueue;
pub use readable::{
    FnSource, IterSource, ReadOutcome, Readable, ReadableMode, Source, SourceContext,
};
pub use scheduler::{Scheduler, SchedulerError};
pub use transform::{FnTransformer, PassThrough, Transform, TransformOutput, Transformer};
pub use writable::{FnSink, Sink, SinkAck, Writable, WritableMode, WriteCallback};

/// 常用类型一次性导入。
pub mod prelude {
    pub use crate::{
        Chunk, Duplex, DuplexOptions, Pipeline, ReadOutcome, Readable, ReadableOptions, Scheduler,
        Sink, SinkAck, Source, SourceContext, StreamError, Transform, TransformOutput, Transformer,
        Writable, WritableOptions, finished, pipe,
    };
}
