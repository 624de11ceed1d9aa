use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// 底层原因的共享形态：同一个错误会被投递到流水线中的每个阶段，因此原因必须可廉价克隆。
pub type ErrorCause = Arc<dyn StdError + Send + Sync + 'static>;

/// crate 统一的结果别名，默认错误类型为 [`StreamError`]。
pub type Result<T, E = StreamError> = core::result::Result<T, E>;

/// 稳定错误码表。
///
/// # 契约说明（What）
/// - 码值遵循 `stream.<语义>` 约定，协议违规统一落在 `stream.protocol.*` 命名空间；
/// - 码值一经发布不再修改，日志与告警规则可以直接按字符串匹配。
pub mod codes {
    /// 数据源（Source）主动上报的失败。
    pub const PRODUCER: &str = "stream.producer";
    /// 数据汇（Sink）确认写入失败，或确认句柄在未完成时被丢弃。
    pub const CONSUMER: &str = "stream.consumer";
    /// 显式销毁或上游取消导致的中止。
    pub const CANCELLED: &str = "stream.cancelled";
    /// 结束标记之后继续 `push`。
    pub const PUSH_AFTER_EOF: &str = "stream.protocol.push_after_eof";
    /// `end` 之后继续 `write`。
    pub const WRITE_AFTER_END: &str = "stream.protocol.write_after_end";
    /// 销毁之后继续 `write`。
    pub const WRITE_AFTER_DESTROY: &str = "stream.protocol.write_after_destroy";
    /// `end` 事件之后 `unshift`。
    pub const UNSHIFT_AFTER_END: &str = "stream.protocol.unshift_after_end";
    /// 已完成的写端再次 `end`。
    pub const ALREADY_FINISHED: &str = "stream.protocol.already_finished";
    /// 已销毁的写端调用 `end`。
    pub const END_AFTER_DESTROY: &str = "stream.protocol.end_after_destroy";
    /// 同一实例混用拉取与流动两种消费模式。
    pub const MODE_CONFLICT: &str = "stream.protocol.mode_conflict";
    /// `read(n)` 请求的高水位超过 1 GiB 上限。
    pub const HIGH_WATER_MARK_RANGE: &str = "stream.protocol.high_water_mark_range";
    /// 流在完成之前被关闭。
    pub const PREMATURE_CLOSE: &str = "stream.protocol.premature_close";
}

/// 错误分类，对应引擎的四类失败来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StreamErrorKind {
    /// 数据源失败。
    Producer,
    /// 数据汇失败。
    Consumer,
    /// 调用方违反了引擎协议。
    Protocol,
    /// 销毁或取消。
    Cancelled,
}

impl StreamErrorKind {
    /// 返回用于日志字段的稳定标签。
    pub const fn as_str(self) -> &'static str {
        match self {
            StreamErrorKind::Producer => "producer",
            StreamErrorKind::Consumer => "consumer",
            StreamErrorKind::Protocol => "protocol",
            StreamErrorKind::Cancelled => "cancelled",
        }
    }
}

/// 协议违规明细。
///
/// # 契约说明（What）
/// - 每个变体映射到 [`codes`] 中唯一的 `stream.protocol.*` 码值；
/// - 通过 [`StreamError::protocol`] 包装后作为根因保留，调用方可用
///   [`StreamError::protocol_violation`] 取回。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolViolation {
    #[error("push() after end-of-stream")]
    PushAfterEof,
    #[error("unshift() after the end event")]
    UnshiftAfterEnd,
    #[error("write() after end()")]
    WriteAfterEnd,
    #[error("write() after destroy()")]
    WriteAfterDestroy,
    #[error("end() called after the stream already finished")]
    AlreadyFinished,
    #[error("end() called after destroy()")]
    EndAfterDestroy,
    #[error("cannot consume in {requested} mode: data was already consumed in {active} mode")]
    ConsumptionModeConflict {
        active: &'static str,
        requested: &'static str,
    },
    #[error("requested read size {requested} exceeds the 1 GiB high-water mark ceiling")]
    HighWaterMarkOutOfRange { requested: usize },
    #[error("stream closed before it completed")]
    PrematureClose,
}

impl ProtocolViolation {
    /// 返回违规对应的稳定错误码。
    pub const fn code(&self) -> &'static str {
        match self {
            ProtocolViolation::PushAfterEof => codes::PUSH_AFTER_EOF,
            ProtocolViolation::UnshiftAfterEnd => codes::UNSHIFT_AFTER_END,
            ProtocolViolation::WriteAfterEnd => codes::WRITE_AFTER_END,
            ProtocolViolation::WriteAfterDestroy => codes::WRITE_AFTER_DESTROY,
            ProtocolViolation::AlreadyFinished => codes::ALREADY_FINISHED,
            ProtocolViolation::EndAfterDestroy => codes::END_AFTER_DESTROY,
            ProtocolViolation::ConsumptionModeConflict { .. } => codes::MODE_CONFLICT,
            ProtocolViolation::HighWaterMarkOutOfRange { .. } => codes::HIGH_WATER_MARK_RANGE,
            ProtocolViolation::PrematureClose => codes::PREMATURE_CLOSE,
        }
    }
}

/// `StreamError` 是引擎对外暴露的唯一错误形态。
///
/// # 设计背景（Why）
/// - 一个阶段的失败要原样送达管道与流水线中的所有阶段，错误必须 `Clone`；
///   因此底层原因以 [`ErrorCause`]（`Arc`）共享，而非独占的 `Box`。
/// - 错误码 `code` 为 `'static` 字符串，承载稳定语义；`message` 面向排障人员。
///
/// # 契约说明（What）
/// - `kind`：四类来源之一，决定告警归属；
/// - `code`：取自 [`codes`]，或遵循 `stream.<语义>` 约定的自定义码；
/// - `cause`：可选底层原因，经 [`std::error::Error::source`] 暴露。
///
/// # 风险提示（Trade-offs）
/// - 相等比较只看 `kind`/`code`/`message`，不比较原因链，便于测试断言。
#[derive(Clone, Debug)]
pub struct StreamError {
    kind: StreamErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

impl StreamError {
    /// 以显式分类与码值构造错误。
    pub fn new(
        kind: StreamErrorKind,
        code: &'static str,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 数据源失败。
    pub fn producer(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StreamErrorKind::Producer, codes::PRODUCER, message)
    }

    /// 数据汇失败。
    pub fn consumer(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StreamErrorKind::Consumer, codes::CONSUMER, message)
    }

    /// 销毁未给出原因时使用的取消错误。
    pub fn cancelled() -> Self {
        Self::new(
            StreamErrorKind::Cancelled,
            codes::CANCELLED,
            "stream was destroyed before completion",
        )
    }

    /// 协议违规，违规明细保留为根因。
    pub fn protocol(violation: ProtocolViolation) -> Self {
        let code = violation.code();
        let message = violation.to_string();
        Self::new(StreamErrorKind::Protocol, code, message).with_cause(violation)
    }

    /// 附加底层原因。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 附加已共享的底层原因。
    pub fn with_shared_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn kind(&self) -> StreamErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 是否为取消类错误。
    pub fn is_cancelled(&self) -> bool {
        self.kind == StreamErrorKind::Cancelled
    }

    /// 若错误源自协议违规，返回违规明细。
    pub fn protocol_violation(&self) -> Option<&ProtocolViolation> {
        self.cause
            .as_deref()
            .and_then(|cause| cause.downcast_ref::<ProtocolViolation>())
    }
}

impl PartialEq for StreamError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.code == other.code && self.message == other.message
    }
}

impl Eq for StreamError {}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for StreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<ProtocolViolation> for StreamError {
    fn from(violation: ProtocolViolation) -> Self {
        StreamError::protocol(violation)
    }
}
