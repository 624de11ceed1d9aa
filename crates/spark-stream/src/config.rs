//! 引擎配置。
//!
//! # 契约说明（What）
//! - 所有选项结构均可由 `serde` 反序列化，缺省字段取默认值（`#[serde(default)]`）；
//! - [`StreamConfig::from_toml_str`] 解析整份配置并执行 [`StreamConfig::validate`]；
//! - 高水位缺省时按模式取值：字节模式 16 KiB，对象模式 16 个对象。
//!
//! # 风险提示（Trade-offs）
//! - 选项结构保持公开字段以便在代码中直接构造，校验只在 TOML 入口与引擎构造时发生；
//!   引擎构造时遇到越界值会钳制到上限，而不是失败。

use serde::{Deserialize, Serialize};

/// 字节模式的默认高水位。
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;
/// 对象模式的默认高水位。
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;
/// 高水位上限（1 GiB）。
pub const MAX_HIGH_WATER_MARK: usize = 1 << 30;

/// 配置解析或校验失败。
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to parse stream configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

pub(crate) fn resolve_high_water_mark(requested: Option<usize>, object_mode: bool) -> usize {
    match requested {
        Some(hwm) => hwm.min(MAX_HIGH_WATER_MARK),
        None if object_mode => DEFAULT_OBJECT_HIGH_WATER_MARK,
        None => DEFAULT_HIGH_WATER_MARK,
    }
}

/// Readable 选项。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadableOptions {
    /// 缓冲上限；`None` 取模式默认值。
    pub high_water_mark: Option<usize>,
    /// 低于该值时向数据源请求填充；`None` 表示与高水位相同。
    pub low_water_mark: Option<usize>,
    pub object_mode: bool,
    /// 读端结束后自动销毁（静默 close）。
    pub auto_destroy: bool,
}

impl Default for ReadableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            low_water_mark: None,
            object_mode: false,
            auto_destroy: true,
        }
    }
}

impl ReadableOptions {
    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    pub fn low_water_mark(mut self, lwm: usize) -> Self {
        self.low_water_mark = Some(lwm);
        self
    }

    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_mark(self.high_water_mark, "readable.high_water_mark")?;
        if let (Some(low), Some(high)) = (self.low_water_mark, self.high_water_mark) {
            if low > high {
                return Err(ConfigError::Invalid {
                    field: "readable.low_water_mark",
                    reason: "must not exceed the high-water mark",
                });
            }
        }
        Ok(())
    }
}

/// Writable 选项。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WritableOptions {
    pub high_water_mark: Option<usize>,
    pub object_mode: bool,
    /// 写端完成后自动销毁（静默 close）。
    pub auto_destroy: bool,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            auto_destroy: true,
        }
    }
}

impl WritableOptions {
    pub fn high_water_mark(mut self, hwm: usize) -> Self {
        self.high_water_mark = Some(hwm);
        self
    }

    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.object_mode = enabled;
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_mark(self.high_water_mark, "writable.high_water_mark")
    }
}

/// Duplex / Transform 选项。
///
/// 两半各自的 `auto_destroy` 被忽略，由外层的 `auto_destroy` 统一决定。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DuplexOptions {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
    /// 为 `false` 时读端结束会自动结束写端。
    pub allow_half_open: bool,
    pub auto_destroy: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            readable: ReadableOptions::default(),
            writable: WritableOptions::default(),
            allow_half_open: true,
            auto_destroy: true,
        }
    }
}

impl DuplexOptions {
    /// 两半同时切换对象模式。
    pub fn object_mode(mut self, enabled: bool) -> Self {
        self.readable.object_mode = enabled;
        self.writable.object_mode = enabled;
        self
    }

    pub fn readable(mut self, options: ReadableOptions) -> Self {
        self.readable = options;
        self
    }

    pub fn writable(mut self, options: WritableOptions) -> Self {
        self.writable = options;
        self
    }

    pub fn allow_half_open(mut self, enabled: bool) -> Self {
        self.allow_half_open = enabled;
        self
    }

    pub fn auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }
}

/// 管道选项。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeOptions {
    /// 源端结束时是否结束汇端。
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

/// 异步迭代选项，见 [`Readable::iter_with`](crate::readable::Readable::iter_with)。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IterOptions {
    /// 迭代器在流结束前被丢弃时是否销毁读端。
    pub destroy_on_return: bool,
}

impl Default for IterOptions {
    fn default() -> Self {
        Self {
            destroy_on_return: true,
        }
    }
}

/// 调度器选项。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// `run_until_idle` 单次最多执行的任务数。
    pub max_turns: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_turns: 1_000_000,
        }
    }
}

/// 聚合配置，对应一份 TOML 文档。
///
/// ```toml
/// [readable]
/// high_water_mark = 65536
///
/// [duplex]
/// allow_half_open = false
///
/// [scheduler]
/// max_turns = 10000
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
    pub duplex: DuplexOptions,
    pub pipe: PipeOptions,
    pub iter: IterOptions,
    pub scheduler: SchedulerConfig,
}

impl StreamConfig {
    /// 解析并校验 TOML 配置。
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验跨字段约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.readable.validate()?;
        self.writable.validate()?;
        self.duplex.readable.validate()?;
        self.duplex.writable.validate()?;
        if self.scheduler.max_turns == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.max_turns",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }
}

fn check_mark(mark: Option<usize>, field: &'static str) -> Result<(), ConfigError> {
    match mark {
        Some(hwm) if hwm > MAX_HIGH_WATER_MARK => Err(ConfigError::Invalid {
            field,
            reason: "exceeds the 1 GiB ceiling",
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = StreamConfig::from_toml_str("").unwrap();
        assert_eq!(config, StreamConfig::default());
        assert!(config.pipe.end);
        assert!(config.iter.destroy_on_return);
        assert!(config.duplex.allow_half_open);
        assert_eq!(resolve_high_water_mark(None, false), DEFAULT_HIGH_WATER_MARK);
        assert_eq!(resolve_high_water_mark(None, true), DEFAULT_OBJECT_HIGH_WATER_MARK);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = StreamConfig::from_toml_str(
            r#"
            [readable]
            high_water_mark = 64
            object_mode = true

            [duplex]
            allow_half_open = false

            [pipe]
            end = false

            [iter]
            destroy_on_return = false
            "#,
        )
        .unwrap();
        assert_eq!(config.readable.high_water_mark, Some(64));
        assert!(config.readable.object_mode);
        assert!(config.readable.auto_destroy, "未出现的字段应取默认值");
        assert!(!config.duplex.allow_half_open);
        assert!(!config.pipe.end);
        assert!(!config.iter.destroy_on_return);
    }

    #[test]
    fn low_mark_above_high_mark_is_rejected() {
        let err = StreamConfig::from_toml_str(
            r#"
            [readable]
            high_water_mark = 8
            low_water_mark = 9
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "readable.low_water_mark",
                ..
            }
        ));
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        let err = StreamConfig::from_toml_str("[readable]\nhighwatermark = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "拼写错误的字段应在解析阶段被拒绝");
    }

    #[test]
    fn zero_turn_budget_is_rejected() {
        let err = StreamConfig::from_toml_str("[scheduler]\nmax_turns = 0\n").unwrap_err();
        assert!(err.to_string().contains("scheduler.max_turns"));
    }

    #[test]
    fn oversized_mark_is_clamped_when_resolved() {
        assert_eq!(resolve_high_water_mark(Some(usize::MAX), false), MAX_HIGH_WATER_MARK);
    }
}
