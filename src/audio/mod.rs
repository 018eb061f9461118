//! 音频核心模块
//!
//! 包含：
//! - Format: 样本格式、流参数和 PCM 视图
//! - Ring Buffer: pacer 使用的 lock-free 字节环
//! - Timing: 帧数/时长换算和定速时钟
//! - Stats: 会话统计

pub mod format;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use format::{ByteOrder, PcmView, SampleFormat, StreamParams};
pub use ring_buffer::ByteRing;
pub use stats::{SessionStats, StatsReport};
