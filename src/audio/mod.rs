//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: 按帧寻址的环形缓冲区（可在两端共享）
//! - Format: 样本格式和编解码
//! - Timing: 单调时钟和帧/时间换算
//! - Stats: 端点统计和状态报告

pub mod format;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use format::{SampleFormat, StreamFormat};
pub use ring_buffer::FrameRing;
pub use stats::{EndpointReport, EndpointStats, SessionReport};
