//! 回环引擎
//!
//! 整合设备、缓冲、同步各模块：
//! - `endpoint`: 单个采集/播放端点（打开、协商、非阻塞读写）
//! - `sync`: pitch 调整、延迟累计、简单模式插帧/丢帧
//! - `bridge`: 两端格式不同时的转换与重采样
//! - `session`: 一对端点组成的回环会话，含 xrun 恢复
//! - `pump`: 线程组的 poll 循环
//! - `runtime`: 跨线程共享的运行时上下文
//!
//! 每个会话只在所属线程组内访问，无需加锁。

pub mod bridge;
pub mod endpoint;
pub mod pump;
pub mod runtime;
pub mod session;
pub mod sync;

pub use endpoint::{EndpointState, StreamEndpoint};
pub use pump::ThreadGroup;
pub use runtime::{RuntimeContext, Waker};
pub use session::{LoopbackSession, SessionState, XrunSyncOutcome};

use crate::device::DeviceError;
use crate::resample::ResamplerError;

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot open '{device}': {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: DeviceError,
    },

    #[error("parameter negotiation failed on '{device}': {reason}")]
    ParamNegotiation { device: String, reason: String },

    #[error("xrun on '{device}'")]
    Xrun { device: String },

    #[error("'{device}' suspended")]
    Suspended { device: String },

    #[error("resampler error: {0}")]
    Resampler(#[from] ResamplerError),

    #[error("control element '{element}': {source}")]
    ControlIo {
        element: String,
        #[source]
        source: DeviceError,
    },

    #[error("out of memory: {0}")]
    ResourceExhaustion(String),

    #[error("'{device}': {source}")]
    Device {
        device: String,
        #[source]
        source: DeviceError,
    },
}

impl EngineError {
    /// 将设备错误归类到引擎错误
    pub fn from_device(device: &str, source: DeviceError) -> Self {
        match source {
            DeviceError::Xrun => Self::Xrun {
                device: device.to_string(),
            },
            DeviceError::Suspended => Self::Suspended {
                device: device.to_string(),
            },
            source => Self::Device {
                device: device.to_string(),
                source,
            },
        }
    }
}
