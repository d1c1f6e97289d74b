//! 设备层接口
//!
//! 引擎只通过这里的 trait 访问声卡：
//! - `PcmDevice`: 单个采集或播放 PCM 流（非阻塞读写、参数协商、延迟查询）
//! - `ControlChannel`: 声卡控制接口（从设备通知、混音器元素读写）
//! - `DeviceFactory`: 打开上述两者
//!
//! 生产实现见 `alsa` 子模块；测试使用 `sim` 子模块中的模拟设备。

pub mod alsa;
#[cfg(test)]
pub mod sim;

use std::fmt;

use crate::audio::{SampleFormat, StreamFormat};

pub use self::alsa::AlsaFactory;

/// poll 描述符（与 libc 布局一致）
pub type PollFd = libc::pollfd;

/// 流方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Capture,
    Playback,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("Capture"),
            Self::Playback => f.write_str("Playback"),
        }
    }
}

/// 设备运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmState {
    Open,
    Setup,
    Prepared,
    Running,
    XRun,
    Draining,
    Paused,
    Suspended,
    Disconnected,
}

/// 硬件参数请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwRequest {
    pub format: StreamFormat,
    pub buffer_frames: usize,
    pub period_frames: usize,
}

/// 协商后的硬件参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParams {
    pub format: StreamFormat,
    pub buffer_frames: usize,
    pub period_frames: usize,
}

/// 软件参数请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwRequest {
    pub avail_min: usize,
    pub start_threshold: usize,
}

/// PCM 所在声卡位置（用于打开关联的控制接口）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub card: i32,
    pub device: u32,
    pub subdevice: u32,
}

/// 设备错误
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// 缓冲区 underrun/overrun（EPIPE）
    #[error("buffer xrun")]
    Xrun,
    /// 设备挂起（ESTRPIPE）
    #[error("device suspended")]
    Suspended,
    /// 暂时不可用，稍后重试（EAGAIN）
    #[error("resource temporarily unavailable")]
    Again,
    #[error("{op} failed: {}", std::io::Error::from_raw_os_error(*.errno))]
    Io { op: &'static str, errno: i32 },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Alsa(#[from] ::alsa::Error),
}

impl DeviceError {
    /// 按 errno 分类
    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        match errno {
            libc::EPIPE => Self::Xrun,
            libc::ESTRPIPE => Self::Suspended,
            libc::EAGAIN => Self::Again,
            _ => Self::Io { op, errno },
        }
    }
}

/// 单个 PCM 流
///
/// 所有读写调用都是非阻塞的：没有数据/空间时返回 0，
/// xrun 和挂起分别以 `DeviceError::Xrun` / `DeviceError::Suspended` 报告
pub trait PcmDevice {
    fn name(&self) -> &str;

    fn direction(&self) -> Direction;

    /// 声卡位置，虚拟设备（插件）返回 None
    fn card_info(&self) -> Option<CardInfo> {
        None
    }

    /// 安装硬件参数，返回设备实际接受的值
    fn negotiate_hw(&mut self, request: &HwRequest) -> Result<NegotiatedParams, DeviceError>;

    fn negotiate_sw(&mut self, request: &SwRequest) -> Result<(), DeviceError>;

    /// 可读（采集）或可写（播放）帧数
    fn avail(&mut self) -> Result<usize, DeviceError>;

    /// 设备内排队帧数
    fn delay(&mut self) -> Result<i64, DeviceError>;

    /// 读取交错帧到 `buf`，返回帧数
    fn read_frames(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// 写入交错帧，返回帧数
    fn write_frames(&mut self, buf: &[u8]) -> Result<usize, DeviceError>;

    fn prepare(&mut self) -> Result<(), DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    /// 立即停止并丢弃设备缓冲区内容
    fn drop_frames(&mut self) -> Result<(), DeviceError>;

    /// 从挂起中恢复；`DeviceError::Again` 表示需要重试
    fn resume(&mut self) -> Result<(), DeviceError>;

    fn state(&self) -> PcmState;

    /// 追加本设备的 poll 描述符，返回追加数量
    fn poll_descriptors(&self, fds: &mut Vec<PollFd>) -> Result<usize, DeviceError>;

    /// 解析本设备那部分 poll 结果
    fn revents(&self, fds: &[PollFd]) -> Result<i16, DeviceError>;

    /// 是否有硬件速率微调控制（Loopback 的 "PCM Rate Shift 100000"）
    fn has_rate_shift(&self) -> bool {
        false
    }

    fn set_rate_shift(&mut self, _pitch: f64) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("rate shift".to_string()))
    }
}

/// 从设备（Loopback 另一端）报告的流参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveParams {
    pub active: bool,
    pub format: Option<SampleFormat>,
    pub rate: u32,
    pub channels: u32,
}

/// 控制元素变化掩码
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeMask {
    pub value: bool,
    pub info: bool,
    pub add: bool,
    pub remove: bool,
}

/// 控制接口事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    pub element: String,
    pub mask: ChangeMask,
}

impl ControlEvent {
    /// 是否为从设备参数通知
    pub fn is_slave_notify(&self) -> bool {
        self.element.starts_with("PCM Slave") || self.element == "PCM Notify"
    }
}

/// 声卡控制接口
pub trait ControlChannel {
    fn poll_descriptors(&self, fds: &mut Vec<PollFd>) -> Result<usize, DeviceError>;

    /// 读取所有待处理事件（非阻塞）
    fn read_events(&mut self) -> Result<Vec<ControlEvent>, DeviceError>;

    /// 从设备当前参数；不是 Loopback 设备时返回 None
    fn slave_params(&mut self) -> Result<Option<SlaveParams>, DeviceError>;

    /// 读取整型混音器元素的全部通道值
    fn read_element(&mut self, name: &str) -> Result<Vec<i32>, DeviceError>;

    fn write_element(&mut self, name: &str, values: &[i32]) -> Result<(), DeviceError>;
}

/// 设备工厂
pub trait DeviceFactory {
    fn open_pcm(&self, name: &str, direction: Direction) -> Result<Box<dyn PcmDevice>, DeviceError>;

    /// 打开与 `pcm` 同一声卡的控制接口；没有可用控制接口时返回 None
    fn open_control(
        &self,
        pcm: &dyn PcmDevice,
    ) -> Result<Option<Box<dyn ControlChannel>>, DeviceError>;
}
