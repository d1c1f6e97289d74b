//! 流端点
//!
//! 封装一个已打开的采集或播放设备：参数协商、非阻塞读写、统计。
//! 环形缓冲区归会话所有，每次读写时借给端点。

use crate::audio::{EndpointReport, EndpointStats, FrameRing, StreamFormat};
use crate::device::{
    ControlChannel, DeviceError, DeviceFactory, Direction, HwRequest, NegotiatedParams, PcmDevice,
    PollFd, SwRequest,
};

use super::runtime::RuntimeContext;
use super::EngineError;

/// 缓冲区大小上限（帧）
pub const MAX_BUFFER_FRAMES: usize = 1 << 22;

/// 协商被拒绝时每次增加的缓冲区帧数
pub const BUFFER_RETRY_STEP: usize = 4;

/// 手动启动：启动阈值大于任何缓冲区
const START_THRESHOLD_MANUAL: usize = 0x7fff_ffff;

/// 丢弃溢出帧时每次读取的帧数
const DISCARD_CHUNK_FRAMES: usize = 1024;

/// 端点生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Closed,
    Opened,
    Negotiated,
    Running,
    Stopped,
    /// 运行中遇到 xrun/挂起，等待恢复
    PendingRecovery,
}

/// 采集或播放端点
pub struct StreamEndpoint {
    direction: Direction,
    device_name: String,
    requested: StreamFormat,
    nonblock: bool,

    device: Option<Box<dyn PcmDevice>>,
    control: Option<Box<dyn ControlChannel>>,
    params: Option<NegotiatedParams>,

    /// 请求采样率 / 实际采样率
    pitch: f64,
    state: EndpointState,
    pub stats: EndpointStats,

    /// 溢出帧读出后丢弃的暂存区
    discard: Vec<u8>,
}

fn not_open() -> DeviceError {
    DeviceError::Unsupported("device not open".to_string())
}

impl StreamEndpoint {
    pub fn new(
        direction: Direction,
        device_name: impl Into<String>,
        requested: StreamFormat,
        nonblock: bool,
    ) -> Self {
        Self {
            direction,
            device_name: device_name.into(),
            requested,
            nonblock,
            device: None,
            control: None,
            params: None,
            pitch: 1.0,
            state: EndpointState::Closed,
            stats: EndpointStats::new(),
            discard: Vec::new(),
        }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.device_name
    }

    #[inline]
    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn set_state(&mut self, state: EndpointState) {
        if self.state != state {
            log::trace!(
                "{} '{}': {:?} -> {:?}",
                self.direction,
                self.device_name,
                self.state,
                state
            );
            self.state = state;
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn requested(&self) -> StreamFormat {
        self.requested
    }

    /// 修改请求格式（从设备参数变化后重新协商前调用）
    pub fn set_requested(&mut self, format: StreamFormat) {
        self.requested = format;
    }

    /// 协商后的格式，未协商时为请求格式
    pub fn format(&self) -> StreamFormat {
        self.params.map_or(self.requested, |p| p.format)
    }

    pub fn buffer_frames(&self) -> usize {
        self.params.map_or(0, |p| p.buffer_frames)
    }

    pub fn period_frames(&self) -> usize {
        self.params.map_or(0, |p| p.period_frames)
    }

    pub fn rate(&self) -> u32 {
        self.format().rate
    }

    #[inline]
    pub fn pitch(&self) -> f64 {
        self.pitch
    }

    fn device_mut(&mut self) -> Result<&mut (dyn PcmDevice + 'static), DeviceError> {
        self.device.as_deref_mut().ok_or_else(not_open)
    }

    fn device_error(&self, source: DeviceError) -> EngineError {
        EngineError::from_device(&self.device_name, source)
    }

    /// 打开设备（启用 serialopen 时串行化）
    ///
    /// `want_control` 为真时同时打开声卡控制接口，失败只记录警告
    pub fn open(
        &mut self,
        factory: &dyn DeviceFactory,
        ctx: &RuntimeContext,
        want_control: bool,
    ) -> Result<(), EngineError> {
        let device = {
            let _lock = ctx.open_lock();
            factory
                .open_pcm(&self.device_name, self.direction)
                .map_err(|source| EngineError::DeviceOpen {
                    device: self.device_name.clone(),
                    source,
                })?
        };

        if want_control {
            match factory.open_control(device.as_ref()) {
                Ok(control) => self.control = control,
                Err(e) => log::warn!(
                    "{} '{}': control interface unavailable: {}",
                    self.direction,
                    self.device_name,
                    e
                ),
            }
        }

        log::debug!("{} '{}' opened", self.direction, self.device_name);
        self.device = Some(device);
        self.params = None;
        self.set_state(EndpointState::Opened);
        Ok(())
    }

    /// 协商硬件和软件参数
    ///
    /// 设备拒绝请求或返回的周期超过缓冲区一半时，缓冲区每次加 4 帧重试
    pub fn negotiate(
        &mut self,
        buffer_frames: usize,
        period_frames: usize,
    ) -> Result<NegotiatedParams, EngineError> {
        let requested = self.requested;
        let name = self.device_name.clone();
        let nonblock = self.nonblock;
        let negotiation_error = |reason: String| EngineError::ParamNegotiation {
            device: name.clone(),
            reason,
        };

        let device = self
            .device_mut()
            .map_err(|e| negotiation_error(e.to_string()))?;

        let mut buffer = buffer_frames.max(2);
        let period = period_frames.clamp(1, buffer / 2);
        let params = loop {
            let request = HwRequest {
                format: requested,
                buffer_frames: buffer,
                period_frames: period,
            };
            let last_error = match device.negotiate_hw(&request) {
                Ok(params)
                    if params.period_frames > 0
                        && params.period_frames * 2 <= params.buffer_frames =>
                {
                    break params;
                }
                Ok(params) => format!(
                    "period {} too large for buffer {}",
                    params.period_frames, params.buffer_frames
                ),
                Err(e) => e.to_string(),
            };

            buffer += BUFFER_RETRY_STEP;
            if buffer > MAX_BUFFER_FRAMES {
                return Err(negotiation_error(format!(
                    "no usable buffer size up to {} frames ({})",
                    MAX_BUFFER_FRAMES, last_error
                )));
            }
        };

        let avail_min = if nonblock {
            (params.period_frames / 4).max(1)
        } else {
            params.period_frames
        };
        device
            .negotiate_sw(&SwRequest {
                avail_min,
                start_threshold: START_THRESHOLD_MANUAL,
            })
            .map_err(|e| negotiation_error(format!("sw params: {}", e)))?;

        if params.format.rate == 0 {
            return Err(negotiation_error("device reported 0 Hz".to_string()));
        }
        self.pitch = requested.rate as f64 / params.format.rate as f64;
        self.params = Some(params);
        if self.direction == Direction::Capture {
            self.discard = vec![0; DISCARD_CHUNK_FRAMES * params.format.bytes_per_frame()];
        }
        self.set_state(EndpointState::Negotiated);

        log::info!(
            "{} '{}': {} | buffer {} | period {}{}",
            self.direction,
            self.device_name,
            params.format,
            params.buffer_frames,
            params.period_frames,
            if buffer != buffer_frames.max(2) {
                format!(" (requested buffer {})", buffer_frames)
            } else {
                String::new()
            }
        );
        Ok(params)
    }

    /// 从设备读入环形缓冲区
    ///
    /// 可读帧数超过剩余空间时，多出的部分从设备读出后丢弃并计入溢出，
    /// 每帧只计一次
    pub fn read(&mut self, ring: &mut FrameRing) -> Result<usize, DeviceError> {
        let device = self.device.as_deref_mut().ok_or_else(not_open)?;
        let avail = device.avail()?;
        if avail == 0 {
            return Ok(0);
        }

        let free = ring.free();
        let overflow = avail.saturating_sub(free);
        let wanted = avail - overflow;

        let frame_bytes = ring.frame_bytes();
        let mut done = 0;
        while done < wanted {
            let span = ring.writable_span();
            let max = (span.len() / frame_bytes).min(wanted - done);
            if max == 0 {
                break;
            }
            let n = device.read_frames(&mut span[..max * frame_bytes])?;
            if n == 0 {
                break;
            }
            ring.commit(n);
            done += n;
        }

        if overflow > 0 {
            if self.discard.len() < frame_bytes {
                self.discard.resize(DISCARD_CHUNK_FRAMES * frame_bytes, 0);
            }
            let mut lost = 0;
            while lost < overflow {
                let max = (self.discard.len() / frame_bytes).min(overflow - lost);
                let n = device.read_frames(&mut self.discard[..max * frame_bytes])?;
                if n == 0 {
                    break;
                }
                lost += n;
            }
            if lost > 0 {
                ring.record_overflow(lost);
                self.stats.record_overflow(lost);
            }
        }
        self.stats.add_frames(done);
        self.stats.record_water_level(ring.len());
        Ok(done)
    }

    /// 将环形缓冲区写入设备
    pub fn write(&mut self, ring: &mut FrameRing) -> Result<usize, DeviceError> {
        let device = self.device_mut()?;
        let avail = device.avail()?;
        let wanted = avail.min(ring.len());
        if wanted == 0 {
            return Ok(0);
        }

        let frame_bytes = ring.frame_bytes();
        let mut done = 0;
        while done < wanted {
            let span = ring.readable_span();
            let max = (span.len() / frame_bytes).min(wanted - done);
            if max == 0 {
                break;
            }
            let n = device.write_frames(&span[..max * frame_bytes])?;
            if n == 0 {
                break;
            }
            ring.consume(n);
            done += n;
        }

        self.stats.add_frames(done);
        self.stats.record_water_level(ring.len());
        Ok(done)
    }

    /// 查询设备延迟，失败返回 None
    pub fn delay(&mut self) -> Option<i64> {
        let result = self.device_mut().and_then(|d| d.delay());
        match result {
            Ok(delay) => {
                self.stats.last_delay = Some(delay);
                Some(delay)
            }
            Err(e) => {
                log::trace!("{} '{}': delay query failed: {}", self.direction, self.device_name, e);
                None
            }
        }
    }

    pub fn prepare(&mut self) -> Result<(), EngineError> {
        let result = self.device_mut().and_then(|d| d.prepare());
        result.map_err(|e| self.device_error(e))
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        let result = self.device_mut().and_then(|d| d.start());
        result.map_err(|e| self.device_error(e))?;
        self.set_state(EndpointState::Running);
        Ok(())
    }

    /// 丢弃设备队列（停止设备）
    pub fn drop_frames(&mut self) -> Result<(), EngineError> {
        let result = self.device_mut().and_then(|d| d.drop_frames());
        result.map_err(|e| self.device_error(e))
    }

    /// 尝试一次 resume
    pub fn resume(&mut self) -> Result<(), DeviceError> {
        self.device_mut()?.resume()
    }

    /// 停止设备，保留协商结果以便重启
    pub fn stop(&mut self) {
        if let Ok(device) = self.device_mut() {
            if let Err(e) = device.drop_frames() {
                log::debug!("{} '{}': drop failed: {}", self.direction, self.device_name, e);
            }
        }
        if self.is_open() {
            self.set_state(EndpointState::Stopped);
        }
    }

    pub fn has_rate_shift(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.has_rate_shift())
    }

    pub fn set_rate_shift(&mut self, pitch: f64) -> Result<(), EngineError> {
        let result = self.device_mut().and_then(|d| d.set_rate_shift(pitch));
        result.map_err(|e| self.device_error(e))
    }

    /// 追加设备 poll 描述符
    pub fn poll_descriptors(&self, fds: &mut Vec<PollFd>) -> usize {
        let Some(device) = self.device.as_ref() else {
            return 0;
        };
        device.poll_descriptors(fds).unwrap_or_else(|e| {
            log::warn!("{} '{}': poll descriptors: {}", self.direction, self.device_name, e);
            0
        })
    }

    /// 解析本端点那部分 poll 结果
    pub fn revents(&self, fds: &[PollFd]) -> i16 {
        match self.device.as_ref() {
            Some(device) => device.revents(fds).unwrap_or(libc::POLLERR),
            None => 0,
        }
    }

    pub fn control_mut(&mut self) -> Option<&mut (dyn ControlChannel + 'static)> {
        self.control.as_deref_mut()
    }

    pub fn control_descriptors(&self, fds: &mut Vec<PollFd>) -> usize {
        let Some(control) = self.control.as_ref() else {
            return 0;
        };
        control.poll_descriptors(fds).unwrap_or(0)
    }

    /// 关闭设备和控制接口（设备 drop 时复位速率微调）
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            log::debug!("{} '{}' closed", self.direction, self.device_name);
        }
        self.control = None;
        self.params = None;
        self.pitch = 1.0;
        self.set_state(EndpointState::Closed);
    }

    pub fn report(&self, ring: Option<&FrameRing>) -> EndpointReport {
        EndpointReport {
            direction: match self.direction {
                Direction::Capture => "Capture",
                Direction::Playback => "Playback",
            },
            device: self.device_name.clone(),
            state: match self.device.as_ref() {
                Some(device) => format!("{:?}, device {:?}", self.state, device.state()),
                None => format!("{:?}", self.state),
            },
            format: self.params.map(|p| p.format),
            buffer_frames: self.buffer_frames(),
            period_frames: self.period_frames(),
            ring_fill: ring.map_or(0, |r| r.len()),
            ring_capacity: ring.map_or(0, |r| r.capacity()),
            pitch: self.pitch,
            rate_shift: self.has_rate_shift(),
            stats: self.stats.clone(),
        }
    }
}

impl Drop for StreamEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}
