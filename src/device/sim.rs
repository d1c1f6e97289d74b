//! 测试用模拟设备
//!
//! 状态放在 `Rc<RefCell<..>>` 中，测试在会话持有设备的同时仍可检查和驱动它：
//! `produce()` 模拟采集端到达数据，`drain()` 模拟播放端硬件消费数据

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{
    ControlChannel, ControlEvent, DeviceError, DeviceFactory, Direction, HwRequest,
    NegotiatedParams, PcmDevice, PcmState, PollFd, SlaveParams, SwRequest,
};

/// 可注入的设备故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    Xrun,
    Suspended,
    Io,
}

impl SimFault {
    fn to_error(self, op: &'static str) -> DeviceError {
        match self {
            Self::Xrun => DeviceError::Xrun,
            Self::Suspended => DeviceError::Suspended,
            Self::Io => DeviceError::Io {
                op,
                errno: libc::EIO,
            },
        }
    }
}

#[derive(Debug)]
pub struct SimState {
    pub direction: Direction,
    pub state: PcmState,
    pub params: Option<NegotiatedParams>,
    pub sw: Option<SwRequest>,

    // 协商行为
    /// 小于此值的缓冲区请求被拒绝
    pub min_buffer: usize,
    /// 强制的周期大小
    pub forced_period: Option<usize>,
    /// 强制的采样率
    pub forced_rate: Option<u32>,
    pub hw_attempts: Vec<HwRequest>,

    /// 采集端：可读帧数；播放端：设备内待播放帧数
    pub queued: usize,
    /// 尚未可读/可写、但已计入延迟的硬件 FIFO 帧数
    pub fifo_frames: usize,
    /// poll 是否报告就绪
    pub ready: bool,
    /// 采集数据的字节值
    pub fill_byte: u8,
    /// 播放端写入的全部字节
    pub written: Vec<u8>,
    pub frame_bytes: usize,

    // 故障注入（一次性）
    pub avail_fault: Option<SimFault>,
    pub io_fault: Option<SimFault>,
    pub delay_fails: bool,
    pub prepare_fails: bool,
    pub resume_again: usize,
    pub resume_fails: bool,

    pub rate_shift: Option<f64>,

    pub prepare_count: usize,
    pub start_count: usize,
    pub drop_count: usize,
    pub closed: bool,
}

/// 模拟 PCM，克隆后共享同一状态
#[derive(Clone)]
pub struct SimPcm {
    name: String,
    inner: Rc<RefCell<SimState>>,
}

impl SimPcm {
    pub fn new(name: &str, direction: Direction) -> Self {
        let inner = Rc::new(RefCell::new(SimState {
            direction,
            state: PcmState::Open,
            params: None,
            sw: None,
            min_buffer: 0,
            forced_period: None,
            forced_rate: None,
            hw_attempts: Vec::new(),
            queued: 0,
            fifo_frames: 0,
            ready: true,
            fill_byte: 0x11,
            written: Vec::new(),
            frame_bytes: 0,
            avail_fault: None,
            io_fault: None,
            delay_fails: false,
            prepare_fails: false,
            resume_again: 0,
            resume_fails: false,
            rate_shift: None,
            prepare_count: 0,
            start_count: 0,
            drop_count: 0,
            closed: false,
        }));
        Self {
            name: name.to_string(),
            inner,
        }
    }

    pub fn capture(name: &str) -> Self {
        Self::new(name, Direction::Capture)
    }

    pub fn playback(name: &str) -> Self {
        Self::new(name, Direction::Playback)
    }

    /// 启用速率微调控制
    pub fn with_rate_shift(self) -> Self {
        self.inner.borrow_mut().rate_shift = Some(1.0);
        self
    }

    pub fn sim(&self) -> std::cell::RefMut<'_, SimState> {
        self.inner.borrow_mut()
    }

    /// 采集端到达 `frames` 帧
    pub fn produce(&self, frames: usize) {
        self.inner.borrow_mut().queued += frames;
    }

    /// 播放端硬件消费 `frames` 帧，返回实际消费数
    pub fn drain(&self, frames: usize) -> usize {
        let mut st = self.inner.borrow_mut();
        let n = frames.min(st.queued);
        st.queued -= n;
        n
    }

    pub fn queued(&self) -> usize {
        self.inner.borrow().queued
    }

    pub fn written_frames(&self) -> usize {
        let st = self.inner.borrow();
        if st.frame_bytes == 0 {
            0
        } else {
            st.written.len() / st.frame_bytes
        }
    }

    pub fn rate_shift(&self) -> Option<f64> {
        self.inner.borrow().rate_shift
    }

    fn ready_events(&self) -> i16 {
        match self.inner.borrow().direction {
            Direction::Capture => libc::POLLIN,
            Direction::Playback => libc::POLLOUT,
        }
    }
}

impl PcmDevice for SimPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.inner.borrow().direction
    }

    fn negotiate_hw(&mut self, request: &HwRequest) -> Result<NegotiatedParams, DeviceError> {
        let mut st = self.inner.borrow_mut();
        st.hw_attempts.push(*request);
        if request.buffer_frames < st.min_buffer {
            return Err(DeviceError::Io {
                op: "hw_params",
                errno: libc::EINVAL,
            });
        }

        let mut format = request.format;
        if let Some(rate) = st.forced_rate {
            format.rate = rate;
        }
        let params = NegotiatedParams {
            format,
            buffer_frames: request.buffer_frames,
            period_frames: st.forced_period.unwrap_or(request.period_frames),
        };
        st.params = Some(params);
        st.frame_bytes = format.bytes_per_frame();
        st.state = PcmState::Setup;
        Ok(params)
    }

    fn negotiate_sw(&mut self, request: &SwRequest) -> Result<(), DeviceError> {
        self.inner.borrow_mut().sw = Some(*request);
        Ok(())
    }

    fn avail(&mut self) -> Result<usize, DeviceError> {
        let mut st = self.inner.borrow_mut();
        if let Some(fault) = st.avail_fault.take() {
            if fault == SimFault::Xrun {
                st.state = PcmState::XRun;
            }
            return Err(fault.to_error("avail"));
        }
        match st.direction {
            Direction::Capture => Ok(st.queued),
            Direction::Playback => {
                let buffer = st.params.map_or(0, |p| p.buffer_frames);
                Ok(buffer.saturating_sub(st.queued))
            }
        }
    }

    fn delay(&mut self) -> Result<i64, DeviceError> {
        let st = self.inner.borrow();
        if st.state == PcmState::XRun {
            return Err(DeviceError::Xrun);
        }
        if st.delay_fails {
            return Err(DeviceError::Io {
                op: "delay",
                errno: libc::EIO,
            });
        }
        Ok((st.queued + st.fifo_frames) as i64)
    }

    fn read_frames(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let mut st = self.inner.borrow_mut();
        if let Some(fault) = st.io_fault.take() {
            return Err(fault.to_error("readi"));
        }
        let frames = (buf.len() / st.frame_bytes.max(1)).min(st.queued);
        let bytes = frames * st.frame_bytes;
        buf[..bytes].fill(st.fill_byte);
        st.queued -= frames;
        Ok(frames)
    }

    fn write_frames(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        let mut st = self.inner.borrow_mut();
        if let Some(fault) = st.io_fault.take() {
            return Err(fault.to_error("writei"));
        }
        let buffer = st.params.map_or(0, |p| p.buffer_frames);
        let frames = (buf.len() / st.frame_bytes.max(1)).min(buffer.saturating_sub(st.queued));
        let bytes = frames * st.frame_bytes;
        st.written.extend_from_slice(&buf[..bytes]);
        st.queued += frames;
        Ok(frames)
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let mut st = self.inner.borrow_mut();
        if st.prepare_fails {
            return Err(DeviceError::Io {
                op: "prepare",
                errno: libc::EIO,
            });
        }
        st.prepare_count += 1;
        // prepare 清空硬件缓冲区
        st.queued = 0;
        st.state = PcmState::Prepared;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let mut st = self.inner.borrow_mut();
        st.start_count += 1;
        st.state = PcmState::Running;
        Ok(())
    }

    fn drop_frames(&mut self) -> Result<(), DeviceError> {
        let mut st = self.inner.borrow_mut();
        st.drop_count += 1;
        st.queued = 0;
        st.fifo_frames = 0;
        st.state = PcmState::Setup;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        let mut st = self.inner.borrow_mut();
        if st.resume_again > 0 {
            st.resume_again -= 1;
            return Err(DeviceError::Again);
        }
        if st.resume_fails {
            return Err(DeviceError::Io {
                op: "resume",
                errno: libc::ENOSYS,
            });
        }
        st.state = PcmState::Running;
        Ok(())
    }

    fn state(&self) -> PcmState {
        self.inner.borrow().state
    }

    /// 负数 fd 会被 poll 忽略，只占位
    fn poll_descriptors(&self, fds: &mut Vec<PollFd>) -> Result<usize, DeviceError> {
        fds.push(libc::pollfd {
            fd: -1,
            events: self.ready_events(),
            revents: 0,
        });
        Ok(1)
    }

    fn revents(&self, _fds: &[PollFd]) -> Result<i16, DeviceError> {
        Ok(if self.inner.borrow().ready {
            self.ready_events()
        } else {
            0
        })
    }

    fn has_rate_shift(&self) -> bool {
        self.inner.borrow().rate_shift.is_some()
    }

    fn set_rate_shift(&mut self, pitch: f64) -> Result<(), DeviceError> {
        let mut st = self.inner.borrow_mut();
        match st.rate_shift.as_mut() {
            Some(shift) => {
                *shift = pitch;
                Ok(())
            }
            None => Err(DeviceError::Unsupported("rate shift".to_string())),
        }
    }
}

/// 模拟控制接口
#[derive(Debug, Default)]
pub struct SimControlState {
    pub events: VecDeque<ControlEvent>,
    pub slave: Option<SlaveParams>,
    pub elements: HashMap<String, Vec<i32>>,
    /// 读写这些元素时报错
    pub failing: Vec<String>,
    pub writes: usize,
}

#[derive(Clone, Default)]
pub struct SimControl(pub Rc<RefCell<SimControlState>>);

impl SimControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> std::cell::RefMut<'_, SimControlState> {
        self.0.borrow_mut()
    }

    pub fn push_event(&self, element: &str) {
        self.0.borrow_mut().events.push_back(ControlEvent {
            element: element.to_string(),
            mask: super::ChangeMask {
                value: true,
                ..Default::default()
            },
        });
    }
}

impl ControlChannel for SimControl {
    fn poll_descriptors(&self, _fds: &mut Vec<PollFd>) -> Result<usize, DeviceError> {
        Ok(0)
    }

    fn read_events(&mut self) -> Result<Vec<ControlEvent>, DeviceError> {
        Ok(self.0.borrow_mut().events.drain(..).collect())
    }

    fn slave_params(&mut self) -> Result<Option<SlaveParams>, DeviceError> {
        Ok(self.0.borrow().slave)
    }

    fn read_element(&mut self, name: &str) -> Result<Vec<i32>, DeviceError> {
        let st = self.0.borrow();
        if st.failing.iter().any(|n| n == name) {
            return Err(DeviceError::Io {
                op: "elem read",
                errno: libc::EIO,
            });
        }
        st.elements
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::Unsupported(name.to_string()))
    }

    fn write_element(&mut self, name: &str, values: &[i32]) -> Result<(), DeviceError> {
        let mut st = self.0.borrow_mut();
        if st.failing.iter().any(|n| n == name) {
            return Err(DeviceError::Io {
                op: "elem write",
                errno: libc::EIO,
            });
        }
        st.writes += 1;
        st.elements.insert(name.to_string(), values.to_vec());
        Ok(())
    }
}

/// 模拟设备工厂：按名称返回预先注册的设备
#[derive(Default)]
pub struct SimFactory {
    pcms: RefCell<HashMap<(String, Direction), SimPcm>>,
    controls: RefCell<HashMap<String, SimControl>>,
}

impl SimFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pcm(&self, pcm: &SimPcm) {
        let direction = pcm.inner.borrow().direction;
        self.pcms
            .borrow_mut()
            .insert((pcm.name.clone(), direction), pcm.clone());
    }

    pub fn add_control(&self, device: &str, control: &SimControl) {
        self.controls
            .borrow_mut()
            .insert(device.to_string(), control.clone());
    }
}

impl DeviceFactory for SimFactory {
    fn open_pcm(&self, name: &str, direction: Direction) -> Result<Box<dyn PcmDevice>, DeviceError> {
        let pcm = self
            .pcms
            .borrow()
            .get(&(name.to_string(), direction))
            .cloned()
            .ok_or(DeviceError::Io {
                op: "open",
                errno: libc::ENOENT,
            })?;
        {
            let mut st = pcm.inner.borrow_mut();
            st.closed = false;
            st.state = PcmState::Open;
        }
        Ok(Box::new(SimHandle(pcm)))
    }

    fn open_control(
        &self,
        pcm: &dyn PcmDevice,
    ) -> Result<Option<Box<dyn ControlChannel>>, DeviceError> {
        Ok(self
            .controls
            .borrow()
            .get(pcm.name())
            .cloned()
            .map(|c| Box::new(c) as Box<dyn ControlChannel>))
    }
}

/// 工厂交给会话的句柄，drop 时标记关闭并复位速率微调
struct SimHandle(SimPcm);

impl Drop for SimHandle {
    fn drop(&mut self) {
        let mut st = self.0.inner.borrow_mut();
        st.closed = true;
        if let Some(shift) = st.rate_shift.as_mut() {
            *shift = 1.0;
        }
    }
}

impl PcmDevice for SimHandle {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn direction(&self) -> Direction {
        self.0.direction()
    }
    fn negotiate_hw(&mut self, request: &HwRequest) -> Result<NegotiatedParams, DeviceError> {
        self.0.negotiate_hw(request)
    }
    fn negotiate_sw(&mut self, request: &SwRequest) -> Result<(), DeviceError> {
        self.0.negotiate_sw(request)
    }
    fn avail(&mut self) -> Result<usize, DeviceError> {
        self.0.avail()
    }
    fn delay(&mut self) -> Result<i64, DeviceError> {
        self.0.delay()
    }
    fn read_frames(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        self.0.read_frames(buf)
    }
    fn write_frames(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        self.0.write_frames(buf)
    }
    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.0.prepare()
    }
    fn start(&mut self) -> Result<(), DeviceError> {
        self.0.start()
    }
    fn drop_frames(&mut self) -> Result<(), DeviceError> {
        self.0.drop_frames()
    }
    fn resume(&mut self) -> Result<(), DeviceError> {
        self.0.resume()
    }
    fn state(&self) -> PcmState {
        PcmDevice::state(&self.0)
    }
    fn poll_descriptors(&self, fds: &mut Vec<PollFd>) -> Result<usize, DeviceError> {
        self.0.poll_descriptors(fds)
    }
    fn revents(&self, fds: &[PollFd]) -> Result<i16, DeviceError> {
        self.0.revents(fds)
    }
    fn has_rate_shift(&self) -> bool {
        self.0.has_rate_shift()
    }
    fn set_rate_shift(&mut self, pitch: f64) -> Result<(), DeviceError> {
        PcmDevice::set_rate_shift(&mut self.0, pitch)
    }
}
