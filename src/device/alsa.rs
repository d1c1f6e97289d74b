//! ALSA 设备实现
//!
//! - PCM 以非阻塞方式打开，只使用交错读写
//! - Loopback 声卡的 "PCM Rate Shift 100000" 控制用于硬件速率微调
//! - "PCM Slave *" 控制报告另一端的流参数

use std::ffi::CString;

use alsa::ctl::{Ctl, ElemId, ElemIface, ElemType, ElemValue};
use alsa::hctl::HCtl;
use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{PollDescriptors, ValueOr};

use super::{
    CardInfo, ChangeMask, ControlChannel, ControlEvent, DeviceError, DeviceFactory, Direction,
    HwRequest, NegotiatedParams, PcmDevice, PcmState, PollFd, SlaveParams, SwRequest,
};
use crate::audio::{SampleFormat, StreamFormat};

const RATE_SHIFT_ELEM: &str = "PCM Rate Shift 100000";
const RATE_SHIFT_SCALE: f64 = 100_000.0;

/// ALSA 设备工厂
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaFactory;

impl DeviceFactory for AlsaFactory {
    fn open_pcm(&self, name: &str, direction: Direction) -> Result<Box<dyn PcmDevice>, DeviceError> {
        Ok(Box::new(AlsaPcm::open(name, direction)?))
    }

    fn open_control(
        &self,
        pcm: &dyn PcmDevice,
    ) -> Result<Option<Box<dyn ControlChannel>>, DeviceError> {
        match pcm.card_info() {
            Some(card) => Ok(Some(Box::new(AlsaControl::open(card)?))),
            None => Ok(None),
        }
    }
}

fn alsa_errno(op: &'static str, err: alsa::Error) -> DeviceError {
    DeviceError::from_errno(op, err.errno())
}

fn elem_id(iface: ElemIface, card: Option<&CardInfo>, name: &str) -> Result<ElemId, DeviceError> {
    let cname = CString::new(name)
        .map_err(|_| DeviceError::Unsupported(format!("control name '{}'", name)))?;
    let mut id = ElemId::new(iface);
    if let Some(card) = card {
        id.set_device(card.device);
        id.set_subdevice(card.subdevice);
    }
    id.set_name(&cname);
    Ok(id)
}

fn to_alsa_format(format: SampleFormat) -> Format {
    match format {
        SampleFormat::S8 => Format::S8,
        SampleFormat::U8 => Format::U8,
        SampleFormat::S16LE => Format::S16LE,
        SampleFormat::S16BE => Format::S16BE,
        SampleFormat::U16LE => Format::U16LE,
        SampleFormat::U16BE => Format::U16BE,
        SampleFormat::S24LE => Format::S24LE,
        SampleFormat::S24_3LE => Format::S243LE,
        SampleFormat::S32LE => Format::S32LE,
        SampleFormat::S32BE => Format::S32BE,
        SampleFormat::FloatLE => Format::FloatLE,
    }
}

fn from_alsa_format(format: Format) -> Option<SampleFormat> {
    SampleFormat::ALL
        .iter()
        .copied()
        .find(|f| to_alsa_format(*f) == format)
}

/// ALSA PCM 流
pub struct AlsaPcm {
    name: String,
    direction: Direction,
    pcm: PCM,
    card: Option<CardInfo>,
    // 速率微调控制所在的 hctl（仅 Loopback 设备）
    rate_shift: Option<HCtl>,
}

impl AlsaPcm {
    pub fn open(name: &str, direction: Direction) -> Result<Self, DeviceError> {
        let dir = match direction {
            Direction::Capture => alsa::Direction::Capture,
            Direction::Playback => alsa::Direction::Playback,
        };
        let pcm = PCM::new(name, dir, true)?;

        let card = pcm.info().ok().and_then(|info| {
            let card = info.get_card();
            (card >= 0).then(|| CardInfo {
                card,
                device: info.get_device(),
                subdevice: info.get_subdevice(),
            })
        });

        let rate_shift = card.as_ref().and_then(|card| find_rate_shift(card).ok().flatten());
        if rate_shift.is_some() {
            log::debug!("{} '{}' has rate shift control", direction, name);
        }

        Ok(Self {
            name: name.to_string(),
            direction,
            pcm,
            card,
            rate_shift,
        })
    }
}

fn find_rate_shift(card: &CardInfo) -> Result<Option<HCtl>, DeviceError> {
    let hctl = HCtl::new(&format!("hw:{}", card.card), false)?;
    hctl.load()?;
    let id = elem_id(ElemIface::PCM, Some(card), RATE_SHIFT_ELEM)?;
    let found = hctl.find_elem(&id).is_some();
    Ok(found.then_some(hctl))
}

impl PcmDevice for AlsaPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn card_info(&self) -> Option<CardInfo> {
        self.card
    }

    fn negotiate_hw(&mut self, request: &HwRequest) -> Result<NegotiatedParams, DeviceError> {
        {
            let hwp = HwParams::any(&self.pcm)?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(to_alsa_format(request.format.format))?;
            hwp.set_channels(request.format.channels)?;
            hwp.set_rate_resample(false)?;
            hwp.set_rate_near(request.format.rate, ValueOr::Nearest)?;
            hwp.set_buffer_size_near(request.buffer_frames as alsa::pcm::Frames)?;
            hwp.set_period_size_near(request.period_frames as alsa::pcm::Frames, ValueOr::Nearest)?;
            self.pcm.hw_params(&hwp)?;
        }

        let cur = self.pcm.hw_params_current()?;
        let format = from_alsa_format(cur.get_format()?)
            .ok_or_else(|| DeviceError::Unsupported("negotiated sample format".to_string()))?;
        Ok(NegotiatedParams {
            format: StreamFormat::new(format, cur.get_channels()?, cur.get_rate()?),
            buffer_frames: cur.get_buffer_size()? as usize,
            period_frames: cur.get_period_size()? as usize,
        })
    }

    fn negotiate_sw(&mut self, request: &SwRequest) -> Result<(), DeviceError> {
        let swp = self.pcm.sw_params_current()?;
        swp.set_avail_min(request.avail_min as alsa::pcm::Frames)?;
        swp.set_start_threshold(request.start_threshold as alsa::pcm::Frames)?;
        self.pcm.sw_params(&swp)?;
        Ok(())
    }

    fn avail(&mut self) -> Result<usize, DeviceError> {
        self.pcm
            .avail_update()
            .map(|n| n.max(0) as usize)
            .map_err(|e| alsa_errno("avail", e))
    }

    fn delay(&mut self) -> Result<i64, DeviceError> {
        self.pcm
            .delay()
            .map(|d| d as i64)
            .map_err(|e| alsa_errno("delay", e))
    }

    fn read_frames(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let io = self.pcm.io_bytes();
        match io.readi(buf) {
            Ok(frames) => Ok(frames),
            Err(e) => match alsa_errno("readi", e) {
                DeviceError::Again => Ok(0),
                err => Err(err),
            },
        }
    }

    fn write_frames(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        let io = self.pcm.io_bytes();
        match io.writei(buf) {
            Ok(frames) => Ok(frames),
            Err(e) => match alsa_errno("writei", e) {
                DeviceError::Again => Ok(0),
                err => Err(err),
            },
        }
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        self.pcm.prepare().map_err(|e| alsa_errno("prepare", e))
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.pcm.start().map_err(|e| alsa_errno("start", e))
    }

    fn drop_frames(&mut self) -> Result<(), DeviceError> {
        self.pcm.drop().map_err(|e| alsa_errno("drop", e))
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.pcm.resume().map_err(|e| alsa_errno("resume", e))
    }

    fn state(&self) -> PcmState {
        match self.pcm.state() {
            State::Open => PcmState::Open,
            State::Setup => PcmState::Setup,
            State::Prepared => PcmState::Prepared,
            State::Running => PcmState::Running,
            State::XRun => PcmState::XRun,
            State::Draining => PcmState::Draining,
            State::Paused => PcmState::Paused,
            State::Suspended => PcmState::Suspended,
            State::Disconnected => PcmState::Disconnected,
        }
    }

    fn poll_descriptors(&self, fds: &mut Vec<PollFd>) -> Result<usize, DeviceError> {
        let count = PollDescriptors::count(&self.pcm);
        let start = fds.len();
        fds.resize(
            start + count,
            PollFd {
                fd: -1,
                events: 0,
                revents: 0,
            },
        );
        let filled = PollDescriptors::fill(&self.pcm, &mut fds[start..])?;
        fds.truncate(start + filled);
        Ok(filled)
    }

    fn revents(&self, fds: &[PollFd]) -> Result<i16, DeviceError> {
        let flags = PollDescriptors::revents(&self.pcm, fds)?;
        Ok(flags.bits())
    }

    fn has_rate_shift(&self) -> bool {
        self.rate_shift.is_some()
    }

    fn set_rate_shift(&mut self, pitch: f64) -> Result<(), DeviceError> {
        let hctl = self
            .rate_shift
            .as_ref()
            .ok_or_else(|| DeviceError::Unsupported("rate shift".to_string()))?;
        let id = elem_id(ElemIface::PCM, self.card.as_ref(), RATE_SHIFT_ELEM)?;
        let elem = hctl
            .find_elem(&id)
            .ok_or_else(|| DeviceError::Unsupported(RATE_SHIFT_ELEM.to_string()))?;

        let value = (pitch * RATE_SHIFT_SCALE).round() as i32;
        let mut val = ElemValue::new(ElemType::Integer)?;
        val.set_integer(0, value)
            .ok_or_else(|| DeviceError::Unsupported(RATE_SHIFT_ELEM.to_string()))?;
        elem.write(&val)?;
        log::trace!("{} '{}' rate shift -> {}", self.direction, self.name, value);
        Ok(())
    }
}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        if self.rate_shift.is_some() {
            if let Err(e) = self.set_rate_shift(1.0) {
                log::debug!("Failed to reset rate shift on '{}': {}", self.name, e);
            }
        }
    }
}

/// ALSA 声卡控制接口
///
/// `ctl` 订阅事件，`hctl` 负责元素读写
pub struct AlsaControl {
    ctl: Ctl,
    hctl: HCtl,
    card: CardInfo,
}

impl AlsaControl {
    pub fn open(card: CardInfo) -> Result<Self, DeviceError> {
        let name = format!("hw:{}", card.card);
        let ctl = Ctl::new(&name, true)?;
        ctl.subscribe_events(true)?;
        let hctl = HCtl::new(&name, false)?;
        hctl.load()?;
        Ok(Self { ctl, hctl, card })
    }

    fn read_pcm_elem(&self, name: &str) -> Result<Option<ElemValue>, DeviceError> {
        let id = elem_id(ElemIface::PCM, Some(&self.card), name)?;
        match self.hctl.find_elem(&id) {
            Some(elem) => Ok(Some(elem.read()?)),
            None => Ok(None),
        }
    }
}

impl ControlChannel for AlsaControl {
    fn poll_descriptors(&self, fds: &mut Vec<PollFd>) -> Result<usize, DeviceError> {
        let count = PollDescriptors::count(&self.ctl);
        let start = fds.len();
        fds.resize(
            start + count,
            PollFd {
                fd: -1,
                events: 0,
                revents: 0,
            },
        );
        let filled = PollDescriptors::fill(&self.ctl, &mut fds[start..])?;
        fds.truncate(start + filled);
        Ok(filled)
    }

    fn read_events(&mut self) -> Result<Vec<ControlEvent>, DeviceError> {
        let mut events = Vec::new();
        loop {
            let event = match self.ctl.read() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => match alsa_errno("ctl read", e) {
                    DeviceError::Again => break,
                    err => return Err(err),
                },
            };

            let id = event.get_id();
            // 同一声卡上其他 PCM 子设备的事件与本会话无关
            if id.get_interface() == ElemIface::PCM
                && (id.get_device() != self.card.device
                    || id.get_subdevice() != self.card.subdevice)
            {
                continue;
            }

            let mask = event.get_mask();
            events.push(ControlEvent {
                element: id.get_name().unwrap_or_default().to_string(),
                mask: ChangeMask {
                    value: mask.value(),
                    info: mask.info(),
                    add: mask.add(),
                    remove: mask.remove(),
                },
            });
        }
        Ok(events)
    }

    fn slave_params(&mut self) -> Result<Option<SlaveParams>, DeviceError> {
        let Some(active) = self.read_pcm_elem("PCM Slave Active")? else {
            return Ok(None);
        };
        let int = |value: Option<ElemValue>| value.and_then(|v| v.get_integer(0)).unwrap_or(0);

        let format = int(self.read_pcm_elem("PCM Slave Format")?);
        let rate = int(self.read_pcm_elem("PCM Slave Rate")?);
        let channels = int(self.read_pcm_elem("PCM Slave Channels")?);

        let format = SampleFormat::ALL
            .iter()
            .copied()
            .find(|f| to_alsa_format(*f) as i32 == format);

        Ok(Some(SlaveParams {
            active: active.get_boolean(0).unwrap_or(false),
            format,
            rate: rate.max(0) as u32,
            channels: channels.max(0) as u32,
        }))
    }

    fn read_element(&mut self, name: &str) -> Result<Vec<i32>, DeviceError> {
        let id = elem_id(ElemIface::Mixer, None, name)?;
        let elem = self
            .hctl
            .find_elem(&id)
            .ok_or_else(|| DeviceError::Unsupported(format!("mixer element '{}'", name)))?;
        let value = elem.read()?;
        Ok((0..)
            .map_while(|idx| value.get_integer(idx))
            .take(128)
            .collect())
    }

    fn write_element(&mut self, name: &str, values: &[i32]) -> Result<(), DeviceError> {
        let id = elem_id(ElemIface::Mixer, None, name)?;
        let elem = self
            .hctl
            .find_elem(&id)
            .ok_or_else(|| DeviceError::Unsupported(format!("mixer element '{}'", name)))?;
        // 以当前值为模板，保证类型和通道数一致
        let mut value = elem.read()?;
        for (idx, v) in values.iter().enumerate() {
            if value.set_integer(idx as u32, *v).is_none() {
                break;
            }
        }
        elem.write(&value)?;
        Ok(())
    }
}
