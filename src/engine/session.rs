//! 回环会话
//!
//! 一个采集端点 + 一个播放端点 + 中间的环形缓冲区。
//! 会话负责：
//! - 启动：打开、协商、选择同步模式、分配缓冲区、预填静音
//! - 搬运：采集读入 -> 合并（格式桥/简单校正）-> 播放写出
//! - 同步：周期性累计排队量，调整 pitch
//! - 恢复：xrun 后重新对齐延迟，挂起后 resume
//! - 从设备参数跟随与混音器镜像
//!
//! 会话在所属线程组内创建和使用，从不跨线程。

use std::collections::TryReserveError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Local;

use crate::audio::{timing, FrameRing, SessionReport, StreamFormat};
use crate::config::{LoopbackConfig, MixerMirror, SlaveMode, SyncMode};
use crate::device::{DeviceError, DeviceFactory, Direction, PollFd, SlaveParams};
use crate::resample;

use super::bridge::FormatBridge;
use super::endpoint::{EndpointState, StreamEndpoint};
use super::runtime::RuntimeContext;
use super::sync::{PitchController, SimpleCorrector, SyncAccumulator};
use super::EngineError;

/// 每次唤醒最多的 读-合并-写 轮数
pub const MAX_TRANSFER_ROUNDS: usize = 10;

/// resume 返回 EAGAIN 时的最大重试次数
pub const RESUME_RETRIES: usize = 100;
pub const RESUME_RETRY_DELAY: Duration = Duration::from_millis(10);

/// 从设备停止后，播放端继续输出 buffer 的倍数再停止
const STOP_DRAIN_BUFFERS: usize = 3;

/// 格式桥每次处理的帧数范围
const BRIDGE_CHUNK_MIN: usize = 64;
const BRIDGE_CHUNK_MAX: usize = 4096;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 未启动或已正常停止
    Idle,
    Running,
    /// 从设备不活动，等待控制事件
    Waiting,
    /// 出现不可恢复错误，不再参与调度
    Failed,
}

/// xrun 重新对齐的结果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct XrunSyncOutcome {
    /// 对齐前的加权排队帧数
    pub delay_before: f64,
    pub delay_after: f64,
    /// 补入的静音帧
    pub silence_frames: usize,
    /// 从采集设备队列丢弃的帧
    pub dropped_capture_frames: usize,
    /// 从环形缓冲区移除的帧
    pub removed_frames: usize,
}

/// 环形缓冲区存储
enum RingStorage {
    /// 两端格式完全相同，共用一个缓冲区
    Shared(FrameRing),
    Split {
        capture: FrameRing,
        playback: FrameRing,
    },
}

impl RingStorage {
    fn capture(&mut self) -> &mut FrameRing {
        match self {
            Self::Shared(ring) => ring,
            Self::Split { capture, .. } => capture,
        }
    }

    fn playback(&mut self) -> &mut FrameRing {
        match self {
            Self::Shared(ring) => ring,
            Self::Split { playback, .. } => playback,
        }
    }

    fn capture_ref(&self) -> &FrameRing {
        match self {
            Self::Shared(ring) => ring,
            Self::Split { capture, .. } => capture,
        }
    }

    fn playback_ref(&self) -> &FrameRing {
        match self {
            Self::Shared(ring) => ring,
            Self::Split { playback, .. } => playback,
        }
    }

    fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// 只在采集侧排队的帧（共享时全部算在播放侧）
    fn capture_queued(&self) -> usize {
        match self {
            Self::Shared(_) => 0,
            Self::Split { capture, .. } => capture.len(),
        }
    }

    fn lock_memory(&mut self) -> bool {
        match self {
            Self::Shared(ring) => ring.lock_memory(),
            Self::Split { capture, playback } => capture.lock_memory() && playback.lock_memory(),
        }
    }
}

struct MixerState {
    mirror: MixerMirror,
    enabled: bool,
}

/// 回环会话
pub struct LoopbackSession {
    config: LoopbackConfig,
    ctx: Arc<RuntimeContext>,
    capture: StreamEndpoint,
    playback: StreamEndpoint,
    state: SessionState,

    /// 实际生效的同步模式（Auto 已解析）
    sync_mode: SyncMode,
    /// 目标延迟（采集端请求采样率下的帧数）
    latency: usize,
    rings: Option<RingStorage>,
    bridge: Option<FormatBridge>,

    pitch: PitchController,
    accumulator: SyncAccumulator,
    corrector: SimpleCorrector,

    follow_slave: bool,
    reinit_pending: bool,
    stop_pending: bool,
    stop_drain: usize,

    mixers: Vec<MixerState>,
    captured_frames: u64,
    frame_limit: Option<u64>,
    fd_split: (usize, usize),
}

fn oom(what: &str, frames: usize, err: TryReserveError) -> EngineError {
    EngineError::ResourceExhaustion(format!("{} ({} frames): {}", what, frames, err))
}

impl LoopbackSession {
    pub fn new(config: LoopbackConfig, ctx: Arc<RuntimeContext>) -> Self {
        let requested = StreamFormat::new(config.format, config.channels, config.rate);
        let capture = StreamEndpoint::new(
            Direction::Capture,
            config.capture_device.clone(),
            requested,
            config.nonblock,
        );
        let playback = StreamEndpoint::new(
            Direction::Playback,
            config.playback_device.clone(),
            requested,
            config.nonblock,
        );
        let mixers = config
            .mixers
            .iter()
            .cloned()
            .map(|mirror| MixerState {
                mirror,
                enabled: true,
            })
            .collect();

        Self {
            pitch: PitchController::new(config.rate),
            accumulator: SyncAccumulator::new(config.rate),
            corrector: SimpleCorrector::new(),
            sync_mode: config.sync,
            latency: config.latency_frames(),
            config,
            ctx,
            capture,
            playback,
            state: SessionState::Idle,
            rings: None,
            bridge: None,
            follow_slave: false,
            reinit_pending: false,
            stop_pending: false,
            stop_drain: 0,
            mixers,
            captured_frames: 0,
            frame_limit: None,
            fd_split: (0, 0),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 仍需调度（运行中或等待从设备）
    pub fn is_alive(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Waiting)
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn latency_frames(&self) -> usize {
        self.latency
    }

    pub fn pitch(&self) -> f64 {
        self.pitch.pitch()
    }

    pub fn is_shared_ring(&self) -> bool {
        self.rings.as_ref().is_some_and(|r| r.is_shared())
    }

    pub fn capture(&self) -> &StreamEndpoint {
        &self.capture
    }

    pub fn playback(&self) -> &StreamEndpoint {
        &self.playback
    }

    fn base_format(&self) -> StreamFormat {
        StreamFormat::new(self.config.format, self.config.channels, self.config.rate)
    }

    fn endpoint_mut(&mut self, direction: Direction) -> &mut StreamEndpoint {
        match direction {
            Direction::Capture => &mut self.capture,
            Direction::Playback => &mut self.playback,
        }
    }

    // ========== 启动 / 停止 ==========

    /// 启动（或重启）会话
    ///
    /// 失败时会话进入 `Failed`，设备全部关闭
    pub fn start(&mut self, factory: &dyn DeviceFactory) -> Result<(), EngineError> {
        self.shutdown();
        match self.try_start(factory) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("[{}] start failed: {}", self.config.id, e);
                self.shutdown();
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    fn try_start(&mut self, factory: &dyn DeviceFactory) -> Result<(), EngineError> {
        let want_capture_control = self.config.slave != SlaveMode::Off || !self.mixers.is_empty();
        self.capture.open(factory, &self.ctx, want_capture_control)?;
        self.playback.open(factory, &self.ctx, !self.mixers.is_empty())?;

        if !self.resolve_slave()? {
            log::info!(
                "[{}] slave '{}' inactive, waiting",
                self.config.id,
                self.capture.name()
            );
            self.state = SessionState::Waiting;
            return Ok(());
        }

        self.latency = self.config.latency.frames(self.capture.requested().rate);
        let buffer = self.config.buffer_frames.unwrap_or(self.latency);
        let period = self.config.period_frames.unwrap_or(buffer / 4);
        self.capture.negotiate(buffer, period)?;
        self.playback.negotiate(buffer, period)?;

        self.sync_mode = self.resolve_sync_mode();
        let capt_rate = self.capture.rate();
        let play_rate = self.playback.rate();
        if capt_rate != play_rate && self.sync_mode != SyncMode::Samplerate {
            return Err(EngineError::ParamNegotiation {
                device: self.playback.name().to_string(),
                reason: format!(
                    "rate {} Hz differs from capture rate {} Hz (needs samplerate sync)",
                    play_rate, capt_rate
                ),
            });
        }

        self.allocate_rings()?;

        self.pitch.reset(capt_rate);
        self.accumulator = SyncAccumulator::new(capt_rate);
        self.corrector.reset();
        self.captured_frames = 0;
        self.frame_limit = self.config.seconds.map(|s| s * capt_rate as u64);
        self.apply_pitch(1.0)?;

        self.mirror_mixers(None);
        self.prime_and_start()?;
        self.state = SessionState::Running;

        log::info!(
            "[{}] running: '{}' -> '{}', latency {} frames, sync {}{}",
            self.config.id,
            self.capture.name(),
            self.playback.name(),
            self.latency,
            self.sync_mode,
            if self.is_shared_ring() { ", shared ring" } else { "" }
        );
        if self.config.verbose >= 2 {
            self.dump();
        }
        Ok(())
    }

    /// 读取从设备参数，返回从设备是否活动（不跟随时总是 true）
    fn resolve_slave(&mut self) -> Result<bool, EngineError> {
        self.follow_slave = false;
        let base = self.base_format();
        self.capture.set_requested(base);
        self.playback.set_requested(base);

        if self.config.slave == SlaveMode::Off {
            return Ok(true);
        }
        let params = match self.capture.control_mut() {
            Some(control) => control
                .slave_params()
                .map_err(|source| EngineError::ControlIo {
                    element: "PCM Slave Active".to_string(),
                    source,
                })?,
            None => None,
        };
        let Some(params) = params else {
            if self.config.slave == SlaveMode::On {
                log::warn!(
                    "[{}] slave mode requested but '{}' has no slave controls",
                    self.config.id,
                    self.capture.name()
                );
            }
            return Ok(true);
        };

        self.follow_slave = true;
        if !params.active {
            return Ok(false);
        }
        let format = self.slave_format(&params);
        self.capture.set_requested(format);
        self.playback.set_requested(format);
        log::info!("[{}] following slave: {}", self.config.id, format);
        Ok(true)
    }

    fn slave_format(&self, params: &SlaveParams) -> StreamFormat {
        let base = self.base_format();
        StreamFormat::new(
            params.format.unwrap_or(base.format),
            if params.channels > 0 { params.channels } else { base.channels },
            if params.rate > 0 { params.rate } else { base.rate },
        )
    }

    fn resolve_sync_mode(&self) -> SyncMode {
        let id = &self.config.id;
        match self.config.sync {
            SyncMode::Auto => {
                if self.capture.has_rate_shift() {
                    SyncMode::CaptureShift
                } else if self.playback.has_rate_shift() {
                    SyncMode::PlaybackShift
                } else if self.config.resampler.is_some() {
                    SyncMode::Samplerate
                } else {
                    SyncMode::Simple
                }
            }
            SyncMode::CaptureShift if !self.capture.has_rate_shift() => {
                log::warn!("[{}] '{}' has no rate shift control, using simple sync", id, self.capture.name());
                SyncMode::Simple
            }
            SyncMode::PlaybackShift if !self.playback.has_rate_shift() => {
                log::warn!("[{}] '{}' has no rate shift control, using simple sync", id, self.playback.name());
                SyncMode::Simple
            }
            mode => mode,
        }
    }

    fn allocate_rings(&mut self) -> Result<(), EngineError> {
        let capt = self.capture.format();
        let play = self.playback.format();
        let capacity = 2 * self
            .latency
            .max(self.capture.buffer_frames())
            .max(self.playback.buffer_frames());

        let shared = capt == play && self.sync_mode != SyncMode::Samplerate;
        let mut rings = if shared {
            RingStorage::Shared(
                FrameRing::new(capacity, play.bytes_per_frame())
                    .map_err(|e| oom("shared ring", capacity, e))?,
            )
        } else {
            RingStorage::Split {
                capture: FrameRing::new(capacity, capt.bytes_per_frame())
                    .map_err(|e| oom("capture ring", capacity, e))?,
                playback: FrameRing::new(capacity, play.bytes_per_frame())
                    .map_err(|e| oom("playback ring", capacity, e))?,
            }
        };
        if self.config.mlock && !rings.lock_memory() {
            log::warn!("[{}] failed to lock ring memory", self.config.id);
        }

        self.bridge = if shared {
            None
        } else {
            let kind = match self.sync_mode {
                SyncMode::Samplerate => self.config.resampler,
                _ => None,
            };
            let chunk = self
                .capture
                .period_frames()
                .clamp(BRIDGE_CHUNK_MIN, BRIDGE_CHUNK_MAX);
            let resampler = resample::create(kind, play.channels as usize, self.base_ratio(), chunk)?;
            Some(
                FormatBridge::new(capt, play, resampler, chunk)
                    .map_err(|e| oom("format bridge", chunk, e))?,
            )
        };
        self.rings = Some(rings);
        Ok(())
    }

    /// 未校正时的输出/输入采样率比
    fn base_ratio(&self) -> f64 {
        self.playback.rate() as f64 / self.capture.rate().max(1) as f64
    }

    /// 目标延迟换算为播放端帧数
    fn playback_frames(&self, weighted: f64) -> usize {
        (weighted / self.playback.pitch()).round().max(0.0) as usize
    }

    fn prime_and_start(&mut self) -> Result<(), EngineError> {
        self.capture.prepare()?;
        self.playback.prepare()?;
        let silence = self.playback_frames(self.latency as f64);
        self.pad_and_write(silence)?;
        self.playback.start()?;
        self.capture.start()?;
        Ok(())
    }

    /// 向播放环补静音并写出，返回实际补入帧数
    fn pad_and_write(&mut self, frames: usize) -> Result<usize, EngineError> {
        let format = self.playback.format().format;
        let Some(rings) = self.rings.as_mut() else {
            return Ok(0);
        };
        let ring = rings.playback();
        let padded = ring.push_silence(frames, format);
        self.playback
            .write(ring)
            .map_err(|e| EngineError::from_device(self.playback.name(), e))?;
        Ok(padded)
    }

    /// 停止并关闭全部设备
    pub fn stop(&mut self) {
        if self.state == SessionState::Running {
            log::info!("[{}] stopping", self.config.id);
        }
        self.shutdown();
        if self.state != SessionState::Failed {
            self.state = SessionState::Idle;
        }
    }

    fn shutdown(&mut self) {
        self.capture.stop();
        self.playback.stop();
        self.capture.close();
        self.playback.close();
        self.rings = None;
        self.bridge = None;
        self.reinit_pending = false;
        self.stop_pending = false;
        self.stop_drain = 0;
    }

    fn fail(&mut self, err: EngineError) {
        log::error!("[{}] session failed: {}", self.config.id, err);
        self.shutdown();
        self.state = SessionState::Failed;
    }

    // ========== 调度接口 ==========

    /// 追加本会话的 poll 描述符
    pub fn poll_descriptors(&mut self, fds: &mut Vec<PollFd>) -> usize {
        let (capture, playback) = if self.state == SessionState::Running && !self.stop_pending {
            (
                self.capture.poll_descriptors(fds),
                self.playback.poll_descriptors(fds),
            )
        } else if self.state == SessionState::Running {
            (0, self.playback.poll_descriptors(fds))
        } else {
            (0, 0)
        };
        self.fd_split = (capture, playback);
        capture + playback + self.capture.control_descriptors(fds)
    }

    /// 建议的最长等待时间（微秒），None 表示只等描述符
    pub fn wake_hint_usec(&self) -> Option<u64> {
        match self.state {
            SessionState::Running => self.config.wake_usec.or_else(|| {
                (self.config.nonblock || self.stop_pending).then(|| {
                    let period = self.playback.period_frames().max(1) as u64;
                    timing::frames_to_usec(period, self.playback.rate()).max(1000)
                })
            }),
            SessionState::Waiting => self.config.wake_usec,
            _ => None,
        }
    }

    /// 处理一次唤醒：控制事件、重启请求、音频搬运
    ///
    /// `fds` 是本会话在上次 `poll_descriptors` 中追加的那一段
    pub fn service(&mut self, factory: &dyn DeviceFactory, fds: &[PollFd]) {
        if !self.is_alive() {
            return;
        }
        let ready = self.wants_transfer(fds);
        self.handle_control_events();

        if self.reinit_pending {
            self.reinit_pending = false;
            log::info!("[{}] slave parameters changed, restarting", self.config.id);
            if self.start(factory).is_err() {
                return;
            }
        }

        if self.state == SessionState::Running && ready {
            if let Err(e) = self.transfer() {
                self.fail(e);
            }
        }
    }

    /// 根据 poll 结果判断本次是否搬运
    ///
    /// 设置了唤醒间隔时按定时搬运，不看就绪状态
    fn wants_transfer(&self, fds: &[PollFd]) -> bool {
        let (capture, playback) = self.fd_split;
        if capture + playback == 0 || fds.len() < capture + playback {
            return true;
        }
        let capt_events = if capture > 0 {
            self.capture.revents(&fds[..capture])
        } else {
            0
        };
        let play_events = if playback > 0 {
            self.playback.revents(&fds[capture..capture + playback])
        } else {
            0
        };

        let events = capt_events | play_events;
        if events & (libc::POLLERR | libc::POLLNVAL) != 0 {
            log::debug!("[{}] poll reported error 0x{:x}", self.config.id, events);
            return true;
        }
        capt_events & libc::POLLIN != 0
            || play_events & libc::POLLOUT != 0
            || self.wake_hint_usec().is_some()
    }

    // ========== 音频搬运 ==========

    fn transfer(&mut self) -> Result<(), EngineError> {
        let mut captured = 0;
        for _ in 0..MAX_TRANSFER_ROUNDS {
            let read = if self.stop_pending { 0 } else { self.capture_step()? };
            let merged = self.merge(read)?;
            if self.stop_pending {
                self.pad_for_drain();
            }
            let written = self.playback_step()?;
            captured += read;

            if self.stop_pending {
                self.stop_drain += written;
                if self.stop_drain >= STOP_DRAIN_BUFFERS * self.playback.buffer_frames() {
                    self.finish_drain();
                    return Ok(());
                }
            }
            if read == 0 && merged == 0 && written == 0 {
                break;
            }
        }

        if let Some(queued) = self.queued_estimate() {
            self.accumulator.record(queued);
        }
        if captured > 0 {
            self.captured_frames += captured as u64;
            if self.accumulator.advance(captured) {
                self.resync();
            }
        }
        if self.frame_limit.is_some_and(|limit| self.captured_frames >= limit) {
            log::info!("[{}] run time reached", self.config.id);
            self.stop();
        }
        Ok(())
    }

    fn capture_step(&mut self) -> Result<usize, EngineError> {
        let Some(rings) = self.rings.as_mut() else {
            return Ok(0);
        };
        match self.capture.read(rings.capture()) {
            Ok(frames) => Ok(frames),
            Err(DeviceError::Again) => Ok(0),
            Err(DeviceError::Xrun) => self.recover_xrun(Direction::Capture).map(|_| 0),
            Err(DeviceError::Suspended) => self.recover_suspend(Direction::Capture).map(|_| 0),
            Err(e) => Err(EngineError::from_device(self.capture.name(), e)),
        }
    }

    fn playback_step(&mut self) -> Result<usize, EngineError> {
        let Some(rings) = self.rings.as_mut() else {
            return Ok(0);
        };
        match self.playback.write(rings.playback()) {
            Ok(frames) => Ok(frames),
            Err(DeviceError::Again) => Ok(0),
            Err(DeviceError::Xrun) => self.recover_xrun(Direction::Playback).map(|_| 0),
            Err(DeviceError::Suspended) => self.recover_suspend(Direction::Playback).map(|_| 0),
            Err(e) => Err(EngineError::from_device(self.playback.name(), e)),
        }
    }

    /// 把采集到的帧交给播放侧，返回进入播放环的帧数
    fn merge(&mut self, read: usize) -> Result<usize, EngineError> {
        let Some(rings) = self.rings.as_mut() else {
            return Ok(0);
        };
        let merged = match (rings, self.bridge.as_mut()) {
            (RingStorage::Split { capture, playback }, Some(bridge)) => {
                bridge.transfer(capture, playback)?
            }
            // 共享缓冲区：采集写入即对播放可见
            _ => read,
        };

        if self.sync_mode == SyncMode::Simple && merged > 0 {
            self.corrector.account(self.pitch.pitch(), merged);
            let adjust = self.corrector.take();
            if let Some(rings) = self.rings.as_mut() {
                let ring = rings.playback();
                if adjust > 0 {
                    ring.discard(adjust as usize);
                } else if adjust < 0 {
                    ring.repeat_last(adjust.unsigned_abs() as usize);
                }
            }
        }
        Ok(merged)
    }

    // ========== 同步 ==========

    /// 加权排队帧数；设备延迟查询失败的一端按 0 计
    fn weighted_queue(&self, play_device: i64, capt_device: i64) -> f64 {
        let (play_ring, capt_ring) = self.rings.as_ref().map_or((0, 0), |r| {
            (r.playback_ref().len(), r.capture_queued())
        });
        let held = self.bridge.as_ref().map_or(0, |b| b.held_frames());
        let playback = (play_device.max(0) as usize + play_ring + held) as f64;
        let capture = (capt_device.max(0) as usize + capt_ring) as f64;
        playback * self.playback.pitch() + capture * self.capture.pitch()
    }

    fn current_delay(&mut self) -> f64 {
        let play = self.playback.delay().unwrap_or(0);
        let capt = self.capture.delay().unwrap_or(0);
        self.weighted_queue(play, capt)
    }

    /// 周期累计用的排队估计，两端延迟都查询失败时不计入
    fn queued_estimate(&mut self) -> Option<f64> {
        let play = self.playback.delay();
        let capt = if self.stop_pending {
            None
        } else {
            self.capture.delay()
        };
        if play.is_none() && capt.is_none() {
            return None;
        }
        Some(self.weighted_queue(play.unwrap_or(0), capt.unwrap_or(0)))
    }

    fn resync(&mut self) {
        let Some(diff) = self.accumulator.take_diff(self.latency) else {
            log::debug!("[{}] no delay samples since last sync point", self.config.id);
            return;
        };
        if self.sync_mode == SyncMode::None {
            self.pitch.observe(diff);
            log::debug!("[{}] sync: diff {}", self.config.id, diff);
            return;
        }

        let pitch = self.pitch.update(diff);
        log::debug!("[{}] sync: diff {} pitch {:.8}", self.config.id, diff, pitch);
        if let Err(e) = self.apply_pitch(pitch) {
            log::warn!("[{}] cannot apply pitch {:.8}: {}", self.config.id, pitch, e);
        }
    }

    fn apply_pitch(&mut self, pitch: f64) -> Result<(), EngineError> {
        match self.sync_mode {
            SyncMode::CaptureShift => self.capture.set_rate_shift(1.0 / pitch),
            SyncMode::PlaybackShift => self.playback.set_rate_shift(pitch),
            SyncMode::Samplerate => {
                let ratio = self.base_ratio() / pitch;
                if let Some(bridge) = self.bridge.as_mut() {
                    bridge.set_ratio(ratio)?;
                }
                Ok(())
            }
            // Simple 在合并时读取 pitch
            _ => Ok(()),
        }
    }

    // ========== 恢复 ==========

    fn recover_xrun(&mut self, direction: Direction) -> Result<(), EngineError> {
        let id = self.config.id.clone();
        let endpoint = self.endpoint_mut(direction);
        endpoint.stats.record_xrun();
        endpoint.set_state(EndpointState::PendingRecovery);
        log::warn!("[{}] {} xrun on '{}'", id, direction, endpoint.name());

        let detected = Local::now();
        let started = timing::now_ns();
        let outcome = self.xrun_sync(
            direction == Direction::Capture,
            direction == Direction::Playback,
        )?;
        if self.config.xrun_profile {
            log::info!(
                "[{}] {} xrun at {}: delay {:.1} -> {:.1}, silence {}, dropped {}, removed {}, resync {} us",
                id,
                direction,
                detected.format("%H:%M:%S%.6f"),
                outcome.delay_before,
                outcome.delay_after,
                outcome.silence_frames,
                outcome.dropped_capture_frames,
                outcome.removed_frames,
                timing::elapsed_usec(started, timing::now_ns())
            );
        }
        Ok(())
    }

    fn recover_suspend(&mut self, direction: Direction) -> Result<(), EngineError> {
        let id = self.config.id.clone();
        let endpoint = self.endpoint_mut(direction);
        endpoint.stats.record_suspend();
        endpoint.set_state(EndpointState::PendingRecovery);
        log::warn!("[{}] {} '{}' suspended", id, direction, endpoint.name());

        let mut attempts = 0;
        let resumed = loop {
            match endpoint.resume() {
                Ok(()) => break true,
                Err(DeviceError::Again) if attempts < RESUME_RETRIES => {
                    attempts += 1;
                    thread::sleep(RESUME_RETRY_DELAY);
                }
                Err(e) => {
                    log::debug!("[{}] resume failed: {}", id, e);
                    break false;
                }
            }
        };

        if resumed {
            endpoint.set_state(EndpointState::Running);
            log::info!("[{}] {} resumed", id, direction);
            Ok(())
        } else {
            self.recover_xrun(direction)
        }
    }

    /// xrun 后把两端排队量重新对齐到目标延迟
    pub fn xrun_sync(
        &mut self,
        capture_xrun: bool,
        playback_xrun: bool,
    ) -> Result<XrunSyncOutcome, EngineError> {
        let mut outcome = XrunSyncOutcome::default();
        let latency = self.latency as f64;

        if capture_xrun {
            self.capture.prepare()?;
            self.capture.start()?;
        } else if !self.stop_pending {
            let read = match self.rings.as_mut() {
                Some(rings) => match self.capture.read(rings.capture()) {
                    Ok(frames) => frames,
                    Err(DeviceError::Again) => 0,
                    Err(e) => return Err(EngineError::from_device(self.capture.name(), e)),
                },
                None => 0,
            };
            self.merge(read)?;
        }

        let mut delay = self.current_delay();
        outcome.delay_before = delay;

        if delay > latency {
            let queued = self.capture.delay().unwrap_or(0).max(0) as usize;
            if queued > 0 {
                self.capture.drop_frames()?;
                self.capture.prepare()?;
                self.capture.start()?;
                // 桥内暂存的是丢弃点之前的音频
                if let Some(bridge) = self.bridge.as_mut() {
                    bridge.reset();
                }
                outcome.dropped_capture_frames = queued;
                delay = self.current_delay();
            }
        }

        while delay > latency {
            let excess = delay - latency;
            let play_excess = (excess / self.playback.pitch()).ceil() as usize;
            let capt_excess = (excess / self.capture.pitch()).ceil() as usize;
            let removed = match self.rings.as_mut() {
                Some(RingStorage::Split { capture, playback }) => match playback.discard(play_excess) {
                    0 => capture.discard(capt_excess),
                    n => n,
                },
                Some(RingStorage::Shared(ring)) => ring.discard(play_excess),
                None => 0,
            };
            if removed == 0 {
                break;
            }
            outcome.removed_frames += removed;
            delay = self.current_delay();
        }

        if playback_xrun {
            self.playback.prepare()?;
            delay = self.current_delay();
            let shortfall = self.playback_frames(latency - delay);
            outcome.silence_frames = self.pad_and_write(shortfall)?;
            self.playback.start()?;
        } else if delay < latency {
            let shortfall = self.playback_frames(latency - delay);
            outcome.silence_frames = self.pad_and_write(shortfall)?;
        }

        outcome.delay_after = self.current_delay();
        Ok(outcome)
    }

    // ========== 从设备与混音器 ==========

    fn handle_control_events(&mut self) {
        let events = match self.capture.control_mut() {
            Some(control) => match control.read_events() {
                Ok(events) => events,
                Err(e) => {
                    log::warn!("[{}] control events: {}", self.config.id, e);
                    return;
                }
            },
            None => return,
        };

        let mut slave_changed = false;
        for event in &events {
            if self.follow_slave && event.is_slave_notify() {
                slave_changed = true;
            } else if event.mask.value {
                self.mirror_mixers(Some(&event.element));
            }
        }
        if slave_changed {
            self.on_slave_change();
        }
    }

    fn on_slave_change(&mut self) {
        let params = match self.capture.control_mut().map(|c| c.slave_params()) {
            Some(Ok(Some(params))) => params,
            Some(Err(e)) => {
                log::warn!("[{}] slave parameters: {}", self.config.id, e);
                return;
            }
            _ => return,
        };

        if !params.active {
            if self.state == SessionState::Running && !self.stop_pending {
                log::info!("[{}] slave inactive, draining playback", self.config.id);
                self.stop_pending = true;
                self.stop_drain = 0;
                self.capture.stop();
            }
            return;
        }

        let changed = self.slave_format(&params) != self.capture.format();
        if self.state != SessionState::Running || self.stop_pending || changed {
            self.reinit_pending = true;
        }
    }

    fn pad_for_drain(&mut self) {
        let format = self.playback.format().format;
        let period = self.playback.period_frames().max(1);
        if let Some(rings) = self.rings.as_mut() {
            let ring = rings.playback();
            if ring.len() < period {
                ring.push_silence(period - ring.len(), format);
            }
        }
    }

    fn finish_drain(&mut self) {
        log::info!("[{}] playback drained, waiting for slave", self.config.id);
        self.capture.stop();
        self.playback.stop();
        self.rings = None;
        self.bridge = None;
        self.stop_pending = false;
        self.stop_drain = 0;
        self.state = SessionState::Waiting;
    }

    /// 镜像混音器元素；`only` 为 Some 时只处理源名称匹配的那一项
    fn mirror_mixers(&mut self, only: Option<&str>) {
        for mixer in self.mixers.iter_mut().filter(|m| m.enabled) {
            if only.is_some_and(|name| name != mixer.mirror.src) {
                continue;
            }
            if let Err(e) = copy_element(&mut self.capture, &mut self.playback, &mixer.mirror) {
                log::warn!(
                    "[{}] disabling mixer mirror {}@{}: {}",
                    self.config.id,
                    mixer.mirror.dst,
                    mixer.mirror.src,
                    e
                );
                mixer.enabled = false;
            }
        }
    }

    // ========== 诊断 ==========

    pub fn report(&self) -> SessionReport {
        let (diff_min, diff_max) = self.pitch.diff_range();
        SessionReport {
            id: self.config.id.clone(),
            running: self.state == SessionState::Running,
            failed: self.state == SessionState::Failed,
            sync_mode: if self.config.sync == SyncMode::Auto {
                format!("{} (auto)", self.sync_mode)
            } else {
                self.sync_mode.to_string()
            },
            latency_frames: self.latency,
            pitch: self.pitch.pitch(),
            pitch_diff: self.pitch.last_diff() as f64,
            pitch_diff_min: diff_min as f64,
            pitch_diff_max: diff_max as f64,
            shared_ring: self.is_shared_ring(),
            capture: self
                .capture
                .report(self.rings.as_ref().map(|r| r.capture_ref())),
            playback: self
                .playback
                .report(self.rings.as_ref().map(|r| r.playback_ref())),
        }
    }

    /// 在输出锁下打印状态报告
    pub fn dump(&self) {
        let report = self.report();
        let _guard = self.ctx.output_lock();
        println!("{}", report);
    }
}

fn copy_element(
    capture: &mut StreamEndpoint,
    playback: &mut StreamEndpoint,
    mirror: &MixerMirror,
) -> Result<(), EngineError> {
    let control_error = |element: &str, source: DeviceError| EngineError::ControlIo {
        element: element.to_string(),
        source,
    };

    let source = capture.control_mut().ok_or_else(|| {
        control_error(&mirror.src, DeviceError::Unsupported("no capture control".to_string()))
    })?;
    let values = source
        .read_element(&mirror.src)
        .map_err(|e| control_error(&mirror.src, e))?;

    let target = playback.control_mut().ok_or_else(|| {
        control_error(&mirror.dst, DeviceError::Unsupported("no playback control".to_string()))
    })?;
    target
        .write_element(&mirror.dst, &values)
        .map_err(|e| control_error(&mirror.dst, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;
    use crate::config::Latency;
    use crate::device::sim::{SimControl, SimFactory, SimFault, SimPcm};
    use crate::resample::ResamplerKind;

    const LATENCY: usize = 1024;

    struct Rig {
        factory: SimFactory,
        capt: SimPcm,
        play: SimPcm,
        ctx: Arc<RuntimeContext>,
    }

    impl Rig {
        fn new(capt: SimPcm, play: SimPcm) -> Self {
            let factory = SimFactory::new();
            factory.add_pcm(&capt);
            factory.add_pcm(&play);
            Self {
                factory,
                capt,
                play,
                ctx: RuntimeContext::new(false),
            }
        }

        fn plain() -> Self {
            Self::new(SimPcm::capture("cap"), SimPcm::playback("play"))
        }

        fn session(&self, config: LoopbackConfig) -> LoopbackSession {
            LoopbackSession::new(config, Arc::clone(&self.ctx))
        }

        fn service(&self, session: &mut LoopbackSession) {
            session.service(&self.factory, &[]);
        }
    }

    fn config() -> LoopbackConfig {
        LoopbackConfig {
            capture_device: "cap".to_string(),
            playback_device: "play".to_string(),
            latency: Latency::Frames(LATENCY),
            slave: SlaveMode::Off,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_primes_latency() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.sync_mode(), SyncMode::Simple);
        assert!(session.is_shared_ring());
        assert_eq!(rig.play.written_frames(), LATENCY);
        assert_eq!(rig.play.sim().start_count, 1);
        assert_eq!(rig.capt.sim().start_count, 1);
        assert_eq!(session.capture().state(), EndpointState::Running);
        // 缓冲区默认等于延迟，周期为其四分之一
        assert_eq!(session.playback().buffer_frames(), LATENCY);
        assert_eq!(session.playback().period_frames(), LATENCY / 4);
    }

    #[test]
    fn test_shared_ring_identity() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        let rings = session.rings.as_mut().unwrap();
        assert_eq!(rings.capture().storage_ptr(), rings.playback().storage_ptr());

        // 采集写入的帧直接出现在播放侧
        rig.capt.produce(100);
        let read = session.capture.read(session.rings.as_mut().unwrap().capture()).unwrap();
        assert_eq!(read, 100);
        assert_eq!(session.rings.as_ref().unwrap().playback_ref().len(), 100);

        rig.play.drain(LATENCY);
        rig.service(&mut session);
        assert_eq!(rig.play.written_frames(), LATENCY + 100);
    }

    #[test]
    fn test_loop_moves_audio() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        for _ in 0..20 {
            rig.capt.produce(256);
            rig.play.drain(256);
            rig.service(&mut session);
        }
        assert_eq!(session.capture().stats.frames, 20 * 256);
        assert_eq!(rig.play.written_frames(), LATENCY + 20 * 256);
        assert!(rig.play.sim().written[LATENCY * 4..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let rig = Rig::plain();
        rig.play.sim().forced_rate = Some(44100);
        let mut session = rig.session(LoopbackConfig {
            sync: SyncMode::Simple,
            ..config()
        });

        let err = session.start(&rig.factory).unwrap_err();
        assert!(matches!(err, EngineError::ParamNegotiation { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(rig.capt.sim().closed);
        assert!(rig.play.sim().closed);
    }

    #[test]
    fn test_rate_mismatch_resampled() {
        let rig = Rig::plain();
        rig.play.sim().forced_rate = Some(44100);
        let mut session = rig.session(LoopbackConfig {
            resampler: Some(ResamplerKind::Linear),
            ..config()
        });
        session.start(&rig.factory).unwrap();

        assert_eq!(session.sync_mode(), SyncMode::Samplerate);
        assert!(!session.is_shared_ring());
        let base = 44100.0 / 48000.0;
        assert!((session.bridge.as_ref().unwrap().ratio() - base).abs() < 1e-12);

        session.apply_pitch(1.1).unwrap();
        assert!((session.bridge.as_ref().unwrap().ratio() - base / 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_auto_mode_resolution() {
        let rig = Rig::new(SimPcm::capture("cap").with_rate_shift(), SimPcm::playback("play"));
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();
        assert_eq!(session.sync_mode(), SyncMode::CaptureShift);

        let rig = Rig::new(SimPcm::capture("cap"), SimPcm::playback("play").with_rate_shift());
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();
        assert_eq!(session.sync_mode(), SyncMode::PlaybackShift);

        let rig = Rig::plain();
        let mut session = rig.session(LoopbackConfig {
            sync: SyncMode::CaptureShift,
            ..config()
        });
        session.start(&rig.factory).unwrap();
        assert_eq!(session.sync_mode(), SyncMode::Simple);
    }

    #[test]
    fn test_resync_applies_capture_shift() {
        let rig = Rig::new(SimPcm::capture("cap").with_rate_shift(), SimPcm::playback("play"));
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        session.accumulator.record((LATENCY + 5) as f64);
        session.resync();
        let d = session.pitch.delta();
        assert!((session.pitch() - (1.0 + 2.0 * d)).abs() < 1e-12);
        let shift = rig.capt.rate_shift().unwrap();
        assert!((shift - 1.0 / (1.0 + 2.0 * d)).abs() < 1e-12);

        // 没有样本：跳过
        session.resync();
        assert!((session.pitch() - (1.0 + 2.0 * d)).abs() < 1e-12);
    }

    #[test]
    fn test_playback_xrun_with_empty_queues() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        // 硬件已播完，随后 xrun
        rig.play.sim().queued = 0;
        rig.play.sim().state = crate::device::PcmState::XRun;
        let outcome = session.xrun_sync(false, true).unwrap();

        assert_eq!(outcome.delay_before, 0.0);
        assert_eq!(outcome.silence_frames, LATENCY);
        assert_eq!(outcome.delay_after, LATENCY as f64);
        assert_eq!(rig.play.sim().start_count, 2);
        assert_eq!(rig.play.written_frames(), 2 * LATENCY);
    }

    #[test]
    fn test_playback_xrun_via_service() {
        let rig = Rig::plain();
        let mut session = rig.session(LoopbackConfig {
            xrun_profile: true,
            ..config()
        });
        session.start(&rig.factory).unwrap();

        rig.play.sim().queued = 0;
        rig.play.sim().avail_fault = Some(SimFault::Xrun);
        rig.service(&mut session);

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.playback().stats.xrun_count, 1);
        assert_eq!(session.playback().state(), EndpointState::Running);
        assert_eq!(rig.play.queued(), LATENCY);
    }

    #[test]
    fn test_xrun_sync_converges() {
        let rig = Rig::plain();
        let mut session = rig.session(LoopbackConfig {
            buffer_frames: Some(4096),
            ..config()
        });
        session.start(&rig.factory).unwrap();
        let capacity = session.rings.as_ref().unwrap().playback_ref().capacity();
        assert_eq!(capacity, 8192);

        // 环几乎满，采集设备可读帧放不下，硬件 FIFO 中还有 300 帧
        session
            .rings
            .as_mut()
            .unwrap()
            .playback()
            .push_silence(8000, SampleFormat::S16LE);
        rig.capt.produce(500);
        rig.capt.sim().fifo_frames = 300;

        let outcome = session.xrun_sync(false, false).unwrap();
        assert_eq!(session.capture().stats.overflow, 308);
        assert_eq!(outcome.delay_before, (LATENCY + 8192 + 300) as f64);
        assert_eq!(outcome.dropped_capture_frames, 300);
        assert_eq!(outcome.removed_frames, 8192);
        assert_eq!(outcome.silence_frames, 0);
        assert_eq!(outcome.delay_after, LATENCY as f64);
        assert_eq!(rig.capt.queued(), 0);
    }

    #[test]
    fn test_dropping_capture_queue_resets_bridge() {
        let rig = Rig::plain();
        rig.play.sim().forced_rate = Some(44100);
        let mut session = rig.session(LoopbackConfig {
            resampler: Some(ResamplerKind::Linear),
            ..config()
        });
        session.start(&rig.factory).unwrap();

        // 播放环已满，转换结果只能留在桥内
        session
            .rings
            .as_mut()
            .unwrap()
            .playback()
            .push_silence(2048, SampleFormat::S16LE);
        rig.capt.produce(1000);
        let read = session.capture_step().unwrap();
        assert_eq!(read, 1000);
        session.merge(read).unwrap();
        let held_before = session.bridge.as_ref().unwrap().held_frames();

        rig.capt.sim().fifo_frames = 100;
        let outcome = session.xrun_sync(false, false).unwrap();
        assert_eq!(outcome.dropped_capture_frames, 100);
        assert!(session.bridge.as_ref().unwrap().held_frames() < held_before);
    }

    #[test]
    fn test_capture_io_error_fails_session() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        rig.capt.produce(256);
        rig.capt.sim().io_fault = Some(SimFault::Io);
        rig.service(&mut session);

        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.is_alive());
        assert_eq!(session.capture().stats.xrun_count, 0);
        assert!(rig.capt.sim().closed);
        assert!(rig.play.sim().closed);

        // 失败后不再访问设备
        rig.capt.produce(256);
        rig.service(&mut session);
        assert_eq!(rig.capt.queued(), 512);
    }

    #[test]
    fn test_playback_io_error_fails_session() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        rig.capt.produce(256);
        rig.play.drain(256);
        rig.play.sim().io_fault = Some(SimFault::Io);
        rig.service(&mut session);

        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.playback().stats.xrun_count, 0);
        assert_eq!(rig.play.written_frames(), LATENCY);
        assert!(rig.play.sim().closed);
    }

    #[test]
    fn test_failed_delay_queries_skip_resync() {
        let rig = Rig::new(SimPcm::capture("cap").with_rate_shift(), SimPcm::playback("play"));
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();
        rig.capt.sim().delay_fails = true;
        rig.play.sim().delay_fails = true;

        // 这一轮搬运越过同步点
        let sync_point = session.accumulator.sync_point();
        session.accumulator.advance(sync_point as usize - 100);
        rig.capt.produce(256);
        rig.play.drain(256);
        rig.service(&mut session);

        assert_eq!(session.capture().stats.frames, 256);
        assert_eq!(session.accumulator.count(), 0);
        assert_eq!(session.pitch(), 1.0);
        assert_eq!(session.pitch.last_diff(), 0);
        assert_eq!(rig.capt.rate_shift(), Some(1.0));
        // 同步点已越过并重新计数
        assert!(!session.accumulator.advance(0));

        // 只有一端失败时仍然计入
        rig.play.sim().delay_fails = false;
        rig.capt.produce(256);
        rig.play.drain(256);
        rig.service(&mut session);
        assert_eq!(session.accumulator.count(), 1);
    }

    #[test]
    fn test_samplerate_with_capture_rate_mismatch() {
        let rig = Rig::plain();
        rig.capt.sim().forced_rate = Some(44100);
        let mut session = rig.session(LoopbackConfig {
            resampler: Some(ResamplerKind::Linear),
            ..config()
        });
        session.start(&rig.factory).unwrap();

        assert_eq!(session.sync_mode(), SyncMode::Samplerate);
        assert!((session.capture().pitch() - 48000.0 / 44100.0).abs() < 1e-12);
        assert_eq!(session.playback().pitch(), 1.0);

        // 44.1kHz 输入转换为 48kHz 输出
        let base = 48000.0 / 44100.0;
        assert!((session.bridge.as_ref().unwrap().ratio() - base).abs() < 1e-12);
        session.apply_pitch(1.05).unwrap();
        assert!((session.bridge.as_ref().unwrap().ratio() - base / 1.05).abs() < 1e-12);
        session.apply_pitch(1.0).unwrap();

        let primed = rig.play.written_frames();
        for _ in 0..10 {
            rig.capt.produce(441);
            rig.play.drain(1024);
            rig.service(&mut session);
        }
        // 4410 个 44.1kHz 输入帧约等于 4800 个输出帧
        let ring = session.rings.as_ref().unwrap().playback_ref().len();
        let held = session.bridge.as_ref().unwrap().held_frames();
        let produced = rig.play.written_frames() - primed + ring + held;
        assert!(produced > 4600 && produced < 5000, "produced {}", produced);
    }

    #[test]
    fn test_transfer_waits_for_readiness() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();
        assert_eq!(session.wake_hint_usec(), None);

        rig.capt.sim().ready = false;
        rig.play.sim().ready = false;
        rig.capt.produce(256);
        rig.play.drain(256);

        let mut fds = Vec::new();
        assert_eq!(session.poll_descriptors(&mut fds), 2);
        session.service(&rig.factory, &fds);
        assert_eq!(session.capture().stats.frames, 0);

        rig.capt.sim().ready = true;
        session.service(&rig.factory, &fds);
        assert_eq!(session.capture().stats.frames, 256);
        assert_eq!(rig.play.written_frames(), LATENCY + 256);
    }

    #[test]
    fn test_timed_wake_ignores_readiness() {
        let rig = Rig::plain();
        let mut session = rig.session(LoopbackConfig {
            wake_usec: Some(500),
            ..config()
        });
        session.start(&rig.factory).unwrap();

        rig.capt.sim().ready = false;
        rig.play.sim().ready = false;
        rig.capt.produce(256);
        rig.play.drain(256);

        let mut fds = Vec::new();
        session.poll_descriptors(&mut fds);
        session.service(&rig.factory, &fds);
        assert_eq!(session.capture().stats.frames, 256);
    }

    #[test]
    fn test_xrun_sync_pads_shortfall() {
        let rig = Rig::plain();
        let mut session = rig.session(LoopbackConfig {
            buffer_frames: Some(4096),
            ..config()
        });
        session.start(&rig.factory).unwrap();

        rig.play.drain(600);
        let outcome = session.xrun_sync(false, false).unwrap();
        assert_eq!(outcome.delay_before, (LATENCY - 600) as f64);
        assert_eq!(outcome.silence_frames, 600);
        assert_eq!(outcome.delay_after, LATENCY as f64);
    }

    #[test]
    fn test_suspend_resume() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        rig.capt.sim().avail_fault = Some(SimFault::Suspended);
        rig.capt.sim().resume_again = 2;
        rig.service(&mut session);

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.capture().stats.suspend_count, 1);
        assert_eq!(session.capture().stats.xrun_count, 0);
        assert_eq!(rig.capt.sim().resume_again, 0);
    }

    #[test]
    fn test_failed_resume_falls_back_to_xrun() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();
        let prepares = rig.capt.sim().prepare_count;

        rig.capt.sim().avail_fault = Some(SimFault::Suspended);
        rig.capt.sim().resume_fails = true;
        rig.service(&mut session);

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.capture().stats.xrun_count, 1);
        assert_eq!(rig.capt.sim().prepare_count, prepares + 1);
    }

    #[test]
    fn test_prepare_failure_fails_session() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        rig.play.sim().avail_fault = Some(SimFault::Xrun);
        rig.play.sim().prepare_fails = true;
        rig.service(&mut session);

        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.is_alive());
        assert!(rig.play.sim().closed);
        assert!(rig.capt.sim().closed);
    }

    #[test]
    fn test_open_failure() {
        let rig = Rig::plain();
        let mut session = rig.session(LoopbackConfig {
            capture_device: "missing".to_string(),
            ..config()
        });
        let err = session.start(&rig.factory).unwrap_err();
        assert!(matches!(err, EngineError::DeviceOpen { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    fn slave_rig(params: SlaveParams) -> (Rig, SimControl) {
        let rig = Rig::plain();
        let control = SimControl::new();
        control.state().slave = Some(params);
        rig.factory.add_control("cap", &control);
        (rig, control)
    }

    #[test]
    fn test_slave_parameters_followed() {
        let (rig, control) = slave_rig(SlaveParams {
            active: true,
            format: Some(SampleFormat::S32LE),
            rate: 44100,
            channels: 4,
        });
        let mut session = rig.session(LoopbackConfig {
            slave: SlaveMode::Auto,
            ..config()
        });
        session.start(&rig.factory).unwrap();

        let expected = StreamFormat::new(SampleFormat::S32LE, 4, 44100);
        assert_eq!(session.capture().format(), expected);
        assert_eq!(session.playback().format(), expected);
        assert!(session.is_shared_ring());

        // 从设备采样率变化：重启
        control.state().slave = Some(SlaveParams {
            active: true,
            format: Some(SampleFormat::S32LE),
            rate: 48000,
            channels: 4,
        });
        control.push_event("PCM Slave Rate");
        rig.service(&mut session);

        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.capture().rate(), 48000);
        assert_eq!(rig.capt.sim().start_count, 2);
    }

    #[test]
    fn test_slave_inactive_drains_then_waits() {
        let active = SlaveParams {
            active: true,
            format: None,
            rate: 0,
            channels: 0,
        };
        let (rig, control) = slave_rig(active);
        let mut session = rig.session(LoopbackConfig {
            slave: SlaveMode::On,
            ..config()
        });
        session.start(&rig.factory).unwrap();
        let written_at_start = rig.play.written_frames();

        control.state().slave = Some(SlaveParams {
            active: false,
            ..active
        });
        control.push_event("PCM Slave Active");
        rig.service(&mut session);
        assert!(session.stop_pending);

        for _ in 0..50 {
            if session.state() != SessionState::Running {
                break;
            }
            rig.play.drain(LATENCY);
            rig.service(&mut session);
        }
        assert_eq!(session.state(), SessionState::Waiting);
        assert!(session.is_alive());
        assert!(rig.play.written_frames() - written_at_start >= 3 * LATENCY);

        // 从设备重新活动
        control.state().slave = Some(active);
        control.push_event("PCM Slave Active");
        rig.service(&mut session);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_slave_inactive_at_start() {
        let (rig, _control) = slave_rig(SlaveParams {
            active: false,
            format: None,
            rate: 0,
            channels: 0,
        });
        let mut session = rig.session(LoopbackConfig {
            slave: SlaveMode::Auto,
            ..config()
        });
        session.start(&rig.factory).unwrap();
        assert_eq!(session.state(), SessionState::Waiting);
        assert_eq!(rig.capt.sim().start_count, 0);
    }

    #[test]
    fn test_mixer_mirror() {
        let rig = Rig::plain();
        let src = SimControl::new();
        let dst = SimControl::new();
        src.state().elements.insert("Master".to_string(), vec![5, 5]);
        src.state().failing.push("Broken".to_string());
        rig.factory.add_control("cap", &src);
        rig.factory.add_control("play", &dst);

        let mut session = rig.session(LoopbackConfig {
            mixers: vec![
                "PCM@Master".parse().unwrap(),
                "Broken".parse().unwrap(),
            ],
            ..config()
        });
        session.start(&rig.factory).unwrap();

        assert_eq!(dst.state().elements.get("PCM"), Some(&vec![5, 5]));
        assert!(session.mixers[0].enabled);
        assert!(!session.mixers[1].enabled);

        src.state().elements.insert("Master".to_string(), vec![7, 3]);
        src.push_event("Master");
        rig.service(&mut session);
        assert_eq!(dst.state().elements.get("PCM"), Some(&vec![7, 3]));
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_run_time_limit() {
        let rig = Rig::plain();
        let mut session = rig.session(LoopbackConfig {
            seconds: Some(1),
            ..config()
        });
        session.start(&rig.factory).unwrap();

        for _ in 0..100 {
            if session.state() != SessionState::Running {
                break;
            }
            rig.capt.produce(1000);
            rig.play.drain(1000);
            rig.service(&mut session);
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert!(rig.capt.sim().closed);
    }

    #[test]
    fn test_report() {
        let rig = Rig::plain();
        let mut session = rig.session(config());
        session.start(&rig.factory).unwrap();

        let report = session.report();
        assert!(report.running);
        assert!(report.shared_ring);
        assert_eq!(report.sync_mode, "simple (auto)");
        assert_eq!(report.latency_frames, LATENCY);
        assert_eq!(report.playback.device, "play");
        assert!(!report.to_string().is_empty());
    }
}
