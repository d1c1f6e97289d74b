//! 格式桥
//!
//! 采集端与播放端格式不同（样本格式、声道数或采样率）时，
//! 在两个环形缓冲区之间完成 解码 -> 声道映射 -> 重采样 -> 编码。
//!
//! 全部暂存区在会话启动时分配；重采样输出暂存在 backlog 中，
//! 播放环放不下的部分留到下一轮。

use std::collections::TryReserveError;

use crate::audio::{FrameRing, StreamFormat};
use crate::resample::{Resampler, ResamplerError};

// i32 左对齐样本 <-> f32
const SCALE: f32 = 2_147_483_648.0;

#[inline]
fn to_f32(sample: i32) -> f32 {
    sample as f32 / SCALE
}

#[inline]
fn from_f32(sample: f32) -> i32 {
    (sample as f64 * SCALE as f64).clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

fn zeroed<T: Default + Clone>(len: usize) -> Result<Vec<T>, TryReserveError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, T::default());
    Ok(v)
}

/// 采集环到播放环的转换器
pub struct FormatBridge {
    capture: StreamFormat,
    playback: StreamFormat,
    resampler: Box<dyn Resampler>,
    chunk_frames: usize,

    raw_in: Vec<u8>,
    decoded: Vec<i32>,
    mapped: Vec<f32>,
    /// 已重采样、尚未写入播放环的样本（播放声道数交错）
    backlog: Vec<f32>,
    encoded: Vec<i32>,
    raw_out: Vec<u8>,
}

impl FormatBridge {
    pub fn new(
        capture: StreamFormat,
        playback: StreamFormat,
        resampler: Box<dyn Resampler>,
        chunk_frames: usize,
    ) -> Result<Self, TryReserveError> {
        let chunk_frames = chunk_frames.max(1);
        let in_ch = capture.channels as usize;
        let out_ch = playback.channels as usize;

        let mut mapped = Vec::new();
        mapped.try_reserve_exact(chunk_frames * out_ch)?;
        // 留出重采样放大的余量
        let mut backlog = Vec::new();
        backlog.try_reserve_exact(chunk_frames * out_ch * 4)?;

        Ok(Self {
            capture,
            playback,
            resampler,
            chunk_frames,
            raw_in: zeroed(chunk_frames * capture.bytes_per_frame())?,
            decoded: zeroed(chunk_frames * in_ch)?,
            mapped,
            backlog,
            encoded: zeroed(chunk_frames * out_ch)?,
            raw_out: zeroed(chunk_frames * playback.bytes_per_frame())?,
        })
    }

    /// 尽量把 `from` 中的帧转换后写入 `to`，返回写入 `to` 的帧数
    pub fn transfer(&mut self, from: &mut FrameRing, to: &mut FrameRing) -> Result<usize, ResamplerError> {
        let in_ch = self.capture.channels as usize;
        let out_ch = self.playback.channels as usize;
        let mut written = self.flush(to);

        while self.backlog.is_empty() && !from.is_empty() {
            let frames = from.len().min(self.chunk_frames);
            let in_bytes = frames * self.capture.bytes_per_frame();
            let frames = from.pop_into(&mut self.raw_in[..in_bytes]);
            let samples = self
                .capture
                .bytes_to_samples(&self.raw_in[..in_bytes], &mut self.decoded[..frames * in_ch]);

            // 多出的播放声道补零，多出的采集声道丢弃
            self.mapped.clear();
            for frame in self.decoded[..samples].chunks_exact(in_ch) {
                self.mapped
                    .extend((0..out_ch).map(|c| frame.get(c).map_or(0.0, |&s| to_f32(s))));
            }

            self.resampler.process(&self.mapped, &mut self.backlog)?;
            written += self.flush(to);
        }
        Ok(written)
    }

    fn flush(&mut self, to: &mut FrameRing) -> usize {
        let out_ch = self.playback.channels as usize;
        let frame_bytes = self.playback.bytes_per_frame();
        let mut done = 0;

        loop {
            let frames = (self.backlog.len() / out_ch)
                .saturating_sub(done)
                .min(to.free())
                .min(self.chunk_frames);
            if frames == 0 {
                break;
            }
            let start = done * out_ch;
            let samples = frames * out_ch;
            for (dst, &src) in self.encoded[..samples]
                .iter_mut()
                .zip(&self.backlog[start..start + samples])
            {
                *dst = from_f32(src);
            }
            self.playback
                .samples_to_bytes(&self.encoded[..samples], &mut self.raw_out[..frames * frame_bytes]);
            done += to.push(&self.raw_out[..frames * frame_bytes]);
        }

        self.backlog.drain(..done * out_ch);
        done
    }

    /// 已进入桥但尚未到达播放环的帧数（以播放帧计）
    pub fn held_frames(&self) -> usize {
        self.resampler.held_frames() + self.backlog.len() / self.playback.channels as usize
    }

    pub fn set_ratio(&mut self, ratio: f64) -> Result<(), ResamplerError> {
        self.resampler.set_ratio(ratio)
    }

    pub fn ratio(&self) -> f64 {
        self.resampler.ratio()
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
        self.backlog.clear();
    }
}
