//! 端点统计与状态转储
//!
//! 每个端点在读写路径上累计计数（单线程，无需原子操作），
//! 收到 SIGUSR1 时由会话汇总为可读文本

use std::fmt;

use super::format::StreamFormat;

/// 端点统计收集器
#[derive(Debug, Default, Clone)]
pub struct EndpointStats {
    /// 累计搬运帧数
    pub frames: u64,
    /// 因环形缓冲区满而未能读取的帧数
    pub overflow: u64,
    pub xrun_count: u64,
    pub suspend_count: u64,
    /// 最近一次成功查询到的设备延迟
    pub last_delay: Option<i64>,

    // 水位（环形缓冲区填充量）
    water_min: Option<usize>,
    water_max: usize,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_frames(&mut self, frames: usize) {
        self.frames += frames as u64;
    }

    #[inline]
    pub fn record_overflow(&mut self, frames: usize) {
        self.overflow += frames as u64;
    }

    /// 记录 xrun
    #[inline]
    pub fn record_xrun(&mut self) {
        self.xrun_count += 1;
    }

    #[inline]
    pub fn record_suspend(&mut self) {
        self.suspend_count += 1;
    }

    #[inline]
    pub fn record_water_level(&mut self, fill: usize) {
        self.water_min = Some(self.water_min.map_or(fill, |m| m.min(fill)));
        self.water_max = self.water_max.max(fill);
    }

    pub fn water_levels(&self) -> WaterLevelStats {
        WaterLevelStats {
            min: self.water_min.unwrap_or(0),
            max: self.water_max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

/// 单个端点的状态报告
#[derive(Debug, Clone)]
pub struct EndpointReport {
    pub direction: &'static str,
    pub device: String,
    pub state: String,
    pub format: Option<StreamFormat>,
    pub buffer_frames: usize,
    pub period_frames: usize,
    pub ring_fill: usize,
    pub ring_capacity: usize,
    pub pitch: f64,
    pub rate_shift: bool,
    pub stats: EndpointStats,
}

/// 会话状态报告
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: String,
    pub running: bool,
    pub failed: bool,
    pub sync_mode: String,
    pub latency_frames: usize,
    pub pitch: f64,
    pub pitch_diff: f64,
    pub pitch_diff_min: f64,
    pub pitch_diff_max: f64,
    pub shared_ring: bool,
    pub capture: EndpointReport,
    pub playback: EndpointReport,
}

impl fmt::Display for EndpointReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {} '{}' [{}]", self.direction, self.device, self.state)?;
        match &self.format {
            Some(format) => writeln!(
                f,
                "    Format: {} | buffer {} | period {}",
                format, self.buffer_frames, self.period_frames
            )?,
            None => writeln!(f, "    Format: (not negotiated)")?,
        }
        let water = self.stats.water_levels();
        writeln!(
            f,
            "    Ring: {}/{} frames (water min {} max {})",
            self.ring_fill, self.ring_capacity, water.min, water.max
        )?;
        writeln!(
            f,
            "    Pitch: {:.8}{}",
            self.pitch,
            if self.rate_shift { " (rate shift)" } else { "" }
        )?;
        writeln!(
            f,
            "    Frames: {} | overflow {} | xruns {} | suspends {} | delay {}",
            self.stats.frames,
            self.stats.overflow,
            self.stats.xrun_count,
            self.stats.suspend_count,
            self.stats
                .last_delay
                .map_or_else(|| "-".to_string(), |d| d.to_string())
        )
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.failed {
            "failed"
        } else if self.running {
            "running"
        } else {
            "stopped"
        };
        writeln!(f, "Loopback {} [{}]", self.id, state)?;
        writeln!(
            f,
            "  Sync: {} | latency {} frames | ring {}",
            self.sync_mode,
            self.latency_frames,
            if self.shared_ring { "shared" } else { "split" }
        )?;
        writeln!(
            f,
            "  Pitch: {:.8} | diff {:.1} (min {:.1} max {:.1})",
            self.pitch, self.pitch_diff, self.pitch_diff_min, self.pitch_diff_max
        )?;
        write!(f, "{}", self.capture)?;
        write!(f, "{}", self.playback)
    }
}
