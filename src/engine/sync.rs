//! 延迟同步
//!
//! - `SyncAccumulator`: 每个 poll 周期累计两端排队帧数，到达同步点时给出偏差
//! - `PitchController`: 根据偏差逐步调整 pitch
//! - `SimpleCorrector`: 无速率控制时把 pitch 偏差折算为丢帧/插帧

/// pitch 下限
pub const PITCH_MIN: f64 = 0.8;
/// pitch 上限
pub const PITCH_MAX: f64 = 1.2;

/// 同步点间隔（秒，按采集帧计）
pub const SYNC_INTERVAL_SECS: u64 = 15;

/// pitch 控制器
///
/// 偏差为正（排队过多）时提高 pitch，偏差为负时降低；
/// 偏差持平时走一步，偏差扩大时走两步，偏差缩小时保持不变
#[derive(Debug, Clone)]
pub struct PitchController {
    pitch: f64,
    delta: f64,
    last_diff: i64,
    diff_min: Option<i64>,
    diff_max: Option<i64>,
}

impl PitchController {
    pub fn new(capture_rate: u32) -> Self {
        Self {
            pitch: 1.0,
            delta: Self::delta_for(capture_rate),
            last_diff: 0,
            diff_min: None,
            diff_max: None,
        }
    }

    fn delta_for(capture_rate: u32) -> f64 {
        1.0 / (4.0 * capture_rate.max(1) as f64)
    }

    /// 重新开始（会话启动时调用）
    pub fn reset(&mut self, capture_rate: u32) {
        *self = Self::new(capture_rate);
    }

    #[inline]
    pub fn pitch(&self) -> f64 {
        self.pitch
    }

    #[inline]
    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn last_diff(&self) -> i64 {
        self.last_diff
    }

    pub fn diff_range(&self) -> (i64, i64) {
        (self.diff_min.unwrap_or(0), self.diff_max.unwrap_or(0))
    }

    /// 按本次偏差更新 pitch，返回新值
    pub fn update(&mut self, diff: i64) -> f64 {
        let last = self.last_diff;
        if diff > 0 {
            if diff == last {
                self.pitch += self.delta;
            } else if diff > last {
                self.pitch += self.delta * 2.0;
            }
        } else if diff < 0 {
            if diff == last {
                self.pitch -= self.delta;
            } else if diff < last {
                self.pitch -= self.delta * 2.0;
            }
        }
        self.pitch = self.pitch.clamp(PITCH_MIN, PITCH_MAX);
        self.observe(diff);
        self.pitch
    }

    /// 只记录偏差，不调整 pitch
    pub fn observe(&mut self, diff: i64) {
        self.last_diff = diff;
        self.diff_min = Some(self.diff_min.map_or(diff, |m| m.min(diff)));
        self.diff_max = Some(self.diff_max.map_or(diff, |m| m.max(diff)));
    }
}

/// 排队帧数累加器
#[derive(Debug, Clone)]
pub struct SyncAccumulator {
    total_queued: f64,
    count: u64,
    /// 自上次同步点以来的采集帧数
    frames: u64,
    sync_point: u64,
}

impl SyncAccumulator {
    pub fn new(capture_rate: u32) -> Self {
        Self {
            total_queued: 0.0,
            count: 0,
            frames: 0,
            sync_point: capture_rate as u64 * SYNC_INTERVAL_SECS,
        }
    }

    /// 记录一次排队估计（已按两端 pitch 加权）
    pub fn record(&mut self, queued: f64) {
        self.total_queued += queued;
        self.count += 1;
    }

    /// 累计采集帧数，返回是否到达同步点
    pub fn advance(&mut self, frames: usize) -> bool {
        self.frames += frames as u64;
        self.frames >= self.sync_point
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sync_point(&self) -> u64 {
        self.sync_point
    }

    /// 取出平均排队量与目标延迟的偏差并清零
    ///
    /// 没有任何有效样本时返回 None
    pub fn take_diff(&mut self, latency: usize) -> Option<i64> {
        let diff = (self.count > 0).then(|| {
            (self.total_queued / self.count as f64).round() as i64 - latency as i64
        });
        self.reset();
        diff
    }

    pub fn reset(&mut self) {
        self.total_queued = 0.0;
        self.count = 0;
        self.frames = 0;
    }
}

/// 简单模式校正器
///
/// 累计 `(pitch - 1) * frames` 的小数帧，整帧部分交给会话：
/// 正数丢弃最旧的帧，负数重复最新的帧
#[derive(Debug, Clone, Default)]
pub struct SimpleCorrector {
    residue: f64,
}

impl SimpleCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&mut self, pitch: f64, frames: usize) {
        self.residue += (pitch - 1.0) * frames as f64;
    }

    /// 取出整帧部分，保留小数
    pub fn take(&mut self) -> i64 {
        let whole = self.residue.trunc();
        self.residue -= whole;
        whole as i64
    }

    pub fn residue(&self) -> f64 {
        self.residue
    }

    pub fn reset(&mut self) {
        self.residue = 0.0;
    }
}
