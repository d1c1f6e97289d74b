//! 会话配置
//!
//! 命令行和作业文件使用同一套会话参数（`SessionArgs`），
//! 解析后校验为 `LoopbackConfig` 交给引擎。
//! 作业文件每行一个会话，`#` 开头为注释。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::{Args, Parser};

use crate::audio::SampleFormat;
use crate::resample::ResamplerKind;

/// 默认目标延迟（微秒）
pub const DEFAULT_LATENCY_USEC: u64 = 10_000;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read job file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: {message}", path.display())]
    JobLine {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// 同步模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    None,
    Simple,
    CaptureShift,
    PlaybackShift,
    Samplerate,
    #[default]
    Auto,
}

impl SyncMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Simple => "simple",
            Self::CaptureShift => "captshift",
            Self::PlaybackShift => "playshift",
            Self::Samplerate => "samplerate",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(Self::None),
            "1" | "simple" => Ok(Self::Simple),
            "2" | "captshift" => Ok(Self::CaptureShift),
            "3" | "playshift" => Ok(Self::PlaybackShift),
            "4" | "samplerate" => Ok(Self::Samplerate),
            "5" | "auto" => Ok(Self::Auto),
            other => Err(format!("unknown sync mode '{}'", other)),
        }
    }
}

/// 从设备跟随模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlaveMode {
    #[default]
    Auto,
    On,
    Off,
}

impl FromStr for SlaveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => Err(format!("unknown slave mode '{}'", other)),
        }
    }
}

/// 目标延迟
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    Frames(usize),
    Micros(u64),
}

impl Latency {
    /// 换算为采集端采样率下的帧数
    pub fn frames(&self, rate: u32) -> usize {
        match *self {
            Self::Frames(frames) => frames,
            Self::Micros(usec) => crate::audio::timing::usec_to_frames(usec, rate) as usize,
        }
    }
}

/// 混音器元素镜像：`dst` 跟随 `src`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerMirror {
    pub dst: String,
    pub src: String,
}

impl FromStr for MixerMirror {
    type Err = String;

    /// `DST@SRC` 或单个名称（两端同名）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dst, src) = match s.split_once('@') {
            Some((dst, src)) => (dst.trim(), src.trim()),
            None => (s.trim(), s.trim()),
        };
        if dst.is_empty() || src.is_empty() {
            return Err(format!("invalid mixer mapping '{}'", s));
        }
        Ok(Self {
            dst: dst.to_string(),
            src: src.to_string(),
        })
    }
}

/// 单个会话的命令行参数
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Playback device
    #[arg(short = 'P', long = "pdevice", default_value = "default")]
    pub playback: String,

    /// Capture device
    #[arg(short = 'C', long = "cdevice", default_value = "default")]
    pub capture: String,

    /// Requested latency in frames
    #[arg(short = 'l', long = "latency")]
    pub latency_frames: Option<usize>,

    /// Requested latency in microseconds
    #[arg(short = 't', long = "tlatency")]
    pub latency_usec: Option<u64>,

    /// Sample format
    #[arg(short = 'f', long, default_value = "S16_LE")]
    pub format: SampleFormat,

    /// Channels
    #[arg(short = 'c', long, default_value_t = 2)]
    pub channels: u32,

    /// Sample rate
    #[arg(short = 'r', long, default_value_t = 48000)]
    pub rate: u32,

    /// Buffer size override in frames
    #[arg(short = 'B', long = "buffer")]
    pub buffer_frames: Option<usize>,

    /// Period size override in frames
    #[arg(short = 'E', long = "period")]
    pub period_frames: Option<usize>,

    /// Sync mode (none, simple, captshift, playshift, samplerate, auto)
    #[arg(short = 'S', long = "sync", default_value = "auto")]
    pub sync: SyncMode,

    /// Slave mode (auto, on, off)
    #[arg(short = 'a', long = "slave", default_value = "auto")]
    pub slave: SlaveMode,

    /// Allow sample rate conversion
    #[arg(short = 'n', long)]
    pub resample: bool,

    /// Sample rate converter (sincbest, sincmedium, sincfastest, zerohold, linear)
    #[arg(short = 'A', long = "samplerate", default_value = "sincfastest")]
    pub converter: ResamplerKind,

    /// Thread group; sessions in the same group share one thread
    #[arg(short = 'T', long = "thread", default_value_t = -1, allow_negative_numbers = true)]
    pub thread_group: i32,

    /// Non-blocking transfer mode
    #[arg(short = 'b', long = "nblock")]
    pub nonblock: bool,

    /// Log xrun timing profile
    #[arg(short = 'x', long = "xrun")]
    pub xrun: bool,

    /// Forced wake-up interval in microseconds
    #[arg(short = 'w', long = "wake")]
    pub wake_usec: Option<u64>,

    /// Stop after this many seconds of captured audio
    #[arg(short = 's', long)]
    pub seconds: Option<u64>,

    /// Mirror mixer element (DST@SRC), repeatable
    #[arg(short = 'm', long = "mixer")]
    pub mixers: Vec<MixerMirror>,

    /// Workarounds (serialopen), repeatable
    #[arg(short = 'W', long = "workaround")]
    pub workarounds: Vec<String>,
}

/// 作业文件中的一行
#[derive(Parser, Debug)]
#[command(name = "job", no_binary_name = true, disable_help_flag = true)]
struct JobLine {
    #[command(flatten)]
    session: SessionArgs,
}

/// 已校验的会话配置
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    pub id: String,
    pub playback_device: String,
    pub capture_device: String,
    pub latency: Latency,
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
    pub buffer_frames: Option<usize>,
    pub period_frames: Option<usize>,
    pub sync: SyncMode,
    pub slave: SlaveMode,
    /// 启用时使用的转换器，None 表示不允许重采样
    pub resampler: Option<ResamplerKind>,
    pub thread_group: i32,
    pub nonblock: bool,
    pub xrun_profile: bool,
    pub wake_usec: Option<u64>,
    pub seconds: Option<u64>,
    pub mixers: Vec<MixerMirror>,
    pub serial_open: bool,
    pub mlock: bool,
    pub verbose: u8,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            id: "0".to_string(),
            playback_device: "default".to_string(),
            capture_device: "default".to_string(),
            latency: Latency::Micros(DEFAULT_LATENCY_USEC),
            format: SampleFormat::S16LE,
            channels: 2,
            rate: 48000,
            buffer_frames: None,
            period_frames: None,
            sync: SyncMode::Auto,
            slave: SlaveMode::Auto,
            resampler: None,
            thread_group: -1,
            nonblock: false,
            xrun_profile: false,
            wake_usec: None,
            seconds: None,
            mixers: Vec::new(),
            serial_open: false,
            mlock: false,
            verbose: 0,
        }
    }
}

impl SessionArgs {
    /// 校验并转换为会话配置
    pub fn resolve(&self, id: impl Into<String>) -> Result<LoopbackConfig, ConfigError> {
        let latency = match (self.latency_frames, self.latency_usec) {
            (Some(frames), _) => Latency::Frames(frames),
            (None, Some(usec)) => Latency::Micros(usec),
            (None, None) => Latency::Micros(DEFAULT_LATENCY_USEC),
        };

        let mut serial_open = false;
        for workaround in &self.workarounds {
            match workaround.as_str() {
                "serialopen" => serial_open = true,
                other => return Err(invalid("workaround", format!("unknown '{}'", other))),
            }
        }

        let config = LoopbackConfig {
            id: id.into(),
            playback_device: self.playback.clone(),
            capture_device: self.capture.clone(),
            latency,
            format: self.format,
            channels: self.channels,
            rate: self.rate,
            buffer_frames: self.buffer_frames,
            period_frames: self.period_frames,
            sync: self.sync,
            slave: self.slave,
            resampler: self.resample.then_some(self.converter),
            thread_group: self.thread_group,
            nonblock: self.nonblock,
            xrun_profile: self.xrun,
            wake_usec: self.wake_usec,
            seconds: self.seconds,
            mixers: self.mixers.clone(),
            serial_open,
            mlock: false,
            verbose: 0,
        };
        config.validate()?;
        Ok(config)
    }
}

impl LoopbackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 || self.channels > 32 {
            return Err(invalid("channels", format!("{} (expected 1..=32)", self.channels)));
        }
        if !(4000..=768_000).contains(&self.rate) {
            return Err(invalid("rate", format!("{} Hz", self.rate)));
        }
        if self.latency.frames(self.rate) == 0 {
            return Err(invalid("latency", "must be at least one frame"));
        }
        if let (Some(buffer), Some(period)) = (self.buffer_frames, self.period_frames) {
            if period * 2 > buffer {
                return Err(invalid(
                    "period",
                    format!("period {} exceeds half of buffer {}", period, buffer),
                ));
            }
        }
        if self.sync == SyncMode::Samplerate && self.resampler.is_none() {
            return Err(invalid("sync", "samplerate sync requires --resample"));
        }
        if self.playback_device.is_empty() || self.capture_device.is_empty() {
            return Err(invalid("device", "device name must not be empty"));
        }
        Ok(())
    }

    /// 延迟帧数（以请求采样率计）
    pub fn latency_frames(&self) -> usize {
        self.latency.frames(self.rate)
    }
}

/// 按 shell 规则切分一行（支持单引号和双引号）
fn split_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// 解析作业文件内容，`first_id` 为第一个作业的编号
pub fn parse_jobs(
    path: &Path,
    content: &str,
    first_id: usize,
) -> Result<Vec<LoopbackConfig>, ConfigError> {
    let mut configs = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let job_error = |message: String| ConfigError::JobLine {
            path: path.to_path_buf(),
            line: idx + 1,
            message,
        };

        let words = split_words(line).map_err(job_error)?;
        let job = JobLine::try_parse_from(words).map_err(|e| job_error(e.to_string()))?;
        let config = job
            .session
            .resolve((first_id + configs.len()).to_string())
            .map_err(|e| job_error(e.to_string()))?;
        configs.push(config);
    }
    Ok(configs)
}

/// 读取作业文件
pub fn load_jobs(path: &Path, first_id: usize) -> Result<Vec<LoopbackConfig>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let jobs = parse_jobs(path, &content, first_id)?;
    log::info!("Loaded {} job(s) from {}", jobs.len(), path.display());
    Ok(jobs)
}
