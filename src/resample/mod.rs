//! 重采样模块
//!
//! 两端采样率不同或处于 samplerate 同步模式时，采集数据经过重采样器送往播放端。
//! - `PassthroughResampler`: 不改变采样率（只做格式桥接时使用）
//! - `RubatoResampler`: 基于 rubato 的可变比率重采样，支持运行中微调比率
//!
//! 样本为交错 f32，输入可以是任意帧数，不足一个处理块的部分留在内部队列中。

use std::fmt;
use std::str::FromStr;

use rubato::{
    FastFixedIn, PolynomialDegree, Resampler as _, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

/// 比率可调整的相对范围（同步引擎的 pitch 限制在 0.8..1.2）
const MAX_RATIO_RELATIVE: f64 = 1.5;

#[derive(Debug, thiserror::Error)]
pub enum ResamplerError {
    #[error("failed to construct resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),
    #[error("failed to resample input samples: {0}")]
    Process(#[from] rubato::ResampleError),
    #[error("invalid input length for resampler: {actual} samples is not a multiple of {channels} channels")]
    InvalidInputLength { channels: usize, actual: usize },
}

/// 重采样器
pub trait Resampler {
    /// 处理交错样本，结果追加到 `output`
    ///
    /// 返回: 本次输出的帧数
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<usize, ResamplerError>;

    /// 已接收但尚未输出的帧数（以输出帧计）
    fn held_frames(&self) -> usize;

    /// 设置输出/输入比率
    fn set_ratio(&mut self, ratio: f64) -> Result<(), ResamplerError>;

    fn ratio(&self) -> f64;

    /// 重置状态
    fn reset(&mut self);
}

/// 直通重采样器（不做任何处理）
pub struct PassthroughResampler {
    channels: usize,
}

impl PassthroughResampler {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
        }
    }
}

impl Resampler for PassthroughResampler {
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<usize, ResamplerError> {
        output.extend_from_slice(input);
        Ok(input.len() / self.channels)
    }

    fn held_frames(&self) -> usize {
        0
    }

    fn set_ratio(&mut self, _ratio: f64) -> Result<(), ResamplerError> {
        Ok(())
    }

    fn ratio(&self) -> f64 {
        1.0
    }

    fn reset(&mut self) {}
}

/// 转换器质量（命名沿用 libsamplerate 的习惯）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerKind {
    SincBest,
    SincMedium,
    #[default]
    SincFastest,
    ZeroOrderHold,
    Linear,
}

impl ResamplerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SincBest => "sincbest",
            Self::SincMedium => "sincmedium",
            Self::SincFastest => "sincfastest",
            Self::ZeroOrderHold => "zerohold",
            Self::Linear => "linear",
        }
    }

    fn sinc_parameters(&self) -> Option<SincInterpolationParameters> {
        let (sinc_len, f_cutoff, oversampling_factor, interpolation, window) = match self {
            Self::SincBest => (
                256,
                0.95,
                256,
                SincInterpolationType::Cubic,
                WindowFunction::BlackmanHarris2,
            ),
            Self::SincMedium => (
                128,
                0.925,
                128,
                SincInterpolationType::Linear,
                WindowFunction::Blackman2,
            ),
            Self::SincFastest => (
                64,
                0.915,
                64,
                SincInterpolationType::Linear,
                WindowFunction::Hann2,
            ),
            Self::ZeroOrderHold | Self::Linear => return None,
        };
        Some(SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        })
    }
}

impl fmt::Display for ResamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ResamplerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sincbest" | "best" | "0" => Ok(Self::SincBest),
            "sincmedium" | "medium" | "1" => Ok(Self::SincMedium),
            "sincfastest" | "fastest" | "2" => Ok(Self::SincFastest),
            "zerohold" | "zoh" | "3" => Ok(Self::ZeroOrderHold),
            "linear" | "4" => Ok(Self::Linear),
            other => Err(format!("unknown converter '{}'", other)),
        }
    }
}

enum Engine {
    Fast(FastFixedIn<f32>),
    Sinc(SincFixedIn<f32>),
}

impl Engine {
    fn input_frames_next(&self) -> usize {
        match self {
            Self::Fast(r) => r.input_frames_next(),
            Self::Sinc(r) => r.input_frames_next(),
        }
    }

    fn output_delay(&self) -> usize {
        match self {
            Self::Fast(r) => r.output_delay(),
            Self::Sinc(r) => r.output_delay(),
        }
    }

    fn allocate(&self) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        match self {
            Self::Fast(r) => (r.input_buffer_allocate(true), r.output_buffer_allocate(true)),
            Self::Sinc(r) => (r.input_buffer_allocate(true), r.output_buffer_allocate(true)),
        }
    }

    fn process_into_buffer(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
    ) -> rubato::ResampleResult<(usize, usize)> {
        match self {
            Self::Fast(r) => r.process_into_buffer(input, output, None),
            Self::Sinc(r) => r.process_into_buffer(input, output, None),
        }
    }

    fn set_resample_ratio(&mut self, ratio: f64) -> rubato::ResampleResult<()> {
        match self {
            Self::Fast(r) => r.set_resample_ratio(ratio, true),
            Self::Sinc(r) => r.set_resample_ratio(ratio, true),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Fast(r) => r.reset(),
            Self::Sinc(r) => r.reset(),
        }
    }
}

/// 基于 rubato 的流式重采样器
///
/// 输入先拆成每通道队列，凑满一个处理块后交给 rubato，输出再交错回去
pub struct RubatoResampler {
    engine: Engine,
    channels: usize,
    ratio: f64,
    pending: Vec<Vec<f32>>,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
}

impl RubatoResampler {
    /// 创建重采样器
    ///
    /// `chunk` 为每次处理的输入帧数（通常取采集端周期大小）。
    /// 构造时分配全部内存，不应在实时路径上调用。
    pub fn new(
        kind: ResamplerKind,
        channels: usize,
        ratio: f64,
        chunk: usize,
    ) -> Result<Self, ResamplerError> {
        let engine = match kind.sinc_parameters() {
            Some(params) => Engine::Sinc(SincFixedIn::new(
                ratio,
                MAX_RATIO_RELATIVE,
                params,
                chunk,
                channels,
            )?),
            None => {
                let degree = match kind {
                    ResamplerKind::ZeroOrderHold => PolynomialDegree::Nearest,
                    _ => PolynomialDegree::Linear,
                };
                Engine::Fast(FastFixedIn::new(
                    ratio,
                    MAX_RATIO_RELATIVE,
                    degree,
                    chunk,
                    channels,
                )?)
            }
        };

        let (input, output) = engine.allocate();
        let pending = (0..channels)
            .map(|_| Vec::with_capacity(chunk * 4))
            .collect();

        log::debug!(
            "Resampler {} created: {} ch, ratio {:.6}, chunk {}",
            kind,
            channels,
            ratio,
            chunk
        );

        Ok(Self {
            engine,
            channels,
            ratio,
            pending,
            input,
            output,
        })
    }
}

impl Resampler for RubatoResampler {
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<usize, ResamplerError> {
        if input.len() % self.channels != 0 {
            return Err(ResamplerError::InvalidInputLength {
                channels: self.channels,
                actual: input.len(),
            });
        }

        for frame in input.chunks_exact(self.channels) {
            for (queue, sample) in self.pending.iter_mut().zip(frame) {
                queue.push(*sample);
            }
        }

        let mut produced = 0;
        loop {
            let needed = self.engine.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            for (buf, queue) in self.input.iter_mut().zip(self.pending.iter_mut()) {
                buf.clear();
                buf.extend(queue.drain(..needed));
            }

            let (_, written) = self
                .engine
                .process_into_buffer(&self.input, &mut self.output)?;
            for i in 0..written {
                output.extend(self.output.iter().map(|ch| ch[i]));
            }
            produced += written;
        }
        Ok(produced)
    }

    fn held_frames(&self) -> usize {
        let queued = self.pending.first().map_or(0, |q| q.len());
        (queued as f64 * self.ratio) as usize + self.engine.output_delay()
    }

    fn set_ratio(&mut self, ratio: f64) -> Result<(), ResamplerError> {
        self.engine.set_resample_ratio(ratio)?;
        self.ratio = ratio;
        Ok(())
    }

    fn ratio(&self) -> f64 {
        self.ratio
    }

    fn reset(&mut self) {
        self.engine.reset();
        for queue in &mut self.pending {
            queue.clear();
        }
    }
}

/// 按配置创建重采样器，`kind` 为 None 时返回直通实现
pub fn create(
    kind: Option<ResamplerKind>,
    channels: usize,
    ratio: f64,
    chunk: usize,
) -> Result<Box<dyn Resampler>, ResamplerError> {
    match kind {
        Some(kind) => Ok(Box::new(RubatoResampler::new(kind, channels, ratio, chunk)?)),
        None => Ok(Box::new(PassthroughResampler::new(channels))),
    }
}
