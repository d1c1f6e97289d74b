//! 音频格式和样本编解码
//!
//! 内部表示：所有整数位深统一左对齐到 i32 的高位
//! - 8-bit: 占据 bit[31:24]
//! - 16-bit: 占据 bit[31:16]，bit[15:0] = 0
//! - 24-bit: 占据 bit[31:8]，bit[7:0] = 0
//! - 32-bit: 占据 bit[31:0]
//!
//! 无符号格式在解码时翻转最高位，浮点格式按满幅 ±1.0 映射。

use std::fmt;
use std::str::FromStr;

/// 样本格式（位宽、符号、字节序）
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    S8,
    U8,
    S16LE,
    S16BE,
    U16LE,
    U16BE,
    /// 24-bit 样本放在 32-bit 容器的低 24 位
    S24LE,
    /// 紧凑 3 字节 24-bit
    S24_3LE,
    S32LE,
    S32BE,
    FloatLE,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 11] = [
        SampleFormat::S8,
        SampleFormat::U8,
        SampleFormat::S16LE,
        SampleFormat::S16BE,
        SampleFormat::U16LE,
        SampleFormat::U16BE,
        SampleFormat::S24LE,
        SampleFormat::S24_3LE,
        SampleFormat::S32LE,
        SampleFormat::S32BE,
        SampleFormat::FloatLE,
    ];

    /// 有效位数
    #[inline]
    pub fn bits(&self) -> u32 {
        match self {
            Self::S8 | Self::U8 => 8,
            Self::S16LE | Self::S16BE | Self::U16LE | Self::U16BE => 16,
            Self::S24LE | Self::S24_3LE => 24,
            Self::S32LE | Self::S32BE | Self::FloatLE => 32,
        }
    }

    /// 每样本占用的字节数（容器宽度）
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::S8 | Self::U8 => 1,
            Self::S16LE | Self::S16BE | Self::U16LE | Self::U16BE => 2,
            Self::S24_3LE => 3,
            Self::S24LE | Self::S32LE | Self::S32BE | Self::FloatLE => 4,
        }
    }

    #[inline]
    pub fn is_signed(&self) -> bool {
        !matches!(self, Self::U8 | Self::U16LE | Self::U16BE)
    }

    #[inline]
    pub fn is_little_endian(&self) -> bool {
        !matches!(self, Self::S16BE | Self::U16BE | Self::S32BE)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::S8 => "S8",
            Self::U8 => "U8",
            Self::S16LE => "S16_LE",
            Self::S16BE => "S16_BE",
            Self::U16LE => "U16_LE",
            Self::U16BE => "U16_BE",
            Self::S24LE => "S24_LE",
            Self::S24_3LE => "S24_3LE",
            Self::S32LE => "S32_LE",
            Self::S32BE => "S32_BE",
            Self::FloatLE => "FLOAT_LE",
        }
    }

    /// 用静音样本填充缓冲区
    ///
    /// 有符号/浮点格式的静音是全零；无符号格式需要把最高字节置为 0x80
    pub fn fill_silence(&self, buf: &mut [u8]) {
        if self.is_signed() {
            buf.fill(0);
            return;
        }
        let width = self.bytes_per_sample();
        let msb = if self.is_little_endian() { width - 1 } else { 0 };
        for chunk in buf.chunks_exact_mut(width) {
            chunk.fill(0);
            chunk[msb] = 0x80;
        }
    }

    /// 将单个样本的原始字节解码为左对齐 i32
    pub fn decode(&self, bytes: &[u8]) -> i32 {
        match self {
            Self::S8 => (bytes[0] as i8 as i32) << 24,
            Self::U8 => ((bytes[0] ^ 0x80) as i8 as i32) << 24,
            Self::S16LE => (i16::from_le_bytes([bytes[0], bytes[1]]) as i32) << 16,
            Self::S16BE => (i16::from_be_bytes([bytes[0], bytes[1]]) as i32) << 16,
            Self::U16LE => ((u16::from_le_bytes([bytes[0], bytes[1]]) ^ 0x8000) as i16 as i32) << 16,
            Self::U16BE => ((u16::from_be_bytes([bytes[0], bytes[1]]) ^ 0x8000) as i16 as i32) << 16,
            Self::S24LE => {
                // 容器低 24 位有效，忽略填充字节
                let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
                raw << 8
            }
            Self::S24_3LE => {
                let raw = (bytes[0] as i32) | ((bytes[1] as i32) << 8) | ((bytes[2] as i32) << 16);
                // 先左移把符号位移到 bit31，结果即左对齐
                raw << 8
            }
            Self::S32LE => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::S32BE => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::FloatLE => {
                let v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64;
                (v.clamp(-1.0, 1.0) * i32::MAX as f64) as i32
            }
        }
    }

    /// 将左对齐 i32 样本编码为原始字节
    pub fn encode(&self, sample: i32, out: &mut [u8]) {
        match self {
            Self::S8 => out[0] = (sample >> 24) as i8 as u8,
            Self::U8 => out[0] = ((sample >> 24) as i8 as u8) ^ 0x80,
            Self::S16LE => out[..2].copy_from_slice(&((sample >> 16) as i16).to_le_bytes()),
            Self::S16BE => out[..2].copy_from_slice(&((sample >> 16) as i16).to_be_bytes()),
            Self::U16LE => {
                let v = ((sample >> 16) as i16 as u16) ^ 0x8000;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
            Self::U16BE => {
                let v = ((sample >> 16) as i16 as u16) ^ 0x8000;
                out[..2].copy_from_slice(&v.to_be_bytes());
            }
            Self::S24LE => {
                // 右移 8 位取回 24-bit，符号扩展到容器高字节
                let v = sample >> 8;
                out[..4].copy_from_slice(&v.to_le_bytes());
            }
            Self::S24_3LE => {
                let v = sample >> 8;
                out[0] = (v & 0xFF) as u8;
                out[1] = ((v >> 8) & 0xFF) as u8;
                out[2] = ((v >> 16) & 0xFF) as u8;
            }
            Self::S32LE => out[..4].copy_from_slice(&sample.to_le_bytes()),
            Self::S32BE => out[..4].copy_from_slice(&sample.to_be_bytes()),
            Self::FloatLE => {
                let v = (sample as f64 / i32::MAX as f64) as f32;
                out[..4].copy_from_slice(&v.to_le_bytes());
            }
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|fmt| fmt.name() == wanted || fmt.name().replace('_', "") == wanted)
            .ok_or_else(|| format!("unknown sample format '{}'", s))
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::S16LE
    }
}

/// 流格式：样本格式 + 声道数 + 采样率
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub format: SampleFormat,
    pub channels: u32,
    pub rate: u32,
}

impl StreamFormat {
    pub fn new(format: SampleFormat, channels: u32, rate: u32) -> Self {
        Self {
            format,
            channels,
            rate,
        }
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// 将交错原始字节解码为 i32 样本（左对齐到 32-bit）
    ///
    /// 返回解码的样本数
    pub fn bytes_to_samples(&self, bytes: &[u8], output: &mut [i32]) -> usize {
        let width = self.format.bytes_per_sample();
        let mut count = 0;
        for (chunk, out) in bytes.chunks_exact(width).zip(output.iter_mut()) {
            *out = self.format.decode(chunk);
            count += 1;
        }
        count
    }

    /// 将 i32 样本（左对齐）打包为交错字节
    pub fn samples_to_bytes(&self, samples: &[i32], output: &mut [u8]) -> usize {
        let width = self.format.bytes_per_sample();
        let mut count = 0;
        for (chunk, &sample) in output.chunks_exact_mut(width).zip(samples.iter()) {
            self.format.encode(sample, chunk);
            count += 1;
        }
        count
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}ch {}Hz", self.format, self.channels, self.rate)
    }
}
