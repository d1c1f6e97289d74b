//! 帧环形缓冲区
//!
//! 设计目标：
//! - 以帧为单位寻址：容量、游标、填充量全部按帧计数，字节偏移只在内部计算
//! - 零分配：所有内存在会话启动时一次性分配，分配失败以错误返回
//! - 零拷贝：对外暴露连续可写/可读区间，设备直接读写环内存
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 同一线程组内单线程访问，无需原子操作；
//! 采集端和播放端格式完全一致时，两端共用同一个实例。

use std::collections::TryReserveError;

use super::format::SampleFormat;

/// 帧环形缓冲区
///
/// 不变量：`0 <= len() <= capacity()`
pub struct FrameRing {
    buffer: Box<[u8]>,
    frame_bytes: usize,
    capacity: usize,
    head: usize,
    count: usize,

    // 因空间不足而被截断的帧数
    overflow: u64,

    // 是否已锁定内存
    memory_locked: bool,
}

impl FrameRing {
    /// 创建容量为 `capacity` 帧、每帧 `frame_bytes` 字节的缓冲区
    pub fn new(capacity: usize, frame_bytes: usize) -> Result<Self, TryReserveError> {
        assert!(capacity > 0, "ring capacity must be non-zero");
        assert!(frame_bytes > 0, "frame size must be non-zero");

        let bytes = capacity * frame_bytes;
        let mut storage: Vec<u8> = Vec::new();
        storage.try_reserve_exact(bytes)?;
        storage.resize(bytes, 0);

        Ok(Self {
            buffer: storage.into_boxed_slice(),
            frame_bytes,
            capacity,
            head: 0,
            count: 0,
            overflow: 0,
            memory_locked: false,
        })
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    pub fn lock_memory(&mut self) -> bool {
        if self.memory_locked {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.buffer.len()) };

        if result == 0 {
            self.memory_locked = true;
            log::debug!("Ring buffer memory locked: {} bytes", self.buffer.len());
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&mut self) {
        if !self.memory_locked {
            return;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.buffer.len());
        }

        self.memory_locked = false;
        log::debug!("Ring buffer memory unlocked");
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前填充帧数
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 剩余可写帧数
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.count
    }

    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// 累计溢出帧数
    #[inline]
    pub fn overflow_count(&self) -> u64 {
        self.overflow
    }

    /// 记录溢出（调用方丢弃了 `frames` 帧）
    #[inline]
    pub fn record_overflow(&mut self, frames: usize) {
        self.overflow += frames as u64;
    }

    /// 底层存储地址，用于判断两端是否共享同一块内存
    #[inline]
    pub fn storage_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    #[inline]
    fn tail(&self) -> usize {
        (self.head + self.count) % self.capacity
    }

    /// 连续可写区间（从写游标到环尾或到读游标）
    pub fn writable_span(&mut self) -> &mut [u8] {
        let tail = self.tail();
        let frames = self.free().min(self.capacity - tail);
        let start = tail * self.frame_bytes;
        &mut self.buffer[start..start + frames * self.frame_bytes]
    }

    /// 提交 `frames` 帧已写入 `writable_span()` 的数据
    pub fn commit(&mut self, frames: usize) {
        debug_assert!(frames <= self.free(), "ring invariant violated: commit > free");
        self.count += frames.min(self.free());
    }

    /// 连续可读区间（从读游标开始）
    pub fn readable_span(&self) -> &[u8] {
        let frames = self.count.min(self.capacity - self.head);
        let start = self.head * self.frame_bytes;
        &self.buffer[start..start + frames * self.frame_bytes]
    }

    /// 消费 `frames` 帧（读游标前移）
    pub fn consume(&mut self, frames: usize) {
        let frames = frames.min(self.count);
        self.head = (self.head + frames) % self.capacity;
        self.count -= frames;
    }

    /// 追加交错帧数据
    ///
    /// 超出剩余空间的部分被截断并计入溢出计数，返回实际写入的帧数
    pub fn push(&mut self, data: &[u8]) -> usize {
        let frames = data.len() / self.frame_bytes;
        let to_write = frames.min(self.free());
        if to_write < frames {
            self.record_overflow(frames - to_write);
        }

        let frame_bytes = self.frame_bytes;
        let mut done = 0;
        while done < to_write {
            let span = self.writable_span();
            let n = (span.len() / frame_bytes).min(to_write - done);
            let src = &data[done * frame_bytes..(done + n) * frame_bytes];
            span[..src.len()].copy_from_slice(src);
            self.commit(n);
            done += n;
        }
        to_write
    }

    /// 取出最多 `output.len() / frame_bytes` 帧，返回实际帧数
    pub fn pop_into(&mut self, output: &mut [u8]) -> usize {
        let wanted = (output.len() / self.frame_bytes).min(self.count);
        let mut done = 0;
        while done < wanted {
            let span = self.readable_span();
            let n = (span.len() / self.frame_bytes).min(wanted - done);
            let bytes = n * self.frame_bytes;
            output[done * self.frame_bytes..done * self.frame_bytes + bytes]
                .copy_from_slice(&span[..bytes]);
            self.consume(n);
            done += n;
        }
        wanted
    }

    /// 追加 `frames` 帧静音，受剩余空间限制，返回实际追加帧数
    pub fn push_silence(&mut self, frames: usize, format: SampleFormat) -> usize {
        let to_write = frames.min(self.free());
        let frame_bytes = self.frame_bytes;
        let mut done = 0;
        while done < to_write {
            let span = self.writable_span();
            let n = (span.len() / frame_bytes).min(to_write - done);
            format.fill_silence(&mut span[..n * frame_bytes]);
            self.commit(n);
            done += n;
        }
        to_write
    }

    /// 丢弃最旧的 `frames` 帧，返回实际丢弃帧数
    pub fn discard(&mut self, frames: usize) -> usize {
        let n = frames.min(self.count);
        self.consume(n);
        n
    }

    /// 重复最新的一帧 `frames` 次（用于简单同步模式插帧）
    pub fn repeat_last(&mut self, frames: usize) -> usize {
        if self.count == 0 {
            return 0;
        }
        let fb = self.frame_bytes;
        let last = (self.head + self.count - 1) % self.capacity;
        let start = last * fb;

        let to_write = frames.min(self.free());
        for _ in 0..to_write {
            let tail = self.tail() * fb;
            self.buffer.copy_within(start..start + fb, tail);
            self.count += 1;
        }
        to_write
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
