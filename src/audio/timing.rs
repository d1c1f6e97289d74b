//! 单调时钟与帧/时间换算
//!
//! 提供 CLOCK_MONOTONIC 纳秒时间戳（xrun 剖析用），
//! 以及帧数与微秒之间的换算

/// 获取当前单调时间（纳秒）
#[inline]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC 不会失败，返回值可以忽略
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// 帧数换算为微秒
#[inline]
pub fn frames_to_usec(frames: u64, rate: u32) -> u64 {
    if rate == 0 {
        return 0;
    }
    frames * 1_000_000 / rate as u64
}

/// 微秒换算为帧数（向下取整）
#[inline]
pub fn usec_to_frames(usec: u64, rate: u32) -> u64 {
    usec * rate as u64 / 1_000_000
}

/// 两个时间戳之间的间隔（微秒），时钟回退时返回 0
#[inline]
pub fn elapsed_usec(from_ns: u64, to_ns: u64) -> u64 {
    to_ns.saturating_sub(from_ns) / 1_000
}
