//! 时间相关函数
//!
//! 帧数与时长换算，以及 pacer 使用的绝对截止时间时钟

use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

/// 进程内单调时钟起点（全局缓存，只初始化一次）
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 获取当前单调时间（纳秒，相对进程内起点）
#[inline]
pub fn now_ns() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// 帧数对应的播放时长
///
/// 采样率为 0 时返回零时长
#[inline]
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = frames as u128 * 1_000_000_000 / sample_rate as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// 缓冲延迟估计（毫秒），只用于诊断
///
/// bufferFrames / sampleRate * 1000，向零取整
#[inline]
pub fn latency_millis(buffer_frames: u32, sample_rate: u32) -> u32 {
    if sample_rate == 0 {
        return 0;
    }
    (buffer_frames as u64 * 1000 / sample_rate as u64) as u32
}

/// 绝对截止时间时钟
///
/// 每次推进一段时长后睡到截止时间，避免相对睡眠累积漂移；
/// 落后时从当前时间重新开始计划。
pub struct PacingClock {
    next_wakeup: Instant,
}

impl PacingClock {
    pub fn new() -> Self {
        Self {
            next_wakeup: Instant::now(),
        }
    }

    /// 从当前时间重新开始
    pub fn reset(&mut self) {
        self.next_wakeup = Instant::now();
    }

    /// 推进截止时间并睡到该时刻
    ///
    /// 返回是否落后（截止时间已过，未睡眠）
    pub fn advance_and_wait(&mut self, period: Duration) -> bool {
        self.next_wakeup += period;

        let now = Instant::now();
        if now >= self.next_wakeup {
            // 落后了：立即从现在重新计划
            self.next_wakeup = now;
            return true;
        }

        thread::sleep(self.next_wakeup - now);
        false
    }
}

impl Default for PacingClock {
    fn default() -> Self {
        Self::new()
    }
}
