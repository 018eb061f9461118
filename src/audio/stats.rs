//! 会话统计模块
//!
//! 写入路径和恢复线程都会更新计数，全部是原子操作

use std::sync::atomic::{AtomicU64, Ordering};

use super::timing::now_ns;

/// 会话统计收集器
///
/// 所有操作都是 lock-free 的
pub struct SessionStats {
    prepare_count: AtomicU64,
    write_count: AtomicU64,

    // pacer（或直连流）接受的帧数，即游标来源
    frames_accepted: AtomicU64,

    mirror_frames_written: AtomicU64,
    // mirror 不存在或写入失败时丢弃的帧数
    mirror_frames_dropped: AtomicU64,

    recovery_attempts: AtomicU64,
    recoveries_succeeded: AtomicU64,
    recoveries_exhausted: AtomicU64,
    // 最近一次恢复耗时（纳秒）
    last_recovery_ns: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            prepare_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            frames_accepted: AtomicU64::new(0),
            mirror_frames_written: AtomicU64::new(0),
            mirror_frames_dropped: AtomicU64::new(0),
            recovery_attempts: AtomicU64::new(0),
            recoveries_succeeded: AtomicU64::new(0),
            recoveries_exhausted: AtomicU64::new(0),
            last_recovery_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_prepare(&self) {
        self.prepare_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self, frames_accepted: u64) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.frames_accepted.fetch_add(frames_accepted, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mirror_written(&self, frames: u64) {
        self.mirror_frames_written.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mirror_dropped(&self, frames: u64) {
        self.mirror_frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recovery_attempt(&self) {
        self.recovery_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录恢复结束，`started_ns` 来自 `timing::now_ns()`
    pub fn record_recovery_finished(&self, succeeded: bool, started_ns: u64) {
        if succeeded {
            self.recoveries_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recoveries_exhausted.fetch_add(1, Ordering::Relaxed);
        }
        self.last_recovery_ns
            .store(now_ns().saturating_sub(started_ns), Ordering::Relaxed);
    }

    pub fn frames_accepted(&self) -> u64 {
        self.frames_accepted.load(Ordering::Relaxed)
    }

    pub fn mirror_frames_dropped(&self) -> u64 {
        self.mirror_frames_dropped.load(Ordering::Relaxed)
    }

    pub fn recovery_attempts(&self) -> u64 {
        self.recovery_attempts.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        StatsReport {
            prepare_count: self.prepare_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            mirror_frames_written: self.mirror_frames_written.load(Ordering::Relaxed),
            mirror_frames_dropped: self.mirror_frames_dropped.load(Ordering::Relaxed),
            recovery_attempts: self.recovery_attempts.load(Ordering::Relaxed),
            recoveries_succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
            recoveries_exhausted: self.recoveries_exhausted.load(Ordering::Relaxed),
            last_recovery_ns: self.last_recovery_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub prepare_count: u64,
    pub write_count: u64,
    pub frames_accepted: u64,
    pub mirror_frames_written: u64,
    pub mirror_frames_dropped: u64,
    pub recovery_attempts: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_exhausted: u64,
    pub last_recovery_ns: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Session Statistics")?;
        writeln!(f, "==================")?;
        writeln!(f, "Prepares: {}", self.prepare_count)?;
        writeln!(f, "Writes: {}", self.write_count)?;
        writeln!(f, "Frames accepted: {}", self.frames_accepted)?;
        writeln!(f)?;

        writeln!(f, "Mirror Stream:")?;
        writeln!(f, "  Frames written: {}", self.mirror_frames_written)?;
        writeln!(f, "  Frames dropped: {}", self.mirror_frames_dropped)?;
        let total = self.mirror_frames_written + self.mirror_frames_dropped;
        let drop_pct = if total > 0 {
            self.mirror_frames_dropped as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        writeln!(f, "  Drop ratio: {:.1}%", drop_pct)?;
        writeln!(f)?;

        writeln!(f, "Device Change Recovery:")?;
        writeln!(f, "  Attempts: {}", self.recovery_attempts)?;
        writeln!(f, "  Succeeded: {}", self.recoveries_succeeded)?;
        writeln!(f, "  Exhausted: {}", self.recoveries_exhausted)?;
        writeln!(
            f,
            "  Last duration: {:.2} ms",
            self.last_recovery_ns as f64 / 1_000_000.0
        )?;

        Ok(())
    }
}
