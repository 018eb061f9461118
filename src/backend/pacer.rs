//! 软件 pacer 流（虚拟声卡）
//!
//! 不产生任何声音，只按采样率消耗数据：
//! - 生产者（会话写入）把字节推入 ring，满了就等待，背压即定速
//! - 消费线程每次消耗约 10ms 的数据，按绝对截止时间睡眠，避免漂移
//!
//! 硬件路由变化不会影响 pacer，因此客户端看到的播放位置可以持续推进。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{BackendError, OutputStream, StreamError};
use crate::audio::format::{PcmView, StreamParams};
use crate::audio::ring_buffer::ByteRing;
use crate::audio::timing::PacingClock;

/// Pacer 配置
#[derive(Clone, Debug)]
pub struct PacerConfig {
    /// 每次消耗的时长（毫秒）
    pub chunk_millis: u32,
    /// 写入方等待空间的单次超时
    pub write_timeout: Duration,
    /// 消费线程是否尝试 SCHED_FIFO
    pub realtime_priority: bool,
    /// 是否 mlock ring buffer
    pub lock_memory: bool,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            chunk_millis: 10,
            write_timeout: Duration::from_millis(100),
            realtime_priority: true,
            lock_memory: false,
        }
    }
}

/// Pacer 状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PacerState {
    Stopped,
    Running,
    Paused,
    Closed,
}

/// 消费线程与写入方共享的状态
///
/// ring buffer 本身无锁；`state` 锁只用于等待/唤醒和 flush
struct PacerShared {
    ring: ByteRing,
    state: Mutex<PacerState>,
    not_full: Condvar,
    not_empty: Condvar,
    frame_bytes: usize,
    sample_rate: u32,
    chunk_bytes: usize,
    consumed_bytes: AtomicU64,
}

impl PacerShared {
    /// 消耗 `bytes` 字节对应的时长
    fn chunk_duration(&self, bytes: usize) -> Duration {
        let per_second = self.frame_bytes as u128 * self.sample_rate as u128;
        Duration::from_nanos((bytes as u128 * 1_000_000_000 / per_second) as u64)
    }
}

/// 软件 pacer 流
pub struct PacerStream {
    shared: Arc<PacerShared>,
    consumer: Option<JoinHandle<()>>,
    write_timeout: Duration,
}

impl PacerStream {
    /// 创建 pacer 并启动（空闲的）消费线程
    pub fn spawn(params: &StreamParams, config: &PacerConfig) -> Result<Self, BackendError> {
        if !params.has_valid_buffer() || params.sample_rate == 0 {
            return Err(BackendError::InvalidParams(*params));
        }

        let frame_bytes = params.frame_bytes();
        let ring = ByteRing::with_min_capacity(params.buffer_bytes())?;
        if config.lock_memory {
            ring.lock_memory();
        }

        let chunk_frames =
            (params.sample_rate as u64 * config.chunk_millis as u64 / 1000).max(1) as usize;

        let shared = Arc::new(PacerShared {
            ring,
            state: Mutex::new(PacerState::Stopped),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            frame_bytes,
            sample_rate: params.sample_rate,
            chunk_bytes: chunk_frames * frame_bytes,
            consumed_bytes: AtomicU64::new(0),
        });

        let realtime = config.realtime_priority;
        let consumer_shared = Arc::clone(&shared);
        let consumer = thread::Builder::new()
            .name("pacer".to_string())
            .spawn(move || consumer_main(consumer_shared, realtime))?;

        log::debug!(
            "Pacer created: {} bytes ring, {} byte chunks ({}Hz, {} bytes/frame)",
            shared.ring.capacity(),
            shared.chunk_bytes,
            params.sample_rate,
            frame_bytes
        );

        Ok(Self {
            shared,
            consumer: Some(consumer),
            write_timeout: config.write_timeout,
        })
    }

    /// 已被消费线程消耗的帧数
    pub fn consumed_frames(&self) -> u64 {
        self.shared.consumed_bytes.load(Ordering::Relaxed) / self.shared.frame_bytes as u64
    }

    /// 当前缓冲的字节数
    pub fn buffered_bytes(&self) -> usize {
        self.shared.ring.len()
    }

    fn set_idle(&mut self) {
        let mut state = self.shared.state.lock();
        if *state == PacerState::Running {
            *state = PacerState::Paused;
            // 唤醒等待空间的写入方和等待数据的消费线程，让它们看到状态变化
            self.shared.not_full.notify_all();
            self.shared.not_empty.notify_all();
        }
    }
}

impl OutputStream for PacerStream {
    fn start(&mut self) -> Result<(), StreamError> {
        let mut state = self.shared.state.lock();
        match *state {
            PacerState::Closed => Err(StreamError::Closed),
            PacerState::Running => Ok(()),
            PacerState::Stopped | PacerState::Paused => {
                *state = PacerState::Running;
                self.shared.not_empty.notify_all();
                Ok(())
            }
        }
    }

    // 停止与暂停相同：消费线程保持存活，真正的清理在 close
    fn stop(&mut self) {
        self.set_idle();
    }

    fn pause(&mut self) {
        self.set_idle();
    }

    fn flush(&mut self) {
        let _state = self.shared.state.lock();
        self.shared.ring.reset();
        self.shared.not_full.notify_all();
    }

    fn write(&mut self, pcm: &PcmView<'_>) -> Result<usize, StreamError> {
        let bytes = pcm.bytes();
        if *self.shared.state.lock() != PacerState::Running {
            return Err(StreamError::NotRunning);
        }

        let mut offset = 0;
        while offset < bytes.len() {
            let written = self.shared.ring.push(&bytes[offset..]);
            let mut state = self.shared.state.lock();
            if written > 0 {
                offset += written;
                self.shared.not_empty.notify_one();
                continue;
            }

            if *state != PacerState::Running {
                break;
            }
            if self.shared.ring.free() == 0 {
                self.shared.not_full.wait_for(&mut state, self.write_timeout);
            }
        }

        if offset == 0 && !bytes.is_empty() {
            return Err(StreamError::NotRunning);
        }
        Ok(offset / self.shared.frame_bytes)
    }

    fn close(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if *state == PacerState::Closed {
                return;
            }
            *state = PacerState::Closed;
            self.shared.not_full.notify_all();
            self.shared.not_empty.notify_all();
        }

        if let Some(consumer) = self.consumer.take() {
            if consumer.join().is_err() {
                log::error!("Pacer consumer thread panicked");
            }
        }
        log::debug!("Pacer closed");
    }
}

impl Drop for PacerStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// 消费线程主函数
///
/// 稳态循环内不记录日志
fn consumer_main(shared: Arc<PacerShared>, realtime: bool) {
    if realtime {
        set_realtime_priority();
    }

    let mut clock = PacingClock::new();

    loop {
        let consumed = {
            let mut state = shared.state.lock();
            let mut waited = false;
            loop {
                match *state {
                    PacerState::Closed => return,
                    PacerState::Running if !shared.ring.is_empty() => break,
                    _ => {
                        shared.not_empty.wait(&mut state);
                        waited = true;
                    }
                }
            }
            if waited {
                clock.reset();
            }

            let consumed = shared.ring.skip(shared.chunk_bytes);
            shared.not_full.notify_all();
            consumed
        };

        shared
            .consumed_bytes
            .fetch_add(consumed as u64, Ordering::Relaxed);
        clock.advance_and_wait(shared.chunk_duration(consumed));
    }
}

/// 尝试把消费线程设为 SCHED_FIFO（需要权限，失败则保持默认调度）
#[cfg(target_os = "linux")]
fn set_realtime_priority() {
    unsafe {
        let param = libc::sched_param {
            sched_priority: libc::sched_get_priority_max(libc::SCHED_FIFO),
        };
        let result = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if result == 0 {
            log::debug!("Pacer thread running with SCHED_FIFO");
        } else {
            log::debug!(
                "Failed to set SCHED_FIFO (error: {}), using default scheduling",
                result
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;
    use std::time::Instant;

    fn params() -> StreamParams {
        StreamParams::new(SampleFormat::S16LE, 2, 48000, 960)
    }

    fn config() -> PacerConfig {
        PacerConfig {
            realtime_priority: false,
            ..PacerConfig::default()
        }
    }

    #[test]
    fn test_rejects_invalid_params() {
        let zero_buffer = StreamParams::new(SampleFormat::S16LE, 2, 48000, 0);
        assert!(PacerStream::spawn(&zero_buffer, &config()).is_err());

        let zero_rate = StreamParams::new(SampleFormat::S16LE, 2, 0, 960);
        assert!(PacerStream::spawn(&zero_rate, &config()).is_err());
    }

    #[test]
    fn test_write_before_start_is_rejected() {
        let mut pacer = PacerStream::spawn(&params(), &config()).unwrap();
        let payload = [0u8; 1920];
        let view = PcmView::new(&payload, params());
        assert!(matches!(pacer.write(&view), Err(StreamError::NotRunning)));
        pacer.close();
    }

    #[test]
    fn test_write_reports_full_frames() {
        let mut pacer = PacerStream::spawn(&params(), &config()).unwrap();
        pacer.start().unwrap();

        let payload = [0u8; 1920];
        let view = PcmView::new(&payload, params());
        assert_eq!(pacer.write(&view).unwrap(), 480);
        pacer.close();
    }

    #[test]
    fn test_backpressure_paces_writer() {
        let mut pacer = PacerStream::spawn(&params(), &config()).unwrap();
        pacer.start().unwrap();

        // 9600 帧 = 200ms，ring 约 4096 字节（~21ms），写入方必须等待消费
        let payload = vec![0u8; 9600 * 4];
        let view = PcmView::new(&payload, params());
        let start = Instant::now();
        assert_eq!(pacer.write(&view).unwrap(), 9600);
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(150),
            "writer was not paced: {:?}",
            elapsed
        );
        assert!(pacer.consumed_frames() > 0);
        pacer.close();
    }

    #[test]
    fn test_write_while_paused_is_rejected() {
        let mut pacer = PacerStream::spawn(&params(), &config()).unwrap();
        pacer.start().unwrap();
        pacer.pause();

        let payload = [0u8; 1920];
        let view = PcmView::new(&payload, params());
        assert!(pacer.write(&view).is_err());

        pacer.start().unwrap();
        assert_eq!(pacer.write(&view).unwrap(), 480);
        pacer.close();
    }

    #[test]
    fn test_flush_discards_buffered_data() {
        let mut pacer = PacerStream::spawn(&params(), &config()).unwrap();
        pacer.start().unwrap();
        let payload = [0u8; 3840];
        let view = PcmView::new(&payload, params());
        pacer.write(&view).unwrap();
        // 暂停后 ring 不再被消费
        pacer.pause();
        pacer.flush();
        assert_eq!(pacer.buffered_bytes(), 0);
        pacer.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut pacer = PacerStream::spawn(&params(), &config()).unwrap();
        pacer.start().unwrap();
        pacer.close();
        pacer.close();
        assert!(matches!(pacer.start(), Err(StreamError::Closed)));
    }
}
