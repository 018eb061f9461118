//! 设备变化恢复
//!
//! 耳机插拔、蓝牙断连等路由变化只会让真实输出流失效，pacer 不受影响。
//! 收到通知后丢弃旧的 mirror，在有限次数内重建一个新的；
//! 期间写入照常推进游标，硬件侧的数据直接丢弃。
//!
//! 重试等待在会话的条件变量上进行，不持有会话锁；
//! prepare/release 或更新的一次恢复都会递增 epoch，让本次恢复提前结束。

use std::time::Duration;

use super::{AudioSession, OutputMode, SessionState};
use crate::audio::timing::now_ns;
use crate::backend::StreamHandle;

/// 恢复策略
#[derive(Clone, Debug)]
pub struct RecoveryPolicy {
    /// 最多尝试次数
    pub max_attempts: u32,
    /// 两次尝试之间的间隔
    pub retry_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// 一次恢复的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// 直连模式，交给上层重连
    Ignored,
    /// 会话没有可用的 pacer
    NotPrepared,
    /// 新的 mirror 已就位
    Recovered { attempts: u32 },
    /// 全部尝试失败，继续以 pacer-only 运行
    Exhausted { attempts: u32 },
    /// 被 prepare/release 或新的恢复取代
    Superseded { attempts: u32 },
}

enum Adoption {
    Adopted,
    StartFailed,
    Superseded,
}

impl AudioSession {
    /// 处理设备变化通知
    ///
    /// 在通知方的线程上执行，可能阻塞数百毫秒
    pub fn on_device_changed(&self) -> RecoveryOutcome {
        if self.mode == OutputMode::Direct {
            log::debug!("Session {}: device change ignored in direct mode", self.id);
            return RecoveryOutcome::Ignored;
        }

        let started = now_ns();
        let (epoch, params) = {
            let mut inner = self.inner.lock();
            let Some(streams) = inner.streams.as_mut() else {
                return RecoveryOutcome::NotPrepared;
            };
            if let Some(old) = streams.take_mirror() {
                log::info!("Session {}: device changed, dropping output stream", self.id);
                old.shutdown();
            }
            inner.epoch += 1;
            self.epoch_changed.notify_all();
            (inner.epoch, inner.active)
        };

        let max_attempts = self.recovery.max_attempts;
        for attempt in 1..=max_attempts {
            self.stats.record_recovery_attempt();

            match self.backend.create_stream(&params) {
                Ok(candidate) => match self.try_adopt(candidate, epoch) {
                    Adoption::Adopted => {
                        log::info!(
                            "Session {}: output stream rebuilt after {} attempt(s)",
                            self.id,
                            attempt
                        );
                        self.stats.record_recovery_finished(true, started);
                        return RecoveryOutcome::Recovered { attempts: attempt };
                    }
                    Adoption::StartFailed => {}
                    Adoption::Superseded => {
                        log::debug!("Session {}: recovery superseded", self.id);
                        return RecoveryOutcome::Superseded { attempts: attempt };
                    }
                },
                Err(e) => {
                    log::debug!(
                        "Session {}: recovery attempt {}/{} failed: {}",
                        self.id,
                        attempt,
                        max_attempts,
                        e
                    );
                }
            }

            if attempt < max_attempts && !self.wait_retry(epoch) {
                log::debug!("Session {}: recovery superseded", self.id);
                return RecoveryOutcome::Superseded { attempts: attempt };
            }
        }

        log::warn!(
            "Session {}: failed to rebuild output stream after {} attempts, continuing pacer-only",
            self.id,
            max_attempts
        );
        self.stats.record_recovery_finished(false, started);
        RecoveryOutcome::Exhausted {
            attempts: max_attempts,
        }
    }

    /// 在会话锁内采用候选流
    ///
    /// 未被采用的候选流在返回时随 Drop 关闭
    fn try_adopt(&self, mut candidate: StreamHandle, epoch: u64) -> Adoption {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.epoch != epoch {
            return Adoption::Superseded;
        }
        let Some(streams) = inner.streams.as_mut() else {
            return Adoption::Superseded;
        };

        // 暂停或停止时只采用不启动，下一次 start 会启动它
        if inner.state == SessionState::Playing {
            if let Err(e) = candidate.start() {
                log::warn!("Session {}: failed to start rebuilt stream: {}", self.id, e);
                return Adoption::StartFailed;
            }
        }

        match streams.adopt_mirror(candidate) {
            Ok(()) => Adoption::Adopted,
            Err(_) => Adoption::Superseded,
        }
    }

    /// 等待重试间隔；epoch 变化时提前返回 false
    fn wait_retry(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return false;
        }
        self.epoch_changed
            .wait_while_for(&mut inner, |inner| inner.epoch == epoch, self.recovery.retry_delay);
        inner.epoch == epoch
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::audio::format::SampleFormat;
    use crate::backend::mock::{MockBackend, MockState};

    fn prepared(mode: OutputMode, policy: RecoveryPolicy) -> (Arc<AudioSession>, Arc<MockState>) {
        let backend = MockBackend::new();
        let state = Arc::clone(&backend.state);
        let session = Arc::new(AudioSession::new(7, mode, Arc::new(backend), policy));
        session.configure(SampleFormat::S16LE, 2, 48000, 960);
        session.prepare();
        (session, state)
    }

    #[test]
    fn test_recovers_on_third_attempt() {
        let (session, state) = prepared(OutputMode::Reflector, RecoveryPolicy::default());
        state.fail_stream_creates.store(2, Ordering::SeqCst);

        let started = Instant::now();
        let outcome = session.on_device_changed();
        let elapsed = started.elapsed();

        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 3 });
        assert!(elapsed >= Duration::from_millis(400), "{:?}", elapsed);
        assert!(session.has_mirror());
        assert_eq!(state.live_streams(), 1);
        assert_eq!(session.stats().recovery_attempts(), 3);

        // 1 次 prepare + 3 次恢复
        let times = state.stream_create_times.lock();
        assert_eq!(times.len(), 4);
        assert!(times[2] - times[1] >= Duration::from_millis(200));
        assert!(times[3] - times[2] >= Duration::from_millis(200));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RecoveryPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_millis(10),
        };
        let (session, state) = prepared(OutputMode::Reflector, policy);
        state.fail_stream_creates.store(100, Ordering::SeqCst);

        assert_eq!(
            session.on_device_changed(),
            RecoveryOutcome::Exhausted { attempts: 5 }
        );
        assert_eq!(MockState::count(&state.stream_creates), 6);
        assert!(!session.has_mirror());

        // pacer-only 时游标照常推进
        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(session.write(&[0u8; 1920]), 480);
        assert_eq!(session.stats().mirror_frames_dropped(), 480);
    }

    #[test]
    fn test_writes_continue_while_recovery_runs() {
        let policy = RecoveryPolicy {
            max_attempts: 4,
            retry_delay: Duration::from_millis(30),
        };
        let (session, state) = prepared(OutputMode::Reflector, policy);
        state.fail_stream_creates.store(3, Ordering::SeqCst);
        let done = Arc::new(AtomicBool::new(false));

        // 连接线程持续写入，恢复在当前线程拆除并重建 mirror
        let writer = {
            let session = Arc::clone(&session);
            let state = Arc::clone(&state);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let period = [0u8; 1920];
                let mut written = 0u64;
                let mut max_live = 0;
                while !done.load(Ordering::SeqCst) {
                    assert_eq!(session.write(&period), 480);
                    written += 480;
                    max_live = max_live.max(state.live_streams());
                    thread::sleep(Duration::from_millis(1));
                }
                (written, max_live)
            })
        };

        let outcome = session.on_device_changed();
        done.store(true, Ordering::SeqCst);
        let (written, max_live) = writer.join().unwrap();

        assert_eq!(outcome, RecoveryOutcome::Recovered { attempts: 4 });
        assert!(max_live <= 1, "{} live output streams", max_live);
        assert_eq!(state.live_streams(), 1);

        // 游标只跟随 pacer；mirror 缺席期间的帧计入丢弃
        assert_eq!(session.cursor_frames(), written);
        assert_eq!(MockState::count(&state.pacer_frames) as u64, written);
        let dropped = session.stats().mirror_frames_dropped();
        assert!(dropped > 0);
        assert_eq!(MockState::count(&state.stream_frames) as u64 + dropped, written);

        // 恢复后的写入到达新的 mirror
        let mirrored = MockState::count(&state.stream_frames);
        assert_eq!(session.write(&[0u8; 1920]), 480);
        assert_eq!(MockState::count(&state.stream_frames), mirrored + 480);
    }

    #[test]
    fn test_recovery_while_paused_does_not_start() {
        let (session, state) = prepared(OutputMode::Reflector, RecoveryPolicy::default());
        session.pause();
        let starts_before = MockState::count(&state.stream_starts);

        assert_eq!(
            session.on_device_changed(),
            RecoveryOutcome::Recovered { attempts: 1 }
        );
        assert!(session.has_mirror());
        assert_eq!(MockState::count(&state.stream_starts), starts_before);

        // 下一次 start 启动新的 mirror
        session.start();
        assert_eq!(MockState::count(&state.stream_starts), starts_before + 1);
    }

    #[test]
    fn test_start_failure_closes_candidate() {
        let policy = RecoveryPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_millis(5),
        };
        let (session, state) = prepared(OutputMode::Reflector, policy);
        state.fail_stream_starts.store(1, Ordering::SeqCst);

        assert_eq!(
            session.on_device_changed(),
            RecoveryOutcome::Recovered { attempts: 2 }
        );
        // 旧 mirror + 启动失败的候选
        assert_eq!(state.closes(), 2);
        assert_eq!(state.live_streams(), 1);
    }

    #[test]
    fn test_direct_mode_ignores_device_change() {
        let (session, state) = prepared(OutputMode::Direct, RecoveryPolicy::default());
        assert_eq!(session.on_device_changed(), RecoveryOutcome::Ignored);
        assert_eq!(MockState::count(&state.stream_creates), 1);
        assert_eq!(state.closes(), 0);
    }

    #[test]
    fn test_unprepared_session() {
        let backend = Arc::new(MockBackend::new());
        let session = AudioSession::new(3, OutputMode::Reflector, backend, RecoveryPolicy::default());
        assert_eq!(session.on_device_changed(), RecoveryOutcome::NotPrepared);
    }

    #[test]
    fn test_release_supersedes_recovery() {
        let policy = RecoveryPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_secs(10),
        };
        let (session, state) = prepared(OutputMode::Reflector, policy);
        state.fail_stream_creates.store(100, Ordering::SeqCst);

        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.on_device_changed())
        };

        // 等恢复线程进入第一次重试等待
        while session.stats().recovery_attempts() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        let started = Instant::now();
        session.release();

        let outcome = worker.join().unwrap();
        assert_eq!(outcome, RecoveryOutcome::Superseded { attempts: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(state.live_streams(), 0);
        assert_eq!(state.live_pacers(), 0);
    }

    #[test]
    fn test_prepare_discards_stale_candidate() {
        let policy = RecoveryPolicy {
            max_attempts: 2,
            retry_delay: Duration::from_secs(10),
        };
        let (session, state) = prepared(OutputMode::Reflector, policy);
        state.fail_stream_creates.store(1, Ordering::SeqCst);

        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.on_device_changed())
        };
        // 等第一次失败被消耗，之后 prepare 才能创建成功
        while state.fail_stream_creates.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        session.prepare();

        assert_eq!(
            worker.join().unwrap(),
            RecoveryOutcome::Superseded { attempts: 1 }
        );
        // 只剩新 prepare 创建的一对
        assert_eq!(state.live_pacers(), 1);
        assert_eq!(state.live_streams(), 1);
        assert!(session.has_mirror());
    }
}
