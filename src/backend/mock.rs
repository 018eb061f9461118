//! 可编排的测试后端

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{AudioBackend, BackendError, OutputStream, StreamError, StreamHandle, StreamKind};
use crate::audio::format::{PcmView, StreamParams};

#[derive(Default)]
pub(crate) struct MockState {
    pub pacer_creates: AtomicUsize,
    pub stream_creates: AtomicUsize,
    /// 接下来 N 次 create_stream 失败
    pub fail_stream_creates: AtomicUsize,
    pub fail_pacer_creates: AtomicBool,
    /// 接下来 N 次真实流 start 失败
    pub fail_stream_starts: AtomicUsize,

    live_pacers: AtomicUsize,
    live_streams: AtomicUsize,
    closes: AtomicUsize,

    pub pacer_starts: AtomicUsize,
    pub stream_starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub pauses: AtomicUsize,
    pub flushes: AtomicUsize,

    /// 覆盖各类流报告的消耗帧数（None = 全部消耗）
    pub pacer_report: Mutex<Option<usize>>,
    pub stream_report: Mutex<Option<usize>>,
    pub pacer_frames: AtomicUsize,
    pub stream_frames: AtomicUsize,

    pub stream_create_times: Mutex<Vec<Instant>>,
    pub last_payload: Mutex<Vec<u8>>,
}

impl MockState {
    pub fn live_pacers(&self) -> usize {
        self.live_pacers.load(Ordering::SeqCst)
    }

    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// 原子地消耗一次预设失败
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct MockBackend {
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }
}

impl AudioBackend for MockBackend {
    fn create_pacer(&self, params: &StreamParams) -> Result<StreamHandle, BackendError> {
        self.state.pacer_creates.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_pacer_creates.load(Ordering::SeqCst) {
            return Err(BackendError::InvalidParams(*params));
        }
        self.state.live_pacers.fetch_add(1, Ordering::SeqCst);
        Ok(StreamHandle::new(
            StreamKind::Pacer,
            Box::new(MockStream {
                kind: StreamKind::Pacer,
                state: Arc::clone(&self.state),
            }),
        ))
    }

    fn create_stream(&self, _params: &StreamParams) -> Result<StreamHandle, BackendError> {
        self.state.stream_creates.fetch_add(1, Ordering::SeqCst);
        self.state.stream_create_times.lock().push(Instant::now());
        if MockState::take_failure(&self.state.fail_stream_creates) {
            return Err(BackendError::DeviceUnavailable);
        }
        self.state.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(StreamHandle::new(
            StreamKind::Output,
            Box::new(MockStream {
                kind: StreamKind::Output,
                state: Arc::clone(&self.state),
            }),
        ))
    }
}

struct MockStream {
    kind: StreamKind,
    state: Arc<MockState>,
}

impl OutputStream for MockStream {
    fn start(&mut self) -> Result<(), StreamError> {
        match self.kind {
            StreamKind::Pacer => {
                self.state.pacer_starts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            StreamKind::Output => {
                self.state.stream_starts.fetch_add(1, Ordering::SeqCst);
                if MockState::take_failure(&self.state.fail_stream_starts) {
                    Err(StreamError::Status(-899))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn stop(&mut self) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn pause(&mut self) {
        self.state.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&mut self) {
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn write(&mut self, pcm: &PcmView<'_>) -> Result<usize, StreamError> {
        let frames = pcm.frames();
        let (report, total) = match self.kind {
            StreamKind::Pacer => (*self.state.pacer_report.lock(), &self.state.pacer_frames),
            StreamKind::Output => (*self.state.stream_report.lock(), &self.state.stream_frames),
        };
        let consumed = report.unwrap_or(frames).min(frames);
        total.fetch_add(consumed, Ordering::SeqCst);
        *self.state.last_payload.lock() = pcm.bytes().to_vec();
        Ok(consumed)
    }

    fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        match self.kind {
            StreamKind::Pacer => self.state.live_pacers.fetch_sub(1, Ordering::SeqCst),
            StreamKind::Output => self.state.live_streams.fetch_sub(1, Ordering::SeqCst),
        };
    }
}
