//! 音频会话
//!
//! 每个客户端连接对应一个会话，负责：
//! - 格式协商与生命周期（configure → prepare → start/stop/pause → release）
//! - 持有后端流（reflector 模式下 pacer + mirror，否则单一真实流）
//! - 播放游标（只由 pacer 或直连流报告的帧数推进）
//!
//! 协议操作在连接线程上顺序执行，设备变化通知来自独立线程，
//! 因此所有涉及流句柄和状态的操作都在同一把会话锁内完成。

pub mod recovery;
mod streams;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::audio::format::{PcmView, SampleFormat, StreamParams};
use crate::audio::stats::SessionStats;
use crate::audio::timing;
use crate::backend::AudioBackend;
use crate::shm::SharedBuffer;

pub use recovery::{RecoveryOutcome, RecoveryPolicy};
use streams::Streams;

/// 会话标识
pub type SessionId = u64;

/// 输出策略，连接建立时确定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// pacer 计帧 + 可重建的 mirror 硬件流
    Reflector,
    /// 单一真实流
    Direct,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Prepared,
    Playing,
    Paused,
    Closed,
}

/// 锁内状态
struct SessionInner {
    /// 客户端协商的参数，下一次 prepare 生效
    requested: StreamParams,
    /// prepare 时固定下来的参数，流和写入都用它
    active: StreamParams,
    frame_bytes: usize,
    cursor_frames: u64,
    state: SessionState,
    streams: Option<Streams>,
    shared_buffer: Option<SharedBuffer>,
    // 共享内存写入先拷贝到这里，再交给流
    shared_scratch: Vec<u8>,
    /// prepare/release/恢复开始时递增，用于让进行中的恢复失效
    epoch: u64,
}

/// 音频会话
pub struct AudioSession {
    id: SessionId,
    mode: OutputMode,
    backend: Arc<dyn AudioBackend>,
    recovery: RecoveryPolicy,
    inner: Mutex<SessionInner>,
    // epoch 变化时通知恢复线程提前结束等待
    epoch_changed: Condvar,
    stats: SessionStats,
}

impl AudioSession {
    pub fn new(
        id: SessionId,
        mode: OutputMode,
        backend: Arc<dyn AudioBackend>,
        recovery: RecoveryPolicy,
    ) -> Self {
        Self {
            id,
            mode,
            backend,
            recovery,
            inner: Mutex::new(SessionInner {
                requested: StreamParams::default(),
                active: StreamParams::default(),
                frame_bytes: 0,
                cursor_frames: 0,
                state: SessionState::Uninitialized,
                streams: None,
                shared_buffer: None,
                shared_scratch: Vec::new(),
                epoch: 0,
            }),
            epoch_changed: Condvar::new(),
            stats: SessionStats::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// 设置格式参数，不触碰后端；非法值留到 prepare 时处理
    pub fn configure(&self, format: SampleFormat, channels: u8, sample_rate: u32, buffer_frames: u32) {
        let params = StreamParams::new(format, channels, sample_rate, buffer_frames);
        log::debug!("Session {}: configured {:?}", self.id, params);
        self.inner.lock().requested = params;
    }

    /// 协商中的参数
    pub fn params(&self) -> StreamParams {
        self.inner.lock().requested
    }

    /// 挂载共享内存，之前的映射随之解除
    pub fn attach_shared_buffer(&self, buffer: SharedBuffer) {
        log::debug!(
            "Session {}: attached shared segment {} ({} bytes)",
            self.id,
            buffer.segment(),
            buffer.len()
        );
        let previous = self.inner.lock().shared_buffer.replace(buffer);
        drop(previous);
    }

    pub fn has_shared_buffer(&self) -> bool {
        self.inner.lock().shared_buffer.is_some()
    }

    /// 准备播放
    ///
    /// 总是先拆除已有的流，因此可以重复调用而不泄漏句柄。
    /// 参数无效或 pacer/直连流创建失败时停留在 `Uninitialized`。
    pub fn prepare(&self) {
        let mut inner = self.inner.lock();
        inner.cursor_frames = 0;
        inner.active = inner.requested;
        inner.frame_bytes = inner.active.frame_bytes();
        self.teardown(&mut inner);
        inner.state = SessionState::Uninitialized;
        self.stats.record_prepare();

        let params = inner.active;
        if !params.has_valid_buffer() {
            log::warn!(
                "Session {}: invalid buffer ({} frames x {} bytes), staying uninitialized",
                self.id,
                params.buffer_frames,
                inner.frame_bytes
            );
            return;
        }

        let Some(streams) = self.open_streams(&params) else {
            return;
        };
        inner.streams = Some(streams);
        inner.state = SessionState::Prepared;
        log::info!(
            "Session {}: prepared {:?} {}ch {}Hz, {} frames ({:?})",
            self.id,
            params.format,
            params.channels,
            params.sample_rate,
            params.buffer_frames,
            self.mode
        );

        Self::start_locked(&mut inner);
    }

    fn open_streams(&self, params: &StreamParams) -> Option<Streams> {
        match self.mode {
            OutputMode::Reflector => {
                let pacer = match self.backend.create_pacer(params) {
                    Ok(pacer) => pacer,
                    Err(e) => {
                        log::warn!("Session {}: failed to create pacer: {}", self.id, e);
                        return None;
                    }
                };
                let mirror = match self.backend.create_stream(params) {
                    Ok(mirror) => Some(mirror),
                    Err(e) => {
                        log::warn!(
                            "Session {}: failed to create output stream: {}, continuing pacer-only",
                            self.id,
                            e
                        );
                        None
                    }
                };
                Some(Streams::Reflector { pacer, mirror })
            }
            OutputMode::Direct => match self.backend.create_stream(params) {
                Ok(stream) => Some(Streams::Direct { stream }),
                Err(e) => {
                    log::warn!("Session {}: failed to create output stream: {}", self.id, e);
                    None
                }
            },
        }
    }

    pub fn start(&self) {
        Self::start_locked(&mut self.inner.lock());
    }

    fn start_locked(inner: &mut SessionInner) {
        if inner.state == SessionState::Playing {
            return;
        }
        let Some(streams) = inner.streams.as_mut() else {
            return;
        };
        streams.start();
        inner.state = SessionState::Playing;
    }

    /// 停止播放，回到 `Prepared`
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(streams) = inner.streams.as_mut() {
            streams.stop();
            inner.state = SessionState::Prepared;
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if let Some(streams) = inner.streams.as_mut() {
            streams.pause();
            inner.state = SessionState::Paused;
        }
    }

    /// 丢弃后端缓冲的数据，状态不变
    pub fn drain(&self) {
        if let Some(streams) = self.inner.lock().streams.as_mut() {
            streams.flush();
        }
    }

    /// 释放全部资源，可重复调用
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        let had_streams = inner.streams.is_some();
        self.teardown(&mut inner);
        // 共享内存只在这里（或被替换时）解除映射
        inner.shared_buffer = None;
        inner.shared_scratch = Vec::new();
        if inner.state != SessionState::Closed {
            inner.state = SessionState::Closed;
            log::info!(
                "Session {}: released (cursor {} frames, streams {})",
                self.id,
                inner.cursor_frames,
                if had_streams { "closed" } else { "none" }
            );
        }
    }

    /// 关闭所有流并让进行中的恢复失效
    fn teardown(&self, inner: &mut SessionInner) {
        if let Some(streams) = inner.streams.take() {
            streams.shutdown();
        }
        inner.epoch += 1;
        self.epoch_changed.notify_all();
    }

    /// 写入一段 PCM，返回游标推进的帧数
    ///
    /// 不完整的尾帧被忽略。非 `Playing` 状态下不做任何事。
    pub fn write(&self, payload: &[u8]) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != SessionState::Playing {
            return 0;
        }
        let Some(streams) = inner.streams.as_mut() else {
            return 0;
        };
        let view = PcmView::new(payload, inner.active);
        self.push_frames(streams, &mut inner.cursor_frames, &view)
    }

    /// 从共享内存写入前 `len` 字节
    pub fn write_shared(&self, len: usize) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != SessionState::Playing {
            return 0;
        }
        let Some(shared) = inner.shared_buffer.as_ref() else {
            log::debug!("Session {}: shared write without a mapped segment", self.id);
            return 0;
        };
        let Some(streams) = inner.streams.as_mut() else {
            return 0;
        };
        shared.read_into(len, &mut inner.shared_scratch);
        let view = PcmView::new(&inner.shared_scratch, inner.active);
        self.push_frames(streams, &mut inner.cursor_frames, &view)
    }

    fn push_frames(&self, streams: &mut Streams, cursor: &mut u64, view: &PcmView<'_>) -> usize {
        if view.frames() == 0 {
            return 0;
        }
        let accepted = streams.write(view, &self.stats);
        *cursor += accepted as u64;
        self.stats.record_write(accepted as u64);
        accepted
    }

    /// 协议可见的播放位置（截断到 32 位）
    pub fn position(&self) -> u32 {
        wire_position(self.inner.lock().cursor_frames)
    }

    /// 完整的 64 位游标
    pub fn cursor_frames(&self) -> u64 {
        self.inner.lock().cursor_frames
    }

    /// 缓冲延迟估计（诊断用）
    pub fn latency_millis(&self) -> u32 {
        let inner = self.inner.lock();
        timing::latency_millis(inner.requested.buffer_frames, inner.requested.sample_rate)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn frame_bytes(&self) -> usize {
        self.inner.lock().frame_bytes
    }

    /// 当前是否有可用的 mirror 流
    pub fn has_mirror(&self) -> bool {
        self.inner
            .lock()
            .streams
            .as_ref()
            .is_some_and(Streams::has_mirror)
    }

    /// 是否持有任何后端流
    pub fn has_streams(&self) -> bool {
        self.inner.lock().streams.is_some()
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AudioSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSession")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[inline]
fn wire_position(cursor_frames: u64) -> u32 {
    cursor_frames as u32
}
