//! 原生音频后端边界
//!
//! 会话只通过这里的 trait 访问后端：
//! - `AudioBackend`: 创建 pacer 流和真实输出流
//! - `OutputStream`: 单个流的启动/停止/写入
//! - `StreamHandle`: 独占所有权的流句柄，Drop 时自动关闭
//!
//! 后端失败只表现为错误值，从不 panic

pub mod device;
pub mod pacer;

#[cfg(test)]
pub(crate) mod mock;

use thiserror::Error;

use crate::audio::format::{PcmView, StreamParams};
use crate::audio::ring_buffer::RingAllocError;

pub use device::{OutputRoute, SimulatedBackend};
pub use pacer::{PacerConfig, PacerStream};

/// 流操作错误
#[derive(Debug, Error)]
pub enum StreamError {
    /// 后端返回的非零状态码
    #[error("backend status {0}")]
    Status(i32),
    #[error("stream is not running")]
    NotRunning,
    #[error("output device disconnected")]
    Disconnected,
    #[error("stream is closed")]
    Closed,
}

/// 流创建错误
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no output device available")]
    DeviceUnavailable,
    #[error("invalid stream parameters: {0:?}")]
    InvalidParams(StreamParams),
    #[error("stream buffer unavailable: {0}")]
    OutOfMemory(#[from] RingAllocError),
    #[error("failed to spawn stream thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// 流的种类
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// 纯软件流，只计帧和定速，不发声
    Pacer,
    /// 真实硬件输出流
    Output,
}

/// 后端流原语
///
/// `stop`/`pause`/`flush`/`close` 不返回结果；`close` 必须幂等
pub trait OutputStream: Send {
    fn start(&mut self) -> Result<(), StreamError>;
    fn stop(&mut self);
    fn pause(&mut self);
    fn flush(&mut self);
    /// 写入视图中的全部帧，返回后端实际消耗的帧数
    fn write(&mut self, pcm: &PcmView<'_>) -> Result<usize, StreamError>;
    fn close(&mut self);
}

/// 原生音频后端
pub trait AudioBackend: Send + Sync {
    /// 创建 pacer 流（不产生可听输出）
    fn create_pacer(&self, params: &StreamParams) -> Result<StreamHandle, BackendError>;
    /// 创建真实输出流
    fn create_stream(&self, params: &StreamParams) -> Result<StreamHandle, BackendError>;
}

/// 流句柄
///
/// 不可复制，只能移动；离开作用域时关闭底层流，
/// 任何提前返回的路径都不会泄漏。
pub struct StreamHandle {
    kind: StreamKind,
    stream: Box<dyn OutputStream>,
    closed: bool,
}

impl StreamHandle {
    pub fn new(kind: StreamKind, stream: Box<dyn OutputStream>) -> Self {
        Self {
            kind,
            stream,
            closed: false,
        }
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn start(&mut self) -> Result<(), StreamError> {
        self.stream.start()
    }

    pub fn stop(&mut self) {
        self.stream.stop();
    }

    pub fn pause(&mut self) {
        self.stream.pause();
    }

    pub fn flush(&mut self) {
        self.stream.flush();
    }

    #[inline]
    pub fn write(&mut self, pcm: &PcmView<'_>) -> Result<usize, StreamError> {
        self.stream.write(pcm)
    }

    /// 停止并关闭
    pub fn shutdown(mut self) {
        self.stream.stop();
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stream.close();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close_inner();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("kind", &self.kind)
            .field("closed", &self.closed)
            .finish()
    }
}
