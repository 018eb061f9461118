//! 模拟硬件输出
//!
//! 代替真实声卡：输出路由可以被“拔出”和“插回”，
//! 路由每变化一次，之前创建的输出流都会失效（写入/启动返回 Disconnected），
//! 与耳机插拔、蓝牙断连时真实后端的表现一致。
//! pacer 流不依赖路由。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::pacer::{PacerConfig, PacerStream};
use super::{AudioBackend, BackendError, OutputStream, StreamError, StreamHandle, StreamKind};
use crate::audio::format::{PcmView, StreamParams};

/// 输出路由
pub struct OutputRoute {
    connected: AtomicBool,
    generation: AtomicU64,
    name: Mutex<String>,
}

impl OutputRoute {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            name: Mutex::new(name.to_string()),
        })
    }

    /// 拔出当前设备
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        log::info!("Output route '{}' disconnected", self.name.lock());
    }

    /// 接入新设备
    pub fn connect(&self, name: &str) {
        *self.name.lock() = name.to_string();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.connected.store(true, Ordering::Release);
        log::info!("Output route connected to '{}'", name);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }
}

/// 设备端计量，所有输出流共享
#[derive(Default)]
pub struct DeviceMeter {
    frames_played: AtomicU64,
    peak: AtomicU32,
}

impl DeviceMeter {
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    /// 峰值电平（左对齐 i32 量程）
    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// 模拟后端：pacer 使用软件实现，输出流挂在模拟路由上
pub struct SimulatedBackend {
    route: Arc<OutputRoute>,
    pacer: PacerConfig,
    meter: Arc<DeviceMeter>,
}

impl SimulatedBackend {
    pub fn new(route: Arc<OutputRoute>, pacer: PacerConfig) -> Self {
        Self {
            route,
            pacer,
            meter: Arc::new(DeviceMeter::default()),
        }
    }

    pub fn route(&self) -> &Arc<OutputRoute> {
        &self.route
    }

    pub fn meter(&self) -> &Arc<DeviceMeter> {
        &self.meter
    }
}

impl AudioBackend for SimulatedBackend {
    fn create_pacer(&self, params: &StreamParams) -> Result<StreamHandle, BackendError> {
        let pacer = PacerStream::spawn(params, &self.pacer)?;
        Ok(StreamHandle::new(StreamKind::Pacer, Box::new(pacer)))
    }

    fn create_stream(&self, params: &StreamParams) -> Result<StreamHandle, BackendError> {
        if !self.route.is_connected() {
            return Err(BackendError::DeviceUnavailable);
        }
        if params.frame_bytes() == 0 || params.sample_rate == 0 {
            return Err(BackendError::InvalidParams(*params));
        }

        let stream = DeviceStream {
            route: Arc::clone(&self.route),
            generation: self.route.generation(),
            meter: Arc::clone(&self.meter),
            running: false,
            closed: false,
        };
        log::debug!(
            "Output stream opened on '{}' ({:?} {}ch {}Hz)",
            self.route.name(),
            params.format,
            params.channels,
            params.sample_rate
        );
        Ok(StreamHandle::new(StreamKind::Output, Box::new(stream)))
    }
}

/// 模拟硬件流
struct DeviceStream {
    route: Arc<OutputRoute>,
    // 创建时的路由代数，路由变化后本流失效
    generation: u64,
    meter: Arc<DeviceMeter>,
    running: bool,
    closed: bool,
}

impl DeviceStream {
    fn check_route(&self) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if self.route.generation() != self.generation {
            return Err(StreamError::Disconnected);
        }
        Ok(())
    }
}

impl OutputStream for DeviceStream {
    fn start(&mut self) -> Result<(), StreamError> {
        self.check_route()?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn pause(&mut self) {
        self.running = false;
    }

    fn flush(&mut self) {}

    fn write(&mut self, pcm: &PcmView<'_>) -> Result<usize, StreamError> {
        self.check_route()?;
        if !self.running {
            return Err(StreamError::NotRunning);
        }

        let frames = pcm.frames();
        self.meter
            .frames_played
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.meter.peak.fetch_max(pcm.peak(), Ordering::Relaxed);
        Ok(frames)
    }

    fn close(&mut self) {
        self.closed = true;
        self.running = false;
    }
}
