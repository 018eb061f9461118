//! 音频桥服务
//!
//! 把连接处理、请求分发和会话注册表组装在一起：
//! - `connection`: 连接建立/关闭时创建/释放会话
//! - `request`: 已解码请求到会话操作的映射
//! - `registry`: 设备变化广播

pub mod connection;
pub mod registry;
pub mod request;

use std::sync::Arc;

use crate::backend::AudioBackend;
use crate::session::RecoveryPolicy;
use crate::shm::SharedMemory;

pub use connection::{AudioConnectionHandler, Client, ConnectionHandler};
pub use registry::{DeviceChangeBroadcast, SessionRegistry};
pub use request::{Request, RequestHandler, Response};

/// 服务配置
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// 新连接是否使用 reflector 模式（连接建立后不可更改）
    pub reflector_mode: bool,
    /// 设备变化恢复策略
    pub recovery: RecoveryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reflector_mode: true,
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// 音频桥服务
///
/// 由外部连接器驱动：连接建立/关闭、已解码的请求、系统设备变化
pub struct BridgeServer {
    connections: AudioConnectionHandler,
    requests: RequestHandler,
    registry: Arc<SessionRegistry>,
}

impl BridgeServer {
    pub fn new(
        config: BridgeConfig,
        backend: Arc<dyn AudioBackend>,
        shared_memory: Arc<dyn SharedMemory>,
    ) -> Self {
        log::info!(
            "Audio bridge: reflector mode {}, recovery {} x {:?}",
            if config.reflector_mode { "on" } else { "off" },
            config.recovery.max_attempts,
            config.recovery.retry_delay
        );
        let registry = Arc::new(SessionRegistry::new());
        Self {
            connections: AudioConnectionHandler::new(config, backend, Arc::clone(&registry)),
            requests: RequestHandler::new(shared_memory),
            registry,
        }
    }

    pub fn connect(&self, client: &mut Client) {
        self.connections.handle_new_connection(client);
    }

    pub fn disconnect(&self, client: &mut Client) {
        self.connections.handle_connection_shutdown(client);
    }

    pub fn dispatch(&self, client: &Client, request: Request<'_>) -> Response {
        self.requests.handle(client, request)
    }

    /// 系统检测到输出设备变化时调用
    pub fn notify_device_changed(&self) -> DeviceChangeBroadcast {
        self.registry.notify_device_changed()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
