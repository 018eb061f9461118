//! 连接生命周期
//!
//! 连接器（socket 监听、I/O 多路复用）不在本 crate 内；
//! 这里只定义它在新连接建立和连接关闭时回调的接口，
//! 以及音频服务的实现：建立时创建会话，关闭时释放。

use std::sync::Arc;

use super::registry::SessionRegistry;
use super::BridgeConfig;
use crate::backend::AudioBackend;
use crate::session::{AudioSession, OutputMode};

/// 每个连接的收发缓冲大小
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// 连接的收发缓冲
#[derive(Debug)]
pub struct ClientIo {
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

impl ClientIo {
    fn new() -> Self {
        Self {
            input: Vec::with_capacity(IO_BUFFER_SIZE),
            output: Vec::with_capacity(IO_BUFFER_SIZE),
        }
    }
}

/// 连接器一侧的客户端
#[derive(Debug)]
pub struct Client {
    id: u64,
    io: Option<ClientIo>,
    session: Option<Arc<AudioSession>>,
}

impl Client {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            io: None,
            session: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn io_mut(&mut self) -> Option<&mut ClientIo> {
        self.io.as_mut()
    }

    pub fn has_io(&self) -> bool {
        self.io.is_some()
    }

    pub fn session(&self) -> Option<&Arc<AudioSession>> {
        self.session.as_ref()
    }
}

/// 连接器回调
pub trait ConnectionHandler: Send + Sync {
    fn handle_new_connection(&self, client: &mut Client);
    fn handle_connection_shutdown(&self, client: &mut Client);
}

/// 音频连接处理器
pub struct AudioConnectionHandler {
    mode: OutputMode,
    config: BridgeConfig,
    backend: Arc<dyn AudioBackend>,
    registry: Arc<SessionRegistry>,
}

impl AudioConnectionHandler {
    pub fn new(
        config: BridgeConfig,
        backend: Arc<dyn AudioBackend>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        let mode = if config.reflector_mode {
            OutputMode::Reflector
        } else {
            OutputMode::Direct
        };
        Self {
            mode,
            config,
            backend,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl ConnectionHandler for AudioConnectionHandler {
    fn handle_new_connection(&self, client: &mut Client) {
        client.io = Some(ClientIo::new());

        let session = Arc::new(AudioSession::new(
            self.registry.next_id(),
            self.mode,
            Arc::clone(&self.backend),
            self.config.recovery.clone(),
        ));
        self.registry.register(&session);
        log::info!(
            "Client {} connected, session {} ({:?})",
            client.id,
            session.id(),
            self.mode
        );
        client.session = Some(session);
    }

    fn handle_connection_shutdown(&self, client: &mut Client) {
        if let Some(session) = client.session.take() {
            session.release();
            self.registry.unregister(session.id());
            log::info!("Client {} disconnected, session {} closed", client.id, session.id());
        }
        client.io = None;
    }
}
