//! 请求分发
//!
//! 协议解码器把客户端的命令帧解析成 `Request`，这里把它应用到会话上。
//! 除位置、延迟和写入帧数外，客户端只得到隐式的成功。

use std::sync::Arc;

use super::connection::Client;
use crate::audio::format::SampleFormat;
use crate::shm::{SharedBuffer, SharedMemory};

/// 已解码的客户端请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    SetParams {
        format: SampleFormat,
        channels: u8,
        sample_rate: u32,
        buffer_frames: u32,
    },
    Prepare,
    Start,
    Stop,
    Pause,
    Drain,
    Write { payload: &'a [u8] },
    /// 从已挂载的共享内存写入前 `len` 字节
    WriteShared { len: usize },
    AttachSharedMemory { segment: i32 },
    Pointer,
    Latency,
    Close,
}

/// 回给客户端的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ack,
    Frames(usize),
    Position(u32),
    Latency(u32),
}

pub struct RequestHandler {
    shared_memory: Arc<dyn SharedMemory>,
}

impl RequestHandler {
    pub fn new(shared_memory: Arc<dyn SharedMemory>) -> Self {
        Self { shared_memory }
    }

    pub fn handle(&self, client: &Client, request: Request<'_>) -> Response {
        let Some(session) = client.session() else {
            log::debug!("Client {}: request without a session: {:?}", client.id(), request);
            return Response::Ack;
        };

        match request {
            Request::SetParams {
                format,
                channels,
                sample_rate,
                buffer_frames,
            } => {
                session.configure(format, channels, sample_rate, buffer_frames);
                Response::Ack
            }
            Request::Prepare => {
                session.prepare();
                Response::Ack
            }
            Request::Start => {
                session.start();
                Response::Ack
            }
            Request::Stop => {
                session.stop();
                Response::Ack
            }
            Request::Pause => {
                session.pause();
                Response::Ack
            }
            Request::Drain => {
                session.drain();
                Response::Ack
            }
            Request::Write { payload } => Response::Frames(session.write(payload)),
            Request::WriteShared { len } => Response::Frames(session.write_shared(len)),
            Request::AttachSharedMemory { segment } => {
                match SharedBuffer::map(&self.shared_memory, segment) {
                    Ok(buffer) => session.attach_shared_buffer(buffer),
                    Err(e) => log::warn!("Session {}: {}", session.id(), e),
                }
                Response::Ack
            }
            Request::Pointer => Response::Position(session.position()),
            Request::Latency => Response::Latency(session.latency_millis()),
            Request::Close => {
                session.release();
                Response::Ack
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockState};
    use crate::server::connection::{AudioConnectionHandler, ConnectionHandler};
    use crate::server::registry::SessionRegistry;
    use crate::server::BridgeConfig;
    use crate::session::SessionState;
    use crate::shm::HeapSharedMemory;

    struct Fixture {
        connections: AudioConnectionHandler,
        requests: RequestHandler,
        heap: Arc<HeapSharedMemory>,
        backend: Arc<MockBackend>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let heap = Arc::new(HeapSharedMemory::new());
        Fixture {
            connections: AudioConnectionHandler::new(
                BridgeConfig::default(),
                backend.clone(),
                Arc::new(SessionRegistry::new()),
            ),
            requests: RequestHandler::new(heap.clone()),
            heap,
            backend,
        }
    }

    fn set_params() -> Request<'static> {
        Request::SetParams {
            format: SampleFormat::S16LE,
            channels: 2,
            sample_rate: 48000,
            buffer_frames: 960,
        }
    }

    #[test]
    fn test_playback_sequence() {
        let fx = fixture();
        let mut client = Client::new(1);
        fx.connections.handle_new_connection(&mut client);

        assert_eq!(fx.requests.handle(&client, set_params()), Response::Ack);
        assert_eq!(fx.requests.handle(&client, Request::Latency), Response::Latency(20));
        fx.requests.handle(&client, Request::Prepare);

        let payload = [0u8; 1920];
        assert_eq!(
            fx.requests.handle(&client, Request::Write { payload: &payload }),
            Response::Frames(480)
        );
        assert_eq!(fx.requests.handle(&client, Request::Pointer), Response::Position(480));

        fx.requests.handle(&client, Request::Pause);
        assert_eq!(
            fx.requests.handle(&client, Request::Write { payload: &payload }),
            Response::Frames(0)
        );

        fx.requests.handle(&client, Request::Close);
        let session = client.session().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fx.backend.state.live_pacers(), 0);
    }

    #[test]
    fn test_shared_memory_requests() {
        let fx = fixture();
        let segment = fx.heap.create_segment(vec![0u8; 4096]);
        let mut client = Client::new(2);
        fx.connections.handle_new_connection(&mut client);

        fx.requests.handle(&client, set_params());
        fx.requests.handle(&client, Request::Prepare);
        fx.requests.handle(&client, Request::AttachSharedMemory { segment });
        // 未知段只记录日志，之前的映射保留
        fx.requests.handle(&client, Request::AttachSharedMemory { segment: 999 });
        assert_eq!(
            fx.requests.handle(&client, Request::WriteShared { len: 400 }),
            Response::Frames(100)
        );

        fx.connections.handle_connection_shutdown(&mut client);
        assert_eq!(fx.heap.map_count(), 1);
        assert_eq!(fx.heap.unmap_count(), 1);
    }

    #[test]
    fn test_request_without_session_is_ignored() {
        let fx = fixture();
        let client = Client::new(3);
        assert_eq!(fx.requests.handle(&client, Request::Pointer), Response::Ack);
        assert_eq!(MockState::count(&fx.backend.state.pacer_creates), 0);
    }
}
