//! 会话注册表
//!
//! 记录所有存活的会话，把系统级的设备变化事件广播给每一个会话。
//! 注册表只持有弱引用，会话的所有权属于连接。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::session::{AudioSession, RecoveryOutcome, SessionId};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Weak<AudioSession>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 分配会话标识
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, session: &Arc<AudioSession>) {
        self.sessions
            .lock()
            .insert(session.id(), Arc::downgrade(session));
    }

    pub fn unregister(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    /// 存活会话的快照，顺带清理已销毁的条目
    pub fn live_sessions(&self) -> Vec<Arc<AudioSession>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, weak| weak.strong_count() > 0);
        let mut live: Vec<_> = sessions.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|session| session.id());
        live
    }

    pub fn len(&self) -> usize {
        self.live_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 通知所有会话设备已变化
    ///
    /// 每个会话在独立线程上恢复，互不等待；恢复期间不持有注册表锁
    pub fn notify_device_changed(&self) -> DeviceChangeBroadcast {
        let sessions = self.live_sessions();
        log::info!("Device change, notifying {} session(s)", sessions.len());

        let pending = sessions
            .into_iter()
            .map(|session| {
                let id = session.id();
                let worker = Arc::clone(&session);
                let spawned = thread::Builder::new()
                    .name(format!("recovery-{}", id))
                    .spawn(move || worker.on_device_changed());
                match spawned {
                    Ok(handle) => Pending::Running(id, handle),
                    Err(e) => {
                        log::error!("Failed to spawn recovery thread for session {}: {}", id, e);
                        Pending::Done(id, session.on_device_changed())
                    }
                }
            })
            .collect();

        DeviceChangeBroadcast { pending }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

enum Pending {
    Running(SessionId, JoinHandle<RecoveryOutcome>),
    Done(SessionId, RecoveryOutcome),
}

/// 一次广播中各会话的恢复
///
/// 丢弃它不会取消恢复，只是不再关心结果
pub struct DeviceChangeBroadcast {
    pending: Vec<Pending>,
}

impl DeviceChangeBroadcast {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 等待全部恢复结束，按会话标识排序返回结果
    pub fn join(self) -> Vec<(SessionId, RecoveryOutcome)> {
        self.pending
            .into_iter()
            .filter_map(|pending| match pending {
                Pending::Done(id, outcome) => Some((id, outcome)),
                Pending::Running(id, handle) => match handle.join() {
                    Ok(outcome) => Some((id, outcome)),
                    Err(_) => {
                        log::error!("Recovery thread for session {} panicked", id);
                        None
                    }
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::audio::format::SampleFormat;
    use crate::backend::mock::MockBackend;
    use crate::session::{OutputMode, RecoveryPolicy};

    fn session(registry: &SessionRegistry, backend: &Arc<MockBackend>, mode: OutputMode) -> Arc<AudioSession> {
        let session = Arc::new(AudioSession::new(
            registry.next_id(),
            mode,
            backend.clone(),
            RecoveryPolicy::default(),
        ));
        session.configure(SampleFormat::S16LE, 2, 48000, 960);
        session.prepare();
        registry.register(&session);
        session
    }

    #[test]
    fn test_dead_sessions_are_pruned() {
        let registry = SessionRegistry::new();
        let backend = Arc::new(MockBackend::new());
        let first = session(&registry, &backend, OutputMode::Reflector);
        let second = session(&registry, &backend, OutputMode::Reflector);
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);

        registry.unregister(second.id());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_reaches_every_session() {
        let registry = SessionRegistry::new();
        let backend = Arc::new(MockBackend::new());
        let reflector = session(&registry, &backend, OutputMode::Reflector);
        let direct = session(&registry, &backend, OutputMode::Direct);

        let outcomes = registry.notify_device_changed().join();
        assert_eq!(
            outcomes,
            vec![
                (reflector.id(), RecoveryOutcome::Recovered { attempts: 1 }),
                (direct.id(), RecoveryOutcome::Ignored),
            ]
        );
        assert!(reflector.has_mirror());
    }

    #[test]
    fn test_sessions_recover_concurrently() {
        let registry = SessionRegistry::new();
        let backend = Arc::new(MockBackend::new());
        let sessions: Vec<_> = (0..3)
            .map(|_| session(&registry, &backend, OutputMode::Reflector))
            .collect();
        // 每个会话第一次尝试都失败
        backend.state.fail_stream_creates.store(3, Ordering::SeqCst);

        let started = Instant::now();
        let broadcast = registry.notify_device_changed();
        assert_eq!(broadcast.len(), 3);
        let outcomes = broadcast.join();

        // 串行执行需要 3 x 200ms
        assert!(started.elapsed() < Duration::from_millis(550));
        assert_eq!(outcomes.len(), 3);
        assert!(sessions.iter().all(|session| session.has_mirror()));
    }
}
