//! 会话的流组合
//!
//! 构造时确定策略，之后不再切换：
//! - `Reflector`: pacer 负责计帧定速，mirror 是可随时重建的硬件流
//! - `Direct`: 单一真实流
//!
//! Direct 模式下不存在 mirror，这在类型上就无法表达。

use crate::audio::format::PcmView;
use crate::audio::stats::SessionStats;
use crate::backend::StreamHandle;

pub(crate) enum Streams {
    Reflector {
        pacer: StreamHandle,
        mirror: Option<StreamHandle>,
    },
    Direct {
        stream: StreamHandle,
    },
}

impl Streams {
    /// 按固定顺序（pacer 在前）对每个句柄执行操作
    fn for_each(&mut self, mut op: impl FnMut(&mut StreamHandle)) {
        match self {
            Self::Reflector { pacer, mirror } => {
                op(pacer);
                if let Some(mirror) = mirror {
                    op(mirror);
                }
            }
            Self::Direct { stream } => op(stream),
        }
    }

    pub fn start(&mut self) {
        self.for_each(|handle| {
            if let Err(e) = handle.start() {
                log::warn!("Failed to start {:?} stream: {}", handle.kind(), e);
            }
        });
    }

    pub fn stop(&mut self) {
        self.for_each(StreamHandle::stop);
    }

    pub fn pause(&mut self) {
        self.for_each(StreamHandle::pause);
    }

    pub fn flush(&mut self) {
        self.for_each(StreamHandle::flush);
    }

    /// 停止并关闭全部句柄
    pub fn shutdown(self) {
        match self {
            Self::Reflector { pacer, mirror } => {
                pacer.shutdown();
                if let Some(mirror) = mirror {
                    mirror.shutdown();
                }
            }
            Self::Direct { stream } => stream.shutdown(),
        }
    }

    /// 写入一段 PCM，返回用于推进游标的帧数
    ///
    /// Reflector 模式下只采信 pacer 的结果；mirror 的结果只进统计。
    /// mirror 缺失（恢复中或已放弃）时数据在硬件侧直接丢弃，不缓存重放。
    pub fn write(&mut self, pcm: &PcmView<'_>, stats: &SessionStats) -> usize {
        let frames = pcm.frames();
        match self {
            Self::Reflector { pacer, mirror } => {
                let accepted = pacer.write(pcm).unwrap_or_else(|e| {
                    log::debug!("Pacer rejected {} frames: {}", frames, e);
                    0
                });

                match mirror {
                    Some(mirror) => match mirror.write(pcm) {
                        Ok(written) => {
                            stats.record_mirror_written(written as u64);
                            stats.record_mirror_dropped(frames.saturating_sub(written) as u64);
                        }
                        Err(e) => {
                            log::debug!("Mirror dropped {} frames: {}", frames, e);
                            stats.record_mirror_dropped(frames as u64);
                        }
                    },
                    None => stats.record_mirror_dropped(frames as u64),
                }

                accepted
            }
            Self::Direct { stream } => stream.write(pcm).unwrap_or_else(|e| {
                log::debug!("Stream rejected {} frames: {}", frames, e);
                0
            }),
        }
    }

    pub fn has_mirror(&self) -> bool {
        matches!(self, Self::Reflector { mirror: Some(_), .. })
    }

    /// 取出 mirror，pacer 不受影响
    pub fn take_mirror(&mut self) -> Option<StreamHandle> {
        match self {
            Self::Reflector { mirror, .. } => mirror.take(),
            Self::Direct { .. } => None,
        }
    }

    /// 采用新的 mirror；Direct 模式下原样退回
    pub fn adopt_mirror(&mut self, candidate: StreamHandle) -> Result<(), StreamHandle> {
        match self {
            Self::Reflector { mirror, .. } => {
                if let Some(previous) = mirror.replace(candidate) {
                    previous.shutdown();
                }
                Ok(())
            }
            Self::Direct { .. } => Err(candidate),
        }
    }
}
