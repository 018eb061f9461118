//! 共享内存
//!
//! 客户端通过共享内存段批量传递 PCM 数据，避免经过 socket 拷贝。
//! - `SharedMemory`: 映射/解除映射的提供者接口
//! - `SharedBuffer`: 会话持有的映射视图，Drop 时解除映射（恰好一次）
//! - `SysVSharedMemory`: System V 实现（shmat/shmdt）
//! - `HeapSharedMemory`: 进程内实现，用于测试

use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// 共享内存错误
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to attach segment {segment}: {source}")]
    Attach {
        segment: i32,
        source: std::io::Error,
    },
    #[error("failed to stat segment {segment}: {source}")]
    Stat {
        segment: i32,
        source: std::io::Error,
    },
    #[error("failed to create segment: {0}")]
    Create(std::io::Error),
    #[error("failed to remove segment {segment}: {source}")]
    Remove {
        segment: i32,
        source: std::io::Error,
    },
    #[error("unknown segment {0}")]
    UnknownSegment(i32),
}

/// 一段已映射的内存
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    segment: i32,
}

// 映射地址在解除映射前对所有线程有效
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn segment(&self) -> i32 {
        self.segment
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// 共享内存提供者
pub trait SharedMemory: Send + Sync {
    fn map_segment(&self, segment: i32) -> Result<Mapping, ShmError>;
    fn unmap_segment(&self, mapping: &Mapping);
}

/// 共享内存视图
///
/// 独占映射的所有权，Drop 时通过提供者解除映射
pub struct SharedBuffer {
    mapping: Mapping,
    provider: Arc<dyn SharedMemory>,
}

impl SharedBuffer {
    pub fn map(provider: &Arc<dyn SharedMemory>, segment: i32) -> Result<Self, ShmError> {
        let mapping = provider.map_segment(segment)?;
        log::debug!("Mapped shared segment {} ({} bytes)", segment, mapping.len);
        Ok(Self {
            mapping,
            provider: Arc::clone(provider),
        })
    }

    pub fn segment(&self) -> i32 {
        self.mapping.segment
    }

    pub fn len(&self) -> usize {
        self.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    /// 把映射的前 `len` 字节拷贝到 `out`（覆盖原内容），返回拷贝的字节数
    ///
    /// 对端进程可能同时写入映射，因此只做原始拷贝，不借出指向映射的引用
    pub fn read_into(&self, len: usize, out: &mut Vec<u8>) -> usize {
        let count = len.min(self.mapping.len);
        out.clear();
        out.reserve(count);
        unsafe {
            ptr::copy_nonoverlapping(self.mapping.ptr.as_ptr(), out.as_mut_ptr(), count);
            out.set_len(count);
        }
        count
    }

    /// 从 `offset` 开始写入，返回实际写入的字节数
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> usize {
        if offset >= self.mapping.len {
            return 0;
        }
        let count = data.len().min(self.mapping.len - offset);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.mapping.ptr.as_ptr().add(offset), count);
        }
        count
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.provider.unmap_segment(&self.mapping);
        log::debug!("Unmapped shared segment {}", self.mapping.segment);
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("segment", &self.mapping.segment)
            .field("len", &self.mapping.len)
            .finish()
    }
}

/// System V 共享内存
#[derive(Debug, Default)]
pub struct SysVSharedMemory;

impl SysVSharedMemory {
    /// 创建私有段（模拟客户端时使用）
    pub fn create_private(size: usize) -> Result<i32, ShmError> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(ShmError::Create(std::io::Error::last_os_error()));
        }
        Ok(id)
    }

    /// 标记删除，最后一个映射解除后段被回收
    pub fn remove(segment: i32) -> Result<(), ShmError> {
        let result = unsafe { libc::shmctl(segment, libc::IPC_RMID, ptr::null_mut()) };
        if result != 0 {
            return Err(ShmError::Remove {
                segment,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl SharedMemory for SysVSharedMemory {
    fn map_segment(&self, segment: i32) -> Result<Mapping, ShmError> {
        let mut info: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(segment, libc::IPC_STAT, &mut info) } != 0 {
            return Err(ShmError::Stat {
                segment,
                source: std::io::Error::last_os_error(),
            });
        }

        let addr = unsafe { libc::shmat(segment, ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(ShmError::Attach {
                segment,
                source: std::io::Error::last_os_error(),
            });
        }

        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| ShmError::Attach {
            segment,
            source: std::io::Error::from(std::io::ErrorKind::InvalidData),
        })?;

        Ok(Mapping {
            ptr,
            len: info.shm_segsz as usize,
            segment,
        })
    }

    fn unmap_segment(&self, mapping: &Mapping) {
        let result = unsafe { libc::shmdt(mapping.ptr.as_ptr() as *const libc::c_void) };
        if result != 0 {
            log::warn!(
                "Failed to detach shared segment {}: {}",
                mapping.segment,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// 进程内共享内存，段内容在创建时给定
pub struct HeapSharedMemory {
    segments: Mutex<HashMap<i32, (NonNull<u8>, usize)>>,
    next_segment: AtomicI32,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

// 段内存只在 Drop 时释放，指针本身可跨线程使用
unsafe impl Send for HeapSharedMemory {}
unsafe impl Sync for HeapSharedMemory {}

impl HeapSharedMemory {
    pub fn new() -> Self {
        Self {
            segments: Mutex::new(HashMap::new()),
            next_segment: AtomicI32::new(1),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
        }
    }

    pub fn create_segment(&self, contents: Vec<u8>) -> i32 {
        let segment = self.next_segment.fetch_add(1, Ordering::Relaxed);
        let len = contents.len();
        let raw = Box::into_raw(contents.into_boxed_slice()) as *mut u8;
        // Box::into_raw 不会返回空指针
        let ptr = NonNull::new(raw).unwrap_or(NonNull::dangling());
        self.segments.lock().insert(segment, (ptr, len));
        segment
    }

    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    pub fn unmap_count(&self) -> usize {
        self.unmaps.load(Ordering::SeqCst)
    }
}

impl Default for HeapSharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMemory for HeapSharedMemory {
    fn map_segment(&self, segment: i32) -> Result<Mapping, ShmError> {
        let (ptr, len) = *self
            .segments
            .lock()
            .get(&segment)
            .ok_or(ShmError::UnknownSegment(segment))?;
        self.maps.fetch_add(1, Ordering::SeqCst);
        Ok(Mapping { ptr, len, segment })
    }

    fn unmap_segment(&self, _mapping: &Mapping) {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for HeapSharedMemory {
    fn drop(&mut self) {
        for (_, (ptr, len)) in self.segments.lock().drain() {
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)));
            }
        }
    }
}
