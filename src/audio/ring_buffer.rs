//! 单生产者单消费者字节环
//!
//! 会话写入线程把 PCM 字节推进来，pacer 消费线程按时间把它们丢弃。
//! 读写位置各自独占一条 cache line；数据一次最多分两段拷贝（环绕处）。
//! 可选 mlock，避免消费线程在实时调度下触发缺页。

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use thiserror::Error;

/// 存储区分配失败（容量溢出或内存不足）
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("cannot allocate a ring of {requested} bytes")]
pub struct RingAllocError {
    pub requested: usize,
}

pub struct ByteRing {
    // 只会读出之前写入过的字节，因此无需初始化
    storage: Box<[UnsafeCell<MaybeUninit<u8>>]>,
    mask: usize,

    // 单调递增，取模后才是下标
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,

    locked: AtomicBool,
}

// head 只由生产者推进，tail 只由消费者推进；两者之间的区域归生产者独占写入
unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// 容量向上取整到 2 的幂（至少 1 字节）
    ///
    /// 容量来自客户端协商的缓冲大小，分配失败时返回错误而不是中止进程
    pub fn with_min_capacity(min_capacity: usize) -> Result<Self, RingAllocError> {
        let error = RingAllocError {
            requested: min_capacity,
        };
        let capacity = min_capacity
            .max(1)
            .checked_next_power_of_two()
            .ok_or_else(|| error.clone())?;

        let mut storage: Vec<UnsafeCell<MaybeUninit<u8>>> = Vec::new();
        storage.try_reserve_exact(capacity).map_err(|_| error)?;
        // 元素类型允许未初始化，不触碰页面
        unsafe { storage.set_len(capacity) };

        Ok(Self {
            storage: storage.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            locked: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        // UnsafeCell<MaybeUninit<u8>> 与 u8 布局相同
        self.storage.as_ptr() as *mut u8
    }

    /// mlock 存储区，失败只记录日志
    pub fn lock_memory(&self) -> bool {
        if self.locked.load(Ordering::Acquire) {
            return true;
        }
        if unsafe { libc::mlock(self.base() as *const libc::c_void, self.capacity()) } != 0 {
            log::warn!(
                "Failed to lock pacer ring ({} bytes): {}",
                self.capacity(),
                std::io::Error::last_os_error()
            );
            return false;
        }
        self.locked.store(true, Ordering::Release);
        log::debug!("Pacer ring locked in memory: {} bytes", self.capacity());
        true
    }

    /// 推入尽可能多的字节（生产者调用），返回实际写入数
    pub fn push(&self, data: &[u8]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let count = data.len().min(self.capacity() - head.wrapping_sub(tail));
        if count == 0 {
            return 0;
        }

        let start = head & self.mask;
        let first = count.min(self.capacity() - start);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(start), first);
            ptr::copy_nonoverlapping(data.as_ptr().add(first), self.base(), count - first);
        }

        self.head.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    /// 取出最多 `output.len()` 字节（消费者调用）
    #[cfg(test)]
    pub fn pop(&self, output: &mut [u8]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let count = output.len().min(head.wrapping_sub(tail));
        if count == 0 {
            return 0;
        }

        let start = tail & self.mask;
        let first = count.min(self.capacity() - start);
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(start), output.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.base(), output.as_mut_ptr().add(first), count - first);
        }

        self.tail.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// 不读出内容，直接消耗最多 `count` 字节（消费者调用）
    pub fn skip(&self, count: usize) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let count = count.min(head.wrapping_sub(tail));
        self.tail.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// 已缓冲的字节数
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// 丢弃全部缓冲数据
    ///
    /// 调用方需保证此时消费者没有在 `pop`/`skip`
    pub fn reset(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }
}

impl Drop for ByteRing {
    fn drop(&mut self) {
        if self.locked.load(Ordering::Acquire) {
            unsafe {
                libc::munlock(self.base() as *const libc::c_void, self.capacity());
            }
        }
    }
}
