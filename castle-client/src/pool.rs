//! Size-classed shared-buffer pool (C3, §4.3).
//!
//! Buffers are grouped into ascending size classes (the same classes as [`crate::config::PoolConfig`]).
//! Each class owns a fixed population of [`SharedBuffer`]s, pre-mapped at construction time,
//! linked into a free list. The free-list "next" pointer is intrusive: it lives in the first
//! eight bytes of the buffer's own memory rather than in a side table, so an idle buffer costs
//! nothing beyond the page(s) it already occupies. `lease` binary-searches for the smallest
//! class that satisfies a requested length and blocks on a condition variable if that class
//! (and every larger one) is currently exhausted; `release` always returns a buffer to the
//! free list matching the exact size class it was leased from.

use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};

use crate::buffer::SharedBuffer;
use crate::config::PoolConfig;
use crate::error::{CastleError, Result};

const NO_NEXT: u64 = u64::MAX;

fn read_next(buf: &SharedBuffer) -> Option<usize> {
    let bytes: [u8; 8] = buf.as_slice()[0..8].try_into().unwrap();
    let v = u64::from_le_bytes(bytes);
    if v == NO_NEXT {
        None
    } else {
        Some(v as usize)
    }
}

fn write_next(buf: &mut SharedBuffer, next: Option<usize>) {
    let v = next.map(|i| i as u64).unwrap_or(NO_NEXT);
    buf.as_mut_slice()[0..8].copy_from_slice(&v.to_le_bytes());
}

struct ClassState {
    // `None` means the slot is currently leased out; `Some` slots form the free list,
    // threaded through `read_next`/`write_next` on the buffer's own first eight bytes.
    slots: Vec<Option<SharedBuffer>>,
    free_head: Option<usize>,
}

struct PoolInner {
    classes: Vec<ClassState>,
}

/// A leased buffer. Dropping it returns the buffer to its pool's free list.
pub struct Lease<'a> {
    pool: &'a BufferPool,
    class_idx: usize,
    slot_idx: usize,
    buf: Option<SharedBuffer>,
}

impl<'a> std::ops::Deref for Lease<'a> {
    type Target = SharedBuffer;
    fn deref(&self) -> &SharedBuffer {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl<'a> std::ops::DerefMut for Lease<'a> {
    fn deref_mut(&mut self) -> &mut SharedBuffer {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl<'a> Drop for Lease<'a> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(self.class_idx, self.slot_idx, buf);
        }
    }
}

/// A fixed population of shared buffers grouped by size class.
pub struct BufferPool {
    fd: RawFd,
    sizes: Vec<usize>,
    state: Mutex<PoolInner>,
    not_empty: Condvar,
}

impl BufferPool {
    /// Pre-maps `buffers_per_class` buffers for each of `config`'s size classes over `fd`,
    /// starting at file offset 0.
    pub fn new(fd: RawFd, config: &PoolConfig, buffers_per_class: usize) -> Result<Self> {
        Self::new_at(fd, config, buffers_per_class, 0)
    }

    /// Same as [`BufferPool::new`], but starts mapping buffers at `base_offset`. Used when
    /// the same fd already hosts another mapping (the ring) at offset 0 that the pool's
    /// buffers must not overlap.
    pub fn new_at(
        fd: RawFd,
        config: &PoolConfig,
        buffers_per_class: usize,
        base_offset: u64,
    ) -> Result<Self> {
        if buffers_per_class == 0 {
            return Err(CastleError::InvalidArgument(
                "buffers_per_class must be non-zero".into(),
            ));
        }
        let mut classes = Vec::with_capacity(config.size_classes.len());
        let mut next_offset = base_offset;
        for &size in &config.size_classes {
            let mut slots = Vec::with_capacity(buffers_per_class);
            for i in 0..buffers_per_class {
                let mut buf = SharedBuffer::map(fd, next_offset, size)?;
                next_offset += size as u64;
                let next = if i + 1 < buffers_per_class { Some(i + 1) } else { None };
                write_next(&mut buf, next);
                slots.push(Some(buf));
            }
            classes.push(ClassState {
                slots,
                free_head: Some(0),
            });
        }
        Ok(BufferPool {
            fd,
            sizes: config.size_classes.clone(),
            state: Mutex::new(PoolInner { classes }),
            not_empty: Condvar::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Index of the smallest size class `>= len`, or `None` if `len` exceeds every class.
    fn class_for(&self, len: usize) -> Option<usize> {
        let idx = self.sizes.partition_point(|&s| s < len);
        if idx < self.sizes.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Leases a buffer whose size class is the smallest one `>= len`, trying progressively
    /// larger classes and blocking if every candidate class is momentarily exhausted.
    pub fn lease(&self, len: usize) -> Result<Lease<'_>> {
        let start_class = self.class_for(len).ok_or_else(|| {
            CastleError::InvalidArgument(format!(
                "requested buffer length {len} exceeds the largest size class"
            ))
        })?;

        let mut guard = self.state.lock().expect("buffer pool mutex poisoned");
        loop {
            for class_idx in start_class..guard.classes.len() {
                if let Some(head) = guard.classes[class_idx].free_head {
                    let buf = guard.classes[class_idx].slots[head]
                        .as_ref()
                        .map(|b| read_next(b))
                        .unwrap();
                    guard.classes[class_idx].free_head = buf;
                    let buf = guard.classes[class_idx].slots[head]
                        .take()
                        .expect("free list head slot was unexpectedly empty");
                    return Ok(Lease {
                        pool: self,
                        class_idx,
                        slot_idx: head,
                        buf: Some(buf),
                    });
                }
            }
            guard = self
                .not_empty
                .wait(guard)
                .expect("buffer pool mutex poisoned while waiting");
        }
    }

    fn release(&self, class_idx: usize, slot_idx: usize, mut buf: SharedBuffer) {
        let mut guard = self.state.lock().expect("buffer pool mutex poisoned");
        write_next(&mut buf, guard.classes[class_idx].free_head);
        guard.classes[class_idx].slots[slot_idx] = Some(buf);
        guard.classes[class_idx].free_head = Some(slot_idx);
        drop(guard);
        self.not_empty.notify_one();
    }
}
