//! A single mapped shared buffer (C2, §4.2).
//!
//! Large values and batched I/O never travel through the ring itself — the ring only ever
//! carries fixed-size request/response records (§3). Instead the caller gets a region of
//! memory the engine also maps, writes or reads through it directly, and refers to it in a
//! request by the byte offset `mmap` returned it at. [`SharedBuffer`] is that single mapped
//! region; [`crate::pool::BufferPool`] (C3) manages a population of them.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::error::{CastleError, Result};

/// A page-aligned region mapped `MAP_SHARED` over the connection's device fd at a fixed
/// byte offset. The offset doubles as the handle the engine uses to identify the buffer in
/// request records (`buf_ptr` in [`castle_proto::Request`] carries it).
#[derive(Debug)]
pub struct SharedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    offset: u64,
}

// The mapping is shared with the kernel-resident engine, not with other threads of this
// process in a way that needs synchronization beyond what the ring's admission control
// already provides (a buffer is only ever referenced by the one in-flight request that
// leased it).
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    /// Maps `len` bytes of `fd` starting at `offset`. `len` is rounded up to a page boundary
    /// by the kernel; callers should request sizes already aligned to the pool's size
    /// classes to avoid surprises.
    pub fn map(fd: RawFd, offset: u64, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(CastleError::InvalidArgument("buffer length must be non-zero".into()));
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(CastleError::Os(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(addr as *mut u8).expect("mmap returned MAP_FAILED sentinel, not null");
        Ok(SharedBuffer { ptr, len, offset })
    }

    /// The byte offset this buffer was mapped at — the handle carried in request records.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            log::warn!(
                "munmap of shared buffer at offset {} (len {}) failed: {}",
                self.offset,
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn anon_fd(len: usize) -> (std::fs::File, RawFd) {
        let file = tempfile_like(len);
        let fd = file.as_raw_fd();
        (file, fd)
    }

    // memfd avoids a real device node in unit tests; the mapping semantics exercised here
    // (map, write, read back, unmap on drop) don't depend on which fd backs them.
    fn tempfile_like(len: usize) -> std::fs::File {
        let file = tempfile_via_memfd();
        file.set_len(len as u64).unwrap();
        file
    }

    fn tempfile_via_memfd() -> std::fs::File {
        use std::ffi::CString;
        let name = CString::new("castle-client-test").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        assert!(fd >= 0, "memfd_create failed: {}", std::io::Error::last_os_error());
        unsafe { std::os::unix::io::FromRawFd::from_raw_fd(fd) }
    }

    #[test]
    fn map_write_read_back() {
        let (file, fd) = anon_fd(8192);
        let mut buf = SharedBuffer::map(fd, 0, 4096).unwrap();
        buf.as_mut_slice()[0] = 0xAB;
        buf.as_mut_slice()[4095] = 0xCD;
        assert_eq!(buf.as_slice()[0], 0xAB);
        assert_eq!(buf.as_slice()[4095], 0xCD);
        assert_eq!(buf.offset(), 0);
        assert_eq!(buf.len(), 4096);
        drop(buf);
        drop(file);
    }

    #[test]
    fn rejects_zero_length() {
        let (_file, fd) = anon_fd(4096);
        assert!(SharedBuffer::map(fd, 0, 0).is_err());
    }

    #[test]
    fn second_mapping_at_nonzero_offset() {
        let (file, fd) = anon_fd(16384);
        let a = SharedBuffer::map(fd, 0, 4096).unwrap();
        let b = SharedBuffer::map(fd, 4096, 4096).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 4096);
        drop(file);
    }
}
