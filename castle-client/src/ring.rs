//! Shared-memory ring mapping (§4.4.1, §6.1, §6.2).
//!
//! `RingMap` owns the single `mmap` that backs the request/response ring (`mmap(fd, 0,
//! RING_SIZE, ...)` is issued exactly once, at connect). It exposes only the primitives the
//! rest of C4 needs: raw slot read/write and the release/acquire-fenced index accessors. It
//! does not itself decide what is admissible or drive submission/completion — that is
//! `connection.rs`'s job, layered on top.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use castle_proto::{Request, RingHeader};

use crate::error::{CastleError, Result};

/// The mapped ring: header plus the two flat slot arrays, all in one `mmap` region.
pub struct RingMap {
    base: NonNull<u8>,
    mapping_len: usize,
    capacity: u32,
}

// The mapping is shared with the engine; access discipline (who may write which field) is
// documented on `RingHeader` and enforced by `connection.rs`'s locking, not by this type.
unsafe impl Send for RingMap {}
unsafe impl Sync for RingMap {}

impl RingMap {
    /// Maps the ring at offset 0 of `fd` for a ring of the given (power-of-two) capacity.
    /// The caller is responsible for having already told the engine (via the control
    /// channel) what capacity to expect, if that handshake exists on the engine side;
    /// nothing here negotiates capacity.
    pub fn map(fd: RawFd, capacity: u32) -> Result<Self> {
        if !capacity.is_power_of_two() || capacity == 0 {
            return Err(CastleError::InvalidArgument(
                "ring capacity must be a nonzero power of two".into(),
            ));
        }
        let mapping_len = RingHeader::mapping_size(capacity);
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(CastleError::Os(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(addr as *mut u8).expect("mmap returned MAP_FAILED sentinel, not null");

        let map = RingMap { base, mapping_len, capacity };
        // The engine, not this client, is responsible for having zero-initialised the
        // header and set `capacity` before the device fd is ever handed out; we only read
        // it back here as a sanity check.
        let observed = map.header().capacity;
        if observed != capacity {
            let err = CastleError::InvalidArgument(format!(
                "engine ring capacity {observed} does not match configured {capacity}"
            ));
            unsafe { libc::munmap(addr, mapping_len) };
            return Err(err);
        }
        Ok(map)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.base.as_ptr() as *const RingHeader) }
    }

    fn request_slot_ptr(&self, idx: u32) -> *mut Request {
        let offset = RingHeader::request_slots_offset() + idx as usize * std::mem::size_of::<Request>();
        unsafe { self.base.as_ptr().add(offset) as *mut Request }
    }

    fn response_slot_ptr(&self, idx: u32) -> *const castle_proto::Response {
        let offset = RingHeader::response_slots_offset(self.capacity)
            + idx as usize * std::mem::size_of::<castle_proto::Response>();
        unsafe { self.base.as_ptr().add(offset) as *const castle_proto::Response }
    }

    /// Writes `req` into request slot `index mod capacity`. Caller holds whatever lock
    /// serialises producer-side index arithmetic; no ordering is applied here — the caller
    /// issues the release fence once after writing the whole admitted batch (§4.4.2 step 3).
    pub fn write_request(&self, index: u32, req: &Request) {
        let slot = index & (self.capacity - 1);
        unsafe { self.request_slot_ptr(slot).write(*req) };
    }

    /// Reads response slot `index mod capacity`. Caller has already performed the acquire
    /// fence implied by reading `rsp_prod` (§4.4.1).
    pub fn read_response(&self, index: u32) -> castle_proto::Response {
        let slot = index & (self.capacity - 1);
        unsafe { self.response_slot_ptr(slot).read() }
    }

    /// Acquire-load of the engine-owned request-consumer index.
    pub fn req_cons(&self) -> u32 {
        self.header().req_cons.load(Ordering::Acquire)
    }

    /// Release-store of the client-owned request-producer index — the publish step of
    /// §4.4.2 step 3.
    pub fn publish_req_prod(&self, value: u32) {
        self.header().req_prod.store(value, Ordering::Release);
    }

    /// The client's most recently published `req_prod`, for computing "notify required"
    /// (compared against the new `req_prod_pvt` after a batch admits).
    pub fn req_prod(&self) -> u32 {
        self.header().req_prod.load(Ordering::Acquire)
    }

    /// Acquire-load of the engine-owned response-producer index.
    pub fn rsp_prod(&self) -> u32 {
        self.header().rsp_prod.load(Ordering::Acquire)
    }

    /// Release-store of the client-owned response-consumer index, after a drain.
    pub fn publish_rsp_cons(&self, value: u32) {
        self.header().rsp_cons.store(value, Ordering::Release);
    }

    /// Number of ring slots not yet consumed by the engine, given the client's private
    /// producer index. `capacity - (req_prod_pvt - req_cons)`, wrap-safe via wrapping
    /// subtraction on the 32-bit counters (§3 "wrap-around equality tests").
    pub fn free_slots(&self, req_prod_pvt: u32) -> u32 {
        let occupied = req_prod_pvt.wrapping_sub(self.req_cons());
        self.capacity - occupied
    }
}

impl Drop for RingMap {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapping_len) };
        if rc != 0 {
            log::warn!("munmap of ring mapping failed: {}", std::io::Error::last_os_error());
        }
    }
}
