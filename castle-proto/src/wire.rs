//! On-the-wire request/response/ring layout (§3, §6.2).
//!
//! `Request` and `Response` are flattened, `#[repr(C)]` stand-ins for the source's tagged
//! C union: every variant's fields live at fixed offsets and `tag` says which ones are
//! meaningful. This keeps the layout bit-for-bit stable (a real union would be equivalent
//! but considerably less pleasant to poke at from safe-ish code) and lets the ring just be
//! `[Request; R]` / `[Response; R]` with no per-slot size variation.

use core::sync::atomic::AtomicU32;

/// Discriminates the meaning of a [`Request`]'s fields.
///
/// The per-tag field mapping (documented on each variant) is deliberately reused across
/// ops that don't need every field simultaneously: `iter_start`'s `buf` field, for instance,
/// carries the *end key* before the iterator exists, then is repurposed as the output
/// buffer for the batch once the op is in flight.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    /// `collection_id`, `key`. No buffer; response payload is inline or triggers big-get.
    Get = 0,
    /// `collection_id`, `key`, `buf` (value to store).
    Replace = 1,
    /// `collection_id`, `key`.
    Remove = 2,
    /// `collection_id`, `key`, `buf` (8-byte counter value).
    CounterSet = 3,
    /// `collection_id`, `key`, `buf` (8-byte signed delta).
    CounterAdd = 4,
    /// `collection_id`, `key` (start key), `buf` (end key), then `buf` becomes the output
    /// batch buffer once submitted. Response carries the token for `IterNext`/`IterFinish`.
    IterStart = 5,
    /// `token`, `buf` (output batch buffer).
    IterNext = 6,
    /// `token`. No buffer.
    IterFinish = 7,
    /// `collection_id`, `key`, `buf.len` holds the total value length to stream.
    BigPutStart = 8,
    /// `token`, `buf` (chunk payload).
    PutChunk = 9,
    /// `collection_id`, `key`. Response carries the token and total length.
    BigGetStart = 10,
    /// `token`, `buf` (destination for this chunk).
    GetChunk = 11,
    /// `collection_id`, `key`, `buf` (value to store), `user_timestamp`. Applied only if
    /// `user_timestamp` is not older than whatever timestamp is currently stored for the
    /// key; an older timestamp is silently dropped rather than treated as an error.
    ReplaceTimestamped = 12,
    /// `collection_id`, `key`, `user_timestamp`. Same timestamp ordering rule as
    /// [`RequestTag::ReplaceTimestamped`].
    RemoveTimestamped = 13,
}

/// A fixed-size discriminated request record (§3 "Request record").
///
/// `call_id` is filled in by the transport on submission, not by the caller. Keys and
/// buffers referenced here must reside in shared memory acquired from the allocator or
/// pool (§4.2/§4.3) and must outlive the in-flight call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub tag: u8,
    pub flags: u8,
    _reserved: [u8; 2],
    /// Filled in by the transport when the request is admitted.
    pub call_id: u32,
    pub collection_id: u32,
    pub token: u32,
    pub key_ptr: u64,
    pub key_len: u32,
    pub buf_ptr: u64,
    pub buf_len: u32,
    pub user_timestamp: u64,
}

impl Request {
    /// Builds a zeroed request of the given tag; callers fill in the fields they need.
    pub fn new(tag: RequestTag) -> Self {
        Request {
            tag: tag as u8,
            flags: 0,
            _reserved: [0; 2],
            call_id: 0,
            collection_id: 0,
            token: 0,
            key_ptr: 0,
            key_len: 0,
            buf_ptr: 0,
            buf_len: 0,
            user_timestamp: 0,
        }
    }
}

/// A fixed-size response record (§3 "Response record").
///
/// `token == 0` means "non-stateful"; a non-zero token both identifies an ongoing
/// multi-message operation and carries the reservation slot index in its low bits
/// (`token % N_STATEFUL`).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub call_id: u32,
    /// Engine error code; `0` means success. Negative values are reserved (unused by the
    /// engine's closed enumeration, which starts at 1 — see [`crate::EngineError`]).
    pub err: i32,
    pub length: u32,
    pub token: u32,
}

/// The shared ring header (§6.2): capacity plus the four wrap-counting indices.
///
/// Layout after the header, in the same mapping: `capacity` [`Request`] slots, then
/// `capacity` [`Response`] slots. `capacity` is fixed at mapping time and MUST be a power
/// of two so that `index & (capacity - 1)` is a valid slot index.
#[repr(C)]
pub struct RingHeader {
    pub capacity: u32,
    _reserved: u32,
    /// Owned by the client; written under the ring's producer lock, read (Acquire) by the
    /// engine.
    pub req_prod: AtomicU32,
    /// Owned by the engine; the client only ever reads this (Acquire).
    pub req_cons: AtomicU32,
    /// Owned by the engine; the client only ever reads this (Acquire).
    pub rsp_prod: AtomicU32,
    /// Owned by the client; written (Release) after draining responses.
    pub rsp_cons: AtomicU32,
}

impl RingHeader {
    /// Total mapping size in bytes for a ring of the given (power-of-two) capacity.
    pub const fn mapping_size(capacity: u32) -> usize {
        core::mem::size_of::<RingHeader>()
            + capacity as usize * core::mem::size_of::<Request>()
            + capacity as usize * core::mem::size_of::<Response>()
    }

    /// Byte offset of the request slot array, relative to the start of the mapping.
    pub const fn request_slots_offset() -> usize {
        core::mem::size_of::<RingHeader>()
    }

    /// Byte offset of the response slot array, relative to the start of the mapping.
    pub const fn response_slots_offset(capacity: u32) -> usize {
        Self::request_slots_offset() + capacity as usize * core::mem::size_of::<Request>()
    }
}
