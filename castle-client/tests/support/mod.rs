//! `MockEngine`: a fake engine that runs on a sibling thread, drains the request side of the
//! ring directly, and answers with an in-memory key/value store (§8 explicitly permits this:
//! "the test harness may mock the engine by reading/writing the ring directly in a sibling
//! thread"). It maps the whole backing `memfd` once, the same way the kernel-resident engine
//! would have direct access to every page the client ever hands it an offset into, so request
//! fields that are themselves byte offsets (`key_ptr`, `buf_ptr`) can be read with plain
//! pointer arithmetic instead of a fresh `mmap` per field.
//!
//! `Connection::connect_mocked` (gated behind the `test-support` feature) is the only seam
//! this harness needs: it skips the protocol-handshake `ioctl`, which only a real character
//! device can answer, and otherwise builds exactly the `Connection` a real `connect` would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use castle_client::{CastleOptions, Connection, PoolConfig, RingConfig};
use castle_proto::{Request, RequestTag, Response, RingHeader};

const BATCH_NODE_HEADER_LEN: usize = 20;

fn memfd(len: u64) -> RawFd {
    let name = CString::new("castle-mock-engine").unwrap();
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    assert!(fd >= 0, "memfd_create failed: {}", std::io::Error::last_os_error());
    let file: std::fs::File = unsafe { std::os::unix::io::FromRawFd::from_raw_fd(fd) };
    file.set_len(len).expect("failed to size memfd");
    file.into_raw_fd()
}

fn stamp_capacity(fd: RawFd, capacity: u32) {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<RingHeader>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED);
    unsafe { (addr as *mut u32).write(capacity) };
    unsafe { libc::munmap(addr, std::mem::size_of::<RingHeader>()) };
}

struct IterState {
    remaining: Vec<(Vec<u8>, Vec<u8>)>,
}

struct BigPutState {
    collection_id: u32,
    key: Vec<u8>,
    total_len: usize,
    received: Vec<u8>,
}

struct BigGetState {
    data: Vec<u8>,
    offset: usize,
}

pub struct MockEngine {
    base: *mut u8,
    mapping_len: usize,
    capacity: u32,
    store: Mutex<HashMap<(u32, Vec<u8>), Vec<u8>>>,
    /// Last-write-wins bookkeeping for `ReplaceTimestamped`/`RemoveTimestamped`: the highest
    /// `user_timestamp` ever accepted for a key, kept even after a timestamped remove so a
    /// late-arriving stale write can't resurrect it.
    timestamps: Mutex<HashMap<(u32, Vec<u8>), u64>>,
    iters: Mutex<HashMap<u32, IterState>>,
    big_puts: Mutex<HashMap<u32, BigPutState>>,
    big_gets: Mutex<HashMap<u32, BigGetState>>,
    next_token: AtomicU32,
    stop: AtomicBool,
    /// If set, the `nth` response handled (1-based, across the whole run) carries this
    /// engine error code instead of success (scenario S4).
    fail_nth: Mutex<Option<(u32, i32)>>,
    seen: AtomicU32,
    batch_size: usize,
    /// When set, the run loop stops draining the request ring, leaving anything already
    /// submitted (and anything submitted after) pending with no response — used by S5 to
    /// force a blocking call to be genuinely in flight when `disconnect` runs.
    paused: AtomicBool,
}

// The mapping is shared with the client process via the same memfd; this type's own state
// is protected by its own mutexes.
unsafe impl Send for MockEngine {}
unsafe impl Sync for MockEngine {}

impl MockEngine {
    fn new(fd: RawFd, capacity: u32, total_len: usize) -> Arc<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED, "mock engine mmap failed: {}", std::io::Error::last_os_error());
        Arc::new(MockEngine {
            base: addr as *mut u8,
            mapping_len: total_len,
            capacity,
            store: Mutex::new(HashMap::new()),
            timestamps: Mutex::new(HashMap::new()),
            iters: Mutex::new(HashMap::new()),
            big_puts: Mutex::new(HashMap::new()),
            big_gets: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
            stop: AtomicBool::new(false),
            fail_nth: Mutex::new(None),
            seen: AtomicU32::new(0),
            batch_size: 2,
            paused: AtomicBool::new(false),
        })
    }

    /// Stops the run loop from draining the request ring until [`MockEngine::resume`] is
    /// called. Anything submitted while paused sits in the ring unanswered.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn fail_nth_response(&self, nth: u32, err_code: i32) {
        *self.fail_nth.lock().unwrap() = Some((nth, err_code));
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.base as *const RingHeader) }
    }

    fn request_slot(&self, idx: u32) -> Request {
        let slot = idx & (self.capacity - 1);
        let offset = RingHeader::request_slots_offset() + slot as usize * std::mem::size_of::<Request>();
        unsafe { (self.base.add(offset) as *const Request).read() }
    }

    fn write_response_slot(&self, idx: u32, resp: Response) {
        let slot = idx & (self.capacity - 1);
        let offset =
            RingHeader::response_slots_offset(self.capacity) + slot as usize * std::mem::size_of::<Response>();
        unsafe { (self.base.add(offset) as *mut Response).write(resp) };
    }

    fn region(&self, offset: u64, len: u32) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len as usize) }
    }

    fn region_mut(&self, offset: u64, len: u32) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset as usize), len as usize) }
    }

    fn next_token(&self) -> u32 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Serialises `entries` as the linked-list batch format `parse_batch` expects (§4.4.7):
    /// `more_remaining` forces the last node's `next` to a "lower address" sentinel rather
    /// than zero, the path S2 specifically wants exercised. Only meaningful with >= 2
    /// entries (a single node at offset 0 cannot express a nonzero-but-lower pointer).
    fn write_batch(&self, buf_offset: u64, entries: &[(Vec<u8>, Vec<u8>)], more_remaining: bool) -> u32 {
        if entries.is_empty() {
            return 0;
        }
        let mut offsets = Vec::with_capacity(entries.len());
        let mut cursor = 0usize;
        for (k, v) in entries {
            offsets.push(cursor);
            cursor += BATCH_NODE_HEADER_LEN + k.len() + v.len();
        }
        let dst = self.region_mut(buf_offset, cursor as u32);
        for (i, (k, v)) in entries.iter().enumerate() {
            let node_off = offsets[i];
            let is_last = i + 1 == entries.len();
            let next: u64 = if !is_last {
                offsets[i + 1] as u64
            } else if more_remaining {
                debug_assert!(node_off > 0, "single-entry batch cannot signal more-remaining");
                1
            } else {
                0
            };
            dst[node_off..node_off + 8].copy_from_slice(&next.to_le_bytes());
            dst[node_off + 8..node_off + 12].copy_from_slice(&(k.len() as u32).to_le_bytes());
            dst[node_off + 12..node_off + 16].copy_from_slice(&(v.len() as u32).to_le_bytes());
            dst[node_off + 16] = 1; // inline
            dst[node_off + 17..node_off + 20].fill(0);
            let key_start = node_off + BATCH_NODE_HEADER_LEN;
            dst[key_start..key_start + k.len()].copy_from_slice(k);
            let val_start = key_start + k.len();
            dst[val_start..val_start + v.len()].copy_from_slice(v);
        }
        cursor as u32
    }

    fn handle(&self, req: Request) -> Response {
        let mut resp = Response { call_id: req.call_id, err: 0, length: 0, token: 0 };

        match req.tag {
            t if t == RequestTag::Get as u8 => {
                let key = self.region(req.key_ptr, req.key_len).to_vec();
                let store = self.store.lock().unwrap();
                match store.get(&(req.collection_id, key)) {
                    Some(value) => {
                        resp.length = value.len() as u32;
                        if value.len() <= req.buf_len as usize {
                            self.region_mut(req.buf_ptr, req.buf_len)[..value.len()].copy_from_slice(value);
                        }
                    }
                    None => resp.err = 1,
                }
            }
            t if t == RequestTag::Replace as u8 => {
                let key = self.region(req.key_ptr, req.key_len).to_vec();
                let value = self.region(req.buf_ptr, req.buf_len).to_vec();
                self.store.lock().unwrap().insert((req.collection_id, key), value);
            }
            t if t == RequestTag::Remove as u8 => {
                let key = self.region(req.key_ptr, req.key_len).to_vec();
                if self.store.lock().unwrap().remove(&(req.collection_id, key)).is_none() {
                    resp.err = 1;
                }
            }
            t if t == RequestTag::ReplaceTimestamped as u8 => {
                let key = (req.collection_id, self.region(req.key_ptr, req.key_len).to_vec());
                let value = self.region(req.buf_ptr, req.buf_len).to_vec();
                let mut timestamps = self.timestamps.lock().unwrap();
                let current = timestamps.get(&key).copied().unwrap_or(0);
                if req.user_timestamp >= current {
                    self.store.lock().unwrap().insert(key.clone(), value);
                    timestamps.insert(key, req.user_timestamp);
                }
            }
            t if t == RequestTag::RemoveTimestamped as u8 => {
                let key = (req.collection_id, self.region(req.key_ptr, req.key_len).to_vec());
                let mut timestamps = self.timestamps.lock().unwrap();
                let current = timestamps.get(&key).copied().unwrap_or(0);
                if req.user_timestamp >= current {
                    self.store.lock().unwrap().remove(&key);
                    timestamps.insert(key, req.user_timestamp);
                }
            }
            t if t == RequestTag::CounterSet as u8 => {
                let key = self.region(req.key_ptr, req.key_len).to_vec();
                let value = self.region(req.buf_ptr, req.buf_len).to_vec();
                self.store.lock().unwrap().insert((req.collection_id, key), value);
            }
            t if t == RequestTag::CounterAdd as u8 => {
                let key = self.region(req.key_ptr, req.key_len).to_vec();
                let delta = i64::from_le_bytes(self.region(req.buf_ptr, req.buf_len).try_into().unwrap());
                let mut store = self.store.lock().unwrap();
                let entry = store.entry((req.collection_id, key)).or_insert_with(|| 0i64.to_le_bytes().to_vec());
                let current = i64::from_le_bytes(entry.as_slice().try_into().unwrap());
                *entry = (current + delta).to_le_bytes().to_vec();
            }
            t if t == RequestTag::IterStart as u8 => {
                let start = self.region(req.key_ptr, req.key_len).to_vec();
                // Unlike every other op's key field, the end-key embedded at `buf_ptr` is not
                // given an exact length (`buf_len` is the whole output buffer's capacity): it
                // is self-describing the same way the key codec always is, so the first 4
                // bytes (the blob's declared length, excluding themselves) say how much to
                // actually read.
                let end_len = u32::from_le_bytes(self.region(req.buf_ptr, 4).try_into().unwrap()) as usize + 4;
                let end = self.region(req.buf_ptr, end_len as u32).to_vec();
                let mut all: Vec<(Vec<u8>, Vec<u8>)> = self
                    .store
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|((cid, k), _)| *cid == req.collection_id && *k >= start && *k <= end)
                    .map(|((_, k), v)| (k.clone(), v.clone()))
                    .collect();
                all.sort_by(|a, b| a.0.cmp(&b.0));
                let token = self.next_token();
                let take = self.batch_size.min(all.len());
                let batch: Vec<_> = all.drain(..take).collect();
                let has_more = !all.is_empty();
                resp.length = self.write_batch(req.buf_ptr, &batch, has_more);
                resp.token = token;
                if has_more {
                    self.iters.lock().unwrap().insert(token, IterState { remaining: all });
                }
            }
            t if t == RequestTag::IterNext as u8 => {
                let mut iters = self.iters.lock().unwrap();
                if let Some(state) = iters.get_mut(&req.token) {
                    let take = self.batch_size.min(state.remaining.len());
                    let batch: Vec<_> = state.remaining.drain(..take).collect();
                    let has_more = !state.remaining.is_empty();
                    resp.length = self.write_batch(req.buf_ptr, &batch, has_more);
                    resp.token = req.token;
                    if !has_more {
                        iters.remove(&req.token);
                    }
                }
            }
            t if t == RequestTag::IterFinish as u8 => {
                self.iters.lock().unwrap().remove(&req.token);
            }
            t if t == RequestTag::BigPutStart as u8 => {
                let key = self.region(req.key_ptr, req.key_len).to_vec();
                let token = self.next_token();
                self.big_puts.lock().unwrap().insert(
                    token,
                    BigPutState {
                        collection_id: req.collection_id,
                        key,
                        total_len: req.buf_len as usize,
                        received: Vec::new(),
                    },
                );
                resp.token = token;
            }
            t if t == RequestTag::PutChunk as u8 => {
                let chunk = self.region(req.buf_ptr, req.buf_len).to_vec();
                let mut puts = self.big_puts.lock().unwrap();
                if let Some(state) = puts.get_mut(&req.token) {
                    state.received.extend_from_slice(&chunk);
                    if state.received.len() >= state.total_len {
                        let state = puts.remove(&req.token).unwrap();
                        self.store.lock().unwrap().insert((state.collection_id, state.key), state.received);
                    }
                }
                resp.token = req.token;
            }
            t if t == RequestTag::BigGetStart as u8 => {
                let key = self.region(req.key_ptr, req.key_len).to_vec();
                let store = self.store.lock().unwrap();
                match store.get(&(req.collection_id, key)) {
                    Some(value) => {
                        let token = self.next_token();
                        resp.length = value.len() as u32;
                        resp.token = token;
                        self.big_gets.lock().unwrap().insert(token, BigGetState { data: value.clone(), offset: 0 });
                    }
                    None => resp.err = 1,
                }
            }
            t if t == RequestTag::GetChunk as u8 => {
                let mut gets = self.big_gets.lock().unwrap();
                if let Some(state) = gets.get_mut(&req.token) {
                    let want = (req.buf_len as usize).min(state.data.len() - state.offset);
                    self.region_mut(req.buf_ptr, want as u32)
                        .copy_from_slice(&state.data[state.offset..state.offset + want]);
                    state.offset += want;
                    resp.length = want as u32;
                    resp.token = req.token;
                    if state.offset >= state.data.len() {
                        gets.remove(&req.token);
                    }
                }
            }
            other => panic!("mock engine: unhandled request tag {other}"),
        }

        let seen = self.seen.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some((nth, code)) = *self.fail_nth.lock().unwrap() {
            if seen == nth {
                resp.err = code;
            }
        }
        resp
    }

    fn run(self: Arc<Self>) {
        let mut req_cons_local = 0u32;
        let mut rsp_prod_local = 0u32;
        while !self.stop.load(Ordering::Acquire) {
            if self.paused.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }
            let req_prod = self.header().req_prod.load(Ordering::Acquire);
            if req_cons_local == req_prod {
                std::thread::sleep(Duration::from_micros(200));
                continue;
            }
            while req_cons_local != req_prod {
                let req = self.request_slot(req_cons_local);
                let resp = self.handle(req);
                self.write_response_slot(rsp_prod_local, resp);
                rsp_prod_local = rsp_prod_local.wrapping_add(1);
                self.header().rsp_prod.store(rsp_prod_local, Ordering::Release);
                req_cons_local = req_cons_local.wrapping_add(1);
                self.header().req_cons.store(req_cons_local, Ordering::Release);
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.mapping_len) };
    }
}

/// A connected `Connection` wired up to a `MockEngine`, plus the thread handles needed to
/// tear both down cleanly.
pub struct Harness {
    pub conn: Arc<Connection>,
    pub engine: Arc<MockEngine>,
    engine_thread: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new(capacity: u32, n_stateful: u32, size_classes: Vec<usize>, buffers_per_class: usize) -> Self {
        let ring_len = RingHeader::mapping_size(capacity);
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let pool_base = (ring_len + page - 1) / page * page;
        let pool_len: usize = size_classes.iter().map(|s| s * buffers_per_class).sum();
        let total = pool_base + pool_len;

        let fd = memfd(total as u64);
        stamp_capacity(fd, capacity);

        let engine = MockEngine::new(fd, capacity, total);
        let engine_for_thread = engine.clone();
        let engine_thread = std::thread::Builder::new()
            .name("mock-engine".into())
            .spawn(move || engine_for_thread.run())
            .expect("failed to spawn mock engine thread");

        let options = CastleOptions {
            ring: RingConfig { capacity, n_stateful },
            pool: PoolConfig { size_classes },
        };
        let conn =
            Connection::connect_mocked(fd, &options, buffers_per_class).expect("connect_mocked failed");

        Harness { conn, engine, engine_thread: Some(engine_thread) }
    }

    pub fn default_harness() -> Self {
        Self::new(16, 4, vec![4096, 16384, 1024 * 1024], 8)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.conn.disconnect();
        self.engine.stop();
        if let Some(handle) = self.engine_thread.take() {
            let _ = handle.join();
        }
    }
}
