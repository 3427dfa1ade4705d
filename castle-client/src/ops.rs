//! Blocking convenience API (C6, §4.4.5, §4.4.6, §4.4.7, §4.6).
//!
//! Everything here is a thin adapter over [`Connection::submit_batch`]/`submit_one`: lease or
//! allocate shared buffers, encode a key into them, build a [`Request`], submit it with a
//! trampoline callback, and block until the trampoline fires. None of this touches the ring
//! directly — that discipline lives entirely in `connection.rs`.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use castle_proto::control::{Attach, Claim, Detach, Snapshot};
use castle_proto::{EngineError, Request, RequestTag, Response};

use crate::callback::CallbackEntry;
use crate::connection::Connection;
use crate::control;
use crate::device;
use crate::error::{CastleError, Result};
use crate::key::{self, Dim};

const BATCH_NODE_HEADER_LEN: usize = 20;

/// Blocks the calling thread until `request`'s response (or a disconnect-induced synthetic
/// `Unattached`) arrives, returning the engine's response record or the transport/engine
/// error (§4.4.5 "blocking").
fn blocking_call(conn: &Connection, request: Request, token: u32) -> Result<Response> {
    struct Slot {
        result: Mutex<Option<Result<Response>>>,
        cv: Condvar,
    }
    let slot = Arc::new(Slot { result: Mutex::new(None), cv: Condvar::new() });
    let slot_cb = slot.clone();
    let entry = CallbackEntry {
        token,
        callback: Box::new(move |r| {
            *slot_cb.result.lock().expect("blocking slot mutex poisoned") = Some(r);
            slot_cb.cv.notify_all();
        }),
    };
    conn.submit_one(request, entry)?;

    let mut guard = slot.result.lock().expect("blocking slot mutex poisoned");
    while guard.is_none() {
        guard = slot.cv.wait(guard).expect("blocking slot mutex poisoned while waiting");
    }
    let resp = guard.take().expect("checked Some above")?;
    if let Some(engine_err) = EngineError::from_code(resp.err) {
        return Err(CastleError::Engine(engine_err));
    }
    Ok(resp)
}

/// Submits `requests` (each paired with its stateful token, `0` if none) under one batch
/// callback: `on_complete` fires exactly once, after every response has been consumed from
/// the ring, with the first non-zero error observed across the batch (§4.4.5 "batch submit").
pub fn batch_submit(
    conn: &Connection,
    requests: Vec<(Request, u32)>,
    on_complete: impl FnOnce(Result<()>) + Send + 'static,
) -> Result<()> {
    if requests.is_empty() {
        on_complete(Ok(()));
        return Ok(());
    }
    let remaining = Arc::new(AtomicU32::new(requests.len() as u32));
    let first_error: Arc<Mutex<Option<CastleError>>> = Arc::new(Mutex::new(None));
    let on_complete: Arc<Mutex<Option<Box<dyn FnOnce(Result<()>) + Send>>>> =
        Arc::new(Mutex::new(Some(Box::new(on_complete))));

    let mut batch = Vec::with_capacity(requests.len());
    for (req, token) in requests {
        let remaining = remaining.clone();
        let first_error = first_error.clone();
        let on_complete = on_complete.clone();
        let entry = CallbackEntry {
            token,
            callback: Box::new(move |r: Result<Response>| {
                let observed = match r {
                    Err(e) => Some(e),
                    Ok(resp) => EngineError::from_code(resp.err).map(CastleError::Engine),
                };
                if let Some(e) = observed {
                    let mut fe = first_error.lock().expect("batch first-error mutex poisoned");
                    if fe.is_none() {
                        *fe = Some(e);
                    }
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let result = match first_error.lock().expect("batch first-error mutex poisoned").take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                    if let Some(cb) = on_complete.lock().expect("batch on_complete mutex poisoned").take() {
                        cb(result);
                    }
                }
            }),
        };
        batch.push((req, entry));
    }
    conn.submit_batch(batch)
}

/// Blocks until every one of `requests` completes, returning the first non-zero error
/// observed (§4.4.5 "blocking multi").
pub fn blocking_multi(conn: &Connection, requests: Vec<(Request, u32)>) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    batch_submit(conn, requests, move |r| {
        let _ = tx.send(r);
    })?;
    rx.recv().map_err(|_| CastleError::Unattached)?
}

/// Encodes `dims` into a freshly-leased buffer, returning the lease and the encoded length.
fn lease_encoded_key<'a>(conn: &'a Connection, dims: &[Dim]) -> Result<(crate::pool::Lease<'a>, u32)> {
    let needed = key::size_compute(dims);
    let mut lease = conn.pool().lease(needed)?;
    let n = key::encode(lease.as_mut_slice(), dims)?;
    Ok((lease, n as u32))
}

/// Point get (§4.4.6): tries a small inline buffer first; transparently upgrades to
/// big-get/get-chunk if the value is larger (testable property #10).
pub fn get(conn: &Connection, collection_id: u32, dims: &[Dim]) -> Result<Vec<u8>> {
    let (key_lease, key_len) = lease_encoded_key(conn, dims)?;
    let inline_len = castle_proto::constants::INLINE_GET_BUFFER;
    let mut out_lease = conn.pool().lease(inline_len)?;

    let mut req = Request::new(RequestTag::Get);
    req.collection_id = collection_id;
    req.key_ptr = key_lease.offset();
    req.key_len = key_len;
    req.buf_ptr = out_lease.offset();
    req.buf_len = out_lease.len() as u32;

    let resp = blocking_call(conn, req, 0)?;
    if (resp.length as usize) <= out_lease.len() {
        return Ok(out_lease.as_slice()[..resp.length as usize].to_vec());
    }
    log::debug!("get: value length {} exceeds inline buffer, upgrading to big-get", resp.length);
    big_get(conn, collection_id, dims)
}

/// Point replace: packs key and value into one leased buffer (the key codec's header makes
/// the split self-describing, matching the source's single-allocation `make_key_buffer`).
pub fn replace(conn: &Connection, collection_id: u32, dims: &[Dim], value: &[u8]) -> Result<()> {
    let key_len_needed = key::size_compute(dims);
    let mut lease = conn.pool().lease(key_len_needed + value.len())?;
    let n = key::encode(lease.as_mut_slice(), dims)?;
    lease.as_mut_slice()[n..n + value.len()].copy_from_slice(value);

    let mut req = Request::new(RequestTag::Replace);
    req.collection_id = collection_id;
    req.key_ptr = lease.offset();
    req.key_len = n as u32;
    req.buf_ptr = lease.offset() + n as u64;
    req.buf_len = value.len() as u32;

    blocking_call(conn, req, 0).map(|_| ())
}

pub fn remove(conn: &Connection, collection_id: u32, dims: &[Dim]) -> Result<()> {
    let (key_lease, key_len) = lease_encoded_key(conn, dims)?;
    let mut req = Request::new(RequestTag::Remove);
    req.collection_id = collection_id;
    req.key_ptr = key_lease.offset();
    req.key_len = key_len;
    blocking_call(conn, req, 0).map(|_| ())
}

/// Timestamped replace (§3 "timestamped variants"): like [`replace`], but the engine applies
/// it only if `user_timestamp` is not older than whatever timestamp currently stands against
/// the key. A stale write is not an error; it is simply dropped, so callers that need to know
/// whether their write actually landed must read the key back afterwards.
pub fn replace_at(
    conn: &Connection,
    collection_id: u32,
    dims: &[Dim],
    value: &[u8],
    user_timestamp: u64,
) -> Result<()> {
    let key_len_needed = key::size_compute(dims);
    let mut lease = conn.pool().lease(key_len_needed + value.len())?;
    let n = key::encode(lease.as_mut_slice(), dims)?;
    lease.as_mut_slice()[n..n + value.len()].copy_from_slice(value);

    let mut req = Request::new(RequestTag::ReplaceTimestamped);
    req.collection_id = collection_id;
    req.key_ptr = lease.offset();
    req.key_len = n as u32;
    req.buf_ptr = lease.offset() + n as u64;
    req.buf_len = value.len() as u32;
    req.user_timestamp = user_timestamp;

    blocking_call(conn, req, 0).map(|_| ())
}

/// Timestamped remove; see [`replace_at`] for the ordering rule.
pub fn remove_at(conn: &Connection, collection_id: u32, dims: &[Dim], user_timestamp: u64) -> Result<()> {
    let (key_lease, key_len) = lease_encoded_key(conn, dims)?;
    let mut req = Request::new(RequestTag::RemoveTimestamped);
    req.collection_id = collection_id;
    req.key_ptr = key_lease.offset();
    req.key_len = key_len;
    req.user_timestamp = user_timestamp;
    blocking_call(conn, req, 0).map(|_| ())
}

fn counter_op(conn: &Connection, tag: RequestTag, collection_id: u32, dims: &[Dim], value: i64) -> Result<()> {
    let key_len_needed = key::size_compute(dims);
    let mut lease = conn.pool().lease(key_len_needed + 8)?;
    let n = key::encode(lease.as_mut_slice(), dims)?;
    lease.as_mut_slice()[n..n + 8].copy_from_slice(&value.to_le_bytes());

    let mut req = Request::new(tag);
    req.collection_id = collection_id;
    req.key_ptr = lease.offset();
    req.key_len = n as u32;
    req.buf_ptr = lease.offset() + n as u64;
    req.buf_len = 8;

    blocking_call(conn, req, 0).map(|_| ())
}

pub fn counter_set(conn: &Connection, collection_id: u32, dims: &[Dim], value: i64) -> Result<()> {
    counter_op(conn, RequestTag::CounterSet, collection_id, dims, value)
}

pub fn counter_add(conn: &Connection, collection_id: u32, dims: &[Dim], delta: i64) -> Result<()> {
    counter_op(conn, RequestTag::CounterAdd, collection_id, dims, delta)
}

/// Streams `value` to the engine in [`castle_proto::constants::BIG_TRANSFER_CHUNK_SIZE`]
/// pieces after a `big-put-start` handshake establishes the token and declared total length
/// (§4.4.6).
pub fn big_put(conn: &Connection, collection_id: u32, dims: &[Dim], value: &[u8]) -> Result<()> {
    if value.len() > u32::MAX as usize {
        return Err(CastleError::FileTooBig);
    }
    let (key_lease, key_len) = lease_encoded_key(conn, dims)?;
    let mut start_req = Request::new(RequestTag::BigPutStart);
    start_req.collection_id = collection_id;
    start_req.key_ptr = key_lease.offset();
    start_req.key_len = key_len;
    start_req.buf_len = value.len() as u32;
    let resp = blocking_call(conn, start_req, 0)?;
    let token = resp.token;

    for chunk in value.chunks(castle_proto::constants::BIG_TRANSFER_CHUNK_SIZE) {
        let mut lease = conn.pool().lease(chunk.len())?;
        lease.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);

        let mut req = Request::new(RequestTag::PutChunk);
        req.token = token;
        req.buf_ptr = lease.offset();
        req.buf_len = chunk.len() as u32;
        blocking_call(conn, req, token)?;
    }
    Ok(())
}

/// `big-get-start` then loops `get-chunk` until the declared total length has been copied
/// (§4.4.6).
pub fn big_get(conn: &Connection, collection_id: u32, dims: &[Dim]) -> Result<Vec<u8>> {
    let (key_lease, key_len) = lease_encoded_key(conn, dims)?;
    let mut start_req = Request::new(RequestTag::BigGetStart);
    start_req.collection_id = collection_id;
    start_req.key_ptr = key_lease.offset();
    start_req.key_len = key_len;
    let resp = blocking_call(conn, start_req, 0)?;
    let token = resp.token;
    let total = resp.length as usize;

    let mut out = vec![0u8; total];
    let mut copied = 0usize;
    while copied < total {
        let want = (total - copied).min(castle_proto::constants::BIG_TRANSFER_CHUNK_SIZE);
        let mut lease = conn.pool().lease(want)?;

        let mut req = Request::new(RequestTag::GetChunk);
        req.token = token;
        req.buf_ptr = lease.offset();
        req.buf_len = want as u32;
        let chunk_resp = blocking_call(conn, req, token)?;
        let got = chunk_resp.length as usize;
        out[copied..copied + got].copy_from_slice(&lease.as_slice()[..got]);
        copied += got;
    }
    Ok(out)
}

/// One deserialised entry from an iterator batch.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Parses a batch buffer (§4.4.7): a singly-linked chain of nodes, each
/// `{ next: u64, key_len: u32, value_len: u32, inline: u8, _pad: [u8; 3] }` followed by the
/// key bytes and, if inline, the value bytes. `next == 0` ends the chain (iterator
/// exhausted); `next <= this node's own offset` (a "lower address") signals the batch is
/// full but the iterator has more to give — call `iter_next`.
fn parse_batch(buf: &[u8]) -> (Vec<(Vec<u8>, Option<Vec<u8>>)>, bool) {
    let mut nodes = Vec::new();
    if buf.len() < BATCH_NODE_HEADER_LEN {
        return (nodes, false);
    }
    let mut offset = 0usize;
    loop {
        if offset + BATCH_NODE_HEADER_LEN > buf.len() {
            break;
        }
        let next = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        let key_len = u32::from_le_bytes(buf[offset + 8..offset + 12].try_into().unwrap()) as usize;
        let value_len = u32::from_le_bytes(buf[offset + 12..offset + 16].try_into().unwrap()) as usize;
        let inline = buf[offset + 16] != 0;
        let key_start = offset + BATCH_NODE_HEADER_LEN;
        if key_start + key_len > buf.len() {
            break;
        }
        let key_bytes = buf[key_start..key_start + key_len].to_vec();
        let value_bytes = if inline {
            let v_start = key_start + key_len;
            if v_start + value_len > buf.len() {
                break;
            }
            Some(buf[v_start..v_start + value_len].to_vec())
        } else {
            None
        };
        nodes.push((key_bytes, value_bytes));

        if next == 0 {
            return (nodes, false);
        }
        if next as usize <= offset {
            return (nodes, true);
        }
        offset = next as usize;
    }
    (nodes, false)
}

/// A live iterator: holds the output buffer lease for its lifetime and releases the
/// engine-side state (`iter_finish`) on drop if the caller didn't already call it.
pub struct Iter<'a> {
    conn: &'a Connection,
    collection_id: u32,
    token: u32,
    out_buf: crate::pool::Lease<'a>,
    /// No more batches to fetch from the engine (`next_batch` is now a no-op).
    exhausted: bool,
    /// `iter_finish` has been issued; releasing engine-side state is done.
    finished: bool,
}

impl<'a> Iter<'a> {
    /// Starts an iterator over `[start, end]` and returns it along with the first batch.
    pub fn start(
        conn: &'a Connection,
        collection_id: u32,
        start: &[Dim],
        end: &[Dim],
        out_buf_len: usize,
    ) -> Result<(Self, Vec<Entry>)> {
        let (start_lease, start_len) = lease_encoded_key(conn, start)?;
        let end_len_needed = key::size_compute(end);
        let mut out_buf = conn.pool().lease(end_len_needed.max(out_buf_len))?;
        key::encode(out_buf.as_mut_slice(), end)?;

        let mut req = Request::new(RequestTag::IterStart);
        req.collection_id = collection_id;
        req.key_ptr = start_lease.offset();
        req.key_len = start_len;
        req.buf_ptr = out_buf.offset();
        req.buf_len = out_buf.len() as u32;

        let resp = blocking_call(conn, req, 0)?;
        let token = resp.token;
        let (raw, has_more) = if resp.length == 0 {
            (Vec::new(), false)
        } else {
            parse_batch(&out_buf.as_slice()[..resp.length as usize])
        };
        let mut iter = Iter { conn, collection_id, token, out_buf, exhausted: !has_more, finished: false };
        let entries = iter.materialise(raw)?;
        Ok((iter, entries))
    }

    fn materialise(&mut self, raw: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let value = match value {
                Some(v) => v,
                None => {
                    let view = crate::key::EncodedKey::from_bytes(&key)
                        .map_err(|e| CastleError::InvalidArgument(e.to_string()))?;
                    let dims: Vec<Dim> = (0..view.dim_count())
                        .map(|i| Dim::with_flags(view.element_data(i).unwrap(), view.element_flags(i).unwrap()))
                        .collect();
                    get(self.conn, self.collection_id, &dims)?
                }
            };
            entries.push(Entry { key, value });
        }
        Ok(entries)
    }

    /// Fetches the next batch. Returns an empty vec once the iterator is exhausted.
    pub fn next_batch(&mut self) -> Result<Vec<Entry>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let mut req = Request::new(RequestTag::IterNext);
        req.token = self.token;
        req.buf_ptr = self.out_buf.offset();
        req.buf_len = self.out_buf.len() as u32;
        let resp = blocking_call(self.conn, req, self.token)?;
        let (raw, has_more) = if resp.length == 0 {
            (Vec::new(), false)
        } else {
            parse_batch(&self.out_buf.as_slice()[..resp.length as usize])
        };
        if !has_more {
            self.exhausted = true;
        }
        self.materialise(raw)
    }

    /// Releases engine-side iterator state. Idempotent; also called from `Drop` if the
    /// caller never calls it explicitly.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut req = Request::new(RequestTag::IterFinish);
        req.token = self.token;
        blocking_call(self.conn, req, self.token).map(|_| ())
    }
}

impl<'a> Drop for Iter<'a> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                log::warn!("iter_finish during drop failed: {e}");
            }
        }
    }
}

/// `iter_start` + repeated `iter_next` until `limit` entries are collected or the iterator
/// is exhausted; `iter_finish` is always issued before returning (§4.4.7).
pub fn get_slice(
    conn: &Connection,
    collection_id: u32,
    start: &[Dim],
    end: &[Dim],
    limit: usize,
    out_buf_len: usize,
) -> Result<Vec<Entry>> {
    let (mut iter, first) = Iter::start(conn, collection_id, start, end, out_buf_len)?;
    let mut entries = first;
    while entries.len() < limit {
        let batch = iter.next_batch()?;
        if batch.is_empty() {
            break;
        }
        entries.extend(batch);
    }
    entries.truncate(limit);
    iter.finish()?;
    Ok(entries)
}

/// Claims the disk slave backing `path` (§4.6), resolving it to a device number via
/// `stat(2)` first (original_source/`castle_convenience.c`'s `castle_claim_dev`, wrapping
/// `castle_claim` with `castle_device_to_devno`). Returns the slave id the engine assigns.
pub fn claim_dev(conn: &Connection, path: &Path) -> Result<u32> {
    let devno = device::device_number_for_path(path)?;
    control::call::<Claim>(conn.fd(), devno)
}

/// Attaches `version` for block-device access and returns the `/dev/...` path the engine's
/// assigned device number resolves to (original_source/`castle_convenience.c`'s
/// `castle_attach_dev`, wrapping `castle_attach` with `castle_devno_to_device`).
pub fn attach_dev(conn: &Connection, version: u32) -> Result<String> {
    let devno = control::call::<Attach>(conn.fd(), version)?;
    let minor = unsafe { libc::minor(devno as libc::dev_t) } as u32;
    Ok(conn.device_registry().path_for_minor(minor))
}

/// Detaches the device previously attached at `path` (`castle_convenience.c`'s
/// `castle_detach_dev`, wrapping `castle_detach` with `castle_device_to_devno`).
pub fn detach_dev(conn: &Connection, path: &Path) -> Result<()> {
    let devno = device::device_number_for_path(path)?;
    control::call::<Detach>(conn.fd(), devno)
}

/// Snapshots the device at `path`, returning the new version id (`castle_convenience.c`'s
/// `castle_snapshot_dev`, wrapping `castle_snapshot` with `castle_device_to_devno`).
pub fn snapshot_dev(conn: &Connection, path: &Path) -> Result<u32> {
    let devno = device::device_number_for_path(path)?;
    control::call::<Snapshot>(conn.fd(), devno)
}
