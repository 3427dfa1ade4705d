//! Callback-slot table (§3 "Callback slot", §4.4.2, §4.4.3).
//!
//! Exactly one slot per potential in-flight request — the table's length is fixed at the
//! ring's capacity — indexed by `call_id`. Free slots are threaded into a free list guarded
//! by its own mutex, deliberately distinct from the ring's submission/admission lock (§9,
//! "thread-safety via one overloaded mutex"): the completion thread returns slots to this
//! list without ever touching the submission path's lock, and submitters take from it the
//! same way.

use std::sync::Mutex;

use castle_proto::Response;

use crate::error::Result;

/// What the completion thread needs to finish a request: the function to call and the
/// opaque pointer-sized user-data to call it with, plus the token it was submitted under
/// (so the reservation counters can be updated on completion without re-deriving it from the
/// request).
///
/// The callback takes `Result<Response>` rather than a bare `Response` so that disconnect's
/// synthetic completions (§4.4.3, §9 "completion-thread tear-down races") can deliver
/// `Err(CastleError::Unattached)` through the same path a real response takes, instead of
/// needing a side channel callers would also have to check.
pub struct CallbackEntry {
    pub callback: Box<dyn FnOnce(Result<Response>) + Send>,
    pub token: u32,
}

struct Slot {
    entry: Option<CallbackEntry>,
    next_free: Option<usize>,
}

struct Inner {
    slots: Vec<Slot>,
    free_head: Option<usize>,
}

/// A fixed-size table of callback slots with an intrusive free list.
pub struct CallbackTable {
    inner: Mutex<Inner>,
}

impl CallbackTable {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity as usize;
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                entry: None,
                next_free: if i + 1 < capacity { Some(i + 1) } else { None },
            });
        }
        CallbackTable {
            inner: Mutex::new(Inner {
                slots,
                free_head: if capacity > 0 { Some(0) } else { None },
            }),
        }
    }

    /// Detaches a free slot and records `entry` into it, returning the slot index to use as
    /// `call_id`. `None` means the table is exhausted — callers should never observe this if
    /// admission control (§4.4.4) is respected, since the table's capacity equals the ring's.
    pub fn acquire(&self, entry: CallbackEntry) -> Option<u32> {
        let mut inner = self.inner.lock().expect("callback table mutex poisoned");
        let idx = inner.free_head?;
        inner.free_head = inner.slots[idx].next_free;
        inner.slots[idx].entry = Some(entry);
        Some(idx as u32)
    }

    /// Removes and returns the entry at `call_id`, returning the slot to the free list.
    /// Returns `None` if `call_id` is out of range or was already vacated (a malformed or
    /// duplicate response from the engine — callers should log and skip, not panic).
    pub fn take(&self, call_id: u32) -> Option<CallbackEntry> {
        let mut inner = self.inner.lock().expect("callback table mutex poisoned");
        let idx = call_id as usize;
        let entry = inner.slots.get_mut(idx)?.entry.take()?;
        inner.slots[idx].next_free = inner.free_head;
        inner.free_head = Some(idx);
        Some(entry)
    }

    /// Drains every still-occupied slot, returning their entries. Used by disconnect to
    /// deliver synthetic "unattached" completions to whatever was still in flight (§4.4.3,
    /// §9 "completion-thread tear-down races").
    pub fn drain_all(&self) -> Vec<CallbackEntry> {
        let mut inner = self.inner.lock().expect("callback table mutex poisoned");
        let mut drained = Vec::new();
        let len = inner.slots.len();
        for idx in 0..len {
            if let Some(entry) = inner.slots[idx].entry.take() {
                drained.push(entry);
                inner.slots[idx].next_free = inner.free_head;
                inner.free_head = Some(idx);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn dummy_response() -> Response {
        Response { call_id: 0, err: 0, length: 0, token: 0 }
    }

    #[test]
    fn acquire_assigns_distinct_call_ids() {
        let table = CallbackTable::new(4);
        let a = table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).unwrap();
        let b = table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn table_exhausts_after_capacity_acquires() {
        let table = CallbackTable::new(2);
        assert!(table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).is_some());
        assert!(table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).is_some());
        assert!(table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).is_none());
    }

    #[test]
    fn take_invokes_via_caller_and_frees_slot() {
        let table = CallbackTable::new(1);
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        let id = table
            .acquire(CallbackEntry {
                callback: Box::new(move |r| {
                    seen2.store(r.unwrap().call_id + 1, Ordering::SeqCst);
                }),
                token: 7,
            })
            .unwrap();
        let entry = table.take(id).unwrap();
        assert_eq!(entry.token, 7);
        (entry.callback)(Ok(dummy_response()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // slot freed: capacity-1 table can acquire again
        assert!(table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).is_some());
    }

    #[test]
    fn take_on_vacant_slot_returns_none() {
        let table = CallbackTable::new(2);
        assert!(table.take(0).is_none());
    }

    #[test]
    fn drain_all_empties_every_occupied_slot() {
        let table = CallbackTable::new(3);
        table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).unwrap();
        table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).unwrap();
        let drained = table.drain_all();
        assert_eq!(drained.len(), 2);
        // table is fully free again
        for _ in 0..3 {
            assert!(table.acquire(CallbackEntry { callback: Box::new(|_| {}), token: 0 }).is_some());
        }
    }
}
