//! Stateful-operation reservation accounting (§4.4.4) — the correctness argument that keeps
//! the ring from deadlocking under stateful pressure.
//!
//! A naive "admit whenever a slot is free" rule breaks the moment a stateful operation (a
//! big-put, a big-get, an iterator) needs further submissions before it can ever produce a
//! response: fill the ring with enough such heads and no slot is ever freed again. The fix
//! reserves one ring slot per possible concurrently-active stateful slot (`N_STATEFUL` of
//! them, indexed by `token % N_STATEFUL`) and only lets that reservation be spent by a
//! continuation of an op that already holds it.

use std::sync::atomic::{AtomicU32, Ordering};

/// Tracks, for one connection, how many of its `N_STATEFUL` reservation slots are currently
/// backing an in-flight stateful operation.
pub struct Reservation {
    /// `outstanding[i]` is the number of in-flight requests carrying a token whose
    /// `token % n_stateful == i`. Nonzero means slot `i`'s reservation is currently spent.
    outstanding: Vec<AtomicU32>,
    /// Slots not currently backing any in-flight stateful op; starts at `n_stateful`.
    reserved: AtomicU32,
    n_stateful: u32,
}

impl Reservation {
    pub fn new(n_stateful: u32) -> Self {
        let mut outstanding = Vec::with_capacity(n_stateful as usize);
        outstanding.resize_with(n_stateful as usize, || AtomicU32::new(0));
        Reservation {
            outstanding,
            reserved: AtomicU32::new(n_stateful),
            n_stateful,
        }
    }

    pub fn n_stateful(&self) -> u32 {
        self.n_stateful
    }

    /// Current value of `reserved`, for admission checks and tests.
    pub fn reserved(&self) -> u32 {
        self.reserved.load(Ordering::Acquire)
    }

    fn slot(&self, token: u32) -> usize {
        (token % self.n_stateful) as usize
    }

    /// True if request `token` (0 meaning "non-stateful") is a continuation of a stateful op
    /// whose reservation is already spent — i.e. `outstanding[token % n_stateful] > 0`.
    pub fn is_continuation(&self, token: u32) -> bool {
        token != 0 && self.outstanding[self.slot(token)].load(Ordering::Acquire) > 0
    }

    /// The admissibility rule of §4.4.4: given the number of free ring slots and the
    /// request's token, is it admissible right now?
    pub fn admissible(&self, free_slots: u32, token: u32) -> bool {
        if self.is_continuation(token) {
            free_slots > 0
        } else {
            free_slots > self.reserved()
        }
    }

    /// Call once a request with this token has been admitted into the ring. Bumps
    /// `outstanding` for stateful tokens and, if this is the head of a new stateful op
    /// (pre-increment value was zero), consumes the reservation that was covering it.
    pub fn on_admit(&self, token: u32) {
        if token == 0 {
            return;
        }
        let slot = self.slot(token);
        let previous = self.outstanding[slot].fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            let prev_reserved = self.reserved.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev_reserved > 0, "reservation underflow on admit");
        }
    }

    /// Call once a response for this token has been drained. If the slot's outstanding
    /// count drops to zero, the op is finished and the reservation is re-established for
    /// future heads on that slot.
    pub fn on_complete(&self, token: u32) {
        if token == 0 {
            return;
        }
        let slot = self.slot(token);
        let previous = self.outstanding[slot].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "outstanding underflow on complete");
        if previous == 1 {
            let prev_reserved = self.reserved.fetch_add(1, Ordering::AcqRel);
            debug_assert!(prev_reserved < self.n_stateful, "reservation overflow on complete");
        }
    }

    /// Number of slot indices currently holding a nonzero outstanding count. Exposed for the
    /// `reserved == n_stateful - |{i : outstanding[i] > 0}|` invariant in tests.
    #[cfg(test)]
    fn active_slot_count(&self) -> u32 {
        self.outstanding
            .iter()
            .filter(|c| c.load(Ordering::Acquire) > 0)
            .count() as u32
    }
}
