//! Connection lifecycle and the ring submission/completion machinery (C4, §4.4, §5, §9).
//!
//! Two locks guard the submission path, deliberately kept separate per §9's
//! "thread-safety via one overloaded mutex" re-architecture note:
//! - `admission`: held for the whole duration of one [`Connection::submit_batch`] call,
//!   exactly the role the source's single mutex plays across `castle_request_send` (serialise
//!   submitters, batch-admit several requests before one publish, double as the condition
//!   variable's mutex while blocked on admission).
//! - `producer`: a short-held lock purely for the producer-private index arithmetic and the
//!   final publish — never held across a wait.
//!
//! The completion thread never takes `admission`; it updates reservation/callback state
//! through their own locks and notifies `admission_cv` without holding it, which is sound
//! for `std::sync::Condvar` (a notifier need not hold the paired mutex).

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use castle_proto::Request;

use crate::callback::{CallbackEntry, CallbackTable};
use crate::config::CastleOptions;
use crate::control;
use crate::device::DeviceRegistry;
use crate::error::{CastleError, Result};
use crate::pool::BufferPool;
use crate::reservation::Reservation;
use crate::ring::RingMap;
use crate::trace::TraceConfig;

/// Connection lifecycle state (§9 "completion-thread tear-down races").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Open,
    Draining,
    Closed,
}

struct ProducerState {
    req_prod_pvt: u32,
}

/// A handle to an open connection to the engine. Cheap to clone via `Arc`; the completion
/// thread holds its own `Arc` so the connection outlives any one caller until `disconnect`
/// (or the last `Arc` drop, which calls it) tears it down.
pub struct Connection {
    fd: RawFd,
    ring: RingMap,
    pool: BufferPool,
    callbacks: CallbackTable,
    reservation: Reservation,
    producer: Mutex<ProducerState>,
    admission: Mutex<()>,
    admission_cv: Condvar,
    state: Mutex<ConnState>,
    wake_read_fd: RawFd,
    wake_write_fd: RawFd,
    completion_thread: Mutex<Option<JoinHandle<()>>>,
    trace: Option<TraceConfig>,
    device_registry: DeviceRegistry,
}

// All interior mutability is behind Mutex/Condvar/atomics; the raw fds are only ever used
// through libc calls that are themselves thread-safe for distinct operations on a shared fd.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl Connection {
    /// Opens `path` read-write, performs the protocol handshake, maps the ring, pre-maps the
    /// buffer pool, and spawns the completion thread. A protocol mismatch is a hard failure:
    /// the fd is closed and nothing else is set up (scenario S6).
    pub fn connect(path: &Path, options: &CastleOptions, buffers_per_class: usize) -> Result<Arc<Connection>> {
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| CastleError::InvalidArgument("device path contains a NUL byte".into()))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(CastleError::Os(std::io::Error::last_os_error()));
        }

        if let Err(e) = control::check_protocol_version(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        log::info!("protocol handshake ok, connecting to {}", path.display());

        Self::build(fd, options, buffers_per_class)
    }

    /// Test-only entry point used by the `MockEngine` harness (§8, §10.4): builds a
    /// connection directly over an already-open fd (a `memfd`, in practice), skipping the
    /// protocol-version handshake ioctl that only a real character device can answer. The
    /// ring/pool mapping, admission control, completion thread, and reservation accounting —
    /// the actual subject of this library — run unmodified; only the device-specific
    /// handshake is bypassed.
    #[cfg(feature = "test-support")]
    pub fn connect_mocked(fd: RawFd, options: &CastleOptions, buffers_per_class: usize) -> Result<Arc<Connection>> {
        Self::build(fd, options, buffers_per_class)
    }

    fn build(fd: RawFd, options: &CastleOptions, buffers_per_class: usize) -> Result<Arc<Connection>> {
        let ring = match RingMap::map(fd, options.ring.capacity) {
            Ok(r) => r,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let pool_base = crate::page_align(castle_proto::RingHeader::mapping_size(options.ring.capacity) as u64);
        let pool = match BufferPool::new_at(fd, &options.pool, buffers_per_class, pool_base) {
            Ok(p) => p,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let mut wake_fds = [0i32; 2];
        if unsafe { libc::pipe(wake_fds.as_mut_ptr()) } != 0 {
            let err = CastleError::Os(std::io::Error::last_os_error());
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let (wake_read_fd, wake_write_fd) = (wake_fds[0], wake_fds[1]);
        if let Err(e) = set_nonblocking(wake_read_fd) {
            unsafe {
                libc::close(fd);
                libc::close(wake_read_fd);
                libc::close(wake_write_fd);
            }
            return Err(CastleError::Os(e));
        }

        let trace = TraceConfig::from_env();

        let conn = Arc::new(Connection {
            fd,
            ring,
            pool,
            callbacks: CallbackTable::new(options.ring.capacity),
            reservation: Reservation::new(options.ring.n_stateful),
            producer: Mutex::new(ProducerState { req_prod_pvt: 0 }),
            admission: Mutex::new(()),
            admission_cv: Condvar::new(),
            state: Mutex::new(ConnState::Connecting),
            wake_read_fd,
            wake_write_fd,
            completion_thread: Mutex::new(None),
            trace,
            device_registry: DeviceRegistry::new(),
        });

        *conn.state.lock().expect("state mutex poisoned") = ConnState::Open;

        let thread_conn = conn.clone();
        let handle = std::thread::Builder::new()
            .name("castle-completion".into())
            .spawn(move || thread_conn.completion_loop())
            .map_err(CastleError::Os)?;
        *conn.completion_thread.lock().expect("completion thread mutex poisoned") = Some(handle);

        Ok(conn)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The minor-indexed device-path cache used by the `*_dev` convenience wrappers in
    /// [`crate::ops`] (§4.6) — one per connection, mirroring the original's process-wide
    /// `devnames` table but scoped to the connection instead.
    pub fn device_registry(&self) -> &DeviceRegistry {
        &self.device_registry
    }

    pub fn n_stateful(&self) -> u32 {
        self.reservation.n_stateful()
    }

    /// Current value of the stateful reservation counter — exposed for testable property #2
    /// and scenario S3 ("`reserved` is observed to be exactly 1 while the big-put is in
    /// flight").
    pub fn reserved(&self) -> u32 {
        self.reservation.reserved()
    }

    fn is_open(&self) -> bool {
        *self.state.lock().expect("state mutex poisoned") == ConnState::Open
    }

    /// Submits `requests`, each paired with the callback that will receive its response (or
    /// a synthetic `Unattached` if the connection is torn down first), under one hold of the
    /// admission lock (§4.4.2).
    pub fn submit_batch(&self, mut requests: Vec<(Request, CallbackEntry)>) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        if !self.is_open() {
            return Err(CastleError::Unattached);
        }

        let mut admission_guard = self.admission.lock().expect("admission mutex poisoned");
        let observed_req_prod_before_batch = self.ring.req_prod();

        for (mut req, entry) in requests.drain(..) {
            let token = entry.token;
            loop {
                if !self.is_open() {
                    return Err(CastleError::Unattached);
                }
                let prod_pvt = self.producer.lock().expect("producer mutex poisoned").req_prod_pvt;
                let free = self.ring.free_slots(prod_pvt);
                if self.reservation.admissible(free, token) {
                    break;
                }
                log::trace!("submission blocked on admission control (token {token}, free {free})");
                admission_guard = self
                    .admission_cv
                    .wait(admission_guard)
                    .expect("admission mutex poisoned while waiting");
            }

            let call_id = match self.callbacks.acquire(entry) {
                Some(id) => id,
                None => {
                    // Admission control guarantees a free callback slot exists whenever a
                    // request is admissible, since the table's capacity equals the ring's.
                    unreachable!("callback table exhausted despite admission control")
                }
            };
            req.call_id = call_id;
            self.reservation.on_admit(token);

            let mut p = self.producer.lock().expect("producer mutex poisoned");
            self.ring.write_request(p.req_prod_pvt, &req);
            p.req_prod_pvt = p.req_prod_pvt.wrapping_add(1);
        }

        let p = self.producer.lock().expect("producer mutex poisoned");
        let new_prod = p.req_prod_pvt;
        drop(p);

        // "Notify required" per §4.4.2 step 3: the engine had fully caught up to our
        // previously-published producer index before this batch admitted anything new.
        let notify_required = self.ring.req_cons() == observed_req_prod_before_batch;
        self.ring.publish_req_prod(new_prod);
        drop(admission_guard);

        if notify_required {
            if let Err(e) = control::poke(self.fd) {
                log::warn!("poke failed after publishing {} request(s): {e}", new_prod);
            }
        }
        Ok(())
    }

    pub fn submit_one(&self, request: Request, entry: CallbackEntry) -> Result<()> {
        self.submit_batch(vec![(request, entry)])
    }

    /// Idempotent: flips lifecycle state, wakes and joins the completion thread, delivers
    /// synthetic `Unattached` completions to anything still in flight, then closes the fd.
    /// The ring/pool mappings are reclaimed by their own `Drop` impls when `Connection`
    /// itself is dropped.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if *state != ConnState::Open {
                return;
            }
            *state = ConnState::Draining;
        }
        log::info!("disconnecting");
        self.admission_cv.notify_all();

        let byte = [1u8];
        if unsafe { libc::write(self.wake_write_fd, byte.as_ptr() as *const libc::c_void, 1) } < 0 {
            log::warn!("failed to wake completion thread: {}", std::io::Error::last_os_error());
        }

        if let Some(handle) = self
            .completion_thread
            .lock()
            .expect("completion thread mutex poisoned")
            .take()
        {
            let _ = handle.join();
        }

        for entry in self.callbacks.drain_all() {
            (entry.callback)(Err(CastleError::Unattached));
        }

        *self.state.lock().expect("state mutex poisoned") = ConnState::Closed;
        self.admission_cv.notify_all();

        unsafe {
            libc::close(self.wake_read_fd);
            libc::close(self.wake_write_fd);
            libc::close(self.fd);
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.wake_read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    fn dispatch_response(&self, resp: castle_proto::Response) {
        if let Some(trace) = &self.trace {
            trace.trace_response(&resp);
        }
        match self.callbacks.take(resp.call_id) {
            Some(entry) => {
                self.reservation.on_complete(entry.token);
                (entry.callback)(Ok(resp));
            }
            None => {
                log::warn!("response for unknown or already-completed call_id {}", resp.call_id);
            }
        }
    }

    fn completion_loop(self: Arc<Self>) {
        let mut rsp_cons_local: u32 = 0;
        loop {
            let mut fds = [
                libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 },
                libc::pollfd { fd: self.wake_read_fd, events: libc::POLLIN, revents: 0 },
            ];
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("completion thread poll failed: {err}");
                break;
            }
            if fds[1].revents & libc::POLLIN != 0 {
                self.drain_wake_pipe();
            }

            // Final-check pattern (§4.4.3 step 3): keep draining until a pass observes no
            // new responses, publishing `rsp_cons` once per full drain.
            loop {
                let rsp_prod = self.ring.rsp_prod();
                if rsp_cons_local == rsp_prod {
                    break;
                }
                while rsp_cons_local != rsp_prod {
                    let resp = self.ring.read_response(rsp_cons_local);
                    rsp_cons_local = rsp_cons_local.wrapping_add(1);
                    self.dispatch_response(resp);
                }
                self.ring.publish_rsp_cons(rsp_cons_local);
            }
            self.admission_cv.notify_all();

            if !self.is_open() {
                break;
            }
        }
        log::debug!("completion thread exiting");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
