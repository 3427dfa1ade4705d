//! Synchronous device-control channel (C5, §4.5, §6.3).
//!
//! [`call`] is generic over [`ControlOp`][castle_proto::ControlOp] and turns any of the
//! table's zero-sized marker types into one `ioctl(2)`: pack the input, issue the call,
//! unpack the output or surface the engine's error. This is the "compile-time-resolved
//! table, one function generic over arity" design called for in §9's re-architecture note —
//! there is no per-opcode boilerplate beyond declaring the marker type in
//! `castle_proto::control`.
//!
//! `merge_start` is the one opcode with a variable-size payload (§4.5) and so cannot be
//! expressed as a fixed `Input`/`Output` pair; it is hand-written below, grounded in the same
//! pack-pointer-and-length convention the ring's `Request` records use for buffers.

use std::os::unix::io::RawFd;

use castle_proto::constants::{MERGE_START_OPCODE, PROTOCOL_VERSION};
use castle_proto::control::{Poke, ProtocolVersion};
use castle_proto::{ControlOp, EngineError};

use crate::error::{CastleError, Result};

/// Wire shape of a single control call: input, output, and an engine error code, all laid
/// out together so one pointer crosses the `ioctl` boundary. Mirrors `Request`/`Response`'s
/// flattened-union convention (`castle_proto::wire`) rather than a real tagged union, for the
/// same reason: stable layout without unsafe union access.
#[repr(C)]
struct ControlPayload<I: Copy, O: Copy> {
    input: I,
    output: O,
    err: i32,
}

/// Issues one control-plane call. `Op::OPCODE` is passed straight through as the `ioctl`
/// request number; the engine is assumed to demultiplex on it directly rather than via the
/// `_IOWR`-style encoding real Linux drivers use; this library never constructs one fd and
/// opcode ambiguous with the other.
pub fn call<Op: ControlOp>(fd: RawFd, input: Op::Input) -> Result<Op::Output> {
    let mut payload = ControlPayload::<Op::Input, Op::Output> {
        input,
        output: Op::Output::default(),
        err: 0,
    };
    let rc = unsafe { libc::ioctl(fd, Op::OPCODE as libc::c_ulong, &mut payload as *mut _) };
    if rc != 0 {
        log::warn!("control call {} failed at the ioctl boundary", Op::NAME);
        return Err(CastleError::Os(std::io::Error::last_os_error()));
    }
    if let Some(engine_err) = EngineError::from_code(payload.err) {
        log::debug!("control call {} returned engine error {engine_err}", Op::NAME);
        return Err(CastleError::Engine(engine_err));
    }
    Ok(payload.output)
}

/// Performs the connect-time protocol handshake (§4.5, §6.3, scenario S6). A mismatch is a
/// hard connect failure; the caller must not proceed to map the ring or spawn the completion
/// thread.
pub fn check_protocol_version(fd: RawFd) -> Result<()> {
    let reported = call::<ProtocolVersion>(fd, ())?;
    accept_reported_version(reported)
}

/// The comparison half of the handshake, split out from [`check_protocol_version`] so it can
/// be exercised without an `ioctl` — only a real character device (or a kernel-side fake) can
/// answer that call, which `MockEngine` deliberately does not attempt (§8, scenario S6).
fn accept_reported_version(reported: u32) -> Result<()> {
    if reported != PROTOCOL_VERSION {
        log::warn!(
            "protocol version mismatch: engine reports {reported}, client speaks {PROTOCOL_VERSION}"
        );
        return Err(CastleError::NoProtocol);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_version_is_accepted() {
        assert!(accept_reported_version(PROTOCOL_VERSION).is_ok());
    }

    #[test]
    fn mismatched_version_is_rejected() {
        let err = accept_reported_version(PROTOCOL_VERSION + 1).unwrap_err();
        assert!(matches!(err, CastleError::NoProtocol));
    }
}

/// Notifies the engine that the request ring transitioned from "caught up" to "behind"
/// (§4.4.2 step 3). Never called directly by application code.
pub fn poke(fd: RawFd) -> Result<()> {
    call::<Poke>(fd, ())
}

#[repr(C)]
struct MergeStartPayload {
    config_ptr: u64,
    config_len: u32,
    merge_id: u32,
    err: i32,
}

/// Starts a merge with an engine-defined, variable-size configuration blob. `config` must
/// reside in shared memory acquired from the allocator or pool (§4.2/§4.3) for the duration
/// of the call, the same requirement every ring request places on its buffers, even though
/// this call never touches the ring. Returns the engine-assigned merge id.
pub fn merge_start(fd: RawFd, config: &[u8], config_buf_offset: u64) -> Result<u32> {
    if config.is_empty() {
        return Err(CastleError::InvalidArgument("merge_start config must be non-empty".into()));
    }
    let mut payload = MergeStartPayload {
        config_ptr: config_buf_offset,
        config_len: config.len() as u32,
        merge_id: 0,
        err: 0,
    };
    let rc = unsafe { libc::ioctl(fd, MERGE_START_OPCODE as libc::c_ulong, &mut payload as *mut _) };
    if rc != 0 {
        return Err(CastleError::Os(std::io::Error::last_os_error()));
    }
    if let Some(engine_err) = EngineError::from_code(payload.err) {
        return Err(CastleError::Engine(engine_err));
    }
    Ok(payload.merge_id)
}
