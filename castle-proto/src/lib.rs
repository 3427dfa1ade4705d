//! Wire-compatible types shared between the castle client library and the kernel-resident
//! engine: the device node's constants, the ring/request/response layout (§3, §6.2 of the
//! design), the control-opcode table (§4.5, §6.3), and the engine error-code space (§6.6).
//!
//! Everything here is `#[repr(C)]` or otherwise layout-fixed; nothing in this crate touches
//! an actual file descriptor or issues a syscall — that is `castle-client`'s job. Keeping the
//! wire shapes in their own crate means the contract with the engine is visible independently
//! of the transport logic that drives it.

pub mod constants;
pub mod control;
pub mod error;
pub mod wire;

pub use control::ControlOp;
pub use error::EngineError;
pub use wire::{Request, RequestTag, Response, RingHeader};
