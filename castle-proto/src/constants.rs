//! Device paths, environment variables, and protocol constants.
//!
//! These name a single fictitious engine ("castle") the way the reference stack names its
//! own driver; swap `ENGINE_NAME` (and the paths derived from it) if you are wiring this
//! library to a different device.

/// Name of the engine, used to build default device and sysfs paths.
pub const ENGINE_NAME: &str = "castle";

/// Default control device. `open(2)` for read-write is the connection.
pub const CONTROL_DEVICE_PATH: &str = "/dev/castle/control";

/// Prefix for per-minor device paths, e.g. `/dev/castle-3`. See `castle_client::device`.
pub const DEVICE_PATH_PREFIX: &str = "/dev/castle-";

/// Root of the sysfs-like collection directory (§6.5). Each collection is a subdirectory
/// named by its hex id, containing a `name` file whose first line is the collection name.
pub const SYSFS_COLLECTIONS_DIR: &str = "/sys/fs/castle/collections";

/// Comma list of `reqs|values|stats|resps` enabling trace categories.
pub const ENV_DEBUG: &str = "CASTLE_DEBUG";
/// Path to a trace sink file. Takes precedence over `ENV_DEBUG_FD`.
pub const ENV_DEBUG_FILE: &str = "CASTLE_DEBUG_FILE";
/// An already-open fd number to use as the trace sink.
pub const ENV_DEBUG_FD: &str = "CASTLE_DEBUG_FD";

/// Protocol version this client speaks. Checked against the engine at connect time; any
/// mismatch is a hard connect failure (`EngineError`/`CastleError::NoProtocol`).
pub const PROTOCOL_VERSION: u32 = 7;

/// Default ring capacity (must be a power of two).
pub const DEFAULT_RING_CAPACITY: u32 = 1024;

/// Default number of stateful reservation slots.
pub const DEFAULT_N_STATEFUL: u32 = 16;

/// A page-sized inline buffer is attempted before a point-get upgrades to big-get (§4.4.6).
pub const INLINE_GET_BUFFER: usize = 4096;

/// Chunk size used by the big-put/big-get streaming path (§4.4.6).
pub const BIG_TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

/// Opcode for the hand-written `merge_start` control call (§4.5), which takes a
/// variable-size configuration payload and so cannot go through the [`crate::ControlOp`]
/// table alongside the fixed-arity entries in `castle_proto::control`.
pub const MERGE_START_OPCODE: u32 = 90;
