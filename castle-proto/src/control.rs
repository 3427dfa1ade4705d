//! Declarative control-opcode table (§4.5, §6.3, and the "Macro-generated control surface"
//! design note in §9).
//!
//! The source materialises ~40 control entrypoints from a table via textual macros. Here
//! the table is a set of zero-sized types implementing [`ControlOp`], one per opcode, each
//! fixing an engine-assigned numeric code and a pair of fixed-size input/output payloads.
//! `castle_client::control` turns each into an actual synchronous `ioctl(2)` call by being
//! generic over `ControlOp` — the seven arity archetypes the design note calls for
//! (0in0out, 1in0out, 1in1out, 2in0out, 2in1out, 3in1out, 0in1out) fall out naturally as
//! `Input`/`Output` being `()`, `u32`, `(u32, u32)`, or `(u32, u32, u32)`.
//!
//! Enumerating every opcode the engine understands is explicitly out of scope (§1); one
//! representative opcode per arity archetype is wired up below, and `merge_start` is called
//! out as the one entry with a variable-size payload that cannot go through this table at
//! all (§4.5) — it is hand-written in `castle_client::control`.

use core::fmt::Debug;

/// A single control-plane opcode: a numeric code plus its input/output shape.
///
/// Implementations are zero-sized marker types; the opcode number and payload shapes are
/// associated constants/types so the whole table is resolved at compile time with no
/// runtime dispatch.
pub trait ControlOp {
    /// Name used in trace output and error messages.
    const NAME: &'static str;
    /// The engine-assigned opcode number. Must match the engine bit-for-bit (§6.3).
    const OPCODE: u32;
    /// Fixed-size input payload; `()` for archetypes with no input.
    type Input: Copy + Debug;
    /// Fixed-size output payload; `()` for archetypes with no output.
    type Output: Copy + Debug + Default;
}

macro_rules! control_op {
    ($(#[$meta:meta])* $name:ident = $code:expr => ($in_ty:ty, $out_ty:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl ControlOp for $name {
            const NAME: &'static str = stringify!($name);
            const OPCODE: u32 = $code;
            type Input = $in_ty;
            type Output = $out_ty;
        }
    };
}

// --- 0in0out -----------------------------------------------------------------------------
control_op!(
    /// Initialise engine-side state for this connection. Issued once, at connect.
    Init = 1 => ((), ())
);
control_op!(
    /// Ask a slave node to scan for stray collections. No payload either direction.
    SlaveScan = 2 => ((), ())
);
control_op!(TraceStart = 3 => ((), ()));
control_op!(TraceStop = 4 => ((), ()));
control_op!(TraceTeardown = 5 => ((), ()));
control_op!(
    /// Notifies the engine that the request ring transitioned from "caught up" to
    /// "behind" (§4.4.2 step 3). Never called directly by application code.
    Poke = 6 => ((), ())
);

// --- 1in0out -------------------------------------------------------------------------------
control_op!(
    /// Detaches the device number previously returned by an [`Attach`] call. Input is that
    /// device number, not a collection id (original_source/`castle_convenience.c`'s
    /// `castle_detach`/`castle_detach_dev`).
    Detach = 11 => (u32, ())
);
control_op!(DeleteVersion = 12 => (u32, ()));
control_op!(Fault = 13 => (u32, ()));
control_op!(SlaveEvacuate = 14 => (u32, ()));
control_op!(CollectionReattach = 15 => (u32, ()));
control_op!(CollectionDetach = 16 => (u32, ()));
control_op!(VertreeDestroy = 17 => (u32, ()));
control_op!(VertreeCompact = 18 => (u32, ()));
control_op!(MergeThread = 19 => (u32, ()));
control_op!(MergeStop = 20 => (u32, ()));
control_op!(ControlProgramDeregister = 21 => (u32, ()));
control_op!(ControlProgramHeartbeat = 22 => (u32, ()));
control_op!(InsertRateSet = 23 => (u32, ()));
control_op!(ReadRateSet = 24 => (u32, ()));
control_op!(TraceSetup = 25 => (u32, ()));

// --- 1in1out -------------------------------------------------------------------------------
control_op!(
    /// Attaches `version` for block-device access; returns the device number the engine
    /// assigned it (original_source/`castle_convenience.c`'s `castle_attach`/
    /// `castle_attach_dev`, which resolves that device number back to a `/dev/...` path).
    Attach = 10 => (u32, u32)
);
control_op!(
    /// Takes a snapshot of the device numbered by the input; returns the new version id
    /// (original_source/`castle_convenience.c`'s `castle_snapshot`/`castle_snapshot_dev`).
    Snapshot = 30 => (u32, u32)
);
control_op!(
    /// Claims the disk slave identified by the input device number; returns its slave id
    /// (original_source/`castle_convenience.c`'s `castle_claim`/`castle_claim_dev`).
    Claim = 31 => (u32, u32)
);
control_op!(
    /// Clones a version; returns the new version id.
    Clone = 32 => (u32, u32)
);
control_op!(CollectionSnapshot = 33 => (u32, u32));

// --- 2in0out -------------------------------------------------------------------------------
control_op!(ThreadPriority = 40 => ((u32, u32), ()));
control_op!(CollectionAttach = 41 => ((u32, u32), ()));
control_op!(MergeAttach = 42 => ((u32, u32), ()));
control_op!(ControlProgramRegister = 43 => ((u32, u32), ()));
control_op!(EnvironmentSet = 44 => ((u32, u32), ()));

// --- 2in1out -------------------------------------------------------------------------------
control_op!(
    /// Drives `unit_count` units of merge work; returns the number of units actually done.
    MergeDoWork = 50 => ((u32, u32), u32)
);

// --- 3in1out -------------------------------------------------------------------------------
control_op!(
    /// Creates a new collection (`size_hint`, `flags`) under `parent_collection_id`;
    /// returns the new collection id.
    CreateCollection = 60 => ((u32, u32, u32), u32)
);

// --- 0in1out -------------------------------------------------------------------------------
control_op!(
    /// Protocol-version handshake, performed once at connect (§4.5). A mismatch is a hard
    /// connect failure (`CastleError::NoProtocol`).
    ProtocolVersion = 70 => ((), u32)
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_distinct() {
        let codes = [
            Init::OPCODE,
            SlaveScan::OPCODE,
            TraceStart::OPCODE,
            TraceStop::OPCODE,
            TraceTeardown::OPCODE,
            Poke::OPCODE,
            Attach::OPCODE,
            Detach::OPCODE,
            DeleteVersion::OPCODE,
            Fault::OPCODE,
            SlaveEvacuate::OPCODE,
            CollectionReattach::OPCODE,
            CollectionDetach::OPCODE,
            VertreeDestroy::OPCODE,
            VertreeCompact::OPCODE,
            MergeThread::OPCODE,
            MergeStop::OPCODE,
            ControlProgramDeregister::OPCODE,
            ControlProgramHeartbeat::OPCODE,
            InsertRateSet::OPCODE,
            ReadRateSet::OPCODE,
            TraceSetup::OPCODE,
            Snapshot::OPCODE,
            Claim::OPCODE,
            Clone::OPCODE,
            CollectionSnapshot::OPCODE,
            ThreadPriority::OPCODE,
            CollectionAttach::OPCODE,
            MergeAttach::OPCODE,
            ControlProgramRegister::OPCODE,
            EnvironmentSet::OPCODE,
            MergeDoWork::OPCODE,
            CreateCollection::OPCODE,
            ProtocolVersion::OPCODE,
        ];
        for (i, a) in codes.iter().enumerate() {
            for (j, b) in codes.iter().enumerate() {
                assert!(i == j || a != b, "duplicate opcode {a} shared by entries {i} and {j}");
            }
        }
    }

    #[test]
    fn names_match_type_names() {
        assert_eq!(Claim::NAME, "Claim");
        assert_eq!(ProtocolVersion::NAME, "ProtocolVersion");
    }
}
