//! Decode failures.
//!
//! The taxonomy is deliberately binary: a stack-map either satisfies every
//! structural invariant and decodes completely, or it is rejected with one
//! of the variants below and no table is produced. There is nothing to
//! recover from: a malformed map means a compiler or toolchain bug, and a
//! runtime that cannot identify its GC roots must not keep running.

use deku::DekuError;
use thiserror::Error;

use crate::stackmap::LocationKind;

#[derive(Debug, Error)]
pub enum StackMapError {
    /// The buffer ended before the structure it claims to hold.
    #[error("stack-map truncated at byte {offset}")]
    Truncated { offset: usize },

    /// A fixed-layout record failed to decode.
    #[error("malformed record at byte {offset}: {source}")]
    Record { offset: usize, source: DekuError },

    /// A callsite's location list did not start with the three constants
    /// (calling convention, flags, deopt count) every safepoint carries.
    #[error("callsite {ret_addr:#x}: expected three leading constant locations")]
    MissingConstants { ret_addr: u64 },

    /// The deopt parameter count was negative or ran past the location list.
    #[error("callsite {ret_addr:#x}: bad deopt parameter count {count}")]
    DeoptCount { ret_addr: u64, count: i32 },

    /// Tracked pointers come in (base, derived) pairs, so an odd number of
    /// pointer locations cannot be paired up.
    #[error("callsite {ret_addr:#x}: odd number of tracked pointer locations ({count})")]
    UnpairedPointers { ret_addr: u64, count: usize },

    /// A tracked pointer was not spilled to a stack slot. Safepoints require
    /// every live GC pointer in a stack slot, so any other location kind
    /// here is a lowering bug.
    #[error("callsite {ret_addr:#x}: tracked pointer in a {kind:?} location, not a stack slot")]
    UnspilledPointer { ret_addr: u64, kind: LocationKind },

    /// A derived pointer referenced a base slot that does not exist in this
    /// callsite's base prefix.
    #[error("callsite {ret_addr:#x}: derived pointer has no base at frame offset {offset}")]
    OrphanDerived { ret_addr: u64, offset: i32 },

    /// More callsite records than the functions' callsite counts account
    /// for.
    #[error("callsite record {record} is not covered by any function")]
    OrphanCallsite { record: u64 },
}
