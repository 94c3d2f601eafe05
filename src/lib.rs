//! Stack-map driven frame tables for a precise, safepoint-based garbage
//! collector.
//!
//! A compiler that supports precise collection arranges for every live
//! GC-visible pointer to be spilled to the stack at each safepoint, and
//! records where those spill slots are in a binary stack-map section. This
//! crate decodes that section and builds an in-memory table keyed by return
//! address: during a collection the runtime walks the stack, and for each
//! return address it observes, [`FrameTable::lookup`] returns the frame's
//! size and the ordered set of live pointer slots (bases first, then
//! pointers derived from them) that the collector must trace and relocate.
//!
//! Construction is one-shot: [`build_table`] decodes the raw stack-map bytes
//! and returns a fully populated [`FrameTable`], or an error describing why
//! the map is unusable. A runtime that cannot identify its roots cannot
//! safely continue, so callers are expected to treat any error as fatal.
//! Once built, the table is immutable and lookups are safe from any number
//! of threads without synchronisation. Dropping the table releases all of
//! its storage.

mod errors;
pub mod frametable;
pub mod stackmap;

pub use errors::StackMapError;
pub use frametable::{FrameInfo, FrameTable, PointerSlot};
pub use stackmap::{build_table, LocationKind};
