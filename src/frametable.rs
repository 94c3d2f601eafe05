//! The frame table: a return-address-keyed index of live pointer slots.
//!
//! The table is populated once, while the stack-map is decoded, and is
//! immutable from then on. Lookups happen inside a stop-the-world pause, one
//! per walked frame, so the layout favours the read side: a fixed array of
//! buckets, each owning its entries directly, scanned linearly on lookup.
//! There is no resizing, rehashing or removal.

use std::io::{self, Write};
use std::mem;

/// One live pointer slot at a callsite, identified by its byte offset from
/// the frame base.
///
/// A base pointer points at the start of a managed object. A derived pointer
/// points into (or one past the end of) an object and must be relocated
/// together with its base; `base` is the index of that base within the same
/// frame's slot array. [`FrameInfo`] stores all bases before all derived
/// slots, so the index always refers backwards into the base prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerSlot {
    Base { offset: i32 },
    Derived { base: u16, offset: i32 },
}

impl PointerSlot {
    /// The byte offset of the spill slot relative to the frame base.
    /// Negative offsets lie above the recorded base.
    pub fn offset(&self) -> i32 {
        match self {
            Self::Base { offset } => *offset,
            Self::Derived { offset, .. } => *offset,
        }
    }
}

/// Everything the collector needs to know about one callsite's frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameInfo {
    ret_addr: u64,
    frame_size: u64,
    slots: Vec<PointerSlot>,
}

impl FrameInfo {
    /// Create a frame record. `slots` must hold all base slots before any
    /// derived slot, with each derived slot's `base` indexing that prefix.
    pub fn new(ret_addr: u64, frame_size: u64, slots: Vec<PointerSlot>) -> Self {
        debug_assert!(u16::try_from(slots.len()).is_ok());
        Self {
            ret_addr,
            frame_size,
            slots,
        }
    }

    /// The absolute return address identifying this callsite.
    pub fn ret_addr(&self) -> u64 {
        self.ret_addr
    }

    /// Size in bytes of the function's stack frame.
    pub fn frame_size(&self) -> u64 {
        self.frame_size
    }

    pub fn num_slots(&self) -> u16 {
        // The constructor checked the length fits.
        u16::try_from(self.slots.len()).unwrap()
    }

    pub fn slots(&self) -> &[PointerSlot] {
        &self.slots
    }

    /// The in-memory footprint of this record, as accounted by its bucket.
    pub fn byte_size(&self) -> usize {
        mem::size_of::<Self>() + self.slots.len() * mem::size_of::<PointerSlot>()
    }

    /// Write the human-readable form of this frame to `w`.
    pub fn print<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "frame for return address {:#x}:", self.ret_addr)?;
        writeln!(w, "  frame size: {}", self.frame_size)?;
        writeln!(w, "  num slots: {}", self.num_slots())?;
        for slot in &self.slots {
            match slot {
                PointerSlot::Base { offset } => {
                    writeln!(w, "  kind: base ptr, frame offset: {}", offset)?;
                }
                PointerSlot::Derived { base, offset } => {
                    writeln!(
                        w,
                        "  kind: ptr derived from slot #{}, frame offset: {}",
                        base, offset
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Print myself to stderr. Provided as a debugging aid.
    #[allow(dead_code)]
    pub fn dump(&self) {
        self.print(&mut io::stderr()).unwrap();
    }
}

/// Frames whose return addresses hash to the same index, owned back-to-back.
#[derive(Clone, Debug, Default)]
struct Bucket {
    entries: Vec<FrameInfo>,
    /// Total bytes occupied by the entries, for the diagnostic dump.
    size_of_entries: usize,
}

/// A fixed-size hash table from return address to [`FrameInfo`].
///
/// Built once by the stack-map decoder, then read-only. Insertions and
/// lookups must not be interleaved; after construction the table may be
/// shared freely between reader threads.
#[derive(Debug)]
pub struct FrameTable {
    buckets: Vec<Bucket>,
}

/// One round of xorshift64* over the key. The multiplier is the standard
/// xorshift64* constant and must not change: bucket assignment has to be
/// reproducible across implementations.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(2685821657736338717)
}

impl FrameTable {
    /// Create an empty table sized for `expected` frames at the given load
    /// factor: `ceil(expected / load_factor) + 1` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `load_factor` is not positive.
    pub fn new(expected: usize, load_factor: f64) -> Self {
        assert!(load_factor > 0.0, "load factor must be positive");
        let size = (expected as f64 / load_factor).ceil() as usize + 1;
        Self {
            buckets: vec![Bucket::default(); size],
        }
    }

    fn bucket_index(&self, key: u64) -> usize {
        let size = u64::try_from(self.buckets.len()).unwrap();
        usize::try_from(mix(key) % size).unwrap()
    }

    /// Move `frame` into the table, keyed by its return address.
    ///
    /// Return addresses are expected to be unique across a well-formed
    /// stack-map; inserting a duplicate is caught under debug assertions,
    /// and otherwise leaves lookups returning the first-inserted frame.
    pub fn insert(&mut self, frame: FrameInfo) {
        debug_assert!(
            self.lookup(frame.ret_addr).is_none(),
            "duplicate return address {:#x}",
            frame.ret_addr
        );
        let idx = self.bucket_index(frame.ret_addr);
        let bucket = &mut self.buckets[idx];
        bucket.size_of_entries += frame.byte_size();
        bucket.entries.push(frame);
    }

    /// Look up the frame for a return address observed during a stack walk.
    ///
    /// `None` means the address is not a safepoint the stack-map describes;
    /// the walker interprets that per its own policy.
    pub fn lookup(&self, ret_addr: u64) -> Option<&FrameInfo> {
        self.buckets[self.bucket_index(ret_addr)]
            .entries
            .iter()
            .find(|f| f.ret_addr == ret_addr)
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of frames stored.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over every stored frame, in bucket order.
    pub fn frames(&self) -> impl Iterator<Item = &FrameInfo> {
        self.buckets.iter().flat_map(|b| b.entries.iter())
    }

    /// Write the human-readable form of the whole table to `w`.
    pub fn print<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "frame table with {} buckets:", self.buckets.len())?;
        for (i, bucket) in self.buckets.iter().enumerate() {
            writeln!(
                w,
                "bucket {}: {} entries, {} bytes",
                i,
                bucket.entries.len(),
                bucket.size_of_entries
            )?;
            for frame in &bucket.entries {
                frame.print(w)?;
            }
        }
        Ok(())
    }

    /// Print myself to stderr. Provided as a debugging aid.
    #[allow(dead_code)]
    pub fn dump(&self) {
        self.print(&mut io::stderr()).unwrap();
    }
}
