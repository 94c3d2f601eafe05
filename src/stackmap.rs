//! Decoder for the compiler-emitted statepoint stack-map.
//!
//! The stack-map is a single contiguous binary section laid out as a header,
//! a per-function table (address, stack size, callsite count), a pool of
//! large constants, and then one variable-length record per callsite. Each
//! callsite record lists the locations that are live across the safepoint:
//! three leading constants (calling convention, statepoint flags, deopt
//! parameter count), the deopt parameters themselves, and finally the
//! tracked GC pointers as adjacent (base, derived) location pairs, every one
//! spilled to a stack slot. Records are 8-byte aligned; integers use the
//! endianness of the machine the map was emitted on, which is the machine
//! we decode on.
//!
//! Decoding is one-shot: [`build_table`] either yields a fully populated
//! [`FrameTable`] or fails with a [`StackMapError`]. There is no partial
//! success, since a collector working from half a table would misidentify
//! roots.

use deku::prelude::*;
use log::{debug, trace};

use crate::errors::StackMapError;
use crate::frametable::{FrameInfo, FrameTable, PointerSlot};

/// Every safepoint's location list starts with three constants: the calling
/// convention, the statepoint flags, and the deopt parameter count.
const NUM_PREFIX_CONSTANTS: usize = 3;

/// Serialised sizes of the records the decoder skips without decoding.
const CONSTANT_SIZE: usize = 8;
const LOCATION_SIZE: usize = 8;
const LIVEOUT_SIZE: usize = 4;

#[deku_derive(DekuRead)]
#[derive(Debug)]
struct StackMapHeader {
    num_functions: u32,
    num_constants: u32,
    num_records: u64,
}

#[deku_derive(DekuRead)]
#[derive(Clone, Copy, Debug)]
struct FunctionInfo {
    address: u64,
    stack_size: u64,
    callsite_count: u64,
}

#[deku_derive(DekuRead)]
#[derive(Debug)]
struct CallsiteHeader {
    code_offset: u32,
    _flags: u16,
    num_locations: u16,
}

/// Where a recorded value lives. Serialised as a single byte.
#[deku_derive(DekuRead)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[deku(type = "u8")]
pub enum LocationKind {
    Register = 1,
    Direct = 2,
    Indirect = 3,
    Constant = 4,
    ConstantIndex = 5,
}

/// A statepoint location record. The register number is part of the format
/// but carries no information here: tracked pointers are always spilled, so
/// their slots are identified by `offset` alone.
#[deku_derive(DekuRead)]
#[derive(Clone, Copy, Debug)]
struct Location {
    kind: LocationKind,
    _reserved: u8,
    _regnum: u16,
    offset: i32,
}

#[deku_derive(DekuRead)]
#[derive(Debug)]
struct LiveoutHeader {
    _padding: u16,
    num_liveouts: u16,
}

/// A byte-offset cursor over the raw stack-map. Fixed-layout records are
/// decoded one at a time; every advance is bounds-checked.
struct Decoder<'m> {
    data: &'m [u8],
    off: usize,
}

impl<'m> Decoder<'m> {
    fn new(data: &'m [u8]) -> Self {
        Self { data, off: 0 }
    }

    /// Decode one record at the cursor and advance past it.
    fn read<T: DekuContainerRead<'m>>(&mut self) -> Result<T, StackMapError> {
        let data = self.data;
        let tail = data
            .get(self.off..)
            .ok_or(StackMapError::Truncated { offset: self.off })?;
        let ((rest, _), value) = T::from_bytes((tail, 0)).map_err(|e| match e {
            DekuError::Incomplete(_) => StackMapError::Truncated { offset: self.off },
            source => StackMapError::Record {
                offset: self.off,
                source,
            },
        })?;
        self.off += tail.len() - rest.len();
        Ok(value)
    }

    /// Advance past `nbytes` bytes without decoding them.
    fn skip(&mut self, nbytes: usize) -> Result<(), StackMapError> {
        let end = self
            .off
            .checked_add(nbytes)
            .filter(|&end| end <= self.data.len())
            .ok_or(StackMapError::Truncated { offset: self.off })?;
        self.off = end;
        Ok(())
    }

    /// Round the cursor up to the next 8-byte boundary. Pad bytes are never
    /// read, so rounding past the end of an unpadded final record is
    /// harmless; any further read fails as truncated.
    fn align8(&mut self) {
        self.off = (self.off + 7) & !7;
    }
}

/// Decode a raw stack-map and build the frame table in one call.
///
/// `load_factor` trades table memory for shorter bucket scans: the table is
/// created with `ceil(records / load_factor) + 1` buckets and is never
/// resized. On any malformed input the whole decode fails; no partially
/// populated table can be observed.
pub fn build_table(stackmap: &[u8], load_factor: f64) -> Result<FrameTable, StackMapError> {
    let mut d = Decoder::new(stackmap);

    let header: StackMapHeader = d.read()?;
    debug!(
        "stack-map declares {} functions, {} large constants, {} callsite records",
        header.num_functions, header.num_constants, header.num_records
    );

    let mut funcs = Vec::with_capacity(usize::try_from(header.num_functions).unwrap());
    for _ in 0..header.num_functions {
        funcs.push(d.read::<FunctionInfo>()?);
    }

    // The large constant pool only backs ConstantIndex locations, which
    // never describe tracked pointers.
    d.skip(usize::try_from(header.num_constants).unwrap() * CONSTANT_SIZE)?;

    let mut table = FrameTable::new(usize::try_from(header.num_records).unwrap(), load_factor);

    // Callsite records carry no reference to their function; they appear
    // grouped in function-table order, so walk the two in parallel and move
    // to the next function once the current one's callsites are exhausted.
    let mut remaining_funcs = funcs.iter();
    let mut cur = remaining_funcs.next();
    let mut visited = 0u64;
    for record in 0..header.num_records {
        while let Some(func) = cur {
            if visited < func.callsite_count {
                break;
            }
            cur = remaining_funcs.next();
            visited = 0;
        }
        let func = cur.ok_or(StackMapError::OrphanCallsite { record })?;
        visited += 1;

        let frame = decode_callsite(&mut d, func)?;
        trace!(
            "callsite {:#x}: frame size {}, {} pointer slots",
            frame.ret_addr(),
            frame.frame_size(),
            frame.num_slots()
        );
        table.insert(frame);
    }

    debug!(
        "built frame table: {} frames in {} buckets",
        table.len(),
        table.num_buckets()
    );
    Ok(table)
}

/// Decode one callsite record into the frame it describes.
fn decode_callsite(d: &mut Decoder<'_>, func: &FunctionInfo) -> Result<FrameInfo, StackMapError> {
    let header: CallsiteHeader = d.read()?;
    let ret_addr = func.address + u64::from(header.code_offset);
    let num_locs = usize::from(header.num_locations);

    if num_locs < NUM_PREFIX_CONSTANTS {
        return Err(StackMapError::MissingConstants { ret_addr });
    }
    for _ in 0..NUM_PREFIX_CONSTANTS - 1 {
        let loc: Location = d.read()?;
        if loc.kind != LocationKind::Constant {
            return Err(StackMapError::MissingConstants { ret_addr });
        }
    }
    // The third constant's offset field holds the deopt parameter count.
    let deopt: Location = d.read()?;
    if deopt.kind != LocationKind::Constant {
        return Err(StackMapError::MissingConstants { ret_addr });
    }
    let remaining = num_locs - NUM_PREFIX_CONSTANTS;
    let num_deopt = usize::try_from(deopt.offset)
        .ok()
        .filter(|&n| n <= remaining)
        .ok_or(StackMapError::DeoptCount {
            ret_addr,
            count: deopt.offset,
        })?;
    // Deopt parameters may be located anywhere; skip them undecoded.
    d.skip(num_deopt * LOCATION_SIZE)?;

    let num_ptr_locs = remaining - num_deopt;
    if num_ptr_locs % 2 != 0 {
        return Err(StackMapError::UnpairedPointers {
            ret_addr,
            count: num_ptr_locs,
        });
    }

    // The rest of the location list is the tracked pointers, as adjacent
    // (base, derived) pairs spilled to stack slots.
    let num_pairs = num_ptr_locs / 2;
    let mut pairs = Vec::with_capacity(num_pairs);
    for _ in 0..num_pairs {
        let base: Location = d.read()?;
        let derived: Location = d.read()?;
        for loc in [&base, &derived] {
            if loc.kind != LocationKind::Indirect {
                return Err(StackMapError::UnspilledPointer {
                    ret_addr,
                    kind: loc.kind,
                });
            }
        }
        pairs.push((base, derived));
    }

    // Emit bases first, in stack-map order. A pair naming the same slot
    // twice is a base; any other pair derives from some base's slot.
    let mut slots = Vec::with_capacity(num_pairs);
    for (base, derived) in &pairs {
        if base.offset == derived.offset {
            slots.push(PointerSlot::Base {
                offset: base.offset,
            });
        }
    }
    let num_bases = slots.len();
    for (base, derived) in &pairs {
        if base.offset == derived.offset {
            continue;
        }
        // First match wins if two bases share a slot offset.
        let idx = slots[..num_bases]
            .iter()
            .position(|slot| slot.offset() == base.offset)
            .ok_or(StackMapError::OrphanDerived {
                ret_addr,
                offset: base.offset,
            })?;
        slots.push(PointerSlot::Derived {
            base: u16::try_from(idx).unwrap(),
            offset: derived.offset,
        });
    }

    let liveouts: LiveoutHeader = d.read()?;
    d.skip(usize::from(liveouts.num_liveouts) * LIVEOUT_SIZE)?;
    // The next callsite header starts on an 8-byte boundary.
    d.align8();

    Ok(FrameInfo::new(ret_addr, func.stack_size, slots))
}
