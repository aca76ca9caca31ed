use std::fmt;

use serde::{Deserialize, Serialize};

/// Address space a varnode lives in.
///
/// The declaration order is the storage-location order used by the value
/// store's location index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Space {
    Const,
    Register,
    Unique,
    Ram,
    Stack,
}

impl Space {
    pub fn short_name(self) -> &'static str {
        match self {
            Space::Const => "#",
            Space::Register => "r",
            Space::Unique => "u",
            Space::Ram => "m",
            Space::Stack => "s",
        }
    }
}

/// A location within an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub space: Space,
    pub offset: u64,
}

impl Address {
    pub fn new(space: Space, offset: u64) -> Self {
        Self { space, offset }
    }

    pub fn constant(value: u64) -> Self {
        Self::new(Space::Const, value)
    }

    pub fn register(offset: u64) -> Self {
        Self::new(Space::Register, offset)
    }

    pub fn ram(offset: u64) -> Self {
        Self::new(Space::Ram, offset)
    }

    /// True if `[self, self+size)` and `[other, other+other_size)` share a byte.
    pub fn overlaps(&self, size: u32, other: &Address, other_size: u32) -> bool {
        if self.space != other.space || self.space == Space::Const {
            return false;
        }
        let end = self.offset.saturating_add(size as u64);
        let other_end = other.offset.saturating_add(other_size as u64);
        self.offset < other_end && other.offset < end
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}0x{:x}", self.space.short_name(), self.offset)
    }
}

/// Sequence number of an op: the machine address it was generated from plus
/// a unique sub-index. Ordered by address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNum {
    pub pc: u64,
    pub uniq: u32,
}

impl SeqNum {
    pub fn new(pc: u64, uniq: u32) -> Self {
        Self { pc, uniq }
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}:{}", self.pc, self.uniq)
    }
}

/// Inclusive-exclusive machine address range covered by a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Mask covering the low `size` bytes.
pub fn calc_mask(size: u32) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size)) - 1
    }
}

/// Smallest mask of the form `0..01..1` covering every set bit of `val`.
pub fn covering_mask(val: u64) -> u64 {
    match most_sig_bit(val) {
        None => 0,
        Some(63) => u64::MAX,
        Some(bit) => (1u64 << (bit + 1)) - 1,
    }
}

pub fn most_sig_bit(val: u64) -> Option<u32> {
    if val == 0 {
        None
    } else {
        Some(63 - val.leading_zeros())
    }
}

pub fn least_sig_bit(val: u64) -> Option<u32> {
    if val == 0 {
        None
    } else {
        Some(val.trailing_zeros())
    }
}

/// Sign-extend the low `size` bytes of `val` to 64 bits.
pub fn sign_extend(val: u64, size: u32) -> u64 {
    if size >= 8 {
        return val;
    }
    let bits = 8 * size;
    let shift = 64 - bits;
    (((val << shift) as i64) >> shift) as u64
}

/// True if the sign bit of a `size`-byte quantity is possibly set in `mask`.
pub fn sign_bit_set(mask: u64, size: u32) -> bool {
    let bits = 8 * size.min(8);
    mask & (1u64 << (bits - 1)) != 0
}
