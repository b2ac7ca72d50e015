// Copyright 2023 Oxide Computer Company
use super::*;

/*
 * Wire form of one paged chunk record, a little endian u32:
 *
 *   31      25 24 23                8 7       1 0
 *  |reserved |rk|  needs_rebuild     | verify  |v|
 *
 * These bit positions are part of the on-disk format.
 */
const VALID_SHIFT: u32 = 0;
const VERIFY_SHIFT: u32 = 1;
const VERIFY_MASK: u32 = 0x7f;
const NEEDS_REBUILD_SHIFT: u32 = 8;
const NEEDS_REBUILD_MASK: u32 = 0xffff;
const REKEY_SHIFT: u32 = 24;
const RESERVED_SHIFT: u32 = 25;
const RESERVED_MASK: u32 = 0x7f;

/// Which verify passes a chunk is waiting on.
#[derive(
    Deserialize,
    Serialize,
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    JsonSchema,
)]
pub struct VerifyBits(pub u8);

impl VerifyBits {
    pub const NONE: VerifyBits = VerifyBits(0);
    pub const USER_READ_WRITE: VerifyBits = VerifyBits(0x01);
    pub const USER_READ_ONLY: VerifyBits = VerifyBits(0x02);
    pub const ERROR: VerifyBits = VerifyBits(0x04);
    pub const INCOMPLETE_WRITE: VerifyBits = VerifyBits(0x08);
    pub const SYSTEM: VerifyBits = VerifyBits(0x10);

    pub fn contains(&self, other: VerifyBits) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: VerifyBits) {
        self.0 = (self.0 | other.0) & VERIFY_MASK as u8;
    }

    pub fn remove(&mut self, other: VerifyBits) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for VerifyBits {
    type Output = VerifyBits;

    fn bitor(self, rhs: VerifyBits) -> VerifyBits {
        VerifyBits((self.0 | rhs.0) & VERIFY_MASK as u8)
    }
}

/// One paged metadata record, describing one chunk of user data.
#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, JsonSchema,
)]
pub struct PagedChunkRecord {
    /// Cleared when the record could not be read back intact.  Nothing
    /// else in the record may be trusted until it is reconstructed.
    pub valid: bool,

    pub verify: VerifyBits,

    /// One bit per group position that must be rebuilt for this chunk.
    pub needs_rebuild: u16,

    /// Chunk is encrypted with the current key.
    pub rekey: bool,

    pub reserved: u8,
}

impl PagedChunkRecord {
    /// The record every chunk starts life with: valid, nothing pending.
    pub fn initialized() -> Self {
        PagedChunkRecord {
            valid: true,
            verify: VerifyBits::NONE,
            needs_rebuild: 0,
            rekey: false,
            reserved: 0,
        }
    }

    /// All bits clear.  Used as the mask for set and clear operations.
    pub fn empty() -> Self {
        PagedChunkRecord {
            valid: false,
            verify: VerifyBits::NONE,
            needs_rebuild: 0,
            rekey: false,
            reserved: 0,
        }
    }

    pub fn with_needs_rebuild(needs_rebuild: u16) -> Self {
        PagedChunkRecord {
            needs_rebuild,
            ..PagedChunkRecord::empty()
        }
    }

    pub fn with_verify(verify: VerifyBits) -> Self {
        PagedChunkRecord {
            verify,
            ..PagedChunkRecord::empty()
        }
    }

    pub fn to_wire(&self) -> u32 {
        (u32::from(self.valid) << VALID_SHIFT)
            | ((u32::from(self.verify.0) & VERIFY_MASK) << VERIFY_SHIFT)
            | ((u32::from(self.needs_rebuild) & NEEDS_REBUILD_MASK)
                << NEEDS_REBUILD_SHIFT)
            | (u32::from(self.rekey) << REKEY_SHIFT)
            | ((u32::from(self.reserved) & RESERVED_MASK) << RESERVED_SHIFT)
    }

    pub fn from_wire(word: u32) -> Self {
        PagedChunkRecord {
            valid: (word >> VALID_SHIFT) & 1 == 1,
            verify: VerifyBits(((word >> VERIFY_SHIFT) & VERIFY_MASK) as u8),
            needs_rebuild: ((word >> NEEDS_REBUILD_SHIFT)
                & NEEDS_REBUILD_MASK) as u16,
            rekey: (word >> REKEY_SHIFT) & 1 == 1,
            reserved: ((word >> RESERVED_SHIFT) & RESERVED_MASK) as u8,
        }
    }

    /// OR every bit of `mask` into this record.
    pub fn set_bits(&mut self, mask: &PagedChunkRecord) {
        *self = PagedChunkRecord::from_wire(self.to_wire() | mask.to_wire());
    }

    /// Clear every bit of `mask` from this record.
    pub fn clear_bits(&mut self, mask: &PagedChunkRecord) {
        *self = PagedChunkRecord::from_wire(self.to_wire() & !mask.to_wire());
    }

    /// True when every bit of `mask` is already set here.
    pub fn contains(&self, mask: &PagedChunkRecord) -> bool {
        self.to_wire() & mask.to_wire() == mask.to_wire()
    }

    pub fn is_position_rebuilding(&self, position: u32) -> bool {
        position < MAX_WIDTH && self.needs_rebuild & (1 << position) != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[test]
    fn wire_bit_positions() {
        assert_eq!(PagedChunkRecord::initialized().to_wire(), 0x0000_0001);
        assert_eq!(PagedChunkRecord::empty().to_wire(), 0);

        let r = PagedChunkRecord::with_verify(VerifyBits::USER_READ_WRITE);
        assert_eq!(r.to_wire(), 0x0000_0002);
        let r = PagedChunkRecord::with_verify(VerifyBits::SYSTEM);
        assert_eq!(r.to_wire(), 0x0000_0020);

        // Position 2 needs rebuild
        let r = PagedChunkRecord::with_needs_rebuild(0b100);
        assert_eq!(r.to_wire(), 0x0000_0400);
        let r = PagedChunkRecord::with_needs_rebuild(0x8000);
        assert_eq!(r.to_wire(), 0x0080_0000);

        let r = PagedChunkRecord {
            rekey: true,
            ..PagedChunkRecord::empty()
        };
        assert_eq!(r.to_wire(), 0x0100_0000);
    }

    #[test]
    fn reserved_bits_survive() {
        let r = PagedChunkRecord::from_wire(0xfe00_0001);
        assert_eq!(r.reserved, 0x7f);
        assert!(r.valid);
        assert_eq!(r.to_wire(), 0xfe00_0001);
    }

    #[test]
    fn set_and_clear_bits() {
        let mut r = PagedChunkRecord::initialized();
        r.set_bits(&PagedChunkRecord::with_needs_rebuild(0b101));
        r.set_bits(&PagedChunkRecord::with_verify(VerifyBits::ERROR));
        assert!(r.valid);
        assert_eq!(r.needs_rebuild, 0b101);
        assert!(r.verify.contains(VerifyBits::ERROR));
        assert!(r.is_position_rebuilding(2));
        assert!(!r.is_position_rebuilding(1));

        r.clear_bits(&PagedChunkRecord::with_needs_rebuild(0b001));
        assert_eq!(r.needs_rebuild, 0b100);
        assert!(r.valid);

        // Clearing a bit that is not set changes nothing
        let before = r;
        r.clear_bits(&PagedChunkRecord::with_verify(VerifyBits::SYSTEM));
        assert_eq!(r, before);
    }

    #[test]
    fn verify_bits_ops() {
        let mut v = VerifyBits::NONE;
        assert!(v.is_empty());
        v.insert(VerifyBits::USER_READ_ONLY);
        v.insert(VerifyBits::INCOMPLETE_WRITE);
        assert!(v.contains(VerifyBits::USER_READ_ONLY));
        assert!(!v.contains(VerifyBits::ERROR));
        v.remove(VerifyBits::USER_READ_ONLY);
        assert_eq!(v, VerifyBits::INCOMPLETE_WRITE);
        assert_eq!(
            VerifyBits::ERROR | VerifyBits::SYSTEM,
            VerifyBits(0x14)
        );
    }

    #[proptest]
    fn wire_form_is_lossless(word: u32) {
        prop_assert_eq!(PagedChunkRecord::from_wire(word).to_wire(), word);
    }

    #[proptest]
    fn set_then_contains(a: u32, b: u32) {
        let mut r = PagedChunkRecord::from_wire(a);
        let mask = PagedChunkRecord::from_wire(b);
        r.set_bits(&mask);
        prop_assert!(r.contains(&mask));
        r.clear_bits(&mask);
        prop_assert_eq!(r.to_wire() & b, 0);
    }
}
