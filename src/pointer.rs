use crate::offsets::OffsetTable;

use memflow::prelude::v1::*;

const UNTAGGED_INDIRECT_MASK: u64 = 0xffff_ffff_ffff_c000;
const TAGGED_INDIRECT_MASK: u64 = 0xffff_ffff_ffff_ffe0;

/// Turns raw pointer words read from kernel memory into canonical addresses.
///
/// Kernel pointers carry authentication or indirection tags in the bits above
/// the virtual address range. The range width is `64 - T1SZ_BOOT`, kernel
/// addresses have all bits above it set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointerNormalizer {
    t1sz: u32,
    smr: u64,
}

impl PointerNormalizer {
    /// `t1sz` must be in `1..64`, `OffsetTable` guarantees this.
    pub fn new(t1sz: u32, smr: u64) -> Self {
        debug_assert!(t1sz > 0 && t1sz < 64);
        Self { t1sz, smr }
    }

    pub fn from_offsets(offsets: &OffsetTable) -> Self {
        Self::new(offsets.t1sz_boot, offsets.smr)
    }

    /// Bits above the virtual address range.
    fn tag_mask(&self) -> u64 {
        !((1u64 << (64 - self.t1sz)) - 1)
    }

    /// Strips the pointer tag. Null is never tagged and stays null.
    pub fn normalize(&self, word: u64) -> u64 {
        if word == 0 {
            0
        } else {
            word | self.tag_mask()
        }
    }

    pub fn normalize_in_place(&self, word: &mut u64) {
        *word = self.normalize(*word);
    }

    pub fn address(&self, word: u64) -> Address {
        Address::from(self.normalize(word))
    }

    /// Tag pattern of the SMR indirection pointer class, right below the
    /// virtual address range.
    pub fn indirect_tag(&self) -> u64 {
        if self.t1sz > 62 {
            0
        } else {
            self.smr << (62 - self.t1sz)
        }
    }

    /// Normalizes an SMR protected table pointer.
    ///
    /// Builds emit either an untagged pointer, cut down to 16K granularity
    /// before retagging, or a pointer with tag bits and low flag bits set,
    /// cut down to 32 byte granularity.
    pub fn normalize_indirect(&self, word: u64) -> u64 {
        if word == 0 {
            return 0;
        }

        let tag = self.indirect_tag();
        let mask = if word & tag == 0 {
            UNTAGGED_INDIRECT_MASK
        } else {
            TAGGED_INDIRECT_MASK
        };

        let retagged = (word & mask & !tag) | tag;

        self.normalize(retagged)
    }

    pub fn indirect_address(&self, word: u64) -> Address {
        Address::from(self.normalize_indirect(word))
    }
}
