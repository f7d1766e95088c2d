use crate::image::Patchfinder;
use crate::locator::{ResolvedArray, SignatureLocator};
use crate::memory::KernelMemory;
use crate::nonce::{DomainSlotDecoder, NonceDomain, NonceSlot, NonceTable};
use crate::offsets::{OffsetTable, OsValueKind};
use crate::osobject::{DictValue, ObjectWalker};
use crate::pointer::PointerNormalizer;
use crate::version::KernelBuild;

use memflow::prelude::v1::*;

use log::*;

/// One live kernel: its memory, its kernelcache and everything resolved
/// against them.
pub struct Kernel<Mem, Image> {
    mem: Mem,
    image: Image,
    build: KernelBuild,
    slide: u64,
    offsets: OffsetTable,
    nonce: DomainSlotDecoder,
}

impl<Mem: KernelMemory, Image: Patchfinder> Kernel<Mem, Image> {
    /// Fails if the offset table can not be built for `build`.
    pub fn new(mem: Mem, mut image: Image, build: KernelBuild, slide: u64) -> Result<Self> {
        let offsets = OffsetTable::new(&build, &mut image)?;

        let nonce = DomainSlotDecoder::new(
            SignatureLocator::new(&build),
            PointerNormalizer::from_offsets(&offsets),
            slide,
        );

        info!("{}, slide {:#x}", build, slide);

        Ok(Self {
            mem,
            image,
            build,
            slide,
            offsets,
            nonce,
        })
    }

    pub fn build(&self) -> &KernelBuild {
        &self.build
    }

    pub fn slide(&self) -> u64 {
        self.slide
    }

    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    pub fn normalizer(&self) -> PointerNormalizer {
        PointerNormalizer::from_offsets(&self.offsets)
    }

    pub fn mem(&mut self) -> &mut Mem {
        &mut self.mem
    }

    /// Unslid address and length of the nonce table.
    pub fn nonce_array(&mut self) -> Result<ResolvedArray> {
        self.nonce.locator().find_array(&mut self.image)
    }

    /// Looks `key` up in the `OSDictionary` at `container`.
    pub fn lookup(&mut self, container: Address, key: &str, kind: OsValueKind) -> Result<DictValue> {
        ObjectWalker::new(&self.offsets).lookup(&mut self.mem, container, key, kind)
    }

    pub fn nonce_table(&mut self) -> Result<&NonceTable> {
        self.nonce.table(&mut self.mem, &mut self.image)
    }

    pub fn nonce_domains(&mut self) -> Result<&[Option<NonceDomain>]> {
        self.nonce.list_domains(&mut self.mem, &mut self.image)
    }

    pub fn nonce_slots(&mut self) -> Result<&[Option<NonceSlot>]> {
        self.nonce.list_slots(&mut self.mem, &mut self.image)
    }

    pub fn index_of(&mut self, entitlement: &str) -> Result<usize> {
        self.nonce.index_of(&mut self.mem, &mut self.image, entitlement)
    }

    pub fn domain_index_of(&mut self, entitlement: &str) -> Result<u64> {
        self.nonce
            .domain_index_of(&mut self.mem, &mut self.image, entitlement)
    }

    pub fn cryptex_boot_index(&mut self) -> Result<usize> {
        self.nonce.cryptex_boot_index(&mut self.mem, &mut self.image)
    }

    pub fn into_inner(self) -> (Mem, Image) {
        (self.mem, self.image)
    }
}
