use crate::image::Patchfinder;
use crate::locator::{NonceTableLayout, ResolvedArray, SignatureLocator};
use crate::memory::KernelMemory;
use crate::pointer::PointerNormalizer;

use memflow::prelude::v1::*;

use dataview::Pod;
use log::*;
use once_cell::unsync::OnceCell;

/// Bound on every description and entitlement copied out of the kernel.
pub const MAX_STRING_LEN: usize = 0x100;

pub const CRYPTEX_BOOT_ENTITLEMENT: &str = "com.apple.private.img4.nonce.cryptex1.boot";

/// `img4_nonce_domain` as laid out in kernel memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod)]
pub struct RawNonceDomain {
    pub description: u64,
    pub entitlement: u64,
    pub unknown: u64,
    pub hash_length_fn: u64,
    pub accessible_fn: u64,
    pub domain_index: u64,
    pub generate_flag: u64,
    pub io_aes_accel_key: u64,
}

/// Domain descriptor referenced by a nonce slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod)]
pub struct RawNonceDescriptor {
    pub description: u64,
    pub unique_string: [u8; 9],
    pub pad: [u8; 0x27],
    pub entitlement: u64,
    pub domain_index: u64,
    pub unknown1: u64,
    pub unknown2: u64,
    pub select_chip_default_fn: u64,
    pub nonce_accessible_fn: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod)]
pub struct RawNonceSlot {
    pub descriptor: u64,
    pub init_fn: u64,
    pub lock_fn: u64,
    pub unlock_fn: u64,
    pub data: u64,
}

/// Owned copy of a nonce domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonceDomain {
    /// Runtime address the domain was read from.
    pub address: Address,
    pub description: String,
    pub entitlement: String,
    pub unknown: u64,
    pub hash_length_fn: Address,
    pub accessible_fn: Address,
    /// Index of the domain's seed in the nonce seeds blob.
    pub domain_index: u64,
    pub generate_flag: u64,
    pub io_aes_accel_key: u64,
}

/// Owned copy of the descriptor of a nonce slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonceDescriptor {
    pub address: Address,
    pub description: String,
    pub entitlement: String,
    /// Short name of the domain, e.g. `img4c1bt`.
    pub unique_name: String,
    pub domain_index: u64,
    pub unknown1: u64,
    pub unknown2: u64,
    pub select_chip_default_fn: Address,
    pub nonce_accessible_fn: Address,
}

impl NonceDescriptor {
    /// NVRAM key the slot's seed is stored under, `krn.` followed by the
    /// unique name without its 4 character prefix.
    pub fn seed_key(&self) -> String {
        format!("krn.{}", self.unique_name.get(4..).unwrap_or(""))
    }
}

/// Owned copy of a nonce slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonceSlot {
    pub address: Address,
    /// `None` when the slot has no readable descriptor.
    pub descriptor: Option<NonceDescriptor>,
    pub init_fn: Address,
    pub lock_fn: Address,
    pub unlock_fn: Address,
    pub data: Address,
}

/// Snapshot of the nonce table. Empty array slots stay `None` so positions
/// keep matching the kernel's indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NonceTable {
    Domains(Vec<Option<NonceDomain>>),
    Slots(Vec<Option<NonceSlot>>),
}

impl NonceTable {
    pub fn layout(&self) -> NonceTableLayout {
        match self {
            NonceTable::Domains(_) => NonceTableLayout::Domain,
            NonceTable::Slots(_) => NonceTableLayout::Slot,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NonceTable::Domains(d) => d.len(),
            NonceTable::Slots(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entitlement guarding the entry at `idx`.
    pub fn entitlement(&self, idx: usize) -> Option<&str> {
        match self {
            NonceTable::Domains(d) => d.get(idx)?.as_ref().map(|d| d.entitlement.as_str()),
            NonceTable::Slots(s) => s
                .get(idx)?
                .as_ref()?
                .descriptor
                .as_ref()
                .map(|d| d.entitlement.as_str()),
        }
    }

    /// Position of the entry guarded by `entitlement`.
    pub fn position(&self, entitlement: &str) -> Option<usize> {
        (0..self.len()).find(|&i| self.entitlement(i) == Some(entitlement))
    }
}

/// Builds and keeps the snapshot of the live kernel's nonce table.
pub struct DomainSlotDecoder {
    locator: SignatureLocator,
    normalizer: PointerNormalizer,
    slide: u64,
    table: OnceCell<NonceTable>,
}

impl DomainSlotDecoder {
    /// `slide` is the KASLR slide added to the unslid array address.
    pub fn new(locator: SignatureLocator, normalizer: PointerNormalizer, slide: u64) -> Self {
        Self {
            locator,
            normalizer,
            slide,
            table: OnceCell::new(),
        }
    }

    pub fn locator(&self) -> &SignatureLocator {
        &self.locator
    }

    /// Snapshot of the table, read on first use.
    pub fn table(
        &self,
        mem: &mut impl KernelMemory,
        pf: &mut impl Patchfinder,
    ) -> Result<&NonceTable> {
        self.table.get_or_try_init(|| {
            let array = self.locator.find_array(pf)?;
            let base = Address::from(array.address.to_umem().wrapping_add(self.slide));

            info!(
                "{} nonce {:?} entries at {:x}",
                array.count, array.layout, base
            );

            self.read_table(mem, base, &array)
        })
    }

    fn read_table(
        &self,
        mem: &mut impl KernelMemory,
        base: Address,
        array: &ResolvedArray,
    ) -> Result<NonceTable> {
        match array.layout {
            NonceTableLayout::Domain => (0..array.count)
                .map(|i| match self.element(mem, base, i)? {
                    Some(addr) => self.read_domain(mem, addr),
                    None => Ok(None),
                })
                .collect::<Result<_>>()
                .map(NonceTable::Domains),
            NonceTableLayout::Slot => (0..array.count)
                .map(|i| match self.element(mem, base, i)? {
                    Some(addr) => self.read_slot(mem, addr).map(Some),
                    None => Ok(None),
                })
                .collect::<Result<_>>()
                .map(NonceTable::Slots),
        }
    }

    fn element(
        &self,
        mem: &mut impl KernelMemory,
        base: Address,
        idx: usize,
    ) -> Result<Option<Address>> {
        let slot = base + idx * std::mem::size_of::<u64>();
        let word = mem.read_u64(slot).map_err(|err| {
            warn!("unable to read nonce table entry {} at {:x}", idx, slot);
            err
        })?;

        let addr = self.normalizer.address(word);
        if addr.is_null() {
            debug!("nonce table entry {} is empty", idx);
            Ok(None)
        } else {
            Ok(Some(addr))
        }
    }

    fn read_string(&self, mem: &mut impl KernelMemory, word: u64) -> Option<String> {
        let addr = self.normalizer.address(word);
        if addr.is_null() {
            return None;
        }

        mem.read_cstring(addr, MAX_STRING_LEN)
            .map_err(|err| warn!("unable to read string at {:x}: {}", addr, err))
            .ok()
    }

    fn read_domain(&self, mem: &mut impl KernelMemory, addr: Address) -> Result<Option<NonceDomain>> {
        let raw: RawNonceDomain = mem.read_pod(addr)?;

        let strings = self
            .read_string(mem, raw.description)
            .zip(self.read_string(mem, raw.entitlement));

        let (description, entitlement) = match strings {
            Some(strings) => strings,
            None => {
                warn!("nonce domain at {:x} has no readable strings", addr);
                return Ok(None);
            }
        };

        debug!(
            "nonce domain {} at {:x}: {} ({})",
            raw.domain_index, addr, entitlement, description
        );

        Ok(Some(NonceDomain {
            address: addr,
            description,
            entitlement,
            unknown: raw.unknown,
            hash_length_fn: self.normalizer.address(raw.hash_length_fn),
            accessible_fn: self.normalizer.address(raw.accessible_fn),
            domain_index: raw.domain_index,
            generate_flag: raw.generate_flag,
            io_aes_accel_key: raw.io_aes_accel_key,
        }))
    }

    fn read_descriptor(&self, mem: &mut impl KernelMemory, addr: Address) -> Option<NonceDescriptor> {
        let raw: RawNonceDescriptor = mem
            .read_pod(addr)
            .map_err(|err| warn!("unable to read nonce descriptor at {:x}: {}", addr, err))
            .ok()?;

        let description = self.read_string(mem, raw.description)?;
        let entitlement = self.read_string(mem, raw.entitlement)?;

        let name_len = raw
            .unique_string
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(raw.unique_string.len());
        let unique_name = String::from_utf8_lossy(&raw.unique_string[..name_len]).into_owned();

        debug!(
            "nonce descriptor {} at {:x}: {} {} ({})",
            raw.domain_index, addr, unique_name, entitlement, description
        );

        Some(NonceDescriptor {
            address: addr,
            description,
            entitlement,
            unique_name,
            domain_index: raw.domain_index,
            unknown1: raw.unknown1,
            unknown2: raw.unknown2,
            select_chip_default_fn: self.normalizer.address(raw.select_chip_default_fn),
            nonce_accessible_fn: self.normalizer.address(raw.nonce_accessible_fn),
        })
    }

    fn read_slot(&self, mem: &mut impl KernelMemory, addr: Address) -> Result<NonceSlot> {
        let raw: RawNonceSlot = mem.read_pod(addr)?;

        let descriptor = match self.normalizer.address(raw.descriptor) {
            desc if desc.is_null() => {
                debug!("nonce slot at {:x} has no descriptor", addr);
                None
            }
            desc => self.read_descriptor(mem, desc),
        };

        Ok(NonceSlot {
            address: addr,
            descriptor,
            init_fn: self.normalizer.address(raw.init_fn),
            lock_fn: self.normalizer.address(raw.lock_fn),
            unlock_fn: self.normalizer.address(raw.unlock_fn),
            data: self.normalizer.address(raw.data),
        })
    }

    pub fn list_domains(
        &self,
        mem: &mut impl KernelMemory,
        pf: &mut impl Patchfinder,
    ) -> Result<&[Option<NonceDomain>]> {
        match self.table(mem, pf)? {
            NonceTable::Domains(domains) => Ok(domains),
            NonceTable::Slots(_) => Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)),
        }
    }

    pub fn list_slots(
        &self,
        mem: &mut impl KernelMemory,
        pf: &mut impl Patchfinder,
    ) -> Result<&[Option<NonceSlot>]> {
        match self.table(mem, pf)? {
            NonceTable::Slots(slots) => Ok(slots),
            NonceTable::Domains(_) => Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)),
        }
    }

    /// Position of the entry guarded by `entitlement` in the table.
    pub fn index_of(
        &self,
        mem: &mut impl KernelMemory,
        pf: &mut impl Patchfinder,
        entitlement: &str,
    ) -> Result<usize> {
        self.table(mem, pf)?.position(entitlement).ok_or_else(|| {
            debug!("no nonce entry for {}", entitlement);
            Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
        })
    }

    /// Seed index the kernel assigns to the domain guarded by `entitlement`.
    pub fn domain_index_of(
        &self,
        mem: &mut impl KernelMemory,
        pf: &mut impl Patchfinder,
        entitlement: &str,
    ) -> Result<u64> {
        let idx = self.index_of(mem, pf, entitlement)?;

        let domain_index = match self.table(mem, pf)? {
            NonceTable::Domains(d) => d.get(idx).and_then(Option::as_ref).map(|d| d.domain_index),
            NonceTable::Slots(s) => s
                .get(idx)
                .and_then(Option::as_ref)
                .and_then(|s| s.descriptor.as_ref())
                .map(|d| d.domain_index),
        };

        domain_index.ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }

    pub fn cryptex_boot_index(
        &self,
        mem: &mut impl KernelMemory,
        pf: &mut impl Patchfinder,
    ) -> Result<usize> {
        self.index_of(mem, pf, CRYPTEX_BOOT_ENTITLEMENT)
    }
}
