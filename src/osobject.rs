use crate::memory::KernelMemory;
use crate::offsets::{OffsetTable, OsValueKind};
use crate::pointer::PointerNormalizer;

use memflow::prelude::v1::*;

use dataview::Pod;
use log::*;

/// Longest dictionary key compared, including its terminator.
pub const MAX_KEY_LEN: usize = 0x400;

/// One `OSDictionary` bucket.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod)]
struct RawDictEntry {
    key: u64,
    value: u64,
}

/// Payload of a dictionary value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DictValue {
    pub address: Address,
    pub length: usize,
}

/// Reads `OSDictionary`, `OSString` and `OSData` objects of a live kernel.
pub struct ObjectWalker<'a> {
    offsets: &'a OffsetTable,
    normalizer: PointerNormalizer,
}

impl<'a> ObjectWalker<'a> {
    pub fn new(offsets: &'a OffsetTable) -> Self {
        Self {
            offsets,
            normalizer: PointerNormalizer::from_offsets(offsets),
        }
    }

    /// Payload pointer of `object` viewed as `kind`.
    pub fn cast(
        &self,
        mem: &mut impl KernelMemory,
        object: Address,
        kind: OsValueKind,
    ) -> Result<Address> {
        let word = mem.read_u64(object + self.offsets.os_value(kind))?;
        let payload = self.normalizer.address(word);

        if payload.is_null() {
            debug!("{:?} at {:x} has no payload", kind, object);
            return Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound));
        }

        Ok(payload)
    }

    /// Payload length of `object` viewed as `kind`.
    ///
    /// `OSString` packs its length above 14 flag bits and counts the
    /// terminator. `OSData` keeps the plain byte count.
    pub fn length(
        &self,
        mem: &mut impl KernelMemory,
        object: Address,
        kind: OsValueKind,
    ) -> Result<usize> {
        let word = mem.read_u32(object + self.offsets.os_metabase_size)?;

        Ok(match kind {
            OsValueKind::String => (word >> 14) as usize,
            OsValueKind::Data => word as usize,
        })
    }

    fn key_matches(
        &self,
        mem: &mut impl KernelMemory,
        object: Address,
        wanted: &str,
    ) -> Result<bool> {
        let len = self.length(mem, object, OsValueKind::String)?;
        if len == 0 || len > MAX_KEY_LEN {
            debug!("implausible key length {} at {:x}", len, object);
            return Ok(false);
        }

        let chars = self.cast(mem, object, OsValueKind::String)?;
        let mut key = vec![0u8; len];
        mem.read_raw_into(chars, &mut key)?;

        let end = key.iter().position(|&b| b == 0).unwrap_or(len);

        Ok(&key[..end] == wanted.as_bytes())
    }

    /// Looks `key` up in the dictionary `container`.
    ///
    /// The bucket array holds one slot more than the dictionary reports, all
    /// of them are scanned. Buckets that fail to read are skipped.
    pub fn lookup(
        &self,
        mem: &mut impl KernelMemory,
        container: Address,
        key: &str,
        kind: OsValueKind,
    ) -> Result<DictValue> {
        let buckets = self
            .normalizer
            .address(mem.read_u64(container + self.offsets.os_dict)?);
        let size = mem.read_u32(container + self.offsets.os_dict_size)? as usize;

        if buckets.is_null() || size == 0 {
            debug!("dictionary at {:x} is empty", container);
            return Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound));
        }

        trace!("dictionary at {:x}: {} entries at {:x}", container, size, buckets);

        for i in 0..=size {
            let bucket = buckets + i * std::mem::size_of::<RawDictEntry>();

            let entry: RawDictEntry = match mem.read_pod(bucket) {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("bucket {} at {:x} unreadable: {}", i, bucket, err);
                    continue;
                }
            };

            if entry.key == 0 {
                continue;
            }

            match self.key_matches(mem, self.normalizer.address(entry.key), key) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    debug!("key of bucket {} unreadable: {}", i, err);
                    continue;
                }
            }

            let value = self.normalizer.address(entry.value);
            let found = self
                .cast(mem, value, kind)
                .and_then(|address| Ok((address, self.length(mem, value, kind)?)));

            match found {
                Ok((address, length)) => {
                    debug!("{} = {:?} at {:x} ({} bytes)", key, kind, address, length);
                    return Ok(DictValue { address, length });
                }
                Err(err) => debug!("value of {} unreadable: {}", key, err),
            }
        }

        debug!("{} not in dictionary at {:x}", key, container);
        Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }
}
