use memflow::prelude::v1::*;

use dataview::Pod;

use std::collections::BTreeMap;

/// Raw access to kernel virtual memory.
///
/// One read per field, no batching. Implementations serialize their own
/// access if they are shared.
pub trait KernelMemory {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()>;

    fn read_u32(&mut self, addr: Address) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, addr: Address) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_raw_into(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_pod<T: Pod>(&mut self, addr: Address) -> Result<T>
    where
        Self: Sized,
    {
        let mut out = T::zeroed();
        self.read_raw_into(addr, out.as_bytes_mut())?;
        Ok(out)
    }

    /// Reads a NUL terminated string of at most `max_len` bytes.
    ///
    /// Reads in 16 byte aligned chunks and falls back to single bytes when a
    /// chunk runs past the end of the mapping.
    fn read_cstring(&mut self, addr: Address, max_len: usize) -> Result<String> {
        const CHUNK: u64 = 0x10;

        let mut out = Vec::new();
        let mut cur = addr.to_umem();

        while out.len() < max_len {
            let len = ((CHUNK - cur % CHUNK) as usize).min(max_len - out.len());
            let mut buf = [0u8; CHUNK as usize];

            if self.read_raw_into(cur.into(), &mut buf[..len]).is_err() {
                for i in 0..len {
                    self.read_raw_into((cur + i as u64).into(), &mut buf[i..=i])?;
                    if buf[i] == 0 {
                        break;
                    }
                }
            }

            if let Some(nul) = buf[..len].iter().position(|&b| b == 0) {
                out.extend_from_slice(&buf[..nul]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }

            out.extend_from_slice(&buf[..len]);
            cur += len as u64;
        }

        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl<T: KernelMemory + ?Sized> KernelMemory for &mut T {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        (**self).read_raw_into(addr, out)
    }
}

/// Serves kernel reads from any memflow memory view, e.g. a connector
/// wrapped in a virtual translation layer.
pub struct MemflowView<T>(pub T);

impl<T: MemoryView> KernelMemory for MemflowView<T> {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        self.0.read_raw_into(addr, out)?;
        Ok(())
    }
}

/// Disjoint mapped regions of an address space.
///
/// A read has to lie entirely within one region, everything else is
/// unreadable.
#[derive(Clone, Debug, Default)]
pub struct SparseMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `data` at `base`, replacing any region starting at the same base.
    pub fn map(&mut self, base: Address, data: Vec<u8>) {
        self.regions.insert(base.to_umem(), data);
    }

    fn region_mut(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        let (&base, data) = self.regions.range_mut(..=addr).next_back()?;
        let start = (addr - base) as usize;
        let end = start.checked_add(len)?;

        data.get_mut(start..end)
    }

    /// Overwrites mapped bytes.
    pub fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        let region = self
            .region_mut(addr.to_umem(), bytes.len())
            .ok_or(Error(ErrorOrigin::VirtualMemory, ErrorKind::OutOfBounds))?;
        region.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(&mut self, addr: Address, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: Address, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

impl KernelMemory for SparseMemory {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        let region = self
            .region_mut(addr.to_umem(), out.len())
            .ok_or(Error(ErrorOrigin::VirtualMemory, ErrorKind::UnableToReadMemory))?;
        out.copy_from_slice(region);
        Ok(())
    }
}
