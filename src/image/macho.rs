use super::{Patchfinder, Section, SectionRef, SectionScanner};
use crate::arm64::InsnPattern;
use crate::memory::KernelMemory;

use memflow::prelude::v1::*;

use dataview::{DataView, Pod};
use goblin::mach::MachO;
use log::*;

const MH_FILESET: u32 = 0xc;
const LC_FILESET_ENTRY: u32 = 0x8000_0035;
const SECTION_TYPE: u32 = 0xff;
const S_ZEROFILL: u32 = 0x1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod)]
struct FilesetEntryCommand {
    cmd: u32,
    cmdsize: u32,
    vmaddr: u64,
    fileoff: u64,
    entry_id: u32,
    reserved: u32,
}

#[derive(Clone, Debug)]
struct Segment {
    vmaddr: u64,
    vmsize: u64,
    fileoff: usize,
    filesize: usize,
}

/// A kernelcache loaded from disk.
///
/// Serves both the static scans and reads of its unslid, file backed
/// memory. Fileset kernelcaches contribute the sections of every entry,
/// tagged with the entry id.
pub struct MachoImage {
    bytes: Vec<u8>,
    segments: Vec<Segment>,
    scanner: SectionScanner,
    fileset: bool,
    base: Address,
}

fn image_error(err: goblin::error::Error) -> Error {
    warn!("malformed kernelcache: {}", err);
    Error(ErrorOrigin::OsLayer, ErrorKind::InvalidExeFile)
}

fn c_str_at(bytes: &[u8], off: usize) -> Option<String> {
    let tail = bytes.get(off..)?;
    let len = tail.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&tail[..len]).into_owned())
}

impl MachoImage {
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let mut segments = vec![];
        let mut scanner = SectionScanner::new();

        let (fileset, entries) = {
            let macho = MachO::parse(&bytes, 0).map_err(image_error)?;
            let fileset = macho.header.filetype == MH_FILESET;

            collect(&macho, None, &bytes, &mut segments, &mut scanner)?;

            let view = DataView::from(&bytes[..]);
            let mut entries = vec![];

            for lc in macho
                .load_commands
                .iter()
                .filter(|lc| view.try_read::<u32>(lc.offset) == Some(LC_FILESET_ENTRY))
            {
                let entry = view
                    .try_read::<FilesetEntryCommand>(lc.offset)
                    .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidExeFile))?;
                let id = c_str_at(&bytes, lc.offset + entry.entry_id as usize)
                    .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidExeFile))?;

                trace!(
                    "fileset entry {} at {:x} (file offset {:x})",
                    id,
                    entry.vmaddr,
                    entry.fileoff
                );
                entries.push((id, entry.fileoff as usize));
            }

            (fileset, entries)
        };

        for (id, fileoff) in entries {
            match MachO::parse(&bytes, fileoff) {
                Ok(sub) => collect(&sub, Some(id.as_str()), &bytes, &mut segments, &mut scanner)?,
                Err(err) => warn!("skipping fileset entry {}: {}", id, err),
            }
        }

        let base = segments
            .iter()
            .find(|s| s.fileoff == 0 && s.filesize > 0)
            .map(|s| Address::from(s.vmaddr))
            .unwrap_or(Address::NULL);

        info!(
            "kernelcache at {:x}: {} segments, {} sections{}",
            base,
            segments.len(),
            scanner.sections().len(),
            if fileset { ", fileset" } else { "" }
        );

        Ok(Self {
            bytes,
            segments,
            scanner,
            fileset,
            base,
        })
    }

    pub fn is_fileset(&self) -> bool {
        self.fileset
    }

    /// Unslid address of the Mach-O header.
    pub fn base(&self) -> Address {
        self.base
    }

    pub fn scanner(&self) -> &SectionScanner {
        &self.scanner
    }

    /// Supplies a value for `Patchfinder::resolve_named`.
    pub fn set_constant(&mut self, name: &str, value: u64) {
        self.scanner.set_constant(name, value);
    }

    pub fn with_constant(mut self, name: &str, value: u64) -> Self {
        self.set_constant(name, value);
        self
    }
}

fn collect(
    macho: &MachO,
    entry: Option<&str>,
    bytes: &[u8],
    segments: &mut Vec<Segment>,
    scanner: &mut SectionScanner,
) -> Result<()> {
    for segment in macho.segments.iter() {
        let segname = segment.name().map_err(image_error)?;
        if segname == "__PAGEZERO" {
            continue;
        }

        segments.push(Segment {
            vmaddr: segment.vmaddr,
            vmsize: segment.vmsize,
            fileoff: segment.fileoff as usize,
            filesize: segment.filesize as usize,
        });

        for (section, _) in segment.sections().map_err(image_error)? {
            let sectname = section.name().map_err(image_error)?;

            let data = if section.flags & SECTION_TYPE == S_ZEROFILL || section.offset == 0 {
                vec![]
            } else {
                let start = section.offset as usize;
                start
                    .checked_add(section.size as usize)
                    .and_then(|end| bytes.get(start..end))
                    .ok_or_else(|| {
                        warn!("section {},{} out of bounds", segname, sectname);
                        Error(ErrorOrigin::OsLayer, ErrorKind::InvalidExeFile)
                    })?
                    .to_vec()
            };

            trace!(
                "{}{},{} at {:x} ({:x} bytes)",
                entry.map(|e| format!("{}:", e)).unwrap_or_default(),
                segname,
                sectname,
                section.addr,
                data.len()
            );

            scanner.add_section(Section {
                entry: entry.map(str::to_string),
                segment: segname.to_string(),
                section: sectname.to_string(),
                vmaddr: section.addr.into(),
                data,
            });
        }
    }

    Ok(())
}

impl Patchfinder for MachoImage {
    fn find_string(&mut self, section: &SectionRef, literal: &str) -> Result<Address> {
        self.scanner.find_string(section, literal)
    }

    fn find_xrefs(&mut self, section: &SectionRef, target: Address) -> Result<Vec<Address>> {
        self.scanner.find_xrefs(section, target)
    }

    fn find_prev_insn(
        &mut self,
        section: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address> {
        self.scanner.find_prev_insn(section, start, count, pattern)
    }

    fn find_next_insn(
        &mut self,
        section: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address> {
        self.scanner.find_next_insn(section, start, count, pattern)
    }

    fn read_insn(&mut self, section: &SectionRef, addr: Address) -> Result<u32> {
        self.scanner.read_insn(section, addr)
    }

    fn resolve_named(&mut self, name: &str) -> Result<u64> {
        self.scanner.resolve_named(name)
    }
}

impl KernelMemory for MachoImage {
    /// Reads unslid image memory. Bytes past a segment's file contents read
    /// as zero.
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        let addr = addr.to_umem();
        let end = addr
            .checked_add(out.len() as u64)
            .ok_or(Error(ErrorOrigin::VirtualMemory, ErrorKind::UnableToReadMemory))?;

        let segment = self
            .segments
            .iter()
            .find(|s| {
                addr >= s.vmaddr
                    && s.vmaddr
                        .checked_add(s.vmsize)
                        .map_or(false, |top| end <= top)
            })
            .ok_or(Error(ErrorOrigin::VirtualMemory, ErrorKind::UnableToReadMemory))?;

        let off = (addr - segment.vmaddr) as usize;
        for (i, b) in out.iter_mut().enumerate() {
            *b = if off + i < segment.filesize {
                segment
                    .fileoff
                    .checked_add(off + i)
                    .and_then(|pos| self.bytes.get(pos))
                    .copied()
                    .unwrap_or(0)
            } else {
                0
            };
        }

        Ok(())
    }
}
