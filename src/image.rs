use crate::arm64::{self, InsnPattern};
use crate::sig::Signature;

use memflow::prelude::v1::*;

use log::*;

use std::collections::HashMap;

pub mod macho;

/// Names a section of the kernelcache, optionally inside one fileset entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SectionRef {
    pub entry: Option<&'static str>,
    pub segment: &'static str,
    pub section: &'static str,
}

impl SectionRef {
    pub const fn new(segment: &'static str, section: &'static str) -> Self {
        Self {
            entry: None,
            segment,
            section,
        }
    }

    pub const fn in_entry(entry: &'static str, segment: &'static str, section: &'static str) -> Self {
        Self {
            entry: Some(entry),
            segment,
            section,
        }
    }
}

impl std::fmt::Display for SectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        if let Some(entry) = self.entry {
            write!(f, "{}:", entry)?;
        }
        write!(f, "{},{}", self.segment, self.section)
    }
}

/// Contents of one section, loaded at its unslid address.
#[derive(Clone, Debug)]
pub struct Section {
    pub entry: Option<String>,
    pub segment: String,
    pub section: String,
    pub vmaddr: Address,
    pub data: Vec<u8>,
}

impl Section {
    pub fn new(id: &SectionRef, vmaddr: Address, data: Vec<u8>) -> Self {
        Self {
            entry: id.entry.map(str::to_string),
            segment: id.segment.to_string(),
            section: id.section.to_string(),
            vmaddr,
            data,
        }
    }

    pub fn matches(&self, id: &SectionRef) -> bool {
        self.entry.as_deref() == id.entry && self.segment == id.segment && self.section == id.section
    }

    fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        let off = addr.checked_sub(self.vmaddr.to_umem())? as usize;
        if off.checked_add(len)? <= self.data.len() {
            Some(off)
        } else {
            None
        }
    }

    pub fn read_u32(&self, addr: Address) -> Option<u32> {
        let off = self.offset_of(addr.to_umem(), 4)?;
        self.data[off..off + 4].try_into().ok().map(u32::from_le_bytes)
    }

    fn insn_count(&self) -> usize {
        self.data.len() / 4
    }

    fn insn_at(&self, idx: usize) -> u32 {
        let off = idx * 4;
        u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }
}

/// Static analysis primitives over the kernelcache image.
///
/// All addresses are unslid. Instruction windows count instructions, the
/// start address included, and stay inside the section.
pub trait Patchfinder {
    /// Address of a unique NUL terminated string constant.
    fn find_string(&mut self, section: &SectionRef, literal: &str) -> Result<Address>;

    /// Every code location in `section` materializing `target`.
    fn find_xrefs(&mut self, section: &SectionRef, target: Address) -> Result<Vec<Address>>;

    /// Nearest instruction matching `pattern` at or below `start`.
    fn find_prev_insn(
        &mut self,
        section: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address>;

    /// Nearest instruction matching `pattern` at or above `start`.
    fn find_next_insn(
        &mut self,
        section: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address>;

    fn read_insn(&mut self, section: &SectionRef, addr: Address) -> Result<u32>;

    /// Offsets, struct sizes and symbols known by name only.
    fn resolve_named(&mut self, name: &str) -> Result<u64>;
}

impl<T: Patchfinder + ?Sized> Patchfinder for &mut T {
    fn find_string(&mut self, section: &SectionRef, literal: &str) -> Result<Address> {
        (**self).find_string(section, literal)
    }

    fn find_xrefs(&mut self, section: &SectionRef, target: Address) -> Result<Vec<Address>> {
        (**self).find_xrefs(section, target)
    }

    fn find_prev_insn(
        &mut self,
        section: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address> {
        (**self).find_prev_insn(section, start, count, pattern)
    }

    fn find_next_insn(
        &mut self,
        section: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address> {
        (**self).find_next_insn(section, start, count, pattern)
    }

    fn read_insn(&mut self, section: &SectionRef, addr: Address) -> Result<u32> {
        (**self).read_insn(section, addr)
    }

    fn resolve_named(&mut self, name: &str) -> Result<u64> {
        (**self).resolve_named(name)
    }
}

/// `Patchfinder` over sections held in memory.
#[derive(Clone, Debug, Default)]
pub struct SectionScanner {
    sections: Vec<Section>,
    constants: HashMap<String, u64>,
}

impl SectionScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_section(&mut self, section: Section) {
        self.sections.push(section);
    }

    pub fn set_constant(&mut self, name: &str, value: u64) {
        self.constants.insert(name.to_string(), value);
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, id: &SectionRef) -> Result<&Section> {
        self.sections.iter().find(|s| s.matches(id)).ok_or_else(|| {
            debug!("section {} not present", id);
            Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
        })
    }

    /// Address of the first match of a byte signature.
    pub fn find_bytes(&self, id: &SectionRef, sig: &Signature) -> Result<Address> {
        let section = self.section(id)?;
        sig.find_in(&section.data)
            .map(|off| Address::from(section.vmaddr.to_umem() + off as u64))
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }

    fn walk_insns(
        &self,
        id: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
        backwards: bool,
    ) -> Result<Address> {
        let section = self.section(id)?;
        let start = start.to_umem();

        for i in 0..count as u64 {
            let addr = if backwards {
                start.checked_sub(i * 4)
            } else {
                start.checked_add(i * 4)
            };

            let (addr, insn) = match addr.and_then(|a| Some((a, section.read_u32(a.into())?))) {
                Some(found) => found,
                None => break,
            };

            if pattern.matches(insn) {
                trace!("{} at {:x}", pattern.name, addr);
                return Ok(addr.into());
            }
        }

        Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }
}

impl Patchfinder for SectionScanner {
    fn find_string(&mut self, id: &SectionRef, literal: &str) -> Result<Address> {
        let section = self.section(id)?;

        let data = &section.data;
        if data.starts_with(literal.as_bytes()) && data.get(literal.len()) == Some(&0) {
            return Ok(section.vmaddr);
        }

        self.find_bytes(id, &Signature::c_string(literal))
            .map(|addr| Address::from(addr.to_umem() + 1))
    }

    fn find_xrefs(&mut self, id: &SectionRef, target: Address) -> Result<Vec<Address>> {
        let section = self.section(id)?;
        let base = section.vmaddr.to_umem();
        let target = target.to_umem();

        let mut refs = vec![];

        for i in 0..section.insn_count() {
            let pc = base + i as u64 * 4;
            let insn = section.insn_at(i);

            if let Some((_, addr)) = arm64::decode_adr(pc, insn) {
                if addr == target {
                    refs.push(Address::from(pc));
                }
            } else if arm64::ADRP.matches(insn) && i + 1 < section.insn_count() {
                if arm64::resolve_adrp_pair(pc, insn, section.insn_at(i + 1)) == Some(target) {
                    refs.push(Address::from(pc + 4));
                }
            }
        }

        trace!("{} references to {:x}: {:x?}", refs.len(), target, refs);

        Ok(refs)
    }

    fn find_prev_insn(
        &mut self,
        id: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address> {
        self.walk_insns(id, start, count, pattern, true)
    }

    fn find_next_insn(
        &mut self,
        id: &SectionRef,
        start: Address,
        count: usize,
        pattern: &InsnPattern,
    ) -> Result<Address> {
        self.walk_insns(id, start, count, pattern, false)
    }

    fn read_insn(&mut self, id: &SectionRef, addr: Address) -> Result<u32> {
        self.section(id)?
            .read_u32(addr)
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::OutOfBounds))
    }

    fn resolve_named(&mut self, name: &str) -> Result<u64> {
        self.constants
            .get(name)
            .copied()
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::encode;

    const TEXT: SectionRef = SectionRef::new("__TEXT_EXEC", "__text");
    const CSTRING: SectionRef = SectionRef::new("__TEXT", "__cstring");

    const TEXT_BASE: u64 = 0xffff_fff0_0800_0000;
    const CSTRING_BASE: u64 = 0xffff_fff0_0700_0000;

    fn code(insns: &[u32]) -> Vec<u8> {
        insns.iter().flat_map(|i| i.to_le_bytes().to_vec()).collect()
    }

    fn scanner() -> SectionScanner {
        let target = CSTRING_BASE + 6;

        let text = code(&[
            arm64::NOP,
            encode::adrp(TEXT_BASE + 4, target, 0),
            encode::add_imm(0, 0, (target & 0xfff) as u16),
            encode::adrp(TEXT_BASE + 12, target, 1),
            encode::add_imm(2, 2, (target & 0xfff) as u16),
            encode::adr(TEXT_BASE + 20, target, 3),
            encode::movz(4, 7, 0),
            encode::RET,
        ]);

        let mut pf = SectionScanner::new();
        pf.add_section(Section::new(&TEXT, TEXT_BASE.into(), text));
        pf.add_section(Section::new(
            &CSTRING,
            CSTRING_BASE.into(),
            b"first\0krn.\0krn.boot\0".to_vec(),
        ));
        pf
    }

    #[test]
    fn strings() {
        let mut pf = scanner();
        assert_eq!(
            pf.find_string(&CSTRING, "first").unwrap(),
            Address::from(CSTRING_BASE)
        );
        assert_eq!(
            pf.find_string(&CSTRING, "krn.").unwrap(),
            Address::from(CSTRING_BASE + 6)
        );
        assert_eq!(
            pf.find_string(&CSTRING, "krn.boot").unwrap(),
            Address::from(CSTRING_BASE + 11)
        );
        assert!(pf.find_string(&CSTRING, "krn").is_err());
        assert!(pf.find_string(&TEXT, "first").is_err());
    }

    #[test]
    fn missing_section() {
        let mut pf = scanner();
        let other = SectionRef::in_entry("com.apple.security.AppleImage4", "__TEXT", "__cstring");
        let err = pf.find_string(&other, "first").unwrap_err();
        assert!(matches!(err, Error(_, ErrorKind::NotFound)));
    }

    #[test]
    fn xrefs_need_matching_registers() {
        let mut pf = scanner();
        let refs = pf
            .find_xrefs(&TEXT, Address::from(CSTRING_BASE + 6))
            .unwrap();

        // adrp x1 / add x2, x2 is not a reference
        assert_eq!(
            refs,
            vec![
                Address::from(TEXT_BASE + 8),
                Address::from(TEXT_BASE + 20)
            ]
        );
    }

    #[test]
    fn instruction_windows() {
        let mut pf = scanner();
        let start = Address::from(TEXT_BASE + 24);

        assert_eq!(
            pf.find_prev_insn(&TEXT, start, 7, &arm64::ADRP).unwrap(),
            Address::from(TEXT_BASE + 12)
        );
        // window includes the start instruction
        assert_eq!(
            pf.find_prev_insn(&TEXT, start, 1, &arm64::MOVZ).unwrap(),
            start
        );
        // too short
        assert!(pf.find_prev_insn(&TEXT, start, 3, &arm64::ADRP).is_err());
        // never walks off the section
        assert!(pf
            .find_prev_insn(&TEXT, TEXT_BASE.into(), 100, &arm64::MOVZ)
            .is_err());

        assert_eq!(
            pf.find_next_insn(&TEXT, TEXT_BASE.into(), 8, &arm64::MOVZ)
                .unwrap(),
            start
        );
        assert!(pf
            .find_next_insn(&TEXT, TEXT_BASE.into(), 6, &arm64::MOVZ)
            .is_err());
    }

    #[test]
    fn read_insn_bounds() {
        let mut pf = scanner();
        assert_eq!(
            pf.read_insn(&TEXT, TEXT_BASE.into()).unwrap(),
            arm64::NOP
        );
        assert!(pf.read_insn(&TEXT, (TEXT_BASE + 32).into()).is_err());
    }

    #[test]
    fn byte_signatures() {
        let pf = scanner();
        assert_eq!(
            pf.find_bytes(&CSTRING, &Signature::c_string("krn.boot")).unwrap(),
            Address::from(CSTRING_BASE + 10)
        );
        assert!(pf.find_bytes(&TEXT, &Signature::c_string("first")).is_err());
    }

    #[test]
    fn named_constants() {
        let mut pf = SectionScanner::new();
        pf.set_constant("kernelConstant.T1SZ_BOOT", 25);
        assert_eq!(pf.resolve_named("kernelConstant.T1SZ_BOOT").unwrap(), 25);
        assert!(pf.resolve_named("kernelSymbol.allproc").is_err());
    }
}
