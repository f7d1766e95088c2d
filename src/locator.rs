/*!
Finds the un-exported nonce table of the AppleImage4 kext.

Builds before Darwin 23 keep an array of nonce domain pointers, validated
in `img4_nonce_domain_at` against a `cmp`ed bound. Darwin 23 builds either
keep that layout or replace it with an array of nonce slots, initialized in
a function that also builds the `krn.` seed key of the system variable
GUID. Exactly one of the two exists in a kernelcache.
*/

use crate::arm64;
use crate::image::{Patchfinder, SectionRef};
use crate::version::{KernelBuild, KernelVersion};

use memflow::prelude::v1::*;

use log::*;
use once_cell::unsync::OnceCell;

/// Error message of `img4_nonce_domain_at`.
pub const NONCE_DOMAIN_ANCHOR: &str = "invalid nonce domain: %llu";
/// System variable GUID prefix of the per slot seed keys.
pub const NONCE_SLOT_ANCHOR: &str = "40A0DDD2-77F8-4392-B4A3-1E7304206516:krn.";

pub const APPLE_IMAGE4: &str = "com.apple.security.AppleImage4";

const SLOT_LAYOUT_SINCE: KernelVersion = KernelVersion::new(23, 0, 0);
const PRELINK_SECTIONS_SINCE: KernelVersion = KernelVersion::new(22, 0, 0);

const ADRP_WINDOW: usize = 20;
const MOVZ_WINDOW: usize = 16;
const B_COND_WINDOW: usize = 4;
const SUBS_WINDOW: usize = 7;

fn not_found() -> Error {
    Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
}

/// Where the AppleImage4 code and strings live in a given kernelcache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSections {
    pub text: SectionRef,
    pub cstring: SectionRef,
}

impl ImageSections {
    pub fn for_build(build: &KernelBuild) -> Self {
        if build.fileset {
            Self {
                text: SectionRef::in_entry(APPLE_IMAGE4, "__TEXT_EXEC", "__text"),
                cstring: SectionRef::in_entry(APPLE_IMAGE4, "__TEXT", "__cstring"),
            }
        } else if build.is_at_least(PRELINK_SECTIONS_SINCE) {
            Self {
                text: SectionRef::new("__PLK_TEXT_EXEC", "__text"),
                cstring: SectionRef::new("__PRELINK_TEXT", "__text"),
            }
        } else {
            Self {
                text: SectionRef::new("__TEXT_EXEC", "__text"),
                cstring: SectionRef::new("__TEXT", "__cstring"),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NonceTableLayout {
    /// Array of `img4_nonce_domain` pointers.
    Domain,
    /// Array of nonce slot pointers, Darwin 23 and later.
    Slot,
}

/// Unslid address and element count of the nonce table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedArray {
    pub address: Address,
    pub count: usize,
    pub layout: NonceTableLayout,
}

/// `adrp` materializing the array and the address it resolves to.
#[derive(Clone, Copy, Debug)]
struct ArrayAnchor {
    adrp: Address,
    array: Address,
}

/// Locates the nonce table in the kernelcache.
///
/// Every result is computed on first use and kept for the lifetime of the
/// locator. Failures are not cached.
pub struct SignatureLocator {
    build: KernelBuild,
    sections: ImageSections,
    layout: OnceCell<NonceTableLayout>,
    domains: OnceCell<ArrayAnchor>,
    domains_len: OnceCell<usize>,
    slots: OnceCell<ArrayAnchor>,
    slots_len: OnceCell<usize>,
}

impl SignatureLocator {
    pub fn new(build: &KernelBuild) -> Self {
        Self {
            build: build.clone(),
            sections: ImageSections::for_build(build),
            layout: OnceCell::new(),
            domains: OnceCell::new(),
            domains_len: OnceCell::new(),
            slots: OnceCell::new(),
            slots_len: OnceCell::new(),
        }
    }

    pub fn build(&self) -> &KernelBuild {
        &self.build
    }

    pub fn sections(&self) -> &ImageSections {
        &self.sections
    }

    /// Picks the table layout of this kernelcache, once.
    ///
    /// Only Darwin 23 and later are probed. The domain array is looked for
    /// first, its absence selects the slot layout.
    pub fn layout(&self, pf: &mut impl Patchfinder) -> Result<NonceTableLayout> {
        self.layout
            .get_or_try_init(|| {
                if !self.build.is_at_least(SLOT_LAYOUT_SINCE) {
                    return Ok(NonceTableLayout::Domain);
                }

                match self.anchor_array(pf, NONCE_DOMAIN_ANCHOR) {
                    Ok(anchor) => {
                        let _ = self.domains.set(anchor);
                        Ok(NonceTableLayout::Domain)
                    }
                    Err(Error(_, ErrorKind::NotFound)) => Ok(NonceTableLayout::Slot),
                    Err(err) => Err(err),
                }
            })
            .map(|layout| {
                debug!("nonce table layout: {:?}", layout);
                *layout
            })
    }

    /// Resolves the string anchor to the array materialized right before
    /// its reference.
    fn anchor_array(&self, pf: &mut impl Patchfinder, literal: &str) -> Result<ArrayAnchor> {
        let text = &self.sections.text;

        let string = pf
            .find_string(&self.sections.cstring, literal)
            .map_err(|err| {
                debug!("\"{}\" not in {}", literal, self.sections.cstring);
                err
            })?;

        let xref = pf
            .find_xrefs(text, string)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                warn!("no reference to \"{}\" at {:x}", literal, string);
                not_found()
            })?;

        // skip the pair materializing the string itself
        let start = Address::from(xref.to_umem().saturating_sub(8));
        let adrp = pf
            .find_prev_insn(text, start, ADRP_WINDOW, &arm64::ADRP)
            .map_err(|err| {
                warn!("no adrp in front of {:x}", xref);
                err
            })?;

        let first = pf.read_insn(text, adrp)?;
        let second = pf.read_insn(text, Address::from(adrp.to_umem() + 4))?;

        let array = arm64::resolve_adrp_pair(adrp.to_umem(), first, second).ok_or_else(|| {
            warn!(
                "unexpected instruction pair at {:x}: {:08x} {:08x}",
                adrp, first, second
            );
            not_found()
        })?;

        debug!("array anchored by \"{}\" at {:x}", literal, array);

        Ok(ArrayAnchor {
            adrp,
            array: array.into(),
        })
    }

    fn domains_anchor(&self, pf: &mut impl Patchfinder) -> Result<ArrayAnchor> {
        if self.layout(pf)? != NonceTableLayout::Domain {
            debug!("{} uses nonce slots, no domain array", self.build);
            return Err(not_found());
        }

        self.domains
            .get_or_try_init(|| self.anchor_array(pf, NONCE_DOMAIN_ANCHOR))
            .copied()
    }

    fn slots_anchor(&self, pf: &mut impl Patchfinder) -> Result<ArrayAnchor> {
        if !self.build.is_at_least(SLOT_LAYOUT_SINCE)
            || self.layout(pf)? != NonceTableLayout::Slot
        {
            debug!("{} uses nonce domains, no slot array", self.build);
            return Err(not_found());
        }

        self.slots
            .get_or_try_init(|| self.anchor_array(pf, NONCE_SLOT_ANCHOR))
            .copied()
    }

    pub fn find_domains_array(&self, pf: &mut impl Patchfinder) -> Result<Address> {
        self.domains_anchor(pf).map(|anchor| anchor.array)
    }

    /// Length of the domain array, the bound `img4_nonce_domain_at` checks.
    ///
    /// The array is referenced from several places. The bounds check is the
    /// one reference without a conditional branch right in front of it.
    pub fn find_domains_array_len(&self, pf: &mut impl Patchfinder) -> Result<usize> {
        let array = self.find_domains_array(pf)?;
        let text = self.sections.text;

        self.domains_len
            .get_or_try_init(|| {
                let mut canonical = None;

                for xref in pf.find_xrefs(&text, array)? {
                    let from = Address::from(xref.to_umem().saturating_sub(12));
                    match pf.find_next_insn(&text, from, B_COND_WINDOW, &arm64::B_COND) {
                        Ok(branch) => trace!("skipping reference {:x}, branch at {:x}", xref, branch),
                        Err(Error(_, ErrorKind::NotFound)) => {
                            canonical = Some(xref);
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }

                let xref = canonical.ok_or_else(|| {
                    warn!("no bounds checked reference to {:x}", array);
                    not_found()
                })?;

                let cmp = pf.find_prev_insn(&text, xref, SUBS_WINDOW, &arm64::SUBS_IMM)?;
                let insn = pf.read_insn(&text, cmp)?;

                match arm64::decode_subs_imm(insn) {
                    Some(subs) if !subs.shifted && subs.imm12 > 0 => {
                        debug!("domain array length {} (cmp at {:x})", subs.imm12, cmp);
                        Ok(subs.imm12 as usize)
                    }
                    _ => {
                        warn!("unexpected bounds check at {:x}: {:08x}", cmp, insn);
                        Err(not_found())
                    }
                }
            })
            .copied()
    }

    pub fn find_slots_array(&self, pf: &mut impl Patchfinder) -> Result<Address> {
        self.slots_anchor(pf).map(|anchor| anchor.array)
    }

    /// Length of the slot array, the loop bound loaded right after the
    /// array address.
    pub fn find_slots_array_len(&self, pf: &mut impl Patchfinder) -> Result<usize> {
        let anchor = self.slots_anchor(pf)?;
        let text = self.sections.text;

        self.slots_len
            .get_or_try_init(|| {
                let mov = pf.find_next_insn(&text, anchor.adrp, MOVZ_WINDOW, &arm64::MOVZ)?;
                let insn = pf.read_insn(&text, mov)?;

                match arm64::decode_movz(insn) {
                    Some(movz) if movz.hw == 0 && movz.imm16 > 0 => {
                        debug!("slot array length {} (movz at {:x})", movz.imm16, mov);
                        Ok(movz.imm16 as usize)
                    }
                    _ => {
                        warn!("unexpected loop bound at {:x}: {:08x}", mov, insn);
                        Err(not_found())
                    }
                }
            })
            .copied()
    }

    /// Address and length of whichever table this kernelcache carries.
    pub fn find_array(&self, pf: &mut impl Patchfinder) -> Result<ResolvedArray> {
        let layout = self.layout(pf)?;

        let (address, count) = match layout {
            NonceTableLayout::Domain => (
                self.find_domains_array(pf)?,
                self.find_domains_array_len(pf)?,
            ),
            NonceTableLayout::Slot => (
                self.find_slots_array(pf)?,
                self.find_slots_array_len(pf)?,
            ),
        };

        Ok(ResolvedArray {
            address,
            count,
            layout,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arm64::{encode, InsnPattern, NOP};
    use crate::image::{Section, SectionScanner};

    pub const TEXT_BASE: u64 = 0xffff_fff0_0800_0000;
    pub const CSTRING_BASE: u64 = 0xffff_fff0_0700_0000;
    pub const DOMAINS: u64 = 0xffff_fff0_0900_0120;
    pub const SLOTS: u64 = 0xffff_fff0_0900_0440;

    /// Places code at `TEXT_BASE` and one string at `CSTRING_BASE + 1`.
    pub fn scanner(build: &KernelBuild, code: &[u32], string: &str) -> SectionScanner {
        let sections = ImageSections::for_build(build);

        let mut cstring = vec![0u8];
        cstring.extend_from_slice(string.as_bytes());
        cstring.push(0);

        let mut pf = SectionScanner::new();
        pf.add_section(Section::new(
            &sections.text,
            TEXT_BASE.into(),
            code.iter().flat_map(|i| i.to_le_bytes().to_vec()).collect(),
        ));
        pf.add_section(Section::new(&sections.cstring, CSTRING_BASE.into(), cstring));
        pf
    }

    fn pc(idx: usize) -> u64 {
        TEXT_BASE + idx as u64 * 4
    }

    fn lo(addr: u64) -> u16 {
        (addr & 0xfff) as u16
    }

    /// A decoy user, the bounds check and `img4_nonce_domain_at` itself.
    pub fn domain_code(count: u16) -> Vec<u32> {
        let string = CSTRING_BASE + 1;
        vec![
            encode::cmp_imm(0, 3),
            encode::b_cond(pc(1), pc(1) + 0x40, 0),
            encode::adrp(pc(2), DOMAINS, 9),
            encode::add_imm(9, 9, lo(DOMAINS)),
            encode::RET,
            encode::cmp_imm(0, count),
            NOP,
            NOP,
            encode::adrp(pc(8), DOMAINS, 8),
            encode::add_imm(8, 8, lo(DOMAINS)),
            encode::RET,
            encode::cmp_imm(0, count),
            encode::b_cond(pc(12), pc(12) + 0x20, 2),
            encode::adrp(pc(13), DOMAINS, 8),
            encode::add_imm(8, 8, lo(DOMAINS)),
            encode::adrp(pc(15), string, 1),
            encode::add_imm(1, 1, lo(string)),
            encode::RET,
        ]
    }

    pub fn slot_code(count: u16) -> Vec<u32> {
        let string = CSTRING_BASE + 1;
        vec![
            encode::adrp(pc(0), SLOTS, 19),
            encode::add_imm(19, 19, lo(SLOTS)),
            NOP,
            encode::adrp(pc(3), string, 0),
            encode::add_imm(0, 0, lo(string)),
            encode::movz(2, count, 0),
            encode::RET,
        ]
    }

    fn build(version: &str, fileset: bool) -> KernelBuild {
        KernelBuild::new(version, true, fileset).unwrap()
    }

    /// Records the literals asked for.
    struct Recording {
        inner: SectionScanner,
        strings: Vec<String>,
    }

    impl Patchfinder for Recording {
        fn find_string(&mut self, section: &SectionRef, literal: &str) -> Result<Address> {
            self.strings.push(literal.to_string());
            self.inner.find_string(section, literal)
        }

        fn find_xrefs(&mut self, section: &SectionRef, target: Address) -> Result<Vec<Address>> {
            self.inner.find_xrefs(section, target)
        }

        fn find_prev_insn(
            &mut self,
            section: &SectionRef,
            start: Address,
            count: usize,
            pattern: &InsnPattern,
        ) -> Result<Address> {
            self.inner.find_prev_insn(section, start, count, pattern)
        }

        fn find_next_insn(
            &mut self,
            section: &SectionRef,
            start: Address,
            count: usize,
            pattern: &InsnPattern,
        ) -> Result<Address> {
            self.inner.find_next_insn(section, start, count, pattern)
        }

        fn read_insn(&mut self, section: &SectionRef, addr: Address) -> Result<u32> {
            self.inner.read_insn(section, addr)
        }

        fn resolve_named(&mut self, name: &str) -> Result<u64> {
            self.inner.resolve_named(name)
        }
    }

    #[test]
    fn section_selection() {
        let fileset = ImageSections::for_build(&build("21.1.0", true));
        assert_eq!(fileset.text.entry, Some(APPLE_IMAGE4));
        assert_eq!(fileset.text.segment, "__TEXT_EXEC");
        assert_eq!(fileset.cstring.section, "__cstring");

        let prelinked = ImageSections::for_build(&build("22.0.0", false));
        assert_eq!(prelinked.text, SectionRef::new("__PLK_TEXT_EXEC", "__text"));
        assert_eq!(prelinked.cstring, SectionRef::new("__PRELINK_TEXT", "__text"));

        let old = ImageSections::for_build(&build("21.6.0", false));
        assert_eq!(old.text, SectionRef::new("__TEXT_EXEC", "__text"));
        assert_eq!(old.cstring, SectionRef::new("__TEXT", "__cstring"));
    }

    #[test]
    fn domain_array() {
        for (version, fileset) in [("21.6.0", false), ("22.3.0", false), ("22.5.0", true)] {
            let build = build(version, fileset);
            let mut pf = scanner(&build, &domain_code(16), NONCE_DOMAIN_ANCHOR);
            let locator = SignatureLocator::new(&build);

            assert_eq!(
                locator.find_array(&mut pf).unwrap(),
                ResolvedArray {
                    address: DOMAINS.into(),
                    count: 16,
                    layout: NonceTableLayout::Domain,
                }
            );
            assert!(locator.find_slots_array(&mut pf).is_err());
        }
    }

    #[test]
    fn domain_layout_on_darwin_23() {
        let build = build("23.1.0", true);
        let mut pf = scanner(&build, &domain_code(13), NONCE_DOMAIN_ANCHOR);
        let locator = SignatureLocator::new(&build);

        assert_eq!(locator.layout(&mut pf).unwrap(), NonceTableLayout::Domain);
        assert_eq!(locator.find_domains_array_len(&mut pf).unwrap(), 13);

        let err = locator.find_slots_array(&mut pf).unwrap_err();
        assert!(matches!(err, Error(_, ErrorKind::NotFound)));
        assert!(locator.find_slots_array_len(&mut pf).is_err());
    }

    #[test]
    fn slot_array() {
        let build = build("23.2.0", true);
        let mut pf = scanner(&build, &slot_code(5), NONCE_SLOT_ANCHOR);
        let locator = SignatureLocator::new(&build);

        assert_eq!(
            locator.find_array(&mut pf).unwrap(),
            ResolvedArray {
                address: SLOTS.into(),
                count: 5,
                layout: NonceTableLayout::Slot,
            }
        );

        let err = locator.find_domains_array(&mut pf).unwrap_err();
        assert!(matches!(err, Error(_, ErrorKind::NotFound)));
        assert!(locator.find_domains_array_len(&mut pf).is_err());
    }

    #[test]
    fn old_builds_never_probe_slots() {
        let build = build("22.3.0", true);
        let mut pf = Recording {
            inner: scanner(&build, &slot_code(5), NONCE_SLOT_ANCHOR),
            strings: vec![],
        };
        let locator = SignatureLocator::new(&build);

        assert!(locator.find_array(&mut pf).is_err());
        assert!(locator.find_slots_array(&mut pf).is_err());
        assert!(locator.find_slots_array_len(&mut pf).is_err());

        assert!(!pf.strings.is_empty());
        assert!(pf.strings.iter().all(|s| s == NONCE_DOMAIN_ANCHOR));
    }

    #[test]
    fn results_are_cached() {
        let build = build("23.2.0", true);
        let mut pf = Recording {
            inner: scanner(&build, &slot_code(5), NONCE_SLOT_ANCHOR),
            strings: vec![],
        };
        let locator = SignatureLocator::new(&build);

        let first = locator.find_array(&mut pf).unwrap();
        let probes = pf.strings.len();
        // layout probe and the slot anchor
        assert_eq!(probes, 2);

        assert_eq!(locator.find_array(&mut pf).unwrap(), first);
        assert_eq!(pf.strings.len(), probes);
    }

    #[test]
    fn every_reference_branches() {
        let build = build("22.3.0", false);
        let mut code = domain_code(16);
        // turn the bounds check into a branch target
        code[6] = encode::b_cond(pc(6), pc(10), 1);

        let mut pf = scanner(&build, &code, NONCE_DOMAIN_ANCHOR);
        let locator = SignatureLocator::new(&build);

        assert_eq!(
            locator.find_domains_array(&mut pf).unwrap(),
            Address::from(DOMAINS)
        );
        let err = locator.find_domains_array_len(&mut pf).unwrap_err();
        assert!(matches!(err, Error(_, ErrorKind::NotFound)));
    }

    #[test]
    fn bounds_check_must_set_flags() {
        let build = build("22.3.0", false);
        let mut code = domain_code(16);
        code[5] = encode::sub_imm(0, 0, 16);

        let mut pf = scanner(&build, &code, NONCE_DOMAIN_ANCHOR);
        let locator = SignatureLocator::new(&build);

        assert!(locator.find_domains_array_len(&mut pf).is_err());
    }

    #[test]
    fn zero_counts_are_rejected() {
        let domains = build("22.3.0", false);
        let mut pf = scanner(&domains, &domain_code(0), NONCE_DOMAIN_ANCHOR);
        let locator = SignatureLocator::new(&domains);

        assert_eq!(
            locator.find_domains_array(&mut pf).unwrap(),
            Address::from(DOMAINS)
        );
        let err = locator.find_domains_array_len(&mut pf).unwrap_err();
        assert!(matches!(err, Error(_, ErrorKind::NotFound)));

        let slots = build("23.2.0", true);
        let mut pf = scanner(&slots, &slot_code(0), NONCE_SLOT_ANCHOR);
        let locator = SignatureLocator::new(&slots);

        assert_eq!(
            locator.find_slots_array(&mut pf).unwrap(),
            Address::from(SLOTS)
        );
        let err = locator.find_slots_array_len(&mut pf).unwrap_err();
        assert!(matches!(err, Error(_, ErrorKind::NotFound)));
        assert!(locator.find_array(&mut pf).is_err());
    }

    #[test]
    fn shifted_loop_bound_is_rejected() {
        let build = build("23.2.0", true);
        let mut code = slot_code(5);
        code[5] = encode::movz(2, 5, 1);

        let mut pf = scanner(&build, &code, NONCE_SLOT_ANCHOR);
        let locator = SignatureLocator::new(&build);

        assert_eq!(
            locator.find_slots_array(&mut pf).unwrap(),
            Address::from(SLOTS)
        );
        assert!(locator.find_slots_array_len(&mut pf).is_err());
    }

    #[test]
    fn missing_sections() {
        let build = build("22.3.0", true);
        let mut pf = SectionScanner::new();
        let locator = SignatureLocator::new(&build);

        let err = locator.find_array(&mut pf).unwrap_err();
        assert!(matches!(err, Error(_, ErrorKind::NotFound)));
    }
}
