//! Fixed width AArch64 decoding of the handful of idioms the locator relies on.
//!
//! Nothing here tries to be a disassembler. Every decoder accepts exactly one
//! encoding class and returns `None` for anything else.

/// Instruction class described by the bits that must match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsnPattern {
    pub name: &'static str,
    pub value: u32,
    pub mask: u32,
}

impl InsnPattern {
    pub const fn new(name: &'static str, value: u32, mask: u32) -> Self {
        Self { name, value, mask }
    }

    pub fn matches(&self, insn: u32) -> bool {
        insn & self.mask == self.value
    }
}

pub const ADRP: InsnPattern = InsnPattern::new("adrp", 0x9000_0000, 0x9f00_0000);
pub const ADR: InsnPattern = InsnPattern::new("adr", 0x1000_0000, 0x9f00_0000);
/// 64-bit `add xd, xn, #imm`, flags untouched.
pub const ADD_IMM: InsnPattern = InsnPattern::new("add", 0x9100_0000, 0xff80_0000);
/// 64-bit `ldr xt, [xn, #imm]`, unsigned offset.
pub const LDR_IMM: InsnPattern = InsnPattern::new("ldr", 0xf940_0000, 0xffc0_0000);
/// 64-bit `str xt, [xn, #imm]`, unsigned offset.
pub const STR_IMM: InsnPattern = InsnPattern::new("str", 0xf900_0000, 0xffc0_0000);
/// `movz`, either width.
pub const MOVZ: InsnPattern = InsnPattern::new("movz", 0x5280_0000, 0x7f80_0000);
/// `subs` with an immediate (`cmp` when the destination is zr), either width.
pub const SUBS_IMM: InsnPattern = InsnPattern::new("subs", 0x7100_0000, 0x7f80_0000);
pub const B_COND: InsnPattern = InsnPattern::new("b.cond", 0x5400_0000, 0xff00_0010);

pub const NOP: u32 = 0xd503_201f;

fn bits(insn: u32, lo: u32, len: u32) -> u32 {
    (insn >> lo) & ((1 << len) - 1)
}

fn sign_extend(value: u64, width: u32) -> i64 {
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

/// `adrp`: destination register and the referenced 4 KiB page.
pub fn decode_adrp(pc: u64, insn: u32) -> Option<(u8, u64)> {
    if !ADRP.matches(insn) {
        return None;
    }

    let imm = (bits(insn, 5, 19) << 2 | bits(insn, 29, 2)) as u64;
    let offset = sign_extend(imm, 21) << 12;

    Some((
        bits(insn, 0, 5) as u8,
        (pc & !0xfff).wrapping_add(offset as u64),
    ))
}

/// `adr`: destination register and the referenced address.
pub fn decode_adr(pc: u64, insn: u32) -> Option<(u8, u64)> {
    if !ADR.matches(insn) {
        return None;
    }

    let imm = (bits(insn, 5, 19) << 2 | bits(insn, 29, 2)) as u64;

    Some((
        bits(insn, 0, 5) as u8,
        pc.wrapping_add(sign_extend(imm, 21) as u64),
    ))
}

/// Operands of an add/sub immediate instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddSubImm {
    pub rd: u8,
    pub rn: u8,
    pub imm12: u16,
    /// `lsl #12` applied to the immediate.
    pub shifted: bool,
    pub set_flags: bool,
    pub is_64: bool,
}

impl AddSubImm {
    fn decode(insn: u32) -> Self {
        Self {
            rd: bits(insn, 0, 5) as u8,
            rn: bits(insn, 5, 5) as u8,
            imm12: bits(insn, 10, 12) as u16,
            shifted: bits(insn, 22, 1) == 1,
            set_flags: bits(insn, 29, 1) == 1,
            is_64: bits(insn, 31, 1) == 1,
        }
    }

    pub fn value(&self) -> u64 {
        (self.imm12 as u64) << if self.shifted { 12 } else { 0 }
    }
}

pub fn decode_add_imm(insn: u32) -> Option<AddSubImm> {
    if ADD_IMM.matches(insn) {
        Some(AddSubImm::decode(insn))
    } else {
        None
    }
}

pub fn decode_subs_imm(insn: u32) -> Option<AddSubImm> {
    if SUBS_IMM.matches(insn) {
        Some(AddSubImm::decode(insn))
    } else {
        None
    }
}

/// Operands of a 64-bit load/store with unsigned immediate offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadStoreImm {
    pub rt: u8,
    pub rn: u8,
    pub offset: u64,
}

pub fn decode_ldr_str_imm(insn: u32) -> Option<LoadStoreImm> {
    if LDR_IMM.matches(insn) || STR_IMM.matches(insn) {
        Some(LoadStoreImm {
            rt: bits(insn, 0, 5) as u8,
            rn: bits(insn, 5, 5) as u8,
            offset: (bits(insn, 10, 12) as u64) << 3,
        })
    } else {
        None
    }
}

/// Operands of `movz`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MovImm {
    pub rd: u8,
    pub imm16: u16,
    /// Half-word the immediate lands in.
    pub hw: u8,
    pub is_64: bool,
}

impl MovImm {
    pub fn value(&self) -> u64 {
        (self.imm16 as u64) << (self.hw as u64 * 16)
    }
}

pub fn decode_movz(insn: u32) -> Option<MovImm> {
    if !MOVZ.matches(insn) {
        return None;
    }

    Some(MovImm {
        rd: bits(insn, 0, 5) as u8,
        imm16: bits(insn, 5, 16) as u16,
        hw: bits(insn, 21, 2) as u8,
        is_64: bits(insn, 31, 1) == 1,
    })
}

/// Resolves the address materialized by `adrp` at `pc` together with the
/// `add`/`ldr`/`str` right after it.
///
/// Both halves have to agree on the base register, otherwise the pair is not
/// the idiom and nothing is returned.
pub fn resolve_adrp_pair(pc: u64, adrp: u32, next: u32) -> Option<u64> {
    let (rd, page) = decode_adrp(pc, adrp)?;

    if let Some(add) = decode_add_imm(next) {
        if add.rn == rd {
            return Some(page.wrapping_add(add.value()));
        }
    } else if let Some(ls) = decode_ldr_str_imm(next) {
        if ls.rn == rd {
            return Some(page.wrapping_add(ls.offset));
        }
    }

    None
}

/// Encoders for building synthetic code in tests.
#[cfg(test)]
pub(crate) mod encode {
    pub fn adrp(pc: u64, target: u64, rd: u8) -> u32 {
        let delta = ((target & !0xfff) as i64).wrapping_sub((pc & !0xfff) as i64) >> 12;
        let imm = (delta as u64 & 0x1f_ffff) as u32;
        0x9000_0000 | (imm & 0x3) << 29 | (imm >> 2) << 5 | rd as u32
    }

    pub fn adr(pc: u64, target: u64, rd: u8) -> u32 {
        let delta = (target as i64).wrapping_sub(pc as i64);
        let imm = (delta as u64 & 0x1f_ffff) as u32;
        0x1000_0000 | (imm & 0x3) << 29 | (imm >> 2) << 5 | rd as u32
    }

    pub fn add_imm(rd: u8, rn: u8, imm12: u16) -> u32 {
        0x9100_0000 | (imm12 as u32 & 0xfff) << 10 | (rn as u32) << 5 | rd as u32
    }

    pub fn ldr_imm(rt: u8, rn: u8, offset: u64) -> u32 {
        0xf940_0000 | ((offset >> 3) as u32 & 0xfff) << 10 | (rn as u32) << 5 | rt as u32
    }

    pub fn movz(rd: u8, imm16: u16, hw: u8) -> u32 {
        0x5280_0000 | (hw as u32 & 0x3) << 21 | (imm16 as u32) << 5 | rd as u32
    }

    /// `cmp xn, #imm`
    pub fn cmp_imm(rn: u8, imm12: u16) -> u32 {
        0xf100_0000 | (imm12 as u32 & 0xfff) << 10 | (rn as u32) << 5 | 31
    }

    /// `sub xd, xn, #imm`, flags untouched.
    pub fn sub_imm(rd: u8, rn: u8, imm12: u16) -> u32 {
        0xd100_0000 | (imm12 as u32 & 0xfff) << 10 | (rn as u32) << 5 | rd as u32
    }

    pub fn b_cond(pc: u64, target: u64, cond: u8) -> u32 {
        let delta = (target as i64).wrapping_sub(pc as i64) >> 2;
        0x5400_0000 | ((delta as u64 & 0x7_ffff) as u32) << 5 | (cond as u32 & 0xf)
    }

    pub const RET: u32 = 0xd65f_03c0;
}
