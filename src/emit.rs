//! Assembler wrapper and host-instruction emission helpers.
//!
//! Blocks are assembled with a `dynasmrt` vector assembler created at the
//! address the code will occupy, so the code cursor (`base + offset`) is
//! always known during emission and PC-relative forms can be selected
//! eagerly. The `dynasm!` macro covers the bulk of emission; a handful of
//! instruction families whose condition, bitfield or immediate operands are
//! chosen from data at generation time are encoded as raw words here
//! instead.
//!
//! This module also implements the immediate-materialization ladder and the
//! base-/PC-relative load-store ladder described in the lowering design:
//! single move, PC-relative, base-relative, page-relative, then up to four
//! 16-bit moves.

use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, dynasm};

use crate::Error;
use crate::flags::CarryState;
use crate::uml;

pub type Asm = dynasmrt::VecAssembler<dynasmrt::aarch64::Aarch64Relocation>;

// ─── Register assignments ───────────────────────────────────────────────────
//
//   x0-x3    function parameters / return value
//   x9-x11   temporaries preserved across internal helpers
//   x12-x13  scratch clobbered by helpers
//   x14      memory-address calculation scratch
//   x15      opcode-level scratch, never touched by helpers
//   x19-x26  UML registers I0-I7
//   x27      near-state base pointer
//   x28      emulated flags (bit 0 = C, bit 4 = U)
//   d8-d15   UML registers F0-F7
//   d16-d18  float temporaries

pub const REG_PARAM1: u8 = 0;
pub const REG_PARAM2: u8 = 1;
pub const REG_PARAM3: u8 = 2;
pub const REG_PARAM4: u8 = 3;

pub const TEMP_REG1: u8 = 9;
pub const TEMP_REG2: u8 = 10;
pub const TEMP_REG3: u8 = 11;

pub const SCRATCH_REG1: u8 = 12;
pub const SCRATCH_REG2: u8 = 13;

pub const MEM_SCRATCH_REG: u8 = 14;
pub const FUNC_SCRATCH_REG: u8 = 15;

pub const BASE_REG: u8 = 27;
pub const FLAGS_REG: u8 = 28;

pub const TEMPF_REG1: u8 = 16;
pub const TEMPF_REG2: u8 = 17;
pub const TEMPF_REG3: u8 = 18;

/// Host registers holding UML I0-I7. A zero entry would spill that UML
/// register to its memory slot; the map used here is fully direct.
pub const INT_REGISTER_MAP: [u8; 8] = [19, 20, 21, 22, 23, 24, 25, 26];

/// Host vector registers holding UML F0-F7.
pub const FLOAT_REGISTER_MAP: [u8; 8] = [8, 9, 10, 11, 12, 13, 14, 15];

// ─── Conditions ─────────────────────────────────────────────────────────────

/// Native condition codes, by encoding value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArmCond {
    Eq = 0,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

const COND_BY_BITS: [ArmCond; 15] = [
    ArmCond::Eq,
    ArmCond::Ne,
    ArmCond::Cs,
    ArmCond::Cc,
    ArmCond::Mi,
    ArmCond::Pl,
    ArmCond::Vs,
    ArmCond::Vc,
    ArmCond::Hi,
    ArmCond::Ls,
    ArmCond::Ge,
    ArmCond::Lt,
    ArmCond::Gt,
    ArmCond::Le,
    ArmCond::Al,
];

impl ArmCond {
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn invert(self) -> ArmCond {
        assert!(self != ArmCond::Al);
        COND_BY_BITS[(self as usize) ^ 1]
    }
}

/// Native condition for a UML condition whose flags live in NZCV. `U`/`NU`
/// have no native equivalent and map to `Al` as a placeholder; callers must
/// route them through the emulated-flags register. Note UML `C` is borrow
/// polarity on the host, hence `Cc`.
pub fn cond_for(cond: uml::Cond) -> ArmCond {
    match cond {
        uml::Cond::Z => ArmCond::Eq,
        uml::Cond::NZ => ArmCond::Ne,
        uml::Cond::S => ArmCond::Mi,
        uml::Cond::NS => ArmCond::Pl,
        uml::Cond::C => ArmCond::Cc,
        uml::Cond::NC => ArmCond::Cs,
        uml::Cond::V => ArmCond::Vs,
        uml::Cond::NV => ArmCond::Vc,
        uml::Cond::U | uml::Cond::NU => ArmCond::Al,
        uml::Cond::A => ArmCond::Hi,
        uml::Cond::BE => ArmCond::Ls,
        uml::Cond::G => ArmCond::Gt,
        uml::Cond::LE => ArmCond::Le,
        uml::Cond::L => ArmCond::Lt,
        uml::Cond::GE => ArmCond::Ge,
        uml::Cond::Always => panic!("no native condition for COND_ALWAYS"),
    }
}

pub fn not_cond_for(cond: uml::Cond) -> ArmCond {
    cond_for(cond).invert()
}

// ─── Immediate validity ─────────────────────────────────────────────────────

pub fn bitmask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

pub fn is_valid_uimm(val: u64, bits: u32) -> bool {
    assert!(bits < 64);
    val < (1u64 << bits)
}

pub fn is_valid_simm(val: i64, bits: u32) -> bool {
    let shift = 64 - bits;
    (val << shift) >> shift == val
}

/// 12-bit unsigned immediate, optionally left-shifted by 12.
pub fn is_valid_addsub(val: u64) -> bool {
    val & !bitmask(12) == 0 || val & !(bitmask(12) << 12) == 0
}

/// Offset usable by a load/store whose element is `1 << scale` bytes:
/// either a 9-bit signed byte offset or a scaled unsigned 12-bit offset.
pub fn is_valid_offset(diff: i64, scale: u32) -> bool {
    if is_valid_simm(diff, 9) {
        true
    } else {
        diff >= 0 && diff < (1 << (12 + scale)) && diff & bitmask(scale) as i64 == 0
    }
}

/// Encode a logical (bitmask) immediate for the given operand size. Returns
/// `(N, immr, imms)`. This is also the validity test: a value is a bitmask
/// immediate iff this returns `Some`.
pub fn encode_bitmask(value: u64, sz: u32) -> Option<(u32, u32, u32)> {
    let bits = sz * 8;
    debug_assert!(bits == 32 || bits == 64);
    let value = value & bitmask(bits);
    if value == 0 || value == bitmask(bits) {
        return None;
    }

    // Smallest power-of-two period of the pattern.
    let mut width = bits;
    let mut w = 2;
    while w < bits {
        let elem = value & bitmask(w);
        let mut rep = elem;
        let mut i = w;
        while i < bits {
            rep |= elem << i;
            i += w;
        }
        if rep == value {
            width = w;
            break;
        }
        w <<= 1;
    }

    let elem = value & bitmask(width);
    let ones = elem.count_ones();
    if ones == 0 || ones == width {
        return None;
    }

    // The element must be a rotation of a contiguous run of ones.
    let run = bitmask(ones);
    let rot = (0..width).find(|&r| rotl_within(run, r, width) == elem)?;

    let immr = (width - rot) % width;
    let imms = (!(width * 2 - 1) & 0x3f) | (ones - 1);
    let n = (width == 64) as u32;
    Some((n, immr, imms))
}

fn rotl_within(val: u64, rot: u32, width: u32) -> u64 {
    if rot == 0 {
        val & bitmask(width)
    } else {
        (val << rot | (val & bitmask(width)) >> (width - rot)) & bitmask(width)
    }
}

pub fn is_valid_bitmask(value: u64, sz: u32) -> bool {
    encode_bitmask(value, sz).is_some()
}

/// True when the value loads into a register of the given width with one
/// instruction (movz, movn, or a bitmask immediate).
pub fn is_single_mov_imm(val: u64, sz: u32) -> bool {
    classify_single_mov(val, sz).is_some()
}

enum SingleMov {
    Movz { lane: u32, shift: u32 },
    Movn { lane: u32, shift: u32, wide: bool },
    Mask { wide: bool },
}

fn single_lane(val: u64, bits: u32) -> Option<(u32, u32)> {
    let mut found = None;
    let mut shift = 0;
    while shift < bits {
        let lane = (val >> shift) & 0xffff;
        if lane != 0 {
            if found.is_some() {
                return None;
            }
            found = Some((lane as u32, shift));
        }
        shift += 16;
    }
    Some(found.unwrap_or((0, 0)))
}

fn classify_single_mov(val: u64, sz: u32) -> Option<SingleMov> {
    let bits = sz * 8;
    let val = val & bitmask(bits);

    if let Some((lane, shift)) = single_lane(val, bits) {
        return Some(SingleMov::Movz { lane, shift });
    }
    if let Some((lane, shift)) = single_lane(!val & bitmask(bits), bits) {
        return Some(SingleMov::Movn { lane, shift, wide: sz == 8 });
    }
    // A 32-bit movn zero-extends, so a 64-bit value that fits in 32 bits
    // with a mostly-ones pattern still needs only one instruction.
    if sz == 8 && val <= u32::MAX as u64 {
        if let Some((lane, shift)) = single_lane(!val & bitmask(32), 32) {
            return Some(SingleMov::Movn { lane, shift, wide: false });
        }
    }
    if encode_bitmask(val, sz).is_some() {
        return Some(SingleMov::Mask { wide: sz == 8 });
    }
    if sz == 8 && val <= u32::MAX as u64 && encode_bitmask(val, 4).is_some() {
        return Some(SingleMov::Mask { wide: false });
    }
    None
}

// ─── Load/store kinds ───────────────────────────────────────────────────────

/// One load/store instruction shape: size field, vector bit, opc field, and
/// the scale that governs unsigned-offset encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdSt {
    size: u8,
    v: bool,
    opc: u8,
}

impl LdSt {
    pub const LDRB: LdSt = LdSt { size: 0, v: false, opc: 1 };
    pub const STRB: LdSt = LdSt { size: 0, v: false, opc: 0 };
    pub const LDRH: LdSt = LdSt { size: 1, v: false, opc: 1 };
    pub const STRH: LdSt = LdSt { size: 1, v: false, opc: 0 };
    pub const LDRW: LdSt = LdSt { size: 2, v: false, opc: 1 };
    pub const STRW: LdSt = LdSt { size: 2, v: false, opc: 0 };
    pub const LDRX: LdSt = LdSt { size: 3, v: false, opc: 1 };
    pub const STRX: LdSt = LdSt { size: 3, v: false, opc: 0 };
    /// Sign-extending loads into an X register.
    pub const LDRSB: LdSt = LdSt { size: 0, v: false, opc: 2 };
    pub const LDRSH: LdSt = LdSt { size: 1, v: false, opc: 2 };
    pub const LDRSW: LdSt = LdSt { size: 2, v: false, opc: 2 };
    pub const LDRS: LdSt = LdSt { size: 2, v: true, opc: 1 };
    pub const STRS: LdSt = LdSt { size: 2, v: true, opc: 0 };
    pub const LDRD: LdSt = LdSt { size: 3, v: true, opc: 1 };
    pub const STRD: LdSt = LdSt { size: 3, v: true, opc: 0 };

    pub fn ldr(sz: u32) -> LdSt {
        if sz == 8 { LdSt::LDRX } else { LdSt::LDRW }
    }

    pub fn str(sz: u32) -> LdSt {
        if sz == 8 { LdSt::STRX } else { LdSt::STRW }
    }

    pub fn ldr_f(sz: u32) -> LdSt {
        if sz == 8 { LdSt::LDRD } else { LdSt::LDRS }
    }

    pub fn str_f(sz: u32) -> LdSt {
        if sz == 8 { LdSt::STRD } else { LdSt::STRS }
    }

    /// Element-size shift for offset scaling and indexed addressing.
    pub fn scale(self) -> u32 {
        self.size as u32
    }
}

/// Raw logical operations sharing one immediate encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    And = 0,
    Orr = 1,
    Eor = 2,
    Ands = 3,
}

/// Shifted-register ALU forms needed with a nonzero shift amount.
#[derive(Debug, Clone, Copy)]
pub enum ShiftedOp {
    Add,
    Orr,
    Bic,
}

// ─── The emitter ────────────────────────────────────────────────────────────

pub struct Emitter {
    pub a: Asm,
    base: u64,
    baseptr: u64,
    /// Relationship between the native carry flag and UML C right now.
    pub carry: CarryState,
}

macro_rules! alu3 {
    ($fname:ident, $mn:ident) => {
        pub fn $fname(&mut self, sz: u32, d: u8, n: u8, m: u8) {
            if sz == 8 {
                dynasm!(self.a ; .arch aarch64 ; $mn X(d as u32), X(n as u32), X(m as u32));
            } else {
                dynasm!(self.a ; .arch aarch64 ; $mn W(d as u32), W(n as u32), W(m as u32));
            }
        }
    };
}

macro_rules! alu2 {
    ($fname:ident, $mn:ident) => {
        pub fn $fname(&mut self, sz: u32, d: u8, n: u8) {
            if sz == 8 {
                dynasm!(self.a ; .arch aarch64 ; $mn X(d as u32), X(n as u32));
            } else {
                dynasm!(self.a ; .arch aarch64 ; $mn W(d as u32), W(n as u32));
            }
        }
    };
}

macro_rules! falu3 {
    ($fname:ident, $mn:ident) => {
        pub fn $fname(&mut self, sz: u32, d: u8, n: u8, m: u8) {
            if sz == 8 {
                dynasm!(self.a ; .arch aarch64 ; $mn D(d as u32), D(n as u32), D(m as u32));
            } else {
                dynasm!(self.a ; .arch aarch64 ; $mn S(d as u32), S(n as u32), S(m as u32));
            }
        }
    };
}

macro_rules! falu2 {
    ($fname:ident, $mn:ident) => {
        pub fn $fname(&mut self, sz: u32, d: u8, n: u8) {
            if sz == 8 {
                dynasm!(self.a ; .arch aarch64 ; $mn D(d as u32), D(n as u32));
            } else {
                dynasm!(self.a ; .arch aarch64 ; $mn S(d as u32), S(n as u32));
            }
        }
    };
}

impl Emitter {
    /// Create an emitter targeting the absolute address `base`, with the
    /// base register holding `baseptr` in generated code.
    pub fn new(base: usize, baseptr: u64) -> Self {
        Emitter {
            a: Asm::new(base),
            base: base as u64,
            baseptr,
            carry: CarryState::Poison,
        }
    }

    /// Absolute address of the next emitted instruction.
    pub fn cursor(&self) -> u64 {
        self.base + self.a.offset().0 as u64
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn baseptr(&self) -> u64 {
        self.baseptr
    }

    pub fn new_label(&mut self) -> DynamicLabel {
        self.a.new_dynamic_label()
    }

    pub fn bind(&mut self, label: DynamicLabel) {
        dynasm!(self.a ; .arch aarch64 ; =>label);
    }

    pub fn finalize(self) -> Result<Vec<u8>, Error> {
        self.a.finalize().map_err(Error::Assembler)
    }

    /// Emit one raw instruction word.
    pub fn word(&mut self, word: u32) {
        for byte in word.to_le_bytes() {
            self.a.push(byte);
        }
    }

    // ── Raw-encoded families ────────────────────────────────────────────

    /// Logical operation with a bitmask immediate. The value must satisfy
    /// [`is_valid_bitmask`] at the same size.
    pub fn logical_imm(&mut self, op: LogOp, sz: u32, rd: u8, rn: u8, value: u64) {
        let (n, immr, imms) =
            encode_bitmask(value, sz).expect("logical immediate is not a valid bitmask");
        let sf = (sz == 8) as u32;
        debug_assert!(n == 0 || sf == 1);
        self.word(
            sf << 31
                | (op as u32) << 29
                | 0b100100 << 23
                | n << 22
                | immr << 16
                | imms << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    pub fn and_imm(&mut self, sz: u32, rd: u8, rn: u8, value: u64) {
        self.logical_imm(LogOp::And, sz, rd, rn, value);
    }

    pub fn ands_imm(&mut self, sz: u32, rd: u8, rn: u8, value: u64) {
        self.logical_imm(LogOp::Ands, sz, rd, rn, value);
    }

    pub fn orr_imm(&mut self, sz: u32, rd: u8, rn: u8, value: u64) {
        self.logical_imm(LogOp::Orr, sz, rd, rn, value);
    }

    pub fn eor_imm(&mut self, sz: u32, rd: u8, rn: u8, value: u64) {
        self.logical_imm(LogOp::Eor, sz, rd, rn, value);
    }

    pub fn tst_imm(&mut self, sz: u32, rn: u8, value: u64) {
        self.logical_imm(LogOp::Ands, sz, 31, rn, value);
    }

    /// Add/subtract immediate (12-bit, optionally shifted by 12). `rd`/`rn`
    /// of 31 mean SP here, per the instruction format.
    pub fn addsub_imm(&mut self, sz: u32, sub: bool, set_flags: bool, rd: u8, rn: u8, value: u64) {
        assert!(is_valid_addsub(value), "invalid add/sub immediate {value:#x}");
        let sf = (sz == 8) as u32;
        let (sh, imm12) = if value & !bitmask(12) == 0 {
            (0, value as u32)
        } else {
            (1, (value >> 12) as u32)
        };
        self.word(
            sf << 31
                | (sub as u32) << 30
                | (set_flags as u32) << 29
                | 0b100010 << 23
                | sh << 22
                | imm12 << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    pub fn add_imm(&mut self, sz: u32, rd: u8, rn: u8, value: u64) {
        self.addsub_imm(sz, false, false, rd, rn, value);
    }

    pub fn sub_imm(&mut self, sz: u32, rd: u8, rn: u8, value: u64) {
        self.addsub_imm(sz, true, false, rd, rn, value);
    }

    pub fn cmp_imm(&mut self, sz: u32, rn: u8, value: u64) {
        self.addsub_imm(sz, true, true, 31, rn, value);
    }

    /// `rd = rn + diff` via one add or sub when the offset fits; false
    /// otherwise.
    pub fn try_add_offset(&mut self, rd: u8, rn: u8, diff: i64) -> bool {
        if diff >= 0 && is_valid_addsub(diff as u64) {
            self.add_imm(8, rd, rn, diff as u64);
            true
        } else if diff < 0 && is_valid_addsub(diff.unsigned_abs()) {
            self.sub_imm(8, rd, rn, diff.unsigned_abs());
            true
        } else {
            false
        }
    }

    /// ALU op with a left-shifted register operand.
    pub fn alu_shifted(&mut self, op: ShiftedOp, sz: u32, rd: u8, rn: u8, rm: u8, lsl: u32) {
        let sf = (sz == 8) as u32;
        debug_assert!(lsl < sz * 8);
        let word = match op {
            ShiftedOp::Add => {
                sf << 31 | 0b01011 << 24 | (rm as u32) << 16 | lsl << 10 | (rn as u32) << 5
            }
            ShiftedOp::Orr => {
                sf << 31
                    | 0b01 << 29
                    | 0b01010 << 24
                    | (rm as u32) << 16
                    | lsl << 10
                    | (rn as u32) << 5
            }
            ShiftedOp::Bic => {
                sf << 31 | 0b01010 << 24 | 1 << 21 | (rm as u32) << 16 | lsl << 10 | (rn as u32) << 5
            }
        };
        self.word(word | rd as u32);
    }

    // Bitfield family (SBFM/BFM/UBFM encodings).

    fn bitfield(&mut self, opc: u32, sz: u32, rd: u8, rn: u8, immr: u32, imms: u32) {
        let sf = (sz == 8) as u32;
        self.word(
            sf << 31
                | opc << 29
                | 0b100110 << 23
                | sf << 22
                | immr << 16
                | imms << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    /// Unsigned bitfield extract: `rd = (rn >> lsb) & mask(width)`.
    pub fn ubfx(&mut self, sz: u32, rd: u8, rn: u8, lsb: u32, width: u32) {
        debug_assert!(width >= 1 && lsb + width <= sz * 8);
        self.bitfield(0b10, sz, rd, rn, lsb, lsb + width - 1);
    }

    /// Bitfield insert: `rd[lsb..lsb+width] = rn[0..width]`.
    pub fn bfi(&mut self, sz: u32, rd: u8, rn: u8, lsb: u32, width: u32) {
        let bits = sz * 8;
        debug_assert!(width >= 1 && lsb + width <= bits);
        self.bitfield(0b01, sz, rd, rn, (bits - lsb) % bits, width - 1);
    }

    /// Unsigned bitfield insert in zeroed destination.
    pub fn ubfiz(&mut self, sz: u32, rd: u8, rn: u8, lsb: u32, width: u32) {
        let bits = sz * 8;
        debug_assert!(width >= 1 && lsb + width <= bits);
        self.bitfield(0b10, sz, rd, rn, (bits - lsb) % bits, width - 1);
    }

    /// Bitfield clear.
    pub fn bfc(&mut self, sz: u32, rd: u8, lsb: u32, width: u32) {
        let bits = sz * 8;
        debug_assert!(width >= 1 && lsb + width <= bits);
        self.bitfield(0b01, sz, rd, 31, (bits - lsb) % bits, width - 1);
    }

    // Immediate shifts, encoded directly so shift amounts computed by the
    // generators need no alias translation.

    pub fn lsl_imm(&mut self, sz: u32, rd: u8, rn: u8, shift: u32) {
        let bits = sz * 8;
        debug_assert!(shift < bits);
        self.bitfield(0b10, sz, rd, rn, (bits - shift) % bits, bits - 1 - shift);
    }

    pub fn lsr_imm(&mut self, sz: u32, rd: u8, rn: u8, shift: u32) {
        let bits = sz * 8;
        debug_assert!(shift < bits);
        self.bitfield(0b10, sz, rd, rn, shift, bits - 1);
    }

    pub fn asr_imm(&mut self, sz: u32, rd: u8, rn: u8, shift: u32) {
        let bits = sz * 8;
        debug_assert!(shift < bits);
        self.bitfield(0b00, sz, rd, rn, shift, bits - 1);
    }

    pub fn ror_imm(&mut self, sz: u32, rd: u8, rn: u8, shift: u32) {
        let bits = sz * 8;
        debug_assert!(shift < bits);
        // EXTR rd, rn, rn, #shift
        let sf = (sz == 8) as u32;
        self.word(
            sf << 31
                | 0b00100111 << 23
                | sf << 22
                | (rn as u32) << 16
                | shift << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    // Conditional select family with data-driven conditions.

    fn condsel(&mut self, op: u32, o2: u32, sz: u32, rd: u8, rn: u8, rm: u8, cond: ArmCond) {
        let sf = (sz == 8) as u32;
        self.word(
            sf << 31
                | op << 30
                | 0b11010100 << 21
                | (rm as u32) << 16
                | cond.bits() << 12
                | o2 << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    pub fn csel(&mut self, sz: u32, rd: u8, rn: u8, rm: u8, cond: ArmCond) {
        self.condsel(0, 0, sz, rd, rn, rm, cond);
    }

    pub fn csinc(&mut self, sz: u32, rd: u8, rn: u8, rm: u8, cond: ArmCond) {
        self.condsel(0, 1, sz, rd, rn, rm, cond);
    }

    pub fn csinv(&mut self, sz: u32, rd: u8, rn: u8, rm: u8, cond: ArmCond) {
        self.condsel(1, 0, sz, rd, rn, rm, cond);
    }

    /// `rd = cond ? 1 : 0`.
    pub fn cset(&mut self, sz: u32, rd: u8, cond: ArmCond) {
        self.condsel(0, 1, sz, rd, 31, 31, cond.invert());
    }

    pub fn fcsel(&mut self, sz: u32, rd: u8, rn: u8, rm: u8, cond: ArmCond) {
        let ftype = if sz == 8 { 0b01 } else { 0b00 };
        self.word(
            0b00011110 << 24
                | ftype << 22
                | 1 << 21
                | (rm as u32) << 16
                | cond.bits() << 12
                | 0b11 << 10
                | (rn as u32) << 5
                | rd as u32,
        );
    }

    // NZCV access.

    pub fn mrs_nzcv(&mut self, rt: u8) {
        self.word(0xD53B_4200 | rt as u32);
    }

    pub fn msr_nzcv(&mut self, rt: u8) {
        self.word(0xD51B_4200 | rt as u32);
    }

    // ── Raw loads and stores ────────────────────────────────────────────

    /// Load/store with an immediate offset: scaled unsigned form when it
    /// fits, unscaled signed form otherwise. The offset must satisfy
    /// [`is_valid_offset`] for the kind's scale.
    pub fn ldst_imm(&mut self, k: LdSt, rt: u8, rn: u8, offset: i64) {
        let scale = k.scale();
        let head = (k.size as u32) << 30 | 0b111 << 27 | (k.v as u32) << 26;
        if offset >= 0 && offset < (1 << (12 + scale)) && offset & bitmask(scale) as i64 == 0 {
            let imm12 = (offset >> scale) as u32;
            self.word(
                head | 0b01 << 24
                    | (k.opc as u32) << 22
                    | imm12 << 10
                    | (rn as u32) << 5
                    | rt as u32,
            );
        } else {
            assert!(is_valid_simm(offset, 9), "load/store offset out of range: {offset}");
            let simm9 = (offset as u32) & 0x1ff;
            self.word(
                head | (k.opc as u32) << 22 | simm9 << 12 | (rn as u32) << 5 | rt as u32,
            );
        }
    }

    /// Load/store with a register offset, optionally shifted left by the
    /// element size.
    pub fn ldst_regoff(&mut self, k: LdSt, rt: u8, rn: u8, rm: u8, shifted: bool) {
        self.ldst_regoff_option(k, rt, rn, rm, shifted, 0b011);
    }

    /// Register-offset form with a 32-bit zero-extended index, for indexes
    /// whose upper register half is not known to be clean.
    pub fn ldst_regoff_uxtw(&mut self, k: LdSt, rt: u8, rn: u8, rm: u8, shifted: bool) {
        self.ldst_regoff_option(k, rt, rn, rm, shifted, 0b010);
    }

    fn ldst_regoff_option(&mut self, k: LdSt, rt: u8, rn: u8, rm: u8, shifted: bool, option: u32) {
        let head = (k.size as u32) << 30 | 0b111 << 27 | (k.v as u32) << 26;
        self.word(
            head | (k.opc as u32) << 22
                | 1 << 21
                | (rm as u32) << 16
                | option << 13
                | (shifted as u32) << 12
                | 0b10 << 10
                | (rn as u32) << 5
                | rt as u32,
        );
    }

    // ── PC-relative and absolute branches ───────────────────────────────

    pub fn adr_abs(&mut self, rd: u8, target: u64) {
        let rel = target.wrapping_sub(self.cursor()) as i64;
        assert!(is_valid_simm(rel, 21), "adr target out of range");
        let imm = rel as u32 & 0x1f_ffff;
        self.word((imm & 3) << 29 | 0b10000 << 24 | (imm >> 2) << 5 | rd as u32);
    }

    pub fn adrp_abs(&mut self, rd: u8, target_page: u64) {
        let page_rel = (target_page >> 12).wrapping_sub(self.cursor() >> 12) as i64;
        assert!(is_valid_simm(page_rel, 21), "adrp target out of range");
        let imm = page_rel as u32 & 0x1f_ffff;
        self.word(1 << 31 | (imm & 3) << 29 | 0b10000 << 24 | (imm >> 2) << 5 | rd as u32);
    }

    pub fn in_branch_range(&self, target: u64) -> bool {
        let rel = target.wrapping_sub(self.cursor()) as i64;
        rel & 3 == 0 && is_valid_simm(rel, 28)
    }

    pub fn b_abs(&mut self, target: u64) {
        let rel = target.wrapping_sub(self.cursor()) as i64;
        assert!(rel & 3 == 0 && is_valid_simm(rel, 28), "branch target out of range");
        self.word(0x1400_0000 | (rel >> 2) as u32 & 0x03ff_ffff);
    }

    pub fn bl_abs(&mut self, target: u64) {
        let rel = target.wrapping_sub(self.cursor()) as i64;
        assert!(rel & 3 == 0 && is_valid_simm(rel, 28), "call target out of range");
        self.word(0x9400_0000 | (rel >> 2) as u32 & 0x03ff_ffff);
    }

    /// Call an absolute host address: a direct `bl` when in range, else
    /// materialize into scratch and `blr`.
    pub fn call_abs(&mut self, target: u64) {
        if self.in_branch_range(target) {
            self.bl_abs(target);
        } else {
            self.mov_imm(8, SCRATCH_REG1, target);
            self.blr(SCRATCH_REG1);
        }
    }

    // ── dynasm-backed instructions ──────────────────────────────────────

    alu3!(add, add);
    alu3!(adds, adds);
    alu3!(adc, adc);
    alu3!(adcs, adcs);
    alu3!(sub, sub);
    alu3!(subs, subs);
    alu3!(sbc, sbc);
    alu3!(sbcs, sbcs);
    alu3!(and_, and);
    alu3!(ands, ands);
    alu3!(orr, orr);
    alu3!(eor, eor);
    alu3!(bic, bic);
    alu3!(lslv, lslv);
    alu3!(lsrv, lsrv);
    alu3!(asrv, asrv);
    alu3!(rorv, rorv);
    alu3!(udiv, udiv);
    alu3!(sdiv, sdiv);
    alu3!(mul, mul);

    alu2!(mov, mov);
    alu2!(mvn, mvn);
    alu2!(clz, clz);
    alu2!(rbit, rbit);
    alu2!(rev, rev);

    pub fn tst(&mut self, sz: u32, n: u8, m: u8) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; tst X(n as u32), X(m as u32));
        } else {
            dynasm!(self.a ; .arch aarch64 ; tst W(n as u32), W(m as u32));
        }
    }

    pub fn cmp(&mut self, sz: u32, n: u8, m: u8) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; cmp X(n as u32), X(m as u32));
        } else {
            dynasm!(self.a ; .arch aarch64 ; cmp W(n as u32), W(m as u32));
        }
    }

    pub fn tst_zero(&mut self, sz: u32) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; tst xzr, xzr);
        } else {
            dynasm!(self.a ; .arch aarch64 ; tst wzr, wzr);
        }
    }

    /// `rd = 0` at the given width.
    pub fn mov_zero(&mut self, sz: u32, rd: u8) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; mov X(rd as u32), xzr);
        } else {
            dynasm!(self.a ; .arch aarch64 ; mov W(rd as u32), wzr);
        }
    }

    pub fn umull(&mut self, d: u8, n: u8, m: u8) {
        dynasm!(self.a ; .arch aarch64 ; umull X(d as u32), W(n as u32), W(m as u32));
    }

    pub fn smull(&mut self, d: u8, n: u8, m: u8) {
        dynasm!(self.a ; .arch aarch64 ; smull X(d as u32), W(n as u32), W(m as u32));
    }

    pub fn umulh(&mut self, d: u8, n: u8, m: u8) {
        dynasm!(self.a ; .arch aarch64 ; umulh X(d as u32), X(n as u32), X(m as u32));
    }

    pub fn smulh(&mut self, d: u8, n: u8, m: u8) {
        dynasm!(self.a ; .arch aarch64 ; smulh X(d as u32), X(n as u32), X(m as u32));
    }

    pub fn msub(&mut self, sz: u32, d: u8, n: u8, m: u8, a: u8) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64
                ; msub X(d as u32), X(n as u32), X(m as u32), X(a as u32));
        } else {
            dynasm!(self.a ; .arch aarch64
                ; msub W(d as u32), W(n as u32), W(m as u32), W(a as u32));
        }
    }

    pub fn sxtb(&mut self, d: u8, n: u8) {
        dynasm!(self.a ; .arch aarch64 ; sxtb X(d as u32), W(n as u32));
    }

    pub fn sxth(&mut self, d: u8, n: u8) {
        dynasm!(self.a ; .arch aarch64 ; sxth X(d as u32), W(n as u32));
    }

    pub fn sxtw(&mut self, d: u8, n: u8) {
        dynasm!(self.a ; .arch aarch64 ; sxtw X(d as u32), W(n as u32));
    }

    pub fn movz(&mut self, sz: u32, rd: u8, imm: u32, shift: u32) {
        let d = rd as u32;
        match (sz, shift) {
            (8, 0) => dynasm!(self.a ; .arch aarch64 ; movz X(d), #imm),
            (8, 16) => dynasm!(self.a ; .arch aarch64 ; movz X(d), #imm, LSL #16),
            (8, 32) => dynasm!(self.a ; .arch aarch64 ; movz X(d), #imm, LSL #32),
            (8, 48) => dynasm!(self.a ; .arch aarch64 ; movz X(d), #imm, LSL #48),
            (_, 0) => dynasm!(self.a ; .arch aarch64 ; movz W(d), #imm),
            (_, 16) => dynasm!(self.a ; .arch aarch64 ; movz W(d), #imm, LSL #16),
            _ => panic!("invalid movz shift {shift} at size {sz}"),
        }
    }

    pub fn movk(&mut self, sz: u32, rd: u8, imm: u32, shift: u32) {
        let d = rd as u32;
        match (sz, shift) {
            (8, 0) => dynasm!(self.a ; .arch aarch64 ; movk X(d), #imm),
            (8, 16) => dynasm!(self.a ; .arch aarch64 ; movk X(d), #imm, LSL #16),
            (8, 32) => dynasm!(self.a ; .arch aarch64 ; movk X(d), #imm, LSL #32),
            (8, 48) => dynasm!(self.a ; .arch aarch64 ; movk X(d), #imm, LSL #48),
            (_, 0) => dynasm!(self.a ; .arch aarch64 ; movk W(d), #imm),
            (_, 16) => dynasm!(self.a ; .arch aarch64 ; movk W(d), #imm, LSL #16),
            _ => panic!("invalid movk shift {shift} at size {sz}"),
        }
    }

    pub fn movn(&mut self, sz: u32, rd: u8, imm: u32, shift: u32) {
        let d = rd as u32;
        match (sz, shift) {
            (8, 0) => dynasm!(self.a ; .arch aarch64 ; movn X(d), #imm),
            (8, 16) => dynasm!(self.a ; .arch aarch64 ; movn X(d), #imm, LSL #16),
            (8, 32) => dynasm!(self.a ; .arch aarch64 ; movn X(d), #imm, LSL #32),
            (8, 48) => dynasm!(self.a ; .arch aarch64 ; movn X(d), #imm, LSL #48),
            (_, 0) => dynasm!(self.a ; .arch aarch64 ; movn W(d), #imm),
            (_, 16) => dynasm!(self.a ; .arch aarch64 ; movn W(d), #imm, LSL #16),
            _ => panic!("invalid movn shift {shift} at size {sz}"),
        }
    }

    // Branches.

    pub fn b(&mut self, label: DynamicLabel) {
        dynasm!(self.a ; .arch aarch64 ; b =>label);
    }

    pub fn b_cond(&mut self, cond: ArmCond, label: DynamicLabel) {
        match cond {
            ArmCond::Eq => dynasm!(self.a ; .arch aarch64 ; b.eq =>label),
            ArmCond::Ne => dynasm!(self.a ; .arch aarch64 ; b.ne =>label),
            ArmCond::Cs => dynasm!(self.a ; .arch aarch64 ; b.hs =>label),
            ArmCond::Cc => dynasm!(self.a ; .arch aarch64 ; b.lo =>label),
            ArmCond::Mi => dynasm!(self.a ; .arch aarch64 ; b.mi =>label),
            ArmCond::Pl => dynasm!(self.a ; .arch aarch64 ; b.pl =>label),
            ArmCond::Vs => dynasm!(self.a ; .arch aarch64 ; b.vs =>label),
            ArmCond::Vc => dynasm!(self.a ; .arch aarch64 ; b.vc =>label),
            ArmCond::Hi => dynasm!(self.a ; .arch aarch64 ; b.hi =>label),
            ArmCond::Ls => dynasm!(self.a ; .arch aarch64 ; b.ls =>label),
            ArmCond::Ge => dynasm!(self.a ; .arch aarch64 ; b.ge =>label),
            ArmCond::Lt => dynasm!(self.a ; .arch aarch64 ; b.lt =>label),
            ArmCond::Gt => dynasm!(self.a ; .arch aarch64 ; b.gt =>label),
            ArmCond::Le => dynasm!(self.a ; .arch aarch64 ; b.le =>label),
            ArmCond::Al => dynasm!(self.a ; .arch aarch64 ; b =>label),
        }
    }

    pub fn cbz(&mut self, sz: u32, r: u8, label: DynamicLabel) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; cbz X(r as u32), =>label);
        } else {
            dynasm!(self.a ; .arch aarch64 ; cbz W(r as u32), =>label);
        }
    }

    pub fn cbnz(&mut self, sz: u32, r: u8, label: DynamicLabel) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; cbnz X(r as u32), =>label);
        } else {
            dynasm!(self.a ; .arch aarch64 ; cbnz W(r as u32), =>label);
        }
    }

    /// Branch if the given low bit of `r` is clear.
    pub fn tbz(&mut self, r: u8, bit: u32, label: DynamicLabel) {
        let r = r as u32;
        match bit {
            0 => dynasm!(self.a ; .arch aarch64 ; tbz X(r), #0, =>label),
            1 => dynasm!(self.a ; .arch aarch64 ; tbz X(r), #1, =>label),
            2 => dynasm!(self.a ; .arch aarch64 ; tbz X(r), #2, =>label),
            3 => dynasm!(self.a ; .arch aarch64 ; tbz X(r), #3, =>label),
            4 => dynasm!(self.a ; .arch aarch64 ; tbz X(r), #4, =>label),
            _ => panic!("unexpected test bit {bit}"),
        }
    }

    /// Branch if the given low bit of `r` is set.
    pub fn tbnz(&mut self, r: u8, bit: u32, label: DynamicLabel) {
        let r = r as u32;
        match bit {
            0 => dynasm!(self.a ; .arch aarch64 ; tbnz X(r), #0, =>label),
            1 => dynasm!(self.a ; .arch aarch64 ; tbnz X(r), #1, =>label),
            2 => dynasm!(self.a ; .arch aarch64 ; tbnz X(r), #2, =>label),
            3 => dynasm!(self.a ; .arch aarch64 ; tbnz X(r), #3, =>label),
            4 => dynasm!(self.a ; .arch aarch64 ; tbnz X(r), #4, =>label),
            _ => panic!("unexpected test bit {bit}"),
        }
    }

    /// Push the minimal non-leaf frame used by generated subroutines. The
    /// frame pointer itself is not updated; only the top-level entry
    /// trampoline does that.
    pub fn push_lr_frame(&mut self) {
        dynasm!(self.a ; .arch aarch64 ; stp x29, x30, [sp, #-16]!);
    }

    pub fn pop_lr_frame(&mut self) {
        dynasm!(self.a ; .arch aarch64 ; ldp x29, x30, [sp], #16);
    }

    /// Reset the stack pointer to the frame pointer, discarding any nested
    /// generated-subroutine frames.
    pub fn mov_sp_fp(&mut self) {
        // mov sp, x29 (add-immediate form; 31 is SP here)
        self.addsub_imm(8, false, false, 31, 29, 0);
    }

    pub fn br(&mut self, r: u8) {
        dynasm!(self.a ; .arch aarch64 ; br X(r as u32));
    }

    pub fn blr(&mut self, r: u8) {
        dynasm!(self.a ; .arch aarch64 ; blr X(r as u32));
    }

    pub fn ret(&mut self) {
        dynasm!(self.a ; .arch aarch64 ; ret);
    }

    // Float instructions.

    falu3!(fadd, fadd);
    falu3!(fsub, fsub);
    falu3!(fmul, fmul);
    falu3!(fdiv, fdiv);
    falu2!(fneg, fneg);
    falu2!(fabs_, fabs);
    falu2!(fsqrt, fsqrt);
    falu2!(frecpe, frecpe);
    falu2!(frsqrte, frsqrte);
    falu2!(fmov_ff, fmov);

    pub fn fcmp(&mut self, sz: u32, n: u8, m: u8) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; fcmp D(n as u32), D(m as u32));
        } else {
            dynasm!(self.a ; .arch aarch64 ; fcmp S(n as u32), S(m as u32));
        }
    }

    /// Move general register to float register, bit-exact.
    pub fn fmov_fg(&mut self, sz: u32, vd: u8, rn: u8) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; fmov D(vd as u32), X(rn as u32));
        } else {
            dynasm!(self.a ; .arch aarch64 ; fmov S(vd as u32), W(rn as u32));
        }
    }

    /// Move float register to general register, bit-exact.
    pub fn fmov_gf(&mut self, sz: u32, rd: u8, vn: u8) {
        if sz == 8 {
            dynasm!(self.a ; .arch aarch64 ; fmov X(rd as u32), D(vn as u32));
        } else {
            dynasm!(self.a ; .arch aarch64 ; fmov W(rd as u32), S(vn as u32));
        }
    }

    /// Float precision conversion between single and double.
    pub fn fcvt(&mut self, dst_sz: u32, vd: u8, src_sz: u32, vn: u8) {
        match (dst_sz, src_sz) {
            (8, 4) => dynasm!(self.a ; .arch aarch64 ; fcvt D(vd as u32), S(vn as u32)),
            (4, 8) => dynasm!(self.a ; .arch aarch64 ; fcvt S(vd as u32), D(vn as u32)),
            _ => panic!("fcvt sizes must differ"),
        }
    }

    /// Signed float-to-int conversion with the given rounding mode.
    pub fn fcvt_int(&mut self, round: uml::RoundMode, int_sz: u32, fp_sz: u32, rd: u8, vn: u8) {
        use uml::RoundMode::*;
        let (d, n) = (rd as u32, vn as u32);
        match (round, int_sz, fp_sz) {
            (Round, 8, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtns X(d), D(n)),
            (Round, 8, _) => dynasm!(self.a ; .arch aarch64 ; fcvtns X(d), S(n)),
            (Round, _, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtns W(d), D(n)),
            (Round, _, _) => dynasm!(self.a ; .arch aarch64 ; fcvtns W(d), S(n)),
            (Ceil, 8, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtps X(d), D(n)),
            (Ceil, 8, _) => dynasm!(self.a ; .arch aarch64 ; fcvtps X(d), S(n)),
            (Ceil, _, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtps W(d), D(n)),
            (Ceil, _, _) => dynasm!(self.a ; .arch aarch64 ; fcvtps W(d), S(n)),
            (Floor, 8, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtms X(d), D(n)),
            (Floor, 8, _) => dynasm!(self.a ; .arch aarch64 ; fcvtms X(d), S(n)),
            (Floor, _, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtms W(d), D(n)),
            (Floor, _, _) => dynasm!(self.a ; .arch aarch64 ; fcvtms W(d), S(n)),
            (Trunc | Default, 8, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtzs X(d), D(n)),
            (Trunc | Default, 8, _) => dynasm!(self.a ; .arch aarch64 ; fcvtzs X(d), S(n)),
            (Trunc | Default, _, 8) => dynasm!(self.a ; .arch aarch64 ; fcvtzs W(d), D(n)),
            (Trunc | Default, _, _) => dynasm!(self.a ; .arch aarch64 ; fcvtzs W(d), S(n)),
        }
    }

    /// Signed int-to-float conversion.
    pub fn scvtf(&mut self, fp_sz: u32, vd: u8, int_sz: u32, rn: u8) {
        let (d, n) = (vd as u32, rn as u32);
        match (fp_sz, int_sz) {
            (8, 8) => dynasm!(self.a ; .arch aarch64 ; scvtf D(d), X(n)),
            (8, _) => dynasm!(self.a ; .arch aarch64 ; scvtf D(d), W(n)),
            (4, 8) => dynasm!(self.a ; .arch aarch64 ; scvtf S(d), X(n)),
            _ => dynasm!(self.a ; .arch aarch64 ; scvtf S(d), W(n)),
        }
    }

    // ── Immediate materialization ───────────────────────────────────────

    /// Materialize `val` with a single instruction if possible.
    fn try_single_mov(&mut self, sz: u32, rd: u8, val: u64) -> bool {
        match classify_single_mov(val, sz) {
            Some(SingleMov::Movz { lane, shift }) => {
                self.movz(sz, rd, lane, shift);
                true
            }
            Some(SingleMov::Movn { lane, shift, wide }) => {
                self.movn(if wide { 8 } else { 4 }, rd, lane, shift);
                true
            }
            Some(SingleMov::Mask { wide, .. }) => {
                let msz = if wide { 8 } else { 4 };
                self.logical_imm(LogOp::Orr, msz, rd, 31, val & bitmask(msz * 8));
                true
            }
            None => false,
        }
    }

    fn mov_imm_fallback(&mut self, sz: u32, rd: u8, val: u64) {
        let bits = sz * 8;
        let mut first = true;
        let mut shift = 0;
        while shift < bits {
            let lane = ((val >> shift) & 0xffff) as u32;
            if lane != 0 || (first && shift + 16 >= bits) {
                if first {
                    self.movz(sz, rd, lane, shift);
                    first = false;
                } else {
                    self.movk(sz, rd, lane, shift);
                }
            }
            shift += 16;
        }
        if first {
            self.movz(sz, rd, 0, 0);
        }
    }

    /// Materialize an absolute constant, without the base-relative rung
    /// (used before the base register is live, i.e. in the entry
    /// trampoline).
    pub fn mov_imm_abs(&mut self, sz: u32, rd: u8, val: u64) {
        let val = if sz == 4 { val & bitmask(32) } else { val };

        if self.try_single_mov(sz, rd, val) {
            return;
        }

        if sz == 8 {
            let rel = val.wrapping_sub(self.cursor()) as i64;
            if is_valid_simm(rel, 21) {
                self.adr_abs(rd, val);
                return;
            }

            let page_rel = (val & !bitmask(12)).wrapping_sub(self.cursor() & !bitmask(12)) as i64;
            if is_valid_simm(page_rel, 33) {
                self.adrp_abs(rd, val & !bitmask(12));
                let pageoffs = val & bitmask(12);
                if pageoffs != 0 {
                    self.add_imm(8, rd, rd, pageoffs);
                }
                return;
            }
        }

        self.mov_imm_fallback(sz, rd, val);
    }

    /// Materialize a constant, preferring the shortest of: single
    /// instruction, PC-relative, base-relative, page-relative, then up to
    /// four 16-bit moves.
    pub fn mov_imm(&mut self, sz: u32, rd: u8, val: u64) {
        let val = if sz == 4 { val & bitmask(32) } else { val };

        if self.try_single_mov(sz, rd, val) {
            return;
        }

        if sz == 8 {
            let rel = val.wrapping_sub(self.cursor()) as i64;
            if is_valid_simm(rel, 21) {
                self.adr_abs(rd, val);
                return;
            }

            let diff = val.wrapping_sub(self.baseptr) as i64;
            if self.try_add_offset(rd, BASE_REG, diff) {
                return;
            }

            let page_rel = (val & !bitmask(12)).wrapping_sub(self.cursor() & !bitmask(12)) as i64;
            if is_valid_simm(page_rel, 33) {
                self.adrp_abs(rd, val & !bitmask(12));
                let pageoffs = val & bitmask(12);
                if pageoffs != 0 {
                    self.add_imm(8, rd, rd, pageoffs);
                }
                return;
            }
        }

        self.mov_imm_fallback(sz, rd, val);
    }

    // ── Absolute-address loads and stores ───────────────────────────────

    /// Load or store `rt` at an absolute host address, choosing the
    /// cheapest addressing form: base-relative immediate, PC-relative,
    /// base + materialized offset (optionally shifted), page-relative, or
    /// full materialization.
    pub fn ldst_abs(&mut self, k: LdSt, rt: u8, ptr: u64) {
        let scale = k.scale();

        let diff = ptr.wrapping_sub(self.baseptr) as i64;
        if is_valid_offset(diff, scale) {
            self.ldst_imm(k, rt, BASE_REG, diff);
            return;
        }

        let rel = ptr.wrapping_sub(self.cursor()) as i64;
        if is_valid_simm(rel, 21) {
            self.adr_abs(MEM_SCRATCH_REG, ptr);
            self.ldst_imm(k, rt, MEM_SCRATCH_REG, 0);
            return;
        }

        if diff > 0 && is_valid_uimm(diff as u64, 16) {
            self.movz(8, MEM_SCRATCH_REG, diff as u32, 0);
            self.ldst_regoff(k, rt, BASE_REG, MEM_SCRATCH_REG, false);
            return;
        }

        if self.try_add_offset(MEM_SCRATCH_REG, BASE_REG, diff) {
            self.ldst_imm(k, rt, MEM_SCRATCH_REG, 0);
            return;
        }

        let page_rel = (ptr & !bitmask(12)).wrapping_sub(self.cursor() & !bitmask(12)) as i64;
        if is_valid_simm(page_rel, 33) {
            self.adrp_abs(MEM_SCRATCH_REG, ptr & !bitmask(12));
            let pageoffs = (ptr & bitmask(12)) as i64;
            if is_valid_offset(pageoffs, scale) {
                self.ldst_imm(k, rt, MEM_SCRATCH_REG, pageoffs);
            } else {
                self.add_imm(8, MEM_SCRATCH_REG, MEM_SCRATCH_REG, pageoffs as u64);
                self.ldst_imm(k, rt, MEM_SCRATCH_REG, 0);
            }
            return;
        }

        if diff >= 0 {
            let shift = if diff & bitmask(scale) as i64 != 0 { 0 } else { scale };
            if is_valid_uimm((diff >> shift) as u64, 32) {
                self.mov_imm_fallback(8, MEM_SCRATCH_REG, (diff >> shift) as u64);
                self.ldst_regoff(k, rt, BASE_REG, MEM_SCRATCH_REG, shift != 0);
                return;
            }
        }

        self.mov_imm_abs(8, MEM_SCRATCH_REG, ptr);
        self.ldst_imm(k, rt, MEM_SCRATCH_REG, 0);
    }

    pub fn ldr_mem(&mut self, sz: u32, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::ldr(sz), rt, ptr);
    }

    pub fn ldrb_mem(&mut self, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::LDRB, rt, ptr);
    }

    pub fn ldrh_mem(&mut self, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::LDRH, rt, ptr);
    }

    pub fn ldrsb_mem(&mut self, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::LDRSB, rt, ptr);
    }

    pub fn ldrsh_mem(&mut self, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::LDRSH, rt, ptr);
    }

    pub fn ldrsw_mem(&mut self, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::LDRSW, rt, ptr);
    }

    pub fn strb_mem(&mut self, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::STRB, rt, ptr);
    }

    pub fn strh_mem(&mut self, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::STRH, rt, ptr);
    }

    pub fn str_mem(&mut self, sz: u32, rt: u8, ptr: u64) {
        self.ldst_abs(LdSt::str(sz), rt, ptr);
    }

    pub fn ldr_float_mem(&mut self, sz: u32, vt: u8, ptr: u64) {
        self.ldst_abs(LdSt::ldr_f(sz), vt, ptr);
    }

    pub fn str_float_mem(&mut self, sz: u32, vt: u8, ptr: u64) {
        self.ldst_abs(LdSt::str_f(sz), vt, ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut Emitter)) -> Vec<u8> {
        let mut e = Emitter::new(0x10000, 0x200000);
        f(&mut e);
        e.finalize().unwrap()
    }

    fn count_insts(bytes: &[u8]) -> usize {
        assert_eq!(bytes.len() % 4, 0);
        bytes.len() / 4
    }

    /// Slow reference check: repeating power-of-two group whose element is a
    /// rotated contiguous run of ones.
    fn is_bitmask_ref(val: u64, bits: u32) -> bool {
        let val = val & bitmask(bits);
        if val == 0 || val == bitmask(bits) {
            return false;
        }
        let mut width = 2;
        while width <= bits {
            if bits % width == 0 {
                let elem = val & bitmask(width);
                let mut rep = 0;
                let mut i = 0;
                while i < bits {
                    rep |= elem << i;
                    i += width;
                }
                if rep == val {
                    let ones = elem.count_ones();
                    if ones > 0 && ones < width {
                        for rot in 0..width {
                            if rotl_within(bitmask(ones), rot, width) == elem {
                                return true;
                            }
                        }
                    }
                    return false;
                }
            }
            width <<= 1;
        }
        false
    }

    #[test]
    fn bitmask_encoder_agrees_with_reference() {
        let corpus: Vec<u64> = {
            let mut v = vec![
                0,
                u64::MAX,
                1,
                0x8000_0000_0000_0000,
                0xff,
                0xff00,
                0x0f0f_0f0f_0f0f_0f0f,
                0x5555_5555_5555_5555,
                0xaaaa_aaaa_aaaa_aaaa,
                0xffff_0000_ffff_0000,
                0x0000_ffff_ffff_0000,
                0x7fff_ffff_ffff_fffe,
                0x1234_5678_9abc_def0,
                0x00ff_ff00,
                0xf000_000f,
                0x0000_0ff0,
            ];
            for w in 0..63u32 {
                v.push(bitmask(w + 1));
                v.push(bitmask(w + 1) << (63 - w).min(12));
            }
            v
        };

        for &val in &corpus {
            for sz in [4u32, 8] {
                assert_eq!(
                    encode_bitmask(val, sz).is_some(),
                    is_bitmask_ref(val, sz * 8),
                    "disagreement for {val:#x} at size {sz}"
                );
            }
        }
    }

    #[test]
    fn single_instruction_rungs() {
        // movz
        assert_eq!(count_insts(&emitted(|e| e.mov_imm(8, 9, 0xbeef_0000))), 1);
        // movn
        assert_eq!(count_insts(&emitted(|e| e.mov_imm(8, 9, !0x1234u64))), 1);
        // bitmask immediate
        assert_eq!(count_insts(&emitted(|e| e.mov_imm(8, 9, 0x0101_0101_0101_0101))), 1);
        // 32-bit mostly-ones, movn at w width
        assert_eq!(count_insts(&emitted(|e| e.mov_imm(8, 9, 0xffff_1234))), 1);
        // zero
        assert_eq!(count_insts(&emitted(|e| e.mov_imm(8, 9, 0))), 1);
    }

    #[test]
    fn pc_relative_rung_is_one_instruction() {
        // Target close to the cursor: a single adr.
        let bytes = emitted(|e| {
            let target = e.cursor() + 0x400;
            e.mov_imm(8, 9, target);
        });
        assert_eq!(count_insts(&bytes), 1);
        // adr opcode: bits 28-24 = 10000, bit 31 = 0
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(word >> 24 & 0x9f, 0x10);
    }

    #[test]
    fn base_relative_rung_is_one_add() {
        let bytes = emitted(|e| {
            let target = e.baseptr() + 0x40;
            e.mov_imm(8, 9, target);
        });
        assert_eq!(count_insts(&bytes), 1);
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // add x9, x27, #0x40
        assert_eq!(word, 0x9101_0000 | (27 << 5) | 9 | (0x40 << 10));
    }

    #[test]
    fn fallback_is_at_most_four_moves() {
        let bytes = emitted(|e| e.mov_imm(8, 9, 0x1234_5678_9abc_def0));
        assert_eq!(count_insts(&bytes), 4);
        let bytes = emitted(|e| e.mov_imm(4, 9, 0x1234_5678));
        assert_eq!(count_insts(&bytes), 2);
    }

    #[test]
    fn base_relative_load_uses_short_offset() {
        let bytes = emitted(|e| {
            let slot = e.baseptr() + 0x18;
            e.ldr_mem(8, 9, slot);
        });
        assert_eq!(count_insts(&bytes), 1);
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // ldr x9, [x27, #0x18] — unsigned offset form, imm12 = 3 (scaled)
        assert_eq!(word, 0xF940_0000 | (3 << 10) | (27 << 5) | 9);
    }

    #[test]
    fn negative_base_offset_uses_unscaled_form() {
        let bytes = emitted(|e| {
            let slot = e.baseptr() - 0x20;
            e.ldr_mem(4, 9, slot);
        });
        assert_eq!(count_insts(&bytes), 1);
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // ldur w9, [x27, #-0x20]
        assert_eq!(word >> 24, 0xB8);
    }

    #[test]
    fn distant_load_materializes_address() {
        let bytes = emitted(|e| e.ldr_mem(8, 9, 0x7f12_3456_7800));
        assert!(count_insts(&bytes) <= 5);
        assert!(count_insts(&bytes) >= 2);
    }

    #[test]
    fn cset_encoding_matches_csinc_alias() {
        let bytes = emitted(|e| e.cset(8, 9, ArmCond::Eq));
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // cset x9, eq == csinc x9, xzr, xzr, ne
        assert_eq!(word, 0x9A9F_17E9);
    }

    #[test]
    fn bitfield_helpers_encode_aliases() {
        let bytes = emitted(|e| {
            e.ubfx(8, 9, 10, 4, 8); // ubfx x9, x10, #4, #8
            e.bfi(8, 9, 10, 4, 8); // bfi x9, x10, #4, #8
            e.lsr_imm(4, 9, 10, 7); // lsr w9, w10, #7
        });
        let w0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let w1 = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let w2 = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(w0, 0xD344_2D49);
        assert_eq!(w1, 0xB37C_1D49);
        assert_eq!(w2, 0x5347_7D49);
    }

    #[test]
    fn nzcv_access_words() {
        let bytes = emitted(|e| {
            e.mrs_nzcv(9);
            e.msr_nzcv(9);
        });
        let w0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let w1 = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(w0, 0xD53B_4209);
        assert_eq!(w1, 0xD51B_4209);
    }
}
