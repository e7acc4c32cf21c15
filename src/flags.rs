//! UML flag emulation on a host with four native flags.
//!
//! Z, S and V live in the native flag register between instructions; C is
//! persisted in bit 0 of the emulated-flags register and U (unordered, no
//! host equivalent) in bit 4. The carry-state tracker records whether the
//! native carry currently mirrors UML C directly (add-style), as a borrow
//! complement (sub/cmp-style), or not at all, so consumers can skip
//! redundant reloads from the emulated-flags word.

use crate::emit::{
    ArmCond, Emitter, FLAGS_REG, SCRATCH_REG1, SCRATCH_REG2, TEMP_REG1, TEMP_REG2, TEMP_REG3,
};
use crate::uml::{FLAG_C, FLAG_U};

/// Bit positions of the UML flags within the packed flags byte.
pub const FLAG_BIT_C: u32 = 0;
pub const FLAG_BIT_V: u32 = 1;
pub const FLAG_BIT_Z: u32 = 2;
pub const FLAG_BIT_S: u32 = 3;
pub const FLAG_BIT_U: u32 = 4;

/// Relationship between the native carry flag and UML C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryState {
    /// Native C does not reflect UML C.
    Poison,
    /// Native C equals UML C (set by add-style operations).
    Canonical,
    /// Native C is the borrow complement of UML C (sub/cmp-style).
    Logical,
}

impl Emitter {
    /// Insert bit 0 of `reg` into the persisted C bit. Register 31 reads as
    /// zero and clears the flag.
    pub fn store_carry_reg(&mut self, reg: u8) {
        self.bfi(8, FLAGS_REG, reg, FLAG_BIT_C, 1);
    }

    /// Capture the native carry into the persisted C bit and record the
    /// resulting carry state. `inverted` is the sub/cmp path where the host
    /// flag holds the borrow complement.
    pub fn store_carry(&mut self, inverted: bool) {
        self.carry = if inverted { CarryState::Logical } else { CarryState::Canonical };

        let cond = if inverted { ArmCond::Cc } else { ArmCond::Cs };
        self.cset(8, SCRATCH_REG1, cond);
        self.store_carry_reg(SCRATCH_REG1);
    }

    /// Extract UML C into `reg`, optionally complemented.
    pub fn get_carry(&mut self, reg: u8, inverted: bool) {
        self.and_imm(8, reg, FLAGS_REG, 1);
        if inverted {
            self.eor_imm(8, reg, reg, 1);
        }
    }

    /// Extract the U flag into `reg`.
    pub fn get_unordered(&mut self, reg: u8) {
        self.ubfx(8, reg, FLAGS_REG, FLAG_BIT_U, 1);
    }

    /// Make the native carry flag hold UML C (or its complement) ahead of a
    /// consumer that reads it from NZCV. No code is emitted when the carry
    /// state already matches.
    pub fn load_carry(&mut self, inverted: bool) {
        let desired = if inverted { CarryState::Logical } else { CarryState::Canonical };
        if self.carry == desired {
            return;
        }
        self.carry = desired;

        self.mrs_nzcv(SCRATCH_REG1);
        self.bfi(8, SCRATCH_REG1, FLAGS_REG, 29, 1);
        if inverted {
            self.eor_imm(8, SCRATCH_REG1, SCRATCH_REG1, 1 << 29);
        }
        self.msr_nzcv(SCRATCH_REG1);
    }

    /// Rebuild the native Z/S/V flags from a full UML flags byte held in the
    /// flags register, then reduce the register to its persistent C and U
    /// bits. Native C is left clear, so the carry state is poisoned.
    pub fn set_flags(&mut self) {
        self.carry = CarryState::Poison;

        self.mrs_nzcv(TEMP_REG1);

        self.and_imm(8, TEMP_REG2, FLAGS_REG, 0b1100); // Z and S line up with NZCV[30:31] - 28
        self.ubfx(8, TEMP_REG3, FLAGS_REG, FLAG_BIT_V, 1);
        self.orr(8, TEMP_REG2, TEMP_REG2, TEMP_REG3);
        self.bfi(8, TEMP_REG1, TEMP_REG2, 28, 4);

        self.msr_nzcv(TEMP_REG1);

        self.movz(8, TEMP_REG2, (FLAG_C | FLAG_U) as u32, 0);
        self.and_(8, FLAGS_REG, FLAGS_REG, TEMP_REG2);
    }

    /// Derive the U flag from the NZCV state left by a float compare: the
    /// conjunction of {plus, not-equal, carry-set, overflow-set} holds
    /// exactly for unordered operands.
    pub fn store_unordered(&mut self) {
        self.cset(8, SCRATCH_REG1, ArmCond::Pl);
        self.cset(8, SCRATCH_REG2, ArmCond::Ne);
        self.and_(8, SCRATCH_REG1, SCRATCH_REG1, SCRATCH_REG2);
        self.cset(8, SCRATCH_REG2, ArmCond::Cs);
        self.and_(8, SCRATCH_REG1, SCRATCH_REG1, SCRATCH_REG2);
        self.cset(8, SCRATCH_REG2, ArmCond::Vs);
        self.and_(8, SCRATCH_REG1, SCRATCH_REG1, SCRATCH_REG2);
        self.bfi(8, FLAGS_REG, SCRATCH_REG1, FLAG_BIT_U, 1);
    }

    // ── Shift/rotate carry-out calculators ──────────────────────────────
    //
    // These consume the pre-shift source value; callers must keep it live
    // until after the call. Only x12 and the flags register are written.

    /// Carry out of a left shift by a register amount: the bit shifted past
    /// the top, zero when the amount is zero.
    pub fn calculate_carry_shift_left(&mut self, sz: u32, reg: u8, shift: u8, max_bits: u32) {
        self.carry = CarryState::Poison;

        let calc = self.new_label();
        let end = self.new_label();

        self.cbnz(sz, shift, calc);
        self.store_carry_reg(31);
        self.b(end);

        self.bind(calc);
        // carry = (reg >> (max_bits + 1 - shift)) & 1
        self.movz(sz, SCRATCH_REG1, max_bits + 1, 0);
        self.sub(sz, SCRATCH_REG1, SCRATCH_REG1, shift);
        self.lsrv(sz, SCRATCH_REG1, reg, SCRATCH_REG1);
        self.store_carry_reg(SCRATCH_REG1);

        self.bind(end);
    }

    pub fn calculate_carry_shift_left_imm(&mut self, sz: u32, reg: u8, shift: u32, max_bits: u32) {
        self.carry = CarryState::Poison;

        if shift == 0 {
            self.store_carry_reg(31);
            return;
        }

        self.lsr_imm(sz, SCRATCH_REG1, reg, max_bits + 1 - shift);
        self.store_carry_reg(SCRATCH_REG1);
    }

    /// Carry out of a right shift or rotate: the last bit shifted past the
    /// LSB, zero when the amount is zero.
    pub fn calculate_carry_shift_right(&mut self, sz: u32, reg: u8, shift: u8) {
        self.carry = CarryState::Poison;

        let calc = self.new_label();
        let end = self.new_label();

        self.cbnz(sz, shift, calc);
        self.store_carry_reg(31);
        self.b(end);

        self.bind(calc);
        // carry = (reg >> (shift - 1)) & 1
        self.addsub_imm(sz, true, false, SCRATCH_REG1, shift, 1);
        self.lsrv(sz, SCRATCH_REG1, reg, SCRATCH_REG1);
        self.store_carry_reg(SCRATCH_REG1);

        self.bind(end);
    }

    pub fn calculate_carry_shift_right_imm(&mut self, sz: u32, reg: u8, shift: u32) {
        self.carry = CarryState::Poison;

        if shift == 0 {
            self.store_carry_reg(31);
            return;
        }

        self.lsr_imm(sz, SCRATCH_REG1, reg, shift - 1);
        self.store_carry_reg(SCRATCH_REG1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut Emitter)) -> Vec<u32> {
        let mut e = Emitter::new(0x10000, 0x200000);
        f(&mut e);
        e.finalize()
            .unwrap()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn load_carry_skips_when_state_matches() {
        let empty = words(|e| {
            e.carry = CarryState::Canonical;
            e.load_carry(false);
        });
        assert!(empty.is_empty());

        let reload = words(|e| {
            e.carry = CarryState::Canonical;
            e.load_carry(true);
        });
        // mrs + bfi + eor + msr
        assert_eq!(reload.len(), 4);
    }

    #[test]
    fn store_carry_tracks_state() {
        let mut e = Emitter::new(0x10000, 0x200000);
        e.store_carry(false);
        assert_eq!(e.carry, CarryState::Canonical);
        e.store_carry(true);
        assert_eq!(e.carry, CarryState::Logical);
        // cset + bfi per store
        assert_eq!(e.finalize().unwrap().len(), 16);
    }

    #[test]
    fn poisoned_carry_forces_reload() {
        let w = words(|e| {
            e.carry = CarryState::Poison;
            e.load_carry(false);
        });
        assert_eq!(w.len(), 3); // mrs + bfi + msr
        assert_eq!(w[0], 0xD53B_420C); // mrs x12, NZCV
    }

    #[test]
    fn shift_carry_zero_amount_clears_carry() {
        let w = words(|e| e.calculate_carry_shift_right_imm(4, 9, 0));
        // a single bfi from xzr
        assert_eq!(w.len(), 1);
        assert_eq!(e_carry_of(&w[0]), (28, 31));
    }

    fn e_carry_of(word: &u32) -> (u32, u32) {
        // decode BFM rd, rn fields
        (word & 0x1f, (word >> 5) & 0x1f)
    }
}
