//! Integer ALU, shift and rotate opcode generators.
//!
//! Every generator follows the same shape: bind parameters, try to write
//! into the destination's own host register when it is not also a source,
//! pattern-match constant operands for shorter sequences, emit the
//! flag-setting instruction variant only when the instruction requests
//! flags, write back, and update the carry state.

use crate::backend::{Backend, assert_flags, assert_no_condition, assert_no_flags};
use crate::emit::{
    ArmCond, Emitter, FLAGS_REG, FUNC_SCRATCH_REG, LdSt, SCRATCH_REG1, SCRATCH_REG2, TEMP_REG1,
    TEMP_REG2, TEMP_REG3, cond_for, is_valid_addsub, is_valid_bitmask, is_valid_uimm, bitmask,
    not_cond_for,
};
use crate::flags::CarryState;
use crate::param::{BeParam, PTYPE_M, PTYPE_MR, PTYPE_MRI, be_param};
use crate::uml::{Cond, FLAG_C, FLAG_S, FLAG_V, FLAG_Z, Inst, MemSize};

/// Shift family selector for `SHL`/`SHR`/`SAR`/`ROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

fn rotl_sized(value: u64, shift: u64, sz: u32) -> u64 {
    let bits = sz * 8;
    let shift = (shift % bits as u64) as u32;
    if sz == 4 {
        (value as u32).rotate_left(shift) as u64
    } else {
        value.rotate_left(shift)
    }
}

fn rotr_sized(value: u64, shift: u64, sz: u32) -> u64 {
    let bits = sz * 8;
    let shift = (shift % bits as u64) as u32;
    if sz == 4 {
        (value as u32).rotate_right(shift) as u64
    } else {
        value.rotate_right(shift)
    }
}

/// True when the destination has its own register and shares it with none of
/// the listed sources, so it can be written before the sources are consumed.
fn can_use_dst_reg(dstp: &BeParam, sources: &[&BeParam]) -> bool {
    if !dstp.is_int_register() {
        return false;
    }
    sources
        .iter()
        .all(|src| !src.is_int_register() || src.ireg() != dstp.ireg())
}

impl Backend {
    // ── Host-memory loads and stores ────────────────────────────────────

    pub(crate) fn op_load(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let basep = be_param(inst.param(1), PTYPE_M, self.state);
        let indp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let size = inst.param(3).size();
        let scale = inst.param(3).scale() as u32;

        let dstreg = dstp.select_register(TEMP_REG2);

        let offset = if indp.is_immediate() { (indp.immediate() as i64) << scale } else { 0 };
        if indp.is_immediate() && offset >= 0 && is_valid_uimm(offset as u64, 15) {
            let ptr = basep.memory() + offset as u64;
            match size {
                MemSize::Byte => e.ldrb_mem(dstreg, ptr),
                MemSize::Word => e.ldrh_mem(dstreg, ptr),
                MemSize::Dword => e.ldr_mem(4, dstreg, ptr),
                MemSize::Qword => e.ldr_mem(8, dstreg, ptr),
            }
        } else {
            let basereg = TEMP_REG1;
            e.mov_imm(8, basereg, basep.memory());

            // Force the index through a 32-bit move so its upper half is
            // clean for extended addressing.
            let offsreg = TEMP_REG3;
            e.mov_reg_param(4, offsreg, &indp);

            let kind = match size {
                MemSize::Byte => LdSt::LDRB,
                MemSize::Word => LdSt::LDRH,
                MemSize::Dword => LdSt::LDRW,
                MemSize::Qword => LdSt::LDRX,
            };

            // Shifted indexing needs the scale to match the element size.
            if scale == size.log2() {
                e.ldst_regoff_uxtw(kind, dstreg, basereg, offsreg, scale != 0);
            } else if scale != 0 {
                e.alu_shifted(crate::emit::ShiftedOp::Add, 8, basereg, basereg, offsreg, scale);
                e.ldst_imm(kind, dstreg, basereg, 0);
            } else {
                e.ldst_regoff_uxtw(kind, dstreg, basereg, offsreg, false);
            }
        }

        e.mov_param_reg(inst.size(), &dstp, dstreg);
    }

    pub(crate) fn op_loads(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let basep = be_param(inst.param(1), PTYPE_M, self.state);
        let indp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let size = inst.param(3).size();
        let scale = inst.param(3).scale() as u32;

        let dstreg = dstp.select_register(TEMP_REG2);

        let offset = if indp.is_immediate() { (indp.immediate() as i64) << scale } else { 0 };
        if indp.is_immediate() && offset >= 0 && is_valid_uimm(offset as u64, 15) {
            let ptr = basep.memory() + offset as u64;
            match size {
                MemSize::Byte => e.ldrsb_mem(dstreg, ptr),
                MemSize::Word => e.ldrsh_mem(dstreg, ptr),
                MemSize::Dword => e.ldrsw_mem(dstreg, ptr),
                MemSize::Qword => e.ldr_mem(8, dstreg, ptr),
            }
        } else {
            let basereg = TEMP_REG1;
            e.mov_imm(8, basereg, basep.memory());

            let offsreg = TEMP_REG3;
            e.mov_reg_param(4, offsreg, &indp);

            let kind = match size {
                MemSize::Byte => LdSt::LDRSB,
                MemSize::Word => LdSt::LDRSH,
                MemSize::Dword if inst.size() == 8 => LdSt::LDRSW,
                MemSize::Dword => LdSt::LDRW,
                MemSize::Qword => LdSt::LDRX,
            };

            if scale == size.log2() {
                e.ldst_regoff_uxtw(kind, dstreg, basereg, offsreg, scale != 0);
            } else if scale != 0 {
                e.alu_shifted(crate::emit::ShiftedOp::Add, 8, basereg, basereg, offsreg, scale);
                e.ldst_imm(kind, dstreg, basereg, 0);
            } else {
                e.ldst_regoff_uxtw(kind, dstreg, basereg, offsreg, false);
            }
        }

        e.mov_param_reg(inst.size(), &dstp, dstreg);
    }

    pub(crate) fn op_store(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let basep = be_param(inst.param(0), PTYPE_M, self.state);
        let indp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let srcp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let size = inst.param(3).size();
        let scale = inst.param(3).scale() as u32;

        let offset = if indp.is_immediate() { (indp.immediate() as i64) << scale } else { 0 };
        if indp.is_immediate() && offset >= 0 && is_valid_uimm(offset as u64, 15) {
            let srcreg = srcp.select_register(TEMP_REG2);
            e.mov_reg_param(inst.size(), srcreg, &srcp);

            let ptr = basep.memory() + offset as u64;
            match size {
                MemSize::Byte => e.strb_mem(srcreg, ptr),
                MemSize::Word => e.strh_mem(srcreg, ptr),
                MemSize::Dword => e.str_mem(4, srcreg, ptr),
                MemSize::Qword => e.str_mem(8, srcreg, ptr),
            }
        } else {
            let basereg = TEMP_REG1;
            e.mov_imm(8, basereg, basep.memory());

            let srcreg = srcp.select_register(TEMP_REG2);
            let offsreg = TEMP_REG3;
            e.mov_reg_param(inst.size(), srcreg, &srcp);
            e.mov_reg_param(4, offsreg, &indp);

            let kind = match size {
                MemSize::Byte => LdSt::STRB,
                MemSize::Word => LdSt::STRH,
                MemSize::Dword => LdSt::STRW,
                MemSize::Qword => LdSt::STRX,
            };

            if scale == size.log2() {
                e.ldst_regoff_uxtw(kind, srcreg, basereg, offsreg, scale != 0);
            } else if scale != 0 {
                e.alu_shifted(crate::emit::ShiftedOp::Add, 8, basereg, basereg, offsreg, scale);
                e.ldst_imm(kind, srcreg, basereg, 0);
            } else {
                e.ldst_regoff_uxtw(kind, srcreg, basereg, offsreg, false);
            }
        }
    }

    // ── Flag plumbing ───────────────────────────────────────────────────

    pub(crate) fn op_carry(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C);

        e.carry = CarryState::Poison;

        let srcp = be_param(inst.param(0), PTYPE_MRI, self.state);
        let bitp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let sz = inst.size();
        let bits = sz * 8;

        let src = srcp.select_register(TEMP_REG1);

        if srcp.is_immediate() && bitp.is_immediate() {
            let bit = (srcp.immediate() >> (bitp.immediate() & (bits as u64 - 1))) & 1;
            e.mov_imm(sz, FUNC_SCRATCH_REG, bit);
            e.store_carry_reg(FUNC_SCRATCH_REG);
        } else if bitp.is_immediate() {
            let shift = (bitp.immediate() % bits as u64) as u32;

            e.mov_reg_param(sz, src, &srcp);

            if shift != 0 {
                e.lsr_imm(sz, FUNC_SCRATCH_REG, src, shift);
                e.store_carry_reg(FUNC_SCRATCH_REG);
            } else {
                e.store_carry_reg(src);
            }
        } else {
            let shift = bitp.select_register(TEMP_REG2);

            e.mov_reg_param(sz, src, &srcp);
            e.mov_reg_param(sz, shift, &bitp);

            e.and_imm(sz, FUNC_SCRATCH_REG, shift, bits as u64 - 1);
            e.lsrv(sz, FUNC_SCRATCH_REG, src, FUNC_SCRATCH_REG);
            e.store_carry_reg(FUNC_SCRATCH_REG);
        }
    }

    pub(crate) fn op_set(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        crate::backend::assert_any_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let sz = inst.size();

        if inst.condition() == Cond::Always {
            e.mov_param_imm(sz, &dstp, 1);
            return;
        }

        let dst = dstp.select_register(TEMP_REG1);

        match inst.condition() {
            cond @ (Cond::U | Cond::NU) => {
                e.get_unordered(dst);
                if cond == Cond::NU {
                    e.eor_imm(8, dst, dst, 1);
                }
            }
            cond @ (Cond::C | Cond::NC) => match e.carry {
                CarryState::Canonical => e.cset(sz, dst, not_cond_for(cond)),
                CarryState::Logical => e.cset(sz, dst, cond_for(cond)),
                CarryState::Poison => {
                    e.get_carry(dst, false);
                    if cond == Cond::NC {
                        e.eor_imm(8, dst, dst, 1);
                    }
                }
            },
            cond @ (Cond::A | Cond::BE) => {
                e.load_carry(true);
                e.cset(sz, dst, cond_for(cond));
            }
            cond => e.cset(sz, dst, cond_for(cond)),
        }

        e.mov_param_reg(sz, &dstp, dst);
    }

    // ── Moves and bit wrangling ─────────────────────────────────────────

    pub(crate) fn op_mov(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        crate::backend::assert_any_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let sz = inst.size();

        // A conditional select avoids a branch, but only pays off when both
        // values are (or cheaply become) register-resident.
        let mut usesel = dstp.is_int_register()
            && ((sz == 8 && srcp.is_int_register())
                || (srcp.is_immediate()
                    && crate::emit::is_single_mov_imm(srcp.immediate(), sz)));
        match inst.condition() {
            Cond::Always | Cond::U | Cond::NU => usesel = false,
            Cond::C | Cond::NC => {
                if e.carry == CarryState::Poison {
                    usesel = false;
                }
            }
            _ => {}
        }

        if usesel {
            let srczero = srcp.is_immediate_value(0);
            let srcone = srcp.is_immediate_value(1);
            let srcnegone = sz == 8 && srcp.is_immediate_value(u64::MAX);
            let srcspecial = srczero || srcone || srcnegone;

            let dst = dstp.select_register(TEMP_REG1);
            let src = if srcspecial { 31 } else { srcp.select_register(TEMP_REG2) };

            e.mov_reg_param(sz, dst, &dstp);
            if !srcspecial {
                e.mov_reg_param(sz, src, &srcp);
            }

            let cond = inst.condition();
            let keep_cond = match cond {
                Cond::C | Cond::NC if e.carry == CarryState::Canonical => cond_for(cond),
                Cond::C | Cond::NC => not_cond_for(cond),
                Cond::A | Cond::BE => {
                    e.load_carry(true);
                    not_cond_for(cond)
                }
                _ => not_cond_for(cond),
            };

            // keep_cond selects the existing destination value.
            if srcone {
                e.csinc(8, dst, dst, src, keep_cond);
            } else if srcnegone {
                e.csinv(8, dst, dst, src, keep_cond);
            } else {
                e.csel(8, dst, src, dst, keep_cond.invert());
            }

            e.mov_param_reg(sz, &dstp, dst);
        } else {
            let skip = e.emit_skip(inst.condition());

            e.mov_param_param(sz, &dstp, &srcp);

            if let Some(skip) = skip {
                e.bind(skip);
            }
        }
    }

    pub(crate) fn op_sext(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_S | FLAG_Z);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let size = inst.param(2).size();
        let sz = inst.size();

        let dstreg = dstp.select_register(TEMP_REG2);

        if size.bytes() >= sz {
            if inst.flag_mask() != 0 {
                e.mov_reg_param(sz, dstreg, &srcp);
                e.mov_param_reg(sz, &dstp, dstreg);
            } else {
                e.mov_param_param(sz, &dstp, &srcp);
            }
        } else {
            if srcp.is_memory() {
                match size {
                    MemSize::Byte => e.ldrsb_mem(dstreg, srcp.memory()),
                    MemSize::Word => e.ldrsh_mem(dstreg, srcp.memory()),
                    MemSize::Dword => e.ldrsw_mem(dstreg, srcp.memory()),
                    MemSize::Qword => e.ldr_mem(8, dstreg, srcp.memory()),
                }
            } else {
                let tempreg = srcp.select_register(dstreg);
                e.mov_reg_param(sz, tempreg, &srcp);

                match size {
                    MemSize::Byte => e.sxtb(dstreg, tempreg),
                    MemSize::Word => e.sxth(dstreg, tempreg),
                    MemSize::Dword => e.sxtw(dstreg, tempreg),
                    MemSize::Qword => {}
                }
            }

            e.mov_param_reg(sz, &dstp, dstreg);
        }

        if inst.flag_mask() != 0 {
            e.tst(sz, dstreg, dstreg);
            e.carry = CarryState::Poison;
        }
    }

    pub(crate) fn op_roland(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_S | FLAG_Z);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let shiftp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let maskp = be_param(inst.param(3), PTYPE_MRI, self.state);
        let sz = inst.size();
        let instbits = sz as u64 * 8;

        let output = dstp.select_register(TEMP_REG1);

        if maskp.is_immediate_value(0) {
            // A zero mask always produces zero.
            e.mov_param_imm(sz, &dstp, 0);

            if inst.flag_mask() != 0 {
                e.tst_zero(sz);
                e.carry = CarryState::Poison;
            }
            return;
        }

        let mut optimized = false;
        if srcp.is_immediate() && shiftp.is_immediate() && maskp.is_immediate() {
            // Fully constant: fold into one materialization.
            let result =
                rotl_sized(srcp.immediate(), shiftp.immediate(), sz) & maskp.immediate();
            e.mov_imm(sz, output, result);
            optimized = true;
        } else if maskp.is_immediate()
            && shiftp.is_immediate()
            && !maskp.is_immediate_value(bitmask(instbits as u32))
        {
            let mask = maskp.immediate();
            let pop = mask.count_ones();
            let lz = mask.leading_zeros() & (instbits as u32 - 1);
            let invlamask = !(mask << lz) & bitmask(instbits as u32);
            let is_right_aligned = mask & (mask + 1) == 0;
            let is_contiguous = invlamask & (invlamask + 1) == 0;
            let s = (shiftp.immediate() & (instbits - 1)) as u32;

            if is_right_aligned || is_contiguous {
                e.mov_reg_param(sz, output, &srcp);
                optimized = true;
            }

            if is_right_aligned {
                // A right-aligned mask becomes an extract or a rotate plus
                // a top clear.
                let s2 = (instbits as u32 - s) & (instbits as u32 - 1);

                if s >= pop {
                    e.ubfx(sz, output, output, s2, pop);
                } else {
                    if s2 > 0 {
                        e.ror_imm(sz, output, output, s2);
                    }
                    e.bfc(sz, output, pop, instbits as u32 - pop);
                }
            } else if is_contiguous {
                let rot = (s + pop + lz).wrapping_neg() & (instbits as u32 - 1);

                if rot > 0 {
                    e.ror_imm(sz, output, output, rot);
                }
                e.ubfiz(sz, output, output, instbits as u32 - pop - lz, pop);
            }
        }

        if !optimized {
            e.mov_reg_param(sz, output, &srcp);

            if shiftp.is_immediate() {
                let s = (shiftp.immediate() as i64).wrapping_neg() as u64 & (instbits - 1);
                if s != 0 {
                    e.ror_imm(sz, output, output, s as u32);
                }
            } else {
                let shift = shiftp.select_register(TEMP_REG2);
                e.mov_reg_param(sz, shift, &shiftp);

                e.and_imm(sz, FUNC_SCRATCH_REG, shift, instbits - 1);
                e.movz(sz, SCRATCH_REG2, instbits as u32, 0);
                e.sub(sz, FUNC_SCRATCH_REG, SCRATCH_REG2, FUNC_SCRATCH_REG);
                e.rorv(sz, output, output, FUNC_SCRATCH_REG);
            }

            // When the mask is all ones the rotate already produced the
            // result.
            let want_flags = inst.flag_mask() != 0;
            if maskp.is_immediate() && is_valid_bitmask(maskp.immediate(), sz) {
                if want_flags {
                    e.ands_imm(sz, output, output, maskp.immediate());
                } else {
                    e.and_imm(sz, output, output, maskp.immediate());
                }
            } else if !maskp.is_immediate() || maskp.immediate() != bitmask(instbits as u32) {
                let mask = maskp.select_register(TEMP_REG2);
                e.mov_reg_param(sz, mask, &maskp);

                if want_flags {
                    e.ands(sz, output, output, mask);
                } else {
                    e.and_(sz, output, output, mask);
                }
            } else {
                optimized = true; // flags still need an explicit test
            }
        }

        e.mov_param_reg(sz, &dstp, output);

        if inst.flag_mask() != 0 {
            if optimized {
                e.tst(sz, output, output);
            }
            e.carry = CarryState::Poison;
        }
    }

    pub(crate) fn op_rolins(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_S | FLAG_Z);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let shiftp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let maskp = be_param(inst.param(3), PTYPE_MRI, self.state);
        let sz = inst.size();
        let instbits = sz as u64 * 8;

        if maskp.is_immediate_value(0) {
            // Nothing gets inserted; only the flags may matter.
            if inst.flag_mask() != 0 {
                let dst = dstp.select_register(TEMP_REG2);
                e.mov_reg_param(sz, dst, &dstp);
                e.tst(sz, dst, dst);
                e.carry = CarryState::Poison;
            }
            return;
        }

        let can_use = can_use_dst_reg(&dstp, &[&srcp, &maskp, &shiftp]);
        let all_ones = maskp.is_immediate_value(bitmask(instbits as u32));

        let mut dst = TEMP_REG2;
        let mut optimized = false;

        if srcp.is_immediate() && maskp.is_immediate() && shiftp.is_immediate() && all_ones {
            dst = dstp.select_register(TEMP_REG2);
            e.mov_imm(sz, dst, rotl_sized(srcp.immediate(), shiftp.immediate(), sz));
            optimized = true;
        } else if maskp.is_immediate() && shiftp.is_immediate() && all_ones {
            // The insert overwrites the whole value; rotate straight into
            // the output.
            dst = dstp.select_register(TEMP_REG2);
            e.mov_reg_param(sz, dst, &srcp);

            let shift = (shiftp.immediate() as i64).wrapping_neg() as u64 & (instbits - 1);
            if shift != 0 {
                e.ror_imm(sz, dst, dst, shift as u32);
            }
            optimized = true;
        } else if maskp.is_immediate() && shiftp.is_immediate() {
            let mask = maskp.immediate();
            let pop = mask.count_ones();
            let lz = mask.leading_zeros() & (instbits as u32 - 1);
            let invlamask = !(mask << lz) & bitmask(instbits as u32);
            let is_right_aligned = mask & (mask + 1) == 0;
            let is_contiguous = invlamask & (invlamask + 1) == 0;
            let s = (shiftp.immediate() & (instbits - 1)) as u32;

            if is_right_aligned || is_contiguous {
                dst = if can_use {
                    dstp.select_register(SCRATCH_REG1)
                } else {
                    SCRATCH_REG1
                };
                e.mov_reg_param(sz, dst, &dstp);

                let (rot, lsb) = if is_right_aligned {
                    ((instbits as u32 - s) & (instbits as u32 - 1), 0)
                } else {
                    (
                        (s + pop + lz).wrapping_neg() & (instbits as u32 - 1),
                        instbits as u32 - pop - lz,
                    )
                };

                let src = SCRATCH_REG2;
                if srcp.is_immediate() && rot > 0 {
                    e.mov_imm(sz, src, rotr_sized(srcp.immediate(), rot as u64, sz));
                } else {
                    e.mov_reg_param(sz, src, &srcp);
                    if rot > 0 {
                        e.ror_imm(sz, src, src, rot);
                    }
                }

                e.bfi(sz, dst, src, lsb, pop);
                optimized = true;
            } else if srcp.is_immediate() {
                dst = dstp.select_register(TEMP_REG2);
                e.mov_reg_param(sz, dst, &dstp);

                // Clear the masked field, then OR in the rotated constant.
                if is_valid_bitmask(!mask & bitmask(instbits as u32), sz) {
                    e.and_imm(sz, dst, dst, !mask & bitmask(instbits as u32));
                } else {
                    e.mov_imm(sz, SCRATCH_REG1, !mask);
                    e.and_(sz, dst, dst, SCRATCH_REG1);
                }

                let result = rotl_sized(srcp.immediate(), s as u64, sz) & mask;
                if result != 0 {
                    if is_valid_bitmask(result, sz) {
                        e.orr_imm(sz, dst, dst, result);
                    } else {
                        e.mov_imm(sz, SCRATCH_REG1, result);
                        e.orr(sz, dst, dst, SCRATCH_REG1);
                    }
                }

                optimized = true;
            }
        }

        if !optimized {
            dst = if can_use { dstp.select_register(TEMP_REG2) } else { TEMP_REG2 };
            e.mov_reg_param(sz, dst, &dstp);

            let src = srcp.select_register(TEMP_REG1);
            e.mov_reg_param(sz, src, &srcp);

            if shiftp.is_immediate() {
                let shift = (shiftp.immediate() as i64).wrapping_neg() as u64 & (instbits - 1);
                if shift != 0 {
                    e.ror_imm(sz, SCRATCH_REG1, src, shift as u32);
                } else {
                    e.mov(sz, SCRATCH_REG1, src);
                }
            } else {
                let shift = shiftp.select_register(SCRATCH_REG2);
                e.mov_reg_param(sz, shift, &shiftp);

                e.movz(sz, SCRATCH_REG1, instbits as u32, 0);
                e.and_imm(sz, FUNC_SCRATCH_REG, shift, instbits - 1);
                e.sub(sz, FUNC_SCRATCH_REG, SCRATCH_REG1, FUNC_SCRATCH_REG);
                e.rorv(sz, SCRATCH_REG1, src, FUNC_SCRATCH_REG);
            }

            let mask = maskp.select_register(SCRATCH_REG2);
            e.mov_reg_param(sz, mask, &maskp);

            e.bic(sz, dst, dst, mask);
            e.and_(sz, SCRATCH_REG1, SCRATCH_REG1, mask);
            e.orr(sz, dst, dst, SCRATCH_REG1);
        }

        e.mov_param_reg(sz, &dstp, dst);

        if inst.flag_mask() != 0 {
            e.tst(sz, dst, dst);
            e.carry = CarryState::Poison;
        }
    }

    // ── Add, subtract, compare ──────────────────────────────────────────

    pub(crate) fn op_add(&mut self, e: &mut Emitter, inst: &Inst, carry_in: bool) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_V | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let mut src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let mut src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let flags = inst.flag_mask() != 0;

        let output = dstp.select_register(TEMP_REG3);

        if carry_in {
            e.load_carry(false);
        }

        // Addition commutes; canonicalize an interesting immediate into the
        // second slot.
        if src1p.is_immediate() && !src2p.is_immediate() {
            std::mem::swap(&mut src1p, &mut src2p);
        }

        let adc = carry_in;
        let emit3 = |e: &mut Emitter, d: u8, n: u8, m: u8| match (adc, flags) {
            (true, true) => e.adcs(sz, d, n, m),
            (true, false) => e.adc(sz, d, n, m),
            (false, true) => e.adds(sz, d, n, m),
            (false, false) => e.add(sz, d, n, m),
        };

        if src1p.is_immediate_value(0) && src2p.is_immediate_value(0) {
            if carry_in {
                emit3(e, output, 31, 31);
                e.mov_param_reg(sz, &dstp, output);
            } else {
                e.mov_param_reg(sz, &dstp, 31);
                emit3(e, 31, 31, 31);
            }
        } else if src1p.is_immediate_value(0)
            && !carry_in
            && src2p.is_immediate()
            && is_valid_addsub(src2p.immediate())
        {
            e.mov_zero(sz, output);
            e.addsub_imm(sz, false, flags, output, output, src2p.immediate());
            e.mov_param_reg(sz, &dstp, output);
        } else if src1p.is_immediate_value(0)
            && !carry_in
            && src2p.is_immediate()
            && is_valid_uimm(src2p.immediate(), 24)
        {
            let val = src2p.immediate();
            e.mov_imm(sz, output, val & bitmask(12));
            e.addsub_imm(sz, false, flags, output, output, val & (bitmask(12) << 12));
            e.mov_param_reg(sz, &dstp, output);
        } else if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
            let nonzero = if src1p.is_immediate_value(0) { &src2p } else { &src1p };
            let src = nonzero.select_register(output);

            e.mov_reg_param(sz, src, nonzero);
            emit3(e, output, src, 31);
            e.mov_param_reg(sz, &dstp, output);
        } else if !carry_in && src2p.is_immediate() && is_valid_addsub(src2p.immediate()) {
            let src = src1p.select_register(output);

            e.mov_reg_param(sz, src, &src1p);
            e.addsub_imm(sz, false, flags, output, src, src2p.immediate());
            e.mov_param_reg(sz, &dstp, output);
        } else if !carry_in && !flags && src2p.is_immediate() && is_valid_uimm(src2p.immediate(), 24)
        {
            let val = src2p.immediate();
            let src = src1p.select_register(output);

            e.mov_reg_param(sz, src, &src1p);
            e.addsub_imm(sz, false, false, output, src, val & bitmask(12));
            e.addsub_imm(sz, false, false, output, output, val & (bitmask(12) << 12));
            e.mov_param_reg(sz, &dstp, output);
        } else {
            let src1 = src1p.select_register(TEMP_REG1);
            let src2 = src2p.select_register(TEMP_REG2);

            e.mov_reg_param(sz, src1, &src1p);
            e.mov_reg_param(sz, src2, &src2p);
            emit3(e, output, src1, src2);
            e.mov_param_reg(sz, &dstp, output);
        }

        if flags {
            e.store_carry(false);
        }
    }

    pub(crate) fn op_sub(&mut self, e: &mut Emitter, inst: &Inst, carry_in: bool) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_V | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let flags = inst.flag_mask() != 0;

        if carry_in {
            e.load_carry(true);
        }

        let output = dstp.select_register(TEMP_REG3);

        let sbc = carry_in;
        let emit3 = |e: &mut Emitter, d: u8, n: u8, m: u8| match (sbc, flags) {
            (true, true) => e.sbcs(sz, d, n, m),
            (true, false) => e.sbc(sz, d, n, m),
            (false, true) => e.subs(sz, d, n, m),
            (false, false) => e.sub(sz, d, n, m),
        };

        if src2p.is_immediate_value(0) {
            if src1p.is_immediate_value(0) {
                if carry_in {
                    emit3(e, output, 31, 31);
                    e.mov_param_reg(sz, &dstp, output);
                } else {
                    e.mov_param_reg(sz, &dstp, 31);
                    emit3(e, 31, 31, 31);
                }
            } else {
                let src = src1p.select_register(output);

                e.mov_reg_param(sz, src, &src1p);
                if carry_in {
                    emit3(e, output, src, 31);
                    e.mov_param_reg(sz, &dstp, output);
                } else {
                    e.mov_param_reg(sz, &dstp, src);
                    emit3(e, 31, src, 31);
                }
            }
        } else if !carry_in && src2p.is_immediate() && is_valid_addsub(src2p.immediate()) {
            let src = src1p.select_register(output);

            e.mov_reg_param(sz, src, &src1p);
            e.addsub_imm(sz, true, flags, output, src, src2p.immediate());
            e.mov_param_reg(sz, &dstp, output);
        } else if !carry_in
            && (!flags || src1p.is_immediate_value(0))
            && src2p.is_immediate()
            && is_valid_uimm(src2p.immediate(), 24)
        {
            let val = src2p.immediate();
            let src = src1p.select_register(output);

            e.mov_reg_param(sz, src, &src1p);
            e.addsub_imm(sz, true, flags, output, src, val & bitmask(12));
            e.addsub_imm(sz, true, flags, output, output, val & (bitmask(12) << 12));
            e.mov_param_reg(sz, &dstp, output);
        } else {
            let src1 = src1p.select_register(TEMP_REG1);
            let src2 = src2p.select_register(TEMP_REG2);

            e.mov_reg_param(sz, src1, &src1p);
            e.mov_reg_param(sz, src2, &src2p);
            emit3(e, output, src1, src2);
            e.mov_param_reg(sz, &dstp, output);
        }

        if flags {
            e.store_carry(true);
        }
    }

    pub(crate) fn op_cmp(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_V | FLAG_Z | FLAG_S);

        let src1p = be_param(inst.param(0), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let sz = inst.size();

        let src1 = src1p.select_register(TEMP_REG1);
        e.mov_reg_param(sz, src1, &src1p);

        if src2p.is_immediate() && is_valid_addsub(src2p.immediate()) {
            if src2p.is_immediate_value(0) {
                e.cmp(sz, src1, 31);
            } else {
                e.cmp_imm(sz, src1, src2p.immediate());
            }
        } else {
            let src2 = src2p.select_register(TEMP_REG2);
            e.mov_reg_param(sz, src2, &src2p);
            e.cmp(sz, src1, src2);
        }

        e.store_carry(true);
    }

    // ── Multiply and divide ─────────────────────────────────────────────

    /// Compute the full product into `lo`/`hi` (`TEMP_REG3`/`TEMP_REG2`),
    /// handling the zero shortcut.
    fn emit_mul_product(
        &self,
        e: &mut Emitter,
        inst: &Inst,
        src1p: &BeParam,
        src2p: &BeParam,
        signed: bool,
        need_hi: bool,
    ) {
        let sz = inst.size();
        let (lo, hi) = (TEMP_REG3, TEMP_REG2);

        if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
            e.mov_zero(8, lo);
            if need_hi {
                e.mov_zero(8, hi);
            }
            return;
        }

        let src1 = src1p.select_register(TEMP_REG1);
        let src2 = src2p.select_register(TEMP_REG2);
        e.mov_reg_param(sz, src1, src1p);
        e.mov_reg_param(sz, src2, src2p);

        if sz == 8 {
            e.mul(8, lo, src1, src2);
            if need_hi {
                if signed {
                    e.smulh(hi, src1, src2);
                } else {
                    e.umulh(hi, src1, src2);
                }
            }
        } else {
            if signed {
                e.smull(lo, src1, src2);
            } else {
                e.umull(lo, src1, src2);
            }
            if need_hi {
                e.lsr_imm(8, hi, lo, 32);
            }
        }
    }

    /// Z/S/V for the widening multiplies: zero across both halves, sign from
    /// the top of the high half, overflow when the high half is significant.
    fn emit_mul_flags(&self, e: &mut Emitter, inst: &Inst, signed: bool) {
        let sz = inst.size();
        let (lo, hi) = (TEMP_REG3, TEMP_REG2);

        e.mrs_nzcv(SCRATCH_REG1);

        e.tst(8, lo, lo);
        e.cset(8, TEMP_REG1, ArmCond::Eq);
        e.tst(8, hi, hi);
        e.cset(8, SCRATCH_REG2, ArmCond::Eq);
        e.and_(8, TEMP_REG1, TEMP_REG1, SCRATCH_REG2);
        e.bfi(8, SCRATCH_REG1, TEMP_REG1, 30, 1); // zero flag

        if signed {
            // Overflow when the high half is not the sign extension of the
            // low half.
            if sz == 4 {
                e.sxtw(TEMP_REG1, lo);
                e.cmp(8, TEMP_REG1, lo);
            } else {
                e.asr_imm(8, TEMP_REG1, lo, 63);
                e.cmp(8, TEMP_REG1, hi);
            }
            e.cset(8, TEMP_REG1, ArmCond::Ne);
        } else {
            e.tst(8, hi, hi);
            e.cset(8, TEMP_REG1, ArmCond::Ne);
        }
        e.bfi(8, SCRATCH_REG1, TEMP_REG1, 28, 1); // overflow flag

        e.lsr_imm(8, TEMP_REG1, hi, sz * 8 - 1);
        e.bfi(8, SCRATCH_REG1, TEMP_REG1, 31, 1); // sign flag

        e.msr_nzcv(SCRATCH_REG1);

        e.carry = CarryState::Poison;
    }

    pub(crate) fn op_mulu(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_V | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let edstp = be_param(inst.param(1), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(3), PTYPE_MRI, self.state);
        let compute_hi = dstp != edstp;

        self.emit_mul_product(e, inst, &src1p, &src2p, false, true);

        e.mov_param_reg(inst.size(), &dstp, TEMP_REG3);
        if compute_hi {
            e.mov_param_reg(inst.size(), &edstp, TEMP_REG2);
        }

        if inst.flag_mask() != 0 {
            self.emit_mul_flags(e, inst, false);
        }
    }

    pub(crate) fn op_muls(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_V | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let edstp = be_param(inst.param(1), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(3), PTYPE_MRI, self.state);
        let compute_hi = dstp != edstp;

        self.emit_mul_product(e, inst, &src1p, &src2p, true, true);

        e.mov_param_reg(inst.size(), &dstp, TEMP_REG3);
        if compute_hi {
            e.mov_param_reg(inst.size(), &edstp, TEMP_REG2);
        }

        if inst.flag_mask() != 0 {
            self.emit_mul_flags(e, inst, true);
        }
    }

    /// Low-half-only multiply: Z and S come from the low half, V records
    /// whether the discarded high half was significant.
    fn op_mul_lw(&mut self, e: &mut Emitter, inst: &Inst, signed: bool) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_V | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let (lo, hi) = (TEMP_REG3, TEMP_REG2);

        // The signed form gets overflow from sign-extension of the low half
        // at size 4, so the high half is only needed for size 8.
        let need_hi = inst.flag_mask() != 0 && (!signed || sz == 8);
        self.emit_mul_product(e, inst, &src1p, &src2p, signed, need_hi);

        e.mov_param_reg(sz, &dstp, lo);

        if inst.flag_mask() != 0 {
            e.mrs_nzcv(SCRATCH_REG1);

            e.tst(sz, lo, lo);
            e.cset(8, TEMP_REG1, ArmCond::Eq);
            e.bfi(8, SCRATCH_REG1, TEMP_REG1, 30, 1); // zero flag

            if signed {
                if sz == 4 {
                    e.sxtw(TEMP_REG1, lo);
                    e.cmp(8, TEMP_REG1, lo);
                } else {
                    e.asr_imm(8, TEMP_REG1, lo, 63);
                    e.cmp(8, TEMP_REG1, hi);
                }
                e.cset(8, TEMP_REG1, ArmCond::Ne);
            } else {
                e.cmp(8, hi, 31);
                e.cset(8, TEMP_REG1, ArmCond::Ne);
            }
            e.bfi(8, SCRATCH_REG1, TEMP_REG1, 28, 1); // overflow flag

            e.lsr_imm(8, TEMP_REG1, lo, sz * 8 - 1);
            e.bfi(8, SCRATCH_REG1, TEMP_REG1, 31, 1); // sign flag

            e.msr_nzcv(SCRATCH_REG1);

            e.carry = CarryState::Poison;
        }
    }

    pub(crate) fn op_mululw(&mut self, e: &mut Emitter, inst: &Inst) {
        self.op_mul_lw(e, inst, false);
    }

    pub(crate) fn op_mulslw(&mut self, e: &mut Emitter, inst: &Inst) {
        self.op_mul_lw(e, inst, true);
    }

    pub(crate) fn op_div(&mut self, e: &mut Emitter, inst: &Inst, signed: bool) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_V | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let edstp = be_param(inst.param(1), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(3), PTYPE_MRI, self.state);
        let sz = inst.size();
        let compute_rem = dstp != edstp;

        if !src2p.is_immediate_value(0) {
            let skip_zero = e.new_label();
            let skip = e.new_label();

            let (temp, temp2, temp3) = (TEMP_REG1, TEMP_REG2, TEMP_REG3);

            e.mov_reg_param(sz, temp2, &src2p);
            e.cbz(sz, temp2, skip_zero);

            e.mov_reg_param(sz, temp, &src1p);

            if signed {
                e.sdiv(sz, temp3, temp, temp2);
            } else {
                e.udiv(sz, temp3, temp, temp2);
            }

            e.mov_param_reg(sz, &dstp, temp3);

            if compute_rem {
                e.msub(sz, temp2, temp3, temp2, temp);
                e.mov_param_reg(sz, &edstp, temp2);
            }

            if inst.flag_mask() != 0 {
                e.tst(sz, temp3, temp3);
            }

            e.b(skip);

            // Divide by zero: set V, leave the destinations untouched.
            e.bind(skip_zero);
            e.mov_imm(8, SCRATCH_REG1, 1 << 28);
            e.msr_nzcv(SCRATCH_REG1);

            e.bind(skip);
        } else {
            e.mov_imm(8, SCRATCH_REG1, 1 << 28);
            e.msr_nzcv(SCRATCH_REG1);
        }

        e.carry = CarryState::Poison;
    }

    // ── Bitwise operations ──────────────────────────────────────────────

    pub(crate) fn op_and(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let mut src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let mut src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let flags = inst.flag_mask() != 0;
        let ones = bitmask(sz * 8);

        if src1p.is_immediate() || (dstp.is_int_register() && dstp == src2p) {
            std::mem::swap(&mut src1p, &mut src2p);
        }

        let dst = dstp.select_register(TEMP_REG3);
        let src1 = src1p.select_register(dst);

        if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
            if flags {
                // The immediate is irrelevant; the result is zero either way.
                e.ands_imm(sz, dst, 31, 1);
            } else {
                e.mov_zero(sz, dst);
            }
        } else if src1p.is_immediate() && src2p.is_immediate() {
            e.mov_imm(sz, dst, src1p.immediate() & src2p.immediate());

            if flags {
                e.tst(sz, dst, dst);
            }
        } else if src2p.is_immediate() && is_valid_bitmask(src2p.immediate(), sz) {
            e.mov_reg_param(sz, src1, &src1p);

            if flags {
                e.ands_imm(sz, dst, src1, src2p.immediate());
            } else {
                e.and_imm(sz, dst, src1, src2p.immediate());
            }
        } else if sz == 8
            && src2p.is_immediate()
            && src2p.immediate() <= u32::MAX as u64
            && is_valid_bitmask(src2p.immediate(), 4)
            && (!flags || src2p.immediate() >> 31 == 0)
        {
            // The 32-bit form clears the upper half for free.
            e.mov_reg_param(sz, src1, &src1p);

            if flags {
                e.ands_imm(4, dst, src1, src2p.immediate());
            } else {
                e.and_imm(4, dst, src1, src2p.immediate());
            }
        } else if src2p.is_immediate_value(ones) || src1p == src2p {
            if dstp == src1p && !flags && (sz == 8 || (dstp.is_memory() && !dstp.is_cold_register()))
            {
                return;
            }

            e.mov_reg_param(sz, src1, &src1p);

            if dst != src1 || (sz == 4 && dstp == src1p && dstp.is_int_register()) {
                if flags {
                    e.ands(sz, dst, src1, src1);
                } else {
                    e.and_(sz, dst, src1, src1);
                }
            } else if flags {
                e.tst(sz, dst, dst);
            }
        } else {
            let src2 = src2p.select_register(TEMP_REG1);
            e.mov_reg_param(sz, src1, &src1p);
            e.mov_reg_param(sz, src2, &src2p);

            if flags {
                e.ands(sz, dst, src1, src2);
            } else {
                e.and_(sz, dst, src1, src2);
            }
        }

        e.mov_param_reg(sz, &dstp, dst);

        if flags {
            e.carry = CarryState::Poison;
        }
    }

    pub(crate) fn op_test(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_Z | FLAG_S);

        let src1p = be_param(inst.param(0), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let sz = inst.size();
        let ones = bitmask(sz * 8);

        let src1 = src1p.select_register(TEMP_REG1);
        let src2 = src2p.select_register(TEMP_REG2);

        if src1p.is_immediate_value(0) || src2p.is_immediate_value(0) {
            e.tst_zero(sz);
        } else if src2p.is_immediate_value(ones) {
            e.mov_reg_param(sz, src1, &src1p);
            e.tst(sz, src1, src1);
        } else if src1p.is_immediate_value(ones) {
            e.mov_reg_param(sz, src2, &src2p);
            e.tst(sz, src2, src2);
        } else if src2p.is_immediate() && is_valid_bitmask(src2p.immediate(), sz) {
            e.mov_reg_param(sz, src1, &src1p);
            e.tst_imm(sz, src1, src2p.immediate());
        } else if src1p.is_immediate() && is_valid_bitmask(src1p.immediate(), sz) {
            e.mov_reg_param(sz, src2, &src2p);
            e.tst_imm(sz, src2, src1p.immediate());
        } else {
            e.mov_reg_param(sz, src1, &src1p);
            e.mov_reg_param(sz, src2, &src2p);
            e.tst(sz, src1, src2);
        }

        e.carry = CarryState::Poison;
    }

    pub(crate) fn op_or(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let mut src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let mut src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let flags = inst.flag_mask() != 0;
        let ones = bitmask(sz * 8);

        if src1p.is_immediate() || (dstp.is_int_register() && dstp == src2p) {
            std::mem::swap(&mut src1p, &mut src2p);
        }

        let dst = dstp.select_register(TEMP_REG3);
        let src1 = src1p.select_register(dst);

        if src1p.is_immediate() && src2p.is_immediate() {
            e.mov_imm(sz, dst, src1p.immediate() | src2p.immediate());
        } else if src2p.is_immediate_value(ones) {
            e.mov_imm(sz, dst, ones);
        } else if src2p.is_immediate_value(0) || src1p == src2p {
            if dstp == src1p && !flags && (sz == 8 || (dstp.is_memory() && !dstp.is_cold_register()))
            {
                return;
            }

            e.mov_reg_param(sz, src1, &src1p);

            if dst != src1 || (sz == 4 && dstp == src1p && dstp.is_int_register()) {
                e.mov(sz, dst, src1);
            }
        } else if src2p.is_immediate() && is_valid_bitmask(src2p.immediate(), sz) {
            e.mov_reg_param(sz, src1, &src1p);
            e.orr_imm(sz, dst, src1, src2p.immediate());
        } else {
            let src2 = src2p.select_register(TEMP_REG1);
            e.mov_reg_param(sz, src1, &src1p);
            e.mov_reg_param(sz, src2, &src2p);

            e.orr(sz, dst, src1, src2);
        }

        e.mov_param_reg(sz, &dstp, dst);

        if flags {
            e.tst(sz, dst, dst);
            e.carry = CarryState::Poison;
        }
    }

    pub(crate) fn op_xor(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let mut src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let mut src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let flags = inst.flag_mask() != 0;
        let ones = bitmask(sz * 8);

        if src1p.is_immediate() || (dstp.is_int_register() && dstp == src2p) {
            std::mem::swap(&mut src1p, &mut src2p);
        }

        let dst = dstp.select_register(TEMP_REG3);
        let src1 = src1p.select_register(dst);

        if src1p.is_immediate() && src2p.is_immediate() {
            e.mov_imm(sz, dst, src1p.immediate() ^ src2p.immediate());
        } else if src2p.is_immediate_value(0) {
            if dstp == src1p && !flags && (sz == 8 || (dstp.is_memory() && !dstp.is_cold_register()))
            {
                return;
            }

            e.mov_reg_param(sz, src1, &src1p);

            if dst != src1 || (sz == 4 && dstp == src1p && dstp.is_int_register()) {
                e.mov(sz, dst, src1);
            }
        } else if src2p.is_immediate_value(ones) {
            e.mov_reg_param(sz, src1, &src1p);
            e.mvn(sz, dst, src1);
        } else if src2p.is_immediate() && is_valid_bitmask(src2p.immediate(), sz) {
            e.mov_reg_param(sz, src1, &src1p);
            e.eor_imm(sz, dst, src1, src2p.immediate());
        } else if src1p == src2p {
            e.mov_zero(sz, dst);
        } else {
            let src2 = src2p.select_register(TEMP_REG1);
            e.mov_reg_param(sz, src1, &src1p);
            e.mov_reg_param(sz, src2, &src2p);

            e.eor(sz, dst, src1, src2);
        }

        e.mov_param_reg(sz, &dstp, dst);

        if flags {
            e.tst(sz, dst, dst);
            e.carry = CarryState::Poison;
        }
    }

    // ── Bit counting and byte swap ──────────────────────────────────────

    pub(crate) fn op_lzcnt(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let sz = inst.size();

        let src = srcp.select_register(TEMP_REG1);
        let dst = dstp.select_register(TEMP_REG2);

        e.mov_reg_param(sz, src, &srcp);
        e.clz(sz, dst, src);
        e.mov_param_reg(sz, &dstp, dst);

        if inst.flag_mask() != 0 {
            e.tst(sz, dst, dst);
            e.carry = CarryState::Poison;
        }
    }

    pub(crate) fn op_tzcnt(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let sz = inst.size();

        let src = srcp.select_register(TEMP_REG1);
        let dst = dstp.select_register(TEMP_REG2);

        e.mov_reg_param(sz, src, &srcp);

        // Count from the tail by reversing first.
        e.rbit(sz, dst, src);
        e.clz(sz, dst, dst);

        e.mov_param_reg(sz, &dstp, dst);

        if inst.flag_mask() != 0 {
            // Z means "no set bit": the count equals the operand width.
            e.eor_imm(sz, TEMP_REG3, dst, sz as u64 * 8);
            e.tst(sz, TEMP_REG3, TEMP_REG3);
            e.carry = CarryState::Poison;
        }
    }

    pub(crate) fn op_bswap(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let sz = inst.size();

        let src = srcp.select_register(TEMP_REG1);
        let dst = dstp.select_register(TEMP_REG1);

        e.mov_reg_param(sz, src, &srcp);
        e.rev(sz, dst, src);
        e.mov_param_reg(sz, &dstp, dst);

        if inst.flag_mask() != 0 {
            e.tst(sz, dst, dst);
            e.carry = CarryState::Poison;
        }
    }

    // ── Shifts and rotates ──────────────────────────────────────────────

    pub(crate) fn op_shift(&mut self, e: &mut Emitter, inst: &Inst, kind: ShiftKind) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let max_bits = sz * 8 - 1;
        let want_carry = inst.flag_mask() & FLAG_C != 0;

        let can_use = can_use_dst_reg(&dstp, &[&src1p, &src2p]);

        let src = src1p.select_register(TEMP_REG1);
        let shift = src2p.select_register(TEMP_REG2);
        let dst = if can_use { dstp.select_register(TEMP_REG3) } else { TEMP_REG3 };

        e.mov_reg_param(sz, src, &src1p);

        if src2p.is_immediate() && is_valid_uimm(src2p.immediate(), if sz == 8 { 6 } else { 5 }) {
            let amount = (src2p.immediate() % (sz as u64 * 8)) as u32;

            match kind {
                ShiftKind::Lsl => e.lsl_imm(sz, dst, src, amount),
                ShiftKind::Lsr => e.lsr_imm(sz, dst, src, amount),
                ShiftKind::Asr => e.asr_imm(sz, dst, src, amount),
                ShiftKind::Ror => e.ror_imm(sz, dst, src, amount),
            }

            if want_carry {
                match kind {
                    ShiftKind::Lsl => e.calculate_carry_shift_left_imm(sz, src, amount, max_bits),
                    _ => e.calculate_carry_shift_right_imm(sz, src, amount),
                }
            }
        } else {
            e.mov_reg_param(sz, shift, &src2p);

            e.and_imm(sz, FUNC_SCRATCH_REG, shift, sz as u64 * 8 - 1);

            match kind {
                ShiftKind::Lsl => e.lslv(sz, dst, src, FUNC_SCRATCH_REG),
                ShiftKind::Lsr => e.lsrv(sz, dst, src, FUNC_SCRATCH_REG),
                ShiftKind::Asr => e.asrv(sz, dst, src, FUNC_SCRATCH_REG),
                ShiftKind::Ror => e.rorv(sz, dst, src, FUNC_SCRATCH_REG),
            }

            if want_carry {
                match kind {
                    ShiftKind::Lsl => {
                        e.calculate_carry_shift_left(sz, src, FUNC_SCRATCH_REG, max_bits)
                    }
                    _ => e.calculate_carry_shift_right(sz, src, FUNC_SCRATCH_REG),
                }
            }
        }

        if inst.flag_mask() != 0 {
            e.tst(sz, dst, dst);
            e.carry = CarryState::Poison;
        }

        // Write back only after the carry calculators consumed the inputs.
        e.mov_param_reg(sz, &dstp, dst);
    }

    pub(crate) fn op_rol(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let bits = sz as u64 * 8;
        let max_bits = sz * 8 - 1;
        let want_carry = inst.flag_mask() & FLAG_C != 0;

        let can_use = can_use_dst_reg(&dstp, &[&src1p, &src2p]);

        let param = src1p.select_register(TEMP_REG1);
        let shift = src2p.select_register(TEMP_REG2);
        let output = if can_use { dstp.select_register(TEMP_REG3) } else { TEMP_REG3 };

        e.mov_reg_param(sz, param, &src1p);

        if src2p.is_immediate() {
            let s = (src2p.immediate() % bits) as u32;
            let s2 = ((bits as u32) - s) % bits as u32;

            if s2 == 0 {
                if output != param {
                    e.mov(sz, output, param);
                }
            } else {
                e.ror_imm(sz, output, param, s2);
            }

            if want_carry {
                e.calculate_carry_shift_left_imm(sz, param, s, max_bits);
            }
        } else {
            e.mov_reg_param(sz, shift, &src2p);

            e.movz(sz, SCRATCH_REG1, bits as u32, 0);
            e.and_imm(sz, FUNC_SCRATCH_REG, shift, max_bits as u64);
            e.sub(sz, SCRATCH_REG1, SCRATCH_REG1, FUNC_SCRATCH_REG);
            e.rorv(sz, output, param, SCRATCH_REG1);

            if want_carry {
                e.calculate_carry_shift_left(sz, param, FUNC_SCRATCH_REG, max_bits);
            }
        }

        if inst.flag_mask() != 0 {
            e.tst(sz, output, output);
            e.carry = CarryState::Poison;
        }

        e.mov_param_reg(sz, &dstp, output);
    }

    pub(crate) fn op_rolc(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let bits = sz * 8;
        let max_bits = bits - 1;

        let can_use = can_use_dst_reg(&dstp, &[&src1p, &src2p]);

        let param1 = src1p.select_register(TEMP_REG3);
        let output = if can_use { dstp.select_register(TEMP_REG1) } else { TEMP_REG1 };
        let carry = SCRATCH_REG2;

        e.mov_reg_param(sz, param1, &src1p);

        // result = (param << shift) | (carry << (shift - 1)) | (param >> (bits + 1 - shift))

        if src2p.is_immediate() {
            let shift = (src2p.immediate() % bits as u64) as u32;

            if shift != 0 {
                e.ubfx(sz, carry, param1, bits - shift, 1);
                if shift > 1 {
                    e.ubfx(sz, output, param1, bits - shift + 1, shift - 1);
                }
                e.bfi(8, output, FLAGS_REG, shift - 1, 1);
                e.bfi(sz, output, param1, shift, bits - shift);
                e.bfi(8, FLAGS_REG, carry, 0, 1);
            } else {
                e.mov(sz, output, param1);
            }

            e.calculate_carry_shift_left_imm(sz, param1, shift, max_bits);
        } else {
            let shift = src2p.select_register(TEMP_REG2);

            e.mov_reg_param(sz, shift, &src2p);

            e.and_imm(sz, FUNC_SCRATCH_REG, shift, max_bits as u64);

            e.lslv(sz, output, param1, FUNC_SCRATCH_REG);

            let skip = e.new_label();
            let zero_shift = e.new_label();
            e.cbz(sz, FUNC_SCRATCH_REG, zero_shift);

            e.get_carry(carry, false);

            e.addsub_imm(sz, true, false, SCRATCH_REG1, FUNC_SCRATCH_REG, 1);
            e.cbz(sz, SCRATCH_REG1, skip);

            // Slide the carry into position and recover the wrapped bits.
            e.lslv(sz, carry, carry, SCRATCH_REG1);

            e.movz(sz, SCRATCH_REG1, max_bits + 2, 0);
            e.sub(sz, SCRATCH_REG1, SCRATCH_REG1, FUNC_SCRATCH_REG);
            e.lsrv(sz, SCRATCH_REG1, param1, SCRATCH_REG1);
            e.orr(sz, output, output, SCRATCH_REG1);

            e.bind(skip);

            e.orr(sz, output, output, carry);

            e.bind(zero_shift);

            e.calculate_carry_shift_left(sz, param1, FUNC_SCRATCH_REG, max_bits);
        }

        if inst.flag_mask() != 0 {
            e.tst(sz, output, output);
        }

        e.mov_param_reg(sz, &dstp, output);

        e.carry = CarryState::Poison;
    }

    pub(crate) fn op_rorc(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_Z | FLAG_S);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let src1p = be_param(inst.param(1), PTYPE_MRI, self.state);
        let src2p = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();
        let bits = sz * 8;
        let max_bits = bits - 1;

        let can_use = can_use_dst_reg(&dstp, &[&src1p, &src2p]);

        let param1 = src1p.select_register(TEMP_REG3);
        let output = if can_use { dstp.select_register(TEMP_REG1) } else { TEMP_REG1 };
        let carry = SCRATCH_REG2;

        e.mov_reg_param(sz, param1, &src1p);

        // result = (param >> shift) | (carry << (bits - shift)) | (param << (bits + 1 - shift))

        if src2p.is_immediate() {
            let shift = (src2p.immediate() % bits as u64) as u32;

            if shift != 0 {
                e.ubfx(sz, carry, param1, shift - 1, 1);
                e.ubfx(sz, output, param1, shift, bits - shift);
                e.bfi(8, output, FLAGS_REG, bits - shift, 1);
                if shift > 1 {
                    e.bfi(sz, output, param1, bits - shift + 1, shift - 1);
                }
                e.bfi(8, FLAGS_REG, carry, 0, 1);
            } else {
                e.mov(sz, output, param1);
            }

            e.calculate_carry_shift_right_imm(sz, param1, shift);
        } else {
            let shift = src2p.select_register(TEMP_REG2);

            e.mov_reg_param(sz, shift, &src2p);

            e.and_imm(sz, FUNC_SCRATCH_REG, shift, max_bits as u64);

            e.lsrv(sz, output, param1, shift);

            let skip = e.new_label();
            let zero_shift = e.new_label();
            e.cbz(sz, FUNC_SCRATCH_REG, zero_shift);

            e.get_carry(carry, false);
            e.lsl_imm(sz, carry, carry, max_bits);

            e.addsub_imm(sz, true, false, SCRATCH_REG1, FUNC_SCRATCH_REG, 1);
            e.cbz(sz, SCRATCH_REG1, skip);

            e.lsrv(sz, carry, carry, SCRATCH_REG1);

            e.movz(sz, SCRATCH_REG1, max_bits + 2, 0);
            e.sub(sz, SCRATCH_REG1, SCRATCH_REG1, FUNC_SCRATCH_REG);
            e.lslv(sz, SCRATCH_REG1, param1, SCRATCH_REG1);
            e.orr(sz, output, output, SCRATCH_REG1);

            e.bind(skip);

            e.orr(sz, output, output, carry);

            e.bind(zero_shift);

            e.calculate_carry_shift_right(sz, param1, FUNC_SCRATCH_REG);
        }

        if inst.flag_mask() != 0 {
            e.tst(sz, output, output);
        }

        e.mov_param_reg(sz, &dstp, output);

        e.carry = CarryState::Poison;
    }
}
