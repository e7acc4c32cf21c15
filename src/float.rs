//! Scalar float opcode generators.
//!
//! Operands move to vector registers at the instruction width (s or d) and
//! delegate to the native scalar instructions. Only `FCMP` touches flags.

use crate::backend::{Backend, assert_any_condition, assert_flags, assert_no_condition, assert_no_flags};
use crate::emit::{
    Emitter, LdSt, TEMP_REG1, TEMPF_REG1, TEMPF_REG2, TEMPF_REG3, cond_for, not_cond_for,
};
use crate::flags::CarryState;
use crate::param::{PTYPE_M, PTYPE_MF, PTYPE_MR, PTYPE_MRI, be_param};
use crate::uml::{Cond, FLAG_C, FLAG_U, FLAG_Z, Inst};

/// Three-operand float operations.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FpAlu3 {
    Add,
    Sub,
    Mul,
    Div,
}

/// Two-operand float operations.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FpAlu2 {
    Neg,
    Abs,
    Sqrt,
    Recip,
    Rsqrt,
}

impl Backend {
    pub(crate) fn op_fload(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let basep = be_param(inst.param(1), PTYPE_M, self.state);
        let indp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let sz = inst.size();

        let dstreg = dstp.select_float_register(TEMPF_REG1);
        let basereg = TEMP_REG1;

        e.mov_imm(8, basereg, basep.memory());

        if indp.is_immediate() {
            e.ldst_imm(
                LdSt::ldr_f(sz),
                dstreg,
                basereg,
                indp.immediate() as i64 * sz as i64,
            );
        } else {
            let indreg = crate::emit::TEMP_REG2;
            e.mov_reg_param(4, indreg, &indp);
            e.ldst_regoff_uxtw(LdSt::ldr_f(sz), dstreg, basereg, indreg, true);
        }

        e.mov_float_param_reg(sz, &dstp, dstreg);
    }

    pub(crate) fn op_fstore(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let basep = be_param(inst.param(0), PTYPE_M, self.state);
        let indp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let srcp = be_param(inst.param(2), PTYPE_MF, self.state);
        let sz = inst.size();

        let srcreg = srcp.select_float_register(TEMPF_REG1);
        let basereg = TEMP_REG1;

        e.mov_imm(8, basereg, basep.memory());
        e.mov_float_reg_param(sz, srcreg, &srcp);

        if indp.is_immediate() {
            e.ldst_imm(
                LdSt::str_f(sz),
                srcreg,
                basereg,
                indp.immediate() as i64 * sz as i64,
            );
        } else {
            let indreg = crate::emit::TEMP_REG2;
            e.mov_reg_param(4, indreg, &indp);
            e.ldst_regoff_uxtw(LdSt::str_f(sz), srcreg, basereg, indreg, true);
        }
    }

    pub(crate) fn op_fmov(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_any_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MF, self.state);
        let sz = inst.size();

        // A conditional float select beats a branch when both sides are in
        // vector registers and the needed flags are native.
        let mut usesel = dstp.is_float_register() && srcp.is_float_register();
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
            let dstreg = dstp.select_float_register(TEMPF_REG1);
            let srcreg = srcp.select_float_register(TEMPF_REG2);

            e.mov_float_reg_param(sz, dstreg, &dstp);
            e.mov_float_reg_param(sz, srcreg, &srcp);

            let cond = inst.condition();
            let select_cond = match cond {
                Cond::C | Cond::NC if e.carry == CarryState::Canonical => not_cond_for(cond),
                Cond::C | Cond::NC => cond_for(cond),
                Cond::A | Cond::BE => {
                    e.load_carry(true);
                    cond_for(cond)
                }
                _ => cond_for(cond),
            };

            e.fcsel(sz, dstreg, srcreg, dstreg, select_cond);

            e.mov_float_param_reg(sz, &dstp, dstreg);
        } else {
            let skip = e.emit_skip(inst.condition());

            e.mov_float_param_param(sz, &dstp, &srcp);

            if let Some(skip) = skip {
                e.bind(skip);
            }
        }
    }

    pub(crate) fn op_ftoint(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MF, self.state);
        let int_sz = inst.param(2).size().bytes();
        assert!(int_sz == 4 || int_sz == 8);
        let round = inst.param(3).rounding();

        let dstreg = dstp.select_register(TEMP_REG1);
        let srcreg = srcp.select_float_register(TEMPF_REG1);

        if !srcp.is_float_register() {
            e.mov_float_reg_param(inst.size(), srcreg, &srcp);
        }

        e.fcvt_int(round, int_sz, inst.size(), dstreg, srcreg);

        e.mov_param_reg(int_sz, &dstp, dstreg);
    }

    pub(crate) fn op_ffrint(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let int_sz = inst.param(2).size().bytes();
        assert!(int_sz == 4 || int_sz == 8);

        let dstreg = dstp.select_float_register(TEMPF_REG1);
        let srcreg = srcp.select_register(TEMP_REG1);

        if !srcp.is_int_register() {
            e.mov_reg_param(int_sz, srcreg, &srcp);
        }

        e.scvtf(inst.size(), dstreg, int_sz, srcreg);

        if !dstp.is_float_register() {
            e.mov_float_param_reg(inst.size(), &dstp, dstreg);
        }
    }

    pub(crate) fn op_ffrflt(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MF, self.state);
        let src_sz = inst.param(2).size().bytes();
        assert_ne!(src_sz, inst.size(), "FFRFLT source and destination widths must differ");

        let dstreg = dstp.select_float_register(TEMPF_REG1);
        let srcreg = srcp.select_float_register(TEMPF_REG2);

        if !srcp.is_float_register() {
            e.mov_float_reg_param(src_sz, srcreg, &srcp);
        }

        e.fcvt(inst.size(), dstreg, src_sz, srcreg);

        if !dstp.is_float_register() {
            e.mov_float_param_reg(inst.size(), &dstp, dstreg);
        }
    }

    /// Round to single precision and back, collapsing the extra bits a
    /// double carries.
    pub(crate) fn op_frnds(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MF, self.state);

        let dstreg = dstp.select_float_register(TEMPF_REG2);
        let srcreg = srcp.select_float_register(TEMPF_REG1);

        if !srcp.is_float_register() {
            e.mov_float_reg_param(inst.size(), srcreg, &srcp);
        }

        e.fcvt(4, dstreg, 8, srcreg);
        e.fcvt(8, dstreg, 4, dstreg);

        if !dstp.is_float_register() {
            e.mov_float_param_reg(inst.size(), &dstp, dstreg);
        }
    }

    pub(crate) fn op_fcmp(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_flags(inst, FLAG_C | FLAG_Z | FLAG_U);

        let src1p = be_param(inst.param(0), PTYPE_MF, self.state);
        let src2p = be_param(inst.param(1), PTYPE_MF, self.state);
        let sz = inst.size();

        let srcreg1 = src1p.select_float_register(TEMPF_REG1);
        let srcreg2 = src2p.select_float_register(TEMPF_REG2);

        if !src1p.is_float_register() {
            e.mov_float_reg_param(sz, srcreg1, &src1p);
        }
        if !src2p.is_float_register() {
            e.mov_float_reg_param(sz, srcreg2, &src2p);
        }

        e.fcmp(sz, srcreg1, srcreg2);

        e.store_carry(true);
        e.store_unordered();
    }

    pub(crate) fn op_fp_alu3(&mut self, e: &mut Emitter, inst: &Inst, kind: FpAlu3) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let src1p = be_param(inst.param(1), PTYPE_MF, self.state);
        let src2p = be_param(inst.param(2), PTYPE_MF, self.state);
        let sz = inst.size();

        let dstreg = dstp.select_float_register(TEMPF_REG3);
        let srcreg1 = src1p.select_float_register(TEMPF_REG1);
        let srcreg2 = src2p.select_float_register(TEMPF_REG2);

        if !src1p.is_float_register() {
            e.mov_float_reg_param(sz, srcreg1, &src1p);
        }
        if !src2p.is_float_register() {
            e.mov_float_reg_param(sz, srcreg2, &src2p);
        }

        match kind {
            FpAlu3::Add => e.fadd(sz, dstreg, srcreg1, srcreg2),
            FpAlu3::Sub => e.fsub(sz, dstreg, srcreg1, srcreg2),
            FpAlu3::Mul => e.fmul(sz, dstreg, srcreg1, srcreg2),
            FpAlu3::Div => e.fdiv(sz, dstreg, srcreg1, srcreg2),
        }

        if !dstp.is_float_register() {
            e.mov_float_param_reg(sz, &dstp, dstreg);
        }
    }

    pub(crate) fn op_fp_alu2(&mut self, e: &mut Emitter, inst: &Inst, kind: FpAlu2) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MF, self.state);
        let sz = inst.size();

        let dstreg = dstp.select_float_register(TEMPF_REG2);
        let srcreg = srcp.select_float_register(TEMPF_REG1);

        if !srcp.is_float_register() {
            e.mov_float_reg_param(sz, srcreg, &srcp);
        }

        match kind {
            FpAlu2::Neg => e.fneg(sz, dstreg, srcreg),
            FpAlu2::Abs => e.fabs_(sz, dstreg, srcreg),
            FpAlu2::Sqrt => e.fsqrt(sz, dstreg, srcreg),
            FpAlu2::Recip => e.frecpe(sz, dstreg, srcreg),
            FpAlu2::Rsqrt => e.frsqrte(sz, dstreg, srcreg),
        }

        if !dstp.is_float_register() {
            e.mov_float_param_reg(sz, &dstp, dstreg);
        }
    }

    /// Bit-exact copy from an integer slot to a float slot.
    pub(crate) fn op_fcopyi(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MR, self.state);
        let sz = inst.size();

        let dstreg = dstp.select_float_register(TEMPF_REG1);
        let srcreg = srcp.select_register(TEMP_REG1);

        e.mov_reg_param(sz, srcreg, &srcp);
        e.fmov_fg(sz, dstreg, srcreg);
        e.mov_float_param_reg(sz, &dstp, dstreg);
    }

    /// Bit-exact copy from a float slot to an integer slot.
    pub(crate) fn op_icopyf(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MF, self.state);
        let sz = inst.size();

        let dstreg = dstp.select_register(TEMP_REG1);
        let srcreg = srcp.select_float_register(TEMPF_REG1);

        e.mov_float_reg_param(sz, srcreg, &srcp);
        e.fmov_gf(sz, dstreg, srcreg);
        e.mov_param_reg(sz, &dstp, dstreg);
    }
}
