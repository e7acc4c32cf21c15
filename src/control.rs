//! Control-flow and internal-register opcode generators.

use dynasmrt::DynamicLabel;

use crate::backend::{
    Backend, assert_any_condition, assert_no_condition, assert_no_flags,
};
use crate::emit::{
    Emitter, FLAGS_REG, FLOAT_REGISTER_MAP, FUNC_SCRATCH_REG, INT_REGISTER_MAP, LdSt, REG_PARAM1,
    REG_PARAM2, REG_PARAM3, SCRATCH_REG1, ShiftedOp, TEMP_REG1, TEMP_REG2, TEMP_REG3, cond_for,
    is_valid_uimm, not_cond_for,
};
use crate::flags::{CarryState, FLAG_BIT_C, FLAG_BIT_U, FLAG_BIT_V};
use crate::map::map_get_value;
use crate::param::{PTYPE_I, PTYPE_M, PTYPE_MR, PTYPE_MRI, be_param};
use crate::uml::{CodeHandle, Cond, FLAG_C, FLAG_S, FLAG_U, FLAG_V, FLAG_Z, Inst};

impl Emitter {
    /// Branch to a fresh label when the condition does not hold; `None` for
    /// unconditional instructions. C consumers pick the polarity matching
    /// the tracked carry state; U and poisoned C test the emulated-flags
    /// register directly.
    pub(crate) fn emit_skip(&mut self, cond: Cond) -> Option<DynamicLabel> {
        if cond == Cond::Always {
            return None;
        }

        let skip = self.new_label();
        match cond {
            Cond::U => self.tbz(FLAGS_REG, FLAG_BIT_U, skip),
            Cond::NU => self.tbnz(FLAGS_REG, FLAG_BIT_U, skip),
            Cond::C | Cond::NC => match self.carry {
                CarryState::Canonical => self.b_cond(cond_for(cond), skip),
                CarryState::Logical => self.b_cond(not_cond_for(cond), skip),
                CarryState::Poison => {
                    if cond == Cond::C {
                        self.tbz(FLAGS_REG, FLAG_BIT_C, skip);
                    } else {
                        self.tbnz(FLAGS_REG, FLAG_BIT_C, skip);
                    }
                }
            },
            Cond::A | Cond::BE => {
                self.load_carry(true);
                self.b_cond(not_cond_for(cond), skip);
            }
            _ => self.b_cond(not_cond_for(cond), skip),
        }
        Some(skip)
    }

    /// Call a handle target: direct when already bound, else through its
    /// code-pointer cell.
    pub(crate) fn call_handle(&mut self, handle: &CodeHandle) {
        let target = handle.codeptr();
        if !target.is_null() {
            self.call_abs(target as u64);
        } else {
            self.ldr_mem(8, SCRATCH_REG1, handle.cell_addr() as u64);
            self.blr(SCRATCH_REG1);
        }
    }
}

impl Backend {
    pub(crate) fn op_handle(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_no_condition(inst);
        assert_no_flags(inst);
        assert_eq!(inst.numparams(), 1);

        e.carry = CarryState::Poison;

        // Jump over the prologue in case code falls through here.
        let skip = e.new_label();
        e.b(skip);

        // The handle points at a prologue that opens a minimal non-leaf
        // frame.
        inst.param(0).handle().set_codeptr(e.cursor() as *const u8);
        e.push_lr_frame();
        e.bind(skip);
    }

    pub(crate) fn op_hash(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_no_condition(inst);
        assert_no_flags(inst);
        assert_eq!(inst.numparams(), 2);

        e.carry = CarryState::Poison;

        let mode = inst.param(0).immediate() as u32;
        let pc = inst.param(1).immediate() as u32;
        self.hash.set_codeptr(mode, pc, e.cursor() as *const u8);
    }

    pub(crate) fn op_label(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_no_condition(inst);
        assert_no_flags(inst);
        assert_eq!(inst.numparams(), 1);

        e.carry = CarryState::Poison;

        let label = self.find_label(e, inst.param(0).label());
        e.bind(label);
    }

    pub(crate) fn op_comment(&mut self, _e: &mut Emitter, inst: &Inst) {
        assert_no_condition(inst);
        assert_no_flags(inst);
        assert_eq!(inst.numparams(), 1);
    }

    pub(crate) fn op_mapvar(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_no_condition(inst);
        assert_no_flags(inst);
        assert_eq!(inst.numparams(), 2);

        let mapvar = inst.param(0).mapvar();
        let value = inst.param(1).immediate();
        self.map.set_value(e.cursor(), mapvar, value);
    }

    pub(crate) fn op_nop(&mut self, _e: &mut Emitter, _inst: &Inst) {}

    pub(crate) fn op_break(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = CarryState::Poison;

        e.call_abs(self.break_hook as usize as u64);
    }

    pub(crate) fn op_debug(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let Some(hook) = self.debug else { return };

        e.carry = CarryState::Poison;

        let pcp = be_param(inst.param(0), PTYPE_MRI, self.state);

        let skip = e.new_label();
        e.ldr_mem(4, TEMP_REG1, hook.flags_ptr as u64);
        e.tbz(TEMP_REG1, 1, skip); // call-hook bit

        e.mov_imm(8, REG_PARAM1, hook.obj as u64);
        e.mov_reg_param(4, REG_PARAM2, &pcp);
        e.call_abs(hook.func as u64);

        e.bind(skip);
    }

    pub(crate) fn op_exit(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_any_condition(inst);
        assert_no_flags(inst);

        let retp = be_param(inst.param(0), PTYPE_MRI, self.state);

        let skip = e.emit_skip(inst.condition());

        e.mov_reg_param(4, REG_PARAM1, &retp);
        e.b_abs(self.exit);

        if let Some(skip) = skip {
            e.bind(skip);
        }
    }

    pub(crate) fn op_hashjmp(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let modep = be_param(inst.param(0), PTYPE_MRI, self.state);
        let pcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let exp = inst.param(2).handle().clone();

        // Abandon any nested generated-subroutine frames.
        e.mov_sp_fp();

        if modep.is_immediate() && self.hash.is_mode_populated(modep.immediate()) {
            let mode = modep.immediate() as u32;
            if pcp.is_immediate() {
                let slot = self.hash.slot_addr(mode, pcp.immediate() as u32);
                e.ldr_mem(8, TEMP_REG1, slot);
            } else {
                e.mov_reg_param(4, TEMP_REG2, &pcp);

                let l1_table = self.hash.mode_l1_addr(mode);
                e.mov_imm(8, TEMP_REG1, l1_table);

                e.ubfx(8, TEMP_REG3, TEMP_REG2, self.hash.l1shift(), self.hash.l1bits());
                e.ldst_regoff(LdSt::LDRX, TEMP_REG3, TEMP_REG1, TEMP_REG3, true);

                e.ubfx(8, TEMP_REG2, TEMP_REG2, self.hash.l2shift(), self.hash.l2bits());
                e.ldst_regoff(LdSt::LDRX, TEMP_REG1, TEMP_REG3, TEMP_REG2, true);
            }
        } else {
            e.mov_imm(8, TEMP_REG2, self.hash.base_addr());

            if modep.is_immediate() {
                e.ldst_imm(LdSt::LDRX, TEMP_REG1, TEMP_REG2, modep.immediate() as i64 * 8);
            } else {
                let mode = modep.select_register(TEMP_REG1);
                e.mov_reg_param(4, mode, &modep);
                e.ldst_regoff(LdSt::LDRX, TEMP_REG1, TEMP_REG2, mode, true);
            }

            if pcp.is_immediate() {
                let pc = pcp.immediate() as u32;
                let l1val = ((pc >> self.hash.l1shift()) & self.hash.l1mask()) as u64 * 8;
                let l2val = ((pc >> self.hash.l2shift()) & self.hash.l2mask()) as u64 * 8;

                if is_valid_uimm(l1val, 15) {
                    e.ldst_imm(LdSt::LDRX, TEMP_REG1, TEMP_REG1, l1val as i64);
                } else {
                    e.mov_imm(8, SCRATCH_REG1, l1val >> 3);
                    e.ldst_regoff(LdSt::LDRX, TEMP_REG1, TEMP_REG1, SCRATCH_REG1, true);
                }

                if is_valid_uimm(l2val, 15) {
                    e.ldst_imm(LdSt::LDRX, TEMP_REG1, TEMP_REG1, l2val as i64);
                } else {
                    e.mov_imm(8, SCRATCH_REG1, l2val >> 3);
                    e.ldst_regoff(LdSt::LDRX, TEMP_REG1, TEMP_REG1, SCRATCH_REG1, true);
                }
            } else {
                let pc = pcp.select_register(TEMP_REG2);
                e.mov_reg_param(4, pc, &pcp);

                e.ubfx(8, TEMP_REG3, pc, self.hash.l1shift(), self.hash.l1bits());
                e.ldst_regoff(LdSt::LDRX, TEMP_REG3, TEMP_REG1, TEMP_REG3, true);

                e.ubfx(8, TEMP_REG2, pc, self.hash.l2shift(), self.hash.l2bits());
                e.ldst_regoff(LdSt::LDRX, TEMP_REG1, TEMP_REG3, TEMP_REG2, true);
            }
        }

        // Jump to the resolved target with the continuation address in the
        // first parameter register: the no-code stub branches straight back
        // to it on a miss.
        let continuation = e.cursor() + 8;
        e.adr_abs(REG_PARAM1, continuation);
        e.br(TEMP_REG1);

        // Miss: record the exception parameter and call the handler.
        e.mov_mem_param(4, self.state_exp_addr(), &pcp);
        e.call_handle(&exp);

        e.carry = CarryState::Poison;
    }

    pub(crate) fn op_jmp(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_any_condition(inst);
        assert_no_flags(inst);

        let target = self.find_label(e, inst.param(0).label());

        match inst.condition() {
            Cond::Always => e.b(target),
            Cond::U | Cond::NU => {
                e.get_unordered(SCRATCH_REG1);
                if inst.condition() == Cond::U {
                    e.cbnz(8, SCRATCH_REG1, target);
                } else {
                    e.cbz(8, SCRATCH_REG1, target);
                }
            }
            cond @ (Cond::C | Cond::NC) => match e.carry {
                CarryState::Canonical => e.b_cond(not_cond_for(cond), target),
                CarryState::Logical => e.b_cond(cond_for(cond), target),
                CarryState::Poison => {
                    e.get_carry(SCRATCH_REG1, false);
                    if cond == Cond::C {
                        e.cbnz(8, SCRATCH_REG1, target);
                    } else {
                        e.cbz(8, SCRATCH_REG1, target);
                    }
                }
            },
            cond @ (Cond::A | Cond::BE) => {
                e.load_carry(true);
                e.b_cond(cond_for(cond), target);
            }
            cond => e.b_cond(cond_for(cond), target),
        }
    }

    pub(crate) fn op_exh(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_any_condition(inst);
        assert_no_flags(inst);

        let handle = inst.param(0).handle().clone();
        let exp = be_param(inst.param(1), PTYPE_MRI, self.state);

        let no_exception = e.emit_skip(inst.condition());

        e.mov_mem_param(4, self.state_exp_addr(), &exp);
        e.call_handle(&handle);

        if let Some(skip) = no_exception {
            e.bind(skip);
        }

        e.carry = CarryState::Poison;
    }

    pub(crate) fn op_callh(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_any_condition(inst);
        assert_no_flags(inst);

        let handle = inst.param(0).handle().clone();

        let skip = e.emit_skip(inst.condition());

        e.call_handle(&handle);

        if let Some(skip) = skip {
            e.bind(skip);
        }

        e.carry = CarryState::Poison;
    }

    pub(crate) fn op_ret(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_any_condition(inst);
        assert_no_flags(inst);
        assert_eq!(inst.numparams(), 0);

        let skip = e.emit_skip(inst.condition());

        e.pop_lr_frame();
        e.ret();

        if let Some(skip) = skip {
            e.bind(skip);
        }
    }

    pub(crate) fn op_callc(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_any_condition(inst);
        assert_no_flags(inst);

        let func = inst.param(0).cfunc();
        let paramp = be_param(inst.param(1), PTYPE_M, self.state);

        let skip = e.emit_skip(inst.condition());

        // The flags register is call-preserved, but the callee may run UML
        // code of its own; spill and reload the persistent bits around it.
        e.str_mem(4, FLAGS_REG, self.flags_slot_addr());

        e.mov_imm(8, REG_PARAM1, paramp.memory());
        e.mov_imm(8, TEMP_REG1, func as usize as u64);
        e.blr(TEMP_REG1);

        e.ldr_mem(4, FLAGS_REG, self.flags_slot_addr());

        if let Some(skip) = skip {
            e.bind(skip);
        }

        e.carry = CarryState::Poison;
    }

    pub(crate) fn op_recover(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = CarryState::Poison;

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);

        // The return address saved by the most recent CALLH/EXH/failed hash
        // jump, backed up to point at the call itself.
        e.ldst_imm(LdSt::LDRX, REG_PARAM2, 29, -8);
        e.mov_imm(8, REG_PARAM1, &*self.map as *const _ as u64);
        e.mov_imm(8, REG_PARAM3, inst.param(1).mapvar() as u64);
        e.sub_imm(8, REG_PARAM2, REG_PARAM2, 4);

        e.call_abs(map_get_value as usize as u64);

        e.mov_param_reg(inst.size(), &dstp, REG_PARAM1);
    }

    // ── Internal register operations ────────────────────────────────────

    pub(crate) fn op_setfmod(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let srcp = be_param(inst.param(0), PTYPE_MRI, self.state);

        if srcp.is_immediate() {
            e.mov_imm(inst.size(), FUNC_SCRATCH_REG, srcp.immediate() & 3);
        } else {
            let src = srcp.select_register(FUNC_SCRATCH_REG);
            e.mov_reg_param(inst.size(), src, &srcp);
            e.and_imm(inst.size(), FUNC_SCRATCH_REG, src, 3);
        }

        e.strb_mem(FUNC_SCRATCH_REG, self.state_fmod_addr());
    }

    pub(crate) fn op_getfmod(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let dst = dstp.select_register(TEMP_REG1);

        e.ldrb_mem(dst, self.state_fmod_addr());
        e.mov_param_reg(inst.size(), &dstp, dst);
    }

    pub(crate) fn op_getexp(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let dst = dstp.select_register(TEMP_REG1);

        e.ldr_mem(4, dst, self.state_exp_addr());
        e.mov_param_reg(inst.size(), &dstp, dst);
    }

    pub(crate) fn op_getflgs(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let maskp = be_param(inst.param(1), PTYPE_I, self.state);
        let mask = maskp.immediate() as u8;

        let dst = dstp.select_register(TEMP_REG1);
        let mut first = true;

        if mask & FLAG_C != 0 {
            e.and_imm(8, dst, FLAGS_REG, FLAG_C as u64);
            first = false;
        }

        if mask & FLAG_V != 0 {
            if first {
                e.cset(8, dst, crate::emit::ArmCond::Vs);
                e.lsl_imm(8, dst, dst, FLAG_BIT_V);
                first = false;
            } else {
                e.cset(8, SCRATCH_REG1, crate::emit::ArmCond::Vs);
                e.alu_shifted(ShiftedOp::Orr, 8, dst, dst, SCRATCH_REG1, FLAG_BIT_V);
            }
        }

        if mask & FLAG_Z != 0 {
            if first {
                e.cset(8, dst, crate::emit::ArmCond::Eq);
                e.lsl_imm(8, dst, dst, crate::flags::FLAG_BIT_Z);
                first = false;
            } else {
                e.cset(8, SCRATCH_REG1, crate::emit::ArmCond::Eq);
                e.alu_shifted(ShiftedOp::Orr, 8, dst, dst, SCRATCH_REG1, crate::flags::FLAG_BIT_Z);
            }
        }

        if mask & FLAG_S != 0 {
            if first {
                e.cset(8, dst, crate::emit::ArmCond::Mi);
                e.lsl_imm(8, dst, dst, crate::flags::FLAG_BIT_S);
                first = false;
            } else {
                e.cset(8, SCRATCH_REG1, crate::emit::ArmCond::Mi);
                e.alu_shifted(ShiftedOp::Orr, 8, dst, dst, SCRATCH_REG1, crate::flags::FLAG_BIT_S);
            }
        }

        if mask & FLAG_U != 0 {
            if first {
                e.and_imm(8, dst, FLAGS_REG, FLAG_U as u64);
                first = false;
            } else {
                e.and_imm(8, SCRATCH_REG1, FLAGS_REG, FLAG_U as u64);
                e.orr(8, dst, dst, SCRATCH_REG1);
            }
        }

        if first {
            e.mov_zero(8, dst);
        }

        e.mov_param_reg(inst.size(), &dstp, dst);
    }

    pub(crate) fn op_setflgs(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);

        let flagsp = be_param(inst.param(0), PTYPE_MRI, self.state);

        e.mov_reg_param(inst.size(), FLAGS_REG, &flagsp);
        e.set_flags();
    }

    pub(crate) fn op_save(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);
        assert_no_flags(inst);

        let dstp = be_param(inst.param(0), PTYPE_M, self.state);
        let membase = SCRATCH_REG1;

        e.mov_imm(8, membase, dstp.memory());

        // Compose the packed flags byte from NZCV plus the persistent bits.
        e.mrs_nzcv(TEMP_REG1);
        e.lsr_imm(8, TEMP_REG1, TEMP_REG1, 28);

        e.and_imm(8, TEMP_REG2, TEMP_REG1, 0b1100); // Z and S land on their UML bits
        e.orr(8, TEMP_REG2, TEMP_REG2, FLAGS_REG); // carry and unordered
        e.bfi(8, TEMP_REG2, TEMP_REG1, FLAG_BIT_V, 1);

        e.ldst_imm(LdSt::STRB, TEMP_REG2, membase, crate::state::STATE_FLAGS as i64);

        e.ldrb_mem(TEMP_REG1, self.state_fmod_addr());
        e.ldst_imm(LdSt::STRB, TEMP_REG1, membase, crate::state::STATE_FMOD as i64);

        e.ldr_mem(4, TEMP_REG1, self.state_exp_addr());
        e.ldst_imm(LdSt::STRW, TEMP_REG1, membase, crate::state::STATE_EXP as i64);

        for (regnum, &mapped) in INT_REGISTER_MAP.iter().enumerate() {
            let offset = (crate::state::STATE_R + 8 * regnum) as i64;
            if mapped != 0 {
                e.ldst_imm(LdSt::STRX, mapped, membase, offset);
            } else {
                e.ldr_mem(8, TEMP_REG1, self.state_reg_addr(regnum));
                e.ldst_imm(LdSt::STRX, TEMP_REG1, membase, offset);
            }
        }

        for (regnum, &mapped) in FLOAT_REGISTER_MAP.iter().enumerate() {
            let offset = (crate::state::STATE_F + 8 * regnum) as i64;
            if mapped != 0 {
                e.ldst_imm(LdSt::STRD, mapped, membase, offset);
            } else {
                e.ldr_mem(8, TEMP_REG1, self.state_freg_addr(regnum));
                e.ldst_imm(LdSt::STRX, TEMP_REG1, membase, offset);
            }
        }
    }

    pub(crate) fn op_restore(&mut self, e: &mut Emitter, inst: &Inst) {
        assert_eq!(inst.size(), 4);
        assert_no_condition(inst);

        let srcp = be_param(inst.param(0), PTYPE_M, self.state);
        let membase = SCRATCH_REG1;

        e.mov_imm(8, membase, srcp.memory());

        for (regnum, &mapped) in INT_REGISTER_MAP.iter().enumerate() {
            let offset = (crate::state::STATE_R + 8 * regnum) as i64;
            if mapped != 0 {
                e.ldst_imm(LdSt::LDRX, mapped, membase, offset);
            } else {
                e.ldst_imm(LdSt::LDRX, TEMP_REG1, membase, offset);
                e.str_mem(8, TEMP_REG1, self.state_reg_addr(regnum));
            }
        }

        for (regnum, &mapped) in FLOAT_REGISTER_MAP.iter().enumerate() {
            let offset = (crate::state::STATE_F + 8 * regnum) as i64;
            if mapped != 0 {
                e.ldst_imm(LdSt::LDRD, mapped, membase, offset);
            } else {
                e.ldst_imm(LdSt::LDRX, TEMP_REG1, membase, offset);
                e.str_mem(8, TEMP_REG1, self.state_freg_addr(regnum));
            }
        }

        e.ldst_imm(LdSt::LDRB, TEMP_REG1, membase, crate::state::STATE_FMOD as i64);
        e.strb_mem(TEMP_REG1, self.state_fmod_addr());

        e.ldst_imm(LdSt::LDRW, TEMP_REG1, membase, crate::state::STATE_EXP as i64);
        e.str_mem(4, TEMP_REG1, self.state_exp_addr());

        e.ldst_imm(LdSt::LDRB, FLAGS_REG, membase, crate::state::STATE_FLAGS as i64);
        e.set_flags();
    }
}
