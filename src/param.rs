//! Back-end parameter abstraction.
//!
//! A UML parameter is narrowed to one of four shapes the generators handle:
//! an immediate, a host integer register, a host float register, or a host
//! memory location. UML registers map through the static register maps; an
//! unmapped index spills to its slot in the machine state and is marked as a
//! "cold register" so partial-width stores keep the full 64-bit slot
//! coherent.

use crate::emit::{Emitter, FLOAT_REGISTER_MAP, INT_REGISTER_MAP, SCRATCH_REG1, SCRATCH_REG2};
use crate::state::MachineState;
use crate::uml::Param;

/// Allowed-parameter masks, used to assert each generator's operand shapes.
pub const PTYPE_I: u32 = 1 << 0;
pub const PTYPE_M: u32 = 1 << 1;
pub const PTYPE_R: u32 = 1 << 2;
pub const PTYPE_F: u32 = 1 << 3;
pub const PTYPE_MR: u32 = PTYPE_M | PTYPE_R;
pub const PTYPE_MRI: u32 = PTYPE_M | PTYPE_R | PTYPE_I;
pub const PTYPE_MF: u32 = PTYPE_M | PTYPE_F;

/// A parameter as the generators see it. Register numbers are host register
/// numbers, already translated through the static maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeParam {
    Imm(u64),
    IntReg(u8),
    FloatReg(u8),
    Mem { ptr: *mut u8, cold: bool },
}

/// Narrow a UML parameter to a back-end parameter. `state` supplies the
/// spill slots for unmapped UML registers.
pub fn be_param(param: &Param, allowed: u32, state: *mut MachineState) -> BeParam {
    match param {
        Param::Imm(val) => {
            assert!(allowed & PTYPE_I != 0, "immediate not allowed here");
            BeParam::Imm(*val)
        }
        Param::Mem(ptr) => {
            assert!(allowed & PTYPE_M != 0, "memory operand not allowed here");
            BeParam::Mem { ptr: *ptr, cold: false }
        }
        Param::IReg(index) => {
            assert!(allowed & PTYPE_R != 0, "integer register not allowed here");
            assert!(allowed & PTYPE_M != 0);
            match INT_REGISTER_MAP[*index as usize] {
                0 => BeParam::Mem {
                    ptr: unsafe { (*state).r.as_mut_ptr().add(*index as usize) } as *mut u8,
                    cold: true,
                },
                reg => BeParam::IntReg(reg),
            }
        }
        Param::FReg(index) => {
            assert!(allowed & PTYPE_F != 0, "float register not allowed here");
            assert!(allowed & PTYPE_M != 0);
            match FLOAT_REGISTER_MAP[*index as usize] {
                0 => BeParam::Mem {
                    ptr: unsafe { (*state).f.as_mut_ptr().add(*index as usize) } as *mut u8,
                    cold: true,
                },
                reg => BeParam::FloatReg(reg),
            }
        }
        other => panic!("unexpected parameter type {other:?}"),
    }
}

impl BeParam {
    pub fn is_immediate(&self) -> bool {
        matches!(self, BeParam::Imm(_))
    }

    pub fn is_immediate_value(&self, value: u64) -> bool {
        matches!(self, BeParam::Imm(v) if *v == value)
    }

    pub fn immediate(&self) -> u64 {
        match self {
            BeParam::Imm(v) => *v,
            other => panic!("{other:?} is not an immediate"),
        }
    }

    pub fn is_int_register(&self) -> bool {
        matches!(self, BeParam::IntReg(_))
    }

    pub fn is_float_register(&self) -> bool {
        matches!(self, BeParam::FloatReg(_))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, BeParam::Mem { .. })
    }

    pub fn is_cold_register(&self) -> bool {
        matches!(self, BeParam::Mem { cold: true, .. })
    }

    /// Host integer register number.
    pub fn ireg(&self) -> u8 {
        match self {
            BeParam::IntReg(r) => *r,
            other => panic!("{other:?} is not an integer register"),
        }
    }

    /// Host float register number.
    pub fn freg(&self) -> u8 {
        match self {
            BeParam::FloatReg(r) => *r,
            other => panic!("{other:?} is not a float register"),
        }
    }

    pub fn memory(&self) -> u64 {
        match self {
            BeParam::Mem { ptr, .. } => *ptr as u64,
            other => panic!("{other:?} is not a memory operand"),
        }
    }

    /// Use this parameter's own register when it has one, otherwise the
    /// provided default.
    pub fn select_register(&self, default: u8) -> u8 {
        match self {
            BeParam::IntReg(r) => *r,
            _ => default,
        }
    }

    pub fn select_float_register(&self, default: u8) -> u8 {
        match self {
            BeParam::FloatReg(r) => *r,
            _ => default,
        }
    }
}

// ─── Parameter moves ────────────────────────────────────────────────────────

impl Emitter {
    /// Load a parameter into a host integer register at the given width.
    pub fn mov_reg_param(&mut self, sz: u32, dst: u8, src: &BeParam) {
        match src {
            BeParam::Imm(val) => {
                self.mov_imm(sz, dst, if sz == 4 { *val as u32 as u64 } else { *val });
            }
            BeParam::IntReg(reg) => {
                if *reg != dst {
                    self.mov(sz, dst, *reg);
                }
            }
            BeParam::Mem { ptr, cold } => {
                // Big-endian hosts keep the significant half of a cold
                // register's slot at the high address.
                if cfg!(target_endian = "big") && sz == 4 && *cold {
                    self.ldr_mem(4, dst, *ptr as u64 + 4);
                } else {
                    self.ldr_mem(sz, dst, *ptr as u64);
                }
            }
            BeParam::FloatReg(_) => panic!("float register in integer move"),
        }
    }

    /// Store a host integer register into a parameter. Cold-register spills
    /// always write the full 8-byte slot.
    pub fn mov_param_reg(&mut self, sz: u32, dst: &BeParam, src: u8) {
        match dst {
            BeParam::Mem { ptr, cold } => {
                let store_sz = if *cold { 8 } else { sz };
                self.str_mem(store_sz, src, *ptr as u64);
            }
            BeParam::IntReg(reg) => {
                if *reg != src {
                    self.mov(sz, *reg, src);
                }
            }
            other => panic!("cannot store into {other:?}"),
        }
    }

    /// Store an immediate into a parameter, using the zero register for 0.
    pub fn mov_param_imm(&mut self, sz: u32, dst: &BeParam, src: u64) {
        match dst {
            BeParam::Mem { ptr, cold } => {
                let store_sz = if *cold { 8 } else { sz };
                if src == 0 {
                    self.str_mem(store_sz, 31, *ptr as u64);
                } else {
                    let val = if sz == 4 { src as u32 as u64 } else { src };
                    self.mov_imm(store_sz, SCRATCH_REG2, val);
                    self.str_mem(store_sz, SCRATCH_REG2, *ptr as u64);
                }
            }
            BeParam::IntReg(reg) => {
                self.mov_imm(sz, *reg, src);
            }
            other => panic!("cannot store into {other:?}"),
        }
    }

    /// Parameter-to-parameter move; memory-to-memory routes through a
    /// scratch register.
    pub fn mov_param_param(&mut self, sz: u32, dst: &BeParam, src: &BeParam) {
        match src {
            BeParam::Mem { .. } => {
                if dst.is_int_register() {
                    self.mov_reg_param(sz, dst.ireg(), src);
                } else {
                    self.mov_reg_param(sz, SCRATCH_REG1, src);
                    self.mov_param_reg(sz, dst, SCRATCH_REG1);
                }
            }
            BeParam::IntReg(reg) => self.mov_param_reg(sz, dst, *reg),
            BeParam::Imm(val) => self.mov_param_imm(sz, dst, *val),
            BeParam::FloatReg(_) => panic!("float register in integer move"),
        }
    }

    /// Store a parameter to an absolute host location (such as the
    /// exception-parameter slot).
    pub fn mov_mem_param(&mut self, sz: u32, dst: u64, src: &BeParam) {
        match src {
            BeParam::Imm(0) => self.str_mem(sz, 31, dst),
            BeParam::Imm(val) => {
                self.mov_imm(sz, SCRATCH_REG2, if sz == 4 { *val as u32 as u64 } else { *val });
                self.str_mem(sz, SCRATCH_REG2, dst);
            }
            BeParam::Mem { ptr, cold } => {
                if cfg!(target_endian = "big") && sz == 4 && *cold {
                    self.ldr_mem(4, SCRATCH_REG2, *ptr as u64 + 4);
                } else {
                    self.ldr_mem(sz, SCRATCH_REG2, *ptr as u64);
                }
                self.str_mem(sz, SCRATCH_REG2, dst);
            }
            BeParam::IntReg(reg) => self.str_mem(sz, *reg, dst),
            BeParam::FloatReg(_) => panic!("float register in integer move"),
        }
    }

    // Float-typed moves.

    pub fn mov_float_reg_param(&mut self, sz: u32, dst: u8, src: &BeParam) {
        match src {
            BeParam::Mem { ptr, .. } => self.ldr_float_mem(sz, dst, *ptr as u64),
            BeParam::FloatReg(reg) => {
                if *reg != dst {
                    self.fmov_ff(sz, dst, *reg);
                }
            }
            other => panic!("{other:?} in float move"),
        }
    }

    pub fn mov_float_param_reg(&mut self, sz: u32, dst: &BeParam, src: u8) {
        match dst {
            BeParam::Mem { ptr, .. } => self.str_float_mem(sz, src, *ptr as u64),
            BeParam::FloatReg(reg) => {
                if *reg != src {
                    self.fmov_ff(sz, *reg, src);
                }
            }
            other => panic!("cannot store float into {other:?}"),
        }
    }

    /// Store an integer register's bits into a float-typed parameter.
    pub fn mov_float_param_int_reg(&mut self, sz: u32, dst: &BeParam, src: u8) {
        match dst {
            BeParam::Mem { ptr, .. } => self.str_mem(sz, src, *ptr as u64),
            BeParam::FloatReg(reg) => self.fmov_fg(sz, *reg, src),
            other => panic!("cannot store float into {other:?}"),
        }
    }

    pub fn mov_float_param_param(&mut self, sz: u32, dst: &BeParam, src: &BeParam) {
        if dst.is_float_register() {
            self.mov_float_reg_param(sz, dst.freg(), src);
        } else {
            match src {
                BeParam::FloatReg(reg) => self.mov_float_param_reg(sz, dst, *reg),
                BeParam::Mem { ptr, .. } => {
                    self.ldr_mem(sz, SCRATCH_REG2, *ptr as u64);
                    self.str_mem(sz, SCRATCH_REG2, dst.memory());
                }
                other => panic!("{other:?} in float move"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uml;

    #[test]
    fn uml_registers_map_to_callee_saved_hosts() {
        let mut state = MachineState::zeroed();
        let p = be_param(&uml::ireg(0), PTYPE_MRI, &mut state);
        assert_eq!(p, BeParam::IntReg(19));
        let p = be_param(&uml::ireg(7), PTYPE_MRI, &mut state);
        assert_eq!(p, BeParam::IntReg(26));
        let p = be_param(&uml::freg(3), PTYPE_MF, &mut state);
        assert_eq!(p, BeParam::FloatReg(11));
    }

    #[test]
    fn select_register_prefers_own_register() {
        let p = BeParam::IntReg(20);
        assert_eq!(p.select_register(9), 20);
        let p = BeParam::Imm(5);
        assert_eq!(p.select_register(9), 9);
    }

    #[test]
    fn cold_spill_stores_full_slot() {
        let mut slot = 0u64;
        let cold = BeParam::Mem { ptr: &mut slot as *mut u64 as *mut u8, cold: true };

        let mut e = Emitter::new(0x10000, &mut slot as *mut u64 as u64);
        e.mov_param_reg(4, &cold, 9);
        let bytes = e.finalize().unwrap();
        assert_eq!(bytes.len(), 4);
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // str x9, [x27] — 64-bit store despite the 4-byte operation
        assert_eq!(word, 0xF900_0000 | (27 << 5) | 9);
    }

    #[test]
    fn warm_memory_stores_at_operand_width() {
        let mut slot = 0u64;
        let warm = BeParam::Mem { ptr: &mut slot as *mut u64 as *mut u8, cold: false };

        let mut e = Emitter::new(0x10000, &mut slot as *mut u64 as u64);
        e.mov_param_reg(4, &warm, 9);
        let bytes = e.finalize().unwrap();
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // str w9, [x27]
        assert_eq!(word, 0xB900_0000 | (27 << 5) | 9);
    }

    #[test]
    fn zero_immediate_store_uses_zero_register() {
        let mut slot = 0u64;
        let warm = BeParam::Mem { ptr: &mut slot as *mut u64 as *mut u8, cold: false };

        let mut e = Emitter::new(0x10000, &mut slot as *mut u64 as u64);
        e.mov_param_imm(8, &warm, 0);
        let bytes = e.finalize().unwrap();
        assert_eq!(bytes.len(), 4);
        let word = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // str xzr, [x27]
        assert_eq!(word, 0xF900_0000 | (27 << 5) | 31);
    }

    #[test]
    fn register_self_move_is_elided() {
        let mut e = Emitter::new(0x10000, 0x20_0000);
        e.mov_reg_param(8, 20, &BeParam::IntReg(20));
        assert!(e.finalize().unwrap().is_empty());
    }
}
