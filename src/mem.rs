//! Guest address-space accessors and READ/WRITE lowering.
//!
//! Each address space supplies pre-resolved read/write functions per access
//! width (the slow path) and, when available, a "specific" fast path: a
//! dispatch table indexed by the high address bits whose entries are handler
//! objects called directly, bypassing the generic accessor. The fast path
//! handles address masking, dispatch indexing, an optional vtable hop, and
//! sub-lane shifting for writes narrower than the native lane.

use crate::backend::{Backend, assert_no_condition, assert_no_flags};
use crate::emit::{
    Emitter, LdSt, REG_PARAM1, REG_PARAM2, REG_PARAM3, REG_PARAM4, ShiftedOp, TEMPF_REG1, bitmask,
};
use crate::param::{PTYPE_MF, PTYPE_MR, PTYPE_MRI, be_param};
use crate::uml::{Inst, MemSize};

// Fast-path scratch registers, all call-clobbered.
const ADDR_ALT_REG: u8 = 6;
const ADDR_ALT_NARROW_REG: u8 = 5;
const INDEX_REG: u8 = 7;
const DISPATCH_REG: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// A resolved accessor function and its receiver.
///
/// ABI: reads are `fn(obj, addr) -> value` / `fn(obj, addr, mask) -> value`,
/// writes are `fn(obj, addr, data)` / `fn(obj, addr, data, mask)`, all
/// `extern "C"`, address in a 32-bit register, data widened to 64 bits.
#[derive(Debug, Clone, Copy)]
pub struct Accessor {
    pub obj: usize,
    pub func: usize,
}

/// Pre-resolved accessors per access width, indexed by `MemSize`.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedAccessors {
    pub read: [Accessor; 4],
    pub read_masked: [Accessor; 4],
    pub write: [Accessor; 4],
    pub write_masked: [Accessor; 4],
}

/// One side (read or write) of the specific fast path.
///
/// The dispatch entry pointer plus `displacement` forms the receiver. When
/// `is_virtual` is set, `function` is a byte offset into the receiver's
/// vtable; otherwise it is the handler address itself. The handler ABI
/// is `fn(obj, masked_addr, data_or_mask, mask) -> value`.
#[derive(Debug, Clone, Copy)]
pub struct SpecificSide {
    pub dispatch: usize,
    pub function: usize,
    pub displacement: u32,
    pub is_virtual: bool,
}

/// The specific fast-path descriptor for one address space.
#[derive(Debug, Clone, Copy)]
pub struct SpecificAccessors {
    pub read: Option<SpecificSide>,
    pub write: Option<SpecificSide>,
    /// Significant low address bits below the dispatch index.
    pub low_bits: u8,
    pub address_width: u8,
    /// Low address bits that do not participate in masking.
    pub native_mask_bits: u8,
    /// Width in bytes of the native lane the dispatch entries handle.
    pub native_bytes: u32,
}

/// What the collaborator supplies for one guest address space.
pub struct SpaceConfig {
    /// log2 bytes per address unit minus log2 bytes of the bus; negative
    /// for word-addressed spaces.
    pub addr_shift: i8,
    pub endianness: Endianness,
    pub addr_mask: u32,
    pub resolved: ResolvedAccessors,
    pub specific: Option<SpecificAccessors>,
}

/// A space plus the mask-shape facts precomputed at construction.
pub struct SpaceInfo {
    pub cfg: SpaceConfig,
    pub address_mask: u32,
    pub high_bits: u32,
    pub no_mask: bool,
    pub mask_simple: bool,
    pub mask_high_bits: bool,
}

impl SpaceInfo {
    pub fn new(cfg: SpaceConfig) -> Self {
        let (address_mask, high_bits, no_mask, mask_simple, mask_high_bits) =
            if let Some(spec) = &cfg.specific {
                let mask = cfg.addr_mask
                    & bitmask(spec.address_width as u32) as u32
                    & !(bitmask(spec.native_mask_bits as u32) as u32);
                let shifted = mask >> spec.low_bits;
                let high_bits = 32 - shifted.leading_zeros();
                let no_mask = mask == u32::MAX;
                let mask_simple = !no_mask && crate::emit::is_valid_bitmask(mask as u64, 4);
                let mask_high_bits = shifted & (shifted + 1) != 0;
                (mask, high_bits, no_mask, mask_simple, mask_high_bits)
            } else {
                (cfg.addr_mask, 0, true, false, false)
            };

        SpaceInfo { cfg, address_mask, high_bits, no_mask, mask_simple, mask_high_bits }
    }

    fn specific(&self) -> &SpecificAccessors {
        self.cfg.specific.as_ref().expect("fast path taken without specific accessors")
    }

    /// Whether an access of `1 << size_log2` bytes can take the fast path.
    fn fast_side(&self, size: MemSize, write: bool) -> Option<&SpecificSide> {
        let spec = self.cfg.specific.as_ref()?;
        if size.bytes() != spec.native_bytes {
            return None;
        }
        if write { spec.write.as_ref() } else { spec.read.as_ref() }
    }

    fn narrow_write(&self, size: MemSize) -> Option<&SpecificSide> {
        let spec = self.cfg.specific.as_ref()?;
        if size.bytes() < spec.native_bytes { spec.write.as_ref() } else { None }
    }
}

impl Backend {
    /// Resolve the masked address into `REG_PARAM2` and the adjusted
    /// dispatch-entry pointer into `REG_PARAM1`. Clobbers x6-x8.
    fn emit_memaccess_setup(
        &self,
        e: &mut Emitter,
        addrp: &crate::param::BeParam,
        space: &SpaceInfo,
        side: &SpecificSide,
    ) {
        let spec = space.specific();
        let addrreg =
            if space.no_mask || space.mask_simple { REG_PARAM2 } else { ADDR_ALT_REG };
        e.mov_reg_param(4, addrreg, addrp);
        e.mov_imm(8, DISPATCH_REG, side.dispatch as u64);

        // If the high bits are unaffected by the global mask, extract them
        // from the raw address now.
        if space.high_bits != 0 && !space.mask_high_bits {
            e.ubfx(4, INDEX_REG, addrreg, spec.low_bits as u32, space.high_bits);
        }

        if space.mask_simple {
            e.and_imm(4, REG_PARAM2, addrreg, space.address_mask as u64);
        } else if !space.no_mask {
            e.mov_imm(4, REG_PARAM2, space.address_mask as u64);
        }

        // Load the dispatch entry as soon as its index is final.
        if space.high_bits == 0 {
            e.ldst_imm(LdSt::LDRX, REG_PARAM1, DISPATCH_REG, 0);
        } else if !space.mask_high_bits {
            e.ldst_regoff(LdSt::LDRX, REG_PARAM1, DISPATCH_REG, INDEX_REG, true);
        }

        if !space.no_mask && !space.mask_simple {
            e.and_(4, REG_PARAM2, REG_PARAM2, addrreg);
        }

        if space.mask_high_bits {
            e.lsr_imm(4, INDEX_REG, REG_PARAM2, spec.low_bits as u32);
            e.ldst_regoff(LdSt::LDRX, REG_PARAM1, DISPATCH_REG, INDEX_REG, true);
        }

        if side.displacement != 0 {
            e.add_imm(8, REG_PARAM1, REG_PARAM1, side.displacement as u64);
        }
    }

    /// Dispatch the call at the end of a fast-path access: either an
    /// indirect call through the receiver's vtable or a direct call.
    fn emit_specific_call(&self, e: &mut Emitter, side: &SpecificSide) {
        if side.is_virtual {
            e.ldst_imm(LdSt::LDRX, DISPATCH_REG, REG_PARAM1, 0);
            e.ldst_imm(LdSt::LDRX, DISPATCH_REG, DISPATCH_REG, side.function as i64);
            e.blr(DISPATCH_REG);
        } else {
            e.call_abs(side.function as u64);
        }
    }

    /// Sub-lane write: shift data and mask into the right lane of the
    /// native width, then perform a masked native-width write. Expects data
    /// in `REG_PARAM3` and mask in `REG_PARAM4`.
    fn emit_narrow_memwrite(
        &self,
        e: &mut Emitter,
        addrp: &crate::param::BeParam,
        size: MemSize,
        space: &SpaceInfo,
    ) {
        let spec = space.specific();
        let side = spec.write.as_ref().expect("narrow write without a write side");
        let addrreg =
            if space.no_mask || space.mask_simple { REG_PARAM2 } else { ADDR_ALT_NARROW_REG };
        e.mov_reg_param(4, addrreg, addrp);
        e.mov_imm(8, DISPATCH_REG, side.dispatch as u64);

        // Bit shift for the sub-lane the write lands in.
        let shift = space.cfg.addr_shift as i32 - 3;
        let shiftmask = (spec.native_bytes - size.bytes()) << 3;
        if space.cfg.endianness != Endianness::Little {
            // Big-endian lanes count down from the top of the native word.
            let smallshift = (-3..=0).contains(&shift);
            if !smallshift {
                if shift < 0 {
                    e.lsl_imm(4, ADDR_ALT_REG, addrreg, (-shift) as u32);
                } else {
                    e.lsr_imm(4, ADDR_ALT_REG, addrreg, shift as u32);
                }
            }
            e.mov_imm(4, INDEX_REG, shiftmask as u64);
            if smallshift {
                e.alu_shifted(ShiftedOp::Bic, 4, INDEX_REG, INDEX_REG, addrreg, (-shift) as u32);
            } else {
                e.bic(4, INDEX_REG, INDEX_REG, ADDR_ALT_REG);
            }
        } else if shift == 0 {
            e.and_imm(4, INDEX_REG, addrreg, shiftmask as u64);
        } else {
            if shift < 0 {
                e.lsl_imm(4, INDEX_REG, addrreg, (-shift) as u32);
            } else {
                e.lsr_imm(4, INDEX_REG, addrreg, shift as u32);
            }
            e.and_imm(4, INDEX_REG, INDEX_REG, shiftmask as u64);
        }

        if space.high_bits != 0 && !space.mask_high_bits {
            e.ubfx(4, ADDR_ALT_REG, addrreg, spec.low_bits as u32, space.high_bits);
        }

        if space.mask_simple {
            e.and_imm(4, REG_PARAM2, addrreg, space.address_mask as u64);
        } else if !space.no_mask {
            e.mov_imm(4, REG_PARAM2, space.address_mask as u64);
        }

        if space.high_bits == 0 {
            e.ldst_imm(LdSt::LDRX, REG_PARAM1, DISPATCH_REG, 0);
        } else if !space.mask_high_bits {
            e.ldst_regoff(LdSt::LDRX, REG_PARAM1, DISPATCH_REG, ADDR_ALT_REG, true);
        }

        if !space.no_mask && !space.mask_simple {
            e.and_(4, REG_PARAM2, REG_PARAM2, addrreg);
        }

        if space.mask_high_bits {
            e.lsr_imm(4, ADDR_ALT_REG, REG_PARAM2, spec.low_bits as u32);
            e.ldst_regoff(LdSt::LDRX, REG_PARAM1, DISPATCH_REG, ADDR_ALT_REG, true);
        }

        if side.displacement != 0 {
            e.add_imm(8, REG_PARAM1, REG_PARAM1, side.displacement as u64);
        }

        // Move the data and mask into the target lane.
        e.lslv(8, REG_PARAM3, REG_PARAM3, INDEX_REG);
        e.lslv(8, REG_PARAM4, REG_PARAM4, INDEX_REG);

        self.emit_specific_call(e, side);
    }

    fn emit_resolved_call(&self, e: &mut Emitter, accessor: &Accessor) {
        e.mov_imm(8, REG_PARAM1, accessor.obj as u64);
        e.call_abs(accessor.func as u64);
    }

    pub(crate) fn op_read(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = crate::flags::CarryState::Poison;

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let addrp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let size = inst.param(2).size();
        let space = self.space(inst.param(2).space());

        if let Some(side) = space.fast_side(size, false) {
            let side = *side;
            self.emit_memaccess_setup(e, &addrp, space, &side);
            if side.is_virtual {
                e.ldst_imm(LdSt::LDRX, DISPATCH_REG, REG_PARAM1, 0);
                e.ldst_imm(LdSt::LDRX, DISPATCH_REG, DISPATCH_REG, side.function as i64);
            }
            e.mov_imm(8, REG_PARAM3, bitmask(space.specific().native_bytes * 8));
            if side.is_virtual {
                e.blr(DISPATCH_REG);
            } else {
                e.call_abs(side.function as u64);
            }
        } else {
            e.mov_reg_param(4, REG_PARAM2, &addrp);
            let accessor = space.cfg.resolved.read[size as usize];
            self.emit_resolved_call(e, &accessor);
        }

        e.mov_param_reg(inst.size(), &dstp, REG_PARAM1);
    }

    pub(crate) fn op_readm(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = crate::flags::CarryState::Poison;

        let dstp = be_param(inst.param(0), PTYPE_MR, self.state);
        let addrp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let maskp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let size = inst.param(3).size();
        let space = self.space(inst.param(3).space());

        if let Some(side) = space.fast_side(size, false) {
            let side = *side;
            self.emit_memaccess_setup(e, &addrp, space, &side);
            e.mov_reg_param(inst.size(), REG_PARAM3, &maskp);
            self.emit_specific_call(e, &side);
        } else {
            e.mov_reg_param(4, REG_PARAM2, &addrp);
            e.mov_reg_param(inst.size(), REG_PARAM3, &maskp);
            let accessor = space.cfg.resolved.read_masked[size as usize];
            self.emit_resolved_call(e, &accessor);
        }

        e.mov_param_reg(inst.size(), &dstp, REG_PARAM1);
    }

    pub(crate) fn op_write(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = crate::flags::CarryState::Poison;

        let addrp = be_param(inst.param(0), PTYPE_MRI, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let size = inst.param(2).size();
        let space = self.space(inst.param(2).space());

        if let Some(side) = space.fast_side(size, true) {
            let side = *side;
            self.emit_memaccess_setup(e, &addrp, space, &side);
            e.mov_reg_param(inst.size(), REG_PARAM3, &srcp);
            if side.is_virtual {
                e.ldst_imm(LdSt::LDRX, DISPATCH_REG, REG_PARAM1, 0);
                e.ldst_imm(LdSt::LDRX, DISPATCH_REG, DISPATCH_REG, side.function as i64);
            }
            e.mov_imm(8, REG_PARAM4, bitmask(space.specific().native_bytes * 8));
            if side.is_virtual {
                e.blr(DISPATCH_REG);
            } else {
                e.call_abs(side.function as u64);
            }
        } else if space.narrow_write(size).is_some() {
            e.mov_reg_param(inst.size(), REG_PARAM3, &srcp);
            e.mov_imm(8, REG_PARAM4, bitmask(8 << size.log2()));
            self.emit_narrow_memwrite(e, &addrp, size, space);
        } else {
            e.mov_reg_param(4, REG_PARAM2, &addrp);
            e.mov_reg_param(inst.size(), REG_PARAM3, &srcp);
            let accessor = space.cfg.resolved.write[size as usize];
            self.emit_resolved_call(e, &accessor);
        }
    }

    pub(crate) fn op_writem(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = crate::flags::CarryState::Poison;

        let addrp = be_param(inst.param(0), PTYPE_MRI, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let maskp = be_param(inst.param(2), PTYPE_MRI, self.state);
        let size = inst.param(3).size();
        let space = self.space(inst.param(3).space());

        if let Some(side) = space.fast_side(size, true) {
            let side = *side;
            self.emit_memaccess_setup(e, &addrp, space, &side);
            e.mov_reg_param(inst.size(), REG_PARAM3, &srcp);
            if side.is_virtual {
                e.ldst_imm(LdSt::LDRX, DISPATCH_REG, REG_PARAM1, 0);
                e.ldst_imm(LdSt::LDRX, DISPATCH_REG, DISPATCH_REG, side.function as i64);
            }
            e.mov_reg_param(inst.size(), REG_PARAM4, &maskp);
            if side.is_virtual {
                e.blr(DISPATCH_REG);
            } else {
                e.call_abs(side.function as u64);
            }
        } else if space.narrow_write(size).is_some() {
            e.mov_reg_param(inst.size(), REG_PARAM3, &srcp);
            e.mov_reg_param(inst.size(), REG_PARAM4, &maskp);
            self.emit_narrow_memwrite(e, &addrp, size, space);
        } else {
            e.mov_reg_param(4, REG_PARAM2, &addrp);
            e.mov_reg_param(inst.size(), REG_PARAM3, &srcp);
            e.mov_reg_param(inst.size(), REG_PARAM4, &maskp);
            let accessor = space.cfg.resolved.write_masked[size as usize];
            self.emit_resolved_call(e, &accessor);
        }
    }

    /// Float read: route through the dword/qword resolved accessor and move
    /// the bits across register files.
    pub(crate) fn op_fread(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = crate::flags::CarryState::Poison;

        let dstp = be_param(inst.param(0), PTYPE_MF, self.state);
        let addrp = be_param(inst.param(1), PTYPE_MRI, self.state);
        let size = inst.param(2).size();
        assert_eq!(size.bytes(), inst.size());
        let space = self.space(inst.param(2).space());

        e.mov_reg_param(4, REG_PARAM2, &addrp);
        let accessor = space.cfg.resolved.read[size as usize];
        self.emit_resolved_call(e, &accessor);

        e.mov_float_param_int_reg(inst.size(), &dstp, REG_PARAM1);
    }

    pub(crate) fn op_fwrite(&mut self, e: &mut Emitter, inst: &Inst) {
        assert!(inst.size() == 4 || inst.size() == 8);
        assert_no_condition(inst);
        assert_no_flags(inst);

        e.carry = crate::flags::CarryState::Poison;

        let addrp = be_param(inst.param(0), PTYPE_MRI, self.state);
        let srcp = be_param(inst.param(1), PTYPE_MF, self.state);
        let size = inst.param(2).size();
        assert_eq!(size.bytes(), inst.size());
        let space = self.space(inst.param(2).space());

        e.mov_reg_param(4, REG_PARAM2, &addrp);
        e.mov_float_reg_param(inst.size(), TEMPF_REG1, &srcp);
        e.fmov_gf(inst.size(), REG_PARAM3, TEMPF_REG1);

        let accessor = space.cfg.resolved.write[size as usize];
        self.emit_resolved_call(e, &accessor);
    }
}
