//! The back-end proper: block driver, trampolines, and public surface.
//!
//! `reset` builds the entry/exit/no-code/end-of-block trampolines at the
//! cache top; `generate` walks a UML instruction list, dispatches each
//! opcode through a flat generator table, and commits the assembled bytes;
//! `execute` enters generated code through the entry trampoline.

use std::collections::HashMap;
use std::sync::OnceLock;

use dynasmrt::{DynamicLabel, DynasmApi, dynasm};

use crate::Error;
use crate::cache::{Cache, cache_line_mask};
use crate::emit::{
    BASE_REG, Emitter, FLAGS_REG, FLOAT_REGISTER_MAP, INT_REGISTER_MAP, REG_PARAM1,
};
use crate::hash::HashTable;
use crate::map::MapVariables;
use crate::mem::{SpaceConfig, SpaceInfo};
use crate::state::{MachineState, NEAR_EMULATED_FLAGS, NearState, STATE_EXP, STATE_F, STATE_FMOD, STATE_R};
use crate::uml::{CodeHandle, Cond, Inst, Opcode};

/// Runtime hook into a host debugger: generated `DEBUG` opcodes test bit 1
/// of `*flags_ptr` and, when set, call `func(obj, pc)`.
#[derive(Debug, Clone, Copy)]
pub struct DebugHook {
    pub flags_ptr: *const u32,
    pub obj: usize,
    pub func: usize,
}

/// Counts of UML registers directly mapped to host registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    pub direct_iregs: u32,
    pub direct_fregs: u32,
}

/// Back-end construction parameters.
pub struct Config {
    pub cache_size: usize,
    /// Number of guest modes in the hash dispatch.
    pub modes: u32,
    pub addr_bits: u32,
    pub ignore_bits: u32,
    /// Guest address spaces, indexed by the space field of size+space
    /// parameters.
    pub spaces: Vec<Option<SpaceConfig>>,
    pub debug: Option<DebugHook>,
    /// Called by the `BREAK` opcode.
    pub break_hook: extern "C" fn(),
}

impl Config {
    pub fn new(modes: u32, addr_bits: u32, ignore_bits: u32) -> Self {
        Config {
            cache_size: 8 << 20,
            modes,
            addr_bits,
            ignore_bits,
            spaces: Vec::new(),
            debug: None,
            break_hook: default_break_hook,
        }
    }
}

extern "C" fn default_break_hook() {
    log::warn!("BREAK executed by generated code");
}

extern "C" fn end_of_block_abort() -> ! {
    eprintln!("ursa: fell off the end of a generated code block");
    std::process::abort();
}

type EntryFn = unsafe extern "C" fn(*const u8) -> u32;

pub struct Backend {
    cache: Cache,
    pub(crate) hash: HashTable,
    pub(crate) map: Box<MapVariables>,
    pub(crate) spaces: Vec<Option<SpaceInfo>>,
    pub(crate) debug: Option<DebugHook>,
    pub(crate) break_hook: extern "C" fn(),

    pub(crate) state: *mut MachineState,
    near: *mut NearState,
    baseptr: u64,

    entry: Option<EntryFn>,
    pub(crate) exit: u64,
    nocode: u64,
    endofblock: u64,

    labels: HashMap<u32, DynamicLabel>,
    line_mask: usize,
    jit_registrations: Vec<crate::jit_debug::JitRegistration>,
}

impl Backend {
    pub fn new(config: Config) -> Result<Self, Error> {
        let mut cache = Cache::new(config.cache_size)?;

        let near = cache.alloc_near(size_of::<NearState>()) as *mut NearState;
        let state = cache.alloc_near(size_of::<MachineState>()) as *mut MachineState;
        unsafe {
            near.write(NearState { emulated_flags: 0 });
            state.write(MachineState::zeroed());
        }

        // Offset the base pointer so short negative offsets are usable too.
        let baseptr = cache.near() as u64 + 0x100;

        let spaces = config.spaces.into_iter().map(|cfg| cfg.map(SpaceInfo::new)).collect();

        let mut backend = Backend {
            cache,
            hash: HashTable::new(config.modes as usize, config.addr_bits, config.ignore_bits),
            map: Box::new(MapVariables::new()),
            spaces,
            debug: config.debug,
            break_hook: config.break_hook,
            state,
            near,
            baseptr,
            entry: None,
            exit: 0,
            nocode: 0,
            endofblock: 0,
            labels: HashMap::new(),
            line_mask: cache_line_mask(),
            jit_registrations: Vec::new(),
        };
        backend.reset()?;
        Ok(backend)
    }

    /// Rebuild the trampolines at the current cache top and clear the hash
    /// table.
    pub fn reset(&mut self) -> Result<(), Error> {
        let dst = self.cache.top();
        let mut e = Emitter::new(dst as usize, self.baseptr);

        // Entry: a full non-leaf frame saving every callee-saved register,
        // then an indirect branch to the argument.
        let entry_offset = 0usize;
        dynasm!(e.a
            ; .arch aarch64
            ; sub sp, sp, #160
            ; stp x29, x30, [sp]
            ; add x29, sp, #0
            ; stp x19, x20, [sp, #16]
            ; stp x21, x22, [sp, #32]
            ; stp x23, x24, [sp, #48]
            ; stp x25, x26, [sp, #64]
            ; stp x27, x28, [sp, #80]
            ; stp d8, d9, [sp, #96]
            ; stp d10, d11, [sp, #112]
            ; stp d12, d13, [sp, #128]
            ; stp d14, d15, [sp, #144]
        );
        e.mov_imm_abs(8, BASE_REG, self.baseptr);
        e.ldr_mem(4, FLAGS_REG, self.flags_slot_addr());
        e.br(REG_PARAM1);

        // Exit: unwind to the entry frame and restore.
        let exit_offset = e.a.offset().0;
        e.mov_sp_fp();
        dynasm!(e.a
            ; .arch aarch64
            ; ldp x19, x20, [sp, #16]
            ; ldp x21, x22, [sp, #32]
            ; ldp x23, x24, [sp, #48]
            ; ldp x25, x26, [sp, #64]
            ; ldp x27, x28, [sp, #80]
            ; ldp d8, d9, [sp, #96]
            ; ldp d10, d11, [sp, #112]
            ; ldp d12, d13, [sp, #128]
            ; ldp d14, d15, [sp, #144]
            ; ldp x29, x30, [sp]
            ; add sp, sp, #160
            ; ret
        );

        // No-code: the hash default target. A failed hash jump left its
        // continuation address in the first parameter register.
        let nocode_offset = e.a.offset().0;
        e.br(REG_PARAM1);

        // End-of-block: reaching this is a generator bug.
        let endofblock_offset = e.a.offset().0;
        e.call_abs(end_of_block_abort as usize as u64);

        let bytes = e.finalize()?;
        let ptr = self.cache.begin_codegen(bytes.len()).ok_or(Error::CacheFull)?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        self.cache.end_codegen(bytes.len());

        let base = dst as u64;
        self.entry = Some(unsafe { std::mem::transmute::<*mut u8, EntryFn>(dst.add(entry_offset)) });
        self.exit = base + exit_offset as u64;
        self.nocode = base + nocode_offset as u64;
        self.endofblock = base + endofblock_offset as u64;

        self.hash.reset(self.nocode as *const u8);

        if jit_debug_enabled() {
            self.jit_registrations.push(crate::jit_debug::register_jit_code(
                dst,
                bytes.len(),
                &[crate::jit_debug::JitSymbolEntry {
                    name: "ursa_trampolines".into(),
                    offset: 0,
                    size: bytes.len(),
                }],
            ));
        }

        log::debug!("trampolines rebuilt at {base:#x} ({} bytes)", bytes.len());
        Ok(())
    }

    /// Discard all generated code and rebuild the trampolines. Code handles
    /// and previously returned entry points become invalid; the front-end
    /// must regenerate everything.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.cache.flush();
        self.reset()
    }

    /// Translate a block of UML instructions and commit it to the cache.
    ///
    /// `Error::CacheFull` means nothing was committed: flush and retry.
    /// Anything else is a fatal assembler error.
    pub fn generate(&mut self, instructions: &[Inst]) -> Result<(), Error> {
        assert!(self.entry.is_some(), "generate before reset");

        self.hash.block_begin();
        self.map.block_begin();
        self.labels.clear();

        let dst = self.cache.aligned_top(self.line_mask);
        let mut e = Emitter::new(dst as usize, self.baseptr);

        for inst in instructions {
            let index = inst.opcode() as usize;
            assert!(index < Opcode::COUNT, "opcode out of range");
            log::trace!("generating {:?} (size {})", inst.opcode(), inst.size());
            opcode_table()[index](&mut *self, &mut e, inst);
        }

        // Falling off the end of a block is a generator bug; route it to
        // the aborting stub.
        e.b_abs(self.endofblock);

        let bytes = e.finalize()?;
        let padding = dst as usize - self.cache.top() as usize;

        let Some(_) = self.cache.begin_codegen(padding + bytes.len()) else {
            return Err(Error::CacheFull);
        };
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        self.cache.end_codegen(padding + bytes.len());

        self.hash.block_end();
        self.map.block_end();

        if jit_debug_enabled() {
            self.jit_registrations.push(crate::jit_debug::register_jit_code(
                dst,
                bytes.len(),
                &[crate::jit_debug::JitSymbolEntry {
                    name: format!("ursa_block_{:x}", dst as usize),
                    offset: 0,
                    size: bytes.len(),
                }],
            ));
        }

        if log_blocks() {
            log::trace!(
                "block committed at {:#x}: {} instructions, {} bytes",
                dst as usize,
                instructions.len(),
                bytes.len()
            );
        }
        log::debug!("generated block of {} instructions ({} bytes)", instructions.len(), bytes.len());
        Ok(())
    }

    /// Run generated code starting at the handle's target; returns the
    /// value the executed `EXIT` passed.
    pub fn execute(&mut self, entry: &CodeHandle) -> u32 {
        self.cache.codegen_complete();
        let code = entry.codeptr();
        assert!(!code.is_null(), "executing an unbound handle");
        let entry_fn = self.entry.expect("execute before reset");
        unsafe { entry_fn(code) }
    }

    pub fn hash_exists(&self, mode: u32, pc: u32) -> bool {
        self.hash.code_exists(mode, pc)
    }

    pub fn get_info(&self) -> BackendInfo {
        let direct_iregs =
            INT_REGISTER_MAP.iter().take_while(|&&reg| reg != 0).count() as u32;
        let direct_fregs =
            FLOAT_REGISTER_MAP.iter().take_while(|&&reg| reg != 0).count() as u32;
        BackendInfo { direct_iregs, direct_fregs }
    }

    /// The UML-visible machine state.
    pub fn machine_state(&self) -> &MachineState {
        unsafe { &*self.state }
    }

    pub fn machine_state_mut(&mut self) -> &mut MachineState {
        unsafe { &mut *self.state }
    }

    /// Persisted emulated-flags word (C and U bits), for tests and
    /// diagnostics.
    pub fn emulated_flags(&self) -> u32 {
        unsafe { (*self.near).emulated_flags }
    }

    pub fn set_emulated_flags(&mut self, value: u32) {
        unsafe { (*self.near).emulated_flags = value };
    }

    // ── Support for the generator modules ───────────────────────────────

    pub(crate) fn baseptr(&self) -> u64 {
        self.baseptr
    }

    pub(crate) fn space(&self, index: usize) -> &SpaceInfo {
        self.spaces
            .get(index)
            .and_then(|space| space.as_ref())
            .unwrap_or_else(|| panic!("no address space {index}"))
    }

    pub(crate) fn find_label(&mut self, e: &mut Emitter, id: u32) -> DynamicLabel {
        *self.labels.entry(id).or_insert_with(|| e.new_label())
    }

    pub(crate) fn flags_slot_addr(&self) -> u64 {
        self.near as u64 + NEAR_EMULATED_FLAGS as u64
    }

    pub(crate) fn state_exp_addr(&self) -> u64 {
        self.state as u64 + STATE_EXP as u64
    }

    pub(crate) fn state_fmod_addr(&self) -> u64 {
        self.state as u64 + STATE_FMOD as u64
    }

    pub(crate) fn state_reg_addr(&self, regnum: usize) -> u64 {
        self.state as u64 + (STATE_R + 8 * regnum) as u64
    }

    pub(crate) fn state_freg_addr(&self, regnum: usize) -> u64 {
        self.state as u64 + (STATE_F + 8 * regnum) as u64
    }
}

// ─── Instruction-shape assertions ───────────────────────────────────────────

pub(crate) fn assert_no_condition(inst: &Inst) {
    assert!(inst.condition() == Cond::Always, "{:?} cannot be conditional", inst.opcode());
}

pub(crate) fn assert_any_condition(_inst: &Inst) {}

pub(crate) fn assert_no_flags(inst: &Inst) {
    assert!(inst.flag_mask() == 0, "{:?} cannot update flags", inst.opcode());
}

pub(crate) fn assert_flags(inst: &Inst, valid: u8) {
    assert!(
        inst.flag_mask() & !valid == 0,
        "{:?} updates unsupported flags {:#x}",
        inst.opcode(),
        inst.flag_mask()
    );
}

// ─── Opcode dispatch ────────────────────────────────────────────────────────

type OpGen = fn(&mut Backend, &mut Emitter, &Inst);

fn gen_add(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_add(e, i, false)
}
fn gen_addc(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_add(e, i, true)
}
fn gen_sub(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_sub(e, i, false)
}
fn gen_subb(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_sub(e, i, true)
}
fn gen_divu(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_div(e, i, false)
}
fn gen_divs(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_div(e, i, true)
}
fn gen_shl(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_shift(e, i, crate::alu::ShiftKind::Lsl)
}
fn gen_shr(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_shift(e, i, crate::alu::ShiftKind::Lsr)
}
fn gen_sar(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_shift(e, i, crate::alu::ShiftKind::Asr)
}
fn gen_ror(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_shift(e, i, crate::alu::ShiftKind::Ror)
}
fn gen_fadd(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu3(e, i, crate::float::FpAlu3::Add)
}
fn gen_fsub(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu3(e, i, crate::float::FpAlu3::Sub)
}
fn gen_fmul(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu3(e, i, crate::float::FpAlu3::Mul)
}
fn gen_fdiv(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu3(e, i, crate::float::FpAlu3::Div)
}
fn gen_fneg(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu2(e, i, crate::float::FpAlu2::Neg)
}
fn gen_fabs(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu2(e, i, crate::float::FpAlu2::Abs)
}
fn gen_fsqrt(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu2(e, i, crate::float::FpAlu2::Sqrt)
}
fn gen_frecip(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu2(e, i, crate::float::FpAlu2::Recip)
}
fn gen_frsqrt(b: &mut Backend, e: &mut Emitter, i: &Inst) {
    b.op_fp_alu2(e, i, crate::float::FpAlu2::Rsqrt)
}

/// Source entries for the dispatch table; order is irrelevant, every opcode
/// must appear exactly once.
static OPCODE_TABLE_SOURCE: &[(Opcode, OpGen)] = &[
    // Compile-time opcodes
    (Opcode::Handle, Backend::op_handle),
    (Opcode::Hash, Backend::op_hash),
    (Opcode::Label, Backend::op_label),
    (Opcode::Comment, Backend::op_comment),
    (Opcode::Mapvar, Backend::op_mapvar),
    // Control flow
    (Opcode::Nop, Backend::op_nop),
    (Opcode::Break, Backend::op_break),
    (Opcode::Debug, Backend::op_debug),
    (Opcode::Exit, Backend::op_exit),
    (Opcode::Hashjmp, Backend::op_hashjmp),
    (Opcode::Jmp, Backend::op_jmp),
    (Opcode::Exh, Backend::op_exh),
    (Opcode::Callh, Backend::op_callh),
    (Opcode::Ret, Backend::op_ret),
    (Opcode::Callc, Backend::op_callc),
    (Opcode::Recover, Backend::op_recover),
    // Internal registers
    (Opcode::Setfmod, Backend::op_setfmod),
    (Opcode::Getfmod, Backend::op_getfmod),
    (Opcode::Getexp, Backend::op_getexp),
    (Opcode::Getflgs, Backend::op_getflgs),
    (Opcode::Setflgs, Backend::op_setflgs),
    (Opcode::Save, Backend::op_save),
    (Opcode::Restore, Backend::op_restore),
    // Integer operations
    (Opcode::Load, Backend::op_load),
    (Opcode::Loads, Backend::op_loads),
    (Opcode::Store, Backend::op_store),
    (Opcode::Read, Backend::op_read),
    (Opcode::Readm, Backend::op_readm),
    (Opcode::Write, Backend::op_write),
    (Opcode::Writem, Backend::op_writem),
    (Opcode::Carry, Backend::op_carry),
    (Opcode::Set, Backend::op_set),
    (Opcode::Mov, Backend::op_mov),
    (Opcode::Sext, Backend::op_sext),
    (Opcode::Roland, Backend::op_roland),
    (Opcode::Rolins, Backend::op_rolins),
    (Opcode::Add, gen_add),
    (Opcode::Addc, gen_addc),
    (Opcode::Sub, gen_sub),
    (Opcode::Subb, gen_subb),
    (Opcode::Cmp, Backend::op_cmp),
    (Opcode::Mulu, Backend::op_mulu),
    (Opcode::Mululw, Backend::op_mululw),
    (Opcode::Muls, Backend::op_muls),
    (Opcode::Mulslw, Backend::op_mulslw),
    (Opcode::Divu, gen_divu),
    (Opcode::Divs, gen_divs),
    (Opcode::And, Backend::op_and),
    (Opcode::Test, Backend::op_test),
    (Opcode::Or, Backend::op_or),
    (Opcode::Xor, Backend::op_xor),
    (Opcode::Lzcnt, Backend::op_lzcnt),
    (Opcode::Tzcnt, Backend::op_tzcnt),
    (Opcode::Bswap, Backend::op_bswap),
    (Opcode::Shl, gen_shl),
    (Opcode::Shr, gen_shr),
    (Opcode::Sar, gen_sar),
    (Opcode::Rol, Backend::op_rol),
    (Opcode::Rolc, Backend::op_rolc),
    (Opcode::Ror, gen_ror),
    (Opcode::Rorc, Backend::op_rorc),
    // Float operations
    (Opcode::Fload, Backend::op_fload),
    (Opcode::Fstore, Backend::op_fstore),
    (Opcode::Fread, Backend::op_fread),
    (Opcode::Fwrite, Backend::op_fwrite),
    (Opcode::Fmov, Backend::op_fmov),
    (Opcode::Ftoint, Backend::op_ftoint),
    (Opcode::Ffrint, Backend::op_ffrint),
    (Opcode::Ffrflt, Backend::op_ffrflt),
    (Opcode::Frnds, Backend::op_frnds),
    (Opcode::Fadd, gen_fadd),
    (Opcode::Fsub, gen_fsub),
    (Opcode::Fcmp, Backend::op_fcmp),
    (Opcode::Fmul, gen_fmul),
    (Opcode::Fdiv, gen_fdiv),
    (Opcode::Fneg, gen_fneg),
    (Opcode::Fabs, gen_fabs),
    (Opcode::Fsqrt, gen_fsqrt),
    (Opcode::Frecip, gen_frecip),
    (Opcode::Frsqrt, gen_frsqrt),
    (Opcode::Fcopyi, Backend::op_fcopyi),
    (Opcode::Icopyf, Backend::op_icopyf),
];

fn unassigned_opcode(_b: &mut Backend, _e: &mut Emitter, inst: &Inst) {
    panic!("opcode {:?} has no generator", inst.opcode());
}

fn opcode_table() -> &'static [OpGen; Opcode::COUNT] {
    static TABLE: OnceLock<[OpGen; Opcode::COUNT]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: [OpGen; Opcode::COUNT] = [unassigned_opcode; Opcode::COUNT];
        for &(opcode, func) in OPCODE_TABLE_SOURCE {
            table[opcode as usize] = func;
        }
        table
    })
}

fn log_blocks() -> bool {
    static KNOB: OnceLock<bool> = OnceLock::new();
    *KNOB.get_or_init(|| std::env::var_os("URSA_LOG_BLOCKS").is_some())
}

fn jit_debug_enabled() -> bool {
    static KNOB: OnceLock<bool> = OnceLock::new();
    *KNOB.get_or_init(|| std::env::var_os("URSA_JIT_DEBUG").is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_covers_every_opcode() {
        assert_eq!(OPCODE_TABLE_SOURCE.len(), Opcode::COUNT);
        let table = opcode_table();
        for (index, &func) in table.iter().enumerate() {
            assert!(
                func != unassigned_opcode as OpGen,
                "opcode index {index} has no generator"
            );
        }
    }

    #[test]
    fn backend_reports_fully_direct_register_maps() {
        let backend = Backend::new(Config::new(1, 32, 2)).unwrap();
        let info = backend.get_info();
        assert_eq!(info, BackendInfo { direct_iregs: 8, direct_fregs: 8 });
    }

    #[test]
    fn reset_rebuilds_trampolines_and_clears_hash() {
        let mut backend = Backend::new(Config::new(1, 32, 2)).unwrap();
        backend.hash.set_codeptr(0, 0x1234, 0x8000 as *const u8);
        assert!(backend.hash_exists(0, 0x1234));
        backend.flush().unwrap();
        assert!(!backend.hash_exists(0, 0x1234));
    }
}
