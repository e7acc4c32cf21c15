//! End-to-end execution tests: generate real blocks, run them through the
//! entry trampoline, and check the UML-visible results.
#![cfg(target_arch = "aarch64")]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use ursa::mem::{
    Accessor, Endianness, ResolvedAccessors, SpaceConfig, SpecificAccessors, SpecificSide,
};
use ursa::uml::{
    CodeHandle, Cond, FLAG_C, FLAG_S, FLAG_U, FLAG_V, FLAG_Z, Inst, MemSize, Opcode, RoundMode,
    cfunc, freg, ireg, label, mapvar, mem, round, size, size_scale, size_space,
};
use ursa::{Backend, Config, DebugHook};

fn backend() -> Backend {
    Backend::new(Config::new(2, 32, 2)).unwrap()
}

/// Wrap a straight-line body in a HANDLE and run it.
fn run(backend: &mut Backend, body: Vec<Inst>) -> u32 {
    let entry = CodeHandle::new("test_entry");
    let mut block = vec![Inst::new(Opcode::Handle, 4).arg(entry.clone())];
    block.extend(body);
    backend.generate(&block).unwrap();
    backend.execute(&entry)
}

fn exit(param: impl Into<ursa::uml::Param>) -> Inst {
    Inst::new(Opcode::Exit, 4).arg(param)
}

// ─── Moves and exits ────────────────────────────────────────────────────────

#[test]
fn exit_returns_low_half_of_a_wide_mov() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(0x1234_5678_9abc_def0u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x9abc_def0);
}

#[test]
fn conditional_mov_selects_on_zero_flag() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(0u64),
            Inst::new(Opcode::Cmp, 4)
                .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
                .arg(5u64)
                .arg(5u64),
            Inst::new(Opcode::Mov, 8).cond(Cond::Z).arg(ireg(0)).arg(1u64),
            Inst::new(Opcode::Mov, 8).cond(Cond::NZ).arg(ireg(0)).arg(9u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 1);
}

// ─── Flag arithmetic ────────────────────────────────────────────────────────

#[test]
fn add_overflowing_dword_sets_carry_and_zero() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Add, 4)
                .flags(FLAG_C | FLAG_Z | FLAG_V | FLAG_S)
                .arg(ireg(0))
                .arg(0xffff_ffffu64)
                .arg(1u64),
            Inst::new(Opcode::Getflgs, 4)
                .arg(ireg(1))
                .arg((FLAG_C | FLAG_Z | FLAG_V | FLAG_S) as u64),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, (FLAG_C | FLAG_Z) as u32);
}

#[test]
fn subtract_below_zero_sets_carry() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Sub, 8).flags(FLAG_C).arg(ireg(0)).arg(0u64).arg(1u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_C as u64),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, FLAG_C as u32);
}

#[test]
fn addc_consumes_the_carry_from_a_prior_add() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Add, 4)
                .flags(FLAG_C)
                .arg(ireg(0))
                .arg(0xffff_ffffu64)
                .arg(1u64),
            Inst::new(Opcode::Addc, 4).flags(FLAG_C).arg(ireg(1)).arg(5u64).arg(7u64),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, 13);
}

#[test]
fn subb_consumes_the_borrow_from_a_prior_sub() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Sub, 4).flags(FLAG_C).arg(ireg(0)).arg(0u64).arg(1u64),
            Inst::new(Opcode::Subb, 4).flags(FLAG_C).arg(ireg(1)).arg(10u64).arg(3u64),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, 6);
}

#[test]
fn set_reflects_signed_and_unsigned_predicates() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Cmp, 4)
                .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
                .arg(1u64)
                .arg(2u64),
            Inst::new(Opcode::Set, 4).cond(Cond::L).arg(ireg(0)),
            Inst::new(Opcode::Set, 4).cond(Cond::C).arg(ireg(1)),
            Inst::new(Opcode::Set, 4).cond(Cond::NZ).arg(ireg(2)),
            Inst::new(Opcode::Set, 4).cond(Cond::GE).arg(ireg(3)),
            Inst::new(Opcode::Add, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            Inst::new(Opcode::Add, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(2)),
            Inst::new(Opcode::Add, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(3)),
            exit(ireg(0)),
        ],
    );
    // L, C (borrow) and NZ hold; GE does not.
    assert_eq!(result, 3);
}

#[test]
fn unrequested_flags_survive_an_unflagged_op() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Cmp, 4)
                .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
                .arg(7u64)
                .arg(7u64),
            // No flag request: must not disturb Z or C.
            Inst::new(Opcode::Add, 4).arg(ireg(0)).arg(0xffff_ffffu64).arg(1u64),
            Inst::new(Opcode::Shl, 4).arg(ireg(1)).arg(0x8000_0001u64).arg(1u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(2)).arg((FLAG_C | FLAG_Z) as u64),
            exit(ireg(2)),
        ],
    );
    assert_eq!(result, FLAG_Z as u32);
}

#[test]
fn setflgs_round_trips_through_getflgs() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Setflgs, 4).arg(0b10110u64),
            Inst::new(Opcode::Getflgs, 4)
                .arg(ireg(0))
                .arg((FLAG_C | FLAG_V | FLAG_Z | FLAG_S | FLAG_U) as u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0b10110);
}

#[test]
fn carry_op_seeds_the_carry_flag() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Carry, 4).flags(FLAG_C).arg(0b100u64).arg(2u64),
            Inst::new(Opcode::Addc, 4).flags(FLAG_C).arg(ireg(0)).arg(0u64).arg(0u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 1);
}

// ─── Control flow ───────────────────────────────────────────────────────────

#[test]
fn conditional_jumps_route_around_code() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Cmp, 4)
                .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
                .arg(5u64)
                .arg(5u64),
            Inst::new(Opcode::Jmp, 4).cond(Cond::Z).arg(label(1)),
            exit(111u64),
            Inst::new(Opcode::Label, 4).arg(label(1)),
            exit(222u64),
        ],
    );
    assert_eq!(result, 222);
}

#[test]
fn backward_jumps_loop() {
    let mut b = backend();
    // Count I0 down from 5, accumulating into I1.
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(5u64),
            Inst::new(Opcode::Mov, 4).arg(ireg(1)).arg(0u64),
            Inst::new(Opcode::Label, 4).arg(label(7)),
            Inst::new(Opcode::Add, 4).arg(ireg(1)).arg(ireg(1)).arg(ireg(0)),
            Inst::new(Opcode::Sub, 4)
                .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(ireg(0))
                .arg(1u64),
            Inst::new(Opcode::Jmp, 4).cond(Cond::NZ).arg(label(7)),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, 15);
}

#[test]
fn callh_and_ret_nest_inside_one_native_frame() {
    let mut b = backend();

    let sub = CodeHandle::new("sub");
    b.generate(&[
        Inst::new(Opcode::Handle, 4).arg(sub.clone()),
        Inst::new(Opcode::Mov, 4).arg(ireg(3)).arg(7u64),
        Inst::new(Opcode::Ret, 4),
    ])
    .unwrap();

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(3)).arg(0u64),
            Inst::new(Opcode::Callh, 4).arg(sub),
            exit(ireg(3)),
        ],
    );
    assert_eq!(result, 7);
}

#[test]
fn conditional_ret_is_skipped_when_condition_fails() {
    let mut b = backend();

    let sub = CodeHandle::new("sub_cond");
    b.generate(&[
        Inst::new(Opcode::Handle, 4).arg(sub.clone()),
        Inst::new(Opcode::Cmp, 4)
            .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
            .arg(1u64)
            .arg(2u64),
        Inst::new(Opcode::Ret, 4).cond(Cond::Z),
        Inst::new(Opcode::Mov, 4).arg(ireg(4)).arg(0x55u64),
        Inst::new(Opcode::Ret, 4),
    ])
    .unwrap();

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(4)).arg(0u64),
            Inst::new(Opcode::Callh, 4).arg(sub),
            exit(ireg(4)),
        ],
    );
    assert_eq!(result, 0x55);
}

#[test]
fn hashjmp_miss_reaches_the_exception_handle_with_exp_set() {
    let mut b = backend();

    let bad = CodeHandle::new("bad");
    b.generate(&[
        Inst::new(Opcode::Handle, 4).arg(bad.clone()),
        Inst::new(Opcode::Getexp, 4).arg(ireg(0)),
        exit(ireg(0)),
    ])
    .unwrap();

    let result = run(
        &mut b,
        vec![Inst::new(Opcode::Hashjmp, 4).arg(0u64).arg(0x1000u64).arg(bad)],
    );
    assert_eq!(result, 0x1000);
    assert_eq!(b.machine_state().exp, 0x1000);
}

#[test]
fn hashjmp_hits_registered_code() {
    let mut b = backend();

    // Target block registers itself for (0, 0x500).
    let target = CodeHandle::new("target");
    b.generate(&[
        Inst::new(Opcode::Handle, 4).arg(target),
        Inst::new(Opcode::Hash, 4).arg(0u64).arg(0x500u64),
        Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(0x77u64),
        exit(ireg(0)),
    ])
    .unwrap();
    assert!(b.hash_exists(0, 0x500));
    assert!(!b.hash_exists(0, 0x504));

    let bad = CodeHandle::new("bad");
    b.generate(&[
        Inst::new(Opcode::Handle, 4).arg(bad.clone()),
        exit(0xdeadu64),
    ])
    .unwrap();

    let result = run(
        &mut b,
        vec![Inst::new(Opcode::Hashjmp, 4).arg(0u64).arg(0x500u64).arg(bad)],
    );
    assert_eq!(result, 0x77);
}

#[test]
fn exh_stores_the_exception_parameter() {
    let mut b = backend();

    let handler = CodeHandle::new("handler");
    b.generate(&[
        Inst::new(Opcode::Handle, 4).arg(handler.clone()),
        Inst::new(Opcode::Getexp, 4).arg(ireg(0)),
        exit(ireg(0)),
    ])
    .unwrap();

    let result = run(
        &mut b,
        vec![
            // The NZ handler fires, the Z one is skipped.
            Inst::new(Opcode::Cmp, 4)
                .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
                .arg(1u64)
                .arg(2u64),
            Inst::new(Opcode::Exh, 4).cond(Cond::Z).arg(handler.clone()).arg(0x11u64),
            Inst::new(Opcode::Exh, 4).cond(Cond::NZ).arg(handler).arg(0x33u64),
            exit(0u64),
        ],
    );
    assert_eq!(result, 0x33);
}

static CALLC_SEEN: AtomicU32 = AtomicU32::new(0);

unsafe extern "C" fn callc_target(param: *mut core::ffi::c_void) {
    let value = unsafe { *(param as *const u32) };
    CALLC_SEEN.store(value, Ordering::SeqCst);
}

#[test]
fn callc_calls_out_and_preserves_emulated_flags() {
    let mut b = backend();
    let mut payload: u32 = 0xfeed;

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Carry, 4).flags(FLAG_C).arg(1u64).arg(0u64),
            Inst::new(Opcode::Callc, 4).arg(cfunc(callc_target)).arg(mem(&mut payload)),
            Inst::new(Opcode::Set, 4).cond(Cond::C).arg(ireg(0)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(CALLC_SEEN.load(Ordering::SeqCst), 0xfeed);
    assert_eq!(result, 1);
}

#[test]
fn recover_reads_the_map_variable_at_the_call_site() {
    let mut b = backend();

    let sub = CodeHandle::new("recover_sub");
    b.generate(&[
        Inst::new(Opcode::Handle, 4).arg(sub.clone()),
        Inst::new(Opcode::Recover, 4).arg(ireg(0)).arg(mapvar(0)),
        Inst::new(Opcode::Ret, 4),
    ])
    .unwrap();

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mapvar, 4).arg(mapvar(0)).arg(0xdeadu64),
            Inst::new(Opcode::Callh, 4).arg(sub),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0xdead);
}

static DEBUG_PC: AtomicU32 = AtomicU32::new(0);
static DEBUG_OBJ: AtomicUsize = AtomicUsize::new(0);

extern "C" fn debug_hook(obj: usize, pc: u32) {
    DEBUG_OBJ.store(obj, Ordering::SeqCst);
    DEBUG_PC.store(pc, Ordering::SeqCst);
}

#[test]
fn debug_opcode_calls_the_hook_when_enabled() {
    static DEBUG_FLAGS: AtomicU32 = AtomicU32::new(0b10);

    let mut config = Config::new(1, 32, 2);
    config.debug = Some(DebugHook {
        flags_ptr: DEBUG_FLAGS.as_ptr(),
        obj: 0x1234,
        func: debug_hook as usize,
    });
    let mut b = Backend::new(config).unwrap();

    let result = run(
        &mut b,
        vec![Inst::new(Opcode::Debug, 4).arg(0xc0deu64), exit(1u64)],
    );
    assert_eq!(result, 1);
    assert_eq!(DEBUG_PC.load(Ordering::SeqCst), 0xc0de);
    assert_eq!(DEBUG_OBJ.load(Ordering::SeqCst), 0x1234);

    // With the call-hook bit clear the hook must not fire.
    DEBUG_PC.store(0, Ordering::SeqCst);
    DEBUG_FLAGS.store(0, Ordering::SeqCst);
    let result = run(
        &mut b,
        vec![Inst::new(Opcode::Debug, 4).arg(0xbeefu64), exit(2u64)],
    );
    assert_eq!(result, 2);
    assert_eq!(DEBUG_PC.load(Ordering::SeqCst), 0);
}

// ─── State block ────────────────────────────────────────────────────────────

#[test]
fn save_restore_round_trips_bit_for_bit() {
    let mut b = backend();

    let mut src = ursa::state::MachineState::zeroed();
    for (index, slot) in src.r.iter_mut().enumerate() {
        *slot = 0x1111_1111_1111_1111u64.wrapping_mul(index as u64 + 1);
    }
    for (index, slot) in src.f.iter_mut().enumerate() {
        *slot = (index as f64 * 1.5).to_bits();
    }
    src.exp = 0xaabbccdd;
    src.fmod = 2;
    src.flags = 0b10101;

    let mut dst = ursa::state::MachineState::zeroed();

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Restore, 4).arg(mem(&mut src)),
            Inst::new(Opcode::Save, 4).arg(mem(&mut dst)),
            exit(0u64),
        ],
    );
    assert_eq!(result, 0);
    assert_eq!(dst.r, src.r);
    assert_eq!(dst.f, src.f);
    assert_eq!(dst.exp, src.exp);
    assert_eq!(dst.fmod, src.fmod);
    assert_eq!(dst.flags, src.flags);
}

#[test]
fn fmod_byte_round_trips() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Setfmod, 4).arg(6u64),
            Inst::new(Opcode::Getfmod, 4).arg(ireg(0)),
            exit(ireg(0)),
        ],
    );
    // Only the low two bits are significant.
    assert_eq!(result, 2);
}

// ─── Host-memory access ─────────────────────────────────────────────────────

#[test]
fn scaled_store_and_load_round_trip() {
    let mut b = backend();
    let mut buffer = [0u32; 8];

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Store, 4)
                .arg(mem(buffer.as_mut_ptr()))
                .arg(3u64)
                .arg(0x55aa_1234u64)
                .arg(size_scale(MemSize::Dword, 2)),
            Inst::new(Opcode::Load, 4)
                .arg(ireg(0))
                .arg(mem(buffer.as_mut_ptr()))
                .arg(3u64)
                .arg(size_scale(MemSize::Dword, 2)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x55aa_1234);
    assert_eq!(buffer[3], 0x55aa_1234);
}

#[test]
fn loads_sign_extends_a_byte() {
    let mut b = backend();
    let mut cell: u8 = 0x80;

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Loads, 4)
                .arg(ireg(0))
                .arg(mem(&mut cell))
                .arg(0u64)
                .arg(size_scale(MemSize::Byte, 0)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0xffff_ff80);
}

#[test]
fn sext_widens_through_register_sizes() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(0xff80u64),
            Inst::new(Opcode::Sext, 4).arg(ireg(1)).arg(ireg(0)).arg(size(MemSize::Byte)),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, 0xffff_ff80);
}

// ─── Guest-space access ─────────────────────────────────────────────────────

#[repr(C)]
struct TestRam {
    words: [u32; 64],
}

unsafe extern "C" fn ram_read_dword(obj: usize, addr: u32) -> u64 {
    let ram = unsafe { &*(obj as *const TestRam) };
    ram.words[(addr >> 2) as usize] as u64
}

unsafe extern "C" fn ram_write_dword(obj: usize, addr: u32, data: u64) {
    let ram = unsafe { &mut *(obj as *mut TestRam) };
    ram.words[(addr >> 2) as usize] = data as u32;
}

fn resolved_for(ram: &mut TestRam) -> ResolvedAccessors {
    let accessor = Accessor { obj: ram as *mut TestRam as usize, func: ram_read_dword as usize };
    let write = Accessor { obj: ram as *mut TestRam as usize, func: ram_write_dword as usize };
    ResolvedAccessors {
        read: [accessor; 4],
        read_masked: [accessor; 4],
        write: [write; 4],
        write_masked: [write; 4],
    }
}

#[test]
fn resolved_accessors_serve_read_and_write() {
    let mut ram = Box::new(TestRam { words: [0; 64] });
    let mut config = Config::new(1, 32, 2);
    config.spaces = vec![Some(SpaceConfig {
        addr_shift: 0,
        endianness: Endianness::Little,
        addr_mask: 0xff,
        resolved: resolved_for(&mut ram),
        specific: None,
    })];
    let mut b = Backend::new(config).unwrap();

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Write, 4)
                .arg(0x10u64)
                .arg(0xcafe_f00du64)
                .arg(size_space(MemSize::Dword, 0)),
            Inst::new(Opcode::Read, 4)
                .arg(ireg(0))
                .arg(0x10u64)
                .arg(size_space(MemSize::Dword, 0)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0xcafe_f00d);
    assert_eq!(ram.words[4], 0xcafe_f00d);
}

unsafe extern "C" fn handler_read(obj: usize, addr: u32, _mask: u64) -> u64 {
    unsafe { ram_read_dword(obj, addr) }
}

unsafe extern "C" fn handler_write(obj: usize, addr: u32, data: u64, mask: u64) {
    let ram = unsafe { &mut *(obj as *mut TestRam) };
    let slot = &mut ram.words[(addr >> 2) as usize];
    *slot = (*slot & !(mask as u32)) | (data as u32 & mask as u32);
}

#[test]
fn specific_fast_path_dispatches_and_narrow_writes_merge() {
    let mut ram = Box::new(TestRam { words: [0; 64] });
    let dispatch = Box::new([&mut *ram as *mut TestRam as usize]);

    let read_side = SpecificSide {
        dispatch: dispatch.as_ptr() as usize,
        function: handler_read as usize,
        displacement: 0,
        is_virtual: false,
    };
    let write_side = SpecificSide { function: handler_write as usize, ..read_side };

    let mut config = Config::new(1, 32, 2);
    config.spaces = vec![Some(SpaceConfig {
        addr_shift: 0,
        endianness: Endianness::Little,
        addr_mask: 0xff,
        resolved: resolved_for(&mut ram),
        specific: Some(SpecificAccessors {
            read: Some(read_side),
            write: Some(write_side),
            low_bits: 8,
            address_width: 8,
            native_mask_bits: 2,
            native_bytes: 4,
        }),
    })];
    let mut b = Backend::new(config).unwrap();

    ram.words[5] = 0xaabb_ccdd;
    let result = run(
        &mut b,
        vec![
            // Byte write into lane 1 of word 5 goes through the narrow path.
            Inst::new(Opcode::Write, 4)
                .arg(0x15u64)
                .arg(0x99u64)
                .arg(size_space(MemSize::Byte, 0)),
            Inst::new(Opcode::Read, 4)
                .arg(ireg(0))
                .arg(0x14u64)
                .arg(size_space(MemSize::Dword, 0)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0xaabb_99dd);
    drop(dispatch);
}

// ─── Multiplies, divides ────────────────────────────────────────────────────

#[test]
fn mulu_produces_the_high_half() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mulu, 8)
                .arg(ireg(0))
                .arg(ireg(1))
                .arg(1u64 << 32)
                .arg(1u64 << 33),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, 2);
}

#[test]
fn muls_flags_catch_signed_overflow() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Muls, 4)
                .flags(FLAG_V | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(ireg(0))
                .arg(0x4000_0000u64)
                .arg(4u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_V as u64),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, FLAG_V as u32);
}

#[test]
fn mululw_keeps_the_low_half_and_flags_overflow() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mululw, 4)
                .flags(FLAG_V | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(0x10000u64)
                .arg(0x10001u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_V as u64),
            Inst::new(Opcode::Add, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            exit(ireg(0)),
        ],
    );
    // Low half 0x10000, V set (product needed 33 bits).
    assert_eq!(result, 0x10000 + FLAG_V as u32);
}

#[test]
fn divide_computes_quotient_and_remainder() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Divu, 4).arg(ireg(0)).arg(ireg(1)).arg(17u64).arg(5u64),
            // quotient 3, remainder 2
            Inst::new(Opcode::Shl, 4).arg(ireg(0)).arg(ireg(0)).arg(8u64),
            Inst::new(Opcode::Or, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x302);
}

#[test]
fn divide_by_zero_sets_overflow_and_keeps_destinations() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(42u64),
            Inst::new(Opcode::Mov, 4).arg(ireg(4)).arg(0u64),
            Inst::new(Opcode::Divu, 4)
                .flags(FLAG_V | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(ireg(1))
                .arg(5u64)
                .arg(ireg(4)),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(2)).arg(FLAG_V as u64),
            Inst::new(Opcode::Add, 4).arg(ireg(2)).arg(ireg(2)).arg(ireg(0)),
            exit(ireg(2)),
        ],
    );
    assert_eq!(result, 42 + FLAG_V as u32);
}

#[test]
fn signed_divide_rounds_toward_zero() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(2)).arg(0xffff_fff9u64), // -7
            Inst::new(Opcode::Divs, 4).arg(ireg(0)).arg(ireg(1)).arg(ireg(2)).arg(2u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result as i32, -3);
}

// ─── Shifts and rotates ─────────────────────────────────────────────────────

#[test]
fn shl_carries_out_the_top_bit() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Shl, 4)
                .flags(FLAG_C | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(0x8000_0001u64)
                .arg(1u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_C as u64),
            Inst::new(Opcode::Shl, 4).arg(ireg(1)).arg(ireg(1)).arg(8u64),
            Inst::new(Opcode::Or, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            exit(ireg(0)),
        ],
    );
    // result 2 with carry 1 recorded in bits 8+
    assert_eq!(result, 0x102);
}

#[test]
fn shr_carries_out_the_low_bit() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Shr, 4)
                .flags(FLAG_C | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(0x5u64)
                .arg(1u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_C as u64),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, 1);
}

#[test]
fn sar_keeps_the_sign() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(2)).arg(0x8000_0000u64),
            Inst::new(Opcode::Sar, 4).arg(ireg(0)).arg(ireg(2)).arg(4u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0xf800_0000);
}

#[test]
fn variable_shift_masks_the_count() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(1)).arg(33u64),
            Inst::new(Opcode::Shl, 4).arg(ireg(0)).arg(3u64).arg(ireg(1)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 6);
}

#[test]
fn rol_rotates_left() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Rol, 4).arg(ireg(0)).arg(0x8000_0001u64).arg(4u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x18);
}

#[test]
fn rolc_rotates_through_the_carry() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Carry, 4).flags(FLAG_C).arg(1u64).arg(0u64),
            Inst::new(Opcode::Rolc, 4)
                .flags(FLAG_C | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(0x8000_0000u64)
                .arg(1u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_C as u64),
            Inst::new(Opcode::Shl, 4).arg(ireg(1)).arg(ireg(1)).arg(8u64),
            Inst::new(Opcode::Or, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            exit(ireg(0)),
        ],
    );
    // The old carry rotated in at the bottom; the old top bit became carry.
    assert_eq!(result, 0x101);
}

#[test]
fn rorc_rotates_right_through_the_carry() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Carry, 4).flags(FLAG_C).arg(1u64).arg(0u64),
            Inst::new(Opcode::Rorc, 4)
                .flags(FLAG_C | FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(1u64)
                .arg(1u64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_C as u64),
            Inst::new(Opcode::Shl, 4).arg(ireg(1)).arg(ireg(1)).arg(8u64),
            Inst::new(Opcode::Or, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x8000_0000 | 0x100);
}

#[test]
fn variable_rolc_handles_zero_and_one() {
    let mut b = backend();
    for (count, expected) in [(0u64, 0x8000_0000u32), (1, 1)] {
        let result = run(
            &mut b,
            vec![
                Inst::new(Opcode::Carry, 4).flags(FLAG_C).arg(1u64).arg(0u64),
                Inst::new(Opcode::Mov, 4).arg(ireg(1)).arg(count),
                Inst::new(Opcode::Rolc, 4)
                    .flags(FLAG_C | FLAG_Z | FLAG_S)
                    .arg(ireg(0))
                    .arg(0x8000_0000u64)
                    .arg(ireg(1)),
                exit(ireg(0)),
            ],
        );
        assert_eq!(result, expected, "count {count}");
    }
}

// ─── Bit ops ────────────────────────────────────────────────────────────────

#[test]
fn roland_extracts_a_rotated_field() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Roland, 4)
                .arg(ireg(0))
                .arg(0x1234_5678u64)
                .arg(8u64)
                .arg(0xffu64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x12);
}

#[test]
fn rolins_inserts_at_the_mask() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(0x1234_5678u64),
            Inst::new(Opcode::Rolins, 4)
                .arg(ireg(0))
                .arg(0xaau64)
                .arg(4u64)
                .arg(0xff0u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x1234_5aa8);
}

#[test]
fn rolins_general_path_matches_the_peephole() {
    let mut b = backend();
    // Same insert, but with the shift in a register to force the general
    // path.
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(0x1234_5678u64),
            Inst::new(Opcode::Mov, 4).arg(ireg(1)).arg(4u64),
            Inst::new(Opcode::Rolins, 4)
                .arg(ireg(0))
                .arg(0xaau64)
                .arg(ireg(1))
                .arg(0xff0u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x1234_5aa8);
}

#[test]
fn logic_ops_and_zero_flag() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::And, 4)
                .flags(FLAG_Z | FLAG_S)
                .arg(ireg(0))
                .arg(0xf0u64)
                .arg(0x0fu64),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(1)).arg(FLAG_Z as u64),
            Inst::new(Opcode::Or, 4).arg(ireg(2)).arg(0xf0u64).arg(0x0fu64),
            Inst::new(Opcode::Xor, 4).arg(ireg(3)).arg(ireg(2)).arg(0xffu64),
            Inst::new(Opcode::Add, 4).arg(ireg(1)).arg(ireg(1)).arg(ireg(2)),
            Inst::new(Opcode::Add, 4).arg(ireg(1)).arg(ireg(1)).arg(ireg(3)),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, FLAG_Z as u32 + 0xff);
}

#[test]
fn test_op_sets_zero_without_writing() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Test, 4).flags(FLAG_Z | FLAG_S).arg(0xf0u64).arg(0x0fu64),
            Inst::new(Opcode::Set, 4).cond(Cond::Z).arg(ireg(0)),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 1);
}

#[test]
fn bit_counts_and_byte_swap() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Lzcnt, 4).arg(ireg(0)).arg(0x0080_0000u64),
            Inst::new(Opcode::Tzcnt, 4).arg(ireg(1)).arg(0x0080_0000u64),
            Inst::new(Opcode::Bswap, 4).arg(ireg(2)).arg(0x1122_3344u64),
            Inst::new(Opcode::Shl, 4).arg(ireg(0)).arg(ireg(0)).arg(8u64),
            Inst::new(Opcode::Or, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(1)),
            Inst::new(Opcode::Shl, 4).arg(ireg(0)).arg(ireg(0)).arg(16u64),
            Inst::new(Opcode::Shr, 4).arg(ireg(2)).arg(ireg(2)).arg(16u64),
            Inst::new(Opcode::Or, 4).arg(ireg(0)).arg(ireg(0)).arg(ireg(2)),
            exit(ireg(0)),
        ],
    );
    // lzcnt 8, tzcnt 23, bswap high half 0x4433
    assert_eq!(result, (8 << 24) | (23 << 16) | 0x4433);
}

// ─── Floating point ─────────────────────────────────────────────────────────

#[test]
fn float_copy_round_trips_bit_patterns() {
    let mut b = backend();
    let bits = 2.718281828_f64.to_bits();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(bits),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
            Inst::new(Opcode::Icopyf, 8).arg(ireg(1)).arg(freg(0)),
            Inst::new(Opcode::Xor, 8)
                .flags(FLAG_Z | FLAG_S)
                .arg(ireg(2))
                .arg(ireg(0))
                .arg(ireg(1)),
            Inst::new(Opcode::Set, 4).cond(Cond::Z).arg(ireg(3)),
            exit(ireg(3)),
        ],
    );
    assert_eq!(result, 1);
}

#[test]
fn float_add_and_convert_to_int() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(2.5f64.to_bits()),
            Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(1.5f64.to_bits()),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(1)).arg(ireg(1)),
            Inst::new(Opcode::Fadd, 8).arg(freg(2)).arg(freg(0)).arg(freg(1)),
            Inst::new(Opcode::Ftoint, 8)
                .arg(ireg(2))
                .arg(freg(2))
                .arg(size(MemSize::Dword))
                .arg(round(RoundMode::Trunc)),
            exit(ireg(2)),
        ],
    );
    assert_eq!(result, 4);
}

#[test]
fn ftoint_rounding_modes_differ() {
    let mut b = backend();
    for (mode, expected) in [
        (RoundMode::Trunc, 2u32),
        (RoundMode::Floor, 2),
        (RoundMode::Ceil, 3),
        (RoundMode::Round, 2),
    ] {
        let result = run(
            &mut b,
            vec![
                Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(2.4f64.to_bits()),
                Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
                Inst::new(Opcode::Ftoint, 8)
                    .arg(ireg(1))
                    .arg(freg(0))
                    .arg(size(MemSize::Dword))
                    .arg(round(mode)),
                exit(ireg(1)),
            ],
        );
        assert_eq!(result, expected, "mode {mode:?}");
    }
}

#[test]
fn ffrint_and_back() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 4).arg(ireg(0)).arg(7u64),
            Inst::new(Opcode::Ffrint, 8).arg(freg(0)).arg(ireg(0)).arg(size(MemSize::Dword)),
            Inst::new(Opcode::Ftoint, 8)
                .arg(ireg(1))
                .arg(freg(0))
                .arg(size(MemSize::Dword))
                .arg(round(RoundMode::Trunc)),
            exit(ireg(1)),
        ],
    );
    assert_eq!(result, 7);
}

#[test]
fn frnds_collapses_double_precision() {
    let mut b = backend();
    let mut input: u64 = 1.1f64.to_bits();
    let mut output: u64 = 0;

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Frnds, 8).arg(mem(&mut output)).arg(mem(&mut input)),
            exit(0u64),
        ],
    );
    assert_eq!(result, 0);
    assert_eq!(f64::from_bits(output), 1.1f64 as f32 as f64);
}

#[test]
fn ffrflt_widens_single_to_double() {
    let mut b = backend();
    let mut input: u64 = (1.5f32.to_bits()) as u64;
    let mut output: u64 = 0;

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Ffrflt, 8)
                .arg(mem(&mut output))
                .arg(mem(&mut input))
                .arg(size(MemSize::Dword)),
            exit(0u64),
        ],
    );
    assert_eq!(result, 0);
    assert_eq!(f64::from_bits(output), 1.5);
}

#[test]
fn fcmp_with_nan_sets_unordered() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(f64::NAN.to_bits()),
            Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(1.0f64.to_bits()),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(1)).arg(ireg(1)),
            Inst::new(Opcode::Fcmp, 8)
                .flags(FLAG_C | FLAG_Z | FLAG_U)
                .arg(freg(0))
                .arg(freg(1)),
            Inst::new(Opcode::Getflgs, 4).arg(ireg(0)).arg(FLAG_U as u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, 0x10);
}

#[test]
fn fcmp_ordered_clears_unordered_and_compares() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(1.0f64.to_bits()),
            Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(2.0f64.to_bits()),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(1)).arg(ireg(1)),
            Inst::new(Opcode::Fcmp, 8)
                .flags(FLAG_C | FLAG_Z | FLAG_U)
                .arg(freg(0))
                .arg(freg(1)),
            // 1.0 < 2.0: borrow set, unordered clear.
            Inst::new(Opcode::Getflgs, 4)
                .arg(ireg(0))
                .arg((FLAG_C | FLAG_Z | FLAG_U) as u64),
            exit(ireg(0)),
        ],
    );
    assert_eq!(result, FLAG_C as u32);
}

#[test]
fn fmov_conditional_moves_on_flags() {
    let mut b = backend();
    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(3.0f64.to_bits()),
            Inst::new(Opcode::Mov, 8).arg(ireg(1)).arg(9.0f64.to_bits()),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(0)).arg(ireg(0)),
            Inst::new(Opcode::Fcopyi, 8).arg(freg(1)).arg(ireg(1)),
            Inst::new(Opcode::Cmp, 4)
                .flags(FLAG_C | FLAG_V | FLAG_Z | FLAG_S)
                .arg(1u64)
                .arg(1u64),
            Inst::new(Opcode::Fmov, 8).cond(Cond::Z).arg(freg(0)).arg(freg(1)),
            Inst::new(Opcode::Ftoint, 8)
                .arg(ireg(2))
                .arg(freg(0))
                .arg(size(MemSize::Dword))
                .arg(round(RoundMode::Trunc)),
            exit(ireg(2)),
        ],
    );
    assert_eq!(result, 9);
}

#[test]
fn fload_fstore_index_scaled_elements() {
    let mut b = backend();
    let mut table = [0u64; 4];
    let mut seed: u64 = 6.25f64.to_bits();

    let result = run(
        &mut b,
        vec![
            Inst::new(Opcode::Fload, 8).arg(freg(0)).arg(mem(&mut seed)).arg(0u64),
            Inst::new(Opcode::Fstore, 8)
                .arg(mem(table.as_mut_ptr()))
                .arg(2u64)
                .arg(freg(0)),
            exit(0u64),
        ],
    );
    assert_eq!(result, 0);
    assert_eq!(table[2], 6.25f64.to_bits());
}
