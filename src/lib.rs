//! `ursa` — an AArch64 dynamic-recompilation back-end for the UML
//! intermediate machine language.
//!
//! The UML is a fixed, CPU-agnostic register machine used by emulator cores
//! to describe guest-CPU semantics. This crate lowers blocks of UML
//! instructions to native AArch64 code that executes directly on the host:
//! an entry trampoline enters generated code, a hashed (mode, PC) dispatch
//! table links blocks together, and lazily-bound code handles resolve
//! cross-block calls.
//!
//! ```no_run
//! use ursa::uml::{CodeHandle, Inst, Opcode, ireg};
//! use ursa::{Backend, Config};
//!
//! let mut backend = Backend::new(Config::new(1, 32, 2))?;
//!
//! let entry = CodeHandle::new("entry");
//! let block = [
//!     Inst::new(Opcode::Handle, 4).arg(entry.clone()),
//!     Inst::new(Opcode::Mov, 8).arg(ireg(0)).arg(0x1234_5678u64),
//!     Inst::new(Opcode::Exit, 4).arg(ireg(0)),
//! ];
//! backend.generate(&block)?;
//! assert_eq!(backend.execute(&entry), 0x1234_5678);
//! # Ok::<(), ursa::Error>(())
//! ```

pub mod backend;
pub mod cache;
pub mod emit;
pub mod flags;
pub mod hash;
pub mod jit_debug;
pub mod map;
pub mod mem;
pub mod param;
pub mod state;
pub mod uml;

mod alu;
mod control;
mod float;


pub use backend::{Backend, BackendInfo, Config, DebugHook};

/// Errors surfaced by the back-end. `CacheFull` is the only recoverable
/// case: flush the cache and regenerate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("assembler error: {0}")]
    Assembler(#[from] dynasmrt::DynasmError),
    #[error("code cache exhausted")]
    CacheFull,
    #[error("failed to map code cache: {0}")]
    CacheMap(std::io::Error),
}
