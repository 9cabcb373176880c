//! galena — the execution core of an LLVM-IR interpreter that drives
//! an external memory/provenance model (the *oracle*, e.g. Rust's
//! Miri).
//!
//! The engine interprets a materialized module instruction by
//! instruction, per logical thread, and forwards every observable
//! memory effect to the oracle through a fixed callback surface:
//! allocation, loads and stores, pointer arithmetic, integer/pointer
//! crossings, global registration and foreign calls. An external
//! scheduler drives execution with `step_thread`, feeding back the
//! results of foreign calls as pending return values.
//!
//! For C hosts, the `ffi` module exposes the same surface with
//! C-compatible types; `include/galena.h` is generated at build time.

pub mod apint;
pub mod ffi;
pub mod interp;
pub mod ir;
pub mod oracle;

pub use interp::{Engine, EngineError, MAIN_THREAD_ID, Value, ValueKind};
pub use oracle::{MIRI_POINTER_BIT_WIDTH, MiriPointer, MiriProvenance, NULL_PROVENANCE};
