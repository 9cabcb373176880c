//! The materialized module model the interpreter consumes.
//!
//! The IR loader and parser are external collaborators; this module
//! defines the shape of their output: types with layout queries,
//! functions, blocks, SSA instructions, constants, globals, and the
//! builders used to materialize them.

mod build;
mod instr;
mod layout;
mod module;
mod types;

pub use build::{FunctionBuilder, ModuleBuilder};
pub use instr::{
    BinOp, BlockId, CallKind, CastOp, Constant, FloatPredicate, FuncId, GlobalId, Instr,
    InstrKind, IntPredicate, Operand, SourceLoc, ValueId,
};
pub use layout::{DataLayout, StructLayout};
pub use module::{Block, Function, GlobalVar, Module};
pub use types::{Type, TypeRef, layout_type};
