//! The stepwise interpreter: values, frames, threads, the engine and
//! its per-opcode dispatch.

mod cast;
mod dispatch;
mod engine;
mod error;
mod frame;
mod intrinsics;
mod ops;
mod thread;
mod value;

pub use engine::{Engine, MAIN_THREAD_ID};
pub use error::{EngineError, TraceFrame};
pub use frame::{Frame, InstrRef};
pub use thread::ExecThread;
pub use value::{Value, ValueKind};
