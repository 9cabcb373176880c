//! Logical execution threads.
//!
//! Threads are engine-internal bookkeeping, not OS threads: an
//! external scheduler decides which one advances by calling
//! `step_thread`.

use super::frame::Frame;
use super::value::Value;

/// One independent execution context.
#[derive(Debug)]
pub struct ExecThread {
    pub id: u64,
    /// The runtime stack; the top entry is the executing frame.
    pub stack: Vec<Frame>,
    /// Written when the root frame returns.
    pub exit_value: Value,
    /// Arguments the thread was created with.
    pub init_args: Vec<Value>,
}

impl ExecThread {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            stack: Vec::new(),
            exit_value: Value::default(),
            init_args: Vec::new(),
        }
    }

    pub fn top(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }
}
