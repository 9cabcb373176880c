//! Engine errors and trace accumulation.

use thiserror::Error;

/// Why an interpretation path halted. Every variant is terminal for
/// the current path; the host decides whether to continue with other
/// threads.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A hook returned its error flag; the oracle has the details and
    /// received the stack trace.
    #[error("oracle-reported error: {0}")]
    Oracle(String),
    /// Unsupported or malformed IR reached the dispatcher.
    #[error("{0}")]
    Fatal(String),
    /// The host drove the engine incorrectly.
    #[error("{0}")]
    Misuse(String),
}

impl EngineError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        EngineError::Fatal(msg.into())
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        EngineError::Misuse(msg.into())
    }
}

/// One accumulated stack-trace entry, engine-owned. Borrowed views of
/// these are handed to the oracle's trace recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub directory: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}
