//! Execution engine contract.
//!
//! An engine runs source text and reports through four hooks installed by the
//! worker before every run: stdout and stderr sinks (one byte per call), a
//! blocking stdin hook, and the interrupt source it polls for cancellation.
//!
//! Engines are built on the worker thread by an [`EngineFactory`], so they do
//! not need to be `Send` themselves.

pub mod script;

#[cfg(feature = "python")]
pub mod python;

use crate::bridge::{BridgeError, InterruptSource};
use crate::stream::OutputSink;

pub use script::ScriptEngine;

/// Zero-argument blocking "give me the next line" hook.
pub type StdinHook = Box<dyn FnMut() -> Result<String, BridgeError> + Send>;

/// Builds the engine on the worker thread.
pub type EngineFactory =
    Box<dyn FnOnce() -> Result<Box<dyn ExecutionEngine>, BootError> + Send>;

pub trait ExecutionEngine {
    fn configure_stdout(&mut self, sink: Box<dyn OutputSink>);

    fn configure_stderr(&mut self, sink: Box<dyn OutputSink>);

    fn configure_stdin(&mut self, hook: StdinHook);

    fn configure_interrupt_source(&mut self, source: InterruptSource);

    /// Run `source` as if it were the file `filename`.
    fn execute(&mut self, source: &str, filename: &str) -> Result<(), ExecutionError>;

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "engine"
    }
}

/// Engine bootstrap errors. Terminal for the session until re-initialized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    /// The runtime could not be loaded.
    #[error("failed to load runtime: {message}")]
    Load { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BootError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Errors raised by `execute`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The program raised an error.
    #[error("{traceback}")]
    Raised { traceback: String },

    /// The program stopped because an interrupt was requested.
    #[error("{traceback}")]
    Interrupted { traceback: String },

    /// The engine itself failed (e.g. panicked).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ExecutionError {
    pub fn raised(traceback: impl Into<String>) -> Self {
        Self::Raised {
            traceback: traceback.into(),
        }
    }

    pub fn interrupted(traceback: impl Into<String>) -> Self {
        Self::Interrupted {
            traceback: traceback.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// User-facing error text.
    pub fn traceback(&self) -> String {
        match self {
            Self::Raised { traceback } | Self::Interrupted { traceback } => traceback.clone(),
            Self::Internal { .. } => self.to_string(),
        }
    }
}
