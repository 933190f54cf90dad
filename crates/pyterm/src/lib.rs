//! pyterm: run an interpreter on a worker thread behind a terminal.
//!
//! The worker gets a blocking stdin backed by a shared control block, a
//! cancellation flag it polls, and byte-level stdout/stderr sinks that are
//! reassembled into lines. The [`Session`] drives it all from async code.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod sanitize;
pub mod session;
pub mod stream;
pub mod worker;

pub use bridge::{BridgeError, INTERRUPT_SIGNAL};
pub use config::{ConfigError, SessionConfig};
pub use engine::{BootError, EngineFactory, ExecutionEngine, ExecutionError, ScriptEngine};
pub use protocol::{OutputEvent, RunId, RunReport, RunStatus};
pub use sanitize::{Sanitizer, SanitizerRules};
pub use session::{
    InputSource, Session, SessionError, SessionState, SessionStatus, TerminalDisplay,
};
pub use stream::{OutputSink, OutputWriter, StreamKind, StreamMultiplexer};

#[cfg(feature = "python")]
pub use engine::python::PythonEngine;
