//! Interrupt flag - a single shared byte for cooperative cancellation.
//!
//! The control side holds an [`InterruptTrigger`] (raise/clear), the engine
//! holds an [`InterruptSource`] (poll only). Nothing here blocks; the engine
//! decides how often it polls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Value stored in the flag when a stop has been requested (SIGINT).
pub const INTERRUPT_SIGNAL: u8 = 2;

/// Allocate a zeroed interrupt flag and split it into its two handles.
pub fn allocate() -> (InterruptTrigger, InterruptSource) {
    let byte = Arc::new(AtomicU8::new(0));
    (
        InterruptTrigger {
            byte: Arc::clone(&byte),
        },
        InterruptSource { byte },
    )
}

/// Control-side handle: sets and clears the flag.
#[derive(Debug, Clone)]
pub struct InterruptTrigger {
    byte: Arc<AtomicU8>,
}

impl InterruptTrigger {
    /// Request cancellation of the current run.
    pub fn raise(&self) {
        self.byte.store(INTERRUPT_SIGNAL, Ordering::SeqCst);
        tracing::debug!("Interrupt flag raised");
    }

    /// Reset to "continue". Called at the start of every run.
    pub fn clear(&self) {
        self.byte.store(0, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.byte.load(Ordering::SeqCst) == INTERRUPT_SIGNAL
    }

    /// A read-only handle for the engine side.
    pub fn source(&self) -> InterruptSource {
        InterruptSource {
            byte: Arc::clone(&self.byte),
        }
    }
}

/// Engine-side handle: polls the flag.
#[derive(Debug, Clone)]
pub struct InterruptSource {
    byte: Arc<AtomicU8>,
}

impl InterruptSource {
    /// Raw flag value: 0 to continue, [`INTERRUPT_SIGNAL`] when cancelled.
    pub fn poll(&self) -> u8 {
        self.byte.load(Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.poll() == INTERRUPT_SIGNAL
    }
}
