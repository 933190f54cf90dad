//! Synchronous cross-thread stdin bridge.
//!
//! Lets a worker thread perform a blocking "read a line" call whose answer is
//! produced asynchronously by the control side.
//!
//! # Architecture
//!
//! - **control_block**: fixed-layout shared region and the ticketed rendezvous
//! - **interrupt**: single shared byte polled by the engine for cancellation
//! - **stdin**: the zero-argument blocking read handed to engines

pub mod control_block;
pub mod interrupt;
pub mod stdin;

pub use control_block::{
    DEFAULT_CAPACITY, HEADER_BYTES, InputResponder, InputTicket, InputWaiter, WokenRead, allocate,
};
pub use interrupt::{INTERRUPT_SIGNAL, InterruptSource, InterruptTrigger};
pub use stdin::{RequestNotifier, StdinBridge};

/// Errors raised by the stdin rendezvous.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Capacity is too small or not a multiple of the word size.
    #[error(
        "invalid control block capacity {capacity}: must be a multiple of 4 and larger than {header} bytes",
        header = HEADER_BYTES
    )]
    InvalidCapacity { capacity: usize },

    /// A previous request has not been resolved yet.
    #[error("stdin request {outstanding} is still outstanding")]
    RequestOutstanding { outstanding: InputTicket },

    /// Response for a request that is not (or no longer) outstanding.
    #[error("no outstanding stdin request for ticket {ticket}")]
    StaleTicket { ticket: InputTicket },

    #[error("input of {len} bytes exceeds the {capacity}-byte stdin buffer")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("length word {len} exceeds payload capacity {capacity}")]
    CorruptLength { len: usize, capacity: usize },

    #[error("stdin payload is not valid UTF-8: {0}")]
    Decode(String),

    /// The wait was abandoned because a stop was requested.
    #[error("stdin read interrupted")]
    Interrupted,

    /// The control side is gone.
    #[error("control side disconnected")]
    Disconnected,
}
