//! Shared control block - the single-slot stdin rendezvous.
//!
//! Binary layout (identical for both handles):
//!
//! ```text
//! offset 0  wake word    u32, bumped by the control side to release the worker
//! offset 4  length word  u32, byte length of the payload
//! offset 8  payload      UTF-8 bytes, `capacity - 8` bytes available
//! ```
//!
//! Words are stored little-endian. The wake word is the only field both sides
//! touch concurrently; the payload and length are written by the control side
//! strictly before the wake word is bumped (release) and read by the worker
//! strictly after it observes the bump (acquire).
//!
//! The mutex/condvar pair is the wait/notify primitive. It also guards the
//! ticket bookkeeping that enforces "one outstanding request".

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::BridgeError;
use super::interrupt::InterruptSource;

/// Word index of the wake word.
pub const WAKE_INDEX: usize = 0;
/// Word index of the payload length.
pub const LENGTH_INDEX: usize = 1;
/// Byte offset of the payload (size of the header).
pub const HEADER_BYTES: usize = 8;
/// Default block size in bytes, header included.
pub const DEFAULT_CAPACITY: usize = 1024;

const WORD_BYTES: usize = 4;

/// Identifies one stdin request. Responses must quote the ticket of the
/// request they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputTicket(u64);

impl InputTicket {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InputTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Rendezvous {
    next_ticket: u64,
    outstanding: Option<u64>,
    answered: bool,
}

struct ControlBlock {
    words: Box<[AtomicU32]>,
    rendezvous: Mutex<Rendezvous>,
    wakeup: Condvar,
}

impl ControlBlock {
    fn capacity(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    fn payload_capacity(&self) -> usize {
        self.capacity() - HEADER_BYTES
    }

    fn wake_word(&self) -> &AtomicU32 {
        &self.words[WAKE_INDEX]
    }

    fn length_word(&self) -> &AtomicU32 {
        &self.words[LENGTH_INDEX]
    }

    fn payload_words(&self) -> &[AtomicU32] {
        &self.words[HEADER_BYTES / WORD_BYTES..]
    }

    fn write_payload(&self, bytes: &[u8]) {
        for (word, chunk) in self.payload_words().iter().zip(bytes.chunks(WORD_BYTES)) {
            let mut buf = [0u8; WORD_BYTES];
            buf[..chunk.len()].copy_from_slice(chunk);
            word.store(u32::from_le_bytes(buf), Ordering::Relaxed);
        }
    }

    fn read_payload(&self, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len + WORD_BYTES);
        for word in self.payload_words() {
            if bytes.len() >= len {
                break;
            }
            bytes.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    fn lock(&self) -> MutexGuard<'_, Rendezvous> {
        self.rendezvous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Allocate a zero-initialized control block of `capacity` bytes and split it
/// into the control-side [`InputResponder`] and the worker-side [`InputWaiter`].
///
/// Must happen before the worker is given its handle.
pub fn allocate(capacity: usize) -> Result<(InputResponder, InputWaiter), BridgeError> {
    if capacity <= HEADER_BYTES
        || capacity % WORD_BYTES != 0
        || capacity > u32::MAX as usize
    {
        return Err(BridgeError::InvalidCapacity { capacity });
    }

    let words = (0..capacity / WORD_BYTES)
        .map(|_| AtomicU32::new(0))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let block = Arc::new(ControlBlock {
        words,
        rendezvous: Mutex::new(Rendezvous::default()),
        wakeup: Condvar::new(),
    });
    tracing::debug!(capacity, "Allocated stdin control block");

    Ok((
        InputResponder {
            block: Arc::clone(&block),
        },
        InputWaiter {
            block,
            interrupts: None,
        },
    ))
}

/// Control-side handle: writes responses and wakes the worker.
pub struct InputResponder {
    block: Arc<ControlBlock>,
}

impl InputResponder {
    /// Bytes available for a response payload.
    pub fn payload_capacity(&self) -> usize {
        self.block.payload_capacity()
    }

    /// Answer the outstanding request identified by `ticket` with `text`.
    ///
    /// Payload and length are written before the wake word is bumped, so the
    /// worker never observes a wake-up with a half-written payload. Oversized
    /// text is rejected, never truncated; the request stays outstanding.
    pub fn fulfill(&self, ticket: InputTicket, text: &str) -> Result<(), BridgeError> {
        let bytes = text.as_bytes();
        {
            let mut rendezvous = self.block.lock();
            if rendezvous.outstanding != Some(ticket.0) || rendezvous.answered {
                return Err(BridgeError::StaleTicket { ticket });
            }

            let capacity = self.block.payload_capacity();
            if bytes.len() > capacity {
                return Err(BridgeError::PayloadTooLarge {
                    len: bytes.len(),
                    capacity,
                });
            }

            self.block.write_payload(bytes);
            self.block
                .length_word()
                .store(bytes.len() as u32, Ordering::Relaxed);
            self.block.wake_word().fetch_add(1, Ordering::Release);
            rendezvous.answered = true;
        }
        self.block.wakeup.notify_one();

        tracing::trace!(%ticket, bytes = bytes.len(), "Fulfilled stdin request");
        Ok(())
    }

    /// Bump the wake word without writing a payload.
    ///
    /// A worker woken this way abandons its request with
    /// [`BridgeError::Interrupted`]. Harmless when nobody is waiting.
    pub fn wake(&self) {
        {
            let _rendezvous = self.block.lock();
            self.block.wake_word().fetch_add(1, Ordering::Release);
        }
        self.block.wakeup.notify_all();
    }

    /// Per-run reset: zero the length word. The wake word is left alone.
    pub fn reset(&self) {
        self.block.length_word().store(0, Ordering::Release);
    }

    pub fn has_outstanding(&self) -> bool {
        self.block.lock().outstanding.is_some()
    }

    /// Copy of the raw block bytes in layout order.
    pub fn snapshot(&self) -> Vec<u8> {
        self.block
            .words
            .iter()
            .flat_map(|word| word.load(Ordering::Acquire).to_le_bytes())
            .collect()
    }
}

/// Worker-side handle: issues requests, blocks, reads responses.
pub struct InputWaiter {
    block: Arc<ControlBlock>,
    interrupts: Option<InterruptSource>,
}

impl InputWaiter {
    /// Abandon waits when this source reports a stop request.
    pub fn with_interrupts(mut self, interrupts: InterruptSource) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub fn payload_capacity(&self) -> usize {
        self.block.payload_capacity()
    }

    /// Register a request, announce it through `notify`, then block until the
    /// wake word changes.
    ///
    /// The wake value is sampled before `notify` runs, so a response that
    /// arrives before the wait starts is not lost. Fails fast with
    /// [`BridgeError::RequestOutstanding`] while a previous request is
    /// unresolved, and with [`BridgeError::Interrupted`] without notifying
    /// anyone if a stop is already requested.
    pub fn begin_request<F>(&self, notify: F) -> Result<WokenRead<'_>, BridgeError>
    where
        F: FnOnce(InputTicket) -> Result<(), BridgeError>,
    {
        // A stop already raised must not consume a line from the control side.
        if self.interrupt_requested() {
            return Err(BridgeError::Interrupted);
        }

        let (ticket, observed) = {
            let mut rendezvous = self.block.lock();
            if let Some(outstanding) = rendezvous.outstanding {
                return Err(BridgeError::RequestOutstanding {
                    outstanding: InputTicket(outstanding),
                });
            }
            rendezvous.next_ticket += 1;
            rendezvous.outstanding = Some(rendezvous.next_ticket);
            rendezvous.answered = false;
            (
                InputTicket(rendezvous.next_ticket),
                self.block.wake_word().load(Ordering::Acquire),
            )
        };
        // Ends the request on every exit path from here on.
        let read = WokenRead {
            block: &self.block,
            ticket,
        };

        notify(ticket)?;
        tracing::trace!(%ticket, "Waiting for stdin response");
        self.wait_for_wake(observed)?;
        Ok(read)
    }

    fn wait_for_wake(&self, observed: u32) -> Result<(), BridgeError> {
        let mut rendezvous = self.block.lock();
        while self.block.wake_word().load(Ordering::Acquire) == observed
            && !self.interrupt_requested()
        {
            rendezvous = self
                .block
                .wakeup
                .wait(rendezvous)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if self.interrupt_requested() || !rendezvous.answered {
            return Err(BridgeError::Interrupted);
        }
        Ok(())
    }

    fn interrupt_requested(&self) -> bool {
        self.interrupts
            .as_ref()
            .is_some_and(InterruptSource::is_requested)
    }
}

/// A request whose response has arrived but has not been read yet.
///
/// The request stays outstanding until this guard is resolved or dropped.
pub struct WokenRead<'a> {
    block: &'a ControlBlock,
    ticket: InputTicket,
}

impl WokenRead<'_> {
    pub fn ticket(&self) -> InputTicket {
        self.ticket
    }

    /// Read and decode the payload.
    pub fn resolve(self) -> Result<String, BridgeError> {
        let len = self.block.length_word().load(Ordering::Acquire) as usize;
        let capacity = self.block.payload_capacity();
        if len > capacity {
            return Err(BridgeError::CorruptLength { len, capacity });
        }

        let bytes = self.block.read_payload(len);
        String::from_utf8(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
    }
}

impl Drop for WokenRead<'_> {
    fn drop(&mut self) {
        let mut rendezvous = self.block.lock();
        if rendezvous.outstanding == Some(self.ticket.0) {
            rendezvous.outstanding = None;
            rendezvous.answered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::bridge::interrupt;

    fn ok(_: InputTicket) -> Result<(), BridgeError> {
        Ok(())
    }

    #[test]
    fn rejects_unusable_capacity() {
        for capacity in [0, 4, 8, 10, 1023] {
            assert!(
                matches!(
                    allocate(capacity),
                    Err(BridgeError::InvalidCapacity { .. })
                ),
                "capacity {capacity} should be rejected"
            );
        }
        assert!(allocate(12).is_ok());
    }

    #[test]
    fn starts_zeroed() {
        let (responder, waiter) = allocate(32).unwrap();
        assert_eq!(responder.snapshot(), vec![0u8; 32]);
        assert_eq!(responder.payload_capacity(), 24);
        assert_eq!(waiter.payload_capacity(), 24);
        assert!(!responder.has_outstanding());
    }

    #[test]
    fn layout_places_header_before_payload() {
        let (responder, waiter) = allocate(16).unwrap();

        let woken = waiter
            .begin_request(|ticket| responder.fulfill(ticket, "hi"))
            .unwrap();
        assert_eq!(woken.resolve().unwrap(), "hi");

        assert_eq!(
            responder.snapshot(),
            vec![1, 0, 0, 0, 2, 0, 0, 0, b'h', b'i', 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn round_trips_text_up_to_capacity() {
        let (responder, waiter) = allocate(64).unwrap();
        let exact = "x".repeat(responder.payload_capacity());
        let samples = [
            "",
            "hello",
            "héllo wörld ✓",
            "tab\tand spaces  ",
            "日本語の入力",
            exact.as_str(),
        ];

        for text in samples {
            let woken = waiter
                .begin_request(|ticket| responder.fulfill(ticket, text))
                .unwrap();
            assert_eq!(woken.resolve().unwrap(), text);
        }
    }

    #[test]
    fn shorter_payload_does_not_leak_previous_bytes() {
        let (responder, waiter) = allocate(32).unwrap();

        let woken = waiter
            .begin_request(|ticket| responder.fulfill(ticket, "a long answer"))
            .unwrap();
        woken.resolve().unwrap();

        let woken = waiter
            .begin_request(|ticket| responder.fulfill(ticket, "ok"))
            .unwrap();
        assert_eq!(woken.resolve().unwrap(), "ok");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (responder, waiter) = allocate(16).unwrap();

        let err = waiter
            .begin_request(|ticket| responder.fulfill(ticket, "123456789"))
            .err()
            .unwrap();

        assert_eq!(
            err,
            BridgeError::PayloadTooLarge {
                len: 9,
                capacity: 8
            }
        );
        // Nothing was written and the request was withdrawn.
        assert_eq!(responder.snapshot(), vec![0u8; 16]);
        assert!(!responder.has_outstanding());
    }

    #[test]
    fn multibyte_overflow_counts_bytes_not_chars() {
        let (responder, waiter) = allocate(16).unwrap();

        // 3 chars, 9 bytes.
        let err = waiter
            .begin_request(|ticket| responder.fulfill(ticket, "✓✓✓"))
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::PayloadTooLarge { len: 9, .. }));
    }

    #[test]
    fn second_request_before_resolve_fails_fast() {
        let (responder, waiter) = allocate(32).unwrap();

        let woken = waiter
            .begin_request(|ticket| responder.fulfill(ticket, "first"))
            .unwrap();

        let err = waiter.begin_request(ok).err().unwrap();
        assert_eq!(
            err,
            BridgeError::RequestOutstanding {
                outstanding: woken.ticket()
            }
        );

        assert_eq!(woken.resolve().unwrap(), "first");

        // Resolved: the slot is free again.
        let woken = waiter
            .begin_request(|ticket| responder.fulfill(ticket, "second"))
            .unwrap();
        assert_eq!(woken.resolve().unwrap(), "second");
    }

    #[test]
    fn stale_and_duplicate_tickets_are_rejected() {
        let (responder, waiter) = allocate(32).unwrap();

        let mut issued = None;
        let woken = waiter
            .begin_request(|ticket| {
                issued = Some(ticket);
                responder.fulfill(ticket, "one")?;
                // Second answer to the same request.
                assert_eq!(
                    responder.fulfill(ticket, "two"),
                    Err(BridgeError::StaleTicket { ticket })
                );
                Ok(())
            })
            .unwrap();
        assert_eq!(woken.resolve().unwrap(), "one");

        let ticket = issued.unwrap();
        assert_eq!(
            responder.fulfill(ticket, "late"),
            Err(BridgeError::StaleTicket { ticket })
        );
    }

    #[test]
    fn failed_notify_withdraws_request() {
        let (responder, waiter) = allocate(32).unwrap();

        let err = waiter
            .begin_request(|_| Err(BridgeError::Disconnected))
            .err()
            .unwrap();
        assert_eq!(err, BridgeError::Disconnected);
        assert!(!responder.has_outstanding());
    }

    #[test]
    fn blocked_worker_is_released_by_fulfill() {
        let (responder, waiter) = allocate(64).unwrap();
        let (ticket_tx, ticket_rx) = mpsc::channel();

        let worker = std::thread::spawn(move || {
            let woken = waiter.begin_request(|ticket| {
                ticket_tx.send(ticket).map_err(|_| BridgeError::Disconnected)
            })?;
            woken.resolve()
        });

        let ticket = ticket_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(responder.has_outstanding());
        responder.fulfill(ticket, "from control side").unwrap();

        assert_eq!(worker.join().unwrap().unwrap(), "from control side");
        assert!(!responder.has_outstanding());
    }

    #[test]
    fn interrupt_and_wake_release_blocked_worker() {
        let (responder, waiter) = allocate(64).unwrap();
        let (trigger, source) = interrupt::allocate();
        let waiter = waiter.with_interrupts(source);
        let (ticket_tx, ticket_rx) = mpsc::channel();

        let worker = std::thread::spawn(move || {
            waiter
                .begin_request(|ticket| {
                    ticket_tx.send(ticket).map_err(|_| BridgeError::Disconnected)
                })
                .map(|woken| woken.ticket())
        });

        let ticket = ticket_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        trigger.raise();
        responder.wake();

        assert_eq!(worker.join().unwrap(), Err(BridgeError::Interrupted));
        assert!(!responder.has_outstanding());
        assert_eq!(
            responder.fulfill(ticket, "too late"),
            Err(BridgeError::StaleTicket { ticket })
        );
    }

    #[test]
    fn raised_interrupt_short_circuits_new_requests() {
        let (responder, waiter) = allocate(64).unwrap();
        let (trigger, source) = interrupt::allocate();
        let waiter = waiter.with_interrupts(source);

        trigger.raise();
        let mut notified = false;
        let result = waiter.begin_request(|_| {
            notified = true;
            Ok(())
        });
        assert_eq!(result.err(), Some(BridgeError::Interrupted));
        assert!(!notified, "no request may be announced after a stop");
        assert!(!responder.has_outstanding());

        trigger.clear();
        assert!(
            waiter
                .begin_request(|ticket| responder.fulfill(ticket, "next"))
                .unwrap()
                .resolve()
                .is_ok_and(|line| line == "next")
        );
    }

    #[test]
    fn reset_zeroes_length_only() {
        let (responder, waiter) = allocate(16).unwrap();
        waiter
            .begin_request(|ticket| responder.fulfill(ticket, "abc"))
            .unwrap()
            .resolve()
            .unwrap();

        responder.reset();

        let bytes = responder.snapshot();
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }
}
