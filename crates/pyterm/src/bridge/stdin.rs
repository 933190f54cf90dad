//! Blocking stdin hook for engines.

use std::sync::Arc;

use super::BridgeError;
use super::control_block::{InputTicket, InputWaiter};

/// Announces a stdin request to the control side. Must not block.
pub trait RequestNotifier: Send + Sync {
    fn stdin_requested(&self, ticket: InputTicket) -> Result<(), BridgeError>;
}

impl<F> RequestNotifier for F
where
    F: Fn(InputTicket) -> Result<(), BridgeError> + Send + Sync,
{
    fn stdin_requested(&self, ticket: InputTicket) -> Result<(), BridgeError> {
        self(ticket)
    }
}

struct Connected {
    waiter: InputWaiter,
    notifier: Box<dyn RequestNotifier>,
}

/// Worker-side stdin: one call, one line.
///
/// Cheap to clone; clones share the same rendezvous, so the one-outstanding-
/// request rule holds across all of them.
#[derive(Clone)]
pub struct StdinBridge {
    connected: Option<Arc<Connected>>,
}

impl StdinBridge {
    pub fn new(waiter: InputWaiter, notifier: impl RequestNotifier + 'static) -> Self {
        Self {
            connected: Some(Arc::new(Connected {
                waiter,
                notifier: Box::new(notifier),
            })),
        }
    }

    /// A bridge with no control side. Every read returns an empty line.
    pub fn disconnected() -> Self {
        Self { connected: None }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    /// Request a line from the control side and block until it arrives.
    ///
    /// The returned text has one trailing `\n` or `\r\n` removed.
    pub fn read_line(&self) -> Result<String, BridgeError> {
        let Some(connected) = &self.connected else {
            return Ok(String::new());
        };

        let woken = connected
            .waiter
            .begin_request(|ticket| connected.notifier.stdin_requested(ticket))?;
        let ticket = woken.ticket();
        let line = woken.resolve()?;
        tracing::trace!(%ticket, bytes = line.len(), "Stdin request resolved");

        Ok(strip_line_ending(line))
    }
}

fn strip_line_ending(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::bridge::control_block::{InputResponder, allocate};
    use crate::bridge::interrupt;

    /// Bridge whose requests are forwarded to the returned receiver.
    fn connected_bridge(
        capacity: usize,
    ) -> (StdinBridge, InputResponder, mpsc::Receiver<InputTicket>) {
        let (responder, waiter) = allocate(capacity).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let bridge = StdinBridge::new(waiter, move |ticket| {
            tx.lock()
                .unwrap()
                .send(ticket)
                .map_err(|_| BridgeError::Disconnected)
        });
        (bridge, responder, rx)
    }

    #[test]
    fn disconnected_bridge_reads_empty_lines() {
        let bridge = StdinBridge::disconnected();
        assert!(!bridge.is_connected());
        assert_eq!(bridge.read_line().unwrap(), "");
        assert_eq!(bridge.read_line().unwrap(), "");
    }

    #[test]
    fn strips_one_line_ending() {
        assert_eq!(strip_line_ending("abc".into()), "abc");
        assert_eq!(strip_line_ending("abc\n".into()), "abc");
        assert_eq!(strip_line_ending("abc\r\n".into()), "abc");
        assert_eq!(strip_line_ending("abc\n\n".into()), "abc\n");
        assert_eq!(strip_line_ending("abc\r".into()), "abc\r");
        assert_eq!(strip_line_ending(String::new()), "");
    }

    #[test]
    fn read_line_blocks_until_fulfilled() {
        let (bridge, responder, requests) = connected_bridge(64);

        let worker = {
            let bridge = bridge.clone();
            std::thread::spawn(move || {
                let first = bridge.read_line()?;
                let second = bridge.read_line()?;
                Ok::<_, BridgeError>((first, second))
            })
        };

        let ticket = requests.recv_timeout(Duration::from_secs(5)).unwrap();
        responder.fulfill(ticket, "Ada\r\n").unwrap();
        let ticket = requests.recv_timeout(Duration::from_secs(5)).unwrap();
        responder.fulfill(ticket, "  spaced  ").unwrap();

        let (first, second) = worker.join().unwrap().unwrap();
        assert_eq!(first, "Ada");
        assert_eq!(second, "  spaced  ");
    }

    #[test]
    fn notifier_failure_is_returned() {
        let (_responder, waiter) = allocate(64).unwrap();
        let bridge = StdinBridge::new(waiter, |_| Err(BridgeError::Disconnected));

        assert_eq!(bridge.read_line(), Err(BridgeError::Disconnected));
        // The failed request did not leave the slot occupied.
        assert_eq!(bridge.read_line(), Err(BridgeError::Disconnected));
    }

    #[test]
    fn interrupted_read_returns_interrupted() {
        let (responder, waiter) = allocate(64).unwrap();
        let (trigger, source) = interrupt::allocate();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let bridge = StdinBridge::new(waiter.with_interrupts(source), move |ticket| {
            tx.lock()
                .unwrap()
                .send(ticket)
                .map_err(|_| BridgeError::Disconnected)
        });

        let worker = std::thread::spawn(move || bridge.read_line());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        trigger.raise();
        responder.wake();

        assert_eq!(worker.join().unwrap(), Err(BridgeError::Interrupted));
    }
}
