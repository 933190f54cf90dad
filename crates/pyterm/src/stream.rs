//! Stream multiplexer - per-unit output callbacks to terminal writes.
//!
//! Engines push stdout/stderr one byte at a time. Each stream has its own
//! streaming UTF-8 decoder and line buffer. Decoded characters are forwarded
//! immediately as fragments (so prompts without a newline show up), and every
//! newline also emits the assembled line.
//!
//! Both streams share one writer behind one lock, so the writer sees calls in
//! the order the engine made them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

const NEWLINE: u8 = b'\n';

/// Which output stream a unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    fn index(self) -> usize {
        match self {
            StreamKind::Stdout => 0,
            StreamKind::Stderr => 1,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-unit output hook handed to engines.
pub trait OutputSink: Send {
    fn accept(&mut self, unit: u8);

    fn accept_all(&mut self, units: &[u8]) {
        for &unit in units {
            self.accept(unit);
        }
    }
}

/// Destination of multiplexed output.
pub trait OutputWriter: Send {
    /// Text to show right away, without a line break.
    fn write_fragment(&mut self, stream: StreamKind, text: &str);

    /// A complete line. `terminated` is false only for the remainder flushed
    /// at run completion.
    fn write_line(&mut self, stream: StreamKind, text: &str, terminated: bool);
}

/// Incremental UTF-8 decoder fed one byte at a time.
///
/// Incomplete sequences are held across calls. Each maximal invalid subpart
/// decodes to one U+FFFD: when a byte cannot continue the pending sequence,
/// the sequence is replaced and the byte is decoded afresh.
struct Utf8Decoder {
    parser: utf8parse::Parser,
    in_sequence: bool,
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self {
            parser: utf8parse::Parser::new(),
            in_sequence: false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    Pending,
    Char,
    Invalid,
}

/// Receives parser output for a single byte.
struct Emitter<'a, F> {
    emit: &'a mut F,
    step: Step,
}

impl<F: FnMut(char)> utf8parse::Receiver for Emitter<'_, F> {
    fn codepoint(&mut self, c: char) {
        (self.emit)(c);
        self.step = Step::Char;
    }

    fn invalid_sequence(&mut self) {
        (self.emit)(char::REPLACEMENT_CHARACTER);
        self.step = Step::Invalid;
    }
}

impl Utf8Decoder {
    fn push<F: FnMut(char)>(&mut self, byte: u8, emit: &mut F) {
        let was_in_sequence = self.in_sequence;
        if self.advance(byte, emit) == Step::Invalid && was_in_sequence {
            self.advance(byte, emit);
        }
    }

    fn advance<F: FnMut(char)>(&mut self, byte: u8, emit: &mut F) -> Step {
        let mut emitter = Emitter {
            emit,
            step: Step::Pending,
        };
        self.parser.advance(&mut emitter, byte);
        self.in_sequence = emitter.step == Step::Pending;
        emitter.step
    }

    fn finish<F: FnMut(char)>(&mut self, emit: &mut F) {
        if self.in_sequence {
            self.parser = utf8parse::Parser::new();
            self.in_sequence = false;
            emit(char::REPLACEMENT_CHARACTER);
        }
    }
}

#[derive(Default)]
struct StreamState {
    decoder: Utf8Decoder,
    line: String,
}

struct Shared<W> {
    writer: W,
    streams: [StreamState; 2],
}

impl<W: OutputWriter> Shared<W> {
    fn accept(&mut self, stream: StreamKind, unit: u8) {
        let Shared { writer, streams } = self;
        let StreamState { decoder, line } = &mut streams[stream.index()];

        if unit == NEWLINE {
            // Bytes left dangling by the newline are malformed.
            decoder.finish(&mut |c| push_char(writer, line, stream, c));
            let complete = std::mem::take(line);
            writer.write_line(stream, &complete, true);
            return;
        }

        decoder.push(unit, &mut |c| push_char(writer, line, stream, c));
    }

    fn finish(&mut self) {
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let Shared { writer, streams } = self;
            let StreamState { decoder, line } = &mut streams[stream.index()];
            decoder.finish(&mut |c| push_char(writer, line, stream, c));
            let rest = std::mem::take(line);
            writer.write_line(stream, &rest, false);
        }
    }
}

fn push_char<W: OutputWriter>(writer: &mut W, line: &mut String, stream: StreamKind, c: char) {
    line.push(c);
    let mut buf = [0u8; 4];
    writer.write_fragment(stream, c.encode_utf8(&mut buf));
}

/// Fans per-unit output from both streams into one [`OutputWriter`].
///
/// Create one per run; [`finish`](Self::finish) at run completion.
pub struct StreamMultiplexer<W> {
    shared: Arc<Mutex<Shared<W>>>,
}

impl<W> Clone for StreamMultiplexer<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W: OutputWriter + 'static> StreamMultiplexer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                writer,
                streams: Default::default(),
            })),
        }
    }

    /// The per-unit hook for `stream`.
    pub fn sink(&self, stream: StreamKind) -> StreamSink<W> {
        StreamSink {
            stream,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Flush dangling bytes and emit each stream's remainder as an
    /// unterminated line (possibly empty).
    pub fn finish(&self) {
        self.lock().finish();
    }

    /// Access the writer, e.g. to inspect what was written.
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.lock().writer)
    }

    fn lock(&self) -> MutexGuard<'_, Shared<W>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One stream's end of a [`StreamMultiplexer`].
pub struct StreamSink<W> {
    stream: StreamKind,
    shared: Arc<Mutex<Shared<W>>>,
}

impl<W: OutputWriter> OutputSink for StreamSink<W> {
    fn accept(&mut self, unit: u8) {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accept(self.stream, unit);
    }
}
