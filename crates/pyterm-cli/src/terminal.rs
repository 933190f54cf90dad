//! ANSI terminal display and line-based stdin source.

use std::io::{self, IsTerminal, Write};

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use pyterm::{InputSource, SessionStatus, StreamKind, TerminalDisplay};

pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const RESET: &str = "\x1b[0m";

pub const SUCCESS_BANNER: &str = "=== Code Execution Successful ===";
pub const ERROR_BANNER: &str = "=== Code Exited With Errors ===";

/// Writes program output to stdout as it arrives.
pub struct AnsiTerminal {
    color: bool,
}

impl AnsiTerminal {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    /// Colors only when stdout is a terminal.
    pub fn detect() -> Self {
        Self::new(io::stdout().is_terminal())
    }

    pub fn paint(&self, color: &str, text: &str) -> String {
        if self.color {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    pub fn banner(&self, success: bool) {
        let banner = if success {
            self.paint(GREEN, SUCCESS_BANNER)
        } else {
            self.paint(RED, ERROR_BANNER)
        };
        self.write(&format!("\n{banner}\n"));
    }

    fn write(&self, text: &str) {
        let mut out = io::stdout().lock();
        // A closed stdout leaves nothing useful to report to.
        let _ = out.write_all(text.as_bytes()).and_then(|()| out.flush());
    }
}

impl TerminalDisplay for AnsiTerminal {
    fn fragment(&self, _stream: StreamKind, text: &str) {
        self.write(text);
    }

    fn line(&self, _stream: StreamKind, _text: &str, terminated: bool) {
        if terminated {
            self.write("\n");
        }
    }

    fn error_lines(&self, lines: &[String]) {
        let mut text = String::new();
        for line in lines {
            text.push_str(&self.paint(RED, line));
            text.push('\n');
        }
        self.write(&text);
    }

    fn status(&self, status: &SessionStatus) {
        let color = match status {
            SessionStatus::Initializing => YELLOW,
            SessionStatus::Ready => GREEN,
            SessionStatus::Failed(_) | SessionStatus::Fault(_) => RED,
        };
        self.write(&format!("{}\n", self.paint(color, status.message())));
    }
}

/// Reads program input line by line from the process stdin.
///
/// When stdin is not a terminal nothing is echoed by the tty, so each line is
/// echoed to stdout to keep the transcript readable.
pub struct StdinLines {
    lines: Mutex<Lines<BufReader<Stdin>>>,
    echo: bool,
}

impl StdinLines {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            echo: !io::stdin().is_terminal(),
        }
    }
}

#[async_trait::async_trait]
impl InputSource for StdinLines {
    async fn next_line(&self) -> io::Result<Option<String>> {
        let line = self.lines.lock().await.next_line().await?;
        if self.echo
            && let Some(line) = &line
        {
            let mut out = io::stdout().lock();
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
        Ok(line)
    }
}
