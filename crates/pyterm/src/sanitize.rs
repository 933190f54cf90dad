//! Traceback sanitizer.
//!
//! Removes the runtime's own stack frames and package-installation hints from
//! error text before it reaches the user. Frames are skipped from the first
//! runtime-internal frame until the first frame of the user's entry script.

use regex::{Regex, RegexSet};

/// Frames that belong to the runtime rather than the user's program.
pub const DEFAULT_INTERNAL_FRAMES: &[&str] = &[r#"File "/lib/python"#, r"_pyodide/_base\.py"];

/// Package-installation hints appended to import errors.
pub const DEFAULT_INSTALL_HINTS: &[&str] = &[
    r"The module .* is included in the Pyodide distribution",
    r"You can install it by calling:",
    r"await micropip\.install\(",
    r"await pyodide\.loadPackage\(",
    r"See https://pyodide\.org/",
];

/// Conventional filename of the user's program.
pub const DEFAULT_ENTRY_FILENAME: &str = "main.py";

const TRACEBACK_HEADER: &str = r"^Traceback\b";

/// Compiled line patterns used by [`Sanitizer`].
#[derive(Debug, Clone)]
pub struct SanitizerRules {
    internal_frames: RegexSet,
    install_hints: RegexSet,
    entry_frame: Regex,
    traceback_header: Regex,
}

impl SanitizerRules {
    /// Build rules from custom patterns. `entry_filename` is matched literally.
    pub fn new(
        internal_frames: &[&str],
        install_hints: &[&str],
        entry_filename: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            internal_frames: RegexSet::new(internal_frames)?,
            install_hints: RegexSet::new(install_hints)?,
            entry_frame: Regex::new(&format!(
                r#"^\s*File "{}""#,
                regex::escape(entry_filename)
            ))?,
            traceback_header: Regex::new(TRACEBACK_HEADER)?,
        })
    }

    /// Default patterns with a different entry script name.
    pub fn for_entry(entry_filename: &str) -> Self {
        Self::new(DEFAULT_INTERNAL_FRAMES, DEFAULT_INSTALL_HINTS, entry_filename)
            .expect("built-in sanitizer patterns compile")
    }

    fn is_internal_frame(&self, line: &str) -> bool {
        self.internal_frames.is_match(line)
    }

    fn is_install_hint(&self, line: &str) -> bool {
        self.install_hints.is_match(line)
    }

    fn is_entry_frame(&self, line: &str) -> bool {
        self.entry_frame.is_match(line)
    }

    fn is_traceback_header(&self, line: &str) -> bool {
        self.traceback_header.is_match(line)
    }
}

impl Default for SanitizerRules {
    fn default() -> Self {
        Self::for_entry(DEFAULT_ENTRY_FILENAME)
    }
}

/// Line filter over captured error text. Each call starts from a clean state.
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    rules: SanitizerRules,
}

impl Sanitizer {
    pub fn new(rules: SanitizerRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &SanitizerRules {
        &self.rules
    }

    pub fn filter<S: AsRef<str>>(&self, lines: &[S]) -> Vec<String> {
        let rules = &self.rules;
        let mut kept = Vec::with_capacity(lines.len());
        let mut skipping = false;
        // A header is only kept if the runtime did not start the trace.
        let mut held_header: Option<&str> = None;

        for line in lines.iter().map(AsRef::as_ref) {
            if let Some(header) = held_header.take()
                && !rules.is_internal_frame(line)
            {
                kept.push(header.to_string());
            }

            if rules.is_internal_frame(line) {
                skipping = true;
                continue;
            }

            if skipping && rules.is_entry_frame(line) {
                skipping = false;
            }

            if skipping || rules.is_install_hint(line) {
                continue;
            }

            if rules.is_traceback_header(line) {
                held_header = Some(line);
                continue;
            }

            kept.push(line.to_string());
        }

        if let Some(header) = held_header {
            kept.push(header.to_string());
        }
        kept
    }

    /// Filter newline-separated text. Returns `None` when nothing survives.
    pub fn filter_text(&self, text: &str) -> Option<String> {
        let lines: Vec<&str> = text.trim_end_matches('\n').lines().collect();
        let kept = self.filter(&lines);
        if kept.iter().all(|line| line.trim().is_empty()) {
            return None;
        }
        Some(kept.join("\n"))
    }
}
