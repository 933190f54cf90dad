//! Built-in line-oriented script engine.
//!
//! Needs no external runtime, so sessions can be driven end to end without an
//! interpreter installed. One statement per line:
//!
//! ```text
//! print <text>            write text and a newline to stdout
//! write <text>            write text to stdout, no newline
//! eprint <text>           write text and a newline to stderr
//! input <var> [prompt]    write prompt, read one line of stdin into var
//! set <var> <text>        assign
//! repeat <n|forever> [as <var>]
//!   ...
//! end
//! sleep <millis>
//! raise <Error>[: message]
//! # comment
//! ```
//!
//! `{name}` in text is replaced by the variable's value. Errors are reported
//! as Python-style tracebacks. The interrupt source is polled before every
//! statement, every loop iteration and while sleeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::bridge::{BridgeError, InterruptSource};
use crate::stream::{OutputSink, StreamKind};

use super::{BootError, EngineFactory, ExecutionEngine, ExecutionError, StdinHook};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stmt {
    Emit {
        line: usize,
        stream: StreamKind,
        text: String,
        newline: bool,
    },
    Input {
        line: usize,
        var: String,
        prompt: String,
    },
    Set {
        line: usize,
        var: String,
        text: String,
    },
    Repeat {
        line: usize,
        times: Option<u64>,
        counter: Option<String>,
        body: Vec<Stmt>,
    },
    Sleep {
        line: usize,
        millis: u64,
    },
    Raise {
        line: usize,
        kind: String,
        message: Option<String>,
    },
}

impl Stmt {
    fn line(&self) -> usize {
        match self {
            Stmt::Emit { line, .. }
            | Stmt::Input { line, .. }
            | Stmt::Set { line, .. }
            | Stmt::Repeat { line, .. }
            | Stmt::Sleep { line, .. }
            | Stmt::Raise { line, .. } => *line,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SyntaxError {
    line: usize,
    message: String,
}

impl SyntaxError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

struct OpenBlock {
    line: usize,
    times: Option<u64>,
    counter: Option<String>,
    body: Vec<Stmt>,
}

fn split_word(text: &str) -> (&str, &str) {
    match text.split_once(' ') {
        Some((word, rest)) => (word, rest),
        None => (text, ""),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn parse_identifier(line: usize, name: &str) -> Result<String, SyntaxError> {
    if is_identifier(name) {
        Ok(name.to_string())
    } else {
        Err(SyntaxError::new(line, "invalid syntax"))
    }
}

fn parse_repeat(line: usize, args: &str) -> Result<OpenBlock, SyntaxError> {
    let mut words = args.split_whitespace();
    let times = match words.next() {
        Some("forever") => None,
        Some(count) => Some(
            count
                .parse::<u64>()
                .map_err(|_| SyntaxError::new(line, "repeat count must be a number"))?,
        ),
        None => return Err(SyntaxError::new(line, "invalid syntax")),
    };
    let counter = match (words.next(), words.next(), words.next()) {
        (None, _, _) => None,
        (Some("as"), Some(name), None) => Some(parse_identifier(line, name)?),
        _ => return Err(SyntaxError::new(line, "invalid syntax")),
    };
    Ok(OpenBlock {
        line,
        times,
        counter,
        body: Vec::new(),
    })
}

fn parse(source: &str) -> Result<Vec<Stmt>, SyntaxError> {
    let mut root = Vec::new();
    let mut blocks: Vec<OpenBlock> = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let content = raw.trim_start().trim_end_matches('\r');
        if content.trim().is_empty() || content.starts_with('#') {
            continue;
        }

        let (keyword, rest) = split_word(content);
        let stmt = match keyword {
            "print" | "write" | "eprint" => Stmt::Emit {
                line,
                stream: if keyword == "eprint" {
                    StreamKind::Stderr
                } else {
                    StreamKind::Stdout
                },
                text: rest.to_string(),
                newline: keyword != "write",
            },
            "input" => {
                let (var, prompt) = split_word(rest);
                Stmt::Input {
                    line,
                    var: parse_identifier(line, var)?,
                    prompt: prompt.to_string(),
                }
            }
            "set" => {
                let (var, text) = split_word(rest);
                Stmt::Set {
                    line,
                    var: parse_identifier(line, var)?,
                    text: text.to_string(),
                }
            }
            "sleep" => Stmt::Sleep {
                line,
                millis: rest
                    .trim()
                    .parse()
                    .map_err(|_| SyntaxError::new(line, "sleep expects milliseconds"))?,
            },
            "raise" => {
                let (kind, message) = match rest.split_once(':') {
                    Some((kind, message)) => (kind.trim(), Some(message.trim().to_string())),
                    None => (rest.trim(), None),
                };
                Stmt::Raise {
                    line,
                    kind: parse_identifier(line, kind)?,
                    message,
                }
            }
            "repeat" => {
                blocks.push(parse_repeat(line, rest)?);
                continue;
            }
            "end" if rest.trim().is_empty() => {
                let Some(block) = blocks.pop() else {
                    return Err(SyntaxError::new(line, "'end' outside of a block"));
                };
                Stmt::Repeat {
                    line: block.line,
                    times: block.times,
                    counter: block.counter,
                    body: block.body,
                }
            }
            _ => return Err(SyntaxError::new(line, "invalid syntax")),
        };

        match blocks.last_mut() {
            Some(block) => block.body.push(stmt),
            None => root.push(stmt),
        }
    }

    if let Some(block) = blocks.last() {
        return Err(SyntaxError::new(
            block.line,
            "expected 'end' to close 'repeat'",
        ));
    }
    Ok(root)
}

/// Line-oriented interpreter implementing [`ExecutionEngine`].
#[derive(Default)]
pub struct ScriptEngine {
    stdout: Option<Box<dyn OutputSink>>,
    stderr: Option<Box<dyn OutputSink>>,
    stdin: Option<StdinHook>,
    interrupts: Option<InterruptSource>,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for `Session::initialize`.
    pub fn factory() -> EngineFactory {
        Box::new(|| Ok(Box::new(ScriptEngine::new()) as Box<dyn ExecutionEngine>))
    }

    /// Factory that always fails to boot, with `message`.
    pub fn failing_factory(message: impl Into<String>) -> EngineFactory {
        let message = message.into();
        Box::new(move || Err(BootError::load(message)))
    }
}

impl ExecutionEngine for ScriptEngine {
    fn configure_stdout(&mut self, sink: Box<dyn OutputSink>) {
        self.stdout = Some(sink);
    }

    fn configure_stderr(&mut self, sink: Box<dyn OutputSink>) {
        self.stderr = Some(sink);
    }

    fn configure_stdin(&mut self, hook: StdinHook) {
        self.stdin = Some(hook);
    }

    fn configure_interrupt_source(&mut self, source: InterruptSource) {
        self.interrupts = Some(source);
    }

    fn execute(&mut self, source: &str, filename: &str) -> Result<(), ExecutionError> {
        let program = parse(source).map_err(|e| {
            let code = source.lines().nth(e.line - 1).unwrap_or_default().trim();
            ExecutionError::raised(format!(
                "  File \"{filename}\", line {}\n    {code}\nSyntaxError: {}",
                e.line, e.message
            ))
        })?;

        let mut run = Run {
            engine: self,
            filename,
            source_lines: source.lines().collect(),
            vars: HashMap::new(),
        };
        run.block(&program)
    }

    fn name(&self) -> &'static str {
        "script"
    }
}

/// State of one `execute` call.
struct Run<'a> {
    engine: &'a mut ScriptEngine,
    filename: &'a str,
    source_lines: Vec<&'a str>,
    vars: HashMap<String, String>,
}

impl Run<'_> {
    fn block(&mut self, stmts: &[Stmt]) -> Result<(), ExecutionError> {
        for stmt in stmts {
            self.check_interrupt(stmt.line())?;
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<(), ExecutionError> {
        match stmt {
            Stmt::Emit {
                line,
                stream,
                text,
                newline,
            } => {
                let mut text = self.interpolate(*line, text)?;
                if *newline {
                    text.push('\n');
                }
                self.emit(*stream, &text);
            }
            Stmt::Input { line, var, prompt } => {
                let prompt = self.interpolate(*line, prompt)?;
                self.emit(StreamKind::Stdout, &prompt);
                let value = self.read_line(*line)?;
                self.vars.insert(var.clone(), value);
            }
            Stmt::Set { line, var, text } => {
                let value = self.interpolate(*line, text)?;
                self.vars.insert(var.clone(), value);
            }
            Stmt::Repeat {
                line,
                times,
                counter,
                body,
            } => {
                let mut iteration: u64 = 0;
                while times.is_none_or(|times| iteration < times) {
                    self.check_interrupt(*line)?;
                    if let Some(counter) = counter {
                        self.vars.insert(counter.clone(), iteration.to_string());
                    }
                    self.block(body)?;
                    iteration += 1;
                }
            }
            Stmt::Sleep { line, millis } => {
                let deadline = Instant::now() + Duration::from_millis(*millis);
                loop {
                    self.check_interrupt(*line)?;
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    std::thread::sleep(SLEEP_SLICE.min(deadline - now));
                }
            }
            Stmt::Raise {
                line,
                kind,
                message,
            } => {
                let error = match message {
                    Some(message) => format!("{kind}: {}", self.interpolate(*line, message)?),
                    None => kind.clone(),
                };
                return Err(ExecutionError::raised(self.traceback(*line, &error)));
            }
        }
        Ok(())
    }

    fn emit(&mut self, stream: StreamKind, text: &str) {
        let sink = match stream {
            StreamKind::Stdout => self.engine.stdout.as_mut(),
            StreamKind::Stderr => self.engine.stderr.as_mut(),
        };
        if let Some(sink) = sink {
            sink.accept_all(text.as_bytes());
        }
    }

    fn read_line(&mut self, line: usize) -> Result<String, ExecutionError> {
        let Some(stdin) = self.engine.stdin.as_mut() else {
            return Ok(String::new());
        };
        match stdin() {
            Ok(value) => Ok(value),
            Err(BridgeError::Interrupted) => Err(ExecutionError::interrupted(
                self.traceback(line, "KeyboardInterrupt"),
            )),
            Err(e) => Err(ExecutionError::raised(
                self.traceback(line, &format!("OSError: {e}")),
            )),
        }
    }

    fn check_interrupt(&self, line: usize) -> Result<(), ExecutionError> {
        let requested = self
            .engine
            .interrupts
            .as_ref()
            .is_some_and(InterruptSource::is_requested);
        if requested {
            return Err(ExecutionError::interrupted(
                self.traceback(line, "KeyboardInterrupt"),
            ));
        }
        Ok(())
    }

    fn interpolate(&self, line: usize, text: &str) -> Result<String, ExecutionError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_identifier(&after[..close]) => {
                    let name = &after[..close];
                    let Some(value) = self.vars.get(name) else {
                        return Err(ExecutionError::raised(self.traceback(
                            line,
                            &format!("NameError: name '{name}' is not defined"),
                        )));
                    };
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn traceback(&self, line: usize, error: &str) -> String {
        let code = self
            .source_lines
            .get(line - 1)
            .map(|code| code.trim())
            .unwrap_or_default();
        format!(
            "Traceback (most recent call last):\n  File \"{}\", line {line}, in <module>\n    {code}\n{error}",
            self.filename
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::bridge::interrupt;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl OutputSink for Captured {
        fn accept(&mut self, unit: u8) {
            self.0.lock().unwrap().push(unit);
        }
    }

    struct Harness {
        engine: ScriptEngine,
        stdout: Captured,
        stderr: Captured,
    }

    impl Harness {
        fn new() -> Self {
            let stdout = Captured::default();
            let stderr = Captured::default();
            let mut engine = ScriptEngine::new();
            engine.configure_stdout(Box::new(stdout.clone()));
            engine.configure_stderr(Box::new(stderr.clone()));
            Self {
                engine,
                stdout,
                stderr,
            }
        }

        fn with_input(mut self, lines: &[&str]) -> Self {
            let mut queue: VecDeque<String> = lines.iter().map(|s| s.to_string()).collect();
            self.engine
                .configure_stdin(Box::new(move || Ok(queue.pop_front().unwrap_or_default())));
            self
        }

        fn run(&mut self, source: &str) -> Result<(), ExecutionError> {
            self.engine.execute(source, "main.py")
        }
    }

    #[test]
    fn prints_to_both_streams() {
        let mut h = Harness::new();
        h.run("print hello\nwrite a\nwrite b\neprint oops\nprint\n")
            .unwrap();

        assert_eq!(h.stdout.text(), "hello\nab\n");
        assert_eq!(h.stderr.text(), "oops\n");
    }

    #[test]
    fn input_prompts_and_interpolates() {
        let mut h = Harness::new().with_input(&["Ada", "36"]);
        h.run("input name Name? \ninput age Age? \nprint Hello, {name} ({age})!")
            .unwrap();

        assert_eq!(h.stdout.text(), "Name? Age? Hello, Ada (36)!\n");
    }

    #[test]
    fn missing_stdin_hook_reads_empty_line() {
        let mut h = Harness::new();
        h.run("input x\nprint [{x}]").unwrap();
        assert_eq!(h.stdout.text(), "[]\n");
    }

    #[test]
    fn repeat_with_counter_and_nesting() {
        let mut h = Harness::new();
        h.run("repeat 2 as i\n  repeat 2 as j\n    write {i}{j} \n  end\nend\nprint")
            .unwrap();
        assert_eq!(h.stdout.text(), "00 01 10 11 \n");
    }

    #[test]
    fn braces_without_identifier_are_literal() {
        let mut h = Harness::new();
        h.run("set x 1\nprint {x} {} { y } {x").unwrap();
        assert_eq!(h.stdout.text(), "1 {} { y } {x\n");
    }

    #[test]
    fn raise_produces_traceback() {
        let mut h = Harness::new();
        let err = h.run("print before\nraise ValueError: bad input").unwrap_err();

        assert_eq!(
            err,
            ExecutionError::raised(
                "Traceback (most recent call last):\n  File \"main.py\", line 2, in <module>\n    raise ValueError: bad input\nValueError: bad input"
            )
        );
        assert_eq!(h.stdout.text(), "before\n");
    }

    #[test]
    fn undefined_variable_is_name_error() {
        let mut h = Harness::new();
        let err = h.run("print {x}").unwrap_err();

        assert!(!err.is_interrupt());
        assert!(
            err.traceback()
                .ends_with("NameError: name 'x' is not defined")
        );
    }

    #[test]
    fn syntax_errors_run_nothing() {
        let cases = [
            ("print ok\nfrobnicate", 2, "invalid syntax"),
            ("repeat 3\nprint ok", 1, "expected 'end' to close 'repeat'"),
            ("end", 1, "'end' outside of a block"),
            ("sleep soon", 1, "sleep expects milliseconds"),
            ("input 9lives", 1, "invalid syntax"),
        ];

        for (source, line, message) in cases {
            let mut h = Harness::new();
            let err = h.run(source).unwrap_err();
            let text = err.traceback();
            assert!(
                text.contains(&format!("File \"main.py\", line {line}\n")),
                "{source:?}: {text}"
            );
            assert!(
                text.ends_with(&format!("SyntaxError: {message}")),
                "{source:?}: {text}"
            );
            assert_eq!(h.stdout.text(), "");
        }
    }

    #[test]
    fn raised_interrupt_stops_before_first_statement() {
        let (trigger, source) = interrupt::allocate();
        let mut h = Harness::new();
        h.engine.configure_interrupt_source(source);
        trigger.raise();

        let err = h.run("print never").unwrap_err();
        assert!(err.is_interrupt());
        assert!(err.traceback().ends_with("KeyboardInterrupt"));
        assert_eq!(h.stdout.text(), "");
    }

    #[test]
    fn endless_loop_observes_interrupt() {
        let (trigger, source) = interrupt::allocate();
        let mut h = Harness::new();
        h.engine.configure_interrupt_source(source);

        let stopper = {
            let stdout = h.stdout.clone();
            std::thread::spawn(move || {
                while stdout.text().is_empty() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                trigger.raise();
            })
        };

        let err = h.run("repeat forever\n  print tick\n  sleep 5\nend").unwrap_err();
        stopper.join().unwrap();

        assert!(err.is_interrupt());
        assert!(h.stdout.text().starts_with("tick\n"));
    }

    #[test]
    fn interrupted_stdin_is_keyboard_interrupt() {
        let mut h = Harness::new();
        h.engine
            .configure_stdin(Box::new(|| Err(BridgeError::Interrupted)));

        let err = h.run("input name Name? ").unwrap_err();
        assert!(err.is_interrupt());
        assert!(err.traceback().contains("line 1, in <module>"));
    }

    #[test]
    fn stdin_failure_is_os_error() {
        let mut h = Harness::new();
        h.engine
            .configure_stdin(Box::new(|| Err(BridgeError::Disconnected)));

        let err = h.run("input name").unwrap_err();
        assert!(!err.is_interrupt());
        assert!(
            err.traceback()
                .ends_with("OSError: control side disconnected")
        );
    }

    #[test]
    fn variables_do_not_leak_between_runs() {
        let mut h = Harness::new();
        h.run("set x 1").unwrap();
        assert!(h.run("print {x}").is_err());
    }

    #[test]
    fn factories_build_or_fail() {
        let engine = ScriptEngine::factory()().ok().unwrap();
        assert_eq!(engine.name(), "script");

        let err = ScriptEngine::failing_factory("no runtime")().err();
        assert_eq!(err, Some(BootError::load("no runtime")));
    }
}
