//! Embedded CPython engine.
//!
//! `sys.stdout`, `sys.stderr` and `sys.stdin` are replaced for the duration of
//! each run with file-like objects backed by the worker's hooks. Interrupts are
//! delivered two ways: a blocked `readline` returns `KeyboardInterrupt` from the
//! bridge, and a watcher thread injects `KeyboardInterrupt` into running
//! bytecode with `PyThreadState_SetAsyncExc`.

use std::ffi::c_long;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use pyo3::exceptions::{PyKeyboardInterrupt, PyOSError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::bridge::{BridgeError, InterruptSource};
use crate::stream::OutputSink;

use super::{BootError, EngineFactory, ExecutionEngine, ExecutionError, StdinHook};

const WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// File-like object that forwards every write to an output sink.
#[pyclass(name = "_HookWriter", module = "pyterm")]
struct HookWriter {
    sink: Mutex<Option<Box<dyn OutputSink>>>,
}

#[pymethods]
impl HookWriter {
    fn write(&self, data: &str) -> usize {
        if let Some(sink) = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            sink.accept_all(data.as_bytes());
        }
        data.chars().count()
    }

    fn flush(&self) {}

    fn writable(&self) -> bool {
        true
    }

    fn readable(&self) -> bool {
        false
    }

    fn isatty(&self) -> bool {
        false
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }
}

/// File-like object whose `readline` blocks on the stdin hook.
#[pyclass(name = "_HookReader", module = "pyterm")]
struct HookReader {
    hook: Mutex<Option<StdinHook>>,
}

#[pymethods]
impl HookReader {
    #[pyo3(signature = (_size = None))]
    fn readline(&self, py: Python<'_>, _size: Option<isize>) -> PyResult<String> {
        // The GIL is released while waiting so the watcher and other threads
        // can make progress.
        let line = py.detach(|| {
            let mut hook = self.hook.lock().unwrap_or_else(PoisonError::into_inner);
            match hook.as_mut() {
                Some(read) => read(),
                None => Ok(String::new()),
            }
        });
        match line {
            Ok(mut line) => {
                line.push('\n');
                Ok(line)
            }
            Err(BridgeError::Interrupted) => Err(PyKeyboardInterrupt::new_err(())),
            Err(e) => Err(PyOSError::new_err(e.to_string())),
        }
    }

    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        false
    }

    fn isatty(&self) -> bool {
        false
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }
}

/// Raises `KeyboardInterrupt` in the running thread once an interrupt is requested.
struct InterruptWatcher {
    done: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InterruptWatcher {
    fn spawn(interrupts: InterruptSource, py_thread_id: c_long) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let thread = {
            let done = Arc::clone(&done);
            std::thread::Builder::new()
                .name("pyterm-interrupt".to_string())
                .spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        if interrupts.is_requested() {
                            inject_keyboard_interrupt(py_thread_id);
                            return;
                        }
                        std::thread::sleep(WATCH_INTERVAL);
                    }
                })
        };
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to spawn interrupt watcher, relying on stdin only");
                None
            }
        };
        Self { done, thread }
    }

    /// Must be called without the GIL held.
    fn stop(mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("Interrupt watcher panicked");
        }
    }
}

fn inject_keyboard_interrupt(py_thread_id: c_long) {
    Python::attach(|py| {
        let exc = py.get_type::<PyKeyboardInterrupt>().as_ptr();
        // SAFETY: the GIL is held and exc is a valid exception type.
        let result = unsafe { pyo3::ffi::PyThreadState_SetAsyncExc(py_thread_id, exc) };
        match result {
            0 => tracing::debug!(py_thread_id, "Interrupt target thread not found"),
            1 => tracing::debug!(py_thread_id, "Injected KeyboardInterrupt"),
            _ => {
                tracing::error!(
                    py_thread_id,
                    count = result,
                    "PyThreadState_SetAsyncExc modified multiple thread states, resetting"
                );
                clear_async_exc(py_thread_id);
            }
        }
    });
}

fn clear_async_exc(py_thread_id: c_long) {
    // SAFETY: callers hold the GIL; NULL clears any pending async exception.
    unsafe {
        pyo3::ffi::PyThreadState_SetAsyncExc(py_thread_id, std::ptr::null_mut());
    }
}

fn current_py_thread_id(py: Python<'_>) -> PyResult<c_long> {
    py.import("threading")?
        .call_method0("get_ident")?
        .extract::<c_long>()
}

/// Render a Python error the way the interpreter prints it.
fn format_exception(py: Python<'_>, err: &PyErr) -> String {
    let formatted = py.import("traceback").and_then(|traceback| {
        traceback
            .call_method1(
                "format_exception",
                (err.get_type(py), err.value(py), err.traceback(py)),
            )?
            .extract::<Vec<String>>()
    });
    match formatted {
        Ok(parts) => parts.concat().trim_end_matches('\n').to_string(),
        Err(_) => err.to_string(),
    }
}

/// Runs source as CPython `__main__` code.
#[derive(Default)]
pub struct PythonEngine {
    stdout: Option<Box<dyn OutputSink>>,
    stderr: Option<Box<dyn OutputSink>>,
    stdin: Option<StdinHook>,
    interrupts: Option<InterruptSource>,
}

impl PythonEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that starts the interpreter on the worker thread.
    pub fn factory() -> EngineFactory {
        Box::new(|| {
            let version = Python::attach(|py| -> PyResult<String> {
                py.import("sys")?.getattr("version")?.extract()
            })
            .map_err(|e| BootError::load(e.to_string()))?;
            tracing::info!(%version, "Python runtime loaded");
            Ok(Box::new(PythonEngine::new()) as Box<dyn ExecutionEngine>)
        })
    }

    fn run_code(
        &mut self,
        py: Python<'_>,
        source: &str,
        filename: &str,
    ) -> PyResult<Result<(), PyErr>> {
        let sys = py.import("sys")?;
        let saved = (
            sys.getattr("stdout")?,
            sys.getattr("stderr")?,
            sys.getattr("stdin")?,
        );

        let stdout = Bound::new(
            py,
            HookWriter {
                sink: Mutex::new(self.stdout.take()),
            },
        )?;
        let stderr = Bound::new(
            py,
            HookWriter {
                sink: Mutex::new(self.stderr.take()),
            },
        )?;
        let stdin = Bound::new(
            py,
            HookReader {
                hook: Mutex::new(self.stdin.take()),
            },
        )?;
        sys.setattr("stdout", stdout)?;
        sys.setattr("stderr", stderr)?;
        sys.setattr("stdin", stdin)?;

        let builtins = py.import("builtins")?;
        let globals = PyDict::new(py);
        globals.set_item("__name__", "__main__")?;
        globals.set_item("__builtins__", &builtins)?;

        let outcome = builtins
            .getattr("compile")?
            .call1((source, filename, "exec"))
            .and_then(|code| builtins.getattr("exec")?.call1((code, &globals)))
            .map(|_| ());

        sys.setattr("stdout", saved.0)?;
        sys.setattr("stderr", saved.1)?;
        sys.setattr("stdin", saved.2)?;

        Ok(outcome)
    }
}

impl ExecutionEngine for PythonEngine {
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
        let py_thread_id = Python::attach(current_py_thread_id)
            .map_err(|e| ExecutionError::internal(format!("failed to get thread id: {e}")))?;
        let watcher = self
            .interrupts
            .clone()
            .map(|interrupts| InterruptWatcher::spawn(interrupts, py_thread_id));

        let result = Python::attach(|py| match self.run_code(py, source, filename) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                let traceback = format_exception(py, &err);
                if err.is_instance_of::<PyKeyboardInterrupt>(py) {
                    Err(ExecutionError::interrupted(traceback))
                } else {
                    Err(ExecutionError::raised(traceback))
                }
            }
            Err(err) => Err(ExecutionError::internal(format!(
                "failed to prepare interpreter: {err}"
            ))),
        });

        if let Some(watcher) = watcher {
            watcher.stop();
        }
        // A late injection must not leak into the next run.
        Python::attach(|_py| clear_async_exc(py_thread_id));

        result
    }

    fn name(&self) -> &'static str {
        "python"
    }
}
