//! Execution session controller.
//!
//! Owns the lifecycle (`Uninitialized -> Initializing -> Ready <-> Running`,
//! `Initializing -> Failed`) and the control side of the bridge. A pump task
//! routes worker events: output to the display, stdin requests to a fulfill
//! task reading from the [`InputSource`], run completion to the waiting
//! [`Session::run`] call.
//!
//! Nothing here blocks the async runtime. The worker thread is the only place
//! that waits.

use std::io;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, BridgeError, InputResponder, InputTicket, InterruptTrigger, interrupt};
use crate::config::SessionConfig;
use crate::engine::{BootError, EngineFactory, ExecutionError};
use crate::protocol::{OutputEvent, RunId, RunReport, RunStatus, WorkerEvent};
use crate::sanitize::Sanitizer;
use crate::stream::StreamKind;
use crate::worker::{WorkerConfig, WorkerHandle, spawn_worker};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle messages for the display, distinct from program output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Ready,
    /// Bootstrap failed; carries the error verbatim.
    Failed(String),
    /// The control side broke the stdin protocol; the run is being stopped.
    Fault(String),
}

impl SessionStatus {
    pub fn message(&self) -> &str {
        match self {
            Self::Initializing => "Loading runtime, please wait...",
            Self::Ready => "Runtime loaded. Ready to run.",
            Self::Failed(message) | Self::Fault(message) => message,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Fault(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not ready")]
    NotReady,

    #[error("a program is already running")]
    Busy,

    #[error("no program is running")]
    NotRunning,

    #[error("session is already initialized")]
    AlreadyInitialized,

    /// Engine bootstrap failed.
    #[error(transparent)]
    Init(#[from] BootError),

    /// The worker exited while work was outstanding.
    #[error("worker thread is gone")]
    WorkerGone,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Where program input comes from.
#[async_trait::async_trait]
pub trait InputSource: Send + Sync {
    /// The next line typed by the user. `None` means end of input.
    async fn next_line(&self) -> io::Result<Option<String>>;
}

/// Where program output and lifecycle messages go.
pub trait TerminalDisplay: Send + Sync {
    /// Text to show immediately (no line break).
    fn fragment(&self, stream: StreamKind, text: &str);

    /// An assembled line; its text was already shown as fragments.
    fn line(&self, stream: StreamKind, text: &str, terminated: bool);

    /// Sanitized error text of a failed run, styled as an error.
    fn error_lines(&self, lines: &[String]);

    fn status(&self, status: &SessionStatus);
}

struct PendingRun {
    run_id: RunId,
    done: oneshot::Sender<RunReport>,
}

struct Runtime {
    worker: WorkerHandle,
    responder: Arc<InputResponder>,
    trigger: InterruptTrigger,
    pump: tokio::task::JoinHandle<()>,
}

impl Runtime {
    /// Release a worker that may be blocked and tell it to exit.
    fn release(&self) {
        self.trigger.raise();
        self.responder.wake();
        self.worker.request_shutdown();
        self.pump.abort();
    }
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    /// Bumped whenever the runtime is replaced, so stale pumps stay quiet.
    generation: u64,
    runtime: Option<Runtime>,
    pending: Option<PendingRun>,
    input_read: Option<CancellationToken>,
}

impl Inner {
    fn cancel_input_read(&mut self) {
        if let Some(token) = self.input_read.take() {
            token.cancel();
        }
    }

    /// Detach the current runtime and reset to `Uninitialized`.
    fn take_runtime(&mut self) -> Option<Runtime> {
        self.generation += 1;
        self.state = SessionState::Uninitialized;
        self.pending = None;
        self.cancel_input_read();
        self.runtime.take()
    }
}

struct Shared {
    input: Arc<dyn InputSource>,
    display: Arc<dyn TerminalDisplay>,
    sanitizer: Sanitizer,
    inner: StdMutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Session mutex poisoned, continuing with inner state");
            PoisonError::into_inner(poisoned)
        })
    }
}

/// One execution session: a worker, its bridge, and the lifecycle around it.
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        input: Arc<dyn InputSource>,
        display: Arc<dyn TerminalDisplay>,
    ) -> Self {
        let sanitizer = config.sanitizer();
        Self {
            config,
            shared: Arc::new(Shared {
                input,
                display,
                sanitizer,
                inner: StdMutex::new(Inner::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Allocate the bridge, spawn the worker and wait for the engine to boot.
    ///
    /// Valid from `Uninitialized` or `Failed`. Boot errors are returned as-is
    /// and leave the session `Failed`.
    pub async fn initialize(&self, factory: EngineFactory) -> Result<(), SessionError> {
        let generation = {
            let mut inner = self.shared.lock();
            match inner.state {
                SessionState::Uninitialized | SessionState::Failed => {}
                _ => return Err(SessionError::AlreadyInitialized),
            }
            inner.generation += 1;
            inner.state = SessionState::Initializing;
            inner.generation
        };
        let mut guard = InitGuard {
            shared: &self.shared,
            generation,
            armed: true,
        };
        self.shared.display.status(&SessionStatus::Initializing);
        tracing::info!(
            capacity = self.config.input_capacity,
            entry = %self.config.entry_filename,
            "Initializing session"
        );

        let (responder, waiter) = match bridge::allocate(self.config.input_capacity) {
            Ok(handles) => handles,
            Err(e) => {
                guard.fail(&e.to_string());
                return Err(e.into());
            }
        };
        let (trigger, interrupts) = interrupt::allocate();
        let (events_tx, mut events) = unbounded_channel();

        let worker = match spawn_worker(
            WorkerConfig {
                factory,
                waiter,
                interrupts,
                entry_filename: self.config.entry_filename.clone(),
            },
            events_tx,
        ) {
            Ok(worker) => worker,
            Err(e) => {
                guard.fail(&format!("failed to spawn worker thread: {e}"));
                return Err(SessionError::Spawn(e));
            }
        };

        if let Err(error) = wait_for_boot(&mut events, self.config.boot_timeout).await {
            guard.fail(&error.to_string());
            worker.detach();
            return Err(error.into());
        }

        let responder = Arc::new(responder);
        let pump = Pump {
            shared: Arc::clone(&self.shared),
            generation,
            responder: Arc::clone(&responder),
            trigger: trigger.clone(),
        };

        {
            let mut inner = self.shared.lock();
            if inner.generation != generation {
                // Shut down or restarted while we were booting.
                worker.request_shutdown();
                worker.detach();
                guard.disarm();
                return Err(SessionError::NotReady);
            }
            inner.runtime = Some(Runtime {
                worker,
                responder,
                trigger,
                pump: tokio::spawn(pump.run(events)),
            });
            inner.state = SessionState::Ready;
        }
        guard.disarm();

        tracing::info!("Session ready");
        self.shared.display.status(&SessionStatus::Ready);
        Ok(())
    }

    /// Run `source` and wait for its report.
    ///
    /// Valid only from `Ready`. Dropping the returned future before it
    /// completes requests a stop.
    pub async fn run(&self, source: impl Into<String>) -> Result<RunReport, SessionError> {
        let run_id = RunId::new();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut inner = self.shared.lock();
            match inner.state {
                SessionState::Ready => {}
                SessionState::Running => return Err(SessionError::Busy),
                _ => return Err(SessionError::NotReady),
            }
            let Some(runtime) = inner.runtime.as_ref() else {
                return Err(SessionError::NotReady);
            };

            runtime.trigger.clear();
            runtime.responder.reset();
            if !runtime.worker.run(run_id, source.into()) {
                tracing::error!(%run_id, "Worker is gone, cannot start run");
                inner.state = SessionState::Failed;
                return Err(SessionError::WorkerGone);
            }
            inner.state = SessionState::Running;
            inner.pending = Some(PendingRun {
                run_id,
                done: done_tx,
            });
        }
        tracing::info!(%run_id, "Run started");

        let mut guard = StopOnDrop {
            session: self,
            run_id,
            armed: true,
        };
        let report = done_rx.await.map_err(|_| SessionError::WorkerGone);
        guard.disarm();
        report
    }

    /// Request cancellation of the current run.
    ///
    /// Raises the interrupt flag for the engine to poll, wakes a worker blocked
    /// on stdin and abandons the pending input read. The run still ends through
    /// the engine, as a canceled report.
    pub fn stop(&self) -> Result<(), SessionError> {
        let mut inner = self.shared.lock();
        if inner.state != SessionState::Running {
            return Err(SessionError::NotRunning);
        }
        Self::request_stop(&mut inner);
        Ok(())
    }

    /// Stop only if `run_id` is still the run in flight.
    fn stop_run(&self, run_id: RunId) {
        let mut inner = self.shared.lock();
        if inner.state != SessionState::Running
            || inner.pending.as_ref().map(|pending| pending.run_id) != Some(run_id)
        {
            tracing::trace!(%run_id, "Run already over, nothing to stop");
            return;
        }
        Self::request_stop(&mut inner);
    }

    fn request_stop(inner: &mut Inner) {
        if let Some(runtime) = inner.runtime.as_ref() {
            runtime.trigger.raise();
            runtime.responder.wake();
        }
        inner.cancel_input_read();
        tracing::info!("Stop requested");
    }

    /// Ask the worker to exit and wait up to `shutdown_timeout` for it.
    ///
    /// A running program is stopped first. The session ends `Uninitialized`.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let Some(runtime) = self.shared.lock().take_runtime() else {
            return Ok(());
        };
        runtime.release();

        let Runtime { worker, .. } = runtime;
        let timeout = self.config.shutdown_timeout;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || worker.join()))
            .await
        {
            Ok(Ok(true)) => tracing::info!("Worker exited"),
            Ok(Ok(false)) => tracing::warn!("Worker thread panicked"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to join worker thread"),
            Err(_) => tracing::warn!(?timeout, "Worker did not exit in time, detaching"),
        }
        Ok(())
    }

    /// Full stop: discard the worker without waiting and start a fresh one.
    pub async fn restart(&self, factory: EngineFactory) -> Result<(), SessionError> {
        if let Some(runtime) = self.shared.lock().take_runtime() {
            tracing::info!("Discarding worker for restart");
            runtime.release();
            runtime.worker.detach();
        }
        self.initialize(factory).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(runtime) = self.shared.lock().take_runtime() {
            runtime.release();
            runtime.worker.detach();
        }
    }
}

async fn wait_for_boot(
    events: &mut UnboundedReceiver<WorkerEvent>,
    timeout: std::time::Duration,
) -> Result<(), BootError> {
    let boot = async {
        loop {
            match events.recv().await {
                Some(WorkerEvent::Booted) => return Ok(()),
                Some(WorkerEvent::BootFailed { error }) => return Err(error),
                Some(other) => tracing::trace!(?other, "Ignoring event before boot"),
                None => {
                    return Err(BootError::internal("worker exited during bootstrap"));
                }
            }
        }
    };
    tokio::time::timeout(timeout, boot)
        .await
        .unwrap_or_else(|_| {
            Err(BootError::internal(format!(
                "bootstrap timed out after {timeout:?}"
            )))
        })
}

/// Marks the session `Failed` if initialization does not complete.
struct InitGuard<'a> {
    shared: &'a Shared,
    generation: u64,
    armed: bool,
}

impl InitGuard<'_> {
    fn fail(&mut self, message: &str) {
        self.armed = false;
        {
            let mut inner = self.shared.lock();
            if inner.generation != self.generation {
                return;
            }
            inner.state = SessionState::Failed;
        }
        tracing::error!(error = %message, "Session initialization failed");
        self.shared
            .display
            .status(&SessionStatus::Failed(message.to_string()));
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.shared.lock();
            if inner.generation == self.generation && inner.state == SessionState::Initializing {
                inner.state = SessionState::Failed;
            }
        }
    }
}

/// Stops the run if `Session::run` is dropped before completion.
struct StopOnDrop<'a> {
    session: &'a Session,
    run_id: RunId,
    armed: bool,
}

impl StopOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(run_id = %self.run_id, "Run future dropped, requesting stop");
            self.session.stop_run(self.run_id);
        }
    }
}

/// Routes worker events for one runtime generation.
#[derive(Clone)]
struct Pump {
    shared: Arc<Shared>,
    generation: u64,
    responder: Arc<InputResponder>,
    trigger: InterruptTrigger,
}

impl Pump {
    async fn run(self, mut events: UnboundedReceiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Output(OutputEvent::Fragment { stream, text }) => {
                    self.shared.display.fragment(stream, &text);
                }
                WorkerEvent::Output(OutputEvent::Line {
                    stream,
                    text,
                    terminated,
                }) => {
                    self.shared.display.line(stream, &text, terminated);
                }
                WorkerEvent::StdinRequested { ticket } => self.start_input_read(ticket),
                WorkerEvent::Finished {
                    run_id,
                    result,
                    run_time,
                } => self.finish_run(run_id, result, run_time),
                WorkerEvent::Booted | WorkerEvent::BootFailed { .. } => {
                    tracing::warn!("Unexpected boot event after initialization");
                }
            }
        }
        self.worker_exited();
    }

    fn start_input_read(&self, ticket: InputTicket) {
        let token = CancellationToken::new();
        {
            let mut inner = self.shared.lock();
            if inner.generation != self.generation {
                return;
            }
            inner.cancel_input_read();
            inner.input_read = Some(token.clone());
        }
        tracing::trace!(%ticket, "Reading a line for the worker");
        tokio::spawn(self.clone().fulfill(ticket, token));
    }

    async fn fulfill(self, ticket: InputTicket, token: CancellationToken) {
        let line = tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(%ticket, "Input read abandoned");
                return;
            }
            line = self.shared.input.next_line() => line,
        };

        let text = match line {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(%ticket, "End of input, answering with an empty line");
                String::new()
            }
            Err(e) => {
                self.fault(format!("Failed to read input: {e}"));
                return;
            }
        };

        match self.responder.fulfill(ticket, &text) {
            Ok(()) => {}
            Err(BridgeError::StaleTicket { .. }) => {
                tracing::debug!(%ticket, "Input arrived after the worker stopped waiting");
            }
            Err(e) => self.fault(format!("Input rejected: {e}")),
        }
    }

    /// Report a protocol violation and release the worker so the run ends.
    fn fault(&self, message: String) {
        tracing::error!(error = %message, "Stdin protocol fault, stopping run");
        self.shared
            .display
            .status(&SessionStatus::Fault(message));
        self.trigger.raise();
        self.responder.wake();
    }

    fn finish_run(&self, run_id: RunId, result: Result<(), ExecutionError>, run_time: f64) {
        let (status, error) = match &result {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(e) => {
                let status = if e.is_interrupt() {
                    RunStatus::Canceled
                } else {
                    RunStatus::Failed
                };
                (status, self.shared.sanitizer.filter_text(&e.traceback()))
            }
        };
        let report = RunReport {
            id: run_id,
            status,
            error,
            run_time,
        };
        tracing::info!(%run_id, status = status.as_str(), run_time, "Run finished");

        let pending = {
            let mut inner = self.shared.lock();
            if inner.generation != self.generation {
                return;
            }
            inner.cancel_input_read();
            let pending = inner.pending.take_if(|pending| pending.run_id == run_id);
            if inner.state == SessionState::Running {
                inner.state = SessionState::Ready;
            }
            pending
        };

        let lines: Vec<String> = report.error_lines().into_iter().map(String::from).collect();
        if !lines.is_empty() {
            self.shared.display.error_lines(&lines);
        }

        match pending {
            Some(pending) => {
                if pending.done.send(report).is_err() {
                    tracing::debug!(%run_id, "Run caller went away before the report");
                }
            }
            None => tracing::warn!(%run_id, "Finished event for an unknown run"),
        }
    }

    fn worker_exited(&self) {
        let mut inner = self.shared.lock();
        if inner.generation != self.generation {
            return;
        }
        tracing::error!(state = %inner.state, "Worker event channel closed");
        inner.pending = None;
        inner.cancel_input_read();
        inner.runtime = None;
        inner.state = SessionState::Failed;
    }
}
