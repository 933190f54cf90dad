//! Worker thread - runs the engine and may block.
//!
//! The worker owns the engine and the worker-side bridge handles. It receives
//! [`WorkerCommand`]s over a std channel and reports [`WorkerEvent`]s over a
//! tokio channel so the control side never blocks on it.

use std::any::Any;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::bridge::{BridgeError, InputWaiter, InterruptSource, StdinBridge};
use crate::engine::{BootError, EngineFactory, ExecutionEngine, ExecutionError};
use crate::protocol::{OutputEvent, RunId, WorkerCommand, WorkerEvent};
use crate::stream::{OutputWriter, StreamKind, StreamMultiplexer};

pub const WORKER_THREAD_NAME: &str = "pyterm-worker";

/// Everything the worker thread takes ownership of.
pub struct WorkerConfig {
    pub factory: EngineFactory,
    pub waiter: InputWaiter,
    pub interrupts: InterruptSource,
    pub entry_filename: String,
}

/// Control-side handle to a running worker thread.
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Queue a run. Returns false if the worker has exited.
    pub fn run(&self, run_id: RunId, source: String) -> bool {
        self.commands
            .send(WorkerCommand::Run { run_id, source })
            .is_ok()
    }

    /// Ask the worker to exit after its current run.
    pub fn request_shutdown(&self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
    }

    /// Block until the thread exits. Returns false if it panicked.
    pub fn join(mut self) -> bool {
        match self.thread.take() {
            Some(thread) => thread.join().is_ok(),
            None => true,
        }
    }

    /// Let the thread run on (or stay blocked) without us.
    pub fn detach(mut self) {
        if let Some(thread) = self.thread.take() {
            tracing::debug!(thread = ?thread.thread().id(), "Detaching worker thread");
        }
    }
}

/// Start the worker thread. Bootstrap happens on the new thread and its
/// outcome arrives as `Booted` or `BootFailed`.
pub fn spawn_worker(
    config: WorkerConfig,
    events: UnboundedSender<WorkerEvent>,
) -> io::Result<WorkerHandle> {
    let (commands_tx, commands_rx) = mpsc::channel();
    let thread = std::thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || run_worker(config, commands_rx, events))?;

    Ok(WorkerHandle {
        commands: commands_tx,
        thread: Some(thread),
    })
}

fn run_worker(
    config: WorkerConfig,
    commands: mpsc::Receiver<WorkerCommand>,
    events: UnboundedSender<WorkerEvent>,
) {
    let WorkerConfig {
        factory,
        waiter,
        interrupts,
        entry_filename,
    } = config;

    tracing::info!("Worker starting engine bootstrap");
    let mut engine = match catch_unwind(AssertUnwindSafe(factory)) {
        Ok(Ok(engine)) => engine,
        Ok(Err(error)) => {
            tracing::error!(error = %error, "Engine bootstrap failed");
            let _ = events.send(WorkerEvent::BootFailed { error });
            return;
        }
        Err(panic) => {
            let error = BootError::internal(panic_message(panic.as_ref()));
            tracing::error!(error = %error, "Engine bootstrap panicked");
            let _ = events.send(WorkerEvent::BootFailed { error });
            return;
        }
    };

    let stdin = {
        let events = events.clone();
        StdinBridge::new(waiter.with_interrupts(interrupts.clone()), move |ticket| {
            events
                .send(WorkerEvent::StdinRequested { ticket })
                .map_err(|_| BridgeError::Disconnected)
        })
    };

    tracing::info!(engine = engine.name(), "Worker ready");
    if events.send(WorkerEvent::Booted).is_err() {
        tracing::error!("Event channel closed before ready, exiting");
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Run { run_id, source } => {
                tracing::trace!(%run_id, "Run received");
                let event = execute_run(
                    engine.as_mut(),
                    &stdin,
                    &interrupts,
                    &entry_filename,
                    run_id,
                    &source,
                    &events,
                );
                if events.send(event).is_err() {
                    tracing::error!(%run_id, "Event channel closed (session gone?), exiting");
                    break;
                }
            }
            WorkerCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    tracing::info!("Worker exiting");
}

/// Install fresh hooks, run the program and flush its output.
fn execute_run(
    engine: &mut dyn ExecutionEngine,
    stdin: &StdinBridge,
    interrupts: &InterruptSource,
    filename: &str,
    run_id: RunId,
    source: &str,
    events: &UnboundedSender<WorkerEvent>,
) -> WorkerEvent {
    let output = StreamMultiplexer::new(ChannelWriter {
        events: events.clone(),
    });
    engine.configure_stdout(Box::new(output.sink(StreamKind::Stdout)));
    engine.configure_stderr(Box::new(output.sink(StreamKind::Stderr)));
    let bridge = stdin.clone();
    engine.configure_stdin(Box::new(move || bridge.read_line()));
    engine.configure_interrupt_source(interrupts.clone());

    let started = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(|| engine.execute(source, filename)))
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            tracing::error!(%run_id, %message, "Engine panicked during execute");
            Err(ExecutionError::internal(message))
        });
    let run_time = started.elapsed().as_secs_f64();
    output.finish();

    tracing::trace!(%run_id, ok = result.is_ok(), run_time, "Run finished");
    WorkerEvent::Finished {
        run_id,
        result,
        run_time,
    }
}

/// Forwards multiplexed output to the control side.
struct ChannelWriter {
    events: UnboundedSender<WorkerEvent>,
}

impl ChannelWriter {
    fn send(&self, event: OutputEvent) {
        if self.events.send(WorkerEvent::Output(event)).is_err() {
            tracing::trace!("Dropping output, event channel closed");
        }
    }
}

impl OutputWriter for ChannelWriter {
    fn write_fragment(&mut self, stream: StreamKind, text: &str) {
        self.send(OutputEvent::Fragment {
            stream,
            text: text.to_string(),
        });
    }

    fn write_line(&mut self, stream: StreamKind, text: &str, terminated: bool) {
        self.send(OutputEvent::Line {
            stream,
            text: text.to_string(),
            terminated,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("engine panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("engine panicked: {message}")
    } else {
        "engine panicked".to_string()
    }
}
