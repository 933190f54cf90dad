//! Message types between the session (control side) and the worker thread.
//!
//! Two directions:
//! - **Commands** (control -> worker, std mpsc): Run, Shutdown
//! - **Events** (worker -> control, tokio mpsc): boot result, output, stdin
//!   requests, run completion

use serde::{Deserialize, Serialize};

use crate::bridge::InputTicket;
use crate::engine::{BootError, ExecutionError};
use crate::stream::StreamKind;

/// Unique identifier for one run of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commands from the session to the worker.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Run { run_id: RunId, source: String },

    /// Exit the worker loop after the current run.
    Shutdown,
}

/// Multiplexed program output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Text to show immediately.
    Fragment { stream: StreamKind, text: String },

    /// An assembled line.
    Line {
        stream: StreamKind,
        text: String,
        terminated: bool,
    },
}

/// Events from the worker to the session.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Engine bootstrap succeeded; the worker accepts runs.
    Booted,

    /// Engine bootstrap failed; the worker has exited.
    BootFailed { error: BootError },

    Output(OutputEvent),

    /// The program is blocked waiting for a line of input.
    StdinRequested { ticket: InputTicket },

    Finished {
        run_id: RunId,
        result: Result<(), ExecutionError>,
        run_time: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Outcome of one run, as handed back by `Session::run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub id: RunId,
    pub status: RunStatus,
    /// Sanitized error text for failed or canceled runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock seconds spent in `execute`.
    pub run_time: f64,
}

impl RunReport {
    pub fn error_lines(&self) -> Vec<&str> {
        self.error
            .as_deref()
            .map(|error| error.lines().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_id() -> RunId {
        RunId::parse("6f1c2e2a-4d55-4b8e-9a0e-0d7c1b9e5f21").unwrap()
    }

    #[test]
    fn run_id_round_trips_through_display() {
        let id = RunId::new();
        assert_eq!(RunId::parse(&id.to_string()).unwrap(), id);
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn run_id_rejects_garbage() {
        assert!(RunId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn output_event_is_tagged_snake_case() {
        insta::assert_json_snapshot!(
            [
                OutputEvent::Fragment {
                    stream: StreamKind::Stdout,
                    text: "N".into(),
                },
                OutputEvent::Line {
                    stream: StreamKind::Stderr,
                    text: "boom".into(),
                    terminated: true,
                },
            ],
            @r#"
        [
          {
            "type": "fragment",
            "stream": "stdout",
            "text": "N"
          },
          {
            "type": "line",
            "stream": "stderr",
            "text": "boom",
            "terminated": true
          }
        ]
        "#
        );
    }

    #[test]
    fn succeeded_report_omits_error() {
        let report = RunReport {
            id: fixed_id(),
            status: RunStatus::Succeeded,
            error: None,
            run_time: 0.5,
        };

        insta::assert_json_snapshot!(report, @r#"
        {
          "id": "6f1c2e2a-4d55-4b8e-9a0e-0d7c1b9e5f21",
          "status": "succeeded",
          "run_time": 0.5
        }
        "#);
    }

    #[test]
    fn failed_report_carries_error() {
        let report = RunReport {
            id: fixed_id(),
            status: RunStatus::Failed,
            error: Some("  File \"main.py\", line 1, in <module>\nNameError: x".into()),
            run_time: 0.25,
        };

        insta::assert_json_snapshot!(report, @r#"
        {
          "id": "6f1c2e2a-4d55-4b8e-9a0e-0d7c1b9e5f21",
          "status": "failed",
          "error": "  File \"main.py\", line 1, in <module>\nNameError: x",
          "run_time": 0.25
        }
        "#);
        assert_eq!(
            report.error_lines(),
            vec!["  File \"main.py\", line 1, in <module>", "NameError: x"]
        );
    }

    #[test]
    fn run_status_deserializes_snake_case() {
        assert_eq!(
            serde_json::from_str::<RunStatus>("\"canceled\"").unwrap(),
            RunStatus::Canceled
        );
        assert_eq!(RunStatus::Failed.as_str(), "failed");
        assert!(RunStatus::Succeeded.is_success());
    }
}
