//! Execution events emitted by runners and the scheduler.
//!
//! The engine never prints. Everything a presentation layer needs to render
//! progress arrives as an [`Event`] on an [`EventSink`].

use crate::run::{JobSummary, Status, StepResult};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Job lifecycle
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepOutput(StepOutputPayload),
    StepRetrying(StepRetryingPayload),
    StepCompleted(StepCompletedPayload),

    // Diagnostics
    Warning(WarningPayload),
    DryRun(DryRunPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub job: String,
    pub runner: String,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub job: String,
    pub status: Status,
    pub summary: JobSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepStartedPayload {
    pub job: String,
    pub step: String,
    /// 1-based position within the job.
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepOutputPayload {
    pub job: String,
    pub step: String,
    pub stream: OutputStream,
    pub line: String,
    pub line_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepRetryingPayload {
    pub job: String,
    pub step: String,
    /// Attempt about to start, 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub job: String,
    pub result: StepResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WarningPayload {
    pub job: Option<String>,
    pub message: String,
}

/// A command or container a dry run would have executed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DryRunPayload {
    pub job: String,
    pub step: Option<String>,
    pub plan: String,
}

/// Sending half for execution events. A disabled sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink together with its receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is rendering.
            let _ = tx.send(event);
        }
    }

    pub fn warn(&self, job: Option<&str>, message: impl Into<String>) {
        self.emit(Event::Warning(WarningPayload {
            job: job.map(str::to_string),
            message: message.into(),
        }));
    }

    pub fn dry_run(&self, job: &str, step: Option<&str>, plan: impl Into<String>) {
        self.emit(Event::DryRun(DryRunPayload {
            job: job.to_string(),
            step: step.map(str::to_string),
            plan: plan.into(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_sink_drops_events() {
        let sink = EventSink::disabled();
        sink.warn(None, "nobody listens");
    }

    #[test]
    fn test_channel_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.warn(Some("build"), "first");
        sink.dry_run("build", Some("compile"), "bash -eo pipefail -c make");

        match rx.try_recv().unwrap() {
            Event::Warning(w) => {
                assert_eq!(w.job.as_deref(), Some("build"));
                assert_eq!(w.message, "first");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Event::DryRun(d) => assert_eq!(d.plan, "bash -eo pipefail -c make"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_tagged_serialization() {
        let event = Event::Warning(WarningPayload {
            job: None,
            message: "cleanup failed".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "warning");
        assert_eq!(json["message"], "cleanup failed");
    }
}
