//! Engine event stream types.
//!
//! Every operation the orchestration engine performs emits one or more
//! `Event`s; the daemon's event bus forwards them to subscribers and the
//! CLI prints them directly. The sequence number is assigned by the
//! emitter (one per engine invocation) and is strictly increasing within
//! that invocation — see the engine's `EventEmitter`.

use serde::{Deserialize, Serialize};

use crate::prd::StoryStatus;

/// A single emitted event, envelope plus payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing within one engine invocation, starting at 0.
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub prd: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(seq: u64, prd: impl Into<String>, kind: EventKind) -> Self {
        Self {
            seq,
            timestamp: chrono::Utc::now(),
            prd: prd.into(),
            kind,
        }
    }

    /// Terminal events end an engine invocation's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete { .. } | EventKind::Error { .. })
    }
}

/// The payload of an event. Tagged so consumers get exhaustive dispatch
/// without guessing at shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Log { level: LogLevel, message: String },
    StateChange { from: String, to: String },
    StoryUpdate { story_id: String, status: StoryStatus },
    Iteration { number: u32 },
    AgentOutput { chunk: String },
    AgentExit { code: i32 },
    HealthCheckStart,
    HealthCheckProgress { attempt: u32, elapsed_secs: u64 },
    HealthCheckPassed,
    HealthCheckFailed { reason: String },
    ReviewAgentComplete { phase: String, aspect: String, approved: bool },
    ReviewPhaseComplete { phase: String, clean: bool },
    TestComplete { outcome: TestOutcome, issues: Vec<String> },
    Complete { outcome: String },
    Error { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Verified,
    Failed,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_detection() {
        let complete = Event::new(0, "alpha", EventKind::Complete { outcome: "ok".into() });
        assert!(complete.is_terminal());
        let log = Event::new(0, "alpha", EventKind::Log { level: LogLevel::Info, message: "hi".into() });
        assert!(!log.is_terminal());
    }

    #[test]
    fn event_serializes_with_flattened_kind() {
        let e = Event::new(3, "alpha", EventKind::Iteration { number: 2 });
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "iteration");
        assert_eq!(json["number"], 2);
        assert_eq!(json["seq"], 3);
    }
}
