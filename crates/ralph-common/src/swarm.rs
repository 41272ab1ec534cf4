//! Swarm state domain types: `swarm.json` under the project's state root.
//!
//! Mirrors the `prd` module's split — these are the field-for-field shapes
//! persisted to disk; the swarm manager in the main crate owns reading,
//! writing, and reconciling them against session-backend reality.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    Stale,
}

/// One PRD's active (or once-active) run: its worktree, branch, and pane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub worktree: std::path::PathBuf,
    pub branch: String,
    pub pane_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
}

/// `swarm.json`'s full shape: which session backend session is in use, and
/// the map of PRD name to its run entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmState {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub runs: BTreeMap<String, RunEntry>,
}

impl SwarmState {
    pub fn running_prds(&self) -> impl Iterator<Item = &str> {
        self.runs
            .iter()
            .filter(|(_, e)| e.status == RunStatus::Running)
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swarm_state_round_trips_through_json() {
        let mut state = SwarmState::default();
        state.session = Some("ralph".to_string());
        state.runs.insert(
            "alpha".to_string(),
            RunEntry {
                worktree: "/tmp/alpha".into(),
                branch: "alpha".to_string(),
                pane_id: "%1".to_string(),
                started_at: chrono::Utc::now(),
                status: RunStatus::Running,
                window_id: None,
            },
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: SwarmState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.runs.len(), 1);
        assert_eq!(back.running_prds().collect::<Vec<_>>(), vec!["alpha"]);
    }
}
