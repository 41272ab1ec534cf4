//! Typed error taxonomy for the Ralph orchestrator.
//!
//! One enum covers every subsystem (store, executor, engine, swarm); this
//! crate's call stack is shallow enough that a single taxonomy keeps error
//! handling at call sites consistent, while still giving callers a
//! `match`-able kind per error condition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RalphError {
    #[error("PRD '{0}' not found")]
    PrdNotFound(String),

    #[error("PRD '{name}' has invalid structure: {message}")]
    PrdInvalidStructure { name: String, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to spawn agent process: {0}")]
    AgentSpawnError(#[source] std::io::Error),

    #[error("agent exited with non-zero code {0}")]
    AgentNonZeroExit(i32),

    #[error("dependency '{dependency}' of PRD '{prd}' is not completed")]
    DependencyUnsatisfied { prd: String, dependency: String },

    #[error("a run is already active for PRD '{0}'")]
    DuplicateRun(String),

    #[error("failed to create worktree at {path}: {message}")]
    WorktreeCreateFailed { path: std::path::PathBuf, message: String },

    #[error("session backend unavailable: {0}")]
    SessionBackendUnavailable(String),

    #[error("merge conflict in PRD '{prd}': {files:?}")]
    MergeConflict { prd: String, files: Vec<String> },

    #[error("health check failed after {attempts} attempt(s): {message}")]
    HealthCheckFailed { attempts: u32, message: String },

    #[error("test result could not be determined for PRD '{0}'")]
    TestResultUnknown(String),

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("the destination status already has a PRD named '{0}'")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RalphError {
    /// Whether this error kind is advisory — logged and surfaced as an
    /// event, but does not by itself fail the enclosing run.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            RalphError::AgentNonZeroExit(_)
                | RalphError::HealthCheckFailed { .. }
                | RalphError::TestResultUnknown(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RalphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_kinds_are_flagged() {
        assert!(RalphError::AgentNonZeroExit(1).is_advisory());
        assert!(
            RalphError::HealthCheckFailed {
                attempts: 3,
                message: "x".into()
            }
            .is_advisory()
        );
        assert!(!RalphError::Cancelled.is_advisory());
    }

    #[test]
    fn prd_not_found_formats_name() {
        let err = RalphError::PrdNotFound("alpha".to_string());
        assert!(err.to_string().contains("alpha"));
    }
}
