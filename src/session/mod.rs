//! Session Backend: the capability set a swarm run's interactive pane needs,
//! plus one reference implementation backed by the `tmux` binary.
//!
//! No session-backend client library is part of the dependency stack and
//! none is warranted — every operation here is a `tmux` subcommand invoked
//! the same way [`crate::executor::run`] invokes an agent process, via
//! `tokio::process::Command`.

pub mod tmux;

use async_trait::async_trait;

use ralph_common::RalphError;

pub use tmux::TmuxBackend;

#[derive(Debug, Clone)]
pub struct PaneInfo {
    pub pane_id: String,
    pub window_id: String,
    pub title: String,
}

pub struct CreatePaneOptions<'a> {
    pub title: &'a str,
    pub command: Option<&'a str>,
    pub window_id: Option<&'a str>,
}

/// Capability set any session backend must provide in full.
/// `async_trait` mirrors how the executor already exposes its async
/// surface; a PTY/WebSocket backend suitable for a web UI is an equally
/// legitimate implementation of this trait.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn ensure_session(&self, name: &str) -> Result<(), RalphError>;
    async fn session_exists(&self, name: &str) -> Result<bool, RalphError>;
    async fn destroy_session(&self, name: &str) -> Result<(), RalphError>;

    async fn create_pane(&self, session: &str, opts: CreatePaneOptions<'_>) -> Result<PaneInfo, RalphError>;
    async fn destroy_pane(&self, pane_id: &str) -> Result<(), RalphError>;

    async fn send_command(&self, pane_id: &str, text: &str) -> Result<(), RalphError>;
    async fn send_interrupt(&self, pane_id: &str) -> Result<(), RalphError>;

    async fn rebalance(&self, session: &str, window_id: Option<&str>) -> Result<(), RalphError>;
    async fn get_pane_count(&self, session: &str) -> Result<u32, RalphError>;

    async fn list_panes(&self, session: &str) -> Result<Vec<PaneInfo>, RalphError>;
    async fn is_pane_alive(&self, pane_id: &str) -> Result<bool, RalphError>;

    /// Interactive focus; backends that cannot focus return success without
    /// effect rather than an error.
    async fn focus_pane(&self, pane_id: &str) -> Result<(), RalphError>;

    /// Startup capability probe.
    async fn is_available(&self) -> bool;

    /// Last `n` lines of a pane's scrollback, used by `swarm logs`.
    async fn capture_pane(&self, pane_id: &str, tail: usize) -> Result<Vec<String>, RalphError>;
}
