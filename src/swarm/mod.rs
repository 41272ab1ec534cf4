//! Swarm Manager: runs multiple PRDs in parallel, each bound to its own git
//! worktree and an interactive pane on a [`SessionBackend`].
//!
//! `swarm.json` is the one piece of state this module owns; every operation
//! loads it, mutates it, and saves it back under `lock`, mirroring the
//! store's read-modify-write convention but guarded by an explicit mutex
//! since a swarm run spans several awaited steps (not one atomic write).

use std::path::PathBuf;
use std::sync::Arc;

use ralph_common::prd::PrdStatus;
use ralph_common::swarm::{RunEntry, RunStatus, SwarmState};
use ralph_common::RalphError;

use crate::config::RalphConfig;
use crate::engine::prompts;
use crate::executor::{self, RunOptions};
use crate::prd::PrdStore;
use crate::session::{CreatePaneOptions, SessionBackend};
use crate::util::atomic_write;
use crate::worktree::{ConflictReport, WorktreeManager};

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub prd: String,
    pub merged: bool,
    pub output: String,
    pub conflict: Option<ConflictReport>,
}

#[derive(Debug, Clone, Default)]
pub struct RecoverReport {
    pub recovered: Vec<String>,
    pub orphaned: Vec<String>,
    pub cleaned: Vec<String>,
}

pub struct SwarmManager {
    state_path: PathBuf,
    session_name: String,
    worktrees: WorktreeManager,
    session: Arc<dyn SessionBackend>,
    store: PrdStore,
    config: RalphConfig,
    lock: tokio::sync::Mutex<()>,
}

impl SwarmManager {
    pub fn new(
        state_dir: &std::path::Path,
        repo_root: PathBuf,
        session_name: impl Into<String>,
        session: Arc<dyn SessionBackend>,
        store: PrdStore,
        config: RalphConfig,
    ) -> Self {
        let worktrees = WorktreeManager::new(repo_root, config.swarm.clone());
        Self {
            state_path: state_dir.join("swarm.json"),
            session_name: session_name.into(),
            worktrees,
            session,
            store,
            config,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn load_state(&self) -> Result<SwarmState, RalphError> {
        match std::fs::read_to_string(&self.state_path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| RalphError::Other(e.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SwarmState::default()),
            Err(source) => Err(RalphError::Io { path: self.state_path.clone(), source }),
        }
    }

    fn save_state(&self, state: &SwarmState) -> Result<(), RalphError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| RalphError::Other(e.into()))?;
        atomic_write(&self.state_path, &json)
    }

    fn check_startable(&self, prd: &str, state: &SwarmState) -> Result<(), RalphError> {
        if matches!(state.runs.get(prd), Some(entry) if entry.status == RunStatus::Running) {
            return Err(RalphError::DuplicateRun(prd.to_string()));
        }
        let status = self
            .store
            .find_location(prd)
            .ok_or_else(|| RalphError::PrdNotFound(prd.to_string()))?;
        if !matches!(status, PrdStatus::Pending | PrdStatus::InProgress) {
            return Err(RalphError::PrdInvalidStructure {
                name: prd.to_string(),
                message: format!("cannot start a run while PRD is '{status}'"),
            });
        }
        let record = self.store.get(prd)?;
        if record.stories.is_empty() {
            return Err(RalphError::PrdInvalidStructure { name: prd.to_string(), message: "PRD has no stories".to_string() });
        }
        for dependency in &record.dependencies {
            if self.store.find_location(dependency) != Some(PrdStatus::Completed) {
                return Err(RalphError::DependencyUnsatisfied { prd: prd.to_string(), dependency: dependency.clone() });
            }
        }
        Ok(())
    }

    /// Create (or reuse) `prd`'s worktree and pane, then send the command
    /// that drives the engine's develop loop inside it.
    pub async fn start(&self, prd: &str, agent: Option<&str>) -> Result<RunEntry, RalphError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_state()?;
        self.check_startable(prd, &state)?;

        let path = if self.worktrees.exists(prd) { self.worktrees.worktree_path(prd) } else { self.worktrees.create(prd).await? };

        self.session.ensure_session(&self.session_name).await?;
        let pane = self
            .session
            .create_pane(&self.session_name, CreatePaneOptions { title: prd, command: None, window_id: None })
            .await?;
        self.session.rebalance(&self.session_name, pane.window_id.as_str().into()).await.ok();

        let command = run_command("start", prd, agent, &path);
        self.session.send_command(&pane.pane_id, &command).await?;

        let entry = RunEntry {
            worktree: path,
            branch: prd.to_string(),
            pane_id: pane.pane_id,
            started_at: chrono::Utc::now(),
            status: RunStatus::Running,
            window_id: Some(pane.window_id),
        };
        state.runs.insert(prd.to_string(), entry.clone());
        state.session = Some(self.session_name.clone());
        self.save_state(&state)?;
        Ok(entry)
    }

    /// Same as `start` but drives the engine's test run; requires the
    /// worktree from a prior `start` to already exist.
    pub async fn test(&self, prd: &str, agent: Option<&str>) -> Result<RunEntry, RalphError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_state()?;
        if !self.worktrees.exists(prd) {
            return Err(RalphError::PrdInvalidStructure { name: prd.to_string(), message: "no worktree; run start first".to_string() });
        }
        let path = self.worktrees.worktree_path(prd);

        self.session.ensure_session(&self.session_name).await?;
        let pane = self
            .session
            .create_pane(&self.session_name, CreatePaneOptions { title: prd, command: None, window_id: None })
            .await?;

        let command = run_command("test", prd, agent, &path);
        self.session.send_command(&pane.pane_id, &command).await?;

        let entry = RunEntry {
            worktree: path,
            branch: prd.to_string(),
            pane_id: pane.pane_id,
            started_at: chrono::Utc::now(),
            status: RunStatus::Running,
            window_id: Some(pane.window_id),
        };
        state.runs.insert(prd.to_string(), entry.clone());
        self.save_state(&state)?;
        Ok(entry)
    }

    pub async fn stop(&self, prd: &str) -> Result<(), RalphError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_state()?;
        let entry = state.runs.get_mut(prd).ok_or_else(|| RalphError::PrdNotFound(prd.to_string()))?;
        self.session.send_interrupt(&entry.pane_id).await?;
        entry.status = RunStatus::Stopped;
        self.save_state(&state)?;
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<(), RalphError> {
        let names: Vec<String> = {
            let state = self.load_state()?;
            state.running_prds().map(str::to_string).collect()
        };
        for name in names {
            self.stop(&name).await?;
        }
        Ok(())
    }

    /// Reconcile every persisted run against the live session backend,
    /// marking any whose pane has died `stale`.
    pub async fn list(&self) -> Result<Vec<(String, RunEntry)>, RalphError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_state()?;
        for (_, entry) in state.runs.iter_mut() {
            if entry.status == RunStatus::Running && !self.session.is_pane_alive(&entry.pane_id).await.unwrap_or(false) {
                entry.status = RunStatus::Stale;
            }
        }
        self.save_state(&state)?;
        Ok(state.runs.into_iter().collect())
    }

    pub async fn attach(&self, prd: &str) -> Result<(), RalphError> {
        let state = self.load_state()?;
        let entry = state.runs.get(prd).ok_or_else(|| RalphError::PrdNotFound(prd.to_string()))?;
        self.session.focus_pane(&entry.pane_id).await
    }

    pub async fn logs(&self, prd: &str, tail: usize) -> Result<Vec<String>, RalphError> {
        let state = self.load_state()?;
        let entry = state.runs.get(prd).ok_or_else(|| RalphError::PrdNotFound(prd.to_string()))?;
        self.session.capture_pane(&entry.pane_id, tail).await
    }

    /// Invoke the merge agent against the main worktree, asking it to merge
    /// `prd`'s branch into the project's main branch. Unresolved conflicts
    /// are reported, never resolved here.
    pub async fn merge(&self, prd: &str) -> Result<MergeReport, RalphError> {
        let main_branch = self.worktrees.main_branch()?;
        let conflict = self.worktrees.check_conflicts(prd, prd, &main_branch).await?;
        if !conflict.is_clean() {
            return Ok(MergeReport { prd: prd.to_string(), merged: false, output: String::new(), conflict: Some(conflict) });
        }

        let agent_name = self.config.swarm.merge_agent.as_deref().unwrap_or(&self.config.default_agent);
        let agent = self.config.agent(Some(agent_name))?;
        let prompt = prompts::merge_prompt(prd, &main_branch);
        let result = executor::run(&prompt, agent, RunOptions::default()).await?;

        Ok(MergeReport { prd: prd.to_string(), merged: true, output: result.output, conflict: None })
    }

    pub async fn merge_all(&self) -> Result<Vec<MergeReport>, RalphError> {
        let names: Vec<String> = {
            let state = self.load_state()?;
            state.runs.keys().cloned().collect()
        };
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(self.merge(&name).await?);
        }
        Ok(reports)
    }

    /// Remove the worktree, destroy the pane, and drop the state entry.
    /// Idempotent: a missing worktree/pane/entry is not an error.
    pub async fn cleanup(&self, prd: &str) -> Result<(), RalphError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_state()?;
        if let Some(entry) = state.runs.get(prd) {
            let _ = self.session.destroy_pane(&entry.pane_id).await;
        }
        self.worktrees.remove(prd)?;
        state.runs.remove(prd);
        self.save_state(&state)?;
        Ok(())
    }

    pub async fn cleanup_all(&self) -> Result<(), RalphError> {
        let names: Vec<String> = {
            let state = self.load_state()?;
            state.runs.keys().cloned().collect()
        };
        for name in names {
            self.cleanup(&name).await?;
        }
        Ok(())
    }

    /// Scan state and partition every entry by whether its pane and
    /// worktree are still present. Never restarts anything.
    pub async fn recover(&self) -> Result<RecoverReport, RalphError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load_state()?;
        let mut report = RecoverReport::default();
        let names: Vec<String> = state.runs.keys().cloned().collect();

        for name in names {
            let entry = state.runs.get(&name).unwrap();
            let pane_alive = self.session.is_pane_alive(&entry.pane_id).await.unwrap_or(false);
            let worktree_exists = self.worktrees.exists(&name);

            if pane_alive {
                report.recovered.push(name);
            } else if worktree_exists {
                if let Some(entry) = state.runs.get_mut(&name) {
                    entry.status = RunStatus::Stale;
                }
                report.orphaned.push(name);
            } else {
                state.runs.remove(&name);
                report.cleaned.push(name);
            }
        }

        self.save_state(&state)?;
        Ok(report)
    }

    /// Dry-run merge-conflict check for every active run, without merging.
    pub async fn conflicts(&self) -> Result<Vec<ConflictReport>, RalphError> {
        let main_branch = self.worktrees.main_branch()?;
        let names: Vec<String> = {
            let state = self.load_state()?;
            state.running_prds().map(str::to_string).collect()
        };
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(self.worktrees.check_conflicts(&name, &name, &main_branch).await?);
        }
        Ok(reports)
    }
}

fn run_command(verb: &str, prd: &str, agent: Option<&str>, worktree: &std::path::Path) -> String {
    let agent_flag = agent.map(|a| format!(" --agent {a}")).unwrap_or_default();
    format!("cd {} && ralph {verb} {prd}{agent_flag}", worktree.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RalphConfig;
    use async_trait::async_trait;
    use ralph_common::prd::{Prd, Story};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use crate::session::PaneInfo;

    #[derive(Default)]
    struct FakeSession {
        panes: StdMutex<HashMap<String, bool>>,
        next_id: StdMutex<u32>,
    }

    #[async_trait]
    impl SessionBackend for FakeSession {
        async fn ensure_session(&self, _name: &str) -> Result<(), RalphError> {
            Ok(())
        }
        async fn session_exists(&self, _name: &str) -> Result<bool, RalphError> {
            Ok(true)
        }
        async fn destroy_session(&self, _name: &str) -> Result<(), RalphError> {
            Ok(())
        }
        async fn create_pane(&self, _session: &str, opts: CreatePaneOptions<'_>) -> Result<PaneInfo, RalphError> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let pane_id = format!("%{next}");
            self.panes.lock().unwrap().insert(pane_id.clone(), true);
            Ok(PaneInfo { pane_id, window_id: "0".to_string(), title: opts.title.to_string() })
        }
        async fn destroy_pane(&self, pane_id: &str) -> Result<(), RalphError> {
            self.panes.lock().unwrap().remove(pane_id);
            Ok(())
        }
        async fn send_command(&self, _pane_id: &str, _text: &str) -> Result<(), RalphError> {
            Ok(())
        }
        async fn send_interrupt(&self, _pane_id: &str) -> Result<(), RalphError> {
            Ok(())
        }
        async fn rebalance(&self, _session: &str, _window_id: Option<&str>) -> Result<(), RalphError> {
            Ok(())
        }
        async fn get_pane_count(&self, _session: &str) -> Result<u32, RalphError> {
            Ok(self.panes.lock().unwrap().len() as u32)
        }
        async fn list_panes(&self, _session: &str) -> Result<Vec<PaneInfo>, RalphError> {
            Ok(Vec::new())
        }
        async fn is_pane_alive(&self, pane_id: &str) -> Result<bool, RalphError> {
            Ok(self.panes.lock().unwrap().get(pane_id).copied().unwrap_or(false))
        }
        async fn focus_pane(&self, _pane_id: &str) -> Result<(), RalphError> {
            Ok(())
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn capture_pane(&self, _pane_id: &str, _tail: usize) -> Result<Vec<String>, RalphError> {
            Ok(vec!["line one".to_string()])
        }
    }

    fn config() -> RalphConfig {
        RalphConfig::parse(
            r#"
[ralph]
project_name = "alpha"

[ralph.agents.default]
command = "true"
"#,
        )
        .unwrap()
    }

    fn init_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let mut cfg = repo.config().unwrap();
        cfg.set_str("user.name", "test").unwrap();
        cfg.set_str("user.email", "test@test.com").unwrap();
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(std::path::Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        let path = dir.path().to_path_buf();
        (dir, path)
    }

    #[tokio::test]
    async fn start_then_list_then_cleanup() {
        let (_repo_dir, repo_root) = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let store = PrdStore::new(state_dir.path()).unwrap();
        let mut prd = Prd::new("alpha", "desc");
        prd.stories.push(Story::new("US-001", "first", 1));
        store.create(prd).unwrap();

        let mut cfg = config();
        cfg.swarm.worktree_parent = repo_root.join("..").join("wt");

        let manager = SwarmManager::new(
            state_dir.path(),
            repo_root,
            "ralph",
            Arc::new(FakeSession::default()),
            store,
            cfg,
        );

        let entry = manager.start("alpha", None).await.unwrap();
        assert_eq!(entry.status, RunStatus::Running);
        assert!(manager.start("alpha", None).await.is_err());

        let runs = manager.list().await.unwrap();
        assert_eq!(runs.len(), 1);

        manager.cleanup("alpha").await.unwrap();
        let runs = manager.list().await.unwrap();
        assert!(runs.is_empty());
    }

    /// A run whose pane is alive recovers; one whose worktree survives but
    /// pane is gone is orphaned; one with neither is cleaned from state
    /// entirely.
    #[tokio::test]
    async fn recover_partitions_runs_by_surviving_resources() {
        let (_repo_dir, repo_root) = init_repo();
        let state_dir = tempfile::tempdir().unwrap();
        let store = PrdStore::new(state_dir.path()).unwrap();
        for name in ["x", "y", "z"] {
            let mut prd = Prd::new(name, "desc");
            prd.stories.push(Story::new("US-001", "first", 1));
            store.create(prd).unwrap();
        }

        let mut cfg = config();
        let worktree_parent = repo_root.join("..").join("wt");
        cfg.swarm.worktree_parent = worktree_parent.clone();

        let session = Arc::new(FakeSession::default());
        let manager = SwarmManager::new(state_dir.path(), repo_root, "ralph", session.clone(), store, cfg);

        manager.start("x", None).await.unwrap();
        manager.start("y", None).await.unwrap();
        manager.start("z", None).await.unwrap();

        // y's pane dies but its worktree survives; z has neither.
        let state = manager.load_state().unwrap();
        session.panes.lock().unwrap().remove(&state.runs["y"].pane_id);
        session.panes.lock().unwrap().remove(&state.runs["z"].pane_id);
        manager.worktrees.remove("z").unwrap();

        let report = manager.recover().await.unwrap();
        assert_eq!(report.recovered, vec!["x".to_string()]);
        assert_eq!(report.orphaned, vec!["y".to_string()]);
        assert_eq!(report.cleaned, vec!["z".to_string()]);

        let state = manager.load_state().unwrap();
        assert!(!state.runs.contains_key("z"));
        assert!(state.runs.contains_key("y"));
        assert!(state.runs.contains_key("x"));
    }
}
