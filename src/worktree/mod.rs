//! Worktree Operations: one independent working directory per running PRD,
//! each bound to a branch named after the PRD.
//!
//! Worktree creation/removal/listing goes through `git2` against the main
//! repository, driving a `Repository` handle directly rather than shelling
//! out. Merge conflict detection is a dry-run merge inside a disposable
//! scratch worktree (recorded in DESIGN.md), since actual conflict
//! resolution is delegated to an agent, never performed here.

use std::path::PathBuf;

use git2::{Repository, WorktreeAddOptions, WorktreePruneOptions};

use ralph_common::RalphError;

use crate::config::SwarmConfig;

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub valid: bool,
}

/// Files left in conflict by a dry-run merge; empty means clean.
#[derive(Debug, Clone, Default)]
pub struct ConflictReport {
    pub prd: String,
    pub files: Vec<String>,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.files.is_empty()
    }
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    config: SwarmConfig,
}

impl WorktreeManager {
    pub fn new(repo_root: PathBuf, config: SwarmConfig) -> Self {
        Self { repo_root, config }
    }

    fn open_repo(&self) -> Result<Repository, RalphError> {
        Repository::open(&self.repo_root).map_err(|e| RalphError::WorktreeCreateFailed {
            path: self.repo_root.clone(),
            message: format!("failed to open repository: {e}"),
        })
    }

    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.config.worktree_parent.join(name)
    }

    /// Create a worktree + branch for `name`. When `worktree_create_cmd` is
    /// configured, runs that template (`{name}`, `{path}`, `{branch}`)
    /// through a shell instead of the default `git2`-driven sequence.
    pub async fn create(&self, name: &str) -> Result<PathBuf, RalphError> {
        let path = self.worktree_path(name);
        let branch = name.to_string();

        if let Some(template) = &self.config.worktree_create_cmd {
            let command = template
                .replace("{name}", name)
                .replace("{path}", &path.to_string_lossy())
                .replace("{branch}", &branch);
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .current_dir(&self.repo_root)
                .status()
                .await
                .map_err(|e| RalphError::WorktreeCreateFailed { path: path.clone(), message: e.to_string() })?;
            if !status.success() {
                return Err(RalphError::WorktreeCreateFailed {
                    path,
                    message: format!("custom worktree_create_cmd exited with {status}"),
                });
            }
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RalphError::Io { path: parent.to_path_buf(), source })?;
        }

        let repo = self.open_repo()?;
        let head_commit = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(|e| RalphError::WorktreeCreateFailed { path: path.clone(), message: e.to_string() })?;
        let branch_ref = repo
            .branch(&branch, &head_commit, false)
            .map_err(|e| RalphError::WorktreeCreateFailed { path: path.clone(), message: e.to_string() })?
            .into_reference();

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        repo.worktree(name, &path, Some(&opts))
            .map_err(|e| RalphError::WorktreeCreateFailed { path: path.clone(), message: e.to_string() })?;

        Ok(path)
    }

    /// Remove `name`'s worktree entirely: git's administrative files plus the
    /// working directory. Idempotent — a missing worktree is not an error.
    pub fn remove(&self, name: &str) -> Result<(), RalphError> {
        let repo = self.open_repo()?;
        if let Ok(wt) = repo.find_worktree(name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(true);
            let _ = wt.prune(Some(&mut opts));
        }
        let path = self.worktree_path(name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(RalphError::Io { path, source }),
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<WorktreeInfo>, RalphError> {
        let repo = self.open_repo()?;
        let names = repo
            .worktrees()
            .map_err(|e| RalphError::WorktreeCreateFailed { path: self.repo_root.clone(), message: e.to_string() })?;
        let mut out = Vec::new();
        for name in names.iter().flatten() {
            let Ok(wt) = repo.find_worktree(name) else { continue };
            out.push(WorktreeInfo {
                name: name.to_string(),
                path: wt.path().to_path_buf(),
                branch: name.to_string(),
                valid: wt.validate().is_ok(),
            });
        }
        Ok(out)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.worktree_path(name).is_dir()
    }

    /// The branch HEAD points at in the main repository, used as the merge
    /// target when the project's main branch name isn't otherwise known.
    pub fn main_branch(&self) -> Result<String, RalphError> {
        let repo = self.open_repo()?;
        let head = repo
            .head()
            .map_err(|e| RalphError::WorktreeCreateFailed { path: self.repo_root.clone(), message: e.to_string() })?;
        Ok(head.shorthand().unwrap_or("main").to_string())
    }

    /// Dry-run a merge of `branch` into `main_branch` inside a disposable
    /// scratch worktree, returning the files left conflicted (never
    /// resolving them — that is the merge agent's job).
    pub async fn check_conflicts(&self, prd: &str, branch: &str, main_branch: &str) -> Result<ConflictReport, RalphError> {
        let scratch_name = format!("{branch}-conflict-check");
        let scratch_path = self.config.worktree_parent.join(&scratch_name);
        let _ = self.remove(&scratch_name);

        let repo = self.open_repo()?;
        let main_ref = repo
            .find_branch(main_branch, git2::BranchType::Local)
            .map_err(|e| RalphError::WorktreeCreateFailed { path: scratch_path.clone(), message: e.to_string() })?
            .into_reference();
        let main_commit = main_ref
            .peel_to_commit()
            .map_err(|e| RalphError::WorktreeCreateFailed { path: scratch_path.clone(), message: e.to_string() })?;
        repo.branch(&scratch_name, &main_commit, true)
            .map_err(|e| RalphError::WorktreeCreateFailed { path: scratch_path.clone(), message: e.to_string() })?;

        if let Some(parent) = scratch_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RalphError::Io { path: parent.to_path_buf(), source })?;
        }
        let scratch_branch_ref = repo
            .find_branch(&scratch_name, git2::BranchType::Local)
            .map_err(|e| RalphError::WorktreeCreateFailed { path: scratch_path.clone(), message: e.to_string() })?
            .into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&scratch_branch_ref));
        repo.worktree(&scratch_name, &scratch_path, Some(&opts))
            .map_err(|e| RalphError::WorktreeCreateFailed { path: scratch_path.clone(), message: e.to_string() })?;

        let merge_status = tokio::process::Command::new("git")
            .args(["merge", "--no-commit", "--no-ff", branch])
            .current_dir(&scratch_path)
            .output()
            .await
            .map_err(|source| RalphError::Io { path: scratch_path.clone(), source })?;

        let files = if merge_status.status.success() {
            Vec::new()
        } else {
            let diff_output = tokio::process::Command::new("git")
                .args(["diff", "--name-only", "--diff-filter=U"])
                .current_dir(&scratch_path)
                .output()
                .await
                .map_err(|source| RalphError::Io { path: scratch_path.clone(), source })?;
            String::from_utf8_lossy(&diff_output.stdout)
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        };

        let _ = tokio::process::Command::new("git").arg("merge").arg("--abort").current_dir(&scratch_path).output().await;
        self.remove(&scratch_name)?;
        let _ = repo.find_branch(&scratch_name, git2::BranchType::Local).and_then(|mut b| b.delete());

        Ok(ConflictReport { prd: prd.to_string(), files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use std::path::Path;

    fn init_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        let path = dir.path().to_path_buf();
        (dir, path)
    }

    #[tokio::test]
    async fn create_then_list_then_remove() {
        let (_dir, repo_root) = init_repo();
        let worktree_parent = repo_root.join("..").join("wt");
        let config = SwarmConfig { worktree_parent: worktree_parent.clone(), ..default_swarm_config() };
        let manager = WorktreeManager::new(repo_root.clone(), config);

        let path = manager.create("alpha").await.unwrap();
        assert!(path.is_dir());
        let listed = manager.list().unwrap();
        assert!(listed.iter().any(|w| w.name == "alpha"));

        manager.remove("alpha").unwrap();
        assert!(!manager.exists("alpha"));
    }

    fn default_swarm_config() -> SwarmConfig {
        SwarmConfig {
            worktree_parent: PathBuf::new(),
            panes_per_window: 4,
            pane_close_timeout: 5,
            worktree_create_cmd: None,
            merge_agent: None,
        }
    }
}
