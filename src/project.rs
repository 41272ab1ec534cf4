//! Project context and state-root resolution.
//!
//! The project context is derived once per process invocation and then
//! threaded as an immutable value into every store/engine/swarm operation —
//! there is deliberately no ambient global for it (see the design notes on
//! avoiding a process-wide context cache).

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use ralph_common::RalphError;

/// `(projectName, repoRoot)`. State for this project lives under a
/// directory derived from both fields, never inside the repo itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectContext {
    pub project_name: String,
    pub repo_root: PathBuf,
}

impl ProjectContext {
    pub fn new(project_name: impl Into<String>, repo_root: impl Into<PathBuf>) -> Result<Self, RalphError> {
        let project_name = project_name.into();
        if !ralph_common::prd::is_valid_slug(&project_name) {
            return Err(RalphError::ConfigError(format!(
                "project_name '{project_name}' must be lowercase alphanumeric/hyphen, 1-64 chars"
            )));
        }
        let repo_root = repo_root
            .into()
            .canonicalize()
            .map_err(|source| RalphError::Io {
                path: PathBuf::from("."),
                source,
            })?;
        Ok(Self { project_name, repo_root })
    }

    /// 8 lowercase hex characters of sha256(repoRoot), used to disambiguate
    /// two checkouts that happen to share a project name.
    pub fn repo_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.repo_root.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
    }

    /// `<stateRoot>/<projectName>-<hash>/`.
    pub fn state_dir(&self) -> PathBuf {
        state_root().join(format!("{}-{}", self.project_name, self.repo_hash()))
    }
}

/// `$XDG_STATE_HOME/omnidev/ralph` — falls back to `~/.local/state` when the
/// environment variable is unset, per the XDG base directory convention.
pub fn state_root() -> PathBuf {
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .unwrap_or_else(|| PathBuf::from(".local/state"));
    base.join("omnidev").join("ralph")
}

/// Find the repo root by walking up from `start` looking for a `.git`
/// directory, matching the convention every git-worktree-aware operation in
/// this crate assumes.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_hash_is_eight_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::new("alpha", dir.path()).unwrap();
        let hash = ctx.repo_hash();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn repo_hash_is_stable_for_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let a = ProjectContext::new("alpha", dir.path()).unwrap();
        let b = ProjectContext::new("alpha", dir.path()).unwrap();
        assert_eq!(a.repo_hash(), b.repo_hash());
    }

    #[test]
    fn rejects_invalid_project_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProjectContext::new("Invalid Name", dir.path()).is_err());
    }

    #[test]
    fn state_dir_combines_name_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContext::new("alpha", dir.path()).unwrap();
        let state_dir = ctx.state_dir();
        assert!(
            state_dir
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("alpha-")
        );
    }

    #[test]
    fn find_repo_root_walks_up_to_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(
            find_repo_root(&nested).unwrap().canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn find_repo_root_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_repo_root(dir.path()).is_none());
    }
}
