//! `PrdStore`: typed CRUD plus story-level mutators over the `prds/<status>/<name>/`
//! directory layout.

use std::path::{Path, PathBuf};

use ralph_common::prd::{LastRun, Prd, PrdStatus, Story, StoryStatus};
use ralph_common::RalphError;

use crate::util::atomic_write;

use super::{prd_json_path, status_dir};

/// Owns one project's `prds/` subtree. Stateless beyond the root path — every
/// operation re-derives location by scanning, since the store must tolerate
/// another process having moved a PRD between calls.
#[derive(Debug, Clone)]
pub struct PrdStore {
    root: PathBuf,
}

impl PrdStore {
    /// `state_dir` is the per-project state root; this creates `prds/<status>/`
    /// for every status up front so later scans never hit a missing directory.
    pub fn new(state_dir: &Path) -> Result<Self, RalphError> {
        let root = state_dir.join("prds");
        for status in PrdStatus::all() {
            let dir = status_dir(&root, *status);
            std::fs::create_dir_all(&dir).map_err(|source| RalphError::Io { path: dir, source })?;
        }
        Ok(Self { root })
    }

    fn prd_dir(&self, status: PrdStatus, name: &str) -> PathBuf {
        status_dir(&self.root, status).join(name)
    }

    /// Scan the four status directories for `name`. O(status-directories).
    pub fn find_location(&self, name: &str) -> Option<PrdStatus> {
        PrdStatus::all()
            .iter()
            .copied()
            .find(|status| self.prd_dir(*status, name).is_dir())
    }

    fn locate(&self, name: &str) -> Result<(PrdStatus, PathBuf), RalphError> {
        let status = self
            .find_location(name)
            .ok_or_else(|| RalphError::PrdNotFound(name.to_string()))?;
        Ok((status, self.prd_dir(status, name)))
    }

    fn read_prd(&self, dir: &Path) -> Result<Prd, RalphError> {
        let path = prd_json_path(dir);
        let raw = std::fs::read_to_string(&path).map_err(|source| RalphError::Io { path: path.clone(), source })?;
        let prd: Prd = serde_json::from_str(&raw).map_err(|e| RalphError::PrdInvalidStructure {
            name: dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            message: e.to_string(),
        })?;
        prd.validate().map_err(|message| RalphError::PrdInvalidStructure {
            name: prd.name.clone(),
            message,
        })?;
        Ok(prd)
    }

    fn write_prd(&self, dir: &Path, prd: &Prd) -> Result<(), RalphError> {
        let json = serde_json::to_vec_pretty(prd).map_err(|e| RalphError::Other(e.into()))?;
        atomic_write(&prd_json_path(dir), &json)
    }

    /// Whether `name` has a `spec.md` but no `prd.json` yet — not runnable
    /// until stories are authored.
    pub fn is_spec_only(&self, name: &str) -> Result<bool, RalphError> {
        let (_, dir) = self.locate(name)?;
        Ok(!prd_json_path(&dir).is_file() && super::spec_md_path(&dir).is_file())
    }

    pub fn get(&self, name: &str) -> Result<Prd, RalphError> {
        let (_, dir) = self.locate(name)?;
        self.read_prd(&dir)
    }

    /// If `status` is given, only that subtree; otherwise a merged view
    /// across all four, in status-scan order.
    pub fn list_by_status(&self, status: Option<PrdStatus>) -> Result<Vec<Prd>, RalphError> {
        let statuses: &[PrdStatus] = status.as_ref().map(std::slice::from_ref).unwrap_or_else(|| PrdStatus::all());
        let mut out = Vec::new();
        for status in statuses {
            let dir = status_dir(&self.root, *status);
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(RalphError::Io { path: dir, source }),
            };
            for entry in entries {
                let entry = entry.map_err(|source| RalphError::Io { path: dir.clone(), source })?;
                let prd_dir = entry.path();
                if prd_json_path(&prd_dir).is_file() {
                    out.push(self.read_prd(&prd_dir)?);
                }
            }
        }
        Ok(out)
    }

    /// Read-modify-write: read, apply `f`, write atomically. Rename is the
    /// commit point; concurrent writers to the same PRD are last-writer-wins,
    /// acceptable because the engine enforces at-most-one active run per PRD.
    pub fn update(&self, name: &str, f: impl FnOnce(&mut Prd)) -> Result<Prd, RalphError> {
        let (_, dir) = self.locate(name)?;
        let mut prd = self.read_prd(&dir)?;
        f(&mut prd);
        prd.validate().map_err(|message| RalphError::PrdInvalidStructure {
            name: prd.name.clone(),
            message,
        })?;
        self.write_prd(&dir, &prd)?;
        Ok(prd)
    }

    /// Move `name`'s directory to `to_status`. Fails with `Conflict` if the
    /// destination already has an entry by that name.
    pub fn transition(&self, name: &str, to_status: PrdStatus) -> Result<Prd, RalphError> {
        let (from_status, from_dir) = self.locate(name)?;
        if from_status == to_status {
            return self.read_prd(&from_dir);
        }
        let to_dir = self.prd_dir(to_status, name);
        if to_dir.exists() {
            return Err(RalphError::Conflict(name.to_string()));
        }
        std::fs::rename(&from_dir, &to_dir).map_err(|source| RalphError::Io { path: to_dir.clone(), source })?;
        self.read_prd(&to_dir)
    }

    pub fn update_story_status(
        &self,
        name: &str,
        story_id: &str,
        status: StoryStatus,
        questions: Option<Vec<String>>,
    ) -> Result<Prd, RalphError> {
        self.update(name, |prd| {
            if let Some(story) = prd.find_story_mut(story_id) {
                if status == StoryStatus::Blocked {
                    story.block(questions.unwrap_or_default());
                } else {
                    story.status = status;
                }
            }
        })
    }

    /// Transition a blocked story back to `pending`. Rejected (leaving the
    /// story untouched) if `answers.len() != story.questions.len()`.
    pub fn unblock_story(&self, name: &str, story_id: &str, answers: Vec<String>) -> Result<Prd, RalphError> {
        let (_, dir) = self.locate(name)?;
        let mut prd = self.read_prd(&dir)?;
        let story = prd
            .find_story_mut(story_id)
            .ok_or_else(|| RalphError::PrdInvalidStructure {
                name: name.to_string(),
                message: format!("no story {story_id}"),
            })?;
        if !story.unblock(answers) {
            return Err(RalphError::PrdInvalidStructure {
                name: name.to_string(),
                message: format!("answer count does not match question count for {story_id}"),
            });
        }
        self.write_prd(&dir, &prd)?;
        Ok(prd)
    }

    /// Among stories `{pending, in_progress}`, the one with smallest priority.
    pub fn get_next_story(&self, name: &str) -> Result<Option<Story>, RalphError> {
        Ok(self.get(name)?.next_story().cloned())
    }

    /// Append a synthesized `FIX-NNN` story: priority one greater than the
    /// current max, acceptance criteria derived from `issues`, title pointing
    /// at `report_path`.
    pub fn add_fix_story(&self, name: &str, issues: Vec<String>, report_path: &str) -> Result<Prd, RalphError> {
        self.update(name, |prd| {
            let id = prd.next_fix_id();
            let priority = prd.max_priority() + 1;
            let mut story = Story::new(id, format!("Fix issues reported in {report_path}"), priority);
            story.acceptance_criteria = issues;
            prd.stories.push(story);
        })
    }

    pub fn mark_started(&self, name: &str) -> Result<Prd, RalphError> {
        self.update(name, |prd| {
            if prd.started_at.is_none() {
                prd.started_at = Some(chrono::Utc::now());
            }
        })
    }

    pub fn mark_completed(&self, name: &str) -> Result<Prd, RalphError> {
        self.update(name, |prd| {
            prd.completed_at = Some(chrono::Utc::now());
        })
    }

    pub fn update_last_run(&self, name: &str, last_run: LastRun) -> Result<Prd, RalphError> {
        self.update(name, |prd| {
            prd.last_run = Some(last_run);
        })
    }

    /// Additive: adds to the running total rather than replacing it.
    pub fn update_metrics(&self, name: &str, iterations: u64, input_tokens: u64, output_tokens: u64) -> Result<Prd, RalphError> {
        self.update(name, |prd| {
            prd.metrics.get_or_insert_with(Default::default).add(iterations, input_tokens, output_tokens);
        })
    }

    /// Remove `test-results/` contents wholesale, ahead of a fresh test run.
    pub fn clear_test_results(&self, name: &str) -> Result<(), RalphError> {
        let (_, dir) = self.locate(name)?;
        let results_dir = dir.join("test-results");
        match std::fs::remove_dir_all(&results_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RalphError::Io { path: results_dir, source }),
        }
    }

    /// Write `findings.md`. The caller (the engine, via an agent invocation or
    /// its own deterministic summary) supplies the markdown; the store's job
    /// here is only the atomic write, keeping agent dispatch out of this layer.
    pub fn extract_and_save_findings(&self, name: &str, findings_markdown: &str) -> Result<(), RalphError> {
        let (_, dir) = self.locate(name)?;
        super::companion::write_findings(&dir, findings_markdown)
    }

    /// The directory housing `name`'s companion files, for callers that need
    /// to read/write them directly (prompt builders, test report I/O).
    pub fn prd_dir_for(&self, name: &str) -> Result<PathBuf, RalphError> {
        Ok(self.locate(name)?.1)
    }

    /// Create a brand new PRD in `pending`, writing `prd.json` for the first
    /// time. Fails with `Conflict` if a PRD by this name already exists
    /// anywhere in the tree.
    pub fn create(&self, prd: Prd) -> Result<(), RalphError> {
        if self.find_location(&prd.name).is_some() {
            return Err(RalphError::Conflict(prd.name.clone()));
        }
        prd.validate().map_err(|message| RalphError::PrdInvalidStructure {
            name: prd.name.clone(),
            message,
        })?;
        let dir = self.prd_dir(PrdStatus::Pending, &prd.name);
        std::fs::create_dir_all(&dir).map_err(|source| RalphError::Io { path: dir.clone(), source })?;
        self.write_prd(&dir, &prd)?;
        super::companion::init_progress(&dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PrdStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PrdStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn sample_prd(name: &str) -> Prd {
        let mut prd = Prd::new(name, "desc");
        prd.stories.push(Story::new("US-001", "first", 1));
        prd
    }

    #[test]
    fn create_then_get_round_trips() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        let prd = store.get("alpha").unwrap();
        assert_eq!(prd.name, "alpha");
        assert_eq!(store.find_location("alpha"), Some(PrdStatus::Pending));
    }

    #[test]
    fn create_rejects_duplicate_name() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        assert!(store.create(sample_prd("alpha")).is_err());
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.get("ghost"), Err(RalphError::PrdNotFound(_))));
    }

    #[test]
    fn transition_moves_directory() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        store.transition("alpha", PrdStatus::InProgress).unwrap();
        assert_eq!(store.find_location("alpha"), Some(PrdStatus::InProgress));
    }

    #[test]
    fn transition_same_status_is_noop() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        let before = store.get("alpha").unwrap();
        let after = store.transition("alpha", PrdStatus::Pending).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn transition_fails_when_destination_occupied() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        store.transition("alpha", PrdStatus::InProgress).unwrap();
        store.create(sample_prd("alpha-dupe")).unwrap();
        // Force alpha-dupe to collide by manually relocating into in_progress.
        let conflict_dir = store.root.join("in_progress").join("alpha-dupe");
        std::fs::create_dir_all(conflict_dir.parent().unwrap()).unwrap();
        std::fs::rename(store.root.join("pending").join("alpha-dupe"), &conflict_dir).unwrap();
        assert!(matches!(
            store.transition("alpha-dupe", PrdStatus::InProgress),
            Err(RalphError::Conflict(_))
        ));
    }

    #[test]
    fn update_applies_transform_and_persists() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        store.update("alpha", |prd| prd.description = "updated".to_string()).unwrap();
        assert_eq!(store.get("alpha").unwrap().description, "updated");
    }

    #[test]
    fn unblock_story_rejects_mismatched_answers() {
        let (_dir, store) = store();
        let mut prd = sample_prd("alpha");
        prd.stories[0].block(vec!["why?".to_string(), "what?".to_string()]);
        store.create(prd).unwrap();
        assert!(store.unblock_story("alpha", "US-001", vec!["only one".to_string()]).is_err());
        let still_blocked = store.get("alpha").unwrap();
        assert!(still_blocked.stories[0].is_blocked());
    }

    #[test]
    fn unblock_story_accepts_matching_answers() {
        let (_dir, store) = store();
        let mut prd = sample_prd("alpha");
        prd.stories[0].block(vec!["why?".to_string()]);
        store.create(prd).unwrap();
        store.unblock_story("alpha", "US-001", vec!["because".to_string()]).unwrap();
        assert_eq!(store.get("alpha").unwrap().stories[0].status, StoryStatus::Pending);
    }

    #[test]
    fn get_next_story_picks_smallest_priority() {
        let (_dir, store) = store();
        let mut prd = sample_prd("alpha");
        prd.stories.push(Story::new("US-002", "second", 0));
        store.create(prd).unwrap();
        assert_eq!(store.get_next_story("alpha").unwrap().unwrap().id, "US-002");
    }

    #[test]
    fn add_fix_story_picks_next_id_and_priority() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        let prd = store
            .add_fix_story("alpha", vec!["bug one".to_string()], "test-results/report.md")
            .unwrap();
        let fix = prd.stories.iter().find(|s| s.id == "FIX-001").unwrap();
        assert_eq!(fix.priority, 2);
        assert_eq!(fix.acceptance_criteria, vec!["bug one".to_string()]);
    }

    #[test]
    fn update_metrics_is_additive() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        store.update_metrics("alpha", 1, 100, 50).unwrap();
        let prd = store.update_metrics("alpha", 1, 200, 75).unwrap();
        let metrics = prd.metrics.unwrap();
        assert_eq!(metrics.iterations, 2);
        assert_eq!(metrics.input_tokens, 300);
        assert_eq!(metrics.total_tokens, 525);
    }

    #[test]
    fn list_by_status_merges_when_none_given() {
        let (_dir, store) = store();
        store.create(sample_prd("alpha")).unwrap();
        store.create(sample_prd("beta")).unwrap();
        store.transition("beta", PrdStatus::InProgress).unwrap();
        let all = store.list_by_status(None).unwrap();
        assert_eq!(all.len(), 2);
        let pending_only = store.list_by_status(Some(PrdStatus::Pending)).unwrap();
        assert_eq!(pending_only.len(), 1);
    }
}
