//! PRD and Story domain types.
//!
//! These mirror `prd.json` on disk field-for-field; the PRD store is the
//! only thing that persists them, but engine code builds and mutates
//! in-memory copies freely since store writes go through `update`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for stories authored by a human (or generated at PRD creation).
pub const STORY_PREFIX_USER: &str = "US";
/// Prefix for stories synthesized by the engine after a failed test cycle.
pub const STORY_PREFIX_FIX: &str = "FIX";

/// Where a PRD currently sits in its lifecycle. The store's directory layout
/// mirrors this exactly: `prds/<status>/<name>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrdStatus {
    Pending,
    InProgress,
    Testing,
    Completed,
}

impl PrdStatus {
    /// All statuses in directory-scan order.
    pub fn all() -> &'static [PrdStatus] {
        &[
            PrdStatus::Pending,
            PrdStatus::InProgress,
            PrdStatus::Testing,
            PrdStatus::Completed,
        ]
    }

    /// The directory name this status occupies under `prds/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            PrdStatus::Pending => "pending",
            PrdStatus::InProgress => "in_progress",
            PrdStatus::Testing => "testing",
            PrdStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for PrdStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Status of a single story within a PRD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

/// One unit of work within a PRD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    /// Unique within the PRD; format "US-NNN" or "FIX-NNN".
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    /// Unique within the PRD; lower runs first.
    pub priority: i64,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_count: Option<u32>,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            acceptance_criteria: Vec::new(),
            status: StoryStatus::Pending,
            priority,
            questions: Vec::new(),
            answers: None,
            iteration_count: None,
        }
    }

    /// Numeric suffix of this story's id, used to compute the next `FIX-NNN`.
    fn sequence_number(&self) -> Option<u32> {
        self.id.rsplit_once('-')?.1.parse().ok()
    }

    pub fn is_blocked(&self) -> bool {
        self.status == StoryStatus::Blocked
    }

    /// Record a new in-progress attempt, incrementing the iteration counter.
    pub fn bump_iteration(&mut self) -> u32 {
        let n = self.iteration_count.unwrap_or(0) + 1;
        self.iteration_count = Some(n);
        n
    }

    /// Mark this story blocked with the given questions, replacing any prior
    /// answers (a re-blocked story must be re-answered in full).
    pub fn block(&mut self, questions: Vec<String>) {
        self.status = StoryStatus::Blocked;
        self.questions = questions;
        self.answers = None;
    }

    /// Answer a blocked story's questions and return it to `pending`. Fails
    /// (returning `false`, leaving the story untouched) if the answer count
    /// doesn't match the question count.
    pub fn unblock(&mut self, answers: Vec<String>) -> bool {
        if answers.len() != self.questions.len() {
            return false;
        }
        self.answers = Some(answers);
        self.status = StoryStatus::Pending;
        true
    }
}

/// Why an engine run ended, recorded on the PRD for display/audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunReason {
    UserInterrupted,
    Completed,
    StoryCompleted,
    Blocked,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastRun {
    pub timestamp: DateTime<Utc>,
    pub story_id: String,
    pub reason: LastRunReason,
    pub summary: String,
}

/// Cumulative resource usage across all runs of a PRD. Additive: every
/// update adds to the running total rather than replacing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub iterations: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Metrics {
    pub fn add(&mut self, iterations: u64, input_tokens: u64, output_tokens: u64) {
        self.iterations += iterations;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_tokens += input_tokens + output_tokens;
    }
}

/// A Product Requirements Document: a named unit of work plus its stories.
/// Field-for-field what is serialized to `prd.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prd {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub stories: Vec<Story>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<LastRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

impl Prd {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            dependencies: Vec::new(),
            stories: Vec::new(),
            last_run: None,
            metrics: None,
        }
    }

    pub fn find_story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn find_story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.stories.iter_mut().find(|s| s.id == id)
    }

    /// True when every story has status `completed`.
    pub fn is_complete(&self) -> bool {
        !self.stories.is_empty() && self.stories.iter().all(|s| s.status == StoryStatus::Completed)
    }

    /// Among stories with status `pending` or `in_progress`, the one with
    /// the smallest priority. Ties between pending and in_progress at the
    /// same priority are resolved by priority alone — status does not
    /// break ties, since priority is unique within a PRD by invariant.
    pub fn next_story(&self) -> Option<&Story> {
        self.stories
            .iter()
            .filter(|s| matches!(s.status, StoryStatus::Pending | StoryStatus::InProgress))
            .min_by_key(|s| s.priority)
    }

    pub fn next_story_mut(&mut self) -> Option<&mut Story> {
        let id = self.next_story()?.id.clone();
        self.find_story_mut(&id)
    }

    pub fn max_priority(&self) -> i64 {
        self.stories.iter().map(|s| s.priority).max().unwrap_or(0)
    }

    /// The next `FIX-NNN` id, one greater than the highest existing FIX
    /// sequence number (starting at 001 if none exist yet).
    pub fn next_fix_id(&self) -> String {
        let max = self
            .stories
            .iter()
            .filter(|s| s.id.starts_with(STORY_PREFIX_FIX))
            .filter_map(|s| s.sequence_number())
            .max()
            .unwrap_or(0);
        format!("{STORY_PREFIX_FIX}-{:03}", max + 1)
    }

    /// Check all invariants from the data model: unique ids, unique
    /// priorities, answers/questions length match, non-empty questions on
    /// blocked stories.
    pub fn validate(&self) -> Result<(), String> {
        let mut ids = std::collections::HashSet::new();
        let mut priorities = std::collections::HashSet::new();
        for s in &self.stories {
            if !ids.insert(&s.id) {
                return Err(format!("duplicate story id {}", s.id));
            }
            if !priorities.insert(s.priority) {
                return Err(format!("duplicate story priority {}", s.priority));
            }
            if let Some(answers) = &s.answers
                && answers.len() != s.questions.len()
            {
                return Err(format!(
                    "story {} has {} answers for {} questions",
                    s.id,
                    answers.len(),
                    s.questions.len()
                ));
            }
            if s.status == StoryStatus::Blocked && s.questions.is_empty() {
                return Err(format!("blocked story {} has no questions", s.id));
            }
        }
        Ok(())
    }
}

/// Validate a project-name slug: lowercase alphanumeric and hyphen, 1-64
/// chars. Used both for the project context and for PRD/story names.
pub fn is_valid_slug(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
