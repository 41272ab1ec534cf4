//! Companion file helpers: progress narration, verification checklists,
//! review findings, and test reports. None of these carry PRD identity of
//! their own — the directory they live in does that — so these are free
//! functions over a `prd_dir`, not methods on `PrdStore`.

use std::path::Path;

use chrono::Utc;
use ralph_common::event::TestOutcome;
use ralph_common::RalphError;

use crate::util::atomic_write;

use super::{findings_md_path, progress_txt_path, test_report_path, verification_md_path};

/// Append one timestamped line to `progress.txt`. Append-only by design: a
/// PRD's narration is a log, not a mutable document, so there is no atomic
/// rewrite here, only an `OpenOptions::append`.
pub fn append_progress(prd_dir: &Path, message: &str) -> Result<(), RalphError> {
    use std::io::Write;

    let path = progress_txt_path(prd_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| RalphError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| RalphError::Io { path: path.clone(), source })?;
    writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), message)
        .map_err(|source| RalphError::Io { path, source })
}

/// Write the initial `progress.txt` shape for a freshly created PRD: a
/// `## Codebase Patterns` prelude (populated by agents as they learn
/// reusable facts about the codebase) followed by the `## Progress Log`
/// body that `append_progress` appends to.
pub fn init_progress(prd_dir: &Path) -> Result<(), RalphError> {
    let path = progress_txt_path(prd_dir);
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| RalphError::Io { path: parent.to_path_buf(), source })?;
    }
    atomic_write(&path, b"## Codebase Patterns\n\n## Progress Log\n")
}

pub fn read_progress(prd_dir: &Path) -> Result<String, RalphError> {
    let path = progress_txt_path(prd_dir);
    match std::fs::read_to_string(&path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(RalphError::Io { path, source }),
    }
}

/// Replace `verification.md` wholesale with the given checklist text.
pub fn write_verification(prd_dir: &Path, markdown: &str) -> Result<(), RalphError> {
    atomic_write(&verification_md_path(prd_dir), markdown.as_bytes())
}

pub fn read_verification(prd_dir: &Path) -> Result<Option<String>, RalphError> {
    read_optional(&verification_md_path(prd_dir))
}

/// Replace `findings.md` wholesale with the review engine's aggregated
/// output (or a deterministic fallback summary when no agent produced one).
pub fn write_findings(prd_dir: &Path, markdown: &str) -> Result<(), RalphError> {
    atomic_write(&findings_md_path(prd_dir), markdown.as_bytes())
}

pub fn read_findings(prd_dir: &Path) -> Result<Option<String>, RalphError> {
    read_optional(&findings_md_path(prd_dir))
}

fn read_optional(path: &Path) -> Result<Option<String>, RalphError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RalphError::Io { path: path.to_path_buf(), source }),
    }
}

/// `test-results/report.md`'s parsed shape: an outcome plus any issues the
/// test agent surfaced. The raw markdown is kept alongside so the report can
/// be displayed verbatim even though only `outcome`/`issues` feed the
/// engine's decision of whether to loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub outcome: TestOutcome,
    pub issues: Vec<String>,
    pub raw: String,
}

/// Slice out the `## Full Agent Output` section of a rendered report, so
/// re-parsing a persisted report doesn't double-count the derived
/// `## Passed`/`## Failed` sections above it.
fn full_agent_output_section(raw: &str) -> Option<&str> {
    let start = raw.find("## Full Agent Output")?;
    let after_heading = &raw[start..];
    let body_start = after_heading.find('\n').map(|i| i + 1).unwrap_or(after_heading.len());
    Some(&after_heading[body_start..])
}

impl TestReport {
    pub fn write(&self, prd_dir: &Path) -> Result<(), RalphError> {
        atomic_write(&test_report_path(prd_dir), self.raw.as_bytes())
    }

    pub fn read(prd_dir: &Path) -> Result<Option<Self>, RalphError> {
        let path = test_report_path(prd_dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RalphError::Io { path, source }),
        };
        // The derived `## Passed`/`## Failed` sections restate the same
        // checklist the agent's raw output carries under `## Full Agent
        // Output`; parsing the whole document would count every item twice.
        let agent_output = full_agent_output_section(&raw).unwrap_or(&raw);
        let (outcome, issues) = crate::executor::parsers::parse_test_report(agent_output);
        Ok(Some(Self { outcome, issues, raw }))
    }

    /// Remove a stale report before a retest, so a crashed run never leaves
    /// a prior cycle's verdict lying around to be misread as current.
    pub fn clear(prd_dir: &Path) -> Result<(), RalphError> {
        let path = test_report_path(prd_dir);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RalphError::Io { path, source }),
        }
    }
}
