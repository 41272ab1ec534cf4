//! Multi-phase code-review pipeline, run after development completes.
//!
//! For each configured phase, every aspect is reviewed independently; if any
//! reviewer requests changes, a fix agent runs (bounded by
//! `max_fix_iterations`) and the phase is re-reviewed. Review is advisory —
//! an unresolved phase is recorded unclean but never blocks the PRD from
//! moving to `testing`.

use std::sync::LazyLock;

use regex::Regex;

use ralph_common::event::EventKind;

use crate::config::{AgentConfig, RalphConfig, ReviewAspect};
use crate::engine::prompts;
use crate::executor::{self, RunOptions};

static REVIEW_RESULT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<review-result>(APPROVE|REQUEST_CHANGES)</review-result>").unwrap());

static REVIEW_FINDINGS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<review-findings>(.*?)</review-findings>").unwrap());

static FINDING_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*-\s*\[(CRITICAL|MAJOR|MINOR|SUGGESTION)\]\s*(.+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Suggestion,
}

impl Severity {
    fn parse(s: &str) -> Self {
        match s {
            "CRITICAL" => Severity::Critical,
            "MAJOR" => Severity::Major,
            "MINOR" => Severity::Minor,
            _ => Severity::Suggestion,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub text: String,
}

/// `true` when the agent's output carries an explicit `APPROVE` verdict.
/// Absence of any sentinel is treated as `REQUEST_CHANGES` — a reviewer
/// that didn't answer clearly should not silently pass.
fn parse_verdict(output: &str) -> bool {
    REVIEW_RESULT_REGEX
        .captures(output)
        .map(|c| &c[1] == "APPROVE")
        .unwrap_or(false)
}

fn parse_findings(output: &str) -> Vec<Finding> {
    let Some(caps) = REVIEW_FINDINGS_REGEX.captures(output) else {
        return Vec::new();
    };
    FINDING_LINE_REGEX
        .captures_iter(&caps[1])
        .map(|c| Finding {
            severity: Severity::parse(&c[1]),
            text: c[2].trim().to_string(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase: String,
    pub clean: bool,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewOutcome {
    pub phases: Vec<PhaseOutcome>,
}

impl ReviewOutcome {
    pub fn all_clean(&self) -> bool {
        self.phases.iter().all(|p| p.clean)
    }
}

/// Run every configured review phase against `prd_name`, emitting
/// `review_agent_complete`/`review_phase_complete` events as it goes.
/// Errors from individual agent invocations are non-fatal: an aspect that
/// fails to run is treated as `REQUEST_CHANGES` and logged rather than
/// aborting the whole review.
pub async fn run(
    config: &RalphConfig,
    prd_name: &str,
    mut emit: impl FnMut(EventKind),
) -> Result<ReviewOutcome, ralph_common::RalphError> {
    let review = &config.review;
    let review_agent = config.agent(review.agent.as_deref())?;
    let fix_agent = config.agent(Some(config.fix_agent_name()))?;

    let mut outcome = ReviewOutcome::default();

    for phase in &review.phases {
        let (mut all_approved, mut findings) =
            run_aspects(review_agent, prd_name, &phase.name, &phase.aspects, &mut emit).await;
        let mut clean = all_approved;

        let mut fix_iteration = 0;
        while !clean && fix_iteration < review.max_fix_iterations {
            fix_iteration += 1;
            let texts: Vec<String> = findings.iter().map(|f| f.text.clone()).collect();
            let fix_prompt = prompts::review_fix_prompt(prd_name, &phase.name, &texts);
            let _ = executor::run(&fix_prompt, fix_agent, RunOptions::default()).await;

            (all_approved, findings) = run_aspects(review_agent, prd_name, &phase.name, &phase.aspects, &mut emit).await;
            clean = all_approved;
        }

        emit(EventKind::ReviewPhaseComplete { phase: phase.name.clone(), clean });
        outcome.phases.push(PhaseOutcome { phase: phase.name.clone(), clean, findings });
    }

    if review.phases.iter().any(|p| p.name == "finalize") {
        // An explicit `finalize` phase was already run above like any other.
    } else if !review.phases.is_empty() {
        let finalize_agent = config.agent(Some(config.finalize_agent_name()))?;
        let prompt = prompts::finalize_prompt(prd_name);
        let _ = executor::run(&prompt, finalize_agent, RunOptions::default()).await;
        emit(EventKind::ReviewPhaseComplete { phase: "finalize".to_string(), clean: true });
    }

    Ok(outcome)
}

/// Run every aspect of one phase, collecting findings from reviewers that
/// requested changes (an approving reviewer contributes no findings). The
/// phase is clean only when every aspect approved — an aspect that reports
/// `REQUEST_CHANGES` without a parseable findings block, or one whose agent
/// invocation errors outright, still counts against the phase.
async fn run_aspects(
    agent: &AgentConfig,
    prd_name: &str,
    phase: &str,
    aspects: &[ReviewAspect],
    emit: &mut impl FnMut(EventKind),
) -> (bool, Vec<Finding>) {
    let mut findings = Vec::new();
    let mut all_approved = true;
    for aspect in aspects {
        let aspect_name = aspect.display_name();
        let prompt = prompts::review_prompt(prd_name, phase, aspect_name);
        let result = executor::run(&prompt, agent, RunOptions::default()).await;
        let approved = match &result {
            Ok(r) => parse_verdict(&r.output),
            Err(e) => {
                tracing::warn!(phase, aspect = aspect_name, error = %e, "review aspect agent failed, treating as REQUEST_CHANGES");
                false
            }
        };
        if !approved {
            all_approved = false;
            match &result {
                Ok(r) => findings.extend(parse_findings(&r.output)),
                Err(e) => findings.push(Finding { severity: Severity::Major, text: format!("{aspect_name}: review agent failed: {e}") }),
            }
        }
        emit(EventKind::ReviewAgentComplete {
            phase: phase.to_string(),
            aspect: aspect_name.to_string(),
            approved,
        });
    }
    (all_approved, findings)
}
