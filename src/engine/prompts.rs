//! Prompt builders: pure functions of PRD + spec + progress + config
//! producing the textual prompt for each engine phase. None of these touch
//! state — they only read what is handed to them — and every builder
//! embeds the literal sentinel its counterpart in [`crate::executor::parsers`]
//! searches for, so the parsers are total with respect to a well-behaved
//! agent.

use ralph_common::prd::{Prd, Story};

use crate::config::TestingConfig;

fn acceptance_criteria_block(story: &Story) -> String {
    if story.acceptance_criteria.is_empty() {
        return "(none recorded)".to_string();
    }
    story
        .acceptance_criteria
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The develop-loop prompt for one iteration on `story`.
pub fn develop_prompt(prd: &Prd, story: &Story, spec: &str, progress: &str) -> String {
    format!(
        "You are implementing user story {id} of PRD \"{name}\".\n\n\
         # PRD description\n{description}\n\n\
         # Story\n{title}\n\n\
         ## Acceptance criteria\n{criteria}\n\n\
         # Spec\n{spec}\n\n\
         # Progress so far\n{progress}\n\n\
         Implement this story, committing your changes as you go. When the\n\
         acceptance criteria are satisfied, write to the story's status\n\
         (status completed) or state clearly \"marked {id} as completed\" and\n\
         \"Committed changes\". If you cannot proceed — unclear requirements,\n\
         missing information, or blocked on external dependencies — say so\n\
         explicitly: \"{id} blocked\" and the reason.\n\n\
         When every story in this PRD is done, emit exactly:\n\
         <promise>COMPLETE</promise>",
        id = story.id,
        name = prd.name,
        description = prd.description,
        title = story.title,
        criteria = acceptance_criteria_block(story),
        spec = spec,
        progress = progress,
    )
}

/// Full (first-pass) test prompt: verify every acceptance criterion across
/// every completed story against `verification_md`.
pub fn test_prompt(prd: &Prd, verification_md: &str, testing: &TestingConfig) -> String {
    let instructions = testing
        .instructions
        .as_deref()
        .unwrap_or("Exercise the application end-to-end against the checklist below.");
    let project_instructions = testing
        .project_verification_instructions
        .as_deref()
        .unwrap_or("");
    format!(
        "You are testing PRD \"{name}\" end-to-end.\n\n\
         # Verification checklist\n{checklist}\n\n\
         # Testing instructions\n{instructions}\n{project_instructions}\n\n\
         For every checklist item, record `- [x] item` if it passes or\n\
         `- [ ] item **Reason:** why it failed` if it does not, under headed\n\
         `## Passed` and `## Failed` sections.\n\n\
         If every item passes, emit exactly:\n\
         <test-result>PRD_VERIFIED</test-result>\n\n\
         Otherwise emit exactly:\n\
         <test-result>PRD_FAILED</test-result>\n\
         <issues>\n- first failing item\n- second failing item\n</issues>",
        name = prd.name,
        checklist = verification_md,
        instructions = instructions,
        project_instructions = project_instructions,
    )
}

/// Focused retest: only the failures recorded in the last `report.md` are
/// carried forward as the acceptance criteria to reverify.
pub fn retest_prompt(prd: &Prd, failures: &[String], testing: &TestingConfig) -> String {
    let instructions = testing
        .instructions
        .as_deref()
        .unwrap_or("Exercise the application end-to-end against the checklist below.");
    let items = failures.iter().map(|f| format!("- {f}")).collect::<Vec<_>>().join("\n");
    format!(
        "You are re-testing PRD \"{name}\" after fixes were applied for\n\
         previously failing checks.\n\n\
         # Checklist (previously failing items only)\n{items}\n\n\
         # Testing instructions\n{instructions}\n\n\
         For every item, record `- [x] item` if it now passes or\n\
         `- [ ] item **Reason:** why it still fails`.\n\n\
         If every item passes, emit exactly:\n\
         <test-result>PRD_VERIFIED</test-result>\n\n\
         Otherwise emit exactly:\n\
         <test-result>PRD_FAILED</test-result>\n\
         <issues>\n- first still-failing item\n</issues>",
        name = prd.name,
        items = items,
        instructions = instructions,
    )
}

/// Asks a dedicated verification agent to turn a PRD's acceptance criteria
/// into a `verification.md` checklist. The fallback deterministic generator
/// lives in [`crate::engine`] and does not go through an agent at all.
pub fn verification_generation_prompt(prd: &Prd) -> String {
    let mut items = Vec::new();
    for story in &prd.stories {
        for criterion in &story.acceptance_criteria {
            items.push(format!("- [ ] {criterion} ({id})", id = story.id));
        }
    }
    format!(
        "Generate a verification checklist (`verification.md`) for PRD\n\
         \"{name}\" covering every acceptance criterion below. Write one\n\
         `- [ ] <criterion>` line per item; do not mark any item complete.\n\n\
         # Acceptance criteria\n{items}",
        name = prd.name,
        items = items.join("\n"),
    )
}

/// Asks an agent to distill durable learnings from a completed PRD's
/// progress log into `findings.md`.
pub fn findings_extraction_prompt(prd: &Prd, progress: &str) -> String {
    format!(
        "Summarize durable, reusable findings from completing PRD \"{name}\"\n\
         for future work in this codebase. Read the progress log below and\n\
         write `findings.md`: patterns that worked, pitfalls hit, and any\n\
         codebase conventions discovered.\n\n\
         # Progress log\n{progress}",
        name = prd.name,
        progress = progress,
    )
}

/// Deterministic fallback findings summary, used when no findings agent is
/// configured.
pub fn deterministic_findings(prd: &Prd, progress: &str) -> String {
    format!(
        "# Findings: {name}\n\n\
         {description}\n\n\
         ## Stories completed\n{stories}\n\n\
         ## Progress log excerpt\n{progress}\n",
        name = prd.name,
        description = prd.description,
        stories = prd
            .stories
            .iter()
            .map(|s| format!("- {} — {}", s.id, s.title))
            .collect::<Vec<_>>()
            .join("\n"),
        progress = progress.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n"),
    )
}

/// Deterministic fallback verification.md: transcribes acceptance criteria
/// into a checklist without invoking an agent.
pub fn deterministic_verification(prd: &Prd) -> String {
    let mut out = format!("# Verification: {}\n\n", prd.name);
    for story in &prd.stories {
        out.push_str(&format!("## {} — {}\n", story.id, story.title));
        if story.acceptance_criteria.is_empty() {
            out.push_str("- [ ] (no acceptance criteria recorded)\n");
        }
        for criterion in &story.acceptance_criteria {
            out.push_str(&format!("- [ ] {criterion}\n"));
        }
        out.push('\n');
    }
    out
}

/// Asked of the "fix" agent in the health-check loop, with the last failed
/// health-check output attached.
pub fn health_check_fix_prompt(prd_name: &str, last_output: &str) -> String {
    format!(
        "The health check for PRD \"{prd_name}\" is failing. Diagnose and fix\n\
         the problem using the output below, then restart the service.\n\n\
         # Last health-check output\n{last_output}\n\n\
         If you fixed it, emit exactly:\n\
         <healthcheck-result>FIXED</healthcheck-result>\n\n\
         If the problem cannot be fixed from here, emit exactly:\n\
         <healthcheck-result>NOT_FIXABLE</healthcheck-result>",
    )
}

/// One review aspect's prompt within a review phase.
pub fn review_prompt(prd_name: &str, phase: &str, aspect: &str) -> String {
    format!(
        "Review the changes made for PRD \"{prd_name}\" from a {aspect}\n\
         perspective, as part of the \"{phase}\" review phase. List concrete\n\
         findings, each on its own hyphenated line inside <review-findings>,\n\
         tagged with a severity:\n\
         <review-findings>\n\
         - [CRITICAL|MAJOR|MINOR|SUGGESTION] path:line - description\n\
         </review-findings>\n\n\
         Then emit your verdict exactly:\n\
         <review-result>APPROVE</review-result>\n\
         or\n\
         <review-result>REQUEST_CHANGES</review-result>",
    )
}

/// Asks the fix agent to resolve a phase's collected review findings.
pub fn review_fix_prompt(prd_name: &str, phase: &str, findings: &[String]) -> String {
    let items = findings.iter().map(|f| format!("- {f}")).collect::<Vec<_>>().join("\n");
    format!(
        "Address the following review findings from the \"{phase}\" review\n\
         phase of PRD \"{prd_name}\":\n\n{items}\n\n\
         Fix each issue and commit your changes.",
    )
}

/// The optional final cleanup/summarization phase, run regardless of prior
/// review outcomes.
pub fn finalize_prompt(prd_name: &str) -> String {
    format!(
        "Perform a final cleanup pass on PRD \"{prd_name}\": remove dead\n\
         code, tidy comments, and ensure the change set is ready to merge.\n\
         Commit any cleanup changes.",
    )
}

/// Best-effort auto-commit after a PRD is verified.
pub fn auto_commit_prompt(prd_name: &str) -> String {
    format!(
        "PRD \"{prd_name}\" has been verified. Commit any remaining\n\
         uncommitted changes in the working tree with a descriptive message.\n\
         If there is nothing to commit, do nothing.",
    )
}

/// Asks the merge agent to merge `branch` into `main_branch`.
pub fn merge_prompt(branch: &str, main_branch: &str) -> String {
    format!(
        "Merge branch \"{branch}\" into \"{main_branch}\" in the current\n\
         repository. Resolve any conflicts you can safely resolve. Report\n\
         the files changed and the resulting commit SHA. If conflicts\n\
         cannot be resolved, list the conflicting files clearly.",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_common::prd::Prd;

    #[test]
    fn develop_prompt_embeds_completion_sentinel() {
        let prd = Prd::new("alpha", "desc");
        let story = Story::new("US-001", "first", 1);
        let prompt = develop_prompt(&prd, &story, "spec", "progress");
        assert!(prompt.contains("<promise>COMPLETE</promise>"));
        assert!(prompt.contains("US-001"));
    }

    #[test]
    fn test_prompt_embeds_both_sentinels() {
        let prd = Prd::new("alpha", "desc");
        let prompt = test_prompt(&prd, "- [ ] works", &TestingConfig::default());
        assert!(prompt.contains("<test-result>PRD_VERIFIED</test-result>"));
        assert!(prompt.contains("<test-result>PRD_FAILED</test-result>"));
        assert!(prompt.contains("<issues>"));
    }

    #[test]
    fn health_check_fix_prompt_embeds_sentinels() {
        let prompt = health_check_fix_prompt("alpha", "connection refused");
        assert!(prompt.contains("<healthcheck-result>FIXED</healthcheck-result>"));
        assert!(prompt.contains("<healthcheck-result>NOT_FIXABLE</healthcheck-result>"));
        assert!(prompt.contains("connection refused"));
    }

    #[test]
    fn review_prompt_embeds_sentinels() {
        let prompt = review_prompt("alpha", "quality-pass", "security");
        assert!(prompt.contains("<review-result>APPROVE</review-result>"));
        assert!(prompt.contains("<review-findings>"));
    }

    #[test]
    fn deterministic_verification_lists_every_criterion() {
        let mut prd = Prd::new("alpha", "desc");
        let mut story = Story::new("US-001", "first", 1);
        story.acceptance_criteria = vec!["does the thing".to_string()];
        prd.stories.push(story);
        let checklist = deterministic_verification(&prd);
        assert!(checklist.contains("- [ ] does the thing"));
    }
}
