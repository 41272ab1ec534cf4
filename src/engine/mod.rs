//! The orchestration engine: the central state machine driving development
//! and testing runs for one PRD at a time. Stateless between invocations —
//! every fact the engine needs either lives on disk (via the [`PrdStore`])
//! or is passed in fresh by the caller (the CLI, the daemon, or the swarm
//! manager).

pub mod prompts;

use std::path::{Path, PathBuf};
use std::time::Duration;

use ralph_common::event::{Event, EventKind, LogLevel, TestOutcome};
use ralph_common::prd::{LastRun, LastRunReason, PrdStatus, StoryStatus};
use ralph_common::RalphError;

use crate::config::RalphConfig;
use crate::executor::{self, CancellationToken, RunOptions};
use crate::prd::{companion, PrdStore, TestReport};

/// Assigns strictly increasing sequence numbers to events for one engine
/// invocation and forwards them to the caller's sink. Every run's stream
/// begins with a `log` or `iteration` event and ends with exactly one
/// terminal event (`complete` or `error`).
pub struct EventEmitter<'a> {
    prd: String,
    seq: u64,
    sink: &'a mut dyn FnMut(Event),
}

impl<'a> EventEmitter<'a> {
    pub fn new(prd: impl Into<String>, sink: &'a mut dyn FnMut(Event)) -> Self {
        Self { prd: prd.into(), seq: 0, sink }
    }

    pub fn emit(&mut self, kind: EventKind) {
        let event = Event::new(self.seq, self.prd.clone(), kind);
        self.seq += 1;
        (self.sink)(event);
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.emit(EventKind::Log { level, message: message.into() });
    }
}

/// Maximum number of iterations a single story may spend `in_progress`
/// before the engine auto-blocks it, bounding livelock.
const AUTO_BLOCK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevelopmentOutcome {
    MovedToTesting,
    Blocked,
    MaxIterations,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestingOutcome {
    Verified,
    Failed,
    Unknown,
}

pub struct DevelopmentOptions<'a> {
    pub agent_override: Option<&'a str>,
    pub cancel: CancellationToken,
    pub on_event: &'a mut dyn FnMut(Event),
}

pub struct TestingOptions<'a> {
    pub agent_override: Option<&'a str>,
    pub cancel: CancellationToken,
    pub on_event: &'a mut dyn FnMut(Event),
    /// Working directory lifecycle scripts run in — the project repo root
    /// for a plain run, or the PRD's worktree when driven by the swarm.
    pub cwd: PathBuf,
}

/// The orchestration engine. Holds only the store and config — any
/// per-invocation state (agent override, cancellation, event sink) is
/// threaded through as call parameters, never stored on `self`.
pub struct Engine {
    store: PrdStore,
    config: RalphConfig,
}

impl Engine {
    pub fn new(store: PrdStore, config: RalphConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &PrdStore {
        &self.store
    }

    pub fn config(&self) -> &RalphConfig {
        &self.config
    }

    /// Drive the develop loop for `name` up to `default_iterations` times,
    /// returning once every story is complete, a story blocks, the
    /// iteration budget is exhausted, or cancellation fires.
    #[tracing::instrument(skip(self, opts), fields(prd = %name))]
    pub async fn run_development(
        &self,
        name: &str,
        opts: DevelopmentOptions<'_>,
    ) -> Result<DevelopmentOutcome, RalphError> {
        let mut emitter = EventEmitter::new(name, opts.on_event);
        emitter.log(LogLevel::Info, format!("starting development run for {name}"));
        let agent_name = opts.agent_override.or(Some(self.config.default_agent.as_str()));
        let agent = match self.config.agent(agent_name) {
            Ok(agent) => agent.clone(),
            Err(e) => {
                emitter.emit(EventKind::Error { code: "CONFIG_ERROR".to_string(), message: e.to_string() });
                return Err(e);
            }
        };

        let prd = self.store.mark_started(name)?;
        for dependency in &prd.dependencies {
            if self.store.find_location(dependency) != Some(PrdStatus::Completed) {
                let err = RalphError::DependencyUnsatisfied {
                    prd: name.to_string(),
                    dependency: dependency.clone(),
                };
                emitter.emit(EventKind::Error { code: "DEPENDENCY_UNSATISFIED".to_string(), message: err.to_string() });
                return Err(err);
            }
        }
        if prd.stories.iter().any(|s| s.is_blocked()) {
            emitter.emit(EventKind::Complete { outcome: "blocked".to_string() });
            return Ok(DevelopmentOutcome::Blocked);
        }

        let prd_dir = self.store.prd_dir_for(name)?;
        let spec = std::fs::read_to_string(crate::prd::spec_md_path(&prd_dir)).unwrap_or_default();

        for iteration in 1..=self.config.default_iterations {
            if opts.cancel.is_cancelled() {
                emitter.emit(EventKind::Complete { outcome: "aborted".to_string() });
                return Ok(DevelopmentOutcome::Aborted);
            }

            let Some(mut story) = self.store.get_next_story(name)? else {
                self.handle_development_complete(name, &mut emitter).await?;
                return Ok(DevelopmentOutcome::MovedToTesting);
            };

            if story.status == StoryStatus::InProgress
                && story.iteration_count.unwrap_or(0) > AUTO_BLOCK_THRESHOLD
            {
                let reason = format!(
                    "auto-blocked after {} failed iterations",
                    story.iteration_count.unwrap_or(0)
                );
                self.store
                    .update_story_status(name, &story.id, StoryStatus::Blocked, Some(vec![reason]))?;
                emitter.emit(EventKind::StoryUpdate { story_id: story.id.clone(), status: StoryStatus::Blocked });
                emitter.emit(EventKind::Complete { outcome: "blocked".to_string() });
                return Ok(DevelopmentOutcome::Blocked);
            }

            story.status = StoryStatus::InProgress;
            let n = story.bump_iteration();
            self.store.update(name, |p| {
                if let Some(s) = p.find_story_mut(&story.id) {
                    s.status = StoryStatus::InProgress;
                    s.iteration_count = Some(n);
                }
            })?;
            emitter.emit(EventKind::StoryUpdate { story_id: story.id.clone(), status: StoryStatus::InProgress });
            emitter.emit(EventKind::Iteration { number: iteration });

            let progress = companion::read_progress(&prd_dir).unwrap_or_default();
            let prompt = prompts::develop_prompt(&self.store.get(name)?, &story, &spec, &progress);

            let mut chunks: Vec<String> = Vec::new();
            let exit_code;
            let output;
            {
                let mut on_output = |chunk: &str| chunks.push(chunk.to_string());
                let run_opts = RunOptions {
                    stream: true,
                    cancel: opts.cancel.clone(),
                    on_output: Some(&mut on_output),
                    on_tool: None,
                };
                let result = executor::run(&prompt, &agent, run_opts).await?;
                exit_code = result.exit_code;
                output = result.output;
            }
            for chunk in chunks {
                emitter.emit(EventKind::AgentOutput { chunk });
            }
            emitter.emit(EventKind::AgentExit { code: exit_code });

            let (in_tokens, out_tokens) = executor::parsers::parse_token_usage(&output).unwrap_or((0, 0));
            self.store.update_metrics(name, 1, in_tokens, out_tokens)?;

            let prd_after = self.store.get(name)?;
            if executor::parsers::has_completion_signal(&output) && prd_after.is_complete() {
                self.handle_development_complete(name, &mut emitter).await?;
                return Ok(DevelopmentOutcome::MovedToTesting);
            }

            let current_status = prd_after.find_story(&story.id).map(|s| s.status);
            if matches!(current_status, Some(StoryStatus::Completed) | Some(StoryStatus::Blocked)) {
                emitter.emit(EventKind::StoryUpdate {
                    story_id: story.id.clone(),
                    status: current_status.unwrap(),
                });
                continue;
            }

            if let Some(derived) = executor::parsers::parse_status(&output, &story.id) {
                let status = if derived == "completed" { StoryStatus::Completed } else { StoryStatus::Blocked };
                let questions = if status == StoryStatus::Blocked {
                    Some(vec!["Agent reported this story as blocked".to_string()])
                } else {
                    None
                };
                self.store.update_story_status(name, &story.id, status, questions)?;
                emitter.emit(EventKind::StoryUpdate { story_id: story.id.clone(), status });
            }
        }

        emitter.emit(EventKind::Complete { outcome: "max_iterations".to_string() });
        Ok(DevelopmentOutcome::MaxIterations)
    }

    /// Mark completed, extract findings, optionally review, transition to
    /// `testing`, generate `verification.md`, record `lastRun`.
    async fn handle_development_complete(
        &self,
        name: &str,
        emitter: &mut EventEmitter<'_>,
    ) -> Result<(), RalphError> {
        self.store.mark_completed(name)?;
        let prd_dir = self.store.prd_dir_for(name)?;
        let progress = companion::read_progress(&prd_dir).unwrap_or_default();
        self.extract_findings(name, &progress).await?;

        if self.config.review.enabled {
            match crate::review::run(&self.config, name, |kind| emitter.emit(kind)).await {
                Ok(_) => {}
                Err(e) => emitter.log(LogLevel::Warn, format!("review pipeline error (non-fatal): {e}")),
            }
        }

        let from = self.store.find_location(name).map(|s| s.to_string()).unwrap_or_default();
        self.store.transition(name, PrdStatus::Testing)?;
        emitter.emit(EventKind::StateChange { from, to: PrdStatus::Testing.to_string() });

        let prd_dir = self.store.prd_dir_for(name)?;
        let prd = self.store.get(name)?;
        let verification = match self.config.verification_agent.as_deref() {
            Some(agent_name) => match self.config.agent(Some(agent_name)) {
                Ok(agent) => {
                    let prompt = prompts::verification_generation_prompt(&prd);
                    match executor::run(&prompt, agent, RunOptions::default()).await {
                        Ok(r) if !r.output.trim().is_empty() => r.output,
                        _ => prompts::deterministic_verification(&prd),
                    }
                }
                Err(_) => prompts::deterministic_verification(&prd),
            },
            None => prompts::deterministic_verification(&prd),
        };
        companion::write_verification(&prd_dir, &verification)?;

        self.store.update_last_run(
            name,
            LastRun {
                timestamp: chrono::Utc::now(),
                story_id: "ALL".to_string(),
                reason: LastRunReason::Completed,
                summary: "All stories completed. PRD moved to testing.".to_string(),
            },
        )?;
        Ok(())
    }

    async fn extract_findings(&self, name: &str, progress: &str) -> Result<(), RalphError> {
        let prd = self.store.get(name)?;
        let markdown = match self.config.verification_agent.as_deref().and_then(|n| self.config.agent(Some(n)).ok()) {
            Some(agent) => {
                let prompt = prompts::findings_extraction_prompt(&prd, progress);
                match executor::run(&prompt, agent, RunOptions::default()).await {
                    Ok(r) if !r.output.trim().is_empty() => r.output,
                    _ => prompts::deterministic_findings(&prd, progress),
                }
            }
            None => prompts::deterministic_findings(&prd, progress),
        };
        self.store.extract_and_save_findings(name, &markdown)
    }

    /// Drive the test/retest loop for `name`, including the health-check
    /// fix loop, and transition the PRD per the agent's verdict.
    #[tracing::instrument(skip(self, opts), fields(prd = %name))]
    pub async fn run_testing(&self, name: &str, opts: TestingOptions<'_>) -> Result<TestingOutcome, RalphError> {
        let mut emitter = EventEmitter::new(name, opts.on_event);
        emitter.log(LogLevel::Info, format!("starting test run for {name}"));
        let agent_name = opts.agent_override.or(Some(self.config.default_agent.as_str()));
        let agent = match self.config.agent(agent_name) {
            Ok(agent) => agent.clone(),
            Err(e) => {
                emitter.emit(EventKind::Error { code: "CONFIG_ERROR".to_string(), message: e.to_string() });
                return Err(e);
            }
        };

        let prd = self.store.get(name)?;
        if self.store.find_location(name) != Some(PrdStatus::Testing) {
            emitter.log(LogLevel::Warn, format!("PRD {name} is not in 'testing' status; proceeding anyway"));
        }

        let prd_dir = self.store.prd_dir_for(name)?;
        if companion::read_verification(&prd_dir)?.is_none() {
            let verification = prompts::deterministic_verification(&prd);
            companion::write_verification(&prd_dir, &verification)?;
        }

        let existing_report = TestReport::read(&prd_dir)?;
        let focused_failures: Option<Vec<String>> = existing_report
            .as_ref()
            .filter(|r| !r.issues.is_empty())
            .map(|r| r.issues.clone());

        if focused_failures.is_none() {
            self.store.clear_test_results(name)?;
        }

        emitter.emit(EventKind::HealthCheckStart);
        let health_ok = self.run_health_check_loop(name, &agent, &opts.cwd, &opts.cancel, &mut emitter).await?;
        if !health_ok {
            emitter.log(LogLevel::Warn, "health check did not pass; continuing with a warning".to_string());
        }

        let verification_md = companion::read_verification(&prd_dir)?.unwrap_or_default();
        let prompt = match &focused_failures {
            Some(failures) => prompts::retest_prompt(&prd, failures, &self.config.testing),
            None => prompts::test_prompt(&prd, &verification_md, &self.config.testing),
        };

        let result = executor::run(&prompt, &agent, RunOptions { cancel: opts.cancel.clone(), ..RunOptions::default() }).await?;
        emitter.emit(EventKind::AgentExit { code: result.exit_code });

        let (outcome, issues) = executor::parsers::parse_test_report(&result.output);
        let report = TestReport { outcome, issues: issues.clone(), raw: build_report_markdown(&result.output, outcome, &issues) };
        report.write(&prd_dir)?;

        let final_outcome = match outcome {
            TestOutcome::Verified => {
                self.extract_findings(name, &companion::read_progress(&prd_dir).unwrap_or_default()).await?;
                let from = self.store.find_location(name).map(|s| s.to_string()).unwrap_or_default();
                self.store.transition(name, PrdStatus::Completed)?;
                self.store.mark_completed(name)?;
                emitter.emit(EventKind::StateChange { from, to: PrdStatus::Completed.to_string() });
                emitter.emit(EventKind::TestComplete { outcome: TestOutcome::Verified, issues: Vec::new() });

                let commit_prompt = prompts::auto_commit_prompt(name);
                if let Err(e) = executor::run(&commit_prompt, &agent, RunOptions::default()).await {
                    emitter.log(LogLevel::Warn, format!("auto-commit failed (non-fatal): {e}"));
                }
                TestingOutcome::Verified
            }
            TestOutcome::Failed => {
                self.store.add_fix_story(name, issues.clone(), "test-results/report.md")?;
                let from = self.store.find_location(name).map(|s| s.to_string()).unwrap_or_default();
                self.store.transition(name, PrdStatus::InProgress)?;
                emitter.emit(EventKind::StateChange { from, to: PrdStatus::InProgress.to_string() });
                emitter.emit(EventKind::TestComplete { outcome: TestOutcome::Failed, issues });
                TestingOutcome::Failed
            }
            TestOutcome::Unknown => {
                emitter.emit(EventKind::TestComplete { outcome: TestOutcome::Unknown, issues: Vec::new() });
                TestingOutcome::Unknown
            }
        };

        run_lifecycle_script(self.config.scripts.teardown.as_deref(), name, &opts.cwd).await;
        emitter.emit(EventKind::Complete { outcome: format!("{final_outcome:?}") });
        Ok(final_outcome)
    }

    /// Teardown → setup → start → poll `health_check` every 2s up to
    /// `health_check_timeout`; on failure with attempts remaining, spawn a
    /// fix agent. Returns `true` once health passes (or there is no
    /// `health_check` script configured, treated as a no-op success).
    async fn run_health_check_loop(
        &self,
        name: &str,
        agent: &crate::config::AgentConfig,
        cwd: &Path,
        cancel: &CancellationToken,
        emitter: &mut EventEmitter<'_>,
    ) -> Result<bool, RalphError> {
        let scripts = &self.config.scripts;
        if scripts.health_check.is_none() {
            return Ok(true);
        }

        for attempt in 1..=self.config.testing.max_health_fix_attempts {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            run_lifecycle_script(scripts.teardown.as_deref(), name, cwd).await;
            run_lifecycle_script(scripts.setup.as_deref(), name, cwd).await;
            run_lifecycle_script(scripts.start.as_deref(), name, cwd).await;

            let (passed, last_output) =
                wait_for_health_check(scripts.health_check.as_deref().unwrap(), name, cwd, self.config.testing.health_check_timeout, emitter)
                    .await;
            if passed {
                emitter.emit(EventKind::HealthCheckPassed);
                return Ok(true);
            }

            emitter.emit(EventKind::HealthCheckFailed { reason: last_output.clone() });
            if attempt >= self.config.testing.max_health_fix_attempts {
                break;
            }

            let fix_prompt = prompts::health_check_fix_prompt(name, &last_output);
            let fix_result = executor::run(&fix_prompt, agent, RunOptions::default()).await?;
            match executor::parsers::detect_health_check_result(&fix_result.output) {
                Some(executor::parsers::HealthCheckFixResult::Fixed) => continue,
                _ => break,
            }
        }
        Ok(false)
    }
}

/// Poll `script` every 2s until it exits 0 or `timeout_secs` elapses.
async fn wait_for_health_check(
    script: &Path,
    name: &str,
    cwd: &Path,
    timeout_secs: u64,
    emitter: &mut EventEmitter<'_>,
) -> (bool, String) {
    let start = std::time::Instant::now();
    let mut attempt = 0;
    let mut last_output = String::new();
    loop {
        attempt += 1;
        let elapsed = start.elapsed();
        if elapsed.as_secs() > timeout_secs {
            return (false, last_output);
        }
        emitter.emit(EventKind::HealthCheckProgress { attempt, elapsed_secs: elapsed.as_secs() });

        let output = tokio::process::Command::new(script)
            .arg(name)
            .current_dir(cwd)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => return (true, String::new()),
            Ok(out) => last_output = String::from_utf8_lossy(&out.stderr).to_string(),
            Err(e) => last_output = e.to_string(),
        }

        if start.elapsed().as_secs() + 2 > timeout_secs {
            return (false, last_output);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Run a lifecycle script (`setup`/`start`/`teardown`), passing the PRD
/// name as `$1`. Missing scripts are no-ops; failures are logged but never
/// propagated — callers that need the exit status use
/// `wait_for_health_check` instead.
async fn run_lifecycle_script(script: Option<&Path>, name: &str, cwd: &Path) {
    let Some(script) = script else { return };
    match tokio::process::Command::new(script).arg(name).current_dir(cwd).status().await {
        Ok(status) if !status.success() => {
            tracing::warn!(script = %script.display(), code = ?status.code(), "lifecycle script exited non-zero");
        }
        Err(e) => tracing::warn!(script = %script.display(), error = %e, "failed to run lifecycle script"),
        _ => {}
    }
}

fn build_report_markdown(raw_output: &str, outcome: TestOutcome, issues: &[String]) -> String {
    let (passed, failed) = split_checklist(raw_output);
    format!(
        "# Test report\n\n\
         ## Summary\nOutcome: {outcome:?}\n\n\
         ## Passed\n{passed}\n\n\
         ## Failed\n{failed}\n\n\
         ## Full Agent Output\n{raw_output}\n",
        outcome = outcome,
        passed = if passed.is_empty() { "(none)".to_string() } else { passed },
        failed = if issues.is_empty() && failed.is_empty() { "(none)".to_string() } else { failed },
    )
}

fn split_checklist(text: &str) -> (String, String) {
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("- [x]") || trimmed.starts_with("- [X]") {
            passed.push(trimmed.to_string());
        } else if trimmed.starts_with("- [ ]") {
            failed.push(trimmed.to_string());
        }
    }
    (passed.join("\n"), failed.join("\n"))
}

/// End-to-end tests against the engine's core scenarios, each driven with
/// a `sh -c` stand-in agent whose canned stdout carries the sentinels a
/// real agent would emit.
#[cfg(test)]
mod tests {
    use super::*;
    use ralph_common::prd::{Prd, Story};

    fn config_with_agent(script: &str) -> RalphConfig {
        let raw = format!(
            "[ralph]\nproject_name = \"demo\"\n\n[ralph.agents.default]\ncommand = \"sh\"\nargs = [\"-c\", {:?}]\n",
            script
        );
        RalphConfig::parse(&raw).unwrap()
    }

    fn engine_with(script: &str, state_dir: &std::path::Path) -> Engine {
        let store = PrdStore::new(state_dir).unwrap();
        Engine::new(store, config_with_agent(script))
    }

    fn no_op_sink(_: Event) {}

    #[tokio::test]
    async fn scenario_single_story_happy_path() {
        let state_dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            "cat >/dev/null; echo 'Committed changes'; echo 'marked US-001 as completed'; echo '<promise>COMPLETE</promise>'",
            state_dir.path(),
        );

        let mut prd = Prd::new("alpha", "demo prd");
        let mut story = Story::new("US-001", "first story", 1);
        story.acceptance_criteria = vec!["ok".to_string()];
        prd.stories.push(story);
        engine.store().create(prd).unwrap();

        let mut sink = no_op_sink;
        let opts = DevelopmentOptions { agent_override: None, cancel: CancellationToken::new(), on_event: &mut sink };
        let outcome = engine.run_development("alpha", opts).await.unwrap();

        assert_eq!(outcome, DevelopmentOutcome::MovedToTesting);
        let prd = engine.store().get("alpha").unwrap();
        assert_eq!(prd.stories[0].status, StoryStatus::Completed);
        assert_eq!(engine.store().find_location("alpha"), Some(PrdStatus::Testing));
        assert_eq!(prd.last_run.unwrap().reason, LastRunReason::Completed);
        let prd_dir = engine.store().prd_dir_for("alpha").unwrap();
        assert!(companion::read_verification(&prd_dir).unwrap().is_some());
    }

    #[tokio::test]
    async fn scenario_iteration_cap_leaves_first_story_in_progress() {
        let state_dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with("cat >/dev/null; echo 'nothing interesting happened'", state_dir.path());
        engine.config.default_iterations = 1;

        let mut prd = Prd::new("beta", "demo prd");
        prd.stories.push(Story::new("US-001", "first", 1));
        prd.stories.push(Story::new("US-002", "second", 2));
        engine.store().create(prd).unwrap();

        let mut sink = no_op_sink;
        let opts = DevelopmentOptions { agent_override: None, cancel: CancellationToken::new(), on_event: &mut sink };
        let outcome = engine.run_development("beta", opts).await.unwrap();

        assert_eq!(outcome, DevelopmentOutcome::MaxIterations);
        let prd = engine.store().get("beta").unwrap();
        let first = prd.find_story("US-001").unwrap();
        assert_eq!(first.status, StoryStatus::InProgress);
        assert_eq!(first.iteration_count, Some(1));
        let second = prd.find_story("US-002").unwrap();
        assert_eq!(second.status, StoryStatus::Pending);
        assert_eq!(second.iteration_count, None);
    }

    #[tokio::test]
    async fn scenario_auto_block_after_livelock() {
        let state_dir = tempfile::tempdir().unwrap();
        let engine = engine_with("cat >/dev/null; echo 'nothing interesting happened'", state_dir.path());

        let mut prd = Prd::new("gamma", "demo prd");
        let mut story = Story::new("US-001", "stuck story", 1);
        story.status = StoryStatus::InProgress;
        story.iteration_count = Some(3);
        prd.stories.push(story);
        engine.store().create(prd).unwrap();

        let mut sink = no_op_sink;
        let opts = DevelopmentOptions { agent_override: None, cancel: CancellationToken::new(), on_event: &mut sink };
        let outcome = engine.run_development("gamma", opts).await.unwrap();

        assert_eq!(outcome, DevelopmentOutcome::Blocked);
        let prd = engine.store().get("gamma").unwrap();
        let story = prd.find_story("US-001").unwrap();
        assert!(story.is_blocked());
        assert_eq!(story.questions, vec!["auto-blocked after 4 failed iterations".to_string()]);
    }

    fn testing_prd(name: &str, state_dir: &std::path::Path) -> (PrdStore, std::path::PathBuf) {
        let store = PrdStore::new(state_dir).unwrap();
        let mut prd = Prd::new(name, "demo prd");
        let mut story = Story::new("US-001", "first", 1);
        story.status = StoryStatus::Completed;
        prd.stories.push(story);
        store.create(prd).unwrap();
        store.transition(name, PrdStatus::InProgress).unwrap();
        store.transition(name, PrdStatus::Testing).unwrap();
        let dir = store.prd_dir_for(name).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn scenario_focused_retest_verified_moves_to_completed() {
        let state_dir = tempfile::tempdir().unwrap();
        let (store, prd_dir) = testing_prd("delta", state_dir.path());
        companion::write_verification(&prd_dir, "- [ ] cart total\n").unwrap();
        let report = TestReport {
            outcome: TestOutcome::Failed,
            issues: vec!["cart total wrong - off by one".to_string()],
            raw: "## Failed\n- [ ] cart total wrong - **Reason:** off by one\n".to_string(),
        };
        report.write(&prd_dir).unwrap();

        let config = config_with_agent("cat >/dev/null; echo '<test-result>PRD_VERIFIED</test-result>'");
        let engine = Engine::new(store, config);

        let mut sink = no_op_sink;
        let opts = TestingOptions {
            agent_override: None,
            cancel: CancellationToken::new(),
            on_event: &mut sink,
            cwd: state_dir.path().to_path_buf(),
        };
        let outcome = engine.run_testing("delta", opts).await.unwrap();

        assert_eq!(outcome, TestingOutcome::Verified);
        assert_eq!(engine.store().find_location("delta"), Some(PrdStatus::Completed));
        let prd = engine.store().get("delta").unwrap();
        assert!(!prd.stories.iter().any(|s| s.id.starts_with("FIX-")));
    }

    #[tokio::test]
    async fn scenario_test_failure_adds_fix_story_and_regresses_status() {
        let state_dir = tempfile::tempdir().unwrap();
        let (store, prd_dir) = testing_prd("epsilon", state_dir.path());
        companion::write_verification(&prd_dir, "- [ ] everything works\n").unwrap();

        let config = config_with_agent(
            "cat >/dev/null; echo '<test-result>PRD_FAILED</test-result>'; echo '<issues>'; echo '- pagination breaks at page 0'; echo '- null crashes name filter'; echo '</issues>'",
        );
        let engine = Engine::new(store, config);

        let mut sink = no_op_sink;
        let opts = TestingOptions {
            agent_override: None,
            cancel: CancellationToken::new(),
            on_event: &mut sink,
            cwd: state_dir.path().to_path_buf(),
        };
        let outcome = engine.run_testing("epsilon", opts).await.unwrap();

        assert_eq!(outcome, TestingOutcome::Failed);
        assert_eq!(engine.store().find_location("epsilon"), Some(PrdStatus::InProgress));
        let prd = engine.store().get("epsilon").unwrap();
        let fix = prd.stories.iter().find(|s| s.id == "FIX-001").unwrap();
        assert_eq!(
            fix.acceptance_criteria,
            vec!["pagination breaks at page 0".to_string(), "null crashes name filter".to_string()]
        );
        assert!(fix.priority > prd.find_story("US-001").unwrap().priority);
    }

    /// Every run's event stream begins with either a `log` or an `iteration`
    /// event, even when agent resolution fails before anything else runs.
    #[tokio::test]
    async fn run_development_emits_event_before_agent_lookup_fails() {
        let state_dir = tempfile::tempdir().unwrap();
        let engine = engine_with("echo unused", state_dir.path());

        let mut prd = Prd::new("zeta", "demo prd");
        prd.stories.push(Story::new("US-001", "first story", 1));
        engine.store().create(prd).unwrap();

        let mut events = Vec::new();
        let mut sink = |e: Event| events.push(e);
        let opts = DevelopmentOptions { agent_override: Some("nonexistent"), cancel: CancellationToken::new(), on_event: &mut sink };
        let result = engine.run_development("zeta", opts).await;

        assert!(result.is_err());
        assert!(!events.is_empty());
        assert!(matches!(events[0].kind, EventKind::Log { .. }));
    }

    #[tokio::test]
    async fn run_testing_emits_event_before_agent_lookup_fails() {
        let state_dir = tempfile::tempdir().unwrap();
        let (store, _prd_dir) = testing_prd("eta", state_dir.path());
        let engine = Engine::new(store, config_with_agent("echo unused"));

        let mut events = Vec::new();
        let mut sink = |e: Event| events.push(e);
        let opts = TestingOptions {
            agent_override: Some("nonexistent"),
            cancel: CancellationToken::new(),
            on_event: &mut sink,
            cwd: state_dir.path().to_path_buf(),
        };
        let result = engine.run_testing("eta", opts).await;

        assert!(result.is_err());
        assert!(!events.is_empty());
        assert!(matches!(events[0].kind, EventKind::Log { .. }));
    }
}
