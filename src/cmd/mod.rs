//! CLI command handlers. Each function takes whatever the subcommand needs
//! plus a loaded [`Engine`]/[`SwarmManager`] and prints to stdout/stderr,
//! returning the process exit code (`0` success, `1` error/failure, `2`
//! indeterminate) rather than a `Result` — `main` is the only caller and it
//! has nothing further to do with an error besides reporting it.

use std::path::PathBuf;
use std::sync::Arc;

use ralph_common::event::{Event, EventKind};
use ralph_common::prd::PrdStatus;

use crate::config::RalphConfig;
use crate::engine::{DevelopmentOptions, DevelopmentOutcome, Engine, TestingOptions, TestingOutcome};
use crate::executor::CancellationToken;
use crate::project::ProjectContext;
use crate::session::TmuxBackend;
use crate::swarm::SwarmManager;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_INDETERMINATE: i32 = 2;

fn print_event(event: &Event) {
    match &event.kind {
        EventKind::Log { level, message } => println!("[{level:?}] {message}"),
        EventKind::StateChange { from, to } => println!("state: {from} -> {to}"),
        EventKind::StoryUpdate { story_id, status } => println!("story {story_id}: {status:?}"),
        EventKind::Iteration { number } => println!("--- iteration {number} ---"),
        EventKind::AgentOutput { chunk } => print!("{chunk}"),
        EventKind::AgentExit { code } => println!("\nagent exited with code {code}"),
        EventKind::HealthCheckStart => println!("health check: starting"),
        EventKind::HealthCheckProgress { attempt, elapsed_secs } => {
            println!("health check: attempt {attempt} ({elapsed_secs}s elapsed)")
        }
        EventKind::HealthCheckPassed => println!("health check: passed"),
        EventKind::HealthCheckFailed { reason } => println!("health check: failed ({reason})"),
        EventKind::ReviewAgentComplete { phase, aspect, approved } => {
            println!("review[{phase}/{aspect}]: {}", if *approved { "approved" } else { "changes requested" })
        }
        EventKind::ReviewPhaseComplete { phase, clean } => {
            println!("review phase '{phase}' complete: {}", if *clean { "clean" } else { "unresolved" })
        }
        EventKind::TestComplete { outcome, issues } => {
            println!("test complete: {outcome:?}");
            for issue in issues {
                println!("  - {issue}");
            }
        }
        EventKind::Complete { outcome } => println!("done: {outcome}"),
        EventKind::Error { code, message } => eprintln!("error [{code}]: {message}"),
    }
}

pub fn list(engine: &Engine, status: Option<PrdStatus>) -> i32 {
    match engine.store().list_by_status(status) {
        Ok(prds) => {
            if prds.is_empty() {
                println!("no PRDs found");
                return EXIT_OK;
            }
            println!("{:<24} {:<12} {:>8}", "NAME", "STATUS", "STORIES");
            for prd in prds {
                let status = engine.store().find_location(&prd.name).map(|s| s.to_string()).unwrap_or_default();
                println!("{:<24} {:<12} {:>8}", prd.name, status, prd.stories.len());
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub fn status(engine: &Engine, name: &str) -> i32 {
    match engine.store().get(name) {
        Ok(prd) => {
            let status = engine.store().find_location(name).map(|s| s.to_string()).unwrap_or_default();
            println!("{name} ({status})");
            println!("{}", prd.description);
            for story in &prd.stories {
                println!("  [{:?}] {} - {}", story.status, story.id, story.title);
            }
            if let Some(last_run) = &prd.last_run {
                println!("last run: {:?} at {} - {}", last_run.reason, last_run.timestamp, last_run.summary);
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn start(engine: &Engine, name: &str, agent: Option<&str>) -> i32 {
    let mut on_event = |event: Event| print_event(&event);
    let opts = DevelopmentOptions { agent_override: agent, cancel: CancellationToken::new(), on_event: &mut on_event };
    match engine.run_development(name, opts).await {
        Ok(DevelopmentOutcome::MovedToTesting) => EXIT_OK,
        Ok(DevelopmentOutcome::Blocked) => EXIT_INDETERMINATE,
        Ok(DevelopmentOutcome::MaxIterations) => EXIT_INDETERMINATE,
        Ok(DevelopmentOutcome::Aborted) => EXIT_ERROR,
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn test(engine: &Engine, name: &str, agent: Option<&str>, cwd: PathBuf) -> i32 {
    let mut on_event = |event: Event| print_event(&event);
    let opts = TestingOptions { agent_override: agent, cancel: CancellationToken::new(), on_event: &mut on_event, cwd };
    match engine.run_testing(name, opts).await {
        Ok(TestingOutcome::Verified) => EXIT_OK,
        Ok(TestingOutcome::Failed) => EXIT_ERROR,
        Ok(TestingOutcome::Unknown) => EXIT_INDETERMINATE,
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub fn progress(engine: &Engine, name: &str) -> i32 {
    match engine.store().prd_dir_for(name).and_then(|dir| crate::prd::companion::read_progress(&dir)) {
        Ok(text) => {
            print!("{text}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub fn prd(engine: &Engine, name: &str) -> i32 {
    match engine.store().get(name) {
        Ok(prd) => match serde_json::to_string_pretty(&prd) {
            Ok(json) => {
                println!("{json}");
                EXIT_OK
            }
            Err(e) => {
                eprintln!("error: {e}");
                EXIT_ERROR
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub fn spec_cmd(engine: &Engine, name: &str) -> i32 {
    match engine.store().prd_dir_for(name) {
        Ok(dir) => match std::fs::read_to_string(dir.join("spec.md")) {
            Ok(text) => {
                print!("{text}");
                EXIT_OK
            }
            Err(e) => {
                eprintln!("error: no spec.md for {name}: {e}");
                EXIT_ERROR
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

/// Manually finalize a PRD parked in `testing` after a `test_complete(unknown)`
/// outcome — the one case the engine itself leaves for a human to resolve.
pub fn complete(engine: &Engine, name: &str) -> i32 {
    if engine.store().find_location(name) != Some(PrdStatus::Testing) {
        eprintln!("error: PRD '{name}' is not in 'testing' status");
        return EXIT_ERROR;
    }
    let result = engine.store().mark_completed(name).and_then(|_| engine.store().transition(name, PrdStatus::Completed)).and_then(
        |_| {
            engine.store().update_last_run(
                name,
                ralph_common::prd::LastRun {
                    timestamp: chrono::Utc::now(),
                    story_id: "ALL".to_string(),
                    reason: ralph_common::prd::LastRunReason::Completed,
                    summary: "Manually completed via `ralph complete`.".to_string(),
                },
            )
        },
    );
    match result {
        Ok(_) => {
            println!("{name} marked completed");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub fn build_swarm_manager(project: &ProjectContext, config: RalphConfig) -> Result<SwarmManager, ralph_common::RalphError> {
    let state_dir = project.state_dir();
    let store = crate::prd::PrdStore::new(&state_dir)?;
    let session_name = format!("ralph-{}", project.project_name);
    Ok(SwarmManager::new(&state_dir, project.repo_root.clone(), session_name, Arc::new(TmuxBackend::new()), store, config))
}

pub async fn swarm_start(manager: &SwarmManager, name: &str, agent: Option<&str>) -> i32 {
    match manager.start(name, agent).await {
        Ok(entry) => {
            println!("started {name} in pane {} at {}", entry.pane_id, entry.worktree.display());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_test(manager: &SwarmManager, name: &str, agent: Option<&str>) -> i32 {
    match manager.test(name, agent).await {
        Ok(entry) => {
            println!("testing {name} in pane {}", entry.pane_id);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_stop(manager: &SwarmManager, name: Option<&str>) -> i32 {
    let result = match name {
        Some(name) => manager.stop(name).await,
        None => manager.stop_all().await,
    };
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_list(manager: &SwarmManager) -> i32 {
    match manager.list().await {
        Ok(runs) => {
            if runs.is_empty() {
                println!("no active runs");
                return EXIT_OK;
            }
            println!("{:<24} {:<10} {:<12} {}", "PRD", "STATUS", "PANE", "WORKTREE");
            for (name, entry) in runs {
                println!("{:<24} {:<10} {:<12} {}", name, format!("{:?}", entry.status), entry.pane_id, entry.worktree.display());
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_attach(manager: &SwarmManager, name: &str) -> i32 {
    match manager.attach(name).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_logs(manager: &SwarmManager, name: &str, tail: usize) -> i32 {
    match manager.logs(name, tail).await {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_merge(manager: &SwarmManager, name: Option<&str>) -> i32 {
    let reports = match name {
        Some(name) => manager.merge(name).await.map(|r| vec![r]),
        None => manager.merge_all().await,
    };
    match reports {
        Ok(reports) => {
            let mut any_conflict = false;
            for report in reports {
                match report.conflict {
                    Some(conflict) => {
                        any_conflict = true;
                        println!("{}: conflict in {:?}", report.prd, conflict.files);
                    }
                    None => println!("{}: merged\n{}", report.prd, report.output),
                }
            }
            if any_conflict {
                EXIT_INDETERMINATE
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_cleanup(manager: &SwarmManager, name: Option<&str>) -> i32 {
    let result = match name {
        Some(name) => manager.cleanup(name).await,
        None => manager.cleanup_all().await,
    };
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_recover(manager: &SwarmManager) -> i32 {
    match manager.recover().await {
        Ok(report) => {
            println!("recovered: {:?}", report.recovered);
            println!("orphaned:  {:?}", report.orphaned);
            println!("cleaned:   {:?}", report.cleaned);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}

pub async fn swarm_conflicts(manager: &SwarmManager) -> i32 {
    match manager.conflicts().await {
        Ok(reports) => {
            let mut any = false;
            for report in reports {
                if !report.is_clean() {
                    any = true;
                    println!("{}: {:?}", report.prd, report.files);
                } else {
                    println!("{}: clean", report.prd);
                }
            }
            if any { EXIT_INDETERMINATE } else { EXIT_OK }
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_ERROR
        }
    }
}
