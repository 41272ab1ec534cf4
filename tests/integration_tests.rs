//! Integration tests exercising the `ralph` binary end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn ralph() -> Command {
    Command::cargo_bin("ralph").unwrap()
}

/// A bare git repo with an `omni.toml` naming the project, the minimum a
/// command needs to resolve a project context.
fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join(".git")).unwrap();
    fs::write(
        dir.path().join("omni.toml"),
        "[ralph]\nproject_name = \"demo\"\ndefault_agent = \"default\"\n",
    )
    .unwrap();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_succeeds() {
        ralph().arg("--help").assert().success();
    }

    #[test]
    fn version_succeeds() {
        ralph().arg("--version").assert().success();
    }

    #[test]
    fn list_on_empty_project_reports_no_prds() {
        let dir = init_project();
        ralph()
            .current_dir(dir.path())
            .args(["--project-dir", &dir.path().to_string_lossy(), "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("no PRDs found"));
    }

    #[test]
    fn status_on_unknown_prd_fails() {
        let dir = init_project();
        ralph()
            .current_dir(dir.path())
            .args(["--project-dir", &dir.path().to_string_lossy(), "status", "nonexistent"])
            .assert()
            .failure();
    }

    #[test]
    fn missing_repo_root_fails_with_clear_error() {
        let dir = TempDir::new().unwrap();
        ralph()
            .current_dir(dir.path())
            .args(["--project-dir", &dir.path().to_string_lossy(), "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("error"));
    }
}
