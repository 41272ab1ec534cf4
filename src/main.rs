//! CLI entry point. Parses arguments, loads project configuration, and
//! dispatches to the handlers in [`ralph::cmd`], translating their exit
//! codes into the process' own via `std::process::exit`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ralph::cmd;
use ralph::config::RalphConfig;
use ralph::engine::Engine;
use ralph::prd::PrdStore;
use ralph::project::{find_repo_root, ProjectContext};

#[derive(Parser)]
#[command(name = "ralph")]
#[command(about = "PRD-driven development orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Project directory (defaults to the current directory's repository root)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known PRDs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a PRD's stories and last run
    Status { name: String },
    /// Run the development loop for a PRD until it moves to testing, blocks, or exhausts iterations
    Start {
        name: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Run the testing phase for a PRD currently in testing
    Test {
        name: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Print a PRD's progress log
    Progress { name: String },
    /// Print a PRD's prd.json
    Prd { name: String },
    /// Print a PRD's spec.md
    Spec { name: String },
    /// Manually finalize a PRD stuck in testing after an unknown test result
    Complete { name: String },
    /// Swarm operations: concurrent PRD runs in isolated worktrees/tmux panes
    Swarm {
        #[command(subcommand)]
        command: SwarmCommands,
    },
}

#[derive(Subcommand)]
enum SwarmCommands {
    /// Start a PRD's development loop in its own worktree and tmux pane
    Start {
        name: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Start a PRD's testing phase in its own worktree and tmux pane
    Test {
        name: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Stop a run, or all runs if no name is given
    Stop { name: Option<String> },
    /// List active runs
    List,
    /// Focus the tmux pane for a run
    Attach { name: String },
    /// Print a run's captured pane output
    Logs {
        name: String,
        #[arg(long, default_value_t = 100)]
        tail: usize,
    },
    /// Merge a run's branch, or all running branches if no name is given
    Merge { name: Option<String> },
    /// Tear down a run's pane and worktree, or all of them if no name is given
    Cleanup { name: Option<String> },
    /// Reconcile swarm state against live tmux panes and worktrees
    Recover,
    /// Dry-run merge conflict check for all running branches
    Conflicts,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ralph=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn load_project(project_dir: Option<PathBuf>) -> Result<(ProjectContext, RalphConfig), ralph_common::RalphError> {
    let cwd = std::env::current_dir().map_err(|source| ralph_common::RalphError::Io { path: PathBuf::from("."), source })?;
    let repo_root = project_dir
        .or_else(|| find_repo_root(&cwd))
        .ok_or_else(|| ralph_common::RalphError::ConfigError("could not locate a git repository root".to_string()))?;
    let config = RalphConfig::load(&repo_root)?;
    let project = ProjectContext::new(config.project_name.clone(), repo_root)?;
    Ok((project, config))
}

fn engine_for(project: &ProjectContext, config: RalphConfig) -> Result<Engine, ralph_common::RalphError> {
    let store = PrdStore::new(&project.state_dir())?;
    Ok(Engine::new(store, config))
}

fn parse_status(raw: Option<String>) -> Result<Option<ralph_common::prd::PrdStatus>, String> {
    raw.map(|s| match s.as_str() {
        "pending" => Ok(ralph_common::prd::PrdStatus::Pending),
        "in_progress" => Ok(ralph_common::prd::PrdStatus::InProgress),
        "testing" => Ok(ralph_common::prd::PrdStatus::Testing),
        "completed" => Ok(ralph_common::prd::PrdStatus::Completed),
        other => Err(format!("unknown status '{other}'")),
    })
    .transpose()
}

fn fail(e: ralph_common::RalphError) -> i32 {
    eprintln!("error: {e}");
    cmd::EXIT_ERROR
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let (project, config) = match load_project(cli.project_dir) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(cmd::EXIT_ERROR);
        }
    };

    let code = match cli.command {
        Commands::List { status } => match parse_status(status) {
            Ok(status) => match engine_for(&project, config) {
                Ok(engine) => cmd::list(&engine, status),
                Err(e) => fail(e),
            },
            Err(msg) => {
                eprintln!("error: {msg}");
                cmd::EXIT_ERROR
            }
        },
        Commands::Status { name } => match engine_for(&project, config) {
            Ok(engine) => cmd::status(&engine, &name),
            Err(e) => fail(e),
        },
        Commands::Start { name, agent } => match engine_for(&project, config) {
            Ok(engine) => cmd::start(&engine, &name, agent.as_deref()).await,
            Err(e) => fail(e),
        },
        Commands::Test { name, agent } => match engine_for(&project, config) {
            Ok(engine) => cmd::test(&engine, &name, agent.as_deref(), project.repo_root.clone()).await,
            Err(e) => fail(e),
        },
        Commands::Progress { name } => match engine_for(&project, config) {
            Ok(engine) => cmd::progress(&engine, &name),
            Err(e) => fail(e),
        },
        Commands::Prd { name } => match engine_for(&project, config) {
            Ok(engine) => cmd::prd(&engine, &name),
            Err(e) => fail(e),
        },
        Commands::Spec { name } => match engine_for(&project, config) {
            Ok(engine) => cmd::spec_cmd(&engine, &name),
            Err(e) => fail(e),
        },
        Commands::Complete { name } => match engine_for(&project, config) {
            Ok(engine) => cmd::complete(&engine, &name),
            Err(e) => fail(e),
        },
        Commands::Swarm { command } => match cmd::build_swarm_manager(&project, config) {
            Ok(manager) => match command {
                SwarmCommands::Start { name, agent } => cmd::swarm_start(&manager, &name, agent.as_deref()).await,
                SwarmCommands::Test { name, agent } => cmd::swarm_test(&manager, &name, agent.as_deref()).await,
                SwarmCommands::Stop { name } => cmd::swarm_stop(&manager, name.as_deref()).await,
                SwarmCommands::List => cmd::swarm_list(&manager).await,
                SwarmCommands::Attach { name } => cmd::swarm_attach(&manager, &name).await,
                SwarmCommands::Logs { name, tail } => cmd::swarm_logs(&manager, &name, tail).await,
                SwarmCommands::Merge { name } => cmd::swarm_merge(&manager, name.as_deref()).await,
                SwarmCommands::Cleanup { name } => cmd::swarm_cleanup(&manager, name.as_deref()).await,
                SwarmCommands::Recover => cmd::swarm_recover(&manager).await,
                SwarmCommands::Conflicts => cmd::swarm_conflicts(&manager).await,
            },
            Err(e) => fail(e),
        },
    };

    std::process::exit(code);
}
