//! lintfix command-line interface.

use clap::{Parser, Subcommand};
use colored::Colorize;
use lintfix::config::LoggingConfig;
use lintfix::{
    BatchReport, ClaudeCliAgent, FixContext, FixEngine, FixError, FixerConfig, FixingAgent,
    GitCli, MergeStrategy, Result, RuffLinter, SessionStatus, VersionControl, WorkspaceManager,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lintfix")]
#[command(version)]
#[command(about = "Fix lint issues with parallel agents in isolated git worktrees", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory used for config lookup (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// ruff executable
    #[arg(long, global = true, env = "LINTFIX_RUFF", default_value = "ruff")]
    ruff: PathBuf,

    /// Claude CLI executable
    #[arg(long, global = true, env = "LINTFIX_CLAUDE", default_value = "claude")]
    claude: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fix lint issues in one or more files
    Fix {
        /// Files to fix
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Merge strategy: agent, sequential, or octopus
        #[arg(short, long)]
        strategy: Option<String>,

        /// Maximum concurrent agent invocations
        #[arg(long)]
        max_workers: Option<usize>,

        /// Maximum convergence iterations per file
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Only apply predicted fixes and the linter's own fixer
        #[arg(long)]
        no_agent: bool,

        /// Skip files whose issues are all simple to auto-fix
        #[arg(long)]
        only_complex: bool,

        /// Print the batch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show issues, predicted fixes and clusters for a file without changing it
    Plan {
        /// File to plan
        file: PathBuf,
    },

    /// Remove workspaces and branches left behind by interrupted runs
    Sweep {
        /// Only remove workspaces older than this many seconds
        #[arg(long, default_value_t = 0)]
        older_than: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let project = cli.project.canonicalize().unwrap_or_else(|_| cli.project.clone());
    let loaded = FixerConfig::load(&project);
    init_tracing(cli.verbose, cli.log_json, loaded.as_ref().ok().map(|c| &c.logging));

    let code = match loaded {
        Ok(config) => match run(cli, &project, config).await {
            Ok(code) => code,
            Err(e) => report_error(&e),
        },
        Err(e) => report_error(&e),
    };
    std::process::exit(code);
}

fn report_error(e: &FixError) -> i32 {
    eprintln!("{} {}", "Error:".red().bold(), e);
    e.exit_code()
}

fn init_tracing(verbose: bool, json: bool, logging: Option<&LoggingConfig>) {
    let filter = if verbose {
        EnvFilter::new("lintfix=debug,info")
    } else if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else {
        match logging {
            Some(logging) if !logging.enabled => EnvFilter::new("off"),
            Some(LoggingConfig {
                level: Some(level), ..
            }) => EnvFilter::new(level),
            _ => EnvFilter::new("lintfix=info,warn"),
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli, project: &Path, mut config: FixerConfig) -> Result<i32> {
    let agent = ClaudeCliAgent::new().with_program(&cli.claude);
    let linter = RuffLinter::new()
        .with_program(&cli.ruff)
        .with_timeout(config.linter_timeout());

    match cli.command {
        Commands::Fix {
            files,
            strategy,
            max_workers,
            max_attempts,
            no_agent,
            only_complex,
            json,
        } => {
            if let Some(strategy) = strategy {
                config.claude_code.worktree_merge_strategy = strategy
                    .parse::<MergeStrategy>()
                    .map_err(|e| FixError::invalid_config("--strategy", e.to_string()))?;
            }
            if let Some(workers) = max_workers {
                config.claude_code.max_workers = workers;
            }
            if let Some(attempts) = max_attempts {
                config.claude_code.max_fix_attempts = attempts;
            }
            if no_agent {
                config.claude_code.enabled = false;
            }
            config.validate()?;

            let ctx = FixContext::new(config, Arc::new(agent), Arc::new(linter), Arc::new(GitCli::new()))
                .with_available_agent()
                .await;
            let engine = FixEngine::new(ctx);

            let files = if only_complex {
                select_complex(&engine, files).await
            } else {
                files
            };
            if files.is_empty() {
                println!("{} Nothing needs the agent", "OK".green().bold());
                return Ok(0);
            }

            let report = engine.fix_files(&files).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            Ok(if report.all_clean() {
                0
            } else if !report.aborted().is_empty() {
                1
            } else {
                2
            })
        }

        Commands::Plan { file } => {
            config.validate()?;
            let ctx = FixContext::new(config, Arc::new(agent), Arc::new(linter), Arc::new(GitCli::new()));
            let plan = FixEngine::new(ctx).plan(&file).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(0)
        }

        Commands::Sweep { older_than } => {
            let manager = WorkspaceManager::new(
                Arc::new(GitCli::new()),
                config.claude_code.max_worktrees,
                config.workspace_timeout(),
            );
            let dir = project.to_path_buf();
            let root = manager
                .git("rev-parse", move |vcs: &dyn VersionControl| vcs.repo_root(&dir))
                .await?;
            let removed = manager
                .sweep_stale(&root, Duration::from_secs(older_than))
                .await?;
            println!(
                "{} Removed {} stale workspace(s) in {}",
                "OK".green().bold(),
                removed,
                root.display()
            );
            Ok(0)
        }
    }
}

/// Keep files whose issues need more than the linter's own fixer.
async fn select_complex(engine: &FixEngine, files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut selected = Vec::with_capacity(files.len());
    for file in files {
        match engine.plan(&file).await {
            Ok(plan) if !plan.needs_agent => {
                info!(file = %file.display(), issues = plan.issues.len(), "Skipping: only simple issues");
            }
            // Errors surface again in the session.
            _ => selected.push(file),
        }
    }
    selected
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        let file = outcome.file.display();
        match &outcome.status {
            SessionStatus::Success => {
                println!("{} {} ({} iteration(s))", "✓".green().bold(), file, outcome.attempts);
            }
            SessionStatus::Aborted(reason) => {
                println!("{} {}: {}", "✗".red().bold(), file, reason);
            }
            status => {
                println!(
                    "{} {}: {} with {} issue(s) left",
                    "!".yellow().bold(),
                    file,
                    status.label(),
                    outcome.residual.len()
                );
                for issue in &outcome.residual {
                    println!("    {}", issue.format());
                }
            }
        }
    }

    let summary = format!(
        "{}/{} file(s) clean, {} issue(s) left",
        report.success_count(),
        report.outcomes.len(),
        report.residual_count()
    );
    if report.all_clean() {
        println!("\n{}", summary.green().bold());
    } else {
        println!("\n{}", summary.yellow().bold());
    }
}
