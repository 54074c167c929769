//! The command-line surface.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "turbo", author, version, about = "The build system that makes ship happen")]
pub struct Args {
    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run tasks across projects in your monorepo
    Run(Box<RunArgs>),
}

#[derive(Debug, clap::Args, Default)]
pub struct RunArgs {
    /// Tasks to run
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Restrict execution to packages matching the filter
    #[arg(long, action = clap::ArgAction::Append)]
    pub filter: Vec<String>,

    /// Concurrency limit: a count, or a percentage of CPU cores
    #[arg(long)]
    pub concurrency: Option<String>,

    /// Ignore dependency ordering and run everything at once
    #[arg(long)]
    pub parallel: bool,

    /// Ignore existing cache entries and force tasks to run
    #[arg(long)]
    pub force: bool,

    /// Do not write results to the cache
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Keep running unrelated tasks after a failure
    #[arg(long = "continue")]
    pub continue_execution: bool,

    /// Show what would run without executing; `--dry=json` for machines
    #[arg(long = "dry", value_name = "json", num_args = 0..=1, default_missing_value = "")]
    pub dry_run: Option<String>,

    /// Render the task graph instead of running; optional dot output file
    #[arg(long, value_name = "file", num_args = 0..=1, default_missing_value = "")]
    pub graph: Option<String>,

    /// How much task output reaches the terminal: full, hash-only,
    /// new-only, errors-only, or none
    #[arg(long = "output-logs")]
    pub output_logs: Option<String>,

    /// Only run the named tasks, not their dependencies
    #[arg(long)]
    pub only: bool,

    /// Override the local cache directory
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<String>,

    /// Persist a run summary under .turbo/runs
    #[arg(long)]
    pub summarize: bool,

    /// Arguments passed through to every task after `--`
    #[arg(last = true)]
    pub pass_through_args: Vec<String>,
}

/// Entry point for the `turbo` binary. Returns the process exit code.
pub async fn main() -> i32 {
    let args = Args::parse();

    let filter = match args.verbosity {
        0 => EnvFilter::try_from_env("TURBO_LOG_VERBOSITY")
            .unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Run(run_args) => match crate::run::run(&run_args).await {
            Ok(exit_code) => exit_code,
            Err(err) => {
                eprintln!("error: {err}");
                1
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> RunArgs {
        let args = Args::try_parse_from(args).unwrap();
        match args.command {
            Command::Run(run_args) => *run_args,
        }
    }

    #[test]
    fn test_basic_run() {
        let run = parse(&["turbo", "run", "build", "test"]);
        assert_eq!(run.tasks, vec!["build", "test"]);
        assert!(!run.force);
        assert!(run.dry_run.is_none());
    }

    #[test]
    fn test_flags() {
        let run = parse(&[
            "turbo",
            "run",
            "build",
            "--filter",
            "web",
            "--filter",
            "docs",
            "--concurrency",
            "50%",
            "--continue",
            "--force",
            "--output-logs",
            "hash-only",
        ]);
        assert_eq!(run.filter, vec!["web", "docs"]);
        assert_eq!(run.concurrency.as_deref(), Some("50%"));
        assert!(run.continue_execution);
        assert!(run.force);
        assert_eq!(run.output_logs.as_deref(), Some("hash-only"));
    }

    #[test]
    fn test_dry_run_variants() {
        assert_eq!(
            parse(&["turbo", "run", "build", "--dry"]).dry_run.as_deref(),
            Some("")
        );
        assert_eq!(
            parse(&["turbo", "run", "build", "--dry=json"])
                .dry_run
                .as_deref(),
            Some("json")
        );
    }

    #[test]
    fn test_pass_through_args() {
        let run = parse(&["turbo", "run", "test", "--", "--watch"]);
        assert_eq!(run.pass_through_args, vec!["--watch"]);
    }

    #[test]
    fn test_tasks_required() {
        assert!(Args::try_parse_from(["turbo", "run"]).is_err());
    }
}
