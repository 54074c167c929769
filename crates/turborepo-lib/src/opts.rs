//! Resolved options for one invocation. Precedence is CLI flag over
//! environment variable over configuration file.

use thiserror::Error;
use turborepo_cache::{CacheOpts, RemoteCacheOpts};
use turborepo_engine::OutputLogsMode;

use crate::{cli::RunArgs, turbo_json::TurboJson};

const DEFAULT_CONCURRENCY: u32 = 10;
const DEFAULT_CACHE_DIR: &str = ".turbo/cache";
const DEFAULT_API_URL: &str = "https://vercel.com/api";

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "invalid value for --concurrency: expected a positive integer or percentage, got {0}"
    )]
    InvalidConcurrency(String),
    #[error(
        "invalid value for --output-logs: expected full, hash-only, new-only, errors-only, or \
         none, got {0}"
    )]
    InvalidOutputLogs(String),
}

#[derive(Debug)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub run_cache_opts: RunCacheOpts,
    pub scope_opts: ScopeOpts,
    pub api_client_opts: APIClientOpts,
}

#[derive(Debug)]
pub struct RunOpts {
    pub tasks: Vec<String>,
    pub concurrency: u32,
    pub parallel: bool,
    pub continue_on_error: bool,
    pub pass_through_args: Vec<String>,
    pub only: bool,
    pub dry_run: bool,
    pub dry_run_json: bool,
    pub graph: Option<GraphOpts>,
    pub log_prefix: bool,
    pub summarize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphOpts {
    Stdout,
    File(String),
}

#[derive(Debug, Default)]
pub struct RunCacheOpts {
    pub skip_reads: bool,
    pub skip_writes: bool,
    pub task_output_logs_override: Option<OutputLogsMode>,
}

#[derive(Debug, Default)]
pub struct ScopeOpts {
    pub filter_patterns: Vec<String>,
}

#[derive(Debug)]
pub struct APIClientOpts {
    pub api_url: String,
    pub token: Option<String>,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
    pub timeout_secs: u64,
}

impl Opts {
    pub fn resolve(args: &RunArgs, root_turbo_json: &TurboJson) -> Result<Opts, Error> {
        let concurrency = args
            .concurrency
            .as_deref()
            .map(parse_concurrency)
            .transpose()?
            .unwrap_or(DEFAULT_CONCURRENCY);

        let env_force = bool_env("TURBO_FORCE");
        let env_summarize = bool_env("TURBO_RUN_SUMMARY");

        let run_opts = RunOpts {
            tasks: args.tasks.clone(),
            concurrency,
            parallel: args.parallel,
            continue_on_error: args.continue_execution,
            pass_through_args: args.pass_through_args.clone(),
            only: args.only,
            dry_run: args.dry_run.is_some(),
            dry_run_json: matches!(args.dry_run.as_deref(), Some("json")),
            graph: args.graph.as_ref().map(|file| {
                if file.is_empty() {
                    GraphOpts::Stdout
                } else {
                    GraphOpts::File(file.clone())
                }
            }),
            log_prefix: true,
            summarize: args.summarize || env_summarize,
        };

        let run_cache_opts = RunCacheOpts {
            skip_reads: args.force || env_force,
            skip_writes: args.no_cache,
            task_output_logs_override: args
                .output_logs
                .as_deref()
                .map(parse_output_logs)
                .transpose()?,
        };

        let token = non_empty_env("TURBO_TOKEN")
            .or_else(|| non_empty_env("VERCEL_ARTIFACTS_TOKEN"));
        let remote_cache_opts = root_turbo_json.remote_cache.clone();
        let team_id = non_empty_env("TURBO_TEAM").or_else(|| {
            remote_cache_opts
                .as_ref()
                .and_then(|opts| opts.team_id.clone())
        });

        let cache_opts = CacheOpts {
            cache_dir: args
                .cache_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_CACHE_DIR.to_string())
                .into(),
            skip_remote: token.is_none(),
            skip_filesystem: false,
            workers: 10,
            remote_cache_opts: remote_cache_opts.clone().or(Some(RemoteCacheOpts::default())),
        };

        let api_client_opts = APIClientOpts {
            api_url: non_empty_env("TURBO_API").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token,
            team_id,
            team_slug: None,
            timeout_secs: non_empty_env("TURBO_REMOTE_CACHE_TIMEOUT")
                .and_then(|timeout| timeout.parse().ok())
                .unwrap_or(30),
        };

        Ok(Opts {
            run_opts,
            cache_opts,
            run_cache_opts,
            scope_opts: ScopeOpts {
                filter_patterns: args.filter.clone(),
            },
            api_client_opts,
        })
    }
}

fn bool_env(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_output_logs(raw: &str) -> Result<OutputLogsMode, Error> {
    match raw {
        "full" => Ok(OutputLogsMode::Full),
        "hash-only" => Ok(OutputLogsMode::HashOnly),
        "new-only" => Ok(OutputLogsMode::NewOnly),
        "errors-only" => Ok(OutputLogsMode::ErrorsOnly),
        "none" => Ok(OutputLogsMode::None),
        other => Err(Error::InvalidOutputLogs(other.to_string())),
    }
}

fn parse_concurrency(raw: &str) -> Result<u32, Error> {
    if let Some(percent) = raw.strip_suffix('%') {
        let percent: f64 = percent
            .parse()
            .map_err(|_| Error::InvalidConcurrency(raw.to_string()))?;
        if percent > 0.0 && percent.is_finite() {
            return Ok(((num_cpus::get() as f64 * percent / 100.0).max(1.0)) as u32);
        }
        return Err(Error::InvalidConcurrency(raw.to_string()));
    }
    match raw.parse::<u32>() {
        Ok(concurrency) if concurrency >= 1 => Ok(concurrency),
        _ => Err(Error::InvalidConcurrency(raw.to_string())),
    }
}
