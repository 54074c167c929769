//! One invocation end to end: discover the workspace, build and validate
//! the task graph, fingerprint, then execute or dry-run.

pub mod cache;
pub mod global_hash;
pub mod scope;
pub mod summary;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::debug;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_analytics::AnalyticsHandle;
use turborepo_api_client::{APIAuth, APIClient};
use turborepo_cache::AsyncCache;
use turborepo_engine::EngineBuilder;
use turborepo_repository::{package_graph::PackageGraph, package_json::PackageJson};
use turborepo_task_id::TaskName;

use crate::{
    cli::RunArgs,
    daemon::OutputHints,
    opts::{GraphOpts, Opts},
    process::ProcessManager,
    run::{
        cache::RunCache,
        scope::AllPackagesChanged,
        summary::RunTracker,
    },
    signal::SignalHandler,
    task_graph::Visitor,
    task_hash::{PackageInputsHashes, TaskHasher},
    turbo_json::{CONFIG_FILE, TurboJsonLoader},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "could not find {CONFIG_FILE} in the current directory or any ancestor; run `turbo` \
         inside a repository"
    )]
    RepoNotFound,
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    PackageJson(#[from] turborepo_repository::package_json::Error),
    #[error(transparent)]
    PackageGraph(#[from] turborepo_repository::package_graph::Error),
    #[error(transparent)]
    Config(#[from] crate::turbo_json::Error),
    #[error(transparent)]
    Opts(#[from] crate::opts::Error),
    #[error(transparent)]
    Scope(#[from] scope::Error),
    #[error(transparent)]
    Builder(#[from] turborepo_engine::BuilderError),
    #[error("{0}")]
    EngineValidation(String),
    #[error(transparent)]
    GlobalHash(#[from] global_hash::Error),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::Error),
    #[error(transparent)]
    Summary(#[from] summary::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Walks up from `cwd` looking for the configuration file.
pub fn find_repo_root(cwd: &AbsoluteSystemPath) -> Result<AbsoluteSystemPathBuf, Error> {
    for candidate in cwd.ancestors() {
        if candidate.join_component(CONFIG_FILE).exists() {
            return Ok(candidate.to_owned());
        }
    }
    Err(Error::RepoNotFound)
}

/// Executes `turbo run` and returns the process exit code.
pub async fn run(args: &RunArgs) -> Result<i32, Error> {
    let start = Instant::now();
    let cwd = AbsoluteSystemPathBuf::cwd()?;
    let repo_root = find_repo_root(&cwd)?;
    debug!("repository root is {repo_root}");

    let root_package_json = PackageJson::load(&repo_root.join_component("package.json"))?;
    let package_graph = PackageGraph::builder(repo_root.clone(), root_package_json).build()?;
    let turbo_json_loader = TurboJsonLoader::load(&repo_root, &package_graph)?;
    let opts = Opts::resolve(args, turbo_json_loader.root())?;

    let env_at_execution_start = turborepo_env::EnvironmentVariableMap::infer();

    // Which packages are in scope for this run.
    let filtered = scope::resolve_packages(
        &opts.scope_opts.filter_patterns,
        &package_graph,
        &AllPackagesChanged,
    )?;
    let mut workspaces: Vec<_> = filtered.into_iter().collect();
    workspaces.sort();
    let tasks: Vec<TaskName<'static>> = opts
        .run_opts
        .tasks
        .iter()
        .map(|task| TaskName::from(task.clone()))
        .collect();
    // Root tasks (`//#task`) need the root package in the candidate set.
    let mut engine_workspaces = workspaces.clone();
    if tasks.iter().any(|task| {
        task.package() == Some(turborepo_repository::package_graph::ROOT_PKG_NAME)
    }) {
        engine_workspaces.push(turborepo_repository::package_graph::PackageName::Root);
    }

    let engine = EngineBuilder::new(&package_graph, &turbo_json_loader)
        .with_workspaces(engine_workspaces)
        .with_tasks(tasks)
        .with_tasks_only(opts.run_opts.only)
        .build()?;

    if !opts.run_opts.parallel {
        engine
            .validate(&package_graph, opts.run_opts.concurrency)
            .map_err(|errors| {
                Error::EngineValidation(
                    errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            })?;
    }

    if let Some(graph) = &opts.run_opts.graph {
        let rendered = engine.dot_graph();
        match graph {
            GraphOpts::Stdout => print!("{rendered}"),
            GraphOpts::File(file) => {
                AbsoluteSystemPathBuf::from_unknown(&repo_root, file.as_str())
                    .create_with_contents(rendered)?;
            }
        }
        return Ok(0);
    }

    // Fingerprinting: global inputs first, then per-package files.
    let global_hash_inputs = global_hash::get_global_hash_inputs(
        &repo_root,
        &package_graph,
        turbo_json_loader.root(),
        &env_at_execution_start,
    )?;
    let global_hash = global_hash_inputs.calculate_global_hash();
    debug!("global hash is {global_hash}");

    let tasks_in_graph: Vec<_> = engine
        .task_ids()
        .cloned()
        .map(turborepo_engine::TaskNode::Task)
        .collect();
    let package_inputs_hashes = PackageInputsHashes::calculate_file_hashes(
        &repo_root,
        &package_graph,
        engine.task_definitions(),
        tasks_in_graph.iter(),
        num_cpus::get(),
    )?;

    let task_hasher = TaskHasher::new(
        package_inputs_hashes,
        &env_at_execution_start,
        &global_hash,
        &opts.run_opts.pass_through_args,
    );

    // Remote cache client plus its analytics side-channel, when a token
    // is configured.
    let (client, analytics) = build_api_client(&opts);
    let (analytics_sender, analytics_handle) = match analytics {
        Some((sender, handle)) => (Some(sender), Some(handle)),
        None => (None, None),
    };

    let cache = AsyncCache::new(&opts.cache_opts, &repo_root, client, analytics_sender)?;
    let run_cache = Arc::new(RunCache::new(
        cache,
        &repo_root,
        &opts.run_cache_opts,
        OutputHints::disconnected(),
    ));

    let manager = ProcessManager::new();
    let run_tracker = RunTracker::new();

    let mut visitor = Visitor::new(
        &repo_root,
        &package_graph,
        run_cache.clone(),
        run_tracker.clone(),
        &task_hasher,
        &opts.run_opts,
        manager.clone(),
    );

    if opts.run_opts.dry_run {
        visitor.dry_run();
        visitor.visit(Arc::new(engine)).await?;
        drop(visitor);
        let summary = run_tracker.finish(
            workspaces.iter().map(|w| w.to_string()).collect(),
            &global_hash_inputs,
        );
        if opts.run_opts.dry_run_json {
            println!("{}", summary.to_json()?);
        } else {
            summary.print_text(&mut std::io::stdout())?;
        }
        shutdown_run_cache(run_cache).await;
        return Ok(0);
    }

    // Interrupts stop the manager: running children get SIGINT, a grace
    // period, then SIGKILL; nothing new spawns.
    let signal_handler = SignalHandler::install();
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            signal_handler.interrupted().await;
            manager.stop().await;
        });
    }

    let errors = visitor.visit(Arc::new(engine)).await?;
    drop(visitor);

    let summary = run_tracker.finish(
        workspaces.iter().map(|w| w.to_string()).collect(),
        &global_hash_inputs,
    );
    summary.print_execution_footer(&mut std::io::stdout(), start.elapsed())?;
    if opts.run_opts.summarize {
        summary.save(&repo_root)?;
    }

    if !errors.is_empty() {
        eprintln!("Failed tasks:");
        for error in &errors {
            eprintln!("  {error}");
        }
    }

    shutdown_run_cache(run_cache).await;
    if let Some(handle) = analytics_handle {
        handle.close_with_timeout().await;
    }

    Ok(if errors.is_empty() && summary.execution.exit_code == 0 {
        0
    } else {
        1
    })
}

fn build_api_client(
    opts: &Opts,
) -> (
    Option<(APIClient, APIAuth)>,
    Option<(turborepo_analytics::AnalyticsSender, AnalyticsHandle)>,
) {
    let Some(token) = opts.api_client_opts.token.clone() else {
        return (None, None);
    };
    let client = match APIClient::new(
        &opts.api_client_opts.api_url,
        Some(Duration::from_secs(opts.api_client_opts.timeout_secs)),
        env!("CARGO_PKG_VERSION"),
    ) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("failed to construct remote cache client: {e}");
            return (None, None);
        }
    };
    let auth = APIAuth {
        token,
        team_id: opts.api_client_opts.team_id.clone(),
        team_slug: opts.api_client_opts.team_slug.clone(),
    };
    let (sender, handle) = turborepo_analytics::start_analytics(auth.clone(), client.clone());
    (Some((client, auth)), Some((sender, handle)))
}

async fn shutdown_run_cache(run_cache: Arc<RunCache>) {
    match Arc::try_unwrap(run_cache) {
        Ok(run_cache) => run_cache.shutdown().await,
        Err(_) => debug!("run cache still referenced at shutdown, skipping drain"),
    }
}
