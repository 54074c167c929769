//! Drives the task graph: receives ready tasks from the engine walk,
//! fingerprints them (the walk order guarantees dependency hashes exist),
//! consults the run cache, and executes misses under the process manager.

use std::{
    collections::{BTreeMap, HashSet},
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

use console::StyledObject;
use futures::{StreamExt, stream::FuturesUnordered};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};
use turbopath::AbsoluteSystemPath;
use turborepo_engine::{Engine, ExecutionOptions, Message, StopExecution, TaskNode};
use turborepo_repository::package_graph::{PackageGraph, PackageName};
use turborepo_task_id::TaskId;

use crate::{
    opts::RunOpts,
    process::{ChildExit, Command, ProcessManager},
    run::{
        cache::{RunCache, TaskCache},
        summary::{
            RunTracker, TaskTracker,
            task::{TaskCacheSummary, TaskEnvConfiguration, TaskEnvVarSummary, TaskSummary},
        },
    },
    task_hash::TaskHasher,
    ui::{ColorSelector, PrefixedWriter},
};

/// Time between SIGINT and SIGKILL during shutdown.
const CHILD_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error("could not find definition for task {0}")]
    MissingDefinition(TaskId<'static>),
    #[error("error while executing engine: {0}")]
    Engine(#[from] turborepo_engine::ExecuteError),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    RunCache(#[from] crate::run::cache::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A task-level failure, reported in the aggregated error block and used
/// for the exit code.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("{task_id}: command exited ({exit_code})")]
    Exit { task_id: String, exit_code: i32 },
    #[error("{task_id}: command was terminated before finishing")]
    Killed { task_id: String },
    #[error("{task_id}: could not be spawned: {message}")]
    Spawn { task_id: String, message: String },
    #[error("{task_id}: skipped because an upstream task failed")]
    UpstreamFailed { task_id: String },
}

pub struct Visitor<'a> {
    repo_root: &'a AbsoluteSystemPath,
    package_graph: &'a PackageGraph,
    run_cache: Arc<RunCache>,
    run_tracker: RunTracker,
    task_hasher: &'a TaskHasher<'a>,
    run_opts: &'a RunOpts,
    manager: ProcessManager,
    color_selector: ColorSelector,
    dry: bool,
}

impl<'a> Visitor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_root: &'a AbsoluteSystemPath,
        package_graph: &'a PackageGraph,
        run_cache: Arc<RunCache>,
        run_tracker: RunTracker,
        task_hasher: &'a TaskHasher<'a>,
        run_opts: &'a RunOpts,
        manager: ProcessManager,
    ) -> Self {
        Self {
            repo_root,
            package_graph,
            run_cache,
            run_tracker,
            task_hasher,
            run_opts,
            manager,
            color_selector: ColorSelector::default(),
            dry: false,
        }
    }

    /// Switches to record-only mode: everything is hashed and summarized,
    /// nothing is launched or restored.
    pub fn dry_run(&mut self) {
        self.dry = true;
    }

    pub async fn visit(&self, engine: Arc<Engine>) -> Result<Vec<TaskError>, Error> {
        let concurrency = self.run_opts.concurrency as usize;
        let (node_sender, mut node_stream) = mpsc::channel(concurrency.max(1));

        let engine_handle = {
            let engine = engine.clone();
            let options = ExecutionOptions::new(self.run_opts.parallel, concurrency);
            tokio::spawn(engine.execute(options, node_sender))
        };

        let errors: Arc<Mutex<Vec<TaskError>>> = Arc::new(Mutex::new(Vec::new()));
        let failed_tasks: Arc<Mutex<HashSet<TaskId<'static>>>> =
            Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = FuturesUnordered::new();
        let mut visited: HashSet<TaskId<'static>> = HashSet::new();

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            let task_id = info;
            visited.insert(task_id.clone());

            let package_name = PackageName::from(task_id.package());
            let workspace_info =
                self.package_graph
                    .package_info(&package_name)
                    .ok_or_else(|| Error::MissingPackage {
                        package_name: package_name.clone(),
                        task_id: task_id.clone(),
                    })?;
            let task_definition = engine
                .task_definition(&task_id)
                .ok_or_else(|| Error::MissingDefinition(task_id.clone()))?;
            // `--parallel` ignores edges, so dependency hashes are not
            // required to exist and do not enter the fingerprint.
            let dependency_set = if self.run_opts.parallel {
                HashSet::new()
            } else {
                engine
                    .dependencies(&task_id)
                    .ok_or_else(|| Error::MissingDefinition(task_id.clone()))?
            };

            let task_hash = self.task_hasher.calculate_task_hash(
                &task_id,
                task_definition,
                workspace_info,
                &dependency_set,
            )?;
            debug!("task {task_id} hash is {task_hash}");

            let task_cache = self.run_cache.task_cache(
                task_definition,
                &workspace_info.package_dir,
                &task_id,
                &task_hash,
            );

            let command = workspace_info
                .package_json
                .scripts
                .get(task_id.task())
                .cloned();

            let mut summary = self.base_task_summary(&engine, &task_id, &task_hash, &task_cache);
            summary.command = command.clone().unwrap_or_default();

            if self.dry {
                let exists = task_cache.exists().await.unwrap_or(None);
                summary.cache = exists
                    .map(TaskCacheSummary::from)
                    .unwrap_or_else(TaskCacheSummary::cache_miss);
                self.run_tracker.track_task(summary);
                callback.send(Ok(())).ok();
                continue;
            }

            // A declared task with no script in the package is dropped
            // after hashing so dependents can still see its hash.
            let Some(command) = command else {
                callback.send(Ok(())).ok();
                continue;
            };

            let exec = ExecContext {
                task_id: task_id.clone(),
                task_hash: task_hash.clone(),
                command,
                cwd: self.repo_root.resolve(&workspace_info.package_dir).into_string(),
                execution_env: self.task_hasher.execution_env(&task_hash),
                pass_through_args: self.run_opts.pass_through_args.clone(),
                continue_on_error: self.run_opts.continue_on_error,
                manager: self.manager.clone(),
                task_cache,
                prefix: self.prefix(&task_id),
                run_tracker: self.run_tracker.clone(),
                hash_tracker: self.task_hasher.task_hash_tracker(),
                errors: errors.clone(),
                failed_tasks: failed_tasks.clone(),
                dependency_ids: dependency_set
                    .iter()
                    .filter_map(|node| match node {
                        TaskNode::Task(id) => Some(id.clone()),
                        TaskNode::Root => None,
                    })
                    .collect(),
                summary,
            };
            tasks.push(tokio::spawn(exec.execute(callback)));
        }

        engine_handle.await.expect("engine execution panicked")?;
        while let Some(result) = tasks.next().await {
            result.expect("task executor panicked");
        }

        // With fail-fast the walk was cancelled before dependents of the
        // failure ever became ready; they still deserve a verdict.
        let failed = failed_tasks
            .lock()
            .expect("failed set mutex poisoned")
            .clone();
        if !failed.is_empty() {
            for task_id in engine.task_ids() {
                if visited.contains(task_id) || !depends_on_failed(&engine, task_id, &failed) {
                    continue;
                }
                errors
                    .lock()
                    .expect("errors mutex poisoned")
                    .push(TaskError::UpstreamFailed {
                        task_id: task_id.to_string(),
                    });
                let mut summary = self.skipped_task_summary(&engine, task_id);
                summary.execution = Some(TaskTracker::start().upstream_failed());
                self.run_tracker.track_task(summary);
            }
        }

        let errors = Arc::try_unwrap(errors)
            .expect("only the visitor holds the error list now")
            .into_inner()
            .expect("errors mutex poisoned");
        Ok(errors)
    }

    /// Summary for a task that was never offered by the walk. No hash or
    /// cache state exists for it.
    fn skipped_task_summary(&self, engine: &Engine, task_id: &TaskId<'static>) -> TaskSummary {
        let workspace_info = self
            .package_graph
            .package_info(&PackageName::from(task_id.package()));
        let definition = engine.task_definition(task_id).cloned().unwrap_or_default();
        let collect_ids = |nodes: Option<HashSet<&TaskNode>>| -> Vec<TaskId<'static>> {
            let mut ids: Vec<_> = nodes
                .unwrap_or_default()
                .into_iter()
                .filter_map(|node| match node {
                    TaskNode::Task(id) => Some(id.clone()),
                    TaskNode::Root => None,
                })
                .collect();
            ids.sort();
            ids
        };
        TaskSummary {
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            dir: workspace_info
                .map(|info| info.package_dir.to_string())
                .unwrap_or_default(),
            hash: self
                .task_hasher
                .task_hash_tracker()
                .hash(task_id)
                .unwrap_or_default(),
            inputs: BTreeMap::new(),
            hash_of_external_dependencies: workspace_info
                .map(|info| info.external_deps_hash.clone())
                .unwrap_or_default(),
            cache: TaskCacheSummary::cache_miss(),
            command: workspace_info
                .and_then(|info| info.package_json.scripts.get(task_id.task()).cloned())
                .unwrap_or_default(),
            cli_arguments: self.run_opts.pass_through_args.clone(),
            outputs: definition.outputs.inclusions.clone(),
            excluded_outputs: definition.outputs.exclusions.clone(),
            log_file: String::new(),
            expanded_outputs: Vec::new(),
            dependencies: collect_ids(engine.dependencies(task_id)),
            dependents: collect_ids(engine.dependents(task_id)),
            resolved_task_definition: definition.clone(),
            environment_variables: TaskEnvVarSummary {
                specified: TaskEnvConfiguration {
                    env: definition.env.clone(),
                    pass_through_env: definition.pass_through_env.clone().unwrap_or_default(),
                },
                configured: Vec::new(),
                pass_through: Vec::new(),
            },
            execution: None,
            task_id: task_id.clone(),
        }
    }

    fn prefix(&self, task_id: &TaskId) -> StyledObject<String> {
        self.color_selector
            .prefix_with_color(&task_id.to_string(), &task_id.to_string())
    }

    fn base_task_summary(
        &self,
        engine: &Engine,
        task_id: &TaskId<'static>,
        task_hash: &str,
        task_cache: &TaskCache,
    ) -> TaskSummary {
        let tracker = self.task_hasher.task_hash_tracker();
        let workspace_info = self
            .package_graph
            .package_info(&PackageName::from(task_id.package()))
            .expect("caller verified the package exists");
        let definition = engine
            .task_definition(task_id)
            .expect("caller verified the definition exists");

        let collect_ids = |nodes: Option<HashSet<&TaskNode>>| -> Vec<TaskId<'static>> {
            let mut ids: Vec<_> = nodes
                .unwrap_or_default()
                .into_iter()
                .filter_map(|node| match node {
                    TaskNode::Task(id) => Some(id.clone()),
                    TaskNode::Root => None,
                })
                .collect();
            ids.sort();
            ids
        };

        let inputs: BTreeMap<String, String> = tracker
            .inputs(task_id)
            .map(|files| {
                files
                    .into_iter()
                    .map(|(path, hash)| (path.into_string(), hash))
                    .collect()
            })
            .unwrap_or_default();

        let log_file = self
            .repo_root
            .anchor(task_cache.log_file_path())
            .map(|p| p.to_string())
            .unwrap_or_default();

        TaskSummary {
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            dir: workspace_info.package_dir.to_string(),
            hash: task_hash.to_string(),
            inputs,
            hash_of_external_dependencies: workspace_info.external_deps_hash.clone(),
            cache: TaskCacheSummary::cache_miss(),
            command: String::new(),
            cli_arguments: self.run_opts.pass_through_args.clone(),
            outputs: definition.outputs.inclusions.clone(),
            excluded_outputs: definition.outputs.exclusions.clone(),
            log_file,
            expanded_outputs: Vec::new(),
            dependencies: collect_ids(engine.dependencies(task_id)),
            dependents: collect_ids(engine.dependents(task_id)),
            resolved_task_definition: definition.clone(),
            environment_variables: TaskEnvVarSummary {
                specified: TaskEnvConfiguration {
                    env: definition.env.clone(),
                    pass_through_env: definition.pass_through_env.clone().unwrap_or_default(),
                },
                configured: tracker
                    .env_vars(task_id)
                    .map(|detailed| detailed.all.to_hashable())
                    .unwrap_or_default(),
                pass_through: Vec::new(),
            },
            execution: None,
            task_id: task_id.clone(),
        }
    }
}

/// Whether `task_id` transitively depends on any task in `failed`.
fn depends_on_failed(
    engine: &Engine,
    task_id: &TaskId<'static>,
    failed: &HashSet<TaskId<'static>>,
) -> bool {
    let mut stack = vec![task_id.clone()];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for dep in engine.dependencies(&id).unwrap_or_default() {
            if let TaskNode::Task(dep_id) = dep {
                if failed.contains(dep_id) {
                    return true;
                }
                stack.push(dep_id.clone());
            }
        }
    }
    false
}

struct ExecContext {
    task_id: TaskId<'static>,
    task_hash: String,
    command: String,
    cwd: String,
    execution_env: turborepo_env::EnvironmentVariableMap,
    pass_through_args: Vec<String>,
    continue_on_error: bool,
    manager: ProcessManager,
    task_cache: TaskCache,
    prefix: StyledObject<String>,
    run_tracker: RunTracker,
    hash_tracker: crate::task_hash::TaskHashTracker,
    errors: Arc<Mutex<Vec<TaskError>>>,
    failed_tasks: Arc<Mutex<HashSet<TaskId<'static>>>>,
    dependency_ids: Vec<TaskId<'static>>,
    summary: TaskSummary,
}

impl ExecContext {
    async fn execute(mut self, callback: tokio::sync::oneshot::Sender<Result<(), StopExecution>>) {
        let tracker = TaskTracker::start();
        let mut stdout = PrefixedWriter::new(self.prefix.clone(), std::io::stdout());

        // A failed dependency means this task never starts; unrelated
        // branches keep going, which is the whole point of `--continue`.
        let upstream_failed = {
            let failed = self.failed_tasks.lock().expect("failed set mutex poisoned");
            self.dependency_ids.iter().any(|dep| failed.contains(dep))
        };
        if upstream_failed {
            self.record_failure_markers();
            self.errors
                .lock()
                .expect("errors mutex poisoned")
                .push(TaskError::UpstreamFailed {
                    task_id: self.task_id.to_string(),
                });
            self.summary.execution = Some(tracker.upstream_failed());
            self.run_tracker.track_task(self.summary);
            callback.send(Ok(())).ok();
            return;
        }

        match self.task_cache.restore_outputs(&mut stdout).await {
            Ok(Some(status)) => {
                self.hash_tracker
                    .insert_cache_status(self.task_id.clone(), status);
                self.hash_tracker.insert_expanded_outputs(
                    self.task_id.clone(),
                    self.task_cache.expanded_outputs(),
                );
                self.summary.cache = TaskCacheSummary::from(status);
                self.summary.expanded_outputs = self.task_cache.expanded_outputs();
                self.summary.execution = Some(tracker.cached());
                self.run_tracker.track_task(self.summary);
                callback.send(Ok(())).ok();
                return;
            }
            Ok(None) => (),
            Err(e) => {
                error!("error fetching from cache: {e}");
            }
        }

        let mut script = self.command.clone();
        if !self.pass_through_args.is_empty() {
            script.push(' ');
            script.push_str(&self.pass_through_args.join(" "));
        }
        let command = Command {
            script,
            cwd: self.cwd.clone(),
            env: self.execution_env.clone(),
        };

        let Some(spawn_result) = self.manager.spawn(&command, CHILD_STOP_TIMEOUT) else {
            // Manager is shutting down; this task was cancelled before it
            // began.
            self.summary.execution = Some(tracker.canceled());
            self.run_tracker.track_task(self.summary);
            callback.send(Err(StopExecution)).ok();
            return;
        };
        let child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.record_failure_markers();
                self.errors
                    .lock()
                    .expect("errors mutex poisoned")
                    .push(TaskError::Spawn {
                        task_id: self.task_id.to_string(),
                        message: e.to_string(),
                    });
                self.summary.execution = Some(tracker.build_failed(None));
                self.run_tracker.track_task(self.summary);
                callback
                    .send(if self.continue_on_error {
                        Ok(())
                    } else {
                        Err(StopExecution)
                    })
                    .ok();
                return;
            }
        };

        let exit = {
            let mut log_writer = match self.task_cache.output_writer(PrefixedWriter::new(
                self.prefix.clone(),
                std::io::stdout(),
            )) {
                Ok(writer) => writer,
                Err(e) => {
                    error!("failed to create log file for {}: {e}", self.task_id);
                    self.summary.execution = Some(tracker.build_failed(None));
                    self.run_tracker.track_task(self.summary);
                    callback.send(Err(StopExecution)).ok();
                    return;
                }
            };
            let exit = child.wait_with_piped_outputs(&mut log_writer).await;
            let _ = log_writer.flush();
            exit
        };

        match exit {
            Ok(Some(ChildExit::Finished(Some(0)))) => {
                let execution = tracker.built(0);
                let duration_ms = execution.duration_ms();
                if let Err(e) = self.task_cache.save_outputs(duration_ms).await {
                    error!("error caching output: {e}");
                } else {
                    self.hash_tracker.insert_expanded_outputs(
                        self.task_id.clone(),
                        self.task_cache.expanded_outputs(),
                    );
                }
                self.summary.expanded_outputs = self.task_cache.expanded_outputs();
                self.summary.execution = Some(execution);
                self.run_tracker.track_task(self.summary);
                callback.send(Ok(())).ok();
            }
            Ok(Some(ChildExit::Finished(exit_code))) => {
                let code = exit_code.unwrap_or(1);
                self.record_failure_markers();
                let mut stdout =
                    PrefixedWriter::new(self.prefix.clone(), std::io::stdout());
                if let Err(e) = self.task_cache.on_error(&mut stdout) {
                    error!("failed to replay error logs: {e}");
                }
                self.errors
                    .lock()
                    .expect("errors mutex poisoned")
                    .push(TaskError::Exit {
                        task_id: self.task_id.to_string(),
                        exit_code: code,
                    });
                self.summary.execution = Some(tracker.build_failed(Some(code)));
                self.run_tracker.track_task(self.summary);
                callback
                    .send(if self.continue_on_error {
                        Ok(())
                    } else {
                        Err(StopExecution)
                    })
                    .ok();
            }
            Ok(Some(ChildExit::Killed)) | Ok(None) => {
                // Cancelled tasks are not failures and write no cache.
                self.summary.execution = Some(tracker.canceled());
                self.run_tracker.track_task(self.summary);
                callback.send(Err(StopExecution)).ok();
            }
            Ok(Some(ChildExit::Failed)) | Err(_) => {
                self.record_failure_markers();
                self.errors
                    .lock()
                    .expect("errors mutex poisoned")
                    .push(TaskError::Killed {
                        task_id: self.task_id.to_string(),
                    });
                self.summary.execution = Some(tracker.build_failed(None));
                self.run_tracker.track_task(self.summary);
                callback.send(Err(StopExecution)).ok();
            }
        }
    }

    fn record_failure_markers(&self) {
        self.failed_tasks
            .lock()
            .expect("failed set mutex poisoned")
            .insert(self.task_id.clone());
    }
}

#[cfg(all(test, unix))]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;
    use tempfile::tempdir;
    use turbopath::AbsoluteSystemPathBuf;
    use turborepo_cache::{AsyncCache, CacheOpts};
    use turborepo_engine::EngineBuilder;
    use turborepo_env::EnvironmentVariableMap;
    use turborepo_repository::{
        package_graph::PackageName, package_json::PackageJson,
    };
    use turborepo_task_id::TaskName;

    use super::*;
    use crate::{
        daemon::OutputHints,
        opts::RunCacheOpts,
        run::{global_hash::GlobalHashableInputs, summary::RunSummary},
        task_hash::PackageInputsHashes,
        turbo_json::TurboJsonLoader,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        repo_root: AbsoluteSystemPathBuf,
        package_graph: PackageGraph,
        loader: TurboJsonLoader,
    }

    /// app depends on lib; both define `build`. The app build fails unless
    /// lib's output already exists, so ordering violations show up as
    /// task failures rather than flaky timing assertions.
    fn write_fixture() -> Result<Fixture> {
        let dir = tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(dir.path())?.to_owned();

        repo_root
            .join_component("package.json")
            .create_with_contents(r#"{"name": "fixture", "workspaces": ["packages/*"]}"#)?;
        repo_root.join_component("turbo.json").create_with_contents(
            r#"{"pipeline": {"build": {"dependsOn": ["^build"], "outputs": ["dist/**"]}}}"#,
        )?;
        // Build outputs and captured logs must not feed back into the
        // input hashes or the second run could never hit.
        repo_root
            .join_component(".gitignore")
            .create_with_contents("dist/\n.turbo/\n")?;

        let lib = repo_root.join_components(&["packages", "lib"]);
        lib.create_dir_all()?;
        lib.join_component("package.json").create_with_contents(
            r#"{"name": "lib", "scripts": {"build": "mkdir -p dist && echo lib > dist/out.txt"}}"#,
        )?;
        lib.join_component("index.js")
            .create_with_contents("module.exports = 1;")?;

        let app = repo_root.join_components(&["packages", "app"]);
        app.create_dir_all()?;
        app.join_component("package.json").create_with_contents(
            r#"{"name": "app", "scripts": {"build": "test -f ../lib/dist/out.txt && mkdir -p dist && echo app > dist/out.txt"}, "dependencies": {"lib": "workspace:*"}}"#,
        )?;
        app.join_component("index.js")
            .create_with_contents("module.exports = 2;")?;

        let root_json = PackageJson::load(&repo_root.join_component("package.json"))?;
        let package_graph =
            PackageGraph::builder(repo_root.clone(), root_json).build()?;
        let loader = TurboJsonLoader::load(&repo_root, &package_graph)?;

        Ok(Fixture {
            _dir: dir,
            repo_root,
            package_graph,
            loader,
        })
    }

    fn global_inputs() -> GlobalHashableInputs {
        GlobalHashableInputs {
            global_cache_key: crate::hash::GLOBAL_CACHE_KEY,
            global_file_hash_map: Default::default(),
            root_external_deps_hash: String::new(),
            env: vec![],
            resolved_env_vars: turborepo_env::DetailedMap {
                all: Default::default(),
                by_source: turborepo_env::BySource {
                    explicit: Default::default(),
                    matching: Default::default(),
                },
            },
            pass_through_env: vec![],
            pipeline_text: String::new(),
        }
    }

    /// Runs `build` across the fixture, returning the run summary and any
    /// task errors.
    async fn run_build_mode(
        fixture: &Fixture,
        dry: bool,
    ) -> Result<(RunSummary, Vec<TaskError>)> {
        let engine = EngineBuilder::new(&fixture.package_graph, &fixture.loader)
            .with_workspaces(vec![PackageName::from("app"), PackageName::from("lib")])
            .with_tasks(vec![TaskName::from("build")])
            .build()?;

        let env = EnvironmentVariableMap::infer();
        let tasks_in_graph: Vec<_> = engine
            .task_ids()
            .cloned()
            .map(TaskNode::Task)
            .collect();
        let package_inputs = PackageInputsHashes::calculate_file_hashes(
            &fixture.repo_root,
            &fixture.package_graph,
            engine.task_definitions(),
            tasks_in_graph.iter(),
            2,
        )?;
        let task_hasher = TaskHasher::new(package_inputs, &env, "test-global-hash", &[]);

        let cache_opts = CacheOpts {
            cache_dir: Utf8PathBuf::from(".turbo/cache"),
            workers: 2,
            ..CacheOpts::default()
        };
        let cache = AsyncCache::new(&cache_opts, &fixture.repo_root, None, None)?;
        let run_cache = Arc::new(RunCache::new(
            cache,
            &fixture.repo_root,
            &RunCacheOpts::default(),
            OutputHints::disconnected(),
        ));

        let run_opts = crate::opts::RunOpts {
            tasks: vec!["build".to_string()],
            concurrency: 4,
            parallel: false,
            continue_on_error: false,
            pass_through_args: vec![],
            only: false,
            dry_run: false,
            dry_run_json: false,
            graph: None,
            log_prefix: true,
            summarize: false,
        };
        let run_tracker = RunTracker::new();
        let mut visitor = Visitor::new(
            &fixture.repo_root,
            &fixture.package_graph,
            run_cache.clone(),
            run_tracker.clone(),
            &task_hasher,
            &run_opts,
            ProcessManager::new(),
        );
        if dry {
            visitor.dry_run();
        }

        let errors = visitor.visit(Arc::new(engine)).await?;
        drop(visitor);
        match Arc::try_unwrap(run_cache) {
            Ok(run_cache) => run_cache.shutdown().await,
            Err(_) => panic!("run cache still referenced after visit"),
        }
        Ok((
            run_tracker.finish(vec!["app".to_string(), "lib".to_string()], &global_inputs()),
            errors,
        ))
    }

    async fn run_build(fixture: &Fixture) -> Result<(RunSummary, Vec<TaskError>)> {
        run_build_mode(fixture, false).await
    }

    #[tokio::test]
    async fn test_topological_order_and_warm_cache() -> Result<()> {
        let fixture = write_fixture()?;

        // Cold run: lib#build must land before app#build or app's command
        // fails its `test -f` check.
        let (summary, errors) = run_build(&fixture).await?;
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(summary.execution.attempted, 2);
        assert_eq!(summary.execution.cached, 0);
        assert!(!summary.execution.is_full_turbo());

        // Warm run: identical inputs, both tasks replay from cache.
        let (summary, errors) = run_build(&fixture).await?;
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(summary.execution.attempted, 2);
        assert_eq!(summary.execution.cached, 2);
        assert!(summary.execution.is_full_turbo());
        Ok(())
    }

    #[tokio::test]
    async fn test_input_change_busts_only_affected_package() -> Result<()> {
        let fixture = write_fixture()?;

        let (first, _) = run_build(&fixture).await?;
        assert_eq!(first.execution.cached, 0);

        // Touch an app source file: app misses, lib still hits.
        fixture
            .repo_root
            .join_components(&["packages", "app", "index.js"])
            .create_with_contents("module.exports = 3;")?;
        let (second, errors) = run_build(&fixture).await?;
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(second.execution.attempted, 2);
        assert_eq!(second.execution.cached, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_upstream_failure_skips_dependents() -> Result<()> {
        let mut fixture = write_fixture()?;
        // Break lib's build, then reload the workspace so the new script
        // is what actually runs.
        fixture
            .repo_root
            .join_components(&["packages", "lib", "package.json"])
            .create_with_contents(
                r#"{"name": "lib", "scripts": {"build": "exit 7"}}"#,
            )?;
        let root_json = PackageJson::load(&fixture.repo_root.join_component("package.json"))?;
        fixture.package_graph =
            PackageGraph::builder(fixture.repo_root.clone(), root_json).build()?;
        fixture.loader = TurboJsonLoader::load(&fixture.repo_root, &fixture.package_graph)?;

        let (summary, errors) = run_build(&fixture).await?;
        assert_eq!(summary.execution.failed, 2);
        assert_eq!(summary.execution.exit_code, 1);
        assert!(errors.iter().any(|e| matches!(
            e,
            TaskError::Exit { task_id, exit_code: 7 } if task_id == "lib#build"
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            TaskError::UpstreamFailed { task_id } if task_id == "app#build"
        )));
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_executing() -> Result<()> {
        let fixture = write_fixture()?;

        let (summary, errors) = run_build_mode(&fixture, true).await?;
        assert!(errors.is_empty(), "{errors:?}");

        // Nothing launched: no outputs appeared on disk.
        assert!(!fixture
            .repo_root
            .join_components(&["packages", "lib", "dist"])
            .exists());

        // Both tasks planned, in task-id order, with the graph edges
        // recorded both ways.
        let ids: Vec<String> = summary.tasks.iter().map(|t| t.task_id.to_string()).collect();
        assert_eq!(ids, vec!["app#build", "lib#build"]);
        let app = &summary.tasks[0];
        let lib = &summary.tasks[1];
        assert_eq!(app.dependencies, vec![lib.task_id.clone()]);
        assert_eq!(lib.dependents, vec![app.task_id.clone()]);
        assert_eq!(app.hash.len(), 16);

        // Identical inputs plan to identical hashes.
        let (again, _) = run_build_mode(&fixture, true).await?;
        assert_eq!(
            summary.tasks.iter().map(|t| t.hash.clone()).collect::<Vec<_>>(),
            again.tasks.iter().map(|t| t.hash.clone()).collect::<Vec<_>>(),
        );
        Ok(())
    }
}
