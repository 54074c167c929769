//! Task fingerprinting.
//!
//! Phase one hashes package inputs: task nodes are grouped by
//! `(package, inputs globs)` and each group's files are discovered and
//! hashed across a worker pool. Phase two runs during the graph walk:
//! each task's composite hash folds in its dependency hashes, which are
//! guaranteed present because the walk is topological.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_cache::CacheHitMetadata;
use turborepo_engine::{TaskDefinition, TaskNode};
use turborepo_env::{BySource, DetailedMap, EnvironmentVariableMap};
use turborepo_hash::{FileHashes, TurboHash};
use turborepo_repository::package_graph::{PackageGraph, PackageInfo, PackageName};
use turborepo_task_id::TaskId;

use crate::hash::{PackageFileHashes, TaskHashable};

/// Sentinel in `inputs` that expands to the default "all tracked files"
/// set, letting a task add inputs without losing the defaults.
pub const TURBO_DEFAULT: &str = "$TURBO_DEFAULT$";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Hash(#[from] turborepo_hash::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error("missing package info for {0}")]
    MissingPackage(String),
    #[error("cannot find package-file hash for {0}")]
    MissingPackageFileHash(String),
    #[error("missing hash for dependent task {0}")]
    MissingDependencyTaskHash(String),
    #[error("could not build hashing thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("file walk failed: {0}")]
    Ignore(#[from] ignore::Error),
}

/// Phase-one output: per-task file hashes, keyed by task so phase two is
/// a lookup.
#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    hashes: HashMap<TaskId<'static>, String>,
    expanded_hashes: HashMap<TaskId<'static>, FileHashes>,
}

impl PackageInputsHashes {
    /// Groups `tasks` by `(package, inputs)`, discovers and hashes each
    /// group's files on a pool of `workers` threads.
    pub fn calculate_file_hashes<'a>(
        repo_root: &AbsoluteSystemPath,
        package_graph: &PackageGraph,
        task_definitions: &HashMap<TaskId<'static>, TaskDefinition>,
        tasks: impl Iterator<Item = &'a TaskNode>,
        workers: usize,
    ) -> Result<PackageInputsHashes, Error> {
        // Tasks with identical inputs in the same package share one
        // filesystem walk.
        let mut groups: HashMap<(&str, &[String]), Vec<&TaskId<'static>>> = HashMap::new();
        for node in tasks {
            let TaskNode::Task(task_id) = node else {
                continue;
            };
            let Some(definition) = task_definitions.get(task_id) else {
                continue;
            };
            groups
                .entry((task_id.package(), definition.inputs.as_slice()))
                .or_default()
                .push(task_id);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()?;

        let results: Vec<Result<(Vec<&TaskId<'static>>, String, FileHashes), Error>> =
            pool.install(|| {
                groups
                    .into_par_iter()
                    .map(|((package, inputs), task_ids)| {
                        let package_info = package_graph
                            .package_info(&PackageName::from(package))
                            .ok_or_else(|| Error::MissingPackage(package.to_string()))?;
                        let file_hashes =
                            hash_package_inputs(repo_root, package_info, inputs)?;
                        let group_hash = PackageFileHashes(&file_hashes).hash();
                        Ok((task_ids, group_hash, file_hashes))
                    })
                    .collect()
            });

        let mut hashes = HashMap::new();
        let mut expanded_hashes = HashMap::new();
        for result in results {
            let (task_ids, group_hash, file_hashes) = result?;
            for task_id in task_ids {
                hashes.insert(task_id.clone(), group_hash.clone());
                expanded_hashes.insert(task_id.clone(), file_hashes.clone());
            }
        }

        Ok(PackageInputsHashes {
            hashes,
            expanded_hashes,
        })
    }

    pub fn hash_for_task<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a str> {
        self.hashes.get(task_id).map(String::as_str)
    }
}

/// Discovers the files feeding a task's hash. With no explicit inputs,
/// every tracked file in the package counts, honoring gitignore, with
/// `node_modules` and `.git` always excluded. Explicit inputs are globs
/// anchored at the package directory, ignoring gitignore; the
/// `$TURBO_DEFAULT$` sentinel splices the default set back in.
fn hash_package_inputs(
    repo_root: &AbsoluteSystemPath,
    package_info: &PackageInfo,
    inputs: &[String],
) -> Result<FileHashes, Error> {
    let package_dir = repo_root.resolve(&package_info.package_dir);

    let use_default_set = inputs.is_empty() || inputs.iter().any(|glob| glob == TURBO_DEFAULT);
    let globs: Vec<&String> = inputs.iter().filter(|glob| *glob != TURBO_DEFAULT).collect();

    let mut walker = ignore::WalkBuilder::new(package_dir.as_std_path());
    walker
        .hidden(false)
        .require_git(false)
        .git_global(false)
        // Explicit inputs mean exactly those globs, gitignored or not.
        .git_ignore(use_default_set)
        .filter_entry(|entry| {
            entry.file_name() != "node_modules" && entry.file_name() != ".git"
        });

    let mut files = Vec::new();
    for entry in walker.build() {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.map_or(true, |t| t.is_dir()) {
            continue;
        }
        let full_path = AbsoluteSystemPath::from_std_path(entry.path())?;
        let relative = package_dir.anchor(full_path)?;
        let unix = relative.to_unix()?;

        let matches = if globs.is_empty() {
            use_default_set
        } else {
            use_default_set
                || globs
                    .iter()
                    .any(|glob| glob_match::glob_match(glob, unix.as_str()))
                // The manifest always participates, whatever the inputs
                // say.
                || unix.as_str() == "package.json"
                || unix.as_str() == "turbo.json"
        };
        if matches {
            files.push(relative);
        }
    }

    Ok(turborepo_hash::hash_files(&package_dir, files)?)
}

#[derive(Debug, Default)]
pub struct TaskHashTrackerState {
    package_task_hashes: HashMap<TaskId<'static>, String>,
    package_task_outputs: HashMap<TaskId<'static>, Vec<AnchoredSystemPathBuf>>,
    package_task_cache: HashMap<TaskId<'static>, CacheHitMetadata>,
    package_task_inputs: HashMap<TaskId<'static>, FileHashes>,
    package_task_env_vars: HashMap<TaskId<'static>, DetailedMap>,
}

/// Cross-thread record of everything hashed and observed during a run.
/// The summary reads it back at the end.
#[derive(Debug, Default, Clone)]
pub struct TaskHashTracker {
    state: Arc<RwLock<TaskHashTrackerState>>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        let state = self.state.read().expect("hash tracker lock poisoned");
        state.package_task_hashes.get(task_id).cloned()
    }

    pub fn insert_hash(&self, task_id: TaskId<'static>, hash: String) {
        let mut state = self.state.write().expect("hash tracker lock poisoned");
        state.package_task_hashes.insert(task_id, hash);
    }

    pub fn expanded_outputs(&self, task_id: &TaskId) -> Option<Vec<AnchoredSystemPathBuf>> {
        let state = self.state.read().expect("hash tracker lock poisoned");
        state.package_task_outputs.get(task_id).cloned()
    }

    pub fn insert_expanded_outputs(
        &self,
        task_id: TaskId<'static>,
        outputs: Vec<AnchoredSystemPathBuf>,
    ) {
        let mut state = self.state.write().expect("hash tracker lock poisoned");
        state.package_task_outputs.insert(task_id, outputs);
    }

    pub fn cache_status(&self, task_id: &TaskId) -> Option<CacheHitMetadata> {
        let state = self.state.read().expect("hash tracker lock poisoned");
        state.package_task_cache.get(task_id).copied()
    }

    pub fn insert_cache_status(&self, task_id: TaskId<'static>, status: CacheHitMetadata) {
        let mut state = self.state.write().expect("hash tracker lock poisoned");
        state.package_task_cache.insert(task_id, status);
    }

    pub fn inputs(&self, task_id: &TaskId) -> Option<FileHashes> {
        let state = self.state.read().expect("hash tracker lock poisoned");
        state.package_task_inputs.get(task_id).cloned()
    }

    pub fn env_vars(&self, task_id: &TaskId) -> Option<DetailedMap> {
        let state = self.state.read().expect("hash tracker lock poisoned");
        let detailed = state.package_task_env_vars.get(task_id)?;
        // DetailedMap is not Clone because of its nested maps; rebuild.
        Some(DetailedMap {
            all: detailed.all.clone(),
            by_source: BySource {
                explicit: detailed.by_source.explicit.clone(),
                matching: detailed.by_source.matching.clone(),
            },
        })
    }
}

/// Phase two: composes the final task hash out of phase-one file hashes,
/// global state, and dependency hashes.
pub struct TaskHasher<'a> {
    package_inputs_hashes: PackageInputsHashes,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    pass_through_args: &'a [String],
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        package_inputs_hashes: PackageInputsHashes,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
        pass_through_args: &'a [String],
    ) -> Self {
        Self {
            package_inputs_hashes,
            env_at_execution_start,
            global_hash,
            pass_through_args,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    /// Must be called in topological order: dependency hashes are read
    /// from the tracker and were written when the dependency completed
    /// hashing.
    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        workspace_info: &PackageInfo,
        dependency_set: &HashSet<&TaskNode>,
    ) -> Result<String, Error> {
        let hash_of_files = self
            .package_inputs_hashes
            .hash_for_task(task_id)
            .ok_or_else(|| Error::MissingPackageFileHash(task_id.to_string()))?;

        let explicit_env = self
            .env_at_execution_start
            .from_wildcards(&task_definition.env)?;

        let mut task_dependency_hashes = Vec::new();
        for dependency in dependency_set {
            let TaskNode::Task(dependency_id) = dependency else {
                continue;
            };
            let hash = self
                .task_hash_tracker
                .hash(dependency_id)
                .ok_or_else(|| Error::MissingDependencyTaskHash(dependency_id.to_string()))?;
            task_dependency_hashes.push(hash);
        }
        task_dependency_hashes.sort_unstable();

        let mut env = task_definition.env.clone();
        env.sort_unstable();
        let pass_through_env = task_definition
            .pass_through_env
            .clone()
            .map(|mut vars| {
                vars.sort_unstable();
                vars
            })
            .unwrap_or_default();

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            task_dependency_hashes,
            package_dir: workspace_info
                .package_dir
                .to_unix()?
                .into_string(),
            hash_of_files,
            external_deps_hash: &workspace_info.external_deps_hash,
            task: task_id.task(),
            outputs: task_definition.outputs.hashable(),
            pass_through_args: self.pass_through_args,
            env,
            resolved_env_vars: explicit_env.to_hashable(),
            pass_through_env,
        };
        let hash = task_hashable.hash();
        debug!("task hash for {task_id} is {hash}");

        {
            let mut state = self
                .task_hash_tracker
                .state
                .write()
                .expect("hash tracker lock poisoned");
            state
                .package_task_hashes
                .insert(task_id.clone(), hash.clone());
            if let Some(expanded) = self.package_inputs_hashes.expanded_hashes.get(task_id) {
                state
                    .package_task_inputs
                    .insert(task_id.clone(), expanded.clone());
            }
            state.package_task_env_vars.insert(
                task_id.clone(),
                DetailedMap {
                    all: explicit_env.clone(),
                    by_source: BySource {
                        explicit: explicit_env,
                        matching: EnvironmentVariableMap::default(),
                    },
                },
            );
        }

        Ok(hash)
    }

    /// The environment the child process runs with: the caller's full
    /// environment, since the engine does not sandbox, plus the task hash
    /// so tooling can observe it.
    pub fn execution_env(&self, task_hash: &str) -> EnvironmentVariableMap {
        let mut env = self.env_at_execution_start.clone();
        env.insert("TURBO_HASH".to_string(), task_hash.to_string());
        env
    }
}

// Hash tracking is read and written from every task future; losing Send
// or Sync here would stop compilation far from the cause.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<TaskHashTracker>();
};

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;
    use turborepo_repository::package_json::PackageJson;

    use super::*;

    fn write_fixture() -> Result<(tempfile::TempDir, PackageGraph)> {
        let dir = tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let app = root.join_components(&["packages", "app"]);
        app.join_component("src").create_dir_all()?;
        app.join_component("package.json").create_with_contents(
            r#"{"name": "app", "scripts": {"build": "echo build"}}"#,
        )?;
        app.join_components(&["src", "main.ts"])
            .create_with_contents("console.log(1)")?;
        app.join_component("README.md")
            .create_with_contents("# app")?;

        let root_json: PackageJson =
            serde_json::from_str(r#"{"name": "fixture", "workspaces": ["packages/*"]}"#)?;
        let graph = PackageGraph::builder(root.to_owned(), root_json).build()?;
        Ok((dir, graph))
    }

    fn file_hashes_for(
        repo_root: &AbsoluteSystemPath,
        graph: &PackageGraph,
        inputs: &[&str],
    ) -> Result<String> {
        let task_id = TaskId::from_static("app".into(), "build".into());
        let definition = TaskDefinition {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            ..TaskDefinition::default()
        };
        let definitions = HashMap::from_iter([(task_id.clone(), definition)]);
        let node = TaskNode::Task(task_id.clone());
        let hashes = PackageInputsHashes::calculate_file_hashes(
            repo_root,
            graph,
            &definitions,
            std::iter::once(&node),
            2,
        )?;
        Ok(hashes.hash_for_task(&task_id).unwrap().to_string())
    }

    #[test]
    fn test_input_change_changes_hash() -> Result<()> {
        let (dir, graph) = write_fixture()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;

        let before = file_hashes_for(root, &graph, &["src/**"])?;
        // Touching a file outside the inputs leaves the hash alone.
        root.join_components(&["packages", "app", "README.md"])
            .create_with_contents("# changed")?;
        assert_eq!(before, file_hashes_for(root, &graph, &["src/**"])?);

        // Touching a matched file changes it.
        root.join_components(&["packages", "app", "src", "main.ts"])
            .create_with_contents("console.log(2)")?;
        assert_ne!(before, file_hashes_for(root, &graph, &["src/**"])?);
        Ok(())
    }

    #[test]
    fn test_default_inputs_cover_all_files() -> Result<()> {
        let (dir, graph) = write_fixture()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;

        let before = file_hashes_for(root, &graph, &[])?;
        root.join_components(&["packages", "app", "README.md"])
            .create_with_contents("# changed")?;
        assert_ne!(before, file_hashes_for(root, &graph, &[])?);
        Ok(())
    }

    #[test]
    fn test_gitignored_files_excluded_from_default_set() -> Result<()> {
        let (dir, graph) = write_fixture()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        root.join_components(&["packages", "app", ".gitignore"])
            .create_with_contents("ignored.txt\n")?;

        let before = file_hashes_for(root, &graph, &[])?;
        root.join_components(&["packages", "app", "ignored.txt"])
            .create_with_contents("scratch")?;
        assert_eq!(before, file_hashes_for(root, &graph, &[])?);
        Ok(())
    }

    #[test]
    fn test_task_hash_includes_dependency_hashes() -> Result<()> {
        let (dir, graph) = write_fixture()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;

        let build = TaskId::from_static("app".into(), "build".into());
        let definition = TaskDefinition::default();
        let definitions = HashMap::from_iter([(build.clone(), definition.clone())]);
        let node = TaskNode::Task(build.clone());
        let inputs = PackageInputsHashes::calculate_file_hashes(
            root,
            &graph,
            &definitions,
            std::iter::once(&node),
            2,
        )?;

        let env = EnvironmentVariableMap::default();
        let hasher = TaskHasher::new(inputs, &env, "global", &[]);
        let info = graph.package_info(&PackageName::from("app")).unwrap();

        let dep_node = TaskNode::Task(TaskId::from_static("lib".into(), "build".into()));
        let deps = HashSet::from_iter([&dep_node]);

        // Dependency not hashed yet: that's a bug in walk ordering.
        assert!(matches!(
            hasher.calculate_task_hash(&build, &definition, info, &deps),
            Err(Error::MissingDependencyTaskHash(_))
        ));

        hasher
            .task_hash_tracker()
            .insert_hash(TaskId::from_static("lib".into(), "build".into()), "d".repeat(16));
        let with_dep = hasher.calculate_task_hash(&build, &definition, info, &deps)?;
        let without_dep =
            hasher.calculate_task_hash(&build, &definition, info, &HashSet::new())?;
        assert_ne!(with_dep, without_dep);
        assert_eq!(hasher.task_hash_tracker().hash(&build), Some(without_dep));
        Ok(())
    }

    #[test]
    fn test_tracker_usable_across_threads() {
        let tracker = TaskHashTracker::default();
        let task_id = TaskId::from_static("app".into(), "build".into());
        let handle = {
            let tracker = tracker.clone();
            let task_id = task_id.clone();
            std::thread::spawn(move || tracker.insert_hash(task_id, "f".repeat(16)))
        };
        handle.join().unwrap();
        assert_eq!(tracker.hash(&task_id), Some("f".repeat(16)));
    }
}
