//! The run summary: accumulated while tasks execute, rendered as text or
//! JSON at the end, optionally persisted under `.turbo/runs/`.

pub mod execution;
pub mod task;

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use serde::Serialize;
pub use execution::{ExecutionSummary, ExecutionState, TaskExecutionSummary, TaskTracker};
use itertools::Itertools;
pub use task::{TaskCacheSummary, TaskSummary};
use turbopath::AbsoluteSystemPath;

use crate::run::global_hash::GlobalHashableInputs;

const RUN_SUMMARY_SCHEMA_VERSION: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to write run summary: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize run summary: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEnvVarSummary {
    pub specified: GlobalEnvConfiguration,
    pub configured: Vec<String>,
    pub pass_through: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEnvConfiguration {
    pub env: Vec<String>,
    pub pass_through_env: Vec<String>,
}

/// The global-hash section of the summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary {
    pub root_key: &'static str,
    pub files: std::collections::BTreeMap<String, String>,
    pub hash_of_external_dependencies: String,
    pub environment_variables: GlobalEnvVarSummary,
}

impl From<&GlobalHashableInputs> for GlobalHashSummary {
    fn from(inputs: &GlobalHashableInputs) -> Self {
        Self {
            root_key: inputs.global_cache_key,
            files: inputs
                .global_file_hash_map
                .iter()
                .map(|(path, hash)| (path.to_string(), hash.clone()))
                .collect(),
            hash_of_external_dependencies: inputs.root_external_deps_hash.clone(),
            environment_variables: GlobalEnvVarSummary {
                specified: GlobalEnvConfiguration {
                    env: inputs.env.clone(),
                    pass_through_env: inputs.pass_through_env.clone(),
                },
                configured: inputs.resolved_env_vars.all.to_hashable(),
                pass_through: Vec::new(),
            },
        }
    }
}

/// The complete record of one invocation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub version: &'static str,
    pub turbo_version: &'static str,
    pub monorepo: bool,
    pub global_cache_inputs: GlobalHashSummary,
    pub packages: Vec<String>,
    pub execution: ExecutionSummary,
    pub tasks: Vec<TaskSummary>,
}

/// Accumulates task summaries as the visitor completes them.
#[derive(Clone)]
pub struct RunTracker {
    state: Arc<Mutex<RunTrackerState>>,
}

#[derive(Default)]
struct RunTrackerState {
    tasks: Vec<TaskSummary>,
    execution: ExecutionSummary,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RunTrackerState::default())),
        }
    }

    pub fn track_task(&self, task: TaskSummary) {
        let mut state = self.state.lock().expect("run tracker mutex poisoned");
        if let Some(execution) = &task.execution {
            state.execution.record(execution);
        }
        state.tasks.push(task);
    }

    /// Closes out the run: builds the summary document ordered by task id.
    pub fn finish(
        self,
        packages: Vec<String>,
        global_hash_inputs: &GlobalHashableInputs,
    ) -> RunSummary {
        let mut state = self.state.lock().expect("run tracker mutex poisoned");
        let mut tasks = std::mem::take(&mut state.tasks);
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        RunSummary {
            id: uuid::Uuid::new_v4().to_string(),
            version: RUN_SUMMARY_SCHEMA_VERSION,
            turbo_version: env!("CARGO_PKG_VERSION"),
            monorepo: true,
            global_cache_inputs: GlobalHashSummary::from(global_hash_inputs),
            packages,
            execution: state.execution,
            tasks,
        }
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    /// Persists under `.turbo/runs/<id>.json`.
    pub fn save(&self, repo_root: &AbsoluteSystemPath) -> Result<(), Error> {
        let runs_dir = repo_root.join_components(&[".turbo", "runs"]);
        runs_dir.create_dir_all()?;
        let path = runs_dir.join_component(&format!("{}.json", self.id));
        path.create_with_contents(serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable dry-run rendering: one aligned block per task.
    pub fn print_text<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writeln!(writer, "\nTasks to Run")?;
        for task in &self.tasks {
            writeln!(writer, "{}", task.task_id)?;
            let fields = [
                ("Task", task.task.clone()),
                ("Package", task.package.clone()),
                ("Hash", task.hash.clone()),
                ("Cached (Local)", task.cache.local.to_string()),
                ("Cached (Remote)", task.cache.remote.to_string()),
                ("Command", task.command.clone()),
                ("Outputs", task.outputs.iter().join(", ")),
                ("Log File", task.log_file.clone()),
                (
                    "Dependencies",
                    task.dependencies.iter().map(|id| id.to_string()).join(", "),
                ),
                (
                    "Dependents",
                    task.dependents.iter().map(|id| id.to_string()).join(", "),
                ),
            ];
            for (name, value) in fields {
                writeln!(writer, "  {name:<24} = {value}")?;
            }
        }
        Ok(())
    }

    /// End-of-run status line, with the full-turbo marker when every task
    /// replayed from cache.
    pub fn print_execution_footer<W: Write>(
        &self,
        writer: &mut W,
        elapsed: std::time::Duration,
    ) -> Result<(), Error> {
        let ExecutionSummary {
            attempted,
            cached,
            success,
            failed,
            ..
        } = self.execution;
        writeln!(writer)?;
        writeln!(writer, " Tasks:    {success} successful, {attempted} total")?;
        writeln!(writer, "Cached:    {cached} cached, {attempted} total")?;
        writeln!(writer, "  Time:    {:.3}s", elapsed.as_secs_f64())?;
        if failed > 0 {
            writeln!(writer, "Failed:    {failed}")?;
        }
        if self.execution.is_full_turbo() {
            writeln!(writer, "\n>>> FULL TURBO")?;
        }
        writeln!(writer)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use turborepo_engine::TaskDefinition;
    use turborepo_task_id::TaskId;

    use super::{task::*, *};
    use crate::run::global_hash::GlobalHashableInputs;

    fn global_inputs() -> GlobalHashableInputs {
        GlobalHashableInputs {
            global_cache_key: crate::hash::GLOBAL_CACHE_KEY,
            global_file_hash_map: Default::default(),
            root_external_deps_hash: "ext".to_string(),
            env: vec![],
            resolved_env_vars: turborepo_env::DetailedMap {
                all: Default::default(),
                by_source: turborepo_env::BySource {
                    explicit: Default::default(),
                    matching: Default::default(),
                },
            },
            pass_through_env: vec![],
            pipeline_text: "{}".to_string(),
        }
    }

    fn task_summary(
        task_id: TaskId<'static>,
        cache: TaskCacheSummary,
        execution: TaskExecutionSummary,
        dependencies: Vec<TaskId<'static>>,
        dependents: Vec<TaskId<'static>>,
    ) -> TaskSummary {
        TaskSummary {
            task: task_id.task().to_string(),
            package: task_id.package().to_string(),
            task_id,
            dir: "packages/app".to_string(),
            hash: "aaaabbbbccccdddd".to_string(),
            inputs: BTreeMap::new(),
            hash_of_external_dependencies: "ext".to_string(),
            cache,
            command: "echo build".to_string(),
            cli_arguments: vec![],
            outputs: vec!["dist/**".to_string()],
            excluded_outputs: vec![],
            log_file: "packages/app/.turbo/turbo-build.log".to_string(),
            expanded_outputs: vec![],
            dependencies,
            dependents,
            resolved_task_definition: TaskDefinition::default(),
            environment_variables: TaskEnvVarSummary {
                specified: TaskEnvConfiguration {
                    env: vec![],
                    pass_through_env: vec![],
                },
                configured: vec![],
                pass_through: vec![],
            },
            execution: Some(execution),
        }
    }

    #[test]
    fn test_json_shape_and_task_ordering() {
        let tracker = RunTracker::new();
        let build = TaskId::from_static("app".into(), "build".into());
        let test = TaskId::from_static("app".into(), "test".into());

        // Insert out of order; the document sorts by task id.
        tracker.track_task(task_summary(
            test.clone(),
            TaskCacheSummary::cache_miss(),
            TaskTracker::start().built(0),
            vec![build.clone()],
            vec![],
        ));
        tracker.track_task(task_summary(
            build.clone(),
            TaskCacheSummary::cache_miss(),
            TaskTracker::start().built(0),
            vec![],
            vec![test.clone()],
        ));

        let summary = tracker.finish(vec!["app".to_string()], &global_inputs());
        let json: serde_json::Value =
            serde_json::from_str(&summary.to_json().unwrap()).unwrap();

        assert_eq!(json["version"], "1");
        assert_eq!(json["monorepo"], true);
        assert_eq!(json["tasks"][0]["taskId"], "app#build");
        assert_eq!(json["tasks"][1]["taskId"], "app#test");
        assert_eq!(json["tasks"][0]["dependents"][0], "app#test");
        assert_eq!(json["tasks"][1]["dependencies"][0], "app#build");
        assert_eq!(json["globalCacheInputs"]["rootKey"], crate::hash::GLOBAL_CACHE_KEY);
        assert_eq!(json["execution"]["attempted"], 2);
    }

    #[test]
    fn test_full_turbo_marker_in_footer() {
        let tracker = RunTracker::new();
        let build = TaskId::from_static("app".into(), "build".into());
        tracker.track_task(task_summary(
            build,
            TaskCacheSummary::hit(CacheSource::Local, 100),
            TaskTracker::start().cached(),
            vec![],
            vec![],
        ));
        let summary = tracker.finish(vec!["app".to_string()], &global_inputs());

        let mut out = Vec::new();
        summary
            .print_execution_footer(&mut out, std::time::Duration::from_millis(80))
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(">>> FULL TURBO"), "{text}");
    }

    #[test]
    fn test_save_writes_under_turbo_runs() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPath::from_std_path(dir.path()).unwrap();
        let summary = RunTracker::new().finish(vec![], &global_inputs());
        summary.save(root).unwrap();

        let saved = root
            .join_components(&[".turbo", "runs"])
            .join_component(&format!("{}.json", summary.id));
        assert!(saved.exists());
    }

    #[test]
    fn test_text_rendering_lists_tasks() {
        let tracker = RunTracker::new();
        let build = TaskId::from_static("app".into(), "build".into());
        tracker.track_task(task_summary(
            build,
            TaskCacheSummary::cache_miss(),
            TaskTracker::start().built(0),
            vec![],
            vec![],
        ));
        let summary = tracker.finish(vec!["app".to_string()], &global_inputs());

        let mut out = Vec::new();
        summary.print_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("app#build"));
        assert!(text.contains("Hash"));
        assert!(text.contains("aaaabbbbccccdddd"));
    }
}
