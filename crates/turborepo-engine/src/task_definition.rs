use serde::{Deserialize, Serialize};
use turborepo_task_id::TaskName;

/// How much of a task's captured output reaches the terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    HashOnly,
    NewOnly,
    ErrorsOnly,
    None,
}

/// Output globs: inclusions minus exclusions (`!`-prefixed in config).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    /// The form that enters the task hash: both lists sorted, exclusions
    /// re-prefixed so the combined list is unambiguous.
    pub fn hashable(&self) -> Vec<String> {
        let mut hashable = Vec::with_capacity(self.inclusions.len() + self.exclusions.len());
        hashable.extend(self.inclusions.iter().cloned());
        hashable.extend(self.exclusions.iter().map(|glob| format!("!{glob}")));
        hashable.sort_unstable();
        hashable
    }
}

/// Fully resolved execution policy for one task, the product of the root
/// pipeline and any workspace overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,

    /// `dependsOn` entries naming tasks in this package or explicit
    /// `pkg#task` pairs.
    pub task_dependencies: Vec<TaskName<'static>>,
    /// `dependsOn` entries that arrived with the `^` prefix, expanded
    /// across workspace dependencies at graph construction.
    pub topological_dependencies: Vec<TaskName<'static>>,

    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
    pub inputs: Vec<String>,
    pub output_logs: OutputLogsMode,
    pub persistent: bool,
    pub interactive: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: TaskOutputs::default(),
            cache: true,
            task_dependencies: Vec::new(),
            topological_dependencies: Vec::new(),
            env: Vec::new(),
            pass_through_env: None,
            inputs: Vec::new(),
            output_logs: OutputLogsMode::default(),
            persistent: false,
            interactive: false,
        }
    }
}

impl TaskDefinition {
    /// Workspace-relative log location for this task's captured output.
    pub fn log_file_name(task_name: &str) -> String {
        // Strip any path-ish characters out of nested task names.
        let safe = task_name.replace([':', '/'], "$colon$");
        format!("turbo-{safe}.log")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hashable_outputs_sorted_with_exclusions_marked() {
        let outputs = TaskOutputs {
            inclusions: vec!["dist/**".to_string(), "build/**".to_string()],
            exclusions: vec!["dist/cache/**".to_string()],
        };
        assert_eq!(
            outputs.hashable(),
            vec!["!dist/cache/**", "build/**", "dist/**"]
        );
    }

    #[test]
    fn test_output_logs_mode_serde() {
        let mode: OutputLogsMode = serde_json::from_str("\"hash-only\"").unwrap();
        assert_eq!(mode, OutputLogsMode::HashOnly);
        assert_eq!(serde_json::to_string(&OutputLogsMode::Full).unwrap(), "\"full\"");
    }
}
