//! `turbo.json` loading, validation, and resolution into task
//! definitions.
//!
//! The root configuration declares the pipeline plus repo-wide settings.
//! Workspace packages may carry their own `turbo.json` that `extends`
//! the root and overlays unqualified task entries. Resolution for a
//! concrete `pkg#task` layers, most general first: root `task`, root
//! `pkg#task`, workspace `task`, with later fields overriding earlier
//! ones.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use thiserror::Error;
use turbopath::AbsoluteSystemPath;
use turborepo_cache::RemoteCacheOpts;
use turborepo_engine::{
    OutputLogsMode, TaskDefinition, TaskDefinitionProvider, TaskOutputs,
};
use turborepo_repository::package_graph::{PackageGraph, PackageName, ROOT_PKG_NAME};
use turborepo_task_id::{TaskId, TaskName};

pub const CONFIG_FILE: &str = "turbo.json";

const TOPOLOGICAL_PREFIX: char = '^';
const ENV_PIPELINE_DELIMITER: &str = "$";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to read {CONFIG_FILE}: {0}")]
    Io(#[from] std::io::Error),
    #[error("{CONFIG_FILE} is invalid: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(
        "invalid task name {task}: package tasks (package#task) are not allowed in a workspace's \
         {CONFIG_FILE}"
    )]
    PackageTaskInWorkspace { task: String },
    #[error("workspace {CONFIG_FILE} must extend [\"//\"], found {found:?}")]
    InvalidExtends { found: Vec<String> },
    #[error(
        "{key} is only allowed in the root {CONFIG_FILE}; remove it from the workspace \
         configuration"
    )]
    RootOnlyKey { key: &'static str },
    #[error(
        "invalid env declaration {value} in task {task}: the \"$\" prefix syntax was replaced by \
         the env key"
    )]
    InvalidEnvPrefix { task: String, value: String },
}

/// One task entry as written in configuration; every field optional so
/// entries can be layered.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTaskDefinition {
    depends_on: Option<Vec<String>>,
    inputs: Option<Vec<String>>,
    outputs: Option<Vec<String>>,
    env: Option<Vec<String>>,
    pass_through_env: Option<Vec<String>>,
    output_mode: Option<OutputLogsMode>,
    cache: Option<bool>,
    persistent: Option<bool>,
    interactive: Option<bool>,
    /// Deprecated: honored on read by merging into `inputs`, never
    /// written back.
    dot_env: Option<Vec<String>>,
}

impl RawTaskDefinition {
    /// Later layers win field-by-field.
    fn merge(&mut self, other: &RawTaskDefinition) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(depends_on);
        take!(inputs);
        take!(outputs);
        take!(env);
        take!(pass_through_env);
        take!(output_mode);
        take!(cache);
        take!(persistent);
        take!(interactive);
        take!(dot_env);
    }

    fn into_task_definition(self, task: &str) -> Result<TaskDefinition, Error> {
        let mut task_dependencies = Vec::new();
        let mut topological_dependencies = Vec::new();
        for dep in self.depends_on.unwrap_or_default() {
            if let Some(topo) = dep.strip_prefix(TOPOLOGICAL_PREFIX) {
                topological_dependencies.push(TaskName::from(topo.to_string()));
            } else if dep.starts_with(ENV_PIPELINE_DELIMITER) {
                return Err(Error::InvalidEnvPrefix {
                    task: task.to_string(),
                    value: dep,
                });
            } else {
                task_dependencies.push(TaskName::from(dep));
            }
        }

        let mut inclusions = Vec::new();
        let mut exclusions = Vec::new();
        for output in self.outputs.unwrap_or_default() {
            match output.strip_prefix('!') {
                Some(exclusion) => exclusions.push(exclusion.to_string()),
                None => inclusions.push(output),
            }
        }
        inclusions.sort_unstable();
        exclusions.sort_unstable();

        for value in self.env.iter().flatten() {
            if value.starts_with(ENV_PIPELINE_DELIMITER) {
                return Err(Error::InvalidEnvPrefix {
                    task: task.to_string(),
                    value: value.clone(),
                });
            }
        }

        let mut inputs = self.inputs.unwrap_or_default();
        // dotEnv files are just more inputs as far as hashing goes.
        inputs.extend(self.dot_env.into_iter().flatten());

        Ok(TaskDefinition {
            outputs: TaskOutputs {
                inclusions,
                exclusions,
            },
            cache: self.cache.unwrap_or(true),
            task_dependencies,
            topological_dependencies,
            env: self.env.unwrap_or_default(),
            pass_through_env: self.pass_through_env,
            inputs,
            output_logs: self.output_mode.unwrap_or_default(),
            persistent: self.persistent.unwrap_or_default(),
            interactive: self.interactive.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTurboJson {
    #[serde(rename = "$schema")]
    pub schema: Option<String>,
    pub extends: Option<Vec<String>>,
    pub global_dependencies: Option<Vec<String>>,
    pub global_env: Option<Vec<String>>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub remote_cache: Option<RemoteCacheOpts>,
    pub ui: Option<String>,
    pub pipeline: Option<BTreeMap<String, RawTaskDefinition>>,
}

/// A validated configuration file.
#[derive(Debug, Default)]
pub struct TurboJson {
    pub global_dependencies: Vec<String>,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Vec<String>,
    pub remote_cache: Option<RemoteCacheOpts>,
    pub pipeline: BTreeMap<String, RawTaskDefinition>,
    /// The raw pipeline text, part of the global hash so editing any task
    /// definition invalidates every cache entry.
    pub pipeline_text: String,
}

impl TurboJson {
    pub fn parse_root(contents: &str) -> Result<TurboJson, Error> {
        let raw: RawTurboJson = serde_json::from_str(contents)?;
        let pipeline = raw.pipeline.unwrap_or_default();
        Ok(TurboJson {
            global_dependencies: raw.global_dependencies.unwrap_or_default(),
            global_env: raw.global_env.unwrap_or_default(),
            global_pass_through_env: raw.global_pass_through_env.unwrap_or_default(),
            remote_cache: raw.remote_cache,
            // The whole file participates in the global hash; any edit to
            // the pipeline busts every cache entry.
            pipeline_text: contents.to_string(),
            pipeline,
        })
    }

    /// Workspace configurations are constrained: they must extend the
    /// root, may not carry root-only keys, and may not qualify task names
    /// with a package.
    pub fn parse_workspace(contents: &str) -> Result<TurboJson, Error> {
        let raw: RawTurboJson = serde_json::from_str(contents)?;

        match raw.extends.as_deref() {
            Some([root]) if root == ROOT_PKG_NAME => (),
            other => {
                return Err(Error::InvalidExtends {
                    found: other.map(<[String]>::to_vec).unwrap_or_default(),
                });
            }
        }
        if raw.global_dependencies.is_some() {
            return Err(Error::RootOnlyKey {
                key: "globalDependencies",
            });
        }
        if raw.global_env.is_some() {
            return Err(Error::RootOnlyKey { key: "globalEnv" });
        }
        if raw.global_pass_through_env.is_some() {
            return Err(Error::RootOnlyKey {
                key: "globalPassThroughEnv",
            });
        }
        if raw.remote_cache.is_some() {
            return Err(Error::RootOnlyKey { key: "remoteCache" });
        }
        if raw.ui.is_some() {
            return Err(Error::RootOnlyKey { key: "ui" });
        }

        let pipeline = raw.pipeline.unwrap_or_default();
        for task in pipeline.keys() {
            if TaskName::from(task.as_str()).is_package_qualified() {
                return Err(Error::PackageTaskInWorkspace { task: task.clone() });
            }
        }

        Ok(TurboJson {
            pipeline_text: contents.to_string(),
            pipeline,
            ..TurboJson::default()
        })
    }

    pub fn load(path: &AbsoluteSystemPath, is_root: bool) -> Result<TurboJson, Error> {
        let contents = path.read_to_string()?;
        if is_root {
            Self::parse_root(&contents)
        } else {
            Self::parse_workspace(&contents)
        }
    }
}

/// All configuration for one run: the root `turbo.json` plus any
/// workspace overlays, indexed by package.
pub struct TurboJsonLoader {
    root: TurboJson,
    workspace: HashMap<PackageName, TurboJson>,
}

impl TurboJsonLoader {
    /// Loads the root configuration and every workspace overlay that
    /// exists on disk.
    pub fn load(repo_root: &AbsoluteSystemPath, package_graph: &PackageGraph) -> Result<Self, Error> {
        let root = TurboJson::load(&repo_root.join_component(CONFIG_FILE), true)?;
        let mut workspace = HashMap::new();
        for (name, info) in package_graph.packages() {
            if matches!(name, PackageName::Root) {
                continue;
            }
            let candidate = repo_root
                .resolve(&info.package_dir)
                .join_component(CONFIG_FILE);
            if candidate.exists() {
                workspace.insert(name.clone(), TurboJson::load(&candidate, false)?);
            }
        }
        Ok(Self { root, workspace })
    }

    pub fn from_parts(root: TurboJson, workspace: HashMap<PackageName, TurboJson>) -> Self {
        Self { root, workspace }
    }

    pub fn root(&self) -> &TurboJson {
        &self.root
    }

    fn resolved_raw(&self, task_id: &TaskId) -> Option<RawTaskDefinition> {
        let mut layers: Vec<&RawTaskDefinition> = Vec::new();

        // Most general first: root bare, root qualified, workspace bare.
        if let Some(raw) = self.root.pipeline.get(task_id.task()) {
            layers.push(raw);
        }
        if let Some(raw) = self.root.pipeline.get(&task_id.to_string()) {
            layers.push(raw);
        }
        if let Some(workspace) = self
            .workspace
            .get(&PackageName::from(task_id.package()))
        {
            if let Some(raw) = workspace.pipeline.get(task_id.task()) {
                layers.push(raw);
            }
        }

        if layers.is_empty() {
            return None;
        }
        let mut merged = RawTaskDefinition::default();
        for layer in layers {
            merged.merge(layer);
        }
        Some(merged)
    }
}

impl TaskDefinitionProvider for TurboJsonLoader {
    fn task_definition(&self, task_id: &TaskId) -> Option<TaskDefinition> {
        self.resolved_raw(task_id)
            .and_then(|raw| raw.into_task_definition(task_id.task()).ok())
    }
}
