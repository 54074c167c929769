use std::collections::{HashSet, VecDeque};

use itertools::Itertools;
use turborepo_graph_utils as graph;
use turborepo_repository::package_graph::{PackageGraph, PackageName, PackageNode, ROOT_PKG_NAME};
use turborepo_task_id::{TaskId, TaskName};

use crate::{Building, Built, Engine, TaskDefinition};

pub const TOPOLOGICAL_PIPELINE_DELIMITER: &str = "^";

/// Where task definitions come from. The production implementation layers
/// workspace `turbo.json` overlays on the root pipeline; tests hand in
/// maps directly.
pub trait TaskDefinitionProvider {
    /// The fully resolved definition for one concrete task, picked by the
    /// most specific key (`pkg#task` over bare `task`, workspace overlay
    /// over root).
    fn task_definition(&self, task_id: &TaskId) -> Option<TaskDefinition>;

    /// Whether any package in the repository has a definition for this
    /// task name. Used to distinguish a typo from a task that merely does
    /// not apply to the selected packages.
    fn has_definition_in_repo(&self, package_graph: &PackageGraph, task_name: &TaskName) -> bool {
        package_graph.packages().any(|(package, _)| {
            let task_id = task_name
                .task_id()
                .unwrap_or_else(|| TaskId::new(package.as_str(), task_name.task()));
            self.task_definition(&task_id).is_some()
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("Could not find the following tasks in project: {0}")]
    MissingTasks(String),
    #[error("Could not find package \"{name}\" referenced by task {task}")]
    MissingPackage { name: String, task: String },
    #[error("Cannot depend on root task {task_id}: root tasks must be declared as \"//#{task}\"")]
    UndeclaredRootTask { task_id: String, task: String },
    #[error(transparent)]
    Validation(#[from] graph::Error),
}

/// Constructs the task graph for one run: the requested tasks across the
/// selected packages, expanded through their dependency declarations.
pub struct EngineBuilder<'a, P> {
    package_graph: &'a PackageGraph,
    provider: &'a P,
    workspaces: Vec<PackageName>,
    tasks: Vec<TaskName<'static>>,
    tasks_only: bool,
}

impl<'a, P: TaskDefinitionProvider> EngineBuilder<'a, P> {
    pub fn new(package_graph: &'a PackageGraph, provider: &'a P) -> Self {
        Self {
            package_graph,
            provider,
            workspaces: Vec::new(),
            tasks: Vec::new(),
            tasks_only: false,
        }
    }

    pub fn with_workspaces(mut self, workspaces: Vec<PackageName>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// With `--only`, dependency edges outside the requested package-task
    /// product are dropped instead of expanded.
    pub fn with_tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    fn allowed_tasks(&self) -> Option<HashSet<TaskId<'static>>> {
        self.tasks_only.then(|| {
            self.workspaces
                .iter()
                .cartesian_product(self.tasks.iter())
                .map(|(package, task_name)| {
                    task_name
                        .task_id()
                        .map(|id| id.into_owned())
                        .unwrap_or_else(|| {
                            TaskId::from_static(
                                package.as_str().to_string(),
                                task_name.task().to_string(),
                            )
                        })
                })
                .collect()
        })
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        // Nothing selected means nothing to do; an empty graph is valid.
        if self.workspaces.is_empty() {
            return Ok(Engine::default().seal());
        }

        let mut missing_tasks: Vec<&TaskName<'static>> = self
            .tasks
            .iter()
            .filter(|task| !self.provider.has_definition_in_repo(self.package_graph, task))
            .collect();
        if !missing_tasks.is_empty() {
            missing_tasks.sort();
            return Err(BuilderError::MissingTasks(
                missing_tasks.iter().join(", "),
            ));
        }

        let mut traversal_queue = VecDeque::new();
        for (workspace, task) in self.workspaces.iter().cartesian_product(self.tasks.iter()) {
            // Root tasks enter the graph only when requested as `//#task`.
            if matches!(workspace, PackageName::Root) && task.package() != Some(ROOT_PKG_NAME) {
                continue;
            }
            let task_id = task
                .task_id()
                .map(|id| id.into_owned())
                .unwrap_or_else(|| {
                    TaskId::from_static(
                        workspace.as_str().to_string(),
                        task.task().to_string(),
                    )
                });
            if let Some(package) = task.package() {
                if package != workspace.as_str() {
                    continue;
                }
            }
            if self.provider.task_definition(&task_id).is_some() {
                traversal_queue.push_back(task_id);
            }
        }

        let allowed_tasks = self.allowed_tasks();
        let mut visited: HashSet<TaskId<'static>> = HashSet::new();
        let mut engine: Engine<Building> = Engine::default();

        while let Some(task_id) = traversal_queue.pop_front() {
            if !visited.insert(task_id.clone()) {
                continue;
            }

            if task_id.package() != ROOT_PKG_NAME
                && self
                    .package_graph
                    .package_json(&PackageName::from(task_id.package()))
                    .is_none()
            {
                return Err(BuilderError::MissingPackage {
                    name: task_id.package().to_string(),
                    task: task_id.to_string(),
                });
            }

            let Some(task_definition) = self.provider.task_definition(&task_id) else {
                return Err(BuilderError::MissingTasks(task_id.to_string()));
            };

            let mut has_deps = false;

            // `^dep` fans out across the package's workspace dependencies.
            let dep_packages = self
                .package_graph
                .immediate_dependencies(&PackageNode::Workspace(PackageName::from(
                    task_id.package(),
                )));
            for dep_task in &task_definition.topological_dependencies {
                for dep_package in dep_packages.iter().flatten() {
                    let PackageNode::Workspace(dep_package) = dep_package else {
                        continue;
                    };
                    let dep_task_id = TaskId::from_static(
                        dep_package.as_str().to_string(),
                        dep_task.task().to_string(),
                    );
                    if self.provider.task_definition(&dep_task_id).is_none() {
                        continue;
                    }
                    if let Some(allowed) = &allowed_tasks {
                        if !allowed.contains(&dep_task_id) {
                            continue;
                        }
                    }
                    has_deps = true;
                    engine.add_edge(&task_id, &dep_task_id);
                    traversal_queue.push_back(dep_task_id);
                }
            }

            // Bare deps stay in-package; `pkg#dep` names its package
            // explicitly.
            for dep in &task_definition.task_dependencies {
                let dep_task_id = dep
                    .task_id()
                    .map(|id| id.into_owned())
                    .unwrap_or_else(|| {
                        TaskId::from_static(
                            task_id.package().to_string(),
                            dep.task().to_string(),
                        )
                    });
                if dep_task_id.package() == ROOT_PKG_NAME
                    && self.provider.task_definition(&dep_task_id).is_none()
                {
                    return Err(BuilderError::UndeclaredRootTask {
                        task_id: dep_task_id.to_string(),
                        task: dep_task_id.task().to_string(),
                    });
                }
                if let Some(allowed) = &allowed_tasks {
                    if !allowed.contains(&dep_task_id) {
                        continue;
                    }
                }
                has_deps = true;
                engine.add_edge(&task_id, &dep_task_id);
                traversal_queue.push_back(dep_task_id);
            }

            engine.add_definition(task_id.clone(), task_definition);
            if !has_deps {
                engine.connect_to_root(&task_id);
            }
        }

        graph::validate_graph(&engine.task_graph)?;

        Ok(engine.seal())
    }
}
