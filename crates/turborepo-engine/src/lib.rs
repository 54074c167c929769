//! The task graph: construction from workspace + pipeline, validation,
//! and dependency-ordered execution.

mod builder;
mod dot;
mod execute;
mod task_definition;

use std::collections::{HashMap, HashSet};

pub use builder::{BuilderError, EngineBuilder, TaskDefinitionProvider};
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
use petgraph::Graph;
pub use task_definition::{OutputLogsMode, TaskDefinition, TaskOutputs};
use turborepo_repository::package_graph::{PackageGraph, PackageName};
use turborepo_task_id::TaskId;

/// A node in the task graph: one concrete package-task pair, or the
/// synthetic root every entry point hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl std::fmt::Display for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task_id) => task_id.fmt(f),
        }
    }
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The sealed task graph. Edges point from dependents to dependencies; a
/// node is ready once every outgoing edge's target has completed.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId<'static>, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId<'static>, TaskDefinition>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn add_edge(&mut self, from: &TaskId<'static>, to: &TaskId<'static>) {
        let from_index = self.get_index(from);
        let to_index = self.get_index(to);
        self.task_graph.add_edge(from_index, to_index, ());
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    pub fn add_definition(
        &mut self,
        task_id: TaskId<'static>,
        definition: TaskDefinition,
    ) -> Option<TaskDefinition> {
        self.task_definitions.insert(task_id, definition)
    }

    /// Seals the graph against further mutation.
    pub fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            root_index,
            task_lookup,
            task_definitions,
            ..
        } = self;
        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup,
            task_definitions,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.task_lookup.keys()
    }

    pub fn task_definition<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a TaskDefinition> {
        self.task_definitions.get(task_id)
    }

    pub fn task_definitions(&self) -> &HashMap<TaskId<'static>, TaskDefinition> {
        &self.task_definitions
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    /// Direct dependents of a task.
    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index came from iterating this graph")
                })
                .collect(),
        )
    }

    /// Validates policy that only holds for sealed graphs: a persistent
    /// task may not have dependents, and enough concurrency must exist to
    /// hold every persistent task plus one.
    pub fn validate(
        &self,
        package_graph: &PackageGraph,
        concurrency: u32,
    ) -> Result<(), Vec<ValidateError>> {
        let mut validation_errors = Vec::new();
        let mut persistent_count: u32 = 0;

        for node_index in self.task_graph.node_indices() {
            let TaskNode::Task(task_id) = self
                .task_graph
                .node_weight(node_index)
                .expect("graph contains every index it yields")
            else {
                continue;
            };

            if self
                .task_definitions
                .get(task_id)
                .is_some_and(|def| def.persistent)
            {
                persistent_count += 1;
            }

            for dep_index in self
                .task_graph
                .neighbors_directed(node_index, petgraph::Direction::Outgoing)
            {
                let TaskNode::Task(dep_id) = self
                    .task_graph
                    .node_weight(dep_index)
                    .expect("graph contains every index it yields")
                else {
                    continue;
                };

                let Some(dep_definition) = self.task_definitions.get(dep_id) else {
                    validation_errors.push(ValidateError::MissingTask {
                        task_id: dep_id.to_string(),
                        package_name: dep_id.package().to_string(),
                    });
                    continue;
                };

                // Depending on a task that never exits would deadlock the
                // walk; only enforced when the dependency actually has a
                // script to run.
                let has_script = package_graph
                    .package_json(&PackageName::from(dep_id.package()))
                    .is_some_and(|json| json.scripts.contains_key(dep_id.task()));
                if dep_definition.persistent && has_script {
                    validation_errors.push(ValidateError::DependencyOnPersistentTask {
                        persistent_task: dep_id.to_string(),
                        dependant: task_id.to_string(),
                    });
                }
            }
        }

        if persistent_count >= concurrency {
            validation_errors.push(ValidateError::PersistentTasksExceedConcurrency {
                persistent_count,
                concurrency,
            });
        }

        if validation_errors.is_empty() {
            Ok(())
        } else {
            Err(validation_errors)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("Cannot find task definition for {task_id} in package {package_name}")]
    MissingTask {
        task_id: String,
        package_name: String,
    },
    #[error("\"{persistent_task}\" is a persistent task, \"{dependant}\" cannot depend on it")]
    DependencyOnPersistentTask {
        persistent_task: String,
        dependant: String,
    },
    #[error(
        "You have {persistent_count} persistent tasks but `turbo` is configured for concurrency \
         of {concurrency}. Set --concurrency to at least {persistent_count}"
    )]
    PersistentTasksExceedConcurrency {
        persistent_count: u32,
        concurrency: u32,
    },
}
