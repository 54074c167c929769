//! The run driver: configuration, task hashing, the run cache, process
//! management, and the visitor that ties the task graph to all of them.

pub mod cli;
mod daemon;
mod hash;
mod opts;
mod process;
mod run;
mod signal;
mod task_graph;
mod task_hash;
mod turbo_json;
mod ui;

pub use cli::main;
