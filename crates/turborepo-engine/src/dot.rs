use std::fmt::Write;

use itertools::Itertools;
use petgraph::visit::EdgeRef;

use crate::{Engine, TaskNode};

impl Engine {
    /// Renders the task graph in Graphviz dot form, edges pointing from
    /// dependent to dependency. Output is sorted so identical graphs
    /// render identically.
    pub fn dot_graph(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph {\n");
        out.push_str("\tcompound = \"true\"\n");
        out.push_str("\tnewrank = \"true\"\n");
        out.push_str("\tsubgraph \"root\" {\n");

        let lines: Vec<String> = self
            .task_graph
            .edge_references()
            .map(|edge| {
                let source = &self.task_graph[edge.source()];
                let target = &self.task_graph[edge.target()];
                format!("\t\t\"[root] {}\" -> \"[root] {}\"", node_label(source), node_label(target))
            })
            .sorted()
            .collect();
        for line in lines {
            writeln!(out, "{line}").expect("writing to string cannot fail");
        }

        out.push_str("\t}\n");
        out.push_str("}\n");
        out
    }
}

fn node_label(node: &TaskNode) -> String {
    match node {
        TaskNode::Root => "___ROOT___".to_string(),
        TaskNode::Task(task_id) => task_id.to_string(),
    }
}
