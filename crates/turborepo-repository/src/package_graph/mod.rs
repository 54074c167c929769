mod builder;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

pub use builder::PackageGraphBuilder;
use petgraph::{Direction, graph::{Graph, NodeIndex}};
use serde::Serialize;
use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_hash::{CanonicalHasher, TurboHash};

use crate::package_json::PackageJson;

pub const ROOT_PKG_NAME: &str = "//";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    PackageJson(#[from] crate::package_json::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Glob(#[from] turborepo_globwalk::WalkError),
    #[error("package graph validation failed: {0}")]
    Validation(#[from] turborepo_graph_utils::Error),
    #[error("duplicate package name: {0}")]
    DuplicatePackage(String),
}

/// A package identifier: the synthetic root, or a named workspace package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageName {
    Root,
    Other(String),
}

impl PackageName {
    pub fn as_str(&self) -> &str {
        match self {
            PackageName::Root => ROOT_PKG_NAME,
            PackageName::Other(name) => name,
        }
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value.to_string())
        }
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value)
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PackageName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Graph node: a workspace package or the root sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageNode {
    Root,
    Workspace(PackageName),
}

impl PackageNode {
    pub fn as_package_name(&self) -> PackageName {
        match self {
            PackageNode::Root => PackageName::Root,
            PackageNode::Workspace(name) => name.clone(),
        }
    }
}

impl fmt::Display for PackageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageNode::Root => f.write_str("___ROOT___"),
            PackageNode::Workspace(name) => name.fmt(f),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub package_json: PackageJson,
    /// Package directory relative to the repo root.
    pub package_dir: AnchoredSystemPathBuf,
    /// Fingerprint of the package's external (non-workspace) dependency
    /// declarations.
    pub external_deps_hash: String,
}

/// The workspace: repo root, package manifests, and the dependency graph
/// between packages. Immutable once built; validated acyclic at load.
#[derive(Debug)]
pub struct PackageGraph {
    pub(crate) graph: Graph<PackageNode, ()>,
    pub(crate) node_lookup: HashMap<PackageNode, NodeIndex>,
    pub(crate) packages: HashMap<PackageName, PackageInfo>,
    pub(crate) repo_root: AbsoluteSystemPathBuf,
}

impl PackageGraph {
    pub fn builder(repo_root: AbsoluteSystemPathBuf, root_package_json: PackageJson) -> PackageGraphBuilder {
        PackageGraphBuilder::new(repo_root, root_package_json)
    }

    pub fn repo_root(&self) -> &AbsoluteSystemPathBuf {
        &self.repo_root
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    pub fn len(&self) -> usize {
        self.packages
            .keys()
            .filter(|name| !matches!(name, PackageName::Root))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.packages.get(name).map(|info| &info.package_json)
    }

    /// Direct workspace dependencies of `node`.
    pub fn immediate_dependencies(&self, node: &PackageNode) -> Option<HashSet<PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.graph
                .neighbors_directed(*index, Direction::Outgoing)
                .map(|ix| {
                    self.graph
                        .node_weight(ix)
                        .expect("indices come from iterating this graph")
                        .clone()
                })
                .collect(),
        )
    }

    /// Every package reachable from `names` following dependency edges,
    /// the starting packages included.
    pub fn dependencies_closure(&self, names: &[PackageName]) -> HashSet<PackageName> {
        self.closure(names, Direction::Outgoing)
    }

    /// Every package that depends, transitively, on one of `names`.
    pub fn dependents_closure(&self, names: &[PackageName]) -> HashSet<PackageName> {
        self.closure(names, Direction::Incoming)
    }

    fn closure(&self, names: &[PackageName], direction: Direction) -> HashSet<PackageName> {
        let indices: Vec<_> = names
            .iter()
            .filter_map(|name| {
                self.node_lookup
                    .get(&PackageNode::Workspace(name.clone()))
                    .copied()
            })
            .collect();
        turborepo_graph_utils::transitive_closure(&self.graph, indices, direction)
            .into_iter()
            .filter_map(|node| match node {
                PackageNode::Workspace(name) => Some(name.clone()),
                PackageNode::Root => None,
            })
            .collect()
    }

    /// Aggregate external dependency fingerprint across every package,
    /// part of the global hash.
    pub fn external_dependencies_hash(&self) -> String {
        let mut hashes: Vec<_> = self
            .packages
            .iter()
            .map(|(name, info)| format!("{name}={}", info.external_deps_hash))
            .collect();
        hashes.sort_unstable();
        let mut hasher = CanonicalHasher::new();
        hasher.add_str_slice(&hashes);
        hasher.finish()
    }
}

/// Fingerprints the external dependency declarations of one manifest.
pub(crate) fn external_deps_hash(
    package_json: &PackageJson,
    internal_packages: &HashSet<String>,
) -> String {
    struct ExternalDeps(Vec<(String, String)>);
    impl TurboHash for ExternalDeps {
        fn write(&self, hasher: &mut CanonicalHasher) {
            hasher.add_map(self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
    }
    ExternalDeps(
        package_json
            .all_dependencies()
            .filter(|(name, _)| !internal_packages.contains(name.as_str()))
            .map(|(name, version)| (name.clone(), version.clone()))
            .collect(),
    )
    .hash()
}
