use std::collections::{HashMap, HashSet};

use petgraph::graph::Graph;
use tracing::debug;
use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_globwalk::WalkType;

use super::{Error, PackageGraph, PackageInfo, PackageName, PackageNode, external_deps_hash};
use crate::package_json::PackageJson;

/// Builds the workspace graph by expanding the root manifest's `workspaces`
/// globs, loading each member manifest, and adding an edge for every
/// dependency declaration naming another workspace package.
pub struct PackageGraphBuilder {
    repo_root: AbsoluteSystemPathBuf,
    root_package_json: PackageJson,
}

impl PackageGraphBuilder {
    pub fn new(repo_root: AbsoluteSystemPathBuf, root_package_json: PackageJson) -> Self {
        Self {
            repo_root,
            root_package_json,
        }
    }

    pub fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            repo_root,
            root_package_json,
        } = self;

        let mut packages = HashMap::new();
        packages.insert(
            PackageName::Root,
            PackageInfo {
                package_json: root_package_json.clone(),
                package_dir: AnchoredSystemPathBuf::default(),
                external_deps_hash: String::new(),
            },
        );

        // `workspaces` globs name directories; the manifest inside each one
        // defines the package.
        let patterns: Vec<String> = root_package_json
            .workspaces
            .iter()
            .map(|glob| format!("{}/package.json", glob.trim_end_matches('/')))
            .collect();
        if !patterns.is_empty() {
            let exclusions = vec!["**/node_modules/**".to_string()];
            for manifest_path in
                turborepo_globwalk::globwalk(&repo_root, &patterns, &exclusions, WalkType::Files)?
            {
                let package_json = PackageJson::load(&manifest_path)?;
                let Some(name) = package_json.name.clone() else {
                    debug!("skipping unnamed package at {manifest_path}");
                    continue;
                };
                let package_dir = repo_root
                    .anchor(manifest_path.parent().expect("manifest has a directory"))?;
                let package_name = PackageName::Other(name);
                if packages.contains_key(&package_name) {
                    return Err(Error::DuplicatePackage(package_name.to_string()));
                }
                packages.insert(
                    package_name,
                    PackageInfo {
                        package_json,
                        package_dir,
                        external_deps_hash: String::new(),
                    },
                );
            }
        }

        let internal_names: HashSet<String> = packages
            .keys()
            .filter_map(|name| match name {
                PackageName::Other(name) => Some(name.clone()),
                PackageName::Root => None,
            })
            .collect();

        // Now that membership is known, fingerprint external deps.
        let hashes: HashMap<PackageName, String> = packages
            .iter()
            .map(|(name, info)| {
                (
                    name.clone(),
                    external_deps_hash(&info.package_json, &internal_names),
                )
            })
            .collect();
        for (name, hash) in hashes {
            if let Some(info) = packages.get_mut(&name) {
                info.external_deps_hash = hash;
            }
        }

        let mut graph = Graph::new();
        let mut node_lookup = HashMap::new();
        let root_index = graph.add_node(PackageNode::Root);
        node_lookup.insert(PackageNode::Root, root_index);
        for name in packages.keys() {
            if matches!(name, PackageName::Root) {
                continue;
            }
            let node = PackageNode::Workspace(name.clone());
            let index = graph.add_node(node.clone());
            node_lookup.insert(node, index);
        }

        for (name, info) in &packages {
            if matches!(name, PackageName::Root) {
                continue;
            }
            let from = node_lookup[&PackageNode::Workspace(name.clone())];
            let mut has_internal_dep = false;
            for (dep_name, _) in info.package_json.all_dependencies() {
                if internal_names.contains(dep_name.as_str()) && dep_name != name.as_str() {
                    let to = node_lookup[&PackageNode::Workspace(PackageName::Other(
                        dep_name.clone(),
                    ))];
                    graph.add_edge(from, to, ());
                    has_internal_dep = true;
                }
            }
            if !has_internal_dep {
                graph.add_edge(from, root_index, ());
            }
        }

        turborepo_graph_utils::validate_graph(&graph)?;

        Ok(PackageGraph {
            graph,
            node_lookup,
            packages,
            repo_root,
        })
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;
    use turbopath::AbsoluteSystemPath;

    use super::*;

    fn write_package(
        root: &AbsoluteSystemPath,
        dir: &str,
        name: &str,
        deps: &[&str],
    ) -> Result<()> {
        let package_dir = root.join_components(&dir.split('/').collect::<Vec<_>>());
        package_dir.create_dir_all()?;
        let deps_json: Vec<String> = deps
            .iter()
            .map(|dep| format!(r#""{dep}": "workspace:*""#))
            .collect();
        package_dir.join_component("package.json").create_with_contents(format!(
            r#"{{"name": "{name}", "scripts": {{"build": "echo build"}}, "dependencies": {{{}}}}}"#,
            deps_json.join(", ")
        ))?;
        Ok(())
    }

    fn root_package_json() -> PackageJson {
        serde_json::from_str(r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#).unwrap()
    }

    #[test]
    fn test_discovers_packages_and_edges() -> Result<()> {
        let dir = tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        write_package(root, "packages/app", "app", &["lib"])?;
        write_package(root, "packages/lib", "lib", &[])?;

        let graph = PackageGraph::builder(root.to_owned(), root_package_json()).build()?;
        assert_eq!(graph.len(), 2);

        let app_deps = graph
            .immediate_dependencies(&PackageNode::Workspace(PackageName::from("app")))
            .unwrap();
        assert!(app_deps.contains(&PackageNode::Workspace(PackageName::from("lib"))));
        Ok(())
    }

    #[test]
    fn test_cycle_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        write_package(root, "packages/a", "a", &["b"])?;
        write_package(root, "packages/b", "b", &["a"])?;

        let result = PackageGraph::builder(root.to_owned(), root_package_json()).build();
        assert!(matches!(result, Err(Error::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_closures() -> Result<()> {
        let dir = tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        write_package(root, "packages/app", "app", &["ui"])?;
        write_package(root, "packages/ui", "ui", &["tokens"])?;
        write_package(root, "packages/tokens", "tokens", &[])?;

        let graph = PackageGraph::builder(root.to_owned(), root_package_json()).build()?;

        let deps = graph.dependencies_closure(&[PackageName::from("app")]);
        assert_eq!(deps.len(), 3);

        let dependents = graph.dependents_closure(&[PackageName::from("tokens")]);
        assert_eq!(dependents.len(), 3);

        let external = graph.external_dependencies_hash();
        assert_eq!(external.len(), 16);
        Ok(())
    }
}
