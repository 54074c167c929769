use turbopath::AbsoluteSystemPath;
use turborepo_env::{DetailedMap, EnvironmentVariableMap, global_hashable_env_vars};
use turborepo_globwalk::WalkType;
use turborepo_hash::{FileHashes, TurboHash};
use turborepo_repository::package_graph::PackageGraph;

use crate::{
    hash::{GLOBAL_CACHE_KEY, GlobalHashable},
    turbo_json::{CONFIG_FILE, TurboJson},
};

/// Repo-wide hash inputs, resolved once per invocation. Every task hash
/// folds the digest of this in, so a change to any global input busts
/// every task.
pub struct GlobalHashableInputs {
    pub global_cache_key: &'static str,
    pub global_file_hash_map: FileHashes,
    pub root_external_deps_hash: String,
    pub env: Vec<String>,
    pub resolved_env_vars: DetailedMap,
    pub pass_through_env: Vec<String>,
    pub pipeline_text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Globwalk(#[from] turborepo_globwalk::WalkError),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error(transparent)]
    Hash(#[from] turborepo_hash::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
}

pub fn get_global_hash_inputs(
    repo_root: &AbsoluteSystemPath,
    package_graph: &PackageGraph,
    root_turbo_json: &TurboJson,
    env_at_execution_start: &EnvironmentVariableMap,
) -> Result<GlobalHashableInputs, Error> {
    // Declared global dependencies plus the two files that always count:
    // the root manifest and the configuration itself.
    let mut global_deps = root_turbo_json.global_dependencies.clone();
    global_deps.push("package.json".to_string());
    global_deps.push(CONFIG_FILE.to_string());
    global_deps.sort_unstable();
    global_deps.dedup();

    let files = turborepo_globwalk::globwalk(repo_root, &global_deps, &[], WalkType::Files)?;
    let anchored: Result<Vec<_>, _> = files
        .iter()
        .map(|file| repo_root.anchor(file))
        .collect();
    let global_file_hash_map = turborepo_hash::hash_files(repo_root, anchored?)?;

    let resolved_env_vars =
        global_hashable_env_vars(env_at_execution_start, &root_turbo_json.global_env)?;

    let mut env = root_turbo_json.global_env.clone();
    env.sort_unstable();
    let mut pass_through_env = root_turbo_json.global_pass_through_env.clone();
    pass_through_env.sort_unstable();

    Ok(GlobalHashableInputs {
        global_cache_key: GLOBAL_CACHE_KEY,
        global_file_hash_map,
        root_external_deps_hash: package_graph.external_dependencies_hash(),
        env,
        resolved_env_vars,
        pass_through_env,
        pipeline_text: root_turbo_json.pipeline_text.clone(),
    })
}

impl GlobalHashableInputs {
    pub fn calculate_global_hash(&self) -> String {
        GlobalHashable {
            global_cache_key: self.global_cache_key,
            global_file_hash_map: &self.global_file_hash_map,
            root_external_deps_hash: &self.root_external_deps_hash,
            env: self.env.clone(),
            resolved_env_vars: self.resolved_env_vars.all.to_hashable(),
            pass_through_env: self.pass_through_env.clone(),
            pipeline_text: &self.pipeline_text,
        }
        .hash()
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;
    use turborepo_repository::package_json::PackageJson;

    use super::*;

    fn fixture() -> Result<(tempfile::TempDir, PackageGraph, TurboJson)> {
        let dir = tempdir()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        root.join_component("package.json")
            .create_with_contents(r#"{"name": "fixture", "workspaces": ["packages/*"]}"#)?;
        root.join_component("turbo.json").create_with_contents(
            r#"{"globalDependencies": ["tsconfig.json"], "pipeline": {"build": {}}}"#,
        )?;
        root.join_component("tsconfig.json")
            .create_with_contents("{}")?;

        let root_json = PackageJson::load(&root.join_component("package.json"))?;
        let graph = PackageGraph::builder(root.to_owned(), root_json).build()?;
        let turbo_json = TurboJson::load(&root.join_component("turbo.json"), true)?;
        Ok((dir, graph, turbo_json))
    }

    #[test]
    fn test_global_hash_changes_with_global_dependency_contents() -> Result<()> {
        let (dir, graph, turbo_json) = fixture()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let env = EnvironmentVariableMap::default();

        let before = get_global_hash_inputs(root, &graph, &turbo_json, &env)?
            .calculate_global_hash();

        root.join_component("tsconfig.json")
            .create_with_contents(r#"{"strict": true}"#)?;
        let after = get_global_hash_inputs(root, &graph, &turbo_json, &env)?
            .calculate_global_hash();
        assert_ne!(before, after);
        Ok(())
    }

    #[test]
    fn test_global_hash_changes_with_env_values() -> Result<()> {
        let (dir, graph, mut turbo_json) = fixture()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        turbo_json.global_env = vec!["RELEASE_CHANNEL".to_string()];

        let env_a: EnvironmentVariableMap =
            [("RELEASE_CHANNEL".to_string(), "stable".to_string())]
                .into_iter()
                .collect();
        let env_b: EnvironmentVariableMap =
            [("RELEASE_CHANNEL".to_string(), "canary".to_string())]
                .into_iter()
                .collect();

        let hash_a = get_global_hash_inputs(root, &graph, &turbo_json, &env_a)?
            .calculate_global_hash();
        let hash_b = get_global_hash_inputs(root, &graph, &turbo_json, &env_b)?
            .calculate_global_hash();
        assert_ne!(hash_a, hash_b);
        Ok(())
    }

    #[test]
    fn test_global_hash_stable_for_identical_inputs() -> Result<()> {
        let (dir, graph, turbo_json) = fixture()?;
        let root = AbsoluteSystemPath::from_std_path(dir.path())?;
        let env = EnvironmentVariableMap::default();

        let first =
            get_global_hash_inputs(root, &graph, &turbo_json, &env)?.calculate_global_hash();
        let second =
            get_global_hash_inputs(root, &graph, &turbo_json, &env)?.calculate_global_hash();
        assert_eq!(first, second);
        Ok(())
    }
}
