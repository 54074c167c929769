//! The hashable views of a task and of the repository-wide inputs.
//!
//! Field order is part of the format: reordering fields here changes
//! every hash and busts every cache in the wild.

use turborepo_hash::{CanonicalHasher, FileHashes, TurboHash};

/// Lets tooling invalidate every cache entry ever produced by shipping a
/// new key.
pub const GLOBAL_CACHE_KEY: &str = "HEY STELLLLLLLAAAAAAAAAAAAA";

/// Everything that goes into one task's fingerprint.
pub struct TaskHashable<'a> {
    pub global_hash: &'a str,
    pub task_dependency_hashes: Vec<String>,
    pub package_dir: String,
    pub hash_of_files: &'a str,
    pub external_deps_hash: &'a str,
    pub task: &'a str,
    pub outputs: Vec<String>,
    pub pass_through_args: &'a [String],
    pub env: Vec<String>,
    pub resolved_env_vars: Vec<String>,
    pub pass_through_env: Vec<String>,
}

impl TurboHash for TaskHashable<'_> {
    fn write(&self, hasher: &mut CanonicalHasher) {
        hasher.add_str(self.global_hash);
        hasher.add_str_slice(&self.task_dependency_hashes);
        hasher.add_str(&self.package_dir);
        hasher.add_str(self.hash_of_files);
        hasher.add_str(self.external_deps_hash);
        hasher.add_str(self.task);
        hasher.add_str_slice(&self.outputs);
        hasher.add_str_slice(self.pass_through_args);
        hasher.add_str_slice(&self.env);
        hasher.add_str_slice(&self.resolved_env_vars);
        hasher.add_str_slice(&self.pass_through_env);
    }
}

/// Repository-wide inputs shared by every task hash.
pub struct GlobalHashable<'a> {
    pub global_cache_key: &'static str,
    pub global_file_hash_map: &'a FileHashes,
    pub root_external_deps_hash: &'a str,
    pub env: Vec<String>,
    pub resolved_env_vars: Vec<String>,
    pub pass_through_env: Vec<String>,
    pub pipeline_text: &'a str,
}

impl TurboHash for GlobalHashable<'_> {
    fn write(&self, hasher: &mut CanonicalHasher) {
        hasher.add_str(self.global_cache_key);
        hasher.add_map(
            self.global_file_hash_map
                .iter()
                .map(|(path, hash)| (path.as_str(), hash.as_str())),
        );
        hasher.add_str(self.root_external_deps_hash);
        hasher.add_str_slice(&self.env);
        hasher.add_str_slice(&self.resolved_env_vars);
        hasher.add_str_slice(&self.pass_through_env);
        hasher.add_str(self.pipeline_text);
    }
}

/// File-hash map digested as one value, used per `(package, inputs)`
/// group.
pub struct PackageFileHashes<'a>(pub &'a FileHashes);

impl TurboHash for PackageFileHashes<'_> {
    fn write(&self, hasher: &mut CanonicalHasher) {
        hasher.add_map(
            self.0
                .iter()
                .map(|(path, hash)| (path.as_str(), hash.as_str())),
        );
    }
}
