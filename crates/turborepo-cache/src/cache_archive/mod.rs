mod create;
mod restore;
mod restore_directory;
mod restore_regular;
mod restore_symlink;

pub use create::{CacheWriter, artifact_digest};
pub use restore::CacheReader;
