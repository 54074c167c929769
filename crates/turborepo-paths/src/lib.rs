//! Typed paths for the task runner.
//!
//! Four flavors with explicit conversions between them:
//! - [`AbsoluteSystemPath`]: absolute, native separators. The repo root, the
//!   cache directory, anything we hand to the OS.
//! - [`AnchoredSystemPath`]: relative to some absolute anchor, native
//!   separators. Workspace-relative file paths.
//! - [`RelativeUnixPath`]: relative, forward slashes only. The flavor stored
//!   inside cache archives so artifacts are byte-identical across platforms.
//! - [`AbsoluteUnixPathBuf`]: absolute, forward slashes. Conversion target
//!   for link names leaving the process.
//!
//! Separator translation happens only in the `to_unix`/`to_system`
//! conversions, never implicitly.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod relative_unix_path;

use std::path::Path;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::{AnchoredSystemPath, AnchoredSystemPathBuf};
pub use relative_unix_path::{RelativeUnixPath, RelativeUnixPathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path is malformed: {0}")]
    MalformedPath(String),
    #[error("path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("{0} is not a prefix of {1}")]
    NotParent(String, String),
    #[error("path is not safe for windows: {0}")]
    WindowsUnsafe(String),
    #[error("io error while accessing path: {0}")]
    IO(#[from] std::io::Error),
}

impl PathError {
    pub fn invalid_utf8(path: impl AsRef<Path>) -> Self {
        Self::InvalidUnicode(path.as_ref().to_string_lossy().into_owned())
    }
}

/// An absolute path using `/` as the separator regardless of platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteUnixPathBuf(String);

impl AbsoluteUnixPathBuf {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AbsoluteUnixPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn path_to_unix_string(path: &Path) -> Result<String, PathError> {
    use path_slash::PathExt;
    Ok(path
        .to_slash()
        .ok_or_else(|| PathError::invalid_utf8(path))?
        .into_owned())
}

pub(crate) fn unix_str_to_system_string(unix: &str) -> String {
    if std::path::MAIN_SEPARATOR == '/' {
        unix.to_string()
    } else {
        unix.replace('/', std::path::MAIN_SEPARATOR_STR)
    }
}
