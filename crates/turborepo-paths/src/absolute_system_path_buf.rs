use std::{
    ops::Deref,
    path::{Path, PathBuf},
};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::{AbsoluteSystemPath, PathError};

/// Owned absolute path with native separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(pub(crate) Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from(value.into());
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self(path))
    }

    /// Resolves `value` against `base` if it is relative, keeps it otherwise.
    pub fn from_unknown(base: &AbsoluteSystemPath, value: impl AsRef<Utf8Path>) -> Self {
        let value = value.as_ref();
        if value.is_absolute() {
            Self(value.to_owned())
        } else {
            Self(Utf8Path::new(base.as_str()).join(value))
        }
    }

    /// The process's working directory.
    pub fn cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir()?;
        let cwd =
            Utf8PathBuf::from_path_buf(cwd).map_err(|p| PathError::invalid_utf8(p.as_path()))?;
        Ok(Self(cwd))
    }

    pub fn as_path(&self) -> &AbsoluteSystemPath {
        AbsoluteSystemPath::new_unchecked(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_path()
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self.as_path()
    }
}

impl AsRef<Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl std::borrow::Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self.as_path()
    }
}

impl TryFrom<&Path> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: &Path) -> Result<Self, Self::Error> {
        AbsoluteSystemPath::from_std_path(path).map(|p| p.to_owned())
    }
}

impl TryFrom<PathBuf> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::try_from(path.as_path())
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: &str) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl std::fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
