use std::{
    ops::Deref,
    path::{Component, Path},
};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::{PathError, RelativeUnixPathBuf, path_to_unix_string};

/// Borrowed path relative to an unspecified absolute anchor, native
/// separators.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Utf8Path);

/// Owned variant of [`AnchoredSystemPath`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AnchoredSystemPathBuf(Utf8PathBuf);

impl AnchoredSystemPath {
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: repr(transparent) wrapper over Utf8Path
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn to_owned(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf(self.0.to_owned())
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn components(&self) -> impl Iterator<Item = Utf8Component<'_>> {
        self.0.components()
    }

    pub fn join_component(&self, component: &str) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf(self.0.join(component))
    }

    /// Converts to the unix flavor, translating separators.
    pub fn to_unix(&self) -> Result<RelativeUnixPathBuf, PathError> {
        let unix = path_to_unix_string(self.0.as_std_path())?;
        RelativeUnixPathBuf::new(unix)
    }
}

impl AnchoredSystemPathBuf {
    /// Validates a raw string as a relative path.
    pub fn from_raw(value: impl Into<String>) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from(value.into());
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.into_string()));
        }
        Ok(Self(path))
    }

    /// Accepts a path straight out of a tar header, rejecting anything
    /// that is absolute or escapes the anchor via `..` segments.
    pub fn from_system_path(path: &Path) -> Result<Self, PathError> {
        let utf8 = Utf8Path::from_path(path).ok_or_else(|| PathError::invalid_utf8(path))?;
        for component in path.components() {
            match component {
                Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                    return Err(PathError::MalformedPath(utf8.to_string()));
                }
                Component::CurDir | Component::Normal(_) => (),
            }
        }
        Ok(Self(
            utf8.components()
                .filter(|c| !matches!(c, Utf8Component::CurDir))
                .collect(),
        ))
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &AnchoredSystemPath {
        AnchoredSystemPath::new_unchecked(&self.0)
    }

    pub fn push(&mut self, component: &str) {
        self.0.push(component);
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_path()
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self.as_path()
    }
}

impl std::borrow::Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self.as_path()
    }
}

impl TryFrom<&Path> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(path: &Path) -> Result<Self, Self::Error> {
        let utf8 = Utf8Path::from_path(path).ok_or_else(|| PathError::invalid_utf8(path))?;
        if utf8.is_absolute() {
            return Err(PathError::NotRelative(utf8.to_string()));
        }
        Ok(Self(utf8.to_owned()))
    }
}

impl std::fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_system_path_rejects_traversal() {
        let err = AnchoredSystemPathBuf::from_system_path(Path::new("../escape"));
        assert!(err.is_err());
    }

    #[test]
    fn test_from_system_path_strips_cur_dir() {
        let path = AnchoredSystemPathBuf::from_system_path(Path::new("./a/b")).unwrap();
        assert_eq!(path.as_str(), Utf8PathBuf::from("a/b").as_str());
    }

    #[cfg(unix)]
    #[test]
    fn test_to_unix_is_identity_on_unix() {
        let path = AnchoredSystemPathBuf::from_raw("a/b/c").unwrap();
        assert_eq!(path.to_unix().unwrap().as_str(), "a/b/c");
    }
}
