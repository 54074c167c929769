use std::{
    backtrace::Backtrace,
    path::{Path, PathBuf},
};

use path_clean::clean;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPath};

use crate::{CacheError, cache_archive::restore_regular::safe_mkdir_file};

/// Restores one symlink. With `allow_missing_target` false, a target that
/// does not yet exist on disk is reported so the caller can defer the link
/// to the ordered second phase.
pub fn restore_symlink(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
    linkname: &Path,
    allow_missing_target: bool,
) -> Result<(), CacheError> {
    if !allow_missing_target {
        let canonical_target = canonicalize_linkname(anchor, processed_name, linkname)?;
        if std::fs::symlink_metadata(&canonical_target).is_err() {
            return Err(CacheError::LinkTargetDoesNotExist(
                canonical_target.to_string_lossy().into_owned(),
                Backtrace::capture(),
            ));
        }
    }

    safe_mkdir_file(anchor, processed_name)?;

    let link_path = anchor.resolve(processed_name);
    // Clear whatever a previous restore left at this name.
    let _ = link_path.remove();

    let target_is_dir = anchor
        .resolve(processed_name)
        .parent()
        .map(|parent| parent.as_std_path().join(linkname).is_dir())
        .unwrap_or(false);
    if target_is_dir {
        link_path.symlink_to_dir(linkname)?;
    } else {
        link_path.symlink_to_file(linkname)?;
    }

    Ok(())
}

/// Computes, lexically, where `linkname` will point once restored at
/// `processed_name`. Link targets themselves are restored verbatim; the
/// canonical form exists only so deferred links can be DAG-ordered.
pub fn canonicalize_linkname(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
    linkname: &Path,
) -> Result<PathBuf, CacheError> {
    let cleaned = clean(linkname);

    // Absolute on this platform means canonical by rule.
    if cleaned.is_absolute() {
        return Ok(cleaned);
    }

    // Everything else is treated as relative to the link's own directory,
    // because that is how the OS will resolve it after restore.
    let source = anchor.resolve(processed_name);
    let base = source.parent().unwrap_or(anchor);
    Ok(clean(base.as_std_path().join(cleaned)))
}

#[cfg(test)]
mod test {
    use turbopath::AnchoredSystemPathBuf;

    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_canonicalize_relative_linkname() {
        let anchor = AbsoluteSystemPath::new("/repo").unwrap();
        let name = AnchoredSystemPathBuf::from_raw("dist/link").unwrap();
        let canonical = canonicalize_linkname(anchor, &name, Path::new("../real")).unwrap();
        assert_eq!(canonical, PathBuf::from("/repo/real"));
    }

    #[cfg(unix)]
    #[test]
    fn test_canonicalize_absolute_linkname() {
        let anchor = AbsoluteSystemPath::new("/repo").unwrap();
        let name = AnchoredSystemPathBuf::from_raw("link").unwrap();
        let canonical =
            canonicalize_linkname(anchor, &name, Path::new("/etc/hosts")).unwrap();
        assert_eq!(canonical, PathBuf::from("/etc/hosts"));
    }
}
