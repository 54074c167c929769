use std::{
    backtrace::Backtrace,
    fs,
    path::{Component, Path},
};

use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::{CacheError, cache_archive::restore::canonicalize_name};

pub fn restore_directory(
    anchor: &AbsoluteSystemPath,
    entry_path: &Path,
    mode: u32,
) -> Result<AnchoredSystemPathBuf, CacheError> {
    let processed_name = canonicalize_name(entry_path)?;
    safe_mkdir_all(anchor, &processed_name, mode)?;
    Ok(processed_name)
}

/// `create_dir_all` with a guard: walks the path segment by segment and
/// refuses to pass through any symlink whose target lies outside the
/// anchor, so a hostile archive cannot stage an escape via an earlier
/// entry.
pub fn safe_mkdir_all(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
    mode: u32,
) -> Result<(), CacheError> {
    let mut walked = anchor.to_owned();
    for component in processed_name.as_std_path().components() {
        let segment = component_to_segment(component)?;
        walked = check_path(anchor, &walked, segment)?;
    }

    let resolved = anchor.resolve(processed_name);
    fs::create_dir_all(&resolved)?;

    #[cfg(unix)]
    resolved.set_mode(mode & 0o777)?;
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn component_to_segment<'a>(component: Component<'a>) -> Result<&'a str, CacheError> {
    match component {
        Component::Normal(segment) => segment.to_str().ok_or_else(|| {
            CacheError::InvalidFilePath(
                segment.to_string_lossy().into_owned(),
                Backtrace::capture(),
            )
        }),
        other => Err(CacheError::LinkOutsideOfDirectory(
            format!("{other:?}"),
            Backtrace::capture(),
        )),
    }
}

fn check_path(
    original_anchor: &AbsoluteSystemPath,
    accumulated: &AbsoluteSystemPath,
    segment: &str,
) -> Result<AbsoluteSystemPathBuf, CacheError> {
    let combined = accumulated.join_component(segment);
    let Ok(file_info) = combined.symlink_metadata() else {
        // Nothing on disk yet; nothing to escape through.
        return Ok(combined);
    };
    if !file_info.is_symlink() {
        return Ok(combined);
    }

    // A symlink in the middle of the path: only allowed when it stays
    // under the anchor, resolved lexically rather than via the filesystem.
    let link_target = combined.read_link()?;
    if link_target.is_absolute() {
        let cleaned = path_clean::clean(&link_target);
        if cleaned.starts_with(original_anchor.as_std_path()) {
            return AbsoluteSystemPathBuf::try_from(cleaned.as_path()).map_err(CacheError::from);
        }
    } else {
        let computed = path_clean::clean(accumulated.as_std_path().join(&link_target));
        if computed.starts_with(original_anchor.as_std_path()) {
            return AbsoluteSystemPathBuf::try_from(computed.as_path()).map_err(CacheError::from);
        }
    }

    Err(CacheError::LinkOutsideOfDirectory(
        link_target.to_string_lossy().into_owned(),
        Backtrace::capture(),
    ))
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_creates_nested_dirs() -> Result<()> {
        let dir = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(dir.path())?;
        let name = turbopath::AnchoredSystemPathBuf::from_raw("a/b/c")?;
        safe_mkdir_all(anchor, &name, 0o755)?;
        assert!(anchor.join_components(&["a", "b", "c"]).exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escape() -> Result<()> {
        let dir = tempdir()?;
        let outside = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(dir.path())?;
        // `escape` points outside the anchor; creating below it must fail.
        anchor
            .join_component("escape")
            .symlink_to_dir(outside.path())?;
        let name = turbopath::AnchoredSystemPathBuf::from_raw("escape/child")?;
        let result = safe_mkdir_all(anchor, &name, 0o755);
        assert!(matches!(
            result,
            Err(CacheError::LinkOutsideOfDirectory(_, _))
        ));
        Ok(())
    }
}
