//! Glob expansion over a directory tree.
//!
//! Patterns are unix-style with doublestar semantics, anchored at the walk
//! base. An exclusion matches a path or anything beneath it, so excluding
//! `dist/cache` also excludes `dist/cache/deep/file`.

use std::collections::HashSet;

use path_slash::PathExt;
use thiserror::Error;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, PathError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkType {
    Files,
    All,
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("bad glob pattern: {0}")]
    BadPattern(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

/// Expands `inclusions` minus `exclusions` under `base`, returning sorted
/// absolute paths. Symlinks are treated as files and never followed.
pub fn globwalk(
    base: &AbsoluteSystemPath,
    inclusions: &[String],
    exclusions: &[String],
    walk_type: WalkType,
) -> Result<Vec<AbsoluteSystemPathBuf>, WalkError> {
    for pattern in inclusions.iter().chain(exclusions) {
        validate_pattern(pattern)?;
    }

    let mut results = HashSet::new();
    let walker = walkdir::WalkDir::new(base.as_std_path()).follow_links(false);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // A file disappearing mid-walk is not an error worth failing
            // the run for.
            Err(e) if e.io_error().map(|io| io.kind())
                == Some(std::io::ErrorKind::NotFound) =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let is_dir = entry.file_type().is_dir();
        if walk_type == WalkType::Files && is_dir {
            continue;
        }

        let relative = match entry.path().strip_prefix(base.as_std_path()) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        let Some(unix) = relative.to_slash() else {
            continue;
        };

        if matches_any(&unix, inclusions) && !excluded_by_any(&unix, exclusions) {
            results.insert(AbsoluteSystemPath::from_std_path(entry.path())?.to_owned());
        }
    }

    let mut results: Vec<_> = results.into_iter().collect();
    results.sort();
    Ok(results)
}

fn validate_pattern(pattern: &str) -> Result<(), WalkError> {
    if pattern.is_empty() || pattern.starts_with('/') || pattern.contains('\\') {
        return Err(WalkError::BadPattern(pattern.to_string()));
    }
    Ok(())
}

fn matches_any(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        glob_match::glob_match(pattern, path)
            // `dir/**` also covers the directory itself.
            || pattern
                .strip_suffix("/**")
                .is_some_and(|base| base == path)
    })
}

/// Exclusions cover the matched path and its entire subtree.
fn excluded_by_any(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if glob_match::glob_match(pattern, path) {
            return true;
        }
        let subtree = format!("{}/**", pattern.trim_end_matches('/'));
        glob_match::glob_match(&subtree, path)
    })
}
