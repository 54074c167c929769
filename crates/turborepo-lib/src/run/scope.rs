//! Package selection from `--filter` expressions.
//!
//! Supported forms, composed by union across repeated flags:
//! - `name` or a glob like `web*` selects matching packages
//! - `...name` adds the dependents of the selection
//! - `name...` adds the dependencies of the selection
//! - `[ref]` selects packages changed since a ref, answered by an
//!   external change oracle; without one every package counts as changed

use std::collections::HashSet;

use thiserror::Error;
use turborepo_repository::package_graph::{PackageGraph, PackageName};

#[derive(Debug, Error)]
pub enum Error {
    #[error("no packages matched filter {0}")]
    NoPackagesMatched(String),
}

/// External oracle answering "which packages changed since this ref".
pub trait ChangeDetector {
    fn changed_packages(&self, since_ref: &str) -> HashSet<PackageName>;
}

/// Without git integration, every package is considered changed. Always
/// safe; just means no filtering.
pub struct AllPackagesChanged;

impl ChangeDetector for AllPackagesChanged {
    fn changed_packages(&self, _since_ref: &str) -> HashSet<PackageName> {
        HashSet::new()
    }
}

/// Resolves filter patterns to the packages in scope. No patterns means
/// every package.
pub fn resolve_packages(
    patterns: &[String],
    package_graph: &PackageGraph,
    change_detector: &dyn ChangeDetector,
) -> Result<HashSet<PackageName>, Error> {
    let all_packages: HashSet<PackageName> = package_graph
        .packages()
        .map(|(name, _)| name.clone())
        .filter(|name| !matches!(name, PackageName::Root))
        .collect();

    if patterns.is_empty() {
        return Ok(all_packages);
    }

    let mut selected = HashSet::new();
    for pattern in patterns {
        let mut matched = resolve_one(pattern, package_graph, &all_packages, change_detector);
        if matched.is_empty() {
            return Err(Error::NoPackagesMatched(pattern.clone()));
        }
        selected.extend(matched.drain());
    }
    Ok(selected)
}

fn resolve_one(
    pattern: &str,
    package_graph: &PackageGraph,
    all_packages: &HashSet<PackageName>,
    change_detector: &dyn ChangeDetector,
) -> HashSet<PackageName> {
    // Changed-since form.
    if let Some(since_ref) = pattern
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        let changed = change_detector.changed_packages(since_ref);
        return if changed.is_empty() {
            all_packages.clone()
        } else {
            changed
        };
    }

    let include_dependents = pattern.starts_with("...");
    let include_dependencies = pattern.ends_with("...");
    let name_glob = pattern.trim_start_matches("...").trim_end_matches("...");

    let base: Vec<PackageName> = all_packages
        .iter()
        .filter(|package| glob_match::glob_match(name_glob, package.as_str()))
        .cloned()
        .collect();

    let mut matched: HashSet<PackageName> = base.iter().cloned().collect();
    if include_dependents {
        matched.extend(package_graph.dependents_closure(&base));
    }
    if include_dependencies {
        matched.extend(package_graph.dependencies_closure(&base));
    }
    matched
}
