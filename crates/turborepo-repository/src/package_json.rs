use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use turbopath::AbsoluteSystemPath;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to read package.json: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse package.json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The slice of a package manifest the task runner cares about: the name,
/// the runnable scripts, and the declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optional_dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<String>,
}

impl PackageJson {
    pub fn load(path: &AbsoluteSystemPath) -> Result<PackageJson, Error> {
        let contents = path.read_to_string()?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// All declared dependencies in one iterator, production first.
    pub fn all_dependencies(&self) -> impl Iterator<Item = (&String, &String)> {
        self.dependencies
            .iter()
            .chain(self.dev_dependencies.iter())
            .chain(self.optional_dependencies.iter())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let json = r#"{
            "name": "web",
            "version": "1.0.0",
            "private": true,
            "scripts": { "build": "next build" },
            "dependencies": { "ui": "workspace:*" }
        }"#;
        let parsed: PackageJson = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.name.as_deref(), Some("web"));
        assert_eq!(parsed.scripts.get("build").map(String::as_str), Some("next build"));
        assert_eq!(parsed.all_dependencies().count(), 1);
    }
}
