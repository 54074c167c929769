//! Environment variable selection for hashing and task execution.
//!
//! Tasks declare the variables they depend on as names or `*` wildcards,
//! with `!` prefixes for exclusions. The resolved map feeds the task hash
//! (sorted `KEY=value` pairs) and the child process environment.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid env wildcard: {0}")]
    Regex(#[from] regex::Error),
}

/// A list of `KEY=value` strings, sorted for hashing.
pub type EnvironmentVariablePairs = Vec<String>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

impl EnvironmentVariableMap {
    /// Snapshot of the process environment at startup.
    pub fn infer() -> Self {
        Self(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    /// Sorted `KEY=value` pairs, the form that enters hashes.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort_unstable();
        pairs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Adds all entries of `other`, overwriting on conflict.
    pub fn union(&mut self, other: &EnvironmentVariableMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Removes every key present in `other`.
    pub fn difference(&mut self, other: &EnvironmentVariableMap) {
        for key in other.0.keys() {
            self.0.remove(key);
        }
    }

    /// Resolves wildcard patterns against this map. Patterns starting with
    /// `!` exclude; exclusions win over inclusions. A leading `\!` matches
    /// a literal `!`.
    pub fn from_wildcards<S: AsRef<str>>(
        &self,
        patterns: &[S],
    ) -> Result<EnvironmentVariableMap, Error> {
        if patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }
        let WildcardMaps {
            inclusions,
            exclusions,
        } = self.wildcard_maps(patterns)?;
        let mut result = inclusions;
        result.difference(&exclusions);
        Ok(result)
    }

    /// Like [`Self::from_wildcards`] but keeps inclusions and exclusions
    /// separate so callers can give user exclusions primacy over inferred
    /// inclusions.
    pub fn wildcard_maps<S: AsRef<str>>(&self, patterns: &[S]) -> Result<WildcardMaps, Error> {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if let Some(negated) = pattern.strip_prefix('!') {
                excludes.push(wildcard_to_regex(negated));
            } else if let Some(escaped) = pattern.strip_prefix("\\!") {
                includes.push(wildcard_to_regex(&format!("!{escaped}")));
            } else {
                includes.push(wildcard_to_regex(pattern));
            }
        }

        let include_regex = compile_alternation(&includes)?;
        let exclude_regex = compile_alternation(&excludes)?;

        let mut result = WildcardMaps::default();
        for (key, value) in &self.0 {
            if let Some(re) = &include_regex {
                if re.is_match(key) {
                    result.inclusions.insert(key.clone(), value.clone());
                }
            }
            if let Some(re) = &exclude_regex {
                if re.is_match(key) {
                    result.exclusions.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(result)
    }
}

/// Inclusion and exclusion maps produced from one wildcard list.
#[derive(Debug, Default)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

fn compile_alternation(patterns: &[String]) -> Result<Option<Regex>, regex::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!("^(?:{})$", patterns.join("|"))).map(Some)
}

/// Translates an env wildcard into a regex fragment. `*` becomes `.*`,
/// `\*` a literal star, everything else is escaped.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut literal = String::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'*') => {
                chars.next();
                literal.push('*');
            }
            '*' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                if !out.ends_with(".*") {
                    out.push_str(".*");
                }
            }
            c => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for EnvironmentVariableMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Environment breakdown carried into run summaries: the composite map used
/// for hashing plus the split between explicitly declared and matched-by-
/// default variables.
#[derive(Debug, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

#[derive(Debug, Serialize)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

/// Resolves the `globalEnv` configuration against the environment at
/// startup, giving user exclusions primacy.
pub fn global_hashable_env_vars(
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &[String],
) -> Result<DetailedMap, Error> {
    let user_set = env_at_execution_start.wildcard_maps(global_env)?;

    let mut all = EnvironmentVariableMap::default();
    all.union(&user_set.inclusions);
    all.difference(&user_set.exclusions);

    let mut explicit = EnvironmentVariableMap::default();
    explicit.union(&user_set.inclusions);
    explicit.difference(&user_set.exclusions);

    Ok(DetailedMap {
        all,
        by_source: BySource {
            explicit,
            matching: EnvironmentVariableMap::default(),
        },
    })
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    fn fixture() -> EnvironmentVariableMap {
        [
            ("CI", "true"),
            ("NODE_ENV", "production"),
            ("NEXT_PUBLIC_API", "https://example.test"),
            ("NEXT_PUBLIC_KEY", "abc"),
            ("SECRET", "shh"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test_case(&["NODE_ENV"], &["NODE_ENV"] ; "exact name")]
    #[test_case(&["NEXT_PUBLIC_*"], &["NEXT_PUBLIC_API", "NEXT_PUBLIC_KEY"] ; "prefix wildcard")]
    #[test_case(&["*"], &["CI", "NEXT_PUBLIC_API", "NEXT_PUBLIC_KEY", "NODE_ENV", "SECRET"] ; "bare wildcard")]
    #[test_case(&["NEXT_PUBLIC_*", "!NEXT_PUBLIC_KEY"], &["NEXT_PUBLIC_API"] ; "exclusion wins")]
    fn test_from_wildcards(patterns: &[&str], expected: &[&str]) {
        let resolved = fixture().from_wildcards(patterns).unwrap();
        assert_eq!(resolved.names(), expected);
    }

    #[test]
    fn test_to_hashable_is_sorted() {
        let pairs = fixture().to_hashable();
        let mut sorted = pairs.clone();
        sorted.sort();
        assert_eq!(pairs, sorted);
        assert!(pairs.contains(&"CI=true".to_string()));
    }

    #[test]
    fn test_union_overwrites() {
        let mut base = fixture();
        let other: EnvironmentVariableMap = [("CI".to_string(), "false".to_string())]
            .into_iter()
            .collect();
        base.union(&other);
        assert_eq!(base.get("CI").map(String::as_str), Some("false"));
    }

    #[test]
    fn test_escaped_literal_star() {
        let map: EnvironmentVariableMap = [("WEIRD*NAME".to_string(), "v".to_string())]
            .into_iter()
            .collect();
        let resolved = map.from_wildcards(&["WEIRD\\*NAME"]).unwrap();
        assert_eq!(resolved.names(), vec!["WEIRD*NAME"]);
    }
}
