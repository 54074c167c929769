use std::collections::BTreeMap;

use serde::Serialize;
use turbopath::AnchoredSystemPathBuf;
use turborepo_engine::TaskDefinition;
use turborepo_task_id::TaskId;

use super::execution::TaskExecutionSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSource {
    Local,
    Remote,
}

/// Cache state as reported in summaries. `local`/`remote` predate
/// `source` but stay for consumers of `--dry=json`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheSummary {
    pub local: bool,
    pub remote: bool,
    pub status: CacheStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CacheSource>,
    pub time_saved: u64,
}

impl TaskCacheSummary {
    pub fn cache_miss() -> Self {
        Self {
            local: false,
            remote: false,
            status: CacheStatus::Miss,
            source: None,
            time_saved: 0,
        }
    }

    pub fn hit(source: CacheSource, time_saved: u64) -> Self {
        Self {
            local: source == CacheSource::Local,
            remote: source == CacheSource::Remote,
            status: CacheStatus::Hit,
            source: Some(source),
            time_saved,
        }
    }
}

impl From<turborepo_cache::CacheHitMetadata> for TaskCacheSummary {
    fn from(metadata: turborepo_cache::CacheHitMetadata) -> Self {
        let source = match metadata.source {
            turborepo_cache::CacheSource::Local => CacheSource::Local,
            turborepo_cache::CacheSource::Remote => CacheSource::Remote,
        };
        Self::hit(source, metadata.time_saved)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvVarSummary {
    pub specified: TaskEnvConfiguration,
    pub configured: Vec<String>,
    pub pass_through: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvConfiguration {
    pub env: Vec<String>,
    pub pass_through_env: Vec<String>,
}

/// Everything the summary records about one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub dir: String,
    pub hash: String,
    pub inputs: BTreeMap<String, String>,
    pub hash_of_external_dependencies: String,
    pub cache: TaskCacheSummary,
    pub command: String,
    pub cli_arguments: Vec<String>,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub expanded_outputs: Vec<AnchoredSystemPathBuf>,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    pub resolved_task_definition: TaskDefinition,
    pub environment_variables: TaskEnvVarSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<TaskExecutionSummary>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cache_summary_serialization() {
        let hit = TaskCacheSummary::hit(CacheSource::Local, 1200);
        let json = serde_json::to_value(hit).unwrap();
        assert_eq!(json["status"], "HIT");
        assert_eq!(json["source"], "LOCAL");
        assert_eq!(json["local"], true);
        assert_eq!(json["timeSaved"], 1200);

        let miss = TaskCacheSummary::cache_miss();
        let json = serde_json::to_value(miss).unwrap();
        assert_eq!(json["status"], "MISS");
        assert!(json.get("source").is_none());
    }
}
