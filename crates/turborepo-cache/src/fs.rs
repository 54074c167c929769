use std::backtrace::Backtrace;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_analytics::AnalyticsSender;
use turborepo_api_client::analytics::{AnalyticsEvent, CacheEvent, CacheSource as EventSource};

use crate::{
    CacheError, CacheHitMetadata, CacheSource,
    cache_archive::{CacheReader, CacheWriter, artifact_digest},
};

/// The local disk tier: `<cacheDir>/<hash>.tar.zst` next to a JSON sidecar
/// holding the original duration and the artifact's integrity digest.
pub struct FSCache {
    cache_directory: AbsoluteSystemPathBuf,
    analytics_recorder: Option<AnalyticsSender>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
    /// SHA-512 of the artifact bytes, verified before every restore.
    integrity: String,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?)
            .map_err(|e| CacheError::InvalidMetadata(e, Backtrace::capture()))
    }
}

impl FSCache {
    pub fn new(
        cache_dir: &Utf8Path,
        repo_root: &AbsoluteSystemPath,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir);
        cache_directory.create_dir_all()?;
        Ok(FSCache {
            cache_directory,
            analytics_recorder,
        })
    }

    fn artifact_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory.join_component(&format!("{hash}.tar.zst"))
    }

    fn metadata_path(&self, hash: &str) -> AbsoluteSystemPathBuf {
        self.cache_directory.join_component(&format!("{hash}-meta.json"))
    }

    fn log_fetch(&self, event: CacheEvent, hash: &str, duration: u64) {
        // Analytics must never fail the cache.
        if let Some(recorder) = &self.analytics_recorder {
            let _ = recorder.send(AnalyticsEvent {
                session_id: None,
                source: EventSource::Local,
                event,
                hash: hash.to_string(),
                duration,
            });
        }
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let uncompressed_path = self.cache_directory.join_component(&format!("{hash}.tar"));
        let compressed_path = self.artifact_path(hash);

        let cache_path = if compressed_path.exists() {
            compressed_path
        } else if uncompressed_path.exists() {
            uncompressed_path
        } else {
            debug!("no artifact for {hash} in {}", self.cache_directory);
            self.log_fetch(CacheEvent::Miss, hash, 0);
            return Ok(None);
        };

        let meta = CacheMetadata::read(&self.metadata_path(hash))?;

        // A corrupt artifact downgrades to a miss rather than failing the
        // task; the damaged file is removed so the next write can land.
        if artifact_digest(&cache_path)? != meta.integrity {
            warn!("cache artifact for {hash} failed integrity check, removing");
            let _ = cache_path.remove_file();
            let _ = self.metadata_path(hash).remove_file();
            self.log_fetch(CacheEvent::Miss, hash, 0);
            return Ok(None);
        }

        let restored_files = CacheReader::open(&cache_path)?.restore(anchor)?;

        self.log_fetch(CacheEvent::Hit, hash, meta.duration);
        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: meta.duration,
            },
            restored_files,
        )))
    }

    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if !self.artifact_path(hash).exists()
            && !self
                .cache_directory
                .join_component(&format!("{hash}.tar"))
                .exists()
        {
            return Ok(None);
        }
        let duration = CacheMetadata::read(&self.metadata_path(hash))
            .map(|meta| meta.duration)
            .unwrap_or(0);
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: duration,
        }))
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let cache_path = self.artifact_path(hash);

        let mut writer = CacheWriter::create(&cache_path)?;
        for file in files {
            writer.add_file(anchor, file)?;
        }
        // Atomic: the archive reaches its final name fully written or not
        // at all.
        writer.finish()?;

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
            integrity: artifact_digest(&cache_path)?,
        };
        let meta_json = serde_json::to_string(&meta)
            .map_err(|e| CacheError::InvalidMetadata(e, Backtrace::capture()))?;

        // Same temp-then-rename dance for the sidecar.
        let temp_metadata_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));
        temp_metadata_path.create_with_contents(&meta_json)?;
        temp_metadata_path.rename(&self.metadata_path(hash))?;

        Ok(())
    }
}
