use std::sync::Arc;

use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_analytics::AnalyticsSender;
use turborepo_api_client::{APIAuth, APIClient};

use crate::{CacheError, CacheHitMetadata, CacheOpts, multiplexer::CacheMultiplexer};

const WARNING_CUTOFF: u8 = 4;

/// Write-behind front over the multiplexer: `put` queues the upload and
/// returns immediately, with at most `workers` saves in flight. Reads pass
/// straight through. `shutdown` drains the queue so a fast exit cannot
/// drop archives on the floor.
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sender: mpsc::Sender<WriteRequest>,
    worker_handle: JoinHandle<()>,
}

struct WriteRequest {
    anchor: AbsoluteSystemPathBuf,
    hash: String,
    files: Vec<AnchoredSystemPathBuf>,
    duration: u64,
}

impl AsyncCache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        client: Option<(APIClient, APIAuth)>,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> Result<AsyncCache, CacheError> {
        let real_cache = Arc::new(CacheMultiplexer::new(
            opts,
            repo_root,
            client,
            analytics_recorder,
        )?);
        let max_workers = opts.workers.max(1) as usize;
        let (writer_sender, mut write_consumer) = mpsc::channel(max_workers);

        let worker_handle = tokio::spawn({
            let real_cache = real_cache.clone();
            async move {
                let semaphore = Arc::new(Semaphore::new(max_workers));
                let mut workers = tokio::task::JoinSet::new();
                let mut consecutive_failures: u8 = 0;
                while let Some(request) = write_consumer.recv().await {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("cache write semaphore lives as long as the worker");
                    let real_cache = real_cache.clone();
                    workers.spawn(async move {
                        let WriteRequest {
                            anchor,
                            hash,
                            files,
                            duration,
                        } = request;
                        let result = real_cache.put(&anchor, &hash, &files, duration).await;
                        drop(permit);
                        result
                    });
                    // Reap finished writers as we go so errors surface near
                    // the task that caused them.
                    while let Some(finished) = workers.try_join_next() {
                        consecutive_failures =
                            log_write_result(finished, consecutive_failures);
                    }
                }
                while let Some(finished) = workers.join_next().await {
                    consecutive_failures = log_write_result(finished, consecutive_failures);
                }
            }
        });

        Ok(AsyncCache {
            real_cache,
            writer_sender,
            worker_handle,
        })
    }

    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        hash: &str,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        self.writer_sender
            .send(WriteRequest {
                anchor,
                hash: hash.to_string(),
                files,
                duration,
            })
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        self.real_cache.fetch(anchor, hash).await
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.real_cache.exists(hash).await
    }

    /// Waits until every queued write has landed.
    pub async fn shutdown(self) {
        let AsyncCache {
            writer_sender,
            worker_handle,
            ..
        } = self;
        drop(writer_sender);
        if let Err(e) = worker_handle.await {
            warn!("cache writer worker panicked: {e}");
        }
    }
}

fn log_write_result(
    result: Result<Result<(), CacheError>, tokio::task::JoinError>,
    consecutive_failures: u8,
) -> u8 {
    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            if consecutive_failures < WARNING_CUTOFF {
                warn!("failed to save outputs to cache: {e}");
            }
            consecutive_failures.saturating_add(1)
        }
        Err(e) => {
            warn!("cache write task panicked: {e}");
            consecutive_failures.saturating_add(1)
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_put_is_visible_after_shutdown() -> Result<()> {
        let repo = tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(repo.path())?;
        repo_root
            .join_component("dist.js")
            .create_with_contents("bundle")?;

        let opts = CacheOpts {
            cache_dir: Utf8PathBuf::from("cache"),
            workers: 4,
            ..CacheOpts::default()
        };
        let hash = "abcdabcdabcdabcd";

        let cache = AsyncCache::new(&opts, repo_root, None, None)?;
        cache
            .put(
                repo_root.to_owned(),
                hash,
                vec![AnchoredSystemPathBuf::from_raw("dist.js")?],
                77,
            )
            .await?;
        cache.shutdown().await;

        // A fresh cache over the same directory sees the artifact.
        let cache = AsyncCache::new(&opts, repo_root, None, None)?;
        let hit = cache.exists(hash).await?;
        assert_eq!(
            hit,
            Some(crate::CacheHitMetadata {
                source: crate::CacheSource::Local,
                time_saved: 77
            })
        );
        Ok(())
    }
}
