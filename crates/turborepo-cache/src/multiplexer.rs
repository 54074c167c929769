use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_analytics::AnalyticsSender;
use turborepo_api_client::{APIAuth, APIClient};

use crate::{CacheError, CacheHitMetadata, CacheOpts, fs::FSCache, http::HTTPCache};

/// Ordered composition of the cache tiers: reads consult the local disk
/// first and stop at the first hit; writes fan out to every configured
/// tier. Remote trouble is never fatal: the remote tier is dropped for
/// the rest of the run and the read reports a miss.
pub struct CacheMultiplexer {
    fs: Option<FSCache>,
    http: Option<HTTPCache>,
    // The remote side can tell us mid-run that caching is disabled for
    // this team; after that we stop talking to it.
    should_use_http: AtomicBool,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        client: Option<(APIClient, APIAuth)>,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_http_cache = !opts.skip_remote;
        // The flags are not mutually exclusive, so it is possible to
        // configure yourself out of having a cache at all. Worth a warning
        // but not a failed build.
        if !use_fs_cache && !use_http_cache {
            warn!("no caches are enabled");
        }

        let fs = use_fs_cache
            .then(|| FSCache::new(&opts.cache_dir, repo_root, analytics_recorder.clone()))
            .transpose()?;

        let http = match (use_http_cache, client) {
            (true, Some((client, api_auth))) => Some(HTTPCache::new(
                client,
                opts,
                api_auth,
                analytics_recorder,
            )),
            _ => None,
        };

        Ok(CacheMultiplexer {
            fs,
            http,
            should_use_http: AtomicBool::new(true),
        })
    }

    fn http(&self) -> Option<&HTTPCache> {
        self.http
            .as_ref()
            .filter(|_| self.should_use_http.load(Ordering::Relaxed))
    }

    /// A remote error worth keeping the run alive for: log, disable the
    /// tier if the server told us to, report a miss.
    fn handle_http_error(&self, hash: &str, error: CacheError) {
        if matches!(
            error,
            CacheError::ApiClientError(turborepo_api_client::Error::CacheDisabled, _)
        ) {
            warn!("remote caching is disabled, skipping remote cache for the rest of this run");
            self.should_use_http.store(false, Ordering::Relaxed);
        } else {
            warn!("failed to contact remote cache for {hash}: {error}");
        }
    }

    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        // Local failures propagate; a full disk is not something to paper
        // over.
        if let Some(fs) = &self.fs {
            fs.put(anchor, hash, files, duration)?;
        }

        if let Some(http) = self.http() {
            if let Err(error) = http.put(anchor, hash, files, duration).await {
                self.handle_http_error(hash, error);
            }
        }

        Ok(())
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.fetch(anchor, hash)? {
                return Ok(Some(hit));
            }
        }

        if let Some(http) = self.http() {
            match http.fetch(anchor, hash).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => (),
                Err(error) => self.handle_http_error(hash, error),
            }
        }

        Ok(None)
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        if let Some(fs) = &self.fs {
            if let Some(hit) = fs.exists(hash)? {
                return Ok(Some(hit));
            }
        }

        if let Some(http) = self.http() {
            match http.exists(hash).await {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => (),
                Err(error) => self.handle_http_error(hash, error),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;
    use tempfile::tempdir;
    use turbopath::AbsoluteSystemPath;

    use super::*;

    #[tokio::test]
    async fn test_local_only_round_trip() -> Result<()> {
        let repo = tempdir()?;
        let repo_root = AbsoluteSystemPath::from_std_path(repo.path())?;
        repo_root
            .join_component("built.txt")
            .create_with_contents("artifact")?;

        let opts = CacheOpts {
            cache_dir: Utf8PathBuf::from(".turbo/cache"),
            ..CacheOpts::default()
        };
        let cache = CacheMultiplexer::new(&opts, repo_root, None, None)?;

        let hash = "1234123412341234";
        let files = vec![turbopath::AnchoredSystemPathBuf::from_raw("built.txt")?];
        assert!(cache.fetch(repo_root, hash).await?.is_none());

        cache.put(repo_root, hash, &files, 250).await?;
        let (meta, restored) = cache.fetch(repo_root, hash).await?.unwrap();
        assert_eq!(meta.time_saved, 250);
        assert_eq!(restored, files);
        assert!(cache.exists(hash).await?.is_some());
        Ok(())
    }
}
