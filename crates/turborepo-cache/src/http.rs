use std::backtrace::Backtrace;

use tracing::debug;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use turborepo_analytics::AnalyticsSender;
use turborepo_api_client::{
    APIAuth, APIClient, Response,
    analytics::{AnalyticsEvent, CacheEvent, CacheSource as EventSource},
};

use crate::{
    CacheError, CacheHitMetadata, CacheOpts, CacheSource,
    cache_archive::{CacheReader, CacheWriter},
    signature_authentication::ArtifactSignatureAuthenticator,
};

/// The remote tier. Archives are built in memory, optionally tagged with
/// an HMAC, and exchanged with the cache API.
pub struct HTTPCache {
    client: APIClient,
    api_auth: APIAuth,
    signer_verifier: Option<ArtifactSignatureAuthenticator>,
    analytics_recorder: Option<AnalyticsSender>,
}

impl HTTPCache {
    pub fn new(
        client: APIClient,
        opts: &CacheOpts,
        api_auth: APIAuth,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> HTTPCache {
        let signer_verifier = opts
            .remote_cache_opts
            .as_ref()
            .filter(|remote_cache_opts| remote_cache_opts.signature)
            .map(|_| {
                ArtifactSignatureAuthenticator::new(
                    api_auth
                        .team_id
                        .as_deref()
                        .unwrap_or_default()
                        .as_bytes()
                        .to_vec(),
                    None,
                )
            });

        HTTPCache {
            client,
            api_auth,
            signer_verifier,
            analytics_recorder,
        }
    }

    fn log_fetch(&self, event: CacheEvent, hash: &str, duration: u64) {
        if let Some(recorder) = &self.analytics_recorder {
            let _ = recorder.send(AnalyticsEvent {
                session_id: None,
                source: EventSource::Remote,
                event,
                hash: hash.to_string(),
                duration,
            });
        }
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut artifact_body = Vec::new();
        {
            let mut writer = CacheWriter::from_writer(&mut artifact_body, true)?;
            for file in files {
                writer.add_file(anchor, file)?;
            }
            writer.finish()?;
        }

        let tag = self
            .signer_verifier
            .as_ref()
            .map(|signer| signer.generate_tag(hash.as_bytes(), &artifact_body))
            .transpose()?;

        debug!("uploading {hash} ({} bytes)", artifact_body.len());
        self.client
            .put_artifact(hash, artifact_body, duration, tag.as_deref(), &self.api_auth)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let Some(response) = self.client.artifact_exists(hash, &self.api_auth).await? else {
            return Ok(None);
        };
        let duration = Self::duration_from_response(&response)?;
        Ok(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: duration,
        }))
    }

    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let Some(response) = self.client.fetch_artifact(hash, &self.api_auth).await? else {
            self.log_fetch(CacheEvent::Miss, hash, 0);
            return Ok(None);
        };

        let duration = Self::duration_from_response(&response)?;
        let tag = response
            .headers()
            .get("x-artifact-tag")
            .map(|tag| tag.to_str().map(str::to_string))
            .transpose()
            .map_err(|_| CacheError::InvalidTag(Backtrace::capture()))?;

        let body = response
            .bytes()
            .await
            .map_err(turborepo_api_client::Error::from)?;

        if let Some(signer) = &self.signer_verifier {
            let Some(tag) = tag else {
                return Err(CacheError::ArtifactTagMissing(Backtrace::capture()));
            };
            if !signer.validate(hash.as_bytes(), &body, &tag)? {
                return Err(CacheError::InvalidTag(Backtrace::capture()));
            }
        }

        let files = CacheReader::from_reader(&body[..], true)?.restore(anchor)?;

        self.log_fetch(CacheEvent::Hit, hash, duration);
        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: duration,
            },
            files,
        )))
    }

    fn duration_from_response(response: &Response) -> Result<u64, CacheError> {
        response
            .headers()
            .get("x-artifact-duration")
            .map(|header| {
                header
                    .to_str()
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .ok_or_else(|| CacheError::InvalidDuration(Backtrace::capture()))
            })
            .transpose()
            .map(|duration| duration.unwrap_or(0))
    }
}
