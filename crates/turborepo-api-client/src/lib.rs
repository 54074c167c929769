//! HTTP client for the remote cache and its analytics endpoint.
//!
//! Artifacts live under `/v8/artifacts/{hash}`: `HEAD` probes existence,
//! `GET` downloads (the original run duration rides along in the
//! `x-artifact-duration` header), `PUT` uploads. Every request carries a
//! bearer token; team identity travels as query parameters. Signed mode
//! adds an `x-artifact-tag` HMAC computed by the cache layer.

pub mod analytics;

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
pub use reqwest::Response;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to contact remote cache: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("remote caching is disabled for this team")]
    CacheDisabled,
    #[error("remote cache request was rejected: {status}")]
    UnknownStatus { status: StatusCode },
}

#[derive(Debug, Clone)]
pub struct APIAuth {
    pub token: String,
    pub team_id: Option<String>,
    pub team_slug: Option<String>,
}

#[derive(Debug, Clone)]
pub struct APIClient {
    client: reqwest::Client,
    base_url: String,
}

impl APIClient {
    pub fn new(
        base_url: impl AsRef<str>,
        timeout: Option<Duration>,
        version: &str,
    ) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder().user_agent(format!("turbo {version}"));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
        })
    }

    fn artifact_request(&self, method: Method, hash: &str, auth: &APIAuth) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}/v8/artifacts/{hash}", self.base_url))
            .bearer_auth(&auth.token);
        if let Some(team_id) = &auth.team_id {
            request = request.query(&[("teamId", team_id.as_str())]);
        }
        if let Some(team_slug) = &auth.team_slug {
            request = request.query(&[("slug", team_slug.as_str())]);
        }
        request
    }

    /// `HEAD /v8/artifacts/{hash}`. `None` means the artifact is unknown.
    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn artifact_exists(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        let response = self
            .artifact_request(Method::HEAD, hash, auth)
            .send()
            .await?;
        Self::handle_artifact_response(response)
    }

    /// `GET /v8/artifacts/{hash}`. `None` means a miss.
    #[tracing::instrument(skip_all, fields(hash = hash))]
    pub async fn fetch_artifact(
        &self,
        hash: &str,
        auth: &APIAuth,
    ) -> Result<Option<Response>, Error> {
        let response = self
            .artifact_request(Method::GET, hash, auth)
            .send()
            .await?;
        Self::handle_artifact_response(response)
    }

    /// `PUT /v8/artifacts/{hash}` with the archive bytes as the body.
    #[tracing::instrument(skip_all, fields(hash = hash, bytes = body.len()))]
    pub async fn put_artifact(
        &self,
        hash: &str,
        body: Vec<u8>,
        duration_ms: u64,
        tag: Option<&str>,
        auth: &APIAuth,
    ) -> Result<(), Error> {
        let mut request = self
            .artifact_request(Method::PUT, hash, auth)
            .header("Content-Type", "application/octet-stream")
            .header("x-artifact-duration", duration_ms.to_string());
        if let Some(tag) = tag {
            request = request.header("x-artifact-tag", tag);
        }
        let response = request.body(body).send().await?;
        match Self::handle_artifact_response(response)? {
            Some(_) => Ok(()),
            // A 404 on PUT still means the write did not land.
            None => Err(Error::UnknownStatus {
                status: StatusCode::NOT_FOUND,
            }),
        }
    }

    fn handle_artifact_response(response: Response) -> Result<Option<Response>, Error> {
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN => Err(Error::CacheDisabled),
            status if status.is_success() => Ok(Some(response)),
            status => Err(Error::UnknownStatus { status }),
        }
    }
}
