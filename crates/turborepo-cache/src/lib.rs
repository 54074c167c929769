//! Content-addressed caching of task outputs.
//!
//! A cache artifact is a zstd-compressed tar keyed by task hash. The
//! `cache_archive` module creates and restores archives; `fs` and `http`
//! are the two storage tiers; `multiplexer` composes them; `AsyncCache`
//! fronts the whole thing with a bounded write-behind worker pool.
#![cfg_attr(error_generic_member_access, feature(error_generic_member_access))]

/// Write-behind wrapper over the multiplexer.
mod async_cache;
/// Archive creation and restoration.
pub mod cache_archive;
/// Local disk tier.
pub mod fs;
/// Remote tier over the cache API.
pub mod http;
/// Ordered composition of the tiers.
pub mod multiplexer;
/// HMAC tagging of uploaded artifacts.
pub mod signature_authentication;

use std::backtrace::Backtrace;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature_authentication::SignatureError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error, Backtrace),
    #[error("invalid file path: {0}")]
    PathError(#[from] turbopath::PathError, Backtrace),
    #[error("cannot untar file to {0}")]
    InvalidFilePath(String, Backtrace),
    #[error("file name is not Windows-safe: {0}")]
    WindowsUnsafeName(String, Backtrace),
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType, Backtrace),
    #[error("attempted to create unsupported file type")]
    CreateUnsupportedFileType(Backtrace),
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String, Backtrace),
    #[error("links in the cache are cyclic")]
    CycleDetected(Backtrace),
    #[error("link target does not exist: {0}")]
    LinkTargetDoesNotExist(String, Backtrace),
    #[error("artifact integrity check failed for {0}")]
    CorruptArtifact(String),
    #[error("tar file is malformed")]
    MalformedTar(Backtrace),
    #[error("artifact verification failed: downloaded artifact is missing the x-artifact-tag header")]
    ArtifactTagMissing(Backtrace),
    #[error("invalid artifact verification tag")]
    InvalidTag(Backtrace),
    #[error("signing artifact failed: {0}")]
    SignatureError(#[from] SignatureError, Backtrace),
    #[error("invalid duration header")]
    InvalidDuration(Backtrace),
    #[error("invalid cache metadata file")]
    InvalidMetadata(serde_json::Error, Backtrace),
    #[error("failed to contact remote cache: {0}")]
    ApiClientError(#[from] turborepo_api_client::Error, Backtrace),
    #[error("unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

/// Where a hit came from and how long the original execution took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheOpts {
    pub cache_dir: Utf8PathBuf,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    pub workers: u32,
    pub remote_cache_opts: Option<RemoteCacheOpts>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCacheOpts {
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub signature: bool,
}
