//! Changed-outputs hints from the file-watching daemon.
//!
//! The daemon is an external collaborator; only its interface lives here.
//! When it is absent or misbehaving the engine assumes every output glob
//! changed, which is always safe; it just means a cache lookup happens.

use std::collections::HashSet;

use futures::future::BoxFuture;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
#[error("daemon rpc failed: {0}")]
pub struct DaemonError(pub String);

/// The two calls the engine makes against the daemon.
pub trait ChangedOutputsClient: Send + Sync {
    /// Which of `output_globs` have changed on disk since the last time
    /// this hash's outputs were recorded as written.
    fn get_changed_outputs<'a>(
        &'a self,
        hash: &'a str,
        output_globs: &'a [String],
    ) -> BoxFuture<'a, Result<HashSet<String>, DaemonError>>;

    /// Tells the daemon a fresh set of outputs for `hash` is on disk.
    fn notify_outputs_written<'a>(
        &'a self,
        hash: &'a str,
        output_globs: &'a [String],
        output_exclusion_globs: &'a [String],
        time_saved: u64,
    ) -> BoxFuture<'a, Result<(), DaemonError>>;
}

/// Facade the run cache talks to. Degrades to "everything changed" when
/// no daemon is connected or a call fails.
#[derive(Clone, Default)]
pub struct OutputHints {
    client: Option<std::sync::Arc<dyn ChangedOutputsClient>>,
}

impl OutputHints {
    pub fn connected(client: std::sync::Arc<dyn ChangedOutputsClient>) -> Self {
        Self {
            client: Some(client),
        }
    }

    pub fn disconnected() -> Self {
        Self { client: None }
    }

    /// `None` means "assume all globs changed".
    pub async fn changed_outputs(
        &self,
        hash: &str,
        output_globs: &[String],
    ) -> Option<HashSet<String>> {
        let client = self.client.as_ref()?;
        let globs: Vec<String> = output_globs.iter().map(|g| escape_glob(g)).collect();
        match client.get_changed_outputs(hash, &globs).await {
            Ok(changed) => Some(changed),
            Err(e) => {
                warn!("failed to check if we can skip restoring outputs for {hash}: {e}");
                None
            }
        }
    }

    pub async fn notify_outputs_written(
        &self,
        hash: &str,
        output_globs: &[String],
        output_exclusion_globs: &[String],
        time_saved: u64,
    ) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let inclusions: Vec<String> = output_globs.iter().map(|g| escape_glob(g)).collect();
        let exclusions: Vec<String> = output_exclusion_globs
            .iter()
            .map(|g| escape_glob(g))
            .collect();
        if let Err(e) = client
            .notify_outputs_written(hash, &inclusions, &exclusions, time_saved)
            .await
        {
            // Not fatal, the next run will just check the cache.
            warn!("failed to mark outputs as cached for {hash}: {e}");
        }
    }
}

/// Globs crossing the daemon boundary are unix-style and must have `:`
/// escaped, since the wire format uses it as a separator.
fn escape_glob(glob: &str) -> String {
    glob.replace(':', "\\:")
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    struct FailingClient;

    impl ChangedOutputsClient for FailingClient {
        fn get_changed_outputs<'a>(
            &'a self,
            _hash: &'a str,
            _output_globs: &'a [String],
        ) -> BoxFuture<'a, Result<HashSet<String>, DaemonError>> {
            Box::pin(async { Err(DaemonError("connection refused".to_string())) })
        }

        fn notify_outputs_written<'a>(
            &'a self,
            _hash: &'a str,
            _output_globs: &'a [String],
            _output_exclusion_globs: &'a [String],
            _time_saved: u64,
        ) -> BoxFuture<'a, Result<(), DaemonError>> {
            Box::pin(async { Err(DaemonError("connection refused".to_string())) })
        }
    }

    struct RecordingClient {
        saw_escaped: AtomicBool,
    }

    impl ChangedOutputsClient for RecordingClient {
        fn get_changed_outputs<'a>(
            &'a self,
            _hash: &'a str,
            output_globs: &'a [String],
        ) -> BoxFuture<'a, Result<HashSet<String>, DaemonError>> {
            self.saw_escaped.store(
                output_globs.iter().any(|g| g.contains("\\:")),
                Ordering::SeqCst,
            );
            Box::pin(async { Ok(HashSet::new()) })
        }

        fn notify_outputs_written<'a>(
            &'a self,
            _hash: &'a str,
            _output_globs: &'a [String],
            _output_exclusion_globs: &'a [String],
            _time_saved: u64,
        ) -> BoxFuture<'a, Result<(), DaemonError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_disconnected_means_all_changed() {
        let hints = OutputHints::disconnected();
        let changed = hints
            .changed_outputs("hash", &["dist/**".to_string()])
            .await;
        assert!(changed.is_none());
    }

    #[tokio::test]
    async fn test_rpc_error_means_all_changed() {
        let hints = OutputHints::connected(Arc::new(FailingClient));
        let changed = hints
            .changed_outputs("hash", &["dist/**".to_string()])
            .await;
        assert!(changed.is_none());
    }

    #[tokio::test]
    async fn test_colons_escaped_on_the_wire() {
        let client = Arc::new(RecordingClient {
            saw_escaped: AtomicBool::new(false),
        });
        let hints = OutputHints::connected(client.clone());
        let changed = hints
            .changed_outputs("hash", &["dist/with:colon/**".to_string()])
            .await;
        assert_eq!(changed, Some(HashSet::new()));
        assert!(client.saw_escaped.load(Ordering::SeqCst));
    }
}
