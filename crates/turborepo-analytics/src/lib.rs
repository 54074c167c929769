//! Fire-and-forget batching of cache usage events.
//!
//! Producers drop events into an unbounded channel and move on. A single
//! worker task owns all batching state: it flushes as soon as ten events
//! are buffered, or 200ms after the first unflushed event arrived,
//! whichever comes first. Closing the handle drains whatever is left;
//! delivery failures are logged and swallowed.

use std::time::Duration;

use futures::{stream::FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;
use turborepo_api_client::{
    analytics::{AnalyticsClient, AnalyticsEvent},
    APIAuth,
};
use uuid::Uuid;

const BUFFER_THRESHOLD: usize = 10;

const FLUSH_TIMEOUT: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to send analytics event")]
    Send(#[from] mpsc::error::SendError<AnalyticsEvent>),
    #[error("failed to shut down analytics worker")]
    Join(#[from] tokio::task::JoinError),
}

pub type AnalyticsSender = mpsc::UnboundedSender<AnalyticsEvent>;

/// Handle owned by the run driver; dropping the exit channel tells the
/// worker to drain and stop.
pub struct AnalyticsHandle {
    exit_ch: oneshot::Receiver<()>,
    handle: JoinHandle<()>,
}

/// Spawns the batching worker. The sender may be cloned freely across
/// threads; the handle is unique and used to shut the worker down.
pub fn start_analytics(
    api_auth: APIAuth,
    client: impl AnalyticsClient + Clone + Send + Sync + 'static,
) -> (AnalyticsSender, AnalyticsHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let worker = Worker {
        rx,
        buffer: Vec::new(),
        session_id: Uuid::new_v4(),
        api_auth,
        client,
        in_flight: FuturesUnordered::new(),
        exit_ch: exit_tx,
    };
    let handle = AnalyticsHandle {
        exit_ch: exit_rx,
        handle: worker.start(),
    };
    (tx, handle)
}

impl AnalyticsHandle {
    async fn close(self) -> Result<(), Error> {
        drop(self.exit_ch);
        self.handle.await?;
        Ok(())
    }

    /// Bounds shutdown so a wedged network cannot hold the process open.
    pub async fn close_with_timeout(self) {
        if let Err(err) = tokio::time::timeout(FLUSH_TIMEOUT, self.close()).await {
            debug!("failed to close analytics worker: {err}");
        }
    }
}

struct Worker<C> {
    rx: mpsc::UnboundedReceiver<AnalyticsEvent>,
    buffer: Vec<AnalyticsEvent>,
    session_id: Uuid,
    api_auth: APIAuth,
    client: C,
    in_flight: FuturesUnordered<JoinHandle<()>>,
    exit_ch: oneshot::Sender<()>,
}

impl<C: AnalyticsClient + Clone + Send + Sync + 'static> Worker<C> {
    fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Set when the buffer holds unflushed events.
            let mut deadline: Option<Instant> = None;
            loop {
                let flush_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));
                select! {
                    // Drain incoming events before reacting to shutdown.
                    biased;
                    event = self.rx.recv() => {
                        match event {
                            Some(event) => self.buffer.push(event),
                            // All senders dropped.
                            None => break,
                        }
                        if self.buffer.len() >= BUFFER_THRESHOLD {
                            self.flush();
                            deadline = None;
                        } else {
                            deadline.get_or_insert_with(|| Instant::now() + FLUSH_TIMEOUT);
                        }
                    }
                    _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                        self.flush();
                        deadline = None;
                    }
                    _ = self.exit_ch.closed() => break,
                }
            }
            self.flush();
            while let Some(result) = self.in_flight.next().await {
                if let Err(err) = result {
                    debug!("analytics delivery task panicked: {err}");
                }
            }
        })
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut events = std::mem::take(&mut self.buffer);
        for event in &mut events {
            event.set_session_id(self.session_id.to_string());
        }
        let client = self.client.clone();
        let api_auth = self.api_auth.clone();
        self.in_flight.push(tokio::spawn(async move {
            match tokio::time::timeout(REQUEST_TIMEOUT, client.record_analytics(&api_auth, events))
                .await
            {
                Ok(Err(err)) => debug!("failed to record cache usage analytics: {err}"),
                // Timeouts are expected when offline; stay quiet.
                _ => (),
            }
        }));
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use turborepo_api_client::analytics::{CacheEvent, CacheSource};

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingClient {
        batches: Arc<Mutex<Vec<Vec<AnalyticsEvent>>>>,
    }

    impl RecordingClient {
        fn batches(&self) -> Vec<Vec<AnalyticsEvent>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl AnalyticsClient for RecordingClient {
        async fn record_analytics(
            &self,
            _api_auth: &APIAuth,
            events: Vec<AnalyticsEvent>,
        ) -> Result<(), turborepo_api_client::Error> {
            self.batches.lock().unwrap().push(events);
            Ok(())
        }
    }

    fn auth() -> APIAuth {
        APIAuth {
            token: "token".to_string(),
            team_id: Some("team".to_string()),
            team_slug: None,
        }
    }

    fn hit() -> AnalyticsEvent {
        AnalyticsEvent {
            session_id: None,
            source: CacheSource::Local,
            event: CacheEvent::Hit,
            hash: "hash".to_string(),
            duration: 0,
        }
    }

    #[tokio::test]
    async fn test_flush_on_timeout() {
        let client = RecordingClient::default();
        let (tx, handle) = start_analytics(auth(), client.clone());

        for _ in 0..3 {
            tx.send(hit()).unwrap();
        }
        assert!(client.batches().is_empty());

        tokio::time::sleep(FLUSH_TIMEOUT + Duration::from_millis(100)).await;
        let batches = client.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert!(batches[0].iter().all(|e| e.session_id.is_some()));

        handle.close_with_timeout().await;
    }

    #[tokio::test]
    async fn test_flush_on_threshold() {
        let client = RecordingClient::default();
        let (tx, handle) = start_analytics(auth(), client.clone());

        for _ in 0..BUFFER_THRESHOLD {
            tx.send(hit()).unwrap();
        }
        // Well before the flush timeout the full batch has been sent.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let batches = client.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), BUFFER_THRESHOLD);

        handle.close_with_timeout().await;
    }

    #[tokio::test]
    async fn test_close_drains_buffer() {
        let client = RecordingClient::default();
        let (tx, handle) = start_analytics(auth(), client.clone());

        tx.send(hit()).unwrap();
        tx.send(hit()).unwrap();
        handle.close_with_timeout().await;

        let batches = client.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }
}
