//! Cache usage analytics payloads and the client trait the batcher is
//! generic over.

use serde::Serialize;

use crate::{APIAuth, APIClient, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheEvent {
    Hit,
    Miss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub source: CacheSource,
    pub event: CacheEvent,
    pub hash: String,
    pub duration: u64,
}

impl AnalyticsEvent {
    pub fn set_session_id(&mut self, id: String) {
        self.session_id = Some(id);
    }
}

/// Anything that can deliver a batch of analytics events. The production
/// implementation posts to the remote cache API; tests substitute an
/// in-memory sink.
pub trait AnalyticsClient {
    fn record_analytics(
        &self,
        api_auth: &APIAuth,
        events: Vec<AnalyticsEvent>,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send;
}

impl AnalyticsClient for APIClient {
    async fn record_analytics(
        &self,
        api_auth: &APIAuth,
        events: Vec<AnalyticsEvent>,
    ) -> Result<(), Error> {
        let response = self
            .client
            .post(format!("{}/v8/artifacts/events", self.base_url))
            .bearer_auth(&api_auth.token)
            .json(&events)
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AnalyticsEvent {
            session_id: Some("session".to_string()),
            source: CacheSource::Local,
            event: CacheEvent::Hit,
            hash: "beefcafebeefcafe".to_string(),
            duration: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sessionId": "session",
                "source": "LOCAL",
                "event": "HIT",
                "hash": "beefcafebeefcafe",
                "duration": 42,
            })
        );
    }

    #[test]
    fn test_session_id_omitted_when_unset() {
        let event = AnalyticsEvent {
            session_id: None,
            source: CacheSource::Remote,
            event: CacheEvent::Miss,
            hash: "0".repeat(16),
            duration: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("sessionId"));
    }
}
