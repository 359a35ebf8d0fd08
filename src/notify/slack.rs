//! Slack notifier
//!
//! Talks to the Slack Web API. Receivers configured by id post directly;
//! receivers configured by name are resolved through `conversations.list`
//! first. Slack answers HTTP 200 even for failed calls, so the `ok` flag in
//! the response envelope is the delivery signal.

use crate::notify::notifier::{truncate_chars, NotificationFailed, Notifier, NotifierFactory};
use crate::store::entities::{ErrorTrace, Integration, NotificationReceiver, ReceiverKind};
use async_trait::async_trait;
use serde::Deserialize;

pub const PLATFORM: &str = "slack";

const DEFAULT_BASE_URL: &str = "https://slack.com/api";

/// Slack caps chat messages at 40k characters
const MAX_MESSAGE_CHARS: usize = 40_000;

/// Builds Slack notifiers bound to an integration's bot token
pub struct SlackFactory {
    client: reqwest::Client,
    base_url: String,
}

impl SlackFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, DEFAULT_BASE_URL)
    }

    /// Point the factory at a different API root. Used by tests.
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl NotifierFactory for SlackFactory {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn make(
        &self,
        integration: &Integration,
        receivers: Vec<NotificationReceiver>,
    ) -> Box<dyn Notifier> {
        Box::new(SlackNotifier {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: integration.token.clone(),
            receivers,
        })
    }
}

struct SlackNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
    receivers: Vec<NotificationReceiver>,
}

#[derive(Debug, Deserialize)]
struct ConversationList {
    ok: bool,
    #[serde(default)]
    channels: Vec<Conversation>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Conversation {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PostMessageEnvelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify_error(
        &self,
        message: &str,
        trace: &ErrorTrace,
    ) -> Result<(), NotificationFailed> {
        let message = truncate_chars(message, MAX_MESSAGE_CHARS);
        for receiver in &self.receivers {
            let channel_id = match receiver.kind {
                ReceiverKind::Id => receiver.target.clone(),
                ReceiverKind::Name => self.lookup_channel_id(&receiver.target).await?,
            };
            self.post_message(&channel_id, message).await?;
            tracing::debug!(
                trace_id = %trace.request_id,
                channel = %channel_id,
                "Posted error notification to Slack"
            );
        }
        Ok(())
    }
}

impl SlackNotifier {
    /// Resolve a channel name through `conversations.list`
    async fn lookup_channel_id(&self, name: &str) -> Result<String, NotificationFailed> {
        let response = self
            .client
            .get(format!("{}/conversations.list", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| NotificationFailed::with_detail("Unable to reach Slack", e.to_string()))?;

        let list: ConversationList = response.json().await.map_err(|e| {
            NotificationFailed::with_detail(
                "Slack returned an unreadable conversation list",
                e.to_string(),
            )
        })?;

        if !list.ok {
            return Err(NotificationFailed::with_detail(
                "Unable to retrieve the conversation list",
                list.error.unwrap_or_default(),
            ));
        }

        list.channels
            .into_iter()
            .find(|channel| channel.name == name)
            .map(|channel| channel.id)
            .ok_or_else(|| {
                NotificationFailed::new(format!("The conversation/channel {name} does not exist"))
            })
    }

    async fn post_message(&self, channel: &str, text: &str) -> Result<(), NotificationFailed> {
        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&serde_json::json!({ "channel": channel, "text": text }))
            .send()
            .await
            .map_err(|e| NotificationFailed::with_detail("Unable to reach Slack", e.to_string()))?;

        let envelope: PostMessageEnvelope = response.json().await.map_err(|e| {
            NotificationFailed::with_detail("Slack returned an unreadable response", e.to_string())
        })?;

        if !envelope.ok {
            return Err(NotificationFailed::with_detail(
                format!("Unable to send the message to channel {channel}"),
                envelope.error.unwrap_or_default(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    fn integration(token: &str) -> Integration {
        Integration {
            id: 1,
            platform: PLATFORM.to_string(),
            token: token.to_string(),
            created_by: None,
        }
    }

    fn receiver(kind: ReceiverKind, target: &str) -> NotificationReceiver {
        NotificationReceiver {
            id: 1,
            integration_id: 1,
            kind,
            target: target.to_string(),
        }
    }

    fn trace() -> ErrorTrace {
        ErrorTrace {
            request_id: "req-1".to_string(),
            payload: None,
            exception_class: "ValueError".to_string(),
            exception_args: "boom".to_string(),
            traceback: "tb".to_string(),
            created_at: 0,
            dismissed_at: None,
            dismissed_by: None,
        }
    }

    fn notifier_for(server: &MockServer, receivers: Vec<NotificationReceiver>) -> Box<dyn Notifier> {
        let factory = SlackFactory::with_base_url(reqwest::Client::new(), server.base_url());
        factory.make(&integration("xoxb-test"), receivers)
    }

    #[tokio::test]
    async fn test_posts_directly_to_receiver_configured_by_id() {
        let server = MockServer::start();
        let posted = server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        });

        let notifier = notifier_for(&server, vec![receiver(ReceiverKind::Id, "C123")]);
        notifier.notify_error("hello", &trace()).await.unwrap();

        posted.assert_calls(1);
    }

    #[tokio::test]
    async fn test_resolves_channel_name_before_posting() {
        let server = MockServer::start();
        let listed = server.mock(|when, then| {
            when.method(GET).path("/conversations.list");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"channels":[{"id":"C9","name":"alerts"},{"id":"C10","name":"general"}]}"#);
        });
        let posted = server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        });

        let notifier = notifier_for(&server, vec![receiver(ReceiverKind::Name, "alerts")]);
        notifier.notify_error("hello", &trace()).await.unwrap();

        listed.assert_calls(1);
        posted.assert_calls(1);
    }

    #[tokio::test]
    async fn test_unknown_channel_name_is_a_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/conversations.list");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"channels":[{"id":"C10","name":"general"}]}"#);
        });
        let posted = server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        });

        let notifier = notifier_for(&server, vec![receiver(ReceiverKind::Name, "alerts")]);
        let err = notifier.notify_error("hello", &trace()).await.unwrap_err();

        assert!(err.reason.contains("alerts does not exist"));
        posted.assert_calls(0);
    }

    #[tokio::test]
    async fn test_failed_listing_envelope_is_a_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/conversations.list");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":false,"error":"invalid_auth"}"#);
        });

        let notifier = notifier_for(&server, vec![receiver(ReceiverKind::Name, "alerts")]);
        let err = notifier.notify_error("hello", &trace()).await.unwrap_err();

        assert_eq!(err.reason, "Unable to retrieve the conversation list");
        assert_eq!(err.detail.as_deref(), Some("invalid_auth"));
    }

    #[tokio::test]
    async fn test_not_ok_post_envelope_is_a_failure() {
        // Slack reports delivery failures in the body, not the status code
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":false,"error":"channel_not_found"}"#);
        });

        let notifier = notifier_for(&server, vec![receiver(ReceiverKind::Id, "C404")]);
        let err = notifier.notify_error("hello", &trace()).await.unwrap_err();

        assert!(err.reason.contains("C404"));
        assert_eq!(err.detail.as_deref(), Some("channel_not_found"));
    }

    #[tokio::test]
    async fn test_first_failing_receiver_stops_the_rest() {
        let server = MockServer::start();
        let posted = server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":false,"error":"invalid_auth"}"#);
        });

        let notifier = notifier_for(
            &server,
            vec![
                receiver(ReceiverKind::Id, "C1"),
                receiver(ReceiverKind::Id, "C2"),
            ],
        );
        notifier.notify_error("hello", &trace()).await.unwrap_err();

        posted.assert_calls(1);
    }

    #[tokio::test]
    async fn test_delivered_receiver_stands_when_a_later_lookup_fails() {
        let server = MockServer::start();
        let posted = server.mock(|when, then| {
            when.method(POST).path("/chat.postMessage");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        });
        server.mock(|when, then| {
            when.method(GET).path("/conversations.list");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true,"channels":[{"id":"C10","name":"general"}]}"#);
        });

        let notifier = notifier_for(
            &server,
            vec![
                receiver(ReceiverKind::Id, "C1"),
                receiver(ReceiverKind::Name, "alerts"),
            ],
        );
        let err = notifier.notify_error("hello", &trace()).await.unwrap_err();

        assert!(err.reason.contains("alerts does not exist"));
        posted.assert_calls(1);
    }
}
