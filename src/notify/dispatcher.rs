//! Trace notification dispatch
//!
//! One dispatch call fans a captured trace out to every configured
//! integration. Platform failures are logged and skipped so a single broken
//! integration cannot silence the others; only storage failures bubble up,
//! because those are worth retrying from the queue.

use crate::config::NotifyConfig;
use crate::metrics;
use crate::notify::message::render_message;
use crate::notify::notifier::NotifierRegistry;
use crate::store::entities::TraceDetail;
use crate::store::ApmStore;
use std::time::Duration;

pub struct Dispatcher {
    store: ApmStore,
    registry: NotifierRegistry,
    admin_base_url: String,
    trace_lookup_retries: u32,
}

impl Dispatcher {
    pub fn new(store: ApmStore, registry: NotifierRegistry, config: &NotifyConfig) -> Self {
        Self {
            store,
            registry,
            admin_base_url: config.admin_base_url.clone(),
            trace_lookup_retries: config.trace_lookup_retries,
        }
    }

    /// Notify every configured integration about one captured trace.
    pub async fn dispatch(&self, trace_id: &str) -> Result<(), sqlx::Error> {
        let Some(detail) = self.load_trace(trace_id).await? else {
            tracing::error!(
                level = "CRITICAL",
                trace_id,
                "Error trace never became visible, notification abandoned"
            );
            metrics::record_dispatch_abandoned("trace_missing");
            return Ok(());
        };

        let integrations = self.store.list_integrations().await?;
        if integrations.is_empty() {
            tracing::error!(
                level = "CRITICAL",
                trace_id,
                "No integrations found! Error trace will not be notified"
            );
            metrics::record_dispatch_abandoned("no_integrations");
            return Ok(());
        }

        let message = render_message(&self.admin_base_url, &detail);

        for integration in &integrations {
            let Some(factory) = self.registry.get(&integration.platform) else {
                tracing::error!(
                    level = "CRITICAL",
                    platform = %integration.platform,
                    trace_id,
                    "No notifier registered for platform"
                );
                metrics::record_notification(&integration.platform, "unregistered");
                continue;
            };

            let receivers = self.store.receivers_for(integration.id).await?;
            let notifier = factory.make(integration, receivers);

            match notifier.notify_error(&message, &detail.trace).await {
                Ok(()) => {
                    tracing::info!(
                        platform = %integration.platform,
                        trace_id,
                        "Error notification delivered"
                    );
                    metrics::record_notification(&integration.platform, "delivered");
                }
                Err(err) => {
                    tracing::error!(
                        level = "CRITICAL",
                        platform = %integration.platform,
                        trace_id,
                        error = %err,
                        detail = err.detail.as_deref().unwrap_or(""),
                        "Failed to notify integration"
                    );
                    metrics::record_notification(&integration.platform, "failed");
                }
            }
        }

        Ok(())
    }

    /// The trace row can land after the dispatch request when capture and
    /// dispatch race, so absent rows are re-checked a few times before
    /// giving up.
    async fn load_trace(&self, trace_id: &str) -> Result<Option<TraceDetail>, sqlx::Error> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(detail) = self.store.get_trace_detail(trace_id).await? {
                return Ok(Some(detail));
            }
            if attempt >= self.trace_lookup_retries {
                return Ok(None);
            }
            attempt += 1;
            tracing::warn!(trace_id, attempt, "Trace not visible yet, retrying lookup");
            tokio::time::sleep(lookup_backoff(attempt)).await;
        }
    }
}

/// 50ms, 100ms, 200ms... capped at 1s
fn lookup_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(5);
    Duration::from_millis((50u64 << shift).min(1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::current_millis;
    use crate::notify::notifier::{NotificationFailed, Notifier, NotifierFactory};
    use crate::store::entities::{
        ApiRequest, ErrorTrace, Integration, NotificationReceiver, ReceiverKind, RequestLogRecord,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records delivered messages instead of calling a platform
    struct RecordingNotifier {
        delivered: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_error(
            &self,
            message: &str,
            _trace: &ErrorTrace,
        ) -> Result<(), NotificationFailed> {
            if self.fail {
                return Err(NotificationFailed::new("refused"));
            }
            self.delivered.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct RecordingFactory {
        platform: &'static str,
        delivered: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl RecordingFactory {
        fn new(platform: &'static str) -> (Self, Arc<Mutex<Vec<String>>>) {
            let delivered = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    platform,
                    delivered: delivered.clone(),
                    fail: false,
                },
                delivered,
            )
        }

        fn failing(platform: &'static str) -> Self {
            Self {
                platform,
                delivered: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            }
        }
    }

    impl NotifierFactory for RecordingFactory {
        fn platform(&self) -> &str {
            self.platform
        }

        fn make(
            &self,
            _integration: &Integration,
            _receivers: Vec<NotificationReceiver>,
        ) -> Box<dyn Notifier> {
            Box::new(RecordingNotifier {
                delivered: self.delivered.clone(),
                fail: self.fail,
            })
        }
    }

    fn test_config() -> NotifyConfig {
        NotifyConfig {
            trace_lookup_retries: 0,
            admin_base_url: "http://apm.test/apm".to_string(),
            ..NotifyConfig::default()
        }
    }

    async fn store_with_trace(trace_id: &str) -> ApmStore {
        let store = ApmStore::connect("sqlite::memory:").await.unwrap();
        seed_trace(&store, trace_id).await;
        store
    }

    async fn seed_trace(store: &ApmStore, trace_id: &str) {
        let now = current_millis();
        store
            .create_request_if_absent(&ApiRequest {
                id: trace_id.to_string(),
                headers: None,
                query_parameters: None,
                query_string: None,
                handler: "polls.api.poll_detail".to_string(),
                method: "GET".to_string(),
                path: "/polls/7/".to_string(),
                user_id: None,
                requested_at: now,
            })
            .await
            .unwrap();
        store
            .create_trace_if_absent(&ErrorTrace {
                request_id: trace_id.to_string(),
                payload: None,
                exception_class: "ValueError".to_string(),
                exception_args: "boom".to_string(),
                traceback: "frame-1\nframe-2".to_string(),
                created_at: now,
                dismissed_at: None,
                dismissed_by: None,
            })
            .await
            .unwrap();
        store
            .insert_logs_batch(&[RequestLogRecord {
                trace_id: trace_id.to_string(),
                level: "INFO".to_string(),
                file_path: "api.rs:10".to_string(),
                func_name: "poll_detail".to_string(),
                timestamp: now,
                message: "fetching poll".to_string(),
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_delivers_rendered_message_per_integration() {
        let store = store_with_trace("req-1").await;
        let id = store.add_integration("slack", "tok", None).await.unwrap();
        store
            .add_receiver(id, ReceiverKind::Id, "C1")
            .await
            .unwrap();

        let (factory, delivered) = RecordingFactory::new("slack");
        let registry = NotifierRegistry::empty().with(Arc::new(factory));
        let dispatcher = Dispatcher::new(store, registry, &test_config());

        dispatcher.dispatch("req-1").await.unwrap();

        let messages = delivered.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Request ID: `req-1`"));
        assert!(messages[0].contains("http://apm.test/apm/traces/req-1"));
        assert!(messages[0].contains("fetching poll"));
    }

    #[tokio::test]
    async fn test_dispatch_continues_after_a_platform_failure() {
        let store = store_with_trace("req-1").await;
        store.add_integration("discord", "tok", None).await.unwrap();
        store.add_integration("slack", "tok", None).await.unwrap();

        let (slack, delivered) = RecordingFactory::new("slack");
        let registry = NotifierRegistry::empty()
            .with(Arc::new(RecordingFactory::failing("discord")))
            .with(Arc::new(slack));
        let dispatcher = Dispatcher::new(store, registry, &test_config());

        dispatcher.dispatch("req-1").await.unwrap();

        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_integrations_is_a_no_op() {
        let store = store_with_trace("req-1").await;
        let registry = NotifierRegistry::empty();
        let dispatcher = Dispatcher::new(store, registry, &test_config());

        dispatcher.dispatch("req-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_gives_up_on_a_missing_trace() {
        let store = ApmStore::connect("sqlite::memory:").await.unwrap();
        store.add_integration("slack", "tok", None).await.unwrap();

        let (factory, delivered) = RecordingFactory::new("slack");
        let registry = NotifierRegistry::empty().with(Arc::new(factory));
        let dispatcher = Dispatcher::new(store, registry, &test_config());

        dispatcher.dispatch("req-missing").await.unwrap();

        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_skips_unregistered_platforms() {
        let store = store_with_trace("req-1").await;
        store.add_integration("slack", "tok", None).await.unwrap();
        store.add_integration("teams", "tok", None).await.unwrap();

        let (factory, delivered) = RecordingFactory::new("slack");
        let registry = NotifierRegistry::empty().with(Arc::new(factory));
        let dispatcher = Dispatcher::new(store, registry, &test_config());

        dispatcher.dispatch("req-1").await.unwrap();

        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_backoff_grows_and_caps() {
        assert_eq!(lookup_backoff(1), Duration::from_millis(50));
        assert_eq!(lookup_backoff(2), Duration::from_millis(100));
        assert_eq!(lookup_backoff(5), Duration::from_millis(800));
        assert_eq!(lookup_backoff(20), Duration::from_millis(1_000));
    }
}
