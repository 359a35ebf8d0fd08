//! Notifier abstraction and platform registry
//!
//! A `Notifier` delivers one rendered error message to every receiver of a
//! single integration. A `NotifierFactory` binds a platform implementation
//! to an integration's credentials at dispatch time, and the
//! `NotifierRegistry` maps platform keys ("slack", "discord") to factories.
//! The dispatcher only ever talks to these traits, so new platforms plug in
//! without touching dispatch logic.

use crate::store::entities::{ErrorTrace, Integration, NotificationReceiver};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Delivery failure for a single integration.
///
/// The dispatcher treats this as non-fatal: the failure is logged and the
/// remaining integrations are still notified.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct NotificationFailed {
    /// Operator-readable reason
    pub reason: String,
    /// Raw platform response or transport error, when one was available
    pub detail: Option<String>,
}

impl NotificationFailed {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn with_detail(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: Some(detail.into()),
        }
    }
}

/// A notifier bound to one integration's credentials and receivers
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `message` to every receiver of the bound integration.
    ///
    /// The first failing receiver aborts the remaining ones for this
    /// integration; other integrations are unaffected.
    async fn notify_error(
        &self,
        message: &str,
        trace: &ErrorTrace,
    ) -> Result<(), NotificationFailed>;
}

/// Builds notifiers for one chat platform
pub trait NotifierFactory: Send + Sync {
    /// Platform key served by this factory, lowercase ("slack")
    fn platform(&self) -> &str;

    /// Bind a notifier to an integration's token and its receivers
    fn make(
        &self,
        integration: &Integration,
        receivers: Vec<NotificationReceiver>,
    ) -> Box<dyn Notifier>;
}

/// Platform key -> factory map handed to the dispatcher at construction
pub struct NotifierRegistry {
    factories: HashMap<String, Arc<dyn NotifierFactory>>,
}

impl NotifierRegistry {
    /// Registry with no platforms registered
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in Slack and Discord factories, sharing one
    /// HTTP client
    pub fn builtin(client: reqwest::Client) -> Self {
        Self::empty()
            .with(Arc::new(crate::notify::slack::SlackFactory::new(
                client.clone(),
            )))
            .with(Arc::new(crate::notify::discord::DiscordFactory::new(
                client,
            )))
    }

    /// Register a factory, replacing any previous one for the same platform
    pub fn with(mut self, factory: Arc<dyn NotifierFactory>) -> Self {
        self.factories
            .insert(factory.platform().to_string(), factory);
        self
    }

    pub fn get(&self, platform: &str) -> Option<&dyn NotifierFactory> {
        self.factories.get(platform).map(|factory| factory.as_ref())
    }

    /// Registered platform keys, sorted for stable output
    pub fn platforms(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

/// Cut `message` at a platform's character limit without splitting a UTF-8
/// code point.
pub(crate) fn truncate_chars(message: &str, max_chars: usize) -> &str {
    match message.char_indices().nth(max_chars) {
        Some((index, _)) => &message[..index],
        None => message,
    }
}
