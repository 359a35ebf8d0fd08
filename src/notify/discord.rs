//! Discord notifier
//!
//! Talks to the Discord REST API with a bot token. Receivers configured by
//! name are resolved by walking the bot's guilds and listing each guild's
//! channels. Unlike Slack, Discord signals failure through the HTTP status
//! code.

use crate::notify::notifier::{truncate_chars, NotificationFailed, Notifier, NotifierFactory};
use crate::store::entities::{ErrorTrace, Integration, NotificationReceiver, ReceiverKind};
use async_trait::async_trait;
use serde::Deserialize;

pub const PLATFORM: &str = "discord";

const DEFAULT_BASE_URL: &str = "https://discord.com/api";

/// Discord caps message content at 2000 characters
const MAX_MESSAGE_CHARS: usize = 2_000;

/// Builds Discord notifiers bound to an integration's bot token
pub struct DiscordFactory {
    client: reqwest::Client,
    base_url: String,
}

impl DiscordFactory {
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

impl NotifierFactory for DiscordFactory {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn make(
        &self,
        integration: &Integration,
        receivers: Vec<NotificationReceiver>,
    ) -> Box<dyn Notifier> {
        Box::new(DiscordNotifier {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: integration.token.clone(),
            receivers,
        })
    }
}

struct DiscordNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
    receivers: Vec<NotificationReceiver>,
}

#[derive(Debug, Deserialize)]
struct Guild {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GuildChannel {
    id: String,
    name: String,
}

#[async_trait]
impl Notifier for DiscordNotifier {
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
                "Posted error notification to Discord"
            );
        }
        Ok(())
    }
}

impl DiscordNotifier {
    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// Find a channel by name across every guild the bot belongs to
    async fn lookup_channel_id(&self, name: &str) -> Result<String, NotificationFailed> {
        for guild_id in self.guild_ids().await? {
            let channels = self.guild_channels(&guild_id).await?;
            if let Some(channel) = channels.into_iter().find(|channel| channel.name == name) {
                return Ok(channel.id);
            }
        }
        Err(NotificationFailed::new(format!(
            "The channel {name} does not exist"
        )))
    }

    async fn guild_ids(&self) -> Result<Vec<String>, NotificationFailed> {
        let response = self
            .client
            .get(format!("{}/users/@me/guilds", self.base_url))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| {
                NotificationFailed::with_detail("Unable to reach Discord", e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotificationFailed::with_detail(
                format!("Unable to retrieve the guild list ({status})"),
                body,
            ));
        }

        let guilds: Vec<Guild> = response.json().await.map_err(|e| {
            NotificationFailed::with_detail("Discord returned an unreadable guild list", e.to_string())
        })?;
        Ok(guilds.into_iter().map(|guild| guild.id).collect())
    }

    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<GuildChannel>, NotificationFailed> {
        let response = self
            .client
            .get(format!("{}/guilds/{}/channels", self.base_url, guild_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| {
                NotificationFailed::with_detail("Unable to reach Discord", e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotificationFailed::with_detail(
                format!("Unable to list channels for guild {guild_id} ({status})"),
                body,
            ));
        }

        response.json().await.map_err(|e| {
            NotificationFailed::with_detail(
                "Discord returned an unreadable channel list",
                e.to_string(),
            )
        })
    }

    async fn post_message(&self, channel: &str, content: &str) -> Result<(), NotificationFailed> {
        let response = self
            .client
            .post(format!("{}/channels/{}/messages", self.base_url, channel))
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(|e| {
                NotificationFailed::with_detail("Unable to reach Discord", e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotificationFailed::with_detail(
                format!("Discord rejected the message for channel {channel} ({status})"),
                body,
            ));
        }

        Ok(())
    }
}
