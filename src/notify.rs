//! Telegram notifications for enforcement actions.

use crate::config::LocalConfig;
use crate::enforcement::{Notifier, TransientError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Bot API envelope; only the status fields matter here
#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends alerts to one chat through the Telegram Bot API
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.trim().to_string(),
            chat_id: chat_id.trim().to_string(),
        })
    }

    /// Notifier for the local config, or `None` unless both the bot token
    /// and the chat id are set
    pub fn from_local(local: &LocalConfig, timeout: Duration) -> Result<Option<Self>, reqwest::Error> {
        if !local.notifications_enabled() {
            return Ok(None);
        }
        Self::new(&local.telegram_bot_token, &local.telegram_chat_id, timeout).map(Some)
    }

    /// Point at a different Bot API host
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<(), TransientError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransientError::Notification(e.without_url().to_string()))?;
        let status = response.status();
        let reply: TelegramResponse = response
            .json()
            .await
            .map_err(|e| TransientError::Notification(format!("{status}: {}", e.without_url())))?;

        if !reply.ok {
            return Err(TransientError::Notification(
                reply
                    .description
                    .unwrap_or_else(|| format!("sendMessage failed with {status}")),
            ));
        }

        debug!(chat_id = %self.chat_id, "sent Telegram alert");
        Ok(())
    }
}
