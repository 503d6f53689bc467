//! Telegram channel adapter.
//!
//! Provides the `TelegramChannel` implementation for receiving messages by
//! long-polling the Bot API and for sending, editing and typing through it.

use crate::message::{ChatKind, ConversationId, InboundMessage, MessageId};
use crate::traits::{ChannelError, ChannelResult, ChatTransport};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default Bot API endpoint.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram's hard limit on message text length, in characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll.
const POLL_BACKOFF: Duration = Duration::from_secs(5);

/// Longest `retry_after` worth waiting for inline. Anything above is surfaced
/// as `RateLimited`.
const MAX_INLINE_RETRY_SECS: u64 = 10;

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// The bot's own account, from `getMe`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Telegram channel - long-polls the Bot API for updates.
pub struct TelegramChannel {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Create a new Telegram channel.
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_api_base(bot_token, TELEGRAM_API_BASE)
    }

    /// Create a channel talking to a different Bot API server.
    pub fn with_api_base(bot_token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Call a Bot API method and return its `result`.
    ///
    /// A 429 is retried once when Telegram asks for a short enough pause.
    async fn call(&self, method: &str, body: &serde_json::Value) -> ChannelResult<serde_json::Value> {
        let mut retried = false;
        loop {
            let resp = self.client.post(self.api_url(method)).json(body).send().await?;
            let status = resp.status();
            let data: ApiResponse = resp.json().await.map_err(|e| {
                ChannelError::SendFailed(format!("Telegram {method} returned an invalid response ({status}): {e}"))
            })?;

            if data.ok {
                return Ok(data.result.unwrap_or(serde_json::Value::Null));
            }

            let code = data.error_code.unwrap_or(status.as_u16());
            let description = data.description.unwrap_or_else(|| status.to_string());

            match code {
                429 => {
                    let retry_after = data
                        .parameters
                        .and_then(|p| p.retry_after)
                        .unwrap_or(1);
                    if !retried && retry_after <= MAX_INLINE_RETRY_SECS {
                        tracing::warn!(method, retry_after, "Telegram rate limit hit, retrying");
                        retried = true;
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }
                    return Err(ChannelError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                }
                401 | 404 if method == "getMe" => {
                    return Err(ChannelError::Auth(format!("Invalid bot token: {description}")));
                }
                _ => {
                    return Err(ChannelError::SendFailed(format!(
                        "Telegram {method} failed: {description}"
                    )));
                }
            }
        }
    }

    /// Fetch the bot's own identity. Also verifies the token.
    pub async fn get_me(&self) -> ChannelResult<BotIdentity> {
        let result = self.call("getMe", &serde_json::json!({})).await?;
        let identity: BotIdentity = serde_json::from_value(result)
            .map_err(|e| ChannelError::Internal(format!("Unexpected getMe payload: {e}")))?;
        tracing::info!(
            bot_id = identity.id,
            username = identity.username.as_deref().unwrap_or(""),
            "Telegram channel initialized"
        );
        Ok(identity)
    }

    fn check_text(text: &str) -> ChannelResult<()> {
        if text.is_empty() {
            return Err(ChannelError::InvalidMessage("message text is empty".into()));
        }
        let len = text.chars().count();
        if len > MAX_MESSAGE_LEN {
            return Err(ChannelError::InvalidMessage(format!(
                "message is {len} characters, Telegram allows {MAX_MESSAGE_LEN}"
            )));
        }
        Ok(())
    }

    /// Long-poll for updates and forward text messages into `tx`.
    ///
    /// Returns when `cancel` fires or the receiver is dropped. Poll failures
    /// are logged and retried after a short pause.
    pub async fn listen(
        &self,
        tx: mpsc::Sender<InboundMessage>,
        cancel: &CancellationToken,
    ) -> ChannelResult<()> {
        let mut offset: i64 = 0;

        tracing::info!("Telegram channel listening for messages...");

        loop {
            let body = serde_json::json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"]
            });

            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.call("getUpdates", &body) => polled,
            };

            let updates = match polled {
                Ok(serde_json::Value::Array(updates)) => updates,
                Ok(other) => {
                    tracing::warn!(payload = %other, "Telegram getUpdates returned a non-array result");
                    Vec::new()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Telegram poll error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_BACKOFF) => continue,
                    }
                }
            };

            for update in &updates {
                if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64) {
                    offset = offset.max(uid + 1);
                }

                let Some(msg) = parse_update(update) else {
                    continue;
                };

                tracing::info!(
                    trace_id = %msg.trace_id,
                    conversation = %msg.conversation,
                    message_id = msg.message_id,
                    chat_kind = msg.chat_kind.as_str(),
                    sender_id = ?msg.sender_id,
                    text = %relay_common::util::sanitize_for_log(&msg.text),
                    "Telegram message received"
                );

                if tx.send(msg).await.is_err() {
                    tracing::debug!("Inbound receiver dropped, stopping poll loop");
                    return Ok(());
                }
            }
        }

        tracing::info!("Telegram channel stopped listening");
        Ok(())
    }
}

/// Extract a text message from one `getUpdates` entry.
///
/// Updates without text (stickers, joins, edits, ...) yield `None`.
pub fn parse_update(update: &serde_json::Value) -> Option<InboundMessage> {
    let message = update.get("message")?;
    let text = message.get("text")?.as_str()?;
    let message_id = message.get("message_id")?.as_i64()?;

    let chat = message.get("chat")?;
    let chat_id = chat.get("id")?.as_i64()?;
    let chat_kind = chat
        .get("type")
        .and_then(serde_json::Value::as_str)
        .and_then(ChatKind::parse)?;

    let from = message.get("from");
    let sender_id = from
        .and_then(|f| f.get("id"))
        .and_then(serde_json::Value::as_i64);
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(serde_json::Value::as_str);

    let msg = InboundMessage::new(message_id, ConversationId(chat_id), chat_kind, sender_id, text);
    Some(match username {
        Some(name) => msg.with_username(name),
        None => msg,
    })
}

#[async_trait]
impl ChatTransport for TelegramChannel {
    async fn send_message(
        &self,
        chat: ConversationId,
        reply_to: Option<MessageId>,
        text: &str,
    ) -> ChannelResult<MessageId> {
        Self::check_text(text)?;

        let mut body = serde_json::json!({
            "chat_id": chat.get(),
            "text": text,
        });
        if let Some(reply_to) = reply_to {
            body["reply_to_message_id"] = serde_json::json!(reply_to);
        }

        let result = self.call("sendMessage", &body).await?;
        result
            .get("message_id")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| ChannelError::SendFailed("sendMessage result has no message_id".into()))
    }

    async fn edit_message(
        &self,
        chat: ConversationId,
        message_id: MessageId,
        text: &str,
    ) -> ChannelResult<()> {
        Self::check_text(text)?;

        let body = serde_json::json!({
            "chat_id": chat.get(),
            "message_id": message_id,
            "text": text,
        });
        self.call("editMessageText", &body).await?;
        tracing::debug!(conversation = %chat, message_id, "Edited Telegram message");
        Ok(())
    }

    async fn send_typing(&self, chat: ConversationId) -> ChannelResult<()> {
        let body = serde_json::json!({
            "chat_id": chat.get(),
            "action": "typing",
        });
        self.call("sendChatAction", &body).await?;
        Ok(())
    }
}
