//! Traits for the collaborators around the relay core.
//!
//! The dispatcher and the relay only see these seams; `TelegramChannel` and
//! `ChatGptBackend` are the production implementations.

use crate::feed::CompletionFeed;
use crate::message::{ConversationId, MessageId};
use async_trait::async_trait;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Channel not ready")]
    NotReady,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Connection(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

/// Sends and edits messages on the chat platform.
///
/// Retry policy, if any, lives in the implementation. Callers see failures
/// as-is.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a new message, optionally as a reply. Returns the new message id.
    async fn send_message(
        &self,
        chat: ConversationId,
        reply_to: Option<MessageId>,
        text: &str,
    ) -> ChannelResult<MessageId>;

    /// Replace the text of an existing message.
    async fn edit_message(
        &self,
        chat: ConversationId,
        message_id: MessageId,
        text: &str,
    ) -> ChannelResult<()>;

    /// Show the "typing" indicator.
    async fn send_typing(&self, chat: ConversationId) -> ChannelResult<()>;
}

/// Checks a continuation token against the backend.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> ChannelResult<()>;
}

/// Produces the answer to one user message as a lazy feed of fragments.
#[async_trait]
pub trait CompletionSource: TokenValidator {
    /// Start an answer. `continuation` is the conversation's token, `None`
    /// for a fresh dialogue.
    async fn send(
        &self,
        text: &str,
        conversation: ConversationId,
        continuation: Option<&str>,
    ) -> ChannelResult<CompletionFeed>;
}

/// Writes a renewed continuation token somewhere it survives a restart.
///
/// Tokens are stored per conversation; persisting one chat's token must not
/// affect any other chat.
pub trait TokenPersister: Send + Sync {
    fn persist_token(&self, conversation: ConversationId, token: &str) -> anyhow::Result<()>;
}

impl TokenPersister for relay_common::ConfigFile {
    fn persist_token(&self, conversation: ConversationId, token: &str) -> anyhow::Result<()> {
        self.set_continuation_token(conversation.get(), token)?;
        Ok(())
    }
}
