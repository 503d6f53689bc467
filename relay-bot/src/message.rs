//! Message types shared by the transport, dispatcher and relay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform message id (Telegram `message_id`).
pub type MessageId = i64;

/// Identifies one chat thread. It is the only key into the session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl ConversationId {
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for ConversationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat type as reported by Telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    /// Parse Telegram's `chat.type` field.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            "supergroup" => Some(Self::Supergroup),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Supergroup => "supergroup",
            Self::Channel => "channel",
        }
    }

    /// Group chats where the bot only answers when mentioned.
    pub const fn is_multi_party(&self) -> bool {
        matches!(self, Self::Group | Self::Supergroup)
    }
}

/// An inbound text message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id, used as the reply target
    pub message_id: MessageId,
    /// Chat the message was posted in
    pub conversation: ConversationId,
    pub chat_kind: ChatKind,
    /// Sender's user id (absent for channel posts)
    pub sender_id: Option<i64>,
    pub sender_username: Option<String>,
    pub text: String,
    /// Timestamp (Unix millis)
    pub timestamp: i64,
    /// Trace id for correlating logs across the turn
    pub trace_id: String,
}

impl InboundMessage {
    /// Build a message with a fresh trace id and the current timestamp.
    pub fn new(
        message_id: MessageId,
        conversation: ConversationId,
        chat_kind: ChatKind,
        sender_id: Option<i64>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            conversation,
            chat_kind,
            sender_id,
            sender_username: None,
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            trace_id: relay_common::logging::generate_trace_id(),
        }
    }

    /// Set the sender's username.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.sender_username = Some(username.into());
        self
    }

    /// Check if the message is a slash command.
    pub fn is_command(&self) -> bool {
        self.text.starts_with('/')
    }
}
