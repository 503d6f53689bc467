//! Live output relay: mirrors a growing answer into one chat message.
//!
//! The first non-empty fragment creates the reply message. Later fragments are
//! accumulated and the message is edited with the full text, at most once per
//! `min_edit_interval`. When the feed ends, one final edit bypasses the
//! throttle so the message always shows the complete answer.
//!
//! Edits carrying the same text as the previous edit are never sent.

use crate::feed::{CompletionFeed, FeedEvent};
use crate::message::{ConversationId, MessageId};
use crate::traits::{ChannelError, ChatTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error returned by a relay run.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The feed ended before producing any text.
    #[error("the backend returned an empty answer")]
    EmptyFeed,

    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Transport(#[from] ChannelError),

    #[error("relay cancelled")]
    Cancelled,
}

/// Outcome of a completed relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    /// The message the answer was written into
    pub message_id: MessageId,
    /// Edits issued after the initial send
    pub edits: usize,
    /// Full answer text
    pub text: String,
    /// Continuation token handed back by the backend
    pub continuation: Option<String>,
}

/// Per-turn relay state.
///
/// Owned by exactly one relay task, so it carries no lock.
#[derive(Debug, Clone, Default)]
pub struct RelayState {
    pub target_message_id: Option<MessageId>,
    pub accumulated_text: String,
    pub last_edit_at: Option<Instant>,
    pub last_edited_text: String,
}

impl RelayState {
    /// Text appended since the last edit (or the initial send).
    fn has_pending(&self) -> bool {
        self.target_message_id.is_some() && self.accumulated_text != self.last_edited_text
    }

    /// Earliest instant the next throttled edit may go out.
    fn next_edit_at(&self, interval: Duration) -> Instant {
        match self.last_edit_at {
            Some(at) => at + interval,
            None => Instant::now(),
        }
    }
}

/// Streams one completion feed into one chat message.
pub struct LiveOutputRelay {
    transport: Arc<dyn ChatTransport>,
    conversation: ConversationId,
    reply_to: Option<MessageId>,
    min_edit_interval: Duration,
    state: RelayState,
    edits: usize,
}

impl LiveOutputRelay {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        conversation: ConversationId,
        reply_to: Option<MessageId>,
        min_edit_interval: Duration,
    ) -> Self {
        Self {
            transport,
            conversation,
            reply_to,
            min_edit_interval,
            state: RelayState::default(),
            edits: 0,
        }
    }

    /// Current state, mostly useful for logging after a failure.
    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Drive the relay until the feed ends, fails, or `cancel` fires.
    ///
    /// Cancellation is observed while waiting for the next fragment and while
    /// waiting for the throttle window. A transport call already in flight
    /// completes first.
    pub async fn run(
        mut self,
        mut feed: CompletionFeed,
        cancel: &CancellationToken,
    ) -> Result<RelayReport, RelayError> {
        loop {
            let deadline = self
                .state
                .has_pending()
                .then(|| self.state.next_edit_at(self.min_edit_interval));

            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!(
                        conversation = %self.conversation,
                        edits = self.edits,
                        "Relay cancelled"
                    );
                    return Err(RelayError::Cancelled);
                }

                _ = sleep_until_opt(deadline) => {
                    self.flush().await?;
                    continue;
                }

                event = feed.next() => event,
            };

            match event {
                Some(FeedEvent::Fragment(text)) => self.on_fragment(text).await?,
                Some(FeedEvent::End { continuation }) => return self.finish(continuation).await,
                Some(FeedEvent::Error(message)) => {
                    tracing::warn!(
                        conversation = %self.conversation,
                        error = %message,
                        "Completion feed failed"
                    );
                    return Err(RelayError::Backend(message));
                }
                None => {
                    return Err(RelayError::Backend(
                        "completion feed closed unexpectedly".to_string(),
                    ))
                }
            }
        }
    }

    async fn on_fragment(&mut self, text: String) -> Result<(), RelayError> {
        if text.is_empty() {
            return Ok(());
        }
        self.state.accumulated_text.push_str(&text);

        if self.state.target_message_id.is_none() {
            let id = self
                .transport
                .send_message(self.conversation, self.reply_to, &self.state.accumulated_text)
                .await?;
            tracing::debug!(
                conversation = %self.conversation,
                message_id = id,
                "Created live message"
            );
            self.state.target_message_id = Some(id);
            self.state.last_edit_at = Some(Instant::now());
            self.state.last_edited_text = self.state.accumulated_text.clone();
            return Ok(());
        }

        if Instant::now() >= self.state.next_edit_at(self.min_edit_interval) {
            self.flush().await?;
        }
        Ok(())
    }

    /// Edit the message with the accumulated text unless it already shows it.
    async fn flush(&mut self) -> Result<(), RelayError> {
        let Some(message_id) = self.state.target_message_id else {
            return Ok(());
        };
        if self.state.accumulated_text == self.state.last_edited_text {
            return Ok(());
        }

        self.transport
            .edit_message(self.conversation, message_id, &self.state.accumulated_text)
            .await?;
        self.edits += 1;
        self.state.last_edit_at = Some(Instant::now());
        self.state.last_edited_text = self.state.accumulated_text.clone();
        Ok(())
    }

    async fn finish(mut self, continuation: Option<String>) -> Result<RelayReport, RelayError> {
        let Some(message_id) = self.state.target_message_id else {
            return Err(RelayError::EmptyFeed);
        };
        self.flush().await?;

        tracing::info!(
            conversation = %self.conversation,
            message_id,
            edits = self.edits,
            chars = self.state.accumulated_text.chars().count(),
            "Answer relayed"
        );

        Ok(RelayReport {
            message_id,
            edits: self.edits,
            text: self.state.accumulated_text,
            continuation,
        })
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Relay `feed` into a reply to `reply_to` in `conversation`.
pub async fn relay(
    transport: Arc<dyn ChatTransport>,
    conversation: ConversationId,
    reply_to: Option<MessageId>,
    feed: CompletionFeed,
    min_edit_interval: Duration,
    cancel: &CancellationToken,
) -> Result<RelayReport, RelayError> {
    LiveOutputRelay::new(transport, conversation, reply_to, min_edit_interval)
        .run(feed, cancel)
        .await
}
