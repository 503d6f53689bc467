//! Turn dispatcher.
//!
//! Handles the complete message flow:
//! 1. Decide whether an inbound message is addressed to the bot
//! 2. Check the sender against the allow-list
//! 3. Answer commands inline, except `/renew <token>`, which waits on the
//!    backend and so runs in its own task
//! 4. Run free text as a turn: feed source, then live relay, in its own task
//!
//! Turns and renewals hold the conversation's guard while they run, so a
//! conversation has at most one of them in flight.

use crate::live::{relay, RelayError};
use crate::message::{ChatKind, ConversationId, InboundMessage};
use crate::session::SessionStore;
use crate::traits::{ChannelResult, ChatTransport, CompletionSource, TokenPersister};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ============================================================================
// Fixed replies
// ============================================================================

pub const HELP_TEXT: &str = "Send a message to start talking with ChatGPT. You can use /reload at any point to clear the conversation history and start from scratch (don't worry, it won't delete the Telegram messages).";
pub const RELOAD_TEXT: &str = "Started a new conversation. Enjoy!";
pub const UNKNOWN_COMMAND_TEXT: &str = "Unknown command. Send /help to see a list of commands.";
pub const DENIED_TEXT: &str = "You are not authorized to use this bot.";
pub const BUSY_TEXT: &str = "Still answering your previous message. Please wait until it is done.";
pub const RENEW_OK_TEXT: &str = "Conversation token updated. The next message continues that conversation.";
pub const RENEW_USAGE_TEXT: &str = "Usage: /renew <conversation token>";

/// Longest a `/renew` waits for the backend to confirm the token.
pub const RENEW_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Commands and routing
// ============================================================================

/// A slash command addressed to the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Start,
    Reload,
    /// `/renew <token>`; the token is empty when none was given
    Renew(String),
    Unknown(String),
}

impl Command {
    /// Parse a slash command.
    ///
    /// Returns `None` for text that is not a command and for commands
    /// addressed to another bot (`/help@other_bot`).
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };

        let name = match head.split_once('@') {
            Some((name, target)) => {
                if let Some(bot) = bot_username {
                    if !target.eq_ignore_ascii_case(bot) {
                        return None;
                    }
                }
                name
            }
            None => head,
        };

        Some(match name.to_ascii_lowercase().as_str() {
            "help" => Self::Help,
            "start" => Self::Start,
            "reload" => Self::Reload,
            "renew" => Self::Renew(args.to_string()),
            other => Self::Unknown(other.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Help => "help",
            Self::Start => "start",
            Self::Reload => "reload",
            Self::Renew(_) => "renew",
            Self::Unknown(name) => name,
        }
    }
}

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Denied,
    Command(Command),
    /// Text to forward to the backend, mention already stripped
    FreeText(String),
    Ignored,
}

/// Outcome of [`TurnDispatcher::handle`].
#[derive(Debug)]
pub enum Dispatched {
    Denied,
    Replied,
    Ignored,
    /// A turn is already running in this conversation
    Busy,
    /// A turn was started
    Turn(JoinHandle<()>),
    /// A `/renew` was started; it replies when the backend has answered
    Renewal(JoinHandle<()>),
}

/// Static dispatch policy.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// User or chat ids allowed to use the bot; empty allows everyone
    pub allowed_ids: Vec<i64>,
    /// The bot's username, without `@`
    pub bot_username: Option<String>,
    pub edit_interval: Duration,
}

impl DispatchPolicy {
    pub fn new(allowed_ids: Vec<i64>, bot_username: Option<String>, edit_interval: Duration) -> Self {
        Self {
            allowed_ids,
            bot_username: bot_username.map(|u| u.trim_start_matches('@').to_string()),
            edit_interval,
        }
    }

    /// Allowed when the list is empty or holds the sender or the chat.
    pub fn is_allowed(&self, msg: &InboundMessage) -> bool {
        self.allowed_ids.is_empty()
            || msg.sender_id.is_some_and(|id| self.allowed_ids.contains(&id))
            || self.allowed_ids.contains(&msg.conversation.get())
    }

    /// Text of a group message that mentions the bot first or last, with the
    /// mention removed. `None` when the bot is not mentioned there.
    pub fn strip_mention(&self, text: &str) -> Option<String> {
        let bot = self.bot_username.as_deref()?;
        let mention = format!("@{bot}");
        let text = text.trim();

        let stripped = if let Some(rest) = strip_prefix_ignore_case(text, &mention) {
            if rest.chars().next().is_some_and(is_username_char) {
                return None;
            }
            rest
        } else if let Some(rest) = strip_suffix_ignore_case(text, &mention) {
            rest
        } else {
            return None;
        };

        let stripped = stripped.trim().trim_start_matches([',', ':']).trim();
        (!stripped.is_empty()).then(|| stripped.to_string())
    }

    /// Route a message.
    ///
    /// Messages that are not addressed to the bot are ignored before the
    /// allow-list check, so unauthorized group chatter gets no reply.
    pub fn classify(&self, msg: &InboundMessage) -> Route {
        let route = if msg.chat_kind == ChatKind::Channel {
            Route::Ignored
        } else if msg.is_command() {
            match Command::parse(&msg.text, self.bot_username.as_deref()) {
                Some(cmd) => Route::Command(cmd),
                None => Route::Ignored,
            }
        } else if msg.chat_kind == ChatKind::Private {
            Route::FreeText(msg.text.trim().to_string())
        } else {
            match self.strip_mention(&msg.text) {
                Some(text) => Route::FreeText(text),
                None => Route::Ignored,
            }
        };

        match route {
            Route::Ignored => Route::Ignored,
            _ if !self.is_allowed(msg) => Route::Denied,
            Route::FreeText(text) if text.is_empty() => Route::Ignored,
            route => route,
        }
    }
}

fn is_username_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

fn strip_suffix_ignore_case<'a>(text: &'a str, suffix: &str) -> Option<&'a str> {
    let start = text.len().checked_sub(suffix.len())?;
    let tail = text.get(start..)?;
    if !tail.eq_ignore_ascii_case(suffix) {
        return None;
    }
    let rest = &text[..start];
    // "@relay_bot" must not match the end of "@my_relay_bot"
    match rest.chars().last() {
        Some(c) if is_username_char(c) || c == '@' => None,
        _ => Some(rest),
    }
}

// ============================================================================
// Turn guard
// ============================================================================

/// Marks a conversation as having a turn in flight until dropped.
struct TurnGuard {
    active: Arc<DashMap<ConversationId, String>>,
    conversation: ConversationId,
}

impl TurnGuard {
    fn acquire(
        active: &Arc<DashMap<ConversationId, String>>,
        conversation: ConversationId,
        trace_id: &str,
    ) -> Option<Self> {
        match active.entry(conversation) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(trace_id.to_string());
                Some(Self {
                    active: Arc::clone(active),
                    conversation,
                })
            }
        }
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.active.remove(&self.conversation);
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes inbound messages to commands and turns.
pub struct TurnDispatcher {
    transport: Arc<dyn ChatTransport>,
    source: Arc<dyn CompletionSource>,
    sessions: Arc<SessionStore>,
    persister: Arc<dyn TokenPersister>,
    policy: DispatchPolicy,
    /// Conversations with a turn in flight, mapped to the turn's trace id
    active: Arc<DashMap<ConversationId, String>>,
    tasks: TaskTracker,
}

impl TurnDispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        source: Arc<dyn CompletionSource>,
        sessions: Arc<SessionStore>,
        persister: Arc<dyn TokenPersister>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            transport,
            source,
            sessions,
            persister,
            policy,
            active: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Number of turns and renewals currently running.
    pub fn active_turns(&self) -> usize {
        self.active.len()
    }

    /// Handle one inbound message.
    ///
    /// Commands are answered before this returns. Free text starts a turn in
    /// a tracked task and returns its handle. Errors are failures to deliver
    /// a reply.
    pub async fn handle(
        self: &Arc<Self>,
        msg: InboundMessage,
        cancel: &CancellationToken,
    ) -> ChannelResult<Dispatched> {
        match self.policy.classify(&msg) {
            Route::Ignored => {
                tracing::trace!(trace_id = %msg.trace_id, "Message not addressed to the bot");
                Ok(Dispatched::Ignored)
            }
            Route::Denied => {
                tracing::info!(
                    trace_id = %msg.trace_id,
                    conversation = %msg.conversation,
                    sender_id = ?msg.sender_id,
                    "Unauthorized sender"
                );
                self.reply(&msg, DENIED_TEXT).await?;
                Ok(Dispatched::Denied)
            }
            Route::Command(Command::Renew(token)) if !token.is_empty() => {
                tracing::info!(
                    trace_id = %msg.trace_id,
                    conversation = %msg.conversation,
                    command = "renew",
                    "Command received"
                );
                let Some(guard) = TurnGuard::acquire(&self.active, msg.conversation, &msg.trace_id)
                else {
                    return self.reject_busy(&msg).await;
                };

                let dispatcher = Arc::clone(self);
                let cancel = cancel.child_token();
                let handle = self.tasks.spawn(async move {
                    let text = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        text = dispatcher.renew(&msg, token) => Some(text),
                    };
                    match text {
                        Some(text) => {
                            if let Err(e) = dispatcher.reply(&msg, &text).await {
                                tracing::error!(trace_id = %msg.trace_id, error = %e, "Failed to send reply");
                            }
                        }
                        None => tracing::info!(trace_id = %msg.trace_id, "Renewal cancelled"),
                    }
                    drop(guard);
                });
                Ok(Dispatched::Renewal(handle))
            }
            Route::Command(cmd) => {
                self.run_command(&msg, cmd).await?;
                Ok(Dispatched::Replied)
            }
            Route::FreeText(text) => {
                let Some(guard) = TurnGuard::acquire(&self.active, msg.conversation, &msg.trace_id)
                else {
                    return self.reject_busy(&msg).await;
                };

                let dispatcher = Arc::clone(self);
                let cancel = cancel.child_token();
                let handle = self.tasks.spawn(async move {
                    dispatcher.run_turn(msg, text, cancel).await;
                    drop(guard);
                });
                Ok(Dispatched::Turn(handle))
            }
        }
    }

    /// Stop accepting turns and wait for running ones to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            tracing::info!(turns = self.tasks.len(), "Waiting for running turns");
        }
        self.tasks.wait().await;
    }

    async fn reject_busy(&self, msg: &InboundMessage) -> ChannelResult<Dispatched> {
        tracing::info!(
            trace_id = %msg.trace_id,
            conversation = %msg.conversation,
            "Conversation busy, rejecting message"
        );
        self.reply(msg, BUSY_TEXT).await?;
        Ok(Dispatched::Busy)
    }

    async fn reply(&self, msg: &InboundMessage, text: &str) -> ChannelResult<()> {
        self.transport
            .send_message(msg.conversation, Some(msg.message_id), text)
            .await?;
        Ok(())
    }

    async fn run_command(&self, msg: &InboundMessage, cmd: Command) -> ChannelResult<()> {
        tracing::info!(
            trace_id = %msg.trace_id,
            conversation = %msg.conversation,
            command = cmd.name(),
            "Command received"
        );

        match cmd {
            Command::Help | Command::Start => self.reply(msg, HELP_TEXT).await,
            Command::Reload => {
                self.sessions.reset(msg.conversation).await;
                self.reply(msg, RELOAD_TEXT).await
            }
            // `handle` runs renewals that carry a token
            Command::Renew(_) => self.reply(msg, RENEW_USAGE_TEXT).await,
            Command::Unknown(_) => self.reply(msg, UNKNOWN_COMMAND_TEXT).await,
        }
    }

    /// Validate and install a token, then persist it. Returns the reply text.
    async fn renew(&self, msg: &InboundMessage, token: String) -> String {
        let conversation = msg.conversation;
        let renewed = tokio::time::timeout(
            RENEW_TIMEOUT,
            self.sessions.renew(conversation, &token, self.source.as_ref()),
        )
        .await;
        match renewed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return format!("Error: {e}"),
            Err(_) => {
                tracing::warn!(
                    trace_id = %msg.trace_id,
                    conversation = %conversation,
                    "Token validation timed out"
                );
                return format!(
                    "Error: the backend did not confirm the token within {}s, nothing was changed",
                    RENEW_TIMEOUT.as_secs()
                );
            }
        }

        let persister = Arc::clone(&self.persister);
        let persisted =
            tokio::task::spawn_blocking(move || persister.persist_token(conversation, &token)).await;
        match persisted {
            Ok(Ok(())) => RENEW_OK_TEXT.to_string(),
            Ok(Err(e)) => {
                tracing::error!(trace_id = %msg.trace_id, error = %e, "Failed to persist continuation token");
                format!("Error: token applied to this chat but could not be saved: {e}")
            }
            Err(e) => {
                tracing::error!(trace_id = %msg.trace_id, error = %e, "Token persistence task failed");
                format!("Error: token applied to this chat but could not be saved: {e}")
            }
        }
    }

    async fn run_turn(&self, msg: InboundMessage, text: String, cancel: CancellationToken) {
        let conversation = msg.conversation;
        tracing::info!(
            trace_id = %msg.trace_id,
            conversation = %conversation,
            message_id = msg.message_id,
            "Turn started"
        );

        if let Err(e) = self.transport.send_typing(conversation).await {
            tracing::warn!(trace_id = %msg.trace_id, error = %e, "Failed to send typing indicator");
        }

        let started_with = self.sessions.begin_turn(conversation).await;
        let feed = match self
            .source
            .send(&text, conversation, started_with.as_deref())
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                tracing::error!(trace_id = %msg.trace_id, error = %e, "Backend request failed");
                self.reply_error(&msg, &e.to_string()).await;
                return;
            }
        };

        let result = relay(
            Arc::clone(&self.transport),
            conversation,
            Some(msg.message_id),
            feed,
            self.policy.edit_interval,
            &cancel,
        )
        .await;

        match result {
            Ok(report) => {
                if let Some(token) = report.continuation {
                    self.sessions
                        .complete_turn(conversation, started_with.as_deref(), token)
                        .await;
                }
                tracing::info!(
                    trace_id = %msg.trace_id,
                    conversation = %conversation,
                    message_id = report.message_id,
                    edits = report.edits,
                    "Turn finished"
                );
            }
            Err(RelayError::Cancelled) => {
                tracing::info!(trace_id = %msg.trace_id, conversation = %conversation, "Turn cancelled");
            }
            Err(RelayError::Transport(e)) => {
                tracing::error!(
                    trace_id = %msg.trace_id,
                    conversation = %conversation,
                    error = %e,
                    "Failed to deliver answer"
                );
            }
            Err(e @ (RelayError::EmptyFeed | RelayError::Backend(_))) => {
                tracing::error!(trace_id = %msg.trace_id, error = %e, "Answer failed");
                self.reply_error(&msg, &e.to_string()).await;
            }
        }
    }

    async fn reply_error(&self, msg: &InboundMessage, error: &str) {
        if let Err(e) = self.reply(msg, &format!("Error: {error}")).await {
            tracing::error!(trace_id = %msg.trace_id, error = %e, "Failed to send error reply");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
