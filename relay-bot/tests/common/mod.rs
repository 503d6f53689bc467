//! Fakes shared by the relay-bot integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use relay_bot::feed::{self, CompletionFeed, FeedEvent};
use relay_bot::{
    ChannelError, ChannelResult, ChatKind, ChatTransport, CompletionSource, ConversationId,
    DispatchPolicy, InboundMessage, MessageId, SessionStore, TokenPersister, TokenValidator,
    TurnDispatcher,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const BOT: &str = "relay_bot";
pub const OWNER: i64 = 42;

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Send {
        chat: ConversationId,
        reply_to: Option<MessageId>,
        text: String,
    },
    Edit {
        chat: ConversationId,
        message_id: MessageId,
        text: String,
    },
    Typing(ConversationId),
}

/// Records every transport call with the (tokio) time it was made.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<(Instant, Call)>>,
    next_id: AtomicI64,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Edit { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Text the chat currently shows for the live message.
    pub fn last_shown(&self) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Edit { text, .. } | Call::Send { text, .. } => Some(text),
            Call::Typing(_) => None,
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_message(
        &self,
        chat: ConversationId,
        reply_to: Option<MessageId>,
        text: &str,
    ) -> ChannelResult<MessageId> {
        self.record(Call::Send {
            chat,
            reply_to,
            text: text.to_string(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn edit_message(
        &self,
        chat: ConversationId,
        message_id: MessageId,
        text: &str,
    ) -> ChannelResult<()> {
        self.record(Call::Edit {
            chat,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_typing(&self, chat: ConversationId) -> ChannelResult<()> {
        self.record(Call::Typing(chat));
        Ok(())
    }
}

// ============================================================================
// Completion source
// ============================================================================

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Script {
    /// Events delivered immediately
    Events(Vec<FeedEvent>),
    /// Events delivered after the given delay each
    Timed(Vec<(Duration, FeedEvent)>),
    /// `send` itself fails
    Fail(String),
}

impl Script {
    pub fn answer(fragments: &[&str], continuation: Option<&str>) -> Self {
        let mut events: Vec<FeedEvent> = fragments
            .iter()
            .map(|f| FeedEvent::Fragment((*f).to_string()))
            .collect();
        events.push(FeedEvent::End {
            continuation: continuation.map(str::to_string),
        });
        Self::Events(events)
    }
}

/// Plays back scripts in order and records what it was asked.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<(String, ConversationId, Option<String>)>>,
    valid_tokens: Vec<String>,
    /// How long `validate_token` takes to answer
    validation_delay: Duration,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Self::with_valid_tokens(scripts, &[])
    }

    pub fn with_valid_tokens(scripts: Vec<Script>, valid: &[&str]) -> Arc<Self> {
        Self::with_slow_validation(scripts, valid, Duration::ZERO)
    }

    pub fn with_slow_validation(
        scripts: Vec<Script>,
        valid: &[&str],
        validation_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            valid_tokens: valid.iter().map(|t| t.to_string()).collect(),
            validation_delay,
        })
    }

    pub fn requests(&self) -> Vec<(String, ConversationId, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn continuations(&self) -> Vec<Option<String>> {
        self.requests().into_iter().map(|(_, _, c)| c).collect()
    }
}

#[async_trait]
impl TokenValidator for ScriptedSource {
    async fn validate_token(&self, token: &str) -> ChannelResult<()> {
        if !self.validation_delay.is_zero() {
            tokio::time::sleep(self.validation_delay).await;
        }
        if self.valid_tokens.iter().any(|t| t == token) {
            Ok(())
        } else {
            Err(ChannelError::InvalidToken(format!(
                "conversation {token} does not exist"
            )))
        }
    }
}

#[async_trait]
impl CompletionSource for ScriptedSource {
    async fn send(
        &self,
        text: &str,
        conversation: ConversationId,
        continuation: Option<&str>,
    ) -> ChannelResult<CompletionFeed> {
        self.requests.lock().unwrap().push((
            text.to_string(),
            conversation,
            continuation.map(str::to_string),
        ));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::answer(&["ok"], None));

        match script {
            Script::Events(events) => Ok(CompletionFeed::from_events(events)),
            Script::Fail(message) => Err(ChannelError::Backend(message)),
            Script::Timed(events) => {
                let (tx, feed) = feed::channel(8);
                tokio::spawn(async move {
                    for (delay, event) in events {
                        tokio::time::sleep(delay).await;
                        match event {
                            FeedEvent::Fragment(text) => {
                                if !tx.fragment(text).await {
                                    return;
                                }
                            }
                            FeedEvent::End { continuation } => return tx.finish(continuation).await,
                            FeedEvent::Error(message) => return tx.fail(message).await,
                        }
                    }
                    // Script ran out without a terminal event: keep the feed
                    // open until the consumer goes away.
                    while !tx.is_closed() {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                });
                Ok(feed)
            }
        }
    }
}

// ============================================================================
// Persister
// ============================================================================

#[derive(Default)]
pub struct MemoryPersister {
    pub saved: Mutex<Vec<(ConversationId, String)>>,
}

impl TokenPersister for MemoryPersister {
    fn persist_token(&self, conversation: ConversationId, token: &str) -> anyhow::Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((conversation, token.to_string()));
        Ok(())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub struct Harness {
    pub transport: Arc<RecordingTransport>,
    pub source: Arc<ScriptedSource>,
    pub persister: Arc<MemoryPersister>,
    pub sessions: Arc<SessionStore>,
    pub dispatcher: Arc<TurnDispatcher>,
}

pub fn harness(source: Arc<ScriptedSource>, allowed_ids: Vec<i64>) -> Harness {
    let transport = RecordingTransport::new();
    let persister = Arc::new(MemoryPersister::default());
    let sessions = Arc::new(SessionStore::new());
    let policy = DispatchPolicy::new(allowed_ids, Some(BOT.to_string()), Duration::ZERO);
    let dispatcher = Arc::new(TurnDispatcher::new(
        transport.clone(),
        source.clone(),
        sessions.clone(),
        persister.clone(),
        policy,
    ));
    Harness {
        transport,
        source,
        persister,
        sessions,
        dispatcher,
    }
}

pub fn private(message_id: MessageId, text: &str) -> InboundMessage {
    InboundMessage::new(message_id, ConversationId(OWNER), ChatKind::Private, Some(OWNER), text)
}

pub fn group(message_id: MessageId, sender: i64, text: &str) -> InboundMessage {
    InboundMessage::new(message_id, ConversationId(-500), ChatKind::Group, Some(sender), text)
}
