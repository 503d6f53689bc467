//! ChatGPT web backend client.
//!
//! Talks to the same endpoints as the ChatGPT web app: the session cookie is
//! exchanged for a short-lived access token, and answers are streamed as SSE
//! where every `data:` payload carries the whole answer so far. The client
//! turns those snapshots into deltas and pushes them into a completion feed.
//!
//! The continuation token of a conversation is the backend's
//! `conversation_id`. The id of the last assistant message is kept per
//! conversation, since the backend needs it as `parent_message_id`.

use crate::feed::{self, CompletionFeed, FeedSender, DEFAULT_FEED_CAPACITY};
use crate::message::ConversationId;
use crate::sse::SseDecoder;
use crate::traits::{ChannelError, ChannelResult, CompletionSource, TokenValidator};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default backend endpoint.
pub const CHATGPT_BASE_URL: &str = "https://chat.openai.com";

/// Cookie carrying the web session.
pub const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

const DEFAULT_MODEL: &str = "text-davinci-002-render-sha";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on plain request/response calls (session exchange, token lookup).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default longest silence allowed while an answer streams.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

const DONE_MARKER: &str = "[DONE]";

/// Configuration for the backend client.
#[derive(Debug, Clone)]
pub struct ChatGptConfig {
    /// Base URL, e.g. `https://chat.openai.com`
    pub base_url: String,
    /// Value of the session cookie
    pub session_token: String,
    pub model: String,
    /// An answer that neither sends data nor ends for this long is failed
    pub stall_timeout: Duration,
}

impl ChatGptConfig {
    pub fn new(session_token: impl Into<String>) -> Self {
        Self {
            base_url: CHATGPT_BASE_URL.to_string(),
            session_token: session_token.into(),
            model: DEFAULT_MODEL.to_string(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthSession {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConversationRequest<'a> {
    action: &'static str,
    messages: Vec<RequestMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    parent_message_id: String,
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    id: String,
    role: &'static str,
    content: RequestContent<'a>,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    content_type: &'static str,
    parts: [&'a str; 1],
}

/// One SSE payload of an answer.
#[derive(Debug, Deserialize)]
struct AnswerChunk {
    #[serde(default)]
    message: Option<AnswerMessage>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnswerMessage {
    id: String,
    #[serde(default)]
    author: Option<Author>,
    #[serde(default)]
    content: Option<AnswerContent>,
}

#[derive(Debug, Deserialize)]
struct Author {
    role: String,
}

#[derive(Debug, Deserialize)]
struct AnswerContent {
    #[serde(default)]
    parts: Vec<serde_json::Value>,
}

impl AnswerMessage {
    fn is_assistant(&self) -> bool {
        self.author.as_ref().map_or(true, |a| a.role == "assistant")
    }

    fn text(&self) -> String {
        self.content
            .as_ref()
            .and_then(|c| c.parts.first())
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ConversationInfo {
    #[serde(default)]
    current_node: Option<String>,
}

// ============================================================================
// Delta tracking
// ============================================================================

/// Converts cumulative answer snapshots into appended fragments.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    seen: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text added since the previous snapshot.
    ///
    /// A snapshot that does not extend the previous one (the backend
    /// occasionally rewrites a token) yields nothing until it does again.
    pub fn delta(&mut self, snapshot: &str) -> Option<String> {
        if snapshot.len() <= self.seen.len() {
            return None;
        }
        let delta = snapshot.strip_prefix(self.seen.as_str())?.to_string();
        self.seen = snapshot.to_string();
        Some(delta)
    }
}

// ============================================================================
// Client
// ============================================================================

/// Completion source backed by the ChatGPT web API.
pub struct ChatGptBackend {
    config: ChatGptConfig,
    client: reqwest::Client,
    access_token: RwLock<Option<String>>,
    /// Last message id per backend conversation
    parents: Arc<DashMap<String, String>>,
}

impl ChatGptBackend {
    pub fn new(config: ChatGptConfig) -> ChannelResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            access_token: RwLock::new(None),
            parents: Arc::new(DashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    /// Exchange the session cookie for an access token, reusing a cached one.
    async fn access_token(&self) -> ChannelResult<String> {
        if let Some(token) = self.access_token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut cached = self.access_token.write().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let resp = self
            .client
            .get(self.url("/api/auth/session"))
            .timeout(REQUEST_TIMEOUT)
            .header(
                reqwest::header::COOKIE,
                format!("{SESSION_COOKIE}={}", self.config.session_token),
            )
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(ChannelError::Auth(format!(
                "session exchange failed with {status}"
            )));
        }

        let session: AuthSession = resp
            .json()
            .await
            .map_err(|e| ChannelError::Auth(format!("invalid session response: {e}")))?;
        let token = session
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChannelError::Auth("session token expired, update OPENAI_SESSION".into()))?;

        tracing::debug!("Refreshed ChatGPT access token");
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn forget_access_token(&self) {
        *self.access_token.write().await = None;
    }

    /// Map a non-success status to an error, dropping the cached token on
    /// authorization failures.
    async fn status_error(&self, resp: reqwest::Response, what: &str) -> ChannelError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let detail = relay_common::util::truncate_with_ellipsis(body.trim(), 200);

        match status.as_u16() {
            401 | 403 => {
                self.forget_access_token().await;
                ChannelError::Auth(format!("{what} was rejected ({status})"))
            }
            429 => ChannelError::RateLimited { retry_after_secs: 0 },
            _ => ChannelError::Backend(format!("{what} failed ({status}): {detail}")),
        }
    }

    fn parent_for(&self, continuation: Option<&str>) -> String {
        continuation
            .and_then(|c| self.parents.get(c).map(|p| p.clone()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Read the SSE body and push deltas into the feed.
    ///
    /// The feed is failed if the body goes quiet for `stall_timeout`.
    async fn pump<S, B, E>(
        body: S,
        stall_timeout: Duration,
        tx: FeedSender,
        parents: Arc<DashMap<String, String>>,
        conversation: ConversationId,
        continuation: Option<String>,
    ) where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let mut decoder = SseDecoder::new();
        let mut answer = AnswerState::new(continuation);
        let mut stream = std::pin::pin!(body);

        let mut done = false;
        'read: loop {
            let chunk = match tokio::time::timeout(stall_timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(conversation = %conversation, "Answer stream stalled");
                    tx.fail(format!(
                        "the backend stopped answering for {}s",
                        stall_timeout.as_secs()
                    ))
                    .await;
                    return;
                }
            };
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tx.fail(format!("connection to the backend was lost: {e}")).await;
                    return;
                }
            };
            for event in decoder.push(bytes.as_ref()) {
                match answer.apply(&event.data) {
                    Ok(Step::Done) => {
                        done = true;
                        break 'read;
                    }
                    Ok(Step::Delta(delta)) => {
                        if !delta.is_empty() && !tx.fragment(delta).await {
                            tracing::debug!(conversation = %conversation, "Feed dropped, abandoning answer");
                            return;
                        }
                    }
                    Err(message) => {
                        tx.fail(message).await;
                        return;
                    }
                }
            }
        }

        if !done {
            done = matches!(decoder.finish(), Some(event) if event.data == DONE_MARKER);
        }
        if !done {
            tx.fail("the backend closed the answer stream early").await;
            return;
        }

        if let (Some(conv), Some(msg)) = (answer.conversation_id.as_ref(), answer.last_message_id) {
            parents.insert(conv.clone(), msg);
        }
        tx.finish(answer.conversation_id).await;
    }
}

/// Result of applying one SSE payload.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Text appended to the answer (possibly empty)
    Delta(String),
    Done,
}

/// What has been learnt about an answer while it streams.
#[derive(Debug)]
struct AnswerState {
    tracker: DeltaTracker,
    last_message_id: Option<String>,
    conversation_id: Option<String>,
}

impl AnswerState {
    fn new(conversation_id: Option<String>) -> Self {
        Self {
            tracker: DeltaTracker::new(),
            last_message_id: None,
            conversation_id,
        }
    }

    fn apply(&mut self, data: &str) -> Result<Step, String> {
        if data == DONE_MARKER {
            return Ok(Step::Done);
        }
        let chunk: AnswerChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            // Keep-alive and metadata payloads
            Err(_) => return Ok(Step::Delta(String::new())),
        };
        if let Some(error) = chunk.error.filter(|e| !e.is_null()) {
            return Err(match error {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
        }
        if let Some(id) = chunk.conversation_id {
            self.conversation_id = Some(id);
        }
        let Some(message) = chunk.message.filter(AnswerMessage::is_assistant) else {
            return Ok(Step::Delta(String::new()));
        };
        self.last_message_id = Some(message.id.clone());
        Ok(Step::Delta(self.tracker.delta(&message.text()).unwrap_or_default()))
    }
}

#[async_trait]
impl TokenValidator for ChatGptBackend {
    async fn validate_token(&self, token: &str) -> ChannelResult<()> {
        let token = token.trim();
        if token.is_empty() || token.contains('/') {
            return Err(ChannelError::InvalidToken("token is empty or malformed".into()));
        }

        let access = self.access_token().await?;
        let resp = self
            .client
            .get(self.url(&format!("/backend-api/conversation/{token}")))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(access)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChannelError::InvalidToken(format!(
                "conversation {token} does not exist"
            )));
        }
        if !resp.status().is_success() {
            return Err(self.status_error(resp, "conversation lookup").await);
        }

        let info: ConversationInfo = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidToken(format!("unexpected conversation payload: {e}")))?;
        if let Some(node) = info.current_node {
            self.parents.insert(token.to_string(), node);
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionSource for ChatGptBackend {
    async fn send(
        &self,
        text: &str,
        conversation: ConversationId,
        continuation: Option<&str>,
    ) -> ChannelResult<CompletionFeed> {
        let access = self.access_token().await?;

        let request = ConversationRequest {
            action: "next",
            messages: vec![RequestMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role: "user",
                content: RequestContent {
                    content_type: "text",
                    parts: [text],
                },
            }],
            conversation_id: continuation,
            parent_message_id: self.parent_for(continuation),
            model: &self.config.model,
        };

        let pending = self
            .client
            .post(self.url("/backend-api/conversation"))
            .bearer_auth(access)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send();
        // No request timeout here: it would also cut off long answers.
        let resp = tokio::time::timeout(self.config.stall_timeout, pending)
            .await
            .map_err(|_| ChannelError::Backend("the backend did not start answering".into()))??;

        if !resp.status().is_success() {
            return Err(self.status_error(resp, "conversation request").await);
        }

        tracing::debug!(
            conversation = %conversation,
            continued = continuation.is_some(),
            "Answer stream opened"
        );

        let (tx, feed) = feed::channel(DEFAULT_FEED_CAPACITY);
        tokio::spawn(Self::pump(
            resp.bytes_stream(),
            self.config.stall_timeout,
            tx,
            Arc::clone(&self.parents),
            conversation,
            continuation.map(str::to_string),
        ));
        Ok(feed)
    }
}
