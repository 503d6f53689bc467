//! Per-conversation session store.
//!
//! Maps a conversation to the opaque continuation token the backend needs to
//! carry the dialogue on. Each conversation has its own slot guarded by its
//! own async mutex, so resets and renewals in different chats never contend,
//! and a renewal holds its slot across the backend validation call.
//!
//! The store is in-memory only; a restart starts every conversation fresh
//! apart from those with a persisted `/renew` token, which seed only their
//! own conversation.

use crate::message::ConversationId;
use crate::traits::{ChannelResult, TokenValidator};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Session state for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub conversation_id: ConversationId,
    pub continuation_token: Option<String>,
}

impl SessionEntry {
    fn new(conversation_id: ConversationId, continuation_token: Option<String>) -> Self {
        Self {
            conversation_id,
            continuation_token,
        }
    }
}

/// `None` until the conversation's first message (or first session command).
type Slot = Arc<Mutex<Option<SessionEntry>>>;

/// Shared store of conversation sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    slots: DashMap<ConversationId, Slot>,
    /// Tokens given to specific conversations on their first turn
    seeds: HashMap<ConversationId, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start each listed conversation from its token (the persisted
    /// `/renew` values). Other conversations start fresh.
    pub fn with_seeds<I>(seeds: I) -> Self
    where
        I: IntoIterator<Item = (ConversationId, String)>,
    {
        Self {
            slots: DashMap::new(),
            seeds: seeds.into_iter().filter(|(_, t)| !t.is_empty()).collect(),
        }
    }

    fn slot(&self, id: ConversationId) -> Slot {
        self.slots.entry(id).or_default().clone()
    }

    fn existing_slot(&self, id: ConversationId) -> Option<Slot> {
        self.slots.get(&id).map(|slot| slot.clone())
    }

    /// Current token, `None` if there is no entry or it was reset.
    pub async fn get(&self, id: ConversationId) -> Option<String> {
        let slot = self.existing_slot(id)?;
        let guard = slot.lock().await;
        guard.as_ref().and_then(|e| e.continuation_token.clone())
    }

    /// Snapshot of the whole entry, if one exists.
    pub async fn entry(&self, id: ConversationId) -> Option<SessionEntry> {
        let slot = self.existing_slot(id)?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Token for a new turn, creating the entry from the seed on first use.
    pub async fn begin_turn(&self, id: ConversationId) -> Option<String> {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        let entry = guard.get_or_insert_with(|| {
            tracing::debug!(conversation = %id, "Creating session entry");
            SessionEntry::new(id, self.seeds.get(&id).cloned())
        });
        entry.continuation_token.clone()
    }

    /// Drop the conversation's token so the backend starts a fresh dialogue.
    pub async fn reset(&self, id: ConversationId) {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        *guard = Some(SessionEntry::new(id, None));
        tracing::info!(conversation = %id, "Session reset");
    }

    /// Install the token the backend handed back at the end of a turn.
    pub async fn replace(&self, id: ConversationId, token: String) {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(entry) => entry.continuation_token = Some(token),
            None => *guard = Some(SessionEntry::new(id, Some(token))),
        }
    }

    /// Install the token a finished turn produced, unless the session moved
    /// on while the turn was running (a `/reload` or `/renew` in between).
    ///
    /// Returns whether the token was installed.
    pub async fn complete_turn(
        &self,
        id: ConversationId,
        started_with: Option<&str>,
        token: String,
    ) -> bool {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        let current = guard.as_ref().and_then(|e| e.continuation_token.as_deref());
        if current != started_with {
            tracing::debug!(conversation = %id, "Session changed during turn, dropping new token");
            return false;
        }
        *guard = Some(SessionEntry::new(id, Some(token)));
        true
    }

    /// Validate `token` against the backend, then install it.
    ///
    /// The slot stays locked across validation, so two renewals of the same
    /// conversation commit one after the other. On failure the previous token
    /// is untouched.
    pub async fn renew<V>(&self, id: ConversationId, token: &str, validator: &V) -> ChannelResult<()>
    where
        V: TokenValidator + ?Sized,
    {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;

        if let Err(e) = validator.validate_token(token).await {
            tracing::warn!(conversation = %id, error = %e, "Continuation token rejected");
            return Err(e);
        }

        match guard.as_mut() {
            Some(entry) => entry.continuation_token = Some(token.to_string()),
            None => *guard = Some(SessionEntry::new(id, Some(token.to_string()))),
        }
        tracing::info!(conversation = %id, "Session renewed");
        Ok(())
    }

    /// Number of conversations with an entry.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChannelError;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedValidator {
        valid: &'static str,
    }

    #[async_trait]
    impl TokenValidator for FixedValidator {
        async fn validate_token(&self, token: &str) -> ChannelResult<()> {
            if token == self.valid {
                Ok(())
            } else {
                Err(ChannelError::InvalidToken(format!("unknown conversation {token}")))
            }
        }
    }

    const CHAT: ConversationId = ConversationId(100);

    #[tokio::test]
    async fn test_get_does_not_create_entry() {
        let store = SessionStore::new();
        assert_eq!(store.get(CHAT).await, None);
        assert!(store.entry(CHAT).await.is_none());
        assert!(store.is_empty());
    }

    fn seeded() -> SessionStore {
        SessionStore::with_seeds([(CHAT, "seed".to_string())])
    }

    #[tokio::test]
    async fn test_begin_turn_seeds_new_entries() {
        let store = seeded();
        assert_eq!(store.begin_turn(CHAT).await.as_deref(), Some("seed"));
        assert_eq!(store.get(CHAT).await.as_deref(), Some("seed"));
    }

    #[tokio::test]
    async fn test_seed_only_applies_to_its_conversation() {
        let store = SessionStore::with_seeds([
            (CHAT, "conv-of-chat".to_string()),
            (ConversationId(300), String::new()),
        ]);
        assert_eq!(store.begin_turn(ConversationId(200)).await, None);
        assert_eq!(store.begin_turn(ConversationId(300)).await, None);
        assert_eq!(store.begin_turn(CHAT).await.as_deref(), Some("conv-of-chat"));
    }

    #[tokio::test]
    async fn test_reset_then_get_is_empty() {
        let store = seeded();
        store.replace(CHAT, "conv-1".into()).await;
        store.reset(CHAT).await;
        assert_eq!(store.get(CHAT).await, None);
        // The seed is only for brand new conversations.
        assert_eq!(store.begin_turn(CHAT).await, None);
    }

    #[tokio::test]
    async fn test_reset_without_entry() {
        let store = SessionStore::new();
        store.reset(CHAT).await;
        assert_eq!(store.get(CHAT).await, None);
    }

    #[tokio::test]
    async fn test_renew_installs_valid_token() {
        let store = SessionStore::new();
        let validator = FixedValidator { valid: "good" };
        store.renew(CHAT, "good", &validator).await.unwrap();
        assert_eq!(store.get(CHAT).await.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_failed_renew_keeps_previous_token() {
        let store = SessionStore::new();
        let validator = FixedValidator { valid: "good" };
        store.replace(CHAT, "before".into()).await;

        let err = store.renew(CHAT, "bad-token", &validator).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidToken(_)));
        assert_eq!(store.get(CHAT).await.as_deref(), Some("before"));
    }

    #[tokio::test]
    async fn test_failed_renew_without_entry_stays_empty() {
        let store = seeded();
        let validator = FixedValidator { valid: "good" };
        assert!(store.renew(CHAT, "bad-token", &validator).await.is_err());
        assert_eq!(store.get(CHAT).await, None);
    }

    #[tokio::test]
    async fn test_complete_turn_respects_reset() {
        let store = SessionStore::new();
        store.replace(CHAT, "conv-1".into()).await;
        let started = store.begin_turn(CHAT).await;

        store.reset(CHAT).await;
        assert!(!store.complete_turn(CHAT, started.as_deref(), "conv-1".into()).await);
        assert_eq!(store.get(CHAT).await, None);

        let started = store.begin_turn(CHAT).await;
        assert!(store.complete_turn(CHAT, started.as_deref(), "conv-2".into()).await);
        assert_eq!(store.get(CHAT).await.as_deref(), Some("conv-2"));
    }

    struct SlowValidator;

    #[async_trait]
    impl TokenValidator for SlowValidator {
        async fn validate_token(&self, _token: &str) -> ChannelResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_renew_does_not_block_other_conversations() {
        let store = Arc::new(SessionStore::new());
        let other = ConversationId(200);

        let renewing = {
            let store = store.clone();
            tokio::spawn(async move { store.renew(CHAT, "slow", &SlowValidator).await })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        store.reset(other).await;
        store.replace(other, "fast".into()).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(store.get(other).await.as_deref(), Some("fast"));

        renewing.await.unwrap().unwrap();
        assert_eq!(store.get(CHAT).await.as_deref(), Some("slow"));
    }
}
