//! Relay Bot - streams ChatGPT answers into Telegram as live-edited messages.
//!
//! ## Architecture
//!
//! The Telegram poller feeds inbound messages to the dispatcher one at a time.
//! Free text becomes a turn: the backend answer arrives as a completion feed
//! and the live relay mirrors it into a single reply message, editing it as
//! the answer grows.
//!
//! ```text
//! Telegram → getUpdates → TurnDispatcher → ChatGptBackend
//!                              ↓                 ↓ CompletionFeed
//! User ←── send/edit ←── LiveOutputRelay ←───────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod chatgpt;
pub mod dispatch;
pub mod feed;
pub mod live;
pub mod message;
pub mod session;
pub mod sse;
pub mod telegram;
pub mod traits;

// Re-export commonly used types
pub use chatgpt::{ChatGptBackend, ChatGptConfig};
pub use dispatch::{Command, DispatchPolicy, Dispatched, Route, TurnDispatcher};
pub use feed::{CompletionFeed, FeedEvent, FeedSender};
pub use live::{relay, LiveOutputRelay, RelayError, RelayReport, RelayState};
pub use message::{ChatKind, ConversationId, InboundMessage, MessageId};
pub use session::{SessionEntry, SessionStore};
pub use telegram::TelegramChannel;
pub use traits::{
    ChannelError, ChannelResult, ChatTransport, CompletionSource, TokenPersister, TokenValidator,
};

use anyhow::Context;
use relay_common::{ConfigFile, EnvConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Inbound messages buffered between the poller and the dispatcher.
const INBOUND_CAPACITY: usize = 64;

/// Feed inbound messages to the dispatcher until `cancel` fires or the
/// sender side closes.
pub async fn serve(
    dispatcher: &Arc<TurnDispatcher>,
    mut rx: mpsc::Receiver<InboundMessage>,
    cancel: &CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let trace_id = msg.trace_id.clone();
        if let Err(e) = dispatcher.handle(msg, cancel).await {
            tracing::error!(trace_id = %trace_id, error = %e, "Failed to send reply");
        }
    }
}

/// Run the bot until `cancel` fires, then wait for running turns.
pub async fn run(
    config: EnvConfig,
    config_file: ConfigFile,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let telegram = Arc::new(TelegramChannel::new(config.telegram_token.clone()));
    let me = telegram
        .get_me()
        .await
        .context("Failed to reach Telegram with TELEGRAM_TOKEN")?;

    let mut backend_config = ChatGptConfig::new(config.openai_session.clone());
    if let Some(ref base_url) = config.chatgpt_base_url {
        backend_config = backend_config.with_base_url(base_url.clone());
    }
    let backend = Arc::new(ChatGptBackend::new(backend_config)?);

    let sessions = Arc::new(SessionStore::with_seeds(
        config
            .continuation_tokens
            .iter()
            .map(|(chat, token)| (ConversationId(*chat), token.clone())),
    ));
    let policy = DispatchPolicy::new(
        config.allow_list().to_vec(),
        me.username.clone(),
        config.edit_interval(),
    );
    let persister: Arc<dyn TokenPersister> = Arc::new(config_file);
    let dispatcher = Arc::new(TurnDispatcher::new(
        telegram.clone(),
        backend,
        sessions,
        persister,
        policy,
    ));

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let poller = {
        let telegram = Arc::clone(&telegram);
        let cancel = cancel.clone();
        tokio::spawn(async move { telegram.listen(tx, &cancel).await })
    };

    tracing::info!(
        "Started Telegram bot! Message @{} to start.",
        me.username.as_deref().unwrap_or("your bot")
    );

    serve(&dispatcher, rx, &cancel).await;

    // The poller only stops on its own when cancelled
    cancel.cancel();
    match poller.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Telegram poller stopped with an error"),
        Err(e) => tracing::warn!(error = %e, "Telegram poller task failed"),
    }

    dispatcher.shutdown().await;
    tracing::info!("Relay bot stopped");
    Ok(())
}
