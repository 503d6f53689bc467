//! Completion feed: the single-producer, single-consumer channel carrying one
//! answer from the backend to the live relay.
//!
//! The producer holds a [`FeedSender`]. It pushes fragments in order and ends
//! the feed exactly once, with [`FeedSender::finish`] or [`FeedSender::fail`].
//! Both consume the sender, so a second terminal event cannot be written.
//! Dropping the [`CompletionFeed`] tells the producer to stop.

use tokio::sync::mpsc;

/// Default channel capacity between producer and relay.
pub const DEFAULT_FEED_CAPACITY: usize = 32;

/// One item of a completion feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Next piece of answer text. Concatenated in delivery order.
    Fragment(String),
    /// End of the answer. May carry the backend's continuation token.
    End { continuation: Option<String> },
    /// The backend failed mid-answer.
    Error(String),
}

/// Consumer side of a completion feed.
#[derive(Debug)]
pub struct CompletionFeed {
    rx: mpsc::Receiver<FeedEvent>,
}

/// Producer side of a completion feed.
#[derive(Debug)]
pub struct FeedSender {
    tx: mpsc::Sender<FeedEvent>,
}

/// Create a connected sender/feed pair.
pub fn channel(capacity: usize) -> (FeedSender, CompletionFeed) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FeedSender { tx }, CompletionFeed { rx })
}

impl CompletionFeed {
    /// Wait for the next event. `None` means the producer went away without
    /// terminating the feed.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }

    /// A feed that replays fixed fragments and then ends.
    pub fn from_fragments<I, S>(fragments: I, continuation: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut events: Vec<FeedEvent> = fragments
            .into_iter()
            .map(|f| FeedEvent::Fragment(f.into()))
            .collect();
        events.push(FeedEvent::End { continuation });
        Self::from_events(events)
    }

    /// A feed that replays the given events verbatim.
    pub fn from_events(events: Vec<FeedEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity matches the event count, so this cannot fail.
            let _ = tx.try_send(event);
        }
        Self { rx }
    }
}

impl FeedSender {
    /// Push a fragment. Returns `false` once the consumer has gone away.
    pub async fn fragment(&self, text: impl Into<String>) -> bool {
        self.tx.send(FeedEvent::Fragment(text.into())).await.is_ok()
    }

    /// Terminate the feed with the end-of-answer marker.
    pub async fn finish(self, continuation: Option<String>) {
        let _ = self.tx.send(FeedEvent::End { continuation }).await;
    }

    /// Terminate the feed with an error.
    pub async fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(FeedEvent::Error(message.into())).await;
    }

    /// Check if the consumer dropped the feed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
