//! Integration tests for the live output relay.

mod common;

use common::{Call, RecordingTransport};
use relay_bot::feed::FeedEvent;
use relay_bot::{relay, CompletionFeed, ConversationId, RelayError};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const CHAT: ConversationId = ConversationId(7);

fn no_consecutive_duplicates(edits: &[String]) -> bool {
    edits.windows(2).all(|w| w[0] != w[1])
}

/// Feed whose fragments arrive `every` apart, then ends.
fn timed_feed(fragments: Vec<String>, every: Duration) -> CompletionFeed {
    let (tx, feed) = relay_bot::feed::channel(4);
    tokio::spawn(async move {
        for fragment in fragments {
            tokio::time::sleep(every).await;
            if !tx.fragment(fragment).await {
                return;
            }
        }
        tx.finish(Some("conv-1".into())).await;
    });
    feed
}

#[tokio::test]
async fn test_one_send_and_full_text_at_end() {
    let transport = RecordingTransport::new();
    let fragments = ["The", " quick", " brown", " fox", " jumps"];
    let feed = CompletionFeed::from_fragments(fragments, None);

    let report = assert_ok!(
        relay(
            transport.clone(),
            CHAT,
            Some(3),
            feed,
            Duration::from_secs(60),
            &CancellationToken::new(),
        )
        .await
    );

    assert_eq!(transport.sends(), vec!["The".to_string()]);
    assert!(transport.edits().len() <= fragments.len());
    assert_eq!(transport.last_shown().as_deref(), Some("The quick brown fox jumps"));
    assert_eq!(report.text, "The quick brown fox jumps");
    assert!(no_consecutive_duplicates(&transport.edits()));
    // Throttled for the whole turn, so only the final flush edits.
    assert_eq!(report.edits, 1);
}

#[tokio::test]
async fn test_zero_interval_edits_on_every_fragment() {
    let transport = RecordingTransport::new();
    let feed = CompletionFeed::from_fragments(["a", "b", "c", "d"], None);

    let report = relay(
        transport.clone(),
        CHAT,
        None,
        feed,
        Duration::ZERO,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(transport.sends(), vec!["a".to_string()]);
    assert_eq!(transport.edits(), vec!["ab", "abc", "abcd"]);
    assert_eq!(report.edits, 3);
}

#[tokio::test]
async fn test_fragments_after_end_are_not_read() {
    let transport = RecordingTransport::new();
    let feed = CompletionFeed::from_events(vec![
        FeedEvent::Fragment("done".into()),
        FeedEvent::End { continuation: None },
        FeedEvent::Fragment(" extra".into()),
    ]);

    let report = relay(transport.clone(), CHAT, None, feed, Duration::ZERO, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.text, "done");
    assert!(transport.edits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_throttled_edits_respect_interval() {
    let transport = RecordingTransport::new();
    let interval = Duration::from_secs(1);
    let fragments: Vec<String> = (0..25).map(|i| format!("w{i} ")).collect();
    let expected: String = fragments.concat();

    let started = tokio::time::Instant::now();
    let feed = timed_feed(fragments, Duration::from_millis(100));
    let report = relay(transport.clone(), CHAT, None, feed, interval, &CancellationToken::new())
        .await
        .unwrap();
    let duration = started.elapsed();

    assert_eq!(report.text, expected);
    assert_eq!(report.continuation.as_deref(), Some("conv-1"));
    assert_eq!(transport.last_shown(), Some(expected));
    assert!(no_consecutive_duplicates(&transport.edits()));

    let max_edits = (duration.as_secs_f64() / interval.as_secs_f64()).ceil() as usize + 1;
    assert!(
        report.edits <= max_edits,
        "{} edits in {duration:?}",
        report.edits
    );

    // Every edit but the final flush waits a full interval after the
    // previous send or edit.
    let times: Vec<_> = transport
        .timed_calls()
        .into_iter()
        .filter(|(_, c)| !matches!(c, Call::Typing(_)))
        .map(|(at, _)| at)
        .collect();
    let throttled = &times[..times.len() - 1];
    for pair in throttled.windows(2) {
        assert!(pair[1] - pair[0] >= interval, "edits {:?} apart", pair[1] - pair[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_feed_edits_each_fragment() {
    let transport = RecordingTransport::new();
    let fragments = vec!["one".to_string(), " two".to_string(), " three".to_string()];
    let feed = timed_feed(fragments, Duration::from_secs(5));

    let report = relay(
        transport.clone(),
        CHAT,
        None,
        feed,
        Duration::from_secs(1),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(transport.edits(), vec!["one two", "one two three"]);
    assert_eq!(report.edits, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_relay_and_keeps_last_edit() {
    let transport = RecordingTransport::new();
    let cancel = CancellationToken::new();
    let fragments: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    let feed = timed_feed(fragments, Duration::from_millis(300));

    let task = {
        let transport = transport.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            relay(transport, CHAT, None, feed, Duration::from_secs(1), &cancel).await
        })
    };

    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();
    let err = assert_err!(task.await.unwrap());
    assert!(matches!(err, RelayError::Cancelled));

    let shown = transport.last_shown().unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.last_shown().unwrap(), shown);
    assert_eq!(transport.sends().len(), 1);
}
