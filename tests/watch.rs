//! Push-mode dispatcher: events flow into a caller-owned channel until the
//! watch is stopped or fails.

mod common;

use std::time::Duration;

use alloy::primitives::U256;
use common::{garbled_log, relay, submit_log, MockBackend};
use testimonium_client::error::{BackendError, BindError};
use testimonium_client::ethereum::contract::WatchOpts;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_watch_forwards_events_in_order() {
    let mock = MockBackend::new();
    let relay = relay(&mock);
    let (tx, mut rx) = mpsc::channel(8);

    let handle = relay
        .filterer
        .watch_submit_block_header(&WatchOpts::default(), tx)
        .await
        .unwrap();
    let feed = mock.take_feed();

    for nonce in 1..=3 {
        assert!(feed.deliver(submit_log(0xA0, nonce, 40 + nonce, 0)).await);
    }

    for nonce in 1..=3u64 {
        let event = timeout(STEP, rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.nonce, U256::from(nonce));
        assert_eq!(event.raw.block_number, Some(40 + nonce));
    }

    handle.unsubscribe();
    assert_eq!(timeout(STEP, handle.wait()).await.unwrap(), Ok(()));
    assert_eq!(mock.unsubscribes(), 1);
}

#[tokio::test]
async fn test_watch_stops_on_first_decode_failure() {
    let mock = MockBackend::new();
    let relay = relay(&mock);
    let (tx, mut rx) = mpsc::channel(8);

    let handle = relay
        .filterer
        .watch_submit_block_header(&WatchOpts::default(), tx)
        .await
        .unwrap();
    let feed = mock.take_feed();

    assert!(feed.deliver(submit_log(0xA0, 1, 50, 0)).await);
    assert!(feed.deliver(garbled_log(51, 0)).await);
    // Never forwarded: the watch is already over.
    let _ = feed.try_deliver(submit_log(0xB0, 2, 52, 0));

    let result = timeout(STEP, handle.wait()).await.unwrap();
    assert!(matches!(result, Err(BindError::Decode { .. })));

    assert_eq!(rx.recv().await.map(|e| e.nonce), Some(U256::from(1u64)));
    assert!(rx.recv().await.is_none());
    assert_eq!(mock.unsubscribes(), 1);
}

#[tokio::test]
async fn test_watch_reports_subscription_error() {
    let mock = MockBackend::new();
    let relay = relay(&mock);
    let (tx, mut rx) = mpsc::channel(8);

    let handle = relay
        .filterer
        .watch_submit_block_header(&WatchOpts::default(), tx)
        .await
        .unwrap();
    let mut feed = mock.take_feed();
    feed.fail(BackendError::Rpc("websocket closed".into()));

    let result = timeout(STEP, handle.wait()).await.unwrap();
    assert_eq!(
        result,
        Err(BindError::Subscription(BackendError::Rpc(
            "websocket closed".into()
        )))
    );
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_watch_cancellation_is_not_an_error() {
    let mock = MockBackend::new();
    let relay = relay(&mock);
    let (tx, _rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();

    let opts = WatchOpts {
        start: None,
        cancel: cancel.clone(),
    };
    let handle = relay
        .filterer
        .watch_submit_block_header(&opts, tx)
        .await
        .unwrap();
    let _feed = mock.take_feed();

    cancel.cancel();
    assert_eq!(timeout(STEP, handle.wait()).await.unwrap(), Ok(()));
    assert_eq!(mock.unsubscribes(), 1);
}

#[tokio::test]
async fn test_cancelled_watch_forwards_nothing() {
    for _ in 0..20 {
        let mock = MockBackend::new();
        let relay = relay(&mock);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let opts = WatchOpts {
            start: None,
            cancel: cancel.clone(),
        };
        let handle = relay
            .filterer
            .watch_submit_block_header(&opts, tx)
            .await
            .unwrap();
        let feed = mock.take_feed();
        cancel.cancel();
        // Refused once the dispatcher has already released the subscription.
        let _ = feed.try_deliver(submit_log(0xA0, 1, 60, 0));

        assert_eq!(timeout(STEP, handle.wait()).await.unwrap(), Ok(()));
        assert!(rx.recv().await.is_none());
    }
}

#[tokio::test]
async fn test_watch_interrupted_while_sink_is_full() {
    let mock = MockBackend::new();
    let relay = relay(&mock);
    // Capacity one and nobody reading: the second event blocks in delivery.
    let (tx, mut rx) = mpsc::channel(1);

    let handle = relay
        .filterer
        .watch_submit_block_header(&WatchOpts::default(), tx)
        .await
        .unwrap();
    let mut feed = mock.take_feed();
    assert!(feed.deliver(submit_log(0xA0, 1, 60, 0)).await);
    assert!(feed.deliver(submit_log(0xB0, 2, 61, 0)).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    feed.fail(BackendError::Rpc("node went away".into()));

    let result = timeout(STEP, handle.wait()).await.unwrap();
    assert!(matches!(result, Err(BindError::Subscription(_))));
    assert_eq!(rx.recv().await.map(|e| e.nonce), Some(U256::from(1u64)));
}

#[tokio::test]
async fn test_watch_ends_when_sink_dropped() {
    let mock = MockBackend::new();
    let relay = relay(&mock);
    let (tx, rx) = mpsc::channel(1);

    let handle = relay
        .filterer
        .watch_submit_block_header(&WatchOpts::default(), tx)
        .await
        .unwrap();
    let feed = mock.take_feed();
    drop(rx);
    assert!(feed.deliver(submit_log(0xA0, 1, 70, 0)).await);

    assert_eq!(timeout(STEP, handle.wait()).await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_dropping_handle_stops_watch() {
    let mock = MockBackend::new();
    let relay = relay(&mock);
    let (tx, mut rx) = mpsc::channel(1);

    let handle = relay
        .filterer
        .watch_submit_block_header(&WatchOpts::default(), tx)
        .await
        .unwrap();
    let _feed = mock.take_feed();
    drop(handle);

    // The task exits and drops its sender.
    assert!(timeout(STEP, rx.recv()).await.unwrap().is_none());
    assert_eq!(mock.unsubscribes(), 1);
}

#[tokio::test]
async fn test_watch_open_failure() {
    let mock = MockBackend::new();
    mock.fail_subscribe(BackendError::Rpc("notifications not supported".into()));
    let relay = relay(&mock);
    let (tx, _rx) = mpsc::channel(1);

    let err = relay
        .filterer
        .watch_submit_block_header(&WatchOpts::default(), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, BindError::Subscription(BackendError::Rpc(_))));
}
