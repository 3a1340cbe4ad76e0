//! StreamingPager scenarios from §8: total updates, access opens a
//! subscription, total shrink cancels overlapping streams, total-stream
//! error + retry.

mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use repage::{ItemState, LoadState, StreamingPager, StreamingPagerConfig};
use support::FakeStreamingSource;

fn config() -> StreamingPagerConfig {
    StreamingPagerConfig {
        load_size: 5,
        preload_size: 5,
        cache_size: 100,
        close_threshold: 5,
        key_debounce_ms: 300,
    }
}

async fn advance_past_debounce() {
    tokio::time::advance(Duration::from_millis(310)).await;
    tokio::task::yield_now().await;
}

#[tokio::test(start_paused = true)]
async fn total_size_updates_propagate() {
    let source = FakeStreamingSource::new();
    let pager = StreamingPager::new(source.clone(), config()).expect("valid config");
    let mut rx = pager.subscribe();

    assert_eq!(rx.borrow().total_size, 0);

    source.set_total(50);
    tokio::task::yield_now().await;
    loop {
        if rx.borrow().total_size == 50 {
            break;
        }
        rx.changed().await.unwrap();
    }
    assert_eq!(rx.borrow().total_size, 50);
}

#[tokio::test(start_paused = true)]
async fn access_opens_a_chunk_aligned_subscription() {
    let source = FakeStreamingSource::new();
    source.set_total(50);
    let pager = StreamingPager::new(source.clone(), config()).expect("valid config");
    let mut rx = pager.subscribe();

    // Let the total-size side channel apply before we access.
    tokio::task::yield_now().await;

    rx.borrow().get(0);
    advance_past_debounce().await;
    tokio::task::yield_now().await;

    assert!(source.opened_ranges().contains(&(0, 5)));

    let mut values = BTreeMap::new();
    for p in 0..5u64 {
        values.insert(p, p as i64);
    }
    source.push_portion(0, 5, values);

    loop {
        if rx.borrow().get(0) == ItemState::Loaded(0) {
            break;
        }
        rx.changed().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn total_shrink_cancels_overlapping_subscriptions() {
    let source = FakeStreamingSource::new();
    source.set_total(20);
    let pager = StreamingPager::new(source.clone(), config()).expect("valid config");
    let mut rx = pager.subscribe();
    tokio::task::yield_now().await;

    rx.borrow().get(5);
    advance_past_debounce().await;
    tokio::task::yield_now().await;

    source.set_total(7);
    loop {
        if rx.borrow().total_size == 7 {
            break;
        }
        rx.changed().await.unwrap();
    }

    let snap = rx.borrow().clone();
    assert_eq!(snap.total_size, 7);
    assert!(snap.last_key() <= 6);
}

#[tokio::test(start_paused = true)]
async fn total_stream_error_then_retry_recovers() {
    let source = FakeStreamingSource::new();
    source.fail_total("boom");
    let pager = StreamingPager::new(source.clone(), config()).expect("valid config");
    let mut rx = pager.subscribe();

    loop {
        if matches!(rx.borrow().load_state, LoadState::Error(_, _)) {
            break;
        }
        rx.changed().await.unwrap();
    }

    let snap = rx.borrow().clone();
    snap.retry(0);
    tokio::task::yield_now().await;
    source.set_total(10);

    loop {
        if rx.borrow().total_size == 10 {
            break;
        }
        rx.changed().await.unwrap();
    }
    assert_eq!(rx.borrow().total_size, 10);
}
