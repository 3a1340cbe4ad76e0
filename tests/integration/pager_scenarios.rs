//! Pager scenarios from §8: initial access, jump, failing-chunk + retry.

mod support;

use std::time::Duration;

use repage::{ItemState, LoadState, Pager, PagerConfig};
use support::FakePullSource;

fn config() -> PagerConfig {
    PagerConfig {
        load_size: 20,
        preload_size: 60,
        cache_size: 100,
    }
}

async fn advance_past_debounce() {
    tokio::time::advance(Duration::from_millis(310)).await;
    tokio::task::yield_now().await;
}

#[tokio::test(start_paused = true)]
async fn initial_access_to_fifty_loads_and_caches() {
    let source = FakePullSource::new(1000);
    let pager = Pager::new(source, config()).expect("valid config");
    let mut rx = pager.subscribe();

    let snap = rx.borrow().clone();
    assert_eq!(snap.get(50), ItemState::Loading);

    advance_past_debounce().await;
    for _ in 0..20 {
        if rx.borrow().load_state == LoadState::Success && rx.borrow().get(50).is_loaded() {
            break;
        }
        rx.changed().await.unwrap();
    }

    let snap = rx.borrow().clone();
    assert_eq!(snap.load_state, LoadState::Success);
    assert_eq!(snap.get(50), ItemState::Loaded(50));
    assert!(snap.first_key() >= 0);
    assert!(snap.last_key() >= 50);
    assert!(snap.values().len() as u64 <= 200);
}

#[tokio::test(start_paused = true)]
async fn jump_from_fifty_to_four_hundred_reloads_window() {
    let source = FakePullSource::new(1000);
    let pager = Pager::new(source, config()).expect("valid config");
    let mut rx = pager.subscribe();

    rx.borrow().get(50);
    advance_past_debounce().await;
    loop {
        if rx.borrow().load_state == LoadState::Success {
            break;
        }
        rx.changed().await.unwrap();
    }

    rx.borrow().get(400);
    advance_past_debounce().await;
    loop {
        if rx.borrow().load_state == LoadState::Success && rx.borrow().get(400).is_loaded() {
            break;
        }
        rx.changed().await.unwrap();
    }

    let snap = rx.borrow().clone();
    assert!(snap.first_key() >= 400 - 60);
    assert!(snap.last_key() < 400 + 60);
}

#[tokio::test(start_paused = true)]
async fn failing_chunk_then_retry_recovers() {
    let source = FakePullSource::new(1000).fail_once_on(190, 20);
    let pager = Pager::new(source, config()).expect("valid config");
    let mut rx = pager.subscribe();

    rx.borrow().get(200);
    advance_past_debounce().await;
    loop {
        if matches!(rx.borrow().load_state, LoadState::Error(_, 200)) {
            break;
        }
        rx.changed().await.unwrap();
    }

    let snap = rx.borrow().clone();
    assert!(matches!(snap.load_state, LoadState::Error(_, 200)));

    // Retry with a distinct key to bypass the debouncer's distinct-until-changed filter.
    snap.retry(201);
    advance_past_debounce().await;
    loop {
        if rx.borrow().load_state == LoadState::Success && rx.borrow().get(200).is_loaded() {
            break;
        }
        rx.changed().await.unwrap();
    }

    let snap = rx.borrow().clone();
    assert_eq!(snap.load_state, LoadState::Success);
    assert_eq!(snap.get(200), ItemState::Loaded(200));
}
