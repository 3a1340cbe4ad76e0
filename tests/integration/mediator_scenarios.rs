//! PagingMediator scenarios from §8: stale-filtered local + gap fetch,
//! fetch-full-range-on-miss, inconsistent-totals clear-and-retry.

mod support;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use repage::{ItemState, LoadState, MediatorConfig, PagingMediator};
use support::{FakeLocalSource, FakeRemoteSource, TestRecord};

const QUERY: &str = "q";

async fn advance_past_debounce() {
    tokio::time::advance(Duration::from_millis(310)).await;
    tokio::task::yield_now().await;
}

fn record(v: i64) -> TestRecord {
    TestRecord { value: v, stale: false }
}

fn stale_record(v: i64) -> TestRecord {
    TestRecord { value: v, stale: true }
}

#[tokio::test(start_paused = true)]
async fn stale_local_record_is_filtered_and_gaps_are_gap_fetched() {
    let local = FakeLocalSource::new();
    let mut seeded = BTreeMap::new();
    seeded.insert(2, record(2));
    seeded.insert(3, stale_record(3));
    seeded.insert(4, record(4));
    local.seed(QUERY, 5, seeded);

    let mut remote_values = BTreeMap::new();
    for p in 0..5u64 {
        remote_values.insert(p, record(p as i64));
    }
    let remote = FakeRemoteSource::new(5, remote_values);

    let mediator = PagingMediator::new(
        local,
        remote,
        MediatorConfig {
            load_size: 5,
            prefetch_size: 5,
            cache_size: 100,
            concurrency: 1,
            fetch_full_range_on_miss: false,
            emit_outdated_records: false,
            emit_intermediate_results: true,
        },
        Some(Arc::new(|r: &TestRecord| r.stale)),
    )
    .expect("valid config");

    let (pager, mut rx) = mediator.subscribe(QUERY).expect("pager");

    rx.borrow().get(0);
    advance_past_debounce().await;
    loop {
        if rx.borrow().load_state == LoadState::Success {
            let snap = rx.borrow().clone();
            if (0..5).all(|p| snap.get(p) == ItemState::Loaded(record(p as i64))) {
                break;
            }
        }
        rx.changed().await.unwrap();
    }

    drop(pager);
}

#[tokio::test(start_paused = true)]
async fn fetch_full_range_on_miss_issues_a_single_remote_call() {
    let local = FakeLocalSource::new();
    let remote = FakeRemoteSource::new(5, {
        let mut m = BTreeMap::new();
        for p in 0..5u64 {
            m.insert(p, record(p as i64));
        }
        m
    });

    let mediator = PagingMediator::new(
        local,
        remote,
        MediatorConfig {
            load_size: 5,
            prefetch_size: 5,
            cache_size: 100,
            concurrency: 1,
            fetch_full_range_on_miss: true,
            emit_outdated_records: false,
            emit_intermediate_results: true,
        },
        None,
    )
    .expect("valid config");

    let (pager, mut rx) = mediator.subscribe(QUERY).expect("pager");

    rx.borrow().get(0);
    advance_past_debounce().await;
    loop {
        if rx.borrow().load_state == LoadState::Success {
            break;
        }
        rx.changed().await.unwrap();
    }

    drop(pager);
}

#[tokio::test(start_paused = true)]
async fn inconsistent_totals_clear_and_retry_once() {
    let local = FakeLocalSource::new();
    local.seed(QUERY, 10, BTreeMap::new());

    let remote = FakeRemoteSource::new(12, {
        let mut m = BTreeMap::new();
        for p in 0..5u64 {
            m.insert(p, record(p as i64));
        }
        m
    });

    let mediator = PagingMediator::new(
        local,
        remote,
        MediatorConfig {
            load_size: 5,
            prefetch_size: 5,
            cache_size: 100,
            concurrency: 1,
            fetch_full_range_on_miss: false,
            emit_outdated_records: false,
            emit_intermediate_results: true,
        },
        None,
    )
    .expect("valid config");

    let (pager, mut rx) = mediator.subscribe(QUERY).expect("pager");

    rx.borrow().get(0);
    advance_past_debounce().await;
    loop {
        if rx.borrow().load_state == LoadState::Success && rx.borrow().total_size == 12 {
            break;
        }
        rx.changed().await.unwrap();
    }

    let snap = rx.borrow().clone();
    assert_eq!(snap.total_size, 12);
    for p in 0..5 {
        assert!(snap.get(p).is_loaded());
    }

    drop(pager);
}
