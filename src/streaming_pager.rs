//! Push-based windowed loader: maintains a set of chunk-aligned open
//! subscriptions around the last accessed position, opening and closing
//! them as the window shifts, with total size delivered on its own
//! live side-channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RepageError, Result};
use crate::range::{aligned_chunk_containing, aligned_chunk_start, Range};
use crate::snapshot::{LoadState, PagingSnapshot, Position};
use crate::source::StreamingSource;

/// Tunables for [`StreamingPager`].
#[derive(Debug, Clone)]
pub struct StreamingPagerConfig {
    /// Nominal width of each subscribed chunk. Must be positive.
    pub load_size: u64,
    /// Half-width of the window the planner tries to keep subscribed on
    /// each side of the access position.
    pub preload_size: u64,
    /// Half-width of the retention window for merged values.
    pub cache_size: u64,
    /// A subscribed range must move more than this far beyond the active
    /// window to be closed.
    pub close_threshold: u64,
    /// Debounce on access events, in milliseconds.
    pub key_debounce_ms: u64,
}

impl Default for StreamingPagerConfig {
    fn default() -> Self {
        Self {
            load_size: 20,
            preload_size: 60,
            cache_size: 100,
            close_threshold: 20,
            key_debounce_ms: 300,
        }
    }
}

impl StreamingPagerConfig {
    /// Only `load_size` must be strictly positive; the rest may be 0.
    pub fn validate(&self) -> Result<()> {
        if self.load_size == 0 {
            return Err(RepageError::InvalidConfig("load_size must be positive".into()));
        }
        Ok(())
    }
}

struct ActiveStream {
    range: Range,
    token: CancellationToken,
}

struct Shared<T> {
    values: BTreeMap<Position, T>,
    total_size: u64,
    last_read_key: i64,
    previous_key: i64,
    active_streams: Vec<ActiveStream>,
    /// Insertion-ordered; entries outlive their task (a completed or errored
    /// subscription keeps its last state here even after it leaves
    /// `active_streams`).
    range_states: Vec<(Range, LoadState)>,
    total_error: Option<RepageError>,
}

impl<T> Shared<T> {
    fn set_range_state(&mut self, r: Range, state: LoadState) {
        if let Some(entry) = self.range_states.iter_mut().find(|(er, _)| *er == r) {
            entry.1 = state;
        } else {
            self.range_states.push((r, state));
        }
    }

    fn remove_range_state(&mut self, r: Range) {
        self.range_states.retain(|(er, _)| *er != r);
    }

    fn aggregate_load_state(&self) -> LoadState {
        if self.range_states.iter().any(|(_, s)| s.is_loading()) {
            return LoadState::Loading;
        }
        if let Some(e) = &self.total_error {
            return LoadState::Error(e.clone(), 0);
        }
        for (r, s) in &self.range_states {
            if let LoadState::Error(cause, _) = s {
                return LoadState::Error(cause.clone(), r.first.max(0) as Position);
            }
        }
        LoadState::Success
    }
}

type Callback = Arc<dyn Fn(Position) + Send + Sync>;

/// Push-based windowed loader over a [`StreamingSource`].
pub struct StreamingPager<S: StreamingSource> {
    config: StreamingPagerConfig,
    snapshot_tx: tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    scope: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl<S: StreamingSource + 'static> StreamingPager<S> {
    /// Builds a streaming pager over `source`. Spawns the total-size
    /// side-channel task and the access-debounce scheduler immediately.
    pub fn new(source: S, config: StreamingPagerConfig) -> Result<Self> {
        config.validate()?;
        let source = Arc::new(source);
        let scope = CancellationToken::new();

        let shared = Arc::new(Mutex::new(Shared::<S::Item> {
            values: BTreeMap::new(),
            total_size: 0,
            last_read_key: -1,
            previous_key: -1,
            active_streams: Vec::new(),
            range_states: Vec::new(),
            total_error: None,
        }));

        let (access_tx, _access_rx0) = tokio::sync::watch::channel(None);
        let total_retry = Arc::new(Notify::new());

        let on_access: Callback = {
            let access_tx = access_tx.clone();
            Arc::new(move |k: Position| {
                let _ = access_tx.send(Some(k as i64));
            })
        };
        let on_retry: Callback = {
            let access_tx = access_tx.clone();
            let total_retry = total_retry.clone();
            Arc::new(move |k: Position| {
                let _ = access_tx.send(Some(k as i64));
                total_retry.notify_one();
            })
        };

        let initial = build_snapshot(&shared.lock(), on_access.clone(), on_retry.clone());
        let (snapshot_tx, _snapshot_rx0) = tokio::sync::watch::channel(initial);

        let total_task = {
            let shared = shared.clone();
            let source = source.clone();
            let snapshot_tx = snapshot_tx.clone();
            let on_access = on_access.clone();
            let on_retry = on_retry.clone();
            let access_tx = access_tx.clone();
            let scope = scope.clone();
            let total_retry = total_retry.clone();
            tokio::spawn(async move {
                run_total_channel(shared, source, snapshot_tx, on_access, on_retry, access_tx, scope, total_retry).await;
            })
        };

        let scheduler_task = {
            let shared = shared.clone();
            let source = source.clone();
            let config = config.clone();
            let mut access_rx = access_tx.subscribe();
            let snapshot_tx = snapshot_tx.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                run_scheduler(shared, source, config, &mut access_rx, snapshot_tx, on_access, on_retry, scope).await;
            })
        };

        Ok(Self {
            config,
            snapshot_tx,
            scope,
            tasks: vec![total_task, scheduler_task],
        })
    }

    /// Subscribes to this pager's stream of snapshots.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<PagingSnapshot<S::Item>> {
        self.snapshot_tx.subscribe()
    }

    /// The tunables this pager was constructed with.
    pub fn config(&self) -> &StreamingPagerConfig {
        &self.config
    }
}

impl<S: StreamingSource> Drop for StreamingPager<S> {
    fn drop(&mut self) {
        self.scope.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn build_snapshot<T: Clone>(shared: &Shared<T>, on_access: Callback, on_retry: Callback) -> PagingSnapshot<T> {
    PagingSnapshot::new(
        shared.total_size,
        shared.values.clone(),
        shared.aggregate_load_state(),
        on_access,
        on_retry,
    )
}

#[allow(clippy::too_many_arguments)]
async fn run_total_channel<S: StreamingSource + 'static>(
    shared: Arc<Mutex<Shared<S::Item>>>,
    source: Arc<S>,
    snapshot_tx: tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    on_access: Callback,
    on_retry: Callback,
    access_tx: tokio::sync::watch::Sender<Option<i64>>,
    scope: CancellationToken,
    total_retry: Arc<Notify>,
) {
    loop {
        let mut stream = source.read_total();
        let mut saw_error = false;
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                next = stream.next() => {
                    match next {
                        Some(Ok(new_total)) => {
                            let mut guard = shared.lock();
                            if new_total == guard.total_size {
                                continue;
                            }
                            guard.total_error = None;
                            guard.total_size = new_total;
                            let limit = new_total as i64;
                            guard.values.retain(|pos, _| (*pos as i64) < limit);

                            let mut to_close = Vec::new();
                            for stream_entry in &guard.active_streams {
                                if stream_entry.range.last >= limit {
                                    to_close.push(stream_entry.range);
                                }
                            }
                            for r in &to_close {
                                if let Some(pos) = guard.active_streams.iter().position(|s| s.range == *r) {
                                    let entry = guard.active_streams.remove(pos);
                                    entry.token.cancel();
                                }
                                guard.remove_range_state(*r);
                            }

                            let realign = guard.last_read_key > limit;
                            let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
                            drop(guard);
                            let _ = snapshot_tx.send(snap);
                            if realign {
                                let _ = access_tx.send(Some(new_total as i64));
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "streaming total subscription failed");
                            let mut guard = shared.lock();
                            guard.total_error = Some(RepageError::from_source(e));
                            let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
                            drop(guard);
                            let _ = snapshot_tx.send(snap);
                            saw_error = true;
                            break;
                        }
                        None => {
                            return;
                        }
                    }
                }
            }
        }

        if !saw_error {
            return;
        }

        tokio::select! {
            _ = scope.cancelled() => return,
            _ = total_retry.notified() => {
                debug!("restarting total-size subscription after retry");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduler<S: StreamingSource + 'static>(
    shared: Arc<Mutex<Shared<S::Item>>>,
    source: Arc<S>,
    config: StreamingPagerConfig,
    access_rx: &mut tokio::sync::watch::Receiver<Option<i64>>,
    snapshot_tx: tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    on_access: Callback,
    on_retry: Callback,
    scope: CancellationToken,
) {
    let debounce = Duration::from_millis(config.key_debounce_ms);
    let mut last_stable: Option<i64> = None;
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            changed = access_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let mut k = *access_rx.borrow_and_update();
        if debounce > Duration::ZERO {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep(debounce) => break,
                    changed = access_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        k = *access_rx.borrow_and_update();
                    }
                }
            }
        }

        let Some(k) = k else { continue };
        if k < 0 {
            continue;
        }
        if last_stable == Some(k) {
            continue;
        }
        last_stable = Some(k);

        adjust_window(&shared, &source, &config, k, &snapshot_tx, on_access.clone(), on_retry.clone(), &scope);
    }
}

#[allow(clippy::too_many_arguments)]
fn adjust_window<S: StreamingSource + 'static>(
    shared: &Arc<Mutex<Shared<S::Item>>>,
    source: &Arc<S>,
    config: &StreamingPagerConfig,
    k: i64,
    snapshot_tx: &tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    on_access: Callback,
    on_retry: Callback,
    scope: &CancellationToken,
) {
    let load_size = config.load_size as i64;
    let preload_size = config.preload_size as i64;
    let close_threshold = config.close_threshold as i64;

    let mut guard = shared.lock();
    guard.active_streams.retain(|s| !s.token.is_cancelled());

    let direction_forward = k > guard.last_read_key;
    let total_size = guard.total_size;

    let target_chunks: Vec<Range> = if total_size == 0 {
        vec![Range::new(0, load_size - 1)]
    } else {
        let limit = Range::new(0, (total_size.max(1) as i64) - 1);
        let window_unaligned = Range::new(k - preload_size, k + preload_size).coerce_in(limit);

        let keepers: Vec<Range> = guard
            .active_streams
            .iter()
            .map(|s| s.range)
            .filter(|r| r.intersects(&window_unaligned))
            .collect();

        let base_start = keepers
            .iter()
            .min_by_key(|r| (r.first - k).abs())
            .map(|r| r.first)
            .unwrap_or_else(|| aligned_chunk_start(k, 0, load_size));

        let center_chunk = aligned_chunk_containing(k, base_start, load_size, total_size);
        let window = Range::new(center_chunk.first - preload_size, center_chunk.last + preload_size).coerce_in(limit);

        let mut to_close = Vec::new();
        for s in &guard.active_streams {
            if window.distance_beyond(&s.range) > close_threshold {
                to_close.push(s.range);
            }
        }
        for r in &to_close {
            if let Some(pos) = guard.active_streams.iter().position(|s| s.range == *r) {
                let entry = guard.active_streams.remove(pos);
                entry.token.cancel();
            }
        }

        let mut forward = Vec::new();
        let mut start = center_chunk.last + 1;
        while start <= window.last {
            let end = (start + load_size - 1).min(total_size as i64 - 1);
            forward.push(Range::new(start, end));
            start += load_size;
        }

        let mut backward = Vec::new();
        let mut start = center_chunk.first - load_size;
        while start + load_size - 1 >= window.first {
            let clamped_first = start.max(0);
            backward.push(Range::new(clamped_first, start + load_size - 1));
            start -= load_size;
        }
        backward.reverse();

        let mut chunks = backward;
        chunks.push(center_chunk);
        chunks.extend(forward);
        chunks
    };

    let to_open: Vec<Range> = target_chunks
        .iter()
        .copied()
        .filter(|r| !guard.active_streams.iter().any(|s| s.range == *r))
        .collect();

    for r in &to_open {
        guard.set_range_state(*r, LoadState::Loading);
    }

    let anchor = target_chunks
        .iter()
        .find(|r| k >= r.first && k <= r.last)
        .copied()
        .or_else(|| target_chunks.first().copied());

    let mut sorted = to_open;
    if let Some(anchor) = anchor {
        let half_max = i64::MAX / 2;
        sorted.sort_by_key(|r| {
            let delta = r.first - anchor.first;
            if direction_forward && delta >= 0 {
                delta
            } else if direction_forward && delta < 0 {
                half_max + delta.abs()
            } else if !direction_forward && delta <= 0 {
                delta.abs()
            } else {
                half_max + delta
            }
        });
    }

    guard.previous_key = guard.last_read_key;
    guard.last_read_key = k;

    let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
    drop(guard);
    let _ = snapshot_tx.send(snap);

    for r in sorted {
        let token = scope.child_token();
        {
            let mut guard = shared.lock();
            guard.active_streams.push(ActiveStream { range: r, token: token.clone() });
        }
        let shared = shared.clone();
        let source = source.clone();
        let snapshot_tx = snapshot_tx.clone();
        let on_access = on_access.clone();
        let on_retry = on_retry.clone();
        let cache_size = config.cache_size;
        tokio::spawn(async move {
            run_portion_task(shared, source, r, cache_size, token, snapshot_tx, on_access, on_retry).await;
        });
    }
}

async fn run_portion_task<S: StreamingSource + 'static>(
    shared: Arc<Mutex<Shared<S::Item>>>,
    source: Arc<S>,
    r: Range,
    cache_size: u64,
    token: CancellationToken,
    snapshot_tx: tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    on_access: Callback,
    on_retry: Callback,
) {
    let mut stream = source.read_portion(r.first as u64, r.width() as u64);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(range.first = r.first, "streaming portion subscription cancelled");
                let mut guard = shared.lock();
                guard.active_streams.retain(|s| s.range != r);
                return;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(values)) => {
                        let mut guard = shared.lock();
                        let last_read_key = guard.last_read_key;
                        let window = Range::new(last_read_key - cache_size as i64, last_read_key + cache_size as i64);
                        guard.values.extend(values);
                        guard.values.retain(|pos, _| {
                            let p = *pos as i64;
                            p >= window.first && p <= window.last
                        });
                        guard.set_range_state(r, LoadState::Success);
                        let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
                        drop(guard);
                        let _ = snapshot_tx.send(snap);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, range.first = r.first, "streaming portion subscription failed");
                        let mut guard = shared.lock();
                        guard.set_range_state(r, LoadState::Error(RepageError::from_source(e), r.first.max(0) as Position));
                        guard.active_streams.retain(|s| s.range != r);
                        let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
                        drop(guard);
                        let _ = snapshot_tx.send(snap);
                        return;
                    }
                    None => {
                        let mut guard = shared.lock();
                        guard.set_range_state(r, LoadState::Success);
                        guard.active_streams.retain(|s| s.range != r);
                        let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
                        drop(guard);
                        let _ = snapshot_tx.send(snap);
                        return;
                    }
                }
            }
        }
    }
}
