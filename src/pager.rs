//! Pull-based windowed loader: plans contiguous ranges to fetch around the
//! last accessed position, supersedes in-flight loads when the position
//! jumps, and retains a bounded positional cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RepageError, Result};
use crate::range::{chunked, Range};
use crate::snapshot::{DataPortion, LoadState, PagingSnapshot, Position};
use crate::source::PullSource;

/// Tunables for [`Pager`]. Access-event debounce is hard-coded to 300ms
/// per the spec and is not configurable here.
#[derive(Debug, Clone)]
pub struct PagerConfig {
    /// Target chunk width.
    pub load_size: u64,
    /// Half-width of the window the planner tries to have loaded on each
    /// side of the access position.
    pub preload_size: u64,
    /// Half-width of the retention window; values outside are evicted.
    pub cache_size: u64,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            load_size: 20,
            preload_size: 60,
            cache_size: 100,
        }
    }
}

impl PagerConfig {
    /// Fails fast on non-positive tunables.
    pub fn validate(&self) -> Result<()> {
        if self.load_size == 0 {
            return Err(RepageError::InvalidConfig("load_size must be positive".into()));
        }
        if self.preload_size == 0 {
            return Err(RepageError::InvalidConfig("preload_size must be positive".into()));
        }
        if self.cache_size == 0 {
            return Err(RepageError::InvalidConfig("cache_size must be positive".into()));
        }
        Ok(())
    }
}

const ACCESS_DEBOUNCE: Duration = Duration::from_millis(300);

type Callback = Arc<dyn Fn(Position) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Increasing,
    Decreasing,
}

struct LoaderHandle {
    token: CancellationToken,
    planned_range: Range,
}

struct Shared<T> {
    values: BTreeMap<Position, T>,
    total_size: u64,
    load_state: LoadState,
    last_read_key: i64,
    current_load: Option<LoaderHandle>,
    /// Bumped on every new loader; lets a cancelled/superseded loader detect
    /// that it is no longer the current one before writing back state.
    generation: u64,
}

/// Pull-based windowed loader.
///
/// Consumers call [`Pager::subscribe`] to get a `watch::Receiver` of
/// [`PagingSnapshot`]s. Reading a position through the snapshot's `get`
/// drives planning via the access-callback; see module docs.
pub struct Pager<S: PullSource> {
    config: PagerConfig,
    shared: Arc<Mutex<Shared<S::Item>>>,
    snapshot_tx: tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    scope: CancellationToken,
    scheduler: Option<tokio::task::JoinHandle<()>>,
}

impl<S: PullSource + 'static> Pager<S> {
    /// Builds a pager over `source`. Spawns the debounced planning
    /// scheduler immediately; it runs until the pager is dropped.
    pub fn new(source: S, config: PagerConfig) -> Result<Self> {
        config.validate()?;
        let source = Arc::new(source);
        let scope = CancellationToken::new();

        let shared = Arc::new(Mutex::new(Shared {
            values: BTreeMap::new(),
            total_size: 0,
            load_state: LoadState::Success,
            last_read_key: -1,
            current_load: None,
            generation: 0,
        }));

        let (access_tx, _access_rx0) = tokio::sync::watch::channel(None);
        let on_access: Callback = {
            let access_tx = access_tx.clone();
            Arc::new(move |k: Position| {
                let _ = access_tx.send(Some(k as i64));
            })
        };
        let on_retry: Callback = {
            let access_tx = access_tx.clone();
            Arc::new(move |k: Position| {
                let _ = access_tx.send(Some(k as i64));
            })
        };

        let initial = build_snapshot(&shared.lock(), on_access.clone(), on_retry.clone());
        let (snapshot_tx, _snapshot_rx0) = tokio::sync::watch::channel(initial);

        let scheduler = {
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
            shared,
            snapshot_tx,
            scope,
            scheduler: Some(scheduler),
        })
    }

    /// Subscribes to this pager's stream of snapshots.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<PagingSnapshot<S::Item>> {
        self.snapshot_tx.subscribe()
    }

    /// The tunables this pager was constructed with.
    pub fn config(&self) -> &PagerConfig {
        &self.config
    }
}

impl<S: PullSource> Drop for Pager<S> {
    fn drop(&mut self) {
        self.scope.cancel();
        if let Some(handle) = self.scheduler.take() {
            handle.abort();
        }
    }
}

fn build_snapshot<T: Clone>(shared: &Shared<T>, on_access: Callback, on_retry: Callback) -> PagingSnapshot<T> {
    PagingSnapshot::new(
        shared.total_size,
        shared.values.clone(),
        shared.load_state.clone(),
        on_access,
        on_retry,
    )
}

#[allow(clippy::too_many_arguments)]
async fn run_scheduler<S: PullSource + 'static>(
    shared: Arc<Mutex<Shared<S::Item>>>,
    source: Arc<S>,
    config: PagerConfig,
    access_rx: &mut tokio::sync::watch::Receiver<Option<i64>>,
    snapshot_tx: tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    on_access: Callback,
    on_retry: Callback,
    scope: CancellationToken,
) {
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

        // Debounce: keep draining updates until 300ms pass with no change.
        let mut k = *access_rx.borrow_and_update();
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(ACCESS_DEBOUNCE) => break,
                changed = access_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    k = *access_rx.borrow_and_update();
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

        dispatch(
            &shared,
            &source,
            &config,
            k,
            &snapshot_tx,
            on_access.clone(),
            on_retry.clone(),
            &scope,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch<S: PullSource + 'static>(
    shared: &Arc<Mutex<Shared<S::Item>>>,
    source: &Arc<S>,
    config: &PagerConfig,
    k: i64,
    snapshot_tx: &tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    on_access: Callback,
    on_retry: Callback,
    scope: &CancellationToken,
) {
    let mut guard = shared.lock();

    if let Some(active) = &guard.current_load {
        if k >= active.planned_range.first && k <= active.planned_range.last {
            guard.last_read_key = k;
            return;
        }
    }

    let direction = if guard.last_read_key >= 0 && k < guard.last_read_key {
        Direction::Decreasing
    } else {
        Direction::Increasing
    };

    if let Some(active) = guard.current_load.take() {
        debug!(superseded_by = k, "cancelling in-flight pager load");
        active.token.cancel();
    }

    guard.generation += 1;
    let generation = guard.generation;
    let token = scope.child_token();
    guard.current_load = Some(LoaderHandle {
        token: token.clone(),
        planned_range: Range::new(0, -1), // filled in by the loader once planned.
    });
    guard.last_read_key = k;
    drop(guard);

    let shared = shared.clone();
    let source = source.clone();
    let config = config.clone();
    let snapshot_tx = snapshot_tx.clone();
    tokio::spawn(async move {
        run_loader(shared, source, config, k, direction, generation, token, snapshot_tx, on_access, on_retry).await;
    });
}

fn cache_window(coerced: i64, cache_size: u64) -> Range {
    Range::new(coerced - cache_size as i64, coerced + cache_size as i64)
}

fn compute_data_range<T>(values: &BTreeMap<Position, T>) -> Option<Range> {
    if values.is_empty() {
        return None;
    }
    let keys: Vec<i64> = values.keys().map(|k| *k as i64).collect();
    let mean = keys.iter().sum::<i64>() / keys.len() as i64;
    let nearest_idx = keys
        .iter()
        .enumerate()
        .min_by_key(|(_, k)| (*k - mean).abs())
        .map(|(i, _)| i)
        .unwrap();

    let mut lo = nearest_idx;
    let mut hi = nearest_idx;
    while lo > 0 && keys[lo - 1] == keys[lo] - 1 {
        lo -= 1;
    }
    while hi + 1 < keys.len() && keys[hi + 1] == keys[hi] + 1 {
        hi += 1;
    }
    Some(Range::new(keys[lo], keys[hi]))
}

fn edge_extend(pieces: SmallVec<[Range; 2]>, planned_range: Range, load_size: i64) -> Vec<Range> {
    pieces
        .into_iter()
        .map(|p| {
            let mut r = p;
            if r.first == planned_range.first && r.width() < load_size {
                let new_first = (r.last - load_size + 1).max(0);
                r = Range::new(new_first, r.last);
            }
            if r.last == planned_range.last && r.width() < load_size {
                r = Range::new(r.first, r.first + load_size - 1);
            }
            r
        })
        .collect()
}

struct Plan {
    planned_range: Range,
    queue: Vec<Range>,
}

fn build_plan<T>(values: &BTreeMap<Position, T>, config: &PagerConfig, k: i64, direction: Direction, total_size: u64) -> Plan {
    let load_size = config.load_size as i64;
    let preload_size = config.preload_size as i64;

    let coerced = k.clamp(0, (total_size.max(1) as i64) - 1);

    let planned_range = if total_size > 0 {
        Range::new(coerced - preload_size, coerced + preload_size - 1)
            .coerce_in(Range::new(0, total_size as i64 - 1))
    } else {
        Range::new(0, load_size - 1)
    };

    let data_range = compute_data_range(values);

    let half = load_size / 2;
    let primary_raw = Range::new(coerced - half, coerced - half + load_size - 1).coerce_in(planned_range);
    let primary_chunk = primary_raw.expand_to(load_size, planned_range.last);

    let before_region = Range::new(planned_range.first, primary_chunk.first - 1);
    let after_region = Range::new(primary_chunk.last + 1, planned_range.last);

    let before_raw = crate::range::subtract(before_region, data_range);
    let after_raw = crate::range::subtract(after_region, data_range);

    let before_list = edge_extend(before_raw, planned_range, load_size);
    let after_list = edge_extend(after_raw, planned_range, load_size);

    let primary_minus_data = crate::range::subtract(primary_chunk, data_range);
    let prioritized_chunks: Vec<Range> = primary_minus_data
        .into_iter()
        .flat_map(|p| chunked(p, load_size))
        .collect();
    let before_chunks: Vec<Range> = before_list.into_iter().flat_map(|p| chunked(p, load_size)).collect();
    let after_chunks: Vec<Range> = after_list.into_iter().flat_map(|p| chunked(p, load_size)).collect();

    let mut tail = match direction {
        Direction::Increasing => {
            let mut t = after_chunks;
            t.extend(before_chunks);
            t
        }
        Direction::Decreasing => {
            let mut t = before_chunks;
            t.extend(after_chunks);
            t
        }
    };
    tail.sort_by_key(|c| (c.first - k).abs());

    let mut queue = prioritized_chunks;
    queue.extend(tail);

    Plan { planned_range, queue }
}

#[allow(clippy::too_many_arguments)]
async fn run_loader<S: PullSource + 'static>(
    shared: Arc<Mutex<Shared<S::Item>>>,
    source: Arc<S>,
    config: PagerConfig,
    k: i64,
    direction: Direction,
    generation: u64,
    token: CancellationToken,
    snapshot_tx: tokio::sync::watch::Sender<PagingSnapshot<S::Item>>,
    on_access: Callback,
    on_retry: Callback,
) {
    let (coerced, queue) = {
        let mut guard = shared.lock();
        if guard.generation != generation {
            return;
        }
        let total_size = guard.total_size;
        let coerced = k.clamp(0, (total_size.max(1) as i64) - 1);
        let window = cache_window(coerced, config.cache_size);
        guard.values.retain(|pos, _| {
            let p = *pos as i64;
            p >= window.first && p <= window.last
        });

        let plan = build_plan(&guard.values, &config, k, direction, total_size);
        if let Some(active) = &mut guard.current_load {
            active.planned_range = plan.planned_range;
        }

        if !plan.queue.is_empty() {
            guard.load_state = LoadState::Loading;
        } else {
            guard.load_state = LoadState::Success;
            guard.current_load = None;
        }

        let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
        let _ = snapshot_tx.send(snap);

        (coerced, plan.queue)
    };

    if queue.is_empty() {
        return;
    }

    for chunk in queue {
        if token.is_cancelled() {
            return;
        }
        let mut stream = source.read_data(chunk.first as u64, chunk.width() as u64);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(chunk.first, "pager loader cancelled mid-fetch");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(portion)) => {
                            let mut guard = shared.lock();
                            if guard.generation != generation {
                                return;
                            }
                            merge_portion(&mut guard, coerced, config.cache_size, portion);
                            let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
                            drop(guard);
                            let _ = snapshot_tx.send(snap);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, key = k, "pager load failed");
                            let mut guard = shared.lock();
                            if guard.generation == generation {
                                guard.load_state = LoadState::Error(RepageError::from_source(e), k.max(0) as Position);
                                guard.current_load = None;
                                let snap = build_snapshot(&guard, on_access.clone(), on_retry.clone());
                                drop(guard);
                                let _ = snapshot_tx.send(snap);
                            }
                            return;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    let mut guard = shared.lock();
    if guard.generation == generation {
        guard.load_state = LoadState::Success;
        guard.current_load = None;
        let snap = build_snapshot(&guard, on_access, on_retry);
        drop(guard);
        let _ = snapshot_tx.send(snap);
    }
}

fn merge_portion<T>(guard: &mut Shared<T>, coerced: i64, cache_size: u64, portion: DataPortion<T>) {
    let window = cache_window(coerced, cache_size);
    if portion.total_size != guard.total_size {
        guard.total_size = portion.total_size;
        guard.values = portion
            .values
            .into_iter()
            .filter(|(pos, _)| {
                let p = *pos as i64;
                p >= window.first && p <= window.last
            })
            .collect();
    } else {
        guard.values.extend(portion.values);
        guard.values.retain(|pos, _| {
            let p = *pos as i64;
            p >= window.first && p <= window.last
        });
    }
}
