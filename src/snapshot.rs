//! The immutable, consumer-facing paging snapshot and the small value types
//! that make it up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RepageError;

/// Zero-based absolute index of an item in the dataset for a given query.
pub type Position = u64;

/// A single `{ total_size, values }` value returned by a data source.
///
/// `total_size == 0` means "unknown" (the source has not yet reported a
/// count). Positions are absolute, not relative to the requested range.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPortion<T> {
    /// The source's current total item count, or 0 if unknown.
    pub total_size: u64,
    /// Sparse absolute-position → value map for this portion.
    pub values: BTreeMap<Position, T>,
}

impl<T> DataPortion<T> {
    /// An empty portion with an unknown total.
    pub fn empty() -> Self {
        Self {
            total_size: 0,
            values: BTreeMap::new(),
        }
    }
}

/// The materialization state of one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemState<T> {
    /// This position is materialized.
    Loaded(T),
    /// This position is not materialized; accessing it triggers loading.
    Loading,
}

impl<T> ItemState<T> {
    /// `true` for `Loaded(_)`.
    pub fn is_loaded(&self) -> bool {
        matches!(self, ItemState::Loaded(_))
    }
}

/// Aggregate background-activity state for a paging component.
#[derive(Debug, Clone)]
pub enum LoadState {
    /// No loader is running, or the last run completed without error.
    Success,
    /// At least one loader is in flight.
    Loading,
    /// The most recent terminal failure. `key` is the position whose load
    /// triggered it, used for targeted retry.
    Error(RepageError, Position),
}

impl LoadState {
    /// `true` for `Loading`.
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }
}

impl PartialEq for LoadState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LoadState::Success, LoadState::Success) => true,
            (LoadState::Loading, LoadState::Loading) => true,
            (LoadState::Error(_, a), LoadState::Error(_, b)) => a == b,
            _ => false,
        }
    }
}

type AccessCallback = Arc<dyn Fn(Position) + Send + Sync>;
type RetryCallback = Arc<dyn Fn(Position) + Send + Sync>;

/// Sentinel returned by `first_key`/`last_key` when `values` is empty.
pub const NO_KEY: i64 = -1;

/// The immutable value published to consumers describing the current
/// paged view.
///
/// Snapshots are never mutated; a state change publishes a fresh value.
/// Clones are cheap: `values` is reference-counted, and both callbacks are
/// `Arc<dyn Fn>` shared with the owning component.
#[derive(Clone)]
pub struct PagingSnapshot<T> {
    /// The current known total item count (0 if unknown).
    pub total_size: u64,
    values: Arc<BTreeMap<Position, T>>,
    /// The current aggregate background-load state.
    pub load_state: LoadState,
    on_access: AccessCallback,
    on_retry: RetryCallback,
}

impl<T> fmt::Debug for PagingSnapshot<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagingSnapshot")
            .field("total_size", &self.total_size)
            .field("values", &self.values)
            .field("load_state", &self.load_state)
            .finish()
    }
}

impl<T: Clone> PagingSnapshot<T> {
    /// Builds a snapshot. `on_access`/`on_retry` are invoked by [`Self::get`]
    /// and [`Self::retry`] respectively.
    pub fn new(
        total_size: u64,
        values: BTreeMap<Position, T>,
        load_state: LoadState,
        on_access: AccessCallback,
        on_retry: RetryCallback,
    ) -> Self {
        Self {
            total_size,
            values: Arc::new(values),
            load_state,
            on_access,
            on_retry,
        }
    }

    /// The underlying sparse map of materialized positions.
    pub fn values(&self) -> &BTreeMap<Position, T> {
        &self.values
    }

    /// `true` iff `total_size == 0` (initial/unknown).
    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    /// Minimum materialized position, or [`NO_KEY`] if `values` is empty.
    pub fn first_key(&self) -> i64 {
        self.values
            .keys()
            .next()
            .map(|k| *k as i64)
            .unwrap_or(NO_KEY)
    }

    /// Maximum materialized position, or [`NO_KEY`] if `values` is empty.
    pub fn last_key(&self) -> i64 {
        self.values
            .keys()
            .next_back()
            .map(|k| *k as i64)
            .unwrap_or(NO_KEY)
    }

    /// Reads `position`. Notifies the access-callback as a side effect
    /// regardless of hit/miss, then returns the materialization state.
    pub fn get(&self, position: Position) -> ItemState<T> {
        (self.on_access)(position);
        match self.values.get(&position) {
            Some(v) => ItemState::Loaded(v.clone()),
            None => ItemState::Loading,
        }
    }

    /// Asks the owning component to (re-)plan around `position`.
    pub fn retry(&self, position: Position) {
        (self.on_retry)(position);
    }

    /// Transforms materialized values, preserving `total_size`, `load_state`,
    /// and both callbacks (same `Arc` identity).
    pub fn map<U: Clone>(&self, mut f: impl FnMut(&T) -> U) -> PagingSnapshot<U> {
        let values = self.values.iter().map(|(k, v)| (*k, f(v))).collect();
        PagingSnapshot {
            total_size: self.total_size,
            values: Arc::new(values),
            load_state: self.load_state.clone(),
            on_access: self.on_access.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}
