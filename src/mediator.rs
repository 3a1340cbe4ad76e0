//! Local-cache-in-front-of-remote coordinator: serves cached data first,
//! computes missing sub-ranges, fetches them (optionally in parallel), and
//! reconciles total-size disagreement between the two sources.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_stream::stream;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::Result;
use crate::pager::{Pager, PagerConfig};
use crate::range::Range;
use crate::snapshot::{DataPortion, PagingSnapshot, Position};
use crate::source::{LocalSource, PullSource, RemoteSource};

/// Tunables for [`PagingMediator`]; `load_size`/`prefetch_size`/`cache_size`
/// are forwarded unchanged to each query's embedded [`Pager`].
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Forwarded to the embedded Pager as `load_size`.
    pub load_size: u64,
    /// Forwarded to the embedded Pager as `preload_size`.
    pub prefetch_size: u64,
    /// Forwarded to the embedded Pager as `cache_size`.
    pub cache_size: u64,
    /// Max parallel remote fetches for missing sub-ranges.
    pub concurrency: usize,
    /// Fetch the whole requested range on any miss instead of gap-fetching.
    pub fetch_full_range_on_miss: bool,
    /// Emit the raw (unfiltered) local portion before the stale-filtered one.
    pub emit_outdated_records: bool,
    /// Emit each remote portion on arrival; only honored in serial mode.
    pub emit_intermediate_results: bool,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            load_size: 20,
            prefetch_size: 60,
            cache_size: 100,
            concurrency: 1,
            fetch_full_range_on_miss: false,
            emit_outdated_records: false,
            emit_intermediate_results: true,
        }
    }
}

impl MediatorConfig {
    /// Fails fast on non-positive `load_size` or zero `concurrency`.
    pub fn validate(&self) -> Result<()> {
        if self.load_size == 0 {
            return Err(crate::error::RepageError::InvalidConfig("load_size must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(crate::error::RepageError::InvalidConfig("concurrency must be at least 1".into()));
        }
        Ok(())
    }

    fn pager_config(&self) -> PagerConfig {
        PagerConfig {
            load_size: self.load_size,
            preload_size: self.prefetch_size,
            cache_size: self.cache_size,
        }
    }
}

/// The source error carried by the Mediator's internal pull source adapter,
/// erasing whichever of the local or remote source's own error type raised.
#[derive(Debug, Clone)]
pub enum MediatorSourceError {
    /// The local cache source failed.
    Local(String),
    /// The remote source failed.
    Remote(String),
}

impl fmt::Display for MediatorSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediatorSourceError::Local(e) => write!(f, "local source error: {e}"),
            MediatorSourceError::Remote(e) => write!(f, "remote source error: {e}"),
        }
    }
}

/// Walks `expected.first..=expected.last` and returns every maximal run of
/// positions absent from `present`, ascending. Canonical example:
/// `expected = [10, 15]`, `present = {10, 12, 15}` → `[[11, 11], [13, 14]]`.
pub fn compute_missing<T>(expected: Range, present: &BTreeMap<Position, T>) -> Vec<Range> {
    let mut out = Vec::new();
    if expected.is_empty() {
        return out;
    }
    let mut run_start: Option<i64> = None;
    for p in expected.first..=expected.last {
        let here = present.contains_key(&(p as Position));
        match (here, run_start) {
            (false, None) => run_start = Some(p),
            (true, Some(s)) => {
                out.push(Range::new(s, p - 1));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = run_start {
        out.push(Range::new(s, expected.last));
    }
    out
}

/// Layers `L` (a read/write cache) in front of `R` (a one-shot remote
/// fetch) per query. Each distinct query owns its own [`Pager`]; there is
/// no state shared across queries.
pub struct PagingMediator<L, R>
where
    L: LocalSource,
    R: RemoteSource<Item = L::Item, Query = L::Query>,
{
    local: Arc<L>,
    remote: Arc<R>,
    config: MediatorConfig,
    is_record_stale: Arc<dyn Fn(&L::Item) -> bool + Send + Sync>,
}

impl<L, R> PagingMediator<L, R>
where
    L: LocalSource + 'static,
    R: RemoteSource<Item = L::Item, Query = L::Query> + 'static,
{
    /// Builds a mediator. `is_record_stale` defaults to "never stale" when
    /// `None`.
    pub fn new(
        local: L,
        remote: R,
        config: MediatorConfig,
        is_record_stale: Option<Arc<dyn Fn(&L::Item) -> bool + Send + Sync>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            local: Arc::new(local),
            remote: Arc::new(remote),
            config,
            is_record_stale: is_record_stale.unwrap_or_else(|| Arc::new(|_| false)),
        })
    }

    /// Builds a fresh [`Pager`] for `query`, backed by `load_portion`. The
    /// returned pager owns its background work; dropping it cancels it.
    pub fn flow(&self, query: L::Query) -> Result<Pager<MediatorPullSource<L, R>>> {
        let source = MediatorPullSource {
            local: self.local.clone(),
            remote: self.remote.clone(),
            config: self.config.clone(),
            is_record_stale: self.is_record_stale.clone(),
            query,
        };
        Pager::new(source, self.config.pager_config())
    }

    /// Convenience: builds a pager for `query` and subscribes immediately,
    /// returning both so the caller can keep the pager alive for the
    /// lifetime of the subscription.
    pub fn subscribe(&self, query: L::Query) -> Result<(Pager<MediatorPullSource<L, R>>, tokio::sync::watch::Receiver<PagingSnapshot<L::Item>>)> {
        let pager = self.flow(query)?;
        let rx = pager.subscribe();
        Ok((pager, rx))
    }
}

/// The [`PullSource`] adapter backing one query's embedded [`Pager`]. Its
/// `read_data` is `load_portion` (§4.6): a cold stream of data portions
/// that reads local first, computes missing sub-ranges, fetches them from
/// remote, and reconciles total-size disagreement.
pub struct MediatorPullSource<L, R>
where
    L: LocalSource,
    R: RemoteSource<Item = L::Item, Query = L::Query>,
{
    local: Arc<L>,
    remote: Arc<R>,
    config: MediatorConfig,
    is_record_stale: Arc<dyn Fn(&L::Item) -> bool + Send + Sync>,
    query: L::Query,
}

impl<L, R> PullSource for MediatorPullSource<L, R>
where
    L: LocalSource + 'static,
    R: RemoteSource<Item = L::Item, Query = L::Query> + 'static,
{
    type Item = L::Item;
    type Error = MediatorSourceError;

    fn read_data(
        &self,
        position: Position,
        size: u64,
    ) -> BoxStream<'static, std::result::Result<DataPortion<Self::Item>, Self::Error>> {
        let local = self.local.clone();
        let remote = self.remote.clone();
        let is_record_stale = self.is_record_stale.clone();
        let query = self.query.clone();
        let fetch_full_range_on_miss = self.config.fetch_full_range_on_miss;
        let emit_outdated_records = self.config.emit_outdated_records;
        let emit_intermediate_results = self.config.emit_intermediate_results;
        let concurrency = self.config.concurrency;

        let requested = Range::new(position as i64, position as i64 + size as i64 - 1);

        Box::pin(stream! {
            let local_portion = match local.read(position, size, &query).await {
                Ok(p) => p,
                Err(e) => {
                    yield Err(MediatorSourceError::Local(e.to_string()));
                    return;
                }
            };

            if emit_outdated_records {
                yield Ok(local_portion.clone());
            }

            let filtered_values: BTreeMap<Position, L::Item> = local_portion
                .values
                .iter()
                .filter(|(_, v)| !(is_record_stale)(v))
                .map(|(k, v)| (*k, v.clone()))
                .collect();
            let filtered_portion = DataPortion {
                total_size: local_portion.total_size,
                values: filtered_values.clone(),
            };
            if !emit_outdated_records {
                yield Ok(filtered_portion);
            }

            let mut missing_ranges = if fetch_full_range_on_miss {
                vec![requested]
            } else {
                compute_missing(requested, &filtered_values)
            };

            let mut attempt = 0u32;
            let mut local_total_for_check = local_portion.total_size;

            loop {
                if missing_ranges.is_empty() {
                    return;
                }

                let serial = concurrency == 1 || missing_ranges.len() == 1;
                let portions: Vec<DataPortion<L::Item>> = if serial {
                    let mut acc = Vec::with_capacity(missing_ranges.len());
                    let mut failed = false;
                    for r in &missing_ranges {
                        match remote.fetch(r.first as u64, r.width() as u64, &query).await {
                            Ok(portion) => {
                                if emit_intermediate_results {
                                    yield Ok(portion.clone());
                                }
                                acc.push(portion);
                            }
                            Err(e) => {
                                yield Err(MediatorSourceError::Remote(e.to_string()));
                                failed = true;
                                break;
                            }
                        }
                    }
                    if failed {
                        return;
                    }
                    acc
                } else {
                    let remote = remote.clone();
                    let query = query.clone();
                    let fetched: std::result::Result<Vec<_>, _> = stream::iter(missing_ranges.clone())
                        .map(|r| {
                            let remote = remote.clone();
                            let query = query.clone();
                            async move {
                                remote
                                    .fetch(r.first as u64, r.width() as u64, &query)
                                    .await
                                    .map_err(|e| MediatorSourceError::Remote(e.to_string()))
                            }
                        })
                        .buffer_unordered(concurrency)
                        .try_collect()
                        .await;
                    match fetched {
                        Ok(p) => p,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                };

                let distinct_totals: BTreeSet<u64> = portions.iter().map(|p| p.total_size).collect();
                let inconsistent = distinct_totals.len() > 1
                    || (local_total_for_check != 0
                        && distinct_totals.len() == 1
                        && distinct_totals.iter().next().copied() != Some(local_total_for_check));

                if inconsistent && attempt == 0 {
                    if local_total_for_check != 0 {
                        if let Err(e) = local.clear(&query).await {
                            yield Err(MediatorSourceError::Local(e.to_string()));
                            return;
                        }
                    }
                    missing_ranges = vec![requested];
                    attempt = 1;
                    // Decision: the recursive attempt is always checked
                    // against local_total_size = 0 (the cache was just
                    // cleared), never against the pre-clear total.
                    local_total_for_check = 0;
                    continue;
                }

                let mut merged_values = filtered_values.clone();
                let mut merged_total = 0u64;
                for p in &portions {
                    merged_values.extend(p.values.clone());
                    merged_total = p.total_size;
                }
                let merged = DataPortion {
                    total_size: merged_total,
                    values: merged_values,
                };

                if let Err(e) = local.save(&query, merged.clone()).await {
                    yield Err(MediatorSourceError::Local(e.to_string()));
                    return;
                }
                yield Ok(merged);
                return;
            }
        })
    }
}
