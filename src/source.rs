//! The data-source contracts the core consumes. Implementations of each
//! (HTTP clients, database drivers, in-memory fakes for tests) live outside
//! this crate; see `tests/integration/support.rs` for reference fakes.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::snapshot::{DataPortion, Position};

/// A cold, pull-based source consumed by [`crate::pager::Pager`].
///
/// `read_data` may emit one or more partial portions as the requested range
/// materializes, then complete. `total_size` on each portion is
/// authoritative and may change between portions (the source is trusted
/// over any previously cached total). Errors terminate the stream.
pub trait PullSource: Send + Sync {
    /// The item type materialized at each position.
    type Item: Clone + Send + Sync + 'static;
    /// The source's own error type.
    type Error: std::fmt::Display + Send + Sync + 'static;

    /// Requests `size` positions starting at `position`.
    fn read_data(
        &self,
        position: Position,
        size: u64,
    ) -> BoxStream<'static, Result<DataPortion<Self::Item>, Self::Error>>;
}

/// A positional read/write cache consulted first by
/// [`crate::mediator::PagingMediator`], keyed by an opaque `Query`.
#[async_trait]
pub trait LocalSource: Send + Sync {
    /// The item type materialized at each position.
    type Item: Clone + Send + Sync + 'static;
    /// The opaque query parameter distinguishing independent result sets.
    type Query: Clone + Send + Sync + 'static;
    /// The source's own error type.
    type Error: std::fmt::Display + Send + Sync + 'static;

    /// Reads `size` positions starting at `start` for `query`. The result
    /// may be sparse; absent positions are simply omitted from `values`.
    /// `total_size == 0` means unknown.
    async fn read(
        &self,
        start: Position,
        size: u64,
        query: &Self::Query,
    ) -> Result<DataPortion<Self::Item>, Self::Error>;

    /// Merges `portion` into storage, overwriting on key conflicts, and
    /// updates the stored total.
    async fn save(&self, query: &Self::Query, portion: DataPortion<Self::Item>) -> Result<(), Self::Error>;

    /// Removes all cached data and the stored total for `query`.
    async fn clear(&self, query: &Self::Query) -> Result<(), Self::Error>;
}

/// A one-shot positional fetch consulted by
/// [`crate::mediator::PagingMediator`] for positions missing locally.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// The item type materialized at each position.
    type Item: Clone + Send + Sync + 'static;
    /// The opaque query parameter distinguishing independent result sets.
    type Query: Clone + Send + Sync + 'static;
    /// The source's own error type.
    type Error: std::fmt::Display + Send + Sync + 'static;

    /// Fetches `size` positions starting at `start` for `query`.
    async fn fetch(
        &self,
        start: Position,
        size: u64,
        query: &Self::Query,
    ) -> Result<DataPortion<Self::Item>, Self::Error>;
}

/// A hot, push-based source consumed by
/// [`crate::streaming_pager::StreamingPager`]. Both streams are live:
/// `read_total` emits the current total whenever it changes, and
/// `read_portion` emits value maps for a subscribed range (no total),
/// possibly re-emitting updates to previously-emitted positions.
pub trait StreamingSource: Send + Sync {
    /// The item type materialized at each position.
    type Item: Clone + Send + Sync + 'static;
    /// The source's own error type.
    type Error: std::fmt::Display + Send + Sync + 'static;

    /// Subscribes to the collection's live total size.
    fn read_total(&self) -> BoxStream<'static, Result<u64, Self::Error>>;

    /// Subscribes to live values for `size` positions starting at `start`.
    fn read_portion(
        &self,
        start: Position,
        size: u64,
    ) -> BoxStream<'static, Result<std::collections::BTreeMap<Position, Self::Item>, Self::Error>>;
}
