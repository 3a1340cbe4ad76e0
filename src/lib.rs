//! # repage — a reactive positional paging engine
//!
//! `repage` sits between a UI (or any consumer that renders items by
//! absolute index) and a slower data source (network API, database,
//! streaming feed). It keeps a bounded window of items cached around a
//! "last accessed" position and serves consumers a continuously updated
//! view of that window plus the collection's current total size.
//!
//! Three coordinated components:
//!
//! - [`pager::Pager`] — on-demand windowed loader over a cold, pull-based
//!   source.
//! - [`streaming_pager::StreamingPager`] — a pager variant for push
//!   sources, where total size and each portion are independent live
//!   streams.
//! - [`mediator::PagingMediator`] — a coordinator layering a local cache
//!   source in front of a remote source.
//!
//! Each component publishes a [`snapshot::PagingSnapshot`] over a
//! `tokio::sync::watch` channel. Reading a position through the snapshot
//! drives background planning; see each module's docs for its planning
//! algorithm.
//!
//! This crate never installs a global `tracing` subscriber; call
//! [`logging::init_logging`] from the embedding application (or test
//! harness) if you want spans and events surfaced.

pub mod error;
pub mod logging;
pub mod mediator;
pub mod pager;
pub mod range;
pub mod snapshot;
pub mod source;
pub mod streaming_pager;

pub use crate::error::{RepageError, Result};
pub use crate::mediator::{MediatorConfig, MediatorSourceError, PagingMediator};
pub use crate::pager::{Pager, PagerConfig};
pub use crate::range::Range;
pub use crate::snapshot::{DataPortion, ItemState, LoadState, PagingSnapshot, Position, NO_KEY};
pub use crate::source::{LocalSource, PullSource, RemoteSource, StreamingSource};
pub use crate::streaming_pager::{StreamingPager, StreamingPagerConfig};
