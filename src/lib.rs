//! Hierarchical LRU cache with tiled, prefetched list storage.
//!
//! Core of a media-browsing list broker. The broker manages a tree of
//! *list entries*, each representing a directory-like list of items (media
//! server containers, storage folders, and the like):
//!
//! - An aging-based LRU cache with combined memory and count limits,
//!   pinning of the hot path, and coordinated subtree purging.
//! - Tiled storage for large lists: a sliding three-tile window whose tiles
//!   are filled asynchronously by a worker pool, with prefetching of the
//!   ranges adjacent to the most recent access.
//! - A cacheability override layer that temporarily promotes uncacheable
//!   subtrees while a client works inside them.
//!
//! All cache mutations, tree operations, and list accesses run on a single
//! reader thread; only the tile fillers run in parallel. There is no
//! persistence and no IPC surface here; fillers and event consumers are
//! plugged in by the integrating application.

pub mod cache;
pub mod config;
pub mod enter;
pub mod error;
pub mod flat;
pub mod ids;
pub mod item;
pub mod lists;
pub mod overrides;
pub mod pool;
pub mod ready;
pub mod tile;
pub mod tiled;
pub mod timebase;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{
    to_cache_mode, Cache, CacheCallbacks, CacheLimits, CacheMode, CacheModeRequest, CachePayload,
    UseResult,
};
pub use config::{BrokerConfig, ConfigError};
pub use error::{ListError, ListResult};
pub use flat::FlatList;
pub use ids::{Context, ListId, CONTEXT_MAX};
pub use item::{ListItem, ListItemData, ListItemKind};
pub use lists::{for_each_item, BrowseList};
pub use overrides::{
    CacheCheck, CheckNoOverrides, CheckWithOverrides, OverrideExpiredFn, OVERRIDE_EXPIRY,
};
pub use pool::{FillerPool, ItemProvider, TiledListFiller};
pub use ready::{ReadyManager, ReadyProbe, ReadyWatcher, SimpleProbe};
pub use tile::{Tile, TileState};
pub use tiled::{TileWindow, TiledList, WindowIter};
pub use timebase::{SystemTimebase, Timebase};
pub use tree::{ListInvalidateNotifier, ListTreeManager, PurgeResult};
