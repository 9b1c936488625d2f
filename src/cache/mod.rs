//! Bounded result cache with execution history.
//!
//! [`ResultCache`] maps execution ids to [`CommandResult`]s. Entries are
//! evicted oldest-insertion-first once `max_size` is exceeded, and the
//! history log always holds exactly one record per cached entry.
//!
//! An optional background task re-runs cached commands on an interval
//! through a [`CacheRefresher`] and swaps the fresh results in place.
//!
//! ```no_run
//! use cmdchain::cache::ResultCache;
//! use cmdchain::parse_output;
//!
//! let cache = ResultCache::new(2);
//! cache.store("x", "echo x", parse_output("echo", "x\n", 0, None), None).unwrap();
//! assert!(cache.contains("x"));
//! ```
//!
//! [`CommandResult`]: crate::CommandResult

mod refresh;
mod store;

pub use refresh::CacheRefresher;
pub use store::{
    CacheConfig, CacheEntry, CacheExport, CacheStatistics, HistoryRecord, ResultCache,
    DEFAULT_MAX_SIZE, DEFAULT_REFRESH_INTERVAL,
};
