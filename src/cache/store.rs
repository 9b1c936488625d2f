//! Cache storage: entries and history under one lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::refresh::{CacheRefresher, RefreshTask};
use crate::error::CmdChainError;
use crate::execution::CommandResult;
use crate::Result;

/// Default number of cached results.
pub const DEFAULT_MAX_SIZE: usize = 100;

/// Default period of the background refresh task.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    /// Maximum number of entries (at least 1).
    pub max_size: usize,
    /// Start the refresh task from [`ResultCache::start_auto_refresh`].
    pub auto_refresh: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            auto_refresh: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

fn serialize_secs<S: serde::Serializer>(
    d: &Duration,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// A cached result.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub id: String,
    pub command: String,
    pub result: CommandResult,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// One line of the cache history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub exit_code: i32,
}

/// Counts plus configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub max_size: usize,
    pub auto_refresh: bool,
    pub refresh_interval_secs: f64,
    pub refreshing: bool,
}

/// Serializable snapshot of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheExport {
    pub history: Vec<HistoryRecord>,
    pub statistics: CacheStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<String, CacheEntry>>,
}

/// Entry table and history. The history's order is the insertion order
/// used for eviction, and both always hold the same ids.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    entries: HashMap<String, CacheEntry>,
    history: VecDeque<HistoryRecord>,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry, max_size: usize) -> Vec<String> {
        if self.entries.remove(&entry.id).is_some() {
            self.history.retain(|r| r.id != entry.id);
        }

        self.history.push_back(HistoryRecord {
            id: entry.id.clone(),
            command: entry.command.clone(),
            timestamp: entry.timestamp,
            success: entry.result.success(),
            exit_code: entry.result.exit_code(),
        });
        self.entries.insert(entry.id.clone(), entry);

        let mut evicted = Vec::new();
        while self.history.len() > max_size {
            let Some(oldest) = self.history.pop_front() else {
                break;
            };
            self.entries.remove(&oldest.id);
            evicted.push(oldest.id);
        }
        evicted
    }

    fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(id)?;
        self.history.retain(|r| r.id != id);
        Some(entry)
    }

    /// `(id, command)` pairs in insertion order.
    pub(crate) fn commands(&self) -> Vec<(String, String)> {
        self.history
            .iter()
            .map(|r| (r.id.clone(), r.command.clone()))
            .collect()
    }

    /// Swap in a fresh result, keeping the entry's position.
    pub(crate) fn replace(&mut self, id: &str, result: CommandResult) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        let now = Utc::now();
        if let Some(record) = self.history.iter_mut().find(|r| r.id == id) {
            record.timestamp = now;
            record.success = result.success();
            record.exit_code = result.exit_code();
        }
        entry.result = result;
        entry.timestamp = now;
        true
    }
}

/// Thread-safe bounded store of execution results.
///
/// Writes report [`CmdChainError::LockPoisoned`]; reads never fail and
/// return an empty answer for unknown ids.
pub struct ResultCache {
    config: CacheConfig,
    state: Arc<RwLock<CacheState>>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl ResultCache {
    /// Cache holding at most `max_size` results (at least 1).
    pub fn new(max_size: usize) -> Self {
        Self::with_config(CacheConfig {
            max_size,
            ..CacheConfig::default()
        })
    }

    pub fn with_config(mut config: CacheConfig) -> Self {
        config.max_size = config.max_size.max(1);
        Self {
            config,
            state: Arc::new(RwLock::new(CacheState::default())),
            refresh: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// Insert or overwrite a result.
    ///
    /// Overwriting moves the id to the newest position. If the cache is
    /// over capacity afterwards, the oldest insertions are evicted.
    pub fn store(
        &self,
        id: impl Into<String>,
        command: impl Into<String>,
        result: CommandResult,
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        let entry = CacheEntry {
            id: id.into(),
            command: command.into(),
            result,
            timestamp: Utc::now(),
            metadata,
        };

        let mut state = self
            .state
            .write()
            .map_err(|_| CmdChainError::LockPoisoned)?;
        for id in state.insert(entry, self.config.max_size) {
            debug!(id = %id, "evicted cache entry");
        }
        Ok(())
    }

    /// Cached entry for `id`, if any.
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.read(|s| s.entries.get(id).cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read(|s| s.entries.contains_key(id))
    }

    pub fn remove(&self, id: &str) -> Result<Option<CacheEntry>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| CmdChainError::LockPoisoned)?;
        Ok(state.remove(id))
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| CmdChainError::LockPoisoned)?;
        state.entries.clear();
        state.history.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read(|s| s.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent history records, oldest first.
    ///
    /// With `success_only`, failed executions are skipped before `limit`
    /// is applied.
    pub fn get_history(&self, limit: Option<usize>, success_only: bool) -> Vec<HistoryRecord> {
        self.read(|s| {
            let matching: Vec<_> = s
                .history
                .iter()
                .filter(|r| !success_only || r.success)
                .collect();
            let skip = limit.map_or(0, |n| matching.len().saturating_sub(n));
            matching.into_iter().skip(skip).cloned().collect()
        })
    }

    pub fn get_statistics(&self) -> CacheStatistics {
        let (total, success) = self.read(|s| {
            (
                s.entries.len(),
                s.entries.values().filter(|e| e.result.success()).count(),
            )
        });
        CacheStatistics {
            total,
            success,
            error: total - success,
            max_size: self.config.max_size,
            auto_refresh: self.config.auto_refresh,
            refresh_interval_secs: self.config.refresh_interval.as_secs_f64(),
            refreshing: self.is_refreshing(),
        }
    }

    /// Snapshot of history and statistics, plus every entry when
    /// `include_results` is set.
    pub fn export(&self, include_results: bool) -> CacheExport {
        let (history, results) = self.read(|s| {
            let history: Vec<_> = s.history.iter().cloned().collect();
            let results = include_results.then(|| {
                s.entries
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.clone()))
                    .collect()
            });
            (history, results)
        });
        CacheExport {
            history,
            statistics: self.get_statistics(),
            results,
        }
    }

    /// Start re-running cached commands every `interval`.
    ///
    /// Must be called inside a tokio runtime. Fails if a refresh task is
    /// already running.
    pub fn start_refresh(
        &self,
        interval: Duration,
        refresher: Arc<dyn CacheRefresher>,
    ) -> Result<()> {
        let mut slot = self
            .refresh
            .lock()
            .map_err(|_| CmdChainError::LockPoisoned)?;
        if slot.is_some() {
            return Err(CmdChainError::RefreshAlreadyRunning);
        }
        *slot = Some(RefreshTask::spawn(Arc::clone(&self.state), interval, refresher));
        Ok(())
    }

    /// Start the refresh task at the configured interval when
    /// `auto_refresh` is set. Returns whether a task was started.
    pub fn start_auto_refresh(&self, refresher: Arc<dyn CacheRefresher>) -> Result<bool> {
        if !self.config.auto_refresh {
            return Ok(false);
        }
        self.start_refresh(self.config.refresh_interval, refresher)?;
        Ok(true)
    }

    /// Stop the refresh task and wait for it to exit. No-op when none is
    /// running.
    pub async fn stop_refresh(&self) -> Result<()> {
        let task = self
            .refresh
            .lock()
            .map_err(|_| CmdChainError::LockPoisoned)?
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
        Ok(())
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn read<T>(&self, f: impl FnOnce(&CacheState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::with_config(CacheConfig::default())
    }
}

impl Drop for ResultCache {
    fn drop(&mut self) {
        if let Ok(slot) = self.refresh.get_mut() {
            if let Some(task) = slot.as_ref() {
                task.cancel();
            }
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::parse_output;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok(text: &str) -> CommandResult {
        parse_output("echo", text, 0, None)
    }

    fn failed() -> CommandResult {
        parse_output("false", "", 1, None)
    }

    fn history_ids(cache: &ResultCache) -> Vec<String> {
        cache
            .get_history(None, false)
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    #[test]
    fn test_fifo_eviction() {
        let cache = ResultCache::new(2);
        for id in ["x", "y", "z"] {
            cache.store(id, format!("echo {id}"), ok(id), None).unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get("x").is_none());
        assert!(cache.contains("y"));
        assert!(cache.contains("z"));
        assert_eq!(history_ids(&cache), vec!["y", "z"]);
    }

    #[test]
    fn test_lengths_stay_equal() {
        let cache = ResultCache::new(3);
        for i in 0..10 {
            cache.store(format!("id{}", i % 4), "cmd", ok("o"), None).unwrap();
            assert_eq!(cache.len(), cache.get_history(None, false).len());
            assert!(cache.len() <= 3);
        }
        cache.remove("id1").unwrap();
        assert_eq!(cache.len(), cache.get_history(None, false).len());
    }

    #[test]
    fn test_overwrite_moves_to_newest() {
        let cache = ResultCache::new(2);
        cache.store("a", "echo a", ok("a"), None).unwrap();
        cache.store("b", "echo b", ok("b"), None).unwrap();
        cache.store("a", "echo a", ok("again"), None).unwrap();
        cache.store("c", "echo c", ok("c"), None).unwrap();

        assert_eq!(history_ids(&cache), vec!["a", "c"]);
        assert_eq!(cache.get("a").unwrap().result.raw_text(), "again");
    }

    #[test]
    fn test_get_absent() {
        let cache = ResultCache::new(4);
        assert!(cache.get("missing").is_none());
        assert!(!cache.contains("missing"));
        assert!(cache.remove("missing").unwrap().is_none());
    }

    #[test]
    fn test_zero_size_holds_one() {
        let cache = ResultCache::new(0);
        cache.store("a", "c", ok("a"), None).unwrap();
        cache.store("b", "c", ok("b"), None).unwrap();
        assert_eq!(cache.max_size(), 1);
        assert_eq!(history_ids(&cache), vec!["b"]);
    }

    #[test]
    fn test_history_limit_and_filter() {
        let cache = ResultCache::new(10);
        cache.store("1", "ok", ok("1"), None).unwrap();
        cache.store("2", "bad", failed(), None).unwrap();
        cache.store("3", "ok", ok("3"), None).unwrap();
        cache.store("4", "bad", failed(), None).unwrap();

        let recent: Vec<_> = cache
            .get_history(Some(2), false)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(recent, vec!["3", "4"]);

        let good: Vec<_> = cache
            .get_history(None, true)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(good, vec!["1", "3"]);

        let last_good = cache.get_history(Some(1), true);
        assert_eq!(last_good.len(), 1);
        assert_eq!(last_good[0].id, "3");
        assert!(cache.get_history(Some(0), false).is_empty());
    }

    #[test]
    fn test_statistics() {
        let cache = ResultCache::new(5);
        cache.store("1", "ok", ok("1"), None).unwrap();
        cache.store("2", "bad", failed(), None).unwrap();

        let stats = cache.get_statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.max_size, 5);
        assert!(!stats.refreshing);
    }

    #[test]
    fn test_export() {
        let cache = ResultCache::new(5);
        let mut meta = Map::new();
        meta.insert("origin".into(), Value::from("test"));
        cache.store("1", "echo hi", ok("hi\n"), Some(meta)).unwrap();

        let summary = serde_json::to_value(cache.export(false)).unwrap();
        assert!(summary.get("results").is_none());
        assert_eq!(summary["history"][0]["id"], "1");
        assert_eq!(summary["statistics"]["total"], 1);

        let full = serde_json::to_value(cache.export(true)).unwrap();
        let entry = &full["results"]["1"];
        assert_eq!(entry["result"]["success"], true);
        assert_eq!(entry["result"]["exit_code"], 0);
        assert_eq!(entry["result"]["raw_text"], "hi\n");
        assert_eq!(entry["result"]["projection"][0], "hi");
        assert_eq!(entry["metadata"]["origin"], "test");
        assert!(entry["timestamp"].is_string());
    }

    #[test]
    fn test_clear() {
        let cache = ResultCache::new(5);
        cache.store("1", "ok", ok("1"), None).unwrap();
        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert!(cache.get_history(None, false).is_empty());
    }

    #[test]
    fn test_concurrent_stores() {
        let cache = Arc::new(ResultCache::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.store(format!("{t}-{i}"), "cmd", ok("o"), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 16);
        assert_eq!(cache.get_history(None, false).len(), 16);
    }

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheRefresher for CountingRefresher {
        async fn refresh(&self, _id: &str, command: &str) -> Option<CommandResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Some(parse_output("sh", format!("{command} #{n}\n"), 0, None))
        }
    }

    #[tokio::test]
    async fn test_refresh_replaces_in_place() {
        let cache = ResultCache::new(5);
        cache.store("a", "echo a", ok("a\n"), None).unwrap();
        cache.store("b", "echo b", ok("b\n"), None).unwrap();

        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        cache
            .start_refresh(Duration::from_millis(20), refresher.clone())
            .unwrap();
        assert!(cache.is_refreshing());

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.stop_refresh().await.unwrap();
        assert!(!cache.is_refreshing());

        assert!(refresher.calls.load(Ordering::SeqCst) >= 2);
        assert!(cache.get("a").unwrap().result.raw_text().starts_with("echo a #"));
        assert_eq!(history_ids(&cache), vec!["a", "b"]);

        let calls = refresher.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_refresh_twice_is_error() {
        let cache = ResultCache::new(5);
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        cache
            .start_refresh(Duration::from_secs(60), refresher.clone())
            .unwrap();
        assert!(matches!(
            cache.start_refresh(Duration::from_secs(60), refresher),
            Err(CmdChainError::RefreshAlreadyRunning)
        ));
        cache.stop_refresh().await.unwrap();
        cache.stop_refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_refresh_follows_config() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });

        let manual = ResultCache::new(5);
        assert!(!manual.start_auto_refresh(refresher.clone()).unwrap());
        assert!(!manual.is_refreshing());

        let cache = ResultCache::with_config(CacheConfig {
            max_size: 5,
            auto_refresh: true,
            refresh_interval: Duration::from_millis(20),
        });
        cache.store("a", "echo a", ok("a\n"), None).unwrap();
        assert!(cache.start_auto_refresh(refresher.clone()).unwrap());
        assert!(cache.is_refreshing());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.stop_refresh().await.unwrap();
        assert!(refresher.calls.load(Ordering::SeqCst) >= 1);
        assert!(cache.get("a").unwrap().result.raw_text().starts_with("echo a #"));
    }
}
