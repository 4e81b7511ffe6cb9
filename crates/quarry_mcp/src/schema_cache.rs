//! Schema Cache - per-table column lists with a 24h TTL
//!
//! Entries are created on the first successful remote lookup, replaced
//! wholesale on refresh and removed by explicit eviction or lazily when read
//! after expiry (there is no background sweeper).
//!
//! Every change is announced on the [`EventBus`] under
//! [`SCHEMA_UPDATED_TOPIC`] with the table name as payload.
//!
//! Concurrent misses for the same table are not merged here: each caller that
//! misses issues its own remote fetch. Use [`SchemaCache::get_schema_shared`]
//! when a single in-flight fetch per table is wanted.

use crate::bus::{EventBus, SCHEMA_UPDATED_TOPIC};
use crate::remote::QueryExecutor;
use crate::single_flight::SingleFlight;
use crate::types::{QueryResult, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// How long a cached schema stays fresh
pub const SCHEMA_TTL_HOURS: i64 = 24;

/// Timeout handed to the executor for describe queries
pub const DESCRIBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// =============================================================================
// Clock
// =============================================================================

/// Source of "now" for TTL decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock, for tests and replay
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Cached column list for one table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaCacheEntry {
    pub table_name: String,
    pub columns: Vec<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SchemaCacheEntry {
    fn new(table_name: &str, columns: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns: dedup_columns(columns),
            cached_at: now,
            expires_at: now + Duration::hours(SCHEMA_TTL_HOURS),
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Per-table line of [`SchemaCacheStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStats {
    pub table: String,
    pub column_count: usize,
    /// Seconds until expiry (0 when already stale)
    pub ttl_remaining_secs: i64,
}

/// Read-only snapshot of the cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaCacheStats {
    pub count: usize,
    pub tables: Vec<TableStats>,
}

/// Remove duplicates, keeping first occurrence order
fn dedup_columns(columns: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    columns
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

// =============================================================================
// Describe Queries
// =============================================================================

/// Render the "describe columns" query for `table`
pub fn describe_columns_query(table: &str) -> String {
    format!(
        "SELECT column_name FROM information_schema.columns WHERE table_name = '{}'",
        table.replace('\'', "''")
    )
}

/// Pull column names out of a describe result.
///
/// Each row contributes its `column_name` field, falling back to `name`, then
/// to the first string value in the row.
pub fn columns_from_result(result: &QueryResult) -> Vec<String> {
    let names = result.rows.iter().filter_map(|row| {
        row.get("column_name")
            .or_else(|| row.get("name"))
            .and_then(Value::as_str)
            .or_else(|| row.values().find_map(Value::as_str))
            .map(str::to_string)
    });
    dedup_columns(names.collect())
}

// =============================================================================
// Schema Cache
// =============================================================================

/// TTL cache of table column lists, shared by request handlers
pub struct SchemaCache {
    entries: RwLock<HashMap<String, SchemaCacheEntry>>,
    executor: Arc<dyn QueryExecutor>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    in_flight: SingleFlight<String, Vec<String>>,
}

impl SchemaCache {
    pub fn new(executor: Arc<dyn QueryExecutor>, bus: EventBus) -> Self {
        Self::with_clock(executor, bus, Arc::new(SystemClock))
    }

    pub fn with_clock(executor: Arc<dyn QueryExecutor>, bus: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            executor,
            bus,
            clock,
            in_flight: SingleFlight::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn executor(&self) -> &Arc<dyn QueryExecutor> {
        &self.executor
    }

    /// Columns for `table`, fetched remotely on a miss or after expiry.
    pub async fn get_schema(&self, table: &str) -> Result<Vec<String>> {
        if let Some(columns) = self.fresh_columns(table) {
            debug!("Schema cache hit: {}", table);
            return Ok(columns);
        }

        debug!("Schema cache miss: {}", table);
        let result = self
            .executor
            .execute(&describe_columns_query(table), DESCRIBE_TIMEOUT)
            .await?;
        let columns = columns_from_result(&result);

        Ok(self.store(table, columns))
    }

    /// Like [`get_schema`](Self::get_schema), but concurrent misses for the
    /// same table share one remote fetch.
    pub async fn get_schema_shared(&self, table: &str) -> Result<Vec<String>> {
        if let Some(columns) = self.fresh_columns(table) {
            return Ok(columns);
        }

        self.in_flight
            .run(table.to_string(), self.get_schema(table))
            .await
    }

    /// True when a non-expired entry exists. No side effects.
    pub fn is_fresh(&self, table: &str) -> bool {
        let now = self.clock.now();
        self.read_entries()
            .get(table)
            .map(|entry| entry.is_fresh(now))
            .unwrap_or(false)
    }

    /// Overwrite the entry for `table` with a fresh TTL window.
    pub fn put_schema(&self, table: &str, columns: Vec<String>) {
        self.store(table, columns);
    }

    /// Drop one entry. Publishes even if nothing was cached.
    pub fn evict(&self, table: &str) {
        let removed = self.write_entries().remove(table).is_some();
        debug!("Evicted schema {} (was cached: {})", table, removed);
        self.publish_update(table);
    }

    /// Drop every entry, publishing one event per table that was present.
    pub fn evict_all(&self) -> usize {
        let tables: Vec<String> = {
            let mut entries = self.write_entries();
            entries.drain().map(|(table, _)| table).collect()
        };

        info!("Evicted {} cached schemas", tables.len());
        for table in &tables {
            self.publish_update(table);
        }
        tables.len()
    }

    /// Snapshot of every entry (stale ones included), sorted by table name
    pub fn stats(&self) -> SchemaCacheStats {
        let now = self.clock.now();
        let entries = self.read_entries();

        let mut tables: Vec<TableStats> = entries
            .values()
            .map(|entry| TableStats {
                table: entry.table_name.clone(),
                column_count: entry.columns.len(),
                ttl_remaining_secs: (entry.expires_at - now).num_seconds().max(0),
            })
            .collect();
        tables.sort_by(|a, b| a.table.cmp(&b.table));

        SchemaCacheStats {
            count: entries.len(),
            tables,
        }
    }

    /// Full entry for `table`, if fresh
    pub fn entry(&self, table: &str) -> Option<SchemaCacheEntry> {
        let now = self.clock.now();
        self.read_entries()
            .get(table)
            .filter(|entry| entry.is_fresh(now))
            .cloned()
    }

    /// Names of tables with fresh entries, sorted
    pub fn cached_tables(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut tables: Vec<String> = self
            .read_entries()
            .values()
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.table_name.clone())
            .collect();
        tables.sort();
        tables
    }

    /// Fresh columns, lazily dropping an expired entry
    fn fresh_columns(&self, table: &str) -> Option<Vec<String>> {
        let now = self.clock.now();
        {
            let entries = self.read_entries();
            match entries.get(table) {
                Some(entry) if entry.is_fresh(now) => return Some(entry.columns.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.write_entries();
        if entries.get(table).is_some_and(|entry| !entry.is_fresh(now)) {
            entries.remove(table);
            debug!("Schema for {} expired", table);
        }
        None
    }

    fn store(&self, table: &str, columns: Vec<String>) -> Vec<String> {
        let entry = SchemaCacheEntry::new(table, columns, self.clock.now());
        let columns = entry.columns.clone();
        self.write_entries().insert(table.to_string(), entry);
        debug!("Cached schema for {} ({} columns)", table, columns.len());
        self.publish_update(table);
        columns
    }

    fn publish_update(&self, table: &str) {
        self.bus
            .publish(SCHEMA_UPDATED_TOPIC, Value::String(table.to_string()));
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SchemaCacheEntry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SchemaCacheEntry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::StubExecutor;
    use crate::types::QuarryError;
    use chrono::TimeZone;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn cache_with(executor: Arc<StubExecutor>) -> (SchemaCache, Arc<ManualClock>, EventBus) {
        let clock = Arc::new(ManualClock::new(start()));
        let bus = EventBus::new();
        let cache = SchemaCache::with_clock(executor, bus.clone(), clock.clone());
        (cache, clock, bus)
    }

    fn collect_events(bus: &EventBus) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        // dropping the handle keeps the registration alive
        let _ = bus.subscribe(SCHEMA_UPDATED_TOPIC, move |event| {
            sink.lock().unwrap().push(event.payload.clone());
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn test_ttl_hit_then_refetch_after_expiry() {
        let executor = Arc::new(StubExecutor::with_columns(&["ts", "level", "msg"]));
        let (cache, clock, _bus) = cache_with(executor.clone());

        let first = cache.get_schema("Events").await.unwrap();
        assert_eq!(first, vec!["ts", "level", "msg"]);
        assert_eq!(executor.calls(), 1);

        let second = cache.get_schema("Events").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(executor.calls(), 1);

        clock.advance(Duration::hours(23) + Duration::minutes(59));
        cache.get_schema("Events").await.unwrap();
        assert_eq!(executor.calls(), 1);

        clock.advance(Duration::minutes(1));
        assert!(!cache.is_fresh("Events"));
        cache.get_schema("Events").await.unwrap();
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_entry_expires_exactly_at_expires_at() {
        let executor = Arc::new(StubExecutor::with_columns(&["ts"]));
        let (cache, clock, _bus) = cache_with(executor.clone());
        cache.get_schema("Events").await.unwrap();
        let expires_at = cache.entry("Events").unwrap().expires_at;

        clock.set(expires_at - Duration::seconds(1));
        assert!(cache.is_fresh("Events"));

        clock.set(expires_at);
        assert!(!cache.is_fresh("Events"));
        cache.get_schema("Events").await.unwrap();
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_miss_publishes_update_and_issues_describe_query() {
        let executor = Arc::new(StubExecutor::with_columns(&["a"]));
        let (cache, _clock, bus) = cache_with(executor.clone());
        let events = collect_events(&bus);

        cache.get_schema("Events").await.unwrap();

        assert_eq!(*events.lock().unwrap(), vec![json!("Events")]);
        assert_eq!(executor.queries(), vec![describe_columns_query("Events")]);
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates_and_writes_nothing() {
        let executor = Arc::new(StubExecutor::failing("network down"));
        let (cache, _clock, bus) = cache_with(executor.clone());
        let events = collect_events(&bus);

        let err = cache.get_schema("Events").await.unwrap_err();
        assert!(matches!(err, QuarryError::RemoteUnavailable(_)));
        assert!(!cache.is_fresh("Events"));
        assert_eq!(cache.stats().count, 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_schema_dedups_and_short_circuits_fetch() {
        let executor = Arc::new(StubExecutor::with_columns(&["unused"]));
        let (cache, _clock, _bus) = cache_with(executor.clone());

        cache.put_schema(
            "Logs",
            vec!["a".into(), "b".into(), "a".into(), "c".into(), "b".into()],
        );

        assert!(cache.is_fresh("Logs"));
        assert_eq!(cache.get_schema("Logs").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(executor.calls(), 0);
    }

    #[test]
    fn test_evict_all_publishes_one_event_per_table() {
        let executor = Arc::new(StubExecutor::with_columns(&[]));
        let (cache, _clock, bus) = cache_with(executor);
        for table in ["a", "b", "c"] {
            cache.put_schema(table, vec!["x".into()]);
        }
        let events = collect_events(&bus);

        assert_eq!(cache.evict_all(), 3);

        let mut payloads: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        payloads.sort();
        assert_eq!(payloads, vec!["a", "b", "c"]);
        assert_eq!(cache.stats().count, 0);
    }

    #[test]
    fn test_evict_publishes_even_when_absent() {
        let executor = Arc::new(StubExecutor::with_columns(&[]));
        let (cache, _clock, bus) = cache_with(executor);
        let events = collect_events(&bus);

        cache.evict("ghost");
        assert_eq!(*events.lock().unwrap(), vec![json!("ghost")]);
    }

    #[test]
    fn test_stats_reports_columns_and_ttl() {
        let executor = Arc::new(StubExecutor::with_columns(&[]));
        let (cache, clock, _bus) = cache_with(executor);
        cache.put_schema("b", vec!["x".into(), "y".into()]);
        cache.put_schema("a", vec!["x".into()]);
        clock.advance(Duration::hours(1));

        let stats = cache.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.tables[0].table, "a");
        assert_eq!(stats.tables[1].column_count, 2);
        assert_eq!(stats.tables[0].ttl_remaining_secs, 23 * 3600);

        clock.advance(Duration::hours(30));
        assert_eq!(cache.stats().tables[0].ttl_remaining_secs, 0);
        assert!(cache.cached_tables().is_empty());
    }

    #[test]
    fn test_describe_query_escapes_quotes() {
        assert_eq!(
            describe_columns_query("o'brien"),
            "SELECT column_name FROM information_schema.columns WHERE table_name = 'o''brien'"
        );
    }

    #[test]
    fn test_columns_from_result_fallbacks() {
        let result: QueryResult = serde_json::from_value(json!({
            "rows": [
                {"column_name": "ts"},
                {"name": "level"},
                {"type": 3, "field": "msg"},
                {"column_name": "ts"},
                {"only_numbers": 1}
            ]
        }))
        .unwrap();

        assert_eq!(columns_from_result(&result), vec!["ts", "level", "msg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_fetch_merges_concurrent_misses() {
        let executor = Arc::new(
            StubExecutor::with_columns(&["ts"]).with_delay(std::time::Duration::from_millis(50)),
        );
        let (cache, _clock, _bus) = cache_with(executor.clone());

        let (a, b, c) = tokio::join!(
            cache.get_schema_shared("Events"),
            cache.get_schema_shared("Events"),
            cache.get_schema_shared("Events"),
        );

        assert_eq!(a.unwrap(), vec!["ts"]);
        assert_eq!(b.unwrap(), vec!["ts"]);
        assert_eq!(c.unwrap(), vec!["ts"]);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_get_does_not_merge_concurrent_misses() {
        let executor = Arc::new(
            StubExecutor::with_columns(&["ts"]).with_delay(std::time::Duration::from_millis(20)),
        );
        let (cache, _clock, _bus) = cache_with(executor.clone());

        let (a, b) = tokio::join!(cache.get_schema("Events"), cache.get_schema("Events"));
        a.unwrap();
        b.unwrap();
        assert_eq!(executor.calls(), 2);
    }
}
