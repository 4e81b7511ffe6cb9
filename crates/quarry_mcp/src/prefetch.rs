//! Cache-Aside Query Prefetcher
//!
//! Before a user query runs, the tables it reads from are looked up in the
//! [`SchemaCache`]; any table without a fresh entry gets a dedicated describe
//! query and the result is written back with `put_schema`.
//!
//! Prefetch is advisory. A failure for one table is logged and recorded in the
//! report, the remaining tables are still processed, and the user's query is
//! never affected.

use crate::aggregator;
use crate::schema_cache::{columns_from_result, describe_columns_query, SchemaCache, DESCRIBE_TIMEOUT};
use crate::types::{QueryResult, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

fn from_clause() -> &'static Regex {
    static FROM_CLAUSE: OnceLock<Regex> = OnceLock::new();
    FROM_CLAUSE.get_or_init(|| {
        Regex::new(
            r#"(?i)\bfrom\s+(?:"([^"]+)"|`([^`]+)`|\[([^\]]+)\]|([A-Za-z_][A-Za-z0-9_.$-]*))"#,
        )
        .expect("static regex is valid")
    })
}

/// Distinct table names referenced by `from <table>` clauses, in first-seen
/// order. Matching is case-insensitive on the keyword; names keep their case.
pub fn extract_table_names(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    from_clause()
        .captures_iter(query)
        .filter_map(|caps| {
            (1..=4)
                .find_map(|group| caps.get(group))
                .map(|m| m.as_str().trim().to_string())
        })
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

/// Per-table failure during prefetch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefetchFailure {
    pub table: String,
    pub message: String,
}

/// What a prefetch pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrefetchReport {
    /// Tables fetched and written to the cache
    pub warmed: Vec<String>,
    /// Tables already fresh
    pub skipped: Vec<String>,
    pub failed: Vec<PrefetchFailure>,
}

pub struct Prefetcher {
    cache: Arc<SchemaCache>,
}

impl Prefetcher {
    pub fn new(cache: Arc<SchemaCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Warm the schemas of every table `query` reads from.
    pub async fn prefetch(&self, query: &str) -> PrefetchReport {
        let mut report = PrefetchReport::default();

        let (skipped, missing): (Vec<String>, Vec<String>) = extract_table_names(query)
            .into_iter()
            .partition(|table| self.cache.is_fresh(table));
        report.skipped = skipped;

        if missing.is_empty() {
            return report;
        }
        debug!("Prefetching schemas for {:?}", missing);

        let executor = Arc::clone(self.cache.executor());
        let fetched = aggregator::run(missing.clone(), 1, |table| {
            let executor = Arc::clone(&executor);
            async move {
                executor
                    .execute(&describe_columns_query(&table), DESCRIBE_TIMEOUT)
                    .await
                    .map(|result| columns_from_result(&result))
            }
        })
        .await;

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                // only reachable with a zero limit
                warn!("Schema prefetch skipped: {}", e);
                return report;
            }
        };

        for (table, outcome) in missing.into_iter().zip(fetched.results) {
            match outcome {
                Ok(columns) => {
                    self.cache.put_schema(&table, columns);
                    report.warmed.push(table);
                }
                Err(failure) => {
                    warn!("Schema prefetch for {} failed: {}", table, failure.message);
                    report.failed.push(PrefetchFailure {
                        table,
                        message: failure.message,
                    });
                }
            }
        }

        report
    }

    /// Prefetch, then run the user's query. Only the query's own failure is
    /// returned.
    pub async fn execute_with_prefetch(
        &self,
        query: &str,
        timeout: Duration,
    ) -> Result<(QueryResult, PrefetchReport)> {
        let report = self.prefetch(query).await;
        let result = self.cache.executor().execute(query, timeout).await?;
        Ok((result, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, SCHEMA_UPDATED_TOPIC};
    use crate::remote::testing::StubExecutor;
    use serde_json::Value;
    use std::sync::Mutex;

    fn prefetcher(executor: Arc<StubExecutor>) -> (Prefetcher, EventBus) {
        let bus = EventBus::new();
        let cache = Arc::new(SchemaCache::new(executor, bus.clone()));
        (Prefetcher::new(cache), bus)
    }

    #[test]
    fn test_extract_single_table() {
        assert_eq!(
            extract_table_names("SELECT count(*) FROM Events WHERE level='error'"),
            vec!["Events"]
        );
    }

    #[test]
    fn test_extract_is_case_insensitive_and_distinct() {
        let query = "select * from Events e join (SELECT * FrOm Events) x from logs FROM Events";
        assert_eq!(extract_table_names(query), vec!["Events", "logs"]);
    }

    #[test]
    fn test_extract_quoted_names() {
        let query = r#"SELECT 1 FROM "my table" UNION SELECT 2 FROM `other` UNION SELECT 3 FROM [third]"#;
        assert_eq!(extract_table_names(query), vec!["my table", "other", "third"]);
    }

    #[test]
    fn test_extract_ignores_non_clause_words() {
        assert!(extract_table_names("SELECT fromage, wherefrom FROM (SELECT 1)").is_empty());
        assert!(extract_table_names("").is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_issues_one_lookup_per_table() {
        let executor = Arc::new(StubExecutor::with_columns(&["ts", "level", "msg"]));
        let (prefetcher, _bus) = prefetcher(executor.clone());

        let report = prefetcher
            .prefetch("SELECT count(*) FROM Events WHERE level='error'")
            .await;

        assert_eq!(report.warmed, vec!["Events"]);
        assert_eq!(executor.queries(), vec![describe_columns_query("Events")]);
        assert!(prefetcher.cache().is_fresh("Events"));

        // Second reference to the same table in a new query: already warm
        let report = prefetcher
            .prefetch("SELECT * FROM Events e JOIN (SELECT * FROM Events) x ON true")
            .await;
        assert_eq!(report.skipped, vec!["Events"]);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_reference_fetches_once() {
        let executor = Arc::new(StubExecutor::with_columns(&["a"]));
        let (prefetcher, _bus) = prefetcher(executor.clone());

        prefetcher
            .prefetch("SELECT * FROM Events UNION ALL SELECT * FROM events_archive UNION ALL SELECT * FROM Events")
            .await;

        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_for_one_table_does_not_stop_others() {
        let executor = Arc::new(
            StubExecutor::with_columns(&["x"])
                .with_table("good", &["g1", "g2"])
                .failing_for("bad"),
        );
        let (prefetcher, bus) = prefetcher(executor.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = bus.subscribe(SCHEMA_UPDATED_TOPIC, move |event| {
            sink.lock().unwrap().push(event.payload.clone());
            Ok(())
        });

        let report = prefetcher
            .prefetch("SELECT * FROM bad UNION ALL SELECT * FROM good")
            .await;

        assert_eq!(report.warmed, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].table, "bad");
        assert_eq!(
            prefetcher.cache().get_schema("good").await.unwrap(),
            vec!["g1", "g2"]
        );
        assert_eq!(*events.lock().unwrap(), vec![Value::String("good".into())]);
    }

    #[tokio::test]
    async fn test_execute_with_prefetch_survives_prefetch_failure() {
        let executor = Arc::new(StubExecutor::with_columns(&["x"]).failing_for("Events"));
        let (prefetcher, _bus) = prefetcher(executor.clone());

        let (result, report) = prefetcher
            .execute_with_prefetch("SELECT * FROM Events", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        // the stub answers the user query with its default column rows
        assert_eq!(result.row_count(), 1);
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_execute_with_prefetch_returns_query_error() {
        let executor = Arc::new(StubExecutor::failing("service down"));
        let (prefetcher, _bus) = prefetcher(executor);

        let err = prefetcher
            .execute_with_prefetch("SELECT 1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("service down"));
    }
}
