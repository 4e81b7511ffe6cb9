//! Concurrent Aggregator - bounded fan-out / fan-in
//!
//! Runs one task per input item with at most `limit` tasks in flight. Tasks
//! start in input order and may finish in any order; results come back in
//! input order. A failing task is recorded and never cancels its siblings.
//!
//! With `limit == 1` processing is strictly sequential with the same result
//! shape.

use crate::remote::DetailFetcher;
use crate::types::{QuarryError, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use tracing::debug;

/// Failure of a single task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    /// Position of the failed item in the input
    pub index: usize,
    pub message: String,
}

/// Outcome of one aggregation run
#[derive(Debug)]
pub struct Aggregated<O> {
    /// One entry per input item, in input order
    pub results: Vec<std::result::Result<O, TaskFailure>>,
    /// Every failure, in input order
    pub errors: Vec<TaskFailure>,
}

impl<O> Aggregated<O> {
    pub fn successes(&self) -> impl Iterator<Item = &O> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }

    pub fn into_successes(self) -> Vec<O> {
        self.results.into_iter().filter_map(|r| r.ok()).collect()
    }
}

/// Run `task` over `items` with at most `limit` concurrent executions.
pub async fn run<I, O, E, F, Fut>(items: Vec<I>, limit: usize, task: F) -> Result<Aggregated<O>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = std::result::Result<O, E>>,
    E: Display,
{
    if limit == 0 {
        return Err(QuarryError::invalid_state(
            "concurrency limit must be a positive integer",
        ));
    }

    let total = items.len();
    let task = &task;
    let mut indexed: Vec<(usize, std::result::Result<O, TaskFailure>)> =
        stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| async move {
                let outcome = task(item).await.map_err(|e| TaskFailure {
                    index,
                    message: e.to_string(),
                });
                (index, outcome)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

    indexed.sort_by_key(|(index, _)| *index);

    let errors: Vec<TaskFailure> = indexed
        .iter()
        .filter_map(|(_, outcome)| outcome.as_ref().err().cloned())
        .collect();
    let results = indexed.into_iter().map(|(_, outcome)| outcome).collect();

    debug!(
        "Aggregated {} items (limit {}), {} failed",
        total,
        limit,
        errors.len()
    );

    Ok(Aggregated { results, errors })
}

/// Fetch detail records for `ids`, at most `limit` requests at a time.
pub async fn fetch_details(
    fetcher: &dyn DetailFetcher,
    ids: Vec<String>,
    limit: usize,
) -> Result<Aggregated<Value>> {
    run(ids, limit, |id| async move { fetcher.fetch_details(&id).await }).await
}
