//! Single-flight: merge concurrent identical operations into one.
//!
//! The first caller for a key becomes the leader and runs its future; callers
//! arriving while it is in flight wait for the leader's result instead of
//! running their own. If the leader is dropped before finishing, a waiting
//! caller takes over with its own future.

use crate::types::Result;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::trace;

/// Outcome broadcast to followers
type Shared<V> = Option<Result<V>>;

pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, watch::Receiver<Shared<V>>>>,
}

enum Role<V> {
    Leader(watch::Sender<Shared<V>>),
    Follower(watch::Receiver<Shared<V>>),
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fut` for `key` unless an identical call is already in flight.
    ///
    /// Followers receive a copy of the leader's result, errors included.
    pub async fn run<F>(&self, key: K, fut: F) -> Result<V>
    where
        F: Future<Output = Result<V>>,
    {
        loop {
            let role = {
                let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
                match calls.get(&key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        calls.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        calls: &self.calls,
                        key: key.clone(),
                    };
                    let result = fut.await;
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => {
                    trace!("Joining in-flight call for {:?}", key);
                    loop {
                        let current = rx.borrow().clone();
                        if let Some(outcome) = current {
                            return outcome;
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    // leader went away without a result; try again
                }
            }
        }
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry when the leader finishes or is dropped
struct InFlightGuard<'a, K: Eq + Hash, V> {
    calls: &'a Mutex<HashMap<K, watch::Receiver<Shared<V>>>>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for InFlightGuard<'_, K, V> {
    fn drop(&mut self) {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuarryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_followers_share_leader_result() {
        let flight: SingleFlight<&str, u32> = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let op = || {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(7)
            }
        };

        let (a, b) = tokio::join!(flight.run("k", op()), flight.run("k", op()));
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_followers_see_leader_error() {
        let flight: SingleFlight<&str, u32> = SingleFlight::new();

        let failing = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(QuarryError::remote("timeout"))
        };
        let (a, b) = tokio::join!(flight.run("k", failing), flight.run("k", async { Ok(1) }));

        assert!(a.is_err());
        assert!(matches!(b, Err(QuarryError::RemoteUnavailable(msg)) if msg == "timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_followers_keep_leader_error_variant() {
        let flight: SingleFlight<&str, u32> = SingleFlight::new();

        let failing = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(QuarryError::invalid_state("unknown table"))
        };
        let (a, b) = tokio::join!(flight.run("k", failing), flight.run("k", async { Ok(1) }));

        assert!(matches!(a, Err(QuarryError::InvalidState(_))));
        let b = b.unwrap_err();
        assert_eq!(b.error_code(), -32002);
        assert!(matches!(b, QuarryError::InvalidState(msg) if msg == "unknown table"));
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flight: SingleFlight<&str, &str> = SingleFlight::new();
        let (a, b) = tokio::join!(
            flight.run("a", async { Ok("a") }),
            flight.run("b", async { Ok("b") })
        );
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_takes_over_when_leader_is_dropped() {
        let flight: SingleFlight<&str, u32> = SingleFlight::new();

        let leader = flight.run("k", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        });
        let follower = flight.run("k", async { Ok(2) });

        // Poll the leader once, then drop it before it finishes
        let result = tokio::select! {
            biased;
            _ = leader => unreachable!("leader sleeps for a minute"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => None::<()>,
        };
        assert!(result.is_none());
        assert_eq!(flight.in_flight(), 0);

        assert_eq!(follower.await.unwrap(), 2);
    }
}
