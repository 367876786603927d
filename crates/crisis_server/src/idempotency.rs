use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

const IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(60);

/// Deduplicates client operations by key. Only successful results are remembered, so a
/// failed operation can be retried under the same key.
#[derive(Clone)]
pub(crate) struct IdempotencyStore<V, E> {
    inner: std::sync::Arc<Mutex<HashMap<String, Entry<V, E>>>>,
    ttl: Duration,
    max_entries: usize,
}

enum Entry<V, E> {
    InFlight {
        started_at: Instant,
        waiters: Vec<oneshot::Sender<Result<V, E>>>,
    },
    Done {
        expires_at: Instant,
        value: V,
    },
}

pub(crate) enum Begin<V, E> {
    Owner,
    Done(V),
    Wait(oneshot::Receiver<Result<V, E>>),
}

impl<V: Clone, E: Clone> IdempotencyStore<V, E> {
    pub(crate) fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(HashMap::new())),
            ttl,
            max_entries,
        }
    }

    pub(crate) async fn begin(&self, key: String) -> Begin<V, E> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        purge_expired(&mut guard, now);

        match guard.get_mut(&key) {
            Some(Entry::Done { value, .. }) => Begin::Done(value.clone()),
            Some(Entry::InFlight { waiters, .. }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Begin::Wait(rx)
            }
            None => {
                guard.insert(
                    key,
                    Entry::InFlight {
                        started_at: now,
                        waiters: Vec::new(),
                    },
                );
                if guard.len() > self.max_entries {
                    evict_oldest_done(&mut guard);
                }
                Begin::Owner
            }
        }
    }

    pub(crate) async fn complete(&self, key: String, result: Result<V, E>) {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;

        let waiters = match guard.remove(&key) {
            Some(Entry::InFlight { waiters, .. }) => waiters,
            Some(Entry::Done { .. }) | None => Vec::new(),
        };

        if let Ok(value) = &result {
            guard.insert(
                key,
                Entry::Done {
                    expires_at: now + self.ttl,
                    value: value.clone(),
                },
            );
        }

        for tx in waiters {
            let _ = tx.send(result.clone());
        }

        if guard.len() > self.max_entries {
            purge_expired(&mut guard, now);
            evict_oldest_done(&mut guard);
        }
    }
}

fn purge_expired<V, E>(guard: &mut HashMap<String, Entry<V, E>>, now: Instant) {
    guard.retain(|_, entry| match entry {
        Entry::Done { expires_at, .. } => *expires_at > now,
        Entry::InFlight { started_at, .. } => now.duration_since(*started_at) < IN_FLIGHT_TIMEOUT,
    });
}

fn evict_oldest_done<V, E>(guard: &mut HashMap<String, Entry<V, E>>) {
    let oldest = guard
        .iter()
        .filter_map(|(key, entry)| match entry {
            Entry::Done { expires_at, .. } => Some((key.clone(), *expires_at)),
            Entry::InFlight { .. } => None,
        })
        .min_by_key(|(_, expires_at)| *expires_at)
        .map(|(key, _)| key);
    if let Some(key) = oldest {
        guard.remove(&key);
    }
}
