//! Per-key call coalescing.
//!
//! Concurrent callers for the same key share one execution of the supplied
//! future and all receive a clone of its output. The future runs on its own
//! task, so dropping or timing out any caller (the first one included) never
//! interrupts it. The slot is removed once that task finishes or panics; the
//! next caller after that starts a fresh execution.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;

type Slot<V> = watch::Receiver<Option<V>>;
type Slots<K, V> = Arc<Mutex<HashMap<K, Slot<V>>>>;

/// The shared call ended without a value (its task panicked or was aborted by
/// runtime shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("in-flight call ended without producing a value")]
pub struct Abandoned;

pub struct SingleFlight<K, V> {
    slots: Slots<K, V>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Whether a caller started the shared call or joined one already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `make()` unless a call for `key` is already in flight, then waits
    /// for the shared output.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<(V, Role), Abandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let joined = {
            let mut slots = lock(&self.slots);
            match slots.get(&key) {
                Some(existing) => Err(existing.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), rx.clone());
                    Ok((tx, rx))
                }
            }
        };

        let (mut rx, role) = match joined {
            Ok((tx, rx)) => {
                self.spawn_call(key, tx, make());
                (rx, Role::Leader)
            }
            Err(rx) => (rx, Role::Follower),
        };

        let value = match rx.wait_for(Option::is_some).await {
            Ok(published) => published.clone(),
            Err(_) => None,
        };
        value.map(|value| (value, role)).ok_or(Abandoned)
    }

    /// Number of keys with an in-flight call.
    pub fn in_flight(&self) -> usize {
        lock(&self.slots).len()
    }

    fn spawn_call<Fut>(&self, key: K, tx: watch::Sender<Option<V>>, call: Fut)
    where
        Fut: Future<Output = V> + Send + 'static,
    {
        let slots = self.slots.clone();
        tokio::spawn(async move {
            // Runs on completion and on panic; a dropped sender wakes waiters.
            let release = scopeguard::guard((), move |_| {
                lock(&slots).remove(&key);
            });
            let value = call.await;
            drop(release);
            let _ = tx.send(Some(value));
        });
    }
}

fn lock<K, V>(slots: &Slots<K, V>) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
    // A poisoned map still holds valid slots.
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
