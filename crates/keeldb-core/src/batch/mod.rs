use crate::{
    MAX_BATCH_KEYS,
    cache::InstanceCache,
    db::Db,
    error::Error,
    instance::Instance,
    key::PrimaryId,
    schema::EntityDef,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::trace;

/// Upper bound on how long a pending entry may sit in a queue before it is
/// rejected with `TimeoutError`. Meaningfully longer than any sane
/// coalescing window.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(8);

type FetchResult = Result<Arc<Instance>, Error>;

///
/// FetchEnv
///
/// Everything a queue needs to execute its flush: the engine handle, the
/// target entity, the resolved tenant segment, and the owning context's
/// cache for write-through.
///

#[derive(Clone)]
pub(crate) struct FetchEnv {
    pub db: Db,
    pub entity: Arc<EntityDef>,
    pub tenant: String,
    pub cache: Option<Arc<InstanceCache>>,
}

///
/// BatchScheduler
///
/// Coalesces concurrent point-reads into batched backend fetches. Each
/// pending request belongs to a queue keyed by (entity, delay); the first
/// insertion into an empty queue arms a flush timer, and reaching the
/// backend's batch ceiling flushes early. Concurrent requests for the same
/// id share one underlying fetch.
///
/// The scheduler is per-context and single-owner; the mutex only guards
/// against interleaving at suspension points, never against parallel
/// mutation from other contexts.
///

#[derive(Clone, Debug, Default)]
pub struct BatchScheduler {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<QueueKey, Queue>,
    shut: bool,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct QueueKey {
    entity: String,
    delay_ms: u64,
}

struct Queue {
    env: FetchEnv,
    epoch: u64,
    pending: BTreeMap<String, Pending>,
    timer: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("epoch", &self.epoch)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Pending {
    waiters: Vec<oneshot::Sender<FetchResult>>,
}

impl BatchScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a point-read and await its batched resolution.
    pub(crate) async fn fetch(
        &self,
        env: FetchEnv,
        id: &PrimaryId,
        delay_ms: u64,
    ) -> FetchResult {
        let rx = self.enqueue(env, id, delay_ms)?;

        match rx.await {
            Ok(result) => result,
            // sender dropped: the owning context tore down
            Err(_) => Err(Error::Canceled),
        }
    }

    fn enqueue(
        &self,
        env: FetchEnv,
        id: &PrimaryId,
        delay_ms: u64,
    ) -> Result<oneshot::Receiver<FetchResult>, Error> {
        let (tx, rx) = oneshot::channel();
        let key = QueueKey {
            entity: env.entity.name.clone(),
            delay_ms,
        };

        let mut state = self.state.lock().expect("scheduler lock");
        if state.shut {
            return Err(Error::Canceled);
        }

        let queue = state.queues.entry(key.clone()).or_insert_with(|| Queue {
            env,
            epoch: 0,
            pending: BTreeMap::new(),
            timer: None,
            watchdog: None,
        });

        let was_empty = queue.pending.is_empty();
        queue.pending.entry(id.to_string()).or_default().waiters.push(tx);

        let epoch = queue.epoch;
        let pending_len = queue.pending.len();

        if pending_len >= MAX_BATCH_KEYS {
            // backend batch ceiling: flush without waiting out the window
            let scheduler = self.clone();
            let flush_key = key;
            queue.timer = Some(tokio::spawn(async move {
                scheduler.flush(flush_key, epoch).await;
            }));
        } else if was_empty {
            let scheduler = self.clone();
            let timer_key = key.clone();
            queue.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                scheduler.flush(timer_key, epoch).await;
            }));

            let scheduler = self.clone();
            queue.watchdog = Some(tokio::spawn(async move {
                tokio::time::sleep(WATCHDOG_TIMEOUT).await;
                scheduler.expire(key, epoch);
            }));
        }

        Ok(rx)
    }

    /// Flush one queue generation: one batched backend call, results
    /// demultiplexed to every waiter, misses resolved to sentinels.
    async fn flush(&self, key: QueueKey, epoch: u64) {
        let Some((env, pending)) = self.take_generation(&key, epoch) else {
            return;
        };

        let ids: Vec<String> = pending.keys().cloned().collect();
        let waiter_count: usize = pending.values().map(|p| p.waiters.len()).sum();
        trace!(
            entity = %key.entity,
            keys = ids.len(),
            waiters = waiter_count,
            "flushing batched read"
        );

        match env.db.execute_batch_fetch(&env, &ids).await {
            Ok(instances) => {
                for (id, entry) in pending {
                    let result = instances.get(&id).cloned().map_or_else(
                        || {
                            Err(Error::DataFormat(crate::key::DataFormatError::PrimaryId {
                                data: id.clone(),
                                expected: "a fetched or sentinel instance",
                            }))
                        },
                        Ok,
                    );
                    for waiter in entry.waiters {
                        let _ = waiter.send(result.clone());
                    }
                }
            }
            Err(err) => {
                // backend errors propagate to all waiters in the batch
                for entry in pending.into_values() {
                    for waiter in entry.waiters {
                        let _ = waiter.send(Err(err.clone()));
                    }
                }
            }
        }
    }

    /// Watchdog: reject a stranded generation with `TimeoutError`.
    fn expire(&self, key: QueueKey, epoch: u64) {
        let Some((_, pending)) = self.take_generation(&key, epoch) else {
            return;
        };

        for entry in pending.into_values() {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(Error::Timeout {
                    entity: key.entity.clone(),
                    delay_ms: key.delay_ms,
                }));
            }
        }
    }

    /// Detach the current pending set if the generation still matches.
    /// Bumping the epoch makes any outstanding timer or watchdog for the
    /// old generation a no-op.
    fn take_generation(
        &self,
        key: &QueueKey,
        epoch: u64,
    ) -> Option<(FetchEnv, BTreeMap<String, Pending>)> {
        let mut state = self.state.lock().expect("scheduler lock");
        let queue = state.queues.get_mut(key)?;
        if queue.epoch != epoch || queue.pending.is_empty() {
            return None;
        }

        queue.epoch += 1;
        if let Some(watchdog) = queue.watchdog.take() {
            watchdog.abort();
        }
        queue.timer = None;

        Some((queue.env.clone(), std::mem::take(&mut queue.pending)))
    }

    /// Context teardown: cancel every pending entry and refuse new ones.
    pub fn shutdown(&self) {
        let queues = {
            let mut state = self.state.lock().expect("scheduler lock");
            state.shut = true;
            std::mem::take(&mut state.queues)
        };

        for queue in queues.into_values() {
            if let Some(timer) = queue.timer {
                timer.abort();
            }
            if let Some(watchdog) = queue.watchdog {
                watchdog.abort();
            }
            for entry in queue.pending.into_values() {
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(Error::Canceled));
                }
            }
        }
    }

    /// Whether any request is awaiting a flush.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.state
            .lock()
            .expect("scheduler lock")
            .queues
            .values()
            .any(|q| !q.pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, key::PrimaryId, test_fixtures};
    use futures::poll;
    use std::task::Poll;

    fn env(db: &Db) -> FetchEnv {
        FetchEnv {
            db: db.clone(),
            entity: db.registry().entity("user").unwrap(),
            tenant: crate::key::NO_TENANT.to_string(),
            cache: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_fetches() {
        let (db, _) = test_fixtures::test_db();
        let scheduler = BatchScheduler::new();
        let id = PrimaryId::simple("01ARZ3NDEKTSV4RRFFQ69G5FAV");

        let fetch = scheduler.fetch(env(&db), &id, 60_000);
        tokio::pin!(fetch);
        assert!(matches!(poll!(fetch.as_mut()), Poll::Pending));

        scheduler.shutdown();
        assert!(matches!(fetch.await, Err(Error::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_after_shutdown_is_refused() {
        let (db, _) = test_fixtures::test_db();
        let scheduler = BatchScheduler::new();
        scheduler.shutdown();

        let result = scheduler
            .fetch(env(&db), &PrimaryId::simple("x"), 10)
            .await;
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn stranded_generation_expires_with_timeout() {
        let (db, _) = test_fixtures::test_db();
        let scheduler = BatchScheduler::new();
        let id = PrimaryId::simple("01ARZ3NDEKTSV4RRFFQ69G5FAV");

        let fetch = scheduler.fetch(env(&db), &id, 60_000);
        tokio::pin!(fetch);
        assert!(matches!(poll!(fetch.as_mut()), Poll::Pending));

        let key = QueueKey {
            entity: "user".to_string(),
            delay_ms: 60_000,
        };
        scheduler.expire(key, 0);

        assert!(matches!(
            fetch.await,
            Err(Error::Timeout { entity, delay_ms }) if entity == "user" && delay_ms == 60_000
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_resolves_misses_as_sentinels() {
        let (db, store) = test_fixtures::test_db();
        let scheduler = BatchScheduler::new();
        let id = PrimaryId::simple("01ARZ3NDEKTSV4RRFFQ69G5FAV");

        let instance = scheduler.fetch(env(&db), &id, 5).await.unwrap();

        assert!(!instance.exists());
        assert_eq!(store.op_count("batch_get_item"), 1);
        assert_eq!(store.op_count("get_item"), 0);
    }
}
