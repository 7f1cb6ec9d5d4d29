use crate::error::AssetResult;
use crate::fetch_io::{AssetIo, CancelToken, FetchRequest, FetchThreadPool};
use crate::ticket::LoadTicket;
use crossbeam_channel::{Receiver, Sender};
use emblem_base::hashing::HashMap;
use emblem_base::{AssetKey, LoadedAsset, ResourceHandle, SharedResource};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

//
// The cache tracks every known key in exactly one of three states: queued behind the
// concurrency limit, loading on the worker pool, or cached. All state changes flow
// through one event channel drained by update() on the owner thread. Fetch results and
// ticket detaches are the only event producers besides the public API itself.
//

/// Tuning knobs for an [`AssetCache`].
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// How many fetches may be admitted at once. Runtime adjustable via
    /// [`AssetCache::set_max_concurrency`].
    pub max_concurrency: usize,
    /// How long a fully released asset is retained before disposal. A re-request
    /// within the window reuses the asset with no fetch.
    pub grace_period: Duration,
    /// OS threads servicing fetch/decode.
    pub worker_threads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_concurrency: 4,
            grace_period: Duration::from_secs(5),
            worker_threads: 4,
        }
    }
}

/// Identifies one started fetch. A completion event carrying a stale LoadId (the load
/// was cancelled and possibly restarted) is discarded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoadId(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WaiterId(pub u64);

// Sent by a fetch worker when a fetch/decode finishes one way or the other
pub(crate) struct FetchResult<T> {
    pub key: AssetKey,
    pub load_id: LoadId,
    pub result: AssetResult<LoadedAsset<T>>,
}

impl<T> fmt::Debug for FetchResult<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FetchResult")
            .field("key", &self.key)
            .field("load_id", &self.load_id)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

//
// Cache events which drive state changes for tracked keys
//
pub(crate) enum CacheEvent<T> {
    // Sent by a fetch worker when a fetch completes or fails
    LoadResult(FetchResult<T>),
    // Sent when an unresolved ticket is dropped
    Detach { key: AssetKey, waiter_id: WaiterId },
}

impl<T> fmt::Debug for CacheEvent<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            CacheEvent::LoadResult(result) => f.debug_tuple("LoadResult").field(result).finish(),
            CacheEvent::Detach { key, waiter_id } => f
                .debug_struct("Detach")
                .field("key", key)
                .field("waiter_id", waiter_id)
                .finish(),
        }
    }
}

struct Waiter<T> {
    waiter_id: WaiterId,
    resolve_tx: Sender<AssetResult<ResourceHandle<T>>>,
}

// Waiting for a concurrency slot. The FIFO position lives in the queue VecDeque.
struct QueuedLoad<T> {
    waiters: Vec<Waiter<T>>,
    prefetched: bool,
}

// Fetch handed to the worker pool
struct InFlightLoad<T> {
    load_id: LoadId,
    cancel: CancelToken,
    waiters: Vec<Waiter<T>>,
    // A prefetched load stays alive with zero waiters
    prefetched: bool,
}

struct CacheEntry<T> {
    resource: SharedResource<T>,
}

// A key is always in exactly one of these states
enum KeyState<T> {
    Queued(QueuedLoad<T>),
    Loading(InFlightLoad<T>),
    Cached(CacheEntry<T>),
}

/// Counts of tracked keys by state, taken at a point in time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cached: usize,
    pub loading: usize,
    pub queued: usize,
}

struct AssetCacheInner<T> {
    next_load_id: u64,
    next_waiter_id: u64,

    // Every key this cache knows about, each in exactly one state
    key_states: HashMap<AssetKey, KeyState<T>>,

    // FIFO of keys waiting for a concurrency slot. Entries whose record was removed
    // (all waiters detached) or superseded are skipped when popped.
    queue: VecDeque<AssetKey>,

    // Fetches admitted to the pool and not yet completed or cancelled
    active_count: usize,
    max_concurrency: usize,
    grace_period: Duration,

    // The worker pool the fetches run on. Taken and joined on drop.
    thread_pool: Option<FetchThreadPool>,

    // The event queue that drives key state changes. Events are produced by fetch
    // workers and by dropped tickets.
    events_tx: Sender<CacheEvent<T>>,
    events_rx: Receiver<CacheEvent<T>>,
}

impl<T> Drop for AssetCacheInner<T> {
    fn drop(&mut self) {
        if let Some(thread_pool) = self.thread_pool.take() {
            thread_pool.finish();
        }
    }
}

impl<T: Send + 'static> AssetCacheInner<T> {
    // Process all events, possibly changing key states, then dispose anything whose
    // grace window ran out
    #[profiling::function]
    fn update(&mut self) {
        while let Ok(cache_event) = self.events_rx.try_recv() {
            log::trace!("handle event {:?}", cache_event);
            match cache_event {
                CacheEvent::LoadResult(result) => self.handle_load_result(result),
                CacheEvent::Detach { key, waiter_id } => self.handle_detach(key, waiter_id),
            }
        }

        self.reap_expired();
    }

    fn request(
        &mut self,
        key: &AssetKey,
    ) -> LoadTicket<T> {
        let mut retire_invalid = false;
        match self.key_states.get_mut(key) {
            Some(KeyState::Queued(queued)) => {
                let waiter_id = WaiterId(self.next_waiter_id);
                self.next_waiter_id += 1;
                let (resolve_tx, ticket) =
                    LoadTicket::pending(key.clone(), waiter_id, self.events_tx.clone());
                queued.waiters.push(Waiter {
                    waiter_id,
                    resolve_tx,
                });
                return ticket;
            }
            Some(KeyState::Loading(in_flight)) => {
                let waiter_id = WaiterId(self.next_waiter_id);
                self.next_waiter_id += 1;
                let (resolve_tx, ticket) =
                    LoadTicket::pending(key.clone(), waiter_id, self.events_tx.clone());
                in_flight.waiters.push(Waiter {
                    waiter_id,
                    resolve_tx,
                });
                return ticket;
            }
            Some(KeyState::Cached(entry)) => {
                if entry.resource.is_valid() {
                    if let Ok(handle) = entry.resource.acquire() {
                        // An idle entry resurrects here with zero fetches
                        return LoadTicket::resolved(Ok(handle));
                    }
                }
                retire_invalid = true;
            }
            None => {}
        }

        if retire_invalid {
            // The asset died externally (or was disposed under us), retire the entry
            // and fetch fresh
            log::debug!("cached entry no longer valid {:?}", key);
            if let Some(KeyState::Cached(entry)) = self.key_states.remove(key) {
                entry.resource.dispose();
            }
        }

        let waiter_id = WaiterId(self.next_waiter_id);
        self.next_waiter_id += 1;
        let (resolve_tx, ticket) =
            LoadTicket::pending(key.clone(), waiter_id, self.events_tx.clone());
        self.start_or_enqueue(
            key.clone(),
            vec![Waiter {
                waiter_id,
                resolve_tx,
            }],
            false,
        );
        ticket
    }

    fn prefetch(
        &mut self,
        key: &AssetKey,
    ) {
        let mut retire_invalid = false;
        match self.key_states.get_mut(key) {
            Some(KeyState::Queued(queued)) => {
                // Pin the existing load so waiter detaches no longer cancel it
                queued.prefetched = true;
                return;
            }
            Some(KeyState::Loading(in_flight)) => {
                in_flight.prefetched = true;
                return;
            }
            Some(KeyState::Cached(entry)) => {
                if entry.resource.is_valid() {
                    return;
                }
                retire_invalid = true;
            }
            None => {}
        }

        if retire_invalid {
            log::debug!("cached entry no longer valid {:?}", key);
            if let Some(KeyState::Cached(entry)) = self.key_states.remove(key) {
                entry.resource.dispose();
            }
        }

        self.start_or_enqueue(key.clone(), Vec::new(), true);
    }

    fn start_or_enqueue(
        &mut self,
        key: AssetKey,
        waiters: Vec<Waiter<T>>,
        prefetched: bool,
    ) {
        if self.active_count < self.max_concurrency {
            self.start_load(key, waiters, prefetched);
        } else {
            log::debug!("queue load {:?}", key);
            self.queue.push_back(key.clone());
            self.key_states
                .insert(key, KeyState::Queued(QueuedLoad { waiters, prefetched }));
        }
    }

    fn start_load(
        &mut self,
        key: AssetKey,
        waiters: Vec<Waiter<T>>,
        prefetched: bool,
    ) {
        let load_id = LoadId(self.next_load_id);
        self.next_load_id += 1;
        let cancel = CancelToken::new();

        log::debug!("start load {:?} {:?}", key, load_id);
        self.active_count += 1;
        self.thread_pool.as_ref().unwrap().add_request(FetchRequest {
            key: key.clone(),
            load_id,
            cancel: cancel.clone(),
        });
        self.key_states.insert(
            key,
            KeyState::Loading(InFlightLoad {
                load_id,
                cancel,
                waiters,
                prefetched,
            }),
        );
    }

    // Admit queued loads until the concurrency budget is used up
    fn start_next_queued(&mut self) {
        while self.active_count < self.max_concurrency {
            let key = match self.queue.pop_front() {
                Some(key) => key,
                None => return,
            };

            // Skip FIFO entries whose queued record was removed or superseded
            let is_queued = matches!(self.key_states.get(&key), Some(KeyState::Queued(_)));
            if !is_queued {
                continue;
            }

            let queued = match self.key_states.remove(&key) {
                Some(KeyState::Queued(queued)) => queued,
                _ => unreachable!(),
            };
            self.start_load(key, queued.waiters, queued.prefetched);
        }
    }

    fn handle_load_result(
        &mut self,
        fetch_result: FetchResult<T>,
    ) {
        let FetchResult {
            key,
            load_id,
            result,
        } = fetch_result;

        // Bail if the key is no longer loading or the load was superseded. Results of
        // cancelled fetches land here and are dropped on the floor.
        let is_current = matches!(
            self.key_states.get(&key),
            Some(KeyState::Loading(in_flight)) if in_flight.load_id == load_id
        );
        if !is_current {
            log::trace!("discard stale load result {:?} {:?}", key, load_id);
            return;
        }

        let in_flight = match self.key_states.remove(&key) {
            Some(KeyState::Loading(in_flight)) => in_flight,
            _ => unreachable!(),
        };
        self.active_count -= 1;

        match result {
            Ok(loaded) => {
                log::debug!("load complete {:?} {:?}", key, load_id);
                let resource = SharedResource::new(loaded.asset, loaded.lifecycle);
                for waiter in in_flight.waiters {
                    // A fresh resource cannot be disposed yet
                    let handle = resource.acquire().unwrap();
                    // A send failure means the ticket was dropped, the handle drops
                    // with it and the reference comes right back
                    let _ = waiter.resolve_tx.send(Ok(handle));
                }
                self.key_states
                    .insert(key, KeyState::Cached(CacheEntry { resource }));
            }
            Err(error) => {
                // Failures are not cached. The record is deleted outright so the next
                // request for this key starts a clean retry.
                if in_flight.waiters.is_empty() {
                    // Best-effort prefetch, stay quiet
                    log::debug!("prefetched load failed {:?}: {}", key, error);
                } else {
                    log::warn!("load failed {:?}: {}", key, error);
                }
                for waiter in in_flight.waiters {
                    let _ = waiter.resolve_tx.send(Err(error.clone()));
                }
            }
        }

        self.start_next_queued();
    }

    fn handle_detach(
        &mut self,
        key: AssetKey,
        waiter_id: WaiterId,
    ) {
        match self.key_states.get_mut(&key) {
            Some(KeyState::Queued(queued)) => {
                queued.waiters.retain(|waiter| waiter.waiter_id != waiter_id);
                if queued.waiters.is_empty() && !queued.prefetched {
                    // The FIFO entry goes stale and is skipped when popped
                    log::debug!("drop queued load with no waiters {:?}", key);
                    self.key_states.remove(&key);
                }
            }
            Some(KeyState::Loading(in_flight)) => {
                in_flight
                    .waiters
                    .retain(|waiter| waiter.waiter_id != waiter_id);
                if in_flight.waiters.is_empty() && !in_flight.prefetched {
                    log::debug!("cancel in-flight load with no waiters {:?}", key);
                    in_flight.cancel.cancel();
                    self.key_states.remove(&key);
                    self.active_count -= 1;
                    self.start_next_queued();
                }
            }
            _ => {
                // Already resolved or gone, nothing to detach from
            }
        }
    }

    fn reap_expired(&mut self) {
        let mut expired_keys = Vec::new();
        for (key, state) in &self.key_states {
            if let KeyState::Cached(entry) = state {
                if entry.resource.is_expired(self.grace_period) {
                    expired_keys.push(key.clone());
                }
            }
        }

        for key in expired_keys {
            log::debug!("dispose idle asset {:?}", key);
            if let Some(KeyState::Cached(entry)) = self.key_states.remove(&key) {
                entry.resource.dispose();
            }
        }
    }

    fn set_max_concurrency(
        &mut self,
        max_concurrency: usize,
    ) {
        assert!(max_concurrency > 0);
        self.max_concurrency = max_concurrency;
        // A raised limit admits queued loads immediately
        self.start_next_queued();
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for state in self.key_states.values() {
            match state {
                KeyState::Queued(_) => stats.queued += 1,
                KeyState::Loading(_) => stats.loading += 1,
                KeyState::Cached(_) => stats.cached += 1,
            }
        }
        stats
    }
}

//
// The AssetCache acts as the public interface for AssetCacheInner.
//
pub struct AssetCache<T> {
    inner: Arc<Mutex<AssetCacheInner<T>>>,
}

impl<T> Clone for AssetCache<T> {
    fn clone(&self) -> Self {
        AssetCache {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> AssetCache<T> {
    pub fn new(
        io: Arc<dyn AssetIo<T>>,
        config: CacheConfig,
    ) -> Self {
        assert!(config.max_concurrency > 0);
        assert!(config.worker_threads > 0);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let thread_pool = Some(FetchThreadPool::new(
            io,
            config.worker_threads,
            events_tx.clone(),
        ));

        let inner = AssetCacheInner {
            next_load_id: 0,
            next_waiter_id: 0,
            key_states: Default::default(),
            queue: Default::default(),
            active_count: 0,
            max_concurrency: config.max_concurrency,
            grace_period: config.grace_period,
            thread_pool,
            events_tx,
            events_rx,
        };

        AssetCache {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Start or join a load and get a ticket for its outcome. Concurrent requests for
    /// one key all resolve from a single underlying fetch.
    pub fn request(
        &self,
        key: &AssetKey,
    ) -> LoadTicket<T> {
        self.inner.lock().unwrap().request(key)
    }

    /// Fire-and-forget: start or join a load without attaching a waiter. The load
    /// survives with zero waiters and failures are silent.
    pub fn prefetch(
        &self,
        key: &AssetKey,
    ) {
        self.inner.lock().unwrap().prefetch(key)
    }

    /// Drain fetch results and detaches, resolve tickets, and dispose anything whose
    /// grace window ran out. Call once per host tick from the owner thread.
    pub fn update(&self) {
        self.inner.lock().unwrap().update()
    }

    pub fn set_max_concurrency(
        &self,
        max_concurrency: usize,
    ) {
        self.inner.lock().unwrap().set_max_concurrency(max_concurrency)
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.lock().unwrap().max_concurrency
    }

    pub fn grace_period(&self) -> Duration {
        self.inner.lock().unwrap().grace_period
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats()
    }
}
