use crate::retry::RetryBackoff;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use moka::Expiry;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use parking_lot::Mutex;
use scraper::domain::request::QueryRequest;
use scraper::domain::{FetchStatus, QueryHandle, QueryKey, QueryPolicy, QueryState, QueryStatus};
use scraper::events::{
    QueryEvent, QueryEvictedEvent, QueryFailedEvent, QueryFetchedEvent, now_timestamp,
};
use scraper::ports::{FetchAction, QueryRunner};
use serde_json::Value;
use shared::config::Config;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

type InFlight = Shared<BoxFuture<'static, ()>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cache entry for one query key
struct QueryEntry {
    key: QueryKey,
    state: watch::Sender<QueryState>,
    // Latest fetch action and policy registered for this key
    fetch: Mutex<FetchAction>,
    policy: Mutex<QueryPolicy>,
    in_flight: Mutex<Option<InFlight>>,
    observers: AtomicUsize,
    interval_task: Mutex<Option<JoinHandle<()>>>,
}

impl QueryEntry {
    fn observed(request: &QueryRequest) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            key: request.key.clone(),
            state,
            fetch: Mutex::new(Arc::clone(&request.fetch)),
            policy: Mutex::new(request.policy.clone()),
            in_flight: Mutex::new(None),
            observers: AtomicUsize::new(1),
            interval_task: Mutex::new(None),
        }
    }

    fn policy(&self) -> QueryPolicy {
        self.policy.lock().clone()
    }

    fn is_observed(&self) -> bool {
        self.observers.load(Ordering::Acquire) > 0
    }

    fn should_fetch(&self) -> bool {
        let policy = self.policy();
        policy.enabled && self.state.borrow().is_stale(policy.stale_time)
    }

    /// Observed entries are exempt from size-based eviction.
    fn weight(&self) -> u32 {
        if self.is_observed() { 0 } else { 1 }
    }

    /// Observed entries never expire; unobserved ones live for `gc_time`.
    fn retention(&self) -> Option<Duration> {
        if self.is_observed() {
            None
        } else {
            Some(self.policy.lock().gc_time)
        }
    }

    fn stop_interval(&self) {
        if let Some(task) = self.interval_task.lock().take() {
            task.abort();
        }
    }
}

struct RetentionExpiry;

impl Expiry<QueryKey, Arc<QueryEntry>> for RetentionExpiry {
    fn expire_after_create(
        &self,
        _key: &QueryKey,
        entry: &Arc<QueryEntry>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        entry.retention()
    }

    fn expire_after_update(
        &self,
        _key: &QueryKey,
        entry: &Arc<QueryEntry>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        entry.retention()
    }
}

struct ClientInner {
    entries: Cache<QueryKey, Arc<QueryEntry>>,
    backoff: RetryBackoff,
    events: broadcast::Sender<QueryEvent>,
    focused: AtomicBool,
}

impl ClientInner {
    /// Start a fetch for `entry`, or join the one already running.
    fn fetch(&self, entry: &Arc<QueryEntry>) -> InFlight {
        let mut in_flight = entry.in_flight.lock();
        if let Some(running) = in_flight.as_ref() {
            debug!("Joining in-flight fetch for '{}'", entry.key);
            return running.clone();
        }

        entry.state.send_modify(|state| {
            state.fetch_status = FetchStatus::Fetching;
            state.failure_count = 0;
            state.failure_reason = None;
        });

        let task = execute(Arc::clone(entry), self.backoff, self.events.clone())
            .boxed()
            .shared();
        *in_flight = Some(task.clone());
        tokio::spawn(task.clone());
        task
    }

    /// Like `fetch`, for callers that do not wait on the result.
    fn start_fetch(&self, entry: &Arc<QueryEntry>) {
        let _ = self.fetch(entry);
    }

    fn ensure_interval(self: &Arc<Self>, entry: &Arc<QueryEntry>) {
        let policy = entry.policy();
        let Some(every) = policy.refetch_interval.filter(|_| policy.enabled) else {
            return;
        };

        let mut slot = entry.interval_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(start) = tokio::time::Instant::now().checked_add(every) else {
            warn!(
                "Refetch interval {:?} for '{}' is out of range, not scheduling",
                every, entry.key
            );
            return;
        };

        let client = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        debug!("Refetching '{}' every {:?}", entry.key, every);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (Some(client), Some(entry)) = (client.upgrade(), weak_entry.upgrade()) else {
                    break;
                };
                client.refetch_on_interval(&entry);
            }
        }));
    }

    fn refetch_on_interval(&self, entry: &Arc<QueryEntry>) {
        let policy = entry.policy();
        if !policy.enabled || !entry.is_observed() {
            return;
        }
        if !policy.refetch_interval_in_background && !self.focused.load(Ordering::Acquire) {
            trace!("Skipping interval refetch of '{}' while unfocused", entry.key);
            return;
        }
        self.start_fetch(entry);
    }

    /// Called when the last observer of `entry` goes away.
    fn release(&self, entry: &Arc<QueryEntry>) {
        // Re-insert so the expiry starts the retention clock, unless the entry
        // has already been evicted or replaced.
        match self.entries.get(&entry.key) {
            Some(current) if Arc::ptr_eq(&current, entry) => {
                debug!(
                    "Query '{}' has no observers, retaining for {:?}",
                    entry.key,
                    entry.policy().gc_time
                );
                self.entries.insert(entry.key.clone(), Arc::clone(entry));
            }
            _ => {}
        }
    }
}

/// Run one fetch with retries and publish the outcome into the entry's state.
async fn execute(
    entry: Arc<QueryEntry>,
    backoff: RetryBackoff,
    events: broadcast::Sender<QueryEvent>,
) {
    let fetch = Arc::clone(&*entry.fetch.lock());
    let retry = entry.policy.lock().retry;

    let mut failures = 0u32;
    let outcome = loop {
        match fetch().await {
            Ok(data) => break Ok(data),
            Err(err) => {
                failures += 1;
                if failures > retry {
                    break Err(err);
                }
                let delay = backoff.delay_for(failures - 1);
                debug!(
                    "Attempt {} for '{}' failed: {}, retrying in {:?}",
                    failures, entry.key, err, delay
                );
                entry.state.send_modify(|state| {
                    state.failure_count = failures;
                    state.failure_reason = Some(err);
                });
                tokio::time::sleep(delay).await;
            }
        }
    };

    // Hold the slot while publishing so a caller that sees the settled state
    // starts a new fetch instead of joining this one.
    let mut in_flight = entry.in_flight.lock();
    let event = finish(&entry, outcome, failures);
    in_flight.take();
    drop(in_flight);

    publish(&events, event);
}

fn finish(entry: &QueryEntry, outcome: shared::Result<Value>, failures: u32) -> QueryEvent {
    match outcome {
        Ok(data) => {
            entry.state.send_modify(|state| {
                state.status = QueryStatus::Success;
                state.fetch_status = FetchStatus::Idle;
                state.data = Some(data);
                state.error = None;
                state.failure_count = 0;
                state.failure_reason = None;
                state.data_updated_at = Some(Instant::now());
                state.is_invalidated = false;
            });
            debug!("Fetched '{}' in {} attempt(s)", entry.key, failures + 1);
            QueryEvent::Fetched(QueryFetchedEvent {
                key: entry.key.clone(),
                attempts: failures + 1,
                timestamp: now_timestamp(),
            })
        }
        Err(err) => {
            warn!(
                "Query '{}' failed after {} attempt(s): {}",
                entry.key, failures, err
            );
            let message = err.to_string();
            entry.state.send_modify(|state| {
                state.status = QueryStatus::Error;
                state.fetch_status = FetchStatus::Idle;
                state.error = Some(err.clone());
                state.failure_count = failures;
                state.failure_reason = Some(err);
            });
            QueryEvent::Failed(QueryFailedEvent {
                key: entry.key.clone(),
                error: message,
                failure_count: failures,
                timestamp: now_timestamp(),
            })
        }
    }
}

fn publish(events: &broadcast::Sender<QueryEvent>, event: QueryEvent) {
    let kind = match &event {
        QueryEvent::Fetched(_) => "fetched",
        QueryEvent::Failed(_) => "failed",
        QueryEvent::Evicted(_) => "evicted",
    };
    let key = event.key().clone();
    match events.send(event) {
        Ok(subscriber_count) => {
            trace!(
                "Broadcasted {} event for '{}' to {} subscriber(s)",
                kind, key, subscriber_count
            );
        }
        Err(_) => {
            trace!("No subscribers for {} event on '{}'", kind, key);
        }
    }
}

/// Keeps a query observed for as long as its handle lives
struct ObserverGuard {
    client: Weak<ClientInner>,
    entry: Arc<QueryEntry>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if self.entry.observers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.entry.stop_interval();
        let Some(client) = self.client.upgrade() else {
            return;
        };
        // A new observer may have arrived while the interval was stopping
        if self.entry.is_observed() {
            client.ensure_interval(&self.entry);
        } else {
            client.release(&self.entry);
        }
    }
}

/// Moka-backed managed query engine.
///
/// Deduplicates fetches per key, tracks status, retries with exponential
/// backoff, refetches stale data on observe, on focus and on an interval,
/// and evicts entries `gc_time` after their last observer is dropped.
/// Requires a tokio runtime: fetches run as spawned tasks.
#[derive(Clone)]
pub struct MokaQueryClient {
    inner: Arc<ClientInner>,
}

impl MokaQueryClient {
    pub fn new(max_queries: Option<u64>, backoff: RetryBackoff) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let eviction_events = events.clone();

        let mut builder = Cache::builder()
            .name("scraper-queries")
            .expire_after(RetentionExpiry)
            .weigher(|_key: &QueryKey, entry: &Arc<QueryEntry>| entry.weight())
            .eviction_listener(
                move |key: Arc<QueryKey>, entry: Arc<QueryEntry>, cause: RemovalCause| {
                    if !cause.was_evicted() {
                        return;
                    }
                    entry.stop_interval();
                    debug!("Evicted query '{}' ({:?})", key, cause);
                    publish(
                        &eviction_events,
                        QueryEvent::Evicted(QueryEvictedEvent {
                            key: (*key).clone(),
                            timestamp: now_timestamp(),
                        }),
                    );
                },
            );

        if let Some(capacity) = max_queries {
            builder = builder.max_capacity(capacity);
        }

        Self {
            inner: Arc::new(ClientInner {
                entries: builder.build(),
                backoff,
                events,
                focused: AtomicBool::new(true),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Some(config.max_queries), RetryBackoff::from_config(config))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_focused(&self) -> bool {
        self.inner.focused.load(Ordering::Acquire)
    }

    /// Record whether the consumer is in the foreground. Regaining focus
    /// refetches every observed, stale query that opted into it.
    pub fn set_focused(&self, focused: bool) {
        let was_focused = self.inner.focused.swap(focused, Ordering::AcqRel);
        if !focused || was_focused {
            return;
        }

        debug!("Focus regained, refetching stale queries");
        for (_, entry) in self.inner.entries.iter() {
            if entry.is_observed() && entry.policy().refetch_on_window_focus && entry.should_fetch()
            {
                self.inner.start_fetch(&entry);
            }
        }
    }

    /// Mark every query under `prefix` stale and refetch the observed ones.
    /// Returns the number of queries matched.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        let mut matched = 0;
        for (key, entry) in self.inner.entries.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            matched += 1;
            entry.state.send_modify(|state| state.is_invalidated = true);
            if entry.is_observed() && entry.policy().enabled {
                self.inner.start_fetch(&entry);
            }
        }
        debug!("Invalidated {} query(ies) under '{}'", matched, prefix);
        matched
    }

    /// Fetch `key` now, regardless of staleness or enablement, and return
    /// the resulting state. `None` if the key is not cached.
    pub async fn refetch(&self, key: &QueryKey) -> Option<QueryState> {
        let entry = self.inner.entries.get(key)?;
        self.inner.fetch(&entry).await;
        let state = entry.state.borrow().clone();
        Some(state)
    }

    /// Drop every query under `prefix` from the cache. Live handles keep
    /// their last state but stop receiving updates.
    pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
        let keys: Vec<Arc<QueryKey>> = self
            .inner
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| {
                entry.stop_interval();
                key
            })
            .collect();

        for key in &keys {
            self.inner.entries.invalidate(&**key);
        }
        keys.len()
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
        self.inner
            .entries
            .get(key)
            .and_then(|entry| entry.state.borrow().data.clone())
    }

    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.state.borrow().clone())
    }

    pub fn query_count(&self) -> u64 {
        self.inner.entries.run_pending_tasks();
        self.inner.entries.entry_count()
    }

    /// Apply pending expirations now (fires eviction events).
    pub fn run_pending_tasks(&self) {
        self.inner.entries.run_pending_tasks();
    }
}

impl Default for MokaQueryClient {
    fn default() -> Self {
        Self::new(None, RetryBackoff::default())
    }
}

impl QueryRunner for MokaQueryClient {
    fn run_query(&self, request: QueryRequest) -> QueryHandle {
        let inserted = self
            .inner
            .entries
            .entry(request.key.clone())
            .or_insert_with(|| Arc::new(QueryEntry::observed(&request)));
        let created = inserted.is_fresh();
        let entry = inserted.into_value();

        if !created {
            *entry.fetch.lock() = Arc::clone(&request.fetch);
            *entry.policy.lock() = request.policy.clone();
            entry.observers.fetch_add(1, Ordering::AcqRel);
            // Re-insert so expiry and weight see the new observer
            self.inner
                .entries
                .insert(request.key.clone(), Arc::clone(&entry));
        }

        let receiver = entry.state.subscribe();
        if entry.should_fetch() {
            self.inner.start_fetch(&entry);
        } else {
            trace!("Query '{}' is fresh or disabled, not fetching", entry.key);
        }
        self.inner.ensure_interval(&entry);

        let observer = ObserverGuard {
            client: Arc::downgrade(&self.inner),
            entry,
        };
        QueryHandle::new(request.key, receiver, Some(Box::new(observer)))
    }
}

impl Debug for MokaQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaQueryClient")
            .field("entry_count", &self.inner.entries.entry_count())
            .field("focused", &self.is_focused())
            .finish()
    }
}
