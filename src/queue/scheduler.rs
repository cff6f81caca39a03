//! Per-named-queue FIFO execution with retry/backoff.
//!
//! Each named queue drains on its own thread, strictly in submission
//! order: item N+1 never starts before item N reaches a terminal state.
//! Retry-delay waits and the blocking transport call suspend only that
//! queue's thread. Cross-queue writes to the shared storage index are
//! serialized through one guard so read-modify-write stays atomic per
//! call.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use super::events::{EventEmitter, Outcome};
use super::record::{self, QueuedRequest, RequestDescriptor};
use super::{CancelToken, QueueError, Status, Transport, TransportError};
use crate::config::Config;
use crate::reconcile::{substitute, substitution_hits, Reconciler};
use crate::serializer::SerializerRegistry;
use crate::storage::PersistentStore;
use crate::vdata::{dehydrate, Value, VdataId};

/// One scheduled submission: the record plus its runtime-only companions
/// (callbacks, cancellation). None of these survive a restart.
pub struct QueueItem {
    pub request: Mutex<QueuedRequest>,
    pub emitter: EventEmitter,
    pub cancel: CancelToken,
}

impl QueueItem {
    pub fn new(request: QueuedRequest) -> Arc<Self> {
        Arc::new(QueueItem {
            request: Mutex::new(request),
            emitter: EventEmitter::new(),
            cancel: CancelToken::new(),
        })
    }

    pub fn id(&self) -> String {
        self.request
            .lock()
            .map(|r| r.id.clone())
            .unwrap_or_default()
    }

    pub fn queue(&self) -> String {
        self.request
            .lock()
            .map(|r| r.queue.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Status {
        self.request
            .lock()
            .map(|r| r.status)
            .unwrap_or(Status::Pending)
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<QueueItem>>,
    running: bool,
}

pub(crate) struct SchedulerShared {
    transport: Arc<dyn Transport>,
    store: Arc<dyn PersistentStore>,
    registry: Arc<RwLock<SerializerRegistry>>,
    reconciler: Arc<Reconciler>,
    config: Config,
    queues: Mutex<HashMap<String, QueueState>>,
    /// Cancel tokens of currently executing items, keyed by (queue, id).
    running: Mutex<HashMap<(String, String), CancelToken>>,
    /// Serializes index read-modify-write across queue threads.
    store_guard: Mutex<()>,
    idle_tx: Sender<String>,
    idle_rx: Receiver<String>,
}

/// Drives all named queues.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistentStore>,
        registry: Arc<RwLock<SerializerRegistry>>,
        reconciler: Arc<Reconciler>,
        config: Config,
    ) -> Self {
        let (idle_tx, idle_rx) = unbounded();
        Scheduler {
            shared: Arc::new(SchedulerShared {
                transport,
                store,
                registry,
                reconciler,
                config,
                queues: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                store_guard: Mutex::new(()),
                idle_tx,
                idle_rx,
            }),
        }
    }

    /// Append an item to its named queue, persisting durable items first.
    /// Persistence failures are split by transience: retryable ones
    /// (storage I/O) degrade to warnings and the item continues in memory,
    /// permanent ones (a broken plugged serializer) propagate.
    pub fn enqueue(&self, item: Arc<QueueItem>) -> crate::Result<()> {
        item.emitter.emit_before_enqueue();
        let durable = item
            .request
            .lock()
            .map(|r| r.is_durable())
            .unwrap_or(false);
        if durable {
            if let Err(e) = self.persist_item(&item) {
                let error = crate::Error::from(e);
                if error.transience().is_retryable() {
                    warn!("durable enqueue not persisted, continuing in memory: {error}");
                } else {
                    return Err(error);
                }
            }
        }
        self.push_and_spawn(item.clone());
        item.emitter.emit_enqueued();
        Ok(())
    }

    /// Re-enqueue items reconstructed from storage. Already-live ids are
    /// skipped, which makes recovery idempotent; nothing is re-persisted.
    pub fn enqueue_recovered(&self, requests: Vec<QueuedRequest>) -> usize {
        let mut live: Vec<String> = {
            let queues = match self.shared.queues.lock() {
                Ok(q) => q,
                Err(_) => return 0,
            };
            queues
                .values()
                .flat_map(|state| state.items.iter().map(|item| item.id()))
                .collect()
        };
        // in-flight items left their queue but are just as live
        if let Ok(running) = self.shared.running.lock() {
            live.extend(running.keys().map(|(_, id)| id.clone()));
        }
        let mut recovered = 0;
        for request in requests {
            if live.iter().any(|id| *id == request.id) {
                continue;
            }
            self.push_and_spawn(QueueItem::new(request));
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "queued requests recovered from storage");
        }
        recovered
    }

    fn push_and_spawn(&self, item: Arc<QueueItem>) {
        let queue_name = item.queue();
        let spawn = {
            let mut queues = match self.shared.queues.lock() {
                Ok(q) => q,
                Err(_) => {
                    warn!("queue map lock poisoned, dropping item");
                    return;
                }
            };
            let state = queues.entry(queue_name.clone()).or_default();
            state.items.push_back(item);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };
        if spawn {
            let scheduler = self.clone();
            std::thread::spawn(move || scheduler.drain(queue_name));
        }
    }

    /// Abort a submission. A waiting item is struck from the queue (and
    /// store) and surfaces an abort error; the in-flight item only has its
    /// cancel token set, and the transport's eventual error flows through
    /// the normal failure path.
    pub fn abort(&self, queue: &str, id: &str) -> bool {
        let removed = {
            let mut queues = match self.shared.queues.lock() {
                Ok(q) => q,
                Err(_) => return false,
            };
            match queues.get_mut(queue) {
                Some(state) => {
                    let pos = state.items.iter().position(|item| item.id() == id);
                    match pos {
                        Some(pos) => state.items.remove(pos),
                        None => None,
                    }
                }
                None => None,
            }
        };
        match removed {
            Some(item) => {
                item.cancel.cancel();
                let (durable, queue_name) = match item.request.lock() {
                    Ok(mut request) => {
                        request.status = Status::Failed;
                        (request.is_durable(), request.queue.clone())
                    }
                    Err(_) => (false, queue.to_string()),
                };
                if durable {
                    self.remove_persisted(&queue_name, id);
                }
                self.shared.reconciler.discard_targets(id);
                let error = TransportError::aborted();
                item.emitter.emit_error(&error);
                item.emitter
                    .emit_complete(Status::Failed, &Outcome::Failure(error));
                true
            }
            // not waiting; if it is the in-flight item, cancel its token
            None => self.cancel_in_flight(queue, id),
        }
    }

    fn cancel_in_flight(&self, queue: &str, id: &str) -> bool {
        let running = match self.shared.running.lock() {
            Ok(r) => r,
            Err(_) => return false,
        };
        match running.get(&(queue.to_string(), id.to_string())) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn track_running(&self, queue: &str, id: &str, token: CancelToken) {
        if let Ok(mut running) = self.shared.running.lock() {
            running.insert((queue.to_string(), id.to_string()), token);
        }
    }

    fn untrack_running(&self, queue: &str, id: &str) {
        if let Ok(mut running) = self.shared.running.lock() {
            running.remove(&(queue.to_string(), id.to_string()));
        }
    }

    fn drain(self, queue_name: String) {
        debug!(queue = %queue_name, "queue drain started");
        loop {
            let item = {
                let mut queues = match self.shared.queues.lock() {
                    Ok(q) => q,
                    Err(_) => return,
                };
                let state = queues.entry(queue_name.clone()).or_default();
                match state.items.pop_front() {
                    Some(item) => item,
                    None => {
                        state.running = false;
                        drop(queues);
                        let _ = self.shared.idle_tx.send(queue_name.clone());
                        debug!(queue = %queue_name, "queue drained");
                        return;
                    }
                }
            };
            // tracked from the moment it leaves the queue, so recovery and
            // abort can still see it during the pre-request wait
            self.track_running(&queue_name, &item.id(), item.cancel.clone());
            let wait = self.request_wait(&queue_name);
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            self.run_item(&queue_name, &item);
            self.untrack_running(&queue_name, &item.id());
        }
    }

    fn request_wait(&self, queue: &str) -> Duration {
        let ms = self
            .shared
            .config
            .queue_wait_ms
            .get(queue)
            .copied()
            .unwrap_or(self.shared.config.request_wait_ms);
        Duration::from_millis(ms)
    }

    fn run_item(&self, queue_name: &str, item: &Arc<QueueItem>) {
        let id = item.id();
        loop {
            if item.cancel.is_cancelled() {
                self.finish_failure(item, TransportError::aborted(), Status::Failed);
                break;
            }
            let descriptor = {
                let Ok(mut request) = item.request.lock() else {
                    return;
                };
                request.status = Status::Active;
                plain_descriptor(&request.entity)
            };
            debug!(queue = %queue_name, id = %id, "executing queued request");
            let result = self.shared.transport.execute(&descriptor, &item.cancel);
            match result {
                Ok(response) => {
                    self.finish_success(item, response);
                    break;
                }
                Err(error) => {
                    let decision = {
                        let Ok(mut request) = item.request.lock() else {
                            return;
                        };
                        let matched = request.retry.match_rule.matches(&error);
                        let retryable =
                            matched && !item.cancel.is_cancelled() && !error.is_abort();
                        if retryable && request.retry_count < request.retry.max_retries {
                            request.retry_count += 1;
                            let delay = request.retry.backoff.delay_for(request.retry_count);
                            Ok((request.retry_count, delay, request.is_durable()))
                        } else if retryable {
                            Err(Status::Exhausted)
                        } else {
                            // non-retryable (or aborted): surfaced with zero
                            // further retries
                            Err(Status::Failed)
                        }
                    };
                    match decision {
                        Ok((retry_times, delay, durable)) => {
                            if durable {
                                if let Err(e) = self.persist_item(item) {
                                    warn!("retry count not persisted: {e}");
                                }
                            }
                            info!(
                                queue = %queue_name,
                                id = %id,
                                retry_times,
                                retry_delay_ms = delay.as_millis() as u64,
                                "request failed, retrying"
                            );
                            item.emitter.emit_retry(retry_times, delay);
                            std::thread::sleep(delay);
                        }
                        Err(terminal) => {
                            self.finish_failure(item, error, terminal);
                            break;
                        }
                    }
                }
            }
        }
    }

    fn finish_success(&self, item: &Arc<QueueItem>, response: Value) {
        let (id, queue, durable, vdata_ids, virtual_response) = {
            let Ok(mut request) = item.request.lock() else {
                return;
            };
            request.status = Status::Succeeded;
            (
                request.id.clone(),
                request.queue.clone(),
                request.is_durable(),
                request.vdata_ids.clone(),
                request.virtual_response.clone(),
            )
        };
        let resolutions = self.shared.reconciler.reconcile(
            &id,
            &vdata_ids,
            virtual_response.as_ref(),
            &response,
        );
        self.apply_resolutions(&resolutions, &id);
        if durable {
            self.remove_persisted(&queue, &id);
        }
        item.emitter.emit_success(&response);
        item.emitter
            .emit_complete(Status::Succeeded, &Outcome::Success(response));
    }

    fn finish_failure(&self, item: &Arc<QueueItem>, error: TransportError, terminal: Status) {
        let (id, queue, durable) = {
            let Ok(mut request) = item.request.lock() else {
                return;
            };
            request.status = terminal;
            (
                request.id.clone(),
                request.queue.clone(),
                request.is_durable(),
            )
        };
        // virtual values stay virtual forever on failure; targets are dropped
        self.shared.reconciler.discard_targets(&id);
        warn!(queue = %queue, id = %id, status = ?terminal, "queued request failed: {error}");
        item.emitter.emit_error(&error);
        if item.emitter.has_fallback() {
            item.emitter.emit_fallback(&error);
        }
        if durable {
            self.remove_persisted(&queue, &id);
        }
        item.emitter
            .emit_complete(terminal, &Outcome::Failure(error));
    }

    /// Rewrite every waiting request that still references a just-resolved
    /// placeholder, re-persisting durable ones in their original slot.
    fn apply_resolutions(&self, resolutions: &BTreeMap<VdataId, Value>, done_id: &str) {
        if resolutions.is_empty() {
            return;
        }
        let waiting: Vec<Arc<QueueItem>> = {
            let Ok(queues) = self.shared.queues.lock() else {
                return;
            };
            queues
                .values()
                .flat_map(|state| state.items.iter().cloned())
                .collect()
        };
        for item in waiting {
            let rewritten = {
                let Ok(mut request) = item.request.lock() else {
                    continue;
                };
                if request.id == done_id {
                    continue;
                }
                let hits = substitution_hits(&request.entity.body, resolutions)
                    + request
                        .entity
                        .params
                        .values()
                        .map(|v| substitution_hits(v, resolutions))
                        .sum::<usize>()
                    + substitution_hits(&request.handler_args, resolutions)
                    + request
                        .virtual_response
                        .as_ref()
                        .map(|v| substitution_hits(v, resolutions))
                        .unwrap_or(0);
                if hits == 0 {
                    continue;
                }
                request.entity.body =
                    substitute(std::mem::take(&mut request.entity.body), resolutions);
                let params = std::mem::take(&mut request.entity.params);
                request.entity.params = params
                    .into_iter()
                    .map(|(k, v)| (k, substitute(v, resolutions)))
                    .collect();
                request.handler_args =
                    substitute(std::mem::take(&mut request.handler_args), resolutions);
                request.virtual_response = request
                    .virtual_response
                    .take()
                    .map(|v| substitute(v, resolutions));
                debug!(id = %request.id, hits, "substituted resolved values into waiting request");
                request.is_durable()
            };
            if rewritten {
                if let Err(e) = self.replace_persisted(&item) {
                    warn!("waiting request not re-persisted: {e}");
                }
            }
        }
    }

    /// Execute an `Immediate` submission on the caller's thread: no
    /// queueing, no persistence, no ordering guarantee relative to queued
    /// items, and no retry machinery.
    pub fn run_immediate(&self, item: &Arc<QueueItem>) {
        let descriptor = {
            let Ok(mut request) = item.request.lock() else {
                return;
            };
            request.status = Status::Active;
            plain_descriptor(&request.entity)
        };
        match self.shared.transport.execute(&descriptor, &item.cancel) {
            Ok(response) => self.finish_success(item, response),
            Err(error) => self.finish_failure(item, error, Status::Failed),
        }
    }

    /// Snapshot of queue depths; used by embedders for introspection.
    pub fn depths(&self) -> BTreeMap<String, usize> {
        match self.shared.queues.lock() {
            Ok(queues) => queues
                .iter()
                .map(|(name, state)| (name.clone(), state.items.len()))
                .collect(),
            Err(_) => BTreeMap::new(),
        }
    }

    /// Block until every queue is idle or the timeout elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.all_idle())
    }

    /// Block until one named queue is idle or the timeout elapses.
    pub fn drain_queue(&self, queue: &str, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.queue_idle(queue))
    }

    /// Orderly teardown: waiting items are parked (dropped from memory
    /// without touching their persisted records, so durable ones come back
    /// on the next recovery), then the in-flight request of each queue is
    /// allowed to finish.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if let Ok(mut queues) = self.shared.queues.lock() {
            for state in queues.values_mut() {
                state.items.clear();
            }
        }
        self.wait_idle(timeout)
    }

    fn wait_until(&self, timeout: Duration, idle: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if idle(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return idle(self);
            }
            let _ = self
                .shared
                .idle_rx
                .recv_timeout((deadline - now).min(Duration::from_millis(20)));
        }
    }

    fn queue_idle(&self, queue: &str) -> bool {
        match self.shared.queues.lock() {
            Ok(queues) => queues
                .get(queue)
                .map(|state| !state.running && state.items.is_empty())
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    fn all_idle(&self) -> bool {
        match self.shared.queues.lock() {
            Ok(queues) => queues
                .values()
                .all(|state| !state.running && state.items.is_empty()),
            Err(_) => true,
        }
    }

    fn persist_item(&self, item: &Arc<QueueItem>) -> Result<(), QueueError> {
        let Ok(request) = item.request.lock() else {
            return Ok(());
        };
        let Ok(registry) = self.shared.registry.read() else {
            return Ok(());
        };
        let _guard = self.shared.store_guard.lock();
        record::persist(self.shared.store.as_ref(), &registry, &request)
    }

    fn replace_persisted(&self, item: &Arc<QueueItem>) -> Result<(), QueueError> {
        let Ok(request) = item.request.lock() else {
            return Ok(());
        };
        let Ok(registry) = self.shared.registry.read() else {
            return Ok(());
        };
        let _guard = self.shared.store_guard.lock();
        record::replace(
            self.shared.store.as_ref(),
            &registry,
            &request.queue,
            &request.id,
            &request,
        )
    }

    fn remove_persisted(&self, queue: &str, id: &str) {
        let _guard = self.shared.store_guard.lock();
        if let Err(e) = record::remove(self.shared.store.as_ref(), queue, id) {
            warn!(queue = %queue, id = %id, "record removal failed: {e}");
        }
    }
}

/// The transport sees plain data: placeholders still unresolved at send
/// time dehydrate to their best-effort snapshots.
fn plain_descriptor(entity: &RequestDescriptor) -> RequestDescriptor {
    RequestDescriptor {
        method: entity.method.clone(),
        url: entity.url.clone(),
        params: entity
            .params
            .iter()
            .map(|(k, v)| (k.clone(), dehydrate(v)))
            .collect(),
        body: dehydrate(&entity.body),
        cache_expire_ms: entity.cache_expire_ms,
    }
}
