//! The submission facade.
//!
//! `SilentClient` is the per-process entry point: it owns the serializer
//! registry, the reconciler, and the scheduler, and hands out
//! `Submission` builders. Event callbacks are bound on the submission
//! *before* `send()`, so no lifecycle event can fire while the caller is
//! still wiring handlers.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::queue::events::Outcome;
use crate::queue::record::{self, QueuedRequest, RequestDescriptor};
use crate::queue::scheduler::{QueueItem, Scheduler};
use crate::queue::{Behavior, RetryPolicy, Status, Transport, TransportError};
use crate::reconcile::{ReconcileTarget, Reconciler, StateCell, StateHub, StateMatcher};
use crate::serializer::{SerializerRegistry, ValueSerializer};
use crate::storage::PersistentStore;
use crate::vdata::Value;

/// Options for one submission.
#[derive(Default)]
pub struct SubmitOptions {
    pub behavior: Option<Behavior>,
    /// Named queue; the config default when absent.
    pub queue: Option<String>,
    /// Retry policy; no retries (with the config's default backoff) when
    /// absent.
    pub retry: Option<RetryPolicy>,
    /// The speculative response shape, usually built with
    /// [`crate::vdata::virtualize`].
    pub virtual_response: Option<Value>,
    /// Original call arguments, may embed virtual placeholders.
    pub handler_args: Value,
}

pub struct SilentClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn PersistentStore>>,
    config: Config,
}

impl SilentClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the client. A missing store defaults to [`MemoryStore`];
    /// the transport is required.
    ///
    /// [`MemoryStore`]: crate::storage::MemoryStore
    pub fn build(self) -> crate::Result<SilentClient> {
        let transport = self
            .transport
            .ok_or_else(|| crate::Error::Config("transport is required".to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(crate::storage::MemoryStore::new()));
        Ok(SilentClient::new(transport, store, self.config))
    }
}

/// The silent submission queue client.
pub struct SilentClient {
    scheduler: Scheduler,
    registry: Arc<RwLock<SerializerRegistry>>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn PersistentStore>,
    config: Config,
}

impl SilentClient {
    pub fn builder() -> SilentClientBuilder {
        SilentClientBuilder {
            transport: None,
            store: None,
            config: Config::default(),
        }
    }

    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistentStore>,
        config: Config,
    ) -> Self {
        let registry = Arc::new(RwLock::new(SerializerRegistry::new()));
        let reconciler = Arc::new(Reconciler::new());
        let scheduler = Scheduler::new(
            transport,
            store.clone(),
            registry.clone(),
            reconciler.clone(),
            config.clone(),
        );
        SilentClient {
            scheduler,
            registry,
            reconciler,
            store,
            config,
        }
    }

    /// Register (or override) a value serializer by name.
    pub fn register_serializer(
        &self,
        name: impl Into<String>,
        serializer: Arc<dyn ValueSerializer>,
    ) {
        if let Ok(mut registry) = self.registry.write() {
            registry.register(name, serializer);
        }
    }

    /// Live state containers register here to become reconciliation
    /// targets.
    pub fn state_hub(&self) -> &StateHub {
        self.reconciler.hub()
    }

    pub fn register_state(&self, cell: &Arc<StateCell>) {
        self.reconciler.hub().register(cell);
    }

    /// Start building a submission. Nothing is enqueued until `send()`.
    pub fn submit(&self, entity: RequestDescriptor, options: SubmitOptions) -> Submission<'_> {
        let queue = options
            .queue
            .unwrap_or_else(|| self.config.default_queue.clone());
        let behavior = options.behavior.unwrap_or(Behavior::Queued);
        let retry = options.retry.unwrap_or_else(|| RetryPolicy {
            backoff: self.config.backoff.clone(),
            ..RetryPolicy::default()
        });
        let request = QueuedRequest::new(
            queue,
            behavior,
            entity,
            retry,
            options.handler_args,
            options.virtual_response,
        );
        Submission {
            client: self,
            item: QueueItem::new(request),
        }
    }

    /// Register an "update this state when I resolve" pair for an already
    /// submitted request.
    pub fn register_reconciliation_target(
        &self,
        handle: &Handle,
        matcher: StateMatcher,
        fields: Vec<String>,
        transform: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) {
        self.reconciler.register_target(
            &handle.id(),
            ReconcileTarget {
                matcher,
                fields,
                transform: Box::new(transform),
            },
        );
    }

    /// Rebuild queues from storage and resume execution. Idempotent:
    /// already-live ids are skipped.
    pub fn recover(&self) -> crate::Result<usize> {
        let registry = self
            .registry
            .read()
            .map_err(|_| crate::Error::Config("serializer registry lock poisoned".to_string()))?;
        let queues = record::load_queues(self.store.as_ref(), &registry)?;
        drop(registry);
        let mut recovered = 0;
        for (_, requests) in queues {
            recovered += self.scheduler.enqueue_recovered(requests);
        }
        Ok(recovered)
    }

    /// Block until every queue is idle or the timeout elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    /// Block until one named queue is idle or the timeout elapses.
    pub fn drain_queue(&self, queue: &str, timeout: Duration) -> bool {
        self.scheduler.drain_queue(queue, timeout)
    }

    /// Orderly teardown: park waiting items (durable ones come back on the
    /// next `recover`) and wait for in-flight requests to finish.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.scheduler.shutdown(timeout)
    }

    pub fn queue_depths(&self) -> std::collections::BTreeMap<String, usize> {
        self.scheduler.depths()
    }
}

/// A not-yet-sent submission: bind lifecycle callbacks and reconciliation
/// targets, then `send()`.
pub struct Submission<'c> {
    client: &'c SilentClient,
    item: Arc<QueueItem>,
}

impl<'c> Submission<'c> {
    pub fn id(&self) -> String {
        self.item.id()
    }

    /// The speculative response, with placeholder identities assigned.
    pub fn virtual_response(&self) -> Option<Value> {
        self.item
            .request
            .lock()
            .ok()
            .and_then(|r| r.virtual_response.clone())
    }

    pub fn on_before_enqueue(self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.item.emitter.on_before_enqueue(cb);
        self
    }

    pub fn on_enqueued(self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.item.emitter.on_enqueued(cb);
        self
    }

    pub fn on_success(self, cb: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.item.emitter.on_success(cb);
        self
    }

    pub fn on_error(self, cb: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.item.emitter.on_error(cb);
        self
    }

    pub fn on_retry(self, cb: impl Fn(u32, Duration) + Send + Sync + 'static) -> Self {
        self.item.emitter.on_retry(cb);
        self
    }

    /// Bind a fallback for exhausted durable items; without one the item
    /// is dropped after exhaustion and its virtual values stay virtual
    /// forever.
    pub fn on_fallback(self, cb: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.item.emitter.on_fallback(cb);
        self
    }

    pub fn on_complete(self, cb: impl Fn(Status, &Outcome) + Send + Sync + 'static) -> Self {
        self.item.emitter.on_complete(cb);
        self
    }

    /// Register a reconciliation target before the submission is live.
    pub fn reconcile_into(
        self,
        matcher: StateMatcher,
        fields: Vec<String>,
        transform: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.client.reconciler.register_target(
            &self.id(),
            ReconcileTarget {
                matcher,
                fields,
                transform: Box::new(transform),
            },
        );
        self
    }

    /// Dispatch: immediate submissions execute on this thread; queued and
    /// durable ones are appended to their named queue. Serialization
    /// failures (a broken plugged serializer) propagate; storage I/O
    /// failures degrade to warnings.
    pub fn send(self) -> crate::Result<Handle> {
        let behavior = self
            .item
            .request
            .lock()
            .map(|r| r.behavior)
            .unwrap_or(Behavior::Queued);
        match behavior {
            Behavior::Immediate => self.client.scheduler.run_immediate(&self.item),
            _ => self.client.scheduler.enqueue(self.item.clone())?,
        }
        Ok(Handle {
            item: self.item,
            scheduler: self.client.scheduler.clone(),
        })
    }
}

/// Live handle to a submitted request.
pub struct Handle {
    item: Arc<QueueItem>,
    scheduler: Scheduler,
}

impl Handle {
    pub fn id(&self) -> String {
        self.item.id()
    }

    pub fn queue(&self) -> String {
        self.item.queue()
    }

    pub fn status(&self) -> Status {
        self.item.status()
    }

    pub fn virtual_response(&self) -> Option<Value> {
        self.item
            .request
            .lock()
            .ok()
            .and_then(|r| r.virtual_response.clone())
    }

    /// Abort this submission. A waiting item is struck from its queue; an
    /// in-flight one has its cancel token set for the transport to
    /// observe.
    pub fn abort(&self) -> bool {
        self.scheduler.abort(&self.queue(), &self.id())
    }
}
