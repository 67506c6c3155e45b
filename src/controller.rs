//! Controller runtime
//!
//! A [`Controller`] turns store watch events into reconcile calls for one
//! object kind. Keys are deduplicated in a [`WorkQueue`]: a key is never
//! reconciled twice at the same time, and events that arrive while it is in
//! flight cause exactly one rerun afterwards. Deleted events carry the last
//! known object and are handed to [`Reconciler::cleanup`] until it succeeds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, OperatorConfig};
use crate::error::{ReconcileError, StoreError};
use crate::reconcile::{Action, Reconciler, SchemaReconciler, SchemaVersionReconciler};
use crate::registry::SchemaRegistryApi;
use crate::resource::{ObjectKey, Resource};
use crate::store::{EventType, ResourceStore, WatchEvent};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    timers: HashMap<ObjectKey, (u64, JoinHandle<()>)>,
    next_timer: u64,
}

/// Deduplicating queue of object keys with delayed requeues
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key now; a key already in flight is marked dirty instead
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue a key once `delay` has passed, replacing any earlier timer
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let mut state = self.lock();
        state.next_timer += 1;
        let id = state.next_timer;

        let queue = Arc::clone(self);
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = queue.lock();
                if matches!(state.timers.get(&timer_key), Some((current, _)) if *current == id) {
                    state.timers.remove(&timer_key);
                }
            }
            queue.add(timer_key);
        });

        if let Some((_, previous)) = state.timers.insert(key, (id, handle)) {
            previous.abort();
        }
    }

    /// Wait for the next key; the key counts as in flight until [`done`](Self::done)
    pub async fn next(&self) -> ObjectKey {
        loop {
            {
                let mut state = self.lock();
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release a key; it is queued again if it was touched meanwhile
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.in_flight.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Drop any scheduled requeue for a key
    pub fn forget(&self, key: &ObjectKey) {
        if let Some((_, timer)) = self.lock().timers.remove(key) {
            timer.abort();
        }
    }

    /// Nothing waiting and nothing running; scheduled requeues do not count
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        for (_, (_, timer)) in state.timers.drain() {
            timer.abort();
        }
    }
}

/// Control loop for one object kind
pub struct Controller<R, S> {
    reconciler: Arc<R>,
    store: Arc<S>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
    cleanups: AtomicUsize,
}

impl<R, S> Controller<R, S>
where
    R: Reconciler,
    S: ResourceStore,
{
    pub fn new(reconciler: R, store: Arc<S>, config: ControllerConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            store,
            queue: Arc::new(WorkQueue::new()),
            config,
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// No queued or running reconciles and no pending cleanups
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle() && self.cleanups.load(Ordering::SeqCst) == 0
    }

    /// Run until the token is cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let kind = <R::Object as Resource>::KIND;
        let mut events = self.store.watch();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_reconciles.max(1)));
        self.enqueue_all().await;
        info!(%kind, "controller started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event, &token),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%kind, skipped, "watch lagged, relisting");
                        self.enqueue_all().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!(%kind, "watch closed");
                        break;
                    }
                },
                key = self.queue.next() => self.spawn_reconcile(key, &semaphore, &token),
            }
        }

        self.queue.shutdown();
        info!(%kind, "controller stopped");
    }

    async fn enqueue_all(&self) {
        match self.store.list_all::<R::Object>().await {
            Ok(objects) => {
                for object in objects {
                    self.queue.add(object.key());
                }
            }
            Err(e) => error!(kind = <R::Object as Resource>::KIND, error = %e, "failed to list objects"),
        }
    }

    fn handle_event(self: &Arc<Self>, event: WatchEvent, token: &CancellationToken) {
        if !event.is_kind::<R::Object>() {
            return;
        }
        match event.event_type {
            EventType::Added | EventType::Modified => self.queue.add(event.key),
            EventType::Deleted => {
                self.queue.forget(&event.key);
                match event.decode::<R::Object>() {
                    Ok(tombstone) => self.spawn_cleanup(tombstone, token),
                    Err(e) => error!(key = %event.key, error = %e, "undecodable tombstone"),
                }
            }
        }
    }

    fn spawn_reconcile(self: &Arc<Self>, key: ObjectKey, semaphore: &Arc<Semaphore>, token: &CancellationToken) {
        let this = Arc::clone(self);
        let semaphore = Arc::clone(semaphore);
        let token = token.clone();

        tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => tokio::select! {
                    _ = token.cancelled() => Err(ReconcileError::Cancelled),
                    outcome = this.reconciler.reconcile(&key) => outcome,
                },
                Err(_) => Err(ReconcileError::Cancelled),
            };
            this.queue.done(&key);

            match outcome {
                Ok(Action::Done) => debug!(%key, "reconciled"),
                Ok(Action::RequeueAfter(delay)) => {
                    debug!(%key, ?delay, "reconciled, requeue scheduled");
                    this.queue.add_after(key, delay);
                }
                Err(ReconcileError::Cancelled) => debug!(%key, "reconcile abandoned on shutdown"),
                Err(ReconcileError::Store(StoreError::Conflict { .. })) => {
                    debug!(%key, "stale write, retrying from fresh state");
                    this.queue.add(key);
                }
                Err(e) => {
                    warn!(%key, error = %e, "reconcile failed");
                    this.queue.add_after(key, this.reconciler.error_backoff());
                }
            }
        });
    }

    fn spawn_cleanup(self: &Arc<Self>, tombstone: R::Object, token: &CancellationToken) {
        let this = Arc::clone(self);
        let token = token.clone();
        self.cleanups.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let key = tombstone.key();
            loop {
                let delay = tokio::select! {
                    _ = token.cancelled() => break,
                    outcome = this.reconciler.cleanup(&tombstone) => match outcome {
                        Ok(Action::Done) => break,
                        Ok(Action::RequeueAfter(delay)) => delay,
                        Err(e) => {
                            warn!(%key, error = %e, "cleanup failed, retrying");
                            this.reconciler.error_backoff()
                        }
                    },
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            this.cleanups.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Both control loops over one store and registry client
pub struct Manager<S: ResourceStore> {
    schemas: Arc<Controller<SchemaReconciler<S>, S>>,
    versions: Arc<Controller<SchemaVersionReconciler<S>, S>>,
}

impl<S: ResourceStore> Manager<S> {
    pub fn new(store: Arc<S>, registry: Arc<dyn SchemaRegistryApi>, config: OperatorConfig) -> Self {
        let schemas = SchemaReconciler::new(Arc::clone(&store), Arc::clone(&registry), config.clone());
        let versions = SchemaVersionReconciler::new(Arc::clone(&store), registry, config.clone());
        Self {
            schemas: Arc::new(Controller::new(schemas, Arc::clone(&store), config.controller.clone())),
            versions: Arc::new(Controller::new(versions, store, config.controller)),
        }
    }

    /// Run both controllers until the token is cancelled
    pub async fn run(&self, token: CancellationToken) {
        tokio::join!(
            Arc::clone(&self.schemas).run(token.clone()),
            Arc::clone(&self.versions).run(token),
        );
    }

    pub fn is_idle(&self) -> bool {
        self.schemas.is_idle() && self.versions.is_idle()
    }
}
