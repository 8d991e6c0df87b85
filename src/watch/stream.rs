use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::handler::next_handler_id;
use super::handler::HandlerRegistry;
use super::EventHandler;
use super::HandlerRegistration;
use crate::metrics::ACTIVE_WATCH_STREAMS;
use crate::metrics::DELIVERED_EVENTS;
use crate::metrics::WATCH_RESTARTS;
use crate::utils::async_task::call_with_timeout;
use crate::utils::async_task::spawn_task;
use crate::Backoff;
use crate::BackoffPolicy;
use crate::Error;
use crate::NotFoundError;
use crate::ObjectKey;
use crate::ObjectStore;
use crate::Resource;
use crate::Result;
use crate::StoreError;
use crate::WatchEvent;

/// Lifecycle of a [`WatchStream`].
///
/// `Created → Syncing → Synced → Stopped`. A failure while `Synced` relists
/// (`Synced → Syncing → Synced`). `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Syncing,
    Synced,
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            StreamState::Created => "created",
            StreamState::Syncing => "syncing",
            StreamState::Synced => "synced",
            StreamState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Single-slot cache of the watched object.
#[derive(Debug, Clone)]
struct CacheSlot<K> {
    item: Option<K>,
    /// Last resource version observed from list or watch
    resource_version: String,
    last_error: Option<String>,
}

impl<K> Default for CacheSlot<K> {
    fn default() -> Self {
        Self {
            item: None,
            resource_version: String::new(),
            last_error: None,
        }
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct StreamInner<K: Resource> {
    id: u64,
    issuer: u64,
    key: ObjectKey,
    store: Arc<dyn ObjectStore<K>>,
    policy: BackoffPolicy,

    state: Mutex<StreamState>,
    cache: ArcSwap<CacheSlot<K>>,
    handlers: Mutex<HandlerRegistry<K>>,
    /// Serializes cache mutation plus fan-out against replay-on-subscribe
    delivery: tokio::sync::Mutex<()>,

    /// Flipped to `true` exactly once, after the first successful list
    synced: watch::Sender<bool>,
    cancel: CancellationToken,
    abandoned: Mutex<Option<String>>,
}

/// One list-then-watch loop for exactly one object key, with a single-slot
/// cache and ordered fan-out to registered handlers.
///
/// Cheap to clone; clones share the same loop.
pub struct WatchStream<K: Resource> {
    inner: Arc<StreamInner<K>>,
}

impl<K: Resource> Clone for WatchStream<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Resource> fmt::Debug for WatchStream<K> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WatchStream")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}

impl<K: Resource> WatchStream<K> {
    pub fn new(
        key: ObjectKey,
        store: Arc<dyn ObjectStore<K>>,
        policy: BackoffPolicy,
    ) -> Self {
        Self::with_issuer(key, store, policy, 0)
    }

    pub(crate) fn with_issuer(
        key: ObjectKey,
        store: Arc<dyn ObjectStore<K>>,
        policy: BackoffPolicy,
        issuer: u64,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(StreamInner {
                id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
                issuer,
                key,
                store,
                policy,
                state: Mutex::new(StreamState::Created),
                cache: ArcSwap::from_pointee(CacheSlot::default()),
                handlers: Mutex::new(HandlerRegistry::new()),
                delivery: tokio::sync::Mutex::new(()),
                synced,
                cancel: CancellationToken::new(),
                abandoned: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &ObjectKey {
        &self.inner.key
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.lock()
    }

    /// Spawns the list/watch loop on its own task.
    ///
    /// The loop halts when [`WatchStream::stop`] is called or `parent` is
    /// cancelled. Starting an already running stream is a no-op.
    pub fn start(
        &self,
        parent: &CancellationToken,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                StreamState::Stopped => return Err(Error::StreamStopped(self.inner.key.clone())),
                StreamState::Syncing | StreamState::Synced => {
                    debug!(key = %self.inner.key, "watch stream already started");
                    return Ok(());
                }
                StreamState::Created => *state = StreamState::Syncing,
            }
        }
        ACTIVE_WATCH_STREAMS.inc();
        info!(key = %self.inner.key, stream_id = self.inner.id, "starting watch stream");

        let inner = self.inner.clone();
        let parent = parent.clone();
        spawn_task("watch_stream", async move {
            let token = inner.cancel.clone();
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                _ = parent.cancelled() => {
                    inner.halt();
                    Ok(())
                }
                r = inner.clone().run() => r,
            }
        });
        Ok(())
    }

    /// Stops the loop and releases handlers.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.halt();
        if stopped {
            info!(key = %self.inner.key, stream_id = self.inner.id, "watch stream stopped");
        }
        stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// True once a finite retry policy gave up; the loop is gone for good.
    pub fn is_abandoned(&self) -> bool {
        self.inner.abandoned.lock().is_some()
    }

    /// True once the first full read completed; never reverts.
    pub fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Resolves once the stream has synced.
    ///
    /// There is no built-in deadline: against an unreachable store this only
    /// returns when `cancel` fires or the stream stops.
    pub async fn wait_for_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut synced = self.inner.synced.subscribe();
        tokio::select! {
            biased;
            r = synced.wait_for(|s| *s) => r
                .map(|_| ())
                .map_err(|_| self.inner.termination_error()),
            _ = self.inner.cancel.cancelled() => Err(self.inner.termination_error()),
            _ = cancel.cancelled() => Err(Error::Cancelled(self.inner.key.clone())),
        }
    }

    /// Registers `handler` and replays the cached object to it as an add.
    pub async fn add_handler(
        &self,
        handler: Arc<dyn EventHandler<K>>,
    ) -> Result<HandlerRegistration> {
        if self.is_stopped() {
            return Err(Error::StreamStopped(self.inner.key.clone()));
        }

        let _delivery = self.inner.delivery.lock().await;
        // stop() may have won the race while we waited for the delivery lock
        if self.is_stopped() {
            return Err(Error::StreamStopped(self.inner.key.clone()));
        }

        let handler_id = next_handler_id();
        self.inner.handlers.lock().insert(handler_id, handler.clone());

        let slot = self.inner.cache.load_full();
        if let Some(obj) = &slot.item {
            trace!(key = %self.inner.key, handler_id, "replaying cached object to new handler");
            handler.on_add(obj);
            DELIVERED_EVENTS.with_label_values(&["replay"]).inc();
        }

        debug!(key = %self.inner.key, handler_id, "handler added");
        Ok(HandlerRegistration::new(
            self.inner.key.clone(),
            handler_id,
            self.inner.id,
            self.inner.issuer,
        ))
    }

    /// Unregisters a handler. A delivery already in flight may still reach it.
    pub fn remove_handler(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<()> {
        let unknown = || {
            Error::NotFound(NotFoundError::Handler {
                key: registration.key().clone(),
                handler_id: registration.handler_id(),
            })
        };
        if registration.stream_id() != self.inner.id || registration.key() != &self.inner.key {
            return Err(unknown());
        }
        if !self.inner.handlers.lock().remove(registration.handler_id()) {
            return Err(unknown());
        }

        debug!(key = %self.inner.key, handler_id = registration.handler_id(), "handler removed");
        Ok(())
    }

    pub fn is_registered(
        &self,
        registration: &HandlerRegistration,
    ) -> bool {
        registration.stream_id() == self.inner.id
            && self.inner.handlers.lock().contains(registration.handler_id())
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Returns the cached object, `None` when it does not exist upstream.
    pub fn get_item(&self) -> Result<Option<K>> {
        if self.is_stopped() {
            return Err(Error::StreamStopped(self.inner.key.clone()));
        }
        if let Some(reason) = self.inner.abandoned.lock().clone() {
            return Err(Error::WatchAbandoned {
                key: self.inner.key.clone(),
                reason,
            });
        }

        let slot = self.inner.cache.load();
        match &slot.item {
            Some(obj) if !self.inner.key.matches(obj) => Err(Error::TypeMismatch {
                expected: self.inner.key.clone(),
                found: ObjectKey::from_resource(obj),
            }),
            item => Ok(item.clone()),
        }
    }

    /// Resource version of the last list or event applied to the cache
    pub fn last_resource_version(&self) -> String {
        self.inner.cache.load().resource_version.clone()
    }

    /// Most recent list/watch failure, cleared by the next successful list
    pub fn last_error(&self) -> Option<String> {
        self.inner.cache.load().last_error.clone()
    }
}

impl<K: Resource> StreamInner<K> {
    fn is_stopped(&self) -> bool {
        *self.state.lock() == StreamState::Stopped
    }

    /// Moves to `Stopped`; returns `false` if already there.
    fn halt(&self) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if *state == StreamState::Stopped {
                return false;
            }
            std::mem::replace(&mut *state, StreamState::Stopped)
        };
        self.cancel.cancel();
        self.handlers.lock().clear();
        if previous != StreamState::Created {
            ACTIVE_WATCH_STREAMS.dec();
        }
        true
    }

    /// Only legal moves between the running states; `Stopped` is sticky.
    fn transition(
        &self,
        to: StreamState,
    ) {
        let mut state = self.state.lock();
        if *state != StreamState::Stopped && *state != to {
            trace!(key = %self.key, from = %*state, to = %to, "watch stream state change");
            *state = to;
        }
    }

    fn termination_error(&self) -> Error {
        match self.abandoned.lock().clone() {
            Some(reason) => Error::WatchAbandoned {
                key: self.key.clone(),
                reason,
            },
            None => Error::StreamStopped(self.key.clone()),
        }
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut backoff = Backoff::new(self.policy);
        loop {
            self.transition(StreamState::Syncing);
            match self.list_and_watch(&mut backoff).await {
                Ok(()) => {
                    debug!(key = %self.key, "watch connection closed, relisting");
                    WATCH_RESTARTS.with_label_values(&["disconnected"]).inc();
                }
                Err(StoreError::Expired(rv)) => {
                    info!(key = %self.key, resource_version = %rv, "resource version expired, relisting");
                    WATCH_RESTARTS.with_label_values(&["expired"]).inc();
                }
                Err(e) => {
                    warn!(key = %self.key, attempt = backoff.attempts() + 1, "list/watch failed: {}", e);
                    WATCH_RESTARTS.with_label_values(&["error"]).inc();
                    self.record_error(&e);
                }
            }

            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    let reason = self
                        .cache
                        .load()
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "retries exhausted".to_string());
                    error!(key = %self.key, attempts = backoff.attempts(), "giving up on watch: {}", reason);
                    *self.abandoned.lock() = Some(reason.clone());
                    self.cancel.cancel();
                    return Err(Error::WatchAbandoned {
                        key: self.key.clone(),
                        reason,
                    });
                }
            }
        }
    }

    /// One cycle: full read, then consume the watch until it ends.
    async fn list_and_watch(
        &self,
        backoff: &mut Backoff,
    ) -> std::result::Result<(), StoreError> {
        let selector = self.key.selector();
        let timeout = self.policy.timeout();

        let list = call_with_timeout(timeout, self.store.list(&selector)).await?;
        self.replace(list.items, list.resource_version.clone()).await;
        backoff.reset();

        let mut events = call_with_timeout(timeout, self.store.watch(&selector, &list.resource_version)).await?;
        debug!(key = %self.key, resource_version = %list.resource_version, "watch established");

        while let Some(event) = events.next().await {
            self.apply(event?).await;
        }
        Ok(())
    }

    /// Reconciles the cache with a full read and marks the stream synced.
    async fn replace(
        &self,
        items: Vec<K>,
        resource_version: String,
    ) {
        let mut matched = None;
        for obj in items {
            if self.key.matches(&obj) {
                matched = Some(obj);
            } else {
                warn!(key = %self.key, found = %ObjectKey::from_resource(&obj), "list returned a foreign object, ignoring");
            }
        }

        let _delivery = self.delivery.lock().await;
        if self.is_stopped() {
            return;
        }

        let old = self.cache.load().item.clone();
        self.cache.store(Arc::new(CacheSlot {
            item: matched.clone(),
            resource_version,
            last_error: None,
        }));
        self.transition(StreamState::Synced);
        if !*self.synced.borrow() {
            info!(key = %self.key, exists = matched.is_some(), "watch stream synced");
            self.synced.send_replace(true);
        }

        match (old, matched) {
            (None, Some(new)) => self.deliver_add(&new),
            (Some(old), None) => self.deliver_delete(&old),
            (Some(old), Some(new)) if old.resource_version() != new.resource_version() => {
                self.deliver_update(&old, &new)
            }
            _ => {}
        }
    }

    /// Applies one watch event to the cache and fans it out.
    async fn apply(
        &self,
        event: WatchEvent<K>,
    ) {
        if !self.key.matches(event.object()) {
            warn!(
                key = %self.key,
                found = %ObjectKey::from_resource(event.object()),
                "watch delivered a foreign object, ignoring"
            );
            return;
        }

        let _delivery = self.delivery.lock().await;
        if self.is_stopped() {
            return;
        }

        let slot = self.cache.load_full();
        let resource_version = event.object().resource_version().to_string();
        trace!(key = %self.key, kind = event.kind(), resource_version = %resource_version, "applying watch event");

        match event {
            WatchEvent::Added(new) | WatchEvent::Modified(new) => {
                self.cache.store(Arc::new(CacheSlot {
                    item: Some(new.clone()),
                    resource_version,
                    last_error: slot.last_error.clone(),
                }));
                match &slot.item {
                    Some(old) => self.deliver_update(old, &new),
                    None => self.deliver_add(&new),
                }
            }
            WatchEvent::Deleted(last) => {
                self.cache.store(Arc::new(CacheSlot {
                    item: None,
                    resource_version,
                    last_error: slot.last_error.clone(),
                }));
                if slot.item.is_some() {
                    self.deliver_delete(&last);
                } else {
                    debug!(key = %self.key, "delete for an object not in cache");
                }
            }
        }
    }

    fn record_error(
        &self,
        e: &StoreError,
    ) {
        let slot = self.cache.load_full();
        self.cache.store(Arc::new(CacheSlot {
            item: slot.item.clone(),
            resource_version: slot.resource_version.clone(),
            last_error: Some(e.to_string()),
        }));
    }

    fn deliver_add(
        &self,
        obj: &K,
    ) {
        let handlers = self.handlers.lock().snapshot();
        for handler in handlers {
            handler.on_add(obj);
            DELIVERED_EVENTS.with_label_values(&["add"]).inc();
        }
    }

    fn deliver_update(
        &self,
        old: &K,
        new: &K,
    ) {
        let handlers = self.handlers.lock().snapshot();
        for handler in handlers {
            handler.on_update(old, new);
            DELIVERED_EVENTS.with_label_values(&["update"]).inc();
        }
    }

    fn deliver_delete(
        &self,
        obj: &K,
    ) {
        let handlers = self.handlers.lock().snapshot();
        for handler in handlers {
            handler.on_delete(obj);
            DELIVERED_EVENTS.with_label_values(&["delete"]).inc();
        }
    }
}
