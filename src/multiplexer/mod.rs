//! Keyed watch multiplexer.
//!
//! Maps each [`ObjectKey`] to one shared [`WatchStream`] plus a refcount.
//! The first subscription to a key creates and starts the stream, the last
//! unsubscription stops it and drops the entry. Streams are de-duplicated
//! strictly by object key: subscribers of the same `(namespace, name)`
//! always share one list/watch loop, whoever they are.
//!
//! # Locking
//!
//! A single map-wide mutex guards lookups, stream creation and refcount
//! changes. It is only held for bookkeeping, never across a store call or the
//! sync wait.


use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::metrics::LIVE_HANDLER_REGISTRATIONS;
use crate::Error;
use crate::EventHandler;
use crate::HandlerRegistration;
use crate::NotFoundError;
use crate::ObjectKey;
use crate::ObjectStore;
use crate::Resource;
use crate::Result;
use crate::ValidationError;
use crate::WatchConfig;
use crate::WatchStream;

static NEXT_MULTIPLEXER_ID: AtomicU64 = AtomicU64::new(1);

struct MonitoredItem<K: Resource> {
    stream: WatchStream<K>,
    /// Live registrations plus subscriptions still waiting for sync
    refcount: usize,
}

pub struct KeyedMultiplexer<K: Resource> {
    id: u64,
    store: Arc<dyn ObjectStore<K>>,
    config: WatchConfig,
    /// Parent of every stream's cancellation
    root: CancellationToken,
    monitors: Mutex<HashMap<ObjectKey, MonitoredItem<K>>>,
}

impl<K: Resource> KeyedMultiplexer<K> {
    pub fn new(
        store: Arc<dyn ObjectStore<K>>,
        config: WatchConfig,
        root: CancellationToken,
    ) -> Self {
        Self {
            id: NEXT_MULTIPLEXER_ID.fetch_add(1, Ordering::Relaxed),
            store,
            config,
            root,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes `handler` to the object `namespace/name`.
    ///
    /// A stream that was stopped or abandoned its retries is replaced by a
    /// fresh one; registrations of the old stream turn stale.
    ///
    /// Blocks until the key's stream has synced. Unless `sync_timeout_ms` is
    /// configured there is no deadline: against an unreachable store this
    /// returns only when `cancel` fires.
    pub async fn subscribe(
        &self,
        namespace: &str,
        name: &str,
        handler: Arc<dyn EventHandler<K>>,
        cancel: &CancellationToken,
    ) -> Result<HandlerRegistration> {
        if namespace.is_empty() {
            return Err(ValidationError::EmptyNamespace.into());
        }
        if name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let key = ObjectKey::new(namespace, name);

        // Check-and-create is one critical section, so concurrent subscribers
        // of the same key can never start two streams. The refcount is taken
        // here so a concurrent last unsubscribe cannot stop the stream under us.
        let stream = {
            let mut monitors = self.monitors.lock();
            let item = match monitors.entry(key.clone()) {
                Entry::Occupied(entry) if !is_dead(&entry.get().stream) => entry.into_mut(),
                Entry::Occupied(mut entry) => {
                    // Stopped or abandoned behind our back: registrations of the
                    // old stream become stale and unsubscribe as no-ops.
                    let stream = self.start_stream(&key)?;
                    let old = entry.insert(MonitoredItem { stream, refcount: 0 });
                    self.retire(&key, old);
                    entry.into_mut()
                }
                Entry::Vacant(entry) => {
                    let stream = self.start_stream(&key)?;
                    entry.insert(MonitoredItem { stream, refcount: 0 })
                }
            };
            item.refcount += 1;
            item.stream.clone()
        };

        let registered = match self.wait_for_sync(&stream, cancel).await {
            Ok(()) => stream.add_handler(handler).await,
            Err(e) => Err(e),
        };

        match registered {
            Ok(registration) => {
                LIVE_HANDLER_REGISTRATIONS.inc();
                info!(key = %key, handler_id = registration.handler_id(), "handler subscribed");
                Ok(registration)
            }
            Err(e) => {
                warn!(key = %key, "subscribe failed: {}", e);
                self.release(&key, &stream);
                Err(e)
            }
        }
    }

    /// Removes a registration, stopping the stream when it was the last one.
    ///
    /// A registration whose stream is already gone is accepted as a no-op. If
    /// the stream was stopped externally while still in the map, the refcount
    /// is given back all the same and the entry dropped at zero.
    pub fn unsubscribe(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<()> {
        self.check_issuer(registration)?;
        let key = registration.key();

        let mut monitors = self.monitors.lock();
        let item = match monitors.get_mut(key) {
            Some(item) if item.stream.id() == registration.stream_id() => item,
            _ => {
                warn!(key = %key, handler_id = registration.handler_id(), "watch stream already removed");
                return Ok(());
            }
        };

        if item.stream.is_stopped() {
            // Stopped externally: its handlers are already gone, only the
            // bookkeeping is left to undo.
            warn!(key = %key, handler_id = registration.handler_id(), "watch stream was stopped externally");
        } else {
            item.stream.remove_handler(registration)?;
        }
        item.refcount = item.refcount.saturating_sub(1);
        LIVE_HANDLER_REGISTRATIONS.dec();
        info!(key = %key, handler_id = registration.handler_id(), refcount = item.refcount, "handler unsubscribed");

        // Teardown happens under the same lock so a concurrent subscribe
        // can never pick up a half-stopped stream.
        if item.refcount == 0 {
            if let Some(item) = monitors.remove(key) {
                if !item.stream.stop() {
                    debug!(key = %key, "watch stream already stopped");
                }
                info!(key = %key, "watch stream removed");
            }
        }
        Ok(())
    }

    /// Current cached object for a live registration.
    ///
    /// Returns [`NotFoundError::Object`] when the object does not exist
    /// upstream, which callers can tell apart from a missing monitor.
    pub async fn get_current(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<K> {
        self.check_issuer(registration)?;
        let key = registration.key();

        let stream = {
            let monitors = self.monitors.lock();
            match monitors.get(key) {
                Some(item) if item.stream.id() == registration.stream_id() => item.stream.clone(),
                _ => return Err(NotFoundError::Monitor(key.clone()).into()),
            }
        };
        // halt() clears handlers, report the stop rather than a missing handler
        if stream.is_stopped() {
            return Err(Error::StreamStopped(key.clone()));
        }
        if !stream.is_registered(registration) {
            return Err(NotFoundError::Handler {
                key: key.clone(),
                handler_id: registration.handler_id(),
            }
            .into());
        }

        self.wait_for_sync(&stream, &self.root).await?;
        match stream.get_item()? {
            Some(obj) => Ok(obj),
            None => {
                debug!(key = %key, "object not present in cache");
                Err(NotFoundError::Object(key.clone()).into())
            }
        }
    }

    /// Stops every stream and forgets all keys.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.monitors.lock().drain().collect();
        for (key, item) in drained {
            item.stream.stop();
            LIVE_HANDLER_REGISTRATIONS.sub(item.refcount as i64);
            debug!(key = %key, "watch stream stopped on shutdown");
        }
        self.root.cancel();
        info!("keyed multiplexer shut down");
    }

    pub fn refcount(
        &self,
        key: &ObjectKey,
    ) -> usize {
        self.monitors.lock().get(key).map_or(0, |item| item.refcount)
    }

    pub fn active_streams(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn contains(
        &self,
        key: &ObjectKey,
    ) -> bool {
        self.monitors.lock().contains_key(key)
    }

    /// The shared stream of `key`, if one is running
    pub fn stream(
        &self,
        key: &ObjectKey,
    ) -> Option<WatchStream<K>> {
        self.monitors.lock().get(key).map(|item| item.stream.clone())
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    async fn wait_for_sync(
        &self,
        stream: &WatchStream<K>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.config.sync_timeout() {
            None => stream.wait_for_sync(cancel).await,
            Some(timeout) => tokio::time::timeout(timeout, stream.wait_for_sync(cancel))
                .await
                .map_err(|_| Error::SyncTimeout {
                    key: stream.key().clone(),
                    timeout,
                })?,
        }
    }

    fn start_stream(
        &self,
        key: &ObjectKey,
    ) -> Result<WatchStream<K>> {
        let stream = WatchStream::with_issuer(key.clone(), self.store.clone(), self.config.list_watch, self.id);
        stream.start(&self.root)?;
        info!(key = %key, "watch stream created");
        Ok(stream)
    }

    /// Stops a dead entry that was replaced in the map.
    fn retire(
        &self,
        key: &ObjectKey,
        item: MonitoredItem<K>,
    ) {
        item.stream.stop();
        LIVE_HANDLER_REGISTRATIONS.sub(item.refcount as i64);
        warn!(
            key = %key,
            stale_refcount = item.refcount,
            abandoned = item.stream.is_abandoned(),
            "replaced dead watch stream"
        );
    }

    /// Gives back a refcount taken by a subscribe that did not complete.
    fn release(
        &self,
        key: &ObjectKey,
        stream: &WatchStream<K>,
    ) {
        let mut monitors = self.monitors.lock();
        if let Some(item) = monitors.get_mut(key) {
            if item.stream.id() != stream.id() {
                return;
            }
            item.refcount = item.refcount.saturating_sub(1);
            if item.refcount == 0 {
                if let Some(item) = monitors.remove(key) {
                    item.stream.stop();
                    info!(key = %key, "watch stream removed after failed subscribe");
                }
            }
        }
    }

    fn check_issuer(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<()> {
        if registration.issuer() != self.id {
            return Err(ValidationError::ForeignRegistration {
                key: registration.key().clone(),
                handler_id: registration.handler_id(),
            }
            .into());
        }
        Ok(())
    }
}

/// A stream that will never deliver again and must not take new subscribers
fn is_dead<K: Resource>(stream: &WatchStream<K>) -> bool {
    stream.is_stopped() || stream.is_abandoned()
}

impl<K: Resource> Drop for KeyedMultiplexer<K> {
    fn drop(&mut self) {
        for item in self.monitors.get_mut().values() {
            item.stream.stop();
        }
    }
}
