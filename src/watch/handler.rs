use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::ObjectKey;
use crate::Resource;

/// Callbacks invoked by a watch stream for changes of its object.
///
/// Called sequentially from the stream's own task (or, for the replay of the
/// current object, from the task registering the handler). Implementations
/// must not block.
#[cfg_attr(test, automock)]
pub trait EventHandler<K: Resource>: Send + Sync + 'static {
    fn on_add(
        &self,
        obj: &K,
    );

    fn on_update(
        &self,
        old: &K,
        new: &K,
    );

    fn on_delete(
        &self,
        obj: &K,
    );
}

type AddFn<K> = Box<dyn Fn(&K) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) + Send + Sync>;
type DeleteFn<K> = Box<dyn Fn(&K) + Send + Sync>;

/// Closure-backed [`EventHandler`]; unset callbacks are no-ops.
pub struct HandlerFns<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<DeleteFn<K>>,
}

impl<K> Default for HandlerFns<K> {
    fn default() -> Self {
        Self {
            add: None,
            update: None,
            delete: None,
        }
    }
}

impl<K> HandlerFns<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_add(
        mut self,
        f: impl Fn(&K) + Send + Sync + 'static,
    ) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(
        mut self,
        f: impl Fn(&K, &K) + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(
        mut self,
        f: impl Fn(&K) + Send + Sync + 'static,
    ) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K> fmt::Debug for HandlerFns<K> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("HandlerFns")
            .field("add", &self.add.is_some())
            .field("update", &self.update.is_some())
            .field("delete", &self.delete.is_some())
            .finish()
    }
}

impl<K: Resource> EventHandler<K> for HandlerFns<K> {
    fn on_add(
        &self,
        obj: &K,
    ) {
        if let Some(f) = &self.add {
            f(obj);
        }
    }

    fn on_update(
        &self,
        old: &K,
        new: &K,
    ) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(
        &self,
        obj: &K,
    ) {
        if let Some(f) = &self.delete {
            f(obj);
        }
    }
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handler_id() -> u64 {
    NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Token binding a handler to the watch stream of one object key.
///
/// Handler ids are process-wide and never reused, so a registration that
/// outlived its stream can never match a handler of a newer stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerRegistration {
    key: ObjectKey,
    handler_id: u64,
    stream_id: u64,
    issuer: u64,
}

impl HandlerRegistration {
    pub(crate) fn new(
        key: ObjectKey,
        handler_id: u64,
        stream_id: u64,
        issuer: u64,
    ) -> Self {
        Self {
            key,
            handler_id,
            stream_id,
            issuer,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn handler_id(&self) -> u64 {
        self.handler_id
    }

    pub(crate) fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Id of the multiplexer that minted this registration (0 for standalone streams)
    pub(crate) fn issuer(&self) -> u64 {
        self.issuer
    }
}

/// Handlers of one stream keyed by registration id.
///
/// Ids grow monotonically, so iterating the map yields registration order.
pub(crate) struct HandlerRegistry<K> {
    handlers: BTreeMap<u64, Arc<dyn EventHandler<K>>>,
}

impl<K: Resource> HandlerRegistry<K> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(
        &mut self,
        id: u64,
        handler: Arc<dyn EventHandler<K>>,
    ) {
        self.handlers.insert(id, handler);
    }

    pub(crate) fn remove(
        &mut self,
        id: u64,
    ) -> bool {
        self.handlers.remove(&id).is_some()
    }

    pub(crate) fn contains(
        &self,
        id: u64,
    ) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Handlers in delivery order
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }
}
