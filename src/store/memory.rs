use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use tracing::trace;

use super::ObjectList;
use super::ObjectStore;
use super::Resource;
use super::WatchEvent;
use super::WatchEventStream;
use crate::FieldSelector;
use crate::ObjectKey;
use crate::StoreError;

/// Objects the in-memory store can stamp with a new resource version.
pub trait VersionedResource: Resource {
    fn set_resource_version(
        &mut self,
        version: String,
    );
}

type EventSender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>, StoreError>>;

struct Watcher<K> {
    selector: FieldSelector,
    sender: EventSender<K>,
}

struct MemoryInner<K> {
    objects: BTreeMap<ObjectKey, K>,
    /// Last assigned revision (monotonically increasing)
    revision: u64,
    /// Change log replayed to watchers resuming from an older revision
    history: VecDeque<(u64, WatchEvent<K>)>,
    /// Oldest entries are compacted away beyond this many
    history_limit: usize,
    /// Revisions at or below this are no longer in `history`
    compacted: u64,
    watchers: Vec<Watcher<K>>,
    failing_lists: usize,
    failing_watches: usize,
}

/// Change log entries kept by [`MemoryStore::new`]
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// In-process [`ObjectStore`] with list/watch semantics and fault injection.
///
/// Every mutation bumps a store-wide revision, stamps it on the object,
/// appends it to a change log and broadcasts it to matching watchers.
pub struct MemoryStore<K> {
    inner: Mutex<MemoryInner<K>>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl<K: VersionedResource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: VersionedResource> MemoryStore<K> {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Store whose change log keeps at most `limit` entries. Watchers resuming
    /// from a revision that fell out of the log get [`StoreError::Expired`].
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                objects: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                history_limit: limit.max(1),
                compacted: 0,
                watchers: Vec::new(),
                failing_lists: 0,
                failing_watches: 0,
            }),
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
        }
    }

    /// Creates or replaces the object, emitting `Added` or `Modified`.
    pub fn apply(
        &self,
        mut obj: K,
    ) -> K {
        let mut inner = self.inner.lock();
        inner.revision += 1;
        obj.set_resource_version(inner.revision.to_string());

        let key = ObjectKey::from_resource(&obj);
        let event = match inner.objects.insert(key, obj.clone()) {
            Some(_) => WatchEvent::Modified(obj.clone()),
            None => WatchEvent::Added(obj.clone()),
        };
        Self::publish(&mut inner, event);
        obj
    }

    /// Removes the object, emitting `Deleted`. Returns the removed object.
    pub fn delete(
        &self,
        key: &ObjectKey,
    ) -> Option<K> {
        let mut inner = self.inner.lock();
        let mut obj = inner.objects.remove(key)?;
        inner.revision += 1;
        obj.set_resource_version(inner.revision.to_string());
        Self::publish(&mut inner, WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    pub fn get(
        &self,
        key: &ObjectKey,
    ) -> Option<K> {
        self.inner.lock().objects.get(key).cloned()
    }

    pub fn current_revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Number of `list` calls served so far, including injected failures
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Open watch connections
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| !w.sender.is_closed());
        inner.watchers.len()
    }

    /// The next `n` list calls fail with [`StoreError::Unavailable`]
    pub fn fail_next_lists(
        &self,
        n: usize,
    ) {
        self.inner.lock().failing_lists = n;
    }

    /// The next `n` watch calls fail with [`StoreError::Unavailable`]
    pub fn fail_next_watches(
        &self,
        n: usize,
    ) {
        self.inner.lock().failing_watches = n;
    }

    /// Drops every open watch connection; their streams end.
    pub fn disconnect_watchers(&self) {
        let dropped = std::mem::take(&mut self.inner.lock().watchers);
        debug!(watchers = dropped.len(), "memory store disconnected watchers");
    }

    /// Discards the change log and tells open watchers their version expired.
    pub fn compact(&self) {
        let mut inner = self.inner.lock();
        inner.compacted = inner.revision;
        inner.history.clear();
        let revision = inner.revision.to_string();
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.sender.send(Err(StoreError::Expired(revision.clone())));
        }
    }

    fn publish(
        inner: &mut MemoryInner<K>,
        event: WatchEvent<K>,
    ) {
        let revision = inner.revision;
        inner.watchers.retain(|w| {
            if !w.selector.matches(event.object()) {
                return !w.sender.is_closed();
            }
            w.sender.send(Ok(event.clone())).is_ok()
        });
        trace!(revision, kind = event.kind(), "memory store published event");
        inner.history.push_back((revision, event));
        while inner.history.len() > inner.history_limit {
            if let Some((dropped, _)) = inner.history.pop_front() {
                inner.compacted = dropped;
            }
        }
    }
}

#[async_trait]
impl<K: VersionedResource> ObjectStore<K> for MemoryStore<K> {
    async fn list(
        &self,
        selector: &FieldSelector,
    ) -> Result<ObjectList<K>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if inner.failing_lists > 0 {
            inner.failing_lists -= 1;
            return Err(StoreError::Unavailable("injected list failure".to_string()));
        }

        let items = inner.objects.values().filter(|obj| selector.matches(*obj)).cloned().collect();
        Ok(ObjectList {
            items,
            resource_version: inner.revision.to_string(),
        })
    }

    async fn watch(
        &self,
        selector: &FieldSelector,
        resource_version: &str,
    ) -> Result<WatchEventStream<K>, StoreError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if inner.failing_watches > 0 {
            inner.failing_watches -= 1;
            return Err(StoreError::Unavailable("injected watch failure".to_string()));
        }

        let from = match resource_version {
            "" => inner.revision,
            rv => rv.parse::<u64>().map_err(|_| StoreError::Expired(rv.to_string()))?,
        };
        if from < inner.compacted {
            return Err(StoreError::Expired(resource_version.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for (revision, event) in inner.history.iter() {
            if *revision > from && selector.matches(event.object()) {
                let _ = sender.send(Ok(event.clone()));
            }
        }
        inner.watchers.push(Watcher {
            selector: selector.clone(),
            sender,
        });

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}
