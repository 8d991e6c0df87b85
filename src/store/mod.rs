//! Remote object store contract consumed by the watch streams.
//!
//! A [`crate::WatchStream`] is written purely against [`ObjectStore`]:
//! `list` seeds the cache and yields a resource version, `watch` resumes
//! from that version and yields change events until it disconnects.

mod memory;
pub use memory::*;


use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use crate::FieldSelector;
use crate::StoreError;

/// An object that can be watched: identified by namespace and name, versioned
/// by an opaque resource version.
pub trait Resource: Clone + Debug + Send + Sync + 'static {
    fn namespace(&self) -> &str;

    fn name(&self) -> &str;

    /// Opaque version; changes whenever the object changes upstream
    fn resource_version(&self) -> &str;
}

/// Result of a full read.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    /// Version to resume watching from
    pub resource_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
        }
    }
}

pub type WatchEventStream<K> = BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<K: Resource>: Send + Sync + 'static {
    async fn list(
        &self,
        selector: &FieldSelector,
    ) -> Result<ObjectList<K>, StoreError>;

    /// Opens a change stream starting after `resource_version`.
    ///
    /// The stream ending (or yielding an error) means the connection is gone.
    async fn watch(
        &self,
        selector: &FieldSelector,
        resource_version: &str,
    ) -> Result<WatchEventStream<K>, StoreError>;
}
