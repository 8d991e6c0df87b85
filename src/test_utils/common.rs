use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::BackoffPolicy;
use crate::MemoryStore;
use crate::ObjectKey;
use crate::ObjectStore;
use crate::Resource;
use crate::VersionedResource;
use crate::WatchConfig;

/// Minimal secret-like object used across the tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSecret {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl TestSecret {
    pub fn new(
        namespace: &str,
        name: &str,
    ) -> Self {
        let mut data = BTreeMap::new();
        data.insert("test".to_string(), vec![1, 2, 3, 4]);
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            resource_version: String::new(),
            data,
        }
    }

    pub fn with_data(
        mut self,
        key: &str,
        value: &[u8],
    ) -> Self {
        self.data.insert(key.to_string(), value.to_vec());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_resource(self)
    }
}

impl Resource for TestSecret {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

impl VersionedResource for TestSecret {
    fn set_resource_version(
        &mut self,
        version: String,
    ) {
        self.resource_version = version;
    }
}

pub fn fake_store() -> Arc<MemoryStore<TestSecret>> {
    Arc::new(MemoryStore::new())
}

pub fn as_store(store: &Arc<MemoryStore<TestSecret>>) -> Arc<dyn ObjectStore<TestSecret>> {
    store.clone()
}

/// Short delays so relist paths run quickly in tests
pub fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 1000,
        base_delay_ms: 5,
        max_delay_ms: 20,
    }
}

pub fn fast_config() -> WatchConfig {
    WatchConfig {
        sync_timeout_ms: 0,
        list_watch: fast_policy(),
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F>(check: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Polls an async `check` until it holds or two seconds pass.
pub async fn eventually_async<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check().await
}
