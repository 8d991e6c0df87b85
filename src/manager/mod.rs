//! Owner-level subscriptions on top of the [`KeyedMultiplexer`].
//!
//! Each owner (e.g. a parent resource referencing an object by name) holds at
//! most one subscription. The target object lives in the owner's namespace.
//! Owner keys and object keys are separate key spaces: many owners referencing
//! the same object share the object's single watch stream.

#[cfg(test)]
mod manager_test;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Error;
use crate::EventHandler;
use crate::HandlerFns;
use crate::HandlerRegistration;
use crate::KeyedMultiplexer;
use crate::NotFoundError;
use crate::ObjectKey;
use crate::OwnerKey;
use crate::Resource;
use crate::Result;
use crate::ValidationError;

pub struct SubscriptionManager<K: Resource> {
    multiplexer: Arc<KeyedMultiplexer<K>>,
    /// Handler attached to every new subscription
    handler: Arc<dyn EventHandler<K>>,
    /// Serializes all operations. Only ever calls into the multiplexer, never
    /// the reverse, so the two locks cannot form a cycle.
    registered: Mutex<HashMap<OwnerKey, HandlerRegistration>>,
}

impl<K: Resource> SubscriptionManager<K> {
    /// Manager whose subscriptions use a no-op handler
    pub fn new(multiplexer: Arc<KeyedMultiplexer<K>>) -> Self {
        Self {
            multiplexer,
            handler: Arc::new(HandlerFns::<K>::new()),
            registered: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the handler used by subsequent registrations.
    pub fn with_handler(
        mut self,
        handler: Arc<dyn EventHandler<K>>,
    ) -> Self {
        self.handler = handler;
        self
    }

    pub fn multiplexer(&self) -> &Arc<KeyedMultiplexer<K>> {
        &self.multiplexer
    }

    /// Subscribes `owner` to the object `target_name` in the owner's namespace.
    ///
    /// Fails with [`Error::AlreadyExists`] if the owner already holds a
    /// subscription; the existing one is left untouched.
    ///
    /// Waits for the target's stream to sync while holding the manager lock,
    /// so every other `register`, `unregister` and `get_current` call waits
    /// too. Against an unreachable target that wait is unbounded unless
    /// `cancel` fires or `sync_timeout_ms` is configured on the multiplexer.
    pub async fn register(
        &self,
        owner: OwnerKey,
        target_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        validate_owner(&owner)?;

        let mut registered = self.registered.lock().await;
        if registered.contains_key(&owner) {
            return Err(Error::AlreadyExists(owner));
        }

        let target = owner.target(target_name);
        let registration = self
            .multiplexer
            .subscribe(&target.namespace, &target.name, self.handler.clone(), cancel)
            .await?;
        info!(owner = %owner, target = %registration.key(), "owner registered");
        registered.insert(owner, registration);
        Ok(())
    }

    pub async fn unregister(
        &self,
        owner: &OwnerKey,
    ) -> Result<()> {
        let mut registered = self.registered.lock().await;
        let registration = registered
            .get(owner)
            .ok_or_else(|| Error::NotFound(NotFoundError::Owner(owner.clone())))?;

        self.multiplexer.unsubscribe(registration)?;
        registered.remove(owner);
        info!(owner = %owner, "owner unregistered");
        Ok(())
    }

    /// Current object referenced by `owner`.
    pub async fn get_current(
        &self,
        owner: &OwnerKey,
    ) -> Result<K> {
        let registration = self
            .registered
            .lock()
            .await
            .get(owner)
            .cloned()
            .ok_or_else(|| Error::NotFound(NotFoundError::Owner(owner.clone())))?;

        self.multiplexer.get_current(&registration).await
    }

    pub async fn is_registered(
        &self,
        owner: &OwnerKey,
    ) -> bool {
        self.registered.lock().await.contains_key(owner)
    }

    /// Object key the owner is subscribed to
    pub async fn registered_target(
        &self,
        owner: &OwnerKey,
    ) -> Option<ObjectKey> {
        self.registered.lock().await.get(owner).map(|r| r.key().clone())
    }

    pub async fn len(&self) -> usize {
        self.registered.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registered.lock().await.is_empty()
    }
}

fn validate_owner(owner: &OwnerKey) -> Result<()> {
    if owner.namespace.is_empty() {
        return Err(ValidationError::EmptyNamespace.into());
    }
    if owner.name.is_empty() {
        return Err(ValidationError::EmptyOwner.into());
    }
    Ok(())
}
