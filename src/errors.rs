//! Watch Multiplexer Error Hierarchy
//!
//! Validation and not-found errors propagate to the caller immediately and are
//! never retried. Transient store failures ([`StoreError`]) stay inside the
//! watch loop, which retries them with backoff.

use std::time::Duration;

use config::ConfigError;

use crate::ObjectKey;
use crate::OwnerKey;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or empty identifiers, foreign registrations
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No active monitor, unknown registration, or cache miss
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// Owner already holds a subscription
    #[error("Owner {0} is already registered")]
    AlreadyExists(OwnerKey),

    /// Operation attempted on a stopped watch stream
    #[error("Watch stream for {0} has been stopped")]
    StreamStopped(ObjectKey),

    /// Cached object does not belong to the watched key
    #[error("Cached object {found} does not match watched key {expected}")]
    TypeMismatch { expected: ObjectKey, found: ObjectKey },

    /// Bounded sync wait expired (only when `sync_timeout_ms` is configured)
    #[error("Timed out after {timeout:?} waiting for {key} to sync")]
    SyncTimeout { key: ObjectKey, timeout: Duration },

    /// Caller's cancellation fired while waiting for sync
    #[error("Cancelled while waiting for {0} to sync")]
    Cancelled(ObjectKey),

    /// Retry policy gave up on the list/watch loop
    #[error("Watch for {key} abandoned: {reason}")]
    WatchAbandoned { key: ObjectKey, reason: String },

    /// Remote store failure surfaced outside the watch loop
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration loading or validation failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Upstream object is gone (as opposed to a missing monitor or registration)
    pub fn is_object_deleted(&self) -> bool {
        matches!(self, Error::NotFound(NotFoundError::Object(_)))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Namespace cannot be empty")]
    EmptyNamespace,

    #[error("Name cannot be empty")]
    EmptyName,

    #[error("Owner name cannot be empty")]
    EmptyOwner,

    #[error("Registration {handler_id} for {key} was issued by another multiplexer")]
    ForeignRegistration { key: ObjectKey, handler_id: u64 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NotFoundError {
    /// The key has no running watch stream
    #[error("No active monitor for {0}")]
    Monitor(ObjectKey),

    /// The stream does not know the registration
    #[error("Handler {handler_id} is not registered for {key}")]
    Handler { key: ObjectKey, handler_id: u64 },

    /// The owner holds no subscription
    #[error("No subscription registered for owner {0}")]
    Owner(OwnerKey),

    /// The stream is synced but the object is absent upstream
    #[error("Object {0} not found")]
    Object(ObjectKey),
}

/// Failures reported by an [`crate::ObjectStore`] implementation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The requested resource version is no longer served; relist required
    #[error("Resource version {0} is too old")]
    Expired(String),

    /// Transient connectivity failure
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded the configured per-operation timeout
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}
