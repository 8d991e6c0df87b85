//! # d-watch
//!
//! Lets a controller observe a large, changing set of individually named
//! remote objects without opening one watch per subscriber.
//!
//! ```text
//! controller ─► SubscriptionManager ─► KeyedMultiplexer ─► WatchStream ─► ObjectStore
//!                (owner → registration)  (key → stream, refcount)  (list/watch, cache)
//! ```
//!
//! Subscribers of the same [`ObjectKey`] share one reference-counted
//! [`WatchStream`], started on first subscription and stopped on the last
//! unsubscription. Change events flow back from the store through the
//! stream's single-object cache to every registered [`EventHandler`].
//!
//! Transient store failures are retried inside the stream with backoff and
//! never surface to callers. As a consequence `subscribe` and `get_current`
//! can block indefinitely against an unreachable store unless the caller
//! passes a cancellation token that fires, or `sync_timeout_ms` is set in
//! [`WatchConfig`].

mod config;
mod errors;
mod key;
mod manager;
mod multiplexer;
mod store;
mod watch;

pub mod metrics;
pub mod utils;

pub use config::*;
pub use errors::*;
pub use key::*;
pub use manager::*;
pub use multiplexer::*;
pub use store::*;
pub use utils::Backoff;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
