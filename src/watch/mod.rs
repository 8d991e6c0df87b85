//! Per-object watch engine.
//!
//! A [`WatchStream`] owns one list-then-watch loop for exactly one
//! [`crate::ObjectKey`]:
//!
//! ```text
//!   ObjectStore::list ──► replace() ──► cache slot ──► handlers (registration order)
//!          ▲                                ▲
//!          │ relist (backoff)               │
//!   ObjectStore::watch ─► apply() ──────────┘
//! ```
//!
//! - The initial list seeds the single-slot cache and fires the one-shot
//!   sync signal; `has_synced()` never reverts afterwards.
//! - A dropped or expired watch relists and re-subscribes with backoff.
//!   Handlers and the last known object survive the recovery.
//! - A handler added after sync is immediately replayed the cached object
//!   as an add.

mod handler;
mod stream;


pub use handler::EventHandler;
pub use handler::HandlerFns;
pub use handler::HandlerRegistration;
#[cfg(test)]
pub use handler::MockEventHandler;
pub use stream::StreamState;
pub use stream::WatchStream;
