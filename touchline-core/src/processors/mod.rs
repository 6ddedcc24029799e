//! Background processors.
//!
//! - `MatchStateSynchronizer`: consumes provider state notifications, emits
//!   match events onto the bus
//! - `ServiceUpdatesProcessor`: consumes service updates, maintains unread
//!   counters and scout archive memberships
//!
//! Both are [`MessageHandler`](crate::bus::MessageHandler)s driven by a
//! [`QueueListener`](crate::bus::QueueListener).

pub mod match_sync;
pub mod service_updates;

pub use match_sync::{
    MatchStateSynchronizer, MatchStore, PgMatchStore, SyncError, SyncOutcome, Transition,
};
pub use service_updates::{ChatLookup, ServiceUpdatesProcessor, is_superseded};
