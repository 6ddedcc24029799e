//! In-process event queues.
//!
//! Cross-service events travel over the [message bus](crate::bus); the
//! queues here connect components inside one process, each drained by a
//! single dedicated task.

pub mod channels;

pub use channels::{
    CounterUpdateReceiver, CounterUpdateSender, DEFAULT_CHANNEL_BUFFER, counter_update_channel,
    default_counter_update_channel,
};
