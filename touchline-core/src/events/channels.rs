//! Channel factories for in-process queues.
//!
//! Every queue is bounded: a full queue makes the producer wait, which is
//! the backpressure towards whoever produces faster than the consumer task
//! drains.

use tokio::sync::mpsc;
use touchline_sdk::objects::proto::UnreadCountersUpdate;

/// Default buffer size for event channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Sender handle for unread counter updates headed for pub/sub.
pub type CounterUpdateSender = mpsc::Sender<UnreadCountersUpdate>;
/// Receiver handle drained by the counter publisher task.
pub type CounterUpdateReceiver = mpsc::Receiver<UnreadCountersUpdate>;

/// Create the queue between [`UnreadCounters`](crate::counters::UnreadCounters)
/// and its publisher task.
pub fn counter_update_channel(capacity: usize) -> (CounterUpdateSender, CounterUpdateReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Counter update channel with [`DEFAULT_CHANNEL_BUFFER`] slots.
pub fn default_counter_update_channel() -> (CounterUpdateSender, CounterUpdateReceiver) {
    counter_update_channel(DEFAULT_CHANNEL_BUFFER)
}
