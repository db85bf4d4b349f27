//! Broadcast bus for store and controller notifications
//!
//! Subscribers receive every event published after they subscribe. Publishing
//! never blocks; slow subscribers observe `RecvError::Lagged` instead of
//! stalling the store.
//!
//! ```rust
//! use parley_conversation::bus::{EventBus, StoreEvent};
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new();
//! let mut subscriber = bus.subscribe();
//!
//! bus.publish(StoreEvent::SessionCreated {
//!     session_id: "s1".to_string(),
//! });
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.session_id(), Some("s1"));
//! # });
//! ```

pub mod events;

pub use events::{ErrorSurface, StoreEvent};

use tokio::sync::broadcast;

/// Channel capacity for broadcast events
const CHANNEL_CAPACITY: usize = 1024;

/// Cloneable handle to one broadcast channel
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers
    pub fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
