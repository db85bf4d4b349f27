//! Minimum display duration for transient chat states
//!
//! A tool indicator that appears and disappears within a few milliseconds
//! flickers. [`DisplayHold`] remembers when such a state was entered; leaving
//! it early is deferred with [`defer_transition`], which sleeps for the
//! remainder and then moves the state only if nothing else moved it first.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::models::ChatState;
use crate::store::SessionStore;

/// Tracks how long a transient state has been visible
#[derive(Debug, Clone)]
pub struct DisplayHold {
    minimum: Duration,
    entered: Option<Instant>,
}

impl DisplayHold {
    pub fn new(minimum: Duration) -> Self {
        Self {
            minimum,
            entered: None,
        }
    }

    /// Start the hold. Re-entering while held keeps the original start.
    pub fn enter(&mut self) {
        if self.entered.is_none() {
            self.entered = Some(Instant::now());
        }
    }

    pub fn is_held(&self) -> bool {
        self.entered.is_some()
    }

    /// Time still owed before the state may be left
    pub fn remaining(&self) -> Option<Duration> {
        let entered = self.entered?;
        let remaining = self.minimum.checked_sub(entered.elapsed())?;
        (!remaining.is_zero()).then_some(remaining)
    }

    /// End the hold and return the time still owed, if any
    pub fn release(&mut self) -> Option<Duration> {
        let remaining = self.remaining();
        self.entered = None;
        remaining
    }
}

/// After `delay`, move `session_id` from `from` to `to`, provided `turn`
/// still owns the session and it is still in `from`
pub fn defer_transition(
    store: SessionStore,
    session_id: String,
    turn: u64,
    from: ChatState,
    to: ChatState,
    delay: Duration,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let moved = store.compare_and_set_chat_state(&session_id, turn, from, to);
        debug!(session_id = %session_id, %from, %to, moved, "deferred state transition");
        moved
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_lifecycle() {
        let mut hold = DisplayHold::new(Duration::from_secs(60));
        assert!(!hold.is_held());
        assert_eq!(hold.remaining(), None);

        hold.enter();
        assert!(hold.is_held());
        assert!(hold.remaining().is_some());
        assert!(hold.release().is_some());
        assert!(!hold.is_held());
    }

    #[test]
    fn test_zero_minimum_never_defers() {
        let mut hold = DisplayHold::new(Duration::ZERO);
        hold.enter();
        assert_eq!(hold.release(), None);
    }

    #[tokio::test]
    async fn test_deferred_transition_respects_current_state() {
        let store = SessionStore::new();
        let (turn, _) = store.try_begin_turn("s1").unwrap();
        store.update_chat_state("s1", ChatState::ToolBuilding);

        let moved = defer_transition(
            store.clone(),
            "s1".to_string(),
            turn,
            ChatState::ToolBuilding,
            ChatState::Streaming,
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert!(moved);
        assert_eq!(store.session("s1").unwrap().chat_state, ChatState::Streaming);

        store.finish_turn("s1", turn);
        let moved = defer_transition(
            store.clone(),
            "s1".to_string(),
            turn,
            ChatState::Streaming,
            ChatState::Input,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert!(!moved);
    }

    #[tokio::test]
    async fn test_deferred_transition_skips_evicted_session() {
        let store = SessionStore::new();
        let (turn, _) = store.try_begin_turn("s1").unwrap();
        store.update_chat_state("s1", ChatState::ToolBuilding);
        let pending = defer_transition(
            store.clone(),
            "s1".to_string(),
            turn,
            ChatState::ToolBuilding,
            ChatState::Streaming,
            Duration::from_millis(20),
        );

        store.create_session("s2");
        assert_eq!(store.evict(1), vec!["s1".to_string()]);
        assert!(!pending.await.unwrap());
        assert!(!store.contains("s1"));
    }
}
