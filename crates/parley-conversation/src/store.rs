//! Session registry shared by the controller and read-only selectors
//!
//! The registry is the only shared mutable resource. Every write clones the
//! affected [`Session`], applies a targeted change and swaps the new `Arc` in
//! under a short write lock, so each write starts from the latest registry
//! state and readers holding an older snapshot are never torn. Events are
//! published after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{EventBus, StoreEvent};
use crate::models::{ChatState, NodeId, RegenerationState, SYSTEM_NODE_ID};
use crate::session::Session;
use crate::tree::MessageTree;

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    current: Option<String>,
    /// Monotonic access counter
    clock: u64,
}

impl Registry {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Keyed registry of sessions plus the current-session pointer
///
/// Only [`set_current`](Self::set_current), [`create_session`](Self::create_session),
/// [`initialize_session`](Self::initialize_session) and
/// [`try_begin_turn`](Self::try_begin_turn) bring a session into existence.
/// Every other write is dropped once the session has been evicted or removed.
///
/// # Example
///
/// ```rust
/// use parley_conversation::{ChatState, SessionStore};
///
/// let store = SessionStore::new();
/// store.set_current(Some("chat-1"));
///
/// let (turn, _cancel) = store.try_begin_turn("chat-1").unwrap();
/// assert_eq!(store.current_session().unwrap().chat_state, ChatState::Loading);
///
/// // an evicted session stays gone
/// assert_eq!(store.evict(0), vec!["chat-1".to_string()]);
/// assert!(!store.finish_turn("chat-1", turn));
/// assert!(!store.contains("chat-1"));
/// ```
#[derive(Debug, Clone)]
pub struct SessionStore {
    registry: Arc<RwLock<Registry>>,
    bus: EventBus,
    provisional_ids: Arc<AtomicI64>,
    turns: Arc<AtomicU64>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Empty store with its own event bus
    pub fn new() -> Self {
        Self::with_bus(EventBus::new())
    }

    /// Store publishing on an existing bus
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            bus,
            provisional_ids: Arc::new(AtomicI64::new(SYSTEM_NODE_ID - 1)),
            turns: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Bus every store change is published on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Allocate a provisional node id. Never collides with the root sentinel or a backend id.
    pub fn next_node_id(&self) -> NodeId {
        self.provisional_ids.fetch_sub(1, Ordering::Relaxed)
    }

    /// Snapshot of one session
    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry.read().sessions.get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.registry.read().sessions.contains_key(session_id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.registry.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every registered session, in no particular order
    pub fn session_ids(&self) -> Vec<String> {
        self.registry.read().sessions.keys().cloned().collect()
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.registry.read().current.clone()
    }

    /// Snapshot of the session the pointer names, if it is registered
    pub fn current_session(&self) -> Option<Arc<Session>> {
        let registry = self.registry.read();
        let id = registry.current.as_ref()?;
        registry.sessions.get(id).cloned()
    }

    /// Point the store at a session, creating it if needed. `None` clears the pointer.
    pub fn set_current(&self, session_id: Option<&str>) {
        let mut events = Vec::new();
        {
            let mut registry = self.registry.write();
            if let Some(id) = session_id {
                Self::touch(&mut registry, id, &mut events);
            }
            let next = session_id.map(str::to_string);
            if registry.current != next {
                registry.current = next.clone();
                events.push(StoreEvent::CurrentChanged { session_id: next });
            }
        }
        self.publish(events);
    }

    /// Ensure a session exists and refresh its access time
    pub fn create_session(&self, session_id: &str) -> Arc<Session> {
        let mut events = Vec::new();
        let session = {
            let mut registry = self.registry.write();
            Self::touch(&mut registry, session_id, &mut events)
        };
        self.publish(events);
        session
    }

    fn touch(registry: &mut Registry, session_id: &str, events: &mut Vec<StoreEvent>) -> Arc<Session> {
        let seq = registry.tick();
        let mut session = match registry.sessions.get(session_id) {
            Some(existing) => (**existing).clone(),
            None => {
                debug!(session_id, "creating session entry");
                events.push(StoreEvent::SessionCreated {
                    session_id: session_id.to_string(),
                });
                Session::new(session_id)
            }
        };
        session.last_accessed = Utc::now();
        session.access_seq = seq;
        let session = Arc::new(session);
        registry
            .sessions
            .insert(session_id.to_string(), Arc::clone(&session));
        session
    }

    /// Read-modify-write one session, creating it first if it is missing.
    /// The closure sees the latest registry value, never a caller's stale snapshot.
    fn modify<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut registry = self.registry.write();
            let previous = match registry.sessions.get(session_id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    events.push(StoreEvent::SessionCreated {
                        session_id: session_id.to_string(),
                    });
                    Arc::new(Session::new(session_id))
                }
            };
            Self::commit(&mut registry, previous, f, &mut events)
        };
        self.publish(events);
        result
    }

    /// Read-modify-write one session if it is still registered. Writes from
    /// turns, deferred transitions and background tasks go through here so an
    /// evicted or removed session is never recreated behind the caller's back.
    fn modify_existing<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut events = Vec::new();
        let result = {
            let mut registry = self.registry.write();
            let previous = registry.sessions.get(session_id).cloned();
            previous.map(|previous| Self::commit(&mut registry, previous, f, &mut events))
        };
        if result.is_none() {
            debug!(session_id, "session no longer registered; write dropped");
        }
        self.publish(events);
        result
    }

    fn commit<R>(
        registry: &mut Registry,
        previous: Arc<Session>,
        f: impl FnOnce(&mut Session) -> R,
        events: &mut Vec<StoreEvent>,
    ) -> R {
        let seq = registry.tick();
        let session_id = previous.session_id.clone();
        let mut next = (*previous).clone();
        let result = f(&mut next);
        next.last_accessed = Utc::now();
        next.access_seq = seq;

        if !next.tree.ptr_eq(&previous.tree) {
            events.push(StoreEvent::TreeUpdated {
                session_id: session_id.clone(),
            });
        }
        if next.chat_state != previous.chat_state {
            events.push(StoreEvent::ChatStateChanged {
                session_id: session_id.clone(),
                from: previous.chat_state,
                to: next.chat_state,
            });
        }
        registry.sessions.insert(session_id, Arc::new(next));
        result
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }

    /// Replace the session's tree
    pub fn update_tree(&self, session_id: &str, tree: MessageTree) {
        self.modify_existing(session_id, |session| session.tree = tree);
    }

    /// Write a tree produced by a streaming turn, unless that turn was cancelled.
    /// The check happens under the registry lock, so a stop that already
    /// replaced the tree is never overwritten.
    pub fn update_tree_unless_cancelled(
        &self,
        session_id: &str,
        token: &CancellationToken,
        tree: MessageTree,
    ) -> bool {
        self.modify_existing(session_id, |session| {
            if token.is_cancelled() {
                return false;
            }
            session.tree = tree;
            true
        })
        .unwrap_or(false)
    }

    pub fn update_chat_state(&self, session_id: &str, state: ChatState) {
        self.modify_existing(session_id, |session| session.chat_state = state);
    }

    /// Move to `next` only if the session is still in `expected` and still owned by `turn`
    pub fn compare_and_set_chat_state(
        &self,
        session_id: &str,
        turn: u64,
        expected: ChatState,
        next: ChatState,
    ) -> bool {
        self.modify_existing(session_id, |session| {
            if session.active_turn != Some(turn) || session.chat_state != expected {
                return false;
            }
            session.chat_state = next;
            true
        })
        .unwrap_or(false)
    }

    /// Move from `from` to `to`; fails with the actual state otherwise.
    /// A session that is no longer registered reports `input`.
    pub fn try_transition(&self, session_id: &str, from: ChatState, to: ChatState) -> Result<(), ChatState> {
        self.modify_existing(session_id, |session| {
            if session.chat_state != from {
                return Err(session.chat_state);
            }
            session.chat_state = to;
            Ok(())
        })
        .unwrap_or(Err(ChatState::Input))
    }

    pub fn update_regeneration_state(&self, session_id: &str, state: Option<RegenerationState>) {
        self.modify_existing(session_id, |session| session.regeneration_state = state);
    }

    pub fn update_can_continue(&self, session_id: &str, can_continue: bool) {
        self.modify_existing(session_id, |session| session.can_continue = can_continue);
    }

    pub fn update_submitted_message(&self, session_id: &str, message: impl Into<String>) {
        let message = message.into();
        self.modify_existing(session_id, |session| session.submitted_message = message);
    }

    /// Set or clear the node shown in the documents side panel
    pub fn update_selected_node(&self, session_id: &str, node_id: Option<NodeId>) {
        self.modify_existing(session_id, |session| {
            session.selected_node_for_side_display = node_id
        });
    }

    /// Error of the last failed turn, shown as a banner
    pub fn set_uncaught_error(&self, session_id: &str, error: Option<String>) {
        self.modify_existing(session_id, |session| session.uncaught_error = error);
    }

    /// Error raised before the backend acknowledged a turn, or while loading history
    pub fn set_loading_error(&self, session_id: &str, error: Option<String>) {
        self.modify_existing(session_id, |session| session.loading_error = error);
    }

    pub fn set_fetching(&self, session_id: &str, fetching: bool) {
        self.modify_existing(session_id, |session| session.is_fetching_messages = fetching);
    }

    pub fn set_description(&self, session_id: &str, description: Option<String>) {
        self.modify_existing(session_id, |session| session.description = description);
    }

    pub fn set_persona(&self, session_id: &str, persona_id: Option<i64>) {
        self.modify_existing(session_id, |session| session.persona_id = persona_id);
    }

    /// Flag the session as named. Returns `false` if it already was.
    pub fn mark_naming_requested(&self, session_id: &str) -> bool {
        self.modify_existing(session_id, |session| {
            !std::mem::replace(&mut session.naming_requested, true)
        })
        .unwrap_or(false)
    }

    /// Install history fetched from the backend. Skipped while a turn owns the session.
    pub fn initialize_session(
        &self,
        session_id: &str,
        tree: MessageTree,
        description: Option<String>,
        persona_id: Option<i64>,
    ) -> bool {
        self.modify(session_id, |session| {
            session.is_fetching_messages = false;
            if session.chat_state != ChatState::Input {
                return false;
            }
            session.tree = tree;
            session.description = description;
            session.persona_id = persona_id;
            session.is_loaded = true;
            session.loading_error = None;
            true
        })
    }

    /// The live cancellation handle of a session
    pub fn cancellation_token(&self, session_id: &str) -> CancellationToken {
        if let Some(session) = self.session(session_id) {
            return session.cancellation.clone();
        }
        self.create_session(session_id).cancellation.clone()
    }

    /// Claim the session for a new turn: `input -> loading`. Creates the
    /// session if it is missing.
    ///
    /// Fails with the current state if a turn is already in flight. On success
    /// returns the turn's sequence number and the cancellation handle it must observe.
    pub fn try_begin_turn(&self, session_id: &str) -> Result<(u64, CancellationToken), ChatState> {
        let turn = self.turns.fetch_add(1, Ordering::Relaxed);
        self.modify(session_id, |session| {
            if session.chat_state.is_busy() {
                return Err(session.chat_state);
            }
            session.chat_state = ChatState::Loading;
            session.active_turn = Some(turn);
            session.uncaught_error = None;
            session.loading_error = None;
            Ok((turn, session.cancellation.clone()))
        })
    }

    /// Release the session after a turn: back to `input`, regeneration cleared.
    /// Ignored if another turn or a stop already took over.
    pub fn finish_turn(&self, session_id: &str, turn: u64) -> bool {
        self.modify_existing(session_id, |session| {
            if session.active_turn != Some(turn) {
                return false;
            }
            session.active_turn = None;
            session.chat_state = ChatState::Input;
            session.regeneration_state = None;
            true
        })
        .unwrap_or(false)
    }

    /// Whether `turn` still owns the session
    pub fn is_turn_active(&self, session_id: &str, turn: u64) -> bool {
        self.session(session_id)
            .map(|session| session.active_turn == Some(turn))
            .unwrap_or(false)
    }

    /// Stop the in-flight turn in one atomic step: signal and replace the
    /// handle, rewrite the tree, return to `input`. Returns `false` in `input`.
    ///
    /// `finalize` only runs when a turn owns the session; stopping an upload
    /// leaves the tree alone.
    pub fn abort_turn(&self, session_id: &str, finalize: impl FnOnce(&MessageTree) -> MessageTree) -> bool {
        let stopped = self
            .modify_existing(session_id, |session| {
                if session.chat_state == ChatState::Input {
                    return false;
                }
                session.cancellation.cancel();
                session.cancellation = CancellationToken::new();
                if session.active_turn.is_some() {
                    session.tree = finalize(&session.tree);
                }
                session.chat_state = ChatState::Input;
                session.regeneration_state = None;
                session.active_turn = None;
                true
            })
            .unwrap_or(false);
        if stopped {
            info!(session_id, "turn stopped");
        }
        stopped
    }

    /// Point the side panel at `new` if it was showing `old`
    pub fn remap_selected_node(&self, session_id: &str, old: NodeId, new: NodeId) {
        self.modify_existing(session_id, |session| {
            if session.selected_node_for_side_display == Some(old) {
                session.selected_node_for_side_display = Some(new);
            }
        });
    }

    /// Signal the session's handle and replace it with a fresh one
    pub fn cancel(&self, session_id: &str) {
        let mut registry = self.registry.write();
        if let Some(existing) = registry.sessions.get(session_id) {
            let mut session = (**existing).clone();
            session.cancellation.cancel();
            session.cancellation = CancellationToken::new();
            registry
                .sessions
                .insert(session_id.to_string(), Arc::new(session));
            debug!(session_id, "session cancelled");
        }
    }

    /// Keep the `max_sessions` most recently accessed sessions; cancel and drop the rest
    pub fn evict(&self, max_sessions: usize) -> Vec<String> {
        let evicted: Vec<Arc<Session>> = {
            let mut registry = self.registry.write();
            if registry.sessions.len() <= max_sessions {
                return Vec::new();
            }
            let mut ordered: Vec<Arc<Session>> = registry.sessions.values().cloned().collect();
            ordered.sort_by(|a, b| {
                b.last_accessed
                    .cmp(&a.last_accessed)
                    .then(b.access_seq.cmp(&a.access_seq))
            });
            let stale = ordered.split_off(max_sessions);
            for session in &stale {
                registry.sessions.remove(&session.session_id);
            }
            stale
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for session in evicted {
            session.cancellation.cancel();
            info!(session_id = %session.session_id, "session evicted");
            self.bus.publish(StoreEvent::SessionEvicted {
                session_id: session.session_id.clone(),
            });
            ids.push(session.session_id.clone());
        }
        ids
    }

    /// Drop a session, cancelling any request it owns
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = {
            let mut registry = self.registry.write();
            if registry.current.as_deref() == Some(session_id) {
                registry.current = None;
            }
            registry.sessions.remove(session_id)
        };
        if let Some(session) = &removed {
            session.cancellation.cancel();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageNode, MessageRole};

    #[test]
    fn test_set_current_creates_lazily() {
        let store = SessionStore::new();
        assert!(store.current_session().is_none());
        store.set_current(Some("s1"));
        assert_eq!(store.current_session_id().as_deref(), Some("s1"));
        assert!(store.current_session().is_some());
        store.set_current(None);
        assert!(store.current_session().is_none());
        assert!(store.contains("s1"));
    }

    #[test]
    fn test_updates_replace_whole_session() {
        let store = SessionStore::new();
        store.create_session("s1");
        let before = store.session("s1").unwrap();

        let tree = MessageTree::new().upsert(
            vec![MessageNode::new(1, MessageRole::User, "hi", None)],
            false,
        );
        store.update_tree("s1", tree.clone());
        let after = store.session("s1").unwrap();

        assert!(before.tree.is_empty());
        assert!(after.tree.ptr_eq(&tree));
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.access_seq > before.access_seq);
    }

    #[test]
    fn test_provisional_ids_descend_below_sentinel() {
        let store = SessionStore::new();
        let first = store.next_node_id();
        let second = store.next_node_id();
        assert_eq!(first, SYSTEM_NODE_ID - 1);
        assert_eq!(second, first - 1);
    }

    #[test]
    fn test_cancel_replaces_handle() {
        let store = SessionStore::new();
        let old = store.cancellation_token("s1");
        store.cancel("s1");
        assert!(old.is_cancelled());
        assert!(!store.cancellation_token("s1").is_cancelled());
    }

    #[test]
    fn test_begin_turn_rejects_busy_session() {
        let store = SessionStore::new();
        let (turn, _) = store.try_begin_turn("s1").unwrap();
        assert_eq!(store.try_begin_turn("s1").unwrap_err(), ChatState::Loading);
        assert!(store.finish_turn("s1", turn));
        assert!(!store.finish_turn("s1", turn));
        assert!(store.try_begin_turn("s1").is_ok());
    }

    #[test]
    fn test_abort_turn_is_noop_in_input() {
        let store = SessionStore::new();
        store.create_session("s1");
        assert!(!store.abort_turn("s1", |tree| tree.clone()));

        let (_, token) = store.try_begin_turn("s1").unwrap();
        assert!(store.abort_turn("s1", |tree| tree.clone()));
        assert!(token.is_cancelled());
        let session = store.session("s1").unwrap();
        assert_eq!(session.chat_state, ChatState::Input);
        assert!(!session.cancellation.is_cancelled());
    }

    #[test]
    fn test_evict_keeps_most_recent() {
        let store = SessionStore::new();
        for id in ["a", "b", "c", "d"] {
            store.create_session(id);
        }
        let token_a = store.cancellation_token("a");
        store.create_session("b");

        let mut evicted = store.evict(2);
        evicted.sort();
        assert_eq!(evicted, vec!["a".to_string(), "c".to_string()]);
        assert!(token_a.is_cancelled());
        assert!(store.contains("b"));
        assert!(store.contains("d"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_initialize_skips_busy_session() {
        let store = SessionStore::new();
        store.try_begin_turn("s1").unwrap();
        let tree = MessageTree::new().upsert(
            vec![MessageNode::new(1, MessageRole::User, "hi", None)],
            false,
        );
        assert!(!store.initialize_session("s1", tree, None, None));
        let session = store.session("s1").unwrap();
        assert!(session.tree.is_empty());
        assert!(!session.is_loaded);
    }

    #[test]
    fn test_writes_to_missing_session_are_dropped() {
        let store = SessionStore::new();
        store.update_chat_state("gone", ChatState::Streaming);
        store.set_description("gone", Some("title".into()));
        assert!(!store.finish_turn("gone", 1));
        assert!(!store.compare_and_set_chat_state("gone", 1, ChatState::Loading, ChatState::Streaming));
        assert!(!store.abort_turn("gone", |tree| tree.clone()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_evicted_turn_cleanup_does_not_recreate_session() {
        let store = SessionStore::new();
        let (turn, token) = store.try_begin_turn("a").unwrap();
        store.create_session("b");

        assert_eq!(store.evict(1), vec!["a".to_string()]);
        assert!(token.is_cancelled());
        assert!(!store.update_tree_unless_cancelled("a", &CancellationToken::new(), MessageTree::new()));
        assert!(!store.finish_turn("a", turn));
        assert!(!store.mark_naming_requested("a"));
        assert!(!store.contains("a"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_abort_during_upload_leaves_tree_alone() {
        let store = SessionStore::new();
        store.create_session("s1");
        let tree = MessageTree::new().upsert(
            vec![
                MessageNode::new(1, MessageRole::User, "hi", None),
                MessageNode::new(2, MessageRole::Assistant, "done", Some(1)),
            ],
            true,
        );
        store.update_tree("s1", tree.clone());
        store
            .try_transition("s1", ChatState::Input, ChatState::Uploading)
            .unwrap();

        let mut finalized = false;
        assert!(store.abort_turn("s1", |tree| {
            finalized = true;
            tree.clone()
        }));
        assert!(!finalized);
        let session = store.session("s1").unwrap();
        assert_eq!(session.chat_state, ChatState::Input);
        assert!(session.tree.ptr_eq(&tree));
    }

    #[test]
    fn test_remap_selected_node_follows_rekey() {
        let store = SessionStore::new();
        store.create_session("s1");
        store.update_selected_node("s1", Some(-5));

        store.remap_selected_node("s1", -4, 10);
        assert_eq!(store.session("s1").unwrap().selected_node_for_side_display, Some(-5));
        store.remap_selected_node("s1", -5, 11);
        assert_eq!(store.session("s1").unwrap().selected_node_for_side_display, Some(11));
    }

    #[tokio::test]
    async fn test_writes_publish_events() {
        let store = SessionStore::new();
        let mut events = store.bus().subscribe();
        store.create_session("s1");
        store.update_chat_state("s1", ChatState::Loading);

        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::SessionCreated {
                session_id: "s1".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::ChatStateChanged {
                session_id: "s1".to_string(),
                from: ChatState::Input,
                to: ChatState::Loading,
            }
        );
    }
}
