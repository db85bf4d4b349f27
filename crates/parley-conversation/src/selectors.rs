//! Read-only projections of the current session
//!
//! Projections are memoized on the identity of the object they derive from
//! (the session's `Arc` or its tree's map), so writes to other sessions or to
//! unrelated fields never force a recomputation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::{
    CitationMap, ChatState, FileDescriptor, MessageNode, MessageRole, MessageId, NodeId, RegenerationState,
    SearchDocument,
};
use crate::packets::{self, RendererKind};
use crate::session::Session;
use crate::store::SessionStore;
use crate::tree::MessageTree;

/// Equality by reference, not by value
pub trait Identity {
    fn same(&self, other: &Self) -> bool;
}

impl<T> Identity for Arc<T> {
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl Identity for MessageTree {
    fn same(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

/// Single-slot cache keyed by identity
#[derive(Debug)]
pub struct Memo<K, V> {
    slot: Mutex<Option<(K, V)>>,
    computations: AtomicUsize,
}

impl<K: Identity + Clone, V: Clone> Memo<K, V> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            computations: AtomicUsize::new(0),
        }
    }

    /// Cached value for `key`, computing it if the key changed
    pub fn get_or_compute(&self, key: &K, compute: impl FnOnce(&K) -> V) -> V {
        let mut slot = self.slot.lock();
        if let Some((cached_key, value)) = slot.as_ref() {
            if cached_key.same(key) {
                return value.clone();
            }
        }
        let value = compute(key);
        self.computations.fetch_add(1, Ordering::Relaxed);
        *slot = Some((key.clone(), value.clone()));
        value
    }

    /// How many times a value was computed
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

impl<K: Identity + Clone, V: Clone> Default for Memo<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-level flags the presentation layer reads
#[derive(Debug, Clone, PartialEq)]
pub struct SessionViewState {
    pub session_id: String,
    pub chat_state: ChatState,
    pub regeneration_state: Option<RegenerationState>,
    pub can_continue: bool,
    pub is_fetching_messages: bool,
    pub is_loaded: bool,
    pub loading_error: Option<String>,
    pub uncaught_error: Option<String>,
    pub selected_node_for_side_display: Option<NodeId>,
    pub description: Option<String>,
}

impl SessionViewState {
    fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            chat_state: session.chat_state,
            regeneration_state: session.regeneration_state,
            can_continue: session.can_continue,
            is_fetching_messages: session.is_fetching_messages,
            is_loaded: session.is_loaded,
            loading_error: session.loading_error.clone(),
            uncaught_error: session.uncaught_error.clone(),
            selected_node_for_side_display: session.selected_node_for_side_display,
            description: session.description.clone(),
        }
    }
}

/// Progress of a node's tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    None,
    Running { tool_name: String },
    Complete { tool_name: String },
}

/// Derived per-node state for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub id: NodeId,
    pub message_id: Option<MessageId>,
    pub role: MessageRole,
    pub text: String,
    pub citations: CitationMap,
    pub documents: Vec<SearchDocument>,
    pub files: Vec<FileDescriptor>,
    pub tool_status: ToolStatus,
    pub is_generating: bool,
    /// `(ind, renderer)` per packet group
    pub groups: Vec<(i64, Option<RendererKind>)>,
}

/// Project a node for rendering
pub fn node_view(node: &MessageNode) -> NodeView {
    let tool_status = match &node.tool_call {
        None => ToolStatus::None,
        Some(call) if call.is_unfinished() && node.is_generating => ToolStatus::Running {
            tool_name: call.tool_name.clone(),
        },
        Some(call) => ToolStatus::Complete {
            tool_name: call.tool_name.clone(),
        },
    };
    NodeView {
        id: node.id,
        message_id: node.message_id,
        role: node.role,
        text: node.text.clone(),
        citations: node.citations.clone(),
        documents: node.documents.clone(),
        files: node.files.clone(),
        tool_status,
        is_generating: node.is_generating,
        groups: packets::render_groups(&node.packets),
    }
}

/// Memoized projections of the store's current session
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use parley_conversation::{ConversationView, MessageNode, MessageRole, MessageTree, SessionStore};
///
/// let store = SessionStore::new();
/// store.set_current(Some("chat-1"));
/// let view = ConversationView::new(store.clone());
///
/// let tree = MessageTree::new().upsert(vec![MessageNode::new(1, MessageRole::User, "hi", None)], false);
/// store.update_tree("chat-1", tree);
///
/// let chain = view.latest_chain();
/// assert_eq!(chain.len(), 1);
/// // same tree, same chain
/// assert!(Arc::ptr_eq(&chain, &view.latest_chain()));
/// ```
#[derive(Debug)]
pub struct ConversationView {
    store: SessionStore,
    chain: Memo<MessageTree, Arc<Vec<Arc<MessageNode>>>>,
    state: Memo<Arc<Session>, Arc<SessionViewState>>,
}

impl ConversationView {
    /// Views over `store`; nothing is computed until first read
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            chain: Memo::new(),
            state: Memo::new(),
        }
    }

    /// Latest chain of the current session, empty without one
    pub fn latest_chain(&self) -> Arc<Vec<Arc<MessageNode>>> {
        match self.store.current_session() {
            Some(session) => self.chain_of(&session.tree),
            None => Arc::new(Vec::new()),
        }
    }

    /// Latest chain of any session
    pub fn chain_for(&self, session_id: &str) -> Arc<Vec<Arc<MessageNode>>> {
        match self.store.session(session_id) {
            Some(session) => self.chain_of(&session.tree),
            None => Arc::new(Vec::new()),
        }
    }

    fn chain_of(&self, tree: &MessageTree) -> Arc<Vec<Arc<MessageNode>>> {
        self.chain
            .get_or_compute(tree, |tree| Arc::new(tree.latest_chain()))
    }

    /// State of the current session; `input` when there is none
    pub fn chat_state(&self) -> ChatState {
        self.store
            .current_session()
            .map(|session| session.chat_state)
            .unwrap_or_default()
    }

    /// Flat snapshot of the current session, recomputed only when the
    /// session value is replaced
    pub fn view_state(&self) -> Option<Arc<SessionViewState>> {
        let session = self.store.current_session()?;
        Some(
            self.state
                .get_or_compute(&session, |session| Arc::new(SessionViewState::from_session(session))),
        )
    }

    /// Render-ready views of the latest chain
    pub fn node_views(&self) -> Vec<NodeView> {
        self.latest_chain()
            .iter()
            .map(|node| node_view(node))
            .collect()
    }

    /// How many times the latest chain was actually recomputed
    pub fn chain_computations(&self) -> usize {
        self.chain.computations()
    }

    /// How many times the view state was actually recomputed
    pub fn state_computations(&self) -> usize {
        self.state.computations()
    }
}
