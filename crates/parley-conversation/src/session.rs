//! Per-conversation state held by the [`crate::store::SessionStore`]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::models::{ChatState, MessageNode, NodeId, RegenerationState};
use crate::tree::MessageTree;

/// One conversation's full state.
///
/// Published sessions are immutable; the store replaces the whole value on
/// every write so holders of an older `Arc<Session>` never see a partial update.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub tree: MessageTree,
    pub chat_state: ChatState,
    pub regeneration_state: Option<RegenerationState>,
    /// The last reply stopped on a context-length limit and may be continued
    pub can_continue: bool,
    /// Text of the message currently being sent
    pub submitted_message: String,
    pub selected_node_for_side_display: Option<NodeId>,
    /// Handle for the in-flight request; replaced after every cancellation
    pub cancellation: CancellationToken,
    /// Message of the last failed turn, shown as a banner
    pub uncaught_error: Option<String>,
    /// Failure before the first packet or while loading history
    pub loading_error: Option<String>,
    pub is_fetching_messages: bool,
    pub is_loaded: bool,
    pub description: Option<String>,
    pub persona_id: Option<i64>,
    /// Set once the automatic naming request was issued
    pub naming_requested: bool,
    /// Sequence number of the turn that owns the chat state
    pub(crate) active_turn: Option<u64>,
    pub last_accessed: DateTime<Utc>,
    /// Tie-breaker for equal `last_accessed` values
    pub(crate) access_seq: u64,
}

impl Session {
    /// Fresh session with an empty tree
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tree: MessageTree::new(),
            chat_state: ChatState::Input,
            regeneration_state: None,
            can_continue: false,
            submitted_message: String::new(),
            selected_node_for_side_display: None,
            cancellation: CancellationToken::new(),
            uncaught_error: None,
            loading_error: None,
            is_fetching_messages: false,
            is_loaded: false,
            description: None,
            persona_id: None,
            naming_requested: false,
            active_turn: None,
            last_accessed: Utc::now(),
            access_seq: 0,
        }
    }

    pub fn latest_chain(&self) -> Vec<Arc<MessageNode>> {
        self.tree.latest_chain()
    }

    /// Whether a turn is in flight
    pub fn is_busy(&self) -> bool {
        self.chat_state.is_busy()
    }
}
