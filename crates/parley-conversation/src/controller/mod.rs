//! Imperative actions over the session store
//!
//! [`ChatController`] is the only writer besides the store's own bookkeeping.
//! It owns no state of its own: everything it knows lives in the
//! [`SessionStore`] it was given, so several controllers (or a controller and
//! read-only selectors) can share one store.

mod turn;

pub use turn::{RegenerateTarget, SubmitRequest, TurnOutcome};

use std::sync::Arc;

use tracing::{debug, info};

use crate::bus::{ErrorSurface, StoreEvent};
use crate::config::EngineConfig;
use crate::error::{ConversationError, ConversationResult};
use crate::history;
use crate::models::{ChatState, FileDescriptor, NodeId};
use crate::navigator;
use crate::store::SessionStore;
use crate::transport::{ChatTransport, PendingUpload};
use crate::tree::MessageTree;

/// Prompt sent by [`ChatController::continue_generating`]
pub const CONTINUE_PROMPT: &str = "Continue Generating (pick up exactly where you left off)";

/// Drives turns and navigation for the sessions in a store
#[derive(Clone)]
pub struct ChatController {
    store: SessionStore,
    transport: Arc<dyn ChatTransport>,
    config: EngineConfig,
}

impl ChatController {
    pub fn new(store: SessionStore, transport: Arc<dyn ChatTransport>, config: EngineConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn current_session_id(&self) -> ConversationResult<String> {
        self.store
            .current_session_id()
            .ok_or_else(|| ConversationError::SessionNotFound("no current session".to_string()))
    }

    fn current_tree(&self) -> ConversationResult<(String, MessageTree)> {
        let session_id = self.current_session_id()?;
        let session = self
            .store
            .session(&session_id)
            .ok_or_else(|| ConversationError::SessionNotFound(session_id.clone()))?;
        Ok((session_id, session.tree.clone()))
    }

    fn surface(&self, session_id: Option<&str>, surface: ErrorSurface, message: String) {
        self.store.bus().publish(StoreEvent::ErrorSurfaced {
            session_id: session_id.map(str::to_string),
            surface,
            message,
        });
    }

    async fn resolve_session(&self, request: &SubmitRequest) -> ConversationResult<String> {
        if let Some(session_id) = &request.session_id {
            self.store.create_session(session_id);
            return Ok(session_id.clone());
        }
        if let Some(session_id) = self.store.current_session_id() {
            return Ok(session_id);
        }
        self.new_session(request.persona_id, "").await
    }

    /// Create a session on the backend and make it current
    pub async fn new_session(&self, persona_id: Option<i64>, description: &str) -> ConversationResult<String> {
        let session_id = self.transport.create_session(persona_id, description).await?;
        let description = (!description.is_empty()).then(|| description.to_string());
        self.store
            .initialize_session(&session_id, MessageTree::new(), description, persona_id);
        self.store.set_current(Some(&session_id));
        info!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    /// Fetch stored history into the session.
    ///
    /// A session with a turn in flight keeps its live tree; only the fetching
    /// flag is cleared.
    pub async fn load_session(&self, session_id: &str) -> ConversationResult<()> {
        self.store.create_session(session_id);
        self.store.set_fetching(session_id, true);
        match self.transport.fetch_session(session_id).await {
            Ok(stored) => {
                let tree = history::build_tree(&stored);
                let description = (!stored.description.is_empty()).then(|| stored.description.clone());
                if self
                    .store
                    .initialize_session(session_id, tree, description, stored.persona_id)
                {
                    debug!(session_id, messages = stored.messages.len(), "history loaded");
                } else {
                    debug!(session_id, "turn in flight; keeping live tree");
                }
                Ok(())
            }
            Err(err) => {
                self.store.set_fetching(session_id, false);
                self.store.set_loading_error(session_id, Some(err.user_message()));
                self.surface(Some(session_id), ErrorSurface::Banner, err.user_message());
                Err(err)
            }
        }
    }

    /// Make `session_id` current, loading its history the first time.
    /// Streams of other sessions keep running.
    pub async fn switch_session(&self, session_id: &str) -> ConversationResult<()> {
        self.store.set_current(Some(session_id));
        let needs_load = self
            .store
            .session(session_id)
            .map(|session| !session.is_loaded && !session.is_busy() && !session.is_fetching_messages)
            .unwrap_or(true);
        if needs_load {
            self.load_session(session_id).await?;
        }
        Ok(())
    }

    /// Make `node_id` the active child of its parent in the current session
    pub fn select_branch(&self, node_id: NodeId) -> ConversationResult<()> {
        let (session_id, tree) = self.current_tree()?;
        if !tree.contains(node_id) {
            return Err(ConversationError::NodeNotFound(node_id));
        }
        let updated = tree.set_latest(node_id);
        if !updated.ptr_eq(&tree) {
            self.store.update_tree(&session_id, updated);
        }
        Ok(())
    }

    /// Switch to the next sibling of `node_id`. `None` at the last sibling.
    pub fn next_branch(&self, node_id: NodeId) -> ConversationResult<Option<NodeId>> {
        let (_, tree) = self.current_tree()?;
        let Some(next) = navigator::next_sibling(&tree, node_id) else {
            return Ok(None);
        };
        self.select_branch(next)?;
        Ok(Some(next))
    }

    /// Switch to the previous sibling of `node_id`. `None` at the first sibling.
    pub fn previous_branch(&self, node_id: NodeId) -> ConversationResult<Option<NodeId>> {
        let (_, tree) = self.current_tree()?;
        let Some(previous) = navigator::previous_sibling(&tree, node_id) else {
            return Ok(None);
        };
        self.select_branch(previous)?;
        Ok(Some(previous))
    }

    /// Toggle the node shown in the documents side panel
    pub fn select_node_for_side_panel(&self, node_id: NodeId) -> ConversationResult<Option<NodeId>> {
        let session_id = self.current_session_id()?;
        let current = self
            .store
            .session(&session_id)
            .and_then(|session| session.selected_node_for_side_display);
        let next = (current != Some(node_id)).then_some(node_id);
        self.store.update_selected_node(&session_id, next);
        Ok(next)
    }

    /// Upload attachments for the current session. The session is in
    /// `uploading` for the duration and always returns to `input`.
    pub async fn upload_files(&self, files: Vec<PendingUpload>) -> ConversationResult<Vec<FileDescriptor>> {
        let session_id = self.current_session_id()?;
        if !self.store.contains(&session_id) {
            return Err(ConversationError::SessionNotFound(session_id));
        }
        if let Err(state) = self
            .store
            .try_transition(&session_id, ChatState::Input, ChatState::Uploading)
        {
            let err = ConversationError::Busy { state };
            self.surface(Some(&session_id), ErrorSurface::Popup, err.user_message());
            return Err(err);
        }

        let result = self.transport.upload_files(files).await;
        if let Err(state) = self
            .store
            .try_transition(&session_id, ChatState::Uploading, ChatState::Input)
        {
            debug!(session_id = %session_id, ?state, "upload finished after the session moved on");
        }

        result.map_err(|err| {
            self.surface(Some(&session_id), ErrorSurface::Popup, err.user_message());
            err
        })
    }

    /// Drop sessions beyond the configured limit, oldest access first
    pub fn evict_stale_sessions(&self) -> Vec<String> {
        self.store.evict(self.config.max_sessions)
    }
}
