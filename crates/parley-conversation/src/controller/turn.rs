//! One conversational turn: submit, fold the stream, finish or fail, stop

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChatController, CONTINUE_PROMPT};
use crate::bus::ErrorSurface;
use crate::error::{ConversationError, ConversationResult};
use crate::models::{
    ChatState, FileDescriptor, LlmOverride, MessageId, MessageNode, MessageRole, NodeId, RegenerationState,
    SYSTEM_NODE_ID,
};
use crate::navigator;
use crate::packets::{self, Packet};
use crate::stream::{defer_transition, DisplayHold, FifoItem, FoldEffects, PacketFifo, ProcessResult, TurnProcessor};
use crate::transport::{PacketStream, SendMessageRequest};
use crate::tree::MessageTree;

/// Arguments of one turn
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub message: String,
    /// Target session; the current one (or a newly created one) when unset
    pub session_id: Option<String>,
    pub files: Vec<FileDescriptor>,
    pub filters: Option<Value>,
    pub llm_override: Option<LlmOverride>,
    pub alternate_assistant_id: Option<i64>,
    /// Persona for a session created by this submit
    pub persona_id: Option<i64>,
    pub query_override: Option<String>,
    pub force_search: bool,
    /// Replay the user message with this id as a new sibling branch
    pub message_id_to_resend: Option<MessageId>,
    /// Ask for a new reply to an existing user message
    pub regenerate: Option<RegenerateTarget>,
}

impl SubmitRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_files(mut self, files: Vec<FileDescriptor>) -> Self {
        self.files = files;
        self
    }

    pub fn with_llm_override(mut self, llm_override: LlmOverride) -> Self {
        self.llm_override = Some(llm_override);
        self
    }

    fn is_replay(&self) -> bool {
        self.message_id_to_resend.is_some() || self.regenerate.is_some()
    }
}

/// The user node whose reply is being regenerated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegenerateTarget {
    pub user_node: NodeId,
    /// Index of the replaced reply in the latest chain
    pub target_index: usize,
}

/// How a submitted turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// Stopped by the user, a session switch or eviction
    Cancelled,
    /// Ended in an error node carrying this message
    Failed(String),
}

struct PreparedTurn {
    tree: MessageTree,
    user_node: NodeId,
    assistant_node: NodeId,
    request: SendMessageRequest,
}

enum LoopEnd {
    Closed,
    Cancelled,
    Failed {
        message: String,
        stack_trace: Option<String>,
        before_ids: bool,
    },
}

impl LoopEnd {
    fn from_error(err: ConversationError) -> Self {
        if err.is_cancellation() {
            return LoopEnd::Cancelled;
        }
        LoopEnd::Failed {
            message: err.user_message(),
            stack_trace: err.stack_trace().map(str::to_string),
            before_ids: false,
        }
    }
}

impl ChatController {
    /// Send a message and fold the reply into the session tree.
    ///
    /// Rejected with [`ConversationError::Busy`] while a turn is in flight.
    /// Stream failures do not surface as `Err`: they end the turn in an
    /// error node and are reported as [`TurnOutcome::Failed`].
    pub async fn submit(&self, request: SubmitRequest) -> ConversationResult<TurnOutcome> {
        let session_id = self.resolve_session(&request).await?;

        let (turn, cancel) = match self.store.try_begin_turn(&session_id) {
            Ok(claimed) => claimed,
            Err(state) => {
                let err = ConversationError::Busy { state };
                self.surface(Some(&session_id), ErrorSurface::Popup, err.user_message());
                return Err(err);
            }
        };

        let prepared = match self.prepare_turn(&session_id, &request) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "turn rejected");
                self.store.finish_turn(&session_id, turn);
                self.surface(Some(&session_id), ErrorSurface::Popup, err.user_message());
                return Err(err);
            }
        };

        let outcome = self.run_turn(&session_id, turn, cancel, prepared).await;
        self.store.finish_turn(&session_id, turn);

        if outcome == TurnOutcome::Completed {
            self.maybe_name_session(&session_id);
        }
        Ok(outcome)
    }

    /// Replay a user message on a new sibling branch with its original text
    pub async fn resend(&self, message_id: MessageId) -> ConversationResult<TurnOutcome> {
        let session_id = self.current_session_id()?;
        let request = SubmitRequest {
            session_id: Some(session_id),
            message_id_to_resend: Some(message_id),
            ..SubmitRequest::default()
        };
        self.submit(request).await
    }

    /// Replay a user message on a new sibling branch with edited text
    pub async fn edit_and_resend(
        &self,
        message_id: MessageId,
        text: impl Into<String>,
    ) -> ConversationResult<TurnOutcome> {
        let session_id = self.current_session_id()?;
        let request = SubmitRequest {
            message: text.into(),
            session_id: Some(session_id),
            message_id_to_resend: Some(message_id),
            ..SubmitRequest::default()
        };
        self.submit(request).await
    }

    /// Ask for a new reply to the user message that produced `reply_node`
    pub async fn regenerate(
        &self,
        reply_node: NodeId,
        llm_override: Option<LlmOverride>,
    ) -> ConversationResult<TurnOutcome> {
        let session_id = self.current_session_id()?;
        let session = self
            .store
            .session(&session_id)
            .ok_or_else(|| ConversationError::SessionNotFound(session_id.clone()))?;

        let pair = navigator::pair_for_turn(&session.tree, reply_node)
            .filter(|pair| pair.assistant.id == reply_node)
            .ok_or(ConversationError::NodeNotFound(reply_node))?;
        let chain = session.latest_chain();
        let target_index = chain
            .iter()
            .position(|node| node.id == pair.assistant.id)
            .unwrap_or(chain.len());

        let request = SubmitRequest {
            message: pair.user.text.clone(),
            session_id: Some(session_id),
            files: pair.user.files.clone(),
            llm_override,
            regenerate: Some(RegenerateTarget {
                user_node: pair.user.id,
                target_index,
            }),
            ..SubmitRequest::default()
        };
        self.submit(request).await
    }

    /// Pick up a reply that was cut off by the context window
    pub async fn continue_generating(&self) -> ConversationResult<TurnOutcome> {
        let session_id = self.current_session_id()?;
        self.store.update_can_continue(&session_id, false);
        self.submit(SubmitRequest::new(CONTINUE_PROMPT).in_session(session_id))
            .await
    }

    /// Stop the in-flight turn of `session_id` (or the current session).
    ///
    /// The open reply loses an unfinished tool call and gains a stop packet
    /// if the server has not sent one. Returns `false` when nothing was running.
    pub fn stop_generating(&self, session_id: Option<&str>) -> bool {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => match self.store.current_session_id() {
                Some(id) => id,
                None => return false,
            },
        };
        self.store.abort_turn(&session_id, close_open_reply)
    }

    fn prepare_turn(&self, session_id: &str, request: &SubmitRequest) -> ConversationResult<PreparedTurn> {
        let session = self
            .store
            .session(session_id)
            .ok_or_else(|| ConversationError::SessionNotFound(session_id.to_string()))?;
        let mut tree = session.tree.clone();

        if !request.is_replay() {
            if let Some(pruned) = tree.without_trailing_error_turn() {
                debug!(session_id, "pruning failed turn before submit");
                tree = pruned;
            }
        }

        let mut send = SendMessageRequest::new(session_id, request.message.clone());
        send.file_descriptors = request.files.clone();
        send.filters = request.filters.clone();
        send.llm_override = request.llm_override.clone();
        send.alternate_assistant_id = request.alternate_assistant_id;
        send.query_override = request.query_override.clone();
        send.force_search = request.force_search;

        let mut nodes = Vec::with_capacity(2);
        let user_node = if let Some(target) = request.regenerate {
            let user = tree
                .get(target.user_node)
                .filter(|node| node.role == MessageRole::User)
                .ok_or(ConversationError::NodeNotFound(target.user_node))?;
            send.parent_message_id = user.message_id;
            send.regenerate = true;
            send.use_existing_user_message = true;
            user.id
        } else {
            let (parent, text, files) = match request.message_id_to_resend {
                Some(message_id) => {
                    let chain = tree.latest_chain();
                    let original = chain
                        .iter()
                        .find(|node| {
                            node.role == MessageRole::User
                                && (node.message_id == Some(message_id) || node.id == message_id)
                        })
                        .ok_or(ConversationError::ResendTargetNotFound(message_id))?;
                    let text = if request.message.is_empty() {
                        original.text.clone()
                    } else {
                        request.message.clone()
                    };
                    let files = if request.files.is_empty() {
                        original.files.clone()
                    } else {
                        request.files.clone()
                    };
                    (original.parent_id.unwrap_or(SYSTEM_NODE_ID), text, files)
                }
                None => (
                    tree.last_successful(None).unwrap_or(SYSTEM_NODE_ID),
                    request.message.clone(),
                    request.files.clone(),
                ),
            };
            send.parent_message_id = tree.get(parent).and_then(|node| node.message_id);
            send.message = text.clone();
            send.file_descriptors = files.clone();

            let id = self.store.next_node_id();
            let mut user = MessageNode::new(id, MessageRole::User, text, Some(parent)).with_files(files);
            user.time_sent = Some(chrono::Utc::now());
            nodes.push(user);
            id
        };

        let assistant_node = self.store.next_node_id();
        let mut assistant = MessageNode::new(assistant_node, MessageRole::Assistant, "", Some(user_node));
        assistant.is_generating = true;
        assistant.alternate_assistant_id = request.alternate_assistant_id;
        assistant.overridden_model = request
            .llm_override
            .as_ref()
            .and_then(|model| model.model_version.clone());
        nodes.push(assistant);

        let tree = tree.upsert(nodes, true);
        self.store.update_tree(session_id, tree.clone());
        self.store.update_submitted_message(session_id, send.message.clone());
        if let Some(target) = request.regenerate {
            self.store.update_regeneration_state(
                session_id,
                Some(RegenerationState {
                    is_regenerating: true,
                    target_index: target.target_index,
                }),
            );
        }

        Ok(PreparedTurn {
            tree,
            user_node,
            assistant_node,
            request: send,
        })
    }

    async fn run_turn(
        &self,
        session_id: &str,
        turn: u64,
        cancel: CancellationToken,
        prepared: PreparedTurn,
    ) -> TurnOutcome {
        let PreparedTurn {
            tree,
            user_node,
            assistant_node,
            request,
        } = prepared;
        let request_id = request.client_request_id;
        info!(session_id, %request_id, regenerate = request.regenerate, "sending message");

        let mut processor = TurnProcessor::new(session_id, cancel.clone(), tree, user_node, assistant_node);
        let end = match self.transport.send_message(request, cancel.clone()).await {
            Ok(stream) => self.consume(session_id, turn, &cancel, &mut processor, stream).await,
            Err(_) if cancel.is_cancelled() => LoopEnd::Cancelled,
            Err(err) => LoopEnd::from_error(err),
        };

        match end {
            LoopEnd::Closed => {
                let tree = processor.finalize().clone();
                if !self.store.update_tree_unless_cancelled(session_id, &cancel, tree) {
                    return TurnOutcome::Cancelled;
                }
                info!(session_id, %request_id, "turn completed");
                TurnOutcome::Completed
            }
            LoopEnd::Cancelled => {
                debug!(session_id, %request_id, "turn cancelled");
                TurnOutcome::Cancelled
            }
            LoopEnd::Failed { .. } if cancel.is_cancelled() => TurnOutcome::Cancelled,
            LoopEnd::Failed {
                message,
                stack_trace,
                before_ids,
            } => {
                warn!(session_id, %request_id, error = %message, "turn failed");
                let tree = processor.fail(&message, stack_trace).clone();
                if !self.store.update_tree_unless_cancelled(session_id, &cancel, tree) {
                    return TurnOutcome::Cancelled;
                }
                self.store.set_uncaught_error(session_id, Some(message.clone()));
                if before_ids {
                    self.store.set_loading_error(session_id, Some(message.clone()));
                }
                self.surface(Some(session_id), ErrorSurface::Banner, message.clone());
                TurnOutcome::Failed(message)
            }
        }
    }

    async fn consume(
        &self,
        session_id: &str,
        turn: u64,
        cancel: &CancellationToken,
        processor: &mut TurnProcessor,
        stream: PacketStream,
    ) -> LoopEnd {
        let mut fifo = PacketFifo::spawn(stream, cancel.clone(), self.config.packet_buffer);
        let mut hold = DisplayHold::new(self.config.tool_min_display());

        loop {
            let item = match fifo.next().await {
                FifoItem::Item(item) => item,
                FifoItem::Closed => return LoopEnd::Closed,
                FifoItem::Cancelled => return LoopEnd::Cancelled,
                FifoItem::Failed(err) => return LoopEnd::from_error(err),
            };

            match processor.process_item(item) {
                ProcessResult::Continue(effects) => {
                    if !self.apply_effects(session_id, turn, cancel, processor, &effects, &mut hold) {
                        return LoopEnd::Cancelled;
                    }
                }
                ProcessResult::Cancelled => return LoopEnd::Cancelled,
                ProcessResult::Error {
                    message,
                    stack_trace,
                    before_ids,
                } => {
                    return LoopEnd::Failed {
                        message,
                        stack_trace,
                        before_ids,
                    }
                }
            }
        }
    }

    /// Publish what one folded item changed. Returns `false` once the turn
    /// lost the session to a stop.
    fn apply_effects(
        &self,
        session_id: &str,
        turn: u64,
        cancel: &CancellationToken,
        processor: &TurnProcessor,
        effects: &FoldEffects,
        hold: &mut DisplayHold,
    ) -> bool {
        if effects.first_item {
            self.store
                .compare_and_set_chat_state(session_id, turn, ChatState::Loading, ChatState::Streaming);
        }
        if effects.ids_assigned {
            self.store.update_regeneration_state(session_id, None);
        }
        for (old, new) in &effects.rekeyed {
            self.store.remap_selected_node(session_id, *old, *new);
        }
        if effects.tree_changed
            && !self
                .store
                .update_tree_unless_cancelled(session_id, cancel, processor.tree().clone())
        {
            return false;
        }

        if effects.tool_started {
            let entered = [ChatState::Streaming, ChatState::Loading].into_iter().any(|from| {
                self.store
                    .compare_and_set_chat_state(session_id, turn, from, ChatState::ToolBuilding)
            });
            if entered {
                hold.enter();
            }
        } else if effects.answer_started && hold.is_held() {
            match hold.release() {
                Some(remaining) => {
                    defer_transition(
                        self.store.clone(),
                        session_id.to_string(),
                        turn,
                        ChatState::ToolBuilding,
                        ChatState::Streaming,
                        remaining,
                    );
                }
                None => {
                    self.store.compare_and_set_chat_state(
                        session_id,
                        turn,
                        ChatState::ToolBuilding,
                        ChatState::Streaming,
                    );
                }
            }
        }

        if effects.documents_received {
            self.store
                .update_selected_node(session_id, Some(processor.assistant_node()));
        }
        if effects.context_limited {
            self.store.update_can_continue(session_id, true);
        }
        true
    }

    fn maybe_name_session(&self, session_id: &str) {
        let Some(session) = self.store.session(session_id) else {
            return;
        };
        let named = session
            .description
            .as_deref()
            .is_some_and(|description| !description.is_empty());
        if named || session.latest_chain().len() != 2 {
            return;
        }
        if !self.store.mark_naming_requested(session_id) {
            return;
        }

        let store = self.store.clone();
        let transport = std::sync::Arc::clone(&self.transport);
        let delay = self.config.naming_delay();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match transport.name_session(&session_id).await {
                Ok(name) => {
                    debug!(session_id = %session_id, name = %name, "session named");
                    store.set_description(&session_id, Some(name));
                }
                Err(err) => warn!(session_id = %session_id, error = %err, "failed to name session"),
            }
        });
    }
}

/// Close the reply at the end of the latest chain after a stop
fn close_open_reply(tree: &MessageTree) -> MessageTree {
    let chain = tree.latest_chain();
    let Some(last) = chain.last().filter(|node| node.role == MessageRole::Assistant) else {
        return tree.clone();
    };
    tree.update_node(last.id, |node| {
        if node.tool_call.as_ref().is_some_and(|call| call.is_unfinished()) {
            node.tool_call = None;
        }
        if !node.has_stop_packet() {
            let ind = packets::max_ind(&node.packets).map_or(0, |ind| ind + 1);
            node.push_packet(Packet::stop(ind));
        }
        node.is_generating = false;
    })
}
