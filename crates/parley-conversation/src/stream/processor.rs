//! Per-turn fold of stream items into the local message tree
//!
//! The processor owns the turn's local tree. Each item is folded into the
//! open assistant node and the result is handed back to the caller, which
//! decides what to publish. Items are folded strictly in arrival order.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{MessageRole, NodeId};
use crate::packets::{self, MessageResponseIds, Packet, PacketObj, StopReason, StreamItem};
use crate::transport::BackendMessage;
use crate::tree::MessageTree;

/// What folding one item changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldEffects {
    /// The local tree differs from before the item
    pub tree_changed: bool,
    /// This was the first item of the stream
    pub first_item: bool,
    /// Backend ids were recorded
    pub ids_assigned: bool,
    /// Nodes moved from a provisional key to their backend id, as `(old, new)`
    pub rekeyed: Vec<(NodeId, NodeId)>,
    /// A tool invocation began
    pub tool_started: bool,
    /// The final answer began
    pub answer_started: bool,
    /// A search delta carried documents
    pub documents_received: bool,
    /// The reply was cut off by the context window
    pub context_limited: bool,
}

/// Result of processing one stream item
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Keep reading
    Continue(FoldEffects),
    /// The turn's token fired
    Cancelled,
    /// The server reported an error; the turn ends
    Error {
        message: String,
        stack_trace: Option<String>,
        /// Arrived before the id-assignment record
        before_ids: bool,
    },
}

/// Folds one turn's stream into its user/assistant node pair
#[derive(Debug)]
pub struct TurnProcessor {
    session_id: String,
    cancel: CancellationToken,
    tree: MessageTree,
    user_node: NodeId,
    assistant_node: NodeId,
    ids: Option<MessageResponseIds>,
    final_message: Option<BackendMessage>,
    stop_reason: Option<StopReason>,
    items_seen: usize,
}

impl TurnProcessor {
    /// Start folding into `tree`, which must already hold both nodes
    pub fn new(
        session_id: impl Into<String>,
        cancel: CancellationToken,
        tree: MessageTree,
        user_node: NodeId,
        assistant_node: NodeId,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cancel,
            tree,
            user_node,
            assistant_node,
            ids: None,
            final_message: None,
            stop_reason: None,
            items_seen: 0,
        }
    }

    pub fn tree(&self) -> &MessageTree {
        &self.tree
    }

    pub fn user_node(&self) -> NodeId {
        self.user_node
    }

    pub fn assistant_node(&self) -> NodeId {
        self.assistant_node
    }

    pub fn message_ids(&self) -> Option<&MessageResponseIds> {
        self.ids.as_ref()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn final_message(&self) -> Option<&BackendMessage> {
        self.final_message.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fold one item
    pub fn process_item(&mut self, item: StreamItem) -> ProcessResult {
        if self.cancel.is_cancelled() {
            return ProcessResult::Cancelled;
        }

        self.items_seen += 1;
        let mut effects = FoldEffects {
            first_item: self.items_seen == 1,
            ..FoldEffects::default()
        };

        if self.ids.is_none() {
            return match item {
                StreamItem::MessageIds(ids) => {
                    self.record_ids(ids, &mut effects);
                    ProcessResult::Continue(effects)
                }
                StreamItem::Error(error) => ProcessResult::Error {
                    message: error.error,
                    stack_trace: error.stack_trace,
                    before_ids: true,
                },
                other => {
                    warn!(
                        session_id = %self.session_id,
                        item = ?other,
                        "stream item arrived before message ids; skipping"
                    );
                    ProcessResult::Continue(effects)
                }
            };
        }

        match item {
            StreamItem::MessageIds(ids) => {
                debug!(session_id = %self.session_id, "message ids repeated mid-stream");
                self.record_ids(ids, &mut effects);
            }
            StreamItem::Packet(packet) => self.fold_packet(packet, &mut effects),
            StreamItem::Error(error) => {
                return ProcessResult::Error {
                    message: error.error,
                    stack_trace: error.stack_trace,
                    before_ids: false,
                };
            }
            StreamItem::StopInfo(info) => {
                self.stop_reason = Some(info.stop_reason);
                effects.context_limited = info.stop_reason == StopReason::ContextLength;
            }
            StreamItem::Message(message) => {
                self.final_message = Some(*message);
            }
        }
        ProcessResult::Continue(effects)
    }

    fn record_ids(&mut self, ids: MessageResponseIds, effects: &mut FoldEffects) {
        let before = self.tree.clone();
        if let Some(user_message_id) = ids.user_message_id {
            self.tree = self
                .tree
                .update_node(self.user_node, |node| node.message_id = Some(user_message_id));
            self.user_node = self.adopt_backend_id(self.user_node, user_message_id, effects);
        }
        let reserved = ids.reserved_assistant_message_id;
        self.tree = self
            .tree
            .update_node(self.assistant_node, |node| node.message_id = Some(reserved));
        self.assistant_node = self.adopt_backend_id(self.assistant_node, reserved, effects);
        self.ids = Some(ids);
        effects.ids_assigned = true;
        effects.tree_changed = !self.tree.ptr_eq(&before);
    }

    /// Re-key a provisional node under its backend id. The node keeps its
    /// provisional key when another node already holds that id.
    fn adopt_backend_id(&mut self, id: NodeId, message_id: NodeId, effects: &mut FoldEffects) -> NodeId {
        if id == message_id || !self.tree.contains(id) {
            return id;
        }
        if self.tree.contains(message_id) {
            warn!(
                session_id = %self.session_id,
                node_id = id,
                message_id,
                "backend id already taken; keeping provisional key"
            );
            return id;
        }
        self.tree = self.tree.rekey(id, message_id);
        effects.rekeyed.push((id, message_id));
        message_id
    }

    fn fold_packet(&mut self, packet: Packet, effects: &mut FoldEffects) {
        effects.tool_started = packets::is_tool_start(&packet);
        effects.answer_started = packets::is_display_packet(&packet);
        match &packet.obj {
            PacketObj::SearchToolDelta {
                documents: Some(docs),
                ..
            } if !docs.is_empty() => effects.documents_received = true,
            PacketObj::Stop { stop_reason } => {
                if let Some(reason) = stop_reason {
                    self.stop_reason = Some(*reason);
                }
                effects.context_limited = *stop_reason == Some(StopReason::ContextLength);
            }
            _ => {}
        }

        self.tree = self.tree.update_node(self.assistant_node, |node| {
            node.push_packet(packet);
            let derived = packets::derive(&node.packets);
            node.text = derived.text;
            node.citations = derived.citations;
            node.documents = derived.documents;
            node.files = derived.files;
            node.tool_call = derived.tool_call;
            node.generation_complete = derived.generation_complete;
            node.is_generating = true;
        });
        effects.tree_changed = true;
    }

    /// Close the turn normally. Metadata comes from the last full backend
    /// message when one arrived, otherwise from the folded packets.
    pub fn finalize(&mut self) -> &MessageTree {
        let final_message = self.final_message.clone();
        self.tree = self.tree.update_node(self.assistant_node, |node| {
            node.is_generating = false;
            let Some(message) = final_message else {
                return;
            };
            node.message_id = Some(message.message_id);
            if node.text.is_empty() {
                node.text = message.message.clone();
            }
            if let Some(citations) = &message.citations {
                node.citations = citations.clone();
            }
            let documents = message.documents();
            if !documents.is_empty() {
                node.documents = documents;
            }
            if !message.files.is_empty() {
                node.files = message.files.clone();
            }
            if message.tool_call.is_some() {
                node.tool_call = message.tool_call.clone();
            }
            if message.overridden_model.is_some() {
                node.overridden_model = message.overridden_model.clone();
            }
            if message.rephrased_query.is_some() {
                node.query = message.rephrased_query.clone();
            }
            if let Some(time_sent) = message.time_sent.as_deref() {
                node.time_sent = chrono::DateTime::parse_from_rfc3339(time_sent)
                    .ok()
                    .map(|time| time.with_timezone(&chrono::Utc));
            }
        });
        &self.tree
    }

    /// Turn the open reply into an error node carrying `message`.
    /// The user node stays, so the tree ends in a user/error pair.
    pub fn fail(&mut self, message: &str, stack_trace: Option<String>) -> &MessageTree {
        let text = message.to_string();
        self.tree = self.tree.update_node(self.assistant_node, |node| {
            node.role = MessageRole::Error;
            node.text = text;
            node.packets.clear();
            node.citations.clear();
            node.documents.clear();
            node.files.clear();
            node.tool_call = None;
            node.generation_complete = false;
            node.is_generating = false;
            node.stack_trace = stack_trace;
        });
        &self.tree
    }
}
