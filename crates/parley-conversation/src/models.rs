//! Core data models for message nodes, sessions and their transient state

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::packets::Packet;

/// Key of a node inside a [`crate::tree::MessageTree`]
pub type NodeId = i64;

/// Identifier issued by the backend for a persisted message
pub type MessageId = i64;

/// Fixed id of the synthetic root node. Never issued by the backend.
pub const SYSTEM_NODE_ID: NodeId = -3;

/// Citation number keyed by document id
pub type CitationMap = BTreeMap<String, u32>;

/// Role of a message node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Synthetic or backend system root
    System,
    /// User turn
    User,
    /// Assistant reply
    Assistant,
    /// Failed turn shown in place of an assistant reply
    Error,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Error => write!(f, "error"),
        }
    }
}

/// Kind of an attached file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatFileType {
    Image,
    Document,
    PlainText,
    Csv,
    #[serde(other)]
    Other,
}

/// Reference to a file stored by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Backend file id
    pub id: String,
    /// File kind
    #[serde(rename = "type")]
    pub file_type: ChatFileType,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl FileDescriptor {
    /// Descriptor for a generated image
    pub fn image(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_type: ChatFileType::Image,
            name: None,
        }
    }
}

/// A retrieved document attached to an assistant reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub document_id: String,
    #[serde(default)]
    pub semantic_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub blurb: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Record of the tool invoked while producing a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: Value,
    /// `None` while the tool is still running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
}

impl ToolCallRecord {
    /// Start a record for a tool that has not produced a result yet
    pub fn started(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args: Value::Null,
            tool_result: None,
        }
    }

    /// Whether the tool has not reported a result
    pub fn is_unfinished(&self) -> bool {
        self.tool_result.is_none()
    }
}

/// One turn in a conversation tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageNode {
    /// Tree key. Negative for provisional nodes created before the backend answers.
    pub id: NodeId,
    /// Backend id, once assigned
    pub message_id: Option<MessageId>,
    pub role: MessageRole,
    /// Accumulated display text
    pub text: String,
    pub parent_id: Option<NodeId>,
    /// Children in insertion order
    pub children_ids: Vec<NodeId>,
    /// Child on the active branch
    pub latest_child_id: Option<NodeId>,
    /// Raw protocol packets, assistant nodes only
    pub packets: Vec<Packet>,
    pub citations: CitationMap,
    pub documents: Vec<SearchDocument>,
    pub files: Vec<FileDescriptor>,
    pub tool_call: Option<ToolCallRecord>,
    /// Set once the final answer section has been closed
    pub generation_complete: bool,
    /// True while this node is the open target of a stream
    pub is_generating: bool,
    pub overridden_model: Option<String>,
    pub query: Option<String>,
    pub stack_trace: Option<String>,
    pub alternate_assistant_id: Option<i64>,
    pub time_sent: Option<DateTime<Utc>>,
}

impl MessageNode {
    /// Create a detached node with no children
    pub fn new(id: NodeId, role: MessageRole, text: impl Into<String>, parent_id: Option<NodeId>) -> Self {
        Self {
            id,
            message_id: None,
            role,
            text: text.into(),
            parent_id,
            children_ids: Vec::new(),
            latest_child_id: None,
            packets: Vec::new(),
            citations: CitationMap::new(),
            documents: Vec::new(),
            files: Vec::new(),
            tool_call: None,
            generation_complete: false,
            is_generating: false,
            overridden_model: None,
            query: None,
            stack_trace: None,
            alternate_assistant_id: None,
            time_sent: None,
        }
    }

    /// Synthetic root with a single child on the active branch
    pub fn system_root(id: NodeId, first_child: NodeId) -> Self {
        let mut root = Self::new(id, MessageRole::System, "", None);
        root.children_ids.push(first_child);
        root.latest_child_id = Some(first_child);
        root
    }

    /// Attach the backend id
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Attach files
    pub fn with_files(mut self, files: Vec<FileDescriptor>) -> Self {
        self.files = files;
        self
    }

    pub fn is_error(&self) -> bool {
        self.role == MessageRole::Error
    }

    /// Whether any packet in this node is a stop packet
    pub fn has_stop_packet(&self) -> bool {
        crate::packets::is_streaming_complete(&self.packets)
    }

    /// Append a raw packet
    pub fn push_packet(&mut self, packet: Packet) {
        self.packets.push(packet);
    }
}

/// Interaction state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatState {
    /// Ready for a new submit
    #[default]
    Input,
    /// Request sent, no packet seen yet
    Loading,
    /// Packets are arriving
    Streaming,
    /// A tool invocation is being shown
    ToolBuilding,
    /// Files are being attached
    Uploading,
}

impl ChatState {
    /// Whether a request is in flight
    pub fn is_busy(&self) -> bool {
        !matches!(self, ChatState::Input)
    }
}

impl std::fmt::Display for ChatState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChatState::Input => "input",
            ChatState::Loading => "loading",
            ChatState::Streaming => "streaming",
            ChatState::ToolBuilding => "toolBuilding",
            ChatState::Uploading => "uploading",
        };
        f.write_str(name)
    }
}

/// Marks an in-flight regenerate-in-place operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenerationState {
    pub is_regenerating: bool,
    /// Index in the latest chain of the reply being regenerated
    pub target_index: usize,
}

/// Model override sent with a turn
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LlmOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl LlmOverride {
    pub fn model(provider: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            model_provider: Some(provider.into()),
            model_version: Some(version.into()),
            temperature: None,
        }
    }
}
