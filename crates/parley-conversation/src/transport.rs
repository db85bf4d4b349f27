//! Boundary to the chat backend
//!
//! The controller only talks to the backend through [`ChatTransport`]. The
//! wire formats (HTTP, SSE, newline-delimited JSON) are the implementor's
//! business; this module fixes the request and record shapes they carry.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ConversationResult;
use crate::models::{CitationMap, FileDescriptor, LlmOverride, MessageId, MessageRole, SearchDocument, ToolCallRecord};
use crate::packets::{Packet, StreamItem};

/// Items yielded for one turn, in arrival order
pub type PacketStream = BoxStream<'static, ConversationResult<StreamItem>>;

/// Everything the backend needs to run one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub session_id: String,
    /// Backend id of the node the new user message hangs under. `None` starts at the root.
    pub parent_message_id: Option<MessageId>,
    pub message: String,
    #[serde(default)]
    pub file_descriptors: Vec<FileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_override: Option<LlmOverride>,
    /// Produce a new reply for an existing user message
    #[serde(default)]
    pub regenerate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_assistant_id: Option<i64>,
    #[serde(default)]
    pub use_existing_user_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_override: Option<String>,
    #[serde(default)]
    pub force_search: bool,
    /// Correlates log lines for one turn
    pub client_request_id: Uuid,
}

impl SendMessageRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            parent_message_id: None,
            message: message.into(),
            file_descriptors: Vec::new(),
            filters: None,
            llm_override: None,
            regenerate: false,
            alternate_assistant_id: None,
            use_existing_user_message: false,
            query_override: None,
            force_search: false,
            client_request_id: Uuid::new_v4(),
        }
    }
}

/// Documents the backend retrieved for a reply
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextDocs {
    #[serde(default)]
    pub top_documents: Vec<SearchDocument>,
}

/// A persisted message as the backend reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMessage {
    pub message_id: MessageId,
    #[serde(default = "default_role")]
    pub message_type: MessageRole,
    #[serde(default)]
    pub parent_message: Option<MessageId>,
    #[serde(default)]
    pub latest_child_message: Option<MessageId>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub rephrased_query: Option<String>,
    #[serde(default)]
    pub context_docs: Option<ContextDocs>,
    /// RFC 3339 timestamp
    #[serde(default)]
    pub time_sent: Option<String>,
    #[serde(default)]
    pub overridden_model: Option<String>,
    #[serde(default)]
    pub alternate_assistant_id: Option<i64>,
    #[serde(default)]
    pub citations: Option<CitationMap>,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(default)]
    pub tool_call: Option<ToolCallRecord>,
    #[serde(default)]
    pub current_feedback: Option<String>,
}

fn default_role() -> MessageRole {
    MessageRole::Assistant
}

impl BackendMessage {
    pub fn new(message_id: MessageId, message_type: MessageRole, message: impl Into<String>) -> Self {
        Self {
            message_id,
            message_type,
            parent_message: None,
            latest_child_message: None,
            message: message.into(),
            rephrased_query: None,
            context_docs: None,
            time_sent: None,
            overridden_model: None,
            alternate_assistant_id: None,
            citations: None,
            files: Vec::new(),
            tool_call: None,
            current_feedback: None,
        }
    }

    pub fn with_parent(mut self, parent: MessageId) -> Self {
        self.parent_message = Some(parent);
        self
    }

    pub fn documents(&self) -> Vec<SearchDocument> {
        self.context_docs
            .as_ref()
            .map(|docs| docs.top_documents.clone())
            .unwrap_or_default()
    }
}

/// A stored session with its full history
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackendChatSession {
    pub chat_session_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub persona_id: Option<i64>,
    #[serde(default)]
    pub messages: Vec<BackendMessage>,
    /// Packet lists of the assistant messages, in the order they appear in `messages`
    #[serde(default)]
    pub packets: Vec<Vec<Packet>>,
}

/// A file the user wants to attach before it has a backend id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Backend operations the conversation engine depends on
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Start a turn. The returned stream ends when the backend closes it.
    async fn send_message(
        &self,
        request: SendMessageRequest,
        cancel: CancellationToken,
    ) -> ConversationResult<PacketStream>;

    /// Load a stored session and its messages
    async fn fetch_session(&self, session_id: &str) -> ConversationResult<BackendChatSession>;

    /// Create an empty session and return its id
    async fn create_session(&self, persona_id: Option<i64>, description: &str) -> ConversationResult<String>;

    /// Ask the backend to generate a title. Returns the new description.
    async fn name_session(&self, session_id: &str) -> ConversationResult<String>;

    /// Store files and return their descriptors
    async fn upload_files(&self, files: Vec<PendingUpload>) -> ConversationResult<Vec<FileDescriptor>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_message_defaults() {
        let message: BackendMessage = serde_json::from_value(json!({"message_id": 4})).unwrap();
        assert_eq!(message.message_type, MessageRole::Assistant);
        assert!(message.documents().is_empty());
        assert!(message.files.is_empty());
    }

    #[test]
    fn test_request_omits_unset_fields() {
        let request = SendMessageRequest::new("s1", "hello");
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["session_id"], "s1");
        assert!(encoded.get("llm_override").is_none());
        assert_eq!(encoded["regenerate"], false);
    }
}
