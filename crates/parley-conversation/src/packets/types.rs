//! Wire shapes of the streamed answer protocol
//!
//! A stream carries [`StreamItem`]s. Most of them are [`Packet`]s: an `ind`
//! grouping related packets (one tool call, one reasoning block, the final
//! answer) plus a typed payload. A few flat records predate the packet
//! envelope and are still sent: the id-assignment record, the error record,
//! the stop-info record and the full backend message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{MessageId, SearchDocument};
use crate::transport::BackendMessage;

/// One streamed protocol event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Section index shared by related packets
    pub ind: i64,
    pub obj: PacketObj,
}

impl Packet {
    pub fn new(ind: i64, obj: PacketObj) -> Self {
        Self { ind, obj }
    }

    /// Discriminant of the payload
    pub fn packet_type(&self) -> PacketType {
        self.obj.packet_type()
    }

    pub fn message_start(ind: i64, content: impl Into<String>) -> Self {
        Self::new(
            ind,
            PacketObj::MessageStart {
                id: None,
                content: content.into(),
                final_documents: None,
            },
        )
    }

    pub fn message_delta(ind: i64, content: impl Into<String>) -> Self {
        Self::new(
            ind,
            PacketObj::MessageDelta {
                content: content.into(),
            },
        )
    }

    pub fn section_end(ind: i64) -> Self {
        Self::new(ind, PacketObj::SectionEnd)
    }

    pub fn stop(ind: i64) -> Self {
        Self::new(ind, PacketObj::Stop { stop_reason: None })
    }
}

/// Why the server ended a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Finished,
    ContextLength,
    Cancelled,
    #[serde(other)]
    Other,
}

/// A generated image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub file_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub revised_prompt: String,
}

/// A single citation emitted while streaming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingCitation {
    pub citation_num: u32,
    pub document_id: String,
}

/// Typed payload of a [`Packet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacketObj {
    MessageStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_documents: Option<Vec<SearchDocument>>,
    },
    MessageDelta {
        content: String,
    },
    MessageEnd,
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
    },
    SectionEnd,
    #[serde(rename = "internal_search_tool_start")]
    SearchToolStart {
        #[serde(default)]
        is_internet_search: bool,
    },
    #[serde(rename = "internal_search_tool_delta")]
    SearchToolDelta {
        #[serde(default)]
        queries: Option<Vec<String>>,
        #[serde(default)]
        documents: Option<Vec<SearchDocument>>,
    },
    ImageGenerationToolStart,
    ImageGenerationToolDelta {
        #[serde(default)]
        images: Vec<GeneratedImage>,
    },
    CustomToolStart {
        tool_name: String,
    },
    CustomToolDelta {
        tool_name: String,
        #[serde(default)]
        response_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_ids: Option<Vec<String>>,
    },
    ReasoningStart,
    ReasoningDelta {
        reasoning: String,
    },
    CitationStart,
    CitationDelta {
        #[serde(default)]
        citations: Vec<StreamingCitation>,
    },
    /// Any type tag this client does not know about
    #[serde(other)]
    Unknown,
}

/// Payload discriminant without data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    MessageStart,
    MessageDelta,
    MessageEnd,
    Stop,
    SectionEnd,
    SearchToolStart,
    SearchToolDelta,
    ImageGenerationToolStart,
    ImageGenerationToolDelta,
    CustomToolStart,
    CustomToolDelta,
    ReasoningStart,
    ReasoningDelta,
    CitationStart,
    CitationDelta,
    Unknown,
}

impl PacketObj {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketObj::MessageStart { .. } => PacketType::MessageStart,
            PacketObj::MessageDelta { .. } => PacketType::MessageDelta,
            PacketObj::MessageEnd => PacketType::MessageEnd,
            PacketObj::Stop { .. } => PacketType::Stop,
            PacketObj::SectionEnd => PacketType::SectionEnd,
            PacketObj::SearchToolStart { .. } => PacketType::SearchToolStart,
            PacketObj::SearchToolDelta { .. } => PacketType::SearchToolDelta,
            PacketObj::ImageGenerationToolStart => PacketType::ImageGenerationToolStart,
            PacketObj::ImageGenerationToolDelta { .. } => PacketType::ImageGenerationToolDelta,
            PacketObj::CustomToolStart { .. } => PacketType::CustomToolStart,
            PacketObj::CustomToolDelta { .. } => PacketType::CustomToolDelta,
            PacketObj::ReasoningStart => PacketType::ReasoningStart,
            PacketObj::ReasoningDelta { .. } => PacketType::ReasoningDelta,
            PacketObj::CitationStart => PacketType::CitationStart,
            PacketObj::CitationDelta { .. } => PacketType::CitationDelta,
            PacketObj::Unknown => PacketType::Unknown,
        }
    }
}

/// Backend ids reserved for the turn, sent before any packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponseIds {
    #[serde(default)]
    pub user_message_id: Option<MessageId>,
    pub reserved_assistant_message_id: MessageId,
}

/// Application-level error reported mid-stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Stop notification outside the packet envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStopInfo {
    pub stop_reason: StopReason,
}

/// Anything the transport may yield
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamItem {
    Packet(Packet),
    MessageIds(MessageResponseIds),
    Error(StreamingError),
    StopInfo(StreamStopInfo),
    Message(Box<BackendMessage>),
}

impl From<Packet> for StreamItem {
    fn from(packet: Packet) -> Self {
        StreamItem::Packet(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_packet_wire_names() {
        let packet: Packet = serde_json::from_value(json!({
            "ind": 2,
            "obj": {"type": "internal_search_tool_delta", "queries": ["rust"], "documents": null}
        }))
        .unwrap();
        assert_eq!(packet.ind, 2);
        assert_eq!(packet.packet_type(), PacketType::SearchToolDelta);

        let encoded = serde_json::to_value(Packet::new(0, PacketObj::ImageGenerationToolStart)).unwrap();
        assert_eq!(encoded["obj"]["type"], "image_generation_tool_start");
    }

    #[test]
    fn test_unknown_type_decodes_to_unknown() {
        let packet: Packet = serde_json::from_value(json!({
            "ind": 1,
            "obj": {"type": "some_future_packet"}
        }))
        .unwrap();
        assert_eq!(packet.obj, PacketObj::Unknown);
    }

    #[test]
    fn test_stream_item_shapes() {
        let ids: StreamItem = serde_json::from_value(json!({
            "user_message_id": 11,
            "reserved_assistant_message_id": 12
        }))
        .unwrap();
        assert_eq!(
            ids,
            StreamItem::MessageIds(MessageResponseIds {
                user_message_id: Some(11),
                reserved_assistant_message_id: 12,
            })
        );

        let error: StreamItem = serde_json::from_value(json!({"error": "boom"})).unwrap();
        assert!(matches!(error, StreamItem::Error(StreamingError { ref error, .. }) if error == "boom"));

        let stop: StreamItem = serde_json::from_value(json!({"stop_reason": "context_length"})).unwrap();
        assert_eq!(
            stop,
            StreamItem::StopInfo(StreamStopInfo {
                stop_reason: StopReason::ContextLength
            })
        );

        let message: StreamItem = serde_json::from_value(json!({
            "message_id": 12,
            "message_type": "assistant",
            "message": "done",
            "parent_message": 11
        }))
        .unwrap();
        assert!(matches!(message, StreamItem::Message(ref m) if m.message_id == 12));
    }
}
