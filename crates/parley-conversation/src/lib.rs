//! Parley Conversation Engine
//!
//! Maintains a branching tree of chat messages per session, folds a streamed
//! packet protocol into it incrementally, and exposes one linear "latest"
//! view for rendering. Edit, regenerate and resend create sibling branches;
//! the active branch is always selected deterministically.

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod history;
pub mod logging;
pub mod models;
pub mod navigator;
pub mod packets;
pub mod persona;
pub mod selectors;
pub mod session;
pub mod store;
pub mod stream;
pub mod transport;
pub mod tree;

// Re-export commonly used types
pub use bus::{ErrorSurface, EventBus, StoreEvent};
pub use config::{ConfigLoader, EngineConfig};
pub use controller::{ChatController, RegenerateTarget, SubmitRequest, TurnOutcome, CONTINUE_PROMPT};
pub use error::{ConversationError, ConversationResult};
pub use logging::init_logging;
pub use models::{
    ChatFileType, ChatState, CitationMap, FileDescriptor, LlmOverride, MessageId, MessageNode, MessageRole,
    NodeId, RegenerationState, SearchDocument, ToolCallRecord, SYSTEM_NODE_ID,
};
pub use navigator::{
    find_sibling_index, next_sibling, pair_for_last_turn, pair_for_turn, previous_sibling, siblings, TurnPair,
};
pub use packets::{Packet, PacketObj, PacketType, StopReason, StreamItem};
pub use persona::{select_live_assistant, Persona, PersonaChoice};
pub use selectors::{node_view, ConversationView, NodeView, SessionViewState, ToolStatus};
pub use session::Session;
pub use store::SessionStore;
pub use transport::{BackendChatSession, BackendMessage, ChatTransport, PacketStream, PendingUpload, SendMessageRequest};
pub use tree::MessageTree;
