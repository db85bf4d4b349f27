//! Shared fixtures for the conversation engine integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use parley_conversation::packets::{MessageResponseIds, PacketObj, StreamStopInfo, StreamingError};
use parley_conversation::{
    BackendChatSession, ChatController, ChatFileType, ChatTransport, ConversationError, ConversationResult,
    EngineConfig, FileDescriptor, Packet, PacketStream, PendingUpload, SendMessageRequest, SessionStore,
    StopReason, StreamItem,
};
use tokio_util::sync::CancellationToken;

/// How a scripted stream ends after its items
#[derive(Debug, Clone)]
pub enum TurnEnd {
    /// The stream closes normally
    Close,
    /// The stream stays open until the turn is cancelled
    Hang,
    /// The stream fails with a transport error
    Fail(String),
}

/// Items one `send_message` call yields
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub items: Vec<StreamItem>,
    pub end: TurnEnd,
}

impl ScriptedTurn {
    pub fn new(items: Vec<StreamItem>) -> Self {
        Self {
            items,
            end: TurnEnd::Close,
        }
    }

    pub fn hanging(items: Vec<StreamItem>) -> Self {
        Self {
            items,
            end: TurnEnd::Hang,
        }
    }

    pub fn failing(items: Vec<StreamItem>, message: &str) -> Self {
        Self {
            items,
            end: TurnEnd::Fail(message.to_string()),
        }
    }
}

/// In-memory backend that replays scripted turns and records what it was asked
#[derive(Default)]
pub struct ScriptedTransport {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<SendMessageRequest>>,
    stored: Mutex<HashMap<String, BackendChatSession>>,
    title: Mutex<Option<String>>,
    upload_failure: Mutex<Option<String>>,
    created: AtomicUsize,
    name_calls: AtomicUsize,
    upload_calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn store_session(&self, session: BackendChatSession) {
        self.stored
            .lock()
            .insert(session.chat_session_id.clone(), session);
    }

    pub fn set_title(&self, title: &str) {
        *self.title.lock() = Some(title.to_string());
    }

    pub fn fail_uploads(&self, message: &str) {
        *self.upload_failure.lock() = Some(message.to_string());
    }

    pub fn requests(&self) -> Vec<SendMessageRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<SendMessageRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn name_calls(&self) -> usize {
        self.name_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send_message(
        &self,
        request: SendMessageRequest,
        _cancel: CancellationToken,
    ) -> ConversationResult<PacketStream> {
        self.requests.lock().push(request);
        let turn = self
            .turns
            .lock()
            .pop_front()
            .ok_or_else(|| ConversationError::transport("no scripted turn left"))?;

        let items = stream::iter(turn.items.into_iter().map(Ok));
        let stream: PacketStream = match turn.end {
            TurnEnd::Close => items.boxed(),
            TurnEnd::Hang => items.chain(stream::pending()).boxed(),
            TurnEnd::Fail(message) => items
                .chain(stream::once(async move { Err(ConversationError::transport(message)) }))
                .boxed(),
        };
        Ok(stream)
    }

    async fn fetch_session(&self, session_id: &str) -> ConversationResult<BackendChatSession> {
        self.stored
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ConversationError::transport(format!("unknown session {session_id}")))
    }

    async fn create_session(&self, _persona_id: Option<i64>, _description: &str) -> ConversationResult<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("created-{n}"))
    }

    async fn name_session(&self, session_id: &str) -> ConversationResult<String> {
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        self.title
            .lock()
            .clone()
            .ok_or_else(|| ConversationError::transport(format!("no title for {session_id}")))
    }

    async fn upload_files(&self, files: Vec<PendingUpload>) -> ConversationResult<Vec<FileDescriptor>> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.upload_failure.lock().clone() {
            return Err(ConversationError::transport(message));
        }
        Ok(files
            .into_iter()
            .enumerate()
            .map(|(i, file)| FileDescriptor {
                id: format!("file-{i}"),
                file_type: ChatFileType::Document,
                name: Some(file.name),
            })
            .collect())
    }
}

/// Config with no naming delay and a short tool display minimum
pub fn test_config() -> EngineConfig {
    EngineConfig {
        naming_delay_ms: 0,
        tool_min_display_ms: 50,
        ..EngineConfig::default()
    }
}

pub fn controller(transport: Arc<ScriptedTransport>) -> ChatController {
    ChatController::new(SessionStore::new(), transport, test_config())
}

pub fn ids(user: i64, assistant: i64) -> StreamItem {
    StreamItem::MessageIds(MessageResponseIds {
        user_message_id: Some(user),
        reserved_assistant_message_id: assistant,
    })
}

/// Id record without a user id, as sent for a regenerated reply
pub fn assistant_ids(assistant: i64) -> StreamItem {
    StreamItem::MessageIds(MessageResponseIds {
        user_message_id: None,
        reserved_assistant_message_id: assistant,
    })
}

pub fn packet(packet: Packet) -> StreamItem {
    StreamItem::Packet(packet)
}

pub fn error(message: &str) -> StreamItem {
    StreamItem::Error(StreamingError {
        error: message.to_string(),
        stack_trace: None,
    })
}

pub fn stop_info(reason: StopReason) -> StreamItem {
    StreamItem::StopInfo(StreamStopInfo { stop_reason: reason })
}

pub fn search_start(ind: i64) -> StreamItem {
    packet(Packet::new(
        ind,
        PacketObj::SearchToolStart {
            is_internet_search: false,
        },
    ))
}

/// A complete answer: ids, then `text` split into a start and one delta, then a stop
pub fn reply(user: i64, assistant: i64, text: &str) -> ScriptedTurn {
    let (head, tail) = text.split_at(text.len() / 2);
    ScriptedTurn::new(vec![
        ids(user, assistant),
        packet(Packet::message_start(0, head)),
        packet(Packet::message_delta(0, tail)),
        packet(Packet::section_end(0)),
        packet(Packet::stop(1)),
    ])
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
