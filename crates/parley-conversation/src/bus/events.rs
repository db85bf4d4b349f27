//! Events published by the session store and the controller

use serde::{Deserialize, Serialize};

use crate::models::ChatState;

/// How a failure should be shown
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSurface {
    /// Transient notification; the session is left untouched
    Popup,
    /// Persistent message attached to the session
    Banner,
}

/// Store and controller notifications
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreEvent {
    /// A session entry was created, lazily or explicitly
    SessionCreated {
        session_id: String,
    },
    /// The session's tree was replaced
    TreeUpdated {
        session_id: String,
    },
    /// The session's interaction state changed
    ChatStateChanged {
        session_id: String,
        from: ChatState,
        to: ChatState,
    },
    /// The session was dropped by eviction
    SessionEvicted {
        session_id: String,
    },
    /// The current session pointer moved
    CurrentChanged {
        session_id: Option<String>,
    },
    /// A failure the user should see
    ErrorSurfaced {
        session_id: Option<String>,
        surface: ErrorSurface,
        message: String,
    },
}

impl StoreEvent {
    /// Session the event is about, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StoreEvent::SessionCreated { session_id }
            | StoreEvent::TreeUpdated { session_id }
            | StoreEvent::ChatStateChanged { session_id, .. }
            | StoreEvent::SessionEvicted { session_id } => Some(session_id),
            StoreEvent::CurrentChanged { session_id } | StoreEvent::ErrorSurfaced { session_id, .. } => {
                session_id.as_deref()
            }
        }
    }
}
