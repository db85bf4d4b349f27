//! Error types for the conversation engine

use thiserror::Error;

use crate::models::ChatState;

/// Result alias used throughout the crate
pub type ConversationResult<T> = std::result::Result<T, ConversationError>;

/// Errors that can occur while driving conversations
#[derive(Debug, Error)]
pub enum ConversationError {
    /// Session is not present in the registry
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Node is not present in the message tree
    #[error("Message node not found: {0}")]
    NodeNotFound(i64),

    /// A submit arrived while a previous request is still in flight
    #[error("{}", busy_message(.state))]
    Busy { state: ChatState },

    /// The message targeted by a resend or edit is not in the visible history
    #[error("Failed to re-send message - please refresh the page and try again.")]
    ResendTargetNotFound(i64),

    /// Network or transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Application-level error reported by the server mid-stream
    #[error("{message}")]
    Protocol {
        message: String,
        stack_trace: Option<String>,
    },

    /// The request was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn busy_message(state: &ChatState) -> &'static str {
    match state {
        ChatState::Uploading => "Please wait for the content to upload",
        _ => "Please wait for the response to complete",
    }
}

impl ConversationError {
    /// Create a transport error with context
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a protocol error from a server error packet
    pub fn protocol(message: impl Into<String>, stack_trace: Option<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            stack_trace,
        }
    }

    /// Aborts are a normal termination path, not a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Text shown to the user in the error node or banner
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(msg) => msg.clone(),
            Self::Protocol { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Stack trace attached by the server, if any
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Self::Protocol { stack_trace, .. } => stack_trace.as_deref(),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for ConversationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for ConversationError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_message_depends_on_state() {
        let uploading = ConversationError::Busy {
            state: ChatState::Uploading,
        };
        let streaming = ConversationError::Busy {
            state: ChatState::Streaming,
        };
        assert_eq!(uploading.to_string(), "Please wait for the content to upload");
        assert_eq!(
            streaming.to_string(),
            "Please wait for the response to complete"
        );
    }

    #[test]
    fn test_protocol_error_keeps_server_text() {
        let err = ConversationError::protocol("model overloaded", Some("trace".to_string()));
        assert_eq!(err.user_message(), "model overloaded");
        assert_eq!(err.stack_trace(), Some("trace"));
        assert!(!err.is_cancellation());
        assert!(ConversationError::Cancelled.is_cancellation());
    }
}
