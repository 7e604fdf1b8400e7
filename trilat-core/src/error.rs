//! Error types for the positioning core

use thiserror::Error;

use crate::session::{SessionEvent, SessionState};
use crate::types::AnchorId;

/// Errors from administrative registry operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Unknown anchor: {0}")]
    UnknownAnchor(AnchorId),
}

/// Reasons a solve was not attempted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolveError {
    #[error("Insufficient data: {available} eligible anchors, {required} required")]
    InsufficientAnchors { available: usize, required: usize },
}

/// Errors decoding an inbound frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unrecognized text frame: {0}")]
    UnknownText(String),

    #[error("Empty frame")]
    Empty,
}

/// Invalid use of the per-connection state machine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("No transition from {from:?} on {event}")]
    InvalidTransition {
        from: SessionState,
        event: SessionEvent,
    },
}
