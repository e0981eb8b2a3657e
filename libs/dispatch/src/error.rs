//! Dispatch errors
//!
//! Two families live here. Setup errors (duplicate router, bad pool
//! configuration) are returned from initialization and must be escalated by
//! the caller. Everything else is a per-task condition that is logged and
//! never stops a worker.

use crate::router::MsgId;
use std::any::Any;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A second router was registered for the same message id
    #[error("Duplicate router for msg_id {msg_id}")]
    DuplicateRouter { msg_id: MsgId },

    /// No router is registered for the message id
    #[error("Router not found for msg_id {msg_id}")]
    RouteNotFound { msg_id: MsgId },

    /// A router stage returned an error
    #[error("Handler error in {stage} for msg_id {msg_id}: {message}")]
    Handler {
        msg_id: MsgId,
        stage: &'static str,
        message: String,
    },

    /// A handler or function task panicked; the panic was contained
    #[error("Task panicked (msg_id {msg_id:?}): {reason}")]
    Panicked {
        msg_id: Option<MsgId>,
        reason: String,
    },

    /// The task has no session to reply on
    #[error("No session to reply on for msg_id {msg_id}")]
    NoSession { msg_id: MsgId },

    /// Writing a reply to the originating session failed
    #[error("Reply to conn {conn_id} failed: {message}")]
    Reply { conn_id: u64, message: String },

    /// The worker pool has stopped and no longer accepts jobs
    #[error("Task queue closed")]
    QueueClosed,

    /// Invalid worker pool configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DispatchError {
    pub fn handler(msg_id: MsgId, stage: &'static str, err: anyhow::Error) -> Self {
        Self::Handler {
            msg_id,
            stage,
            message: format!("{:#}", err),
        }
    }

    pub fn panicked(msg_id: Option<MsgId>, payload: &(dyn Any + Send)) -> Self {
        Self::Panicked {
            msg_id,
            reason: panic_message(payload),
        }
    }

    /// Errors that mean the process was wired up wrong and must not start
    pub fn is_setup_error(&self) -> bool {
        matches!(self, Self::DuplicateRouter { .. } | Self::Configuration(_))
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
