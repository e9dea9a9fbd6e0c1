use thiserror::Error;

use crate::types::PartialBatch;

/// Errors returned by ComfyUI operations.
#[derive(Error, Debug)]
pub enum ComfyError {
    /// The server could not be reached over HTTP or WebSocket.
    #[error("{context}: {reason}")]
    Connection { context: String, reason: String },

    /// The server rejected the queued workflow.
    #[error("ComfyUI rejected the prompt (HTTP {status}): {message}")]
    Submission { status: u16, message: String },

    /// The WebSocket closed before the job's completion message arrived.
    #[error("WebSocket closed before prompt {prompt_id} finished")]
    IncompleteGeneration { prompt_id: String },

    /// One or more fetched images could not be decoded. The images that did
    /// decode are kept in the batch.
    #[error("{} of {} image(s) failed to decode", .0.failures.len(), .0.total())]
    ImageDecode(Box<PartialBatch>),

    /// ComfyUI reported an execution error during generation.
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// Timed out waiting for generation to complete.
    #[error("Generation timed out")]
    Timeout,

    /// ComfyUI returned a non-success HTTP status outside of submission.
    #[error("ComfyUI returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response from ComfyUI was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// The request could not be built from the given prompt and parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComfyError {
    pub(crate) fn connection(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ComfyError::Connection {
            context: context.into(),
            reason: err.to_string(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ComfyError>;
