//! Session tokens and the wait for a job's completion message.
//!
//! ComfyUI pushes JSON text frames to every socket opened with
//! `/ws?clientId=<token>`. Frames for the job we submitted carry its
//! `prompt_id`; everything else is noise for this call.

use std::fmt;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ComfyError, Result};
use crate::types::ProgressUpdate;

/// Client-chosen id that scopes one WebSocket and one submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh random (v4) token.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decoded WebSocket frame from ComfyUI.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Status {
        queue_remaining: Option<u64>,
    },
    Progress {
        prompt_id: Option<String>,
        value: u32,
        max: u32,
    },
    /// `node: None` marks the end of the prompt's execution, sent after the
    /// history entry has been written.
    Executing {
        prompt_id: Option<String>,
        node: Option<String>,
    },
    ExecutionCached {
        prompt_id: Option<String>,
        nodes: Vec<String>,
    },
    /// Sent before the history entry exists; not a completion signal.
    ExecutionSuccess {
        prompt_id: Option<String>,
    },
    ExecutionError {
        prompt_id: Option<String>,
        message: String,
    },
    Other(String),
}

fn str_field(data: Option<&Value>, key: &str) -> Option<String> {
    data.and_then(|d| d.get(key))
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Integer field clamped to `u32`.
fn u32_field(data: Option<&Value>, key: &str) -> Option<u32> {
    data.and_then(|d| d.get(key))
        .and_then(|v| v.as_u64())
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

impl ServerMessage {
    /// Parse a text frame. Returns `None` for anything that is not a JSON
    /// object with a string `type`.
    pub fn parse(text: &str) -> Option<Self> {
        let json: Value = serde_json::from_str(text).ok()?;
        let msg_type = json.get("type")?.as_str()?;
        let data = json.get("data");
        let prompt_id = str_field(data, "prompt_id");

        let msg = match msg_type {
            "status" => ServerMessage::Status {
                queue_remaining: data
                    .and_then(|d| d.pointer("/status/exec_info/queue_remaining"))
                    .and_then(|v| v.as_u64()),
            },
            "progress" => ServerMessage::Progress {
                prompt_id,
                value: u32_field(data, "value").unwrap_or(0),
                max: u32_field(data, "max").unwrap_or(1),
            },
            "executing" => ServerMessage::Executing {
                prompt_id,
                node: str_field(data, "node"),
            },
            "execution_cached" => ServerMessage::ExecutionCached {
                prompt_id,
                nodes: data
                    .and_then(|d| d.get("nodes"))
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "execution_success" => ServerMessage::ExecutionSuccess { prompt_id },
            "execution_error" => ServerMessage::ExecutionError {
                prompt_id,
                message: str_field(data, "exception_message")
                    .unwrap_or_else(|| "Unknown error".to_string()),
            },
            other => ServerMessage::Other(other.to_string()),
        };
        Some(msg)
    }

    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Progress { prompt_id, .. }
            | ServerMessage::Executing { prompt_id, .. }
            | ServerMessage::ExecutionCached { prompt_id, .. }
            | ServerMessage::ExecutionSuccess { prompt_id }
            | ServerMessage::ExecutionError { prompt_id, .. } => prompt_id.as_deref(),
            ServerMessage::Status { .. } | ServerMessage::Other(_) => None,
        }
    }

    /// True for `executing` with `node: null`, for any prompt.
    pub fn is_completion(&self) -> bool {
        matches!(self, ServerMessage::Executing { node: None, .. })
    }
}

/// Read frames until the completion message for `prompt_id` arrives.
///
/// Progress frames for this prompt are passed to `on_progress`. Frames for
/// other prompts, including late completions of earlier jobs, are skipped.
/// The stream ending, a close frame or a transport error before completion
/// yields [`ComfyError::IncompleteGeneration`].
pub async fn wait_for_completion<S, E, F>(
    stream: &mut S,
    prompt_id: &str,
    mut on_progress: F,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: fmt::Display,
    F: FnMut(ProgressUpdate),
{
    let incomplete = || ComfyError::IncompleteGeneration {
        prompt_id: prompt_id.to_string(),
    };

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!(prompt_id, "server closed the WebSocket");
                return Err(incomplete());
            }
            // Binary frames are latent previews.
            Ok(_) => continue,
            Err(e) => {
                warn!(prompt_id, error = %e, "WebSocket read failed");
                return Err(incomplete());
            }
        };

        let Some(msg) = ServerMessage::parse(&text) else {
            debug!("skipping unparsable frame");
            continue;
        };

        match msg.prompt_id() {
            Some(pid) if pid != prompt_id => {
                if msg.is_completion() {
                    debug!(stale_prompt_id = pid, "ignoring completion for another prompt");
                }
                continue;
            }
            _ => {}
        }

        match msg {
            ServerMessage::Progress { value, max, .. } => {
                info!(prompt_id, "step {} of {}", value, max);
                on_progress(ProgressUpdate {
                    current_step: value,
                    total_steps: max,
                });
            }
            ServerMessage::Executing { node: Some(node), .. } => {
                debug!(prompt_id, node = %node, "executing node");
            }
            ServerMessage::ExecutionCached { nodes, .. } if !nodes.is_empty() => {
                debug!(prompt_id, cached = nodes.len(), "nodes served from cache");
            }
            ServerMessage::ExecutionSuccess { .. } => {
                debug!(prompt_id, "execution succeeded, waiting for history");
            }
            ServerMessage::ExecutionError { message, .. } => {
                return Err(ComfyError::GenerationFailed(message));
            }
            // A completion without a prompt id cannot be attributed.
            ref m if m.is_completion() && m.prompt_id() == Some(prompt_id) => {
                info!(prompt_id, "execution complete");
                return Ok(());
            }
            _ => {}
        }
    }

    debug!(prompt_id, "WebSocket stream ended");
    Err(incomplete())
}
