use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which stream a chunk of command output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Lines emitted by the sandbox itself (cancellation notices, timeouts).
    System,
}

/// One ordered chunk of output from a command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub kind: StreamKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputChunk {
    pub fn now(kind: StreamKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Message flowing through a per-execution [`crate::msg_store::MsgStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogMsg {
    Chunk(OutputChunk),
    Finished,
}

impl LogMsg {
    pub fn approx_bytes(&self) -> usize {
        match self {
            LogMsg::Chunk(chunk) => chunk.content.len() + 32,
            LogMsg::Finished => 8,
        }
    }

}
