//! Worker control protocol
//!
//! Messages travel over the control channel as frames: a 4-byte big-endian
//! length followed by that many bytes of UTF-8 JSON. The worker opens with
//! `{"token": "..."}` carrying the run token it was given, then reports phase
//! completion with `{"status": "..."}`. The orchestrator grants the next timed
//! phase with `{"command": "continue"}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Environment variable carrying the control channel address
pub const IPC_ADDR_ENV: &str = "TAV_IPC_ADDR";

/// Environment variable carrying the token a worker presents when it connects
pub const IPC_TOKEN_ENV: &str = "TAV_IPC_TOKEN";

/// Environment variable carrying the module format tag
pub const MODULE_FORMAT_ENV: &str = "TAV_MODULE_FORMAT";

/// Status reported by a worker, decoded once at the channel boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Package installation finished
    InstallComplete,
    /// Test execution finished
    Completed,
    /// Any other status name, passed through
    Other(String),
}

impl WorkerStatus {
    /// Decode a raw status name
    pub fn parse(name: &str) -> Self {
        match name {
            "install" => Self::InstallComplete,
            "completed" => Self::Completed,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire name of this status
    pub fn as_str(&self) -> &str {
        match self {
            Self::InstallComplete => "install",
            Self::Completed => "completed",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First worker → orchestrator message on a new connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub token: String,
}

impl HelloMessage {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Raw worker → orchestrator message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: String,
}

impl StatusMessage {
    pub fn new(status: &WorkerStatus) -> Self {
        Self {
            status: status.as_str().to_string(),
        }
    }

    pub fn decode(&self) -> WorkerStatus {
        WorkerStatus::parse(&self.status)
    }
}

/// Orchestrator → worker command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlCommand {
    /// Proceed to the next timed phase
    Continue,
}

/// Write one frame carrying `message` as JSON
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode it. Returns `None` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
