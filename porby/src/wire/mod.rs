//! Wire protocol codec. Every message is a tagged object with a `type`
//! field and, where applicable, a `payload`; frames travel as WebSocket
//! binary opcodes carrying the textual encoding. Unknown `type` values are
//! a hard, connection-scoped error; unknown fields inside a known type are
//! ignored for forward compatibility.


use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{Handshake, LogEntry, LogLevel};

#[derive(Debug, Error)]
pub enum CodecError {
  #[error("encode failed: {0}")]
  Encode(#[source] serde_json::Error),
  #[error("decode failed: {0}")]
  Decode(#[source] serde_json::Error),
}

/// Remote commands a viewer may issue once authorized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "camelCase")]
pub enum Command {
  SetLogLevel { level: LogLevel },
  SetCategoryLevel { category: String, level: LogLevel },
  SetEnabled { enabled: bool, category: Option<String> },
  ClearLogs,
  RequestPerformanceSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
  pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
  pub accepted: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum WireMessage {
  Handshake(Handshake),
  Log(Box<LogEntry>),
  LogBatch(Vec<LogEntry>),
  LogReplay(Vec<LogEntry>),
  Ping,
  Pong,
  Command(Command),
  PairingRequest(PairingRequest),
  PairingResponse(PairingResponse),
}

impl WireMessage {
  /// Picks `log` for a single entry, `logBatch` otherwise.
  pub fn for_entries(mut entries: Vec<LogEntry>) -> WireMessage {
    if entries.len() == 1 {
      WireMessage::Log(Box::new(entries.remove(0)))
    } else {
      WireMessage::LogBatch(entries)
    }
  }

  pub fn pairing_accepted() -> WireMessage {
    WireMessage::PairingResponse(PairingResponse {
      accepted: true,
      reason: None,
    })
  }

  pub fn pairing_rejected(reason: impl Into<String>) -> WireMessage {
    WireMessage::PairingResponse(PairingResponse {
      accepted: false,
      reason: Some(reason.into()),
    })
  }
}

pub fn encode(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
  serde_json::to_vec(message).map_err(CodecError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<WireMessage, CodecError> {
  serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
