//! Frame encoding for the push channel.
//!
//! [`JsonLineCodec`] speaks newline-delimited JSON. Each command is one JSON
//! object tagged by `action`. Keepalive frames use the bare words `PING` and
//! `PONG`, or a JSON long form when they carry a timestamp or token.

use serde_json::{Map, Value, json};
use tether_core::{TetherError, TetherResult};

use crate::command::{Command, ConnectRequest, PingPongCommand};

/// Default maximum frame length in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8192;

/// Frames the client writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Connect handshake; first frame on every channel.
    Connect(ConnectRequest),
    /// Application message with a per-channel message id.
    Message {
        /// Message id, starting at 1 on each channel.
        id: u64,
        /// JSON body.
        body: Value,
    },
    /// Keepalive frame.
    PingPong(PingPongCommand),
}

/// Frames the client reads.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Decoded command.
    Command(Command),
    /// Keepalive frame.
    PingPong(PingPongCommand),
}

/// Converts between frames and raw text.
pub trait CommandCodec: Send + Sync {
    /// Encode `frame` to text, without a trailing delimiter.
    ///
    /// # Errors
    /// Returns [`TetherError::Codec`] if the frame cannot be serialized or is too large.
    fn encode(&self, frame: &OutboundFrame) -> TetherResult<String>;

    /// Decode one raw frame.
    ///
    /// # Errors
    /// Returns [`TetherError::Codec`] for oversized, malformed, or unknown frames.
    fn decode(&self, raw: &str) -> TetherResult<InboundFrame>;

    /// Largest frame accepted in either direction.
    fn max_frame_size(&self) -> usize;
}

/// Newline-delimited JSON codec.
#[derive(Debug, Clone)]
pub struct JsonLineCodec {
    max_frame_size: usize,
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl JsonLineCodec {
    /// Create a codec with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame limit.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    fn check_size(&self, len: usize) -> TetherResult<()> {
        if len > self.max_frame_size {
            return Err(TetherError::Codec(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

fn ping_pong_json(command: &PingPongCommand) -> TetherResult<String> {
    let mut value = serde_json::to_value(command).map_err(|e| TetherError::Codec(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.remove("request");
        map.insert(
            "action".into(),
            Value::String(if command.request { "PING" } else { "PONG" }.into()),
        );
    }
    Ok(value.to_string())
}

impl CommandCodec for JsonLineCodec {
    fn encode(&self, frame: &OutboundFrame) -> TetherResult<String> {
        let encoded = match frame {
            OutboundFrame::Connect(request) => {
                let mut value =
                    serde_json::to_value(request).map_err(|e| TetherError::Codec(e.to_string()))?;
                if let Value::Object(map) = &mut value {
                    map.insert("action".into(), Value::String("CONNECT".into()));
                }
                value.to_string()
            }
            OutboundFrame::Message { id, body } => json!({ "messageId": id, "payload": body }).to_string(),
            OutboundFrame::PingPong(command) if !command.is_long_form() => {
                let word = if command.request { "PING" } else { "PONG" };
                word.to_string()
            }
            OutboundFrame::PingPong(command) => ping_pong_json(command)?,
        };
        if encoded.contains('\n') {
            return Err(TetherError::Codec("encoded frame contains a line break".into()));
        }
        self.check_size(encoded.len())?;
        Ok(encoded)
    }

    fn decode(&self, raw: &str) -> TetherResult<InboundFrame> {
        self.check_size(raw.len())?;
        let trimmed = raw.trim();
        match trimmed {
            "PING" => return Ok(InboundFrame::PingPong(PingPongCommand::ping())),
            "PONG" => return Ok(InboundFrame::PingPong(PingPongCommand::pong())),
            "" => return Err(TetherError::Codec("empty frame".into())),
            _ => {}
        }

        let value: Value =
            serde_json::from_str(trimmed).map_err(|e| TetherError::Codec(e.to_string()))?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| TetherError::Codec("frame has no action".into()))?;

        if action == "PING" || action == "PONG" {
            let request = action == "PING";
            let mut map = match value {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            map.remove("action");
            map.insert("request".into(), Value::Bool(request));
            let command: PingPongCommand = serde_json::from_value(Value::Object(map))
                .map_err(|e| TetherError::Codec(e.to_string()))?;
            return Ok(InboundFrame::PingPong(command));
        }

        serde_json::from_value(value)
            .map(InboundFrame::Command)
            .map_err(|e| TetherError::Codec(e.to_string()))
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}
