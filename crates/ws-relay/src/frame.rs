use std::borrow::Cow;

use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

/// Close code for a normal, completed conversation.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent when the client request is unacceptable (missing agent id).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code sent for every relay-side failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// One opaque data frame. Payloads are never parsed; only the text/binary
/// classification travels with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    /// Log-safe summary: the first `limit` characters of a text frame, or
    /// the size of a binary frame.
    pub fn preview(&self, limit: usize) -> String {
        match self {
            Frame::Text(text) => text.chars().take(limit).collect(),
            Frame::Binary(data) => format!("[binary {} bytes]", data.len()),
        }
    }

    /// Convert to the message type written to the client socket.
    pub fn into_client(self) -> ClientMessage {
        match self {
            Frame::Text(text) => ClientMessage::Text(text),
            Frame::Binary(data) => ClientMessage::Binary(data),
        }
    }

    /// Convert to the message type written to the upstream socket.
    pub fn into_upstream(self) -> UpstreamMessage {
        match self {
            Frame::Text(text) => UpstreamMessage::Text(text.into()),
            Frame::Binary(data) => UpstreamMessage::Binary(data.into()),
        }
    }
}

/// What a single read from either socket amounts to once control traffic is
/// separated from data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Frame),
    /// Peer sent a close frame. `None` when it carried no status code.
    Close(Option<CloseSpec>),
    /// Ping, pong and raw frames. The transport answers pings itself.
    Control,
}

impl From<ClientMessage> for Inbound {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Text(text) => Inbound::Data(Frame::Text(text)),
            ClientMessage::Binary(data) => Inbound::Data(Frame::Binary(data)),
            ClientMessage::Close(frame) => Inbound::Close(frame.map(|f| CloseSpec {
                code: f.code,
                reason: f.reason.into_owned(),
            })),
            ClientMessage::Ping(_) | ClientMessage::Pong(_) => Inbound::Control,
        }
    }
}

impl From<UpstreamMessage> for Inbound {
    fn from(msg: UpstreamMessage) -> Self {
        match msg {
            UpstreamMessage::Text(text) => Inbound::Data(Frame::Text(text.as_str().to_owned())),
            UpstreamMessage::Binary(data) => Inbound::Data(Frame::Binary(data.to_vec())),
            UpstreamMessage::Close(frame) => Inbound::Close(frame.map(|f| CloseSpec {
                code: u16::from(f.code),
                reason: f.reason.as_str().to_owned(),
            })),
            UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => {
                Inbound::Control
            }
        }
    }
}

/// Close status code plus reason text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSpec {
    pub code: u16,
    pub reason: String,
}

impl CloseSpec {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Whether `code` may legally appear in a close frame on the wire.
    /// 1005, 1006 and 1015 only ever describe a close locally.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// Close message for the client socket. A reserved code degrades to a
    /// close frame without payload.
    pub fn client_message(close: Option<&CloseSpec>) -> ClientMessage {
        let frame = close
            .filter(|c| Self::is_sendable(c.code))
            .map(|c| ClientCloseFrame {
                code: c.code,
                reason: Cow::Owned(c.reason.clone()),
            });
        ClientMessage::Close(frame)
    }

    /// Close message for the upstream socket.
    pub fn upstream_message(close: Option<&CloseSpec>) -> UpstreamMessage {
        let frame = close
            .filter(|c| Self::is_sendable(c.code))
            .map(|c| UpstreamCloseFrame {
                code: CloseCode::from(c.code),
                reason: c.reason.clone().into(),
            });
        UpstreamMessage::Close(frame)
    }
}

/// JSON notification generated by the relay itself, never forwarded from
/// upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Error { message: String },
    ProxyConnected,
}

impl ControlFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ControlFrame::Error {
            message: message.into(),
        }
    }

    /// Encode as the text frame sent to the client.
    pub fn into_frame(self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(&self).map(Frame::Text)
    }
}
