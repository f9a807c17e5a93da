use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::frame::{CloseSpec, ControlFrame, CLOSE_INTERNAL_ERROR};

/// Message sent to the client when the upstream socket fails.
pub const UPSTREAM_ERROR_MESSAGE: &str = "ElevenLabs connection error";

/// Failures between accepting a client and having an open upstream socket.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The signed-URL endpoint answered with a non-success status.
    #[error("signed URL request rejected with HTTP {status}")]
    AuthFailed { status: u16, body: String },

    #[error("signed URL request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("signed URL request timed out after {}s", .0.as_secs_f32())]
    FetchTimeout(Duration),

    #[error("malformed signed URL response: {0}")]
    MalformedResponse(String),

    #[error("upstream connect timed out after {}s", .0.as_secs_f32())]
    ConnectTimeout(Duration),

    /// The upstream refused the socket or failed the handshake.
    #[error("upstream connect failed: {0}")]
    Connect(#[source] tungstenite::Error),
}

impl SetupError {
    /// The error notification and close status delivered to the client.
    pub fn client_notice(&self) -> (ControlFrame, CloseSpec) {
        match self {
            SetupError::AuthFailed { status, .. } => (
                ControlFrame::error(format!("Auth failed: {status}")),
                CloseSpec::new(CLOSE_INTERNAL_ERROR, "Auth failed"),
            ),
            SetupError::Connect(_) => upstream_error_notice(),
            other => (
                ControlFrame::error(format!("Setup failed: {other}")),
                CloseSpec::new(CLOSE_INTERNAL_ERROR, "Setup failed"),
            ),
        }
    }
}

/// Notice for a transport error on the upstream socket.
pub fn upstream_error_notice() -> (ControlFrame, CloseSpec) {
    (
        ControlFrame::error(UPSTREAM_ERROR_MESSAGE),
        CloseSpec::new(CLOSE_INTERNAL_ERROR, "Upstream error"),
    )
}

/// Errors that stop the proxy server itself.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
