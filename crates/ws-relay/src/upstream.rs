use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::SetupError;
use crate::signed_url::SignedUrlClient;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type UpstreamSink = SplitSink<UpstreamSocket, Message>;
pub type UpstreamStream = SplitStream<UpstreamSocket>;

/// Opens the authenticated upstream socket for one session: fetch a signed
/// URL, then connect to it.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    signed_url: SignedUrlClient,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(signed_url: SignedUrlClient, connect_timeout: Duration) -> Self {
        Self {
            signed_url,
            connect_timeout,
        }
    }

    /// Run the full handshake. The connect starts as soon as the signed URL
    /// arrives.
    pub async fn establish(
        &self,
        agent_id: &str,
        api_key: &str,
    ) -> Result<(UpstreamSink, UpstreamStream), SetupError> {
        let url = self.signed_url.fetch(agent_id, api_key).await?;
        // The signed URL embeds a token; keep it out of the logs.
        tracing::info!(%agent_id, "got signed URL, connecting upstream");

        let socket = self.connect(&url).await?;
        Ok(socket.split())
    }

    /// Connect to an already signed URL, bounded by the connect timeout.
    pub async fn connect(&self, url: &str) -> Result<UpstreamSocket, SetupError> {
        match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
        {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(err)) => Err(SetupError::Connect(err)),
            Err(_) => Err(SetupError::ConnectTimeout(self.connect_timeout)),
        }
    }
}
