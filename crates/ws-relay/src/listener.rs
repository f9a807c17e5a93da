use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ProxyError;
use crate::frame::{CloseSpec, ControlFrame, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};
use crate::session::RelaySession;
use crate::signed_url::{SignedUrlClient, DEFAULT_SIGNED_URL_ENDPOINT};
use crate::upstream::UpstreamConnector;

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Name reported by the health endpoint.
    pub service_name: String,
    /// Upstream API key. `None` (or empty) keeps the server up but rejects
    /// every relay connection.
    pub api_key: Option<String>,
    /// URL of the signed-URL issuing endpoint.
    pub signed_url_endpoint: String,
    /// Bound on the signed-URL HTTP request.
    pub fetch_timeout: Duration,
    /// Bound on the upstream WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            service_name: "elevenlabs-ws-proxy".to_string(),
            api_key: None,
            signed_url_endpoint: DEFAULT_SIGNED_URL_ENDPOINT.to_string(),
            fetch_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    /// The API key, if one is set and non-empty.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.is_empty())
    }
}

/// Body of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
    pub api_key_configured: bool,
}

#[derive(Clone)]
struct AppState {
    config: Arc<ProxyConfig>,
    connector: UpstreamConnector,
}

/// The relay server.
///
/// Every path on the listening port serves two things: WebSocket upgrade
/// requests become relay sessions, any other request gets the health JSON.
pub struct Proxy {
    state: AppState,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let signed_url =
            SignedUrlClient::new(config.signed_url_endpoint.clone(), config.fetch_timeout)?;
        let connector = UpstreamConnector::new(signed_url, config.connect_timeout);
        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                connector,
            },
        })
    }

    /// Bind `listen_addr` and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            api_key_configured = self.state.config.api_key().is_some(),
            "ws-relay listening"
        );

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        tracing::info!(%addr, "ws-relay stopped");
        Ok(())
    }

    fn router(&self) -> Router {
        Router::new()
            .fallback(entry)
            .layer(CorsLayer::new().allow_origin(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

async fn entry(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<Vec<(String, String)>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(ws) => {
            let agent_id = first_param(params, "agent_id");
            ws.on_upgrade(move |socket| handle_connection(socket, state, agent_id, remote_addr))
                .into_response()
        }
        None => Json(health(&state.config)).into_response(),
    }
}

/// First value of `name` in the query string. Repeated keys never reject
/// the request.
fn first_param(params: Vec<(String, String)>, name: &str) -> Option<String> {
    params
        .into_iter()
        .find_map(|(key, value)| (key == name).then_some(value))
}

fn health(config: &ProxyConfig) -> HealthStatus {

    HealthStatus {
        status: "ok".to_string(),
        service: config.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_key_configured: config.api_key().is_some(),
    }
}

/// Validate an upgraded client socket and hand it to a relay session.
async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    agent_id: Option<String>,
    remote_addr: SocketAddr,
) {
    let session_id = uuid::Uuid::new_v4();
    let (mut client_tx, client_rx) = socket.split();

    let Some(agent_id) = agent_id.filter(|id| !id.is_empty()) else {
        tracing::warn!(%session_id, %remote_addr, "rejected connection without agent_id");
        reject(
            &mut client_tx,
            ControlFrame::error("Missing agent_id"),
            CloseSpec::new(CLOSE_POLICY_VIOLATION, "Missing agent_id"),
        )
        .await;
        return;
    };

    let Some(api_key) = state.config.api_key().map(str::to_owned) else {
        tracing::error!(%session_id, %remote_addr, %agent_id, "rejected connection: API key not configured");
        reject(
            &mut client_tx,
            ControlFrame::error("API key not configured"),
            CloseSpec::new(CLOSE_INTERNAL_ERROR, "No API key"),
        )
        .await;
        return;
    };

    tracing::info!(%session_id, %remote_addr, %agent_id, "new connection");

    let connector = state.connector.clone();
    let setup_agent_id = agent_id.clone();
    let setup = async move { connector.establish(&setup_agent_id, &api_key).await };

    RelaySession::new(session_id, agent_id)
        .run(client_tx, client_rx, setup)
        .await;
}

async fn reject(
    client_tx: &mut SplitSink<WebSocket, Message>,
    notice: ControlFrame,
    close: CloseSpec,
) {
    match notice.into_frame() {
        Ok(frame) => {
            let _ = client_tx.send(frame.into_client()).await;
        }
        Err(err) => tracing::warn!(%err, "failed to encode control frame"),
    }
    let _ = client_tx.send(CloseSpec::client_message(Some(&close))).await;
    let _ = client_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_deployment() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.service_name, "elevenlabs-ws-proxy");
        assert_eq!(config.signed_url_endpoint, DEFAULT_SIGNED_URL_ENDPOINT);
        assert!(config.api_key().is_none());
    }

    #[test]
    fn empty_api_key_counts_as_unset() {
        let config = ProxyConfig {
            api_key: Some(String::new()),
            ..ProxyConfig::default()
        };
        assert!(config.api_key().is_none());
        assert!(!health(&config).api_key_configured);
    }

    #[test]
    fn first_agent_id_wins_over_repeats() {
        let params = vec![
            ("lang".to_string(), "en".to_string()),
            ("agent_id".to_string(), "agent_a".to_string()),
            ("agent_id".to_string(), "agent_b".to_string()),
        ];
        assert_eq!(first_param(params, "agent_id").as_deref(), Some("agent_a"));
        assert_eq!(first_param(Vec::new(), "agent_id"), None);
    }

    #[test]
    fn health_reports_key_and_version() {
        let config = ProxyConfig {
            api_key: Some("sk-live".to_string()),
            service_name: "relay-staging".to_string(),
            ..ProxyConfig::default()
        };
        let status = health(&config);
        assert_eq!(status.status, "ok");
        assert_eq!(status.service, "relay-staging");
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
        assert!(status.api_key_configured);
    }
}
