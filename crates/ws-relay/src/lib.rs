//! Authenticating WebSocket relay for real-time voice agents.
//!
//! Browser clients connect here with an `agent_id`; the relay trades that id
//! plus a server-held API key for a short-lived signed URL, opens the
//! upstream conversation socket on the client's behalf, and then forwards
//! frames in both directions until either side goes away. The API key never
//! reaches the client.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  ws-relay  <--WS-->  voice-agent service
//!                      |
//!               [signed-URL GET]
//! ```
//!
//! Each accepted socket becomes one [`RelaySession`]. Client frames that
//! arrive before the upstream is open are held in a [`PreOpenBuffer`] and
//! flushed in order the moment it opens. Text and binary frames keep their
//! classification in both directions; payloads are never inspected.

pub mod buffer;
pub mod error;
pub mod frame;
pub mod listener;
pub mod session;
pub mod signed_url;
pub mod upstream;

// Re-export the primary public types at the crate root for convenience.
pub use buffer::PreOpenBuffer;
pub use error::{ProxyError, SetupError};
pub use frame::{CloseSpec, ControlFrame, Frame};
pub use listener::{HealthStatus, Proxy, ProxyConfig};
pub use session::{RelaySession, RelayStats, RelaySummary, SessionPhase};
pub use signed_url::{SignedUrlClient, DEFAULT_SIGNED_URL_ENDPOINT};
pub use upstream::UpstreamConnector;
