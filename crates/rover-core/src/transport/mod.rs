//! Streaming connection to the device.
//!
//! The session owns one logical connection, reconnects on its own, and hands
//! every inbound frame plus every connection-state change to a single
//! consumer channel in order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::error::{ConfigurationError, TransportError};

mod session;
mod socketio;

pub use session::{SessionOptions, TransportSession};
pub use socketio::{decode_packet, Packet, SocketIoConnector};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Topic values cannot be trusted while the link is down.
    pub fn is_link_down(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Reconnecting
        )
    }
}

/// One raw inbound message, still undecoded.
#[derive(Clone, Debug)]
pub struct Frame {
    pub text: String,
    pub received_at: Instant,
}

impl Frame {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Instant::now(),
        }
    }
}

/// What the single session consumer receives, in order.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Frame(Frame),
    State(ConnectionState),
}

/// Validated device address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
}

impl Endpoint {
    /// Accepts a bare host (`reach.local`, `192.168.1.21:8080`) or an
    /// `http(s)://` / `ws(s)://` URL.
    pub fn parse(input: &str) -> Result<Self, ConfigurationError> {
        let trimmed = input.trim();
        let fail = |reason: &str| ConfigurationError::Endpoint {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        if trimmed.is_empty() {
            return Err(fail("empty"));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(fail("contains whitespace"));
        }
        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        let mut url = Url::parse(&candidate).map_err(|e| fail(&e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "http",
            "https" | "wss" => "https",
            _ => return Err(fail("unsupported scheme")),
        };
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(fail("missing host"));
        }
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| fail("cannot map scheme to http"))?;
        }
        url.set_path("");
        url.set_query(None);
        url.set_fragment(None);
        Ok(Self { base: url })
    }

    pub fn host(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    /// `http(s)://host[:port]` without a trailing slash.
    pub fn base_url(&self) -> String {
        self.base.as_str().trim_end_matches('/').to_string()
    }

    /// Absolute URL for a REST resource path such as `/info`.
    pub fn resource_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }

    /// Engine.IO v4 websocket URL for the given Socket.IO mount path.
    pub fn socketio_url(&self, socketio_path: &str) -> String {
        let ws_scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        let authority = self
            .base_url()
            .split_once("://")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();
        let path = socketio_path.trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("{ws_scheme}://{authority}{path}/?EIO=4&transport=websocket")
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// Opens physical connections; the session owns retry policy.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect and complete the protocol handshake.
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn FrameSource>, TransportError>;
}

/// An established connection yielding raw frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `Ok(None)` when the peer closed cleanly.
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_becomes_http_base() {
        let ep = Endpoint::parse("192.168.1.21").unwrap();
        assert_eq!(ep.base_url(), "http://192.168.1.21");
        assert_eq!(ep.host(), "192.168.1.21");
        assert_eq!(ep.resource_url("/info"), "http://192.168.1.21/info");
        assert_eq!(
            ep.socketio_url("/socket.io"),
            "ws://192.168.1.21/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn websocket_scheme_maps_to_http_and_keeps_port() {
        let ep = Endpoint::parse("wss://reach.local:8443/ignored?x=1").unwrap();
        assert_eq!(ep.base_url(), "https://reach.local:8443");
        assert_eq!(
            ep.socketio_url("socket.io/"),
            "wss://reach.local:8443/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        for bad in ["", "   ", "bad host", "ftp://reach.local", "http://"] {
            assert!(
                matches!(Endpoint::parse(bad), Err(ConfigurationError::Endpoint { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn link_down_states() {
        assert!(ConnectionState::Reconnecting.is_link_down());
        assert!(ConnectionState::Disconnected.is_link_down());
        assert!(!ConnectionState::Connecting.is_link_down());
        assert!(!ConnectionState::Connected.is_link_down());
    }
}
