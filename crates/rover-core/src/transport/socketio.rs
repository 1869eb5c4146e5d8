use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{Connector, Endpoint, FrameSource};
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

/// Decoded Engine.IO v4 / Socket.IO v5 text packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open {
        ping_interval: Duration,
        ping_timeout: Duration,
    },
    Close,
    Ping,
    Pong,
    Noop,
    Connected,
    Disconnected,
    ConnectError(String),
    Event {
        name: String,
        args: Vec<Value>,
    },
    /// Packet types the bridge does not act on (acks, binary events, upgrade).
    Ignored(char),
}

pub fn decode_packet(text: &str) -> Result<Packet, TransportError> {
    let mut chars = text.chars();
    let Some(kind) = chars.next() else {
        return Err(TransportError::Protocol("empty packet".into()));
    };
    let rest = chars.as_str();
    match kind {
        '0' => decode_open(rest),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_message(rest),
        '5' => Ok(Packet::Ignored('5')),
        '6' => Ok(Packet::Noop),
        other => Err(TransportError::Protocol(format!(
            "unknown engine packet type `{other}`"
        ))),
    }
}

fn decode_open(body: &str) -> Result<Packet, TransportError> {
    let handshake: Value = serde_json::from_str(body)
        .map_err(|e| TransportError::Protocol(format!("bad open packet: {e}")))?;
    let ms = |field: &str, default: u64| {
        handshake
            .get(field)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    };
    Ok(Packet::Open {
        ping_interval: Duration::from_millis(ms("pingInterval", DEFAULT_PING_INTERVAL_MS)),
        ping_timeout: Duration::from_millis(ms("pingTimeout", DEFAULT_PING_TIMEOUT_MS)),
    })
}

fn decode_message(body: &str) -> Result<Packet, TransportError> {
    let mut chars = body.chars();
    let Some(kind) = chars.next() else {
        return Err(TransportError::Protocol("empty socket.io packet".into()));
    };
    let rest = skip_namespace(chars.as_str());
    match kind {
        '0' => Ok(Packet::Connected),
        '1' => Ok(Packet::Disconnected),
        '4' => Ok(Packet::ConnectError(rest.to_string())),
        '2' => {
            let json = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            let mut items: Vec<Value> = serde_json::from_str(json)
                .map_err(|e| TransportError::Protocol(format!("bad event packet: {e}")))?;
            if items.is_empty() {
                return Err(TransportError::Protocol("event packet without name".into()));
            }
            let name = match items.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(TransportError::Protocol(format!(
                        "event name is not a string: {other}"
                    )))
                }
            };
            Ok(Packet::Event { name, args: items })
        }
        other => Ok(Packet::Ignored(other)),
    }
}

fn skip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.split_once(',') {
            Some((_, rest)) => rest,
            None => "",
        }
    } else {
        body
    }
}

/// Connects to the device's Socket.IO endpoint over a websocket and forwards
/// the first argument of every `broadcast` event as a raw frame.
#[derive(Clone, Debug)]
pub struct SocketIoConnector {
    socketio_path: String,
    event: String,
}

impl SocketIoConnector {
    pub fn new(socketio_path: impl Into<String>) -> Self {
        Self {
            socketio_path: socketio_path.into(),
            event: rover_topics::SOCKETIO_BROADCAST_EVENT.to_string(),
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }
}

impl Default for SocketIoConnector {
    fn default() -> Self {
        Self::new(rover_topics::SOCKETIO_DEFAULT_PATH)
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn FrameSource>, TransportError> {
        let url = endpoint.socketio_url(&self.socketio_path);
        debug!(target: "rover::transport", %url, "opening socket.io websocket");
        let (mut ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut silence_limit =
            Duration::from_millis(DEFAULT_PING_INTERVAL_MS + DEFAULT_PING_TIMEOUT_MS);
        let mut namespace_requested = false;
        loop {
            let text = match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            };
            match decode_packet(&text)? {
                Packet::Open {
                    ping_interval,
                    ping_timeout,
                } => {
                    silence_limit = ping_interval + ping_timeout;
                    send_text(&mut ws, "40").await?;
                    namespace_requested = true;
                }
                Packet::Connected if namespace_requested => {
                    debug!(target: "rover::transport", host = %endpoint.host(), "socket.io namespace connected");
                    return Ok(Box::new(SocketIoSource {
                        ws,
                        event: self.event.clone(),
                        silence_limit,
                    }));
                }
                Packet::ConnectError(reason) => {
                    return Err(TransportError::HandshakeRejected(reason));
                }
                Packet::Ping => send_text(&mut ws, "3").await?,
                Packet::Close | Packet::Disconnected => return Err(TransportError::Closed),
                other => trace!(target: "rover::transport", packet = ?other, "ignored during handshake"),
            }
        }
    }
}

async fn send_text(ws: &mut WsStream, text: &str) -> Result<(), TransportError> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
}

struct SocketIoSource {
    ws: WsStream,
    event: String,
    silence_limit: Duration,
}

#[async_trait]
impl FrameSource for SocketIoSource {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let next = tokio::time::timeout(self.silence_limit, self.ws.next())
                .await
                .map_err(|_| TransportError::Heartbeat(self.silence_limit))?;
            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            };
            match decode_packet(&text)? {
                Packet::Ping => send_text(&mut self.ws, "3").await?,
                Packet::Event { name, mut args } if name == self.event => {
                    let first = if args.is_empty() {
                        Value::Null
                    } else {
                        args.swap_remove(0)
                    };
                    return Ok(Some(first.to_string()));
                }
                Packet::Event { name, .. } => {
                    trace!(target: "rover::transport", event = %name, "ignoring socket.io event");
                }
                Packet::Close | Packet::Disconnected => return Err(TransportError::Closed),
                Packet::ConnectError(reason) => {
                    return Err(TransportError::HandshakeRejected(reason))
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = send_text(&mut self.ws, "41").await;
        let _ = self.ws.close(None).await;
    }
}
