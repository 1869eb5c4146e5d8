use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::error::DecodeError;
use crate::transport::Frame;

/// One decoded `{name, payload}` message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    pub received_at: Instant,
}

#[derive(Debug)]
pub enum Route {
    Routed(Envelope),
    Dropped(DecodeError),
}

/// Splits raw frames into topic envelopes. Unknown topics pass through under
/// their literal name; malformed frames are counted and dropped.
#[derive(Debug, Default)]
pub struct EventRouter {
    routed: AtomicU64,
    dropped: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, frame: &Frame) -> Route {
        match decode_envelope(&frame.text, frame.received_at) {
            Ok(env) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                Route::Routed(env)
            }
            Err(err) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(target: "rover::router", error = %err, dropped, "dropping malformed envelope");
                Route::Dropped(err)
            }
        }
    }

    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn decode_envelope(text: &str, received_at: Instant) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(DecodeError::NotObject);
    };
    let topic = match map.remove("name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => return Err(DecodeError::MissingName),
    };
    let payload = map.remove("payload").ok_or(DecodeError::MissingPayload)?;
    Ok(Envelope {
        topic,
        payload,
        received_at,
    })
}
