use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

/// Whether a state value can be trusted as current.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Stale,
    #[default]
    Unavailable,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Stale => "stale",
            Availability::Unavailable => "unavailable",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

/// Which path produced an update.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Stream,
    Poll,
}

/// One `(value, availability)` pair for a topic or polled resource.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateUpdate {
    pub key: String,
    pub source: UpdateSource,
    pub value: Option<Value>,
    pub availability: Availability,
    /// RFC3339 with millisecond precision.
    pub time: String,
}

impl StateUpdate {
    pub fn new(
        key: impl Into<String>,
        source: UpdateSource,
        value: Option<Value>,
        availability: Availability,
    ) -> Self {
        Self {
            key: key.into(),
            source,
            value,
            availability,
            time: now_rfc3339(),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Broadcast sink for state updates with a last-value table per key.
///
/// Writers for different keys never contend beyond the short table lock, so
/// the streaming pipeline and poller tasks can publish concurrently.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<StateUpdate>,
    latest: Arc<RwLock<HashMap<String, StateUpdate>>>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.tx.subscribe()
    }

    /// Stream of updates for a single key. Lagged receivers skip ahead; the
    /// last-value table still holds the newest update for late readers.
    pub fn subscribe_key(&self, key: &str) -> impl Stream<Item = StateUpdate> + Send + 'static {
        let key = key.to_string();
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let out = match item {
                Ok(update) if update.key == key => Some(update),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "rover::bus", key = %key, skipped, "subscriber lagged");
                    None
                }
            };
            futures_util::future::ready(out)
        })
    }

    pub fn publish(&self, update: StateUpdate) {
        {
            let mut latest = self.latest.write();
            let entry = latest.entry(update.key.clone());
            match entry {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    let merged = if update.value.is_none() {
                        // Availability-only transitions keep the last known value.
                        StateUpdate {
                            value: slot.get().value.clone(),
                            ..update.clone()
                        }
                    } else {
                        update.clone()
                    };
                    slot.insert(merged);
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(update.clone());
                }
            }
        }
        let _ = self.tx.send(update);
    }

    pub fn latest(&self, key: &str) -> Option<StateUpdate> {
        self.latest.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StateUpdate> {
        self.latest
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}
