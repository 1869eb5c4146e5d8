use std::collections::HashMap;
use std::time::Duration;

use rover_events::{Availability, StateUpdate, UpdateSource};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ConfigurationError;

pub const DEFAULT_UNAVAILABLE_AFTER: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub struct TopicState {
    pub value: Option<Value>,
    pub last_updated: Instant,
    pub availability: Availability,
}

/// Per-topic freshness. Transitions are edge-triggered: a sweep reports a
/// topic only when its availability actually changes.
#[derive(Debug)]
pub struct AvailabilityTracker {
    unavailable_after: Duration,
    stale_after: Option<Duration>,
    topics: HashMap<String, TopicState>,
}

impl AvailabilityTracker {
    pub fn new(unavailable_after: Duration) -> Result<Self, ConfigurationError> {
        if unavailable_after.is_zero() {
            return Err(ConfigurationError::Interval {
                name: "unavailable_after".into(),
                reason: "must be greater than zero",
            });
        }
        Ok(Self {
            unavailable_after,
            stale_after: None,
            topics: HashMap::new(),
        })
    }

    /// Adds an intermediate STALE state before UNAVAILABLE.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Result<Self, ConfigurationError> {
        if stale_after.is_zero() || stale_after >= self.unavailable_after {
            return Err(ConfigurationError::Interval {
                name: "stale_after".into(),
                reason: "must be positive and shorter than unavailable_after",
            });
        }
        self.stale_after = Some(stale_after);
        Ok(self)
    }

    pub fn accept(&mut self, topic: &str, value: Value, now: Instant) -> StateUpdate {
        let previous = self.topics.insert(
            topic.to_string(),
            TopicState {
                value: Some(value.clone()),
                last_updated: now,
                availability: Availability::Available,
            },
        );
        if let Some(prev) = previous {
            if !prev.availability.is_available() {
                debug!(target: "rover::availability", topic, from = prev.availability.as_str(), "topic available again");
            }
        }
        StateUpdate::new(topic, UpdateSource::Stream, Some(value), Availability::Available)
    }

    pub fn sweep(&mut self, now: Instant) -> Vec<StateUpdate> {
        let mut out = Vec::new();
        for (topic, state) in self.topics.iter_mut() {
            let age = now.saturating_duration_since(state.last_updated);
            let target = if age >= self.unavailable_after {
                Availability::Unavailable
            } else if self.stale_after.is_some_and(|stale| age >= stale) {
                Availability::Stale
            } else {
                continue;
            };
            if state.availability == target
                || state.availability == Availability::Unavailable
            {
                continue;
            }
            debug!(
                target: "rover::availability",
                topic = %topic,
                age_ms = age.as_millis() as u64,
                to = target.as_str(),
                "topic aged out"
            );
            state.availability = target;
            out.push(StateUpdate::new(topic.as_str(), UpdateSource::Stream, None, target));
        }
        out
    }

    /// Marks every known topic unavailable at once.
    pub fn connection_lost(&mut self) -> Vec<StateUpdate> {
        let mut out = Vec::new();
        for (topic, state) in self.topics.iter_mut() {
            if state.availability == Availability::Unavailable {
                continue;
            }
            state.availability = Availability::Unavailable;
            out.push(StateUpdate::new(
                topic.as_str(),
                UpdateSource::Stream,
                None,
                Availability::Unavailable,
            ));
        }
        if !out.is_empty() {
            debug!(target: "rover::availability", topics = out.len(), "connection lost; topics unavailable");
        }
        out
    }

    pub fn get(&self, topic: &str) -> Option<&TopicState> {
        self.topics.get(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
