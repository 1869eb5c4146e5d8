use std::collections::{HashMap, HashSet};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use crate::error::ConfigurationError;
use crate::router::Envelope;

pub const MIN_RATE_HZ: f64 = 0.2;
pub const MAX_RATE_HZ: f64 = 10.0;
pub const DEFAULT_RATE_HZ: f64 = 1.0;

/// Converts an update rate into an emission interval, rejecting anything
/// outside the supported 0.2–10 Hz range.
pub fn interval_from_hz(rate_hz: f64) -> Result<Duration, ConfigurationError> {
    if !rate_hz.is_finite() {
        return Err(ConfigurationError::Rate {
            rate_hz,
            reason: "not a finite number",
        });
    }
    if rate_hz <= 0.0 {
        return Err(ConfigurationError::Rate {
            rate_hz,
            reason: "must be positive",
        });
    }
    if !(MIN_RATE_HZ..=MAX_RATE_HZ).contains(&rate_hz) {
        return Err(ConfigurationError::Rate {
            rate_hz,
            reason: "outside the supported 0.2-10 Hz range",
        });
    }
    Ok(Duration::from_secs_f64(1.0 / rate_hz))
}

/// Whether topics sharing a group also share one flush timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Coalesce {
    /// Each topic has its own bucket using its group's interval.
    #[default]
    PerTopic,
    /// One timer per group; each member keeps its own newest value and all
    /// of them are emitted together at the group deadline.
    PerGroup,
}

/// Static assignment of topics to throttle groups.
#[derive(Clone, Debug)]
pub struct ThrottlePolicy {
    default_interval: Duration,
    groups: HashMap<String, Duration>,
    members: HashMap<String, String>,
    exempt: HashSet<String>,
    coalesce: Coalesce,
}

impl ThrottlePolicy {
    pub fn new(rate_hz: f64) -> Result<Self, ConfigurationError> {
        Self::with_interval(interval_from_hz(rate_hz)?)
    }

    pub fn with_interval(interval: Duration) -> Result<Self, ConfigurationError> {
        check_interval(rover_topics::DEFAULT_GROUP, interval)?;
        Ok(Self {
            default_interval: interval,
            groups: HashMap::new(),
            members: HashMap::new(),
            exempt: HashSet::new(),
            coalesce: Coalesce::default(),
        })
    }

    pub fn group<I, S>(self, name: &str, rate_hz: f64, topics: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_interval(name, interval_from_hz(rate_hz)?, topics)
    }

    pub fn group_interval<I, S>(
        mut self,
        name: &str,
        interval: Duration,
        topics: I,
    ) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        check_interval(name, interval)?;
        self.groups.insert(name.to_string(), interval);
        for topic in topics {
            let topic = topic.into();
            if let Some(existing) = self.members.get(&topic) {
                if existing != name {
                    return Err(ConfigurationError::DuplicateTopic {
                        topic,
                        first: existing.clone(),
                        second: name.to_string(),
                    });
                }
            }
            self.members.insert(topic, name.to_string());
        }
        Ok(self)
    }

    /// Marks topics as on-change signals that bypass throttling.
    pub fn exempt<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn coalesce(mut self, coalesce: Coalesce) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn is_exempt(&self, topic: &str) -> bool {
        self.exempt.contains(topic)
    }

    /// Emission interval for `topic`, or `None` when it is exempt.
    pub fn interval_for(&self, topic: &str) -> Option<Duration> {
        self.bucket_for(topic).map(|(_, interval)| interval)
    }

    fn bucket_for(&self, topic: &str) -> Option<(String, Duration)> {
        if self.is_exempt(topic) {
            return None;
        }
        let (group, interval) = match self.members.get(topic) {
            Some(group) => (
                group.as_str(),
                self.groups
                    .get(group)
                    .copied()
                    .unwrap_or(self.default_interval),
            ),
            None => (rover_topics::DEFAULT_GROUP, self.default_interval),
        };
        let key = match self.coalesce {
            Coalesce::PerTopic => topic.to_string(),
            Coalesce::PerGroup => format!("group:{group}"),
        };
        Some((key, interval))
    }
}

fn check_interval(name: &str, interval: Duration) -> Result<(), ConfigurationError> {
    if interval.is_zero() {
        return Err(ConfigurationError::Interval {
            name: name.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(())
}

#[derive(Debug)]
struct Bucket {
    interval: Duration,
    last_emitted: Option<Instant>,
    /// At most one value per topic, in order of first deferral. Under
    /// per-topic coalescing this never holds more than one entry.
    pending: Vec<Envelope>,
    flush_at: Option<Instant>,
}

impl Bucket {
    /// Stores `envelope` as its topic's pending value. Returns true when it
    /// superseded an older one.
    fn defer(&mut self, envelope: Envelope) -> bool {
        match self.pending.iter_mut().find(|p| p.topic == envelope.topic) {
            Some(slot) => {
                *slot = envelope;
                true
            }
            None => {
                self.pending.push(envelope);
                false
            }
        }
    }

    fn drop_pending_for(&mut self, topic: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.topic != topic);
        self.pending.len() != before
    }
}

/// Last-value-wins rate limiter.
///
/// The engine never reads the clock itself; callers pass `now` so the same
/// logic runs under the pipeline's timers and in deterministic tests.
#[derive(Debug)]
pub struct ThrottleEngine {
    policy: ThrottlePolicy,
    buckets: HashMap<String, Bucket>,
    coalesced: u64,
}

impl ThrottleEngine {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            buckets: HashMap::new(),
            coalesced: 0,
        }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Values superseded by a newer one before they could be emitted.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Accepts one envelope. Returns it when it may be emitted right away;
    /// otherwise it becomes its topic's pending value in the bucket.
    pub fn offer(&mut self, envelope: Envelope, now: Instant) -> Option<Envelope> {
        let Some((key, interval)) = self.policy.bucket_for(&envelope.topic) else {
            return Some(envelope);
        };
        let bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            interval,
            last_emitted: None,
            pending: Vec::new(),
            flush_at: None,
        });
        let due = bucket
            .last_emitted
            .map(|last| now.saturating_duration_since(last) >= bucket.interval)
            .unwrap_or(true);
        if due {
            if bucket.drop_pending_for(&envelope.topic) {
                self.coalesced += 1;
            }
            bucket.last_emitted = Some(now);
            // Group siblings still waiting on a late flush go out with this one.
            bucket.flush_at = if bucket.pending.is_empty() { None } else { Some(now) };
            return Some(envelope);
        }
        if bucket.defer(envelope) {
            self.coalesced += 1;
        }
        if bucket.flush_at.is_none() {
            // `due == false` implies `last_emitted` is set.
            bucket.flush_at = bucket.last_emitted.map(|last| last + bucket.interval);
        }
        trace!(target: "rover::throttle", flush_at = ?bucket.flush_at, "value deferred");
        None
    }

    /// Emits every pending value of each bucket whose flush time has passed.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Envelope> {
        let mut out = Vec::new();
        for bucket in self.buckets.values_mut() {
            let Some(flush_at) = bucket.flush_at else {
                continue;
            };
            if flush_at > now {
                continue;
            }
            bucket.flush_at = None;
            if !bucket.pending.is_empty() {
                bucket.last_emitted = Some(now);
                out.append(&mut bucket.pending);
            }
        }
        out
    }

    /// Earliest scheduled flush, if any bucket holds a pending value.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets.values().filter_map(|b| b.flush_at).min()
    }

    /// Starts every bucket afresh after an outage: pending values are
    /// dropped and the first value afterwards is emitted immediately.
    /// Returns how many values were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.buckets.values().map(|b| b.pending.len()).sum();
        self.buckets.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn env(topic: &str, payload: Value, at: Instant) -> Envelope {
        Envelope {
            topic: topic.to_string(),
            payload,
            received_at: at,
        }
    }

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    fn engine(interval_ms: u64) -> ThrottleEngine {
        ThrottleEngine::new(
            ThrottlePolicy::with_interval(Duration::from_millis(interval_ms))
                .unwrap()
                .exempt(rover_topics::DEFAULT_EXEMPT_TOPICS.iter().copied()),
        )
    }

    /// Feeds arrivals in time order, flushing due buckets before each arrival
    /// and once more at `end`. Returns `(emitted_at, payload)` pairs.
    fn drive(
        engine: &mut ThrottleEngine,
        arrivals: &[(Instant, &str, Value)],
        end: Instant,
    ) -> Vec<(Instant, Envelope)> {
        let mut out = Vec::new();
        for (at, topic, payload) in arrivals {
            while let Some(deadline) = engine.next_deadline() {
                if deadline > *at {
                    break;
                }
                for e in engine.flush_due(deadline) {
                    out.push((deadline, e));
                }
            }
            if let Some(e) = engine.offer(env(topic, payload.clone(), *at), *at) {
                out.push((*at, e));
            }
        }
        while let Some(deadline) = engine.next_deadline() {
            if deadline > end {
                break;
            }
            for e in engine.flush_due(deadline) {
                out.push((deadline, e));
            }
        }
        out
    }

    #[test]
    fn invalid_rates_are_rejected_not_clamped() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 0.1, 10.5] {
            assert!(interval_from_hz(bad).is_err(), "{bad} accepted");
        }
        assert_eq!(interval_from_hz(0.2).unwrap(), Duration::from_secs(5));
        assert_eq!(interval_from_hz(10.0).unwrap(), Duration::from_millis(100));
        assert_eq!(interval_from_hz(DEFAULT_RATE_HZ).unwrap(), Duration::from_secs(1));
        assert!(ThrottlePolicy::with_interval(Duration::ZERO).is_err());
    }

    #[test]
    fn topic_in_two_groups_is_a_configuration_error() {
        let err = ThrottlePolicy::new(1.0)
            .unwrap()
            .group("fast", 5.0, ["navigation"])
            .unwrap()
            .group("slow", 0.5, ["navigation"])
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateTopic { .. }));
    }

    #[test]
    fn burst_within_interval_emits_once_with_newest_value() {
        let base = Instant::now();
        let mut engine = engine(1000);
        // Prime the bucket so the burst lands inside one interval.
        assert!(engine
            .offer(env("navigation", json!(0), base), base)
            .is_some());
        let arrivals: Vec<_> = (1..=7)
            .map(|i| (ms(base, i * 100), "navigation", json!(i)))
            .collect();
        let emitted = drive(&mut engine, &arrivals, ms(base, 1000));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, ms(base, 1000));
        assert_eq!(emitted[0].1.payload, json!(7));
        assert_eq!(engine.coalesced(), 6);
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn emissions_are_spaced_and_carry_latest_value() {
        let base = Instant::now();
        let mut engine = engine(400);
        let offsets = [
            0u64, 30, 90, 150, 420, 430, 805, 815, 1190, 1700, 1710, 1720, 2500,
        ];
        let arrivals: Vec<_> = offsets
            .iter()
            .enumerate()
            .map(|(i, off)| (ms(base, *off), "battery_status", json!(i)))
            .collect();
        let emitted = drive(&mut engine, &arrivals, ms(base, 5000));

        for pair in emitted.windows(2) {
            let gap = pair[1].0.saturating_duration_since(pair[0].0);
            assert!(gap >= Duration::from_millis(400), "gap {gap:?} too short");
        }
        for (at, e) in &emitted {
            let newest = arrivals
                .iter()
                .filter(|(arrived, _, _)| arrived <= at)
                .last()
                .map(|(_, _, v)| v.clone())
                .unwrap();
            assert_eq!(e.payload, newest, "stale value emitted at {at:?}");
        }
        let mut last_seen = -1i64;
        for (_, e) in &emitted {
            let idx = e.payload.as_i64().unwrap();
            assert!(idx > last_seen, "emissions reordered");
            last_seen = idx;
        }
        assert_eq!(emitted.last().unwrap().1.payload, json!(offsets.len() - 1));
    }

    #[test]
    fn navigation_solution_sequence_is_last_value_wins() {
        let base = Instant::now();
        let mut engine = engine(1000);
        let arrivals = vec![
            (ms(base, 50), "navigation", json!({"solution": "single"})),
            (ms(base, 300), "navigation", json!({"solution": "single"})),
            (ms(base, 550), "navigation", json!({"solution": "float"})),
            (ms(base, 800), "navigation", json!({"solution": "float"})),
            (ms(base, 1050), "navigation", json!({"solution": "fix"})),
        ];
        let emitted = drive(&mut engine, &arrivals, ms(base, 5000));
        let solutions: Vec<_> = emitted
            .iter()
            .map(|(_, e)| e.payload["solution"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(solutions, vec!["single", "float", "fix"]);
        for pair in emitted.windows(2) {
            assert!(pair[1].0.saturating_duration_since(pair[0].0) >= Duration::from_secs(1));
        }
    }

    #[test]
    fn exempt_topics_emit_every_value() {
        let base = Instant::now();
        let mut engine = engine(1000);
        for i in 0..5 {
            let at = ms(base, i * 10);
            let out = engine.offer(env("lora_state", json!({"connected": i % 2 == 0}), at), at);
            assert!(out.is_some());
        }
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn late_arrival_supersedes_pending_value() {
        let base = Instant::now();
        let mut engine = engine(1000);
        assert!(engine.offer(env("navigation", json!("a"), base), base).is_some());
        assert!(engine
            .offer(env("navigation", json!("b"), ms(base, 500)), ms(base, 500))
            .is_none());
        // The flush timer was late; the next arrival is already past the boundary.
        let emitted = engine.offer(env("navigation", json!("c"), ms(base, 1200)), ms(base, 1200));
        assert_eq!(emitted.map(|e| e.payload), Some(json!("c")));
        assert!(engine.flush_due(ms(base, 1300)).is_empty());
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn discarding_pending_cancels_flush() {
        let base = Instant::now();
        let mut engine = engine(1000);
        engine.offer(env("navigation", json!(1), base), base);
        engine.offer(env("navigation", json!(2), ms(base, 100)), ms(base, 100));
        assert_eq!(engine.discard_pending(), 1);
        assert!(engine.next_deadline().is_none());
        assert!(engine.flush_due(ms(base, 5000)).is_empty());
    }

    #[test]
    fn per_topic_buckets_are_independent() {
        let base = Instant::now();
        let mut engine = engine(1000);
        assert!(engine.offer(env("navigation", json!(1), base), base).is_some());
        assert!(engine
            .offer(env("battery_status", json!(2), ms(base, 10)), ms(base, 10))
            .is_some());
    }

    #[test]
    fn per_group_buckets_share_one_timer() {
        let base = Instant::now();
        let policy = ThrottlePolicy::with_interval(Duration::from_secs(1))
            .unwrap()
            .group_interval(
                "slow",
                Duration::from_secs(2),
                ["observations", "battery_status"],
            )
            .unwrap()
            .coalesce(Coalesce::PerGroup);
        let mut engine = ThrottleEngine::new(policy);
        assert!(engine.offer(env("observations", json!(1), base), base).is_some());
        assert!(engine
            .offer(env("battery_status", json!(2), ms(base, 100)), ms(base, 100))
            .is_none());
        assert!(engine
            .offer(env("observations", json!(3), ms(base, 200)), ms(base, 200))
            .is_none());
        assert_eq!(engine.next_deadline(), Some(ms(base, 2000)));
        let flushed: Vec<_> = engine
            .flush_due(ms(base, 2000))
            .into_iter()
            .map(|e| (e.topic, e.payload))
            .collect();
        assert_eq!(
            flushed,
            vec![
                ("battery_status".to_string(), json!(2)),
                ("observations".to_string(), json!(3)),
            ]
        );
        assert_eq!(engine.coalesced(), 0);
        // Topics outside the group keep the default interval.
        assert_eq!(
            engine.policy().interval_for("navigation"),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn interleaved_group_topics_are_all_emitted() {
        let base = Instant::now();
        let policy = ThrottlePolicy::with_interval(Duration::from_secs(1))
            .unwrap()
            .group_interval("pair", Duration::from_secs(1), ["a", "b"])
            .unwrap()
            .coalesce(Coalesce::PerGroup);
        let mut engine = ThrottleEngine::new(policy);
        let mut arrivals = Vec::new();
        for second in 0..40u64 {
            let start = second * 1000;
            arrivals.push((ms(base, start + 100), "a", json!(second)));
            arrivals.push((ms(base, start + 200), "b", json!(second)));
            arrivals.push((ms(base, start + 300), "a", json!(second)));
        }
        let emitted = drive(&mut engine, &arrivals, ms(base, 45_000));
        let count = |topic: &str| emitted.iter().filter(|(_, e)| e.topic == topic).count();
        assert!(count("a") >= 39, "a emitted {} times", count("a"));
        assert!(count("b") >= 39, "b emitted {} times", count("b"));
        let last_b = emitted.iter().rev().find(|(_, e)| e.topic == "b").unwrap();
        assert_eq!(last_b.1.payload, json!(39));
        // One emission instant per interval for the whole group.
        let mut instants: Vec<_> = emitted.iter().map(|(at, _)| *at).collect();
        instants.dedup();
        for pair in instants.windows(2) {
            assert!(pair[1].saturating_duration_since(pair[0]) >= Duration::from_secs(1));
        }
    }

    #[test]
    fn outage_resets_emission_history() {
        let base = Instant::now();
        let mut engine = engine(5000);
        assert!(engine.offer(env("navigation", json!("a"), base), base).is_some());
        assert_eq!(engine.discard_pending(), 0);
        let again = engine.offer(env("navigation", json!("b"), ms(base, 600)), ms(base, 600));
        assert_eq!(again.map(|e| e.payload), Some(json!("b")));
        assert!(engine
            .offer(env("navigation", json!("c"), ms(base, 700)), ms(base, 700))
            .is_none());
        assert_eq!(engine.next_deadline(), Some(ms(base, 5600)));
    }
}
