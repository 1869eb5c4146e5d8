//! Streaming path: session events → router → throttle → availability → bus.
//!
//! One task owns all three stages, so every topic has a single writer and no
//! locks are held across stages.

use std::time::Duration;

use rover_events::Bus;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::availability::AvailabilityTracker;
use crate::router::{Envelope, EventRouter, Route};
use crate::throttle::ThrottleEngine;
use crate::transport::{ConnectionState, SessionEvent};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub routed: u64,
    pub dropped: u64,
    pub coalesced: u64,
    pub published: u64,
}

pub struct Pipeline {
    bus: Bus,
    router: EventRouter,
    throttle: ThrottleEngine,
    tracker: AvailabilityTracker,
    sweep_interval: Duration,
    published: u64,
}

impl Pipeline {
    pub fn new(
        bus: Bus,
        throttle: ThrottleEngine,
        tracker: AvailabilityTracker,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            bus,
            router: EventRouter::new(),
            throttle,
            tracker,
            sweep_interval: sweep_interval.max(Duration::from_millis(10)),
            published: 0,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            routed: self.router.routed(),
            dropped: self.router.dropped(),
            coalesced: self.throttle.coalesced(),
            published: self.published,
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Frame(frame) => match self.router.route(&frame) {
                Route::Routed(envelope) => {
                    if let Some(ready) = self.throttle.offer(envelope, now) {
                        self.emit(ready, now);
                    }
                }
                Route::Dropped(_) => {}
            },
            SessionEvent::State(state) if state.is_link_down() => self.link_down(state),
            SessionEvent::State(state) => {
                debug!(target: "rover::pipeline", state = state.as_str(), "connection state");
            }
        }
    }

    pub fn flush(&mut self, now: Instant) {
        for envelope in self.throttle.flush_due(now) {
            self.emit(envelope, now);
        }
    }

    pub fn sweep(&mut self, now: Instant) {
        for update in self.tracker.sweep(now) {
            self.publish(update);
        }
    }

    fn link_down(&mut self, state: ConnectionState) {
        let discarded = self.throttle.discard_pending();
        let lost = self.tracker.connection_lost();
        debug!(
            target: "rover::pipeline",
            state = state.as_str(),
            discarded,
            topics = lost.len(),
            "link down"
        );
        for update in lost {
            self.publish(update);
        }
    }

    fn emit(&mut self, envelope: Envelope, now: Instant) {
        let update = self.tracker.accept(&envelope.topic, envelope.payload, now);
        self.publish(update);
    }

    fn publish(&mut self, update: rover_events::StateUpdate) {
        self.published += 1;
        self.bus.publish(update);
    }

    /// Drives the pipeline until cancelled or the session drops its sender.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) -> PipelineStats {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let deadline = self.throttle.next_deadline();
            // Timers go first so a steady backlog cannot starve them.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = flush_at(deadline) => self.flush(Instant::now()),
                _ = sweep.tick() => self.sweep(Instant::now()),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, Instant::now()),
                    None => break,
                },
            }
        }
        let stats = self.stats();
        info!(
            target: "rover::pipeline",
            routed = stats.routed,
            dropped = stats.dropped,
            coalesced = stats.coalesced,
            published = stats.published,
            "pipeline stopped"
        );
        stats
    }
}

async fn flush_at(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
