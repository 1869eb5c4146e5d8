use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rover_events::{Availability, Bus, StateUpdate, UpdateSource};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConfigurationError, PollError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// One pull of a slow-changing resource.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Value, PollError>;
}

#[async_trait]
impl<F, Fut> Fetch for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, PollError>> + Send + 'static,
{
    async fn fetch(&self) -> Result<Value, PollError> {
        (self)().await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Consecutive failures before the interval starts doubling.
    pub backoff_after: u32,
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            backoff_after: 2,
            max_interval: Duration::from_secs(300),
        }
    }
}

/// Wait before the next fetch after `failures` consecutive failures.
pub fn next_interval(base: Duration, failures: u32, policy: &PollPolicy) -> Duration {
    if failures == 0 || failures < policy.backoff_after.max(1) {
        return base;
    }
    let doublings = (failures - policy.backoff_after.max(1) + 1).min(16);
    let cap = policy.max_interval.max(base);
    base.checked_mul(1u32 << doublings)
        .map(|d| d.min(cap))
        .unwrap_or(cap)
}

/// Independent periodic fetchers feeding the bus.
pub struct Poller {
    bus: Bus,
    policy: PollPolicy,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    scheduled: Mutex<HashSet<String>>,
}

impl Poller {
    pub fn new(bus: Bus, policy: PollPolicy) -> Self {
        Self {
            bus,
            policy,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            scheduled: Mutex::new(HashSet::new()),
        }
    }

    /// Starts polling `resource` every `interval`. The first fetch runs
    /// immediately.
    pub fn schedule(
        &self,
        resource: impl Into<String>,
        interval: Duration,
        fetch: impl Fetch,
    ) -> Result<(), ConfigurationError> {
        let resource = resource.into();
        if interval.is_zero() {
            return Err(ConfigurationError::Interval {
                name: resource,
                reason: "poll interval must be greater than zero",
            });
        }
        if !self.scheduled.lock().insert(resource.clone()) {
            return Err(ConfigurationError::DuplicateResource(resource));
        }
        let schedule = Schedule {
            resource,
            interval,
            fetch: Arc::new(fetch),
            bus: self.bus.clone(),
            policy: self.policy,
            cancel: self.cancel.child_token(),
        };
        debug!(
            target: "rover::poller",
            resource = %schedule.resource,
            interval_ms = interval.as_millis() as u64,
            "resource scheduled"
        );
        self.tasks.lock().spawn(schedule.run());
        Ok(())
    }

    pub fn scheduled(&self) -> Vec<String> {
        let mut out: Vec<String> = self.scheduled.lock().iter().cloned().collect();
        out.sort();
        out
    }

    /// Cancels every schedule and waits for the tasks to finish. In-flight
    /// fetches are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    warn!(target: "rover::poller", error = %err, "poll task ended abnormally");
                }
            }
        }
        self.scheduled.lock().clear();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Schedule {
    resource: String,
    interval: Duration,
    fetch: Arc<dyn Fetch>,
    bus: Bus,
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl Schedule {
    async fn run(self) {
        let mut failures: u32 = 0;
        let mut healthy: Option<bool> = None;
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.fetch.fetch() => result,
            };
            match result {
                Ok(value) => {
                    if failures > 0 {
                        info!(target: "rover::poller", resource = %self.resource, failures, "resource recovered");
                    }
                    failures = 0;
                    healthy = Some(true);
                    self.bus.publish(StateUpdate::new(
                        self.resource.as_str(),
                        UpdateSource::Poll,
                        Some(value),
                        Availability::Available,
                    ));
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        target: "rover::poller",
                        resource = %self.resource,
                        error = %err,
                        failures,
                        "poll failed"
                    );
                    if healthy != Some(false) {
                        healthy = Some(false);
                        self.bus.publish(StateUpdate::new(
                            self.resource.as_str(),
                            UpdateSource::Poll,
                            None,
                            Availability::Unavailable,
                        ));
                    }
                }
            }
            let wait = next_interval(self.interval, failures, &self.policy);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(target: "rover::poller", resource = %self.resource, "schedule stopped");
    }
}
