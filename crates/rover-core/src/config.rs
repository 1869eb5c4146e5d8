use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::bridge::BridgeSettings;
use crate::coordinator::{CoordinatorPolicy, WriteMethod};
use crate::error::ConfigurationError;
use crate::poller::PollPolicy;
use crate::throttle::{Coalesce, ThrottlePolicy};
use crate::transport::SessionOptions;

pub const ENV_HOST: &str = "ROVER_HOST";
pub const ENV_UPDATE_RATE_HZ: &str = "ROVER_UPDATE_RATE_HZ";
pub const ENV_STALE_AFTER_SECS: &str = "ROVER_STALE_AFTER_SECS";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device address: bare host, `host:port`, or an http(s)/ws(s) URL.
    pub host: Option<String>,
    pub socketio_path: String,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: None,
            socketio_path: rover_topics::SOCKETIO_DEFAULT_PATH.to_string(),
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub rate_hz: f64,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleConfig {
    /// Update rate for topics outside any group (0.2-10 Hz).
    pub rate_hz: f64,
    pub coalesce: Coalesce,
    /// On-change topics that are never throttled.
    pub exempt: Vec<String>,
    pub groups: BTreeMap<String, GroupConfig>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rate_hz: crate::throttle::DEFAULT_RATE_HZ,
            coalesce: Coalesce::default(),
            exempt: rover_topics::DEFAULT_EXEMPT_TOPICS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            groups: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct AvailabilityConfig {
    pub unavailable_after_secs: u64,
    /// Optional earlier threshold reported as `stale`.
    pub stale_after_secs: Option<u64>,
    pub sweep_interval_secs: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            unavailable_after_secs: 30,
            stale_after_secs: None,
            sweep_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            max_ms: 5_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub interval_secs: u64,
    /// Consecutive failures before the interval starts doubling.
    pub backoff_after: u32,
    pub max_interval_secs: u64,
    /// REST resource paths polled on the interval.
    pub resources: Vec<String>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            backoff_after: 2,
            max_interval_secs: 300,
            resources: rover_topics::DEFAULT_POLL_RESOURCES
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub fetch_retries: u32,
    pub fetch_retry_delay_ms: u64,
    pub conflict_retries: u32,
    pub write_retries: u32,
    pub write_method: WriteMethod,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fetch_retries: 2,
            fetch_retry_delay_ms: 250,
            conflict_retries: 3,
            write_retries: 1,
            write_method: WriteMethod::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    pub throttle: ThrottleConfig,
    pub availability: AvailabilityConfig,
    pub reconnect: ReconnectConfig,
    pub poll: PollConfig,
    pub coordinator: CoordinatorConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema_value = config_schema_json();
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration file.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(BridgeConfig);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &Path) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Parses TOML text, validating it against the schema first.
pub fn parse_config(content: &str) -> Result<BridgeConfig, ConfigurationError> {
    let raw: toml::Value =
        toml::from_str(content).map_err(|e| ConfigurationError::File(e.to_string()))?;
    let json_value =
        serde_json::to_value(&raw).map_err(|e| ConfigurationError::File(e.to_string()))?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(ConfigurationError::Schema(validation_errors.join(", ")));
    }
    toml::from_str(content).map_err(|e| ConfigurationError::File(e.to_string()))
}

pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigurationError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigurationError::File(format!("{}: {e}", path.display())))?;
    parse_config(&content)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigurationError>
where
    T::Err: std::fmt::Display,
{
    match env_value(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigurationError::Schema(format!("{key}={raw}: {e}"))),
        None => Ok(None),
    }
}

impl BridgeConfig {
    /// Applies `ROVER_HOST`, `ROVER_UPDATE_RATE_HZ` and
    /// `ROVER_STALE_AFTER_SECS` on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigurationError> {
        if let Some(host) = env_value(ENV_HOST) {
            self.device.host = Some(host);
        }
        if let Some(rate) = env_parse::<f64>(ENV_UPDATE_RATE_HZ)? {
            self.throttle.rate_hz = rate;
        }
        if let Some(secs) = env_parse::<u64>(ENV_STALE_AFTER_SECS)? {
            self.availability.unavailable_after_secs = secs;
        }
        Ok(())
    }

    pub fn throttle_policy(&self) -> Result<ThrottlePolicy, ConfigurationError> {
        let mut policy = ThrottlePolicy::new(self.throttle.rate_hz)?
            .coalesce(self.throttle.coalesce)
            .exempt(self.throttle.exempt.iter().cloned());
        for (name, group) in &self.throttle.groups {
            policy = policy.group(name, group.rate_hz, group.topics.iter().cloned())?;
        }
        Ok(policy)
    }

    /// Resolves the file into runtime settings. Fails when no host is set
    /// or any interval, rate or threshold is invalid.
    pub fn settings(&self) -> Result<BridgeSettings, ConfigurationError> {
        let host = self
            .device
            .host
            .clone()
            .ok_or_else(|| ConfigurationError::Endpoint {
                input: String::new(),
                reason: format!("no device host configured (set [device].host or {ENV_HOST})"),
            })?;
        positive("device.handshake_timeout_ms", self.device.handshake_timeout_ms)?;
        positive("device.request_timeout_ms", self.device.request_timeout_ms)?;
        positive("availability.sweep_interval_secs", self.availability.sweep_interval_secs)?;
        positive("poll.interval_secs", self.poll.interval_secs)?;
        positive("reconnect.base_ms", self.reconnect.base_ms)?;
        positive("reconnect.max_ms", self.reconnect.max_ms)?;
        if self.reconnect.base_ms > self.reconnect.max_ms {
            return Err(ConfigurationError::Interval {
                name: "reconnect.base_ms".into(),
                reason: "must not exceed reconnect.max_ms",
            });
        }
        if !self.reconnect.factor.is_finite() || self.reconnect.factor < 1.0 {
            return Err(ConfigurationError::Interval {
                name: "reconnect.factor".into(),
                reason: "must be a finite number >= 1",
            });
        }

        let mut settings = BridgeSettings::new(host)?;
        settings.socketio_path = self.device.socketio_path.clone();
        settings.session = SessionOptions {
            backoff: Backoff {
                base: Duration::from_millis(self.reconnect.base_ms),
                factor: self.reconnect.factor,
                cap: Duration::from_millis(self.reconnect.max_ms),
                jitter: self.reconnect.jitter,
            },
            handshake_timeout: Duration::from_millis(self.device.handshake_timeout_ms),
            ..SessionOptions::default()
        };
        settings.throttle = self.throttle_policy()?;
        settings.unavailable_after = Duration::from_secs(self.availability.unavailable_after_secs);
        settings.stale_after = self.availability.stale_after_secs.map(Duration::from_secs);
        settings.sweep_interval = Duration::from_secs(self.availability.sweep_interval_secs);
        settings.request_timeout = Duration::from_millis(self.device.request_timeout_ms);
        settings.poll_interval = Duration::from_secs(self.poll.interval_secs);
        settings.poll_policy = PollPolicy {
            backoff_after: self.poll.backoff_after,
            max_interval: Duration::from_secs(self.poll.max_interval_secs),
        };
        settings.poll_resources = self.poll.resources.clone();
        settings.coordinator = CoordinatorPolicy {
            fetch_retries: self.coordinator.fetch_retries,
            fetch_retry_delay: Duration::from_millis(self.coordinator.fetch_retry_delay_ms),
            conflict_retries: self.coordinator.conflict_retries,
            write_retries: self.coordinator.write_retries,
        };
        settings.write_method = self.coordinator.write_method;
        Ok(settings)
    }
}

fn positive(name: &str, value: u64) -> Result<(), ConfigurationError> {
    if value == 0 {
        return Err(ConfigurationError::Interval {
            name: name.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(())
}
