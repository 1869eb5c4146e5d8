//! Telemetry bridge for a networked GNSS receiver.
//!
//! The streaming path (`transport` → `router` → `throttle` → `availability`)
//! runs as one pipeline task and publishes to a [`rover_events::Bus`]. The
//! `poller` feeds the same bus on its own cadence, and the `coordinator`
//! applies caller-initiated configuration changes to the device.

pub mod availability;
pub mod backoff;
pub mod bridge;
pub mod client;
mod config;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod poller;
pub mod router;
pub mod throttle;
pub mod transport;

pub use bridge::{Bridge, BridgeHandle, BridgeSettings};
pub use client::{DeviceClient, DeviceInfo};
pub use config::{
    config_schema_json, load_config, parse_config, write_schema_file, AvailabilityConfig,
    BridgeConfig, CoordinatorConfig, DeviceConfig, GroupConfig, PollConfig, ReconnectConfig,
    ThrottleConfig, ENV_HOST, ENV_STALE_AFTER_SECS, ENV_UPDATE_RATE_HZ,
};
pub use coordinator::{ConfigCoordinator, CoordinatorPolicy};
pub use error::{
    ConfigurationError, CoordinatorError, DecodeError, PollError, StoreError, TransportError,
};
