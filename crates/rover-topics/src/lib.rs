//! Canonical topic names and REST resource paths shared across the bridge.
//!
//! Topics are the `name` field of the device's `broadcast` envelopes; resource
//! paths are relative to the device base URL. Keep each section alphabetized.

// Streaming topics (Socket.IO `broadcast` names)
pub const TOPIC_ACTIVE_LOGS: &str = "active_logs";
pub const TOPIC_BATTERY_STATUS: &str = "battery_status";
pub const TOPIC_LORA_STATE: &str = "lora_state";
pub const TOPIC_NAVIGATION: &str = "navigation";
pub const TOPIC_OBSERVATIONS: &str = "observations";
pub const TOPIC_POWER_SUPPLY_STATUS: &str = "power_supply_status";
pub const TOPIC_STREAM_STATUS: &str = "stream_status";

/// Topics treated as on-change signals: every accepted value is emitted
/// immediately instead of being rate limited.
pub const DEFAULT_EXEMPT_TOPICS: &[&str] = &[
    TOPIC_ACTIVE_LOGS,
    TOPIC_LORA_STATE,
    TOPIC_POWER_SUPPLY_STATUS,
    TOPIC_STREAM_STATUS,
];

/// Name of the throttle group that owns every topic not listed elsewhere.
pub const DEFAULT_GROUP: &str = "default";

// Polled resources (GET)
pub const RESOURCE_BATTERY: &str = "/battery";
pub const RESOURCE_BLUETOOTH_STATUS: &str = "/bluetooth/status";
pub const RESOURCE_CONFIGURATION: &str = "/configuration";
pub const RESOURCE_INFO: &str = "/info";
pub const RESOURCE_LORA_RSSI: &str = "/lora/rssi";
pub const RESOURCE_LORA_STATE: &str = "/lora/state";
pub const RESOURCE_WIFI_STATUS: &str = "/wifi/status";

/// Resources polled when the configuration does not name any.
pub const DEFAULT_POLL_RESOURCES: &[&str] = &[
    RESOURCE_INFO,
    RESOURCE_CONFIGURATION,
    RESOURCE_WIFI_STATUS,
    RESOURCE_BLUETOOTH_STATUS,
    RESOURCE_LORA_RSSI,
];

// Configuration documents (read-modify-write)
pub const CONFIG_DEVICE: &str = "/configuration/device";
pub const CONFIG_LOGGING: &str = "/logging/settings";
pub const CONFIG_POSITIONING: &str = "/configuration/positioning_settings";

/// Socket.IO event carrying every multiplexed telemetry envelope.
pub const SOCKETIO_BROADCAST_EVENT: &str = "broadcast";
pub const SOCKETIO_DEFAULT_PATH: &str = "/socket.io";

/// Returns true when `topic` bypasses throttling by default.
pub fn is_default_exempt(topic: &str) -> bool {
    DEFAULT_EXEMPT_TOPICS.contains(&topic)
}
