//! Tracing setup for rover binaries.
//!
//! `RUST_LOG` drives the console filter (default `info`). Setting
//! `ROVER_LOG_ROLL=1` additionally writes the `rover::*` targets to a rolling
//! file under `ROVER_LOG_DIR` (default `logs`).

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Rotation cadence for the optional telemetry log file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_console(filter);
}

fn install_console(filter: EnvFilter) {
    // stdout is reserved for command output.
    let fmt_layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if std::env::var("ROVER_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("ROVER_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let prefix = std::env::var("ROVER_LOG_PREFIX").unwrap_or_else(|_| "rover-bridge".into());
        let rotation = std::env::var("ROVER_LOG_ROTATION")
            .map(|raw| Rotation::parse(&raw))
            .unwrap_or(Rotation::Daily);
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create log directory");
        }
        let writer = match rotation {
            Rotation::Hourly => tracing_appender::rolling::hourly(&dir, &prefix),
            Rotation::Minutely => tracing_appender::rolling::minutely(&dir, &prefix),
            Rotation::Daily => tracing_appender::rolling::daily(&dir, &prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        let targets = Targets::new().with_target("rover", tracing::Level::DEBUG);
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(targets);
        let subscriber = registry.with(file_layer);
        let _ = subscriber.try_init();
    } else {
        let _ = registry.try_init();
    }
}
