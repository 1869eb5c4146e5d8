use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use rover_core::BridgeConfig;

pub mod config;
pub mod info;
pub mod run;
pub mod schema;

pub use config::{GetArgs, SetArgs};
pub use info::InfoArgs;
pub use run::RunArgs;
pub use schema::SchemaArgs;

/// Options shared by every command that talks to a device.
#[derive(Args, Clone, Debug)]
pub struct DeviceArgs {
    /// TOML configuration file
    #[arg(long, env = "ROVER_CONFIG")]
    pub config: Option<PathBuf>,
    /// Device host; overrides the file and ROVER_HOST
    #[arg(long)]
    pub host: Option<String>,
}

impl DeviceArgs {
    /// File values, then environment overrides, then command-line flags.
    pub fn resolve(&self) -> Result<BridgeConfig> {
        let mut cfg = match &self.config {
            Some(path) => rover_core::load_config(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BridgeConfig::default(),
        };
        cfg.apply_env_overrides()?;
        if let Some(host) = &self.host {
            cfg.device.host = Some(host.clone());
        }
        Ok(cfg)
    }
}

pub fn print_json(value: &serde_json::Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}
