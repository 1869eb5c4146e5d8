use std::time::Duration;

use anyhow::Result;
use clap::Args;
use rover_core::Bridge;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::DeviceArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    pub duration_secs: Option<u64>,
    /// Only print updates for these topics or resources (repeatable)
    #[arg(long = "key")]
    pub keys: Vec<String>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let settings = args.device.resolve()?.settings()?;
    let bridge = Bridge::start(settings)?;

    match bridge.client().info().await {
        Ok(device) => info!(
            target: "rover::bridge",
            model = device.model.as_deref().unwrap_or("unknown"),
            serial = device.serial_number.as_deref().unwrap_or("unknown"),
            version = device.app_version.as_deref().unwrap_or("unknown"),
            "device identified"
        ),
        Err(err) => warn!(target: "rover::bridge", error = %err, "device info unavailable; streaming anyway"),
    }

    let mut updates = bridge.bus().subscribe();
    let stop = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut stop => break,
            next = updates.recv() => match next {
                Ok(update) => {
                    if args.keys.is_empty() || args.keys.iter().any(|k| *k == update.key) {
                        println!("{}", serde_json::to_string(&update)?);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "rover::bridge", skipped, "output fell behind; updates skipped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stats = bridge.shutdown().await;
    info!(
        target: "rover::bridge",
        routed = stats.routed,
        dropped = stats.dropped,
        coalesced = stats.coalesced,
        published = stats.published,
        "stopped"
    );
    Ok(())
}
