use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use rover_core::coordinator::HttpDocumentStore;
use rover_core::transport::Endpoint;
use rover_core::{ConfigCoordinator, DeviceClient};
use serde_json::Value;

use super::{print_json, DeviceArgs};

/// Maps a short alias to a resource path; anything starting with `/` passes
/// through unchanged.
pub fn resource_path(name: &str) -> Result<String> {
    let path = match name {
        "device" => rover_topics::CONFIG_DEVICE,
        "positioning" | "positioning_settings" => rover_topics::CONFIG_POSITIONING,
        "logging" => rover_topics::CONFIG_LOGGING,
        "configuration" => rover_topics::RESOURCE_CONFIGURATION,
        other if other.starts_with('/') => other,
        other => bail!(
            "unknown resource `{other}` (use device, positioning, logging, configuration or a /path)"
        ),
    };
    Ok(path.to_string())
}

#[derive(Args, Debug)]
pub struct GetArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// device, positioning, logging, configuration, or a resource path
    #[arg(long, default_value = "device")]
    pub resource: String,
    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// device, positioning, logging, configuration, or a resource path
    #[arg(long)]
    pub resource: String,
    /// Partial JSON object to merge into the document
    #[arg(long, conflicts_with = "patch_file")]
    pub patch: Option<String>,
    /// Read the patch from a file
    #[arg(long)]
    pub patch_file: Option<PathBuf>,
    /// Pretty-print the resulting document
    #[arg(long)]
    pub pretty: bool,
}

fn coordinator(device: &DeviceArgs) -> Result<ConfigCoordinator> {
    let cfg = device.resolve()?;
    let settings = cfg.settings()?;
    let client = DeviceClient::new(Endpoint::parse(&settings.endpoint)?, settings.request_timeout)?;
    Ok(ConfigCoordinator::new(
        HttpDocumentStore::new(&client, settings.write_method),
        settings.coordinator,
    ))
}

pub async fn get(args: GetArgs) -> Result<()> {
    let resource = resource_path(&args.resource)?;
    let doc = coordinator(&args.device)?.read(&resource).await?;
    print_json(&doc, args.pretty)
}

pub async fn set(args: SetArgs) -> Result<()> {
    let resource = resource_path(&args.resource)?;
    let raw = match (&args.patch, &args.patch_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => bail!("provide --patch or --patch-file"),
    };
    let patch: Value = serde_json::from_str(&raw).context("patch is not valid JSON")?;
    let merged = coordinator(&args.device)?.apply(&resource, patch).await?;
    print_json(&merged, args.pretty)
}
