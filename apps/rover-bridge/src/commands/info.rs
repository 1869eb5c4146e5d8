use anyhow::Result;
use clap::Args;
use rover_core::transport::Endpoint;
use rover_core::DeviceClient;

use super::{print_json, DeviceArgs};

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Print the whole /info document instead of the identity block
    #[arg(long)]
    pub raw: bool,
    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

pub async fn execute(args: InfoArgs) -> Result<()> {
    let settings = args.device.resolve()?.settings()?;
    let client = DeviceClient::new(Endpoint::parse(&settings.endpoint)?, settings.request_timeout)?;
    let out = if args.raw {
        client.get_json(rover_topics::RESOURCE_INFO).await?
    } else {
        serde_json::to_value(client.info().await?)?
    };
    print_json(&out, args.pretty)
}
