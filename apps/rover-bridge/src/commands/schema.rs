use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use super::print_json;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub fn execute(args: SchemaArgs) -> Result<()> {
    match args.out {
        Some(path) => {
            rover_core::write_schema_file(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {}", path.display());
            Ok(())
        }
        None => print_json(&rover_core::config_schema_json(), true),
    }
}
