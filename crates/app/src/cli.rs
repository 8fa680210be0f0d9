use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::surveillance::{self, ServeArgs, SurveillanceConfig};

#[derive(Debug, Parser)]
#[command(name = "sentinel", version)]
#[command(about = "Camera surveillance: live detection, alert ledger, and session recording")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the detection service and its HTTP control surface.
    Serve(ServeArgs),
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => surveillance::run(SurveillanceConfig::try_from(args)?),
    }
}
