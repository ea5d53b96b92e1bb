//! Prepare command - reports whether a run could create its tunnel.

use anyhow::Result;
use clap::Args;
use console::style;
use otokit_sync::{ControllerConfig, NotificationBridge, SyncController};
use serde::Serialize;

use super::Context;

/// Arguments for the prepare command.
#[derive(Args, Debug)]
pub struct PrepareArgs {}

#[derive(Debug, Serialize)]
struct PrepareOutput {
    tunnel_available: bool,
}

/// Run the prepare command.
pub async fn run(_args: PrepareArgs, ctx: &Context) -> Result<()> {
    let bridge = NotificationBridge::new();
    let controller = SyncController::new(ControllerConfig::default(), bridge.sink());
    let available = controller.prepare_tunnel();

    if ctx.json_output {
        let output = PrepareOutput {
            tunnel_available: available,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if available {
        println!("{} tunnel interface can be created", style("●").green());
    } else {
        println!(
            "{} tunnel interface unavailable (run as root)",
            style("●").red()
        );
    }
    Ok(())
}
