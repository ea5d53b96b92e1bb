//! Config command - configuration management.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use otokit_config::{OtokitConfig, SessionSection, TunnelSection};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show configuration file paths and which ones are loaded
    Path,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./otokit.toml) instead of user config
        #[arg(long)]
        local: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Path => cmd_path(ctx),
        ConfigCommand::Init { local, force } => cmd_init(local, force),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let mut config = loaded.config.clone();
    if let Some(session) = config.session.as_mut()
        && !session.password.is_empty()
    {
        session.password = "********".to_string();
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("# otokit configuration\n");
    let sources = loaded.loaded_from();
    if sources.is_empty() {
        println!("# No config files loaded (using defaults)\n");
    } else {
        for source in &sources {
            println!("# from {}", source.display());
        }
        println!();
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    if ctx.json_output {
        let paths: Vec<_> = loaded
            .sources
            .iter()
            .map(|s| serde_json::json!({ "path": s.path, "loaded": s.loaded }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&paths)?);
        return Ok(());
    }

    for source in &loaded.sources {
        let marker = if source.loaded { "loaded" } else { "not found" };
        println!("{}  ({})", source.path.display(), marker);
    }
    Ok(())
}

fn cmd_init(local: bool, force: bool) -> Result<()> {
    let path = if local {
        PathBuf::from("otokit.toml")
    } else {
        match otokit_config::user_config_path() {
            Some(path) => path,
            None => bail!("could not determine the user config directory"),
        }
    };

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let config = OtokitConfig {
        session: Some(SessionSection::default()),
        tunnel: Some(TunnelSection::default()),
        ..Default::default()
    };
    otokit_config::save_config(&config, &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
