//! Run command - one score sync from authorization to upload.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use otokit_config::TunnelSection;
use otokit_sync::{ControllerConfig, NotificationBridge, RunReport, RunState, SyncController};
use otokit_types::{RunEvent, SessionConfig};
use tokio::sync::mpsc;
use tracing::info;

use super::Context;

/// Arguments for the run command.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Account name
    #[arg(long, env = "OTOKIT_USERNAME")]
    pub username: Option<String>,

    /// Account password
    #[arg(long, env = "OTOKIT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Identity-provider authorization URL
    #[arg(long)]
    pub auth_url: Option<String>,

    /// LXNS upload URL
    #[arg(long)]
    pub lxns_url: Option<String>,

    /// Diving-Fish upload URL
    #[arg(long)]
    pub df_url: Option<String>,

    /// Difficulties to crawl (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub difficulty: Vec<i32>,

    /// Genres to crawl (repeatable)
    #[arg(long)]
    pub genre: Vec<String>,

    /// Route traffic through the tunnel (requires privileges)
    #[arg(long, conflicts_with = "no_tunnel")]
    pub tunnel: bool,

    /// Never create the tunnel, even if the config enables it
    #[arg(long)]
    pub no_tunnel: bool,

    /// Interface relayed connections leave through (required with the tunnel)
    #[arg(long, conflicts_with = "no_tunnel")]
    pub bind_device: Option<String>,

    /// Seconds to wait for the authorization redirect
    #[arg(long)]
    pub callback_timeout: Option<u64>,
}

impl RunArgs {
    fn apply_session(&self, mut session: SessionConfig) -> SessionConfig {
        if let Some(username) = &self.username {
            session.username = username.clone();
        }
        if let Some(password) = &self.password {
            session.password = password.clone();
        }
        if let Some(url) = &self.auth_url {
            session = session.with_auth_url(url);
        }
        if let Some(url) = &self.lxns_url {
            session = session.with_lxns_upload_url(url);
        }
        if let Some(url) = &self.df_url {
            session = session.with_df_upload_url(url);
        }
        if !self.difficulty.is_empty() {
            session = session.with_difficulties(self.difficulty.iter().copied());
        }
        if !self.genre.is_empty() {
            session = session.with_genres(self.genre.iter().cloned());
        }
        session
    }

    fn apply_controller(
        &self,
        mut config: ControllerConfig,
        tunnel: Option<&TunnelSection>,
    ) -> ControllerConfig {
        if self.no_tunnel {
            config.intercept = None;
        } else if self.tunnel && config.intercept.is_none() {
            config.intercept = Some(tunnel.cloned().unwrap_or_default().intercept_settings());
        }
        if let Some(device) = &self.bind_device
            && let Some(intercept) = config.intercept.as_mut()
        {
            intercept.relay.bind_device = Some(device.clone());
        }
        if let Some(secs) = self.callback_timeout {
            config.orchestrator.callback_timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let session = args.apply_session(loaded.config.session_config()?);
    let controller_config =
        args.apply_controller(loaded.config.controller_config(), loaded.config.tunnel.as_ref());

    let bridge = NotificationBridge::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge.set_listener(tx);

    let mut controller = SyncController::new(controller_config, bridge.sink());
    if let Err(e) = controller.start(session).await {
        bridge.flush().await;
        while let Ok(event) = rx.try_recv() {
            print_event(&event, ctx);
        }
        return Err(e.into());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping run");
                controller.stop().await;
                break;
            }
            event = rx.recv() => match event {
                Some(event) => {
                    print_event(&event, ctx);
                    if event.is_terminal() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let report = controller.wait().await;
    bridge.flush().await;
    while let Ok(event) = rx.try_recv() {
        print_event(&event, ctx);
    }

    let Some(report) = report else {
        bail!("run ended without a report");
    };
    if !ctx.json_output {
        print_report(&report);
    }
    match report.state {
        RunState::Failed => bail!("run failed"),
        _ => Ok(()),
    }
}

fn print_event(event: &RunEvent, ctx: &Context) {
    if ctx.json_output {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }

    let dim = Style::new().dim();
    match event {
        RunEvent::Status { status, is_running } => {
            let status = status.as_deref().unwrap_or("-");
            println!("{} {} (running: {})", dim.apply_to("status"), status, is_running);
        }
        RunEvent::StartAuth { auth_url } => {
            println!("{}", style("Open this URL in WeChat to authorize:").bold());
            println!("  {}", style(auth_url).cyan());
        }
        RunEvent::Progress { line } => println!("{}", line),
        RunEvent::Finish { status, .. } => println!("{}", style(status).green().bold()),
        RunEvent::Error { message } => eprintln!("{} {}", style("error:").red().bold(), message),
    }
}

fn print_report(report: &RunReport) {
    let dim = Style::new().dim();
    println!();
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {}", dim.apply_to("Run:"), report.run_id);
    println!("  {} {}", dim.apply_to("State:"), report.state);
    println!(
        "  {} {}/{}",
        dim.apply_to("Pairs:"),
        report.pairs_total.saturating_sub(report.skipped_pairs.len()),
        report.pairs_total
    );
    println!("  {} {}", dim.apply_to("Uploaded:"), report.records_uploaded);
    if !report.uploaded_endpoints.is_empty() {
        println!(
            "  {} {}",
            dim.apply_to("Endpoints:"),
            report.uploaded_endpoints.join(", ")
        );
    }
}
