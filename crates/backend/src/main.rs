//! dutlink
//!
//! Command-line front end: bring a device-under-test up and down, grab a
//! screenshot from its video stream, and probe capture devices.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dutlink_backend::{BackendSession, PowerAction};
use dutlink_common::BackendConfig;
use dutlink_console::{ConnectArgs, DvTimingsProbe, VideoStreamConsole};
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "dutlink")]
#[command(about = "dutlink - hardware and VM test backend")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DUTLINK_CONFIG", default_value = "dutlink.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the device up, wait for Ctrl-C, then stop it
    Start,

    /// Run a power action (on, off, reset)
    Power {
        action: String,
    },

    /// Eject removable media
    Eject,

    /// Save the next frame of the video stream as PNG
    Snapshot {
        /// Output file
        #[arg(short, long, default_value = "screen.png")]
        output: PathBuf,

        /// Stream URL, defaults to video.url from the configuration
        #[arg(long)]
        url: Option<String>,

        /// Give up after this many seconds without a frame
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },

    /// Print the DV timings of a capture device as JSON
    Timings {
        /// Capture device
        #[arg(long, default_value = "/dev/video0")]
        device: String,
    },

    /// Print the shutdown-probe result as JSON
    ShutdownState,
}

fn init_logging(debug: bool, json_logs: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.json_logs);

    let config = BackendConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Start => run_session(config).await,
        Commands::Power { action } => {
            let action: PowerAction = action.parse()?;
            tokio::task::spawn_blocking(move || BackendSession::new(config).power(action))
                .await??;
            Ok(())
        }
        Commands::Eject => {
            tokio::task::spawn_blocking(move || BackendSession::new(config).eject_media())
                .await??;
            Ok(())
        }
        Commands::Snapshot {
            output,
            url,
            timeout_secs,
        } => {
            let timeout = Duration::from_secs(timeout_secs);
            tokio::task::spawn_blocking(move || snapshot(config, url, output, timeout)).await?
        }
        Commands::Timings { device } => {
            let video = config.video;
            let probe = DvTimingsProbe::new(
                video.v4l2_ctl_binary.clone(),
                video.cmd_prefix_words(),
                device,
            );
            let (probe, timings) = tokio::task::spawn_blocking(move || {
                let timings = probe.query();
                (probe, timings)
            })
            .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "device": probe.device(),
                    "supported": timings.is_some(),
                    "timings": timings.unwrap_or_default(),
                }))?
            );
            Ok(())
        }
        Commands::ShutdownState => {
            let state =
                tokio::task::spawn_blocking(move || BackendSession::new(config).is_shutdown())
                    .await??;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "state": state,
                    "shut_down": state.as_bool(),
                }))?
            );
            Ok(())
        }
    }
}

async fn run_session(config: BackendConfig) -> anyhow::Result<()> {
    let session = tokio::task::spawn_blocking(move || {
        let mut session = BackendSession::new(config);
        session.start().map(|_| session)
    })
    .await??;

    let waited = wait_for_shutdown(&session).await;
    finish_session(session, waited).await
}

async fn wait_for_shutdown(session: &BackendSession) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&session.status())?);
    info!("Session {} running, press Ctrl-C to stop", session.id());

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    Ok(())
}

/// Stop and drop `session` on a blocking thread, whatever `waited` says
async fn finish_session(session: BackendSession, waited: anyhow::Result<()>) -> anyhow::Result<()> {
    let report = tokio::task::spawn_blocking(move || {
        let mut session = session;
        session.stop()
    })
    .await?;

    for error in &report.errors {
        warn!("{}", error);
    }
    waited?;
    if !report.is_clean() {
        anyhow::bail!("session stopped with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn snapshot(
    config: BackendConfig,
    url: Option<String>,
    output: PathBuf,
    timeout: Duration,
) -> anyhow::Result<()> {
    let args = match url {
        Some(url) => ConnectArgs {
            edid: config.video.edid.clone(),
            ..ConnectArgs::new(url)
        },
        None => ConnectArgs::from_config(&config.video, None)?,
    };

    let mut console = VideoStreamConsole::new(config.video);
    console.connect_remote(args)?;

    let deadline = Instant::now() + timeout;
    let frame = loop {
        console.request_screen_update()?;
        if let Some(frame) = console.current_frame() {
            break frame;
        }
        if Instant::now() >= deadline {
            console.disable()?;
            anyhow::bail!("no frame within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    console.disable()?;

    std::fs::write(&output, frame.to_png()?)
        .with_context(|| format!("writing {}", output.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "output": output,
            "width": frame.width(),
            "height": frame.height(),
            "format": frame.format(),
            "captured_at": frame.captured_at(),
        }))?
    );
    Ok(())
}
