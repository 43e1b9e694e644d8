//! # scoutd: Scout Daemon
//!
//! Thin orchestration binary around [`scout_bridge::BridgeAgent`]:
//! - loads configuration and initializes logging
//! - starts the bridge and, with `--sim`, a simulated advertiser feed
//! - reads shadow commands from stdin
//! - exits non-zero on a fatal bridge error

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scout_bridge::{BridgeAgent, BridgeConfig, Event, EventSink, ShadowHandle};
use scout_core::Observation;

#[derive(Debug, Parser)]
#[command(name = "scoutd", about = "Observation-to-cloud bridge daemon")]
struct Cli {
    /// Path to the config file (defaults to the platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Feed a simulated observation scenario instead of real input.
    /// Currently the only scenario is "one_advertiser".
    #[arg(long, value_name = "SCENARIO")]
    sim: Option<String>,

    /// Log filter, e.g. "info" or "scout_bridge=debug".
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .init();

    let config = match BridgeConfig::load(cli.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            error!(?e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let source_id = config.device.source_id.clone();
    let mut agent = match BridgeAgent::start(config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(?e, "Failed to start bridge agent");
            return ExitCode::FAILURE;
        }
    };

    match cli.sim.as_deref() {
        Some("one_advertiser") => {
            tokio::spawn(simulated_feed(agent.event_sink(), source_id));
        }
        Some(other) => {
            error!(scenario = %other, "Unknown simulation scenario");
            return ExitCode::FAILURE;
        }
        None => {}
    }

    let (console_exit_tx, mut console_exit_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(console(agent.shadow(), console_exit_tx));

    let exit_code = tokio::select! {
        fatal = agent.wait() => {
            match fatal {
                Some(e) => {
                    error!(%e, "Bridge failed");
                    ExitCode::FAILURE
                }
                None => ExitCode::SUCCESS,
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            ExitCode::SUCCESS
        }
        _ = console_exit_rx.recv() => {
            info!("Console exit, shutting down");
            ExitCode::SUCCESS
        }
    };

    if let Err(e) = agent.shutdown().await {
        warn!(?e, "Shutdown was not clean");
    }

    exit_code
}

/// Emits one simulated advertiser observation per second.
///
/// The RSSI walks a small deterministic cycle so consecutive records are
/// distinguishable without pulling in a random number generator.
async fn simulated_feed(sink: EventSink, source_id: String) {
    info!("Simulated advertiser feed running");
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut tick: u64 = 0;

    loop {
        interval.tick().await;

        let rssi = -60.0 - (tick % 7) as f64;
        let observation = Observation::now(&source_id)
            .with_names(Some("one_advertiser".into()), None)
            .with_rssi(rssi)
            .with_address("00:11:22:33:44:55");

        match Event::record(&observation) {
            Ok(event) => sink.push(event),
            Err(e) => warn!(?e, "Failed to record simulated observation"),
        }
        tick += 1;
    }
}

/// Line console on stdin for driving the shadow.
///
/// Commands:
/// - `set <json>`: set the tracked property (e.g. `set 5`)
/// - `clear`: delete the shadow document contents
/// - `value`: print the current local value
/// - `exit`: stop the daemon
async fn console(shadow: ShadowHandle, exit_tx: tokio::sync::mpsc::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };

        match command {
            "set" => match serde_json::from_str(rest) {
                Ok(value) => {
                    if let Err(e) = shadow.set(value).await {
                        warn!(?e, "Set failed");
                    }
                }
                Err(_) => warn!(input = %rest, "Not valid JSON"),
            },
            "clear" => {
                if let Err(e) = shadow.clear().await {
                    warn!(?e, "Clear failed");
                }
            }
            "value" => {
                info!(value = ?shadow.value(), "Current shadow value");
            }
            "exit" | "quit" => {
                let _ = exit_tx.send(()).await;
                return;
            }
            _ => warn!(command = %command, "Unknown command (set/clear/value/exit)"),
        }
    }
}
