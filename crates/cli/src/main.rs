//! `peerlink` command-line driver.
//!
//! `peerlink demo` runs an offering party and an answering party against each
//! other in one process, over the in-memory relay with the loopback engine,
//! and prints the state notifications a presentation layer would receive.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use peerlink_infra_common::logging::log_welcome;
use peerlink_infra_common::setup_logging;
use peerlink_session_core::media::loopback::{LoopbackCapture, LoopbackEngine, LoopbackOptions};
use peerlink_session_core::signaling::MemoryRelay;
use peerlink_session_core::{SessionEvent, SessionHandle, SessionStatus, SessionSupervisor};

use crate::config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "peerlink", author, version, about = "Peer-to-peer session signaling", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect two in-process parties and print their notifications
    Demo {
        /// Identifier of the offering party
        #[arg(long, default_value = "alice")]
        local: String,

        /// Identifier of the answering party
        #[arg(long, default_value = "bob")]
        remote: String,

        /// Milliseconds to hold the session once connected
        #[arg(long)]
        hold_ms: Option<u64>,
    },
    /// Print the effective configuration as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    match cli.command {
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Demo { local, remote, hold_ms } => {
            setup_logging(&config.logging).context("failed to initialise logging")?;
            log_welcome(&config.logging.app_name, env!("CARGO_PKG_VERSION"));
            if let Some(hold_ms) = hold_ms {
                config.demo.hold_ms = hold_ms;
            }
            run_demo(&config, &local, &remote).await
        }
    }
}

fn supervisor_for(local_id: &str, relay: &MemoryRelay, config: &CliConfig) -> Result<SessionSupervisor> {
    let options = LoopbackOptions {
        local_candidates: config.demo.local_candidates,
        ..LoopbackOptions::default()
    };
    let supervisor = SessionSupervisor::builder()
        .local_id(local_id)
        .relay(Arc::new(relay.clone()))
        .engine(Arc::new(LoopbackEngine::with_options(options)))
        .capture(Arc::new(LoopbackCapture::new()))
        .config(config.session.clone())
        .build()
        .with_context(|| format!("failed to build supervisor for {}", local_id))?;
    Ok(supervisor)
}

async fn run_demo(config: &CliConfig, local: &str, remote: &str) -> Result<()> {
    let relay = MemoryRelay::new();
    let offering_side = supervisor_for(local, &relay, config)?;
    let answering_side = supervisor_for(remote, &relay, config)?;

    let printers = [
        tokio::spawn(print_events(local.to_string(), offering_side.subscribe_events())),
        tokio::spawn(print_events(remote.to_string(), answering_side.subscribe_events())),
    ];

    let answering = answering_side.accept(local)?;
    let offering = offering_side.start(remote)?;

    let connect_timeout = Duration::from_millis(config.demo.connect_timeout_ms);
    let outcome = tokio::select! {
        result = tokio::time::timeout(connect_timeout, async {
            tokio::join!(settled(&offering), settled(&answering))
        }) => result.ok(),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, tearing down");
            None
        }
    };

    let connected = match &outcome {
        Some((SessionStatus::Connected, SessionStatus::Connected)) => {
            info!("Both parties connected; holding for {} ms", config.demo.hold_ms);
            tokio::time::sleep(Duration::from_millis(config.demo.hold_ms)).await;
            true
        }
        Some((offerer, answerer)) => {
            warn!("Session did not connect: {} is {:?}, {} is {:?}", local, offerer, remote, answerer);
            false
        }
        None => {
            warn!("Session did not settle within {:?}", connect_timeout);
            false
        }
    };

    offering_side.cancel(&offering).await;
    answering_side.cancel(&answering).await;
    offering_side.shutdown().await;
    answering_side.shutdown().await;

    // Printers end once both supervisors, and with them the event senders, are gone
    drop(offering_side);
    drop(answering_side);
    for printer in printers {
        let _ = printer.await;
    }

    println!(
        "relay entries: {} -> {}: {}, {} -> {}: {}",
        local,
        remote,
        relay.entries(&format!("{}/{}", config.session.relay_root, remote)).len(),
        remote,
        local,
        relay.entries(&format!("{}/{}", config.session.relay_root, local)).len(),
    );

    if !connected {
        bail!("session between {} and {} did not connect", local, remote);
    }
    Ok(())
}

/// Wait until the session is connected or has ended
async fn settled(handle: &SessionHandle) -> SessionStatus {
    let mut status = handle.watch_status();
    loop {
        let current = status.borrow_and_update().clone();
        if current == SessionStatus::Connected || current.is_terminal() {
            return current;
        }
        if status.changed().await.is_err() {
            return status.borrow().clone();
        }
    }
}

async fn print_events(party: String, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StatusChanged { status, timestamp, .. }) => {
                println!("{} [{}] status: {}", timestamp.format("%H:%M:%S%.3f"), party, describe(&status));
            }
            Ok(SessionEvent::NegotiationStateChanged { state, timestamp, .. }) => {
                println!("{} [{}] negotiation: {}", timestamp.format("%H:%M:%S%.3f"), party, state);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("[{}] missed {} notification(s)", party, missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Failed(reason) => format!("Failed ({})", reason),
        other => format!("{:?}", other),
    }
}
