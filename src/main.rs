//! bluecall - Kommandozeile
//!
//! Status-Events werden ausgegeben sobald sie eintreffen; Ctrl-C legt auf
//! bzw. beendet das Warten auf einen Anruf.

use anyhow::{bail, Context, Result};
use bluecall::call_engine::{CallError, CallEvent, CallSessionController, ConnectionState};
use bluecall::config::CallConfig;
use bluecall::transport::PeerIdentity;
use bluecall::{init_logging, AppState};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "bluecall", version, about = "Point-to-point voice calls over RFCOMM or TCP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for one incoming call
    Listen,
    /// Call a peer by address
    Call {
        /// Bluetooth address or host:port
        address: String,
        /// Name to show and store in the call history
        #[arg(long)]
        name: Option<String>,
        /// Hang up automatically after this many seconds
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },
    /// Scan for nearby devices
    Scan {
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// List paired devices
    Paired,
    /// Show the call history, newest first
    History {
        #[arg(long)]
        json: bool,
    },
    /// Delete all call history entries
    ClearHistory {
        #[arg(long)]
        yes: bool,
    },
}

/// Wie der Anruf zustande kommt
enum CallStart {
    Listen,
    Dial(PeerIdentity),
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = CallConfig::from_env().context("invalid configuration")?;
    if let Command::Call {
        duration: Some(secs),
        ..
    } = &cli.command
    {
        if *secs == 0 {
            bail!("--duration must be greater than zero");
        }
        config.max_call_duration = Some(Duration::from_secs(*secs));
    }

    let state = AppState::init(config).context("failed to initialize bluecall")?;

    match cli.command {
        Command::Listen => run_call(state.controller(), CallStart::Listen),
        Command::Call { address, name, .. } => {
            let peer = state.resolve_peer(&address, name);
            run_call(state.controller(), CallStart::Dial(peer))
        }
        Command::Scan { timeout } => scan(&state, timeout),
        Command::Paired => paired(&state),
        Command::History { json } => history(&state, json),
        Command::ClearHistory { yes } => clear_history(&state, yes),
    }
}

// ============================================================================
// CALLS
// ============================================================================

fn run_call(controller: &CallSessionController, start: CallStart) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(drive_call(controller.clone(), start))
}

async fn drive_call(controller: CallSessionController, start: CallStart) -> Result<()> {
    let mut events = controller.subscribe();

    // Start blockiert (Connect); Events laufen parallel weiter
    let mut starting = {
        let controller = controller.clone();
        tokio::task::spawn_blocking(move || match start {
            CallStart::Listen => controller.start_as_listener(),
            CallStart::Dial(peer) => controller.start_as_initiator(peer),
        })
    };
    let mut started = false;

    loop {
        tokio::select! {
            joined = &mut starting, if !started => {
                started = true;
                match joined.context("call setup task failed")? {
                    Ok(()) => {}
                    // Schon als Failed-Event gemeldet, außer AlreadyInCall
                    Err(CallError::AlreadyInCall) => bail!(CallError::AlreadyInCall),
                    Err(e) => tracing::debug!("Call setup failed: {}", e),
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", event);
                    match event {
                        CallEvent::Ended(_) => return Ok(()),
                        CallEvent::Failed(reason) => bail!(reason),
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {} call events", missed);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => match controller.state() {
                ConnectionState::Listening => {
                    controller.cancel_listening()?;
                    println!("Stopped listening");
                    return Ok(());
                }
                ConnectionState::Connected => {
                    let hang_up = controller.clone();
                    match tokio::task::spawn_blocking(move || hang_up.end_call()).await? {
                        // Ended kommt als Event
                        Ok(_) | Err(CallError::NotConnected) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                other => println!("Cannot interrupt while {}", other),
            },
        }
    }
}

// ============================================================================
// DEVICES
// ============================================================================

fn scan(state: &AppState, timeout: Option<u64>) -> Result<()> {
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(state.config().scan_timeout);

    println!("Scanning for {} sec...", timeout.as_secs());
    let mut found = 0;
    for peer in state.controller().scan(timeout)? {
        println!("{}", peer);
        found += 1;
    }
    println!("Scan complete, {} device(s) found", found);
    Ok(())
}

fn paired(state: &AppState) -> Result<()> {
    let devices = state.controller().paired_devices()?;
    if devices.is_empty() {
        println!("No paired devices");
    }
    for device in devices {
        println!("{}", device);
    }
    Ok(())
}

// ============================================================================
// HISTORY
// ============================================================================

fn history(state: &AppState, json: bool) -> Result<()> {
    let records = state.controller().history().list_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No calls yet");
    } else {
        for record in records {
            println!("{}", record);
        }
    }
    Ok(())
}

fn clear_history(state: &AppState, yes: bool) -> Result<()> {
    if !yes {
        bail!("this deletes all call history entries; pass --yes to confirm");
    }
    let removed = state.controller().history().clear_all()?;
    println!("Removed {} call history entries", removed);
    Ok(())
}
