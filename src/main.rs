/**
 * ============================================================================
 * PRUN RELAY COMMAND LINE
 * ============================================================================
 *
 * COMMANDS:
 * - run:          capture frames from a WebSocket and deliver continuously
 * - login:        log in with username and password
 * - sync:         adopt a website session token
 * - logout:       forget the session (queue is kept)
 * - status:       print session, reachability and queue state
 * - send:         run one delivery pass now
 * - clear-queue:  drop every pending item
 * - message-type: enable or disable one message type
 *
 * ============================================================================
 */

use clap::{Parser, Subcommand};
use prun_relay::relay::config::{default_data_dir, load_config};
use prun_relay::relay::error::RelayError;
use prun_relay::relay::transport::extract_context;
use prun_relay::relay::types::RetryState;
use prun_relay::{Relay, WebSocketSource};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;

const RECONNECT_BASE_MS: u64 = 1000;
const RECONNECT_MULTIPLIER: f64 = 2.0;
const RECONNECT_MAX_MS: u64 = 60_000;
const SESSION_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "prun-relay", version, about = "Capture game events and deliver them to the collector")]
struct Cli {
    /// Directory holding the queue, session and settings files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture from a WebSocket endpoint and deliver until interrupted
    Run {
        /// Engine.IO WebSocket URL to read frames from
        #[arg(long)]
        ws_url: String,
        /// Page URL carrying a context= query parameter
        #[arg(long)]
        page_url: Option<String>,
        /// Explicit capture context (overrides --page-url)
        #[arg(long)]
        context: Option<String>,
    },
    Login {
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Exchange a website token for a relay session
    Sync { web_token: String },
    Logout,
    Status,
    /// Run one delivery pass now
    Send,
    ClearQueue,
    /// Enable or disable a message type
    MessageType {
        message_type: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    prun_relay::init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), RelayError> {
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(&data_dir).map_err(RelayError::Config)?;
    let relay = Relay::open(config, &data_dir)?;

    match cli.command {
        Command::Run {
            ws_url,
            page_url,
            context,
        } => {
            let context = context.or_else(|| page_url.as_deref().and_then(extract_context));
            run_capture(&relay, ws_url, context).await?;
        }
        Command::Login { username, password } => {
            let username = relay.login(&username, &password).await?;
            relay.shutdown().await;
            println!("Logged in as {}", username);
        }
        Command::Sync { web_token } => {
            let username = relay.sync_with_web_token(&web_token).await?;
            relay.shutdown().await;
            println!("Synced session for {}", username);
        }
        Command::Logout => {
            relay.restore_session();
            relay.logout()?;
            println!("Logged out");
        }
        Command::Status => {
            relay.restore_session();
            relay.check_server_status().await;
            print_status(&relay);
        }
        Command::Send => {
            relay.restore_session();
            relay.check_server_status().await;
            let report = relay.force_send().await;
            println!(
                "{:?}: {} sent, {} dropped, {} still pending",
                report.outcome,
                report.sent,
                report.poisoned,
                relay.status().pending_items
            );
        }
        Command::ClearQueue => {
            let removed = relay.clear_queue()?;
            println!("Removed {} pending items", removed);
        }
        Command::MessageType {
            message_type,
            enabled,
        } => {
            relay.update_message_settings(HashMap::from([(message_type.clone(), enabled)]))?;
            println!(
                "{} {}",
                message_type,
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }
    Ok(())
}

fn print_status(relay: &Relay) {
    let status = relay.status();
    println!(
        "Session:        {}",
        status.username.as_deref().unwrap_or("logged out")
    );
    println!(
        "Server:         {}",
        if status.server_reachable { "reachable" } else { "unreachable" }
    );
    println!("Pending items:  {}", status.pending_items);
    println!("Sender state:   {:?}", status.sender_state);
    println!("Interval:       {} ms", status.batch_interval_ms);
    if let Some(error) = &status.last_error {
        println!("Last error:     {}", error);
    }
}

/**
 * Capture loop with reconnect backoff
 * Ctrl-C closes the socket, stops the background tasks and exits
 */
async fn run_capture(relay: &Relay, ws_url: String, context: Option<String>) -> Result<(), RelayError> {
    if !relay.initialize().await? {
        log::warn!("Not logged in; frames are queued and delivery starts once `prun-relay login` saves a session");
    }
    if context.is_some() {
        relay.capture().set_context(context);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source = WebSocketSource::new(ws_url, relay.capture());

    let capture_loop = async {
        let mut retry_state = RetryState::default();
        loop {
            match source.run(shutdown_rx.clone()).await {
                Ok(frames) => {
                    log::info!("Connection closed after {} frames", frames);
                    if frames > 0 {
                        retry_state.reset();
                    }
                }
                Err(e) => log::warn!("Frame source error: {}", e),
            }
            if *shutdown_rx.borrow() {
                break;
            }

            let delay_ms =
                retry_state.calculate_next_delay(RECONNECT_BASE_MS, RECONNECT_MULTIPLIER, RECONNECT_MAX_MS);
            retry_state.increment(delay_ms);
            log::info!(
                "Reconnecting to {} in {} ms (attempt {})",
                source.url(),
                delay_ms,
                retry_state.attempts
            );

            let mut shutdown = shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = shutdown.changed() => break,
            }
        }
    };
    tokio::pin!(capture_loop);

    // Logins from other invocations only touch session.json
    let session_poll = async {
        let mut ticker = tokio::time::interval(SESSION_POLL);
        loop {
            ticker.tick().await;
            relay.adopt_persisted_session().await;
        }
    };

    tokio::select! {
        _ = &mut capture_loop => {}
        _ = session_poll => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            shutdown_tx.send_replace(true);
            capture_loop.await;
        }
    }

    relay.shutdown().await;
    Ok(())
}
