//! clara-kiosk: headless CLARA kiosk shell.
//!
//! Holds one shared link to the backend and mirrors what the kiosk screen
//! would show. State and phase changes are written to stdout as JSON
//! envelopes; logs go to stderr. Operator commands are read from stdin
//! (`help` lists them).

mod commands;
mod config;
mod envelope;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clara_link::{AppState, LinkHandle, Payload, Session};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use commands::KioskCommand;
use config::{Config, Resolved};
use envelope::{DomainEvent, Emitter, EventEnvelope};

#[derive(Parser, Debug)]
#[command(name = "clara-kiosk", about = "Headless CLARA kiosk shell")]
struct Cli {
    /// Backend WebSocket endpoint (default: ws://localhost:8000/ws/clara)
    #[arg(long, env = "CLARA_WS_URL")]
    endpoint: Option<String>,

    /// Config file (default: ~/.config/clara/kiosk.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start in this state (0-8) regardless of what the backend pushes first
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=8))]
    state: Option<u8>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "clara_kiosk=info,clara_link=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn emit(envelope: &EventEnvelope) -> Result<()> {
    println!("{}", serde_json::to_string(envelope)?);
    Ok(())
}

fn emit_all(envelopes: &[EventEnvelope]) -> Result<()> {
    envelopes.iter().try_for_each(emit)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let path = cli.config.clone().unwrap_or_else(config::config_path);
    let file = Config::load(&path);
    let resolved = Resolved::merge(&cli, &file);
    tracing::info!(endpoint = %resolved.endpoint, config = %path.display(), "Starting kiosk");

    let (link, task) = LinkHandle::spawn(resolved.link.clone());
    let mut session = link.subscribe(resolved.endpoint.clone()).await?;
    if let Some(state) = resolved.start_state {
        session.override_state(state, Payload::null()).await;
    }

    let mut emitter = Emitter::new();
    emit_all(&emitter.diff(&session.view()))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            changed = session.changed() => match changed {
                Ok(view) => emit_all(&emitter.diff(&view))?,
                Err(e) => {
                    tracing::warn!(error = %e, "Link stopped");
                    break;
                }
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !run_command(&line, &session, &mut emitter).await? {
                        break;
                    }
                }
                None => {
                    tracing::debug!("stdin closed, running until interrupted");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    drop(session);
    link.shutdown().await;
    task.await?;
    Ok(())
}

/// Run one operator command. Returns `false` to quit.
async fn run_command(line: &str, session: &Session, emitter: &mut Emitter) -> Result<bool> {
    let command = match KioskCommand::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(true),
        Err(e) => {
            emit(&emitter.wrap(DomainEvent::Notice {
                text: e.to_string(),
            }))?;
            return Ok(true);
        }
    };

    match command {
        KioskCommand::Send(intent) => {
            let optimistic = commands::optimistic_state(&intent);
            deliver(session, emitter, serde_json::to_value(&intent)?, optimistic).await?;
        }
        KioskCommand::Raw(message) => deliver(session, emitter, message, None).await?,
        KioskCommand::SetState(state) => {
            session.override_state(state, session.view().payload).await;
        }
        KioskCommand::Retry => {
            session.retry_connect().await;
            emit(&emitter.wrap(DomainEvent::Notice {
                text: "retrying connection".to_string(),
            }))?;
        }
        KioskCommand::Status => emit_all(&emitter.status(&session.view()))?,
        KioskCommand::Help => emit(&emitter.wrap(DomainEvent::Notice {
            text: commands::HELP.to_string(),
        }))?,
        KioskCommand::Quit => return Ok(false),
    }
    Ok(true)
}

async fn deliver(
    session: &Session,
    emitter: &mut Emitter,
    message: Value,
    optimistic: Option<AppState>,
) -> Result<()> {
    if session.send(&message).await {
        if let Some(state) = optimistic {
            session.override_state(state, session.view().payload).await;
        }
        return Ok(());
    }
    let phase = session.view().phase;
    tracing::warn!(%phase, "Not connected, message dropped");
    emit(&emitter.wrap(DomainEvent::SendFailed { message, phase }))
}
