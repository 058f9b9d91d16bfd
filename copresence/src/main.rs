//! `copresence`: line-oriented presence and room sync client.
//!
//! Connects to the push channel, optionally pairs with a partner and joins
//! a room, then reads commands from stdin and prints client events.
//!
//! ```bash
//! copresence --channel-url wss://example.org/ws --api-url https://example.org/api \
//!     --token "$TOKEN" --partner-id bob --room-id r1
//! ```
//!
//! Commands: `complete <topic>`, `reopen <topic>`, `activity <kind> [topic]`,
//! `dnd on|off`, `pair <user>`, `unpair`, `join <room>`, `leave`,
//! `refresh`, `quit`. Any other line counts as user input.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use copresence::client::{ClientCommand, ClientEvent, spawn_client};
use copresence::config::{CliArgs, ClientConfig};
use copresence::connection::ConnectionManager;
use copresence::presence::PairingSource;
use copresence::room::HttpRoomApi;
use copresence::transport::ws::WsConnector;
use copresence_proto::ids::{RoomId, TopicId, UserId};
use copresence_proto::presence::Activity;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("copresence starting");

    match run(config).await {
        Ok(()) => {
            tracing::info!("copresence exiting");
            ExitCode::SUCCESS
        }
        Err(msg) => {
            tracing::error!(err = %msg, "copresence failed");
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Stdout carries client events, so logs go to a file. The returned guard
/// must live until shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("copresence.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: ClientConfig) -> Result<(), String> {
    let token = config.require_token().map_err(|e| e.to_string())?.to_owned();
    let channel_url = config
        .channel_url
        .clone()
        .ok_or("no channel URL configured (--channel-url)")?;
    let api_url = config
        .api_url
        .clone()
        .ok_or("no API URL configured (--api-url)")?;

    let connector = WsConnector::new(channel_url)
        .with_timeouts(config.connect_timeout, config.auth_timeout);
    let api = HttpRoomApi::new(&api_url, token.clone(), config.request_timeout)
        .map_err(|e| e.to_string())?;

    let manager = ConnectionManager::new(connector, config.connection_config());
    let (session, inbound) = manager.connect(&token).await.map_err(|e| e.to_string())?;

    if let Some(expected) = config.user_id.as_deref()
        && expected != session.user_id().as_str()
    {
        tracing::warn!(
            expected,
            bound = %session.user_id(),
            "server bound a different identity than configured"
        );
    }
    println!("connected as {}", session.user_id());

    let (cmd_tx, mut evt_rx) =
        spawn_client(session, inbound, Arc::new(api), config.client_options());

    if let Some(partner) = config.partner_id.clone() {
        let _ = cmd_tx
            .send(ClientCommand::Pair {
                partner: UserId::new(partner),
                source: PairingSource::LocalLink,
            })
            .await;
    }
    if let Some(room) = config.room_id.clone() {
        let _ = cmd_tx.send(ClientCommand::JoinRoom(RoomId::new(room))).await;
    }

    let stdin = tokio::spawn(read_commands(cmd_tx.clone()));

    let mut failure = None;
    while let Some(event) = evt_rx.recv().await {
        print_event(&event);
        if let ClientEvent::SessionEnded(reason) = event {
            failure = reason.map(|e| e.to_string());
            break;
        }
    }
    stdin.abort();

    failure.map_or(Ok(()), Err)
}

async fn read_commands(tx: mpsc::Sender<ClientCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(err = %e, "stdin read failed");
                break;
            }
        };
        let Some(cmd) = parse_line(&line) else {
            continue;
        };
        let quit = matches!(cmd, ClientCommand::Shutdown);
        if tx.send(cmd).await.is_err() || quit {
            return;
        }
    }
    let _ = tx.send(ClientCommand::Shutdown).await;
}

/// Translate one input line into a client command.
fn parse_line(line: &str) -> Option<ClientCommand> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Some(ClientCommand::Input);
    };
    let arg = words.next();
    let cmd = match (verb, arg) {
        ("complete", Some(topic)) => ClientCommand::CompleteTopic(TopicId::new(topic)),
        ("reopen", Some(topic)) => ClientCommand::ReopenTopic(TopicId::new(topic)),
        ("activity", Some(kind)) => ClientCommand::ReportActivity(match words.next() {
            Some(topic) => Activity::new(kind, topic),
            None => Activity::kind_only(kind),
        }),
        ("dnd", Some("on")) => ClientCommand::SetDoNotDisturb(true),
        ("dnd", Some("off")) => ClientCommand::SetDoNotDisturb(false),
        ("pair", Some(user)) => ClientCommand::Pair {
            partner: UserId::new(user),
            source: PairingSource::LocalLink,
        },
        ("unpair", None) => ClientCommand::Unpair,
        ("join", Some(room)) => ClientCommand::JoinRoom(RoomId::new(room)),
        ("leave", None) => ClientCommand::LeaveRoom,
        ("refresh", None) => ClientCommand::Refresh,
        ("quit" | "exit", None) => ClientCommand::Shutdown,
        _ => {
            eprintln!("unrecognized command: {line}");
            return None;
        }
    };
    Some(cmd)
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connection(state) => println!("connection: {state}"),
        ClientEvent::Reconnecting { attempt, delay } => {
            println!("reconnecting (attempt {attempt}, in {delay:?})");
        }
        ClientEvent::PresenceChanged(t) => println!("you: {} -> {}", t.from, t.to),
        ClientEvent::ActivityChanged(a) => println!("you: doing {}", a.kind),
        ClientEvent::PartnerPresence { partner, entry } => match entry {
            Some(entry) => println!("{partner}: {}", entry.status),
            None => println!("{partner}: unknown"),
        },
        ClientEvent::Paired(ctx) => println!("paired with {} (epoch {})", ctx.partner_id, ctx.epoch),
        ClientEvent::Unpaired { partner } => println!("unpaired from {partner}"),
        ClientEvent::RoomUpdated(room) => println!(
            "room {}: {:.0}% ({} members, {} messages)",
            room.room_id,
            room.progress.overall_percent,
            room.members.len(),
            room.messages.len()
        ),
        ClientEvent::MutationConfirmed { topic, .. } => println!("saved: {topic}"),
        ClientEvent::MutationFailed { topic, error, .. } => {
            println!("not saved: {topic} ({error})");
        }
        ClientEvent::Error(e) => println!("error: {e}"),
        ClientEvent::SessionEnded(None) => println!("session ended"),
        ClientEvent::SessionEnded(Some(e)) => println!("session ended: {e}"),
    }
}
