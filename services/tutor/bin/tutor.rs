//! Terminal front end for the voice tutor.
//!
//! Wires a real `Session` to the default microphone and speaker and the Live
//! endpoint, then reads game events and commands from stdin:
//!
//! ```text
//! position <fen>          replace the current position
//! move <san> [fen-after]  you moved (evaluated, then commented on)
//! reply <san>             your opponent moved
//! check | end             your king is in check / the game is over
//! say <text>              talk to the tutor by text
//! ask <question>          ask the text coach (no voice)
//! mic on | mic off        start / stop streaming your voice
//! hush                    cut the tutor off
//! status | reconnect | quit
//! ```

use anyhow::{Context, bail};
use async_openai::config::OpenAIConfig;
use clap::Parser;
use gambit_core::llm_client::ask_coach;
use gambit_core::{GameEvent, HttpEvaluator, OpenAICompatibleClient, PositionEvaluator, Side};
use gambit_tutor::audio::{CpalInput, CpalOutput};
use gambit_tutor::config::{Config, load_prompts, system_instruction};
use gambit_tutor::{ConnectError, Session};
use gemini_live::WsConnector;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Talk through a chess game with a voice tutor")]
struct Args {
    /// Your name, as the tutor should call you.
    #[arg(long, default_value = "the player")]
    name: String,
    /// The side you play.
    #[arg(long, default_value = "white")]
    side: Side,
    /// Starting position as FEN.
    #[arg(long, default_value = "")]
    position: String,
    /// Do not open the microphone automatically after connecting.
    #[arg(long)]
    no_mic: bool,
}

/// Connects, backing off between transient failures until the session's
/// own attempt budget turns the failure fatal.
async fn connect_with_retry(session: &Session) -> anyhow::Result<()> {
    let mut delay = Duration::from_secs(1);
    loop {
        match session.try_connect().await {
            Ok(()) => return Ok(()),
            Err(ConnectError::Busy) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e).context("Cannot reach the tutor"),
            Err(e) => {
                warn!(error = %e, retry_in = ?delay, "Connection attempt failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(16));
            }
        }
    }
}

/// Streams the tutor's transcript to stdout and reconnects after transient
/// drops. Closes the user asked for (`reconnect`, `quit`) are left alone.
fn spawn_watcher(session: Arc<Session>) {
    let mut state = session.subscribe();
    tokio::spawn(async move {
        let mut printed = String::new();
        let mut was_active = false;
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();

            if current.last_transcript != printed {
                let mut out = std::io::stdout().lock();
                match current.last_transcript.strip_prefix(printed.as_str()) {
                    Some(delta) if !printed.is_empty() => {
                        let _ = write!(out, "{delta}");
                    }
                    _ => {
                        let _ = write!(out, "\ntutor> {}", current.last_transcript);
                    }
                }
                let _ = out.flush();
                printed = current.last_transcript.clone();
            }

            let active = current.connected();
            if was_active && current.closed_remotely() {
                info!("Connection dropped; reconnecting");
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(e) = connect_with_retry(&session).await {
                        warn!(error = %e, "Giving up on reconnecting");
                    }
                });
            }
            if current.fatal() {
                if let Some(error) = &current.last_error {
                    println!("\nSession failed permanently: {error}");
                }
            }
            was_active = active;
        }
    });
}

async fn handle_command(
    line: &str,
    session: &Session,
    evaluator: &dyn PositionEvaluator,
    coach: &OpenAICompatibleClient,
    args: &Args,
) -> anyhow::Result<bool> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "" => {}
        "position" => session.push_context(rest, args.side, &args.name),
        "move" => {
            let (mv, fen_after) = rest.split_once(' ').unwrap_or((rest, ""));
            if mv.is_empty() {
                bail!("usage: move <san> [fen-after]");
            }
            if !fen_after.trim().is_empty() {
                session.push_context(fen_after.trim(), args.side, &args.name);
            }
            let position = session.context().position;
            let event = GameEvent::evaluated_move(evaluator, &position, mv).await;
            session.send_event(&event);
        }
        "reply" => session.send_event(&GameEvent::RemoteMove { mv: rest.to_string() }),
        "check" => session.send_event(&GameEvent::Check),
        "end" => session.send_event(&GameEvent::SessionEnd),
        "say" => session.send_chat(rest),
        "ask" => {
            let answer = ask_coach(coach, &session.context(), rest).await;
            if answer.is_empty() {
                println!("coach> (no answer)");
            } else {
                println!("coach> {answer}");
            }
        }
        "mic" => match rest {
            "on" => {
                if !session.start_capture() {
                    println!("Microphone not started (not connected, already on, or unavailable).");
                }
            }
            "off" => session.stop_capture(),
            _ => bail!("usage: mic on|off"),
        },
        "hush" => session.interrupt(),
        "status" => {
            let state = session.state();
            println!(
                "status={} attempts={} listening={} speaking={} error={}",
                state.status,
                state.reconnect_attempts,
                state.listening,
                state.speaking,
                state.last_error.as_deref().unwrap_or("-"),
            );
        }
        "reconnect" => {
            session.disconnect();
            connect_with_retry(session).await?;
        }
        "quit" | "exit" => return Ok(false),
        other => bail!("unknown command '{other}'"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Initializing session...");

    // --- 3. Initialize Collaborators ---
    let prompts = match load_prompts(&config.prompts_path) {
        Ok(prompts) => prompts,
        Err(e) => {
            warn!(error = %e, "Using the built-in tutor persona");
            Default::default()
        }
    };
    let evaluator = HttpEvaluator::new(&config.evaluation_url, config.collaborator_timeout)
        .context("Failed to build evaluation client")?;
    let coach = OpenAICompatibleClient::new(
        OpenAIConfig::new()
            .with_api_key(&config.gemini_api_key)
            .with_api_base(&config.chat_api_base),
        config.chat_model.clone(),
        config.collaborator_timeout,
    );

    // --- 4. Build the Session ---
    let connector = Arc::new(WsConnector::with_api_key(
        &config.live_url,
        &config.gemini_api_key,
    ));
    let session = Arc::new(Session::new(
        config.session_config(system_instruction(&prompts)),
        connector,
        Arc::new(CpalInput),
        Arc::new(CpalOutput),
    ));
    session.push_context(&args.position, args.side, &args.name);
    spawn_watcher(session.clone());

    connect_with_retry(&session).await?;
    session.send_event(&GameEvent::SessionStart);
    if !args.no_mic && !session.start_capture() {
        warn!("Microphone unavailable; use 'say <text>' to talk to the tutor");
    }

    // --- 5. Command Loop ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match handle_command(line.trim(), &session, &evaluator, &coach, &args).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            }
        }
    }

    session.disconnect();
    Ok(())
}
