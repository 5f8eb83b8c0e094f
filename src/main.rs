//! Voicedesk terminal front end
//!
//! Reads intents from stdin and prints what a graphical front end would
//! render. Commands: `toggle` (or an empty line), `confirm`, `edit`,
//! `cancel`, `quit`. End of input stops any live session and exits.

#![forbid(unsafe_code)]

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voicedesk::audio::PulseBackend;
use voicedesk::config::SessionConfig;
use voicedesk::events::{UiIntent, UiUpdate};
use voicedesk::session::{LifecycleState, SessionManager};
use voicedesk::tool_call::DRAFT_TITLE;
use voicedesk::transport::GeminiConnector;

fn parse_intent(line: &str) -> Option<UiIntent> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "toggle" | "t" => Some(UiIntent::Toggle),
        "confirm" | "c" => Some(UiIntent::Confirm),
        "edit" | "e" => Some(UiIntent::Edit),
        "cancel" | "x" => Some(UiIntent::Cancel),
        _ => None,
    }
}

fn render(update: UiUpdate) {
    match update {
        UiUpdate::State(state) => println!("[{}]", state.control_label()),
        UiUpdate::ShowDraft(draft) => {
            println!("== {} ==", DRAFT_TITLE);
            for (label, value) in draft.rows() {
                println!("  {:<11} {}", format!("{}:", label), value);
            }
            println!("  (confirm / edit / cancel)");
        }
        UiUpdate::ClearDraft => {}
        UiUpdate::StartFailed(reason) => {
            println!("Could not start voice chat: {}", reason);
            println!("Check your microphone and connection, then try again.");
        }
        UiUpdate::Notice(text) => println!("{}", text),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting voicedesk");

    let config = SessionConfig::from_env().context("Failed to load configuration")?;
    let audio = Arc::new(PulseBackend::new(&config.app_name, config.pulse_source.clone()));
    let connector = Arc::new(GeminiConnector::new(&config.url));

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let manager = SessionManager::new(config, audio, connector, ui_tx);
    let session = tokio::spawn(manager.run(intent_rx));

    let printer = tokio::spawn(async move {
        while let Some(update) = ui_rx.recv().await {
            render(update);
        }
    });

    println!("[{}]", LifecycleState::Idle.control_label());
    println!("Press Enter to start or stop. Commands: confirm, edit, cancel, quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().eq_ignore_ascii_case("quit") {
            break;
        }
        match parse_intent(&line) {
            Some(intent) => {
                if intent_tx.send(intent).is_err() {
                    warn!("Session manager stopped");
                    break;
                }
            }
            None => println!("Unknown command: {}", line.trim()),
        }
    }

    drop(intent_tx);
    session.await.context("Session manager task failed")?;
    printer.await.context("Printer task failed")?;
    info!("Goodbye");
    Ok(())
}
