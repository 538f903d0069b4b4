//! Noor terminal client - composition root.
//!
//! 1. Parse CLI arguments and initialise logging (stderr)
//! 2. Load configuration from TOML, then apply its log level
//! 3. Wire the HTTP transport, the file session and the notice channel into
//!    a `ChatEngine`
//! 4. Restore history, then read commands and questions from stdin

mod cli;
mod commands;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use noor_chat::{ChatEngine, ChatError, FileSessionStore, HttpTransport, QuotaTracker, SendOutcome};
use noor_core::config::NoorConfig;
use noor_core::types::{Role, SourceFilter, SourceType, Verse};
use noor_core::EngineNotice;

use cli::CliArgs;
use commands::{Command, HELP};

/// How often the answer being written is redrawn.
const REDRAW_INTERVAL: Duration = Duration::from_millis(40);

type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Start logging to stderr. `RUST_LOG` overrides every configured level;
/// otherwise the returned handle applies the level from the config file.
fn init_tracing(level: Option<&str>) -> Option<LogHandle> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = from_env.is_some();
    let filter = from_env
        .or_else(|| level.and_then(|l| EnvFilter::try_new(l).ok()))
        .unwrap_or_else(|| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    (!pinned).then_some(handle)
}

fn apply_log_level(handle: &LogHandle, level: &str) {
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                tracing::warn!(error = %e, "Failed to apply log level");
            }
        }
        Err(e) => tracing::warn!(level, error = %e, "Invalid log level, keeping current"),
    }
}

/// Print whatever the streaming answer gained since the last call.
fn print_progress(engine: &ChatEngine, conversation_id: &str, shown: &mut String) {
    let conversations = engine.conversations();
    let Some(message) = conversations
        .iter()
        .find(|c| c.id == conversation_id)
        .and_then(|c| c.messages.last())
        .filter(|m| m.role == Role::Assistant)
    else {
        return;
    };

    let mut stdout = std::io::stdout();
    match message.content.strip_prefix(shown.as_str()) {
        Some("") => return,
        Some(rest) => {
            let _ = write!(stdout, "{}", rest);
        }
        // Content was replaced by an error text.
        None => {
            let _ = write!(stdout, "\n{}", message.content);
        }
    }
    let _ = stdout.flush();
    shown.clone_from(&message.content);
}

fn print_sources(sources: &[Verse]) {
    for verse in sources {
        let origin = match verse.source_type {
            SourceType::Quran => "Coran",
            SourceType::Hadith => "Hadith",
        };
        println!("  [{} {}] {}", origin, verse.reference, verse.text_fr);
    }
}

/// Send one question and echo the answer as it streams in.
async fn answer(engine: ChatEngine, question: String, filter: SourceFilter) {
    let conversation_id = engine.active_id();
    let mut shown = String::new();
    let mut ticker = tokio::time::interval(REDRAW_INTERVAL);

    let send = engine.send(&question, filter);
    tokio::pin!(send);
    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            _ = ticker.tick() => print_progress(&engine, &conversation_id, &mut shown),
        }
    };
    print_progress(&engine, &conversation_id, &mut shown);

    match result {
        Ok(SendOutcome::Completed) => {
            println!();
            let sources = engine
                .conversations()
                .into_iter()
                .find(|c| c.id == conversation_id)
                .and_then(|c| c.messages.last().and_then(|m| m.sources.clone()));
            if let Some(sources) = sources {
                print_sources(&sources);
            }
        }
        Ok(SendOutcome::Cancelled) => println!(" [stopped]"),
        Ok(SendOutcome::Busy) => eprintln!("An answer is already being written; /stop it first."),
        // Surfaced through notices.
        Err(ChatError::LimitReached { .. }) | Err(ChatError::Unauthenticated) => {}
        Err(e @ (ChatError::EmptyMessage | ChatError::MessageTooLong(_))) => eprintln!("{}", e),
        Err(e) => {
            println!();
            tracing::warn!(error = %e, "Question failed");
        }
    }
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<EngineNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            EngineNotice::AuthRequired => {
                eprintln!("Sign-in required: set NOOR_TOKEN or pass --token.")
            }
            EngineNotice::LimitReached { reset_time } => {
                eprintln!("Daily limit reached. Resets in {}.", reset_time)
            }
            other => tracing::debug!(notice = other.kind(), "Engine notice"),
        }
    }
}

fn list_conversations(engine: &ChatEngine) {
    let active = engine.active_id();
    for (i, conv) in engine.conversations().iter().enumerate() {
        let marker = if conv.id == active { '*' } else { ' ' };
        println!("{} {:>2}. {} ({} messages)", marker, i + 1, conv.title, conv.messages.len());
    }
}

/// Conversation id at a 1-based position of `/list`.
fn conversation_at(engine: &ChatEngine, n: usize) -> Option<String> {
    engine
        .conversations()
        .get(n.checked_sub(1)?)
        .map(|c| c.id.clone())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    let log_handle = init_tracing(args.log_level.as_deref());
    tracing::info!("Starting Noor v{}", env!("CARGO_PKG_VERSION"));

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = NoorConfig::load_or_default(&config_file);
    args.apply(&mut config);
    if let Some(handle) = &log_handle {
        apply_log_level(handle, &config.general.log_level);
    }

    // Session.
    let data_dir = config.general.resolved_data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let session = Arc::new(FileSessionStore::in_dir(&data_dir));

    // Engine.
    let transport = Arc::new(HttpTransport::new(&config.api)?);
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    tokio::spawn(print_notices(notice_rx));

    let engine = ChatEngine::new(transport, config.chat.clone())
        .with_session(session)
        .with_notices(notice_tx)
        .with_quota(QuotaTracker::from_config(&config.quota));
    tracing::info!(url = %config.api.ask_stream_url(), "Chat engine ready");

    match engine.load_history().await {
        Ok(count) => tracing::info!(turns = count, "History loaded"),
        Err(e) => tracing::warn!(error = %e, "Continuing without history"),
    }

    println!("Noor. Ask a question, or /help for commands.");
    let mut filter = config.chat.default_filter;
    let mut in_flight: Option<JoinHandle<()>> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Ask(question) => {
                in_flight = Some(tokio::spawn(answer(engine.clone(), question, filter)));
            }
            Command::NewChat => {
                engine.new_chat();
                println!("New conversation.");
            }
            Command::List => list_conversations(&engine),
            Command::Select(n) => match conversation_at(&engine, n) {
                Some(id) => {
                    if let Err(e) = engine.select_conversation(&id) {
                        tracing::warn!(conversation_id = %id, error = %e, "Select failed");
                        continue;
                    }
                    for message in engine.current_messages() {
                        let who = match message.role {
                            Role::User => ">",
                            Role::Assistant => "<",
                        };
                        println!("{} {}", who, message.content);
                    }
                }
                None => eprintln!("No conversation {}.", n),
            },
            Command::Delete(n) => match conversation_at(&engine, n) {
                Some(id) => match engine.delete_conversation(&id) {
                    Ok(()) => println!("Deleted."),
                    Err(e) => tracing::warn!(conversation_id = %id, error = %e, "Delete failed"),
                },
                None => eprintln!("No conversation {}.", n),
            },
            Command::Stop => {
                if !engine.stop() {
                    eprintln!("Nothing to stop.");
                }
            }
            Command::Filter(f) => {
                filter = f;
                println!("Sources: {}", filter);
            }
            Command::Quota => {
                let quota = engine.quota();
                if quota.limit <= 0 {
                    println!("Unlimited ({} today).", quota.used_today);
                } else {
                    println!("{}/{} today.", quota.used_today, quota.limit);
                }
                if let Some(reset_time) = quota.reset_time {
                    println!("Resets in {}.", reset_time);
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
            Command::Empty => {}
            Command::Invalid(message) => eprintln!("{}", message),
        }
    }

    engine.stop();
    if let Some(handle) = in_flight {
        let _ = handle.await;
    }
    tracing::info!("Noor stopped");
    Ok(())
}
