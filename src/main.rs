use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use auxmerge::config::{Settings, SettingsManager};
use auxmerge::generator::{AuxGenerator, HttpProviderFactory};
use auxmerge::lore::{self, FileLore, StaticMacros};
use auxmerge::reconcile::{Controller, Outcome, spawn_event_loop};
use auxmerge::transcript::{MemoryTranscript, MessageId, Transcript};

/// One line of stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    Append {
        text: String,
        #[serde(default)]
        is_user: bool,
    },
    Received {
        #[serde(default)]
        id: Option<MessageId>,
    },
    Regenerate {
        id: MessageId,
    },
    RegenerateLast,
    Edit {
        id: MessageId,
        text: String,
    },
    Status,
    ListLore,
    SelectLore {
        book: String,
        uid: String,
    },
    DeselectLore {
        book: String,
        uid: String,
    },
    ClearLore,
    TagLore {
        #[serde(default = "default_disable")]
        disable: bool,
    },
}

fn default_disable() -> bool {
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    // ── Settings ─────────────────────────────────────────────────────────
    let settings = match std::env::var("AUXMERGE_SETTINGS") {
        Ok(path) => SettingsManager::load(&path)
            .await
            .with_context(|| format!("loading settings from {path}"))?,
        Err(_) => SettingsManager::new(Settings::default()),
    };
    settings.apply_env().await?;
    let settings = Arc::new(settings);

    // ── Transcript ───────────────────────────────────────────────────────
    let transcript_path = PathBuf::from(
        std::env::var("AUXMERGE_TRANSCRIPT")
            .context("AUXMERGE_TRANSCRIPT must point to a transcript JSON file")?,
    );
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transcript = Arc::new(
        open_transcript(&transcript_path)
            .await?
            .with_change_notifier(event_tx),
    );

    // ── Generator ────────────────────────────────────────────────────────
    let mut generator = AuxGenerator::new(settings.clone(), Arc::new(HttpProviderFactory));
    let lore_source: Option<Arc<FileLore>> = std::env::var("AUXMERGE_LORE_DIR").ok().map(|dir| {
        let books: Vec<String> = std::env::var("AUXMERGE_LORE_BOOKS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
        info!(dir = %dir, books = books.len(), "Lore enabled");
        Arc::new(FileLore::new(dir, books))
    });
    if let Some(source) = &lore_source {
        generator = generator.with_lore(source.clone());
    }
    let character_id = transcript.character_id().await;
    if let Some(character) = character_id.clone() {
        generator = generator.with_macros(Arc::new(StaticMacros::new().with("char", character)));
    }
    let generator = Arc::new(generator);

    // ── Controller ───────────────────────────────────────────────────────
    let controller = Arc::new(Controller::new(
        settings.clone(),
        transcript.clone(),
        generator.clone(),
    ));
    let _events = spawn_event_loop(controller.clone(), event_rx);

    let mut notices = controller.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            eprintln!("[{}] {}", notice.level, notice.message);
        }
    });

    eprintln!("auxmerge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Transcript: {}", transcript_path.display());
    eprintln!("   Generator: {}", generator.status().await);

    // ── Command loop ─────────────────────────────────────────────────────
    let lines = BufReader::new(tokio::io::stdin()).lines();
    let mut commands = Box::pin(futures::stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            Ok(None) => None,
            Err(e) => {
                error!("Error reading stdin: {}", e);
                None
            }
        }
    }));

    while let Some(line) = commands.next().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed command");
                eprintln!("invalid command: {e}");
                continue;
            }
        };

        match command {
            Command::Append { text, is_user } => {
                let id = transcript.push_message(is_user, text);
                println!("{}", serde_json::json!({ "id": id }));
            }
            Command::Received { id } => {
                let outcome = controller.on_message_received(id).await;
                let id = match id {
                    Some(id) => Some(id),
                    None => transcript.last_id().await,
                };
                report(&transcript, id, &outcome);
            }
            Command::Regenerate { id } => {
                let outcome = controller.regenerate(id).await;
                report(&transcript, Some(id), &outcome);
            }
            Command::RegenerateLast => {
                let outcome = controller.regenerate_last().await;
                report(&transcript, transcript.last_id().await, &outcome);
            }
            Command::Edit { id, text } => {
                if let Err(e) = transcript.edit_text(id, text) {
                    eprintln!("edit failed: {e}");
                    continue;
                }
                let outcome = controller.on_message_edited(id).await;
                report(&transcript, Some(id), &outcome);
            }
            Command::Status => {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": generator.status().await.to_string(),
                        "busy": controller.is_busy(),
                        "messages": transcript.len(),
                    })
                );
            }
            Command::ListLore => {
                let Some(source) = lore_source.as_deref() else {
                    eprintln!("lore is not configured (set AUXMERGE_LORE_DIR)");
                    continue;
                };
                let selected = match &character_id {
                    Some(id) => settings.selected_lore_entries(id).await,
                    None => Vec::new(),
                };
                let entries: Vec<_> = lore::bound_entries(source)
                    .await
                    .into_iter()
                    .map(|bound| {
                        let key = bound.selection_key();
                        let is_selected = selected.contains(&key);
                        serde_json::json!({
                            "key": key,
                            "comment": bound.entry.comment,
                            "keys": bound.entry.key,
                            "disabled": bound.entry.disable,
                            "selected": is_selected,
                        })
                    })
                    .collect();
                println!("{}", serde_json::json!({ "entries": entries }));
            }
            Command::SelectLore { book, uid } => {
                let Some(character) = character_id.as_deref() else {
                    eprintln!("no active character for lore selection");
                    continue;
                };
                if let Err(e) = settings.select_lore_entry(character, &book, &uid).await {
                    eprintln!("select failed: {e}");
                }
            }
            Command::DeselectLore { book, uid } => {
                let Some(character) = character_id.as_deref() else {
                    eprintln!("no active character for lore selection");
                    continue;
                };
                if let Err(e) = settings.deselect_lore_entry(character, &book, &uid).await {
                    eprintln!("deselect failed: {e}");
                }
            }
            Command::ClearLore => {
                let Some(character) = character_id.as_deref() else {
                    eprintln!("no active character for lore selection");
                    continue;
                };
                if let Err(e) = settings.clear_selected_lore_entries(character).await {
                    eprintln!("clear failed: {e}");
                }
            }
            Command::TagLore { disable } => {
                let Some(source) = lore_source.as_deref() else {
                    eprintln!("lore is not configured (set AUXMERGE_LORE_DIR)");
                    continue;
                };
                match lore::tag_selected(&settings, source, character_id.as_deref(), disable).await {
                    Ok(summary) => println!(
                        "{}",
                        serde_json::json!({ "tagged": summary.success, "failed": summary.failed })
                    ),
                    Err(e) => eprintln!("tagging failed: {e}"),
                }
            }
        }

        if let Err(e) = transcript.save(&transcript_path).await {
            error!(error = %e, path = %transcript_path.display(), "Failed to save transcript");
        }
    }

    info!("stdin closed, exiting");
    Ok(())
}

/// Logs go to stderr, or to a daily rolling file under `AUXMERGE_LOG_DIR`.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::env::var("AUXMERGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "auxmerge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn open_transcript(path: &Path) -> anyhow::Result<MemoryTranscript> {
    if tokio::fs::try_exists(path).await? {
        MemoryTranscript::load(path)
            .await
            .with_context(|| format!("loading transcript from {}", path.display()))
    } else {
        info!(path = %path.display(), "Transcript not found, starting empty");
        Ok(MemoryTranscript::new(None))
    }
}

fn report(transcript: &MemoryTranscript, id: Option<MessageId>, outcome: &Outcome) {
    let text = id.and_then(|id| transcript.text(id));
    println!(
        "{}",
        serde_json::json!({
            "id": id,
            "outcome": format!("{outcome:?}"),
            "text": text,
        })
    );
}
