mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use parley_store::{Database, SqliteStore};
use parley_sync::{ChatSession, SyncConfig, SyncResult};
use parley_types::{Attachment, AttachmentKind, Identity, SystemClock};

use commands::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_sync=debug,parley_store=info".into()),
        )
        .init();

    // Config
    let config = SyncConfig::from_env();
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let identity = match std::env::var("PARLEY_USERNAME") {
        Ok(name) if !name.trim().is_empty() => Identity::new(Uuid::new_v4(), name.trim()),
        _ => Identity::guest(),
    };

    // Init store
    let db = if db_path == ":memory:" {
        Database::open_in_memory()?
    } else {
        Database::open(&PathBuf::from(&db_path))?
    };
    let store = Arc::new(SqliteStore::new(db).with_subscription_buffer(config.queue_depth));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session =
        ChatSession::sign_in(store, Arc::new(SystemClock), config, identity, events_tx).await?;
    info!(
        "Signed in as {} ({})",
        session.identity().username,
        session.identity().user_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => print_json(&event),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => match commands::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = run(&session, command).await {
                            warn!("{}", e);
                        }
                    }
                    Err(e) => eprintln!("{}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop_session().await?;
    info!("Signed out");
    Ok(())
}

async fn run(session: &ChatSession, command: Command) -> SyncResult<()> {
    match command {
        Command::Send(text) => {
            session.send_message(&text, None).await?;
        }
        Command::Reply { to, text } => {
            session.send_message(&text, Some(to)).await?;
        }
        Command::Edit { id, text } => report("edit", session.edit_message(id, &text).await?),
        Command::Delete(id) => report("delete", session.delete_message(id).await?),
        Command::Pin(id) => report("pin", session.pin_message(id).await?),
        Command::Unpin(id) => report("unpin", session.set_pinned(id, false).await?),
        Command::React { id, emoji } => {
            let outcome = session.toggle_reaction(id, &emoji).await?;
            info!(%id, emoji = %emoji, ?outcome, "Reaction");
        }
        Command::Attach { mime, url, name } => {
            let attachment = Attachment::new(AttachmentKind::from_mime(&mime), url, name);
            session.send_attachment(attachment, "", None).await?;
        }
        Command::More => session.grow_page_window(0).await?,
        Command::Search(query) => {
            for message in session.search(&query).await? {
                print_json(&message);
            }
        }
        Command::Pinned => {
            for message in session.pinned_messages().await? {
                println!("📌 {} {}", message.id, message.preview(60));
            }
        }
        Command::Typing => session.input_changed(),
        Command::Away => session.stop_typing(),
        Command::Quit | Command::Empty => {}
    }
    Ok(())
}

fn report(action: &str, done: bool) {
    if !done {
        eprintln!("Nothing to {}", action);
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Failed to render event: {}", e),
    }
}
