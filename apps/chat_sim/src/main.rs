use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, load_settings_from, ChatClient, ClientEvent, Session};
use serde_json::json;
use shared::{
    domain::{Role, UserId, UserProfile},
    protocol::Table,
};
use storage::MemoryStore;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs two chat sessions against an in-process store and prints what each one sees.
#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./chat.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    messages: usize,
    /// Deliver every realtime insert twice.
    #[arg(long)]
    duplicate_delivery: bool,
    /// Print client events as they happen.
    #[arg(long)]
    trace_events: bool,
}

fn profile(id: &str, username: &str, role: Role) -> UserProfile {
    UserProfile {
        user_id: UserId::from(id),
        username: username.to_string(),
        role,
        avatar_url: None,
    }
}

fn seed(store: &MemoryStore, people: &[&UserProfile]) {
    store.seed(
        Table::Users,
        people.iter().map(|p| {
            json!({
                "id": p.user_id,
                "username": p.username,
                "role": p.role,
            })
        }),
    );
    store.seed(
        Table::Channels,
        [
            json!({ "id": "general", "name": "General", "description": "Default room" }),
            json!({ "id": "random", "name": "Random" }),
        ],
    );
}

async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    info!(?settings, "loaded settings");

    let store = MemoryStore::new();
    store.set_duplicate_delivery(args.duplicate_delivery);
    let alice = profile("alice", "Alice", Role::Admin);
    let bob = profile("bob", "Bob", Role::User);
    seed(&store, &[&alice, &bob]);

    let alice = ChatClient::new(Session::new(alice), Arc::new(store.clone()), settings.clone());
    let bob = ChatClient::new(Session::new(bob), Arc::new(store.clone()), settings);

    if args.trace_events {
        let mut events = bob.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if !matches!(event, ClientEvent::RosterUpdated { .. }) {
                    println!("bob event: {}", serde_json::to_string(&event).unwrap_or_default());
                }
            }
        });
    }

    let channels = alice.list_channels().await?;
    let general = alice
        .default_conversation(&channels)
        .context("no channel to open")?;
    alice.select_conversation(general.clone()).await?;
    bob.select_conversation(general).await?;

    bob.notify_typing().await?;
    settle().await;
    println!("alice sees typing: {:?}", alice.typing_users().await);

    for n in 1..=args.messages {
        alice.send_message(&format!("hello #{n}"), None).await?;
    }
    bob.send_message("hi alice", None).await?;
    settle().await;

    let view = bob.messages().await;
    if let Some(first) = view.first() {
        bob.toggle_reaction(&first.id, "👍").await?;
        alice.pin_message(&first.id).await?;
    }
    settle().await;

    for message in alice.messages().await {
        println!(
            "[{}] {:<6} {} ({:?}, reactions: {})",
            message.sent_at.format("%H:%M:%S"),
            message.author_name.as_deref().unwrap_or("?"),
            message.body,
            message.delivery,
            message.reactions.iter().map(|r| r.count()).sum::<usize>(),
        );
    }
    println!("pinned: {}", alice.pinned().await.len());
    println!(
        "online: {:?}",
        alice
            .online_users()
            .await
            .into_iter()
            .map(|p| p.username)
            .collect::<Vec<_>>()
    );

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
