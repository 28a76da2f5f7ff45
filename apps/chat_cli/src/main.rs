use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ConversationOverview, Identity, SyncClient, SyncEvent};
use shared::domain::{ConversationId, Role, UserId};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// TOML settings file; `sync.toml` when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "doctor", value_parser = parse_role)]
    role: Role,
    #[arg(long)]
    name: String,
    /// Conversation to open after loading the directory.
    #[arg(long, conflicts_with = "with")]
    open: Option<String>,
    /// Open (or create) the conversation with this participant.
    #[arg(long)]
    with: Option<String>,
    /// Message to send once the conversation is open.
    #[arg(long)]
    send: Option<String>,
}

fn parse_role(raw: &str) -> Result<Role, String> {
    match raw.to_ascii_lowercase().as_str() {
        "patient" => Ok(Role::Patient),
        "doctor" => Ok(Role::Doctor),
        "admin" => Ok(Role::Admin),
        other => Err(format!("unknown role {other}")),
    }
}

fn print_directory(conversations: &[ConversationOverview]) {
    for conversation in conversations {
        println!(
            "{:<24} {:<20} unread={:<3} {}",
            conversation.id,
            conversation.participant_other.name,
            conversation.unread_count,
            conversation.last_message_preview.as_deref().unwrap_or("")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let identity = Identity {
        user_id: UserId::from(args.user_id),
        role: args.role,
        name: args.name,
    };

    let client = SyncClient::with_defaults(identity, settings)?;
    let mut events = BroadcastStream::new(client.subscribe_events());
    client.start().await.context("failed to connect")?;

    let count = client.load_all().await?;
    println!("{count} conversations");
    print_directory(&client.conversations().await);

    let opened = match (args.open, args.with) {
        (Some(id), _) => Some(ConversationId::from(id)),
        (None, Some(participant)) => Some(client.create_or_get(&UserId::from(participant)).await?),
        (None, None) => None,
    };
    if let Some(conversation_id) = &opened {
        client.select(conversation_id).await?;
        for message in client.timeline(conversation_id).await.unwrap_or_default() {
            println!("[{}] {}: {}", message.created_at, message.sender_name, message.content);
        }
        if let Some(text) = &args.send {
            let temporary_id = client.send(text).await?;
            info!(temporary_id = %temporary_id, "message queued");
        }
    } else if args.send.is_some() {
        warn!("--send needs --open or --with; nothing sent");
    }

    println!("listening for updates, ctrl-c to quit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(Ok(SyncEvent::TimelineChanged(id))) if opened.as_ref() == Some(&id) => {
                    if let Some(last) = client.timeline(&id).await.and_then(|t| t.last().cloned()) {
                        println!("{}: {} ({:?})", last.sender_name, last.content, last.delivery_state);
                    }
                }
                Some(Ok(SyncEvent::Notice(err))) => warn!(error = %err, "notice"),
                Some(Ok(SyncEvent::ConnectionStateChanged(state))) => info!(?state, "connection"),
                Some(Ok(SyncEvent::Presence { user_name, online, .. })) => {
                    println!("{user_name} is {}", if online { "online" } else { "offline" });
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!(error = %err, "event stream lagged"),
                None => break,
            },
        }
    }

    client.stop().await;
    Ok(())
}
