use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    connect_gateway, load_settings, ClientEvent, EncryptionContext, HttpTransport, LocalKeyring,
    Message, OutgoingMessage, PageOutcome, PageRequest, PeerPublicKey, PrivateKey,
    StaticChannelDirectory, StoreChange, SyncEngine, X25519DmCipher,
};
use shared::domain::{ChannelId, MessageId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Prints a channel's recent history and optionally follows it live.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    channel_id: String,
    /// Pages of history to load, newest first.
    #[arg(long, default_value_t = 1)]
    pages: u32,
    /// Send this message before tailing.
    #[arg(long)]
    send: Option<String>,
    /// Keep running and print push updates until ctrl-c.
    #[arg(long)]
    follow: bool,
    /// Base64 X25519 private key; unlocks encrypted DMs.
    #[arg(long)]
    private_key: Option<String>,
    /// Base64 X25519 public key of the DM peer.
    #[arg(long, requires = "peer_user_id")]
    peer_key: Option<String>,
    #[arg(long)]
    peer_user_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let channel_id = ChannelId::new(args.channel_id.clone());

    let settings = load_settings()?;
    let transport = Arc::new(HttpTransport::new(
        &args.server_url,
        args.token.clone(),
        settings.request_timeout,
    )?);

    let keyring = Arc::new(match args.private_key.as_deref() {
        Some(encoded) => LocalKeyring::unlocked(PrivateKey::from_base64(encoded)?),
        None => LocalKeyring::default(),
    });
    let directory = Arc::new(StaticChannelDirectory::default());
    if let (Some(peer_key), Some(peer_user_id)) = (&args.peer_key, &args.peer_user_id) {
        directory.set_context(
            channel_id.clone(),
            EncryptionContext {
                peer_public_key: PeerPublicKey::from_base64(peer_key)?,
                peer_user_id: UserId::new(peer_user_id.clone()),
            },
        );
    }

    let engine = SyncEngine::new_with_dependencies(
        UserId::new(args.user_id.clone()),
        settings,
        transport,
        directory,
        keyring,
        Arc::new(X25519DmCipher),
    );

    load_history(&engine, &channel_id, args.pages).await?;
    engine.settle().await;
    let mut printed = HashSet::new();
    print_new(&engine.messages(&channel_id), &mut printed);

    if let Some(content) = args.send {
        let sent = engine
            .send_message(&channel_id, OutgoingMessage::text(content))
            .await?;
        info!(message_id = %sent.id, "tail: message sent");
        print_new(&engine.messages(&channel_id), &mut printed);
    }

    if args.follow {
        follow(&engine, &channel_id, &args.server_url, &args.token, &mut printed).await?;
    }

    engine.shutdown();
    Ok(())
}

async fn load_history(engine: &SyncEngine, channel_id: &ChannelId, pages: u32) -> Result<()> {
    engine.load_page(channel_id, PageRequest::latest()).await?;
    for _ in 1..pages {
        match engine.load_older(channel_id).await? {
            PageOutcome::Exhausted => break,
            PageOutcome::Loaded { count, has_more } => {
                info!(count, has_more, "tail: loaded older page");
            }
            PageOutcome::AlreadyLoading | PageOutcome::Cancelled => break,
        }
    }
    Ok(())
}

async fn follow(
    engine: &Arc<SyncEngine>,
    channel_id: &ChannelId,
    server_url: &str,
    token: &str,
    printed: &mut HashSet<MessageId>,
) -> Result<()> {
    let mut changes = engine.subscribe();
    let mut events = engine.events();
    let stream = connect_gateway(server_url, token).await?;
    let pump = engine.spawn_event_loop(stream);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("tail: interrupted");
                break;
            }
            change = changes.recv() => match change {
                Ok(StoreChange::Messages(changed)) if &changed == channel_id => {
                    print_new(&engine.messages(channel_id), printed);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "tail: change feed lagged");
                    print_new(&engine.messages(channel_id), printed);
                }
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(ClientEvent::GatewayClosed) | Err(RecvError::Closed) => break,
                Ok(ClientEvent::Notice { category, message }) => {
                    warn!(?category, %message, "tail: notice");
                }
                Err(RecvError::Lagged(_)) => {}
            },
        }
    }

    pump.abort();
    Ok(())
}

fn print_new(messages: &[Message], printed: &mut HashSet<MessageId>) {
    for message in messages {
        if printed.insert(message.id.clone()) {
            println!(
                "[{}] {}: {}",
                message.created_at.format("%Y-%m-%d %H:%M:%S"),
                message.author.username,
                message.content.as_deref().unwrap_or("…")
            );
        }
    }
}
