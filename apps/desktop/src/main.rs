use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ChannelListUpdate, DayGroup, MessageRow, MessageUpdate, SessionUser, SyncSession,
};
use futures::StreamExt;
use shared::domain::{Channel, ChannelId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to `client.toml` in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    user_name: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh and print the channel list.
    Channels,
    /// Open a channel and print updates until interrupted.
    Open { channel_id: String },
    Send { channel_id: String, text: String },
    Create {
        name: String,
        #[arg(long)]
        logo: Option<String>,
    },
    Delete { channel_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,client_core=debug")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let session = SyncSession::from_settings(&settings).await?;
    if let Some(user_id) = args.user_id {
        let name = args.user_name.unwrap_or_else(|| user_id.clone());
        session.set_user(SessionUser::new(user_id, name));
    }

    let outcome = run(&session, args.command).await;
    session.shutdown().await;
    outcome
}

async fn run(session: &SyncSession, command: Command) -> Result<()> {
    match command {
        Command::Channels => {
            let mut updates = session.channel_updates();
            let refreshed = session.refresh_channels().await;
            // The cached snapshot was emitted before the remote pass finished.
            if let Some(ChannelListUpdate::Snapshot(cached)) = updates.next().await {
                info!(cached = cached.len(), "desktop: cached channels loaded");
            }
            for channel in refreshed? {
                print_channel(&channel);
            }
        }
        Command::Open { channel_id } => {
            let mut updates = session.open(ChannelId::new(channel_id)).await;
            loop {
                tokio::select! {
                    update = updates.next() => match update {
                        Some(update) => print_update(&update),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Send { channel_id, text } => {
            let mut updates = session.open(ChannelId::new(channel_id)).await;
            // Wait for the first remote pass so the send lands after history.
            let mut snapshots = 0;
            while let Some(update) = updates.next().await {
                print_update(&update);
                if matches!(update, MessageUpdate::Snapshot(_) | MessageUpdate::Failed(_)) {
                    snapshots += 1;
                }
                if snapshots >= 2 {
                    break;
                }
            }
            let row = session.send(&text).await?;
            println!("sent {}", row.message.id);
        }
        Command::Create { name, logo } => {
            let channel = session.create_channel(&name, logo.as_deref()).await?;
            print_channel(&channel);
        }
        Command::Delete { channel_id } => {
            session.delete_channel(&ChannelId::new(channel_id.clone())).await?;
            println!("deleted {channel_id}");
        }
    }
    Ok(())
}

fn print_channel(channel: &Channel) {
    let activity = channel
        .last_activity
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".into());
    println!(
        "{:<24} {:<24} {:<26} {}",
        channel.id,
        channel.name,
        activity,
        channel.last_message.as_deref().unwrap_or("")
    );
}

fn print_row(row: &MessageRow) {
    let marker = if row.mine { '>' } else { ' ' };
    println!(
        "{marker} {} {:<16} {}",
        row.message.timestamp.format("%H:%M"),
        row.message.author_name,
        row.message.text
    );
}

fn print_day(group: &DayGroup) {
    println!("-- {} --", group.day);
    for row in &group.rows {
        print_row(row);
    }
}

fn print_update(update: &MessageUpdate) {
    match update {
        MessageUpdate::Snapshot(groups) => groups.iter().for_each(print_day),
        MessageUpdate::Insert(row) => print_row(row),
        MessageUpdate::Delete(channel_id) => println!("channel {channel_id} was deleted"),
        MessageUpdate::Failed(reason) => eprintln!("sync failed: {reason}"),
    }
}
