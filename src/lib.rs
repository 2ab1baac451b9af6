pub mod crypto;
mod error;
pub mod services;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use error::{Result, TorlineError};
pub use services::chat_types::{
    ConnectionInfo, DeliveryState, GroupDescriptor, GroupMember, InboundEvent, PeerAddress,
    SendSummary, StatusUpdate,
};
pub use services::{Messenger, MessengerConfig, PeerDirectory};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Run a messenger node until Ctrl-C.
///
/// Writes a default config file on first run, then logs connection info,
/// delivery updates and incoming messages.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(MessengerConfig::default_path);
    if !path.exists() {
        MessengerConfig::default().save(&path)?;
        log::info!("Wrote default configuration to {}", path.display());
    }
    let config = MessengerConfig::load(Some(&path))?;
    let retention = config.settled_retention();

    let mut messenger = Messenger::start(config).await?;

    let info = messenger.connection_info();
    log::info!(
        "Share with contacts: user_id={} address={} public_key={}",
        info.user_id,
        info.onion_address,
        info.public_key
    );

    messenger.add_status_observer(Arc::new(|update: &StatusUpdate| match &update.detail {
        Some(detail) => log::info!(
            "Status {} -> {} ({})",
            update.message_id,
            update.state,
            detail
        ),
        None => log::info!("Status {} -> {}", update.message_id, update.state),
    }));
    let mut inbox = messenger.subscribe_messages();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);

    loop {
        tokio::select! {
            Some(event) = inbox.recv() => log_event(&event),
            _ = prune.tick() => {
                if let Some(keep) = retention {
                    messenger.tracker().prune_settled(chrono::Utc::now() - keep);
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    log::info!("Shutting down");
    messenger.close().await;
    Ok(())
}

fn log_event(event: &InboundEvent) {
    match event {
        InboundEvent::Direct {
            sender_id, message, ..
        } => log::info!("[{}] {}", sender_id, message),
        InboundEvent::GroupMessage {
            sender_id,
            group_id,
            message,
            ..
        } => log::info!("[{} @ {}] {}", sender_id, group_id, message),
        InboundEvent::GroupInvitation {
            sender_id,
            group_id,
            group_name,
            members,
            ..
        } => log::info!(
            "{} invited you to '{}' ({}, {} members)",
            sender_id,
            group_name,
            group_id,
            members.len()
        ),
    }
}
