//! Messenger: wires identity, transport, receiver and dispatcher together.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::chat_server::{ChatServer, InboundReceiver, MessageObserver};
use super::chat_types::{
    ConnectionInfo, DeliveryState, GroupDescriptor, GroupMember, InboundEvent, PeerAddress,
    SendSummary, StatusUpdate,
};
use super::config::MessengerConfig;
use super::delivery_tracker::{DeliveryTracker, StatusObserver};
use super::dispatcher::{Dispatcher, DispatcherConfig, Submission};
use super::group_fanout::GroupFanout;
use super::tor_service::TorService;
use crate::crypto::cipher::MessageCipher;
use crate::crypto::identity::{Identity, IdentityManager};
use crate::crypto::key_store::KeyStore;
use crate::error::{Result, TorlineError};

/// Read-only contact lookup supplied by the application.
#[cfg_attr(test, mockall::automock)]
pub trait PeerDirectory: Send + Sync {
    fn get_peer(&self, peer_id: &str) -> Option<PeerAddress>;
}

pub struct Messenger {
    user_id: String,
    identity: Arc<Identity>,
    self_address: String,
    tracker: Arc<DeliveryTracker>,
    receiver: Arc<InboundReceiver>,
    dispatcher: Arc<Dispatcher>,
    fanout: GroupFanout,
    server: ChatServer,
    tor: Option<TorService>,
}

impl Messenger {
    /// Load the identity, bring up the listener and (optionally) Tor, then
    /// start the send pool.
    ///
    /// The listener is bound before Tor launches so the hidden service can
    /// forward to the real local port.
    pub async fn start(config: MessengerConfig) -> Result<Self> {
        config.validate()?;
        let user_id = config.identity.user_id.clone();

        let key_store = KeyStore::new(&config.data_dir())?;
        let identity =
            Arc::new(IdentityManager::load_or_create(&key_store, &user_id)?.into_identity());
        let cipher = MessageCipher::new(identity.clone());
        log::info!(
            "Identity for {} loaded (public key {})",
            user_id,
            identity.public_key_hex()
        );

        let receiver = Arc::new(InboundReceiver::new(cipher.clone()));
        let mut server = ChatServer::new(&config.server.bind_addr, config.server.port)?;
        let local_addr = server.start(receiver.clone()).await?;

        let (tor, self_address, socks_proxy) = if config.tor.enabled {
            let mut tor = TorService::new(config.tor.clone(), local_addr.port());
            match tor.start().await {
                Ok(onion) => {
                    let proxy = tor.socks_proxy_url();
                    (Some(tor), onion, Some(proxy))
                }
                Err(e) => {
                    log::error!("Failed to start Tor: {}", e);
                    server.stop();
                    return Err(e);
                }
            }
        } else {
            log::warn!("Tor disabled; sending directly without anonymization");
            (None, local_addr.to_string(), None)
        };

        let tracker = Arc::new(DeliveryTracker::new());
        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: config.dispatch.workers,
                queue_capacity: config.dispatch.queue_capacity,
                request_timeout: config.request_timeout(),
                default_port: config.dispatch.default_port,
                max_message_size: config.dispatch.max_message_size,
                socks_proxy,
                sender_id: user_id.clone(),
            },
            cipher,
            tracker.clone(),
        );
        let dispatcher = match dispatcher {
            Ok(d) => Arc::new(d),
            Err(e) => {
                server.stop();
                if let Some(mut tor) = tor {
                    tor.stop().await;
                }
                return Err(e);
            }
        };
        let fanout = GroupFanout::new(dispatcher.clone(), tracker.clone(), &user_id);

        log::info!("Messenger for {} ready at {}", user_id, self_address);

        Ok(Self {
            user_id,
            identity,
            self_address,
            tracker,
            receiver,
            dispatcher,
            fanout,
            server,
            tor,
        })
    }

    /// What a contact needs to reach us.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            onion_address: self.self_address.clone(),
            public_key: self.identity.public_key_hex(),
            user_id: self.user_id.clone(),
        }
    }

    pub fn send_message(
        &self,
        recipient_address: &str,
        recipient_public_key: &str,
        message: &str,
        message_id: Option<&str>,
    ) -> Submission {
        self.dispatcher
            .submit(recipient_address, recipient_public_key, message, message_id)
    }

    /// Look up `peer_id` in `directory` and send to it.
    pub fn send_to_peer(
        &self,
        directory: &dyn PeerDirectory,
        peer_id: &str,
        message: &str,
    ) -> Result<Submission> {
        let peer = directory
            .get_peer(peer_id)
            .ok_or_else(|| TorlineError::NetworkFailure(format!("Unknown peer {}", peer_id)))?;
        Ok(self.send_message(&peer.onion_address, &peer.public_key, message, None))
    }

    pub fn send_group_message(
        &self,
        group_id: &str,
        members: &[GroupMember],
        message: &str,
        message_id: Option<&str>,
    ) -> SendSummary {
        self.fanout
            .send_group_message(group_id, members, message, message_id)
    }

    pub fn send_group_invitation(
        &self,
        group: &GroupDescriptor,
        members: &[GroupMember],
    ) -> SendSummary {
        self.fanout.send_group_invitation(group, members)
    }

    pub fn get_message_status(&self, message_id: &str) -> Option<DeliveryState> {
        self.tracker.get_state(message_id)
    }

    pub fn mark_as_read(&self, message_id: &str) -> bool {
        self.tracker.mark_read(message_id)
    }

    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<StatusUpdate> {
        self.tracker.subscribe_channel()
    }

    pub fn add_status_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.tracker.subscribe(observer);
    }

    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<InboundEvent> {
        self.receiver.subscribe_channel()
    }

    pub fn add_message_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.receiver.subscribe(observer);
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Stop accepting sends, stop listening and terminate Tor.
    ///
    /// In-flight sends are not awaited.
    pub async fn close(&mut self) {
        self.dispatcher.shutdown();
        self.server.stop();
        if let Some(tor) = self.tor.as_mut() {
            tor.stop().await;
        }
        log::info!("Messenger for {} closed", self.user_id);
    }
}

/// Resolve member ids through `directory`. Unknown ids are kept with no
/// connection info so fan-out skips them.
pub fn members_from_directory(
    directory: &dyn PeerDirectory,
    member_ids: &[String],
) -> Vec<GroupMember> {
    member_ids
        .iter()
        .map(|id| match directory.get_peer(id) {
            Some(peer) => GroupMember {
                user_id: id.clone(),
                onion_address: Some(peer.onion_address),
                public_key: Some(peer.public_key),
            },
            None => GroupMember {
                user_id: id.clone(),
                onion_address: None,
                public_key: None,
            },
        })
        .collect()
}
