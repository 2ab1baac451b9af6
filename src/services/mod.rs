// Service layer: transport, dispatch and inbound handling for the messenger

pub mod chat_server;
pub mod chat_types;
pub mod config;
pub mod delivery_tracker;
pub mod dispatcher;
pub mod group_fanout;
pub mod messenger;
pub mod tor_service;

pub use chat_server::{ChatServer, InboundReceiver, MessageObserver};
pub use config::MessengerConfig;
pub use delivery_tracker::{DeliveryTracker, StatusObserver};
pub use dispatcher::{Dispatcher, DispatcherConfig, Submission};
pub use group_fanout::GroupFanout;
pub use messenger::{members_from_directory, Messenger, PeerDirectory};
pub use tor_service::TorService;
