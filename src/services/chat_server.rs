//! Inbound chat server: warp HTTP server behind the hidden service.
//!
//! bind_with_graceful_shutdown + oneshot channel. Decrypted messages are
//! demultiplexed into `InboundEvent`s and handed to every message observer.

use chrono::Utc;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use warp::http::StatusCode;
use warp::Filter;

use super::chat_types::{from_unix, GroupEnvelope, InboundEvent, ReceiveRequest, ReceiveResponse};
use crate::crypto::cipher::MessageCipher;
use crate::error::{Result, TorlineError};

/// Receives every successfully decrypted inbound message.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, event: &InboundEvent);

    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> MessageObserver for F
where
    F: Fn(&InboundEvent) + Send + Sync,
{
    fn on_message(&self, event: &InboundEvent) {
        self(event)
    }
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl MessageObserver for ChannelObserver {
    fn on_message(&self, event: &InboundEvent) {
        let _ = self.tx.send(event.clone());
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Decrypts and demultiplexes `POST /receive` bodies.
pub struct InboundReceiver {
    cipher: MessageCipher,
    observers: RwLock<Vec<Arc<dyn MessageObserver>>>,
}

impl InboundReceiver {
    pub fn new(cipher: MessageCipher) -> Self {
        Self {
            cipher,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn MessageObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.retain(|o| !o.is_closed());
        observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<InboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(ChannelObserver { tx }));
        rx
    }

    /// Handle one inbound request body.
    ///
    /// Undecryptable input is answered with 400 and never reaches observers.
    pub fn handle_inbound(&self, request: &ReceiveRequest) -> (StatusCode, ReceiveResponse) {
        if request.sender_public_key.is_empty() || request.encrypted_message.is_empty() {
            log::warn!("Rejected inbound message with missing fields");
            return (
                StatusCode::BAD_REQUEST,
                ReceiveResponse::error("Missing sender_public_key or encrypted_message"),
            );
        }

        let plaintext = match self
            .cipher
            .decrypt(&request.encrypted_message, &request.sender_public_key)
        {
            Ok(p) => p,
            Err(e) => {
                log::error!("Error processing received message: {}", e);
                return (StatusCode::BAD_REQUEST, ReceiveResponse::error(e.to_string()));
            }
        };

        let event = demux(request, plaintext);
        match &event {
            InboundEvent::Direct { sender_id, .. } => {
                log::info!("Direct message received from {}", sender_id)
            }
            InboundEvent::GroupMessage {
                sender_id, group_id, ..
            } => log::info!("Group message for {} received from {}", group_id, sender_id),
            InboundEvent::GroupInvitation {
                sender_id,
                group_name,
                ..
            } => log::info!("Group invitation '{}' received from {}", group_name, sender_id),
        }

        let mut any_closed = false;
        {
            let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
            for observer in observers.iter() {
                if observer.is_closed() {
                    any_closed = true;
                    continue;
                }
                observer.on_message(&event);
            }
        }
        if any_closed {
            self.observers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|o| !o.is_closed());
        }
        (StatusCode::OK, ReceiveResponse::success())
    }
}

/// Try the structured group form first, else treat the whole plaintext as a
/// direct message.
fn demux(request: &ReceiveRequest, plaintext: String) -> InboundEvent {
    let or_request_sender = |id: String| {
        if id.is_empty() {
            request.sender_id.clone()
        } else {
            id
        }
    };

    match serde_json::from_str::<GroupEnvelope>(&plaintext) {
        Ok(GroupEnvelope::GroupInvitation {
            group_id,
            sender_id,
            group_name,
            description,
            created_by,
            members,
            avatar_path,
            timestamp,
            ..
        }) => {
            let sender_id = or_request_sender(sender_id);
            let created_by = if created_by.is_empty() {
                sender_id.clone()
            } else {
                created_by
            };
            InboundEvent::GroupInvitation {
                sender_id,
                group_id,
                group_name,
                description,
                created_by,
                members,
                avatar_path,
                timestamp: from_unix(timestamp),
            }
        }
        Ok(GroupEnvelope::GroupMessage {
            group_id,
            sender_id,
            content,
            timestamp,
            message_id,
        }) => {
            let message = match content {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            InboundEvent::GroupMessage {
                sender_id: or_request_sender(sender_id),
                group_id,
                message,
                message_id,
                timestamp: from_unix(timestamp),
            }
        }
        Err(_) => InboundEvent::Direct {
            sender_id: request.sender_id.clone(),
            message: plaintext,
            sender_public_key: request.sender_public_key.clone(),
            timestamp: Utc::now(),
        },
    }
}

/// HTTP listener wrapping an `InboundReceiver`.
pub struct ChatServer {
    bind_addr: IpAddr,
    port: u16,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ChatServer {
    pub fn new(bind_addr: &str, port: u16) -> Result<Self> {
        let bind_addr: IpAddr = bind_addr.parse().map_err(|e| {
            TorlineError::ConfigError(format!("Invalid bind address '{}': {}", bind_addr, e))
        })?;
        Ok(Self {
            bind_addr,
            port,
            local_addr: None,
            shutdown_tx: None,
        })
    }

    /// Bind and spawn the server. Returns the address actually bound.
    pub async fn start(&mut self, receiver: Arc<InboundReceiver>) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }

        // POST /receive
        let receive_route = warp::path!("receive")
            .and(warp::post())
            .and(warp::body::content_length_limit(1024 * 1024))
            .and(warp::body::json())
            .and(warp::any().map(move || receiver.clone()))
            .and_then(handle_receive);

        // GET /health
        let health_route = warp::path!("health")
            .and(warp::get())
            .map(|| warp::reply::json(&serde_json::json!({"status": "ok"})));

        let routes = receive_route
            .or(health_route)
            .recover(handle_rejection)
            .with(warp::log("torline::chat_server"));

        let (tx, rx) = tokio::sync::oneshot::channel();

        let (addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown((self.bind_addr, self.port), async {
                rx.await.ok();
            })
            .map_err(|e| {
                TorlineError::ServerError(format!(
                    "Failed to bind {}:{}: {}",
                    self.bind_addr, self.port, e
                ))
            })?;

        tokio::spawn(server);
        self.shutdown_tx = Some(tx);
        self.local_addr = Some(addr);
        log::info!("Chat server listening on {}", addr);
        Ok(addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            self.local_addr = None;
            log::info!("Chat server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

// ── Handlers ───────────────────────────────────────────────────

async fn handle_receive(
    request: ReceiveRequest,
    receiver: Arc<InboundReceiver>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let (status, body) = receiver.handle_inbound(&request);
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

async fn handle_rejection(
    err: warp::Rejection,
) -> std::result::Result<impl warp::Reply, std::convert::Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large".to_string())
    } else {
        (StatusCode::BAD_REQUEST, "Bad Request".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&ReceiveResponse::error(message)),
        status,
    ))
}
