//! Outbound send pool.
//!
//! A bounded channel feeds a fixed set of worker tasks. Each job is exactly
//! one attempt: encrypt, POST through the proxy, record the outcome. There is
//! no retry; a failed send stays failed.

use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::chat_types::{DeliveryState, ReceiveRequest};
use super::delivery_tracker::DeliveryTracker;
use crate::crypto::cipher::MessageCipher;
use crate::error::{Result, TorlineError};

/// Dispatcher tuning, usually built from `DispatchSettings`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub default_port: u16,
    pub max_message_size: usize,
    /// e.g. `socks5h://127.0.0.1:9050`; `None` connects directly.
    pub socks_proxy: Option<String>,
    /// Our logical user id, sent alongside every message.
    pub sender_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 64,
            request_timeout: Duration::from_secs(60),
            default_port: 5000,
            max_message_size: 64 * 1024,
            socks_proxy: None,
            sender_id: String::new(),
        }
    }
}

/// Result of handing a message to the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub message_id: String,
    pub accepted: bool,
}

struct SendJob {
    message_id: String,
    recipient_address: String,
    recipient_public_key: String,
    plaintext: String,
}

struct WorkerContext {
    client: reqwest::Client,
    cipher: MessageCipher,
    tracker: Arc<DeliveryTracker>,
    sender_id: String,
    default_port: u16,
}

pub struct Dispatcher {
    tx: Mutex<Option<mpsc::Sender<SendJob>>>,
    tracker: Arc<DeliveryTracker>,
    max_message_size: usize,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Build the HTTP client and spawn the worker tasks.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start(
        config: DispatcherConfig,
        cipher: MessageCipher,
        tracker: Arc<DeliveryTracker>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout);
        builder = match &config.socks_proxy {
            Some(proxy_url) => builder.proxy(
                reqwest::Proxy::all(proxy_url)
                    .map_err(|e| TorlineError::NetworkFailure(format!("Proxy config: {}", e)))?,
            ),
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| TorlineError::NetworkFailure(format!("HTTP client: {}", e)))?;

        let ctx = Arc::new(WorkerContext {
            client,
            cipher,
            tracker: tracker.clone(),
            sender_id: config.sender_id.clone(),
            default_port: config.default_port,
        });

        let (tx, rx) = mpsc::channel::<SendJob>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..config.workers.max(1))
            .map(|idx| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                tokio::spawn(run_worker(idx, rx, ctx))
            })
            .collect();

        log::info!(
            "Dispatcher started: {} workers, queue capacity {}, proxy {}",
            config.workers,
            config.queue_capacity,
            config.socks_proxy.as_deref().unwrap_or("none")
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            tracker,
            max_message_size: config.max_message_size,
            workers,
        })
    }

    /// Queue one send. Returns whether the pool accepted it.
    pub fn submit_send(
        &self,
        recipient_address: &str,
        recipient_public_key: &str,
        plaintext: &str,
        message_id: Option<&str>,
    ) -> bool {
        self.submit(recipient_address, recipient_public_key, plaintext, message_id)
            .accepted
    }

    /// Like `submit_send`, but also reports the id the message is tracked under.
    ///
    /// The message is registered and moved to `sending` before anything is
    /// queued, so observers see it immediately.
    pub fn submit(
        &self,
        recipient_address: &str,
        recipient_public_key: &str,
        plaintext: &str,
        message_id: Option<&str>,
    ) -> Submission {
        let message_id = message_id
            .map(str::to_string)
            .unwrap_or_else(|| generate_message_id(plaintext));

        if !self
            .tracker
            .register(&message_id, recipient_address, plaintext)
        {
            return Submission {
                message_id,
                accepted: false,
            };
        }
        self.tracker
            .transition(&message_id, DeliveryState::Sending, None);
        log::info!("Queueing message {} for {}", message_id, recipient_address);

        if plaintext.len() > self.max_message_size {
            self.reject(
                &message_id,
                format!(
                    "Message too large: {} bytes (max {})",
                    plaintext.len(),
                    self.max_message_size
                ),
            );
            return Submission {
                message_id,
                accepted: false,
            };
        }

        let job = SendJob {
            message_id: message_id.clone(),
            recipient_address: recipient_address.to_string(),
            recipient_public_key: recipient_public_key.to_string(),
            plaintext: plaintext.to_string(),
        };

        let sent = {
            let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(tx) => tx.try_send(job).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => "Dispatch queue full",
                    mpsc::error::TrySendError::Closed(_) => "Dispatcher is shut down",
                }),
                None => Err("Dispatcher is shut down"),
            }
        };

        match sent {
            Ok(()) => Submission {
                message_id,
                accepted: true,
            },
            Err(reason) => {
                self.reject(&message_id, reason.to_string());
                Submission {
                    message_id,
                    accepted: false,
                }
            }
        }
    }

    fn reject(&self, message_id: &str, reason: String) {
        log::error!("Error queueing message {}: {}", message_id, reason);
        self.tracker
            .transition(message_id, DeliveryState::Error, Some(reason));
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    /// Stop accepting work without waiting for in-flight sends.
    ///
    /// Jobs already queued still drain; nothing is cancelled.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if tx.is_some() {
            log::info!(
                "Dispatcher shutting down ({} workers draining)",
                self.workers.iter().filter(|w| !w.is_finished()).count()
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

async fn run_worker(
    idx: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SendJob>>>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match job {
            Some(job) => ctx.deliver(job).await,
            None => break,
        }
    }
    log::debug!("Dispatch worker {} exited", idx);
}

impl WorkerContext {
    async fn deliver(&self, job: SendJob) {
        let message_id = job.message_id.as_str();
        let address = normalize_address(&job.recipient_address, self.default_port);

        let encrypted_message = match self
            .cipher
            .encrypt(&job.plaintext, &job.recipient_public_key)
        {
            Ok(ct) => ct,
            Err(e) => {
                log::error!("Encryption for {} failed: {}", message_id, e);
                self.tracker
                    .transition(message_id, DeliveryState::Error, Some(e.to_string()));
                return;
            }
        };

        let payload = ReceiveRequest {
            sender_public_key: self.cipher.public_key_hex(),
            encrypted_message,
            sender_id: self.sender_id.clone(),
        };
        let url = format!("http://{}/receive", address);

        // "sent" means the attempt is going out, not that it was acknowledged.
        self.tracker
            .transition(message_id, DeliveryState::Sent, None);
        log::info!("Sending message {} to {}", message_id, url);

        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                log::info!("Message {} delivered successfully", message_id);
                self.tracker
                    .transition(message_id, DeliveryState::Delivered, None);
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                log::error!(
                    "Error sending message {}: HTTP {} - {}",
                    message_id,
                    status.as_u16(),
                    body
                );
                self.tracker.transition(
                    message_id,
                    DeliveryState::Failed,
                    Some(format!("HTTP {}", status.as_u16())),
                );
            }
            Err(e) => {
                let state = classify_error(&e);
                match state {
                    DeliveryState::Timeout => log::error!(
                        "Timeout connecting to {}. Tor connection may be slow or the address is unreachable.",
                        address
                    ),
                    DeliveryState::ConnectionError => log::error!(
                        "Connection error for {}: {}. Check that the recipient is online.",
                        address,
                        e
                    ),
                    _ => log::error!("Error sending message {}: {:?}", message_id, e),
                }
                self.tracker
                    .transition(message_id, state, Some(e.to_string()));
            }
        }
    }
}

fn classify_error(e: &reqwest::Error) -> DeliveryState {
    if e.is_timeout() {
        DeliveryState::Timeout
    } else if e.is_connect() {
        DeliveryState::ConnectionError
    } else {
        DeliveryState::Error
    }
}

/// Strip a literal `http://` prefix and append `default_port` when absent.
pub fn normalize_address(address: &str, default_port: u16) -> String {
    let trimmed = address.trim();
    let stripped = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    let stripped = stripped.trim_end_matches('/');
    if stripped.contains(':') {
        stripped.to_string()
    } else {
        format!("{}:{}", stripped, default_port)
    }
}

/// `msg_<unix seconds>_<content hash>_<random>`. The random tail keeps
/// repeated text within one second apart.
pub fn generate_message_id(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "msg_{}_{}_{}",
        chrono::Utc::now().timestamp(),
        hex::encode(&digest[..8]),
        &nonce[..8]
    )
}
